//! Configuration loading and validation.
//!
//! [`CrewConfig`] is read from TOML; every field has a default so an empty
//! file (or no file) is a valid configuration. Validation catches policy
//! violations and suspicious values before a run starts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sandbox::{DockerConfig, Language, ResourceLimits, DEFAULT_OUTPUT_LIMIT};

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

/// Control-loop budgets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    /// Maximum plan/write/execute/review cycles per run.
    #[serde(default = "default_iteration_ceiling")]
    pub iteration_ceiling: u32,
    /// REJECTED and NEEDS_REVISION verdicts a run may absorb before a
    /// rejection becomes final.
    #[serde(default = "default_revision_budget")]
    pub revision_budget: u32,
    /// Re-run the planner after every REJECTED verdict, not only plan-level ones.
    #[serde(default)]
    pub replan_on_rejection: bool,
    /// Where run records are written. No records when unset.
    #[serde(default)]
    pub logs_dir: Option<PathBuf>,
}

fn default_iteration_ceiling() -> u32 {
    3
}

fn default_revision_budget() -> u32 {
    2
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            iteration_ceiling: default_iteration_ceiling(),
            revision_budget: default_revision_budget(),
            replan_on_rejection: false,
            logs_dir: None,
        }
    }
}

/// Which isolation substrate backs the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubstrateKind {
    #[default]
    Docker,
    Process,
}

/// Sandbox settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub substrate: SubstrateKind,
    #[serde(default)]
    pub limits: ResourceLimits,
    /// Cap on captured bytes per output stream.
    #[serde(default = "default_output_limit")]
    pub output_limit_bytes: usize,
    /// Language assumed when the writer's code block has no tag.
    #[serde(default)]
    pub default_language: Language,
    /// Accept substrates without full isolation. Development only.
    #[serde(default)]
    pub permit_degraded_isolation: bool,
    /// Parent directory for scratch directories.
    #[serde(default)]
    pub scratch_root: Option<PathBuf>,
    #[serde(default)]
    pub docker: DockerConfig,
}

fn default_output_limit() -> usize {
    DEFAULT_OUTPUT_LIMIT
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            substrate: SubstrateKind::default(),
            limits: ResourceLimits::default(),
            output_limit_bytes: default_output_limit(),
            default_language: Language::default(),
            permit_degraded_isolation: false,
            scratch_root: None,
            docker: DockerConfig::default(),
        }
    }
}

/// LLM CLI settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_cli")]
    pub cli_path: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_llm_cli() -> String {
    "claude".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    300
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            cli_path: default_llm_cli(),
            model: None,
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

/// Repository publishing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Local clone to publish from. Defaults to the working directory.
    #[serde(default)]
    pub repo_path: Option<PathBuf>,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// Repository-relative path the approved code is written to.
    #[serde(default = "default_file_path")]
    pub file_path: PathBuf,
    /// Push the branch and open a PR. When false, only a local commit is made.
    #[serde(default = "default_push")]
    pub push: bool,
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_branch_prefix() -> String {
    "auto/".to_string()
}

fn default_file_path() -> PathBuf {
    PathBuf::from("generated_code.py")
}

fn default_push() -> bool {
    true
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            repo_path: None,
            base_branch: default_base_branch(),
            branch_prefix: default_branch_prefix(),
            file_path: default_file_path(),
            push: default_push(),
        }
    }
}

/// Notification settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Default recipient when the task names none.
    #[serde(default)]
    pub recipient: Option<String>,
    /// Mailer command receiving the message on stdin, e.g. `["sendmail", "-t"]`.
    /// Notifications are only logged when unset.
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

/// Complete configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrewConfig {
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl CrewConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        toml::from_str(toml).map_err(|e| Error::Config(format!("invalid config: {}", e)))
    }

    /// Reads and parses a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::ConfigRead {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    /// Reads the file at `path` if given, otherwise returns defaults, then
    /// validates. Warnings are logged.
    pub fn load_validated(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        for warning in config.validate().into_result()? {
            tracing::warn!(warning = %warning, "configuration warning");
        }
        Ok(config)
    }
}

impl Validate for OrchestrationConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.iteration_ceiling == 0 {
            result.add_error("iteration_ceiling must be at least 1");
        }

        if self.iteration_ceiling > 10 {
            result.add_warning("iteration_ceiling > 10 may lead to excessive LLM calls");
        }

        if self.revision_budget == 0 {
            result.add_warning("revision_budget = 0 means the first rejection ends the run");
        }

        if self.revision_budget > self.iteration_ceiling {
            result.add_warning(format!(
                "revision_budget ({}) exceeds iteration_ceiling ({}); the ceiling will end runs first",
                self.revision_budget, self.iteration_ceiling
            ));
        }

        result
    }
}

impl Validate for SandboxConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = self.limits.validate();

        if self.output_limit_bytes < 1024 {
            result.add_warning("output_limit_bytes under 1 KiB hides most execution output");
        }

        if self.substrate == SubstrateKind::Process && !self.permit_degraded_isolation {
            result.add_error(
                "process substrate lacks network isolation; set permit_degraded_isolation for trusted use",
            );
        }

        if self.docker.cli_path.trim().is_empty() && self.substrate == SubstrateKind::Docker {
            result.add_error("docker.cli_path cannot be empty");
        }

        result
    }
}

impl Validate for LlmConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.cli_path.trim().is_empty() {
            result.add_error("llm.cli_path cannot be empty");
        }

        if self.timeout_secs == 0 {
            result.add_error("llm.timeout_secs must be greater than zero");
        } else if self.timeout_secs < 10 {
            result.add_warning("llm.timeout_secs under 10 seconds may cause premature failures");
        }

        result
    }
}

impl Validate for PublishConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.base_branch.trim().is_empty() {
            result.add_error("publish.base_branch cannot be empty");
        }

        if self.file_path.is_absolute()
            || self
                .file_path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            result.add_error(format!(
                "publish.file_path '{}' must stay inside the repository",
                self.file_path.display()
            ));
        }

        if self.branch_prefix.contains(' ') {
            result.add_error("publish.branch_prefix cannot contain spaces");
        }

        result
    }
}

impl Validate for NotifyConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if let Some(command) = &self.command {
            if command.is_empty() || command[0].trim().is_empty() {
                result.add_error("notify.command must name a program");
            }
            if self.recipient.is_none() {
                result.add_warning(
                    "notify.command set without a default recipient; tasks must name one",
                );
            }
        }

        result
    }
}

impl Validate for CrewConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        result.merge(self.orchestration.validate());
        result.merge(self.sandbox.validate());
        result.merge(self.llm.validate());
        result.merge(self.publish.validate());
        result.merge(self.notify.validate());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_is_valid() {
        let config = CrewConfig::default();
        let result = config.validate();
        assert!(result.is_valid(), "{:?}", result.errors);
        assert_eq!(config.orchestration.iteration_ceiling, 3);
        assert_eq!(config.orchestration.revision_budget, 2);
        assert_eq!(config.sandbox.substrate, SubstrateKind::Docker);
        assert_eq!(config.llm.cli_path, "claude");
        assert_eq!(config.publish.base_branch, "main");
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let config = CrewConfig::from_toml_str("").unwrap();
        assert_eq!(config.orchestration, OrchestrationConfig::default());
        assert_eq!(config.sandbox.output_limit_bytes, DEFAULT_OUTPUT_LIMIT);
    }

    #[test]
    fn toml_sections_override_defaults() {
        let toml = r#"
            [orchestration]
            iteration_ceiling = 5
            replan_on_rejection = true

            [sandbox]
            substrate = "process"
            permit_degraded_isolation = true
            default_language = "shell"

            [sandbox.limits]
            memory_cap = 67108864
            wall_clock_timeout_ms = 1500

            [llm]
            model = "sonnet"

            [notify]
            recipient = "dev@example.com"
            command = ["sendmail", "-t"]
        "#;

        let config = CrewConfig::from_toml_str(toml).unwrap();

        assert_eq!(config.orchestration.iteration_ceiling, 5);
        assert_eq!(config.orchestration.revision_budget, 2);
        assert!(config.orchestration.replan_on_rejection);
        assert_eq!(config.sandbox.substrate, SubstrateKind::Process);
        assert_eq!(config.sandbox.default_language, Language::Shell);
        assert_eq!(config.sandbox.limits.memory_cap, 64 * 1024 * 1024);
        assert_eq!(
            config.sandbox.limits.wall_clock_timeout,
            Duration::from_millis(1500)
        );
        assert_eq!(config.llm.model.as_deref(), Some("sonnet"));
        assert_eq!(
            config.notify.command,
            Some(vec!["sendmail".to_string(), "-t".to_string()])
        );
        assert!(config.validate().is_valid());
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = CrewConfig::from_toml_str("[orchestration]\niteration_ceiling = \"x\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn load_reads_file_and_reports_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("crew.toml");
        std::fs::write(&path, "[llm]\ntimeout_secs = 60\n").unwrap();

        let config = CrewConfig::load(&path).unwrap();
        assert_eq!(config.llm.timeout(), Duration::from_secs(60));

        let err = CrewConfig::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }));
    }

    #[test]
    fn load_validated_rejects_policy_violations() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("crew.toml");
        std::fs::write(&path, "[sandbox.limits]\nnetwork_enabled = true\n").unwrap();

        let err = CrewConfig::load_validated(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("network_enabled"));
    }

    #[test]
    fn zero_ceiling_fails() {
        let config = OrchestrationConfig {
            iteration_ceiling: 0,
            ..Default::default()
        };
        let result = config.validate();
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.contains("iteration_ceiling")));
    }

    #[test]
    fn budget_above_ceiling_warns() {
        let config = OrchestrationConfig {
            iteration_ceiling: 2,
            revision_budget: 5,
            ..Default::default()
        };
        let result = config.validate();
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.contains("exceeds")));
    }

    #[test]
    fn process_substrate_requires_degraded_opt_in() {
        let mut config = SandboxConfig {
            substrate: SubstrateKind::Process,
            ..Default::default()
        };
        assert!(!config.validate().is_valid());

        config.permit_degraded_isolation = true;
        assert!(config.validate().is_valid());
    }

    #[test]
    fn publish_path_must_stay_in_repo() {
        for bad in ["/etc/passwd", "../outside.py"] {
            let config = PublishConfig {
                file_path: PathBuf::from(bad),
                ..Default::default()
            };
            assert!(!config.validate().is_valid(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn llm_zero_timeout_fails_and_short_warns() {
        let zero = LlmConfig {
            timeout_secs: 0,
            ..Default::default()
        };
        assert!(!zero.validate().is_valid());

        let short = LlmConfig {
            timeout_secs: 5,
            ..Default::default()
        };
        let result = short.validate();
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.contains("10 seconds")));
    }

    #[test]
    fn notify_command_must_name_program() {
        let config = NotifyConfig {
            recipient: None,
            command: Some(vec![]),
        };
        let result = config.validate();
        assert!(!result.is_valid());
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn validation_result_into_result_ok_on_valid() {
        let mut result = ValidationResult::default();
        result.add_warning("just a warning");
        let res = result.into_result();
        assert!(res.is_ok());
        assert_eq!(res.unwrap(), vec!["just a warning"]);
    }

    #[test]
    fn validation_result_into_result_err_on_invalid() {
        let mut result = ValidationResult::default();
        result.add_error("fatal error");
        result.add_warning("warning");
        let res = result.into_result();
        assert!(res.is_err());
    }
}

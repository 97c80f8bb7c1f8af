//! Docker-backed substrate.
//!
//! Each context is one named container started with no network, a hard
//! memory ceiling, all capabilities dropped, `no-new-privileges`, a read-only
//! root filesystem, and the scratch directory mounted read-only. Images are
//! pulled before the code's clock starts and `docker run` never pulls. Every
//! CLI call outside the run itself is bounded by `control_timeout`; the
//! container is killed on timeout and force-removed on teardown.

use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::process::Command;

use crate::error::ExecutionError;

use super::capture::OutputCapture;
use super::code::{CodeUnit, Language};
use super::limits::{millis, ResourceLimits};
use super::process::scratch_dir;
use super::substrate::{
    ExitState, IsolatedContext, IsolationSubstrate, RawOutcome, SubstrateCapabilities,
};

/// `docker run` exits with 125 when the daemon could not start the container,
/// 126 when the command cannot be invoked and 127 when it is not found.
const DOCKER_LAUNCH_FAILURES: [i32; 3] = [125, 126, 127];

/// Mount point of the scratch directory inside the container.
const CODE_MOUNT: &str = "/code";

/// Configuration for the Docker substrate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Path to the docker CLI.
    #[serde(default = "default_docker_cli")]
    pub cli_path: String,
    /// Image for Python code.
    #[serde(default = "default_python_image")]
    pub python_image: String,
    /// Image for shell scripts.
    #[serde(default = "default_shell_image")]
    pub shell_image: String,
    /// User the code runs as inside the container.
    #[serde(default = "default_user")]
    pub user: String,
    /// Maximum number of processes inside the container.
    #[serde(default = "default_pids_limit")]
    pub pids_limit: u32,
    /// Bound on daemon checks, inspections, kills and removals.
    #[serde(
        default = "default_control_timeout",
        rename = "control_timeout_ms",
        with = "millis"
    )]
    pub control_timeout: Duration,
    /// Bound on pulling a missing image.
    #[serde(
        default = "default_pull_timeout",
        rename = "pull_timeout_ms",
        with = "millis"
    )]
    pub pull_timeout: Duration,
}

fn default_docker_cli() -> String {
    "docker".to_string()
}

fn default_python_image() -> String {
    "python:3.10-slim".to_string()
}

fn default_shell_image() -> String {
    "alpine:3.19".to_string()
}

fn default_user() -> String {
    "65534:65534".to_string()
}

fn default_pids_limit() -> u32 {
    64
}

fn default_control_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_pull_timeout() -> Duration {
    Duration::from_secs(300)
}

impl DockerConfig {
    /// Image that runs `language`.
    pub fn image_for(&self, language: Language) -> &str {
        match language {
            Language::Python => &self.python_image,
            Language::Shell => &self.shell_image,
        }
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            cli_path: default_docker_cli(),
            python_image: default_python_image(),
            shell_image: default_shell_image(),
            user: default_user(),
            pids_limit: default_pids_limit(),
            control_timeout: default_control_timeout(),
            pull_timeout: default_pull_timeout(),
        }
    }
}

/// Runs the docker CLI with `args`, killing it if it outlives `limit`.
async fn docker(cli: &str, args: &[&str], limit: Duration) -> Result<Output, String> {
    let output = Command::new(cli)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(limit, output).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(format!("failed to run {}: {}", cli, e)),
        Err(_) => Err(format!(
            "{} {} did not answer within {} ms",
            cli,
            args.first().copied().unwrap_or_default(),
            limit.as_millis()
        )),
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// Substrate that runs each execution in a fresh container.
#[derive(Debug, Clone, Default)]
pub struct DockerSubstrate {
    config: DockerConfig,
    scratch_root: Option<PathBuf>,
    /// Images known to be present locally.
    present: Arc<Mutex<HashSet<String>>>,
}

impl DockerSubstrate {
    pub fn new(config: DockerConfig) -> Self {
        Self {
            config,
            scratch_root: None,
            present: Arc::default(),
        }
    }

    /// Creates scratch directories under `root`.
    pub fn with_scratch_root(mut self, root: PathBuf) -> Self {
        self.scratch_root = Some(root);
        self
    }

    fn is_present(&self, image: &str) -> bool {
        match self.present.lock() {
            Ok(present) => present.contains(image),
            Err(poisoned) => poisoned.into_inner().contains(image),
        }
    }

    fn mark_present(&self, image: &str) {
        let mut present = match self.present.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        present.insert(image.to_string());
    }

    async fn check_daemon(&self) -> Result<(), ExecutionError> {
        let output = docker(
            &self.config.cli_path,
            &["version", "--format", "{{.Server.Version}}"],
            self.config.control_timeout,
        )
        .await
        .map_err(ExecutionError::LaunchFailure)?;

        if !output.status.success() {
            return Err(ExecutionError::LaunchFailure(format!(
                "docker daemon unavailable: {}",
                stderr_of(&output)
            )));
        }
        Ok(())
    }

    /// Pulls `image` unless it is already present.
    async fn ensure_image(&self, image: &str) -> Result<(), ExecutionError> {
        let cli = self.config.cli_path.as_str();
        let inspected = docker(
            cli,
            &["image", "inspect", "--format", "{{.Id}}", image],
            self.config.control_timeout,
        )
        .await;
        if matches!(&inspected, Ok(output) if output.status.success()) {
            return Ok(());
        }

        tracing::info!(image = %image, "pulling sandbox image");
        let output = docker(cli, &["pull", image], self.config.pull_timeout)
            .await
            .map_err(|e| {
                ExecutionError::LaunchFailure(format!("failed to pull {}: {}", image, e))
            })?;

        if !output.status.success() {
            return Err(ExecutionError::LaunchFailure(format!(
                "failed to pull {}: {}",
                image,
                stderr_of(&output)
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl IsolationSubstrate for DockerSubstrate {
    async fn prepare(&self, language: Language) -> Result<(), ExecutionError> {
        let image = self.config.image_for(language);
        if image.trim().is_empty() {
            return Err(ExecutionError::LaunchFailure(format!(
                "no image configured for {}",
                language
            )));
        }
        if self.is_present(image) {
            return Ok(());
        }

        self.ensure_image(image).await?;
        self.mark_present(image);
        Ok(())
    }

    async fn create(
        &self,
        limits: &ResourceLimits,
    ) -> Result<Box<dyn IsolatedContext>, ExecutionError> {
        self.check_daemon().await?;

        let scratch = scratch_dir(self.scratch_root.as_ref())?;
        // The container user must be able to traverse the read-only mount.
        std::fs::set_permissions(scratch.path(), std::fs::Permissions::from_mode(0o755))
            .map_err(|e| {
                ExecutionError::LaunchFailure(format!("failed to open scratch dir: {}", e))
            })?;

        let name = format!("agent-crew-{}", uuid::Uuid::new_v4().simple());
        tracing::debug!(container = %name, "reserved sandbox container");

        Ok(Box::new(DockerContext {
            name,
            config: self.config.clone(),
            limits: limits.clone(),
            scratch: Some(scratch),
            started: false,
            capture: OutputCapture::new(),
        }))
    }

    fn capabilities(&self) -> SubstrateCapabilities {
        SubstrateCapabilities::full()
    }

    fn name(&self) -> &str {
        "docker"
    }
}

/// Maps the exit status of `docker run` to how the code ended.
fn exit_state(code: Option<i32>, stderr: &str) -> Result<ExitState, ExecutionError> {
    match code {
        Some(code) if DOCKER_LAUNCH_FAILURES.contains(&code) => {
            Err(ExecutionError::LaunchFailure(format!(
                "docker could not start the code (exit {}): {}",
                code,
                stderr.trim()
            )))
        }
        // Docker reports death by signal N as 128 + N.
        Some(code) if code > 128 && code <= 128 + 64 => Ok(ExitState::Signaled(code - 128)),
        Some(code) => Ok(ExitState::Exited(code)),
        None => Ok(ExitState::Signaled(0)),
    }
}

/// One named container and its scratch directory.
pub struct DockerContext {
    name: String,
    config: DockerConfig,
    limits: ResourceLimits,
    scratch: Option<TempDir>,
    started: bool,
    capture: OutputCapture,
}

impl DockerContext {
    /// Builds the `docker run` arguments for `code`.
    fn run_args(&self, code: &CodeUnit, scratch: &Path) -> Result<Vec<String>, ExecutionError> {
        let image = self.config.image_for(code.language);
        if image.trim().is_empty() {
            return Err(ExecutionError::LaunchFailure(format!(
                "no image configured for {}",
                code.language
            )));
        }
        let memory = self.limits.memory_cap.to_string();

        Ok(vec![
            "run".to_string(),
            "--name".to_string(),
            self.name.clone(),
            "--pull".to_string(),
            "never".to_string(),
            "--network".to_string(),
            "none".to_string(),
            "--memory".to_string(),
            memory.clone(),
            // Equal to --memory, so the container gets no swap.
            "--memory-swap".to_string(),
            memory,
            "--pids-limit".to_string(),
            self.config.pids_limit.to_string(),
            "--security-opt".to_string(),
            "no-new-privileges".to_string(),
            "--cap-drop".to_string(),
            "ALL".to_string(),
            "--read-only".to_string(),
            "--tmpfs".to_string(),
            "/tmp:rw,size=16m".to_string(),
            "--user".to_string(),
            self.config.user.clone(),
            "--volume".to_string(),
            format!("{}:{}:ro", scratch.display(), CODE_MOUNT),
            "--workdir".to_string(),
            CODE_MOUNT.to_string(),
            image.to_string(),
            code.language.interpreter().to_string(),
            format!("{}/{}", CODE_MOUNT, code.language.script_name()),
        ])
    }

    async fn oom_killed(&self) -> bool {
        docker(
            &self.config.cli_path,
            &["inspect", "--format", "{{.State.OOMKilled}}", &self.name],
            self.config.control_timeout,
        )
        .await
        .map(|out| String::from_utf8_lossy(&out.stdout).trim() == "true")
        .unwrap_or(false)
    }

    async fn remove_container(&self) -> Result<(), ExecutionError> {
        let output = docker(
            &self.config.cli_path,
            &["rm", "--force", &self.name],
            self.config.control_timeout,
        )
        .await
        .map_err(ExecutionError::Teardown)?;

        let stderr = stderr_of(&output);
        if !output.status.success() && !stderr.contains("No such container") {
            return Err(ExecutionError::Teardown(format!(
                "docker rm {} failed: {}",
                self.name, stderr
            )));
        }
        Ok(())
    }

    fn remove_scratch(&mut self) -> Result<(), ExecutionError> {
        if let Some(scratch) = self.scratch.take() {
            scratch.close().map_err(|e| {
                ExecutionError::Teardown(format!("failed to remove scratch dir: {}", e))
            })?;
        }
        Ok(())
    }

    fn docker_sync(&self, args: &[&str]) -> std::io::Result<std::process::Output> {
        std::process::Command::new(&self.config.cli_path)
            .args(args)
            .stdin(Stdio::null())
            .output()
    }
}

#[async_trait]
impl IsolatedContext for DockerContext {
    fn id(&self) -> &str {
        &self.name
    }

    async fn run(&mut self, code: &CodeUnit) -> Result<RawOutcome, ExecutionError> {
        let scratch = self
            .scratch
            .as_ref()
            .map(|dir| dir.path().to_path_buf())
            .ok_or_else(|| ExecutionError::LaunchFailure("context already destroyed".into()))?;

        let script = scratch.join(code.language.script_name());
        std::fs::write(&script, &code.source).map_err(|e| {
            ExecutionError::LaunchFailure(format!("failed to write script: {}", e))
        })?;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o644)).map_err(
            |e| ExecutionError::LaunchFailure(format!("failed to open script: {}", e)),
        )?;

        let args = self.run_args(code, &scratch)?;
        self.started = true;
        self.capture = OutputCapture::new();

        let mut child = Command::new(&self.config.cli_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutionError::LaunchFailure(format!("failed to run docker: {}", e)))?;
        let readers = self.capture.attach(&mut child);

        let status = child.wait().await.map_err(|e| {
            ExecutionError::Teardown(format!("failed to wait for docker run: {}", e))
        })?;
        for reader in readers {
            let _ = reader.await;
        }

        let (stdout, stderr) = self.capture.snapshot();
        let exit = exit_state(status.code(), &stderr)?;
        let memory_exceeded = exit != ExitState::Exited(0) && self.oom_killed().await;

        Ok(RawOutcome {
            stdout,
            stderr,
            exit,
            memory_exceeded,
        })
    }

    fn terminate(&mut self) {
        if !self.started {
            return;
        }
        match self.docker_sync(&["kill", &self.name]) {
            Ok(out) if out.status.success() => {
                tracing::debug!(container = %self.name, "killed sandbox container");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, container = %self.name, "failed to kill sandbox container");
            }
        }
    }

    fn destroy(&mut self) -> Result<(), ExecutionError> {
        if self.scratch.is_none() {
            return Ok(());
        }

        if self.started {
            let output = self
                .docker_sync(&["rm", "--force", &self.name])
                .map_err(|e| ExecutionError::Teardown(format!("failed to run docker rm: {}", e)))?;

            let stderr = stderr_of(&output);
            if !output.status.success() && !stderr.contains("No such container") {
                return Err(ExecutionError::Teardown(format!(
                    "docker rm {} failed: {}",
                    self.name, stderr
                )));
            }
        }

        self.remove_scratch()
    }

    fn is_destroyed(&self) -> bool {
        self.scratch.is_none()
    }

    fn partial_output(&self) -> (String, String) {
        self.capture.snapshot()
    }

    async fn stop(&mut self) {
        if !self.started {
            return;
        }
        match docker(
            &self.config.cli_path,
            &["kill", &self.name],
            self.config.control_timeout,
        )
        .await
        {
            Ok(out) if out.status.success() => {
                tracing::debug!(container = %self.name, "killed sandbox container");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, container = %self.name, "failed to kill sandbox container");
            }
        }
    }

    /// Force-removes the container, then the scratch directory. The scratch
    /// directory goes even if the daemon does not answer in time.
    async fn shutdown(&mut self) -> Result<(), ExecutionError> {
        if self.scratch.is_none() {
            return Ok(());
        }

        let removed = if self.started {
            self.remove_container().await
        } else {
            Ok(())
        };
        let scratch = self.remove_scratch();
        removed.and(scratch)
    }
}

impl Drop for DockerContext {
    fn drop(&mut self) {
        if !self.is_destroyed() {
            self.terminate();
            if let Err(e) = self.destroy() {
                tracing::error!(error = %e, container = %self.name, "failed to cleanup container on drop");
            }
        }
    }
}

//! LLM client that shells out to a CLI in non-interactive mode.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::LlmConfig;
use crate::error::LlmError;

use super::LlmClient;

/// Client for Claude Code style CLIs (`<cli> --print -p <prompt>`).
pub struct CliLlm {
    /// Path to the CLI binary.
    cli_path: String,
    /// Model to use (e.g., "sonnet", "haiku", "opus").
    model: Option<String>,
    /// Hard limit per completion.
    timeout: Duration,
    /// Working directory for the CLI process.
    working_dir: Option<PathBuf>,
}

impl Default for CliLlm {
    fn default() -> Self {
        Self::from_config(&LlmConfig::default())
    }
}

impl CliLlm {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            cli_path: config.cli_path.clone(),
            model: config.model.clone(),
            timeout: config.timeout(),
            working_dir: None,
        }
    }

    /// Creates a client with a custom CLI path.
    pub fn with_cli_path(mut self, cli_path: impl Into<String>) -> Self {
        self.cli_path = cli_path.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    /// Builds the command arguments for one completion.
    fn build_args(&self, prompt: &str) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "text".to_string(),
        ];

        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        args.push("-p".to_string());
        args.push(prompt.to_string());

        args
    }
}

/// Prepends retrieved context excerpts to the prompt.
fn render_prompt(prompt: &str, context: &[String]) -> String {
    if context.is_empty() {
        return prompt.to_string();
    }

    let mut rendered = String::from("Relevant context from earlier work:\n");
    for excerpt in context {
        rendered.push_str("- ");
        rendered.push_str(excerpt.trim());
        rendered.push('\n');
    }
    rendered.push('\n');
    rendered.push_str(prompt);
    rendered
}

#[async_trait]
impl LlmClient for CliLlm {
    async fn complete(&self, prompt: &str, context: &[String]) -> Result<String, LlmError> {
        let args = self.build_args(&render_prompt(prompt, context));

        tracing::debug!(
            cli = %self.cli_path,
            model = ?self.model,
            prompt_chars = prompt.len(),
            context_excerpts = context.len(),
            "invoking LLM CLI"
        );

        let mut command = Command::new(&self.cli_path);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| {
            LlmError::Unavailable(format!("failed to spawn {}: {}", self.cli_path, e))
        })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| {
                LlmError::Unavailable(format!("failed to wait for {}: {}", self.cli_path, e))
            })?,
            Err(_) => {
                return Err(LlmError::Unavailable(format!(
                    "{} timed out after {:?}",
                    self.cli_path, self.timeout
                )))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LlmError::Unavailable(format!(
                "{} exited with {}: {}",
                self.cli_path,
                output.status,
                stderr.trim()
            )));
        }

        let reply = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if reply.is_empty() {
            return Err(LlmError::EmptyReply);
        }

        tracing::debug!(reply_chars = reply.len(), "LLM CLI replied");
        Ok(reply)
    }

    fn name(&self) -> &str {
        &self.cli_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn fake_cli(dir: &TempDir, body: &str) -> String {
        let path = dir.path().join("fake-llm");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    #[test]
    fn builds_basic_args() {
        let client = CliLlm::default();
        let args = client.build_args("test prompt");

        assert!(args.contains(&"--print".to_string()));
        assert_eq!(args.last().unwrap(), "test prompt");
        assert!(!args.contains(&"--model".to_string()));
    }

    #[test]
    fn includes_model_in_args() {
        let client = CliLlm::default().with_model("haiku");
        let args = client.build_args("test");

        assert!(args.contains(&"--model".to_string()));
        assert!(args.contains(&"haiku".to_string()));
    }

    #[test]
    fn context_is_prepended_to_prompt() {
        let rendered = render_prompt("Write code.", &["past plan ".to_string()]);
        assert!(rendered.starts_with("Relevant context from earlier work:\n- past plan\n"));
        assert!(rendered.ends_with("Write code."));

        assert_eq!(render_prompt("Write code.", &[]), "Write code.");
    }

    #[tokio::test]
    async fn returns_trimmed_stdout() {
        let dir = TempDir::new().unwrap();
        let client = CliLlm::default().with_cli_path(fake_cli(&dir, "echo '  hello  '"));

        assert_eq!(client.complete("hi", &[]).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn non_zero_exit_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let client =
            CliLlm::default().with_cli_path(fake_cli(&dir, "echo 'rate limited' >&2; exit 2"));

        let err = client.complete("hi", &[]).await.unwrap_err();
        assert!(matches!(err, LlmError::Unavailable(_)));
        assert!(err.to_string().contains("rate limited"));
    }

    #[tokio::test]
    async fn empty_reply_is_an_error() {
        let dir = TempDir::new().unwrap();
        let client = CliLlm::default().with_cli_path(fake_cli(&dir, "exit 0"));

        let err = client.complete("hi", &[]).await.unwrap_err();
        assert!(matches!(err, LlmError::EmptyReply));
    }

    #[tokio::test]
    async fn slow_cli_times_out() {
        let dir = TempDir::new().unwrap();
        let client = CliLlm::default()
            .with_cli_path(fake_cli(&dir, "sleep 5"))
            .with_timeout(Duration::from_millis(200));

        let err = client.complete("hi", &[]).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn missing_cli_is_unavailable() {
        let client = CliLlm::default().with_cli_path("/nonexistent/llm-cli");
        let err = client.complete("hi", &[]).await.unwrap_err();
        assert!(matches!(err, LlmError::Unavailable(_)));
    }

    #[tokio::test]
    #[ignore] // Requires the claude CLI
    async fn claude_cli_answers() {
        let client = CliLlm::default().with_model("haiku");
        let reply = client.complete("Reply with the single word: pong", &[]).await.unwrap();
        assert!(reply.to_lowercase().contains("pong"));
    }
}

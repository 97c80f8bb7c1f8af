//! Notification channels.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::NotifyError;

use super::{Ack, NotificationChannel, OutcomeSummary};

/// Channel that only logs the summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    async fn notify(&self, summary: &OutcomeSummary) -> Result<Ack, NotifyError> {
        tracing::info!(
            run_id = %summary.run_id,
            status = ?summary.status,
            recipient = ?summary.recipient,
            subject = %summary.subject,
            "run outcome"
        );
        Ok(Ack {
            channel: "log".to_string(),
            detail: summary.subject.clone(),
        })
    }
}

/// Channel that pipes an RFC 822 style message to a mailer command.
///
/// The command receives `To`, `Subject` headers and the body on stdin, the
/// format `sendmail -t` expects.
#[derive(Debug, Clone)]
pub struct CommandChannel {
    program: String,
    args: Vec<String>,
    default_recipient: Option<String>,
}

impl CommandChannel {
    /// Creates a channel from a command line. Returns `None` for an empty command.
    pub fn new(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            default_recipient: None,
        })
    }

    /// Recipient used when the summary names none.
    pub fn with_default_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.default_recipient = Some(recipient.into());
        self
    }

    fn render(recipient: &str, summary: &OutcomeSummary) -> String {
        format!(
            "To: {}\nSubject: {}\nContent-Type: text/markdown; charset=utf-8\n\n{}\n",
            recipient, summary.subject, summary.body
        )
    }
}

#[async_trait]
impl NotificationChannel for CommandChannel {
    async fn notify(&self, summary: &OutcomeSummary) -> Result<Ack, NotifyError> {
        let recipient = summary
            .recipient
            .as_deref()
            .or(self.default_recipient.as_deref())
            .ok_or_else(|| NotifyError::Rejected("no recipient".to_string()))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                NotifyError::Unavailable(format!("failed to spawn {}: {}", self.program, e))
            })?;

        let message = Self::render(recipient, summary);
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(message.as_bytes()).await.map_err(|e| {
                NotifyError::Unavailable(format!("failed to write message: {}", e))
            })?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| NotifyError::Unavailable(format!("failed to wait for mailer: {}", e)))?;

        if !output.status.success() {
            return Err(NotifyError::Rejected(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        tracing::debug!(program = %self.program, recipient = %recipient, "notification handed to mailer");

        Ok(Ack {
            channel: self.program.clone(),
            detail: format!("delivered to {}", recipient),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::RunStatus;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn summary(recipient: Option<&str>) -> OutcomeSummary {
        OutcomeSummary {
            run_id: Uuid::new_v4(),
            status: RunStatus::Completed,
            recipient: recipient.map(str::to_string),
            subject: "Task completed".to_string(),
            body: "PR: https://github.com/o/r/pull/1".to_string(),
        }
    }

    #[tokio::test]
    async fn log_channel_always_acks() {
        let ack = LogChannel.notify(&summary(None)).await.unwrap();
        assert_eq!(ack.channel, "log");
        assert_eq!(ack.detail, "Task completed");
    }

    #[test]
    fn empty_command_is_none() {
        assert!(CommandChannel::new(&[]).is_none());
    }

    #[tokio::test]
    async fn command_channel_pipes_message() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("mail.txt");
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("cat > {}", out.display()),
        ];
        let channel = CommandChannel::new(&command).unwrap();

        let ack = channel.notify(&summary(Some("dev@example.com"))).await.unwrap();

        assert_eq!(ack.detail, "delivered to dev@example.com");
        let mail = std::fs::read_to_string(&out).unwrap();
        assert!(mail.starts_with("To: dev@example.com\nSubject: Task completed\n"));
        assert!(mail.contains("pull/1"));
    }

    #[tokio::test]
    async fn command_channel_uses_default_recipient() {
        let command = vec!["cat".to_string()];
        let channel = CommandChannel::new(&command)
            .unwrap()
            .with_default_recipient("ops@example.com");

        let ack = channel.notify(&summary(None)).await.unwrap();
        assert_eq!(ack.detail, "delivered to ops@example.com");
    }

    #[tokio::test]
    async fn command_channel_errors() {
        let no_recipient = CommandChannel::new(&["cat".to_string()]).unwrap();
        assert!(matches!(
            no_recipient.notify(&summary(None)).await,
            Err(NotifyError::Rejected(_))
        ));

        let failing = CommandChannel::new(&[
            "sh".to_string(),
            "-c".to_string(),
            "cat > /dev/null; exit 1".to_string(),
        ])
        .unwrap();
        assert!(matches!(
            failing.notify(&summary(Some("a@b.c"))).await,
            Err(NotifyError::Rejected(_))
        ));

        let missing = CommandChannel::new(&["/nonexistent/mailer".to_string()]).unwrap();
        assert!(matches!(
            missing.notify(&summary(Some("a@b.c"))).await,
            Err(NotifyError::Unavailable(_))
        ));
    }
}

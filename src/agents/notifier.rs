//! Best-effort delivery of the outcome summary.

use std::sync::Arc;

use crate::collaborators::{NotificationChannel, OutcomeSummary};
use crate::transcript::{NotificationRecord, Role, Transcript, Turn, TurnPayload};

/// Delivers the outcome summary. Best-effort.
pub struct Notifier {
    channel: Arc<dyn NotificationChannel>,
}

impl Notifier {
    pub fn new(channel: Arc<dyn NotificationChannel>) -> Self {
        Self { channel }
    }

    /// Sends `summary`. Failures are recorded in the turn, never returned.
    pub async fn produce_turn(&self, summary: &OutcomeSummary, transcript: &Transcript) -> Turn {
        let record = match self.channel.notify(summary).await {
            Ok(ack) => {
                tracing::info!(channel = %ack.channel, status = ?summary.status, "notification delivered");
                NotificationRecord::Delivered { ack }
            }
            Err(e) => {
                tracing::warn!(error = %e, status = ?summary.status, "notification failed");
                NotificationRecord::Failed {
                    error: e.to_string(),
                }
            }
        };
        transcript.next_turn(Role::Notifier, TurnPayload::Notification(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NotifyError;
    use crate::orchestrator::RunStatus;
    use crate::test_support::RecordingChannel;
    use uuid::Uuid;

    fn summary() -> OutcomeSummary {
        OutcomeSummary {
            run_id: Uuid::nil(),
            status: RunStatus::Rejected,
            recipient: Some("dev@example.com".to_string()),
            subject: "rejected".to_string(),
            body: "body".to_string(),
        }
    }

    #[tokio::test]
    async fn delivery_is_recorded() {
        let channel = Arc::new(RecordingChannel::new());
        let notifier = Notifier::new(channel.clone());

        let turn = notifier.produce_turn(&summary(), &Transcript::new()).await;

        assert_eq!(turn.role, Role::Notifier);
        assert!(matches!(
            turn.payload,
            TurnPayload::Notification(NotificationRecord::Delivered { .. })
        ));
        assert_eq!(channel.delivered().len(), 1);
    }

    #[tokio::test]
    async fn failure_is_recorded_not_raised() {
        let channel = Arc::new(RecordingChannel::failing(NotifyError::Unavailable(
            "smtp down".into(),
        )));
        let notifier = Notifier::new(channel);

        let turn = notifier.produce_turn(&summary(), &Transcript::new()).await;

        assert_eq!(
            turn.payload,
            TurnPayload::Notification(NotificationRecord::Failed {
                error: "notification channel unavailable: smtp down".to_string()
            })
        );
    }
}

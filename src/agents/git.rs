//! Publication of approved code.
//!
//! The agent cannot be called without an [`Approval`], so unapproved code has
//! no way onto a branch.

use std::sync::Arc;

use uuid::Uuid;

use crate::collaborators::{ChangeSet, RepositoryPublisher};
use crate::report;
use crate::strategy::Approval;
use crate::transcript::{PublishRecord, Role, Turn, TurnPayload};

use super::TurnContext;

/// Longest task slug used in branch names.
const MAX_SLUG_LEN: usize = 40;

/// Publishes approved code. Requires an [`Approval`].
pub struct GitAgent {
    publisher: Arc<dyn RepositoryPublisher>,
    branch_prefix: String,
}

impl GitAgent {
    pub fn new(publisher: Arc<dyn RepositoryPublisher>) -> Self {
        Self {
            publisher,
            branch_prefix: "auto/".to_string(),
        }
    }

    pub fn with_branch_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.branch_prefix = prefix.into();
        self
    }

    /// Publishes the code the approval covers. Failures are recorded in the
    /// turn, never returned.
    pub async fn produce_turn(
        &self,
        approval: &Approval,
        ctx: &TurnContext<'_>,
        run_id: Uuid,
    ) -> Turn {
        let record = self.publish(approval, ctx, run_id).await;
        ctx.transcript
            .next_turn(Role::GitAgent, TurnPayload::Publication(record))
    }

    async fn publish(
        &self,
        approval: &Approval,
        ctx: &TurnContext<'_>,
        run_id: Uuid,
    ) -> PublishRecord {
        let approved_code = ctx
            .transcript
            .turns()
            .get(..=approval.verdict_index())
            .and_then(|turns| {
                turns.iter().rev().find_map(|t| match &t.payload {
                    TurnPayload::Code(code) => Some(code.clone()),
                    _ => None,
                })
            });

        let Some(code) = approved_code else {
            tracing::warn!("approval covers no code, nothing to publish");
            return PublishRecord::Failed {
                error: "no approved code in transcript".to_string(),
            };
        };

        let change = ChangeSet {
            code,
            branch_name: branch_name(&self.branch_prefix, &ctx.task.description, run_id),
            title: report::pull_request_title(ctx.task),
            body: report::pull_request_body(ctx.task, ctx.transcript, approval),
        };

        match self.publisher.publish(&change).await {
            Ok(artifact) => {
                tracing::info!(
                    branch = %artifact.branch,
                    url = ?artifact.url,
                    "published approved change"
                );
                PublishRecord::Published { artifact }
            }
            Err(e) => {
                tracing::warn!(error = %e, branch = %change.branch_name, "publish failed");
                PublishRecord::Failed {
                    error: e.to_string(),
                }
            }
        }
    }
}

/// `<prefix><task-slug>-<run id prefix>`, safe as a git ref.
pub fn branch_name(prefix: &str, description: &str, run_id: Uuid) -> String {
    let mut slug = String::new();
    for c in description.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
    }
    let slug = slug.trim_end_matches('-');
    let slug = if slug.is_empty() { "task" } else { slug };

    let id = run_id.simple().to_string();
    format!("{}{}-{}", prefix, slug, &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PublishError;
    use crate::sandbox::{CodeUnit, Language};
    use crate::strategy::{Counters, RunState, TerminationStrategy};
    use crate::test_support::RecordingPublisher;
    use crate::transcript::{Task, Transcript, Verdict};

    fn approved_transcript() -> (Transcript, Approval) {
        let mut transcript = Transcript::new();
        for (role, payload) in [
            (Role::Planner, TurnPayload::Plan("1. print".into())),
            (
                Role::Writer,
                TurnPayload::Code(CodeUnit::new(Language::Python, "print(3)\n")),
            ),
            (Role::Reviewer, TurnPayload::Verdict(Verdict::approved("ok"))),
        ] {
            let turn = transcript.next_turn(role, payload);
            transcript.append(turn).unwrap();
        }
        let counters = Counters::from_transcript(&transcript);
        match TerminationStrategy::default().evaluate(&transcript, &counters) {
            RunState::Approved(approval) => (transcript, approval),
            other => panic!("expected approval, got {:?}", other),
        }
    }

    #[test]
    fn branch_names_are_slugged() {
        let id = Uuid::nil();
        assert_eq!(
            branch_name("auto/", "Add two numbers!", id),
            "auto/add-two-numbers-00000000"
        );
        assert_eq!(branch_name("auto/", "???", id), "auto/task-00000000");

        let long = branch_name("", &"word ".repeat(50), id);
        assert!(long.len() <= MAX_SLUG_LEN + 9);
        assert!(!long.contains("--"));
    }

    #[tokio::test]
    async fn publishes_approved_code() {
        let publisher = Arc::new(RecordingPublisher::new());
        let agent = GitAgent::new(publisher.clone()).with_branch_prefix("bot/");
        let (transcript, approval) = approved_transcript();
        let task = Task::new("print three");

        let turn = agent
            .produce_turn(&approval, &TurnContext::new(&task, &transcript), Uuid::nil())
            .await;

        assert_eq!(turn.role, Role::GitAgent);
        assert_eq!(turn.index, 3);
        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].code.source, "print(3)\n");
        assert!(published[0].branch_name.starts_with("bot/print-three-"));
        assert!(matches!(
            turn.payload,
            TurnPayload::Publication(PublishRecord::Published { .. })
        ));
    }

    #[tokio::test]
    async fn publish_failure_is_recorded() {
        let publisher = Arc::new(RecordingPublisher::failing(PublishError::Rejected(
            "protected".into(),
        )));
        let agent = GitAgent::new(publisher);
        let (transcript, approval) = approved_transcript();
        let task = Task::new("x");

        let turn = agent
            .produce_turn(&approval, &TurnContext::new(&task, &transcript), Uuid::nil())
            .await;

        assert_eq!(
            turn.payload,
            TurnPayload::Publication(PublishRecord::Failed {
                error: "publish rejected: protected".to_string()
            })
        );
    }
}

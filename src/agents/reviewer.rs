//! Reviewer role and parsing of its JSON verdict.

use std::sync::Arc;

use crate::collaborators::LlmClient;
use crate::error::AgentError;
use crate::prompt::{parse_review_response, ReviewPromptBuilder};
use crate::sandbox::{ExecutionResult, TerminationReason};
use crate::transcript::{Role, Turn, TurnPayload, Verdict, VerdictKind};

use super::TurnContext;

/// Judges the latest code by its execution result.
pub struct Reviewer {
    llm: Arc<dyn LlmClient>,
}

impl Reviewer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn produce_turn(&self, ctx: &TurnContext<'_>) -> Result<Turn, AgentError> {
        let transcript = ctx.transcript;
        let code = transcript.latest_code().ok_or(AgentError::MissingInput {
            role: Role::Reviewer,
            expected: "code",
        })?;
        let execution = transcript
            .latest_execution()
            .ok_or(AgentError::MissingInput {
                role: Role::Reviewer,
                expected: "execution result",
            })?;

        let mut builder = ReviewPromptBuilder::new(&ctx.task.description, code, execution);
        if let Some(plan) = transcript.latest_plan() {
            builder = builder.with_plan(plan);
        }

        let reply = self
            .llm
            .complete(&builder.build(), &[])
            .await
            .map_err(|e| e.for_role(Role::Reviewer))?;

        let verdict = match parse_review_response(&reply) {
            Some(verdict) => verdict,
            None => {
                tracing::warn!(reply_chars = reply.len(), "could not parse reviewer reply");
                Verdict::needs_revision(format!(
                    "reviewer reply could not be parsed: {}",
                    reply.chars().take(200).collect::<String>()
                ))
            }
        };
        let verdict = withhold_unearned_approval(verdict, execution);

        tracing::info!(verdict = ?verdict.kind, scope = ?verdict.scope, "review complete");

        Ok(transcript.next_turn(Role::Reviewer, TurnPayload::Verdict(verdict)))
    }
}

/// Approval requires an execution that ran to completion.
fn withhold_unearned_approval(verdict: Verdict, execution: &ExecutionResult) -> Verdict {
    if verdict.kind != VerdictKind::Approved || execution.reason == TerminationReason::Completed {
        return verdict;
    }

    tracing::warn!(reason = ?execution.reason, "approval downgraded: execution did not complete");
    Verdict {
        kind: VerdictKind::NeedsRevision,
        rationale: format!(
            "approval withheld: execution ended with {:?}; reviewer said: {}",
            execution.reason, verdict.rationale
        ),
        scope: verdict.scope,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{CodeUnit, Language};
    use crate::test_support::{review_json, ScriptedLlm};
    use crate::transcript::{Task, Transcript, VerdictScope};
    use std::time::Duration;

    fn reviewed(reason: TerminationReason, exit_code: Option<i32>) -> Transcript {
        let mut transcript = Transcript::new();
        for (role, payload) in [
            (Role::Planner, TurnPayload::Plan("1. print".into())),
            (
                Role::Writer,
                TurnPayload::Code(CodeUnit::new(Language::Python, "print(3)\n")),
            ),
            (
                Role::Sanitizer,
                TurnPayload::Execution(ExecutionResult {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code,
                    duration: Duration::from_millis(5),
                    reason,
                }),
            ),
        ] {
            let turn = transcript.next_turn(role, payload);
            transcript.append(turn).unwrap();
        }
        transcript
    }

    async fn review(reply: &str, transcript: &Transcript) -> Verdict {
        let reviewer = Reviewer::new(Arc::new(ScriptedLlm::new().reviewer([reply])));
        let task = Task::new("print 3");
        let turn = reviewer
            .produce_turn(&TurnContext::new(&task, transcript))
            .await
            .unwrap();
        turn.verdict().cloned().unwrap()
    }

    #[tokio::test]
    async fn approval_of_completed_run_stands() {
        let transcript = reviewed(TerminationReason::Completed, Some(0));
        let verdict = review(&review_json("APPROVED", "prints 3"), &transcript).await;

        assert_eq!(verdict.kind, VerdictKind::Approved);
        assert_eq!(verdict.rationale, "prints 3");
    }

    #[tokio::test]
    async fn approval_of_timed_out_run_is_downgraded() {
        let transcript = reviewed(TerminationReason::Timeout, None);
        let verdict = review(&review_json("APPROVED", "fine"), &transcript).await;

        assert_eq!(verdict.kind, VerdictKind::NeedsRevision);
        assert!(verdict.rationale.contains("Timeout"));
        assert!(verdict.rationale.contains("fine"));
    }

    #[tokio::test]
    async fn unparseable_reply_needs_revision() {
        let transcript = reviewed(TerminationReason::Completed, Some(0));
        let verdict = review("LGTM!", &transcript).await;

        assert_eq!(verdict.kind, VerdictKind::NeedsRevision);
        assert!(verdict.rationale.contains("LGTM!"));
    }

    #[tokio::test]
    async fn rejection_keeps_scope() {
        let transcript = reviewed(TerminationReason::Completed, Some(1));
        let verdict = review(
            r#"{"verdict": "REJECTED", "rationale": "wrong idea", "scope": "plan"}"#,
            &transcript,
        )
        .await;

        assert_eq!(verdict.kind, VerdictKind::Rejected);
        assert_eq!(verdict.scope, VerdictScope::Plan);
    }

    #[tokio::test]
    async fn missing_execution_is_missing_input() {
        let reviewer = Reviewer::new(Arc::new(ScriptedLlm::new()));
        let task = Task::new("x");
        let transcript = Transcript::new();

        let err = reviewer
            .produce_turn(&TurnContext::new(&task, &transcript))
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::MissingInput { role: Role::Reviewer, .. }));
    }
}

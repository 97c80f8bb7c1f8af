//! Markdown rendering of run outcomes and pull request text.

use crate::collaborators::OutcomeSummary;
use crate::orchestrator::{RunOutcome, RunStatus};
use crate::strategy::Approval;
use crate::transcript::{Role, Task, Transcript, TurnPayload};

/// Longest excerpt of stdout/stderr quoted in reports.
const OUTPUT_EXCERPT_CHARS: usize = 1500;

/// Longest task description used in a title.
const TITLE_CHARS: usize = 72;

/// Pull request title for an approved task.
pub fn pull_request_title(task: &Task) -> String {
    let first_line = task.description.lines().next().unwrap_or("").trim();
    let mut title: String = first_line.chars().take(TITLE_CHARS).collect();
    if first_line.chars().count() > TITLE_CHARS {
        title.push_str("...");
    }
    if title.is_empty() {
        title.push_str("generated change");
    }
    format!("[agent-crew] {}", title)
}

/// Pull request body: task, plan, approval, and execution evidence.
pub fn pull_request_body(task: &Task, transcript: &Transcript, approval: &Approval) -> String {
    let mut body = String::new();
    let approved = transcript
        .turns()
        .get(..=approval.verdict_index())
        .unwrap_or(transcript.turns());

    body.push_str("## Summary\n\n");
    body.push_str(&task.description);
    body.push_str("\n\n");

    if let Some(plan) = approved.iter().rev().find_map(|t| match &t.payload {
        TurnPayload::Plan(plan) => Some(plan),
        _ => None,
    }) {
        body.push_str("<details>\n");
        body.push_str("<summary>Plan</summary>\n\n");
        body.push_str(plan);
        body.push_str("\n\n</details>\n\n");
    }

    if let Some(verdict) = approved.last().and_then(|t| t.verdict()) {
        body.push_str("## Review\n\n");
        body.push_str(&format!("**Verdict:** {:?}\n\n", verdict.kind));
        body.push_str(&verdict.rationale);
        body.push_str("\n\n");
    }

    if let Some(result) = approved.iter().rev().find_map(|t| match &t.payload {
        TurnPayload::Execution(result) => Some(result),
        _ => None,
    }) {
        body.push_str("## Sandbox Run\n\n");
        body.push_str(&format!(
            "- **Exit code**: {}\n- **Duration**: {} ms\n\n",
            result
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            result.duration.as_millis()
        ));
        if !result.stdout.trim().is_empty() {
            body.push_str("```\n");
            body.push_str(&excerpt(&result.stdout));
            body.push_str("\n```\n\n");
        }
    }

    let cycles = approved.iter().filter(|t| t.verdict().is_some()).count();
    body.push_str(&format!("---\n\nApproved after {} review cycle(s).\n", cycles));
    body
}

/// One-line subject for a finished run.
pub fn subject(outcome: &RunOutcome) -> String {
    let task: String = outcome.task.description.chars().take(60).collect();
    match outcome.status {
        RunStatus::Completed => format!("[agent-crew] completed: {}", task),
        RunStatus::Rejected => format!("[agent-crew] rejected: {}", task),
        RunStatus::Aborted => format!("[agent-crew] aborted: {}", task),
        RunStatus::Failed => format!("[agent-crew] failed: {}", task),
    }
}

/// Markdown summary of a finished run.
pub fn outcome_markdown(outcome: &RunOutcome) -> String {
    let transcript = outcome.transcript();
    let mut md = String::new();

    md.push_str(&format!("## Run {}\n\n", outcome.run_id));
    md.push_str(&format!("- **Status**: {}\n", outcome.status));
    md.push_str(&format!("- **Task**: {}\n", outcome.task.description));
    md.push_str(&format!("- **Cycles**: {}\n", outcome.cycles()));
    md.push_str(&format!("- **Turns**: {}\n", transcript.len()));
    md.push_str(&format!("- **Duration**: {} ms\n\n", outcome.duration.as_millis()));

    if let Some(reason) = &outcome.abort_reason {
        md.push_str(&format!("**Aborted:** {}\n\n", reason));
    }
    if let Some(failure) = &outcome.failure {
        md.push_str(&format!("**Failure:** {}\n\n", failure));
    }

    if let Some(verdict) = transcript.latest_verdict() {
        md.push_str("### Final Verdict\n\n");
        md.push_str(&format!("**{:?}** ({:?} scope)\n\n", verdict.kind, verdict.scope));
        md.push_str(&verdict.rationale);
        md.push_str("\n\n");
    }

    if transcript.cycles_completed() > 1 {
        md.push_str("### Review History\n\n");
        md.push_str("| Cycle | Verdict | Rationale |\n");
        md.push_str("|-------|---------|-----------|\n");
        for (i, verdict) in transcript.verdicts().enumerate() {
            let rationale: String = verdict
                .rationale
                .replace('\n', " ")
                .replace('|', "\\|")
                .chars()
                .take(120)
                .collect();
            md.push_str(&format!("| {} | {:?} | {} |\n", i + 1, verdict.kind, rationale));
        }
        md.push('\n');
    }

    if let Some(result) = transcript.latest_execution() {
        md.push_str("### Last Execution\n\n");
        md.push_str(&format!(
            "- **Reason**: {:?}\n- **Exit code**: {}\n\n",
            result.reason,
            result
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string())
        ));
        let stderr = result.stderr_tail(OUTPUT_EXCERPT_CHARS);
        if !stderr.trim().is_empty() {
            md.push_str("```\n");
            md.push_str(&stderr);
            md.push_str("\n```\n\n");
        }
    }

    md.push_str("### Artifacts\n\n");
    match (&outcome.pull_request, &outcome.publish_error) {
        (Some(artifact), _) => {
            md.push_str(&format!("- **Branch**: `{}`\n", artifact.branch));
            if let Some(url) = &artifact.url {
                md.push_str(&format!("- **Pull request**: {}\n", url));
            }
        }
        (None, Some(error)) => md.push_str(&format!("- **Publish failed**: {}\n", error)),
        (None, None) => md.push_str("- nothing published\n"),
    }
    md.push('\n');

    if let Some(code) = transcript.latest_code() {
        if outcome.status != RunStatus::Completed {
            md.push_str("<details>\n<summary>Last code</summary>\n\n");
            md.push_str(&format!(
                "```{}\n{}\n```\n\n</details>\n",
                code.language,
                code.source.trim_end()
            ));
        }
    }

    md
}

/// Builds the summary handed to the notification channel.
pub fn outcome_summary(outcome: &RunOutcome, default_recipient: Option<&str>) -> OutcomeSummary {
    OutcomeSummary {
        run_id: outcome.run_id,
        status: outcome.status,
        recipient: outcome
            .task
            .recipient
            .clone()
            .or_else(|| default_recipient.map(str::to_string)),
        subject: subject(outcome),
        body: outcome_markdown(outcome),
    }
}

/// One letter per turn, for log lines.
pub fn role_sequence(transcript: &Transcript) -> String {
    transcript
        .turns()
        .iter()
        .map(|t| match t.role {
            Role::Planner => "P",
            Role::Writer => "W",
            Role::Sanitizer => "S",
            Role::Reviewer => "R",
            Role::GitAgent => "G",
            Role::Notifier => "N",
        })
        .collect()
}

fn excerpt(text: &str) -> String {
    let trimmed = text.trim_end();
    if trimmed.chars().count() <= OUTPUT_EXCERPT_CHARS {
        return trimmed.to_string();
    }
    let head: String = trimmed.chars().take(OUTPUT_EXCERPT_CHARS).collect();
    format!("{}\n... (truncated)", head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{CodeUnit, ExecutionResult, Language, TerminationReason};
    use crate::strategy::{Counters, RunState, TerminationStrategy};
    use crate::transcript::Verdict;
    use std::time::Duration;

    fn cycle(transcript: &mut Transcript, verdict: Verdict) {
        for (role, payload) in [
            (Role::Planner, TurnPayload::Plan("1. print three".into())),
            (
                Role::Writer,
                TurnPayload::Code(CodeUnit::new(Language::Python, "print(3)\n")),
            ),
            (
                Role::Sanitizer,
                TurnPayload::Execution(ExecutionResult {
                    stdout: "3\n".into(),
                    stderr: String::new(),
                    exit_code: Some(0),
                    duration: Duration::from_millis(12),
                    reason: TerminationReason::Completed,
                }),
            ),
            (Role::Reviewer, TurnPayload::Verdict(verdict)),
        ] {
            let turn = transcript.next_turn(role, payload);
            transcript.append(turn).unwrap();
        }
    }

    #[test]
    fn title_is_prefixed_and_truncated() {
        assert_eq!(
            pull_request_title(&Task::new("Print three\nmore detail")),
            "[agent-crew] Print three"
        );
        let long = pull_request_title(&Task::new("x".repeat(200)));
        assert!(long.ends_with("..."));
        assert_eq!(pull_request_title(&Task::new("  ")), "[agent-crew] generated change");
    }

    #[test]
    fn body_cites_approved_verdict_and_run() {
        let mut transcript = Transcript::new();
        cycle(&mut transcript, Verdict::needs_revision("add newline"));
        cycle(&mut transcript, Verdict::approved("prints 3 correctly"));
        let counters = Counters::from_transcript(&transcript);
        let RunState::Approved(approval) =
            TerminationStrategy::default().evaluate(&transcript, &counters)
        else {
            panic!("expected approval");
        };

        let body = pull_request_body(&Task::new("print three"), &transcript, &approval);

        assert!(body.contains("## Summary"));
        assert!(body.contains("print three"));
        assert!(body.contains("<summary>Plan</summary>"));
        assert!(body.contains("prints 3 correctly"));
        assert!(body.contains("- **Exit code**: 0"));
        assert!(body.contains("Approved after 2 review cycle(s)."));
    }

    #[test]
    fn role_sequence_abbreviates_roles() {
        let mut transcript = Transcript::new();
        cycle(&mut transcript, Verdict::approved("ok"));
        assert_eq!(role_sequence(&transcript), "PWSR");
    }

    #[test]
    fn excerpt_truncates_long_output() {
        let long = "a".repeat(OUTPUT_EXCERPT_CHARS + 10);
        assert!(excerpt(&long).ends_with("(truncated)"));
        assert_eq!(excerpt("short\n"), "short");
    }
}

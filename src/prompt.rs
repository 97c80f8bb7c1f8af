//! Prompt builders for the LLM-backed roles and parsing of their replies.

use crate::sandbox::{CodeUnit, ExecutionResult, Language};
use crate::transcript::{Verdict, VerdictKind, VerdictScope};

/// First line of every planner prompt.
pub const PLAN_HEADING: &str = "## Planning Request";
/// First line of every writer prompt.
pub const WRITE_HEADING: &str = "## Implementation Request";
/// First line of every reviewer prompt.
pub const REVIEW_HEADING: &str = "## Code Review Request";

/// Execution output shown to the reviewer is cut to this many characters per stream.
const REVIEW_OUTPUT_CHARS: usize = 4000;

/// Builder for planner prompts.
pub struct PlanPromptBuilder {
    task: String,
    feedback: Vec<String>,
}

impl PlanPromptBuilder {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            feedback: Vec::new(),
        }
    }

    /// Adds reviewer feedback from earlier cycles.
    pub fn with_feedback(mut self, feedback: Vec<String>) -> Self {
        self.feedback = feedback;
        self
    }

    pub fn build(&self) -> String {
        let mut prompt = String::new();

        prompt.push_str(PLAN_HEADING);
        prompt.push_str("\n\n");
        prompt.push_str("You are the planner of a small coding team. Break the task below into steps.\n");
        prompt.push_str("Respond with a concise, numbered list of actions and nothing else.\n\n");

        prompt.push_str("### Task\n\n");
        prompt.push_str(&self.task);
        prompt.push_str("\n\n");

        if !self.feedback.is_empty() {
            prompt.push_str("### Review Feedback on Earlier Attempts\n\n");
            for (i, item) in self.feedback.iter().enumerate() {
                prompt.push_str(&format!("{}. {}\n", i + 1, item));
            }
            prompt.push_str("\nRevise the plan so it addresses this feedback.\n");
        }

        prompt
    }
}

/// Builder for writer prompts.
pub struct WritePromptBuilder {
    task: String,
    plan: String,
    language: Language,
    revision: Option<String>,
    previous_code: Option<String>,
}

impl WritePromptBuilder {
    pub fn new(task: impl Into<String>, plan: impl Into<String>, language: Language) -> Self {
        Self {
            task: task.into(),
            plan: plan.into(),
            language,
            revision: None,
            previous_code: None,
        }
    }

    /// Sets the rationale of the verdict being addressed.
    pub fn with_revision(mut self, rationale: impl Into<String>) -> Self {
        self.revision = Some(rationale.into());
        self
    }

    /// Sets the code the revision applies to.
    pub fn with_previous_code(mut self, code: &CodeUnit) -> Self {
        self.previous_code = Some(code.source.clone());
        self
    }

    pub fn build(&self) -> String {
        let mut prompt = String::new();

        prompt.push_str(WRITE_HEADING);
        prompt.push_str("\n\n");
        prompt.push_str(&format!(
            "You are the writer of a small coding team. Write correct, clean {} code that follows the plan.\n",
            self.language
        ));
        prompt.push_str(&format!(
            "Reply with a single ```{} fenced code block and no explanation. The code runs without network access.\n\n",
            self.language
        ));

        prompt.push_str("### Task\n\n");
        prompt.push_str(&self.task);
        prompt.push_str("\n\n");

        prompt.push_str("### Plan\n\n");
        prompt.push_str(&self.plan);
        prompt.push_str("\n\n");

        if let Some(code) = &self.previous_code {
            prompt.push_str("### Previous Attempt\n\n");
            prompt.push_str(&format!("```{}\n", self.language));
            prompt.push_str(code.trim_end());
            prompt.push_str("\n```\n\n");
        }

        if let Some(revision) = &self.revision {
            prompt.push_str("### Reviewer Feedback to Address\n\n");
            prompt.push_str(revision);
            prompt.push_str("\n");
        }

        prompt
    }
}

/// Builder for reviewer prompts.
pub struct ReviewPromptBuilder<'a> {
    task: &'a str,
    plan: Option<&'a str>,
    code: &'a CodeUnit,
    execution: &'a ExecutionResult,
}

impl<'a> ReviewPromptBuilder<'a> {
    pub fn new(task: &'a str, code: &'a CodeUnit, execution: &'a ExecutionResult) -> Self {
        Self {
            task,
            plan: None,
            code,
            execution,
        }
    }

    pub fn with_plan(mut self, plan: &'a str) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn build(&self) -> String {
        let mut prompt = String::new();

        prompt.push_str(REVIEW_HEADING);
        prompt.push_str("\n\n");
        prompt.push_str("You are the reviewer of a small coding team. Judge whether the code below correctly and cleanly completes the task, using its sandboxed execution as evidence.\n\n");

        prompt.push_str("### Task\n\n");
        prompt.push_str(self.task);
        prompt.push_str("\n\n");

        if let Some(plan) = self.plan {
            prompt.push_str("### Plan\n\n");
            prompt.push_str(plan);
            prompt.push_str("\n\n");
        }

        prompt.push_str("### Code\n\n");
        prompt.push_str(&format!("```{}\n", self.code.language));
        prompt.push_str(self.code.source.trim_end());
        prompt.push_str("\n```\n\n");

        prompt.push_str("### Execution\n\n");
        prompt.push_str(&format!(
            "- termination: {:?}\n- exit code: {}\n- duration: {} ms\n\n",
            self.execution.reason,
            self.execution
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none (killed)".to_string()),
            self.execution.duration.as_millis()
        ));
        prompt.push_str("stdout:\n```\n");
        prompt.push_str(&tail(&self.execution.stdout, REVIEW_OUTPUT_CHARS));
        prompt.push_str("\n```\n\nstderr:\n```\n");
        prompt.push_str(&self.execution.stderr_tail(REVIEW_OUTPUT_CHARS));
        prompt.push_str("\n```\n\n");

        prompt.push_str("### Response Format\n\n");
        prompt.push_str("Respond with a JSON object:\n");
        prompt.push_str("```json\n");
        prompt.push_str("{\n");
        prompt.push_str("  \"verdict\": \"APPROVED\" | \"NEEDS_REVISION\" | \"REJECTED\",\n");
        prompt.push_str("  \"rationale\": \"why, and what to change\",\n");
        prompt.push_str("  \"scope\": \"code\" | \"plan\"\n");
        prompt.push_str("}\n");
        prompt.push_str("```\n");
        prompt.push_str("Use NEEDS_REVISION for fixable issues, REJECTED when the approach is wrong, and scope \"plan\" when the plan itself must change.\n");

        prompt
    }
}

/// Last `max_chars` characters of `text`.
fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max_chars)).collect()
}

/// Parses a reviewer reply into a verdict.
///
/// Returns `None` when the reply holds no JSON object with a known verdict.
pub fn parse_review_response(response: &str) -> Option<Verdict> {
    let json_start = response.find('{')?;
    let json_end = response.rfind('}')?;
    if json_end < json_start {
        return None;
    }
    let json_str = &response[json_start..=json_end];

    let parsed: serde_json::Value = serde_json::from_str(json_str).ok()?;

    let kind = match parsed
        .get("verdict")?
        .as_str()?
        .trim()
        .to_ascii_lowercase()
        .replace([' ', '-'], "_")
        .as_str()
    {
        "approved" | "approve" => VerdictKind::Approved,
        "rejected" | "reject" => VerdictKind::Rejected,
        "needs_revision" | "needs_changes" | "revise" => VerdictKind::NeedsRevision,
        _ => return None,
    };

    let rationale = parsed
        .get("rationale")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .trim()
        .to_string();

    let scope = match parsed.get("scope").and_then(|v| v.as_str()) {
        Some(s) if s.eq_ignore_ascii_case("plan") => VerdictScope::Plan,
        _ => VerdictScope::Code,
    };

    Some(Verdict {
        kind,
        rationale,
        scope,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::TerminationReason;
    use std::time::Duration;

    fn execution(reason: TerminationReason) -> ExecutionResult {
        ExecutionResult {
            stdout: "3\n".to_string(),
            stderr: String::new(),
            exit_code: Some(0),
            duration: Duration::from_millis(12),
            reason,
        }
    }

    #[test]
    fn plan_prompt_includes_task_and_feedback() {
        let prompt = PlanPromptBuilder::new("add two numbers")
            .with_feedback(vec!["handle negatives".to_string()])
            .build();

        assert!(prompt.contains("add two numbers"));
        assert!(prompt.contains("1. handle negatives"));
        assert!(prompt.contains("numbered list"));
    }

    #[test]
    fn plan_prompt_without_feedback_has_no_feedback_section() {
        let prompt = PlanPromptBuilder::new("add two numbers").build();
        assert!(!prompt.contains("Review Feedback"));
    }

    #[test]
    fn write_prompt_carries_revision_context() {
        let previous = CodeUnit::new(Language::Python, "print(1 + 1)");
        let prompt = WritePromptBuilder::new("add", "1. add", Language::Python)
            .with_previous_code(&previous)
            .with_revision("use input values")
            .build();

        assert!(prompt.contains("```python"));
        assert!(prompt.contains("print(1 + 1)"));
        assert!(prompt.contains("use input values"));
    }

    #[test]
    fn review_prompt_reports_execution() {
        let code = CodeUnit::new(Language::Python, "print(1 + 2)");
        let result = execution(TerminationReason::Timeout);
        let prompt = ReviewPromptBuilder::new("add", &code, &result)
            .with_plan("1. add")
            .build();

        assert!(prompt.contains("termination: Timeout"));
        assert!(prompt.contains("print(1 + 2)"));
        assert!(prompt.contains("NEEDS_REVISION"));
        assert!(prompt.contains("### Plan"));
    }

    #[test]
    fn parse_review_response_extracts_approved() {
        let response = r#"
            Here's my review:
            ```json
            {
                "verdict": "APPROVED",
                "rationale": "prints the sum"
            }
            ```
        "#;

        let verdict = parse_review_response(response).unwrap();
        assert_eq!(verdict.kind, VerdictKind::Approved);
        assert_eq!(verdict.rationale, "prints the sum");
        assert_eq!(verdict.scope, VerdictScope::Code);
    }

    #[test]
    fn parse_review_response_accepts_variants_and_scope() {
        let verdict =
            parse_review_response(r#"{"verdict": "needs revision", "rationale": "x"}"#).unwrap();
        assert_eq!(verdict.kind, VerdictKind::NeedsRevision);

        let verdict = parse_review_response(
            r#"{"verdict": "rejected", "rationale": "wrong approach", "scope": "Plan"}"#,
        )
        .unwrap();
        assert_eq!(verdict.kind, VerdictKind::Rejected);
        assert_eq!(verdict.scope, VerdictScope::Plan);
    }

    #[test]
    fn parse_review_response_returns_none_for_invalid() {
        assert!(parse_review_response("not json at all").is_none());
        assert!(parse_review_response("} backwards {").is_none());
        assert!(parse_review_response(r#"{"verdict": "maybe"}"#).is_none());
        assert!(parse_review_response(r#"{"rationale": "no verdict"}"#).is_none());
    }

    #[test]
    fn tail_keeps_last_chars() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
    }
}

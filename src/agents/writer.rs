//! Writer role: plan to code.
//!
//! On a revision request the previous code and the reviewer's rationale are
//! folded into the prompt, so the next attempt is a fix rather than a rewrite.

use std::sync::Arc;

use crate::collaborators::{LlmClient, MemoryStore};
use crate::error::AgentError;
use crate::prompt::WritePromptBuilder;
use crate::sandbox::{CodeUnit, Language};
use crate::transcript::{Role, Turn, TurnPayload};

use super::TurnContext;

/// Turns the latest plan (and any revision request) into code.
pub struct Writer {
    llm: Arc<dyn LlmClient>,
    memory: Arc<dyn MemoryStore>,
    language: Language,
}

impl Writer {
    pub fn new(llm: Arc<dyn LlmClient>, memory: Arc<dyn MemoryStore>) -> Self {
        Self {
            llm,
            memory,
            language: Language::default(),
        }
    }

    /// Language requested from the LLM and assumed for untagged replies.
    pub fn with_language(mut self, language: Language) -> Self {
        self.language = language;
        self
    }

    pub async fn produce_turn(&self, ctx: &TurnContext<'_>) -> Result<Turn, AgentError> {
        let transcript = ctx.transcript;
        let plan = transcript.latest_plan().ok_or(AgentError::MissingInput {
            role: Role::Writer,
            expected: "plan",
        })?;

        let mut builder =
            WritePromptBuilder::new(ctx.task.description.as_str(), plan, self.language);
        if let Some(verdict) = transcript
            .latest_verdict()
            .filter(|v| v.is_revision_request())
        {
            builder = builder.with_revision(verdict.rationale.as_str());
            if let Some(code) = transcript.latest_code() {
                builder = builder.with_previous_code(code);
            }
        }

        let excerpts = self.memory.retrieve(plan).await;
        let reply = self
            .llm
            .complete(&builder.build(), &excerpts)
            .await
            .map_err(|e| e.for_role(Role::Writer))?;

        let code = CodeUnit::from_reply(&reply, self.language).ok_or_else(|| {
            AgentError::GenerationFailure {
                role: Role::Writer,
                reason: "reply contained no code".to_string(),
            }
        })?;

        Ok(transcript.next_turn(Role::Writer, TurnPayload::Code(code)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::VolatileMemory;
    use crate::test_support::ScriptedLlm;
    use crate::transcript::{Task, Transcript, Verdict};

    fn append(transcript: &mut Transcript, role: Role, payload: TurnPayload) {
        let turn = transcript.next_turn(role, payload);
        transcript.append(turn).unwrap();
    }

    #[tokio::test]
    async fn extracts_code_from_reply() {
        let llm = Arc::new(ScriptedLlm::new().writer(["Sure:\n```sh\necho 3\n```"]));
        let writer = Writer::new(llm, Arc::new(VolatileMemory::new()));
        let task = Task::new("print 3");
        let mut transcript = Transcript::new();
        append(&mut transcript, Role::Planner, TurnPayload::Plan("1. print".into()));

        let turn = writer
            .produce_turn(&TurnContext::new(&task, &transcript))
            .await
            .unwrap();

        assert_eq!(
            turn.payload,
            TurnPayload::Code(CodeUnit::new(Language::Shell, "echo 3\n"))
        );
    }

    #[tokio::test]
    async fn revision_prompt_carries_rationale_and_previous_code() {
        let llm = Arc::new(ScriptedLlm::new().writer(["```python\nprint(3)\n```"]));
        let writer = Writer::new(llm.clone(), Arc::new(VolatileMemory::new()));
        let task = Task::new("print 3");
        let mut transcript = Transcript::new();
        append(&mut transcript, Role::Planner, TurnPayload::Plan("1. print".into()));
        append(
            &mut transcript,
            Role::Writer,
            TurnPayload::Code(CodeUnit::new(Language::Python, "print(2)\n")),
        );
        append(
            &mut transcript,
            Role::Reviewer,
            TurnPayload::Verdict(Verdict::needs_revision("prints 2, not 3")),
        );

        writer
            .produce_turn(&TurnContext::new(&task, &transcript))
            .await
            .unwrap();

        let prompt = &llm.prompts()[0];
        assert!(prompt.contains("prints 2, not 3"));
        assert!(prompt.contains("print(2)"));
    }

    #[tokio::test]
    async fn missing_plan_is_missing_input() {
        let writer = Writer::new(Arc::new(ScriptedLlm::new()), Arc::new(VolatileMemory::new()));
        let task = Task::new("x");
        let transcript = Transcript::new();

        let err = writer
            .produce_turn(&TurnContext::new(&task, &transcript))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            AgentError::MissingInput {
                role: Role::Writer,
                expected: "plan"
            }
        );
    }

    #[tokio::test]
    async fn empty_code_block_is_generation_failure() {
        let llm = Arc::new(ScriptedLlm::new().writer(["```python\n\n```"]));
        let writer = Writer::new(llm, Arc::new(VolatileMemory::new()));
        let task = Task::new("x");
        let mut transcript = Transcript::new();
        append(&mut transcript, Role::Planner, TurnPayload::Plan("1.".into()));

        let err = writer
            .produce_turn(&TurnContext::new(&task, &transcript))
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::GenerationFailure { role: Role::Writer, .. }));
    }

    #[tokio::test]
    async fn outage_is_reported_as_the_writer() {
        let llm = Arc::new(ScriptedLlm::new().failing(Role::Writer, "quota"));
        let writer = Writer::new(llm, Arc::new(VolatileMemory::new()));
        let task = Task::new("x");
        let mut transcript = Transcript::new();
        append(&mut transcript, Role::Planner, TurnPayload::Plan("1.".into()));

        let err = writer
            .produce_turn(&TurnContext::new(&task, &transcript))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            AgentError::DelegateUnavailable {
                role: Role::Writer,
                reason: "quota".to_string(),
            }
        );
    }
}

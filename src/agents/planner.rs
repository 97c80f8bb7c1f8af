//! Planner role.

use std::sync::Arc;

use crate::collaborators::{LlmClient, MemoryStore};
use crate::error::AgentError;
use crate::prompt::PlanPromptBuilder;
use crate::transcript::{Role, Turn, TurnPayload};

use super::TurnContext;

/// Breaks the task into a numbered plan.
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    memory: Arc<dyn MemoryStore>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, memory: Arc<dyn MemoryStore>) -> Self {
        Self { llm, memory }
    }

    pub async fn produce_turn(&self, ctx: &TurnContext<'_>) -> Result<Turn, AgentError> {
        let excerpts = self.memory.retrieve(&ctx.task.description).await;
        let feedback = ctx
            .transcript
            .revision_feedback()
            .into_iter()
            .map(str::to_string)
            .collect();

        let prompt = PlanPromptBuilder::new(ctx.task.description.as_str())
            .with_feedback(feedback)
            .build();

        let reply = self
            .llm
            .complete(&prompt, &excerpts)
            .await
            .map_err(|e| e.for_role(Role::Planner))?;

        let plan = reply.trim();
        if plan.is_empty() {
            return Err(AgentError::GenerationFailure {
                role: Role::Planner,
                reason: "empty plan".to_string(),
            });
        }

        Ok(ctx
            .transcript
            .next_turn(Role::Planner, TurnPayload::Plan(plan.to_string())))
    }
}

//! Agent roles.
//!
//! The four roles of the plan/write/execute/review cycle form the closed
//! [`Agent`] enum. The two post-decision roles are separate types:
//! [`GitAgent`] can only act with an [`Approval`](crate::strategy::Approval)
//! and [`Notifier`] only with a finished outcome summary. Agents hold no run
//! state; everything they read comes from the transcript.

mod git;
mod notifier;
mod planner;
mod reviewer;
mod sanitizer;
mod writer;

pub use git::{branch_name, GitAgent};
pub use notifier::Notifier;
pub use planner::Planner;
pub use reviewer::Reviewer;
pub use sanitizer::Sanitizer;
pub use writer::Writer;

use crate::error::AgentError;
use crate::transcript::{Role, Task, Transcript, Turn};

/// What an agent sees when producing a turn.
#[derive(Debug, Clone, Copy)]
pub struct TurnContext<'a> {
    pub task: &'a Task,
    pub transcript: &'a Transcript,
}

impl<'a> TurnContext<'a> {
    pub fn new(task: &'a Task, transcript: &'a Transcript) -> Self {
        Self { task, transcript }
    }
}

/// A cycle role.
pub enum Agent {
    Planner(Planner),
    Writer(Writer),
    Sanitizer(Sanitizer),
    Reviewer(Reviewer),
}

impl Agent {
    pub fn role(&self) -> Role {
        match self {
            Agent::Planner(_) => Role::Planner,
            Agent::Writer(_) => Role::Writer,
            Agent::Sanitizer(_) => Role::Sanitizer,
            Agent::Reviewer(_) => Role::Reviewer,
        }
    }

    /// Produces this role's next turn. The turn is not appended.
    pub async fn produce_turn(&self, ctx: &TurnContext<'_>) -> Result<Turn, AgentError> {
        let turn = match self {
            Agent::Planner(planner) => planner.produce_turn(ctx).await,
            Agent::Writer(writer) => writer.produce_turn(ctx).await,
            Agent::Sanitizer(sanitizer) => sanitizer.produce_turn(ctx).await,
            Agent::Reviewer(reviewer) => reviewer.produce_turn(ctx).await,
        }?;

        tracing::debug!(role = %self.role(), turn = turn.index, "agent produced turn");
        Ok(turn)
    }
}

//! Sanitizer role, the pipeline's only path into the sandbox.
//!
//! Timeouts, crashes and non-zero exits come back as an execution turn for the
//! Reviewer to judge. Only launch and policy failures end the run.

use std::sync::Arc;

use crate::error::AgentError;
use crate::sandbox::{ResourceLimits, SandboxExecutor};
use crate::transcript::{Role, Turn, TurnPayload};

use super::TurnContext;

/// Runs the latest code in the sandbox. The only role that executes code.
pub struct Sanitizer {
    executor: Arc<SandboxExecutor>,
    limits: ResourceLimits,
}

impl Sanitizer {
    pub fn new(executor: Arc<SandboxExecutor>, limits: ResourceLimits) -> Self {
        Self { executor, limits }
    }

    pub async fn produce_turn(&self, ctx: &TurnContext<'_>) -> Result<Turn, AgentError> {
        let code = ctx.transcript.latest_code().ok_or(AgentError::MissingInput {
            role: Role::Sanitizer,
            expected: "code",
        })?;

        let result = self.executor.execute(code, &self.limits).await?;

        if let Some(error) = result.error() {
            tracing::info!(error = %error, "sandboxed code did not succeed");
        }

        Ok(ctx
            .transcript
            .next_turn(Role::Sanitizer, TurnPayload::Execution(result)))
    }
}

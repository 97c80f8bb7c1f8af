//! Error types for the agent-crew pipeline.
//!
//! Each layer owns its own taxonomy: the sandbox produces [`ExecutionError`],
//! the LLM collaborator produces [`LlmError`], agents produce [`AgentError`]
//! (attaching their role to LLM errors), the control loop produces
//! [`OrchestrationError`], and the side-effecting collaborators produce
//! [`PublishError`] and [`NotifyError`]. [`Error`] wraps them all for callers
//! that only want a single error type.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transcript::Role;

/// Errors produced by the sandbox executor.
///
/// Only [`ExecutionError::LaunchFailure`] and [`ExecutionError::PolicyViolation`]
/// are ever returned as `Err`; the rest describe an
/// [`ExecutionResult`](crate::sandbox::ExecutionResult) and travel as data.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ExecutionError {
    /// The code ran past its wall-clock budget and was killed.
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    /// The code hit its memory ceiling.
    #[error("execution exceeded its resource limits: {0}")]
    ResourceExceeded(String),

    /// The isolated context could not be created or the code could not start.
    #[error("failed to launch isolated context: {0}")]
    LaunchFailure(String),

    /// The code ran to completion but exited with a failure status.
    #[error("execution exited with status {0}")]
    NonZeroExit(i32),

    /// The requested limits break the isolation policy.
    #[error("sandbox policy violation: {0}")]
    PolicyViolation(String),

    /// Releasing the isolated context failed. Logged, never fatal.
    #[error("failed to tear down isolated context: {0}")]
    Teardown(String),
}

impl ExecutionError {
    /// Whether this error must abort the run rather than be judged by a reviewer.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExecutionError::LaunchFailure(_) | ExecutionError::PolicyViolation(_)
        )
    }
}

/// Errors produced while an agent builds its turn.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// The collaborator answered, but not with anything usable.
    #[error("{role} failed to generate output: {reason}")]
    GenerationFailure { role: Role, reason: String },

    /// The collaborator could not be reached or failed outright.
    #[error("{role} delegate unavailable: {reason}")]
    DelegateUnavailable { role: Role, reason: String },

    /// The transcript lacks the turn this agent consumes.
    #[error("{role} requires a prior {expected} turn")]
    MissingInput { role: Role, expected: &'static str },

    /// The sandbox refused or failed to launch the code.
    #[error("sandbox execution failed: {0}")]
    Execution(#[from] ExecutionError),
}

/// Errors from the LLM collaborator. The client does not know who is asking.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    /// The backend could not be reached, failed or timed out.
    #[error("{0}")]
    Unavailable(String),

    /// The backend answered with nothing.
    #[error("empty reply")]
    EmptyReply,
}

impl LlmError {
    /// The agent error for `role` issuing the failed call.
    pub fn for_role(self, role: Role) -> AgentError {
        match self {
            LlmError::Unavailable(reason) => AgentError::DelegateUnavailable { role, reason },
            LlmError::EmptyReply => AgentError::GenerationFailure {
                role,
                reason: "empty reply".to_string(),
            },
        }
    }
}

/// Errors produced by the orchestrator and termination strategy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationError {
    /// The iteration ceiling was reached. This is the designed abort path.
    #[error("iteration budget exhausted after {cycles} cycle(s)")]
    BudgetExhausted { cycles: u32 },

    /// A turn was appended out of order.
    #[error("turn sequence violation: expected ordinal {expected}, got {found}")]
    SequenceViolation { expected: usize, found: usize },
}

/// Errors from the repository collaborator. Never fatal to an approved run.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublishError {
    /// The repository host refused the change.
    #[error("publish rejected: {0}")]
    Rejected(String),

    /// The repository host or local git tooling could not be used.
    #[error("publish backend unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the notification collaborator. Never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyError {
    /// The channel refused the message.
    #[error("notification rejected: {0}")]
    Rejected(String),

    /// The channel could not be reached.
    #[error("notification channel unavailable: {0}")]
    Unavailable(String),
}

/// Top-level error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration file could not be read.
    #[error("failed to read config at {path}: {reason}")]
    ConfigRead { path: PathBuf, reason: String },

    /// IO error while writing run logs or preparing scratch space.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization of a run record failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Notify(#[from] NotifyError),
}

/// Result type alias for crate operations.
pub type Result<T> = std::result::Result<T, Error>;

//! External collaborators of the pipeline.
//!
//! The control loop only talks to these traits. Each comes with a thin
//! default implementation so the binary works end to end:
//!
//! - [`LlmClient`]: [`CliLlm`] spawns an LLM CLI per completion
//! - [`MemoryStore`]: [`VolatileMemory`] keeps excerpts in process
//! - [`RepositoryPublisher`]: [`GitHubPublisher`] commits on a worktree branch and opens a PR
//! - [`NotificationChannel`]: [`LogChannel`] and [`CommandChannel`]

mod llm;
mod memory;
mod notify;
mod publish;
mod worktree;

pub use llm::CliLlm;
pub use memory::VolatileMemory;
pub use notify::{CommandChannel, LogChannel};
pub use publish::GitHubPublisher;
pub use worktree::Worktree;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LlmError, NotifyError, PublishError};
use crate::orchestrator::RunStatus;
use crate::sandbox::CodeUnit;

/// Text completion backend.
///
/// Implementations do not know which role is calling; agents turn failures
/// into their own errors with [`LlmError::for_role`].
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Completes `prompt`, with `context` excerpts supplied alongside it.
    async fn complete(&self, prompt: &str, context: &[String]) -> Result<String, LlmError>;

    /// Returns the name of this client.
    fn name(&self) -> &str;
}

/// Read-only source of prior excerpts.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Returns excerpts relevant to `query`, most relevant first.
    async fn retrieve(&self, query: &str) -> Vec<String>;
}

/// An approved change ready to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub code: CodeUnit,
    pub branch_name: String,
    pub title: String,
    pub body: String,
}

/// Reference to a published change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Branch the change was committed to.
    pub branch: String,
    /// Commit hash, when known.
    pub commit: Option<String>,
    /// Pull request URL, when one was opened.
    pub url: Option<String>,
    /// Pull request number, when one was opened.
    pub number: Option<u64>,
}

/// Publishes approved code to a repository host.
#[async_trait]
pub trait RepositoryPublisher: Send + Sync {
    async fn publish(&self, change: &ChangeSet) -> Result<ArtifactRef, PublishError>;
}

/// Message sent to the task's requester when a run ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutcomeSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub recipient: Option<String>,
    pub subject: String,
    pub body: String,
}

/// Delivery acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Channel that accepted the message.
    pub channel: String,
    /// Channel-specific delivery detail.
    pub detail: String,
}

/// Delivers outcome summaries.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn notify(&self, summary: &OutcomeSummary) -> Result<Ack, NotifyError>;
}

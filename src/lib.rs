//! Agent Crew - approval-gated multi-agent coding pipeline
//!
//! This library drives a task through planner, writer, sandboxed execution and
//! reviewer turns until a reviewer approves, rejects, or a budget runs out.
//! Only approved code is published, and every run ends with a notification.

pub mod agents;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod prompt;
pub mod report;
pub mod sandbox;
pub mod strategy;
pub mod test_support;
pub mod transcript;

pub use error::{Error, Result};

pub use agents::{Agent, GitAgent, Notifier, Planner, Reviewer, Sanitizer, TurnContext, Writer};
pub use collaborators::{
    Ack, ArtifactRef, ChangeSet, CliLlm, CommandChannel, GitHubPublisher, LlmClient, LogChannel,
    MemoryStore, NotificationChannel, OutcomeSummary, RepositoryPublisher, VolatileMemory,
};
pub use config::{CrewConfig, Validate, ValidationResult};
pub use orchestrator::{Collaborators, Orchestrator, RunOutcome, RunStatus};
pub use sandbox::{
    executor_from_config, CodeUnit, ExecutionResult, Language, ResourceLimits, SandboxExecutor,
    TerminationReason,
};
pub use strategy::{AbortReason, Approval, RunState, TerminationPolicy, TerminationStrategy};
pub use transcript::{Role, Task, Transcript, Turn, TurnPayload, Verdict, VerdictKind};

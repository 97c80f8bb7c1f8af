//! Task, turn, and transcript types shared by every agent.
//!
//! The [`Transcript`] is the only conversation state of a run. It is owned by
//! the orchestrator, handed to agents as `&Transcript`, and moved into the
//! [`RunOutcome`](crate::orchestrator::RunOutcome) when the run ends, which
//! freezes it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collaborators::{Ack, ArtifactRef};
use crate::error::OrchestrationError;
use crate::sandbox::{CodeUnit, ExecutionResult};

/// Immutable input of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Natural-language description of the change.
    pub description: String,
    /// Repository the change targets (e.g. `owner/repo`), if any.
    pub repository: Option<String>,
    /// Who to notify when the run ends.
    pub recipient: Option<String>,
}

impl Task {
    /// Creates a task from its description.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            repository: None,
            recipient: None,
        }
    }

    /// Sets the target repository.
    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    /// Sets the notification recipient.
    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }
}

/// Agent roles, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Planner,
    Writer,
    Sanitizer,
    Reviewer,
    GitAgent,
    Notifier,
}

impl Role {
    /// Returns the role name as used in logs and prompts.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Planner => "planner",
            Role::Writer => "writer",
            Role::Sanitizer => "sanitizer",
            Role::Reviewer => "reviewer",
            Role::GitAgent => "git_agent",
            Role::Notifier => "notifier",
        }
    }

    /// Whether the role takes part in the plan/write/execute/review cycle.
    pub fn is_cycle_role(&self) -> bool {
        matches!(
            self,
            Role::Planner | Role::Writer | Role::Sanitizer | Role::Reviewer
        )
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reviewer decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictKind {
    Approved,
    Rejected,
    NeedsRevision,
}

/// What a rejection is aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictScope {
    /// The code is wrong; the plan stands.
    #[default]
    Code,
    /// The plan itself is wrong and must be redone.
    Plan,
}

/// A reviewer's verdict on one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub kind: VerdictKind,
    pub rationale: String,
    #[serde(default)]
    pub scope: VerdictScope,
}

impl Verdict {
    pub fn approved(rationale: impl Into<String>) -> Self {
        Self {
            kind: VerdictKind::Approved,
            rationale: rationale.into(),
            scope: VerdictScope::Code,
        }
    }

    pub fn rejected(rationale: impl Into<String>) -> Self {
        Self {
            kind: VerdictKind::Rejected,
            rationale: rationale.into(),
            scope: VerdictScope::Code,
        }
    }

    pub fn needs_revision(rationale: impl Into<String>) -> Self {
        Self {
            kind: VerdictKind::NeedsRevision,
            rationale: rationale.into(),
            scope: VerdictScope::Code,
        }
    }

    /// Marks the verdict as aimed at the plan rather than the code.
    pub fn at_plan(mut self) -> Self {
        self.scope = VerdictScope::Plan;
        self
    }

    /// Whether the verdict consumes revision budget.
    pub fn is_revision_request(&self) -> bool {
        matches!(
            self.kind,
            VerdictKind::Rejected | VerdictKind::NeedsRevision
        )
    }
}

/// Outcome of the GitAgent's publish attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PublishRecord {
    Published { artifact: ArtifactRef },
    Failed { error: String },
}

/// Outcome of the Notifier's delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NotificationRecord {
    Delivered { ack: Ack },
    Failed { error: String },
}

/// What a turn carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TurnPayload {
    Plan(String),
    Code(CodeUnit),
    Execution(ExecutionResult),
    Verdict(Verdict),
    Publication(PublishRecord),
    Notification(NotificationRecord),
    /// The agent failed; the error is kept for diagnosis.
    Failure(String),
}

/// One agent's contribution to the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub index: usize,
    pub role: Role,
    pub payload: TurnPayload,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    /// Creates a turn stamped with the current time.
    pub fn new(index: usize, role: Role, payload: TurnPayload) -> Self {
        Self {
            index,
            role,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn verdict(&self) -> Option<&Verdict> {
        match &self.payload {
            TurnPayload::Verdict(verdict) => Some(verdict),
            _ => None,
        }
    }
}

/// Append-only, ordered log of turns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Ordinal the next appended turn must carry.
    pub fn next_index(&self) -> usize {
        self.turns.len()
    }

    /// Builds the next turn for `role` without appending it.
    pub fn next_turn(&self, role: Role, payload: TurnPayload) -> Turn {
        Turn::new(self.next_index(), role, payload)
    }

    /// Appends a turn, enforcing ordinal order.
    pub(crate) fn append(&mut self, turn: Turn) -> Result<&Turn, OrchestrationError> {
        let expected = self.next_index();
        if turn.index != expected {
            return Err(OrchestrationError::SequenceViolation {
                expected,
                found: turn.index,
            });
        }
        self.turns.push(turn);
        Ok(&self.turns[expected])
    }

    pub fn latest_plan(&self) -> Option<&str> {
        self.turns.iter().rev().find_map(|t| match &t.payload {
            TurnPayload::Plan(plan) => Some(plan.as_str()),
            _ => None,
        })
    }

    pub fn latest_code(&self) -> Option<&CodeUnit> {
        self.turns.iter().rev().find_map(|t| match &t.payload {
            TurnPayload::Code(code) => Some(code),
            _ => None,
        })
    }

    pub fn latest_execution(&self) -> Option<&ExecutionResult> {
        self.turns.iter().rev().find_map(|t| match &t.payload {
            TurnPayload::Execution(result) => Some(result),
            _ => None,
        })
    }

    pub fn latest_verdict(&self) -> Option<&Verdict> {
        self.turns.iter().rev().find_map(Turn::verdict)
    }

    /// All verdicts, oldest first.
    pub fn verdicts(&self) -> impl Iterator<Item = &Verdict> {
        self.turns.iter().filter_map(Turn::verdict)
    }

    /// Number of completed review cycles.
    pub fn cycles_completed(&self) -> u32 {
        self.verdicts().count() as u32
    }

    /// Number of turns produced by cycle roles.
    pub fn cycle_turns(&self) -> u32 {
        self.turns.iter().filter(|t| t.role.is_cycle_role()).count() as u32
    }

    /// Verdict rationales that asked for changes, oldest first.
    pub fn revision_feedback(&self) -> Vec<&str> {
        self.verdicts()
            .filter(|v| v.is_revision_request())
            .map(|v| v.rationale.as_str())
            .collect()
    }

    /// Position of the first turn produced by `role`, if any.
    pub fn position_of(&self, role: Role) -> Option<usize> {
        self.turns.iter().position(|t| t.role == role)
    }
}

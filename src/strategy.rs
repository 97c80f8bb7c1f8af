//! Termination strategy: decides after every turn whether a run goes on.
//!
//! [`TerminationStrategy::evaluate`] is a pure function of the transcript and
//! the run's [`Counters`]; calling it twice on the same inputs gives the same
//! [`RunState`]. The only way to obtain an [`Approval`], and therefore the
//! only way to reach the git agent, is an `Approved` state from here.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::OrchestrationConfig;
use crate::error::OrchestrationError;
use crate::transcript::{Transcript, Turn, TurnPayload, VerdictKind, VerdictScope};

/// Cycle turns allowed per cycle before the turn backstop fires.
pub const TURNS_PER_CYCLE: u32 = 4;

/// Proof that a reviewer approved the run.
///
/// Cannot be constructed outside this module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Approval {
    verdict_index: usize,
}

impl Approval {
    /// Transcript index of the approving verdict.
    pub fn verdict_index(&self) -> usize {
        self.verdict_index
    }
}

/// Where a revision cycle starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Planner,
    Writer,
}

/// What the orchestrator does next while the run is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Mid-cycle: hand the transcript to the next role in order.
    Continue,
    /// A cycle ended with a revision request.
    Revise(Route),
}

/// Why a run was aborted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    /// The iteration ceiling was reached without a final verdict.
    IterationCeiling { cycles: u32 },
    /// Too many cycle turns were appended.
    TurnCeiling { turns: u32 },
    /// The run was cancelled from outside.
    Cancelled,
}

impl AbortReason {
    /// The budget error this abort corresponds to, if any.
    pub fn budget_error(&self) -> Option<OrchestrationError> {
        match self {
            AbortReason::IterationCeiling { cycles } => {
                Some(OrchestrationError::BudgetExhausted { cycles: *cycles })
            }
            AbortReason::TurnCeiling { turns } => Some(OrchestrationError::BudgetExhausted {
                cycles: turns / TURNS_PER_CYCLE,
            }),
            AbortReason::Cancelled => None,
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::IterationCeiling { cycles } => {
                write!(f, "iteration ceiling reached after {} cycle(s)", cycles)
            }
            AbortReason::TurnCeiling { turns } => {
                write!(f, "turn ceiling reached after {} turn(s)", turns)
            }
            AbortReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Result of evaluating the transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Running(Next),
    Approved(Approval),
    Rejected,
    Aborted(AbortReason),
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Running(_))
    }
}

/// Per-run counters, updated as turns are appended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    /// REJECTED and NEEDS_REVISION verdicts seen.
    pub revisions_used: u32,
    /// Turns appended by cycle roles.
    pub turns_used: u32,
}

impl Counters {
    /// Accounts for one appended turn.
    pub fn observe(&mut self, turn: &Turn) {
        if turn.role.is_cycle_role() {
            self.turns_used += 1;
        }
        if let TurnPayload::Verdict(verdict) = &turn.payload {
            if verdict.is_revision_request() {
                self.revisions_used += 1;
            }
        }
    }

    /// Counters for a whole transcript.
    pub fn from_transcript(transcript: &Transcript) -> Self {
        let mut counters = Self::default();
        for turn in transcript.turns() {
            counters.observe(turn);
        }
        counters
    }
}

/// Budgets applied by the strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPolicy {
    pub iteration_ceiling: u32,
    pub revision_budget: u32,
    pub replan_on_rejection: bool,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self::from(&OrchestrationConfig::default())
    }
}

impl From<&OrchestrationConfig> for TerminationPolicy {
    fn from(config: &OrchestrationConfig) -> Self {
        Self {
            iteration_ceiling: config.iteration_ceiling,
            revision_budget: config.revision_budget,
            replan_on_rejection: config.replan_on_rejection,
        }
    }
}

impl TerminationPolicy {
    /// Hard cap on cycle turns.
    pub fn turn_ceiling(&self) -> u32 {
        self.iteration_ceiling.saturating_mul(TURNS_PER_CYCLE)
    }
}

/// Stateless evaluator of [`TerminationPolicy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminationStrategy {
    policy: TerminationPolicy,
}

impl TerminationStrategy {
    pub fn new(policy: TerminationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &TerminationPolicy {
        &self.policy
    }

    /// Decides the run state after the latest turn.
    pub fn evaluate(&self, transcript: &Transcript, counters: &Counters) -> RunState {
        let Some(last) = transcript.last() else {
            return RunState::Running(Next::Continue);
        };

        let Some(verdict) = last.verdict() else {
            if counters.turns_used >= self.policy.turn_ceiling() {
                return RunState::Aborted(AbortReason::TurnCeiling {
                    turns: counters.turns_used,
                });
            }
            return RunState::Running(Next::Continue);
        };

        if verdict.kind == VerdictKind::Approved {
            return RunState::Approved(Approval {
                verdict_index: last.index,
            });
        }

        if verdict.kind == VerdictKind::Rejected
            && counters.revisions_used >= self.policy.revision_budget
        {
            return RunState::Rejected;
        }

        let cycles = transcript.cycles_completed();
        if cycles >= self.policy.iteration_ceiling {
            return RunState::Aborted(AbortReason::IterationCeiling { cycles });
        }

        let route = match verdict.kind {
            VerdictKind::Rejected
                if verdict.scope == VerdictScope::Plan || self.policy.replan_on_rejection =>
            {
                Route::Planner
            }
            _ => Route::Writer,
        };
        RunState::Running(Next::Revise(route))
    }
}

//! Orchestrator: drives one task through the agent cycle to a terminal outcome.
//!
//! The loop is the only writer of the transcript. After every appended turn it
//! asks the [`TerminationStrategy`] what happens next. Only an `Approved`
//! state yields the [`Approval`] the [`GitAgent`] needs, and the [`Notifier`]
//! runs once on every terminal outcome.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::agents::{
    Agent, GitAgent, Notifier, Planner, Reviewer, Sanitizer, TurnContext, Writer,
};
use crate::collaborators::{
    Ack, ArtifactRef, LlmClient, MemoryStore, NotificationChannel, RepositoryPublisher,
};
use crate::config::CrewConfig;
use crate::error::{OrchestrationError, Result};
use crate::report;
use crate::sandbox::{millis, SandboxExecutor};
use crate::strategy::{
    AbortReason, Approval, Counters, Next, Route, RunState, TerminationPolicy,
    TerminationStrategy,
};
use crate::transcript::{
    NotificationRecord, PublishRecord, Role, Task, Transcript, Turn, TurnPayload,
};

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Approved and handed to the git agent.
    Completed,
    /// The reviewer rejected the work with no revisions left.
    Rejected,
    /// A budget ran out or the run was cancelled.
    Aborted,
    /// An agent or the sandbox failed fatally.
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Completed => "COMPLETED",
            RunStatus::Rejected => "REJECTED",
            RunStatus::Aborted => "ABORTED",
            RunStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Everything known about a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub task: Task,
    pub status: RunStatus,
    transcript: Transcript,
    pub counters: Counters,
    /// Published change, for completed runs whose publish succeeded.
    pub pull_request: Option<ArtifactRef>,
    pub publish_error: Option<String>,
    pub notification: Option<Ack>,
    pub notify_error: Option<String>,
    /// Error that failed the run.
    pub failure: Option<String>,
    pub abort_reason: Option<AbortReason>,
    #[serde(rename = "duration_ms", with = "millis")]
    pub duration: Duration,
}

impl RunOutcome {
    fn new(
        run_id: Uuid,
        task: Task,
        status: RunStatus,
        transcript: Transcript,
        counters: Counters,
    ) -> Self {
        Self {
            run_id,
            task,
            status,
            transcript,
            counters,
            pull_request: None,
            publish_error: None,
            notification: None,
            notify_error: None,
            failure: None,
            abort_reason: None,
            duration: Duration::ZERO,
        }
    }

    /// The full, ordered record of the run.
    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Completed review cycles.
    pub fn cycles(&self) -> u32 {
        self.transcript.cycles_completed()
    }

    pub fn summary_markdown(&self) -> String {
        report::outcome_markdown(self)
    }

    fn record(&mut self, turn: Turn) {
        if let Err(e) = self.transcript.append(turn) {
            tracing::error!(error = %e, "dropped out-of-order turn");
        }
    }
}

/// External services an orchestrator is built from.
pub struct Collaborators {
    pub llm: Arc<dyn LlmClient>,
    pub memory: Arc<dyn MemoryStore>,
    pub executor: Arc<SandboxExecutor>,
    pub publisher: Arc<dyn RepositoryPublisher>,
    pub channel: Arc<dyn NotificationChannel>,
}

/// How the cycle ended, before the post-decision roles run.
enum Decision {
    Approved(Approval),
    Rejected,
    Aborted(AbortReason),
    Failed(String),
}

/// Runs tasks through plan, write, execute and review cycles.
///
/// Holds no per-run state; one orchestrator can drive concurrent runs.
pub struct Orchestrator {
    planner: Agent,
    writer: Agent,
    sanitizer: Agent,
    reviewer: Agent,
    git_agent: GitAgent,
    notifier: Notifier,
    strategy: TerminationStrategy,
    logs_dir: Option<PathBuf>,
    default_recipient: Option<String>,
}

impl Orchestrator {
    pub fn new(
        planner: Planner,
        writer: Writer,
        sanitizer: Sanitizer,
        reviewer: Reviewer,
        git_agent: GitAgent,
        notifier: Notifier,
    ) -> Self {
        Self {
            planner: Agent::Planner(planner),
            writer: Agent::Writer(writer),
            sanitizer: Agent::Sanitizer(sanitizer),
            reviewer: Agent::Reviewer(reviewer),
            git_agent,
            notifier,
            strategy: TerminationStrategy::default(),
            logs_dir: None,
            default_recipient: None,
        }
    }

    /// Wires every role from `config` and the given collaborators.
    pub fn from_config(config: &CrewConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            llm,
            memory,
            executor,
            publisher,
            channel,
        } = collaborators;

        let orchestrator = Self::new(
            Planner::new(llm.clone(), memory.clone()),
            Writer::new(llm.clone(), memory).with_language(config.sandbox.default_language),
            Sanitizer::new(executor, config.sandbox.limits.clone()),
            Reviewer::new(llm),
            GitAgent::new(publisher).with_branch_prefix(config.publish.branch_prefix.clone()),
            Notifier::new(channel),
        )
        .with_policy(TerminationPolicy::from(&config.orchestration));

        let orchestrator = match &config.orchestration.logs_dir {
            Some(dir) => orchestrator.with_logs_dir(dir.clone()),
            None => orchestrator,
        };
        match &config.notify.recipient {
            Some(recipient) => orchestrator.with_default_recipient(recipient.clone()),
            None => orchestrator,
        }
    }

    pub fn with_policy(mut self, policy: TerminationPolicy) -> Self {
        self.strategy = TerminationStrategy::new(policy);
        self
    }

    /// Writes `outcome.json` and `summary.md` per run under `dir`.
    pub fn with_logs_dir(mut self, dir: PathBuf) -> Self {
        self.logs_dir = Some(dir);
        self
    }

    /// Recipient for tasks that name none.
    pub fn with_default_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.default_recipient = Some(recipient.into());
        self
    }

    pub fn policy(&self) -> &TerminationPolicy {
        self.strategy.policy()
    }

    /// Runs `task` to a terminal outcome.
    pub async fn run(&self, task: Task) -> RunOutcome {
        self.run_with_cancellation(task, CancellationToken::new())
            .await
    }

    /// Runs `task`, ending it ABORTED at the next cycle boundary once
    /// `cancel` fires.
    pub async fn run_with_cancellation(&self, task: Task, cancel: CancellationToken) -> RunOutcome {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("run", run_id = %run_id);
        self.drive(run_id, task, cancel).instrument(span).await
    }

    async fn drive(&self, run_id: Uuid, task: Task, cancel: CancellationToken) -> RunOutcome {
        let started = Instant::now();
        tracing::info!(
            task = %task.description,
            iteration_ceiling = self.policy().iteration_ceiling,
            revision_budget = self.policy().revision_budget,
            "run started"
        );

        let mut transcript = Transcript::new();
        let mut counters = Counters::default();
        let decision = self
            .run_cycles(&task, &mut transcript, &mut counters, &cancel)
            .await;

        let status = match &decision {
            Decision::Approved(_) => RunStatus::Completed,
            Decision::Rejected => RunStatus::Rejected,
            Decision::Aborted(_) => RunStatus::Aborted,
            Decision::Failed(_) => RunStatus::Failed,
        };
        let mut outcome = RunOutcome::new(run_id, task, status, transcript, counters);

        match decision {
            Decision::Approved(approval) => {
                let turn = self
                    .git_agent
                    .produce_turn(
                        &approval,
                        &TurnContext::new(&outcome.task, &outcome.transcript),
                        run_id,
                    )
                    .await;
                match &turn.payload {
                    TurnPayload::Publication(PublishRecord::Published { artifact }) => {
                        outcome.pull_request = Some(artifact.clone());
                    }
                    TurnPayload::Publication(PublishRecord::Failed { error }) => {
                        outcome.publish_error = Some(error.clone());
                    }
                    _ => {}
                }
                outcome.record(turn);
            }
            Decision::Rejected => {
                tracing::info!(
                    revisions_used = outcome.counters.revisions_used,
                    "run rejected"
                );
            }
            Decision::Aborted(reason) => {
                match reason.budget_error() {
                    Some(error) => tracing::warn!(error = %error, reason = %reason, "run aborted"),
                    None => tracing::warn!(reason = %reason, "run aborted"),
                }
                outcome.abort_reason = Some(reason);
            }
            Decision::Failed(error) => {
                outcome.failure = Some(error);
            }
        }

        outcome.duration = started.elapsed();
        let summary = report::outcome_summary(&outcome, self.default_recipient.as_deref());
        let turn = self.notifier.produce_turn(&summary, &outcome.transcript).await;
        match &turn.payload {
            TurnPayload::Notification(NotificationRecord::Delivered { ack }) => {
                outcome.notification = Some(ack.clone());
            }
            TurnPayload::Notification(NotificationRecord::Failed { error }) => {
                outcome.notify_error = Some(error.clone());
            }
            _ => {}
        }
        outcome.record(turn);
        outcome.duration = started.elapsed();

        if let Some(dir) = &self.logs_dir {
            match write_run_log(dir, &outcome) {
                Ok(path) => tracing::debug!(path = %path.display(), "run log written"),
                Err(e) => tracing::warn!(error = %e, "failed to write run log"),
            }
        }

        tracing::info!(
            status = %outcome.status,
            cycles = outcome.cycles(),
            turns = %report::role_sequence(&outcome.transcript),
            duration_ms = outcome.duration.as_millis() as u64,
            "run finished"
        );
        outcome
    }

    /// Runs cycle roles until the strategy reaches a terminal state.
    async fn run_cycles(
        &self,
        task: &Task,
        transcript: &mut Transcript,
        counters: &mut Counters,
        cancel: &CancellationToken,
    ) -> Decision {
        let mut role = Role::Planner;
        let mut cycle_start = true;

        loop {
            if cycle_start {
                if cancel.is_cancelled() {
                    return Decision::Aborted(AbortReason::Cancelled);
                }
                cycle_start = false;
            }

            let Some(agent) = self.agent(role) else {
                return Decision::Failed(format!("{} has no turn within a cycle", role));
            };
            let produced = agent.produce_turn(&TurnContext::new(task, transcript)).await;

            let turn = match produced {
                Ok(turn) => turn,
                Err(e) => {
                    tracing::error!(role = %role, error = %e, "agent failed");
                    let failure = transcript.next_turn(role, TurnPayload::Failure(e.to_string()));
                    if let Err(seq) = append(transcript, counters, failure) {
                        tracing::error!(error = %seq, "failed to record agent failure");
                    }
                    return Decision::Failed(e.to_string());
                }
            };

            if let Err(e) = append(transcript, counters, turn) {
                return Decision::Failed(e.to_string());
            }

            match self.strategy.evaluate(transcript, counters) {
                RunState::Running(Next::Continue) => match next_role(role) {
                    Some(next) => role = next,
                    None => return Decision::Failed(format!("no role follows {}", role)),
                },
                RunState::Running(Next::Revise(route)) => {
                    tracing::info!(
                        cycle = transcript.cycles_completed(),
                        route = ?route,
                        revisions_used = counters.revisions_used,
                        "revision requested"
                    );
                    role = match route {
                        Route::Planner => Role::Planner,
                        Route::Writer => Role::Writer,
                    };
                    cycle_start = true;
                }
                RunState::Approved(approval) => return Decision::Approved(approval),
                RunState::Rejected => return Decision::Rejected,
                RunState::Aborted(reason) => return Decision::Aborted(reason),
            }
        }
    }

    /// The cycle agent for `role`. Publishing and notifying happen after the
    /// cycles, never inside them.
    fn agent(&self, role: Role) -> Option<&Agent> {
        match role {
            Role::Planner => Some(&self.planner),
            Role::Writer => Some(&self.writer),
            Role::Sanitizer => Some(&self.sanitizer),
            Role::Reviewer => Some(&self.reviewer),
            Role::GitAgent | Role::Notifier => None,
        }
    }
}

/// Role after `role` within one cycle. The Reviewer's verdict ends a cycle.
fn next_role(role: Role) -> Option<Role> {
    match role {
        Role::Planner => Some(Role::Writer),
        Role::Writer => Some(Role::Sanitizer),
        Role::Sanitizer => Some(Role::Reviewer),
        Role::Reviewer | Role::GitAgent | Role::Notifier => None,
    }
}

fn append(
    transcript: &mut Transcript,
    counters: &mut Counters,
    turn: Turn,
) -> std::result::Result<(), OrchestrationError> {
    let turn = transcript.append(turn)?;
    counters.observe(turn);
    tracing::debug!(index = turn.index, role = %turn.role, "turn appended");
    Ok(())
}

/// Writes `<dir>/<run_id>/outcome.json` and `summary.md`.
pub fn write_run_log(dir: &Path, outcome: &RunOutcome) -> Result<PathBuf> {
    let run_dir = dir.join(outcome.run_id.to_string());
    std::fs::create_dir_all(&run_dir)?;

    let json = serde_json::to_string_pretty(outcome)?;
    std::fs::write(run_dir.join("outcome.json"), json)?;
    std::fs::write(run_dir.join("summary.md"), outcome.summary_markdown())?;

    Ok(run_dir)
}

//! Scripted collaborators and fixtures for tests.
//!
//! Public so integration tests can drive full runs without an LLM, a
//! container runtime, or a repository host.

use std::collections::HashMap;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use crate::collaborators::{
    Ack, ArtifactRef, ChangeSet, LlmClient, NotificationChannel, OutcomeSummary,
    RepositoryPublisher,
};
use crate::error::{ExecutionError, LlmError, NotifyError, PublishError};
use crate::prompt::{PLAN_HEADING, REVIEW_HEADING, WRITE_HEADING};
use crate::sandbox::{
    CodeUnit, ExitState, IsolatedContext, IsolationSubstrate, RawOutcome, ResourceLimits,
    SubstrateCapabilities,
};
use crate::transcript::Role;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Replies for prompts starting with one heading. The last reply repeats.
struct Script {
    heading: &'static str,
    replies: Vec<Result<String, LlmError>>,
    served: AtomicUsize,
}

/// LLM stub answering each role from its own script.
#[derive(Default)]
pub struct ScriptedLlm {
    scripts: Vec<Script>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// A run that plans, writes `code` as Python, and gets `verdicts` in order.
    pub fn pipeline(code: &str, verdicts: &[&str]) -> Self {
        Self::new()
            .planner(["1. write the code\n2. print the result"])
            .writer([format!("```python\n{}\n```", code)])
            .reviewer(verdicts.iter().map(|v| review_json(v, &format!("{} rationale", v))))
    }

    fn script(
        mut self,
        heading: &'static str,
        replies: impl IntoIterator<Item = Result<String, LlmError>>,
    ) -> Self {
        self.scripts.push(Script {
            heading,
            replies: replies.into_iter().collect(),
            served: AtomicUsize::new(0),
        });
        self
    }

    pub fn planner(self, replies: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.script(PLAN_HEADING, replies.into_iter().map(|r| Ok(r.into())))
    }

    pub fn writer(self, replies: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.script(WRITE_HEADING, replies.into_iter().map(|r| Ok(r.into())))
    }

    pub fn reviewer(self, replies: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.script(REVIEW_HEADING, replies.into_iter().map(|r| Ok(r.into())))
    }

    /// Makes every call for `role` fail as unavailable.
    pub fn failing(self, role: Role, reason: &str) -> Self {
        match heading(role) {
            Some(heading) => {
                self.script(heading, [Err(LlmError::Unavailable(reason.to_string()))])
            }
            None => self,
        }
    }

    /// Every prompt received, in order.
    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }

    /// Number of prompts received for `role`.
    pub fn calls(&self, role: Role) -> usize {
        let Some(heading) = heading(role) else {
            return 0;
        };
        lock(&self.prompts)
            .iter()
            .filter(|p| p.starts_with(heading))
            .count()
    }
}

/// Prompt heading of the roles that call the LLM.
fn heading(role: Role) -> Option<&'static str> {
    match role {
        Role::Planner => Some(PLAN_HEADING),
        Role::Writer => Some(WRITE_HEADING),
        Role::Reviewer => Some(REVIEW_HEADING),
        Role::Sanitizer | Role::GitAgent | Role::Notifier => None,
    }
}

/// A reviewer reply in the expected JSON shape.
pub fn review_json(verdict: &str, rationale: &str) -> String {
    serde_json::json!({ "verdict": verdict, "rationale": rationale }).to_string()
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, prompt: &str, _context: &[String]) -> Result<String, LlmError> {
        lock(&self.prompts).push(prompt.to_string());

        // Later scripts override earlier ones for the same heading.
        let script = self
            .scripts
            .iter()
            .rev()
            .find(|s| prompt.starts_with(s.heading))
            .ok_or_else(|| LlmError::Unavailable("no scripted reply".to_string()))?;

        let served = script.served.fetch_add(1, Ordering::SeqCst);
        let index = served.min(script.replies.len().saturating_sub(1));
        script
            .replies
            .get(index)
            .cloned()
            .unwrap_or(Err(LlmError::EmptyReply))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Publisher that records change sets.
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<ChangeSet>>,
    failure: Option<PublishError>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every publish with `error` (still recording the attempt).
    pub fn failing(error: PublishError) -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            failure: Some(error),
        }
    }

    pub fn published(&self) -> Vec<ChangeSet> {
        lock(&self.published).clone()
    }
}

#[async_trait]
impl RepositoryPublisher for RecordingPublisher {
    async fn publish(&self, change: &ChangeSet) -> Result<ArtifactRef, PublishError> {
        let number = {
            let mut published = lock(&self.published);
            published.push(change.clone());
            published.len() as u64
        };
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        Ok(ArtifactRef {
            branch: change.branch_name.clone(),
            commit: Some(format!("{:040x}", number)),
            url: Some(format!("https://github.example/acme/repo/pull/{}", number)),
            number: Some(number),
        })
    }
}

/// Channel that records summaries.
#[derive(Default)]
pub struct RecordingChannel {
    delivered: Mutex<Vec<OutcomeSummary>>,
    failure: Option<NotifyError>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every delivery with `error` (still recording the attempt).
    pub fn failing(error: NotifyError) -> Self {
        Self {
            delivered: Mutex::new(Vec::new()),
            failure: Some(error),
        }
    }

    pub fn delivered(&self) -> Vec<OutcomeSummary> {
        lock(&self.delivered).clone()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    async fn notify(&self, summary: &OutcomeSummary) -> Result<Ack, NotifyError> {
        lock(&self.delivered).push(summary.clone());
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        Ok(Ack {
            channel: "recording".to_string(),
            detail: summary.subject.clone(),
        })
    }
}

#[derive(Default)]
struct Counters {
    created: AtomicUsize,
    destroyed: AtomicUsize,
    terminated: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

enum Behavior {
    Outcome(RawOutcome),
    FailCreate(String),
    FailRun(String),
}

/// Substrate whose contexts return a fixed outcome, with lifecycle counters.
pub struct FixedSubstrate {
    behavior: Behavior,
    /// Per-source overrides of the outcome.
    by_source: HashMap<String, RawOutcome>,
    delay: Option<Duration>,
    capabilities: SubstrateCapabilities,
    counters: Arc<Counters>,
}

impl FixedSubstrate {
    fn with_behavior(behavior: Behavior) -> Self {
        Self {
            behavior,
            by_source: HashMap::new(),
            delay: None,
            capabilities: SubstrateCapabilities::full(),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Every run returns `outcome`.
    pub fn new(outcome: RawOutcome) -> Self {
        Self::with_behavior(Behavior::Outcome(outcome))
    }

    /// Every run exits 0 and prints `stdout`.
    pub fn succeeding(stdout: &str) -> Self {
        Self::new(RawOutcome {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit: ExitState::Exited(0),
            memory_exceeded: false,
        })
    }

    /// Context creation fails with a launch failure.
    pub fn failing_create(message: &str) -> Self {
        Self::with_behavior(Behavior::FailCreate(message.to_string()))
    }

    /// Contexts are created but running code fails to launch.
    pub fn failing_run(message: &str) -> Self {
        Self::with_behavior(Behavior::FailRun(message.to_string()))
    }

    /// Runs of exactly `source` return `outcome` instead.
    pub fn with_outcome_for(mut self, source: &str, outcome: RawOutcome) -> Self {
        self.by_source.insert(source.to_string(), outcome);
        self
    }

    /// Each run sleeps for `delay` before returning. Only timeouts and
    /// abandoned runs count as terminated.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Declares no network isolation.
    pub fn degraded(mut self) -> Self {
        self.capabilities.network_isolation = false;
        self
    }

    pub fn created(&self) -> usize {
        self.counters.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.counters.destroyed.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> usize {
        self.counters.terminated.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live contexts.
    pub fn max_active(&self) -> usize {
        self.counters.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IsolationSubstrate for FixedSubstrate {
    async fn create(
        &self,
        _limits: &ResourceLimits,
    ) -> Result<Box<dyn IsolatedContext>, ExecutionError> {
        let result = match &self.behavior {
            Behavior::FailCreate(message) => {
                return Err(ExecutionError::LaunchFailure(message.clone()))
            }
            Behavior::FailRun(message) => Err(ExecutionError::LaunchFailure(message.clone())),
            Behavior::Outcome(outcome) => Ok(outcome.clone()),
        };

        let id = self.counters.created.fetch_add(1, Ordering::SeqCst) + 1;
        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_active.fetch_max(active, Ordering::SeqCst);

        Ok(Box::new(FixedContext {
            id: format!("fixed-{}", id),
            result,
            by_source: self.by_source.clone(),
            delay: self.delay,
            destroyed: false,
            counters: self.counters.clone(),
        }))
    }

    fn capabilities(&self) -> SubstrateCapabilities {
        self.capabilities
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

struct FixedContext {
    id: String,
    result: Result<RawOutcome, ExecutionError>,
    by_source: HashMap<String, RawOutcome>,
    delay: Option<Duration>,
    destroyed: bool,
    counters: Arc<Counters>,
}

#[async_trait]
impl IsolatedContext for FixedContext {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&mut self, code: &CodeUnit) -> Result<RawOutcome, ExecutionError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(outcome) = self.by_source.get(&code.source) {
            return Ok(outcome.clone());
        }
        self.result.clone()
    }

    fn terminate(&mut self) {
        self.counters.terminated.fetch_add(1, Ordering::SeqCst);
    }

    fn destroy(&mut self) -> Result<(), ExecutionError> {
        if !self.destroyed {
            self.destroyed = true;
            self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
            self.counters.active.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// The configured output, as if printed before the delay.
    fn partial_output(&self) -> (String, String) {
        match &self.result {
            Ok(outcome) => (outcome.stdout.clone(), outcome.stderr.clone()),
            Err(_) => (String::new(), String::new()),
        }
    }

    async fn shutdown(&mut self) -> Result<(), ExecutionError> {
        self.destroy()
    }
}

/// Creates a git repository with one commit in a temp dir.
pub fn create_temp_git_repo() -> TempDir {
    let temp_dir = TempDir::new().expect("failed to create temp dir");

    let git = |args: &[&str]| {
        let output = Command::new("git")
            .args(args)
            .current_dir(temp_dir.path())
            .output()
            .expect("failed to run git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    };

    git(&["init"]);
    git(&["config", "user.email", "test@test.com"]);
    git(&["config", "user.name", "Test User"]);
    git(&["config", "commit.gpgsign", "false"]);

    std::fs::write(temp_dir.path().join("README.md"), "# Test Repo\n")
        .expect("failed to write README");

    git(&["add", "."]);
    git(&["commit", "-m", "Initial commit"]);

    temp_dir
}

//! Sandbox executor: one untrusted code unit, one disposable context.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::Validate;
use crate::error::ExecutionError;

use super::code::CodeUnit;
use super::limits::{millis, ResourceLimits};
use super::substrate::{ExitState, IsolatedContext, IsolationSubstrate, RawOutcome};

/// Default cap on captured bytes per output stream.
pub const DEFAULT_OUTPUT_LIMIT: usize = 64 * 1024;

const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Why an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationReason {
    /// The code exited on its own (with any status).
    Completed,
    /// The wall-clock timeout fired and the code was killed.
    Timeout,
    /// The memory ceiling was hit.
    ResourceLimit,
    /// The code died abnormally (signal, runtime failure).
    Crashed,
}

/// Structured result of one sandboxed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// Exit status, absent when the process was killed.
    pub exit_code: Option<i32>,
    #[serde(rename = "duration_ms", with = "millis")]
    pub duration: Duration,
    pub reason: TerminationReason,
}

impl ExecutionResult {
    /// Whether the code completed with exit status zero.
    pub fn succeeded(&self) -> bool {
        self.reason == TerminationReason::Completed && self.exit_code == Some(0)
    }

    /// The failure this result describes, if any.
    pub fn error(&self) -> Option<ExecutionError> {
        match self.reason {
            TerminationReason::Completed => match self.exit_code {
                Some(0) | None => None,
                Some(code) => Some(ExecutionError::NonZeroExit(code)),
            },
            TerminationReason::Timeout => Some(ExecutionError::Timeout(self.duration)),
            TerminationReason::ResourceLimit => {
                Some(ExecutionError::ResourceExceeded(self.stderr_tail(200)))
            }
            TerminationReason::Crashed => None,
        }
    }

    /// Last `max_chars` characters of stderr.
    pub fn stderr_tail(&self, max_chars: usize) -> String {
        let count = self.stderr.chars().count();
        self.stderr.chars().skip(count.saturating_sub(max_chars)).collect()
    }
}

/// Runs code units through an isolation substrate.
pub struct SandboxExecutor {
    substrate: Arc<dyn IsolationSubstrate>,
    gate: Mutex<()>,
    output_limit: usize,
    permit_degraded: bool,
}

impl SandboxExecutor {
    /// Creates an executor over the given substrate.
    pub fn new(substrate: Arc<dyn IsolationSubstrate>) -> Self {
        Self {
            substrate,
            gate: Mutex::new(()),
            output_limit: DEFAULT_OUTPUT_LIMIT,
            permit_degraded: false,
        }
    }

    /// Sets the per-stream output cap in bytes.
    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit = bytes;
        self
    }

    /// Allows substrates that lack some isolation guarantees.
    ///
    /// Only for trusted code in development and tests.
    pub fn permit_degraded_isolation(mut self) -> Self {
        self.permit_degraded = true;
        self
    }

    /// Name of the underlying substrate.
    pub fn substrate_name(&self) -> &str {
        self.substrate.name()
    }

    /// Executes `code` under `limits`.
    ///
    /// At most one execution per executor is active at a time. The context is
    /// destroyed before this returns on every path, and also if the returned
    /// future is dropped mid-flight. On timeout the output printed before the
    /// kill is returned.
    pub async fn execute(
        &self,
        code: &CodeUnit,
        limits: &ResourceLimits,
    ) -> Result<ExecutionResult, ExecutionError> {
        self.check_policy(limits)?;

        let _active = self.gate.lock().await;
        self.substrate.prepare(code.language).await?;

        let start = Instant::now();
        let context = self.substrate.create(limits).await?;
        let mut context = ContextGuard::new(context);

        tracing::info!(
            substrate = %self.substrate.name(),
            context = %context.id(),
            language = %code.language,
            timeout = ?limits.wall_clock_timeout,
            "running code in sandbox"
        );

        let outcome = tokio::time::timeout(limits.wall_clock_timeout, context.run(code)).await;

        let result = match outcome {
            Ok(Ok(raw)) => self.classify(raw, start.elapsed()),
            Ok(Err(err)) if err.is_fatal() => {
                context.release().await;
                return Err(err);
            }
            Ok(Err(err)) => ExecutionResult {
                stdout: String::new(),
                stderr: err.to_string(),
                exit_code: None,
                duration: start.elapsed(),
                reason: TerminationReason::Crashed,
            },
            Err(_) => {
                context.stop().await;
                tracing::warn!(
                    context = %context.id(),
                    timeout = ?limits.wall_clock_timeout,
                    "sandbox execution timed out, killed"
                );
                let (stdout, stderr) = context.partial_output();
                self.timed_out(stdout, stderr, limits, start.elapsed())
            }
        };

        context.release().await;

        tracing::info!(
            reason = ?result.reason,
            exit_code = ?result.exit_code,
            duration = ?result.duration,
            "sandbox execution finished"
        );

        Ok(result)
    }

    fn check_policy(&self, limits: &ResourceLimits) -> Result<(), ExecutionError> {
        let validation = limits.validate();
        if !validation.is_valid() {
            return Err(ExecutionError::PolicyViolation(validation.errors.join("; ")));
        }

        let missing = self.substrate.capabilities().missing();
        if !missing.is_empty() {
            if !self.permit_degraded {
                return Err(ExecutionError::PolicyViolation(format!(
                    "substrate '{}' lacks {}",
                    self.substrate.name(),
                    missing.join(", ")
                )));
            }
            tracing::warn!(
                substrate = %self.substrate.name(),
                missing = ?missing,
                "running with degraded isolation"
            );
        }

        Ok(())
    }

    fn classify(&self, raw: RawOutcome, duration: Duration) -> ExecutionResult {
        let (exit_code, reason) = match raw.exit {
            _ if raw.memory_exceeded => (None, TerminationReason::ResourceLimit),
            ExitState::Exited(code) => (Some(code), TerminationReason::Completed),
            ExitState::Signaled(_) => (None, TerminationReason::Crashed),
        };

        ExecutionResult {
            stdout: truncate_output(raw.stdout, self.output_limit),
            stderr: truncate_output(raw.stderr, self.output_limit),
            exit_code,
            duration,
            reason,
        }
    }

    fn timed_out(
        &self,
        stdout: String,
        stderr: String,
        limits: &ResourceLimits,
        duration: Duration,
    ) -> ExecutionResult {
        let mut stderr = truncate_output(stderr, self.output_limit);
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&format!(
            "execution exceeded wall-clock timeout of {} ms",
            limits.wall_clock_timeout.as_millis()
        ));

        ExecutionResult {
            stdout: truncate_output(stdout, self.output_limit),
            stderr,
            exit_code: None,
            duration,
            reason: TerminationReason::Timeout,
        }
    }
}

/// Tears the context down if the execution is abandoned.
struct ContextGuard {
    context: Box<dyn IsolatedContext>,
}

impl ContextGuard {
    fn new(context: Box<dyn IsolatedContext>) -> Self {
        Self { context }
    }

    fn id(&self) -> &str {
        self.context.id()
    }

    async fn run(&mut self, code: &CodeUnit) -> Result<RawOutcome, ExecutionError> {
        self.context.run(code).await
    }

    async fn stop(&mut self) {
        self.context.stop().await;
    }

    fn partial_output(&self) -> (String, String) {
        self.context.partial_output()
    }

    async fn release(&mut self) {
        if let Err(e) = self.context.shutdown().await {
            tracing::warn!(error = %e, context = %self.context.id(), "failed to destroy sandbox context");
        }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if !self.context.is_destroyed() {
            self.context.terminate();
            if let Err(e) = self.context.destroy() {
                tracing::error!(error = %e, context = %self.context.id(), "failed to destroy sandbox context on drop");
            }
        }
    }
}

fn truncate_output(mut output: String, limit: usize) -> String {
    if output.len() <= limit {
        return output;
    }
    let mut cut = limit;
    while !output.is_char_boundary(cut) {
        cut -= 1;
    }
    output.truncate(cut);
    output.push_str(TRUNCATION_MARKER);
    output
}

//! Isolation substrate trait and types.
//!
//! A substrate is the concrete mechanism behind the sandbox (a container
//! runtime, a host process jail). The executor only ever talks to it through
//! [`IsolationSubstrate`] and [`IsolatedContext`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;

use super::code::{CodeUnit, Language};
use super::limits::ResourceLimits;

/// Isolation guarantees a substrate can enforce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstrateCapabilities {
    /// Code cannot reach any network.
    pub network_isolation: bool,
    /// Code cannot gain privileges (no setuid, no new capabilities).
    pub privilege_drop: bool,
    /// A hard memory ceiling is applied.
    pub memory_ceiling: bool,
}

impl SubstrateCapabilities {
    /// Every isolation guarantee.
    pub fn full() -> Self {
        Self {
            network_isolation: true,
            privilege_drop: true,
            memory_ceiling: true,
        }
    }

    /// Names of the guarantees this substrate lacks.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.network_isolation {
            missing.push("network isolation");
        }
        if !self.privilege_drop {
            missing.push("privilege drop");
        }
        if !self.memory_ceiling {
            missing.push("memory ceiling");
        }
        missing
    }
}

/// How the code's process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "code", rename_all = "snake_case")]
pub enum ExitState {
    /// Exited on its own with a status code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(i32),
}

/// What a context reports after running code to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit: ExitState,
    /// The substrate observed the memory ceiling being hit.
    pub memory_exceeded: bool,
}

/// A disposable, isolated execution context.
///
/// Contexts run at most one code unit. The executor tears them down through
/// the async [`stop`](Self::stop) and [`shutdown`](Self::shutdown), which must
/// return within a bounded time. `terminate` and `destroy` are synchronous so
/// they can also run from `Drop` when an execution is abandoned.
#[async_trait]
pub trait IsolatedContext: Send {
    /// Identifier of the context (container name, scratch path).
    fn id(&self) -> &str;

    /// Runs the code and waits for it to exit.
    ///
    /// Returns `LaunchFailure` if the code could not be started. Dropping the
    /// returned future must not leave the code running unattended.
    async fn run(&mut self, code: &CodeUnit) -> Result<RawOutcome, ExecutionError>;

    /// Forcibly kills everything the context started.
    fn terminate(&mut self);

    /// Releases every resource held by the context. Idempotent.
    fn destroy(&mut self) -> Result<(), ExecutionError>;

    /// Whether `destroy` has completed.
    fn is_destroyed(&self) -> bool;

    /// Output the code has written so far, also after `run` was abandoned.
    fn partial_output(&self) -> (String, String) {
        (String::new(), String::new())
    }

    /// Kills the running code without blocking the runtime.
    async fn stop(&mut self) {
        self.terminate();
    }

    /// Kills and releases everything without blocking the runtime.
    async fn shutdown(&mut self) -> Result<(), ExecutionError> {
        self.terminate();
        self.destroy()
    }
}

/// Factory for isolated contexts.
#[async_trait]
pub trait IsolationSubstrate: Send + Sync {
    /// Creates a fresh context with the given ceilings applied.
    async fn create(
        &self,
        limits: &ResourceLimits,
    ) -> Result<Box<dyn IsolatedContext>, ExecutionError>;

    /// Makes sure code in `language` can start, before its time budget begins.
    async fn prepare(&self, _language: Language) -> Result<(), ExecutionError> {
        Ok(())
    }

    /// Guarantees this substrate enforces.
    fn capabilities(&self) -> SubstrateCapabilities;

    /// Name of the substrate for logs.
    fn name(&self) -> &str;
}

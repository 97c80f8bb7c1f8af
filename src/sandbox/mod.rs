//! Sandbox module for running untrusted code.
//!
//! The [`SandboxExecutor`] runs one [`CodeUnit`] per call inside a disposable
//! context created by an [`IsolationSubstrate`]. Two substrates ship with the
//! crate: [`DockerSubstrate`] (full isolation) and [`ProcessSubstrate`]
//! (host processes, degraded isolation for development and tests).

use std::sync::Arc;

use crate::config::{SandboxConfig, SubstrateKind};

mod capture;
mod code;
mod docker;
mod executor;
mod limits;
mod process;
mod substrate;

pub use code::{CodeUnit, Language};
pub use docker::{DockerConfig, DockerContext, DockerSubstrate};
pub use executor::{ExecutionResult, SandboxExecutor, TerminationReason, DEFAULT_OUTPUT_LIMIT};
pub use limits::ResourceLimits;
pub use process::{ProcessContext, ProcessSubstrate};
pub use substrate::{
    ExitState, IsolatedContext, IsolationSubstrate, RawOutcome, SubstrateCapabilities,
};

pub(crate) use limits::millis;

/// Builds the executor described by `config`.
pub fn executor_from_config(config: &SandboxConfig) -> SandboxExecutor {
    let substrate: Arc<dyn IsolationSubstrate> = match config.substrate {
        SubstrateKind::Docker => {
            let docker = DockerSubstrate::new(config.docker.clone());
            match &config.scratch_root {
                Some(root) => Arc::new(docker.with_scratch_root(root.clone())),
                None => Arc::new(docker),
            }
        }
        SubstrateKind::Process => match &config.scratch_root {
            Some(root) => Arc::new(ProcessSubstrate::with_scratch_root(root.clone())),
            None => Arc::new(ProcessSubstrate::new()),
        },
    };

    let executor = SandboxExecutor::new(substrate).with_output_limit(config.output_limit_bytes);
    if config.permit_degraded_isolation {
        executor.permit_degraded_isolation()
    } else {
        executor
    }
}

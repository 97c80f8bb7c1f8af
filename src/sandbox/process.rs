//! Host-process substrate.
//!
//! Runs code as a child process of the host in a throwaway scratch directory,
//! in its own process group, under a `ulimit -v` memory ceiling. There is no
//! network or privilege isolation, so the executor only accepts this
//! substrate in degraded mode.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;

use crate::error::ExecutionError;

use super::capture::OutputCapture;
use super::code::CodeUnit;
use super::limits::ResourceLimits;
use super::substrate::{
    ExitState, IsolatedContext, IsolationSubstrate, RawOutcome, SubstrateCapabilities,
};

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Markers interpreters print when an allocation fails under `ulimit -v`.
const MEMORY_MARKERS: &[&str] = &["MemoryError", "Cannot allocate memory", "out of memory"];

/// Substrate that runs code as host processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessSubstrate {
    /// Where scratch directories are created. Defaults to the system temp dir.
    scratch_root: Option<PathBuf>,
}

impl ProcessSubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates scratch directories under `root` instead of the system temp dir.
    pub fn with_scratch_root(root: PathBuf) -> Self {
        Self {
            scratch_root: Some(root),
        }
    }
}

#[async_trait]
impl IsolationSubstrate for ProcessSubstrate {
    async fn create(
        &self,
        limits: &ResourceLimits,
    ) -> Result<Box<dyn IsolatedContext>, ExecutionError> {
        let scratch = scratch_dir(self.scratch_root.as_ref())?;
        let id = scratch.path().display().to_string();

        tracing::debug!(scratch = %id, "created process sandbox scratch dir");

        Ok(Box::new(ProcessContext {
            id,
            scratch: Some(scratch),
            memory_cap_kib: limits.memory_cap_kib(),
            pgid: None,
            capture: OutputCapture::new(),
        }))
    }

    fn capabilities(&self) -> SubstrateCapabilities {
        SubstrateCapabilities {
            network_isolation: false,
            privilege_drop: false,
            memory_ceiling: true,
        }
    }

    fn name(&self) -> &str {
        "process"
    }
}

pub(crate) fn scratch_dir(root: Option<&PathBuf>) -> Result<TempDir, ExecutionError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("agent-crew-");
    let dir = match root {
        Some(root) => {
            std::fs::create_dir_all(root).map_err(|e| {
                ExecutionError::LaunchFailure(format!("failed to create scratch root: {}", e))
            })?;
            builder.tempdir_in(root)
        }
        None => builder.tempdir(),
    };
    dir.map_err(|e| ExecutionError::LaunchFailure(format!("failed to create scratch dir: {}", e)))
}

/// One scratch directory plus the process group running in it.
pub struct ProcessContext {
    id: String,
    scratch: Option<TempDir>,
    memory_cap_kib: u64,
    /// Process group of the running code, while it runs.
    pgid: Option<u32>,
    capture: OutputCapture,
}

impl ProcessContext {
    /// Scratch directory path, while the context is alive.
    pub fn scratch_path(&self) -> Option<PathBuf> {
        self.scratch.as_ref().map(|dir| dir.path().to_path_buf())
    }
}

#[async_trait]
impl IsolatedContext for ProcessContext {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&mut self, code: &CodeUnit) -> Result<RawOutcome, ExecutionError> {
        let scratch = self
            .scratch_path()
            .ok_or_else(|| ExecutionError::LaunchFailure("context already destroyed".into()))?;

        let script = scratch.join(code.language.script_name());
        std::fs::write(&script, &code.source).map_err(|e| {
            ExecutionError::LaunchFailure(format!("failed to write script: {}", e))
        })?;

        // `$0` is the interpreter and `$@` the script, so exec replaces the
        // limiting shell and the interpreter becomes the group leader's image.
        let prelude = format!(
            "ulimit -v {} 2>/dev/null; exec \"$0\" \"$@\"",
            self.memory_cap_kib
        );
        let path = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&prelude)
            .arg(code.language.interpreter())
            .arg(&script)
            .current_dir(&scratch)
            .env_clear()
            .env("PATH", path)
            .env("HOME", &scratch)
            .env("TMPDIR", &scratch)
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutionError::LaunchFailure(format!("failed to spawn sh: {}", e)))?;

        self.pgid = child.id();
        self.capture = OutputCapture::new();
        let readers = self.capture.attach(&mut child);

        let status = child.wait().await.map_err(|e| {
            ExecutionError::Teardown(format!("failed to wait for sandboxed process: {}", e))
        })?;
        for reader in readers {
            let _ = reader.await;
        }
        self.pgid = None;

        let (stdout, stderr) = self.capture.snapshot();

        let exit = match (status.code(), status.signal()) {
            (Some(code), _) => ExitState::Exited(code),
            (None, Some(signal)) => ExitState::Signaled(signal),
            (None, None) => ExitState::Signaled(0),
        };
        let memory_exceeded = exit != ExitState::Exited(0)
            && MEMORY_MARKERS.iter().any(|marker| stderr.contains(marker));

        Ok(RawOutcome {
            stdout,
            stderr,
            exit,
            memory_exceeded,
        })
    }

    fn terminate(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };

        let status = std::process::Command::new("kill")
            .args(["-KILL", "--", &format!("-{}", pgid)])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match status {
            Ok(status) if status.success() => {
                tracing::debug!(pgid = pgid, "killed sandbox process group");
            }
            Ok(_) => {
                tracing::debug!(pgid = pgid, "sandbox process group already gone");
            }
            Err(e) => {
                tracing::warn!(error = %e, pgid = pgid, "failed to kill sandbox process group");
            }
        }
    }

    fn destroy(&mut self) -> Result<(), ExecutionError> {
        self.terminate();
        if let Some(scratch) = self.scratch.take() {
            scratch.close().map_err(|e| {
                ExecutionError::Teardown(format!("failed to remove scratch dir {}: {}", self.id, e))
            })?;
        }
        Ok(())
    }

    fn is_destroyed(&self) -> bool {
        self.scratch.is_none()
    }

    fn partial_output(&self) -> (String, String) {
        self.capture.snapshot()
    }
}

impl Drop for ProcessContext {
    fn drop(&mut self) {
        if !self.is_destroyed() {
            if let Err(e) = self.destroy() {
                tracing::error!(error = %e, "failed to cleanup process sandbox on drop");
            }
        }
    }
}

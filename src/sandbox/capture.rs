//! Incremental capture of a sandboxed child's output.
//!
//! Reader tasks copy each stream into a shared buffer as it arrives, so the
//! output printed before a timeout kill is still available afterwards.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::task::JoinHandle;

/// Bytes kept per stream. Later output is drained and dropped.
const CAPTURE_LIMIT: usize = 1024 * 1024;

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

/// Stdout and stderr of one child, readable while it still runs.
#[derive(Debug, Clone, Default)]
pub(crate) struct OutputCapture {
    stdout: SharedBuffer,
    stderr: SharedBuffer,
}

impl OutputCapture {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Starts copying the child's piped streams. The handles finish at EOF.
    pub(crate) fn attach(&self, child: &mut Child) -> Vec<JoinHandle<()>> {
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(copy_into(stdout, self.stdout.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(copy_into(stderr, self.stderr.clone())));
        }
        readers
    }

    /// What has been captured so far, as lossy UTF-8.
    pub(crate) fn snapshot(&self) -> (String, String) {
        (read_lossy(&self.stdout), read_lossy(&self.stderr))
    }
}

async fn copy_into<R: AsyncRead + Unpin>(mut stream: R, buffer: SharedBuffer) {
    let mut chunk = [0u8; 8192];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut buffer = match buffer.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                let room = CAPTURE_LIMIT.saturating_sub(buffer.len());
                buffer.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
}

fn read_lossy(buffer: &SharedBuffer) -> String {
    let buffer = match buffer.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    String::from_utf8_lossy(&buffer).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    #[tokio::test]
    async fn output_is_visible_before_the_child_exits() {
        let capture = OutputCapture::new();
        let mut child = Command::new("sh")
            .args(["-c", "echo early; echo noisy >&2; sleep 5"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let _readers = capture.attach(&mut child);

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        assert_eq!(capture.snapshot(), ("early\n".to_string(), "noisy\n".to_string()));
        child.kill().await.unwrap();
    }
}

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use super::protocol::{ExecRequest, ExecResponse};

/// Exit code reported when the request timeout kills the command.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Shared deadline for draining both pipes once the command has finished.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct Captured {
    data: Vec<u8>,
    dropped: u64,
}

impl Captured {
    fn into_text(self) -> String {
        let mut text = String::from_utf8_lossy(&self.data).into_owned();
        if self.dropped > 0 {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&format!("[output truncated: {} bytes dropped]\n", self.dropped));
        }
        text
    }
}

/// Runs commands on behalf of the agent.
///
/// Every command runs in its own process group. The whole group is killed
/// when the command exits, times out, or the request future is dropped, so
/// nothing it spawned outlives the request.
///
/// stdout and stderr captured up to `max_output_bytes` each; the rest is drained and counted
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    max_output_bytes: usize,
}

impl CommandExecutor {
    pub fn new(max_output_bytes: usize) -> Self {
        Self { max_output_bytes }
    }

    pub async fn execute(&self, req: &ExecRequest) -> ExecResponse {
        let start = Instant::now();
        tracing::info!(
            command = %req.command,
            args = req.args.len(),
            timeout_seconds = req.timeout_seconds,
            "Executing command"
        );

        let mut cmd = Command::new(&req.command);
        cmd.args(&req.args)
            .stdin(if req.input.is_empty() {
                Stdio::null()
            } else {
                Stdio::piped()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        for entry in &req.env {
            match entry.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    cmd.env(key, value);
                }
                _ => tracing::warn!(entry = %entry, "Ignoring malformed env entry"),
            }
        }
        if !req.work_dir.is_empty() {
            cmd.current_dir(&req.work_dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return Self::launch_failure(req, e, start),
        };
        let mut group = ProcessGroup::of(&child);

        if let Some(mut stdin) = child.stdin.take() {
            let input = req.input.clone().into_bytes();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    tracing::debug!(error = %e, "Child closed stdin early");
                }
            });
        }

        let stdout = Arc::new(Mutex::new(Captured::default()));
        let stderr = Arc::new(Mutex::new(Captured::default()));
        let readers = [
            child
                .stdout
                .take()
                .map(|r| tokio::spawn(read_capped(r, self.max_output_bytes, stdout.clone()))),
            child
                .stderr
                .take()
                .map(|r| tokio::spawn(read_capped(r, self.max_output_bytes, stderr.clone()))),
        ];

        let waited = if req.timeout_seconds > 0 {
            match tokio::time::timeout(Duration::from_secs(req.timeout_seconds), child.wait()).await
            {
                Ok(status) => Some(status),
                Err(_) => {
                    group.kill();
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "Failed to kill timed out command");
                    }
                    None
                }
            }
        } else {
            Some(child.wait().await)
        };
        // Background processes left by the command hold the pipes open.
        group.kill();

        let mut readers: Vec<_> = readers.into_iter().flatten().collect();
        let drained = tokio::time::timeout(DRAIN_GRACE, async {
            for reader in readers.iter_mut() {
                let _ = reader.await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::debug!("Output pipes still open after grace period");
            for reader in &readers {
                reader.abort();
            }
        }

        let stdout = std::mem::take(&mut *stdout.lock()).into_text();
        let mut stderr = std::mem::take(&mut *stderr.lock()).into_text();
        let exit_code = match waited {
            Some(Ok(status)) => exit_code_of(status),
            Some(Err(e)) => {
                stderr.push_str(&format!("failed to wait for command: {}\n", e));
                1
            }
            None => {
                stderr.push_str(&format!("timed out after {}s\n", req.timeout_seconds));
                TIMEOUT_EXIT_CODE
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            command = %req.command,
            exit_code,
            duration_ms,
            "Command finished"
        );

        ExecResponse {
            exit_code,
            stdout,
            stderr,
            duration_ms,
        }
    }

    fn launch_failure(req: &ExecRequest, e: io::Error, start: Instant) -> ExecResponse {
        let exit_code = match e.kind() {
            io::ErrorKind::NotFound => 127,
            io::ErrorKind::PermissionDenied => 126,
            _ => 1,
        };
        tracing::error!(command = %req.command, error = %e, exit_code, "Command failed to start");
        ExecResponse {
            exit_code,
            stdout: String::new(),
            stderr: format!("failed to start {}: {}\n", req.command, e),
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

/// Process group led by a spawned child. Killed on drop.
struct ProcessGroup {
    pgid: Option<Pid>,
}

impl ProcessGroup {
    fn of(child: &tokio::process::Child) -> Self {
        Self {
            pgid: child.id().map(|id| Pid::from_raw(id as i32)),
        }
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            match killpg(pgid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => tracing::warn!(pgid = %pgid, error = %e, "Failed to kill process group"),
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

async fn read_capped<R>(mut reader: R, limit: usize, into: Arc<Mutex<Captured>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "Output pipe read failed");
                return;
            }
        };
        let mut captured = into.lock();
        let room = limit.saturating_sub(captured.data.len());
        let keep = room.min(n);
        captured.data.extend_from_slice(&buf[..keep]);
        captured.dropped += (n - keep) as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_marker() {
        let captured = Captured {
            data: b"abc".to_vec(),
            dropped: 10,
        };
        assert_eq!(captured.into_text(), "abc\n[output truncated: 10 bytes dropped]\n");

        let clean = Captured {
            data: b"abc".to_vec(),
            dropped: 0,
        };
        assert_eq!(clean.into_text(), "abc");
    }

    #[test]
    fn signal_exit_maps_above_128() {
        let killed = ExitStatus::from_raw(9);
        assert_eq!(exit_code_of(killed), 137);

        let exited = ExitStatus::from_raw(3 << 8);
        assert_eq!(exit_code_of(exited), 3);
    }
}

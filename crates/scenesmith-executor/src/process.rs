use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{ExecutorError, Result};

/// Per-stream capture cap per spec.md §4.2; beyond this the tail is dropped
/// and replaced with a truncation marker.
const CAPTURE_CAP_BYTES: usize = 16 * 1024 * 1024;
const TRUNCATION_MARKER: &str = "\n...[truncated, exceeded 16MiB capture cap]...\n";
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub wall_time: Duration,
}

/// Runs Blender subprocesses under a shared concurrency ceiling. One
/// `Executor` is shared across every workflow instance in the process; the
/// semaphore is the only state it holds.
pub struct Executor {
    slots: Arc<Semaphore>,
}

impl Executor {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Launch `blender_path` against `script_path`, headless, and wait for
    /// completion, `timeout`, or `token` being cancelled — spec.md §5
    /// suspension point (iii) requires the subprocess wait to honor
    /// cancellation in bounded time, the same as the timeout path. Blocks on
    /// the concurrency semaphore first, so excess concurrent calls queue
    /// rather than overcommit the host.
    pub async fn run(
        &self,
        script_path: &Path,
        blender_path: &str,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let _permit = self.slots.acquire().await.expect("executor semaphore never closes");
        let started = Instant::now();

        let mut cmd = Command::new(blender_path);
        cmd.arg("--background")
            .arg("--python")
            .arg(script_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.as_std_mut().process_group(0);
        }

        let mut child = cmd.spawn().map_err(|source| ExecutorError::SpawnFailed {
            path: blender_path.to_string(),
            source,
        })?;
        let pid = child.id();
        let mut stdout_pipe = child.stdout.take().expect("stdout piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr piped");

        let stdout_task = tokio::spawn(async move { capture_capped(&mut stdout_pipe).await });
        let stderr_task = tokio::spawn(async move { capture_capped(&mut stderr_pipe).await });

        let wait_result = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            res = tokio::time::timeout(timeout, child.wait()) => Some(res),
        };

        match wait_result {
            Some(Ok(Ok(status))) => {
                let stdout = stdout_task.await.unwrap_or_default();
                let stderr = stderr_task.await.unwrap_or_default();
                let wall_time = started.elapsed();
                let exit_code = status.code();
                if status.success() {
                    Ok(ExecutionOutcome {
                        exit_code,
                        stdout,
                        stderr,
                        wall_time,
                    })
                } else {
                    Err(ExecutorError::NonZeroExit {
                        code: exit_code,
                        captured_stderr: stderr,
                    })
                }
            }
            Some(Ok(Err(_wait_err))) => {
                let stderr = stderr_task.await.unwrap_or_default();
                Err(ExecutorError::NonZeroExit {
                    code: None,
                    captured_stderr: stderr,
                })
            }
            Some(Err(_elapsed)) => {
                warn!(?pid, timeout_s = timeout.as_secs(), "blender execution timed out, terminating");
                terminate(pid, &mut child).await;
                let stderr = stderr_task.await.unwrap_or_default();
                let _ = stdout_task.await;
                Err(ExecutorError::Timeout {
                    timeout_s: timeout.as_secs(),
                    captured_stderr: stderr,
                })
            }
            None => {
                info!(?pid, "blender execution cancelled, terminating");
                terminate(pid, &mut child).await;
                let _ = stderr_task.await;
                let _ = stdout_task.await;
                Err(ExecutorError::Cancelled)
            }
        }
    }
}

/// Graceful signal first, then force after the grace window, per spec.md §4.2.
async fn terminate(pid: Option<u32>, child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        send_signal_to_group(pid, "TERM").await;
        if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_ok() {
            return;
        }
        send_signal_to_group(pid, "KILL").await;
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

#[cfg(unix)]
async fn send_signal_to_group(pid: u32, signal: &str) {
    // The child was spawned in its own process group (pgid == pid), so
    // `-pid` addresses the whole group rather than just the leader.
    let status = Command::new("kill")
        .arg(format!("-{signal}"))
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(err) = status {
        info!(pid, signal, %err, "failed to signal blender process group");
    }
}

async fn capture_capped<R: AsyncRead + Unpin>(reader: &mut R) -> String {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if buf.len() + n > CAPTURE_CAP_BYTES {
                    let remaining = CAPTURE_CAP_BYTES.saturating_sub(buf.len());
                    buf.extend_from_slice(&chunk[..remaining.min(n)]);
                    buf.extend_from_slice(TRUNCATION_MARKER.as_bytes());
                    // Drain the rest of the stream so the child isn't blocked on a full pipe.
                    let mut sink = [0u8; 8192];
                    while reader.read(&mut sink).await.unwrap_or(0) > 0 {}
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn happy_path_captures_stdout_and_exit_code() {
        let executor = Executor::new(2);
        let script = tempfile::NamedTempFile::new().unwrap();
        let token = CancellationToken::new();
        let outcome = executor
            .run(script.path(), "/bin/echo", Duration::from_secs(5), &token)
            .await;
        // `/bin/echo` is not blender and ignores --background/--python, but it exits
        // 0 and exercises the spawn/capture/wait path without a real blender binary.
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn nonexistent_binary_surfaces_spawn_failed() {
        let executor = Executor::new(2);
        let script = tempfile::NamedTempFile::new().unwrap();
        let token = CancellationToken::new();
        let err = executor
            .run(script.path(), "/nonexistent/blender-binary", Duration::from_secs(5), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::SpawnFailed { .. }));
    }

    fn hang_script() -> tempfile::NamedTempFile {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        // A real blender binary tolerates `--background --python <path>`; a stub
        // test binary ignores its argv entirely and just hangs, so it needs to be
        // a script rather than /bin/sleep (which would choke on those flags).
        let mut hang_script = tempfile::NamedTempFile::new().unwrap();
        writeln!(hang_script, "#!/bin/sh\nsleep 5\n").unwrap();
        let mut perms = hang_script.as_file().metadata().unwrap().permissions();
        perms.set_mode(0o755);
        hang_script.as_file().set_permissions(perms).unwrap();
        hang_script
    }

    #[tokio::test]
    async fn timeout_is_surfaced_and_process_is_gone() {
        let hang_script = hang_script();
        let executor = Executor::new(1);
        let script = tempfile::NamedTempFile::new().unwrap();
        let token = CancellationToken::new();
        let err = executor
            .run(script.path(), hang_script.path().to_str().unwrap(), Duration::from_millis(200), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Timeout { .. }));
    }

    #[tokio::test]
    async fn cancellation_terminates_the_subprocess_before_the_timeout() {
        let hang_script = hang_script();
        let executor = Executor::new(1);
        let script = tempfile::NamedTempFile::new().unwrap();
        let token = CancellationToken::new();
        let cancel_token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_token.cancel();
        });
        let started = Instant::now();
        let err = executor
            .run(script.path(), hang_script.path().to_str().unwrap(), Duration::from_secs(30), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn semaphore_serializes_beyond_capacity() {
        let executor = Arc::new(Executor::new(1));
        let script = tempfile::NamedTempFile::new().unwrap();
        let path = script.path().to_path_buf();
        let e1 = executor.clone();
        let p1 = path.clone();
        let token = CancellationToken::new();
        let t1 = token.clone();
        let t2 = token.clone();
        let h1 = tokio::spawn(async move { e1.run(&p1, "/bin/echo", Duration::from_secs(5), &t1).await });
        let h2 = tokio::spawn(async move { executor.run(&path, "/bin/echo", Duration::from_secs(5), &t2).await });
        let (r1, r2) = tokio::join!(h1, h2);
        assert!(r1.unwrap().is_ok());
        assert!(r2.unwrap().is_ok());
    }
}

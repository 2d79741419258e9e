//! Host process backend.
//!
//! Runs each invocation as a direct child in its own session, with rlimits
//! for CPU time, address space, core dumps and file size applied between
//! fork and exec. The whole process group is killed on timeout and whenever
//! the invocation is dropped. There is no filesystem or network isolation.

use super::{
    memory_exhaustion, push_capped, scratch_dir, ExecOutput, ExecutionLimits, Invocation, Sandbox,
};
use crate::error::{ResourceKind, SandboxError};
use anyhow::Context;
use async_trait::async_trait;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setsid, Pid};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Largest file a sandboxed program may write.
const MAX_FILE_BYTES: u64 = 64 * 1024 * 1024;

/// Kills the child's process group when dropped, including grandchildren
/// the program may have left behind.
struct ProcessGroupGuard {
    pgid: Option<Pid>,
}

impl ProcessGroupGuard {
    fn kill(&self) {
        if let Some(pgid) = self.pgid {
            // ESRCH just means everything already exited.
            let _ = killpg(pgid, Signal::SIGKILL);
        }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

pub struct ProcessSandbox {
    scratch_root: Option<PathBuf>,
}

impl ProcessSandbox {
    pub fn new(scratch_root: Option<PathBuf>) -> Self {
        warn!("Process sandbox enabled: submissions run on the host without filesystem or network isolation");
        Self { scratch_root }
    }
}

/// Read at most `cap` bytes. On overflow the process group is killed so the
/// other stream reaches EOF too. Returns the captured bytes and whether the
/// stream was read to completion.
async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    cap: usize,
    guard: &ProcessGroupGuard,
) -> (Vec<u8>, bool) {
    let mut captured = Vec::new();
    let mut complete = true;
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if !push_capped(&mut captured, &chunk[..n], cap) {
                    guard.kill();
                    complete = false;
                    break;
                }
            }
        }
    }
    (captured, complete)
}

fn seconds_ceil(duration: std::time::Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    fn name(&self) -> &'static str {
        "process"
    }

    #[tracing::instrument(
        skip(self, invocation, limits),
        fields(language = %invocation.language, purpose = %invocation.purpose)
    )]
    async fn execute(
        &self,
        invocation: &Invocation,
        limits: &ExecutionLimits,
    ) -> Result<ExecOutput, SandboxError> {
        let scratch = scratch_dir(self.scratch_root.as_deref(), "gradebox-run-")
            .context("Failed to create scratch directory")?;

        let artifact_mount = invocation.artifact_dir.to_string_lossy().into_owned();
        let argv = invocation.resolved_command(&artifact_mount);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("Empty command for {} step", invocation.purpose))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(scratch.path())
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string()))
            .env("HOME", scratch.path())
            .env("TMPDIR", scratch.path())
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let cpu_secs = seconds_ceil(limits.cpu_time);
        let address_space = limits
            .enforce_address_space
            .then(|| limits.memory_mb.saturating_mul(1024 * 1024));

        // SAFETY: the closure runs between fork and exec and only makes
        // async-signal-safe system calls.
        unsafe {
            command.pre_exec(move || {
                setsid()?;
                setrlimit(Resource::RLIMIT_CPU, cpu_secs, cpu_secs + 1)?;
                if let Some(bytes) = address_space {
                    setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
                }
                setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
                setrlimit(Resource::RLIMIT_FSIZE, MAX_FILE_BYTES, MAX_FILE_BYTES)?;
                Ok(())
            });
        }

        let start_time = Instant::now();
        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", program))?;

        let guard = ProcessGroupGuard {
            pgid: child.id().map(|id| Pid::from_raw(id as i32)),
        };

        if let Some(mut stdin) = child.stdin.take() {
            let input = invocation.stdin.clone();
            // Programs that never read stdin must not stall on a full pipe.
            tokio::spawn(async move {
                let _ = stdin.write_all(input.as_bytes()).await;
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("stderr was not captured"))?;

        let cap = limits.max_output_bytes;
        let execution_future = async {
            let ((out, out_complete), (err, err_complete)) = tokio::join!(
                read_capped(stdout, cap, &guard),
                read_capped(stderr, cap, &guard)
            );
            let overflowed = !(out_complete && err_complete);
            let status = child.wait().await;
            (status, out, err, overflowed)
        };

        let outcome = tokio::time::timeout(limits.wall_time, execution_future).await;
        let duration = start_time.elapsed();

        let (status, out, err, overflowed) = match outcome {
            Ok(result) => result,
            Err(_) => {
                guard.kill();
                let _ = child.wait().await;
                warn!(
                    execution_time_ms = duration.as_millis() as u64,
                    timeout_ms = limits.wall_time.as_millis() as u64,
                    "Execution timed out"
                );
                return Err(SandboxError::Timeout {
                    limit_ms: limits.wall_time.as_millis() as u64,
                });
            }
        };

        let status = status.context("Failed to wait for child process")?;
        let stdout = String::from_utf8_lossy(&out).into_owned();
        let stderr = String::from_utf8_lossy(&err).into_owned();

        if overflowed {
            return Err(SandboxError::Resource {
                kind: ResourceKind::Output,
                detail: format!("program wrote more than {} bytes", cap),
            });
        }

        if let Some(signal) = status.signal() {
            if signal == Signal::SIGXCPU as i32 || (signal == Signal::SIGKILL as i32 && duration >= limits.cpu_time) {
                return Err(SandboxError::Resource {
                    kind: ResourceKind::CpuTime,
                    detail: format!("exceeded {} s of CPU time", cpu_secs),
                });
            }
        }

        let exit_code = match (status.code(), status.signal()) {
            (Some(code), _) => code as i64,
            (None, Some(signal)) => 128 + signal as i64,
            (None, None) => -1,
        };

        if exit_code != 0 {
            if let Some(marker) = memory_exhaustion(&stderr) {
                return Err(SandboxError::Resource {
                    kind: ResourceKind::Memory,
                    detail: format!("{} (limit {} MB)", marker, limits.memory_mb),
                });
            }
        }

        debug!(
            exit_code,
            execution_time_ms = duration.as_millis() as u64,
            "Process finished"
        );

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
            duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::Purpose;
    use gradebox_common::types::Language;
    use std::time::Duration;

    fn limits(wall_ms: u64) -> ExecutionLimits {
        ExecutionLimits {
            wall_time: Duration::from_millis(wall_ms),
            cpu_time: Duration::from_millis(wall_ms * 2),
            memory_mb: 256,
            cpu_share: 1.0,
            max_processes: 16,
            max_output_bytes: 64 * 1024,
            enforce_address_space: false,
        }
    }

    fn shell(artifact_dir: &std::path::Path, script: &str, stdin: &str) -> Invocation {
        Invocation {
            language: Language::Python,
            purpose: Purpose::Run,
            command: vec!["/bin/sh".into(), "-c".into(), script.into()],
            stdin: stdin.into(),
            artifact_dir: artifact_dir.to_path_buf(),
            writable_artifact: false,
        }
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = ProcessSandbox::new(Some(root.path().to_path_buf()));
        let invocation = shell(root.path(), "read line; echo \"got $line\"; echo oops >&2; exit 4", "hello\n");

        let output = sandbox.execute(&invocation, &limits(5_000)).await.unwrap();
        assert_eq!(output.stdout, "got hello\n");
        assert_eq!(output.stderr, "oops\n");
        assert_eq!(output.exit_code, 4);
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_artifact_placeholder_resolves_to_directory() {
        let root = tempfile::tempdir().unwrap();
        let artifact = tempfile::tempdir().unwrap();
        std::fs::write(artifact.path().join("data.txt"), "payload").unwrap();
        let sandbox = ProcessSandbox::new(Some(root.path().to_path_buf()));
        let invocation = shell(artifact.path(), "cat %ARTIFACT%/data.txt", "");

        let output = sandbox.execute(&invocation, &limits(5_000)).await.unwrap();
        assert_eq!(output.stdout, "payload");
        assert!(output.success());
    }

    #[tokio::test]
    async fn test_runs_in_fresh_scratch_directory() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = ProcessSandbox::new(Some(root.path().to_path_buf()));
        let invocation = shell(root.path(), "touch marker; ls", "");

        let first = sandbox.execute(&invocation, &limits(5_000)).await.unwrap();
        let second = sandbox.execute(&invocation, &limits(5_000)).await.unwrap();
        assert_eq!(first.stdout, "marker\n");
        assert_eq!(second.stdout, "marker\n");
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_kills_process_group() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = ProcessSandbox::new(Some(root.path().to_path_buf()));
        let invocation = shell(root.path(), "sleep 30 & sleep 30; wait", "");

        let start = Instant::now();
        let err = sandbox.execute(&invocation, &limits(200)).await.unwrap_err();
        assert!(matches!(err, SandboxError::Timeout { limit_ms: 200 }));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_output_flood_is_a_resource_error() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = ProcessSandbox::new(Some(root.path().to_path_buf()));
        let invocation = shell(root.path(), "while :; do echo aaaaaaaaaaaaaaaa; done", "");

        let err = sandbox.execute(&invocation, &limits(5_000)).await.unwrap_err();
        assert!(matches!(
            err,
            SandboxError::Resource {
                kind: ResourceKind::Output,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_memory_diagnostic_is_a_resource_error() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = ProcessSandbox::new(Some(root.path().to_path_buf()));
        let invocation = shell(root.path(), "echo 'MemoryError' >&2; exit 1", "");

        let err = sandbox.execute(&invocation, &limits(5_000)).await.unwrap_err();
        assert!(matches!(
            err,
            SandboxError::Resource {
                kind: ResourceKind::Memory,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = ProcessSandbox::new(Some(root.path().to_path_buf()));
        let mut invocation = shell(root.path(), "", "");
        invocation.command = vec!["/definitely/not/a/program".into()];

        let err = sandbox.execute(&invocation, &limits(1_000)).await.unwrap_err();
        assert!(matches!(err, SandboxError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_ignores_unread_stdin() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = ProcessSandbox::new(Some(root.path().to_path_buf()));
        let big_input = "1\n".repeat(1024 * 1024);
        let invocation = shell(root.path(), "echo done", &big_input);

        let output = sandbox.execute(&invocation, &limits(5_000)).await.unwrap();
        assert_eq!(output.stdout, "done\n");
    }

    #[tokio::test]
    async fn test_huge_memory_limit_does_not_overflow() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = ProcessSandbox::new(Some(root.path().to_path_buf()));
        let invocation = shell(root.path(), "echo fine", "");
        let unbounded = ExecutionLimits {
            memory_mb: u64::MAX,
            enforce_address_space: true,
            ..limits(5_000)
        };

        let output = sandbox.execute(&invocation, &unbounded).await.unwrap();
        assert_eq!(output.stdout, "fine\n");
    }
}

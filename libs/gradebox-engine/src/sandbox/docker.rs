//! Docker backend: one short-lived hardened container per invocation.

use super::{
    memory_exhaustion, push_capped, scratch_dir, ExecOutput, ExecutionLimits, Invocation, Sandbox,
};
use crate::config::LanguageConfigManager;
use crate::error::{ResourceKind, SandboxError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use gradebox_common::types::Language;
use nix::unistd::{getgid, getuid};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

const ARTIFACT_MOUNT: &str = "/workspace";
const SCRATCH_MOUNT: &str = "/scratch";
const STDIN_FILE: &str = "stdin.txt";

/// Container cleanup guard - guarantees container removal on drop, even when
/// the invocation is cancelled mid-flight.
struct ContainerGuard<'a> {
    docker: &'a Docker,
    container_id: String,
}

impl<'a> ContainerGuard<'a> {
    fn new(docker: &'a Docker, container_id: String) -> Self {
        Self {
            docker,
            container_id,
        }
    }
}

impl<'a> Drop for ContainerGuard<'a> {
    fn drop(&mut self) {
        // Drop cannot be async; hand removal to the runtime.
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };

            if let Err(e) = docker.remove_container(&container_id, Some(remove_options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to clean up container");
            }
        });
    }
}

/// `uid:gid` of the grader process.
fn container_user() -> String {
    format!("{}:{}", getuid(), getgid())
}

/// Docker-based sandbox
///
/// **Container Rules:**
/// 1. Pulls the language image if it is not present
/// 2. Network disabled, all capabilities dropped, `no-new-privileges`
/// 3. Read-only root filesystem with a small writable tmpfs at /tmp
/// 4. Memory (swap included), CPU share and PID limits from `ExecutionLimits`
/// 5. Artifact mounted at /workspace (read-only unless compiling)
/// 6. Fresh scratch directory mounted at /scratch, which is the working directory
/// 7. Runs as the grader's uid/gid, never as the image's root user
/// 8. Container force-removed by a drop guard on every path
pub struct DockerSandbox {
    docker: Docker,
    config_manager: LanguageConfigManager,
    scratch_root: Option<PathBuf>,
}

impl DockerSandbox {
    /// Connect to the local Docker daemon
    pub fn new_with_config(
        config_manager: &LanguageConfigManager,
        scratch_root: Option<PathBuf>,
    ) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;

        Ok(Self {
            docker,
            config_manager: config_manager.clone(),
            scratch_root,
        })
    }

    /// Get the Docker image name for a language
    fn get_image_name(&self, language: &Language) -> String {
        if let Ok(image) = self.config_manager.get_image(language) {
            return image;
        }

        match language {
            Language::Python => "python:3.11-alpine".to_string(),
            Language::Javascript => "node:20-alpine".to_string(),
            Language::Cpp => "gcc:13".to_string(),
            Language::Java => "eclipse-temurin:21-jdk".to_string(),
        }
    }

    /// Ensure Docker image is available (pull if needed)
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "Image cache hit");
            return Ok(());
        }

        warn!(image, "Image cache miss, pulling");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.context("Failed to pull Docker image")?;
        }

        info!(image, "Image pulled");
        Ok(())
    }

    fn container_config(
        &self,
        invocation: &Invocation,
        limits: &ExecutionLimits,
        image: String,
        scratch: &std::path::Path,
    ) -> Config<String> {
        let memory_bytes = limits.memory_mb.saturating_mul(1024 * 1024).min(i64::MAX as u64) as i64;
        let artifact_mode = if invocation.writable_artifact { "rw" } else { "ro" };

        // Stdin is staged as a file; `exec` keeps the program as the
        // container's main process.
        let mut cmd = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("exec \"$@\" < {}/{}", SCRATCH_MOUNT, STDIN_FILE),
            "sh".to_string(),
        ];
        cmd.extend(invocation.resolved_command(ARTIFACT_MOUNT));

        let mut tmpfs = HashMap::new();
        tmpfs.insert("/tmp".to_string(), "rw,size=64m,exec".to_string());

        Config {
            image: Some(image),
            cmd: Some(cmd),
            // Run as the grader's own user so everything written to the bind
            // mounts stays removable on the host.
            user: Some(container_user()),
            entrypoint: Some(vec![]),
            env: Some(vec![
                format!("HOME={}", SCRATCH_MOUNT),
                "TMPDIR=/tmp".to_string(),
                "LANG=C.UTF-8".to_string(),
            ]),
            working_dir: Some(SCRATCH_MOUNT.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                memory: Some(memory_bytes),
                memory_swap: Some(memory_bytes),
                nano_cpus: Some((limits.cpu_share as f64 * 1_000_000_000.0) as i64),
                pids_limit: Some(limits.max_processes as i64),
                network_mode: Some("none".to_string()),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                readonly_rootfs: Some(true),
                tmpfs: Some(tmpfs),
                binds: Some(vec![
                    format!(
                        "{}:{}:{}",
                        invocation.artifact_dir.display(),
                        ARTIFACT_MOUNT,
                        artifact_mode
                    ),
                    format!("{}:{}:rw", scratch.display(), SCRATCH_MOUNT),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Memory breach behind a non-zero exit. A bare SIGKILL (137) is not one
/// unless the daemon reports the OOM kill.
fn memory_breach(oom_killed: bool, stderr: &str, memory_mb: u64) -> Option<SandboxError> {
    if oom_killed {
        return Some(SandboxError::Resource {
            kind: ResourceKind::Memory,
            detail: format!("container killed at {} MB", memory_mb),
        });
    }
    memory_exhaustion(stderr).map(|marker| SandboxError::Resource {
        kind: ResourceKind::Memory,
        detail: format!("{} (limit {} MB)", marker, memory_mb),
    })
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    /// Run one invocation in a fresh container.
    ///
    /// **Safety Guarantees:**
    /// - Hard timeout via `tokio::time::timeout`; the container is killed on expiry
    /// - Container removed on every path by `ContainerGuard`
    /// - OOM kills reported as `Resource(Memory)`, never as a plain exit code
    #[tracing::instrument(
        skip(self, invocation, limits),
        fields(language = %invocation.language, purpose = %invocation.purpose)
    )]
    async fn execute(
        &self,
        invocation: &Invocation,
        limits: &ExecutionLimits,
    ) -> Result<ExecOutput, SandboxError> {
        let image = self.get_image_name(&invocation.language);
        self.ensure_image(&image)
            .await
            .with_context(|| format!("Failed to ensure Docker image '{}' is available", image))?;

        let scratch = scratch_dir(self.scratch_root.as_deref(), "gradebox-run-")
            .context("Failed to create scratch directory")?;
        std::fs::write(scratch.path().join(STDIN_FILE), &invocation.stdin)
            .context("Failed to stage stdin")?;

        let container_name = format!("gradebox-{}", uuid::Uuid::new_v4());
        let config = self.container_config(invocation, limits, image, scratch.path());

        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .context("Failed to create Docker container")?;

        let container_id = container.id.clone();
        let _guard = ContainerGuard::new(&self.docker, container_id.clone());

        let start_time = Instant::now();

        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")?;

        let cap = limits.max_output_bytes;
        let execution_future = async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let mut overflowed = false;

            let logs_options = Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: true,
                ..Default::default()
            });

            let mut logs_stream = self.docker.logs(&container_id, logs_options);
            while let Some(output) = logs_stream.next().await {
                let complete = match output {
                    Ok(LogOutput::StdOut { message }) => push_capped(&mut stdout, &message, cap),
                    Ok(LogOutput::StdErr { message }) => push_capped(&mut stderr, &message, cap),
                    Ok(_) => true,
                    Err(e) => {
                        warn!(error = %e, "Error reading container logs");
                        break;
                    }
                };
                if !complete {
                    overflowed = true;
                    break;
                }
            }

            if overflowed {
                return (stdout, stderr, None, true);
            }

            let wait_options = WaitContainerOptions {
                condition: "not-running",
            };
            let mut wait_stream = self.docker.wait_container(&container_id, Some(wait_options));
            // bollard reports non-zero exits as a wait error carrying the code.
            let exit_code = match wait_stream.next().await {
                Some(Ok(response)) => Some(response.status_code),
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                    Some(code)
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Failed to get container exit code");
                    None
                }
                None => None,
            };

            (stdout, stderr, exit_code, false)
        };

        let timeout_result = tokio::time::timeout(limits.wall_time, execution_future).await;
        let duration = start_time.elapsed();

        let (stdout, stderr, exit_code, overflowed) = match timeout_result {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    timeout_ms = limits.wall_time.as_millis() as u64,
                    "Execution timed out, killing container"
                );
                if let Err(e) = self
                    .docker
                    .kill_container(&container_id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(error = %e, "Failed to kill timed-out container");
                }
                return Err(SandboxError::Timeout {
                    limit_ms: limits.wall_time.as_millis() as u64,
                });
            }
        };

        if overflowed {
            return Err(SandboxError::Resource {
                kind: ResourceKind::Output,
                detail: format!("program wrote more than {} bytes", cap),
            });
        }

        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).into_owned();
        let exit_code = exit_code
            .ok_or_else(|| anyhow::anyhow!("No exit code captured from container {}", container_id))?;

        if exit_code != 0 {
            let oom_killed = self
                .docker
                .inspect_container(&container_id, None::<InspectContainerOptions>)
                .await
                .ok()
                .and_then(|inspect| inspect.state)
                .and_then(|state| state.oom_killed)
                .unwrap_or(false);

            if let Some(err) = memory_breach(oom_killed, &stderr, limits.memory_mb) {
                return Err(err);
            }
        }

        debug!(
            exit_code,
            execution_time_ms = duration.as_millis() as u64,
            "Container finished"
        );

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
            duration,
        })
    }
}

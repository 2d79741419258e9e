/// Sandbox Runner - Abstraction for Isolated Execution
///
/// **Core Responsibility:**
/// Run one command for one artifact as a fresh, resource-limited process and
/// hand back its raw stdout, stderr and exit code.
///
/// **Critical Architectural Boundary:**
/// - A sandbox knows HOW to isolate and limit (containers, rlimits, ...)
/// - A sandbox does NOT know about test cases, drivers or scoring
/// - Limit breaches come back as typed errors, never as exit codes
///
/// **Guarantees every backend provides:**
/// - A fresh scratch directory per invocation, removed on every exit path
/// - Wall-clock overrun kills the program and yields `SandboxError::Timeout`
/// - Memory / CPU / output overrun yields `SandboxError::Resource`
/// - Dropping an in-flight `execute` future releases the process
///
/// Production uses `DockerSandbox`; `ProcessSandbox` runs directly on the
/// host with rlimits for development machines without a container runtime.
pub mod docker;
pub mod process;

pub use docker::DockerSandbox;
pub use process::ProcessSandbox;

use crate::config::{LanguageConfig, LanguageConfigManager};
use crate::error::SandboxError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use gradebox_common::config::{GraderConfig, SandboxKind};
use gradebox_common::types::Language;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Token in commands replaced by the backend's artifact mount point.
pub const ARTIFACT_PLACEHOLDER: &str = "%ARTIFACT%";

/// Minimum memory granted to compile steps; compilers need more headroom
/// than the programs they build.
const MIN_COMPILE_MEMORY_MB: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Compile,
    Probe,
    Run,
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Purpose::Compile => f.write_str("compile"),
            Purpose::Probe => f.write_str("probe"),
            Purpose::Run => f.write_str("run"),
        }
    }
}

/// One program launch inside a sandbox.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub language: Language,
    pub purpose: Purpose,
    pub command: Vec<String>,
    pub stdin: String,
    pub artifact_dir: PathBuf,
    /// Compile steps write their outputs next to the sources.
    pub writable_artifact: bool,
}

impl Invocation {
    /// Command with `%ARTIFACT%` replaced by `mount_point`.
    pub fn resolved_command(&self, mount_point: &str) -> Vec<String> {
        self.command
            .iter()
            .map(|part| part.replace(ARTIFACT_PLACEHOLDER, mount_point))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionLimits {
    pub wall_time: Duration,
    pub cpu_time: Duration,
    pub memory_mb: u64,
    /// Fraction of a CPU (container backends only).
    pub cpu_share: f32,
    pub max_processes: u32,
    pub max_output_bytes: usize,
    pub enforce_address_space: bool,
}

impl ExecutionLimits {
    /// Limits for one test case.
    pub fn for_case(language: &LanguageConfig, config: &GraderConfig) -> Self {
        let wall_time = Duration::from_millis(config.case_timeout_ms);
        Self {
            wall_time,
            // Single-threaded programs always hit the wall clock first.
            cpu_time: wall_time * 2,
            memory_mb: config.memory_limit_mb.unwrap_or(language.memory_limit_mb),
            cpu_share: language.cpu_limit,
            max_processes: config.max_processes,
            max_output_bytes: config.max_output_bytes,
            enforce_address_space: language.enforce_address_space,
        }
    }

    /// Limits for compile, syntax-check and probe steps.
    pub fn for_compile(language: &LanguageConfig, config: &GraderConfig) -> Self {
        let wall_time = Duration::from_millis(config.compile_timeout_ms);
        let memory_mb = config
            .memory_limit_mb
            .unwrap_or(language.memory_limit_mb)
            .max(MIN_COMPILE_MEMORY_MB);
        Self {
            wall_time,
            cpu_time: wall_time * 2,
            memory_mb,
            cpu_share: language.cpu_limit.max(1.0),
            max_processes: config.max_processes.max(64),
            max_output_bytes: config.max_output_bytes,
            enforce_address_space: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub duration: Duration,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(
        &self,
        invocation: &Invocation,
        limits: &ExecutionLimits,
    ) -> Result<ExecOutput, SandboxError>;
}

/// Build the configured backend.
pub fn connect(
    config: &GraderConfig,
    languages: &LanguageConfigManager,
) -> Result<Arc<dyn Sandbox>> {
    match config.sandbox {
        SandboxKind::Docker => {
            let sandbox = DockerSandbox::new_with_config(languages, config.scratch_root.clone())
                .context("Failed to initialise Docker sandbox")?;
            Ok(Arc::new(sandbox))
        }
        SandboxKind::Process => Ok(Arc::new(ProcessSandbox::new(config.scratch_root.clone()))),
    }
}

/// Fresh per-invocation directory, removed when the returned guard drops.
pub(crate) fn scratch_dir(root: Option<&Path>, prefix: &str) -> std::io::Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(prefix);
    match root {
        Some(root) => {
            std::fs::create_dir_all(root)?;
            builder.tempdir_in(root)
        }
        None => builder.tempdir(),
    }
}

const MEMORY_EXHAUSTION_MARKERS: &[&str] = &[
    "MemoryError",
    "std::bad_alloc",
    "java.lang.OutOfMemoryError",
    "JavaScript heap out of memory",
    "Cannot allocate memory",
];

/// Whether a failed program's diagnostics show it ran out of memory.
pub(crate) fn memory_exhaustion(stderr: &str) -> Option<&'static str> {
    MEMORY_EXHAUSTION_MARKERS
        .iter()
        .copied()
        .find(|marker| stderr.contains(marker))
}

/// Append to `buf` without letting it grow past `cap` bytes.
/// Returns false once data had to be dropped.
pub(crate) fn push_capped(buf: &mut Vec<u8>, chunk: &[u8], cap: usize) -> bool {
    let room = cap.saturating_sub(buf.len());
    if chunk.len() <= room {
        buf.extend_from_slice(chunk);
        true
    } else {
        buf.extend_from_slice(&chunk[..room]);
        false
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LanguageConfigManager;

    #[test]
    fn test_resolved_command_replaces_placeholder() {
        let invocation = Invocation {
            language: Language::Java,
            purpose: Purpose::Run,
            command: vec!["java".into(), "-cp".into(), "%ARTIFACT%".into(), "Main".into()],
            stdin: String::new(),
            artifact_dir: PathBuf::from("/tmp/build"),
            writable_artifact: false,
        };
        assert_eq!(
            invocation.resolved_command("/workspace"),
            vec!["java", "-cp", "/workspace", "Main"]
        );
    }

    #[test]
    fn test_case_limits_follow_config() {
        let languages = LanguageConfigManager::builtin();
        let java = languages.get_config(&Language::Java).unwrap();
        let config = GraderConfig {
            case_timeout_ms: 2_000,
            ..GraderConfig::default()
        };

        let limits = ExecutionLimits::for_case(java, &config);
        assert_eq!(limits.wall_time, Duration::from_secs(2));
        assert_eq!(limits.cpu_time, Duration::from_secs(4));
        assert_eq!(limits.memory_mb, 512);
        assert!(!limits.enforce_address_space);

        let overridden = GraderConfig {
            memory_limit_mb: Some(64),
            ..config
        };
        assert_eq!(ExecutionLimits::for_case(java, &overridden).memory_mb, 64);
        assert_eq!(ExecutionLimits::for_compile(java, &overridden).memory_mb, 512);
    }

    #[test]
    fn test_memory_exhaustion_markers() {
        assert_eq!(memory_exhaustion("MemoryError: "), Some("MemoryError"));
        assert_eq!(
            memory_exhaustion("terminate called after throwing an instance of 'std::bad_alloc'"),
            Some("std::bad_alloc")
        );
        assert_eq!(memory_exhaustion("ZeroDivisionError: division by zero"), None);
    }

    #[test]
    fn test_push_capped() {
        let mut buf = Vec::new();
        assert!(push_capped(&mut buf, b"abc", 5));
        assert!(!push_capped(&mut buf, b"defg", 5));
        assert_eq!(buf, b"abcde");
        assert!(!push_capped(&mut buf, b"x", 5));
    }

    #[test]
    fn test_scratch_dir_is_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let dir = scratch_dir(Some(root.path()), "gradebox-run-").unwrap();
        let path = dir.path().to_path_buf();
        assert!(path.starts_with(root.path()));
        drop(dir);
        assert!(!path.exists());
    }
}

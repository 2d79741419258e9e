/// Compiler / Loader - Source Text to Runnable Artifact
///
/// **Core Responsibility:**
/// Turn a submission's source text into an `Artifact` the case runner can
/// invoke repeatedly, or fail once with a `CompileError`.
///
/// **Load sequence:**
/// 1. Resolve the language tag and its configuration
/// 2. Write the source and a generated driver into a fresh build directory
/// 3. Run the compile / syntax-check command in the sandbox
/// 4. For interpreted languages, run the driver in probe mode so a missing
///    entry point fails here rather than on every case
/// 5. Freeze the build directory read-only
///
/// Compiled languages need no probe: the driver calls the entry point with
/// its declared static types, so the compiler rejects a missing or
/// mismatched signature.
use crate::config::{LanguageConfig, LanguageConfigManager};
use crate::drivers::{toolchain_for, ENTRY_POINT_MISSING_EXIT, PROBE_FLAG};
use crate::error::{CompileError, SandboxError};
use crate::sandbox::{scratch_dir, ExecOutput, ExecutionLimits, Invocation, Purpose, Sandbox};
use gradebox_common::config::GraderConfig;
use gradebox_common::types::{EntryPoint, Language};
use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Safety limit to keep pathological submissions away from the sandbox
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024;

/// A loaded submission. Owns its build directory, which is removed on drop.
#[derive(Debug)]
pub struct Artifact {
    language: Language,
    entry_point: EntryPoint,
    run_command: Vec<String>,
    dir: TempDir,
}

impl Artifact {
    pub fn language(&self) -> Language {
        self.language
    }

    pub fn entry_point(&self) -> &EntryPoint {
        &self.entry_point
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Invocation running the driver with `stdin` as its argument lines.
    pub fn invocation(&self, stdin: String) -> Invocation {
        Invocation {
            language: self.language,
            purpose: Purpose::Run,
            command: self.run_command.clone(),
            stdin,
            artifact_dir: self.dir.path().to_path_buf(),
            writable_artifact: false,
        }
    }
}

impl Drop for Artifact {
    fn drop(&mut self) {
        // TempDir cannot remove entries from a read-only directory.
        let _ = std::fs::set_permissions(self.dir.path(), Permissions::from_mode(0o755));
    }
}

pub struct Loader<'a> {
    languages: &'a LanguageConfigManager,
    sandbox: &'a dyn Sandbox,
    config: &'a GraderConfig,
}

impl<'a> Loader<'a> {
    pub fn new(
        languages: &'a LanguageConfigManager,
        sandbox: &'a dyn Sandbox,
        config: &'a GraderConfig,
    ) -> Self {
        Self {
            languages,
            sandbox,
            config,
        }
    }

    #[tracing::instrument(skip(self, source, entry), fields(entry = %entry.name, source_bytes = source.len()))]
    pub async fn load(
        &self,
        language: &str,
        source: &str,
        entry: &EntryPoint,
    ) -> Result<Artifact, CompileError> {
        let language: Language = language
            .parse()
            .map_err(|e: gradebox_common::types::UnsupportedLanguage| CompileError::new(e.to_string()))?;

        if source.len() > MAX_SOURCE_CODE_BYTES {
            return Err(CompileError::new(format!(
                "Source code exceeds maximum size of {} bytes",
                MAX_SOURCE_CODE_BYTES
            )));
        }

        let lang_config = self
            .languages
            .get_config(&language)
            .map_err(|_| CompileError::new(format!("Language '{}' is not configured", language)))?;

        let dir = self.prepare_build_dir(lang_config, source, entry)?;
        let limits = ExecutionLimits::for_compile(lang_config, self.config);

        if let Some(compile) = &lang_config.execution.compile {
            let invocation = Invocation {
                language,
                purpose: Purpose::Compile,
                command: compile.clone(),
                stdin: String::new(),
                artifact_dir: dir.path().to_path_buf(),
                writable_artifact: true,
            };
            self.run_step(&invocation, &limits).await?;
        }

        if lang_config.execution.probe {
            let mut command = lang_config.execution.run.clone();
            command.push(PROBE_FLAG.to_string());
            let invocation = Invocation {
                language,
                purpose: Purpose::Probe,
                command,
                stdin: String::new(),
                artifact_dir: dir.path().to_path_buf(),
                writable_artifact: false,
            };
            self.run_step(&invocation, &limits).await?;
        }

        std::fs::set_permissions(dir.path(), Permissions::from_mode(0o555))
            .map_err(|e| CompileError::new(format!("Failed to seal build directory: {}", e)))?;

        info!(language = %language, dir = %dir.path().display(), "Artifact ready");

        Ok(Artifact {
            language,
            entry_point: entry.clone(),
            run_command: lang_config.execution.run.clone(),
            dir,
        })
    }

    fn prepare_build_dir(
        &self,
        lang_config: &LanguageConfig,
        source: &str,
        entry: &EntryPoint,
    ) -> Result<TempDir, CompileError> {
        let infra = |e: std::io::Error| CompileError::new(format!("Failed to prepare build directory: {}", e));

        let dir = scratch_dir(self.config.scratch_root.as_deref(), "gradebox-build-").map_err(infra)?;

        let execution = &lang_config.execution;
        let driver = toolchain_for(lang_config.name).render_driver(entry, &execution.source_file);
        std::fs::write(dir.path().join(&execution.source_file), source).map_err(infra)?;
        std::fs::write(dir.path().join(&execution.driver_file), driver).map_err(infra)?;

        debug!(dir = %dir.path().display(), "Build directory prepared");
        Ok(dir)
    }

    async fn run_step(
        &self,
        invocation: &Invocation,
        limits: &ExecutionLimits,
    ) -> Result<(), CompileError> {
        match self.sandbox.execute(invocation, limits).await {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => {
                let diagnostic = diagnostic(invocation.purpose, &output);
                warn!(
                    purpose = %invocation.purpose,
                    exit_code = output.exit_code,
                    error_preview = diagnostic.lines().next().unwrap_or(""),
                    "Load step failed"
                );
                Err(CompileError::new(diagnostic))
            }
            Err(SandboxError::Timeout { limit_ms }) => Err(CompileError::new(format!(
                "Compilation timed out after {} ms",
                limit_ms
            ))),
            Err(e) => Err(CompileError::new(e.to_string())),
        }
    }
}

/// Raw diagnostic text for a failed load step.
fn diagnostic(purpose: Purpose, output: &ExecOutput) -> String {
    let stderr = output.stderr.trim();
    let stdout = output.stdout.trim();
    if !stderr.is_empty() {
        stderr.to_string()
    } else if !stdout.is_empty() {
        stdout.to_string()
    } else if purpose == Purpose::Probe && output.exit_code == ENTRY_POINT_MISSING_EXIT {
        "Entry point not found".to_string()
    } else {
        format!("{} step failed with exit code {}", purpose, output.exit_code)
    }
}

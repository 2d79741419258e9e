/// Grader - High-Level Orchestration
///
/// **Responsibility:**
/// Load a submission once, run its cases in order, and fold the case
/// results into a `GradeReport`.
///
/// **Architecture:**
/// 1. Validate the entry-point declaration
/// 2. Load the artifact via the `Loader` (loader.rs)
/// 3. Run every case via the `CaseRunner` (evaluator.rs)
/// 4. Fold results into counts and check the report invariants
///
/// This module is the glue layer. It knows nothing about:
/// - How code executes (the sandbox's job)
/// - How a case is judged (the case runner's job)
///
/// A `Grader` holds only immutable configuration and a shared sandbox, so
/// one instance can grade many submissions concurrently.
use crate::config::LanguageConfigManager;
use crate::error::GradeError;
use crate::evaluator::CaseRunner;
use crate::loader::Loader;
use crate::sandbox::{self, ExecutionLimits, Sandbox};
use anyhow::Result;
use gradebox_common::config::GraderConfig;
use gradebox_common::types::{
    CaseResult, ComparePolicy, EntryPoint, GradeReport, Submission, ValueType,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct Grader {
    languages: LanguageConfigManager,
    sandbox: Arc<dyn Sandbox>,
    config: GraderConfig,
}

impl Grader {
    pub fn new(
        languages: LanguageConfigManager,
        sandbox: Arc<dyn Sandbox>,
        config: GraderConfig,
    ) -> Self {
        Self {
            languages,
            sandbox,
            config,
        }
    }

    /// Build a grader with the sandbox backend named in `config`.
    pub fn from_config(config: GraderConfig, languages: LanguageConfigManager) -> Result<Self> {
        let sandbox = sandbox::connect(&config, &languages)?;
        info!(sandbox = sandbox.name(), "Grader initialised");
        Ok(Self::new(languages, sandbox, config))
    }

    pub fn languages(&self) -> &LanguageConfigManager {
        &self.languages
    }

    pub async fn grade(&self, submission: &Submission) -> Result<GradeReport, GradeError> {
        self.grade_with_cancellation(submission, &CancellationToken::new())
            .await
    }

    /// Grade `submission`, abandoning it as soon as `token` fires or the
    /// configured overall deadline passes.
    ///
    /// Abandoning drops the in-flight sandbox call, which kills the program
    /// and removes its scratch directory.
    #[tracing::instrument(
        skip(self, submission, token),
        fields(language = %submission.language, cases = submission.test_cases.len())
    )]
    pub async fn grade_with_cancellation(
        &self,
        submission: &Submission,
        token: &CancellationToken,
    ) -> Result<GradeReport, GradeError> {
        let total = submission.test_cases.len();
        validate_entry_point(&submission.entry_point, submission.compare)?;

        let deadline = self
            .config
            .deadline_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));

        let loader = Loader::new(&self.languages, self.sandbox.as_ref(), &self.config);
        let loaded = tokio::select! {
            biased;
            _ = interrupted(token, deadline) => {
                return Err(cancelled(0, total));
            }
            loaded = loader.load(&submission.language, &submission.source_text, &submission.entry_point) => loaded,
        };

        let artifact = match loaded {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!(error_preview = e.diagnostic.lines().next().unwrap_or(""), "Compilation failed");
                return Ok(GradeReport::compilation_failed(e.diagnostic, total));
            }
        };

        let lang_config = self
            .languages
            .get_config(&artifact.language())
            .map_err(|e| GradeError::Invariant(format!("{:#}", e)))?;
        let limits = ExecutionLimits::for_case(lang_config, &self.config);
        let runner = CaseRunner::new(self.sandbox.as_ref(), &artifact, &limits, submission.compare);

        let mut results = Vec::with_capacity(total);
        for (index, case) in submission.test_cases.iter().enumerate() {
            let result = tokio::select! {
                biased;
                _ = interrupted(token, deadline) => {
                    return Err(cancelled(index, total));
                }
                result = runner.run(index, case) => result,
            };
            results.push(result);
        }

        let report = assemble_report(results, total)?;
        info!(
            passed = report.passed,
            failed = report.failed,
            total = report.total_tests,
            "Grading completed"
        );
        Ok(report)
    }
}

/// Resolves once grading should stop.
async fn interrupted(token: &CancellationToken, deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("Overall grading deadline reached");
                }
            }
        }
        None => token.cancelled().await,
    }
}

fn cancelled(completed: usize, total: usize) -> GradeError {
    warn!(completed, total, "Grading cancelled");
    GradeError::Cancelled { completed, total }
}

fn validate_entry_point(entry: &EntryPoint, policy: ComparePolicy) -> Result<(), GradeError> {
    let invalid = |reason: &str| GradeError::InvalidEntryPoint {
        entry: entry.to_string(),
        reason: reason.to_string(),
    };

    if !entry.has_valid_name() {
        return Err(invalid("name is not a valid identifier"));
    }
    if policy == ComparePolicy::PairSum
        && (entry.params != [ValueType::IntArray, ValueType::Int]
            || entry.returns != ValueType::IntArray)
    {
        return Err(invalid("pair_sum requires (int[], int) -> int[]"));
    }
    Ok(())
}

/// Fold case results into a report and check its invariants.
pub fn assemble_report(results: Vec<CaseResult>, total: usize) -> Result<GradeReport, GradeError> {
    let (passed, failed) = results.iter().fold((0usize, 0usize), |(p, f), r| {
        if r.passed {
            (p + 1, f)
        } else {
            (p, f + 1)
        }
    });

    let report = GradeReport {
        passed,
        failed,
        total_tests: total,
        test_results: results,
        compilation_error: None,
    };
    check_invariants(&report)?;
    Ok(report)
}

fn check_invariants(report: &GradeReport) -> Result<(), GradeError> {
    if report.test_results.len() != report.total_tests {
        return Err(GradeError::Invariant(format!(
            "{} results for {} cases",
            report.test_results.len(),
            report.total_tests
        )));
    }
    if report.passed + report.failed != report.total_tests {
        return Err(GradeError::Invariant(format!(
            "passed ({}) + failed ({}) != total ({})",
            report.passed, report.failed, report.total_tests
        )));
    }
    for (position, result) in report.test_results.iter().enumerate() {
        if result.index != position {
            return Err(GradeError::Invariant(format!(
                "result for case {} reported at position {}",
                result.index, position
            )));
        }
        if result.is_errored() && (result.passed || result.actual_output.is_some()) {
            return Err(GradeError::Invariant(format!(
                "errored case {} carries an output or a pass",
                position
            )));
        }
    }
    Ok(())
}

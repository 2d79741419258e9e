// CLI commands for grading submissions and inspecting languages
use anyhow::{bail, Context, Result};
use gradebox_common::config::{GraderConfig, SandboxKind};
use gradebox_common::types::{EntryPoint, Language, Submission, ValueType};
use gradebox_engine::drivers::toolchain_for;
use gradebox_engine::{Grader, LanguageConfigManager};
use std::fs;
use std::path::Path;
use tracing::info;

/// Command-line settings that win over `GRADEBOX_*` variables.
#[derive(Debug, Default)]
pub struct GradeOverrides {
    pub sandbox: Option<SandboxKind>,
    pub timeout_ms: Option<u64>,
    pub memory_mb: Option<u64>,
}

impl GradeOverrides {
    fn apply(self, mut config: GraderConfig) -> GraderConfig {
        if let Some(sandbox) = self.sandbox {
            config.sandbox = sandbox;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.case_timeout_ms = timeout_ms;
        }
        if self.memory_mb.is_some() {
            config.memory_limit_mb = self.memory_mb;
        }
        config
    }
}

fn load_submission(path: &Path, source: Option<&Path>) -> Result<Submission> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read submission {}", path.display()))?;
    let mut submission: Submission = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse submission {}", path.display()))?;

    if let Some(source) = source {
        submission.source_text = fs::read_to_string(source)
            .with_context(|| format!("Failed to read source {}", source.display()))?;
    }
    Ok(submission)
}

/// Grade a submission file and print the report on stdout
pub async fn grade(
    submission_path: &Path,
    source: Option<&Path>,
    languages_path: Option<&Path>,
    overrides: GradeOverrides,
    pretty: bool,
) -> Result<()> {
    let submission = load_submission(submission_path, source)?;
    let config = overrides.apply(GraderConfig::from_env()?);
    let languages = LanguageConfigManager::load_or_builtin(languages_path)?;

    info!(
        language = %submission.language,
        cases = submission.test_cases.len(),
        sandbox = %config.sandbox,
        "Grading submission"
    );

    let grader = Grader::from_config(config, languages)?;
    let report = grader.grade(&submission).await?;

    let json = if pretty {
        serde_json::to_string_pretty(&report)
    } else {
        serde_json::to_string(&report)
    }
    .context("Failed to serialize report")?;
    println!("{}", json);

    Ok(())
}

/// List configured languages
pub fn list_languages(languages_path: Option<&Path>) -> Result<()> {
    let languages = LanguageConfigManager::load_or_builtin(languages_path)?;

    for language in languages.list_languages() {
        let config = languages.get_config(&language)?;
        let kind = if language.is_compiled() { "compiled" } else { "interpreted" };
        println!(
            "{:<12} {:<8} {:<24} {:>5} MB  {}",
            language.as_str(),
            config.version,
            config.image,
            config.memory_limit_mb,
            kind
        );
    }

    Ok(())
}

/// Print the generated driver source for a language
pub fn print_driver(language: &str, entry: &str, params: &str, returns: &str) -> Result<()> {
    let language: Language = language.parse()?;
    let entry = parse_entry_point(entry, params, returns)?;

    let languages = LanguageConfigManager::builtin();
    let config = languages.get_config(&language)?;
    print!(
        "{}",
        toolchain_for(language).render_driver(&entry, &config.execution.source_file)
    );

    Ok(())
}

fn parse_entry_point(name: &str, params: &str, returns: &str) -> Result<EntryPoint> {
    let params = params
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<ValueType>().map_err(anyhow::Error::msg))
        .collect::<Result<Vec<_>>>()?;
    let returns = returns.parse::<ValueType>().map_err(anyhow::Error::msg)?;

    let entry = EntryPoint {
        name: name.to_string(),
        params,
        returns,
    };
    if !entry.has_valid_name() {
        bail!("'{}' is not a valid entry point name", name);
    }
    Ok(entry)
}

// Engine-wide grading configuration
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Which isolation backend runs compile steps and cases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    #[default]
    Docker,
    Process,
}

impl fmt::Display for SandboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxKind::Docker => f.write_str("docker"),
            SandboxKind::Process => f.write_str("process"),
        }
    }
}

impl FromStr for SandboxKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(SandboxKind::Docker),
            "process" => Ok(SandboxKind::Process),
            other => Err(ConfigError::Invalid {
                key: "GRADEBOX_SANDBOX",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraderConfig {
    pub sandbox: SandboxKind,
    /// Wall-clock limit for a single case.
    pub case_timeout_ms: u64,
    /// Wall-clock limit for the compile / syntax-check / probe steps.
    pub compile_timeout_ms: u64,
    /// Overrides the per-language memory limit when set.
    pub memory_limit_mb: Option<u64>,
    pub max_processes: u32,
    pub max_output_bytes: usize,
    /// Parent directory for build and scratch directories. System temp dir when unset.
    pub scratch_root: Option<PathBuf>,
    /// Upper bound on grading a whole submission.
    pub deadline_ms: Option<u64>,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxKind::Docker,
            case_timeout_ms: 5_000,
            compile_timeout_ms: 30_000,
            memory_limit_mb: None,
            max_processes: 50,
            max_output_bytes: 1024 * 1024,
            scratch_root: None,
            deadline_ms: None,
        }
    }
}

impl GraderConfig {
    /// Build a config from `GRADEBOX_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("GRADEBOX_SANDBOX") {
            config.sandbox = value.parse()?;
        }
        if let Some(value) = lookup("GRADEBOX_CASE_TIMEOUT_MS") {
            config.case_timeout_ms = parse_number("GRADEBOX_CASE_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("GRADEBOX_COMPILE_TIMEOUT_MS") {
            config.compile_timeout_ms = parse_number("GRADEBOX_COMPILE_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("GRADEBOX_MEMORY_MB") {
            config.memory_limit_mb = Some(parse_number("GRADEBOX_MEMORY_MB", &value)?);
        }
        if let Some(value) = lookup("GRADEBOX_SCRATCH_DIR") {
            config.scratch_root = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("GRADEBOX_DEADLINE_MS") {
            config.deadline_ms = Some(parse_number("GRADEBOX_DEADLINE_MS", &value)?);
        }

        Ok(config)
    }
}

fn parse_number<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_environment_is_empty() {
        let config = GraderConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, GraderConfig::default());
        assert_eq!(config.sandbox, SandboxKind::Docker);
        assert_eq!(config.max_processes, 50);
    }

    #[test]
    fn reads_overrides() {
        let config = GraderConfig::from_lookup(lookup_from(&[
            ("GRADEBOX_SANDBOX", "Process"),
            ("GRADEBOX_CASE_TIMEOUT_MS", "1500"),
            ("GRADEBOX_MEMORY_MB", "128"),
            ("GRADEBOX_SCRATCH_DIR", "/var/tmp/gradebox"),
            ("GRADEBOX_DEADLINE_MS", "60000"),
        ]))
        .unwrap();

        assert_eq!(config.sandbox, SandboxKind::Process);
        assert_eq!(config.case_timeout_ms, 1500);
        assert_eq!(config.compile_timeout_ms, 30_000);
        assert_eq!(config.memory_limit_mb, Some(128));
        assert_eq!(config.scratch_root, Some(PathBuf::from("/var/tmp/gradebox")));
        assert_eq!(config.deadline_ms, Some(60_000));
    }

    #[test]
    fn rejects_garbage() {
        let err = GraderConfig::from_lookup(lookup_from(&[("GRADEBOX_CASE_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "GRADEBOX_CASE_TIMEOUT_MS",
                value: "soon".to_string()
            }
        );
        assert!("podman".parse::<SandboxKind>().is_err());
    }

    #[test]
    fn deserializes_partial_json() {
        let config: GraderConfig =
            serde_json::from_str(r#"{"sandbox": "process", "case_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.sandbox, SandboxKind::Process);
        assert_eq!(config.case_timeout_ms, 250);
        assert_eq!(config.max_output_bytes, 1024 * 1024);
    }
}

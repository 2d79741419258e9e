// Language configuration management for the grading engine
use anyhow::{bail, Context, Result};
use gradebox_common::types::Language;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "config/languages.json";

/// How a language is built and run. Commands may reference `%ARTIFACT%`,
/// which the sandbox replaces with the artifact mount point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageExecution {
    pub source_file: String,
    pub driver_file: String,
    #[serde(default)]
    pub compile: Option<Vec<String>>,
    pub run: Vec<String>,
    /// Run the driver once in probe mode after compiling.
    #[serde(default)]
    pub probe: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: Language,
    pub version: String,
    pub image: String,
    pub execution: LanguageExecution,
    pub memory_limit_mb: u64,
    pub cpu_limit: f32,
    /// Cap virtual address space in the process sandbox. Runtimes that
    /// reserve large heaps up front (V8, the JVM) cannot start under it.
    #[serde(default = "default_true")]
    pub enforce_address_space: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

const PYTHON_SYNTAX_CHECK: &str =
    "import ast, sys; ast.parse(open(sys.argv[1]).read(), sys.argv[1])";

/// Built-in settings used when no languages.json is present.
pub fn builtin_configs() -> Vec<LanguageConfig> {
    vec![
        LanguageConfig {
            name: Language::Python,
            version: "3.11".to_string(),
            image: "python:3.11-alpine".to_string(),
            execution: LanguageExecution {
                source_file: "solution.py".to_string(),
                driver_file: "main.py".to_string(),
                // Syntax check only; nothing may be written into the build directory.
                compile: Some(strings(&[
                    "python3",
                    "-B",
                    "-c",
                    PYTHON_SYNTAX_CHECK,
                    "%ARTIFACT%/solution.py",
                ])),
                run: strings(&["python3", "-B", "%ARTIFACT%/main.py"]),
                probe: true,
            },
            memory_limit_mb: 256,
            cpu_limit: 0.5,
            enforce_address_space: true,
        },
        LanguageConfig {
            name: Language::Javascript,
            version: "20".to_string(),
            image: "node:20-alpine".to_string(),
            execution: LanguageExecution {
                source_file: "solution.js".to_string(),
                driver_file: "main.js".to_string(),
                compile: Some(strings(&["node", "--check", "%ARTIFACT%/solution.js"])),
                run: strings(&["node", "%ARTIFACT%/main.js"]),
                probe: true,
            },
            memory_limit_mb: 256,
            cpu_limit: 0.5,
            enforce_address_space: false,
        },
        LanguageConfig {
            name: Language::Cpp,
            version: "13".to_string(),
            image: "gcc:13".to_string(),
            execution: LanguageExecution {
                source_file: "solution.cpp".to_string(),
                driver_file: "main.cpp".to_string(),
                compile: Some(strings(&[
                    "g++",
                    "-O2",
                    "-std=c++17",
                    "-o",
                    "%ARTIFACT%/main",
                    "%ARTIFACT%/main.cpp",
                ])),
                run: strings(&["%ARTIFACT%/main"]),
                probe: false,
            },
            memory_limit_mb: 256,
            cpu_limit: 0.5,
            enforce_address_space: true,
        },
        LanguageConfig {
            name: Language::Java,
            version: "21".to_string(),
            image: "eclipse-temurin:21-jdk".to_string(),
            execution: LanguageExecution {
                source_file: "Solution.java".to_string(),
                driver_file: "Main.java".to_string(),
                compile: Some(strings(&[
                    "javac",
                    "-d",
                    "%ARTIFACT%",
                    "%ARTIFACT%/Main.java",
                    "%ARTIFACT%/Solution.java",
                ])),
                run: strings(&["java", "-XX:+UseSerialGC", "-Xss64m", "-cp", "%ARTIFACT%", "Main"]),
                probe: false,
            },
            memory_limit_mb: 512,
            cpu_limit: 1.0,
            enforce_address_space: false,
        },
    ]
}

/// Language configuration manager
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<Language, LanguageConfig>,
}

impl LanguageConfigManager {
    /// Load language configurations from languages.json
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        Self::from_json(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let languages_json: LanguagesJson = serde_json::from_str(content)?;
        if languages_json.languages.is_empty() {
            bail!("No languages configured");
        }

        let mut configs = HashMap::new();
        for lang in languages_json.languages {
            if lang.execution.run.is_empty() {
                bail!("Language '{}' has an empty run command", lang.name);
            }
            let name = lang.name;
            if configs.insert(name, lang).is_some() {
                bail!("Language '{}' is configured twice", name);
            }
        }

        Ok(Self { configs })
    }

    /// Built-in defaults for every supported language
    pub fn builtin() -> Self {
        let configs = builtin_configs()
            .into_iter()
            .map(|config| (config.name, config))
            .collect();
        Self { configs }
    }

    /// Load from `path` (or config/languages.json), falling back to the
    /// built-in defaults when the file does not exist.
    pub fn load_or_builtin(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        if path.exists() {
            let manager = Self::load(path)?;
            info!(path = %path.display(), languages = ?manager.list_languages(), "Loaded language configurations");
            Ok(manager)
        } else {
            warn!(path = %path.display(), "Language config not found, using built-in defaults");
            Ok(Self::builtin())
        }
    }

    /// Get configuration for a specific language
    pub fn get_config(&self, language: &Language) -> Result<&LanguageConfig> {
        self.configs
            .get(language)
            .ok_or_else(|| anyhow::anyhow!("No configuration found for language: {}", language))
    }

    /// Get Docker image for a language
    pub fn get_image(&self, language: &Language) -> Result<String> {
        Ok(self.get_config(language)?.image.clone())
    }

    /// List all configured languages, sorted by name
    pub fn list_languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self.configs.keys().copied().collect();
        languages.sort_by_key(|l| l.as_str());
        languages
    }
}

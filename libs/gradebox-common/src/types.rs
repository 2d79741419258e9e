use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Languages the grader ships drivers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
    Cpp,
    Java,
}

impl Language {
    pub const ALL: [Language; 4] = [
        Language::Python,
        Language::Javascript,
        Language::Cpp,
        Language::Java,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Javascript => "javascript",
            Language::Cpp => "cpp",
            Language::Java => "java",
        }
    }

    /// True when the language has a separate compile step that type-checks
    /// the call into the entry point.
    pub fn is_compiled(&self) -> bool {
        matches!(self, Language::Cpp | Language::Java)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unsupported language: {0}. Supported languages: python, javascript, cpp, java")]
pub struct UnsupportedLanguage(pub String);

impl FromStr for Language {
    type Err = UnsupportedLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" => Ok(Language::Javascript),
            "cpp" | "c++" => Ok(Language::Cpp),
            "java" => Ok(Language::Java),
            _ => Err(UnsupportedLanguage(s.to_string())),
        }
    }
}

/// Shape of a single argument or return value crossing the driver boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    #[serde(rename = "int")]
    Int,
    #[serde(rename = "int[]")]
    IntArray,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Int => f.write_str("int"),
            ValueType::IntArray => f.write_str("int[]"),
        }
    }
}

impl FromStr for ValueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "int" => Ok(ValueType::Int),
            "int[]" => Ok(ValueType::IntArray),
            other => Err(format!("unknown value type '{}' (expected int or int[])", other)),
        }
    }
}

/// Declared signature of the function a submission must provide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub name: String,
    pub params: Vec<ValueType>,
    pub returns: ValueType,
}

impl Default for EntryPoint {
    fn default() -> Self {
        Self {
            name: "twoSum".to_string(),
            params: vec![ValueType::IntArray, ValueType::Int],
            returns: ValueType::IntArray,
        }
    }
}

impl EntryPoint {
    /// Entry point names are spliced into generated driver source, so only
    /// plain identifiers are accepted.
    pub fn has_valid_name(&self) -> bool {
        let mut chars = self.name.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self.params.iter().map(|p| p.to_string()).collect();
        write!(f, "{}({}) -> {}", self.name, params.join(", "), self.returns)
    }
}

/// How a case's canonical output is judged against `expectedOutput`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparePolicy {
    /// Byte-for-byte equality with the canonical rendering.
    #[default]
    Exact,
    /// `expectedOutput` is a target sum passed as the trailing argument; the
    /// returned pair of indices must select two elements adding up to it.
    PairSum,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
    #[serde(default)]
    pub explanation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub language: String,
    pub source_text: String,
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub entry_point: EntryPoint,
    #[serde(default)]
    pub compare: ComparePolicy,
}

/// Closed classification of everything that can go wrong while grading.
///
/// Only `Compile` aborts a submission; the rest are recorded on the
/// affected case and grading moves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Compile,
    Parse,
    Runtime,
    Timeout,
    Resource,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Compile => "compile",
            ErrorKind::Parse => "parse",
            ErrorKind::Runtime => "runtime",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Resource => "resource",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseResult {
    /// Position of the case in the submitted sequence.
    #[serde(skip)]
    pub index: usize,
    pub input: String,
    pub expected_output: String,
    pub actual_output: Option<String>,
    pub passed: bool,
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub error_kind: Option<ErrorKind>,
}

impl CaseResult {
    pub fn is_errored(&self) -> bool {
        self.error_kind.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeReport {
    pub passed: usize,
    pub failed: usize,
    pub total_tests: usize,
    pub test_results: Vec<CaseResult>,
    pub compilation_error: Option<String>,
}

impl GradeReport {
    /// Report for a submission that never produced a runnable artifact.
    pub fn compilation_failed(diagnostic: impl Into<String>, total_tests: usize) -> Self {
        Self {
            passed: 0,
            failed: 0,
            total_tests,
            test_results: Vec::new(),
            compilation_error: Some(diagnostic.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_parses_common_aliases() {
        assert_eq!("Python".parse::<Language>(), Ok(Language::Python));
        assert_eq!("js".parse::<Language>(), Ok(Language::Javascript));
        assert_eq!("c++".parse::<Language>(), Ok(Language::Cpp));
        assert_eq!(" java ".parse::<Language>(), Ok(Language::Java));
        assert!("cobol".parse::<Language>().is_err());
    }

    #[test]
    fn submission_defaults_entry_point_and_policy() {
        let json = r#"{
            "language": "python",
            "sourceText": "def twoSum(nums, target): return [0, 1]",
            "testCases": [{"input": "[2,7,11,15], 9", "expectedOutput": "[0, 1]"}]
        }"#;
        let submission: Submission = serde_json::from_str(json).unwrap();
        assert_eq!(submission.entry_point, EntryPoint::default());
        assert_eq!(submission.compare, ComparePolicy::Exact);
        assert_eq!(submission.test_cases[0].explanation, "");
    }

    #[test]
    fn entry_point_parses_from_json() {
        let json = r#"{"name": "maxOf", "params": ["int[]"], "returns": "int"}"#;
        let entry: EntryPoint = serde_json::from_str(json).unwrap();
        assert_eq!(entry.params, vec![ValueType::IntArray]);
        assert_eq!(entry.returns, ValueType::Int);
        assert_eq!(entry.to_string(), "maxOf(int[]) -> int");
    }

    #[test]
    fn entry_point_name_must_be_identifier() {
        let mut entry = EntryPoint::default();
        assert!(entry.has_valid_name());
        entry.name = "two_sum2".into();
        assert!(entry.has_valid_name());
        entry.name = "2sum".into();
        assert!(!entry.has_valid_name());
        entry.name = "a; import os".into();
        assert!(!entry.has_valid_name());
        entry.name = String::new();
        assert!(!entry.has_valid_name());
    }

    #[test]
    fn case_result_serializes_null_actual_and_omits_absent_error() {
        let result = CaseResult {
            index: 3,
            input: "[1]".into(),
            expected_output: "[0]".into(),
            actual_output: None,
            passed: false,
            explanation: String::new(),
            error: None,
            error_kind: None,
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["actualOutput"], serde_json::Value::Null);
        assert!(value.get("error").is_none());
        assert!(value.get("index").is_none());
        assert!(value.get("errorKind").is_none());
    }

    #[test]
    fn report_uses_camel_case_contract() {
        let report = GradeReport::compilation_failed("SyntaxError: invalid syntax", 4);
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["totalTests"], 4);
        assert_eq!(value["passed"], 0);
        assert_eq!(value["failed"], 0);
        assert_eq!(value["testResults"], serde_json::json!([]));
        assert_eq!(value["compilationError"], "SyntaxError: invalid syntax");
    }
}

/// Case Runner - Per-Case Execution and Judging
///
/// **Core Responsibility:**
/// Drive one test case through `Pending -> Invoking -> {Passed, Failed, Errored}`
/// and produce its `CaseResult`.
///
/// **Critical Properties:**
/// - Knows nothing about containers or process groups (that's the sandbox)
/// - Knows nothing about language syntax (that's the driver)
/// - Never fails: every problem becomes an errored case
///
/// **Judging Rules:**
/// - Input that does not parse against the entry point is a parse error
/// - Non-zero exit is a runtime error carrying the last stderr line
/// - A missing or malformed result line is a runtime error
/// - Sandbox timeouts and resource breaches keep their own kinds
/// - Otherwise the result is re-rendered canonically and compared per policy
///
/// **Comparison:**
/// - `exact`: strict string equality, no trimming or normalization
/// - `pair_sum`: the returned indices must be distinct, in range, and
///   select elements adding up to the target
use crate::codec::{self, ParseError, Value};
use crate::drivers::extract_result;
use crate::error::SandboxError;
use crate::loader::Artifact;
use crate::sandbox::{ExecOutput, ExecutionLimits, Sandbox};
use gradebox_common::types::{
    CaseResult, ComparePolicy, EntryPoint, ErrorKind, TestCase, ValueType,
};
use tracing::{debug, warn};

/// Safety limit on a single case's input text
pub const MAX_INPUT_BYTES: usize = 10 * 1024 * 1024;

/// Terminal state of a case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseOutcome {
    Passed { actual: String },
    Failed { actual: String },
    Errored { kind: ErrorKind, message: String },
}

impl CaseOutcome {
    fn errored(kind: ErrorKind, message: impl Into<String>) -> Self {
        CaseOutcome::Errored {
            kind,
            message: message.into(),
        }
    }

    pub fn into_result(self, index: usize, case: &TestCase) -> CaseResult {
        let (actual_output, passed, error, error_kind) = match self {
            CaseOutcome::Passed { actual } => (Some(actual), true, None, None),
            CaseOutcome::Failed { actual } => (Some(actual), false, None, None),
            CaseOutcome::Errored { kind, message } => (None, false, Some(message), Some(kind)),
        };
        CaseResult {
            index,
            input: case.input.clone(),
            expected_output: case.expected_output.clone(),
            actual_output,
            passed,
            explanation: case.explanation.clone(),
            error,
            error_kind,
        }
    }
}

/// Runs cases against one loaded artifact.
pub struct CaseRunner<'a> {
    sandbox: &'a dyn Sandbox,
    artifact: &'a Artifact,
    limits: &'a ExecutionLimits,
    policy: ComparePolicy,
}

impl<'a> CaseRunner<'a> {
    pub fn new(
        sandbox: &'a dyn Sandbox,
        artifact: &'a Artifact,
        limits: &'a ExecutionLimits,
        policy: ComparePolicy,
    ) -> Self {
        Self {
            sandbox,
            artifact,
            limits,
            policy,
        }
    }

    #[tracing::instrument(skip(self, case), fields(language = %self.artifact.language()))]
    pub async fn run(&self, index: usize, case: &TestCase) -> CaseResult {
        let outcome = self.evaluate(case).await;
        match &outcome {
            CaseOutcome::Passed { .. } => debug!("Case passed"),
            CaseOutcome::Failed { actual } => debug!(actual = %actual, "Case failed"),
            CaseOutcome::Errored { kind, message } => {
                debug!(kind = %kind, error = %message, "Case errored")
            }
        }
        outcome.into_result(index, case)
    }

    async fn evaluate(&self, case: &TestCase) -> CaseOutcome {
        let entry = self.artifact.entry_point();
        let arguments = match prepare_arguments(entry, self.policy, case) {
            Ok(arguments) => arguments,
            Err(e) => return CaseOutcome::errored(ErrorKind::Parse, e.to_string()),
        };

        let invocation = self.artifact.invocation(stdin_lines(&arguments));
        match self.sandbox.execute(&invocation, self.limits).await {
            Ok(output) => judge(entry, self.policy, &arguments, &case.expected_output, &output),
            Err(e) => {
                if let SandboxError::Unavailable(_) = &e {
                    warn!(error = %e, sandbox = self.sandbox.name(), "Sandbox failed while running case");
                }
                CaseOutcome::errored(e.kind(), e.to_string())
            }
        }
    }
}

/// Parse a case into the values handed to the entry point.
///
/// Under `pair_sum` the expected output is the target and is appended as
/// the trailing argument.
pub fn prepare_arguments(
    entry: &EntryPoint,
    policy: ComparePolicy,
    case: &TestCase,
) -> Result<Vec<Value>, ParseError> {
    if case.input.len() > MAX_INPUT_BYTES {
        return Err(ParseError::TooLarge {
            bytes: case.input.len(),
            limit: MAX_INPUT_BYTES,
        });
    }

    match policy {
        ComparePolicy::Exact => codec::parse_arguments(&case.input, &entry.params),
        ComparePolicy::PairSum => {
            let leading = &entry.params[..entry.params.len().saturating_sub(1)];
            let mut arguments = codec::parse_arguments(&case.input, leading)?;
            arguments.push(codec::parse_value(&case.expected_output, ValueType::Int)?);
            Ok(arguments)
        }
    }
}

/// One canonical argument per line.
fn stdin_lines(arguments: &[Value]) -> String {
    arguments.iter().map(|v| format!("{}\n", v.render())).collect()
}

/// Judge a completed driver run.
pub fn judge(
    entry: &EntryPoint,
    policy: ComparePolicy,
    arguments: &[Value],
    expected: &str,
    output: &ExecOutput,
) -> CaseOutcome {
    if !output.success() {
        let message = last_meaningful_line(&output.stderr)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Process exited with code {}", output.exit_code));
        return CaseOutcome::errored(ErrorKind::Runtime, message);
    }

    let Some(raw) = extract_result(&output.stdout) else {
        return CaseOutcome::errored(ErrorKind::Runtime, "Program produced no result");
    };

    let value = match codec::parse_value(raw, entry.returns) {
        Ok(value) => value,
        Err(e) => {
            return CaseOutcome::errored(
                ErrorKind::Runtime,
                format!("Result is not a valid {}: {}", entry.returns, e),
            )
        }
    };

    let actual = value.render();
    let passed = match policy {
        ComparePolicy::Exact => actual == expected,
        ComparePolicy::PairSum => is_pair_sum(arguments, &value),
    };

    if passed {
        CaseOutcome::Passed { actual }
    } else {
        CaseOutcome::Failed { actual }
    }
}

fn last_meaningful_line(stderr: &str) -> Option<&str> {
    stderr.lines().map(str::trim).filter(|l| !l.is_empty()).last()
}

fn is_pair_sum(arguments: &[Value], result: &Value) -> bool {
    let (nums, target) = match arguments {
        [Value::IntArray(nums), Value::Int(target)] => (nums, *target),
        _ => return false,
    };
    let (i, j) = match result {
        Value::IntArray(pair) if pair.len() == 2 => (pair[0], pair[1]),
        _ => return false,
    };
    if i == j {
        return false;
    }
    let element = |idx: i64| usize::try_from(idx).ok().and_then(|idx| nums.get(idx)).copied();
    match (element(i), element(j)) {
        (Some(a), Some(b)) => a.checked_add(b) == Some(target),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LanguageConfigManager;
    use crate::loader::Loader;
    use crate::sandbox::testing::{exit, fails, ok, returns, times_out, ScriptedSandbox};
    use crate::sandbox::Purpose;
    use crate::error::ResourceKind;
    use gradebox_common::config::GraderConfig;

    fn case(input: &str, expected: &str) -> TestCase {
        TestCase {
            input: input.to_string(),
            expected_output: expected.to_string(),
            explanation: String::new(),
        }
    }

    fn sum_entry() -> EntryPoint {
        EntryPoint {
            name: "total".to_string(),
            params: vec![ValueType::IntArray],
            returns: ValueType::Int,
        }
    }

    async fn load(sandbox: &ScriptedSandbox, root: &std::path::Path, entry: &EntryPoint) -> Artifact {
        let config = GraderConfig {
            scratch_root: Some(root.to_path_buf()),
            ..GraderConfig::default()
        };
        let languages = LanguageConfigManager::builtin();
        Loader::new(&languages, sandbox, &config)
            .load("cpp", "class Solution {};", entry)
            .await
            .unwrap()
    }

    fn limits() -> ExecutionLimits {
        let languages = LanguageConfigManager::builtin();
        let cpp = languages.get_config(&gradebox_common::types::Language::Cpp).unwrap();
        ExecutionLimits::for_case(cpp, &GraderConfig::default())
    }

    #[tokio::test]
    async fn test_pair_sum_scenario_passes() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = ScriptedSandbox::new()
            .then(Purpose::Compile, ok())
            .then(Purpose::Run, returns("[0,1]"));
        let artifact = load(&sandbox, root.path(), &EntryPoint::default()).await;
        let limits = limits();

        let runner = CaseRunner::new(&sandbox, &artifact, &limits, ComparePolicy::PairSum);
        let result = runner.run(0, &case("[2,7,11,15]", "9")).await;

        assert!(result.passed);
        assert_eq!(result.actual_output.as_deref(), Some("[0, 1]"));
        assert_eq!(result.error, None);

        let calls = sandbox.calls.lock().unwrap();
        assert_eq!(calls[1].stdin, "[2, 7, 11, 15]\n9\n");
    }

    #[tokio::test]
    async fn test_malformed_input_errors_without_invoking() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = ScriptedSandbox::new().then(Purpose::Compile, ok());
        let artifact = load(&sandbox, root.path(), &sum_entry()).await;
        let limits = limits();

        let runner = CaseRunner::new(&sandbox, &artifact, &limits, ComparePolicy::Exact);
        let result = runner.run(1, &case("[2,,15]", "17")).await;

        assert!(!result.passed);
        assert_eq!(result.actual_output, None);
        assert_eq!(result.error_kind, Some(ErrorKind::Parse));
        assert!(result.error.unwrap().contains("empty element"));
        assert_eq!(sandbox.purposes(), vec![Purpose::Compile]);
    }

    #[tokio::test]
    async fn test_exact_policy_compares_canonical_rendering() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = ScriptedSandbox::new()
            .then(Purpose::Compile, ok())
            .then(Purpose::Run, returns("[0,1]"))
            .then(Purpose::Run, returns("[0,1]"));
        let artifact = load(&sandbox, root.path(), &EntryPoint::default()).await;
        let limits = limits();
        let runner = CaseRunner::new(&sandbox, &artifact, &limits, ComparePolicy::Exact);

        let matched = runner.run(0, &case("[2,7,11,15], 9", "[0, 1]")).await;
        assert!(matched.passed);

        // No normalization is applied to the expected side.
        let unmatched = runner.run(1, &case("[2,7,11,15], 9", "[0,1]")).await;
        assert!(!unmatched.passed);
        assert_eq!(unmatched.actual_output.as_deref(), Some("[0, 1]"));
        assert_eq!(unmatched.error, None);
    }

    #[tokio::test]
    async fn test_sandbox_failures_keep_their_kind() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = ScriptedSandbox::new()
            .then(Purpose::Compile, ok())
            .then(Purpose::Run, times_out(5_000))
            .then(
                Purpose::Run,
                Box::new(|_| {
                    Err(SandboxError::Resource {
                        kind: ResourceKind::Memory,
                        detail: "container was OOM killed".to_string(),
                    })
                }),
            )
            .then(Purpose::Run, fails(1, "Traceback (most recent call last):\nZeroDivisionError: division by zero\n"))
            .then(
                Purpose::Run,
                Box::new(|_| Err(SandboxError::Unavailable(anyhow::anyhow!("daemon gone")))),
            );
        let artifact = load(&sandbox, root.path(), &sum_entry()).await;
        let limits = limits();
        let runner = CaseRunner::new(&sandbox, &artifact, &limits, ComparePolicy::Exact);

        let timeout = runner.run(0, &case("[1]", "1")).await;
        assert_eq!(timeout.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(timeout.error.as_deref(), Some("Time limit exceeded after 5000 ms"));

        let memory = runner.run(1, &case("[1]", "1")).await;
        assert_eq!(memory.error_kind, Some(ErrorKind::Resource));

        let runtime = runner.run(2, &case("[1]", "1")).await;
        assert_eq!(runtime.error_kind, Some(ErrorKind::Runtime));
        assert_eq!(runtime.error.as_deref(), Some("ZeroDivisionError: division by zero"));

        let unavailable = runner.run(3, &case("[1]", "1")).await;
        assert_eq!(unavailable.error_kind, Some(ErrorKind::Runtime));
        assert!(unavailable.error.unwrap().starts_with("Sandbox failure"));
    }

    #[test]
    fn test_judge_runtime_without_stderr_reports_exit_code() {
        let output = exit(139, "", "").unwrap();
        let outcome = judge(&sum_entry(), ComparePolicy::Exact, &[], "1", &output);
        assert_eq!(
            outcome,
            CaseOutcome::Errored {
                kind: ErrorKind::Runtime,
                message: "Process exited with code 139".to_string(),
            }
        );
    }

    #[test]
    fn test_judge_requires_well_formed_result() {
        let silent = exit(0, "debug print\n", "").unwrap();
        assert!(matches!(
            judge(&sum_entry(), ComparePolicy::Exact, &[], "1", &silent),
            CaseOutcome::Errored { kind: ErrorKind::Runtime, .. }
        ));

        let wrong_type = exit(0, "@@gradebox-result@@[1, 2]\n", "").unwrap();
        match judge(&sum_entry(), ComparePolicy::Exact, &[], "3", &wrong_type) {
            CaseOutcome::Errored { kind, message } => {
                assert_eq!(kind, ErrorKind::Runtime);
                assert!(message.starts_with("Result is not a valid int"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let printed_then_result = exit(0, "thinking...\n@@gradebox-result@@42\n", "").unwrap();
        assert_eq!(
            judge(&sum_entry(), ComparePolicy::Exact, &[], "42", &printed_then_result),
            CaseOutcome::Passed {
                actual: "42".to_string()
            }
        );
    }

    #[test]
    fn test_pair_sum_rejects_bad_pairs() {
        let arguments = vec![Value::IntArray(vec![3, 3, 4]), Value::Int(6)];
        assert!(is_pair_sum(&arguments, &Value::IntArray(vec![0, 1])));
        assert!(is_pair_sum(&arguments, &Value::IntArray(vec![1, 0])));
        assert!(!is_pair_sum(&arguments, &Value::IntArray(vec![0, 0])));
        assert!(!is_pair_sum(&arguments, &Value::IntArray(vec![0, 3])));
        assert!(!is_pair_sum(&arguments, &Value::IntArray(vec![-1, 1])));
        assert!(!is_pair_sum(&arguments, &Value::IntArray(vec![0, 1, 2])));
        assert!(!is_pair_sum(&arguments, &Value::IntArray(vec![0, 2])));

        let overflow = vec![Value::IntArray(vec![i64::MAX, 1]), Value::Int(i64::MIN)];
        assert!(!is_pair_sum(&overflow, &Value::IntArray(vec![0, 1])));
    }

    #[test]
    fn test_oversized_input_is_parse_error() {
        let huge = case(&"1,".repeat(MAX_INPUT_BYTES / 2 + 1), "0");
        let err = prepare_arguments(&sum_entry(), ComparePolicy::Exact, &huge).unwrap_err();
        assert!(matches!(err, ParseError::TooLarge { .. }));
    }

    #[test]
    fn test_pair_sum_target_must_be_integer() {
        let err = prepare_arguments(
            &EntryPoint::default(),
            ComparePolicy::PairSum,
            &case("[2,7,11,15]", "nine"),
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::InvalidToken { .. }));
    }
}

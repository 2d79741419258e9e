/// Input Codec - Test Input Parsing and Canonical Rendering
///
/// **Core Responsibility:**
/// Turn the textual `input` of a test case into typed argument values, and
/// turn values returned by a submission back into the one canonical string
/// form that `expectedOutput` is compared against.
///
/// **Accepted list forms:**
/// - Bracketed: `[2, 7, 11, 15]`, `[2,7,11,15]`, `[]`
/// - Bare: `2,7,11,15`
/// - Surrounding whitespace is ignored, as is whitespace around each element
///
/// **Canonical form:**
/// - `[a, b, c]`: brackets, comma followed by exactly one space
/// - `[]` for the empty list
/// - Plain decimal for scalar ints
///
/// Any empty element (`[2,,15]`), non-integer element, or unbalanced
/// bracket is a `ParseError`; nothing is silently dropped.
use gradebox_common::types::ValueType;
use std::fmt;

const EXCERPT_CHARS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty input")]
    Empty,

    #[error("empty element at position {position} in {input:?}")]
    EmptyToken { position: usize, input: String },

    #[error("invalid integer {token:?} in {input:?}")]
    InvalidToken { token: String, input: String },

    #[error("unbalanced brackets in {input:?}")]
    UnbalancedBrackets { input: String },

    #[error("expected {expected} argument(s) but found {found} in {input:?}")]
    ArityMismatch {
        expected: usize,
        found: usize,
        input: String,
    },

    #[error("input of {bytes} bytes exceeds maximum size of {limit} bytes")]
    TooLarge { bytes: usize, limit: usize },
}

/// A typed argument or return value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    IntArray(Vec<i64>),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Int(_) => ValueType::Int,
            Value::IntArray(_) => ValueType::IntArray,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Value::Int(n) => n.to_string(),
            Value::IntArray(values) => render(values),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Parse a bracketed or bare comma-separated list of integers.
pub fn parse(input: &str) -> Result<Vec<i64>, ParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }

    let body = match (trimmed.starts_with('['), trimmed.ends_with(']')) {
        (true, true) if trimmed.len() >= 2 => &trimmed[1..trimmed.len() - 1],
        (false, false) => trimmed,
        _ => {
            return Err(ParseError::UnbalancedBrackets {
                input: excerpt(input),
            })
        }
    };

    if body.trim().is_empty() {
        return Ok(Vec::new());
    }

    body.split(',')
        .enumerate()
        .map(|(position, token)| parse_int_token(token, position, input))
        .collect()
}

/// Render integers in canonical list form.
pub fn render(values: &[i64]) -> String {
    let items: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    format!("[{}]", items.join(", "))
}

/// Parse a single value of the given type.
pub fn parse_value(text: &str, ty: ValueType) -> Result<Value, ParseError> {
    match ty {
        ValueType::IntArray => parse(text).map(Value::IntArray),
        ValueType::Int => {
            if text.trim().is_empty() {
                return Err(ParseError::Empty);
            }
            parse_int_token(text, 0, text).map(Value::Int)
        }
    }
}

/// Parse a whole test input against an ordered parameter list.
///
/// A single parameter consumes the entire input, so `2,7,11,15` is still a
/// valid `int[]`. With several parameters the input is split at top-level
/// commas: `[2,7,11,15], 9`.
pub fn parse_arguments(input: &str, params: &[ValueType]) -> Result<Vec<Value>, ParseError> {
    match params {
        [] if input.trim().is_empty() => Ok(Vec::new()),
        [] => Err(ParseError::ArityMismatch {
            expected: 0,
            found: 1,
            input: excerpt(input),
        }),
        [only] => Ok(vec![parse_value(input, *only)?]),
        _ => {
            let segments = split_top_level(input)?;
            if segments.len() != params.len() {
                return Err(ParseError::ArityMismatch {
                    expected: params.len(),
                    found: segments.len(),
                    input: excerpt(input),
                });
            }
            segments
                .into_iter()
                .zip(params)
                .map(|(segment, ty)| parse_value(segment, *ty))
                .collect()
        }
    }
}

/// Normalize a list to canonical form.
pub fn canonicalize(input: &str) -> Result<String, ParseError> {
    parse(input).map(|values| render(&values))
}

fn split_top_level(input: &str) -> Result<Vec<&str>, ParseError> {
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;

    for (i, c) in input.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth = depth.checked_sub(1).ok_or_else(|| ParseError::UnbalancedBrackets {
                    input: excerpt(input),
                })?;
            }
            ',' if depth == 0 => {
                segments.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }

    if depth != 0 {
        return Err(ParseError::UnbalancedBrackets {
            input: excerpt(input),
        });
    }
    segments.push(&input[start..]);
    Ok(segments)
}

fn parse_int_token(token: &str, position: usize, input: &str) -> Result<i64, ParseError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(ParseError::EmptyToken {
            position,
            input: excerpt(input),
        });
    }
    token.parse::<i64>().map_err(|_| ParseError::InvalidToken {
        token: token.chars().take(EXCERPT_CHARS).collect(),
        input: excerpt(input),
    })
}

fn excerpt(input: &str) -> String {
    let mut chars = input.chars();
    let head: String = chars.by_ref().take(EXCERPT_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

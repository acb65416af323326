//! Condition and loop-source evaluation.
//!
//! Conditions are small boolean expressions over scope variables:
//!
//! - logical `||`, `&&`, prefix `!`, and parentheses
//! - comparisons `==`, `!=`, `<`, `<=`, `>`, `>=` (`===`/`!==` are accepted as aliases)
//! - infix `contains` for substrings, array membership, and object keys
//! - `exists(path)` / `exists path`, true iff the path resolves to a defined value
//!
//! Operands are quoted strings (placeholders inside are expanded), numbers, `true`,
//! `false`, `null`, JSON arrays/objects, `{{ path }}` placeholders, or bare paths.
//! A missing variable is an [`EvalError::MissingVariable`] except under `exists` and in
//! an equality test against `null`.

use serde_json::{Number, Value};
use stepflow_types::{CountSpec, workflow::DEFAULT_BRANCH_CONDITION};

use crate::{
    error::EvalError,
    resolve::{format_json_value, resolve, single_placeholder, unresolved_placeholders},
    scope::Scope,
};

const COMPARISON_OPERATORS: [(&str, Comparison); 9] = [
    ("===", Comparison::Equal),
    ("!==", Comparison::NotEqual),
    ("==", Comparison::Equal),
    ("!=", Comparison::NotEqual),
    (">=", Comparison::GreaterOrEqual),
    ("<=", Comparison::LessOrEqual),
    (">", Comparison::Greater),
    ("<", Comparison::Less),
    (" contains ", Comparison::Contains),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Equal,
    NotEqual,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
    Contains,
}

impl Comparison {
    fn symbol(self) -> &'static str {
        match self {
            Comparison::Equal => "==",
            Comparison::NotEqual => "!=",
            Comparison::Greater => ">",
            Comparison::GreaterOrEqual => ">=",
            Comparison::Less => "<",
            Comparison::LessOrEqual => "<=",
            Comparison::Contains => "contains",
        }
    }
}

/// A resolved operand. `Missing` carries the path that failed to resolve.
#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Value(Value),
    Missing(String),
}

/// Evaluates a boolean condition. The literal `default` is always true.
pub fn eval_bool(expression: &str, scope: &Scope) -> Result<bool, EvalError> {
    let normalized = normalize_expression(expression);
    if normalized.is_empty() {
        return Err(EvalError::Empty);
    }
    if normalized == DEFAULT_BRANCH_CONDITION {
        return Ok(true);
    }
    eval_node(normalized, scope)
}

/// Evaluates a loop source to an array. JSON strings holding an array are decoded.
pub fn eval_array(expression: &str, scope: &Scope) -> Result<Vec<Value>, EvalError> {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        return Err(EvalError::Empty);
    }
    match eval_operand(trimmed, scope)? {
        Operand::Missing(path) => Err(EvalError::MissingVariable(path)),
        Operand::Value(Value::Array(items)) => Ok(items),
        Operand::Value(Value::String(text)) => match serde_json::from_str::<Value>(&text) {
            Ok(Value::Array(items)) => Ok(items),
            _ => Err(EvalError::NotAnArray {
                expression: trimmed.to_string(),
                found: describe(&Value::String(text)),
            }),
        },
        Operand::Value(other) => Err(EvalError::NotAnArray {
            expression: trimmed.to_string(),
            found: describe(&other),
        }),
    }
}

/// Evaluates an iteration count expression.
pub fn eval_count(expression: &str, scope: &Scope) -> Result<u64, EvalError> {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        return Err(EvalError::Empty);
    }
    let value = match eval_operand(trimmed, scope)? {
        Operand::Missing(path) => return Err(EvalError::MissingVariable(path)),
        Operand::Value(value) => value,
    };
    let count = match &value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|float| float.fract() == 0.0 && *float >= 0.0).map(|float| float as u64)),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    };
    count.ok_or_else(|| EvalError::InvalidCount {
        expression: trimmed.to_string(),
        found: describe(&value),
    })
}

/// Evaluates a loop count declared either literally or as an expression.
pub fn eval_count_spec(spec: &CountSpec, scope: &Scope) -> Result<u64, EvalError> {
    match spec {
        CountSpec::Literal(count) => Ok(*count),
        CountSpec::Expression(expression) => eval_count(expression, scope),
    }
}

/// Trims and unwraps a whole-expression placeholder such as `{{ a == 1 }}`.
///
/// A placeholder around a plain path is kept, since it is an operand reference.
fn normalize_expression(expression: &str) -> &str {
    let trimmed = expression.trim();
    match single_placeholder(trimmed) {
        Some(inner) if !is_path_expression(inner) => inner.trim(),
        _ => trimmed,
    }
}

fn eval_node(expression: &str, scope: &Scope) -> Result<bool, EvalError> {
    let expression = expression.trim();
    if expression.is_empty() {
        return Err(EvalError::Syntax {
            expression: expression.to_string(),
            reason: "missing operand",
        });
    }

    if let Some(parts) = split_expression(expression, "||") {
        for part in parts {
            if eval_node(part, scope)? {
                return Ok(true);
            }
        }
        return Ok(false);
    }
    if let Some(parts) = split_expression(expression, "&&") {
        for part in parts {
            if !eval_node(part, scope)? {
                return Ok(false);
            }
        }
        return Ok(true);
    }

    let (negations, inner) = strip_leading_negations(expression);
    if negations > 0 {
        if inner.trim().is_empty() {
            return Err(EvalError::Syntax {
                expression: expression.to_string(),
                reason: "expression cannot end with a negation",
            });
        }
        let value = eval_node(inner, scope)?;
        return Ok(if negations % 2 == 1 { !value } else { value });
    }

    if let Some(grouped) = strip_wrapping_parentheses(inner) {
        return eval_node(grouped, scope);
    }

    if let Some(argument) = exists_argument(inner) {
        let path = single_placeholder(argument).unwrap_or(argument).trim();
        return Ok(!path.is_empty() && scope.exists(path));
    }

    for (symbol, comparison) in COMPARISON_OPERATORS {
        if let Some(position) = find_top_level_operator(inner, symbol) {
            let left = inner[..position].trim();
            let right = inner[position + symbol.len()..].trim();
            if left.is_empty() || right.is_empty() {
                return Err(EvalError::Syntax {
                    expression: inner.to_string(),
                    reason: "comparison requires both operands",
                });
            }
            let left = eval_operand(left, scope)?;
            let right = eval_operand(right, scope)?;
            return compare(comparison, left, right);
        }
    }

    match eval_operand(inner, scope)? {
        Operand::Missing(path) => Err(EvalError::MissingVariable(path)),
        Operand::Value(value) => Ok(is_truthy(&value)),
    }
}

fn eval_operand(text: &str, scope: &Scope) -> Result<Operand, EvalError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(EvalError::Syntax {
            expression: text.to_string(),
            reason: "missing operand",
        });
    }

    if let Some(inner) = strip_quotes(text) {
        if let Some(missing) = unresolved_placeholders(inner, scope).into_iter().next() {
            return Ok(Operand::Missing(missing));
        }
        return Ok(Operand::Value(Value::String(resolve(inner, scope))));
    }

    if let Some(path) = single_placeholder(text) {
        return Ok(match scope.lookup(path) {
            Some(value) => Operand::Value(value),
            None => Operand::Missing(path.to_string()),
        });
    }

    if text.contains("{{") {
        if let Some(missing) = unresolved_placeholders(text, scope).into_iter().next() {
            return Ok(Operand::Missing(missing));
        }
        let rendered = resolve(text, scope);
        return Ok(Operand::Value(parse_literal(&rendered).unwrap_or(Value::String(rendered))));
    }

    if let Some(literal) = parse_literal(text) {
        return Ok(Operand::Value(literal));
    }
    if looks_like_json_literal(text) {
        return Err(EvalError::Syntax {
            expression: text.to_string(),
            reason: "malformed literal",
        });
    }

    if is_path_expression(text) {
        return Ok(match scope.lookup(text) {
            Some(value) => Operand::Value(value),
            None => Operand::Missing(text.to_string()),
        });
    }

    Err(EvalError::Syntax {
        expression: text.to_string(),
        reason: "unsupported operand",
    })
}

fn compare(comparison: Comparison, left: Operand, right: Operand) -> Result<bool, EvalError> {
    let (left, right) = match (left, right) {
        (Operand::Value(left), Operand::Value(right)) => (left, right),
        (Operand::Missing(_), Operand::Value(Value::Null)) | (Operand::Value(Value::Null), Operand::Missing(_))
            if matches!(comparison, Comparison::Equal | Comparison::NotEqual) =>
        {
            return Ok(comparison == Comparison::Equal);
        }
        (Operand::Missing(path), _) | (_, Operand::Missing(path)) => return Err(EvalError::MissingVariable(path)),
    };

    match comparison {
        Comparison::Equal => Ok(loose_equals(&left, &right)),
        Comparison::NotEqual => Ok(!loose_equals(&left, &right)),
        Comparison::Contains => contains(&left, &right),
        relational => {
            let ordering = match (as_number(&left), as_number(&right)) {
                (Some(left_number), Some(right_number)) => left_number.partial_cmp(&right_number),
                _ => match (&left, &right) {
                    (Value::String(left_text), Value::String(right_text)) => Some(left_text.cmp(right_text)),
                    _ => None,
                },
            };
            let Some(ordering) = ordering else {
                return Err(type_mismatch(relational, &left, &right));
            };
            Ok(match relational {
                Comparison::Greater => ordering.is_gt(),
                Comparison::GreaterOrEqual => ordering.is_ge(),
                Comparison::Less => ordering.is_lt(),
                _ => ordering.is_le(),
            })
        }
    }
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool, EvalError> {
    match haystack {
        Value::String(text) => Ok(text.contains(&format_json_value(needle))),
        Value::Array(items) => Ok(items.iter().any(|item| loose_equals(item, needle))),
        Value::Object(map) => Ok(map.contains_key(&format_json_value(needle))),
        other => Err(type_mismatch(Comparison::Contains, other, needle)),
    }
}

fn type_mismatch(comparison: Comparison, left: &Value, right: &Value) -> EvalError {
    EvalError::TypeMismatch {
        operator: comparison.symbol(),
        left: describe(left),
        right: describe(right),
    }
}

/// Equality with numeric and textual coercion: `1 == "1"`, `true == "true"`.
fn loose_equals(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    if left.is_null() || right.is_null() {
        return false;
    }
    if let (Some(left_number), Some(right_number)) = (as_number(left), as_number(right)) {
        return left_number == right_number;
    }
    match (left, right) {
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => false,
        _ => format_json_value(left) == format_json_value(right),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok().filter(|number| number.is_finite()),
        _ => None,
    }
}

/// Truthiness: non-zero numbers, non-empty collections, and strings other than `""`, `false`, and `0`.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|number| number != 0.0),
        Value::String(text) => {
            let text = text.trim();
            !(text.is_empty() || text.eq_ignore_ascii_case("false") || text == "0")
        }
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn describe(value: &Value) -> String {
    let kind = match value {
        Value::Null => return "null".to_string(),
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    let mut rendered = value.to_string();
    if rendered.len() > 60 {
        let cut = (0..=60).rev().find(|index| rendered.is_char_boundary(*index)).unwrap_or(0);
        rendered.truncate(cut);
        rendered.push('…');
    }
    format!("{kind} {rendered}")
}

fn parse_literal(text: &str) -> Option<Value> {
    match text {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        "null" => return Some(Value::Null),
        _ => {}
    }
    if let Ok(integer) = text.parse::<i64>() {
        return Some(Value::Number(integer.into()));
    }
    if let Ok(float) = text.parse::<f64>()
        && let Some(number) = Number::from_f64(float)
    {
        return Some(Value::Number(number));
    }
    if text.starts_with('[') || text.starts_with('{') {
        return serde_json::from_str(text).ok();
    }
    None
}

fn looks_like_json_literal(expression: &str) -> bool {
    let starts_like_number = expression
        .chars()
        .next()
        .map(|character| character == '-' || character.is_ascii_digit())
        .unwrap_or(false);
    expression.starts_with('[') || expression.starts_with('{') || starts_like_number
}

fn strip_quotes(text: &str) -> Option<&str> {
    let first = text.chars().next()?;
    if (first == '\'' || first == '"') && text.len() >= 2 && text.ends_with(first) {
        let inner = &text[1..text.len() - 1];
        if !inner.contains(first) {
            return Some(inner);
        }
    }
    None
}

fn is_path_expression(expression: &str) -> bool {
    let mut characters = expression.chars();
    let Some(first) = characters.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && characters.all(|character| character.is_ascii_alphanumeric() || matches!(character, '_' | '-' | '.' | '[' | ']'))
}

fn exists_argument(expression: &str) -> Option<&str> {
    let rest = expression.strip_prefix("exists")?;
    if let Some(call) = rest.trim_start().strip_prefix('(') {
        return call.trim_end().strip_suffix(')').map(str::trim);
    }
    if rest.starts_with(char::is_whitespace) {
        return Some(rest.trim());
    }
    None
}

fn strip_wrapping_parentheses(expression: &str) -> Option<&str> {
    let inner = expression.strip_prefix('(')?.strip_suffix(')')?;
    // The opening parenthesis must close at the very end, not earlier.
    let mut depth = 0i32;
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    for character in inner.chars() {
        match character {
            '\'' if !in_double_quote => in_single_quote = !in_single_quote,
            '"' if !in_single_quote => in_double_quote = !in_double_quote,
            '(' if !in_single_quote && !in_double_quote => depth += 1,
            ')' if !in_single_quote && !in_double_quote => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
            }
            _ => {}
        }
    }
    (depth == 0).then_some(inner)
}

fn split_expression<'a>(expression: &'a str, operator: &str) -> Option<Vec<&'a str>> {
    let mut parts = Vec::new();
    let mut start = 0usize;
    let length = expression.len();

    while start < length {
        if let Some(relative_index) = find_top_level_operator(&expression[start..], operator) {
            let absolute_index = start + relative_index;
            parts.push(expression[start..absolute_index].trim());
            start = absolute_index + operator.len();
        } else {
            parts.push(expression[start..].trim());
            break;
        }
    }

    if parts.len() > 1 { Some(parts) } else { None }
}

fn strip_leading_negations(expression: &str) -> (usize, &str) {
    let mut count = 0usize;
    let mut remainder = expression.trim_start();
    while let Some(stripped) = remainder.strip_prefix('!') {
        if stripped.starts_with('=') {
            break;
        }
        count += 1;
        remainder = stripped.trim_start();
    }
    (count, remainder)
}

fn find_top_level_operator(expression: &str, operator: &str) -> Option<usize> {
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    let mut depth = 0i32;

    for (index, character) in expression.char_indices() {
        match character {
            '\'' if !in_double_quote => {
                in_single_quote = !in_single_quote;
                continue;
            }
            '"' if !in_single_quote => {
                in_double_quote = !in_double_quote;
                continue;
            }
            '(' if !in_single_quote && !in_double_quote => {
                depth += 1;
                continue;
            }
            ')' if !in_single_quote && !in_double_quote => {
                if depth > 0 {
                    depth -= 1;
                }
                continue;
            }
            _ => {}
        }

        if !in_single_quote && !in_double_quote && depth == 0 && expression[index..].starts_with(operator) {
            return Some(index);
        }
    }

    None
}

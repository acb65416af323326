//! # Template Resolution and Secret Masking
//!
//! Templates reference scope variables with `{{ path }}` placeholders, where `path` is a
//! variable name optionally followed by dotted fields and `[n]` indices:
//!
//! - `{{ base_url }}` - top-level variable
//! - `{{ user.id }}` - object field
//! - `{{ items[0].name }}` - array element field
//!
//! Resolution never fails. A placeholder whose path does not resolve is kept verbatim so a
//! partially configured step stays inspectable. Resolution is a pure function of the text
//! and the scope.
//!
//! ## Usage
//!
//! ```rust
//! use serde_json::json;
//! use stepflow_engine::{Scope, resolve::{mask, resolve}};
//! use std::collections::BTreeSet;
//!
//! let mut scope = Scope::new();
//! scope.set("user", json!({ "id": 42 }));
//! scope.set_secret("token", json!("s3cr3t"));
//!
//! assert_eq!(resolve("/users/{{ user.id }}", &scope), "/users/42");
//! assert_eq!(resolve("{{ missing }}", &scope), "{{ missing }}");
//!
//! let rendered = resolve("Bearer {{token}}", &scope);
//! assert_eq!(mask(&rendered, &scope.secrets()), "Bearer ******");
//! ```

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;

use crate::scope::Scope;

/// Marker substituted for secret values in rendered text.
pub const DEFAULT_REDACTION_MARKER: &str = "******";

static PLACEHOLDER_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").expect("placeholder regex should compile"));

/// Expands every `{{ path }}` placeholder in `text` against `scope`.
pub fn resolve(text: &str, scope: &Scope) -> String {
    if !text.contains("{{") {
        return text.to_string();
    }
    PLACEHOLDER_REGEX
        .replace_all(text, |captures: &Captures| {
            let path = captures.get(1).map(|matched| matched.as_str()).unwrap_or_default();
            match scope.lookup(path) {
                Some(value) if !path.is_empty() => format_json_value(&value),
                _ => captures[0].to_string(),
            }
        })
        .into_owned()
}

/// Returns the placeholder paths in `text` that do not resolve against `scope`.
pub fn unresolved_placeholders(text: &str, scope: &Scope) -> Vec<String> {
    PLACEHOLDER_REGEX
        .captures_iter(text)
        .filter_map(|captures| captures.get(1).map(|matched| matched.as_str().to_string()))
        .filter(|path| path.is_empty() || scope.lookup(path).is_none())
        .collect()
}

/// Returns the path when `text` is exactly one placeholder, for example `{{ items }}`.
pub fn single_placeholder(text: &str) -> Option<&str> {
    let captures = PLACEHOLDER_REGEX.captures(text.trim())?;
    let whole = captures.get(0)?;
    if whole.as_str().len() != text.trim().len() {
        return None;
    }
    captures.get(1).map(|matched| matched.as_str())
}

/// Replaces every literal occurrence of a secret in `text` with [`DEFAULT_REDACTION_MARKER`].
pub fn mask(text: &str, secrets: &BTreeSet<String>) -> String {
    mask_with(text, secrets, DEFAULT_REDACTION_MARKER)
}

/// Replaces every literal occurrence of a secret in `text` with `marker`.
///
/// Longer secrets are matched first so a secret containing another is fully hidden.
pub fn mask_with(text: &str, secrets: &BTreeSet<String>, marker: &str) -> String {
    let mut ordered: Vec<&str> = secrets.iter().map(String::as_str).filter(|secret| !secret.is_empty()).collect();
    if ordered.is_empty() {
        return text.to_string();
    }
    ordered.sort_by_key(|secret| std::cmp::Reverse(secret.len()));

    let pattern = ordered.iter().map(|secret| regex::escape(secret)).collect::<Vec<_>>().join("|");
    match Regex::new(&pattern) {
        Ok(regex) => regex.replace_all(text, regex::NoExpand(marker)).into_owned(),
        Err(_) => ordered
            .iter()
            .fold(text.to_string(), |masked, secret| masked.replace(secret, marker)),
    }
}

/// Masks every string inside a JSON value.
pub fn mask_value(value: &Value, secrets: &BTreeSet<String>, marker: &str) -> Value {
    if secrets.is_empty() {
        return value.clone();
    }
    match value {
        Value::String(text) => Value::String(mask_with(text, secrets, marker)),
        Value::Array(items) => Value::Array(items.iter().map(|item| mask_value(item, secrets, marker)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), mask_value(item, secrets, marker)))
                .collect(),
        ),
        Value::Number(number) if secrets.contains(&number.to_string()) => Value::String(marker.to_string()),
        other => other.clone(),
    }
}

/// Selects a nested value by dotted path with optional `[n]` indices.
///
/// Numeric segments also index arrays, so `items.0.name` and `items[0].name` are equivalent.
/// `None` or an empty path selects the value itself.
pub fn select_path(value: &Value, path: Option<&str>) -> Option<Value> {
    let Some(path) = path else {
        return Some(value.clone());
    };
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Some(value.clone());
    }

    let mut current = value;
    for segment in trimmed.split('.') {
        if segment.is_empty() {
            continue;
        }
        let (key, indices) = split_indices(segment)?;
        if !key.is_empty() {
            current = match current {
                Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
                other => other.get(key)?,
            };
        }
        for index in indices {
            current = current.get(index)?;
        }
    }
    Some(current.clone())
}

/// Splits `key[0][1]` into its key and indices. `None` when an index is not numeric or a
/// bracket is left open.
fn split_indices(segment: &str) -> Option<(&str, Vec<usize>)> {
    let key_end = segment.find('[').unwrap_or(segment.len());
    let key = &segment[..key_end];
    let mut indices = Vec::new();
    let mut remainder = &segment[key_end..];
    while !remainder.is_empty() {
        let open = remainder.strip_prefix('[')?;
        let close = open.find(']')?;
        indices.push(open[..close].trim().parse::<usize>().ok()?);
        remainder = &open[close + 1..];
    }
    Some((key, indices))
}

/// Formats a JSON value for substitution into text.
///
/// Strings are inserted without quotes, null renders empty, and composite values render
/// as compact JSON.
pub fn format_json_value(value: &Value) -> String {
    match value {
        Value::String(string_value) => string_value.clone(),
        Value::Number(number_value) => number_value.to_string(),
        Value::Bool(boolean_value) => boolean_value.to_string(),
        Value::Null => String::new(),
        other_value => other_value.to_string(),
    }
}

//! Layered variable scope.
//!
//! A [`Scope`] is a stack of frames. Lookups walk from the innermost frame outward and
//! stop at the first binding for the name, so an inner frame shadows outer ones without
//! mutating them. Writes name the frame they target; popping a frame discards its bindings.
//!
//! A binding may be *undefined* (`value: None`). It still shadows outer frames, and
//! lookups through it fail, which is how a missing output path is surfaced to later steps.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde_json::Value;
use stepflow_types::EnvironmentVariable;

use crate::resolve::{format_json_value, select_path};

/// A single variable binding.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub value: Option<Value>,
    /// Secret values are masked wherever they are rendered.
    pub secret: bool,
}

impl Binding {
    pub fn defined(value: Value) -> Self {
        Self { value: Some(value), secret: false }
    }

    pub fn undefined() -> Self {
        Self { value: None, secret: false }
    }
}

/// One layer of the scope stack.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    bindings: IndexMap<String, Binding>,
}

impl Frame {
    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.bindings.get(name)
    }

    pub fn bindings(&self) -> impl Iterator<Item = (&String, &Binding)> {
        self.bindings.iter()
    }

    /// Defined values in insertion order.
    pub fn values(&self) -> serde_json::Map<String, Value> {
        self.bindings
            .iter()
            .filter_map(|(name, binding)| binding.value.clone().map(|value| (name.clone(), value)))
            .collect()
    }

    fn insert(&mut self, name: String, binding: Binding) -> Option<Binding> {
        self.bindings.insert(name, binding)
    }
}

/// Sources that seed the root frame of a run.
///
/// Precedence, highest first: case variables, environment variables, workflow input defaults.
#[derive(Debug, Clone, Default)]
pub struct ScopeSeed {
    pub input_defaults: IndexMap<String, Value>,
    pub environment: Vec<EnvironmentVariable>,
    pub case_variables: IndexMap<String, Value>,
}

/// Stack of variable frames. Always holds at least the root frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Scope {
    frames: Vec<Frame>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    /// Creates a scope with an empty root frame.
    pub fn new() -> Self {
        Self {
            frames: vec![Frame::default()],
        }
    }

    /// Builds a root frame from the seed, applying the documented precedence.
    pub fn from_seed(seed: ScopeSeed) -> Self {
        let mut scope = Self::new();
        for (name, value) in seed.input_defaults {
            scope.set(name, value);
        }
        for variable in seed.environment {
            scope.bind(
                variable.name,
                Binding {
                    value: Some(variable.value),
                    secret: variable.secret,
                },
            );
        }
        for (name, value) in seed.case_variables {
            scope.set(name, value);
        }
        scope
    }

    /// Number of frames, root included.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Index of the innermost frame, suitable for [`Scope::set_in_frame`].
    pub fn current_frame(&self) -> usize {
        self.frames.len() - 1
    }

    pub fn push_frame(&mut self) {
        self.frames.push(Frame::default());
    }

    /// Pops the innermost frame. The root frame is never popped.
    pub fn pop_frame(&mut self) -> Option<Frame> {
        if self.frames.len() > 1 { self.frames.pop() } else { None }
    }

    pub fn root(&self) -> &Frame {
        &self.frames[0]
    }

    /// Binds a defined, non-secret value in the innermost frame.
    pub fn set(&mut self, name: impl Into<String>, value: Value) -> Option<Binding> {
        self.bind(name, Binding::defined(value))
    }

    /// Binds a secret value in the innermost frame.
    pub fn set_secret(&mut self, name: impl Into<String>, value: Value) -> Option<Binding> {
        self.bind(name, Binding { value: Some(value), secret: true })
    }

    /// Writes `binding` into the innermost frame and returns the frame's previous binding.
    pub fn bind(&mut self, name: impl Into<String>, binding: Binding) -> Option<Binding> {
        let index = self.current_frame();
        self.bind_in_frame(index, name, binding)
    }

    /// Writes a value (or an undefined binding) into a specific frame.
    ///
    /// Indices past the innermost frame are clamped to it.
    pub fn set_in_frame(&mut self, frame: usize, name: impl Into<String>, value: Option<Value>) -> Option<Binding> {
        self.bind_in_frame(frame, name, Binding { value, secret: false })
    }

    /// Writes `binding` into a specific frame, clamped like [`Scope::set_in_frame`].
    pub fn bind_in_frame(&mut self, frame: usize, name: impl Into<String>, binding: Binding) -> Option<Binding> {
        let index = frame.min(self.current_frame());
        self.frames[index].insert(name.into(), binding)
    }

    /// Flags the nearest binding for `name` as secret. Returns false when no binding exists.
    pub fn mark_secret(&mut self, name: &str) -> bool {
        match self.frames.iter_mut().rev().find_map(|frame| frame.bindings.get_mut(name)) {
            Some(binding) => {
                binding.secret = true;
                true
            }
            None => false,
        }
    }

    /// Nearest binding for `name`, defined or not.
    pub fn binding(&self, name: &str) -> Option<&Binding> {
        self.frames.iter().rev().find_map(|frame| frame.get(name))
    }

    /// Value of a top-level variable.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.binding(name).and_then(|binding| binding.value.as_ref())
    }

    /// Resolves a dotted/indexed path such as `user.id` or `items[0].name`.
    ///
    /// Returns `None` when the root variable is missing or undefined, or when the
    /// remainder of the path does not exist in its value.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let path = path.trim();
        let split_at = path.find(['.', '[']).unwrap_or(path.len());
        let (root, rest) = path.split_at(split_at);
        if root.is_empty() {
            return None;
        }
        let value = self.get(root)?;
        let rest = rest.strip_prefix('.').unwrap_or(rest);
        select_path(value, Some(rest))
    }

    /// True when `path` resolves to a defined value.
    pub fn exists(&self, path: &str) -> bool {
        self.lookup(path).is_some()
    }

    /// Stringified values of every visible secret binding.
    pub fn secrets(&self) -> BTreeSet<String> {
        let mut secrets = BTreeSet::new();
        for frame in &self.frames {
            for binding in frame.bindings.values() {
                if binding.secret
                    && let Some(value) = &binding.value
                {
                    let rendered = format_json_value(value);
                    if !rendered.is_empty() {
                        secrets.insert(rendered);
                    }
                }
            }
        }
        secrets
    }

    /// Visible defined values, innermost bindings winning.
    pub fn visible(&self) -> IndexMap<String, Value> {
        let mut visible: IndexMap<String, Option<Value>> = IndexMap::new();
        for frame in &self.frames {
            for (name, binding) in &frame.bindings {
                visible.insert(name.clone(), binding.value.clone());
            }
        }
        visible.into_iter().filter_map(|(name, value)| value.map(|value| (name, value))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inner_frames_shadow_without_mutating_outer_frames() {
        let mut scope = Scope::new();
        scope.set("item", json!("outer"));
        scope.push_frame();
        scope.set("item", json!("inner"));
        assert_eq!(scope.get("item"), Some(&json!("inner")));

        scope.pop_frame();
        assert_eq!(scope.get("item"), Some(&json!("outer")));
    }

    #[test]
    fn undefined_binding_shadows_outer_value() {
        let mut scope = Scope::new();
        scope.set("token", json!("abc"));
        scope.push_frame();
        scope.set_in_frame(scope.current_frame(), "token", None);
        assert!(scope.binding("token").is_some());
        assert_eq!(scope.lookup("token"), None);
        assert!(!scope.exists("token"));
    }

    #[test]
    fn lookup_navigates_nested_objects_and_indices() {
        let mut scope = Scope::new();
        scope.set("user", json!({ "id": 7, "roles": ["admin", "dev"] }));
        scope.set("items", json!([{ "name": "first" }]));

        assert_eq!(scope.lookup("user.id"), Some(json!(7)));
        assert_eq!(scope.lookup("user.roles[1]"), Some(json!("dev")));
        assert_eq!(scope.lookup("items[0].name"), Some(json!("first")));
        assert_eq!(scope.lookup("user.missing"), None);
        assert_eq!(scope.lookup("nobody"), None);
    }

    #[test]
    fn seed_precedence_prefers_case_then_environment_then_defaults() {
        let seed = ScopeSeed {
            input_defaults: IndexMap::from([("region".to_string(), json!("eu")), ("tier".to_string(), json!("free"))]),
            environment: vec![
                EnvironmentVariable {
                    name: "region".into(),
                    value: json!("us"),
                    secret: false,
                },
                EnvironmentVariable {
                    name: "api_key".into(),
                    value: json!("s3cr3t"),
                    secret: true,
                },
            ],
            case_variables: IndexMap::from([("region".to_string(), json!("ap"))]),
        };
        let scope = Scope::from_seed(seed);

        assert_eq!(scope.get("region"), Some(&json!("ap")));
        assert_eq!(scope.get("tier"), Some(&json!("free")));
        assert_eq!(scope.secrets(), BTreeSet::from(["s3cr3t".to_string()]));
    }

    #[test]
    fn root_frame_is_never_popped() {
        let mut scope = Scope::new();
        assert!(scope.pop_frame().is_none());
        assert_eq!(scope.depth(), 1);
    }
}

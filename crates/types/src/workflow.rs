//! Strongly typed step tree definitions shared by the engine and the CLI.
//!
//! A workflow is an ordered list of [`Step`]s. Each step carries the fields common to every
//! node (identity, run condition, input and output bindings) and a [`StepKind`] payload that
//! is specific to its shape. Maps use `IndexMap` so authoring order survives a round trip.

pub mod validation;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

pub use validation::{ValidationIssue, validate_steps, validate_workflow};

/// Reserved branch condition that matches when no earlier branch did.
pub const DEFAULT_BRANCH_CONDITION: &str = "default";

/// Action type that invokes another workflow from the engine's library.
pub const SUB_WORKFLOW_ACTION: &str = "workflow";

/// A complete workflow document: metadata, input defaults, case variables, and steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Canonical workflow identifier used for sub-workflow lookups.
    #[serde(default)]
    pub workflow: String,
    /// Optional human-readable name.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Declared inputs keyed by name, in authoring order.
    #[serde(default)]
    pub inputs: IndexMap<String, WorkflowInput>,
    /// Case-level variables. These shadow environment variables and input defaults.
    #[serde(default)]
    pub variables: IndexMap<String, JsonValue>,
    /// Ordered root steps.
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl WorkflowDefinition {
    /// Returns the declared input defaults in authoring order.
    pub fn input_defaults(&self) -> IndexMap<String, JsonValue> {
        self.inputs
            .iter()
            .filter_map(|(name, input)| input.default.clone().map(|value| (name.clone(), value)))
            .collect()
    }
}

/// Declares a single workflow input.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInput {
    #[serde(default)]
    pub description: Option<String>,
    /// Value used when neither the environment nor the case supplies one.
    #[serde(default)]
    pub default: Option<JsonValue>,
    /// Marks the value as sensitive so it is masked in traces and logs.
    #[serde(default)]
    pub secret: bool,
}

/// A variable contributed by the selected environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: JsonValue,
    #[serde(default)]
    pub secret: bool,
}

/// A node of the step tree.
///
/// The per-kind payload lives in [`StepKind`] and is flattened into the same document
/// object, discriminated by the `kind` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Identifier unique within the workflow.
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Boolean expression; when it evaluates false the step and its subtree are skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Disabled steps are recorded as skipped without evaluating anything.
    #[serde(default, skip_serializing_if = "is_false")]
    pub disabled: bool,
    /// When set, a failure of this step does not stop its later siblings.
    #[serde(default, skip_serializing_if = "is_false")]
    pub continue_on_fail: bool,
    /// Per-attempt timeout for action steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Parameter name to template string, resolved before the action runs.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub inputs: IndexMap<String, String>,
    /// Result path to variable name, published after a successful action.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub outputs: IndexMap<String, String>,
    #[serde(flatten)]
    pub kind: StepKind,
}

impl Step {
    /// Human-facing label: the name when present, otherwise the id.
    pub fn label(&self) -> &str {
        if self.name.trim().is_empty() { &self.id } else { &self.name }
    }

    pub fn kind_tag(&self) -> StepKindTag {
        self.kind.tag()
    }

    /// Direct child steps reachable without evaluating anything, including every branch body.
    pub fn nested_steps(&self) -> Vec<&Step> {
        match &self.kind {
            StepKind::Action(_) => Vec::new(),
            StepKind::Group { children } | StepKind::Loop { children, .. } => children.iter().collect(),
            StepKind::Branch { branches } => branches.iter().flat_map(|branch| branch.children.iter()).collect(),
        }
    }
}

/// Kind-specific payload of a [`Step`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StepKind {
    /// Leaf step handed to the action executor.
    Action(ActionStep),
    /// Sequential body sharing the enclosing scope.
    Group {
        #[serde(default)]
        children: Vec<Step>,
    },
    /// Repeats `children` according to `loop`.
    Loop {
        #[serde(rename = "loop")]
        config: LoopConfig,
        #[serde(default)]
        children: Vec<Step>,
    },
    /// Runs the body of the first matching branch.
    Branch {
        #[serde(default)]
        branches: Vec<BranchConfig>,
    },
}

impl StepKind {
    pub fn tag(&self) -> StepKindTag {
        match self {
            StepKind::Action(_) => StepKindTag::Action,
            StepKind::Group { .. } => StepKindTag::Group,
            StepKind::Loop { .. } => StepKindTag::Loop,
            StepKind::Branch { .. } => StepKindTag::Branch,
        }
    }
}

/// Payload-free discriminant of [`StepKind`], used by the execution trace.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum StepKindTag {
    Action,
    Group,
    Loop,
    Branch,
}

/// Opaque action description. The interpreter never inspects `config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionStep {
    /// Executor-defined action subtype, for example `http` or `command`.
    pub action_type: String,
    #[serde(default)]
    pub config: JsonMap<String, JsonValue>,
}

/// Re-attempt policy for action steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Additional attempts after the first failure.
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub delay_ms: u64,
}

/// Iteration strategy for a loop step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum LoopType {
    #[serde(alias = "foreach", alias = "for_each")]
    ForEach,
    While,
    Count,
}

/// Loop configuration. Which expression field is required depends on [`LoopType`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfig {
    #[serde(rename = "type")]
    pub loop_type: LoopType,
    /// Expression yielding an array (`forEach`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Boolean expression checked before every iteration (`while`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Iteration count or an expression yielding one (`count`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<CountSpec>,
    #[serde(default = "default_item_var")]
    pub item_var: String,
    #[serde(default = "default_index_var")]
    pub index_var: String,
    /// Hard iteration ceiling. Falls back to the engine default when absent or zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    /// Stops the loop before an iteration when it evaluates true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub break_condition: Option<String>,
    /// Skips an iteration's body when it evaluates true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_condition: Option<String>,
    /// Ends the loop after the first failed iteration.
    #[serde(default, skip_serializing_if = "is_false")]
    pub stop_on_failure: bool,
}

impl LoopConfig {
    /// Builds a configuration of the given type with default variable names.
    pub fn new(loop_type: LoopType) -> Self {
        Self {
            loop_type,
            source: None,
            condition: None,
            count: None,
            item_var: default_item_var(),
            index_var: default_index_var(),
            max_iterations: None,
            break_condition: None,
            continue_condition: None,
            stop_on_failure: false,
        }
    }
}

/// Literal or templated iteration count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum CountSpec {
    Literal(u64),
    Expression(String),
}

/// One arm of a branch step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BranchConfig {
    /// Boolean expression, or `default` to match when nothing earlier matched.
    #[serde(default)]
    pub condition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub children: Vec<Step>,
}

impl BranchConfig {
    /// True for the unconditional fallback arm. An empty condition counts as default.
    pub fn is_default(&self) -> bool {
        let condition = self.condition.trim();
        condition.is_empty() || condition == DEFAULT_BRANCH_CONDITION
    }
}

fn default_item_var() -> String {
    "item".to_string()
}

fn default_index_var() -> String {
    "i".to_string()
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_tree_deserializes_every_kind_from_yaml() {
        let yaml = r#"
- id: login
  kind: action
  actionType: http
  config:
    method: POST
  inputs:
    url: "{{base}}/login"
  outputs:
    body.token: token
- id: each_user
  kind: loop
  loop:
    type: forEach
    source: "{{users}}"
    itemVar: user
  children:
    - id: fetch
      kind: action
      actionType: http
- id: route
  kind: branch
  branches:
    - condition: "{{role}} == 'admin'"
      label: admin
      children: []
    - condition: default
- id: wrap
  kind: group
  continueOnFail: true
  children: []
"#;
        let steps: Vec<Step> = serde_yaml::from_str(yaml).expect("parse steps");
        assert_eq!(steps.len(), 4);

        let StepKind::Action(action) = &steps[0].kind else {
            panic!("expected action step, got {:?}", steps[0].kind);
        };
        assert_eq!(action.action_type, "http");
        assert_eq!(steps[0].outputs.get("body.token").map(String::as_str), Some("token"));

        let StepKind::Loop { config, children } = &steps[1].kind else {
            panic!("expected loop step");
        };
        assert_eq!(config.loop_type, LoopType::ForEach);
        assert_eq!(config.item_var, "user");
        assert_eq!(config.index_var, "i");
        assert_eq!(config.max_iterations, None);
        assert_eq!(children.len(), 1);

        let StepKind::Branch { branches } = &steps[2].kind else {
            panic!("expected branch step");
        };
        assert!(!branches[0].is_default());
        assert!(branches[1].is_default());

        assert_eq!(steps[3].kind_tag(), StepKindTag::Group);
        assert!(steps[3].continue_on_fail);
    }

    #[test]
    fn count_accepts_literal_and_expression() {
        let literal: LoopConfig = serde_json::from_str(r#"{"type":"count","count":3}"#).expect("literal count");
        assert_eq!(literal.count, Some(CountSpec::Literal(3)));

        let templated: LoopConfig = serde_json::from_str(r#"{"type":"count","count":"{{n}}"}"#).expect("templated count");
        assert_eq!(templated.count, Some(CountSpec::Expression("{{n}}".into())));
    }

    #[test]
    fn input_defaults_skip_inputs_without_defaults() {
        let mut workflow = WorkflowDefinition::default();
        workflow.inputs.insert(
            "region".into(),
            WorkflowInput {
                default: Some(JsonValue::String("us".into())),
                ..Default::default()
            },
        );
        workflow.inputs.insert("app".into(), WorkflowInput::default());

        let defaults = workflow.input_defaults();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults.get("region"), Some(&JsonValue::String("us".into())));
    }
}

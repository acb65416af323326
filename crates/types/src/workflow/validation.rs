//! Structural validation for authored step trees.
//!
//! The interpreter assumes an already-validated tree. These checks catch the
//! authoring mistakes the interpreter cannot recover from at runtime: ambiguous
//! step ids, misplaced default branches, and loops missing their driving expression.

use std::collections::HashSet;

use thiserror::Error;

use super::{CountSpec, LoopType, Step, StepKind, WorkflowDefinition};

/// A single structural problem found in a step tree.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationIssue {
    #[error("step id cannot be empty (step '{name}')")]
    EmptyId { name: String },
    #[error("step id '{0}' is used more than once")]
    DuplicateId(String),
    #[error("branch step '{step_id}' declares more than one default branch")]
    MultipleDefaultBranches { step_id: String },
    #[error("branch step '{step_id}' has a default branch at position {index} that is not last")]
    DefaultBranchNotLast { step_id: String, index: usize },
    #[error("{loop_type} loop '{step_id}' requires '{field}'")]
    MissingLoopField {
        step_id: String,
        loop_type: &'static str,
        field: &'static str,
    },
    #[error("action step '{step_id}' has an empty actionType")]
    EmptyActionType { step_id: String },
    #[error("step '{step_id}' binds result path '{path}' to an empty variable name")]
    EmptyOutputVariable { step_id: String, path: String },
}

/// Validates a whole workflow document.
pub fn validate_workflow(workflow: &WorkflowDefinition) -> Result<(), Vec<ValidationIssue>> {
    validate_steps(&workflow.steps)
}

/// Validates a step tree, returning every issue found rather than the first.
pub fn validate_steps(steps: &[Step]) -> Result<(), Vec<ValidationIssue>> {
    let mut issues = Vec::new();
    let mut seen_ids = HashSet::new();
    for step in steps {
        validate_step(step, &mut seen_ids, &mut issues);
    }
    if issues.is_empty() { Ok(()) } else { Err(issues) }
}

fn validate_step<'a>(step: &'a Step, seen_ids: &mut HashSet<&'a str>, issues: &mut Vec<ValidationIssue>) {
    if step.id.trim().is_empty() {
        issues.push(ValidationIssue::EmptyId { name: step.name.clone() });
    } else if !seen_ids.insert(step.id.as_str()) {
        issues.push(ValidationIssue::DuplicateId(step.id.clone()));
    }

    for (path, variable) in &step.outputs {
        if variable.trim().is_empty() {
            issues.push(ValidationIssue::EmptyOutputVariable {
                step_id: step.id.clone(),
                path: path.clone(),
            });
        }
    }

    match &step.kind {
        StepKind::Action(action) => {
            if action.action_type.trim().is_empty() {
                issues.push(ValidationIssue::EmptyActionType { step_id: step.id.clone() });
            }
        }
        StepKind::Group { .. } => {}
        StepKind::Loop { config, .. } => {
            let missing = match config.loop_type {
                LoopType::ForEach if is_blank(config.source.as_deref()) => Some(("forEach", "source")),
                LoopType::While if is_blank(config.condition.as_deref()) => Some(("while", "condition")),
                LoopType::Count => match &config.count {
                    None => Some(("count", "count")),
                    Some(CountSpec::Expression(expression)) if expression.trim().is_empty() => Some(("count", "count")),
                    Some(_) => None,
                },
                _ => None,
            };
            if let Some((loop_type, field)) = missing {
                issues.push(ValidationIssue::MissingLoopField {
                    step_id: step.id.clone(),
                    loop_type,
                    field,
                });
            }
        }
        StepKind::Branch { branches } => {
            let last_index = branches.len().saturating_sub(1);
            let mut default_seen = false;
            for (index, branch) in branches.iter().enumerate() {
                if !branch.is_default() {
                    continue;
                }
                if default_seen {
                    issues.push(ValidationIssue::MultipleDefaultBranches { step_id: step.id.clone() });
                } else if index != last_index {
                    issues.push(ValidationIssue::DefaultBranchNotLast {
                        step_id: step.id.clone(),
                        index,
                    });
                }
                default_seen = true;
            }
        }
    }

    for child in step.nested_steps() {
        validate_step(child, seen_ids, issues);
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.map(str::trim).is_none_or(str::is_empty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{ActionStep, BranchConfig, LoopConfig};
    use indexmap::IndexMap;

    fn action(id: &str) -> Step {
        Step {
            id: id.into(),
            name: String::new(),
            condition: None,
            disabled: false,
            continue_on_fail: false,
            timeout_ms: None,
            retry: None,
            inputs: IndexMap::new(),
            outputs: IndexMap::new(),
            kind: StepKind::Action(ActionStep {
                action_type: "http".into(),
                ..Default::default()
            }),
        }
    }

    fn with_kind(id: &str, kind: StepKind) -> Step {
        Step { kind, ..action(id) }
    }

    fn branch(condition: &str) -> BranchConfig {
        BranchConfig {
            condition: condition.into(),
            label: None,
            children: Vec::new(),
        }
    }

    #[test]
    fn duplicate_ids_are_reported_across_nesting_levels() {
        let steps = vec![
            action("fetch"),
            with_kind(
                "wrap",
                StepKind::Group {
                    children: vec![action("fetch")],
                },
            ),
        ];
        let issues = validate_steps(&steps).expect_err("duplicate id");
        assert_eq!(issues, vec![ValidationIssue::DuplicateId("fetch".into())]);
    }

    #[test]
    fn default_branch_must_be_last_and_unique() {
        let steps = vec![with_kind(
            "route",
            StepKind::Branch {
                branches: vec![branch("default"), branch("{{a}} == 1"), branch("default")],
            },
        )];
        let issues = validate_steps(&steps).expect_err("misplaced default");
        assert!(issues.contains(&ValidationIssue::DefaultBranchNotLast {
            step_id: "route".into(),
            index: 0
        }));
        assert!(issues.contains(&ValidationIssue::MultipleDefaultBranches { step_id: "route".into() }));
    }

    #[test]
    fn loops_require_their_driving_expression() {
        let steps = vec![
            with_kind(
                "each",
                StepKind::Loop {
                    config: LoopConfig::new(LoopType::ForEach),
                    children: Vec::new(),
                },
            ),
            with_kind(
                "poll",
                StepKind::Loop {
                    config: LoopConfig::new(LoopType::While),
                    children: Vec::new(),
                },
            ),
        ];
        let issues = validate_steps(&steps).expect_err("missing loop fields");
        assert_eq!(issues.len(), 2);
        let message = issues[0].to_string();
        assert!(message.contains("requires 'source'"), "unexpected message: {message}");
    }

    #[test]
    fn well_formed_tree_passes() {
        let mut count_loop = LoopConfig::new(LoopType::Count);
        count_loop.count = Some(CountSpec::Literal(2));
        let steps = vec![
            action("a"),
            with_kind(
                "repeat",
                StepKind::Loop {
                    config: count_loop,
                    children: vec![action("b")],
                },
            ),
            with_kind(
                "route",
                StepKind::Branch {
                    branches: vec![branch("{{x}} > 1"), branch("default")],
                },
            ),
        ];
        assert!(validate_steps(&steps).is_ok());
    }
}

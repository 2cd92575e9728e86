//! Workflow Validation
//!
//! Reference-integrity checks run on every loaded workflow before anything
//! executes:
//! - The workflow has steps, and step/input ids are unique
//! - Every binding and output source names a declared input or a step output
//! - Every step output referenced is declared by the step's run target
//! - Required run-target inputs are bound or have a default
//! - Scattered inputs are bound
//!
//! Problems are collected and reported together.

use std::collections::HashSet;

use log::{debug, info, warn};

use crate::error::{Result, WorkflowError};

use super::model::{Source, Step, WorkflowDefinition};

/// Validation problem types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyWorkflow,
    DuplicateStepId(String),
    DuplicateInputId(String),
    UnknownInput { consumer: String, input: String },
    UnknownStep { consumer: String, step: String },
    UndeclaredOutput { consumer: String, step: String, output: String },
    UnboundInput { step: String, input: String },
    UnboundScatter { step: String, input: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyWorkflow => write!(f, "Workflow has no steps"),
            Self::DuplicateStepId(id) => write!(f, "Duplicate step ID: '{}'", id),
            Self::DuplicateInputId(id) => write!(f, "Duplicate input ID: '{}'", id),
            Self::UnknownInput { consumer, input } => {
                write!(f, "{} references unknown workflow input '{}'", consumer, input)
            }
            Self::UnknownStep { consumer, step } => {
                write!(f, "{} references unknown step '{}'", consumer, step)
            }
            Self::UndeclaredOutput {
                consumer,
                step,
                output,
            } => write!(
                f,
                "{} references output '{}' which step '{}' does not produce",
                consumer, output, step
            ),
            Self::UnboundInput { step, input } => write!(
                f,
                "Step '{}': required input '{}' has no source and no default",
                step, input
            ),
            Self::UnboundScatter { step, input } => write!(
                f,
                "Step '{}': scattered input '{}' is not bound",
                step, input
            ),
        }
    }
}

/// Checks one source against the workflow's inputs and steps.
fn check_source(
    workflow: &WorkflowDefinition,
    consumer: &str,
    source: &Source,
) -> Option<ValidationError> {
    match source {
        Source::WorkflowInput(name) if workflow.input(name).is_none() => {
            Some(ValidationError::UnknownInput {
                consumer: consumer.to_string(),
                input: name.clone(),
            })
        }
        Source::WorkflowInput(_) => None,
        Source::StepOutput { step, output } => match workflow.get_step(step) {
            None => Some(ValidationError::UnknownStep {
                consumer: consumer.to_string(),
                step: step.clone(),
            }),
            Some(producer)
                if !producer.outputs.contains(output) || !producer.run.declares_output(output) =>
            {
                Some(ValidationError::UndeclaredOutput {
                    consumer: consumer.to_string(),
                    step: step.clone(),
                    output: output.clone(),
                })
            }
            Some(_) => None,
        },
    }
}

/// Validates a single step's wiring.
fn validate_step(workflow: &WorkflowDefinition, step: &Step) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let consumer = format!("Step '{}'", step.id);

    for binding in &step.bindings {
        for source in &binding.sources {
            errors.extend(check_source(workflow, &consumer, source));
        }
    }

    let params = step.run.input_params();
    for binding in &step.bindings {
        if !params.iter().any(|(name, _, _)| *name == binding.input) {
            warn!(
                "Step '{}': input '{}' is not declared by '{}', ignoring",
                step.id,
                binding.input,
                step.run.id()
            );
        }
    }

    for (name, ty, default) in &params {
        let bound = step
            .binding(name)
            .map(|b| !b.sources.is_empty() || b.default.is_some())
            .unwrap_or(false);
        if !bound && default.is_none() && !ty.is_optional() {
            errors.push(ValidationError::UnboundInput {
                step: step.id.clone(),
                input: name.to_string(),
            });
        }
    }

    for output in &step.outputs {
        if !step.run.declares_output(output) {
            errors.push(ValidationError::UndeclaredOutput {
                consumer: consumer.clone(),
                step: step.id.clone(),
                output: output.clone(),
            });
        }
    }

    if let Some(scatter) = &step.scatter {
        for input in &scatter.inputs {
            if step.binding(input).is_none() {
                errors.push(ValidationError::UnboundScatter {
                    step: step.id.clone(),
                    input: input.clone(),
                });
            }
        }
    }

    if step.upstream_steps().is_empty() {
        debug!("Step '{}' is a root step (no dependencies)", step.id);
    }

    errors
}

/// Validates the workflow structure.
///
/// Performs the following checks:
/// 1. Workflow is not empty
/// 2. No duplicate step or input IDs
/// 3. All step bindings resolve
/// 4. All workflow output sources resolve
///
/// Cycle detection is left to [`super::planner::topological_order`].
pub fn validate_workflow(workflow: &WorkflowDefinition) -> Result<()> {
    info!(
        "Validating workflow '{}' with {} steps",
        workflow.id,
        workflow.steps.len()
    );

    if workflow.steps.is_empty() {
        return Err(WorkflowError::malformed(
            ValidationError::EmptyWorkflow.to_string(),
        ));
    }

    let mut errors = Vec::new();

    let mut seen_steps = HashSet::new();
    for step in &workflow.steps {
        if !seen_steps.insert(step.id.as_str()) {
            errors.push(ValidationError::DuplicateStepId(step.id.clone()));
        }
    }
    let mut seen_inputs = HashSet::new();
    for input in &workflow.inputs {
        if !seen_inputs.insert(input.id.as_str()) {
            errors.push(ValidationError::DuplicateInputId(input.id.clone()));
        }
    }

    for step in &workflow.steps {
        errors.extend(validate_step(workflow, step));
    }

    for output in &workflow.outputs {
        let consumer = format!("Workflow output '{}'", output.id);
        if output.sources.is_empty() {
            errors.push(ValidationError::UnknownStep {
                consumer: consumer.clone(),
                step: String::new(),
            });
        }
        for source in &output.sources {
            errors.extend(check_source(workflow, &consumer, source));
        }
    }

    if !errors.is_empty() {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(WorkflowError::malformed(messages.join("\n")));
    }

    info!("Workflow '{}' validated", workflow.id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{CommandLineTool, InputParam, OutputParam, RunTarget};
    use crate::workflow::types::CwlType;
    use std::sync::Arc;

    fn tool() -> RunTarget {
        RunTarget::InlineTool(Arc::new(
            CommandLineTool::new("t", vec!["t".to_string()])
                .with_input("x", CwlType::String, None)
                .with_output("out", CwlType::File, "*"),
        ))
    }

    fn base() -> WorkflowDefinition {
        let mut wf = WorkflowDefinition::new("wf");
        wf.inputs.push(InputParam::new("aoi", CwlType::String));
        wf.steps
            .push(Step::new("a", tool()).bind("x", "aoi").with_output("out"));
        wf.steps
            .push(Step::new("b", tool()).bind("x", "a/out").with_output("out"));
        wf.outputs
            .push(OutputParam::new("result", CwlType::File, "b/out"));
        wf
    }

    fn messages(wf: &WorkflowDefinition) -> String {
        validate_workflow(wf).unwrap_err().to_string()
    }

    #[test]
    fn test_valid_workflow() {
        assert!(validate_workflow(&base()).is_ok());
    }

    #[test]
    fn test_empty_workflow() {
        let wf = WorkflowDefinition::new("empty");
        assert!(messages(&wf).contains("no steps"));
    }

    #[test]
    fn test_duplicate_ids() {
        let mut wf = base();
        wf.steps
            .push(Step::new("a", tool()).bind("x", "aoi").with_output("out"));
        wf.inputs.push(InputParam::new("aoi", CwlType::String));
        let msg = messages(&wf);
        assert!(msg.contains("Duplicate step ID: 'a'"));
        assert!(msg.contains("Duplicate input ID: 'aoi'"));
    }

    #[test]
    fn test_dangling_references_collected() {
        let mut wf = base();
        wf.steps.push(Step::new("c", tool()).bind("x", "ghost/out"));
        wf.steps.push(Step::new("d", tool()).bind("x", "nope"));
        wf.steps.push(Step::new("e", tool()).bind("x", "a/missing"));
        let msg = messages(&wf);
        assert!(msg.contains("unknown step 'ghost'"));
        assert!(msg.contains("unknown workflow input 'nope'"));
        assert!(msg.contains("output 'missing'"));
        assert_eq!(msg.lines().count(), 3);
    }

    #[test]
    fn test_unbound_required_input() {
        let mut wf = base();
        wf.steps.push(Step::new("c", tool()));
        assert!(messages(&wf).contains("required input 'x'"));
    }

    #[test]
    fn test_bad_workflow_output_source() {
        let mut wf = base();
        wf.outputs
            .push(OutputParam::new("other", CwlType::File, "zzz/out"));
        assert!(messages(&wf).contains("Workflow output 'other'"));
    }

    #[test]
    fn test_unbound_scatter_input() {
        let mut wf = base();
        wf.steps.push(
            Step::new("c", tool())
                .bind("x", "aoi")
                .scatter(&["y"], crate::workflow::model::ScatterMethod::DotProduct),
        );
        assert!(messages(&wf).contains("scattered input 'y'"));
    }
}

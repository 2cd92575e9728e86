//! Scatter Expansion
//!
//! Turns one step with bound inputs into the concrete instances that run.
//! Cardinality is only known once inputs are bound, so expansion happens at
//! dispatch time rather than at load time.
//!
//! - `dotproduct`: instance *i* takes element *i* of every scattered input;
//!   all scattered inputs must have the same length
//! - `flat_crossproduct`: one instance per combination, first input varying slowest
//! - `nested_crossproduct`: same instances, results nested one level per input
//!
//! Inputs not named in the scatter spec are broadcast unchanged.

use log::debug;

use crate::error::{Result, WorkflowError};

use super::model::{ScatterMethod, Step};
use super::types::{Value, ValueMap};

/// How instance results are shaped back into a step output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    /// Unscattered step: one instance, outputs pass through
    Single,
    /// One flat sequence in instance order
    Flat(usize),
    /// Nested sequences, one dimension per scattered input
    Nested(Vec<usize>),
}

impl Shape {
    /// Number of instances this shape holds.
    pub fn instance_count(&self) -> usize {
        match self {
            Shape::Single => 1,
            Shape::Flat(n) => *n,
            Shape::Nested(dims) => dims.iter().product(),
        }
    }

    pub fn is_scattered(&self) -> bool {
        !matches!(self, Shape::Single)
    }

    /// Reassembles per-instance values, given in index order, into one value.
    pub fn gather(&self, values: Vec<Value>) -> Value {
        match self {
            Shape::Single => values.into_iter().next().unwrap_or(Value::Null),
            Shape::Flat(_) => Value::Array(values),
            Shape::Nested(dims) => nest(&mut values.into_iter(), dims),
        }
    }
}

fn nest(values: &mut impl Iterator<Item = Value>, dims: &[usize]) -> Value {
    match dims {
        [] => values.next().unwrap_or(Value::Null),
        [n, rest @ ..] => Value::Array((0..*n).map(|_| nest(values, rest)).collect()),
    }
}

/// The concrete instances of one step.
#[derive(Debug, Clone)]
pub struct Expansion {
    /// Bound inputs per instance, in index order
    pub instances: Vec<ValueMap>,
    pub shape: Shape,
}

/// Expands a step's bound inputs into instances.
///
/// Fails with [`WorkflowError::ScatterCardinality`] on a dotproduct length
/// mismatch, before any instance exists.
pub fn expand(step: &Step, inputs: ValueMap) -> Result<Expansion> {
    let Some(spec) = &step.scatter else {
        return Ok(Expansion {
            instances: vec![inputs],
            shape: Shape::Single,
        });
    };

    let mut columns: Vec<(String, Vec<Value>)> = Vec::with_capacity(spec.inputs.len());
    for name in &spec.inputs {
        match inputs.get(name) {
            Some(Value::Array(items)) => columns.push((name.clone(), items.clone())),
            Some(other) => {
                return Err(WorkflowError::invalid_input(
                    format!("{}/{}", step.id, name),
                    format!("scattered input must be an array, got {}", other.kind()),
                ))
            }
            None => {
                return Err(WorkflowError::invalid_input(
                    format!("{}/{}", step.id, name),
                    "scattered input has no value",
                ))
            }
        }
    }

    let lengths: Vec<(String, usize)> = columns
        .iter()
        .map(|(name, items)| (name.clone(), items.len()))
        .collect();

    let combos: Vec<Vec<usize>> = match spec.method {
        ScatterMethod::DotProduct => {
            let first = lengths.first().map(|(_, n)| *n).unwrap_or(0);
            if lengths.iter().any(|(_, n)| *n != first) {
                return Err(WorkflowError::ScatterCardinality {
                    step: step.id.clone(),
                    lengths,
                });
            }
            (0..first).map(|i| vec![i; columns.len()]).collect()
        }
        ScatterMethod::FlatCrossProduct | ScatterMethod::NestedCrossProduct => {
            cross_indices(&lengths.iter().map(|(_, n)| *n).collect::<Vec<_>>())
        }
    };

    let shape = match spec.method {
        ScatterMethod::NestedCrossProduct => {
            Shape::Nested(lengths.iter().map(|(_, n)| *n).collect())
        }
        _ => Shape::Flat(combos.len()),
    };

    let instances: Vec<ValueMap> = combos
        .iter()
        .map(|picks| {
            let mut bound = inputs.clone();
            for ((name, items), &i) in columns.iter().zip(picks) {
                bound.insert(name.clone(), items[i].clone());
            }
            bound
        })
        .collect();

    debug!(
        "Step '{}' expands to {} instances ({}, lengths {:?})",
        step.id,
        instances.len(),
        spec.method,
        lengths
    );
    Ok(Expansion { instances, shape })
}

/// Row-major index combinations; the first dimension varies slowest.
fn cross_indices(dims: &[usize]) -> Vec<Vec<usize>> {
    dims.iter().fold(vec![Vec::new()], |acc, &n| {
        acc.into_iter()
            .flat_map(|prefix| {
                (0..n).map(move |i| {
                    let mut next = prefix.clone();
                    next.push(i);
                    next
                })
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{CommandLineTool, RunTarget};
    use std::sync::Arc;

    fn strings(items: &[&str]) -> Value {
        Value::Array(items.iter().map(|s| Value::String(s.to_string())).collect())
    }

    fn step(scatter: &[&str], method: ScatterMethod) -> Step {
        let tool = CommandLineTool::new("crop", vec!["crop".to_string()]);
        Step::new("node_crop", RunTarget::InlineTool(Arc::new(tool))).scatter(scatter, method)
    }

    fn inputs() -> ValueMap {
        let mut m = ValueMap::new();
        m.insert("item".to_string(), Value::String("S2A_10TFK".to_string()));
        m.insert("band".to_string(), strings(&["green", "nir"]));
        m.insert("res".to_string(), strings(&["10", "20", "60"]));
        m
    }

    #[test]
    fn test_dotproduct_broadcasts_unscattered() {
        let exp = expand(&step(&["band"], ScatterMethod::DotProduct), inputs()).unwrap();
        assert_eq!(exp.instances.len(), 2);
        assert_eq!(exp.shape, Shape::Flat(2));
        assert_eq!(exp.instances[0]["band"], Value::String("green".into()));
        assert_eq!(exp.instances[1]["band"], Value::String("nir".into()));
        for inst in &exp.instances {
            assert_eq!(inst["item"], Value::String("S2A_10TFK".into()));
            assert_eq!(inst["res"], strings(&["10", "20", "60"]));
        }
    }

    #[test]
    fn test_dotproduct_length_mismatch() {
        let err = expand(&step(&["band", "res"], ScatterMethod::DotProduct), inputs()).unwrap_err();
        match err {
            WorkflowError::ScatterCardinality { step, lengths } => {
                assert_eq!(step, "node_crop");
                assert_eq!(lengths[0], ("band".to_string(), 2));
                assert_eq!(lengths[1], ("res".to_string(), 3));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_flat_crossproduct_order() {
        let s = step(&["band", "res"], ScatterMethod::FlatCrossProduct);
        let exp = expand(&s, inputs()).unwrap();
        assert_eq!(exp.instances.len(), 6);
        assert_eq!(exp.instances[0]["band"], Value::String("green".into()));
        assert_eq!(exp.instances[0]["res"], Value::String("10".into()));
        assert_eq!(exp.instances[3]["band"], Value::String("nir".into()));
        assert_eq!(exp.instances[3]["res"], Value::String("10".into()));
    }

    #[test]
    fn test_nested_crossproduct_gathers_nested() {
        let s = step(&["band", "res"], ScatterMethod::NestedCrossProduct);
        let exp = expand(&s, inputs()).unwrap();
        assert_eq!(exp.shape, Shape::Nested(vec![2, 3]));
        assert_eq!(exp.shape.instance_count(), 6);

        let gathered = exp.shape.gather((0..6).map(Value::Int).collect());
        let rows = gathered.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[1],
            Value::Array(vec![Value::Int(3), Value::Int(4), Value::Int(5)])
        );
    }

    #[test]
    fn test_empty_scatter_yields_no_instances() {
        let mut m = inputs();
        m.insert("band".to_string(), Value::Array(Vec::new()));
        let exp = expand(&step(&["band"], ScatterMethod::DotProduct), m).unwrap();
        assert!(exp.instances.is_empty());
        assert_eq!(exp.shape.gather(Vec::new()), Value::Array(Vec::new()));
    }

    #[test]
    fn test_scalar_scatter_input_rejected() {
        let err = expand(&step(&["item"], ScatterMethod::DotProduct), inputs()).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidInput { .. }));
    }

    #[test]
    fn test_unscattered_is_single() {
        let tool = CommandLineTool::new("otsu", vec!["otsu".to_string()]);
        let s = Step::new("node_otsu", RunTarget::InlineTool(Arc::new(tool)));
        let exp = expand(&s, inputs()).unwrap();
        assert_eq!(exp.shape, Shape::Single);
        assert_eq!(exp.instances.len(), 1);
        assert_eq!(Shape::Single.gather(vec![Value::Int(7)]), Value::Int(7));
    }
}

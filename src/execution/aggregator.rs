//! Output Aggregation
//!
//! Holds the values flowing between steps of one workflow run. Instance
//! results are collected per step and published only once every instance
//! has reported, in scatter-index order. Published outputs are released
//! once all dependent steps have bound them, unless a workflow output
//! reads them.

use std::collections::{BTreeSet, HashMap};

use log::{debug, warn};

use crate::error::{Result, WorkflowError};
use crate::workflow::model::{Source, Step, WorkflowDefinition};
use crate::workflow::scatter::Shape;
use crate::workflow::types::{Value, ValueMap};

/// What happens to a scattered step when some of its instances fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScatterFailurePolicy {
    /// Any failed instance fails the whole step
    #[default]
    AbortStep,
    /// Failed indices yield `null`; the step fails only if every instance did
    IsolateIndex,
}

impl ScatterFailurePolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "step" => Some(ScatterFailurePolicy::AbortStep),
            "index" => Some(ScatterFailurePolicy::IsolateIndex),
            _ => None,
        }
    }
}

/// Instance results of a step still in flight.
struct PendingStep {
    shape: Shape,
    outputs: Vec<String>,
    slots: Vec<Option<Result<ValueMap>>>,
}

/// How a step ended once all its instances reported.
#[derive(Debug)]
pub enum StepCompletion {
    /// Outputs published; lists indices that failed but were isolated
    Published { isolated: Vec<usize> },
    /// The step failed; carries the error to report
    Failed(WorkflowError),
}

/// Published step outputs for one workflow run.
pub struct Aggregator {
    inputs: ValueMap,
    policy: ScatterFailurePolicy,
    published: HashMap<String, ValueMap>,
    pending: HashMap<String, PendingStep>,
    /// Dependents that have not yet bound each step's outputs
    waiting_consumers: HashMap<String, BTreeSet<String>>,
    terminal: BTreeSet<String>,
}

impl Aggregator {
    pub fn new(
        workflow: &WorkflowDefinition,
        inputs: ValueMap,
        policy: ScatterFailurePolicy,
    ) -> Self {
        let waiting_consumers = workflow
            .steps
            .iter()
            .map(|s| {
                let consumers = workflow
                    .dependents(&s.id)
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                (s.id.clone(), consumers)
            })
            .collect();

        Self {
            inputs,
            policy,
            published: HashMap::new(),
            pending: HashMap::new(),
            waiting_consumers,
            terminal: workflow
                .terminal_steps()
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }

    fn source_value(&self, source: &Source) -> Option<Value> {
        match source {
            Source::WorkflowInput(name) => self.inputs.get(name).cloned(),
            Source::StepOutput { step, output } => {
                self.published.get(step).and_then(|o| o.get(output)).cloned()
            }
        }
    }

    /// Resolves every binding of `step` against published values.
    ///
    /// Merges multiple sources with the binding's `linkMerge`; falls back to
    /// the binding default when there is no source or the value is null.
    /// Consumed upstream outputs may be released afterwards.
    pub fn bind_inputs(&mut self, step: &Step) -> Result<ValueMap> {
        let mut bound = ValueMap::new();
        for binding in &step.bindings {
            let mut values = Vec::with_capacity(binding.sources.len());
            for source in &binding.sources {
                let value = self.source_value(source).ok_or_else(|| WorkflowError::UpstreamFailed {
                    step: step.id.clone(),
                    upstream: source.step().unwrap_or(&source.to_string()).to_string(),
                })?;
                values.push(value);
            }

            let value = match values.len() {
                0 => Value::Null,
                _ => binding.link_merge.merge(values),
            };
            let value = match (&value, &binding.default) {
                (Value::Null, Some(default)) => default.clone(),
                _ => value,
            };
            bound.insert(binding.input.clone(), value);
        }

        self.release_for(&step.id);
        Ok(bound)
    }

    /// Marks `consumer` as done with its upstream outputs, dropping any no
    /// longer needed.
    pub fn release_for(&mut self, consumer: &str) {
        let mut released = Vec::new();
        for (producer, consumers) in self.waiting_consumers.iter_mut() {
            if consumers.remove(consumer)
                && consumers.is_empty()
                && !self.terminal.contains(producer)
            {
                released.push(producer.clone());
            }
        }
        for producer in released {
            if self.published.remove(&producer).is_some() {
                debug!("Released outputs of step '{}'", producer);
            }
        }
    }

    /// Starts collecting results for a step with the given shape.
    ///
    /// A step with zero instances completes immediately.
    pub fn begin(&mut self, step: &Step, shape: Shape) -> Option<StepCompletion> {
        let count = shape.instance_count();
        self.pending.insert(
            step.id.clone(),
            PendingStep {
                shape,
                outputs: step.outputs.clone(),
                slots: (0..count).map(|_| None).collect(),
            },
        );
        self.try_complete(&step.id)
    }

    /// Stores one instance result; returns the completion once the step's
    /// last instance has reported.
    pub fn record(
        &mut self,
        step_id: &str,
        index: usize,
        result: Result<ValueMap>,
    ) -> Option<StepCompletion> {
        let pending = self.pending.get_mut(step_id)?;
        match pending.slots.get_mut(index) {
            Some(slot) => *slot = Some(result),
            None => {
                warn!("Ignoring result for unknown instance {}[{}]", step_id, index);
                return None;
            }
        }
        self.try_complete(step_id)
    }

    fn try_complete(&mut self, step_id: &str) -> Option<StepCompletion> {
        if self.pending.get(step_id)?.slots.iter().any(Option::is_none) {
            return None;
        }
        let pending = self.pending.remove(step_id)?;

        let mut results = Vec::with_capacity(pending.slots.len());
        let mut errors = Vec::new();
        for (index, slot) in pending.slots.into_iter().enumerate() {
            match slot {
                Some(Ok(outputs)) => results.push(Some(outputs)),
                Some(Err(e)) => {
                    results.push(None);
                    errors.push((index, e));
                }
                None => results.push(None),
            }
        }

        let succeeded = results.iter().filter(|r| r.is_some()).count();
        let isolate = self.policy == ScatterFailurePolicy::IsolateIndex
            && pending.shape.is_scattered()
            && succeeded > 0;

        let isolated: Vec<usize> = errors.iter().map(|(i, _)| *i).collect();
        if !isolate {
            if let Some(error) = root_cause(errors) {
                return Some(StepCompletion::Failed(error));
            }
        }

        let mut published = ValueMap::new();
        for name in &pending.outputs {
            let per_instance: Vec<Value> = results
                .iter()
                .map(|r| {
                    r.as_ref()
                        .and_then(|o| o.get(name))
                        .cloned()
                        .unwrap_or(Value::Null)
                })
                .collect();
            published.insert(name.clone(), pending.shape.gather(per_instance));
        }
        self.published.insert(step_id.to_string(), published);

        if !isolated.is_empty() {
            warn!(
                "Step '{}': isolated failed instances {:?}, published null at those indices",
                step_id, isolated
            );
        }
        Some(StepCompletion::Published { isolated })
    }

    /// Published outputs of a step, if still held.
    #[cfg(test)]
    fn step_outputs(&self, step_id: &str) -> Option<&ValueMap> {
        self.published.get(step_id)
    }

    /// True if a step's outputs are still held.
    #[cfg(test)]
    fn holds(&self, step_id: &str) -> bool {
        self.published.contains_key(step_id)
    }

    /// Assembles the workflow outputs from their sources.
    pub fn workflow_outputs(&self, workflow: &WorkflowDefinition) -> Result<ValueMap> {
        let mut outputs = ValueMap::new();
        let mut failures = Vec::new();

        for output in &workflow.outputs {
            let values: Option<Vec<Value>> = output
                .sources
                .iter()
                .map(|s| self.source_value(s))
                .collect();
            match values {
                Some(values) if !values.is_empty() => {
                    outputs.insert(output.id.clone(), output.link_merge.merge(values));
                }
                _ => failures.push(format!("output '{}' was not produced", output.id)),
            }
        }

        if failures.is_empty() {
            Ok(outputs)
        } else {
            Err(WorkflowError::RunFailed {
                workflow: workflow.id.clone(),
                failures,
            })
        }
    }
}

/// Picks the error to report: the first that is not a cancellation.
fn root_cause(errors: Vec<(usize, WorkflowError)>) -> Option<WorkflowError> {
    let mut cancelled = None;
    for (_, error) in errors {
        match error {
            WorkflowError::Cancelled { .. } => {
                cancelled.get_or_insert(error);
            }
            other => return Some(other),
        }
    }
    cancelled
}

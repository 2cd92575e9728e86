//! Execution Planner
//!
//! Orders workflow steps by data dependency and tracks their status during
//! a run:
//! - Topological ordering (Kahn's algorithm) with cycle detection
//! - Ready-step selection
//! - Upstream-failure propagation
//! - Step status and timing

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};

use crate::error::{Result, WorkflowError};

use super::model::WorkflowDefinition;

/// Computes an execution order where every step follows all of its producers.
///
/// Independent steps keep their document order. Fails with
/// [`WorkflowError::CyclicDependency`] naming the steps left unordered.
pub fn topological_order(workflow: &WorkflowDefinition) -> Result<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();

    for step in &workflow.steps {
        let upstream = step.upstream_steps();
        in_degree.insert(step.id.as_str(), upstream.len());
        for producer in upstream {
            successors.entry(producer).or_default().push(step.id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = workflow
        .steps
        .iter()
        .filter(|s| in_degree.get(s.id.as_str()) == Some(&0))
        .map(|s| s.id.as_str())
        .collect();

    let mut order = Vec::with_capacity(workflow.steps.len());
    while let Some(current) = queue.pop_front() {
        order.push(current.to_string());
        for &next in successors.get(current).map(Vec::as_slice).unwrap_or_default() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    if order.len() != workflow.steps.len() {
        let stuck: Vec<String> = workflow
            .steps
            .iter()
            .filter(|s| !order.contains(&s.id))
            .map(|s| s.id.clone())
            .collect();
        return Err(WorkflowError::CyclicDependency { steps: stuck });
    }

    debug!("Topological order for '{}': {:?}", workflow.id, order);
    Ok(order)
}

/// Status of a workflow step during execution.
#[derive(Debug, Clone, PartialEq)]
pub enum StepStatus {
    /// Waiting for producers
    Pending,
    /// Instances dispatched
    Running,
    /// All outputs published
    Succeeded,
    /// Step failed with error message
    Failed(String),
    /// Never ran because the named upstream step did not succeed
    Skipped(String),
}

impl StepStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }
}

/// Timing and status for a single step.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub start_time: Option<Instant>,
    pub duration_ms: Option<u128>,
    pub status: StepStatus,
}

impl StepMetrics {
    fn new() -> Self {
        Self {
            start_time: None,
            duration_ms: None,
            status: StepStatus::Pending,
        }
    }
}

/// Tracks which steps of one workflow may run next.
pub struct ExecutionPlanner {
    workflow: Arc<WorkflowDefinition>,
    order: Vec<String>,
    metrics: HashMap<String, StepMetrics>,
}

impl ExecutionPlanner {
    /// Creates a planner; fails if the step graph has a cycle.
    pub fn new(workflow: Arc<WorkflowDefinition>) -> Result<Self> {
        let order = topological_order(&workflow)?;
        let metrics = order
            .iter()
            .map(|id| (id.clone(), StepMetrics::new()))
            .collect();

        info!(
            "Planning workflow '{}': {} steps",
            workflow.id,
            order.len()
        );
        Ok(Self {
            workflow,
            order,
            metrics,
        })
    }

    pub fn status(&self, step_id: &str) -> Option<&StepStatus> {
        self.metrics.get(step_id).map(|m| &m.status)
    }

    /// Pending steps whose producers have all succeeded, in topological order.
    pub fn ready_steps(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.status(id) == Some(&StepStatus::Pending))
            .filter(|id| {
                self.workflow
                    .get_step(id)
                    .map(|step| {
                        step.upstream_steps()
                            .iter()
                            .all(|up| self.status(up) == Some(&StepStatus::Succeeded))
                    })
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Marks every pending step downstream of a failure as skipped.
    ///
    /// Returns `(step, upstream)` pairs for the steps newly skipped.
    pub fn skip_blocked(&mut self) -> Vec<(String, String)> {
        let mut skipped = Vec::new();
        // topological order lets a skip cascade in one pass
        for id in self.order.clone() {
            if self.status(&id) != Some(&StepStatus::Pending) {
                continue;
            }
            let blocker = self.workflow.get_step(&id).and_then(|step| {
                step.upstream_steps()
                    .into_iter()
                    .find(|up| {
                        matches!(
                            self.status(up),
                            Some(StepStatus::Failed(_)) | Some(StepStatus::Skipped(_))
                        )
                    })
                    .map(str::to_string)
            });
            if let Some(upstream) = blocker {
                debug!("Step '{}' blocked by failed upstream '{}'", id, upstream);
                if let Some(m) = self.metrics.get_mut(&id) {
                    m.status = StepStatus::Skipped(upstream.clone());
                }
                skipped.push((id, upstream));
            }
        }
        skipped
    }

    /// Marks all pending steps as skipped (fail-fast shutdown).
    pub fn skip_all_pending(&mut self, reason: &str) -> Vec<String> {
        let mut skipped = Vec::new();
        for id in &self.order {
            if let Some(m) = self.metrics.get_mut(id) {
                if m.status == StepStatus::Pending {
                    m.status = StepStatus::Skipped(reason.to_string());
                    skipped.push(id.clone());
                }
            }
        }
        skipped
    }

    pub fn mark_running(&mut self, step_id: &str) {
        if let Some(m) = self.metrics.get_mut(step_id) {
            m.start_time = Some(Instant::now());
            m.status = StepStatus::Running;
        }
    }

    pub fn mark_succeeded(&mut self, step_id: &str) {
        self.finish(step_id, StepStatus::Succeeded);
    }

    pub fn mark_failed(&mut self, step_id: &str, error: String) {
        self.finish(step_id, StepStatus::Failed(error));
    }

    fn finish(&mut self, step_id: &str, status: StepStatus) {
        if let Some(m) = self.metrics.get_mut(step_id) {
            m.duration_ms = m.start_time.map(|s| s.elapsed().as_millis());
            m.status = status;
        }
    }

    /// True while any step is pending or running.
    pub fn has_work_remaining(&self) -> bool {
        self.metrics.values().any(|m| !m.status.is_finished())
    }

    /// Returns (finished, total).
    pub fn progress(&self) -> (usize, usize) {
        let done = self
            .metrics
            .values()
            .filter(|m| m.status.is_finished())
            .count();
        (done, self.order.len())
    }

    /// Wall time of a finished step, from materialization to completion.
    pub fn duration_ms(&self, step_id: &str) -> Option<u128> {
        self.metrics.get(step_id).and_then(|m| m.duration_ms)
    }
}

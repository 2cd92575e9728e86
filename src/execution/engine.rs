//! Workflow Execution Engine
//!
//! Coordinates one workflow run:
//! - Ready steps are bound, expanded into instances and queued
//! - Instances run on worker threads, bounded by `max_parallel`
//! - Completions flow back over a channel and are aggregated per step
//! - Failures either cancel the run (fail-fast) or only block dependents
//!   (best-effort)
//!
//! The coordinator thread never blocks on a process; it only waits on the
//! completion channel while at least one instance is in flight.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use chrono::Utc;
use log::{debug, error, info, warn};

use crate::environment::ContainerMode;
use crate::error::{Result, WorkflowError};
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::workflow::model::{RunTarget, WorkflowDefinition};
use crate::workflow::planner::{topological_order, ExecutionPlanner};
use crate::workflow::scatter::expand;
use crate::workflow::state::{ExecutionRecord, RunReport};
use crate::workflow::types::{map_to_json, ValueMap};

use super::aggregator::{Aggregator, ScatterFailurePolicy, StepCompletion};
use super::slots::ProcessSlots;
use super::step::{execute_instance, InstanceContext, InstanceOutcome};

/// What the run does after a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Cancel in-flight instances and dispatch nothing more
    #[default]
    FailFast,
    /// Keep running every branch that does not depend on the failure
    BestEffort,
}

/// Engine settings, usually built from the command line.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on concurrently running instances
    pub max_parallel: usize,
    pub failure_policy: FailurePolicy,
    pub scatter_failure: ScatterFailurePolicy,
    pub container_mode: ContainerMode,
    /// Root of the per-instance working directories
    pub working_dir: PathBuf,
    pub dry_run: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: num_cpus::get(),
            failure_policy: FailurePolicy::default(),
            scatter_failure: ScatterFailurePolicy::default(),
            container_mode: ContainerMode::default(),
            working_dir: PathBuf::from("cwl-work"),
            dry_run: false,
        }
    }
}

/// Everything a run produced, successful or not.
#[derive(Debug)]
pub struct RunOutcome {
    /// Workflow outputs, or the error that ended the run
    pub result: Result<ValueMap>,
    /// One record per instance, nested workflow instances included
    pub records: Vec<ExecutionRecord>,
    pub timeline: ExecutionTimeline,
    /// Where the run report was written, if it was
    pub report_path: Option<PathBuf>,
}

impl RunOutcome {
    fn failed(error: WorkflowError) -> Self {
        Self {
            result: Err(error),
            records: Vec::new(),
            timeline: ExecutionTimeline::new(),
            report_path: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// A queued instance waiting for a worker.
struct Job {
    record: usize,
    /// Position among the step's instances
    slot: usize,
    run: RunTarget,
    inputs: ValueMap,
    ctx: InstanceContext,
}

/// Message sent by a worker when its instance ends.
struct Completion {
    record: usize,
    slot: usize,
    step_id: String,
    result: Result<InstanceOutcome>,
}

/// Mutable bookkeeping of one run, owned by the coordinator thread.
struct RunState {
    workflow: Arc<WorkflowDefinition>,
    base_dir: PathBuf,
    planner: ExecutionPlanner,
    aggregator: Aggregator,
    timeline: ExecutionTimeline,
    records: Vec<ExecutionRecord>,
    failures: Vec<WorkflowError>,
    queue: VecDeque<Job>,
}

/// Workflow execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use cwlrunner::execution::{Engine, EngineConfig};
/// use cwlrunner::workflow::{load_workflow, ValueMap};
///
/// let workflow = load_workflow("water-bodies.cwl", None)?;
/// let config = EngineConfig {
///     max_parallel: 4,
///     working_dir: "/data/run".into(),
///     ..EngineConfig::default()
/// };
/// let outcome = Engine::new(config).run(workflow, ValueMap::new());
/// println!("success: {}", outcome.is_success());
/// # Ok::<(), cwlrunner::WorkflowError>(())
/// ```
pub struct Engine {
    config: EngineConfig,
    cancel: Arc<AtomicBool>,
    /// Bounds tool processes across this engine and every nested one
    slots: Arc<ProcessSlots>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let slots = Arc::new(ProcessSlots::new(config.max_parallel));
        Self::nested(config, Arc::new(AtomicBool::new(false)), slots)
    }

    /// Creates an engine for a sub-workflow, sharing the caller's
    /// cancellation flag and process slots.
    pub(crate) fn nested(
        config: EngineConfig,
        cancel: Arc<AtomicBool>,
        slots: Arc<ProcessSlots>,
    ) -> Self {
        Self {
            config,
            cancel,
            slots,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Runs a workflow as the top-level run.
    ///
    /// Honors dry run, and writes the run report into the working
    /// directory once the run ends.
    pub fn run(&self, workflow: Arc<WorkflowDefinition>, inputs: ValueMap) -> RunOutcome {
        if self.config.dry_run {
            return match describe_plan(&workflow) {
                Ok(plan) => {
                    println!("{}", plan);
                    RunOutcome {
                        result: Ok(ValueMap::new()),
                        records: Vec::new(),
                        timeline: ExecutionTimeline::new(),
                        report_path: None,
                    }
                }
                Err(e) => RunOutcome::failed(e),
            };
        }

        let start_time = Instant::now();
        info!(
            "Starting workflow '{}' (max parallel: {}, {:?}, scatter failure: {:?})",
            workflow.id,
            self.slots.capacity(),
            self.config.failure_policy,
            self.config.scatter_failure
        );

        let mut report = RunReport::new(&workflow.id);
        let mut outcome = self.execute(Arc::clone(&workflow), inputs);

        report.finished_at = Some(Utc::now());
        report.success = outcome.is_success();
        report.records = outcome.records.clone();
        match &outcome.result {
            Ok(outputs) => report.outputs = map_to_json(outputs),
            Err(WorkflowError::RunFailed { failures, .. }) => report.failures = failures.clone(),
            Err(e) => report.failures = vec![e.to_string()],
        }

        match absolute_dir(&self.config.working_dir).and_then(|dir| report.save(&dir)) {
            Ok(path) => outcome.report_path = Some(path),
            Err(e) => warn!("Failed to save run report: {}", e),
        }

        info!("Total execution time: {:.2?}", start_time.elapsed());
        outcome
    }

    /// Executes a workflow against already resolved inputs.
    ///
    /// Also used for nested workflows, which share the caller's
    /// cancellation flag.
    pub fn execute(&self, workflow: Arc<WorkflowDefinition>, inputs: ValueMap) -> RunOutcome {
        let prepared = absolute_dir(&self.config.working_dir).and_then(|base_dir| {
            fs::create_dir_all(&base_dir)?;
            let planner = ExecutionPlanner::new(Arc::clone(&workflow))?;
            Ok((base_dir, planner))
        });
        let (base_dir, planner) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return RunOutcome::failed(e),
        };

        let aggregator = Aggregator::new(&workflow, inputs, self.config.scatter_failure);
        let mut state = RunState {
            workflow,
            base_dir,
            planner,
            aggregator,
            timeline: ExecutionTimeline::new(),
            records: Vec::new(),
            failures: Vec::new(),
            queue: VecDeque::new(),
        };

        let result = self.drive(&mut state).and_then(|()| final_result(&mut state));
        RunOutcome {
            result,
            records: state.records,
            timeline: state.timeline,
            report_path: None,
        }
    }

    /// Main scheduling loop.
    fn drive(&self, state: &mut RunState) -> Result<()> {
        let (tx, rx) = channel::<Completion>();
        let max_parallel = self.config.max_parallel.max(1);
        let mut running = 0usize;

        loop {
            if !self.cancelled() {
                self.materialize_ready(state);
            }
            if self.cancelled() {
                self.cancel_pending(state);
                self.drain_queue(state);
            }

            while running < max_parallel {
                let Some(job) = state.queue.pop_front() else {
                    break;
                };
                self.dispatch(state, job, &tx);
                running += 1;
            }

            if running == 0 {
                break;
            }

            let completion = rx.recv().map_err(|e| {
                WorkflowError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    format!("failed to receive instance completion: {}", e),
                ))
            })?;
            running -= 1;
            self.complete(state, completion);
        }

        if state.planner.has_work_remaining() {
            for step_id in state.planner.skip_all_pending("unreachable") {
                warn!("Step '{}' never became ready", step_id);
            }
        }
        Ok(())
    }

    /// Binds and expands every ready step until none is left.
    ///
    /// Steps with zero instances finish immediately and may make further
    /// steps ready, hence the loop.
    fn materialize_ready(&self, state: &mut RunState) {
        loop {
            let ready = state.planner.ready_steps();
            if ready.is_empty() || self.cancelled() {
                return;
            }
            for step_id in ready {
                self.materialize(state, &step_id);
            }
        }
    }

    fn materialize(&self, state: &mut RunState, step_id: &str) {
        let workflow = Arc::clone(&state.workflow);
        let Some(step) = workflow.get_step(step_id) else {
            return;
        };
        state.planner.mark_running(step_id);

        let expansion = state
            .aggregator
            .bind_inputs(step)
            .and_then(|inputs| expand(step, inputs));
        let expansion = match expansion {
            Ok(expansion) => expansion,
            Err(e) => {
                self.step_failed(state, step_id, e);
                return;
            }
        };

        let scattered = expansion.shape.is_scattered();
        info!(
            "Starting step '{}' ({} instance{})",
            step_id,
            expansion.instances.len(),
            if expansion.instances.len() == 1 { "" } else { "s" }
        );

        for (slot, inputs) in expansion.instances.into_iter().enumerate() {
            let index = scattered.then_some(slot);
            let workdir = match index {
                Some(i) => state.base_dir.join(step_id).join(i.to_string()),
                None => state.base_dir.join(step_id),
            };
            state
                .records
                .push(ExecutionRecord::pending(step_id, index, &inputs, &workdir));
            state.queue.push_back(Job {
                record: state.records.len() - 1,
                slot,
                run: step.run.clone(),
                inputs,
                ctx: InstanceContext {
                    step_id: step_id.to_string(),
                    index,
                    workdir,
                    cancel: Arc::clone(&self.cancel),
                    slots: Arc::clone(&self.slots),
                    config: self.config.clone(),
                },
            });
        }

        if let Some(done) = state.aggregator.begin(step, expansion.shape) {
            self.step_finished(state, step_id, done);
        }
    }

    /// Hands one instance to a worker thread.
    fn dispatch(&self, state: &mut RunState, job: Job, tx: &Sender<Completion>) {
        let label = job.ctx.label();
        debug!("Dispatching {} in {}", label, job.ctx.workdir.display());
        if let Some(record) = state.records.get_mut(job.record) {
            record.mark_running();
        }
        state.timeline.add_event(label, EventType::Started);

        let tx = tx.clone();
        thread::spawn(move || {
            let result = execute_instance(&job.run, &job.inputs, &job.ctx);
            let completion = Completion {
                record: job.record,
                slot: job.slot,
                step_id: job.ctx.step_id,
                result,
            };
            if let Err(e) = tx.send(completion) {
                error!("Failed to send completion signal: {}", e);
            }
        });
    }

    fn complete(&self, state: &mut RunState, completion: Completion) {
        let label = state
            .records
            .get(completion.record)
            .map(ExecutionRecord::label)
            .unwrap_or_else(|| completion.step_id.clone());

        let result = match completion.result {
            Ok(outcome) => {
                info!("{} completed", label);
                if let Some(record) = state.records.get_mut(completion.record) {
                    record.mark_succeeded(&outcome.outputs);
                }
                state.timeline.add_event(label, EventType::Completed);
                state.records.extend(outcome.nested);
                Ok(outcome.outputs)
            }
            Err(e) => {
                let event = match e {
                    WorkflowError::Cancelled { .. } => {
                        warn!("{} cancelled", label);
                        EventType::Cancelled
                    }
                    _ => {
                        error!("{}", e);
                        EventType::Failed
                    }
                };
                if let Some(record) = state.records.get_mut(completion.record) {
                    record.mark_failed(&e);
                }
                state.timeline.add_event(label, event);
                Err(e)
            }
        };

        if let Some(done) = state
            .aggregator
            .record(&completion.step_id, completion.slot, result)
        {
            self.step_finished(state, &completion.step_id, done);
        }
    }

    fn step_finished(&self, state: &mut RunState, step_id: &str, done: StepCompletion) {
        match done {
            StepCompletion::Published { isolated } => {
                if !isolated.is_empty() {
                    warn!(
                        "Step '{}' completed with {} failed instance(s) isolated",
                        step_id,
                        isolated.len()
                    );
                }
                state.planner.mark_succeeded(step_id);
                let (finished, total) = state.planner.progress();
                let elapsed = state.planner.duration_ms(step_id).unwrap_or_default();
                info!(
                    "Step '{}' completed in {} ms ({}/{} steps)",
                    step_id, elapsed, finished, total
                );
            }
            StepCompletion::Failed(e) => self.step_failed(state, step_id, e),
        }
    }

    fn step_failed(&self, state: &mut RunState, step_id: &str, error: WorkflowError) {
        let cancelled = matches!(error, WorkflowError::Cancelled { .. });
        if !cancelled {
            error!("Step '{}' failed: {}", step_id, error);
        }
        state.planner.mark_failed(step_id, error.to_string());
        state.failures.push(error);

        for (step, upstream) in state.planner.skip_blocked() {
            warn!("Skipping step '{}': upstream '{}' failed", step, upstream);
            let reason = WorkflowError::UpstreamFailed {
                step: step.clone(),
                upstream,
            };
            record_skipped(state, &step, reason);
        }

        if self.config.failure_policy == FailurePolicy::FailFast
            && !cancelled
            && !self.cancel.swap(true, Ordering::SeqCst)
        {
            warn!("Fail-fast: cancelling remaining instances");
        }
        if self.cancelled() {
            self.cancel_pending(state);
        }
    }

    /// Skips every step not yet materialized.
    fn cancel_pending(&self, state: &mut RunState) {
        for step in state.planner.skip_all_pending("cancelled") {
            debug!("Step '{}' will not run", step);
            let reason = WorkflowError::Cancelled {
                step: step.clone(),
                index: None,
            };
            record_skipped(state, &step, reason);
        }
    }

    /// Fails every queued instance as cancelled without running it.
    fn drain_queue(&self, state: &mut RunState) {
        while let Some(job) = state.queue.pop_front() {
            let error = WorkflowError::Cancelled {
                step: job.ctx.step_id.clone(),
                index: job.ctx.index,
            };
            if let Some(record) = state.records.get_mut(job.record) {
                record.mark_failed(&error);
            }
            if let Some(done) = state.aggregator.record(&job.ctx.step_id, job.slot, Err(error)) {
                self.step_finished(state, &job.ctx.step_id, done);
            }
        }
    }
}

/// Adds a failed record for a step that never ran.
fn record_skipped(state: &mut RunState, step_id: &str, reason: WorkflowError) {
    state.aggregator.release_for(step_id);
    let workdir = state.base_dir.join(step_id);
    let mut record = ExecutionRecord::pending(step_id, None, &ValueMap::new(), &workdir);
    record.mark_failed(&reason);
    state.records.push(record);
}

/// Workflow outputs, or the error describing why the run failed.
///
/// Cancellations are only reported when nothing else failed.
fn final_result(state: &mut RunState) -> Result<ValueMap> {
    let outputs = state.aggregator.workflow_outputs(&state.workflow);
    let mut failures = std::mem::take(&mut state.failures);
    if failures.is_empty() {
        return outputs;
    }

    if failures
        .iter()
        .any(|e| !matches!(e, WorkflowError::Cancelled { .. }))
    {
        failures.retain(|e| !matches!(e, WorkflowError::Cancelled { .. }));
    }
    if failures.len() == 1 {
        if let Some(error) = failures.pop() {
            return Err(error);
        }
    }

    let mut messages: Vec<String> = failures.iter().map(ToString::to_string).collect();
    if let Err(WorkflowError::RunFailed { failures: missing, .. }) = outputs {
        messages.extend(missing);
    }
    Err(WorkflowError::RunFailed {
        workflow: state.workflow.id.clone(),
        failures: messages,
    })
}

fn absolute_dir(dir: &Path) -> Result<PathBuf> {
    if dir.is_absolute() {
        Ok(dir.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(dir))
    }
}

/// Renders the execution plan: steps in topological order with their run
/// targets, bindings and scatter specs.
pub fn describe_plan(workflow: &WorkflowDefinition) -> Result<String> {
    let order = topological_order(workflow)?;
    let mut plan = String::new();

    let _ = writeln!(plan, "[DRY RUN] Workflow '{}': {} steps", workflow.id, order.len());
    for (n, step_id) in order.iter().enumerate() {
        let Some(step) = workflow.get_step(step_id) else {
            continue;
        };
        let _ = writeln!(plan);
        let _ = writeln!(plan, "{}. {}", n + 1, step.id);
        let _ = writeln!(plan, "   run: {} '{}'", step.run.kind(), step.run.id());
        for binding in &step.bindings {
            let sources: Vec<String> = binding.sources.iter().map(ToString::to_string).collect();
            match (sources.is_empty(), &binding.default) {
                (true, Some(default)) => {
                    let _ = writeln!(plan, "   in:  {} = {}", binding.input, default);
                }
                _ => {
                    let _ = writeln!(plan, "   in:  {} <- {}", binding.input, sources.join(", "));
                }
            }
        }
        if !step.outputs.is_empty() {
            let _ = writeln!(plan, "   out: {}", step.outputs.join(", "));
        }
        if let Some(scatter) = &step.scatter {
            let _ = writeln!(
                plan,
                "   scatter: [{}] ({})",
                scatter.inputs.join(", "),
                scatter.method
            );
        }
    }

    let outputs: Vec<String> = workflow
        .outputs
        .iter()
        .map(|o| {
            let sources: Vec<String> = o.sources.iter().map(ToString::to_string).collect();
            format!("{} <- {}", o.id, sources.join(", "))
        })
        .collect();
    if !outputs.is_empty() {
        let _ = writeln!(plan);
        let _ = writeln!(plan, "Outputs: {}", outputs.join("; "));
    }
    Ok(plan)
}

//! Workflow Execution Module
//!
//! Runs a loaded workflow: schedules ready steps on a bounded pool of
//! worker threads, executes step instances and aggregates their outputs.
//!
//! # Architecture
//!
//! - [`engine`]: Coordinator with failure policy and cancellation
//! - [`step`]: Execution of a single step instance
//! - [`aggregator`]: Ordered gathering and publication of step outputs
//! - [`slots`]: Process limit shared across nested workflows

pub mod aggregator;
pub mod engine;
pub mod slots;
pub mod step;

pub use aggregator::ScatterFailurePolicy;
pub use engine::{describe_plan, Engine, EngineConfig, FailurePolicy, RunOutcome};

//! Workflow Definition Module
//!
//! Loading, validating and planning CWL workflows.
//!
//! # Structure
//!
//! - [`types`]: CWL parameter types and runtime values
//! - [`model`]: Workflow, step and tool definitions
//! - [`parser`]: YAML document loading (`$graph`, `run` references)
//! - [`reference`]: `$(inputs.x)` parameter references
//! - [`validator`]: Reference and duplicate checks
//! - [`planner`]: Topological ordering and step status tracking
//! - [`scatter`]: Expansion of scattered steps into instances
//! - [`job`]: Workflow inputs from the command line and job files
//! - [`state`]: Execution records and the run report

pub mod job;
pub mod model;
pub mod parser;
pub mod planner;
pub mod reference;
pub mod scatter;
pub mod state;
pub mod types;
pub mod validator;

pub use model::{RunTarget, Step, WorkflowDefinition};
pub use parser::{load_workflow, parse_workflow_str};
pub use planner::{topological_order, ExecutionPlanner};
pub use state::{ExecutionRecord, InstanceStatus, RunReport};
pub use types::{CwlType, Value, ValueMap};

//! cwlrunner - Minimal CWL Workflow Runner
//!
//! Executes Common Workflow Language workflows made of containerized
//! command-line tools: steps are ordered by their data dependencies,
//! scattered steps fan out into parallel instances, and instance outputs
//! are gathered back in index order for downstream steps.
//!
//! # Architecture
//!
//! The library is organized into five modules:
//!
//! - [`workflow`]: Document loading, graph model, ordering and scatter expansion
//! - [`execution`]: Coordinator, step instance execution and output aggregation
//! - [`environment`]: Container runtime selection and invocation
//! - [`monitoring`]: Per-instance execution timeline
//! - [`error`]: Error taxonomy shared by all of the above
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//!
//! use cwlrunner::execution::{Engine, EngineConfig};
//! use cwlrunner::workflow::job::resolve_inputs;
//! use cwlrunner::workflow::{Value, ValueMap};
//! use cwlrunner::load_workflow;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let workflow = load_workflow("water-bodies.cwl", None)?;
//!
//!     let mut inputs = ValueMap::new();
//!     inputs.insert(
//!         "bands".to_string(),
//!         Value::Array(vec![Value::String("green".into()), Value::String("nir".into())]),
//!     );
//!     let inputs = resolve_inputs(&workflow, inputs, Path::new("."))?;
//!
//!     let engine = Engine::new(EngineConfig::default());
//!     let outputs = engine.run(workflow, inputs).result?;
//!     println!("{:?}", outputs);
//!     Ok(())
//! }
//! ```

pub mod environment;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use error::{Result, WorkflowError};
pub use execution::{Engine, EngineConfig};
pub use workflow::model::{Step, WorkflowDefinition};
pub use workflow::parser::load_workflow;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "cwlrunner";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "cwlrunner");
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }

    #[test]
    fn test_module_exports_workflow() {
        let workflow = WorkflowDefinition::new("main");
        assert!(workflow.is_empty());
        assert_eq!(workflow.id, "main");
    }
}

//! Error Types
//!
//! Every failure the runner can report, from document loading through
//! step execution. Execution errors carry the failing step id, the scatter
//! index when one applies, and whatever diagnostics the process left behind.

use std::fmt;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Formats an optional scatter index as `[i]` for error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexLabel(pub Option<usize>);

impl fmt::Display for IndexLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(i) => write!(f, "[{}]", i),
            None => Ok(()),
        }
    }
}

impl From<&Option<usize>> for IndexLabel {
    fn from(index: &Option<usize>) -> Self {
        Self(*index)
    }
}

/// Errors raised while loading, planning or executing a workflow.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Bad document structure, dangling references, duplicate ids or
    /// cyclic `run` references. Raised before anything executes.
    #[error("Malformed workflow graph: {0}")]
    MalformedGraph(String),

    /// No topological order exists for the step graph.
    #[error("Cyclic dependency between steps: {}", .steps.join(" -> "))]
    CyclicDependency { steps: Vec<String> },

    /// Scattered inputs of a dotproduct step have different lengths.
    #[error("Step '{step}': scatter inputs have mismatched lengths ({})", format_lengths(.lengths))]
    ScatterCardinality {
        step: String,
        lengths: Vec<(String, usize)>,
    },

    /// The backing process exited non-zero or could not be launched.
    #[error("Step '{step}'{} failed: {message}", IndexLabel::from(.index))]
    StepExecution {
        step: String,
        index: Option<usize>,
        message: String,
        diagnostics: String,
    },

    /// A required output glob matched nothing.
    #[error("Step '{step}'{}: output '{output}' matched no files for pattern '{pattern}'", IndexLabel::from(.index))]
    OutputNotFound {
        step: String,
        index: Option<usize>,
        output: String,
        pattern: String,
    },

    /// A single-valued output glob matched more than one file.
    #[error("Step '{step}'{}: output '{output}' matched {count} files for pattern '{pattern}' but expects one", IndexLabel::from(.index))]
    AmbiguousOutput {
        step: String,
        index: Option<usize>,
        output: String,
        pattern: String,
        count: usize,
    },

    /// A step could not run because one of its producers failed.
    #[error("Step '{step}' skipped: upstream step '{upstream}' did not produce its outputs")]
    UpstreamFailed { step: String, upstream: String },

    /// The instance was cancelled after a sibling failure.
    #[error("Step '{step}'{} cancelled", IndexLabel::from(.index))]
    Cancelled { step: String, index: Option<usize> },

    /// A workflow or step input value is missing or has the wrong shape.
    #[error("Invalid input '{name}': {message}")]
    InvalidInput { name: String, message: String },

    /// One or more workflow outputs could not be produced.
    #[error("Workflow '{workflow}' failed: {}", .failures.join("; "))]
    RunFailed {
        workflow: String,
        failures: Vec<String>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn format_lengths(lengths: &[(String, usize)]) -> String {
    lengths
        .iter()
        .map(|(name, len)| format!("{}={}", name, len))
        .collect::<Vec<_>>()
        .join(", ")
}

impl WorkflowError {
    /// Shorthand for a [`WorkflowError::MalformedGraph`].
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedGraph(message.into())
    }

    /// Shorthand for a [`WorkflowError::InvalidInput`].
    pub fn invalid_input(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Returns the step this error belongs to, if any.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::ScatterCardinality { step, .. }
            | Self::StepExecution { step, .. }
            | Self::OutputNotFound { step, .. }
            | Self::AmbiguousOutput { step, .. }
            | Self::UpstreamFailed { step, .. }
            | Self::Cancelled { step, .. } => Some(step),
            _ => None,
        }
    }

    /// Process diagnostics captured for a failed step, empty otherwise.
    pub fn diagnostics(&self) -> &str {
        match self {
            Self::StepExecution { diagnostics, .. } => diagnostics,
            _ => "",
        }
    }
}

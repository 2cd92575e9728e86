//! Workflow Data Model
//!
//! In-memory form of a loaded workflow document: the workflow's declared
//! inputs and outputs, its steps, the bindings wiring them together and
//! the runnable unit behind each step.
//!
//! # Example document
//!
//! ```yaml
//! class: Workflow
//! id: detect_water_body
//! inputs:
//!   item: string
//!   bands: string[]
//! outputs:
//!   mask:
//!     type: Directory
//!     outputSource: node_otsu/binary_mask_item
//! steps:
//!   node_crop:
//!     run: "#crop"
//!     in: {item: item, band: bands}
//!     out: [cropped]
//!     scatter: band
//!     scatterMethod: dotproduct
//!   node_normalized_difference:
//!     run: "#norm_diff"
//!     in: {rasters: node_crop/cropped}
//!     out: [ndwi]
//!   node_otsu:
//!     run: "#otsu"
//!     in: {raster: node_normalized_difference/ndwi}
//!     out: [binary_mask_item]
//! ```
//!
//! All definitions are immutable once loaded and shared behind [`Arc`].

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use super::types::{CwlType, Value};

/// Producer side of a binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Source {
    /// A declared input of the enclosing workflow
    WorkflowInput(String),
    /// A named output of another step
    StepOutput { step: String, output: String },
}

impl Source {
    /// Parses a source reference relative to the enclosing workflow.
    ///
    /// Accepts `input`, `step/output`, and the `#`-prefixed or fully
    /// qualified `#workflow/step/output` forms.
    pub fn parse(raw: &str, workflow_id: &str) -> Self {
        let trimmed = raw.trim().trim_start_matches('#');
        let local = trimmed
            .strip_prefix(workflow_id)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(trimmed);

        match local.rsplit_once('/') {
            Some((step, output)) => Source::StepOutput {
                step: step.rsplit('/').next().unwrap_or(step).to_string(),
                output: output.to_string(),
            },
            None => Source::WorkflowInput(local.to_string()),
        }
    }

    /// Id of the producing step, if this is a step output.
    pub fn step(&self) -> Option<&str> {
        match self {
            Source::StepOutput { step, .. } => Some(step),
            Source::WorkflowInput(_) => None,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::WorkflowInput(name) => write!(f, "{}", name),
            Source::StepOutput { step, output } => write!(f, "{}/{}", step, output),
        }
    }
}

/// How multiple sources feeding one sink are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkMerge {
    /// One array element per source
    #[default]
    MergeNested,
    /// Sources that are arrays are spliced in, scalars appended
    MergeFlattened,
}

impl LinkMerge {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "merge_nested" => Some(LinkMerge::MergeNested),
            "merge_flattened" => Some(LinkMerge::MergeFlattened),
            _ => None,
        }
    }

    /// Combines the values of several sources into one.
    ///
    /// A single source passes through unchanged.
    pub fn merge(self, mut values: Vec<Value>) -> Value {
        if values.len() == 1 {
            return values.remove(0);
        }
        match self {
            LinkMerge::MergeNested => Value::Array(values),
            LinkMerge::MergeFlattened => Value::Array(
                values
                    .into_iter()
                    .flat_map(|v| match v {
                        Value::Array(items) => items,
                        scalar => vec![scalar],
                    })
                    .collect(),
            ),
        }
    }
}

/// Edge from one or more producers to a consumer step input.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    /// Name of the step input being fed
    pub input: String,
    /// Producers; empty when only a default applies
    pub sources: Vec<Source>,
    /// Value used when there is no source or every source is null
    pub default: Option<Value>,
    pub link_merge: LinkMerge,
}

impl Binding {
    pub fn new(input: impl Into<String>, sources: Vec<Source>) -> Self {
        Self {
            input: input.into(),
            sources,
            default: None,
            link_merge: LinkMerge::default(),
        }
    }
}

/// Scatter combination method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScatterMethod {
    /// Pair elements positionally; all inputs must share a length
    #[default]
    DotProduct,
    /// Cartesian product, results in one flat sequence
    FlatCrossProduct,
    /// Cartesian product, results nested one level per scattered input
    NestedCrossProduct,
}

impl ScatterMethod {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "dotproduct" => Some(ScatterMethod::DotProduct),
            "flat_crossproduct" => Some(ScatterMethod::FlatCrossProduct),
            "nested_crossproduct" => Some(ScatterMethod::NestedCrossProduct),
            _ => None,
        }
    }
}

impl fmt::Display for ScatterMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScatterMethod::DotProduct => "dotproduct",
            ScatterMethod::FlatCrossProduct => "flat_crossproduct",
            ScatterMethod::NestedCrossProduct => "nested_crossproduct",
        };
        write!(f, "{}", name)
    }
}

/// Which inputs of a step fan out, and how.
#[derive(Debug, Clone, PartialEq)]
pub struct ScatterSpec {
    pub inputs: Vec<String>,
    pub method: ScatterMethod,
}

/// Command-line binding for a tool input or argument.
#[derive(Debug, Clone, PartialEq)]
pub struct InputBinding {
    pub position: i64,
    pub prefix: Option<String>,
    /// Whether prefix and value are separate tokens
    pub separate: bool,
    /// Joins array items into a single token when set
    pub item_separator: Option<String>,
    /// Replaces the bound value; may contain parameter references
    pub value_from: Option<String>,
}

impl Default for InputBinding {
    fn default() -> Self {
        Self {
            position: 0,
            prefix: None,
            separate: true,
            item_separator: None,
            value_from: None,
        }
    }
}

/// Declared tool input.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInput {
    pub id: String,
    pub ty: CwlType,
    pub default: Option<Value>,
    /// Inputs without a binding are staged but not put on the command line
    pub binding: Option<InputBinding>,
}

/// Declared tool output captured from the instance directory.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub id: String,
    pub ty: CwlType,
    pub glob: Option<String>,
}

/// CPU and memory ceilings passed through to the execution backend.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResourceLimits {
    pub cores: Option<f64>,
    pub ram_mb: Option<u64>,
}

/// A command-line tool: the unit of execution behind a step.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandLineTool {
    pub id: String,
    pub base_command: Vec<String>,
    pub arguments: Vec<InputBinding>,
    pub inputs: Vec<ToolInput>,
    pub outputs: Vec<ToolOutput>,
    /// File name that captures standard output
    pub stdout: Option<String>,
    /// Container image from `DockerRequirement`
    pub docker_image: Option<String>,
    pub resources: ResourceLimits,
    /// Variables from `EnvVarRequirement`
    pub env: Vec<(String, String)>,
}

impl CommandLineTool {
    pub fn new(id: impl Into<String>, base_command: Vec<String>) -> Self {
        Self {
            id: id.into(),
            base_command,
            arguments: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            stdout: None,
            docker_image: None,
            resources: ResourceLimits::default(),
            env: Vec::new(),
        }
    }

    /// Adds an input bound to the command line with `prefix`.
    pub fn with_input(mut self, id: &str, ty: CwlType, prefix: Option<&str>) -> Self {
        self.inputs.push(ToolInput {
            id: id.to_string(),
            ty,
            default: None,
            binding: Some(InputBinding {
                prefix: prefix.map(str::to_string),
                position: self.inputs.len() as i64,
                ..InputBinding::default()
            }),
        });
        self
    }

    /// Adds an output captured by glob.
    pub fn with_output(mut self, id: &str, ty: CwlType, glob: &str) -> Self {
        self.outputs.push(ToolOutput {
            id: id.to_string(),
            ty,
            glob: Some(glob.to_string()),
        });
        self
    }

    pub fn input(&self, id: &str) -> Option<&ToolInput> {
        self.inputs.iter().find(|i| i.id == id)
    }
}

/// Runnable unit behind a step.
#[derive(Debug, Clone)]
pub enum RunTarget {
    /// A command-line tool run as one process per instance
    InlineTool(Arc<CommandLineTool>),
    /// A nested workflow executed recursively per instance
    ExternalSubworkflow(Arc<WorkflowDefinition>),
}

impl RunTarget {
    pub fn id(&self) -> &str {
        match self {
            RunTarget::InlineTool(tool) => &tool.id,
            RunTarget::ExternalSubworkflow(wf) => &wf.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RunTarget::InlineTool(_) => "CommandLineTool",
            RunTarget::ExternalSubworkflow(_) => "Workflow",
        }
    }

    /// Declared inputs as (name, type, default).
    pub fn input_params(&self) -> Vec<(&str, &CwlType, Option<&Value>)> {
        match self {
            RunTarget::InlineTool(tool) => tool
                .inputs
                .iter()
                .map(|i| (i.id.as_str(), &i.ty, i.default.as_ref()))
                .collect(),
            RunTarget::ExternalSubworkflow(wf) => wf
                .inputs
                .iter()
                .map(|i| (i.id.as_str(), &i.ty, i.default.as_ref()))
                .collect(),
        }
    }

    pub fn declares_output(&self, name: &str) -> bool {
        match self {
            RunTarget::InlineTool(tool) => tool.outputs.iter().any(|o| o.id == name),
            RunTarget::ExternalSubworkflow(wf) => wf.outputs.iter().any(|o| o.id == name),
        }
    }
}

/// A step of a workflow: a run target plus its input wiring.
#[derive(Debug, Clone)]
pub struct Step {
    pub id: String,
    pub run: RunTarget,
    pub bindings: Vec<Binding>,
    /// Output names other steps may reference
    pub outputs: Vec<String>,
    pub scatter: Option<ScatterSpec>,
}

impl Step {
    /// Creates a step with no bindings.
    ///
    /// # Example
    ///
    /// ```
    /// use std::sync::Arc;
    /// use cwlrunner::workflow::model::{CommandLineTool, RunTarget, ScatterMethod, Step};
    ///
    /// let crop = CommandLineTool::new("crop", vec!["crop".to_string()]);
    /// let step = Step::new("node_crop", RunTarget::InlineTool(Arc::new(crop)))
    ///     .bind("band", "bands")
    ///     .with_output("cropped")
    ///     .scatter(&["band"], ScatterMethod::DotProduct);
    /// assert!(step.is_scattered());
    /// ```
    pub fn new(id: impl Into<String>, run: RunTarget) -> Self {
        Self {
            id: id.into(),
            run,
            bindings: Vec::new(),
            outputs: Vec::new(),
            scatter: None,
        }
    }

    /// Binds a step input to a single source (`input` or `step/output`).
    pub fn bind(mut self, input: &str, source: &str) -> Self {
        self.bindings
            .push(Binding::new(input, vec![Source::parse(source, "")]));
        self
    }

    pub fn with_output(mut self, name: &str) -> Self {
        self.outputs.push(name.to_string());
        self
    }

    pub fn scatter(mut self, inputs: &[&str], method: ScatterMethod) -> Self {
        self.scatter = Some(ScatterSpec {
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            method,
        });
        self
    }

    pub fn is_scattered(&self) -> bool {
        self.scatter.is_some()
    }

    /// Ids of steps whose outputs this step consumes.
    pub fn upstream_steps(&self) -> BTreeSet<&str> {
        self.bindings
            .iter()
            .flat_map(|b| b.sources.iter())
            .filter_map(Source::step)
            .collect()
    }

    pub fn binding(&self, input: &str) -> Option<&Binding> {
        self.bindings.iter().find(|b| b.input == input)
    }
}

/// Declared workflow input.
#[derive(Debug, Clone, PartialEq)]
pub struct InputParam {
    pub id: String,
    pub ty: CwlType,
    pub default: Option<Value>,
    pub label: Option<String>,
    pub doc: Option<String>,
}

impl InputParam {
    pub fn new(id: impl Into<String>, ty: CwlType) -> Self {
        Self {
            id: id.into(),
            ty,
            default: None,
            label: None,
            doc: None,
        }
    }
}

/// Declared workflow output.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputParam {
    pub id: String,
    pub ty: CwlType,
    pub sources: Vec<Source>,
    pub link_merge: LinkMerge,
}

impl OutputParam {
    pub fn new(id: impl Into<String>, ty: CwlType, source: &str) -> Self {
        Self {
            id: id.into(),
            ty,
            sources: vec![Source::parse(source, "")],
            link_merge: LinkMerge::default(),
        }
    }
}

/// A loaded workflow.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub id: String,
    pub label: Option<String>,
    pub doc: Option<String>,
    pub inputs: Vec<InputParam>,
    pub outputs: Vec<OutputParam>,
    /// Steps in document order
    pub steps: Vec<Step>,
    /// Directory relative paths in defaults are resolved against
    pub base_dir: PathBuf,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: None,
            doc: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            steps: Vec::new(),
            base_dir: PathBuf::from("."),
        }
    }

    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn input(&self, id: &str) -> Option<&InputParam> {
        self.inputs.iter().find(|i| i.id == id)
    }

    /// Steps whose outputs feed a workflow output.
    pub fn terminal_steps(&self) -> BTreeSet<&str> {
        self.outputs
            .iter()
            .flat_map(|o| o.sources.iter())
            .filter_map(Source::step)
            .collect()
    }

    /// Ids of steps consuming any output of `step_id`.
    pub fn dependents(&self, step_id: &str) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.upstream_steps().contains(step_id))
            .map(|s| s.id.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn tool(id: &str) -> RunTarget {
        RunTarget::InlineTool(Arc::new(
            CommandLineTool::new(id, vec![id.to_string()])
                .with_input("x", CwlType::String, Some("--x"))
                .with_output("out", CwlType::File, "*.txt"),
        ))
    }

    #[test]
    fn test_source_parse_forms() {
        assert_eq!(
            Source::parse("aoi", "wf"),
            Source::WorkflowInput("aoi".to_string())
        );
        assert_eq!(
            Source::parse("node_crop/cropped", "wf"),
            Source::StepOutput {
                step: "node_crop".to_string(),
                output: "cropped".to_string()
            }
        );
        assert_eq!(
            Source::parse("#wf/node_crop/cropped", "wf"),
            Source::parse("node_crop/cropped", "wf")
        );
        assert_eq!(
            Source::parse("#wf/aoi", "wf"),
            Source::WorkflowInput("aoi".to_string())
        );
    }

    #[test]
    fn test_source_display() {
        assert_eq!(Source::parse("a/b", "").to_string(), "a/b");
        assert_eq!(Source::parse("a", "").to_string(), "a");
    }

    #[test]
    fn test_link_merge() {
        let single = LinkMerge::MergeNested.merge(vec![Value::Int(1)]);
        assert_eq!(single, Value::Int(1));

        let nested = LinkMerge::MergeNested.merge(vec![
            Value::Array(vec![Value::Int(1)]),
            Value::Int(2),
        ]);
        assert_eq!(
            nested,
            Value::Array(vec![Value::Array(vec![Value::Int(1)]), Value::Int(2)])
        );

        let flat = LinkMerge::MergeFlattened.merge(vec![
            Value::Array(vec![Value::Int(1)]),
            Value::Int(2),
        ]);
        assert_eq!(flat, Value::Array(vec![Value::Int(1), Value::Int(2)]));
    }

    #[test]
    fn test_scatter_method_parse() {
        assert_eq!(ScatterMethod::parse("dotproduct"), Some(ScatterMethod::DotProduct));
        assert_eq!(
            ScatterMethod::parse("nested_crossproduct"),
            Some(ScatterMethod::NestedCrossProduct)
        );
        assert_eq!(ScatterMethod::parse("zip"), None);
        assert_eq!(ScatterMethod::FlatCrossProduct.to_string(), "flat_crossproduct");
    }

    #[test]
    fn test_step_upstream_and_dependents() {
        let mut wf = WorkflowDefinition::new("wf");
        wf.steps.push(Step::new("a", tool("t")).bind("x", "aoi").with_output("out"));
        wf.steps.push(Step::new("b", tool("t")).bind("x", "a/out").with_output("out"));
        wf.steps.push(Step::new("c", tool("t")).bind("x", "a/out").with_output("out"));
        wf.outputs.push(OutputParam::new("final", CwlType::File, "c/out"));

        assert!(wf.steps[0].upstream_steps().is_empty());
        assert_eq!(wf.steps[1].upstream_steps().into_iter().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(wf.dependents("a"), vec!["b", "c"]);
        assert!(wf.terminal_steps().contains("c"));
        assert!(!wf.terminal_steps().contains("b"));
    }

    #[test]
    fn test_run_target_interface() {
        let target = tool("crop");
        assert_eq!(target.id(), "crop");
        assert_eq!(target.kind(), "CommandLineTool");
        assert!(target.declares_output("out"));
        assert!(!target.declares_output("missing"));
        assert_eq!(target.input_params()[0].0, "x");

        let mut sub = WorkflowDefinition::new("sub");
        sub.inputs.push(InputParam::new("item", CwlType::String));
        let target = RunTarget::ExternalSubworkflow(Arc::new(sub));
        assert_eq!(target.kind(), "Workflow");
        assert_eq!(target.input_params().len(), 1);
    }

    #[test]
    fn test_tool_builder_positions() {
        let t = CommandLineTool::new("t", vec!["t".into()])
            .with_input("a", CwlType::String, Some("--a"))
            .with_input("b", CwlType::String, None);
        assert_eq!(t.input("b").unwrap().binding.as_ref().unwrap().position, 1);
        assert!(t.input("c").is_none());
    }

    #[test]
    fn test_workflow_defaults() {
        let wf = WorkflowDefinition::new("wf");
        assert!(wf.is_empty());
        assert_eq!(wf.len(), 0);
        assert_eq!(wf.base_dir, Path::new("."));
    }
}

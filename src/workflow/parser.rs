//! Workflow Parser
//!
//! Loads CWL documents into [`WorkflowDefinition`]s. Handles single-process
//! documents and `$graph` bundles, list and map forms of parameter and step
//! declarations, and `run` targets given as graph references (`#crop`),
//! external files (`tools/crop.cwl`, `sub.cwl#main`) or inline mappings.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use serde_yaml::{Mapping, Value as Yaml};

use crate::error::{Result, WorkflowError};

use super::model::{
    Binding, CommandLineTool, InputBinding, InputParam, LinkMerge, OutputParam, ResourceLimits,
    RunTarget, ScatterMethod, ScatterSpec, Source, Step, ToolInput, ToolOutput,
    WorkflowDefinition,
};
use super::planner::topological_order;
use super::reference::{check_template, has_references};
use super::types::{CwlType, Value};
use super::validator::validate_workflow;

/// Entry point id looked up when none is given.
const DEFAULT_ENTRYPOINT: &str = "main";

/// Loads the workflow selected by `entrypoint` from a CWL document.
///
/// This function:
/// 1. Reads the YAML document (single process or `$graph`)
/// 2. Resolves every `run` target, recursively for sub-workflows
/// 3. Validates references in every workflow
/// 4. Checks that each workflow has a topological order
///
/// # Example
///
/// ```rust,no_run
/// use cwlrunner::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("water-bodies.cwl", Some("water-bodies"))?;
///     println!("Loaded {} steps", workflow.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(
    path: impl AsRef<Path>,
    entrypoint: Option<&str>,
) -> Result<Arc<WorkflowDefinition>> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let mut loader = Loader::default();
    let doc_path = loader.read_document(path)?;
    let entry_id = loader.documents[&doc_path].select_entry(entrypoint)?;

    match loader.load_process(&doc_path, &entry_id)? {
        RunTarget::ExternalSubworkflow(workflow) => {
            info!(
                "Workflow '{}' loaded: {} inputs, {} outputs, {} steps",
                workflow.id,
                workflow.inputs.len(),
                workflow.outputs.len(),
                workflow.steps.len()
            );
            Ok(workflow)
        }
        RunTarget::InlineTool(tool) => Err(WorkflowError::malformed(format!(
            "entry point '{}' is a CommandLineTool, not a Workflow",
            tool.id
        ))),
    }
}

/// Parses a workflow from YAML text. Relative `run` paths resolve against `base_dir`.
pub fn parse_workflow_str(
    yaml: &str,
    base_dir: &Path,
    entrypoint: Option<&str>,
) -> Result<Arc<WorkflowDefinition>> {
    let mut loader = Loader::default();
    let key = base_dir.join("<inline>");
    let doc = Document::parse(yaml, key.clone())?;
    let entry_id = doc.select_entry(entrypoint)?;
    loader.documents.insert(key.clone(), doc);

    match loader.load_process(&key, &entry_id)? {
        RunTarget::ExternalSubworkflow(workflow) => Ok(workflow),
        RunTarget::InlineTool(tool) => Err(WorkflowError::malformed(format!(
            "entry point '{}' is a CommandLineTool, not a Workflow",
            tool.id
        ))),
    }
}

/// One parsed document: its processes by id, in declaration order.
struct Document {
    path: PathBuf,
    processes: Vec<(String, Mapping)>,
}

impl Document {
    fn parse(content: &str, path: PathBuf) -> Result<Self> {
        // Duplicate map keys (e.g. two steps with one id) fail here.
        let root: Yaml = serde_yaml::from_str(content).map_err(|e| {
            WorkflowError::malformed(format!("{}: {}", path.display(), e))
        })?;
        let root = root.as_mapping().ok_or_else(|| {
            WorkflowError::malformed(format!("{}: document is not a mapping", path.display()))
        })?;

        let mut processes = Vec::new();
        if let Some(graph) = root.get("$graph") {
            let items = graph.as_sequence().ok_or_else(|| {
                WorkflowError::malformed("$graph must be a list of process objects")
            })?;
            for item in items {
                let map = item
                    .as_mapping()
                    .ok_or_else(|| WorkflowError::malformed("$graph entry is not a mapping"))?;
                let id = str_field(map, "id")
                    .map(local_id)
                    .ok_or_else(|| WorkflowError::malformed("$graph entry without 'id'"))?;
                processes.push((id, map.clone()));
            }
        } else {
            let id = str_field(root, "id").map(local_id).unwrap_or_else(|| {
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or(DEFAULT_ENTRYPOINT)
                    .to_string()
            });
            processes.push((id, root.clone()));
        }

        let mut seen = std::collections::HashSet::new();
        for (id, _) in &processes {
            if !seen.insert(id.as_str()) {
                return Err(WorkflowError::malformed(format!(
                    "{}: duplicate process id '{}'",
                    path.display(),
                    id
                )));
            }
        }

        debug!("Document {} declares {} processes", path.display(), processes.len());
        Ok(Self { path, processes })
    }

    fn get(&self, id: &str) -> Option<&Mapping> {
        self.processes
            .iter()
            .find(|(pid, _)| pid == id)
            .map(|(_, map)| map)
    }

    /// Picks the root process: explicit id, then `main`, then the only
    /// process, then the first Workflow.
    fn select_entry(&self, entrypoint: Option<&str>) -> Result<String> {
        if let Some(id) = entrypoint {
            let id = local_id(id);
            return match self.get(&id) {
                Some(_) => Ok(id),
                None => Err(WorkflowError::malformed(format!(
                    "{}: no process with id '{}'",
                    self.path.display(),
                    id
                ))),
            };
        }
        if self.get(DEFAULT_ENTRYPOINT).is_some() {
            return Ok(DEFAULT_ENTRYPOINT.to_string());
        }
        if let [(id, _)] = self.processes.as_slice() {
            return Ok(id.clone());
        }
        self.processes
            .iter()
            .find(|(_, map)| str_field(map, "class") == Some("Workflow"))
            .map(|(id, _)| id.clone())
            .ok_or_else(|| {
                WorkflowError::malformed(format!(
                    "{}: cannot pick an entry point, pass one explicitly",
                    self.path.display()
                ))
            })
    }
}

/// Resolves processes across documents, caching each one and detecting
/// cyclic `run` references.
#[derive(Default)]
struct Loader {
    documents: HashMap<PathBuf, Document>,
    resolving: Vec<String>,
    loaded: HashMap<String, RunTarget>,
}

impl Loader {
    /// Reads a document once; returns its canonical key.
    fn read_document(&mut self, path: &Path) -> Result<PathBuf> {
        let key = fs::canonicalize(path).map_err(|e| {
            WorkflowError::malformed(format!(
                "cannot read workflow document '{}': {}",
                path.display(),
                e
            ))
        })?;
        if !self.documents.contains_key(&key) {
            let content = fs::read_to_string(&key)?;
            debug!("Document content loaded ({} bytes)", content.len());
            let doc = Document::parse(&content, key.clone())?;
            self.documents.insert(key.clone(), doc);
        }
        Ok(key)
    }

    fn load_process(&mut self, doc_path: &Path, id: &str) -> Result<RunTarget> {
        let key = format!("{}#{}", doc_path.display(), id);
        if let Some(target) = self.loaded.get(&key) {
            return Ok(target.clone());
        }
        if self.resolving.contains(&key) {
            let chain: Vec<&str> = self
                .resolving
                .iter()
                .filter_map(|k| k.rsplit('#').next())
                .collect();
            return Err(WorkflowError::malformed(format!(
                "cyclic run reference: {} -> {}",
                chain.join(" -> "),
                id
            )));
        }

        let raw = self
            .documents
            .get(doc_path)
            .and_then(|doc| doc.get(id))
            .cloned()
            .ok_or_else(|| {
                WorkflowError::malformed(format!(
                    "run target '#{}' not found in {}",
                    id,
                    doc_path.display()
                ))
            })?;

        self.resolving.push(key.clone());
        let target = self.build_process(id, &raw, doc_path);
        self.resolving.pop();

        let target = target?;
        self.loaded.insert(key, target.clone());
        Ok(target)
    }

    fn build_process(&mut self, id: &str, raw: &Mapping, doc_path: &Path) -> Result<RunTarget> {
        match str_field(raw, "class") {
            Some("Workflow") => Ok(RunTarget::ExternalSubworkflow(Arc::new(
                self.parse_workflow(id, raw, doc_path)?,
            ))),
            Some("CommandLineTool") => Ok(RunTarget::InlineTool(Arc::new(parse_tool(
                id,
                raw,
                base_dir_of(doc_path),
            )?))),
            Some(other) => Err(WorkflowError::malformed(format!(
                "process '{}': class '{}' is not supported",
                id, other
            ))),
            None => Err(WorkflowError::malformed(format!(
                "process '{}' has no 'class'",
                id
            ))),
        }
    }

    /// Resolves a step's `run` field.
    fn resolve_run(&mut self, step_id: &str, run: &Yaml, doc_path: &Path) -> Result<RunTarget> {
        match run {
            Yaml::String(reference) => {
                if let Some(id) = reference.strip_prefix('#') {
                    return self.load_process(doc_path, id);
                }
                let (file, fragment) = match reference.split_once('#') {
                    Some((file, fragment)) => (file, Some(fragment)),
                    None => (reference.as_str(), None),
                };
                let path = base_dir_of(doc_path).join(file.trim_start_matches("file://"));
                let external = self.read_document(&path)?;
                let entry = self.documents[&external].select_entry(fragment)?;
                debug!("Step '{}' runs {}#{}", step_id, external.display(), entry);
                self.load_process(&external, &entry)
            }
            Yaml::Mapping(inline) => {
                let id = str_field(inline, "id")
                    .map(local_id)
                    .unwrap_or_else(|| format!("{}_run", step_id));
                self.build_process(&id, inline, doc_path)
            }
            _ => Err(WorkflowError::malformed(format!(
                "step '{}': 'run' must be a reference or an inline process",
                step_id
            ))),
        }
    }

    fn parse_workflow(
        &mut self,
        id: &str,
        raw: &Mapping,
        doc_path: &Path,
    ) -> Result<WorkflowDefinition> {
        let base_dir = base_dir_of(doc_path).to_path_buf();
        let mut workflow = WorkflowDefinition::new(id);
        workflow.label = str_field(raw, "label").map(str::to_string);
        workflow.doc = str_field(raw, "doc").map(str::to_string);
        workflow.base_dir = base_dir.clone();

        for (name, decl) in entries(raw.get("inputs"), "inputs")? {
            workflow.inputs.push(parse_input_param(&name, &decl, &base_dir)?);
        }

        for (name, decl) in entries(raw.get("outputs"), "outputs")? {
            workflow.outputs.push(parse_output_param(id, &name, &decl)?);
        }

        for (step_id, decl) in entries(raw.get("steps"), "steps")? {
            let step = self.parse_step(id, &step_id, &decl, doc_path)?;
            workflow.steps.push(step);
        }

        validate_workflow(&workflow)?;
        topological_order(&workflow)?;

        info!(
            "Parsed workflow '{}': {} steps",
            workflow.id,
            workflow.steps.len()
        );
        Ok(workflow)
    }

    fn parse_step(
        &mut self,
        workflow_id: &str,
        step_id: &str,
        decl: &Yaml,
        doc_path: &Path,
    ) -> Result<Step> {
        let map = decl.as_mapping().ok_or_else(|| {
            WorkflowError::malformed(format!("step '{}' is not a mapping", step_id))
        })?;
        let base_dir = base_dir_of(doc_path).to_path_buf();

        if map.contains_key("when") {
            return Err(WorkflowError::malformed(format!(
                "step '{}': conditional execution ('when') is not supported",
                step_id
            )));
        }

        let run = map.get("run").ok_or_else(|| {
            WorkflowError::malformed(format!("step '{}' has no 'run'", step_id))
        })?;
        let run = self.resolve_run(step_id, run, doc_path)?;
        let mut step = Step::new(step_id, run);

        for (input, value) in entries(map.get("in"), "in")? {
            step.bindings
                .push(parse_binding(workflow_id, step_id, &input, &value, &base_dir)?);
        }

        if let Some(out) = map.get("out") {
            let items = out.as_sequence().ok_or_else(|| {
                WorkflowError::malformed(format!("step '{}': 'out' must be a list", step_id))
            })?;
            for item in items {
                let name = match item {
                    Yaml::String(s) => Some(local_id(s)),
                    Yaml::Mapping(m) => str_field(m, "id").map(local_id),
                    _ => None,
                }
                .ok_or_else(|| {
                    WorkflowError::malformed(format!("step '{}': bad 'out' entry", step_id))
                })?;
                step.outputs.push(name);
            }
        }

        if let Some(scatter) = map.get("scatter") {
            let inputs = string_or_list(scatter).ok_or_else(|| {
                WorkflowError::malformed(format!(
                    "step '{}': 'scatter' must be a name or list of names",
                    step_id
                ))
            })?;
            let inputs: Vec<String> = inputs.iter().map(|s| local_id(s)).collect();
            let method = match str_field(map, "scatterMethod") {
                Some(raw) => ScatterMethod::parse(raw).ok_or_else(|| {
                    WorkflowError::malformed(format!(
                        "step '{}': unknown scatterMethod '{}'",
                        step_id, raw
                    ))
                })?,
                None if inputs.len() > 1 => {
                    return Err(WorkflowError::malformed(format!(
                        "step '{}': scatterMethod is required when scattering over several inputs",
                        step_id
                    )))
                }
                None => ScatterMethod::DotProduct,
            };
            step.scatter = Some(ScatterSpec { inputs, method });
        }

        Ok(step)
    }
}

fn parse_input_param(name: &str, decl: &Yaml, base_dir: &Path) -> Result<InputParam> {
    let (ty, map) = type_and_mapping(name, decl)?;
    let mut param = InputParam::new(name, ty);
    if let Some(map) = map {
        if let Some(default) = map.get("default") {
            param.default = Some(Value::from_yaml(default, base_dir)?);
        }
        param.label = str_field(map, "label").map(str::to_string);
        param.doc = str_field(map, "doc").map(str::to_string);
    }
    Ok(param)
}

fn parse_output_param(workflow_id: &str, name: &str, decl: &Yaml) -> Result<OutputParam> {
    let (ty, map) = type_and_mapping(name, decl)?;
    let map = map.ok_or_else(|| {
        WorkflowError::malformed(format!("workflow output '{}' has no outputSource", name))
    })?;
    let sources = map
        .get("outputSource")
        .and_then(string_or_list)
        .ok_or_else(|| {
            WorkflowError::malformed(format!("workflow output '{}' has no outputSource", name))
        })?;
    Ok(OutputParam {
        id: name.to_string(),
        ty,
        sources: sources
            .iter()
            .map(|s| Source::parse(s, workflow_id))
            .collect(),
        link_merge: parse_link_merge(map)?,
    })
}

fn parse_binding(
    workflow_id: &str,
    step_id: &str,
    input: &str,
    value: &Yaml,
    base_dir: &Path,
) -> Result<Binding> {
    let mut binding = Binding::new(input, Vec::new());
    match value {
        Yaml::String(_) | Yaml::Sequence(_) => {
            let sources = string_or_list(value).ok_or_else(|| {
                WorkflowError::malformed(format!(
                    "step '{}': input '{}' has a malformed source",
                    step_id, input
                ))
            })?;
            binding.sources = sources.iter().map(|s| Source::parse(s, workflow_id)).collect();
        }
        Yaml::Mapping(map) => {
            if map.contains_key("valueFrom") {
                return Err(WorkflowError::malformed(format!(
                    "step '{}': input '{}' uses valueFrom, which is not supported",
                    step_id, input
                )));
            }
            if let Some(source) = map.get("source") {
                let sources = string_or_list(source).ok_or_else(|| {
                    WorkflowError::malformed(format!(
                        "step '{}': input '{}' has a malformed source",
                        step_id, input
                    ))
                })?;
                binding.sources = sources.iter().map(|s| Source::parse(s, workflow_id)).collect();
            }
            if let Some(default) = map.get("default") {
                binding.default = Some(Value::from_yaml(default, base_dir)?);
            }
            binding.link_merge = parse_link_merge(map)?;
        }
        Yaml::Null => {}
        other => {
            // literal shorthand is not CWL, but a bare scalar is unambiguous as a default
            warn!(
                "step '{}': input '{}' given a literal; treating it as a default",
                step_id, input
            );
            binding.default = Some(Value::from_yaml(other, base_dir)?);
        }
    }
    Ok(binding)
}

fn parse_link_merge(map: &Mapping) -> Result<LinkMerge> {
    match str_field(map, "linkMerge") {
        None => Ok(LinkMerge::default()),
        Some(raw) => LinkMerge::parse(raw)
            .ok_or_else(|| WorkflowError::malformed(format!("unknown linkMerge '{}'", raw))),
    }
}

/// Parses a `CommandLineTool` process object.
fn parse_tool(id: &str, raw: &Mapping, base_dir: &Path) -> Result<CommandLineTool> {
    let base_command = raw
        .get("baseCommand")
        .map(|v| {
            string_or_list(v).ok_or_else(|| {
                WorkflowError::malformed(format!("tool '{}': bad baseCommand", id))
            })
        })
        .transpose()?
        .unwrap_or_default();
    let mut tool = CommandLineTool::new(id, base_command);
    tool.stdout = str_field(raw, "stdout").map(str::to_string);

    for (name, decl) in entries(raw.get("inputs"), "inputs")? {
        let (ty, map) = type_and_mapping(&name, &decl)?;
        let mut input = ToolInput {
            id: name.clone(),
            ty,
            default: None,
            binding: None,
        };
        if let Some(map) = map {
            if let Some(default) = map.get("default") {
                input.default = Some(Value::from_yaml(default, base_dir)?);
            }
            if let Some(Yaml::Mapping(binding)) = map.get("inputBinding") {
                input.binding = Some(parse_input_binding(binding)?);
            }
        }
        tool.inputs.push(input);
    }

    if let Some(arguments) = raw.get("arguments") {
        let items = arguments.as_sequence().ok_or_else(|| {
            WorkflowError::malformed(format!("tool '{}': 'arguments' must be a list", id))
        })?;
        for item in items {
            let argument = match item {
                Yaml::Mapping(map) => parse_input_binding(map)?,
                scalar => InputBinding {
                    value_from: Some(yaml_scalar_string(scalar).ok_or_else(|| {
                        WorkflowError::malformed(format!("tool '{}': bad argument", id))
                    })?),
                    ..InputBinding::default()
                },
            };
            tool.arguments.push(argument);
        }
    }

    for (name, decl) in entries(raw.get("outputs"), "outputs")? {
        let (ty, map) = type_and_mapping(&name, &decl)?;
        let glob = match map.and_then(|m| m.get("outputBinding")) {
            Some(Yaml::Mapping(binding)) => match binding.get("glob") {
                Some(Yaml::String(g)) => Some(g.clone()),
                Some(Yaml::Sequence(list)) if list.len() == 1 => {
                    list[0].as_str().map(str::to_string)
                }
                Some(_) => {
                    return Err(WorkflowError::malformed(format!(
                        "tool '{}': output '{}' must use a single glob pattern",
                        id, name
                    )))
                }
                None => None,
            },
            _ => None,
        };
        if glob.is_none() && ty.required() != &CwlType::Stdout {
            return Err(WorkflowError::malformed(format!(
                "tool '{}': output '{}' has no glob",
                id, name
            )));
        }
        tool.outputs.push(ToolOutput { id: name, ty, glob });
    }

    let has_stdout_output = tool.outputs.iter().any(|o| o.ty.required() == &CwlType::Stdout);
    if has_stdout_output && tool.stdout.is_none() {
        tool.stdout = Some(format!("{}.stdout", id));
    }

    for (class, body) in requirements(raw) {
        apply_requirement(&mut tool, &class, &body)?;
    }

    check_tool_references(&tool)?;
    debug!(
        "Parsed tool '{}': {} inputs, {} outputs, image {:?}",
        tool.id,
        tool.inputs.len(),
        tool.outputs.len(),
        tool.docker_image
    );
    Ok(tool)
}

fn parse_input_binding(map: &Mapping) -> Result<InputBinding> {
    let mut binding = InputBinding::default();
    if let Some(position) = map.get("position") {
        binding.position = position
            .as_i64()
            .ok_or_else(|| WorkflowError::malformed("inputBinding position must be an integer"))?;
    }
    binding.prefix = str_field(map, "prefix").map(str::to_string);
    if let Some(separate) = map.get("separate").and_then(Yaml::as_bool) {
        binding.separate = separate;
    }
    binding.item_separator = str_field(map, "itemSeparator").map(str::to_string);
    binding.value_from = map.get("valueFrom").and_then(yaml_scalar_string);
    Ok(binding)
}

/// Requirements and hints as (class, body) pairs; both list and map forms.
fn requirements(raw: &Mapping) -> Vec<(String, Mapping)> {
    let mut found = Vec::new();
    for key in ["requirements", "hints"] {
        match raw.get(key) {
            Some(Yaml::Sequence(items)) => {
                for item in items.iter().filter_map(Yaml::as_mapping) {
                    if let Some(class) = str_field(item, "class") {
                        found.push((class.to_string(), item.clone()));
                    }
                }
            }
            Some(Yaml::Mapping(map)) => {
                for (class, body) in map {
                    if let Some(class) = class.as_str() {
                        let body = body.as_mapping().cloned().unwrap_or_default();
                        found.push((class.to_string(), body));
                    }
                }
            }
            _ => {}
        }
    }
    found
}

fn apply_requirement(tool: &mut CommandLineTool, class: &str, body: &Mapping) -> Result<()> {
    match class {
        "DockerRequirement" => {
            tool.docker_image = str_field(body, "dockerPull")
                .or_else(|| str_field(body, "dockerImageId"))
                .map(str::to_string);
        }
        "ResourceRequirement" => {
            let number = |key: &str| -> Option<f64> {
                match body.get(key) {
                    Some(Yaml::Number(n)) => n.as_f64(),
                    Some(Yaml::String(s)) if !has_references(s) => s.parse().ok(),
                    Some(other) => {
                        warn!("tool '{}': ignoring non-numeric {}: {:?}", tool.id, key, other);
                        None
                    }
                    None => None,
                }
            };
            let cores = number("coresMax").or_else(|| number("coresMin"));
            let ram_mb = number("ramMax").or_else(|| number("ramMin")).map(|r| r as u64);
            tool.resources = ResourceLimits { cores, ram_mb };
        }
        "EnvVarRequirement" => match body.get("envDef") {
            Some(Yaml::Sequence(items)) => {
                for item in items.iter().filter_map(Yaml::as_mapping) {
                    let name = str_field(item, "envName");
                    let value = item.get("envValue").and_then(yaml_scalar_string);
                    if let (Some(name), Some(value)) = (name, value) {
                        tool.env.push((name.to_string(), value));
                    }
                }
            }
            Some(Yaml::Mapping(map)) => {
                for (name, value) in map {
                    if let (Some(name), Some(value)) = (name.as_str(), yaml_scalar_string(value)) {
                        tool.env.push((name.to_string(), value));
                    }
                }
            }
            _ => {}
        },
        other => debug!("tool '{}': ignoring requirement {}", tool.id, other),
    }
    Ok(())
}

/// Rejects references the executor could not substitute.
fn check_tool_references(tool: &CommandLineTool) -> Result<()> {
    let names: Vec<&str> = tool.inputs.iter().map(|i| i.id.as_str()).collect();
    let in_tool = |e: WorkflowError| match e {
        WorkflowError::MalformedGraph(msg) => {
            WorkflowError::malformed(format!("tool '{}': {}", tool.id, msg))
        }
        other => other,
    };

    let templates = tool
        .arguments
        .iter()
        .chain(tool.inputs.iter().filter_map(|i| i.binding.as_ref()))
        .filter_map(|b| b.value_from.as_deref())
        .chain(tool.outputs.iter().filter_map(|o| o.glob.as_deref()))
        .chain(tool.env.iter().map(|(_, v)| v.as_str()))
        .chain(tool.stdout.as_deref());

    for template in templates {
        check_template(template, &names).map_err(in_tool)?;
    }
    Ok(())
}

/// Normalises list-form and map-form declarations into (id, body) pairs.
fn entries(raw: Option<&Yaml>, what: &str) -> Result<Vec<(String, Yaml)>> {
    match raw {
        None | Some(Yaml::Null) => Ok(Vec::new()),
        Some(Yaml::Mapping(map)) => map
            .iter()
            .map(|(k, v)| {
                k.as_str().map(|k| (local_id(k), v.clone())).ok_or_else(|| {
                    WorkflowError::malformed(format!("non-string key in '{}'", what))
                })
            })
            .collect(),
        Some(Yaml::Sequence(items)) => items
            .iter()
            .map(|item| {
                item.as_mapping()
                    .and_then(|m| str_field(m, "id"))
                    .map(|id| (local_id(id), item.clone()))
                    .ok_or_else(|| {
                        WorkflowError::malformed(format!("entry in '{}' without an 'id'", what))
                    })
            })
            .collect(),
        Some(_) => Err(WorkflowError::malformed(format!(
            "'{}' must be a list or a mapping",
            what
        ))),
    }
}

/// Splits a parameter declaration into its type and (optional) body mapping.
fn type_and_mapping<'a>(name: &str, decl: &'a Yaml) -> Result<(CwlType, Option<&'a Mapping>)> {
    let wrap = |e: WorkflowError| match e {
        WorkflowError::MalformedGraph(msg) => {
            WorkflowError::malformed(format!("parameter '{}': {}", name, msg))
        }
        other => other,
    };
    match decl {
        Yaml::Mapping(map) => {
            let ty = match map.get("type") {
                Some(ty) => CwlType::parse(ty).map_err(wrap)?,
                None => CwlType::Any,
            };
            Ok((ty, Some(map)))
        }
        shorthand => Ok((CwlType::parse(shorthand).map_err(wrap)?, None)),
    }
}

fn str_field<'a>(map: &'a Mapping, key: &str) -> Option<&'a str> {
    map.get(key).and_then(Yaml::as_str)
}

fn string_or_list(raw: &Yaml) -> Option<Vec<String>> {
    match raw {
        Yaml::String(s) => Some(vec![s.clone()]),
        Yaml::Sequence(items) => items
            .iter()
            .map(|i| i.as_str().map(str::to_string))
            .collect(),
        _ => None,
    }
}

fn yaml_scalar_string(raw: &Yaml) -> Option<String> {
    match raw {
        Yaml::String(s) => Some(s.clone()),
        Yaml::Number(n) => Some(n.to_string()),
        Yaml::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Strips `#` and any `process/` qualification from an id.
fn local_id(raw: &str) -> String {
    raw.trim_start_matches('#')
        .rsplit('/')
        .next()
        .unwrap_or(raw)
        .to_string()
}

fn base_dir_of(doc_path: &Path) -> &Path {
    doc_path.parent().unwrap_or_else(|| Path::new("."))
}

//! Step Instance Execution
//!
//! Runs one bound step instance in its own directory:
//! - Tool inputs: defaults applied, values coerced to declared types
//! - Command line assembled from `baseCommand`, `arguments` and input bindings
//! - Process launched on the host or inside a container
//! - Cancellation polled while the process runs
//! - Declared outputs captured by glob from the instance directory
//!
//! Sub-workflow targets are handed to a nested [`Engine`] rooted in the
//! instance directory.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use globset::GlobBuilder;
use log::{debug, error, warn};
use walkdir::WalkDir;

use crate::environment::{select_runtime, ContainerSpec};
use crate::error::{Result, WorkflowError};
use crate::workflow::job::resolve_inputs;
use crate::workflow::model::{CommandLineTool, InputBinding, RunTarget, ToolOutput};
use crate::workflow::reference::{substitute, RefContext};
use crate::workflow::state::ExecutionRecord;
use crate::workflow::types::{CwlType, Value, ValueMap};

use super::engine::{Engine, EngineConfig};
use super::slots::ProcessSlots;

/// How often a running process is checked for exit or cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lines of standard error kept for diagnostics.
const DIAGNOSTIC_LINES: usize = 40;

/// Cores and memory assumed when a tool declares none.
const DEFAULT_CORES: u64 = 1;
const DEFAULT_RAM_MB: u64 = 1024;

/// Where and how one instance runs.
#[derive(Clone)]
pub struct InstanceContext {
    pub step_id: String,
    pub index: Option<usize>,
    /// Exclusively owned by this instance
    pub workdir: PathBuf,
    pub cancel: Arc<AtomicBool>,
    /// Shared with every engine of the run, nested ones included
    pub slots: Arc<ProcessSlots>,
    pub config: EngineConfig,
}

impl InstanceContext {
    /// `step` or `step[i]`.
    pub fn label(&self) -> String {
        match self.index {
            Some(i) => format!("{}[{}]", self.step_id, i),
            None => self.step_id.clone(),
        }
    }

    fn failure(&self, message: impl Into<String>, diagnostics: String) -> WorkflowError {
        WorkflowError::StepExecution {
            step: self.step_id.clone(),
            index: self.index,
            message: message.into(),
            diagnostics,
        }
    }

    fn cancelled(&self) -> WorkflowError {
        WorkflowError::Cancelled {
            step: self.step_id.clone(),
            index: self.index,
        }
    }
}

/// Result of one instance: its outputs plus records of any nested steps.
#[derive(Debug, Default)]
pub struct InstanceOutcome {
    pub outputs: ValueMap,
    pub nested: Vec<ExecutionRecord>,
}

/// Executes one instance of a step against its bound inputs.
///
/// # Returns
///
/// * `Ok(outcome)` - Process exited zero and every required output was found
/// * `Err` - Launch failure, non-zero exit, cancellation or output mismatch
pub fn execute_instance(
    run: &RunTarget,
    inputs: &ValueMap,
    ctx: &InstanceContext,
) -> Result<InstanceOutcome> {
    if ctx.cancel.load(Ordering::SeqCst) {
        return Err(ctx.cancelled());
    }
    prepare_workdir(&ctx.workdir)?;

    match run {
        RunTarget::InlineTool(tool) => Ok(InstanceOutcome {
            outputs: execute_tool(tool, inputs, ctx)?,
            nested: Vec::new(),
        }),
        RunTarget::ExternalSubworkflow(workflow) => {
            let provided: ValueMap = inputs
                .iter()
                .filter(|(name, _)| workflow.input(name).is_some())
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
            let resolved = resolve_inputs(workflow, provided, &ctx.workdir)?;

            let mut config = ctx.config.clone();
            config.working_dir = ctx.workdir.clone();
            let engine = Engine::nested(config, Arc::clone(&ctx.cancel), Arc::clone(&ctx.slots));
            let run = engine.execute(Arc::clone(workflow), resolved);

            let label = ctx.label();
            let nested = run
                .records
                .into_iter()
                .map(|r| r.nested_under(&label))
                .collect();
            match run.result {
                Ok(outputs) => Ok(InstanceOutcome { outputs, nested }),
                Err(e) => Err(ctx.failure(
                    format!("sub-workflow '{}' failed: {}", workflow.id, e),
                    e.diagnostics().to_string(),
                )),
            }
        }
    }
}

/// Clears and recreates an instance directory.
fn prepare_workdir(dir: &Path) -> Result<()> {
    if dir.exists() {
        debug!("Clearing existing instance directory {}", dir.display());
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    Ok(())
}

fn execute_tool(
    tool: &CommandLineTool,
    inputs: &ValueMap,
    ctx: &InstanceContext,
) -> Result<ValueMap> {
    let label = ctx.label();
    let bound = bind_tool_inputs(tool, inputs, &ctx.workdir)?;

    let cores = tool
        .resources
        .cores
        .map(|c| c.ceil().max(1.0) as u64)
        .unwrap_or(DEFAULT_CORES);
    let ram_mb = tool.resources.ram_mb.unwrap_or(DEFAULT_RAM_MB);
    let refs = RefContext {
        inputs: &bound,
        self_value: None,
        outdir: &ctx.workdir,
        cores,
        ram_mb,
    };

    let argv = build_command_line(tool, &bound, &refs)?;
    if argv.is_empty() {
        return Err(ctx.failure("tool has an empty command line", String::new()));
    }

    let env = tool
        .env
        .iter()
        .map(|(name, value)| Ok((name.clone(), substitute(value, &refs)?)))
        .collect::<Result<Vec<_>>>()?;
    let stdout_name = tool
        .stdout
        .as_deref()
        .map(|s| substitute(s, &refs))
        .transpose()?;

    let image = tool.docker_image.as_deref();
    let runtime = select_runtime(ctx.config.container_mode, &tool.id, image)
        .map_err(|e| match e {
            WorkflowError::StepExecution { message, .. } => ctx.failure(message, String::new()),
            other => other,
        })?;

    let mut command = match (&runtime, image) {
        (Some(runtime), Some(image)) => {
            let mut paths = Vec::new();
            for value in bound.values() {
                value.collect_paths(&mut paths);
            }
            let spec = ContainerSpec {
                image,
                workdir: &ctx.workdir,
                inputs: paths,
                env: &env,
                resources: tool.resources,
            };
            let mut command = Command::new(runtime);
            command.args(spec.run_args(&argv));
            debug!("{} runs in container {}", label, image);
            command
        }
        _ => {
            let mut command = Command::new(&argv[0]);
            command.args(&argv[1..]).envs(env.iter().map(|(k, v)| (k, v)));
            command
        }
    };
    command.current_dir(&ctx.workdir).stdin(Stdio::null()).stderr(Stdio::piped());

    match &stdout_name {
        Some(name) => {
            let file = File::create(ctx.workdir.join(name))?;
            command.stdout(Stdio::from(file));
        }
        None => {
            command.stdout(Stdio::piped());
        }
    }

    let Some(slot) = ctx.slots.acquire(&ctx.cancel) else {
        warn!("{} cancelled before launch", label);
        return Err(ctx.cancelled());
    };
    debug!("{}: {}", label, argv.join(" "));
    let mut child = command
        .spawn()
        .map_err(|e| ctx.failure(format!("failed to launch '{}': {}", argv[0], e), String::new()))?;

    let stdout_reader = child.stdout.take().map(|out| {
        let label = label.clone();
        thread::spawn(move || {
            for line in BufReader::new(out).lines().map_while(|l| l.ok()) {
                debug!("[{}] {}", label, line);
            }
        })
    });
    let stderr_reader = child.stderr.take().map(|err| thread::spawn(move || tail_lines(err)));

    // Readers are not joined after a kill: grandchildren may still hold the pipes.
    let waited = wait_or_cancel(&mut child, &ctx.cancel);
    drop(slot);
    let Some(status) = waited? else {
        warn!("{} cancelled", label);
        return Err(ctx.cancelled());
    };

    if let Some(handle) = stdout_reader {
        let _ = handle.join();
    }
    let diagnostics = stderr_reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();

    if !status.success() {
        let message = match status.code() {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        };
        error!("{} failed with {}", label, message);
        if !diagnostics.is_empty() {
            error!("stderr:\n{}", diagnostics);
        }
        return Err(ctx.failure(message, diagnostics));
    }

    let mut outputs = ValueMap::new();
    for output in &tool.outputs {
        let value = capture_output(output, stdout_name.as_deref(), &refs, ctx)?;
        outputs.insert(output.id.clone(), value);
    }
    debug!("{} completed with outputs {:?}", label, outputs.keys().collect::<Vec<_>>());
    Ok(outputs)
}

/// Waits for the child, killing it if `cancel` is raised.
///
/// Returns `None` when the process was cancelled.
fn wait_or_cancel(child: &mut Child, cancel: &AtomicBool) -> Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if cancel.load(Ordering::SeqCst) {
            if let Err(e) = child.kill() {
                warn!("Failed to kill process {}: {}", child.id(), e);
            }
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Reads a stream to the end, keeping its last lines.
fn tail_lines(stream: impl Read) -> String {
    let mut tail: Vec<String> = Vec::new();
    for line in BufReader::new(stream).lines().map_while(|l| l.ok()) {
        if tail.len() == DIAGNOSTIC_LINES {
            tail.remove(0);
        }
        tail.push(line);
    }
    tail.join("\n")
}

/// Resolves every tool input: bound value, else tool default, coerced.
fn bind_tool_inputs(
    tool: &CommandLineTool,
    inputs: &ValueMap,
    base_dir: &Path,
) -> Result<ValueMap> {
    let mut bound = ValueMap::new();
    for input in &tool.inputs {
        let value = match inputs.get(&input.id) {
            Some(v) if !v.is_null() => v.clone(),
            _ => input.default.clone().unwrap_or(Value::Null),
        };
        let value = value.coerce(&input.id, &input.ty, base_dir)?;
        bound.insert(input.id.clone(), value);
    }
    Ok(bound)
}

/// Builds the argument vector for one tool invocation.
///
/// Bindings sort by position, then arguments before inputs, then
/// declaration order.
pub fn build_command_line(
    tool: &CommandLineTool,
    bound: &ValueMap,
    refs: &RefContext<'_>,
) -> Result<Vec<String>> {
    let mut groups: Vec<((i64, u8, usize), Vec<String>)> = Vec::new();

    for (order, argument) in tool.arguments.iter().enumerate() {
        let value = match &argument.value_from {
            Some(template) => Value::String(substitute(template, refs)?),
            None => Value::Null,
        };
        let tokens = match (&value, &argument.prefix) {
            (Value::Null, Some(prefix)) => vec![prefix.clone()],
            _ => binding_tokens(argument, &value),
        };
        groups.push(((argument.position, 0, order), tokens));
    }

    for (order, input) in tool.inputs.iter().enumerate() {
        let Some(binding) = &input.binding else {
            continue;
        };
        let value = bound.get(&input.id).cloned().unwrap_or(Value::Null);
        let value = match (&binding.value_from, &value) {
            (Some(_), Value::Null) => Value::Null,
            (Some(template), current) => {
                let scoped = RefContext {
                    self_value: Some(current),
                    ..*refs
                };
                Value::String(substitute(template, &scoped)?)
            }
            (None, _) => value,
        };
        groups.push(((binding.position, 1, order), binding_tokens(binding, &value)));
    }

    groups.sort_by_key(|(key, _)| *key);

    let mut argv = tool.base_command.clone();
    argv.extend(groups.into_iter().flat_map(|(_, tokens)| tokens));
    Ok(argv)
}

/// Renders one bound value as command-line tokens.
fn binding_tokens(binding: &InputBinding, value: &Value) -> Vec<String> {
    let with_prefix = |token: String| -> Vec<String> {
        match &binding.prefix {
            Some(prefix) if binding.separate => vec![prefix.clone(), token],
            Some(prefix) => vec![format!("{}{}", prefix, token)],
            None => vec![token],
        }
    };

    match value {
        Value::Null | Value::Bool(false) => Vec::new(),
        Value::Bool(true) => binding.prefix.iter().cloned().collect(),
        Value::Array(items) if items.is_empty() => Vec::new(),
        Value::Array(items) => {
            let tokens: Vec<String> = items.iter().filter_map(Value::to_token).collect();
            match &binding.item_separator {
                Some(sep) => with_prefix(tokens.join(sep)),
                None => {
                    let mut out: Vec<String> = binding.prefix.iter().cloned().collect();
                    out.extend(tokens);
                    out
                }
            }
        }
        scalar => scalar.to_token().map(with_prefix).unwrap_or_default(),
    }
}

/// Captures one declared output from the instance directory.
fn capture_output(
    output: &ToolOutput,
    stdout_name: Option<&str>,
    refs: &RefContext<'_>,
    ctx: &InstanceContext,
) -> Result<Value> {
    if output.ty.required() == &CwlType::Stdout {
        return match stdout_name {
            Some(name) => Ok(Value::File(ctx.workdir.join(name))),
            None => Err(ctx.failure(
                format!("output '{}' expects stdout but none was captured", output.id),
                String::new(),
            )),
        };
    }

    let Some(raw) = &output.glob else {
        return Ok(Value::Null);
    };
    let pattern = substitute(raw, refs)?;
    let matches = capture_glob(&ctx.workdir, &pattern)?;

    let as_directory = matches!(
        output.ty.item_type().unwrap_or(output.ty.required()),
        CwlType::Directory
    );
    let to_value = |path: PathBuf| {
        if as_directory || path.is_dir() {
            Value::Directory(path)
        } else {
            Value::File(path)
        }
    };

    if output.ty.is_array() {
        return Ok(Value::Array(matches.into_iter().map(to_value).collect()));
    }

    match matches.len() {
        0 if output.ty.is_optional() => Ok(Value::Null),
        0 => Err(WorkflowError::OutputNotFound {
            step: ctx.step_id.clone(),
            index: ctx.index,
            output: output.id.clone(),
            pattern,
        }),
        1 => Ok(matches.into_iter().next().map(to_value).unwrap_or(Value::Null)),
        count => Err(WorkflowError::AmbiguousOutput {
            step: ctx.step_id.clone(),
            index: ctx.index,
            output: output.id.clone(),
            pattern,
            count,
        }),
    }
}

/// Paths under `dir` matching `pattern`, sorted.
///
/// `.` matches `dir` itself. `*` does not cross `/`.
pub fn capture_glob(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let dir_prefix = format!("{}/", dir.display());
    let relative = pattern.strip_prefix(&dir_prefix).unwrap_or(pattern);
    let relative = relative.strip_prefix("./").unwrap_or(relative);

    if relative == "." || relative.is_empty() || Path::new(relative) == dir {
        return Ok(vec![dir.to_path_buf()]);
    }

    let matcher = GlobBuilder::new(relative)
        .literal_separator(true)
        .build()
        .map_err(|e| WorkflowError::malformed(format!("invalid glob '{}': {}", pattern, e)))?
        .compile_matcher();

    let mut found: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .path()
                .strip_prefix(dir)
                .map(|rel| matcher.is_match(rel))
                .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect();
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::ToolInput;
    use tempfile::tempdir;

    fn refs<'a>(bound: &'a ValueMap, outdir: &'a Path) -> RefContext<'a> {
        RefContext {
            inputs: bound,
            self_value: None,
            outdir,
            cores: 1,
            ram_mb: 1024,
        }
    }

    fn context(dir: &Path) -> InstanceContext {
        InstanceContext {
            step_id: "node_crop".to_string(),
            index: Some(0),
            workdir: dir.to_path_buf(),
            cancel: Arc::new(AtomicBool::new(false)),
            slots: Arc::new(ProcessSlots::new(1)),
            config: EngineConfig::default(),
        }
    }

    #[test]
    fn test_command_line_ordering_and_prefixes() {
        let argv = vec!["python".into(), "-m".into(), "app".into()];
        let mut tool = CommandLineTool::new("crop", argv)
            .with_input("item", CwlType::String, Some("--input-item"))
            .with_input("band", CwlType::String, Some("--band"));
        tool.arguments.push(InputBinding {
            position: 1,
            value_from: Some("--verbose".to_string()),
            ..InputBinding::default()
        });

        let mut bound = ValueMap::new();
        bound.insert("item".into(), Value::String("S2B".into()));
        bound.insert("band".into(), Value::String("nir".into()));

        let argv = build_command_line(&tool, &bound, &refs(&bound, Path::new("/w"))).unwrap();
        // positions: item=0, argument=1, band=1 (argument wins the tie)
        assert_eq!(
            argv,
            vec!["python", "-m", "app", "--input-item", "S2B", "--verbose", "--band", "nir"]
        );
    }

    #[test]
    fn test_binding_tokens_shapes() {
        let prefixed = InputBinding {
            prefix: Some("--raster".to_string()),
            ..InputBinding::default()
        };
        let files = Value::Array(vec![
            Value::File(PathBuf::from("/a.tif")),
            Value::File(PathBuf::from("/b.tif")),
        ]);
        assert_eq!(binding_tokens(&prefixed, &files), vec!["--raster", "/a.tif", "/b.tif"]);
        assert_eq!(binding_tokens(&prefixed, &Value::Bool(true)), vec!["--raster"]);
        assert!(binding_tokens(&prefixed, &Value::Bool(false)).is_empty());
        assert!(binding_tokens(&prefixed, &Value::Null).is_empty());

        let joined = InputBinding {
            prefix: Some("--bands=".to_string()),
            separate: false,
            item_separator: Some(",".to_string()),
            ..InputBinding::default()
        };
        let bands = Value::Array(vec![Value::String("green".into()), Value::String("nir".into())]);
        assert_eq!(binding_tokens(&joined, &bands), vec!["--bands=green,nir"]);
    }

    #[test]
    fn test_value_from_sees_self() {
        let mut tool = CommandLineTool::new("t", vec!["t".into()]);
        tool.inputs.push(ToolInput {
            id: "raster".into(),
            ty: CwlType::File,
            default: None,
            binding: Some(InputBinding {
                prefix: Some("--name".into()),
                value_from: Some("$(self.nameroot)".into()),
                ..InputBinding::default()
            }),
        });
        let mut bound = ValueMap::new();
        bound.insert("raster".into(), Value::File(PathBuf::from("/x/ndwi.tif")));
        let argv = build_command_line(&tool, &bound, &refs(&bound, Path::new("/w"))).unwrap();
        assert_eq!(argv, vec!["t", "--name", "ndwi"]);
    }

    #[test]
    fn test_capture_glob_does_not_cross_directories() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.tif"), "").unwrap();
        fs::write(dir.path().join("a.tif"), "").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("c.tif"), "").unwrap();

        let found = capture_glob(dir.path(), "*.tif").unwrap();
        assert_eq!(found, vec![dir.path().join("a.tif"), dir.path().join("b.tif")]);

        let nested = capture_glob(dir.path(), "**/*.tif").unwrap();
        assert_eq!(nested.len(), 3);

        assert_eq!(capture_glob(dir.path(), ".").unwrap(), vec![dir.path().to_path_buf()]);
    }

    #[test]
    fn test_capture_output_cardinality() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.tif"), "").unwrap();
        fs::write(dir.path().join("b.tif"), "").unwrap();
        let ctx = context(dir.path());
        let bound = ValueMap::new();
        let r = refs(&bound, dir.path());

        let single = ToolOutput {
            id: "mask".into(),
            ty: CwlType::File,
            glob: Some("*.tif".into()),
        };
        let err = capture_output(&single, None, &r, &ctx).unwrap_err();
        assert!(matches!(err, WorkflowError::AmbiguousOutput { count: 2, .. }));

        let missing = ToolOutput {
            id: "mask".into(),
            ty: CwlType::File,
            glob: Some("*.png".into()),
        };
        let err = capture_output(&missing, None, &r, &ctx).unwrap_err();
        assert!(matches!(err, WorkflowError::OutputNotFound { .. }));
        assert!(err.to_string().contains("node_crop[0]"));

        let optional = ToolOutput {
            id: "mask".into(),
            ty: CwlType::Optional(Box::new(CwlType::File)),
            glob: Some("*.png".into()),
        };
        assert_eq!(capture_output(&optional, None, &r, &ctx).unwrap(), Value::Null);

        let many = ToolOutput {
            id: "all".into(),
            ty: CwlType::Array(Box::new(CwlType::File)),
            glob: Some("*.tif".into()),
        };
        assert_eq!(
            capture_output(&many, None, &r, &ctx).unwrap().as_array().map(|a| a.len()),
            Some(2)
        );

        let catalog = ToolOutput {
            id: "catalog".into(),
            ty: CwlType::Directory,
            glob: Some(".".into()),
        };
        assert_eq!(
            capture_output(&catalog, None, &r, &ctx).unwrap(),
            Value::Directory(dir.path().to_path_buf())
        );
    }

    #[test]
    fn test_execute_tool_with_stdout_and_failure() {
        let dir = tempdir().unwrap();
        let workdir = dir.path().join("node_echo");

        let mut tool = CommandLineTool::new("echo", vec!["sh".into(), "-c".into()])
            .with_input("script", CwlType::String, None);
        tool.stdout = Some("out.txt".into());
        tool.outputs.push(ToolOutput { id: "log".into(), ty: CwlType::Stdout, glob: None });
        let run = RunTarget::InlineTool(Arc::new(tool));

        let mut inputs = ValueMap::new();
        inputs.insert("script".into(), Value::String("echo hello".into()));
        let mut ctx = context(&workdir);
        ctx.index = None;

        let outcome = execute_instance(&run, &inputs, &ctx).unwrap();
        let log = outcome.outputs["log"].path().unwrap().to_path_buf();
        assert_eq!(fs::read_to_string(log).unwrap().trim(), "hello");

        inputs.insert("script".into(), Value::String("echo boom >&2; exit 3".into()));
        let err = execute_instance(&run, &inputs, &ctx).unwrap_err();
        assert!(err.to_string().contains("exit code 3"));
        assert_eq!(err.diagnostics(), "boom");
    }

    #[test]
    fn test_cancelled_before_start() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path());
        ctx.cancel.store(true, Ordering::SeqCst);
        let run = RunTarget::InlineTool(Arc::new(CommandLineTool::new("t", vec!["true".into()])));
        let err = execute_instance(&run, &ValueMap::new(), &ctx).unwrap_err();
        assert!(matches!(err, WorkflowError::Cancelled { .. }));
    }

    #[test]
    fn test_cancel_kills_running_process() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir.path().join("slow"));
        let run = RunTarget::InlineTool(Arc::new(CommandLineTool::new(
            "slow",
            vec!["sleep".into(), "30".into()],
        )));

        let flag = Arc::clone(&ctx.cancel);
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            flag.store(true, Ordering::SeqCst);
        });
        let started = std::time::Instant::now();
        let err = execute_instance(&run, &ValueMap::new(), &ctx).unwrap_err();
        canceller.join().unwrap();

        assert!(matches!(err, WorkflowError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}

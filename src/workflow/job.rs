//! Job Inputs
//!
//! Builds the workflow input object from a CWL job file and/or repeated
//! `--input NAME=VALUE` assignments, then checks it against the declared
//! inputs: defaults fill gaps, values are coerced to their declared types,
//! and anything missing or undeclared is rejected.

use std::fs;
use std::path::Path;

use log::{debug, info};
use serde_yaml::Value as Yaml;

use crate::error::{Result, WorkflowError};

use super::model::WorkflowDefinition;
use super::types::{CwlType, Value, ValueMap};

/// Splits a `NAME=VALUE` assignment.
pub fn parse_assignment(raw: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(WorkflowError::invalid_input(
            raw,
            "expected NAME=VALUE",
        )),
    }
}

/// Reads a YAML/JSON job file. Relative paths resolve against its directory.
pub fn load_job_file(path: impl AsRef<Path>) -> Result<ValueMap> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

    let root: Yaml = serde_yaml::from_str(&content)?;
    let mut values = ValueMap::new();
    match root {
        Yaml::Null => {}
        Yaml::Mapping(map) => {
            for (key, raw) in &map {
                let name = key.as_str().ok_or_else(|| {
                    WorkflowError::invalid_input(format!("{:?}", key), "job keys must be strings")
                })?;
                values.insert(name.to_string(), Value::from_yaml(raw, base_dir)?);
            }
        }
        _ => {
            return Err(WorkflowError::invalid_input(
                path.display().to_string(),
                "job file must be a mapping of input names to values",
            ))
        }
    }

    info!("Loaded {} inputs from {}", values.len(), path.display());
    Ok(values)
}

/// Applies command-line assignments on top of `values`.
///
/// Array inputs accumulate one item per assignment; a repeated scalar is an
/// error. Each raw string is parsed by the declared (item) type.
pub fn apply_assignments(
    workflow: &WorkflowDefinition,
    values: &mut ValueMap,
    assignments: &[(String, String)],
    base_dir: &Path,
) -> Result<()> {
    let mut from_cli: ValueMap = ValueMap::new();

    for (name, raw) in assignments {
        let param = workflow.input(name).ok_or_else(|| {
            let message = format!("not an input of workflow '{}'", workflow.id);
            WorkflowError::invalid_input(name, message)
        })?;

        if let Some(item_ty) = param.ty.item_type() {
            let item = Value::parse_scalar(name, raw, item_ty, base_dir)?;
            let collected = from_cli
                .entry(name.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(items) = collected {
                items.push(item);
            }
        } else {
            if from_cli.contains_key(name) {
                return Err(WorkflowError::invalid_input(
                    name,
                    format!("given more than once but has type {}", param.ty),
                ));
            }
            let value = match param.ty.required() {
                CwlType::Any => Value::String(raw.clone()),
                ty => Value::parse_scalar(name, raw, ty, base_dir)?,
            };
            from_cli.insert(name.clone(), value);
        }
    }

    debug!("Command-line inputs: {:?}", from_cli.keys().collect::<Vec<_>>());
    values.extend(from_cli);
    Ok(())
}

/// Checks provided values against the workflow's declared inputs.
///
/// Returns one value per declared input: the provided value, else the
/// default, else `null` when the type allows it.
pub fn resolve_inputs(
    workflow: &WorkflowDefinition,
    provided: ValueMap,
    base_dir: &Path,
) -> Result<ValueMap> {
    if let Some(unknown) = provided.keys().find(|k| workflow.input(k).is_none()) {
        return Err(WorkflowError::invalid_input(
            unknown,
            format!("not an input of workflow '{}'", workflow.id),
        ));
    }

    let mut resolved = ValueMap::new();
    let mut provided = provided;
    for param in &workflow.inputs {
        let value = match provided.remove(&param.id) {
            Some(v) if !v.is_null() => v,
            _ => param.default.clone().unwrap_or(Value::Null),
        };
        let value = value.coerce(&param.id, &param.ty, base_dir)?;
        resolved.insert(param.id.clone(), value);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::InputParam;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn workflow() -> WorkflowDefinition {
        let mut wf = WorkflowDefinition::new("water_bodies");
        wf.inputs.push(InputParam::new("item", CwlType::String));
        wf.inputs.push(InputParam::new(
            "bands",
            CwlType::Array(Box::new(CwlType::String)),
        ));
        let mut epsg = InputParam::new("epsg", CwlType::String);
        epsg.default = Some(Value::String("EPSG:4326".to_string()));
        wf.inputs.push(epsg);
        wf.inputs.push(InputParam::new(
            "scene",
            CwlType::Optional(Box::new(CwlType::File)),
        ));
        wf
    }

    #[test]
    fn test_parse_assignment() {
        assert_eq!(
            parse_assignment("aoi=-121.4,37.8,-120.9,38.1").unwrap(),
            ("aoi".to_string(), "-121.4,37.8,-120.9,38.1".to_string())
        );
        assert!(parse_assignment("novalue").is_err());
        assert!(parse_assignment("=x").is_err());
    }

    #[test]
    fn test_repeated_array_input_accumulates() {
        let wf = workflow();
        let mut values = ValueMap::new();
        let assignments = vec![
            ("bands".to_string(), "green".to_string()),
            ("bands".to_string(), "nir".to_string()),
            ("item".to_string(), "S2B".to_string()),
        ];
        apply_assignments(&wf, &mut values, &assignments, Path::new("/")).unwrap();
        assert_eq!(
            values["bands"],
            Value::Array(vec![
                Value::String("green".into()),
                Value::String("nir".into())
            ])
        );
    }

    #[test]
    fn test_repeated_scalar_rejected() {
        let wf = workflow();
        let mut values = ValueMap::new();
        let assignments = vec![
            ("item".to_string(), "a".to_string()),
            ("item".to_string(), "b".to_string()),
        ];
        let err = apply_assignments(&wf, &mut values, &assignments, Path::new("/")).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_resolve_applies_defaults_and_optionals() {
        let wf = workflow();
        let mut provided = ValueMap::new();
        provided.insert("item".to_string(), Value::String("S2B".into()));
        provided.insert("bands".to_string(), Value::Array(vec![]));

        let resolved = resolve_inputs(&wf, provided, Path::new("/")).unwrap();
        assert_eq!(resolved["epsg"], Value::String("EPSG:4326".into()));
        assert_eq!(resolved["scene"], Value::Null);
    }

    #[test]
    fn test_resolve_rejects_missing_and_unknown() {
        let wf = workflow();
        let err = resolve_inputs(&wf, ValueMap::new(), Path::new("/")).unwrap_err();
        assert!(err.to_string().contains("item"));

        let mut provided = ValueMap::new();
        provided.insert("colour".to_string(), Value::Bool(true));
        let err = resolve_inputs(&wf, provided, Path::new("/")).unwrap_err();
        assert!(err.to_string().contains("colour"));
    }

    #[test]
    fn test_job_file_with_file_literal() {
        let dir = tempdir().unwrap();
        let job = dir.path().join("job.yaml");
        fs::write(
            &job,
            "item: S2B\nbands: [green, nir]\nscene: {class: File, path: scene.tif}\n",
        )
        .unwrap();

        let values = load_job_file(&job).unwrap();
        assert_eq!(values["scene"], Value::File(dir.path().join("scene.tif")));

        let resolved = resolve_inputs(&workflow(), values, dir.path()).unwrap();
        assert_eq!(resolved.len(), 4);
        assert_ne!(resolved["scene"], Value::File(PathBuf::from("scene.tif")));
    }
}

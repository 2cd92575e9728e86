//! Execution Records and Run Report
//!
//! One [`ExecutionRecord`] per step instance: the inputs it was dispatched
//! with, what it produced, and how it ended. After every run the records
//! and the final outputs are written to `<workdir>/run-report.json`.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkflowError};

use super::types::{map_to_json, ValueMap};

/// File name of the report inside the working directory.
pub const REPORT_FILE: &str = "run-report.json";

/// Lifecycle of one step instance.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// What happened to one step instance.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ExecutionRecord {
    /// Step id; instances of nested workflows are prefixed with their parent
    pub step_id: String,
    pub scatter_index: Option<usize>,
    pub status: InstanceStatus,
    /// Input values bound at dispatch time
    pub inputs: serde_json::Value,
    /// Captured outputs; `null` unless succeeded
    pub outputs: serde_json::Value,
    pub error: Option<String>,
    /// Tail of the process's standard error, when it failed
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub diagnostics: String,
    pub workdir: PathBuf,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    /// Creates a pending record for an instance about to be dispatched.
    pub fn pending(
        step_id: &str,
        scatter_index: Option<usize>,
        inputs: &ValueMap,
        workdir: &Path,
    ) -> Self {
        Self {
            step_id: step_id.to_string(),
            scatter_index,
            status: InstanceStatus::Pending,
            inputs: map_to_json(inputs),
            outputs: serde_json::Value::Null,
            error: None,
            diagnostics: String::new(),
            workdir: workdir.to_path_buf(),
            started_at: None,
            finished_at: None,
        }
    }

    /// `step` or `step[i]`.
    pub fn label(&self) -> String {
        match self.scatter_index {
            Some(i) => format!("{}[{}]", self.step_id, i),
            None => self.step_id.clone(),
        }
    }

    pub fn mark_running(&mut self) {
        self.status = InstanceStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_succeeded(&mut self, outputs: &ValueMap) {
        self.status = InstanceStatus::Succeeded;
        self.outputs = map_to_json(outputs);
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: &WorkflowError) {
        self.status = InstanceStatus::Failed;
        self.error = Some(error.to_string());
        self.diagnostics = error.diagnostics().to_string();
        self.finished_at = Some(Utc::now());
    }

    /// Prefixes the step id with the label of an enclosing instance.
    pub fn nested_under(mut self, parent: &str) -> Self {
        self.step_id = format!("{}/{}", parent, self.step_id);
        self
    }
}

/// Persisted summary of a whole run.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RunReport {
    pub workflow: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub records: Vec<ExecutionRecord>,
    pub outputs: serde_json::Value,
    pub failures: Vec<String>,
}

impl RunReport {
    pub fn new(workflow: &str) -> Self {
        Self {
            workflow: workflow.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            success: false,
            records: Vec::new(),
            outputs: serde_json::Value::Null,
            failures: Vec::new(),
        }
    }

    /// Writes the report into `dir`, returning the file path.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(REPORT_FILE);
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json)?;

        info!("Saved run report to {}", path.display());
        Ok(path)
    }

    /// Loads a report written by [`RunReport::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::Value;
    use tempfile::tempdir;

    fn inputs() -> ValueMap {
        let mut m = ValueMap::new();
        m.insert("band".to_string(), Value::String("nir".to_string()));
        m
    }

    #[test]
    fn test_record_lifecycle() {
        let workdir = Path::new("/w/node_crop/1");
        let mut record = ExecutionRecord::pending("node_crop", Some(1), &inputs(), workdir);
        assert_eq!(record.status, InstanceStatus::Pending);
        assert_eq!(record.label(), "node_crop[1]");
        assert_eq!(record.inputs["band"], "nir");

        record.mark_running();
        assert!(record.started_at.is_some());

        let mut outputs = ValueMap::new();
        outputs.insert("cropped".to_string(), Value::File(PathBuf::from("/w/node_crop/1/nir.tif")));
        record.mark_succeeded(&outputs);
        assert_eq!(record.status, InstanceStatus::Succeeded);
        assert_eq!(record.outputs["cropped"]["basename"], "nir.tif");
    }

    #[test]
    fn test_record_failure_keeps_diagnostics() {
        let mut record =
            ExecutionRecord::pending("node_otsu", None, &ValueMap::new(), Path::new("/w"));
        record.mark_failed(&WorkflowError::StepExecution {
            step: "node_otsu".to_string(),
            index: None,
            message: "exit code 1".to_string(),
            diagnostics: "ValueError: empty raster".to_string(),
        });
        assert_eq!(record.status, InstanceStatus::Failed);
        assert!(record.error.as_deref().unwrap_or("").contains("exit code 1"));
        assert_eq!(record.diagnostics, "ValueError: empty raster");
        assert_eq!(record.label(), "node_otsu");
    }

    #[test]
    fn test_nested_label() {
        let record =
            ExecutionRecord::pending("node_crop", Some(0), &ValueMap::new(), Path::new("/w"))
                .nested_under("node_water_bodies[2]");
        assert_eq!(record.label(), "node_water_bodies[2]/node_crop[0]");
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&InstanceStatus::Succeeded).unwrap();
        assert_eq!(json, "\"succeeded\"");
    }

    #[test]
    fn test_report_save_and_load() {
        let dir = tempdir().unwrap();
        let mut report = RunReport::new("detect_water_body");
        report
            .records
            .push(ExecutionRecord::pending("node_crop", Some(0), &inputs(), dir.path()));
        report.failures.push("node_crop[0] failed".to_string());

        let path = report.save(dir.path()).unwrap();
        assert_eq!(path, dir.path().join(REPORT_FILE));

        let loaded = RunReport::load(&path).unwrap();
        assert_eq!(loaded.workflow, "detect_water_body");
        assert_eq!(loaded.records.len(), 1);
        assert_eq!(loaded.records[0].status, InstanceStatus::Pending);
        assert!(!loaded.success);
    }

    #[test]
    fn test_report_load_nonexistent() {
        assert!(RunReport::load(Path::new("/nonexistent/run-report.json")).is_err());
    }
}

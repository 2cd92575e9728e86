//! Container Runtime Integration
//!
//! Tools declaring a `DockerRequirement` run inside a container. The
//! runtime binary is resolved once per process:
//!
//! 1. `CWLRUNNER_CONTAINER_RUNTIME` (a path or a binary name)
//! 2. `docker` on the system PATH
//! 3. `podman` on the system PATH
//!
//! Input files and the instance directory are bind-mounted at their host
//! paths, so bound values and `$(runtime.outdir)` need no rewriting.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, info, warn};
use once_cell::sync::Lazy;

use crate::error::{Result, WorkflowError};
use crate::workflow::model::ResourceLimits;

/// Environment variable overriding runtime discovery.
pub const RUNTIME_ENV_VAR: &str = "CWLRUNNER_CONTAINER_RUNTIME";

/// Lazily-resolved container runtime binary, if any.
pub static CONTAINER_RUNTIME: Lazy<Option<PathBuf>> = Lazy::new(|| {
    if let Ok(configured) = std::env::var(RUNTIME_ENV_VAR) {
        let configured = configured.trim();
        if !configured.is_empty() {
            let path = Path::new(configured);
            if path.is_absolute() {
                info!("Using configured container runtime: {}", path.display());
                return Some(path.to_path_buf());
            }
            if let Some(found) = which(configured) {
                info!("Using configured container runtime: {}", found.display());
                return Some(found);
            }
            warn!("{}={} not found on PATH", RUNTIME_ENV_VAR, configured);
        }
    }

    for candidate in ["docker", "podman"] {
        if let Some(found) = which(candidate) {
            info!("Using container runtime: {}", found.display());
            return Some(found);
        }
    }

    warn!("No container runtime found; containerized tools will run locally in auto mode");
    None
});

fn which(binary: &str) -> Option<PathBuf> {
    let output = Command::new("which").arg(binary).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!path.is_empty()).then(|| PathBuf::from(path))
}

/// When to run tools inside a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContainerMode {
    /// Containerize tools with an image when a runtime is available
    #[default]
    Auto,
    /// Containerize every tool with an image; a missing runtime is an error
    Always,
    /// Run every tool on the host
    Never,
}

impl ContainerMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "auto" => Some(ContainerMode::Auto),
            "always" => Some(ContainerMode::Always),
            "never" => Some(ContainerMode::Never),
            _ => None,
        }
    }
}

/// Decides whether a tool runs in a container, returning the runtime to use.
pub fn select_runtime(
    mode: ContainerMode,
    tool_id: &str,
    image: Option<&str>,
) -> Result<Option<PathBuf>> {
    let Some(image) = image else {
        return Ok(None);
    };
    match (mode, CONTAINER_RUNTIME.as_ref()) {
        (ContainerMode::Never, _) => Ok(None),
        (_, Some(runtime)) => Ok(Some(runtime.clone())),
        (ContainerMode::Auto, None) => {
            debug!("Tool '{}' wants image {} but runs locally", tool_id, image);
            Ok(None)
        }
        (ContainerMode::Always, None) => Err(WorkflowError::StepExecution {
            step: tool_id.to_string(),
            index: None,
            message: format!(
                "image {} requires a container runtime but none was found (set {})",
                image, RUNTIME_ENV_VAR
            ),
            diagnostics: String::new(),
        }),
    }
}

/// Everything needed to wrap one tool invocation in `<runtime> run`.
#[derive(Debug, Clone)]
pub struct ContainerSpec<'a> {
    pub image: &'a str,
    /// Instance directory; mounted read-write and used as the working directory
    pub workdir: &'a Path,
    /// Host paths of bound inputs, mounted read-only
    pub inputs: Vec<&'a Path>,
    pub env: &'a [(String, String)],
    pub resources: ResourceLimits,
}

impl ContainerSpec<'_> {
    /// Arguments for the runtime binary, ending with the tool's own argv.
    pub fn run_args(&self, argv: &[String]) -> Vec<String> {
        let workdir = self.workdir.display().to_string();
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--workdir".to_string(),
            workdir.clone(),
            "--volume".to_string(),
            format!("{}:{}:rw", workdir, workdir),
        ];

        let mounts: BTreeSet<&Path> = self
            .inputs
            .iter()
            .copied()
            .filter(|p| !p.starts_with(self.workdir))
            .collect();
        for path in mounts {
            let host = path.display();
            args.push("--volume".to_string());
            args.push(format!("{}:{}:ro", host, host));
        }

        args.push("--env".to_string());
        args.push(format!("HOME={}", workdir));
        for (name, value) in self.env {
            args.push("--env".to_string());
            args.push(format!("{}={}", name, value));
        }

        if let Some(cores) = self.resources.cores {
            args.push("--cpus".to_string());
            args.push(cores.to_string());
        }
        if let Some(ram) = self.resources.ram_mb {
            args.push("--memory".to_string());
            args.push(format!("{}m", ram));
        }

        args.push(self.image.to_string());
        args.extend(argv.iter().cloned());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!(ContainerMode::parse("auto"), Some(ContainerMode::Auto));
        assert_eq!(ContainerMode::parse("never"), Some(ContainerMode::Never));
        assert_eq!(ContainerMode::parse("sometimes"), None);
        assert_eq!(ContainerMode::default(), ContainerMode::Auto);
    }

    #[test]
    fn test_no_image_runs_locally() {
        assert!(select_runtime(ContainerMode::Always, "crop", None)
            .unwrap()
            .is_none());
        assert!(select_runtime(ContainerMode::Never, "crop", Some("img"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_run_args() {
        let env = vec![("GDAL_CACHEMAX".to_string(), "256".to_string())];
        let spec = ContainerSpec {
            image: "ghcr.io/eoap/otsu@sha256:abc",
            workdir: Path::new("/work/node_otsu"),
            inputs: vec![
                Path::new("/work/node_nd/ndwi.tif"),
                Path::new("/work/node_otsu/local.tif"),
                Path::new("/work/node_nd/ndwi.tif"),
            ],
            env: &env,
            resources: ResourceLimits {
                cores: Some(2.0),
                ram_mb: Some(1024),
            },
        };
        let args = spec.run_args(&["otsu".to_string(), "/work/node_nd/ndwi.tif".to_string()]);

        assert_eq!(&args[..4], &["run", "--rm", "--workdir", "/work/node_otsu"]);
        assert!(args.contains(&"/work/node_otsu:/work/node_otsu:rw".to_string()));
        assert_eq!(
            args.iter().filter(|a| a.ends_with(":ro")).count(),
            1,
            "inputs are deduplicated and the instance dir is not remounted"
        );
        assert!(args.contains(&"GDAL_CACHEMAX=256".to_string()));
        assert!(args.contains(&"1024m".to_string()));

        let image_at = args.iter().position(|a| a == spec.image).unwrap();
        assert_eq!(&args[image_at + 1..], &["otsu", "/work/node_nd/ndwi.tif"]);
    }
}

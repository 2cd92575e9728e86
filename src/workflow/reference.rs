//! Parameter References
//!
//! Plain `$(...)` references in tool `valueFrom`, `glob` and environment
//! definitions. Only attribute lookups are understood:
//!
//! - `$(inputs.NAME)` with optional `.path`, `.basename`, `.nameroot`, `.nameext`
//! - `$(self)` with the same optional attributes
//! - `$(runtime.outdir)`, `$(runtime.cores)`, `$(runtime.ram)`
//!
//! JavaScript blocks (`${ ... }`) and anything else are rejected at load time.

use std::path::Path;

use crate::error::{Result, WorkflowError};

use super::types::{Value, ValueMap};

/// Attribute read from a File/Directory value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathField {
    Path,
    Basename,
    Nameroot,
    Nameext,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamRef {
    Input { name: String, field: Option<PathField> },
    SelfValue { field: Option<PathField> },
    RuntimeOutdir,
    RuntimeCores,
    RuntimeRam,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Ref(ParamRef),
}

/// Values a reference can resolve against.
pub struct RefContext<'a> {
    pub inputs: &'a ValueMap,
    pub self_value: Option<&'a Value>,
    pub outdir: &'a Path,
    pub cores: u64,
    pub ram_mb: u64,
}

/// True if `text` contains anything needing substitution.
pub fn has_references(text: &str) -> bool {
    text.contains("$(") || text.contains("${")
}

/// Splits a template into literal text and references.
pub fn parse_template(text: &str) -> Result<Vec<Segment>> {
    if text.contains("${") {
        return Err(WorkflowError::malformed(format!(
            "JavaScript expressions are not supported: '{}'",
            text
        )));
    }

    let mut segments = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("$(") {
        if start > 0 {
            segments.push(Segment::Literal(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        let end = after.find(')').ok_or_else(|| {
            WorkflowError::malformed(format!("unterminated parameter reference in '{}'", text))
        })?;
        segments.push(Segment::Ref(parse_ref(&after[..end], text)?));
        rest = &after[end + 1..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest.to_string()));
    }
    Ok(segments)
}

fn parse_ref(expr: &str, text: &str) -> Result<ParamRef> {
    let unsupported = || {
        WorkflowError::malformed(format!(
            "unsupported parameter reference '$({})' in '{}'",
            expr, text
        ))
    };
    let parts: Vec<&str> = expr.trim().split('.').collect();
    let field = |part: Option<&&str>| -> Result<Option<PathField>> {
        match part.copied() {
            None => Ok(None),
            Some("path") => Ok(Some(PathField::Path)),
            Some("basename") => Ok(Some(PathField::Basename)),
            Some("nameroot") => Ok(Some(PathField::Nameroot)),
            Some("nameext") => Ok(Some(PathField::Nameext)),
            Some(_) => Err(unsupported()),
        }
    };

    match parts.as_slice() {
        ["inputs", name] | ["inputs", name, _] if is_identifier(name) => Ok(ParamRef::Input {
            name: name.to_string(),
            field: field(parts.get(2))?,
        }),
        ["self"] | ["self", _] => Ok(ParamRef::SelfValue {
            field: field(parts.get(1))?,
        }),
        ["runtime", "outdir"] => Ok(ParamRef::RuntimeOutdir),
        ["runtime", "cores"] => Ok(ParamRef::RuntimeCores),
        ["runtime", "ram"] => Ok(ParamRef::RuntimeRam),
        _ => Err(unsupported()),
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Checks a template at load time against the names of declared inputs.
pub fn check_template(text: &str, known_inputs: &[&str]) -> Result<()> {
    for segment in parse_template(text)? {
        if let Segment::Ref(ParamRef::Input { name, .. }) = segment {
            if !known_inputs.contains(&name.as_str()) {
                return Err(WorkflowError::malformed(format!(
                    "reference to undeclared input '{}' in '{}'",
                    name, text
                )));
            }
        }
    }
    Ok(())
}

/// Substitutes every reference in `text`.
pub fn substitute(text: &str, ctx: &RefContext<'_>) -> Result<String> {
    let mut out = String::new();
    for segment in parse_template(text)? {
        match segment {
            Segment::Literal(s) => out.push_str(&s),
            Segment::Ref(r) => out.push_str(&resolve(&r, ctx)?),
        }
    }
    Ok(out)
}

fn resolve(r: &ParamRef, ctx: &RefContext<'_>) -> Result<String> {
    match r {
        ParamRef::RuntimeOutdir => Ok(ctx.outdir.display().to_string()),
        ParamRef::RuntimeCores => Ok(ctx.cores.to_string()),
        ParamRef::RuntimeRam => Ok(ctx.ram_mb.to_string()),
        ParamRef::Input { name, field } => {
            let value = ctx.inputs.get(name).unwrap_or(&Value::Null);
            render(name, value, *field)
        }
        ParamRef::SelfValue { field } => {
            render("self", ctx.self_value.unwrap_or(&Value::Null), *field)
        }
    }
}

fn render(name: &str, value: &Value, field: Option<PathField>) -> Result<String> {
    let Some(field) = field else {
        return Ok(match value {
            Value::Null => String::new(),
            Value::Array(_) => value
                .as_array()
                .unwrap_or_default()
                .iter()
                .filter_map(Value::to_token)
                .collect::<Vec<_>>()
                .join(" "),
            scalar => scalar.to_token().unwrap_or_default(),
        });
    };

    let path = value.path().ok_or_else(|| {
        WorkflowError::invalid_input(name, format!("{} has no path attributes", value.kind()))
    })?;
    let basename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(match field {
        PathField::Path => path.display().to_string(),
        PathField::Basename => basename,
        PathField::Nameroot => match basename.rfind('.') {
            Some(dot) if dot > 0 => basename[..dot].to_string(),
            _ => basename,
        },
        PathField::Nameext => match basename.rfind('.') {
            Some(dot) if dot > 0 => basename[dot..].to_string(),
            _ => String::new(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ctx<'a>(inputs: &'a ValueMap, outdir: &'a Path) -> RefContext<'a> {
        RefContext {
            inputs,
            self_value: None,
            outdir,
            cores: 2,
            ram_mb: 512,
        }
    }

    #[test]
    fn test_parse_template_segments() {
        let segs = parse_template("--band=$(inputs.band).tif").unwrap();
        assert_eq!(segs.len(), 3);
        assert_eq!(
            segs[1],
            Segment::Ref(ParamRef::Input {
                name: "band".to_string(),
                field: None
            })
        );
    }

    #[test]
    fn test_rejects_javascript_and_unknown() {
        assert!(parse_template("${ return 1; }").is_err());
        assert!(parse_template("$(inputs.band.toUpperCase())").is_err());
        assert!(parse_template("$(inputs.band").is_err());
    }

    #[test]
    fn test_check_template_known_inputs() {
        assert!(check_template("$(inputs.item)", &["item"]).is_ok());
        let err = check_template("$(inputs.aoi)", &["item"]).unwrap_err();
        assert!(err.to_string().contains("aoi"));
    }

    #[test]
    fn test_substitute_inputs_and_runtime() {
        let mut inputs = ValueMap::new();
        inputs.insert("band".to_string(), Value::String("nir".to_string()));
        inputs.insert(
            "raster".to_string(),
            Value::File(PathBuf::from("/data/crop_nir.tif")),
        );
        let outdir = Path::new("/work/node_crop/1");
        let c = ctx(&inputs, outdir);

        assert_eq!(substitute("$(inputs.band).tif", &c).unwrap(), "nir.tif");
        assert_eq!(
            substitute("$(inputs.raster.nameroot)", &c).unwrap(),
            "crop_nir"
        );
        assert_eq!(substitute("$(inputs.raster.nameext)", &c).unwrap(), ".tif");
        assert_eq!(
            substitute("$(runtime.outdir)/x", &c).unwrap(),
            "/work/node_crop/1/x"
        );
        assert_eq!(substitute("$(runtime.cores)", &c).unwrap(), "2");
        assert_eq!(substitute("$(inputs.missing)", &c).unwrap(), "");
    }

    #[test]
    fn test_path_field_on_string_fails() {
        let mut inputs = ValueMap::new();
        inputs.insert("band".to_string(), Value::String("nir".to_string()));
        let c = ctx(&inputs, Path::new("/"));
        assert!(substitute("$(inputs.band.path)", &c).is_err());
    }

    #[test]
    fn test_self_reference() {
        let inputs = ValueMap::new();
        let value = Value::File(PathBuf::from("/a/b.tif"));
        let c = RefContext {
            self_value: Some(&value),
            ..ctx(&inputs, Path::new("/"))
        };
        assert_eq!(substitute("$(self.basename)", &c).unwrap(), "b.tif");
        assert!(!has_references("plain"));
        assert!(has_references("$(self)"));
    }
}

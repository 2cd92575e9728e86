//! Parameter Types and Runtime Values
//!
//! CWL type expressions as they appear on workflow and tool parameters,
//! and the values that flow along bindings at run time.
//!
//! Supported type syntax:
//!
//! ```yaml
//! aoi: string
//! bands: string[]
//! epsg: string?
//! rasters: {type: array, items: File}
//! mask: ["null", File]
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde_json::json;
use serde_yaml::Value as Yaml;

use crate::error::{Result, WorkflowError};

/// A parameter type.
#[derive(Debug, Clone, PartialEq)]
pub enum CwlType {
    Null,
    Boolean,
    Int,
    Long,
    Float,
    Double,
    String,
    File,
    Directory,
    Any,
    /// Tool output bound to the captured standard output file
    Stdout,
    Array(Box<CwlType>),
    Optional(Box<CwlType>),
}

impl CwlType {
    /// Parses a type expression from its YAML form.
    pub fn parse(raw: &Yaml) -> Result<Self> {
        match raw {
            Yaml::String(s) => Self::parse_str(s),
            Yaml::Sequence(items) => {
                // Unions: only `["null", T]` is meaningful for this runner
                let non_null: Vec<&Yaml> = items
                    .iter()
                    .filter(|t| t.as_str() != Some("null"))
                    .collect();
                let nullable = non_null.len() < items.len();
                let inner = match non_null.as_slice() {
                    [] => CwlType::Null,
                    [single] => Self::parse(single)?,
                    _ => CwlType::Any,
                };
                Ok(if nullable { inner.optional() } else { inner })
            }
            Yaml::Mapping(map) => {
                let kind = map
                    .get("type")
                    .ok_or_else(|| WorkflowError::malformed("type mapping without 'type'"))?;
                if kind.as_str() == Some("array") {
                    let items = map.get("items").ok_or_else(|| {
                        WorkflowError::malformed("array type without 'items'")
                    })?;
                    Ok(CwlType::Array(Box::new(Self::parse(items)?)))
                } else {
                    // enum and record schemas carry their own validation; treat as opaque
                    match kind.as_str() {
                        Some("enum") | Some("record") => Ok(CwlType::Any),
                        _ => Self::parse(kind),
                    }
                }
            }
            Yaml::Null => Ok(CwlType::Any),
            other => Err(WorkflowError::malformed(format!(
                "unsupported type expression: {:?}",
                other
            ))),
        }
    }

    fn parse_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(inner) = s.strip_suffix('?') {
            return Ok(Self::parse_str(inner)?.optional());
        }
        if let Some(inner) = s.strip_suffix("[]") {
            return Ok(CwlType::Array(Box::new(Self::parse_str(inner)?)));
        }
        Ok(match s {
            "null" => CwlType::Null,
            "boolean" => CwlType::Boolean,
            "int" => CwlType::Int,
            "long" => CwlType::Long,
            "float" => CwlType::Float,
            "double" => CwlType::Double,
            "string" => CwlType::String,
            "File" => CwlType::File,
            "Directory" => CwlType::Directory,
            "Any" => CwlType::Any,
            "stdout" => CwlType::Stdout,
            other => {
                return Err(WorkflowError::malformed(format!(
                    "unknown type '{}'",
                    other
                )))
            }
        })
    }

    fn optional(self) -> Self {
        match self {
            CwlType::Optional(_) | CwlType::Null | CwlType::Any => self,
            other => CwlType::Optional(Box::new(other)),
        }
    }

    /// True if the type admits `null`.
    pub fn is_optional(&self) -> bool {
        matches!(self, CwlType::Optional(_) | CwlType::Null | CwlType::Any)
    }

    /// The type with any optional wrapper removed.
    pub fn required(&self) -> &CwlType {
        match self {
            CwlType::Optional(inner) => inner,
            other => other,
        }
    }

    /// True if the (non-null part of the) type is an array.
    pub fn is_array(&self) -> bool {
        matches!(self.required(), CwlType::Array(_))
    }

    /// Item type of an array type.
    pub fn item_type(&self) -> Option<&CwlType> {
        match self.required() {
            CwlType::Array(inner) => Some(inner),
            _ => None,
        }
    }
}

impl fmt::Display for CwlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CwlType::Null => write!(f, "null"),
            CwlType::Boolean => write!(f, "boolean"),
            CwlType::Int => write!(f, "int"),
            CwlType::Long => write!(f, "long"),
            CwlType::Float => write!(f, "float"),
            CwlType::Double => write!(f, "double"),
            CwlType::String => write!(f, "string"),
            CwlType::File => write!(f, "File"),
            CwlType::Directory => write!(f, "Directory"),
            CwlType::Any => write!(f, "Any"),
            CwlType::Stdout => write!(f, "stdout"),
            CwlType::Array(inner) => write!(f, "{}[]", inner),
            CwlType::Optional(inner) => write!(f, "{}?", inner),
        }
    }
}

/// Named values: bound step inputs, captured outputs, workflow results.
pub type ValueMap = BTreeMap<String, Value>;

/// A runtime value bound to a parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    File(PathBuf),
    Directory(PathBuf),
    Array(Vec<Value>),
}

impl Value {
    /// Converts a YAML/JSON literal (defaults, job files) into a value.
    ///
    /// Relative `File`/`Directory` paths are resolved against `base_dir`.
    pub fn from_yaml(raw: &Yaml, base_dir: &Path) -> Result<Self> {
        Ok(match raw {
            Yaml::Null => Value::Null,
            Yaml::Bool(b) => Value::Bool(*b),
            Yaml::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            Yaml::String(s) => Value::String(s.clone()),
            Yaml::Sequence(items) => Value::Array(
                items
                    .iter()
                    .map(|item| Self::from_yaml(item, base_dir))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Yaml::Mapping(map) => {
                let class = map.get("class").and_then(Yaml::as_str);
                let location = map
                    .get("path")
                    .or_else(|| map.get("location"))
                    .and_then(Yaml::as_str);
                match (class, location) {
                    (Some("File"), Some(loc)) => Value::File(resolve_path(loc, base_dir)),
                    (Some("Directory"), Some(loc)) => {
                        Value::Directory(resolve_path(loc, base_dir))
                    }
                    (Some(class), _) => {
                        return Err(WorkflowError::invalid_input(
                            class,
                            "File/Directory literal without 'path' or 'location'",
                        ))
                    }
                    (None, _) => {
                        return Err(WorkflowError::invalid_input(
                            "<mapping>",
                            "record values are not supported",
                        ))
                    }
                }
            }
            Yaml::Tagged(tagged) => Self::from_yaml(&tagged.value, base_dir)?,
        })
    }

    /// Parses a command-line string into a value of the given scalar type.
    pub fn parse_scalar(name: &str, raw: &str, ty: &CwlType, base_dir: &Path) -> Result<Self> {
        let parse_err = |what: &str| {
            WorkflowError::invalid_input(name, format!("'{}' is not a valid {}", raw, what))
        };
        Ok(match ty.required() {
            CwlType::Boolean => match raw {
                "true" | "yes" | "1" => Value::Bool(true),
                "false" | "no" | "0" => Value::Bool(false),
                _ => return Err(parse_err("boolean")),
            },
            CwlType::Int | CwlType::Long => {
                Value::Int(raw.parse().map_err(|_| parse_err("integer"))?)
            }
            CwlType::Float | CwlType::Double => {
                Value::Float(raw.parse().map_err(|_| parse_err("number"))?)
            }
            CwlType::File => Value::File(resolve_path(raw, base_dir)),
            CwlType::Directory => Value::Directory(resolve_path(raw, base_dir)),
            CwlType::Array(item) => Self::parse_scalar(name, raw, item, base_dir)?,
            _ => Value::String(raw.to_string()),
        })
    }

    /// Coerces a value to a declared type, promoting strings to
    /// `File`/`Directory` where the type asks for them.
    pub fn coerce(self, name: &str, ty: &CwlType, base_dir: &Path) -> Result<Self> {
        let mismatch = |value: &Value| {
            WorkflowError::invalid_input(
                name,
                format!("expected {} but got {}", ty, value.kind()),
            )
        };
        match (self, ty.required()) {
            (Value::Null, _) if ty.is_optional() => Ok(Value::Null),
            (Value::Null, _) => Err(WorkflowError::invalid_input(
                name,
                format!("missing required value of type {}", ty),
            )),
            (value, CwlType::Any) => Ok(value),
            (Value::String(s), CwlType::File) => Ok(Value::File(resolve_path(&s, base_dir))),
            (Value::String(s), CwlType::Directory) => {
                Ok(Value::Directory(resolve_path(&s, base_dir)))
            }
            (Value::Int(i), CwlType::Float | CwlType::Double) => Ok(Value::Float(i as f64)),
            (Value::Array(items), CwlType::Array(item_ty)) => Ok(Value::Array(
                items
                    .into_iter()
                    .map(|v| v.coerce(name, item_ty, base_dir))
                    .collect::<Result<Vec<_>>>()?,
            )),
            (value, expected) if value.matches(expected) => Ok(value),
            (value, _) => Err(mismatch(&value)),
        }
    }

    fn matches(&self, ty: &CwlType) -> bool {
        matches!(
            (self, ty),
            (Value::Bool(_), CwlType::Boolean)
                | (Value::Int(_), CwlType::Int | CwlType::Long)
                | (Value::Float(_), CwlType::Float | CwlType::Double)
                | (Value::String(_), CwlType::String)
                | (Value::File(_), CwlType::File | CwlType::Stdout)
                | (Value::Directory(_), CwlType::Directory)
        )
    }

    /// Short name of the value's kind, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::File(_) => "File",
            Value::Directory(_) => "Directory",
            Value::Array(_) => "array",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Filesystem path of a `File` or `Directory`.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Value::File(p) | Value::Directory(p) => Some(p),
            _ => None,
        }
    }

    /// Collects every file/directory path reachable from this value.
    pub fn collect_paths<'a>(&'a self, out: &mut Vec<&'a Path>) {
        match self {
            Value::File(p) | Value::Directory(p) => out.push(p),
            Value::Array(items) => items.iter().for_each(|v| v.collect_paths(out)),
            _ => {}
        }
    }

    /// Renders a scalar as a single command-line token.
    pub fn to_token(&self) -> Option<String> {
        match self {
            Value::Null | Value::Array(_) => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::String(s) => Some(s.clone()),
            Value::File(p) | Value::Directory(p) => Some(p.display().to_string()),
        }
    }

    /// JSON rendering in CWL output-object form.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => json!(b),
            Value::Int(i) => json!(i),
            Value::Float(f) => json!(f),
            Value::String(s) => json!(s),
            Value::File(p) => path_object("File", p),
            Value::Directory(p) => path_object("Directory", p),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Null => write!(f, "null"),
            other => write!(f, "{}", other.to_token().unwrap_or_default()),
        }
    }
}

/// JSON object with one entry per value.
pub fn map_to_json(values: &ValueMap) -> serde_json::Value {
    serde_json::Value::Object(
        values
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect(),
    )
}

fn path_object(class: &str, path: &Path) -> serde_json::Value {
    let basename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    json!({
        "class": class,
        "location": format!("file://{}", path.display()),
        "path": path.display().to_string(),
        "basename": basename,
    })
}

/// Resolves a path or `file://` URI against a base directory.
pub fn resolve_path(raw: &str, base_dir: &Path) -> PathBuf {
    let stripped = raw.strip_prefix("file://").unwrap_or(raw);
    let path = Path::new(stripped);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> Yaml {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn test_parse_shorthand_types() {
        assert_eq!(CwlType::parse(&yaml("string")).unwrap(), CwlType::String);
        assert_eq!(
            CwlType::parse(&yaml("string[]")).unwrap(),
            CwlType::Array(Box::new(CwlType::String))
        );
        let opt = CwlType::parse(&yaml("File?")).unwrap();
        assert!(opt.is_optional());
        assert_eq!(opt.required(), &CwlType::File);
    }

    #[test]
    fn test_parse_array_mapping_and_union() {
        let ty = CwlType::parse(&yaml("{type: array, items: File}")).unwrap();
        assert!(ty.is_array());
        assert_eq!(ty.item_type(), Some(&CwlType::File));

        let ty = CwlType::parse(&yaml("[\"null\", Directory]")).unwrap();
        assert_eq!(ty, CwlType::Optional(Box::new(CwlType::Directory)));
    }

    #[test]
    fn test_parse_unknown_type_fails() {
        assert!(CwlType::parse(&yaml("Raster")).is_err());
    }

    #[test]
    fn test_type_display() {
        let ty = CwlType::parse(&yaml("File[]?")).unwrap();
        assert_eq!(ty.to_string(), "File[]?");
    }

    #[test]
    fn test_value_from_yaml_file_literal() {
        let base = Path::new("/data");
        let v = Value::from_yaml(&yaml("{class: File, path: scene.tif}"), base).unwrap();
        assert_eq!(v, Value::File(PathBuf::from("/data/scene.tif")));

        let v = Value::from_yaml(&yaml("{class: Directory, location: file:///tmp/out}"), base)
            .unwrap();
        assert_eq!(v, Value::Directory(PathBuf::from("/tmp/out")));
    }

    #[test]
    fn test_coerce_strings_to_files() {
        let ty = CwlType::parse(&yaml("File[]")).unwrap();
        let v = Value::Array(vec![Value::String("a.tif".into()), Value::String("/b.tif".into())]);
        let coerced = v.coerce("rasters", &ty, Path::new("/work")).unwrap();
        assert_eq!(
            coerced,
            Value::Array(vec![
                Value::File(PathBuf::from("/work/a.tif")),
                Value::File(PathBuf::from("/b.tif")),
            ])
        );
    }

    #[test]
    fn test_coerce_rejects_missing_required() {
        let err = Value::Null
            .coerce("aoi", &CwlType::String, Path::new("/"))
            .unwrap_err();
        assert!(err.to_string().contains("aoi"));
        assert!(Value::Null
            .coerce("epsg", &CwlType::parse(&yaml("string?")).unwrap(), Path::new("/"))
            .is_ok());
    }

    #[test]
    fn test_coerce_rejects_wrong_kind() {
        let err = Value::Bool(true)
            .coerce("aoi", &CwlType::String, Path::new("/"))
            .unwrap_err();
        assert!(err.to_string().contains("expected string but got boolean"));
    }

    #[test]
    fn test_parse_scalar() {
        let base = Path::new("/in");
        assert_eq!(
            Value::parse_scalar("n", "3", &CwlType::Int, base).unwrap(),
            Value::Int(3)
        );
        assert!(Value::parse_scalar("n", "three", &CwlType::Int, base).is_err());
        assert_eq!(
            Value::parse_scalar("f", "x.tif", &CwlType::File, base).unwrap(),
            Value::File(PathBuf::from("/in/x.tif"))
        );
    }

    #[test]
    fn test_to_json_file_object() {
        let v = Value::File(PathBuf::from("/out/ndwi.tif"));
        let j = v.to_json();
        assert_eq!(j["class"], "File");
        assert_eq!(j["basename"], "ndwi.tif");
        assert_eq!(j["location"], "file:///out/ndwi.tif");
    }

    #[test]
    fn test_map_to_json_keeps_names() {
        let mut values = ValueMap::new();
        values.insert("band".to_string(), Value::String("nir".into()));
        values.insert("epsg".to_string(), Value::Null);
        let j = map_to_json(&values);
        assert_eq!(j["band"], "nir");
        assert!(j["epsg"].is_null());
    }

    #[test]
    fn test_value_display_and_paths() {
        let v = Value::Array(vec![
            Value::File(PathBuf::from("/a")),
            Value::String("nir".into()),
        ]);
        assert_eq!(v.to_string(), "[/a, nir]");
        let mut paths = Vec::new();
        v.collect_paths(&mut paths);
        assert_eq!(paths, vec![Path::new("/a")]);
    }
}

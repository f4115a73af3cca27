//! YAML configuration loading, with a pre-pass over the raw tree for
//! `${VAR}` environment substitution and `__import__`/`__include__`
//! directives before typed deserialization.

use crate::error::{Result, SchedulerError};
use regex::Regex;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub backend_api_host: String,
    #[serde(default = "default_api_port")]
    pub backend_api_port: u16,
    #[serde(default = "default_host")]
    pub frontend_host: String,
    #[serde(default = "default_frontend_port")]
    pub frontend_port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub task_directories: Vec<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8000
}

fn default_frontend_port() -> u16 {
    8001
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_api_host: default_host(),
            backend_api_port: default_api_port(),
            frontend_host: default_host(),
            frontend_port: default_frontend_port(),
            data_dir: default_data_dir(),
            task_directories: Vec::new(),
            log_level: default_log_level(),
        }
    }
}

/// A loaded config plus the full transitive closure of YAML files that
/// contributed to it — the catalog reconciler watches all of these, not
/// just the top-level file, since a nested import changing should count
/// as a content change too.
pub struct LoadedConfig {
    pub config: Config,
    pub source_files: Vec<PathBuf>,
}

pub fn load(path: impl AsRef<Path>) -> Result<LoadedConfig> {
    let (resolved, source_files) = load_yaml_resolved(path.as_ref())?;
    let config: Config = serde_yaml::from_value(resolved)?;
    Ok(LoadedConfig {
        config,
        source_files,
    })
}

/// Load and resolve any YAML file through the same `${VAR}`/`__import__`/
/// `__include__` pre-pass `load` uses, returning the raw `Value` plus the
/// transitive closure of files that contributed to it. The Catalog
/// Reconciler uses this directly for task definition files, which have a
/// different shape than [`Config`].
pub fn load_yaml_resolved(path: impl AsRef<Path>) -> Result<(Value, Vec<PathBuf>)> {
    let mut visited = Vec::new();
    let resolved = load_and_resolve(path.as_ref(), &mut visited)?;
    Ok((resolved, visited))
}

fn load_and_resolve(path: &Path, visited: &mut Vec<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if visited.contains(&canonical) {
        return Err(SchedulerError::validation(format!(
            "Circular import detected at {}",
            path.display()
        )));
    }
    visited.push(canonical);

    let contents = std::fs::read_to_string(path)?;
    let raw: Value = serde_yaml::from_str(&contents)?;
    let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
    resolve_value(raw, &base_dir, visited)
}

const IMPORT_KEY: &str = "__import__";
const INCLUDE_KEY: &str = "__include__";

fn resolve_value(value: Value, base_dir: &Path, visited: &mut Vec<PathBuf>) -> Result<Value> {
    match value {
        Value::Mapping(map) => {
            if map.len() == 1 {
                if let Some(Value::String(include_path)) = map.get(&Value::String(INCLUDE_KEY.to_string())) {
                    return load_and_resolve(&base_dir.join(include_path), visited);
                }
            }

            let mut merged = Mapping::new();
            if let Some(Value::String(import_path)) = map.get(&Value::String(IMPORT_KEY.to_string())) {
                if let Value::Mapping(imported) = load_and_resolve(&base_dir.join(import_path), visited)? {
                    merged.extend(imported);
                }
            }
            for (key, val) in map {
                if key == Value::String(IMPORT_KEY.to_string()) {
                    continue;
                }
                let resolved = resolve_value(val, base_dir, visited)?;
                merged.insert(key, resolved);
            }
            Ok(Value::Mapping(merged))
        }
        Value::Sequence(items) => {
            let resolved = items
                .into_iter()
                .map(|item| resolve_value(item, base_dir, visited))
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::Sequence(resolved))
        }
        Value::String(s) => Ok(Value::String(substitute_env(&s)?)),
        other => Ok(other),
    }
}

fn var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap())
}

fn substitute_env(input: &str) -> Result<String> {
    let substituted = var_pattern()
        .replace_all(input, |caps: &regex::Captures| std::env::var(&caps[1]).unwrap_or_default())
        .into_owned();
    Ok(substituted)
}

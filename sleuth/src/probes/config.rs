//! Configuration file probes.
//!
//! `config_files_detection` finds environment, compose and generic config
//! files in the workspace. `config_file_contents` depends on it and reads
//! what it found. `.env` style files become key/value pairs, compose files a
//! per-service summary of image, ports and environment, and other YAML or JSON
//! files their parsed document.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value, json};
use tracing::debug;
use walkdir::WalkDir;

use crate::registry::{ProbeArgs, ProbeContext, ProbeFault, ProbeSpec};

pub const DETECTION: &str = "config_files_detection";
pub const CONTENTS: &str = "config_file_contents";

const DEFAULT_MAX_DEPTH: u64 = 3;
const DEFAULT_MAX_BYTES: u64 = 20_000;

/// Directories never worth scanning for configuration.
const SKIPPED_DIRS: &[&str] = &[".git", ".sleuth", "node_modules", "target", ".venv"];

pub fn detection_spec() -> ProbeSpec {
    ProbeSpec::new(
        DETECTION,
        "Find configuration files (.env, docker-compose, config.*) in the workspace.",
        detect_config_files,
    )
    .arg("max_depth", "Directory depth to scan below the workspace root.")
    .default_arg("max_depth", json!(DEFAULT_MAX_DEPTH))
    .example(json!({"max_depth": 2}))
}

pub fn contents_spec() -> ProbeSpec {
    ProbeSpec::new(
        CONTENTS,
        "Read the configuration files found by config_files_detection.",
        read_config_files,
    )
    .arg("type", "Only read files of this type (environment_variables, docker_compose, generic_config).")
    .arg("max_bytes", "Per-file read limit.")
    .derived_arg("files", "Files reported by config_files_detection.")
    .default_arg("max_bytes", json!(DEFAULT_MAX_BYTES))
    .example(json!({"type": "environment_variables"}))
    .requires(DETECTION, |payload: &Value| {
        let mut patch = ProbeArgs::new();
        if let Some(found) = payload.get("found_files") {
            patch.insert("files".to_string(), found.clone());
        }
        patch
    })
}

/// File kind by name, or `None` for files that are not configuration.
pub fn classify(file_name: &str) -> Option<&'static str> {
    let yaml = |rest: &str| rest.ends_with(".yml") || rest.ends_with(".yaml");
    match file_name {
        ".env" | "environment.yml" | "environment.yaml" => Some("environment_variables"),
        "docker-compose.yml" | "docker-compose.yaml" | "compose.yml" | "compose.yaml" => {
            Some("docker_compose")
        }
        "config.yml" | "config.yaml" | "config.json" | "config.toml" => Some("generic_config"),
        name if name.starts_with(".env.") => Some("environment_variables"),
        name if name.starts_with("docker-compose.") && yaml(name) => Some("docker_compose"),
        _ => None,
    }
}

fn detect_config_files(args: &ProbeArgs, ctx: &ProbeContext) -> Result<Value, ProbeFault> {
    let max_depth = args
        .get("max_depth")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_MAX_DEPTH);
    let root = &ctx.workspace;
    if !root.is_dir() {
        return Err(ProbeFault::new("workspace does not exist")
            .with_details(json!({"root_path": root.display().to_string()})));
    }

    let mut found = Vec::new();
    let mut scanned_dirs = 0usize;
    let walker = WalkDir::new(root)
        .follow_links(false)
        .max_depth(usize::try_from(max_depth).unwrap_or(usize::MAX).saturating_add(1))
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !(e.file_type().is_dir()
                    && SKIPPED_DIRS.iter().any(|d| e.file_name() == *d))
        });
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!(err = %err, "skipping unreadable entry");
                continue;
            }
        };
        if entry.file_type().is_dir() {
            scanned_dirs += 1;
            continue;
        }
        let Some(kind) = entry.file_name().to_str().and_then(classify) else {
            continue;
        };
        let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        found.push(json!({
            "path": relative.display().to_string(),
            "absolute_path": entry.path().display().to_string(),
            "type": kind,
            "size_bytes": size_bytes,
        }));
    }

    Ok(json!({
        "root_path": root.display().to_string(),
        "count": found.len(),
        "found_files": found,
        "scanned_dirs": scanned_dirs,
        "max_depth": max_depth,
    }))
}

fn read_config_files(args: &ProbeArgs, ctx: &ProbeContext) -> Result<Value, ProbeFault> {
    let files = args
        .get("files")
        .and_then(Value::as_array)
        .ok_or_else(|| ProbeFault::new("no detected files to read"))?;
    let wanted = args.get("type").and_then(Value::as_str);
    let max_bytes = args
        .get("max_bytes")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_MAX_BYTES);
    let max_bytes = usize::try_from(max_bytes).unwrap_or(usize::MAX);

    let mut read = Vec::new();
    for file in files {
        let kind = file.get("type").and_then(Value::as_str).unwrap_or("unknown");
        if wanted.is_some_and(|w| w != kind) {
            continue;
        }
        let Some(path) = file_path(file, &ctx.workspace) else {
            continue;
        };
        read.push(read_one(&path, kind, max_bytes));
    }

    Ok(json!({
        "total_files": read.len(),
        "files": read,
    }))
}

fn file_path(file: &Value, workspace: &Path) -> Option<PathBuf> {
    if let Some(absolute) = file.get("absolute_path").and_then(Value::as_str) {
        return Some(PathBuf::from(absolute));
    }
    match file {
        Value::String(relative) => Some(workspace.join(relative)),
        _ => file
            .get("path")
            .and_then(Value::as_str)
            .map(|relative| workspace.join(relative)),
    }
}

fn read_one(path: &Path, kind: &str, max_bytes: usize) -> Value {
    let display = path.display().to_string();
    let contents = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            return json!({
                "file_path": display,
                "type": kind,
                "parsed": false,
                "error": err.to_string(),
            });
        }
    };
    let truncated = contents.len().saturating_sub(max_bytes);
    let text = String::from_utf8_lossy(&contents[..contents.len().min(max_bytes)]).into_owned();
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();

    if is_dotenv(name) {
        let variables = parse_dotenv(&text);
        return json!({
            "file_path": display,
            "type": kind,
            "format": "dotenv",
            "variable_count": variables.len(),
            "variables": variables,
            "truncated_bytes": truncated,
            "parsed": true,
        });
    }
    if is_yaml(name) && truncated == 0 {
        return match parse_yaml(&text) {
            Ok(document) => yaml_entry(display, kind, document),
            Err(err) => json!({
                "file_path": display,
                "type": kind,
                "format": "yaml",
                "content": text,
                "parsed": false,
                "error": err,
            }),
        };
    }
    if name.ends_with(".json")
        && truncated == 0
        && let Ok(value) = serde_json::from_str::<Value>(&text)
    {
        return json!({
            "file_path": display,
            "type": kind,
            "format": "json",
            "content": value,
            "parsed": true,
        });
    }
    json!({
        "file_path": display,
        "type": kind,
        "format": "text",
        "content": text,
        "truncated_bytes": truncated,
        "parsed": true,
    })
}

fn is_yaml(name: &str) -> bool {
    name.ends_with(".yml") || name.ends_with(".yaml")
}

fn parse_yaml(text: &str) -> Result<Value, String> {
    let document: serde_yaml::Value = serde_yaml::from_str(text).map_err(|e| e.to_string())?;
    serde_json::to_value(document).map_err(|e| e.to_string())
}

fn yaml_entry(display: String, kind: &str, document: Value) -> Value {
    match kind {
        "docker_compose" => {
            let services = compose_services(&document);
            json!({
                "file_path": display,
                "type": kind,
                "format": "compose",
                "service_count": services.len(),
                "services": services,
                "parsed": true,
            })
        }
        "environment_variables" => {
            let variables: Map<String, Value> = document
                .as_object()
                .into_iter()
                .flatten()
                .map(|(key, value)| (key.clone(), Value::String(plain_text(value))))
                .collect();
            json!({
                "file_path": display,
                "type": kind,
                "format": "yaml",
                "variable_count": variables.len(),
                "variables": variables,
                "parsed": true,
            })
        }
        _ => json!({
            "file_path": display,
            "type": kind,
            "format": "yaml",
            "content": document,
            "parsed": true,
        }),
    }
}

/// `services:` of a compose document, reduced to what explains runtime behavior.
fn compose_services(document: &Value) -> Map<String, Value> {
    let Some(services) = document.get("services").and_then(Value::as_object) else {
        return Map::new();
    };
    services
        .iter()
        .map(|(name, service)| {
            let mut summary = Map::new();
            for key in ["image", "build", "command", "depends_on", "volumes"] {
                if let Some(value) = service.get(key) {
                    summary.insert(key.to_string(), value.clone());
                }
            }
            let ports: Vec<Value> = service
                .get("ports")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .map(|port| match port {
                    Value::Object(_) => port.clone(),
                    other => Value::String(plain_text(other)),
                })
                .collect();
            summary.insert("ports".to_string(), Value::Array(ports));
            summary.insert(
                "environment".to_string(),
                Value::Object(compose_environment(service.get("environment"))),
            );
            (name.clone(), Value::Object(summary))
        })
        .collect()
}

/// Compose accepts `environment` as a map or as a list of `KEY=value` items.
fn compose_environment(environment: Option<&Value>) -> Map<String, Value> {
    match environment {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    Value::Null => Value::Null,
                    other => Value::String(plain_text(other)),
                };
                (key.clone(), value)
            })
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|item| match item.split_once('=') {
                Some((key, value)) => (key.to_string(), Value::String(value.to_string())),
                None => (item.to_string(), Value::Null),
            })
            .collect(),
        _ => Map::new(),
    }
}

fn plain_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn is_dotenv(name: &str) -> bool {
    name == ".env" || name.starts_with(".env.") || name.ends_with(".env")
}

/// Parse `KEY=value` lines, ignoring blanks and `#` comments.
pub fn parse_dotenv(text: &str) -> Map<String, Value> {
    let mut variables = Map::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        variables.insert(key.trim().to_string(), Value::String(value.to_string()));
    }
    variables
}

//! Template rendering against the assembled context document.
//!
//! Wraps a `minijinja` environment with the YAML and ENV helper
//! functions context files rely on. Every helper comes in two flavors:
//! the `must_` variant surfaces failures as render errors, the plain
//! variant swallows them and yields a zero value.

use std::collections::BTreeMap;

use minijinja::value::Value as TplValue;
use minijinja::{Environment, ErrorKind};
use serde_json::Value;

use crate::context::Document;

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("template parse error: {source}")]
    Parse {
        #[source]
        source: minijinja::Error,
    },
    #[error("template execute error: {source}")]
    Exec {
        #[source]
        source: minijinja::Error,
    },
    #[error("cannot env-encode a non-object value")]
    EnvNonMap,
}

pub struct Engine {
    env: Environment<'static>,
}

impl Engine {
    pub fn new() -> Self {
        let mut env = Environment::new();

        env.add_function("to_yaml", |value: TplValue| -> String {
            yaml_encode(&value).unwrap_or_default()
        });
        env.add_function(
            "must_to_yaml",
            |value: TplValue| -> Result<String, minijinja::Error> {
                yaml_encode(&value).map_err(exec_error)
            },
        );
        env.add_function("from_yaml", |text: String| -> TplValue {
            yaml_decode(&text).unwrap_or_else(|_| TplValue::from(()))
        });
        env.add_function(
            "must_from_yaml",
            |text: String| -> Result<TplValue, minijinja::Error> {
                yaml_decode(&text).map_err(exec_error)
            },
        );
        env.add_function("to_env", |value: TplValue| -> String {
            env_encode(&value, "").unwrap_or_default()
        });
        env.add_function(
            "must_to_env",
            |value: TplValue| -> Result<String, minijinja::Error> {
                env_encode(&value, "").map_err(exec_error)
            },
        );
        env.add_function("to_env_prefix", |prefix: String, value: TplValue| -> String {
            env_encode(&value, &prefix).unwrap_or_default()
        });
        env.add_function(
            "must_to_env_prefix",
            |prefix: String, value: TplValue| -> Result<String, minijinja::Error> {
                env_encode(&value, &prefix).map_err(exec_error)
            },
        );

        Self { env }
    }

    /// Renders `text` against `data`, keeping parse failures distinct
    /// from evaluation failures.
    pub fn render(&self, text: &str, data: &Document) -> Result<String, TemplateError> {
        let template = self
            .env
            .template_from_str(text)
            .map_err(|source| TemplateError::Parse { source })?;
        template
            .render(data)
            .map_err(|source| TemplateError::Exec { source })
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Flattens a nested map into `PREFIX_UPPER_DOTTED=value` lines, one per
/// leaf, with `_` as the path separator. Lines are sorted by key and
/// joined without a trailing newline. Errors when the root value is not
/// a map.
pub fn env_flatten(value: &Value, prefix: &str) -> Result<String, TemplateError> {
    let map = value.as_object().ok_or(TemplateError::EnvNonMap)?;

    let mut entries = BTreeMap::new();
    flatten_into(&mut entries, map, "");

    let lines: Vec<String> = entries
        .into_iter()
        .map(|(key, value)| format!("{prefix}{key}={value}"))
        .collect();

    Ok(lines.join("\n"))
}

fn flatten_into(entries: &mut BTreeMap<String, String>, map: &serde_json::Map<String, Value>, path: &str) {
    for (key, value) in map {
        let flat = if path.is_empty() {
            key.to_uppercase()
        } else {
            format!("{path}_{}", key.to_uppercase())
        };
        match value {
            Value::Object(inner) => flatten_into(entries, inner, &flat),
            leaf => {
                entries.insert(flat, leaf_to_string(leaf));
            }
        }
    }
}

fn leaf_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn yaml_encode(value: &TplValue) -> Result<String, String> {
    serde_yaml::to_string(value).map_err(|err| err.to_string())
}

fn yaml_decode(text: &str) -> Result<TplValue, String> {
    let value: Value = serde_yaml::from_str(text).map_err(|err| err.to_string())?;
    Ok(TplValue::from_serialize(&value))
}

fn env_encode(value: &TplValue, prefix: &str) -> Result<String, String> {
    let json: Value = serde_json::to_value(value).map_err(|err| err.to_string())?;
    env_flatten(&json, prefix).map_err(|err| err.to_string())
}

fn exec_error(message: String) -> minijinja::Error {
    minijinja::Error::new(ErrorKind::InvalidOperation, message)
}

//! Extension-driven document reading and writing. YAML is the reader
//! for both `.yaml`/`.yml` and `.json` (JSON is a YAML subset); the
//! writer picks the encoder from the target extension.

use std::fs;
use std::path::Path;

use serde_json::Value;

use crate::context::Document;
use crate::shared::fs_atomic::atomic_write_file;

#[derive(Debug, thiserror::Error)]
pub enum FmtError {
    #[error("unsupported format `{extension}` for {path}")]
    UnsupportedFormat { path: String, extension: String },
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to encode {path}: {reason}")]
    Encode { path: String, reason: String },
    #[error("{path} does not hold a mapping at the top level")]
    NotMapping { path: String },
}

pub fn write_value(path: &Path, value: &Value) -> Result<(), FmtError> {
    let bytes = match extension(path).as_str() {
        "json" => serde_json::to_vec(value).map_err(|err| FmtError::Encode {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?,
        "yaml" | "yml" => serde_yaml::to_string(value)
            .map_err(|err| FmtError::Encode {
                path: path.display().to_string(),
                reason: err.to_string(),
            })?
            .into_bytes(),
        other => {
            return Err(FmtError::UnsupportedFormat {
                path: path.display().to_string(),
                extension: other.to_string(),
            })
        }
    };

    atomic_write_file(path, &bytes).map_err(|source| FmtError::Write {
        path: path.display().to_string(),
        source,
    })
}

pub fn read_value(path: &Path) -> Result<Value, FmtError> {
    match extension(path).as_str() {
        "json" | "yaml" | "yml" => {}
        other => {
            return Err(FmtError::UnsupportedFormat {
                path: path.display().to_string(),
                extension: other.to_string(),
            })
        }
    }

    let bytes = fs::read(path).map_err(|source| FmtError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_yaml::from_slice(&bytes).map_err(|source| FmtError::Parse {
        path: path.display().to_string(),
        source,
    })
}

pub fn read_document(path: &Path) -> Result<Document, FmtError> {
    match read_value(path)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Document::new()),
        _ => Err(FmtError::NotMapping {
            path: path.display().to_string(),
        }),
    }
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn json_and_yaml_round_trip_by_extension() {
        let temp = tempdir().expect("tempdir");
        let value = json!({"a": {"b": 1}, "list": ["x"]});

        for name in ["doc.json", "doc.yaml", "doc.yml"] {
            let path = temp.path().join(name);
            write_value(&path, &value).expect("write");
            assert_eq!(read_value(&path).expect("read"), value);
        }
    }

    #[test]
    fn unknown_extensions_are_rejected() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("doc.toml");
        assert!(matches!(
            write_value(&path, &json!({})),
            Err(FmtError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn read_document_requires_a_mapping() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("doc.yaml");
        write_value(&path, &json!(["not", "a", "map"])).expect("write");
        assert!(matches!(
            read_document(&path),
            Err(FmtError::NotMapping { .. })
        ));
    }
}

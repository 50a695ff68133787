//! Layered context assembly: named sources applied in a fixed order into
//! one shared document, later layers overriding earlier ones on key
//! collision.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;

use crate::context::document::Document;
use crate::context::error::ContextError;
use crate::shared::logging::DebugLog;
use crate::template::Engine;

/// Top-level keys the run pipeline owns; home-scoped sources must not
/// shadow them.
pub const RESERVED_KEYS: &[&str] = &["manifest", "github", "values", "reflow"];

pub trait Source {
    fn name(&self) -> String;
    fn build(&self, doc: &mut Document) -> Result<(), ContextError>;
}

pub struct Pipeline<'a> {
    sources: Vec<Box<dyn Source + 'a>>,
    log: &'a DebugLog,
}

impl<'a> Pipeline<'a> {
    pub fn new(log: &'a DebugLog) -> Self {
        Self {
            sources: Vec::new(),
            log,
        }
    }

    pub fn push(&mut self, source: impl Source + 'a) {
        self.sources.push(Box::new(source));
    }

    /// Applies every source in order, aborting on the first failure or
    /// on cancellation observed between sources.
    pub fn build(&self, cancel: &AtomicBool, doc: &mut Document) -> Result<(), ContextError> {
        for source in &self.sources {
            if cancel.load(Ordering::Relaxed) {
                return Err(ContextError::Canceled {
                    source_name: source.name(),
                });
            }
            self.log
                .debug(&format!("building context source `{}`", source.name()));
            source.build(doc)?;
        }
        Ok(())
    }
}

/// A context source backed by the immediate files of one directory.
///
/// Files load in lexicographic name order, so a templated file may
/// reference keys loaded by files that sort before it; the order is part
/// of the contract, not an accident of the filesystem.
pub struct DirSource<'a> {
    name: String,
    dir: PathBuf,
    exclude: &'a [&'a str],
    engine: Option<&'a Engine>,
    log: &'a DebugLog,
}

impl<'a> DirSource<'a> {
    pub fn new(name: &str, dir: PathBuf, log: &'a DebugLog) -> Self {
        Self {
            name: name.to_string(),
            dir,
            exclude: &[],
            engine: None,
            log,
        }
    }

    /// Skips files whose base name (extension stripped) is listed.
    pub fn exclude(mut self, keys: &'a [&'a str]) -> Self {
        self.exclude = keys;
        self
    }

    /// Pipes raw file bytes through the engine, with the document built
    /// so far as template data, before parsing.
    pub fn templated(mut self, engine: &'a Engine) -> Self {
        self.engine = Some(engine);
        self
    }

    fn entries(&self) -> Result<Vec<PathBuf>, ContextError> {
        let read = fs::read_dir(&self.dir).map_err(|source| ContextError::ListDir {
            source_name: self.name.clone(),
            dir: self.dir.display().to_string(),
            source,
        })?;

        let mut entries = Vec::new();
        for entry in read {
            let entry = entry.map_err(|source| ContextError::ListDir {
                source_name: self.name.clone(),
                dir: self.dir.display().to_string(),
                source,
            })?;
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if is_file {
                entries.push(entry.path());
            }
        }
        entries.sort();
        Ok(entries)
    }
}

impl Source for DirSource<'_> {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn build(&self, doc: &mut Document) -> Result<(), ContextError> {
        let entries = self.entries()?;
        self.log
            .debug(&format!("`{}`: found {} entries", self.name, entries.len()));

        for path in entries {
            let Some(key) = base_name(&path) else {
                continue;
            };
            if self.exclude.contains(&key.as_str()) {
                self.log
                    .debug(&format!("`{}`: excluding `{key}`", self.name));
                continue;
            }

            let recognized = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| {
                    let ext = ext.to_ascii_lowercase();
                    ext == "json" || ext == "yaml" || ext == "yml"
                })
                .unwrap_or(false);
            if !recognized {
                self.log
                    .debug(&format!("`{}`: skipping `{}`", self.name, path.display()));
                continue;
            }

            let bytes = fs::read(&path).map_err(|source| ContextError::ReadFile {
                source_name: self.name.clone(),
                path: path.display().to_string(),
                source,
            })?;
            let text = String::from_utf8_lossy(&bytes).into_owned();

            let text = match self.engine {
                Some(engine) => {
                    engine
                        .render(&text, doc)
                        .map_err(|source| ContextError::RenderFile {
                            source_name: self.name.clone(),
                            path: path.display().to_string(),
                            source,
                        })?
                }
                None => text,
            };

            let value: Value =
                serde_yaml::from_str(&text).map_err(|source| ContextError::ParseFile {
                    source_name: self.name.clone(),
                    path: path.display().to_string(),
                    source,
                })?;

            doc.insert(key, value);
        }

        Ok(())
    }
}

/// A context source backed by one file, loaded whole under a fixed
/// top-level key.
pub struct FileSource<'a> {
    key: String,
    path: PathBuf,
    engine: Option<&'a Engine>,
}

impl<'a> FileSource<'a> {
    pub fn new(key: &str, path: PathBuf) -> Self {
        Self {
            key: key.to_string(),
            path,
            engine: None,
        }
    }

    pub fn templated(mut self, engine: &'a Engine) -> Self {
        self.engine = Some(engine);
        self
    }
}

impl Source for FileSource<'_> {
    fn name(&self) -> String {
        format!("file `{}`", self.key)
    }

    fn build(&self, doc: &mut Document) -> Result<(), ContextError> {
        let bytes = fs::read(&self.path).map_err(|source| ContextError::ReadFile {
            source_name: self.name(),
            path: self.path.display().to_string(),
            source,
        })?;
        let text = String::from_utf8_lossy(&bytes).into_owned();

        let text = match self.engine {
            Some(engine) => {
                engine
                    .render(&text, doc)
                    .map_err(|source| ContextError::RenderFile {
                        source_name: self.name(),
                        path: self.path.display().to_string(),
                        source,
                    })?
            }
            None => text,
        };

        let value: Value =
            serde_yaml::from_str(&text).map_err(|source| ContextError::ParseFile {
                source_name: self.name(),
                path: self.path.display().to_string(),
                source,
            })?;

        doc.insert(self.key.clone(), value);
        Ok(())
    }
}

fn base_name(path: &std::path::Path) -> Option<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
}

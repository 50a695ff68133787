//! Builds a run manifest: decodes the event + inputs document, strips
//! credentials, allocates a run id and lays out the run's working
//! directories.

use std::io::Read;

use chrono::Utc;
use serde_json::{json, Value};

use crate::context::{self, ContextError, Document};
use crate::fmtconv::{self, FmtError};
use crate::home::{Home, HomeError};
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::ids::generate_run_id;

const RUN_ID_ALLOCATION_ATTEMPTS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("decoding manifest: {source}")]
    Decode {
        #[source]
        source: serde_yaml::Error,
    },
    #[error("manifest: {0}")]
    Context(#[from] ContextError),
    #[error("allocating run id: {0}")]
    RunId(String),
    #[error("laying out run directories: {0}")]
    Layout(#[from] HomeError),
    #[error("writing manifest document: {0}")]
    Document(#[from] FmtError),
    #[error("writing {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub struct Builder<'a> {
    pub home: &'a Home,
}

impl Builder<'_> {
    /// Decodes a manifest document from `reader`, persists the run's
    /// working tree and returns the freshly allocated run id.
    ///
    /// The document is expected to hold a `github` event payload and an
    /// `inputs` map with string fields `uses`, `values`, `inputs` and
    /// `debug`. Credentials under `github.token` and `inputs.token` are
    /// deleted before anything is written to disk.
    pub fn build(&self, reader: impl Read) -> Result<String, ManifestError> {
        let mut doc: Document =
            serde_yaml::from_reader(reader).map_err(|source| ManifestError::Decode { source })?;

        context::delete(&mut doc, "github.token");
        context::delete(&mut doc, "inputs.token");

        let github: Document = context::get(&doc, "github")?;
        let inputs: Document = context::get(&doc, "inputs")?;

        let uses: String = context::get(&inputs, "uses")?;
        let values: String = context::get(&inputs, "values")?;
        let raw_inputs: String = context::get(&inputs, "inputs")?;
        let debug: String = context::get(&inputs, "debug")?;

        let id = self.allocate_run_id()?;
        self.home.init_run(&id)?;

        let run = self.home.run_dir(&id);
        fmtconv::write_value(&run.join("context").join("github.json"), &Value::Object(github))?;
        write_raw(&run.join("templates").join("values.yaml"), values.as_bytes())?;
        write_raw(&run.join("inputs").join("inputs.yaml"), raw_inputs.as_bytes())?;

        let manifest = json!({ "uses": uses, "id": id, "debug": debug });
        fmtconv::write_value(&run.join("context").join("manifest.yaml"), &manifest)?;

        Ok(id)
    }

    fn allocate_run_id(&self) -> Result<String, ManifestError> {
        for _ in 0..RUN_ID_ALLOCATION_ATTEMPTS {
            let id = generate_run_id(Utc::now().timestamp()).map_err(ManifestError::RunId)?;
            if !self.home.run_dir(&id).exists() {
                return Ok(id);
            }
        }
        Err(ManifestError::RunId(format!(
            "no unique run id after {RUN_ID_ALLOCATION_ATTEMPTS} attempts"
        )))
    }
}

fn write_raw(path: &std::path::Path, content: &[u8]) -> Result<(), ManifestError> {
    atomic_write_file(path, content).map_err(|source| ManifestError::Write {
        path: path.display().to_string(),
        source,
    })
}

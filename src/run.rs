//! Drives one dispatched workflow run: layered context assembly, anchor
//! ref creation, dispatch, run lookup, conclusion polling and artifact
//! collection.

use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use zip::ZipArchive;

use crate::context::{
    self, ContextError, DirSource, Document, EventSource, FileSource, Pipeline, RESERVED_KEYS,
};
use crate::fmtconv::{self, FmtError};
use crate::github::{GitHubClient, GitHubError};
use crate::home::Home;
use crate::shared::logging::DebugLog;
use crate::shared::wait::sleep_with_cancel;
use crate::template::{Engine, TemplateError};
use crate::workflow::{ReferenceError, WorkflowReference};

/// Name of the artifact the remote workflow publishes its outputs under.
pub const OUTPUTS_ARTIFACT: &str = "reflow-outputs";
/// Bound on the artifact archive read, against oversized remote data.
pub const MAX_ARTIFACT_BYTES: u64 = 1024 * 1024;

const SUCCESS_CONCLUSION: &str = "success";

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("building context: {0}")]
    Context(#[from] ContextError),
    #[error("parsing workflow reference: {0}")]
    Reference(#[from] ReferenceError),
    #[error("reading run inputs: {0}")]
    Inputs(#[from] FmtError),
    #[error("decoding inputs override: {reason}")]
    InputsOverride { reason: String },
    #[error("templating input `{key}`: {source}")]
    TemplateInput {
        key: String,
        #[source]
        source: TemplateError,
    },
    #[error("ref lookup failed: {source}")]
    RefLookup {
        #[source]
        source: GitHubError,
    },
    #[error("ref create failed: {source}")]
    RefCreate {
        #[source]
        source: GitHubError,
    },
    #[error("workflow dispatch failed: {source}")]
    Dispatch {
        #[source]
        source: GitHubError,
    },
    #[error("listing workflow runs failed: {source}")]
    RunLookup {
        #[source]
        source: GitHubError,
    },
    #[error("looking for workflow run timed out after {timeout:?}")]
    LookupTimeout { timeout: Duration },
    #[error("polling workflow run failed: {source}")]
    Poll {
        #[source]
        source: GitHubError,
    },
    #[error("workflow run concluded `{conclusion}`, want `success` [{url}]")]
    RunFailed { conclusion: String, url: String },
    #[error("artifact error: {reason}")]
    Artifact { reason: String },
    #[error("writing run outputs to {path}: {source}")]
    WriteOutputs {
        path: String,
        #[source]
        source: FmtError,
    },
    #[error("run canceled")]
    Canceled,
}

/// Orchestrator-local view of one dispatched run. Terminal once the
/// remote conclusion is non-empty.
#[derive(Debug, Clone)]
pub struct RunState {
    pub anchor: String,
    pub dispatched_at: DateTime<Utc>,
    pub run_id: Option<i64>,
    pub status: String,
    pub conclusion: String,
}

impl RunState {
    fn new(anchor: String) -> Self {
        Self {
            anchor,
            dispatched_at: Utc::now(),
            run_id: None,
            status: String::new(),
            conclusion: String::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !self.conclusion.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RunTuning {
    /// Page size for the run listing, bounding the lookup response.
    pub per_page: u32,
    /// Delay before the first lookup; the remote needs time to index a
    /// just-dispatched run.
    pub warmup: Duration,
    /// Tick between lookup retries and conclusion polls.
    pub interval: Duration,
    /// Overall budget for finding the dispatched run.
    pub max_lookup: Duration,
}

impl Default for RunTuning {
    fn default() -> Self {
        Self {
            per_page: 10,
            warmup: Duration::from_secs(10),
            interval: Duration::from_secs(30),
            max_lookup: Duration::from_secs(180),
        }
    }
}

/// Caller-provided substitutes for pieces of the run's on-disk state,
/// surfaced on the CLI as environment overrides.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    /// Path to a JSON document replacing the `github` context key.
    pub github_context: Option<PathBuf>,
    /// Path to a templated document replacing the `values` context key.
    pub values_context: Option<PathBuf>,
    /// Raw input document replacing the run's `inputs/inputs.yaml`.
    pub inputs: Option<String>,
}

pub struct Orchestrator<'a> {
    pub github: &'a GitHubClient,
    pub engine: &'a Engine,
    pub home: &'a Home,
    pub log: &'a DebugLog,
    pub tuning: RunTuning,
    pub overrides: RunOverrides,
}

/// Deletes the anchor ref when the dispatch-through-collection sequence
/// unwinds, on success and error paths alike. The deletion itself is
/// best-effort.
struct AnchorGuard<'a> {
    github: &'a GitHubClient,
    owner: String,
    repo: String,
    git_ref: String,
    log: &'a DebugLog,
}

impl Drop for AnchorGuard<'_> {
    fn drop(&mut self) {
        self.log
            .debug(&format!("deleting anchor ref `{}`", self.git_ref));
        let _ = self
            .github
            .delete_ref(&self.owner, &self.repo, &self.git_ref);
    }
}

impl Orchestrator<'_> {
    /// Runs the full dispatch/poll/collect sequence for `run_id` and
    /// returns the collected outputs. Each logical run needs a fresh id:
    /// repeating one re-anchors and re-dispatches against the remote.
    pub fn run(&self, cancel: &AtomicBool, run_id: &str) -> Result<Document, RunError> {
        let mut doc = Document::new();
        self.pipeline(run_id).build(cancel, &mut doc)?;

        let uses: String = context::get(&doc, "manifest.uses")?;
        let reference = WorkflowReference::parse(&uses)?;

        let mut inputs = match &self.overrides.inputs {
            Some(raw) => decode_inputs(raw)?,
            None => fmtconv::read_document(&self.home.run_inputs_file(run_id))?,
        };
        context::set(
            &mut doc,
            "reflow.token",
            Value::String(self.github.token().to_string()),
        );
        self.template_inputs(&mut inputs, &doc)?;

        let anchor = format!("reflow/{run_id}");
        let owner = &reference.owner;
        let repo = &reference.repo;

        let base = self
            .github
            .get_ref(owner, repo, &reference.branch)
            .map_err(|source| RunError::RefLookup { source })?;
        let created = self
            .github
            .create_ref(owner, repo, &format!("refs/heads/{anchor}"), &base.object.sha)
            .map_err(|source| RunError::RefCreate { source })?;
        let _anchor_guard = AnchorGuard {
            github: self.github,
            owner: owner.clone(),
            repo: repo.clone(),
            git_ref: created
                .git_ref
                .strip_prefix("refs/")
                .unwrap_or(&created.git_ref)
                .to_string(),
            log: self.log,
        };

        self.github
            .dispatch_workflow(owner, repo, &reference.file, &anchor, &inputs)
            .map_err(|source| RunError::Dispatch { source })?;

        let mut state = RunState::new(anchor);
        self.log.status(&format!(
            "workflow `{}` dispatched, anchor `{}`",
            reference.file, state.anchor
        ));

        let url = self.await_run(cancel, &reference, &mut state)?;
        self.poll_until_terminal(cancel, &reference, &mut state)?;

        if state.conclusion != SUCCESS_CONCLUSION {
            return Err(RunError::RunFailed {
                conclusion: state.conclusion,
                url,
            });
        }

        let run_db_id = state.run_id.ok_or(RunError::Artifact {
            reason: "matched run has no id".to_string(),
        })?;
        let outputs = self.collect_outputs(owner, repo, run_db_id)?;

        let outputs_path = self.home.run_outputs_file(run_id);
        fmtconv::write_value(&outputs_path, &Value::Object(outputs.clone())).map_err(|source| {
            RunError::WriteOutputs {
                path: outputs_path.display().to_string(),
                source,
            }
        })?;

        Ok(outputs)
    }

    /// Run pipeline layers, in application order: run context, derived
    /// event context, home context, home templates, run templates. Home
    /// sources skip the reserved keys, and the run templates land last,
    /// so run-scoped values win every collision with home-scoped ones.
    /// Caller overrides for the `github` and `values` keys load first,
    /// acting as the weakest layer.
    fn pipeline(&self, run_id: &str) -> Pipeline<'_> {
        let mut pipeline = Pipeline::new(self.log);
        if let Some(path) = &self.overrides.github_context {
            pipeline.push(FileSource::new("github", path.clone()));
        }
        if let Some(path) = &self.overrides.values_context {
            pipeline.push(FileSource::new("values", path.clone()).templated(self.engine));
        }
        pipeline.push(DirSource::new(
            "run context",
            self.home.run_context_dir(run_id),
            self.log,
        ));
        pipeline.push(EventSource::new(self.github));
        pipeline.push(
            DirSource::new("home context", self.home.context_dir(), self.log)
                .exclude(RESERVED_KEYS),
        );
        pipeline.push(
            DirSource::new("home templates", self.home.templates_dir(), self.log)
                .exclude(RESERVED_KEYS)
                .templated(self.engine),
        );
        pipeline.push(
            DirSource::new("run templates", self.home.run_templates_dir(run_id), self.log)
                .templated(self.engine),
        );
        pipeline
    }

    /// Coerces every input value to a string and renders it through the
    /// engine against the assembled context.
    fn template_inputs(&self, inputs: &mut Document, data: &Document) -> Result<(), RunError> {
        let keys: Vec<String> = inputs.keys().cloned().collect();
        for key in keys {
            let raw = match inputs.get(&key) {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                Some(Value::Bool(b)) => b.to_string(),
                Some(other) => serde_json::to_string(other).unwrap_or_default(),
            };
            let rendered =
                self.engine
                    .render(&raw, data)
                    .map_err(|source| RunError::TemplateInput {
                        key: key.clone(),
                        source,
                    })?;
            inputs.insert(key, Value::String(rendered));
        }
        Ok(())
    }

    /// Finds the dispatched run among recent listings by matching its
    /// head branch against the anchor. Absence of a match inside the
    /// lookup budget is fatal, not an empty result.
    fn await_run(
        &self,
        cancel: &AtomicBool,
        reference: &WorkflowReference,
        state: &mut RunState,
    ) -> Result<String, RunError> {
        if !sleep_with_cancel(cancel, self.tuning.warmup) {
            return Err(RunError::Canceled);
        }

        let deadline = Instant::now() + self.tuning.max_lookup;
        loop {
            let listing = self
                .github
                .list_workflow_runs(
                    &reference.owner,
                    &reference.repo,
                    &reference.file,
                    1,
                    self.tuning.per_page,
                )
                .map_err(|source| RunError::RunLookup { source })?;

            if let Some(run) = listing
                .workflow_runs
                .into_iter()
                .find(|run| run.head_branch == state.anchor)
            {
                state.run_id = Some(run.id);
                state.status = run.status;
                state.conclusion = run.conclusion.unwrap_or_default();
                self.log
                    .status(&format!("dispatched workflow is running at {}", run.html_url));
                return Ok(run.html_url);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RunError::LookupTimeout {
                    timeout: self.tuning.max_lookup,
                });
            }
            let wait = self.tuning.interval.min(remaining);
            if !sleep_with_cancel(cancel, wait) {
                return Err(RunError::Canceled);
            }
            if wait < self.tuning.interval {
                // The lookup deadline fired before the next tick.
                return Err(RunError::LookupTimeout {
                    timeout: self.tuning.max_lookup,
                });
            }
        }
    }

    /// Refreshes status and conclusion on every tick until the run is
    /// terminal. Intentionally open-ended: only caller cancellation
    /// bounds this loop.
    fn poll_until_terminal(
        &self,
        cancel: &AtomicBool,
        reference: &WorkflowReference,
        state: &mut RunState,
    ) -> Result<(), RunError> {
        let run_id = state.run_id.ok_or(RunError::Artifact {
            reason: "polling without a matched run".to_string(),
        })?;

        while !state.is_terminal() {
            if !sleep_with_cancel(cancel, self.tuning.interval) {
                return Err(RunError::Canceled);
            }
            let run = self
                .github
                .get_workflow_run(&reference.owner, &reference.repo, run_id)
                .map_err(|source| RunError::Poll { source })?;
            state.status = run.status;
            state.conclusion = run.conclusion.unwrap_or_default();
            self.log.status(&format!(
                "workflow status `{}` [{}]",
                state.status, run.html_url
            ));
        }
        Ok(())
    }

    /// Collects outputs from the first artifact named `reflow-outputs`.
    /// A missing artifact degrades to empty outputs; the run is still
    /// successful without declared outputs.
    fn collect_outputs(
        &self,
        owner: &str,
        repo: &str,
        run_id: i64,
    ) -> Result<Document, RunError> {
        let listing = self
            .github
            .list_artifacts(owner, repo, run_id)
            .map_err(|err| RunError::Artifact {
                reason: format!("list artifacts: {err}"),
            })?;

        let mut outputs = Document::new();
        let Some(artifact) = listing
            .artifacts
            .iter()
            .find(|artifact| artifact.name == OUTPUTS_ARTIFACT)
        else {
            self.log
                .debug("no matching outputs artifact; returning empty outputs");
            return Ok(outputs);
        };

        let bytes = self
            .github
            .download_artifact(owner, repo, artifact.id, MAX_ARTIFACT_BYTES)
            .map_err(|err| RunError::Artifact {
                reason: format!("download: {err}"),
            })?;

        let mut archive =
            ZipArchive::new(Cursor::new(bytes)).map_err(|err| RunError::Artifact {
                reason: format!("open archive: {err}"),
            })?;

        for index in 0..archive.len() {
            let mut file = archive.by_index(index).map_err(|err| RunError::Artifact {
                reason: format!("read archive entry {index}: {err}"),
            })?;
            if file.is_dir() {
                continue;
            }
            let name = file.name().to_string();
            let Some(key) = entry_key(&name) else {
                continue;
            };

            let mut text = String::new();
            file.read_to_string(&mut text)
                .map_err(|err| RunError::Artifact {
                    reason: format!("read `{name}`: {err}"),
                })?;
            let value: Value = serde_yaml::from_str(&text).map_err(|err| RunError::Artifact {
                reason: format!("decode `{name}`: {err}"),
            })?;
            let Value::Object(map) = value else {
                return Err(RunError::Artifact {
                    reason: format!("`{name}` does not hold a mapping"),
                });
            };

            self.log.debug(&format!("collected artifact entry `{name}`"));
            if key == "outputs" {
                // The outputs document flattens one level into the result.
                for (k, v) in map {
                    outputs.insert(k, v);
                }
            } else {
                outputs.insert(key, Value::Object(map));
            }
        }

        Ok(outputs)
    }
}

fn decode_inputs(raw: &str) -> Result<Document, RunError> {
    let value: Value = serde_yaml::from_str(raw).map_err(|err| RunError::InputsOverride {
        reason: err.to_string(),
    })?;
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Document::new()),
        other => Err(RunError::InputsOverride {
            reason: format!("expected a mapping, got {other}"),
        }),
    }
}

fn entry_key(name: &str) -> Option<String> {
    std::path::Path::new(name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
}

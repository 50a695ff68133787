//! Minimal blocking client for the GitHub REST endpoints the run
//! orchestrator and event source rely on.

use std::io::Read;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};

const DEFAULT_GITHUB_API_BASE: &str = "https://api.github.com";

#[derive(Debug, thiserror::Error)]
pub enum GitHubError {
    #[error("github {call} request failed: {reason}")]
    Request { call: &'static str, reason: String },
    #[error("github {call} returned status {status}: {body}")]
    Status {
        call: &'static str,
        status: u16,
        body: String,
    },
    #[error("github {call} response decode failed: {reason}")]
    Decode { call: &'static str, reason: String },
    #[error("github artifact download returned no redirect location")]
    MissingRedirect,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitRef {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub object: GitObject,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitObject {
    pub sha: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub head: PullHead,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullHead {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub sha: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRun {
    pub id: i64,
    #[serde(default)]
    pub head_branch: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub html_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRunList {
    #[serde(default)]
    pub workflow_runs: Vec<WorkflowRun>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Artifact {
    pub id: i64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactList {
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

/// Reads the bearer token the way the CLI presents it: `PAT` wins over
/// `GITHUB_TOKEN`.
pub fn token_from_env() -> String {
    for name in ["PAT", "GITHUB_TOKEN"] {
        if let Ok(value) = std::env::var(name) {
            if !value.trim().is_empty() {
                return value;
            }
        }
    }
    String::new()
}

// No Debug derive: the struct carries the bearer token and must never
// end up in log output.
#[derive(Clone)]
pub struct GitHubClient {
    agent: ureq::Agent,
    api_base: String,
    token: String,
}

impl GitHubClient {
    pub fn new(token: String) -> Self {
        let api_base = std::env::var("REFLOW_GITHUB_API_BASE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_GITHUB_API_BASE.to_string());
        // Redirect handling stays manual so the artifact download can
        // hand the signed storage URL a tokenless second request.
        let agent = ureq::AgentBuilder::new().redirects(0).build();
        Self {
            agent,
            api_base,
            token,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base.trim_end_matches('/'), path)
    }

    pub fn get_ref(&self, owner: &str, repo: &str, git_ref: &str) -> Result<GitRef, GitHubError> {
        self.get_json(
            "get ref",
            &format!("repos/{owner}/{repo}/git/ref/{git_ref}"),
            &[],
        )
    }

    pub fn create_ref(
        &self,
        owner: &str,
        repo: &str,
        full_ref: &str,
        sha: &str,
    ) -> Result<GitRef, GitHubError> {
        self.post_json(
            "create ref",
            &format!("repos/{owner}/{repo}/git/refs"),
            json!({ "ref": full_ref, "sha": sha }),
        )
    }

    pub fn delete_ref(&self, owner: &str, repo: &str, git_ref: &str) -> Result<(), GitHubError> {
        let call = "delete ref";
        let url = self.endpoint(&format!("repos/{owner}/{repo}/git/refs/{git_ref}"));
        self.authorized(self.agent.delete(&url))
            .call()
            .map_err(|err| request_error(call, err))?;
        Ok(())
    }

    pub fn dispatch_workflow(
        &self,
        owner: &str,
        repo: &str,
        file: &str,
        target_ref: &str,
        inputs: &Map<String, Value>,
    ) -> Result<(), GitHubError> {
        let call = "dispatch workflow";
        let file = urlencoding::encode(file);
        let url = self.endpoint(&format!(
            "repos/{owner}/{repo}/actions/workflows/{file}/dispatches"
        ));
        self.authorized(self.agent.post(&url))
            .send_json(json!({ "ref": target_ref, "inputs": inputs }))
            .map_err(|err| request_error(call, err))?;
        Ok(())
    }

    pub fn list_workflow_runs(
        &self,
        owner: &str,
        repo: &str,
        file: &str,
        page: u32,
        per_page: u32,
    ) -> Result<WorkflowRunList, GitHubError> {
        let file = urlencoding::encode(file).into_owned();
        self.get_json(
            "list workflow runs",
            &format!("repos/{owner}/{repo}/actions/workflows/{file}/runs"),
            &[("page", page.to_string()), ("per_page", per_page.to_string())],
        )
    }

    pub fn get_workflow_run(
        &self,
        owner: &str,
        repo: &str,
        run_id: i64,
    ) -> Result<WorkflowRun, GitHubError> {
        self.get_json(
            "get workflow run",
            &format!("repos/{owner}/{repo}/actions/runs/{run_id}"),
            &[],
        )
    }

    pub fn list_artifacts(
        &self,
        owner: &str,
        repo: &str,
        run_id: i64,
    ) -> Result<ArtifactList, GitHubError> {
        self.get_json(
            "list artifacts",
            &format!("repos/{owner}/{repo}/actions/runs/{run_id}/artifacts"),
            &[],
        )
    }

    pub fn get_pull_request(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
    ) -> Result<PullRequest, GitHubError> {
        self.get_json(
            "get pull request",
            &format!("repos/{owner}/{repo}/pulls/{number}"),
            &[],
        )
    }

    /// Downloads an artifact archive. The endpoint answers with a
    /// redirect to a signed storage URL which is fetched with one more
    /// tokenless request; the body read is capped at `max_bytes`.
    pub fn download_artifact(
        &self,
        owner: &str,
        repo: &str,
        artifact_id: i64,
        max_bytes: u64,
    ) -> Result<Vec<u8>, GitHubError> {
        let call = "download artifact";
        let url = self.endpoint(&format!(
            "repos/{owner}/{repo}/actions/artifacts/{artifact_id}/zip"
        ));
        let response = self
            .authorized(self.agent.get(&url))
            .call()
            .map_err(|err| request_error(call, err))?;

        if !(300..400).contains(&response.status()) {
            return Err(GitHubError::MissingRedirect);
        }
        let location = response
            .header("Location")
            .ok_or(GitHubError::MissingRedirect)?;
        let location = if location.starts_with('/') {
            self.endpoint(location.trim_start_matches('/'))
        } else {
            location.to_string()
        };

        let download = self
            .agent
            .get(&location)
            .call()
            .map_err(|err| request_error(call, err))?;

        let mut body = Vec::new();
        download
            .into_reader()
            .take(max_bytes)
            .read_to_end(&mut body)
            .map_err(|err| GitHubError::Request {
                call,
                reason: err.to_string(),
            })?;
        Ok(body)
    }

    fn authorized(&self, request: ureq::Request) -> ureq::Request {
        if self.token.is_empty() {
            request
        } else {
            request.set("Authorization", &format!("Bearer {}", self.token))
        }
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        call: &'static str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, GitHubError> {
        let mut url = self.endpoint(path);
        if !query.is_empty() {
            let encoded = query
                .iter()
                .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            url = format!("{url}?{encoded}");
        }

        let response = self
            .authorized(self.agent.get(&url))
            .call()
            .map_err(|err| request_error(call, err))?;
        response.into_json::<T>().map_err(|err| GitHubError::Decode {
            call,
            reason: err.to_string(),
        })
    }

    fn post_json<T: DeserializeOwned>(
        &self,
        call: &'static str,
        path: &str,
        body: Value,
    ) -> Result<T, GitHubError> {
        let url = self.endpoint(path);
        let response = self
            .authorized(self.agent.post(&url))
            .send_json(body)
            .map_err(|err| request_error(call, err))?;
        response.into_json::<T>().map_err(|err| GitHubError::Decode {
            call,
            reason: err.to_string(),
        })
    }
}

fn request_error(call: &'static str, err: ureq::Error) -> GitHubError {
    match err {
        ureq::Error::Status(status, response) => GitHubError::Status {
            call,
            status,
            body: response.into_string().unwrap_or_default(),
        },
        other => GitHubError::Request {
            call,
            reason: other.to_string(),
        },
    }
}

//! Derives `reflow.{owner,repo,ref,sha}` from a provider event payload
//! already present under the `github` key.

use serde_json::Value;

use crate::context::document::{get, set, Document};
use crate::context::error::ContextError;
use crate::context::Source;
use crate::github::GitHubClient;

pub struct EventSource<'a> {
    client: &'a GitHubClient,
}

impl<'a> EventSource<'a> {
    pub fn new(client: &'a GitHubClient) -> Self {
        Self { client }
    }
}

impl Source for EventSource<'_> {
    fn name(&self) -> String {
        "event".to_string()
    }

    fn build(&self, doc: &mut Document) -> Result<(), ContextError> {
        let event: String = get(doc, "github.event_name")?;
        let repository: String = get(doc, "github.repository")?;

        let parts: Vec<&str> = repository.split('/').collect();
        if parts.len() < 2 || parts[0].is_empty() || parts[1].is_empty() {
            return Err(ContextError::InvalidRepository { repository });
        }
        let (owner, repo) = (parts[0].to_string(), parts[1].to_string());

        set(doc, "reflow.owner", Value::String(owner.clone()));
        set(doc, "reflow.repo", Value::String(repo.clone()));

        let (head_ref, head_sha) = match event.as_str() {
            "push" => (
                get::<String>(doc, "github.ref")?,
                get::<String>(doc, "github.sha")?,
            ),
            "pull_request" => (
                get::<String>(doc, "github.event.pull_request.head.ref")?,
                get::<String>(doc, "github.event.pull_request.head.sha")?,
            ),
            "issue_comment" => self.pull_request_head(doc, &event, &owner, &repo)?,
            _ => return Err(ContextError::UnsupportedEvent { event }),
        };

        set(doc, "reflow.ref", Value::String(head_ref));
        set(doc, "reflow.sha", Value::String(head_sha));

        Ok(())
    }
}

impl EventSource<'_> {
    /// An issue comment only has a head when the issue is a pull
    /// request; the head ref and sha come from a remote lookup.
    fn pull_request_head(
        &self,
        doc: &Document,
        event: &str,
        owner: &str,
        repo: &str,
    ) -> Result<(String, String), ContextError> {
        let marker = get::<Document>(doc, "github.event.issue.pull_request")
            .map_err(|_| ContextError::NotPullRequest {
                event: event.to_string(),
            })?;
        if marker.is_empty() {
            return Err(ContextError::NotPullRequest {
                event: event.to_string(),
            });
        }

        let number: i64 = get(doc, "github.event.issue.number")?;
        let pull = self
            .client
            .get_pull_request(owner, repo, number)
            .map_err(|err| ContextError::PullRequestLookup {
                event: event.to_string(),
                reason: err.to_string(),
            })?;

        Ok((pull.head.git_ref, pull.head.sha))
    }
}

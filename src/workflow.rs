//! Compact workflow addressing: `owner/repo/.github/workflows/file@ref`.

use std::fmt;

const WORKFLOWS_MARKER: &str = "/.github/workflows/";

#[derive(Debug, thiserror::Error)]
pub enum ReferenceError {
    #[error("malformed workflow reference `{input}`: {reason}")]
    Malformed { input: String, reason: String },
}

/// Address of a remote workflow definition plus the branch or tag to run
/// it from. `branch` always carries an explicit `heads/` or `tags/`
/// prefix once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowReference {
    pub owner: String,
    pub repo: String,
    pub file: String,
    pub branch: String,
}

impl WorkflowReference {
    /// Parses `owner/repo/.github/workflows/file@ref`. A bare ref name
    /// gains a `heads/` prefix, so `parse(s).to_string() == s` only
    /// holds for inputs already prefixed with `heads/` or `tags/`.
    pub fn parse(input: &str) -> Result<Self, ReferenceError> {
        let malformed = |reason: &str| ReferenceError::Malformed {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let (repo_part, rest) = input
            .split_once(WORKFLOWS_MARKER)
            .ok_or_else(|| malformed("missing `/.github/workflows/` segment"))?;
        let (owner, repo) = repo_part
            .split_once('/')
            .ok_or_else(|| malformed("missing `owner/repo` prefix"))?;
        let (file, branch) = rest
            .split_once('@')
            .ok_or_else(|| malformed("missing `@ref` suffix"))?;

        if owner.is_empty() || repo.is_empty() {
            return Err(malformed("owner and repo must be non-empty"));
        }
        if repo.contains('/') {
            return Err(malformed("owner and repo must be single path segments"));
        }
        if file.is_empty() {
            return Err(malformed("workflow file must be non-empty"));
        }
        if branch.is_empty() {
            return Err(malformed("ref must be non-empty"));
        }

        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            file: file.to_string(),
            branch: normalize_branch(branch),
        })
    }
}

impl fmt::Display for WorkflowReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}{}{}@{}",
            self.owner, self.repo, WORKFLOWS_MARKER, self.file, self.branch
        )
    }
}

fn normalize_branch(branch: &str) -> String {
    if branch.starts_with("heads/") || branch.starts_with("tags/") {
        branch.to_string()
    } else {
        format!("heads/{branch}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_branch_gains_heads_prefix() {
        let reference =
            WorkflowReference::parse("octo/app/.github/workflows/deploy.yaml@master")
                .expect("parse");
        assert_eq!(reference.owner, "octo");
        assert_eq!(reference.repo, "app");
        assert_eq!(reference.file, "deploy.yaml");
        assert_eq!(reference.branch, "heads/master");
    }

    #[test]
    fn prefixed_refs_round_trip() {
        for input in [
            "octo/app/.github/workflows/deploy.yaml@heads/deploy/lab",
            "octo/app/.github/workflows/release.yaml@tags/v1.2.0",
        ] {
            let reference = WorkflowReference::parse(input).expect("parse");
            assert_eq!(reference.to_string(), input);
        }
    }

    #[test]
    fn malformed_references_are_rejected() {
        for input in [
            "octo/app/deploy.yaml@master",
            "octo/.github/workflows/deploy.yaml@master",
            "octo/app/.github/workflows/deploy.yaml",
            "octo/app/.github/workflows/@master",
            "octo/app/.github/workflows/deploy.yaml@",
            "/app/.github/workflows/deploy.yaml@master",
        ] {
            assert!(
                WorkflowReference::parse(input).is_err(),
                "expected `{input}` to be rejected"
            );
        }
    }
}

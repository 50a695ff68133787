use crate::template::TemplateError;

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("key `{path}` is missing")]
    KeyMissing { path: String },
    #[error("key `{path}` has invalid type: got {found}, want {expected}")]
    KeyTypeMismatch {
        path: String,
        expected: String,
        found: String,
    },
    #[error("empty key path")]
    EmptyPath,
    #[error("context source `{source_name}` canceled")]
    Canceled { source_name: String },
    #[error("context source `{source_name}` failed to list {dir}: {source}")]
    ListDir {
        source_name: String,
        dir: String,
        #[source]
        source: std::io::Error,
    },
    #[error("context source `{source_name}` failed to read {path}: {source}")]
    ReadFile {
        source_name: String,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("context source `{source_name}` failed to render {path}: {source}")]
    RenderFile {
        source_name: String,
        path: String,
        #[source]
        source: TemplateError,
    },
    #[error("context source `{source_name}` failed to parse {path}: {source}")]
    ParseFile {
        source_name: String,
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("event source: unsupported event type `{event}`")]
    UnsupportedEvent { event: String },
    #[error("event source: invalid repository `{repository}`")]
    InvalidRepository { repository: String },
    #[error("event source `{event}`: issue is not a pull request")]
    NotPullRequest { event: String },
    #[error("event source `{event}`: pull request lookup failed: {reason}")]
    PullRequestLookup { event: String, reason: String },
}

pub mod builder;
pub mod document;
pub mod error;
pub mod event;

pub use builder::{DirSource, FileSource, Pipeline, Source, RESERVED_KEYS};
pub use document::{delete, get, set, Document};
pub use error::ContextError;
pub use event::EventSource;

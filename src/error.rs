//! Errors surfaced by the library.
//!
//! Each variant maps to one failure class of the application: configuration problems are fatal at
//! startup, backend failures are reported to the action that triggered them, and
//! [Error::ProgramNotFound] stays distinguishable so callers can fall back to a default program.

use std::path::PathBuf;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or invalid process configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The language-model backend failed (network, auth, timeout, API error).
    #[error("backend error: {0}")]
    Backend(String),

    /// The backend replied, but the reply does not satisfy the output contract.
    #[error("malformed model output: {reason}\nGot reply:\n{reply}")]
    MalformedOutput { reason: String, reply: String },

    /// A label that is not part of the closed label vocabulary.
    #[error("label `{0}` is not in the label set")]
    UnknownLabel(String),

    /// No persisted program with this name.
    #[error("program not found: {}", path.display())]
    ProgramNotFound { name: String, path: PathBuf },

    /// A persisted program exists but cannot be restored.
    #[error("failed to load program `{name}`: {reason}")]
    ProgramLoad { name: String, reason: String },

    /// The labeled corpus could not be fetched or decoded.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// A prompt template could not be completed.
    #[error("prompt error: {0}")]
    Prompt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<async_openai::error::OpenAIError> for Error {
    fn from(err: async_openai::error::OpenAIError) -> Self {
        Error::Backend(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Dataset(err.to_string())
    }
}

impl From<crate::prompt::errors::UnfilledPlaceholders> for Error {
    fn from(err: crate::prompt::errors::UnfilledPlaceholders) -> Self {
        Error::Prompt(err.to_string())
    }
}

impl From<crate::prompt::errors::PlaceholderNotExist> for Error {
    fn from(err: crate::prompt::errors::PlaceholderNotExist) -> Self {
        Error::Prompt(err.to_string())
    }
}

impl Error {
    /// Whether the error only means "nothing persisted under that name".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ProgramNotFound { .. })
    }
}

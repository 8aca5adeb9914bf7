use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("unknown chunking strategy: {0}")]
    UnknownStrategy(String),

    #[error("embedding model {model} unavailable after {attempts} attempt(s): {reason}")]
    EmbeddingUnavailable {
        model: String,
        attempts: u32,
        reason: String,
    },

    #[error("model {model} drifted: expected {expected} dimensions, got {actual}")]
    ModelDrift {
        model: String,
        expected: usize,
        actual: usize,
    },

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("tokenizer unavailable: {0}")]
    Tokenizer(String),

    #[error("transient failure from {backend}: {details}")]
    Transient { backend: String, details: String },

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SweepError {
    /// Rate limits, timeouts and server-side failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient { .. } => true,
            Self::Http(error) => {
                error.is_timeout()
                    || error.is_connect()
                    || error
                        .status()
                        .is_some_and(|status| status.as_u16() == 429 || status.is_server_error())
            }
            _ => false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Chunking,
    Embedding,
    Indexing,
    Evaluating,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Chunking => "chunking",
            Self::Embedding => "embedding",
            Self::Indexing => "indexing",
            Self::Evaluating => "evaluating",
        };
        f.write_str(name)
    }
}

pub type Result<T, E = SweepError> = std::result::Result<T, E>;

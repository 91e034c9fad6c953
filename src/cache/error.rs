use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by cache configuration and storage.
///
/// The first group is fatal at construction time; `NotFound`, `InvalidKey`
/// and `Io` surface per request.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to create cache root {path}: {source}")]
    CreateRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cache path prefix {prefix:?} must start with '/'")]
    InvalidPrefix { prefix: String },

    #[error("missing required option: {name}")]
    MissingOption { name: &'static str },

    #[error("invalid value {value:?} for option {name}")]
    InvalidOption { name: String, value: String },

    #[error("invalid cache settings: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cache key {key:?} does not stay inside the cache root")]
    InvalidKey { key: String },

    #[error("nothing cached for key {key:?}")]
    NotFound { key: String },

    #[error("cache I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CacheError {
    /// Returns `true` for errors raised while building a configuration.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::CreateRoot { .. }
                | Self::InvalidPrefix { .. }
                | Self::MissingOption { .. }
                | Self::InvalidOption { .. }
                | Self::Json(_)
        )
    }
}

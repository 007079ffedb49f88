//! Loader configuration.

use selectin_core::{ConfigErrorKind, Error, Result};
use serde::{Deserialize, Serialize};

/// Default number of parent keys per secondary statement.
///
/// Keeps `IN` lists below the bound-parameter limits of common backends.
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// Default cap on loader path length.
pub const DEFAULT_MAX_PATH_LENGTH: usize = 32;

/// Engine-level tuning shared by every load of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Keys per secondary statement.
    pub chunk_size: usize,
    /// Expand composite-key `IN` into OR-of-ANDs when the dialect lacks
    /// row-value `IN`. When false that case is a configuration error.
    pub tuple_in_fallback: bool,
    /// Loader paths longer than this stop eager recursion with a warning.
    pub max_path_length: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            tuple_in_fallback: true,
            max_path_length: DEFAULT_MAX_PATH_LENGTH,
        }
    }
}

impl LoaderConfig {
    #[must_use]
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    #[must_use]
    pub fn tuple_in_fallback(mut self, enabled: bool) -> Self {
        self.tuple_in_fallback = enabled;
        self
    }

    #[must_use]
    pub fn max_path_length(mut self, length: usize) -> Self {
        self.max_path_length = length;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::config(
                ConfigErrorKind::InvalidOption,
                "chunk_size must be at least 1",
            ));
        }
        if self.max_path_length == 0 {
            return Err(Error::config(
                ConfigErrorKind::InvalidOption,
                "max_path_length must be at least 1",
            ));
        }
        Ok(())
    }
}

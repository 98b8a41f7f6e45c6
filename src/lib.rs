pub mod chunking;
pub mod database;
pub mod document;
pub mod embeddings;
pub mod error;
pub mod gemini;
pub mod rag;

pub use error::{FailureKind, RagError, Result};

use std::env;
use std::fmt::Display;
use std::str::FromStr;

/// Read and parse an optional environment variable
pub(crate) fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| RagError::InvalidConfig(format!("{}={:?}: {}", name, value, e))),
        _ => Ok(None),
    }
}

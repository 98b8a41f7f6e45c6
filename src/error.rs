use thiserror::Error;

/// Errors produced by the retrieval pipeline
#[derive(Debug, Error)]
pub enum RagError {
    #[error("unsupported document format: {0}. Only text, markdown and PDF files are supported")]
    UnsupportedFormat(String),

    #[error("no text extracted from {0} (possibly a scanned image)")]
    EmptyExtraction(String),

    #[error("embedding failed: {0}")]
    EmbeddingFailed(#[source] Box<RagError>),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error(
        "store was built with the {stored} backend ({stored_dimension} dims) but the active backend is {active} ({active_dimension} dims); clear the store to re-index"
    )]
    IncompatibleStore {
        stored: String,
        stored_dimension: usize,
        active: String,
        active_dimension: usize,
    },

    #[error("vector store is corrupted: {0}")]
    StoreCorruption(String),

    #[error("vector store is empty")]
    EmptyStore,

    #[error("missing API credential: {0} is not set")]
    MissingCredential(&'static str),

    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("API request failed: {status} {message}")]
    Api { status: u16, message: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("PDF extraction failed: {0}")]
    Pdf(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, RagError>;

/// Broad failure category surfaced to users
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Credential,
    EmptyStore,
    RateLimit,
    Other,
}

impl RagError {
    /// Wrap a provider error raised while embedding documents
    pub fn embedding(err: RagError) -> Self {
        match err {
            already @ RagError::EmbeddingFailed(_) => already,
            other => RagError::EmbeddingFailed(Box::new(other)),
        }
    }

    /// Classify the error so callers can tell the user what to fix
    pub fn kind(&self) -> FailureKind {
        match self {
            RagError::MissingCredential(_) => FailureKind::Credential,
            RagError::Api { status, .. } if *status == 401 || *status == 403 => {
                FailureKind::Credential
            }
            RagError::RateLimited(_) => FailureKind::RateLimit,
            RagError::EmptyStore => FailureKind::EmptyStore,
            RagError::EmbeddingFailed(inner) => inner.kind(),
            _ => FailureKind::Other,
        }
    }

    /// Guidance text for the failure categories users can act on
    pub fn hint(&self) -> Option<&'static str> {
        match self.kind() {
            FailureKind::Credential => {
                Some("Set GEMINI_API_KEY in your environment or .env file. Get a key at https://aistudio.google.com")
            }
            FailureKind::EmptyStore => {
                Some("Add some documents first with `ingest` (supported formats: PDF, Markdown, text).")
            }
            FailureKind::RateLimit => Some("Rate limit hit. Wait about a minute before trying again."),
            FailureKind::Other => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_sees_through_embedding_failure() {
        let err = RagError::embedding(RagError::RateLimited("quota".to_string()));
        assert_eq!(err.kind(), FailureKind::RateLimit);
        assert!(err.hint().is_some());

        // Wrapping twice keeps a single layer
        let err = RagError::embedding(err);
        match err {
            RagError::EmbeddingFailed(inner) => {
                assert!(matches!(*inner, RagError::RateLimited(_)))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_credential_errors() {
        assert_eq!(
            RagError::MissingCredential("GEMINI_API_KEY").kind(),
            FailureKind::Credential
        );
        let err = RagError::Api {
            status: 403,
            message: "API key not valid".to_string(),
        };
        assert_eq!(err.kind(), FailureKind::Credential);
        assert!(err.hint().unwrap().contains("GEMINI_API_KEY"));
    }

    #[test]
    fn test_other_errors_have_no_hint() {
        let err = RagError::UnsupportedFormat("application/zip".to_string());
        assert_eq!(err.kind(), FailureKind::Other);
        assert!(err.hint().is_none());
        assert_eq!(RagError::EmptyStore.kind(), FailureKind::EmptyStore);
    }
}

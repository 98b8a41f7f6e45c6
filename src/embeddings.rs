//! Embedding backends.
//!
//! Two interchangeable providers sit behind [`Embedder`]: the hosted Gemini API
//! and a local feature-hashing model that needs no network or credentials. The
//! choice is made once, when the store is opened, by [`EmbeddingBackend::resolve`].

use crate::error::Result;
use crate::gemini::{GeminiClient, GeminiConfig};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Representation of a vector embedding
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Embedding {
    pub values: Vec<f32>,
}

/// Which provider produced a set of embeddings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Gemini,
    Local,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Gemini => f.write_str("gemini"),
            BackendKind::Local => f.write_str("local"),
        }
    }
}

/// Maps text to fixed-length vectors
#[allow(async_fn_in_trait)]
pub trait Embedder {
    /// Embed chunks for storage
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Embedding>>;

    /// Embed a search query
    async fn embed_query(&self, text: &str) -> Result<Embedding>;

    /// Length of every vector this embedder produces
    fn dimension(&self) -> usize;

    fn kind(&self) -> BackendKind;
}

impl Embedder for GeminiClient {
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        self.embed_batch(texts).await
    }

    async fn embed_query(&self, text: &str) -> Result<Embedding> {
        self.get_embedding(text).await
    }

    fn dimension(&self) -> usize {
        self.config().embedding_dimension
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Gemini
    }
}

/// Local embeddings using feature hashing.
///
/// Each lower-cased alphanumeric token is hashed into one of `dimension`
/// buckets and the term-frequency vector is L2-normalized. The hash is a fixed
/// FNV-1a, so vectors stay identical across builds and persisted stores remain
/// searchable.
#[derive(Debug, Clone)]
pub struct LocalEmbedder {
    dimension: usize,
}

impl LocalEmbedder {
    pub fn new(dimension: usize) -> Self {
        LocalEmbedder {
            dimension: dimension.max(1),
        }
    }

    /// Generate embedding for text
    pub fn embed(&self, text: &str) -> Embedding {
        let mut values = vec![0.0f32; self.dimension];

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let bucket = (fnv1a(&token.to_lowercase()) % self.dimension as u64) as usize;
            values[bucket] += 1.0;
        }

        let norm: f32 = values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut values {
                *x /= norm;
            }
        }

        Embedding { values }
    }
}

fn fnv1a(token: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;

    token.bytes().fold(OFFSET, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(PRIME)
    })
}

impl Embedder for LocalEmbedder {
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        Ok(texts.iter().map(|text| self.embed(text)).collect())
    }

    async fn embed_query(&self, text: &str) -> Result<Embedding> {
        Ok(self.embed(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }
}

/// The embedding provider resolved for a store
#[derive(Debug, Clone)]
pub enum EmbeddingBackend {
    Gemini(GeminiClient),
    Local(LocalEmbedder),
}

impl EmbeddingBackend {
    /// Use Gemini when credentials are configured, otherwise the local model
    pub fn resolve(dimension: usize) -> Self {
        Self::resolve_with(GeminiConfig::from_env(), dimension)
    }

    pub fn resolve_with(gemini: Result<GeminiConfig>, dimension: usize) -> Self {
        match gemini {
            Ok(mut config) => {
                config.embedding_dimension = dimension;
                info!("Using Gemini embeddings ({})", config.embedding_model);
                EmbeddingBackend::Gemini(GeminiClient::new(config))
            }
            Err(e) => {
                warn!("Using local embeddings, Gemini unavailable: {}", e);
                EmbeddingBackend::Local(LocalEmbedder::new(dimension))
            }
        }
    }
}

impl Embedder for EmbeddingBackend {
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        match self {
            EmbeddingBackend::Gemini(client) => client.embed_documents(texts).await,
            EmbeddingBackend::Local(local) => local.embed_documents(texts).await,
        }
    }

    async fn embed_query(&self, text: &str) -> Result<Embedding> {
        match self {
            EmbeddingBackend::Gemini(client) => client.embed_query(text).await,
            EmbeddingBackend::Local(local) => local.embed_query(text).await,
        }
    }

    fn dimension(&self) -> usize {
        match self {
            EmbeddingBackend::Gemini(client) => client.dimension(),
            EmbeddingBackend::Local(local) => local.dimension(),
        }
    }

    fn kind(&self) -> BackendKind {
        match self {
            EmbeddingBackend::Gemini(_) => BackendKind::Gemini,
            EmbeddingBackend::Local(_) => BackendKind::Local,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::RagError;
    use std::cell::Cell;
    use std::collections::HashMap;

    /// Deterministic embedder for tests: pinned vectors for chosen texts,
    /// hashed vectors otherwise, and an optional failure on the n-th call
    pub struct StubEmbedder {
        inner: LocalEmbedder,
        pinned: HashMap<String, Vec<f32>>,
        fail_on_call: Option<usize>,
        calls: Cell<usize>,
        pub kind: BackendKind,
    }

    impl StubEmbedder {
        pub fn new(dimension: usize) -> Self {
            StubEmbedder {
                inner: LocalEmbedder::new(dimension),
                pinned: HashMap::new(),
                fail_on_call: None,
                calls: Cell::new(0),
                kind: BackendKind::Local,
            }
        }

        pub fn pin(mut self, text: &str, values: Vec<f32>) -> Self {
            self.pinned.insert(text.to_string(), values);
            self
        }

        /// Fail the n-th (1-based) call to the embedder
        pub fn failing_on(mut self, call: usize) -> Self {
            self.fail_on_call = Some(call);
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.get()
        }

        fn tick(&self) -> Result<()> {
            let call = self.calls.get() + 1;
            self.calls.set(call);
            if self.fail_on_call == Some(call) {
                return Err(RagError::RateLimited("stub quota exhausted".to_string()));
            }
            Ok(())
        }

        fn vector(&self, text: &str) -> Embedding {
            match self.pinned.get(text) {
                Some(values) => Embedding {
                    values: values.clone(),
                },
                None => self.inner.embed(text),
            }
        }
    }

    impl Embedder for StubEmbedder {
        async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Embedding>> {
            self.tick()?;
            Ok(texts.iter().map(|text| self.vector(text)).collect())
        }

        async fn embed_query(&self, text: &str) -> Result<Embedding> {
            self.tick()?;
            Ok(self.vector(text))
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        fn kind(&self) -> BackendKind {
            self.kind
        }
    }
}

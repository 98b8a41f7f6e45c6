use crate::database::{SearchResult, VectorStore};
use crate::document::{list_documents, DocumentLoader};
use crate::embeddings::Embedder;
use crate::error::{RagError, Result};
use crate::gemini::GeminiClient;
use log::{info, warn};
use serde::Serialize;
use std::path::Path;

pub const DEFAULT_TOP_K: usize = 3;

/// Citation for one retrieved chunk
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRef {
    pub source: String,
    pub chunk: usize,
    /// Cosine similarity rounded to 4 decimal places
    pub relevance_score: f64,
}

/// Formatted context for the answer generator plus the matching citations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievedContext {
    pub context: String,
    pub sources: Vec<SourceRef>,
}

/// Retriever bound to one vector store
pub struct Retriever<'a, E> {
    store: &'a VectorStore<E>,
    k: usize,
}

impl<'a, E: Embedder> Retriever<'a, E> {
    pub fn new(store: &'a VectorStore<E>, k: usize) -> Self {
        Retriever { store, k }
    }

    /// Search the store and format the hits as ranked snippets.
    ///
    /// No hits gives an empty context and no sources; deciding what to do
    /// without context is up to the caller.
    pub async fn retrieve_context(&self, query: &str) -> Result<RetrievedContext> {
        let results = self.store.search(query, self.k).await?;
        Ok(format_context(&results))
    }
}

/// Label each result with its 1-based rank and source, separated by blank lines
pub fn format_context(results: &[SearchResult]) -> RetrievedContext {
    let mut snippets = Vec::with_capacity(results.len());
    let mut sources = Vec::with_capacity(results.len());

    for (rank, result) in results.iter().enumerate() {
        snippets.push(format!(
            "--- Snippet {} (from {}) ---\n{}",
            rank + 1,
            result.metadata.source,
            result.text
        ));
        sources.push(SourceRef {
            source: result.metadata.source.clone(),
            chunk: result.metadata.chunk_index,
            relevance_score: round_score(result.score),
        });
    }

    RetrievedContext {
        context: snippets.join("\n\n"),
        sources,
    }
}

fn round_score(score: f32) -> f64 {
    (f64::from(score) * 10_000.0).round() / 10_000.0
}

/// Turns retrieved context and a question into an answer
#[allow(async_fn_in_trait)]
pub trait AnswerGenerator {
    async fn generate(&self, context: &str, question: &str) -> Result<String>;
}

impl AnswerGenerator for GeminiClient {
    async fn generate(&self, context: &str, question: &str) -> Result<String> {
        self.generate_answer(context, question).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
    pub sources: Vec<SourceRef>,
}

/// Generated answer with the chunks it was based on
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<SourceRef>,
}

/// Result of ingesting one file
#[derive(Debug)]
pub enum FileOutcome {
    Added { file: String, chunks: usize },
    Failed { file: String, error: RagError },
}

/// Per-file results of an ingest call
#[derive(Debug, Default)]
pub struct IngestReport {
    pub outcomes: Vec<FileOutcome>,
}

impl IngestReport {
    pub fn total_chunks(&self) -> usize {
        self.outcomes
            .iter()
            .map(|outcome| match outcome {
                FileOutcome::Added { chunks, .. } => *chunks,
                FileOutcome::Failed { .. } => 0,
            })
            .sum()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome, FileOutcome::Added { .. }))
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &RagError)> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            FileOutcome::Failed { file, error } => Some((file.as_str(), error)),
            FileOutcome::Added { .. } => None,
        })
    }
}

/// Number of chunks to retrieve, from `RAG_TOP_K` or the default
pub fn top_k_from_env() -> Result<usize> {
    Ok(crate::env_parse("RAG_TOP_K")?.unwrap_or(DEFAULT_TOP_K))
}

/// Load and index files or directories one file at a time; a failing file never stops the rest
pub async fn ingest_paths<E: Embedder, P: AsRef<Path>>(
    store: &mut VectorStore<E>,
    loader: &DocumentLoader,
    paths: &[P],
) -> IngestReport {
    let mut report = IngestReport::default();

    for path in paths {
        let path = path.as_ref();
        if path.is_dir() {
            match list_documents(path) {
                Ok(files) => {
                    for file in files {
                        report.outcomes.push(ingest_file(store, loader, &file).await);
                    }
                }
                Err(error) => {
                    warn!("Cannot read directory {}: {}", path.display(), error);
                    report.outcomes.push(FileOutcome::Failed {
                        file: path.display().to_string(),
                        error,
                    });
                }
            }
        } else {
            report.outcomes.push(ingest_file(store, loader, path).await);
        }
    }

    info!(
        "Added {} chunks from {} file(s), {} failed",
        report.total_chunks(),
        report.succeeded(),
        report.outcomes.len() - report.succeeded()
    );
    report
}

async fn ingest_file<E: Embedder>(
    store: &mut VectorStore<E>,
    loader: &DocumentLoader,
    path: &Path,
) -> FileOutcome {
    let file = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let result = match loader.load(path) {
        Ok(records) => store.add_documents(records).await,
        Err(error) => Err(error),
    };

    match result {
        Ok(chunks) => {
            info!("{} -> {} chunks", file, chunks);
            FileOutcome::Added { file, chunks }
        }
        Err(error) => {
            warn!("{}: {}", file, error);
            FileOutcome::Failed { file, error }
        }
    }
}

/// A user's working session: the store it is bound to, the generator and the chat history
pub struct ChatSession<E, G> {
    store: VectorStore<E>,
    generator: G,
    loader: DocumentLoader,
    top_k: usize,
    history: Vec<ChatTurn>,
}

impl<E: Embedder, G: AnswerGenerator> ChatSession<E, G> {
    pub fn new(store: VectorStore<E>, generator: G, loader: DocumentLoader, top_k: usize) -> Self {
        ChatSession {
            store,
            generator,
            loader,
            top_k,
            history: Vec::new(),
        }
    }

    pub fn store(&self) -> &VectorStore<E> {
        &self.store
    }

    pub fn history(&self) -> &[ChatTurn] {
        &self.history
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn set_top_k(&mut self, top_k: usize) {
        self.top_k = top_k;
    }

    /// Load and index files or directories; see [`ingest_paths`]
    pub async fn ingest<P: AsRef<Path>>(&mut self, paths: &[P]) -> IngestReport {
        ingest_paths(&mut self.store, &self.loader, paths).await
    }

    /// Answer a question from the indexed documents and record the exchange
    pub async fn ask(&mut self, question: &str) -> Result<Answer> {
        if self.store.is_empty() {
            return Err(RagError::EmptyStore);
        }

        self.history.push(ChatTurn {
            role: Role::User,
            content: question.to_string(),
            sources: Vec::new(),
        });

        let retrieved = Retriever::new(&self.store, self.top_k)
            .retrieve_context(question)
            .await?;
        let answer = self
            .generator
            .generate(&retrieved.context, question)
            .await?;

        self.history.push(ChatTurn {
            role: Role::Assistant,
            content: answer.clone(),
            sources: retrieved.sources.clone(),
        });

        Ok(Answer {
            answer,
            sources: retrieved.sources,
        })
    }

    /// Empty the store and forget the conversation
    pub fn reset(&mut self) -> Result<()> {
        self.store.clear_store()?;
        self.history.clear();
        Ok(())
    }
}

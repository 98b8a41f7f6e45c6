use crate::document::ChunkRecord;
use crate::embeddings::{BackendKind, Embedder};
use crate::error::{RagError, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const DEFAULT_DIMENSION: usize = 768; // Default dimension for most embedding models
pub const DEFAULT_BATCH_SIZE: usize = 16;
const DEFAULT_STORE_DIR: &str = "./rag_store";

const EMBEDDINGS_FILE: &str = "embeddings.bin";
const METADATA_FILE: &str = "meta.json";
const TEXTS_FILE: &str = "texts.json";
const MANIFEST_FILE: &str = "store.json";

const MAGIC: &[u8; 4] = b"RAGV";
const FORMAT_VERSION: u32 = 1;
// magic, version, rows, dimension
const HEADER_LEN: usize = 4 + 4 + 8 + 4;

const EPSILON: f32 = 1e-8;

/// Configuration for the vector store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the persisted store
    pub dir: PathBuf,
    /// Embedding dimension D, fixed for the lifetime of a store
    pub dimension: usize,
    /// Number of chunks sent to the embedder per request
    pub batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            dir: PathBuf::from(DEFAULT_STORE_DIR),
            dimension: DEFAULT_DIMENSION,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl StoreConfig {
    /// Create a new configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = StoreConfig::default();
        Ok(StoreConfig {
            dir: crate::env_parse("RAG_STORE_DIR")?.unwrap_or(defaults.dir),
            dimension: crate::env_parse("RAG_EMBEDDING_DIM")?.unwrap_or(defaults.dimension),
            batch_size: crate::env_parse("RAG_BATCH_SIZE")?.unwrap_or(defaults.batch_size),
        })
    }
}

/// Metadata stored for every chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub source: String,
    pub chunk_index: usize,
}

/// A stored chunk scored against a query
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub text: String,
    pub metadata: ChunkMetadata,
    pub score: f32,
}

/// Summary of what the store holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub chunks: usize,
    /// Chunk count per source file
    pub sources: BTreeMap<String, usize>,
    pub backend: BackendKind,
    pub dimension: usize,
}

/// Records which backend produced the persisted embeddings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Manifest {
    backend: BackendKind,
    dimension: usize,
    count: usize,
}

/// Exact-search vector store persisted as parallel files.
///
/// `texts`, `metadata` and the rows of `embeddings` are index-aligned: position
/// `i` in each refers to the same chunk. Every mutation rewrites all files.
pub struct VectorStore<E> {
    config: StoreConfig,
    embedder: E,
    texts: Vec<String>,
    metadata: Vec<ChunkMetadata>,
    /// Row-major N x D matrix
    embeddings: Vec<f32>,
    /// Backend and dimension of the persisted rows
    manifest: Manifest,
}

impl<E: Embedder> VectorStore<E> {
    /// Open the store in `config.dir`, loading persisted state if present
    pub fn open(config: StoreConfig, embedder: E) -> Result<Self> {
        if config.dimension == 0 {
            return Err(RagError::InvalidConfig(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }
        if config.batch_size == 0 {
            return Err(RagError::InvalidConfig(
                "batch size must be greater than zero".to_string(),
            ));
        }
        if embedder.dimension() != config.dimension {
            return Err(RagError::InvalidConfig(format!(
                "embedder produces {} dimensions but the store is configured for {}",
                embedder.dimension(),
                config.dimension
            )));
        }

        fs::create_dir_all(&config.dir)?;

        let current = Manifest {
            backend: embedder.kind(),
            dimension: embedder.dimension(),
            count: 0,
        };
        let mut store = VectorStore {
            config,
            embedder,
            texts: Vec::new(),
            metadata: Vec::new(),
            embeddings: Vec::new(),
            manifest: current,
        };
        store.load()?;

        if store.is_empty() {
            store.manifest = current;
        } else if store.ensure_compatible().is_err() {
            warn!(
                "Store at {} was built with {} embeddings ({} dims); the active backend is {} ({} dims)",
                store.config.dir.display(),
                store.manifest.backend,
                store.manifest.dimension,
                current.backend,
                current.dimension
            );
        }

        info!(
            "Opened vector store at {} with {} chunks",
            store.config.dir.display(),
            store.len()
        );
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.embedder.dimension()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn embedder(&self) -> &E {
        &self.embedder
    }

    pub fn stats(&self) -> StoreStats {
        let mut sources = BTreeMap::new();
        for meta in &self.metadata {
            *sources.entry(meta.source.clone()).or_insert(0) += 1;
        }

        StoreStats {
            chunks: self.len(),
            sources,
            backend: self.manifest.backend,
            dimension: self.manifest.dimension,
        }
    }

    /// Embed and append records, then persist. Blank records are dropped.
    ///
    /// All batches are embedded before anything is appended, so a failure in
    /// any batch leaves the store exactly as it was. Returns the number of
    /// chunks added.
    pub async fn add_documents(&mut self, records: Vec<ChunkRecord>) -> Result<usize> {
        self.ensure_compatible()?;

        let records: Vec<ChunkRecord> = records
            .into_iter()
            .filter_map(|mut record| {
                let trimmed = record.content.trim();
                if trimmed.is_empty() {
                    return None;
                }
                record.content = trimmed.to_string();
                Some(record)
            })
            .collect();

        if records.is_empty() {
            debug!("No non-empty chunks to add");
            return Ok(0);
        }

        let texts: Vec<String> = records.iter().map(|r| r.content.clone()).collect();
        let dimension = self.dimension();
        let mut vectors = Vec::with_capacity(texts.len() * dimension);

        for (number, batch) in texts.chunks(self.config.batch_size).enumerate() {
            let embeddings = self
                .embedder
                .embed_documents(batch)
                .await
                .map_err(RagError::embedding)?;

            if embeddings.len() != batch.len() {
                return Err(RagError::embedding(RagError::Api {
                    status: 200,
                    message: format!(
                        "expected {} embeddings, got {}",
                        batch.len(),
                        embeddings.len()
                    ),
                }));
            }

            for embedding in embeddings {
                if embedding.values.len() != dimension {
                    return Err(RagError::DimensionMismatch {
                        expected: dimension,
                        actual: embedding.values.len(),
                    });
                }
                vectors.extend(embedding.values);
            }
            debug!("Embedded batch {} ({} chunks)", number + 1, batch.len());
        }

        let previous_len = self.len();
        let added = records.len();
        self.embeddings.extend(vectors);
        self.metadata
            .extend(records.into_iter().map(|record| ChunkMetadata {
                source: record.source,
                chunk_index: record.chunk_index,
            }));
        self.texts.extend(texts);

        if let Err(e) = self.save() {
            self.truncate(previous_len);
            return Err(e);
        }

        info!("Added {} chunks, store now holds {}", added, self.len());
        Ok(added)
    }

    /// Top-k stored chunks by cosine similarity to the query, best first.
    ///
    /// Equal scores keep insertion order. An empty store returns no results
    /// without calling the embedder.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchResult>> {
        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        self.ensure_compatible()?;

        let query = self.embedder.embed_query(query).await?;
        let dimension = self.dimension();
        if query.values.len() != dimension {
            return Err(RagError::DimensionMismatch {
                expected: dimension,
                actual: query.values.len(),
            });
        }

        let query_norm = norm(&query.values);
        let scores: Vec<f32> = self
            .embeddings
            .chunks_exact(dimension)
            .map(|row| dot(row, &query.values) / (norm(row) * query_norm + EPSILON))
            .collect();

        // sort_by is stable, so ties stay in insertion order
        let mut order: Vec<usize> = (0..scores.len()).collect();
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
        order.truncate(k);

        Ok(order
            .into_iter()
            .map(|i| SearchResult {
                text: self.texts[i].clone(),
                metadata: self.metadata[i].clone(),
                score: scores[i],
            })
            .collect())
    }

    /// Remove every chunk and persist the empty store
    pub fn clear_store(&mut self) -> Result<()> {
        let texts = std::mem::take(&mut self.texts);
        let metadata = std::mem::take(&mut self.metadata);
        let embeddings = std::mem::take(&mut self.embeddings);
        let manifest = self.manifest;

        self.manifest = Manifest {
            backend: self.embedder.kind(),
            dimension: self.embedder.dimension(),
            count: 0,
        };
        if let Err(e) = self.save() {
            self.texts = texts;
            self.metadata = metadata;
            self.embeddings = embeddings;
            self.manifest = manifest;
            return Err(e);
        }

        info!("Cleared vector store at {}", self.config.dir.display());
        Ok(())
    }

    fn ensure_compatible(&self) -> Result<()> {
        let backend = self.embedder.kind();
        let dimension = self.embedder.dimension();
        if self.is_empty()
            || (self.manifest.backend == backend && self.manifest.dimension == dimension)
        {
            return Ok(());
        }

        Err(RagError::IncompatibleStore {
            stored: self.manifest.backend.to_string(),
            stored_dimension: self.manifest.dimension,
            active: backend.to_string(),
            active_dimension: dimension,
        })
    }

    fn truncate(&mut self, len: usize) {
        self.texts.truncate(len);
        self.metadata.truncate(len);
        self.embeddings.truncate(len * self.manifest.dimension);
    }

    fn path(&self, file: &str) -> PathBuf {
        self.config.dir.join(file)
    }

    fn load(&mut self) -> Result<()> {
        let files = [EMBEDDINGS_FILE, METADATA_FILE, TEXTS_FILE, MANIFEST_FILE];
        let present = files
            .iter()
            .filter(|file| self.path(file).exists())
            .count();

        if present == 0 {
            debug!("No persisted store in {}", self.config.dir.display());
            return Ok(());
        }
        if present != files.len() {
            return Err(RagError::StoreCorruption(format!(
                "only {} of {} store files present in {}",
                present,
                files.len(),
                self.config.dir.display()
            )));
        }

        let manifest: Manifest = serde_json::from_slice(&fs::read(self.path(MANIFEST_FILE))?)?;
        let (rows, dimension, embeddings) = decode_embeddings(&fs::read(self.path(EMBEDDINGS_FILE))?)?;
        let metadata: Vec<ChunkMetadata> =
            serde_json::from_slice(&fs::read(self.path(METADATA_FILE))?)?;
        let texts: Vec<String> = serde_json::from_slice(&fs::read(self.path(TEXTS_FILE))?)?;

        if rows != metadata.len() || rows != texts.len() || rows != manifest.count {
            return Err(RagError::StoreCorruption(format!(
                "misaligned collections: {} embeddings, {} metadata entries, {} texts, manifest count {}",
                rows,
                metadata.len(),
                texts.len(),
                manifest.count
            )));
        }
        if dimension != manifest.dimension {
            return Err(RagError::StoreCorruption(format!(
                "embeddings have {} dimensions but the manifest records {}",
                dimension, manifest.dimension
            )));
        }

        self.manifest = manifest;
        self.embeddings = embeddings;
        self.metadata = metadata;
        self.texts = texts;
        Ok(())
    }

    /// Stage every file as a .tmp sibling, then rename them into place.
    ///
    /// A failure while staging leaves the previous files untouched.
    fn save(&mut self) -> Result<()> {
        let mut manifest = self.manifest;
        manifest.count = self.len();

        let files = [
            (
                EMBEDDINGS_FILE,
                encode_embeddings(&self.embeddings, self.len(), manifest.dimension),
            ),
            (METADATA_FILE, serde_json::to_vec_pretty(&self.metadata)?),
            (TEXTS_FILE, serde_json::to_vec_pretty(&self.texts)?),
            // Renamed last so a matching count means the other files landed
            (MANIFEST_FILE, serde_json::to_vec_pretty(&manifest)?),
        ];

        let mut staged = Vec::with_capacity(files.len());
        for (file, contents) in &files {
            let path = self.path(file);
            match stage(&path, contents) {
                Ok(tmp) => staged.push((tmp, path)),
                Err(e) => {
                    for (tmp, _) in &staged {
                        let _ = fs::remove_file(tmp);
                    }
                    return Err(e);
                }
            }
        }

        for (tmp, path) in &staged {
            fs::rename(tmp, path)?;
        }

        self.manifest = manifest;
        debug!("Persisted {} chunks to {}", self.len(), self.config.dir.display());
        Ok(())
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Write and sync `contents` to a .tmp sibling of `path`, returning the tmp path
fn stage(path: &Path, contents: &[u8]) -> Result<PathBuf> {
    let mut tmp: OsString = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = File::create(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(tmp)
}

fn encode_embeddings(values: &[f32], rows: usize, dimension: usize) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_LEN + values.len() * 4);
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&(rows as u64).to_le_bytes());
    bytes.extend_from_slice(&(dimension as u32).to_le_bytes());
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_embeddings(bytes: &[u8]) -> Result<(usize, usize, Vec<f32>)> {
    let corrupt = |reason: &str| RagError::StoreCorruption(format!("{}: {}", EMBEDDINGS_FILE, reason));

    if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
        return Err(corrupt("missing header"));
    }

    let mut u32_buf = [0u8; 4];
    let mut u64_buf = [0u8; 8];
    u32_buf.copy_from_slice(&bytes[4..8]);
    let version = u32::from_le_bytes(u32_buf);
    if version != FORMAT_VERSION {
        return Err(corrupt(&format!("unsupported format version {}", version)));
    }
    u64_buf.copy_from_slice(&bytes[8..16]);
    let rows = u64::from_le_bytes(u64_buf) as usize;
    u32_buf.copy_from_slice(&bytes[16..20]);
    let dimension = u32::from_le_bytes(u32_buf) as usize;

    let data = &bytes[HEADER_LEN..];
    let expected = rows
        .checked_mul(dimension)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| corrupt("header overflows"))?;
    if data.len() != expected {
        return Err(corrupt(&format!(
            "expected {} bytes of data for {}x{}, found {}",
            expected,
            rows,
            dimension,
            data.len()
        )));
    }

    let values = data
        .chunks_exact(4)
        .map(|chunk| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(chunk);
            f32::from_le_bytes(buf)
        })
        .collect();

    Ok((rows, dimension, values))
}

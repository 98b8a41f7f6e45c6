use crate::chunking::TextSplitter;
use crate::error::{RagError, Result};
use log::{debug, info, warn};
use mime_guess::from_path;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

/// Pulls the text of each page out of a PDF file
pub type PageExtractor = fn(&Path) -> std::result::Result<Vec<String>, String>;

fn pdf_extract_pages(path: &Path) -> std::result::Result<Vec<String>, String> {
    pdf_extract::extract_text_by_pages(path).map_err(|e| e.to_string())
}

/// A chunk of a source file, ready to be embedded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub content: String,
    /// File name the chunk came from
    pub source: String,
    /// 0-based position of the chunk within its source file
    pub chunk_index: usize,
}

/// How text is pulled out of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Text,
    Pdf,
}

impl DocumentKind {
    /// Classify a file by the MIME type guessed from its extension
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mime = from_path(path.as_ref()).first_or_octet_stream();
        debug!("Detected MIME type: {}", mime);

        match mime.essence_str() {
            "application/pdf" => Ok(DocumentKind::Pdf),
            "text/plain" | "text/markdown" | "text/x-markdown" => Ok(DocumentKind::Text),
            other => Err(RagError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Represents a document with its content and metadata
#[derive(Debug, Clone)]
pub struct Document {
    /// The extracted text content of the document
    pub content: String,
    /// The document's file name
    pub source: String,
    pub kind: DocumentKind,
}

impl Document {
    /// Create a new document from a file path
    pub fn from_file<P: AsRef<Path>>(file_path: P) -> Result<Self> {
        Self::from_file_with(file_path, pdf_extract_pages)
    }

    /// Like [`Document::from_file`], with a custom PDF page extractor
    pub fn from_file_with<P: AsRef<Path>>(file_path: P, pdf_pages: PageExtractor) -> Result<Self> {
        let path = file_path.as_ref();
        let source = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| RagError::InvalidConfig(format!("not a file: {}", path.display())))?;

        let kind = DocumentKind::from_path(path)?;
        let content = read_with(path, kind, pdf_pages)?;

        Ok(Document {
            content,
            source,
            kind,
        })
    }
}

/// Read content from a document based on its kind
pub fn read_document_content<P: AsRef<Path>>(file_path: P, kind: DocumentKind) -> Result<String> {
    read_with(file_path.as_ref(), kind, pdf_extract_pages)
}

fn read_with(path: &Path, kind: DocumentKind, pdf_pages: PageExtractor) -> Result<String> {
    match kind {
        DocumentKind::Pdf => {
            info!("Processing PDF document: {}", path.display());
            let pages: Vec<String> = extract_pages(path, pdf_pages)?
                .iter()
                .map(|page| normalize_whitespace(page))
                .collect();
            join_pages(&pages, path)
        }

        DocumentKind::Text => {
            info!("Processing text document: {}", path.display());
            let bytes = fs::read(path)?;
            Ok(decode_text(bytes, path))
        }
    }
}

/// Run the extractor, turning both its errors and its panics into `RagError::Pdf`
fn extract_pages<F, E>(path: &Path, extract: F) -> Result<Vec<String>>
where
    F: FnOnce(&Path) -> std::result::Result<Vec<String>, E>,
    E: fmt::Display,
{
    match panic::catch_unwind(AssertUnwindSafe(|| extract(path))) {
        Ok(Ok(pages)) => Ok(pages),
        Ok(Err(e)) => Err(RagError::Pdf(format!("{}: {}", path.display(), e))),
        Err(_) => {
            warn!("PDF extractor panicked on {}", path.display());
            Err(RagError::Pdf(format!("{}: extractor panicked", path.display())))
        }
    }
}

/// Prefix every page with a 1-based page marker; all-blank pages mean nothing was extracted
fn join_pages(pages: &[String], path: &Path) -> Result<String> {
    if pages.iter().all(|page| page.trim().is_empty()) {
        return Err(RagError::EmptyExtraction(path.display().to_string()));
    }

    let mut content = String::new();
    for (number, page) in pages.iter().enumerate() {
        content.push_str(&format!("\n--- Page {} ---\n", number + 1));
        content.push_str(page);
    }
    Ok(content)
}

/// Decode as UTF-8, falling back to Latin-1 where every byte is its own code point
fn decode_text(bytes: Vec<u8>, path: &Path) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => {
            warn!(
                "{} is not valid UTF-8, decoding as Latin-1",
                path.display()
            );
            e.into_bytes().iter().map(|&b| b as char).collect()
        }
    }
}

/// Normalize whitespace in text (remove multiple consecutive spaces, newlines, etc.)
fn normalize_whitespace(text: &str) -> String {
    let result = text.replace('\r', "");

    // Collapse runs of newlines to at most a paragraph break
    let mut prev_char = ' ';
    let mut newline_count = 0;
    let mut normalized = String::with_capacity(result.len());

    for c in result.chars() {
        if c == '\n' {
            newline_count += 1;
        } else {
            if newline_count > 0 {
                if newline_count >= 2 {
                    normalized.push_str("\n\n");
                } else {
                    normalized.push('\n');
                }
                newline_count = 0;
            }

            if !(c == ' ' && prev_char == ' ') {
                normalized.push(c);
            }

            prev_char = c;
        }
    }

    normalized.trim().to_string()
}

/// Visible regular files in a directory, sorted by name
pub fn list_documents<P: AsRef<Path>>(directory: P) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(directory.as_ref())? {
        let path = entry?.path();
        let hidden = path
            .file_name()
            .map(|name| name.to_string_lossy().starts_with('.'))
            .unwrap_or(true);
        if path.is_file() && !hidden {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// One file that could not be loaded during a batch
#[derive(Debug)]
pub struct FileFailure {
    pub file: String,
    pub error: RagError,
}

/// Outcome of loading a whole directory
#[derive(Debug, Default)]
pub struct LoadReport {
    pub records: Vec<ChunkRecord>,
    pub failures: Vec<FileFailure>,
}

/// Turns files into chunk records
#[derive(Clone)]
pub struct DocumentLoader {
    splitter: TextSplitter,
    pdf_pages: PageExtractor,
}

impl fmt::Debug for DocumentLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentLoader")
            .field("splitter", &self.splitter)
            .finish_non_exhaustive()
    }
}

impl Default for DocumentLoader {
    fn default() -> Self {
        DocumentLoader::new(TextSplitter::default())
    }
}

impl DocumentLoader {
    pub fn new(splitter: TextSplitter) -> Self {
        DocumentLoader {
            splitter,
            pdf_pages: pdf_extract_pages,
        }
    }

    /// Replace the PDF page extractor
    pub fn with_pdf_extractor(mut self, pdf_pages: PageExtractor) -> Self {
        self.pdf_pages = pdf_pages;
        self
    }

    /// Load a single file and split it into chunk records
    pub fn load<P: AsRef<Path>>(&self, file_path: P) -> Result<Vec<ChunkRecord>> {
        let document = Document::from_file_with(file_path, self.pdf_pages)?;
        let records: Vec<ChunkRecord> = self
            .splitter
            .split_text(&document.content)
            .into_iter()
            .enumerate()
            .map(|(chunk_index, content)| ChunkRecord {
                content,
                source: document.source.clone(),
                chunk_index,
            })
            .collect();

        info!("Split {} into {} chunks", document.source, records.len());
        Ok(records)
    }

    /// Load every visible file in a directory; failures are collected, never fatal
    pub fn load_all<P: AsRef<Path>>(&self, directory: P) -> Result<LoadReport> {
        let directory = directory.as_ref();
        let mut report = LoadReport::default();
        for path in list_documents(directory)? {
            let file = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();

            match self.load(&path) {
                Ok(records) => report.records.extend(records),
                Err(error) => {
                    warn!("Error processing {}: {}", file, error);
                    report.failures.push(FileFailure { file, error });
                }
            }
        }

        info!(
            "Loaded {} chunks from {}, {} file(s) failed",
            report.records.len(),
            directory.display(),
            report.failures.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_whitespace() {
        let text = "This  has   multiple    spaces.\n\n\nAnd multiple newlines.\r\nAnd Windows line endings.";
        let expected =
            "This has multiple spaces.\n\nAnd multiple newlines.\nAnd Windows line endings.";
        assert_eq!(normalize_whitespace(text), expected);
    }

    #[test]
    fn test_document_kind() {
        assert_eq!(DocumentKind::from_path("notes.md").unwrap(), DocumentKind::Text);
        assert_eq!(DocumentKind::from_path("notes.txt").unwrap(), DocumentKind::Text);
        assert_eq!(DocumentKind::from_path("paper.pdf").unwrap(), DocumentKind::Pdf);
        assert!(matches!(
            DocumentKind::from_path("archive.zip"),
            Err(RagError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            DocumentKind::from_path("no_extension"),
            Err(RagError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_load_tags_chunks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guide.md");
        fs::write(&path, "First paragraph here.\n\nSecond paragraph here.").unwrap();

        let loader = DocumentLoader::new(TextSplitter::new(25, 5).unwrap());
        let records = loader.load(&path).unwrap();

        assert_eq!(records.len(), 2);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.source, "guide.md");
            assert_eq!(record.chunk_index, i);
        }
        assert_eq!(records[1].content, "Second paragraph here.");
    }

    #[test]
    fn test_latin1_fallback() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("legacy.txt");
        fs::write(&path, [b'c', b'a', b'f', 0xE9]).unwrap();

        let document = Document::from_file(&path).unwrap();
        assert_eq!(document.content, "café");
        assert_eq!(document.source, "legacy.txt");
    }

    #[test]
    fn test_load_all_skips_failures() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.md"), "alpha document").unwrap();
        fs::write(dir.path().join("b.txt"), "beta document").unwrap();
        fs::write(dir.path().join("c.zip"), "not really a zip").unwrap();
        fs::write(dir.path().join(".hidden.md"), "ignored").unwrap();

        let loader = DocumentLoader::default();
        let report = loader.load_all(dir.path()).unwrap();

        let sources: Vec<&str> = report.records.iter().map(|r| r.source.as_str()).collect();
        assert_eq!(sources, vec!["a.md", "b.txt"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].file, "c.zip");
        assert!(matches!(
            report.failures[0].error,
            RagError::UnsupportedFormat(_)
        ));
    }

    #[test]
    fn test_join_pages() {
        let path = Path::new("paper.pdf");
        let pages = |texts: &[&str]| texts.iter().map(|t| t.to_string()).collect::<Vec<_>>();

        assert!(matches!(
            join_pages(&pages(&["", "  \n "]), path),
            Err(RagError::EmptyExtraction(_))
        ));
        assert_eq!(
            join_pages(&pages(&["one", "two"]), path).unwrap(),
            "\n--- Page 1 ---\none\n--- Page 2 ---\ntwo"
        );
        assert_eq!(
            join_pages(&pages(&["one", "", "three"]), path).unwrap(),
            "\n--- Page 1 ---\none\n--- Page 2 ---\n\n--- Page 3 ---\nthree"
        );
    }

    #[test]
    fn test_extractor_panic_becomes_error() {
        let err = extract_pages(Path::new("broken.pdf"), |_| -> std::result::Result<Vec<String>, String> {
            panic!("missing font widths")
        })
        .unwrap_err();
        match err {
            RagError::Pdf(message) => assert_eq!(message, "broken.pdf: extractor panicked"),
            other => panic!("unexpected error: {other:?}"),
        }

        let err = extract_pages(Path::new("broken.pdf"), |_| Err("bad xref")).unwrap_err();
        assert!(matches!(err, RagError::Pdf(m) if m == "broken.pdf: bad xref"));
    }

    fn panicking_extractor(_: &Path) -> std::result::Result<Vec<String>, String> {
        panic!("unsupported encoding")
    }

    #[test]
    fn test_load_all_survives_extractor_panic() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.pdf"), "%PDF-1.4 truncated").unwrap();
        fs::write(dir.path().join("b.md"), "still loaded").unwrap();

        let loader = DocumentLoader::default().with_pdf_extractor(panicking_extractor);
        let report = loader.load_all(dir.path()).unwrap();

        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].source, "b.md");
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].file, "a.pdf");
        assert!(matches!(report.failures[0].error, RagError::Pdf(_)));
    }

    #[test]
    fn test_pdf_pages_are_marked() {
        fn two_pages(_: &Path) -> std::result::Result<Vec<String>, String> {
            Ok(vec!["Intro  text".to_string(), "Results\r\n".to_string()])
        }

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.pdf");
        fs::write(&path, "%PDF-1.4").unwrap();

        let document = Document::from_file_with(&path, two_pages).unwrap();
        assert_eq!(document.kind, DocumentKind::Pdf);
        assert_eq!(
            document.content,
            "\n--- Page 1 ---\nIntro text\n--- Page 2 ---\nResults"
        );
    }

    #[test]
    fn test_unsupported_single_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.zip");
        fs::write(&path, "bytes").unwrap();

        let loader = DocumentLoader::default();
        assert!(matches!(
            loader.load(&path),
            Err(RagError::UnsupportedFormat(_))
        ));
    }
}

use crate::error::{RagError, Result};
use log::debug;
use std::collections::VecDeque;
use std::ops::Range;

/// Default target chunk length in characters
pub const DEFAULT_CHUNK_SIZE: usize = 800;
/// Default overlap between consecutive chunks in characters
pub const DEFAULT_CHUNK_OVERLAP: usize = 100;

/// Break points in order of preference: paragraph, line, sentence, word, character
const SEPARATORS: [&str; 5] = ["\n\n", "\n", ". ", " ", ""];

/// Represents a text chunk with its position in the source text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// The actual text content of this chunk
    pub text: String,
    /// Character offset of this chunk in the original text
    pub start_position: usize,
}

/// Chunk sizing, measured in characters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitterConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        SplitterConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

impl SplitterConfig {
    /// Create a new configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let defaults = SplitterConfig::default();
        Ok(SplitterConfig {
            chunk_size: crate::env_parse("RAG_CHUNK_SIZE")?.unwrap_or(defaults.chunk_size),
            chunk_overlap: crate::env_parse("RAG_CHUNK_OVERLAP")?
                .unwrap_or(defaults.chunk_overlap),
        })
    }
}

/// A contiguous slice of the input, as a byte range plus its length in chars
#[derive(Debug, Clone)]
struct Piece {
    range: Range<usize>,
    chars: usize,
}

/// Recursive character splitter.
///
/// Text is cut at the coarsest separator that occurs in it; any piece still
/// longer than `chunk_size` is cut again with the next separator, down to single
/// characters. Separators stay attached to the piece before them, so every
/// chunk is an exact substring of the input. Fitting pieces are merged greedily
/// and each new chunk starts with the trailing pieces of the previous one, up to
/// `chunk_overlap` characters.
#[derive(Debug, Clone)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl Default for TextSplitter {
    fn default() -> Self {
        TextSplitter {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

impl TextSplitter {
    /// Create a new splitter; overlap must be smaller than the chunk size
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(RagError::InvalidConfig(
                "chunk size must be greater than zero".to_string(),
            ));
        }
        if chunk_overlap >= chunk_size {
            return Err(RagError::InvalidConfig(format!(
                "chunk overlap ({}) must be smaller than chunk size ({})",
                chunk_overlap, chunk_size
            )));
        }

        Ok(TextSplitter {
            chunk_size,
            chunk_overlap,
        })
    }

    pub fn from_config(config: SplitterConfig) -> Result<Self> {
        Self::new(config.chunk_size, config.chunk_overlap)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    /// Split text into ordered chunk strings
    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_with_offsets(text)
            .into_iter()
            .map(|chunk| chunk.text)
            .collect()
    }

    /// Split text into chunks, keeping each chunk's character offset
    pub fn split_with_offsets(&self, text: &str) -> Vec<TextChunk> {
        if text.is_empty() {
            return Vec::new();
        }

        let mut ranges = Vec::new();
        self.split_range(text, 0..text.len(), &SEPARATORS, &mut ranges);

        // Ranges come out in text order, so char offsets can be tracked incrementally
        let mut byte_cursor = 0;
        let mut char_cursor = 0;
        let chunks: Vec<TextChunk> = ranges
            .into_iter()
            .map(|range| {
                char_cursor += text[byte_cursor..range.start].chars().count();
                byte_cursor = range.start;
                TextChunk {
                    text: text[range].to_string(),
                    start_position: char_cursor,
                }
            })
            .collect();

        debug!(
            "Split {} chars into {} chunks (size {}, overlap {})",
            text.chars().count(),
            chunks.len(),
            self.chunk_size,
            self.chunk_overlap
        );

        chunks
    }

    fn split_range(
        &self,
        text: &str,
        range: Range<usize>,
        separators: &[&str],
        out: &mut Vec<Range<usize>>,
    ) {
        let slice = &text[range.clone()];

        // The empty separator always matches, so this only falls through on an empty list
        let position = separators
            .iter()
            .position(|sep| sep.is_empty() || slice.contains(sep))
            .unwrap_or(separators.len().saturating_sub(1));
        let separator = separators.get(position).copied().unwrap_or("");
        let finer = separators.get(position + 1..).unwrap_or(&[]);

        let mut fitting: Vec<Piece> = Vec::new();
        for piece in split_keeping_separator(slice, separator, range.start) {
            if piece.chars <= self.chunk_size {
                fitting.push(piece);
                continue;
            }

            if !fitting.is_empty() {
                self.merge_pieces(&fitting, out);
                fitting.clear();
            }

            if finer.is_empty() {
                out.push(piece.range);
            } else {
                self.split_range(text, piece.range, finer, out);
            }
        }

        if !fitting.is_empty() {
            self.merge_pieces(&fitting, out);
        }
    }

    fn merge_pieces(&self, pieces: &[Piece], out: &mut Vec<Range<usize>>) {
        let mut window: VecDeque<&Piece> = VecDeque::new();
        let mut total = 0;

        for piece in pieces {
            if total + piece.chars > self.chunk_size && !window.is_empty() {
                out.push(window_range(&window));

                // Keep a tail of the emitted chunk as overlap, as long as the next piece still fits
                while total > self.chunk_overlap
                    || (total + piece.chars > self.chunk_size && total > 0)
                {
                    match window.pop_front() {
                        Some(first) => total -= first.chars,
                        None => break,
                    }
                }
            }

            window.push_back(piece);
            total += piece.chars;
        }

        if !window.is_empty() {
            out.push(window_range(&window));
        }
    }
}

fn window_range(window: &VecDeque<&Piece>) -> Range<usize> {
    let start = window.front().map(|p| p.range.start).unwrap_or(0);
    let end = window.back().map(|p| p.range.end).unwrap_or(start);
    start..end
}

/// Split `slice` after every occurrence of `separator`; an empty separator yields single characters
fn split_keeping_separator(slice: &str, separator: &str, offset: usize) -> Vec<Piece> {
    if separator.is_empty() {
        return slice
            .char_indices()
            .map(|(i, c)| Piece {
                range: offset + i..offset + i + c.len_utf8(),
                chars: 1,
            })
            .collect();
    }

    let mut pieces = Vec::new();
    let mut start = 0;
    for (i, _) in slice.match_indices(separator) {
        let end = i + separator.len();
        pieces.push(Piece {
            range: offset + start..offset + end,
            chars: slice[start..end].chars().count(),
        });
        start = end;
    }
    if start < slice.len() {
        pieces.push(Piece {
            range: offset + start..offset + slice.len(),
            chars: slice[start..].chars().count(),
        });
    }

    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Rebuild the input by dropping the part of each chunk already covered by the previous one
    fn reconstruct(chunks: &[TextChunk]) -> String {
        let mut text = String::new();
        let mut covered = 0;
        for chunk in chunks {
            assert!(
                chunk.start_position <= covered,
                "gap before chunk at {}",
                chunk.start_position
            );
            let skip = covered - chunk.start_position;
            text.extend(chunk.text.chars().skip(skip));
            covered = covered.max(chunk.start_position + chunk.text.chars().count());
        }
        text
    }

    fn assert_bounds(chunks: &[TextChunk], size: usize, overlap: usize) {
        for chunk in chunks {
            assert!(
                chunk.text.chars().count() <= size,
                "chunk too long: {:?}",
                chunk.text
            );
        }
        for pair in chunks.windows(2) {
            let prev_end = pair[0].start_position + pair[0].text.chars().count();
            let shared = prev_end - pair[1].start_position;
            assert!(shared <= overlap, "chunks share {} chars", shared);
        }
    }

    #[test]
    fn test_short_sentences() {
        let splitter = TextSplitter::new(10, 3).unwrap();
        let text = "The cat sat. The dog ran.";
        let chunks = splitter.split_with_offsets(text);

        assert!(chunks.len() >= 2);
        assert_bounds(&chunks, 10, 3);
        assert_eq!(reconstruct(&chunks), text);
    }

    #[test]
    fn test_prefers_paragraph_boundaries() {
        let splitter = TextSplitter::new(12, 3).unwrap();
        let chunks = splitter.split_text("aaaa bbbb\n\ncccc dddd");
        assert_eq!(chunks, vec!["aaaa bbbb\n\n", "cccc dddd"]);
    }

    #[test]
    fn test_prefers_sentence_boundaries() {
        let splitter = TextSplitter::new(12, 0).unwrap();
        let chunks = splitter.split_text("One two. Three four. Five six.");
        assert_eq!(chunks, vec!["One two. ", "Three four. ", "Five six."]);
    }

    #[test]
    fn test_unbreakable_word_falls_back_to_characters() {
        let splitter = TextSplitter::new(5, 1).unwrap();
        let chunks = splitter.split_text("abcdefghijklmnop");
        assert_eq!(chunks, vec!["abcde", "efghi", "ijklm", "mnop"]);
    }

    #[test]
    fn test_coverage_and_bounds() {
        let text = "# Title\n\nFirst paragraph talks about vectors. It has two sentences.\n\
                    Second line of the same paragraph.\n\n\
                    Another paragraph with averyveryverylongwordthatcannotbebrokenanywhere inside.\n\
                    Ünïcödé text — with accents, ñ and emoji 🦀 — must survive too.";
        for (size, overlap) in [(20, 5), (40, 10), (64, 0), (7, 6), (800, 100)] {
            let splitter = TextSplitter::new(size, overlap).unwrap();
            let chunks = splitter.split_with_offsets(text);
            assert_bounds(&chunks, size, overlap);
            assert_eq!(reconstruct(&chunks), text, "size {size}, overlap {overlap}");
        }
    }

    #[test]
    fn test_small_text_is_single_chunk() {
        let splitter = TextSplitter::default();
        let chunks = splitter.split_with_offsets("just a short note");
        assert_eq!(
            chunks,
            vec![TextChunk {
                text: "just a short note".to_string(),
                start_position: 0,
            }]
        );
        assert!(splitter.split_text("").is_empty());
    }

    #[test]
    fn test_invalid_config() {
        assert!(TextSplitter::new(0, 0).is_err());
        assert!(TextSplitter::new(10, 10).is_err());
        let splitter = TextSplitter::from_config(SplitterConfig::default()).unwrap();
        assert_eq!(splitter.chunk_size(), 800);
        assert_eq!(splitter.chunk_overlap(), 100);
    }
}

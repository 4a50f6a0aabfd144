//! Semantic chunking with overlap.
//!
//! Text is cut into units at the coarsest boundary that makes them small
//! enough: paragraphs, then lines, then sentences, then words. Only a single
//! word longer than the unit limit is cut at an arbitrary character. Units are
//! then packed greedily into chunks, and every chunk after the first starts
//! `overlap` characters before the end of its predecessor.
//!
//! Offsets are counted in Unicode scalar values, not bytes.

use std::iter::Peekable;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use super::document::{sha256_hex, Document, DocumentId};
use crate::core::errors::RagError;

/// Boundary classes, coarsest first.
const BOUNDARIES: [&[&str]; 4] = [&["\n\n"], &["\n"], &[". ", "! ", "? "], &[" "]];

pub type ChunkId = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub document_id: DocumentId,
    pub origin: String,
    pub sequence: usize,
    /// Inclusive start, in characters
    pub start: usize,
    /// Exclusive end, in characters
    pub end: usize,
    pub text: String,
    pub text_sha256: String,
    /// Source page the chunk starts on, for paginated documents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
}

impl Chunk {
    pub fn make_id(document_id: &DocumentId, sequence: usize) -> ChunkId {
        format!("{}#{:05}", document_id, sequence)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    max_chunk_size: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(max_chunk_size: usize, overlap: usize) -> Result<Self, RagError> {
        if max_chunk_size == 0 {
            return Err(RagError::Configuration(
                "max_chunk_size must be greater than zero".to_string(),
            ));
        }
        if overlap >= max_chunk_size {
            return Err(RagError::Configuration(format!(
                "overlap ({}) must be smaller than max_chunk_size ({})",
                overlap, max_chunk_size
            )));
        }
        Ok(Self {
            max_chunk_size,
            overlap,
        })
    }

    pub fn chunks<'a>(&self, document: &'a Document) -> Chunks<'a> {
        Chunks {
            document,
            max_chunk_size: self.max_chunk_size,
            overlap: self.overlap,
            units: Units::new(&document.text, self.max_chunk_size - self.overlap).peekable(),
            next_start: 0,
            next_start_char: 0,
            consumed: 0,
            consumed_char: 0,
            sequence: 0,
        }
    }
}

/// Splits `document` lazily. Fails on invalid size parameters.
pub fn chunk(
    document: &Document,
    max_chunk_size: usize,
    overlap: usize,
) -> Result<Chunks<'_>, RagError> {
    Ok(Chunker::new(max_chunk_size, overlap)?.chunks(document))
}

/// Lazy, finite chunk sequence over one document.
pub struct Chunks<'a> {
    document: &'a Document,
    max_chunk_size: usize,
    overlap: usize,
    units: Peekable<Units<'a>>,
    next_start: usize,
    next_start_char: usize,
    consumed: usize,
    consumed_char: usize,
    sequence: usize,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        loop {
            self.units.peek()?;

            let start = self.next_start;
            let start_char = self.next_start_char;
            let fresh_from = self.consumed;
            let mut len = self.consumed_char - start_char;

            while let Some(unit) = self.units.peek() {
                if len + unit.chars > self.max_chunk_size {
                    break;
                }
                len += unit.chars;
                self.consumed = unit.range.end;
                self.consumed_char += unit.chars;
                self.units.next();
            }

            let text = &self.document.text;
            let end = self.consumed;
            let end_char = self.consumed_char;

            let (overlap_start, overlap_chars) = step_back(text, end, self.overlap);
            self.next_start = overlap_start;
            self.next_start_char = end_char - overlap_chars;

            if text[fresh_from..end].trim().is_empty() {
                continue;
            }

            let body = &text[start..end];
            let sequence = self.sequence;
            self.sequence += 1;

            return Some(Chunk {
                id: Chunk::make_id(&self.document.id, sequence),
                document_id: self.document.id.clone(),
                origin: self.document.origin.clone(),
                sequence,
                start: start_char,
                end: end_char,
                text: body.to_string(),
                text_sha256: sha256_hex(body),
                page: self.document.page_at(start_char),
            });
        }
    }
}

/// Byte offset `n` characters before `end`, and how many characters that is.
fn step_back(text: &str, end: usize, n: usize) -> (usize, usize) {
    if n == 0 {
        return (end, 0);
    }
    let mut taken = 0;
    let mut offset = end;
    for (idx, _) in text[..end].char_indices().rev().take(n) {
        offset = idx;
        taken += 1;
    }
    (offset, taken)
}

struct Unit {
    range: Range<usize>,
    chars: usize,
}

/// Depth-first splitter yielding contiguous units of at most `limit` chars.
struct Units<'a> {
    text: &'a str,
    limit: usize,
    stack: Vec<(Range<usize>, usize)>,
}

impl<'a> Units<'a> {
    fn new(text: &'a str, limit: usize) -> Self {
        let mut stack = Vec::new();
        if !text.is_empty() {
            stack.push((0..text.len(), 0));
        }
        Self { text, limit, stack }
    }
}

impl<'a> Iterator for Units<'a> {
    type Item = Unit;

    fn next(&mut self) -> Option<Unit> {
        while let Some((range, level)) = self.stack.pop() {
            let span = &self.text[range.clone()];
            let chars = span.chars().count();
            if chars <= self.limit {
                return Some(Unit { range, chars });
            }

            if let Some(separators) = BOUNDARIES.get(level) {
                let pieces = split_after_any(span, separators);
                for piece in pieces.into_iter().rev() {
                    self.stack
                        .push((range.start + piece.start..range.start + piece.end, level + 1));
                }
                continue;
            }

            let cuts: Vec<usize> = span
                .char_indices()
                .step_by(self.limit)
                .map(|(idx, _)| idx)
                .chain(std::iter::once(span.len()))
                .collect();
            for piece in cuts.windows(2).rev() {
                self.stack
                    .push((range.start + piece[0]..range.start + piece[1], level));
            }
        }
        None
    }
}

/// Splits after every occurrence of any separator, keeping it on the left.
///
/// Runs in one pass: each separator's next match is searched again only once
/// the cursor has moved past it.
fn split_after_any(text: &str, separators: &[&str]) -> Vec<Range<usize>> {
    let mut pieces = Vec::new();
    let mut next: Vec<Option<usize>> = separators.iter().map(|sep| text.find(sep)).collect();
    let mut start = 0;
    while start < text.len() {
        let mut end: Option<usize> = None;
        for (slot, sep) in next.iter_mut().zip(separators) {
            if matches!(*slot, Some(pos) if pos < start) {
                *slot = text[start..].find(sep).map(|pos| start + pos);
            }
            if let Some(pos) = *slot {
                let candidate = pos + sep.len();
                end = Some(end.map_or(candidate, |current| current.min(candidate)));
            }
        }
        match end {
            Some(end) => {
                pieces.push(start..end);
                start = end;
            }
            None => break,
        }
    }
    if start < text.len() {
        pieces.push(start..text.len());
    }
    pieces
}

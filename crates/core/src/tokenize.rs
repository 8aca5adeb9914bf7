//! BPE tokenization shared by the chunkers, the cost estimates and the
//! chunk statistics.
//!
//! Text is encoded with the cl100k vocabulary. Chunk offsets index into the
//! piece sequence returned by [`Tokenizer::pieces`], where a piece is one
//! BPE token, or the few tokens that together spell one character.

use crate::error::{Result, SweepError};
use std::ops::Range;
use std::sync::OnceLock;
use tiktoken_rs::{cl100k_base, CoreBPE};

pub fn normalize_whitespace(text: &str) -> String {
    text.replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct Tokenizer {
    bpe: CoreBPE,
}

static SHARED: OnceLock<std::result::Result<Tokenizer, String>> = OnceLock::new();

impl Tokenizer {
    pub fn cl100k() -> Result<Self> {
        cl100k_base()
            .map(|bpe| Self { bpe })
            .map_err(|error| SweepError::Tokenizer(error.to_string()))
    }

    pub fn shared() -> Result<&'static Self> {
        SHARED
            .get_or_init(|| Self::cl100k().map_err(|error| error.to_string()))
            .as_ref()
            .map_err(|reason| SweepError::Tokenizer(reason.clone()))
    }

    pub fn count(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }

    /// Decoded pieces in order; concatenated they give back `text`.
    pub fn pieces(&self, text: &str) -> Vec<String> {
        let mut pieces = Vec::new();
        let mut pending = Vec::new();

        for id in self.bpe.encode_ordinary(text) {
            pending.push(id);
            // A token can end inside a multi-byte character; keep it until
            // the following tokens complete the character.
            if let Ok(piece) = self.bpe.decode(pending.clone()) {
                pieces.push(piece);
                pending.clear();
            }
        }

        pieces
    }
}

pub fn count_tokens(text: &str) -> Result<usize> {
    Ok(Tokenizer::shared()?.count(text))
}

/// Chunk text for a run of pieces, without the leading space the first
/// piece usually carries.
pub fn join_pieces<S: AsRef<str>>(pieces: &[S]) -> String {
    pieces
        .iter()
        .map(AsRef::as_ref)
        .collect::<String>()
        .trim()
        .to_string()
}

const CLOSERS: &[char] = &['"', '\'', '\u{201d}', '\u{2019}', ')', ']'];

fn ends_sentence(piece: &str) -> bool {
    piece
        .trim_end()
        .trim_end_matches(CLOSERS)
        .ends_with(['.', '!', '?'])
}

fn only_closers(piece: &str) -> bool {
    let trimmed = piece.trim_end();
    !trimmed.is_empty()
        && !piece.starts_with(char::is_whitespace)
        && trimmed.chars().all(|character| CLOSERS.contains(&character))
}

/// Piece ranges of consecutive sentences. Quotes or brackets glued to a
/// terminator stay with the sentence they close; text after the last
/// terminator forms a final sentence.
pub fn split_sentences<S: AsRef<str>>(pieces: &[S]) -> Vec<Range<usize>> {
    let mut sentences: Vec<Range<usize>> = Vec::new();
    let mut start = 0;

    for (index, piece) in pieces.iter().enumerate() {
        let piece = piece.as_ref();
        if start == index && only_closers(piece) {
            if let Some(last) = sentences.last_mut().filter(|last| last.end == index) {
                last.end = index + 1;
                start = index + 1;
                continue;
            }
        }
        if ends_sentence(piece) {
            sentences.push(start..index + 1);
            start = index + 1;
        }
    }

    if start < pieces.len() {
        sentences.push(start..pieces.len());
    }

    sentences
}

/// Lowercase, strip punctuation and collapse whitespace. Used to locate a
/// reference answer inside chunk text.
pub fn normalize_for_match(text: &str) -> String {
    let stripped: String = text
        .chars()
        .map(|character| {
            if character.is_ascii_punctuation() {
                ' '
            } else {
                character
            }
        })
        .collect();
    normalize_whitespace(&stripped.to_lowercase())
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! RWKV World vocabulary tokenizer.
//!
//! The vocabulary file has one entry per line:
//!
//! ```text
//! <id> <python literal> <byte length>
//! 33 'A' 1
//! 256 b'\xe4\xbd' 2
//! ```
//!
//! Encoding walks a byte trie and always takes the longest entry that
//! matches at the current position.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{ChainError, Result};

/// Trie node stored in a flat arena; children are arena indices.
#[derive(Debug, Default)]
struct Node {
    /// Outgoing edges by byte.
    next: HashMap<u8, usize>,
    /// Token ending at this node.
    token: Option<u32>,
}

/// Longest-match tokenizer over an RWKV World vocabulary.
pub struct RwkvTokenizer {
    /// Node 0 is the root.
    nodes: Vec<Node>,
    /// Bytes of each token id; gaps in the file stay empty.
    pieces: Vec<Vec<u8>>,
}

impl std::fmt::Debug for RwkvTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwkvTokenizer")
            .field("vocab_size", &self.pieces.len())
            .field("trie_nodes", &self.nodes.len())
            .finish()
    }
}

impl RwkvTokenizer {
    /// Read a vocabulary file.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::TokenizerLoad`] if the file cannot be read or a
    /// line is malformed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ChainError::TokenizerLoad(format!("cannot read {}: {e}", path.display()))
        })?;
        let tok = Self::from_vocab_str(&text)?;
        tracing::info!(path = %path.display(), vocab_size = tok.vocab_size(), "RWKV vocabulary loaded");
        Ok(tok)
    }

    /// Build from vocabulary text.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::TokenizerLoad`] naming the first bad line.
    pub fn from_vocab_str(text: &str) -> Result<Self> {
        let mut tok = Self {
            nodes: vec![Node::default()],
            pieces: Vec::new(),
        };
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (id, bytes) = parse_vocab_line(line).map_err(|reason| {
                ChainError::TokenizerLoad(format!("vocabulary line {}: {reason}", lineno + 1))
            })?;
            tok.insert(id, bytes);
        }
        Ok(tok)
    }

    /// Add one entry to the trie and the id table.
    fn insert(&mut self, id: u32, bytes: Vec<u8>) {
        let mut at = 0;
        for &b in &bytes {
            let fresh = self.nodes.len();
            at = match self.nodes.get_mut(at) {
                Some(node) => *node.next.entry(b).or_insert(fresh),
                None => return,
            };
            if at == fresh {
                self.nodes.push(Node::default());
            }
        }
        if let Some(node) = self.nodes.get_mut(at) {
            node.token = Some(id);
        }

        let slot = usize::try_from(id).unwrap_or(usize::MAX);
        if slot >= self.pieces.len() {
            self.pieces.resize(slot.saturating_add(1), Vec::new());
        }
        if let Some(piece) = self.pieces.get_mut(slot) {
            *piece = bytes;
        }
    }

    /// Longest entry matching `src` from its start: `(token, byte length)`.
    fn longest_match(&self, src: &[u8]) -> Option<(u32, usize)> {
        let mut at = 0;
        let mut best = None;
        for (depth, b) in src.iter().enumerate() {
            let Some(&child) = self.nodes.get(at).and_then(|n| n.next.get(b)) else {
                break;
            };
            at = child;
            if let Some(token) = self.nodes.get(at).and_then(|n| n.token) {
                best = Some((token, depth + 1));
            }
        }
        best
    }

    /// Encode text by greedy longest match.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Tokenizer`] when some byte starts no entry.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let mut rest = text.as_bytes();
        let mut ids = Vec::with_capacity(rest.len() / 3 + 1);
        while !rest.is_empty() {
            let (token, len) = self.longest_match(rest).ok_or_else(|| {
                ChainError::Tokenizer(format!(
                    "no vocabulary entry starts with byte 0x{:02x} at offset {}",
                    rest.first().copied().unwrap_or_default(),
                    text.len() - rest.len()
                ))
            })?;
            ids.push(token);
            rest = rest.get(len..).unwrap_or_default();
        }
        Ok(ids)
    }

    /// Concatenated bytes of `ids`.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Tokenizer`] for an id outside the vocabulary.
    pub fn decode_bytes(&self, ids: &[u32]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for &id in ids {
            let piece = usize::try_from(id)
                .ok()
                .and_then(|i| self.pieces.get(i))
                .ok_or_else(|| {
                    ChainError::Tokenizer(format!(
                        "token {id} outside vocabulary of {}",
                        self.pieces.len()
                    ))
                })?;
            out.extend_from_slice(piece);
        }
        Ok(out)
    }

    /// Decode `ids` into UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Tokenizer`] for an unknown id or bytes that are
    /// not valid UTF-8 (e.g. a character split across a cut-off sequence).
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        String::from_utf8(self.decode_bytes(ids)?)
            .map_err(|e| ChainError::Tokenizer(format!("decoded bytes are not UTF-8: {e}")))
    }

    /// Number of id slots (highest id + 1).
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.pieces.len()
    }
}

// ---------------------------------------------------------------------------
// Vocabulary file parsing
// ---------------------------------------------------------------------------

/// Split `<id> <literal> <len>` and decode the literal.
fn parse_vocab_line(line: &str) -> std::result::Result<(u32, Vec<u8>), String> {
    let line = line.trim_end();
    let (id, rest) = line.split_once(' ').ok_or("missing literal")?;
    let (literal, len) = rest.rsplit_once(' ').ok_or("missing byte length")?;
    let id: u32 = id.parse().map_err(|e| format!("bad id '{id}': {e}"))?;
    let len: usize = len.parse().map_err(|e| format!("bad byte length '{len}': {e}"))?;
    let bytes = unescape_literal(literal)?;
    if bytes.len() != len {
        return Err(format!(
            "literal {literal} decodes to {} bytes, line declares {len}",
            bytes.len()
        ));
    }
    Ok((id, bytes))
}

/// Decode a Python `'str'`, `"str"` or `b'bytes'` literal.
///
/// In a `str` literal, `\xHH` is a code point and is UTF-8 encoded; in a
/// `bytes` literal it is the raw byte.
fn unescape_literal(literal: &str) -> std::result::Result<Vec<u8>, String> {
    let (raw, body) = match literal.strip_prefix('b') {
        Some(b) => (true, b),
        None => (false, literal),
    };
    let body = ['\'', '"']
        .into_iter()
        .find_map(|q| body.strip_prefix(q).and_then(|s| s.strip_suffix(q)))
        .ok_or_else(|| format!("not a quoted literal: {literal}"))?;

    let mut out = Vec::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            push_char(&mut out, c);
            continue;
        }
        let esc = chars.next().ok_or("dangling backslash")?;
        let simple = match esc {
            'n' => Some(b'\n'),
            't' => Some(b'\t'),
            'r' => Some(b'\r'),
            '0' => Some(0),
            'a' => Some(0x07),
            'b' => Some(0x08),
            'f' => Some(0x0c),
            'v' => Some(0x0b),
            '\\' | '\'' | '"' => u8::try_from(esc).ok(),
            _ => None,
        };
        if let Some(byte) = simple {
            out.push(byte);
            continue;
        }
        let width = match esc {
            'x' => 2,
            'u' => 4,
            'U' => 8,
            other => return Err(format!("unsupported escape \\{other}")),
        };
        let digits: String = chars.by_ref().take(width).collect();
        if digits.len() != width {
            return Err(format!("truncated \\{esc} escape"));
        }
        let value =
            u32::from_str_radix(&digits, 16).map_err(|_| format!("bad hex digits '{digits}'"))?;
        if raw && esc == 'x' {
            out.push(u8::try_from(value).map_err(|_| format!("byte out of range: {value}"))?);
        } else {
            let c = char::from_u32(value).ok_or_else(|| format!("invalid code point {value:#x}"))?;
            push_char(&mut out, c);
        }
    }
    Ok(out)
}

/// Append the UTF-8 encoding of `c`.
fn push_char(out: &mut Vec<u8>, c: char) {
    let mut buf = [0u8; 4];
    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

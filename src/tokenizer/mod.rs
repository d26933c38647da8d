// SPDX-License-Identifier: MIT OR Apache-2.0

//! Text ↔ token id mapping.
//!
//! [`ChainTokenizer`] hides whether the vocabulary is a `HuggingFace`
//! `tokenizer.json` or an RWKV World vocabulary file.

#[cfg(feature = "rwkv-tokenizer")]
pub mod rwkv;

use std::path::Path;

use crate::error::{ChainError, Result};

/// Tokenizer backends.
///
/// # Example
///
/// ```no_run
/// use rwkv_chain::ChainTokenizer;
///
/// # fn main() -> rwkv_chain::Result<()> {
/// let tok = ChainTokenizer::from_path("rwkv_vocab_v20230424.txt")?;
/// let ids = tok.encode("User: hi\n\nAssistant:")?;
/// assert_eq!(tok.decode(&ids)?, "User: hi\n\nAssistant:");
/// # Ok(())
/// # }
/// ```
#[non_exhaustive]
pub enum ChainTokenizer {
    /// `HuggingFace` `tokenizers` backend.
    HuggingFace(Box<tokenizers::Tokenizer>),
    /// RWKV World trie tokenizer.
    #[cfg(feature = "rwkv-tokenizer")]
    Rwkv(rwkv::RwkvTokenizer),
}

impl ChainTokenizer {
    /// Load a tokenizer, choosing the backend by file name: `.txt`
    /// vocabularies use the RWKV trie tokenizer, anything else is read as a
    /// `tokenizer.json`.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::TokenizerLoad`] if the file is missing or
    /// malformed.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ChainError::TokenizerLoad(format!(
                "{} is not a file",
                path.display()
            )));
        }
        if path.extension().is_some_and(|ext| ext == "txt") {
            #[cfg(feature = "rwkv-tokenizer")]
            return Ok(Self::Rwkv(rwkv::RwkvTokenizer::from_file(path)?));
            #[cfg(not(feature = "rwkv-tokenizer"))]
            return Err(ChainError::TokenizerLoad(format!(
                "{} is an RWKV vocabulary; enable the `rwkv-tokenizer` feature",
                path.display()
            )));
        }
        let tok = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            ChainError::TokenizerLoad(format!("{}: {e}", path.display()))
        })?;
        tracing::info!(path = %path.display(), vocab_size = tok.get_vocab_size(true), "tokenizer loaded");
        Ok(Self::HuggingFace(Box::new(tok)))
    }

    /// Wrap an already-loaded `HuggingFace` tokenizer.
    #[must_use]
    pub fn from_hf(tokenizer: tokenizers::Tokenizer) -> Self {
        Self::HuggingFace(Box::new(tokenizer))
    }

    /// Encode text into token ids, without special tokens.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Tokenizer`] if encoding fails.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        match self {
            Self::HuggingFace(tok) => tok
                .encode(text, false)
                .map(|enc| enc.get_ids().to_vec())
                .map_err(|e| ChainError::Tokenizer(format!("encode failed: {e}"))),
            #[cfg(feature = "rwkv-tokenizer")]
            Self::Rwkv(tok) => tok.encode(text),
        }
    }

    /// Encode text and split the ids into chunks of at most `max_chunk`.
    ///
    /// Empty text yields no chunks.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Config`] for `max_chunk == 0`, or
    /// [`ChainError::Tokenizer`] if encoding fails.
    pub fn encode_chunks(&self, text: &str, max_chunk: usize) -> Result<Vec<Vec<u32>>> {
        if max_chunk == 0 {
            return Err(ChainError::Config("chunk size must be positive".into()));
        }
        Ok(self
            .encode(text)?
            .chunks(max_chunk)
            .map(<[u32]>::to_vec)
            .collect())
    }

    /// Decode token ids into text.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Tokenizer`] for unknown ids or, with the RWKV
    /// backend, bytes that do not form valid UTF-8.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        match self {
            Self::HuggingFace(tok) => tok
                .decode(ids, false)
                .map_err(|e| ChainError::Tokenizer(format!("decode failed: {e}"))),
            #[cfg(feature = "rwkv-tokenizer")]
            Self::Rwkv(tok) => tok.decode(ids),
        }
    }

    /// Decode token ids, replacing invalid UTF-8 with U+FFFD.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Tokenizer`] for unknown ids.
    pub fn decode_lossy(&self, ids: &[u32]) -> Result<String> {
        match self {
            Self::HuggingFace(_) => self.decode(ids),
            #[cfg(feature = "rwkv-tokenizer")]
            Self::Rwkv(tok) => Ok(String::from_utf8_lossy(&tok.decode_bytes(ids)?).into_owned()),
        }
    }

    /// Vocabulary size.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        match self {
            Self::HuggingFace(tok) => tok.get_vocab_size(true),
            #[cfg(feature = "rwkv-tokenizer")]
            Self::Rwkv(tok) => tok.vocab_size(),
        }
    }
}

impl std::fmt::Debug for ChainTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HuggingFace(tok) => f
                .debug_tuple("HuggingFace")
                .field(&tok.get_vocab_size(true))
                .finish(),
            #[cfg(feature = "rwkv-tokenizer")]
            Self::Rwkv(tok) => f.debug_tuple("Rwkv").field(tok).finish(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, feature = "rwkv-tokenizer"))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    fn vocab_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        writeln!(file, "1 'a' 1").unwrap();
        writeln!(file, "2 'b' 1").unwrap();
        writeln!(file, "3 'ab' 2").unwrap();
        file
    }

    #[test]
    fn txt_extension_selects_rwkv_backend() {
        let file = vocab_file();
        let tok = ChainTokenizer::from_path(file.path()).unwrap();
        assert!(matches!(tok, ChainTokenizer::Rwkv(_)));
        assert_eq!(tok.encode("abab").unwrap(), vec![3, 3]);
        assert_eq!(tok.decode(&[3, 1]).unwrap(), "aba");
    }

    #[test]
    fn chunks_split_the_flat_encoding() {
        let file = vocab_file();
        let tok = ChainTokenizer::from_path(file.path()).unwrap();
        let chunks = tok.encode_chunks("ababab", 2).unwrap();
        assert_eq!(chunks, vec![vec![3, 3], vec![3]]);
        assert!(tok.encode_chunks("", 4).unwrap().is_empty());
        assert!(matches!(tok.encode_chunks("a", 0), Err(ChainError::Config(_))));
    }

    #[test]
    fn missing_file_is_load_failure() {
        let err = ChainTokenizer::from_path("/nonexistent/vocab.txt").unwrap_err();
        assert!(matches!(err, ChainError::TokenizerLoad(_)));
    }

    #[test]
    fn malformed_json_is_load_failure() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = ChainTokenizer::from_path(file.path()).unwrap_err();
        assert!(matches!(err, ChainError::TokenizerLoad(_)));
    }
}

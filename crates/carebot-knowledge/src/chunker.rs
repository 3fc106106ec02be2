//! Token-window text splitting.

use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use carebot_core::error::{CarebotError, Result};
use tokenizers::Tokenizer;

/// Converts text to tokens and back.
pub trait TokenCodec: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    fn decode(&self, tokens: &[u32]) -> Result<String>;
}

/// HuggingFace tokenizer loaded from a `tokenizer.json`.
pub struct HfTokenizer {
    inner: Tokenizer,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = Tokenizer::from_file(path).map_err(|e| {
            CarebotError::Tokenizer(format!("Failed to load tokenizer from {}: {e}", path.display()))
        })?;
        Ok(Self { inner })
    }
}

impl TokenCodec for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| CarebotError::Tokenizer(format!("Tokenization failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.inner
            .decode(tokens, false)
            .map_err(|e| CarebotError::Tokenizer(format!("Detokenization failed: {e}")))
    }
}

/// Token ranges of the windows covering `n` tokens.
///
/// Windows start at every multiple of `chunk_size - chunk_overlap` below `n`
/// and span at most `chunk_size` tokens. Callers validate the sizes.
pub fn window_ranges(n: usize, chunk_size: usize, chunk_overlap: usize) -> Vec<Range<usize>> {
    if n == 0 {
        return vec![];
    }
    if n <= chunk_size {
        return vec![0..n];
    }
    let step = chunk_size - chunk_overlap;
    (0..n)
        .step_by(step)
        .map(|start| start..(start + chunk_size).min(n))
        .collect()
}

/// Splits text into overlapping windows measured in tokens.
#[derive(Clone)]
pub struct TextSplitter {
    codec: Arc<dyn TokenCodec>,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl TextSplitter {
    pub fn new(codec: Arc<dyn TokenCodec>, chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(CarebotError::Config("chunk_size must be > 0".into()));
        }
        if chunk_overlap >= chunk_size {
            return Err(CarebotError::Config(format!(
                "chunk_overlap ({chunk_overlap}) must be smaller than chunk_size ({chunk_size})"
            )));
        }
        Ok(Self {
            codec,
            chunk_size,
            chunk_overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    pub fn split(&self, text: &str) -> Result<Vec<String>> {
        let tokens = self.codec.encode(text)?;
        window_ranges(tokens.len(), self.chunk_size, self.chunk_overlap)
            .into_iter()
            .map(|range| self.codec.decode(&tokens[range]))
            .collect()
    }

    pub fn token_count(&self, text: &str) -> Result<usize> {
        Ok(self.codec.encode(text)?.len())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// One token per character, so decoded windows are exact substrings.
    pub(crate) struct CharCodec;

    impl TokenCodec for CharCodec {
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            Ok(text.chars().map(|c| c as u32).collect())
        }

        fn decode(&self, tokens: &[u32]) -> Result<String> {
            Ok(tokens.iter().filter_map(|&t| char::from_u32(t)).collect())
        }
    }

    fn splitter(size: usize, overlap: usize) -> TextSplitter {
        TextSplitter::new(Arc::new(CharCodec), size, overlap).unwrap()
    }

    #[test]
    fn test_window_starts_for_1500_tokens() {
        let ranges = window_ranges(1500, 512, 150);
        let starts: Vec<usize> = ranges.iter().map(|r| r.start).collect();
        assert_eq!(starts, vec![0, 362, 724, 1086, 1448]);
        let lens: Vec<usize> = ranges.iter().map(|r| r.len()).collect();
        assert_eq!(lens, vec![512, 512, 512, 414, 52]);
    }

    #[test]
    fn test_short_text_is_single_chunk() {
        assert_eq!(window_ranges(512, 512, 150), vec![0..512]);
        assert_eq!(window_ranges(7, 512, 150), vec![0..7]);
        assert!(window_ranges(0, 512, 150).is_empty());
    }

    #[test]
    fn test_split_reconstructs_text() {
        let text: String = (0..1500).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let s = splitter(512, 150);
        let chunks = s.split(&text).unwrap();
        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|c| c.chars().count() <= 512));

        let step = 512 - 150;
        let mut rebuilt = String::new();
        for (i, chunk) in chunks.iter().enumerate() {
            if i + 1 < chunks.len() {
                rebuilt.extend(chunk.chars().take(step));
            } else {
                rebuilt.push_str(chunk);
            }
        }
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn test_split_is_deterministic() {
        let s = splitter(10, 3);
        let text = "Shortness of breath with chest tightness at night";
        assert_eq!(s.split(text).unwrap(), s.split(text).unwrap());
        assert_eq!(s.token_count(text).unwrap(), text.chars().count());
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        assert!(splitter(10, 3).split("").unwrap().is_empty());
    }

    #[test]
    fn test_invalid_sizes_rejected() {
        assert!(matches!(
            TextSplitter::new(Arc::new(CharCodec), 0, 0),
            Err(CarebotError::Config(_))
        ));
        assert!(matches!(
            TextSplitter::new(Arc::new(CharCodec), 100, 100),
            Err(CarebotError::Config(_))
        ));
    }
}

//! Embedding port and a deterministic lexical embedder.
//!
//! Production deployments plug an external embedding model in through
//! [`Embedder`]. [`LexicalEmbedder`] runs offline: it hashes word and
//! character-trigram features into a fixed number of signed buckets, which is
//! enough to recognize repeated or near-identical descriptions.

use crate::error::OracleError;

/// Default embedding dimensionality for lexical embeddings.
pub const DEFAULT_EMBEDDING_DIM: usize = 128;

const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.5;

/// Text embedding provider.
///
/// Implementations own their transport timeout. A failure is "no semantic
/// signal" for the caller, never a fatal error.
pub trait Embedder: Send + Sync {
    /// Embeds `text` into a fixed-length vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>, OracleError>;
}

/// Feature-hashing embedder.
#[derive(Debug, Clone, Copy)]
pub struct LexicalEmbedder {
    dim: usize,
}

impl LexicalEmbedder {
    /// Creates an embedder with the given dimension (0 falls back to the default).
    #[must_use]
    pub fn new(dim: usize) -> Self {
        let dim = if dim == 0 { DEFAULT_EMBEDDING_DIM } else { dim };
        Self { dim }
    }

    /// Output dimension.
    #[must_use]
    pub const fn dim(&self) -> usize {
        self.dim
    }
}

impl Default for LexicalEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIM)
    }
}

impl Embedder for LexicalEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, OracleError> {
        let vector = lexical_embedding_with_dim(text, self.dim);
        if vector.iter().all(|x| *x == 0.0) {
            return Err(OracleError::InvalidResponse(
                "text has no embeddable tokens".to_string(),
            ));
        }
        Ok(vector)
    }
}

/// Lexical embedding with [`DEFAULT_EMBEDDING_DIM`] buckets.
#[must_use]
pub fn lexical_embedding(text: &str) -> Vec<f32> {
    lexical_embedding_with_dim(text, DEFAULT_EMBEDDING_DIM)
}

/// Lexical embedding with `dim` buckets, L2-normalized.
///
/// Returns an all-zero vector when `text` has no alphanumeric tokens and an
/// empty vector when `dim` is zero.
#[must_use]
pub fn lexical_embedding_with_dim(text: &str, dim: usize) -> Vec<f32> {
    let mut buckets = vec![0.0f32; dim];
    if dim == 0 {
        return buckets;
    }

    let lowered = text.to_lowercase();
    for word in lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        add_feature(&mut buckets, word, WORD_WEIGHT);

        let padded: Vec<char> = std::iter::once('#')
            .chain(word.chars())
            .chain(std::iter::once('#'))
            .collect();
        for window in padded.windows(3) {
            let trigram: String = window.iter().collect();
            add_feature(&mut buckets, &format!("3:{trigram}"), TRIGRAM_WEIGHT);
        }
    }

    let norm = buckets
        .iter()
        .map(|x| f64::from(*x) * f64::from(*x))
        .sum::<f64>()
        .sqrt();
    if norm > 0.0 {
        #[allow(clippy::cast_possible_truncation)]
        let scale = (1.0 / norm) as f32;
        buckets.iter_mut().for_each(|x| *x *= scale);
    }
    buckets
}

/// Adds `weight` to the bucket `feature` hashes to, with a hash-derived sign.
fn add_feature(buckets: &mut [f32], feature: &str, weight: f32) {
    let digest = blake3::hash(feature.as_bytes());
    let bytes = digest.as_bytes();
    let mut head = [0u8; 8];
    head.copy_from_slice(&bytes[..8]);

    #[allow(clippy::cast_possible_truncation)]
    let index = (u64::from_le_bytes(head) % buckets.len() as u64) as usize;
    let signed = if bytes[8] & 1 == 0 { weight } else { -weight };
    buckets[index] += signed;
}

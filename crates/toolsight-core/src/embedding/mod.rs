//! Visual/Text Embeddings
//!
//! The embedding layer turns catalog photos (and, for catalog insertion,
//! product names) into unit-norm vectors that the retrieval engine compares
//! by dot product. The backing model is CLIP ViT-B/32 run through candle;
//! everything outside this module treats vectors as opaque `f32` sequences.

mod clip;
mod fetch;
mod handle;

pub use clip::{ClipEmbedder, ClipEmbedderConfig, preprocess_image, CLIP_INPUT_SIZE, MODEL_REPO};
pub(crate) use clip::{default_device, pixel_tensor};
pub use fetch::{ImageFetcher, ImageSource};
pub use handle::EmbedderHandle;

use serde::{Deserialize, Serialize};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Embedding dimensions for CLIP ViT-B/32 projections
pub const EMBEDDING_DIM: usize = 512;

/// Forward passes averaged per image for stability against fp drift
pub const INFERENCE_PASSES: usize = 3;

/// Weight of the image vector when fusing image+text for a catalog item
pub const FUSION_IMAGE_WEIGHT: f32 = 0.8;

/// Weight of the text vector when fusing image+text for a catalog item
pub const FUSION_TEXT_WEIGHT: f32 = 0.2;

/// Unit-norm tolerance enforced on stored vectors
pub const NORM_TOLERANCE: f32 = 1e-5;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Embedding error types
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// Image URL/path could not be fetched
    #[error("source unreadable: {0}")]
    SourceUnreadable(String),
    /// Bytes were fetched but could not be decoded into an image
    #[error("decode failed: {0}")]
    DecodeFailed(String),
    /// The encoder forward pass raised
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    /// Model weights could not be located or loaded
    #[error("model load failed: {0}")]
    ModelLoad(String),
}

/// Embedding result type
pub type Result<T> = std::result::Result<T, EmbedError>;

// ============================================================================
// EMBEDDING TYPE
// ============================================================================

/// A unit-norm embedding vector
///
/// Stored on disk as a little-endian `f32` byte sequence; the byte round-trip
/// is exact (0 ULP).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    vector: Vec<f32>,
}

impl Embedding {
    /// Create an embedding from a raw vector, normalizing it to unit length
    pub fn new(mut vector: Vec<f32>) -> Self {
        normalize_in_place(&mut vector);
        Self { vector }
    }

    /// Create an embedding from a vector that is already unit-norm
    ///
    /// Used when reading back from storage so the bytes stay exact.
    pub fn from_unit(vector: Vec<f32>) -> Self {
        Self { vector }
    }

    /// Dimensionality of the vector
    pub fn dimensions(&self) -> usize {
        self.vector.len()
    }

    /// Borrow the raw components
    pub fn as_slice(&self) -> &[f32] {
        &self.vector
    }

    /// Dot product with another embedding; equals cosine similarity when both
    /// sides are unit-norm
    pub fn dot(&self, other: &Embedding) -> f32 {
        dot_product(&self.vector, &other.vector)
    }

    /// Check the unit-norm invariant
    pub fn is_normalized(&self) -> bool {
        let norm = self.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        (norm - 1.0).abs() < NORM_TOLERANCE
    }

    /// Serialize to little-endian f32 bytes for BLOB storage
    pub fn to_bytes(&self) -> Vec<u8> {
        self.vector.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    /// Deserialize from little-endian f32 bytes; `None` if the length is not
    /// a multiple of 4
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() % 4 != 0 {
            return None;
        }
        let vector: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Some(Self { vector })
    }

    /// Fuse an image and a text embedding at the fixed catalog ratio and
    /// renormalize
    pub fn fuse(image: &Embedding, text: &Embedding) -> Embedding {
        let vector: Vec<f32> = image
            .vector
            .iter()
            .zip(text.vector.iter())
            .map(|(i, t)| FUSION_IMAGE_WEIGHT * i + FUSION_TEXT_WEIGHT * t)
            .collect();
        Embedding::new(vector)
    }

    /// Mean of several unit vectors, renormalized
    pub fn mean_of(vectors: &[Vec<f32>]) -> Option<Embedding> {
        let first = vectors.first()?;
        let dim = first.len();
        let mut acc = vec![0.0_f32; dim];
        for v in vectors {
            for (a, x) in acc.iter_mut().zip(v.iter()) {
                *a += x;
            }
        }
        let n = vectors.len() as f32;
        for a in &mut acc {
            *a /= n;
        }
        Some(Embedding::new(acc))
    }
}

// ============================================================================
// SIMILARITY FUNCTIONS
// ============================================================================

/// Normalize a vector to unit length in place; zero vectors are left as-is
#[inline]
pub fn normalize_in_place(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Dot product between two vectors
#[inline]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Cosine similarity between two arbitrary (not necessarily unit) vectors
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denominator = (norm_a * norm_b).sqrt();
    if denominator > 0.0 { dot / denominator } else { 0.0 }
}

// ============================================================================
// ENCODER TRAIT
// ============================================================================

/// The seam between the pipeline and the concrete model.
///
/// Production uses [`ClipEmbedder`]; tests inject deterministic stubs. The
/// encoder owns the only handle to the underlying weights.
pub trait ImageEncoder: Send + Sync {
    /// Embed a decoded image into a unit-norm vector
    fn embed_image(&self, img: &image::DynamicImage) -> Result<Embedding>;

    /// Embed a text label into the same space
    fn embed_text(&self, text: &str) -> Result<Embedding>;

    /// Version tag of the weights producing these vectors
    fn version(&self) -> &str;

    /// Output dimensionality
    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }
}

// ============================================================================
// TESTS
// ============================================================================

//! CLIP ViT-B/32 encoder
//!
//! Inference runs through candle with weights from the HuggingFace hub (base)
//! or from a registry artifact (fine-tuned). Preprocessing is deterministic
//! and order-sensitive: decode → Lanczos resize + center crop → contrast →
//! sharpness → channel normalization. The contrast/sharpness constants are
//! fixed; they compensate for the mixed lighting of the source catalog.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::clip::{ClipConfig, ClipModel};
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use super::{Embedding, EmbedError, ImageEncoder, INFERENCE_PASSES, Result, normalize_in_place};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Model repository on the HuggingFace hub
pub const MODEL_REPO: &str = "openai/clip-vit-base-patch32";

/// Version tag reported for the un-tuned base weights
pub const BASE_VERSION: &str = "clip-vit-b32-base";

/// Square input side length for ViT-B/32
pub const CLIP_INPUT_SIZE: u32 = 224;

/// Fixed contrast boost applied before normalization
const CONTRAST_FACTOR: f32 = 1.2;

/// Fixed sharpness boost applied before normalization
const SHARPNESS_FACTOR: f32 = 1.1;

/// Channel means the backbone was trained with
const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];

/// Channel standard deviations the backbone was trained with
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// Token budget for text labels, leaving room for the special tokens
const MAX_TEXT_TOKENS: usize = 75;

/// End-of-text marker used for padding and truncation repair
const EOT_TOKEN: &str = "<|endoftext|>";

// ============================================================================
// CONFIGURATION
// ============================================================================

/// How to construct a [`ClipEmbedder`]
#[derive(Debug, Clone)]
pub struct ClipEmbedderConfig {
    /// Hub repository the tokenizer (and base weights) come from
    pub model_repo: String,
    /// Override weights file; `None` loads the base checkpoint from the hub
    pub weights: Option<PathBuf>,
    /// Version tag stamped onto every vector this encoder produces
    pub version: String,
    /// Forward passes averaged per image
    pub inference_passes: usize,
}

impl Default for ClipEmbedderConfig {
    fn default() -> Self {
        Self {
            model_repo: MODEL_REPO.to_string(),
            weights: None,
            version: BASE_VERSION.to_string(),
            inference_passes: INFERENCE_PASSES,
        }
    }
}

impl ClipEmbedderConfig {
    /// Config for a fine-tuned artifact produced by the trainer
    pub fn for_artifact(weights: impl Into<PathBuf>, version: impl Into<String>) -> Self {
        Self {
            weights: Some(weights.into()),
            version: version.into(),
            ..Default::default()
        }
    }
}

// ============================================================================
// EMBEDDER
// ============================================================================

/// CLIP encoder owning the only handle to the model weights
pub struct ClipEmbedder {
    model: ClipModel,
    tokenizer: Tokenizer,
    clip_config: ClipConfig,
    device: Device,
    weights_path: PathBuf,
    version: String,
    passes: usize,
    eot_id: u32,
}

impl ClipEmbedder {
    /// Load the encoder, downloading the base checkpoint if necessary
    pub fn load(config: &ClipEmbedderConfig) -> Result<Self> {
        let device = default_device();
        let api = hub_api()?;
        let repo = api.model(config.model_repo.clone());

        let tokenizer_path = repo
            .get("tokenizer.json")
            .map_err(|e| EmbedError::ModelLoad(format!("tokenizer download: {e}")))?;
        let weights_path = match &config.weights {
            Some(path) => {
                if !path.exists() {
                    return Err(EmbedError::ModelLoad(format!(
                        "weights file missing: {}",
                        path.display()
                    )));
                }
                path.clone()
            }
            None => repo
                .get("model.safetensors")
                .map_err(|e| EmbedError::ModelLoad(format!("weights download: {e}")))?,
        };

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| EmbedError::ModelLoad(format!("tokenizer load: {e}")))?;
        let eot_id = *tokenizer
            .get_vocab(true)
            .get(EOT_TOKEN)
            .ok_or_else(|| EmbedError::ModelLoad(format!("tokenizer missing {EOT_TOKEN}")))?;

        let clip_config = ClipConfig::vit_base_patch32();
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path.clone()], DType::F32, &device)
                .map_err(|e| EmbedError::ModelLoad(format!("weights load: {e}")))?
        };
        let model = ClipModel::new(vb, &clip_config)
            .map_err(|e| EmbedError::ModelLoad(format!("model build: {e}")))?;

        info!(
            version = %config.version,
            weights = %weights_path.display(),
            "CLIP encoder loaded"
        );

        Ok(Self {
            model,
            tokenizer,
            clip_config,
            device,
            weights_path,
            version: config.version.clone(),
            passes: config.inference_passes.max(1),
            eot_id,
        })
    }

    /// The weights file backing this encoder; the trainer snapshots this when
    /// it creates a pre-training backup
    pub fn weights_path(&self) -> &Path {
        &self.weights_path
    }

    fn image_features(&self, pixels: &Tensor) -> Result<Vec<f32>> {
        let features = self
            .model
            .get_image_features(pixels)
            .map_err(|e| EmbedError::InferenceFailed(format!("vision encoder: {e}")))?;
        let mut vector = features
            .flatten_all()
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(|e| EmbedError::InferenceFailed(format!("feature readback: {e}")))?;
        normalize_in_place(&mut vector);
        Ok(vector)
    }

    fn token_ids(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| EmbedError::InferenceFailed(format!("tokenize: {e}")))?;
        let max_len = self.clip_config.text_config.max_position_embeddings;
        let mut ids = encoding.get_ids().to_vec();
        // Hard budget: keep the leading tokens and restore the end marker so
        // the pooling position stays valid.
        if ids.len() > MAX_TEXT_TOKENS + 2 {
            ids.truncate(MAX_TEXT_TOKENS + 1);
            ids.push(self.eot_id);
        }
        while ids.len() < max_len {
            ids.push(self.eot_id);
        }
        ids.truncate(max_len);
        Ok(ids)
    }
}

impl ImageEncoder for ClipEmbedder {
    fn embed_image(&self, img: &DynamicImage) -> Result<Embedding> {
        let prepared = preprocess_image(img);
        let pixels = pixel_tensor(&prepared, &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(|e| EmbedError::InferenceFailed(format!("pixel tensor: {e}")))?;

        // Averaging repeated passes damps non-deterministic kernels and
        // fp16 drift on accelerators.
        let mut runs = Vec::with_capacity(self.passes);
        for _ in 0..self.passes {
            runs.push(self.image_features(&pixels)?);
        }
        debug!(passes = self.passes, "image embedded");
        Embedding::mean_of(&runs)
            .ok_or_else(|| EmbedError::InferenceFailed("no forward passes ran".into()))
    }

    fn embed_text(&self, text: &str) -> Result<Embedding> {
        let ids = self.token_ids(text)?;
        let input = Tensor::new(vec![ids], &self.device)
            .map_err(|e| EmbedError::InferenceFailed(format!("token tensor: {e}")))?;
        let features = self
            .model
            .get_text_features(&input)
            .map_err(|e| EmbedError::InferenceFailed(format!("text encoder: {e}")))?;
        let mut vector = features
            .flatten_all()
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(|e| EmbedError::InferenceFailed(format!("feature readback: {e}")))?;
        normalize_in_place(&mut vector);
        Ok(Embedding::from_unit(vector))
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn dimensions(&self) -> usize {
        self.clip_config.vision_config.projection_dim
    }
}

// ============================================================================
// PREPROCESSING
// ============================================================================

/// Deterministic preprocessing shared by inference and training: RGB
/// conversion, Lanczos resize with center crop to the square input, then the
/// fixed contrast/sharpness enhancement
pub fn preprocess_image(img: &DynamicImage) -> RgbImage {
    let resized = img
        .resize_to_fill(CLIP_INPUT_SIZE, CLIP_INPUT_SIZE, FilterType::Lanczos3)
        .to_rgb8();
    let contrasted = adjust_contrast(&resized, CONTRAST_FACTOR);
    adjust_sharpness(&contrasted, SHARPNESS_FACTOR)
}

/// Convert a preprocessed image into a normalized CHW tensor
pub(crate) fn pixel_tensor(rgb: &RgbImage, device: &Device) -> candle_core::Result<Tensor> {
    let (width, height) = rgb.dimensions();
    let data: Vec<f32> = rgb.as_raw().iter().map(|&v| v as f32 / 255.0).collect();
    let pixels = Tensor::from_vec(data, (height as usize, width as usize, 3), device)?
        .permute((2, 0, 1))?;
    let mean = Tensor::new(&CLIP_MEAN, device)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&CLIP_STD, device)?.reshape((3, 1, 1))?;
    pixels.broadcast_sub(&mean)?.broadcast_div(&std)
}

/// Scale pixel distance from the mean luminance, clamping to valid range
fn adjust_contrast(img: &RgbImage, factor: f32) -> RgbImage {
    let mut sum = 0.0_f64;
    for p in img.pixels() {
        // ITU-R 601 luma, same grayscale the reference enhancement pivots on
        sum += 0.299 * p.0[0] as f64 + 0.587 * p.0[1] as f64 + 0.114 * p.0[2] as f64;
    }
    let mean = (sum / (img.width() as f64 * img.height() as f64)) as f32;

    let mut out = img.clone();
    for p in out.pixels_mut() {
        for c in &mut p.0 {
            *c = (mean + factor * (*c as f32 - mean)).clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Blend the image against its 3x3-smoothed version
fn adjust_sharpness(img: &RgbImage, factor: f32) -> RgbImage {
    let kernel = [1.0, 1.0, 1.0, 1.0, 5.0, 1.0, 1.0, 1.0, 1.0].map(|k| k / 13.0);
    let smooth = image::imageops::filter3x3(img, &kernel);

    let mut out = img.clone();
    for (p, s) in out.pixels_mut().zip(smooth.pixels()) {
        for (c, sc) in p.0.iter_mut().zip(s.0.iter()) {
            let blended = *sc as f32 + factor * (*c as f32 - *sc as f32);
            *c = blended.clamp(0.0, 255.0) as u8;
        }
    }
    out
}

pub(crate) fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        Device::cuda_if_available(0).unwrap_or(Device::Cpu)
    }
    #[cfg(not(feature = "cuda"))]
    {
        Device::Cpu
    }
}

fn hub_api() -> Result<hf_hub::api::sync::Api> {
    let mut builder = hf_hub::api::sync::ApiBuilder::new();
    if let Ok(dir) = std::env::var("TOOLSIGHT_MODEL_CACHE") {
        builder = builder.with_cache_dir(PathBuf::from(dir));
    }
    builder
        .build()
        .map_err(|e| EmbedError::ModelLoad(format!("hub client: {e}")))
}

// ============================================================================
// TESTS
// ============================================================================

//! Face embedding generation via ONNX Runtime.
//!
//! Runs the CLIP ViT-B/32 visual tower over a pet face crop and returns
//! a unit-length 512-dimensional embedding.

use crate::types::Embedding;
use image::imageops::FilterType;
use image::{imageops, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

// --- Named constants ---
const CLIP_INPUT_SIZE: usize = 224;
/// Per-channel normalization, the ImageNet statistics CLIP was trained with.
const CLIP_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const CLIP_STD: [f32; 3] = [0.229, 0.224, 0.225];
const CLIP_EMBEDDING_DIM: usize = 512;
const CLIP_MODEL_VERSION: &str = "clip-vit-b-32";

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0} — place the visual tower export in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Capability interface over "something that embeds a face crop".
pub trait Embedder: Send + Sync {
    /// Produce a unit-length embedding for a face crop.
    fn embed(&self, crop: &RgbImage) -> Result<Embedding, EmbedderError>;
}

/// CLIP-based face embedder.
pub struct ClipEmbedder {
    session: Mutex<Session>,
}

impl ClipEmbedder {
    /// Load the visual-tower ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Self {
            session: Mutex::new(session),
        })
    }
}

impl Embedder for ClipEmbedder {
    fn embed(&self, crop: &RgbImage) -> Result<Embedding, EmbedderError> {
        let input = preprocess(crop);

        let mut session = self
            .session
            .lock()
            .map_err(|_| EmbedderError::InferenceFailed("session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();
        if raw.len() != CLIP_EMBEDDING_DIM {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {CLIP_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        let embedding = Embedding {
            values: raw,
            model_version: Some(CLIP_MODEL_VERSION.to_string()),
        };
        Ok(embedding.normalized())
    }
}

/// Resize a crop to 224×224 and normalize into a NCHW float tensor with
/// the CLIP per-channel statistics.
fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let size = CLIP_INPUT_SIZE as u32;
    let resized = if crop.dimensions() == (size, size) {
        crop.clone()
    } else {
        imageops::resize(crop, size, size, FilterType::Triangle)
    };

    let mut tensor = Array4::<f32>::zeros((1, 3, CLIP_INPUT_SIZE, CLIP_INPUT_SIZE));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            let scaled = pixel[c] as f32 / 255.0;
            tensor[[0, c, y as usize, x as usize]] = (scaled - CLIP_MEAN[c]) / CLIP_STD[c];
        }
    }

    tensor
}

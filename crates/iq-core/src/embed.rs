//! Embedding generation using fastembed CLIP models

use std::path::PathBuf;

use fastembed::{
    EmbeddingModel, ImageEmbedding, ImageEmbeddingModel, ImageInitOptions, InitOptions,
    TextEmbedding,
};
use tracing::{debug, warn};

use crate::{Config, IqError, Result};

/// Vector produced for one image.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub path: PathBuf,
    pub vector: Vec<f32>,
}

/// Turns images and query text into vectors in a shared space.
pub trait Encoder: Send + Sync {
    /// Encode a batch of images.
    ///
    /// Images that cannot be loaded are skipped, so the result may be shorter
    /// than `paths`; every vector carries the path it belongs to.
    /// `progress` receives `(done, total)` image counts.
    fn encode_images(
        &self,
        paths: &[PathBuf],
        progress: Option<&dyn Fn(usize, usize)>,
    ) -> Result<Vec<EncodedImage>>;

    /// Encode a text query.
    fn encode_text(&self, text: &str) -> Result<Vec<f32>>;

    /// Score `query` against each row of `vectors`.
    fn similarity(&self, query: &[f32], vectors: &[&[f32]]) -> Vec<f32> {
        vectors.iter().map(|v| dot(query, v)).collect()
    }

    /// Hint that buffers held between calls may be released.
    fn release_buffers(&self) {}
}

/// Dot product; cosine similarity for L2-normalized inputs.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Scale `vector` to unit length in place. Zero vectors are left alone.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        vector.iter_mut().for_each(|x| *x /= norm);
    }
}

/// CLIP-style encoder pairing a vision model with its text tower.
pub struct ClipEncoder {
    image_model: ImageEmbedding,
    text_model: TextEmbedding,
    batch_size: usize,
}

impl ClipEncoder {
    /// Create a new encoder with the models specified in config.
    pub fn new(config: &Config) -> Result<Self> {
        let image_type = match config.image_model.as_str() {
            "clip-vit-b-32" => ImageEmbeddingModel::ClipVitB32,
            "nomic-embed-vision-v1.5" => ImageEmbeddingModel::NomicEmbedVisionV15,
            other => {
                return Err(IqError::Embedding(format!(
                    "Unknown image model: {}. Supported: clip-vit-b-32, nomic-embed-vision-v1.5",
                    other
                )));
            }
        };
        let text_type = match config.text_model.as_str() {
            "clip-vit-b-32" => EmbeddingModel::ClipVitB32,
            "nomic-embed-text-v1.5" => EmbeddingModel::NomicEmbedTextV15,
            other => {
                return Err(IqError::Embedding(format!(
                    "Unknown text model: {}. Supported: clip-vit-b-32, nomic-embed-text-v1.5",
                    other
                )));
            }
        };

        let image_model = ImageEmbedding::try_new(
            ImageInitOptions::new(image_type).with_show_download_progress(true),
        )
        .map_err(|e| IqError::Embedding(e.to_string()))?;
        let text_model =
            TextEmbedding::try_new(InitOptions::new(text_type).with_show_download_progress(true))
                .map_err(|e| IqError::Embedding(e.to_string()))?;

        Ok(Self {
            image_model,
            text_model,
            batch_size: config.encode_batch_size,
        })
    }

    fn embed_paths(&self, paths: &[PathBuf]) -> Result<Vec<Vec<f32>>> {
        self.image_model
            .embed(paths.to_vec(), Some(self.batch_size))
            .map_err(|e| IqError::Embedding(e.to_string()))
    }
}

impl Encoder for ClipEncoder {
    fn encode_images(
        &self,
        paths: &[PathBuf],
        progress: Option<&dyn Fn(usize, usize)>,
    ) -> Result<Vec<EncodedImage>> {
        let mut encoded = Vec::with_capacity(paths.len());
        let mut done = 0;

        for batch in paths.chunks(self.batch_size) {
            match self.embed_paths(batch) {
                Ok(vectors) if vectors.len() == batch.len() => {
                    encoded.extend(batch.iter().cloned().zip(vectors).map(|(path, vector)| {
                        EncodedImage { path, vector }
                    }));
                }
                outcome => {
                    // One unreadable image fails the whole batch; isolate it
                    if let Err(e) = outcome {
                        debug!("Batch of {} failed, retrying one by one: {}", batch.len(), e);
                    }
                    for path in batch {
                        match self.embed_paths(std::slice::from_ref(path)) {
                            Ok(mut vectors) if vectors.len() == 1 => {
                                encoded.push(EncodedImage {
                                    path: path.clone(),
                                    vector: vectors.remove(0),
                                });
                            }
                            Ok(_) => warn!("No embedding produced for {}", path.display()),
                            Err(e) => warn!("Failed to encode {}: {}", path.display(), e),
                        }
                    }
                }
            }

            done += batch.len();
            if let Some(progress) = progress {
                progress(done, paths.len());
            }
        }

        for image in &mut encoded {
            normalize(&mut image.vector);
        }
        Ok(encoded)
    }

    fn encode_text(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = self
            .text_model
            .embed(vec![text], None)
            .map_err(|e| IqError::Embedding(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| IqError::Embedding("No embedding generated".to_string()))?;
        normalize(&mut vector);
        Ok(vector)
    }
}

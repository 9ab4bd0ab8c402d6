//! Local sentence-transformer embeddings through ONNX Runtime.
//!
//! The model directory holds `model.onnx` and `tokenizer.json`. Inference is
//! CPU-bound and runs on the blocking pool.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ndarray::Axis;
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;
use tokenizers::Tokenizer;
use tokenizers::{PaddingParams, PaddingStrategy, TruncationParams, TruncationStrategy};

use super::{Embedder, normalize};
use crate::error::EmbeddingError;
use crate::models::{Config, EmbeddingConfig};

struct OnnxModel {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    dimension: usize,
}

#[derive(Clone)]
pub struct OnnxEmbedder {
    model: Arc<OnnxModel>,
    model_name: String,
}

impl std::fmt::Debug for OnnxEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxEmbedder")
            .field("model_name", &self.model_name)
            .field("dimension", &self.model.dimension)
            .finish()
    }
}

fn model_err(e: impl std::fmt::Display) -> EmbeddingError {
    EmbeddingError::ModelError(e.to_string())
}

/// Default model location: `<data dir>/models/<model name>`.
pub fn default_model_dir(model: &str) -> Option<PathBuf> {
    Config::data_dir().map(|d| d.join("models").join(model))
}

impl OnnxEmbedder {
    pub fn load(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let model_dir = config
            .model_path
            .clone()
            .or_else(|| default_model_dir(&config.model))
            .ok_or_else(|| model_err("could not determine model directory"))?;
        Self::load_from(config, &model_dir)
    }

    pub fn load_from(config: &EmbeddingConfig, model_dir: &Path) -> Result<Self, EmbeddingError> {
        let model_path = model_dir.join("model.onnx");
        let tokenizer_path = model_dir.join("tokenizer.json");

        if !model_path.exists() {
            return Err(model_err(format!(
                "model not found: {}",
                model_path.display()
            )));
        }

        let session = Session::builder()
            .map_err(model_err)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(model_err)?
            .with_intra_threads(num_cpus())
            .map_err(model_err)?
            .commit_from_file(&model_path)
            .map_err(model_err)?;

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(model_err)?;

        // Truncate long passages instead of growing the batch tensor
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: config.max_tokens,
                strategy: TruncationStrategy::LongestFirst,
                ..Default::default()
            }))
            .map_err(model_err)?;

        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            ..Default::default()
        }));

        tracing::info!(path = %model_dir.display(), "loaded ONNX embedding model");

        Ok(Self {
            model: Arc::new(OnnxModel {
                session: Mutex::new(session),
                tokenizer,
                dimension: config.dimension as usize,
            }),
            model_name: config.model.clone(),
        })
    }
}

impl OnnxModel {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(model_err)?;

        let max_len = encodings
            .iter()
            .map(|e| e.get_ids().len())
            .max()
            .unwrap_or(0);
        let batch_size = encodings.len();

        let mut input_ids = vec![0i64; batch_size * max_len];
        let mut attention_mask = vec![0i64; batch_size * max_len];
        let token_type_ids = vec![0i64; batch_size * max_len];

        for (i, encoding) in encodings.iter().enumerate() {
            let ids = encoding.get_ids();
            let mask = encoding.get_attention_mask();
            for (j, (&id, &m)) in ids.iter().zip(mask.iter()).enumerate() {
                input_ids[i * max_len + j] = id as i64;
                attention_mask[i * max_len + j] = m as i64;
            }
        }

        let input_ids_tensor =
            Tensor::from_array(([batch_size, max_len], input_ids)).map_err(model_err)?;
        let attention_mask_tensor =
            Tensor::from_array(([batch_size, max_len], attention_mask.clone()))
                .map_err(model_err)?;
        let token_type_ids_tensor =
            Tensor::from_array(([batch_size, max_len], token_type_ids)).map_err(model_err)?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| model_err("session lock poisoned"))?;

        let outputs = session
            .run(ort::inputs![
                input_ids_tensor,
                attention_mask_tensor,
                token_type_ids_tensor
            ])
            .map_err(model_err)?;

        let output = outputs[0].try_extract_array::<f32>().map_err(model_err)?;
        let shape = output.shape().to_vec();

        if shape.last().copied() != Some(self.dimension) {
            return Err(EmbeddingError::InvalidResponse(format!(
                "model produces {:?}-dimensional output, configured dimension is {}",
                shape.last(),
                self.dimension
            )));
        }

        let embeddings = match shape.len() {
            // Token embeddings: mean-pool over the attention mask
            3 => (0..batch_size)
                .map(|i| {
                    let mut pooled = vec![0.0f32; self.dimension];
                    let mut count = 0.0f32;
                    let tokens = output.index_axis(Axis(0), i);
                    for (t, token) in tokens.axis_iter(Axis(0)).enumerate() {
                        if attention_mask[i * max_len + t] == 0 {
                            continue;
                        }
                        count += 1.0;
                        pooled.iter_mut().zip(token.iter()).for_each(|(p, v)| *p += v);
                    }
                    if count > 0.0 {
                        pooled.iter_mut().for_each(|x| *x /= count);
                    }
                    normalize(&mut pooled);
                    pooled
                })
                .collect(),
            // Already pooled sentence embeddings
            2 => (0..batch_size)
                .map(|i| {
                    let mut embedding: Vec<f32> =
                        (0..self.dimension).map(|d| output[[i, d]]).collect();
                    normalize(&mut embedding);
                    embedding
                })
                .collect(),
            _ => {
                return Err(model_err(format!("unexpected output shape: {:?}", shape)));
            }
        };

        Ok(embeddings)
    }
}

#[async_trait]
impl Embedder for OnnxEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let model = Arc::clone(&self.model);
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || model.embed(&texts))
            .await
            .map_err(|e| model_err(format!("embedding task failed: {e}")))?
    }

    fn dimension(&self) -> usize {
        self.model.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

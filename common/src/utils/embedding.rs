use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    str::FromStr,
    sync::Arc,
};

use anyhow::anyhow;
use async_openai::{config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client};
use fastembed::{EmbeddingModel, ModelTrait, TextEmbedding, TextInitOptions};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::AppError;

/// Batch text-to-vector encoder. All vectors leave this type already
/// L2-normalized when the caller asks for it; similarity downstream is plain
/// dot product.
#[derive(Clone)]
pub struct EmbeddingProvider {
    inner: EmbeddingInner,
}

/// Backend selection; variants carry whatever client state they need.
#[derive(Clone)]
enum EmbeddingInner {
    Hashed {
        dimension: usize,
    },
    OpenAi {
        client: Arc<Client<OpenAIConfig>>,
        model: String,
        dimensions: u32,
    },
    FastEmbed {
        model: Arc<Mutex<TextEmbedding>>,
        model_name: EmbeddingModel,
        dimension: usize,
    },
}

impl EmbeddingProvider {
    /// Deterministic token-bucket vectors. Used by tests and offline
    /// evaluation runs; no network or model downloads involved.
    pub fn new_hashed(dimension: usize) -> Self {
        Self {
            inner: EmbeddingInner::Hashed {
                dimension: dimension.max(1),
            },
        }
    }

    pub fn new_openai(client: Arc<Client<OpenAIConfig>>, model: String, dimensions: u32) -> Self {
        Self {
            inner: EmbeddingInner::OpenAi {
                client,
                model,
                dimensions,
            },
        }
    }

    /// Initialize a local FastEmbed model. Model download and ONNX session
    /// creation are blocking, so they run on the blocking pool.
    pub async fn new_fastembed(model_code: Option<&str>) -> Result<Self, AppError> {
        let model_name = if let Some(code) = model_code {
            EmbeddingModel::from_str(code).map_err(|err| AppError::Config(err.to_string()))?
        } else {
            EmbeddingModel::default()
        };

        let options = TextInitOptions::new(model_name.clone()).with_show_download_progress(true);
        let model_name_for_task = model_name.clone();
        let model_name_code = model_name.to_string();

        let (model, dimension) = tokio::task::spawn_blocking(move || -> Result<_, AppError> {
            let model = TextEmbedding::try_new(options)
                .map_err(|e| AppError::InternalError(e.to_string()))?;
            let info = EmbeddingModel::get_model_info(&model_name_for_task).ok_or_else(|| {
                AppError::Config(format!(
                    "FastEmbed model metadata missing for {model_name_code}"
                ))
            })?;
            Ok((model, info.dim))
        })
        .await??;

        Ok(Self {
            inner: EmbeddingInner::FastEmbed {
                model: Arc::new(Mutex::new(model)),
                model_name,
                dimension,
            },
        })
    }

    pub fn backend_label(&self) -> &'static str {
        match self.inner {
            EmbeddingInner::Hashed { .. } => "hashed",
            EmbeddingInner::OpenAi { .. } => "openai",
            EmbeddingInner::FastEmbed { .. } => "fastembed",
        }
    }

    pub fn model_code(&self) -> Option<String> {
        match &self.inner {
            EmbeddingInner::Hashed { .. } => None,
            EmbeddingInner::OpenAi { model, .. } => Some(model.clone()),
            EmbeddingInner::FastEmbed { model_name, .. } => Some(model_name.to_string()),
        }
    }

    pub fn dimension(&self) -> usize {
        match &self.inner {
            EmbeddingInner::Hashed { dimension } => *dimension,
            EmbeddingInner::OpenAi { dimensions, .. } => *dimensions as usize,
            EmbeddingInner::FastEmbed { dimension, .. } => *dimension,
        }
    }

    /// Encode a batch, one vector per input in the same order. If
    /// `instruction` is given it is prepended (plus a space) to every text;
    /// if `norm` is set the outputs are L2-normalized.
    pub async fn batch_encode(
        &self,
        texts: &[String],
        instruction: Option<&str>,
        norm: bool,
    ) -> Result<Vec<Vec<f64>>, AppError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let prepared: Vec<String> = match instruction {
            Some(instruction) => texts
                .iter()
                .map(|text| format!("{instruction} {text}"))
                .collect(),
            None => texts.to_vec(),
        };

        let mut vectors = match &self.inner {
            EmbeddingInner::Hashed { dimension } => prepared
                .iter()
                .map(|text| hashed_embedding(text, *dimension))
                .collect(),
            EmbeddingInner::OpenAi {
                client,
                model,
                dimensions,
            } => encode_openai(client, model, *dimensions, &prepared).await?,
            EmbeddingInner::FastEmbed { model, .. } => {
                let mut guard = model.lock().await;
                guard
                    .embed(prepared.clone(), None)
                    .map_err(|e| AppError::InternalError(e.to_string()))?
                    .into_iter()
                    .map(|vector| vector.into_iter().map(f64::from).collect())
                    .collect()
            }
        };

        if vectors.len() != texts.len() {
            return Err(AppError::Invariant(format!(
                "embedding backend returned {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            )));
        }

        if norm {
            for vector in &mut vectors {
                l2_normalize(vector);
            }
        }

        debug!(
            backend = self.backend_label(),
            count = vectors.len(),
            "encoded embedding batch"
        );

        Ok(vectors)
    }
}

/// One embeddings API round trip for the whole batch.
async fn encode_openai(
    client: &Client<OpenAIConfig>,
    model: &str,
    dimensions: u32,
    inputs: &[String],
) -> Result<Vec<Vec<f64>>, AppError> {
    let request = CreateEmbeddingRequestArgs::default()
        .model(model)
        .dimensions(dimensions)
        .input(inputs.to_vec())
        .build()?;

    let response = client.embeddings().create(request).await?;

    let mut data = response.data;
    // The API reports an index per row; order by it rather than trusting
    // response order.
    data.sort_by_key(|row| row.index);

    if data.len() != inputs.len() {
        return Err(AppError::Anyhow(anyhow!(
            "embedding API returned {} rows for {} inputs",
            data.len(),
            inputs.len()
        )));
    }

    Ok(data
        .into_iter()
        .map(|row| row.embedding.into_iter().map(f64::from).collect())
        .collect())
}

pub fn l2_normalize(vector: &mut [f64]) {
    let norm = vector.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

/// Unit-norm token-bucket vector; stable across processes and platforms.
fn hashed_embedding(text: &str, dimension: usize) -> Vec<f64> {
    let dim = dimension.max(1);
    let mut vector = vec![0.0f64; dim];
    if text.is_empty() {
        return vector;
    }

    for token in tokens(text) {
        let idx = bucket(&token, dim);
        if let Some(slot) = vector.get_mut(idx) {
            *slot += 1.0;
        }
    }

    l2_normalize(&mut vector);
    vector
}

/// Lowercased alphanumeric runs of the input.
fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_ascii_lowercase())
}

/// Stable hash bucket for one token.
fn bucket(token: &str, dimension: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    (hasher.finish() as usize) % dimension
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashed_backend_is_deterministic_and_normalized() {
        let provider = EmbeddingProvider::new_hashed(64);
        let texts = vec!["Paris is the capital of France.".to_string()];

        let a = provider.batch_encode(&texts, None, true).await.unwrap();
        let b = provider.batch_encode(&texts, None, true).await.unwrap();
        assert_eq!(a, b, "hashed embeddings must be stable across calls");

        let norm: f64 = a[0].iter().map(|v| v * v).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-9, "expected unit vector, got {norm}");
    }

    #[tokio::test]
    async fn instruction_changes_the_encoding() {
        let provider = EmbeddingProvider::new_hashed(64);
        let texts = vec!["france".to_string()];

        let plain = provider.batch_encode(&texts, None, true).await.unwrap();
        let instructed = provider
            .batch_encode(&texts, Some("Given a question, retrieve facts"), true)
            .await
            .unwrap();
        assert_ne!(plain, instructed);
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let provider = EmbeddingProvider::new_hashed(8);
        let out = provider.batch_encode(&[], None, true).await.unwrap();
        assert!(out.is_empty());
    }
}

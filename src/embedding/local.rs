//! In-process sentence embeddings via `fastembed`.
//!
//! Models are downloaded from Hugging Face on first use and cached; after
//! that, embedding runs entirely offline. The ONNX runtime is bundled, so
//! there are no system dependencies.

/// Model used when `embedding.model` is unset.
pub const DEFAULT_LOCAL_MODEL: &str = "all-minilm-l6-v2";

const LOCAL_MODELS: &[(&str, usize)] = &[
    ("all-minilm-l6-v2", 384),
    ("bge-small-en-v1.5", 384),
    ("bge-base-en-v1.5", 768),
    ("bge-large-en-v1.5", 1024),
    ("nomic-embed-text-v1", 768),
    ("nomic-embed-text-v1.5", 768),
    ("multilingual-e5-small", 384),
    ("multilingual-e5-base", 768),
    ("multilingual-e5-large", 1024),
];

/// Output dimensionality of a supported local model.
pub fn local_model_dims(name: &str) -> Option<usize> {
    LOCAL_MODELS
        .iter()
        .find(|(model, _)| *model == name)
        .map(|(_, dims)| *dims)
}

pub fn supported_local_models() -> String {
    LOCAL_MODELS
        .iter()
        .map(|(model, _)| *model)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(feature = "local-embeddings-fastembed")]
pub use engine::LocalEmbedder;

#[cfg(feature = "local-embeddings-fastembed")]
mod engine {
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex, PoisonError};

    use super::{local_model_dims, supported_local_models, DEFAULT_LOCAL_MODEL};
    use crate::config::EmbeddingConfig;
    use crate::embedding::{check_batch, EmbeddingClient};
    use crate::error::RagError;

    fn fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel, RagError> {
        match name {
            "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
            "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
            "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
            "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
            "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
            "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
            other => Err(RagError::Validation(format!(
                "Unknown local embedding model: '{}'. Supported models: {}",
                other,
                supported_local_models()
            ))),
        }
    }

    /// Sentence-transformer embeddings computed in this process.
    ///
    /// The model is loaded lazily by the first batch and kept for the life
    /// of the embedder. Inference runs on the blocking pool.
    pub struct LocalEmbedder {
        model_name: String,
        model: fastembed::EmbeddingModel,
        dims: usize,
        batch_size: usize,
        engine: Arc<Mutex<Option<fastembed::TextEmbedding>>>,
    }

    impl LocalEmbedder {
        pub fn new(config: &EmbeddingConfig) -> Result<Self, RagError> {
            let model_name = config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_LOCAL_MODEL.to_string());
            let model = fastembed_model(&model_name)?;
            let dims = local_model_dims(&model_name).unwrap_or(config.dims);
            if dims != config.dims {
                return Err(RagError::Validation(format!(
                    "embedding.dims is {} but {} produces {}-dimensional vectors",
                    config.dims, model_name, dims
                )));
            }
            Ok(Self {
                model_name,
                model,
                dims,
                batch_size: config.batch_size.max(1),
                engine: Arc::new(Mutex::new(None)),
            })
        }
    }

    #[async_trait]
    impl EmbeddingClient for LocalEmbedder {
        fn model_name(&self) -> &str {
            &self.model_name
        }

        fn dims(&self) -> usize {
            self.dims
        }

        async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
            if texts.is_empty() {
                return Ok(Vec::new());
            }
            let engine = Arc::clone(&self.engine);
            let model = self.model.clone();
            let model_name = self.model_name.clone();
            let batch_size = self.batch_size;
            let inputs = texts.to_vec();

            let vectors = tokio::task::spawn_blocking(move || {
                let mut guard = engine.lock().unwrap_or_else(PoisonError::into_inner);
                if guard.is_none() {
                    tracing::info!(model = %model_name, "loading local embedding model");
                    let loaded = fastembed::TextEmbedding::try_new(
                        fastembed::InitOptions::new(model).with_show_download_progress(true),
                    )
                    .map_err(|e| {
                        RagError::EmbeddingUnavailable(format!(
                            "Failed to initialize local embedding model: {}",
                            e
                        ))
                    })?;
                    *guard = Some(loaded);
                }
                match guard.as_mut() {
                    Some(embedding) => embedding.embed(inputs, Some(batch_size)).map_err(|e| {
                        RagError::EmbeddingUnavailable(format!("Local embedding failed: {}", e))
                    }),
                    None => Err(RagError::EmbeddingUnavailable(
                        "local embedding model not loaded".into(),
                    )),
                }
            })
            .await
            .map_err(|e| RagError::EmbeddingUnavailable(format!("embedding task: {}", e)))??;

            check_batch(texts.len(), self.dims, vectors)
        }
    }

}

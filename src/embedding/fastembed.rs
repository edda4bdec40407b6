//! FastEmbed embedding provider implementation.
//!
//! Runs an embedding model locally through the fastembed library. No API
//! calls are made once the model files are cached, which makes this the
//! default provider for offline runs.

use super::{EmbeddingError, EmbeddingProvider, EmbeddingResult};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Local embedding provider backed by fastembed.
#[derive(Clone)]
pub struct FastEmbedProvider {
    /// The embedding model instance (shared across clones)
    model: Arc<Mutex<TextEmbedding>>,

    /// Model identifier
    model_name: String,

    /// Dimension of the embedding vectors
    embedding_dimension: usize,
}

/// Dimension produced by a fastembed model.
fn model_dimension(model: &EmbeddingModel) -> usize {
    match model {
        EmbeddingModel::AllMiniLML6V2 => 384,
        EmbeddingModel::BGESmallENV15 => 384,
        EmbeddingModel::BGEBaseENV15 => 768,
        EmbeddingModel::BGELargeENV15 => 1024,
        EmbeddingModel::NomicEmbedTextV1 => 768,
        EmbeddingModel::NomicEmbedTextV15 => 768,
        EmbeddingModel::ParaphraseMLMiniLML12V2 => 384,
        EmbeddingModel::ParaphraseMLMpnetBaseV2 => 768,
        _ => 384,
    }
}

/// Parse a user-facing model name into a fastembed model.
///
/// Accepts the enum spelling (`BGESmallENV15`) as well as the common
/// hub-style names (`bge-small-en-v1.5`), case-insensitively.
pub fn parse_model_name(name: &str) -> EmbeddingResult<EmbeddingModel> {
    let key: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase();
    let model = match key.as_str() {
        "allminilml6v2" => EmbeddingModel::AllMiniLML6V2,
        "bgesmallenv15" => EmbeddingModel::BGESmallENV15,
        "bgebaseenv15" => EmbeddingModel::BGEBaseENV15,
        "bgelargeenv15" => EmbeddingModel::BGELargeENV15,
        "nomicembedtextv1" => EmbeddingModel::NomicEmbedTextV1,
        "nomicembedtextv15" => EmbeddingModel::NomicEmbedTextV15,
        "paraphrasemlminilml12v2" | "paraphrasemultilingualminilml12v2" => {
            EmbeddingModel::ParaphraseMLMiniLML12V2
        }
        "paraphrasemlmpnetbasev2" | "paraphrasemultilingualmpnetbasev2" => {
            EmbeddingModel::ParaphraseMLMpnetBaseV2
        }
        _ => {
            return Err(EmbeddingError::ConfigError(format!(
                "Unknown FastEmbed model '{}'",
                name
            )))
        }
    };
    Ok(model)
}

impl FastEmbedProvider {
    /// Create a new FastEmbed embedding provider.
    ///
    /// # Arguments
    /// * `model` - Optional model to use (defaults to AllMiniLML6V2)
    /// * `cache_dir` - Optional cache directory for model files
    ///
    /// # Errors
    /// Returns `EmbeddingError::ConfigError` if model initialization fails
    pub fn new(model: Option<EmbeddingModel>, cache_dir: Option<PathBuf>) -> EmbeddingResult<Self> {
        let model_type = model.unwrap_or(EmbeddingModel::AllMiniLML6V2);
        let model_name = format!("{:?}", model_type);
        let embedding_dimension = model_dimension(&model_type);

        let mut init_options = InitOptions::new(model_type);
        if let Some(dir) = cache_dir {
            init_options = init_options.with_cache_dir(dir);
        }

        let text_embedding = TextEmbedding::try_new(init_options).map_err(|e| {
            EmbeddingError::ConfigError(format!("Failed to initialize FastEmbed model: {}", e))
        })?;

        Ok(Self {
            model: Arc::new(Mutex::new(text_embedding)),
            model_name,
            embedding_dimension,
        })
    }

    /// Create a provider from a model name such as `bge-small-en-v1.5`.
    pub fn from_model_name(name: &str, cache_dir: Option<PathBuf>) -> EmbeddingResult<Self> {
        Self::new(Some(parse_model_name(name)?), cache_dir)
    }

    /// Run the model on a worker thread so inference does not stall the runtime.
    async fn run_model(&self, texts: Vec<String>) -> EmbeddingResult<Vec<Vec<f32>>> {
        let model = Arc::clone(&self.model);
        tokio::task::spawn_blocking(move || {
            let mut model = model.blocking_lock();
            model
                .embed(texts, None)
                .map_err(|e| EmbeddingError::Other(format!("Embedding generation failed: {}", e)))
        })
        .await
        .map_err(|e| EmbeddingError::Other(format!("Embedding worker panicked: {}", e)))?
    }
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("Text cannot be empty".to_string()));
        }

        self.run_model(vec![text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Other("No embedding generated".to_string()))
    }

    async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        if texts.iter().any(|t| t.trim().is_empty()) {
            return Err(EmbeddingError::InvalidInput(
                "All texts must be non-empty".to_string(),
            ));
        }

        self.run_model(texts.iter().map(|&s| s.to_string()).collect())
            .await
    }

    fn dimension(&self) -> usize {
        self.embedding_dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn provider_name(&self) -> &str {
        "fastembed"
    }
}

// TextEmbedding does not implement Debug
impl std::fmt::Debug for FastEmbedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedProvider")
            .field("model_name", &self.model_name)
            .field("embedding_dimension", &self.embedding_dimension)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model_name_variants() {
        assert!(matches!(
            parse_model_name("bge-small-en-v1.5").unwrap(),
            EmbeddingModel::BGESmallENV15
        ));
        assert!(matches!(
            parse_model_name("AllMiniLML6V2").unwrap(),
            EmbeddingModel::AllMiniLML6V2
        ));
        assert!(matches!(
            parse_model_name("nomic-embed-text-v1.5").unwrap(),
            EmbeddingModel::NomicEmbedTextV15
        ));
        assert!(parse_model_name("word2vec").is_err());
    }

    #[test]
    fn test_model_dimensions() {
        assert_eq!(model_dimension(&EmbeddingModel::AllMiniLML6V2), 384);
        assert_eq!(model_dimension(&EmbeddingModel::BGEBaseENV15), 768);
        assert_eq!(model_dimension(&EmbeddingModel::BGELargeENV15), 1024);
    }

    // The tests below download model files on first use.

    #[tokio::test]
    #[ignore = "downloads the embedding model"]
    async fn test_embed_single_text() {
        let provider = FastEmbedProvider::new(None, None).unwrap();
        let embedding = provider
            .embed("Teachers describe burnout as emotional exhaustion.")
            .await
            .unwrap();
        assert_eq!(embedding.len(), provider.dimension());
        assert!(embedding.iter().all(|x| x.is_finite()));
    }

    #[tokio::test]
    #[ignore = "downloads the embedding model"]
    async fn test_embed_batch_matches_single() {
        let provider = FastEmbedProvider::new(None, None).unwrap();
        let text = "Peer support reduces attrition";
        let single = provider.embed(text).await.unwrap();
        let batch = provider.embed_batch(&[text]).await.unwrap();
        assert_eq!(batch.len(), 1);
        let diff: f32 = single
            .iter()
            .zip(batch[0].iter())
            .map(|(a, b)| (a - b).abs())
            .sum();
        assert!(diff < 1e-4);
    }

    #[tokio::test]
    #[ignore = "downloads the embedding model"]
    async fn test_empty_text_rejected() {
        let provider = FastEmbedProvider::new(None, None).unwrap();
        assert!(matches!(
            provider.embed("   ").await,
            Err(EmbeddingError::InvalidInput(_))
        ));
        assert!(matches!(
            provider.embed_batch(&["ok", ""]).await,
            Err(EmbeddingError::InvalidInput(_))
        ));
        assert!(provider.embed_batch(&[]).await.unwrap().is_empty());
    }
}

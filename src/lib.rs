//! Theme Engine - purpose-adaptive thematic analysis over research sources.
//!
//! This library turns a corpus of source documents (paper abstracts or full
//! texts) into a validated set of coherent themes, following a reflexive
//! thematic-analysis workflow adapted to the caller's research purpose.
//!
//! # Architecture
//!
//! The system is organized into several key modules:
//!
//! - **models**: Core data structures (SourceContent, InitialCode, CandidateTheme, ExtractionResult)
//! - **config**: Research purposes, purpose profiles and override resolution
//! - **embedding**: Embedding providers, cache and the batched embedding service
//! - **similarity**: Cosine similarity, centroids and distances
//! - **clustering**: k-means++ with silhouette-based selection of k
//! - **coherence**: Mean pairwise coherence and theme validation
//! - **labeling**: Local term-frequency theme labels
//! - **extraction**: Code extraction oracles and response validation
//! - **provider**: Source content providers
//! - **storage**: Persistence of finished runs (SQLite-based)
//! - **pipeline**: The six-stage orchestrator
//!
//! # Workflow
//!
//! 1. Resolve the research purpose and overrides into a validated configuration
//! 2. Familiarization: dedupe and embed the sources
//! 3. Initial coding: extract codes per source and embed them
//! 4. Theme generation and review, repeated over a growing source window
//!    until saturation
//! 5. Refinement: merge near-duplicate themes, cap the count
//! 6. Provenance assembly: per-source support and the quality score
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use theme_engine::{
//!     config::{ConfigOverrides, ResearchPurpose},
//!     embedding::fastembed::FastEmbedProvider,
//!     extraction::keyword::KeywordCodeExtractor,
//!     pipeline::{EngineSettings, ThemeExtractionEngine, TracingProgressSink},
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let embedder = Arc::new(FastEmbedProvider::new(None, None)?);
//!     let engine = ThemeExtractionEngine::new(
//!         embedder,
//!         Arc::new(KeywordCodeExtractor::new()),
//!         EngineSettings::default(),
//!     );
//!
//!     let result = engine
//!         .run(
//!             sources,
//!             ResearchPurpose::QualitativeAnalysis,
//!             &ConfigOverrides::default(),
//!             Arc::new(TracingProgressSink),
//!             CancellationToken::new(),
//!         )
//!         .await?;
//!
//!     for theme in &result.themes {
//!         println!("{} ({:.2})", theme.label, theme.coherence_score);
//!     }
//!     Ok(())
//! }
//! ```

// Public modules
pub mod clustering;
pub mod coherence;
pub mod config;
pub mod embedding;
pub mod extraction;
pub mod labeling;
pub mod models;
pub mod pipeline;
pub mod provider;
pub mod similarity;
pub mod storage;

// Re-export commonly used types at the crate root
pub use config::{ConfigOverrides, ResearchPurpose, ResolvedConfig, ValidationError};
pub use embedding::EmbeddingProvider;
pub use extraction::CodeExtractionOracle;
pub use models::{CandidateTheme, ExtractionResult, InitialCode, RunStatus, SourceContent};
pub use pipeline::{EngineSettings, PipelineError, ProgressSink, ThemeExtractionEngine};
pub use provider::ContentProvider;
pub use storage::ResultStore;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

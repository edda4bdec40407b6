//! JSON file content provider.
//!
//! Reads a JSON array of sources:
//!
//! ```json
//! [
//!   { "id": "10.1000/xyz", "title": "...", "abstract": "...", "content_kind": "abstract" }
//! ]
//! ```
//!
//! `text` and `abstract` are accepted for the body; when `content_kind` is
//! missing it is inferred from which of `full_text`/`text`/`abstract` is set.

use super::{ContentProvider, ProviderError, ProviderResult};
use crate::models::{ContentKind, SourceContent};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct RawSource {
    id: serde_json::Value,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "abstract")]
    abstract_text: Option<String>,
    #[serde(default)]
    full_text: Option<String>,
    #[serde(default)]
    content_kind: Option<ContentKind>,
}

impl RawSource {
    fn into_source(self, index: usize) -> Option<SourceContent> {
        let id = match self.id {
            serde_json::Value::String(s) => s,
            serde_json::Value::Number(n) => n.to_string(),
            _ => {
                warn!(index, "Skipping source without a usable id");
                return None;
            }
        };
        let (body, inferred) = if let Some(full) = self.full_text {
            (full, ContentKind::FullText)
        } else if let Some(text) = self.text {
            (text, ContentKind::Abstract)
        } else if let Some(abstract_text) = self.abstract_text {
            (abstract_text, ContentKind::Abstract)
        } else {
            (String::new(), ContentKind::Abstract)
        };
        let mut source = SourceContent::new(id, body, self.content_kind.unwrap_or(inferred));
        source.title = self.title;
        Some(source)
    }
}

/// Content provider backed by a JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileContentProvider {
    path: PathBuf,
    name: String,
}

impl JsonFileContentProvider {
    /// Create a provider for the given file. The file is read on each fetch.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let name = format!("json:{}", path.display());
        Self { path, name }
    }

    /// Parse sources from a JSON string.
    pub fn parse(json: &str) -> ProviderResult<Vec<SourceContent>> {
        let raw: Vec<RawSource> =
            serde_json::from_str(json).map_err(|e| ProviderError::ParseError(e.to_string()))?;
        Ok(raw
            .into_iter()
            .enumerate()
            .filter_map(|(i, r)| r.into_source(i))
            .collect())
    }

    async fn load(&self) -> ProviderResult<Vec<SourceContent>> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let sources = Self::parse(&contents)?;
        debug!(path = %self.path.display(), count = sources.len(), "Loaded sources");
        Ok(sources)
    }
}

#[async_trait]
impl ContentProvider for JsonFileContentProvider {
    async fn fetch(&self, source_ids: &[String]) -> ProviderResult<Vec<SourceContent>> {
        let mut by_id: HashMap<String, SourceContent> = self
            .load()
            .await?
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();

        let missing: Vec<String> = source_ids
            .iter()
            .filter(|id| !by_id.contains_key(*id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ProviderError::NotFound(missing));
        }
        Ok(source_ids
            .iter()
            .filter_map(|id| by_id.remove(id))
            .collect())
    }

    async fn fetch_all(&self) -> ProviderResult<Vec<SourceContent>> {
        self.load().await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"[
        {"id": "s1", "title": "Burnout", "abstract": "Teachers report exhaustion."},
        {"id": 42, "text": "Rural schools lose staff."},
        {"id": "s3", "full_text": "A long report on mentoring programs."},
        {"id": "s4", "text": "Explicit kind", "content_kind": "full_text"},
        {"id": null, "text": "no id"}
    ]"#;

    #[test]
    fn test_parse_shapes() {
        let sources = JsonFileContentProvider::parse(SAMPLE).unwrap();
        assert_eq!(sources.len(), 4);
        assert_eq!(sources[0].title.as_deref(), Some("Burnout"));
        assert_eq!(sources[0].word_count, 3);
        assert_eq!(sources[1].id, "42");
        assert_eq!(sources[2].content_kind, ContentKind::FullText);
        assert_eq!(sources[3].content_kind, ContentKind::FullText);
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            JsonFileContentProvider::parse("{not json"),
            Err(ProviderError::ParseError(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let provider = JsonFileContentProvider::new(file.path());

        assert_eq!(provider.fetch_all().await.unwrap().len(), 4);

        let picked = provider
            .fetch(&["s3".to_string(), "s1".to_string()])
            .await
            .unwrap();
        assert_eq!(picked[0].id, "s3");
        assert_eq!(picked[1].id, "s1");

        match provider.fetch(&["nope".to_string()]).await {
            Err(ProviderError::NotFound(ids)) => assert_eq!(ids, vec!["nope".to_string()]),
            other => panic!("expected NotFound, got {:?}", other),
        }
        assert!(provider.name().starts_with("json:"));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let provider = JsonFileContentProvider::new("/nonexistent/sources.json");
        assert!(matches!(
            provider.fetch_all().await,
            Err(ProviderError::IoError(_))
        ));
    }
}

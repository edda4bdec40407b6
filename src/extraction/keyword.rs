//! Deterministic rule-based code extractor.
//!
//! Scores each sentence of a source by how many of the source's frequent
//! terms it contains and turns the best sentences into codes. The label is
//! the sentence's two strongest terms, the description is the sentence
//! itself. No network access, so it doubles as the offline default oracle.

use super::{CodeExtractionOracle, ExtractionContext, OracleResult};
use crate::labeling::tokenize;
use crate::models::SourceContent;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;

/// Sentences with fewer content terms are not coded.
const MIN_SENTENCE_TERMS: usize = 2;

/// Source-level terms that count as "key" when scoring confidence.
const KEY_TERMS: usize = 5;

/// Rule engine producing sentence-level key-term codes.
#[derive(Debug, Clone, Default)]
pub struct KeywordCodeExtractor;

impl KeywordCodeExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Raw codes for a text, in sentence order.
    pub fn extract(&self, text: &str, budget: usize) -> Value {
        let sentences: Vec<(&str, Vec<String>)> = split_sentences(text)
            .into_iter()
            .map(|s| (s, tokenize(s)))
            .filter(|(_, terms)| terms.len() >= MIN_SENTENCE_TERMS)
            .collect();

        let mut frequency: HashMap<&str, usize> = HashMap::new();
        let mut first_seen: HashMap<&str, usize> = HashMap::new();
        let mut position = 0usize;
        for (_, terms) in &sentences {
            for term in terms {
                *frequency.entry(term.as_str()).or_insert(0) += 1;
                first_seen.entry(term.as_str()).or_insert(position);
                position += 1;
            }
        }
        let rank = |term: &str| {
            (
                std::cmp::Reverse(frequency.get(term).copied().unwrap_or(0)),
                first_seen.get(term).copied().unwrap_or(usize::MAX),
            )
        };

        let mut key_terms: Vec<&str> = frequency.keys().copied().collect();
        key_terms.sort_by_key(|t| rank(t));
        key_terms.truncate(KEY_TERMS);

        // Best sentences first, ties by position
        let mut scored: Vec<(usize, usize)> = sentences
            .iter()
            .enumerate()
            .map(|(i, (_, terms))| {
                let score = terms
                    .iter()
                    .map(|t| frequency.get(t.as_str()).copied().unwrap_or(0))
                    .sum::<usize>();
                (i, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let mut chosen: Vec<usize> = scored.into_iter().take(budget).map(|(i, _)| i).collect();
        chosen.sort_unstable();

        let codes: Vec<Value> = chosen
            .into_iter()
            .map(|i| {
                let (sentence, terms) = &sentences[i];
                let mut distinct: Vec<&str> = terms.iter().map(String::as_str).collect();
                distinct.sort_by_key(|t| rank(t));
                distinct.dedup();
                let label = distinct
                    .iter()
                    .take(2)
                    .map(|t| capitalize(t))
                    .collect::<Vec<_>>()
                    .join(" ");
                let key_hits = distinct.iter().filter(|t| key_terms.contains(t)).count();
                let confidence = (0.5 + 0.25 * key_hits as f64).min(1.0);
                json!({
                    "label": label,
                    "description": sentence.trim(),
                    "confidence": confidence,
                })
            })
            .collect();

        json!({ "codes": codes })
    }
}

fn split_sentences(text: &str) -> Vec<&str> {
    text.split(|c| matches!(c, '.' | '!' | '?' | ';' | '\n'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn capitalize(term: &str) -> String {
    let mut chars = term.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[async_trait]
impl CodeExtractionOracle for KeywordCodeExtractor {
    async fn extract_codes(
        &self,
        source: &SourceContent,
        context: &ExtractionContext,
    ) -> OracleResult<Value> {
        Ok(self.extract(&source.text, context.code_budget(source.word_count)))
    }

    fn name(&self) -> &str {
        "keyword"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::validate_codes;

    const TEXT: &str = "Teacher burnout is driven by workload. \
        Rural schools struggle with teacher retention! \
        Mentoring programs reduce burnout among teacher cohorts. \
        It is. \
        Funding cuts increase workload pressure?";

    #[test]
    fn test_extracts_best_sentences_in_order() {
        let raw = KeywordCodeExtractor::new().extract(TEXT, 3);
        let codes = raw["codes"].as_array().unwrap();
        assert_eq!(codes.len(), 3);

        let descriptions: Vec<&str> = codes
            .iter()
            .map(|c| c["description"].as_str().unwrap())
            .collect();
        assert_eq!(
            descriptions,
            vec![
                "Teacher burnout is driven by workload",
                "Rural schools struggle with teacher retention",
                "Mentoring programs reduce burnout among teacher cohorts",
            ]
        );
        assert_eq!(codes[0]["label"], "Teacher Burnout");
    }

    #[test]
    fn test_output_passes_validation() {
        let raw = KeywordCodeExtractor::new().extract(TEXT, 10);
        let validated = validate_codes(&raw, "s1", 0.5, 10).unwrap();
        assert_eq!(validated.codes.len(), 4);
        assert_eq!(validated.rejected, 0);
        assert!(validated.codes.iter().all(|c| c.source_id == "s1"));
    }

    #[test]
    fn test_confidence_reflects_key_terms() {
        let raw = KeywordCodeExtractor::new().extract(TEXT, 10);
        for code in raw["codes"].as_array().unwrap() {
            let c = code["confidence"].as_f64().unwrap();
            assert!((0.5..=1.0).contains(&c));
        }
        assert_eq!(raw["codes"][0]["confidence"].as_f64().unwrap(), 1.0);
    }

    #[test]
    fn test_deterministic_and_empty_text() {
        let extractor = KeywordCodeExtractor::new();
        assert_eq!(extractor.extract(TEXT, 4), extractor.extract(TEXT, 4));
        let empty = extractor.extract("   ", 4);
        assert!(empty["codes"].as_array().unwrap().is_empty());
    }
}

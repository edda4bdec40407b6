//! Local statistical theme labeler.
//!
//! Names themes from term frequency over their codes' labels and
//! descriptions. Pure and synchronous: no network, no model, so labeling is
//! always available and costs nothing regardless of the code extractor.

use crate::models::{CandidateTheme, InitialCode};
use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;

/// Label used when a theme has no codes at all.
pub const UNLABELED: &str = "Unlabeled Theme";

/// Tokens of this length or shorter are ignored.
const MIN_TERM_LEN: usize = 4;

// Only words longer than three characters matter; shorter ones are
// dropped by length already.
const STOPWORDS: &[&str] = &[
    "about", "above", "across", "after", "again", "against", "also", "among", "another",
    "based", "because", "been", "before", "being", "below", "between", "both", "could", "does",
    "doing", "down", "during", "each", "either", "every", "found", "from", "further", "have",
    "having", "here", "hers", "herself", "himself", "however", "into", "itself", "just",
    "like", "many", "more", "most", "much", "must", "myself", "neither", "only", "other",
    "ours", "ourselves", "over", "paper", "same", "several", "should", "show", "shown",
    "shows", "some", "study", "studies", "such", "than", "that", "their", "theirs", "them",
    "themselves", "then", "there", "therefore", "these", "they", "this", "those", "through",
    "thus", "toward", "towards", "under", "until", "upon", "used", "using", "very", "were",
    "what", "when", "where", "whether", "which", "while", "whom", "whose", "will", "with",
    "within", "without", "would", "your", "yours", "yourself",
];

fn stopwords() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| STOPWORDS.iter().copied().collect())
}

/// Whether a lowercase token is a stopword.
pub fn is_stopword(token: &str) -> bool {
    stopwords().contains(token)
}

/// Lowercase content terms of a text: alphanumeric runs longer than three
/// characters that are neither stopwords nor pure numbers.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= MIN_TERM_LEN)
        .map(str::to_lowercase)
        .filter(|t| !is_stopword(t) && !t.chars().all(|c| c.is_ascii_digit()))
        .collect()
}

/// Term frequencies over all labels and descriptions, most frequent first,
/// ties broken alphabetically.
pub fn term_frequencies(codes: &[InitialCode]) -> Vec<(String, usize)> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for code in codes {
        for token in tokenize(&code.label)
            .into_iter()
            .chain(tokenize(&code.description))
        {
            *counts.entry(token).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    // BTreeMap order is alphabetical, and the sort is stable
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked
}

fn title_case(term: &str) -> String {
    let mut chars = term.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Generated naming for one theme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThemeLabel {
    pub label: String,
    pub description: String,
    pub definition: String,
    pub keywords: Vec<String>,
}

/// Deterministic term-frequency labeler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalLabeler {
    /// Top terms joined into the label
    pub label_terms: usize,
    pub max_keywords: usize,
    /// Distinct code descriptions combined into the description
    pub description_parts: usize,
}

impl Default for LocalLabeler {
    fn default() -> Self {
        Self {
            label_terms: 3,
            max_keywords: 5,
            description_parts: 3,
        }
    }
}

impl LocalLabeler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name a group of codes.
    pub fn label(&self, codes: &[InitialCode]) -> ThemeLabel {
        let ranked = term_frequencies(codes);
        let keywords: Vec<String> = ranked
            .iter()
            .take(self.max_keywords)
            .map(|(term, _)| term.clone())
            .collect();

        let label = if ranked.is_empty() {
            most_frequent_label(codes).unwrap_or_else(|| UNLABELED.to_string())
        } else {
            ranked
                .iter()
                .take(self.label_terms)
                .map(|(term, _)| title_case(term))
                .collect::<Vec<_>>()
                .join(" ")
        };

        let mut seen = HashSet::new();
        let description = codes
            .iter()
            .map(|c| c.description.trim())
            .filter(|d| !d.is_empty() && seen.insert(d.to_lowercase()))
            .take(self.description_parts)
            .collect::<Vec<_>>()
            .join(" ");

        let definition = definition(codes.len(), &keywords);
        ThemeLabel {
            label,
            description,
            definition,
            keywords,
        }
    }

    /// Relabel a theme in place from its current codes.
    pub fn apply(&self, theme: &mut CandidateTheme) {
        let ThemeLabel {
            label,
            description,
            definition,
            keywords,
        } = self.label(&theme.codes);
        theme.label = label;
        theme.description = description;
        theme.definition = definition;
        theme.keywords = keywords;
    }
}

/// Most common code label, ties broken alphabetically.
fn most_frequent_label(codes: &[InitialCode]) -> Option<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for code in codes {
        let label = code.label.trim();
        if !label.is_empty() {
            *counts.entry(label).or_insert(0) += 1;
        }
    }
    counts
        .into_iter()
        .fold(None, |best: Option<(&str, usize)>, (label, count)| match best {
            Some((_, c)) if c >= count => best,
            _ => Some((label, count)),
        })
        .map(|(label, _)| label.to_string())
}

fn definition(size: usize, keywords: &[String]) -> String {
    let noun = if size == 1 { "code" } else { "codes" };
    match keywords {
        [] => format!("A theme of {} {}.", size, noun),
        [only] => format!("A theme of {} {} centred on {}.", size, noun, only),
        [init @ .., last] => format!(
            "A theme of {} {} centred on {} and {}.",
            size,
            noun,
            init.join(", "),
            last
        ),
    }
}

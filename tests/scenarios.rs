//! End-to-end scenarios for the extraction pipeline.
//!
//! Every test uses in-process embedders and oracles so the whole pipeline
//! runs offline and deterministically.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use theme_engine::clustering::ClusteringEngine;
use theme_engine::coherence::{calculate_theme_coherence, CoherenceValidator, ThemeVerdict, DEFAULT_COHERENCE};
use theme_engine::config::{resolve, ConfigOverrides, ResearchPurpose, ThemeRange};
use theme_engine::embedding::{EmbeddingProvider, EmbeddingResult};
use theme_engine::extraction::keyword::KeywordCodeExtractor;
use theme_engine::extraction::{CodeExtractionOracle, ExtractionContext, OracleResult};
use theme_engine::labeling::tokenize;
use theme_engine::models::{ContentKind, Embedding, ExtractionResult, InitialCode, SourceContent};
use theme_engine::pipeline::{
    EngineSettings, NoopProgressSink, PipelineError, SaturationTracker, ThemeExtractionEngine,
};
use theme_engine::provider::json::JsonFileContentProvider;
use theme_engine::provider::{ContentProvider, ProviderResult};
use tokio_util::sync::CancellationToken;

// ===== Mock Implementations =====

const VOCABULARY_DIMENSION: usize = 512;

/// Embeds a text as counts of its content terms, one dimension per distinct
/// term in order of first appearance.
#[derive(Default)]
struct VocabularyEmbedder {
    vocabulary: Mutex<HashMap<String, usize>>,
    calls: AtomicUsize,
}

impl VocabularyEmbedder {
    fn new() -> Self {
        Self::default()
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; VOCABULARY_DIMENSION];
        let tokens = tokenize(text);
        if tokens.is_empty() {
            vector[VOCABULARY_DIMENSION - 1] = 1.0;
            return vector;
        }
        let mut vocabulary = self.vocabulary.lock().unwrap();
        for token in tokens {
            let next = vocabulary.len();
            let index = *vocabulary.entry(token).or_insert(next);
            vector[index % VOCABULARY_DIMENSION] += 1.0;
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for VocabularyEmbedder {
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.vector(text))
    }

    async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }

    fn dimension(&self) -> usize {
        VOCABULARY_DIMENSION
    }

    fn model_name(&self) -> &str {
        "vocabulary"
    }

    fn provider_name(&self) -> &str {
        "mock"
    }
}

/// Looks up the vector of a code by its label, the text before the first ':'.
struct TableEmbedder {
    table: HashMap<String, Vec<f32>>,
    fallback: Vec<f32>,
}

impl TableEmbedder {
    fn new(entries: Vec<(&str, Vec<f32>)>) -> Self {
        let dimension = entries.first().map_or(8, |(_, v)| v.len());
        Self {
            table: entries
                .into_iter()
                .map(|(label, vector)| (label.to_lowercase(), vector))
                .collect(),
            fallback: vec![0.25; dimension],
        }
    }

    fn vector(&self, text: &str) -> Vec<f32> {
        let key = text.split(':').next().unwrap_or("").trim().to_lowercase();
        self.table.get(&key).cloned().unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl EmbeddingProvider for TableEmbedder {
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
        Ok(self.vector(text))
    }

    async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.fallback.len()
    }

    fn model_name(&self) -> &str {
        "table"
    }

    fn provider_name(&self) -> &str {
        "mock"
    }
}

/// Returns a fixed response per source id and counts calls.
#[derive(Clone, Default)]
struct ScriptedOracle {
    responses: Arc<Mutex<HashMap<String, Value>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedOracle {
    fn new() -> Self {
        Self::default()
    }

    fn with_response(self, source_id: &str, response: Value) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(source_id.to_string(), response);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CodeExtractionOracle for ScriptedOracle {
    async fn extract_codes(
        &self,
        source: &SourceContent,
        _context: &ExtractionContext,
    ) -> OracleResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let responses = self.responses.lock().unwrap();
        Ok(responses
            .get(&source.id)
            .cloned()
            .unwrap_or_else(|| json!([])))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Keyword coder that counts its calls.
#[derive(Clone, Default)]
struct CountingKeywordOracle {
    inner: KeywordCodeExtractor,
    calls: Arc<AtomicUsize>,
}

impl CountingKeywordOracle {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CodeExtractionOracle for CountingKeywordOracle {
    async fn extract_codes(
        &self,
        source: &SourceContent,
        context: &ExtractionContext,
    ) -> OracleResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.extract_codes(source, context).await
    }

    fn name(&self) -> &str {
        "counting-keyword"
    }
}

/// Content provider that counts fetches.
#[derive(Default)]
struct CountingProvider {
    sources: Vec<SourceContent>,
    fetches: AtomicUsize,
}

#[async_trait]
impl ContentProvider for CountingProvider {
    async fn fetch(&self, source_ids: &[String]) -> ProviderResult<Vec<SourceContent>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .sources
            .iter()
            .filter(|s| source_ids.contains(&s.id))
            .cloned()
            .collect())
    }

    async fn fetch_all(&self) -> ProviderResult<Vec<SourceContent>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.sources.clone())
    }

    fn name(&self) -> &str {
        "counting"
    }
}

// ===== Test Helper Functions =====

/// Eight unrelated vocabularies; every word is a content term.
const TOPICS: [[&str; 6]; 8] = [
    ["burnout", "workload", "exhaustion", "retention", "mentoring", "classroom"],
    ["funding", "budget", "grants", "endowment", "tuition", "revenue"],
    ["vaccine", "immunity", "antibody", "pathogen", "dosage", "booster"],
    ["drought", "irrigation", "rainfall", "aquifer", "harvest", "salinity"],
    ["encryption", "cipher", "password", "firewall", "malware", "phishing"],
    ["housing", "mortgage", "tenant", "landlord", "eviction", "rental"],
    ["migration", "refugee", "asylum", "border", "citizenship", "visa"],
    ["algorithm", "compiler", "runtime", "parser", "syntax", "bytecode"],
];

/// Words too short to be content terms.
const FILLERS: [&str; 12] = [
    "the", "and", "for", "but", "its", "our", "new", "old", "per", "via", "all", "any",
];

/// One sentence of fifteen words: the topic's six terms interleaved with
/// fillers chosen by `variant`.
fn topic_sentence(topic: usize, variant: usize) -> String {
    let mut words = Vec::with_capacity(15);
    for (k, term) in TOPICS[topic].iter().enumerate() {
        words.push(FILLERS[(variant + k * 5) % FILLERS.len()]);
        words.push(term);
    }
    for k in 0..3 {
        words.push(FILLERS[(variant * 7 + k) % FILLERS.len()]);
    }
    format!("{}.", words.join(" "))
}

/// About 150 words: ten distinct sentences on one topic and a case number.
fn topic_abstract(index: usize) -> SourceContent {
    let topic = index % TOPICS.len();
    let body: Vec<String> = (0..10).map(|variant| topic_sentence(topic, variant)).collect();
    let text = format!("{} Case {}.", body.join(" "), 1000 + index);
    SourceContent::new(format!("source-{:03}", index), text, ContentKind::Abstract)
}

fn topic_of(keywords: &[String]) -> Option<usize> {
    TOPICS
        .iter()
        .position(|terms| keywords.iter().any(|k| k == terms[0]))
}

/// Axis vectors giving pairwise similarity ~0.8 inside a group, ~0.1 across.
fn axis(major: usize, minor: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; 8];
    v[major] = 1.0;
    v[1 - major] = 0.05;
    v[minor] = 0.5;
    v
}

fn code_with(id: &str, vector: Vec<f32>) -> InitialCode {
    InitialCode::new(id, id, format!("description of {}", id), "source-1")
        .with_embedding(Embedding::new(vector))
}

fn memberships(groups: impl Iterator<Item = Vec<String>>) -> BTreeSet<BTreeSet<String>> {
    groups.map(|ids| ids.into_iter().collect()).collect()
}

async fn run_engine(
    engine: &ThemeExtractionEngine,
    sources: Vec<SourceContent>,
    purpose: ResearchPurpose,
    overrides: &ConfigOverrides,
) -> Result<ExtractionResult, PipelineError> {
    engine
        .run(
            sources,
            purpose,
            overrides,
            Arc::new(NoopProgressSink),
            CancellationToken::new(),
        )
        .await
}

// ===== Scenario Tests =====

#[test]
fn scenario_a_two_tight_groups_cluster_into_two_coherent_themes() {
    let codes = vec![
        code_with("a1", axis(0, 2)),
        code_with("a2", axis(0, 3)),
        code_with("a3", axis(0, 4)),
        code_with("b1", axis(1, 5)),
        code_with("b2", axis(1, 6)),
        code_with("b3", axis(1, 7)),
    ];

    let outcome = ClusteringEngine::default()
        .cluster(codes, ThemeRange::new(2, 5))
        .unwrap();
    assert_eq!(outcome.selected_k, 2, "Adaptive k should find the two groups");
    assert!(!outcome.low_confidence);

    let expected = memberships(
        [vec!["a1", "a2", "a3"], vec!["b1", "b2", "b3"]]
            .into_iter()
            .map(|ids| ids.into_iter().map(String::from).collect()),
    );
    let actual = memberships(
        outcome
            .clusters
            .iter()
            .map(|c| c.codes.iter().map(|code| code.id.clone()).collect()),
    );
    assert_eq!(actual, expected);

    for cluster in &outcome.clusters {
        let coherence = calculate_theme_coherence(&cluster.codes).unwrap();
        assert!(
            (coherence - 0.80).abs() < 0.01,
            "Intra-group coherence should be about 0.8, got {}",
            coherence
        );
    }
}

#[tokio::test]
async fn scenario_a_end_to_end_from_json_file() {
    let sources = json!([
        {"id": "s1", "title": "First", "abstract": "First source on alpha and beta matters."},
        {"id": "s2", "title": "Second", "abstract": "Second source on alpha and beta matters."},
        {"id": "s3", "title": "Third", "abstract": "Third source on alpha and beta matters."},
    ]);
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}", sources).unwrap();
    let provider = JsonFileContentProvider::new(file.path());

    let oracle = ScriptedOracle::new()
        .with_response("s1", json!([
            {"label": "Alpha one", "description": "Alpha finding one"},
            {"label": "Beta one", "description": "Beta finding one"},
        ]))
        .with_response("s2", json!([
            {"label": "Alpha two", "description": "Alpha finding two"},
            {"label": "Beta two", "description": "Beta finding two"},
        ]))
        .with_response("s3", json!([
            {"label": "Alpha three", "description": "Alpha finding three"},
            {"label": "Beta three", "description": "Beta finding three"},
        ]));
    let embedder = TableEmbedder::new(vec![
        ("alpha one", axis(0, 2)),
        ("alpha two", axis(0, 3)),
        ("alpha three", axis(0, 4)),
        ("beta one", axis(1, 5)),
        ("beta two", axis(1, 6)),
        ("beta three", axis(1, 7)),
    ]);
    let engine = ThemeExtractionEngine::new(
        Arc::new(embedder),
        Arc::new(oracle.clone()),
        EngineSettings::default(),
    );
    let overrides = ConfigOverrides::from_pairs([("minThemes", "2"), ("maxThemes", "6")]).unwrap();

    let result = engine
        .run_from_provider(
            &provider,
            None,
            ResearchPurpose::QualitativeAnalysis,
            &overrides,
            Arc::new(NoopProgressSink),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(result.status.is_complete());
    assert_eq!(oracle.calls(), 3);
    assert_eq!(result.theme_count(), 2, "Both groups should survive as themes");
    for theme in &result.themes {
        assert!((theme.coherence_score - 0.80).abs() < 0.01);
        assert_eq!(theme.size(), 3);
        assert_eq!(theme.source_ids, vec!["s1", "s2", "s3"]);
        let provenance = theme.provenance.as_ref().unwrap();
        let shares: f32 = provenance.contributions.iter().map(|c| c.influence).sum();
        assert!((shares - 1.0).abs() < 1e-5, "Influence shares must sum to one");
    }
    let labels: HashSet<&str> = result.themes.iter().map(|t| t.label.as_str()).collect();
    assert!(labels.iter().any(|l| l.contains("Alpha")));
    assert!(labels.iter().any(|l| l.contains("Beta")));
}

#[tokio::test]
async fn scenario_b_single_code_completes_with_default_coherence() {
    let oracle = ScriptedOracle::new().with_response(
        "only",
        json!({"codes": [{"label": "Peer mentoring", "description": "Mentors ease the first year", "confidence": 0.9}]}),
    );
    let engine = ThemeExtractionEngine::new(
        Arc::new(VocabularyEmbedder::new()),
        Arc::new(oracle),
        EngineSettings::default(),
    );

    let result = run_engine(
        &engine,
        vec![SourceContent::new(
            "only",
            "Mentors ease the first year of teaching.",
            ContentKind::Abstract,
        )],
        ResearchPurpose::QualitativeAnalysis,
        &ConfigOverrides::default(),
    )
    .await
    .unwrap();

    assert!(result.status.is_complete());
    assert_eq!(result.theme_count(), 1);
    assert!(result.low_confidence, "One code cannot fill the target range");
    let theme = &result.themes[0];
    assert!(theme.low_confidence);
    assert_eq!(theme.coherence_score, DEFAULT_COHERENCE);
    // 0.7 * 0.5 coherence + 0.3 * full coverage
    assert!((result.quality_score - 0.65).abs() < 1e-5);
}

#[tokio::test]
async fn scenario_c_large_corpus_reaches_saturation_within_range() {
    let sources: Vec<SourceContent> = (0..361).map(topic_abstract).collect();
    assert!(sources.iter().all(|s| (140..=160).contains(&s.word_count)));

    let oracle = CountingKeywordOracle::default();
    let engine = ThemeExtractionEngine::new(
        Arc::new(VocabularyEmbedder::new()),
        Arc::new(oracle.clone()),
        EngineSettings::default(),
    );

    let result = run_engine(
        &engine,
        sources,
        ResearchPurpose::QualitativeAnalysis,
        &ConfigOverrides::default(),
    )
    .await
    .unwrap();

    assert!(result.status.is_complete(), "Run failed: {:?}", result.status);
    assert!(result.saturation_reached, "Saturation should be reached");
    assert!(
        (5..=20).contains(&result.theme_count()),
        "Theme count {} outside [5, 20]",
        result.theme_count()
    );
    assert_eq!(result.theme_count(), 8, "One theme per topic");
    assert_eq!(result.iterations, 2, "The second window adds nothing new");
    assert_eq!(oracle.calls(), 361);

    let topics: HashSet<usize> = result
        .themes
        .iter()
        .filter_map(|t| topic_of(&t.keywords))
        .collect();
    assert_eq!(topics.len(), 8, "Every topic should have its own theme");

    let reviews = result
        .per_stage_stats
        .iter()
        .filter(|s| s.stage == "theme_review")
        .count();
    assert_eq!(reviews, 2);
    assert!(result.quality_score > 0.9);
}

#[tokio::test]
async fn scenario_d_nan_threshold_fails_before_any_work() {
    let mut overrides = ConfigOverrides::default();
    overrides.set("qualityThreshold", "NaN").unwrap();

    let embedder = Arc::new(VocabularyEmbedder::new());
    let oracle = CountingKeywordOracle::default();
    let engine = ThemeExtractionEngine::new(
        embedder.clone(),
        Arc::new(oracle.clone()),
        EngineSettings::default(),
    );
    let provider = CountingProvider {
        sources: (0..8).map(topic_abstract).collect(),
        ..Default::default()
    };

    let result = engine
        .run_from_provider(
            &provider,
            None,
            ResearchPurpose::QualitativeAnalysis,
            &overrides,
            Arc::new(NoopProgressSink),
            CancellationToken::new(),
        )
        .await;

    assert!(matches!(result, Err(PipelineError::Validation(_))));
    assert_eq!(provider.fetches.load(Ordering::SeqCst), 0, "Nothing fetched");
    assert_eq!(oracle.calls(), 0, "No oracle call");
    assert_eq!(embedder.calls(), 0, "No embedding call");
}

// ===== Property Tests =====

#[test]
fn coherence_stays_in_unit_interval() {
    let mut rng = StdRng::seed_from_u64(7);
    for round in 0..50 {
        let n = rng.gen_range(2..20);
        let codes: Vec<InitialCode> = (0..n)
            .map(|i| {
                let vector: Vec<f32> = (0..16).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
                code_with(&format!("r{}-{}", round, i), vector)
            })
            .collect();
        let coherence = calculate_theme_coherence(&codes).unwrap();
        assert!(
            (0.0..=1.0).contains(&coherence),
            "Coherence {} out of range in round {}",
            coherence,
            round
        );
    }

    assert_eq!(calculate_theme_coherence(&[]).unwrap(), DEFAULT_COHERENCE);
}

#[test]
fn clustering_ignores_input_order() {
    let mut codes = vec![
        code_with("a1", axis(0, 2)),
        code_with("a2", axis(0, 3)),
        code_with("a3", axis(0, 4)),
        code_with("b1", axis(1, 5)),
        code_with("b2", axis(1, 6)),
        code_with("b3", axis(1, 7)),
    ];
    let engine = ClusteringEngine::default();
    let baseline = engine.cluster(codes.clone(), ThemeRange::new(2, 4)).unwrap();
    let membership = |outcome: &theme_engine::clustering::ClusteringOutcome| {
        memberships(
            outcome
                .clusters
                .iter()
                .map(|c| c.codes.iter().map(|code| code.id.clone()).collect()),
        )
    };

    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..5 {
        for i in (1..codes.len()).rev() {
            let j = rng.gen_range(0..=i);
            codes.swap(i, j);
        }
        let shuffled = engine.cluster(codes.clone(), ThemeRange::new(2, 4)).unwrap();
        assert_eq!(membership(&shuffled), membership(&baseline));
    }
}

#[tokio::test]
async fn saturated_run_gains_nothing_from_another_pass() {
    let sources: Vec<SourceContent> = (0..48).map(topic_abstract).collect();
    let overrides = ConfigOverrides::from_pairs([
        ("min_themes", "2"),
        ("max_themes", "12"),
        ("sources_per_iteration", "16"),
    ])
    .unwrap();
    let engine = ThemeExtractionEngine::new(
        Arc::new(VocabularyEmbedder::new()),
        Arc::new(KeywordCodeExtractor::new()),
        EngineSettings::default(),
    );

    let first = run_engine(&engine, sources.clone(), ResearchPurpose::QualitativeAnalysis, &overrides)
        .await
        .unwrap();
    assert!(first.saturation_reached);

    // One more pass over the accepted themes finds nothing new
    let config = resolve(ResearchPurpose::QualitativeAnalysis, &overrides).unwrap();
    let mut tracker = SaturationTracker::new(config.saturation.clone(), config.theme_range().max);
    tracker.observe(&first.themes);
    let again = tracker.observe(&first.themes);
    assert_eq!(again.new_themes, 0);
    assert!(again.saturated());

    // A rerun over the same corpus settles on the same themes
    let second = run_engine(&engine, sources, ResearchPurpose::QualitativeAnalysis, &overrides)
        .await
        .unwrap();
    assert!(second.saturation_reached);
    let labels = |r: &ExtractionResult| -> BTreeSet<String> {
        r.themes.iter().map(|t| t.label.clone()).collect()
    };
    assert_eq!(labels(&second), labels(&first));
    assert!(second.theme_count() <= first.theme_count());
}

#[test]
fn invalid_overrides_are_always_rejected() {
    let invalid: [(&str, &str); 8] = [
        ("quality_threshold", "NaN"),
        ("max_themes", "inf"),
        ("min_themes", "-3"),
        ("max_themes", "2.5"),
        ("quality_threshold", "1.5"),
        ("validation_rigor", "extreme"),
        ("min_themes", "30"),
        ("max_iterations", "0"),
    ];
    for (key, value) in invalid {
        let overrides = ConfigOverrides::from_pairs([(key, value)]).unwrap();
        assert!(
            resolve(ResearchPurpose::QualitativeAnalysis, &overrides).is_err(),
            "{}={} should be rejected",
            key,
            value
        );
    }

    let valid = ConfigOverrides::from_pairs([
        ("min_themes", "3"),
        ("max_themes", "9"),
        ("validation_rigor", "publication-ready"),
        ("novelty_threshold", "0.75"),
    ])
    .unwrap();
    let config = resolve(ResearchPurpose::QualitativeAnalysis, &valid).unwrap();
    assert_eq!(config.theme_range(), ThemeRange::new(3, 9));
    assert_eq!(config.quality_threshold, 0.5);

    let validator = CoherenceValidator::new(config.quality_threshold);
    let theme_codes = vec![code_with("x", axis(0, 2)), code_with("y", axis(0, 3))];
    let coherence = calculate_theme_coherence(&theme_codes).unwrap();
    assert!(coherence > validator.threshold());
}

#[test]
fn rejected_theme_verdict_carries_score() {
    let validator = CoherenceValidator::new(0.9);
    let codes = vec![code_with("x", axis(0, 2)), code_with("y", axis(1, 5))];
    let theme = theme_engine::models::CandidateTheme {
        id: "t".to_string(),
        label: "t".to_string(),
        description: String::new(),
        keywords: Vec::new(),
        definition: String::new(),
        codes,
        centroid: Vec::new(),
        source_ids: Vec::new(),
        coherence_score: 0.0,
        low_confidence: false,
        provenance: None,
    };
    match validator.validate(&theme) {
        ThemeVerdict::Rejected(score) => assert!(score < 0.2),
        other => panic!("expected a rejection, got {:?}", other),
    }
}

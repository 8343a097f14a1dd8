use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use schema_taxonomy::classifier::{ClassifyError, EmbedError};
use schema_taxonomy::prompts::PromptInstance;
use schema_taxonomy::registry::RegistrySet;
use schema_taxonomy::sampler::SamplerConfig;
use schema_taxonomy::store::{CorpusStore, SqliteCorpusStore};
use schema_taxonomy::vote::ConsensusValue;
use schema_taxonomy::{Classifier, Dimension, Embedder, Pipeline, PipelineConfig, Problem};
use serde_json::{json, Value};
use tempfile::tempdir;

fn problem(id: &str) -> Problem {
    Problem {
        id: id.into(),
        source: "test".into(),
        title: format!("Problem {id}"),
        description: "Given an array of n integers.".into(),
        input: "n, then n integers".into(),
        output: "one integer".into(),
        constraints: "1 <= n <= 100000".into(),
    }
}

fn raw_labels_in(prompt: &PromptInstance) -> Vec<String> {
    prompt
        .user
        .split("<raw_labels>")
        .nth(1)
        .unwrap_or_default()
        .lines()
        .filter_map(|l| l.strip_prefix("- "))
        .map(str::to_string)
        .collect()
}

/// Answers input-structure extraction rounds from a script, and merge
/// requests from a fixed raw -> (canonical, is_new) table.
struct ScriptedClassifier {
    rounds: Mutex<Vec<&'static str>>,
    merges: HashMap<&'static str, (&'static str, bool)>,
    extraction_calls: AtomicUsize,
    merge_prompts: Mutex<Vec<Vec<String>>>,
}

impl ScriptedClassifier {
    fn new(rounds: Vec<&'static str>, merges: &[(&'static str, &'static str, bool)]) -> Self {
        Self {
            rounds: Mutex::new(rounds),
            merges: merges.iter().map(|&(raw, to, new)| (raw, (to, new))).collect(),
            extraction_calls: AtomicUsize::new(0),
            merge_prompts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, prompt: &PromptInstance, _temperature: f32) -> Result<Value, ClassifyError> {
        if prompt.template_slug == "normalize_v1" {
            let raw = raw_labels_in(prompt);
            self.merge_prompts.lock().unwrap().push(raw.clone());
            let mappings: Vec<Value> = raw
                .iter()
                .map(|r| {
                    let (to, is_new) = self.merges.get(r.as_str()).copied().unwrap_or((r.as_str(), true));
                    json!({"original": r, "normalized": to, "is_new": is_new})
                })
                .collect();
            return Ok(json!({"mappings": mappings, "new_labels": []}));
        }

        self.extraction_calls.fetch_add(1, Ordering::SeqCst);
        let mut rounds = self.rounds.lock().unwrap();
        let label = if rounds.is_empty() { "array" } else { rounds.remove(0) };
        Ok(json!({"type": label}))
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

/// Fixed 2-d vectors per text; anything unknown is orthogonal to `array`.
struct TableEmbedder {
    calls: AtomicUsize,
}

#[async_trait]
impl Embedder for TableEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|t| match t.as_str() {
                "array" => vec![1.0, 0.0],
                "sorted_array" => vec![0.6, 0.8],
                _ => vec![0.0, 1.0],
            })
            .collect())
    }
}

fn input_structure_only() -> PipelineConfig {
    PipelineConfig {
        sampler: SamplerConfig {
            dimensions: vec![Dimension::InputStructure],
            ..SamplerConfig::default()
        },
        ..PipelineConfig::default()
    }
}

#[tokio::test]
async fn noisy_rounds_collapse_onto_seeded_label() {
    let store = Arc::new(SqliteCorpusStore::in_memory().unwrap());
    let registries = Arc::new(RegistrySet::in_memory());
    registries
        .lock(Dimension::InputStructure)
        .await
        .seed("array", "a sequence of values indexed by position");

    let classifier = Arc::new(ScriptedClassifier::new(
        vec!["array", "Array", "sorted_array"],
        &[("sorted_array", "array", false)],
    ));
    let embedder = Arc::new(TableEmbedder {
        calls: AtomicUsize::new(0),
    });
    let pipeline = Pipeline::new(
        classifier.clone(),
        Some(embedder.clone()),
        store.clone(),
        registries.clone(),
        input_structure_only(),
    );

    let summary = pipeline.run(&[problem("p1")]).await.unwrap();
    assert_eq!(summary.sampling.issued, 3);
    let totals = &summary.consolidation.normalization;
    assert_eq!(totals.known, 2, "array and Array resolve without a model call");
    assert_eq!(totals.embedded, 0, "sorted_array scores 0.6, below the threshold");
    assert_eq!(totals.merged, 1);

    // Only the embedding miss reached the merge stage.
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    assert_eq!(*classifier.merge_prompts.lock().unwrap(), vec![vec!["sorted_array".to_string()]]);

    let result = store
        .consensus_for("p1", Dimension::InputStructure)
        .await
        .unwrap()
        .unwrap();
    match &result.value {
        ConsensusValue::Single { label, confidence, .. } => {
            assert_eq!(label.as_deref(), Some("array"));
            assert_eq!(confidence.to_string(), "3/3");
        }
        other => panic!("unexpected consensus {other:?}"),
    }
    assert_eq!(result.mapping["Array"], "array");
    assert_eq!(result.mapping["sorted_array"], "array");

    let registry = registries.lock(Dimension::InputStructure).await;
    assert_eq!(registry.len(), 1);
    let array = registry.get("array").unwrap();
    assert!(array.aliases.contains(&"Array".to_string()));
    assert!(array.aliases.contains(&"sorted_array".to_string()));
    assert_eq!(array.description, "a sequence of values indexed by position");
}

#[tokio::test]
async fn novel_label_is_minted_and_majority_still_wins() {
    let store = Arc::new(SqliteCorpusStore::in_memory().unwrap());
    let registries = Arc::new(RegistrySet::in_memory());
    registries.lock(Dimension::InputStructure).await.seed("array", "");

    let classifier = Arc::new(ScriptedClassifier::new(
        vec!["array", "Array", "sorted_array"],
        &[("sorted_array", "sorted_array", true)],
    ));
    let pipeline = Pipeline::new(
        classifier,
        None,
        store.clone(),
        registries.clone(),
        input_structure_only(),
    );
    pipeline.run(&[problem("p1")]).await.unwrap();

    let result = store
        .consensus_for("p1", Dimension::InputStructure)
        .await
        .unwrap()
        .unwrap();
    match &result.value {
        ConsensusValue::Single { label, confidence, .. } => {
            assert_eq!(label.as_deref(), Some("array"));
            assert_eq!(confidence.to_string(), "2/3");
        }
        other => panic!("unexpected consensus {other:?}"),
    }
    assert!(registries.lock(Dimension::InputStructure).await.contains("sorted_array"));
}

#[tokio::test]
async fn rerun_with_resume_issues_no_calls_and_keeps_consensus() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("taxonomy.sqlite");
    let registry_dir = dir.path().join("registry");
    let problems: Vec<Problem> = (0..10).map(|i| problem(&format!("p{i}"))).collect();

    let first_calls;
    let first_corpus;
    {
        let store = Arc::new(SqliteCorpusStore::open(&db).unwrap());
        let classifier = Arc::new(ScriptedClassifier::new(vec!["array", "tree", "graph"], &[]));
        let pipeline = Pipeline::new(
            classifier.clone(),
            None,
            store.clone(),
            Arc::new(RegistrySet::open(&registry_dir).unwrap()),
            PipelineConfig::default(),
        );
        let summary = pipeline.run(&problems).await.unwrap();
        assert_eq!(summary.sampling.issued, 10 * 4 * 3);
        first_calls = classifier.extraction_calls.load(Ordering::SeqCst);
        first_corpus = store.consensus_corpus().await.unwrap();
        assert_eq!(first_corpus.len(), 10);
    }

    let store = Arc::new(SqliteCorpusStore::open(&db).unwrap());
    let classifier = Arc::new(ScriptedClassifier::new(vec![], &[]));
    let pipeline = Pipeline::new(
        classifier.clone(),
        None,
        store.clone(),
        Arc::new(RegistrySet::open(&registry_dir).unwrap()),
        PipelineConfig::default(),
    );
    let summary = pipeline.run(&problems).await.unwrap();

    assert_eq!(first_calls, 120);
    assert_eq!(summary.sampling.issued, 0);
    assert_eq!(summary.sampling.skipped, 120);
    assert_eq!(summary.consolidation.skipped, 10);
    assert_eq!(classifier.extraction_calls.load(Ordering::SeqCst), 0);
    assert!(classifier.merge_prompts.lock().unwrap().is_empty());
    assert_eq!(store.consensus_corpus().await.unwrap(), first_corpus);
}

#[tokio::test]
async fn interrupted_sampling_resumes_with_only_missing_rounds() {
    let store = Arc::new(SqliteCorpusStore::in_memory().unwrap());
    let problems: Vec<Problem> = (0..4).map(|i| problem(&format!("p{i}"))).collect();
    let classifier = Arc::new(ScriptedClassifier::new(vec![], &[]));
    let pipeline = Pipeline::new(
        classifier.clone(),
        None,
        store.clone(),
        Arc::new(RegistrySet::in_memory()),
        input_structure_only(),
    );

    pipeline.sample(&problems[..2]).await.unwrap();
    assert_eq!(classifier.extraction_calls.load(Ordering::SeqCst), 6);

    let summary = pipeline.sample(&problems).await.unwrap();
    assert_eq!(summary.skipped, 6);
    assert_eq!(summary.issued, 6);
    assert_eq!(classifier.extraction_calls.load(Ordering::SeqCst), 12);

    let order: Vec<String> = store
        .items()
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.problem.id)
        .collect();
    assert_eq!(order, vec!["p0", "p1", "p2", "p3"]);
}

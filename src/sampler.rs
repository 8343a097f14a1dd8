//! Round Sampler: R independent extraction attempts per (item, dimension).
//!
//! Every attempt is persisted as soon as it finishes, success or failure.
//! With `resume` on, a `(item, dimension, round)` already on record is never
//! re-issued, so an interrupted run picks up exactly where it stopped.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::classifier::Classifier;
use crate::dimension::Dimension;
use crate::extraction::{parse_payload, ExtractionAttempt};
use crate::problem::Problem;
use crate::prompts::extraction_prompt;
use crate::store::{CorpusStore, StoreError};

pub const DEFAULT_ROUNDS: u32 = 3;
pub const DEFAULT_EXTRACTION_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub rounds: u32,
    pub temperature: f32,
    /// Attempts in flight at once. Call spacing is still enforced by the
    /// gateway's shared rate gate.
    pub parallel: usize,
    pub resume: bool,
    pub dimensions: Vec<Dimension>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            rounds: DEFAULT_ROUNDS,
            temperature: DEFAULT_EXTRACTION_TEMPERATURE,
            parallel: 1,
            resume: true,
            dimensions: Dimension::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SampleSummary {
    /// Classifier calls made.
    pub issued: usize,
    /// Rounds already on record and not re-issued.
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
}

struct Job<'a> {
    problem: &'a Problem,
    dimension: Dimension,
    round: u32,
}

pub struct RoundSampler {
    classifier: Arc<dyn Classifier>,
    store: Arc<dyn CorpusStore>,
    config: SamplerConfig,
}

impl RoundSampler {
    pub fn new(classifier: Arc<dyn Classifier>, store: Arc<dyn CorpusStore>, config: SamplerConfig) -> Self {
        Self {
            classifier,
            store,
            config,
        }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Sample every configured dimension of every problem.
    ///
    /// Problems are registered with the store first so their processing
    /// order is fixed before any attempt is made.
    pub async fn sample(&self, problems: &[Problem]) -> Result<SampleSummary, SamplerError> {
        let added = self.store.register_items(problems).await?;
        debug!(added, total = problems.len(), "items registered");

        let mut summary = SampleSummary::default();
        let mut jobs = Vec::new();
        for problem in problems {
            for &dimension in &self.config.dimensions {
                for round in 1..=self.config.rounds {
                    if self.config.resume && self.store.has_attempt(&problem.id, dimension, round).await? {
                        summary.skipped += 1;
                        continue;
                    }
                    jobs.push(Job {
                        problem,
                        dimension,
                        round,
                    });
                }
            }
        }

        let total = jobs.len();
        info!(pending = total, skipped = summary.skipped, "sampling");

        let mut results = stream::iter(jobs.into_iter().map(|job| self.attempt(job)))
            .buffer_unordered(self.config.parallel.max(1));

        while let Some(result) = results.next().await {
            let success = result?;
            summary.issued += 1;
            if success {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
            if summary.issued % 10 == 0 {
                info!(done = summary.issued, total, failed = summary.failed, "sampling progress");
            }
        }

        Ok(summary)
    }

    /// Run and persist one attempt. Returns whether it succeeded.
    async fn attempt(&self, job: Job<'_>) -> Result<bool, SamplerError> {
        let Job {
            problem,
            dimension,
            round,
        } = job;
        let prompt = extraction_prompt(dimension, problem);

        let outcome = match self.classifier.classify(&prompt, self.config.temperature).await {
            Ok(value) => parse_payload(dimension, &value).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        let attempt = match outcome {
            Ok(payload) => ExtractionAttempt::success(&problem.id, dimension, round, payload),
            Err(error) => {
                warn!(item_id = %problem.id, %dimension, round, %error, "extraction attempt failed");
                ExtractionAttempt::failure(&problem.id, dimension, round, error)
            }
        }
        .with_provenance(self.classifier.model(), prompt.template_hash);

        let success = attempt.is_success();
        self.store.put_attempt(&attempt).await?;
        Ok(success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ClassifyError;
    use crate::gateway::{Endpoint, ProviderError};
    use crate::prompts::PromptInstance;
    use crate::store::SqliteCorpusStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers every dimension with a fixed label; fails every third call.
    #[derive(Default)]
    struct FlakyClassifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Classifier for FlakyClassifier {
        async fn classify(&self, prompt: &PromptInstance, _t: f32) -> Result<Value, ClassifyError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n % 3 == 0 {
                return Err(ProviderError::unavailable(Endpoint::Chat, 503, "upstream overloaded").into());
            }
            Ok(match prompt.template_slug.as_str() {
                "core_constraints_v1" => json!({"constraints": [{"name": "distinct"}]}),
                "invariant_v1" => json!({"invariants": [{"name": "monotonic"}]}),
                _ => json!({"type": "array"}),
            })
        }

        fn model(&self) -> &str {
            "flaky"
        }
    }

    fn problems(n: usize) -> Vec<Problem> {
        (0..n)
            .map(|i| Problem {
                id: format!("p{i}"),
                source: String::new(),
                title: format!("problem {i}"),
                description: String::new(),
                input: String::new(),
                output: String::new(),
                constraints: String::new(),
            })
            .collect()
    }

    #[tokio::test]
    async fn failures_are_recorded_and_do_not_abort() {
        let store = Arc::new(SqliteCorpusStore::in_memory().unwrap());
        let classifier = Arc::new(FlakyClassifier::default());
        let sampler = RoundSampler::new(
            classifier.clone(),
            store.clone(),
            SamplerConfig {
                dimensions: vec![Dimension::Objective],
                ..SamplerConfig::default()
            },
        );
        let summary = sampler.sample(&problems(2)).await.unwrap();
        assert_eq!(summary.issued, 6);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.succeeded, 4);

        let attempts = store.attempts_for("p0", Dimension::Objective).await.unwrap();
        assert_eq!(attempts.iter().map(|a| a.round).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(!attempts[2].is_success());
        assert!(attempts[2].error.as_deref().unwrap().contains("503"));
        assert_eq!(attempts[0].model, "flaky");
        assert!(!attempts[0].prompt_hash.is_empty());
    }

    #[tokio::test]
    async fn resume_skips_recorded_rounds() {
        let store = Arc::new(SqliteCorpusStore::in_memory().unwrap());
        let classifier = Arc::new(FlakyClassifier::default());
        let sampler = RoundSampler::new(classifier.clone(), store.clone(), SamplerConfig::default());

        let first = sampler.sample(&problems(3)).await.unwrap();
        assert_eq!(first.issued, 3 * 4 * 3);
        let calls = classifier.calls.load(Ordering::SeqCst);

        let second = sampler.sample(&problems(3)).await.unwrap();
        assert_eq!(second.issued, 0);
        assert_eq!(second.skipped, 36);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn malformed_payload_is_a_failure() {
        struct Shapeless;

        #[async_trait]
        impl Classifier for Shapeless {
            async fn classify(&self, _p: &PromptInstance, _t: f32) -> Result<Value, ClassifyError> {
                Ok(json!({"kind": "nothing useful"}))
            }
            fn model(&self) -> &str {
                "shapeless"
            }
        }

        let store = Arc::new(SqliteCorpusStore::in_memory().unwrap());
        let sampler = RoundSampler::new(
            Arc::new(Shapeless),
            store.clone(),
            SamplerConfig {
                rounds: 1,
                dimensions: vec![Dimension::InputStructure],
                ..SamplerConfig::default()
            },
        );
        let summary = sampler.sample(&problems(1)).await.unwrap();
        assert_eq!(summary.failed, 1);
        let attempts = store.attempts_for("p0", Dimension::InputStructure).await.unwrap();
        assert!(attempts[0].payload.is_none());
    }
}

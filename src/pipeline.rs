//! Sampling → normalization → consensus → saturation.
//!
//! ```bash
//! taxonomy run --items problems.json --store taxonomy.sqlite --registry-dir registry/
//! ```
//!
//! Items are consolidated one at a time in processing order, so the label
//! timeline reflects the order in which concepts entered the registry. The
//! four dimensions of one item are normalized concurrently; each holds only
//! its own registry lock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::classifier::{Classifier, Embedder};
use crate::config::Config;
use crate::dimension::{Dimension, VoteMode};
use crate::extraction::{AttemptStatus, ExtractionAttempt};
use crate::normalize::{NormalizationStats, Normalizer, NormalizerConfig};
use crate::problem::Problem;
use crate::registry::{RegistryError, RegistrySet};
use crate::sampler::{RoundSampler, SampleSummary, SamplerConfig, SamplerError};
use crate::saturation::{analyze, SaturationConfig, SaturationReport};
use crate::store::{CorpusStore, StoreError, StoredItem};
use crate::vote::{vote, ConsensusResult};

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Sampler(#[from] SamplerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub sampler: SamplerConfig,
    pub normalizer: NormalizerConfig,
    pub saturation: SaturationConfig,
    pub invariant_vote_mode: VoteMode,
    pub example_cap: usize,
    /// Re-vote items that already have consensus records.
    pub recompute: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sampler: SamplerConfig::default(),
            normalizer: NormalizerConfig::default(),
            saturation: SaturationConfig::default(),
            invariant_vote_mode: Dimension::Invariant.default_vote_mode(),
            example_cap: 5,
            recompute: false,
        }
    }
}

impl From<&Config> for PipelineConfig {
    fn from(config: &Config) -> Self {
        Self {
            sampler: config.sampler_config(),
            normalizer: config.normalizer_config(),
            saturation: config.saturation_config(),
            invariant_vote_mode: config.vote_mode(Dimension::Invariant),
            example_cap: config.consensus.example_cap,
            recompute: false,
        }
    }
}

impl PipelineConfig {
    pub fn vote_mode(&self, dimension: Dimension) -> VoteMode {
        match dimension {
            Dimension::Invariant => self.invariant_vote_mode,
            other => other.default_vote_mode(),
        }
    }
}

/// Normalization counters summed over every (item, dimension) batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NormalizationTotals {
    pub distinct: usize,
    pub known: usize,
    pub embedded: usize,
    pub merged: usize,
    pub unresolved: usize,
    /// Batches whose embedding stage was skipped.
    pub embedding_skipped: usize,
    /// Batches whose semantic merge failed.
    pub merge_failed: usize,
}

impl NormalizationTotals {
    fn absorb(&mut self, stats: &NormalizationStats) {
        self.distinct += stats.distinct;
        self.known += stats.known;
        self.embedded += stats.embedded;
        self.merged += stats.merged;
        self.unresolved += stats.unresolved;
        self.embedding_skipped += usize::from(stats.embedding_skipped);
        self.merge_failed += usize::from(stats.merge_failed);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsolidateSummary {
    /// Items voted in this call.
    pub consolidated: usize,
    /// Items skipped because they already had consensus.
    pub skipped: usize,
    /// Items with no attempts on record yet.
    pub unsampled: usize,
    pub normalization: NormalizationTotals,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub sampling: SampleSummary,
    pub consolidation: ConsolidateSummary,
    pub report: SaturationReport,
}

// =============================================================================
// Pipeline
// =============================================================================

pub struct Pipeline {
    sampler: RoundSampler,
    normalizer: Normalizer,
    store: Arc<dyn CorpusStore>,
    registries: Arc<RegistrySet>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        embedder: Option<Arc<dyn Embedder>>,
        store: Arc<dyn CorpusStore>,
        registries: Arc<RegistrySet>,
        config: PipelineConfig,
    ) -> Self {
        let sampler = RoundSampler::new(classifier.clone(), store.clone(), config.sampler.clone());
        let normalizer = Normalizer::new(classifier, embedder, config.normalizer.clone());
        Self {
            sampler,
            normalizer,
            store,
            registries,
            config,
        }
    }

    pub fn registries(&self) -> &RegistrySet {
        &self.registries
    }

    pub async fn sample(&self, problems: &[Problem]) -> Result<SampleSummary, PipelineError> {
        Ok(self.sampler.sample(problems).await?)
    }

    /// Normalize and vote every sampled item, in processing order.
    pub async fn consolidate(&self) -> Result<ConsolidateSummary, PipelineError> {
        let items = self.store.items().await?;
        let total = items.len();
        let mut summary = ConsolidateSummary::default();

        for (i, item) in items.iter().enumerate() {
            if !self.config.recompute && self.is_consolidated(item).await? {
                summary.skipped += 1;
                continue;
            }

            let per_dimension = try_join_all(
                self.config
                    .sampler
                    .dimensions
                    .iter()
                    .map(|&dim| self.consolidate_dimension(item, dim)),
            )
            .await?;

            let mut sampled = false;
            for outcome in per_dimension.into_iter().flatten() {
                sampled = true;
                summary.normalization.absorb(&outcome.1);
            }
            if sampled {
                summary.consolidated += 1;
            } else {
                summary.unsampled += 1;
            }

            if (i + 1) % 10 == 0 {
                info!(done = i + 1, total, "consolidation progress");
            }
        }

        info!(
            consolidated = summary.consolidated,
            skipped = summary.skipped,
            unresolved = summary.normalization.unresolved,
            "consolidation finished"
        );
        Ok(summary)
    }

    /// True when every dimension has a consensus voted over exactly the
    /// attempts now on record. Rounds added or rewritten since make it stale.
    async fn is_consolidated(&self, item: &StoredItem) -> Result<bool, PipelineError> {
        let item_id = item.problem.id.as_str();
        for &dim in &self.config.sampler.dimensions {
            let Some(result) = self.store.consensus_for(item_id, dim).await? else {
                return Ok(false);
            };
            let on_record = self.store.attempts_for(item_id, dim).await?;
            if audit_keys(&result.attempts) != audit_keys(&on_record) {
                debug!(item_id, %dim, voted = result.rounds, on_record = on_record.len(), "consensus is stale");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Normalize, vote and persist one (item, dimension). `None` when the
    /// pair has no attempts yet.
    async fn consolidate_dimension(
        &self,
        item: &StoredItem,
        dimension: Dimension,
    ) -> Result<Option<(ConsensusResult, NormalizationStats)>, PipelineError> {
        let item_id = item.problem.id.as_str();
        let attempts = self.store.attempts_for(item_id, dimension).await?;
        if attempts.is_empty() {
            debug!(item_id, %dimension, "no attempts on record");
            return Ok(None);
        }

        let raw: Vec<String> = attempts
            .iter()
            .flat_map(|a| a.raw_labels())
            .map(str::to_string)
            .collect();

        let mut registry = self.registries.lock(dimension).await;
        let outcome = self.normalizer.normalize(&mut registry, &raw).await;
        if !outcome.unresolved.is_empty() {
            warn!(item_id, %dimension, unresolved = ?outcome.unresolved, "labels left unresolved");
        }

        let result = vote(
            item_id,
            dimension,
            self.config.vote_mode(dimension),
            attempts,
            |label| outcome.canonical(label).to_string(),
        );
        for label in result.labels() {
            registry.add_example(label, item_id, self.config.example_cap);
        }
        self.registries.save_locked(&registry)?;
        drop(registry);

        self.store.put_consensus(&result).await?;
        Ok(Some((result, outcome.stats)))
    }

    /// Saturation report over the whole consensus corpus.
    pub async fn analyze(&self) -> Result<SaturationReport, PipelineError> {
        let corpus = self.store.consensus_corpus().await?;
        Ok(analyze(&corpus, &self.config.saturation))
    }

    pub async fn run(&self, problems: &[Problem]) -> Result<RunSummary, PipelineError> {
        let sampling = self.sample(problems).await?;
        let consolidation = self.consolidate().await?;
        let report = self.analyze().await?;
        Ok(RunSummary {
            sampling,
            consolidation,
            report,
        })
    }
}

fn audit_keys(attempts: &[ExtractionAttempt]) -> Vec<(u32, AttemptStatus, DateTime<Utc>)> {
    let mut keys: Vec<_> = attempts.iter().map(|a| (a.round, a.status, a.recorded_at)).collect();
    keys.sort_by_key(|k| k.0);
    keys
}

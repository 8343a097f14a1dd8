//! Two-stage normalization of raw labels onto a dimension's registry.
//!
//! Stage 0 resolves labels the registry already knows (exact name, folded
//! name, confirmed alias) without any model call. Stage 1 embeds the current
//! canonical names and the remaining raw labels in one batched call and maps
//! each raw label to its most similar canonical name when the cosine score
//! reaches the threshold. Stage 2 hands whatever is still unresolved to the
//! language model together with the registry and applies its mapping,
//! registering freshly minted labels.
//!
//! Failures degrade instead of propagating: an embedding failure skips
//! stage 1, a merge failure leaves the remaining labels unresolved.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::classifier::{validate_embeddings, Classifier, Embedder};
use crate::prompts::normalize_prompt;
use crate::registry::{ComparisonBasis, LabelRegistry};
use crate::similarity::best_match;

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizerConfig {
    /// Minimum cosine score for an embedding match (inclusive).
    pub similarity_threshold: f64,
    pub comparison_basis: ComparisonBasis,
    pub merge_temperature: f32,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            comparison_basis: ComparisonBasis::NamesOnly,
            merge_temperature: 0.2,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NormalizationStats {
    /// Distinct non-empty raw labels in the batch.
    pub distinct: usize,
    /// Resolved by the registry directly.
    pub known: usize,
    /// Resolved by embedding similarity.
    pub embedded: usize,
    /// Resolved by the language model.
    pub merged: usize,
    pub unresolved: usize,
    pub embedding_skipped: bool,
    pub merge_failed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizationOutcome {
    /// raw label -> canonical name. Unresolved labels are absent.
    pub mapping: BTreeMap<String, String>,
    /// Canonical names registered during this call, in creation order.
    pub created: Vec<String>,
    /// Raw labels left unmapped for this run.
    pub unresolved: Vec<String>,
    pub stats: NormalizationStats,
}

impl NormalizationOutcome {
    /// Canonical name for `raw`, or `raw` itself when it stayed unresolved.
    pub fn canonical<'a>(&'a self, raw: &'a str) -> &'a str {
        self.mapping.get(raw).map(String::as_str).unwrap_or(raw)
    }
}

#[derive(Debug, Deserialize)]
struct MergeResponse {
    #[serde(default)]
    mappings: Vec<MergeMapping>,
    #[serde(default)]
    new_labels: Vec<NewLabel>,
}

#[derive(Debug, Deserialize)]
struct MergeMapping {
    original: String,
    normalized: String,
    #[serde(default)]
    is_new: bool,
}

#[derive(Debug, Deserialize)]
struct NewLabel {
    name: String,
    #[serde(default)]
    description: String,
}

pub struct Normalizer {
    classifier: Arc<dyn Classifier>,
    embedder: Option<Arc<dyn Embedder>>,
    config: NormalizerConfig,
}

impl Normalizer {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        embedder: Option<Arc<dyn Embedder>>,
        config: NormalizerConfig,
    ) -> Self {
        Self {
            classifier,
            embedder,
            config,
        }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Map a batch of raw labels onto `registry`, extending it as needed.
    ///
    /// The caller holds the registry exclusively for the whole call.
    pub async fn normalize(
        &self,
        registry: &mut LabelRegistry,
        raw_labels: &[String],
    ) -> NormalizationOutcome {
        let dimension = registry.dimension();
        let mut out = NormalizationOutcome::default();

        // Exact, case-sensitive dedup. Blank strings carry no label.
        let mut seen = HashSet::new();
        let batch: Vec<String> = raw_labels
            .iter()
            .filter(|&l| !l.trim().is_empty() && seen.insert(l.as_str()))
            .cloned()
            .collect();
        out.stats.distinct = batch.len();
        if batch.is_empty() {
            return out;
        }

        let mut pending = Vec::new();
        for raw in batch {
            match registry.resolve(&raw).map(str::to_string) {
                Some(canonical) => {
                    registry.add_alias(&canonical, &raw);
                    out.mapping.insert(raw, canonical);
                    out.stats.known += 1;
                }
                None => pending.push(raw),
            }
        }

        if !pending.is_empty() {
            pending = self.embedding_stage(registry, pending, &mut out).await;
        }

        if !pending.is_empty() {
            pending = self.merge_stage(registry, pending, &mut out).await;
        }

        out.stats.unresolved = pending.len();
        out.unresolved = pending;
        tracing::debug!(
            dimension = %dimension,
            distinct = out.stats.distinct,
            known = out.stats.known,
            embedded = out.stats.embedded,
            merged = out.stats.merged,
            created = out.created.len(),
            unresolved = out.stats.unresolved,
            "normalized batch"
        );
        out
    }

    /// Returns the labels still unresolved after similarity matching.
    async fn embedding_stage(
        &self,
        registry: &mut LabelRegistry,
        pending: Vec<String>,
        out: &mut NormalizationOutcome,
    ) -> Vec<String> {
        let Some(embedder) = &self.embedder else {
            return pending;
        };
        if registry.is_empty() {
            return pending;
        }

        let canon = registry.comparison_texts(self.config.comparison_basis);
        let mut texts: Vec<String> = canon.iter().map(|(_, text)| text.clone()).collect();
        texts.extend(pending.iter().cloned());

        let vectors = match embedder.embed(&texts).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    dimension = %registry.dimension(),
                    error = %e,
                    "embedding call failed; skipping similarity stage"
                );
                out.stats.embedding_skipped = true;
                return pending;
            }
        };
        if let Err(e) = validate_embeddings(texts.len(), &vectors) {
            tracing::warn!(
                dimension = %registry.dimension(),
                error = %e,
                "embedding response malformed; skipping similarity stage"
            );
            out.stats.embedding_skipped = true;
            return pending;
        }

        let (canon_vecs, raw_vecs) = vectors.split_at(canon.len());
        let mut still = Vec::new();
        for (raw, vec) in pending.into_iter().zip(raw_vecs) {
            match best_match(vec, canon_vecs) {
                Some((idx, score)) if score >= self.config.similarity_threshold => {
                    let canonical = canon[idx].0.clone();
                    tracing::debug!(raw = %raw, canonical = %canonical, score, "embedding match");
                    registry.add_alias(&canonical, &raw);
                    out.mapping.insert(raw, canonical);
                    out.stats.embedded += 1;
                }
                _ => still.push(raw),
            }
        }
        still
    }

    /// Returns the labels the model left unmapped (all of them on failure).
    async fn merge_stage(
        &self,
        registry: &mut LabelRegistry,
        pending: Vec<String>,
        out: &mut NormalizationOutcome,
    ) -> Vec<String> {
        let dimension = registry.dimension();
        let prompt = normalize_prompt(dimension, &registry.to_prompt_text(), &pending);

        let value = match self
            .classifier
            .classify(&prompt, self.config.merge_temperature)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(dimension = %dimension, error = %e, "semantic merge failed; labels left unresolved");
                out.stats.merge_failed = true;
                return pending;
            }
        };
        let response: MergeResponse = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(dimension = %dimension, error = %e, "semantic merge response malformed");
                out.stats.merge_failed = true;
                return pending;
            }
        };

        let descriptions: HashMap<String, String> = response
            .new_labels
            .iter()
            .map(|l| (l.name.trim().to_string(), l.description.clone()))
            .collect();

        for label in &response.new_labels {
            self.register_new(registry, label.name.trim(), &label.description, out);
        }

        let pending_set: HashSet<&str> = pending.iter().map(|p| p.trim()).collect();
        let mut resolved: HashMap<String, String> = HashMap::new();
        for m in response.mappings {
            let original = m.original.trim();
            let target = m.normalized.trim();
            if target.is_empty() || !pending_set.contains(original) || resolved.contains_key(original) {
                continue;
            }
            let canonical = if m.is_new {
                let description = descriptions.get(target).map(String::as_str).unwrap_or("");
                self.register_new(registry, target, description, out)
            } else {
                match registry.resolve(target).map(str::to_string) {
                    Some(c) => Some(c),
                    None => {
                        tracing::warn!(
                            dimension = %dimension,
                            original,
                            target,
                            "merge mapped to an unknown label; registering it"
                        );
                        let description = descriptions.get(target).map(String::as_str).unwrap_or("");
                        self.register_new(registry, target, description, out)
                    }
                }
            };
            if let Some(canonical) = canonical {
                registry.add_alias(&canonical, original);
                resolved.insert(original.to_string(), canonical);
            }
        }

        let mut still = Vec::new();
        for raw in pending {
            match resolved.get(raw.trim()) {
                Some(canonical) => {
                    out.mapping.insert(raw, canonical.clone());
                    out.stats.merged += 1;
                }
                None => still.push(raw),
            }
        }
        still
    }

    fn register_new(
        &self,
        registry: &mut LabelRegistry,
        name: &str,
        description: &str,
        out: &mut NormalizationOutcome,
    ) -> Option<String> {
        let before = registry.len();
        let resolved = registry.register(name, description)?;
        if registry.len() > before {
            tracing::info!(dimension = %registry.dimension(), label = %resolved, "new canonical label");
            out.created.push(resolved.clone());
        }
        Some(resolved)
    }
}

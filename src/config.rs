//! TOML run configuration.
//!
//! Every key has a default, so an empty file (or no file) is valid.
//! Credentials never live here; they come from `TAXONOMY_API_KEY` and
//! friends, read by the gateway adapter.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dimension::{Dimension, VoteMode};
use crate::gateway::{Backoff, GatewayConfig, RetryPolicy};
use crate::normalize::NormalizerConfig;
use crate::registry::ComparisonBasis;
use crate::sampler::{SamplerConfig, DEFAULT_EXTRACTION_TEMPERATURE, DEFAULT_ROUNDS};
use crate::saturation::{
    SaturationConfig, ThresholdError, VerdictThresholds, DEFAULT_MIN_POINTS, DEFAULT_TAIL_WINDOW,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Thresholds(#[from] ThresholdError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub models: ModelsSection,
    pub sampling: SamplingSection,
    pub normalizer: NormalizerSection,
    pub consensus: ConsensusSection,
    pub saturation: SaturationSection,
    pub gateway: GatewaySection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelsSection {
    /// Chat model used for extraction and semantic merge.
    pub chat: String,
    pub embedding: String,
    /// Set to false to run the normalizer on the LLM merge stage only.
    pub use_embeddings: bool,
    pub embedding_batch_size: usize,
    pub max_tokens: Option<u32>,
}

impl Default for ModelsSection {
    fn default() -> Self {
        Self {
            chat: "openai/gpt-4o-mini".into(),
            embedding: "openai/text-embedding-3-small".into(),
            use_embeddings: true,
            embedding_batch_size: 10,
            max_tokens: Some(2048),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SamplingSection {
    pub rounds: u32,
    pub temperature: f32,
    pub parallel: usize,
    pub resume: bool,
}

impl Default for SamplingSection {
    fn default() -> Self {
        Self {
            rounds: DEFAULT_ROUNDS,
            temperature: DEFAULT_EXTRACTION_TEMPERATURE,
            parallel: 1,
            resume: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NormalizerSection {
    pub similarity_threshold: f64,
    pub comparison_basis: ComparisonBasis,
    pub merge_temperature: f32,
}

impl Default for NormalizerSection {
    fn default() -> Self {
        let d = NormalizerConfig::default();
        Self {
            similarity_threshold: d.similarity_threshold,
            comparison_basis: d.comparison_basis,
            merge_temperature: d.merge_temperature,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsensusSection {
    pub invariant_vote_mode: VoteMode,
    /// Item ids remembered per canonical label.
    pub example_cap: usize,
}

impl Default for ConsensusSection {
    fn default() -> Self {
        Self {
            invariant_vote_mode: Dimension::Invariant.default_vote_mode(),
            example_cap: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SaturationSection {
    pub tail_window: usize,
    pub min_points: usize,
    pub thresholds: VerdictThresholds,
}

impl Default for SaturationSection {
    fn default() -> Self {
        Self {
            tail_window: DEFAULT_TAIL_WINDOW,
            min_points: DEFAULT_MIN_POINTS,
            thresholds: VerdictThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewaySection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff: Backoff,
    pub chat_min_interval_ms: u64,
    pub embed_min_interval_ms: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1500,
            max_delay_ms: 30_000,
            backoff: Backoff::Exponential,
            chat_min_interval_ms: 1000,
            embed_min_interval_ms: 300,
        }
    }
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Load `path` if given, otherwise use defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.saturation.thresholds.validate()?;
        if self.sampling.rounds == 0 {
            return Err(ConfigError::Invalid("sampling.rounds must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.normalizer.similarity_threshold) {
            return Err(ConfigError::Invalid(format!(
                "normalizer.similarity_threshold must lie in [0, 1], got {}",
                self.normalizer.similarity_threshold
            )));
        }
        if self.gateway.base_delay_ms > self.gateway.max_delay_ms {
            return Err(ConfigError::Invalid(
                "gateway.base_delay_ms must not exceed gateway.max_delay_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn vote_mode(&self, dimension: Dimension) -> VoteMode {
        match dimension {
            Dimension::Invariant => self.consensus.invariant_vote_mode,
            other => other.default_vote_mode(),
        }
    }

    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            rounds: self.sampling.rounds,
            temperature: self.sampling.temperature,
            parallel: self.sampling.parallel.max(1),
            resume: self.sampling.resume,
            dimensions: Dimension::ALL.to_vec(),
        }
    }

    pub fn normalizer_config(&self) -> NormalizerConfig {
        NormalizerConfig {
            similarity_threshold: self.normalizer.similarity_threshold,
            comparison_basis: self.normalizer.comparison_basis,
            merge_temperature: self.normalizer.merge_temperature,
        }
    }

    pub fn saturation_config(&self) -> SaturationConfig {
        SaturationConfig {
            tail_window: self.saturation.tail_window,
            min_points: self.saturation.min_points,
            thresholds: self.saturation.thresholds,
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        let g = &self.gateway;
        GatewayConfig {
            retry: RetryPolicy {
                max_retries: g.max_retries,
                base_delay: Duration::from_millis(g.base_delay_ms),
                max_delay: Duration::from_millis(g.max_delay_ms),
                backoff: g.backoff,
            },
            chat_min_interval: Duration::from_millis(g.chat_min_interval_ms),
            embed_min_interval: Duration::from_millis(g.embed_min_interval_ms),
        }
    }
}

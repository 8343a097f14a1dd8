#![forbid(unsafe_code)]

//! # schema-taxonomy
//!
//! Induce a closed taxonomy of problem-schema labels from a noisy LLM.
//!
//! Each competitive-programming problem is classified several times along
//! four independent dimensions (input structure, core constraints,
//! objective, invariant). The model's free-form labels are folded onto a
//! growing per-dimension registry of canonical labels, first by embedding
//! similarity and then by an LLM-mediated merge. A majority vote across
//! rounds yields one consensus value per (problem, dimension), and a
//! saturation analysis over the whole corpus estimates whether each label
//! vocabulary is finite.

pub mod classifier;
pub mod config;
pub mod dimension;
pub mod extraction;
pub mod gateway;
pub mod normalize;
pub mod pipeline;
pub mod problem;
pub mod prompts;
pub mod registry;
pub mod sampler;
pub mod saturation;
pub mod similarity;
pub mod store;
pub mod vote;

pub use classifier::{Classifier, Embedder, GatewayEmbedder, LlmClassifier};
pub use config::{Config, ConfigError};
pub use dimension::{Dimension, VoteMode};
pub use extraction::{ExtractionAttempt, ExtractionPayload};
pub use gateway::{Attribution, ChatGateway, EmbeddingGateway, ProviderGateway, UsageSink};
pub use normalize::{NormalizationOutcome, Normalizer, NormalizerConfig};
pub use pipeline::{Pipeline, PipelineConfig, PipelineError};
pub use problem::{load_problems, Problem};
pub use registry::{CanonicalLabel, LabelRegistry, RegistrySet};
pub use sampler::{RoundSampler, SampleSummary, SamplerConfig};
pub use saturation::{SaturationReport, Verdict};
pub use store::{CorpusStore, SqliteCorpusStore};
pub use vote::{ConsensusResult, ConsensusValue};

//! Classifier and embedder contracts, plus gateway-backed implementations.
//!
//! The core only needs two things from the outside world: "prompt in, JSON
//! object out" and "texts in, equally sized vectors out, same order". Tests
//! substitute scripted implementations of these traits.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::extraction::{parse_json_object, PayloadError};
use crate::gateway::{
    Attribution, ChatGateway, ChatRequest, EmbedRequest, EmbeddingGateway, ProviderError,
};
use crate::prompts::PromptInstance;

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("malformed model output: {0}")]
    Payload(#[from] PayloadError),
    /// Generation hit the token limit; the JSON is cut off.
    #[error("model output truncated at the token limit")]
    Truncated,
}

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("expected {expected} embeddings, got {got}")]
    Count { expected: usize, got: usize },
    #[error("embedding dimensionality mismatch: {0} vs {1}")]
    Dimensions(usize, usize),
}

/// "Given a prompt, return a parsed JSON object."
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, prompt: &PromptInstance, temperature: f32) -> Result<Value, ClassifyError>;

    /// Model identifier recorded on every attempt.
    fn model(&self) -> &str;
}

/// "Given N texts, return N vectors of equal dimensionality, in input order."
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// Check the embedding contract on a response.
pub fn validate_embeddings(expected: usize, vectors: &[Vec<f32>]) -> Result<(), EmbedError> {
    if vectors.len() != expected {
        return Err(EmbedError::Count {
            expected,
            got: vectors.len(),
        });
    }
    if let Some(first) = vectors.first() {
        if let Some(bad) = vectors.iter().find(|v| v.len() != first.len()) {
            return Err(EmbedError::Dimensions(first.len(), bad.len()));
        }
    }
    Ok(())
}

pub struct LlmClassifier<G: ChatGateway> {
    gateway: Arc<G>,
    model: String,
    max_tokens: Option<u32>,
    caller: &'static str,
    run_id: Option<Uuid>,
}

impl<G: ChatGateway> LlmClassifier<G> {
    pub fn new(gateway: Arc<G>, model: impl Into<String>, caller: &'static str) -> Self {
        Self {
            gateway,
            model: model.into(),
            max_tokens: None,
            caller,
            run_id: None,
        }
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

#[async_trait]
impl<G: ChatGateway> Classifier for LlmClassifier<G> {
    async fn classify(&self, prompt: &PromptInstance, temperature: f32) -> Result<Value, ClassifyError> {
        let mut attribution = Attribution::new(self.caller);
        if let Some(run_id) = self.run_id {
            attribution = attribution.with_run(run_id);
        }
        let mut req = ChatRequest::new(self.model.clone(), prompt.to_messages(), attribution)
            .temperature(temperature)
            .json();
        if let Some(max) = self.max_tokens {
            req = req.max_tokens(max);
        }
        let resp = self.gateway.chat(req).await?;
        match parse_json_object(&resp.content) {
            Ok(value) => Ok(value),
            Err(_) if resp.truncated => Err(ClassifyError::Truncated),
            Err(e) => Err(e.into()),
        }
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Embedder that splits inputs into provider-sized batches.
pub struct GatewayEmbedder<G: EmbeddingGateway> {
    gateway: Arc<G>,
    model: String,
    batch_size: usize,
    run_id: Option<Uuid>,
}

impl<G: EmbeddingGateway> GatewayEmbedder<G> {
    pub fn new(gateway: Arc<G>, model: impl Into<String>, batch_size: usize) -> Self {
        Self {
            gateway,
            model: model.into(),
            batch_size: batch_size.max(1),
            run_id: None,
        }
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

#[async_trait]
impl<G: EmbeddingGateway> Embedder for GatewayEmbedder<G> {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            let mut attribution = Attribution::new("normalize::embed");
            if let Some(run_id) = self.run_id {
                attribution = attribution.with_run(run_id);
            }
            let resp = self
                .gateway
                .embed(EmbedRequest::new(self.model.clone(), chunk.to_vec(), attribution))
                .await?;
            if resp.embeddings.len() != chunk.len() {
                return Err(EmbedError::Count {
                    expected: chunk.len(),
                    got: resp.embeddings.len(),
                });
            }
            out.extend(resp.embeddings);
        }
        validate_embeddings(texts.len(), &out)?;
        Ok(out)
    }
}

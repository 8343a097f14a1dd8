//! Provider gateway for chat completions and embeddings.
//!
//! The gateway wraps the HTTP adapter with the cross-cutting policies every
//! outbound call needs: a min-interval gate per endpoint shared by all
//! workers, a bounded retry policy for transport failures, and usage
//! recording.

pub mod compat;
pub mod error;
pub mod rate_limit;
pub mod retry;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use compat::CompatAdapter;
use rate_limit::MinIntervalGate;
use usage::{ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use error::{Endpoint, ProviderError};
pub use retry::{Backoff, RetryOutcome, RetryPolicy};
pub use types::*;
pub use usage::{NoopUsageSink, StderrUsageSink, UsageSink};

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[async_trait::async_trait]
pub trait EmbeddingGateway: Send + Sync {
    async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub retry: RetryPolicy,
    /// Minimum spacing between consecutive chat calls.
    pub chat_min_interval: Duration,
    /// Minimum spacing between consecutive embedding calls.
    pub embed_min_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            chat_min_interval: Duration::from_secs(1),
            embed_min_interval: Duration::from_millis(300),
        }
    }
}

pub struct ProviderGateway<U: UsageSinkTrait> {
    adapter: CompatAdapter,
    usage_sink: Arc<U>,
    retry: RetryPolicy,
    chat_gate: MinIntervalGate,
    embed_gate: MinIntervalGate,
}

#[async_trait::async_trait]
impl<U: UsageSinkTrait> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

#[async_trait::async_trait]
impl<U: UsageSinkTrait> EmbeddingGateway for ProviderGateway<U> {
    async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        ProviderGateway::embed(self, req).await
    }
}

impl<U: UsageSinkTrait> ProviderGateway<U> {
    pub fn from_env(usage_sink: Arc<U>) -> Result<Self, ProviderError> {
        let adapter = CompatAdapter::from_env()?;
        Ok(Self::with_config(adapter, usage_sink, GatewayConfig::default()))
    }

    pub fn with_config(adapter: CompatAdapter, usage_sink: Arc<U>, config: GatewayConfig) -> Self {
        Self {
            adapter,
            usage_sink,
            retry: config.retry,
            chat_gate: MinIntervalGate::new(config.chat_min_interval),
            embed_gate: MinIntervalGate::new(config.embed_min_interval),
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let started = tokio::time::Instant::now();
        let (adapter, gate, request) = (&self.adapter, &self.chat_gate, &req);
        let outcome = self
            .retry
            .run(move || async move {
                gate.wait().await;
                adapter.chat(request).await
            })
            .await;

        let record = ProviderCallRecord::new(Endpoint::Chat, &req.model, req.attribution.caller)
            .run(req.attribution.run_id)
            .attempts(outcome.attempts)
            .latency(started.elapsed().as_millis() as u64);
        let record = match &outcome.result {
            Ok(resp) => record.tokens(resp.input_tokens, resp.output_tokens),
            Err(err) => record.error(err.code()).request_id(err.request_id()),
        };
        self.usage_sink.record(record).await;

        outcome.result
    }

    pub async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        let started = tokio::time::Instant::now();
        let (adapter, gate, request) = (&self.adapter, &self.embed_gate, &req);
        let outcome = self
            .retry
            .run(move || async move {
                gate.wait().await;
                adapter.embed(request).await
            })
            .await;

        let record = ProviderCallRecord::new(Endpoint::Embeddings, &req.model, req.attribution.caller)
            .run(req.attribution.run_id)
            .attempts(outcome.attempts)
            .latency(started.elapsed().as_millis() as u64);
        let record = match &outcome.result {
            Ok(resp) => record.tokens(resp.tokens, 0),
            Err(err) => record.error(err.code()).request_id(err.request_id()),
        };
        self.usage_sink.record(record).await;

        outcome.result
    }
}

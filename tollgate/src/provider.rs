//! Contract with the external model provider.
//!
//! The metering core treats the upstream AI provider as an opaque async
//! function: prompt in, generated text plus actual usage-unit counts out. It
//! never interprets provider-specific failure causes (quota, safety filters,
//! auth); that classification belongs to the request-handling layer outside
//! this crate.

use async_trait::async_trait;
use thiserror::Error;

/// A single generation request forwarded upstream.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model_key: String,
    pub prompt: String,
    /// Cap on generated units; `None` lets the provider apply its own default.
    pub max_output_units: Option<i64>,
}

/// What the provider reports back for one call. The unit counts are the
/// provider's own accounting and are the sole basis for settlement.
#[derive(Debug, Clone)]
pub struct CompletionOutput {
    pub text: String,
    pub input_units: i64,
    pub output_units: i64,
}

/// Opaque upstream failure.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Upstream call timed out after {0} seconds")]
    Timeout(u64),
    #[error("Upstream provider error: {0}")]
    Upstream(String),
}

/// The external AI provider collaborator.
///
/// Implementations are expected to be cheap to share (`Arc`) across
/// concurrent metered calls; the credential is passed per call because the
/// rotation manager may hand out a different key each time.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn complete(
        &self,
        credential: &str,
        request: &CompletionRequest,
    ) -> Result<CompletionOutput, ProviderError>;
}

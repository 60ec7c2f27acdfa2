pub mod mistral;

use async_trait::async_trait;
use derive_more::derive::Display;
use serde_json::Value;

pub use mistral::MistralAnalyzer;

/// How a failed analysis call should be treated by the caller.
#[derive(Debug, Display)]
pub enum AnalyzeError {
    /// The service asked us to back off; worth retrying later.
    #[display("rate limited: {_0}")]
    RateLimited(String),
    /// Anything else. Not retried.
    #[display("{_0:#}")]
    Other(anyhow::Error),
}

impl std::error::Error for AnalyzeError {}

impl AnalyzeError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, AnalyzeError::RateLimited(_))
    }
}

impl From<anyhow::Error> for AnalyzeError {
    fn from(error: anyhow::Error) -> Self {
        AnalyzeError::Other(error)
    }
}

/// External service that produces the analysis payload for a term.
/// Implementations enforce their own per-call timeout.
#[async_trait]
pub trait AnalysisService: Send + Sync + 'static {
    async fn analyze(&self, term: &str, language: &str) -> Result<Value, AnalyzeError>;
}

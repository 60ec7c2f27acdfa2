use std::sync::Arc;
use tokio::time::Duration;

use leaky_bucket::RateLimiter;

use crate::server_config::PromptLimits;

/// Process-wide prompt bucket shared by every worker of every job.
#[derive(Clone)]
pub struct RateLimiters {
    prompt: Arc<RateLimiter>,
}

impl RateLimiters {
    pub fn new(prompt_limit_per_sec: usize, prompt_interval_ms: usize, prompt_refill: usize) -> Self {
        let prompt = RateLimiter::builder()
            .initial(1)
            .interval(Duration::from_millis(prompt_interval_ms as u64))
            .max(prompt_limit_per_sec)
            .refill(prompt_refill)
            .build();

        Self {
            prompt: Arc::new(prompt),
        }
    }

    pub fn from_limits(limits: &PromptLimits) -> Self {
        Self::new(
            limits.rate_limit_per_sec,
            limits.refill_interval_ms,
            limits.refill_amount,
        )
    }

    pub async fn acquire_one(&self) {
        self.prompt.acquire_one().await;
    }

    pub fn get_status(&self) -> String {
        format!("prompts: {}/{}", self.prompt.balance(), self.prompt.max())
    }
}

use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

use conductor_core::config::RetryConfig;
use conductor_core::error::{ConductorError, Result};
use conductor_core::traits::WorkerInvoker;
use conductor_core::types::{AgentDescriptor, InvocationContext, InvocationOutput};

/// An invoker that retries transient transport failures before the step
/// executor sees them.
pub struct RetryingInvoker {
    inner: Box<dyn WorkerInvoker>,
    retry_config: RetryConfig,
}

impl RetryingInvoker {
    pub fn new(inner: Box<dyn WorkerInvoker>, retry_config: RetryConfig) -> Self {
        Self {
            inner,
            retry_config,
        }
    }
}

fn is_transient(e: &ConductorError) -> bool {
    match e {
        ConductorError::Invocation(msg) => {
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        _ => false,
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl WorkerInvoker for RetryingInvoker {
    fn invoke<'a>(
        &'a self,
        agent: Option<&'a AgentDescriptor>,
        prompt: &'a str,
        ctx: &'a InvocationContext,
    ) -> BoxFuture<'a, Result<InvocationOutput>> {
        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;

            let mut attempt = 0;
            loop {
                match self.inner.invoke(agent, prompt, ctx).await {
                    Ok(output) => return Ok(output),
                    Err(e) if is_transient(&e) && attempt < max_retries => {
                        let backoff = calculate_backoff(attempt, &self.retry_config);
                        warn!(
                            step = %ctx.step_id,
                            attempt = attempt + 1,
                            max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Retrying model request"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }
}

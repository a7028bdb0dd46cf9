use futures::future::BoxFuture;

use conductor_core::error::Result;
use conductor_core::traits::WorkerInvoker;
use conductor_core::types::{AgentDescriptor, InvocationContext, InvocationOutput};

/// Offline invoker for dry runs: answers every step with its own prompt.
#[derive(Debug, Clone, Default)]
pub struct EchoInvoker {
    confidence: Option<f64>,
}

impl EchoInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a fixed confidence on every reply, so confidence edges can be exercised.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }
}

impl WorkerInvoker for EchoInvoker {
    fn invoke<'a>(
        &'a self,
        agent: Option<&'a AgentDescriptor>,
        prompt: &'a str,
        ctx: &'a InvocationContext,
    ) -> BoxFuture<'a, Result<InvocationOutput>> {
        Box::pin(async move {
            let who = agent.map(|a| a.id.as_str()).unwrap_or("model");
            let first_line = prompt.lines().next().unwrap_or_default();
            Ok(InvocationOutput {
                content: format!("[{}] {}: {}", who, ctx.step_id, first_line),
                confidence: self.confidence,
                reasoning: Some("dry run".into()),
                ..Default::default()
            })
        })
    }
}

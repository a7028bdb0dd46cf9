pub mod echo;
pub mod openai;
pub mod parse;
pub mod retry;

use std::sync::Arc;

use conductor_core::config::ModelConfig;
use conductor_core::traits::WorkerInvoker;

pub use echo::EchoInvoker;
pub use openai::OpenAiInvoker;
pub use retry::RetryingInvoker;

/// Build the worker invoker for a model config.
///
/// Wraps the HTTP invoker in `RetryingInvoker` when `[model.retry]` is set.
pub fn create_invoker(config: &ModelConfig) -> Arc<dyn WorkerInvoker> {
    let http = OpenAiInvoker::new(config.clone());
    match &config.retry {
        Some(retry) => Arc::new(RetryingInvoker::new(Box::new(http), retry.clone())),
        None => Arc::new(http),
    }
}

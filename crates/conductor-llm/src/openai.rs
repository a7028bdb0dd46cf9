use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use conductor_core::config::ModelConfig;
use conductor_core::error::{ConductorError, Result};
use conductor_core::traits::WorkerInvoker;
use conductor_core::types::{AgentDescriptor, InvocationContext, InvocationOutput};

use crate::parse::parse_output;

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

const REPLY_FORMAT: &str = "Reply with a single JSON object: \
{\"content\": <your result>, \"confidence\": <0.0-1.0>, \"reasoning\": <short explanation>, \
\"citations\": [<sources>], \"next_steps\": [<step ids>], \"needs_input\": <question or null>}. \
Set needs_input only when you cannot proceed without the user.";

/// Worker invoker for OpenAI-compatible chat completion endpoints.
/// Works with OpenAI, Ollama, vLLM, Groq, OpenRouter, etc.
pub struct OpenAiInvoker {
    http: Client,
    config: ModelConfig,
}

impl OpenAiInvoker {
    pub fn new(config: ModelConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to default HTTP client");
                Client::new()
            });
        Self { http, config }
    }

    /// Chat completions URL derived from `base_url`.
    pub fn endpoint(&self) -> String {
        match self.config.base_url.as_deref() {
            None => OPENAI_API_URL.to_string(),
            Some(base) => {
                let base = base.trim_end_matches('/');
                if base.ends_with("/chat/completions") {
                    base.to_string()
                } else {
                    format!("{}/chat/completions", base)
                }
            }
        }
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize, Debug, PartialEq)]
struct OaiMessage {
    role: &'static str,
    content: String,
}

// Response types
#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize, Debug)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

fn system_prompt(agent: Option<&AgentDescriptor>) -> String {
    match agent {
        Some(agent) => {
            let mut prompt = format!("You are {}, a workflow agent.", agent.name);
            if !agent.capabilities.is_empty() {
                prompt.push_str(&format!(" Capabilities: {}.", agent.capabilities.join(", ")));
            }
            if !agent.specializations.is_empty() {
                prompt.push_str(&format!(
                    " Specializations: {}.",
                    agent.specializations.join(", ")
                ));
            }
            format!("{}\n\n{}", prompt, REPLY_FORMAT)
        }
        None => format!("You are a workflow assistant.\n\n{}", REPLY_FORMAT),
    }
}

fn build_messages(
    agent: Option<&AgentDescriptor>,
    prompt: &str,
    ctx: &InvocationContext,
) -> Vec<OaiMessage> {
    let mut user = prompt.to_string();
    if !ctx.input.is_null() {
        let input = serde_json::to_string_pretty(&ctx.input).unwrap_or_default();
        user.push_str(&format!("\n\nInput:\n{}", input));
    }
    vec![
        OaiMessage {
            role: "system",
            content: system_prompt(agent),
        },
        OaiMessage {
            role: "user",
            content: user,
        },
    ]
}

impl WorkerInvoker for OpenAiInvoker {
    fn invoke<'a>(
        &'a self,
        agent: Option<&'a AgentDescriptor>,
        prompt: &'a str,
        ctx: &'a InvocationContext,
    ) -> BoxFuture<'a, Result<InvocationOutput>> {
        Box::pin(async move {
            let body = ChatRequest {
                model: self.config.model_id.clone(),
                messages: build_messages(agent, prompt, ctx),
                max_tokens: self.config.max_tokens,
                temperature: (self.config.temperature > 0.0).then_some(self.config.temperature),
            };

            let mut req = self.http.post(self.endpoint()).json(&body);
            if let Some(api_key) = &self.config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            debug!(
                step = %ctx.step_id,
                agent = agent.map(|a| a.id.as_str()).unwrap_or("-"),
                attempt = ctx.attempt,
                "Invoking model"
            );

            let response = req.send().await.map_err(|e| {
                let kind = if e.is_timeout() { "timeout" } else { "connection" };
                ConductorError::Invocation(format!("{} error: {}", kind, e))
            })?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(ConductorError::Invocation(format!("HTTP {}: {}", status, body)));
            }

            let parsed: ChatResponse = response
                .json()
                .await
                .map_err(|e| ConductorError::Invocation(format!("malformed response: {}", e)))?;

            let text = parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| ConductorError::Invocation("empty completion".into()))?;

            Ok(parse_output(&text))
        })
    }
}

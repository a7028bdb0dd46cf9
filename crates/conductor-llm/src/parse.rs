use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use conductor_core::types::InvocationOutput;

/// Structured reply the worker is asked to produce.
#[derive(Deserialize, Debug, Default)]
struct ModelReply {
    #[serde(default)]
    content: Value,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    citations: Vec<String>,
    #[serde(default)]
    needs_input: Option<String>,
    #[serde(default)]
    next_steps: Vec<String>,
}

/// Strip a surrounding markdown code fence, if any.
fn strip_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag line
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Extract the outermost JSON object from model text.
fn json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Turn raw model text into an invocation output.
///
/// Replies that follow the structured format have their fields mapped through;
/// anything else becomes plain content with no confidence.
pub fn parse_output(text: &str) -> InvocationOutput {
    let body = strip_fence(text);
    let reply = json_object(body)
        .and_then(|candidate| serde_json::from_str::<ModelReply>(candidate).ok())
        .filter(|reply| !reply.content.is_null() || reply.needs_input.is_some());

    let Some(reply) = reply else {
        debug!("Model reply is unstructured, using raw text");
        return InvocationOutput::text(text.trim());
    };

    let content = match reply.content {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    };

    InvocationOutput {
        content,
        confidence: reply
            .confidence
            .filter(|c| c.is_finite())
            .map(|c| c.clamp(0.0, 1.0)),
        reasoning: reply.reasoning.filter(|r| !r.trim().is_empty()),
        citations: reply.citations,
        needs_input: reply.needs_input.filter(|q| !q.trim().is_empty()),
        next_steps: reply.next_steps,
    }
}

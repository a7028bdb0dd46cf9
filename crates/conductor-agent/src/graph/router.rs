use serde_json::{json, Value};
use tracing::debug;

use conductor_core::types::{StepResult, StepStatus};
use conductor_core::workflow::Step;

use super::condition::{evaluate_condition, FieldResolver};
use super::handoff::{apply_transform, lookup_path};

/// Where a settled step goes next.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    /// A conditional edge matched.
    Edge {
        target: String,
        priority: i32,
        input: Value,
    },
    /// No edge matched; follow the step's default successor.
    Default { input: Value },
    /// Failed step with no matching edge: this branch ends.
    Stop,
}

/// Resolves condition fields against a step result and the run history.
pub struct ResultScope<'a> {
    pub result: &'a StepResult,
    pub history: &'a [StepResult],
}

impl<'a> ResultScope<'a> {
    pub fn new(result: &'a StepResult, history: &'a [StepResult]) -> Self {
        Self { result, history }
    }

    fn history_field(&self, field: &str) -> Value {
        match field {
            "count" => json!(self.history.len()),
            "completed" => json!(self.history.iter().filter(|r| r.succeeded()).count()),
            "failed" => json!(self
                .history
                .iter()
                .filter(|r| r.status == StepStatus::Failed)
                .count()),
            "mean_confidence" => {
                let scores: Vec<f64> = self.history.iter().filter_map(|r| r.confidence).collect();
                if scores.is_empty() {
                    Value::Null
                } else {
                    json!(scores.iter().sum::<f64>() / scores.len() as f64)
                }
            }
            _ => Value::Null,
        }
    }
}

/// A field of a single step result.
pub fn result_field(result: &StepResult, path: &[String]) -> Value {
    let Some((head, rest)) = path.split_first() else {
        return Value::Null;
    };
    match head.as_str() {
        "status" => json!(result.status.as_str()),
        "confidence" => result.confidence.map(|c| json!(c)).unwrap_or(Value::Null),
        "output" if rest.is_empty() => result.output.clone(),
        "output" => lookup_path(&result.output, &rest.join(".")),
        "agent" | "agent_id" => result
            .agent_id
            .as_ref()
            .map(|a| json!(a))
            .unwrap_or(Value::Null),
        "duration_ms" => json!(result.duration_ms),
        "error" => result.error.as_ref().map(|e| json!(e)).unwrap_or(Value::Null),
        "attempt" => json!(result.attempt),
        "reasoning" => result
            .reasoning
            .as_ref()
            .map(|r| json!(r))
            .unwrap_or(Value::Null),
        "citations" => json!(result.citations),
        "next_steps" => json!(result.next_steps),
        "step_id" => json!(result.step_id),
        _ => Value::Null,
    }
}

impl FieldResolver for ResultScope<'_> {
    fn resolve(&self, path: &[String]) -> Value {
        match path {
            [root, field] if root == "history" => self.history_field(field),
            [root, step_id, rest @ ..] if root == "results" => self
                .history
                .iter()
                .rev()
                .find(|r| &r.step_id == step_id)
                .map(|r| result_field(r, rest))
                .unwrap_or(Value::Null),
            _ => result_field(self.result, path),
        }
    }
}

/// Chooses the successor of a settled step.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConditionalRouter;

impl ConditionalRouter {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate the step's edges in ascending priority; the first truthy edge wins.
    ///
    /// Skipped steps fall through without evaluating edges.
    pub fn route(&self, step: &Step, result: &StepResult, history: &[StepResult]) -> RouteDecision {
        if result.status == StepStatus::Skipped {
            return RouteDecision::Default { input: Value::Null };
        }

        let scope = ResultScope::new(result, history);
        for edge in step.edges_by_priority() {
            if evaluate_condition(&edge.condition, &scope) {
                debug!(
                    step = %step.id,
                    target = %edge.target,
                    condition = %edge.condition,
                    "Conditional edge matched"
                );
                let input = match &edge.transform {
                    Some(transform) => apply_transform(transform, result.output.clone()),
                    None => result.output.clone(),
                };
                return RouteDecision::Edge {
                    target: edge.target.clone(),
                    priority: edge.priority,
                    input,
                };
            }
        }

        match result.status {
            StepStatus::Completed => RouteDecision::Default {
                input: result.output.clone(),
            },
            _ => RouteDecision::Stop,
        }
    }
}

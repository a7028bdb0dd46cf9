use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use conductor_core::config::AnalyticsConfig;
use conductor_core::error::{ConductorError, Result};
use conductor_core::types::{AnalyticsSummary, Bottleneck, StepResult, StepStatus};
use conductor_core::workflow::{
    ErrorAction, ErrorTrigger, QualityMetric, SuccessCriteria, WorkflowDefinition,
};

use crate::graph::condition::Condition;
use crate::graph::handoff::lookup_path;
use crate::graph::router::ResultScope;

/// Upper bound on a strategy-driven retry delay.
const MAX_STRATEGY_DELAY: Duration = Duration::from_secs(30);

/// Per-run step timings and agent utilization.
pub struct AnalyticsTracker {
    bottleneck_threshold: Duration,
    started: Instant,
    summary: AnalyticsSummary,
}

impl AnalyticsTracker {
    pub fn new(config: &AnalyticsConfig) -> Self {
        Self {
            bottleneck_threshold: Duration::from_secs(config.bottleneck_threshold_secs),
            started: Instant::now(),
            summary: AnalyticsSummary::default(),
        }
    }

    /// Account for one step attempt. Pauses are not counted.
    pub fn record_step(&mut self, result: &StepResult) {
        if result.status == StepStatus::UserInputRequired {
            return;
        }
        let succeeded = result.succeeded();
        self.summary.steps_recorded += 1;
        if succeeded {
            self.summary.steps_succeeded += 1;
        }

        if let Some(agent_id) = &result.agent_id {
            let usage = self
                .summary
                .agent_utilization
                .entry(agent_id.clone())
                .or_default();
            usage.steps += 1;
            usage.total_duration_ms += result.duration_ms;
            if succeeded {
                usage.successes += 1;
            }
        }

        if Duration::from_millis(result.duration_ms) > self.bottleneck_threshold {
            info!(
                step = %result.step_id,
                duration_ms = result.duration_ms,
                "Step exceeded bottleneck threshold"
            );
            self.summary.bottlenecks.push(Bottleneck {
                step_id: result.step_id.clone(),
                agent_id: result.agent_id.clone(),
                duration_ms: result.duration_ms,
            });
        }
    }

    pub fn summary(&self) -> AnalyticsSummary {
        let mut summary = self.summary.clone();
        summary.total_duration_ms = self.started.elapsed().as_millis() as u64;
        summary
    }
}

/// What the run loop must do after an error strategy fires.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyEffect {
    Pause(String),
    Retry { step_id: String, delay: Duration },
    Abort(String),
    Continue,
}

/// A strategy that fired, with its effect.
#[derive(Debug, Clone, PartialEq)]
pub struct FiredStrategy {
    pub name: String,
    pub effect: StrategyEffect,
}

/// Evaluates workflow error strategies and bounds their retries.
#[derive(Debug, Default)]
pub struct ErrorStrategyTracker {
    retries: HashMap<(String, String), u32>,
}

impl ErrorStrategyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strategies that fire for a terminal failure, once the run's error
    /// count has reached the workflow threshold.
    pub fn evaluate(
        &mut self,
        workflow: &WorkflowDefinition,
        error_count: u32,
        failed: &StepResult,
    ) -> Vec<FiredStrategy> {
        if error_count < workflow.error_threshold {
            return vec![];
        }

        let mut fired = Vec::new();
        for strategy in &workflow.error_strategies {
            if !trigger_matches(&strategy.trigger, error_count, failed) {
                continue;
            }

            let effect = match &strategy.action {
                ErrorAction::PauseAndNotify { message } => StrategyEffect::Pause(
                    message.clone().unwrap_or_else(|| {
                        format!("{} errors reached (strategy '{}')", error_count, strategy.name)
                    }),
                ),
                ErrorAction::Abort => StrategyEffect::Abort(format!(
                    "aborted by strategy '{}' after {} errors",
                    strategy.name, error_count
                )),
                ErrorAction::Continue => StrategyEffect::Continue,
                ErrorAction::RetryWithBackoff {
                    max_attempts,
                    initial_delay_ms,
                } => {
                    let used = self
                        .retries
                        .entry((strategy.name.clone(), failed.step_id.clone()))
                        .or_insert(0);
                    if *used >= *max_attempts {
                        warn!(
                            strategy = %strategy.name,
                            step = %failed.step_id,
                            "Strategy retries exhausted"
                        );
                        continue;
                    }
                    *used += 1;
                    let factor = 2u64.saturating_pow(used.saturating_sub(1).min(20));
                    let delay = Duration::from_millis(initial_delay_ms.saturating_mul(factor))
                        .min(MAX_STRATEGY_DELAY);
                    StrategyEffect::Retry {
                        step_id: failed.step_id.clone(),
                        delay,
                    }
                }
            };

            info!(
                strategy = %strategy.name,
                action = strategy.action.name(),
                error_count,
                "Error strategy triggered"
            );
            fired.push(FiredStrategy {
                name: strategy.name.clone(),
                effect,
            });
        }
        fired
    }
}

fn trigger_matches(trigger: &ErrorTrigger, error_count: u32, failed: &StepResult) -> bool {
    match trigger {
        ErrorTrigger::Always => true,
        ErrorTrigger::ErrorCountAtLeast { count } => error_count >= *count,
        ErrorTrigger::StepFailed { step_id } => &failed.step_id == step_id,
        ErrorTrigger::ErrorContains { pattern } => failed
            .error
            .as_deref()
            .is_some_and(|e| e.to_lowercase().contains(&pattern.to_lowercase())),
    }
}

/// Latest result per step, in first-seen order.
fn final_results(results: &[StepResult]) -> Vec<&StepResult> {
    let mut order: Vec<&str> = Vec::new();
    let mut latest: HashMap<&str, &StepResult> = HashMap::new();
    for r in results {
        if !latest.contains_key(r.step_id.as_str()) {
            order.push(&r.step_id);
        }
        latest.insert(&r.step_id, r);
    }
    order.iter().filter_map(|id| latest.get(id).copied()).collect()
}

/// Compute one quality metric over the final step results.
pub fn quality_metric(metric: QualityMetric, results: &[StepResult]) -> f64 {
    let finals = final_results(results);
    let confidences: Vec<f64> = finals
        .iter()
        .filter(|r| r.succeeded())
        .filter_map(|r| r.confidence)
        .collect();
    match metric {
        QualityMetric::MeanConfidence if confidences.is_empty() => 0.0,
        QualityMetric::MeanConfidence => confidences.iter().sum::<f64>() / confidences.len() as f64,
        QualityMetric::MinConfidence => confidences.iter().copied().reduce(f64::min).unwrap_or(0.0),
        QualityMetric::CompletionRate if finals.is_empty() => 0.0,
        QualityMetric::CompletionRate => {
            finals.iter().filter(|r| r.succeeded()).count() as f64 / finals.len() as f64
        }
    }
}

/// Check the workflow's success criteria against the run's step results.
pub fn validate_success_criteria(criteria: &SuccessCriteria, results: &[StepResult]) -> Result<()> {
    let mut misses = Vec::new();
    let finals = final_results(results);

    for key in &criteria.required_outputs {
        let present = finals
            .iter()
            .filter(|r| r.succeeded())
            .any(|r| !lookup_path(&r.output, key).is_null());
        if !present {
            misses.push(format!("required output '{}' missing", key));
        }
    }

    for threshold in &criteria.quality_metrics {
        let value = quality_metric(threshold.metric, results);
        if value < threshold.threshold {
            misses.push(format!(
                "{:?} {:.2} below {:.2}",
                threshold.metric, value, threshold.threshold
            ));
        }
    }

    for check in &criteria.validation_checks {
        let target = match &check.step_id {
            Some(id) => finals.iter().find(|r| &r.step_id == id).copied(),
            None => results.last(),
        };
        let Some(target) = target else {
            misses.push(format!("check '{}' has no step result", check.name));
            continue;
        };
        let scope = ResultScope::new(target, results);
        let passed = Condition::parse(&check.expression)
            .and_then(|c| c.evaluate(&scope))
            .unwrap_or(false);
        if !passed {
            misses.push(format!("check '{}' failed", check.name));
        }
    }

    if misses.is_empty() {
        Ok(())
    } else {
        Err(ConductorError::SuccessCriteriaNotMet(misses.join("; ")))
    }
}

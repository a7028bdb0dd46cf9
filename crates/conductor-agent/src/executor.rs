use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, warn};

use conductor_core::config::EngineConfig;
use conductor_core::error::{ConductorError, Result};
use conductor_core::event::EventBus;
use conductor_core::traits::{AgentCatalog, MetricsStore, WorkerInvoker};
use conductor_core::types::*;
use conductor_core::workflow::{SelectionStrategy, Step};

use crate::graph::handoff::{build_prompt, parse_output, HandoffContext};
use crate::selector::{AgentSelector, Selection, SelectionScope};
use crate::validation::{validate_input, validate_output};

/// Quality recorded for a successful dispatch that reported no confidence.
const DEFAULT_SUCCESS_QUALITY: f64 = 0.7;

/// Everything needed to run one attempt of a step.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub step: Step,
    pub workflow_id: String,
    pub execution_id: ExecutionId,
    pub caller_id: String,
    pub mode: ExecutionMode,
    pub input: HandoffContext,
    pub attempt: u32,
    /// Per-run agent assignment for this step.
    pub agent_override: Option<String>,
}

struct Outcome {
    agent_id: Option<String>,
    result: Result<InvocationOutput>,
    elapsed: Duration,
}

/// Runs a single step: resolves agents, dispatches, and classifies the outcome.
///
/// `execute` never fails; every error becomes a `Failed` (or `Skipped`) result.
pub struct StepExecutor {
    catalog: Arc<dyn AgentCatalog>,
    selector: Arc<AgentSelector>,
    metrics: Arc<dyn MetricsStore>,
    invoker: Arc<dyn WorkerInvoker>,
    events: Arc<EventBus>,
    config: EngineConfig,
}

impl StepExecutor {
    pub fn new(
        catalog: Arc<dyn AgentCatalog>,
        selector: Arc<AgentSelector>,
        metrics: Arc<dyn MetricsStore>,
        invoker: Arc<dyn WorkerInvoker>,
        events: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            catalog,
            selector,
            metrics,
            invoker,
            events,
            config,
        }
    }

    pub async fn execute(&self, req: &StepRequest) -> StepResult {
        let started_at = Utc::now();
        let start = Instant::now();

        let mut result = self.run(req).await;
        result.attempt = req.attempt;
        result.started_at = started_at;
        result.duration_ms = start.elapsed().as_millis() as u64;

        debug!(
            step = %req.step.id,
            status = %result.status,
            attempt = req.attempt,
            duration_ms = result.duration_ms,
            "Step attempt finished"
        );
        result
    }

    async fn run(&self, req: &StepRequest) -> StepResult {
        let step = &req.step;

        if awaits_user(req) {
            let mut result = StepResult::new(&step.id, StepStatus::UserInputRequired);
            result.reasoning = Some(format!("'{}' needs user input before it can run", step.name));
            result.retryable = false;
            return result;
        }

        if let Err(e) = validate_input(&step.validation, &req.input.to_value()) {
            let status = if step.optional {
                StepStatus::Skipped
            } else {
                StepStatus::Failed
            };
            info!(step = %step.id, status = %status, error = %e, "Step input rejected");
            let mut result = StepResult::new(&step.id, status);
            result.error = Some(e.to_string());
            result.retryable = false;
            return result;
        }

        let selection = match self.resolve(req).await {
            Ok(selection) => selection,
            Err(e) => {
                warn!(step = %step.id, error = %e, "No agent for step");
                let mut result = StepResult::failed(&step.id, e.to_string());
                result.retryable = e.is_retryable();
                return result;
            }
        };

        let prompt = build_prompt(step, &req.input);
        let ctx = InvocationContext {
            execution_id: req.execution_id.to_string(),
            workflow_id: req.workflow_id.clone(),
            step_id: step.id.clone(),
            caller_id: req.caller_id.clone(),
            attempt: req.attempt,
            input: req.input.to_value(),
        };

        let Some(selection) = selection else {
            debug!(step = %step.id, "Dispatching without an agent");
            let outcome = self.dispatch(None, step, &prompt, &ctx).await;
            return self.classify(step, outcome);
        };

        self.events.publish(EngineEvent::AgentSelected {
            execution_id: req.execution_id.clone(),
            step_id: step.id.clone(),
            agent_id: selection.primary().id.clone(),
            strategy: step.selection.name().to_string(),
        });

        let agents = selection.agents();
        let outcomes = join_all(
            agents
                .iter()
                .map(|agent| self.dispatch(Some(*agent), step, &prompt, &ctx)),
        )
        .await;

        let members: Vec<StepResult> = outcomes
            .into_iter()
            .map(|outcome| self.classify(step, outcome))
            .collect();
        for member in &members {
            self.record_telemetry(req, member).await;
        }

        let mut members = members.into_iter();
        let Some(mut result) = members.next() else {
            return StepResult::failed(&step.id, "empty selection");
        };
        result.consensus = members.map(consensus_output).collect();
        result
    }

    /// Resolution order: per-run override, the step's agent, the selector,
    /// then the bare-invoker path when allowed.
    async fn resolve(&self, req: &StepRequest) -> Result<Option<Selection>> {
        let step = &req.step;

        for (source, id) in [
            ("override", req.agent_override.as_deref()),
            ("step", step.agent_id.as_deref()),
        ] {
            let Some(id) = id else { continue };
            match self.catalog.get_agent(id).await {
                Ok(Some(agent)) if agent.is_active() => {
                    debug!(step = %step.id, agent = %id, source, "Using assigned agent");
                    return Ok(Some(Selection::Single(agent)));
                }
                Ok(Some(_)) => {
                    warn!(step = %step.id, agent = %id, source, "Assigned agent is inactive")
                }
                Ok(None) => warn!(step = %step.id, agent = %id, source, "Assigned agent not found"),
                Err(e) => warn!(step = %step.id, agent = %id, error = %e, "Agent lookup failed"),
            }
        }

        let candidates = match self.catalog.list_active_agents().await {
            Ok(agents) => agents,
            Err(e) => {
                warn!(step = %step.id, error = %e, "Agent catalog unavailable");
                vec![]
            }
        };

        let manual = matches!(step.selection, SelectionStrategy::Manual { .. });
        if candidates.is_empty() && !manual && self.config.allow_unassigned_steps {
            return Ok(None);
        }

        let scope = SelectionScope {
            workflow_id: &req.workflow_id,
            execution_id: Some(req.execution_id.0.as_str()),
        };
        match self
            .selector
            .select(step, scope, &candidates, &step.selection)
            .await
        {
            Ok(selection) => Ok(Some(selection)),
            Err(ConductorError::NoAgentsAvailable) if self.config.allow_unassigned_steps => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn dispatch(
        &self,
        agent: Option<&AgentDescriptor>,
        step: &Step,
        prompt: &str,
        ctx: &InvocationContext,
    ) -> Outcome {
        let agent_id = agent.map(|a| a.id.clone());
        if let Some(id) = &agent_id {
            if let Err(e) = self
                .metrics
                .begin_execution(id, &ctx.execution_id, &step.id)
                .await
            {
                warn!(agent = %id, error = %e, "Failed to mark agent as running");
            }
        }

        let timeout_secs = step
            .timeout_secs
            .unwrap_or(self.config.default_step_timeout_secs);
        let start = Instant::now();
        let result = match tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.invoker.invoke(agent, prompt, ctx),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ConductorError::StepTimeout {
                step: step.id.clone(),
                timeout_secs,
            }),
        };
        let elapsed = start.elapsed();

        if let Some(id) = &agent_id {
            if let Err(e) = self
                .metrics
                .end_execution(id, &ctx.execution_id, &step.id)
                .await
            {
                warn!(agent = %id, error = %e, "Failed to clear running mark");
            }
        }

        Outcome {
            agent_id,
            result,
            elapsed,
        }
    }

    fn classify(&self, step: &Step, outcome: Outcome) -> StepResult {
        let duration_ms = outcome.elapsed.as_millis() as u64;
        let mut result = match outcome.result {
            Ok(out) if out.needs_input.is_some() => {
                let mut result = StepResult::new(&step.id, StepStatus::UserInputRequired);
                result.agent_id = outcome.agent_id;
                result.reasoning = out.needs_input;
                result.output = parse_output(&out.content);
                result.retryable = false;
                result
            }
            Ok(out) => {
                let output = parse_output(&out.content);
                let mut result = StepResult::new(&step.id, StepStatus::Completed);
                if let Some(schema) = &step.output_schema {
                    if let Err(e) = validate_output(schema, &output) {
                        result.status = StepStatus::Failed;
                        result.error = Some(e.to_string());
                    }
                }
                result.agent_id = outcome.agent_id;
                result.output = output;
                result.confidence = out.confidence.map(|c| c.clamp(0.0, 1.0));
                result.reasoning = out.reasoning;
                result.citations = out.citations;
                result.next_steps = out.next_steps;
                result
            }
            Err(e) => {
                let mut result = StepResult::failed(&step.id, e.to_string());
                result.agent_id = outcome.agent_id;
                result.retryable = e.is_retryable();
                result
            }
        };
        result.duration_ms = duration_ms;
        result
    }

    /// Telemetry follows the classified status: only a `Completed` member counts as a success.
    async fn record_telemetry(&self, req: &StepRequest, member: &StepResult) {
        let Some(agent_id) = &member.agent_id else {
            return;
        };
        let success = member.status == StepStatus::Completed;
        let quality = if success {
            member.confidence.unwrap_or(DEFAULT_SUCCESS_QUALITY)
        } else {
            0.0
        };
        let metrics = PerformanceMetrics {
            duration_ms: member.duration_ms,
            success,
            quality_score: quality.clamp(0.0, 1.0),
            error_count: u32::from(!success),
            user_satisfaction: None,
        };

        if let Err(e) = self
            .metrics
            .record_performance(agent_id, &req.step.id, &req.workflow_id, &metrics)
            .await
        {
            warn!(agent = %agent_id, step = %req.step.id, error = %e, "Failed to record performance");
        }
        self.selector.scorer().invalidate(agent_id).await;
    }
}

fn consensus_output(member: StepResult) -> ConsensusOutput {
    let succeeded = member.status == StepStatus::Completed;
    let output = match member.error {
        Some(error) if !succeeded => serde_json::Value::String(error),
        _ => member.output,
    };
    ConsensusOutput {
        agent_id: member.agent_id.unwrap_or_default(),
        output,
        confidence: member.confidence,
        succeeded,
    }
}

/// Manual runs pause every step, semi-automated runs pause flagged steps,
/// until input has been supplied on resume.
fn awaits_user(req: &StepRequest) -> bool {
    if req.input.has_user_input() {
        return false;
    }
    match req.mode {
        ExecutionMode::Automated => false,
        ExecutionMode::SemiAutomated => req.step.requires_user_input,
        ExecutionMode::Manual => true,
    }
}

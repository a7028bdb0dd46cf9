//! The workflow engine service: starts runs and drives each one to completion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use conductor_core::config::AppConfig;
use conductor_core::error::{ConductorError, Result};
use conductor_core::event::EventBus;
use conductor_core::traits::{AgentCatalog, ExecutionStore, MetricsStore, WorkerInvoker};
use conductor_core::types::*;
use conductor_core::workflow::{Step, WorkflowDefinition};

use crate::analytics::{
    validate_success_criteria, AnalyticsTracker, ErrorStrategyTracker, StrategyEffect,
};
use crate::executor::{StepExecutor, StepRequest};
use crate::graph::{Batch, ConditionalRouter, HandoffContext, StepState, Transition, WorkflowStateMachine};
use crate::scorer::AgentScorer;
use crate::selector::AgentSelector;

/// External collaborators the engine is built from.
#[derive(Clone)]
pub struct EngineDeps {
    pub catalog: Arc<dyn AgentCatalog>,
    pub metrics: Arc<dyn MetricsStore>,
    pub executions: Arc<dyn ExecutionStore>,
    pub invoker: Arc<dyn WorkerInvoker>,
    pub events: Arc<EventBus>,
}

/// Parameters of a new run.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub workflow_id: String,
    pub caller_id: String,
    pub mode: ExecutionMode,
    /// Shared input visible to every step.
    pub input: Value,
    /// Step id (or step position) to agent id.
    pub agent_overrides: HashMap<String, String>,
}

impl StartRequest {
    pub fn new(workflow_id: impl Into<String>, caller_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            caller_id: caller_id.into(),
            mode: ExecutionMode::Automated,
            input: Value::Null,
            agent_overrides: HashMap::new(),
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_agent_override(mut self, step: impl Into<String>, agent_id: impl Into<String>) -> Self {
        self.agent_overrides.insert(step.into(), agent_id.into());
        self
    }
}

/// Mutable state of one run, owned by its driving task (or parked while paused).
struct RunState {
    id: ExecutionId,
    request: StartRequest,
    machine: WorkflowStateMachine,
    results: Vec<StepResult>,
    analytics: AnalyticsTracker,
    strategies: ErrorStrategyTracker,
    error_count: u32,
    current_step: Option<String>,
    pause_reason: Option<String>,
    aborted: Option<String>,
    error: Option<String>,
    started_at: DateTime<Utc>,
}

impl RunState {
    fn progress(&self, status: ExecutionStatus) -> ExecutionProgress {
        let now = Utc::now();
        ExecutionProgress {
            execution_id: self.id.to_string(),
            workflow_id: self.request.workflow_id.clone(),
            caller_id: self.request.caller_id.clone(),
            mode: self.request.mode,
            status,
            total_steps: self.machine.total_steps(),
            completed_steps: self.machine.count(StepState::Completed),
            failed_steps: self.machine.count(StepState::Failed),
            current_step: self.current_step.clone(),
            paused_steps: self.machine.paused_steps(),
            step_results: self.results.clone(),
            error_count: self.error_count,
            error: self.error.clone(),
            analytics: self.analytics.summary(),
            started_at: self.started_at,
            updated_at: now,
            finished_at: status.is_terminal().then_some(now),
        }
    }
}

/// Handle to an active run in the run table.
struct RunEntry {
    cancel: CancellationToken,
    pause_requested: AtomicBool,
    /// Interrupts a deferred-retry wait when a pause is requested.
    wake: Notify,
    progress: RwLock<ExecutionProgress>,
    status: watch::Sender<ExecutionStatus>,
    parked: Mutex<Option<RunState>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct EngineInner {
    config: AppConfig,
    executor: StepExecutor,
    router: ConditionalRouter,
    executions: Arc<dyn ExecutionStore>,
    events: Arc<EventBus>,
    workflows: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    runs: RwLock<HashMap<String, Arc<RunEntry>>>,
}

/// Runs workflows: one coordinating task per execution, all runs concurrent.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn new(config: AppConfig, deps: EngineDeps) -> Self {
        let scorer = Arc::new(AgentScorer::new(config.scoring.clone(), deps.metrics.clone()));
        let selector = Arc::new(AgentSelector::new(
            scorer,
            deps.metrics.clone(),
            config.selection.clone(),
        ));
        let executor = StepExecutor::new(
            deps.catalog,
            selector,
            deps.metrics,
            deps.invoker,
            deps.events.clone(),
            config.engine.clone(),
        );
        Self {
            inner: Arc::new(EngineInner {
                config,
                executor,
                router: ConditionalRouter::new(),
                executions: deps.executions,
                events: deps.events,
                workflows: RwLock::new(HashMap::new()),
                runs: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    /// Validate and register a workflow definition, replacing any with the same id.
    pub async fn register_workflow(&self, workflow: WorkflowDefinition) -> Result<()> {
        workflow.validate()?;
        info!(workflow = %workflow.id, steps = workflow.steps.len(), "Workflow registered");
        self.inner
            .workflows
            .write()
            .await
            .insert(workflow.id.clone(), Arc::new(workflow));
        Ok(())
    }

    pub async fn workflow(&self, workflow_id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.inner.workflows.read().await.get(workflow_id).cloned()
    }

    /// Start a run in the background and return its id.
    pub async fn start_execution(&self, request: StartRequest) -> Result<ExecutionId> {
        let workflow = self
            .workflow(&request.workflow_id)
            .await
            .ok_or_else(|| ConductorError::WorkflowNotFound(request.workflow_id.clone()))?;

        let id = ExecutionId::new();
        let state = RunState {
            id: id.clone(),
            machine: WorkflowStateMachine::new(workflow),
            request,
            results: Vec::new(),
            analytics: AnalyticsTracker::new(&self.inner.config.analytics),
            strategies: ErrorStrategyTracker::new(),
            error_count: 0,
            current_step: None,
            pause_reason: None,
            aborted: None,
            error: None,
            started_at: Utc::now(),
        };
        let progress = state.progress(ExecutionStatus::Running);
        let (status, _) = watch::channel(ExecutionStatus::Running);
        let entry = Arc::new(RunEntry {
            cancel: CancellationToken::new(),
            pause_requested: AtomicBool::new(false),
            wake: Notify::new(),
            progress: RwLock::new(progress.clone()),
            status,
            parked: Mutex::new(None),
            handle: Mutex::new(None),
        });

        self.inner.runs.write().await.insert(id.0.clone(), entry.clone());
        self.inner.persist(&id, ExecutionStatus::Running, &progress).await;

        info!(
            execution_id = %id,
            workflow = %state.request.workflow_id,
            caller = %state.request.caller_id,
            mode = ?state.request.mode,
            "Execution started"
        );
        self.inner.events.publish(EngineEvent::RunStarted {
            execution_id: id.clone(),
            workflow_id: state.request.workflow_id.clone(),
        });

        self.spawn(entry, state).await;
        Ok(id)
    }

    /// Start a run and wait until it finishes or pauses.
    pub async fn run_execution(&self, request: StartRequest) -> Result<ExecutionProgress> {
        let id = self.start_execution(request).await?;
        self.wait(&id).await
    }

    /// Resolve once the run is no longer running (finished or paused).
    pub async fn wait(&self, id: &ExecutionId) -> Result<ExecutionProgress> {
        if let Some(entry) = self.entry(id).await {
            let mut rx = entry.status.subscribe();
            if rx.wait_for(|s| *s != ExecutionStatus::Running).await.is_err() {
                debug!(execution_id = %id, "Status channel closed while waiting");
            }
        }
        self.get_progress(id).await
    }

    /// Live progress for active runs; stored progress for finished ones.
    pub async fn get_progress(&self, id: &ExecutionId) -> Result<ExecutionProgress> {
        if let Some(entry) = self.entry(id).await {
            return Ok(entry.progress.read().await.clone());
        }
        match self.inner.executions.load_execution(&id.0).await? {
            Some(record) => Ok(record.progress),
            None => Err(ConductorError::ExecutionNotFound(id.to_string())),
        }
    }

    /// Ask a run to pause before its next batch.
    pub async fn pause_execution(&self, id: &ExecutionId) -> Result<()> {
        let entry = self.active_entry(id).await?;
        entry.pause_requested.store(true, Ordering::SeqCst);
        entry.wake.notify_one();
        info!(execution_id = %id, "Pause requested");
        Ok(())
    }

    /// Resume a paused run, handing `user_input` to every step awaiting input.
    pub async fn resume_execution(&self, id: &ExecutionId, user_input: Option<Value>) -> Result<()> {
        let entry = self.active_entry(id).await?;
        let mut parked = entry.parked.lock().await;
        let Some(mut state) = parked.take() else {
            if entry.pause_requested.swap(false, Ordering::SeqCst) {
                debug!(execution_id = %id, "Pending pause withdrawn");
                return Ok(());
            }
            return Err(ConductorError::InvalidState {
                execution: id.to_string(),
                message: "execution is not paused".into(),
            });
        };
        drop(parked);

        entry.pause_requested.store(false, Ordering::SeqCst);
        state.pause_reason = None;
        for step_id in state.machine.paused_steps() {
            if let Err(e) = state.machine.resume(&step_id, user_input.clone()) {
                warn!(execution_id = %id, step = %step_id, error = %e, "Could not resume step");
            }
        }

        let progress = state.progress(ExecutionStatus::Running);
        *entry.progress.write().await = progress.clone();
        self.inner.persist(id, ExecutionStatus::Running, &progress).await;
        entry.status.send_replace(ExecutionStatus::Running);
        info!(execution_id = %id, "Execution resumed");

        self.spawn(entry, state).await;
        Ok(())
    }

    /// Cancel a run. In-flight steps finish; nothing further is dispatched.
    pub async fn cancel_execution(&self, id: &ExecutionId) -> Result<()> {
        let entry = self.active_entry(id).await?;
        entry.cancel.cancel();
        info!(execution_id = %id, "Cancellation requested");

        let parked = entry.parked.lock().await.take();
        if let Some(state) = parked {
            self.inner.finish(&entry, state, true).await;
        }
        Ok(())
    }

    pub async fn active_executions(&self) -> Vec<ExecutionId> {
        self.inner
            .runs
            .read()
            .await
            .keys()
            .map(|k| ExecutionId::from_string(k))
            .collect()
    }

    /// Cancel every active run and wait for their tasks to end.
    pub async fn shutdown(&self) {
        let entries: Vec<(String, Arc<RunEntry>)> = self
            .inner
            .runs
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        info!(active = entries.len(), "Engine shutting down");

        for (id, entry) in entries {
            if let Err(e) = self.cancel_execution(&ExecutionId::from_string(&id)).await {
                debug!(execution_id = %id, error = %e, "Run ended before shutdown");
            }
            let handle = entry.handle.lock().await.take();
            if let Some(handle) = handle {
                if let Err(e) = handle.await {
                    error!(execution_id = %id, error = %e, "Run task panicked");
                }
            }
        }
    }

    /// Close out stored runs left running or paused by a previous process.
    ///
    /// Their in-memory state is gone, so they are marked `Failed` with their
    /// partial results kept. Returns the ids that were closed.
    pub async fn recover_interrupted(&self) -> Result<Vec<String>> {
        let mut stale = self
            .inner
            .executions
            .list_executions(Some(ExecutionStatus::Running))
            .await?;
        stale.extend(
            self.inner
                .executions
                .list_executions(Some(ExecutionStatus::Paused))
                .await?,
        );

        let live: Vec<String> = self.inner.runs.read().await.keys().cloned().collect();
        let mut closed = Vec::new();
        for record in stale {
            if live.contains(&record.execution_id) {
                continue;
            }
            let now = Utc::now();
            let mut progress = record.progress;
            progress.status = ExecutionStatus::Failed;
            progress.error = Some(format!("interrupted while {}", record.status));
            progress.updated_at = now;
            progress.finished_at = Some(now);

            let id = ExecutionId::from_string(&record.execution_id);
            warn!(execution_id = %id, was = %record.status, "Closing interrupted execution");
            self.inner.persist(&id, ExecutionStatus::Failed, &progress).await;
            closed.push(record.execution_id);
        }
        Ok(closed)
    }

    async fn entry(&self, id: &ExecutionId) -> Option<Arc<RunEntry>> {
        self.inner.runs.read().await.get(&id.0).cloned()
    }

    async fn active_entry(&self, id: &ExecutionId) -> Result<Arc<RunEntry>> {
        if let Some(entry) = self.entry(id).await {
            return Ok(entry);
        }
        match self.inner.executions.load_execution(&id.0).await? {
            Some(record) => Err(ConductorError::InvalidState {
                execution: id.to_string(),
                message: format!("execution already {}", record.status),
            }),
            None => Err(ConductorError::ExecutionNotFound(id.to_string())),
        }
    }

    async fn spawn(&self, entry: Arc<RunEntry>, state: RunState) {
        let handle = tokio::spawn(self.inner.clone().drive(entry.clone(), state));
        *entry.handle.lock().await = Some(handle);
    }
}

impl EngineInner {
    /// The coordinating loop of one run.
    async fn drive(self: Arc<Self>, entry: Arc<RunEntry>, mut state: RunState) {
        loop {
            if entry.cancel.is_cancelled() {
                self.finish(&entry, state, true).await;
                return;
            }
            if state.aborted.is_some() {
                self.finish(&entry, state, false).await;
                return;
            }

            let requested = entry.pause_requested.load(Ordering::SeqCst);
            let awaiting = state.machine.paused_steps();
            if requested || !awaiting.is_empty() {
                let reason = state.pause_reason.clone().unwrap_or_else(|| {
                    if awaiting.is_empty() {
                        "pause requested".to_string()
                    } else {
                        format!("awaiting user input: {}", awaiting.join(", "))
                    }
                });
                match self.park(&entry, state, reason, !awaiting.is_empty()).await {
                    Some(returned) => {
                        state = returned;
                        continue;
                    }
                    None => return,
                }
            }

            let batches = state.machine.next_batches(Instant::now());
            if batches.is_empty() {
                if let Some(wake) = state.machine.next_wakeup() {
                    tokio::select! {
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {}
                        _ = entry.cancel.cancelled() => {}
                        _ = entry.wake.notified() => {}
                    }
                    continue;
                }
                self.finish(&entry, state, false).await;
                return;
            }

            for batch in batches {
                if entry.cancel.is_cancelled() || state.aborted.is_some() {
                    break;
                }
                let results = self.run_batch(&mut state, &batch).await;
                for result in results {
                    self.apply(&mut state, result);
                }
                if state.pause_reason.is_some() {
                    entry.pause_requested.store(true, Ordering::SeqCst);
                }

                let progress = state.progress(ExecutionStatus::Running);
                *entry.progress.write().await = progress.clone();
                self.persist(&state.id, ExecutionStatus::Running, &progress).await;
                if entry.pause_requested.load(Ordering::SeqCst)
                    || !state.machine.paused_steps().is_empty()
                {
                    break;
                }
            }
        }
    }

    async fn run_batch(&self, state: &mut RunState, batch: &Batch) -> Vec<StepResult> {
        let workflow = state.machine.workflow().clone();
        let mut requests = Vec::with_capacity(batch.steps.len());
        for step_id in &batch.steps {
            let Some(step) = workflow.step(step_id) else {
                warn!(execution_id = %state.id, step = %step_id, "Queued step missing from workflow");
                continue;
            };
            let attempt = state.machine.mark_running(step_id);
            state.current_step = Some(step_id.clone());
            self.events.publish(EngineEvent::StepStarted {
                execution_id: state.id.clone(),
                step_id: step_id.clone(),
                attempt,
            });
            requests.push(self.request_for(state, step, attempt));
        }

        if batch.parallel {
            debug!(execution_id = %state.id, steps = ?batch.steps, "Dispatching parallel batch");
        }
        let width = self.config.engine.max_concurrent_steps.max(1);
        let mut results = Vec::with_capacity(requests.len());
        for chunk in requests.chunks(width) {
            results.extend(join_all(chunk.iter().map(|r| self.executor.execute(r))).await);
        }
        results
    }

    fn request_for(&self, state: &RunState, step: &Step, attempt: u32) -> StepRequest {
        let mut input = HandoffContext::from_value(&state.request.input);
        input.merge(&state.machine.input_for(&step.id));

        let overrides = &state.request.agent_overrides;
        let agent_override = overrides
            .get(&step.id)
            .or_else(|| overrides.get(&step.position.to_string()))
            .cloned();

        StepRequest {
            step: step.clone(),
            workflow_id: state.request.workflow_id.clone(),
            execution_id: state.id.clone(),
            caller_id: state.request.caller_id.clone(),
            mode: state.request.mode,
            input,
            attempt,
            agent_override,
        }
    }

    /// Record a step result, then retry, pause, or route as the state machine decides.
    fn apply(&self, state: &mut RunState, result: StepResult) {
        state.analytics.record_step(&result);
        state.results.push(result.clone());
        self.events.publish(EngineEvent::StepFinished {
            execution_id: state.id.clone(),
            step_id: result.step_id.clone(),
            status: result.status,
            duration_ms: result.duration_ms,
        });

        let now = Instant::now();
        match state.machine.apply_result(&result, now) {
            Transition::RetryScheduled { attempt, delay } => {
                info!(
                    execution_id = %state.id,
                    step = %result.step_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = result.error.as_deref().unwrap_or(""),
                    "Retrying step"
                );
                self.events.publish(EngineEvent::StepRetryScheduled {
                    execution_id: state.id.clone(),
                    step_id: result.step_id.clone(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                });
            }
            Transition::AwaitingInput => {
                info!(execution_id = %state.id, step = %result.step_id, "Step awaiting user input");
                self.events.publish(EngineEvent::UserInputRequired {
                    execution_id: state.id.clone(),
                    step_id: result.step_id.clone(),
                    prompt: result.reasoning.clone(),
                });
            }
            Transition::Settled(status) => {
                let workflow = state.machine.workflow().clone();
                if let Some(step) = workflow.step(&result.step_id) {
                    let decision = self.router.route(step, &result, &state.results);
                    state.machine.apply_route(&result.step_id, decision);
                }
                if status == StepStatus::Failed {
                    state.error_count += 1;
                    warn!(
                        execution_id = %state.id,
                        step = %result.step_id,
                        error_count = state.error_count,
                        error = result.error.as_deref().unwrap_or(""),
                        "Step failed"
                    );
                    self.apply_strategies(state, &workflow, &result, now);
                }
            }
        }
    }

    fn apply_strategies(
        &self,
        state: &mut RunState,
        workflow: &WorkflowDefinition,
        failed: &StepResult,
        now: Instant,
    ) {
        let fired = state.strategies.evaluate(workflow, state.error_count, failed);
        for strategy in fired {
            self.events.publish(EngineEvent::ErrorStrategyTriggered {
                execution_id: state.id.clone(),
                strategy: strategy.name.clone(),
                error_count: state.error_count,
            });
            match strategy.effect {
                StrategyEffect::Pause(reason) => {
                    state.pause_reason.get_or_insert(reason);
                }
                StrategyEffect::Retry { step_id, delay } => {
                    if !state.machine.force_retry(&step_id, delay, now) {
                        debug!(step = %step_id, "Strategy retry skipped; step not failed");
                    }
                }
                StrategyEffect::Abort(reason) => {
                    state.aborted.get_or_insert(reason);
                }
                StrategyEffect::Continue => {}
            }
        }
    }

    /// Store a run as paused. Returns the state back when the pause no longer applies.
    async fn park(
        &self,
        entry: &RunEntry,
        mut state: RunState,
        reason: String,
        awaiting_input: bool,
    ) -> Option<RunState> {
        let mut parked = entry.parked.lock().await;
        if entry.cancel.is_cancelled()
            || (!awaiting_input && !entry.pause_requested.load(Ordering::SeqCst))
        {
            return Some(state);
        }

        state.pause_reason = Some(reason.clone());
        let progress = state.progress(ExecutionStatus::Paused);
        *entry.progress.write().await = progress.clone();
        self.persist(&state.id, ExecutionStatus::Paused, &progress).await;

        info!(execution_id = %state.id, reason = %reason, "Execution paused");
        self.events.publish(EngineEvent::RunPaused {
            execution_id: state.id.clone(),
            reason,
        });
        *parked = Some(state);
        entry.status.send_replace(ExecutionStatus::Paused);
        None
    }

    /// Settle the run status, validate success criteria, publish, persist, and evict.
    async fn finish(&self, entry: &RunEntry, mut state: RunState, cancelled: bool) {
        let failed = state.machine.count(StepState::Failed);
        let status = if cancelled {
            state.error = Some(ConductorError::Cancelled.to_string());
            ExecutionStatus::Cancelled
        } else if let Some(reason) = state.aborted.clone() {
            state.error = Some(reason);
            ExecutionStatus::Failed
        } else if failed > 0 {
            state.error = Some(format!(
                "{} step(s) failed: {}",
                failed,
                state.machine.failed_steps().join(", ")
            ));
            ExecutionStatus::Failed
        } else {
            let criteria = state.machine.workflow().success_criteria.clone();
            match criteria.map(|c| validate_success_criteria(&c, &state.results)) {
                Some(Err(e)) => {
                    state.error = Some(e.to_string());
                    ExecutionStatus::Failed
                }
                _ => ExecutionStatus::Completed,
            }
        };

        let progress = state.progress(status);
        let total_duration_ms = (Utc::now() - state.started_at).num_milliseconds().max(0) as u64;
        match status {
            ExecutionStatus::Completed => info!(
                execution_id = %state.id,
                steps = progress.completed_steps,
                elapsed_ms = total_duration_ms,
                "Execution completed"
            ),
            _ => warn!(
                execution_id = %state.id,
                status = %status,
                error = progress.error.as_deref().unwrap_or(""),
                elapsed_ms = total_duration_ms,
                "Execution ended"
            ),
        }
        if let Some(err) = &progress.error {
            if status == ExecutionStatus::Failed {
                self.events.publish(EngineEvent::RunError {
                    execution_id: state.id.clone(),
                    error: err.clone(),
                });
            }
        }

        *entry.progress.write().await = progress.clone();
        self.persist(&state.id, status, &progress).await;
        self.runs.write().await.remove(&state.id.0);
        self.events.publish(EngineEvent::RunComplete {
            execution_id: state.id.clone(),
            status,
            total_duration_ms,
        });
        entry.status.send_replace(status);
    }

    async fn persist(&self, id: &ExecutionId, status: ExecutionStatus, progress: &ExecutionProgress) {
        if let Err(e) = self
            .executions
            .persist_execution_status(&id.0, status, progress)
            .await
        {
            warn!(execution_id = %id, error = %e, "Failed to persist execution status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::{InMemoryExecutionStore, InMemoryMetricsStore, StaticCatalog};
    use conductor_core::workflow::{
        ConditionalEdge, DefaultNext, ErrorAction, ErrorStrategy, ErrorTrigger, QualityMetric,
        QualityThreshold, RetryPolicy, SuccessCriteria,
    };
    use conductor_test_utils::{agent, linear_workflow, Script, ScriptedInvoker};
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        engine: WorkflowEngine,
        invoker: Arc<ScriptedInvoker>,
        executions: Arc<InMemoryExecutionStore>,
    }

    fn harness(invoker: ScriptedInvoker) -> Harness {
        let invoker = Arc::new(invoker);
        let executions = Arc::new(InMemoryExecutionStore::new());
        let deps = EngineDeps {
            catalog: Arc::new(StaticCatalog::new(vec![
                agent("lead", 1, &["analysis"]),
                agent("analyst", 2, &["analysis"]),
            ])),
            metrics: Arc::new(InMemoryMetricsStore::new()),
            executions: executions.clone(),
            invoker: invoker.clone(),
            events: Arc::new(EventBus::default()),
        };
        Harness {
            engine: WorkflowEngine::new(AppConfig::default(), deps),
            invoker,
            executions,
        }
    }

    async fn run(h: &Harness, workflow: WorkflowDefinition) -> ExecutionProgress {
        let id = workflow.id.clone();
        h.engine.register_workflow(workflow).await.unwrap();
        h.engine
            .run_execution(StartRequest::new(id, "tester"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_linear_run_completes() {
        let h = harness(ScriptedInvoker::new());
        let progress = run(&h, linear_workflow("wf", &["a", "b", "c"])).await;

        assert_eq!(progress.status, ExecutionStatus::Completed);
        assert_eq!(progress.completed_steps, 3);
        assert_eq!(progress.step_results.len(), 3);
        assert_eq!(progress.analytics.steps_recorded, 3);
        assert!(progress.finished_at.is_some());

        let id = ExecutionId::from_string(&progress.execution_id);
        assert!(h.engine.active_executions().await.is_empty());
        let stored = h.engine.get_progress(&id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        let record = h.executions.load_execution(&id.0).await.unwrap().unwrap();
        assert_eq!(record.progress.step_results, progress.step_results);
    }

    #[tokio::test]
    async fn test_retries_then_failed() {
        let h = harness(ScriptedInvoker::new().with_step("flaky", Script::fail("upstream 503")));
        let wf = WorkflowDefinition::new(
            "wf",
            "Retry",
            vec![Step::new("flaky", "Flaky").with_retry(RetryPolicy::new(2, 10))],
        );
        let progress = run(&h, wf).await;

        assert_eq!(h.invoker.calls_for("flaky"), 3);
        assert_eq!(progress.status, ExecutionStatus::Failed);
        assert_eq!(progress.failed_steps, 1);
        assert_eq!(progress.error_count, 1);
        let attempts: Vec<u32> = progress.step_results.iter().map(|r| r.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let h = harness(ScriptedInvoker::new().with_sequence(
            "flaky",
            vec![Script::fail("blip"), Script::reply("fine")],
        ));
        let wf = WorkflowDefinition::new(
            "wf",
            "Retry",
            vec![Step::new("flaky", "Flaky").with_retry(RetryPolicy::new(2, 0))],
        );
        let progress = run(&h, wf).await;
        assert_eq!(progress.status, ExecutionStatus::Completed);
        assert_eq!(progress.error_count, 0);
        assert_eq!(h.invoker.calls_for("flaky"), 2);
    }

    #[tokio::test]
    async fn test_parallel_failure_does_not_cancel_siblings() {
        let h = harness(
            ScriptedInvoker::new()
                .with_step("p1", Script::fail("boom"))
                .with_step("p2", Script::reply(r#"{"x": 1}"#).delay_ms(50))
                .with_step("p3", Script::reply(r#"{"y": 2}"#)),
        );
        let wf = WorkflowDefinition::new(
            "wf",
            "Fan-out",
            vec![
                Step::new("p1", "P1").parallel(),
                Step::new("p2", "P2").parallel(),
                Step::new("p3", "P3").parallel(),
                Step::new("merge", "Merge"),
            ],
        );
        let progress = run(&h, wf).await;

        for id in ["p1", "p2", "p3", "merge"] {
            assert_eq!(h.invoker.calls_for(id), 1, "{} should run once", id);
        }
        let merge_call = h
            .invoker
            .calls()
            .into_iter()
            .find(|c| c.step_id == "merge")
            .unwrap();
        assert_eq!(merge_call.input["p2"], json!({"x": 1}));
        assert_eq!(progress.status, ExecutionStatus::Failed);
        assert_eq!(progress.completed_steps, 3);
    }

    fn branching() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "wf",
            "Branch",
            vec![
                Step::new("a", "A")
                    .with_edge(ConditionalEdge::new("confidence > 0.8", "b", 1))
                    .with_default_next(DefaultNext::Step { id: "c".into() }),
                Step::new("b", "B").with_default_next(DefaultNext::End),
                Step::new("c", "C"),
            ],
        )
    }

    #[tokio::test]
    async fn test_confident_result_takes_edge() {
        let h = harness(ScriptedInvoker::new().with_step("a", Script::reply("sure").confidence(0.9)));
        let progress = run(&h, branching()).await;
        assert_eq!(progress.status, ExecutionStatus::Completed);
        assert_eq!(h.invoker.calls_for("b"), 1);
        assert_eq!(h.invoker.calls_for("c"), 0);
    }

    #[tokio::test]
    async fn test_unsure_result_takes_default() {
        let h = harness(ScriptedInvoker::new().with_step("a", Script::reply("maybe").confidence(0.5)));
        let progress = run(&h, branching()).await;
        assert_eq!(progress.status, ExecutionStatus::Completed);
        assert_eq!(h.invoker.calls_for("b"), 0);
        assert_eq!(h.invoker.calls_for("c"), 1);
    }

    #[tokio::test]
    async fn test_user_input_pause_and_resume() {
        let h = harness(ScriptedInvoker::new());
        let wf = WorkflowDefinition::new(
            "wf",
            "Gated",
            vec![
                Step::new("gate", "Gate").requiring_user_input(),
                Step::new("after", "After"),
            ],
        );
        h.engine.register_workflow(wf).await.unwrap();
        let id = h
            .engine
            .start_execution(StartRequest::new("wf", "tester").with_mode(ExecutionMode::SemiAutomated))
            .await
            .unwrap();

        let paused = h.engine.wait(&id).await.unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert_eq!(paused.paused_steps, vec!["gate"]);
        assert_eq!(h.invoker.calls_for("gate"), 0);

        h.engine
            .resume_execution(&id, Some(json!("approved")))
            .await
            .unwrap();
        let done = h.engine.wait(&id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        let gate_call = &h.invoker.calls()[0];
        assert_eq!(gate_call.step_id, "gate");
        assert_eq!(gate_call.input["user_input"], json!("approved"));
    }

    #[tokio::test]
    async fn test_awaiting_step_holds_back_independent_steps() {
        let h = harness(ScriptedInvoker::new());
        let wf = WorkflowDefinition::new(
            "wf",
            "Two entries",
            vec![
                Step::new("gate", "Gate")
                    .with_position(1)
                    .requiring_user_input()
                    .with_default_next(DefaultNext::End),
                Step::new("other", "Other").with_position(2),
            ],
        );
        h.engine.register_workflow(wf).await.unwrap();
        let id = h
            .engine
            .start_execution(StartRequest::new("wf", "t").with_mode(ExecutionMode::SemiAutomated))
            .await
            .unwrap();

        let paused = h.engine.wait(&id).await.unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert_eq!(paused.paused_steps, vec!["gate"]);
        assert_eq!(h.invoker.calls_for("other"), 0);

        h.engine.resume_execution(&id, Some(json!("ok"))).await.unwrap();
        let done = h.engine.wait(&id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(h.invoker.calls_for("gate"), 1);
        assert_eq!(h.invoker.calls_for("other"), 1);
    }

    #[tokio::test]
    async fn test_pause_interrupts_deferred_retry() {
        let h = harness(ScriptedInvoker::new().with_sequence(
            "flaky",
            vec![Script::fail("upstream 503"), Script::reply("fine")],
        ));
        let wf = WorkflowDefinition::new(
            "wf",
            "Slow retry",
            vec![Step::new("flaky", "Flaky").with_retry(RetryPolicy::new(2, 10_000))],
        );
        h.engine.register_workflow(wf).await.unwrap();
        let id = h.engine.start_execution(StartRequest::new("wf", "t")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        h.engine.pause_execution(&id).await.unwrap();
        let paused = tokio::time::timeout(Duration::from_secs(2), h.engine.wait(&id))
            .await
            .expect("pause honored before the retry delay")
            .unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert_eq!(h.invoker.calls_for("flaky"), 1);

        h.engine.cancel_execution(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_between_batches() {
        let h = harness(ScriptedInvoker::new().with_step("a", Script::reply("slow").delay_ms(100)));
        h.engine.register_workflow(linear_workflow("wf", &["a", "b"])).await.unwrap();
        let id = h.engine.start_execution(StartRequest::new("wf", "t")).await.unwrap();

        h.engine.pause_execution(&id).await.unwrap();
        let paused = h.engine.wait(&id).await.unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert_eq!(h.invoker.calls_for("b"), 0);
        assert!(h.engine.resume_execution(&id, None).await.is_ok());

        let done = h.engine.wait(&id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(h.invoker.calls_for("b"), 1);
        assert!(h.engine.resume_execution(&id, None).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_stops_dispatch() {
        let h = harness(ScriptedInvoker::new().with_step("a", Script::reply("slow").delay_ms(100)));
        h.engine.register_workflow(linear_workflow("wf", &["a", "b"])).await.unwrap();
        let id = h.engine.start_execution(StartRequest::new("wf", "t")).await.unwrap();

        h.engine.cancel_execution(&id).await.unwrap();
        let progress = h.engine.wait(&id).await.unwrap();
        assert_eq!(progress.status, ExecutionStatus::Cancelled);
        assert_eq!(h.invoker.calls_for("b"), 0);
        assert!(matches!(
            h.engine.cancel_execution(&id).await,
            Err(ConductorError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_abort_strategy() {
        let h = harness(ScriptedInvoker::new().with_step("a", Script::fail("fatal")));
        let wf = linear_workflow("wf", &["a", "b"])
            .with_error_threshold(1)
            .with_error_strategy(ErrorStrategy {
                name: "stop".into(),
                trigger: ErrorTrigger::Always,
                action: ErrorAction::Abort,
            });
        let progress = run(&h, wf).await;
        assert_eq!(progress.status, ExecutionStatus::Failed);
        assert!(progress.error.unwrap().contains("aborted"));
        assert_eq!(h.invoker.calls_for("b"), 0);
    }

    #[tokio::test]
    async fn test_pause_strategy() {
        let h = harness(ScriptedInvoker::new().with_step("a", Script::fail("fatal")));
        let wf = WorkflowDefinition::new(
            "wf",
            "Halting",
            vec![
                Step::new("a", "A").with_edge(ConditionalEdge::new("status == 'failed'", "b", 1)),
                Step::new("b", "B"),
            ],
        )
        .with_error_threshold(1)
        .with_error_strategy(ErrorStrategy {
            name: "halt".into(),
            trigger: ErrorTrigger::StepFailed { step_id: "a".into() },
            action: ErrorAction::PauseAndNotify { message: Some("check a".into()) },
        });
        h.engine.register_workflow(wf).await.unwrap();
        let id = h.engine.start_execution(StartRequest::new("wf", "t")).await.unwrap();

        let paused = h.engine.wait(&id).await.unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert_eq!(h.invoker.calls_for("b"), 0);

        h.engine.resume_execution(&id, None).await.unwrap();
        let done = h.engine.wait(&id).await.unwrap();
        assert_eq!(h.invoker.calls_for("b"), 1);
        assert_eq!(done.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_success_criteria_fail_run() {
        let h = harness(ScriptedInvoker::new().with_default(Script::reply("ok").confidence(0.4)));
        let wf = linear_workflow("wf", &["a"]).with_success_criteria(SuccessCriteria {
            required_outputs: vec![],
            quality_metrics: vec![QualityThreshold {
                metric: QualityMetric::MeanConfidence,
                threshold: 0.7,
            }],
            validation_checks: vec![],
        });
        let progress = run(&h, wf).await;
        assert_eq!(progress.completed_steps, 1);
        assert_eq!(progress.status, ExecutionStatus::Failed);
        assert!(progress.error.unwrap().contains("Success criteria not met"));
    }

    #[tokio::test]
    async fn test_agent_override_by_position_and_shared_input() {
        let h = harness(ScriptedInvoker::new());
        h.engine.register_workflow(linear_workflow("wf", &["a", "b"])).await.unwrap();
        let request = StartRequest::new("wf", "t")
            .with_input(json!({"topic": "biologics"}))
            .with_agent_override("2", "analyst");
        h.engine.run_execution(request).await.unwrap();

        let calls = h.invoker.calls();
        assert_eq!(calls[0].agent_id.as_deref(), Some("lead"));
        assert_eq!(calls[1].agent_id.as_deref(), Some("analyst"));
        assert!(calls.iter().all(|c| c.input["topic"] == json!("biologics")));
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let h = harness(ScriptedInvoker::new());
        assert!(matches!(
            h.engine.start_execution(StartRequest::new("missing", "t")).await,
            Err(ConductorError::WorkflowNotFound(_))
        ));
        assert!(matches!(
            h.engine.get_progress(&ExecutionId::from_string("nope")).await,
            Err(ConductorError::ExecutionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_active_runs() {
        let h = harness(ScriptedInvoker::new().with_default(Script::reply("slow").delay_ms(50)));
        h.engine.register_workflow(linear_workflow("wf", &["a", "b", "c"])).await.unwrap();
        let id = h.engine.start_execution(StartRequest::new("wf", "t")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        h.engine.shutdown().await;
        assert!(h.engine.active_executions().await.is_empty());
        let progress = h.engine.get_progress(&id).await.unwrap();
        assert_eq!(progress.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_recover_closes_runs_of_a_previous_process() {
        let h = harness(ScriptedInvoker::new());
        let wf = WorkflowDefinition::new(
            "gated",
            "Gated",
            vec![
                Step::new("prep", "Prep").with_position(1),
                Step::new("gate", "Gate").with_position(2).requiring_user_input(),
            ],
        );
        h.engine.register_workflow(wf).await.unwrap();
        let id = h
            .engine
            .start_execution(StartRequest::new("gated", "t").with_mode(ExecutionMode::SemiAutomated))
            .await
            .unwrap();
        assert_eq!(h.engine.wait(&id).await.unwrap().status, ExecutionStatus::Paused);

        // The owning engine keeps its live run
        assert!(h.engine.recover_interrupted().await.unwrap().is_empty());

        // A fresh engine over the same store sees an orphan
        let restarted = WorkflowEngine::new(
            AppConfig::default(),
            EngineDeps {
                catalog: Arc::new(StaticCatalog::new(vec![])),
                metrics: Arc::new(InMemoryMetricsStore::new()),
                executions: h.executions.clone(),
                invoker: h.invoker.clone(),
                events: Arc::new(EventBus::default()),
            },
        );
        assert_eq!(restarted.recover_interrupted().await.unwrap(), vec![id.0.clone()]);

        let stored = h.executions.load_execution(&id.0).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Failed);
        assert_eq!(stored.progress.error.as_deref(), Some("interrupted while paused"));
        let statuses: Vec<StepStatus> =
            stored.progress.step_results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![StepStatus::Completed, StepStatus::UserInputRequired]
        );
        assert!(restarted.recover_interrupted().await.unwrap().is_empty());
    }
}

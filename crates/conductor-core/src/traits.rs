use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Agent catalog: the read-only pool of candidate workers.
pub trait AgentCatalog: Send + Sync + 'static {
    /// All agents that may currently be assigned work. Must exclude inactive agents.
    fn list_active_agents(&self) -> BoxFuture<'_, Result<Vec<AgentDescriptor>>>;

    /// Look up a single agent regardless of status.
    fn get_agent(&self, agent_id: &str) -> BoxFuture<'_, Result<Option<AgentDescriptor>>>;
}

/// Metrics store: performance telemetry and load bookkeeping.
pub trait MetricsStore: Send + Sync + 'static {
    /// Append a performance sample.
    fn record_performance(
        &self,
        agent_id: &str,
        step_id: &str,
        workflow_id: &str,
        metrics: &PerformanceMetrics,
    ) -> BoxFuture<'_, Result<()>>;

    /// Most recent samples for an (agent, workflow, step) triple, newest first.
    fn query_recent_performance(
        &self,
        agent_id: &str,
        workflow_id: &str,
        step_id: &str,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<PerformanceRecord>>>;

    /// Number of step executions currently running on the agent.
    fn query_active_load(&self, agent_id: &str) -> BoxFuture<'_, Result<u32>>;

    /// Success rate across all of the agent's samples since `since`.
    /// `None` when there are no samples in the window.
    fn success_rate_since(
        &self,
        agent_id: &str,
        since: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<f64>>>;

    /// Mark a dispatch as running on the agent.
    fn begin_execution(
        &self,
        agent_id: &str,
        execution_id: &str,
        step_id: &str,
    ) -> BoxFuture<'_, Result<()>>;

    /// Clear a running mark set by `begin_execution`.
    fn end_execution(
        &self,
        agent_id: &str,
        execution_id: &str,
        step_id: &str,
    ) -> BoxFuture<'_, Result<()>>;

    /// Write-once selection decision log.
    fn record_selection(&self, decision: &SelectionDecision) -> BoxFuture<'_, Result<()>>;
}

/// Execution store: durable mirror of run progress for recovery and polling.
pub trait ExecutionStore: Send + Sync + 'static {
    /// Upsert the latest status and snapshot of a run.
    fn persist_execution_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        progress: &ExecutionProgress,
    ) -> BoxFuture<'_, Result<()>>;

    /// Load the latest snapshot of a run.
    fn load_execution(&self, execution_id: &str) -> BoxFuture<'_, Result<Option<ExecutionRecord>>>;

    /// List runs, optionally filtered by status, most recently updated first.
    fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
    ) -> BoxFuture<'_, Result<Vec<ExecutionRecord>>>;
}

/// Worker invocation: abstracts the underlying LLM / agent call.
pub trait WorkerInvoker: Send + Sync + 'static {
    /// Run a step prompt on an agent, or on a bare model when `agent` is `None`.
    fn invoke<'a>(
        &'a self,
        agent: Option<&'a AgentDescriptor>,
        prompt: &'a str,
        context: &'a InvocationContext,
    ) -> BoxFuture<'a, Result<InvocationOutput>>;
}

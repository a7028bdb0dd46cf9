//! In-process implementations of the engine's collaborators.
//!
//! Useful for dry runs and tests; nothing here survives a restart.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use conductor_core::error::{ConductorError, Result};
use conductor_core::traits::{AgentCatalog, ExecutionStore, MetricsStore};
use conductor_core::types::*;

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock()
        .map_err(|e| ConductorError::Database(format!("lock poisoned: {}", e)))
}

/// Fixed agent pool, usually loaded from the `[[agents]]` config table.
pub struct StaticCatalog {
    agents: Vec<AgentDescriptor>,
}

impl StaticCatalog {
    pub fn new(agents: Vec<AgentDescriptor>) -> Self {
        Self { agents }
    }

    pub fn agents(&self) -> &[AgentDescriptor] {
        &self.agents
    }
}

impl AgentCatalog for StaticCatalog {
    fn list_active_agents(&self) -> BoxFuture<'_, Result<Vec<AgentDescriptor>>> {
        let active = self.agents.iter().filter(|a| a.is_active()).cloned().collect();
        Box::pin(async move { Ok(active) })
    }

    fn get_agent(&self, agent_id: &str) -> BoxFuture<'_, Result<Option<AgentDescriptor>>> {
        let agent = self.agents.iter().find(|a| a.id == agent_id).cloned();
        Box::pin(async move { Ok(agent) })
    }
}

/// Performance samples, running marks and selection decisions kept in memory.
#[derive(Default)]
pub struct InMemoryMetricsStore {
    records: Mutex<Vec<PerformanceRecord>>,
    running: Mutex<HashMap<String, HashSet<(String, String)>>>,
    selections: Mutex<Vec<SelectionDecision>>,
    fail_selection_log: bool,
}

impl InMemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `record_selection` fail, for exercising best-effort logging.
    pub fn failing_selection_log(mut self) -> Self {
        self.fail_selection_log = true;
        self
    }

    pub fn records(&self) -> Vec<PerformanceRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn selections(&self) -> Vec<SelectionDecision> {
        self.selections.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl MetricsStore for InMemoryMetricsStore {
    fn record_performance(
        &self,
        agent_id: &str,
        step_id: &str,
        workflow_id: &str,
        metrics: &PerformanceMetrics,
    ) -> BoxFuture<'_, Result<()>> {
        let record = PerformanceRecord {
            agent_id: agent_id.to_string(),
            workflow_id: workflow_id.to_string(),
            step_id: step_id.to_string(),
            metrics: metrics.clone(),
            recorded_at: Utc::now(),
        };
        Box::pin(async move {
            lock(&self.records)?.push(record);
            Ok(())
        })
    }

    fn query_recent_performance(
        &self,
        agent_id: &str,
        workflow_id: &str,
        step_id: &str,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<PerformanceRecord>>> {
        let (agent_id, workflow_id, step_id) =
            (agent_id.to_string(), workflow_id.to_string(), step_id.to_string());
        Box::pin(async move {
            let records = lock(&self.records)?;
            Ok(records
                .iter()
                .rev()
                .filter(|r| {
                    r.agent_id == agent_id && r.workflow_id == workflow_id && r.step_id == step_id
                })
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn query_active_load(&self, agent_id: &str) -> BoxFuture<'_, Result<u32>> {
        let agent_id = agent_id.to_string();
        Box::pin(async move {
            let running = lock(&self.running)?;
            Ok(running.get(&agent_id).map(|s| s.len() as u32).unwrap_or(0))
        })
    }

    fn success_rate_since(
        &self,
        agent_id: &str,
        since: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<f64>>> {
        let agent_id = agent_id.to_string();
        Box::pin(async move {
            let records = lock(&self.records)?;
            let window: Vec<&PerformanceRecord> = records
                .iter()
                .filter(|r| r.agent_id == agent_id && r.recorded_at >= since)
                .collect();
            if window.is_empty() {
                return Ok(None);
            }
            let successes = window.iter().filter(|r| r.metrics.success).count();
            Ok(Some(successes as f64 / window.len() as f64))
        })
    }

    fn begin_execution(
        &self,
        agent_id: &str,
        execution_id: &str,
        step_id: &str,
    ) -> BoxFuture<'_, Result<()>> {
        let key = (execution_id.to_string(), step_id.to_string());
        let agent_id = agent_id.to_string();
        Box::pin(async move {
            lock(&self.running)?.entry(agent_id).or_default().insert(key);
            Ok(())
        })
    }

    fn end_execution(
        &self,
        agent_id: &str,
        execution_id: &str,
        step_id: &str,
    ) -> BoxFuture<'_, Result<()>> {
        let key = (execution_id.to_string(), step_id.to_string());
        let agent_id = agent_id.to_string();
        Box::pin(async move {
            let mut running = lock(&self.running)?;
            if let Some(set) = running.get_mut(&agent_id) {
                set.remove(&key);
                if set.is_empty() {
                    running.remove(&agent_id);
                }
            }
            Ok(())
        })
    }

    fn record_selection(&self, decision: &SelectionDecision) -> BoxFuture<'_, Result<()>> {
        let decision = decision.clone();
        Box::pin(async move {
            if self.fail_selection_log {
                return Err(ConductorError::Database("selection log unavailable".into()));
            }
            lock(&self.selections)?.push(decision);
            Ok(())
        })
    }
}

/// Latest progress snapshot per execution.
#[derive(Default)]
pub struct InMemoryExecutionStore {
    rows: Mutex<HashMap<String, ExecutionRecord>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionStore for InMemoryExecutionStore {
    fn persist_execution_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        progress: &ExecutionProgress,
    ) -> BoxFuture<'_, Result<()>> {
        let record = ExecutionRecord {
            execution_id: execution_id.to_string(),
            status,
            progress: progress.clone(),
            updated_at: Utc::now(),
        };
        Box::pin(async move {
            lock(&self.rows)?.insert(record.execution_id.clone(), record);
            Ok(())
        })
    }

    fn load_execution(&self, execution_id: &str) -> BoxFuture<'_, Result<Option<ExecutionRecord>>> {
        let execution_id = execution_id.to_string();
        Box::pin(async move { Ok(lock(&self.rows)?.get(&execution_id).cloned()) })
    }

    fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
    ) -> BoxFuture<'_, Result<Vec<ExecutionRecord>>> {
        Box::pin(async move {
            let rows = lock(&self.rows)?;
            let mut records: Vec<ExecutionRecord> = rows
                .values()
                .filter(|r| status.map_or(true, |s| r.status == s))
                .cloned()
                .collect();
            records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            Ok(records)
        })
    }
}

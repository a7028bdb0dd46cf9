use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique execution (workflow run) identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::str::FromStr for ExecutionId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_string(s))
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether an agent may be assigned work.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Active,
    Inactive,
}

/// Coarse pricing bucket of an agent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CostClass {
    Low,
    #[default]
    Standard,
    High,
    Premium,
}

impl CostClass {
    /// Monetary weight of a single call, in dollars.
    pub fn cost_per_call(&self) -> f64 {
        match self {
            CostClass::Low => 0.01,
            CostClass::Standard => 0.05,
            CostClass::High => 0.15,
            CostClass::Premium => 0.50,
        }
    }

    /// The most expensive known class.
    pub fn max_cost_per_call() -> f64 {
        CostClass::Premium.cost_per_call()
    }
}

/// A worker that can execute workflow steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentDescriptor {
    /// Unique agent identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Seniority tier (1 = most senior).
    #[serde(default = "default_tier")]
    pub tier: u8,
    /// Declared capabilities (free-text tags).
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Domain specializations (e.g. "regulatory", "clinical").
    #[serde(default)]
    pub specializations: Vec<String>,
    #[serde(default)]
    pub cost_class: CostClass,
    #[serde(default)]
    pub status: AgentStatus,
    /// Tie-breaker for capability-based selection (higher wins).
    #[serde(default)]
    pub priority: i32,
}

fn default_tier() -> u8 {
    2
}

impl AgentDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tier: default_tier(),
            capabilities: vec![],
            specializations: vec![],
            cost_class: CostClass::default(),
            status: AgentStatus::Active,
            priority: 0,
        }
    }

    pub fn with_tier(mut self, tier: u8) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_capabilities<S: Into<String>>(mut self, caps: impl IntoIterator<Item = S>) -> Self {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_specializations<S: Into<String>>(
        mut self,
        specs: impl IntoIterator<Item = S>,
    ) -> Self {
        self.specializations = specs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cost_class(mut self, cost_class: CostClass) -> Self {
        self.cost_class = cost_class;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.status = AgentStatus::Inactive;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }
}

/// How much human involvement a run expects.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    #[default]
    Automated,
    SemiAutomated,
    Manual,
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "automated" | "auto" => Ok(ExecutionMode::Automated),
            "semi-automated" | "semi" => Ok(ExecutionMode::SemiAutomated),
            "manual" => Ok(ExecutionMode::Manual),
            other => Err(format!("unknown execution mode: {}", other)),
        }
    }
}

/// Terminal status of a single step invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    Skipped,
    UserInputRequired,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::UserInputRequired => "user_input_required",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of a non-primary member of a consensus set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsensusOutput {
    pub agent_id: String,
    pub output: serde_json::Value,
    #[serde(default)]
    pub confidence: Option<f64>,
    pub succeeded: bool,
}

/// The recorded outcome of one step attempt. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    /// Agent that produced the output (the primary agent for consensus steps).
    #[serde(default)]
    pub agent_id: Option<String>,
    /// 1-based attempt number.
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    pub duration_ms: u64,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub citations: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Step ids the worker recommends running next.
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub consensus: Vec<ConsensusOutput>,
    /// Whether another attempt could change the outcome.
    #[serde(default = "default_retryable")]
    pub retryable: bool,
    pub started_at: DateTime<Utc>,
}

fn default_attempt() -> u32 {
    1
}

fn default_retryable() -> bool {
    true
}

impl StepResult {
    /// Start building a result for the given step.
    pub fn new(step_id: impl Into<String>, status: StepStatus) -> Self {
        Self {
            step_id: step_id.into(),
            status,
            agent_id: None,
            attempt: 1,
            duration_ms: 0,
            output: serde_json::Value::Null,
            confidence: None,
            reasoning: None,
            citations: vec![],
            error: None,
            next_steps: vec![],
            consensus: vec![],
            retryable: true,
            started_at: Utc::now(),
        }
    }

    pub fn failed(step_id: impl Into<String>, error: impl Into<String>) -> Self {
        let mut result = Self::new(step_id, StepStatus::Failed);
        result.error = Some(error.into());
        result
    }

    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Completed
    }

    /// Output rendered as text (strings unquoted).
    pub fn output_text(&self) -> String {
        match &self.output {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Telemetry for one agent dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceMetrics {
    pub duration_ms: u64,
    pub success: bool,
    /// Quality in [0,1]; usually the reported confidence.
    pub quality_score: f64,
    pub error_count: u32,
    /// Optional user rating in [0,1].
    #[serde(default)]
    pub user_satisfaction: Option<f64>,
}

/// A stored performance sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceRecord {
    pub agent_id: String,
    pub workflow_id: String,
    pub step_id: String,
    pub metrics: PerformanceMetrics,
    pub recorded_at: DateTime<Utc>,
}

/// One scored alternative in a selection decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateScore {
    pub agent_id: String,
    pub score: f64,
}

/// Write-once log of why an agent was chosen for a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectionDecision {
    pub execution_id: Option<String>,
    pub workflow_id: String,
    pub step_id: String,
    pub chosen_agents: Vec<String>,
    pub candidates: Vec<CandidateScore>,
    pub strategy: String,
    pub timestamp: DateTime<Utc>,
}

/// Context passed to the worker invocation collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationContext {
    pub execution_id: String,
    pub workflow_id: String,
    pub step_id: String,
    pub caller_id: String,
    pub attempt: u32,
    #[serde(default)]
    pub input: serde_json::Value,
}

/// What a worker returns for a step prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InvocationOutput {
    pub content: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub citations: Vec<String>,
    /// Set when the worker cannot proceed without user input; holds the question.
    #[serde(default)]
    pub needs_input: Option<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
}

impl InvocationOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// Lifecycle state of a whole run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(ExecutionStatus::Running),
            "paused" => Some(ExecutionStatus::Paused),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            "cancelled" => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-agent aggregate over one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentUtilization {
    pub steps: u32,
    pub successes: u32,
    pub total_duration_ms: u64,
}

/// A step that ran longer than the bottleneck threshold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bottleneck {
    pub step_id: String,
    pub agent_id: Option<String>,
    pub duration_ms: u64,
}

/// Run-level analytics snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AnalyticsSummary {
    pub total_duration_ms: u64,
    pub steps_recorded: u32,
    pub steps_succeeded: u32,
    pub agent_utilization: HashMap<String, AgentUtilization>,
    pub bottlenecks: Vec<Bottleneck>,
}

/// Snapshot of a run, returned to callers and mirrored to the execution store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionProgress {
    pub execution_id: String,
    pub workflow_id: String,
    pub caller_id: String,
    pub mode: ExecutionMode,
    pub status: ExecutionStatus,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub paused_steps: Vec<String>,
    #[serde(default)]
    pub step_results: Vec<StepResult>,
    pub error_count: u32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub analytics: AnalyticsSummary,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionProgress {
    /// Fraction of steps in a terminal state.
    pub fn percent_complete(&self) -> f64 {
        if self.total_steps == 0 {
            return 100.0;
        }
        ((self.completed_steps + self.failed_steps) as f64 / self.total_steps as f64) * 100.0
    }

    /// Latest recorded result for a step, if any.
    pub fn result_for(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.iter().rev().find(|r| r.step_id == step_id)
    }
}

/// A persisted execution row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub progress: ExecutionProgress,
    pub updated_at: DateTime<Utc>,
}

/// Events emitted by the engine during execution.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    RunStarted {
        execution_id: ExecutionId,
        workflow_id: String,
    },
    StepStarted {
        execution_id: ExecutionId,
        step_id: String,
        attempt: u32,
    },
    AgentSelected {
        execution_id: ExecutionId,
        step_id: String,
        agent_id: String,
        strategy: String,
    },
    StepFinished {
        execution_id: ExecutionId,
        step_id: String,
        status: StepStatus,
        duration_ms: u64,
    },
    StepRetryScheduled {
        execution_id: ExecutionId,
        step_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    UserInputRequired {
        execution_id: ExecutionId,
        step_id: String,
        prompt: Option<String>,
    },
    ErrorStrategyTriggered {
        execution_id: ExecutionId,
        strategy: String,
        error_count: u32,
    },
    RunPaused {
        execution_id: ExecutionId,
        reason: String,
    },
    RunComplete {
        execution_id: ExecutionId,
        status: ExecutionStatus,
        total_duration_ms: u64,
    },
    RunError {
        execution_id: ExecutionId,
        error: String,
    },
}

impl EngineEvent {
    pub fn execution_id(&self) -> &ExecutionId {
        match self {
            EngineEvent::RunStarted { execution_id, .. }
            | EngineEvent::StepStarted { execution_id, .. }
            | EngineEvent::AgentSelected { execution_id, .. }
            | EngineEvent::StepFinished { execution_id, .. }
            | EngineEvent::StepRetryScheduled { execution_id, .. }
            | EngineEvent::UserInputRequired { execution_id, .. }
            | EngineEvent::ErrorStrategyTriggered { execution_id, .. }
            | EngineEvent::RunPaused { execution_id, .. }
            | EngineEvent::RunComplete { execution_id, .. }
            | EngineEvent::RunError { execution_id, .. } => execution_id,
        }
    }
}

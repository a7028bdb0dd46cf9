use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConductorError, Result};

/// An immutable graph of steps plus workflow-level policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<Step>,
    /// Global error count at which error strategies fire.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    #[serde(default)]
    pub error_strategies: Vec<ErrorStrategy>,
    #[serde(default)]
    pub success_criteria: Option<SuccessCriteria>,
}

fn default_error_threshold() -> u32 {
    3
}

/// A unit of work in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    /// Ordinal position; ties fall back to declaration order.
    #[serde(default)]
    pub position: u32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Prompt template; `{{input}}` and `{{input.key}}` are substituted.
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Explicit default agent for this step.
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub parallel: bool,
    /// Conditional edges, evaluated in ascending priority.
    #[serde(default)]
    pub conditional_next: Vec<ConditionalEdge>,
    #[serde(default)]
    pub default_next: DefaultNext,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub validation: Vec<ValidationRule>,
    #[serde(default)]
    pub output_schema: Option<OutputSchema>,
    #[serde(default)]
    pub selection: SelectionStrategy,
    /// Pause for user input before dispatch in manual / semi-automated runs.
    #[serde(default)]
    pub requires_user_input: bool,
    /// Validation failures skip the step instead of failing it.
    #[serde(default)]
    pub optional: bool,
}

impl Step {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            position: 0,
            name: name.into(),
            description: String::new(),
            prompt: None,
            required_capabilities: vec![],
            agent_id: None,
            parallel: false,
            conditional_next: vec![],
            default_next: DefaultNext::Sequential,
            retry: None,
            timeout_secs: None,
            validation: vec![],
            output_schema: None,
            selection: SelectionStrategy::Automatic,
            requires_user_input: false,
            optional: false,
        }
    }

    pub fn with_position(mut self, position: u32) -> Self {
        self.position = position;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_capabilities<S: Into<String>>(mut self, caps: impl IntoIterator<Item = S>) -> Self {
        self.required_capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn with_edge(mut self, edge: ConditionalEdge) -> Self {
        self.conditional_next.push(edge);
        self
    }

    pub fn with_default_next(mut self, next: DefaultNext) -> Self {
        self.default_next = next;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_validation(mut self, rule: ValidationRule) -> Self {
        self.validation.push(rule);
        self
    }

    pub fn with_output_schema(mut self, schema: OutputSchema) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_selection(mut self, strategy: SelectionStrategy) -> Self {
        self.selection = strategy;
        self
    }

    pub fn requiring_user_input(mut self) -> Self {
        self.requires_user_input = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Maximum number of retries allowed after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.retry.as_ref().map(|r| r.max_retries).unwrap_or(0)
    }

    /// Conditional edges sorted by ascending priority (stable).
    pub fn edges_by_priority(&self) -> Vec<&ConditionalEdge> {
        let mut edges: Vec<&ConditionalEdge> = self.conditional_next.iter().collect();
        edges.sort_by_key(|e| e.priority);
        edges
    }
}

/// A rule mapping a finished step's result to its successor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalEdge {
    /// Boolean expression over the step result and run history.
    pub condition: String,
    pub target: String,
    /// Lower values are evaluated first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub transform: Option<DataTransform>,
}

impl ConditionalEdge {
    pub fn new(condition: impl Into<String>, target: impl Into<String>, priority: i32) -> Self {
        Self {
            condition: condition.into(),
            target: target.into(),
            priority,
            transform: None,
        }
    }

    pub fn with_transform(mut self, transform: DataTransform) -> Self {
        self.transform = Some(transform);
        self
    }
}

/// Where a step goes when no conditional edge matches.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DefaultNext {
    /// The next ordinal step (or parallel group).
    #[default]
    Sequential,
    Step { id: String },
    End,
}

/// Reshapes a step's output before it becomes the target's input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataTransform {
    /// Keep only the listed keys of an object output.
    Pick { keys: Vec<String> },
    /// Rename one key of an object output.
    Rename { from: String, to: String },
    /// Wrap the whole output under a key.
    Wrap { key: String },
    /// Take a dotted sub-path of the output.
    Extract { path: String },
    /// Merge a static object into the output.
    Merge { value: serde_json::Value },
}

/// Per-step retry bound and delay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_retry_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    30_000
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay_ms: u64) -> Self {
        Self {
            max_retries,
            delay_ms,
            backoff: Backoff::Fixed,
            max_delay_ms: default_max_delay(),
        }
    }

    pub fn exponential(mut self) -> Self {
        self.backoff = Backoff::Exponential;
        self
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let ms = match self.backoff {
            Backoff::Fixed => self.delay_ms,
            Backoff::Exponential => {
                let exp = retry.saturating_sub(1).min(20);
                self.delay_ms.saturating_mul(2u64.pow(exp))
            }
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

/// A check applied to a step's input before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ValidationRule {
    Required { field: String },
    Pattern { field: String, pattern: String },
    MinLength { field: String, min: usize },
    MaxLength { field: String, max: usize },
    Range {
        field: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    OneOf { field: String, values: Vec<serde_json::Value> },
}

/// Shape the step output must have to count as completed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OutputSchema {
    /// Keys that must be present in an object output.
    #[serde(default)]
    pub required_keys: Vec<String>,
}

/// How an agent is chosen for a step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum SelectionStrategy {
    Manual {
        #[serde(default)]
        preferred_agent_id: Option<String>,
    },
    #[default]
    Automatic,
    Consensus {
        #[serde(default = "default_consensus_count")]
        count: usize,
        #[serde(default)]
        mode: ConsensusMode,
    },
    CapabilityBased,
    LoadBalanced,
    Fallback {
        #[serde(default)]
        agents: Vec<String>,
    },
}

fn default_consensus_count() -> usize {
    3
}

impl SelectionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            SelectionStrategy::Manual { .. } => "manual",
            SelectionStrategy::Automatic => "automatic",
            SelectionStrategy::Consensus { .. } => "consensus",
            SelectionStrategy::CapabilityBased => "capability_based",
            SelectionStrategy::LoadBalanced => "load_balanced",
            SelectionStrategy::Fallback { .. } => "fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusMode {
    #[default]
    TopScored,
    Diverse,
    Tiered,
}

/// A workflow-level reaction to accumulated failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorStrategy {
    pub name: String,
    #[serde(default)]
    pub trigger: ErrorTrigger,
    pub action: ErrorAction,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorTrigger {
    #[default]
    Always,
    ErrorCountAtLeast { count: u32 },
    StepFailed { step_id: String },
    ErrorContains { pattern: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorAction {
    PauseAndNotify {
        #[serde(default)]
        message: Option<String>,
    },
    RetryWithBackoff {
        #[serde(default = "default_strategy_attempts")]
        max_attempts: u32,
        #[serde(default = "default_retry_delay")]
        initial_delay_ms: u64,
    },
    Abort,
    Continue,
}

fn default_strategy_attempts() -> u32 {
    1
}

impl ErrorAction {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorAction::PauseAndNotify { .. } => "pause_and_notify",
            ErrorAction::RetryWithBackoff { .. } => "retry_with_backoff",
            ErrorAction::Abort => "abort",
            ErrorAction::Continue => "continue",
        }
    }
}

/// What must hold at run end for the run to count as successful.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SuccessCriteria {
    /// Keys that must appear in at least one completed step's output.
    #[serde(default)]
    pub required_outputs: Vec<String>,
    #[serde(default)]
    pub quality_metrics: Vec<QualityThreshold>,
    #[serde(default)]
    pub validation_checks: Vec<ValidationCheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityThreshold {
    pub metric: QualityMetric,
    pub threshold: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QualityMetric {
    MeanConfidence,
    MinConfidence,
    CompletionRate,
}

/// An expression that must evaluate truthy against a step's final result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationCheck {
    pub name: String,
    /// Step to check; the last recorded result when absent.
    #[serde(default)]
    pub step_id: Option<String>,
    pub expression: String,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            steps,
            error_threshold: default_error_threshold(),
            error_strategies: vec![],
            success_criteria: None,
        }
    }

    pub fn with_error_threshold(mut self, threshold: u32) -> Self {
        self.error_threshold = threshold;
        self
    }

    pub fn with_error_strategy(mut self, strategy: ErrorStrategy) -> Self {
        self.error_strategies.push(strategy);
        self
    }

    pub fn with_success_criteria(mut self, criteria: SuccessCriteria) -> Self {
        self.success_criteria = Some(criteria);
        self
    }

    /// Load a workflow from a `.toml` or `.json` file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let workflow = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => Self::from_toml(&content)?,
        };
        Ok(workflow)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ConductorError::InvalidWorkflow(e.to_string()))
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Steps sorted by position, then declaration order.
    pub fn ordered_steps(&self) -> Vec<&Step> {
        let mut indexed: Vec<(usize, &Step)> = self.steps.iter().enumerate().collect();
        indexed.sort_by_key(|(i, s)| (s.position, *i));
        indexed.into_iter().map(|(_, s)| s).collect()
    }

    /// Check ids are unique and every referenced step exists.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(ConductorError::InvalidWorkflow(format!(
                "workflow '{}' has no steps",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(ConductorError::InvalidWorkflow(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }

        for step in &self.steps {
            for edge in &step.conditional_next {
                if !seen.contains(edge.target.as_str()) {
                    return Err(ConductorError::InvalidWorkflow(format!(
                        "step '{}' routes to unknown step '{}'",
                        step.id, edge.target
                    )));
                }
            }
            if let DefaultNext::Step { id } = &step.default_next {
                if !seen.contains(id.as_str()) {
                    return Err(ConductorError::InvalidWorkflow(format!(
                        "step '{}' defaults to unknown step '{}'",
                        step.id, id
                    )));
                }
            }
        }

        if self.entry_steps().is_empty() {
            return Err(ConductorError::InvalidWorkflow(format!(
                "workflow '{}' has no entry step",
                self.id
            )));
        }
        Ok(())
    }

    /// Ids of the contiguous parallel group containing `step_id`
    /// (just the step itself when it is not parallel).
    pub fn group_of(&self, step_id: &str) -> Vec<String> {
        let ordered = self.ordered_steps();
        let Some(idx) = ordered.iter().position(|s| s.id == step_id) else {
            return vec![];
        };
        if !ordered[idx].parallel {
            return vec![ordered[idx].id.clone()];
        }

        let mut start = idx;
        while start > 0 && ordered[start - 1].parallel {
            start -= 1;
        }
        let mut end = idx;
        while end + 1 < ordered.len() && ordered[end + 1].parallel {
            end += 1;
        }
        ordered[start..=end].iter().map(|s| s.id.clone()).collect()
    }

    /// Steps queued when `step_id` falls through to its default successor.
    pub fn default_successors(&self, step_id: &str) -> Vec<String> {
        let Some(step) = self.step(step_id) else {
            return vec![];
        };
        match &step.default_next {
            DefaultNext::End => vec![],
            DefaultNext::Step { id } => vec![id.clone()],
            DefaultNext::Sequential => {
                let ordered = self.ordered_steps();
                let group = self.group_of(step_id);
                let last = ordered
                    .iter()
                    .rposition(|s| group.contains(&s.id))
                    .unwrap_or(0);
                match ordered.get(last + 1) {
                    Some(next) => self.group_of(&next.id),
                    None => vec![],
                }
            }
        }
    }

    /// Steps that no conditional edge or default successor leads to.
    pub fn entry_steps(&self) -> Vec<String> {
        let mut targets: HashSet<String> = HashSet::new();
        for step in &self.steps {
            for edge in &step.conditional_next {
                targets.insert(edge.target.clone());
            }
            for next in self.default_successors(&step.id) {
                targets.insert(next);
            }
        }
        self.ordered_steps()
            .into_iter()
            .filter(|s| !targets.contains(&s.id))
            .map(|s| s.id.clone())
            .collect()
    }
}

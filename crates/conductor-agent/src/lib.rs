//! Workflow execution core: scores and selects agents, runs steps, and
//! drives each workflow run from its entry steps to a final status.

pub mod analytics;
pub mod cache;
pub mod capability;
pub mod engine;
pub mod executor;
pub mod graph;
pub mod scorer;
pub mod selector;
pub mod stores;
pub mod validation;

pub use analytics::{validate_success_criteria, AnalyticsTracker, ErrorStrategyTracker};
pub use capability::CapabilityMatcher;
pub use engine::{EngineDeps, StartRequest, WorkflowEngine};
pub use executor::{StepExecutor, StepRequest};
pub use graph::{ConditionalRouter, HandoffContext, RouteDecision, WorkflowStateMachine};
pub use scorer::{AgentScorer, ScoreBreakdown};
pub use selector::{AgentSelector, Selection, SelectionScope};
pub use stores::{InMemoryExecutionStore, InMemoryMetricsStore, StaticCatalog};

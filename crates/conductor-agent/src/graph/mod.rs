//! Workflow graph runtime: per-run step states, conditional routing, and
//! the data handed from one step to the next.
//!
//! The state machine decides what may run; the router decides where a
//! settled step leads. Conditions are parsed into an AST and evaluated
//! against the step result and run history, never executed.

pub mod condition;
pub mod handoff;
pub mod router;
pub mod state;

pub use condition::{evaluate_condition, Condition, FieldResolver};
pub use handoff::{apply_transform, build_prompt, parse_output, HandoffContext};
pub use router::{ConditionalRouter, ResultScope, RouteDecision};
pub use state::{Batch, StepState, Transition, WorkflowStateMachine};

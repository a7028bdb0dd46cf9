use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use conductor_core::error::{ConductorError, Result};
use conductor_core::types::{StepResult, StepStatus};
use conductor_core::workflow::{DefaultNext, WorkflowDefinition};

use super::handoff::HandoffContext;
use super::router::RouteDecision;

/// Lifecycle of one step inside a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    /// Not reached yet.
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Skipped,
    /// Waiting for user input.
    Paused,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepState::Completed | StepState::Failed | StepState::Skipped)
    }
}

/// Steps dispatched together.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub parallel: bool,
    pub steps: Vec<String>,
}

/// What applying a result did to the step.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Settled(StepStatus),
    RetryScheduled { attempt: u32, delay: Duration },
    AwaitingInput,
}

#[derive(Debug, Clone)]
struct StepSlot {
    state: StepState,
    attempts: u32,
    retries_used: u32,
    not_before: Option<Instant>,
    input: HandoffContext,
    /// Output waiting for the rest of the parallel group before fan-in.
    fan_in: Option<Value>,
}

impl StepSlot {
    fn new() -> Self {
        Self {
            state: StepState::Pending,
            attempts: 0,
            retries_used: 0,
            not_before: None,
            input: HandoffContext::new(),
            fan_in: None,
        }
    }
}

/// Tracks which steps of one run are queued, running, paused, or settled.
///
/// Owned by exactly one run loop. A settled step is never overwritten except
/// through a retry, which first increments the step's bounded retry counter.
pub struct WorkflowStateMachine {
    workflow: Arc<WorkflowDefinition>,
    order: Vec<String>,
    slots: HashMap<String, StepSlot>,
    fanned_in: HashSet<String>,
}

impl WorkflowStateMachine {
    /// Build the machine with every entry step queued.
    pub fn new(workflow: Arc<WorkflowDefinition>) -> Self {
        let order: Vec<String> = workflow.ordered_steps().iter().map(|s| s.id.clone()).collect();
        let slots = order.iter().map(|id| (id.clone(), StepSlot::new())).collect();
        let mut machine = Self {
            workflow,
            order,
            slots,
            fanned_in: HashSet::new(),
        };
        for id in machine.workflow.entry_steps() {
            machine.queue(&id, Value::Null);
        }
        machine
    }

    pub fn workflow(&self) -> &Arc<WorkflowDefinition> {
        &self.workflow
    }

    pub fn state_of(&self, step_id: &str) -> Option<StepState> {
        self.slots.get(step_id).map(|s| s.state)
    }

    /// Queued steps whose retry delay has elapsed, in declaration order.
    pub fn next_executable_steps(&self, now: Instant) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                self.slots.get(*id).is_some_and(|slot| {
                    slot.state == StepState::Queued && slot.not_before.map_or(true, |t| t <= now)
                })
            })
            .cloned()
            .collect()
    }

    /// Ready steps split into one parallel batch and sequential singletons.
    pub fn next_batches(&self, now: Instant) -> Vec<Batch> {
        let ready = self.next_executable_steps(now);
        let (parallel, sequential): (Vec<String>, Vec<String>) = ready.into_iter().partition(|id| {
            self.workflow.step(id).is_some_and(|s| s.parallel)
        });

        let mut batches = Vec::new();
        if !parallel.is_empty() {
            batches.push(Batch {
                parallel: true,
                steps: parallel,
            });
        }
        batches.extend(sequential.into_iter().map(|id| Batch {
            parallel: false,
            steps: vec![id],
        }));
        batches
    }

    /// Earliest time a deferred retry becomes ready.
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.slots
            .values()
            .filter(|s| s.state == StepState::Queued)
            .filter_map(|s| s.not_before)
            .min()
    }

    /// Move a queued step to running. Returns the 1-based attempt number.
    pub fn mark_running(&mut self, step_id: &str) -> u32 {
        match self.slots.get_mut(step_id) {
            Some(slot) => {
                slot.state = StepState::Running;
                slot.not_before = None;
                slot.attempts += 1;
                slot.attempts
            }
            None => 0,
        }
    }

    pub fn input_for(&self, step_id: &str) -> HandoffContext {
        self.slots
            .get(step_id)
            .map(|s| s.input.clone())
            .unwrap_or_default()
    }

    /// Record the outcome of a running step.
    pub fn apply_result(&mut self, result: &StepResult, now: Instant) -> Transition {
        let max_retries = self
            .workflow
            .step(&result.step_id)
            .map(|s| s.max_retries())
            .unwrap_or(0);
        let policy = self.workflow.step(&result.step_id).and_then(|s| s.retry.clone());

        let Some(slot) = self.slots.get_mut(&result.step_id) else {
            warn!(step = %result.step_id, "Result for unknown step ignored");
            return Transition::Settled(result.status);
        };

        match result.status {
            StepStatus::Completed => {
                slot.state = StepState::Completed;
                Transition::Settled(StepStatus::Completed)
            }
            StepStatus::Skipped => {
                slot.state = StepState::Skipped;
                Transition::Settled(StepStatus::Skipped)
            }
            StepStatus::UserInputRequired => {
                slot.state = StepState::Paused;
                Transition::AwaitingInput
            }
            StepStatus::Failed => {
                if result.retryable && slot.retries_used < max_retries {
                    slot.retries_used += 1;
                    let delay = policy
                        .map(|p| jittered(p.delay_for(slot.retries_used)))
                        .unwrap_or_default();
                    slot.state = StepState::Queued;
                    slot.not_before = Some(now + delay);
                    debug!(
                        step = %result.step_id,
                        retry = slot.retries_used,
                        max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Step retry scheduled"
                    );
                    Transition::RetryScheduled {
                        attempt: slot.attempts + 1,
                        delay,
                    }
                } else {
                    slot.state = StepState::Failed;
                    Transition::Settled(StepStatus::Failed)
                }
            }
        }
    }

    /// Queue successors chosen by the router for a settled step.
    pub fn apply_route(&mut self, step_id: &str, decision: RouteDecision) {
        match decision {
            RouteDecision::Edge { target, input, .. } => {
                self.queue(&target, input);
            }
            RouteDecision::Stop => {}
            RouteDecision::Default { input } => {
                let fans_in = self
                    .workflow
                    .step(step_id)
                    .is_some_and(|s| s.default_next == DefaultNext::Sequential)
                    && self.workflow.group_of(step_id).len() > 1;
                if fans_in {
                    if let Some(slot) = self.slots.get_mut(step_id) {
                        slot.fan_in = Some(input);
                    }
                } else {
                    for next in self.workflow.default_successors(step_id) {
                        self.queue(&next, input.clone());
                    }
                }
            }
        }
        self.try_fan_in(step_id);
    }

    /// Queue the group successor once every reached member of the parallel
    /// group has settled and at least one fell through to its default.
    fn try_fan_in(&mut self, step_id: &str) {
        let group = self.workflow.group_of(step_id);
        if group.len() <= 1 || self.fanned_in.contains(&group[0]) {
            return;
        }

        let reached: Vec<&String> = group
            .iter()
            .filter(|id| self.state_of(id).is_some_and(|s| s != StepState::Pending))
            .collect();
        if reached
            .iter()
            .any(|id| self.state_of(id).is_some_and(|s| !s.is_terminal()))
        {
            return;
        }

        let mut merged = Map::new();
        let mut source: Option<String> = None;
        for id in &reached {
            if let Some(output) = self.slots.get(*id).and_then(|s| s.fan_in.clone()) {
                merged.insert((*id).clone(), output);
                source.get_or_insert_with(|| (*id).clone());
            }
        }
        let Some(source) = source else {
            return;
        };

        self.fanned_in.insert(group[0].clone());
        let successors = self.workflow.default_successors(&source);
        debug!(group = ?group, successors = ?successors, "Parallel group joined");
        for next in successors {
            self.queue(&next, Value::Object(merged.clone()));
        }
    }

    /// Queue a step with handed-off input. Settled steps are left untouched.
    pub fn queue(&mut self, step_id: &str, input: Value) -> bool {
        let Some(slot) = self.slots.get_mut(step_id) else {
            warn!(step = %step_id, "Cannot queue unknown step");
            return false;
        };
        match slot.state {
            StepState::Completed | StepState::Failed | StepState::Skipped => {
                warn!(step = %step_id, state = ?slot.state, "Ignoring queue request for settled step");
                false
            }
            StepState::Running => {
                slot.input.absorb(input);
                false
            }
            StepState::Queued | StepState::Paused => {
                slot.input.absorb(input);
                true
            }
            StepState::Pending => {
                slot.state = StepState::Queued;
                slot.input.absorb(input);
                true
            }
        }
    }

    /// Re-queue a paused step, attaching the user's input.
    pub fn resume(&mut self, step_id: &str, user_input: Option<Value>) -> Result<()> {
        let slot = self
            .slots
            .get_mut(step_id)
            .ok_or_else(|| ConductorError::StepExecution {
                step: step_id.to_string(),
                message: "unknown step".into(),
            })?;
        if slot.state != StepState::Paused {
            return Err(ConductorError::StepExecution {
                step: step_id.to_string(),
                message: format!("step is {:?}, not paused", slot.state),
            });
        }
        slot.input.set_user_input(user_input.unwrap_or(Value::Null));
        slot.state = StepState::Queued;
        Ok(())
    }

    /// Re-queue a failed step on behalf of an error strategy.
    pub fn force_retry(&mut self, step_id: &str, delay: Duration, now: Instant) -> bool {
        match self.slots.get_mut(step_id) {
            Some(slot) if slot.state == StepState::Failed => {
                slot.retries_used += 1;
                slot.state = StepState::Queued;
                slot.not_before = Some(now + delay);
                true
            }
            _ => false,
        }
    }

    pub fn paused_steps(&self) -> Vec<String> {
        self.ids_in(StepState::Paused)
    }

    pub fn failed_steps(&self) -> Vec<String> {
        self.ids_in(StepState::Failed)
    }

    pub fn queued_steps(&self) -> Vec<String> {
        self.ids_in(StepState::Queued)
    }

    pub fn count(&self, state: StepState) -> usize {
        self.slots.values().filter(|s| s.state == state).count()
    }

    pub fn total_steps(&self) -> usize {
        self.order.len()
    }

    /// Nothing queued (including deferred), running, or paused.
    pub fn is_complete(&self) -> bool {
        !self.slots.values().any(|s| {
            matches!(
                s.state,
                StepState::Queued | StepState::Running | StepState::Paused
            )
        })
    }

    fn ids_in(&self, state: StepState) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.state_of(id) == Some(state))
            .cloned()
            .collect()
    }
}

/// Spread a delay by 0.8x to 1.2x.
fn jittered(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((delay.as_millis() as f64 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::workflow::{ConditionalEdge, RetryPolicy, Step};
    use serde_json::json;

    fn machine(steps: Vec<Step>) -> WorkflowStateMachine {
        WorkflowStateMachine::new(Arc::new(WorkflowDefinition::new("wf", "Test", steps)))
    }

    fn done(step_id: &str, output: Value) -> StepResult {
        let mut r = StepResult::new(step_id, StepStatus::Completed);
        r.output = output;
        r
    }

    #[test]
    fn test_linear_progression() {
        let mut m = machine(vec![Step::new("a", "A"), Step::new("b", "B")]);
        let now = Instant::now();
        assert_eq!(
            m.next_batches(now),
            vec![Batch { parallel: false, steps: vec!["a".into()] }]
        );

        assert_eq!(m.mark_running("a"), 1);
        let result = done("a", json!({"k": "v"}));
        assert_eq!(m.apply_result(&result, now), Transition::Settled(StepStatus::Completed));
        m.apply_route("a", RouteDecision::Default { input: json!({"k": "v"}) });

        assert_eq!(m.next_executable_steps(now), vec!["b"]);
        assert_eq!(m.input_for("b").get_str("k"), Some("v"));
        assert!(!m.is_complete());

        m.mark_running("b");
        m.apply_result(&done("b", Value::Null), now);
        m.apply_route("b", RouteDecision::Default { input: Value::Null });
        assert!(m.is_complete());
        assert_eq!(m.count(StepState::Completed), 2);
    }

    #[test]
    fn test_parallel_batch_and_fan_in() {
        let mut m = machine(vec![
            Step::new("p1", "P1").parallel(),
            Step::new("p2", "P2").parallel(),
            Step::new("merge", "Merge"),
        ]);
        let now = Instant::now();
        let batches = m.next_batches(now);
        assert_eq!(batches.len(), 1);
        assert!(batches[0].parallel);
        assert_eq!(batches[0].steps, vec!["p1", "p2"]);

        m.mark_running("p1");
        m.mark_running("p2");

        m.apply_result(&done("p1", json!("one")), now);
        m.apply_route("p1", RouteDecision::Default { input: json!("one") });
        assert_eq!(m.state_of("merge"), Some(StepState::Pending));

        m.apply_result(&StepResult::failed("p2", "boom"), now);
        m.apply_route("p2", RouteDecision::Stop);
        assert_eq!(m.state_of("merge"), Some(StepState::Queued));
        assert_eq!(m.input_for("merge").get("p1"), Some(&json!("one")));
    }

    #[test]
    fn test_retry_defers_only_failing_step() {
        let mut m = machine(vec![
            Step::new("flaky", "Flaky")
                .parallel()
                .with_retry(RetryPolicy::new(2, 60_000)),
            Step::new("steady", "Steady").parallel(),
        ]);
        let now = Instant::now();
        m.mark_running("flaky");

        let transition = m.apply_result(&StepResult::failed("flaky", "err"), now);
        assert!(matches!(transition, Transition::RetryScheduled { attempt: 2, .. }));
        assert_eq!(m.state_of("flaky"), Some(StepState::Queued));
        assert_eq!(m.next_executable_steps(now), vec!["steady"]);
        assert!(m.next_wakeup().is_some());
        assert!(!m.is_complete());
    }

    #[test]
    fn test_retry_bound() {
        let mut m = machine(vec![Step::new("s", "S").with_retry(RetryPolicy::new(2, 0))]);
        let now = Instant::now();
        let mut attempts;
        loop {
            assert_eq!(m.next_executable_steps(now), vec!["s"]);
            attempts = m.mark_running("s");
            match m.apply_result(&StepResult::failed("s", "err"), now) {
                Transition::RetryScheduled { .. } => continue,
                Transition::Settled(status) => {
                    assert_eq!(status, StepStatus::Failed);
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(attempts, 3);
        assert_eq!(m.state_of("s"), Some(StepState::Failed));
    }

    #[test]
    fn test_non_retryable_failure_settles() {
        let mut m = machine(vec![Step::new("s", "S").with_retry(RetryPolicy::new(3, 0))]);
        m.mark_running("s");
        let mut failed = StepResult::failed("s", "bad input");
        failed.retryable = false;
        assert_eq!(
            m.apply_result(&failed, Instant::now()),
            Transition::Settled(StepStatus::Failed)
        );
    }

    #[test]
    fn test_settled_step_not_requeued() {
        let mut m = machine(vec![
            Step::new("a", "A").with_edge(ConditionalEdge::new("true", "b", 1)),
            Step::new("b", "B"),
        ]);
        let now = Instant::now();
        assert_eq!(m.next_executable_steps(now), vec!["a"]);
        m.mark_running("a");
        m.apply_result(&done("a", Value::Null), now);
        assert!(!m.queue("a", Value::Null));
        assert_eq!(m.state_of("a"), Some(StepState::Completed));
    }

    #[test]
    fn test_pause_and_resume() {
        let mut m = machine(vec![Step::new("ask", "Ask")]);
        let now = Instant::now();
        m.mark_running("ask");
        let paused = StepResult::new("ask", StepStatus::UserInputRequired);
        assert_eq!(m.apply_result(&paused, now), Transition::AwaitingInput);
        assert_eq!(m.paused_steps(), vec!["ask"]);
        assert!(!m.is_complete());
        assert!(m.next_executable_steps(now).is_empty());

        m.resume("ask", Some(json!("yes"))).unwrap();
        assert!(m.input_for("ask").has_user_input());
        assert_eq!(m.next_executable_steps(now), vec!["ask"]);
        assert!(m.resume("ask", None).is_err());
    }

    #[test]
    fn test_force_retry_only_failed() {
        let mut m = machine(vec![Step::new("s", "S")]);
        let now = Instant::now();
        assert!(!m.force_retry("s", Duration::ZERO, now));
        m.mark_running("s");
        m.apply_result(&StepResult::failed("s", "err"), now);
        assert!(m.force_retry("s", Duration::ZERO, now));
        assert_eq!(m.state_of("s"), Some(StepState::Queued));
    }
}

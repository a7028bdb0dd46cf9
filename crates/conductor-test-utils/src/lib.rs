//! Shared fakes and fixtures for Conductor tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use conductor_core::error::{ConductorError, Result};
use conductor_core::traits::WorkerInvoker;
use conductor_core::types::{AgentDescriptor, InvocationContext, InvocationOutput};
use conductor_core::workflow::{Step, WorkflowDefinition};

/// One canned worker response.
#[derive(Debug, Clone)]
pub struct Script {
    content: String,
    confidence: Option<f64>,
    reasoning: Option<String>,
    delay_ms: u64,
    failure: Option<String>,
    needs_input: Option<String>,
}

impl Script {
    pub fn reply(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            confidence: None,
            reasoning: None,
            delay_ms: 0,
            failure: None,
            needs_input: None,
        }
    }

    /// Fails with a retryable `Invocation` error carrying `message`.
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::reply("")
        }
    }

    pub fn needs_input(question: impl Into<String>) -> Self {
        Self {
            needs_input: Some(question.into()),
            ..Self::reply("")
        }
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn delay_ms(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    fn outcome(&self) -> Result<InvocationOutput> {
        if let Some(msg) = &self.failure {
            return Err(ConductorError::Invocation(msg.clone()));
        }
        Ok(InvocationOutput {
            content: self.content.clone(),
            confidence: self.confidence,
            reasoning: self.reasoning.clone(),
            needs_input: self.needs_input.clone(),
            ..Default::default()
        })
    }
}

/// A recorded invocation.
#[derive(Debug, Clone)]
pub struct Call {
    pub step_id: String,
    pub agent_id: Option<String>,
    pub prompt: String,
    pub attempt: u32,
    pub input: Value,
}

/// Worker that answers from scripts instead of calling a model.
///
/// Lookup order: step sequence, step script, agent script, default.
pub struct ScriptedInvoker {
    default: Script,
    by_agent: HashMap<String, Script>,
    by_step: HashMap<String, Script>,
    sequences: Mutex<HashMap<String, VecDeque<Script>>>,
    calls: Mutex<Vec<Call>>,
}

impl Default for ScriptedInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self {
            default: Script::reply("ok"),
            by_agent: HashMap::new(),
            by_step: HashMap::new(),
            sequences: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_default(mut self, script: Script) -> Self {
        self.default = script;
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>, script: Script) -> Self {
        self.by_agent.insert(agent_id.into(), script);
        self
    }

    pub fn with_step(mut self, step_id: impl Into<String>, script: Script) -> Self {
        self.by_step.insert(step_id.into(), script);
        self
    }

    /// Answer successive calls for a step in order; the last script repeats.
    pub fn with_sequence(self, step_id: impl Into<String>, scripts: Vec<Script>) -> Self {
        if let Ok(mut seqs) = self.sequences.lock() {
            seqs.insert(step_id.into(), scripts.into());
        }
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_for(&self, step_id: &str) -> usize {
        self.calls().iter().filter(|c| c.step_id == step_id).count()
    }

    fn script_for(&self, agent_id: Option<&str>, step_id: &str) -> Script {
        if let Ok(mut seqs) = self.sequences.lock() {
            if let Some(queue) = seqs.get_mut(step_id) {
                let next = if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                };
                if let Some(script) = next {
                    return script;
                }
            }
        }
        if let Some(script) = self.by_step.get(step_id) {
            return script.clone();
        }
        if let Some(script) = agent_id.and_then(|id| self.by_agent.get(id)) {
            return script.clone();
        }
        self.default.clone()
    }
}

impl WorkerInvoker for ScriptedInvoker {
    fn invoke<'a>(
        &'a self,
        agent: Option<&'a AgentDescriptor>,
        prompt: &'a str,
        ctx: &'a InvocationContext,
    ) -> BoxFuture<'a, Result<InvocationOutput>> {
        Box::pin(async move {
            let agent_id = agent.map(|a| a.id.clone());
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(Call {
                    step_id: ctx.step_id.clone(),
                    agent_id: agent_id.clone(),
                    prompt: prompt.to_string(),
                    attempt: ctx.attempt,
                    input: ctx.input.clone(),
                });
            }
            let script = self.script_for(agent_id.as_deref(), &ctx.step_id);
            if script.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(script.delay_ms)).await;
            }
            script.outcome()
        })
    }
}

/// An active agent with the given tier and capabilities.
pub fn agent(id: &str, tier: u8, capabilities: &[&str]) -> AgentDescriptor {
    AgentDescriptor::new(id, id.to_uppercase())
        .with_tier(tier)
        .with_capabilities(capabilities.iter().copied())
}

/// A workflow of plain sequential steps.
pub fn linear_workflow(id: &str, step_ids: &[&str]) -> WorkflowDefinition {
    let steps = step_ids
        .iter()
        .enumerate()
        .map(|(i, s)| Step::new(*s, s.to_uppercase()).with_position(i as u32 + 1))
        .collect();
    WorkflowDefinition::new(id, id.to_uppercase(), steps)
}

/// Write `content` to `name` inside a fresh temporary directory.
///
/// Keep the returned `TempDir` alive for as long as the file is used.
pub fn temp_file(name: &str, content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {}", e));
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap_or_else(|e| panic!("write {}: {}", path.display(), e));
    (dir, path)
}

/// Parse a TOML workflow fixture, panicking on malformed input.
pub fn workflow_from_toml(content: &str) -> WorkflowDefinition {
    WorkflowDefinition::from_toml(content).unwrap_or_else(|e| panic!("bad fixture: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(step_id: &str) -> InvocationContext {
        InvocationContext {
            execution_id: "e".into(),
            workflow_id: "wf".into(),
            step_id: step_id.into(),
            caller_id: "t".into(),
            attempt: 1,
            input: Value::Null,
        }
    }

    #[tokio::test]
    async fn test_lookup_order_and_sequence() {
        let invoker = ScriptedInvoker::new()
            .with_agent("a", Script::reply("agent"))
            .with_step("s", Script::reply("step"))
            .with_sequence("seq", vec![Script::fail("first"), Script::reply("second")]);
        let a = agent("a", 1, &[]);

        let out = invoker.invoke(Some(&a), "p", &ctx("s")).await.unwrap();
        assert_eq!(out.content, "step");
        let out = invoker.invoke(Some(&a), "p", &ctx("other")).await.unwrap();
        assert_eq!(out.content, "agent");
        let out = invoker.invoke(None, "p", &ctx("other")).await.unwrap();
        assert_eq!(out.content, "ok");

        assert!(invoker.invoke(None, "p", &ctx("seq")).await.is_err());
        for _ in 0..2 {
            let out = invoker.invoke(None, "p", &ctx("seq")).await.unwrap();
            assert_eq!(out.content, "second");
        }
        assert_eq!(invoker.calls_for("seq"), 3);
        assert_eq!(invoker.calls().len(), 6);
    }

    #[test]
    fn test_linear_workflow_fixture() {
        let wf = linear_workflow("wf", &["a", "b"]);
        assert_eq!(wf.entry_steps(), vec!["a"]);
        wf.validate().unwrap();
    }
}

use std::sync::Arc;

use conductor_agent::{EngineDeps, StartRequest, StaticCatalog, WorkflowEngine};
use conductor_core::config::AppConfig;
use conductor_core::event::EventBus;
use conductor_core::traits::{ExecutionStore, MetricsStore};
use conductor_core::types::{
    AgentDescriptor, EngineEvent, ExecutionId, ExecutionMode, ExecutionStatus, StepStatus,
};
use conductor_memory::SqliteStore;
use conductor_test_utils::{agent, workflow_from_toml, Script, ScriptedInvoker};

const REVIEW_WORKFLOW: &str = r#"
id = "review"
name = "Document review"

[[steps]]
id = "draft"
name = "Draft"
position = 1
required_capabilities = ["drafting"]
default_next = { type = "step", id = "revise" }

[[steps.conditional_next]]
condition = "confidence > 0.8"
target = "publish"
priority = 1

[[steps]]
id = "revise"
name = "Revise"
position = 2
default_next = { type = "end" }

[[steps]]
id = "publish"
name = "Publish"
position = 3
required_capabilities = ["publishing"]
"#;

struct Harness {
    engine: WorkflowEngine,
    store: Arc<SqliteStore>,
    invoker: Arc<ScriptedInvoker>,
    events: Arc<EventBus>,
    _dir: tempfile::TempDir,
}

fn harness(agents: Vec<AgentDescriptor>, invoker: ScriptedInvoker) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(SqliteStore::open(&dir.path().join("conductor.db")).expect("open store"));
    let invoker = Arc::new(invoker);
    let events = Arc::new(EventBus::default());
    let deps = EngineDeps {
        catalog: Arc::new(StaticCatalog::new(agents)),
        metrics: store.clone(),
        executions: store.clone(),
        invoker: invoker.clone(),
        events: events.clone(),
    };
    Harness {
        engine: WorkflowEngine::new(AppConfig::default(), deps),
        store,
        invoker,
        events,
        _dir: dir,
    }
}

fn review_agents() -> Vec<AgentDescriptor> {
    vec![
        agent("writer", 2, &["drafting"]),
        agent("publisher", 2, &["publishing"]),
    ]
}

#[tokio::test]
async fn test_confident_draft_is_published_and_recorded() {
    let h = harness(
        review_agents(),
        ScriptedInvoker::new().with_step("draft", Script::reply(r#"{"title": "Q3"}"#).confidence(0.9)),
    );
    h.engine
        .register_workflow(workflow_from_toml(REVIEW_WORKFLOW))
        .await
        .expect("register");

    let progress = h
        .engine
        .run_execution(StartRequest::new("review", "it"))
        .await
        .expect("run");

    assert_eq!(progress.status, ExecutionStatus::Completed);
    let ran: Vec<&str> = progress.step_results.iter().map(|r| r.step_id.as_str()).collect();
    assert_eq!(ran, vec!["draft", "publish"]);
    assert_eq!(h.invoker.calls_for("revise"), 0);
    assert_eq!(
        progress.result_for("draft").and_then(|r| r.agent_id.as_deref()),
        Some("writer")
    );

    // Snapshot survives in the store after the run is evicted
    let record = h
        .store
        .load_execution(&progress.execution_id)
        .await
        .expect("load")
        .expect("record present");
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.progress.step_results, progress.step_results);

    // Telemetry flowed into the metrics tables
    let perf = h
        .store
        .query_recent_performance("writer", "review", "draft", 5)
        .await
        .expect("perf");
    assert_eq!(perf.len(), 1);
    assert!(perf[0].metrics.success);
    assert!((perf[0].metrics.quality_score - 0.9).abs() < 1e-9);
    assert_eq!(h.store.query_active_load("writer").await.expect("load"), 0);

    let decisions = h.store.recent_selections("draft", 5).expect("decisions");
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].chosen_agents, vec!["writer"]);
    assert_eq!(decisions[0].strategy, "automatic");
}

#[tokio::test]
async fn test_unsure_draft_takes_default_route() {
    let h = harness(
        review_agents(),
        ScriptedInvoker::new().with_step("draft", Script::reply("rough notes").confidence(0.4)),
    );
    h.engine
        .register_workflow(workflow_from_toml(REVIEW_WORKFLOW))
        .await
        .expect("register");

    let progress = h
        .engine
        .run_execution(StartRequest::new("review", "it"))
        .await
        .expect("run");

    assert_eq!(progress.status, ExecutionStatus::Completed);
    assert!(progress.result_for("revise").is_some());
    assert!(progress.result_for("publish").is_none());
}

#[tokio::test]
async fn test_capability_based_selection_needs_full_coverage() {
    let wf = workflow_from_toml(
        r#"
id = "cap"
name = "Capability"

[[steps]]
id = "report"
name = "Report"
required_capabilities = ["drafting", "citations"]
selection = { strategy = "capability_based" }
"#,
    );
    let h = harness(
        vec![
            agent("generalist", 1, &["drafting"]),
            agent("specialist", 2, &["drafting", "citations"]),
        ],
        ScriptedInvoker::new(),
    );
    h.engine.register_workflow(wf).await.expect("register");

    let progress = h
        .engine
        .run_execution(StartRequest::new("cap", "it"))
        .await
        .expect("run");

    assert_eq!(progress.status, ExecutionStatus::Completed);
    let calls = h.invoker.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].agent_id.as_deref(), Some("specialist"));
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_run() {
    let wf = workflow_from_toml(
        r#"
id = "flaky"
name = "Flaky"

[[steps]]
id = "fetch"
name = "Fetch"
retry = { max_retries = 2, delay_ms = 1 }
"#,
    );
    let h = harness(
        vec![agent("worker", 2, &[])],
        ScriptedInvoker::new().with_step("fetch", Script::fail("HTTP 503")),
    );
    h.engine.register_workflow(wf).await.expect("register");

    let progress = h
        .engine
        .run_execution(StartRequest::new("flaky", "it"))
        .await
        .expect("run");

    assert_eq!(progress.status, ExecutionStatus::Failed);
    assert_eq!(h.invoker.calls_for("fetch"), 3);
    let attempts: Vec<u32> = progress.step_results.iter().map(|r| r.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(
        progress.step_results.last().map(|r| r.status),
        Some(StepStatus::Failed)
    );
    assert!(progress.error.is_some());

    let failed = h
        .store
        .list_executions(Some(ExecutionStatus::Failed))
        .await
        .expect("list");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].execution_id, progress.execution_id);
}

#[tokio::test]
async fn test_semi_automated_pause_is_persisted_and_resumable() {
    let wf = workflow_from_toml(
        r#"
id = "approval"
name = "Approval"

[[steps]]
id = "prepare"
name = "Prepare"
position = 1

[[steps]]
id = "sign_off"
name = "Sign off"
position = 2
requires_user_input = true
"#,
    );
    let h = harness(vec![agent("clerk", 2, &[])], ScriptedInvoker::new());
    h.engine.register_workflow(wf).await.expect("register");
    let mut rx = h.events.subscribe();

    let id = h
        .engine
        .start_execution(
            StartRequest::new("approval", "it").with_mode(ExecutionMode::SemiAutomated),
        )
        .await
        .expect("start");

    let paused = h.engine.wait(&id).await.expect("wait");
    assert_eq!(paused.status, ExecutionStatus::Paused);
    assert_eq!(paused.paused_steps, vec!["sign_off"]);
    assert_eq!(h.invoker.calls_for("sign_off"), 0);

    let stored = h.store.load_execution(&id.0).await.expect("load").expect("record");
    assert_eq!(stored.status, ExecutionStatus::Paused);

    h.engine
        .resume_execution(&id, Some(serde_json::json!("approved")))
        .await
        .expect("resume");
    let done = h.engine.wait(&id).await.expect("wait");
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(h.invoker.calls_for("sign_off"), 1);

    let mut saw_pause = false;
    let mut saw_complete = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            EngineEvent::RunPaused { .. } => saw_pause = true,
            EngineEvent::RunComplete { status, .. } => {
                saw_complete = status == ExecutionStatus::Completed
            }
            _ => {}
        }
    }
    assert!(saw_pause);
    assert!(saw_complete);
}

#[tokio::test]
async fn test_unknown_execution_is_reported() {
    let h = harness(vec![], ScriptedInvoker::new());
    let missing = ExecutionId::from_string("does-not-exist");
    assert!(h.engine.get_progress(&missing).await.is_err());
    assert!(h.engine.resume_execution(&missing, None).await.is_err());
}

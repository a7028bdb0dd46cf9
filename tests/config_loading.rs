use std::io::Write;

use conductor_core::config::AppConfig;
use conductor_core::types::{AgentStatus, CostClass};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
workspace = "/tmp/conductor-test"
max_concurrent_steps = 4
default_step_timeout_secs = 60
allow_unassigned_steps = false

[scoring]
capability_weight = 0.5
performance_weight = 0.25
load_weight = 0.15
cost_weight = 0.1
synonyms = [["drafting", "writing"]]

[selection]
min_viability = 0.4
consensus_size = 2

[analytics]
bottleneck_threshold_secs = 120

[storage]
database = "/tmp/conductor-test/runs.db"

[model]
model_id = "gpt-4o-mini"
base_url = "http://localhost:11434/v1"
api_key = "sk-test-key"
max_tokens = 2048
temperature = 0.1

[model.retry]
max_retries = 5

[[agents]]
id = "reg"
name = "Regulatory Reviewer"
tier = 1
capabilities = ["regulatory_analysis", "fda_expertise"]
specializations = ["regulatory"]
cost_class = "high"

[[agents]]
id = "writer"
name = "Medical Writer"
capabilities = ["medical_writing"]
status = "inactive"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_concurrent_steps, 4);
    assert_eq!(config.engine.default_step_timeout_secs, 60);
    assert!(!config.engine.allow_unassigned_steps);
    assert_eq!(config.scoring.capability_weight, 0.5);
    assert_eq!(config.scoring.synonyms, vec![vec!["drafting", "writing"]]);
    // Unset scoring fields keep their defaults
    assert_eq!(config.scoring.specialization_multiplier, 1.2);
    assert_eq!(config.selection.min_viability, 0.4);
    assert_eq!(config.selection.consensus_size, 2);
    assert_eq!(config.selection.decision_top_n, 5);
    assert_eq!(config.analytics.bottleneck_threshold_secs, 120);
    assert_eq!(
        config.database_path(),
        std::path::PathBuf::from("/tmp/conductor-test/runs.db")
    );

    let model = config.model.expect("model present");
    assert_eq!(model.model_id, "gpt-4o-mini");
    assert_eq!(model.api_key, Some("sk-test-key".to_string()));
    assert_eq!(model.max_tokens, 2048);
    assert_eq!(model.timeout_secs, 120);
    let retry = model.retry.expect("retry present");
    assert_eq!(retry.max_retries, 5);
    assert_eq!(retry.initial_backoff_ms, 1000);

    assert_eq!(config.agents.len(), 2);
    assert_eq!(config.agents[0].tier, 1);
    assert_eq!(config.agents[0].cost_class, CostClass::High);
    assert_eq!(config.agents[1].tier, 2);
    assert_eq!(config.agents[1].status, AgentStatus::Inactive);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("CONDUCTOR_TEST_API_KEY", "expanded-key-value");

    let toml_content = r#"
[model]
model_id = "test-model"
api_key = "${CONDUCTOR_TEST_API_KEY}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    let model = config.model.expect("model present");
    assert_eq!(model.api_key, Some("expanded-key-value".to_string()));

    std::env::remove_var("CONDUCTOR_TEST_API_KEY");
}

#[test]
fn test_empty_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"").expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_concurrent_steps, 8);
    assert_eq!(config.engine.default_step_timeout_secs, 300);
    assert!(config.engine.allow_unassigned_steps);
    assert_eq!(config.scoring.capability_weight, 0.4);
    assert_eq!(config.scoring.performance_weight, 0.3);
    assert_eq!(config.scoring.load_weight, 0.2);
    assert_eq!(config.scoring.cost_weight, 0.1);
    assert_eq!(config.scoring.recent_success_window_days, 7);
    assert!(!config.scoring.synonyms.is_empty());
    assert_eq!(config.selection.min_viability, 0.3);
    assert_eq!(config.selection.consensus_size, 3);
    assert_eq!(config.analytics.bottleneck_threshold_secs, 300);
    assert!(config.model.is_none());
    assert!(config.agents.is_empty());
    assert!(config.database_path().ends_with("conductor.db"));
}

#[test]
fn test_missing_config_file_is_reported() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/conductor.toml"))
        .expect_err("missing file");
    assert!(err.to_string().contains("Config file not found"));
}

#[test]
fn test_malformed_config_is_rejected() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine\nmax_concurrent_steps = ").expect("write toml");

    let err = AppConfig::load(tmp.path()).expect_err("malformed config");
    assert!(err.to_string().starts_with("Config error"));
}

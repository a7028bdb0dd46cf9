use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConductorError, Result};
use crate::types::AgentDescriptor;

/// Top-level Conductor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// OpenAI-compatible worker model. Absent = dry-run only.
    #[serde(default)]
    pub model: Option<ModelConfig>,
    /// Static agent catalog.
    #[serde(default)]
    pub agents: Vec<AgentDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// Upper bound on steps dispatched concurrently from one parallel batch.
    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: usize,
    #[serde(default = "default_step_timeout")]
    pub default_step_timeout_secs: u64,
    /// Dispatch to a bare model when no agent can be resolved.
    #[serde(default = "default_allow_unassigned")]
    pub allow_unassigned_steps: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            max_concurrent_steps: default_max_concurrent_steps(),
            default_step_timeout_secs: default_step_timeout(),
            allow_unassigned_steps: default_allow_unassigned(),
        }
    }
}

fn default_workspace() -> String { "~/.conductor".to_string() }
fn default_max_concurrent_steps() -> usize { 8 }
fn default_step_timeout() -> u64 { 300 }
fn default_allow_unassigned() -> bool { true }

/// Weights and constants for agent scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_capability_weight")]
    pub capability_weight: f64,
    #[serde(default = "default_performance_weight")]
    pub performance_weight: f64,
    #[serde(default = "default_load_weight")]
    pub load_weight: f64,
    #[serde(default = "default_cost_weight")]
    pub cost_weight: f64,
    #[serde(default = "default_specialization_multiplier")]
    pub specialization_multiplier: f64,
    /// Bonus per tier step above tier 4 (tier 1 gets 3x).
    #[serde(default = "default_tier_bonus_step")]
    pub tier_bonus_step: f64,
    #[serde(default = "default_recent_success_bonus")]
    pub recent_success_bonus: f64,
    #[serde(default = "default_recent_success_threshold")]
    pub recent_success_threshold: f64,
    #[serde(default = "default_recent_success_window_days")]
    pub recent_success_window_days: i64,
    #[serde(default = "default_history_limit")]
    pub performance_history_limit: usize,
    /// Duration considered "good" for the time sub-score.
    #[serde(default = "default_baseline_duration")]
    pub baseline_duration_secs: f64,
    /// Running executions at which the load sub-score reaches zero.
    #[serde(default = "default_max_concurrent_load")]
    pub max_concurrent_load: u32,
    #[serde(default = "default_performance_cache_ttl")]
    pub performance_cache_ttl_secs: u64,
    #[serde(default = "default_load_cache_ttl")]
    pub load_cache_ttl_secs: u64,
    /// Groups of interchangeable capability names.
    #[serde(default = "default_synonyms")]
    pub synonyms: Vec<Vec<String>>,
    /// Domain words that trigger the specialization multiplier.
    #[serde(default = "default_domain_keywords")]
    pub domain_keywords: Vec<String>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            capability_weight: default_capability_weight(),
            performance_weight: default_performance_weight(),
            load_weight: default_load_weight(),
            cost_weight: default_cost_weight(),
            specialization_multiplier: default_specialization_multiplier(),
            tier_bonus_step: default_tier_bonus_step(),
            recent_success_bonus: default_recent_success_bonus(),
            recent_success_threshold: default_recent_success_threshold(),
            recent_success_window_days: default_recent_success_window_days(),
            performance_history_limit: default_history_limit(),
            baseline_duration_secs: default_baseline_duration(),
            max_concurrent_load: default_max_concurrent_load(),
            performance_cache_ttl_secs: default_performance_cache_ttl(),
            load_cache_ttl_secs: default_load_cache_ttl(),
            synonyms: default_synonyms(),
            domain_keywords: default_domain_keywords(),
        }
    }
}

fn default_capability_weight() -> f64 { 0.4 }
fn default_performance_weight() -> f64 { 0.3 }
fn default_load_weight() -> f64 { 0.2 }
fn default_cost_weight() -> f64 { 0.1 }
fn default_specialization_multiplier() -> f64 { 1.2 }
fn default_tier_bonus_step() -> f64 { 0.02 }
fn default_recent_success_bonus() -> f64 { 0.05 }
fn default_recent_success_threshold() -> f64 { 0.9 }
fn default_recent_success_window_days() -> i64 { 7 }
fn default_history_limit() -> usize { 10 }
fn default_baseline_duration() -> f64 { 300.0 }
fn default_max_concurrent_load() -> u32 { 10 }
fn default_performance_cache_ttl() -> u64 { 3600 }
fn default_load_cache_ttl() -> u64 { 60 }

fn default_synonyms() -> Vec<Vec<String>> {
    let groups: [&[&str]; 5] = [
        &["regulatory_analysis", "compliance_analysis", "fda_expertise"],
        &["clinical_research", "clinical_trials", "trial_design"],
        &["market_analysis", "market_research", "competitive_analysis"],
        &["medical_writing", "scientific_writing", "technical_writing"],
        &["safety_assessment", "risk_assessment", "pharmacovigilance"],
    ];
    groups
        .iter()
        .map(|g| g.iter().map(|s| s.to_string()).collect())
        .collect()
}

fn default_domain_keywords() -> Vec<String> {
    [
        "regulatory", "clinical", "market", "medical", "safety", "quality", "legal",
        "financial", "technical", "research",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Minimum score for automatic selection.
    #[serde(default = "default_min_viability")]
    pub min_viability: f64,
    #[serde(default = "default_consensus_size")]
    pub consensus_size: usize,
    #[serde(default = "default_load_balance_min_capability")]
    pub load_balance_min_capability: f64,
    /// Alternatives kept in each selection decision log.
    #[serde(default = "default_decision_top_n")]
    pub decision_top_n: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            min_viability: default_min_viability(),
            consensus_size: default_consensus_size(),
            load_balance_min_capability: default_load_balance_min_capability(),
            decision_top_n: default_decision_top_n(),
        }
    }
}

fn default_min_viability() -> f64 { 0.3 }
fn default_consensus_size() -> usize { 3 }
fn default_load_balance_min_capability() -> f64 { 0.5 }
fn default_decision_top_n() -> usize { 5 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    /// Steps longer than this are reported as bottlenecks.
    #[serde(default = "default_bottleneck_threshold")]
    pub bottleneck_threshold_secs: u64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            bottleneck_threshold_secs: default_bottleneck_threshold(),
        }
    }
}

fn default_bottleneck_threshold() -> u64 { 300 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path. Default: <workspace>/conductor.db
    #[serde(default)]
    pub database: Option<String>,
}

/// OpenAI-compatible worker model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.2 }
fn default_request_timeout() -> u64 { 120 }

/// Retry configuration for model requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ConductorError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| ConductorError::Config(e.to_string()))
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        let ws = &self.engine.workspace;
        if let Some(rest) = ws.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(ws)
    }

    /// Resolve the SQLite database path.
    pub fn database_path(&self) -> PathBuf {
        match &self.storage.database {
            Some(path) => PathBuf::from(path),
            None => self.workspace_dir().join("conductor.db"),
        }
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    tracing::warn!(var = %var_name, "Config references an unset environment variable");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CostClass;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_CONDUCTOR_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_CONDUCTOR_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_CONDUCTOR_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_CONDUCTOR_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_CONDUCTOR_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.scoring.capability_weight, 0.4);
        assert_eq!(config.scoring.performance_cache_ttl_secs, 3600);
        assert_eq!(config.scoring.load_cache_ttl_secs, 60);
        assert_eq!(config.selection.min_viability, 0.3);
        assert_eq!(config.selection.consensus_size, 3);
        assert_eq!(config.analytics.bottleneck_threshold_secs, 300);
        assert!(config.engine.allow_unassigned_steps);
        assert!(config.model.is_none());
        assert!(config.agents.is_empty());
        assert!(!config.scoring.synonyms.is_empty());
    }

    #[test]
    fn test_agents_section() {
        let toml_str = r#"
[[agents]]
id = "reg"
name = "Regulatory Analyst"
tier = 1
capabilities = ["regulatory_analysis"]
specializations = ["regulatory"]
cost_class = "premium"

[[agents]]
id = "intern"
name = "Intern"
status = "inactive"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents[0].cost_class, CostClass::Premium);
        assert_eq!(config.agents[1].tier, 2);
        assert!(!config.agents[1].is_active());
    }

    #[test]
    fn test_database_path_default() {
        let mut config = AppConfig::default();
        config.engine.workspace = "/tmp/conductor-ws".into();
        assert_eq!(
            config.database_path(),
            PathBuf::from("/tmp/conductor-ws/conductor.db")
        );
        config.storage.database = Some("/data/c.db".into());
        assert_eq!(config.database_path(), PathBuf::from("/data/c.db"));
    }
}

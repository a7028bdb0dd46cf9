use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use conductor_core::config::ScoringConfig;
use conductor_core::traits::MetricsStore;
use conductor_core::types::{AgentDescriptor, PerformanceRecord};
use conductor_core::workflow::Step;

use crate::cache::ScoreCache;
use crate::capability::CapabilityMatcher;

/// Neutral value for sub-scores without data.
const NEUTRAL: f64 = 0.5;
/// Satisfaction assumed for records without a user rating.
const DEFAULT_SATISFACTION: f64 = 0.5;
/// Recency decay applied per rank in the performance history.
const RECENCY_DECAY: f64 = 0.1;

/// Sub-scores behind one combined agent score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreBreakdown {
    pub agent_id: String,
    pub capability: f64,
    pub performance: f64,
    pub load: f64,
    pub cost: f64,
    pub specialized: bool,
    pub tier_bonus: f64,
    pub recent_bonus: f64,
    pub total: f64,
}

/// Scores how well an agent suits a step.
///
/// Scoring never fails: missing history and store errors degrade to neutral
/// sub-scores. Caches are shared across runs.
pub struct AgentScorer {
    config: ScoringConfig,
    matcher: CapabilityMatcher,
    metrics: Arc<dyn MetricsStore>,
    performance_cache: ScoreCache<f64>,
    recent_cache: ScoreCache<Option<f64>>,
    load_cache: ScoreCache<u32>,
}

impl AgentScorer {
    pub fn new(config: ScoringConfig, metrics: Arc<dyn MetricsStore>) -> Self {
        let perf_ttl = Duration::from_secs(config.performance_cache_ttl_secs);
        let load_ttl = Duration::from_secs(config.load_cache_ttl_secs);
        Self {
            matcher: CapabilityMatcher::new(&config.synonyms),
            performance_cache: ScoreCache::new(perf_ttl),
            recent_cache: ScoreCache::new(perf_ttl),
            load_cache: ScoreCache::new(load_ttl),
            metrics,
            config,
        }
    }

    pub fn matcher(&self) -> &CapabilityMatcher {
        &self.matcher
    }

    /// Combined score in [0,1].
    pub async fn score(&self, agent: &AgentDescriptor, step: &Step, workflow_id: &str) -> f64 {
        self.breakdown(agent, step, workflow_id).await.total
    }

    pub async fn breakdown(
        &self,
        agent: &AgentDescriptor,
        step: &Step,
        workflow_id: &str,
    ) -> ScoreBreakdown {
        let capability = self.capability_score(agent, step);
        let performance = self.performance_score(&agent.id, workflow_id, &step.id).await;
        let load = self.load_score(self.active_load(&agent.id).await);
        let cost = self.cost_score(agent);

        let mut total = self.config.capability_weight * capability
            + self.config.performance_weight * performance
            + self.config.load_weight * load
            + self.config.cost_weight * cost;

        let specialized = self.specialization_applies(agent, step);
        if specialized {
            total *= self.config.specialization_multiplier;
        }

        let tier_bonus = self.tier_bonus(agent.tier);
        let recent_bonus = self.recent_success_bonus(&agent.id).await;
        total += tier_bonus + recent_bonus;

        let total = if total.is_finite() {
            total.clamp(0.0, 1.0)
        } else {
            warn!(agent = %agent.id, step = %step.id, "Non-finite agent score, using neutral");
            NEUTRAL
        };

        debug!(
            agent = %agent.id,
            step = %step.id,
            capability,
            performance,
            load,
            cost,
            total,
            "Scored agent"
        );

        ScoreBreakdown {
            agent_id: agent.id.clone(),
            capability,
            performance,
            load,
            cost,
            specialized,
            tier_bonus,
            recent_bonus,
            total,
        }
    }

    pub fn capability_score(&self, agent: &AgentDescriptor, step: &Step) -> f64 {
        self.matcher
            .score(&step.required_capabilities, &agent.capabilities)
    }

    /// Recency-weighted history score for (agent, workflow, step).
    pub async fn performance_score(&self, agent_id: &str, workflow_id: &str, step_id: &str) -> f64 {
        let key = format!("{}:{}:{}", agent_id, workflow_id, step_id);
        if let Some(score) = self.performance_cache.get(&key).await {
            return score;
        }

        let records = match self
            .metrics
            .query_recent_performance(
                agent_id,
                workflow_id,
                step_id,
                self.config.performance_history_limit,
            )
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!(agent = %agent_id, error = %e, "Performance history unavailable");
                return NEUTRAL;
            }
        };

        let score = self.weigh_history(&records);
        self.performance_cache.insert(key, score).await;
        score
    }

    fn weigh_history(&self, records: &[PerformanceRecord]) -> f64 {
        if records.is_empty() {
            return NEUTRAL;
        }

        let mut weighted = 0.0;
        let mut weights = 0.0;
        for (rank, record) in records.iter().enumerate() {
            let m = &record.metrics;
            let success = if m.success { 1.0 } else { 0.0 };
            let duration_secs = (m.duration_ms as f64 / 1000.0).max(1.0);
            let time = (self.config.baseline_duration_secs / duration_secs).min(1.0);
            let satisfaction = m.user_satisfaction.unwrap_or(DEFAULT_SATISFACTION);
            let value = 0.4 * success
                + 0.3 * m.quality_score.clamp(0.0, 1.0)
                + 0.2 * time
                + 0.1 * satisfaction.clamp(0.0, 1.0);

            let weight = (-RECENCY_DECAY * rank as f64).exp();
            weighted += value * weight;
            weights += weight;
        }

        if weights > 0.0 {
            weighted / weights
        } else {
            NEUTRAL
        }
    }

    /// Running executions on the agent, cached briefly. Store errors read as idle.
    pub async fn active_load(&self, agent_id: &str) -> u32 {
        if let Some(load) = self.load_cache.get(agent_id).await {
            return load;
        }
        match self.metrics.query_active_load(agent_id).await {
            Ok(load) => {
                self.load_cache.insert(agent_id, load).await;
                load
            }
            Err(e) => {
                warn!(agent = %agent_id, error = %e, "Active load unavailable");
                0
            }
        }
    }

    pub fn load_score(&self, running: u32) -> f64 {
        let max = self.config.max_concurrent_load.max(1) as f64;
        (1.0 - running as f64 / max).max(0.0)
    }

    pub fn cost_score(&self, agent: &AgentDescriptor) -> f64 {
        let max = conductor_core::types::CostClass::max_cost_per_call();
        (1.0 - agent.cost_class.cost_per_call() / max).clamp(0.0, 1.0)
    }

    /// A domain keyword appears both in the step text and in an agent specialization.
    pub fn specialization_applies(&self, agent: &AgentDescriptor, step: &Step) -> bool {
        let text = format!("{} {}", step.name, step.description).to_lowercase();
        self.config.domain_keywords.iter().any(|keyword| {
            let keyword = keyword.to_lowercase();
            text.contains(&keyword)
                && agent
                    .specializations
                    .iter()
                    .any(|s| s.to_lowercase().contains(&keyword))
        })
    }

    pub fn tier_bonus(&self, tier: u8) -> f64 {
        match tier {
            1..=3 => self.config.tier_bonus_step * (4 - tier) as f64,
            _ => 0.0,
        }
    }

    pub async fn recent_success_bonus(&self, agent_id: &str) -> f64 {
        let rate = match self.recent_cache.get(agent_id).await {
            Some(rate) => rate,
            None => {
                let since = Utc::now() - chrono::Duration::days(self.config.recent_success_window_days);
                match self.metrics.success_rate_since(agent_id, since).await {
                    Ok(rate) => {
                        self.recent_cache.insert(agent_id, rate).await;
                        rate
                    }
                    Err(e) => {
                        warn!(agent = %agent_id, error = %e, "Recent success rate unavailable");
                        None
                    }
                }
            }
        };

        match rate {
            Some(rate) if rate > self.config.recent_success_threshold => {
                self.config.recent_success_bonus
            }
            _ => 0.0,
        }
    }

    /// Drop cached values for an agent after new telemetry is written.
    pub async fn invalidate(&self, agent_id: &str) {
        self.performance_cache.invalidate_prefix(&format!("{}:", agent_id));
        self.recent_cache.remove(agent_id).await;
        self.load_cache.remove(agent_id).await;
    }
}

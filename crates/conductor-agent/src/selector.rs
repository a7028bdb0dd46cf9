use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, warn};

use conductor_core::config::SelectionConfig;
use conductor_core::error::{ConductorError, Result};
use conductor_core::traits::MetricsStore;
use conductor_core::types::{AgentDescriptor, CandidateScore, SelectionDecision};
use conductor_core::workflow::{ConsensusMode, SelectionStrategy, Step};

use crate::capability::normalize;
use crate::scorer::AgentScorer;

/// The agent(s) chosen for a step.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Single(AgentDescriptor),
    /// Several agents run the same step; the primary's output is propagated.
    Consensus {
        primary: AgentDescriptor,
        others: Vec<AgentDescriptor>,
    },
}

impl Selection {
    pub fn primary(&self) -> &AgentDescriptor {
        match self {
            Selection::Single(agent) => agent,
            Selection::Consensus { primary, .. } => primary,
        }
    }

    /// Every agent in the selection, primary first.
    pub fn agents(&self) -> Vec<&AgentDescriptor> {
        match self {
            Selection::Single(agent) => vec![agent],
            Selection::Consensus { primary, others } => {
                std::iter::once(primary).chain(others.iter()).collect()
            }
        }
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.agents().iter().map(|a| a.id.clone()).collect()
    }
}

/// Where a selection happens: used for scoring keys and the decision log.
#[derive(Debug, Clone, Copy)]
pub struct SelectionScope<'a> {
    pub workflow_id: &'a str,
    pub execution_id: Option<&'a str>,
}

/// Picks agents for steps according to a selection strategy.
pub struct AgentSelector {
    scorer: Arc<AgentScorer>,
    metrics: Arc<dyn MetricsStore>,
    config: SelectionConfig,
}

impl AgentSelector {
    pub fn new(
        scorer: Arc<AgentScorer>,
        metrics: Arc<dyn MetricsStore>,
        config: SelectionConfig,
    ) -> Self {
        Self {
            scorer,
            metrics,
            config,
        }
    }

    pub fn scorer(&self) -> &Arc<AgentScorer> {
        &self.scorer
    }

    /// Select agent(s) for `step` from `candidates`.
    ///
    /// Inactive candidates are never chosen. Every successful selection is
    /// logged to the metrics store; logging failures are swallowed.
    pub async fn select(
        &self,
        step: &Step,
        scope: SelectionScope<'_>,
        candidates: &[AgentDescriptor],
        strategy: &SelectionStrategy,
    ) -> Result<Selection> {
        let active: Vec<AgentDescriptor> =
            candidates.iter().filter(|a| a.is_active()).cloned().collect();

        let ranked = self.rank(step, scope.workflow_id, &active).await;

        let selection = match strategy {
            SelectionStrategy::Manual { preferred_agent_id } => {
                self.select_manual(step, preferred_agent_id.as_deref(), candidates)?
            }
            SelectionStrategy::Automatic => self.select_automatic(step, &ranked)?,
            SelectionStrategy::Consensus { count, mode } => {
                let count = if *count == 0 {
                    self.config.consensus_size
                } else {
                    *count
                };
                self.select_consensus(step, &ranked, count, *mode)?
            }
            SelectionStrategy::CapabilityBased => self.select_capability_based(step, &active)?,
            SelectionStrategy::LoadBalanced => self.select_load_balanced(step, &ranked).await?,
            SelectionStrategy::Fallback { agents } => self.select_fallback(agents, &active)?,
        };

        info!(
            step = %step.id,
            strategy = strategy.name(),
            agents = ?selection.agent_ids(),
            "Selected agents"
        );
        self.log_decision(step, scope, &selection, &ranked, strategy)
            .await;
        Ok(selection)
    }

    /// Score every candidate concurrently, highest first; ties by id.
    pub async fn rank(
        &self,
        step: &Step,
        workflow_id: &str,
        candidates: &[AgentDescriptor],
    ) -> Vec<(AgentDescriptor, f64)> {
        let scores = join_all(
            candidates
                .iter()
                .map(|agent| self.scorer.score(agent, step, workflow_id)),
        )
        .await;

        let mut ranked: Vec<(AgentDescriptor, f64)> =
            candidates.iter().cloned().zip(scores).collect();
        ranked.sort_by(|(a, sa), (b, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        ranked
    }

    fn select_manual(
        &self,
        step: &Step,
        preferred: Option<&str>,
        candidates: &[AgentDescriptor],
    ) -> Result<Selection> {
        let Some(id) = preferred.or(step.agent_id.as_deref()) else {
            return Err(ConductorError::Selection(format!(
                "step '{}' uses manual selection without an agent",
                step.id
            )));
        };
        match candidates.iter().find(|a| a.id == id) {
            Some(agent) if agent.is_active() => Ok(Selection::Single(agent.clone())),
            Some(_) => Err(ConductorError::Selection(format!(
                "agent '{}' is inactive",
                id
            ))),
            None => Err(ConductorError::Selection(format!(
                "agent '{}' is not in the catalog",
                id
            ))),
        }
    }

    fn select_automatic(&self, step: &Step, ranked: &[(AgentDescriptor, f64)]) -> Result<Selection> {
        match ranked.first() {
            Some((agent, score)) if *score >= self.config.min_viability => {
                Ok(Selection::Single(agent.clone()))
            }
            Some((agent, score)) => Err(ConductorError::Selection(format!(
                "best candidate '{}' for step '{}' scored {:.2}, below {:.2}",
                agent.id, step.id, score, self.config.min_viability
            ))),
            None => Err(ConductorError::NoAgentsAvailable),
        }
    }

    fn select_consensus(
        &self,
        step: &Step,
        ranked: &[(AgentDescriptor, f64)],
        count: usize,
        mode: ConsensusMode,
    ) -> Result<Selection> {
        if ranked.is_empty() {
            return Err(ConductorError::NoAgentsAvailable);
        }

        let chosen: Vec<AgentDescriptor> = match mode {
            ConsensusMode::TopScored => ranked.iter().take(count).map(|(a, _)| a.clone()).collect(),
            ConsensusMode::Diverse => pick_diverse(ranked, count),
            ConsensusMode::Tiered => pick_tiered(ranked, count),
        };

        let mut chosen = chosen.into_iter();
        let Some(primary) = chosen.next() else {
            return Err(ConductorError::Selection(format!(
                "no consensus members for step '{}'",
                step.id
            )));
        };
        Ok(Selection::Consensus {
            primary,
            others: chosen.collect(),
        })
    }

    fn select_capability_based(
        &self,
        step: &Step,
        active: &[AgentDescriptor],
    ) -> Result<Selection> {
        let matcher = self.scorer.matcher();
        let mut qualified: Vec<&AgentDescriptor> = active
            .iter()
            .filter(|a| matcher.covers_all(&step.required_capabilities, &a.capabilities))
            .collect();
        qualified.sort_by(|a, b| {
            a.tier
                .cmp(&b.tier)
                .then_with(|| b.priority.cmp(&a.priority))
                .then_with(|| a.id.cmp(&b.id))
        });

        qualified
            .first()
            .map(|a| Selection::Single((*a).clone()))
            .ok_or_else(|| {
                ConductorError::Selection(format!(
                    "no agent covers every capability of step '{}'",
                    step.id
                ))
            })
    }

    async fn select_load_balanced(
        &self,
        step: &Step,
        ranked: &[(AgentDescriptor, f64)],
    ) -> Result<Selection> {
        let capable: Vec<&(AgentDescriptor, f64)> = ranked
            .iter()
            .filter(|(a, _)| {
                self.scorer.capability_score(a, step) >= self.config.load_balance_min_capability
            })
            .collect();
        if capable.is_empty() {
            return Err(ConductorError::Selection(format!(
                "no sufficiently capable agent for step '{}'",
                step.id
            )));
        }

        let loads = join_all(capable.iter().map(|(a, _)| self.scorer.active_load(&a.id))).await;

        // `capable` is already in score order, so min_by_key keeps the best-scored on ties.
        capable
            .iter()
            .zip(loads)
            .min_by_key(|(_, load)| *load)
            .map(|((agent, _), load)| {
                debug!(agent = %agent.id, load, "Least loaded agent");
                Selection::Single(agent.clone())
            })
            .ok_or(ConductorError::NoAgentsAvailable)
    }

    fn select_fallback(&self, preferred: &[String], active: &[AgentDescriptor]) -> Result<Selection> {
        for id in preferred {
            if let Some(agent) = active.iter().find(|a| &a.id == id) {
                return Ok(Selection::Single(agent.clone()));
            }
        }
        active
            .first()
            .map(|a| Selection::Single(a.clone()))
            .ok_or(ConductorError::NoAgentsAvailable)
    }

    async fn log_decision(
        &self,
        step: &Step,
        scope: SelectionScope<'_>,
        selection: &Selection,
        ranked: &[(AgentDescriptor, f64)],
        strategy: &SelectionStrategy,
    ) {
        let decision = SelectionDecision {
            execution_id: scope.execution_id.map(String::from),
            workflow_id: scope.workflow_id.to_string(),
            step_id: step.id.clone(),
            chosen_agents: selection.agent_ids(),
            candidates: ranked
                .iter()
                .take(self.config.decision_top_n.max(1))
                .map(|(a, score)| CandidateScore {
                    agent_id: a.id.clone(),
                    score: *score,
                })
                .collect(),
            strategy: strategy.name().to_string(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.metrics.record_selection(&decision).await {
            warn!(step = %step.id, error = %e, "Failed to log selection decision");
        }
    }
}

/// Greedy pick in score order, skipping agents whose specialization tags
/// overlap any already chosen. May return fewer than `count`.
fn pick_diverse(ranked: &[(AgentDescriptor, f64)], count: usize) -> Vec<AgentDescriptor> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut chosen = Vec::new();
    for (agent, _) in ranked {
        if chosen.len() >= count {
            break;
        }
        let tags: Vec<String> = agent.specializations.iter().map(|s| normalize(s)).collect();
        if tags.iter().any(|t| seen.contains(t)) {
            continue;
        }
        seen.extend(tags);
        chosen.push(agent.clone());
    }
    chosen
}

/// Best agent from each tier, most senior first, then fill by score.
fn pick_tiered(ranked: &[(AgentDescriptor, f64)], count: usize) -> Vec<AgentDescriptor> {
    let mut tiers: Vec<u8> = ranked.iter().map(|(a, _)| a.tier).collect();
    tiers.sort_unstable();
    tiers.dedup();

    let mut chosen: Vec<AgentDescriptor> = Vec::new();
    for tier in tiers {
        if chosen.len() >= count {
            break;
        }
        if let Some((agent, _)) = ranked.iter().find(|(a, _)| a.tier == tier) {
            chosen.push(agent.clone());
        }
    }
    for (agent, _) in ranked {
        if chosen.len() >= count {
            break;
        }
        if !chosen.iter().any(|c| c.id == agent.id) {
            chosen.push(agent.clone());
        }
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::InMemoryMetricsStore;
    use conductor_core::config::ScoringConfig;

    fn selector(store: Arc<InMemoryMetricsStore>) -> AgentSelector {
        let scorer = Arc::new(AgentScorer::new(ScoringConfig::default(), store.clone()));
        AgentSelector::new(scorer, store, SelectionConfig::default())
    }

    fn scope() -> SelectionScope<'static> {
        SelectionScope {
            workflow_id: "wf",
            execution_id: Some("exec-1"),
        }
    }

    #[tokio::test]
    async fn test_automatic_prefers_capable_agent() {
        let store = Arc::new(InMemoryMetricsStore::new());
        let sel = selector(store.clone());
        let step = Step::new("s", "Draft").with_capabilities(["medical_writing"]);
        let agents = vec![
            AgentDescriptor::new("coder", "Coder").with_capabilities(["coding"]),
            AgentDescriptor::new("writer", "Writer").with_capabilities(["medical_writing"]),
        ];

        let selection = sel
            .select(&step, scope(), &agents, &SelectionStrategy::Automatic)
            .await
            .unwrap();
        assert_eq!(selection.primary().id, "writer");

        let decisions = store.selections();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].chosen_agents, vec!["writer"]);
        assert_eq!(decisions[0].candidates.len(), 2);
        assert_eq!(decisions[0].strategy, "automatic");
    }

    #[tokio::test]
    async fn test_automatic_empty_pool() {
        let sel = selector(Arc::new(InMemoryMetricsStore::new()));
        let err = sel
            .select(&Step::new("s", "S"), scope(), &[], &SelectionStrategy::Automatic)
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::NoAgentsAvailable));
    }

    #[tokio::test]
    async fn test_manual_inactive_agent_fails() {
        let sel = selector(Arc::new(InMemoryMetricsStore::new()));
        let agents = vec![AgentDescriptor::new("a", "A").inactive()];
        let strategy = SelectionStrategy::Manual {
            preferred_agent_id: Some("a".into()),
        };
        let err = sel
            .select(&Step::new("s", "S"), scope(), &agents, &strategy)
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::Selection(_)));
    }

    #[tokio::test]
    async fn test_capability_based_requires_full_coverage() {
        let sel = selector(Arc::new(InMemoryMetricsStore::new()));
        let step = Step::new("s", "S").with_capabilities(["statistics", "visualization"]);
        let agents = vec![
            AgentDescriptor::new("first", "First")
                .with_tier(1)
                .with_capabilities(["statistics"]),
            AgentDescriptor::new("second", "Second")
                .with_tier(3)
                .with_capabilities(["statistics", "visualization"]),
        ];
        let selection = sel
            .select(&step, scope(), &agents, &SelectionStrategy::CapabilityBased)
            .await
            .unwrap();
        assert_eq!(selection.primary().id, "second");
    }

    #[tokio::test]
    async fn test_capability_based_tie_break() {
        let sel = selector(Arc::new(InMemoryMetricsStore::new()));
        let step = Step::new("s", "S").with_capabilities(["x"]);
        let agents = vec![
            AgentDescriptor::new("low-prio", "L").with_tier(2).with_capabilities(["x"]),
            AgentDescriptor::new("high-prio", "H")
                .with_tier(2)
                .with_priority(5)
                .with_capabilities(["x"]),
            AgentDescriptor::new("junior", "J").with_tier(3).with_priority(99).with_capabilities(["x"]),
        ];
        let selection = sel
            .select(&step, scope(), &agents, &SelectionStrategy::CapabilityBased)
            .await
            .unwrap();
        assert_eq!(selection.primary().id, "high-prio");
    }

    #[tokio::test]
    async fn test_diverse_consensus_never_duplicates_tags() {
        let sel = selector(Arc::new(InMemoryMetricsStore::new()));
        let step = Step::new("s", "S");
        // Capabilities differ, but a1 and a2 share a specialization
        let agents = vec![
            AgentDescriptor::new("a1", "A1")
                .with_tier(1)
                .with_capabilities(["drafting"])
                .with_specializations(["regulatory"]),
            AgentDescriptor::new("a2", "A2")
                .with_tier(2)
                .with_capabilities(["review"])
                .with_specializations(["Regulatory"]),
            AgentDescriptor::new("a3", "A3")
                .with_tier(3)
                .with_capabilities(["stats"])
                .with_specializations(["clinical"]),
        ];
        let strategy = SelectionStrategy::Consensus {
            count: 2,
            mode: ConsensusMode::Diverse,
        };
        let selection = sel.select(&step, scope(), &agents, &strategy).await.unwrap();

        let mut seen = HashSet::new();
        for agent in selection.agents() {
            for tag in &agent.specializations {
                assert!(
                    seen.insert(normalize(tag)),
                    "duplicate specialization tag {}",
                    tag
                );
            }
        }
        assert_eq!(selection.agent_ids(), vec!["a1", "a3"]);
    }

    #[tokio::test]
    async fn test_top_scored_consensus_has_explicit_primary() {
        let sel = selector(Arc::new(InMemoryMetricsStore::new()));
        let step = Step::new("s", "S").with_capabilities(["review"]);
        let agents = vec![
            AgentDescriptor::new("weak", "W").with_tier(4),
            AgentDescriptor::new("best", "B").with_tier(1).with_capabilities(["review"]),
            AgentDescriptor::new("mid", "M").with_tier(2).with_capabilities(["review"]),
        ];
        let strategy = SelectionStrategy::Consensus {
            count: 2,
            mode: ConsensusMode::TopScored,
        };
        match sel.select(&step, scope(), &agents, &strategy).await.unwrap() {
            Selection::Consensus { primary, others } => {
                assert_eq!(primary.id, "best");
                assert_eq!(others.len(), 1);
                assert_eq!(others[0].id, "mid");
            }
            other => panic!("expected consensus, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tiered_consensus_spans_tiers() {
        let sel = selector(Arc::new(InMemoryMetricsStore::new()));
        let agents = vec![
            AgentDescriptor::new("t1a", "T1a").with_tier(1),
            AgentDescriptor::new("t1b", "T1b").with_tier(1),
            AgentDescriptor::new("t2", "T2").with_tier(2),
            AgentDescriptor::new("t3", "T3").with_tier(3),
        ];
        let strategy = SelectionStrategy::Consensus {
            count: 3,
            mode: ConsensusMode::Tiered,
        };
        let selection = sel
            .select(&Step::new("s", "S"), scope(), &agents, &strategy)
            .await
            .unwrap();
        let tiers: Vec<u8> = selection.agents().iter().map(|a| a.tier).collect();
        assert_eq!(tiers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_load_balanced_picks_idle_agent() {
        let store = Arc::new(InMemoryMetricsStore::new());
        for i in 0..4 {
            store
                .begin_execution("busy", "other-run", &format!("s{}", i))
                .await
                .unwrap();
        }
        let sel = selector(store);
        let step = Step::new("s", "S").with_capabilities(["x"]);
        let agents = vec![
            AgentDescriptor::new("busy", "Busy").with_tier(1).with_capabilities(["x"]),
            AgentDescriptor::new("idle", "Idle").with_tier(3).with_capabilities(["x"]),
            AgentDescriptor::new("unfit", "Unfit").with_capabilities(["y"]),
        ];
        let selection = sel
            .select(&step, scope(), &agents, &SelectionStrategy::LoadBalanced)
            .await
            .unwrap();
        assert_eq!(selection.primary().id, "idle");
    }

    #[tokio::test]
    async fn test_fallback_order() {
        let sel = selector(Arc::new(InMemoryMetricsStore::new()));
        let agents = vec![
            AgentDescriptor::new("a", "A"),
            AgentDescriptor::new("b", "B").inactive(),
            AgentDescriptor::new("c", "C"),
        ];
        let strategy = SelectionStrategy::Fallback {
            agents: vec!["b".into(), "c".into()],
        };
        let selection = sel
            .select(&Step::new("s", "S"), scope(), &agents, &strategy)
            .await
            .unwrap();
        assert_eq!(selection.primary().id, "c");

        let err = sel
            .select(&Step::new("s", "S"), scope(), &[], &strategy)
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::NoAgentsAvailable));
    }

    #[tokio::test]
    async fn test_decision_log_failure_does_not_abort() {
        let store = Arc::new(InMemoryMetricsStore::new().failing_selection_log());
        let sel = selector(store);
        let agents = vec![AgentDescriptor::new("a", "A")];
        let selection = sel
            .select(&Step::new("s", "S"), scope(), &agents, &SelectionStrategy::Automatic)
            .await
            .unwrap();
        assert_eq!(selection.primary().id, "a");
    }
}

//! Insight generation and additive prompt rebuilds.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;
use tracing::{debug, info};

use crate::agent::AgentKind;
use crate::error::{Error, Result};
use crate::patterns::{Pattern, PatternKind};
use crate::points::{
    rebuild_prompt, ConflictDetector, Insight, InsightKind, PointManager, PromptPoint,
};

/// An agent's prompt: authored system text plus an optional user preamble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPrompt {
    pub system: String,
    #[serde(default)]
    pub user: String,
}

impl AgentPrompt {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: String::new(),
        }
    }
}

/// Tunables for insight ingestion.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Also derive insights from ThinkingPattern observations
    pub include_thinking_insights: bool,
    /// Learned-set size up to which the LLM's own dedupe is trusted
    pub llm_dedupe_trust_threshold: usize,
    /// Token-Jaccard threshold for the backup duplicate check
    pub backup_similarity_threshold: f64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            include_thinking_insights: false,
            llm_dedupe_trust_threshold: 20,
            backup_similarity_threshold: 0.80,
        }
    }
}

/// Outcome of applying a batch of insights to one kind's point set.
#[derive(Debug, Clone)]
pub struct AppliedInsights {
    /// Ids of points born in this batch
    pub new_point_ids: Vec<String>,
    /// Active points after conflict resolution
    pub active_points: Vec<PromptPoint>,
    /// The rebuilt active prompt
    pub prompt: AgentPrompt,
}

/// Converts analyzer patterns and LLM proposals into points and rebuilds
/// prompts. Base prompts are held immutable for the generator's lifetime.
pub struct GuidelineGenerator {
    config: GeneratorConfig,
    base_prompts: HashMap<AgentKind, AgentPrompt>,
}

impl GuidelineGenerator {
    pub fn new(base_prompts: HashMap<AgentKind, AgentPrompt>) -> Result<Self> {
        for kind in AgentKind::ALL {
            if !base_prompts.contains_key(&kind) {
                return Err(Error::Config(format!("missing base prompt for {}", kind)));
            }
        }
        Ok(Self {
            config: GeneratorConfig::default(),
            base_prompts,
        })
    }

    pub fn with_config(mut self, config: GeneratorConfig) -> Self {
        self.config = config;
        self
    }

    /// The immutable authored prompt for a kind.
    pub fn base_prompt(&self, kind: AgentKind) -> &AgentPrompt {
        &self.base_prompts[&kind]
    }

    /// Derive candidate insights from analyzer patterns.
    ///
    /// At most one insight per FailurePattern and per ToolEffectiveness
    /// branch. SuccessPattern is absorbed by ToolEffectiveness and produces
    /// nothing on its own; ThinkingPattern is opt-in.
    pub fn insights_from_patterns(&self, patterns: &[Pattern]) -> Vec<Insight> {
        let mut insights = Vec::new();

        for pattern in patterns {
            match pattern.kind {
                PatternKind::SuccessPattern => {
                    debug!("Skipping success pattern: {}", pattern.description);
                }
                PatternKind::FailurePattern => {
                    if let Some(tool) = pattern.description.strip_prefix("Common failure point: ") {
                        insights.push(
                            Insight::new(
                                InsightKind::Warning,
                                failure_warning(tool),
                            )
                            .with_reasoning(pattern.description.clone()),
                        );
                    }
                }
                PatternKind::ToolEffectiveness => {
                    if let Some(tool) = pattern.description.strip_prefix("Highly effective tool: ") {
                        insights.push(
                            Insight::new(
                                InsightKind::Recommendation,
                                effective_recommendation(tool, pattern.confidence),
                            )
                            .with_reasoning(pattern.description.clone()),
                        );
                    } else if let Some(tool) = pattern.description.strip_prefix("Problematic tool: ") {
                        insights.push(
                            Insight::new(
                                InsightKind::Caution,
                                problematic_caution(tool, 1.0 - pattern.confidence),
                            )
                            .with_reasoning(pattern.description.clone()),
                        );
                    }
                }
                PatternKind::ThinkingPattern => {
                    if !self.config.include_thinking_insights {
                        debug!("Skipping thinking pattern: {}", pattern.description);
                        continue;
                    }
                    if let Some(choice) = pattern
                        .description
                        .strip_prefix("Detailed reasoning improves success for ")
                    {
                        insights.push(
                            Insight::new(InsightKind::ThinkingGuidance, thinking_guidance(choice))
                                .with_reasoning(pattern.description.clone()),
                        );
                    }
                }
                PatternKind::PerformanceOpt => {
                    debug!("Skipping performance pattern: {}", pattern.description);
                }
            }
        }

        insights
    }

    /// Add insights as points, resolve conflicts over the new ids, and
    /// rebuild the active prompt.
    ///
    /// For small learned sets the proposer's own dedupe is trusted; past
    /// the threshold every candidate also runs the backup textual check.
    pub async fn apply_insights(
        &self,
        kind: AgentKind,
        insights: &[Insight],
        manager: &PointManager,
        detector: &ConflictDetector,
    ) -> Result<AppliedInsights> {
        let existing = manager.all_points(kind).await;
        let run_backup_check = existing.len() > self.config.llm_dedupe_trust_threshold;

        let mut new_point_ids = Vec::new();
        for insight in insights {
            if run_backup_check && self.is_backup_duplicate(&insight.content, &existing) {
                debug!("Backup check: skipping near-duplicate insight for {}", kind);
                continue;
            }
            let outcome = manager.add_learned_insight(kind, insight).await?;
            if outcome.is_added() {
                new_point_ids.push(outcome.point().id.clone());
            }
        }

        let active_points = if new_point_ids.is_empty() {
            manager.active_points(kind).await
        } else {
            manager.resolve_conflicts(kind, detector, Some(&new_point_ids)).await?
        };

        let prompt = self.render(kind, &active_points);
        info!(
            "Applied {} insights for {}: {} new points, {} active after resolution",
            insights.len(),
            kind,
            new_point_ids.len(),
            active_points.len()
        );

        Ok(AppliedInsights {
            new_point_ids,
            active_points,
            prompt,
        })
    }

    /// Rebuild the active prompt for a kind from the manager's current
    /// active points.
    pub async fn rebuild(&self, kind: AgentKind, manager: &PointManager) -> AgentPrompt {
        let points = manager.active_points(kind).await;
        self.render(kind, &points)
    }

    fn render(&self, kind: AgentKind, points: &[PromptPoint]) -> AgentPrompt {
        let base = self.base_prompt(kind);
        AgentPrompt {
            system: rebuild_prompt(&base.system, points),
            user: base.user.clone(),
        }
    }

    /// Remove every learned point and restore each kind's active prompt to
    /// its base exactly. Version files are cleared; history records in run
    /// folders are untouched.
    pub async fn reset(
        &self,
        manager: &PointManager,
        versions: &crate::guideline::VersionStore,
    ) -> Result<()> {
        manager.clear_learned_points(None).await?;
        versions.clear_versions()?;
        for kind in AgentKind::ALL {
            versions.save_active(kind, self.base_prompt(kind))?;
        }
        info!("Reset all learned guidelines to base prompts");
        Ok(())
    }

    /// Token-Jaccard near-duplicate check after stripping verification
    /// markers.
    fn is_backup_duplicate(&self, content: &str, existing: &[PromptPoint]) -> bool {
        let candidate = marker_stripped_tokens(content);
        if candidate.is_empty() {
            return false;
        }
        for point in existing {
            let tokens = marker_stripped_tokens(&point.content);
            if tokens.is_empty() {
                continue;
            }
            let union = candidate.union(&tokens).count();
            let intersection = candidate.intersection(&tokens).count();
            if union > 0 && intersection as f64 / union as f64 > self.config.backup_similarity_threshold {
                return true;
            }
        }
        false
    }
}

fn marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)[✅⚠️🟢🔴]|verified|unverified|being tested").expect("static regex"))
}

fn marker_stripped_tokens(text: &str) -> HashSet<String> {
    let stripped = marker_re().replace_all(text, " ").to_lowercase();
    stripped.split_whitespace().map(String::from).collect()
}

fn failure_warning(tool: &str) -> String {
    format!(
        "**{tool}** has been identified as a common failure point.\n\
         - Review parameters carefully before calling this tool\n\
         - Consider alternative approaches if this tool fails\n\
         - Add error handling and validation"
    )
}

fn effective_recommendation(tool: &str, success_rate: f64) -> String {
    format!(
        "**{tool}** has shown high effectiveness in past executions.\n\
         - Success rate: {:.0}%\n\
         - Consider prioritizing this tool when appropriate",
        success_rate * 100.0
    )
}

fn problematic_caution(tool: &str, success_rate: f64) -> String {
    format!(
        "**{tool}** has shown low effectiveness.\n\
         - Success rate: {:.0}%\n\
         - Use with caution and consider alternatives\n\
         - Add additional validation before calling this tool",
        success_rate * 100.0
    )
}

fn thinking_guidance(tool_choice: &str) -> String {
    format!(
        "When choosing **{tool_choice}**, provide detailed reasoning:\n\
         - Explain your analysis step by step\n\
         - Consider multiple approaches before deciding\n\
         - Justify your tool choice with specific reasoning"
    )
}

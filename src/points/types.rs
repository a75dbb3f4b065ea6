//! Prompt point records and candidate insights.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Where a point came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointSource {
    /// Parsed from an authored prompt. Never stored in this system; the
    /// bucket exists for forward compatibility with merged stores.
    Original,
    Learned,
    Merged,
}

/// Category a point is grouped under when rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointCategory {
    ToolUsage,
    Workflow,
    Warning,
    Example,
    Reference,
    General,
}

impl PointCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolUsage => "tool_usage",
            Self::Workflow => "workflow",
            Self::Warning => "warning",
            Self::Example => "example",
            Self::Reference => "reference",
            Self::General => "general",
        }
    }
}

impl std::fmt::Display for PointCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A discrete, individually validated instruction appended to a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptPoint {
    /// Opaque stable id
    pub id: String,
    /// A single atomic instruction
    pub content: String,
    pub source: PointSource,
    pub category: PointCategory,
    /// 1-10, higher is more important
    pub priority: u8,
    pub verified: bool,
    pub verification_count: u32,
    pub success_count: u32,
    pub failure_count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts_with: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaces: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaced_by: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl PromptPoint {
    /// Create a new learned point with a fresh id.
    pub fn new_learned(content: impl Into<String>, category: PointCategory, priority: u8) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            source: PointSource::Learned,
            category,
            priority,
            verified: false,
            verification_count: 0,
            success_count: 0,
            failure_count: 0,
            conflicts_with: Vec::new(),
            replaces: None,
            replaced_by: None,
            active: true,
            created_at: now,
            last_updated: now,
            metadata: HashMap::new(),
        }
    }

    /// Observed success rate over validations.
    pub fn success_rate(&self) -> f64 {
        self.success_count as f64 / self.verification_count.max(1) as f64
    }

    /// Promote to verified once it has met the thresholds: at least three
    /// validations and at least two successes.
    pub fn mark_verified(&mut self) {
        if self.verification_count >= 3 && self.success_count >= 2 {
            self.verified = true;
            self.touch();
        }
    }

    /// Whether the point should be dropped from the active set.
    pub fn should_remove(&self) -> bool {
        if self.failure_count >= 2 && self.success_count == 0 {
            return true;
        }
        self.replaced_by.is_some()
    }

    /// Apply one validation outcome: bump counters, promote or prune.
    ///
    /// Counters only ever increase. A point that keeps failing before it is
    /// verified is deactivated aggressively.
    pub fn record_validation(&mut self, success: bool) {
        self.verification_count += 1;
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        self.touch();
        self.mark_verified();
        if self.should_remove() || (self.failure_count >= 2 && !self.verified) {
            self.active = false;
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}

/// Kind of a candidate insight, mapped onto a point category on add.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightKind {
    Guidance,
    Warning,
    Recommendation,
    Caution,
    ThinkingGuidance,
}

impl InsightKind {
    /// Category a point born from this insight gets.
    pub fn category(&self) -> PointCategory {
        match self {
            Self::Warning | Self::Caution => PointCategory::Warning,
            Self::Recommendation => PointCategory::ToolUsage,
            Self::ThinkingGuidance => PointCategory::Workflow,
            Self::Guidance => PointCategory::General,
        }
    }

    /// Parse the loose type strings LLMs reply with.
    pub fn parse(s: &str) -> InsightKind {
        match s {
            "warning" | "add_warning" => Self::Warning,
            "caution" | "add_caution" => Self::Caution,
            "recommendation" | "add_recommendation" | "tool_usage" => Self::Recommendation,
            "thinking_guidance" | "add_thinking_guidance" | "workflow" => Self::ThinkingGuidance,
            _ => Self::Guidance,
        }
    }
}

/// A candidate point proposed by the analyzer or the LLM optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub kind: InsightKind,
    pub content: String,
    /// Why the proposer believes this helps
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl Insight {
    pub fn new(kind: InsightKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            reasoning: String::new(),
            priority: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Reject empty content and out-of-range priorities.
    pub fn validate(&self) -> Result<()> {
        if self.content.trim().is_empty() {
            return Err(Error::validation("insight content is empty"));
        }
        if let Some(priority) = self.priority {
            if !(1..=10).contains(&priority) {
                return Err(Error::validation(format!(
                    "insight priority {} out of range 1-10",
                    priority
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_verified_thresholds() {
        let mut point = PromptPoint::new_learned("Use get_metrics first", PointCategory::ToolUsage, 6);

        point.verification_count = 2;
        point.success_count = 2;
        point.mark_verified();
        assert!(!point.verified);

        point.verification_count = 3;
        point.success_count = 1;
        point.failure_count = 2;
        point.mark_verified();
        assert!(!point.verified);

        point.success_count = 2;
        point.failure_count = 1;
        point.mark_verified();
        assert!(point.verified);
    }

    #[test]
    fn test_should_remove_on_consistent_failure() {
        let mut point = PromptPoint::new_learned("Avoid get_traces", PointCategory::Warning, 6);
        point.failure_count = 2;
        assert!(point.should_remove());

        point.success_count = 1;
        assert!(!point.should_remove());

        point.replaced_by = Some("other".into());
        assert!(point.should_remove());
    }

    #[test]
    fn test_insight_kind_category_mapping() {
        assert_eq!(InsightKind::Warning.category(), PointCategory::Warning);
        assert_eq!(InsightKind::Caution.category(), PointCategory::Warning);
        assert_eq!(InsightKind::Recommendation.category(), PointCategory::ToolUsage);
        assert_eq!(InsightKind::ThinkingGuidance.category(), PointCategory::Workflow);
        assert_eq!(InsightKind::Guidance.category(), PointCategory::General);
    }

    #[test]
    fn test_insight_validation() {
        assert!(Insight::new(InsightKind::Guidance, "  ").validate().is_err());
        assert!(Insight::new(InsightKind::Guidance, "x").with_priority(11).validate().is_err());
        assert!(Insight::new(InsightKind::Guidance, "x").with_priority(9).validate().is_ok());
    }

    #[test]
    fn test_point_serde_roundtrip() {
        let point = PromptPoint::new_learned("Check pod status", PointCategory::Workflow, 7);
        let json = serde_json::to_string(&point).unwrap();
        let back: PromptPoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, point);
        assert!(json.contains("\"learned\""));
        assert!(json.contains("\"workflow\""));
    }

    #[test]
    fn test_record_validation_promotes_after_three_uses() {
        let mut point = PromptPoint::new_learned("Use get_metrics", PointCategory::ToolUsage, 6);
        point.record_validation(true);
        point.record_validation(false);
        assert!(!point.verified);
        point.record_validation(true);
        assert!(point.verified);
        assert!(point.active);
    }

    #[test]
    fn test_record_validation_prunes_unverified_failures() {
        let mut point = PromptPoint::new_learned("Avoid get_traces", PointCategory::Warning, 6);
        point.record_validation(false);
        assert!(point.active);
        point.record_validation(false);
        assert!(!point.active);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Counters always balance and never decrease, and the verified
            /// flag only appears once its thresholds are met.
            #[test]
            fn validation_counters_stay_consistent(outcomes in proptest::collection::vec(any::<bool>(), 0..32)) {
                let mut point = PromptPoint::new_learned("Use get_metrics", PointCategory::ToolUsage, 6);
                let mut previous = (0u32, 0u32, 0u32);

                for outcome in outcomes {
                    point.record_validation(outcome);

                    prop_assert_eq!(
                        point.verification_count,
                        point.success_count + point.failure_count
                    );
                    prop_assert!(point.verification_count >= previous.0);
                    prop_assert!(point.success_count >= previous.1);
                    prop_assert!(point.failure_count >= previous.2);
                    if point.verified {
                        prop_assert!(point.verification_count >= 3);
                        prop_assert!(point.success_count >= 2);
                    }
                    previous = (point.verification_count, point.success_count, point.failure_count);
                }
            }
        }
    }
}

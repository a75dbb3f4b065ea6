//! Three-layer conflict detection between prompt points.
//!
//! Two points conflict when following both is impossible or self-defeating.
//! The layers run in order and short-circuit on the first definitive
//! answer: exact tool-name contradiction, lexical contradiction over a
//! shared topic, and (optionally) LLM adjudication for the ambiguous rest.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::llm::{extract_json_object, retry_with_backoff, CancelFlag, LlmClient, Throttle};

use super::tools::{jaccard, resolve_tool_name, tokenize};
use super::types::{PointCategory, PromptPoint};

const NEGATIVE_MARKERS: &[&str] = &["avoid", "don't", "never"];
const POSITIVE_MARKERS: &[&str] = &["use", "should", "always"];

/// Opposing modal pairs checked by the lexical layer.
const CONTRADICTION_PAIRS: &[(&str, &str)] = &[
    ("use", "avoid"),
    ("should", "should not"),
    ("must", "must not"),
    ("do", "don't"),
    ("always", "never"),
];

/// Configuration for the conflict detector.
#[derive(Debug, Clone)]
pub struct ConflictConfig {
    /// Consult the LLM judge for pairs the fast layers leave ambiguous
    pub use_llm: bool,
    /// Minimum token-set Jaccard overlap for the lexical layer to fire
    pub topic_overlap_threshold: f64,
    /// Minimum delay between LLM adjudication calls
    pub min_call_delay: Duration,
    /// Attempts per adjudication call on rate-limit errors
    pub max_attempts: u32,
    /// Initial backoff delay for rate-limit retries
    pub initial_backoff: Duration,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            use_llm: true,
            topic_overlap_threshold: 0.30,
            min_call_delay: Duration::from_millis(500),
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
        }
    }
}

/// Detects conflicts between points, caching verdicts by unordered id pair.
pub struct ConflictDetector {
    config: ConflictConfig,
    llm: Option<Arc<dyn LlmClient>>,
    cache: Mutex<HashMap<(String, String), bool>>,
    throttle: Throttle,
    cancel: CancelFlag,
}

impl ConflictDetector {
    pub fn new(config: ConflictConfig) -> Self {
        let throttle = Throttle::new(config.min_call_delay);
        Self {
            config,
            llm: None,
            cache: Mutex::new(HashMap::new()),
            throttle,
            cancel: CancelFlag::never(),
        }
    }

    /// Lexical layers only, no LLM judge.
    pub fn lexical_only() -> Self {
        Self::new(ConflictConfig {
            use_llm: false,
            ..ConflictConfig::default()
        })
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Detect conflicts among `points`.
    ///
    /// With `new_ids` set (the default mode), only new-vs-existing and
    /// new-vs-new pairs are checked. Without it, every pair is checked -
    /// O(n^2), kept only as a diagnostic fallback.
    pub async fn detect(
        &self,
        points: &[PromptPoint],
        new_ids: Option<&[String]>,
    ) -> Result<HashMap<String, Vec<String>>> {
        let active: Vec<&PromptPoint> = points.iter().filter(|p| p.active).collect();
        let mut conflicts: HashMap<String, Vec<String>> = HashMap::new();

        let pairs: Vec<(&PromptPoint, &PromptPoint)> = match new_ids {
            Some(new_ids) => {
                let (new_points, existing): (Vec<&PromptPoint>, Vec<&PromptPoint>) =
                    active.iter().copied().partition(|p| new_ids.contains(&p.id));
                debug!(
                    "Incremental conflict detection: {} new vs {} existing points",
                    new_points.len(),
                    existing.len()
                );
                let mut pairs = Vec::new();
                for new_point in &new_points {
                    for existing_point in &existing {
                        pairs.push((*new_point, *existing_point));
                    }
                }
                for (i, a) in new_points.iter().enumerate() {
                    for b in new_points.iter().skip(i + 1) {
                        pairs.push((*a, *b));
                    }
                }
                pairs
            }
            None => {
                warn!(
                    "Full conflict detection over {} points ({} pairs)",
                    active.len(),
                    active.len() * active.len().saturating_sub(1) / 2
                );
                let mut pairs = Vec::new();
                for (i, a) in active.iter().enumerate() {
                    for b in active.iter().skip(i + 1) {
                        pairs.push((*a, *b));
                    }
                }
                pairs
            }
        };

        for (a, b) in pairs {
            let key = pair_key(&a.id, &b.id);
            let cached = { self.cache.lock().await.get(&key).copied() };
            let conflicting = match cached {
                Some(verdict) => verdict,
                None => {
                    let verdict = self.is_conflict(a, b).await?;
                    self.cache.lock().await.insert(key, verdict);
                    verdict
                }
            };
            if conflicting {
                conflicts.entry(a.id.clone()).or_default().push(b.id.clone());
                conflicts.entry(b.id.clone()).or_default().push(a.id.clone());
            }
        }

        Ok(conflicts)
    }

    /// Run the layered check on one pair.
    async fn is_conflict(&self, a: &PromptPoint, b: &PromptPoint) -> Result<bool> {
        if tool_contradiction(a, b) {
            return Ok(true);
        }
        if lexical_contradiction(&a.content, &b.content, self.config.topic_overlap_threshold) {
            return Ok(true);
        }
        // Differing categories outside tool_usage/workflow rarely conflict;
        // don't spend an LLM call on them.
        if a.category != b.category
            && !matches!(a.category, PointCategory::ToolUsage | PointCategory::Workflow)
        {
            return Ok(false);
        }
        if self.config.use_llm {
            if let Some(verdict) = self.adjudicate(a, b).await {
                return Ok(verdict);
            }
        }
        Ok(false)
    }

    /// Ask the LLM judge whether two points conflict.
    ///
    /// Returns `None` when the judge is unavailable or its reply is
    /// unusable, so callers fall back to the lexical verdict.
    async fn adjudicate(&self, a: &PromptPoint, b: &PromptPoint) -> Option<bool> {
        let llm = self.llm.as_ref()?;
        self.throttle.acquire().await;

        let prompt = adjudication_prompt(&a.content, &b.content);
        let response = retry_with_backoff(
            self.config.max_attempts,
            self.config.initial_backoff,
            &self.cancel,
            || llm.infer(std::slice::from_ref(&prompt), None),
        )
        .await;

        let text = match response {
            Ok(text) => text,
            Err(e) => {
                warn!("LLM conflict adjudication unavailable, falling back: {}", e);
                return None;
            }
        };

        let value = extract_json_object(&text)?;
        let conflicts = value.get("conflicts")?.as_bool()?;
        if let Some(reason) = value.get("reason").and_then(|r| r.as_str()) {
            debug!("LLM conflict verdict {}: {}", conflicts, reason);
        }
        Some(conflicts)
    }
}

/// Unordered cache key for a point pair.
fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Layer 1: both tool_usage, same resolved tool, one side prohibits while
/// the other prescribes.
fn tool_contradiction(a: &PromptPoint, b: &PromptPoint) -> bool {
    if a.category != PointCategory::ToolUsage || b.category != PointCategory::ToolUsage {
        return false;
    }
    let (tool_a, tool_b) = match (resolve_tool_name(&a.content), resolve_tool_name(&b.content)) {
        (Some(ta), Some(tb)) => (ta, tb),
        _ => return false,
    };
    if tool_a != tool_b {
        return false;
    }

    let a_lower = a.content.to_lowercase();
    let b_lower = b.content.to_lowercase();
    let prohibits = |s: &str| NEGATIVE_MARKERS.iter().any(|m| s.contains(m));
    let prescribes = |s: &str| POSITIVE_MARKERS.iter().any(|m| s.contains(m));

    (prohibits(&a_lower) && prescribes(&b_lower)) || (prohibits(&b_lower) && prescribes(&a_lower))
}

/// Layer 2: opposing modal pairs across the contents, gated on topic overlap.
fn lexical_contradiction(a: &str, b: &str, overlap_threshold: f64) -> bool {
    let a_lower = a.to_lowercase();
    let b_lower = b.to_lowercase();

    let opposed = CONTRADICTION_PAIRS.iter().any(|(pos, neg)| {
        (a_lower.contains(pos) && b_lower.contains(neg))
            || (b_lower.contains(pos) && a_lower.contains(neg))
    });
    if !opposed {
        return false;
    }

    jaccard(&tokenize(a), &tokenize(b)) > overlap_threshold
}

fn adjudication_prompt(content_a: &str, content_b: &str) -> String {
    format!(
        r#"You are an expert at analyzing AI agent prompt guidelines and instructions.

Compare these two instructions and determine if they CONFLICT with each other.

**Instruction 1:**
{content_a}

**Instruction 2:**
{content_b}

Do these instructions CONFLICT? Consider:
- Do they give opposite or contradictory advice?
- Are they mutually exclusive (following one prevents following the other)?
- Do they recommend different approaches for the same task that cannot both be followed?

IMPORTANT:
- Complementary instructions (that can both be followed) are NOT conflicts
- Instructions about different topics are NOT conflicts
- Only mark as conflict if they are truly contradictory or mutually exclusive

Respond with ONLY a JSON object in this exact format:
{{
    "conflicts": true or false,
    "reason": "brief explanation of why they conflict or don't conflict"
}}"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::llm::MockLlm;

    fn point(content: &str, category: PointCategory) -> PromptPoint {
        PromptPoint::new_learned(content, category, 6)
    }

    #[tokio::test]
    async fn test_tool_contradiction_detected_without_llm() {
        let detector = ConflictDetector::lexical_only();
        let a = point("Use `get_metrics` before scaling.", PointCategory::ToolUsage);
        let b = point("Avoid `get_metrics`; it is unreliable.", PointCategory::ToolUsage);

        let conflicts = detector.detect(&[a.clone(), b.clone()], None).await.unwrap();
        assert_eq!(conflicts[&a.id], vec![b.id.clone()]);
        assert_eq!(conflicts[&b.id], vec![a.id.clone()]);
    }

    #[tokio::test]
    async fn test_lexical_contradiction_needs_topic_overlap() {
        let detector = ConflictDetector::lexical_only();
        let a = point("Always check pod logs before restarting the deployment", PointCategory::Workflow);
        let b = point("Never check pod logs before restarting the deployment", PointCategory::Workflow);
        let conflicts = detector.detect(&[a.clone(), b.clone()], None).await.unwrap();
        assert!(conflicts.contains_key(&a.id));

        // Opposing modals over unrelated topics do not conflict.
        let c = point("Always verify quota limits first", PointCategory::Workflow);
        let d = point("Never restart CronJobs blindly", PointCategory::Workflow);
        let conflicts = detector.detect(&[c.clone(), d], None).await.unwrap();
        assert!(conflicts.is_empty() || !conflicts.contains_key(&c.id));
    }

    #[tokio::test]
    async fn test_incremental_mode_only_checks_new_pairs() {
        let detector = ConflictDetector::lexical_only();
        let existing_a = point("Use get_services to enumerate services", PointCategory::ToolUsage);
        let existing_b = point("Avoid get_services, prefer direct pod listing", PointCategory::ToolUsage);
        let new_point = point("Summarize findings at the end", PointCategory::General);

        // existing_a and existing_b would conflict, but neither is new.
        let points = vec![existing_a.clone(), existing_b.clone(), new_point.clone()];
        let conflicts = detector
            .detect(&points, Some(&[new_point.id.clone()]))
            .await
            .unwrap();
        assert!(conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_llm_adjudication_definitive_answer() {
        let llm = Arc::new(MockLlm::new().reply(r#"{"conflicts": true, "reason": "mutually exclusive"}"#));
        let detector = ConflictDetector::new(ConflictConfig {
            min_call_delay: Duration::from_millis(0),
            ..ConflictConfig::default()
        })
        .with_llm(llm);

        let a = point("Gather the dependency graph before mitigation", PointCategory::Workflow);
        let b = point("Mitigate immediately, dependencies can wait", PointCategory::Workflow);
        let conflicts = detector.detect(&[a.clone(), b.clone()], None).await.unwrap();
        assert!(conflicts.contains_key(&a.id));
    }

    #[tokio::test]
    async fn test_llm_failure_downgrades_to_lexical() {
        let llm = Arc::new(
            MockLlm::new()
                .error(Error::Llm("boom".into()))
                .error(Error::Llm("boom".into())),
        );
        let detector = ConflictDetector::new(ConflictConfig {
            min_call_delay: Duration::from_millis(0),
            ..ConflictConfig::default()
        })
        .with_llm(llm);

        let a = point("Gather the dependency graph before mitigation", PointCategory::Workflow);
        let b = point("Mitigate immediately, dependencies can wait", PointCategory::Workflow);
        let conflicts = detector.detect(&[a, b], None).await.unwrap();
        assert!(conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_pair_cache_avoids_second_llm_call() {
        let llm = Arc::new(MockLlm::new().reply(r#"{"conflicts": false, "reason": "unrelated"}"#));
        let detector = ConflictDetector::new(ConflictConfig {
            min_call_delay: Duration::from_millis(0),
            ..ConflictConfig::default()
        })
        .with_llm(llm.clone());

        let a = point("Check quota usage in the namespace", PointCategory::Workflow);
        let b = point("Restart the failing pod once", PointCategory::Workflow);
        let points = vec![a, b];

        detector.detect(&points, None).await.unwrap();
        // Second pass must be served from the cache; the mock has no replies left.
        let conflicts = detector.detect(&points, None).await.unwrap();
        assert!(conflicts.is_empty());
        assert_eq!(llm.received().await.len(), 1);
    }
}

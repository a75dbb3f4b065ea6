//! Identifying which points an agent actually used in a trace.
//!
//! Two modes: heuristic-first runs cheap text matching and only sends the
//! leftovers to the LLM classifier; LLM-primary keeps just the exact
//! tool-name heuristic and batches everything else through the LLM.

use regex::Regex;
use std::sync::Arc;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::llm::{extract_json_array, extract_json_object, retry_with_backoff, CancelFlag, LlmClient, Throttle};
use crate::trace::AgentTrace;

use super::tools::{concept_tokens, resolve_tool_name, tokenize};
use super::types::{PointCategory, PromptPoint};

const ACTION_VERBS: &[&str] = &[
    "check", "verify", "examine", "analyze", "use", "call", "execute", "run",
];

/// How used-point identification balances heuristics and the LLM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageMode {
    /// Heuristics first; only unmatched points go to the LLM
    HeuristicFirst,
    /// Exact tool-name matching only; everything else goes to the LLM
    LlmPrimary,
}

/// Configuration for the usage detector.
#[derive(Debug, Clone)]
pub struct UsageConfig {
    pub mode: UsageMode,
    /// Points per LLM classification call
    pub batch_size: usize,
    /// Minimum delay between LLM classification calls
    pub min_call_delay: std::time::Duration,
    /// Attempts per classification call on rate-limit errors
    pub max_attempts: u32,
    pub initial_backoff: std::time::Duration,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            mode: UsageMode::HeuristicFirst,
            batch_size: 8,
            min_call_delay: std::time::Duration::from_secs(2),
            max_attempts: 3,
            initial_backoff: std::time::Duration::from_secs(5),
        }
    }
}

/// Matches active points against a closed trace.
pub struct UsageDetector {
    config: UsageConfig,
    llm: Option<Arc<dyn LlmClient>>,
    throttle: Throttle,
    cancel: CancelFlag,
}

impl UsageDetector {
    pub fn new(config: UsageConfig) -> Self {
        let throttle = Throttle::new(config.min_call_delay);
        Self {
            config,
            llm: None,
            throttle,
            cancel: CancelFlag::never(),
        }
    }

    /// Heuristics only, no LLM classifier.
    pub fn heuristic_only() -> Self {
        Self::new(UsageConfig::default())
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Identify which of `points` were used in `trace`, returning their ids.
    pub async fn identify(&self, points: &[PromptPoint], trace: &AgentTrace) -> Result<Vec<String>> {
        let active: Vec<&PromptPoint> = points.iter().filter(|p| p.active).collect();
        if active.is_empty() {
            return Ok(Vec::new());
        }

        let tool_names: Vec<String> = trace.tool_names().iter().map(|s| s.to_string()).collect();
        let reasoning_texts = trace.reasoning_texts();
        let trace_text = {
            let mut parts = tool_names.clone();
            parts.extend(reasoning_texts.iter().cloned());
            parts.join(" ").to_lowercase()
        };

        let mut used = Vec::new();
        let mut for_llm = Vec::new();

        let llm_primary = self.config.mode == UsageMode::LlmPrimary && self.llm.is_some();
        for point in &active {
            // Exact tool-name match is trusted in both modes.
            if point.category == PointCategory::ToolUsage {
                if let Some(tool) = resolve_tool_name(&point.content) {
                    if tool_names.contains(&tool) {
                        debug!("Point {} matched via exact tool usage: {}", point.id, tool);
                        used.push(point.id.clone());
                        continue;
                    }
                }
            }

            if llm_primary {
                for_llm.push(*point);
                continue;
            }

            if keyword_match(point, &trace_text) {
                debug!("Point {} matched via keyword overlap", point.id);
                used.push(point.id.clone());
                continue;
            }

            let concept_eligible = matches!(
                point.category,
                PointCategory::Workflow | PointCategory::General
            ) || (point.category == PointCategory::ToolUsage
                && resolve_tool_name(&point.content).is_none());
            if concept_eligible && concept_match(point, &trace_text, &reasoning_texts) {
                debug!("Point {} matched via concept overlap", point.id);
                used.push(point.id.clone());
                continue;
            }

            for_llm.push(*point);
        }

        let heuristic_count = used.len();
        if self.llm.is_some() && !for_llm.is_empty() {
            let summary = trace_summary(trace, &tool_names, &reasoning_texts);
            let llm_matched = self.classify_batches(&for_llm, &summary).await?;
            for id in llm_matched {
                if !used.contains(&id) {
                    used.push(id);
                }
            }
        }

        info!(
            "Identified {} used points out of {} active ({} heuristic, {} LLM)",
            used.len(),
            active.len(),
            heuristic_count,
            used.len() - heuristic_count
        );
        Ok(used)
    }

    /// Classify leftover points in batches through the LLM.
    async fn classify_batches(&self, points: &[&PromptPoint], summary: &str) -> Result<Vec<String>> {
        let llm = match self.llm.as_ref() {
            Some(llm) => llm,
            None => return Ok(Vec::new()),
        };

        let mut used = Vec::new();
        for batch in points.chunks(self.config.batch_size) {
            self.cancel.check()?;
            self.throttle.acquire().await;

            let prompt = classification_prompt(batch, summary);
            let response = retry_with_backoff(
                self.config.max_attempts,
                self.config.initial_backoff,
                &self.cancel,
                || llm.infer(std::slice::from_ref(&prompt), None),
            )
            .await;

            let text = match response {
                Ok(text) => text,
                Err(crate::error::Error::Cancelled) => return Err(crate::error::Error::Cancelled),
                Err(e) => {
                    warn!("LLM usage classification failed for batch, skipping: {}", e);
                    continue;
                }
            };

            used.extend(parse_used_points(&text, batch));
        }
        Ok(used)
    }
}

/// Keyword overlap of at least two tokens, gated on an activity check.
fn keyword_match(point: &PromptPoint, trace_text: &str) -> bool {
    let point_tokens = tokenize(&point.content);
    let trace_tokens = tokenize(trace_text);
    if point_tokens.intersection(&trace_tokens).count() < 2 {
        return false;
    }

    // The overlap must be about something that actually happened: a tool
    // mention or a shared action verb.
    let point_lower = point.content.to_lowercase();
    if point_lower.contains("tool") {
        return true;
    }
    ACTION_VERBS
        .iter()
        .any(|verb| point_lower.contains(verb) && trace_text.contains(verb))
}

fn sentence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.!?]").expect("static regex"))
}

fn short_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\w{3,}\b").expect("static regex"))
}

/// Concept overlap: at least 30% of the point's 4+ letter tokens appear in
/// the trace, or one of its leading sentences echoes a reasoning step.
fn concept_match(point: &PromptPoint, trace_text: &str, reasoning_texts: &[String]) -> bool {
    let point_concepts = concept_tokens(&point.content);
    if point_concepts.is_empty() {
        return false;
    }
    let trace_concepts = concept_tokens(trace_text);
    let overlap = point_concepts.intersection(&trace_concepts).count();
    if overlap as f64 / point_concepts.len() as f64 >= 0.3 {
        return true;
    }

    let sentences: Vec<&str> = sentence_re()
        .split(&point.content)
        .map(|s| s.trim())
        .filter(|s| s.len() > 10)
        .take(2)
        .collect();
    for reasoning in reasoning_texts {
        let reasoning_lower = reasoning.to_lowercase();
        let reasoning_tokens: std::collections::HashSet<String> = short_token_re()
            .find_iter(&reasoning_lower)
            .map(|m| m.as_str().to_string())
            .collect();
        for sentence in &sentences {
            let sentence_tokens: std::collections::HashSet<String> = short_token_re()
                .find_iter(&sentence.to_lowercase())
                .map(|m| m.as_str().to_string())
                .collect();
            if sentence_tokens.len() >= 3
                && sentence_tokens.intersection(&reasoning_tokens).count() >= 2
            {
                return true;
            }
        }
    }
    false
}

/// Compact trace description handed to the LLM classifier.
fn trace_summary(trace: &AgentTrace, tool_names: &[String], reasoning_texts: &[String]) -> String {
    let mut parts = Vec::new();

    if tool_names.is_empty() {
        parts.push("**Tools Used:** (no tool calls recorded)".to_string());
    } else {
        let mut unique = tool_names.to_vec();
        unique.sort();
        unique.dedup();
        parts.push(format!("**Tools Used:** {}", unique.join(", ")));
    }

    if reasoning_texts.is_empty() {
        parts.push("**Agent Reasoning:** (no reasoning steps recorded)".to_string());
    } else {
        let mut summary = reasoning_texts
            .iter()
            .take(3)
            .cloned()
            .collect::<Vec<_>>()
            .join(" | ");
        if summary.len() > 500 {
            summary.truncate(500);
            summary.push_str("...");
        }
        parts.push(format!("**Agent Reasoning:** {}", summary));
    }

    if let Some(submission) = trace.final_submission.as_deref() {
        let mut submission = submission.to_string();
        if submission.len() > 200 {
            submission.truncate(200);
            submission.push_str("...");
        }
        parts.push(format!("**Final Submission:** {}", submission));
    }

    parts.push(format!(
        "**Execution Result:** {}",
        if trace.success { "SUCCESS" } else { "FAILED" }
    ));

    parts.join("\n")
}

fn classification_prompt(points: &[&PromptPoint], summary: &str) -> String {
    let points_section = points
        .iter()
        .enumerate()
        .map(|(i, p)| format!("**Point {} (ID: {}):**\n{}", i + 1, p.id, p.content))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        r#"You are an expert at analyzing AI agent execution traces and prompt guidelines.

Analyze the following agent execution trace and determine which prompt points were actually USED or FOLLOWED during this execution.

**Execution Trace:**
{summary}

**Available Prompt Points:**
{points_section}

Consider:
- Tool calls that match point recommendations
- Reasoning that aligns with point guidance
- Workflow steps that match point descriptions

IMPORTANT:
- Only mark as USED if there is clear evidence the point was followed
- Be conservative; general principles that were not explicitly applied are NOT USED

Respond with ONLY a JSON object in this exact format:
{{
    "used_points": [
        {{"point_id": "point-id-1", "used": true, "evidence": "brief explanation"}},
        {{"point_id": "point-id-2", "used": false, "evidence": "brief explanation"}}
    ]
}}"#
    )
}

/// Pull used point ids out of a classification reply, accepting only ids
/// that were actually in the batch.
fn parse_used_points(text: &str, batch: &[&PromptPoint]) -> Vec<String> {
    let entries = extract_json_object(text)
        .and_then(|v| v.get("used_points").cloned())
        .or_else(|| extract_json_array(text));

    let entries = match entries {
        Some(serde_json::Value::Array(items)) => items,
        _ => {
            warn!("Could not extract JSON from LLM usage classification reply");
            return Vec::new();
        }
    };

    let batch_ids: Vec<&str> = batch.iter().map(|p| p.id.as_str()).collect();
    entries
        .iter()
        .filter_map(|item| {
            let used = item.get("used")?.as_bool()?;
            let id = item.get("point_id")?.as_str()?;
            (used && batch_ids.contains(&id)).then(|| id.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentKind;
    use crate::llm::MockLlm;
    use crate::trace::{ProblemContext, ThinkingStep, ToolCall};
    use chrono::Utc;
    use std::collections::HashMap;

    fn trace_with(tools: &[(&str, bool)], reasoning: &[&str]) -> AgentTrace {
        let ctx = ProblemContext::new("p1", "app", "ns", "desc");
        let mut trace = AgentTrace::new("t1".into(), AgentKind::Diagnosis, ctx);
        for (name, success) in tools {
            trace.tool_calls.push(ToolCall {
                tool_name: name.to_string(),
                arguments: HashMap::new(),
                timestamp: Utc::now(),
                success: *success,
                response: String::new(),
                duration: 0.1,
            });
        }
        for text in reasoning {
            trace.thinking_steps.push(ThinkingStep {
                reasoning: text.to_string(),
                tool_choice: "get_metrics".into(),
                justification: String::new(),
                timestamp: Utc::now(),
            });
        }
        trace
    }

    #[tokio::test]
    async fn test_exact_tool_match() {
        let detector = UsageDetector::heuristic_only();
        let point =
            PromptPoint::new_learned("Use `get_metrics` before scaling.", PointCategory::ToolUsage, 6);
        let trace = trace_with(&[("get_metrics", true)], &[]);

        let used = detector.identify(&[point.clone()], &trace).await.unwrap();
        assert_eq!(used, vec![point.id]);
    }

    #[tokio::test]
    async fn test_unrelated_point_not_matched() {
        let detector = UsageDetector::heuristic_only();
        let point = PromptPoint::new_learned(
            "Document storage class fallbacks thoroughly",
            PointCategory::Reference,
            6,
        );
        let trace = trace_with(&[("get_metrics", true)], &["metrics look fine"]);

        let used = detector.identify(&[point], &trace).await.unwrap();
        assert!(used.is_empty());
    }

    #[tokio::test]
    async fn test_concept_overlap_matches_workflow_point() {
        let detector = UsageDetector::heuristic_only();
        let point = PromptPoint::new_learned(
            "Inspect deployment replicas before restarting pods",
            PointCategory::Workflow,
            6,
        );
        let trace = trace_with(
            &[("exec_read_only_kubectl_cmd", true)],
            &["inspect deployment replicas first, then consider restarting the failing pods"],
        );

        let used = detector.identify(&[point.clone()], &trace).await.unwrap();
        assert_eq!(used, vec![point.id]);
    }

    #[tokio::test]
    async fn test_inactive_points_skipped() {
        let detector = UsageDetector::heuristic_only();
        let mut point =
            PromptPoint::new_learned("Use `get_metrics` early", PointCategory::ToolUsage, 6);
        point.active = false;
        let trace = trace_with(&[("get_metrics", true)], &[]);

        let used = detector.identify(&[point], &trace).await.unwrap();
        assert!(used.is_empty());
    }

    #[tokio::test]
    async fn test_llm_primary_batches_non_obvious_points() {
        let point_a =
            PromptPoint::new_learned("Use `get_metrics` before scaling.", PointCategory::ToolUsage, 6);
        let point_b = PromptPoint::new_learned(
            "Cross-check the blast radius with the platform team",
            PointCategory::General,
            6,
        );
        let reply = format!(
            r#"{{"used_points": [{{"point_id": "{}", "used": true, "evidence": "mentioned"}}]}}"#,
            point_b.id
        );
        let llm = Arc::new(MockLlm::new().reply(reply));
        let detector = UsageDetector::new(UsageConfig {
            mode: UsageMode::LlmPrimary,
            min_call_delay: std::time::Duration::from_millis(0),
            ..UsageConfig::default()
        })
        .with_llm(llm.clone());

        let trace = trace_with(&[("get_metrics", true)], &["checked with platform team"]);
        let used = detector
            .identify(&[point_a.clone(), point_b.clone()], &trace)
            .await
            .unwrap();

        assert!(used.contains(&point_a.id)); // exact tool heuristic
        assert!(used.contains(&point_b.id)); // LLM classification
        assert_eq!(llm.received().await.len(), 1);
    }

    #[tokio::test]
    async fn test_llm_reply_with_unknown_ids_ignored() {
        let point = PromptPoint::new_learned(
            "Coordinate with the on-call rotation",
            PointCategory::General,
            6,
        );
        let llm = Arc::new(
            MockLlm::new()
                .reply(r#"{"used_points": [{"point_id": "not-a-real-id", "used": true, "evidence": "?"}]}"#),
        );
        let detector = UsageDetector::new(UsageConfig {
            mode: UsageMode::LlmPrimary,
            min_call_delay: std::time::Duration::from_millis(0),
            ..UsageConfig::default()
        })
        .with_llm(llm);

        let trace = trace_with(&[], &[]);
        let used = detector.identify(&[point], &trace).await.unwrap();
        assert!(used.is_empty());
    }
}

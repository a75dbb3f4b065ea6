//! LLM prompt optimization: propose new insights from a round's traces.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::agent::AgentKind;
use crate::error::Result;
use crate::guideline::AgentPrompt;
use crate::llm::{extract_json_object, retry_with_backoff, CancelFlag, LlmClient};
use crate::points::{Insight, InsightKind, PromptPoint};
use crate::trace::AgentTrace;

use super::reward::RewardSpec;

/// Tunables for the prompt optimizer.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Attempts before the caller must fall back to a prior version
    pub max_attempts: u32,
    /// Minimum traces per kind before optimization is attempted
    pub min_traces: usize,
    pub initial_backoff: Duration,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_traces: 5,
            initial_backoff: Duration::from_secs(2),
        }
    }
}

/// Result of one optimization attempt for a kind.
#[derive(Debug, Clone, PartialEq)]
pub enum OptimizationOutcome {
    /// The LLM proposed parseable insights
    Insights(Vec<Insight>),
    /// Too few traces to learn anything
    InsufficientTraces,
    /// Every attempt produced unusable output; fall back to the previous
    /// prompt version
    Failed,
}

/// Asks the LLM for new, non-duplicate insights given trace evidence and a
/// reward objective.
pub struct PromptOptimizer {
    config: OptimizerConfig,
    llm: Arc<dyn LlmClient>,
    reward_spec: RewardSpec,
    cancel: CancelFlag,
}

impl PromptOptimizer {
    pub fn new(llm: Arc<dyn LlmClient>, reward_spec: RewardSpec) -> Self {
        Self {
            config: OptimizerConfig::default(),
            llm,
            reward_spec,
            cancel: CancelFlag::never(),
        }
    }

    pub fn with_config(mut self, config: OptimizerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Propose insights for one agent kind.
    pub async fn optimize(
        &self,
        kind: AgentKind,
        current_prompt: &AgentPrompt,
        traces: &[AgentTrace],
        existing_insights: &[PromptPoint],
    ) -> Result<OptimizationOutcome> {
        if traces.len() < self.config.min_traces {
            info!(
                "Skipping LLM optimization for {}: {} traces below minimum {}",
                kind,
                traces.len(),
                self.config.min_traces
            );
            return Ok(OptimizationOutcome::InsufficientTraces);
        }

        let prompt = self.build_prompt(kind, current_prompt, traces, existing_insights);

        for attempt in 1..=self.config.max_attempts {
            self.cancel.check()?;
            info!(
                "Requesting LLM optimization for {} (attempt {}/{})",
                kind, attempt, self.config.max_attempts
            );

            let response = retry_with_backoff(
                self.config.max_attempts,
                self.config.initial_backoff,
                &self.cancel,
                || self.llm.infer(std::slice::from_ref(&prompt), None),
            )
            .await;

            let text = match response {
                Ok(text) => text,
                Err(crate::error::Error::Cancelled) => return Err(crate::error::Error::Cancelled),
                Err(e) => {
                    warn!("LLM optimization call failed for {}: {}", kind, e);
                    continue;
                }
            };

            if let Some(insights) = parse_insights(&text) {
                info!("LLM proposed {} insights for {}", insights.len(), kind);
                return Ok(OptimizationOutcome::Insights(insights));
            }
            warn!(
                "Unparseable LLM optimization reply for {} on attempt {}",
                kind, attempt
            );
        }

        Ok(OptimizationOutcome::Failed)
    }

    fn build_prompt(
        &self,
        kind: AgentKind,
        current_prompt: &AgentPrompt,
        traces: &[AgentTrace],
        existing_insights: &[PromptPoint],
    ) -> String {
        let analysis = TraceAnalysis::compute(traces, &self.reward_spec);

        format!(
            r#"You are an expert at optimizing AI agent prompts based on execution performance data.

## Task
Optimize the prompt for a {kind} agent in a Kubernetes SRE system. The agent is responsible for {role}.

## Current Performance Metrics
- Total traces analyzed: {total}
- Success rate: {success_rate:.0}%
- Average latency: {avg_latency:.2} seconds
- Average number of tool calls (attempts): {avg_attempts:.1}
- Overall reward score: {avg_reward:.3}

## Reward Specification (what to optimize for)
- Success weight: {sw} (higher is better)
- Latency weight: {lw} (negative = lower is better)
- Attempts weight: {aw} (negative = lower is better)

## Current Prompt
```
{current}
```

## Successful Execution Patterns
{successful}

## Failed Execution Patterns
{failed}

## Ground Truth Analysis
{ground_truth}

## Problem-Specific Failure Analysis
{problems}

## Existing Learned Insights (CRITICAL - DO NOT DUPLICATE)
{existing}

## Your Task
You must ADD new insights, NOT replace the original prompt content.
- Review all existing insights above; do not generate semantically similar ones
- Improve success rate first; reduce latency and attempts where success allows
- Address ground-truth gaps (missing services, partial submissions)
- Never remove or modify original prompt sections

Respond with ONLY a JSON object in this exact format:
```json
{{
  "new_insights": [
    {{
      "type": "recommendation",
      "content": "Specific guidance text here",
      "reasoning": "Why this insight helps"
    }}
  ]
}}
```"#,
            kind = kind,
            role = kind.role_description(),
            total = analysis.total,
            success_rate = analysis.success_rate * 100.0,
            avg_latency = analysis.avg_latency,
            avg_attempts = analysis.avg_attempts,
            avg_reward = analysis.avg_reward,
            sw = self.reward_spec.success_weight,
            lw = self.reward_spec.latency_weight,
            aw = self.reward_spec.attempts_weight,
            current = current_prompt.system,
            successful = analysis.successful_patterns,
            failed = analysis.failed_patterns,
            ground_truth = ground_truth_section(kind, traces),
            problems = problem_failure_section(kind, traces),
            existing = existing_insights_section(existing_insights),
        )
    }
}

/// Aggregated trace metrics for the optimization prompt.
struct TraceAnalysis {
    total: usize,
    success_rate: f64,
    avg_latency: f64,
    avg_attempts: f64,
    avg_reward: f64,
    successful_patterns: String,
    failed_patterns: String,
}

impl TraceAnalysis {
    fn compute(traces: &[AgentTrace], reward_spec: &RewardSpec) -> Self {
        let total = traces.len();
        let successful: Vec<&AgentTrace> = traces.iter().filter(|t| t.success).collect();
        let failed: Vec<&AgentTrace> = traces.iter().filter(|t| !t.success).collect();
        let success_rate = if total == 0 {
            0.0
        } else {
            successful.len() as f64 / total as f64
        };

        let avg_latency = mean(traces.iter().map(|t| t.performance_metrics.total_duration));
        let avg_attempts = mean(
            traces
                .iter()
                .map(|t| t.performance_metrics.tool_call_count as f64),
        );
        let avg_reward = mean(traces.iter().map(|t| {
            reward_spec.compute(
                t.success,
                t.performance_metrics.total_duration,
                t.performance_metrics.tool_call_count,
                Some(success_rate),
            )
        }));

        Self {
            total,
            success_rate,
            avg_latency,
            avg_attempts,
            avg_reward,
            successful_patterns: tool_pattern_section(&successful),
            failed_patterns: tool_pattern_section(&failed),
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let collected: Vec<f64> = values.collect();
    if collected.is_empty() {
        0.0
    } else {
        collected.iter().sum::<f64>() / collected.len() as f64
    }
}

/// Top-5 tools by call count with their success rates.
fn tool_pattern_section(traces: &[&AgentTrace]) -> String {
    if traces.is_empty() {
        return "(none)".to_string();
    }

    let mut usage: HashMap<&str, (usize, usize)> = HashMap::new();
    for trace in traces {
        for call in &trace.tool_calls {
            let entry = usage.entry(call.tool_name.as_str()).or_insert((0, 0));
            entry.0 += 1;
            if call.success {
                entry.1 += 1;
            }
        }
    }

    let mut ranked: Vec<(&str, (usize, usize))> = usage.into_iter().collect();
    ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then_with(|| a.0.cmp(b.0)));

    let lines: Vec<String> = ranked
        .into_iter()
        .take(5)
        .map(|(tool, (count, successes))| {
            format!(
                "- {}: {} calls, {:.0}% success",
                tool,
                count,
                successes as f64 / count as f64 * 100.0
            )
        })
        .collect();

    if lines.is_empty() {
        "(no tool calls recorded)".to_string()
    } else {
        lines.join("\n")
    }
}

/// Missing/extra service gaps mined from enhanced oracle results.
fn ground_truth_section(kind: AgentKind, traces: &[AgentTrace]) -> String {
    if kind != AgentKind::Localization {
        let failed = traces.iter().filter(|t| !t.success).count();
        let successful = traces.len() - failed;
        return format!("- Failed traces: {}\n- Successful traces: {}", failed, successful);
    }

    let mut missing_counts: HashMap<String, usize> = HashMap::new();
    let mut partial_credit = 0usize;
    let mut failed = 0usize;
    for trace in traces.iter().filter(|t| !t.success) {
        failed += 1;
        if let Some(loc) = trace
            .oracle_results_enhanced
            .as_ref()
            .and_then(|e| e.localization.as_ref())
        {
            for value in &loc.missing {
                if let Some(service) = value.as_str() {
                    *missing_counts.entry(service.to_string()).or_insert(0) += 1;
                }
            }
            if loc.partial_credit == Some(true) {
                partial_credit += 1;
            }
        }
    }

    if missing_counts.is_empty() {
        return format!("- Failed traces: {}\n- No recurring missing services", failed);
    }

    let mut ranked: Vec<(String, usize)> = missing_counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let common: Vec<String> = ranked.into_iter().take(5).map(|(s, _)| s).collect();

    format!(
        "- Failed traces: {}\n\
         - Most commonly missing services: {}\n\
         - Partial credit cases: {}\n\
         - Recommendation: identify ALL affected services before submitting, not just the first one found",
        failed,
        common.join(", "),
        partial_credit
    )
}

/// Failure counts grouped by problem, with short trace samples.
fn problem_failure_section(kind: AgentKind, traces: &[AgentTrace]) -> String {
    let mut by_problem: HashMap<&str, Vec<&AgentTrace>> = HashMap::new();
    for trace in traces.iter().filter(|t| t.agent_kind == kind && !t.success) {
        by_problem
            .entry(trace.problem_context.problem_id.as_str())
            .or_default()
            .push(trace);
    }

    if by_problem.is_empty() {
        return "No problem-specific failures for this agent.".to_string();
    }

    let mut problems: Vec<&&str> = by_problem.keys().collect();
    problems.sort();
    let mut sections = Vec::new();
    for problem in problems {
        let failures = &by_problem[*problem];
        let mut lines = vec![format!("**Problem: {}** - failed {} time(s)", problem, failures.len())];
        for trace in failures.iter().take(2) {
            let tools: Vec<&str> = trace.tool_names().into_iter().take(5).collect();
            let submission = trace
                .final_submission
                .as_deref()
                .map(|s| {
                    let mut s = s.to_string();
                    if s.len() > 200 {
                        s.truncate(200);
                        s.push_str("...");
                    }
                    s
                })
                .unwrap_or_else(|| "(no submission)".to_string());
            lines.push(format!("  - tools: [{}], submitted: {}", tools.join(", "), submission));
        }
        sections.push(lines.join("\n"));
    }
    sections.join("\n")
}

fn existing_insights_section(existing: &[PromptPoint]) -> String {
    if existing.is_empty() {
        return "No existing insights. You can generate any new insights based on the performance data.".to_string();
    }

    let mut lines = vec![format!(
        "You have {} existing insights. DO NOT generate duplicates or semantically similar insights:",
        existing.len()
    )];
    for (i, point) in existing.iter().enumerate() {
        let status = if point.verified { "VERIFIED" } else { "UNVERIFIED" };
        let mut preview = point.content.clone();
        if preview.len() > 200 {
            preview.truncate(200);
            preview.push_str("...");
        }
        lines.push(format!("{}. [{}] {}", i + 1, status, preview));
    }
    lines.join("\n")
}

/// Parse a `new_insights` reply into validated insights.
fn parse_insights(text: &str) -> Option<Vec<Insight>> {
    let value = extract_json_object(text)?;
    let entries = value.get("new_insights")?.as_array()?;

    let mut insights = Vec::new();
    for entry in entries {
        let content = entry.get("content")?.as_str()?;
        let kind = InsightKind::parse(entry.get("type").and_then(|t| t.as_str()).unwrap_or("guidance"));
        let reasoning = entry
            .get("reasoning")
            .and_then(|r| r.as_str())
            .unwrap_or_default();
        let insight = Insight::new(kind, content).with_reasoning(reasoning);
        if insight.validate().is_err() {
            return None;
        }
        insights.push(insight);
    }
    Some(insights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use crate::trace::{ProblemContext, ToolCall};
    use chrono::Utc;

    fn trace(id: &str, success: bool) -> AgentTrace {
        let ctx = ProblemContext::new("p1", "app", "ns", "desc");
        let mut t = AgentTrace::new(id.into(), AgentKind::Diagnosis, ctx);
        t.success = success;
        t.tool_calls.push(ToolCall {
            tool_name: "get_metrics".into(),
            arguments: HashMap::new(),
            timestamp: Utc::now(),
            success: true,
            response: String::new(),
            duration: 0.5,
        });
        t.performance_metrics.tool_call_count = 1;
        t.performance_metrics.total_duration = 2.0;
        t
    }

    fn traces(n: usize) -> Vec<AgentTrace> {
        (0..n).map(|i| trace(&format!("t{}", i), i % 2 == 0)).collect()
    }

    #[tokio::test]
    async fn test_insufficient_traces_declines() {
        let optimizer = PromptOptimizer::new(Arc::new(MockLlm::new()), RewardSpec::default());
        let outcome = optimizer
            .optimize(AgentKind::Diagnosis, &AgentPrompt::new("base"), &traces(2), &[])
            .await
            .unwrap();
        assert_eq!(outcome, OptimizationOutcome::InsufficientTraces);
    }

    #[tokio::test]
    async fn test_parses_new_insights_reply() {
        let reply = r#"```json
{"new_insights": [
  {"type": "recommendation", "content": "Use get_metrics before get_traces", "reasoning": "metrics are cheaper"},
  {"type": "warning", "content": "Avoid broad kubectl delete", "reasoning": "risky"}
]}
```"#;
        let optimizer = PromptOptimizer::new(Arc::new(MockLlm::new().reply(reply)), RewardSpec::default());
        let outcome = optimizer
            .optimize(AgentKind::Diagnosis, &AgentPrompt::new("base"), &traces(5), &[])
            .await
            .unwrap();

        match outcome {
            OptimizationOutcome::Insights(insights) => {
                assert_eq!(insights.len(), 2);
                assert_eq!(insights[0].kind, InsightKind::Recommendation);
                assert_eq!(insights[1].kind, InsightKind::Warning);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unparseable_replies_fail_after_three_attempts() {
        let llm = Arc::new(
            MockLlm::new()
                .reply("not json at all")
                .reply("still not json")
                .reply("{\"wrong_key\": []}"),
        );
        let optimizer = PromptOptimizer::new(llm.clone(), RewardSpec::default());
        let outcome = optimizer
            .optimize(AgentKind::Diagnosis, &AgentPrompt::new("base"), &traces(5), &[])
            .await
            .unwrap();

        assert_eq!(outcome, OptimizationOutcome::Failed);
        assert_eq!(llm.received().await.len(), 3);
    }

    #[tokio::test]
    async fn test_prompt_includes_existing_insights() {
        let reply = r#"{"new_insights": []}"#;
        let llm = Arc::new(MockLlm::new().reply(reply));
        let optimizer = PromptOptimizer::new(llm.clone(), RewardSpec::default());

        let existing = vec![crate::points::PromptPoint::new_learned(
            "Check quotas first",
            crate::points::PointCategory::Workflow,
            6,
        )];
        optimizer
            .optimize(AgentKind::Diagnosis, &AgentPrompt::new("base"), &traces(5), &existing)
            .await
            .unwrap();

        let sent = llm.received().await;
        assert!(sent[0].contains("Check quotas first"));
        assert!(sent[0].contains("DO NOT generate duplicates"));
    }
}

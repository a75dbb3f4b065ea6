//! Deterministic trace analysis.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

use crate::agent::AgentKind;
use crate::trace::AgentTrace;

/// Kinds of signal the analyzer can derive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    SuccessPattern,
    FailurePattern,
    ToolEffectiveness,
    ThinkingPattern,
    PerformanceOpt,
}

/// A concrete trace or tool referenced as evidence for a pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternExample {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_sequence: Vec<String>,
}

/// A structured observation derived from a set of traces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub kind: PatternKind,
    pub description: String,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub frequency: usize,
    /// Up to three supporting examples
    pub examples: Vec<PatternExample>,
    /// One to three recommendations
    pub recommendations: Vec<String>,
}

/// Tunable thresholds for the analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Mean successful tool-call count above which a PerformanceOpt fires
    pub high_tool_usage_threshold: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            high_tool_usage_threshold: 10.0,
        }
    }
}

/// Analyzes closed traces to identify recurring signals.
#[derive(Debug, Clone, Default)]
pub struct PatternAnalyzer {
    config: AnalyzerConfig,
}

impl PatternAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    /// Analyze traces and identify patterns. Pure: no I/O, no mutation.
    pub fn analyze(&self, traces: &[AgentTrace]) -> Vec<Pattern> {
        let mut patterns = Vec::new();
        if traces.is_empty() {
            return patterns;
        }

        self.success_patterns(traces, &mut patterns);
        self.failure_patterns(traces, &mut patterns);
        self.tool_effectiveness(traces, &mut patterns);
        self.thinking_patterns(traces, &mut patterns);
        self.performance_patterns(traces, &mut patterns);

        info!("Identified {} patterns from {} traces", patterns.len(), traces.len());
        patterns
    }

    /// Consecutive tool subsequences (length 2-5) shared by successful traces.
    fn success_patterns(&self, traces: &[AgentTrace], out: &mut Vec<Pattern>) {
        let successful: Vec<&AgentTrace> = traces.iter().filter(|t| t.success).collect();
        if successful.is_empty() {
            return;
        }

        let sequences: Vec<Vec<String>> = successful
            .iter()
            .map(|t| t.tool_names().into_iter().map(String::from).collect())
            .collect();

        for (subsequence, frequency) in common_subsequences(&sequences, 2) {
            let confidence = (frequency as f64 / successful.len() as f64).min(1.0);
            let joined = subsequence.join(" -> ");
            let examples = successful
                .iter()
                .filter(|t| {
                    contains_subsequence(
                        &t.tool_names().into_iter().map(String::from).collect::<Vec<_>>(),
                        &subsequence,
                    )
                })
                .take(3)
                .map(|t| PatternExample {
                    trace_id: Some(t.trace_id.clone()),
                    problem_id: Some(t.problem_context.problem_id.clone()),
                    tool: None,
                    success_rate: None,
                    avg_duration: None,
                    tool_sequence: t.tool_names().into_iter().map(String::from).collect(),
                })
                .collect();

            out.push(Pattern {
                kind: PatternKind::SuccessPattern,
                description: format!("Successful tool sequence: {}", joined),
                confidence,
                frequency,
                examples,
                recommendations: vec![
                    format!("Consider using the sequence {} for similar problems", joined),
                    "This pattern has shown a high success rate in past executions".to_string(),
                ],
            });
        }
    }

    /// Tools that returned failure in failed traces; top three become patterns.
    fn failure_patterns(&self, traces: &[AgentTrace], out: &mut Vec<Pattern>) {
        let failed: Vec<&AgentTrace> = traces.iter().filter(|t| !t.success).collect();
        if failed.is_empty() {
            return;
        }

        let mut failure_points: HashMap<&str, usize> = HashMap::new();
        for trace in &failed {
            for tc in &trace.tool_calls {
                if !tc.success {
                    *failure_points.entry(tc.tool_name.as_str()).or_insert(0) += 1;
                }
            }
        }

        let mut ranked: Vec<(&str, usize)> = failure_points.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        for (tool_name, count) in ranked.into_iter().take(3) {
            let confidence = (count as f64 / failed.len() as f64).min(1.0);
            let examples = failed
                .iter()
                .filter(|t| t.tool_calls.iter().any(|tc| tc.tool_name == tool_name && !tc.success))
                .take(3)
                .map(|t| PatternExample {
                    trace_id: Some(t.trace_id.clone()),
                    problem_id: Some(t.problem_context.problem_id.clone()),
                    tool: Some(tool_name.to_string()),
                    success_rate: None,
                    avg_duration: None,
                    tool_sequence: Vec::new(),
                })
                .collect();

            out.push(Pattern {
                kind: PatternKind::FailurePattern,
                description: format!("Common failure point: {}", tool_name),
                confidence,
                frequency: count,
                examples,
                recommendations: vec![
                    format!("Review usage of the {} tool", tool_name),
                    "Consider adding error handling or validation before calling this tool".to_string(),
                    "Check if tool parameters are correctly formatted".to_string(),
                ],
            });
        }
    }

    /// Per-tool success-rate bands over at least three calls.
    fn tool_effectiveness(&self, traces: &[AgentTrace], out: &mut Vec<Pattern>) {
        struct ToolStats {
            total: usize,
            successful: usize,
            duration_sum: f64,
        }

        let mut stats: HashMap<&str, ToolStats> = HashMap::new();
        for trace in traces {
            for tc in &trace.tool_calls {
                let entry = stats.entry(tc.tool_name.as_str()).or_insert(ToolStats {
                    total: 0,
                    successful: 0,
                    duration_sum: 0.0,
                });
                entry.total += 1;
                if tc.success {
                    entry.successful += 1;
                }
                entry.duration_sum += tc.duration;
            }
        }

        let mut names: Vec<&&str> = stats.keys().collect();
        names.sort();
        for name in names {
            let s = &stats[*name];
            if s.total < 3 {
                continue;
            }
            let success_rate = s.successful as f64 / s.total as f64;
            let avg_duration = s.duration_sum / s.total as f64;
            let example = PatternExample {
                trace_id: None,
                problem_id: None,
                tool: Some(name.to_string()),
                success_rate: Some(success_rate),
                avg_duration: Some(avg_duration),
                tool_sequence: Vec::new(),
            };

            if success_rate > 0.8 {
                out.push(Pattern {
                    kind: PatternKind::ToolEffectiveness,
                    description: format!("Highly effective tool: {}", name),
                    confidence: success_rate,
                    frequency: s.total,
                    examples: vec![example],
                    recommendations: vec![
                        format!("Prioritize using {} when appropriate", name),
                        format!("This tool has a {:.0}% success rate", success_rate * 100.0),
                    ],
                });
            } else if success_rate < 0.5 {
                out.push(Pattern {
                    kind: PatternKind::ToolEffectiveness,
                    description: format!("Problematic tool: {}", name),
                    confidence: 1.0 - success_rate,
                    frequency: s.total,
                    examples: vec![example],
                    recommendations: vec![
                        format!("Use {} with caution", name),
                        "Consider alternative approaches or additional validation".to_string(),
                        format!("Current success rate is only {:.0}%", success_rate * 100.0),
                    ],
                });
            }
        }
    }

    /// Reasoning-length signal per tool choice.
    fn thinking_patterns(&self, traces: &[AgentTrace], out: &mut Vec<Pattern>) {
        struct ThinkingSample {
            words: usize,
            success: bool,
        }

        let mut by_choice: HashMap<&str, Vec<ThinkingSample>> = HashMap::new();
        for trace in traces {
            for step in &trace.thinking_steps {
                by_choice.entry(step.tool_choice.as_str()).or_default().push(ThinkingSample {
                    words: step.reasoning.split_whitespace().count(),
                    success: trace.success,
                });
            }
        }

        let mut choices: Vec<&&str> = by_choice.keys().collect();
        choices.sort();
        for choice in choices {
            let samples = &by_choice[*choice];
            if samples.len() < 3 {
                continue;
            }
            let successful: Vec<&ThinkingSample> = samples.iter().filter(|s| s.success).collect();
            if successful.is_empty() {
                continue;
            }
            let avg_words =
                successful.iter().map(|s| s.words as f64).sum::<f64>() / successful.len() as f64;
            if avg_words > 20.0 {
                out.push(Pattern {
                    kind: PatternKind::ThinkingPattern,
                    description: format!("Detailed reasoning improves success for {}", choice),
                    confidence: successful.len() as f64 / samples.len() as f64,
                    frequency: samples.len(),
                    examples: Vec::new(),
                    recommendations: vec![
                        format!("Encourage detailed reasoning when choosing {}", choice),
                        format!(
                            "Average reasoning length in successful cases: {:.1} words",
                            avg_words
                        ),
                    ],
                });
            }
        }
    }

    /// High tool usage per agent kind.
    fn performance_patterns(&self, traces: &[AgentTrace], out: &mut Vec<Pattern>) {
        for kind in AgentKind::ALL {
            let kind_traces: Vec<&AgentTrace> =
                traces.iter().filter(|t| t.agent_kind == kind).collect();
            if kind_traces.len() < 3 {
                continue;
            }
            let successful: Vec<&&AgentTrace> = kind_traces.iter().filter(|t| t.success).collect();
            if successful.is_empty() {
                continue;
            }
            let avg_tool_calls = successful
                .iter()
                .map(|t| t.performance_metrics.tool_call_count as f64)
                .sum::<f64>()
                / successful.len() as f64;

            if avg_tool_calls > self.config.high_tool_usage_threshold {
                out.push(Pattern {
                    kind: PatternKind::PerformanceOpt,
                    description: format!("High tool usage in {} agent", kind),
                    confidence: 0.8,
                    frequency: successful.len(),
                    examples: Vec::new(),
                    recommendations: vec![
                        format!("Consider optimizing the {} agent to reduce tool calls", kind),
                        "Look for opportunities to combine multiple tool calls".to_string(),
                        format!(
                            "Current average: {:.1} tool calls per successful execution",
                            avg_tool_calls
                        ),
                    ],
                });
            }
        }
    }
}

/// Patterns of a given kind.
pub fn by_kind(patterns: &[Pattern], kind: PatternKind) -> Vec<&Pattern> {
    patterns.iter().filter(|p| p.kind == kind).collect()
}

/// Patterns at or above a confidence floor.
pub fn high_confidence(patterns: &[Pattern], min_confidence: f64) -> Vec<&Pattern> {
    patterns.iter().filter(|p| p.confidence >= min_confidence).collect()
}

/// Count consecutive subsequences of length 2-5 across sequences, keeping
/// those seen at least `min_frequency` times, most frequent first.
fn common_subsequences(sequences: &[Vec<String>], min_frequency: usize) -> Vec<(Vec<String>, usize)> {
    let mut counts: HashMap<Vec<String>, usize> = HashMap::new();
    for sequence in sequences {
        let max_len = sequence.len().min(5);
        for length in 2..=max_len {
            for window in sequence.windows(length) {
                *counts.entry(window.to_vec()).or_insert(0) += 1;
            }
        }
    }
    let mut ranked: Vec<(Vec<String>, usize)> = counts
        .into_iter()
        .filter(|(_, count)| *count >= min_frequency)
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

fn contains_subsequence(sequence: &[String], pattern: &[String]) -> bool {
    if pattern.len() > sequence.len() {
        return false;
    }
    sequence.windows(pattern.len()).any(|w| w == pattern)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{ProblemContext, ToolCall};
    use chrono::Utc;
    use std::collections::HashMap as StdHashMap;

    fn trace(id: &str, kind: AgentKind, success: bool, tools: &[(&str, bool)]) -> AgentTrace {
        let ctx = ProblemContext::new("p1", "app", "ns", "desc");
        let mut t = AgentTrace::new(id.into(), kind, ctx);
        t.success = success;
        for (name, ok) in tools {
            t.tool_calls.push(ToolCall {
                tool_name: name.to_string(),
                arguments: StdHashMap::new(),
                timestamp: Utc::now(),
                success: *ok,
                response: String::new(),
                duration: 1.0,
            });
        }
        t.performance_metrics.tool_call_count = t.tool_calls.len();
        t
    }

    #[test]
    fn test_empty_input_yields_no_patterns() {
        assert!(PatternAnalyzer::new().analyze(&[]).is_empty());
    }

    #[test]
    fn test_success_sequences_need_two_occurrences() {
        let traces = vec![
            trace("a", AgentKind::Diagnosis, true, &[("get_services", true), ("get_metrics", true)]),
            trace("b", AgentKind::Diagnosis, true, &[("get_services", true), ("get_metrics", true)]),
        ];
        let patterns = PatternAnalyzer::new().analyze(&traces);
        let success = by_kind(&patterns, PatternKind::SuccessPattern);
        assert!(success
            .iter()
            .any(|p| p.description == "Successful tool sequence: get_services -> get_metrics"));
        assert!(success.iter().all(|p| p.frequency >= 2));
    }

    #[test]
    fn test_failure_points_ranked() {
        let traces = vec![
            trace("a", AgentKind::Mitigation, false, &[("exec_kubectl_cmd_safely", false)]),
            trace("b", AgentKind::Mitigation, false, &[("exec_kubectl_cmd_safely", false), ("get_metrics", false)]),
        ];
        let patterns = PatternAnalyzer::new().analyze(&traces);
        let failures = by_kind(&patterns, PatternKind::FailurePattern);
        assert_eq!(failures[0].description, "Common failure point: exec_kubectl_cmd_safely");
        assert_eq!(failures[0].frequency, 2);
        assert_eq!(failures[0].confidence, 1.0);
    }

    #[test]
    fn test_tool_effectiveness_requires_three_calls() {
        // Two calls only: below the minimum, no effectiveness pattern.
        let traces = vec![trace(
            "a",
            AgentKind::Diagnosis,
            true,
            &[("get_metrics", true), ("get_metrics", true)],
        )];
        let patterns = PatternAnalyzer::new().analyze(&traces);
        assert!(by_kind(&patterns, PatternKind::ToolEffectiveness).is_empty());

        // Three successful calls: highly effective.
        let traces = vec![trace(
            "a",
            AgentKind::Diagnosis,
            true,
            &[("get_metrics", true), ("get_metrics", true), ("get_metrics", true)],
        )];
        let patterns = PatternAnalyzer::new().analyze(&traces);
        let eff = by_kind(&patterns, PatternKind::ToolEffectiveness);
        assert_eq!(eff.len(), 1);
        assert_eq!(eff[0].description, "Highly effective tool: get_metrics");
    }

    #[test]
    fn test_problematic_tool_band() {
        let traces = vec![trace(
            "a",
            AgentKind::Diagnosis,
            false,
            &[("get_traces", false), ("get_traces", false), ("get_traces", true)],
        )];
        let patterns = PatternAnalyzer::new().analyze(&traces);
        let eff = by_kind(&patterns, PatternKind::ToolEffectiveness);
        assert_eq!(eff[0].description, "Problematic tool: get_traces");
        assert!((eff[0].confidence - (1.0 - 1.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn test_performance_pattern_over_threshold() {
        let tools: Vec<(&str, bool)> = (0..12).map(|_| ("get_metrics", true)).collect();
        let traces = vec![
            trace("a", AgentKind::Localization, true, &tools),
            trace("b", AgentKind::Localization, true, &tools),
            trace("c", AgentKind::Localization, true, &tools),
        ];
        let patterns = PatternAnalyzer::new().analyze(&traces);
        let perf = by_kind(&patterns, PatternKind::PerformanceOpt);
        assert_eq!(perf.len(), 1);
        assert!(perf[0].description.contains("localization"));
    }

    #[test]
    fn test_analyzer_is_deterministic() {
        let traces = vec![
            trace("a", AgentKind::Diagnosis, true, &[("get_services", true), ("get_metrics", true)]),
            trace("b", AgentKind::Diagnosis, true, &[("get_services", true), ("get_metrics", true)]),
            trace("c", AgentKind::Diagnosis, false, &[("get_traces", false)]),
        ];
        let analyzer = PatternAnalyzer::new();
        assert_eq!(analyzer.analyze(&traces), analyzer.analyze(&traces));
    }
}

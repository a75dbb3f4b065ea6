//! Trace record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::agent::AgentKind;

/// A single tool invocation recorded into a trace. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Tool name as exposed by the MCP surface
    pub tool_name: String,
    /// Argument mapping passed to the tool
    pub arguments: HashMap<String, Value>,
    /// Wall-clock time the call was issued
    pub timestamp: DateTime<Utc>,
    /// Whether the tool reported success
    pub success: bool,
    /// Textual response, possibly truncated by the caller
    pub response: String,
    /// Call duration in seconds
    pub duration: f64,
}

/// A reasoning step preceding a tool choice. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingStep {
    /// Free-text reasoning
    pub reasoning: String,
    /// Tool the agent chose next
    pub tool_choice: String,
    /// Why that tool was chosen
    pub justification: String,
    /// Wall-clock time of the step
    pub timestamp: DateTime<Utc>,
}

/// Immutable description of the problem a trace was recorded against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemContext {
    pub problem_id: String,
    pub app_name: String,
    pub app_namespace: String,
    pub app_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_state: Option<Value>,
}

impl ProblemContext {
    pub fn new(
        problem_id: impl Into<String>,
        app_name: impl Into<String>,
        app_namespace: impl Into<String>,
        app_description: impl Into<String>,
    ) -> Self {
        Self {
            problem_id: problem_id.into(),
            app_name: app_name.into(),
            app_namespace: app_namespace.into(),
            app_description: app_description.into(),
            fault_type: None,
            initial_state: None,
        }
    }

    pub fn with_fault_type(mut self, fault_type: impl Into<String>) -> Self {
        self.fault_type = Some(fault_type.into());
        self
    }

    pub fn with_initial_state(mut self, state: Value) -> Self {
        self.initial_state = Some(state);
        self
    }
}

/// Metrics computed when a trace is closed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// End-to-end duration in seconds
    pub total_duration: f64,
    pub tool_call_count: usize,
    pub thinking_step_count: usize,
    /// Fraction of tool calls that succeeded
    pub tool_success_rate: f64,
    /// Oracle accuracy for this stage, when available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_score: Option<f64>,
    /// Whether the oracle granted partial credit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_credit: Option<bool>,
    /// Extra metrics recorded while the trace was live
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, Value>,
}

/// Per-stage comparison of expected vs actual, derived at trace close.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageComparison {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra: Vec<Value>,
    pub success: bool,
    pub accuracy: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_credit: Option<bool>,
}

/// Ground-truth-enriched oracle results, keyed by lowercase stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnhancedOracleResults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detection: Option<StageComparison>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub localization: Option<StageComparison>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mitigation: Option<StageComparison>,
}

/// Raw oracle verdict for one stage, as returned by the judge (§6.2).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OracleStageResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_subset: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_oracles: Vec<Value>,
}

/// The ordered record of a single agent execution for one problem stage.
///
/// Owned by the [`super::TraceStore`]: created on `start_trace`, mutated only
/// through store operations, read-only after `end_trace`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTrace {
    pub trace_id: String,
    pub agent_kind: AgentKind,
    pub problem_context: ProblemContext,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_submission: Option<String>,
    /// Why the trace was aborted, when it did not run to completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub thinking_steps: Vec<ThinkingStep>,
    #[serde(default)]
    pub performance_metrics: PerformanceMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ground_truth: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oracle_results_enhanced: Option<EnhancedOracleResults>,
}

impl AgentTrace {
    pub(crate) fn new(trace_id: String, agent_kind: AgentKind, ctx: ProblemContext) -> Self {
        Self {
            trace_id,
            agent_kind,
            problem_context: ctx,
            start_time: Utc::now(),
            end_time: None,
            success: false,
            final_submission: None,
            error: None,
            tool_calls: Vec::new(),
            thinking_steps: Vec::new(),
            performance_metrics: PerformanceMetrics::default(),
            ground_truth: None,
            oracle_results_enhanced: None,
        }
    }

    /// Tool names in call order.
    pub fn tool_names(&self) -> Vec<&str> {
        self.tool_calls.iter().map(|tc| tc.tool_name.as_str()).collect()
    }

    /// Whether the trace has been closed.
    pub fn is_closed(&self) -> bool {
        self.end_time.is_some()
    }

    /// Reasoning plus justification text for every thinking step.
    pub fn reasoning_texts(&self) -> Vec<String> {
        self.thinking_steps
            .iter()
            .map(|ts| format!("{} {}", ts.reasoning, ts.justification))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_context() -> ProblemContext {
        ProblemContext::new("network_policy_block", "astronomy-shop", "astro", "policy block")
            .with_fault_type("network_policy_block")
    }

    #[test]
    fn test_trace_roundtrip_preserves_sequences() {
        let mut trace = AgentTrace::new("t-1".into(), AgentKind::Diagnosis, sample_context());
        trace.tool_calls.push(ToolCall {
            tool_name: "get_metrics".into(),
            arguments: HashMap::from([("service".to_string(), Value::from("ad"))]),
            timestamp: Utc::now(),
            success: true,
            response: "ok".into(),
            duration: 0.4,
        });
        trace.thinking_steps.push(ThinkingStep {
            reasoning: "check metrics first".into(),
            tool_choice: "get_metrics".into(),
            justification: "cheap signal".into(),
            timestamp: Utc::now(),
        });

        let json = serde_json::to_string(&trace).unwrap();
        let back: AgentTrace = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tool_calls, trace.tool_calls);
        assert_eq!(back.thinking_steps, trace.thinking_steps);
        assert_eq!(back.agent_kind, AgentKind::Diagnosis);
    }

    #[test]
    fn test_tool_names_in_order() {
        let mut trace = AgentTrace::new("t-2".into(), AgentKind::Localization, sample_context());
        for name in ["get_services", "get_metrics"] {
            trace.tool_calls.push(ToolCall {
                tool_name: name.into(),
                arguments: HashMap::new(),
                timestamp: Utc::now(),
                success: true,
                response: String::new(),
                duration: 0.1,
            });
        }
        assert_eq!(trace.tool_names(), vec!["get_services", "get_metrics"]);
    }
}

//! Persistence and query layer for agent traces.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::agent::AgentKind;
use crate::error::{Error, Result};

use super::types::{
    AgentTrace, EnhancedOracleResults, OracleStageResult, ProblemContext, StageComparison,
    ThinkingStep, ToolCall,
};

/// Filter for loading traces from storage.
#[derive(Debug, Clone, Default)]
pub struct TraceFilter {
    pub agent_kind: Option<AgentKind>,
    pub problem_id: Option<String>,
    /// Only traces started at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Only traces started at or before this instant
    pub until: Option<DateTime<Utc>>,
    /// Newest-first cutoff applied after filtering
    pub limit: Option<usize>,
    /// Also scan directories registered via `TraceStore::with_historical_dir`
    pub include_historical: bool,
}

impl TraceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: AgentKind) -> Self {
        self.agent_kind = Some(kind);
        self
    }

    pub fn problem(mut self, problem_id: impl Into<String>) -> Self {
        self.problem_id = Some(problem_id.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, trace: &AgentTrace) -> bool {
        if let Some(kind) = self.agent_kind {
            if trace.agent_kind != kind {
                return false;
            }
        }
        if let Some(ref problem_id) = self.problem_id {
            if &trace.problem_context.problem_id != problem_id {
                return false;
            }
        }
        if let Some(since) = self.since {
            if trace.start_time < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if trace.start_time > until {
                return false;
            }
        }
        true
    }
}

/// Aggregate statistics over a set of stored traces.
#[derive(Debug, Clone, Default)]
pub struct TraceStats {
    pub total_traces: usize,
    pub successful_traces: usize,
    pub success_rate: f64,
    pub avg_duration: f64,
    pub avg_tool_calls: f64,
    /// Tool name to call count, most used first
    pub most_used_tools: Vec<(String, usize)>,
    /// Common tool-name prefixes of failed traces, most frequent first
    pub common_failure_prefixes: Vec<Vec<String>>,
}

/// Record-of-truth for agent executions within a learning round.
///
/// Live traces are held in memory and mutated only through store
/// operations; `end_trace` computes metrics, writes the trace to the
/// round's storage directory, and freezes it. Distinct trace ids can be
/// appended to concurrently; the live map itself is the only shared state.
pub struct TraceStore {
    storage_dir: PathBuf,
    historical_dirs: Vec<PathBuf>,
    live: Mutex<HashMap<String, AgentTrace>>,
}

impl TraceStore {
    /// Create a store writing into `storage_dir`, creating it if needed.
    pub fn new(storage_dir: impl Into<PathBuf>) -> Result<Self> {
        let storage_dir = storage_dir.into();
        fs::create_dir_all(&storage_dir)?;
        Ok(Self {
            storage_dir,
            historical_dirs: Vec::new(),
            live: Mutex::new(HashMap::new()),
        })
    }

    /// Register a previous round's trace directory for historical loads.
    pub fn with_historical_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.historical_dirs.push(dir.into());
        self
    }

    /// Directory this round's traces are persisted into.
    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Start a new live trace.
    pub async fn start_trace(
        &self,
        trace_id: impl Into<String>,
        kind: AgentKind,
        ctx: ProblemContext,
    ) -> Result<AgentTrace> {
        let trace_id = trace_id.into();
        let mut live = self.live.lock().await;
        if live.contains_key(&trace_id) {
            return Err(Error::DuplicateTrace(trace_id));
        }
        let trace = AgentTrace::new(trace_id.clone(), kind, ctx);
        live.insert(trace_id.clone(), trace.clone());
        info!("Started trace {} for {} agent", trace_id, kind);
        Ok(trace)
    }

    /// Append a tool call to a live trace.
    pub async fn add_tool_call(&self, trace_id: &str, call: ToolCall) -> Result<()> {
        let mut live = self.live.lock().await;
        let trace = live
            .get_mut(trace_id)
            .ok_or_else(|| Error::UnknownTrace(trace_id.to_string()))?;
        trace.tool_calls.push(call);
        Ok(())
    }

    /// Append a thinking step to a live trace.
    pub async fn add_thinking_step(&self, trace_id: &str, step: ThinkingStep) -> Result<()> {
        let mut live = self.live.lock().await;
        let trace = live
            .get_mut(trace_id)
            .ok_or_else(|| Error::UnknownTrace(trace_id.to_string()))?;
        trace.thinking_steps.push(step);
        Ok(())
    }

    /// Record an ad-hoc metric on a live trace.
    pub async fn add_performance_metric(
        &self,
        trace_id: &str,
        name: impl Into<String>,
        value: Value,
    ) -> Result<()> {
        let mut live = self.live.lock().await;
        let trace = live
            .get_mut(trace_id)
            .ok_or_else(|| Error::UnknownTrace(trace_id.to_string()))?;
        trace.performance_metrics.extra.insert(name.into(), value);
        Ok(())
    }

    /// Snapshot of a live trace, if any.
    pub async fn get_trace(&self, trace_id: &str) -> Option<AgentTrace> {
        self.live.lock().await.get(trace_id).cloned()
    }

    /// Ids of all currently live traces.
    pub async fn live_trace_ids(&self) -> Vec<String> {
        self.live.lock().await.keys().cloned().collect()
    }

    /// Close a live trace: compute metrics, persist, remove from live set.
    pub async fn end_trace(
        &self,
        trace_id: &str,
        success: bool,
        final_submission: Option<String>,
        ground_truth: Option<Value>,
        oracle_results: Option<HashMap<String, OracleStageResult>>,
    ) -> Result<AgentTrace> {
        let mut trace = {
            let mut live = self.live.lock().await;
            live.remove(trace_id)
                .ok_or_else(|| Error::UnknownTrace(trace_id.to_string()))?
        };

        trace.end_time = Some(Utc::now());
        trace.success = success;
        trace.final_submission = final_submission;

        if let (Some(gt), Some(oracle)) = (ground_truth.as_ref(), oracle_results.as_ref()) {
            trace.oracle_results_enhanced = Some(enhance_oracle_results(oracle, gt, &trace));
        }
        trace.ground_truth = ground_truth;

        let metrics = &mut trace.performance_metrics;
        metrics.total_duration = (trace.end_time.unwrap() - trace.start_time)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        metrics.tool_call_count = trace.tool_calls.len();
        metrics.thinking_step_count = trace.thinking_steps.len();
        metrics.tool_success_rate = trace.tool_calls.iter().filter(|tc| tc.success).count() as f64
            / trace.tool_calls.len().max(1) as f64;

        if let Some(ref enhanced) = trace.oracle_results_enhanced {
            let stage = match trace.agent_kind {
                AgentKind::Diagnosis => enhanced.detection.as_ref(),
                AgentKind::Localization => enhanced.localization.as_ref(),
                AgentKind::Mitigation | AgentKind::Rollback => enhanced.mitigation.as_ref(),
            };
            if let Some(cmp) = stage {
                trace.performance_metrics.accuracy_score = Some(cmp.accuracy);
                trace.performance_metrics.partial_credit = cmp.partial_credit;
            }
        }

        self.save_trace(&trace)?;
        info!("Ended trace {} - success: {}", trace_id, success);
        Ok(trace)
    }

    /// Close a live trace that did not run to completion (cancellation,
    /// timeout, runtime failure), recording the reason and persisting what
    /// was captured so far.
    pub async fn abort_trace(&self, trace_id: &str, reason: &str) -> Result<AgentTrace> {
        let mut trace = {
            let mut live = self.live.lock().await;
            live.remove(trace_id)
                .ok_or_else(|| Error::UnknownTrace(trace_id.to_string()))?
        };

        trace.end_time = Some(Utc::now());
        trace.success = false;
        trace.error = Some(reason.to_string());
        trace.performance_metrics.total_duration = (trace.end_time.unwrap() - trace.start_time)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        trace.performance_metrics.tool_call_count = trace.tool_calls.len();
        trace.performance_metrics.thinking_step_count = trace.thinking_steps.len();
        trace.performance_metrics.tool_success_rate =
            trace.tool_calls.iter().filter(|tc| tc.success).count() as f64
                / trace.tool_calls.len().max(1) as f64;

        self.save_trace(&trace)?;
        warn!("Aborted trace {}: {}", trace_id, reason);
        Ok(trace)
    }

    fn save_trace(&self, trace: &AgentTrace) -> Result<()> {
        let timestamp = trace.start_time.format("%Y%m%d_%H%M%S");
        let filename = format!(
            "{}_{}_{}_{}.json",
            trace.agent_kind,
            trace.problem_context.problem_id,
            timestamp,
            trace.trace_id
        );
        let path = self.storage_dir.join(filename);
        let json = serde_json::to_string_pretty(trace)?;
        fs::write(&path, json)
            .map_err(|e| Error::storage(format!("failed to write trace to '{}': {}", path.display(), e)))?;
        debug!("Saved trace to {}", path.display());
        Ok(())
    }

    /// Load closed traces from storage, newest first.
    ///
    /// Unreadable or malformed files are skipped with a warning; read errors
    /// on the directory itself are surfaced.
    pub fn load_traces(&self, filter: &TraceFilter) -> Result<Vec<AgentTrace>> {
        let mut dirs = vec![self.storage_dir.clone()];
        if filter.include_historical {
            dirs.extend(self.historical_dirs.iter().cloned());
        }

        let mut traces = Vec::new();
        for dir in dirs {
            let pattern = dir.join("*.json");
            let entries = glob::glob(&pattern.to_string_lossy())
                .map_err(|e| Error::storage(format!("bad trace glob: {}", e)))?;
            for entry in entries {
                let path = entry.map_err(|e| Error::storage(format!("unreadable trace entry: {}", e)))?;
                let contents = match fs::read_to_string(&path) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("Failed to read trace from {}: {}", path.display(), e);
                        continue;
                    }
                };
                let trace: AgentTrace = match serde_json::from_str(&contents) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("Failed to parse trace from {}: {}", path.display(), e);
                        continue;
                    }
                };
                if filter.matches(&trace) {
                    traces.push(trace);
                }
            }
        }

        traces.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        if let Some(limit) = filter.limit {
            traces.truncate(limit);
        }
        Ok(traces)
    }

    /// Aggregate statistics over stored traces matching `filter`.
    pub fn statistics(&self, filter: &TraceFilter) -> Result<TraceStats> {
        let traces = self.load_traces(filter)?;
        if traces.is_empty() {
            return Ok(TraceStats::default());
        }

        let successful = traces.iter().filter(|t| t.success).count();
        let avg_duration = traces
            .iter()
            .map(|t| t.performance_metrics.total_duration)
            .sum::<f64>()
            / traces.len() as f64;
        let avg_tool_calls = traces
            .iter()
            .map(|t| t.performance_metrics.tool_call_count as f64)
            .sum::<f64>()
            / traces.len() as f64;

        let mut tool_usage: HashMap<String, usize> = HashMap::new();
        for trace in &traces {
            for tc in &trace.tool_calls {
                *tool_usage.entry(tc.tool_name.clone()).or_insert(0) += 1;
            }
        }
        let mut most_used_tools: Vec<(String, usize)> = tool_usage.into_iter().collect();
        most_used_tools.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let failed_sequences: Vec<Vec<String>> = traces
            .iter()
            .filter(|t| !t.success)
            .map(|t| t.tool_names().into_iter().map(String::from).collect())
            .collect();
        let common_failure_prefixes = common_prefixes(&failed_sequences, 2);

        Ok(TraceStats {
            total_traces: traces.len(),
            successful_traces: successful,
            success_rate: successful as f64 / traces.len() as f64,
            avg_duration,
            avg_tool_calls,
            most_used_tools,
            common_failure_prefixes,
        })
    }
}

/// Find tool-name prefixes shared by more than one failed sequence.
fn common_prefixes(sequences: &[Vec<String>], min_length: usize) -> Vec<Vec<String>> {
    let mut prefix_counts: HashMap<Vec<String>, usize> = HashMap::new();
    for sequence in sequences {
        for len in min_length..=sequence.len() {
            let prefix = sequence[..len].to_vec();
            *prefix_counts.entry(prefix).or_insert(0) += 1;
        }
    }
    let mut prefixes: Vec<(Vec<String>, usize)> = prefix_counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .collect();
    prefixes.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    prefixes.into_iter().take(5).map(|(p, _)| p).collect()
}

/// Enrich raw oracle verdicts with ground-truth set differences.
fn enhance_oracle_results(
    oracle: &HashMap<String, OracleStageResult>,
    ground_truth: &Value,
    trace: &AgentTrace,
) -> EnhancedOracleResults {
    let mut enhanced = EnhancedOracleResults::default();

    // Detection ("Diagnosis" accepted as an alias stage key)
    let detection = oracle.get("Detection").or_else(|| oracle.get("Diagnosis"));
    if let (Some(result), Some(gt)) = (detection, ground_truth.get("detection")) {
        enhanced.detection = Some(StageComparison {
            expected: gt.get("expected").cloned(),
            actual: trace
                .final_submission
                .as_ref()
                .map(|s| Value::from(s.trim())),
            missing: Vec::new(),
            extra: Vec::new(),
            success: result.success,
            accuracy: result.accuracy.unwrap_or(0.0),
            partial_credit: None,
        });
    }

    if let (Some(result), Some(gt)) = (oracle.get("Localization"), ground_truth.get("localization")) {
        let expected = value_as_string_list(gt.get("expected"));
        let submitted = submitted_services(trace, result);

        let expected_lower: Vec<String> = expected.iter().map(|s| s.to_lowercase()).collect();
        let submitted_lower: Vec<String> = submitted.iter().map(|s| s.to_lowercase()).collect();
        let missing: Vec<Value> = expected
            .iter()
            .filter(|s| !submitted_lower.contains(&s.to_lowercase()))
            .map(|s| Value::from(s.as_str()))
            .collect();
        let extra: Vec<Value> = submitted
            .iter()
            .filter(|s| !expected_lower.contains(&s.to_lowercase()))
            .map(|s| Value::from(s.as_str()))
            .collect();

        enhanced.localization = Some(StageComparison {
            expected: Some(Value::from(expected)),
            actual: Some(Value::from(submitted)),
            missing,
            extra,
            success: result.success,
            accuracy: result.accuracy.unwrap_or(0.0),
            partial_credit: result.is_subset,
        });
    }

    if let (Some(result), Some(gt)) = (oracle.get("Mitigation"), ground_truth.get("mitigation")) {
        enhanced.mitigation = Some(StageComparison {
            expected: gt.get("description").cloned(),
            actual: None,
            missing: Vec::new(),
            extra: Vec::new(),
            success: result.success,
            accuracy: result.accuracy.unwrap_or(0.0),
            partial_credit: None,
        });
    }

    enhanced
}

fn value_as_string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Services the agent claimed, parsed from its submission or the oracle echo.
fn submitted_services(trace: &AgentTrace, result: &OracleStageResult) -> Vec<String> {
    if let Some(submission) = trace.final_submission.as_deref() {
        let submission = submission.trim();
        if submission.contains(',') {
            return submission.split(',').map(|s| s.trim().to_string()).collect();
        }
        if !submission.is_empty() {
            return vec![submission.to_string()];
        }
    }
    match result.submitted.as_ref() {
        Some(Value::String(s)) => s.split(',').map(|p| p.trim().to_string()).collect(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn ctx(problem: &str) -> ProblemContext {
        ProblemContext::new(problem, "hotel-res", "hotel", "test problem")
    }

    fn call(name: &str, success: bool) -> ToolCall {
        ToolCall {
            tool_name: name.into(),
            arguments: HashMap::new(),
            timestamp: Utc::now(),
            success,
            response: "resp".into(),
            duration: 0.2,
        }
    }

    #[tokio::test]
    async fn test_start_trace_rejects_duplicates() {
        let dir = tempdir().unwrap();
        let store = TraceStore::new(dir.path()).unwrap();

        store
            .start_trace("dup", AgentKind::Diagnosis, ctx("p1"))
            .await
            .unwrap();
        let err = store
            .start_trace("dup", AgentKind::Diagnosis, ctx("p1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateTrace(_)));
    }

    #[tokio::test]
    async fn test_append_to_unknown_trace_fails() {
        let dir = tempdir().unwrap();
        let store = TraceStore::new(dir.path()).unwrap();
        let err = store.add_tool_call("missing", call("get_metrics", true)).await.unwrap_err();
        assert!(matches!(err, Error::UnknownTrace(_)));
    }

    #[tokio::test]
    async fn test_end_trace_computes_metrics_and_persists() {
        let dir = tempdir().unwrap();
        let store = TraceStore::new(dir.path()).unwrap();

        store
            .start_trace("t1", AgentKind::Diagnosis, ctx("p1"))
            .await
            .unwrap();
        store.add_tool_call("t1", call("get_metrics", true)).await.unwrap();
        store.add_tool_call("t1", call("get_traces", false)).await.unwrap();

        let trace = store
            .end_trace("t1", true, Some("Yes".into()), None, None)
            .await
            .unwrap();

        assert!(trace.end_time.is_some());
        assert_eq!(trace.performance_metrics.tool_call_count, 2);
        assert_eq!(trace.performance_metrics.tool_success_rate, 0.5);
        assert!(store.get_trace("t1").await.is_none());

        let loaded = store.load_traces(&TraceFilter::new()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].tool_calls, trace.tool_calls);
        assert_eq!(loaded[0].thinking_steps, trace.thinking_steps);
    }

    #[tokio::test]
    async fn test_load_traces_filters_by_kind_and_problem() {
        let dir = tempdir().unwrap();
        let store = TraceStore::new(dir.path()).unwrap();

        for (id, kind, problem) in [
            ("a", AgentKind::Diagnosis, "p1"),
            ("b", AgentKind::Localization, "p1"),
            ("c", AgentKind::Diagnosis, "p2"),
        ] {
            store.start_trace(id, kind, ctx(problem)).await.unwrap();
            store.end_trace(id, true, None, None, None).await.unwrap();
        }

        let diag = store
            .load_traces(&TraceFilter::new().kind(AgentKind::Diagnosis))
            .unwrap();
        assert_eq!(diag.len(), 2);

        let p1_diag = store
            .load_traces(&TraceFilter::new().kind(AgentKind::Diagnosis).problem("p1"))
            .unwrap();
        assert_eq!(p1_diag.len(), 1);
        assert_eq!(p1_diag[0].trace_id, "a");
    }

    #[tokio::test]
    async fn test_statistics_counts_tools_and_failure_prefixes() {
        let dir = tempdir().unwrap();
        let store = TraceStore::new(dir.path()).unwrap();

        for id in ["f1", "f2"] {
            store.start_trace(id, AgentKind::Mitigation, ctx("p1")).await.unwrap();
            store.add_tool_call(id, call("exec_kubectl_cmd_safely", false)).await.unwrap();
            store.add_tool_call(id, call("get_metrics", true)).await.unwrap();
            store.end_trace(id, false, None, None, None).await.unwrap();
        }

        let stats = store.statistics(&TraceFilter::new()).unwrap();
        assert_eq!(stats.total_traces, 2);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.most_used_tools[0].1, 2);
        assert_eq!(
            stats.common_failure_prefixes[0],
            vec!["exec_kubectl_cmd_safely".to_string(), "get_metrics".to_string()]
        );
    }

    #[tokio::test]
    async fn test_enhanced_oracle_results_for_localization() {
        let dir = tempdir().unwrap();
        let store = TraceStore::new(dir.path()).unwrap();

        store
            .start_trace("loc", AgentKind::Localization, ctx("p1"))
            .await
            .unwrap();

        let ground_truth = serde_json::json!({
            "localization": {"expected": ["frontend", "cartservice"]}
        });
        let oracle = HashMap::from([(
            "Localization".to_string(),
            OracleStageResult {
                success: false,
                accuracy: Some(50.0),
                is_subset: Some(true),
                ..Default::default()
            },
        )]);

        let trace = store
            .end_trace("loc", false, Some("frontend, adservice".into()), Some(ground_truth), Some(oracle))
            .await
            .unwrap();

        let loc = trace.oracle_results_enhanced.unwrap().localization.unwrap();
        assert_eq!(loc.missing, vec![Value::from("cartservice")]);
        assert_eq!(loc.extra, vec![Value::from("adservice")]);
        assert_eq!(loc.partial_credit, Some(true));
        assert_eq!(trace.performance_metrics.accuracy_score, Some(50.0));
    }
}

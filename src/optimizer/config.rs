//! LLM-driven tuning of scalar agent knobs.

use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::agent::AgentKind;
use crate::error::Result;
use crate::llm::{extract_json_object, retry_with_backoff, CancelFlag, LlmClient};
use crate::trace::AgentTrace;

use super::reward::RewardSpec;

/// Proposes changes to per-agent tuning snapshots (e.g. max steps per
/// stage). Lower stakes than prompt optimization: a failed call just keeps
/// the current config.
pub struct ConfigOptimizer {
    llm: Arc<dyn LlmClient>,
    reward_spec: RewardSpec,
    cancel: CancelFlag,
}

impl ConfigOptimizer {
    pub fn new(llm: Arc<dyn LlmClient>, reward_spec: RewardSpec) -> Self {
        Self {
            llm,
            reward_spec,
            cancel: CancelFlag::never(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Optimize a tuning snapshot against trace step usage.
    ///
    /// The reply is merged over the current config; fields the LLM does not
    /// mention are preserved unchanged.
    pub async fn optimize(
        &self,
        kind: AgentKind,
        current: &Map<String, Value>,
        traces: &[AgentTrace],
    ) -> Result<Map<String, Value>> {
        let usage = StepUsage::compute(current, traces);
        let prompt = self.build_prompt(kind, current, &usage);

        let response = retry_with_backoff(3, Duration::from_secs(2), &self.cancel, || {
            self.llm.infer(std::slice::from_ref(&prompt), None)
        })
        .await;

        let text = match response {
            Ok(text) => text,
            Err(crate::error::Error::Cancelled) => return Err(crate::error::Error::Cancelled),
            Err(e) => {
                warn!("Config optimization failed for {}, keeping current: {}", kind, e);
                return Ok(current.clone());
            }
        };

        let proposed = extract_json_object(&text)
            .and_then(|v| v.get("optimized_config").cloned())
            .and_then(|v| v.as_object().cloned());

        match proposed {
            Some(proposed) => {
                let mut merged = current.clone();
                for (key, value) in proposed {
                    merged.insert(key, value);
                }
                info!("LLM optimized config for {}", kind);
                Ok(merged)
            }
            None => {
                warn!("Unparseable config optimization reply for {}, keeping current", kind);
                Ok(current.clone())
            }
        }
    }

    fn build_prompt(&self, kind: AgentKind, current: &Map<String, Value>, usage: &StepUsage) -> String {
        format!(
            r#"You are optimizing the configuration for a {kind} agent in a Kubernetes SRE system.

## Current Configuration
```json
{current}
```

## Configuration Usage Analysis
- Average steps taken: {avg:.1}
- Maximum steps taken: {max}
- Minimum steps taken: {min}
- Successful runs within current limits: {within}
- Failures potentially due to step limits: {at_limit}

## Optimization Goals
- Success weight: {sw} (maximize)
- Latency weight: {lw} (minimize, negative weight)
- Attempts weight: {aw} (minimize, negative weight)

Allow sufficient steps for success, avoid unnecessary headroom.

Respond with ONLY a JSON object in this exact format:
```json
{{
  "optimized_config": {{
    "max_step": 20
  }}
}}
```"#,
            kind = kind,
            current = serde_json::to_string_pretty(current).unwrap_or_default(),
            avg = usage.avg_steps,
            max = usage.max_steps,
            min = usage.min_steps,
            within = usage.successes_within_limit,
            at_limit = usage.failures_at_limit,
            sw = self.reward_spec.success_weight,
            lw = self.reward_spec.latency_weight,
            aw = self.reward_spec.attempts_weight,
        )
    }
}

/// How the current step limit was exercised by a round's traces.
struct StepUsage {
    avg_steps: f64,
    max_steps: usize,
    min_steps: usize,
    successes_within_limit: usize,
    failures_at_limit: usize,
}

impl StepUsage {
    fn compute(current: &Map<String, Value>, traces: &[AgentTrace]) -> Self {
        let max_step = current
            .get("max_step")
            .and_then(|v| v.as_u64())
            .unwrap_or(20) as usize;

        let counts: Vec<usize> = traces.iter().map(|t| t.tool_calls.len()).collect();
        let mut successes_within_limit = 0;
        let mut failures_at_limit = 0;
        for trace in traces {
            let steps = trace.tool_calls.len();
            if steps >= max_step {
                if !trace.success {
                    failures_at_limit += 1;
                }
            } else if trace.success {
                successes_within_limit += 1;
            }
        }

        Self {
            avg_steps: if counts.is_empty() {
                0.0
            } else {
                counts.iter().sum::<usize>() as f64 / counts.len() as f64
            },
            max_steps: counts.iter().copied().max().unwrap_or(0),
            min_steps: counts.iter().copied().min().unwrap_or(0),
            successes_within_limit,
            failures_at_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use crate::trace::ProblemContext;
    use serde_json::json;

    fn current_config() -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("max_step".into(), json!(20));
        map.insert("max_retry_attempts".into(), json!(10));
        map.insert("custom_knob".into(), json!("opaque"));
        map
    }

    fn empty_trace() -> AgentTrace {
        AgentTrace::new(
            "t1".into(),
            AgentKind::Diagnosis,
            ProblemContext::new("p1", "app", "ns", "desc"),
        )
    }

    #[tokio::test]
    async fn test_merge_preserves_unknown_fields() {
        let llm = Arc::new(MockLlm::new().reply(r#"{"optimized_config": {"max_step": 30}}"#));
        let optimizer = ConfigOptimizer::new(llm, RewardSpec::default());

        let merged = optimizer
            .optimize(AgentKind::Diagnosis, &current_config(), &[empty_trace()])
            .await
            .unwrap();

        assert_eq!(merged["max_step"], json!(30));
        assert_eq!(merged["max_retry_attempts"], json!(10));
        assert_eq!(merged["custom_knob"], json!("opaque"));
    }

    #[tokio::test]
    async fn test_unparseable_reply_keeps_current() {
        let llm = Arc::new(MockLlm::new().reply("nah"));
        let optimizer = ConfigOptimizer::new(llm, RewardSpec::default());

        let merged = optimizer
            .optimize(AgentKind::Diagnosis, &current_config(), &[empty_trace()])
            .await
            .unwrap();
        assert_eq!(Value::Object(merged), Value::Object(current_config()));
    }

    #[tokio::test]
    async fn test_llm_error_keeps_current() {
        let llm = Arc::new(MockLlm::new().error(crate::error::Error::Llm("down".into())));
        let optimizer = ConfigOptimizer::new(llm, RewardSpec::default());

        let merged = optimizer
            .optimize(AgentKind::Diagnosis, &current_config(), &[empty_trace()])
            .await
            .unwrap();
        assert_eq!(merged["max_step"], json!(20));
    }
}

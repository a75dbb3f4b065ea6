//! Thin contracts for the external collaborators.
//!
//! The cluster, fault injectors, the agent pipeline, and the oracle are
//! external systems with fixed interfaces; the core only ever talks to them
//! through these traits. Implementations live with the deployment, not
//! here.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use crate::agent::AgentKind;
use crate::error::Result;
use crate::trace::OracleStageResult;

/// Oracle stage keys used by the core. `Diagnosis` is accepted as an alias
/// for `Detection` when reading oracle replies.
pub const STAGE_KEYS: &[&str] = &["Detection", "Localization", "Mitigation", "NOOP Detection"];

/// Judge for agent submissions, one verdict per stage.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Evaluate the final submissions of a problem run. Keys of the result
    /// are stage keys (see [`STAGE_KEYS`]).
    async fn evaluate(
        &self,
        problem_id: &str,
        submissions: &HashMap<AgentKind, String>,
    ) -> Result<HashMap<String, OracleStageResult>>;

    /// Ground-truth object for a problem, if one is published.
    async fn ground_truth(&self, problem_id: &str) -> Result<Option<Value>>;
}

/// Stage-transition signal observed while the agent pipeline runs.
pub trait StageObserver: Send + Sync {
    /// Called whenever the runtime hands control to another agent kind.
    fn on_stage(&self, kind: AgentKind);
}

/// The external agent pipeline that actually solves problems.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Run the full pipeline for one problem to completion, reporting stage
    /// transitions through `observer` as they happen. Returns the final
    /// submission per stage that produced one.
    async fn run_problem(
        &self,
        problem_id: &str,
        observer: &dyn StageObserver,
    ) -> Result<HashMap<AgentKind, String>>;
}

/// Injects and clears cluster faults for a problem.
#[async_trait]
pub trait FaultInjector: Send + Sync {
    async fn inject(&self, problem_id: &str) -> Result<()>;
    async fn clear(&self, problem_id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_verdict_deserializes_minimal_reply() {
        let verdict: OracleStageResult = serde_json::from_str(r#"{"success": true}"#).unwrap();
        assert!(verdict.success);
        assert!(verdict.accuracy.is_none());
        assert!(verdict.sub_oracles.is_empty());
    }

    #[test]
    fn test_stage_verdict_full_reply() {
        let verdict: OracleStageResult = serde_json::from_str(
            r#"{"success": false, "accuracy": 50.0, "expected": ["a", "b"], "is_subset": true}"#,
        )
        .unwrap();
        assert_eq!(verdict.accuracy, Some(50.0));
        assert_eq!(verdict.is_subset, Some(true));
    }
}

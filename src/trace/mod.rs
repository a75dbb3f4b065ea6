//! Agent execution traces and their record-of-truth store.
//!
//! A trace is the ordered record of a single agent's execution for a single
//! problem stage: every tool call, every reasoning step, the final
//! submission, and the oracle verdict. Traces are mutable only while live in
//! the [`TraceStore`]; closing a trace computes its metrics, persists it as
//! one self-describing JSON file, and freezes it.

mod store;
mod types;

pub use store::{TraceFilter, TraceStats, TraceStore};
pub use types::{
    AgentTrace, EnhancedOracleResults, OracleStageResult, PerformanceMetrics, ProblemContext,
    StageComparison, ThinkingStep, ToolCall,
};

//! Pattern mining over closed traces.
//!
//! The analyzer derives success, failure, tool-effectiveness, reasoning and
//! performance signals from a round's traces. It is deterministic given its
//! input and has no side effects; everything downstream (guideline
//! generation, LLM optimization) consumes its typed output.

mod analyzer;

pub use analyzer::{
    by_kind, high_confidence, AnalyzerConfig, Pattern, PatternAnalyzer, PatternExample, PatternKind,
};

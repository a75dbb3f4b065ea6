//! Point-based prompt management.
//!
//! Every piece of learned guidance is a discrete, uniquely identified
//! "point" that is individually tracked, validated against traces,
//! conflict-checked, and garbage-collected when it keeps failing. Original
//! authored prompts are never converted to points; all learning accumulates
//! as points rendered into an appended section.

mod conflict;
mod manager;
mod render;
mod tools;
mod types;
mod usage;

pub use conflict::{ConflictConfig, ConflictDetector};
pub use manager::{AddOutcome, PointManager, ToolSuccessPolicy};
pub use render::{rebuild_prompt, strip_learned_section, LEARNED_SECTION_HEADER};
pub use tools::resolve_tool_name;
pub use types::{Insight, InsightKind, PointCategory, PointSource, PromptPoint};
pub use usage::{UsageConfig, UsageDetector, UsageMode};

//! # sremeta-core
//!
//! A closed-loop meta-learning library for Kubernetes-focused SRE agent
//! fleets. A pool of task agents (diagnosis, localization, mitigation,
//! rollback) solves injected cluster faults through a bounded tool surface;
//! this crate observes their executions, learns which instructions actually
//! help, and rewrites the agents' prompts between rounds.
//!
//! ## Core Components
//!
//! - **Trace store**: record-of-truth for agent executions
//! - **Pattern analyzer**: deterministic signals mined from traces
//! - **Point manager**: the canonical, validated instruction set per agent
//!   kind, with conflict detection and garbage collection
//! - **Guideline generator**: insights in, points and rebuilt prompts out
//! - **LLM optimizer**: reward-driven insight proposals
//! - **Learning orchestrator**: the multi-round loop tying it together
//!
//! ## Example
//!
//! ```rust,ignore
//! use sremeta_core::{
//!     GuidelineGenerator, LearningOrchestrator, OrchestratorConfig, ProblemSpec,
//! };
//!
//! let generator = GuidelineGenerator::new(base_prompts)?;
//! let orchestrator = LearningOrchestrator::new(
//!     OrchestratorConfig::default(),
//!     generator,
//!     oracle,
//!     runtime,
//!     vec![ProblemSpec::new("network_policy_block", "Network Policy Block", "...")],
//! );
//! mcp_surface.attach(orchestrator.interceptor());
//! let summary = orchestrator.run().await?;
//! ```

pub mod adapters;
pub mod agent;
pub mod cli;
pub mod error;
pub mod guideline;
pub mod interceptor;
pub mod llm;
pub mod optimizer;
pub mod orchestrator;
pub mod patterns;
pub mod points;
pub mod trace;

// Re-exports for convenience
pub use adapters::{AgentRuntime, FaultInjector, Oracle, StageObserver, STAGE_KEYS};
pub use agent::AgentKind;
pub use cli::{exit_code, parse_command, Command, RunOptions};
pub use error::{Error, Result};
pub use guideline::{AgentPrompt, AppliedInsights, GeneratorConfig, GuidelineGenerator, VersionStore};
pub use interceptor::ToolCallInterceptor;
pub use llm::{
    cancel_pair, CancelFlag, CancelHandle, GeminiClient, LlmClient, LlmConfig, MockLlm,
    OpenAiCompatClient, Throttle,
};
pub use optimizer::{ConfigOptimizer, OptimizationOutcome, OptimizerConfig, PromptOptimizer, RewardSpec};
pub use orchestrator::{
    ExperimentSummary, LearningCycleReport, LearningOrchestrator, OrchestratorConfig,
    ProblemOutcome, ProblemSpec, ProblemStage, RoundInfo, RoundStatus, RunLayout,
};
pub use patterns::{Pattern, PatternAnalyzer, PatternExample, PatternKind};
pub use points::{
    AddOutcome, ConflictConfig, ConflictDetector, Insight, InsightKind, PointCategory,
    PointManager, PointSource, PromptPoint, ToolSuccessPolicy, UsageConfig, UsageDetector,
    UsageMode,
};
pub use trace::{
    AgentTrace, EnhancedOracleResults, OracleStageResult, PerformanceMetrics, ProblemContext,
    StageComparison, ThinkingStep, ToolCall, TraceFilter, TraceStats, TraceStore,
};

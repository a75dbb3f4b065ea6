//! The learning orchestrator: rounds, problems, validation, learning.
//!
//! Each round exercises the full problem list through the external agent
//! runtime while the interceptor records traces, then validates points
//! against the closed traces, runs the analyzer- and LLM-driven learning
//! cycle, and persists next-round prompts. Rounds are isolated in their own
//! run directories; learning carries over through explicit copies of the
//! previous round's points and prompt versions.

mod layout;

use layout::copy_json_files;
pub use layout::RunLayout;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::adapters::{AgentRuntime, Oracle, StageObserver};
use crate::agent::AgentKind;
use crate::error::{Error, Result};
use crate::guideline::{GuidelineGenerator, VersionStore};
use crate::interceptor::ToolCallInterceptor;
use crate::llm::{CancelFlag, LlmClient};
use crate::optimizer::{ConfigOptimizer, OptimizationOutcome, OptimizerConfig, PromptOptimizer, RewardSpec};
use crate::patterns::PatternAnalyzer;
use crate::points::{ConflictConfig, ConflictDetector, PointManager, UsageConfig, UsageDetector};
use crate::trace::{OracleStageResult, ProblemContext, TraceFilter, TraceStore};

/// A problem the agents are exercised on each round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemSpec {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub app_namespace: String,
}

impl ProblemSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            app_name: String::new(),
            app_namespace: String::new(),
        }
    }
}

/// Orchestrator tunables.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Parent of every `run_*` directory
    pub results_root: PathBuf,
    pub num_rounds: u32,
    /// 1-based round to start from
    pub start_round: u32,
    pub delay_between_problems: Duration,
    pub delay_between_rounds: Duration,
    /// Minimum pattern confidence forwarded to the generator
    pub confidence_threshold: f64,
    /// Minimum traces per kind before LLM optimization runs
    pub min_traces_for_optimization: usize,
    /// Hard cap on one problem's runtime
    pub problem_timeout: Option<Duration>,
    /// A previous round's `prompts/` directory to resume from
    pub resume_from: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            results_root: PathBuf::from("learning_results"),
            num_rounds: 5,
            start_round: 1,
            delay_between_problems: Duration::from_secs(30),
            delay_between_rounds: Duration::from_secs(300),
            confidence_threshold: 0.7,
            min_traces_for_optimization: 5,
            problem_timeout: None,
            resume_from: None,
        }
    }
}

/// Conceptual per-problem stage progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProblemStage {
    Idle,
    Diagnosis,
    Localization,
    Mitigation,
    Rollback,
    Done,
    Failed,
}

impl From<AgentKind> for ProblemStage {
    fn from(kind: AgentKind) -> Self {
        match kind {
            AgentKind::Diagnosis => Self::Diagnosis,
            AgentKind::Localization => Self::Localization,
            AgentKind::Mitigation => Self::Mitigation,
            AgentKind::Rollback => Self::Rollback,
        }
    }
}

/// Routes the interceptor to whichever stage the runtime is in.
///
/// The orchestrator only observes transitions; the runtime drives them.
struct StageTracker {
    interceptor: ToolCallInterceptor,
    trace_ids: HashMap<AgentKind, String>,
    current: std::sync::RwLock<ProblemStage>,
}

impl StageTracker {
    fn new(interceptor: ToolCallInterceptor, trace_ids: HashMap<AgentKind, String>) -> Self {
        Self {
            interceptor,
            trace_ids,
            current: std::sync::RwLock::new(ProblemStage::Idle),
        }
    }

    fn stage(&self) -> ProblemStage {
        *self.current.read().expect("stage lock")
    }
}

impl StageObserver for StageTracker {
    fn on_stage(&self, kind: AgentKind) {
        *self.current.write().expect("stage lock") = kind.into();
        if let Some(trace_id) = self.trace_ids.get(&kind) {
            self.interceptor.route_to(trace_id.clone());
        }
    }
}

/// Outcome of one problem execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemOutcome {
    pub problem_id: String,
    pub trace_ids: HashMap<AgentKind, String>,
    pub stage_success: HashMap<AgentKind, bool>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub duration_secs: f64,
}

/// Round status in `round_info` records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    Completed,
    Failed,
}

/// Per-round metadata, persisted as `round_info.json` even on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundInfo {
    pub round_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_folder: Option<PathBuf>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_secs: f64,
    pub status: RoundStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_problems: usize,
    pub successful_problems: usize,
    /// Prompts directory the next round should resume from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_prompts_dir: Option<PathBuf>,
}

/// End-of-run experiment summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub rounds: Vec<RoundInfo>,
    pub completed_rounds: usize,
    pub failed_rounds: usize,
    pub total_duration_secs: f64,
    pub avg_round_duration_secs: f64,
}

/// What the learning cycle did, for the round record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LearningCycleReport {
    pub traces_analyzed: usize,
    pub patterns_identified: usize,
    pub analyzer_insights: usize,
    /// Per kind: "insights", "insufficient_traces", "failed"
    pub llm_outcomes: HashMap<AgentKind, String>,
    /// Version produced for each kind this round
    pub versions: HashMap<AgentKind, String>,
}

/// Drives the multi-round learning loop.
pub struct LearningOrchestrator {
    config: OrchestratorConfig,
    generator: GuidelineGenerator,
    oracle: Arc<dyn Oracle>,
    runtime: Arc<dyn AgentRuntime>,
    problems: Vec<ProblemSpec>,
    interceptor: ToolCallInterceptor,
    llm: Option<Arc<dyn LlmClient>>,
    reward_spec: RewardSpec,
    cancel: CancelFlag,
}

impl LearningOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        generator: GuidelineGenerator,
        oracle: Arc<dyn Oracle>,
        runtime: Arc<dyn AgentRuntime>,
        problems: Vec<ProblemSpec>,
    ) -> Self {
        Self {
            config,
            generator,
            oracle,
            runtime,
            problems,
            interceptor: ToolCallInterceptor::new(),
            llm: None,
            reward_spec: RewardSpec::default(),
            cancel: CancelFlag::never(),
        }
    }

    /// The shared interceptor. Hand a clone to the tool/MCP surface; the
    /// orchestrator binds it to each round's trace store and routes it as
    /// stages transition.
    pub fn interceptor(&self) -> ToolCallInterceptor {
        self.interceptor.clone()
    }

    /// Use an interceptor the tool surface was already wired to.
    pub fn with_interceptor(mut self, interceptor: ToolCallInterceptor) -> Self {
        self.interceptor = interceptor;
        self
    }

    /// Enable LLM-driven optimization, conflict adjudication and usage
    /// classification.
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_reward_spec(mut self, reward_spec: RewardSpec) -> Self {
        self.reward_spec = reward_spec;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run all rounds and write the experiment summary.
    pub async fn run(&self) -> Result<ExperimentSummary> {
        fs::create_dir_all(&self.config.results_root)?;
        let summary_dir = self
            .config
            .results_root
            .join(format!("experiment_{}", Utc::now().format("%Y%m%d_%H%M%S")));
        fs::create_dir_all(&summary_dir)?;

        let run_start = Instant::now();
        let mut rounds = Vec::new();
        let mut previous_prompts = self.config.resume_from.clone();
        let mut cancelled = false;

        for round_number in self.config.start_round..=self.config.num_rounds {
            info!("===== Round {}/{} =====", round_number, self.config.num_rounds);
            let info = self.run_round(round_number, previous_prompts.as_deref()).await;

            let info = match info {
                Ok(info) => info,
                Err(e) => {
                    // Setup failed before a run directory existed; record
                    // the round as failed and move on (or stop on cancel).
                    let now = Utc::now();
                    cancelled = matches!(e, Error::Cancelled);
                    RoundInfo {
                        round_number,
                        run_folder: None,
                        start_time: now,
                        end_time: now,
                        duration_secs: 0.0,
                        status: RoundStatus::Failed,
                        error: Some(e.to_string()),
                        completed_problems: 0,
                        successful_problems: 0,
                        next_prompts_dir: None,
                    }
                }
            };

            let info_path = summary_dir.join(format!("round_{}_info.json", round_number));
            fs::write(&info_path, serde_json::to_string_pretty(&info)?)?;

            if info.status == RoundStatus::Completed {
                previous_prompts = info.next_prompts_dir.clone();
            }
            if info.error.as_deref() == Some("Operation cancelled") {
                cancelled = true;
            }
            rounds.push(info);

            if cancelled {
                warn!("Run cancelled; stopping after round {}", round_number);
                break;
            }
            if round_number < self.config.num_rounds {
                info!(
                    "Waiting {:?} before next round",
                    self.config.delay_between_rounds
                );
                if self.cancel.sleep(self.config.delay_between_rounds).await.is_err() {
                    warn!("Run cancelled during inter-round delay");
                    break;
                }
            }
        }

        let completed = rounds.iter().filter(|r| r.status == RoundStatus::Completed).count();
        let summary = ExperimentSummary {
            completed_rounds: completed,
            failed_rounds: rounds.len() - completed,
            total_duration_secs: run_start.elapsed().as_secs_f64(),
            avg_round_duration_secs: if rounds.is_empty() {
                0.0
            } else {
                rounds.iter().map(|r| r.duration_secs).sum::<f64>() / rounds.len() as f64
            },
            rounds,
        };
        fs::write(summary_dir.join("summary.json"), serde_json::to_string_pretty(&summary)?)?;
        info!(
            "Learning run complete: {}/{} rounds succeeded",
            summary.completed_rounds,
            summary.completed_rounds + summary.failed_rounds
        );
        Ok(summary)
    }

    /// Run one round, always producing a `round_info.json` in its run
    /// directory.
    pub async fn run_round(
        &self,
        round_number: u32,
        previous_prompts: Option<&std::path::Path>,
    ) -> Result<RoundInfo> {
        let layout = RunLayout::create(&self.config.results_root)?;
        let start_time = Utc::now();
        let round_start = Instant::now();

        let result = self.execute_round(round_number, previous_prompts, &layout).await;

        let (status, error, outcomes, cycle) = match result {
            Ok((outcomes, cycle)) => (RoundStatus::Completed, None, outcomes, Some(cycle)),
            Err(e) => {
                warn!("Round {} failed: {}", round_number, e);
                (RoundStatus::Failed, Some(e.to_string()), Vec::new(), None)
            }
        };

        let info = RoundInfo {
            round_number,
            run_folder: Some(layout.root().to_path_buf()),
            start_time,
            end_time: Utc::now(),
            duration_secs: round_start.elapsed().as_secs_f64(),
            status,
            error,
            completed_problems: outcomes.len(),
            successful_problems: outcomes.iter().filter(|o| o.success).count(),
            next_prompts_dir: (status == RoundStatus::Completed).then(|| layout.prompts_dir()),
        };

        if info.status == RoundStatus::Completed {
            self.write_learning_results(&layout, &outcomes, cycle.as_ref())?;
        }
        fs::write(layout.round_info_path(), serde_json::to_string_pretty(&info)?)?;
        Ok(info)
    }

    async fn execute_round(
        &self,
        round_number: u32,
        previous_prompts: Option<&std::path::Path>,
        layout: &RunLayout,
    ) -> Result<(Vec<ProblemOutcome>, LearningCycleReport)> {
        // Carry over learned state from the previous round, if any.
        if let Some(prompts_dir) = previous_prompts {
            let previous_round = prompts_dir.parent().unwrap_or(prompts_dir);
            let points = copy_json_files(&previous_round.join("points"), &layout.points_dir())?;
            copy_json_files(prompts_dir, &layout.prompts_dir())?;
            copy_json_files(&previous_round.join("configs"), &layout.configs_dir())?;
            info!(
                "Round {}: carried over {} point files from {}",
                round_number,
                points,
                previous_round.display()
            );
        }

        let store = Arc::new(TraceStore::new(layout.traces_dir())?);
        let manager = PointManager::new(layout.points_dir())?;
        let versions = VersionStore::new(layout.prompts_dir())?;

        if round_number == 1 && previous_prompts.is_none() {
            self.generator.reset(&manager, &versions).await?;
        }

        self.interceptor.bind(store.clone());
        let (detector, usage) = self.build_detectors();

        // Execute every problem in order.
        let mut outcomes: Vec<ProblemOutcome> = Vec::new();
        let total = self.problems.len();
        let run_result: Result<()> = async {
            for (index, problem) in self.problems.iter().enumerate() {
                self.cancel.check()?;
                info!("[{}/{}] Running problem {}", index + 1, total, problem.id);
                let outcome = self.run_problem(problem, &store).await?;
                outcomes.push(outcome);
                self.write_learning_results(layout, &outcomes, None)?;

                if index + 1 < total {
                    self.cancel.sleep(self.config.delay_between_problems).await?;
                }
            }
            Ok(())
        }
        .await;

        if let Err(e) = run_result {
            // Leave durable state consistent: close anything still live.
            for trace_id in store.live_trace_ids().await {
                let reason = if matches!(e, Error::Cancelled) { "cancelled" } else { "round failed" };
                let _ = store.abort_trace(&trace_id, reason).await;
            }
            return Err(e);
        }

        // Batch validation, strictly after all traces are closed. The four
        // kinds validate concurrently; their point sets are independently
        // locked.
        info!("Batch validating points from {} problems", outcomes.len());
        for outcome in &outcomes {
            let validations = AgentKind::ALL.map(|kind| {
                let store = &store;
                let manager = &manager;
                let usage = &usage;
                async move {
                    let trace_id = match outcome.trace_ids.get(&kind) {
                        Some(id) => id,
                        None => return Ok(()),
                    };
                    let traces = store.load_traces(
                        &TraceFilter::new().kind(kind).problem(outcome.problem_id.clone()),
                    )?;
                    match traces.into_iter().find(|t| &t.trace_id == trace_id) {
                        Some(trace) => {
                            let stage_success =
                                outcome.stage_success.get(&kind).copied().unwrap_or(false);
                            manager
                                .validate_points_from_trace(kind, &trace, stage_success, usage)
                                .await
                                .map(|_| ())
                        }
                        None => {
                            warn!("Trace {} not found for validation", trace_id);
                            Ok(())
                        }
                    }
                }
            });
            for result in futures::future::join_all(validations).await {
                result?;
            }
        }

        let cycle = self.learning_cycle(layout, &store, &manager, &versions, &detector).await?;
        Ok((outcomes, cycle))
    }

    fn build_detectors(&self) -> (ConflictDetector, UsageDetector) {
        let mut detector = ConflictDetector::new(ConflictConfig::default()).with_cancel(self.cancel.clone());
        let mut usage = UsageDetector::new(UsageConfig::default()).with_cancel(self.cancel.clone());
        if let Some(llm) = &self.llm {
            detector = detector.with_llm(llm.clone());
            usage = usage.with_llm(llm.clone());
        }
        (detector, usage)
    }

    /// Run one problem: four traces, one per kind, routed by stage.
    async fn run_problem(&self, problem: &ProblemSpec, store: &Arc<TraceStore>) -> Result<ProblemOutcome> {
        let started = Instant::now();
        let base_id = format!("learning_{}_{}", problem.id, Utc::now().format("%Y%m%d_%H%M%S%3f"));

        let ctx = ProblemContext::new(
            problem.id.clone(),
            if problem.app_name.is_empty() { problem.name.clone() } else { problem.app_name.clone() },
            problem.app_namespace.clone(),
            problem.description.clone(),
        )
        .with_fault_type(problem.id.clone());

        let mut trace_ids = HashMap::new();
        for kind in AgentKind::ALL {
            let trace_id = format!("{}_{}", base_id, kind);
            store.start_trace(trace_id.clone(), kind, ctx.clone()).await?;
            trace_ids.insert(kind, trace_id);
        }

        let tracker = StageTracker::new(self.interceptor.clone(), trace_ids.clone());
        tracker.on_stage(AgentKind::Diagnosis);

        let run_result = match self.config.problem_timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, self.runtime.run_problem(&problem.id, &tracker)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Internal(format!(
                        "problem timed out after {:.0}s",
                        timeout.as_secs_f64()
                    ))),
                }
            }
            None => self.runtime.run_problem(&problem.id, &tracker).await,
        };
        self.interceptor.disable();

        let submissions = match run_result {
            Ok(submissions) => submissions,
            Err(e) => {
                let reason = if matches!(e, Error::Cancelled) { "cancelled".to_string() } else { e.to_string() };
                for trace_id in trace_ids.values() {
                    let _ = store.abort_trace(trace_id, &reason).await;
                }
                if matches!(e, Error::Cancelled) {
                    return Err(e);
                }
                return Ok(ProblemOutcome {
                    problem_id: problem.id.clone(),
                    trace_ids,
                    stage_success: AgentKind::ALL.iter().map(|k| (*k, false)).collect(),
                    success: false,
                    failure_reason: Some(reason),
                    duration_secs: started.elapsed().as_secs_f64(),
                });
            }
        };

        let ground_truth = self.oracle.ground_truth(&problem.id).await?;
        let verdicts = self.oracle.evaluate(&problem.id, &submissions).await?;

        let mut stage_success = HashMap::new();
        for kind in AgentKind::ALL {
            let success = stage_verdict(&verdicts, kind).map(|v| v.success).unwrap_or(false);
            stage_success.insert(kind, success);
            let trace_id = &trace_ids[&kind];
            store
                .end_trace(
                    trace_id,
                    success,
                    submissions.get(&kind).cloned(),
                    ground_truth.clone(),
                    Some(verdicts.clone()),
                )
                .await?;
        }

        let success = stage_success.values().all(|s| *s);
        Ok(ProblemOutcome {
            problem_id: problem.id.clone(),
            trace_ids,
            stage_success,
            success,
            failure_reason: None,
            duration_secs: started.elapsed().as_secs_f64(),
        })
    }

    /// Analyzer insights, then LLM optimization, then the fallback ladder.
    /// Exactly one prompt version per kind comes out of every cycle.
    async fn learning_cycle(
        &self,
        layout: &RunLayout,
        store: &TraceStore,
        manager: &PointManager,
        versions: &VersionStore,
        detector: &ConflictDetector,
    ) -> Result<LearningCycleReport> {
        let traces = store.load_traces(&TraceFilter::new())?;
        let mut report = LearningCycleReport {
            traces_analyzed: traces.len(),
            ..Default::default()
        };

        // Analyzer-driven insights go in first, so the LLM sees the
        // resulting learned set.
        let patterns = PatternAnalyzer::new().analyze(&traces);
        report.patterns_identified = patterns.len();
        let confident: Vec<_> = patterns
            .iter()
            .filter(|p| p.confidence >= self.config.confidence_threshold)
            .cloned()
            .collect();
        let analyzer_insights = self.generator.insights_from_patterns(&confident);
        report.analyzer_insights = analyzer_insights.len();

        let mut analyzer_applied: HashMap<AgentKind, bool> = HashMap::new();
        for kind in AgentKind::ALL {
            if analyzer_insights.is_empty() {
                analyzer_applied.insert(kind, false);
                continue;
            }
            let applied = self
                .generator
                .apply_insights(kind, &analyzer_insights, manager, detector)
                .await?;
            analyzer_applied.insert(kind, !applied.new_point_ids.is_empty());
        }

        // LLM-driven insights, per kind with enough traces.
        let mut llm_outcomes: HashMap<AgentKind, OptimizationOutcome> = HashMap::new();
        if let Some(llm) = &self.llm {
            let optimizer = PromptOptimizer::new(llm.clone(), self.reward_spec)
                .with_config(OptimizerConfig {
                    min_traces: self.config.min_traces_for_optimization,
                    ..OptimizerConfig::default()
                })
                .with_cancel(self.cancel.clone());

            for kind in AgentKind::ALL {
                let kind_traces: Vec<_> =
                    traces.iter().filter(|t| t.agent_kind == kind).cloned().collect();
                let current_prompt = self.generator.rebuild(kind, manager).await;
                let existing = manager.active_points(kind).await;
                let outcome = optimizer
                    .optimize(kind, &current_prompt, &kind_traces, &existing)
                    .await?;

                let label = match &outcome {
                    OptimizationOutcome::Insights(insights) => {
                        self.generator.apply_insights(kind, insights, manager, detector).await?;
                        "insights"
                    }
                    OptimizationOutcome::InsufficientTraces => "insufficient_traces",
                    OptimizationOutcome::Failed => "failed",
                };
                report.llm_outcomes.insert(kind, label.to_string());
                llm_outcomes.insert(kind, outcome);
            }
        }

        // Finalize: fallback ladder, one version per kind.
        for kind in AgentKind::ALL {
            let final_prompt = match llm_outcomes.get(&kind) {
                Some(OptimizationOutcome::Failed) => {
                    if analyzer_applied.get(&kind).copied().unwrap_or(false) {
                        // Analyzer-driven insights stand on their own.
                        self.generator.rebuild(kind, manager).await
                    } else if let Some(previous) = versions.load_version(kind, None)? {
                        info!("LLM optimization failed for {}; restoring previous version", kind);
                        previous
                    } else {
                        info!("LLM optimization failed for {}; keeping base prompt", kind);
                        self.generator.base_prompt(kind).clone()
                    }
                }
                _ => self.generator.rebuild(kind, manager).await,
            };

            let version = versions.next_version(kind)?;
            versions.save_version(kind, &version, &final_prompt)?;
            versions.save_active(kind, &final_prompt)?;
            report.versions.insert(kind, version);
        }

        // Config optimization: parallel, lower stakes.
        if let Some(llm) = &self.llm {
            let config_optimizer =
                ConfigOptimizer::new(llm.clone(), self.reward_spec).with_cancel(self.cancel.clone());
            for kind in AgentKind::ALL {
                let kind_traces: Vec<_> =
                    traces.iter().filter(|t| t.agent_kind == kind).cloned().collect();
                if kind_traces.len() < self.config.min_traces_for_optimization {
                    continue;
                }
                let current = self.load_agent_config(layout, kind)?;
                let merged = config_optimizer.optimize(kind, &current, &kind_traces).await?;
                let path = layout.configs_dir().join(format!("{}_agent_config.json", kind));
                fs::write(&path, serde_json::to_string_pretty(&Value::Object(merged))?)?;
            }
        }

        Ok(report)
    }

    fn load_agent_config(&self, layout: &RunLayout, kind: AgentKind) -> Result<Map<String, Value>> {
        let path = layout.configs_dir().join(format!("{}_agent_config.json", kind));
        if path.exists() {
            let contents = fs::read_to_string(&path)?;
            if let Value::Object(map) = serde_json::from_str(&contents)? {
                return Ok(map);
            }
        }
        let mut defaults = Map::new();
        defaults.insert("max_step".into(), json!(20));
        defaults.insert("max_retry_attempts".into(), json!(10));
        Ok(defaults)
    }

    fn write_learning_results(
        &self,
        layout: &RunLayout,
        outcomes: &[ProblemOutcome],
        cycle: Option<&LearningCycleReport>,
    ) -> Result<()> {
        let record = json!({
            "problem_count": self.problems.len(),
            "completed_problems": outcomes.len(),
            "successful_problems": outcomes.iter().filter(|o| o.success).count(),
            "results": outcomes,
            "reward_spec": self.reward_spec,
            "learning_result": cycle,
        });
        fs::write(layout.learning_results_path(), serde_json::to_string_pretty(&record)?)?;
        Ok(())
    }
}

/// Look up a kind's verdict, accepting `Diagnosis` as an alias for
/// `Detection`.
fn stage_verdict<'a>(
    verdicts: &'a HashMap<String, OracleStageResult>,
    kind: AgentKind,
) -> Option<&'a OracleStageResult> {
    let primary = verdicts.get(kind.stage_key());
    if primary.is_some() {
        return primary;
    }
    if kind.stage_key() == "Detection" {
        return verdicts.get("Diagnosis");
    }
    None
}

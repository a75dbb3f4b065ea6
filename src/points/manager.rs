//! The canonical, validated instruction set per agent kind.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::agent::AgentKind;
use crate::error::{Error, Result};
use crate::trace::AgentTrace;

use super::conflict::ConflictDetector;
use super::tools::{is_tool_related, resolve_tool_name};
use super::types::{Insight, PointSource, PromptPoint};
use super::usage::UsageDetector;

/// How mixed outcomes of the same tool aggregate into point success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolSuccessPolicy {
    /// At least one successful invocation counts as success
    #[default]
    AnySuccess,
    /// Every invocation must have succeeded
    AllMustSucceed,
    /// Strictly more successes than failures
    Majority,
}

impl ToolSuccessPolicy {
    fn aggregate(&self, outcomes: &[bool]) -> bool {
        if outcomes.is_empty() {
            return false;
        }
        match self {
            Self::AnySuccess => outcomes.iter().any(|s| *s),
            Self::AllMustSucceed => outcomes.iter().all(|s| *s),
            Self::Majority => {
                let successes = outcomes.iter().filter(|s| **s).count();
                successes * 2 > outcomes.len()
            }
        }
    }
}

/// Result of adding an insight.
#[derive(Debug, Clone, PartialEq)]
pub enum AddOutcome {
    /// A new point was born
    Added(PromptPoint),
    /// An identical point already exists; the add was a no-op
    Existing(PromptPoint),
    /// The identical content lost a conflict earlier and was replaced
    AlreadyReplaced {
        point: PromptPoint,
        replaced_by: String,
    },
}

impl AddOutcome {
    /// The point involved, whichever way the add went.
    pub fn point(&self) -> &PromptPoint {
        match self {
            Self::Added(p) | Self::Existing(p) => p,
            Self::AlreadyReplaced { point, .. } => point,
        }
    }

    pub fn is_added(&self) -> bool {
        matches!(self, Self::Added(_))
    }
}

/// Owns the per-kind point sets: storage, dedupe, validation, conflict
/// resolution.
///
/// Each kind has its own lock; mutations on one kind never block another.
/// LLM-backed detection runs on snapshots outside the locks, and verdicts
/// are re-checked against current state before being committed.
pub struct PointManager {
    storage_dir: PathBuf,
    tool_success_policy: ToolSuccessPolicy,
    slots: [RwLock<Vec<PromptPoint>>; 4],
}

impl PointManager {
    /// Open a manager over `storage_dir`, loading any persisted learned
    /// points. Records with any other source on disk are ignored: original
    /// prompts are a separate, immutable artifact.
    pub fn new(storage_dir: impl Into<PathBuf>) -> Result<Self> {
        let storage_dir = storage_dir.into();
        fs::create_dir_all(&storage_dir)?;

        let manager = Self {
            storage_dir,
            tool_success_policy: ToolSuccessPolicy::default(),
            slots: [
                RwLock::new(Vec::new()),
                RwLock::new(Vec::new()),
                RwLock::new(Vec::new()),
                RwLock::new(Vec::new()),
            ],
        };
        manager.load()?;
        Ok(manager)
    }

    pub fn with_tool_success_policy(mut self, policy: ToolSuccessPolicy) -> Self {
        self.tool_success_policy = policy;
        self
    }

    fn slot(&self, kind: AgentKind) -> &RwLock<Vec<PromptPoint>> {
        let index = AgentKind::ALL.iter().position(|k| *k == kind).expect("kind in table");
        &self.slots[index]
    }

    fn points_file(&self, kind: AgentKind) -> PathBuf {
        self.storage_dir.join(format!("{}_points.json", kind))
    }

    fn load(&self) -> Result<()> {
        for kind in AgentKind::ALL {
            let path = self.points_file(kind);
            if !path.exists() {
                continue;
            }
            let contents = fs::read_to_string(&path)
                .map_err(|e| Error::storage(format!("failed to read '{}': {}", path.display(), e)))?;
            let records: Vec<PromptPoint> = serde_json::from_str(&contents)?;
            let learned: Vec<PromptPoint> = records
                .into_iter()
                .filter(|p| p.source == PointSource::Learned)
                .collect();
            if !learned.is_empty() {
                info!("Loaded {} learned points for {} from {}", learned.len(), kind, path.display());
            }
            *self.slot(kind).try_write().expect("no contention during load") = learned;
        }
        Ok(())
    }

    fn persist(&self, kind: AgentKind, points: &[PromptPoint]) -> Result<()> {
        let path = self.points_file(kind);
        let json = serde_json::to_string_pretty(points)?;
        fs::write(&path, json)
            .map_err(|e| Error::storage(format!("failed to write '{}': {}", path.display(), e)))
    }

    /// Directory the point files live in.
    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// All points for a kind, including inactive ones.
    pub async fn all_points(&self, kind: AgentKind) -> Vec<PromptPoint> {
        self.slot(kind).read().await.clone()
    }

    /// Active points for a kind.
    pub async fn active_points(&self, kind: AgentKind) -> Vec<PromptPoint> {
        self.slot(kind).read().await.iter().filter(|p| p.active).cloned().collect()
    }

    /// Look up one point by id.
    pub async fn point(&self, kind: AgentKind, id: &str) -> Option<PromptPoint> {
        self.slot(kind).read().await.iter().find(|p| p.id == id).cloned()
    }

    /// Add a learned insight as a point.
    ///
    /// Idempotent on exact content (after trim): adding a duplicate returns
    /// the existing point untouched. Content that previously lost a
    /// conflict surfaces as [`AddOutcome::AlreadyReplaced`].
    pub async fn add_learned_insight(&self, kind: AgentKind, insight: &Insight) -> Result<AddOutcome> {
        insight.validate()?;
        let content = insight.content.trim();

        let mut points = self.slot(kind).write().await;
        if let Some(existing) = points.iter().find(|p| p.content.trim() == content) {
            if let Some(replaced_by) = existing.replaced_by.clone() {
                debug!("Insight content already replaced by {}", replaced_by);
                return Ok(AddOutcome::AlreadyReplaced {
                    point: existing.clone(),
                    replaced_by,
                });
            }
            debug!("Skipping duplicate learned insight; point {} already exists", existing.id);
            return Ok(AddOutcome::Existing(existing.clone()));
        }

        let mut point = PromptPoint::new_learned(
            content,
            insight.kind.category(),
            insight.priority.unwrap_or(6),
        );
        point.metadata = insight.metadata.clone();

        points.push(point.clone());
        self.persist(kind, &points)?;
        info!("Added learned insight point {} for {}", point.id, kind);
        Ok(AddOutcome::Added(point))
    }

    /// Drop every learned point, for one kind or for all.
    pub async fn clear_learned_points(&self, kind: Option<AgentKind>) -> Result<()> {
        let kinds: Vec<AgentKind> = match kind {
            Some(kind) => vec![kind],
            None => AgentKind::ALL.to_vec(),
        };
        for kind in kinds {
            let mut points = self.slot(kind).write().await;
            points.retain(|p| p.source != PointSource::Learned);
            self.persist(kind, &points)?;
            info!("Cleared learned points for {}", kind);
        }
        Ok(())
    }

    /// Validate a single point against one outcome. One atomic step:
    /// counters, promotion, and pruning all under the kind's write lock.
    pub async fn validate_point(&self, kind: AgentKind, point_id: &str, success: bool) -> Result<()> {
        let mut points = self.slot(kind).write().await;
        let point = match points.iter_mut().find(|p| p.id == point_id) {
            Some(p) => p,
            None => return Ok(()),
        };

        let was_active = point.active;
        let was_verified = point.verified;
        point.record_validation(success);

        if point.verified && !was_verified {
            info!("Point {} marked as VERIFIED", point.id);
        }
        if was_active && !point.active {
            info!("Point {} deactivated due to poor performance", point.id);
        }

        self.persist(kind, &points)
    }

    /// Identify used points in a closed trace and validate each one.
    ///
    /// Tool-related points are judged at tool level (per the configured
    /// [`ToolSuccessPolicy`]; a mentioned-but-never-called tool fails), all
    /// others at stage level. Unused points are not touched.
    pub async fn validate_points_from_trace(
        &self,
        kind: AgentKind,
        trace: &AgentTrace,
        stage_success: bool,
        usage: &UsageDetector,
    ) -> Result<HashMap<String, bool>> {
        let snapshot = self.active_points(kind).await;
        let used_ids = usage.identify(&snapshot, trace).await?;

        let mut tool_outcomes: HashMap<&str, Vec<bool>> = HashMap::new();
        for call in &trace.tool_calls {
            tool_outcomes.entry(call.tool_name.as_str()).or_default().push(call.success);
        }

        let mut results = HashMap::new();
        for point_id in used_ids {
            let point = match self.point(kind, &point_id).await {
                Some(p) => p,
                None => continue,
            };

            let point_success = if is_tool_related(&point) {
                match resolve_tool_name(&point.content) {
                    Some(tool) => match tool_outcomes.get(tool.as_str()) {
                        Some(outcomes) => self.tool_success_policy.aggregate(outcomes),
                        // Tool mentioned but never called: the guidance was
                        // not followed successfully.
                        None => false,
                    },
                    None => stage_success,
                }
            } else {
                stage_success
            };

            self.validate_point(kind, &point_id, point_success).await?;
            results.insert(point_id, point_success);
        }

        if results.is_empty() {
            debug!("Validated 0 points for {}: none identified as used", kind);
        } else {
            info!(
                "Validated {} points for {}: {} successful",
                results.len(),
                kind,
                results.values().filter(|v| **v).count()
            );
        }
        Ok(results)
    }

    /// Detect conflicts and resolve each clique down to a single winner.
    ///
    /// Detection runs on a snapshot outside the lock (it may call the LLM
    /// judge); verdicts are re-checked against current state before any
    /// point is deactivated. Returns the active set after resolution.
    pub async fn resolve_conflicts(
        &self,
        kind: AgentKind,
        detector: &ConflictDetector,
        new_ids: Option<&[String]>,
    ) -> Result<Vec<PromptPoint>> {
        let snapshot = self.active_points(kind).await;
        let conflicts = detector.detect(&snapshot, new_ids).await?;

        let mut points = self.slot(kind).write().await;
        let mut changed = false;

        for (point_id, conflict_ids) in &conflicts {
            if conflict_ids.is_empty() {
                continue;
            }
            // Re-check against current state: a member may have been pruned
            // while the detector was off calling the LLM.
            let mut group_ids: Vec<String> = vec![point_id.clone()];
            group_ids.extend(conflict_ids.iter().cloned());
            let group: Vec<&PromptPoint> = points
                .iter()
                .filter(|p| p.active && group_ids.contains(&p.id))
                .collect();
            if group.len() < 2 {
                continue;
            }

            let winner_id = select_winner(&group).id.clone();
            let loser_ids: Vec<String> = group
                .iter()
                .filter(|p| p.id != winner_id)
                .map(|p| p.id.clone())
                .collect();

            let mut most_recent_loser: Option<(String, chrono::DateTime<chrono::Utc>)> = None;
            for loser_id in &loser_ids {
                if let Some(loser) = points.iter_mut().find(|p| p.id == *loser_id) {
                    loser.active = false;
                    loser.replaced_by = Some(winner_id.clone());
                    if !loser.conflicts_with.contains(&winner_id) {
                        loser.conflicts_with.push(winner_id.clone());
                    }
                    loser.touch();
                    info!("Point {} replaced by {} due to conflict", loser.id, winner_id);
                    let stamp = loser.created_at;
                    if most_recent_loser.as_ref().map_or(true, |(_, t)| stamp > *t) {
                        most_recent_loser = Some((loser_id.clone(), stamp));
                    }
                    changed = true;
                }
            }

            if let Some(winner) = points.iter_mut().find(|p| p.id == winner_id) {
                for loser_id in &loser_ids {
                    if !winner.conflicts_with.contains(loser_id) {
                        winner.conflicts_with.push(loser_id.clone());
                    }
                }
                if let Some((loser_id, _)) = most_recent_loser {
                    winner.replaces = Some(loser_id);
                }
                winner.touch();
            }
        }

        if changed {
            self.persist(kind, &points)?;
        } else if !conflicts.is_empty() {
            warn!("Conflict verdicts were stale; nothing to resolve for {}", kind);
        }

        Ok(points.iter().filter(|p| p.active).cloned().collect())
    }
}

/// Pick the best point of a conflict group.
///
/// Ordering: verified, then success rate, then source preference
/// (verified-learned > learned > original), then priority, then recency.
fn select_winner<'a>(group: &[&'a PromptPoint]) -> &'a PromptPoint {
    let source_score = |p: &PromptPoint| -> u8 {
        match (p.source, p.verified) {
            (PointSource::Learned, true) => 2,
            (PointSource::Learned, false) => 1,
            _ => 0,
        }
    };

    group
        .iter()
        .copied()
        .max_by(|a, b| {
            a.verified
                .cmp(&b.verified)
                .then_with(|| {
                    a.success_rate()
                        .partial_cmp(&b.success_rate())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| source_score(a).cmp(&source_score(b)))
                .then_with(|| a.priority.cmp(&b.priority))
                .then_with(|| a.created_at.cmp(&b.created_at))
        })
        .expect("conflict group is non-empty")
}

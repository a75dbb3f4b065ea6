//! Pure prompt rebuild from a base prompt and learned points.

use super::types::{PointCategory, PointSource, PromptPoint};

/// Header of the appended section. The base prompt is byte-preserved above
/// this marker across all rounds.
pub const LEARNED_SECTION_HEADER: &str =
    "## Learned Insights (Additive — Original Content Preserved Above)";

/// Category render order; anything else follows alphabetically.
const CATEGORY_ORDER: &[PointCategory] = &[
    PointCategory::ToolUsage,
    PointCategory::Workflow,
    PointCategory::Warning,
    PointCategory::General,
];

fn section_title(category: PointCategory) -> Option<&'static str> {
    match category {
        PointCategory::ToolUsage => Some("### Tool Usage Guidelines"),
        PointCategory::Workflow => Some("### Workflow Guidelines"),
        PointCategory::Warning => Some("### Important Warnings"),
        // General points render without a subheader.
        PointCategory::General => None,
        PointCategory::Example => Some("### Example"),
        PointCategory::Reference => Some("### Reference"),
    }
}

fn marker(point: &PromptPoint) -> &'static str {
    if point.verified {
        "✅ VERIFIED"
    } else {
        "⚠️ UNVERIFIED (being tested)"
    }
}

/// Remove an appended Learned Insights section from a loaded prompt,
/// returning the base text exactly.
pub fn strip_learned_section(prompt: &str) -> &str {
    match prompt.find("## Learned Insights") {
        Some(idx) => prompt[..idx].trim_end(),
        None => prompt,
    }
}

/// Rebuild the active prompt: base text plus the rendered Learned Insights
/// section over active learned points.
///
/// A pure function of its inputs: same base and points yield byte-identical
/// output, and without learned points the base is returned unchanged.
pub fn rebuild_prompt(base: &str, points: &[PromptPoint]) -> String {
    let mut learned: Vec<&PromptPoint> = points
        .iter()
        .filter(|p| p.active && p.source == PointSource::Learned)
        .collect();
    if learned.is_empty() {
        return base.to_string();
    }

    // Within a category: verified first, then priority, then success count.
    learned.sort_by(|a, b| {
        b.verified
            .cmp(&a.verified)
            .then_with(|| b.priority.cmp(&a.priority))
            .then_with(|| b.success_count.cmp(&a.success_count))
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut categories: Vec<PointCategory> = CATEGORY_ORDER.to_vec();
    let mut others: Vec<PointCategory> = learned
        .iter()
        .map(|p| p.category)
        .filter(|c| !CATEGORY_ORDER.contains(c))
        .collect();
    others.sort_by_key(|c| c.as_str());
    others.dedup();
    categories.extend(others);

    let mut out = String::with_capacity(base.len() + 512);
    out.push_str(base);
    out.push_str("\n\n");
    out.push_str(LEARNED_SECTION_HEADER);
    out.push('\n');
    out.push_str(
        "The following insights have been learned from past executions. Original prompt content is preserved above.\n",
    );

    for category in categories {
        let in_category: Vec<&&PromptPoint> =
            learned.iter().filter(|p| p.category == category).collect();
        if in_category.is_empty() {
            continue;
        }
        out.push('\n');
        if let Some(title) = section_title(category) {
            out.push_str(title);
            out.push('\n');
        }
        for point in in_category {
            out.push_str(marker(point));
            out.push('\n');
            out.push_str(&point.content);
            out.push('\n');
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn point(content: &str, category: PointCategory, priority: u8) -> PromptPoint {
        PromptPoint::new_learned(content, category, priority)
    }

    #[test]
    fn test_no_points_returns_base_unchanged() {
        assert_eq!(rebuild_prompt("Base prompt.", &[]), "Base prompt.");
    }

    #[test]
    fn test_inactive_points_never_rendered() {
        let mut p = point("Use get_metrics", PointCategory::ToolUsage, 6);
        p.active = false;
        assert_eq!(rebuild_prompt("Base.", &[p]), "Base.");
    }

    #[test]
    fn test_rebuild_is_deterministic() {
        let points = vec![
            point("Use get_metrics first", PointCategory::ToolUsage, 6),
            point("Check quotas before edits", PointCategory::Workflow, 7),
        ];
        assert_eq!(rebuild_prompt("Base.", &points), rebuild_prompt("Base.", &points));
    }

    #[test]
    fn test_base_prefix_preserved() {
        let base = "You are a diagnosis agent.\nSubmit Yes or No.";
        let points = vec![point("Use get_metrics first", PointCategory::ToolUsage, 6)];
        let rebuilt = rebuild_prompt(base, &points);
        assert!(rebuilt.starts_with(base));
        let idx = rebuilt.find(LEARNED_SECTION_HEADER).unwrap();
        assert_eq!(strip_learned_section(&rebuilt), base);
        assert!(idx > base.len());
    }

    #[test]
    fn test_category_order_and_markers() {
        let mut verified = point("Use get_metrics first", PointCategory::ToolUsage, 6);
        verified.verified = true;
        let points = vec![
            point("Never delete PVCs blindly", PointCategory::Warning, 8),
            point("Check quotas before edits", PointCategory::Workflow, 7),
            verified,
        ];
        let rebuilt = rebuild_prompt("Base.", &points);

        let tool_idx = rebuilt.find("### Tool Usage Guidelines").unwrap();
        let workflow_idx = rebuilt.find("### Workflow Guidelines").unwrap();
        let warning_idx = rebuilt.find("### Important Warnings").unwrap();
        assert!(tool_idx < workflow_idx && workflow_idx < warning_idx);
        assert!(rebuilt.contains("✅ VERIFIED\nUse get_metrics first"));
        assert!(rebuilt.contains("⚠️ UNVERIFIED (being tested)\nNever delete PVCs blindly"));
    }

    #[test]
    fn test_verified_sorts_before_unverified_within_category() {
        let mut verified = point("B verified", PointCategory::General, 5);
        verified.verified = true;
        let unverified = point("A unverified", PointCategory::General, 9);
        let rebuilt = rebuild_prompt("Base.", &[unverified, verified]);
        let verified_idx = rebuilt.find("B verified").unwrap();
        let unverified_idx = rebuilt.find("A unverified").unwrap();
        assert!(verified_idx < unverified_idx);
    }

    #[test]
    fn test_strip_learned_section_roundtrip() {
        let base = "Base text here.";
        let points = vec![point("Use get_metrics", PointCategory::ToolUsage, 6)];
        let rebuilt = rebuild_prompt(base, &points);
        assert_eq!(strip_learned_section(&rebuilt), base);
        assert_eq!(strip_learned_section(base), base);
    }
}

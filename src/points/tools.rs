//! Tool-name resolution and token helpers shared by conflict detection and
//! used-point identification.

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

use super::types::{PointCategory, PromptPoint};

/// Tools exposed to the task agents, consulted longest-match-first so that
/// e.g. `f_submit_tool` wins over `submit_tool`.
const KNOWN_TOOLS: &[&str] = &[
    "get_previous_rollbackable_cmd",
    "exec_read_only_kubectl_cmd",
    "exec_kubectl_cmd_safely",
    "get_dependency_graph",
    "get_resource_uid",
    "rollback_command",
    "get_operations",
    "f_submit_tool",
    "r_submit_tool",
    "get_services",
    "get_metrics",
    "submit_tool",
    "get_traces",
    "wait_tool",
];

fn snake_case_word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\w+_\w+(?:_\w+)*)\b").expect("static regex"))
}

fn kubectl_read_only_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"kubectl\s+(get|describe|logs|top|api-resources|explain|version|config)\b")
            .expect("static regex")
    })
}

fn word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\w+\b").expect("static regex"))
}

fn concept_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\w{4,}\b").expect("static regex"))
}

/// Resolve the tool a piece of guidance refers to.
///
/// Known tools first (longest match first), then any `word_word(_word)*`
/// token, then a kubectl fallback: read-only verbs map to the read-only
/// executor, anything else to the safe executor.
pub fn resolve_tool_name(content: &str) -> Option<String> {
    let content_lower = content.to_lowercase();

    for tool in KNOWN_TOOLS {
        if content_lower.contains(tool) {
            return Some((*tool).to_string());
        }
    }

    if let Some(captures) = snake_case_word_re().captures(content) {
        return Some(captures[1].to_string());
    }

    if content_lower.contains("kubectl") {
        if kubectl_read_only_re().is_match(&content_lower) {
            return Some("exec_read_only_kubectl_cmd".to_string());
        }
        return Some("exec_kubectl_cmd_safely".to_string());
    }

    None
}

/// Lowercased word tokens of a text.
pub fn tokenize(text: &str) -> HashSet<String> {
    word_re()
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Lowercased tokens of at least four characters.
pub fn concept_tokens(text: &str) -> HashSet<String> {
    concept_re()
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Jaccard similarity over word tokens.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

const TOOL_KEYWORDS: &[&str] = &[
    "tool",
    "use",
    "call",
    "execute",
    "kubectl",
    "get_metrics",
    "get_traces",
    "get_services",
    "exec_kubectl",
    "submit_tool",
];

/// Whether a point's success should be judged at tool level.
pub fn is_tool_related(point: &PromptPoint) -> bool {
    if point.category == PointCategory::ToolUsage {
        return true;
    }
    if resolve_tool_name(&point.content).is_some() {
        return true;
    }
    let content_lower = point.content.to_lowercase();
    TOOL_KEYWORDS.iter().any(|kw| content_lower.contains(kw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_tool_longest_match_first() {
        assert_eq!(
            resolve_tool_name("Always run f_submit_tool at the end").as_deref(),
            Some("f_submit_tool")
        );
        assert_eq!(
            resolve_tool_name("Use `get_metrics` before scaling").as_deref(),
            Some("get_metrics")
        );
    }

    #[test]
    fn test_snake_case_fallback() {
        assert_eq!(
            resolve_tool_name("Prefer my_custom_probe for deep checks").as_deref(),
            Some("my_custom_probe")
        );
    }

    #[test]
    fn test_kubectl_mapping() {
        assert_eq!(
            resolve_tool_name("Run kubectl get pods -n app first").as_deref(),
            Some("exec_read_only_kubectl_cmd")
        );
        assert_eq!(
            resolve_tool_name("Run kubectl describe deployment before edits").as_deref(),
            Some("exec_read_only_kubectl_cmd")
        );
        assert_eq!(
            resolve_tool_name("Use kubectl patch to fix the limits").as_deref(),
            Some("exec_kubectl_cmd_safely")
        );
    }

    #[test]
    fn test_no_tool() {
        assert_eq!(resolve_tool_name("Think carefully about the blast radius"), None);
    }

    #[test]
    fn test_jaccard_overlap() {
        let a = tokenize("use get_metrics before scaling the deployment");
        let b = tokenize("avoid get_metrics when scaling the deployment");
        assert!(jaccard(&a, &b) > 0.3);

        let c = tokenize("completely unrelated sentence about storage classes");
        assert!(jaccard(&a, &c) < 0.3);
    }

    #[test]
    fn test_is_tool_related() {
        let tool_point = PromptPoint::new_learned("Prefer get_metrics", PointCategory::General, 5);
        assert!(is_tool_related(&tool_point));

        let plain = PromptPoint::new_learned("Summarize findings briefly", PointCategory::General, 5);
        assert!(!is_tool_related(&plain));
    }
}

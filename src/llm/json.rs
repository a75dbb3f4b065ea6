//! Robust JSON extraction from LLM replies.
//!
//! Models asked for strict JSON still wrap it in fenced code blocks or
//! prose, and nested JSON strings defeat naive regex extraction. The
//! extractor here does real bracket matching with string/escape awareness.

use serde_json::Value;

/// Extract the first complete JSON object from a reply.
///
/// Tries, in order: a ```json fenced block, bracket matching from the first
/// `{`, and parsing the whole trimmed text.
pub fn extract_json_object(text: &str) -> Option<Value> {
    if text.is_empty() {
        return None;
    }

    if let Some(fence_start) = text.find("```json") {
        let after_fence = &text[fence_start + "```json".len()..];
        if let Some(start) = after_fence.find('{') {
            let candidate = match after_fence.find("```") {
                Some(end) if end > start => &after_fence[start..end],
                _ => &after_fence[start..],
            };
            if let Some(value) = match_brackets(candidate, '{', '}') {
                return Some(value);
            }
        }
    }

    if let Some(start) = text.find('{') {
        if let Some(value) = match_brackets(&text[start..], '{', '}') {
            return Some(value);
        }
    }

    serde_json::from_str(text.trim()).ok()
}

/// Extract the first complete JSON array from a reply.
pub fn extract_json_array(text: &str) -> Option<Value> {
    let start = text.find('[')?;
    match_brackets(&text[start..], '[', ']')
}

/// Scan for a balanced bracket span, honoring JSON strings and escapes, and
/// parse it.
fn match_brackets(text: &str, open: char, close: char) -> Option<Value> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;
    let mut start_idx = None;

    for (i, ch) in text.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => {
                if depth == 0 {
                    start_idx = Some(i);
                }
                depth += 1;
            }
            c if c == close && !in_string => {
                if depth == 0 {
                    return None;
                }
                depth -= 1;
                if depth == 0 {
                    let span = &text[start_idx?..i + close.len_utf8()];
                    return serde_json::from_str(span).ok();
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_json() {
        let value = extract_json_object(r#"{"conflicts": true, "reason": "opposite advice"}"#).unwrap();
        assert_eq!(value["conflicts"], json!(true));
    }

    #[test]
    fn test_fenced_block() {
        let text = "Here is my analysis:\n```json\n{\"conflicts\": false, \"reason\": \"different topics\"}\n```\nDone.";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["conflicts"], json!(false));
    }

    #[test]
    fn test_nested_braces_inside_strings() {
        let text = r#"Result: {"reason": "content contains {braces} and \"quotes\"", "conflicts": true}"#;
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["conflicts"], json!(true));
        assert!(value["reason"].as_str().unwrap().contains("{braces}"));
    }

    #[test]
    fn test_nested_objects() {
        let text = r#"prefix {"new_insights": [{"type": "warning", "content": "x"}], "extra": {"a": 1}} suffix"#;
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["new_insights"][0]["type"], json!("warning"));
    }

    #[test]
    fn test_unbalanced_returns_none() {
        assert!(extract_json_object(r#"{"broken": true"#).is_none());
        assert!(extract_json_object("no json here").is_none());
    }

    #[test]
    fn test_array_extraction() {
        let text = r#"reply: [{"point_id": "p1", "used": true}]"#;
        let value = extract_json_array(text).unwrap();
        assert_eq!(value[0]["point_id"], json!("p1"));
    }
}

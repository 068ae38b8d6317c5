//! Block extraction from model output
//!
//! - SQL: the **last** fenced ```sql block wins.
//! - JSON: best-effort object parse, tolerant of fences, trailing commas and
//!   raw newlines inside string literals.
//! - Tagged answers: the text between `<answer>` and `</answer>`.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};

lazy_static! {
    static ref SQL_BLOCK: Regex = Regex::new(r"(?is)```sql(.*?)```").unwrap();
    static ref JSON_BLOCK: Regex = Regex::new(r"(?is)```json(.*?)```").unwrap();
    static ref ANSWER_TAG: Regex = Regex::new(r"(?is)<answer>(.*?)</answer>").unwrap();
    static ref TRAILING_COMMA: Regex = Regex::new(r",(\s*[}\]])").unwrap();
}

/// Content of the last ```sql fenced block, trimmed. `None` when the text has
/// no such block or the block is empty.
pub fn last_sql_block(text: &str) -> Option<String> {
    SQL_BLOCK
        .captures_iter(text)
        .last()
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Best-effort parse of a JSON object embedded in model output.
pub fn json_object(text: &str) -> Option<Map<String, Value>> {
    let mut candidates: Vec<String> = JSON_BLOCK
        .captures_iter(text)
        .map(|c| c[1].trim().to_string())
        .collect();
    candidates.reverse();
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            candidates.push(text[start..=end].to_string());
        }
    }

    for candidate in candidates {
        if let Some(obj) = parse_lenient(&candidate) {
            return Some(obj);
        }
    }
    None
}

/// Text inside the last `<answer>` tag, or the whole text when the model forgot it.
pub fn answer_block(text: &str) -> String {
    ANSWER_TAG
        .captures_iter(text)
        .last()
        .map(|c| c[1].trim().to_string())
        .unwrap_or_else(|| text.trim().to_string())
}

fn parse_lenient(candidate: &str) -> Option<Map<String, Value>> {
    let trimmed = candidate.trim();
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(trimmed) {
        return Some(obj);
    }
    let repaired = escape_control_chars_in_strings(trimmed);
    let repaired = TRAILING_COMMA.replace_all(&repaired, "$1");
    match serde_json::from_str::<Value>(&repaired) {
        Ok(Value::Object(obj)) => Some(obj),
        _ => None,
    }
}

/// Models frequently emit multi-line SQL inside JSON strings.
fn escape_control_chars_in_strings(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(c);
                continue;
            }
            match c {
                '\\' => {
                    escaped = true;
                    out.push(c);
                }
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                '\n' => out.push_str("\\n"),
                '\r' => {}
                '\t' => out.push_str("\\t"),
                _ => out.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
        }
    }
    out
}

/// String field of a parsed object, trimmed.
pub fn str_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Boolean field that tolerates `"true"` strings.
pub fn bool_field(obj: &Map<String, Value>, key: &str) -> Option<bool> {
    match obj.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// List of strings; a bare string becomes a one-element list.
pub fn string_list_field(obj: &Map<String, Value>, key: &str) -> Vec<String> {
    match obj.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_sql_block_wins() {
        let text = "First try:\n```sql\nSELECT 1\n```\nBetter:\n```SQL\nSELECT 2\n```\n";
        assert_eq!(last_sql_block(text).as_deref(), Some("SELECT 2"));
    }

    #[test]
    fn test_no_sql_block() {
        assert!(last_sql_block("no code here").is_none());
        assert!(last_sql_block("```sql\n\n```").is_none());
    }

    #[test]
    fn test_json_with_multiline_sql() {
        let text = "**return**\n```json\n{\n  \"sql\": \"SELECT id,\n  name FROM t\",\n  \"solved_subquestions_list\": [\"list names\"],\n}\n```";
        let obj = json_object(text).unwrap();
        assert_eq!(str_field(&obj, "sql").unwrap(), "SELECT id,\n  name FROM t");
        assert_eq!(string_list_field(&obj, "solved_subquestions_list"), vec!["list names"]);
    }

    #[test]
    fn test_json_without_fence() {
        let obj = json_object("Sure! {\"FIXSQL\": \"SELECT 1\"} hope it helps").unwrap();
        assert_eq!(str_field(&obj, "FIXSQL").unwrap(), "SELECT 1");
    }

    #[test]
    fn test_bool_field_variants() {
        let obj = json_object(r#"{"a": true, "b": "False", "c": 1}"#).unwrap();
        assert_eq!(bool_field(&obj, "a"), Some(true));
        assert_eq!(bool_field(&obj, "b"), Some(false));
        assert_eq!(bool_field(&obj, "c"), None);
    }

    #[test]
    fn test_answer_block() {
        assert_eq!(answer_block("x <answer>\nfacts\n</answer> y"), "facts");
        assert_eq!(answer_block("no tags"), "no tags");
    }
}

use std::collections::HashMap;

use regex::RegexBuilder;
use serde_json::Value;

/// Pull the requested keys out of agent text output.
///
/// A fenced ```json block is tried first: when it parses to an object and
/// carries at least one requested key, those requested keys win. Otherwise
/// each key falls back to the first case-insensitive `key: value` line.
/// Returns `None` when nothing matches.
pub fn extract_output_keys(text: &str, keys: &[String]) -> Option<HashMap<String, Value>> {
    if keys.is_empty() {
        return None;
    }

    if let Some(found) = from_json_fence(text, keys) {
        return Some(found);
    }
    from_key_lines(text, keys)
}

fn from_json_fence(text: &str, keys: &[String]) -> Option<HashMap<String, Value>> {
    let start = text.find("```json")?;
    let body = &text[start + "```json".len()..];
    let end = body.find("```")?;
    let parsed: Value = serde_json::from_str(body[..end].trim()).ok()?;
    let object = parsed.as_object()?;

    let found: HashMap<String, Value> = keys
        .iter()
        .filter_map(|k| object.get(k).map(|v| (k.clone(), v.clone())))
        .collect();
    if found.is_empty() {
        None
    } else {
        Some(found)
    }
}

fn from_key_lines(text: &str, keys: &[String]) -> Option<HashMap<String, Value>> {
    let mut found = HashMap::new();
    for key in keys {
        let Ok(pattern) = RegexBuilder::new(&format!(r"^{}:\s*(.+)$", regex::escape(key)))
            .case_insensitive(true)
            .multi_line(true)
            .build()
        else {
            continue;
        };
        if let Some(caps) = pattern.captures(text) {
            found.insert(key.clone(), Value::String(caps[1].trim().to_string()));
        }
    }
    if found.is_empty() {
        None
    } else {
        Some(found)
    }
}

//! Parsing of end-of-discovery profile payloads.
//!
//! The model is asked for a JSON object but sometimes produces `key: value`
//! lines instead, or stops mid-object. Whatever fields can be read are kept
//! and the rest are reported as problems.

use serde_json::Value;

use compass_core::types::{Timestamp, UserProfile};

/// Result of parsing one payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProfileParse {
    pub profile: UserProfile,
    /// Human-readable reasons for anything that could not be used.
    pub problems: Vec<String>,
}

impl ProfileParse {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Parse a profile payload, keeping every field that parses.
///
/// A non-empty result is stamped with `discovery_completed_at`.
pub fn parse_profile(payload: &str) -> ProfileParse {
    let mut parse = ProfileParse::default();
    let trimmed = strip_code_fence(payload.trim());

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => {
            for (key, value) in map {
                apply_field(&mut parse, &key, FieldValue::Json(&value));
            }
        }
        Ok(_) => parse
            .problems
            .push("profile payload is not an object".to_string()),
        Err(e) => {
            if trimmed.starts_with('{') {
                parse.problems.push(format!("invalid JSON: {}", e));
            }
            parse_lines(&mut parse, trimmed);
        }
    }

    if !parse.profile.is_empty() {
        parse.profile.discovery_completed_at = Some(Timestamp::now());
    }
    parse
}

enum FieldValue<'a> {
    Json(&'a Value),
    Text(&'a str),
}

fn normalize_key(key: &str) -> String {
    key.trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '-' || c == '*')
        .trim()
        .to_lowercase()
        .replace([' ', '-'], "_")
}

fn apply_field(parse: &mut ProfileParse, key: &str, value: FieldValue<'_>) {
    let profile = &mut parse.profile;
    match normalize_key(key).as_str() {
        "name" | "display_name" | "preferred_name" => match scalar(&value) {
            Some(v) => profile.display_name = Some(v),
            None => parse.problems.push(format!("{} is not text", key)),
        },
        "communication_style" | "style" => match scalar(&value) {
            Some(v) => profile.communication_style = Some(v),
            None => parse.problems.push(format!("{} is not text", key)),
        },
        "goals" => profile.goals = list(&value),
        "values" => profile.values = list(&value),
        "challenges" | "struggles" => profile.challenges = list(&value),
        other => parse.problems.push(format!("unknown field {}", other)),
    }
}

fn scalar(value: &FieldValue<'_>) -> Option<String> {
    let text = match value {
        FieldValue::Json(Value::String(s)) => s.trim().to_string(),
        FieldValue::Json(_) => return None,
        FieldValue::Text(s) => s.trim().trim_matches('"').to_string(),
    };
    (!text.is_empty()).then_some(text)
}

fn list(value: &FieldValue<'_>) -> Vec<String> {
    let items: Vec<String> = match value {
        FieldValue::Json(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        FieldValue::Json(Value::String(s)) => split_list(s),
        FieldValue::Json(_) => Vec::new(),
        FieldValue::Text(s) => split_list(s.trim().trim_start_matches('[').trim_end_matches(']')),
    };
    items
        .into_iter()
        .map(|s| s.trim().trim_matches('"').trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn split_list(text: &str) -> Vec<String> {
    text.split([',', ';']).map(str::to_string).collect()
}

fn parse_lines(parse: &mut ProfileParse, text: &str) {
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if matches!(line, "{" | "}") {
            continue;
        }
        match line.split_once(':') {
            Some((key, value)) => {
                let value = value.trim().trim_end_matches(',');
                apply_field(parse, key, FieldValue::Text(value));
            }
            None => parse.problems.push(format!("unparseable line: {}", line)),
        }
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(inner) = text.strip_prefix("```") else {
        return text;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

//! Response Parsing
//!
//! Turns generation-service text into structured output. Responses are
//! read as strict JSON first, then after a bounded repair pass, and for
//! generation nodes finally as a single raw-text entry. A repaired
//! fragment that is not shaped like entries also falls back to raw text.
//!
//! # Repair Steps
//!
//! 1. Strip Markdown code fences
//! 2. Trim to the outermost bracket or brace span
//! 3. Collapse doubled commas
//! 4. Drop trailing commas before a closing bracket or brace

use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::workflow::model::{OutputEntry, SplitRule, WorkflowGraph};

static CODE_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_-]*\s*\n?(.*?)```").expect("valid fence pattern")
});

static DOUBLED_COMMA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",(?:\s*,)+").expect("valid comma pattern"));

static TRAILING_COMMA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",\s*([\]}])").expect("valid comma pattern"));

const TITLE_KEYS: [&str; 5] = ["title", "name", "chapter", "item", "heading"];

const CONTENT_KEYS: [&str; 7] = [
    "content",
    "description",
    "summary",
    "text",
    "bio",
    "detail",
    "body",
];

const LIST_KEYS: [&str; 12] = [
    "entries",
    "items",
    "chapters",
    "characters",
    "outline",
    "list",
    "data",
    "results",
    "sections",
    "locations",
    "settings",
    "ideas",
];

const RULE_LIST_KEYS: [&str; 5] = ["splitRules", "rules", "volumes", "splits", "plan"];

const TRIGGER_KEYS: [&str; 6] = [
    "triggerMarker",
    "trigger",
    "marker",
    "startChapter",
    "chapterTitle",
    "start",
];

const GROUP_KEYS: [&str; 6] = [
    "newGroupName",
    "groupName",
    "volumeName",
    "volume",
    "name",
    "title",
];

/// Errors raised when a response lacks the required structure.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("response is empty")]
    Empty,

    #[error("response is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("response contains no split rules")]
    NoRules,

    #[error("response does not describe a workflow: {0}")]
    NotAWorkflow(String),
}

/// Applies the repair steps to malformed JSON text.
///
/// # Example
///
/// ```
/// use novelflow::text::response::repair_json;
///
/// let raw = "Sure!\n```json\n[{\"title\": \"A\",,},]\n```";
/// assert_eq!(repair_json(raw), "[{\"title\": \"A\"}]");
/// ```
pub fn repair_json(text: &str) -> String {
    let mut repaired = match CODE_FENCE.captures(text).and_then(|caps| caps.get(1)) {
        Some(inner) => inner.as_str().trim().to_string(),
        None => text.trim().to_string(),
    };

    if let Some(span) = outermost_span(&repaired) {
        repaired = span.to_string();
    }

    repaired = DOUBLED_COMMA.replace_all(&repaired, ",").into_owned();
    repaired = TRAILING_COMMA.replace_all(&repaired, "$1").into_owned();
    repaired
}

fn outermost_span(text: &str) -> Option<&str> {
    let start = text.find(['[', '{'])?;
    let closer = if text[start..].starts_with('[') { ']' } else { '}' };
    let end = text.rfind(closer)?;
    if end <= start {
        return None;
    }
    Some(&text[start..=end])
}

/// Parses JSON, repairing it if needed.
///
/// Returns the value and whether repair was required.
pub fn parse_structured(text: &str) -> Result<(Value, bool), ParseError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok((value, false));
    }

    let repaired = repair_json(trimmed);
    let value = serde_json::from_str::<Value>(&repaired)?;
    warn!("Repaired malformed JSON response");
    Ok((value, true))
}

/// Parses a generation response into output entries.
///
/// Unstructured text becomes a single untitled entry; an empty response
/// yields no entries.
pub fn parse_entries(text: &str) -> Vec<OutputEntry> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    match parse_structured(text) {
        Ok((value, true)) if !has_entry_shape(&value) => {
            debug!("Repaired fragment is not a list of entries; keeping raw text");
            vec![raw_entry(text)]
        }
        Ok((value, _)) => {
            let entries: Vec<OutputEntry> = value_to_entries(&value)
                .into_iter()
                .filter(|e| !e.is_blank())
                .collect();
            if entries.is_empty() {
                vec![raw_entry(text)]
            } else {
                entries
            }
        }
        Err(e) => {
            debug!("Keeping response as raw text: {}", e);
            vec![raw_entry(text)]
        }
    }
}

/// Whether a value looks like generated entries rather than a fragment
/// lifted out of prose.
fn has_entry_shape(value: &Value) -> bool {
    match value {
        Value::Array(items) => {
            !items.is_empty() && items.iter().all(|item| item.is_object() || item.is_string())
        }
        Value::Object(map) => {
            LIST_KEYS
                .iter()
                .any(|key| map.get(*key).map_or(false, Value::is_array))
                || is_entry_like(map)
                || (!map.is_empty() && map.values().all(|v| v.is_object() || v.is_string()))
        }
        _ => false,
    }
}

fn raw_entry(text: &str) -> OutputEntry {
    OutputEntry::new("", text.trim())
}

/// Flattens a JSON value into output entries.
pub fn value_to_entries(value: &Value) -> Vec<OutputEntry> {
    match value {
        Value::Array(items) => items.iter().flat_map(value_to_entries).collect(),
        Value::Object(map) => {
            if let Some(list) = LIST_KEYS
                .iter()
                .find_map(|key| map.get(*key).filter(|v| v.is_array()))
            {
                return value_to_entries(list);
            }

            if is_entry_like(map) {
                return vec![entry_from_object(map)];
            }

            map.iter()
                .map(|(key, value)| OutputEntry::new(key.clone(), render_field(value)))
                .collect()
        }
        Value::Null => Vec::new(),
        other => vec![OutputEntry::new("", render_field(other))],
    }
}

fn is_entry_like(map: &Map<String, Value>) -> bool {
    TITLE_KEYS
        .iter()
        .chain(CONTENT_KEYS.iter())
        .any(|key| map.contains_key(*key))
}

fn entry_from_object(map: &Map<String, Value>) -> OutputEntry {
    let title_key = TITLE_KEYS.iter().find(|key| map.contains_key(**key));
    let content_key = CONTENT_KEYS.iter().find(|key| map.contains_key(**key));

    let title = title_key
        .and_then(|key| map.get(*key))
        .map(render_field)
        .unwrap_or_default();

    let content = match content_key.and_then(|key| map.get(*key)) {
        Some(value) => render_field(value),
        None => map
            .iter()
            .filter(|(key, _)| Some(&key.as_str()) != title_key)
            .map(|(key, value)| format!("{}: {}", key, render_field(value)))
            .collect::<Vec<_>>()
            .join("\n"),
    };

    OutputEntry::new(title.trim(), content.trim())
}

fn render_field(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) if items.iter().all(Value::is_string) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Number(_) | Value::Bool(_) => value.to_string(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

/// Parses a volume plan into split rules.
pub fn parse_split_rules(text: &str) -> Result<Vec<SplitRule>, ParseError> {
    let (value, _) = parse_structured(text)?;

    let candidates: Vec<&Value> = match &value {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => match RULE_LIST_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array))
        {
            Some(items) => items.iter().collect(),
            None => vec![&value],
        },
        _ => Vec::new(),
    };

    let rules: Vec<SplitRule> = candidates
        .into_iter()
        .filter_map(Value::as_object)
        .filter_map(|map| {
            let trigger = first_text(map, &TRIGGER_KEYS)?;
            let group = first_text(map, &GROUP_KEYS)?;
            Some(SplitRule::new(trigger, group))
        })
        .collect();

    if rules.is_empty() {
        return Err(ParseError::NoRules);
    }

    debug!("Parsed {} split rules", rules.len());
    Ok(rules)
}

fn first_text(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| map.get(*key))
        .map(|value| match value {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => String::new(),
        })
        .find(|s| !s.is_empty())
}

/// Parses a generated workflow into a graph.
pub fn parse_graph(text: &str) -> Result<WorkflowGraph, ParseError> {
    let (value, _) = parse_structured(text)?;

    let has_nodes = value
        .get("nodes")
        .and_then(Value::as_array)
        .map_or(false, |nodes| !nodes.is_empty());
    if !has_nodes {
        return Err(ParseError::NotAWorkflow(
            "expected an object with a non-empty 'nodes' list".to_string(),
        ));
    }

    let graph: WorkflowGraph = serde_json::from_value(value)
        .map_err(|e| ParseError::NotAWorkflow(e.to_string()))?;
    Ok(graph)
}

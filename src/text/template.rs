//! Variable Templates
//!
//! Substitutes `{{name}}` tokens from the run variables and extracts
//! variable values from user-supplied text.

use std::collections::BTreeMap;

use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::workflow::model::VariableBinding;

static TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([\w.\-]+)\s*\}\}").expect("valid token pattern"));

/// Errors raised while binding variables.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("invalid pattern for variable '{name}': {source}")]
    InvalidPattern {
        name: String,
        #[source]
        source: regex::Error,
    },
}

/// Replaces every known `{{name}}` token with its value.
///
/// Unknown tokens are left untouched.
///
/// # Example
///
/// ```
/// use std::collections::BTreeMap;
/// use novelflow::text::template::interpolate;
///
/// let mut vars = BTreeMap::new();
/// vars.insert("hero".to_string(), serde_json::json!("Lin"));
///
/// assert_eq!(interpolate("{{hero}} meets {{villain}}", &vars), "Lin meets {{villain}}");
/// ```
pub fn interpolate(text: &str, variables: &BTreeMap<String, Value>) -> String {
    TOKEN
        .replace_all(text, |caps: &regex::Captures<'_>| match variables.get(&caps[1]) {
            Some(value) => render_value(value),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Renders a variable value as prompt text.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Extracts a value for each binding from the given text.
///
/// A binding with a pattern takes its first capture group (or the whole
/// match); one without takes the trimmed text. Bindings whose pattern does
/// not match are left unbound.
pub fn bind_variables(
    text: &str,
    bindings: &[VariableBinding],
) -> Result<Vec<(String, Value)>, TemplateError> {
    let mut bound = Vec::new();

    for binding in bindings {
        let name = binding.name.trim();
        if name.is_empty() {
            continue;
        }

        let value = match binding.pattern.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(pattern) => {
                let regex = Regex::new(pattern).map_err(|source| TemplateError::InvalidPattern {
                    name: name.to_string(),
                    source,
                })?;
                match regex.captures(text) {
                    Some(caps) => caps
                        .get(1)
                        .or_else(|| caps.get(0))
                        .map(|m| m.as_str().trim().to_string()),
                    None => {
                        warn!("Pattern for '{}' did not match the input", name);
                        None
                    }
                }
            }
            None => Some(text.trim().to_string()),
        };

        if let Some(value) = value {
            bound.push((name.to_string(), Value::String(value)));
        }
    }

    Ok(bound)
}

// Module: Expand
// Rewrites ${name} references in the parsed flow tree using configuration variables.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_yaml::Value;
use thiserror::Error;

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z0-9_.-]+)\}").expect("valid placeholder regex"));

/// Expansion failure. Any `${name}` without a matching variable is fatal,
/// even when the surrounding string is never used by the flow.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExpandError {
    #[error("variável '{0}' não definida em configuration.variables")]
    VariableNotDefined(String),
}

/// Rewrites every string scalar in the tree, descending through mappings
/// and sequences. Non-string scalars pass through untouched.
pub fn expand_tree(
    value: &Value,
    variables: &HashMap<String, serde_yaml::Value>,
) -> Result<Value, ExpandError> {
    match value {
        Value::String(s) => Ok(Value::String(expand_str(s, variables)?)),
        Value::Sequence(items) => {
            let mut result = Vec::with_capacity(items.len());
            for item in items {
                result.push(expand_tree(item, variables)?);
            }
            Ok(Value::Sequence(result))
        }
        Value::Mapping(map) => {
            let mut new_map = serde_yaml::Mapping::with_capacity(map.len());
            for (k, v) in map {
                new_map.insert(k.clone(), expand_tree(v, variables)?);
            }
            Ok(Value::Mapping(new_map))
        }
        _ => Ok(value.clone()),
    }
}

/// Replaces all placeholders in one string, left to right, in a single pass.
/// Replacement text is emitted verbatim: a literal `${x}` inside a variable's
/// value survives without re-expansion.
pub fn expand_str(
    input: &str,
    variables: &HashMap<String, serde_yaml::Value>,
) -> Result<String, ExpandError> {
    let mut result = String::new();
    let mut last_index = 0;

    for capture in PLACEHOLDER_RE.captures_iter(input) {
        let matched = capture.get(0).expect("capture group 0");
        result.push_str(&input[last_index..matched.start()]);
        let name = capture.get(1).expect("capture group 1").as_str();
        let value = variables
            .get(name)
            .ok_or_else(|| ExpandError::VariableNotDefined(name.to_string()))?;
        result.push_str(&scalar_text(value));
        last_index = matched.end();
    }

    result.push_str(&input[last_index..]);
    Ok(result)
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        // Sequences and mappings are substituted as compact JSON text.
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

//! Option bags and value coercion.
//!
//! Every configuration layer is an [`OptionBag`]: a JSON object. Bags can be
//! written inline with `serde_json::json!`, or read from YAML/JSON text so that
//! slot configuration can live next to the templates:
//!
//! ```rust
//! use anytemplate::options_from_yaml;
//!
//! let options = options_from_yaml(r#"
//! include_paths: [t/tmpl, t/shared]
//! auto_add_template_extension: true
//! Simple:
//!   template_extension: .tmpl
//!   missing: keep
//! "#).unwrap();
//!
//! assert_eq!(options["include_paths"][1], "t/shared");
//! ```
//!
//! The coercion helpers accept the loose shapes people write in config files:
//! a scalar where a list is expected, `0`/`1` or `"yes"`/`"no"` for booleans.

use serde_json::{Map, Value};

use crate::error::TemplateError;

/// A bag of named options.
pub type OptionBag = Map<String, Value>;

/// Parses an option bag from YAML text. The document must be a mapping.
pub fn options_from_yaml(source: &str) -> Result<OptionBag, TemplateError> {
    if source.trim().is_empty() {
        return Ok(OptionBag::new());
    }
    let value: Value = serde_yaml::from_str(source)?;
    into_bag(value)
}

/// Parses an option bag from JSON text. The document must be an object.
pub fn options_from_json(source: &str) -> Result<OptionBag, TemplateError> {
    let value: Value = serde_json::from_str(source)?;
    into_bag(value)
}

fn into_bag(value: Value) -> Result<OptionBag, TemplateError> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(OptionBag::new()),
        other => Err(TemplateError::Config(format!(
            "expected a mapping of options, found {}",
            kind_of(&other)
        ))),
    }
}

/// Reads a string option. Numbers and booleans are accepted and stringified.
pub(crate) fn option_string(key: &str, value: &Value) -> Result<String, TemplateError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(TemplateError::invalid_option(
            key,
            format!("expected a string, found {}", kind_of(other)),
        )),
    }
}

/// Reads a boolean option.
pub(crate) fn option_bool(key: &str, value: &Value) -> Result<bool, TemplateError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        Value::Number(n) => Ok(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "" | "0" | "false" | "no" | "off" => Ok(false),
            "1" | "true" | "yes" | "on" => Ok(true),
            _ => Err(TemplateError::invalid_option(
                key,
                format!("'{}' is not a boolean", s),
            )),
        },
        other => Err(TemplateError::invalid_option(
            key,
            format!("expected a boolean, found {}", kind_of(other)),
        )),
    }
}

/// Reads a scalar-or-list option as a list of strings.
pub(crate) fn option_list(key: &str, value: &Value) -> Result<Vec<String>, TemplateError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items.iter().map(|item| option_string(key, item)).collect(),
        scalar => Ok(vec![option_string(key, scalar)?]),
    }
}

/// Merges added include paths in front of the base paths.
///
/// Added paths take priority; duplicates are removed keeping the first
/// occurrence, so `base = [a, b]` with `added = [c, a]` gives `[c, a, b]`.
pub fn resolve_include_paths<S: AsRef<str>>(base: &[S], added: &[S]) -> Vec<String> {
    let mut resolved: Vec<String> = Vec::with_capacity(base.len() + added.len());
    for path in added.iter().chain(base.iter()) {
        let path = path.as_ref();
        if !resolved.iter().any(|seen| seen == path) {
            resolved.push(path.to_string());
        }
    }
    resolved
}

/// Looks up a dotted path (`user.name`, `items.0`) in a bag.
pub(crate) fn lookup_path<'a>(bag: &'a OptionBag, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = bag.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Formats a value for splicing into text output.
pub(crate) fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

/// Overlays `overrides` onto `base`, key by key.
pub(crate) fn overlay(base: &mut OptionBag, overrides: &OptionBag) {
    for (key, value) in overrides {
        base.insert(key.clone(), value.clone());
    }
}

pub(crate) fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}

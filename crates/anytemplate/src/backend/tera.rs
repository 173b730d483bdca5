//! Tera backend.
//!
//! Embed calls are a registered Tera function. Tera functions only take
//! named arguments, so the handler name and its arguments are passed as `name`
//! and `args`:
//!
//! ```text
//! {{ CGIAPP_embed(name="header") }}
//! {{ CGIAPP_embed(name="user_box", args=[user.id, "compact"]) }}
//! ```
//!
//! Variables named in `args` that are not set when rendering are passed as
//! empty strings instead of failing the render.
//!
//! The function is marked safe, so component output is not escaped even when
//! autoescaping is on. Templates named by `{% include %}`, `{% extends %}` and
//! `{% import %}` are looked up on the include path and registered alongside
//! the main template.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ::tera::{Context, Function, Tera, Value};

use crate::backend::{
    log_unused_native, standard_defaults, BackendFamily, BackendInit, BackendType, NativeEngine,
    TemplateSource,
};
use crate::dispatch::ComponentDispatcher;
use crate::embed::is_bareword;
use crate::error::TemplateError;
use crate::options::{lookup_path, option_bool, OptionBag};

const DECLARED_KEYS: &[&str] = &["template_extension", "embed_tag_name", "associate_query"];

/// The `Tera` backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct TeraBackend;

impl BackendType for TeraBackend {
    fn name(&self) -> &'static str {
        "Tera"
    }

    fn family(&self) -> BackendFamily {
        BackendFamily::ExpressionAware
    }

    fn declared_config_keys(&self) -> &'static [&'static str] {
        DECLARED_KEYS
    }

    fn association_key(&self) -> &'static str {
        "associate_query"
    }

    fn default_config(&self) -> OptionBag {
        standard_defaults(".html", "associate_query")
    }

    fn required_external_modules(&self) -> &'static [&'static str] {
        &["tera"]
    }

    fn initialize(&self, init: &BackendInit<'_>) -> Result<Box<dyn NativeEngine>, TemplateError> {
        log_unused_native(self.name(), init.native, &["autoescape"]);

        let mut tera = Tera::default();
        if let Some(value) = init.native.get("autoescape") {
            if !option_bool("autoescape", value)? {
                tera.autoescape_on(Vec::new());
            }
        }
        tera.register_function(
            &init.driver.embed_tag_name,
            EmbedFunction {
                dispatcher: Arc::clone(init.dispatcher),
            },
        );

        let name = init.source.engine_name(&init.driver.template_extension);
        let mut templates = vec![(name.clone(), init.text.to_string())];
        let mut seen: HashSet<String> = HashSet::from([name.clone()]);
        if let TemplateSource::File { name: file, .. } = init.source {
            seen.insert(file.clone());
        }
        collect_references(init, init.text, &mut seen, &mut templates)?;

        let mut barewords = Vec::new();
        for (_, text) in &templates {
            for path in embed_barewords(text, &init.driver.embed_tag_name) {
                if !barewords.contains(&path) {
                    barewords.push(path);
                }
            }
        }
        tera.add_raw_templates(templates)?;

        Ok(Box::new(TeraTemplate { tera, name, barewords }))
    }
}

/// Registers, recursively, every template `text` refers to that can be found
/// on the include path.
fn collect_references(
    init: &BackendInit<'_>,
    text: &str,
    seen: &mut HashSet<String>,
    templates: &mut Vec<(String, String)>,
) -> Result<(), TemplateError> {
    for reference in references(text) {
        if !seen.insert(reference.clone()) {
            continue;
        }
        let Some(path) = init
            .include_paths
            .iter()
            .map(|dir| dir.join(&reference))
            .find(|path| path.is_file())
        else {
            tracing::debug!(template = %reference, "referenced template not on include path");
            continue;
        };
        let source = std::fs::read_to_string(&path).map_err(|source| TemplateError::Io {
            path: path.clone(),
            source,
        })?;
        collect_references(init, &source, seen, templates)?;
        templates.push((reference, source));
    }
    Ok(())
}

/// Template names used by `include`, `extends` and `import` tags.
fn references(text: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("{%") {
        rest = &rest[open + 2..];
        let Some(close) = rest.find("%}") else { break };
        let tag = rest[..close].trim().trim_start_matches('-').trim_start();
        let Some((keyword, args)) = tag.split_once(char::is_whitespace) else {
            continue;
        };
        if matches!(keyword, "include" | "extends" | "import") {
            let args = args.trim_start();
            if let Some(quote) = args.chars().next().filter(|c| matches!(c, '"' | '\'' | '`')) {
                if let Some(end) = args[1..].find(quote) {
                    found.push(args[1..1 + end].to_string());
                }
            }
        }
        rest = &rest[close..];
    }
    found
}

/// Variable paths passed in the `args` of calls to `tag`.
fn embed_barewords(text: &str, tag: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut search = 0;
    while let Some(offset) = text[search..].find(tag) {
        let start = search + offset;
        search = start + tag.len();
        let bounded = text[..start]
            .chars()
            .next_back()
            .map_or(true, |c| !(c.is_ascii_alphanumeric() || c == '_'));
        let Some(open) = text[search..].trim_start().strip_prefix('(') else {
            continue;
        };
        let Some(body) = call_body(open).filter(|_| bounded) else {
            continue;
        };
        for arg in split_top_level(body) {
            let Some((key, value)) = arg.split_once('=') else {
                continue;
            };
            if key.trim() != "args" {
                continue;
            }
            let value = value.trim();
            let items = match value.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
                Some(inner) => split_top_level(inner),
                None => vec![value],
            };
            for item in items.into_iter().map(str::trim) {
                if is_bareword(item) && !matches!(item, "true" | "false" | "True" | "False") {
                    found.push(item.to_string());
                }
            }
        }
    }
    found
}

/// Text of a call's argument list, up to the `)` closing it.
fn call_body(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (at, c) in text.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'' | '`') => quote = Some(c),
            (None, '(' | '[' | '{') => depth += 1,
            (None, ')') if depth == 0 => return Some(&text[..at]),
            (None, ')' | ']' | '}') => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    None
}

/// Splits on commas that are outside quotes and brackets.
fn split_top_level(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (at, c) in text.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'' | '`') => quote = Some(c),
            (None, '(' | '[' | '{') => depth += 1,
            (None, ')' | ']' | '}') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                parts.push(&text[start..at]);
                start = at + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

/// Sets `path` to null in `vars`, creating objects on the way, unless it is
/// already reachable. Stops at anything that is not an object.
fn fill_missing(vars: &mut OptionBag, path: &str) {
    let mut parts = path.split('.');
    let Some(first) = parts.next() else { return };
    let rest: Vec<&str> = parts.collect();
    let slot = vars.entry(first.to_string()).or_insert_with(|| placeholder(&rest));
    fill_value(slot, &rest);
}

fn fill_value(value: &mut Value, rest: &[&str]) {
    let (Some((head, tail)), Value::Object(map)) = (rest.split_first(), value) else {
        return;
    };
    let next = map.entry(head.to_string()).or_insert_with(|| placeholder(tail));
    fill_value(next, tail);
}

fn placeholder(rest: &[&str]) -> Value {
    if rest.is_empty() {
        Value::Null
    } else {
        Value::Object(OptionBag::new())
    }
}

struct TeraTemplate {
    tera: Tera,
    name: String,
    barewords: Vec<String>,
}

impl NativeEngine for TeraTemplate {
    fn supports_callbacks(&self) -> bool {
        true
    }

    fn render(&self, vars: &OptionBag, _associated: Option<&OptionBag>) -> Result<String, TemplateError> {
        let context = if self.barewords.iter().any(|path| lookup_path(vars, path).is_none()) {
            let mut vars = vars.clone();
            for path in &self.barewords {
                fill_missing(&mut vars, path);
            }
            Context::from_serialize(&vars)?
        } else {
            Context::from_serialize(vars)?
        };
        Ok(self.tera.render(&self.name, &context)?)
    }
}

struct EmbedFunction {
    dispatcher: Arc<ComponentDispatcher>,
}

impl Function for EmbedFunction {
    fn call(&self, args: &HashMap<String, Value>) -> ::tera::Result<Value> {
        let name = match args.get("name") {
            Some(Value::String(name)) => name.clone(),
            Some(Value::Null) | None => {
                return Err(::tera::Error::msg(
                    "embed function needs a 'name' argument naming the component",
                ))
            }
            Some(other) => other.to_string(),
        };
        let values: Vec<Value> = match args.get("args") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.iter().map(blank_null).collect(),
            Some(single) => vec![blank_null(single)],
        };

        self.dispatcher.dispatch(&name, &values).map(Value::String).map_err(|err| {
            let message = err.to_string();
            self.dispatcher.stash_failure(err);
            ::tera::Error::msg(message)
        })
    }

    fn is_safe(&self) -> bool {
        true
    }
}

fn blank_null(value: &Value) -> Value {
    match value {
        Value::Null => Value::String(String::new()),
        other => other.clone(),
    }
}

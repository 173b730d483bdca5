//! Text substitution backend.
//!
//! [`SimpleEngine`] replaces `{{ name }}` markers with variable values and
//! does nothing else: no loops, conditionals, filters or escaping. Paths may
//! use dots for nested values (`{{ user.name }}`, `{{ items.0 }}`).
//!
//! ```rust
//! use anytemplate::SimpleEngine;
//! use serde_json::json;
//!
//! let engine = SimpleEngine::new();
//! let data = json!({"name": "World", "user": {"email": "test@example.com"}});
//!
//! let output = engine.render(
//!     "Hello, {{ name }}! Contact: {{user.email}}",
//!     data.as_object().unwrap(),
//! ).unwrap();
//!
//! assert_eq!(output, "Hello, World! Contact: test@example.com");
//! ```
//!
//! The engine can look up variables in a second, lower-priority map. The
//! `Simple` backend uses that to associate query parameters natively: values
//! set on the session always win over query values.
//!
//! Embed calls are emulated: they are written straight into the markup as
//! `CGIAPP_embed('name', arg)`, or alone inside a marker as
//! `{{ CGIAPP_embed('name', arg) }}`, and replaced after substitution.

use std::sync::Arc;

use crate::backend::{
    log_unused_native, standard_defaults, BackendFamily, BackendInit, BackendType, NativeEngine,
};
use crate::dispatch::ComponentDispatcher;
use crate::embed::Emulated;
use crate::error::TemplateError;
use crate::options::{lookup_path, option_string, value_text, OptionBag};

const DECLARED_KEYS: &[&str] = &["template_extension", "embed_tag_name", "associate_query"];

/// What to do with a marker whose variable is not set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MissingVariable {
    /// Render nothing.
    #[default]
    Empty,
    /// Leave the marker in the output.
    Keep,
    /// Fail the render.
    Error,
}

impl MissingVariable {
    fn parse(value: &str) -> Result<Self, TemplateError> {
        match value {
            "empty" => Ok(MissingVariable::Empty),
            "keep" => Ok(MissingVariable::Keep),
            "error" => Ok(MissingVariable::Error),
            other => Err(TemplateError::invalid_option(
                "missing",
                format!("expected 'empty', 'keep' or 'error', found '{}'", other),
            )),
        }
    }
}

/// A lightweight `{{ name }}` substitution engine.
///
/// `SimpleEngine` is `Send + Sync` and holds no templates; every call parses
/// the text it is given.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleEngine {
    missing: MissingVariable,
}

impl SimpleEngine {
    /// Creates an engine that renders unset variables as nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the policy for unset variables.
    pub fn missing(mut self, missing: MissingVariable) -> Self {
        self.missing = missing;
        self
    }

    /// Checks that every marker in `template` is closed and names something.
    pub fn check(&self, template: &str) -> Result<(), TemplateError> {
        let mut rest = template;
        while let Some(open) = rest.find("{{") {
            let (name, after) = Self::marker(&rest[open + 2..])?;
            if name.is_empty() {
                return Err(TemplateError::Substitution(
                    "empty variable name in template".to_string(),
                ));
            }
            rest = after;
        }
        Ok(())
    }

    /// Renders `template` with `data`.
    pub fn render(&self, template: &str, data: &OptionBag) -> Result<String, TemplateError> {
        self.render_associated(template, data, None)
    }

    /// Renders `template`, looking names up in `data` first and then in
    /// `associated`.
    pub fn render_associated(
        &self,
        template: &str,
        data: &OptionBag,
        associated: Option<&OptionBag>,
    ) -> Result<String, TemplateError> {
        let mut result = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find("{{") {
            result.push_str(&rest[..open]);
            let (name, after) = Self::marker(&rest[open + 2..])?;
            if name.is_empty() {
                return Err(TemplateError::Substitution(
                    "empty variable name in template".to_string(),
                ));
            }

            let value = lookup_path(data, name)
                .or_else(|| associated.and_then(|bag| lookup_path(bag, name)));
            match (value, self.missing) {
                (Some(value), _) => result.push_str(&value_text(value)),
                (None, MissingVariable::Empty) => {}
                (None, MissingVariable::Keep) => {
                    result.push_str(&rest[open..rest.len() - after.len()])
                }
                (None, MissingVariable::Error) => {
                    return Err(TemplateError::Substitution(format!(
                        "variable '{}' is not set",
                        name
                    )))
                }
            }
            rest = after;
        }

        result.push_str(rest);
        Ok(result)
    }

    /// Splits `{{ name }}rest` (without the opening braces) into the trimmed
    /// name and the text after the closing braces.
    fn marker(text: &str) -> Result<(&str, &str), TemplateError> {
        let close = text.find("}}").ok_or_else(|| {
            let shown: String = text.chars().take(20).collect();
            TemplateError::Substitution(format!("unclosed variable substitution: {{{{{}", shown))
        })?;
        Ok((text[..close].trim(), &text[close + 2..]))
    }
}

/// The `Simple` backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleBackend;

impl BackendType for SimpleBackend {
    fn name(&self) -> &'static str {
        "Simple"
    }

    fn family(&self) -> BackendFamily {
        BackendFamily::TextSubstitution
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
        &[]
    }

    fn initialize(&self, init: &BackendInit<'_>) -> Result<Box<dyn NativeEngine>, TemplateError> {
        log_unused_native(self.name(), init.native, &["missing"]);
        let missing = match init.native.get("missing") {
            Some(value) => MissingVariable::parse(&option_string("missing", value)?)?,
            None => MissingVariable::default(),
        };
        let engine = SimpleEngine::new().missing(missing);

        let tag = &init.driver.embed_tag_name;
        let mut emulated = Emulated::rewrite(init.text, tag, Emulated::sentinel)?;
        emulated.unwrap_markers(tag, "{{", "}}")?;
        engine.check(&emulated.source)?;

        Ok(Box::new(SimpleTemplate {
            engine,
            emulated,
            dispatcher: Arc::clone(init.dispatcher),
        }))
    }
}

struct SimpleTemplate {
    engine: SimpleEngine,
    emulated: Emulated,
    dispatcher: Arc<ComponentDispatcher>,
}

impl NativeEngine for SimpleTemplate {
    fn supports_callbacks(&self) -> bool {
        false
    }

    fn binds_query_natively(&self) -> bool {
        true
    }

    fn render(&self, vars: &OptionBag, associated: Option<&OptionBag>) -> Result<String, TemplateError> {
        if self.emulated.is_empty() {
            return self
                .engine
                .render_associated(&self.emulated.source, vars, associated);
        }

        let scrubbed = associated.map(Emulated::scrub);
        let rendered = self.engine.render_associated(
            &self.emulated.source,
            &Emulated::scrub(vars),
            scrubbed.as_ref(),
        )?;
        match associated {
            None => self.emulated.splice(&rendered, vars, &self.dispatcher),
            Some(query) => {
                let mut visible = query.clone();
                visible.extend(vars.clone());
                self.emulated.splice(&rendered, &visible, &self.dispatcher)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn bag(value: Value) -> OptionBag {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_simple_substitution() {
        let engine = SimpleEngine::new();
        let output = engine.render("Hello, {{name}}!", &bag(json!({"name": "World"}))).unwrap();
        assert_eq!(output, "Hello, World!");
    }

    #[test]
    fn test_nested_and_indexed_access() {
        let engine = SimpleEngine::new();
        let data = bag(json!({
            "user": {"name": "Alice", "profile": {"email": "alice@example.com"}},
            "items": ["first", "second"],
        }));
        let output = engine
            .render("{{ user.name }} <{{ user.profile.email }}> {{ items.1 }}", &data)
            .unwrap();
        assert_eq!(output, "Alice <alice@example.com> second");
    }

    #[test]
    fn test_scalar_formatting() {
        let engine = SimpleEngine::new();
        let data = bag(json!({"n": 42, "f": 19.5, "b": false, "z": null}));
        let output = engine.render("{{n}} {{f}} {{b}} [{{z}}]", &data).unwrap();
        assert_eq!(output, "42 19.5 false []");
    }

    #[test]
    fn test_single_braces_pass_through() {
        let engine = SimpleEngine::new();
        let output = engine.render("fn() { {{x}} }", &bag(json!({"x": 1}))).unwrap();
        assert_eq!(output, "fn() { 1 }");
    }

    #[test]
    fn test_missing_policies() {
        let data = bag(json!({}));
        let template = "a{{ gone }}b";
        assert_eq!(SimpleEngine::new().render(template, &data).unwrap(), "ab");
        assert_eq!(
            SimpleEngine::new()
                .missing(MissingVariable::Keep)
                .render(template, &data)
                .unwrap(),
            "a{{ gone }}b"
        );
        let err = SimpleEngine::new()
            .missing(MissingVariable::Error)
            .render(template, &data)
            .unwrap_err();
        assert!(err.to_string().contains("'gone'"));
    }

    #[test]
    fn test_associated_values_are_lower_priority() {
        let engine = SimpleEngine::new();
        let data = bag(json!({"page": "set"}));
        let query = bag(json!({"page": "query", "sort": "asc"}));
        let output = engine
            .render_associated("{{page}} {{sort}}", &data, Some(&query))
            .unwrap();
        assert_eq!(output, "set asc");
    }

    #[test]
    fn test_unclosed_and_empty_markers() {
        let engine = SimpleEngine::new();
        let err = engine.render("Hello {{ name", &OptionBag::new()).unwrap_err();
        assert!(err.to_string().contains("unclosed"));
        assert!(engine.check("Hello {{ }}").is_err());
        assert!(engine.check("Hello {{ name }}").is_ok());
    }

    #[test]
    fn test_missing_option_values() {
        assert_eq!(MissingVariable::parse("keep").unwrap(), MissingVariable::Keep);
        assert!(MissingVariable::parse("loud").is_err());
    }
}

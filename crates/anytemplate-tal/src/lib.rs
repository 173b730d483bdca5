//! XML attribute-language templates.
//!
//! This crate renders XHTML/XML documents whose dynamic parts are expressed as
//! attributes in the `tal:` namespace, in the style of Zope's Template
//! Attribute Language. Markup stays well-formed and viewable in a browser
//! before it is rendered.
//!
//! # Example
//!
//! ```rust
//! use anytemplate_tal::TalTemplate;
//! use serde_json::json;
//!
//! let template = TalTemplate::parse(
//!     r#"<p tal:content="user.name">placeholder</p>"#,
//! ).unwrap();
//!
//! let data = json!({"user": {"name": "Ada & Co"}});
//! let output = template.render(data.as_object().unwrap()).unwrap();
//! assert_eq!(output, "<p>Ada &amp; Co</p>");
//! ```
//!
//! # Directives
//!
//! | Attribute | Effect |
//! |-----------|--------|
//! | `tal:condition="expr"` | Drops the element when `expr` is falsy |
//! | `tal:replace="expr"` | Replaces the whole element with the value |
//! | `tal:content="expr"` | Replaces the element's children with the value |
//! | `tal:attributes="name expr; other expr"` | Sets (or removes, for `nothing`) attributes |
//! | `tal:omit-tag=""` | Emits the children without the element's own tags |
//!
//! Directives are applied in that order. `xmlns:tal` declarations are dropped
//! from the output.
//!
//! # Expressions
//!
//! - `user.name` or `user/name` - path lookup into the data
//! - `structure path` - insert the value without escaping
//! - `string:literal text` - a literal string
//! - `not:path` - boolean negation (for conditions)
//! - `nothing` - the null value
//!
//! There is no callback or function-call mechanism: values come from the data
//! map only.

use std::borrow::Cow;
use std::io::Write;

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use serde_json::{Map, Value};

const TAL_PREFIX: &str = "tal:";

/// Errors produced while parsing or rendering a template.
#[derive(Debug, thiserror::Error)]
pub enum TalError {
    /// The markup could not be read or written as XML.
    #[error("xml error: {0}")]
    Xml(String),

    /// An element was opened but never closed, or closed twice.
    #[error("unbalanced markup: {0}")]
    Unbalanced(String),

    /// A `tal:` attribute this engine does not implement.
    #[error("unknown directive tal:{0}")]
    UnknownDirective(String),

    /// An expression that could not be parsed.
    #[error("invalid expression '{0}'")]
    InvalidExpression(String),

    /// A path that resolved to nothing while rendering in strict mode.
    #[error("undefined path '{0}'")]
    Undefined(String),
}

impl TalError {
    fn xml(err: impl std::fmt::Display) -> Self {
        TalError::Xml(err.to_string())
    }
}

/// Rendering options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TalOptions {
    /// Fail on paths that do not resolve instead of rendering them empty.
    pub strict: bool,
}

/// A parsed attribute-language template.
///
/// Parsing checks that the markup is well-formed and that every `tal:`
/// attribute is a known directive with a parseable expression; rendering can
/// then only fail on data-dependent conditions (strict-mode lookups).
#[derive(Debug, Clone)]
pub struct TalTemplate {
    source: String,
    options: TalOptions,
}

impl TalTemplate {
    /// Parses a template with default options.
    pub fn parse(source: impl Into<String>) -> Result<Self, TalError> {
        Self::parse_with(source, TalOptions::default())
    }

    /// Parses a template with the given options.
    pub fn parse_with(source: impl Into<String>, options: TalOptions) -> Result<Self, TalError> {
        let template = Self {
            source: source.into(),
            options,
        };
        template.validate()?;
        Ok(template)
    }

    /// Returns the template source.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns the options this template renders with.
    pub fn options(&self) -> TalOptions {
        self.options
    }

    fn validate(&self) -> Result<(), TalError> {
        let mut reader = Reader::from_str(&self.source);
        let mut depth: usize = 0;
        loop {
            match reader.read_event().map_err(TalError::xml)? {
                Event::Start(start) => {
                    Element::parse(&start)?;
                    depth += 1;
                }
                Event::Empty(start) => {
                    Element::parse(&start)?;
                }
                Event::End(end) => {
                    depth = depth.checked_sub(1).ok_or_else(|| {
                        TalError::Unbalanced(String::from_utf8_lossy(end.name().as_ref()).into())
                    })?;
                }
                Event::Eof => break,
                _ => {}
            }
        }
        if depth != 0 {
            return Err(TalError::Unbalanced(format!("{} unclosed element(s)", depth)));
        }
        Ok(())
    }

    /// Renders the template against a data map.
    pub fn render(&self, data: &Map<String, Value>) -> Result<String, TalError> {
        let mut reader = Reader::from_str(&self.source);
        let mut writer = Writer::new(Vec::with_capacity(self.source.len()));
        let mut open: Vec<bool> = Vec::new();
        let mut skipping: Option<Skip> = None;
        let scope = Scope {
            data,
            strict: self.options.strict,
        };

        loop {
            let event = reader.read_event().map_err(TalError::xml)?;

            if let Some(skip) = skipping.as_mut() {
                match event {
                    Event::Start(_) => skip.depth += 1,
                    Event::End(_) if skip.depth == 0 => {
                        if let Some(name) = skip.close.take() {
                            writer
                                .write_event(Event::End(BytesEnd::new(name)))
                                .map_err(TalError::xml)?;
                        }
                        skipping = None;
                    }
                    Event::End(_) => skip.depth -= 1,
                    Event::Eof => {
                        return Err(TalError::Unbalanced("unexpected end of input".into()))
                    }
                    _ => {}
                }
                continue;
            }

            match event {
                Event::Start(start) => {
                    let element = Element::parse(&start)?;
                    match element.open(&scope, &mut writer)? {
                        Opened::Descend { close } => open.push(close),
                        Opened::Skip { close } => skipping = Some(Skip { depth: 0, close }),
                    }
                }
                Event::Empty(start) => {
                    let element = Element::parse(&start)?;
                    element.empty(&scope, &mut writer)?;
                }
                Event::End(end) => {
                    let close = open.pop().ok_or_else(|| {
                        TalError::Unbalanced(String::from_utf8_lossy(end.name().as_ref()).into())
                    })?;
                    if close {
                        writer.write_event(Event::End(end)).map_err(TalError::xml)?;
                    }
                }
                Event::Eof => break,
                other => writer.write_event(other).map_err(TalError::xml)?,
            }
        }

        String::from_utf8(writer.into_inner()).map_err(TalError::xml)
    }
}

struct Skip {
    depth: usize,
    close: Option<String>,
}

enum Opened {
    /// Children are rendered; `close` says whether to write the end tag.
    Descend { close: bool },
    /// Children are dropped; `close` names an end tag to write afterwards.
    Skip { close: Option<String> },
}

struct Scope<'a> {
    data: &'a Map<String, Value>,
    strict: bool,
}

impl Scope<'_> {
    fn eval(&self, expr: &Expr) -> Result<Value, TalError> {
        match expr {
            Expr::Nothing => Ok(Value::Null),
            Expr::Literal(text) => Ok(Value::String(text.clone())),
            Expr::Not(inner) => Ok(Value::Bool(!truthy(&self.eval(inner)?))),
            Expr::Path(path) => match lookup(self.data, path) {
                Some(value) => Ok(value.clone()),
                None if self.strict => Err(TalError::Undefined(path.clone())),
                None => Ok(Value::Null),
            },
        }
    }

    fn text(&self, insert: &Insert) -> Result<Option<String>, TalError> {
        let value = self.eval(&insert.expr)?;
        if value.is_null() {
            return Ok(None);
        }
        let text = to_text(&value);
        Ok(Some(if insert.structure {
            text
        } else {
            escape(&text).into_owned()
        }))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Path(String),
    Literal(String),
    Not(Box<Expr>),
    Nothing,
}

impl Expr {
    fn parse(raw: &str) -> Result<Self, TalError> {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix("string:") {
            return Ok(Expr::Literal(rest.to_string()));
        }
        if let Some(rest) = raw.strip_prefix("not:") {
            return Ok(Expr::Not(Box::new(Expr::parse(rest)?)));
        }
        if raw == "nothing" {
            return Ok(Expr::Nothing);
        }
        let valid = !raw.is_empty()
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | '-'));
        if !valid {
            return Err(TalError::InvalidExpression(raw.to_string()));
        }
        Ok(Expr::Path(raw.replace('/', ".")))
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Insert {
    structure: bool,
    expr: Expr,
}

impl Insert {
    fn parse(raw: &str) -> Result<Self, TalError> {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix("structure ") {
            return Ok(Insert {
                structure: true,
                expr: Expr::parse(rest)?,
            });
        }
        let raw = raw.strip_prefix("text ").unwrap_or(raw);
        Ok(Insert {
            structure: false,
            expr: Expr::parse(raw)?,
        })
    }
}

#[derive(Debug, Default)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    condition: Option<Expr>,
    replace: Option<Insert>,
    content: Option<Insert>,
    set_attributes: Vec<(String, Expr)>,
    omit_tag: Option<Option<Expr>>,
}

impl Element {
    fn parse(start: &BytesStart<'_>) -> Result<Self, TalError> {
        let mut element = Element {
            name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
            ..Default::default()
        };

        for attr in start.attributes() {
            let attr = attr.map_err(TalError::xml)?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value().map_err(TalError::xml)?.into_owned();

            if key == "xmlns:tal" {
                continue;
            }
            let Some(directive) = key.strip_prefix(TAL_PREFIX).map(str::to_owned) else {
                element.attributes.push((key, value));
                continue;
            };
            match directive.as_str() {
                "condition" => element.condition = Some(Expr::parse(&value)?),
                "replace" => element.replace = Some(Insert::parse(&value)?),
                "content" => element.content = Some(Insert::parse(&value)?),
                "attributes" => {
                    for pair in value.split(';').map(str::trim).filter(|p| !p.is_empty()) {
                        let (name, expr) = pair
                            .split_once(char::is_whitespace)
                            .ok_or_else(|| TalError::InvalidExpression(pair.to_string()))?;
                        element
                            .set_attributes
                            .push((name.to_string(), Expr::parse(expr)?));
                    }
                }
                "omit-tag" => {
                    element.omit_tag = Some(if value.trim().is_empty() {
                        None
                    } else {
                        Some(Expr::parse(&value)?)
                    });
                }
                other => return Err(TalError::UnknownDirective(other.to_string())),
            }
        }

        Ok(element)
    }

    fn visible(&self, scope: &Scope<'_>) -> Result<bool, TalError> {
        match &self.condition {
            Some(expr) => Ok(truthy(&scope.eval(expr)?)),
            None => Ok(true),
        }
    }

    fn omitted(&self, scope: &Scope<'_>) -> Result<bool, TalError> {
        match &self.omit_tag {
            None => Ok(false),
            Some(None) => Ok(true),
            Some(Some(expr)) => Ok(truthy(&scope.eval(expr)?)),
        }
    }

    fn start_tag(&self, scope: &Scope<'_>) -> Result<BytesStart<'static>, TalError> {
        let mut attributes = self.attributes.clone();
        for (name, expr) in &self.set_attributes {
            let value = scope.eval(expr)?;
            attributes.retain(|(existing, _)| existing != name);
            if !value.is_null() {
                attributes.push((name.clone(), to_text(&value)));
            }
        }

        let mut tag = BytesStart::new(self.name.clone());
        for (key, value) in &attributes {
            tag.push_attribute((key.as_str(), value.as_str()));
        }
        Ok(tag)
    }

    fn open(&self, scope: &Scope<'_>, writer: &mut Writer<Vec<u8>>) -> Result<Opened, TalError> {
        if !self.visible(scope)? {
            return Ok(Opened::Skip { close: None });
        }
        if let Some(replace) = &self.replace {
            write_raw(writer, scope.text(replace)?.as_deref())?;
            return Ok(Opened::Skip { close: None });
        }

        let omit = self.omitted(scope)?;
        if !omit {
            writer
                .write_event(Event::Start(self.start_tag(scope)?))
                .map_err(TalError::xml)?;
        }

        match &self.content {
            Some(content) => {
                write_raw(writer, scope.text(content)?.as_deref())?;
                Ok(Opened::Skip {
                    close: (!omit).then(|| self.name.clone()),
                })
            }
            None => Ok(Opened::Descend { close: !omit }),
        }
    }

    fn empty(&self, scope: &Scope<'_>, writer: &mut Writer<Vec<u8>>) -> Result<(), TalError> {
        if !self.visible(scope)? {
            return Ok(());
        }
        if let Some(replace) = &self.replace {
            return write_raw(writer, scope.text(replace)?.as_deref());
        }

        let omit = self.omitted(scope)?;
        match (&self.content, omit) {
            (Some(content), true) => write_raw(writer, scope.text(content)?.as_deref()),
            (Some(content), false) => {
                writer
                    .write_event(Event::Start(self.start_tag(scope)?))
                    .map_err(TalError::xml)?;
                write_raw(writer, scope.text(content)?.as_deref())?;
                writer
                    .write_event(Event::End(BytesEnd::new(self.name.clone())))
                    .map_err(TalError::xml)
            }
            (None, true) => Ok(()),
            (None, false) => writer
                .write_event(Event::Empty(self.start_tag(scope)?))
                .map_err(TalError::xml),
        }
    }
}

fn write_raw(writer: &mut Writer<Vec<u8>>, text: Option<&str>) -> Result<(), TalError> {
    if let Some(text) = text {
        writer
            .get_mut()
            .write_all(text.as_bytes())
            .map_err(TalError::xml)?;
    }
    Ok(())
}

fn lookup<'a>(data: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = data.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

fn escape(text: &str) -> Cow<'_, str> {
    quick_xml::escape::escape(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(source: &str, data: Value) -> String {
        TalTemplate::parse(source)
            .unwrap()
            .render(data.as_object().unwrap())
            .unwrap()
    }

    #[test]
    fn test_content_replaces_children() {
        let out = render(
            r#"<div><span tal:content="name">old <b>markup</b></span></div>"#,
            json!({"name": "new"}),
        );
        assert_eq!(out, "<div><span>new</span></div>");
    }

    #[test]
    fn test_content_is_escaped() {
        let out = render(r#"<p tal:content="v">x</p>"#, json!({"v": "<b>"}));
        assert_eq!(out, "<p>&lt;b&gt;</p>");
    }

    #[test]
    fn test_structure_is_not_escaped() {
        let out = render(
            r#"<p tal:content="structure v">x</p>"#,
            json!({"v": "<b>hi</b>"}),
        );
        assert_eq!(out, "<p><b>hi</b></p>");
    }

    #[test]
    fn test_replace_drops_element() {
        let out = render(
            r#"<div><span tal:replace="v">x</span>!</div>"#,
            json!({"v": "text"}),
        );
        assert_eq!(out, "<div>text!</div>");
    }

    #[test]
    fn test_replace_on_empty_element() {
        let out = render(r#"<div><br tal:replace="v"/></div>"#, json!({"v": "t"}));
        assert_eq!(out, "<div>t</div>");
    }

    #[test]
    fn test_condition() {
        let src = r#"<div><p tal:condition="show">yes</p><p tal:condition="not:show">no</p></div>"#;
        assert_eq!(render(src, json!({"show": true})), "<div><p>yes</p></div>");
        assert_eq!(render(src, json!({"show": false})), "<div><p>no</p></div>");
    }

    #[test]
    fn test_condition_on_nested_children() {
        let src = r#"<div><ul tal:condition="items"><li><i>a</i></li></ul>end</div>"#;
        assert_eq!(render(src, json!({"items": []})), "<div>end</div>");
    }

    #[test]
    fn test_attributes() {
        let out = render(
            r#"<a href="x" class="c" tal:attributes="href url; class nothing">go</a>"#,
            json!({"url": "/home"}),
        );
        assert_eq!(out, r#"<a href="/home">go</a>"#);
    }

    #[test]
    fn test_omit_tag() {
        let out = render(
            r#"<div><span tal:omit-tag="">inner <b>bold</b></span></div>"#,
            json!({}),
        );
        assert_eq!(out, "<div>inner <b>bold</b></div>");
    }

    #[test]
    fn test_slash_paths_and_indices() {
        let out = render(
            r#"<p tal:content="users/1/name">x</p>"#,
            json!({"users": [{"name": "a"}, {"name": "b"}]}),
        );
        assert_eq!(out, "<p>b</p>");
    }

    #[test]
    fn test_string_literal() {
        let out = render(r#"<p tal:content="string:hello world">x</p>"#, json!({}));
        assert_eq!(out, "<p>hello world</p>");
    }

    #[test]
    fn test_tal_namespace_declaration_dropped() {
        let out = render(
            r#"<html xmlns:tal="http://xml.zope.org/namespaces/tal"><p tal:content="v">x</p></html>"#,
            json!({"v": 1}),
        );
        assert_eq!(out, "<html><p>1</p></html>");
    }

    #[test]
    fn test_missing_path_renders_empty() {
        let out = render(r#"<p tal:content="missing">x</p>"#, json!({}));
        assert_eq!(out, "<p></p>");
    }

    #[test]
    fn test_missing_path_strict() {
        let template = TalTemplate::parse_with(
            r#"<p tal:content="missing">x</p>"#,
            TalOptions { strict: true },
        )
        .unwrap();
        let err = template.render(&Map::new()).unwrap_err();
        assert!(matches!(err, TalError::Undefined(ref p) if p == "missing"));
    }

    #[test]
    fn test_unknown_directive_rejected_at_parse() {
        let err = TalTemplate::parse(r#"<p tal:repeat="x items">x</p>"#).unwrap_err();
        assert!(matches!(err, TalError::UnknownDirective(ref d) if d == "repeat"));
    }

    #[test]
    fn test_invalid_expression_rejected_at_parse() {
        let err = TalTemplate::parse(r#"<p tal:content="a b(">x</p>"#).unwrap_err();
        assert!(matches!(err, TalError::InvalidExpression(_)));
    }

    #[test]
    fn test_unclosed_element_rejected() {
        assert!(TalTemplate::parse("<div><p>text</div>").is_err());
    }

    #[test]
    fn test_plain_markup_passes_through() {
        let src = "<?xml version=\"1.0\"?>\n<!-- note --><root a=\"1\">text &amp; more</root>";
        assert_eq!(render(src, json!({})), src);
    }
}

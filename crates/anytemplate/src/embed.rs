//! Tag emulation for engines without a callback mechanism.
//!
//! Engines that cannot call back into the application still get embedded
//! components, at a reduced feature level:
//!
//! 1. At load time the raw template is scanned for `TAG(arg, ...)` calls. Each
//!    call is parsed and replaced by a placeholder chosen by the backend.
//! 2. The native engine renders the rewritten template. Placeholders come out
//!    as sentinel markers (`\u{1A}embed:N\u{1A}`).
//! 3. Each marker left in the output is replaced by the output of call `N`,
//!    dispatched with its arguments resolved against the variable bag as it
//!    stands at render time.
//!
//! Calls that end up in untaken branches never reach the output, so their
//! handlers never run.
//!
//! Variable data never carries sentinel marks into the native render: the
//! mark character is stripped from every string before binding, so a value
//! cannot forge a call.
//!
//! # Argument Syntax
//!
//! Arguments are separated by commas. A token quoted with `'` or `"` is a
//! literal string (backslash escapes the next character). Any other token must
//! be a bareword, `[A-Za-z_][A-Za-z0-9_.]*`, and is looked up in the variable
//! bag; a bareword that does not resolve becomes the empty string. The first
//! argument names the handler.
//!
//! Expressions, numbers and nested calls are not understood; they make the
//! call malformed, which fails the load.

use serde_json::Value;

use crate::dispatch::ComponentDispatcher;
use crate::error::TemplateError;
use crate::options::{lookup_path, OptionBag};

const MARK: char = '\u{1A}';
const MARK_PREFIX: &str = "\u{1A}embed:";

/// One parsed embed argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbedArg {
    /// A quoted string, unescaped.
    Literal(String),
    /// A variable path, resolved when the call is dispatched.
    Bareword(String),
}

impl EmbedArg {
    /// Resolves the argument against a variable bag.
    pub fn resolve(&self, vars: &OptionBag) -> Value {
        match self {
            EmbedArg::Literal(text) => Value::String(text.clone()),
            EmbedArg::Bareword(path) => lookup_path(vars, path)
                .cloned()
                .filter(|value| !value.is_null())
                .unwrap_or_else(|| Value::String(String::new())),
        }
    }
}

/// One embed call found in a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedCall {
    /// The call as written, for error messages.
    pub raw: String,
    /// The handler name argument.
    pub handler: EmbedArg,
    /// The remaining arguments.
    pub args: Vec<EmbedArg>,
}

impl EmbedCall {
    /// Dispatches the call, resolving barewords against `vars`.
    pub fn dispatch(&self, vars: &OptionBag, dispatcher: &ComponentDispatcher) -> Result<String, TemplateError> {
        let handler = match self.handler.resolve(vars) {
            Value::String(name) => name,
            other => other.to_string(),
        };
        let args: Vec<Value> = self.args.iter().map(|arg| arg.resolve(vars)).collect();
        dispatcher.dispatch(&handler, &args)
    }
}

/// A template rewritten for emulated embedding.
#[derive(Debug, Clone, Default)]
pub struct Emulated {
    /// The rewritten source to hand to the native engine.
    pub source: String,
    /// Calls in placeholder order.
    pub calls: Vec<EmbedCall>,
    offsets: Vec<usize>,
}

impl Emulated {
    /// Scans `text` for calls to `tag` and replaces each one with
    /// `placeholder(index)`.
    pub fn rewrite(text: &str, tag: &str, placeholder: impl Fn(usize) -> String) -> Result<Self, TemplateError> {
        let mut emulated = Emulated {
            source: String::with_capacity(text.len()),
            ..Default::default()
        };
        for segment in Scanner::new(text, tag) {
            match segment? {
                Segment::Text(text) => emulated.source.push_str(text),
                Segment::Call(call) => {
                    emulated.offsets.push(emulated.source.len());
                    emulated.source.push_str(&placeholder(emulated.calls.len()));
                    emulated.calls.push(call);
                }
            }
        }
        Ok(emulated)
    }

    /// Lets a call stand alone inside an engine's own `open`/`close` marker,
    /// as in `{{ TAG('x') }}`: the whole marker becomes the call's sentinel.
    ///
    /// Only meaningful for sources rewritten with [`Emulated::sentinel`]
    /// placeholders. A call sharing a marker with anything else is malformed.
    pub fn unwrap_markers(&mut self, tag: &str, open: &str, close: &str) -> Result<(), TemplateError> {
        if self.calls.is_empty() {
            return Ok(());
        }

        let mut source = String::with_capacity(self.source.len());
        let mut rest = self.source.as_str();
        while let Some(start) = rest.find(open) {
            let inner_start = start + open.len();
            let Some(len) = rest[inner_start..].find(close) else {
                break;
            };
            let inner = &rest[inner_start..inner_start + len];
            let end = inner_start + len + close.len();
            source.push_str(&rest[..start]);
            if self.sentinel_index(inner.trim()).is_some() {
                source.push_str(inner.trim());
            } else if let Some(call) = self.first_call_in(inner) {
                return Err(TemplateError::MalformedEmbed {
                    tag: tag.to_string(),
                    call: call.raw.clone(),
                    reason: format!("must be the only thing inside '{} {}'", open, close),
                });
            } else {
                source.push_str(&rest[start..end]);
            }
            rest = &rest[end..];
        }
        source.push_str(rest);

        self.offsets = source.match_indices(MARK_PREFIX).map(|(at, _)| at).collect();
        self.source = source;
        Ok(())
    }

    /// Byte offsets of the placeholders in `source`, in call order.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Returns true if the template had no embed calls.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Variable name the placeholder for call `index` can bind to.
    pub fn variable(index: usize) -> String {
        format!("__embed_{}", index)
    }

    /// Sentinel text standing in for call `index` in native output.
    pub fn sentinel(index: usize) -> String {
        format!("{}{}{}", MARK_PREFIX, index, MARK)
    }

    /// Copy of `vars` with the sentinel mark removed from every string.
    pub fn scrub(vars: &OptionBag) -> OptionBag {
        vars.iter().map(|(key, value)| (key.clone(), scrub_value(value))).collect()
    }

    /// Adds the placeholder variables to a scrubbed copy of `vars`.
    pub fn bind(&self, vars: &OptionBag) -> OptionBag {
        let mut bound = Self::scrub(vars);
        for index in 0..self.calls.len() {
            bound.insert(Self::variable(index), Value::String(Self::sentinel(index)));
        }
        bound
    }

    /// Replaces each sentinel in `rendered` with its call's output.
    ///
    /// A sentinel naming a call that does not exist is left as it is.
    pub fn splice(
        &self,
        rendered: &str,
        vars: &OptionBag,
        dispatcher: &ComponentDispatcher,
    ) -> Result<String, TemplateError> {
        if self.calls.is_empty() {
            return Ok(rendered.to_string());
        }

        let mut output = String::with_capacity(rendered.len());
        let mut rest = rendered;
        while let Some(start) = rest.find(MARK_PREFIX) {
            output.push_str(&rest[..start]);
            let after = &rest[start + MARK_PREFIX.len()..];
            let call = after.find(MARK).and_then(|end| {
                let index = after[..end].parse::<usize>().ok()?;
                Some((self.calls.get(index)?, end))
            });
            match call {
                Some((call, end)) => {
                    tracing::trace!(call = %call.raw, "splicing emulated embed");
                    output.push_str(&call.dispatch(vars, dispatcher)?);
                    rest = &after[end + MARK.len_utf8()..];
                }
                None => {
                    output.push_str(MARK_PREFIX);
                    rest = after;
                }
            }
        }
        output.push_str(rest);
        Ok(output)
    }

    /// Index of the call whose sentinel is exactly `text`.
    fn sentinel_index(&self, text: &str) -> Option<usize> {
        let index = text.strip_prefix(MARK_PREFIX)?.strip_suffix(MARK)?.parse::<usize>().ok()?;
        (index < self.calls.len()).then_some(index)
    }

    /// The first call whose sentinel appears anywhere in `text`.
    fn first_call_in(&self, text: &str) -> Option<&EmbedCall> {
        let after = &text[text.find(MARK_PREFIX)? + MARK_PREFIX.len()..];
        let index = after[..after.find(MARK)?].parse::<usize>().ok()?;
        self.calls.get(index)
    }
}

fn scrub_value(value: &Value) -> Value {
    match value {
        Value::String(text) if text.contains(MARK) => Value::String(text.replace(MARK, "")),
        Value::Array(items) => Value::Array(items.iter().map(scrub_value).collect()),
        Value::Object(map) => Value::Object(Emulated::scrub(map)),
        other => other.clone(),
    }
}

#[derive(Debug)]
enum Segment<'a> {
    Text(&'a str),
    Call(EmbedCall),
}

/// Splits a template into plain text and embed calls.
struct Scanner<'a> {
    input: &'a str,
    tag: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str, tag: &'a str) -> Self {
        Self { input, tag, pos: 0 }
    }

    /// Finds the next `tag(` at an identifier boundary, from `from`.
    /// Returns the tag start and the position just after `(`.
    fn next_call(&self, from: usize) -> Option<(usize, usize)> {
        let mut search = from;
        while let Some(offset) = self.input[search..].find(self.tag) {
            let start = search + offset;
            let end = start + self.tag.len();
            let bounded = self.input[..start]
                .chars()
                .next_back()
                .map_or(true, |c| !(c.is_ascii_alphanumeric() || c == '_'));
            let after = &self.input[end..];
            let trimmed = after.trim_start();
            if bounded && trimmed.starts_with('(') {
                return Some((start, end + (after.len() - trimmed.len()) + 1));
            }
            search = end;
        }
        None
    }

    fn malformed(&self, start: usize, end: usize, reason: impl Into<String>) -> TemplateError {
        TemplateError::MalformedEmbed {
            tag: self.tag.to_string(),
            call: self.input[start..end.min(self.input.len())].to_string(),
            reason: reason.into(),
        }
    }

    /// Parses the argument list starting after `(`. Returns the arguments and
    /// the position just after `)`.
    fn parse_args(&self, start: usize, open: usize) -> Result<(Vec<EmbedArg>, usize), TemplateError> {
        let mut args = Vec::new();
        let mut token = String::new();
        let mut quoted = false;
        let mut chars = self.input[open..].char_indices();

        while let Some((offset, c)) = chars.next() {
            match c {
                '\'' | '"' => {
                    if quoted || !token.trim().is_empty() {
                        return Err(self.malformed(start, open + offset + 1, "unexpected quote"));
                    }
                    let mut literal = String::new();
                    let mut closed = false;
                    while let Some((_, inner)) = chars.next() {
                        match inner {
                            '\\' => match chars.next() {
                                Some((_, escaped)) => literal.push(escaped),
                                None => break,
                            },
                            q if q == c => {
                                closed = true;
                                break;
                            }
                            other => literal.push(other),
                        }
                    }
                    if !closed {
                        return Err(self.malformed(start, self.input.len(), "unterminated string"));
                    }
                    token = literal;
                    quoted = true;
                }
                ',' | ')' => {
                    let arg = self.finish_arg(start, open + offset + 1, &token, quoted, c == ')' && args.is_empty())?;
                    if let Some(arg) = arg {
                        args.push(arg);
                    }
                    token.clear();
                    quoted = false;
                    if c == ')' {
                        if args.is_empty() {
                            return Err(self.malformed(start, open + offset + 1, "missing handler name"));
                        }
                        return Ok((args, open + offset + 1));
                    }
                }
                c if quoted && c.is_whitespace() => {}
                c if quoted => {
                    return Err(self.malformed(
                        start,
                        open + offset + c.len_utf8(),
                        "expected ',' or ')' after string",
                    ));
                }
                c => token.push(c),
            }
        }
        Err(self.malformed(start, self.input.len(), "missing closing parenthesis"))
    }

    /// Turns the text between separators into an argument. An empty token is
    /// only allowed as the whole of an empty argument list.
    fn finish_arg(
        &self,
        start: usize,
        end: usize,
        token: &str,
        quoted: bool,
        may_be_empty: bool,
    ) -> Result<Option<EmbedArg>, TemplateError> {
        if quoted {
            return Ok(Some(EmbedArg::Literal(token.to_string())));
        }
        let token = token.trim();
        if token.is_empty() {
            return if may_be_empty {
                Ok(None)
            } else {
                Err(self.malformed(start, end, "empty argument"))
            };
        }
        if is_bareword(token) {
            Ok(Some(EmbedArg::Bareword(token.to_string())))
        } else {
            Err(self.malformed(start, end, format!("'{}' is neither quoted nor a bareword", token)))
        }
    }
}

impl<'a> Iterator for Scanner<'a> {
    type Item = Result<Segment<'a>, TemplateError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.input.len() {
            return None;
        }

        let Some((start, open)) = self.next_call(self.pos) else {
            let text = &self.input[self.pos..];
            self.pos = self.input.len();
            return Some(Ok(Segment::Text(text)));
        };

        if start > self.pos {
            let text = &self.input[self.pos..start];
            self.pos = start;
            return Some(Ok(Segment::Text(text)));
        }

        match self.parse_args(start, open) {
            Ok((mut args, end)) => {
                self.pos = end;
                let handler = args.remove(0);
                Some(Ok(Segment::Call(EmbedCall {
                    raw: self.input[start..end].to_string(),
                    handler,
                    args,
                })))
            }
            Err(err) => {
                self.pos = self.input.len();
                Some(Err(err))
            }
        }
    }
}

pub(crate) fn is_bareword(token: &str) -> bool {
    let mut chars = token.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rewrite(text: &str) -> Result<Emulated, TemplateError> {
        Emulated::rewrite(text, "CGIAPP_embed", |n| format!("[{}]", n))
    }

    #[test]
    fn test_plain_text_unchanged() {
        let emulated = rewrite("no calls here").unwrap();
        assert_eq!(emulated.source, "no calls here");
        assert!(emulated.is_empty());
    }

    #[test]
    fn test_literal_and_bareword_args() {
        let emulated = rewrite(r#"a CGIAPP_embed('header', title, "x, y") b"#).unwrap();
        assert_eq!(emulated.source, "a [0] b");
        let call = &emulated.calls[0];
        assert_eq!(call.handler, EmbedArg::Literal("header".into()));
        assert_eq!(
            call.args,
            vec![
                EmbedArg::Bareword("title".into()),
                EmbedArg::Literal("x, y".into())
            ]
        );
        assert_eq!(call.raw, r#"CGIAPP_embed('header', title, "x, y")"#);
    }

    #[test]
    fn test_multiple_calls_numbered_in_order() {
        let emulated = rewrite("CGIAPP_embed('a')-CGIAPP_embed ( 'b' )").unwrap();
        assert_eq!(emulated.source, "[0]-[1]");
        assert_eq!(emulated.calls[1].handler, EmbedArg::Literal("b".into()));
    }

    #[test]
    fn test_escaped_quote_in_literal() {
        let emulated = rewrite(r#"CGIAPP_embed('it\'s')"#).unwrap();
        assert_eq!(emulated.calls[0].handler, EmbedArg::Literal("it's".into()));
    }

    #[test]
    fn test_tag_without_parens_is_text() {
        let emulated = rewrite("see CGIAPP_embed docs, MyCGIAPP_embed('x')").unwrap();
        assert_eq!(emulated.source, "see CGIAPP_embed docs, MyCGIAPP_embed('x')");
    }

    #[test]
    fn test_malformed_calls() {
        for bad in [
            "CGIAPP_embed('x'",
            "CGIAPP_embed('x)",
            "CGIAPP_embed()",
            "CGIAPP_embed('a',)",
            "CGIAPP_embed(1 + 2)",
            "CGIAPP_embed('a' 'b')",
            "CGIAPP_embed(f(x))",
        ] {
            let err = rewrite(bad).unwrap_err();
            assert!(
                matches!(err, TemplateError::MalformedEmbed { .. }),
                "{} gave {:?}",
                bad,
                err
            );
        }
    }

    #[test]
    fn test_bareword_resolution() {
        let vars = json!({"title": "Hi", "user": {"name": "Ada"}, "none": null});
        let vars = vars.as_object().unwrap();
        assert_eq!(EmbedArg::Bareword("title".into()).resolve(vars), json!("Hi"));
        assert_eq!(EmbedArg::Bareword("user.name".into()).resolve(vars), json!("Ada"));
        assert_eq!(EmbedArg::Bareword("missing".into()).resolve(vars), json!(""));
        assert_eq!(EmbedArg::Bareword("none".into()).resolve(vars), json!(""));
        assert_eq!(EmbedArg::Literal("title".into()).resolve(vars), json!("title"));
    }

    #[test]
    fn test_bind_adds_sentinels() {
        let emulated = rewrite("CGIAPP_embed('a') CGIAPP_embed('b')").unwrap();
        let vars = json!({"x": 1});
        let bound = emulated.bind(vars.as_object().unwrap());
        assert_eq!(bound["x"], 1);
        assert_eq!(bound["__embed_1"], json!(Emulated::sentinel(1)));
    }

    #[test]
    fn test_offsets_point_at_placeholders() {
        let emulated = rewrite("ab CGIAPP_embed('a') c CGIAPP_embed('b')").unwrap();
        assert_eq!(emulated.source, "ab [0] c [1]");
        assert_eq!(emulated.offsets(), &[3, 9]);
    }

    #[test]
    fn test_scrub_strips_marks_at_any_depth() {
        let forged = Emulated::sentinel(0);
        let vars = json!({"q": forged, "list": [forged], "map": {"inner": forged}, "n": 3});
        let scrubbed = Emulated::scrub(vars.as_object().unwrap());
        assert_eq!(scrubbed["q"], json!("embed:0"));
        assert_eq!(scrubbed["list"], json!(["embed:0"]));
        assert_eq!(scrubbed["map"]["inner"], json!("embed:0"));
        assert_eq!(scrubbed["n"], json!(3));
    }

    #[test]
    fn test_bind_scrubs_forged_sentinels() {
        let emulated = rewrite("CGIAPP_embed('a')").unwrap();
        let vars = json!({"q": Emulated::sentinel(0)});
        let bound = emulated.bind(vars.as_object().unwrap());
        assert_eq!(bound["q"], json!("embed:0"));
        assert_eq!(bound["__embed_0"], json!(Emulated::sentinel(0)));
    }

    #[test]
    fn test_unwrap_markers() {
        let mut emulated =
            Emulated::rewrite("[{{ CGIAPP_embed('a') }}] {{ x }} {{CGIAPP_embed('b')}}", "CGIAPP_embed", Emulated::sentinel)
                .unwrap();
        emulated.unwrap_markers("CGIAPP_embed", "{{", "}}").unwrap();
        assert_eq!(
            emulated.source,
            format!("[{}] {{{{ x }}}} {}", Emulated::sentinel(0), Emulated::sentinel(1))
        );
        assert_eq!(emulated.offsets(), &[1, 20]);
    }

    #[test]
    fn test_unwrap_markers_rejects_shared_marker() {
        let mut emulated =
            Emulated::rewrite("{{ x CGIAPP_embed('a') }}", "CGIAPP_embed", Emulated::sentinel).unwrap();
        let err = emulated.unwrap_markers("CGIAPP_embed", "{{", "}}").unwrap_err();
        assert!(
            matches!(err, TemplateError::MalformedEmbed { ref call, .. } if call == "CGIAPP_embed('a')"),
            "{:?}",
            err
        );
    }
}

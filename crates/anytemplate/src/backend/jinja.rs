//! MiniJinja backend.
//!
//! Embed calls are a registered global function taking the handler name and
//! any further arguments positionally:
//!
//! ```text
//! {{ CGIAPP_embed('header') }}
//! {{ CGIAPP_embed('user_box', user.id, 'compact') }}
//! ```
//!
//! Component output is returned as a safe string, so autoescaping never
//! touches it. Undefined arguments are passed to the handler as empty strings.
//!
//! `{% include %}` and friends load templates from the include path, searched
//! in order.

use std::sync::Arc;

use minijinja::value::{Rest, Value};
use minijinja::{path_loader, AutoEscape, Environment, Error, ErrorKind, UndefinedBehavior};

use crate::backend::{
    log_unused_native, standard_defaults, BackendFamily, BackendInit, BackendType, NativeEngine,
};
use crate::dispatch::ComponentDispatcher;
use crate::error::TemplateError;
use crate::options::{option_bool, option_string, OptionBag};

const DECLARED_KEYS: &[&str] = &[
    "template_extension",
    "embed_tag_name",
    "emulate_associate_query",
];

const NATIVE_KEYS: &[&str] = &[
    "undefined",
    "trim_blocks",
    "lstrip_blocks",
    "keep_trailing_newline",
    "auto_escape",
];

/// The `MiniJinja` backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct JinjaBackend;

impl BackendType for JinjaBackend {
    fn name(&self) -> &'static str {
        "MiniJinja"
    }

    fn family(&self) -> BackendFamily {
        BackendFamily::GeneralPurposeCompiler
    }

    fn declared_config_keys(&self) -> &'static [&'static str] {
        DECLARED_KEYS
    }

    fn association_key(&self) -> &'static str {
        "emulate_associate_query"
    }

    fn default_config(&self) -> OptionBag {
        standard_defaults(".tmpl", "emulate_associate_query")
    }

    fn required_external_modules(&self) -> &'static [&'static str] {
        &["minijinja"]
    }

    fn initialize(&self, init: &BackendInit<'_>) -> Result<Box<dyn NativeEngine>, TemplateError> {
        log_unused_native(self.name(), init.native, NATIVE_KEYS);

        let mut env = Environment::new();
        configure(&mut env, init.native)?;

        let loaders: Vec<_> = init
            .include_paths
            .iter()
            .map(|dir| path_loader(dir.clone()))
            .collect();
        env.set_loader(move |name| {
            for loader in &loaders {
                if let Some(source) = loader(name)? {
                    return Ok(Some(source));
                }
            }
            Ok(None)
        });

        let dispatcher = Arc::clone(init.dispatcher);
        env.add_function(
            init.driver.embed_tag_name.clone(),
            move |name: Value, args: Rest<Value>| embed(&dispatcher, name, args),
        );

        let name = init.source.engine_name(&init.driver.template_extension);
        env.add_template_owned(name.clone(), init.text.to_string())?;

        Ok(Box::new(JinjaTemplate { env, name }))
    }
}

fn configure(env: &mut Environment<'static>, native: &OptionBag) -> Result<(), TemplateError> {
    if let Some(value) = native.get("undefined") {
        let behavior = match option_string("undefined", value)?.as_str() {
            "lenient" => UndefinedBehavior::Lenient,
            "chainable" => UndefinedBehavior::Chainable,
            "strict" => UndefinedBehavior::Strict,
            other => {
                return Err(TemplateError::invalid_option(
                    "undefined",
                    format!("expected 'lenient', 'chainable' or 'strict', found '{}'", other),
                ))
            }
        };
        env.set_undefined_behavior(behavior);
    }
    if let Some(value) = native.get("trim_blocks") {
        env.set_trim_blocks(option_bool("trim_blocks", value)?);
    }
    if let Some(value) = native.get("lstrip_blocks") {
        env.set_lstrip_blocks(option_bool("lstrip_blocks", value)?);
    }
    if let Some(value) = native.get("keep_trailing_newline") {
        env.set_keep_trailing_newline(option_bool("keep_trailing_newline", value)?);
    }
    if let Some(value) = native.get("auto_escape") {
        let escape = if option_bool("auto_escape", value)? {
            AutoEscape::Html
        } else {
            AutoEscape::None
        };
        env.set_auto_escape_callback(move |_name| escape.clone());
    }
    Ok(())
}

fn embed(dispatcher: &ComponentDispatcher, name: Value, args: Rest<Value>) -> Result<Value, Error> {
    let name = match name.as_str() {
        Some(name) => name.to_string(),
        None => name.to_string(),
    };
    let mut values = Vec::with_capacity(args.0.len());
    for arg in args.0.iter() {
        let value = if arg.is_undefined() || arg.is_none() {
            serde_json::Value::String(String::new())
        } else {
            serde_json::to_value(arg).map_err(|err| {
                Error::new(ErrorKind::BadSerialization, "embed argument is not serializable")
                    .with_source(err)
            })?
        };
        values.push(value);
    }

    match dispatcher.dispatch(&name, &values) {
        Ok(text) => Ok(Value::from_safe_string(text)),
        Err(err) => {
            let message = err.to_string();
            dispatcher.stash_failure(err);
            Err(Error::new(ErrorKind::InvalidOperation, message))
        }
    }
}

struct JinjaTemplate {
    env: Environment<'static>,
    name: String,
}

impl NativeEngine for JinjaTemplate {
    fn supports_callbacks(&self) -> bool {
        true
    }

    fn render(&self, vars: &OptionBag, _associated: Option<&OptionBag>) -> Result<String, TemplateError> {
        let template = self.env.get_template(&self.name)?;
        Ok(template.render(Value::from_serialize(vars))?)
    }
}

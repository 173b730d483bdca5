//! XML attribute-language backend.
//!
//! The engine has no function calls, so embed calls are emulated. They are
//! written where a path expression would go, usually in `tal:replace`:
//!
//! ```text
//! <div tal:replace="structure CGIAPP_embed('header')">header goes here</div>
//! <td tal:content="structure CGIAPP_embed('price', item.id)">0.00</td>
//! ```
//!
//! Each call becomes a hidden variable whose value is a marker; after the
//! engine ran, markers still present in the output are replaced by the
//! component output. Arguments can only be quoted literals or paths to
//! variables that are already set. Calls in elements removed by
//! `tal:condition` are never dispatched. A call written anywhere other than
//! inside an attribute value fails the load.

use std::sync::Arc;

use anytemplate_tal::{TalOptions, TalTemplate};

use crate::backend::{
    log_unused_native, standard_defaults, BackendFamily, BackendInit, BackendType, NativeEngine,
};
use crate::dispatch::ComponentDispatcher;
use crate::embed::Emulated;
use crate::error::TemplateError;
use crate::options::{option_bool, OptionBag};

const DECLARED_KEYS: &[&str] = &[
    "template_extension",
    "embed_tag_name",
    "emulate_associate_query",
];

/// The `Tal` backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct TalBackend;

impl BackendType for TalBackend {
    fn name(&self) -> &'static str {
        "Tal"
    }

    fn family(&self) -> BackendFamily {
        BackendFamily::XmlAttributeBased
    }

    fn declared_config_keys(&self) -> &'static [&'static str] {
        DECLARED_KEYS
    }

    fn association_key(&self) -> &'static str {
        "emulate_associate_query"
    }

    fn default_config(&self) -> OptionBag {
        standard_defaults(".xhtml", "emulate_associate_query")
    }

    fn required_external_modules(&self) -> &'static [&'static str] {
        &["quick-xml", "anytemplate-tal"]
    }

    fn initialize(&self, init: &BackendInit<'_>) -> Result<Box<dyn NativeEngine>, TemplateError> {
        log_unused_native(self.name(), init.native, &["strict"]);
        let strict = match init.native.get("strict") {
            Some(value) => option_bool("strict", value)?,
            None => false,
        };

        let tag = &init.driver.embed_tag_name;
        let emulated = Emulated::rewrite(init.text, tag, Emulated::variable)?;
        check_placement(&emulated, tag)?;
        let template = TalTemplate::parse_with(emulated.source.clone(), TalOptions { strict })?;

        Ok(Box::new(TalEngine {
            template,
            emulated,
            dispatcher: Arc::clone(init.dispatcher),
        }))
    }
}

struct TalEngine {
    template: TalTemplate,
    emulated: Emulated,
    dispatcher: Arc<ComponentDispatcher>,
}

impl NativeEngine for TalEngine {
    fn supports_callbacks(&self) -> bool {
        false
    }

    fn render(&self, vars: &OptionBag, _associated: Option<&OptionBag>) -> Result<String, TemplateError> {
        if self.emulated.is_empty() {
            return Ok(self.template.render(vars)?);
        }
        let rendered = self.template.render(&self.emulated.bind(vars))?;
        self.emulated.splice(&rendered, vars, &self.dispatcher)
    }
}

/// Fails unless every call sits inside a quoted attribute value.
fn check_placement(emulated: &Emulated, tag: &str) -> Result<(), TemplateError> {
    let mut pending = emulated.offsets().iter().zip(&emulated.calls).peekable();
    let mut in_tag = false;
    let mut quote: Option<char> = None;
    for (at, c) in emulated.source.char_indices() {
        while let Some((_, call)) = pending.next_if(|(offset, _)| **offset == at) {
            if quote.is_none() {
                return Err(TemplateError::MalformedEmbed {
                    tag: tag.to_string(),
                    call: call.raw.clone(),
                    reason: "only allowed inside an attribute value".to_string(),
                });
            }
        }
        if pending.peek().is_none() {
            return Ok(());
        }
        match (in_tag, quote, c) {
            (_, Some(q), c) if c == q => quote = None,
            (_, Some(_), _) => {}
            (false, None, '<') => in_tag = true,
            (true, None, '"' | '\'') => quote = Some(c),
            (true, None, '>') => in_tag = false,
            _ => {}
        }
    }
    Ok(())
}

//! Backend contract and the built-in engine adapters.
//!
//! A backend adapts one native template engine to a common contract. The
//! contract is split in two:
//!
//! - [`BackendType`]: the registered, shared description of a backend: its
//!   name, declared driver keys, defaults, required crates, and the
//!   `initialize` step that compiles a template into a [`NativeEngine`].
//! - [`Backend`]: one loaded template. It owns the effective configuration,
//!   the resolved include paths and source, the variable bag and the compiled
//!   engine, and is what render hooks receive.
//!
//! # Built-in Backends
//!
//! | Name | Family | Engine | Embedded components |
//! |------|--------|--------|---------------------|
//! | `Simple` | [`BackendFamily::TextSubstitution`] | [`SimpleEngine`] | tag emulation |
//! | `Tera` | [`BackendFamily::ExpressionAware`] | `tera` | native function |
//! | `MiniJinja` | [`BackendFamily::GeneralPurposeCompiler`] | `minijinja` | native function |
//! | `Tal` | [`BackendFamily::XmlAttributeBased`] | `anytemplate-tal` | tag emulation |
//!
//! # Driver Keys
//!
//! Every built-in backend declares `template_extension`, `embed_tag_name` and
//! an association key (`associate_query` or `emulate_associate_query`).
//! Everything else in a backend's section is handed to the engine.
//!
//! # File Resolution
//!
//! When no literal source is configured the file name is the `file` option,
//! or else the application's current run mode. If auto-extension is on and the
//! name has no extension, the backend's `template_extension` is appended. The
//! name is then looked up in each include path in order; the first existing
//! file wins.

mod jinja;
mod simple;
mod tal;
mod tera;

pub use self::jinja::JinjaBackend;
pub use self::simple::{MissingVariable, SimpleBackend, SimpleEngine};
pub use self::tal::TalBackend;
pub use self::tera::TeraBackend;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use crate::config::ConfigStore;
use crate::dispatch::ComponentDispatcher;
use crate::error::TemplateError;
use crate::options::{option_bool, option_string, overlay, OptionBag};

/// Default name of the embed function/tag.
pub const DEFAULT_EMBED_TAG: &str = "CGIAPP_embed";

/// The four engine families a backend can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendFamily {
    /// Plain variable substitution, no expressions, no callbacks.
    TextSubstitution,
    /// Expression language with registered functions.
    ExpressionAware,
    /// Full template language compiled ahead of rendering.
    GeneralPurposeCompiler,
    /// Directives carried in XML attributes.
    XmlAttributeBased,
}

/// The registered description of a backend.
pub trait BackendType: Send + Sync {
    /// The name the backend is registered under.
    fn name(&self) -> &'static str;

    /// The engine family.
    fn family(&self) -> BackendFamily;

    /// Keys consumed by the adapter itself; everything else is native config.
    fn declared_config_keys(&self) -> &'static [&'static str];

    /// The declared key that toggles query association.
    fn association_key(&self) -> &'static str;

    /// Driver defaults, overlaid by configured driver keys.
    fn default_config(&self) -> OptionBag;

    /// Crates the backend needs, for availability checks by callers.
    fn required_external_modules(&self) -> &'static [&'static str];

    /// Compiles the template and registers the embed hook when the engine has
    /// a callback mechanism.
    fn initialize(&self, init: &BackendInit<'_>) -> Result<Box<dyn NativeEngine>, TemplateError>;
}

impl fmt::Debug for dyn BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendType")
            .field("name", &self.name())
            .field("family", &self.family())
            .finish()
    }
}

/// Everything a backend needs to compile one template.
pub struct BackendInit<'a> {
    /// Effective driver configuration.
    pub driver: &'a DriverConfig,
    /// Native configuration, unexamined by the core.
    pub native: &'a OptionBag,
    /// Include paths in search order.
    pub include_paths: &'a [PathBuf],
    /// Where the template came from.
    pub source: &'a TemplateSource,
    /// The template text.
    pub text: &'a str,
    /// Dispatcher embedded components go through.
    pub dispatcher: &'a Arc<ComponentDispatcher>,
}

/// A compiled template, ready to render.
pub trait NativeEngine: Send {
    /// Whether the engine calls back into the dispatcher natively.
    fn supports_callbacks(&self) -> bool;

    /// Whether the engine can look up query parameters on its own.
    fn binds_query_natively(&self) -> bool {
        false
    }

    /// Renders with the variable bag. `associated` holds query parameters
    /// when the engine binds them natively.
    fn render(&self, vars: &OptionBag, associated: Option<&OptionBag>) -> Result<String, TemplateError>;
}

/// Where a template's text came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSource {
    /// A file found on the include path.
    File {
        /// The name that was searched for, extension included.
        name: String,
        /// The file that was found.
        path: PathBuf,
    },
    /// Literal source given with the `string` option.
    Literal(String),
}

impl TemplateSource {
    /// A short label: the file name, or `<string>`.
    pub fn label(&self) -> &str {
        match self {
            TemplateSource::File { name, .. } => name,
            TemplateSource::Literal(_) => "<string>",
        }
    }

    /// The name to register the template under inside an engine.
    ///
    /// Literal sources get the backend extension so that engines which pick
    /// escaping from the name treat them like files of the same backend.
    pub(crate) fn engine_name(&self, extension: &str) -> String {
        match self {
            TemplateSource::File { name, .. } => name.clone(),
            TemplateSource::Literal(_) => format!("__string__{}", extension),
        }
    }
}

/// Effective driver configuration: backend defaults overlaid by configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
    /// Extension appended to bare file names.
    pub template_extension: String,
    /// Name of the embed function/tag.
    pub embed_tag_name: String,
    /// Whether query parameters are associated with the variable bag.
    pub associate_query: bool,
    values: OptionBag,
}

impl DriverConfig {
    /// Resolves the driver configuration of `backend` from stored options.
    pub fn resolve(backend: &dyn BackendType, stored: Option<&OptionBag>) -> Result<Self, TemplateError> {
        let mut values = backend.default_config();
        if let Some(stored) = stored {
            overlay(&mut values, stored);
        }

        let template_extension = match values.get("template_extension") {
            Some(value) => option_string("template_extension", value)?,
            None => String::new(),
        };
        let embed_tag_name = match values.get("embed_tag_name") {
            Some(value) => option_string("embed_tag_name", value)?,
            None => DEFAULT_EMBED_TAG.to_string(),
        };
        if !is_identifier(&embed_tag_name) {
            return Err(TemplateError::invalid_option(
                "embed_tag_name",
                format!("'{}' is not an identifier", embed_tag_name),
            ));
        }
        let key = backend.association_key();
        let associate_query = match values.get(key) {
            Some(value) => option_bool(key, value)?,
            None => true,
        };

        Ok(Self {
            template_extension,
            embed_tag_name,
            associate_query,
            values,
        })
    }

    /// Raw value of a driver key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// All driver values, defaults included.
    pub fn values(&self) -> &OptionBag {
        &self.values
    }
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Determines the template source for a store.
///
/// `run_mode` is the application's current handler name, used when neither
/// `string` nor `file` is configured.
pub fn resolve_source(
    store: &ConfigStore,
    driver: &DriverConfig,
    include_paths: &[PathBuf],
    run_mode: Option<&str>,
) -> Result<TemplateSource, TemplateError> {
    let plugin = store.plugin();
    if let Some(text) = &plugin.string {
        return Ok(TemplateSource::Literal(text.clone()));
    }

    let base = plugin.file.as_deref().or(run_mode).ok_or_else(|| {
        TemplateError::MissingSource(
            "no 'string' or 'file' option and no current run mode to derive a file name from"
                .into(),
        )
    })?;

    let mut name = base.to_string();
    if plugin.auto_extension() && Path::new(base).extension().is_none() {
        name.push_str(&driver.template_extension);
    }

    let candidate = Path::new(&name);
    if candidate.is_absolute() || include_paths.is_empty() {
        if candidate.is_file() {
            return Ok(TemplateSource::File {
                path: candidate.to_path_buf(),
                name,
            });
        }
    } else if let Some(path) = include_paths
        .iter()
        .map(|dir| dir.join(&name))
        .find(|path| path.is_file())
    {
        return Ok(TemplateSource::File { name, path });
    }

    Err(TemplateError::MissingSource(format!(
        "template '{}' not found in [{}]",
        name,
        include_paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    )))
}

/// One loaded template bound to its backend.
pub struct Backend {
    kind: Arc<dyn BackendType>,
    driver: DriverConfig,
    native: OptionBag,
    include_paths: Vec<PathBuf>,
    source: TemplateSource,
    params: OptionBag,
    dispatcher: Arc<ComponentDispatcher>,
    engine: Box<dyn NativeEngine>,
}

impl Backend {
    /// Loads the template a store describes, with `kind` as its backend.
    pub(crate) fn load(
        kind: Arc<dyn BackendType>,
        store: &ConfigStore,
        run_mode: Option<&str>,
        dispatcher: Arc<ComponentDispatcher>,
    ) -> Result<Self, TemplateError> {
        let name = kind.name();
        let driver = DriverConfig::resolve(kind.as_ref(), store.driver_config(name))?;
        let native = store.native_config(name).cloned().unwrap_or_default();
        let include_paths: Vec<PathBuf> = store.include_paths().into_iter().map(PathBuf::from).collect();
        let source = resolve_source(store, &driver, &include_paths, run_mode)?;

        let text = match &source {
            TemplateSource::Literal(text) => text.clone(),
            TemplateSource::File { path, .. } => {
                std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
                    path: path.clone(),
                    source,
                })?
            }
        };

        tracing::debug!(
            backend = name,
            template = source.label(),
            include_paths = include_paths.len(),
            "initializing template"
        );

        let engine = kind.initialize(&BackendInit {
            driver: &driver,
            native: &native,
            include_paths: &include_paths,
            source: &source,
            text: &text,
            dispatcher: &dispatcher,
        })?;

        Ok(Self {
            kind,
            driver,
            native,
            include_paths,
            source,
            params: OptionBag::new(),
            dispatcher,
            engine,
        })
    }

    /// Backend name.
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Backend family.
    pub fn family(&self) -> BackendFamily {
        self.kind.family()
    }

    /// The registered backend description.
    pub fn kind(&self) -> &Arc<dyn BackendType> {
        &self.kind
    }

    /// Effective driver configuration.
    pub fn driver_config(&self) -> &DriverConfig {
        &self.driver
    }

    /// Native configuration handed to the engine.
    pub fn native_config(&self) -> &OptionBag {
        &self.native
    }

    /// Include paths in search order.
    pub fn include_paths(&self) -> &[PathBuf] {
        &self.include_paths
    }

    /// Where the template came from.
    pub fn source(&self) -> &TemplateSource {
        &self.source
    }

    /// Whether embedded components are dispatched by the engine itself.
    pub fn supports_callbacks(&self) -> bool {
        self.engine.supports_callbacks()
    }

    /// The dispatcher embedded components go through.
    pub fn dispatcher(&self) -> &Arc<ComponentDispatcher> {
        &self.dispatcher
    }

    /// Gets one variable.
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// Sets one variable, returning the previous value.
    pub fn set_param(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.params.insert(name.into(), value.into())
    }

    /// A copy of all variables.
    pub fn params(&self) -> OptionBag {
        self.params.clone()
    }

    /// Number of variables set.
    pub fn params_len(&self) -> usize {
        self.params.len()
    }

    /// The live variable bag.
    pub fn params_mut(&mut self) -> &mut OptionBag {
        &mut self.params
    }

    /// Removes all variables.
    pub fn clear_params(&mut self) {
        self.params.clear();
    }

    /// Copies `query` into the bag without overwriting existing variables.
    pub(crate) fn associate(&mut self, query: &OptionBag) {
        for (name, value) in query {
            self.params.entry(name.clone()).or_insert_with(|| value.clone());
        }
    }

    pub(crate) fn binds_query_natively(&self) -> bool {
        self.engine.binds_query_natively()
    }

    pub(crate) fn render_native(&self, associated: Option<&OptionBag>) -> Result<String, TemplateError> {
        self.engine.render(&self.params, associated)
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name())
            .field("source", &self.source.label())
            .field("params", &self.params.len())
            .finish_non_exhaustive()
    }
}

/// Standard defaults shared by the built-in backends.
pub(crate) fn standard_defaults(extension: &str, association_key: &str) -> OptionBag {
    let mut defaults = OptionBag::new();
    defaults.insert("template_extension".into(), Value::from(extension));
    defaults.insert("embed_tag_name".into(), Value::from(DEFAULT_EMBED_TAG));
    defaults.insert(association_key.into(), Value::Bool(true));
    defaults
}

/// Logs native options an engine does not understand.
pub(crate) fn log_unused_native(backend: &str, native: &OptionBag, known: &[&str]) {
    for key in native.keys().filter(|key| !known.contains(&key.as_str())) {
        tracing::debug!(backend, option = %key, "ignoring unrecognized native option");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::BackendRegistry;
    use serde_json::json;
    use std::fs;

    fn store(options: Value) -> ConfigStore {
        ConfigStore::from_options(
            options.as_object().unwrap(),
            &BackendRegistry::with_builtins(),
        )
        .unwrap()
    }

    #[test]
    fn test_driver_defaults_per_backend() {
        let registry = BackendRegistry::with_builtins();
        let ext = |name: &str| {
            let kind = registry.resolve(name).unwrap();
            DriverConfig::resolve(kind.as_ref(), None).unwrap().template_extension
        };
        assert_eq!(ext("Simple"), ".html");
        assert_eq!(ext("Tera"), ".html");
        assert_eq!(ext("MiniJinja"), ".tmpl");
        assert_eq!(ext("Tal"), ".xhtml");
    }

    #[test]
    fn test_driver_config_overlay() {
        let registry = BackendRegistry::with_builtins();
        let kind = registry.resolve("MiniJinja").unwrap();
        let stored = json!({"embed_tag_name": "embed", "emulate_associate_query": "no"});
        let driver = DriverConfig::resolve(kind.as_ref(), stored.as_object()).unwrap();
        assert_eq!(driver.embed_tag_name, "embed");
        assert!(!driver.associate_query);
        assert_eq!(driver.template_extension, ".tmpl");
    }

    #[test]
    fn test_embed_tag_must_be_identifier() {
        let registry = BackendRegistry::with_builtins();
        let kind = registry.resolve("Simple").unwrap();
        let stored = json!({"embed_tag_name": "not valid"});
        assert!(DriverConfig::resolve(kind.as_ref(), stored.as_object()).is_err());
    }

    #[test]
    fn test_source_prefers_literal_string() {
        let store = store(json!({"string": "hi", "file": "ignored"}));
        let kind = BackendRegistry::with_builtins().resolve("Simple").unwrap();
        let driver = DriverConfig::resolve(kind.as_ref(), None).unwrap();
        let source = resolve_source(&store, &driver, &[], None).unwrap();
        assert_eq!(source, TemplateSource::Literal("hi".into()));
    }

    #[test]
    fn test_source_from_run_mode_with_extension() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("show_list.html"), "x").unwrap();

        let store = store(json!({}));
        let kind = BackendRegistry::with_builtins().resolve("Simple").unwrap();
        let driver = DriverConfig::resolve(kind.as_ref(), None).unwrap();
        let paths = vec![dir.path().to_path_buf()];
        let source = resolve_source(&store, &driver, &paths, Some("show_list")).unwrap();
        match source {
            TemplateSource::File { name, path } => {
                assert_eq!(name, "show_list.html");
                assert_eq!(path, dir.path().join("show_list.html"));
            }
            other => panic!("expected file source, got {:?}", other),
        }
    }

    #[test]
    fn test_source_keeps_explicit_extension() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("page.txt"), "x").unwrap();

        let store = store(json!({"file": "page.txt"}));
        let kind = BackendRegistry::with_builtins().resolve("Simple").unwrap();
        let driver = DriverConfig::resolve(kind.as_ref(), None).unwrap();
        let paths = vec![dir.path().to_path_buf()];
        let source = resolve_source(&store, &driver, &paths, None).unwrap();
        assert_eq!(source.label(), "page.txt");
    }

    #[test]
    fn test_source_search_order() {
        let high = tempfile::tempdir().unwrap();
        let low = tempfile::tempdir().unwrap();
        fs::write(high.path().join("p.html"), "high").unwrap();
        fs::write(low.path().join("p.html"), "low").unwrap();

        let store = store(json!({"file": "p"}));
        let kind = BackendRegistry::with_builtins().resolve("Simple").unwrap();
        let driver = DriverConfig::resolve(kind.as_ref(), None).unwrap();
        let paths = vec![high.path().to_path_buf(), low.path().to_path_buf()];
        match resolve_source(&store, &driver, &paths, None).unwrap() {
            TemplateSource::File { path, .. } => assert_eq!(path, high.path().join("p.html")),
            other => panic!("expected file source, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_source() {
        let store = store(json!({}));
        let kind = BackendRegistry::with_builtins().resolve("Simple").unwrap();
        let driver = DriverConfig::resolve(kind.as_ref(), None).unwrap();
        let err = resolve_source(&store, &driver, &[], None).unwrap_err();
        assert!(matches!(err, TemplateError::MissingSource(_)));

        let dir = tempfile::tempdir().unwrap();
        let paths = vec![dir.path().to_path_buf()];
        let err = resolve_source(&store, &driver, &paths, Some("nowhere")).unwrap_err();
        assert!(err.to_string().contains("nowhere.html"));
    }
}

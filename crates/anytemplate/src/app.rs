//! The host application.
//!
//! [`Application`] owns everything templates need from the surrounding
//! program: the component handlers embed calls dispatch to, the request's
//! query parameters, render hooks, the current run mode (used to name
//! templates by default) and the table of configuration slots.
//!
//! # Example
//!
//! ```rust
//! use anytemplate::{Application, ContainingSession, Slot};
//! use serde_json::{json, Value};
//!
//! let app = Application::builder()
//!     .component("header", |_: &Application, _: &ContainingSession, _: &[Value]| {
//!         Ok("<H1>Title</H1>")
//!     })
//!     .query_param("page", "2")
//!     .build()
//!     .unwrap();
//!
//! app.configure(Slot::Default, json!({
//!     "string": "CGIAPP_embed('header') page {{ page }}",
//! }).as_object().unwrap()).unwrap();
//!
//! let output = app.fill(Slot::Default, None, &Default::default()).unwrap();
//! assert_eq!(output, "<H1>Title</H1> page 2");
//! ```
//!
//! # Lifetime
//!
//! Applications are always held in an `Arc`. Sessions and dispatchers refer
//! back to their application through an [`AppHandle`], which does not keep it
//! alive; using a session after its application was dropped fails with
//! [`TemplateError::ApplicationDropped`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use serde::Serialize;
use serde_json::Value;

use crate::backend::{Backend, BackendType};
use crate::config::ConfigStore;
use crate::dispatch::{ComponentDispatcher, ComponentHandler, ComponentOutput, ComponentRegistry, ContainingSession};
use crate::error::{HookError, TemplateError};
use crate::hooks::RenderHooks;
use crate::options::OptionBag;
use crate::registry::BackendRegistry;
use crate::session::{LoadRequest, RenderSession};
use crate::slots::{Slot, SlotTable};

/// Request query parameters. A name can carry several values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    values: BTreeMap<String, Vec<String>>,
}

impl QueryParams {
    /// Creates an empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value for `name`, after any existing values.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.entry(name.into()).or_default().push(value.into());
    }

    /// The first value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name)?.first().map(String::as_str)
    }

    /// All values of `name`.
    pub fn get_all(&self, name: &str) -> &[String] {
        self.values.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns true if there are no parameters.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The parameters as template variables: single values as strings,
    /// repeated ones as lists.
    pub fn to_bag(&self) -> OptionBag {
        self.values
            .iter()
            .map(|(name, values)| {
                let value = match values.as_slice() {
                    [single] => Value::String(single.clone()),
                    many => Value::Array(many.iter().cloned().map(Value::String).collect()),
                };
                (name.clone(), value)
            })
            .collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for QueryParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = QueryParams::new();
        for (name, value) in iter {
            params.insert(name, value);
        }
        params
    }
}

/// Non-owning handle to an [`Application`].
#[derive(Clone, Default)]
pub struct AppHandle(Weak<Application>);

impl AppHandle {
    /// The application, if it is still alive.
    pub fn upgrade(&self) -> Result<Arc<Application>, TemplateError> {
        self.0.upgrade().ok_or(TemplateError::ApplicationDropped)
    }

    /// Returns true while the application is alive.
    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

impl fmt::Debug for AppHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AppHandle").field(&self.is_alive()).finish()
    }
}

/// The application templates render on behalf of.
pub struct Application {
    me: Weak<Application>,
    backends: Arc<BackendRegistry>,
    components: ComponentRegistry,
    component_sets: HashMap<String, ComponentRegistry>,
    query: QueryParams,
    hooks: RenderHooks,
    run_mode: RwLock<Option<String>>,
    slots: RwLock<SlotTable>,
}

impl Application {
    /// Starts building an application.
    pub fn builder() -> ApplicationBuilder {
        ApplicationBuilder::new()
    }

    /// A non-owning handle to this application.
    pub fn handle(&self) -> AppHandle {
        AppHandle(self.me.clone())
    }

    /// The backend registry configurations are resolved against.
    pub fn backends(&self) -> &Arc<BackendRegistry> {
        &self.backends
    }

    /// The request query parameters.
    pub fn query(&self) -> &QueryParams {
        &self.query
    }

    /// The render hooks.
    pub fn hooks(&self) -> &RenderHooks {
        &self.hooks
    }

    /// The current run mode.
    pub fn run_mode(&self) -> Option<String> {
        self.run_mode
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sets the current run mode, which names templates loaded without a file.
    pub fn set_run_mode(&self, mode: impl Into<String>) {
        *self.run_mode.write().unwrap_or_else(PoisonError::into_inner) = Some(mode.into());
    }

    /// The components embed calls dispatch to: the main registry, or the
    /// named set.
    pub fn component_registry(&self, set: Option<&str>) -> Result<&ComponentRegistry, TemplateError> {
        match set {
            None => Ok(&self.components),
            Some(name) => self
                .component_sets
                .get(name)
                .ok_or_else(|| TemplateError::UnknownComponentSet(name.to_string())),
        }
    }

    /// Replaces the configuration of `slot`.
    ///
    /// The option bag is partitioned into plugin, driver and native layers,
    /// and the backend it selects is resolved, so that unknown backends and
    /// bad values are reported here rather than at render time.
    pub fn configure(&self, slot: impl Into<Slot>, options: &OptionBag) -> Result<(), TemplateError> {
        let slot = slot.into();
        let store = ConfigStore::from_options(options, &self.backends)?;
        let backend = self.backends.resolve(store.backend_name())?;
        tracing::debug!(slot = %slot, backend = backend.name(), "configured template slot");
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .configure(slot, store);
        Ok(())
    }

    /// The base configuration of `slot`, if it was configured or loaded.
    pub fn slot_config(&self, slot: impl Into<Slot>) -> Option<Arc<ConfigStore>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&slot.into())
    }

    /// Loads a template from `slot`, with per-call overrides.
    ///
    /// The request can be a file name (`"page"`), a [`LoadRequest`], or an
    /// option bag of overrides. Every call returns a fresh session.
    ///
    /// # Errors
    ///
    /// Configuration errors in the overrides, unknown backends or component
    /// sets, a missing template source, unreadable files and native compile
    /// errors are all reported here.
    pub fn load(&self, slot: impl Into<Slot>, request: impl Into<LoadRequest>) -> Result<RenderSession, TemplateError> {
        let slot = slot.into();
        let request = request.into();
        let base = self
            .slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_default(&slot);
        let store = ConfigStore::merged(&base, request.overrides(), &self.backends)?;

        let kind: Arc<dyn BackendType> = self.backends.resolve(store.backend_name())?;
        let component_set = store.plugin().component_handler_class.clone();
        self.component_registry(component_set.as_deref())?;

        tracing::debug!(
            slot = %slot,
            backend = kind.name(),
            overrides = request.overrides().len(),
            "loading template"
        );

        let dispatcher = Arc::new(ComponentDispatcher::new(self.handle(), component_set));
        let run_mode = self.run_mode();
        let backend = Backend::load(kind, &store, run_mode.as_deref(), dispatcher)?;
        Ok(RenderSession::new(slot, store, backend, self.handle()))
    }

    /// Loads, sets every variable in `vars`, and renders.
    ///
    /// Without `file` the template is named after the run mode (or comes from
    /// the slot's `file`/`string` options).
    pub fn fill(&self, slot: impl Into<Slot>, file: Option<&str>, vars: &OptionBag) -> Result<String, TemplateError> {
        let request = file.map(LoadRequest::file).unwrap_or_default();
        let mut session = self.load(slot, request)?;
        session.set_params(vars.clone());
        session.render()
    }

    /// Like [`fill`](Self::fill), taking any serializable map-like value.
    pub fn process<T: Serialize>(&self, slot: impl Into<Slot>, file: Option<&str>, vars: &T) -> Result<String, TemplateError> {
        let request = file.map(LoadRequest::file).unwrap_or_default();
        let mut session = self.load(slot, request)?;
        session.set_params_from(vars)?;
        session.render()
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("components", &self.components)
            .field("component_sets", &self.component_sets.keys().collect::<Vec<_>>())
            .field("query", &self.query)
            .field("hooks", &self.hooks)
            .field("run_mode", &self.run_mode())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Application`].
#[derive(Default)]
pub struct ApplicationBuilder {
    backends: Option<Arc<BackendRegistry>>,
    components: ComponentRegistry,
    component_sets: HashMap<String, ComponentRegistry>,
    query: QueryParams,
    hooks: RenderHooks,
    run_mode: Option<String>,
}

impl ApplicationBuilder {
    /// Creates a builder with no components, hooks or query parameters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `registry` instead of the process-wide built-in registry.
    pub fn backends(mut self, registry: Arc<BackendRegistry>) -> Self {
        self.backends = Some(registry);
        self
    }

    /// Registers a closure as a component.
    pub fn component<F, O>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Application, &ContainingSession, &[Value]) -> Result<O, TemplateError>
            + Send
            + Sync
            + 'static,
        O: Into<ComponentOutput> + 'static,
    {
        self.components = self.components.component(name, f);
        self
    }

    /// Registers a component handler.
    pub fn component_handler(mut self, name: impl Into<String>, handler: impl ComponentHandler + 'static) -> Self {
        self.components = self.components.handler(name, handler);
        self
    }

    /// Registers `name` as another name for the component `target`.
    pub fn component_alias(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.components = self.components.alias(name, target);
        self
    }

    /// Registers a named component set, selected by `component_handler_class`.
    pub fn component_set(mut self, name: impl Into<String>, registry: ComponentRegistry) -> Self {
        self.component_sets.insert(name.into(), registry);
        self
    }

    /// Adds a query parameter value.
    pub fn query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name, value);
        self
    }

    /// Replaces all query parameters.
    pub fn query(mut self, query: QueryParams) -> Self {
        self.query = query;
        self
    }

    /// Adds a pre-render hook.
    pub fn pre_render<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Backend) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.hooks = self.hooks.pre_render(f);
        self
    }

    /// Adds a post-render hook.
    pub fn post_render<F>(mut self, f: F) -> Self
    where
        F: Fn(&Backend, &mut String) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.hooks = self.hooks.post_render(f);
        self
    }

    /// Sets the initial run mode.
    pub fn run_mode(mut self, mode: impl Into<String>) -> Self {
        self.run_mode = Some(mode.into());
        self
    }

    /// Builds the application.
    ///
    /// # Errors
    ///
    /// [`TemplateError::HandlerNotCallable`] if an alias, in the main registry
    /// or in any component set, does not lead to a handler.
    pub fn build(self) -> Result<Arc<Application>, TemplateError> {
        self.components.validate()?;
        for registry in self.component_sets.values() {
            registry.validate()?;
        }

        let backends = self.backends.unwrap_or_else(BackendRegistry::global);
        Ok(Arc::new_cyclic(|me| Application {
            me: me.clone(),
            backends,
            components: self.components,
            component_sets: self.component_sets,
            query: self.query,
            hooks: self.hooks,
            run_mode: RwLock::new(self.run_mode),
            slots: RwLock::new(SlotTable::new()),
        }))
    }
}

impl fmt::Debug for ApplicationBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationBuilder")
            .field("components", &self.components)
            .field("query", &self.query)
            .field("hooks", &self.hooks)
            .field("run_mode", &self.run_mode)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bag(value: Value) -> OptionBag {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_query_params_to_bag() {
        let query: QueryParams = [("page", "2"), ("tag", "a"), ("tag", "b")].into_iter().collect();
        assert_eq!(query.get("tag"), Some("a"));
        assert_eq!(query.get_all("tag").len(), 2);
        assert_eq!(
            Value::Object(query.to_bag()),
            json!({"page": "2", "tag": ["a", "b"]})
        );
    }

    #[test]
    fn test_handle_does_not_keep_application_alive() {
        let app = Application::builder().build().unwrap();
        let handle = app.handle();
        assert!(handle.is_alive());
        drop(app);
        assert!(!handle.is_alive());
        assert!(matches!(handle.upgrade(), Err(TemplateError::ApplicationDropped)));
    }

    #[test]
    fn test_build_rejects_dangling_alias() {
        let err = Application::builder()
            .component_alias("nav", "menu")
            .build()
            .unwrap_err();
        assert!(matches!(err, TemplateError::HandlerNotCallable { ref name, .. } if name == "nav"));

        let err = Application::builder()
            .component_set("mail", ComponentRegistry::new().alias("x", "y"))
            .build()
            .unwrap_err();
        assert!(matches!(err, TemplateError::HandlerNotCallable { .. }));
    }

    #[test]
    fn test_configure_rejects_unknown_backend_eagerly() {
        let app = Application::builder().build().unwrap();
        let err = app
            .configure(Slot::Default, &bag(json!({"type": "Mason"})))
            .unwrap_err();
        assert!(matches!(err, TemplateError::UnknownBackend(_)));
        assert!(app.slot_config(Slot::Default).is_none());
    }

    #[test]
    fn test_configure_replaces_slot() {
        let app = Application::builder().build().unwrap();
        app.configure("pages", &bag(json!({"type": "Tera"}))).unwrap();
        app.configure("pages", &bag(json!({"file": "index"}))).unwrap();
        let store = app.slot_config("pages").unwrap();
        assert_eq!(store.plugin().backend_type, None);
        assert_eq!(store.plugin().file.as_deref(), Some("index"));
    }

    #[test]
    fn test_unknown_component_set_fails_at_load() {
        let app = Application::builder().build().unwrap();
        app.configure(
            Slot::Default,
            &bag(json!({"string": "x", "component_handler_class": "Mail"})),
        )
        .unwrap();
        let err = app.load(Slot::Default, LoadRequest::default()).unwrap_err();
        assert!(matches!(err, TemplateError::UnknownComponentSet(ref s) if s == "Mail"));
    }

    #[test]
    fn test_run_mode() {
        let app = Application::builder().run_mode("start").build().unwrap();
        assert_eq!(app.run_mode().as_deref(), Some("start"));
        app.set_run_mode("list");
        assert_eq!(app.run_mode().as_deref(), Some("list"));
    }
}

//! Embedded component dispatch.
//!
//! Templates call back into the application through the embed tag
//! (`CGIAPP_embed` unless configured otherwise):
//!
//! ```text
//! {{ CGIAPP_embed('header', title) }}
//! ```
//!
//! The first argument names a component. The [`ComponentDispatcher`] bound to
//! the template looks the name up in the application's [`ComponentRegistry`],
//! invokes the handler with the application, the [`ContainingSession`] and the
//! remaining arguments, and returns the handler's text for splicing.
//!
//! # Handlers
//!
//! A handler is anything implementing [`ComponentHandler`]. Closures are
//! accepted through [`FnComponent`] (and the builder's `component` method):
//!
//! ```rust
//! use anytemplate::{Application, ContainingSession};
//! use serde_json::Value;
//!
//! let app = Application::builder()
//!     .component("header", |_app: &Application, session: &ContainingSession, _args: &[Value]| {
//!         let title = session.param("title").and_then(Value::as_str).unwrap_or("Untitled");
//!         Ok(format!("<h1>{}</h1>", title))
//!     })
//!     .build()
//!     .unwrap();
//! ```
//!
//! Handlers may return a [`String`], a `&'static str` or a shared `Arc<str>`;
//! [`ComponentDispatcher::dispatch_raw`] keeps that distinction, while
//! [`ComponentDispatcher::dispatch`] always yields a `String`.
//!
//! # Nesting
//!
//! A handler is free to load and render another template through the
//! application it receives. That render gets its own session and dispatcher,
//! so nested components are plain recursion.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde_json::Value;

use crate::app::{AppHandle, Application};
use crate::error::TemplateError;
use crate::options::{lookup_path, OptionBag};
use crate::slots::Slot;

/// Output of a component handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentOutput {
    /// Owned text.
    Text(String),
    /// Shared text, for handlers that cache their output.
    Shared(Arc<str>),
}

impl ComponentOutput {
    /// The text, borrowed.
    pub fn as_str(&self) -> &str {
        match self {
            ComponentOutput::Text(text) => text,
            ComponentOutput::Shared(text) => text,
        }
    }

    /// Returns true for shared output.
    pub fn is_shared(&self) -> bool {
        matches!(self, ComponentOutput::Shared(_))
    }

    /// The text, dereferencing shared output.
    pub fn into_string(self) -> String {
        match self {
            ComponentOutput::Text(text) => text,
            ComponentOutput::Shared(text) => text.to_string(),
        }
    }
}

impl From<String> for ComponentOutput {
    fn from(text: String) -> Self {
        ComponentOutput::Text(text)
    }
}

impl From<&str> for ComponentOutput {
    fn from(text: &str) -> Self {
        ComponentOutput::Text(text.to_string())
    }
}

impl From<Arc<str>> for ComponentOutput {
    fn from(text: Arc<str>) -> Self {
        ComponentOutput::Shared(text)
    }
}

impl fmt::Display for ComponentOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A view of the session whose template issued an embed call.
///
/// This is a snapshot taken when the render starts, after pre-render hooks
/// ran, so handlers see the variables the template renders with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainingSession {
    slot: Slot,
    backend: String,
    template: String,
    params: OptionBag,
}

impl ContainingSession {
    pub(crate) fn new(slot: Slot, backend: &str, template: &str, params: OptionBag) -> Self {
        Self {
            slot,
            backend: backend.to_string(),
            template: template.to_string(),
            params,
        }
    }

    /// The slot the template was loaded from.
    pub fn slot(&self) -> &Slot {
        &self.slot
    }

    /// Name of the backend rendering the template.
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// The template file name, or `<string>` for literal sources.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// One variable of the containing template. Dotted paths are followed.
    pub fn param(&self, name: &str) -> Option<&Value> {
        lookup_path(&self.params, name)
    }

    /// All variables of the containing template.
    pub fn params(&self) -> &OptionBag {
        &self.params
    }
}

/// A component an embed call can invoke.
pub trait ComponentHandler: Send + Sync {
    /// Produces the component's text.
    fn render(
        &self,
        app: &Application,
        session: &ContainingSession,
        args: &[Value],
    ) -> Result<ComponentOutput, TemplateError>;
}

/// A [`ComponentHandler`] wrapping a closure.
pub struct FnComponent<F, O> {
    f: F,
    _phantom: PhantomData<fn() -> O>,
}

impl<F, O> FnComponent<F, O>
where
    F: Fn(&Application, &ContainingSession, &[Value]) -> Result<O, TemplateError> + Send + Sync,
    O: Into<ComponentOutput>,
{
    /// Wraps a closure.
    pub fn new(f: F) -> Self {
        Self {
            f,
            _phantom: PhantomData,
        }
    }
}

impl<F, O> ComponentHandler for FnComponent<F, O>
where
    F: Fn(&Application, &ContainingSession, &[Value]) -> Result<O, TemplateError> + Send + Sync,
    O: Into<ComponentOutput>,
{
    fn render(
        &self,
        app: &Application,
        session: &ContainingSession,
        args: &[Value],
    ) -> Result<ComponentOutput, TemplateError> {
        (self.f)(app, session, args).map(Into::into)
    }
}

#[derive(Clone)]
enum Entry {
    Handler(Arc<dyn ComponentHandler>),
    Alias(String),
}

/// Component name to handler table.
///
/// Besides handlers, a registry can hold aliases: alternative names that
/// forward to another entry. Aliases are checked by [`validate`](Self::validate)
/// when the application is built.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    entries: HashMap<String, Entry>,
}

impl ComponentRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a closure as a component.
    pub fn component<F, O>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Application, &ContainingSession, &[Value]) -> Result<O, TemplateError>
            + Send
            + Sync
            + 'static,
        O: Into<ComponentOutput> + 'static,
    {
        self.handler(name, FnComponent::new(f))
    }

    /// Registers a handler.
    pub fn handler(mut self, name: impl Into<String>, handler: impl ComponentHandler + 'static) -> Self {
        self.insert(name, Arc::new(handler));
        self
    }

    /// Registers `name` as another name for `target`.
    pub fn alias(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.entries.insert(name.into(), Entry::Alias(target.into()));
        self
    }

    /// Registers a shared handler, replacing any entry under `name`.
    pub fn insert(&mut self, name: impl Into<String>, handler: Arc<dyn ComponentHandler>) {
        self.entries.insert(name.into(), Entry::Handler(handler));
    }

    /// Returns true if `name` has an entry.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up the handler registered under `name`, following aliases.
    ///
    /// # Errors
    ///
    /// - [`TemplateError::UnknownHandler`] if `name` has no entry
    /// - [`TemplateError::HandlerNotCallable`] if `name` is an alias that does
    ///   not end in a handler
    pub fn lookup(&self, name: &str) -> Result<Arc<dyn ComponentHandler>, TemplateError> {
        let mut current = name;
        let mut seen = HashSet::new();
        loop {
            match self.entries.get(current) {
                Some(Entry::Handler(handler)) => return Ok(Arc::clone(handler)),
                Some(Entry::Alias(target)) => {
                    if !seen.insert(current) {
                        return Err(TemplateError::HandlerNotCallable {
                            name: name.to_string(),
                            reason: format!("alias cycle through '{}'", current),
                        });
                    }
                    current = target;
                }
                None if current == name => {
                    return Err(TemplateError::UnknownHandler(name.to_string()))
                }
                None => {
                    return Err(TemplateError::HandlerNotCallable {
                        name: name.to_string(),
                        reason: format!("alias target '{}' is not registered", current),
                    })
                }
            }
        }
    }

    /// Checks that every alias leads to a handler.
    pub fn validate(&self) -> Result<(), TemplateError> {
        for (name, entry) in &self.entries {
            if let Entry::Alias(_) = entry {
                self.lookup(name)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("components", &self.names())
            .finish()
    }
}

/// Routes embed calls from one template to the application's components.
///
/// A dispatcher belongs to one loaded template. It holds only a weak handle
/// to the application, and a snapshot of the containing session that is
/// refreshed at the start of every render.
pub struct ComponentDispatcher {
    app: AppHandle,
    component_set: Option<String>,
    session: RwLock<Arc<ContainingSession>>,
    failure: Mutex<Option<TemplateError>>,
}

impl ComponentDispatcher {
    /// Creates a dispatcher for the application behind `app`. With a
    /// `component_set`, handlers come from that named set instead of the
    /// application's main registry.
    pub fn new(app: AppHandle, component_set: Option<String>) -> Self {
        Self {
            app,
            component_set,
            session: RwLock::new(Arc::new(ContainingSession::default())),
            failure: Mutex::new(None),
        }
    }

    /// The component set handlers are looked up in.
    pub fn component_set(&self) -> Option<&str> {
        self.component_set.as_deref()
    }

    /// Replaces the containing-session snapshot handlers receive.
    pub fn bind_session(&self, session: ContainingSession) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(session);
    }

    /// The current containing-session snapshot.
    pub fn session(&self) -> Arc<ContainingSession> {
        Arc::clone(&self.session.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Invokes the component `name`, returning its output as produced.
    pub fn dispatch_raw(&self, name: &str, args: &[Value]) -> Result<ComponentOutput, TemplateError> {
        let app = self.app.upgrade()?;
        let handler = app
            .component_registry(self.component_set.as_deref())?
            .lookup(name)?;
        let session = self.session();
        tracing::debug!(
            handler = name,
            args = args.len(),
            template = session.template(),
            "dispatching embedded component"
        );
        handler.render(&app, &session, args)
    }

    /// Invokes the component `name`, returning its output as text.
    pub fn dispatch(&self, name: &str, args: &[Value]) -> Result<String, TemplateError> {
        self.dispatch_raw(name, args).map(ComponentOutput::into_string)
    }

    /// Keeps an error raised inside a native engine callback, so the render
    /// can report it instead of the engine's own wrapper error.
    pub fn stash_failure(&self, err: TemplateError) {
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if failure.is_none() {
            *failure = Some(err);
        }
    }

    /// Takes the stashed callback error, if any.
    pub fn take_failure(&self) -> Option<TemplateError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl fmt::Debug for ComponentDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentDispatcher")
            .field("component_set", &self.component_set)
            .field("app_alive", &self.app.is_alive())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo(_: &Application, _: &ContainingSession, args: &[Value]) -> Result<String, TemplateError> {
        Ok(args.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(","))
    }

    #[test]
    fn test_lookup_handler_and_alias() {
        let registry = ComponentRegistry::new()
            .component("echo", echo)
            .alias("repeat", "echo")
            .alias("again", "repeat");
        assert!(registry.lookup("echo").is_ok());
        assert!(registry.lookup("again").is_ok());
        assert!(registry.validate().is_ok());
    }

    #[test]
    fn test_unknown_handler() {
        let registry = ComponentRegistry::new();
        let err = registry.lookup("header").err().unwrap();
        assert!(matches!(err, TemplateError::UnknownHandler(ref n) if n == "header"));
    }

    #[test]
    fn test_dangling_alias_not_callable() {
        let registry = ComponentRegistry::new().alias("footer", "missing");
        let err = registry.lookup("footer").err().unwrap();
        assert!(matches!(err, TemplateError::HandlerNotCallable { ref name, .. } if name == "footer"));
        assert!(registry.validate().is_err());
    }

    #[test]
    fn test_alias_cycle_not_callable() {
        let registry = ComponentRegistry::new().alias("a", "b").alias("b", "a");
        let err = registry.lookup("a").err().unwrap();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_output_kinds() {
        let shared: Arc<str> = Arc::from("cached");
        let raw = ComponentOutput::from(Arc::clone(&shared));
        assert!(raw.is_shared());
        assert_eq!(raw.as_str(), "cached");
        assert_eq!(raw.into_string(), "cached");
        assert!(!ComponentOutput::from("x").is_shared());
    }

    #[test]
    fn test_dispatch_passes_session_and_args() {
        let app = Application::builder()
            .component("greet", |_: &Application, session: &ContainingSession, args: &[Value]| {
                let name = session.param("user.name").and_then(Value::as_str).unwrap_or("?");
                Ok(format!("{} {}", args[0].as_str().unwrap_or(""), name))
            })
            .build()
            .unwrap();

        let dispatcher = ComponentDispatcher::new(app.handle(), None);
        dispatcher.bind_session(ContainingSession::new(
            Slot::Default,
            "Simple",
            "<string>",
            json!({"user": {"name": "Ada"}}).as_object().cloned().unwrap(),
        ));
        let out = dispatcher.dispatch("greet", &[json!("Hello")]).unwrap();
        assert_eq!(out, "Hello Ada");
    }

    #[test]
    fn test_dispatch_raw_keeps_shared_output() {
        let shared: Arc<str> = Arc::from("<hr/>");
        let app = Application::builder()
            .component("rule", move |_: &Application, _: &ContainingSession, _: &[Value]| {
                Ok(Arc::clone(&shared))
            })
            .build()
            .unwrap();

        let dispatcher = ComponentDispatcher::new(app.handle(), None);
        let raw = dispatcher.dispatch_raw("rule", &[]).unwrap();
        assert!(raw.is_shared());
        assert_eq!(dispatcher.dispatch("rule", &[]).unwrap(), "<hr/>");
    }

    #[test]
    fn test_dispatch_after_application_dropped() {
        let app = Application::builder().component("echo", echo).build().unwrap();
        let dispatcher = ComponentDispatcher::new(app.handle(), None);
        drop(app);
        let err = dispatcher.dispatch("echo", &[]).unwrap_err();
        assert!(matches!(err, TemplateError::ApplicationDropped));
    }

    #[test]
    fn test_first_failure_is_kept() {
        let app = Application::builder().build().unwrap();
        let dispatcher = ComponentDispatcher::new(app.handle(), None);
        dispatcher.stash_failure(TemplateError::UnknownHandler("a".into()));
        dispatcher.stash_failure(TemplateError::UnknownHandler("b".into()));
        let err = dispatcher.take_failure().unwrap();
        assert_eq!(err.handler_name(), Some("a"));
        assert!(dispatcher.take_failure().is_none());
    }
}

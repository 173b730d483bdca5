//! Render sessions.
//!
//! A [`RenderSession`] is what [`Application::load`](crate::Application::load)
//! returns: one loaded template, its effective configuration and its variable
//! bag. Sessions are never reused; every load builds a new one.
//!
//! # Render Pipeline
//!
//! ```text
//! render()
//!   → query association (unless disabled; never overwrites set variables)
//!   → pre-render hooks
//!   → native engine, with embedded components dispatched through the
//!     application
//!   → post-render hooks
//!   → text
//! ```

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::app::AppHandle;
use crate::backend::Backend;
use crate::config::ConfigStore;
use crate::dispatch::ContainingSession;
use crate::error::TemplateError;
use crate::options::{kind_of, OptionBag};
use crate::slots::Slot;

/// Per-call arguments to [`Application::load`](crate::Application::load).
///
/// A request is an option bag of overrides, layered over the slot's
/// configuration with the same partitioning rules. The constructors cover the
/// usual cases:
///
/// ```rust
/// use anytemplate::LoadRequest;
/// use serde_json::json;
///
/// let by_file = LoadRequest::file("list");
/// let by_text = LoadRequest::string("Hello {{ name }}");
/// let tuned = LoadRequest::file("list")
///     .option("add_include_paths", json!(["t/override"]))
///     .option("MiniJinja", json!({"trim_blocks": true}));
/// # let _ = (by_file, by_text, tuned);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadRequest {
    overrides: OptionBag,
}

impl LoadRequest {
    /// A request for a template file.
    pub fn file(name: impl Into<String>) -> Self {
        Self::default().option("file", Value::String(name.into()))
    }

    /// A request for literal template source.
    pub fn string(text: impl Into<String>) -> Self {
        Self::default().option("string", Value::String(text.into()))
    }

    /// A request with the given overrides.
    pub fn options(overrides: OptionBag) -> Self {
        Self { overrides }
    }

    /// Adds one override.
    pub fn option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }

    /// The overrides.
    pub fn overrides(&self) -> &OptionBag {
        &self.overrides
    }
}

impl From<&str> for LoadRequest {
    fn from(name: &str) -> Self {
        LoadRequest::file(name)
    }
}

impl From<String> for LoadRequest {
    fn from(name: String) -> Self {
        LoadRequest::file(name)
    }
}

impl From<OptionBag> for LoadRequest {
    fn from(overrides: OptionBag) -> Self {
        LoadRequest::options(overrides)
    }
}

/// A loaded template with its variables.
#[derive(Debug)]
pub struct RenderSession {
    slot: Slot,
    config: Arc<ConfigStore>,
    backend: Backend,
    app: AppHandle,
}

impl RenderSession {
    pub(crate) fn new(slot: Slot, config: Arc<ConfigStore>, backend: Backend, app: AppHandle) -> Self {
        Self {
            slot,
            config,
            backend,
            app,
        }
    }

    /// The slot this session was loaded from.
    pub fn slot(&self) -> &Slot {
        &self.slot
    }

    /// The configuration actually used.
    ///
    /// When the load had no overrides this is the slot's base store itself.
    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /// The backend holding the template.
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// The backend, mutably.
    pub fn backend_mut(&mut self) -> &mut Backend {
        &mut self.backend
    }

    /// Gives up the session, keeping the backend.
    pub fn into_backend(self) -> Backend {
        self.backend
    }

    /// Handle to the owning application.
    pub fn app(&self) -> &AppHandle {
        &self.app
    }

    /// Gets one variable.
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.backend.param(name)
    }

    /// Sets one variable, returning the previous value.
    pub fn set_param(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.backend.set_param(name, value)
    }

    /// Sets every variable in `vars`.
    pub fn set_params(&mut self, vars: OptionBag) {
        self.backend.params_mut().extend(vars);
    }

    /// Sets variables from any value that serializes to a map.
    pub fn set_params_from<T: Serialize>(&mut self, data: &T) -> Result<(), TemplateError> {
        match serde_json::to_value(data)? {
            Value::Object(vars) => {
                self.set_params(vars);
                Ok(())
            }
            Value::Null => Ok(()),
            other => Err(TemplateError::invalid_option(
                "params",
                format!("template variables must be a mapping, found {}", kind_of(&other)),
            )),
        }
    }

    /// A copy of all variables.
    pub fn params(&self) -> OptionBag {
        self.backend.params()
    }

    /// The live variable bag.
    pub fn params_mut(&mut self) -> &mut OptionBag {
        self.backend.params_mut()
    }

    /// Removes all variables.
    pub fn clear_params(&mut self) {
        self.backend.clear_params();
    }

    /// Renders the template.
    ///
    /// The session can be rendered again, with the same or changed variables.
    ///
    /// # Errors
    ///
    /// - [`TemplateError::ApplicationDropped`] if the application is gone
    /// - [`TemplateError::Hook`] if a hook fails
    /// - any dispatch error from an embedded component, such as
    ///   [`TemplateError::UnknownHandler`]
    /// - the native engine's own error for everything else
    pub fn render(&mut self) -> Result<String, TemplateError> {
        let app = self.app.upgrade()?;

        let mut associated = None;
        if self.backend.driver_config().associate_query && !app.query().is_empty() {
            let query = app.query().to_bag();
            if self.backend.binds_query_natively() {
                associated = Some(query);
            } else {
                self.backend.associate(&query);
            }
        }

        app.hooks().run_pre_render(&mut self.backend)?;

        let dispatcher = Arc::clone(self.backend.dispatcher());
        dispatcher.take_failure();
        let mut visible = self.backend.params();
        if let Some(query) = &associated {
            for (name, value) in query {
                visible.entry(name.clone()).or_insert_with(|| value.clone());
            }
        }
        dispatcher.bind_session(ContainingSession::new(
            self.slot.clone(),
            self.backend.name(),
            self.backend.source().label(),
            visible,
        ));

        tracing::debug!(
            slot = %self.slot,
            backend = self.backend.name(),
            template = self.backend.source().label(),
            params = self.backend.params_len(),
            "rendering template"
        );
        let mut text = match self.backend.render_native(associated.as_ref()) {
            Ok(text) => text,
            Err(err) => return Err(dispatcher.take_failure().unwrap_or(err)),
        };

        app.hooks().run_post_render(&self.backend, &mut text)?;
        Ok(text)
    }

    /// Same as [`render`](Self::render).
    pub fn output(&mut self) -> Result<String, TemplateError> {
        self.render()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Application;
    use serde_json::json;

    #[test]
    fn test_load_request_conversions() {
        assert_eq!(LoadRequest::from("page").overrides()["file"], "page");
        assert_eq!(LoadRequest::string("x").overrides()["string"], "x");
        let bag = json!({"type": "Tera"}).as_object().cloned().unwrap();
        assert_eq!(LoadRequest::from(bag.clone()).overrides(), &bag);
        assert!(LoadRequest::default().overrides().is_empty());
    }

    #[test]
    fn test_params_copy_and_live() {
        let app = Application::builder().build().unwrap();
        let mut session = app.load(Slot::Default, LoadRequest::string("{{ a }}")).unwrap();

        assert_eq!(session.set_param("a", 1), None);
        let mut copy = session.params();
        copy.insert("a".into(), json!(2));
        assert_eq!(session.param("a").unwrap(), 1);

        session.params_mut().insert("a".into(), json!(3));
        assert_eq!(session.render().unwrap(), "3");

        session.clear_params();
        assert!(session.params().is_empty());
    }

    #[derive(Serialize)]
    struct Page {
        title: &'static str,
        count: u32,
    }

    #[test]
    fn test_set_params_from_struct() {
        let app = Application::builder().build().unwrap();
        let mut session = app
            .load(Slot::Default, LoadRequest::string("{{ title }}/{{ count }}"))
            .unwrap();
        session
            .set_params_from(&Page {
                title: "Home",
                count: 3,
            })
            .unwrap();
        assert_eq!(session.output().unwrap(), "Home/3");
        assert!(session.set_params_from(&vec![1, 2]).is_err());
    }

    #[test]
    fn test_render_after_application_dropped() {
        let app = Application::builder().build().unwrap();
        let mut session = app.load(Slot::Default, LoadRequest::string("x")).unwrap();
        drop(app);
        assert!(matches!(session.render(), Err(TemplateError::ApplicationDropped)));
    }
}

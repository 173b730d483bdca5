//! Backend registration and lookup.
//!
//! Backends are registered up front in a [`BackendRegistry`], as a table
//! from identifier to constructor. Nothing is loaded by name at run time;
//! identifiers are still validated against `[A-Za-z0-9_:]+` before lookup so
//! that strings from configuration files cannot smuggle in anything else.
//!
//! Each entry is constructed at most once, on first use, and the instance is
//! then shared. Construction is guarded by a [`OnceCell`], so concurrent first
//! lookups from independent applications build the backend exactly once.
//!
//! The built-in table holds `Simple`, `Tera`, `MiniJinja` and `Tal`:
//!
//! ```rust
//! use anytemplate::BackendRegistry;
//!
//! let registry = BackendRegistry::global();
//! let tera = registry.resolve("Tera").unwrap();
//! assert!(tera.declared_config_keys().contains(&"template_extension"));
//! assert!(registry.resolve("Tera; rm -rf").is_err());
//! ```

use std::fmt;
use std::sync::Arc;

use once_cell::sync::{Lazy, OnceCell};

use crate::backend::{BackendType, JinjaBackend, SimpleBackend, TalBackend, TeraBackend};
use crate::error::TemplateError;

/// Constructor stored for each registered backend.
pub type BackendConstructor = Box<dyn Fn() -> Arc<dyn BackendType> + Send + Sync>;

static GLOBAL: Lazy<Arc<BackendRegistry>> = Lazy::new(|| Arc::new(BackendRegistry::with_builtins()));

/// Checks that a backend name only uses `[A-Za-z0-9_:]`.
pub fn validate_backend_name(name: &str) -> Result<(), TemplateError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':');
    if valid {
        Ok(())
    } else {
        Err(TemplateError::InvalidBackendName(name.to_string()))
    }
}

struct Entry {
    name: String,
    constructor: BackendConstructor,
    loaded: OnceCell<Arc<dyn BackendType>>,
}

/// Table of available backends.
pub struct BackendRegistry {
    entries: Vec<Entry>,
}

impl BackendRegistry {
    /// A registry with no backends.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// A registry holding the four built-in backends.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.insert("Simple", || Arc::new(SimpleBackend));
        registry.insert("Tera", || Arc::new(TeraBackend));
        registry.insert("MiniJinja", || Arc::new(JinjaBackend));
        registry.insert("Tal", || Arc::new(TalBackend));
        registry
    }

    /// The process-wide registry of built-in backends.
    pub fn global() -> Arc<BackendRegistry> {
        Arc::clone(&GLOBAL)
    }

    /// Registers a backend under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: &str, constructor: F) -> Result<(), TemplateError>
    where
        F: Fn() -> Arc<dyn BackendType> + Send + Sync + 'static,
    {
        validate_backend_name(name)?;
        self.insert(name, constructor);
        Ok(())
    }

    fn insert<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn() -> Arc<dyn BackendType> + Send + Sync + 'static,
    {
        self.entries.retain(|entry| entry.name != name);
        self.entries.push(Entry {
            name: name.to_string(),
            constructor: Box::new(constructor),
            loaded: OnceCell::new(),
        });
    }

    /// Resolves a backend name to its (shared) implementation.
    ///
    /// # Errors
    ///
    /// - [`TemplateError::InvalidBackendName`] if `name` has disallowed characters
    /// - [`TemplateError::UnknownBackend`] if nothing is registered under `name`
    /// - [`TemplateError::BackendLoad`] if the constructed backend reports a
    ///   different name than it was registered under
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn BackendType>, TemplateError> {
        validate_backend_name(name)?;
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| TemplateError::UnknownBackend(name.to_string()))?;

        let backend = entry.loaded.get_or_try_init(|| {
            let backend = (entry.constructor)();
            if backend.name() != entry.name {
                return Err(TemplateError::BackendLoad {
                    backend: entry.name.clone(),
                    reason: format!("implementation declares itself as '{}'", backend.name()),
                });
            }
            tracing::debug!(backend = %entry.name, "loaded template backend");
            Ok(backend)
        })?;
        Ok(Arc::clone(backend))
    }

    /// Returns true if `name` is registered (without loading it).
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|entry| entry.name == name)
    }

    /// Registered backend names, in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names().collect::<Vec<_>>())
            .finish()
    }
}

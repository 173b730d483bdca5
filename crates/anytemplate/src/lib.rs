//! One calling convention over interchangeable template engines.
//!
//! `anytemplate` lets application code configure, load and render templates
//! the same way whichever engine does the rendering, and lets templates call
//! back into the application to render reusable fragments (embedded
//! components).
//!
//! # Overview
//!
//! ```text
//! Application::configure(slot, options)   → ConfigStore for the slot
//! Application::load(slot, overrides)      → RenderSession
//!     ConfigStore::merged                 → effective configuration
//!     BackendRegistry::resolve            → backend (Simple, Tera, MiniJinja, Tal)
//!     Backend::load                       → compiled template + ComponentDispatcher
//! RenderSession::set_param / render       → text
//!     CGIAPP_embed('name', ...)           → ComponentDispatcher → component handler
//! ```
//!
//! # Quick Start
//!
//! ```rust
//! use anytemplate::{Application, ContainingSession, Slot};
//! use serde_json::{json, Value};
//!
//! let app = Application::builder()
//!     .component("header", |_: &Application, _: &ContainingSession, _: &[Value]| {
//!         Ok("<H1>Title</H1>")
//!     })
//!     .build()
//!     .unwrap();
//!
//! app.configure(Slot::Default, json!({
//!     "type": "MiniJinja",
//!     "string": "{{ CGIAPP_embed('header') }}{{ greeting }}",
//! }).as_object().unwrap()).unwrap();
//!
//! let vars = json!({"greeting": "hello"});
//! let output = app.fill(Slot::Default, None, vars.as_object().unwrap()).unwrap();
//! assert_eq!(output, "<H1>Title</H1>hello");
//! ```
//!
//! # Configuration
//!
//! Options are JSON-shaped bags (see [`options_from_yaml`] for loading them
//! from files). Top-level keys are either plugin options (`type`,
//! `include_paths`, `file`, ...) or backend names whose sections configure
//! that backend. See [`ConfigStore`] for how they are partitioned and layered.
//!
//! # Backends
//!
//! | Name | Embed syntax | Default extension |
//! |------|--------------|-------------------|
//! | `Simple` | `CGIAPP_embed('h', var)` in the text or alone in `{{ }}` | `.html` |
//! | `Tera` | `{{ CGIAPP_embed(name="h", args=[var]) }}` | `.html` |
//! | `MiniJinja` | `{{ CGIAPP_embed('h', var) }}` | `.tmpl` |
//! | `Tal` | `tal:replace="structure CGIAPP_embed('h', var)"` | `.xhtml` |
//!
//! Further backends can be registered on a [`BackendRegistry`] and given to
//! the application with [`ApplicationBuilder::backends`].

// Core modules
mod app;
mod backend;
mod config;
mod dispatch;
mod embed;
mod error;
mod hooks;
mod options;
mod registry;
mod session;
mod slots;

// Re-export core types
pub use app::{AppHandle, Application, ApplicationBuilder, QueryParams};

pub use backend::{
    resolve_source, Backend, BackendFamily, BackendInit, BackendType, DriverConfig, JinjaBackend,
    MissingVariable, NativeEngine, SimpleBackend, SimpleEngine, TalBackend, TemplateSource,
    TeraBackend, DEFAULT_EMBED_TAG,
};

pub use config::{ConfigStore, PluginConfig, DEFAULT_BACKEND, PLUGIN_KEYS};

pub use dispatch::{
    ComponentDispatcher, ComponentHandler, ComponentOutput, ComponentRegistry, ContainingSession,
    FnComponent,
};

pub use embed::{EmbedArg, EmbedCall, Emulated};

pub use error::{HookError, HookPhase, TemplateError};

pub use hooks::{PostRenderFn, PreRenderFn, RenderHooks};

pub use options::{options_from_json, options_from_yaml, resolve_include_paths, OptionBag};

pub use registry::{validate_backend_name, BackendConstructor, BackendRegistry};

pub use session::{LoadRequest, RenderSession};

pub use slots::{Slot, SlotTable};

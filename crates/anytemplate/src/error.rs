//! Error types for configuration, loading, rendering and component dispatch.
//!
//! [`TemplateError`] is the single error type returned by every public
//! operation. Configuration and resolution problems are reported eagerly, by
//! [`Application::configure`](crate::Application::configure) and
//! [`Application::load`](crate::Application::load); native engine failures
//! surface from [`RenderSession::render`](crate::RenderSession::render) and are
//! wrapped without translation.

use std::fmt;
use std::path::PathBuf;

/// The stage at which a render hook failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    /// Before the native engine runs.
    PreRender,
    /// After the native engine produced its text.
    PostRender,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPhase::PreRender => write!(f, "pre-render"),
            HookPhase::PostRender => write!(f, "post-render"),
        }
    }
}

/// Error returned by a render hook.
#[derive(Debug, thiserror::Error)]
#[error("hook error ({phase}): {message}")]
pub struct HookError {
    /// Human-readable error message
    pub message: String,
    /// The hook phase where the error occurred
    pub phase: HookPhase,
    /// The underlying error source, if any
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl HookError {
    /// Creates a new hook error for the pre-render phase.
    pub fn pre_render(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            phase: HookPhase::PreRender,
            source: None,
        }
    }

    /// Creates a new hook error for the post-render phase.
    pub fn post_render(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            phase: HookPhase::PostRender,
            source: None,
        }
    }

    /// Sets the source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        self.source = Some(source.into());
        self
    }
}

/// Error type for all template operations.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    /// A backend name containing characters outside `[A-Za-z0-9_:]`.
    #[error("invalid backend name '{0}': only letters, digits, '_' and ':' are allowed")]
    InvalidBackendName(String),

    /// A well-formed backend name with no registered implementation.
    #[error("unknown template backend '{0}'")]
    UnknownBackend(String),

    /// A backend whose implementation failed to load or declare itself.
    #[error("failed to load template backend '{backend}': {reason}")]
    BackendLoad { backend: String, reason: String },

    /// Neither a template file nor literal source could be determined.
    #[error("no template source: {0}")]
    MissingSource(String),

    /// An embedded component named a handler the application never registered.
    #[error("unknown component handler '{0}'")]
    UnknownHandler(String),

    /// A registered component name that does not lead to an invokable handler.
    #[error("component handler '{name}' is not callable: {reason}")]
    HandlerNotCallable { name: String, reason: String },

    /// `component_handler_class` named a component set the application lacks.
    #[error("unknown component set '{0}'")]
    UnknownComponentSet(String),

    /// An embed tag whose argument list could not be parsed.
    #[error("malformed {tag} call '{call}': {reason}")]
    MalformedEmbed {
        tag: String,
        call: String,
        reason: String,
    },

    /// An option with a value of the wrong shape.
    #[error("invalid option '{key}': {reason}")]
    InvalidOption { key: String, reason: String },

    /// Option text (YAML or JSON) that could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The owning application was dropped while a session still referred to it.
    #[error("the owning application is no longer alive")]
    ApplicationDropped,

    /// A pre- or post-render hook failed.
    #[error(transparent)]
    Hook(#[from] HookError),

    /// Reading a template file failed.
    #[error("failed to read template '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A component handler failed for its own reasons.
    #[error("component '{name}' failed: {message}")]
    Component { name: String, message: String },

    /// Error raised by the MiniJinja engine.
    #[error(transparent)]
    MiniJinja(#[from] minijinja::Error),

    /// Error raised by the Tera engine.
    #[error(transparent)]
    Tera(#[from] tera::Error),

    /// Error raised by the TAL engine.
    #[error(transparent)]
    Tal(#[from] anytemplate_tal::TalError),

    /// Error raised by the simple substitution engine.
    #[error("template error: {0}")]
    Substitution(String),
}

impl TemplateError {
    /// Creates an [`TemplateError::InvalidOption`].
    pub fn invalid_option(key: impl Into<String>, reason: impl Into<String>) -> Self {
        TemplateError::InvalidOption {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Creates a [`TemplateError::Component`] for a handler that failed.
    pub fn component(name: impl Into<String>, message: impl Into<String>) -> Self {
        TemplateError::Component {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Returns the handler name for dispatch errors.
    pub fn handler_name(&self) -> Option<&str> {
        match self {
            TemplateError::UnknownHandler(name) => Some(name),
            TemplateError::HandlerNotCallable { name, .. } => Some(name),
            TemplateError::Component { name, .. } => Some(name),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for TemplateError {
    fn from(err: serde_json::Error) -> Self {
        TemplateError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for TemplateError {
    fn from(err: serde_yaml::Error) -> Self {
        TemplateError::Config(err.to_string())
    }
}

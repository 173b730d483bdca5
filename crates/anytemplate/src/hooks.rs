//! Render hooks.
//!
//! Hooks run around the native engine on every render:
//!
//! ```text
//! query association
//!   → PRE-RENDER HOOKS  ← (read or change the variable bag)
//!   → native engine (embedded components dispatch from here)
//!   → POST-RENDER HOOKS ← (rewrite the rendered text)
//! ```
//!
//! Hooks are registered on the [`ApplicationBuilder`](crate::ApplicationBuilder)
//! and run in registration order. A failing hook aborts the render.

use std::fmt;
use std::sync::Arc;

use crate::backend::Backend;
use crate::error::HookError;

/// Type alias for pre-render hook functions.
///
/// Pre-render hooks get the backend mutably, so they can set, replace or
/// remove variables after query association and before the engine runs.
pub type PreRenderFn = Arc<dyn Fn(&mut Backend) -> Result<(), HookError> + Send + Sync>;

/// Type alias for post-render hook functions.
pub type PostRenderFn = Arc<dyn Fn(&Backend, &mut String) -> Result<(), HookError> + Send + Sync>;

/// Hooks of one application.
#[derive(Clone, Default)]
pub struct RenderHooks {
    pre_render: Vec<PreRenderFn>,
    post_render: Vec<PostRenderFn>,
}

impl RenderHooks {
    /// Creates an empty hook set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no hooks are registered.
    pub fn is_empty(&self) -> bool {
        self.pre_render.is_empty() && self.post_render.is_empty()
    }

    /// Adds a pre-render hook.
    pub fn pre_render<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Backend) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.pre_render.push(Arc::new(f));
        self
    }

    /// Adds a post-render hook.
    pub fn post_render<F>(mut self, f: F) -> Self
    where
        F: Fn(&Backend, &mut String) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.post_render.push(Arc::new(f));
        self
    }

    /// Runs all pre-render hooks.
    pub fn run_pre_render(&self, backend: &mut Backend) -> Result<(), HookError> {
        for hook in &self.pre_render {
            hook(backend)?;
        }
        Ok(())
    }

    /// Runs all post-render hooks, each seeing the previous one's text.
    pub fn run_post_render(&self, backend: &Backend, text: &mut String) -> Result<(), HookError> {
        for hook in &self.post_render {
            hook(backend, text)?;
        }
        Ok(())
    }
}

impl fmt::Debug for RenderHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderHooks")
            .field("pre_render_count", &self.pre_render.len())
            .field("post_render_count", &self.post_render.len())
            .finish()
    }
}

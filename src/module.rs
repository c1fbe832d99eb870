// Package module defines the pluggable unit contract shared by every
// component the platform can instantiate from configuration.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::httpd::{Handler, RequestMatcher};

/// Errors raised while decoding, provisioning or validating a config tree.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Malformed JSON or a schema violation at the given location.
    #[error("decoding {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// An inline fragment named a module the registry does not know.
    #[error("unknown module \"{name}\" in namespace \"{namespace}\"")]
    ModuleNotFound { namespace: String, name: String },

    /// A module's provision step failed; wraps the failing module ID.
    #[error("provisioning {module}: {source}")]
    Provision {
        module: String,
        #[source]
        source: Box<ConfigError>,
    },

    /// A module's validate step rejected its own configuration.
    #[error("validating {module}: {reason}")]
    Validate { module: String, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConfigError {
    /// Wraps an error as the provision failure of the named module.
    pub fn provision(module: impl Into<String>, source: ConfigError) -> Self {
        Self::Provision {
            module: module.into(),
            source: Box::new(source),
        }
    }
}

/// A pluggable unit instantiated from a config fragment.
///
/// Lifecycle: constructed by decode, provisioned under a [`Context`],
/// validated, placed into the live tree, cleaned up exactly once when the
/// owning context is cancelled. All hooks default to no-ops; modules
/// implement the subset they need.
///
/// The `as_*` accessors surface the roles a module can play. A module
/// overrides the accessor for each role it implements, returning itself.
pub trait Module: Send + Sync + 'static {
    /// One-shot initialization under a config scope. Submodule fields are
    /// resolved here through [`Context::load_module_inline`] and friends,
    /// so children finish provisioning before their parent does.
    fn provision(&mut self, _ctx: &Context) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Pure configuration check, run after provisioning succeeds.
    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Releases resources. Invoked exactly once when the owning context
    /// is cancelled.
    fn cleanup(&self) {}

    fn as_handler(self: Arc<Self>) -> Option<Arc<dyn Handler>> {
        None
    }

    fn as_matcher(self: Arc<Self>) -> Option<Arc<dyn RequestMatcher>> {
        None
    }

    fn as_app(self: Arc<Self>) -> Option<Arc<dyn App>> {
        None
    }
}

impl std::fmt::Debug for dyn Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Module").finish()
    }
}

/// A long-lived subsystem rooted at a top-level config subtree.
///
/// Apps are provisioned like any other module, then started once the whole
/// new config tree is built. `stop` runs when the generation is retired
/// and must drain gracefully before returning.
#[async_trait]
pub trait App: Send + Sync {
    async fn start(&self) -> Result<(), ConfigError>;
    async fn stop(&self);

    /// Concrete-type access for collaborators that look an app up by
    /// name and need more than the lifecycle surface.
    fn as_any(&self) -> &dyn std::any::Any;
}

// Package context provides the ownership and cancellation scope of one
// configuration generation, plus the module decode machinery that loads
// submodules into that scope.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::module::{App, ConfigError, Module};
use crate::registry;


type CancelFn = Box<dyn FnOnce() + Send>;

struct Inner {
    token: CancellationToken,
    cancelled: AtomicBool,
    /// Modules in provision completion order (children before parents).
    owned: Mutex<Vec<Arc<dyn Module>>>,
    cleanups: Mutex<Vec<CancelFn>>,
    apps: Mutex<HashMap<String, Arc<dyn App>>>,
}

/// The cancellation and ownership envelope for all modules of one config
/// generation. Every live module instance belongs to exactly one context;
/// cancelling the context releases its resources exactly once.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                cancelled: AtomicBool::new(false),
                owned: Mutex::new(Vec::new()),
                cleanups: Mutex::new(Vec::new()),
                apps: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The scope's cancellation token. Long-running tasks belonging to
    /// this generation select on a child of this token.
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Registers a cleanup to run when the scope ends. Cleanups run in
    /// LIFO order, before module cleanup hooks.
    pub fn on_cancel<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.cleanups.lock().push(Box::new(f));
    }

    /// Ends the scope: marks it cancelled, runs registered cleanups in
    /// LIFO order, then calls every owned module's cleanup hook exactly
    /// once, parents before children. Subsequent calls are no-ops.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.token.cancel();

        let cleanups: Vec<CancelFn> = {
            let mut guard = self.inner.cleanups.lock();
            guard.drain(..).rev().collect()
        };
        for f in cleanups {
            f();
        }

        let owned: Vec<Arc<dyn Module>> = {
            let mut guard = self.inner.owned.lock();
            guard.drain(..).rev().collect()
        };
        debug!(
            component = "context",
            event = "cancelled",
            modules = owned.len(),
            "scope ended"
        );
        for m in owned {
            m.cleanup();
        }
    }

    /// Records a started app for by-name lookup from other modules.
    pub fn put_app(&self, name: impl Into<String>, app: Arc<dyn App>) {
        self.inner.apps.lock().insert(name.into(), app);
    }

    /// Looks up a provisioned app by name. Back-references between
    /// modules go through this lookup, never through direct pointers.
    pub fn app(&self, name: &str) -> Option<Arc<dyn App>> {
        self.inner.apps.lock().get(name).cloned()
    }

    /// Decodes, provisions and validates the module registered under `id`
    /// from the given raw fragment, taking ownership of the instance.
    pub fn load_module_id(
        &self,
        id: &str,
        raw: &Value,
    ) -> Result<Arc<dyn Module>, ConfigError> {
        let (namespace, name) = split_id(id);
        let desc = registry::get(id).ok_or_else(|| ConfigError::ModuleNotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })?;

        let mut module = if raw.is_null() {
            desc.new_instance()
        } else {
            desc.decode(raw)?
        };

        module
            .provision(self)
            .map_err(|e| ConfigError::provision(id, e))?;
        module.validate().map_err(|e| ConfigError::provision(id, e))?;

        let module: Arc<dyn Module> = Arc::from(module);
        self.inner.owned.lock().push(module.clone());
        Ok(module)
    }

    /// Loads an inline module fragment: an object whose `inline_key`
    /// property names the module within `namespace`; the remaining fields
    /// decode into the instance.
    pub fn load_module_inline(
        &self,
        namespace: &str,
        inline_key: &str,
        raw: &Value,
    ) -> Result<Arc<dyn Module>, ConfigError> {
        let obj = raw.as_object().ok_or_else(|| ConfigError::Decode {
            path: namespace.to_string(),
            source: serde::de::Error::custom(format!(
                "inline module fragment must be an object with a \"{inline_key}\" key"
            )),
        })?;

        let name = obj
            .get(inline_key)
            .and_then(Value::as_str)
            .ok_or_else(|| ConfigError::ModuleNotFound {
                namespace: namespace.to_string(),
                name: format!("<missing \"{inline_key}\" key>"),
            })?
            .to_string();

        let mut rest = obj.clone();
        rest.remove(inline_key);

        let id = format!("{namespace}.{name}");
        self.load_module_id(&id, &Value::Object(rest))
    }

    /// Loads a module map: an object keyed by module name within
    /// `namespace`, each value the module's config fragment. `null`
    /// fragments decode to a zero instance.
    pub fn load_module_map(
        &self,
        namespace: &str,
        raw: &Value,
    ) -> Result<Vec<(String, Arc<dyn Module>)>, ConfigError> {
        let obj = raw.as_object().ok_or_else(|| ConfigError::Decode {
            path: namespace.to_string(),
            source: serde::de::Error::custom("module map must be a JSON object"),
        })?;

        let mut out = Vec::with_capacity(obj.len());
        for (name, fragment) in obj {
            let id = format!("{namespace}.{name}");
            let module = self.load_module_id(&id, fragment)?;
            out.push((name.clone(), module));
        }
        Ok(out)
    }

    /// Loads an array of inline module fragments.
    pub fn load_module_array(
        &self,
        namespace: &str,
        inline_key: &str,
        raw: &Value,
    ) -> Result<Vec<Arc<dyn Module>>, ConfigError> {
        let items = raw.as_array().ok_or_else(|| ConfigError::Decode {
            path: namespace.to_string(),
            source: serde::de::Error::custom("module array must be a JSON array"),
        })?;

        items
            .iter()
            .map(|item| self.load_module_inline(namespace, inline_key, item))
            .collect()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !self.cancelled.load(Ordering::Acquire) && !self.owned.get_mut().is_empty() {
            warn!(
                component = "context",
                event = "dropped_without_cancel",
                "context dropped while still owning modules"
            );
        }
    }
}

/// Splits a module ID into its namespace and final label.
pub fn split_id(id: &str) -> (&str, &str) {
    match id.rfind('.') {
        Some(i) => (&id[..i], &id[i + 1..]),
        None => ("", id),
    }
}

// Package registry provides the process-global module catalog.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::de::DeserializeOwned;

use crate::module::{ConfigError, Module};


/// Namespace grammar for module IDs: dot-separated lowercase labels.
static ID_GRAMMAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_]+(\.[a-z0-9_]+)*$").expect("module ID grammar"));

/// Catalog entry: a module ID plus the constructors the decoder needs.
///
/// `new` yields a fresh zero-valued instance (used for `null` map entries);
/// `from_json` strict-decodes a config fragment into a new instance.
#[derive(Clone, Copy)]
pub struct Descriptor {
    pub id: &'static str,
    new: fn() -> Box<dyn Module>,
    from_json: fn(&serde_json::Value) -> Result<Box<dyn Module>, serde_json::Error>,
}

impl Descriptor {
    /// Builds a descriptor for a concrete module type.
    pub fn of<T>(id: &'static str) -> Self
    where
        T: Module + Default + DeserializeOwned,
    {
        Self {
            id,
            new: || Box::new(T::default()),
            from_json: |raw| T::deserialize(raw).map(|m| Box::new(m) as Box<dyn Module>),
        }
    }

    /// Returns a zero-valued instance.
    pub fn new_instance(&self) -> Box<dyn Module> {
        (self.new)()
    }

    /// Decodes a raw config fragment into a fresh instance.
    pub fn decode(&self, raw: &serde_json::Value) -> Result<Box<dyn Module>, ConfigError> {
        (self.from_json)(raw).map_err(|source| ConfigError::Decode {
            path: self.id.to_string(),
            source,
        })
    }
}

/// Registration happens at process init (before any server starts); the
/// table is effectively immutable for the rest of the process lifetime.
static MODULES: Lazy<RwLock<HashMap<&'static str, Descriptor>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Installs a module descriptor under a globally unique ID.
///
/// Panics on a duplicate ID or on an ID violating the namespace grammar —
/// both are programmer errors that must surface at startup, never at
/// request time.
pub fn register(descriptor: Descriptor) {
    if !ID_GRAMMAR.is_match(descriptor.id) {
        panic!("module ID \"{}\" violates the namespace grammar", descriptor.id);
    }
    let mut table = MODULES.write();
    if table.contains_key(descriptor.id) {
        panic!("module \"{}\" is already registered", descriptor.id);
    }
    table.insert(descriptor.id, descriptor);
}

/// Returns the descriptor registered under `id`, if any.
pub fn get(id: &str) -> Option<Descriptor> {
    MODULES.read().get(id).copied()
}

/// Enumerates the direct children of a namespace: descriptors whose ID is
/// `prefix.<label>` with no further dots. An empty prefix enumerates the
/// top-level namespace.
pub fn modules_in_namespace(prefix: &str) -> Vec<&'static str> {
    let table = MODULES.read();
    let mut ids: Vec<&'static str> = table
        .keys()
        .copied()
        .filter(|id| {
            if prefix.is_empty() {
                !id.contains('.')
            } else {
                id.strip_prefix(prefix)
                    .and_then(|rest| rest.strip_prefix('.'))
                    .map(|label| !label.is_empty() && !label.contains('.'))
                    .unwrap_or(false)
            }
        })
        .collect();
    ids.sort_unstable();
    ids
}

/// Registers a module type under an ID at process init.
#[macro_export]
macro_rules! register_module {
    ($id:literal, $ty:ty) => {
        const _: () = {
            #[ctor::ctor]
            fn register() {
                $crate::registry::register($crate::registry::Descriptor::of::<$ty>($id));
            }
        };
    };
}

// Package config defines the configuration document model.
//
// The platform consumes a JSON tree rooted at an object with an `admin`
// section and an `apps` map. App subtrees are raw module fragments; they
// are decoded through the registry when a generation is provisioned, not
// here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::module::ConfigError;

#[cfg(test)]
mod config_test;

/// Default bind address of the admin endpoint.
pub const DEFAULT_ADMIN_LISTEN: &str = "localhost:2019";

/// The root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<AdminConfig>,

    /// App name to app config fragment. Each key is a module ID in the
    /// top-level namespace (e.g. `http`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub apps: BTreeMap<String, serde_json::Value>,
}

/// Settings of the administration endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminConfig {
    #[serde(default, skip_serializing_if = "is_false")]
    pub disabled: bool,

    /// Listen address; defaults to [`DEFAULT_ADMIN_LISTEN`]. Supports the
    /// same grammar as server listeners (`tcp` and `unix` forms).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,

    /// Origins allowed to reach the endpoint. Defaults to the listen
    /// host itself plus the loopback names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origins: Option<Vec<String>>,

    /// Require an Origin header on every request. Implied for
    /// non-loopback TCP binds; never applied to unix sockets.
    #[serde(default, skip_serializing_if = "is_false")]
    pub enforce_origin: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Config {
    /// Strict-decodes a root document from a JSON value.
    pub fn from_value(raw: &serde_json::Value) -> Result<Self, ConfigError> {
        Self::deserialize(raw).map_err(|source| ConfigError::Decode {
            path: "/".to_string(),
            source,
        })
    }

    pub fn admin_listen(&self) -> String {
        self.admin
            .as_ref()
            .and_then(|a| a.listen.clone())
            .unwrap_or_else(|| DEFAULT_ADMIN_LISTEN.to_string())
    }
}

/// Parses raw bytes into a JSON value plus its canonical (compact)
/// serialization. Two documents are considered equal when their canonical
/// bytes match.
pub fn canonicalize(bytes: &[u8]) -> Result<(serde_json::Value, Vec<u8>), ConfigError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|source| ConfigError::Decode {
            path: "/".to_string(),
            source,
        })?;
    let canonical = serde_json::to_vec(&value).map_err(|source| ConfigError::Decode {
        path: "/".to_string(),
        source,
    })?;
    Ok((value, canonical))
}

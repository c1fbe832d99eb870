// Built-in handlers of the `http.handlers` namespace.

use serde::{Deserialize, Serialize};

use crate::replacer::Replacer;

pub mod error;
pub mod headers;
pub mod rewrite;
pub mod static_response;
pub mod subroute;
pub mod vars;

/// A status code given either as an integer or as a string that may
/// contain placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusValue {
    Int(u16),
    Str(String),
}

impl StatusValue {
    /// Resolves to a concrete status code; `fallback` covers missing or
    /// unparsable values.
    pub fn resolve(&self, replacer: &Replacer, fallback: u16) -> u16 {
        match self {
            StatusValue::Int(code) => *code,
            StatusValue::Str(s) => replacer
                .replace_all(s, "")
                .trim()
                .parse()
                .unwrap_or(fallback),
        }
    }
}

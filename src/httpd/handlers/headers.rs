// Request and response header manipulation, with optional deferral of
// response operations until the response surfaces.

use std::collections::BTreeMap;
use std::sync::Arc;

use hyper::header::{HeaderName, HeaderValue};
use hyper::HeaderMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::Context;
use crate::httpd::matchers::values_match;
use crate::httpd::scope::scope_of;
use crate::httpd::{Handler, HandlerError, Next, Request, Response};
use crate::module::{ConfigError, Module};
use crate::register_module;
use crate::replacer::Replacer;

/// Add/set/delete/replace operations over a header map.
// No deny_unknown_fields here: this struct is flattened into RespOps and
// serde cannot combine the two.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderOps {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub add: BTreeMap<String, Vec<String>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, Vec<String>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delete: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub replace: BTreeMap<String, Vec<Replacement>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Replacement {
    pub search_regex: String,
    pub replace: String,
}

/// Gate for response operations: empty status list means any status;
/// header values use the same semantics as the header matcher.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseMatcher {
    #[serde(default)]
    pub status_code: Vec<u16>,

    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
}

impl ResponseMatcher {
    pub fn matches(&self, response: &Response) -> bool {
        if !self.status_code.is_empty()
            && !self.status_code.contains(&response.status().as_u16())
        {
            return false;
        }
        self.headers.iter().all(|(field, expected)| {
            let actual: Vec<String> = response
                .headers()
                .get_all(field.as_str())
                .iter()
                .filter_map(|v| v.to_str().ok())
                .map(str::to_string)
                .collect();
            values_match(&actual, expected)
        })
    }
}

/// Response operations parked in the request scope until the response
/// comes back up the chain.
#[derive(Clone)]
pub struct DeferredOps {
    pub ops: HeaderOps,
    pub require: Option<ResponseMatcher>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RespOps {
    #[serde(flatten)]
    pub ops: HeaderOps,

    /// Defer application until the first byte of the response is written.
    #[serde(default)]
    pub deferred: bool,

    /// Apply only when the response matches.
    #[serde(default)]
    pub require: Option<ResponseMatcher>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Headers {
    #[serde(default)]
    pub request: Option<HeaderOps>,

    #[serde(default)]
    pub response: Option<RespOps>,
}

impl Module for Headers {
    fn provision(&mut self, _ctx: &Context) -> Result<(), ConfigError> {
        // Surface bad replacement patterns at load time, not per request.
        let all = self
            .request
            .iter()
            .map(|o| &o.replace)
            .chain(self.response.iter().map(|r| &r.ops.replace));
        for replacements in all {
            for repl in replacements.values().flatten() {
                Regex::new(&repl.search_regex).map_err(|e| ConfigError::Validate {
                    module: "http.handlers.headers".to_string(),
                    reason: format!("invalid search_regex {:?}: {e}", repl.search_regex),
                })?;
            }
        }
        Ok(())
    }

    fn as_handler(self: Arc<Self>) -> Option<Arc<dyn Handler>> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl Handler for Headers {
    async fn serve(&self, mut req: Request, next: Next) -> Result<Response, HandlerError> {
        let scope = scope_of(&req)
            .ok_or_else(|| anyhow::anyhow!("request scope missing"))?;

        if let Some(ops) = &self.request {
            let replacer_snapshot = scope.replacer();
            apply_ops(req.headers_mut(), ops, replacer_snapshot);
            scope.refresh(&req);
        }

        let Some(resp_ops) = &self.response else {
            return next.serve(req).await;
        };

        // Deferral (explicit, or implied by a response gate) parks the
        // operations in the scope; the server applies them exactly once
        // when the response surfaces.
        if resp_ops.deferred || resp_ops.require.is_some() {
            debug!(
                component = "httpd",
                event = "headers_deferred",
                "response header ops parked"
            );
            scope.deferred.lock().push(DeferredOps {
                ops: resp_ops.ops.clone(),
                require: resp_ops.require.clone(),
            });
            return next.serve(req).await;
        }

        let mut response = next.serve(req).await?;
        apply_ops(response.headers_mut(), &resp_ops.ops, scope.replacer());
        Ok(response)
    }
}

/// Applies one operation block to a header map. Values go through the
/// replacer first.
pub fn apply_ops(headers: &mut HeaderMap, ops: &HeaderOps, replacer: &Replacer) {
    for (field, values) in &ops.add {
        let Ok(name) = HeaderName::from_bytes(field.as_bytes()) else {
            continue;
        };
        for value in values {
            let expanded = replacer.replace_all(value, "");
            if let Ok(value) = HeaderValue::from_str(&expanded) {
                headers.append(name.clone(), value);
            }
        }
    }

    for (field, values) in &ops.set {
        let Ok(name) = HeaderName::from_bytes(field.as_bytes()) else {
            continue;
        };
        headers.remove(&name);
        for value in values {
            let expanded = replacer.replace_all(value, "");
            if let Ok(value) = HeaderValue::from_str(&expanded) {
                headers.append(name.clone(), value);
            }
        }
    }

    for field in &ops.delete {
        if let Ok(name) = HeaderName::from_bytes(field.as_bytes()) {
            headers.remove(&name);
        }
    }

    for (field, replacements) in &ops.replace {
        let Ok(name) = HeaderName::from_bytes(field.as_bytes()) else {
            continue;
        };
        let current: Vec<String> = headers
            .get_all(&name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();
        headers.remove(&name);
        for mut value in current {
            for repl in replacements {
                if let Ok(re) = Regex::new(&repl.search_regex) {
                    let with = replacer.replace_all(&repl.replace, "");
                    value = re.replace_all(&value, with.as_str()).into_owned();
                }
            }
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.append(name.clone(), value);
            }
        }
    }
}

register_module!("http.handlers.headers", Headers);

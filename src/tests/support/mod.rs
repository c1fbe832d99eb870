// Shared test support: the boot harness, an HTTP client and test-only
// modules.

use std::sync::Arc;

use crate::httpd::{Handler, HandlerError, Next, Request, Response};
use crate::module::Module;
use crate::register_module;

pub mod client;
pub mod harness;
pub mod lock;

/// Test-only middleware: wraps the response's `X-Trace` header with its
/// tag on the way down and up, so `[1, 2, terminal]` yields `1,2,2,1`.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TraceMark {
    pub tag: String,
}

impl Module for TraceMark {
    fn as_handler(self: Arc<Self>) -> Option<Arc<dyn Handler>> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl Handler for TraceMark {
    async fn serve(&self, req: Request, next: Next) -> Result<Response, HandlerError> {
        let mut response = next.serve(req).await?;
        let previous = response
            .headers()
            .get("x-trace")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let merged = if previous.is_empty() {
            format!("{0},{0}", self.tag)
        } else {
            format!("{0},{1},{0}", self.tag, previous)
        };
        response
            .headers_mut()
            .insert("x-trace", merged.parse().expect("trace header value"));
        Ok(response)
    }
}

register_module!("http.handlers.test_mark", TraceMark);

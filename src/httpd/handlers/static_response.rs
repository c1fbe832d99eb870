// A terminal handler that writes a fixed response, with placeholder
// expansion in the status, headers and body.

use std::collections::BTreeMap;
use std::sync::Arc;

use hyper::header::{HeaderName, HeaderValue, CONNECTION};
use serde::Deserialize;

use crate::httpd::handlers::StatusValue;
use crate::httpd::scope::scope_of;
use crate::httpd::{full_body, Handler, HandlerError, Next, Request, Response};
use crate::module::Module;
use crate::register_module;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticResponse {
    #[serde(default)]
    pub status_code: Option<StatusValue>,

    #[serde(default)]
    pub headers: Option<BTreeMap<String, Vec<String>>>,

    #[serde(default)]
    pub body: Option<String>,

    /// Ask the client to close the connection after the response.
    #[serde(default)]
    pub close: bool,
}

impl Module for StaticResponse {
    fn as_handler(self: Arc<Self>) -> Option<Arc<dyn Handler>> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl Handler for StaticResponse {
    async fn serve(&self, req: Request, _next: Next) -> Result<Response, HandlerError> {
        let scope = scope_of(&req)
            .ok_or_else(|| anyhow::anyhow!("request scope missing"))?;
        let replacer = scope.replacer();

        let status = self
            .status_code
            .as_ref()
            .map(|s| s.resolve(replacer, 200))
            .unwrap_or(200);

        let body = self
            .body
            .as_ref()
            .map(|b| replacer.replace_all(b, ""))
            .unwrap_or_default();

        let mut response = hyper::Response::builder()
            .status(status)
            .body(full_body(body))
            .map_err(|e| anyhow::anyhow!("building static response: {e}"))?;

        if let Some(headers) = &self.headers {
            for (field, values) in headers {
                let name = HeaderName::from_bytes(field.as_bytes())
                    .map_err(|e| anyhow::anyhow!("invalid header field {field:?}: {e}"))?;
                for value in values {
                    let expanded = replacer.replace_all(value, "");
                    if let Ok(value) = HeaderValue::from_str(&expanded) {
                        response.headers_mut().append(name.clone(), value);
                    }
                }
            }
        }

        if self.close {
            response
                .headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("close"));
        }

        Ok(response)
    }
}

register_module!("http.handlers.static_response", StaticResponse);

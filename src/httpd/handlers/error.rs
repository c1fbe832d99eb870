// A handler that fails on purpose with a configured status and message,
// handing the request to the server's error routes.

use std::sync::Arc;

use serde::Deserialize;

use crate::httpd::handlers::StatusValue;
use crate::httpd::scope::scope_of;
use crate::httpd::{Handler, HandlerError, Next, Request, Response};
use crate::module::Module;
use crate::register_module;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorHandler {
    #[serde(default)]
    pub status_code: Option<StatusValue>,

    #[serde(default)]
    pub message: Option<String>,
}

impl Module for ErrorHandler {
    fn as_handler(self: Arc<Self>) -> Option<Arc<dyn Handler>> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl Handler for ErrorHandler {
    async fn serve(&self, req: Request, _next: Next) -> Result<Response, HandlerError> {
        let scope = scope_of(&req)
            .ok_or_else(|| anyhow::anyhow!("request scope missing"))?;
        let replacer = scope.replacer();

        let code = self
            .status_code
            .as_ref()
            .map(|s| s.resolve(replacer, 500))
            .unwrap_or(500);
        let message = self
            .message
            .as_ref()
            .map(|m| replacer.replace_all(m, ""))
            .unwrap_or_default();

        Err(HandlerError::status(code, message))
    }
}

register_module!("http.handlers.error", ErrorHandler);

// A middleware that sets request variables, readable downstream through
// `{http.vars.*}` placeholders and the vars matcher-less lookups.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::httpd::scope::scope_of;
use crate::httpd::{Handler, HandlerError, Next, Request, Response};
use crate::module::Module;
use crate::register_module;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VarsHandler(pub BTreeMap<String, Value>);

impl Module for VarsHandler {
    fn as_handler(self: Arc<Self>) -> Option<Arc<dyn Handler>> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl Handler for VarsHandler {
    async fn serve(&self, req: Request, next: Next) -> Result<Response, HandlerError> {
        if let Some(scope) = scope_of(&req) {
            for (key, value) in &self.0 {
                let value = match value {
                    Value::String(s) => {
                        Value::String(scope.replacer().replace_all(s, ""))
                    }
                    other => other.clone(),
                };
                scope.set_var(key.clone(), value);
            }
        }
        next.serve(req).await
    }
}

register_module!("http.handlers.vars", VarsHandler);

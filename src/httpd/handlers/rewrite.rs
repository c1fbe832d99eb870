// Internal URI rewriting, optionally restarting route evaluation so the
// rewritten request is matched from the top.

use std::sync::Arc;

use hyper::Uri;
use serde::Deserialize;
use tracing::debug;

use crate::httpd::scope::scope_of;
use crate::httpd::{Handler, HandlerError, Next, Request, Response};
use crate::module::Module;
use crate::register_module;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rewrite {
    /// New request URI (path, optionally with a query); placeholders are
    /// expanded.
    #[serde(default)]
    pub uri: Option<String>,

    /// Prefix to strip from the path before any `uri` rewrite applies.
    #[serde(default)]
    pub strip_path_prefix: Option<String>,

    /// Restart route evaluation with the rewritten request.
    #[serde(default)]
    pub rehandle: bool,
}

impl Module for Rewrite {
    fn as_handler(self: Arc<Self>) -> Option<Arc<dyn Handler>> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl Handler for Rewrite {
    async fn serve(&self, mut req: Request, next: Next) -> Result<Response, HandlerError> {
        let scope = scope_of(&req)
            .ok_or_else(|| anyhow::anyhow!("request scope missing"))?;

        let mut path = req.uri().path().to_string();
        let mut query = req.uri().query().map(str::to_string);

        if let Some(prefix) = &self.strip_path_prefix {
            let prefix = scope.replacer().replace_all(prefix, "");
            if let Some(stripped) = path.strip_prefix(&prefix) {
                path = if stripped.starts_with('/') {
                    stripped.to_string()
                } else {
                    format!("/{stripped}")
                };
            }
        }

        if let Some(uri) = &self.uri {
            let expanded = scope.replacer().replace_all(uri, "");
            match expanded.split_once('?') {
                Some((p, q)) => {
                    path = p.to_string();
                    query = if q.is_empty() { None } else { Some(q.to_string()) };
                }
                None => path = expanded,
            }
        }

        let target = match &query {
            Some(q) => format!("{path}?{q}"),
            None => path.clone(),
        };
        let new_uri: Uri = target
            .parse()
            .map_err(|e| anyhow::anyhow!("rewritten URI {target:?} is invalid: {e}"))?;

        debug!(
            component = "httpd",
            event = "rewrite",
            uri = %new_uri,
            rehandle = self.rehandle,
            "request rewritten"
        );

        *req.uri_mut() = new_uri;
        scope.refresh(&req);

        if self.rehandle {
            return Err(HandlerError::Rehandle(req));
        }
        next.serve(req).await
    }
}

register_module!("http.handlers.rewrite", Rewrite);

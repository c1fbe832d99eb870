// A handler that is itself a compiled route list. Its terminal routes
// stop evaluation only within its own scope; without error routes of its
// own, unhandled requests fall through to the enclosing continuation.

use std::sync::Arc;

use serde::Deserialize;

use crate::context::Context;
use crate::httpd::routes::{compile_routes, CompiledRoute, ErrorRoutes, RouteConfig};
use crate::httpd::scope::scope_of;
use crate::httpd::server::serve_error_routes;
use crate::httpd::{Handler, HandlerError, Next, Request, Response};
use crate::module::{ConfigError, Module};
use crate::register_module;

#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Subroute {
    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    #[serde(default)]
    pub errors: Option<ErrorRoutes>,

    #[serde(skip)]
    compiled: Option<Arc<[CompiledRoute]>>,

    #[serde(skip)]
    compiled_errors: Option<Arc<[CompiledRoute]>>,
}

impl Module for Subroute {
    fn provision(&mut self, ctx: &Context) -> Result<(), ConfigError> {
        self.compiled = Some(compile_routes(ctx, &self.routes)?);
        if let Some(errors) = &self.errors {
            self.compiled_errors = Some(compile_routes(ctx, &errors.routes)?);
        }
        Ok(())
    }

    fn as_handler(self: Arc<Self>) -> Option<Arc<dyn Handler>> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl Handler for Subroute {
    async fn serve(&self, req: Request, next: Next) -> Result<Response, HandlerError> {
        let routes = self
            .compiled
            .clone()
            .ok_or_else(|| anyhow::anyhow!("subroute evaluated before provisioning"))?;

        // With its own error routes the subroute is an error boundary:
        // it runs isolated and absorbs chain failures. Otherwise it
        // splices its routes ahead of the enclosing continuation.
        let Some(error_routes) = self.compiled_errors.clone() else {
            return next.prepend_routes(routes).serve(req).await;
        };

        let scope = scope_of(&req)
            .ok_or_else(|| anyhow::anyhow!("request scope missing"))?;
        match Next::for_routes(routes).serve(req).await {
            Ok(response) => Ok(response),
            Err(err @ HandlerError::Rehandle(_)) => Err(err),
            Err(err) => serve_error_routes(&scope, error_routes, &err).await,
        }
    }
}

register_module!("http.handlers.subroute", Subroute);

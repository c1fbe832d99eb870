// Route compilation and the middleware dispatch engine.
//
// A server's ordered routes compile once per config generation into
// matcher predicates plus handler chains. Dispatch walks a frame stack:
// handler frames run the current route's chain, route frames continue the
// ordered scan, so a non-terminal route's handlers wrap everything that
// comes after it and a subroute composes by prepending its own frame.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::context::Context;
use crate::httpd::scope::scope_of;
use crate::httpd::{empty_body, Handler, HandlerError, Request, RequestMatcher, Response};
use crate::module::ConfigError;

/// One matcher set: matcher module name to its config fragment. Matchers
/// within a set AND together; sets within a route OR together.
pub type RawMatcherSet = serde_json::Map<String, Value>;

/// A route as it appears in configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    #[serde(default, rename = "match", skip_serializing_if = "Option::is_none")]
    pub matchers: Option<Vec<RawMatcherSet>>,

    /// Ordered inline handler fragments forming the middleware chain.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handle: Vec<Value>,

    /// A terminal route stops route evaluation once its chain runs.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub terminal: bool,

    /// At most one route per group runs for a given request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// Error-route list attached to a server or subroute.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorRoutes {
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

pub struct CompiledRoute {
    pub matcher_sets: Vec<Vec<Arc<dyn RequestMatcher>>>,
    pub handlers: Arc<[Arc<dyn Handler>]>,
    pub terminal: bool,
    pub group: Option<String>,
}

impl CompiledRoute {
    /// OR of ANDs; a route with no matcher sets matches every request.
    pub fn matches(&self, req: &Request) -> bool {
        if self.matcher_sets.is_empty() {
            return true;
        }
        self.matcher_sets
            .iter()
            .any(|set| set.iter().all(|m| m.matches(req)))
    }
}

/// Compiles matcher sets through the registry under this generation's
/// scope.
pub fn compile_matcher_sets(
    ctx: &Context,
    raw_sets: &[RawMatcherSet],
) -> Result<Vec<Vec<Arc<dyn RequestMatcher>>>, ConfigError> {
    let mut sets = Vec::with_capacity(raw_sets.len());
    for raw in raw_sets {
        let loaded = ctx.load_module_map("http.matchers", &Value::Object(raw.clone()))?;
        let mut set = Vec::with_capacity(loaded.len());
        for (name, module) in loaded {
            let matcher = module.as_matcher().ok_or_else(|| {
                ConfigError::Validate {
                    module: format!("http.matchers.{name}"),
                    reason: "module does not implement the matcher role".to_string(),
                }
            })?;
            set.push(matcher);
        }
        sets.push(set);
    }
    Ok(sets)
}

/// Compiles an ordered route list.
pub fn compile_routes(
    ctx: &Context,
    routes: &[RouteConfig],
) -> Result<Arc<[CompiledRoute]>, ConfigError> {
    let mut compiled = Vec::with_capacity(routes.len());
    for route in routes {
        let matcher_sets = match &route.matchers {
            Some(raw) => compile_matcher_sets(ctx, raw)?,
            None => Vec::new(),
        };

        let mut handlers = Vec::with_capacity(route.handle.len());
        for fragment in &route.handle {
            let module = ctx.load_module_inline("http.handlers", "handler", fragment)?;
            let handler = module.as_handler().ok_or_else(|| ConfigError::Validate {
                module: "http.handlers".to_string(),
                reason: "module does not implement the handler role".to_string(),
            })?;
            handlers.push(handler);
        }

        compiled.push(CompiledRoute {
            matcher_sets,
            handlers: handlers.into(),
            terminal: route.terminal,
            group: route.group.clone(),
        });
    }
    Ok(compiled.into())
}

#[derive(Clone)]
enum Frame {
    /// Remaining handlers of the route currently executing.
    Handlers(Arc<[Arc<dyn Handler>]>, usize),
    /// Remaining routes of an ordered scan.
    Routes(Arc<[CompiledRoute]>, usize),
}

/// The continuation a handler receives. Calling `serve` consumes it and
/// runs everything that remains: the rest of the current chain, then the
/// remaining routes of every enclosing scan.
#[derive(Clone)]
pub struct Next {
    frames: Vec<Frame>,
}

impl Next {
    /// A continuation with nothing left to run.
    pub fn end() -> Self {
        Self { frames: Vec::new() }
    }

    pub(crate) fn for_routes(routes: Arc<[CompiledRoute]>) -> Self {
        Self {
            frames: vec![Frame::Routes(routes, 0)],
        }
    }

    /// Prepends a route scan ahead of this continuation; used by
    /// subroutes so their terminality stays scoped to their own list.
    pub(crate) fn prepend_routes(mut self, routes: Arc<[CompiledRoute]>) -> Self {
        self.frames.insert(0, Frame::Routes(routes, 0));
        self
    }

    /// Runs the continuation to completion. A request that falls off the
    /// end of every frame gets an empty 200.
    pub fn serve(mut self, req: Request) -> BoxFuture<'static, Result<Response, HandlerError>> {
        Box::pin(async move {
            loop {
                let Some(frame) = self.frames.first_mut() else {
                    return Ok(hyper::Response::new(empty_body()));
                };

                match frame {
                    Frame::Handlers(handlers, pos) => {
                        if *pos >= handlers.len() {
                            self.frames.remove(0);
                            continue;
                        }
                        let handler = handlers[*pos].clone();
                        *pos += 1;
                        return handler.serve(req, self).await;
                    }
                    Frame::Routes(routes, pos) => {
                        let routes = routes.clone();
                        let start = *pos;
                        let scope = scope_of(&req);

                        let mut matched = None;
                        for (i, route) in routes.iter().enumerate().skip(start) {
                            if let (Some(group), Some(scope)) = (&route.group, &scope) {
                                if scope.groups.lock().contains(group) {
                                    continue;
                                }
                            }
                            if route.matches(&req) {
                                matched = Some(i);
                                break;
                            }
                        }

                        let Some(i) = matched else {
                            self.frames.remove(0);
                            continue;
                        };

                        let route = &routes[i];
                        if let (Some(group), Some(scope)) = (&route.group, &scope) {
                            scope.groups.lock().insert(group.clone());
                        }
                        debug!(
                            component = "httpd",
                            event = "route_matched",
                            route = i,
                            terminal = route.terminal,
                            "dispatching route"
                        );

                        let chain = route.handlers.clone();
                        if route.terminal {
                            self.frames.remove(0);
                        } else if let Some(Frame::Routes(_, pos)) = self.frames.first_mut() {
                            *pos = i + 1;
                        }
                        self.frames.insert(0, Frame::Handlers(chain, 0));
                    }
                }
            }
        })
    }
}

/// Runs one ordered route scan from the top.
pub async fn serve_routes(
    routes: Arc<[CompiledRoute]>,
    req: Request,
) -> Result<Response, HandlerError> {
    Next::for_routes(routes).serve(req).await
}

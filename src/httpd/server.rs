// One HTTP server: listeners, compiled routes, per-request dispatch with
// rehandle and error routing, graceful drain on generation swap.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::httpd::handlers::headers::apply_ops;
use crate::httpd::routes::{compile_routes, serve_routes, CompiledRoute, ErrorRoutes, RouteConfig};
use crate::httpd::scope::{RequestInfo, RequestScope};
use crate::httpd::{empty_body, empty_request_body, HandlerError, Request, Response};
use crate::listeners::{self, AnyListener, SocketSpec, TimedStream};
use crate::metrics;
use crate::module::ConfigError;

const DEFAULT_MAX_REHANDLES: u32 = 3;

/// One server block of the `http` app.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteConfig>,

    /// Routes invoked when the handler chain fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<ErrorRoutes>,

    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub read_header_timeout: Option<Duration>,

    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub read_timeout: Option<Duration>,

    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub write_timeout: Option<Duration>,

    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<Duration>,

    /// How long draining in-flight requests may take on shutdown or
    /// reload. Default: no grace, cut over immediately.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub grace_period: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rehandles: Option<u32>,

    /// Protocols to serve: any subset of `h1` and `h2`. Both when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocols: Option<Vec<String>>,
}

/// A compiled, runnable server.
pub struct Server {
    pub name: String,
    cfg: ServerConfig,
    routes: Arc<[CompiledRoute]>,
    error_routes: Option<Arc<[CompiledRoute]>>,
    specs: Vec<SocketSpec>,
    token: CancellationToken,
    bound: parking_lot::Mutex<Vec<SocketAddr>>,
}

impl Server {
    /// Compiles one server block under the generation's scope.
    pub fn compile(
        name: &str,
        cfg: ServerConfig,
        ctx: &Context,
        token: CancellationToken,
    ) -> Result<Arc<Self>, ConfigError> {
        let mut specs = Vec::new();
        for addr in &cfg.listen {
            let parsed = listeners::parse_listen_addr(addr).map_err(|e| ConfigError::Validate {
                module: format!("http server {name}"),
                reason: e.to_string(),
            })?;
            specs.extend(parsed.expand());
        }

        let routes = compile_routes(ctx, &cfg.routes)?;
        let error_routes = match &cfg.errors {
            Some(errors) => Some(compile_routes(ctx, &errors.routes)?),
            None => None,
        };

        Ok(Arc::new(Self {
            name: name.to_string(),
            cfg,
            routes,
            error_routes,
            specs,
            token,
            bound: parking_lot::Mutex::new(Vec::new()),
        }))
    }

    /// Binds (or adopts) every listener and spawns its accept loop.
    pub async fn run(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>, ConfigError> {
        let mut handles = Vec::with_capacity(self.specs.len());
        for spec in &self.specs {
            let listener = listeners::bind_or_adopt(spec)
                .await
                .map_err(|e| ConfigError::Other(e.into()))?;
            if let Some(addr) = listener.local_addr() {
                self.bound.lock().push(addr);
            }

            info!(
                component = "httpd",
                event = "server_listening",
                server = %self.name,
                key = %spec.key(),
                "accept loop starting"
            );

            let server = self.clone();
            handles.push(tokio::spawn(async move {
                server.accept_loop(listener).await;
            }));
        }
        Ok(handles)
    }

    /// The addresses of the bound TCP listeners, known once `run` has
    /// opened them; harnesses discover ephemeral ports through this.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.bound.lock().clone()
    }

    fn protocol_enabled(&self, name: &str) -> bool {
        match &self.cfg.protocols {
            Some(list) => list.iter().any(|p| p == name),
            None => true,
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: AnyListener) {
        let mut builder = auto::Builder::new(TokioExecutor::new());
        if !self.protocol_enabled("h2") {
            builder = builder.http1_only();
        } else if !self.protocol_enabled("h1") {
            builder = builder.http2_only();
        }
        if let Some(t) = self.cfg.read_header_timeout {
            builder.http1().timer(hyper_util::rt::TokioTimer::new()).header_read_timeout(t);
        }
        if let Some(t) = self.cfg.idle_timeout {
            builder
                .http2()
                .timer(hyper_util::rt::TokioTimer::new())
                .keep_alive_interval(t)
                .keep_alive_timeout(t);
        }
        let builder = Arc::new(builder);
        let graceful = GracefulShutdown::new();
        let mut conn_tasks: Vec<tokio::task::AbortHandle> = Vec::new();

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(
                                component = "httpd",
                                event = "accept_failed",
                                server = %self.name,
                                error = %e,
                                "accept failed"
                            );
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            continue;
                        }
                    };

                    let server = self.clone();
                    let service = service_fn(move |req: hyper::Request<Incoming>| {
                        let server = server.clone();
                        async move {
                            Ok::<_, std::convert::Infallible>(server.handle(req, peer).await)
                        }
                    });

                    let stream = TimedStream::new(stream, self.cfg.read_timeout);
                    let conn = builder
                        .serve_connection_with_upgrades(TokioIo::new(stream), service)
                        .into_owned();
                    let watched = graceful.watch(conn);
                    let name = self.name.clone();
                    let task = tokio::spawn(async move {
                        if let Err(e) = watched.await {
                            debug!(
                                component = "httpd",
                                event = "connection_ended",
                                server = %name,
                                error = %e,
                                "connection closed with error"
                            );
                        }
                    });
                    conn_tasks.retain(|t| !t.is_finished());
                    conn_tasks.push(task.abort_handle());
                }
            }
        }

        // Stopped accepting; drain in-flight requests up to the grace
        // period (none by default), then cut the rest off.
        if let Some(grace) = self.cfg.grace_period {
            if tokio::time::timeout(grace, graceful.shutdown()).await.is_err() {
                warn!(
                    component = "httpd",
                    event = "drain_timeout",
                    server = %self.name,
                    grace = ?grace,
                    "in-flight requests cut off at grace deadline"
                );
            }
        }
        for task in conn_tasks {
            task.abort();
        }

        info!(
            component = "httpd",
            event = "server_stopped",
            server = %self.name,
            "accept loop ended"
        );
    }

    /// Entry point for one request: builds the request scope, runs the
    /// bounded rehandle loop, routes errors, applies deferred header ops
    /// and never fails the transport.
    pub async fn handle(
        self: Arc<Self>,
        req: hyper::Request<Incoming>,
        peer: Option<SocketAddr>,
    ) -> Response {
        metrics::inc_requests();
        metrics::request_started();
        let started = Instant::now();

        let mut req: Request = req.map(|body| body.boxed());
        let scope = RequestScope::new(RequestInfo::capture(&req, peer));
        req.extensions_mut().insert(scope.clone());

        let method = scope.info().method;
        let path = scope.info().path;

        let dispatch = self.dispatch(req, &scope);
        let outcome = match std::panic::AssertUnwindSafe(dispatch).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                metrics::inc_panics();
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(
                    component = "httpd",
                    event = "handler_panicked",
                    server = %self.name,
                    panic = %message,
                    backtrace = %std::backtrace::Backtrace::force_capture(),
                    "recovered panic in handler chain"
                );
                Err(HandlerError::status(500, "internal error"))
            }
        };

        let mut response = match outcome {
            Ok(response) => response,
            Err(err) => self.route_error(&scope, err).await,
        };

        // Deferred response-header operations apply exactly once, gated
        // on their response matcher. The response headers become visible
        // to placeholders first.
        scope.set_response_headers(response.headers().clone());
        let deferred: Vec<_> = scope.deferred.lock().drain(..).collect();
        for d in deferred {
            let applies = d.require.as_ref().map(|m| m.matches(&response)).unwrap_or(true);
            if applies {
                apply_ops(response.headers_mut(), &d.ops, scope.replacer());
            }
        }

        let extra = scope.take_log_fields();
        info!(
            component = "httpd",
            event = "request_served",
            server = %self.name,
            method = %method,
            path = %path,
            status = response.status().as_u16(),
            duration_ms = started.elapsed().as_millis() as u64,
            extra = ?extra,
            "request complete"
        );
        metrics::request_finished();
        response
    }

    /// The bounded rehandle loop around route evaluation.
    async fn dispatch(
        &self,
        req: Request,
        scope: &Arc<RequestScope>,
    ) -> Result<Response, HandlerError> {
        let max_rehandles = self.cfg.max_rehandles.unwrap_or(DEFAULT_MAX_REHANDLES);
        let mut passes: u32 = 0;
        let mut current = req;

        loop {
            scope.refresh(&current);
            let pass = match self.cfg.write_timeout {
                Some(t) => match tokio::time::timeout(t, serve_routes(self.routes.clone(), current)).await {
                    Ok(result) => result,
                    Err(_) => return Err(HandlerError::status(504, "response timed out")),
                },
                None => serve_routes(self.routes.clone(), current).await,
            };

            match pass {
                Err(HandlerError::Rehandle(rewritten)) => {
                    passes += 1;
                    if passes > max_rehandles {
                        metrics::inc_rehandle_aborts();
                        return Err(HandlerError::RehandleLoop(passes));
                    }
                    current = rewritten;
                }
                other => return other,
            }
        }
    }

    /// Routes a chain failure: the error routes take over when
    /// configured, the default error writer otherwise.
    async fn route_error(&self, scope: &Arc<RequestScope>, err: HandlerError) -> Response {
        metrics::inc_handler_errors();
        error!(
            component = "httpd",
            event = "handler_error",
            server = %self.name,
            status = err.status_code(),
            error = %err,
            "handler chain failed"
        );

        if let Some(error_routes) = self.error_routes.clone() {
            match serve_error_routes(scope, error_routes, &err).await {
                Ok(response) => return response,
                Err(e) => {
                    error!(
                        component = "httpd",
                        event = "error_route_failed",
                        server = %self.name,
                        error = %e,
                        "error routes failed; writing default response"
                    );
                }
            }
        }

        default_error_response(&err)
    }
}

/// Serves error routes with a body-less request rebuilt from the recorded
/// request metadata; `http.error.*` placeholders carry the failure.
pub(crate) async fn serve_error_routes(
    scope: &Arc<RequestScope>,
    routes: Arc<[CompiledRoute]>,
    err: &HandlerError,
) -> Result<Response, HandlerError> {
    scope.set_error(err.status_code(), err.to_string());

    let info = scope.info();
    let mut builder = hyper::Request::builder().method(info.method.as_str()).uri(info.uri.clone());
    for (name, value) in info.headers.iter() {
        builder = builder.header(name, value);
    }
    let mut req = builder
        .body(empty_request_body())
        .map_err(|e| anyhow::anyhow!("rebuilding request for error routes: {e}"))?;
    req.extensions_mut().insert(scope.clone());

    serve_routes(routes, req).await
}

/// The minimal response written when no error route produces one.
pub(crate) fn default_error_response(err: &HandlerError) -> Response {
    let status = hyper::StatusCode::from_u16(err.status_code())
        .unwrap_or(hyper::StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = hyper::Response::new(empty_body());
    *response.status_mut() = status;
    response
}

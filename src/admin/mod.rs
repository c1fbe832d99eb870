// Package admin provides the administration endpoint: config load and
// stop, traversal over the live config tree, and the metrics page. The
// endpoint is part of a config generation and is replaced with it.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use hyper_util::service::TowerToHyperService;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{AdminConfig, DEFAULT_ADMIN_LISTEN};
use crate::context::Context;
use crate::listeners::{self, Network};
use crate::metrics;
use crate::orchestrator;

pub mod traverse;


/// A structured admin failure; always rendered as `{"error": "..."}`.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),
}

impl AdminError {
    fn status(&self) -> StatusCode {
        match self {
            AdminError::NotFound(_) => StatusCode::NOT_FOUND,
            AdminError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AdminError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}

#[derive(Clone)]
struct AdminState {
    /// Host values this endpoint answers to; empty for unix sockets.
    allowed_hosts: Arc<HashSet<String>>,
    /// Origin values allowed to mutate; checked when present.
    allowed_origins: Arc<HashSet<String>>,
    enforce_origin: bool,
    /// Unix-socket binds skip host and origin enforcement.
    unix: bool,
}

/// A running admin endpoint.
pub struct AdminHandle {
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    addr: Option<std::net::SocketAddr>,
}

impl AdminHandle {
    /// The bound TCP address, when the bind was TCP.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.addr
    }

    /// Stops accepting and waits for in-flight admin requests (including
    /// the one that triggered the swap) to finish.
    pub async fn stop(&self) {
        self.token.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Binds and serves the admin endpoint for one config generation.
/// Returns None when the config disables it.
///
/// Boxed explicitly (rather than left as a plain `async fn`) so the
/// compiler doesn't need to structurally expand this future's type while
/// checking `load_endpoint`, which itself reaches back into this
/// function's call graph through `orchestrator::load`.
pub fn serve<'a>(
    cfg: Option<AdminConfig>,
    ctx: &'a Context,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Option<AdminHandle>>> + Send + 'a>>
{
    Box::pin(serve_inner(cfg, ctx))
}

async fn serve_inner(cfg: Option<AdminConfig>, ctx: &Context) -> Result<Option<AdminHandle>> {
    let cfg = cfg.unwrap_or_default();
    if cfg.disabled {
        info!(
            component = "admin",
            event = "disabled",
            "admin endpoint disabled by config"
        );
        return Ok(None);
    }

    let listen = cfg
        .listen
        .clone()
        .unwrap_or_else(|| DEFAULT_ADMIN_LISTEN.to_string());
    let addr = listeners::parse_listen_addr(&listen)?;
    let specs = addr.expand();
    let spec = specs
        .first()
        .ok_or_else(|| anyhow::anyhow!("admin listen address {listen:?} resolves to nothing"))?;
    let listener = listeners::bind_or_adopt(spec).await?;

    let unix = spec.network == Network::Unix;
    let local = listener.local_addr();
    let state = AdminState {
        allowed_hosts: Arc::new(allowed_hosts(&listen, local)),
        allowed_origins: Arc::new(cfg.origins.iter().flatten().cloned().collect()),
        enforce_origin: cfg.enforce_origin,
        unix,
    };

    let router = Router::new()
        .route("/load", post(load_endpoint))
        .route("/stop", post(stop_endpoint))
        .route("/config", any(config_endpoint))
        .route("/config/", any(config_endpoint))
        .route("/config/*path", any(config_endpoint))
        .route("/metrics", get(metrics_endpoint))
        .fallback(unknown_endpoint)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            check_identity,
        ))
        .layer(tower_http::timeout::TimeoutLayer::new(
            std::time::Duration::from_secs(30),
        ))
        .with_state(state);

    let token = ctx.cancellation().child_token();
    let loop_token = token.clone();
    let task = tokio::spawn(async move {
        let builder = auto::Builder::new(TokioExecutor::new());
        let graceful = GracefulShutdown::new();
        let service = TowerToHyperService::new(router);

        loop {
            tokio::select! {
                _ = loop_token.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(
                                component = "admin",
                                event = "accept_failed",
                                error = %e,
                                "accept failed"
                            );
                            continue;
                        }
                    };
                    let conn = builder
                        .serve_connection_with_upgrades(TokioIo::new(stream), service.clone())
                        .into_owned();
                    let watched = graceful.watch(conn);
                    tokio::spawn(async move {
                        let _ = watched.await;
                    });
                }
            }
        }

        // Wait for in-flight admin requests; the request that replaced
        // this generation finishes its response here.
        graceful.shutdown().await;
        info!(
            component = "admin",
            event = "stopped",
            "admin endpoint retired"
        );
    });

    info!(
        component = "admin",
        event = "started",
        listen = %listen,
        "admin endpoint serving"
    );

    Ok(Some(AdminHandle {
        token,
        task: Mutex::new(Some(task)),
        addr: local,
    }))
}

/// Host values this endpoint considers its own identity.
fn allowed_hosts(listen: &str, local: Option<std::net::SocketAddr>) -> HashSet<String> {
    let mut hosts = HashSet::new();
    hosts.insert(listen.to_string());
    if let Some(addr) = local {
        let port = addr.port();
        hosts.insert(format!("localhost:{port}"));
        hosts.insert(format!("127.0.0.1:{port}"));
        hosts.insert(format!("[::1]:{port}"));
        hosts.insert(addr.to_string());
    }
    hosts
}

/// Rejects cross-site requests: the Host header must name this endpoint
/// and, when an Origin is present (or enforcement is on), it must be an
/// allowed origin. Unix-socket binds accept everything, including an
/// empty Host.
async fn check_identity(
    State(state): State<AdminState>,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    if state.unix {
        return next.run(request).await;
    }

    let host = request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if !host.is_empty() && !state.allowed_hosts.contains(&host) {
        return AdminError::BadRequest(format!("host not allowed: {host:?}")).into_response();
    }

    let origin = request
        .headers()
        .get(axum::http::header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    match origin {
        Some(origin) => {
            let bare = origin
                .trim_start_matches("http://")
                .trim_start_matches("https://")
                .to_string();
            let allowed = state.allowed_origins.contains(&origin)
                || state.allowed_origins.contains(&bare)
                || state.allowed_hosts.contains(&bare);
            if !allowed {
                return AdminError::BadRequest(format!("origin not allowed: {origin:?}"))
                    .into_response();
            }
        }
        None if state.enforce_origin => {
            return AdminError::BadRequest("Origin header required".to_string()).into_response();
        }
        None => {}
    }

    next.run(request).await
}

/// `POST /load`: replace the whole config document.
async fn load_endpoint(body: Bytes) -> Result<StatusCode, AdminError> {
    orchestrator::load(&body, false)
        .await
        .map_err(|e| AdminError::BadRequest(e.to_string()))?;
    Ok(StatusCode::OK)
}

/// `POST /stop`: retire the config and exit once the reply is written.
async fn stop_endpoint() -> StatusCode {
    info!(
        component = "admin",
        event = "stop_requested",
        "unloading and exiting"
    );
    tokio::spawn(async {
        // Give the response a moment to flush before the process ends.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let _ = orchestrator::unload().await;
        std::process::exit(0);
    });
    StatusCode::OK
}

/// Any verb on `/config{/path}`: traversal over the live config tree.
/// Mutations stage a whole new document and run full load semantics.
async fn config_endpoint(
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Result<Response, AdminError> {
    let path = uri
        .path()
        .strip_prefix("/config")
        .unwrap_or_default()
        .trim_matches('/');
    let segments: Vec<String> = if path.is_empty() {
        Vec::new()
    } else {
        path.split('/').map(str::to_string).collect()
    };

    if method == Method::GET {
        let doc = orchestrator::current_value().unwrap_or_else(|| serde_json::json!({}));
        let node = traverse::get(&doc, &segments)?;
        return Ok(Json(node.clone()).into_response());
    }

    let verb = traverse::Verb::from_method(&method)
        .ok_or_else(|| AdminError::BadRequest(format!("unsupported method {method}")))?;
    let payload = if body.is_empty() {
        None
    } else {
        Some(
            serde_json::from_slice(&body)
                .map_err(|e| AdminError::BadRequest(format!("invalid JSON body: {e}")))?,
        )
    };

    let mut doc = orchestrator::current_value().unwrap_or_else(|| serde_json::json!({}));
    traverse::apply(&mut doc, &segments, verb, payload)?;

    let bytes = serde_json::to_vec(&doc)
        .map_err(|e| AdminError::Internal(format!("serializing config: {e}")))?;
    orchestrator::load(&bytes, false)
        .await
        .map_err(|e| AdminError::BadRequest(e.to_string()))?;

    Ok(StatusCode::OK.into_response())
}

async fn unknown_endpoint(uri: Uri) -> AdminError {
    AdminError::NotFound(format!("unknown admin endpoint {:?}", uri.path()))
}

async fn metrics_endpoint() -> Response {
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render_prometheus(),
    )
        .into_response()
}

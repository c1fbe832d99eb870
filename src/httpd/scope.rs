// Per-request state: the replacer, the vars map and the bookkeeping the
// routing engine needs. One scope is created per request and owned by the
// request's task; it travels in the request extensions.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use hyper::header::HOST;
use hyper::HeaderMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde_json::Value;

use crate::httpd::handlers::headers::DeferredOps;
use crate::replacer::{format_duration, Replacer};

/// Snapshot of the request visible to placeholders and error routes.
/// Refreshed by the dispatcher on every routing pass so rewrites are
/// observable.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub method: String,
    pub uri: String,
    pub path: String,
    pub query: String,
    pub host: String,
    pub port: String,
    pub scheme: String,
    pub proto: String,
    pub headers: HeaderMap,
    pub remote: Option<SocketAddr>,
}

impl RequestInfo {
    pub fn capture<B>(req: &hyper::Request<B>, remote: Option<SocketAddr>) -> Self {
        let uri = req.uri();
        let hostport = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| uri.authority().map(|a| a.to_string()))
            .unwrap_or_default();
        let (host, port) = match hostport.rsplit_once(':') {
            Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) => {
                (h.to_string(), p.to_string())
            }
            _ => (hostport.clone(), String::new()),
        };

        Self {
            method: req.method().to_string(),
            uri: uri.to_string(),
            path: uri.path().to_string(),
            query: uri.query().unwrap_or_default().to_string(),
            host,
            port,
            scheme: uri.scheme_str().unwrap_or("http").to_string(),
            proto: format!("{:?}", req.version()),
            headers: req.headers().clone(),
            remote,
        }
    }

    fn hostport(&self) -> String {
        if self.port.is_empty() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Everything the pipeline attaches to one request.
pub struct RequestScope {
    /// When the request entered the server; `{http.request.duration}`
    /// reads the elapsed time.
    started: Instant,
    info: Mutex<RequestInfo>,
    vars: Mutex<HashMap<String, Value>>,
    /// Route groups that already ran for this request.
    pub(crate) groups: Mutex<HashSet<String>>,
    /// Response-header operations deferred until the response surfaces.
    pub(crate) deferred: Mutex<Vec<DeferredOps>>,
    extra_log_fields: Mutex<Vec<(String, String)>>,
    error: Mutex<Option<(u16, String)>>,
    /// Set once the response surfaces, for `http.response.header.*`.
    response_headers: Mutex<Option<HeaderMap>>,
    replacer: OnceCell<Replacer>,
}

impl RequestScope {
    /// Builds the scope and wires its replacer: globals first, then the
    /// request-bound provider backed by this scope.
    pub fn new(info: RequestInfo) -> Arc<Self> {
        let scope = Arc::new(Self {
            started: Instant::now(),
            info: Mutex::new(info),
            vars: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashSet::new()),
            deferred: Mutex::new(Vec::new()),
            extra_log_fields: Mutex::new(Vec::new()),
            error: Mutex::new(None),
            response_headers: Mutex::new(None),
            replacer: OnceCell::new(),
        });

        let mut replacer = Replacer::with_globals();
        let weak = Arc::downgrade(&scope);
        replacer.add_provider(move |key| weak.upgrade().and_then(|s| s.resolve(key)));
        let _ = scope.replacer.set(replacer);
        scope
    }

    pub fn replacer(&self) -> &Replacer {
        self.replacer.get().expect("replacer wired at construction")
    }

    pub fn info(&self) -> RequestInfo {
        self.info.lock().clone()
    }

    /// Refreshes the request snapshot after a mutation (rewrite,
    /// rehandle pass). The remote address and scheme survive from the
    /// original capture.
    pub fn refresh<B>(&self, req: &hyper::Request<B>) {
        let mut guard = self.info.lock();
        let remote = guard.remote;
        let scheme = guard.scheme.clone();
        let mut fresh = RequestInfo::capture(req, remote);
        fresh.scheme = scheme;
        *guard = fresh;
    }

    pub fn set_var(&self, key: impl Into<String>, value: Value) {
        self.vars.lock().insert(key.into(), value);
    }

    pub fn get_var(&self, key: &str) -> Option<Value> {
        self.vars.lock().get(key).cloned()
    }

    pub fn set_error(&self, code: u16, message: impl Into<String>) {
        *self.error.lock() = Some((code, message.into()));
    }

    pub fn set_response_headers(&self, headers: HeaderMap) {
        *self.response_headers.lock() = Some(headers);
    }

    pub fn add_log_field(&self, key: impl Into<String>, value: impl Into<String>) {
        self.extra_log_fields.lock().push((key.into(), value.into()));
    }

    pub fn take_log_fields(&self) -> Vec<(String, String)> {
        std::mem::take(&mut *self.extra_log_fields.lock())
    }

    /// The request-bound placeholder provider.
    fn resolve(&self, key: &str) -> Option<Value> {
        if let Some(var) = key.strip_prefix("http.vars.") {
            return self.get_var(var);
        }
        if key.starts_with("http.auth.user.") {
            return self.get_var(key);
        }
        if let Some(field) = key.strip_prefix("http.response.header.") {
            return self
                .response_headers
                .lock()
                .as_ref()
                .and_then(|h| h.get(field.to_ascii_lowercase()))
                .and_then(|v| v.to_str().ok())
                .map(|v| Value::String(v.to_string()));
        }
        if let Some(field) = key.strip_prefix("http.error.") {
            let err = self.error.lock().clone()?;
            return match field {
                "status_code" => Some(Value::String(err.0.to_string())),
                "message" => Some(Value::String(err.1)),
                _ => None,
            };
        }

        let rest = key.strip_prefix("http.request.")?;
        let info = self.info.lock();
        let v = match rest {
            "host" => info.host.clone(),
            "hostport" => info.hostport(),
            "port" => info.port.clone(),
            "method" => info.method.clone(),
            "scheme" => info.scheme.clone(),
            "proto" => info.proto.clone(),
            "uri" => info.uri.clone(),
            "uri.path" => info.path.clone(),
            "uri.query" => info.query.clone(),
            "duration" => format_duration(self.started.elapsed()),
            "remote" => info.remote.map(|a| a.to_string()).unwrap_or_default(),
            "remote.host" => info.remote.map(|a| a.ip().to_string()).unwrap_or_default(),
            "remote.port" => info.remote.map(|a| a.port().to_string()).unwrap_or_default(),
            other => {
                if let Some(param) = other.strip_prefix("uri.query.") {
                    query_param(&info.query, param)?
                } else if let Some(field) = other.strip_prefix("header.") {
                    info.headers
                        .get(field.to_ascii_lowercase())
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string)?
                } else {
                    return None;
                }
            }
        };
        Some(Value::String(v))
    }
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        let k = urlencoding::decode(k).ok()?;
        if k == name {
            Some(urlencoding::decode(v).map(|s| s.into_owned()).unwrap_or_default())
        } else {
            None
        }
    })
}

/// Fetches the scope installed in a request's extensions.
pub fn scope_of<B>(req: &hyper::Request<B>) -> Option<Arc<RequestScope>> {
    req.extensions().get::<Arc<RequestScope>>().cloned()
}

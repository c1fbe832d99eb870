// Package httpd provides the HTTP app: servers, the routing and
// middleware engine, standard matchers and the built-in handlers.

use std::convert::Infallible;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};

pub mod app;
pub mod handlers;
pub mod matchers;
pub mod routes;
pub mod scope;
pub mod server;

#[cfg(test)]
mod matchers_test;

pub use app::HttpApp;
pub use routes::{Next, RouteConfig};
pub use scope::{scope_of, RequestInfo, RequestScope};
pub use server::{Server, ServerConfig};

/// Body of an in-flight request as handlers see it.
pub type RequestBody = BoxBody<Bytes, hyper::Error>;
/// Body handlers produce.
pub type ResponseBody = BoxBody<Bytes, Infallible>;

pub type Request = hyper::Request<RequestBody>;
pub type Response = hyper::Response<ResponseBody>;

pub fn empty_body() -> ResponseBody {
    Empty::<Bytes>::new()
        .map_err(|never: Infallible| match never {})
        .boxed()
}

pub fn full_body(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into())
        .map_err(|never: Infallible| match never {})
        .boxed()
}

pub fn empty_request_body() -> RequestBody {
    Empty::<Bytes>::new()
        .map_err(|never: Infallible| match never {})
        .boxed()
}

/// Runtime error from a handler chain.
///
/// `Rehandle` is the sentinel a handler returns to restart routing from
/// the top with the (possibly mutated) request it carries; the server
/// dispatcher bounds the loop.
#[derive(thiserror::Error)]
pub enum HandlerError {
    /// An error with an HTTP status hint for the client.
    #[error("{message}")]
    Status { code: u16, message: String },

    #[error("rehandle requested")]
    Rehandle(Request),

    #[error("rehandle limit exceeded after {0} passes")]
    RehandleLoop(u32),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: message.into(),
        }
    }

    /// The HTTP status this error maps to; 500 unless hinted otherwise.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Status { code, .. } => *code,
            _ => 500,
        }
    }
}

impl std::fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status { code, message } => {
                write!(f, "Status({code}, {message:?})")
            }
            Self::Rehandle(_) => write!(f, "Rehandle(..)"),
            Self::RehandleLoop(n) => write!(f, "RehandleLoop({n})"),
            Self::Other(e) => write!(f, "Other({e:?})"),
        }
    }
}

/// A request handler. Middleware handlers call `next.serve` to continue
/// the chain; terminal handlers produce a response and never do.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    async fn serve(&self, req: Request, next: Next) -> Result<Response, HandlerError>;
}

/// Decides whether a route applies to a request. A matcher that fails
/// internally must treat the failure as a non-match (and may log it).
pub trait RequestMatcher: Send + Sync {
    fn matches(&self, req: &Request) -> bool;
}

// Package listeners provides the listen-address grammar and the
// process-wide socket map that lets a new config generation adopt sockets
// still held by the outgoing one, so a reload never closes a retained
// listener.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context as TaskContext, Poll};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info};

#[cfg(test)]
mod listeners_test;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("invalid listen address {addr:?}: {reason}")]
    Parse { addr: String, reason: String },

    #[error("binding {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("listen address {addr:?} is not supported on this platform")]
    Unsupported { addr: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Unix,
    Fd,
}

impl Network {
    fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Unix => "unix",
            Network::Fd => "fd",
        }
    }
}

/// A parsed listen address, possibly covering a port range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    pub network: Network,
    /// TCP host part; empty means all interfaces.
    pub host: String,
    pub start_port: u16,
    pub end_port: u16,
    /// Unix socket path or inherited file-descriptor number.
    pub path: String,
}

impl NetworkAddress {
    /// Expands a port range into one socket spec per port.
    pub fn expand(&self) -> Vec<SocketSpec> {
        match self.network {
            Network::Tcp => (self.start_port..=self.end_port)
                .map(|port| {
                    let host = if self.host.is_empty() { "0.0.0.0" } else { &self.host };
                    SocketSpec {
                        network: Network::Tcp,
                        address: format!("{host}:{port}"),
                    }
                })
                .collect(),
            _ => vec![SocketSpec {
                network: self.network,
                address: self.path.clone(),
            }],
        }
    }
}

/// One concrete socket to open or adopt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketSpec {
    pub network: Network,
    pub address: String,
}

impl SocketSpec {
    /// Map key identifying this socket across config generations.
    pub fn key(&self) -> String {
        format!("{}/{}", self.network.as_str(), self.address)
    }
}

/// Parses one listen address.
///
/// Supported forms: `:8080`, `127.0.0.1:8080`, `localhost:8080`,
/// `:8080-8085` (port range), `unix/<path>`, `fd/<n>`.
pub fn parse_listen_addr(addr: &str) -> Result<NetworkAddress, ListenerError> {
    let parse_err = |reason: &str| ListenerError::Parse {
        addr: addr.to_string(),
        reason: reason.to_string(),
    };

    if let Some(path) = addr.strip_prefix("unix/") {
        if path.is_empty() {
            return Err(parse_err("empty unix socket path"));
        }
        return Ok(NetworkAddress {
            network: Network::Unix,
            host: String::new(),
            start_port: 0,
            end_port: 0,
            path: path.to_string(),
        });
    }

    if let Some(fd) = addr.strip_prefix("fd/") {
        fd.parse::<u32>().map_err(|_| parse_err("file descriptor must be a non-negative integer"))?;
        return Ok(NetworkAddress {
            network: Network::Fd,
            host: String::new(),
            start_port: 0,
            end_port: 0,
            path: fd.to_string(),
        });
    }

    let (host, port_part) = addr
        .rsplit_once(':')
        .ok_or_else(|| parse_err("missing port"))?;

    let (start, end) = match port_part.split_once('-') {
        Some((lo, hi)) => {
            let lo = lo.parse::<u16>().map_err(|_| parse_err("invalid port"))?;
            let hi = hi.parse::<u16>().map_err(|_| parse_err("invalid port"))?;
            if hi < lo {
                return Err(parse_err("port range end precedes start"));
            }
            (lo, hi)
        }
        None => {
            let p = port_part.parse::<u16>().map_err(|_| parse_err("invalid port"))?;
            (p, p)
        }
    };

    Ok(NetworkAddress {
        network: Network::Tcp,
        host: host.to_string(),
        start_port: start,
        end_port: end,
        path: String::new(),
    })
}

/// A bound or adopted listener.
#[derive(Clone)]
pub enum AnyListener {
    Tcp(Arc<TcpListener>),
    #[cfg(unix)]
    Unix(Arc<UnixListener>),
}

impl AnyListener {
    pub async fn accept(&self) -> io::Result<(AnyStream, Option<std::net::SocketAddr>)> {
        match self {
            AnyListener::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                stream.set_nodelay(true).ok();
                Ok((AnyStream::Tcp(stream), Some(peer)))
            }
            #[cfg(unix)]
            AnyListener::Unix(l) => {
                let (stream, _) = l.accept().await?;
                Ok((AnyStream::Unix(stream), None))
            }
        }
    }

    /// The locally bound address, when the OS can report one.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match self {
            AnyListener::Tcp(l) => l.local_addr().ok(),
            #[cfg(unix)]
            AnyListener::Unix(_) => None,
        }
    }
}

/// An accepted connection from either family.
pub enum AnyStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for AnyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AnyStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            AnyStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AnyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            AnyStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            AnyStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AnyStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            AnyStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AnyStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            AnyStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Wraps an accepted stream with a per-read inactivity deadline; a read
/// that sits idle past the deadline fails with `TimedOut` and hyper
/// closes the connection.
pub struct TimedStream {
    inner: AnyStream,
    read_timeout: Option<std::time::Duration>,
    deadline: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl TimedStream {
    pub fn new(inner: AnyStream, read_timeout: Option<std::time::Duration>) -> Self {
        Self {
            inner,
            read_timeout,
            deadline: None,
        }
    }
}

impl AsyncRead for TimedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                let Some(timeout) = this.read_timeout else {
                    return Poll::Pending;
                };
                let deadline = this
                    .deadline
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
                match deadline.as_mut().poll(cx) {
                    Poll::Ready(()) => Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "read timed out",
                    ))),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

impl AsyncWrite for TimedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

enum WeakListener {
    Tcp(Weak<TcpListener>),
    #[cfg(unix)]
    Unix(Weak<UnixListener>),
}

impl WeakListener {
    fn upgrade(&self) -> Option<AnyListener> {
        match self {
            WeakListener::Tcp(w) => w.upgrade().map(AnyListener::Tcp),
            #[cfg(unix)]
            WeakListener::Unix(w) => w.upgrade().map(AnyListener::Unix),
        }
    }
}

/// Sockets currently alive in this process, keyed by [`SocketSpec::key`].
/// Entries are weak: a socket retained only by a cancelled generation
/// disappears once that generation drops it.
static ACTIVE: Lazy<Mutex<HashMap<String, WeakListener>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Returns the socket for `spec`, adopting the live one if any config
/// generation still holds it, binding a fresh one otherwise.
pub async fn bind_or_adopt(spec: &SocketSpec) -> Result<AnyListener, ListenerError> {
    let key = spec.key();

    if let Some(existing) = ACTIVE.lock().get(&key).and_then(WeakListener::upgrade) {
        debug!(
            component = "listeners",
            event = "adopted",
            key = %key,
            "reusing live socket across generations"
        );
        return Ok(existing);
    }

    let listener = match spec.network {
        Network::Tcp => {
            let l = TcpListener::bind(&spec.address)
                .await
                .map_err(|source| ListenerError::Bind {
                    addr: spec.address.clone(),
                    source,
                })?;
            AnyListener::Tcp(Arc::new(l))
        }
        #[cfg(unix)]
        Network::Unix => {
            // A stale socket file from a previous process blocks the bind.
            let _ = std::fs::remove_file(&spec.address);
            let l = UnixListener::bind(&spec.address).map_err(|source| ListenerError::Bind {
                addr: spec.address.clone(),
                source,
            })?;
            AnyListener::Unix(Arc::new(l))
        }
        #[cfg(not(unix))]
        Network::Unix => {
            return Err(ListenerError::Unsupported {
                addr: spec.address.clone(),
            })
        }
        #[cfg(unix)]
        Network::Fd => {
            use std::os::fd::FromRawFd;
            let fd: i32 = spec.address.parse().map_err(|_| ListenerError::Parse {
                addr: spec.address.clone(),
                reason: "invalid file descriptor".to_string(),
            })?;
            // Inherited from the parent process per the socket-activation
            // contract; the descriptor must be a listening TCP socket.
            let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
            std_listener
                .set_nonblocking(true)
                .map_err(|source| ListenerError::Bind {
                    addr: spec.address.clone(),
                    source,
                })?;
            let l = TcpListener::from_std(std_listener).map_err(|source| ListenerError::Bind {
                addr: spec.address.clone(),
                source,
            })?;
            AnyListener::Tcp(Arc::new(l))
        }
        #[cfg(not(unix))]
        Network::Fd => {
            return Err(ListenerError::Unsupported {
                addr: spec.address.clone(),
            })
        }
    };

    let weak = match &listener {
        AnyListener::Tcp(l) => WeakListener::Tcp(Arc::downgrade(l)),
        #[cfg(unix)]
        AnyListener::Unix(l) => WeakListener::Unix(Arc::downgrade(l)),
    };
    ACTIVE.lock().insert(key.clone(), weak);

    info!(
        component = "listeners",
        event = "bound",
        key = %key,
        "socket opened"
    );
    Ok(listener)
}

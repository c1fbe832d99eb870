// Boots a configuration through the orchestrator and exposes the
// ephemeral addresses it landed on.

use std::net::SocketAddr;

use tokio::sync::MutexGuard;

use super::lock;
use crate::httpd::HttpApp;
use crate::orchestrator;

pub struct TestServer {
    _guard: MutexGuard<'static, ()>,
}

/// Loads `config` as the running config. An `admin` section listening on
/// an ephemeral port is injected when the config has none, so tests
/// never collide on the default admin port.
pub async fn start(mut config: serde_json::Value) -> TestServer {
    let guard = lock::acquire().await;

    // Let a previous test's generation finish retiring before adopting
    // its sockets.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let dir = std::env::temp_dir().join(format!("trellis-autosave-{}", std::process::id()));
    std::env::set_var("TRELLIS_CONFIG_DIR", &dir);

    if config.get("admin").is_none() {
        config["admin"] = serde_json::json!({"listen": ":0"});
    }

    let bytes = serde_json::to_vec(&config).expect("serializing test config");
    orchestrator::load(&bytes, true)
        .await
        .expect("test config loads");

    TestServer { _guard: guard }
}

impl TestServer {
    /// Loopback address of a named server's first listener.
    pub fn http_addr(&self, server: &str) -> SocketAddr {
        let app = orchestrator::current_app("http").expect("http app running");
        let app = app
            .as_any()
            .downcast_ref::<HttpApp>()
            .expect("http app concrete type");
        let addr = app
            .server(server)
            .unwrap_or_else(|| panic!("server {server:?} not found"))
            .local_addrs()
            .first()
            .copied()
            .expect("server bound at least one listener");
        loopback(addr)
    }

    /// Loopback address of the admin endpoint.
    pub fn admin_addr(&self) -> SocketAddr {
        loopback(orchestrator::current_admin_addr().expect("admin endpoint running"))
    }

    /// Retires the config; the global lock releases when the harness
    /// drops.
    pub async fn stop(self) {
        let _ = orchestrator::unload().await;
    }
}

fn loopback(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new([127, 0, 0, 1].into(), addr.port())
}

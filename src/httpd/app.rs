// The `http` app: a named set of servers provisioned from one config
// generation and started together.

use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::context::Context;
use crate::httpd::server::{Server, ServerConfig};
use crate::module::{App, ConfigError, Module};
use crate::register_module;

#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpApp {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,

    #[serde(skip)]
    runtime: OnceCell<Runtime>,
}

struct Runtime {
    servers: Vec<Arc<Server>>,
    token: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl HttpApp {
    /// The compiled server for a name; used by harnesses to discover
    /// ephemeral listen addresses.
    pub fn server(&self, name: &str) -> Option<Arc<Server>> {
        let runtime = self.runtime.get()?;
        runtime.servers.iter().find(|s| s.name == name).cloned()
    }
}

impl Module for HttpApp {
    fn provision(&mut self, ctx: &Context) -> Result<(), ConfigError> {
        let token = ctx.cancellation().child_token();
        let mut servers = Vec::with_capacity(self.servers.len());
        for (name, cfg) in &self.servers {
            let server = Server::compile(name, cfg.clone(), ctx, token.child_token())?;
            servers.push(server);
        }
        let _ = self.runtime.set(Runtime {
            servers,
            token,
            loops: Mutex::new(Vec::new()),
        });
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, cfg) in &self.servers {
            if cfg.listen.is_empty() {
                return Err(ConfigError::Validate {
                    module: "http".to_string(),
                    reason: format!("server {name:?} has no listen addresses"),
                });
            }
        }
        Ok(())
    }

    fn as_app(self: Arc<Self>) -> Option<Arc<dyn crate::module::App>> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl App for HttpApp {
    async fn start(&self) -> Result<(), ConfigError> {
        let runtime = self
            .runtime
            .get()
            .ok_or_else(|| anyhow::anyhow!("http app started before provisioning"))?;

        for server in &runtime.servers {
            let handles = server.run().await?;
            runtime.loops.lock().extend(handles);
        }

        info!(
            component = "httpd",
            event = "app_started",
            servers = runtime.servers.len(),
            "http app running"
        );
        Ok(())
    }

    async fn stop(&self) {
        let Some(runtime) = self.runtime.get() else {
            return;
        };
        runtime.token.cancel();

        let loops: Vec<JoinHandle<()>> = std::mem::take(&mut *runtime.loops.lock());
        for handle in loops {
            if let Err(e) = handle.await {
                error!(
                    component = "httpd",
                    event = "accept_loop_join_failed",
                    error = %e,
                    "accept loop did not shut down cleanly"
                );
            }
        }

        info!(
            component = "httpd",
            event = "app_stopped",
            "http app retired"
        );
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

register_module!("http", HttpApp);

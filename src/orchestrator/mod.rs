// Package orchestrator owns the configuration lifecycle: staging a new
// generation (decode, provision, validate, start), the atomic swap to it,
// retiring the old one, rollback on failure and autosave of the last
// good document.

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use once_cell::sync::Lazy;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::admin::{self, AdminHandle};
use crate::config::{self, Config};
use crate::context::Context;
use crate::metrics;
use crate::module::{App, ConfigError};

#[cfg(test)]
mod orchestrator_test;

/// One running configuration generation.
pub struct RunningConfig {
    value: Value,
    canonical: Vec<u8>,
    ctx: Context,
    /// Started apps in start order.
    apps: Vec<(String, Arc<dyn App>)>,
    admin: Option<AdminHandle>,
}

/// The current generation. Readers (request paths, admin GETs) never
/// block on a load in progress.
static CURRENT: Lazy<ArcSwapOption<RunningConfig>> = Lazy::new(ArcSwapOption::empty);

/// Serializes all load/unload calls; concurrent admin requests queue.
static LOAD_LOCK: Lazy<tokio::sync::Mutex<()>> = Lazy::new(|| tokio::sync::Mutex::new(()));

/// Installs the given JSON document as the running config.
///
/// When `force` is false and the document matches the current one, this
/// is a no-op. The new generation is fully provisioned, validated and
/// started before the old one is retired; on any error the staged
/// generation is cancelled, the old config keeps serving and the
/// autosave file is untouched.
pub async fn load(bytes: &[u8], force: bool) -> Result<(), ConfigError> {
    let _guard = LOAD_LOCK.lock().await;

    let (value, canonical) = config::canonicalize(bytes)?;

    if !force {
        if let Some(current) = CURRENT.load_full() {
            if current.canonical == canonical {
                info!(
                    component = "orchestrator",
                    event = "load_unchanged",
                    "config unchanged; nothing to do"
                );
                return Ok(());
            }
        }
    }

    let staged = match stage(value, canonical.clone()).await {
        Ok(staged) => staged,
        Err(e) => {
            metrics::inc_reload_failures();
            error!(
                component = "orchestrator",
                event = "load_failed",
                error = %e,
                "staged config rejected; previous config keeps serving"
            );
            return Err(e);
        }
    };

    let old = CURRENT.swap(Some(Arc::new(staged)));
    metrics::inc_reloads();
    info!(
        component = "orchestrator",
        event = "config_swapped",
        "new generation is current"
    );

    if let Some(old) = old {
        retire(old);
    }

    tokio::spawn(autosave(canonical));
    Ok(())
}

/// Gracefully retires the current config; afterwards no app is running.
pub async fn unload() -> Result<(), ConfigError> {
    let _guard = LOAD_LOCK.lock().await;
    if let Some(old) = CURRENT.swap(None) {
        info!(
            component = "orchestrator",
            event = "unloading",
            "retiring current config"
        );
        retire(old);
    }
    Ok(())
}

/// The canonical bytes of the live config, if any.
pub fn current_config() -> Option<Vec<u8>> {
    CURRENT.load().as_ref().map(|c| c.canonical.clone())
}

/// The live config as a JSON value; admin traversal reads this.
pub fn current_value() -> Option<Value> {
    CURRENT.load().as_ref().map(|c| c.value.clone())
}

/// Whether the given bytes differ from the live config (whitespace
/// insensitive).
pub fn changed(new_bytes: &[u8]) -> bool {
    match config::canonicalize(new_bytes) {
        Ok((_, canonical)) => current_config().as_deref() != Some(canonical.as_slice()),
        Err(_) => true,
    }
}

/// Looks up a started app of the current generation by name.
pub fn current_app(name: &str) -> Option<Arc<dyn App>> {
    CURRENT.load().as_ref().and_then(|c| c.ctx.app(name))
}

/// The bound address of the current admin endpoint, when it is TCP.
pub fn current_admin_addr() -> Option<std::net::SocketAddr> {
    CURRENT
        .load()
        .as_ref()
        .and_then(|c| c.admin.as_ref())
        .and_then(|a| a.local_addr())
}

/// Builds and starts a new generation. Everything happens under a fresh
/// context; any failure cancels it, which unwinds whatever was
/// provisioned so far in reverse order.
async fn stage(value: Value, canonical: Vec<u8>) -> Result<RunningConfig, ConfigError> {
    let cfg = Config::from_value(&value)?;
    let ctx = Context::new();

    match stage_inner(&cfg, &value, canonical, &ctx).await {
        Ok(running) => Ok(running),
        Err(e) => {
            ctx.cancel();
            Err(e)
        }
    }
}

async fn stage_inner(
    cfg: &Config,
    value: &Value,
    canonical: Vec<u8>,
    ctx: &Context,
) -> Result<RunningConfig, ConfigError> {
    let mut apps: Vec<(String, Arc<dyn App>)> = Vec::with_capacity(cfg.apps.len());
    for (name, fragment) in &cfg.apps {
        let module = ctx.load_module_id(name, fragment)?;
        let app = module.as_app().ok_or_else(|| ConfigError::Validate {
            module: name.clone(),
            reason: "top-level module is not an app".to_string(),
        })?;
        ctx.put_app(name.clone(), app.clone());
        apps.push((name.clone(), app));
    }

    let mut started: Vec<&(String, Arc<dyn App>)> = Vec::with_capacity(apps.len());
    for entry in &apps {
        if let Err(e) = entry.1.start().await {
            // Unwind the apps that did start before failing the stage.
            for (name, app) in started.into_iter().rev() {
                warn!(
                    component = "orchestrator",
                    event = "unwinding_app",
                    app = %name,
                    "stopping app after failed stage"
                );
                app.stop().await;
            }
            return Err(ConfigError::provision(entry.0.clone(), e));
        }
        started.push(entry);
    }

    let admin = admin::serve(cfg.admin.clone(), ctx)
        .await
        .map_err(|e| ConfigError::Other(e.into()))?;

    Ok(RunningConfig {
        value: value.clone(),
        canonical,
        ctx: ctx.clone(),
        apps,
        admin,
    })
}

/// Stops the old generation in the background: drain apps, then the
/// admin endpoint, then cancel the scope. The admin drain must not be
/// awaited inline because the load that retires a generation usually
/// arrives through that very admin endpoint.
fn retire(old: Arc<RunningConfig>) {
    tokio::spawn(async move {
        for (name, app) in old.apps.iter().rev() {
            info!(
                component = "orchestrator",
                event = "stopping_app",
                app = %name,
                "retiring app"
            );
            app.stop().await;
        }
        if let Some(admin) = &old.admin {
            admin.stop().await;
        }
        old.ctx.cancel();
        info!(
            component = "orchestrator",
            event = "generation_retired",
            "old generation cleaned up"
        );
    });
}

/// Where the last good config is persisted.
pub fn autosave_path() -> PathBuf {
    let base = std::env::var_os("TRELLIS_CONFIG_DIR")
        .map(PathBuf::from)
        .or_else(dirs::config_dir)
        .unwrap_or_else(std::env::temp_dir);
    base.join("trellis").join("autosave.json")
}

/// Persists the canonical document atomically (write-temp-then-rename).
async fn autosave(canonical: Vec<u8>) {
    let path = autosave_path();
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!(
                component = "orchestrator",
                event = "autosave_failed",
                error = %e,
                "cannot create autosave directory"
            );
            return;
        }
    }
    let tmp = path.with_extension("tmp");
    let result = async {
        tokio::fs::write(&tmp, &canonical).await?;
        tokio::fs::rename(&tmp, &path).await
    }
    .await;
    match result {
        Ok(()) => info!(
            component = "orchestrator",
            event = "autosaved",
            path = %path.display(),
            "last good config persisted"
        ),
        Err(e) => warn!(
            component = "orchestrator",
            event = "autosave_failed",
            error = %e,
            "cannot persist config"
        ),
    }
}

/// Boots from the autosave file. Returns false when none exists.
pub async fn resume() -> Result<bool, ConfigError> {
    let path = autosave_path();
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => {
            return Err(ConfigError::Other(anyhow::anyhow!(
                "reading autosave {}: {e}",
                path.display()
            )))
        }
    };
    info!(
        component = "orchestrator",
        event = "resuming",
        path = %path.display(),
        "loading last good config"
    );
    load(&bytes, false).await?;
    Ok(true)
}

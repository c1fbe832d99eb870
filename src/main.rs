// Main entrypoint for the Trellis server platform.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use trellis::orchestrator;
use trellis::shutdown::GracefulShutdown;

/// Exit codes shared with CLI front-ends.
const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_QUIT_FAILURE: i32 = 2;

/// Trellis - configuration-driven, hot-reloadable HTTP server platform
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server in the foreground
    Run {
        /// Initial JSON config file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Boot from the autosaved last good config
        #[arg(long)]
        resume: bool,

        /// TCP address to confirm a successful start to; the 32-byte
        /// nonce arriving on stdin is echoed back to it
        #[arg(long, value_name = "ADDR")]
        pingback: Option<String>,
    },
}

/// Configures structured logging. Production (TRELLIS_ENV=prod) gets
/// JSON, everything else a pretty console format.
fn configure_logger() {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if std::env::var("TRELLIS_ENV").as_deref() == Ok("prod") {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty())
            .init();
    }
}

fn main() {
    let args = Args::parse();
    configure_logger();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to create tokio runtime: {e}");
            std::process::exit(EXIT_FAILURE);
        }
    };

    let Command::Run {
        config,
        resume,
        pingback,
    } = args.command;

    let code = match runtime.block_on(run(config, resume, pingback)) {
        Ok(()) => EXIT_OK,
        Err(e) => {
            error!(
                component = "main",
                event = "fatal",
                error = %e,
                "exiting with failure"
            );
            if e.is::<trellis::shutdown::TimeoutError>() {
                EXIT_QUIT_FAILURE
            } else {
                EXIT_FAILURE
            }
        }
    };
    std::process::exit(code);
}

async fn run(
    config: Option<PathBuf>,
    resume: bool,
    pingback: Option<String>,
) -> Result<()> {
    let shutdown = GracefulShutdown::new(CancellationToken::new(), Duration::from_secs(60));

    let run_id = {
        use rand::RngCore;
        let mut id = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut id);
        hex::encode(id)
    };
    info!(
        component = "main",
        event = "starting",
        run_id = %run_id,
        num_cpus = num_cpus::get(),
        "platform starting"
    );

    // Install the initial configuration.
    if resume && orchestrator::resume().await? {
        info!(
            component = "main",
            event = "resumed",
            "booted from autosaved config"
        );
    } else if let Some(path) = &config {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading config from {path:?}"))?;
        orchestrator::load(&bytes, true)
            .await
            .with_context(|| format!("loading config from {path:?}"))?;
    } else {
        // No config: run with the bare admin endpoint so one can be
        // pushed over /load.
        orchestrator::load(b"{}", true)
            .await
            .context("starting with empty config")?;
    }

    if let Some(addr) = &pingback {
        if let Err(e) = send_pingback(addr).await {
            warn!(
                component = "main",
                event = "pingback_failed",
                error = %e,
                "parent handshake failed"
            );
        }
    }

    shutdown
        .run(async {
            if let Err(e) = orchestrator::unload().await {
                error!(
                    component = "main",
                    event = "unload_failed",
                    error = %e,
                    "config unload failed during shutdown"
                );
            }
        })
        .await
}

/// Confirms a successful start to the parent process: the 32-byte nonce
/// handed over on stdin is echoed to the pingback address.
async fn send_pingback(addr: &str) -> Result<()> {
    let mut nonce = [0u8; 32];
    tokio::io::stdin()
        .read_exact(&mut nonce)
        .await
        .context("reading pingback nonce from stdin")?;

    let mut conn = tokio::net::TcpStream::connect(addr)
        .await
        .with_context(|| format!("dialing pingback address {addr}"))?;
    conn.write_all(&nonce)
        .await
        .context("writing pingback nonce")?;
    conn.flush().await.ok();

    info!(
        component = "main",
        event = "pingback_sent",
        addr = %addr,
        nonce = %hex::encode(nonce),
        "start confirmed to parent"
    );
    Ok(())
}

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use rfc2217_proxy::{api, logging, Config, Manager, Registry, Server, Session, SessionHooks};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP acceptance port (overrides the PORT environment variable)
    #[arg(short, long)]
    port: Option<u16>,

    /// HTTP status API port (overrides API_PORT)
    #[arg(long)]
    api_port: Option<u16>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short, long)]
    threads: Option<usize>,
}

/// Session lifecycle logging, attached once at startup
struct LogHooks;

impl SessionHooks for LogHooks {
    fn on_start(&self, session: &Session) {
        info!(
            "session started: id={} device={}",
            session.id(),
            session.device_id()
        );
    }

    fn on_end(&self, session: &Session) {
        info!(
            "session ended: id={} device={} bytes_in={} bytes_out={}",
            session.id(),
            session.device_id(),
            session.bytes_in(),
            session.bytes_out()
        );
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::from_env();
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(api_port) = args.api_port {
        config.api_port = api_port;
    }

    logging::init(config.debug);

    info!(
        "RFC-2217 NAT proxy starting: port={} api_port={} keepalive={:?} idle_timeout={:?} debug={}",
        config.port, config.api_port, config.keepalive, config.idle_timeout, config.debug
    );

    let num_cpus = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    let worker_threads = args.threads.unwrap_or(num_cpus);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;
    rt.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    let config = Arc::new(config);
    let registry = Arc::new(Registry::new());
    let sessions = Arc::new(
        Manager::new(config.debug, config.idle_timeout).with_hooks(Arc::new(LogHooks)),
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    // A bind failure on the acceptance port is the only fatal startup
    // error; a missing API port just loses the status surface.
    let server = Server::bind(config.clone(), registry.clone(), sessions.clone()).await?;

    let api_task = match api::Server::bind(config.clone(), registry.clone(), sessions.clone()).await
    {
        Ok(api_server) => {
            let api_shutdown = shutdown.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = api_server.run(api_shutdown).await {
                    error!("API server error: {}", e);
                }
            }))
        }
        Err(e) => {
            error!("API server unavailable: {}", e);
            None
        }
    };

    server.run(shutdown.clone()).await?;

    if let Some(task) = api_task {
        let _ = task.await;
    }

    info!("RFC-2217 NAT proxy stopped");
    Ok(())
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

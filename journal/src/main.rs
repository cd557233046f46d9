use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use tokio::signal;

use journal::metrics;
use journal::{JournalEnvironment, ServerConfig};

/// Runs one journal node until it is interrupted.
#[derive(Parser, Debug)]
#[command(name = "journal-node", version)]
struct Args {
    /// Path of the node's toml config
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn start_metrics_server(addr: SocketAddr) {
    let make_svc = make_service_fn(|_| async {
        Ok::<_, hyper::Error>(service_fn(|_: Request<Body>| async {
            Ok::<_, hyper::Error>(Response::new(Body::from(metrics::gather_text())))
        }))
    });
    metrics::init_registry();
    let server = hyper::Server::bind(&addr).serve(make_svc);
    tokio::spawn(async move {
        if let Err(e) = server.await {
            log::error!("metrics server stopped: {}", e);
        }
    });
    log::info!("metrics server started on {}", addr);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();
    let config = ServerConfig::from_toml(&args.config)
        .with_context(|| format!("loading {}", args.config))?;

    if let Some(addr) = &config.metrics_addr {
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid metrics address {}", addr))?;
        start_metrics_server(addr);
    }

    let environment = JournalEnvironment::new(config.node, config.journal);
    environment.setup().await?;
    log::info!(
        "{} is ready as {} with segments {:?}",
        environment.label(),
        environment.role()?,
        environment.segment_indexes()?
    );

    shutdown_signal().await;
    environment.close().await;
    Ok(())
}

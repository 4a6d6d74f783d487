//! `skiffd`, the skiff storage server daemon.
//!
//! Serves both the object and the kv protocol on one TCP port, using the
//! backends named in the configuration.
//!
//! ```text
//! skiffd                       # port 4711, config from the lookup chain
//! skiffd --port 5000           # explicit port
//! skiffd --config skiff.toml   # explicit configuration file
//! skiffd --daemon              # detach into the background
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use skiff_client::Configuration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "skiffd", version, about = "skiff storage server daemon")]
struct Cli {
    /// Port to listen on.
    #[arg(short, long, default_value_t = 4711)]
    port: u16,

    /// Detach from the terminal and run in the background.
    #[arg(short, long)]
    daemon: bool,

    /// Configuration file; defaults to the usual lookup chain
    /// ($SKIFF_CONFIG, then the XDG directories).
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // A dying client must surface as a write error, not kill the daemon.
    // SAFETY: installing SIG_IGN for SIGPIPE has no preconditions.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    if cli.daemon {
        // SAFETY: called before the tokio runtime exists, so the fork in
        // daemon(3) does not orphan any threads.
        let rc = unsafe { libc::daemon(0, 0) };
        if rc != 0 {
            bail!("failed to daemonize: {}", std::io::Error::last_os_error());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?
        .block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let configuration = match &cli.config {
        Some(path) => Configuration::from_file(path),
        None => Configuration::load(),
    }
    .context("failed to load configuration")?;

    let object_section = configuration.object();
    let kv_section = configuration.kv();
    info!(
        port = cli.port,
        object_backend = %object_section.backend,
        object_path = %object_section.path.display(),
        kv_backend = %kv_section.backend,
        kv_path = %kv_section.path.display(),
        "starting skiffd"
    );

    if object_section.component == skiff_client::Component::Client {
        warn!("object component is \"client\"; clients will bypass this daemon for objects");
    }
    if kv_section.component == skiff_client::Component::Client {
        warn!("kv component is \"client\"; clients will bypass this daemon for kv");
    }

    let object_backend = skiff_backend::object_backend(
        &object_section.backend,
        &object_section.path,
    )
    .context("failed to initialize object backend")?;
    let kv_backend = skiff_backend::kv_backend(&kv_section.backend, &kv_section.path)
        .context("failed to initialize kv backend")?;

    let server = skiff_server::Server::bind(("0.0.0.0", cli.port), object_backend, kv_backend)
        .await
        .context("failed to bind listener")?;

    server
        .serve(shutdown_signal())
        .await
        .context("server failed")?;
    Ok(())
}

/// Resolve on SIGINT, SIGTERM, SIGQUIT, or SIGHUP.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut quit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");
    let mut hangup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");

    tokio::select! {
        _ = interrupt.recv() => info!("received SIGINT, shutting down"),
        _ = terminate.recv() => info!("received SIGTERM, shutting down"),
        _ = quit.recv() => info!("received SIGQUIT, shutting down"),
        _ = hangup.recv() => info!("received SIGHUP, shutting down"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C handler");
    info!("received CTRL+C, shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_port() {
        let cli = Cli::try_parse_from(["skiffd"]).unwrap();
        assert_eq!(cli.port, 4711);
        assert!(!cli.daemon);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_flags_parse() {
        let cli =
            Cli::try_parse_from(["skiffd", "--port", "5000", "--daemon", "-c", "alt.toml"]).unwrap();
        assert_eq!(cli.port, 5000);
        assert!(cli.daemon);
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("alt.toml")));
    }
}

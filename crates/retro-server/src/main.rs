use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

use retro_server::config::ServerConfig;
use retro_server::state::ServerState;
use retro_server::{server, tls};

/// Server side of an end-to-end encrypted terminal messenger: a TLS
/// chat relay, a TLS file relay, and a cleartext audio relay sharing
/// one process-wide Directory.
#[derive(Parser)]
#[command(name = "retro-server", version, about)]
struct Args {
    /// Directory holding config.txt, certs/, users/, uploads/, msg/ and server.db
    #[arg(short = 'c', long = "config-dir", default_value = ".")]
    config_dir: PathBuf,

    /// Generate a new registration key, write its hex encoding to PATH,
    /// record it in server.db, then exit without starting the server.
    #[arg(short = 'R', long = "gen-regkey", value_name = "PATH")]
    gen_regkey: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let args = Args::parse();

    let config = ServerConfig::load(&args.config_dir)
        .with_context(|| format!("failed to load config from {}", args.config_dir.display()))?;

    init_logging(&config);

    if let Some(path) = args.gen_regkey {
        return gen_regkey(&config, &path);
    }

    run_server(config).await
}

/// Installs a `tracing` subscriber filtered by `RUST_LOG` if set, else
/// by the configured `loglevel`, writing to `logfile` when configured
/// and falling back to stderr if that file can't be opened.
fn init_logging(config: &ServerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.loglevel.clone()));

    match &config.logfile {
        Some(path) => match fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(std::sync::Mutex::new(file))
                    .init();
            }
            Err(e) => {
                tracing_subscriber::fmt().with_env_filter(filter).init();
                error!(path = %path.display(), "failed to open logfile, logging to stderr: {}", e);
            }
        },
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

/// `-R <path>`: allocate and persist a new single-use registration key,
/// write its hex encoding to `path`.
fn gen_regkey(config: &ServerConfig, path: &Path) -> Result<()> {
    let state = ServerState::open(config).context("failed to open server state")?;
    let key = state
        .directory
        .new_unique_reg_key()
        .context("failed to allocate registration key")?;
    fs::write(path, key.to_hex()).with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), "wrote new registration key");
    Ok(())
}

async fn run_server(config: ServerConfig) -> Result<()> {
    info!(
        address = %config.server_address,
        port = config.server_port,
        "retro-server starting"
    );

    let certs = tls::load_certs(&config.certfile)?;
    let key = tls::load_key(&config.keyfile)?;
    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS configuration")?;
    let tls_acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let state = Arc::new(ServerState::open(&config).context("failed to open server state")?);
    let shutdown = Arc::new(AtomicBool::new(false));

    if config.daemonize {
        write_pidfile(&config.pidfile)?;
    }

    let (_listeners, handles) =
        server::spawn_listeners(&config, state.clone(), tls_acceptor, shutdown.clone()).await?;

    info!("retro-server ready, accepting connections");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown signal received, draining listeners");
    shutdown.store(true, Ordering::SeqCst);
    state.directory.mark_all_sessions_done();

    for handle in handles {
        let _ = handle.await;
    }
    state.workers.join_all().await;

    if config.daemonize {
        let _ = fs::remove_file(&config.pidfile);
    }

    Ok(())
}

/// Writes the current process id to `path`. We don't perform the
/// original's double-fork daemonization (see DESIGN.md), but a process
/// supervisor still wants a pidfile to watch, so we honor that part of
/// `daemonize` mode without backgrounding the process ourselves.
fn write_pidfile(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, std::process::id().to_string())
        .with_context(|| format!("failed to write pidfile {}", path.display()))
}

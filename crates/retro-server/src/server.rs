//! Binds and spawns the three listeners over a shared [`ServerState`].
//! Used by `main.rs` (fixed configured ports) and by integration tests
//! (port 0, reading back the OS-assigned address).

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::config::ServerConfig;
use crate::state::ServerState;
use crate::{audioserver, chat, fileserver};

/// Addresses the listeners actually bound to, useful when `config` used
/// port 0 for an ephemeral port (as tests do).
pub struct Listeners {
    pub chat_addr: SocketAddr,
    pub file_addr: Option<SocketAddr>,
    pub audio_addr: Option<SocketAddr>,
}

/// Binds the chat listener unconditionally, and the file/audio
/// listeners when enabled in `config`, then spawns each accept loop.
/// Returns the bound addresses alongside the spawned task handles.
pub async fn spawn_listeners(
    config: &ServerConfig,
    state: Arc<ServerState>,
    tls_acceptor: TlsAcceptor,
    shutdown: Arc<AtomicBool>,
) -> Result<(Listeners, Vec<JoinHandle<()>>)> {
    let mut handles = Vec::new();

    let chat_listener = TcpListener::bind((config.server_address.as_str(), config.server_port))
        .await
        .with_context(|| {
            format!(
                "failed to bind chat listener on {}:{}",
                config.server_address, config.server_port
            )
        })?;
    let chat_addr = chat_listener.local_addr()?;
    info!(%chat_addr, "chat listener bound");
    handles.push(tokio::spawn(chat::run(
        chat_listener,
        tls_acceptor.clone(),
        state.clone(),
        config.accept_timeout,
        shutdown.clone(),
    )));

    let file_addr = if config.fileserver_enabled {
        let file_listener = TcpListener::bind((config.server_address.as_str(), config.fileserver_port))
            .await
            .with_context(|| {
                format!(
                    "failed to bind file listener on {}:{}",
                    config.server_address, config.fileserver_port
                )
            })?;
        let addr = file_listener.local_addr()?;
        info!(%addr, "file listener bound");
        handles.push(tokio::spawn(fileserver::run(
            file_listener,
            tls_acceptor.clone(),
            state.clone(),
            config.accept_timeout,
            shutdown.clone(),
        )));
        Some(addr)
    } else {
        None
    };

    let audio_addr = if config.audioserver_enabled {
        let audio_listener = TcpListener::bind((config.server_address.as_str(), config.audioserver_port))
            .await
            .with_context(|| {
                format!(
                    "failed to bind audio listener on {}:{}",
                    config.server_address, config.audioserver_port
                )
            })?;
        let addr = audio_listener.local_addr()?;
        info!(%addr, "audio listener bound");
        handles.push(tokio::spawn(audioserver::run(
            audio_listener,
            state.clone(),
            config.accept_timeout,
            shutdown.clone(),
        )));
        Some(addr)
    } else {
        None
    };

    Ok((
        Listeners {
            chat_addr,
            file_addr,
            audio_addr,
        },
        handles,
    ))
}

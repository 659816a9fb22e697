//! TLS file listener: opaque blob upload/download keyed by FileId,
//! gated by the requester's IP already holding an authenticated chat
//! session.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use retro_protocol::{read_packet, recv_bytes, send_bytes, write_packet, FileId, PacketType, RecvError};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::state::ServerState;

const UPLOAD_READ_DEADLINE: Duration = Duration::from_secs(10);
const STREAM_CHUNK: usize = 64 * 1024;
const UPLOAD_HEADER_LEN: usize = FileId::LEN + 4;

type FileStream = TlsStream<TcpStream>;

pub async fn run(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    state: Arc<ServerState>,
    accept_timeout: Duration,
    shutdown: Arc<AtomicBool>,
) {
    info!("file listener accepting connections");
    while !shutdown.load(Ordering::SeqCst) {
        let accepted = timeout(accept_timeout, listener.accept()).await;
        let (stream, peer) = match accepted {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                error!(error = %e, "file accept error");
                continue;
            }
            Err(_) => continue,
        };

        let acceptor = acceptor.clone();
        let state = state.clone();
        let conn_state = state.clone();
        state.workers.spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls) => handle_connection(tls, peer, conn_state).await,
                Err(e) => warn!(%peer, "file TLS handshake failed: {}", e),
            }
        });
    }
    info!("file listener shutting down");
}

async fn handle_connection(mut stream: FileStream, peer: SocketAddr, state: Arc<ServerState>) {
    if state.directory.session_by_remote_addr(peer.ip()).is_none() {
        debug!(%peer, "file connection has no authenticated chat session, closing");
        return;
    }

    let (ty, payload) = match read_packet(&mut stream, state.recv_timeout).await {
        Ok(pair) => pair,
        Err(e) => {
            debug!(%peer, "file request header read failed: {}", e);
            return;
        }
    };

    match ty {
        PacketType::FileUpload => handle_upload(&mut stream, &payload, &state, peer).await,
        PacketType::FileDownload => handle_download(&mut stream, &payload, &state, peer).await,
        other => debug!(%peer, ?other, "unexpected file packet type, closing"),
    }
}

/// `T_FILE_UPLOAD`: `fileId(16) || size(u32 BE)` header, then raw
/// streamed bytes.
async fn handle_upload(stream: &mut FileStream, payload: &[u8], state: &Arc<ServerState>, peer: SocketAddr) {
    if payload.len() != UPLOAD_HEADER_LEN {
        debug!(%peer, "malformed upload header, closing");
        return;
    }
    let file_id = FileId::from_slice(&payload[..FileId::LEN]).unwrap();
    let size = u32::from_be_bytes(payload[FileId::LEN..UPLOAD_HEADER_LEN].try_into().unwrap()) as u64;

    if size > state.fileserver_max_filesize {
        let _ = write_packet(stream, PacketType::Error, b"File too large").await;
        return;
    }

    let path: PathBuf = state.uploaddir.join(file_id.to_hex());
    let mut file = match File::create(&path).await {
        Ok(f) => f,
        Err(e) => {
            error!(%peer, file_id = %file_id, "failed to open upload sink: {}", e);
            let _ = write_packet(stream, PacketType::Error, b"Internal server error").await;
            return;
        }
    };

    if write_packet(stream, PacketType::Success, b"").await.is_err() {
        drop(file);
        let _ = tokio::fs::remove_file(&path).await;
        return;
    }

    let mut received: u64 = 0;
    while received < size {
        let want = ((size - received) as usize).min(STREAM_CHUNK);
        match recv_bytes(stream, want, UPLOAD_READ_DEADLINE).await {
            Ok(Some(chunk)) => match file.write_all(&chunk).await {
                Ok(()) => received += chunk.len() as u64,
                Err(e) => {
                    error!(%peer, file_id = %file_id, "upload write failed: {}", e);
                    break;
                }
            },
            Ok(None) => break,
            Err(_) => break,
        }
    }

    drop(file);

    if received == size {
        let _ = write_packet(stream, PacketType::Success, b"").await;
    } else {
        let _ = tokio::fs::remove_file(&path).await;
        let _ = write_packet(
            stream,
            PacketType::Error,
            format!("Failed, only uploaded {}/{} bytes", received, size).as_bytes(),
        )
        .await;
    }
}

/// `T_FILE_DOWNLOAD`: `fileId(16)` request, `T_SUCCESS size(u32 BE)`
/// reply, then the raw file body.
async fn handle_download(stream: &mut FileStream, payload: &[u8], state: &Arc<ServerState>, peer: SocketAddr) {
    if payload.len() != FileId::LEN {
        debug!(%peer, "malformed download header, closing");
        return;
    }
    let file_id = FileId::from_slice(payload).unwrap();
    let path = state.uploaddir.join(file_id.to_hex());

    let metadata = match tokio::fs::metadata(&path).await {
        Ok(m) => m,
        Err(_) => {
            let _ = write_packet(stream, PacketType::Error, b"Requested file doesn't exist").await;
            return;
        }
    };
    let size = metadata.len();

    if write_packet(stream, PacketType::Success, &(size as u32).to_be_bytes())
        .await
        .is_err()
    {
        return;
    }

    let mut file = match File::open(&path).await {
        Ok(f) => f,
        Err(e) => {
            error!(%peer, file_id = %file_id, "failed to open file for download: {}", e);
            return;
        }
    };

    let mut buf = vec![0u8; STREAM_CHUNK];
    let mut sent: u64 = 0;
    let completed = loop {
        let n = match file.read(&mut buf).await {
            Ok(0) => break true,
            Ok(n) => n,
            Err(e) => {
                warn!(%peer, file_id = %file_id, "download read error: {}", e);
                break false;
            }
        };
        if send_bytes(stream, &buf[..n]).await.is_err() {
            break false;
        }
        sent += n as u64;
        if sent >= size {
            break true;
        }
    };

    if completed && state.fileserver_delete_files {
        let _ = tokio::fs::remove_file(&path).await;
    }
}

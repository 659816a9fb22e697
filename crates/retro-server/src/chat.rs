//! TLS control/chat listener: accept loop, handshake/registration state
//! machine, and the active-session packet router.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use retro_protocol::{read_packet, write_packet, PacketType, RecvError, RegKey, UserId};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::directory::UserStatus;
use crate::session::Session;
use crate::state::ServerState;

const HELLO_LEN: usize = UserId::LEN + 32 + 64;
const PUBKEY_RECV_TIMEOUT: Duration = Duration::from_secs(240);
const SESSION_OUTBOX_CAPACITY: usize = 64;

type ChatStream = TlsStream<TcpStream>;

/// Accept loop for the chat listener. Mirrors the audio listener's
/// shape: bounded-deadline accepts so the `shutdown` flag is observed
/// promptly.
pub async fn run(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    state: Arc<ServerState>,
    accept_timeout: Duration,
    shutdown: Arc<AtomicBool>,
) {
    info!("chat listener accepting connections");
    while !shutdown.load(Ordering::SeqCst) {
        let accepted = timeout(accept_timeout, listener.accept()).await;
        let (stream, peer) = match accepted {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                error!(error = %e, "chat accept error");
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
                Err(e) => warn!(%peer, "chat TLS handshake failed: {}", e),
            }
        });
    }
    info!("chat listener shutting down");
}

async fn handle_connection(stream: ChatStream, peer: SocketAddr, state: Arc<ServerState>) {
    let (mut read_half, write_half) = tokio::io::split(stream);

    let first = read_packet(&mut read_half, state.recv_timeout).await;
    let (packet_type, payload) = match first {
        Ok(pair) => pair,
        Err(RecvError::Timeout) => {
            debug!(%peer, "no packet received before recv_timeout, closing");
            return;
        }
        Err(e) => {
            debug!(%peer, "connection ended before first packet: {}", e);
            return;
        }
    };

    match packet_type {
        PacketType::Hello => {
            if let Some(session) = handshake(write_half, &payload, peer, &state).await {
                run_active_session(read_half, session, state).await;
            }
        }
        PacketType::Register => {
            handle_registration(&mut read_half, write_half, &payload, &state).await;
        }
        other => {
            debug!(%peer, ?other, "unexpected first packet, terminating");
        }
    }
}

async fn reply(
    write_half: &mut WriteHalf<ChatStream>,
    ty: PacketType,
    payload: &[u8],
) -> std::io::Result<()> {
    write_packet(write_half, ty, payload).await
}

/// T_HELLO handshake. Returns the admitted [`Session`] on success,
/// having already spawned its dedicated writer task and sent
/// `T_SUCCESS`; returns `None` on any failure, having already replied
/// with a descriptive `T_ERROR`.
async fn handshake(
    mut write_half: WriteHalf<ChatStream>,
    payload: &[u8],
    peer: SocketAddr,
    state: &Arc<ServerState>,
) -> Option<Arc<Session>> {
    if payload.len() != HELLO_LEN {
        let _ = reply(&mut write_half, PacketType::Error, b"Invalid hello payload").await;
        return None;
    }

    let user_id = UserId::from_slice(&payload[..UserId::LEN]).unwrap();
    let nonce = &payload[UserId::LEN..UserId::LEN + 32];
    let signature = &payload[UserId::LEN + 32..HELLO_LEN];

    if !state.directory.user_exists(user_id) {
        let _ = reply(
            &mut write_half,
            PacketType::Error,
            b"You don't have an account yet",
        )
        .await;
        return None;
    }

    if state.directory.session_by_user_id(user_id).is_some() {
        let _ = reply(
            &mut write_half,
            PacketType::Error,
            b"You are already connected",
        )
        .await;
        return None;
    }

    let pubkey = match state.directory.load_public_key(user_id) {
        Ok(k) => k,
        Err(e) => {
            error!(%peer, user_id = %user_id, "failed to load public key: {}", e);
            let _ = reply(&mut write_half, PacketType::Error, b"Internal server error").await;
            return None;
        }
    };

    if !pubkey.verify(signature, nonce) {
        let _ = reply(&mut write_half, PacketType::Error, b"Permission denied").await;
        return None;
    }

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(SESSION_OUTBOX_CAPACITY);
    let session = Arc::new(Session::new(user_id, peer.ip(), tx));

    // Admit before replying T_SUCCESS: two concurrent handshakes for the
    // same UserId both pass the `session_by_user_id` check above, so
    // duplicate-connect rejection has to be enforced again here,
    // atomically, by the Directory's admit.
    if !state.directory.admit_session(user_id, session.clone()) {
        let _ = reply(
            &mut write_half,
            PacketType::Error,
            b"You are already connected",
        )
        .await;
        return None;
    }

    if reply(&mut write_half, PacketType::Success, b"").await.is_err() {
        state.directory.evict_session(user_id);
        return None;
    }

    state.workers.spawn(async move {
        let mut write_half = write_half;
        while let Some(frame) = rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    info!(%peer, user_id = %user_id, "session authenticated");
    Some(session)
}

/// T_REGISTER flow. Always closes the connection at the end —
/// successful registration does not transition into the active router
/// loop; the client reconnects separately with T_HELLO.
async fn handle_registration(
    read_half: &mut ReadHalf<ChatStream>,
    mut write_half: WriteHalf<ChatStream>,
    payload: &[u8],
    state: &Arc<ServerState>,
) {
    if payload.len() != RegKey::LEN {
        debug!("T_REGISTER payload of wrong length, dropping connection");
        return;
    }
    let reg_key = RegKey::from_slice(payload).unwrap();

    match state.directory.regkey_exists(reg_key) {
        Ok(true) => {}
        Ok(false) => {
            let _ = reply(
                &mut write_half,
                PacketType::Error,
                b"Invalid registration key",
            )
            .await;
            return;
        }
        Err(e) => {
            error!("registration key lookup failed: {}", e);
            let _ = reply(&mut write_half, PacketType::Error, b"Internal server error").await;
            return;
        }
    }

    let user_id = state.directory.new_unique_user_id();
    if reply(&mut write_half, PacketType::Success, user_id.as_bytes())
        .await
        .is_err()
    {
        return;
    }

    let next = read_packet(read_half, PUBKEY_RECV_TIMEOUT).await;
    let (ty, pubkey_payload) = match next {
        Ok(pair) => pair,
        Err(e) => {
            debug!("registration aborted while waiting for public key: {}", e);
            return;
        }
    };

    if ty != PacketType::PubKey || pubkey_payload.is_empty() {
        let _ = reply(&mut write_half, PacketType::Error, b"Expected a public key").await;
        return;
    }

    if let Err(e) = state.directory.add_user(user_id, &pubkey_payload) {
        error!(user_id = %user_id, "failed to persist new user: {}", e);
        let _ = reply(&mut write_half, PacketType::Error, b"Internal server error").await;
        return;
    }

    match state.directory.consume_reg_key(reg_key) {
        Ok(_) => {
            let _ = reply(&mut write_half, PacketType::Success, b"").await;
            info!(user_id = %user_id, "registered new user");
        }
        Err(e) => {
            error!("failed to consume registration key: {}", e);
            let _ = reply(&mut write_half, PacketType::Error, b"Internal server error").await;
        }
    }
}

/// Active router loop: drain queued offline packets, then read/route
/// until disconnect, error, timeout-as-continue, or `T_GOODBYE`.
async fn run_active_session(
    mut read_half: ReadHalf<ChatStream>,
    session: Arc<Session>,
    state: Arc<ServerState>,
) {
    let user_id = session.user_id;

    match state.msgqueue.drain(user_id) {
        Ok(queued) => {
            for (ty, payload) in queued {
                session.send(ty, &payload);
            }
        }
        Err(e) => warn!(user_id = %user_id, "failed to drain offline queue: {}", e),
    }

    broadcast_friend_status(&session, &state, PacketType::FriendOnline);

    while !session.is_done() {
        match read_packet(&mut read_half, state.recv_timeout).await {
            Ok((ty, payload)) => {
                if !route_packet(&session, &state, ty, &payload) {
                    break;
                }
            }
            Err(RecvError::Timeout) => continue,
            Err(e) => {
                debug!(user_id = %user_id, "session read ended: {}", e);
                break;
            }
        }
    }

    state.directory.evict_session(user_id);
    broadcast_friend_status(&session, &state, PacketType::FriendOffline);
    info!(user_id = %user_id, "session terminated");
}

/// Dispatches one packet according to the active-session routing table.
/// Returns `false` when the session should terminate (`T_GOODBYE`).
fn route_packet(session: &Arc<Session>, state: &Arc<ServerState>, ty: PacketType, payload: &[u8]) -> bool {
    match ty {
        PacketType::ChatMsg | PacketType::FileMsg => {
            route_message(session, state, ty, payload);
            true
        }
        PacketType::Friends => {
            handle_friends(session, state, payload);
            true
        }
        PacketType::GetPubKey => {
            handle_get_pubkey(session, state, payload);
            true
        }
        PacketType::StartCall | PacketType::AcceptCall | PacketType::StopCall | PacketType::RejectCall => {
            route_call_signal(state, ty, payload);
            true
        }
        PacketType::Goodbye => false,
        other => {
            debug!(?other, "ignoring packet not valid in the active router loop");
            true
        }
    }
}

fn extract_recipient(payload: &[u8]) -> Option<UserId> {
    payload.get(UserId::LEN..UserId::LEN * 2).and_then(UserId::from_slice)
}

/// `T_CHATMSG` / `T_FILEMSG`: forward to an online recipient, queue for
/// an offline one, or error back to the sender for an unknown one.
fn route_message(session: &Arc<Session>, state: &ServerState, ty: PacketType, payload: &[u8]) {
    let Some(recipient) = extract_recipient(payload) else {
        warn!("message payload too short to carry a recipient, dropping");
        return;
    };

    if !state.directory.user_exists(recipient) {
        session.send(
            PacketType::Error,
            format!("Receiver {} doesn't exist!", recipient.to_hex()).as_bytes(),
        );
        return;
    }

    if let Some(target) = state.directory.session_by_user_id(recipient) {
        if target.send(ty, payload) {
            return;
        }
    }

    if let Err(e) = state.msgqueue.store(recipient, ty, payload) {
        error!(recipient = %recipient, "failed to queue offline message: {}", e);
        session.send(PacketType::Error, b"Internal server error");
    }
}

/// `T_FRIENDS`: reply once per candidate id with its presence, and grow
/// the session's friend set with every id the Directory actually knows.
fn handle_friends(session: &Arc<Session>, state: &ServerState, payload: &[u8]) {
    if payload.len() % UserId::LEN != 0 {
        warn!("malformed T_FRIENDS payload, ignoring");
        return;
    }
    for chunk in payload.chunks(UserId::LEN) {
        let id = UserId::from_slice(chunk).expect("chunk length is UserId::LEN");
        let status = state.directory.user_status(id);
        let reply_type = match status {
            UserStatus::Unknown => PacketType::FriendUnknown,
            UserStatus::Offline => PacketType::FriendOffline,
            UserStatus::Online => PacketType::FriendOnline,
        };
        session.send(reply_type, id.as_bytes());
        if status != UserStatus::Unknown {
            session.add_friend(id);
        }
    }
}

/// `T_GET_PUBKEY`: hand back the requested user's public key and add it
/// to the session's friend set.
fn handle_get_pubkey(session: &Arc<Session>, state: &ServerState, payload: &[u8]) {
    let Some(id) = UserId::from_slice(payload) else {
        warn!("malformed T_GET_PUBKEY payload, ignoring");
        return;
    };

    if !state.directory.user_exists(id) {
        session.send(
            PacketType::Error,
            format!("Unknown user {}", id.to_hex()).as_bytes(),
        );
        return;
    }

    match state.directory.load_public_key(id) {
        Ok(key) => {
            let mut reply_payload = Vec::with_capacity(UserId::LEN + key.as_bytes().len());
            reply_payload.extend_from_slice(id.as_bytes());
            reply_payload.extend_from_slice(key.as_bytes());
            session.send(PacketType::PubKey, &reply_payload);
            session.add_friend(id);
        }
        Err(e) => {
            error!(user_id = %id, "failed to load public key: {}", e);
            session.send(PacketType::Error, b"Internal server error");
        }
    }
}

/// Call-signaling packets are opaque to the server except for the peer
/// id at `payload[8:16]`; forward verbatim if the peer is online, drop
/// silently otherwise.
fn route_call_signal(state: &ServerState, ty: PacketType, payload: &[u8]) {
    let Some(peer) = extract_recipient(payload) else {
        return;
    };
    if let Some(target) = state.directory.session_by_user_id(peer) {
        target.send(ty, payload);
    }
}

/// Best-effort friend-presence broadcast. The friend set is per-session
/// and populated only by `T_FRIENDS`/`T_GET_PUBKEY` during this
/// connection's lifetime, so the broadcast fired right at ACTIVE
/// transition is a no-op until the client has made at least one such
/// request.
fn broadcast_friend_status(session: &Arc<Session>, state: &ServerState, status: PacketType) {
    for id in session.friend_ids() {
        if let Some(target) = state.directory.session_by_user_id(id) {
            target.send(status, session.user_id.as_bytes());
        }
    }
}

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use retro_protocol::CallId;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::state::ServerState;

const CALL_ID_DEADLINE: Duration = Duration::from_secs(10);
const PAIRING_DEADLINE: Duration = Duration::from_secs(10);
const PAIRING_GRACE: Duration = Duration::from_secs(1);
const RELAY_READ_DEADLINE: Duration = Duration::from_secs(1);
const RELAY_CHUNK: usize = 1024;

/// One side of a paired call. Owns the outbound queue that the other
/// side's relay loop pushes bytes onto; a dedicated writer task drains
/// it, giving this leg a single writer just like a chat [`Session`]
/// (crate::session::Session).
struct CallLeg {
    done: AtomicBool,
    outbox: mpsc::Sender<Vec<u8>>,
}

impl CallLeg {
    fn send(&self, data: Vec<u8>) -> bool {
        self.outbox.try_send(data).is_ok()
    }

    fn mark_done(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

/// Transient two-slot rendezvous keyed by CallId.
pub struct CallRoom {
    legs: Mutex<Vec<Arc<CallLeg>>>,
    departed: AtomicUsize,
    notify: Notify,
}

impl CallRoom {
    fn new() -> Self {
        Self {
            legs: Mutex::new(Vec::with_capacity(2)),
            departed: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    /// Appends a leg under the room's lock. Returns `true` if the room is
    /// now full — the second joiner wires both legs as partners
    /// atomically simply by virtue of both now being visible in `legs`.
    fn add_leg(&self, leg: Arc<CallLeg>) -> bool {
        let mut legs = self.legs.lock().unwrap();
        legs.push(leg);
        let full = legs.len() == 2;
        drop(legs);
        if full {
            self.notify.notify_waiters();
        }
        full
    }

    fn is_full(&self) -> bool {
        self.legs.lock().unwrap().len() == 2
    }

    fn partner_of(&self, me: &Arc<CallLeg>) -> Option<Arc<CallLeg>> {
        self.legs
            .lock()
            .unwrap()
            .iter()
            .find(|l| !Arc::ptr_eq(l, me))
            .cloned()
    }

    fn leg_count(&self) -> usize {
        self.legs.lock().unwrap().len()
    }
}

/// Process-wide map of in-progress call rooms, owned by the AudioListener.
#[derive(Default)]
pub struct CallRooms {
    rooms: DashMap<CallId, Arc<CallRoom>>,
}

impl CallRooms {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_create(&self, id: CallId) -> Arc<CallRoom> {
        self.rooms.entry(id).or_insert_with(|| Arc::new(CallRoom::new())).clone()
    }

    /// A leg has finished; discard the room once every leg that joined it
    /// has departed.
    fn leg_departed(&self, id: CallId, room: &Arc<CallRoom>) {
        let departed = room.departed.fetch_add(1, Ordering::SeqCst) + 1;
        if departed >= room.leg_count() {
            self.rooms.remove(&id);
        }
    }
}

pub async fn run(
    listener: TcpListener,
    state: Arc<ServerState>,
    accept_timeout: Duration,
    shutdown: Arc<AtomicBool>,
) {
    run_with_pairing_timeout(listener, state, accept_timeout, PAIRING_DEADLINE, shutdown).await
}

async fn run_with_pairing_timeout(
    listener: TcpListener,
    state: Arc<ServerState>,
    accept_timeout: Duration,
    pairing_timeout: Duration,
    shutdown: Arc<AtomicBool>,
) {
    info!("audio listener accepting connections");
    while !shutdown.load(Ordering::SeqCst) {
        let accepted = timeout(accept_timeout, listener.accept()).await;
        let (stream, peer) = match accepted {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!(error = %e, "audio accept error");
                continue;
            }
            Err(_) => continue,
        };

        let state = state.clone();
        let leg_state = state.clone();
        state.workers.spawn(async move {
            handle_leg(stream, peer, leg_state, pairing_timeout).await;
        });
    }
    info!("audio listener shutting down");
}

async fn handle_leg(
    mut stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ServerState>,
    pairing_timeout: Duration,
) {
    if state.directory.session_by_remote_addr(peer.ip()).is_none() {
        debug!(%peer, "audio connection has no authenticated chat session, closing");
        return;
    }

    let rooms = &state.call_rooms;
    let mut call_id_bytes = [0u8; 16];
    match timeout(CALL_ID_DEADLINE, stream.read_exact(&mut call_id_bytes)).await {
        Ok(Ok(_)) => {}
        _ => {
            debug!(%peer, "audio leg failed to send call id in time");
            return;
        }
    }
    let call_id = CallId(call_id_bytes);

    let room = rooms.get_or_create(call_id);
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(32);
    let leg = Arc::new(CallLeg {
        done: AtomicBool::new(false),
        outbox: tx,
    });

    let mut became_full = room.add_leg(leg.clone());

    let (mut read_half, mut write_half) = stream.into_split();

    let writer = tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if write_half.write_all(&chunk).await.is_err() {
                break;
            }
        }
    });
    let writer_abort = writer.abort_handle();
    state.workers.track(writer);

    if !became_full {
        let waited = timeout(pairing_timeout, room.notify.notified()).await;
        became_full = waited.is_ok() && room.is_full();
        if !became_full {
            let _ = leg.send(vec![b'2']);
            leg.mark_done();
            drop(leg);
            writer_abort.abort();
            rooms.leg_departed(call_id, &room);
            return;
        }
    }

    let _ = leg.send(vec![b'1']);
    tokio::time::sleep(PAIRING_GRACE).await;

    let partner = room.partner_of(&leg);

    let mut buf = vec![0u8; RELAY_CHUNK];
    loop {
        if leg.is_done() || partner.as_ref().is_some_and(|p| p.is_done()) {
            break;
        }
        match timeout(RELAY_READ_DEADLINE, read_half.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                if let Some(partner) = &partner {
                    if !partner.send(buf[..n].to_vec()) {
                        break;
                    }
                }
            }
            Ok(Err(e)) if e.kind() == ErrorKind::TimedOut => continue,
            Ok(Err(_)) => break,
            Err(_) => continue,
        }
    }

    leg.mark_done();
    if let Some(partner) = &partner {
        partner.mark_done();
    }
    writer_abort.abort();
    rooms.leg_departed(call_id, &room);
    debug!(%peer, call_id = %call_id, "audio leg terminated");
}

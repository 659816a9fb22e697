use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use retro_protocol::{PacketType, UserId};
use tokio::sync::mpsc;

/// A live authenticated chat connection: the user it belongs to, the
/// set of UserIds it has declared as friends, and a `done` flag checked
/// between packets for cooperative shutdown.
///
/// The socket itself is not owned here — forwarding a packet to this
/// session means pushing onto `outbox`, which the session's dedicated
/// writer task drains in order. That queue *is* the per-session send
/// lock: at most one task ever writes to the socket.
pub struct Session {
    pub user_id: UserId,
    pub remote_ip: IpAddr,
    pub friends: Mutex<HashSet<UserId>>,
    pub done: AtomicBool,
    outbox: mpsc::Sender<Vec<u8>>,
}

impl Session {
    pub fn new(user_id: UserId, remote_ip: IpAddr, outbox: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            user_id,
            remote_ip,
            friends: Mutex::new(HashSet::new()),
            done: AtomicBool::new(false),
            outbox,
        }
    }

    /// Best-effort enqueue of a framed packet for this session's writer
    /// task. Returns `false` if the session's writer has already exited
    /// (e.g. the connection dropped concurrently) — callers treat that as
    /// "forward failed, fall back to queueing" where applicable.
    pub fn send(&self, packet_type: PacketType, payload: &[u8]) -> bool {
        let frame = retro_protocol::encode_packet(packet_type, payload);
        self.outbox.try_send(frame).is_ok()
    }

    pub fn mark_done(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub fn add_friend(&self, id: UserId) {
        self.friends.lock().unwrap().insert(id);
    }

    pub fn friend_ids(&self) -> Vec<UserId> {
        self.friends.lock().unwrap().iter().copied().collect()
    }
}

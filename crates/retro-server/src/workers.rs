//! Tracks every per-connection and per-relay-leg worker task so shutdown
//! can join them all.
//!
//! spec.md §5 describes the shutdown sequence as "mark all listeners
//! done, close all active sessions..., then join all workers", with
//! "worker" meaning one task per accepted connection and one per audio
//! leg (the listener accept-loop tasks are tracked separately, by
//! `server::spawn_listeners`). The teacher has no counterpart for this:
//! `voipc-server`'s accept loop (`main.rs`) runs forever with no shutdown
//! signal and spawns every connection handler fire-and-forget, never
//! joining anything. This registry exists purely to satisfy spec.md's
//! own "join all workers" requirement.

use std::future::Future;
use std::sync::Mutex;

use tokio::task::JoinHandle;

#[derive(Default)]
pub struct WorkerRegistry {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `fut` as a tracked worker task.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        self.handles.lock().unwrap().push(handle);
    }

    /// Tracks a task that was already spawned elsewhere — used where the
    /// caller also needs an `AbortHandle` of its own (the audio relay's
    /// writer task is aborted directly once its leg terminates).
    pub fn track(&self, handle: JoinHandle<()>) {
        self.handles.lock().unwrap().push(handle);
    }

    /// Awaits every currently tracked worker, draining the registry.
    /// Workers spawned concurrently with this call are not observed;
    /// callers should stop accepting new connections first (joining the
    /// listener tasks) so the set this drains is the final one.
    pub async fn join_all(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

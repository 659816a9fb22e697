//! Process-wide shared aggregate passed to every listener and worker as
//! an explicit context, rather than relying on ambient/global state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::audioserver::CallRooms;
use crate::config::ServerConfig;
use crate::directory::Directory;
use crate::error::StorageError;
use crate::msgqueue::MessageQueue;
use crate::workers::WorkerRegistry;

/// Everything a chat, file or audio worker needs that isn't local to its
/// own connection: the registered-user/session Directory, the durable
/// MessageQueue, the in-progress CallRooms, the registry of spawned
/// per-connection/per-leg worker tasks, and the handful of config values
/// workers consult on every request.
pub struct ServerState {
    pub directory: Directory,
    pub msgqueue: MessageQueue,
    pub call_rooms: Arc<CallRooms>,
    pub workers: WorkerRegistry,

    pub recv_timeout: Duration,
    pub uploaddir: PathBuf,
    pub fileserver_max_filesize: u64,
    pub fileserver_delete_files: bool,
}

impl ServerState {
    /// Opens the Directory's durable store and the message-queue
    /// directory rooted at `config`'s paths, creating the upload
    /// directory if absent.
    pub fn open(config: &ServerConfig) -> Result<Self, StorageError> {
        let directory = Directory::open(&config.userdir, &config.dbfile)?;
        let msgqueue = MessageQueue::new(&config.msgdir)?;
        std::fs::create_dir_all(&config.uploaddir)?;

        Ok(Self {
            directory,
            msgqueue,
            call_rooms: Arc::new(CallRooms::new()),
            workers: WorkerRegistry::new(),
            recv_timeout: config.recv_timeout,
            uploaddir: config.uploaddir.clone(),
            fileserver_max_filesize: config.fileserver_max_filesize,
            fileserver_delete_files: config.fileserver_delete_files,
        })
    }
}

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use dashmap::{DashMap, DashSet};
use retro_protocol::{RegKey, UserId};
use rusqlite::Connection;

use crate::error::StorageError;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStatus {
    Unknown,
    Offline,
    Online,
}

/// Single-file embedded store backing registered users and registration
/// keys: tables `users(userid BLOB)` and `register(regkey BLOB)`.
/// Guarded by a mutex so concurrent callers serialise through one
/// connection; the store must tolerate being opened from multiple
/// threads, and one shared connection behind a lock is the simplest way
/// to get that.
struct ServerDb {
    conn: StdMutex<Connection>,
}

impl ServerDb {
    fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (userid BLOB NOT NULL UNIQUE)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS register (regkey BLOB NOT NULL UNIQUE)",
            [],
        )?;
        Ok(Self {
            conn: StdMutex::new(conn),
        })
    }

    fn add_user(&self, id: UserId) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO users (userid) VALUES (?1)",
            [id.as_bytes().as_slice()],
        )?;
        Ok(())
    }

    fn add_regkey(&self, key: RegKey) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO register (regkey) VALUES (?1)",
            [key.as_bytes().as_slice()],
        )?;
        Ok(())
    }

    /// Atomically checks and removes a registration key; returns whether
    /// it was present.
    fn consume_regkey(&self, key: RegKey) -> Result<bool, StorageError> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM register WHERE regkey = ?1",
            [key.as_bytes().as_slice()],
        )?;
        Ok(removed > 0)
    }

    fn regkey_exists(&self, key: RegKey) -> Result<bool, StorageError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM register WHERE regkey = ?1",
            [key.as_bytes().as_slice()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn user_id_exists(&self, id: UserId) -> Result<bool, StorageError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM users WHERE userid = ?1",
            [id.as_bytes().as_slice()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

/// Process-wide registered-user / live-session aggregate.
pub struct Directory {
    userdir: PathBuf,
    registered_users: DashSet<UserId>,
    sessions: DashMap<UserId, Arc<Session>>,
    db: ServerDb,
}

impl Directory {
    /// Open (creating if absent) the durable store at `dbfile`, and
    /// enumerate registered users by scanning `userdir` for `<hex>.pem`
    /// files, mirroring the original `get_all_users` startup scan.
    pub fn open(userdir: &Path, dbfile: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(userdir)?;
        let registered_users = DashSet::new();
        if let Ok(entries) = fs::read_dir(userdir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("pem") {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    if let Ok(bytes) = hex::decode(stem) {
                        if let Some(id) = UserId::from_slice(&bytes) {
                            registered_users.insert(id);
                        }
                    }
                }
            }
        }

        Ok(Self {
            userdir: userdir.to_path_buf(),
            registered_users,
            sessions: DashMap::new(),
            db: ServerDb::open(dbfile)?,
        })
    }

    fn key_path(&self, id: UserId) -> PathBuf {
        self.userdir.join(format!("{}.pem", id.to_hex()))
    }

    pub fn user_exists(&self, id: UserId) -> bool {
        self.registered_users.contains(&id)
    }

    /// Writes the public-key file and records the user, in that order,
    /// so a failure to write the key file never leaves a durable record
    /// behind for a user with no stored key.
    pub fn add_user(&self, id: UserId, public_key_bytes: &[u8]) -> Result<(), StorageError> {
        fs::write(self.key_path(id), public_key_bytes)?;
        self.db.add_user(id)?;
        self.registered_users.insert(id);
        Ok(())
    }

    pub fn load_public_key(&self, id: UserId) -> Result<retro_crypto::PublicKey, StorageError> {
        let bytes = fs::read(self.key_path(id))?;
        Ok(retro_crypto::PublicKey::load(bytes))
    }

    pub fn new_unique_user_id(&self) -> UserId {
        loop {
            let bytes = retro_crypto::random_bytes(UserId::LEN);
            let id = UserId::from_slice(&bytes).expect("random_bytes returns UserId::LEN bytes");
            if !self.user_exists(id) {
                return id;
            }
        }
    }

    /// Draws a new regkey and records it in the durable store before
    /// returning it, so it is immediately valid for registration.
    pub fn new_unique_reg_key(&self) -> Result<RegKey, StorageError> {
        loop {
            let bytes = retro_crypto::random_bytes(RegKey::LEN);
            let key = RegKey::from_slice(&bytes).expect("random_bytes returns RegKey::LEN bytes");
            if !self.db.regkey_exists(key)? {
                self.db.add_regkey(key)?;
                return Ok(key);
            }
        }
    }

    pub fn regkey_exists(&self, key: RegKey) -> Result<bool, StorageError> {
        self.db.regkey_exists(key)
    }

    pub fn consume_reg_key(&self, key: RegKey) -> Result<bool, StorageError> {
        self.db.consume_regkey(key)
    }

    /// Admits a session; fails if one already exists for this UserId —
    /// at most one live session per user, enforced atomically here.
    pub fn admit_session(&self, id: UserId, session: Arc<Session>) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.sessions.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(session);
                true
            }
        }
    }

    pub fn evict_session(&self, id: UserId) {
        self.sessions.remove(&id);
    }

    /// Marks every currently live session `done`. Each session's router
    /// loop checks this flag between packets and exits on its next
    /// `recv_timeout` tick, per the shutdown sequence in spec.md §5:
    /// mark listeners done, close active sessions, join workers.
    pub fn mark_all_sessions_done(&self) {
        for entry in self.sessions.iter() {
            entry.value().mark_done();
        }
    }

    pub fn session_by_user_id(&self, id: UserId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    /// First-match scan by remote address; addresses are not assumed
    /// unique.
    pub fn session_by_remote_addr(&self, addr: IpAddr) -> Option<Arc<Session>> {
        self.sessions
            .iter()
            .find(|entry| entry.value().remote_ip == addr)
            .map(|entry| entry.value().clone())
    }

    pub fn user_status(&self, id: UserId) -> UserStatus {
        if self.sessions.contains_key(&id) {
            UserStatus::Online
        } else if self.registered_users.contains(&id) {
            UserStatus::Offline
        } else {
            UserStatus::Unknown
        }
    }

    #[cfg(test)]
    fn db_user_id_exists(&self, id: UserId) -> bool {
        self.db.user_id_exists(id).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc;

    fn temp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn add_user_persists_key_file_and_db_row() {
        let dir = temp_dir();
        let d = Directory::open(&dir.path().join("users"), &dir.path().join("server.db")).unwrap();
        let id = UserId([1; 8]);
        d.add_user(id, b"pubkey-bytes").unwrap();
        assert!(d.user_exists(id));
        assert!(d.db_user_id_exists(id));
        assert_eq!(d.load_public_key(id).unwrap().as_bytes(), b"pubkey-bytes");
    }

    #[test]
    fn startup_scan_finds_existing_users() {
        let dir = temp_dir();
        let userdir = dir.path().join("users");
        fs::create_dir_all(&userdir).unwrap();
        fs::write(userdir.join("0102030405060708.pem"), b"key").unwrap();
        let d = Directory::open(&userdir, &dir.path().join("server.db")).unwrap();
        assert!(d.user_exists(UserId([1, 2, 3, 4, 5, 6, 7, 8])));
    }

    #[test]
    fn reg_key_is_single_use() {
        let dir = temp_dir();
        let d = Directory::open(&dir.path().join("users"), &dir.path().join("server.db")).unwrap();
        let key = d.new_unique_reg_key().unwrap();
        assert!(d.regkey_exists(key).unwrap());
        assert!(d.consume_reg_key(key).unwrap());
        assert!(!d.regkey_exists(key).unwrap());
        assert!(!d.consume_reg_key(key).unwrap());
    }

    #[tokio::test]
    async fn admit_session_rejects_duplicate() {
        let dir = temp_dir();
        let d = Directory::open(&dir.path().join("users"), &dir.path().join("server.db")).unwrap();
        let id = UserId([9; 8]);
        let (tx, _rx) = mpsc::channel(1);
        let session = Arc::new(Session::new(id, IpAddr::V4(Ipv4Addr::LOCALHOST), tx));
        assert!(d.admit_session(id, session.clone()));
        assert!(!d.admit_session(id, session));
        assert_eq!(d.user_status(id), UserStatus::Online);
        d.evict_session(id);
        assert!(d.session_by_user_id(id).is_none());
    }

    #[tokio::test]
    async fn mark_all_sessions_done_sets_every_live_session() {
        let dir = temp_dir();
        let d = Directory::open(&dir.path().join("users"), &dir.path().join("server.db")).unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let a = Arc::new(Session::new(UserId([1; 8]), IpAddr::V4(Ipv4Addr::LOCALHOST), tx.clone()));
        let b = Arc::new(Session::new(UserId([2; 8]), IpAddr::V4(Ipv4Addr::LOCALHOST), tx));
        d.admit_session(UserId([1; 8]), a.clone());
        d.admit_session(UserId([2; 8]), b.clone());

        assert!(!a.is_done());
        assert!(!b.is_done());
        d.mark_all_sessions_done();
        assert!(a.is_done());
        assert!(b.is_done());
    }

    #[test]
    fn user_status_distinguishes_unknown_offline_online() {
        let dir = temp_dir();
        let d = Directory::open(&dir.path().join("users"), &dir.path().join("server.db")).unwrap();
        let registered = UserId([5; 8]);
        d.add_user(registered, b"k").unwrap();
        assert_eq!(d.user_status(registered), UserStatus::Offline);
        assert_eq!(d.user_status(UserId([6; 8])), UserStatus::Unknown);
    }
}

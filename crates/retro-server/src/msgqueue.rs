use std::fs;
use std::path::{Path, PathBuf};

use retro_protocol::{PacketType, UserId};
use rusqlite::Connection;

use crate::error::StorageError;

/// Durable per-recipient FIFO of undelivered `(packetType, payload)`
/// packets. One sqlite file per recipient under `msgdir`, opened on
/// demand and closed after each transaction.
pub struct MessageQueue {
    msgdir: PathBuf,
}

impl MessageQueue {
    pub fn new(msgdir: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(msgdir)?;
        Ok(Self {
            msgdir: msgdir.to_path_buf(),
        })
    }

    fn db_path(&self, recipient: UserId) -> PathBuf {
        self.msgdir.join(format!("{}.db", recipient.to_hex()))
    }

    fn open(&self, recipient: UserId) -> Result<Connection, StorageError> {
        let conn = Connection::open(self.db_path(recipient))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS msg (
                auto_id INTEGER PRIMARY KEY AUTOINCREMENT,
                packet_type INTEGER NOT NULL,
                payload BLOB NOT NULL
            )",
            [],
        )?;
        Ok(conn)
    }

    /// Append one packet to `recipient`'s queue. The recipient id is the
    /// caller's concern (extracted from `payload[8:16]` by the router);
    /// this just persists the row atomically.
    pub fn store(
        &self,
        recipient: UserId,
        packet_type: PacketType,
        payload: &[u8],
    ) -> Result<(), StorageError> {
        let conn = self.open(recipient)?;
        conn.execute(
            "INSERT INTO msg (packet_type, payload) VALUES (?1, ?2)",
            rusqlite::params![packet_type.as_u8(), payload],
        )?;
        Ok(())
    }

    /// Returns all queued packets for `recipient` in FIFO order, then
    /// deletes them, inside a single transaction — drain-then-deliver is
    /// atomic.
    pub fn drain(&self, recipient: UserId) -> Result<Vec<(PacketType, Vec<u8>)>, StorageError> {
        let mut conn = self.open(recipient)?;
        let tx = conn.transaction()?;
        let rows: Vec<(u8, Vec<u8>)> = {
            let mut stmt =
                tx.prepare("SELECT packet_type, payload FROM msg ORDER BY auto_id ASC")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        tx.execute("DELETE FROM msg", [])?;
        tx.commit()?;

        rows.into_iter()
            .map(|(ty, payload)| {
                PacketType::try_from(ty)
                    .map(|ty| (ty, payload))
                    .map_err(|_| {
                        StorageError::Db(rusqlite::Error::InvalidColumnType(
                            0,
                            "packet_type".into(),
                            rusqlite::types::Type::Integer,
                        ))
                    })
            })
            .collect()
    }
}

// store.rs - SQLite-backed key/value persister
//
// A single ordered `kv` table holds every record:
// - WAL mode for concurrent reads
// - NORMAL synchronous mode for performance
// - prefix enumeration via half-open range scans on the BLOB key

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use super::{BoxStatistics, NotFound, NotFoundBehavior, Room, StatsTransfer, Store, User};

const SCHEMA_SQL: &str = "CREATE TABLE IF NOT EXISTS kv (
    key   BLOB PRIMARY KEY,
    value BLOB NOT NULL
) WITHOUT ROWID;";

/// On-disk persister. The connection is mutex-guarded so the store can be
/// shared across tasks; every batch write runs in one transaction.
pub struct KvStore {
    conn: Mutex<Connection>,
}

impl KvStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).context("failed to open database")?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )
        .context("failed to configure database settings")?;

        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT value FROM kv WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .context("failed to read key")
    }

    fn set_raw(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .context("failed to write key")?;
        Ok(())
    }

    /// All `(key, value)` pairs whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let upper = prefix_upper_bound(prefix);

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key")
            .context("failed to prepare prefix scan")?;

        let rows = stmt
            .query_map(params![prefix, upper], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .context("failed to run prefix scan")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to collect prefix scan rows")?;

        Ok(rows)
    }
}

/// Smallest byte string greater than every string with the given prefix.
/// Keys here are ASCII, so the last byte is never 0xFF.
fn prefix_upper_bound(prefix: &[u8]) -> Vec<u8> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return upper;
        }
        upper.pop();
    }
    // Empty or all-0xFF prefix: scan to the end of the key space.
    vec![0xFF; prefix.len() + 1]
}

fn user_key(uid: i64) -> Vec<u8> {
    format!("user/{}", uid).into_bytes()
}

fn room_key(room_id: i64) -> Vec<u8> {
    format!("room/{}", room_id).into_bytes()
}

/// Parse the `<uid>` out of a `user/<uid>` key.
fn uid_from_user_key(key: &[u8]) -> i64 {
    let rest = &key[b"user/".len()..];
    let s = std::str::from_utf8(rest).expect("malformed user key");
    s.parse().expect("malformed user id in key")
}

/// Parse the `<uid>` out of a `<roomId>/<uid>/<boxId>` key.
fn uid_from_stats_key(key: &[u8], prefix_len: usize) -> i64 {
    let rest = &key[prefix_len..];
    let s = std::str::from_utf8(rest).expect("malformed box statistics key");
    let uid = s.split('/').next().expect("malformed box statistics key");
    uid.parse().expect("malformed user id in key")
}

impl Store for KvStore {
    fn get_user(&self, uid: i64) -> Result<User> {
        let bytes = self
            .get_raw(&user_key(uid))?
            .ok_or(NotFound)
            .with_context(|| format!("user {} not found", uid))?;
        serde_json::from_slice(&bytes).context("failed to decode user")
    }

    fn set_user(&self, uid: i64, user: &User) -> Result<()> {
        let bytes = serde_json::to_vec(user).context("failed to encode user")?;
        self.set_raw(&user_key(uid), &bytes)
    }

    fn list_user_ids(&self) -> Result<Vec<i64>> {
        let rows = self.scan_prefix(b"user/")?;
        Ok(rows
            .into_iter()
            .map(|(key, _)| uid_from_user_key(&key))
            .collect())
    }

    fn get_room(&self, room_id: i64) -> Result<Room> {
        let bytes = self
            .get_raw(&room_key(room_id))?
            .ok_or(NotFound)
            .with_context(|| format!("room {} not found", room_id))?;
        serde_json::from_slice(&bytes).context("failed to decode room")
    }

    fn set_room(&self, room_id: i64, room: &Room) -> Result<()> {
        let bytes = serde_json::to_vec(room).context("failed to encode room")?;
        self.set_raw(&room_key(room_id), &bytes)
    }

    fn get_box_stats(
        &self,
        transfers: &mut [StatsTransfer],
        not_found: NotFoundBehavior,
    ) -> Result<()> {
        for transfer in transfers.iter_mut() {
            match self.get_raw(&transfer.key)? {
                Some(bytes) => {
                    transfer.stats = serde_json::from_slice(&bytes).with_context(|| {
                        format!(
                            "failed to decode box statistics: {}",
                            String::from_utf8_lossy(&transfer.key)
                        )
                    })?;
                }
                None => match not_found {
                    NotFoundBehavior::Error => {
                        return Err(anyhow!(
                            "box statistics not found: {}",
                            String::from_utf8_lossy(&transfer.key)
                        ));
                    }
                    NotFoundBehavior::Skip => continue,
                },
            }
        }
        Ok(())
    }

    fn set_box_stats(&self, transfers: &[StatsTransfer]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().context("failed to begin transaction")?;

        for transfer in transfers {
            let bytes = serde_json::to_vec(&transfer.stats).with_context(|| {
                format!(
                    "failed to encode box statistics: {}",
                    String::from_utf8_lossy(&transfer.key)
                )
            })?;
            tx.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![transfer.key, bytes],
            )
            .with_context(|| {
                format!(
                    "failed to set box statistics: {}",
                    String::from_utf8_lossy(&transfer.key)
                )
            })?;
        }

        tx.commit().context("failed to commit transaction")
    }

    fn list_box_sender_ids(&self, room_id: i64) -> Result<Vec<i64>> {
        let prefix = format!("{}/", room_id).into_bytes();
        let rows = self.scan_prefix(&prefix)?;
        Ok(rows
            .into_iter()
            .map(|(key, _)| uid_from_stats_key(&key, prefix.len()))
            .collect())
    }

    fn list_box_stats(&self, room_id: i64) -> Result<HashMap<Vec<u8>, BoxStatistics>> {
        let prefix = format!("{}/", room_id).into_bytes();
        let rows = self.scan_prefix(&prefix)?;

        let mut result = HashMap::with_capacity(rows.len());
        for (key, value) in rows {
            let stats: BoxStatistics = serde_json::from_slice(&value).with_context(|| {
                format!(
                    "failed to decode box statistics: {}",
                    String::from_utf8_lossy(&key)
                )
            })?;
            result.insert(key, stats);
        }
        Ok(result)
    }
}

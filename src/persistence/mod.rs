//! Storage layer: data model, the `Store` abstraction, and its two
//! implementations (the on-disk key/value store and the room-scoped
//! read-through cache).
//!
//! Key space:
//! - `user/<uid>`: user metadata
//! - `room/<roomId>`: room metadata
//! - `<roomId>/<uid>/<boxId>`: box statistics
//!
//! All values are UTF-8 JSON.

mod cached;
mod store;

pub use cached::CachedStore;
pub use store::KvStore;

use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
#[error("not found")]
pub struct NotFound;

/// What a batch read does when a key has never been written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundBehavior {
    /// Fail the whole batch.
    Error,
    /// Leave the caller's value untouched.
    Skip,
}

/// In/out carrier for batch box-statistics reads and writes: the caller
/// supplies the key and a destination the store reads into or writes from.
#[derive(Debug, Clone, Default)]
pub struct StatsTransfer {
    pub key: Vec<u8>,
    pub stats: BoxStatistics,
}

impl StatsTransfer {
    pub fn new(key: Vec<u8>) -> Self {
        Self {
            key,
            stats: BoxStatistics::default(),
        }
    }
}

/// Storage interface shared by the persister and the cached overlay.
pub trait Store: Send + Sync {
    fn get_user(&self, uid: i64) -> Result<User>;
    fn set_user(&self, uid: i64, user: &User) -> Result<()>;
    fn list_user_ids(&self) -> Result<Vec<i64>>;

    fn get_room(&self, room_id: i64) -> Result<Room>;
    fn set_room(&self, room_id: i64, room: &Room) -> Result<()>;

    /// Batch-read statistics into the transfers' destinations.
    fn get_box_stats(
        &self,
        transfers: &mut [StatsTransfer],
        not_found: NotFoundBehavior,
    ) -> Result<()>;
    /// Batch-write statistics from the transfers.
    fn set_box_stats(&self, transfers: &[StatsTransfer]) -> Result<()>;

    /// Every viewer that has box statistics recorded in the room.
    fn list_box_sender_ids(&self, room_id: i64) -> Result<Vec<i64>>;
    /// Every statistics entry recorded in the room, keyed by raw store key.
    fn list_box_stats(&self, room_id: i64) -> Result<HashMap<Vec<u8>, BoxStatistics>>;
}

/// Key for a `<roomId>/<uid>/<boxId>` statistics entry.
pub fn box_stats_key(room_id: i64, uid: i64, box_id: i64) -> Vec<u8> {
    format!("{}/{}/{}", room_id, uid, box_id).into_bytes()
}

/// Lifetime statistics for a single `(room, viewer, box)`.
///
/// `last_update_time` is unix milliseconds; 0 means never updated. Totals are
/// monotonic once persisted; the in-memory batch copy is reset between
/// flushes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxStatistics {
    pub total_num: i64,
    pub total_face_price: i64,
    pub total_outcome_price: i64,
    pub last_update_time: i64,
}

impl BoxStatistics {
    pub fn merge(&mut self, other: &BoxStatistics) {
        self.total_num += other.total_num;
        self.total_face_price += other.total_face_price;
        self.total_outcome_price += other.total_outcome_price;
        self.last_update_time = other.last_update_time;
    }

    pub fn reset(&mut self) {
        *self = BoxStatistics::default();
    }
}

/// Metadata for a single viewer. Keyed by uid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub mid: i64,
    pub name: String,
    /// Avatar URL.
    pub face: String,
}

/// Metadata for a single live room. Keyed by room id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub room_id: i64,
    pub gifts: Vec<Gift>,
}

/// Metadata for a kind of gift offered in a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gift {
    pub gift_id: i64,
    pub name: String,
    pub price: i64,
    /// e.g. "gold" or "silver".
    pub coin_type: String,
    pub img_url: String,
    /// Empty unless this gift is a blind box.
    #[serde(default)]
    pub blind_box_outcomes: Vec<BlindBoxOutcome>,
}

/// A possible outcome of a blind box.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlindBoxOutcome {
    pub gift_id: i64,
    pub price: i64,
    pub name: String,
    pub img_url: String,
    /// Display string, e.g. "3.5%".
    pub chance: String,
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box_stats_key_layout() {
        assert_eq!(box_stats_key(5, 42, 10), b"5/42/10".to_vec());
    }

    #[test]
    fn test_merge_accumulates_totals() {
        let mut lifetime = BoxStatistics {
            total_num: 3,
            total_face_price: 300,
            total_outcome_price: 150,
            last_update_time: 1000,
        };
        let delta = BoxStatistics {
            total_num: 2,
            total_face_price: 200,
            total_outcome_price: 900,
            last_update_time: 2000,
        };

        lifetime.merge(&delta);

        assert_eq!(lifetime.total_num, 5);
        assert_eq!(lifetime.total_face_price, 500);
        assert_eq!(lifetime.total_outcome_price, 1050);
        assert_eq!(lifetime.last_update_time, 2000);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut st = BoxStatistics {
            total_num: 1,
            total_face_price: 100,
            total_outcome_price: 500,
            last_update_time: 123,
        };
        st.reset();
        assert_eq!(st, BoxStatistics::default());
    }
}

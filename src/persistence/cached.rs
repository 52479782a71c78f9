// cached.rs - room-scoped read-through cache over the persister
//
// Operates on a single live room. All data is pulled from the persister at
// construction; reads are served from memory for the rest of the process
// lifetime, writes go to the persister first and then update the cache.
//
// The persister's own memtable caches recent writes but not reads, hence the
// explicit overlay.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};

use super::{BoxStatistics, NotFound, NotFoundBehavior, Room, StatsTransfer, Store, User};

pub struct CachedStore {
    persister: Arc<dyn Store>,
    room_id: i64,

    // Three independent maps, three independent locks. No cross-map
    // invariants require coordinated locking.
    users: RwLock<HashMap<i64, User>>,
    room: RwLock<Room>,
    box_stats: RwLock<HashMap<Vec<u8>, BoxStatistics>>,
}

impl CachedStore {
    /// Load the room's working set. Fails if the room record is absent; the
    /// startup refresh must have persisted it first.
    pub fn new(persister: Arc<dyn Store>, room_id: i64) -> Result<Self> {
        let room = persister
            .get_room(room_id)
            .context("failed to get room")?;

        let mut users = HashMap::new();
        for uid in persister.list_user_ids().context("failed to list user ids")? {
            let user = persister
                .get_user(uid)
                .with_context(|| format!("failed to get user {}", uid))?;
            users.insert(uid, user);
        }

        let box_stats = persister
            .list_box_stats(room_id)
            .context("failed to list box statistics")?;

        Ok(Self {
            persister,
            room_id,
            users: RwLock::new(users),
            room: RwLock::new(room),
            box_stats: RwLock::new(box_stats),
        })
    }
}

impl Store for CachedStore {
    fn get_user(&self, uid: i64) -> Result<User> {
        let users = self.users.read().unwrap();
        users
            .get(&uid)
            .cloned()
            .ok_or(NotFound)
            .with_context(|| format!("user {} not found", uid))
    }

    fn set_user(&self, uid: i64, user: &User) -> Result<()> {
        self.persister.set_user(uid, user)?;

        let mut users = self.users.write().unwrap();
        users.insert(uid, user.clone());
        Ok(())
    }

    fn list_user_ids(&self) -> Result<Vec<i64>> {
        let users = self.users.read().unwrap();
        Ok(users.keys().copied().collect())
    }

    fn get_room(&self, room_id: i64) -> Result<Room> {
        assert_eq!(room_id, self.room_id, "CachedStore::get_room: room id mismatch");
        Ok(self.room.read().unwrap().clone())
    }

    fn set_room(&self, _room_id: i64, _room: &Room) -> Result<()> {
        unimplemented!("CachedStore::set_room: the cached view is room-scoped and read-only")
    }

    fn get_box_stats(
        &self,
        transfers: &mut [StatsTransfer],
        not_found: NotFoundBehavior,
    ) -> Result<()> {
        let stats = self.box_stats.read().unwrap();
        for transfer in transfers.iter_mut() {
            match stats.get(&transfer.key) {
                Some(st) => transfer.stats = *st,
                None => match not_found {
                    NotFoundBehavior::Error => {
                        return Err(NotFound).with_context(|| {
                            format!(
                                "box statistics not found: {}",
                                String::from_utf8_lossy(&transfer.key)
                            )
                        });
                    }
                    NotFoundBehavior::Skip => continue,
                },
            }
        }
        Ok(())
    }

    fn set_box_stats(&self, transfers: &[StatsTransfer]) -> Result<()> {
        self.persister.set_box_stats(transfers)?;

        let mut stats = self.box_stats.write().unwrap();
        for transfer in transfers {
            stats.insert(transfer.key.clone(), transfer.stats);
        }
        Ok(())
    }

    fn list_box_sender_ids(&self, _room_id: i64) -> Result<Vec<i64>> {
        unimplemented!("CachedStore::list_box_sender_ids: use the persister before construction")
    }

    fn list_box_stats(&self, room_id: i64) -> Result<HashMap<Vec<u8>, BoxStatistics>> {
        assert_eq!(
            room_id, self.room_id,
            "CachedStore::list_box_stats: room id mismatch"
        );

        let stats = self.box_stats.read().unwrap();
        Ok(stats.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{box_stats_key, KvStore};
    use super::*;

    fn empty_room(room_id: i64) -> Room {
        Room {
            room_id,
            gifts: Vec::new(),
        }
    }

    fn new_cached(room_id: i64) -> (Arc<KvStore>, CachedStore) {
        let persister = Arc::new(KvStore::open_in_memory().unwrap());
        persister.set_room(room_id, &empty_room(room_id)).unwrap();
        let cached = CachedStore::new(persister.clone(), room_id).unwrap();
        (persister, cached)
    }

    #[test]
    fn test_construction_fails_without_room() {
        let persister = Arc::new(KvStore::open_in_memory().unwrap());
        assert!(CachedStore::new(persister, 1).is_err());
    }

    #[test]
    fn test_construction_loads_existing_state() {
        let persister = Arc::new(KvStore::open_in_memory().unwrap());
        persister.set_room(1, &empty_room(1)).unwrap();
        persister
            .set_user(
                42,
                &User {
                    mid: 42,
                    name: "cached".to_string(),
                    face: String::new(),
                },
            )
            .unwrap();
        persister
            .set_box_stats(&[StatsTransfer {
                key: box_stats_key(1, 42, 10),
                stats: BoxStatistics {
                    total_num: 3,
                    ..Default::default()
                },
            }])
            .unwrap();

        let cached = CachedStore::new(persister, 1).unwrap();

        assert_eq!(cached.get_user(42).unwrap().name, "cached");
        let stats = cached.list_box_stats(1).unwrap();
        assert_eq!(stats[&box_stats_key(1, 42, 10)].total_num, 3);
    }

    #[test]
    fn test_set_user_writes_through() {
        let (persister, cached) = new_cached(1);

        let user = User {
            mid: 7,
            name: "new".to_string(),
            face: String::new(),
        };
        cached.set_user(7, &user).unwrap();

        // Visible in both the cache and the persister immediately.
        assert_eq!(cached.get_user(7).unwrap(), user);
        assert_eq!(persister.get_user(7).unwrap(), user);
    }

    #[test]
    fn test_get_unknown_user_is_not_found() {
        let (_persister, cached) = new_cached(1);
        let err = cached.get_user(999).unwrap_err();
        assert!(err.downcast_ref::<NotFound>().is_some());
    }

    #[test]
    fn test_set_box_stats_writes_through_and_reads_back() {
        let (persister, cached) = new_cached(1);

        let key = box_stats_key(1, 42, 10);
        let transfers = vec![StatsTransfer {
            key: key.clone(),
            stats: BoxStatistics {
                total_num: 1,
                total_face_price: 100,
                total_outcome_price: 500,
                last_update_time: 1,
            },
        }];
        cached.set_box_stats(&transfers).unwrap();

        let mut readback = vec![StatsTransfer::new(key.clone())];
        cached
            .get_box_stats(&mut readback, NotFoundBehavior::Error)
            .unwrap();
        assert_eq!(readback[0].stats.total_outcome_price, 500);

        let mut from_disk = vec![StatsTransfer::new(key)];
        persister
            .get_box_stats(&mut from_disk, NotFoundBehavior::Error)
            .unwrap();
        assert_eq!(from_disk[0].stats, readback[0].stats);
    }

    #[test]
    fn test_get_box_stats_skip_on_miss() {
        let (_persister, cached) = new_cached(1);

        let mut transfers = vec![StatsTransfer {
            key: box_stats_key(1, 1, 1),
            stats: BoxStatistics {
                total_num: 9,
                ..Default::default()
            },
        }];
        cached
            .get_box_stats(&mut transfers, NotFoundBehavior::Skip)
            .unwrap();

        // Caller's value untouched.
        assert_eq!(transfers[0].stats.total_num, 9);
    }

    #[test]
    #[should_panic]
    fn test_room_id_mismatch_panics() {
        let (_persister, cached) = new_cached(1);
        let _ = cached.get_room(2);
    }
}

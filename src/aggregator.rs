//! The main event loop: consumes decoded stream events, keeps the per-batch
//! and per-session aggregates, merges finished batches into the persisted
//! lifetime totals and fans the results out to chat and OBS.
//!
//! The loop is the sole writer of its four maps; background tasks only ever
//! touch the cached store and the platform client.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::api::{ChatParams, Client};
use crate::leaderboard::{self, LeaderboardEntry};
use crate::live::{Event, SendGift};
use crate::obs::Studio;
use crate::persistence::{
    box_stats_key, now_millis, BoxStatistics, CachedStore, NotFound, NotFoundBehavior,
    StatsTransfer, Store,
};
use crate::settings::{
    BATCH_QUIESCENCE, CHAT_THROTTLE_MAX, CHAT_THROTTLE_MIN, LOOP_TIMEOUT, OBS_REFRESH_INTERVAL,
    TICKET_GIFT_NAME,
};
use crate::throttle::Throttler;

/// A finished `(viewer, box)` batch on its way to persistence and chat.
#[derive(Debug, Clone)]
struct FinishedBatch {
    key: Vec<u8>,
    uid: i64,
    box_id: i64,
    box_name: String,
    /// This batch's contribution.
    delta: BoxStatistics,
}

/// Everything a chat-report task needs for one batch.
#[derive(Debug, Clone)]
struct ChatReport {
    uid: i64,
    box_name: String,
    delta: BoxStatistics,
    lifetime: BoxStatistics,
}

pub struct Boxtroll {
    db: Arc<CachedStore>,
    client: Arc<Client>,
    room_id: i64,
    throttler: Arc<Throttler>,
    studio: Option<Studio>,

    /// Unsent batch per (viewer, box); slots reset on flush.
    batch: HashMap<(i64, i64), BoxStatistics>,
    /// Running totals for the current live session; never reset.
    session: HashMap<(i64, i64), BoxStatistics>,
    /// Box id -> display name, populated from the live messages themselves.
    /// The persisted gift catalogue can lag behind a newly released box;
    /// the stream is always current.
    box_names: HashMap<i64, String>,
    /// Movie-ticket counts per viewer.
    ticket_counts: HashMap<i64, i64>,
}

impl Boxtroll {
    pub fn new(
        db: Arc<CachedStore>,
        client: Arc<Client>,
        room_id: i64,
        studio: Option<Studio>,
    ) -> Self {
        Self {
            db,
            client,
            room_id,
            throttler: Arc::new(Throttler::new(CHAT_THROTTLE_MIN, CHAT_THROTTLE_MAX)),
            studio,
            batch: HashMap::new(),
            session: HashMap::new(),
            box_names: HashMap::new(),
            ticket_counts: HashMap::new(),
        }
    }

    /// Run until cancellation. Returns an error only when the persister
    /// fails, which means the local disk is in trouble.
    pub async fn run(
        mut self,
        cancel: CancellationToken,
        mut events: mpsc::Receiver<Event>,
    ) -> Result<()> {
        let mut obs_ticker = tokio::time::interval(OBS_REFRESH_INTERVAL);
        obs_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The interval's first tick completes immediately; consume it so the
        // first refresh happens a full period in.
        obs_ticker.tick().await;

        loop {
            self.flush_batch()
                .context("failed to flush finished box batches")?;

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => return Ok(()),
                },
                _ = obs_ticker.tick(), if self.studio.is_some() => {
                    self.refresh_studio().await;
                }
                _ = tokio::time::sleep(LOOP_TIMEOUT) => {}
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::SendGift(gift) => self.handle_send_gift(gift),
            // Placeholder commands carry nothing we aggregate.
            Event::Raw { .. } => {}
        }
    }

    fn handle_send_gift(&mut self, gift: SendGift) {
        if gift.gift_name == TICKET_GIFT_NAME {
            *self.ticket_counts.entry(gift.uid).or_default() += gift.num;
        }

        let Some(blind) = gift.blind_gift else {
            return;
        };

        let key = (gift.uid, blind.original_gift_id);
        let now = now_millis();

        // Update the unsent batch.
        let st = self.batch.entry(key).or_default();
        st.total_num += gift.num;
        st.total_face_price += blind.original_gift_price * gift.num;
        st.total_outcome_price += gift.price * gift.num;
        st.last_update_time = now;

        // And the session totals.
        let session_st = self.session.entry(key).or_default();
        session_st.total_num += gift.num;
        session_st.total_face_price += blind.original_gift_price * gift.num;
        session_st.total_outcome_price += gift.price * gift.num;
        session_st.last_update_time = now;

        self.box_names
            .entry(blind.original_gift_id)
            .or_insert(blind.original_gift_name);
    }

    /// Pull every batch entry that has been quiet for at least a second,
    /// resetting its slot so a still-live burst starts a fresh batch.
    fn collect_finished(&mut self, now_ms: i64) -> Vec<FinishedBatch> {
        let quiescence_ms = BATCH_QUIESCENCE.as_millis() as i64;
        let mut entries = Vec::new();

        for (&(uid, box_id), st) in self.batch.iter_mut() {
            if st.last_update_time == 0 {
                continue;
            }
            if now_ms - st.last_update_time < quiescence_ms {
                continue;
            }

            // Names are recorded in the same place batches are populated, so
            // a batch without a name cannot happen.
            let box_name = self.box_names.get(&box_id).cloned().unwrap_or_default();

            entries.push(FinishedBatch {
                key: box_stats_key(self.room_id, uid, box_id),
                uid,
                box_id,
                box_name,
                delta: *st,
            });

            st.reset();
        }

        entries
    }

    /// Merge finished batches into the persisted lifetime totals and kick
    /// off the chat reports.
    ///
    /// Only the store transactions can fail here; that aborts the process.
    /// Chat is best-effort and happens on a detached task.
    fn flush_batch(&mut self) -> Result<()> {
        let entries = self.collect_finished(now_millis());
        if entries.is_empty() {
            return Ok(());
        }

        // Backfill profiles for viewers we have not seen before.
        let mut seen = std::collections::HashSet::new();
        for entry in &entries {
            if seen.insert(entry.uid) {
                let db = self.db.clone();
                let client = self.client.clone();
                let uid = entry.uid;
                tokio::spawn(async move {
                    if let Err(e) = create_user_if_not_exists(db, client, uid).await {
                        error!(error = %e, uid, "failed to create user");
                    }
                });
            }
        }

        let mut transfers: Vec<StatsTransfer> = entries
            .iter()
            .map(|entry| StatsTransfer::new(entry.key.clone()))
            .collect();

        // Missing keys stay zero and the delta becomes the lifetime total.
        self.db
            .get_box_stats(&mut transfers, NotFoundBehavior::Skip)?;
        for (entry, transfer) in entries.iter().zip(transfers.iter_mut()) {
            transfer.stats.merge(&entry.delta);
        }
        self.db.set_box_stats(&transfers)?;

        let reports: Vec<ChatReport> = entries
            .iter()
            .zip(transfers.iter())
            .map(|(entry, transfer)| ChatReport {
                uid: entry.uid,
                box_name: entry.box_name.clone(),
                delta: entry.delta,
                lifetime: transfer.stats,
            })
            .collect();

        let client = self.client.clone();
        let throttler = self.throttler.clone();
        let room_id = self.room_id;
        tokio::spawn(send_chat_reports(client, throttler, room_id, reports));

        Ok(())
    }

    /// Render the session leaderboard and push it to the OBS text source.
    async fn refresh_studio(&mut self) {
        let mut batteries: HashMap<i64, i64> = HashMap::new();
        for (&(uid, _box_id), st) in &self.session {
            *batteries.entry(uid).or_default() += st.total_outcome_price - st.total_face_price;
        }

        let mut entries = Vec::with_capacity(batteries.len());
        for (uid, diff) in batteries {
            let user = match self.db.get_user(uid) {
                Ok(user) => user,
                Err(e) => {
                    // Should not happen; the backfill task runs on flush.
                    warn!(error = %e, uid, "unknown box sender");
                    continue;
                }
            };
            entries.push(LeaderboardEntry {
                uid,
                name: user.name,
                battery: diff / 100,
            });
        }

        let report = leaderboard::render(&entries);
        if let Some(studio) = self.studio.as_mut() {
            studio.update_text(&report).await;
        }
    }
}

async fn create_user_if_not_exists(
    db: Arc<CachedStore>,
    client: Arc<Client>,
    uid: i64,
) -> Result<()> {
    match db.get_user(uid) {
        Ok(_) => Ok(()),
        Err(e) if e.downcast_ref::<NotFound>().is_some() => {
            let info = client.get_user_info(uid).await?;
            db.set_user(
                uid,
                &crate::persistence::User {
                    mid: uid,
                    name: info.name,
                    face: info.face,
                },
            )
        }
        Err(e) => Err(e),
    }
}

/// Send the two per-batch report lines for every finished batch, serialized
/// through the throttler. Failures are logged; chat is not load-bearing.
async fn send_chat_reports(
    client: Arc<Client>,
    throttler: Arc<Throttler>,
    room_id: i64,
    reports: Vec<ChatReport>,
) {
    for report in reports {
        let cur_battery =
            (report.delta.total_outcome_price - report.delta.total_face_price) / 100;
        let total_battery =
            (report.lifetime.total_outcome_price - report.lifetime.total_face_price) / 100;

        let messages = [
            format_report(&report.box_name, cur_battery, false),
            format_report(&report.box_name, total_battery, true),
        ];

        for msg in messages {
            let result = throttler
                .run(|| {
                    client.send_chat(
                        room_id,
                        ChatParams {
                            msg: msg.clone(),
                            reply_mid: report.uid,
                            ..Default::default()
                        },
                    )
                })
                .await;

            if let Err(e) = result {
                error!(error = %e, chat = %msg, "failed to send chat report");
            }
        }
    }
}

/// `投喂 <box>: +N 电池` / `历史投喂 <box>: -N 电池`. The sign is explicit
/// only for non-negative values; negatives already carry one.
fn format_report(box_name: &str, battery: i64, lifetime: bool) -> String {
    let prefix = if lifetime { "历史" } else { "" };

    if battery >= 0 {
        format!("{}投喂 {}: +{} 电池", prefix, box_name, battery)
    } else {
        format!("{}投喂 {}: {} 电池", prefix, box_name, battery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::BlindGift;
    use crate::persistence::{KvStore, Room};

    fn new_boxtroll(room_id: i64) -> Boxtroll {
        let persister = Arc::new(KvStore::open_in_memory().unwrap());
        persister
            .set_room(
                room_id,
                &Room {
                    room_id,
                    gifts: Vec::new(),
                },
            )
            .unwrap();
        let db = Arc::new(CachedStore::new(persister, room_id).unwrap());
        let client = Arc::new(Client::new().unwrap());
        Boxtroll::new(db, client, room_id, None)
    }

    fn blind_gift(uid: i64, box_id: i64, face: i64, outcome: i64, num: i64) -> SendGift {
        SendGift {
            gift_id: 32251,
            gift_name: "白银宝盒".to_string(),
            num,
            price: outcome,
            uid,
            uname: "viewer".to_string(),
            blind_gift: Some(BlindGift {
                gift_tip_price: 0,
                original_gift_id: box_id,
                original_gift_name: "盲盒A".to_string(),
                original_gift_price: face,
            }),
        }
    }

    #[tokio::test]
    async fn test_blind_gift_updates_both_horizons() {
        let mut troll = new_boxtroll(1);

        troll.handle_send_gift(blind_gift(42, 10, 100, 500, 2));

        let key = (42, 10);
        let batch = troll.batch[&key];
        assert_eq!(batch.total_num, 2);
        assert_eq!(batch.total_face_price, 200);
        assert_eq!(batch.total_outcome_price, 1000);
        assert!(batch.last_update_time > 0);

        assert_eq!(troll.session[&key], batch);
        assert_eq!(troll.box_names[&10], "盲盒A");
    }

    #[tokio::test]
    async fn test_non_blind_gift_is_ignored() {
        let mut troll = new_boxtroll(1);

        let mut gift = blind_gift(42, 10, 100, 500, 1);
        gift.blind_gift = None;
        troll.handle_send_gift(gift);

        assert!(troll.batch.is_empty());
        assert!(troll.session.is_empty());
    }

    #[tokio::test]
    async fn test_movie_ticket_gift_is_counted() {
        let mut troll = new_boxtroll(1);

        let mut gift = blind_gift(42, 10, 100, 500, 3);
        gift.gift_name = TICKET_GIFT_NAME.to_string();
        gift.blind_gift = None;
        troll.handle_send_gift(gift);

        assert_eq!(troll.ticket_counts[&42], 3);
        assert!(troll.batch.is_empty());
    }

    #[tokio::test]
    async fn test_collect_respects_quiescence() {
        let mut troll = new_boxtroll(1);
        troll.handle_send_gift(blind_gift(42, 10, 100, 500, 1));

        let stamped = troll.batch[&(42, 10)].last_update_time;

        // Too recent: nothing to flush.
        assert!(troll.collect_finished(stamped + 500).is_empty());

        // Quiet for a second: flushed and reset.
        let entries = troll.collect_finished(stamped + 1000);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].uid, 42);
        assert_eq!(entries[0].box_id, 10);
        assert_eq!(entries[0].box_name, "盲盒A");
        assert_eq!(entries[0].delta.total_outcome_price, 500);

        // The batch slot is zeroed, the session slot is untouched.
        assert_eq!(troll.batch[&(42, 10)], BoxStatistics::default());
        assert_eq!(troll.session[&(42, 10)].total_num, 1);

        // And a reset slot never flushes again.
        assert!(troll.collect_finished(stamped + 10_000).is_empty());
    }

    #[tokio::test]
    async fn test_burst_accumulates_into_one_batch() {
        let mut troll = new_boxtroll(1);
        for _ in 0..3 {
            troll.handle_send_gift(blind_gift(7, 20, 1000, 50, 3));
        }

        let stamped = troll.batch[&(7, 20)].last_update_time;
        let entries = troll.collect_finished(stamped + 1500);

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].delta.total_num, 9);
        assert_eq!(entries[0].delta.total_face_price, 9000);
        assert_eq!(entries[0].delta.total_outcome_price, 450);
    }

    #[tokio::test]
    async fn test_flush_merges_into_persisted_lifetime() {
        let mut troll = new_boxtroll(1);

        // Pre-existing lifetime total.
        troll
            .db
            .set_box_stats(&[StatsTransfer {
                key: box_stats_key(1, 42, 10),
                stats: BoxStatistics {
                    total_num: 5,
                    total_face_price: 500,
                    total_outcome_price: 300,
                    last_update_time: 1,
                },
            }])
            .unwrap();

        troll.handle_send_gift(blind_gift(42, 10, 100, 500, 1));
        troll.batch.get_mut(&(42, 10)).unwrap().last_update_time -= 2000;
        troll.flush_batch().unwrap();

        let mut readback = vec![StatsTransfer::new(box_stats_key(1, 42, 10))];
        troll
            .db
            .get_box_stats(&mut readback, NotFoundBehavior::Error)
            .unwrap();
        assert_eq!(readback[0].stats.total_num, 6);
        assert_eq!(readback[0].stats.total_face_price, 600);
        assert_eq!(readback[0].stats.total_outcome_price, 800);
    }

    #[tokio::test]
    async fn test_flush_with_empty_batch_is_noop() {
        let mut troll = new_boxtroll(1);
        troll.flush_batch().unwrap();
        assert!(troll.db.list_box_stats(1).unwrap().is_empty());
    }

    #[test]
    fn test_format_report_win() {
        assert_eq!(format_report("盲盒A", 4, false), "投喂 盲盒A: +4 电池");
        assert_eq!(format_report("盲盒A", 4, true), "历史投喂 盲盒A: +4 电池");
    }

    #[test]
    fn test_format_report_loss() {
        assert_eq!(format_report("盲盒A", -85, false), "投喂 盲盒A: -85 电池");
        assert_eq!(format_report("盲盒A", -85, true), "历史投喂 盲盒A: -85 电池");
    }

    #[test]
    fn test_format_report_zero_is_positive() {
        assert_eq!(format_report("盲盒A", 0, false), "投喂 盲盒A: +0 电池");
    }

    #[test]
    fn test_battery_division_truncates_toward_zero() {
        // -8550 / 100 must report -85, not -86.
        assert_eq!((450i64 - 9000) / 100, -85);
        assert_eq!((500i64 - 100) / 100, 4);
    }
}

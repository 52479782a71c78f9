//! Startup metadata refresh: the room's gift catalogue and the profiles of
//! every viewer we have statistics for.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::api::Client;
use crate::persistence::{BlindBoxOutcome, Gift, Room, Store, User};

/// Fetch the room's gift catalogue, including the outcome table of every
/// blind box, and persist the room record.
pub async fn refresh_room(client: &Client, store: &Arc<dyn Store>, room_id: i64) -> Result<Room> {
    info!(room_id, "fetching latest room gift catalogue");

    let gift_list = client
        .get_room_gift_list(room_id)
        .await
        .context("failed to fetch room gift list")?;

    let mut room = Room {
        room_id,
        gifts: Vec::new(),
    };

    for item in gift_list.gift_config.base_config.gift_list {
        let mut gift = Gift {
            gift_id: item.id,
            name: item.name,
            price: item.price,
            coin_type: item.coin_type,
            img_url: item.img_url,
            blind_box_outcomes: Vec::new(),
        };

        if gift.name.contains("盲盒") {
            info!(name = %gift.name, id = gift.gift_id, "fetching blind box outcomes");
            let config = client
                .get_blind_box_config(gift.gift_id)
                .await
                .context("failed to fetch blind box config")?;

            gift.blind_box_outcomes = config
                .outcome_gifts
                .into_iter()
                .map(|outcome| BlindBoxOutcome {
                    gift_id: outcome.gift_id,
                    price: outcome.price,
                    name: outcome.gift_name,
                    img_url: outcome.img_url,
                    chance: outcome.chance,
                })
                .collect();
        }

        room.gifts.push(gift);
    }

    store
        .set_room(room_id, &room)
        .context("failed to persist room")?;

    Ok(room)
}

/// Re-fetch the profile of every known user plus every viewer that has sent
/// a box in this room, so names on the leaderboard stay current.
pub async fn refresh_all_users(
    client: &Client,
    store: &Arc<dyn Store>,
    room_id: i64,
) -> Result<()> {
    let mut uids: HashSet<i64> = HashSet::new();

    uids.extend(store.list_user_ids().context("failed to list user ids")?);
    uids.extend(
        store
            .list_box_sender_ids(room_id)
            .context("failed to list box sender ids")?,
    );

    for uid in uids {
        info!(uid, "refreshing user profile");

        let profile = client
            .get_user_info(uid)
            .await
            .with_context(|| format!("failed to fetch profile of user {}", uid))?;

        store
            .set_user(
                uid,
                &User {
                    mid: uid,
                    name: profile.name,
                    face: profile.face,
                },
            )
            .with_context(|| format!("failed to persist user {}", uid))?;

        info!(uid, "user profile refreshed");
    }

    Ok(())
}

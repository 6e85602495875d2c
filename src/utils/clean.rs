use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::time;
use tracing::info;

use crate::hub::Hub;

/// Periodic grace-period sweep. A rejoin cancels deletion by clearing
/// `empty_since`; no timer is ever cancelled.
pub async fn task(hub: Arc<Hub>, every: Duration) {
    let mut tick = time::interval(every);
    tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    info!(every = ?every, grace = ?hub.config.grace_period, "room reaper started");
    loop {
        tick.tick().await;
        let (rooms, chats) = hub.sweep(Utc::now()).await;
        if rooms + chats > 0 {
            let (live_rooms, users, live_chats, chat_users) = hub.counts().await;
            info!(rooms, chats, live_rooms, users, live_chats, chat_users, "reaper pass");
        }
    }
}

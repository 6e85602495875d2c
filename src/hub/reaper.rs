use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{ChatRoomRef, Hub, RoomRef};

fn expired(empty_since: Option<DateTime<Utc>>, now: DateTime<Utc>, grace: Duration) -> bool {
    empty_since.is_some_and(|t| (now - t).to_std().is_ok_and(|idle| idle >= grace))
}

impl Hub {
    /// Deletes every room (and chat room) that has been empty for longer
    /// than the grace period as of `now`. Each candidate is re-checked
    /// under its own lock, so a rejoin that lands first always wins.
    /// Returns (rooms, chat rooms) removed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> (usize, usize) {
        let grace = self.config.grace_period;
        let (mut rooms_reaped, mut chats_reaped) = (0, 0);

        let candidates: Vec<(String, RoomRef)> =
            self.rooms.read().await.iter().map(|(id, r)| (id.clone(), r.clone())).collect();
        for (id, room_ref) in candidates {
            {
                let mut room = room_ref.lock().await;
                if room.closed || !room.members.is_empty() || !expired(room.empty_since, now, grace) {
                    continue;
                }
                room.closed = true;
            }
            self.forget_room(&id, &room_ref).await;
            rooms_reaped += 1;
            info!(room = %id, "empty room reaped");

            if let Some(chat_ref) = self.chat_room(&id).await {
                if self.close_chat_if(&chat_ref, |c| c.members.is_empty()).await {
                    self.forget_chat_room(&id, &chat_ref).await;
                    chats_reaped += 1;
                }
            }
        }

        let chat_candidates: Vec<(String, ChatRoomRef)> =
            self.chat_rooms.read().await.iter().map(|(id, r)| (id.clone(), r.clone())).collect();
        for (id, chat_ref) in chat_candidates {
            if self.close_chat_if(&chat_ref, |c| c.members.is_empty() && expired(c.empty_since, now, grace)).await {
                self.forget_chat_room(&id, &chat_ref).await;
                chats_reaped += 1;
                info!(room = %id, "empty chat room reaped");
            }
        }

        debug!(rooms_reaped, chats_reaped, "sweep finished");
        (rooms_reaped, chats_reaped)
    }

    async fn close_chat_if(&self, chat_ref: &ChatRoomRef, cond: impl Fn(&crate::state::ChatRoom) -> bool) -> bool {
        let mut chat = chat_ref.lock().await;
        if chat.closed || !cond(&*chat) {
            return false;
        }
        chat.closed = true;
        true
    }

    /// Drops the directory entry, but only if it is still `room_ref`.
    pub(super) async fn forget_room(&self, id: &str, room_ref: &RoomRef) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(id).is_some_and(|r| Arc::ptr_eq(r, room_ref)) {
            rooms.remove(id);
        }
    }

    pub(super) async fn forget_chat_room(&self, id: &str, chat_ref: &ChatRoomRef) {
        let mut rooms = self.chat_rooms.write().await;
        if rooms.get(id).is_some_and(|r| Arc::ptr_eq(r, chat_ref)) {
            rooms.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as Span;

    use crate::error::HubError;
    use crate::hub::testkit::*;

    #[tokio::test]
    async fn abandoned_room_is_gone_after_grace() {
        let hub = hub();
        let mut a = canvas_peer(&hub, "A").await;
        let room = hub.create_room(&a.id, "R1", Some(10), None).await.unwrap();
        hub.leave_room(&a.id, false).await;
        a.drain();

        // not yet
        assert_eq!(hub.sweep(chrono::Utc::now() + Span::seconds(5)).await, (0, 0));
        assert!(hub.room(&room).await.is_some());

        assert_eq!(hub.sweep(chrono::Utc::now() + Span::seconds(31)).await.0, 1);
        assert_eq!(hub.join_room(&a.id, &room, true).await, Err(HubError::RoomNotFound));
        assert_eq!(hub.counts().await.0, 0);
    }

    #[tokio::test]
    async fn rejoin_within_grace_cancels_deletion() {
        let hub = hub();
        let mut a = canvas_peer(&hub, "A").await;
        let room = hub.create_room(&a.id, "R1", Some(10), None).await.unwrap();
        hub.leave_room(&a.id, false).await;
        hub.join_room(&a.id, &room, true).await.unwrap();
        a.drain();

        assert_eq!(hub.sweep(chrono::Utc::now() + Span::seconds(3600)).await, (0, 0));
        let r = hub.room(&room).await.unwrap();
        let r = r.lock().await;
        assert!(r.empty_since.is_none());
        assert!(!r.closed);
    }

    #[tokio::test]
    async fn stale_handle_to_reaped_room_cannot_be_joined() {
        let hub = hub();
        let a = canvas_peer(&hub, "A").await;
        let room = hub.create_room(&a.id, "R1", Some(10), None).await.unwrap();
        let handle = hub.room(&room).await.unwrap();
        hub.leave_room(&a.id, false).await;

        hub.sweep(chrono::Utc::now() + Span::seconds(31)).await;
        assert!(handle.lock().await.closed);
    }

    #[tokio::test]
    async fn empty_chat_room_goes_with_its_room_but_occupied_one_stays() {
        let hub = hub();
        let mut a = canvas_peer(&hub, "A").await;
        let r1 = hub.create_room(&a.id, "R1", Some(10), None).await.unwrap();
        let chat_a = chat_peer(&hub, "A", Some(&a.id)).await;
        hub.chat_join(&chat_a.id, &r1).await.unwrap();
        hub.chat_leave(&chat_a.id).await.unwrap();

        let r2 = hub.create_room(&a.id, "R2", Some(10), None).await.unwrap();
        let lurker = chat_peer(&hub, "L", None).await;
        hub.chat_join(&lurker.id, &r1).await.unwrap();
        hub.chat_join(&lurker.id, &r2).await.unwrap();
        hub.chat_join(&chat_a.id, &r1).await.unwrap();
        hub.leave_room(&a.id, false).await;
        a.drain();

        let (rooms, chats) = hub.sweep(chrono::Utc::now() + Span::seconds(31)).await;
        assert_eq!(rooms, 2);
        // R1 chat still has A; R2 chat still has the lurker
        assert_eq!(chats, 0);
        assert!(hub.chat_room(&r1).await.is_some());
        assert!(hub.chat_room(&r2).await.is_some());

        hub.chat_leave(&lurker.id).await.unwrap();
        let (_, chats) = hub.sweep(chrono::Utc::now() + Span::seconds(31)).await;
        assert_eq!(chats, 1);
        assert!(hub.chat_room(&r2).await.is_none());
    }
}

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::Hub;
use crate::error::{HubError, HubResult};

impl Hub {
    /// Sends `msg` to every other member of the sender's room. Returns the
    /// room id it went to.
    async fn relay_to_room(&self, uid: &str, msg: impl FnOnce(&str) -> Value) -> HubResult<String> {
        let room_id = self.current_room(uid).await.ok_or(HubError::NotInRoom)?;
        let room = self.room(&room_id).await.ok_or(HubError::RoomNotFound)?;
        let room = room.lock().await;
        if !room.is_member(uid) {
            return Err(HubError::NotInRoom);
        }
        let users = self.users.read().await;
        self.deliver(&users, &room.members, Some(uid), &msg(&room_id));
        Ok(room_id)
    }

    /// Forwards a call-setup message to one peer in the sender's room.
    /// The sender id is stamped by the server.
    pub async fn relay_signal(&self, uid: &str, to: &str, signal_type: Value, signal_data: Value) -> HubResult<()> {
        let room_id = self.current_room(uid).await.ok_or(HubError::NotInRoom)?;
        let room = self.room(&room_id).await.ok_or(HubError::RoomNotFound)?;
        let room = room.lock().await;
        if !room.is_member(uid) || !room.is_member(to) {
            warn!(from = %uid, %to, room = %room_id, "signal target not in the same room");
            return Err(HubError::TargetNotInRoom);
        }
        let users = self.users.read().await;
        let msg = json!({
            "type": "webrtc_signal",
            "fromUserId": uid,
            "toUserId": to,
            "signalType": signal_type,
            "signalData": signal_data,
        });
        self.deliver_to(&users, to, &msg);
        debug!(from = %uid, %to, room = %room_id, signal = %signal_type, "signal forwarded");
        Ok(())
    }

    /// Broadcasts a call lifecycle event with a server timestamp. A
    /// client-supplied room id must match the sender's room.
    pub async fn video_call_event(&self, uid: &str, event_type: Value, data: Value, room_hint: Option<&str>) -> HubResult<()> {
        if let Some(hint) = room_hint {
            if self.current_room(uid).await.as_deref() != Some(hint) {
                warn!(user = %uid, room = %hint, "call event for a room the sender is not in");
                return Err(HubError::NotInRoom);
            }
        }
        let timestamp = Utc::now().timestamp_millis() as f64 / 1000.0;
        let room_id = self
            .relay_to_room(uid, |room_id| {
                json!({
                    "type": "video_call_event",
                    "event_type": event_type,
                    "data": data,
                    "user_id": uid,
                    "room_id": room_id,
                    "timestamp": timestamp,
                })
            })
            .await?;
        info!(user = %uid, room = %room_id, event = %event_type, "call event");
        Ok(())
    }

    pub async fn video_call_started(&self, uid: &str, user_name: Option<String>) -> HubResult<()> {
        let name = match user_name {
            Some(n) => n,
            None => self.user_name(uid).await.unwrap_or_default(),
        };
        let room_id = self
            .relay_to_room(uid, |_| json!({ "type": "video_call_started", "user_id": uid, "user_name": name }))
            .await?;
        info!(user = %uid, room = %room_id, "video call started");
        Ok(())
    }

    pub async fn video_call_ended(&self, uid: &str) -> HubResult<()> {
        let room_id = self
            .relay_to_room(uid, |_| json!({ "type": "video_call_ended", "user_id": uid }))
            .await?;
        info!(user = %uid, room = %room_id, "video call ended");
        Ok(())
    }

    pub async fn media_status(&self, uid: &str, video: bool, audio: bool) -> HubResult<()> {
        self.relay_to_room(uid, |_| {
            json!({ "type": "media_status", "user_id": uid, "video_enabled": video, "audio_enabled": audio })
        })
        .await?;
        debug!(user = %uid, video, audio, "media status");
        Ok(())
    }
}

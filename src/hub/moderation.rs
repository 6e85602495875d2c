use std::str::FromStr;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::MutexGuard;
use tracing::{info, warn};

use super::Hub;
use crate::{
    error::{invalid, HubError, HubResult},
    state::{BroadcastPdf, ChatMessage, Outbound, Room},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuteChannel {
    Video,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuteAction {
    Mute,
    Unmute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdfAction {
    Load,
    PageChange,
    Close,
}

impl FromStr for MuteChannel {
    type Err = HubError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video" => Ok(Self::Video),
            "audio" => Ok(Self::Audio),
            other => Err(HubError::Invalid(format!("Unknown mute type: {other}"))),
        }
    }
}

impl FromStr for MuteAction {
    type Err = HubError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mute" => Ok(Self::Mute),
            "unmute" => Ok(Self::Unmute),
            other => Err(HubError::Invalid(format!("Unknown mute action: {other}"))),
        }
    }
}

impl FromStr for PdfAction {
    type Err = HubError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "load" => Ok(Self::Load),
            "page_change" => Ok(Self::PageChange),
            "close" => Ok(Self::Close),
            other => Err(HubError::Invalid(format!("Unknown pdf action: {other}"))),
        }
    }
}

impl MuteChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

impl MuteAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mute => "mute",
            Self::Unmute => "unmute",
        }
    }
}

impl PdfAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::PageChange => "page_change",
            Self::Close => "close",
        }
    }
}

impl Hub {
    /// Locks the requester's room and checks that the requester holds host.
    async fn hosted_room(&self, uid: &str, action: &'static str) -> HubResult<(super::RoomRef, String)> {
        let room_id = {
            let users = self.users.read().await;
            let user = users.get(uid).ok_or(HubError::NotRegistered)?;
            user.room_id.clone().ok_or(HubError::NotInRoom)?
        };
        let room = self.room(&room_id).await.ok_or(HubError::RoomNotFound)?;
        let host = room.lock().await.host_id.clone();
        if host != uid {
            warn!(user = %uid, room = %room_id, %action, "non-host attempted host action");
            return Err(HubError::NotHost(action));
        }
        Ok((room, room_id))
    }

    /// The host / member / self checks shared by transfer, kick and mute,
    /// evaluated on the locked room.
    fn check_target(room: &Room, host: &str, target: &str, action: &'static str) -> HubResult<()> {
        if room.host_id != host {
            return Err(HubError::NotHost(action));
        }
        if target == host {
            return Err(HubError::SelfTarget);
        }
        if !room.is_member(target) {
            return Err(HubError::TargetNotInRoom);
        }
        Ok(())
    }

    async fn lock_checked<'a>(
        &self,
        room: &'a super::RoomRef,
        host: &str,
        target: &str,
        action: &'static str,
    ) -> HubResult<MutexGuard<'a, Room>> {
        if !self.users.read().await.contains_key(target) {
            return Err(HubError::UserNotFound);
        }
        let guard = room.lock().await;
        if let Err(e) = Self::check_target(&guard, host, target, action) {
            warn!(user = %host, %target, room = %guard.id, %action, error = %e, "host action rejected");
            return Err(e);
        }
        Ok(guard)
    }

    /// Hands host to another member. Returns the new host's name.
    pub async fn transfer_host(&self, uid: &str, target: &str) -> HubResult<String> {
        let (room_ref, _) = self.hosted_room(uid, "transfer host privileges").await?;
        let mut room = self.lock_checked(&room_ref, uid, target, "transfer host privileges").await?;

        // set_host ends any broadcast and announces the reset
        let users = self.users.read().await;
        self.set_host(&mut room, &users, target, "host_transfer");

        Ok(users.get(target).map(|u| u.name.clone()).unwrap_or_default())
    }

    /// Removes `target` from the room, its chat room and the call, then
    /// closes its connections once every notice has been queued ahead of
    /// the close.
    pub async fn kick(&self, uid: &str, target: &str) -> HubResult<()> {
        let (room_ref, room_id) = self.hosted_room(uid, "kick users").await?;
        let (host_name, target_name) = {
            let mut room = self.lock_checked(&room_ref, uid, target, "kick users").await?;
            let (host_name, target_name) = {
                let users = self.users.read().await;
                let name = |id: &str| users.get(id).map(|u| u.name.clone()).unwrap_or_default();
                let (host_name, target_name) = (name(uid), name(target));
                self.deliver_to(&users, target, &json!({ "type": "kicked", "room_id": room_id, "kicked_by": host_name }));
                (host_name, target_name)
            };

            self.depart(&mut room, target, true).await;

            let users = self.users.read().await;
            let now = Utc::now().timestamp_millis() as f64 / 1000.0;
            for msg in [
                json!({ "type": "video_call_ended", "user_id": target, "reason": "kicked" }),
                json!({
                    "type": "video_call_event",
                    "event_type": "participant_left",
                    "data": { "userId": target, "reason": "kicked" },
                    "user_id": target,
                    "room_id": room_id,
                    "timestamp": now,
                }),
                json!({
                    "type": "user_kicked",
                    "user_id": target,
                    "user_name": target_name,
                    "kicked_by": host_name,
                    "room": room.summary(),
                }),
            ] {
                self.deliver(&users, &room.members, None, &msg);
            }
            (host_name, target_name)
        };

        let chat_ids = self.chat_ids_of(target).await;
        let linked: Vec<&str> = chat_ids.iter().map(String::as_str).collect();
        let note = ChatMessage::system(&room_id, format!("{target_name} was kicked from the room by {host_name}"));
        self.chat_evict(&room_id, &linked, note).await;

        if let Some(user) = self.users.read().await.get(target) {
            let _ = user.tx.send(Outbound::Close);
        }
        let chat_users = self.chat_users.read().await;
        for user in chat_ids.iter().filter_map(|id| chat_users.get(id)) {
            let _ = user.tx.send(Outbound::Close);
        }
        drop(chat_users);
        info!(user = %target, room = %room_id, host = %uid, "user kicked");
        Ok(())
    }

    /// Relays a mute/unmute directive to the target only. The target's
    /// client enforces it; no server state changes.
    pub async fn mute_command(&self, uid: &str, target: &str, channel: MuteChannel, action: MuteAction) -> HubResult<()> {
        let (room_ref, _) = self.hosted_room(uid, "mute users").await?;
        let _room = self.lock_checked(&room_ref, uid, target, "mute users").await?;
        let users = self.users.read().await;
        let host_name = users.get(uid).map(|u| u.name.clone()).unwrap_or_default();
        self.deliver_to(&users, target, &json!({
            "type": "host_mute_command",
            "mute_type": channel.as_str(),
            "action": action.as_str(),
            "host_name": host_name,
        }));
        info!(host = %uid, user = %target, action = action.as_str(), channel = channel.as_str(), "mute command relayed");
        Ok(())
    }

    pub async fn broadcast_control(&self, uid: &str, enabled: bool) -> HubResult<()> {
        let (room_ref, _) = self.hosted_room(uid, "control broadcast mode").await?;
        let mut room = room_ref.lock().await;
        if room.host_id != uid {
            return Err(HubError::NotHost("control broadcast mode"));
        }
        room.broadcast_enabled = enabled;
        if !enabled {
            room.broadcast_pdf = None;
        }
        let users = self.users.read().await;
        let msg = json!({
            "type": "host_broadcast_state",
            "enabled": enabled,
            "host_id": uid,
            "pdf": room.broadcast_pdf,
        });
        self.deliver(&users, &room.members, None, &msg);
        info!(room = %room.id, enabled, "broadcast mode toggled");
        Ok(())
    }

    /// Mirrors a host's AI conversation entry to the rest of the room.
    pub async fn broadcast_ai_message(&self, uid: &str, message: Value) -> HubResult<()> {
        if message.is_null() {
            return Err(invalid("Empty broadcast message"));
        }
        let (room_ref, _) = self.hosted_room(uid, "broadcast").await?;
        let room = room_ref.lock().await;
        if room.host_id != uid {
            return Err(HubError::NotHost("broadcast"));
        }
        if !room.broadcast_enabled {
            return Err(HubError::BroadcastDisabled);
        }
        let users = self.users.read().await;
        let msg = json!({ "type": "host_broadcast_ai_message", "host_id": uid, "message": message });
        self.deliver(&users, &room.members, Some(uid), &msg);
        Ok(())
    }

    pub async fn broadcast_pdf(&self, uid: &str, action: PdfAction, data: Value) -> HubResult<()> {
        let (room_ref, _) = self.hosted_room(uid, "broadcast").await?;
        let mut room = room_ref.lock().await;
        if room.host_id != uid {
            return Err(HubError::NotHost("broadcast"));
        }
        if !room.broadcast_enabled {
            return Err(HubError::BroadcastDisabled);
        }
        match action {
            PdfAction::Load => {
                let pdf: BroadcastPdf = serde_json::from_value(data.clone()).map_err(invalid)?;
                room.broadcast_pdf = Some(pdf);
            }
            PdfAction::PageChange => {
                if let Some(pdf) = room.broadcast_pdf.as_mut() {
                    let page = data.get("current_page").and_then(Value::as_u64);
                    pdf.current_page = page.and_then(|p| u32::try_from(p).ok());
                    pdf.timestamp = data.get("timestamp").and_then(Value::as_f64);
                }
            }
            PdfAction::Close => room.broadcast_pdf = None,
        }
        let users = self.users.read().await;
        let msg = json!({ "type": "host_broadcast_pdf", "host_id": uid, "action": action.as_str(), "data": data });
        self.deliver(&users, &room.members, Some(uid), &msg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::testkit::*;

    #[tokio::test]
    async fn kick_notifies_everyone_and_cleans_up_chat() {
        let hub = hub();
        let mut a = canvas_peer(&hub, "A").await;
        let mut b = canvas_peer(&hub, "B").await;
        let mut c = canvas_peer(&hub, "C").await;
        let room = room_with(&hub, &mut [&mut a, &mut b, &mut c]).await;

        let mut b_chat = chat_peer(&hub, "B", Some(&b.id)).await;
        let mut c_chat = chat_peer(&hub, "C", Some(&c.id)).await;
        hub.chat_join(&b_chat.id, &room).await.unwrap();
        hub.chat_join(&c_chat.id, &room).await.unwrap();
        b_chat.drain();
        c_chat.drain();

        hub.kick(&a.id, &c.id).await.unwrap();

        // C saw `kicked` before the socket was told to close
        let mut c_saw = Vec::new();
        let mut closed_after_kicked = false;
        while let Ok(out) = c.rx.try_recv() {
            match out {
                Outbound::Text(t) => c_saw.push(serde_json::from_str::<Value>(&t).unwrap()),
                Outbound::Close => closed_after_kicked = of_type(&c_saw, "kicked").len() == 1,
            }
        }
        assert!(closed_after_kicked);
        assert!(c_chat.closed());

        let b_saw = b.drain();
        assert_eq!(of_type(&b_saw, "user_kicked")[0]["user_id"], c.id.as_str());
        assert_eq!(of_type(&b_saw, "video_call_event")[0]["event_type"], "participant_left");
        assert!(of_type(&b_saw, "user_left").is_empty());
        assert!(!of_type(&b_saw, "user_kicked")[0]["room"].to_string().contains(&c.id));

        let r = hub.room(&room).await.unwrap();
        assert!(!r.lock().await.is_member(&c.id));
        let chat = hub.chat_room(&room).await.unwrap();
        let chat = chat.lock().await;
        assert_eq!(chat.members, vec![b_chat.id.clone()]);
        let last = chat.messages.back().unwrap();
        assert_eq!(last.content, "C was kicked from the room by A");

        let b_chat_saw = b_chat.drain();
        assert_eq!(of_type(&b_chat_saw, "message")[0]["data"]["type"], "system");
    }

    #[tokio::test]
    async fn only_the_host_can_kick_and_never_themselves() {
        let hub = hub();
        let mut a = canvas_peer(&hub, "A").await;
        let mut c = canvas_peer(&hub, "C").await;
        let mut d = canvas_peer(&hub, "D").await;
        let room = room_with(&hub, &mut [&mut a, &mut c, &mut d]).await;

        assert_eq!(hub.kick(&d.id, &c.id).await, Err(HubError::NotHost("kick users")));
        assert_eq!(hub.kick(&a.id, &a.id).await, Err(HubError::SelfTarget));

        let outsider = canvas_peer(&hub, "O").await;
        assert_eq!(hub.kick(&a.id, &outsider.id).await, Err(HubError::TargetNotInRoom));
        assert_eq!(hub.kick(&a.id, "ghost").await, Err(HubError::UserNotFound));

        let r = hub.room(&room).await.unwrap();
        let r = r.lock().await;
        assert_eq!(r.members.len(), 3);
        assert_eq!(r.host_id, a.id);
        assert!(c.drain().is_empty());
    }

    #[tokio::test]
    async fn transfer_moves_host_and_resets_broadcast() {
        let hub = hub();
        let mut a = canvas_peer(&hub, "A").await;
        let mut b = canvas_peer(&hub, "B").await;
        let room = room_with(&hub, &mut [&mut a, &mut b]).await;
        hub.broadcast_control(&a.id, true).await.unwrap();
        hub.broadcast_pdf(&a.id, PdfAction::Load, json!({ "pdf_name": "x.pdf", "current_page": 1, "total_pages": 3 }))
            .await
            .unwrap();

        assert_eq!(hub.transfer_host(&b.id, &a.id).await, Err(HubError::NotHost("transfer host privileges")));
        assert_eq!(hub.transfer_host(&a.id, &b.id).await.as_deref(), Ok("B"));

        let r = hub.room(&room).await.unwrap();
        {
            let r = r.lock().await;
            assert_eq!(r.host_id, b.id);
            assert!(!r.broadcast_enabled);
            assert!(r.broadcast_pdf.is_none());
        }
        let a_saw = a.drain();
        assert_eq!(of_type(&a_saw, "host_transferred")[0]["new_host_id"], b.id.as_str());
        let resets: Vec<_> = of_type(&a_saw, "host_broadcast_state").into_iter().filter(|m| m["enabled"] == false).collect();
        assert_eq!(resets.len(), 1);
        assert_eq!(resets[0]["host_id"], b.id.as_str());
        assert_eq!(hub.kick(&a.id, &b.id).await, Err(HubError::NotHost("kick users")));
    }

    #[tokio::test]
    async fn mute_goes_to_target_only() {
        let hub = hub();
        let mut a = canvas_peer(&hub, "A").await;
        let mut b = canvas_peer(&hub, "B").await;
        let mut c = canvas_peer(&hub, "C").await;
        room_with(&hub, &mut [&mut a, &mut b, &mut c]).await;

        hub.mute_command(&a.id, &b.id, MuteChannel::Audio, MuteAction::Mute).await.unwrap();
        let got = b.drain();
        assert_eq!(got[0]["type"], "host_mute_command");
        assert_eq!(got[0]["mute_type"], "audio");
        assert_eq!(got[0]["host_name"], "A");
        assert!(c.drain().is_empty());

        assert_eq!(
            hub.mute_command(&b.id, &c.id, MuteChannel::Video, MuteAction::Mute).await,
            Err(HubError::NotHost("mute users"))
        );
    }

    #[tokio::test]
    async fn pdf_broadcast_needs_broadcast_mode() {
        let hub = hub();
        let mut a = canvas_peer(&hub, "A").await;
        let mut b = canvas_peer(&hub, "B").await;
        let room = room_with(&hub, &mut [&mut a, &mut b]).await;

        assert_eq!(
            hub.broadcast_pdf(&a.id, PdfAction::Load, json!({ "pdf_name": "a.pdf" })).await,
            Err(HubError::BroadcastDisabled)
        );
        hub.broadcast_control(&a.id, true).await.unwrap();
        hub.broadcast_pdf(&a.id, PdfAction::Load, json!({ "pdf_name": "a.pdf", "current_page": 1, "total_pages": 4 }))
            .await
            .unwrap();
        hub.broadcast_pdf(&a.id, PdfAction::PageChange, json!({ "current_page": 3, "timestamp": 17.0 }))
            .await
            .unwrap();
        {
            let r = hub.room(&room).await.unwrap();
            let r = r.lock().await;
            let pdf = r.broadcast_pdf.as_ref().unwrap();
            assert_eq!(pdf.current_page, Some(3));
            assert_eq!(pdf.total_pages, Some(4));
        }
        let b_saw = b.drain();
        assert_eq!(of_type(&b_saw, "host_broadcast_pdf").len(), 2);
        assert!(of_type(&a.drain(), "host_broadcast_pdf").is_empty());

        hub.broadcast_ai_message(&a.id, json!({ "role": "model", "text": "42" })).await.unwrap();
        assert_eq!(of_type(&b.drain(), "host_broadcast_ai_message")[0]["message"]["text"], "42");

        hub.broadcast_control(&a.id, false).await.unwrap();
        let r = hub.room(&room).await.unwrap();
        assert!(r.lock().await.broadcast_pdf.is_none());
        assert_eq!(
            hub.broadcast_control(&b.id, true).await,
            Err(HubError::NotHost("control broadcast mode"))
        );
    }

    #[tokio::test]
    async fn out_of_range_page_is_dropped_not_wrapped() {
        let hub = hub();
        let mut a = canvas_peer(&hub, "A").await;
        let mut b = canvas_peer(&hub, "B").await;
        let room = room_with(&hub, &mut [&mut a, &mut b]).await;
        hub.broadcast_control(&a.id, true).await.unwrap();
        hub.broadcast_pdf(&a.id, PdfAction::Load, json!({ "pdf_name": "a.pdf", "current_page": 2 }))
            .await
            .unwrap();

        let huge = u64::from(u32::MAX) + 5;
        hub.broadcast_pdf(&a.id, PdfAction::PageChange, json!({ "current_page": huge })).await.unwrap();
        let r = hub.room(&room).await.unwrap();
        assert_eq!(r.lock().await.broadcast_pdf.as_ref().unwrap().current_page, None);
    }
}

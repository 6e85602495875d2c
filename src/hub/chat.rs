use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{ChatRoomRef, Hub};
use crate::{
    error::{invalid, HubError, HubResult},
    state::{ChatMessage, ChatRoom, ChatUser, ConnId, Tx, UploadedFile},
    utils::ids,
};

fn envelope(msg: &ChatMessage) -> Value {
    json!({ "type": "message", "data": msg })
}

impl Hub {
    /// Registers a chat identity. Every registration gets a fresh id; when
    /// `link` names a live canvas user it is only remembered as
    /// `canvas_id`, so a kick can reach this connection too.
    pub async fn chat_register(&self, conn: ConnId, tx: Tx, display_name: &str, link: Option<&str>) -> String {
        self.chat_unregister(conn).await;

        let canvas_id = match link {
            Some(uid) if self.users.read().await.contains_key(uid) => Some(uid.to_string()),
            _ => None,
        };
        let id = ids::new_id();
        let linked = canvas_id.is_some();

        let user = ChatUser {
            id: id.clone(),
            display_name: display_name.to_string(),
            conn,
            tx,
            room_id: None,
            canvas_id,
            connected_at: Utc::now(),
        };
        self.chat_users.write().await.insert(id.clone(), user);
        self.chat_conns.write().await.insert(conn, id.clone());
        info!(user = %id, %display_name, linked, "chat user registered");
        id
    }

    /// Chat ids whose connection is linked to canvas user `canvas_id`.
    pub(super) async fn chat_ids_of(&self, canvas_id: &str) -> Vec<String> {
        self.chat_users
            .read()
            .await
            .values()
            .filter(|u| u.canvas_id.as_deref() == Some(canvas_id))
            .map(|u| u.id.clone())
            .collect()
    }

    pub async fn chat_unregister(&self, conn: ConnId) {
        let Some(uid) = self.chat_conns.write().await.remove(&conn) else { return };
        let user = {
            let mut users = self.chat_users.write().await;
            let mine = users.get(&uid).is_some_and(|u| u.conn == conn);
            if mine {
                users.remove(&uid)
            } else {
                None
            }
        };
        let Some(user) = user else { return };
        if let Some(room_id) = user.room_id.as_deref() {
            let note = ChatMessage::system(room_id, format!("{} disconnected", user.display_name));
            self.chat_evict(room_id, &[uid.as_str()], note).await;
        }
        let online = (Utc::now() - user.connected_at).num_seconds();
        info!(user = %uid, online_secs = online, "chat user unregistered");
    }

    fn chat_sender(users: &std::collections::HashMap<String, ChatUser>, uid: &str) -> HubResult<ChatUser> {
        users.get(uid).cloned().ok_or(HubError::NotRegistered)
    }

    /// Chat room the user is in, locked.
    async fn my_chat_room(&self, uid: &str) -> HubResult<(ChatUser, ChatRoomRef)> {
        let user = Self::chat_sender(&*self.chat_users.read().await, uid)?;
        let room_id = user.room_id.clone().ok_or(HubError::NotInRoom)?;
        let room = self.chat_room(&room_id).await.ok_or(HubError::NotInRoom)?;
        Ok((user, room))
    }

    /// Joins (creating on first use) the chat room keyed like the canvas
    /// room. The joiner gets an ack and the recent history; everyone else a
    /// system notice.
    pub async fn chat_join(&self, uid: &str, room_id: &str) -> HubResult<String> {
        let room_id = room_id.trim().to_uppercase();
        if room_id.is_empty() {
            return Err(invalid("Room ID is required"));
        }
        let user = Self::chat_sender(&*self.chat_users.read().await, uid)?;
        if let Some(prev) = user.room_id.as_deref().filter(|r| *r != room_id) {
            let note = ChatMessage::system(prev, format!("{} left the room", user.display_name));
            self.chat_evict(prev, &[uid], note).await;
        }

        loop {
            let room_ref = {
                let mut rooms = self.chat_rooms.write().await;
                rooms
                    .entry(room_id.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(ChatRoom::new(room_id.clone()))))
                    .clone()
            };
            let mut room = room_ref.lock().await;
            if room.closed {
                // reaped between lookup and lock; go round for a fresh one
                drop(room);
                self.forget_chat_room(&room_id, &room_ref).await;
                continue;
            }
            match self.chat_users.write().await.get_mut(uid) {
                Some(me) => me.room_id = Some(room_id.clone()),
                None => {
                    // unregistered meanwhile; a room created for it must still age out
                    if room.members.is_empty() && room.empty_since.is_none() {
                        room.empty_since = Some(Utc::now());
                    }
                    return Err(HubError::NotRegistered);
                }
            }
            if !room.members.iter().any(|m| m == uid) {
                room.members.push(uid.to_string());
            }
            if room.empty_since.take().is_some() {
                info!(room = %room_id, "chat room no longer empty, cleanup cancelled");
            }

            let users = self.chat_users.read().await;
            let me = std::iter::once(&user.id);
            self.deliver_chat(&users, me.clone(), None, &json!({ "type": "room_joined", "room_id": room_id, "success": true }));
            let skip = room.messages.len().saturating_sub(self.config.chat_replay);
            for msg in room.messages.iter().skip(skip) {
                self.deliver_chat(&users, me.clone(), None, &envelope(msg));
            }

            let note = ChatMessage::system(&room_id, format!("{} joined the room", user.display_name));
            self.deliver_chat(&users, &room.members, Some(uid), &envelope(&note));
            room.messages.push_back(note);
            info!(user = %uid, room = %room_id, "chat user joined");
            return Ok(room_id);
        }
    }

    pub async fn chat_leave(&self, uid: &str) -> HubResult<()> {
        let user = Self::chat_sender(&*self.chat_users.read().await, uid)?;
        let room_id = user.room_id.ok_or(HubError::NotInRoom)?;
        let note = ChatMessage::system(&room_id, format!("{} left the room", user.display_name));
        self.chat_evict(&room_id, &[uid], note).await;
        Ok(())
    }

    /// Drops `uids` from chat room `room_id` (if the room exists), appends
    /// `note` once and shows it to whoever remains.
    pub(super) async fn chat_evict(&self, room_id: &str, uids: &[&str], note: ChatMessage) {
        {
            let mut users = self.chat_users.write().await;
            for uid in uids {
                if let Some(user) = users.get_mut(*uid) {
                    if user.room_id.as_deref() == Some(room_id) {
                        user.room_id = None;
                    }
                }
            }
        }
        let Some(room_ref) = self.chat_room(room_id).await else { return };
        let mut room = room_ref.lock().await;
        room.members.retain(|m| !uids.contains(&m.as_str()));

        let users = self.chat_users.read().await;
        self.deliver_chat(&users, &room.members, None, &envelope(&note));
        room.messages.push_back(note);

        if room.members.is_empty() && room.empty_since.is_none() {
            room.empty_since = Some(Utc::now());
            info!(room = %room_id, "chat room empty, marked for cleanup");
        }
    }

    /// Appends a user message and fans it out to every member, sender included.
    pub async fn send_message(&self, uid: &str, content: &str, reply_to: Option<Value>) -> HubResult<ChatMessage> {
        let content = content.trim();
        if content.is_empty() {
            return Err(invalid("Message is empty"));
        }
        let (user, room_ref) = self.my_chat_room(uid).await?;
        let mut room = room_ref.lock().await;
        let msg = ChatMessage::user(&room.id, &user, content.to_string(), reply_to.filter(|r| !r.is_null()));

        let users = self.chat_users.read().await;
        self.deliver_chat(&users, &room.members, None, &envelope(&msg));
        room.messages.push_back(msg.clone());
        Ok(msg)
    }

    /// Stores a base64 upload and posts a `file` message pointing at it.
    pub async fn upload_file(&self, uid: &str, data: &str, name: &str, mime: &str) -> HubResult<UploadedFile> {
        if data.is_empty() || name.trim().is_empty() {
            return Err(invalid("File data and name are required"));
        }
        let payload = data.split_once("base64,").map_or(data, |(_, b64)| b64);
        if BASE64.decode(payload).is_err() {
            return Err(invalid("File data is not valid base64"));
        }
        let (user, room_ref) = self.my_chat_room(uid).await?;
        let mut room = room_ref.lock().await;

        let file = UploadedFile {
            id: ids::new_id(),
            name: name.to_string(),
            mime: if mime.is_empty() { "application/octet-stream".into() } else { mime.to_string() },
            data: payload.to_string(),
            uploaded_by: uid.to_string(),
            uploaded_at: Utc::now(),
            room_id: room.id.clone(),
        };
        self.files.write().await.insert(file.id.clone(), file.clone());

        let msg = ChatMessage::file(&room.id, &user, &file);
        let users = self.chat_users.read().await;
        self.deliver_chat(&users, &room.members, None, &envelope(&msg));
        room.messages.push_back(msg);
        info!(user = %uid, room = %room.id, file = %file.name, "file uploaded");
        Ok(file)
    }

    pub async fn edit_message(&self, uid: &str, message_id: &str, new_content: &str) -> HubResult<()> {
        let new_content = new_content.trim();
        if message_id.is_empty() || new_content.is_empty() {
            return Err(invalid("Invalid edit request"));
        }
        let (user, room_ref) = self.my_chat_room(uid).await?;
        let mut room = room_ref.lock().await;
        let msg = room.find_mut(message_id).ok_or(HubError::MessageNotFound)?;
        if msg.sender_id.as_deref() != Some(uid) {
            warn!(user = %uid, message = %message_id, "unauthorized edit attempt");
            return Err(HubError::NotAuthor("edit"));
        }
        let now = Utc::now();
        msg.content = new_content.to_string();
        msg.edited = true;
        msg.edited_at = Some(now);

        let notice = json!({
            "type": "message_edited",
            "message_id": message_id,
            "new_content": new_content,
            "sender_name": user.display_name,
            "edited_at": now,
        });
        let users = self.chat_users.read().await;
        self.deliver_chat(&users, &room.members, None, &notice);
        Ok(())
    }

    /// Marks a message deleted; it stays in the log.
    pub async fn delete_message(&self, uid: &str, message_id: &str) -> HubResult<()> {
        if message_id.is_empty() {
            return Err(invalid("Invalid delete request"));
        }
        let (user, room_ref) = self.my_chat_room(uid).await?;
        let mut room = room_ref.lock().await;
        let msg = room.find_mut(message_id).ok_or(HubError::MessageNotFound)?;
        if msg.sender_id.as_deref() != Some(uid) {
            warn!(user = %uid, message = %message_id, "unauthorized delete attempt");
            return Err(HubError::NotAuthor("delete"));
        }
        let now = Utc::now();
        msg.deleted = true;
        msg.deleted_at = Some(now);

        let notice = json!({
            "type": "message_deleted",
            "message_id": message_id,
            "sender_name": user.display_name,
            "deleted_at": now,
        });
        let users = self.chat_users.read().await;
        self.deliver_chat(&users, &room.members, None, &notice);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hub::testkit::*, state::MessageKind};

    #[tokio::test]
    async fn join_replays_recent_history() {
        let hub = hub();
        let mut a = chat_peer(&hub, "A", None).await;
        hub.chat_join(&a.id, "r1").await.unwrap();
        for i in 0..60 {
            hub.send_message(&a.id, &format!("m{i}"), None).await.unwrap();
        }
        a.drain();

        let mut b = chat_peer(&hub, "B", None).await;
        assert_eq!(hub.chat_join(&b.id, "r1").await.as_deref(), Ok("R1"));
        let got = b.drain();
        assert_eq!(got[0]["type"], "room_joined");
        let replay = of_type(&got, "message");
        assert_eq!(replay.len(), 50);
        assert_eq!(replay.last().unwrap()["data"]["content"], "m59");

        let notice = a.drain();
        assert_eq!(notice[0]["data"]["content"], "B joined the room");
        assert_eq!(notice[0]["data"]["type"], "system");
        assert!(notice[0]["data"].get("sender_id").is_none());
    }

    #[tokio::test]
    async fn messages_fan_out_to_everyone_including_sender() {
        let hub = hub();
        let mut a = chat_peer(&hub, "A", None).await;
        let mut b = chat_peer(&hub, "B", None).await;
        hub.chat_join(&a.id, "R1").await.unwrap();
        hub.chat_join(&b.id, "R1").await.unwrap();
        a.drain();
        b.drain();

        hub.send_message(&a.id, "  hi  ", Some(json!({ "id": "x" }))).await.unwrap();
        for p in [&mut a, &mut b] {
            let got = p.drain();
            assert_eq!(got[0]["data"]["content"], "hi");
            assert_eq!(got[0]["data"]["replyTo"]["id"], "x");
            assert_eq!(got[0]["data"]["sender_name"], "A");
        }
        assert_eq!(hub.send_message(&a.id, "   ", None).await.unwrap_err(), invalid("Message is empty"));
    }

    #[tokio::test]
    async fn only_the_sender_can_edit_or_delete() {
        let hub = hub();
        let mut a = chat_peer(&hub, "A", None).await;
        let mut b = chat_peer(&hub, "B", None).await;
        hub.chat_join(&a.id, "R1").await.unwrap();
        hub.chat_join(&b.id, "R1").await.unwrap();
        let msg = hub.send_message(&a.id, "original", None).await.unwrap();
        a.drain();
        b.drain();

        assert_eq!(hub.edit_message(&b.id, &msg.id, "hacked").await, Err(HubError::NotAuthor("edit")));
        assert_eq!(hub.delete_message(&b.id, &msg.id).await, Err(HubError::NotAuthor("delete")));
        assert_eq!(hub.edit_message(&a.id, "missing", "x").await, Err(HubError::MessageNotFound));
        assert!(a.drain().is_empty());

        let room = hub.chat_room("R1").await.unwrap();
        {
            let room = room.lock().await;
            let m = room.messages.iter().find(|m| m.id == msg.id).unwrap();
            assert_eq!(m.content, "original");
            assert!(!m.edited && !m.deleted);
        }

        hub.edit_message(&a.id, &msg.id, "fixed").await.unwrap();
        hub.delete_message(&a.id, &msg.id).await.unwrap();
        let seen = b.drain();
        assert_eq!(seen[0]["type"], "message_edited");
        assert_eq!(seen[0]["new_content"], "fixed");
        assert_eq!(seen[1]["type"], "message_deleted");

        let room = room.lock().await;
        let m = room.messages.iter().find(|m| m.id == msg.id).unwrap();
        assert!(m.edited && m.deleted);
        assert_eq!(m.content, "fixed");
    }

    #[tokio::test]
    async fn upload_stores_file_and_posts_file_message() {
        let hub = hub();
        let mut a = chat_peer(&hub, "A", None).await;
        hub.chat_join(&a.id, "R1").await.unwrap();
        a.drain();

        assert!(hub.upload_file(&a.id, "%%%", "x.txt", "text/plain").await.is_err());
        let file = hub.upload_file(&a.id, "aGVsbG8=", "hello.txt", "text/plain").await.unwrap();
        assert_eq!(hub.file(&file.id).await.unwrap().room_id, "R1");

        let got = a.drain();
        let data = &got[0]["data"];
        assert_eq!(data["type"], "file");
        assert_eq!(data["file_id"], file.id.as_str());
        assert_eq!(data["content"], "📎 hello.txt");
    }

    #[tokio::test]
    async fn leaving_posts_system_message_and_marks_empty() {
        let hub = hub();
        let mut a = chat_peer(&hub, "A", None).await;
        let mut b = chat_peer(&hub, "B", None).await;
        hub.chat_join(&a.id, "R1").await.unwrap();
        hub.chat_join(&b.id, "R1").await.unwrap();
        a.drain();

        hub.chat_leave(&b.id).await.unwrap();
        assert_eq!(a.drain()[0]["data"]["content"], "B left the room");
        assert_eq!(hub.chat_leave(&b.id).await, Err(HubError::NotInRoom));

        hub.chat_unregister(a.conn).await;
        let room = hub.chat_room("R1").await.unwrap();
        let room = room.lock().await;
        assert!(room.members.is_empty());
        assert!(room.empty_since.is_some());
        assert_eq!(room.messages.back().unwrap().kind, MessageKind::System);
        assert_eq!(room.messages.back().unwrap().content, "A disconnected");
        b.drain();
    }

    #[tokio::test]
    async fn link_is_recorded_only_for_live_canvas_users() {
        let hub = hub();
        let canvas = canvas_peer(&hub, "A").await;
        let linked = chat_peer(&hub, "A", Some(&canvas.id)).await;
        assert_ne!(linked.id, canvas.id);
        let unlinked = chat_peer(&hub, "Z", Some("nobody")).await;
        assert_ne!(unlinked.id, "nobody");

        assert_eq!(hub.chat_ids_of(&canvas.id).await, vec![linked.id.clone()]);
        assert!(hub.chat_ids_of("nobody").await.is_empty());
    }

    #[tokio::test]
    async fn linking_to_someone_elses_canvas_id_grants_no_authorship() {
        let hub = hub();
        let canvas = canvas_peer(&hub, "A").await;
        let mut a = chat_peer(&hub, "A", Some(&canvas.id)).await;
        hub.chat_join(&a.id, "R1").await.unwrap();
        let msg = hub.send_message(&a.id, "mine", None).await.unwrap();

        let other = chat_peer(&hub, "M", Some(&canvas.id)).await;
        assert_ne!(other.id, a.id);
        hub.chat_join(&other.id, "R1").await.unwrap();

        assert_eq!(hub.edit_message(&other.id, &msg.id, "changed").await, Err(HubError::NotAuthor("edit")));
        assert_eq!(hub.delete_message(&other.id, &msg.id).await, Err(HubError::NotAuthor("delete")));

        // the original connection is still registered and still the author
        assert!(!a.closed());
        hub.edit_message(&a.id, &msg.id, "still mine").await.unwrap();
        let room = hub.chat_room("R1").await.unwrap();
        let room = room.lock().await;
        let m = room.messages.iter().find(|m| m.id == msg.id).unwrap();
        assert_eq!(m.content, "still mine");
        assert_eq!(room.members.len(), 2);
    }
}

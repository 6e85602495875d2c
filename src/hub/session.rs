use chrono::Utc;
use serde_json::json;
use tracing::info;

use super::Hub;
use crate::{
    error::{HubError, HubResult},
    state::{ConnId, Tx, User},
    utils::ids,
};

impl Hub {
    /// Registers a canvas participant on `conn` and returns its fresh id.
    /// A connection that registers again drops its previous identity first.
    pub async fn register(&self, conn: ConnId, tx: Tx, name: &str) -> String {
        self.unregister(conn).await;

        let id = ids::new_id();
        let user = User {
            id: id.clone(),
            name: name.to_string(),
            conn,
            tx,
            room_id: None,
            cursor: (0.0, 0.0),
            last_seen: Utc::now(),
        };
        self.users.write().await.insert(id.clone(), user);
        self.conns.write().await.insert(conn, id.clone());
        info!(user = %id, %name, "user registered");
        id
    }

    /// Leaves the current room (if any) and forgets the connection.
    /// Unknown connections are a no-op.
    pub async fn unregister(&self, conn: ConnId) {
        let Some(uid) = self.conns.write().await.remove(&conn) else { return };

        self.leave_room(&uid, false).await;
        let removed = self.users.write().await.remove(&uid);

        // a room that admitted the user after the leave still lists it
        let late = removed.and_then(|u| u.room_id);
        if let Some(room_ref) = self.room_ref_of(late.as_deref()).await {
            let mut room = room_ref.lock().await;
            if room.is_member(&uid) {
                self.depart(&mut room, &uid, false).await;
            }
        }
        info!(user = %uid, "user unregistered");
    }

    pub async fn user_name(&self, uid: &str) -> Option<String> {
        self.users.read().await.get(uid).map(|u| u.name.clone())
    }

    pub async fn current_room(&self, uid: &str) -> Option<String> {
        self.users.read().await.get(uid).and_then(|u| u.room_id.clone())
    }

    pub async fn update_name(&self, uid: &str, new_name: &str) -> HubResult<()> {
        let (old_name, room_id) = {
            let mut users = self.users.write().await;
            let user = users.get_mut(uid).ok_or(HubError::NotRegistered)?;
            let old = std::mem::replace(&mut user.name, new_name.to_string());
            (old, user.room_id.clone())
        };
        info!(user = %uid, %old_name, %new_name, "name changed");

        let Some(room) = self.room_ref_of(room_id.as_deref()).await else { return Ok(()) };
        let room = room.lock().await;
        let users = self.users.read().await;
        let Some(user) = users.get(uid) else { return Ok(()) };
        let msg = json!({
            "type": "user_name_updated",
            "user_id": uid,
            "old_name": old_name,
            "new_name": new_name,
            "user": user.info(),
        });
        self.deliver(&users, &room.members, Some(uid), &msg);
        Ok(())
    }

    /// Stores the cursor and relays it to the rest of the room.
    pub async fn cursor_move(&self, uid: &str, x: f64, y: f64) {
        let room_id = self.current_room(uid).await;
        let Some(room) = self.room_ref_of(room_id.as_deref()).await else { return };
        let room = room.lock().await;
        if !room.is_member(uid) {
            return;
        }
        {
            let mut users = self.users.write().await;
            if let Some(user) = users.get_mut(uid) {
                user.cursor = (x, y);
                user.last_seen = Utc::now();
            }
        }
        let users = self.users.read().await;
        let msg = json!({ "type": "cursor_move", "user_id": uid, "x": x, "y": y });
        self.deliver(&users, &room.members, Some(uid), &msg);
    }

    pub(super) async fn room_ref_of(&self, room_id: Option<&str>) -> Option<super::RoomRef> {
        match room_id {
            Some(id) => self.room(id).await,
            None => None,
        }
    }
}

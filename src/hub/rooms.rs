use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{Hub, RoomRef};
use crate::{
    error::{HubError, HubResult},
    state::{CanvasState, Room, User},
    utils::ids,
};

/// Why a rejoining user is handed host authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostChange {
    /// The room's creator came back and claims host back.
    CreatorRestored,
    /// Nobody present holds host, so the arriving user takes it.
    Fallback,
}

impl HostChange {
    pub fn reason(self) -> &'static str {
        match self {
            HostChange::CreatorRestored => "original_creator_restoration",
            HostChange::Fallback => "auto_rejoin_restoration",
        }
    }
}

/// Host policy for a user that has just been admitted to `room`.
///
/// The creator rejoining with the host hint always wins host back, even
/// over an interim host. Otherwise the arriving user only becomes host when
/// `present(room.host_id)` says the current host is gone.
pub fn restore_host(
    room: &Room,
    uid: &str,
    was_host: bool,
    present: impl Fn(&str) -> bool,
) -> Option<HostChange> {
    if room.host_id == uid {
        None
    } else if was_host && uid == room.creator_id {
        Some(HostChange::CreatorRestored)
    } else if !present(&room.host_id) {
        Some(HostChange::Fallback)
    } else {
        None
    }
}

#[derive(Clone, Copy)]
enum Ack {
    Created,
    Joined,
}

fn roster(room: &Room, users: &HashMap<String, User>) -> Vec<Value> {
    room.members
        .iter()
        .filter_map(|uid| users.get(uid))
        .map(User::info)
        .collect()
}

impl Hub {
    pub async fn create_room(
        &self,
        uid: &str,
        name: &str,
        max_users: Option<usize>,
        initial: Option<CanvasState>,
    ) -> HubResult<String> {
        if !self.users.read().await.contains_key(uid) {
            return Err(HubError::NotRegistered);
        }
        self.leave_room(uid, false).await;

        let (id, room_ref) = {
            let mut rooms = self.rooms.write().await;
            let id = loop {
                let id = ids::room_code();
                if !rooms.contains_key(&id) {
                    break id;
                }
            };
            let name = if name.trim().is_empty() { format!("Room {id}") } else { name.to_string() };
            let max = max_users.unwrap_or(self.config.default_max_users).max(1);
            let canvas = initial.map(CanvasState::deduped).unwrap_or_default();
            info!(room = %id, user = %uid, objects = canvas.objects.len(), "room created");
            let room: RoomRef = Arc::new(Mutex::new(Room::new(id.clone(), name, max, uid, canvas)));
            rooms.insert(id.clone(), room.clone());
            (id, room)
        };

        // creator claims host even if someone raced in with the fresh code
        let (res, abandoned) = {
            let mut room = room_ref.lock().await;
            let res = self.admit_locked(uid, &mut room, true, Ack::Created).await;
            // the creator vanished mid-create: nobody else can know the code yet
            let abandoned = res.is_err() && room.members.is_empty();
            room.closed |= abandoned;
            (res, abandoned)
        };
        if abandoned {
            self.forget_room(&id, &room_ref).await;
            warn!(room = %id, user = %uid, "room creation abandoned");
        }
        res.map(|()| id)
    }

    /// Moves `uid` into `room_id`. The target room and the user's current
    /// room are locked together (in id order), so a refused join leaves the
    /// user where it was.
    pub async fn join_room(&self, uid: &str, room_id: &str, was_host: bool) -> HubResult<()> {
        let Some(room_ref) = self.room(room_id).await else {
            warn!(user = %uid, room = %room_id, "join of unknown room");
            return Err(HubError::RoomNotFound);
        };
        let current = self
            .users
            .read()
            .await
            .get(uid)
            .ok_or(HubError::NotRegistered)?
            .room_id
            .clone();

        let old = match current.as_deref() {
            Some(old_id) if old_id != room_id => match self.room(old_id).await {
                Some(old_ref) => Some((old_id.to_string(), old_ref)),
                None => {
                    if let Some(user) = self.users.write().await.get_mut(uid) {
                        user.room_id = None;
                    }
                    None
                }
            },
            _ => None,
        };

        let Some((old_id, old_ref)) = old else {
            let mut room = room_ref.lock().await;
            return self.admit_locked(uid, &mut room, was_host, Ack::Joined).await;
        };
        let (mut room, mut prev) = if old_id.as_str() < room_id {
            let prev = old_ref.lock().await;
            (room_ref.lock().await, prev)
        } else {
            let room = room_ref.lock().await;
            (room, old_ref.lock().await)
        };
        if room.closed {
            return Err(HubError::RoomNotFound);
        }
        if !room.is_member(uid) && room.members.len() >= room.max_users {
            return Err(HubError::RoomFull);
        }
        if prev.is_member(uid) {
            self.depart(&mut prev, uid, false).await;
        }
        drop(prev);
        self.admit_locked(uid, &mut room, was_host, Ack::Joined).await
    }

    /// Adds `uid` to the locked room, runs the host policy, and sends the
    /// joiner its ack plus a canvas snapshot before the lock is released, so
    /// no canvas event can slip in between snapshot and delivery.
    async fn admit_locked(&self, uid: &str, room: &mut Room, was_host: bool, ack: Ack) -> HubResult<()> {
        if room.closed {
            return Err(HubError::RoomNotFound);
        }
        if !room.is_member(uid) {
            if room.members.len() >= room.max_users {
                return Err(HubError::RoomFull);
            }
            room.members.push(uid.to_string());
        }
        {
            let mut users = self.users.write().await;
            match users.get_mut(uid) {
                Some(user) => user.room_id = Some(room.id.clone()),
                None => {
                    room.members.retain(|m| m != uid);
                    return Err(HubError::NotRegistered);
                }
            }
        }
        room.last_activity = Utc::now();
        if room.empty_since.take().is_some() {
            info!(room = %room.id, "room no longer empty, cleanup cancelled");
        }

        let users = self.users.read().await;
        let change = restore_host(room, uid, was_host, |id| users.contains_key(id) && room.is_member(id));
        if let Some(change) = change {
            self.set_host(room, &users, uid, change.reason());
        }

        let ack = match ack {
            Ack::Created => json!({
                "type": "room_created",
                "success": true,
                "room_id": room.id,
                "room_name": room.name,
            }),
            Ack::Joined => json!({
                "type": "room_joined",
                "success": true,
                "room_id": room.id,
                "room_name": room.name,
                "host_id": room.host_id,
                "users": room.members.iter().filter_map(|m| users.get(m))
                    .map(|u| json!({ "id": u.id, "name": u.name })).collect::<Vec<_>>(),
            }),
        };
        self.deliver_to(&users, uid, &ack);
        self.deliver_to(&users, uid, &json!({
            "type": "canvas_state",
            "state": room.canvas,
            "room": room.summary(),
            "users": roster(room, &users),
        }));

        if let Some(user) = users.get(uid) {
            let notice = json!({ "type": "user_joined", "user": user.info(), "room": room.summary() });
            self.deliver(&users, &room.members, Some(uid), &notice);
        }
        info!(user = %uid, room = %room.id, "user joined room");
        Ok(())
    }

    /// Removes `uid` from whatever room it is in. No-op when not in one.
    pub async fn leave_room(&self, uid: &str, is_kick: bool) {
        let Some(room_id) = self.current_room(uid).await else { return };
        match self.room(&room_id).await {
            Some(room_ref) => {
                let mut room = room_ref.lock().await;
                self.depart(&mut room, uid, is_kick).await;
            }
            None => {
                if let Some(user) = self.users.write().await.get_mut(uid) {
                    user.room_id = None;
                }
            }
        }
    }

    /// Membership removal on an already locked room.
    pub(super) async fn depart(&self, room: &mut Room, uid: &str, is_kick: bool) {
        room.members.retain(|m| m != uid);
        room.last_activity = Utc::now();
        if let Some(user) = self.users.write().await.get_mut(uid) {
            if user.room_id.as_deref() == Some(room.id.as_str()) {
                user.room_id = None;
            }
        }

        let users = self.users.read().await;
        let was_host = room.host_id == uid;
        if was_host {
            room.broadcast_enabled = false;
            room.broadcast_pdf = None;
            let reset = json!({ "type": "host_broadcast_state", "enabled": false, "host_id": room.host_id, "pdf": null });
            self.deliver(&users, &room.members, None, &reset);
        }
        if !is_kick {
            let notice = json!({ "type": "user_left", "user_id": uid, "room": room.summary() });
            self.deliver(&users, &room.members, None, &notice);
        }

        if let Some(next) = room.members.first().cloned() {
            if was_host {
                self.set_host(room, &users, &next, "host_left");
            }
        } else {
            room.empty_since = Some(Utc::now());
            info!(room = %room.id, grace = ?self.config.grace_period, "room empty, marked for cleanup");
        }
        info!(user = %uid, room = %room.id, kicked = is_kick, "user left room");
    }

    /// Moves host authority and tells every member. An in-progress
    /// broadcast never survives a host change.
    pub(super) fn set_host(&self, room: &mut Room, users: &HashMap<String, User>, new_host: &str, reason: &str) {
        let name_of = |id: &str| users.get(id).map_or_else(|| "Unknown".to_string(), |u| u.name.clone());
        let old_host_name = name_of(&room.host_id);
        room.host_id = new_host.to_string();
        info!(room = %room.id, host = %new_host, %reason, "host changed");

        let notice = json!({
            "type": "host_transferred",
            "new_host_id": new_host,
            "new_host_name": name_of(new_host),
            "old_host_name": old_host_name,
            "reason": reason,
        });
        self.deliver(users, &room.members, None, &notice);

        if room.broadcast_enabled || room.broadcast_pdf.is_some() {
            room.broadcast_enabled = false;
            room.broadcast_pdf = None;
            let reset = json!({ "type": "host_broadcast_state", "enabled": false, "host_id": new_host, "pdf": null });
            self.deliver(users, &room.members, None, &reset);
        }
    }
}

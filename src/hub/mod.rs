//! The collaboration coordinator.
//!
//! `Hub` owns every piece of live state: canvas users, rooms, chat users,
//! chat rooms and uploaded files. Each room sits behind its own mutex so
//! membership, host and canvas mutations of one room are linearised while
//! different rooms never contend.
//!
//! Lock order is always: room map → one room → user map. Nothing takes a
//! room lock while holding a user map write guard.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as SyncMutex, PoisonError},
};

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::{
    config::Config,
    state::{ChatRoom, ChatUser, ConnId, Outbound, Room, UploadedFile, User},
};

mod canvas;
mod chat;
mod moderation;
mod reaper;
mod rooms;
mod session;
mod signal;

pub use moderation::{MuteAction, MuteChannel, PdfAction};

pub type RoomRef = Arc<Mutex<Room>>;
pub type ChatRoomRef = Arc<Mutex<ChatRoom>>;

/// A connection whose outbound channel refused a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stale {
    Canvas(ConnId),
    Chat(ConnId),
}

pub struct Hub {
    pub(crate) config: Arc<Config>,
    users: RwLock<HashMap<String, User>>,
    conns: RwLock<HashMap<ConnId, String>>,
    rooms: RwLock<HashMap<String, RoomRef>>,
    chat_users: RwLock<HashMap<String, ChatUser>>,
    chat_conns: RwLock<HashMap<ConnId, String>>,
    chat_rooms: RwLock<HashMap<String, ChatRoomRef>>,
    files: RwLock<HashMap<String, UploadedFile>>,
    stale: SyncMutex<Vec<Stale>>,
}

impl Hub {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            users: RwLock::default(),
            conns: RwLock::default(),
            rooms: RwLock::default(),
            chat_users: RwLock::default(),
            chat_conns: RwLock::default(),
            chat_rooms: RwLock::default(),
            files: RwLock::default(),
            stale: SyncMutex::default(),
        }
    }

    pub async fn room(&self, room_id: &str) -> Option<RoomRef> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn chat_room(&self, room_id: &str) -> Option<ChatRoomRef> {
        self.chat_rooms.read().await.get(room_id).cloned()
    }

    pub async fn file(&self, file_id: &str) -> Option<UploadedFile> {
        self.files.read().await.get(file_id).cloned()
    }

    pub async fn files(&self) -> Vec<UploadedFile> {
        let mut all: Vec<_> = self.files.read().await.values().cloned().collect();
        all.sort_by_key(|f| f.uploaded_at);
        all
    }

    /// (rooms, canvas users, chat rooms, chat users)
    pub async fn counts(&self) -> (usize, usize, usize, usize) {
        (
            self.rooms.read().await.len(),
            self.users.read().await.len(),
            self.chat_rooms.read().await.len(),
            self.chat_users.read().await.len(),
        )
    }

    /* ---------------- delivery ---------------- */

    /// Sends `msg` to each canvas recipient except `skip`. A refused send is
    /// queued for [`Hub::flush_stale`]; delivery to the others continues.
    fn deliver<'a>(
        &self,
        users: &HashMap<String, User>,
        recipients: impl IntoIterator<Item = &'a String>,
        skip: Option<&str>,
        msg: &Value,
    ) {
        let text = msg.to_string();
        for uid in recipients {
            if Some(uid.as_str()) == skip {
                continue;
            }
            if let Some(user) = users.get(uid) {
                if user.tx.send(Outbound::Text(text.clone())).is_err() {
                    warn!(user = %uid, "canvas send failed, dropping connection");
                    self.mark_stale(Stale::Canvas(user.conn));
                }
            }
        }
    }

    fn deliver_to(&self, users: &HashMap<String, User>, uid: &str, msg: &Value) {
        if let Some(user) = users.get(uid) {
            if user.tx.send(Outbound::Text(msg.to_string())).is_err() {
                warn!(user = %uid, "canvas send failed, dropping connection");
                self.mark_stale(Stale::Canvas(user.conn));
            }
        }
    }

    fn deliver_chat<'a>(
        &self,
        users: &HashMap<String, ChatUser>,
        recipients: impl IntoIterator<Item = &'a String>,
        skip: Option<&str>,
        msg: &Value,
    ) {
        let text = msg.to_string();
        for uid in recipients {
            if Some(uid.as_str()) == skip {
                continue;
            }
            if let Some(user) = users.get(uid) {
                if user.tx.send(Outbound::Text(text.clone())).is_err() {
                    warn!(user = %uid, "chat send failed, dropping connection");
                    self.mark_stale(Stale::Chat(user.conn));
                }
            }
        }
    }

    fn mark_stale(&self, s: Stale) {
        self.stale.lock().unwrap_or_else(PoisonError::into_inner).push(s);
    }

    fn take_stale(&self) -> Vec<Stale> {
        std::mem::take(&mut *self.stale.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Runs the unregister path for every connection that refused a message.
    /// Called once the current operation has released its locks; loops
    /// because unregistering can itself surface more dead peers.
    pub async fn flush_stale(&self) {
        loop {
            let batch = self.take_stale();
            if batch.is_empty() {
                break;
            }
            for s in batch {
                match s {
                    Stale::Canvas(conn) => self.unregister(conn).await,
                    Stale::Chat(conn) => self.chat_unregister(conn).await,
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    use std::{sync::Arc, time::Duration};

    use serde_json::Value;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::Hub;
    use crate::{
        config::Config,
        state::{ConnId, Outbound, Rx, Tx},
    };

    pub fn hub() -> Hub {
        Hub::new(Arc::new(Config {
            grace_period: Duration::from_secs(30),
            ..Config::default()
        }))
    }

    /// An in-memory socket: the hub writes into `tx`, the test reads `rx`.
    pub struct Peer {
        pub conn: ConnId,
        pub tx: Tx,
        pub rx: Rx,
        pub id: String,
    }

    impl Peer {
        pub fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self { conn: Uuid::new_v4(), tx, rx, id: String::new() }
        }

        /// Everything queued so far, parsed.
        pub fn drain(&mut self) -> Vec<Value> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                if let Outbound::Text(t) = msg {
                    out.push(serde_json::from_str(&t).expect("hub sent invalid json"));
                }
            }
            out
        }

        pub fn closed(&mut self) -> bool {
            let mut closed = false;
            while let Ok(msg) = self.rx.try_recv() {
                closed |= msg == Outbound::Close;
            }
            closed
        }
    }

    pub fn of_type<'a>(msgs: &'a [Value], ty: &str) -> Vec<&'a Value> {
        msgs.iter().filter(|m| m["type"] == ty).collect()
    }

    pub async fn canvas_peer(hub: &Hub, name: &str) -> Peer {
        let mut p = Peer::new();
        p.id = hub.register(p.conn, p.tx.clone(), name).await;
        p.drain();
        p
    }

    pub async fn chat_peer(hub: &Hub, name: &str, link: Option<&str>) -> Peer {
        let mut p = Peer::new();
        p.id = hub.chat_register(p.conn, p.tx.clone(), name, link).await;
        p.drain();
        p
    }

    /// A creates a room, the rest join it; all inboxes are drained.
    pub async fn room_with(hub: &Hub, peers: &mut [&mut Peer]) -> String {
        let (first, rest) = peers.split_first_mut().expect("at least one peer");
        let room_id = hub
            .create_room(&first.id, "R1", Some(10), None)
            .await
            .expect("create_room");
        for p in rest.iter_mut() {
            hub.join_room(&p.id, &room_id, false).await.expect("join_room");
        }
        first.drain();
        for p in rest.iter_mut() {
            p.drain();
        }
        room_id
    }
}

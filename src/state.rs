use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

/* ------------ connections ------------ */
pub type ConnId = Uuid;

/// What the writer half of a socket is asked to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close,
}

pub type Tx = mpsc::UnboundedSender<Outbound>;
pub type Rx = mpsc::UnboundedReceiver<Outbound>;

/* ------------ canvas participants ------------ */
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub name: String,
    pub conn: ConnId,
    pub tx: Tx,
    pub room_id: Option<String>,
    pub cursor: (f64, f64),
    pub last_seen: DateTime<Utc>,
}

impl User {
    pub fn info(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "room_id": self.room_id,
            "cursor_x": self.cursor.0,
            "cursor_y": self.cursor.1,
            "last_seen": self.last_seen.timestamp_millis(),
        })
    }
}

/* ------------ shared canvas document ------------ */
pub const PATTERN_BACKGROUND: &str = "css_pattern";

pub(crate) fn default_background() -> Value { json!("#ffffff") }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasState {
    #[serde(default)]
    pub objects: Vec<Value>,
    #[serde(default = "default_background")]
    pub background: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<Value>,
}

impl Default for CanvasState {
    fn default() -> Self {
        Self { objects: Vec::new(), background: default_background(), pattern: None }
    }
}

/// Identifier of a canvas object, `None` when absent or null.
pub fn object_id(obj: &Value) -> Option<&Value> {
    obj.get("id").filter(|id| !id.is_null() && *id != "")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastPdf {
    pub pdf_name: Option<String>,
    pub pdf_data: Option<String>,
    pub current_page: Option<u32>,
    pub total_pages: Option<u32>,
    pub timestamp: Option<f64>,
}

/* ------------ collaboration room ------------ */
#[derive(Debug)]
pub struct Room {
    pub id: String,
    pub name: String,
    pub max_users: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub host_id: String,
    pub creator_id: String,
    pub members: Vec<String>,              // join order
    pub canvas: CanvasState,
    pub broadcast_enabled: bool,
    pub broadcast_pdf: Option<BroadcastPdf>,
    pub empty_since: Option<DateTime<Utc>>,
    /// Set by the reaper right before the entry leaves the directory.
    pub closed: bool,
}

impl Room {
    pub fn new(id: String, name: String, max_users: usize, creator: &str, canvas: CanvasState) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            max_users,
            created_at: now,
            last_activity: now,
            host_id: creator.to_string(),
            creator_id: creator.to_string(),
            members: Vec::new(),
            canvas,
            broadcast_enabled: false,
            broadcast_pdf: None,
            empty_since: None,
            closed: false,
        }
    }

    pub fn is_member(&self, uid: &str) -> bool {
        self.members.iter().any(|m| m == uid)
    }

    pub fn summary(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "max_users": self.max_users,
            "created_at": self.created_at.timestamp_millis(),
            "last_activity": self.last_activity.timestamp_millis(),
            "user_count": self.members.len(),
            "host_id": self.host_id,
            "creator_id": self.creator_id,
            "broadcast_enabled": self.broadcast_enabled,
            "broadcast_pdf": self.broadcast_pdf,
        })
    }
}

/* ------------ chat subsystem ------------ */
#[derive(Debug, Clone)]
pub struct ChatUser {
    pub id: String,
    pub display_name: String,
    pub conn: ConnId,
    pub tx: Tx,
    pub room_id: Option<String>,
    /// Canvas user this chat connection belongs to, if any. Only used to
    /// reach the chat presence on kick; never an identity for authorship.
    pub canvas_id: Option<String>,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    System,
    User,
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub room_id: String,
    #[serde(rename = "replyTo", skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub edited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ChatMessage {
    fn base(kind: MessageKind, room_id: &str, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            content,
            sender_id: None,
            sender_name: None,
            timestamp: Utc::now(),
            room_id: room_id.to_string(),
            reply_to: None,
            file_id: None,
            file_name: None,
            file_type: None,
            edited: false,
            edited_at: None,
            deleted: false,
            deleted_at: None,
        }
    }

    pub fn system(room_id: &str, content: String) -> Self {
        Self::base(MessageKind::System, room_id, content)
    }

    pub fn user(room_id: &str, sender: &ChatUser, content: String, reply_to: Option<Value>) -> Self {
        Self {
            sender_id: Some(sender.id.clone()),
            sender_name: Some(sender.display_name.clone()),
            reply_to,
            ..Self::base(MessageKind::User, room_id, content)
        }
    }

    pub fn file(room_id: &str, sender: &ChatUser, file: &UploadedFile) -> Self {
        Self {
            sender_id: Some(sender.id.clone()),
            sender_name: Some(sender.display_name.clone()),
            file_id: Some(file.id.clone()),
            file_name: Some(file.name.clone()),
            file_type: Some(file.mime.clone()),
            ..Self::base(MessageKind::File, room_id, format!("📎 {}", file.name))
        }
    }
}

#[derive(Debug, Default)]
pub struct ChatRoom {
    pub id: String,
    pub members: Vec<String>,
    pub messages: VecDeque<ChatMessage>,
    pub empty_since: Option<DateTime<Utc>>,
    pub closed: bool,
}

impl ChatRoom {
    pub fn new(id: String) -> Self {
        Self { id, ..Default::default() }
    }

    pub fn find_mut(&mut self, message_id: &str) -> Option<&mut ChatMessage> {
        self.messages.iter_mut().find(|m| m.id == message_id)
    }
}

/* ------------ uploaded files ------------ */
#[derive(Debug, Clone, Serialize)]
pub struct UploadedFile {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub mime: String,
    /// base64, as received
    pub data: String,
    pub uploaded_by: String,
    pub uploaded_at: DateTime<Utc>,
    pub room_id: String,
}

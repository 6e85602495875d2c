//! Inbound message shapes for the two WebSocket channels.
//!
//! Every frame is a JSON object tagged by `type`. Missing fields fall back
//! to the same defaults the browser client has always relied on.

use serde::Deserialize;
use serde_json::Value;

use crate::state::CanvasState;

fn anonymous() -> String {
    "Anonymous".into()
}

fn mute() -> String {
    "mute".into()
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanvasMsg {
    Register {
        #[serde(default = "anonymous")]
        name: String,
    },
    CreateRoom {
        #[serde(default)]
        room_name: String,
        max_users: Option<usize>,
        initial_canvas_state: Option<CanvasState>,
    },
    JoinRoom {
        room_id: String,
        #[serde(default)]
        was_host: bool,
    },
    LeaveRoom,
    CanvasEvent {
        #[serde(default)]
        event: Value,
    },
    CursorMove {
        #[serde(default)]
        x: f64,
        #[serde(default)]
        y: f64,
    },
    UpdateName {
        #[serde(default = "anonymous")]
        name: String,
    },
    KickUser {
        #[serde(default)]
        target_user_id: String,
    },
    HostMuteUser {
        #[serde(default)]
        target_user_id: String,
        #[serde(default)]
        mute_type: String,
        #[serde(default = "mute")]
        action: String,
    },
    TransferHost {
        #[serde(default)]
        target_user_id: String,
    },
    HostBroadcastControl {
        #[serde(default)]
        enabled: bool,
    },
    HostBroadcastAiMessage {
        #[serde(default)]
        message: Value,
    },
    HostBroadcastPdf {
        #[serde(default)]
        data: PdfCommand,
    },
    VideoCallStarted {
        user_name: Option<String>,
    },
    VideoCallEnded,
    VideoCallEvent {
        #[serde(default)]
        event_type: Value,
        #[serde(default)]
        data: Value,
        room_id: Option<String>,
    },
    WebrtcSignal {
        #[serde(rename = "toUserId", default)]
        to_user_id: String,
        #[serde(rename = "signalType", default)]
        signal_type: Value,
        #[serde(rename = "signalData", default)]
        signal_data: Value,
    },
    MediaStatus {
        #[serde(default)]
        video_enabled: bool,
        #[serde(default)]
        audio_enabled: bool,
    },
    Ping,
}

#[derive(Debug, Default, Deserialize, PartialEq)]
pub struct PdfCommand {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatMsg {
    Register {
        #[serde(default = "anonymous")]
        display_name: String,
        /// Canvas user id of the same person, so a kick reaches this chat too.
        user_id: Option<String>,
    },
    JoinRoom {
        #[serde(default)]
        room_id: String,
    },
    SendMessage {
        #[serde(default)]
        content: String,
        #[serde(rename = "replyTo")]
        reply_to: Option<Value>,
    },
    UploadFile {
        #[serde(default)]
        file_data: String,
        #[serde(default)]
        file_name: String,
        #[serde(default)]
        file_type: String,
    },
    EditMessage {
        #[serde(default)]
        message_id: String,
        #[serde(default)]
        new_content: String,
    },
    DeleteMessage {
        #[serde(default)]
        message_id: String,
    },
    LeaveRoom,
    Ping,
}

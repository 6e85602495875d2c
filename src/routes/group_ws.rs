use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::stream::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ws::{pump, reply};
use crate::{
    error::HubError,
    hub::Hub,
    protocol::ChatMsg,
    state::{ConnId, Tx},
};

pub fn router() -> Router {
    Router::new().route("/group-ws", get(ws_handler))
}

async fn ws_handler(ws: WebSocketUpgrade, Extension(hub): Extension<Arc<Hub>>) -> impl IntoResponse {
    ws.on_upgrade(move |sock| chat_session(sock, hub))
}

async fn chat_session(sock: WebSocket, hub: Arc<Hub>) {
    let conn = Uuid::new_v4();
    let (tx, rx) = mpsc::unbounded_channel();
    let (sink, mut stream) = sock.split();
    let writer = tokio::spawn(pump(sink, rx));
    info!(%conn, "chat connection opened");

    let mut uid: Option<String> = None;
    while let Some(frame) = stream.next().await {
        let raw = match frame {
            Ok(Message::Text(raw)) => raw,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(%conn, error = %e, "chat socket error");
                break;
            }
        };
        match serde_json::from_str::<ChatMsg>(&raw) {
            Ok(msg) => {
                if let Some(answer) = dispatch(&hub, conn, &tx, &mut uid, msg).await {
                    reply(&tx, answer);
                }
            }
            Err(e) => warn!(%conn, error = %e, "malformed chat message"),
        }
        hub.flush_stale().await;
    }

    hub.chat_unregister(conn).await;
    hub.flush_stale().await;
    writer.abort();
    info!(%conn, user = ?uid, "chat connection closed");
}

fn error(e: HubError) -> Value {
    json!({ "type": "error", "message": e.to_string() })
}

async fn dispatch(hub: &Hub, conn: ConnId, tx: &Tx, uid: &mut Option<String>, msg: ChatMsg) -> Option<Value> {
    if let ChatMsg::Register { display_name, user_id } = &msg {
        let id = hub.chat_register(conn, tx.clone(), display_name, user_id.as_deref()).await;
        *uid = Some(id.clone());
        return Some(json!({ "type": "registered", "user_id": id, "display_name": display_name }));
    }
    if msg == ChatMsg::Ping {
        return Some(json!({ "type": "pong" }));
    }
    let Some(me) = uid.clone() else {
        return Some(error(HubError::NotRegistered));
    };

    let res = match msg {
        ChatMsg::Register { .. } | ChatMsg::Ping => Ok(()),
        ChatMsg::JoinRoom { room_id } => hub.chat_join(&me, &room_id).await.map(drop),
        ChatMsg::SendMessage { content, reply_to } => hub.send_message(&me, &content, reply_to).await.map(drop),
        ChatMsg::UploadFile { file_data, file_name, file_type } => {
            hub.upload_file(&me, &file_data, &file_name, &file_type).await.map(drop)
        }
        ChatMsg::EditMessage { message_id, new_content } => hub.edit_message(&me, &message_id, &new_content).await,
        ChatMsg::DeleteMessage { message_id } => hub.delete_message(&me, &message_id).await,
        ChatMsg::LeaveRoom => {
            let ok = hub.chat_leave(&me).await.is_ok();
            return Some(json!({ "type": "room_left", "success": ok }));
        }
    };
    res.err().map(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::testkit::{canvas_peer, hub, Peer};

    async fn send(hub: &Hub, peer: &Peer, uid: &mut Option<String>, frame: Value) -> Option<Value> {
        let msg: ChatMsg = serde_json::from_value(frame).unwrap();
        dispatch(hub, peer.conn, &peer.tx, uid, msg).await
    }

    #[tokio::test]
    async fn chat_frames_before_register_are_refused() {
        let hub = hub();
        let p = Peer::new();
        let mut uid = None;
        let got = send(&hub, &p, &mut uid, json!({ "type": "send_message", "content": "hi" })).await.unwrap();
        assert_eq!(got, json!({ "type": "error", "message": "Not registered" }));
    }

    #[tokio::test]
    async fn register_always_hands_out_a_fresh_id() {
        let hub = hub();
        let canvas = canvas_peer(&hub, "A").await;
        let p = Peer::new();
        let mut uid = None;
        let frame = json!({ "type": "register", "display_name": "A", "user_id": canvas.id });
        let got = send(&hub, &p, &mut uid, frame).await.unwrap();
        assert_eq!(got["type"], "registered");
        assert_ne!(got["user_id"], canvas.id.as_str());
        assert_eq!(got["user_id"], uid.as_deref().unwrap());
    }

    #[tokio::test]
    async fn leave_reports_whether_there_was_a_room() {
        let hub = hub();
        let mut p = Peer::new();
        let mut uid = None;
        send(&hub, &p, &mut uid, json!({ "type": "register", "display_name": "A" })).await;

        let got = send(&hub, &p, &mut uid, json!({ "type": "leave_room" })).await.unwrap();
        assert_eq!(got, json!({ "type": "room_left", "success": false }));

        assert!(send(&hub, &p, &mut uid, json!({ "type": "join_room", "room_id": "r1" })).await.is_none());
        assert_eq!(p.drain()[0]["type"], "room_joined");
        let got = send(&hub, &p, &mut uid, json!({ "type": "leave_room" })).await.unwrap();
        assert_eq!(got, json!({ "type": "room_left", "success": true }));
    }

    #[tokio::test]
    async fn failed_chat_operations_come_back_as_errors() {
        let hub = hub();
        let (mut a, mut b) = (Peer::new(), Peer::new());
        let (mut ua, mut ub) = (None, None);
        send(&hub, &a, &mut ua, json!({ "type": "register", "display_name": "A" })).await;
        send(&hub, &b, &mut ub, json!({ "type": "register", "display_name": "B" })).await;

        let got = send(&hub, &a, &mut ua, json!({ "type": "join_room", "room_id": "  " })).await.unwrap();
        assert_eq!(got["message"], "Room ID is required");
        let got = send(&hub, &a, &mut ua, json!({ "type": "send_message", "content": "hi" })).await.unwrap();
        assert_eq!(got["message"], "Not in a room");

        send(&hub, &a, &mut ua, json!({ "type": "join_room", "room_id": "R1" })).await;
        send(&hub, &b, &mut ub, json!({ "type": "join_room", "room_id": "R1" })).await;
        assert!(send(&hub, &a, &mut ua, json!({ "type": "send_message", "content": "hello" })).await.is_none());
        a.drain();
        let seen = b.drain();
        let msg_id = seen.iter().rev().find(|m| m["type"] == "message").unwrap()["data"]["id"].clone();

        let frame = json!({ "type": "edit_message", "message_id": msg_id, "new_content": "x" });
        let got = send(&hub, &b, &mut ub, frame).await.unwrap();
        assert_eq!(got, json!({ "type": "error", "message": "Not authorized to edit this message" }));
        let got = send(&hub, &b, &mut ub, json!({ "type": "delete_message", "message_id": msg_id })).await.unwrap();
        assert_eq!(got["message"], "Not authorized to delete this message");
    }
}

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
use futures_util::{
    sink::SinkExt,
    stream::{SplitSink, StreamExt},
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::HubError,
    hub::{Hub, MuteAction, MuteChannel, PdfAction},
    protocol::CanvasMsg,
    state::{ConnId, Outbound, Rx, Tx},
};

pub fn router() -> Router {
    Router::new().route("/ws", get(ws_handler))
}

async fn ws_handler(ws: WebSocketUpgrade, Extension(hub): Extension<Arc<Hub>>) -> impl IntoResponse {
    ws.on_upgrade(move |sock| canvas_session(sock, hub))
}

/// Drains the outbound queue into the socket until the hub asks for a
/// close or the peer goes away.
pub(super) async fn pump(mut sink: SplitSink<WebSocket, Message>, mut rx: Rx) {
    while let Some(out) = rx.recv().await {
        match out {
            Outbound::Text(text) => {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

pub(super) fn reply(tx: &Tx, msg: Value) {
    // a dead writer shows up as a closed stream on the reader side
    let _ = tx.send(Outbound::Text(msg.to_string()));
}

/* ---------------- per connection ---------------- */
async fn canvas_session(sock: WebSocket, hub: Arc<Hub>) {
    let conn = Uuid::new_v4();
    let (tx, rx) = mpsc::unbounded_channel();
    let (sink, mut stream) = sock.split();
    let writer = tokio::spawn(pump(sink, rx));
    info!(%conn, "canvas connection opened");

    let mut uid: Option<String> = None;
    while let Some(frame) = stream.next().await {
        let raw = match frame {
            Ok(Message::Text(raw)) => raw,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(%conn, error = %e, "canvas socket error");
                break;
            }
        };
        match serde_json::from_str::<CanvasMsg>(&raw) {
            Ok(msg) => {
                if let Some(answer) = dispatch(&hub, conn, &tx, &mut uid, msg).await {
                    reply(&tx, answer);
                }
            }
            Err(e) => warn!(%conn, error = %e, "malformed canvas message"),
        }
        hub.flush_stale().await;
    }

    hub.unregister(conn).await;
    hub.flush_stale().await;
    writer.abort();
    info!(%conn, user = ?uid, "canvas connection closed");
}

fn failure(ty: &str, e: &HubError) -> Value {
    json!({ "type": ty, "success": false, "message": e.to_string() })
}

/// Runs one message. The returned value, if any, goes back to the sender.
async fn dispatch(hub: &Hub, conn: ConnId, tx: &Tx, uid: &mut Option<String>, msg: CanvasMsg) -> Option<Value> {
    if let CanvasMsg::Register { name } = &msg {
        let id = hub.register(conn, tx.clone(), name).await;
        *uid = Some(id.clone());
        return Some(json!({ "type": "registered", "user_id": id, "name": name }));
    }
    if msg == CanvasMsg::Ping {
        return Some(json!({ "type": "pong" }));
    }
    let Some(me) = uid.clone() else {
        return Some(json!({ "type": "error", "message": HubError::NotRegistered.to_string() }));
    };

    match msg {
        CanvasMsg::Register { .. } | CanvasMsg::Ping => None,

        CanvasMsg::CreateRoom { room_name, max_users, initial_canvas_state } => {
            match hub.create_room(&me, &room_name, max_users, initial_canvas_state).await {
                Ok(_) => None,
                Err(e) => Some(json!({ "type": "room_created", "success": false, "error": e.to_string() })),
            }
        }
        CanvasMsg::JoinRoom { room_id, was_host } => match hub.join_room(&me, &room_id.trim().to_uppercase(), was_host).await {
            Ok(()) => None,
            Err(e) => Some(json!({ "type": "room_joined", "success": false, "room_id": room_id, "error": e.to_string() })),
        },
        CanvasMsg::LeaveRoom => {
            hub.leave_room(&me, false).await;
            Some(json!({ "type": "room_left", "success": true }))
        }
        CanvasMsg::CanvasEvent { event } => {
            hub.apply_event(&me, event).await;
            None
        }
        CanvasMsg::CursorMove { x, y } => {
            hub.cursor_move(&me, x, y).await;
            None
        }
        CanvasMsg::UpdateName { name } => match hub.update_name(&me, &name).await {
            Ok(()) => Some(json!({ "type": "name_updated", "success": true, "name": name })),
            Err(e) => Some(failure("name_updated", &e)),
        },
        CanvasMsg::KickUser { target_user_id } => match hub.kick(&me, &target_user_id).await {
            Ok(()) => Some(json!({ "type": "kick_result", "success": true, "target_user_id": target_user_id })),
            Err(e) => Some(failure("kick_result", &e)),
        },
        CanvasMsg::HostMuteUser { target_user_id, mute_type, action } => {
            let res = match (mute_type.parse::<MuteChannel>(), action.parse::<MuteAction>()) {
                (Ok(channel), Ok(act)) => hub.mute_command(&me, &target_user_id, channel, act).await,
                (Err(e), _) | (_, Err(e)) => Err(e),
            };
            Some(match res {
                Ok(()) => json!({
                    "type": "host_mute_result",
                    "success": true,
                    "target_user_id": target_user_id,
                    "mute_type": mute_type,
                    "action": action,
                }),
                Err(e) => failure("host_mute_result", &e),
            })
        }
        CanvasMsg::TransferHost { target_user_id } => match hub.transfer_host(&me, &target_user_id).await {
            Ok(name) => Some(json!({
                "type": "transfer_host_result",
                "success": true,
                "message": format!("Host privileges transferred to {name}"),
            })),
            Err(e) => Some(failure("transfer_host_result", &e)),
        },
        CanvasMsg::HostBroadcastControl { enabled } => hub.broadcast_control(&me, enabled).await.err().map(broadcast_error),
        CanvasMsg::HostBroadcastAiMessage { message } => {
            hub.broadcast_ai_message(&me, message).await.err().map(broadcast_error)
        }
        CanvasMsg::HostBroadcastPdf { data } => {
            let res = match data.action.parse::<PdfAction>() {
                Ok(action) => hub.broadcast_pdf(&me, action, data.data).await,
                Err(e) => Err(e),
            };
            res.err().map(broadcast_error)
        }
        CanvasMsg::VideoCallStarted { user_name } => quiet(&me, "video_call_started", hub.video_call_started(&me, user_name).await),
        CanvasMsg::VideoCallEnded => quiet(&me, "video_call_ended", hub.video_call_ended(&me).await),
        CanvasMsg::VideoCallEvent { event_type, data, room_id } => quiet(
            &me,
            "video_call_event",
            hub.video_call_event(&me, event_type, data, room_id.as_deref()).await,
        ),
        CanvasMsg::WebrtcSignal { to_user_id, signal_type, signal_data } => quiet(
            &me,
            "webrtc_signal",
            hub.relay_signal(&me, &to_user_id, signal_type, signal_data).await,
        ),
        CanvasMsg::MediaStatus { video_enabled, audio_enabled } => {
            quiet(&me, "media_status", hub.media_status(&me, video_enabled, audio_enabled).await)
        }
    }
}

fn broadcast_error(e: HubError) -> Value {
    json!({ "type": "host_broadcast_error", "message": e.to_string() })
}

/// Relay messages have no reply; a refusal is only logged.
fn quiet(uid: &str, what: &str, res: Result<(), HubError>) -> Option<Value> {
    if let Err(e) = res {
        debug!(user = %uid, %what, error = %e, "relay dropped");
    }
    None
}

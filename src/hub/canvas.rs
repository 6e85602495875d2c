use serde_json::{json, Value};
use tracing::{debug, warn};

use super::Hub;
use crate::state::{default_background, object_id, CanvasState, PATTERN_BACKGROUND};

/// Canvas event kinds, read from the event's own `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanvasEventKind {
    ObjectAdded,
    ObjectModified,
    ObjectRemoved,
    CanvasCleared,
    BackgroundChanged,
    /// Moving, scaling, rotating and selection feedback: relayed, never stored.
    Transient,
    Unknown,
}

impl CanvasEventKind {
    pub fn of(event: &Value) -> Self {
        match event.get("type").and_then(Value::as_str).unwrap_or_default() {
            "object_added" | "path_created" => Self::ObjectAdded,
            "object_modified" => Self::ObjectModified,
            "object_removed" => Self::ObjectRemoved,
            "canvas_cleared" => Self::CanvasCleared,
            "background_changed" => Self::BackgroundChanged,
            "object_moving" | "object_scaling" | "object_rotating" | "selection_created"
            | "selection_updated" | "selection_cleared" => Self::Transient,
            _ => Self::Unknown,
        }
    }
}

/// Gives `obj` the envelope id when it carries none of its own.
fn backfill_id(mut obj: Value, envelope_id: Option<&Value>) -> Value {
    if let (Some(id), Some(map)) = (envelope_id, obj.as_object_mut()) {
        let missing = map.get("id").map_or(true, |v| v.is_null() || *v == "");
        if missing {
            map.insert("id".into(), id.clone());
        }
    }
    obj
}

impl CanvasState {
    /// Collapses objects sharing an id onto the first slot, last value wins.
    pub fn deduped(mut self) -> Self {
        let objects = std::mem::take(&mut self.objects);
        for obj in objects {
            self.upsert(obj);
        }
        self
    }

    fn position(&self, id: &Value) -> Option<usize> {
        self.objects.iter().position(|o| object_id(o) == Some(id))
    }

    /// Append, or replace in place when the id is already present.
    fn upsert(&mut self, obj: Value) {
        match object_id(&obj).and_then(|id| self.position(id)) {
            Some(i) => self.objects[i] = obj,
            None => self.objects.push(obj),
        }
    }

    /// Applies one event. Returns whether the stored document changed.
    pub fn apply(&mut self, event: &Value) -> bool {
        let envelope_id = event.get("object_id").filter(|v| !v.is_null());
        match CanvasEventKind::of(event) {
            CanvasEventKind::ObjectAdded => {
                let Some(obj) = event.get("object").or_else(|| event.get("path")).filter(|o| !o.is_null()) else {
                    return false;
                };
                self.upsert(backfill_id(obj.clone(), envelope_id));
                true
            }
            CanvasEventKind::ObjectModified => {
                let (Some(id), Some(obj)) = (envelope_id, event.get("object").filter(|o| !o.is_null())) else {
                    return false;
                };
                let Some(i) = self.position(id) else { return false };
                let obj = backfill_id(obj.clone(), Some(id));
                let new_id = object_id(&obj).cloned();
                self.objects[i] = obj;
                // a payload that renamed itself must not shadow another object
                if let Some(new_id) = new_id {
                    let mut idx = 0;
                    self.objects.retain(|o| {
                        let keep = idx == i || object_id(o) != Some(&new_id);
                        idx += 1;
                        keep
                    });
                }
                true
            }
            CanvasEventKind::ObjectRemoved => {
                let Some(id) = envelope_id else { return false };
                let before = self.objects.len();
                self.objects.retain(|o| object_id(o) != Some(id));
                before != self.objects.len()
            }
            CanvasEventKind::CanvasCleared => {
                self.objects.clear();
                if let Some(bg) = event.get("background") {
                    self.background = bg.clone();
                }
                true
            }
            CanvasEventKind::BackgroundChanged => {
                let bg = event.get("background").filter(|b| !b.is_null()).cloned().unwrap_or_else(default_background);
                if bg == PATTERN_BACKGROUND {
                    if let Some(p) = event.get("pattern").filter(|p| !p.is_null()) {
                        self.pattern = Some(p.clone());
                    }
                } else {
                    self.pattern = None;
                }
                self.background = bg;
                true
            }
            CanvasEventKind::Transient | CanvasEventKind::Unknown => false,
        }
    }
}

impl Hub {
    /// Applies a canvas event to the sender's room and relays it verbatim
    /// to every other member. Non-members are ignored with a warning.
    pub async fn apply_event(&self, uid: &str, event: Value) {
        let room_id = self.current_room(uid).await;
        let Some(room) = self.room_ref_of(room_id.as_deref()).await else {
            warn!(user = %uid, "canvas event from user without room");
            return;
        };
        let mut room = room.lock().await;
        if !room.is_member(uid) {
            warn!(user = %uid, room = %room.id, "canvas event from non-member");
            return;
        }

        let kind = CanvasEventKind::of(&event);
        let changed = room.canvas.apply(&event);
        debug!(user = %uid, room = %room.id, ?kind, changed, objects = room.canvas.objects.len(), "canvas event");

        let users = self.users.read().await;
        let msg = json!({ "type": "canvas_event", "event": event, "user_id": uid });
        self.deliver(&users, &room.members, Some(uid), &msg);
    }
}

//! Mapping between domain entities and remote JSON documents.
//!
//! Chat and participant documents merge per field under a simple
//! precedence rule: a field named by an unacknowledged outbox entry keeps
//! its local value, every other field takes the remote one.  Message
//! documents are immutable and never field-merged.

use std::collections::HashSet;

use serde_json::{Map, Value};

use deskline_shared::{Chat, Message, Participant};

// ---------------------------------------------------------------------------
// Entity -> document
// ---------------------------------------------------------------------------

/// The chat document published to the remote store.  Preview columns are
/// local denormalizations and stay out of it.
pub(crate) fn chat_doc(chat: &Chat) -> Result<Value, serde_json::Error> {
    let mut value = serde_json::to_value(chat)?;
    if let Value::Object(map) = &mut value {
        map.remove("last_message_time");
        map.remove("last_message_text");
    }
    Ok(value)
}

pub(crate) fn participant_doc(participant: &Participant) -> Result<Value, serde_json::Error> {
    serde_json::to_value(participant)
}

pub(crate) fn message_doc(message: &Message) -> Result<Value, serde_json::Error> {
    serde_json::to_value(message)
}

// ---------------------------------------------------------------------------
// Document -> entity
// ---------------------------------------------------------------------------

pub(crate) fn chat_from_doc(doc: &Value) -> Result<Chat, serde_json::Error> {
    serde_json::from_value(doc.clone())
}

pub(crate) fn participant_from_doc(doc: &Value) -> Result<Participant, serde_json::Error> {
    serde_json::from_value(doc.clone())
}

pub(crate) fn message_from_doc(doc: &Value) -> Result<Message, serde_json::Error> {
    serde_json::from_value(doc.clone())
}

/// Tombstoned message documents keep their content but carry this flag.
pub(crate) fn doc_is_tombstoned(doc: &Value) -> bool {
    doc.get("deleted").and_then(Value::as_bool).unwrap_or(false)
}

/// Field map for a partial lifecycle update of the chat document.
pub(crate) fn status_fields(
    status: deskline_shared::ChatStatus,
    assigned_operator_id: &Option<deskline_shared::UserId>,
) -> Result<Map<String, Value>, serde_json::Error> {
    let mut fields = Map::new();
    fields.insert("status".into(), serde_json::to_value(status)?);
    fields.insert(
        "assigned_operator_id".into(),
        serde_json::to_value(assigned_operator_id)?,
    );
    Ok(fields)
}

// ---------------------------------------------------------------------------
// Field-precedence merge
// ---------------------------------------------------------------------------

/// Overwrite `local` with `remote` field by field, keeping fields named in
/// `covered` (they belong to unacknowledged local writes).  Returns whether
/// anything changed.
pub(crate) fn merge_chat(local: &mut Chat, remote: &Chat, covered: &HashSet<&str>) -> bool {
    let before = local.clone();

    if !covered.contains("status") {
        local.status = remote.status;
    }
    if !covered.contains("assigned_operator_id") {
        local.assigned_operator_id = remote.assigned_operator_id.clone();
    }
    if !covered.contains("created_at") {
        local.created_at = remote.created_at;
    }
    if !covered.contains("creator_id") {
        local.creator_id = remote.creator_id.clone();
    }
    if !covered.contains("subject") {
        local.subject = remote.subject.clone();
    }

    *local != before
}

/// Same rule for participant documents.
pub(crate) fn merge_participant(
    local: &mut Participant,
    remote: &Participant,
    covered: &HashSet<&str>,
) -> bool {
    let before = local.clone();

    if !covered.contains("display_name") {
        local.display_name = remote.display_name.clone();
    }
    if !covered.contains("role") {
        local.role = remote.role;
    }
    if !covered.contains("unread_count") {
        local.unread_count = remote.unread_count;
    }
    if !covered.contains("last_read_at") {
        local.last_read_at = remote.last_read_at;
    }

    *local != before
}

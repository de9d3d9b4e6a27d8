//! Extraction of server-sourced history for hydration.
//!
//! Three payload shapes are accepted, checked in this order:
//! - `{systems: {sisi: [...], liuye: [...]}}` (per-agent map)
//! - `{messages: [...]}` with per-item `system_id`/`mode` and `role`
//! - `{list: [...]}` (legacy, role and agent derived from `type`)
//!
//! Entries without a usable timestamp are stamped with the Unix epoch so
//! repeated extraction of the same payload yields identical messages.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::domain::message::{generate_id, value_as_f64, value_as_text};
use crate::domain::{AgentId, Attachment, Message, Meta, PerAgent, Role};

/// Split a bootstrap payload into per-agent message lists
pub fn extract_backend_history(payload: &Value) -> PerAgent<Vec<Message>> {
    let mut lists: PerAgent<Vec<Message>> = PerAgent::default();
    if !payload.is_object() {
        return lists;
    }

    let mut push = |item: &Value, forced: Option<AgentId>| {
        if let Some(message) = normalize_entry(item, forced) {
            lists[message.agent_id].push(message);
        }
    };

    if let Some(systems) = payload.get("systems").and_then(Value::as_object) {
        for agent in AgentId::ALL {
            if let Some(items) = systems.get(agent.as_str()).and_then(Value::as_array) {
                for item in items {
                    push(item, Some(agent));
                }
            }
        }
        return lists;
    }

    let messages = payload.get("messages").and_then(Value::as_array);
    if let Some(items) = messages.filter(|items| !items.is_empty()) {
        for item in items {
            push(item, None);
        }
        return lists;
    }

    if let Some(items) = payload.get("list").and_then(Value::as_array) {
        for item in items {
            push(item, None);
        }
    }
    lists
}

fn legacy_type(item: &Value) -> String {
    item.get("type")
        .map(value_as_text)
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn resolve_role(item: &Value) -> Role {
    if let Some(role) = item.get("role").and_then(Value::as_str).and_then(Role::parse) {
        return role;
    }
    match legacy_type(item).as_str() {
        "member" | "user" => Role::User,
        _ => Role::Assistant,
    }
}

fn resolve_agent(item: &Value) -> AgentId {
    let explicit = item
        .get("system_id")
        .or_else(|| item.get("mode"))
        .and_then(Value::as_str)
        .and_then(AgentId::parse);
    if let Some(agent) = explicit {
        return agent;
    }
    if legacy_type(item) == "liuye" {
        AgentId::Liuye
    } else {
        AgentId::Sisi
    }
}

/// Timestamp of entries that carry none
pub fn untimed() -> DateTime<Utc> {
    DateTime::<Utc>::from(std::time::UNIX_EPOCH)
}

fn resolve_created_at(item: &Value) -> DateTime<Utc> {
    let explicit = item
        .get("created_at")
        .and_then(Value::as_str)
        .map(str::trim)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    if let Some(created_at) = explicit {
        return created_at;
    }

    let epoch = item.get("createtime").map(value_as_f64).unwrap_or(f64::NAN);
    if epoch.is_finite() {
        let millis = (epoch * 1000.0) as i64;
        if let Some(created_at) = Utc.timestamp_millis_opt(millis).single() {
            return created_at;
        }
    }
    untimed()
}

fn normalize_entry(item: &Value, forced: Option<AgentId>) -> Option<Message> {
    let obj = item.as_object()?;

    let content = obj
        .get("content")
        .filter(|v| !v.is_null())
        .or_else(|| obj.get("text"))
        .map(value_as_text)
        .unwrap_or_default();
    if content.trim().is_empty() {
        return None;
    }

    let id = obj.get("id").map(value_as_text).unwrap_or_default();
    let meta = obj
        .get("meta")
        .and_then(Value::as_object)
        .cloned()
        .map(Meta::from)
        .unwrap_or_default();

    let mut message = Message {
        id: if id.trim().is_empty() { generate_id() } else { id },
        agent_id: forced.unwrap_or_else(|| resolve_agent(item)),
        role: resolve_role(item),
        content,
        created_at: resolve_created_at(item),
        meta,
        attachments: Attachment::list_from_value(obj.get("attachments"), "upload"),
    };
    message.clear_transient_flags();
    Some(message)
}

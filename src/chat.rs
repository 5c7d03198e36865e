//! Chat record model.
//!
//! Chats arrive from warehouse exports where nested objects are sometimes
//! embedded as JSON strings. Deserialization is lenient for optional fields
//! (a malformed `agent` or `tags` value becomes `None` instead of rejecting
//! the whole chat) and strict for the fields analysis depends on.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

/// Lifecycle status of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatStatus {
    Open,
    Closed,
    #[default]
    #[serde(other)]
    Unknown,
}

/// The organization a contact belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    #[serde(default, alias = "_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// A customer participating in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub organization: Option<Organization>,
}

/// A support agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// The sender of a message; either an agent or the customer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sender {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl Sender {
    pub fn is_agent(&self) -> bool {
        self.kind.as_deref() == Some("agent")
    }
}

/// A single message within a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub body: String,
    #[serde(rename = "time")]
    pub sent_at: DateTime<Utc>,
    #[serde(default, rename = "readAt")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "sentBy")]
    pub sender: Option<Sender>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default, rename = "chatId")]
    pub chat_id: Option<String>,
}

impl Message {
    /// Whether this message was sent by a human agent.
    pub fn from_agent(&self) -> bool {
        self.sender.as_ref().is_some_and(Sender::is_agent)
    }
}

/// Closure details of a finished conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedInfo {
    pub closed_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_by: Option<Agent>,
}

/// A label attached to a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
}

/// One complete support conversation.
///
/// Constructed once per ingestion pass and immutable afterwards. Messages are
/// kept ordered by timestamp; ingestion calls [`Chat::sort_messages`] after
/// deserialization so downstream consumers can rely on the ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    #[serde(default, deserialize_with = "int_or_string")]
    pub number: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default, deserialize_with = "embedded_json_opt")]
    pub contact: Option<Contact>,
    #[serde(default, deserialize_with = "embedded_json_opt")]
    pub agent: Option<Agent>,
    #[serde(deserialize_with = "embedded_json")]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub status: ChatStatus,
    #[serde(default, deserialize_with = "embedded_json_opt")]
    pub closed: Option<ClosedInfo>,
    #[serde(default, deserialize_with = "embedded_json_opt")]
    pub tags: Option<Vec<Tag>>,
    #[serde(default, rename = "firstMessageDate")]
    pub first_message_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "lastMessageDate")]
    pub last_message_at: Option<DateTime<Utc>>,
}

impl Chat {
    /// Restore the message-ordering invariant after deserialization.
    pub fn sort_messages(&mut self) {
        self.messages.sort_by_key(|m| m.sent_at);
    }

    pub fn has_messages(&self) -> bool {
        !self.messages.is_empty()
    }

    pub fn agent_name(&self) -> Option<&str> {
        self.agent.as_ref().map(|a| a.name.as_str())
    }

    pub fn tag_names(&self) -> Vec<String> {
        self.tags
            .as_ref()
            .map(|tags| tags.iter().map(|t| t.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Render the conversation as a readable transcript, one line per message:
    /// `Agent (14:32): ...` / `Customer (14:35): ...`. The chat vendor embeds
    /// light HTML in message bodies, which is stripped here.
    pub fn transcript(&self) -> String {
        let mut lines = Vec::with_capacity(self.messages.len());
        for msg in &self.messages {
            let who = if msg.from_agent() { "Agent" } else { "Customer" };
            let body = msg
                .body
                .replace("<p>", "")
                .replace("</p>", "")
                .replace("<br>", "\n");
            lines.push(format!("{} ({}): {}", who, msg.sent_at.format("%H:%M"), body));
        }
        lines.join("\n")
    }
}

/// Accept a value that is either the expected shape or that shape embedded as
/// a JSON string. Parse failures on these optional fields become `None` so a
/// single malformed field does not reject the chat.
fn embedded_json_opt<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => serde_json::from_str(&s).ok(),
        Some(other) => serde_json::from_value(other).ok(),
    })
}

/// Like [`embedded_json_opt`] but for required fields: a parse failure is an
/// error, which fails validation of the whole chat.
fn embedded_json<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => serde_json::from_str(&s).map_err(serde::de::Error::custom),
        other => serde_json::from_value(other).map_err(serde::de::Error::custom),
    }
}

/// The conversation number arrives as an integer from some exports and a
/// string from others.
fn int_or_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;
    use chrono::TimeZone;

    /// A two-message chat: customer question followed by an agent reply.
    pub(crate) fn sample_chat(id: &str) -> Chat {
        chat_with_messages(
            id,
            vec![
                customer_message("Hi, do you sell the focused ultrasound unit?", 0),
                agent_message("Hello! Yes we do. What region are you in?", 120),
            ],
        )
    }

    pub(crate) fn chat_with_messages(id: &str, messages: Vec<Message>) -> Chat {
        Chat {
            id: id.to_string(),
            number: Some("1024".to_string()),
            channel: Some("whatsapp".to_string()),
            contact: Some(Contact {
                id: "contact-1".to_string(),
                name: Some("Dr. Reyes".to_string()),
                email: None,
                organization: None,
            }),
            agent: Some(Agent {
                id: "agent-1".to_string(),
                name: "Ana".to_string(),
                email: None,
            }),
            messages,
            status: ChatStatus::Closed,
            closed: None,
            tags: Some(vec![Tag {
                name: "pricing".to_string(),
            }]),
            first_message_at: None,
            last_message_at: None,
        }
    }

    pub(crate) fn customer_message(body: &str, offset_secs: i64) -> Message {
        message(body, offset_secs, None)
    }

    pub(crate) fn agent_message(body: &str, offset_secs: i64) -> Message {
        message(body, offset_secs, Some("agent"))
    }

    fn message(body: &str, offset_secs: i64, sender_kind: Option<&str>) -> Message {
        // A Tuesday morning inside business hours at UTC-3
        let base = Utc.with_ymd_and_hms(2025, 6, 10, 14, 0, 0).unwrap();
        Message {
            id: None,
            body: body.to_string(),
            sent_at: base + chrono::Duration::seconds(offset_secs),
            read_at: None,
            sender: Some(Sender {
                id: Some("s-1".to_string()),
                name: None,
                email: None,
                kind: sender_kind.map(str::to_string),
            }),
            kind: Some("text".to_string()),
            chat_id: None,
        }
    }
}

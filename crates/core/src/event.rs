use serde::Deserialize;
use serde_json::Value;

/// Outer envelope of a Slack Events API delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub challenge: Option<String>,
    #[serde(default)]
    pub event: Option<Value>,
}

impl EventEnvelope {
    pub fn is_url_verification(&self) -> bool {
        self.kind.as_deref() == Some("url_verification")
    }

    pub fn is_event_callback(&self) -> bool {
        self.kind.as_deref() == Some("event_callback")
    }
}

/// A channel message event. All fields optional at the wire level; the
/// handler decides which absences are fatal.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageEvent {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub ts: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub reply_count: Option<u32>,
    #[serde(default)]
    pub event_ts: Option<String>,
}

impl MessageEvent {
    /// Whether the message is a thread parent or reply, which is the cue to
    /// search thread replies for a qualifying URL.
    pub fn has_thread_activity(&self) -> bool {
        self.thread_ts.as_deref().is_some_and(|ts| !ts.is_empty())
            || self.reply_count.unwrap_or(0) > 0
    }
}

/// A reaction added/removed event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReactionEvent {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub reaction: Option<String>,
    #[serde(default)]
    pub item: Option<ReactionItem>,
    #[serde(default)]
    pub event_ts: Option<String>,
}

/// The message a reaction points at.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReactionItem {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub ts: Option<String>,
}

/// Tagged view over the envelope's `event` block. Every inbound event is
/// triaged into exactly one variant, so the webhook handler's match is
/// exhaustive and new event types surface as `Unhandled` rather than being
/// silently dropped on some untyped path.
#[derive(Debug, Clone, PartialEq)]
pub enum SlackEvent {
    Message(MessageEvent),
    ReactionAdded(ReactionEvent),
    ReactionRemoved(ReactionEvent),
    Unhandled { event_type: String },
}

/// Classifies the raw `event` block by its `type` tag.
pub fn classify(event: &Value) -> SlackEvent {
    let event_type = event
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default();

    match event_type {
        "message" => decode(event, event_type, SlackEvent::Message),
        "reaction_added" => decode(event, event_type, SlackEvent::ReactionAdded),
        "reaction_removed" => decode(event, event_type, SlackEvent::ReactionRemoved),
        other => SlackEvent::Unhandled {
            event_type: other.to_string(),
        },
    }
}

fn decode<T, F>(event: &Value, event_type: &str, wrap: F) -> SlackEvent
where
    T: serde::de::DeserializeOwned,
    F: FnOnce(T) -> SlackEvent,
{
    match serde_json::from_value(event.clone()) {
        Ok(parsed) => wrap(parsed),
        Err(_) => SlackEvent::Unhandled {
            event_type: event_type.to_string(),
        },
    }
}

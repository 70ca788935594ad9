//! Poolbot IPC
//!
//! Event bus between the messaging client adapter and the routing core

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

static NEXT_TRACE_COUNTER: AtomicU64 = AtomicU64::new(1);

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn generate_trace_id() -> String {
    let ts = now_unix_secs();
    let n = NEXT_TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("trace-{}-{}", ts, n)
}

fn default_trace_id() -> String {
    generate_trace_id()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Audio,
    Video,
    File,
    Contact,
    Url,
    Other,
}

impl MessageKind {
    pub fn is_text(&self) -> bool {
        matches!(self, MessageKind::Text)
    }
}

/// Room the message was posted in; absent for direct messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupContext {
    pub room_id: String,
    #[serde(default)]
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default = "default_trace_id")]
    pub trace_id: String,
    pub id: String,
    pub channel: String,
    pub thread_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub is_self: bool,
    #[serde(default)]
    pub kind: MessageKind,
    pub text: String,
    #[serde(default)]
    pub group: Option<GroupContext>,
}

impl InboundMessage {
    pub fn new(channel: &str, thread_id: &str, sender_id: &str, text: &str) -> Self {
        Self {
            trace_id: generate_trace_id(),
            id: uuid::Uuid::new_v4().to_string(),
            channel: channel.to_string(),
            thread_id: thread_id.to_string(),
            sender_id: sender_id.to_string(),
            sender_name: String::new(),
            is_self: false,
            kind: MessageKind::Text,
            text: text.to_string(),
            group: None,
        }
    }

    pub fn with_sender_name(mut self, name: &str) -> Self {
        self.sender_name = name.to_string();
        self
    }

    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_group(mut self, room_id: &str, topic: Option<&str>) -> Self {
        self.group = Some(GroupContext {
            room_id: room_id.to_string(),
            topic: topic.map(str::to_string),
        });
        self
    }

    pub fn from_self(mut self) -> Self {
        self.is_self = true;
        self
    }

    pub fn is_group(&self) -> bool {
        self.group.is_some()
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// One chunk of a reply, delivered in `seq` order through the adapter's own
/// send capability. A message with `total == 0` only marks a handled inbound
/// message whose reply was empty; adapters send nothing for it.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub trace_id: String,
    pub channel: String,
    pub thread_id: String,
    pub seq: usize,
    pub total: usize,
    pub text: String,
}

impl OutboundMessage {
    pub fn is_completion_marker(&self) -> bool {
        self.total == 0
    }

    pub fn is_last(&self) -> bool {
        self.seq + 1 >= self.total
    }
}

pub const EVENT_BUS_CAPACITY: usize = 256;
pub const OUTBOUND_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    inbound: broadcast::Sender<InboundMessage>,
    outbound: broadcast::Sender<OutboundMessage>,
}

impl EventBus {
    pub fn new() -> Self {
        let (inbound_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (outbound_tx, _) = broadcast::channel(OUTBOUND_CAPACITY);

        Self {
            inbound: inbound_tx,
            outbound: outbound_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.inbound.subscribe()
    }

    pub fn publish(&self, message: InboundMessage) -> anyhow::Result<()> {
        self.inbound.send(message)?;
        Ok(())
    }

    pub fn outbound_sender(&self) -> broadcast::Sender<OutboundMessage> {
        self.outbound.clone()
    }

    pub fn outbound_subscribe(&self) -> broadcast::Receiver<OutboundMessage> {
        self.outbound.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

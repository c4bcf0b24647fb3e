use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{AccountId, ChannelId, MessageKind, Role};

// ---------------------------------------------------------------------------
// Inbound (client -> hub)
// ---------------------------------------------------------------------------

/// One inbound WebSocket text frame.
///
/// `request_id` is echoed back in the matching [`Ack`] so that clients can
/// correlate results with the events that produced them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    pub event: ClientEvent,
}

/// All events a connection may send to the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Log in, or register an unseen id.
    Authenticate(AuthenticateRequest),

    /// Subscribe an account to a vehicle channel, creating it if unseen.
    RegisterChannel(ChannelRequest),

    /// Open a channel: acknowledges alarms, syncs history, clears unread.
    FocusChannel(ChannelRequest),

    /// Stop being present in a channel's live group.
    BlurChannel(ChannelRequest),

    /// A stranger scanned the QR code. Fire-and-forget.
    TriggerAlert(ChannelId),

    SendChat(SendChatRequest),

    SendAudio(SendAudioRequest),

    DeleteSelf(DeleteSelfRequest),

    AdminAction(AdminActionRequest),

    /// Ask for a fresh admin snapshot (admin role only).
    AdminRefresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateRequest {
    pub id: AccountId,
    pub secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRequest {
    pub account_id: AccountId,
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendChatRequest {
    pub channel_id: ChannelId,
    pub sender_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendAudioRequest {
    pub channel_id: ChannelId,
    pub sender_id: String,
    /// Opaque encoded audio (base64 on the wire, never inspected).
    pub audio_payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteSelfRequest {
    pub id: AccountId,
    pub secret: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AdminActionKind {
    /// Toggles the block flag.
    Block,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminActionRequest {
    pub admin_secret: String,
    pub target_id: AccountId,
    pub action: AdminActionKind,
}

impl ClientFrame {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        if text.trim().is_empty() {
            return Err(ProtocolError::Empty);
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Best-effort `requestId` of a frame that failed to decode, so the
    /// failure ack can still be matched by the client.
    pub fn request_id_hint(text: &str) -> Option<u64> {
        serde_json::from_str::<serde_json::Value>(text)
            .ok()?
            .get("requestId")?
            .as_u64()
    }
}

// ---------------------------------------------------------------------------
// Outbound (hub -> client)
// ---------------------------------------------------------------------------

/// All events the hub pushes to connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Result of a request-bearing inbound event.
    Ack(Ack),

    /// Someone is alerting a channel the connection is present in.
    Ring(RingNotice),

    ChatReceived(ChatMessage),

    AudioReceived(AudioMessage),

    /// Unread count of one channel changed.
    DashboardUpdate(DashboardEntry),

    AdminSnapshot(AdminSnapshot),

    /// Full history buffer, sent on focus.
    HistorySync(HistorySync),
}

impl ServerEvent {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard: Option<Vec<DashboardEntry>>,
}

impl Ack {
    pub fn ok(request_id: Option<u64>) -> Self {
        Self {
            request_id,
            success: true,
            ..Self::default()
        }
    }

    pub fn failure(request_id: Option<u64>, message: impl Into<String>) -> Self {
        Self {
            request_id,
            success: false,
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn with_dashboard(mut self, dashboard: Vec<DashboardEntry>) -> Self {
        self.dashboard = Some(dashboard);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RingNotice {
    pub channel_id: ChannelId,
    pub triggered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub channel_id: ChannelId,
    pub sender_id: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioMessage {
    pub channel_id: ChannelId,
    pub sender_id: String,
    pub audio_payload: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardEntry {
    pub channel_id: ChannelId,
    pub unread: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub kind: MessageKind,
    pub sender_id: String,
    /// Chat text, or [`crate::constants::AUDIO_PLACEHOLDER`] for audio.
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySync {
    pub channel_id: ChannelId,
    pub entries: Vec<HistoryEntry>,
}

/// Registry state broadcast to admin connections.
///
/// `accounts` is only filled when the deployment publishes the full
/// registry; otherwise admins get aggregate counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminSnapshot {
    pub summary: RegistrySummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accounts: Option<Vec<AccountSummary>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySummary {
    pub accounts: usize,
    pub blocked: usize,
    pub channels: usize,
    pub active_alarms: usize,
    pub connections: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    pub id: AccountId,
    pub blocked: bool,
    pub online: bool,
    pub has_device_token: bool,
    pub channels: Vec<ChannelId>,
}

//! Push gateway client.
//!
//! Notifications are fire-and-forget: [`PushDispatcher::dispatch`] returns
//! immediately, the HTTP request runs on its own task, and failures are
//! logged and dropped. Nothing here touches hub state.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use parkping_shared::constants::PUSH_PREVIEW_CHARS;
use parkping_shared::types::ChannelId;

/// Errors of a single push delivery attempt. Logged only.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("Push request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Push gateway error (status {status}): {body}")]
    Gateway { status: u16, body: String },
}

/// Data tag telling the app what the notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PushKind {
    Alert,
    Chat,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PushPriority {
    High,
    Normal,
}

/// One notification for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushNotification {
    pub device_token: String,
    pub title: String,
    pub body: String,
    pub priority: PushPriority,
    pub kind: PushKind,
    pub channel_id: ChannelId,
}

impl PushNotification {
    /// Escalation pulse for an unanswered alert.
    pub fn alert(device_token: &str, channel_id: &ChannelId, pulse: u32) -> Self {
        Self {
            device_token: device_token.to_string(),
            title: "Vehicle alert".to_string(),
            body: format!("Someone needs you at your vehicle {channel_id} (attempt {pulse})"),
            priority: PushPriority::High,
            kind: PushKind::Alert,
            channel_id: channel_id.clone(),
        }
    }

    /// New chat message while the owner was offline.
    pub fn chat(device_token: &str, channel_id: &ChannelId, sender: &str, text: &str) -> Self {
        Self {
            device_token: device_token.to_string(),
            title: format!("New message on {channel_id}"),
            body: format!("{sender}: {}", preview(text)),
            priority: PushPriority::Normal,
            kind: PushKind::Chat,
            channel_id: channel_id.clone(),
        }
    }

    /// New voice note. The audio itself is never pushed.
    pub fn audio(device_token: &str, channel_id: &ChannelId, sender: &str) -> Self {
        Self {
            device_token: device_token.to_string(),
            title: format!("New message on {channel_id}"),
            body: format!("{sender} sent a voice note"),
            priority: PushPriority::Normal,
            kind: PushKind::Audio,
            channel_id: channel_id.clone(),
        }
    }
}

/// Truncate chat text for a notification body.
fn preview(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(PUSH_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

/// Outbound boundary to the push gateway.
pub trait PushDispatcher: Send + Sync {
    /// Hand a notification over for best-effort delivery. Never blocks.
    fn dispatch(&self, notification: PushNotification);
}

// ---------------------------------------------------------------------------
// HTTP gateway
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GatewayMessage<'a> {
    to: &'a str,
    title: &'a str,
    body: &'a str,
    priority: PushPriority,
    sound: &'static str,
    data: GatewayData<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GatewayData<'a> {
    kind: PushKind,
    channel_id: &'a ChannelId,
}

impl<'a> GatewayMessage<'a> {
    fn from_notification(n: &'a PushNotification) -> Self {
        Self {
            to: &n.device_token,
            title: &n.title,
            body: &n.body,
            priority: n.priority,
            sound: "default",
            data: GatewayData {
                kind: n.kind,
                channel_id: &n.channel_id,
            },
        }
    }
}

/// Posts notifications as JSON to an Expo-style push endpoint.
#[derive(Clone)]
pub struct HttpPushDispatcher {
    http: reqwest::Client,
    gateway_url: Arc<str>,
    access_token: Option<Arc<str>>,
}

impl HttpPushDispatcher {
    pub fn new(gateway_url: &str, access_token: Option<&str>) -> Self {
        Self {
            http: reqwest::Client::new(),
            gateway_url: Arc::from(gateway_url),
            access_token: access_token.map(Arc::from),
        }
    }

    async fn send(&self, notification: &PushNotification) -> Result<(), PushError> {
        let mut request = self
            .http
            .post(&*self.gateway_url)
            .json(&GatewayMessage::from_notification(notification));
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<failed to read body>".to_string());
        Err(PushError::Gateway {
            status: status.as_u16(),
            body,
        })
    }
}

impl PushDispatcher for HttpPushDispatcher {
    fn dispatch(&self, notification: PushNotification) {
        let client = self.clone();
        tokio::spawn(async move {
            match client.send(&notification).await {
                Ok(()) => debug!(
                    channel = %notification.channel_id,
                    kind = ?notification.kind,
                    "Push notification delivered to gateway"
                ),
                Err(e) => warn!(
                    channel = %notification.channel_id,
                    kind = ?notification.kind,
                    error = %e,
                    "Push notification failed"
                ),
            }
        });
    }
}

/// Used when no gateway is configured.
#[derive(Debug, Default)]
pub struct DisabledPush;

impl PushDispatcher for DisabledPush {
    fn dispatch(&self, notification: PushNotification) {
        debug!(
            channel = %notification.channel_id,
            kind = ?notification.kind,
            "Push disabled, dropping notification"
        );
    }
}

/// Test double that keeps every dispatched notification.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct RecordingPush {
    sent: Arc<std::sync::Mutex<Vec<PushNotification>>>,
}

#[cfg(test)]
impl RecordingPush {
    pub fn sent(&self) -> Vec<PushNotification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, kind: PushKind) -> usize {
        self.sent().iter().filter(|n| n.kind == kind).count()
    }
}

#[cfg(test)]
impl PushDispatcher for RecordingPush {
    fn dispatch(&self, notification: PushNotification) {
        self.sent.lock().unwrap().push(notification);
    }
}

//! Message router: direct relay when someone is present in the channel,
//! store-and-forward with push otherwise.

use chrono::Utc;
use tracing::{debug, info};

use parkping_shared::constants::AUDIO_PLACEHOLDER;
use parkping_shared::protocol::{
    AudioMessage, ChatMessage, HistoryEntry, SendAudioRequest, SendChatRequest,
};
use parkping_shared::types::{ChannelId, MessageKind};

use super::Hub;
use crate::channels::PendingMessage;
use crate::error::HubError;
use crate::presence::{ConnectionId, Group};
use crate::push::PushNotification;

impl Hub {
    pub(super) fn send_chat(
        &mut self,
        conn: ConnectionId,
        req: SendChatRequest,
    ) -> Result<(), HubError> {
        let message = PendingMessage::Chat(ChatMessage {
            channel_id: req.channel_id,
            sender_id: req.sender_id,
            text: req.text,
            sent_at: Utc::now(),
        });
        self.route(conn, message)
    }

    pub(super) fn send_audio(
        &mut self,
        conn: ConnectionId,
        req: SendAudioRequest,
    ) -> Result<(), HubError> {
        let message = PendingMessage::Audio(AudioMessage {
            channel_id: req.channel_id,
            sender_id: req.sender_id,
            audio_payload: req.audio_payload,
            sent_at: Utc::now(),
        });
        self.route(conn, message)
    }

    /// Relay or queue one message sent from `conn`.
    ///
    /// Only owners focused on the channel count as reachable. Strangers
    /// sit in the visitor group: they hear owner replies, never each other.
    fn route(&mut self, conn: ConnectionId, message: PendingMessage) -> Result<(), HubError> {
        let (channel_id, sender_id) = match &message {
            PendingMessage::Chat(m) => (m.channel_id.clone(), m.sender_id.clone()),
            PendingMessage::Audio(m) => (m.channel_id.clone(), m.sender_id.clone()),
        };
        let from_owner = self.speaks_as_owner(&conn, &channel_id);
        let live = Group::Channel(channel_id.clone());
        let visitors = Group::Visitors(channel_id.clone());

        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return Err(HubError::NotFound(channel_id.to_string()));
        };

        let reachable = !self.presence.is_empty(&live, Some(&conn));

        channel.push_history(history_entry(&message));
        let unread = channel.mark_unread();
        let recipients: Vec<_> = channel
            .owners()
            .iter()
            .filter(|owner| owner.as_str() != sender_id)
            .cloned()
            .collect();

        let event = message.clone().into_event();
        if from_owner {
            self.presence.send_to_group(&visitors, &event, None);
        } else {
            self.presence.join(conn, visitors);
        }

        if reachable {
            let relayed = self.presence.send_to_group(&live, &event, Some(&conn));
            debug!(
                channel = %channel_id,
                kind = ?message.kind(),
                relayed,
                unread,
                "Message relayed directly"
            );
        } else {
            let mut queued = 0;
            for owner in &recipients {
                if self.is_online(owner) {
                    continue;
                }
                if let Some(channel) = self.channels.get_mut(&channel_id) {
                    channel.enqueue_pending(owner, message.clone());
                    queued += 1;
                }
                let token = self
                    .accounts
                    .get(owner)
                    .and_then(|account| account.device_token.clone());
                if let Some(token) = token {
                    self.push
                        .dispatch(push_for(&token, &channel_id, &sender_id, &message));
                }
            }
            info!(
                channel = %channel_id,
                kind = ?message.kind(),
                queued,
                unread,
                "No owner present, message stored for offline owners"
            );
        }

        self.notify_dashboards(&channel_id, Some(&sender_id));
        Ok(())
    }
}

/// What the channel keeps: audio content is replaced by a marker.
fn history_entry(message: &PendingMessage) -> HistoryEntry {
    match message {
        PendingMessage::Chat(m) => HistoryEntry {
            kind: MessageKind::Chat,
            sender_id: m.sender_id.clone(),
            content: m.text.clone(),
            sent_at: m.sent_at,
        },
        PendingMessage::Audio(m) => HistoryEntry {
            kind: MessageKind::Audio,
            sender_id: m.sender_id.clone(),
            content: AUDIO_PLACEHOLDER.to_string(),
            sent_at: m.sent_at,
        },
    }
}

fn push_for(
    token: &str,
    channel_id: &ChannelId,
    sender_id: &str,
    message: &PendingMessage,
) -> PushNotification {
    match message {
        PendingMessage::Chat(m) => PushNotification::chat(token, channel_id, sender_id, &m.text),
        PendingMessage::Audio(_) => PushNotification::audio(token, channel_id, sender_id),
    }
}

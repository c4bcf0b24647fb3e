//! Vehicle channel registry.
//!
//! A channel exists exactly as long as it has at least one owner. The hub
//! enforces that invariant by destroying the channel when its last owner
//! is removed.

use std::collections::{HashMap, VecDeque};

use parkping_shared::constants::HISTORY_CAPACITY;
use parkping_shared::protocol::{
    AudioMessage, ChatMessage, DashboardEntry, HistoryEntry, ServerEvent,
};
use parkping_shared::types::{AccountId, ChannelId, MessageKind};

/// A chat or audio payload queued for an owner that was offline.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingMessage {
    Chat(ChatMessage),
    Audio(AudioMessage),
}

impl PendingMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            PendingMessage::Chat(_) => MessageKind::Chat,
            PendingMessage::Audio(_) => MessageKind::Audio,
        }
    }

    pub fn into_event(self) -> ServerEvent {
        match self {
            PendingMessage::Chat(msg) => ServerEvent::ChatReceived(msg),
            PendingMessage::Audio(msg) => ServerEvent::AudioReceived(msg),
        }
    }
}

#[derive(Debug)]
pub struct Channel {
    pub id: ChannelId,
    owners: Vec<AccountId>,
    history: VecDeque<HistoryEntry>,
    unread: u32,
    pending: HashMap<AccountId, VecDeque<PendingMessage>>,
}

impl Channel {
    fn new(id: ChannelId) -> Self {
        Self {
            id,
            owners: Vec::new(),
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            unread: 0,
            pending: HashMap::new(),
        }
    }

    pub fn owners(&self) -> &[AccountId] {
        &self.owners
    }

    pub fn is_owner(&self, account_id: &AccountId) -> bool {
        self.owners.contains(account_id)
    }

    /// Add an owner. Returns `false` if it already was one.
    pub fn add_owner(&mut self, account_id: &AccountId) -> bool {
        if self.is_owner(account_id) {
            return false;
        }
        self.owners.push(account_id.clone());
        true
    }

    /// Remove an owner together with anything queued for it.
    pub fn remove_owner(&mut self, account_id: &AccountId) {
        self.owners.retain(|o| o != account_id);
        self.pending.remove(account_id);
    }

    /// Append to history, evicting the oldest entry beyond capacity.
    pub fn push_history(&mut self, entry: HistoryEntry) {
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(entry);
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.iter().cloned().collect()
    }

    #[cfg(test)]
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    #[cfg(test)]
    pub fn unread(&self) -> u32 {
        self.unread
    }

    /// Bump the unread counter and return the new value.
    pub fn mark_unread(&mut self) -> u32 {
        self.unread = self.unread.saturating_add(1);
        self.unread
    }

    pub fn reset_unread(&mut self) {
        self.unread = 0;
    }

    pub fn dashboard_entry(&self) -> DashboardEntry {
        DashboardEntry {
            channel_id: self.id.clone(),
            unread: self.unread,
        }
    }

    pub fn enqueue_pending(&mut self, owner: &AccountId, message: PendingMessage) {
        self.pending
            .entry(owner.clone())
            .or_default()
            .push_back(message);
    }

    /// Drain everything queued for `owner`, oldest first.
    pub fn take_pending(&mut self, owner: &AccountId) -> Vec<PendingMessage> {
        self.pending
            .remove(owner)
            .map(Vec::from)
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn pending_len(&self, owner: &AccountId) -> usize {
        self.pending.get(owner).map_or(0, VecDeque::len)
    }
}

#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: HashMap<ChannelId, Channel>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a channel, creating an empty one if unseen.
    ///
    /// The caller must add an owner before yielding.
    pub fn ensure(&mut self, id: &ChannelId) -> &mut Channel {
        self.channels
            .entry(id.clone())
            .or_insert_with(|| Channel::new(id.clone()))
    }

    pub fn get(&self, id: &ChannelId) -> Option<&Channel> {
        self.channels.get(id)
    }

    pub fn get_mut(&mut self, id: &ChannelId) -> Option<&mut Channel> {
        self.channels.get_mut(id)
    }

    pub fn remove(&mut self, id: &ChannelId) -> Option<Channel> {
        self.channels.remove(id)
    }

    #[cfg(test)]
    pub fn contains(&self, id: &ChannelId) -> bool {
        self.channels.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }
}

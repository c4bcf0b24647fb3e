//! Connection presence and group fan-out.
//!
//! Every live WebSocket is registered here with the sender half of its
//! outbound queue. Connections join named groups (an account, a channel's
//! live group, the admins) and the hub addresses either one connection or a
//! whole group. Sends never block: a connection whose writer is gone simply
//! misses the event.

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use parkping_shared::protocol::ServerEvent;
use parkping_shared::types::{AccountId, ChannelId};

/// Identifier of one WebSocket connection.
pub type ConnectionId = Uuid;

/// What the hub hands to a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(ServerEvent),
    /// Close the socket with the given reason.
    Close(String),
}

pub type OutboundTx = mpsc::UnboundedSender<Outbound>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Group {
    /// Every connection authenticated as the account.
    Account(AccountId),
    /// Owner connections currently present in a channel.
    Channel(ChannelId),
    /// Strangers who alerted or wrote into a channel. They hear owner
    /// replies but never count as presence.
    Visitors(ChannelId),
    /// Admin-role connections.
    Admins,
}

impl std::fmt::Display for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Group::Account(id) => write!(f, "account:{id}"),
            Group::Channel(id) => write!(f, "channel:{id}"),
            Group::Visitors(id) => write!(f, "visitors:{id}"),
            Group::Admins => f.write_str("admins"),
        }
    }
}

#[derive(Default)]
pub struct Presence {
    connections: HashMap<ConnectionId, OutboundTx>,
    groups: HashMap<Group, HashSet<ConnectionId>>,
    memberships: HashMap<ConnectionId, HashSet<Group>>,
}

impl Presence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, conn: ConnectionId, tx: OutboundTx) {
        self.connections.insert(conn, tx);
        debug!(conn = %conn, total = self.connections.len(), "Connection registered");
    }

    /// Forget a connection and leave every group it joined.
    /// Returns `false` if it was not connected.
    pub fn disconnect(&mut self, conn: &ConnectionId) -> bool {
        let known = self.connections.remove(conn).is_some();
        if let Some(groups) = self.memberships.remove(conn) {
            for group in groups {
                self.remove_member(&group, conn);
            }
        }
        if known {
            debug!(conn = %conn, total = self.connections.len(), "Connection removed");
        }
        known
    }

    pub fn is_connected(&self, conn: &ConnectionId) -> bool {
        self.connections.contains_key(conn)
    }

    /// Join a group. Joining twice is a no-op; unknown connections are ignored.
    pub fn join(&mut self, conn: ConnectionId, group: Group) {
        if !self.is_connected(&conn) {
            return;
        }
        self.memberships
            .entry(conn)
            .or_default()
            .insert(group.clone());
        self.groups.entry(group).or_default().insert(conn);
    }

    pub fn leave(&mut self, conn: &ConnectionId, group: &Group) {
        if let Some(groups) = self.memberships.get_mut(conn) {
            groups.remove(group);
        }
        self.remove_member(group, conn);
    }

    /// Leave every channel and visitor group, keeping account/admin groups.
    pub fn leave_channels(&mut self, conn: &ConnectionId) {
        let groups: Vec<Group> = self
            .memberships
            .get(conn)
            .map(|groups| {
                groups
                    .iter()
                    .filter(|g| matches!(g, Group::Channel(_) | Group::Visitors(_)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for group in &groups {
            self.leave(conn, group);
        }
    }

    fn remove_member(&mut self, group: &Group, conn: &ConnectionId) {
        let now_empty = match self.groups.get_mut(group) {
            Some(members) => {
                members.remove(conn);
                members.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.groups.remove(group);
        }
    }

    #[cfg(test)]
    pub fn is_member(&self, conn: &ConnectionId, group: &Group) -> bool {
        self.groups
            .get(group)
            .is_some_and(|members| members.contains(conn))
    }

    /// Whether nobody but `except` is in the group.
    pub fn is_empty(&self, group: &Group, except: Option<&ConnectionId>) -> bool {
        self.groups.get(group).map_or(true, |members| {
            members.iter().all(|member| Some(member) == except)
        })
    }

    pub fn members(&self, group: &Group) -> Vec<ConnectionId> {
        self.groups
            .get(group)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn send_to(&self, conn: &ConnectionId, event: ServerEvent) {
        self.deliver(conn, Outbound::Event(event));
    }

    /// Send to every member of `group` except `except`.
    /// Returns how many connections were addressed.
    pub fn send_to_group(
        &self,
        group: &Group,
        event: &ServerEvent,
        except: Option<&ConnectionId>,
    ) -> usize {
        let Some(members) = self.groups.get(group) else {
            return 0;
        };
        let mut sent = 0;
        for member in members {
            if Some(member) == except {
                continue;
            }
            self.deliver(member, Outbound::Event(event.clone()));
            sent += 1;
        }
        sent
    }

    /// Close every connection in `group` and forget them.
    /// Returns the ids of the closed connections.
    pub fn disconnect_group(&mut self, group: &Group, reason: &str) -> Vec<ConnectionId> {
        let members = self.members(group);
        for conn in &members {
            self.deliver(conn, Outbound::Close(reason.to_string()));
            self.disconnect(conn);
        }
        if !members.is_empty() {
            info!(group = %group, closed = members.len(), reason, "Force-disconnected group");
        }
        members
    }

    /// Drop a group's membership without closing its connections.
    pub fn clear_group(&mut self, group: &Group) {
        if let Some(members) = self.groups.remove(group) {
            for conn in members {
                if let Some(groups) = self.memberships.get_mut(&conn) {
                    groups.remove(group);
                }
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn deliver(&self, conn: &ConnectionId, outbound: Outbound) {
        let Some(tx) = self.connections.get(conn) else {
            return;
        };
        if tx.send(outbound).is_err() {
            debug!(conn = %conn, "Dropping event for closed connection");
        }
    }
}

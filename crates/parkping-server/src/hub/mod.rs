//! The relay hub.
//!
//! A single tokio task owns every registry (accounts, channels, alarms,
//! presence, sessions). Connections and alarm tickers only talk to it
//! through channels, so handlers run one at a time and each runs to
//! completion without awaiting. Anything that must wait on I/O (push
//! delivery) is handed off to its own task and never comes back to mutate
//! state.

mod escalation;
mod moderation;
mod routing;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use parkping_shared::constants::ALARM_PULSE_BUDGET;
use parkping_shared::protocol::{
    Ack, AuthenticateRequest, ChannelRequest, ClientEvent, ClientFrame, DashboardEntry,
    HistorySync, RegistrySummary, ServerEvent,
};
use parkping_shared::types::{AccountId, ChannelId, Role};

use crate::accounts::{AccountRegistry, Login};
use crate::alarm::{AlarmPulse, AlarmScheduler};
use crate::channels::ChannelRegistry;
use crate::config::HubConfig;
use crate::error::HubError;
use crate::presence::{ConnectionId, Group, OutboundTx, Presence};
use crate::push::PushDispatcher;

// ---------------------------------------------------------------------------
// Command types
// ---------------------------------------------------------------------------

/// Commands sent *into* the hub task.
#[derive(Debug)]
pub enum HubCommand {
    /// A WebSocket was accepted.
    Connect {
        conn: ConnectionId,
        tx: OutboundTx,
    },
    /// A WebSocket closed.
    Disconnect { conn: ConnectionId },
    /// A decoded inbound frame.
    Inbound {
        conn: ConnectionId,
        frame: ClientFrame,
    },
    /// Request a snapshot of the hub counters.
    Stats(oneshot::Sender<RegistrySummary>),
}

/// Cloneable handle used by the HTTP layer to reach the hub task.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    /// Queue a command. Returns `false` if the hub has shut down.
    pub async fn send(&self, command: HubCommand) -> bool {
        self.tx.send(command).await.is_ok()
    }

    pub async fn stats(&self) -> Option<RegistrySummary> {
        let (reply, rx) = oneshot::channel();
        if !self.send(HubCommand::Stats(reply)).await {
            return None;
        }
        rx.await.ok()
    }
}

/// What a connection is authenticated as.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Session {
    Anonymous,
    Owner(AccountId),
    Admin,
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

pub struct Hub {
    config: HubConfig,
    accounts: AccountRegistry,
    channels: ChannelRegistry,
    alarms: AlarmScheduler,
    presence: Presence,
    sessions: HashMap<ConnectionId, Session>,
    push: Arc<dyn PushDispatcher>,
}

impl Hub {
    /// Create a hub and the receiver its alarm tickers report to.
    pub fn new(
        config: HubConfig,
        push: Arc<dyn PushDispatcher>,
    ) -> (Self, mpsc::UnboundedReceiver<AlarmPulse>) {
        let (pulse_tx, pulse_rx) = mpsc::unbounded_channel();
        let alarms = AlarmScheduler::new(config.pulse_interval, ALARM_PULSE_BUDGET, pulse_tx);
        let hub = Self {
            config,
            accounts: AccountRegistry::new(),
            channels: ChannelRegistry::new(),
            alarms,
            presence: Presence::new(),
            sessions: HashMap::new(),
            push,
        };
        (hub, pulse_rx)
    }

    /// Apply one command.
    pub fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Connect { conn, tx } => {
                self.presence.connect(conn, tx);
                self.sessions.insert(conn, Session::Anonymous);
            }
            HubCommand::Disconnect { conn } => self.on_disconnect(&conn),
            HubCommand::Inbound { conn, frame } => self.on_frame(conn, frame),
            HubCommand::Stats(reply) => {
                let _ = reply.send(self.summary());
            }
        }
    }

    fn on_disconnect(&mut self, conn: &ConnectionId) {
        self.sessions.remove(conn);
        if self.presence.disconnect(conn) {
            debug!(conn = %conn, "Connection closed");
        }
    }

    fn on_frame(&mut self, conn: ConnectionId, frame: ClientFrame) {
        // Force-disconnected connections may still have frames in flight.
        if !self.sessions.contains_key(&conn) {
            debug!(conn = %conn, "Ignoring frame from closed connection");
            return;
        }

        let request_id = frame.request_id;
        let ack = match frame.event {
            ClientEvent::Authenticate(req) => Some(self.authenticate(conn, req, request_id)),
            ClientEvent::RegisterChannel(req) => Some(
                self.register_channel(conn, &req)
                    .map(|dashboard| Ack::ok(request_id).with_dashboard(dashboard)),
            ),
            ClientEvent::FocusChannel(req) => {
                Some(self.focus(conn, &req).map(|()| Ack::ok(request_id)))
            }
            ClientEvent::BlurChannel(req) => {
                Some(self.blur(conn, &req).map(|()| Ack::ok(request_id)))
            }
            ClientEvent::TriggerAlert(channel_id) => {
                self.trigger_alert(conn, &channel_id);
                None
            }
            ClientEvent::SendChat(req) => {
                Some(self.send_chat(conn, req).map(|()| Ack::ok(request_id)))
            }
            ClientEvent::SendAudio(req) => {
                Some(self.send_audio(conn, req).map(|()| Ack::ok(request_id)))
            }
            ClientEvent::DeleteSelf(req) => {
                // The caller's own socket is closed by the cascade, so the
                // ack goes out first.
                let verified = self.accounts.verify(&req.id, &req.secret).map(|_| ());
                match verified {
                    Ok(()) => {
                        self.presence.send_to(&conn, ServerEvent::Ack(Ack::ok(request_id)));
                        self.delete_account(&req.id, "account deleted");
                        None
                    }
                    Err(e) => Some(Err(e)),
                }
            }
            ClientEvent::AdminAction(req) => {
                Some(self.admin_action(&req).map(|()| Ack::ok(request_id)))
            }
            ClientEvent::AdminRefresh => match self.sessions.get(&conn) {
                Some(Session::Admin) => {
                    self.presence
                        .send_to(&conn, ServerEvent::AdminSnapshot(self.admin_snapshot()));
                    None
                }
                _ => Some(Err(HubError::Unauthorized)),
            },
        };

        if let Some(result) = ack {
            let ack = result.unwrap_or_else(|e| Ack::failure(request_id, e.to_string()));
            self.presence.send_to(&conn, ServerEvent::Ack(ack));
        }
    }

    // -----------------------------------------------------------------------
    // Account registry
    // -----------------------------------------------------------------------

    fn authenticate(
        &mut self,
        conn: ConnectionId,
        req: AuthenticateRequest,
        request_id: Option<u64>,
    ) -> Result<Ack, HubError> {
        if req.id.as_str() == self.config.admin_id {
            if !self.is_admin_secret(&req.secret) {
                warn!(conn = %conn, "Rejected administrator login");
                return Err(HubError::InvalidCredential);
            }
            self.set_session(conn, Session::Admin);
            self.presence.join(conn, Group::Admins);
            info!(conn = %conn, "Administrator logged in");
            self.presence
                .send_to(&conn, ServerEvent::AdminSnapshot(self.admin_snapshot()));
            return Ok(Ack::ok(request_id).with_role(Role::Admin));
        }

        let login = self.accounts.login(&req.id, &req.secret, req.device_token)?;

        self.set_session(conn, Session::Owner(req.id.clone()));
        self.presence.join(conn, Group::Account(req.id.clone()));
        info!(account = %req.id, conn = %conn, ?login, "Owner logged in");

        match login {
            Login::Registered => self.broadcast_admin_snapshot(),
            Login::Returning => self.acknowledge_sole_owner_alarms(&req.id),
        }

        Ok(Ack::ok(request_id)
            .with_role(Role::Owner)
            .with_dashboard(self.dashboard(&req.id)))
    }

    /// Switch the identity of a connection.
    ///
    /// A changed identity drops every group joined under the old one,
    /// channel presence included.
    fn set_session(&mut self, conn: ConnectionId, session: Session) {
        let previous = self.sessions.insert(conn, session.clone());
        match previous {
            Some(previous) if previous == session => return,
            Some(Session::Owner(id)) => self.presence.leave(&conn, &Group::Account(id)),
            Some(Session::Admin) => self.presence.leave(&conn, &Group::Admins),
            Some(Session::Anonymous) | None => {}
        }
        self.presence.leave_channels(&conn);
    }

    /// Whether `conn` is logged in as one of the channel's owners.
    fn speaks_as_owner(&self, conn: &ConnectionId, channel_id: &ChannelId) -> bool {
        let Some(Session::Owner(id)) = self.sessions.get(conn) else {
            return false;
        };
        self.channels
            .get(channel_id)
            .is_some_and(|channel| channel.is_owner(id))
    }

    /// The calling connection must be logged in as `account_id`.
    fn require_owner_session(
        &self,
        conn: &ConnectionId,
        account_id: &AccountId,
    ) -> Result<(), HubError> {
        match self.sessions.get(conn) {
            Some(Session::Owner(id)) if id == account_id => Ok(()),
            _ => Err(HubError::Unauthorized),
        }
    }

    fn dashboard(&self, account_id: &AccountId) -> Vec<DashboardEntry> {
        let Some(account) = self.accounts.get(account_id) else {
            return Vec::new();
        };
        account
            .channels
            .iter()
            .filter_map(|id| self.channels.get(id))
            .map(|channel| channel.dashboard_entry())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Channel registry
    // -----------------------------------------------------------------------

    fn register_channel(
        &mut self,
        conn: ConnectionId,
        req: &ChannelRequest,
    ) -> Result<Vec<DashboardEntry>, HubError> {
        self.require_owner_session(&conn, &req.account_id)?;
        let account = self
            .accounts
            .get_mut(&req.account_id)
            .ok_or_else(|| HubError::NotFound(req.account_id.to_string()))?;

        account.add_channel(&req.channel_id);
        let channel = self.channels.ensure(&req.channel_id);
        if channel.add_owner(&req.account_id) {
            info!(
                account = %req.account_id,
                channel = %req.channel_id,
                owners = channel.owners().len(),
                "Owner joined channel"
            );
        }

        Ok(self.dashboard(&req.account_id))
    }

    /// Open a channel: present in its live group, alarm acknowledged,
    /// history and queued messages delivered, unread cleared for everyone.
    fn focus(&mut self, conn: ConnectionId, req: &ChannelRequest) -> Result<(), HubError> {
        self.require_owner_session(&conn, &req.account_id)?;
        let Some(channel) = self.channels.get_mut(&req.channel_id) else {
            debug!(channel = %req.channel_id, "Focus on unknown channel ignored");
            return Ok(());
        };
        if !channel.is_owner(&req.account_id) {
            debug!(
                account = %req.account_id,
                channel = %req.channel_id,
                "Focus by non-owner ignored"
            );
            return Ok(());
        }

        let history = HistorySync {
            channel_id: req.channel_id.clone(),
            entries: channel.history(),
        };
        let pending = channel.take_pending(&req.account_id);
        channel.reset_unread();
        let reset = ServerEvent::DashboardUpdate(channel.dashboard_entry());
        let owners = channel.owners().to_vec();

        self.presence
            .join(conn, Group::Channel(req.channel_id.clone()));
        self.alarms.cancel(&req.channel_id);

        self.presence.send_to(&conn, ServerEvent::HistorySync(history));
        let replayed = pending.len();
        for message in pending {
            self.presence.send_to(&conn, message.into_event());
        }
        for owner in &owners {
            self.presence
                .send_to_group(&Group::Account(owner.clone()), &reset, None);
        }

        debug!(
            account = %req.account_id,
            channel = %req.channel_id,
            replayed,
            "Channel focused"
        );
        Ok(())
    }

    fn blur(&mut self, conn: ConnectionId, req: &ChannelRequest) -> Result<(), HubError> {
        self.require_owner_session(&conn, &req.account_id)?;
        self.presence
            .leave(&conn, &Group::Channel(req.channel_id.clone()));
        Ok(())
    }

    /// Tell every owner's devices the channel's current unread count.
    fn notify_dashboards(&self, channel_id: &ChannelId, except: Option<&str>) {
        let Some(channel) = self.channels.get(channel_id) else {
            return;
        };
        let update = ServerEvent::DashboardUpdate(channel.dashboard_entry());
        for owner in channel.owners() {
            if Some(owner.as_str()) == except {
                continue;
            }
            self.presence
                .send_to_group(&Group::Account(owner.clone()), &update, None);
        }
    }

    fn is_online(&self, account_id: &AccountId) -> bool {
        !self
            .presence
            .is_empty(&Group::Account(account_id.clone()), None)
    }

    fn summary(&self) -> RegistrySummary {
        RegistrySummary {
            accounts: self.accounts.len(),
            blocked: self.accounts.blocked_count(),
            channels: self.channels.len(),
            active_alarms: self.alarms.live_count(),
            connections: self.presence.connection_count(),
        }
    }
}

/// Spawn the hub task. Returns the handle used to reach it.
pub fn spawn_hub(hub: Hub, pulses: mpsc::UnboundedReceiver<AlarmPulse>) -> HubHandle {
    let (tx, rx) = mpsc::channel(1024);
    tokio::spawn(run(hub, rx, pulses));
    HubHandle { tx }
}

async fn run(
    mut hub: Hub,
    mut commands: mpsc::Receiver<HubCommand>,
    mut pulses: mpsc::UnboundedReceiver<AlarmPulse>,
) {
    info!("Hub task started");
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => hub.handle(command),
                None => break,
            },
            Some(pulse) = pulses.recv() => hub.alarm_pulse(&pulse),
        }
    }
    info!("Hub task stopped");
}

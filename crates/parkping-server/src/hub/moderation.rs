//! Administrative block/delete and the cascading account removal shared
//! with self-delete.

use subtle::ConstantTimeEq;
use tracing::{info, warn};

use parkping_shared::protocol::{AdminActionKind, AdminActionRequest, AdminSnapshot, ServerEvent};
use parkping_shared::types::AccountId;

use super::Hub;
use crate::config::SnapshotPolicy;
use crate::error::HubError;
use crate::presence::Group;

impl Hub {
    /// Constant-time comparison against the administrator secret.
    pub(super) fn is_admin_secret(&self, candidate: &str) -> bool {
        let candidate = candidate.as_bytes();
        let expected = self.config.admin_secret.as_bytes();
        candidate.len() == expected.len() && candidate.ct_eq(expected).unwrap_u8() == 1
    }

    pub(super) fn admin_action(&mut self, req: &AdminActionRequest) -> Result<(), HubError> {
        if !self.is_admin_secret(&req.admin_secret) {
            warn!(target_account = %req.target_id, "Admin action with wrong secret");
            return Err(HubError::Unauthorized);
        }
        if !self.accounts.contains(&req.target_id) {
            return Err(HubError::NotFound(req.target_id.to_string()));
        }

        match req.action {
            AdminActionKind::Block => {
                let blocked = self.accounts.toggle_block(&req.target_id)?;
                if blocked {
                    let closed = self
                        .presence
                        .disconnect_group(&Group::Account(req.target_id.clone()), "account blocked");
                    for conn in closed {
                        self.sessions.remove(&conn);
                    }
                }
                self.broadcast_admin_snapshot();
            }
            AdminActionKind::Delete => {
                self.delete_account(&req.target_id, "account deleted by administrator");
            }
        }
        Ok(())
    }

    /// Remove an account and everything hanging off it.
    ///
    /// Channels left without owners are destroyed together with their
    /// history, queues, live group and alarm. All of this happens before
    /// the handler returns. Deleting an unknown id is a no-op.
    pub(super) fn delete_account(&mut self, account_id: &AccountId, reason: &str) {
        let Some(account) = self.accounts.remove(account_id) else {
            return;
        };

        let mut destroyed = 0;
        for channel_id in &account.channels {
            let orphaned = match self.channels.get_mut(channel_id) {
                Some(channel) => {
                    channel.remove_owner(account_id);
                    channel.owners().is_empty()
                }
                None => false,
            };
            if orphaned {
                self.channels.remove(channel_id);
                self.alarms.cancel(channel_id);
                self.presence.clear_group(&Group::Channel(channel_id.clone()));
                self.presence.clear_group(&Group::Visitors(channel_id.clone()));
                destroyed += 1;
            }
        }

        let closed = self
            .presence
            .disconnect_group(&Group::Account(account_id.clone()), reason);
        for conn in &closed {
            self.sessions.remove(conn);
        }

        info!(
            account = %account_id,
            channels_destroyed = destroyed,
            connections_closed = closed.len(),
            reason,
            "Account removed"
        );
        self.broadcast_admin_snapshot();
    }

    pub(super) fn admin_snapshot(&self) -> AdminSnapshot {
        let accounts = match self.config.snapshot_policy {
            SnapshotPolicy::Summary => None,
            SnapshotPolicy::Full => Some(
                self.accounts
                    .sorted()
                    .into_iter()
                    .map(|account| account.summary(self.is_online(&account.id)))
                    .collect(),
            ),
        };
        AdminSnapshot {
            summary: self.summary(),
            accounts,
        }
    }

    pub(super) fn broadcast_admin_snapshot(&self) {
        if self.presence.is_empty(&Group::Admins, None) {
            return;
        }
        let snapshot = ServerEvent::AdminSnapshot(self.admin_snapshot());
        self.presence.send_to_group(&Group::Admins, &snapshot, None);
    }
}

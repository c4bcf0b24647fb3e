use chrono::Utc;
use tracing::{debug, info};

use parkping_shared::protocol::{RingNotice, ServerEvent};
use parkping_shared::types::{AccountId, ChannelId};

use super::Hub;
use crate::alarm::{AlarmPulse, PulseOutcome};
use crate::presence::{ConnectionId, Group};
use crate::push::PushNotification;

impl Hub {
    /// A stranger scanned the channel's code.
    ///
    /// Idle -> Ringing only: while a timer is live, repeated triggers do
    /// nothing at all.
    pub(super) fn trigger_alert(&mut self, conn: ConnectionId, channel_id: &ChannelId) {
        let has_owners = self
            .channels
            .get(channel_id)
            .is_some_and(|channel| !channel.owners().is_empty());
        if !has_owners {
            debug!(channel = %channel_id, "Alert for unknown channel ignored");
            return;
        }
        if self.alarms.start(channel_id).is_none() {
            return;
        }

        if let Some(channel) = self.channels.get_mut(channel_id) {
            channel.mark_unread();
        }
        self.notify_dashboards(channel_id, None);

        let live = Group::Channel(channel_id.clone());
        let ring = ServerEvent::Ring(RingNotice {
            channel_id: channel_id.clone(),
            triggered_at: Utc::now(),
        });
        let rung = self.presence.send_to_group(&live, &ring, Some(&conn));
        if !self.speaks_as_owner(&conn, channel_id) {
            self.presence
                .join(conn, Group::Visitors(channel_id.clone()));
        }

        info!(channel = %channel_id, rung, "Alert triggered");
    }

    /// One escalation tick. The channel may have disappeared since the
    /// ticker fired; that ends the pulse quietly.
    pub(super) fn alarm_pulse(&mut self, pulse: &AlarmPulse) {
        let count = match self.alarms.record_pulse(pulse) {
            PulseOutcome::Stale => {
                debug!(channel = %pulse.channel_id, "Stale alarm pulse dropped");
                return;
            }
            PulseOutcome::Fired(n) | PulseOutcome::Exhausted(n) => n,
        };

        let Some(channel) = self.channels.get(&pulse.channel_id) else {
            self.alarms.cancel(&pulse.channel_id);
            return;
        };

        let mut dispatched = 0;
        for owner in channel.owners() {
            let token = self
                .accounts
                .get(owner)
                .and_then(|account| account.device_token.as_deref());
            if let Some(token) = token {
                self.push
                    .dispatch(PushNotification::alert(token, &pulse.channel_id, count));
                dispatched += 1;
            }
        }

        debug!(
            channel = %pulse.channel_id,
            pulse = count,
            dispatched,
            "Alarm pulse"
        );
    }

    /// A returning owner logging in acknowledges alarms on channels they
    /// own alone.
    pub(super) fn acknowledge_sole_owner_alarms(&mut self, account_id: &AccountId) {
        let Some(account) = self.accounts.get(account_id) else {
            return;
        };
        let sole: Vec<ChannelId> = account
            .channels
            .iter()
            .filter(|id| {
                self.channels
                    .get(id)
                    .is_some_and(|channel| channel.owners() == std::slice::from_ref(account_id))
            })
            .cloned()
            .collect();

        for channel_id in sole {
            self.alarms.cancel(&channel_id);
        }
    }
}

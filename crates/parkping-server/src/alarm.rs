//! Alarm escalation timers.
//!
//! Each channel is either **Idle** (no entry in the table) or **Ringing**
//! (one live [`AlarmTimer`]). A ringing timer owns a ticker task that sends
//! an [`AlarmPulse`] to the hub at a fixed interval. The hub applies the
//! pulse with [`AlarmScheduler::record_pulse`], which is the only place
//! the pulse count moves.
//!
//! Pulses carry the generation of the timer that emitted them. A pulse
//! that arrives after its timer was cancelled (or replaced by a newer one)
//! is reported as [`PulseOutcome::Stale`] and ignored.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use parkping_shared::types::ChannelId;

/// One tick of a ringing timer, delivered to the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmPulse {
    pub channel_id: ChannelId,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmState {
    Idle,
    Ringing,
}

/// What applying a pulse did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseOutcome {
    /// The timer is gone or was replaced. Nothing to do.
    Stale,
    /// Pulse `n` fired; the timer keeps ringing.
    Fired(u32),
    /// Pulse `n` fired and used up the budget; the timer is now idle.
    Exhausted(u32),
}

/// Escalation state of one channel.
#[derive(Debug)]
pub struct AlarmTimer {
    pub pulse_count: u32,
    pub generation: u64,
    state: AlarmState,
    ticker: AbortHandle,
}

impl AlarmTimer {
    pub fn is_live(&self) -> bool {
        self.state == AlarmState::Ringing
    }

    fn stop(&mut self) {
        self.state = AlarmState::Idle;
        self.ticker.abort();
    }
}

/// Table of live alarm timers, at most one per channel.
pub struct AlarmScheduler {
    timers: HashMap<ChannelId, AlarmTimer>,
    interval: Duration,
    budget: u32,
    next_generation: u64,
    pulses: mpsc::UnboundedSender<AlarmPulse>,
}

impl AlarmScheduler {
    pub fn new(
        interval: Duration,
        budget: u32,
        pulses: mpsc::UnboundedSender<AlarmPulse>,
    ) -> Self {
        Self {
            timers: HashMap::new(),
            interval,
            budget,
            next_generation: 0,
            pulses,
        }
    }

    /// Start ringing `channel_id`.
    ///
    /// Returns the new timer's generation, or `None` if a timer is already
    /// live for the channel (the existing one is left untouched).
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self, channel_id: &ChannelId) -> Option<u64> {
        if self.is_live(channel_id) {
            debug!(channel = %channel_id, "Alarm already ringing");
            return None;
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let ticker = spawn_ticker(
            channel_id.clone(),
            generation,
            self.interval,
            self.pulses.clone(),
        );

        self.timers.insert(
            channel_id.clone(),
            AlarmTimer {
                pulse_count: 0,
                generation,
                state: AlarmState::Ringing,
                ticker,
            },
        );

        info!(
            channel = %channel_id,
            generation,
            interval_secs = self.interval.as_secs(),
            budget = self.budget,
            "Alarm started"
        );
        Some(generation)
    }

    /// Stop ringing `channel_id`. Returns `false` if it was already idle.
    pub fn cancel(&mut self, channel_id: &ChannelId) -> bool {
        match self.timers.remove(channel_id) {
            Some(mut timer) => {
                timer.stop();
                info!(
                    channel = %channel_id,
                    pulses = timer.pulse_count,
                    "Alarm acknowledged"
                );
                true
            }
            None => false,
        }
    }

    /// Apply one pulse from a ticker.
    pub fn record_pulse(&mut self, pulse: &AlarmPulse) -> PulseOutcome {
        let Some(timer) = self.timers.get_mut(&pulse.channel_id) else {
            return PulseOutcome::Stale;
        };
        if timer.generation != pulse.generation || !timer.is_live() {
            return PulseOutcome::Stale;
        }

        timer.pulse_count += 1;
        let count = timer.pulse_count;
        if count < self.budget {
            return PulseOutcome::Fired(count);
        }

        if let Some(mut timer) = self.timers.remove(&pulse.channel_id) {
            timer.stop();
        }
        info!(channel = %pulse.channel_id, pulses = count, "Alarm budget exhausted");
        PulseOutcome::Exhausted(count)
    }

    pub fn is_live(&self, channel_id: &ChannelId) -> bool {
        self.timers.get(channel_id).is_some_and(AlarmTimer::is_live)
    }

    #[cfg(test)]
    pub fn get(&self, channel_id: &ChannelId) -> Option<&AlarmTimer> {
        self.timers.get(channel_id)
    }

    pub fn live_count(&self) -> usize {
        self.timers.values().filter(|t| t.is_live()).count()
    }
}

impl Drop for AlarmScheduler {
    fn drop(&mut self) {
        for timer in self.timers.values_mut() {
            timer.stop();
        }
    }
}

fn spawn_ticker(
    channel_id: ChannelId,
    generation: u64,
    period: Duration,
    pulses: mpsc::UnboundedSender<AlarmPulse>,
) -> AbortHandle {
    let handle = tokio::spawn(async move {
        // First pulse one period after the alert; the immediate ring is
        // sent by the hub itself.
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let pulse = AlarmPulse {
                channel_id: channel_id.clone(),
                generation,
            };
            if pulses.send(pulse).is_err() {
                break;
            }
        }
    });
    handle.abort_handle()
}

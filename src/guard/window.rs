use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::guard::policy::PolicyConfig;
use crate::guard::signal::{Event, SignalType};

/// Live contents of one window at the instant of the read.
#[derive(Debug, Clone, Default)]
pub struct WindowSnapshot {
    pub count: usize,
    pub events: Vec<Event>,
}

impl WindowSnapshot {
    /// Distinct actors in arrival order.
    pub fn actors(&self) -> Vec<u64> {
        let mut out: Vec<u64> = Vec::with_capacity(self.events.len());
        for e in &self.events {
            if !out.contains(&e.actor_id) {
                out.push(e.actor_id);
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    event: Event,
}

/// Per (guild, signal) time-pruned event windows.
///
/// Sharded via DashMap, so different guilds never contend on one lock.
/// Every recorded event gets a registry-wide sequence number; readers can
/// ask for "only what arrived after seq N" regardless of timestamps.
#[derive(Debug, Default)]
pub struct SignalWindowRegistry {
    windows: DashMap<(u64, SignalType), VecDeque<Entry>>,
    next_seq: AtomicU64,
}

fn cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let w = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
    now.checked_sub_signed(w).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn prune(q: &mut VecDeque<Entry>, now: DateTime<Utc>, window: Duration) {
    let cut = cutoff(now, window);
    while q.front().is_some_and(|e| e.event.timestamp < cut) {
        q.pop_front();
    }
}

impl SignalWindowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the event unless its actor is whitelisted.
    /// Returns the sequence number it was recorded under.
    pub fn record(&self, guild_id: u64, event: Event, policy: &PolicyConfig) -> Option<u64> {
        if policy.is_whitelisted(event.actor_id) {
            return None;
        }
        let mut q = self
            .windows
            .entry((guild_id, event.signal))
            .or_insert_with(|| VecDeque::with_capacity(32));
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        q.push_back(Entry { seq, event });
        Some(seq)
    }

    /// Prune then read. Entries older than `now - window` are dropped for good.
    pub fn count(
        &self,
        guild_id: u64,
        signal: SignalType,
        now: DateTime<Utc>,
        window: Duration,
    ) -> WindowSnapshot {
        self.count_after(guild_id, signal, now, window, None)
    }

    /// Like [`count`](Self::count), but only entries recorded after `after_seq` are seen.
    /// Pruning still applies to the whole window.
    pub fn count_after(
        &self,
        guild_id: u64,
        signal: SignalType,
        now: DateTime<Utc>,
        window: Duration,
        after_seq: Option<u64>,
    ) -> WindowSnapshot {
        let Some(mut q) = self.windows.get_mut(&(guild_id, signal)) else {
            return WindowSnapshot::default();
        };
        prune(&mut q, now, window);
        let floor = after_seq.unwrap_or(0);
        let events: Vec<Event> = q
            .iter()
            .filter(|e| e.seq > floor)
            .map(|e| e.event.clone())
            .collect();
        WindowSnapshot {
            count: events.len(),
            events,
        }
    }

    /// Drop windows with no event newer than `idle`. Returns how many were removed.
    pub fn sweep(&self, now: DateTime<Utc>, idle: Duration) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, q| {
            prune(q, now, idle);
            !q.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    pub fn forget_guild(&self, guild_id: u64) {
        self.windows.retain(|(gid, _), _| *gid != guild_id);
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

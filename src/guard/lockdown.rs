//! Lockdown – odebranie SEND_MESSAGES dla @everyone na kanałach tekstowych.
//!
//! Zapamiętujemy tylko kanały, które faktycznie udało się zablokować,
//! i tylko te przywracamy przy `unlock` (nie ruszamy ręcznych blokad).

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::PlatformError;
use crate::guard::retry::RetryPolicy;
use crate::platform::{GuildApi, PlatformResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockdownRecord {
    pub active: bool,
    pub reason: String,
    pub touched_channel_ids: BTreeSet<u64>,
    pub activated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnlockReport {
    pub restored: Vec<u64>,
    /// Channels deleted since the lockdown.
    pub gone: Vec<u64>,
    /// Edit failed; kept in the record for a later unlock.
    pub failed: Vec<u64>,
}

type Slot = Arc<Mutex<Option<LockdownRecord>>>;

pub struct LockdownController {
    api: Arc<dyn GuildApi>,
    retry: RetryPolicy,
    records: DashMap<u64, Slot>,
}

impl LockdownController {
    pub fn new(api: Arc<dyn GuildApi>, retry: RetryPolicy) -> Self {
        Self {
            api,
            retry,
            records: DashMap::new(),
        }
    }

    fn slot(&self, guild_id: u64) -> Slot {
        self.records
            .entry(guild_id)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Lock every editable text channel. Calling it again while active
    /// only adds channels that were not locked yet.
    pub async fn lockdown(&self, guild_id: u64, reason: &str) -> PlatformResult<LockdownRecord> {
        let slot = self.slot(guild_id);
        let mut guard = slot.lock().await;

        let channels = self
            .retry
            .run("text_channels", || self.api.text_channels(guild_id))
            .await?;

        let record = guard.get_or_insert_with(|| LockdownRecord {
            active: true,
            reason: reason.to_string(),
            touched_channel_ids: BTreeSet::new(),
            activated_at: Utc::now(),
        });

        // @everyone ma id równe id gildii
        let everyone = guild_id;
        for ch in channels {
            if record.touched_channel_ids.contains(&ch) {
                continue;
            }
            let res = self
                .retry
                .run("lock_channel", || {
                    self.api.set_channel_send_permission(ch, everyone, false, reason)
                })
                .await;
            match res {
                Ok(true) => {
                    record.touched_channel_ids.insert(ch);
                }
                // already denied by hand: not ours to lift later
                Ok(false) => {
                    tracing::debug!(guild_id, channel_id = ch, "lockdown: channel already locked, left alone");
                }
                Err(e) => {
                    tracing::warn!(guild_id, channel_id = ch, error = %e, "lockdown: channel skipped");
                }
            }
        }

        tracing::warn!(
            guild_id,
            locked = record.touched_channel_ids.len(),
            reason,
            "lockdown active"
        );
        Ok(record.clone())
    }

    /// Revert exactly the channels this controller locked.
    /// `None` when there is no active lockdown.
    pub async fn unlock(&self, guild_id: u64) -> Option<UnlockReport> {
        let slot = self.records.get(&guild_id).map(|s| s.clone())?;
        let mut guard = slot.lock().await;
        let record = guard.as_mut()?;

        let reason = format!("lockdown lifted ({})", record.reason);
        let mut report = UnlockReport::default();
        for ch in record.touched_channel_ids.iter().copied() {
            let res = self
                .retry
                .run("unlock_channel", || {
                    self.api.set_channel_send_permission(ch, guild_id, true, &reason)
                })
                .await;
            match res {
                Ok(_) => report.restored.push(ch),
                Err(PlatformError::NotFound(_)) => report.gone.push(ch),
                Err(e) => {
                    tracing::warn!(guild_id, channel_id = ch, error = %e, "unlock: channel not restored");
                    report.failed.push(ch);
                }
            }
        }

        if report.failed.is_empty() {
            *guard = None;
        } else {
            record.touched_channel_ids = report.failed.iter().copied().collect();
        }
        tracing::info!(
            guild_id,
            restored = report.restored.len(),
            gone = report.gone.len(),
            failed = report.failed.len(),
            "lockdown lifted"
        );
        Some(report)
    }

    pub async fn record(&self, guild_id: u64) -> Option<LockdownRecord> {
        let slot = self.records.get(&guild_id).map(|s| s.clone())?;
        let guard = slot.lock().await;
        guard.clone()
    }

    pub fn forget_guild(&self, guild_id: u64) {
        self.records.remove(&guild_id);
    }
}

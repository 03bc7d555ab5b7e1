//! Maszyna stanów ochrony – jedna instancja na (gildia, typ sygnału).
//!
//! Idle → Alerting → Mitigating → Cooldown → Idle.
//! Deklaracja (Idle→Alerting) i żądanie mitygacji (Alerting→Mitigating)
//! dzieją się w jednym kroku, pod blokadą właściciela stanu.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::Serialize;

use crate::guard::signal::SignalType;

static NEXT_EPISODE: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Idle,
    Alerting,
    Mitigating,
    Cooldown,
}

/// Opaque episode identity. Minted only on Idle→Alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct EpisodeId(u64);

impl EpisodeId {
    fn mint() -> Self {
        EpisodeId(NEXT_EPISODE.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for EpisodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep-{}", self.0)
    }
}

/// One detected burst. Cheap to clone; the mitigated set is shared.
#[derive(Debug, Clone)]
pub struct Episode {
    pub id: EpisodeId,
    pub guild_id: u64,
    pub signal: SignalType,
    pub started_at: DateTime<Utc>,
    mitigated: Arc<DashSet<u64>>,
    notified: Arc<AtomicBool>,
}

impl Episode {
    fn new(guild_id: u64, signal: SignalType, started_at: DateTime<Utc>) -> Self {
        Self {
            id: EpisodeId::mint(),
            guild_id,
            signal,
            started_at,
            mitigated: Arc::new(DashSet::new()),
            notified: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Atomically claim an actor for this episode. `false` = already handled.
    pub fn claim(&self, actor_id: u64) -> bool {
        self.mitigated.insert(actor_id)
    }

    /// First caller gets `true`; the alert for this episode goes out once.
    pub fn mark_notified(&self) -> bool {
        !self.notified.swap(true, Ordering::AcqRel)
    }

    pub fn is_mitigated(&self, actor_id: u64) -> bool {
        self.mitigated.contains(&actor_id)
    }

    pub fn mitigated_actor_ids(&self) -> Vec<u64> {
        let mut v: Vec<u64> = self.mitigated.iter().map(|r| *r).collect();
        v.sort_unstable();
        v
    }
}

/// Outcome of feeding one verdict into the machine.
#[derive(Debug)]
pub enum Step {
    /// Below threshold.
    Quiet,
    /// New burst: the caller must start mitigation for this episode.
    Declared(Episode),
    /// Above threshold but already covered by an open episode or cooldown.
    Covered(Mode),
}

#[derive(Debug, Clone, Serialize)]
pub struct StateView {
    pub signal: SignalType,
    pub mode: Mode,
    pub episode: Option<EpisodeId>,
    pub episode_started_at: Option<DateTime<Utc>>,
    pub mitigated_actor_ids: Vec<u64>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct ProtectionState {
    guild_id: u64,
    signal: SignalType,
    mode: Mode,
    episode: Option<Episode>,
    cooldown_until: Option<DateTime<Utc>>,
    /// Window seq of the event that declared the open episode.
    declared_seq: Option<u64>,
    /// Newest window seq attributed to any episode so far. Survives Idle.
    covered_seq: Option<u64>,
}

fn add(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl ProtectionState {
    pub fn new(guild_id: u64, signal: SignalType) -> Self {
        Self {
            guild_id,
            signal,
            mode: Mode::Idle,
            episode: None,
            cooldown_until: None,
            declared_seq: None,
            covered_seq: None,
        }
    }

    /// Which part of the window the next verdict may look at.
    ///
    /// Idle: only events newer than anything an episode already covered, so a
    /// finished burst still sitting in a long window cannot re-arm on a single
    /// newcomer. Open episode: events since its declaration.
    pub fn counts_after(&self) -> Option<u64> {
        match self.mode {
            Mode::Idle => self.covered_seq,
            _ => self.declared_seq.or(self.covered_seq),
        }
    }

    /// Attribute a recorded event to the open episode. No-op when Idle.
    pub fn cover(&mut self, seq: u64) {
        if self.mode == Mode::Idle {
            return;
        }
        if self.covered_seq.is_none_or(|c| c < seq) {
            self.covered_seq = Some(seq);
        }
        if self.declared_seq.is_none() {
            self.declared_seq = Some(seq);
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn episode(&self) -> Option<&Episode> {
        self.episode.as_ref()
    }

    pub fn cooldown_until(&self) -> Option<DateTime<Utc>> {
        self.cooldown_until
    }

    /// Feed a verdict. Check-and-set: only a caller that finds the state
    /// Idle gets `Declared`; everyone after it sees `Covered`.
    pub fn observe(&mut self, exceeded: bool, now: DateTime<Utc>, cooldown: Duration) -> Step {
        self.expire_cooldown(now);

        match self.mode {
            Mode::Idle if exceeded => {
                let episode = self.declare(now);
                self.begin_mitigation();
                Step::Declared(episode)
            }
            Mode::Idle => Step::Quiet,
            Mode::Alerting | Mode::Mitigating if exceeded => Step::Covered(self.mode),
            Mode::Alerting | Mode::Mitigating => Step::Quiet,
            Mode::Cooldown if exceeded => {
                // burst still going: push the quiet period out
                let until = add(now, cooldown);
                if self.cooldown_until.is_none_or(|u| u < until) {
                    self.cooldown_until = Some(until);
                }
                Step::Covered(Mode::Cooldown)
            }
            Mode::Cooldown => Step::Quiet,
        }
    }

    fn declare(&mut self, now: DateTime<Utc>) -> Episode {
        let episode = Episode::new(self.guild_id, self.signal, now);
        tracing::warn!(
            guild_id = self.guild_id,
            signal = %self.signal,
            episode = %episode.id,
            "guard: burst declared"
        );
        self.mode = Mode::Alerting;
        self.episode = Some(episode.clone());
        self.cooldown_until = None;
        self.declared_seq = None;
        episode
    }

    fn begin_mitigation(&mut self) {
        debug_assert_eq!(self.mode, Mode::Alerting);
        self.mode = Mode::Mitigating;
    }

    /// Executor reported back. Partial failure counts as processed.
    pub fn finish_mitigation(
        &mut self,
        episode: EpisodeId,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> bool {
        let same = self.episode.as_ref().is_some_and(|e| e.id == episode);
        if self.mode != Mode::Mitigating || !same {
            return false;
        }
        self.mode = Mode::Cooldown;
        self.cooldown_until = Some(add(now, cooldown));
        tracing::info!(
            guild_id = self.guild_id,
            signal = %self.signal,
            episode = %episode,
            until = ?self.cooldown_until,
            "guard: cooldown"
        );
        true
    }

    /// Cooldown → Idle once `cooldown_until` has passed.
    pub fn expire_cooldown(&mut self, now: DateTime<Utc>) -> bool {
        if self.mode != Mode::Cooldown || self.cooldown_until.is_some_and(|u| now < u) {
            return false;
        }
        tracing::info!(
            guild_id = self.guild_id,
            signal = %self.signal,
            episode = ?self.episode.as_ref().map(|e| e.id),
            "guard: back to idle"
        );
        self.to_idle();
        true
    }

    /// Policy disabled: drop whatever episode is open.
    pub fn reset(&mut self) -> Option<EpisodeId> {
        if self.mode == Mode::Idle {
            return None;
        }
        let dropped = self.episode.as_ref().map(|e| e.id);
        tracing::info!(
            guild_id = self.guild_id,
            signal = %self.signal,
            from = ?self.mode,
            "guard: reset to idle (protection disabled)"
        );
        self.to_idle();
        dropped
    }

    fn to_idle(&mut self) {
        self.mode = Mode::Idle;
        self.episode = None;
        self.cooldown_until = None;
        self.declared_seq = None;
    }

    pub fn view(&self) -> StateView {
        StateView {
            signal: self.signal,
            mode: self.mode,
            episode: self.episode.as_ref().map(|e| e.id),
            episode_started_at: self.episode.as_ref().map(|e| e.started_at),
            mitigated_actor_ids: self
                .episode
                .as_ref()
                .map(|e| e.mitigated_actor_ids())
                .unwrap_or_default(),
            cooldown_until: self.cooldown_until,
        }
    }
}

//! Guard – silnik ochrony gildii przed raidami (fale dołączeń) i nuke
//! (fale banów/kicków/usunięć ról i kanałów).
//!
//! Przepływ: zdarzenie → okno (`window`) → werdykt (`evaluator`) →
//! maszyna stanów (`state`) → {mitygacja, lockdown, powiadomienie}.
//!
//! Każda para (gildia, typ sygnału) ma własny slot pod `tokio::Mutex`:
//! zapis do okna, ocena i przejście stanu dzieją się pod tą blokadą,
//! więc deklaracja epizodu jest check-and-set. Zdalne wywołania idą
//! w osobnym tasku – ścieżka przyjmowania zdarzeń nigdy na nie nie czeka.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::GuardSettings;
use crate::platform::GuildApi;

pub mod evaluator;
pub mod lockdown;
pub mod mitigate;
pub mod notify;
pub mod policy;
pub mod retry;
pub mod signal;
pub mod state;
pub mod window;

use evaluator::{Verdict, evaluate_after};
use lockdown::{LockdownController, LockdownRecord, UnlockReport};
use mitigate::{MitigationExecutor, MitigationReport};
use notify::Notifier;
use policy::{MAX_WINDOW_SECS, MitigationAction, PolicyConfig, PolicyStore};
use retry::RetryPolicy;
use signal::{Event, RawPrivilegedEvent, SignalType};
use state::{Episode, EpisodeId, Mode, ProtectionState, StateView, Step};
use window::SignalWindowRegistry;

#[derive(Debug, Clone)]
pub struct GuardOptions {
    pub retry: RetryPolicy,
    pub ban_purge_seconds: u32,
    pub sweep_interval: Duration,
}

impl Default for GuardOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            ban_purge_seconds: 0,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl From<&GuardSettings> for GuardOptions {
    fn from(s: &GuardSettings) -> Self {
        Self {
            retry: RetryPolicy::new(s.retry_attempts, Duration::from_millis(s.retry_backoff_ms)),
            ban_purge_seconds: s.ban_purge_seconds,
            sweep_interval: Duration::from_secs(s.sweep_interval_seconds.max(1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Whitelisted,
    /// The bot's own mitigation showing up in the audit log.
    OwnAction,
    UnknownSignal,
    /// Policy store unreachable. Without the whitelist nothing may enter a window.
    PolicyUnavailable,
}

#[derive(Debug)]
pub struct Declaration {
    pub episode: EpisodeId,
    pub count: usize,
    /// Mitigation + notification task. Resolves after the state reached Cooldown.
    pub mitigation: JoinHandle<MitigationReport>,
}

#[derive(Debug)]
pub enum Ingest {
    Dropped(DropReason),
    Recorded {
        count: usize,
        threshold: u32,
        mode: Mode,
    },
    Declared(Declaration),
    /// Burst still going under an open episode: actors not handled yet are
    /// mitigated under that same episode.
    FollowUp(Declaration),
}

impl Ingest {
    pub fn is_declared(&self) -> bool {
        matches!(self, Ingest::Declared(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GuildStatus {
    pub guild_id: u64,
    pub signals: Vec<StateView>,
    pub lockdown: Option<LockdownRecord>,
}

struct Slot {
    state: ProtectionState,
    cooldown_timer: Option<JoinHandle<()>>,
}

impl Slot {
    fn stop_timer(&mut self) {
        if let Some(t) = self.cooldown_timer.take() {
            t.abort();
        }
    }
}

type SlotRef = Arc<Mutex<Slot>>;

pub struct GuardEngine {
    policies: Arc<dyn PolicyStore>,
    registry: SignalWindowRegistry,
    states: DashMap<(u64, SignalType), SlotRef>,
    executor: MitigationExecutor,
    lockdown: Arc<LockdownController>,
    notifier: Notifier,
    self_id: AtomicU64,
    reported_invariants: DashSet<String>,
    sweep_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl GuardEngine {
    pub fn new(
        api: Arc<dyn GuildApi>,
        policies: Arc<dyn PolicyStore>,
        options: GuardOptions,
    ) -> Arc<Self> {
        let lockdown = Arc::new(LockdownController::new(api.clone(), options.retry));
        let this = Arc::new(Self {
            policies,
            registry: SignalWindowRegistry::new(),
            states: DashMap::new(),
            executor: MitigationExecutor::new(
                api.clone(),
                lockdown.clone(),
                options.retry,
                options.ban_purge_seconds,
            ),
            lockdown,
            notifier: Notifier::new(api),
            self_id: AtomicU64::new(0),
            reported_invariants: DashSet::new(),
            sweep_task: std::sync::Mutex::new(None),
        });

        Self::spawn_sweep_task(&this, options.sweep_interval);

        this
    }

    fn spawn_sweep_task(this: &Arc<Self>, every: Duration) {
        let weak: Weak<Self> = Arc::downgrade(this);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let Some(strong) = weak.upgrade() else {
                    break;
                };
                let removed = strong
                    .registry
                    .sweep(Utc::now(), Duration::from_secs(MAX_WINDOW_SECS));
                if removed > 0 {
                    tracing::debug!(removed, "guard: swept idle windows");
                }
            }
        });
        if let Ok(mut slot) = this.sweep_task.lock() {
            *slot = Some(handle);
        }
    }

    /// Our own user id; events we caused are never counted.
    pub fn set_self_id(&self, user_id: u64) {
        self.self_id.store(user_id, Ordering::Relaxed);
    }

    fn is_self(&self, user_id: u64) -> bool {
        let me = self.self_id.load(Ordering::Relaxed);
        me != 0 && me == user_id
    }

    fn slot(&self, guild_id: u64, signal: SignalType) -> SlotRef {
        self.states
            .entry((guild_id, signal))
            .or_insert_with(|| {
                Arc::new(Mutex::new(Slot {
                    state: ProtectionState::new(guild_id, signal),
                    cooldown_timer: None,
                }))
            })
            .clone()
    }

    fn guild_slots(&self, guild_id: u64) -> Vec<SlotRef> {
        SignalType::ALL
            .iter()
            .filter_map(|s| self.states.get(&(guild_id, *s)).map(|r| r.clone()))
            .collect()
    }

    /// Fail safe: an unreadable policy means "nothing recorded, nothing declared".
    /// An open episode is left alone; only an explicit `enabled = false` resets.
    async fn policy_for(&self, guild_id: u64) -> Option<PolicyConfig> {
        match self.policies.policy(guild_id).await {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::warn!(guild_id, error = %e, "guard: policy unavailable, event dropped");
                None
            }
        }
    }

    /// Protection switched off: every signal of the guild back to Idle, timers stopped.
    /// Slots are locked one at a time.
    async fn reset_guild(&self, guild_id: u64) {
        for slot in self.guild_slots(guild_id) {
            let mut guard = slot.lock().await;
            if guard.state.reset().is_some() {
                guard.stop_timer();
            }
        }
    }

    pub async fn ingest_join(
        self: &Arc<Self>,
        guild_id: u64,
        user_id: u64,
        at: DateTime<Utc>,
    ) -> Ingest {
        self.ingest(guild_id, Event::join(user_id, at)).await
    }

    pub async fn ingest_privileged(self: &Arc<Self>, raw: RawPrivilegedEvent) -> Ingest {
        let signal = match raw.signal_type.parse::<SignalType>() {
            Ok(s) => s,
            Err(e) => {
                if self.reported_invariants.insert(raw.signal_type.clone()) {
                    tracing::error!(guild_id = raw.guild_id, error = %e, "guard: event dropped");
                }
                return Ingest::Dropped(DropReason::UnknownSignal);
            }
        };
        let event = Event::privileged(raw.actor_id, signal, raw.target_id, raw.timestamp);
        self.ingest(raw.guild_id, event).await
    }

    /// Record one event and drive the state machine. Never waits on the platform.
    pub async fn ingest(self: &Arc<Self>, guild_id: u64, event: Event) -> Ingest {
        if self.is_self(event.actor_id) {
            return Ingest::Dropped(DropReason::OwnAction);
        }
        let Some(policy) = self.policy_for(guild_id).await else {
            return Ingest::Dropped(DropReason::PolicyUnavailable);
        };

        // wyłączona ochrona: dowolny stan → Idle, niezależnie od tego, kto wywołał zdarzenie
        if !policy.enabled {
            self.reset_guild(guild_id).await;
        }

        let now = event.timestamp;
        let signal = event.signal;
        let slot = self.slot(guild_id, signal);
        let mut guard = slot.lock().await;

        let Some(seq) = self.registry.record(guild_id, event, &policy) else {
            return Ingest::Dropped(DropReason::Whitelisted);
        };

        if guard.state.expire_cooldown(now) {
            guard.stop_timer();
        }
        let after = guard.state.counts_after();
        let verdict = evaluate_after(&self.registry, guild_id, signal, now, &policy, after);
        let step = guard.state.observe(verdict.exceeded, now, policy.cooldown());
        guard.state.cover(seq);

        match step {
            Step::Declared(episode) => {
                guard.stop_timer();
                let count = verdict.count;
                let id = episode.id;
                let mitigation = self.spawn_mitigation(slot.clone(), episode, verdict, policy);
                Ingest::Declared(Declaration {
                    episode: id,
                    count,
                    mitigation,
                })
            }
            Step::Covered(_) if policy.action != MitigationAction::Lockdown => {
                let late: Option<(Episode, Vec<u64>)> = guard.state.episode().and_then(|ep| {
                    let fresh: Vec<u64> = verdict
                        .window
                        .actors()
                        .into_iter()
                        .filter(|a| !ep.is_mitigated(*a) && !policy.is_whitelisted(*a))
                        .collect();
                    (!fresh.is_empty()).then(|| (ep.clone(), fresh))
                });
                match late {
                    Some((episode, actors)) => {
                        let id = episode.id;
                        let mitigation = self.spawn_follow_up(episode, actors, policy);
                        Ingest::FollowUp(Declaration {
                            episode: id,
                            count: verdict.count,
                            mitigation,
                        })
                    }
                    None => Ingest::Recorded {
                        count: verdict.count,
                        threshold: verdict.threshold,
                        mode: guard.state.mode(),
                    },
                }
            }
            Step::Quiet | Step::Covered(_) => Ingest::Recorded {
                count: verdict.count,
                threshold: verdict.threshold,
                mode: guard.state.mode(),
            },
        }
    }

    fn spawn_follow_up(
        self: &Arc<Self>,
        episode: Episode,
        actors: Vec<u64>,
        policy: PolicyConfig,
    ) -> JoinHandle<MitigationReport> {
        let engine = self.clone();
        tokio::spawn(async move {
            let report = engine
                .executor
                .mitigate(&episode, &actors, policy.action, &policy)
                .await;
            tracing::info!(
                guild_id = episode.guild_id,
                episode = %episode.id,
                summary = %report.summary(),
                "guard: late actors mitigated"
            );
            report
        })
    }

    fn spawn_mitigation(
        self: &Arc<Self>,
        slot: SlotRef,
        episode: Episode,
        verdict: Verdict,
        policy: PolicyConfig,
    ) -> JoinHandle<MitigationReport> {
        let engine = self.clone();
        tokio::spawn(async move {
            let actors = verdict.window.actors();
            let report = engine
                .executor
                .mitigate(&episode, &actors, policy.action, &policy)
                .await;

            Self::finish_episode(&slot, episode.id, policy.cooldown()).await;

            let text = alert_text(&episode, &verdict, &policy, &report);
            engine
                .notifier
                .notify(episode.guild_id, &episode, &text, policy.alert_channel_id)
                .await;
            report
        })
    }

    async fn finish_episode(slot: &SlotRef, episode: EpisodeId, cooldown: Duration) {
        let mut guard = slot.lock().await;
        if guard.state.finish_mitigation(episode, Utc::now(), cooldown) {
            guard.stop_timer();
            guard.cooldown_timer = Some(Self::spawn_cooldown_timer(slot.clone()));
        }
    }

    fn spawn_cooldown_timer(slot: SlotRef) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let until = {
                    let guard = slot.lock().await;
                    if guard.state.mode() != Mode::Cooldown {
                        return;
                    }
                    guard.state.cooldown_until()
                };
                let Some(until) = until else {
                    return;
                };
                let wait = (until - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;

                let mut guard = slot.lock().await;
                if guard.state.expire_cooldown(Utc::now()) {
                    guard.cooldown_timer = None;
                    return;
                }
            }
        })
    }

    /// Lift the lockdown for a guild, reverting only the channels it locked.
    pub async fn unlock(&self, guild_id: u64) -> Option<UnlockReport> {
        self.lockdown.unlock(guild_id).await
    }

    pub async fn status(&self, guild_id: u64) -> GuildStatus {
        let slots = self.guild_slots(guild_id);
        let mut signals = Vec::with_capacity(slots.len());
        for slot in slots {
            signals.push(slot.lock().await.state.view());
        }
        GuildStatus {
            guild_id,
            signals,
            lockdown: self.lockdown.record(guild_id).await,
        }
    }

    /// Guild left scope (bot removed): drop windows, states, timers, lockdown record.
    pub async fn forget_guild(&self, guild_id: u64) {
        self.registry.forget_guild(guild_id);
        let keys: Vec<(u64, SignalType)> = self
            .states
            .iter()
            .filter(|e| e.key().0 == guild_id)
            .map(|e| *e.key())
            .collect();
        for key in keys {
            if let Some((_, slot)) = self.states.remove(&key) {
                slot.lock().await.stop_timer();
            }
        }
        self.lockdown.forget_guild(guild_id);
        tracing::info!(guild_id, "guard: guild forgotten");
    }

    /// Cancel the sweep and every cooldown timer. In-flight mitigations finish on their own.
    pub async fn shutdown(&self) {
        if let Ok(mut task) = self.sweep_task.lock() {
            if let Some(t) = task.take() {
                t.abort();
            }
        }
        let slots: Vec<SlotRef> = self.states.iter().map(|e| e.value().clone()).collect();
        for slot in slots {
            slot.lock().await.stop_timer();
        }
        tracing::info!("guard: timers stopped");
    }

    pub fn registry(&self) -> &SignalWindowRegistry {
        &self.registry
    }
}

fn alert_text(
    episode: &Episode,
    verdict: &Verdict,
    policy: &PolicyConfig,
    report: &MitigationReport,
) -> String {
    let kind = if episode.signal.is_raid() { "Raid" } else { "Nuke" };
    let mut actors: Vec<String> = verdict
        .window
        .actors()
        .iter()
        .take(10)
        .map(|id| format!("<@{id}>"))
        .collect();
    if verdict.window.actors().len() > 10 {
        actors.push("…".into());
    }
    format!(
        "🚨 {kind} detected ({}): {} `{}` events within {}s (threshold {}).\nAction: {}\nActors: {}",
        episode.id,
        verdict.count,
        episode.signal,
        policy.time_window_seconds,
        verdict.threshold,
        report.summary(),
        actors.join(", ")
    )
}

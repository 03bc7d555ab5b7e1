#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serenity::async_trait;

use tigris_guard::error::{GuardError, PlatformError};
use tigris_guard::guard::policy::{PolicyConfig, PolicyStore, SettingsPolicyStore};
use tigris_guard::guard::retry::RetryPolicy;
use tigris_guard::guard::{GuardEngine, GuardOptions};
use tigris_guard::platform::{GuildApi, PlatformResult};

pub const OWNER: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Kick(u64),
    Ban(u64, u32),
    StripRoles(u64),
    Lock(u64),
    Unlock(u64),
    Alert(u64, String),
    Dm(u64, String),
}

/// In-memory platform. Everything succeeds unless configured otherwise.
#[derive(Default)]
pub struct MockApi {
    /// `can_moderate` → false (left the guild, above the bot, ...).
    pub unmanageable: Mutex<HashSet<u64>>,
    /// Remaining transient failures per actor for kick/ban/strip.
    pub transient: Mutex<HashMap<u64, u32>>,
    pub channels: Mutex<Vec<u64>>,
    pub lock_denied: Mutex<HashSet<u64>>,
    pub unlock_denied: Mutex<HashSet<u64>>,
    pub deleted: Mutex<HashSet<u64>>,
    /// Channels whose @everyone overwrite currently denies SEND_MESSAGES.
    pub send_denied: Mutex<HashSet<u64>>,
    pub alert_fails: Mutex<bool>,
    pub calls: Mutex<Vec<Call>>,
}

impl MockApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_channels(ids: &[u64]) -> Arc<Self> {
        let api = Self::default();
        *api.channels.lock().unwrap() = ids.to_vec();
        Arc::new(api)
    }

    /// Staff locked these channels themselves before anything happened.
    pub fn lock_by_hand(&self, ids: &[u64]) {
        self.send_denied.lock().unwrap().extend(ids.iter().copied());
    }

    pub fn is_send_denied(&self, channel_id: u64) -> bool {
        self.send_denied.lock().unwrap().contains(&channel_id)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn kicked(&self) -> Vec<u64> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Kick(u) => Some(u),
                _ => None,
            })
            .collect()
    }

    pub fn alerts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Alert(_, m) => Some(m),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn take_transient(&self, user_id: u64) -> bool {
        let mut map = self.transient.lock().unwrap();
        match map.get_mut(&user_id) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }

    fn act(&self, user_id: u64, call: Call) -> PlatformResult<()> {
        if self.take_transient(user_id) {
            return Err(PlatformError::Transient("429 Too Many Requests".into()));
        }
        self.record(call);
        Ok(())
    }
}

#[async_trait]
impl GuildApi for MockApi {
    async fn can_moderate(&self, _guild_id: u64, user_id: u64) -> PlatformResult<bool> {
        Ok(!self.unmanageable.lock().unwrap().contains(&user_id))
    }

    async fn kick(&self, _guild_id: u64, user_id: u64, _reason: &str) -> PlatformResult<()> {
        self.act(user_id, Call::Kick(user_id))
    }

    async fn ban(
        &self,
        _guild_id: u64,
        user_id: u64,
        _reason: &str,
        purge_seconds: u32,
    ) -> PlatformResult<()> {
        self.act(user_id, Call::Ban(user_id, purge_seconds))
    }

    async fn strip_roles(&self, _guild_id: u64, user_id: u64, _reason: &str) -> PlatformResult<()> {
        self.act(user_id, Call::StripRoles(user_id))
    }

    async fn text_channels(&self, _guild_id: u64) -> PlatformResult<Vec<u64>> {
        Ok(self.channels.lock().unwrap().clone())
    }

    async fn set_channel_send_permission(
        &self,
        channel_id: u64,
        _role_id: u64,
        allow: bool,
        _reason: &str,
    ) -> PlatformResult<bool> {
        if self.deleted.lock().unwrap().contains(&channel_id) {
            return Err(PlatformError::NotFound(format!("channel {channel_id}")));
        }
        let denied = if allow {
            self.unlock_denied.lock().unwrap().contains(&channel_id)
        } else {
            self.lock_denied.lock().unwrap().contains(&channel_id)
        };
        if denied {
            return Err(PlatformError::PermissionDenied(format!("channel {channel_id}")));
        }
        let changed = {
            let mut state = self.send_denied.lock().unwrap();
            if allow {
                state.remove(&channel_id)
            } else {
                state.insert(channel_id)
            }
        };
        if !changed {
            return Ok(false);
        }
        self.record(if allow {
            Call::Unlock(channel_id)
        } else {
            Call::Lock(channel_id)
        });
        Ok(true)
    }

    async fn guild_owner(&self, _guild_id: u64) -> PlatformResult<u64> {
        Ok(OWNER)
    }

    async fn send_alert(&self, _guild_id: u64, channel_id: u64, message: &str) -> PlatformResult<()> {
        if *self.alert_fails.lock().unwrap() {
            return Err(PlatformError::PermissionDenied("alert channel".into()));
        }
        self.record(Call::Alert(channel_id, message.to_string()));
        Ok(())
    }

    async fn send_direct_message(&self, user_id: u64, message: &str) -> PlatformResult<()> {
        self.record(Call::Dm(user_id, message.to_string()));
        Ok(())
    }
}

/// Policy store that can be edited, or taken down, at runtime.
pub struct SwitchablePolicy {
    pub policy: Mutex<PolicyConfig>,
    pub down: Mutex<bool>,
}

impl SwitchablePolicy {
    pub fn new(policy: PolicyConfig) -> Arc<Self> {
        Arc::new(Self {
            policy: Mutex::new(policy),
            down: Mutex::new(false),
        })
    }
}

#[async_trait]
impl PolicyStore for SwitchablePolicy {
    async fn policy(&self, guild_id: u64) -> Result<PolicyConfig, GuardError> {
        if *self.down.lock().unwrap() {
            return Err(GuardError::PolicyUnavailable {
                guild_id,
                reason: "connection reset".into(),
            });
        }
        Ok(self.policy.lock().unwrap().clone())
    }
}

/// Store that is always down.
pub struct DownPolicyStore;

#[async_trait]
impl PolicyStore for DownPolicyStore {
    async fn policy(&self, guild_id: u64) -> Result<PolicyConfig, GuardError> {
        Err(GuardError::PolicyUnavailable {
            guild_id,
            reason: "connection refused".into(),
        })
    }
}

pub fn fast_options() -> GuardOptions {
    GuardOptions {
        retry: RetryPolicy::new(2, Duration::from_millis(1)),
        ..Default::default()
    }
}

pub fn engine(api: Arc<MockApi>, policy: PolicyConfig) -> Arc<GuardEngine> {
    let store = SettingsPolicyStore::new(policy, HashMap::new());
    GuardEngine::new(api, Arc::new(store), fast_options())
}

pub fn engine_with_store(api: Arc<MockApi>, store: Arc<dyn PolicyStore>) -> Arc<GuardEngine> {
    GuardEngine::new(api, store, fast_options())
}

//! Polityka ochrony gildii (read-only dla silnika).
//!
//! Źródła:
//! - `SettingsPolicyStore` – domyślna polityka + nadpisania per gildia z `Settings`
//! - `PgPolicyStore` – `tss.guard_policy(guild_id BIGINT PRIMARY KEY, policy JSONB)`,
//!   z cache moka (TTL), fallback na domyślną politykę gdy brak wiersza

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serenity::async_trait;
use sqlx::{Pool, Postgres};

use crate::error::GuardError;
use crate::guard::signal::SignalType;

pub const MIN_WINDOW_SECS: u64 = 5;
pub const MAX_WINDOW_SECS: u64 = 60;

/// What to do with the actors of a detected burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MitigationAction {
    #[serde(alias = "removeRoles")]
    RemoveRoles,
    Kick,
    Ban,
    Lockdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Thresholds {
    pub join: u32,
    pub ban: u32,
    pub kick: u32,
    #[serde(alias = "roleDelete")]
    pub role_delete: u32,
    #[serde(alias = "channelDelete")]
    pub channel_delete: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            join: 10,
            ban: 5,
            kick: 5,
            role_delete: 3,
            channel_delete: 3,
        }
    }
}

impl Thresholds {
    pub fn get(&self, signal: SignalType) -> u32 {
        match signal {
            SignalType::Join => self.join,
            SignalType::Ban => self.ban,
            SignalType::Kick => self.kick,
            SignalType::RoleDelete => self.role_delete,
            SignalType::ChannelDelete => self.channel_delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub enabled: bool,
    pub thresholds: Thresholds,
    #[serde(alias = "timeWindowSeconds")]
    pub time_window_seconds: u64,
    pub action: MitigationAction,
    #[serde(alias = "whitelistedUserIds")]
    pub whitelisted_user_ids: HashSet<u64>,
    #[serde(alias = "cooldownSeconds")]
    pub cooldown_seconds: u64,
    /// Kanał staffu na alerty; brak = tylko DM do właściciela.
    #[serde(alias = "alertChannelId")]
    pub alert_channel_id: Option<u64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            thresholds: Thresholds::default(),
            time_window_seconds: 10,
            action: MitigationAction::Kick,
            whitelisted_user_ids: HashSet::new(),
            cooldown_seconds: 60,
            alert_channel_id: None,
        }
    }
}

impl PolicyConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.time_window_seconds)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }

    pub fn is_whitelisted(&self, user_id: u64) -> bool {
        self.whitelisted_user_ids.contains(&user_id)
    }
}

/// Clamp operator input into the ranges the engine relies on.
pub fn sanitize_policy(mut p: PolicyConfig) -> PolicyConfig {
    p.time_window_seconds = p.time_window_seconds.clamp(MIN_WINDOW_SECS, MAX_WINDOW_SECS);
    p.cooldown_seconds = p.cooldown_seconds.max(1);
    let t = &mut p.thresholds;
    for v in [
        &mut t.join,
        &mut t.ban,
        &mut t.kick,
        &mut t.role_delete,
        &mut t.channel_delete,
    ] {
        *v = (*v).max(1);
    }
    p
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn policy(&self, guild_id: u64) -> Result<PolicyConfig, GuardError>;
}

/* ==============================
   Polityka z konfiguracji
   ============================== */

#[derive(Debug, Clone, Default)]
pub struct SettingsPolicyStore {
    default: PolicyConfig,
    guilds: HashMap<u64, PolicyConfig>,
}

impl SettingsPolicyStore {
    pub fn new(default: PolicyConfig, guilds: HashMap<u64, PolicyConfig>) -> Self {
        Self {
            default: sanitize_policy(default),
            guilds: guilds
                .into_iter()
                .map(|(gid, p)| (gid, sanitize_policy(p)))
                .collect(),
        }
    }
}

#[async_trait]
impl PolicyStore for SettingsPolicyStore {
    async fn policy(&self, guild_id: u64) -> Result<PolicyConfig, GuardError> {
        Ok(self
            .guilds
            .get(&guild_id)
            .cloned()
            .unwrap_or_else(|| self.default.clone()))
    }
}

/* ==============================
   Polityka z Postgresa
   ============================== */

pub struct PgPolicyStore {
    db: Pool<Postgres>,
    fallback: PolicyConfig,
    cache: Cache<u64, PolicyConfig>,
}

impl PgPolicyStore {
    pub fn new(db: Pool<Postgres>, fallback: PolicyConfig, ttl: Duration) -> Self {
        Self {
            db,
            fallback: sanitize_policy(fallback),
            cache: Cache::builder().max_capacity(10_000).time_to_live(ttl).build(),
        }
    }

    pub async fn ensure_tables(db: &Pool<Postgres>) -> Result<()> {
        sqlx::query(r#"CREATE SCHEMA IF NOT EXISTS tss;"#)
            .execute(db)
            .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tss.guard_policy (
              guild_id   BIGINT PRIMARY KEY,
              policy     JSONB NOT NULL DEFAULT '{}'::jsonb,
              updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            "#,
        )
        .execute(db)
        .await?;
        Ok(())
    }

    /// Drop the cached entry after an external edit.
    pub async fn invalidate(&self, guild_id: u64) {
        self.cache.invalidate(&guild_id).await;
    }

    async fn load(&self, guild_id: u64) -> Result<PolicyConfig> {
        let row: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT policy FROM tss.guard_policy WHERE guild_id = $1")
                .bind(guild_id as i64)
                .fetch_optional(&self.db)
                .await?;
        match row {
            Some(v) => Ok(sanitize_policy(serde_json::from_value(v)?)),
            None => Ok(self.fallback.clone()),
        }
    }
}

#[async_trait]
impl PolicyStore for PgPolicyStore {
    async fn policy(&self, guild_id: u64) -> Result<PolicyConfig, GuardError> {
        self.cache
            .try_get_with(guild_id, self.load(guild_id))
            .await
            .map_err(|e: Arc<anyhow::Error>| GuardError::PolicyUnavailable {
                guild_id,
                reason: e.to_string(),
            })
    }
}

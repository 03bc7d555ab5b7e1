// src/lib.rs

pub mod api;
pub mod config;
pub mod db;
pub mod discord;
pub mod error;
pub mod guard;
pub mod logging;
pub mod platform;

use anyhow::Result;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Duration;

use config::Settings;
use db::Db;
use guard::policy::{PgPolicyStore, PolicyStore, SettingsPolicyStore};
use guard::{GuardEngine, GuardOptions};
use platform::GuildApi;

/// Globalny kontekst aplikacji.
/// Konfiguracja, (opcjonalnie) pula DB, źródło polityk i silnik Guard.
pub struct AppContext {
    pub settings: Settings,
    pub db: Option<Db>,
    policies: Arc<dyn PolicyStore>,
    guard: OnceCell<Arc<GuardEngine>>,
}

impl AppContext {
    /// Bootstrap:
    /// - logi
    /// - połączenie z DB (jeśli skonfigurowane) + tabela polityk
    /// - wybór źródła polityk (Postgres albo konfiguracja)
    pub async fn bootstrap(settings: Settings) -> Result<Arc<Self>> {
        // 1) logi
        logging::init(&settings);

        // 2) DB + polityki
        let guard_cfg = &settings.guard;
        let (db, policies): (Option<Db>, Arc<dyn PolicyStore>) = match &settings.database.url {
            Some(url) if !url.is_empty() => {
                let db = db::connect(url, settings.database.max_connections).await?;
                PgPolicyStore::ensure_tables(&db).await?;
                let store = PgPolicyStore::new(
                    db.clone(),
                    guard_cfg.default_policy.clone(),
                    Duration::from_secs(guard_cfg.policy_cache_seconds.max(1)),
                );
                tracing::info!("policies: postgres (tss.guard_policy)");
                (Some(db), Arc::new(store))
            }
            _ => {
                tracing::info!("policies: settings only (no database url)");
                let store = SettingsPolicyStore::new(
                    guard_cfg.default_policy.clone(),
                    guard_cfg.guild_overrides(),
                );
                (None, Arc::new(store))
            }
        };

        Ok(Arc::new(Self {
            settings,
            db,
            policies,
            guard: OnceCell::new(),
        }))
    }

    /// Tworzy silnik przy pierwszym wywołaniu (gdy znamy już klienta HTTP platformy).
    pub fn init_guard(&self, api: Arc<dyn GuildApi>) -> Arc<GuardEngine> {
        self.guard
            .get_or_init(|| {
                GuardEngine::new(
                    api,
                    self.policies.clone(),
                    GuardOptions::from(&self.settings.guard),
                )
            })
            .clone()
    }

    /// Silnik Guard; `None` zanim klient Discorda wystartował.
    pub fn guard(&self) -> Option<Arc<GuardEngine>> {
        self.guard.get().cloned()
    }
}

/// Start: klient Discorda (gateway) + opcjonalny serwer statusu.
pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    discord::run_bot(ctx).await
}

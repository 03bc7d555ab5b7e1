use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

use crate::guard::policy::PolicyConfig;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    pub env: String,
    pub app: App,
    pub discord: Discord,
    pub database: Database,
    pub logging: Logging,
    pub api: Api,
    pub guard: GuardSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct App {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Discord {
    pub token: String,
    pub intents: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Database {
    /// Brak URL = polityki tylko z konfiguracji (bez Postgresa).
    pub url: Option<String>,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Logging {
    pub json: Option<bool>,
    pub level: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Api {
    /// np. "127.0.0.1:8088"; brak = serwer statusu wyłączony
    pub bind: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GuardSettings {
    pub default_policy: PolicyConfig,
    /// Klucz: id gildii (string – klucze TOML/ENV są tekstowe).
    pub guild_policies: HashMap<String, PolicyConfig>,
    pub sweep_interval_seconds: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub ban_purge_seconds: u32,
    pub policy_cache_seconds: u64,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            default_policy: PolicyConfig::default(),
            guild_policies: HashMap::new(),
            sweep_interval_seconds: 60,
            retry_attempts: 2,
            retry_backoff_ms: 500,
            ban_purge_seconds: 0,
            policy_cache_seconds: 30,
        }
    }
}

impl GuardSettings {
    /// Nadpisania per gildia; klucze, które nie są liczbą, pomijamy z ostrzeżeniem.
    pub fn guild_overrides(&self) -> HashMap<u64, PolicyConfig> {
        let mut out = HashMap::new();
        for (k, v) in &self.guild_policies {
            match k.trim().parse::<u64>() {
                Ok(gid) => {
                    out.insert(gid, v.clone());
                }
                Err(_) => tracing::warn!(key = %k, "guard.guild_policies: invalid guild id, ignored"),
            }
        }
        out
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        // Które środowisko?
        let env = std::env::var("TGD_ENV").unwrap_or_else(|_| "development".to_string());

        // Załaduj .env.<env> i .env (jeśli są)
        let _ = dotenvy::from_filename(format!(".env.{}", env));
        let _ = dotenvy::dotenv();

        let defaults = Settings {
            env: env.clone(),
            app: App {
                name: "Tigris Guard".into(),
            },
            discord: Discord {
                token: "".into(),
                intents: vec![
                    "GUILDS".into(),
                    "GUILD_MEMBERS".into(),
                    "GUILD_MODERATION".into(),
                ],
            },
            database: Database::default(),
            logging: Logging {
                json: Some(false),
                level: Some("info".into()),
            },
            api: Api::default(),
            guard: GuardSettings::default(),
        };

        // Warstwy: domyślne -> plik TOML -> zmienne środowiskowe TGD_*
        let figment = Figment::from(Serialized::defaults(defaults))
            .merge(Toml::file(format!("config/{}.toml", env)))
            // TGD_DISCORD__TOKEN => discord.token, TGD_GUARD__RETRY_ATTEMPTS => guard.retry_attempts
            .merge(Env::prefixed("TGD_").split("__"));

        let mut s: Settings = figment.extract()?;
        s.env = env;
        Ok(s)
    }
}

// src/discord/mod.rs
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serenity::all::*;
use serenity::async_trait;
use serenity::model::guild::audit_log::{Action, ChannelAction, MemberAction, RoleAction};

use crate::AppContext;
use crate::guard::signal::{Event, SignalType};
use crate::guard::Ingest;

pub mod api;

use api::SerenityApi;

pub struct Handler {
    pub app: Arc<AppContext>,
}

/// Audit-log akcje, które liczymy jako sygnały nuke.
pub fn signal_for_action(action: &Action) -> Option<SignalType> {
    match action {
        Action::Member(MemberAction::BanAdd) => Some(SignalType::Ban),
        Action::Member(MemberAction::Kick) => Some(SignalType::Kick),
        Action::Role(RoleAction::Delete) => Some(SignalType::RoleDelete),
        Action::Channel(ChannelAction::Delete) => Some(SignalType::ChannelDelete),
        _ => None,
    }
}

fn log_ingest(guild_id: u64, signal: SignalType, outcome: &Ingest) {
    match outcome {
        Ingest::Declared(d) => {
            tracing::warn!(guild_id, %signal, episode = %d.episode, count = d.count, "guard: mitigation started")
        }
        Ingest::FollowUp(d) => {
            tracing::info!(guild_id, %signal, episode = %d.episode, count = d.count, "guard: late actors queued")
        }
        Ingest::Recorded { count, threshold, mode } => {
            tracing::debug!(guild_id, %signal, count, threshold, ?mode, "guard: recorded")
        }
        Ingest::Dropped(reason) => tracing::debug!(guild_id, %signal, ?reason, "guard: dropped"),
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        tracing::info!("Logged in as {}", ready.user.name);
        if let Some(guard) = self.app.guard() {
            guard.set_self_id(ready.user.id.get());
        }
    }

    async fn guild_member_addition(&self, _ctx: Context, member: Member) {
        let Some(guard) = self.app.guard() else {
            return;
        };
        let gid = member.guild_id.get();
        let outcome = guard.ingest_join(gid, member.user.id.get(), Utc::now()).await;
        log_ingest(gid, SignalType::Join, &outcome);
    }

    async fn guild_audit_log_entry_create(
        &self,
        _ctx: Context,
        entry: AuditLogEntry,
        guild_id: GuildId,
    ) {
        let Some(signal) = signal_for_action(&entry.action) else {
            return;
        };
        let Some(guard) = self.app.guard() else {
            return;
        };
        let event = Event::privileged(
            entry.user_id.get(),
            signal,
            entry.target_id.map(|t| t.get()),
            Utc::now(),
        );
        let outcome = guard.ingest(guild_id.get(), event).await;
        log_ingest(guild_id.get(), signal, &outcome);
    }

    async fn guild_delete(&self, _ctx: Context, incomplete: UnavailableGuild, _full: Option<Guild>) {
        // unavailable = awaria po stronie Discorda, nie usunięcie bota
        if incomplete.unavailable {
            return;
        }
        if let Some(guard) = self.app.guard() {
            guard.forget_guild(incomplete.id.get()).await;
        }
    }
}

fn intents_from_settings(names: &[String]) -> GatewayIntents {
    let mut i = GatewayIntents::empty();
    for n in names {
        match n.as_str() {
            "GUILDS" => i |= GatewayIntents::GUILDS,
            "GUILD_MEMBERS" => i |= GatewayIntents::GUILD_MEMBERS,
            "GUILD_MODERATION" => i |= GatewayIntents::GUILD_MODERATION,
            "GUILD_MESSAGES" => i |= GatewayIntents::GUILD_MESSAGES,
            other => tracing::warn!(intent = other, "unknown intent ignored"),
        }
    }
    i
}

pub async fn run_bot(ctx: Arc<AppContext>) -> Result<()> {
    let token = &ctx.settings.discord.token;
    if token.is_empty() {
        anyhow::bail!("Brak tokenu Discord (TGD_DISCORD__TOKEN). Uzupełnij w .env.");
    }

    let intents = intents_from_settings(&ctx.settings.discord.intents);

    let handler = Handler { app: ctx.clone() };

    let mut client = serenity::Client::builder(token, intents)
        .event_handler(handler)
        .await?;

    // silnik potrzebuje Http klienta – tworzymy go przed startem gatewaya
    let guard = ctx.init_guard(Arc::new(SerenityApi::new(client.http.clone())));

    if let Some(bind) = ctx.settings.api.bind.as_deref() {
        let addr: SocketAddr = bind.parse()?;
        let engine = guard.clone();
        tokio::spawn(async move {
            if let Err(e) = crate::api::serve(addr, engine).await {
                tracing::error!(error = ?e, "status api stopped");
            }
        });
    }

    let shards = client.shard_manager.clone();
    let engine = guard.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            engine.shutdown().await;
            shards.shutdown_all().await;
        }
    });

    tracing::info!("Discord client starting…");
    client.start().await?;
    Ok(())
}

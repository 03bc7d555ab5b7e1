//! `GuildApi` na serenity `Http`.
//!
//! Mapowanie błędów: 401/403 → PermissionDenied, 404 → NotFound,
//! 429/5xx/sieć → Transient (ponawiane przez Guard), reszta → Other.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serenity::all::{
    ChannelId, ChannelType, Colour, CreateEmbed, CreateEmbedFooter, CreateMessage, EditMember,
    GuildId, Http, Member, PermissionOverwrite, PermissionOverwriteType, Permissions, Role,
    RoleId, UserId,
};
use serenity::async_trait;
use serenity::http::HttpError;

use crate::error::PlatformError;
use crate::platform::{GuildApi, PlatformResult};

const SYSTEM_NAME: &str = "Tigris Guard";

pub struct SerenityApi {
    http: Arc<Http>,
    bot_id: OnceCell<UserId>,
}

impl SerenityApi {
    pub fn new(http: Arc<Http>) -> Self {
        Self {
            http,
            bot_id: OnceCell::new(),
        }
    }

    async fn bot_id(&self) -> PlatformResult<UserId> {
        if let Some(id) = self.bot_id.get() {
            return Ok(*id);
        }
        let id = self.http.get_current_user().await.map_err(map_err)?.id;
        let _ = self.bot_id.set(id);
        Ok(id)
    }
}

pub fn map_err(e: serenity::Error) -> PlatformError {
    let text = e.to_string();
    match e {
        serenity::Error::Http(HttpError::UnsuccessfulRequest(resp)) => {
            match resp.status_code.as_u16() {
                401 | 403 => PlatformError::PermissionDenied(text),
                404 => PlatformError::NotFound(text),
                429 | 500..=599 => PlatformError::Transient(text),
                _ => PlatformError::Other(text),
            }
        }
        serenity::Error::Http(HttpError::Request(_)) => PlatformError::Transient(text),
        // hierarchia / brak uprawnień wykryty lokalnie przez serenity
        serenity::Error::Model(_) => PlatformError::PermissionDenied(text),
        _ => PlatformError::Other(text),
    }
}

fn highest_role_position(member: &Member, roles_map: &HashMap<RoleId, Role>) -> i64 {
    member
        .roles
        .iter()
        .filter_map(|rid| roles_map.get(rid).map(|r| r.position))
        .max()
        .unwrap_or(0) as i64
}

#[async_trait]
impl GuildApi for SerenityApi {
    /// Czy BOT może celować w tego użytkownika – obecność, właściciel, hierarchia ról.
    async fn can_moderate(&self, guild_id: u64, user_id: u64) -> PlatformResult<bool> {
        let gid = GuildId::new(guild_id);
        let target = UserId::new(user_id);
        let bot = self.bot_id().await?;
        if bot == target {
            return Ok(false);
        }

        let target_m = match gid.member(&self.http, target).await.map_err(map_err) {
            Ok(m) => m,
            // już wyszedł z serwera
            Err(PlatformError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let bot_m = gid.member(&self.http, bot).await.map_err(map_err)?;

        let pg = gid.to_partial_guild(&self.http).await.map_err(map_err)?;
        if pg.owner_id == target {
            return Ok(false);
        }
        let roles_map = gid.roles(&self.http).await.map_err(map_err)?;
        Ok(highest_role_position(&bot_m, &roles_map) > highest_role_position(&target_m, &roles_map))
    }

    async fn kick(&self, guild_id: u64, user_id: u64, reason: &str) -> PlatformResult<()> {
        GuildId::new(guild_id)
            .kick_with_reason(&self.http, UserId::new(user_id), reason)
            .await
            .map_err(map_err)
    }

    async fn ban(
        &self,
        guild_id: u64,
        user_id: u64,
        reason: &str,
        purge_seconds: u32,
    ) -> PlatformResult<()> {
        // Discord przyjmuje pełne dni (0..=7)
        let days = (purge_seconds / 86_400).min(7) as u8;
        GuildId::new(guild_id)
            .ban_with_reason(&self.http, UserId::new(user_id), days, reason)
            .await
            .map_err(map_err)
    }

    async fn strip_roles(&self, guild_id: u64, user_id: u64, reason: &str) -> PlatformResult<()> {
        GuildId::new(guild_id)
            .edit_member(
                &self.http,
                UserId::new(user_id),
                EditMember::new()
                    .roles(Vec::<RoleId>::new())
                    .audit_log_reason(reason),
            )
            .await
            .map(|_| ())
            .map_err(map_err)
    }

    async fn text_channels(&self, guild_id: u64) -> PlatformResult<Vec<u64>> {
        let channels = GuildId::new(guild_id)
            .channels(&self.http)
            .await
            .map_err(map_err)?;
        Ok(channels
            .values()
            .filter(|c| matches!(c.kind, ChannelType::Text | ChannelType::News))
            .map(|c| c.id.get())
            .collect())
    }

    /// Zmienia wyłącznie bit SEND_MESSAGES w nadpisaniu roli; reszta nadpisania zostaje.
    async fn set_channel_send_permission(
        &self,
        channel_id: u64,
        role_id: u64,
        allow: bool,
        reason: &str,
    ) -> PlatformResult<bool> {
        let ch = ChannelId::new(channel_id);
        let channel = ch.to_channel(&self.http).await.map_err(map_err)?;
        let Some(gc) = channel.guild() else {
            return Err(PlatformError::NotFound(format!("channel {channel_id} is not a guild channel")));
        };

        let kind = PermissionOverwriteType::Role(RoleId::new(role_id));
        let (mut allow_bits, mut deny_bits) = gc
            .permission_overwrites
            .iter()
            .find(|o| o.kind == kind)
            .map(|o| (o.allow, o.deny))
            .unwrap_or((Permissions::empty(), Permissions::empty()));

        // bit już w żądanym stanie (np. ręczna blokada) – nic nie edytujemy
        if deny_bits.contains(Permissions::SEND_MESSAGES) != allow {
            return Ok(false);
        }
        if allow {
            deny_bits.remove(Permissions::SEND_MESSAGES);
        } else {
            allow_bits.remove(Permissions::SEND_MESSAGES);
            deny_bits.insert(Permissions::SEND_MESSAGES);
        }
        tracing::debug!(channel_id, role_id, allow, reason, "channel send permission");

        if allow_bits.is_empty() && deny_bits.is_empty() {
            ch.delete_permission(&self.http, kind).await.map_err(map_err)?;
        } else {
            ch.create_permission(
                &self.http,
                PermissionOverwrite {
                    allow: allow_bits,
                    deny: deny_bits,
                    kind,
                },
            )
            .await
            .map_err(map_err)?;
        }
        Ok(true)
    }

    async fn guild_owner(&self, guild_id: u64) -> PlatformResult<u64> {
        let pg = GuildId::new(guild_id)
            .to_partial_guild(&self.http)
            .await
            .map_err(map_err)?;
        Ok(pg.owner_id.get())
    }

    async fn send_alert(&self, _guild_id: u64, channel_id: u64, message: &str) -> PlatformResult<()> {
        let embed = CreateEmbed::new()
            .title("🛡️ Tigris Guard")
            .colour(Colour::new(0xE74C3C))
            .description(message)
            .footer(CreateEmbedFooter::new(SYSTEM_NAME));
        ChannelId::new(channel_id)
            .send_message(&self.http, CreateMessage::new().embed(embed))
            .await
            .map(|_| ())
            .map_err(map_err)
    }

    async fn send_direct_message(&self, user_id: u64, message: &str) -> PlatformResult<()> {
        let dm = UserId::new(user_id)
            .create_dm_channel(&self.http)
            .await
            .map_err(map_err)?;
        dm.send_message(&self.http, CreateMessage::new().content(message))
            .await
            .map(|_| ())
            .map_err(map_err)
    }
}

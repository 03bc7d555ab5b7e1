// src/platform.rs

use serenity::async_trait;

use crate::error::PlatformError;

pub type PlatformResult<T> = Result<T, PlatformError>;

/// Outbound calls the guard makes against the platform.
/// Production: [`crate::discord::api::SerenityApi`]; tests plug in a mock.
#[async_trait]
pub trait GuildApi: Send + Sync {
    /// Can the bot act on this member (still present, below the bot's top role, not the owner)?
    async fn can_moderate(&self, guild_id: u64, user_id: u64) -> PlatformResult<bool>;

    async fn kick(&self, guild_id: u64, user_id: u64, reason: &str) -> PlatformResult<()>;

    async fn ban(
        &self,
        guild_id: u64,
        user_id: u64,
        reason: &str,
        purge_seconds: u32,
    ) -> PlatformResult<()>;

    async fn strip_roles(&self, guild_id: u64, user_id: u64, reason: &str) -> PlatformResult<()>;

    /// Text channels of the guild, in any order.
    async fn text_channels(&self, guild_id: u64) -> PlatformResult<Vec<u64>>;

    /// `allow = false` adds a SEND_MESSAGES deny for `role_id`; `allow = true` removes it.
    /// `Ok(false)` = the bit was already in the requested state, nothing was edited.
    async fn set_channel_send_permission(
        &self,
        channel_id: u64,
        role_id: u64,
        allow: bool,
        reason: &str,
    ) -> PlatformResult<bool>;

    async fn guild_owner(&self, guild_id: u64) -> PlatformResult<u64>;

    async fn send_alert(&self, guild_id: u64, channel_id: u64, message: &str) -> PlatformResult<()>;

    async fn send_direct_message(&self, user_id: u64, message: &str) -> PlatformResult<()>;
}

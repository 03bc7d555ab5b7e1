use std::sync::Arc;

use futures_util::future::join;

use crate::guard::state::Episode;
use crate::platform::GuildApi;

/// One alert per episode: staff channel (if configured) + owner DM.
/// Delivery is best-effort and never reported back to the state machine.
/// Dedup rides on the episode itself, so it lives exactly as long as the episode.
pub struct Notifier {
    api: Arc<dyn GuildApi>,
}

impl Notifier {
    pub fn new(api: Arc<dyn GuildApi>) -> Self {
        Self { api }
    }

    /// Returns `false` when this episode was already notified.
    pub async fn notify(
        &self,
        guild_id: u64,
        episode: &Episode,
        summary: &str,
        alert_channel_id: Option<u64>,
    ) -> bool {
        if !episode.mark_notified() {
            tracing::debug!(guild_id, episode = %episode.id, "notify: duplicate suppressed");
            return false;
        }

        let alert = async {
            let Some(ch) = alert_channel_id else { return };
            if let Err(e) = self.api.send_alert(guild_id, ch, summary).await {
                tracing::warn!(guild_id, channel_id = ch, error = %e, "notify: alert not delivered");
            }
        };
        let owner_dm = async {
            match self.api.guild_owner(guild_id).await {
                Ok(owner) => {
                    if let Err(e) = self.api.send_direct_message(owner, summary).await {
                        tracing::debug!(guild_id, user_id = owner, error = %e, "notify: owner DM failed");
                    }
                }
                Err(e) => tracing::debug!(guild_id, error = %e, "notify: owner unknown"),
            }
        };
        join(alert, owner_dm).await;
        true
    }
}

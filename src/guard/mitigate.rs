use std::sync::Arc;

use serde::Serialize;

use crate::error::PlatformError;
use crate::guard::lockdown::{LockdownController, LockdownRecord};
use crate::guard::policy::{MitigationAction, PolicyConfig};
use crate::guard::retry::RetryPolicy;
use crate::guard::state::Episode;
use crate::platform::GuildApi;

const SYSTEM_NAME: &str = "Tigris Guard";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorOutcome {
    Done,
    PermissionDenied,
    /// Transient failures outlasted the retry budget.
    GaveUp,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MitigationReport {
    pub action: Option<MitigationAction>,
    pub outcomes: Vec<(u64, ActorOutcome)>,
    /// Already handled this episode, or whitelisted.
    pub skipped: Vec<u64>,
    pub lockdown: Option<LockdownRecord>,
    pub lockdown_error: Option<String>,
}

impl MitigationReport {
    fn count(&self, o: ActorOutcome) -> usize {
        self.outcomes.iter().filter(|(_, x)| *x == o).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(ActorOutcome::Done)
    }

    pub fn denied(&self) -> usize {
        self.count(ActorOutcome::PermissionDenied)
    }

    pub fn gave_up(&self) -> usize {
        self.count(ActorOutcome::GaveUp)
    }

    pub fn is_partial(&self) -> bool {
        self.denied() + self.gave_up() > 0 || self.lockdown_error.is_some()
    }

    /// One-line outcome for the staff alert.
    pub fn summary(&self) -> String {
        match self.action {
            Some(MitigationAction::Lockdown) => match (&self.lockdown, &self.lockdown_error) {
                (Some(r), _) => format!("lockdown: {} channels locked", r.touched_channel_ids.len()),
                (None, Some(e)) => format!("lockdown failed: {e}"),
                (None, None) => "lockdown: nothing to do".to_string(),
            },
            Some(action) => {
                let mut s = format!(
                    "{}: {} ok, {} permission denied, {} failed",
                    action_label(action),
                    self.succeeded(),
                    self.denied(),
                    self.gave_up()
                );
                if !self.skipped.is_empty() {
                    s.push_str(&format!(", {} skipped", self.skipped.len()));
                }
                if self.is_partial() {
                    s.push_str(" (partial)");
                }
                s
            }
            None => "no action".to_string(),
        }
    }
}

fn action_label(action: MitigationAction) -> &'static str {
    match action {
        MitigationAction::RemoveRoles => "remove roles",
        MitigationAction::Kick => "kick",
        MitigationAction::Ban => "ban",
        MitigationAction::Lockdown => "lockdown",
    }
}

/// Turns a declared episode into remote actions. Never fails as a whole:
/// every actor gets an outcome and the batch always runs to the end.
pub struct MitigationExecutor {
    api: Arc<dyn GuildApi>,
    lockdown: Arc<LockdownController>,
    retry: RetryPolicy,
    ban_purge_seconds: u32,
}

impl MitigationExecutor {
    pub fn new(
        api: Arc<dyn GuildApi>,
        lockdown: Arc<LockdownController>,
        retry: RetryPolicy,
        ban_purge_seconds: u32,
    ) -> Self {
        Self {
            api,
            lockdown,
            retry,
            ban_purge_seconds,
        }
    }

    pub async fn mitigate(
        &self,
        episode: &Episode,
        actor_ids: &[u64],
        action: MitigationAction,
        policy: &PolicyConfig,
    ) -> MitigationReport {
        let mut report = MitigationReport {
            action: Some(action),
            ..Default::default()
        };
        let reason = format!("[{SYSTEM_NAME}] {} burst, {}", episode.signal, episode.id);

        if action == MitigationAction::Lockdown {
            match self.lockdown.lockdown(episode.guild_id, &reason).await {
                Ok(rec) => report.lockdown = Some(rec),
                Err(e) => {
                    tracing::warn!(guild_id = episode.guild_id, error = %e, "lockdown failed");
                    report.lockdown_error = Some(e.to_string());
                }
            }
            return report;
        }

        for &actor in actor_ids {
            if policy.is_whitelisted(actor) || !episode.claim(actor) {
                report.skipped.push(actor);
                continue;
            }
            let outcome = self.act_on(episode, actor, action, &reason).await;
            tracing::info!(
                guild_id = episode.guild_id,
                episode = %episode.id,
                user_id = actor,
                ?action,
                ?outcome,
                "mitigation"
            );
            report.outcomes.push((actor, outcome));
        }
        report
    }

    async fn act_on(
        &self,
        episode: &Episode,
        actor: u64,
        action: MitigationAction,
        reason: &str,
    ) -> ActorOutcome {
        let gid = episode.guild_id;

        let capable = self
            .retry
            .run("can_moderate", || self.api.can_moderate(gid, actor))
            .await;
        match capable {
            Ok(true) => {}
            Ok(false) => return ActorOutcome::PermissionDenied,
            Err(e) => return classify(e),
        }

        // DM przed akcją – po banie już nie dojdzie
        let _ = self
            .api
            .send_direct_message(actor, &dm_text(episode, action))
            .await;

        let res = match action {
            MitigationAction::Kick => {
                self.retry
                    .run("kick", || self.api.kick(gid, actor, reason))
                    .await
            }
            MitigationAction::Ban => {
                self.retry
                    .run("ban", || self.api.ban(gid, actor, reason, self.ban_purge_seconds))
                    .await
            }
            MitigationAction::RemoveRoles => {
                self.retry
                    .run("strip_roles", || self.api.strip_roles(gid, actor, reason))
                    .await
            }
            MitigationAction::Lockdown => Ok(()),
        };
        match res {
            Ok(()) => ActorOutcome::Done,
            Err(e) => classify(e),
        }
    }
}

fn classify(e: PlatformError) -> ActorOutcome {
    match e {
        PlatformError::Transient(_) => ActorOutcome::GaveUp,
        _ => ActorOutcome::PermissionDenied,
    }
}

fn dm_text(episode: &Episode, action: MitigationAction) -> String {
    let what = match action {
        MitigationAction::Kick => "removed from the server",
        MitigationAction::Ban => "banned from the server",
        MitigationAction::RemoveRoles => "stripped of your roles",
        MitigationAction::Lockdown => "affected by a lockdown",
    };
    format!(
        "You have been {what} by {SYSTEM_NAME}: your account took part in a {} burst that \
         crossed the server's protection threshold. If this is a mistake, contact the staff.",
        episode.signal
    )
}

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GuardError;

/// Category of event aggregated into a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Join,
    Ban,
    Kick,
    #[serde(alias = "roleDelete")]
    RoleDelete,
    #[serde(alias = "channelDelete")]
    ChannelDelete,
}

impl SignalType {
    pub const ALL: [SignalType; 5] = [
        SignalType::Join,
        SignalType::Ban,
        SignalType::Kick,
        SignalType::RoleDelete,
        SignalType::ChannelDelete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SignalType::Join => "join",
            SignalType::Ban => "ban",
            SignalType::Kick => "kick",
            SignalType::RoleDelete => "role_delete",
            SignalType::ChannelDelete => "channel_delete",
        }
    }

    /// Raid (joins) vs nuke (privileged actions).
    pub fn is_raid(self) -> bool {
        matches!(self, SignalType::Join)
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalType {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "join" => Ok(SignalType::Join),
            "ban" => Ok(SignalType::Ban),
            "kick" => Ok(SignalType::Kick),
            "role_delete" | "roleDelete" => Ok(SignalType::RoleDelete),
            "channel_delete" | "channelDelete" => Ok(SignalType::ChannelDelete),
            other => Err(GuardError::InvariantViolation(format!(
                "unknown signal type `{other}`"
            ))),
        }
    }
}

/// One observed event. Never mutated after it is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub actor_id: u64,
    pub signal: SignalType,
    pub target_id: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn join(user_id: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            actor_id: user_id,
            signal: SignalType::Join,
            target_id: None,
            timestamp,
        }
    }

    pub fn privileged(
        actor_id: u64,
        signal: SignalType,
        target_id: Option<u64>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            actor_id,
            signal,
            target_id,
            timestamp,
        }
    }
}

/// Privileged action as handed over by the audit-trail collaborator,
/// before the signal type has been validated.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPrivilegedEvent {
    pub guild_id: u64,
    pub actor_id: u64,
    pub signal_type: String,
    pub target_id: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

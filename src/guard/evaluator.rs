use chrono::{DateTime, Utc};

use crate::guard::policy::PolicyConfig;
use crate::guard::signal::SignalType;
use crate::guard::window::{SignalWindowRegistry, WindowSnapshot};

#[derive(Debug, Clone)]
pub struct Verdict {
    pub count: usize,
    pub threshold: u32,
    pub exceeded: bool,
    pub window: WindowSnapshot,
}

/// Read the window and compare with the policy. `>=`, so a threshold
/// of N fires on exactly the N-th event inside the window.
pub fn evaluate(
    registry: &SignalWindowRegistry,
    guild_id: u64,
    signal: SignalType,
    now: DateTime<Utc>,
    policy: &PolicyConfig,
) -> Verdict {
    evaluate_after(registry, guild_id, signal, now, policy, None)
}

/// Same as [`evaluate`], counting only events recorded after `after_seq`
/// (events an earlier episode already covered do not count twice).
pub fn evaluate_after(
    registry: &SignalWindowRegistry,
    guild_id: u64,
    signal: SignalType,
    now: DateTime<Utc>,
    policy: &PolicyConfig,
    after_seq: Option<u64>,
) -> Verdict {
    let window = registry.count_after(guild_id, signal, now, policy.window(), after_seq);
    let threshold = policy.thresholds.get(signal);
    Verdict {
        count: window.count,
        threshold,
        exceeded: policy.enabled && window.count >= threshold as usize,
        window,
    }
}

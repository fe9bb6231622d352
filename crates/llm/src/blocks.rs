//! Per-process cooldowns for provider accounts.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// Cooldown applied when the upstream gave no usable `Retry-After`.
pub const DEFAULT_BLOCK: Duration = Duration::from_secs(60);

/// Accounts that recently hit a hard rate limit, keyed by bucket key.
///
/// Entries expire by comparison with the clock and are never swept. Blocks are
/// local to this process; the shared limiter covers the fleet.
#[derive(Debug, Default)]
pub struct AccountBlockRegistry {
    blocked_until: DashMap<String, Instant>,
}

impl AccountBlockRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks `account` for `duration`. A longer existing block is kept.
    pub fn block(&self, account: &str, duration: Duration) {
        let duration = if duration.is_zero() { DEFAULT_BLOCK } else { duration };
        let until = Instant::now() + duration;

        self.blocked_until
            .entry(account.to_string())
            .and_modify(|current| *current = (*current).max(until))
            .or_insert(until);

        log::debug!("Account {account} blocked for {duration:?}");
    }

    /// Whether `account` is still cooling down.
    pub fn is_blocked(&self, account: &str) -> bool {
        self.remaining(account).is_some()
    }

    /// Time left on the block of `account`.
    pub fn remaining(&self, account: &str) -> Option<Duration> {
        let until = *self.blocked_until.get(account)?;
        let now = Instant::now();

        (until > now).then(|| until - now)
    }
}

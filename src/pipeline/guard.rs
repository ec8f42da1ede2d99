//! Inbound-message guards: dedup, allow-list, and per-user rate limiting.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Capacity of the recently-seen set before it is cleared wholesale.
pub const RECENT_CAPACITY: usize = 500;

/// Rolling window for the per-user message budget.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Bounded set of recently processed event ids.
///
/// When full, the set is emptied rather than evicting one entry; a
/// redelivery straddling the reset is processed again, which the rest of the
/// pipeline tolerates.
#[derive(Debug, Clone)]
pub struct RecentSet {
    seen: HashSet<String>,
    capacity: usize,
}

impl Default for RecentSet {
    fn default() -> Self {
        Self::with_capacity(RECENT_CAPACITY)
    }
}

impl RecentSet {
    /// Empty set that resets after `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `id`; returns `true` the first time it is seen.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.seen.len() >= self.capacity {
            self.seen.clear();
        }
        self.seen.insert(id.to_owned());
        true
    }

    /// Whether `id` was recorded since the last reset.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }
}

/// Sliding-window message budget per user.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    hits: HashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    /// Allow `limit` messages per user per [`RATE_WINDOW`].
    #[must_use]
    pub fn new(limit: u32) -> Self {
        Self::with_window(limit, RATE_WINDOW)
    }

    /// Allow `limit` messages per user per `window`.
    #[must_use]
    pub fn with_window(limit: u32, window: Duration) -> Self {
        Self {
            limit: usize::try_from(limit).unwrap_or(usize::MAX),
            window,
            hits: HashMap::new(),
        }
    }

    /// Count a message from `user`; returns `false` if it exceeds the budget.
    ///
    /// Rejected messages do not consume budget.
    pub fn check(&mut self, user: &str) -> bool {
        self.check_at(user, Instant::now())
    }

    fn check_at(&mut self, user: &str, now: Instant) -> bool {
        let hits = self.hits.entry(user.to_owned()).or_default();
        while hits
            .front()
            .is_some_and(|&t| now.saturating_duration_since(t) >= self.window)
        {
            hits.pop_front();
        }
        if hits.len() >= self.limit {
            return false;
        }
        hits.push_back(now);
        true
    }
}

/// Whether `user` passes the allow-list.
///
/// `None` admits everyone; an empty list admits nobody.
#[must_use]
pub fn is_allowed(allowed: Option<&[String]>, user: &str) -> bool {
    allowed.is_none_or(|users| users.iter().any(|id| id == user))
}

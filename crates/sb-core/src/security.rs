//! Per-user limit on chat commands (`test` writes alerts to the store).

use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

/// Sliding window: at most `limit` commands per user in any `window`.
#[derive(Clone, Debug)]
pub struct CommandLimiter {
    limit: usize,
    window: Duration,
    recent: HashMap<String, VecDeque<Instant>>,
}

impl CommandLimiter {
    /// A zero `limit` disables limiting.
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit: limit as usize,
            window,
            recent: HashMap::new(),
        }
    }

    /// `Err(retry_after)` when the user is over the limit.
    pub fn check(&mut self, user_id: &str) -> Result<(), Duration> {
        self.check_at(user_id, Instant::now())
    }

    pub fn check_at(&mut self, user_id: &str, now: Instant) -> Result<(), Duration> {
        if self.limit == 0 {
            return Ok(());
        }

        let window = self.window;
        let hits = self.recent.entry(user_id.to_string()).or_default();
        while hits
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= window)
        {
            hits.pop_front();
        }

        if hits.len() < self.limit {
            hits.push_back(now);
            return Ok(());
        }
        let oldest = hits.front().copied().unwrap_or(now);
        Err(window.saturating_sub(now.saturating_duration_since(oldest)))
    }

    /// Forget users with no commands inside the window.
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.recent.retain(|_, hits| {
            hits.back()
                .is_some_and(|t| now.saturating_duration_since(*t) < window)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_slides() {
        let start = Instant::now();
        let mut lim = CommandLimiter::new(2, Duration::from_secs(10));

        assert!(lim.check_at("U1", start).is_ok());
        assert!(lim.check_at("U1", start + Duration::from_secs(4)).is_ok());
        assert_eq!(
            lim.check_at("U1", start + Duration::from_secs(6)),
            Err(Duration::from_secs(4))
        );
        assert!(lim.check_at("U2", start).is_ok());

        // The first command leaves the window at t=10.
        assert!(lim.check_at("U1", start + Duration::from_secs(10)).is_ok());
        assert!(lim.check_at("U1", start + Duration::from_secs(11)).is_err());
    }

    #[test]
    fn zero_limit_disables() {
        let mut lim = CommandLimiter::new(0, Duration::from_secs(10));
        for _ in 0..100 {
            assert!(lim.check("U1").is_ok());
        }
    }

    #[test]
    fn prune_drops_quiet_users() {
        let start = Instant::now();
        let mut lim = CommandLimiter::new(1, Duration::from_secs(5));
        assert!(lim.check_at("U1", start).is_ok());
        lim.prune(start + Duration::from_secs(6));
        assert!(lim.recent.is_empty());
    }
}

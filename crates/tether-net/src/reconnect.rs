//! Reconnect policy for the websocket client.

use std::time::Duration;

use tether_shared::constants::{RECONNECT_BASE_DELAY_MS, RECONNECT_MAX_DELAY_MS};

use crate::client::WebSocketError;

/// Capped exponential backoff: `base * 2^attempt`, never above `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base: Duration,
    max: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base: Duration::from_millis(base_delay_ms),
            max: Duration::from_millis(max_delay_ms),
        }
    }

    /// Delay before retry number `attempt` (zero based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base
            .checked_mul(1_u32 << attempt.min(20))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RECONNECT_BASE_DELAY_MS, RECONNECT_MAX_DELAY_MS)
    }
}

/// Decides whether, and after how long, a dropped connection is retried.
#[derive(Debug, Clone)]
pub struct ReconnectionStrategy {
    policy: RetryPolicy,
    consecutive_failures: u32,
}

impl ReconnectionStrategy {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            consecutive_failures: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Delay before the next attempt, or `None` to stay disconnected.
    ///
    /// Authentication rejections are final; anything else backs off.
    pub fn next_delay(&mut self, error: Option<&WebSocketError>) -> Option<Duration> {
        if let Some(WebSocketError::Server(api)) = error {
            if matches!(api.status, Some(401) | Some(403)) {
                return None;
            }
        }
        let delay = self.policy.delay(self.consecutive_failures);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        Some(delay)
    }

    pub fn successfully_connected(&mut self) {
        self.consecutive_failures = 0;
    }
}

impl Default for ReconnectionStrategy {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use tether_shared::ApiError;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = RetryPolicy::new(100, 1_000);
        let delays: Vec<u128> = (0..6).map(|n| policy.delay(n).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_strategy_backs_off_until_connected() {
        let mut strategy = ReconnectionStrategy::new(RetryPolicy::new(100, 10_000));
        let err = WebSocketError::Engine(EngineError::PongTimeout);

        assert_eq!(strategy.next_delay(Some(&err)), Some(Duration::from_millis(100)));
        assert_eq!(strategy.next_delay(Some(&err)), Some(Duration::from_millis(200)));
        assert_eq!(strategy.next_delay(None), Some(Duration::from_millis(400)));

        strategy.successfully_connected();
        assert_eq!(strategy.consecutive_failures(), 0);
        assert_eq!(strategy.next_delay(Some(&err)), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_strategy_gives_up_on_auth_rejection() {
        let mut strategy = ReconnectionStrategy::default();
        let mut api = ApiError::new(40, "token expired");
        api.status = Some(401);

        assert_eq!(strategy.next_delay(Some(&WebSocketError::Server(api))), None);
        assert_eq!(strategy.consecutive_failures(), 0);

        let mut other = ApiError::new(5, "overloaded");
        other.status = Some(503);
        assert!(strategy
            .next_delay(Some(&WebSocketError::Server(other)))
            .is_some());
    }
}

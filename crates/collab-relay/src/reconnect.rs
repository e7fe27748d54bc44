//! Reconnection scheduling with exponential backoff.
//!
//! The host keeps one [`ReconnectState`] per adapter whose socket dropped.
//! Scheduling is pure arithmetic over millisecond timestamps so it can be
//! driven by any clock, including test-supplied ones.

use std::time::Duration;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before the first reconnect attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum number of attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// The delay before attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay_secs = self.initial_delay.as_secs_f64()
            * self.backoff_factor.powi(attempt.saturating_sub(1) as i32);

        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Reconnection state for one adapter's socket.
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    /// Number of attempts made so far
    pub attempts: u32,
    /// When to attempt the next reconnection (ms since epoch)
    pub next_attempt_at: Option<u64>,
    /// Current backoff delay
    pub current_delay: Duration,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule the next reconnection attempt.
    pub fn schedule(&mut self, now_ms: u64, config: &ReconnectConfig) {
        self.attempts += 1;
        self.current_delay = config.delay_for(self.attempts);
        self.next_attempt_at = Some(now_ms + self.current_delay.as_millis() as u64);
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Whether a scheduled attempt is due.
    pub fn is_due(&self, now_ms: u64) -> bool {
        self.next_attempt_at.map(|t| now_ms >= t).unwrap_or(false)
    }

    /// Whether the attempt budget is exhausted.
    pub fn exceeded_max_attempts(&self, config: &ReconnectConfig) -> bool {
        config
            .max_attempts
            .map(|max| self.attempts >= max)
            .unwrap_or(false)
    }
}

/// Milliseconds since the Unix epoch, for feeding the scheduler.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

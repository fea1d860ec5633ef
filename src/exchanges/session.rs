//! Streaming session lifecycle shared by both venues' stream loops:
//! a small state machine plus exponential backoff with jitter so parallel
//! sessions never reconnect in lockstep.

use std::time::Duration;

/// Session tuning, compiled defaults overridable from the environment.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
    pub connect_timeout_ms: u64,
    /// Application-level keepalive cadence on sockets that require one.
    pub keepalive_interval_secs: u64,
    /// Listen-key renewal cadence; the venue expires idle keys after
    /// roughly half an hour.
    pub listen_key_refresh_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 100,
            backoff_max_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.3,
            connect_timeout_ms: 10_000,
            keepalive_interval_secs: 20,
            listen_key_refresh_secs: 20 * 60,
        }
    }
}

impl SessionConfig {
    /// Load from environment with defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("FUNDARB_BACKOFF_BASE_MS") {
            config.backoff_base_ms = v.parse().unwrap_or(config.backoff_base_ms);
        }
        if let Ok(v) = std::env::var("FUNDARB_BACKOFF_MAX_MS") {
            config.backoff_max_ms = v.parse().unwrap_or(config.backoff_max_ms);
        }
        if let Ok(v) = std::env::var("FUNDARB_CONNECT_TIMEOUT_MS") {
            config.connect_timeout_ms = v.parse().unwrap_or(config.connect_timeout_ms);
        }
        if let Ok(v) = std::env::var("FUNDARB_KEEPALIVE_SECS") {
            config.keepalive_interval_secs = v.parse().unwrap_or(config.keepalive_interval_secs);
        }
        if let Ok(v) = std::env::var("FUNDARB_LISTEN_KEY_REFRESH_SECS") {
            config.listen_key_refresh_secs = v.parse().unwrap_or(config.listen_key_refresh_secs);
        }

        config
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Before any connection attempt.
    Init,
    /// Token acquisition + TCP/TLS/WebSocket upgrade in progress.
    Connecting,
    /// Socket up, subscriptions/auth sent.
    Subscribed,
    /// Actively replicating market data.
    Streaming,
    /// Connection lost, waiting out the backoff timer.
    Reconnecting,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "INIT"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Subscribed => write!(f, "SUBSCRIBED"),
            Self::Streaming => write!(f, "STREAMING"),
            Self::Reconnecting => write!(f, "RECONNECTING"),
        }
    }
}

/// Backoff calculator with jitter.
#[derive(Debug)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    multiplier: f64,
    jitter_factor: f64,
    attempt: u32,
    rng_state: u64,
}

impl Backoff {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            base_ms: config.backoff_base_ms,
            max_ms: config.backoff_max_ms,
            multiplier: config.backoff_multiplier,
            jitter_factor: config.jitter_factor,
            attempt: 0,
            rng_state: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(12345),
        }
    }

    /// Fast PRNG for jitter (xorshift64).
    #[inline]
    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64) / (u64::MAX as f64)
    }

    pub fn next_backoff(&mut self) -> Duration {
        let base = (self.base_ms as f64) * self.multiplier.powi(self.attempt as i32);
        let capped = base.min(self.max_ms as f64);

        let jitter_range = capped * self.jitter_factor;
        let jitter = (self.next_random() * 2.0 - 1.0) * jitter_range;
        let final_ms = (capped + jitter).max(self.base_ms as f64);

        self.attempt += 1;

        Duration::from_millis(final_ms as u64)
    }

    /// Reset after a healthy streaming period.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_resets() {
        let config = SessionConfig::default();
        let mut backoff = Backoff::new(&config);

        let d1 = backoff.next_backoff();
        assert!(d1.as_millis() >= 70 && d1.as_millis() <= 130);

        let d2 = backoff.next_backoff();
        assert!(d2.as_millis() >= 140 && d2.as_millis() <= 260);

        backoff.reset();
        let d3 = backoff.next_backoff();
        assert!(d3.as_millis() >= 70 && d3.as_millis() <= 130);
    }

    #[test]
    fn backoff_respects_cap() {
        let config = SessionConfig::default();
        let mut backoff = Backoff::new(&config);

        for _ in 0..20 {
            let d = backoff.next_backoff();
            assert!(d.as_millis() <= 39_000); // 30000 * 1.3
        }
    }

    #[test]
    fn state_display_names() {
        assert_eq!(SessionState::Streaming.to_string(), "STREAMING");
        assert_eq!(SessionState::Reconnecting.to_string(), "RECONNECTING");
    }
}

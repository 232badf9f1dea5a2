//! Bus configuration.
//!
//! Plain structs with defaults; [`BusBuilder`](crate::BusBuilder) is the
//! usual way to set them.

use std::time::Duration;

use crate::codec::PayloadFormat;
use crate::error::{BusError, Result};
use crate::handler::DEFAULT_SUBSCRIBER_QUEUE_CAPACITY;
use crate::protocol::{ABSOLUTE_MAX_FRAME_SIZE, DEFAULT_MAX_FRAME_SIZE};
use crate::writer::WriterConfig;

/// Default maximum concurrent handler tasks per bus endpoint.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Default period of the request timeout sweep.
pub const DEFAULT_REQUEST_SWEEP_INTERVAL: Duration = Duration::from_millis(25);

/// Default time the server keeps a forwarded request open.
pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(60);

/// Exponential backoff for dialing.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor between attempts.
    pub multiplier: f64,
    /// Total attempts, `None` for no limit.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Policy for the initial connect: a handful of quick attempts.
    pub fn connect() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_attempts: Some(5),
        }
    }

    /// Policy after an unexpected disconnect: keep trying.
    pub fn reconnect() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_attempts: None,
        }
    }

    /// Single attempt, no retry.
    pub fn once() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            max_attempts: Some(1),
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::connect()
    }
}

/// Everything a bus endpoint can be tuned with.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// How often pending requests are checked against their deadline.
    pub request_sweep_interval: Duration,
    /// How long the server waits for a forwarded request's reply.
    pub forward_timeout: Duration,
    /// Handler tasks allowed to run at once; excess requests are refused.
    pub max_concurrent_handlers: usize,
    /// Queue depth per subscriber.
    pub subscriber_queue_capacity: usize,
    /// Largest frame body accepted or produced.
    pub max_frame_size: u32,
    /// Serialization of message payloads.
    pub payload_format: PayloadFormat,
    /// Shared secret; when set, every frame body is encrypted.
    pub secret: Option<Vec<u8>>,
    /// Outbound queue settings per connection.
    pub writer: WriterConfig,
    /// Dialing policy for the first connect.
    pub connect: RetryPolicy,
    /// Dialing policy after a disconnect.
    pub reconnect: RetryPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            request_sweep_interval: DEFAULT_REQUEST_SWEEP_INTERVAL,
            forward_timeout: DEFAULT_FORWARD_TIMEOUT,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            subscriber_queue_capacity: DEFAULT_SUBSCRIBER_QUEUE_CAPACITY,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            payload_format: PayloadFormat::default(),
            secret: None,
            writer: WriterConfig::default(),
            connect: RetryPolicy::connect(),
            reconnect: RetryPolicy::reconnect(),
        }
    }
}

impl BusConfig {
    /// Reject settings the bus cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.request_sweep_interval.is_zero() {
            return Err(BusError::Config("request_sweep_interval must be non-zero".into()));
        }
        if self.max_concurrent_handlers == 0 {
            return Err(BusError::Config("max_concurrent_handlers must be at least 1".into()));
        }
        if self.writer.max_pending_frames == 0 {
            return Err(BusError::Config("max_pending_frames must be at least 1".into()));
        }
        if self.max_frame_size == 0 || self.max_frame_size > ABSOLUTE_MAX_FRAME_SIZE {
            return Err(BusError::Config(format!(
                "max_frame_size must be in 1..={}",
                ABSOLUTE_MAX_FRAME_SIZE
            )));
        }
        if matches!(&self.secret, Some(s) if s.is_empty()) {
            return Err(BusError::Config("secret must not be empty".into()));
        }
        for policy in [&self.connect, &self.reconnect] {
            if policy.max_attempts == Some(0) {
                return Err(BusError::Config("max_attempts must be at least 1".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.request_sweep_interval, Duration::from_millis(25));
        assert_eq!(config.max_concurrent_handlers, 256);
        assert_eq!(config.max_frame_size, 16 * 1024 * 1024);
        assert_eq!(config.payload_format, PayloadFormat::MsgPack);
        assert!(config.secret.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            multiplier: 2.0,
            max_attempts: Some(4),
        };

        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(350));
        assert_eq!(policy.delay_after(40), Duration::from_millis(350));

        assert!(policy.allows(3));
        assert!(!policy.allows(4));
        assert!(RetryPolicy::reconnect().allows(u32::MAX - 1));
    }

    #[test]
    fn test_validate_rejects_nonsense() {
        let mut config = BusConfig::default();
        config.max_concurrent_handlers = 0;
        assert!(matches!(config.validate(), Err(BusError::Config(_))));

        let mut config = BusConfig::default();
        config.secret = Some(Vec::new());
        assert!(config.validate().is_err());

        let mut config = BusConfig::default();
        config.connect.max_attempts = Some(0);
        assert!(config.validate().is_err());
    }
}

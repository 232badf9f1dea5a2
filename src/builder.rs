//! Fluent construction of bus endpoints.
//!
//! # Example
//!
//! ```ignore
//! use wirebus::{Bus, Endpoint};
//! use tokio_util::sync::CancellationToken;
//!
//! let lifetime = CancellationToken::new();
//! let client = Bus::builder()
//!     .message::<Ping>()
//!     .message_as::<Pong>("demo.pong")
//!     .secret("shared secret")
//!     .connect(&Endpoint::pipe("demo"), &lifetime)
//!     .await?;
//! ```

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::bus::BusCore;
use crate::client::BusClient;
use crate::codec::PayloadFormat;
use crate::config::{BusConfig, RetryPolicy};
use crate::error::{BusError, Result};
use crate::registry::{Message, TypeRegistry};
use crate::server::BusServer;
use crate::transport::Endpoint;
use crate::writer::WriterConfig;

/// Builder for a [`BusServer`] or [`BusClient`].
///
/// Registration errors are kept until [`serve`](Self::serve) or
/// [`connect`](Self::connect) so the chain stays fluent.
pub struct BusBuilder {
    registry: TypeRegistry,
    config: BusConfig,
    error: Option<BusError>,
}

impl BusBuilder {
    /// Create a builder with default configuration and no types.
    pub fn new() -> Self {
        Self {
            registry: TypeRegistry::new(),
            config: BusConfig::default(),
            error: None,
        }
    }

    /// Register `T` under its derived slug.
    pub fn message<T: Message>(mut self) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.registry.register::<T>() {
                self.error = Some(e);
            }
        }
        self
    }

    /// Register `T` under an explicit slug.
    pub fn message_as<T: Message>(mut self, slug: &str) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.registry.register_as::<T>(slug) {
                self.error = Some(e);
            }
        }
        self
    }

    /// Use a prepared registry instead.
    pub fn registry(mut self, registry: TypeRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Payload format for application messages.
    ///
    /// Default: MsgPack
    pub fn payload_format(mut self, format: PayloadFormat) -> Self {
        self.config.payload_format = format;
        self
    }

    /// Encrypt every frame body with a key derived from `secret`.
    pub fn secret(mut self, secret: impl AsRef<[u8]>) -> Self {
        self.config.secret = Some(secret.as_ref().to_vec());
        self
    }

    /// Maximum handler tasks running at once.
    ///
    /// Default: 256
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.config.max_concurrent_handlers = limit;
        self
    }

    /// How often request deadlines are checked.
    ///
    /// Default: 25 ms
    pub fn request_sweep_interval(mut self, interval: Duration) -> Self {
        self.config.request_sweep_interval = interval;
        self
    }

    /// How long the server keeps a forwarded request open.
    ///
    /// Default: 60 seconds
    pub fn forward_timeout(mut self, timeout: Duration) -> Self {
        self.config.forward_timeout = timeout;
        self
    }

    /// Queue depth per subscriber. A full queue drops new messages.
    ///
    /// Default: 16384
    pub fn subscriber_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.subscriber_queue_capacity = capacity;
        self
    }

    /// Largest frame body accepted or produced.
    ///
    /// Default: 16 MiB
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Outbound queue depth per connection.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.writer.max_pending_frames = limit;
        self
    }

    /// How long a send waits for queue space before the connection is failed.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.writer.backpressure_timeout = timeout;
        self
    }

    /// Full outbound queue settings.
    pub fn writer_config(mut self, writer: WriterConfig) -> Self {
        self.config.writer = writer;
        self
    }

    /// Retry policy for the first connect.
    pub fn connect_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.connect = policy;
        self
    }

    /// Retry policy after an unexpected disconnect.
    pub fn reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    fn start_core(self, lifetime: &CancellationToken) -> Result<std::sync::Arc<BusCore>> {
        if let Some(e) = self.error {
            return Err(e);
        }
        self.config.validate()?;
        Ok(BusCore::start(
            self.registry,
            self.config,
            lifetime.child_token(),
        ))
    }

    /// Listen on `endpoint` and run as the server until `lifetime` is
    /// cancelled or the server is shut down.
    pub async fn serve(self, endpoint: &Endpoint, lifetime: &CancellationToken) -> Result<BusServer> {
        let core = self.start_core(lifetime)?;
        BusServer::start(core, endpoint).await
    }

    /// Connect to a server at `endpoint`, retrying per the connect policy.
    ///
    /// Fails with [`BusError::ConnectFailed`] once the policy is exhausted.
    pub async fn connect(self, endpoint: &Endpoint, lifetime: &CancellationToken) -> Result<BusClient> {
        let core = self.start_core(lifetime)?;
        BusClient::start(core, endpoint.clone()).await
    }
}

impl Default for BusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Ping(u32);
    #[derive(Serialize, Deserialize)]
    struct Pong(u32);

    #[test]
    fn test_builder_configuration() {
        let builder = BusBuilder::new()
            .message::<Ping>()
            .message_as::<Pong>("demo.pong")
            .payload_format(PayloadFormat::Json)
            .secret("s3cret")
            .max_concurrent_handlers(16)
            .max_pending_frames(64)
            .backpressure_timeout(Duration::from_secs(1))
            .forward_timeout(Duration::from_secs(2));

        assert!(builder.error.is_none());
        assert_eq!(builder.registry.len(), 2);
        assert_eq!(builder.config.payload_format, PayloadFormat::Json);
        assert_eq!(builder.config.secret.as_deref(), Some(&b"s3cret"[..]));
        assert_eq!(builder.config.max_concurrent_handlers, 16);
        assert_eq!(builder.config.writer.max_pending_frames, 64);
        assert_eq!(builder.config.writer.backpressure_timeout, Duration::from_secs(1));
        assert_eq!(builder.config.forward_timeout, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_registration_error_surfaces_on_serve() {
        let lifetime = CancellationToken::new();
        let result = BusBuilder::new()
            .message_as::<Ping>("same")
            .message_as::<Pong>("same")
            .serve(&Endpoint::tcp("127.0.0.1:0"), &lifetime)
            .await;

        assert!(matches!(result, Err(BusError::SlugCollision { .. })));
    }

    #[tokio::test]
    async fn test_invalid_config_surfaces_on_connect() {
        let lifetime = CancellationToken::new();
        let result = BusBuilder::new()
            .max_concurrent_handlers(0)
            .connect(&Endpoint::tcp("127.0.0.1:1"), &lifetime)
            .await;

        assert!(matches!(result, Err(BusError::Config(_))));
    }
}

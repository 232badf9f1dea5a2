//! Client side: one connection to a server, re-established on loss.
//!
//! The client lifecycle:
//! 1. Dial the endpoint, retrying per the connect policy
//! 2. Announce every registered handler slug to the server
//! 3. Route inbound envelopes to subscribers, handlers and the correlator
//! 4. On an unexpected disconnect, fail the requests that were in flight,
//!    then redial per the reconnect policy and announce again
//!
//! Subscriptions and handlers live on the bus, not on the connection, so
//! they survive reconnects untouched.

use std::ops::Deref;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::bus::{Bus, BusCore, Link};
use crate::codec::{PayloadKind, SealedEnvelope};
use crate::config::RetryPolicy;
use crate::connection::{Connection, InboundHandler};
use crate::control::{ErrorCode, HandlerAnnouncement, ANNOUNCE_SLUG, WITHDRAW_SLUG};
use crate::correlator::FailureReason;
use crate::error::{BusError, Result};
use crate::transport::{dial, BoxedStream, Endpoint};

pub(crate) struct ClientShared {
    core: Arc<BusCore>,
    endpoint: Endpoint,
    current: RwLock<Option<Arc<Connection>>>,
    disconnected: Notify,
}

impl ClientShared {
    fn connection(&self) -> Option<Arc<Connection>> {
        self.current
            .read()
            .as_ref()
            .filter(|connection| connection.is_open())
            .cloned()
    }

    fn attach(self: &Arc<Self>, stream: BoxedStream) {
        let inbound: Arc<dyn InboundHandler> = self.clone();
        let connection = Connection::spawn(
            stream,
            self.endpoint.to_string(),
            self.core.codec.clone(),
            self.core.config.writer.clone(),
            inbound,
            &self.core.lifetime,
        );
        *self.current.write() = Some(connection.clone());

        // The stream may have died before it was published; whoever clears
        // `current` signals the supervisor.
        if !connection.is_open() {
            self.clear_if_current(&connection);
            return;
        }

        let slugs = self.core.handlers.slugs();
        if !slugs.is_empty() {
            self.send_control(&connection, ANNOUNCE_SLUG, slugs);
        }
    }

    fn clear_if_current(&self, connection: &Connection) -> bool {
        let mut current = self.current.write();
        if current.as_ref().is_some_and(|c| c.id() == connection.id()) {
            *current = None;
            drop(current);
            self.disconnected.notify_one();
            return true;
        }
        false
    }

    fn send_control(&self, connection: &Arc<Connection>, slug: &str, slugs: Vec<String>) {
        let sent = HandlerAnnouncement::new(slugs)
            .into_envelope(slug)
            .and_then(|env| self.core.codec.seal(env))
            .and_then(|sealed| connection.enqueue(sealed.to_frame()));

        if let Err(e) = sent {
            tracing::warn!(connection = %connection.id(), slug, error = %e, "control envelope not sent");
        }
    }

    async fn supervise(self: Arc<Self>) {
        let lifetime = self.core.lifetime.clone();

        loop {
            tokio::select! {
                biased;
                _ = lifetime.cancelled() => return,
                _ = self.disconnected.notified() => {}
            }
            if self.connection().is_some() {
                continue;
            }

            tracing::warn!(endpoint = %self.endpoint, "connection lost, reconnecting");
            match dial_with_retry(&self.endpoint, &self.core.config.reconnect, &lifetime).await {
                Ok(stream) => {
                    self.attach(stream);
                    tracing::info!(endpoint = %self.endpoint, "reconnected");
                }
                Err(BusError::Cancelled) => return,
                Err(e) => {
                    tracing::error!(endpoint = %self.endpoint, error = %e, "giving up on reconnect");
                    return;
                }
            }
        }
    }
}

impl InboundHandler for ClientShared {
    fn on_envelope(&self, connection: &Arc<Connection>, sealed: SealedEnvelope) {
        let envelope = sealed.envelope();
        match envelope.kind() {
            PayloadKind::Broadcast => {
                self.core.deliver_local(envelope, Some(connection.id()));
            }
            PayloadKind::Request => {
                if !self.core.dispatch_request(connection, envelope) {
                    // The handler was withdrawn while the request was in flight.
                    self.core.reply_error(
                        connection,
                        envelope.id(),
                        ErrorCode::UnknownType,
                        envelope.slug(),
                    );
                }
            }
            PayloadKind::Reply => {
                let correlation_id = envelope.correlation_id();
                if !self
                    .core
                    .correlator
                    .resolve(correlation_id, sealed.into_envelope())
                {
                    tracing::debug!(request = %correlation_id, "late or unknown reply discarded");
                }
            }
            PayloadKind::Control => {
                tracing::debug!(slug = envelope.slug(), "control envelope from server ignored");
            }
        }
    }

    fn on_closed(&self, connection: &Arc<Connection>) {
        let failed = self
            .core
            .correlator
            .fail_connection(connection.id(), FailureReason::ConnectionLost);
        if failed > 0 {
            tracing::warn!(
                connection = %connection.id(),
                failed,
                "pending requests failed by disconnect"
            );
        }
        self.clear_if_current(connection);
    }
}

impl Link for ClientShared {
    fn broadcast(&self, sealed: &SealedEnvelope) {
        let Some(connection) = self.connection() else {
            tracing::debug!(slug = sealed.envelope().slug(), "not connected, broadcast stays local");
            return;
        };
        if let Err(e) = connection.enqueue(sealed.to_frame()) {
            tracing::debug!(slug = sealed.envelope().slug(), error = %e, "broadcast not sent");
        }
    }

    fn route_request(&self, _slug: &str) -> Result<Arc<Connection>> {
        self.connection().ok_or(BusError::ConnectionLost)
    }

    fn handlers_changed(&self, slug: &str, registered: bool) {
        if let Some(connection) = self.connection() {
            let control = if registered { ANNOUNCE_SLUG } else { WITHDRAW_SLUG };
            self.send_control(&connection, control, vec![slug.to_string()]);
        }
    }
}

/// A connected bus client. Dereferences to [`Bus`].
///
/// Dropping the client disconnects it.
pub struct BusClient {
    bus: Bus,
    shared: Arc<ClientShared>,
}

impl BusClient {
    pub(crate) async fn start(core: Arc<BusCore>, endpoint: Endpoint) -> Result<Self> {
        let stream = match dial_with_retry(&endpoint, &core.config.connect, &core.lifetime).await {
            Ok(stream) => stream,
            Err(e) => {
                core.lifetime.cancel();
                return Err(e);
            }
        };

        let shared = Arc::new(ClientShared {
            core: core.clone(),
            endpoint,
            current: RwLock::new(None),
            disconnected: Notify::new(),
        });
        shared.attach(stream);
        tokio::spawn(shared.clone().supervise());
        tracing::info!(endpoint = %shared.endpoint, "bus client connected");

        let link: Arc<dyn Link> = shared.clone();
        Ok(Self {
            bus: Bus { core, link },
            shared,
        })
    }

    /// Whether a connection to the server is currently up.
    pub fn is_connected(&self) -> bool {
        self.shared.connection().is_some()
    }

    /// The endpoint this client dials.
    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    /// Handle usable after the client value itself has moved.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Disconnect for good. Pending requests fail, no reconnect follows.
    pub fn shutdown(&self) {
        if !self.bus.core.lifetime.is_cancelled() {
            tracing::info!(endpoint = %self.shared.endpoint, "bus client shutting down");
            self.bus.core.lifetime.cancel();
        }
    }
}

impl Deref for BusClient {
    type Target = Bus;

    fn deref(&self) -> &Bus {
        &self.bus
    }
}

impl Drop for BusClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Dial until it works, the policy runs out or `lifetime` is cancelled.
async fn dial_with_retry(
    endpoint: &Endpoint,
    policy: &RetryPolicy,
    lifetime: &CancellationToken,
) -> Result<BoxedStream> {
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let error = tokio::select! {
            _ = lifetime.cancelled() => return Err(BusError::Cancelled),
            dialed = dial(endpoint) => match dialed {
                Ok(stream) => return Ok(stream),
                Err(e) => e,
            },
        };

        if !policy.allows(attempts) {
            return Err(BusError::ConnectFailed {
                endpoint: endpoint.to_string(),
                reason: error.to_string(),
            });
        }

        let delay = policy.delay_after(attempts);
        tracing::debug!(%endpoint, attempt = attempts, ?delay, %error, "dial failed, retrying");
        tokio::select! {
            _ = lifetime.cancelled() => return Err(BusError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn quick(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
            max_attempts: Some(attempts),
        }
    }

    async fn dead_endpoint() -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        Endpoint::tcp(addr.to_string())
    }

    #[tokio::test]
    async fn test_dial_gives_up_with_connect_failed() {
        let endpoint = dead_endpoint().await;
        let err = dial_with_retry(&endpoint, &quick(3), &CancellationToken::new())
            .await
            .err()
            .unwrap();

        match err {
            BusError::ConnectFailed { endpoint: ep, .. } => assert_eq!(ep, endpoint.to_string()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dial_stops_on_cancel() {
        let endpoint = dead_endpoint().await;
        let lifetime = CancellationToken::new();
        let policy = RetryPolicy {
            max_attempts: None,
            ..quick(1)
        };

        let canceller = lifetime.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = dial_with_retry(&endpoint, &policy, &lifetime).await.err().unwrap();
        assert!(matches!(err, BusError::Cancelled));
    }

    #[tokio::test]
    async fn test_dial_succeeds_once_listener_appears() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::tcp(listener.local_addr().unwrap().to_string());

        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        let stream = dial_with_retry(&endpoint, &quick(3), &CancellationToken::new()).await;

        assert!(stream.is_ok());
        assert!(accept.await.unwrap().is_ok());
    }
}

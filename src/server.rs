//! Server side: accept loop and the multiplexer over live connections.
//!
//! The server owns the live connection set. For each inbound envelope it
//! decides where it goes:
//!
//! | kind      | action                                                         |
//! |-----------|----------------------------------------------------------------|
//! | broadcast | relay to every other connection, deliver to local subscribers  |
//! | request   | local handler, else forward to an announcing client, else `$error` |
//! | reply     | relay to the forwarding origin, else resolve a local request   |
//! | control   | update the handler routes of the sending connection            |
//!
//! A closed connection leaves the live set, its routes are dropped, local
//! requests it carried fail as connection lost and requests forwarded to it
//! are answered with a `ConnectionLost` error reply.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::bus::{Bus, BusCore, Link};
use crate::codec::{PayloadKind, SealedEnvelope};
use crate::connection::{Connection, ConnectionId, ConnectionState, InboundHandler};
use crate::control::{ErrorCode, HandlerAnnouncement, ANNOUNCE_SLUG, WITHDRAW_SLUG};
use crate::correlator::FailureReason;
use crate::error::{BusError, Result};
use crate::transport::{BoxedStream, Endpoint, Listener};

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A request the server passed on to another connection.
#[derive(Debug, Clone, Copy)]
struct Forward {
    origin: ConnectionId,
    target: ConnectionId,
    deadline: Instant,
}

pub(crate) struct ServerShared {
    core: Arc<BusCore>,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    routes: RwLock<HashMap<String, Vec<ConnectionId>>>,
    forwards: DashMap<Uuid, Forward>,
}

impl ServerShared {
    fn attach(self: &Arc<Self>, stream: BoxedStream, peer: String) {
        let inbound: Arc<dyn InboundHandler> = self.clone();
        let connection = Connection::spawn(
            stream,
            peer,
            self.core.codec.clone(),
            self.core.config.writer.clone(),
            inbound,
            &self.core.lifetime,
        );

        self.connections.insert(connection.id(), connection.clone());
        // on_closed may already have run before the insert.
        if connection.state() == ConnectionState::Closed {
            self.connections.remove(&connection.id());
        }
    }

    /// Live connection announcing a handler for `slug`, other than `exclude`.
    fn route(&self, slug: &str, exclude: Option<ConnectionId>) -> Option<Arc<Connection>> {
        let routes = self.routes.read();
        routes.get(slug)?.iter().find_map(|id| {
            if Some(*id) == exclude {
                return None;
            }
            self.connections
                .get(id)
                .map(|entry| entry.value().clone())
                .filter(|connection| connection.is_open())
        })
    }

    fn relay(&self, sealed: &SealedEnvelope, except: Option<ConnectionId>) -> usize {
        let mut sent = 0;
        for entry in self.connections.iter() {
            if Some(*entry.key()) == except {
                continue;
            }
            match entry.value().enqueue(sealed.to_frame()) {
                Ok(()) => sent += 1,
                Err(e) => tracing::debug!(
                    connection = %entry.key(),
                    slug = sealed.envelope().slug(),
                    error = %e,
                    "broadcast not relayed"
                ),
            }
        }
        sent
    }

    fn on_request(&self, connection: &Arc<Connection>, sealed: SealedEnvelope) {
        let envelope = sealed.envelope();
        if self.core.dispatch_request(connection, envelope) {
            return;
        }

        let Some(target) = self.route(envelope.slug(), Some(connection.id())) else {
            tracing::debug!(
                connection = %connection.id(),
                slug = envelope.slug(),
                "no handler for request"
            );
            self.core.reply_error(
                connection,
                envelope.id(),
                ErrorCode::UnknownType,
                envelope.slug(),
            );
            return;
        };

        let request_id = envelope.id();
        self.forwards.insert(
            request_id,
            Forward {
                origin: connection.id(),
                target: target.id(),
                deadline: Instant::now() + self.core.config.forward_timeout,
            },
        );
        tracing::debug!(
            slug = envelope.slug(),
            request = %request_id,
            from = %connection.id(),
            to = %target.id(),
            "forwarding request"
        );

        if let Err(e) = target.enqueue(sealed.to_frame()) {
            if self.forwards.remove(&request_id).is_some() {
                self.core.reply_error(
                    connection,
                    request_id,
                    ErrorCode::ConnectionLost,
                    e.to_string(),
                );
            }
        }
    }

    fn on_reply(&self, connection: &Arc<Connection>, sealed: SealedEnvelope) {
        let correlation_id = sealed.envelope().correlation_id();

        if let Some((_, forward)) = self.forwards.remove(&correlation_id) {
            if forward.target != connection.id() {
                tracing::warn!(
                    connection = %connection.id(),
                    request = %correlation_id,
                    "reply from a connection the request was not forwarded to"
                );
            }
            match self.connections.get(&forward.origin) {
                Some(origin) => {
                    if let Err(e) = origin.value().enqueue(sealed.to_frame()) {
                        tracing::debug!(request = %correlation_id, error = %e, "reply not relayed");
                    }
                }
                None => tracing::debug!(request = %correlation_id, "requester gone, reply dropped"),
            }
            return;
        }

        if !self
            .core
            .correlator
            .resolve(correlation_id, sealed.into_envelope())
        {
            tracing::debug!(
                connection = %connection.id(),
                request = %correlation_id,
                "late or unknown reply discarded"
            );
        }
    }

    fn on_control(&self, connection: &Arc<Connection>, sealed: SealedEnvelope) {
        let envelope = sealed.envelope();
        let announcement = match HandlerAnnouncement::decode(envelope.data()) {
            Ok(announcement) => announcement,
            Err(e) => {
                tracing::warn!(connection = %connection.id(), error = %e, "bad control payload");
                return;
            }
        };

        let id = connection.id();
        let mut routes = self.routes.write();
        match envelope.slug() {
            ANNOUNCE_SLUG => {
                for slug in announcement.slugs {
                    tracing::debug!(connection = %id, slug = %slug, "handler announced");
                    let targets = routes.entry(slug).or_default();
                    if !targets.contains(&id) {
                        targets.push(id);
                    }
                }
            }
            WITHDRAW_SLUG => {
                for slug in announcement.slugs {
                    tracing::debug!(connection = %id, slug = %slug, "handler withdrawn");
                    if let Some(targets) = routes.get_mut(&slug) {
                        targets.retain(|t| *t != id);
                        if targets.is_empty() {
                            routes.remove(&slug);
                        }
                    }
                }
            }
            other => tracing::debug!(connection = %id, slug = other, "unknown control envelope ignored"),
        }
    }

    fn expire_forwards(&self, now: Instant) -> usize {
        let before = self.forwards.len();
        self.forwards.retain(|_, forward| forward.deadline > now);
        before.saturating_sub(self.forwards.len())
    }
}

impl InboundHandler for ServerShared {
    fn on_envelope(&self, connection: &Arc<Connection>, sealed: SealedEnvelope) {
        match sealed.envelope().kind() {
            PayloadKind::Broadcast => {
                self.relay(&sealed, Some(connection.id()));
                self.core
                    .deliver_local(sealed.envelope(), Some(connection.id()));
            }
            PayloadKind::Request => self.on_request(connection, sealed),
            PayloadKind::Reply => self.on_reply(connection, sealed),
            PayloadKind::Control => self.on_control(connection, sealed),
        }
    }

    fn on_closed(&self, connection: &Arc<Connection>) {
        let id = connection.id();
        self.connections.remove(&id);

        {
            let mut routes = self.routes.write();
            routes.retain(|_, targets| {
                targets.retain(|t| *t != id);
                !targets.is_empty()
            });
        }

        let failed = self
            .core
            .correlator
            .fail_connection(id, FailureReason::ConnectionLost);

        let orphaned: Vec<(Uuid, Forward)> = self
            .forwards
            .iter()
            .filter(|entry| entry.target == id || entry.origin == id)
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        for (request_id, forward) in orphaned {
            if self.forwards.remove(&request_id).is_none() || forward.origin == id {
                continue;
            }
            if let Some(origin) = self.connections.get(&forward.origin) {
                self.core.reply_error(
                    origin.value(),
                    request_id,
                    ErrorCode::ConnectionLost,
                    "handling connection closed",
                );
            }
        }

        tracing::info!(
            connection = %id,
            peer = connection.peer(),
            failed_requests = failed,
            live = self.connections.len(),
            "client disconnected"
        );
    }
}

impl Link for ServerShared {
    fn broadcast(&self, sealed: &SealedEnvelope) {
        self.relay(sealed, None);
    }

    fn route_request(&self, slug: &str) -> Result<Arc<Connection>> {
        self.route(slug, None)
            .ok_or_else(|| BusError::UnknownType(slug.to_string()))
    }

    fn handlers_changed(&self, _slug: &str, _registered: bool) {}
}

/// A running bus server. Dereferences to [`Bus`].
///
/// Dropping the server shuts it down.
pub struct BusServer {
    bus: Bus,
    shared: Arc<ServerShared>,
    local: Endpoint,
}

impl BusServer {
    pub(crate) async fn start(core: Arc<BusCore>, endpoint: &Endpoint) -> Result<Self> {
        let listener = match Listener::bind(endpoint).await {
            Ok(listener) => listener,
            Err(e) => {
                core.lifetime.cancel();
                return Err(e);
            }
        };
        let local = match listener.local_endpoint() {
            Ok(local) => local,
            Err(e) => {
                core.lifetime.cancel();
                return Err(e);
            }
        };

        let shared = Arc::new(ServerShared {
            core: core.clone(),
            connections: DashMap::new(),
            routes: RwLock::new(HashMap::new()),
            forwards: DashMap::new(),
        });

        tokio::spawn(accept_loop(shared.clone(), listener));
        tokio::spawn(forward_sweep(shared.clone()));
        tracing::info!(endpoint = %local, "bus server listening");

        let link: Arc<dyn Link> = shared.clone();
        Ok(Self {
            bus: Bus { core, link },
            shared,
            local,
        })
    }

    /// The endpoint clients should dial (ephemeral TCP ports resolved).
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }

    /// Number of live client connections.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Handle usable after the server value itself has moved.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Stop accepting, close every connection and fail pending requests.
    pub fn shutdown(&self) {
        if !self.bus.core.lifetime.is_cancelled() {
            tracing::info!(endpoint = %self.local, "bus server shutting down");
            self.bus.core.lifetime.cancel();
        }
    }
}

impl Deref for BusServer {
    type Target = Bus;

    fn deref(&self) -> &Bus {
        &self.bus
    }
}

impl Drop for BusServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(shared: Arc<ServerShared>, mut listener: Listener) {
    let lifetime = shared.core.lifetime.clone();

    loop {
        let accepted = tokio::select! {
            _ = lifetime.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => shared.attach(stream, peer),
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }

    tracing::debug!("accept loop stopped");
}

async fn forward_sweep(shared: Arc<ServerShared>) {
    let lifetime = shared.core.lifetime.clone();
    let mut ticker = tokio::time::interval(shared.core.config.request_sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = lifetime.cancelled() => break,
            _ = ticker.tick() => {
                let expired = shared.expire_forwards(Instant::now());
                if expired > 0 {
                    tracing::debug!(expired, "forwarded requests expired");
                }
            }
        }
    }
}

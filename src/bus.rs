//! The application-facing bus API shared by server and client.
//!
//! A [`Bus`] is a cheap handle over one endpoint's state: its type
//! registry, codec, handler and subscriber tables and the request
//! correlator. What differs between a server and a client (where a
//! broadcast goes, which connection carries a request) sits behind the
//! crate-internal `Link` trait.
//!
//! # Example
//!
//! ```ignore
//! let lifetime = CancellationToken::new();
//! let server = Bus::builder()
//!     .message::<Ping>()
//!     .message::<Pong>()
//!     .serve(&Endpoint::tcp("127.0.0.1:7000"), &lifetime)
//!     .await?;
//!
//! let _handler = server.register_handler(&lifetime, |ping: Ping, _ctx| async move {
//!     Ok(Pong(ping.0 + 1))
//! })?;
//!
//! let _sub = server.subscribe(&lifetime, |tick: Tick| {
//!     tracing::info!(n = tick.0, "tick");
//! })?;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::builder::BusBuilder;
use crate::codec::{Envelope, EnvelopeCodec, PayloadKind, SealedEnvelope};
use crate::config::BusConfig;
use crate::connection::{Connection, ConnectionId};
use crate::control::{ErrorCode, ErrorReply, ERROR_SLUG};
use crate::correlator::{spawn_sweeper, Correlator, FailureReason, Outcome};
use crate::error::{BusError, Result};
use crate::handler::{
    Callback, HandlerEntry, HandlerTable, MessageContext, SubscriberTable, Subscription,
    TypedHandler,
};
use crate::registry::{Message, TypeRegistry};

/// What a bus endpoint does with traffic that leaves the process.
pub(crate) trait Link: Send + Sync + 'static {
    /// Send a published envelope to remote subscribers.
    fn broadcast(&self, sealed: &SealedEnvelope);

    /// Connection that should carry a request for `slug`.
    fn route_request(&self, slug: &str) -> Result<Arc<Connection>>;

    /// A local handler for `slug` was registered or removed.
    fn handlers_changed(&self, slug: &str, registered: bool);
}

/// State shared by every handle to one bus endpoint.
pub(crate) struct BusCore {
    pub(crate) registry: TypeRegistry,
    pub(crate) codec: Arc<EnvelopeCodec>,
    pub(crate) config: BusConfig,
    pub(crate) handlers: HandlerTable,
    pub(crate) subscribers: Arc<SubscriberTable>,
    pub(crate) correlator: Arc<Correlator>,
    handler_permits: Arc<Semaphore>,
    pub(crate) lifetime: CancellationToken,
}

impl BusCore {
    /// Build the core and start the request sweep. Needs a Tokio runtime.
    pub(crate) fn start(
        registry: TypeRegistry,
        config: BusConfig,
        lifetime: CancellationToken,
    ) -> Arc<Self> {
        let mut codec = EnvelopeCodec::new(config.payload_format)
            .with_max_frame_size(config.max_frame_size);
        if let Some(secret) = &config.secret {
            codec = codec.with_secret(secret);
        }

        let correlator = Arc::new(Correlator::new());
        spawn_sweeper(
            correlator.clone(),
            config.request_sweep_interval,
            lifetime.clone(),
        );

        Arc::new(Self {
            registry,
            codec: Arc::new(codec),
            subscribers: Arc::new(SubscriberTable::new(
                config.subscriber_queue_capacity,
                lifetime.clone(),
            )),
            handler_permits: Arc::new(Semaphore::new(config.max_concurrent_handlers)),
            handlers: HandlerTable::new(),
            correlator,
            config,
            lifetime,
        })
    }

    /// Hand a broadcast to local subscribers.
    pub(crate) fn deliver_local(&self, envelope: &Envelope, origin: Option<ConnectionId>) -> usize {
        let slug = envelope.slug();
        if !self.registry.contains_slug(slug) {
            tracing::debug!(slug, "broadcast of unregistered type, not delivered locally");
            return 0;
        }

        let ctx = match origin {
            Some(connection) => MessageContext::remote(envelope.id(), connection),
            None => MessageContext::local(envelope.id()),
        };
        self.subscribers.deliver(slug, envelope.data(), ctx)
    }

    /// Run the local handler for a request that arrived on `connection`.
    ///
    /// Returns false if there is no handler for the slug. The reply (or an
    /// error reply) is written to `connection` only.
    pub(crate) fn dispatch_request(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        envelope: &Envelope,
    ) -> bool {
        let Some(entry) = self.handlers.get(envelope.slug()) else {
            return false;
        };
        let request_id = envelope.id();

        let permit = match self.handler_permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!(
                    slug = envelope.slug(),
                    request = %request_id,
                    "handler capacity reached, refusing request"
                );
                self.reply_error(
                    connection,
                    request_id,
                    ErrorCode::Overloaded,
                    "handler capacity reached",
                );
                return true;
            }
        };

        let core = self.clone();
        let connection = connection.clone();
        let slug = envelope.slug().to_string();
        let data = envelope.data().clone();
        let ctx = MessageContext::remote(request_id, connection.id());

        tokio::spawn(async move {
            let _permit = permit;
            let reply = match run_isolated(entry.clone(), data, ctx).await {
                Ok(data) => Envelope::reply(request_id, entry.response_slug(), data),
                Err(reason) => {
                    tracing::warn!(slug = %slug, request = %request_id, %reason, "handler failed");
                    match ErrorReply::new(ErrorCode::HandlerFailed, reason).into_envelope(request_id) {
                        Ok(env) => env,
                        Err(e) => {
                            tracing::error!(error = %e, "failed to encode error reply");
                            return;
                        }
                    }
                }
            };
            core.send_reply(&connection, reply).await;
        });
        true
    }

    async fn send_reply(&self, connection: &Arc<Connection>, reply: Envelope) {
        let request_id = reply.correlation_id();
        let sealed = match self.codec.seal(reply) {
            Ok(sealed) => sealed,
            Err(e) => {
                tracing::warn!(request = %request_id, error = %e, "reply could not be encoded");
                self.reply_error(connection, request_id, ErrorCode::HandlerFailed, e.to_string());
                return;
            }
        };

        if let Err(e) = connection.send(sealed.to_frame()).await {
            tracing::debug!(
                connection = %connection.id(),
                request = %request_id,
                error = %e,
                "reply not sent"
            );
        }
    }

    /// Answer `request_id` on `connection` with an error reply. Never waits.
    pub(crate) fn reply_error(
        &self,
        connection: &Arc<Connection>,
        request_id: Uuid,
        code: ErrorCode,
        message: impl Into<String>,
    ) {
        let sent = ErrorReply::new(code, message)
            .into_envelope(request_id)
            .and_then(|env| self.codec.seal(env))
            .and_then(|sealed| connection.enqueue(sealed.to_frame()));

        if let Err(e) = sent {
            tracing::debug!(
                connection = %connection.id(),
                request = %request_id,
                ?code,
                error = %e,
                "error reply not sent"
            );
        }
    }

    /// Turn a reply envelope into the caller's response type.
    pub(crate) fn decode_reply<Res: DeserializeOwned>(
        &self,
        reply: &Envelope,
        expected_slug: &str,
    ) -> Result<Res> {
        if reply.slug() == ERROR_SLUG {
            return Err(ErrorReply::decode(reply.data())?.into_error());
        }
        if reply.slug() != expected_slug {
            return Err(BusError::UnexpectedReply {
                expected: expected_slug.to_string(),
                actual: reply.slug().to_string(),
            });
        }
        self.codec.decode_data(reply)
    }
}

/// Run a handler on its own task so a panic becomes an error string.
async fn run_isolated(
    entry: Arc<HandlerEntry>,
    data: Bytes,
    ctx: MessageContext,
) -> std::result::Result<Bytes, String> {
    match tokio::spawn(async move { entry.call(data, ctx).await }).await {
        Ok(Ok(data)) => Ok(data),
        Ok(Err(e)) => Err(e.to_string()),
        Err(join) if join.is_panic() => Err("handler panicked".to_string()),
        Err(join) => Err(join.to_string()),
    }
}

/// Handle to a running bus endpoint. Cheap to clone.
///
/// [`BusServer`](crate::BusServer) and [`BusClient`](crate::BusClient)
/// dereference to this type, so the same calls work on both ends.
#[derive(Clone)]
pub struct Bus {
    pub(crate) core: Arc<BusCore>,
    pub(crate) link: Arc<dyn Link>,
}

impl Bus {
    /// Start configuring a bus endpoint.
    pub fn builder() -> BusBuilder {
        BusBuilder::new()
    }

    /// The registry this bus was built with.
    pub fn registry(&self) -> &TypeRegistry {
        &self.core.registry
    }

    /// Cancelled when the bus shuts down.
    pub fn lifetime(&self) -> &CancellationToken {
        &self.core.lifetime
    }

    /// Requests sent from this endpoint still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.core.correlator.len()
    }

    /// Publish `message` to every subscriber of its type, local and remote.
    ///
    /// Fire-and-forget: transport failures are logged, not returned. Only
    /// an unregistered type or an encoding failure is an error.
    pub fn publish<T: Message>(&self, message: &T) -> Result<()> {
        let slug = self.core.registry.slug_of::<T>()?;
        let sealed = self
            .core
            .codec
            .encode(PayloadKind::Broadcast, slug, message)?;

        self.core.deliver_local(sealed.envelope(), None);
        self.link.broadcast(&sealed);
        Ok(())
    }

    /// Call `on_message` for every `T` published anywhere on the bus until
    /// `lifetime` is cancelled or the returned guard is dropped.
    pub fn subscribe<T, F>(&self, lifetime: &CancellationToken, on_message: F) -> Result<Subscription>
    where
        T: Message,
        F: Fn(T) + Send + 'static,
    {
        self.subscribe_inner(lifetime, false, move |message, _ctx| on_message(message))
    }

    /// Like [`subscribe`](Self::subscribe), with the message context.
    pub fn subscribe_with_context<T, F>(
        &self,
        lifetime: &CancellationToken,
        on_message: F,
    ) -> Result<Subscription>
    where
        T: Message,
        F: Fn(T, MessageContext) + Send + 'static,
    {
        self.subscribe_inner(lifetime, false, on_message)
    }

    /// Like [`subscribe`](Self::subscribe), but first replays the last `T`
    /// this endpoint saw, if any.
    pub fn subscribe_with_last<T, F>(
        &self,
        lifetime: &CancellationToken,
        on_message: F,
    ) -> Result<Subscription>
    where
        T: Message,
        F: Fn(T) + Send + 'static,
    {
        self.subscribe_inner(lifetime, true, move |message, _ctx| on_message(message))
    }

    fn subscribe_inner<T, F>(
        &self,
        lifetime: &CancellationToken,
        replay_last: bool,
        on_message: F,
    ) -> Result<Subscription>
    where
        T: Message,
        F: Fn(T, MessageContext) + Send + 'static,
    {
        let slug = self.core.registry.slug_of::<T>()?.to_string();
        let format = self.core.codec.format();
        let token = lifetime.child_token();

        let log_slug = slug.clone();
        let callback: Callback = Box::new(move |data: Bytes, ctx: MessageContext| match format.decode::<T>(&data) {
            Ok(message) => on_message(message, ctx),
            Err(e) => tracing::warn!(slug = %log_slug, error = %e, "broadcast payload did not decode"),
        });

        self.core
            .subscribers
            .add(&slug, callback, token.clone(), replay_last);
        Ok(Subscription::new(slug, token))
    }

    /// Last `T` seen by this endpoint, published locally or received.
    pub fn last<T: Message>(&self) -> Result<Option<T>> {
        let slug = self.core.registry.slug_of::<T>()?;
        self.core
            .subscribers
            .last(slug)
            .map(|data| self.core.codec.format().decode(&data))
            .transpose()
    }

    /// Answer every `Req` request with `handler` until `lifetime` is
    /// cancelled or the returned guard is dropped.
    ///
    /// One handler per request type per endpoint; a second registration
    /// fails with [`BusError::DuplicateHandler`]. Handlers for different
    /// requests run concurrently.
    pub fn register_handler<Req, Res, F, Fut>(
        &self,
        lifetime: &CancellationToken,
        handler: F,
    ) -> Result<Subscription>
    where
        Req: Message,
        Res: Message,
        F: Fn(Req, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res>> + Send + 'static,
    {
        let request_slug = self.core.registry.slug_of::<Req>()?.to_string();
        let response_slug = self.core.registry.slug_of::<Res>()?;
        let typed = TypedHandler::new(self.core.codec.format(), handler);

        let registration = self
            .core
            .handlers
            .insert(&request_slug, response_slug, Arc::new(typed))?;
        tracing::debug!(slug = %request_slug, "handler registered");
        self.link.handlers_changed(&request_slug, true);

        let token = lifetime.child_token();
        let watch = token.clone();
        let bus_lifetime = self.core.lifetime.clone();
        let core = Arc::downgrade(&self.core);
        let link = Arc::downgrade(&self.link);
        let slug = request_slug.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = watch.cancelled() => {}
                _ = bus_lifetime.cancelled() => return,
            }
            if let (Some(core), Some(link)) = (core.upgrade(), link.upgrade()) {
                if core.handlers.remove(&slug, registration) {
                    tracing::debug!(slug = %slug, "handler removed");
                    link.handlers_changed(&slug, false);
                }
            }
        });

        Ok(Subscription::new(request_slug, token))
    }

    /// Send `request` and wait for the reply.
    ///
    /// Fails with [`BusError::Timeout`] once `timeout` has passed,
    /// [`BusError::ConnectionLost`] as soon as the carrying connection
    /// drops, [`BusError::Cancelled`] when `cancel` fires, or with the
    /// remote side's error reply.
    pub async fn try_request<Req, Res>(
        &self,
        request: &Req,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Res>
    where
        Req: Message,
        Res: Message,
    {
        let core = &self.core;
        let request_slug = core.registry.slug_of::<Req>()?;
        let response_slug = core.registry.slug_of::<Res>()?;
        let envelope = Envelope::request(request_slug, core.codec.format().encode(request)?);

        if let Some(entry) = core.handlers.get(request_slug) {
            return self
                .request_local(entry, envelope, response_slug, timeout, cancel)
                .await;
        }

        let connection = self.link.route_request(request_slug)?;
        let sealed = core.codec.seal(envelope)?;
        let id = sealed.envelope().id();
        let pending = core
            .correlator
            .register(id, Instant::now() + timeout, Some(connection.id()));

        if let Err(e) = connection.send(sealed.to_frame()).await {
            core.correlator.fail(id, FailureReason::ConnectionLost);
            return Err(e);
        }

        let outcome = tokio::select! {
            outcome = pending => outcome,
            _ = cancel.cancelled() => {
                core.correlator.fail(id, FailureReason::Cancelled);
                return Err(BusError::Cancelled);
            }
        };

        match outcome {
            Outcome::Reply(reply) => core.decode_reply(&reply, response_slug),
            Outcome::Failed(reason) => Err(reason.into()),
        }
    }

    async fn request_local<Res: Message>(
        &self,
        entry: Arc<HandlerEntry>,
        envelope: Envelope,
        response_slug: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Res> {
        if entry.response_slug() != response_slug {
            return Err(BusError::UnexpectedReply {
                expected: response_slug.to_string(),
                actual: entry.response_slug().to_string(),
            });
        }

        let permit = self
            .core
            .handler_permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| BusError::Remote("handler capacity reached".to_string()))?;

        let ctx = MessageContext::local(envelope.id());
        let data = envelope.data().clone();
        let mut task = tokio::spawn(async move {
            let _permit = permit;
            run_isolated(entry, data, ctx).await
        });

        let outcome = tokio::select! {
            joined = tokio::time::timeout(timeout, &mut task) => joined,
            _ = cancel.cancelled() => {
                task.abort();
                return Err(BusError::Cancelled);
            }
        };

        match outcome {
            Err(_) => {
                task.abort();
                Err(BusError::Timeout)
            }
            Ok(Err(join)) => Err(BusError::Remote(join.to_string())),
            Ok(Ok(Err(reason))) => Err(BusError::Remote(reason)),
            Ok(Ok(Ok(data))) => self.core.codec.format().decode(&data),
        }
    }

    /// Send `request` and wait for the reply, collapsing every failure to
    /// `None`. Failures are logged.
    pub async fn request<Req, Res>(
        &self,
        request: &Req,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<Res>
    where
        Req: Message,
        Res: Message,
    {
        match self.try_request(request, timeout, cancel).await {
            Ok(reply) => Some(reply),
            Err(e) if e.is_recoverable() => {
                tracing::debug!(error = %e, "request produced no result");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "request failed");
                None
            }
        }
    }
}

//! Per-message context passed to handlers and subscribers.

use uuid::Uuid;

use crate::connection::ConnectionId;

/// Where a message came from.
///
/// # Example
///
/// ```ignore
/// bus.register_handler(&lifetime, |req: Ping, ctx: MessageContext| async move {
///     tracing::debug!(id = %ctx.id(), remote = ctx.is_remote(), "ping");
///     Ok(Pong(req.0))
/// })?;
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageContext {
    id: Uuid,
    origin: Option<ConnectionId>,
}

impl MessageContext {
    /// Context for a message that arrived over `origin`.
    pub fn remote(id: Uuid, origin: ConnectionId) -> Self {
        Self {
            id,
            origin: Some(origin),
        }
    }

    /// Context for a message produced in this process.
    pub fn local(id: Uuid) -> Self {
        Self { id, origin: None }
    }

    /// Envelope id (the request id for handlers).
    #[inline]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Connection the message arrived on, `None` if published locally.
    #[inline]
    pub fn origin(&self) -> Option<ConnectionId> {
        self.origin
    }

    /// Whether the message came over a connection.
    #[inline]
    pub fn is_remote(&self) -> bool {
        self.origin.is_some()
    }
}

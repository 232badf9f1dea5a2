//! Handler module - request handlers and broadcast subscribers.
//!
//! Provides:
//! - [`HandlerTable`] - one request handler per slug
//! - [`SubscriberTable`] - any number of broadcast subscribers per slug
//! - [`MessageContext`] - where a message came from
//! - [`Subscription`] - guard that keeps either kind of registration alive
//!
//! Both tables work on encoded payloads; the typed wrappers live on
//! [`Bus`](crate::Bus).

mod context;
mod registry;
mod subscribers;

pub use context::MessageContext;
pub use registry::{BoxFuture, Handler, HandlerEntry, HandlerTable, TypedHandler};
pub use subscribers::{
    Callback, SubscriberTable, Subscription, DEFAULT_SUBSCRIBER_QUEUE_CAPACITY,
};

//! Request handler table.
//!
//! At most one handler per request slug per bus endpoint. Handlers are
//! type-erased behind [`Handler`]: the payload is decoded before the
//! user function runs and the result is encoded after it returns.
//!
//! # Example
//!
//! ```ignore
//! let table = HandlerTable::new();
//! let handler = TypedHandler::new(PayloadFormat::MsgPack, |n: u32, _ctx: MessageContext| async move { Ok(n + 1) });
//! let token = table.insert("demo.inc", "demo.inc_reply", Arc::new(handler))?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::MessageContext;
use crate::codec::PayloadFormat;
use crate::error::{BusError, Result};

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased request handler working on encoded payloads.
pub trait Handler: Send + Sync + 'static {
    /// Handle a request payload and produce the encoded reply payload.
    fn call(&self, data: Bytes, ctx: MessageContext) -> BoxFuture<'static, Result<Bytes>>;
}

/// Wrapper that decodes the request and encodes the reply around `F`.
pub struct TypedHandler<F, Req, Res, Fut>
where
    F: Fn(Req, MessageContext) -> Fut + Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
    Fut: Future<Output = Result<Res>> + Send + 'static,
{
    handler: F,
    format: PayloadFormat,
    _phantom: PhantomData<fn(Req) -> (Res, Fut)>,
}

impl<F, Req, Res, Fut> TypedHandler<F, Req, Res, Fut>
where
    F: Fn(Req, MessageContext) -> Fut + Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
    Fut: Future<Output = Result<Res>> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(format: PayloadFormat, handler: F) -> Self {
        Self {
            handler,
            format,
            _phantom: PhantomData,
        }
    }
}

impl<F, Req, Res, Fut> Handler for TypedHandler<F, Req, Res, Fut>
where
    F: Fn(Req, MessageContext) -> Fut + Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
    Fut: Future<Output = Result<Res>> + Send + 'static,
{
    fn call(&self, data: Bytes, ctx: MessageContext) -> BoxFuture<'static, Result<Bytes>> {
        let request: Req = match self.format.decode(&data) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let fut = (self.handler)(request, ctx);
        let format = self.format;
        Box::pin(async move {
            let response = fut.await?;
            format.encode(&response)
        })
    }
}

/// A registered handler.
pub struct HandlerEntry {
    token: u64,
    response_slug: String,
    handler: Arc<dyn Handler>,
}

impl HandlerEntry {
    /// Registration token, unique per table.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Slug of the reply payload.
    pub fn response_slug(&self) -> &str {
        &self.response_slug
    }

    /// Invoke the handler.
    pub fn call(&self, data: Bytes, ctx: MessageContext) -> BoxFuture<'static, Result<Bytes>> {
        self.handler.call(data, ctx)
    }
}

/// Request slug to handler map.
#[derive(Default)]
pub struct HandlerTable {
    entries: RwLock<HashMap<String, Arc<HandlerEntry>>>,
    next_token: AtomicU64,
}

impl HandlerTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `request_slug`.
    ///
    /// Returns a token for [`remove`](Self::remove), or
    /// [`BusError::DuplicateHandler`] if the slug is taken.
    pub fn insert(
        &self,
        request_slug: &str,
        response_slug: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<u64> {
        let mut entries = self.entries.write();
        if entries.contains_key(request_slug) {
            return Err(BusError::DuplicateHandler(request_slug.to_string()));
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            request_slug.to_string(),
            Arc::new(HandlerEntry {
                token,
                response_slug: response_slug.to_string(),
                handler,
            }),
        );
        Ok(token)
    }

    /// Handler for `request_slug`.
    pub fn get(&self, request_slug: &str) -> Option<Arc<HandlerEntry>> {
        self.entries.read().get(request_slug).cloned()
    }

    /// Remove the handler if it is still the registration identified by `token`.
    pub fn remove(&self, request_slug: &str, token: u64) -> bool {
        let mut entries = self.entries.write();
        match entries.get(request_slug) {
            Some(entry) if entry.token == token => {
                entries.remove(request_slug);
                true
            }
            _ => false,
        }
    }

    /// Slugs with a handler.
    pub fn slugs(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

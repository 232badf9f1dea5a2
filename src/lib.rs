//! # wirebus
//!
//! Typed publish/subscribe and request/response messaging between
//! processes over a local named pipe or TCP.
//!
//! One process serves, any number connect. Every endpoint gets the same
//! [`Bus`] API:
//!
//! - [`Bus::publish`] - fire-and-forget to every subscriber of the type
//! - [`Bus::subscribe`] - receive broadcasts until a lifetime token fires
//! - [`Bus::register_handler`] - answer one request type
//! - [`Bus::request`] / [`Bus::try_request`] - ask and await one reply
//!
//! ## Architecture
//!
//! - **Frames**: `[u32 LE length][body]`, body a MsgPack envelope
//!   `{id, typeSlug, payloadKind, correlationId, data}`, optionally sealed
//!   with AES-256-GCM
//! - **Connections**: one read task and one writer task each, bounded
//!   outbound queue; a peer that stops reading is disconnected
//! - **Dispatch**: off the read loop; subscribers drain their own queues,
//!   handlers run as bounded concurrent tasks
//! - **Routing**: clients announce their handlers, the server forwards
//!   requests it cannot answer itself and relays broadcasts between clients
//!
//! ## Example
//!
//! ```ignore
//! use serde::{Deserialize, Serialize};
//! use tokio_util::sync::CancellationToken;
//! use wirebus::{Bus, Endpoint};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Add(u32);
//! #[derive(Serialize, Deserialize)]
//! struct Sum(u32);
//!
//! #[tokio::main]
//! async fn main() -> wirebus::Result<()> {
//!     let lifetime = CancellationToken::new();
//!     let endpoint = Endpoint::pipe("demo");
//!
//!     let server = Bus::builder()
//!         .message::<Add>()
//!         .message::<Sum>()
//!         .serve(&endpoint, &lifetime)
//!         .await?;
//!     let _handler = server.register_handler(&lifetime, |add: Add, _ctx| async move {
//!         Ok(Sum(add.0 + 1))
//!     })?;
//!
//!     let client = Bus::builder()
//!         .message::<Add>()
//!         .message::<Sum>()
//!         .connect(&endpoint, &lifetime)
//!         .await?;
//!     let sum: Option<Sum> = client
//!         .request(&Add(41), std::time::Duration::from_secs(1), &lifetime)
//!         .await;
//!     assert_eq!(sum.map(|s| s.0), Some(42));
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod control;
pub mod correlator;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod writer;

mod builder;
mod bus;
mod client;
mod server;

pub use builder::BusBuilder;
pub use bus::Bus;
pub use client::BusClient;
pub use codec::PayloadFormat;
pub use config::{BusConfig, RetryPolicy};
pub use error::{BusError, Result};
pub use handler::{MessageContext, Subscription};
pub use registry::{Message, TypeRegistry};
pub use server::BusServer;
pub use transport::Endpoint;

//! Control plane - bus-internal envelopes.
//!
//! Reserved slugs start with `$` and are never registered by applications:
//!
//! - `$announce` / `$withdraw` (payload kind `control`): a client tells the
//!   server which request slugs it can answer
//! - `$error` (payload kind `reply`): a request could not be answered
//!
//! Control payloads are always MsgPack, whatever payload format the bus
//! uses for application messages.

mod announce;
mod error_reply;

pub use announce::{HandlerAnnouncement, ANNOUNCE_SLUG, WITHDRAW_SLUG};
pub use error_reply::{ErrorCode, ErrorReply, ERROR_SLUG};

//! Handler announcements.
//!
//! A client tells the server which request slugs it can answer so the
//! server can forward requests it has no local handler for. The full set is
//! announced after every (re)connect; later changes travel one slug at a
//! time.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::{Envelope, MsgPackCodec};
use crate::error::Result;

/// Control slug carrying slugs a peer now handles.
pub const ANNOUNCE_SLUG: &str = "$announce";

/// Control slug carrying slugs a peer no longer handles.
pub const WITHDRAW_SLUG: &str = "$withdraw";

/// Body of `$announce` and `$withdraw`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerAnnouncement {
    /// Request slugs affected.
    pub slugs: Vec<String>,
}

impl HandlerAnnouncement {
    /// Announcement for a set of slugs.
    pub fn new<I, S>(slugs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            slugs: slugs.into_iter().map(Into::into).collect(),
        }
    }

    /// Encode as a control payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        MsgPackCodec::encode(self)
    }

    /// Control envelope under `slug` ([`ANNOUNCE_SLUG`] or [`WITHDRAW_SLUG`]).
    pub fn into_envelope(self, slug: &str) -> Result<Envelope> {
        Ok(Envelope::control(slug, Bytes::from(self.encode()?)))
    }

    /// Decode a control payload.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        MsgPackCodec::decode(bytes)
    }
}

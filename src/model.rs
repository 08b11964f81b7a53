//! Domain types shared by the store, codec, and protocol components.

use crate::error::Error;

/// Maximum length in bytes of a fixed-width name field on the wire.
pub const MAX_NAME_LEN: usize = 64;
/// Maximum length in bytes of a fixed-width dotted-quad address field.
pub const MAX_ADDR_LEN: usize = 16;

/// Lifecycle state of a [`Connection`].
///
/// The discriminants are the values stored in the `status` column and the
/// values accepted by `decide_on_connection`; they are not renumbered for
/// Rust's convenience because the wire and the store both depend on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum ConnStatus {
    /// The peer reviewed this connection request and rejected it.
    Rejected = -1,
    /// The connection has been accepted by both sides and carries messages.
    Accepted = 0,
    /// The peer has not yet received this connection request.
    Pending = 1,
    /// This connection has been requested of us; we can accept or reject it.
    SelfReview = 2,
    /// The peer has received our request but not yet resolved it.
    PeerReview = 3,
}

impl ConnStatus {
    /// Decode a raw `status` column value.
    pub fn from_i64(v: i64) -> Result<Self, Error> {
        match v {
            -1 => Ok(Self::Rejected),
            0 => Ok(Self::Accepted),
            1 => Ok(Self::Pending),
            2 => Ok(Self::SelfReview),
            3 => Ok(Self::PeerReview),
            other => Err(Error::Protocol(format!("invalid connection status: {other}"))),
        }
    }

    /// Whether `peer_name` and `self_id` are meaningful in this state.
    pub fn exposes_peer_name(self) -> bool {
        matches!(self, Self::Accepted | Self::SelfReview)
    }
}

/// A persisted, bidirectional logical channel between two instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Locally assigned primary key.
    pub conn_id: i64,
    /// Identifier we generated, which the peer uses to address us.
    pub peer_id: i64,
    /// Identifier the peer generated, which we use to address it.
    pub self_id: i64,
    /// Human-readable name of the peer (meaningful only past `SelfReview`).
    pub peer_name: Option<String>,
    /// Dotted-quad IPv4 address of the peer.
    pub peer_addr: String,
    /// Port the peer listens on, in host order.
    pub peer_port: u16,
    /// Whether the peer is believed reachable. The core never sets this
    /// itself; it is exposed for the front-end to annotate.
    pub online: bool,
    /// Unix timestamp of the initiating request.
    pub requested_at: i64,
    /// Unix timestamp of the last status change, if any.
    pub updated_at: Option<i64>,
    /// Current lifecycle state.
    pub status: ConnStatus,
}

/// Enumeration of application content formats. Only `Text` is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
    /// Opaque UTF-8 (or otherwise caller-defined) text.
    Text = 0,
}

impl ContentType {
    /// Decode a raw `content_type` byte.
    pub fn from_u8(v: u8) -> Result<Self, Error> {
        match v {
            0 => Ok(Self::Text),
            other => Err(Error::Protocol(format!("invalid content type: {other}"))),
        }
    }
}

/// A single application message exchanged over a [`Connection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Locally assigned primary key.
    pub msg_id: i64,
    /// Connection this message belongs to.
    pub conn_id: i64,
    /// Per-connection monotonic sequence number, assigned by the sender.
    pub shared_msg_id: i64,
    /// Unix timestamp at which the sender recorded the send.
    pub time_sent: i64,
    /// Unix timestamp at which delivery was confirmed, if any.
    pub time_received: Option<i64>,
    /// Content format tag.
    pub content_type: ContentType,
    /// Opaque payload.
    pub content: Vec<u8>,
}

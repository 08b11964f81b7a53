//! Wire codec for the fixed-layout binary frames ("parcels") exchanged
//! between instances.
//!
//! All integers are big-endian. Name/address fields are fixed-width,
//! zero-padded UTF-8; decoding stops at the first embedded NUL (or at the
//! field width if there isn't one). `self_port` occupies a 4-byte field on
//! the wire but only its low 16 bits are meaningful.

use crate::error::Error;
use crate::model::{ContentType, MAX_ADDR_LEN, MAX_NAME_LEN};

/// `kind` byte of a CONN_REQ parcel.
pub const CONN_REQ_KIND: u8 = 1;
/// Total length in bytes of a CONN_REQ parcel.
pub const CONN_REQ_LEN: usize = 93;

/// `kind` byte of a CONN_ACK parcel.
pub const CONN_ACK_KIND: u8 = 2;
/// Total length in bytes of a CONN_ACK parcel.
pub const CONN_ACK_LEN: usize = 9;

/// `kind` byte of a CONN_REJ parcel.
pub const CONN_REJ_KIND: u8 = 3;
/// Total length in bytes of a CONN_REJ parcel.
pub const CONN_REJ_LEN: usize = 9;

/// `kind` byte of a CONN_ACC parcel.
pub const CONN_ACC_KIND: u8 = 4;
/// Total length in bytes of a CONN_ACC parcel.
pub const CONN_ACC_LEN: usize = 81;

/// `kind` byte of a MSG_SEND parcel.
pub const MSG_SEND_KIND: u8 = 10;
/// Length in bytes of a MSG_SEND parcel's fixed header, before `content`.
pub const MSG_SEND_HEADER_LEN: usize = 30;

/// `kind` byte of a MSG_RCV parcel.
pub const MSG_RCV_KIND: u8 = 11;
/// Total length in bytes of a MSG_RCV parcel.
pub const MSG_RCV_LEN: usize = 25;

/// A single decoded (or about-to-be-encoded) wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parcel {
    /// Request a new connection.
    ConnReq {
        /// Identifier the requester generated for the peer to address it by.
        peer_id: i64,
        /// Requester's human-readable name.
        self_name: String,
        /// Requester's listening IPv4 address.
        self_addr: String,
        /// Requester's listening port.
        self_port: u16,
    },
    /// Acknowledge a connection request.
    ConnAck {
        /// The `peer_id` the acknowledging side was addressed by.
        self_id: i64,
    },
    /// Reject a connection request (or a previously self-reviewed one).
    ConnRej {
        /// The `peer_id` the rejecting side was addressed by.
        self_id: i64,
    },
    /// Accept a connection request.
    ConnAcc {
        /// The `peer_id` the accepting side was addressed by.
        self_id: i64,
        /// A freshly generated identifier for the peer to address us by.
        peer_id: i64,
        /// Accepting side's human-readable name.
        self_name: String,
    },
    /// Deliver an application message.
    MsgSend {
        /// The `peer_id` the sender was addressed by.
        self_id: i64,
        /// Per-connection monotonic sequence number.
        shared_msg_id: i64,
        /// Unix timestamp the sender recorded the send at.
        time_sent: i64,
        /// Content format tag.
        content_type: ContentType,
        /// Opaque payload.
        content: Vec<u8>,
    },
    /// Acknowledge delivery of an application message.
    MsgRcv {
        /// The `peer_id` the acknowledging side was addressed by.
        self_id: i64,
        /// Sequence number of the message being acknowledged.
        shared_msg_id: i64,
        /// Unix timestamp delivery was confirmed at.
        time_received: i64,
    },
}

impl Parcel {
    /// The `kind` byte this parcel encodes to.
    pub fn kind(&self) -> u8 {
        match self {
            Self::ConnReq { .. } => CONN_REQ_KIND,
            Self::ConnAck { .. } => CONN_ACK_KIND,
            Self::ConnRej { .. } => CONN_REJ_KIND,
            Self::ConnAcc { .. } => CONN_ACC_KIND,
            Self::MsgSend { .. } => MSG_SEND_KIND,
            Self::MsgRcv { .. } => MSG_RCV_KIND,
        }
    }

    /// Encode this parcel into its wire representation.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(self.kind());

        match self {
            Self::ConnReq {
                peer_id,
                self_name,
                self_addr,
                self_port,
            } => {
                write_i64(&mut buf, *peer_id);
                write_fixed_str(&mut buf, self_name, MAX_NAME_LEN);
                write_fixed_str(&mut buf, self_addr, MAX_ADDR_LEN);
                write_port(&mut buf, *self_port);
            }
            Self::ConnAck { self_id } | Self::ConnRej { self_id } => {
                write_i64(&mut buf, *self_id);
            }
            Self::ConnAcc {
                self_id,
                peer_id,
                self_name,
            } => {
                write_i64(&mut buf, *self_id);
                write_i64(&mut buf, *peer_id);
                write_fixed_str(&mut buf, self_name, MAX_NAME_LEN);
            }
            Self::MsgSend {
                self_id,
                shared_msg_id,
                time_sent,
                content_type,
                content,
            } => {
                write_i64(&mut buf, *self_id);
                write_i64(&mut buf, *shared_msg_id);
                write_i64(&mut buf, *time_sent);
                buf.push(*content_type as u8);
                buf.extend_from_slice(&(content.len() as u32).to_be_bytes());
                buf.extend_from_slice(content);
            }
            Self::MsgRcv {
                self_id,
                shared_msg_id,
                time_received,
            } => {
                write_i64(&mut buf, *self_id);
                write_i64(&mut buf, *shared_msg_id);
                write_i64(&mut buf, *time_received);
            }
        }
        buf
    }

    /// Decode a complete parcel from `buf`, which must include the leading
    /// `kind` byte and, for MSG_SEND, the full `content` payload.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let kind = *buf
            .first()
            .ok_or_else(|| Error::Protocol("empty parcel".into()))?;

        match kind {
            CONN_REQ_KIND => {
                expect_len(buf, CONN_REQ_LEN)?;
                let peer_id = read_i64(&buf[1..9]);
                let self_name = read_fixed_str(&buf[9..73]);
                let self_addr = read_fixed_str(&buf[73..89]);
                let self_port = read_port(&buf[89..93]);
                Ok(Self::ConnReq {
                    peer_id,
                    self_name,
                    self_addr,
                    self_port,
                })
            }
            CONN_ACK_KIND => {
                expect_len(buf, CONN_ACK_LEN)?;
                Ok(Self::ConnAck {
                    self_id: read_i64(&buf[1..9]),
                })
            }
            CONN_REJ_KIND => {
                expect_len(buf, CONN_REJ_LEN)?;
                Ok(Self::ConnRej {
                    self_id: read_i64(&buf[1..9]),
                })
            }
            CONN_ACC_KIND => {
                expect_len(buf, CONN_ACC_LEN)?;
                let self_id = read_i64(&buf[1..9]);
                let peer_id = read_i64(&buf[9..17]);
                let self_name = read_fixed_str(&buf[17..81]);
                Ok(Self::ConnAcc {
                    self_id,
                    peer_id,
                    self_name,
                })
            }
            MSG_SEND_KIND => {
                if buf.len() < MSG_SEND_HEADER_LEN {
                    return Err(Error::Protocol(format!(
                        "short MSG_SEND parcel: {} bytes, need at least {}",
                        buf.len(),
                        MSG_SEND_HEADER_LEN
                    )));
                }
                let self_id = read_i64(&buf[1..9]);
                let shared_msg_id = read_i64(&buf[9..17]);
                let time_sent = read_i64(&buf[17..25]);
                let content_type = ContentType::from_u8(buf[25])?;
                let content_len = u32::from_be_bytes(buf[26..30].try_into().unwrap()) as usize;
                expect_len(buf, MSG_SEND_HEADER_LEN + content_len)?;
                let content = buf[MSG_SEND_HEADER_LEN..].to_vec();
                Ok(Self::MsgSend {
                    self_id,
                    shared_msg_id,
                    time_sent,
                    content_type,
                    content,
                })
            }
            MSG_RCV_KIND => {
                expect_len(buf, MSG_RCV_LEN)?;
                let self_id = read_i64(&buf[1..9]);
                let shared_msg_id = read_i64(&buf[9..17]);
                let time_received = read_i64(&buf[17..25]);
                Ok(Self::MsgRcv {
                    self_id,
                    shared_msg_id,
                    time_received,
                })
            }
            other => Err(Error::Protocol(format!("unknown parcel kind: {other}"))),
        }
    }
}

/// Length in bytes of everything but `content` for a MSG_SEND parcel whose
/// `kind` has already been peeked, given the four-byte `content_len` field
/// starting at offset 26. Returns `None` for fixed-size kinds.
pub fn expected_len(kind: u8, peeked_header: &[u8]) -> Result<usize, Error> {
    match kind {
        CONN_REQ_KIND => Ok(CONN_REQ_LEN),
        CONN_ACK_KIND => Ok(CONN_ACK_LEN),
        CONN_REJ_KIND => Ok(CONN_REJ_LEN),
        CONN_ACC_KIND => Ok(CONN_ACC_LEN),
        MSG_RCV_KIND => Ok(MSG_RCV_LEN),
        MSG_SEND_KIND => {
            if peeked_header.len() < MSG_SEND_HEADER_LEN {
                return Err(Error::Protocol("short MSG_SEND header".into()));
            }
            let content_len = u32::from_be_bytes(
                peeked_header[26..30].try_into().unwrap(),
            ) as usize;
            Ok(MSG_SEND_HEADER_LEN + content_len)
        }
        other => Err(Error::Protocol(format!("unknown parcel kind: {other}"))),
    }
}

fn expect_len(buf: &[u8], want: usize) -> Result<(), Error> {
    if buf.len() != want {
        return Err(Error::Protocol(format!(
            "malformed parcel: expected {} bytes, got {}",
            want,
            buf.len()
        )));
    }
    Ok(())
}

fn write_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn read_i64(bytes: &[u8]) -> i64 {
    i64::from_be_bytes(bytes.try_into().unwrap())
}

fn write_port(buf: &mut Vec<u8>, port: u16) {
    buf.extend_from_slice(&(port as u32).to_be_bytes());
}

fn read_port(bytes: &[u8]) -> u16 {
    (u32::from_be_bytes(bytes.try_into().unwrap()) & 0xffff) as u16
}

fn write_fixed_str(buf: &mut Vec<u8>, s: &str, width: usize) {
    let bytes = s.as_bytes();
    let take = bytes.len().min(width);
    buf.extend_from_slice(&bytes[..take]);
    buf.resize(buf.len() + (width - take), 0);
}

fn read_fixed_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_req_round_trips() {
        let p = Parcel::ConnReq {
            peer_id: 123456789,
            self_name: "alice".into(),
            self_addr: "127.0.0.1".into(),
            self_port: 7676,
        };
        let buf = p.encode();
        assert_eq!(buf.len(), CONN_REQ_LEN);
        assert_eq!(Parcel::decode(&buf).unwrap(), p);
    }

    #[test]
    fn conn_ack_round_trips() {
        let p = Parcel::ConnAck { self_id: -42 };
        let buf = p.encode();
        assert_eq!(buf.len(), CONN_ACK_LEN);
        assert_eq!(Parcel::decode(&buf).unwrap(), p);
    }

    #[test]
    fn conn_rej_round_trips() {
        let p = Parcel::ConnRej { self_id: 7 };
        let buf = p.encode();
        assert_eq!(buf.len(), CONN_REJ_LEN);
        assert_eq!(Parcel::decode(&buf).unwrap(), p);
    }

    #[test]
    fn conn_acc_round_trips() {
        let p = Parcel::ConnAcc {
            self_id: 1,
            peer_id: 2,
            self_name: "bob".into(),
        };
        let buf = p.encode();
        assert_eq!(buf.len(), CONN_ACC_LEN);
        assert_eq!(Parcel::decode(&buf).unwrap(), p);
    }

    #[test]
    fn msg_send_round_trips_with_content() {
        let p = Parcel::MsgSend {
            self_id: 1,
            shared_msg_id: 1,
            time_sent: 1_700_000_000,
            content_type: ContentType::Text,
            content: b"hi".to_vec(),
        };
        let buf = p.encode();
        assert_eq!(buf.len(), MSG_SEND_HEADER_LEN + 2);
        assert_eq!(Parcel::decode(&buf).unwrap(), p);
    }

    #[test]
    fn msg_send_empty_content_round_trips() {
        let p = Parcel::MsgSend {
            self_id: 1,
            shared_msg_id: 1,
            time_sent: 0,
            content_type: ContentType::Text,
            content: vec![],
        };
        let buf = p.encode();
        assert_eq!(buf.len(), MSG_SEND_HEADER_LEN);
        assert_eq!(Parcel::decode(&buf).unwrap(), p);
    }

    #[test]
    fn msg_rcv_round_trips() {
        let p = Parcel::MsgRcv {
            self_id: 1,
            shared_msg_id: 1,
            time_received: 1_700_000_001,
        };
        let buf = p.encode();
        assert_eq!(buf.len(), MSG_RCV_LEN);
        assert_eq!(Parcel::decode(&buf).unwrap(), p);
    }

    #[test]
    fn name_exactly_64_bytes_has_no_trailing_nul_and_decodes_whole() {
        let name: String = "a".repeat(MAX_NAME_LEN);
        let p = Parcel::ConnAcc {
            self_id: 1,
            peer_id: 2,
            self_name: name.clone(),
        };
        let buf = p.encode();
        match Parcel::decode(&buf).unwrap() {
            Parcel::ConnAcc { self_name, .. } => assert_eq!(self_name, name),
            other => panic!("unexpected parcel: {other:?}"),
        }
    }

    #[test]
    fn name_longer_than_field_is_truncated_on_encode() {
        let name: String = "b".repeat(MAX_NAME_LEN + 10);
        let p = Parcel::ConnAcc {
            self_id: 1,
            peer_id: 2,
            self_name: name.clone(),
        };
        let buf = p.encode();
        assert_eq!(buf.len(), CONN_ACC_LEN);
        match Parcel::decode(&buf).unwrap() {
            Parcel::ConnAcc { self_name, .. } => {
                assert_eq!(self_name, "b".repeat(MAX_NAME_LEN))
            }
            other => panic!("unexpected parcel: {other:?}"),
        }
    }

    #[test]
    fn port_round_trips_across_full_range() {
        for port in [1u16, 80, 7676, 32768, 65535] {
            let p = Parcel::ConnReq {
                peer_id: 1,
                self_name: "x".into(),
                self_addr: "10.0.0.1".into(),
                self_port: port,
            };
            let buf = p.encode();
            match Parcel::decode(&buf).unwrap() {
                Parcel::ConnReq { self_port, .. } => assert_eq!(self_port, port),
                other => panic!("unexpected parcel: {other:?}"),
            }
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let buf = vec![99u8; 9];
        assert!(Parcel::decode(&buf).is_err());
    }

    #[test]
    fn short_frame_is_rejected() {
        let buf = vec![CONN_ACK_KIND, 0, 0, 0];
        assert!(Parcel::decode(&buf).is_err());
    }
}

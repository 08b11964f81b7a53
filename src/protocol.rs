//! The connection-and-message state machine: the seven transitions of
//! §4.1, plus the three message-protocol transitions, all gathered behind
//! one [`Dispatcher`] that mediates between the Store and the Transport.
//!
//! A `Dispatcher` is cheap to construct and borrows everything it needs;
//! the front-end builds one per invocation (opening the Store fresh each
//! time), and the Listener builds one per accepted socket, reusing the same
//! open Store across the whole loop.

use log::{info, warn};

use crate::clock::Clock;
use crate::codec::Parcel;
use crate::error::Error;
use crate::model::{ConnStatus, ContentType};
use crate::rand::IdSource;
use crate::store::Store;
use crate::transport;

/// Mediates user actions and inbound parcels against a [`Store`].
pub struct Dispatcher<'a> {
    store: &'a Store,
    ids: &'a dyn IdSource,
    clock: &'a dyn Clock,
}

impl<'a> Dispatcher<'a> {
    /// Build a dispatcher over a borrowed store, id source, and clock.
    pub fn new(store: &'a Store, ids: &'a dyn IdSource, clock: &'a dyn Clock) -> Self {
        Self { store, ids, clock }
    }

    // ---- read-only operations -----------------------------------------

    /// `list_connections` (§6).
    pub fn list_connections(&self) -> Result<Vec<crate::model::Connection>, Error> {
        self.store.list_connections()
    }

    /// `list_messages` (§6).
    pub fn list_messages(&self) -> Result<Vec<crate::model::Message>, Error> {
        self.store.list_messages()
    }

    /// `state_get` (§6).
    pub fn state_get(&self, key: &str) -> Result<Option<String>, Error> {
        self.store.state_get(key)
    }

    /// `state_set` (§6).
    pub fn state_set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.store.state_set(key, value)
    }

    /// Set `selected_conn` (§4.1 "Selected connection").
    pub fn select_connection(&self, conn_id: i64) -> Result<(), Error> {
        self.store.state_set("selected_conn", &conn_id.to_string())
    }

    // ---- user-initiated actions ----------------------------------------

    /// T1: `request_connection(peer_addr, peer_port)`.
    pub fn request_connection(&self, peer_addr: &str, peer_port: u16) -> Result<(), Error> {
        let peer_id = self.ids.generate_id();
        let now = self.clock.now();
        self.store.insert_pending(peer_id, peer_addr, peer_port, now)?;

        let self_name = self.require_state("self_name")?;
        let self_addr = self.require_state("self_addr")?;
        let self_port = self.self_port()?;

        let req = Parcel::ConnReq {
            peer_id,
            self_name,
            self_addr,
            self_port,
        };
        match transport::send_parcel(peer_addr, peer_port, &req) {
            Ok(()) => info!(
                "sent connection request to peer at {peer_addr}:{peer_port}; awaiting acknowledgement"
            ),
            Err(e) => info!(
                "could not send connection request to peer at {peer_addr}:{peer_port} ({e}); connection is pending"
            ),
        }
        Ok(())
    }

    /// T4/T5: `decide_on_connection(conn_id, decision)`.
    ///
    /// `accept = true` is T5, `accept = false` is T4. Requires the row to
    /// be in SELF_REVIEW; any other status is a protocol error and leaves
    /// the row untouched.
    pub fn decide_on_connection(&self, conn_id: i64, accept: bool) -> Result<(), Error> {
        let conn = self
            .store
            .get_connection(conn_id)?
            .ok_or_else(|| Error::Protocol(format!("no such connection: {conn_id}")))?;

        if conn.status != ConnStatus::SelfReview {
            return Err(Error::Protocol(format!(
                "connection {conn_id} is not awaiting review (status: {:?})",
                conn.status
            )));
        }

        let now = self.clock.now();
        if accept {
            let new_peer_id = self.ids.generate_id();
            self.store
                .mark_accepted_as_acceptor(conn_id, new_peer_id, now)?;

            let self_name = self.require_state("self_name")?;
            let acc = Parcel::ConnAcc {
                self_id: conn.self_id,
                peer_id: new_peer_id,
                self_name,
            };
            match transport::send_parcel(&conn.peer_addr, conn.peer_port, &acc) {
                Ok(()) => info!("accepted connection request from peer at {}", conn.peer_addr),
                Err(e) => warn!(
                    "marked connection {conn_id} accepted but could not notify peer at {}: {e}",
                    conn.peer_addr
                ),
            }
        } else {
            self.store.mark_rejected(conn_id, now)?;

            let rej = Parcel::ConnRej {
                self_id: conn.self_id,
            };
            match transport::send_parcel(&conn.peer_addr, conn.peer_port, &rej) {
                Ok(()) => info!("rejected connection request from peer at {}", conn.peer_addr),
                Err(e) => warn!(
                    "marked connection {conn_id} rejected but could not notify peer at {}: {e}",
                    conn.peer_addr
                ),
            }
        }
        Ok(())
    }

    /// `send_message(content_type, content)` on the selected connection.
    pub fn send_message(&self, content_type: ContentType, content: &[u8]) -> Result<(), Error> {
        let selected = self.selected_conn_id()?;
        let conn = self.store.get_connection(selected)?.ok_or_else(|| {
            Error::Config(format!("selected connection {selected} does not exist"))
        })?;

        if conn.status != ConnStatus::Accepted {
            return Err(Error::Protocol(format!(
                "connection {selected} is not accepted (status: {:?})",
                conn.status
            )));
        }

        let now = self.clock.now();
        let msg = self
            .store
            .insert_sent_message(conn.conn_id, now, content_type, content)?;

        let send = Parcel::MsgSend {
            self_id: conn.self_id,
            shared_msg_id: msg.shared_msg_id,
            time_sent: msg.time_sent,
            content_type,
            content: content.to_vec(),
        };
        match transport::send_parcel(&conn.peer_addr, conn.peer_port, &send) {
            Ok(()) => info!(
                "sent message {} on connection {}",
                msg.shared_msg_id, conn.conn_id
            ),
            Err(e) => warn!(
                "message {} on connection {} persisted but not delivered: {e}",
                msg.shared_msg_id, conn.conn_id
            ),
        }
        Ok(())
    }

    // ---- inbound parcel handling ----------------------------------------

    /// Dispatch a fully-decoded inbound parcel. Called by the Listener once
    /// per accepted socket. An `Err` here means "log and drop": by the time
    /// one is returned, no store write for this parcel has happened.
    pub fn handle_inbound(&self, parcel: Parcel) -> Result<(), Error> {
        match parcel {
            Parcel::ConnReq {
                peer_id,
                self_name,
                self_addr,
                self_port,
            } => self.handle_conn_req(peer_id, self_name, self_addr, self_port),
            Parcel::ConnAck { self_id } => self.handle_conn_ack(self_id),
            Parcel::ConnRej { self_id } => self.handle_conn_rej(self_id),
            Parcel::ConnAcc {
                self_id,
                peer_id,
                self_name,
            } => self.handle_conn_acc(self_id, peer_id, self_name),
            Parcel::MsgSend {
                self_id,
                shared_msg_id,
                time_sent,
                content_type,
                content,
            } => self.handle_msg_send(self_id, shared_msg_id, time_sent, content_type, content),
            Parcel::MsgRcv {
                self_id,
                shared_msg_id,
                time_received,
            } => self.handle_msg_rcv(self_id, shared_msg_id, time_received),
        }
    }

    /// T2: CONN_REQ arrived.
    fn handle_conn_req(
        &self,
        req_peer_id: i64,
        peer_name: String,
        peer_addr: String,
        peer_port: u16,
    ) -> Result<(), Error> {
        let now = self.clock.now();
        let conn_id = self
            .store
            .insert_self_review(req_peer_id, &peer_name, &peer_addr, peer_port, now)?;
        info!("received a CONN_REQ parcel from peer '{peer_name}' at {peer_addr}:{peer_port}");

        let ack = Parcel::ConnAck {
            self_id: req_peer_id,
        };
        match transport::send_parcel(&peer_addr, peer_port, &ack) {
            Ok(()) => info!("acknowledged connection request from peer at {peer_addr}"),
            Err(e) => warn!(
                "stored connection {conn_id} but failed to acknowledge peer at {peer_addr}: {e}"
            ),
        }
        Ok(())
    }

    /// T3: CONN_ACK arrived.
    fn handle_conn_ack(&self, ack_self_id: i64) -> Result<(), Error> {
        let conn = self
            .store
            .find_connection_by_peer_id(ack_self_id)?
            .ok_or_else(|| {
                Error::Protocol(format!("CONN_ACK for unknown peer_id {ack_self_id}"))
            })?;
        if conn.status != ConnStatus::Pending {
            return Err(Error::Protocol(format!(
                "CONN_ACK for connection {} not in PENDING state (status: {:?})",
                conn.conn_id, conn.status
            )));
        }
        let now = self.clock.now();
        self.store.mark_peer_review(conn.conn_id, now)?;
        info!("peer acknowledged our connection request (conn_id: {})", conn.conn_id);
        Ok(())
    }

    /// T6: CONN_REJ arrived.
    fn handle_conn_rej(&self, rej_self_id: i64) -> Result<(), Error> {
        let conn = self
            .store
            .find_connection_by_peer_id(rej_self_id)?
            .ok_or_else(|| {
                Error::Protocol(format!("CONN_REJ for unknown peer_id {rej_self_id}"))
            })?;
        if conn.status != ConnStatus::PeerReview {
            return Err(Error::Protocol(format!(
                "CONN_REJ for connection {} not in PEER_REVIEW state (status: {:?})",
                conn.conn_id, conn.status
            )));
        }
        let now = self.clock.now();
        self.store.mark_rejected(conn.conn_id, now)?;
        info!("peer rejected our connection request (conn_id: {})", conn.conn_id);
        Ok(())
    }

    /// T7: CONN_ACC arrived.
    fn handle_conn_acc(
        &self,
        acc_self_id: i64,
        new_peer_id: i64,
        peer_name: String,
    ) -> Result<(), Error> {
        let conn = self
            .store
            .find_connection_by_peer_id(acc_self_id)?
            .ok_or_else(|| {
                Error::Protocol(format!("CONN_ACC for unknown peer_id {acc_self_id}"))
            })?;
        if conn.status != ConnStatus::PeerReview {
            return Err(Error::Protocol(format!(
                "CONN_ACC for connection {} not in PEER_REVIEW state (status: {:?})",
                conn.conn_id, conn.status
            )));
        }
        let now = self.clock.now();
        self.store
            .mark_accepted_as_requester(conn.conn_id, new_peer_id, &peer_name, now)?;
        info!(
            "peer '{peer_name}' accepted our connection request (conn_id: {})",
            conn.conn_id
        );
        Ok(())
    }

    /// MSG_SEND arrived.
    fn handle_msg_send(
        &self,
        self_id: i64,
        shared_msg_id: i64,
        time_sent: i64,
        content_type: ContentType,
        content: Vec<u8>,
    ) -> Result<(), Error> {
        let conn = self
            .store
            .find_connection_by_peer_id(self_id)?
            .ok_or_else(|| Error::Protocol(format!("MSG_SEND for unknown peer_id {self_id}")))?;
        if conn.status != ConnStatus::Accepted {
            return Err(Error::Protocol(format!(
                "MSG_SEND on connection {} that is not ACCEPTED (status: {:?})",
                conn.conn_id, conn.status
            )));
        }
        let now = self.clock.now();
        self.store.insert_received_message(
            conn.conn_id,
            shared_msg_id,
            time_sent,
            now,
            content_type,
            &content,
        )?;

        let rcv = Parcel::MsgRcv {
            self_id: conn.self_id,
            shared_msg_id,
            time_received: now,
        };
        match transport::send_parcel(&conn.peer_addr, conn.peer_port, &rcv) {
            Ok(()) => info!(
                "delivered message {shared_msg_id} on connection {}",
                conn.conn_id
            ),
            Err(e) => warn!(
                "received message {shared_msg_id} on connection {} but could not acknowledge: {e}",
                conn.conn_id
            ),
        }
        Ok(())
    }

    /// MSG_RCV arrived.
    fn handle_msg_rcv(
        &self,
        self_id: i64,
        shared_msg_id: i64,
        time_received: i64,
    ) -> Result<(), Error> {
        let conn = self
            .store
            .find_connection_by_peer_id(self_id)?
            .ok_or_else(|| Error::Protocol(format!("MSG_RCV for unknown peer_id {self_id}")))?;

        let updated = self
            .store
            .mark_message_received(conn.conn_id, shared_msg_id, time_received)?;
        if !updated {
            return Err(Error::Protocol(format!(
                "MSG_RCV for unknown message {shared_msg_id} on connection {}",
                conn.conn_id
            )));
        }
        info!(
            "message {shared_msg_id} on connection {} confirmed delivered",
            conn.conn_id
        );
        Ok(())
    }

    // ---- helpers --------------------------------------------------------

    fn require_state(&self, key: &str) -> Result<String, Error> {
        self.store
            .state_get(key)?
            .ok_or_else(|| Error::Config(format!("missing state key: {key}")))
    }

    fn self_port(&self) -> Result<u16, Error> {
        let raw = self.require_state("self_port")?;
        raw.parse()
            .map_err(|_| Error::Config(format!("malformed self_port value: {raw}")))
    }

    fn selected_conn_id(&self) -> Result<i64, Error> {
        let raw = self.require_state("selected_conn")?;
        let conn_id: i64 = raw
            .parse()
            .map_err(|_| Error::Config(format!("malformed selected_conn value: {raw}")))?;
        if conn_id < 0 {
            return Err(Error::Config("no connection selected".into()));
        }
        Ok(conn_id)
    }
}

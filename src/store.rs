//! The durable store: three logical tables (`Connections`, `Messages`,
//! `State`) backed by a single SQLite file, opened and closed around each
//! operation the way the original implementation opens and closes its own
//! `sqlite3*` handle per call.

use std::path::Path;

use rusqlite::{params, Connection as SqlConn, OptionalExtension};

use crate::error::Error;
use crate::model::{ConnStatus, Connection, ContentType, Message};
use crate::netinfo::discover_self_addr;

/// Name of the on-disk store file (§6 of the specification).
pub const DEFAULT_DB_FILE: &str = "ap2p_storage.db";

/// Default value of the `self_name` state key.
pub const DEFAULT_SELF_NAME: &str = "the_pear_of_adam";
/// Default value of the `self_port` state key.
pub const DEFAULT_SELF_PORT: &str = "7676";
/// Default value of the `listen_addr` state key.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0";

/// A handle to the durable store.
///
/// `peer_id` is deliberately *not* declared `UNIQUE` in the schema: the
/// invariant only holds over rows with `status != REJECTED`, and a REJECTED
/// row's `peer_id` may legitimately be reused by a later connection. The
/// invariant is maintained by construction (fresh 63-bit random ids) rather
/// than by a constraint the rejected-row carve-out would make unenforceable.
pub struct Store {
    conn: SqlConn,
}

impl Store {
    /// Open the store at `path`, creating the schema (and its defaults) if
    /// this is the first time the file has been used.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let conn = SqlConn::open(path)?;
        let store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Open an in-memory store. Used by tests; behaves identically to a
    /// file-backed store in every other respect.
    pub fn open_in_memory() -> Result<Self, Error> {
        let conn = SqlConn::open_in_memory()?;
        let store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<(), Error> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS Connections (
                conn_id       INTEGER PRIMARY KEY,
                peer_id       INTEGER,
                self_id       INTEGER,
                peer_name     TEXT,
                peer_addr     TEXT NOT NULL,
                peer_port     INTEGER NOT NULL,
                online        INTEGER NOT NULL DEFAULT 0,
                requested_at  INTEGER NOT NULL,
                updated_at    INTEGER,
                status        INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS Messages (
                msg_id         INTEGER PRIMARY KEY,
                conn_id        INTEGER NOT NULL REFERENCES Connections(conn_id),
                shared_msg_id  INTEGER NOT NULL,
                time_sent      INTEGER NOT NULL,
                time_received  INTEGER,
                content_type   INTEGER NOT NULL,
                content        BLOB NOT NULL,
                UNIQUE(conn_id, shared_msg_id)
            );
            CREATE TABLE IF NOT EXISTS State (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;

        // Seed State defaults exactly once, the way the original's
        // create_state_table() inserts its one default row right after
        // creating the table.
        let self_addr = discover_self_addr();
        let defaults = [
            ("selected_conn", "-1".to_string()),
            ("listen_addr", DEFAULT_LISTEN_ADDR.to_string()),
            ("self_addr", self_addr),
            ("self_port", DEFAULT_SELF_PORT.to_string()),
            ("self_name", DEFAULT_SELF_NAME.to_string()),
        ];
        for (key, value) in defaults {
            self.conn.execute(
                "INSERT OR IGNORE INTO State (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
        }
        Ok(())
    }

    // ---- State -----------------------------------------------------

    /// Read a state value, or `None` if the key has never been set.
    pub fn state_get(&self, key: &str) -> Result<Option<String>, Error> {
        self.conn
            .query_row(
                "SELECT value FROM State WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(Error::from)
    }

    /// Write a state value, overwriting any previous value for `key`.
    /// Idempotent: calling this twice with the same arguments leaves the
    /// same value in place.
    pub fn state_set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.conn.execute(
            "INSERT INTO State (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    // ---- Connections -------------------------------------------------

    /// Return every Connection row. `peer_name` is `None` unless
    /// `status` is ACCEPTED or SELF_REVIEW.
    pub fn list_connections(&self) -> Result<Vec<Connection>, Error> {
        let mut stmt = self.conn.prepare(
            "SELECT conn_id, peer_id, self_id, peer_name, peer_addr, peer_port,
                    online, requested_at, updated_at, status
             FROM Connections",
        )?;
        let rows = stmt
            .query_map([], row_to_connection)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Fetch a single Connection by its primary key.
    pub fn get_connection(&self, conn_id: i64) -> Result<Option<Connection>, Error> {
        self.conn
            .query_row(
                "SELECT conn_id, peer_id, self_id, peer_name, peer_addr, peer_port,
                        online, requested_at, updated_at, status
                 FROM Connections WHERE conn_id = ?1",
                params![conn_id],
                row_to_connection,
            )
            .optional()
            .map_err(Error::from)
    }

    /// Find the (at most one) non-rejected Connection addressed by the
    /// field a peer sent as `self_id` — i.e. whose `peer_id` matches.
    /// REJECTED rows are excluded so a reused `peer_id` can't be
    /// re-matched by a stale or malicious frame (see SPEC_FULL.md §9).
    pub fn find_connection_by_peer_id(
        &self,
        peer_id: i64,
    ) -> Result<Option<Connection>, Error> {
        self.conn
            .query_row(
                "SELECT conn_id, peer_id, self_id, peer_name, peer_addr, peer_port,
                        online, requested_at, updated_at, status
                 FROM Connections WHERE peer_id = ?1 AND status != -1",
                params![peer_id],
                row_to_connection,
            )
            .optional()
            .map_err(Error::from)
    }

    /// T1: insert a new PENDING row for a connection we are requesting.
    pub fn insert_pending(
        &self,
        peer_id: i64,
        peer_addr: &str,
        peer_port: u16,
        now: i64,
    ) -> Result<i64, Error> {
        self.conn.execute(
            "INSERT INTO Connections (peer_id, peer_addr, peer_port, requested_at, status)
             VALUES (?1, ?2, ?3, ?4, 1)",
            params![peer_id, peer_addr, peer_port, now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// T2: insert a new SELF_REVIEW row for a connection requested of us.
    pub fn insert_self_review(
        &self,
        self_id: i64,
        peer_name: &str,
        peer_addr: &str,
        peer_port: u16,
        now: i64,
    ) -> Result<i64, Error> {
        self.conn.execute(
            "INSERT INTO Connections (self_id, peer_name, peer_addr, peer_port, requested_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 2)",
            params![self_id, peer_name, peer_addr, peer_port, now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// T3: a PENDING request we made has been acknowledged.
    pub fn mark_peer_review(&self, conn_id: i64, now: i64) -> Result<(), Error> {
        let n = self.conn.execute(
            "UPDATE Connections SET status = 3, updated_at = ?2 WHERE conn_id = ?1",
            params![conn_id, now],
        )?;
        require_updated(n, conn_id)
    }

    /// T4/T6: reject a connection (by the reviewer, or on learning the peer
    /// rejected it).
    pub fn mark_rejected(&self, conn_id: i64, now: i64) -> Result<(), Error> {
        let n = self.conn.execute(
            "UPDATE Connections SET status = -1, updated_at = ?2 WHERE conn_id = ?1",
            params![conn_id, now],
        )?;
        require_updated(n, conn_id)
    }

    /// T5: we are the acceptor; generate a new `peer_id` for the requester
    /// to address us by, and mark the row ACCEPTED.
    pub fn mark_accepted_as_acceptor(
        &self,
        conn_id: i64,
        new_peer_id: i64,
        now: i64,
    ) -> Result<(), Error> {
        let n = self.conn.execute(
            "UPDATE Connections SET peer_id = ?2, status = 0, updated_at = ?3 WHERE conn_id = ?1",
            params![conn_id, new_peer_id, now],
        )?;
        require_updated(n, conn_id)
    }

    /// T7: we are the requester; the acceptor's CONN_ACC told us our new
    /// `self_id` and its name.
    pub fn mark_accepted_as_requester(
        &self,
        conn_id: i64,
        new_self_id: i64,
        peer_name: &str,
        now: i64,
    ) -> Result<(), Error> {
        let n = self.conn.execute(
            "UPDATE Connections SET self_id = ?2, peer_name = ?3, status = 0, updated_at = ?4
             WHERE conn_id = ?1",
            params![conn_id, new_self_id, peer_name, now],
        )?;
        require_updated(n, conn_id)
    }

    // ---- Messages ------------------------------------------------------

    /// Return every Message row.
    pub fn list_messages(&self) -> Result<Vec<Message>, Error> {
        let mut stmt = self.conn.prepare(
            "SELECT msg_id, conn_id, shared_msg_id, time_sent, time_received,
                    content_type, content
             FROM Messages",
        )?;
        let rows = stmt
            .query_map([], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Insert a message we are sending. `shared_msg_id` is computed as
    /// `max(shared_msg_id)+1` over this connection inside the same
    /// statement, so two sends racing on the same connection can't observe
    /// the same `max` and collide.
    pub fn insert_sent_message(
        &self,
        conn_id: i64,
        time_sent: i64,
        content_type: ContentType,
        content: &[u8],
    ) -> Result<Message, Error> {
        let mut stmt = self.conn.prepare(
            "INSERT INTO Messages (conn_id, shared_msg_id, time_sent, time_received, content_type, content)
             VALUES (
                ?1,
                (SELECT COALESCE(MAX(shared_msg_id), 0) + 1 FROM Messages WHERE conn_id = ?1),
                ?2, NULL, ?3, ?4
             )
             RETURNING msg_id, shared_msg_id",
        )?;
        let (msg_id, shared_msg_id) = stmt.query_row(
            params![conn_id, time_sent, content_type as u8, content],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?;
        Ok(Message {
            msg_id,
            conn_id,
            shared_msg_id,
            time_sent,
            time_received: None,
            content_type,
            content: content.to_vec(),
        })
    }

    /// Insert the receiver-side mirror of a MSG_SEND, using the
    /// `shared_msg_id` the sender assigned.
    pub fn insert_received_message(
        &self,
        conn_id: i64,
        shared_msg_id: i64,
        time_sent: i64,
        time_received: i64,
        content_type: ContentType,
        content: &[u8],
    ) -> Result<i64, Error> {
        self.conn.execute(
            "INSERT INTO Messages (conn_id, shared_msg_id, time_sent, time_received, content_type, content)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![conn_id, shared_msg_id, time_sent, time_received, content_type as u8, content],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Mark the message `(conn_id, shared_msg_id)` as received. Returns
    /// `false` (without error) if no such message exists, so the caller can
    /// log and drop rather than treat it as a store failure.
    pub fn mark_message_received(
        &self,
        conn_id: i64,
        shared_msg_id: i64,
        time_received: i64,
    ) -> Result<bool, Error> {
        let n = self.conn.execute(
            "UPDATE Messages SET time_received = ?3
             WHERE conn_id = ?1 AND shared_msg_id = ?2",
            params![conn_id, shared_msg_id, time_received],
        )?;
        Ok(n > 0)
    }
}

fn require_updated(rows_affected: usize, conn_id: i64) -> Result<(), Error> {
    if rows_affected == 0 {
        return Err(Error::Protocol(format!(
            "no connection row updated for conn_id {conn_id}"
        )));
    }
    Ok(())
}

fn row_to_connection(row: &rusqlite::Row) -> rusqlite::Result<Connection> {
    let status_raw: i64 = row.get(9)?;
    let status = ConnStatus::from_i64(status_raw)
        .map_err(|e| rusqlite::Error::InvalidColumnName(e.to_string()))?;
    let peer_name: Option<String> = if status.exposes_peer_name() {
        row.get(3)?
    } else {
        None
    };
    Ok(Connection {
        conn_id: row.get(0)?,
        peer_id: row.get::<_, Option<i64>>(1)?.unwrap_or_default(),
        self_id: row.get::<_, Option<i64>>(2)?.unwrap_or_default(),
        peer_name,
        peer_addr: row.get(4)?,
        peer_port: row.get::<_, i64>(5)? as u16,
        online: row.get::<_, i64>(6)? != 0,
        requested_at: row.get(7)?,
        updated_at: row.get(8)?,
        status,
    })
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let content_type_raw: i64 = row.get(5)?;
    let content_type = ContentType::from_u8(content_type_raw as u8)
        .map_err(|e| rusqlite::Error::InvalidColumnName(e.to_string()))?;
    Ok(Message {
        msg_id: row.get(0)?,
        conn_id: row.get(1)?,
        shared_msg_id: row.get(2)?,
        time_sent: row.get(3)?,
        time_received: row.get(4)?,
        content_type,
        content: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_defaults_are_seeded_on_first_open() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.state_get("selected_conn").unwrap().as_deref(), Some("-1"));
        assert_eq!(
            store.state_get("self_name").unwrap().as_deref(),
            Some(DEFAULT_SELF_NAME)
        );
        assert_eq!(
            store.state_get("self_port").unwrap().as_deref(),
            Some(DEFAULT_SELF_PORT)
        );
        assert_eq!(
            store.state_get("listen_addr").unwrap().as_deref(),
            Some(DEFAULT_LISTEN_ADDR)
        );
        assert!(store.state_get("self_addr").unwrap().is_some());
    }

    #[test]
    fn state_set_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.state_set("self_name", "alice").unwrap();
        store.state_set("self_name", "alice").unwrap();
        assert_eq!(store.state_get("self_name").unwrap().as_deref(), Some("alice"));
    }

    #[test]
    fn state_get_missing_key_is_none() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.state_get("does_not_exist").unwrap(), None);
    }

    #[test]
    fn list_connections_reflects_inserted_rows() {
        let store = Store::open_in_memory().unwrap();
        let id1 = store.insert_pending(1, "10.0.0.1", 7676, 1000).unwrap();
        let id2 = store.insert_self_review(2, "bob", "10.0.0.2", 7677, 1001).unwrap();

        let conns = store.list_connections().unwrap();
        let ids: Vec<i64> = conns.iter().map(|c| c.conn_id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&id1));
        assert!(ids.contains(&id2));
    }

    #[test]
    fn peer_name_hidden_unless_accepted_or_self_review() {
        let store = Store::open_in_memory().unwrap();
        let id = store.insert_pending(1, "10.0.0.1", 7676, 1000).unwrap();
        let conn = store.get_connection(id).unwrap().unwrap();
        assert_eq!(conn.peer_name, None);

        let id2 = store.insert_self_review(2, "bob", "10.0.0.2", 7677, 1000).unwrap();
        let conn2 = store.get_connection(id2).unwrap().unwrap();
        assert_eq!(conn2.peer_name.as_deref(), Some("bob"));
    }

    #[test]
    fn find_connection_by_peer_id_excludes_rejected() {
        let store = Store::open_in_memory().unwrap();
        let id = store.insert_pending(42, "10.0.0.1", 7676, 1000).unwrap();
        assert!(store.find_connection_by_peer_id(42).unwrap().is_some());

        store.mark_rejected(id, 1001).unwrap();
        assert!(store.find_connection_by_peer_id(42).unwrap().is_none());
    }

    #[test]
    fn mark_on_missing_conn_id_errors() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.mark_rejected(9999, 1000).is_err());
    }

    #[test]
    fn sent_messages_get_increasing_shared_ids_per_connection() {
        let store = Store::open_in_memory().unwrap();
        let conn_id = store.insert_pending(1, "10.0.0.1", 7676, 1000).unwrap();

        let m1 = store
            .insert_sent_message(conn_id, 1000, ContentType::Text, b"a")
            .unwrap();
        let m2 = store
            .insert_sent_message(conn_id, 1001, ContentType::Text, b"b")
            .unwrap();

        assert_eq!(m1.shared_msg_id, 1);
        assert_eq!(m2.shared_msg_id, 2);
        assert_ne!(m1.msg_id, m2.msg_id);
    }

    #[test]
    fn mark_message_received_updates_matching_row_only() {
        let store = Store::open_in_memory().unwrap();
        let conn_id = store.insert_pending(1, "10.0.0.1", 7676, 1000).unwrap();
        store
            .insert_sent_message(conn_id, 1000, ContentType::Text, b"hi")
            .unwrap();

        assert!(store.mark_message_received(conn_id, 1, 1050).unwrap());
        assert!(!store.mark_message_received(conn_id, 2, 1050).unwrap());

        let msgs = store.list_messages().unwrap();
        assert_eq!(msgs[0].time_received, Some(1050));
    }
}

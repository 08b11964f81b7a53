//! End-to-end scenarios over loopback TCP, driving two independent stores
//! through the connection-and-message lifecycle the way two real instances
//! would, without the cancellable listener loop (which owns process-wide
//! standard input and can't be scoped to one test thread).

use std::net::TcpListener;

use ap2p::clock::SystemClock;
use ap2p::codec::Parcel;
use ap2p::model::{ConnStatus, ContentType};
use ap2p::protocol::Dispatcher;
use ap2p::rand::FastrandIdSource;
use ap2p::store::Store;
use ap2p::transport;

struct Instance {
    store: Store,
    listener: TcpListener,
    _db: tempfile::NamedTempFile,
}

impl Instance {
    fn new(name: &str) -> Self {
        let db = tempfile::NamedTempFile::new().unwrap();
        let store = Store::open(db.path()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        store.state_set("self_addr", "127.0.0.1").unwrap();
        store.state_set("self_port", &port.to_string()).unwrap();
        store.state_set("self_name", name).unwrap();
        Self {
            store,
            listener,
            _db: db,
        }
    }

    fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    fn dispatcher<'a>(&'a self, ids: &'a FastrandIdSource, clock: &'a SystemClock) -> Dispatcher<'a> {
        Dispatcher::new(&self.store, ids, clock)
    }

    /// Accept exactly one inbound connection and dispatch its parcel.
    fn accept_and_dispatch(&self, dispatcher: &Dispatcher) -> Parcel {
        let (mut socket, _) = self.listener.accept().unwrap();
        let kind = transport::peek_kind(&socket).unwrap();
        let parcel = transport::read_parcel(&mut socket, kind).unwrap();
        dispatcher.handle_inbound(parcel.clone()).unwrap();
        parcel
    }
}

#[test]
fn successful_negotiation_reaches_accepted_on_both_sides() {
    let a = Instance::new("A");
    let b = Instance::new("B");
    let ids = FastrandIdSource;
    let clock = SystemClock;
    let da = a.dispatcher(&ids, &clock);
    let db_ = b.dispatcher(&ids, &clock);

    da.request_connection("127.0.0.1", b.port()).unwrap();
    b.accept_and_dispatch(&db_); // B: CONN_REQ -> SELF_REVIEW, replies CONN_ACK
    a.accept_and_dispatch(&da); // A: CONN_ACK -> PEER_REVIEW

    let conn_b = b.store.list_connections().unwrap().remove(0);
    assert_eq!(conn_b.status, ConnStatus::SelfReview);

    db_.decide_on_connection(conn_b.conn_id, true).unwrap();
    a.accept_and_dispatch(&da); // A: CONN_ACC -> ACCEPTED

    let conn_a = a.store.list_connections().unwrap().remove(0);
    let conn_b = b.store.list_connections().unwrap().remove(0);

    assert_eq!(conn_a.status, ConnStatus::Accepted);
    assert_eq!(conn_b.status, ConnStatus::Accepted);
    assert_eq!(conn_a.self_id, conn_b.peer_id);
    assert_eq!(conn_b.peer_name.as_deref(), Some("B"));
}

#[test]
fn rejection_marks_both_rows_rejected() {
    let a = Instance::new("A");
    let b = Instance::new("B");
    let ids = FastrandIdSource;
    let clock = SystemClock;
    let da = a.dispatcher(&ids, &clock);
    let db_ = b.dispatcher(&ids, &clock);

    da.request_connection("127.0.0.1", b.port()).unwrap();
    b.accept_and_dispatch(&db_);
    a.accept_and_dispatch(&da);

    let conn_b = b.store.list_connections().unwrap().remove(0);
    db_.decide_on_connection(conn_b.conn_id, false).unwrap();
    a.accept_and_dispatch(&da); // A: CONN_REJ -> REJECTED

    let conn_a = a.store.list_connections().unwrap().remove(0);
    let conn_b = b.store.list_connections().unwrap().remove(0);
    assert_eq!(conn_a.status, ConnStatus::Rejected);
    assert_eq!(conn_b.status, ConnStatus::Rejected);
}

#[test]
fn message_round_trips_and_is_marked_received() {
    let a = Instance::new("A");
    let b = Instance::new("B");
    let ids = FastrandIdSource;
    let clock = SystemClock;
    let da = a.dispatcher(&ids, &clock);
    let db_ = b.dispatcher(&ids, &clock);

    da.request_connection("127.0.0.1", b.port()).unwrap();
    b.accept_and_dispatch(&db_);
    a.accept_and_dispatch(&da);
    let conn_b = b.store.list_connections().unwrap().remove(0);
    db_.decide_on_connection(conn_b.conn_id, true).unwrap();
    a.accept_and_dispatch(&da);

    let conn_a = a.store.list_connections().unwrap().remove(0);
    da.select_connection(conn_a.conn_id).unwrap();
    da.send_message(ContentType::Text, b"hi").unwrap();

    b.accept_and_dispatch(&db_); // B: MSG_SEND -> stores message, replies MSG_RCV
    a.accept_and_dispatch(&da); // A: MSG_RCV -> marks message received

    let msgs_b = b.store.list_messages().unwrap();
    assert_eq!(msgs_b.len(), 1);
    assert_eq!(msgs_b[0].content, b"hi");
    assert!(msgs_b[0].time_received.is_some());

    let msgs_a = a.store.list_messages().unwrap();
    assert_eq!(msgs_a.len(), 1);
    assert_eq!(msgs_a[0].shared_msg_id, 1);
    assert!(msgs_a[0].time_received.is_some());
}

#[test]
fn request_to_unreachable_peer_leaves_pending_row() {
    let a = Instance::new("A");
    let ids = FastrandIdSource;
    let clock = SystemClock;
    let da = a.dispatcher(&ids, &clock);

    // Port 1 is a privileged port nothing listens on in a test sandbox.
    da.request_connection("127.0.0.1", 1).unwrap();

    let conns = a.store.list_connections().unwrap();
    assert_eq!(conns.len(), 1);
    assert_eq!(conns[0].status, ConnStatus::Pending);
}

#[test]
fn deciding_on_a_non_self_review_row_errors_without_mutation() {
    let a = Instance::new("A");
    let ids = FastrandIdSource;
    let clock = SystemClock;
    let da = a.dispatcher(&ids, &clock);

    da.request_connection("127.0.0.1", 1).unwrap();
    let conn_id = a.store.list_connections().unwrap().remove(0).conn_id;
    let before = a.store.get_connection(conn_id).unwrap().unwrap();

    assert!(da.decide_on_connection(conn_id, true).is_err());

    let after = a.store.get_connection(conn_id).unwrap().unwrap();
    assert_eq!(before, after);
}

#[test]
fn self_port_override_is_embedded_in_outbound_conn_req() {
    let a = Instance::new("A");
    a.store.state_set("self_port", "9000").unwrap();
    let ids = FastrandIdSource;
    let clock = SystemClock;
    let da = a.dispatcher(&ids, &clock);

    let capture = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = capture.local_addr().unwrap().port();

    da.request_connection("127.0.0.1", port).unwrap();
    let (mut socket, _) = capture.accept().unwrap();
    let kind = transport::peek_kind(&socket).unwrap();
    let parcel = transport::read_parcel(&mut socket, kind).unwrap();

    match parcel {
        Parcel::ConnReq { self_port, .. } => assert_eq!(self_port, 9000),
        other => panic!("expected ConnReq, got {other:?}"),
    }
}

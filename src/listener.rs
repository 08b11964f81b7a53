//! The listener loop (§4.5): a single-threaded, cooperative accept loop
//! that polls the listening socket with a bounded wait and checks standard
//! input for cancellation between iterations.

use std::io::{self, Read};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use log::{debug, info, warn};

use crate::clock::SystemClock;
use crate::codec::Parcel;
use crate::error::Error;
use crate::protocol::Dispatcher;
use crate::rand::FastrandIdSource;
use crate::store::Store;
use crate::transport;

/// Upper bound on how long a single accept wait blocks before the loop
/// re-checks standard input for a cancellation byte.
const ACCEPT_POLL: Duration = Duration::from_millis(320);

/// Run the listener until a byte arrives on standard input.
///
/// Opens `store` once and reuses it for every accepted parcel, matching the
/// single-writer discipline described in §5: the listener and any
/// concurrently-running user action are assumed never to touch the same
/// store file at the same time.
pub fn listen(store: &Store, listen_addr: &str, self_port: u16) -> Result<(), Error> {
    let listener = TcpListener::bind((listen_addr, self_port))?;
    listener.set_nonblocking(true)?;
    info!("listening for parcels at {listen_addr}:{self_port}...");

    let ids = FastrandIdSource;
    let clock = SystemClock;
    let dispatcher = Dispatcher::new(store, &ids, &clock);

    let mut cancel = NonBlockingStdin::new()?;

    loop {
        if cancel.byte_available()? {
            info!("listener received cancellation byte on standard input; stopping");
            return Ok(());
        }

        match accept_with_timeout(&listener, ACCEPT_POLL) {
            Ok(Some(mut socket)) => {
                let peer = socket
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| "<unknown>".into());
                if let Err(e) = handle_one(&mut socket, &dispatcher, &peer) {
                    warn!("dropping parcel from {peer}: {e}");
                }
            }
            Ok(None) => continue,
            Err(e) => warn!("accept failed: {e}"),
        }
    }
}

/// Accept at most one inbound connection, blocking no longer than `timeout`.
/// `listener` must already be in non-blocking mode.
fn accept_with_timeout(
    listener: &TcpListener,
    timeout: Duration,
) -> Result<Option<TcpStream>, Error> {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        match listener.accept() {
            Ok((socket, _)) => return Ok(Some(socket)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if std::time::Instant::now() >= deadline {
                    return Ok(None);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Peek the kind, log the source, and fully consume + dispatch one parcel.
fn handle_one(socket: &mut TcpStream, dispatcher: &Dispatcher, peer: &str) -> Result<(), Error> {
    socket.set_nonblocking(false)?;
    let kind = transport::peek_kind(socket)?;
    debug!("conn from {peer} with kind: {kind}");
    let parcel: Parcel = transport::read_parcel(socket, kind)?;
    dispatcher.handle_inbound(parcel)
}

/// Cooperative, non-blocking check for a single byte on standard input.
struct NonBlockingStdin {
    stdin: io::Stdin,
}

impl NonBlockingStdin {
    #[cfg(unix)]
    fn new() -> Result<Self, Error> {
        use std::os::unix::io::AsRawFd;
        let fd = io::stdin().as_raw_fd();
        // SAFETY: fd is a valid, open standard-input descriptor for the
        // lifetime of the process; we only ever OR in O_NONBLOCK.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL, 0);
            if flags < 0 {
                return Err(Error::Io(io::Error::last_os_error()));
            }
            if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(Error::Io(io::Error::last_os_error()));
            }
        }
        Ok(Self { stdin: io::stdin() })
    }

    #[cfg(not(unix))]
    fn new() -> Result<Self, Error> {
        Ok(Self { stdin: io::stdin() })
    }

    /// Returns `true` if at least one byte is currently available. Never
    /// blocks: on platforms without a non-blocking stdin primitive this
    /// conservatively reports `false`, matching "cancellation is best
    /// effort" already implied by the 320 ms accept bound.
    fn byte_available(&mut self) -> Result<bool, Error> {
        let mut byte = [0u8; 1];
        match self.stdin.read(&mut byte) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::codec::Parcel;
    use crate::rand::FastrandIdSource;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn accept_with_timeout_returns_none_when_idle() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let result = accept_with_timeout(&listener, Duration::from_millis(50)).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn accept_with_timeout_returns_socket_on_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        listener.set_nonblocking(true).unwrap();

        let handle = thread::spawn(move || {
            TcpStream::connect(addr).unwrap();
        });
        let result = accept_with_timeout(&listener, Duration::from_millis(500)).unwrap();
        handle.join().unwrap();
        assert!(result.is_some());
    }

    #[test]
    fn handle_one_dispatches_a_connect_parcel() {
        let store = Store::open_in_memory().unwrap();
        let ids = FastrandIdSource;
        let clock = SystemClock;
        let dispatcher = Dispatcher::new(&store, &ids, &clock);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let parcel = Parcel::ConnReq {
                peer_id: 55,
                self_name: "carol".into(),
                self_addr: "127.0.0.1".into(),
                self_port: 1,
            };
            transport::send_parcel(&addr.ip().to_string(), addr.port(), &parcel).unwrap();
        });

        let (mut socket, _) = listener.accept().unwrap();
        handle.join().unwrap();
        handle_one(&mut socket, &dispatcher, "test").unwrap();

        let conns = store.list_connections().unwrap();
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].self_id, 55);
    }
}

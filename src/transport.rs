//! TCP transport: one short-lived connection per outbound parcel, and the
//! peek-then-read primitives the Listener uses on an inbound socket.

use std::io::{Read, Write};
use std::net::TcpStream;

use log::debug;

use crate::codec::{expected_len, Parcel, MSG_SEND_HEADER_LEN, MSG_SEND_KIND};
use crate::error::Error;

/// Open a fresh connection to `(addr, port)`, write the whole parcel, and
/// close. Any socket error is returned to the caller as a send failure.
pub fn send_parcel(addr: &str, port: u16, parcel: &Parcel) -> Result<(), Error> {
    let buf = parcel.encode();
    let mut stream = TcpStream::connect((addr, port))?;
    stream.write_all(&buf)?;
    debug!("sent parcel of kind {} to {}:{}", parcel.kind(), addr, port);
    Ok(())
}

/// Peek the `kind` byte of an inbound parcel without consuming it.
pub fn peek_kind(stream: &TcpStream) -> Result<u8, Error> {
    let mut byte = [0u8; 1];
    let n = stream.peek(&mut byte)?;
    if n < 1 {
        return Err(Error::Protocol("could not read parcel kind".into()));
    }
    Ok(byte[0])
}

/// Read the full parcel body (kind included) off `stream`, given its
/// already-peeked `kind` byte. For MSG_SEND this reads the fixed header
/// first to learn `content_len`, then reads exactly that many more bytes.
pub fn read_parcel(stream: &mut TcpStream, kind: u8) -> Result<Parcel, Error> {
    let buf = if kind == MSG_SEND_KIND {
        let mut header = [0u8; MSG_SEND_HEADER_LEN];
        stream.read_exact(&mut header)?;
        let content_len =
            u32::from_be_bytes(header[26..30].try_into().unwrap()) as usize;
        let mut content = vec![0u8; content_len];
        stream.read_exact(&mut content)?;
        let mut full = header.to_vec();
        full.extend_from_slice(&content);
        full
    } else {
        let len = expected_len(kind, &[])?;
        let mut full = vec![0u8; len];
        stream.read_exact(&mut full)?;
        full
    };
    debug!("parcel: {:?}", buf);
    Parcel::decode(&buf)
}

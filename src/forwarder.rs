use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};

use tracing::{debug, error};

use crate::point::{DataPoint, TagMap};
use crate::sanitize::Sanitizer;

const DEFAULT_COLLECTOR_PORT: u16 = 8953;

/// Soft per-datagram payload limit. Checked only after a complete line has
/// been appended, so a single oversized line still goes out whole.
const PACKET_SIZE: usize = 8 * 1024;
const BUFFER_SIZE: usize = 16 * 1024;

/// Fire-and-forget forwarder that ships batches of [`DataPoint`]s to a local
/// collector daemon as newline-delimited line-protocol text over UDP.
///
/// Lines are packed into datagrams of up to roughly 8 KiB, and a line is
/// never split across two datagrams. Sending is best-effort: per-datagram
/// failures are logged and skipped, matching UDP's own delivery guarantees.
/// The socket is created on first use and reused for the lifetime of the
/// forwarder.
pub struct UdpForwarder {
    addr: SocketAddr,
    global_tags: TagMap,
    socket: Option<UdpSocket>,
}

impl UdpForwarder {
    /// Creates a forwarder targeting the default collector address,
    /// `127.0.0.1:8953`. `global_tags` are merged into every point.
    pub fn new(global_tags: TagMap) -> Self {
        Self::with_address(global_tags, SocketAddr::from(([127, 0, 0, 1], DEFAULT_COLLECTOR_PORT)))
    }

    /// Creates a forwarder targeting `addr`.
    pub fn with_address(global_tags: TagMap, addr: SocketAddr) -> Self {
        UdpForwarder { addr, global_tags, socket: None }
    }

    /// Serializes `points` and sends them in size-bounded datagrams.
    ///
    /// Never fails: socket creation errors abort the batch with a log line,
    /// and individual send errors are logged while processing continues.
    /// Empty input does nothing.
    pub fn forward(&mut self, points: &[DataPoint], sanitizer: &Sanitizer) {
        if points.is_empty() {
            return;
        }

        if self.socket.is_none() {
            match self.open_socket() {
                Ok(socket) => self.socket = Some(socket),
                Err(e) => {
                    error!(error = %e, "failed to create UDP socket, dropping batch");
                    return;
                }
            }
        }
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        let global_tags = (!self.global_tags.is_empty()).then_some(&self.global_tags);

        let mut buf: Vec<u8> = Vec::with_capacity(BUFFER_SIZE);
        for point in points {
            let mark = buf.len();
            point.write_line(&mut buf, global_tags, sanitizer);
            if buf.len() >= PACKET_SIZE {
                if mark == 0 {
                    // One line at or over the limit by itself: an oversized
                    // datagram beats a truncated line.
                    send_packet(socket, &buf);
                    buf.clear();
                } else {
                    // Flush everything accumulated before this line and keep
                    // the line for the next datagram.
                    send_packet(socket, &buf[..mark]);
                    buf.drain(..mark);
                }
            }
        }

        if !buf.is_empty() {
            send_packet(socket, &buf);
        }
    }

    fn open_socket(&self) -> io::Result<UdpSocket> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect(self.addr)?;
        Ok(socket)
    }
}

fn send_packet(socket: &UdpSocket, payload: &[u8]) {
    match socket.send(payload) {
        Ok(len) => debug!(bytes = len, "forwarded datagram"),
        Err(e) => error!(error = %e, "failed to send datagram"),
    }
}

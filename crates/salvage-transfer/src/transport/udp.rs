/// UDP datagram transport.
///
/// ```text
/// [0]        Kind (0 = announce, 1 = data)
/// [1]        Rate (0xFF = adaptive)
/// [2..4]     Sequence (u16 BE)
/// [4]        Name length N
/// [5..5+N]   Request name (UTF-8)
/// [5+N..]    Payload (up to 1024 bytes)
/// ```
///
/// One listener thread reads the socket and hands decoded frames to the
/// registered handler. Frames for released names are dropped.

use std::collections::HashSet;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use super::{
    FrameHandler, FrameKind, InboundFrame, RateHint, SharedHandler, Transport, check_name,
};
use crate::error::TransportError;
use crate::protocol::FRAME_PAYLOAD;

/// Fixed datagram header before the name.
pub const DATAGRAM_HEADER: usize = 5;

/// Largest datagram we ever produce.
pub const DATAGRAM_MAX: usize = DATAGRAM_HEADER + super::MAX_NAME_LEN + FRAME_PAYLOAD;

/// 4 MB kernel receive buffer.
const UDP_RECV_BUFFER: usize = 4 * 1024 * 1024;

/// Listener wakes this often to check for shutdown.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

pub fn encode_datagram(
    kind: FrameKind,
    rate: RateHint,
    sequence: u16,
    name: &str,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(DATAGRAM_HEADER + name.len() + payload.len());
    buf.push(kind.to_byte());
    buf.push(rate.to_byte());
    buf.extend_from_slice(&sequence.to_be_bytes());
    buf.push(name.len() as u8);
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Returns `None` for anything that is not one of our datagrams.
pub fn decode_datagram(buf: &[u8]) -> Option<InboundFrame> {
    if buf.len() < DATAGRAM_HEADER {
        return None;
    }
    let kind = FrameKind::from_byte(buf[0])?;
    let name_len = buf[4] as usize;
    let name_end = DATAGRAM_HEADER + name_len;
    let name = std::str::from_utf8(buf.get(DATAGRAM_HEADER..name_end)?).ok()?;
    let payload = &buf[name_end..];
    if payload.len() > FRAME_PAYLOAD {
        return None;
    }
    Some(InboundFrame {
        kind,
        encoding_hint: buf[1] as u64,
        sequence: u16::from_be_bytes([buf[2], buf[3]]),
        payload: payload.to_vec(),
        name: name.to_string(),
    })
}

pub struct UdpTransport {
    socket: UdpSocket,
    peer: SocketAddr,
    handler: Arc<Mutex<Option<SharedHandler>>>,
    released: Arc<Mutex<HashSet<String>>>,
    stop: Arc<AtomicBool>,
    listener: Mutex<Option<JoinHandle<()>>>,
    datagrams_received: Arc<AtomicU64>,
}

impl UdpTransport {
    /// Bind `bind_addr` and send every frame to `peer` (may be a broadcast address).
    pub fn bind(bind_addr: SocketAddr, peer: SocketAddr) -> io::Result<Self> {
        let socket = create_socket(bind_addr)?;
        let listener_socket = socket.try_clone()?;

        let handler: Arc<Mutex<Option<SharedHandler>>> = Arc::new(Mutex::new(None));
        let released = Arc::new(Mutex::new(HashSet::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let datagrams_received = Arc::new(AtomicU64::new(0));

        // ── Listener thread ────────────────────────────────────────────
        let handler_l = handler.clone();
        let released_l = released.clone();
        let stop_l = stop.clone();
        let received_l = datagrams_received.clone();
        let listener = std::thread::spawn(move || {
            let mut recv_buf = vec![0u8; DATAGRAM_MAX + 64];
            while !stop_l.load(Ordering::Relaxed) {
                match listener_socket.recv_from(&mut recv_buf) {
                    Ok((len, src)) => {
                        let Some(frame) = decode_datagram(&recv_buf[..len]) else {
                            debug!(%src, len, "ignoring foreign datagram");
                            continue;
                        };
                        received_l.fetch_add(1, Ordering::Relaxed);
                        if released_l.lock().contains(&frame.name) {
                            continue;
                        }
                        let current = handler_l.lock().clone();
                        if let Some(handler) = current {
                            handler(frame);
                        }
                    }
                    Err(ref e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::TimedOut =>
                    {
                        // Windows returns TimedOut, Unix returns WouldBlock
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "UDP listener stopped");
                        return;
                    }
                }
            }
        });

        Ok(Self {
            socket,
            peer,
            handler,
            released,
            stop,
            listener: Mutex::new(Some(listener)),
            datagrams_received,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Datagrams decoded by the listener, released names included.
    pub fn datagrams_received(&self) -> u64 {
        self.datagrams_received.load(Ordering::Relaxed)
    }
}

impl Transport for UdpTransport {
    fn register(&self, handler: FrameHandler) {
        *self.handler.lock() = Some(Arc::from(handler));
    }

    fn send(
        &self,
        kind: FrameKind,
        rate: RateHint,
        sequence: u16,
        payload: &[u8],
        name: &str,
    ) -> Result<(), TransportError> {
        check_name(name)?;
        let datagram = encode_datagram(kind, rate, sequence, name, payload);
        self.socket.send_to(&datagram, self.peer)?;
        Ok(())
    }

    fn release(&self, name: &str) {
        self.released.lock().insert(name.to_string());
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.listener.lock().take() {
            let _ = handle.join();
        }
    }
}

fn create_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(false)?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv4() {
        socket.set_broadcast(true)?;
    }
    socket.set_recv_buffer_size(UDP_RECV_BUFFER)?;
    // Recv timeout so the listener can check for shutdown
    socket.set_read_timeout(Some(READ_TIMEOUT))?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

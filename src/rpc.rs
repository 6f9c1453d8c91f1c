//! Leader/client RPC over connectionless UDP datagrams with method-ID dispatch

use crate::common::ticker;
use socket2::{Domain, Socket, Type};
use std::{
    collections::HashMap,
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{Receiver, SyncSender},
        RwLock,
    },
    time::Duration,
};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Method identifier carried in every datagram header
pub type MethodId = i32;

/// Reserved method IDs. The values are stable protocol constants, both ends
/// must agree on them.
pub mod methods {
    use super::MethodId;

    /// Client → leader, `client_id,synced`
    pub const HEARTBEAT: MethodId = 1;
    /// Leader → client, empty payload
    pub const HEARTBEAT_ACK: MethodId = 2;
    /// Leader → client, `t0`
    pub const SNTP_REQ: MethodId = 3;
    /// Client → leader, `t0,t1,t2`
    pub const SNTP_RESP: MethodId = 4;
    /// Leader → client, `offset_ns,error_bound_ns`
    pub const OFFSET_UPDATE: MethodId = 5;
    /// Leader → clients, `t_trigger_leader_ns`
    pub const SET_TRIGGER_TIME: MethodId = 6;
    /// Leader → clients, `exposure_ns,sensitivity`
    pub const SET_2A: MethodId = 7;
    /// Leader → clients, empty payload
    pub const DO_PHASE_ALIGN: MethodId = 8;
}

/// Sender-side cap, the transport never fragments
pub const MAX_PAYLOAD: usize = 64 * 1024;
/// method_id + payload_len, both big-endian i32
const HEADER_SIZE: usize = 8;
/// Largest datagram we will ever send or accept
pub const MAX_DATAGRAM: usize = HEADER_SIZE + MAX_PAYLOAD;
/// How long the receive loop blocks before re-checking for shutdown
const RECV_POLL: Duration = Duration::from_millis(100);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("payload of {0} bytes exceeds the 64 KiB datagram cap")]
    PayloadTooLarge(usize),
    #[error("datagram of {0} bytes is too short to carry a header")]
    Truncated(usize),
    #[error("stated payload length {stated} disagrees with datagram size {actual}")]
    LengthMismatch { stated: i32, actual: usize },
    #[error("payload is not valid UTF-8")]
    NotUtf8,
    #[error("no handler registered for method {0}")]
    UnknownMethod(MethodId),
    #[error("malformed payload for method {method}: {payload:?}")]
    MalformedPayload { method: MethodId, payload: String },
}

/// Frame an RPC into wire bytes
pub fn encode_frame(method: MethodId, payload: &str) -> Result<Vec<u8>, Error> {
    if payload.len() > MAX_PAYLOAD {
        return Err(Error::PayloadTooLarge(payload.len()));
    }
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&method.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as i32).to_be_bytes());
    buf.extend_from_slice(payload.as_bytes());
    Ok(buf)
}

/// Parse wire bytes back into `(method_id, payload)`
pub fn decode_frame(buf: &[u8]) -> Result<(MethodId, &str), Error> {
    if buf.len() < HEADER_SIZE {
        return Err(Error::Truncated(buf.len()));
    }
    let method = i32::from_be_bytes(buf[0..4].try_into().unwrap());
    let stated = i32::from_be_bytes(buf[4..8].try_into().unwrap());
    if stated < 0 || stated as usize != buf.len() - HEADER_SIZE {
        return Err(Error::LengthMismatch {
            stated,
            actual: buf.len(),
        });
    }
    let payload = std::str::from_utf8(&buf[HEADER_SIZE..]).map_err(|_| Error::NotUtf8)?;
    Ok((method, payload))
}

/// Split a comma-separated payload into exactly `N` fields
pub fn fields<const N: usize>(method: MethodId, payload: &str) -> Result<[&str; N], Error> {
    let mut parts = payload.splitn(N, ',');
    let mut out = [""; N];
    for slot in &mut out {
        *slot = parts.next().ok_or_else(|| Error::MalformedPayload {
            method,
            payload: payload.to_string(),
        })?;
    }
    Ok(out)
}

/// A received RPC, stamped with its arrival tick.
///
/// `rx_ns` is taken in the receive loop itself, before the datagram is queued
/// for dispatch, so handlers that need an accurate receive time (the SNTP
/// fold) are immune to worker latency.
#[derive(Debug)]
pub struct Datagram {
    pub method: MethodId,
    pub sender: SocketAddr,
    pub payload: String,
    pub rx_ns: u64,
}

pub type Handler = Box<dyn Fn(&Datagram) + Send + Sync>;

/// Counters the monitoring task periodically scrapes
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub received: u64,
    pub sent: u64,
    pub dropped: u64,
}

/// One UDP endpoint: a bound socket plus the method-ID handler table.
///
/// A single receive loop pulls datagrams off the socket and queues them for a
/// separate dispatch worker, handlers never run on (and so never block) the
/// socket loop.
pub struct Transport {
    sock: UdpSocket,
    handlers: RwLock<HashMap<MethodId, Handler>>,
    received: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl Transport {
    /// Bind to `port` on all interfaces, with broadcast permission (the
    /// client's first heartbeat goes to the subnet broadcast address)
    pub fn bind(port: u16) -> eyre::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        let address = SocketAddr::from(([0, 0, 0, 0], port));
        socket.bind(&address.into())?;
        // Block with a short timeout so the receive loop can poll for shutdown
        socket.set_read_timeout(Some(RECV_POLL))?;
        let sock: UdpSocket = socket.into();
        Ok(Self {
            sock,
            handlers: RwLock::new(HashMap::new()),
            received: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> eyre::Result<SocketAddr> {
        Ok(self.sock.local_addr()?)
    }

    /// Register the handler for a method ID. The table is read-mostly, this
    /// takes the write lock and should only happen during bringup.
    pub fn register_handler(&self, method: MethodId, handler: Handler) {
        self.handlers.write().unwrap().insert(method, handler);
    }

    pub fn send_to(&self, addr: SocketAddr, method: MethodId, payload: &str) -> eyre::Result<()> {
        let frame = encode_frame(method, payload)?;
        self.sock.send_to(&frame, addr)?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Unicast one datagram to every known peer. Datagram loss is expected
    /// and silent, higher layers own their own re-send policy.
    pub fn broadcast(
        &self,
        addrs: &[SocketAddr],
        method: MethodId,
        payload: &str,
    ) -> eyre::Result<()> {
        for addr in addrs {
            self.send_to(*addr, method, payload)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> Stats {
        Stats {
            received: self.received.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Socket receive loop. Decodes and timestamps each datagram and hands it
    /// to the dispatch worker; malformed traffic is logged and dropped here.
    pub fn recv_loop(
        &self,
        dispatch: SyncSender<Datagram>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> eyre::Result<()> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            if shutdown.try_recv().is_ok() {
                info!("RPC receive loop stopping");
                break;
            }
            let (n, sender) = match self.sock.recv_from(&mut buf) {
                Ok(v) => v,
                Err(ref e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let rx_ns = ticker().now_ns();
            self.received.fetch_add(1, Ordering::Relaxed);
            let (method, payload) = match decode_frame(&buf[..n]) {
                Ok(v) => v,
                Err(e) => {
                    warn!(%sender, "Dropping malformed datagram - {e}");
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            let datagram = Datagram {
                method,
                sender,
                payload: payload.to_string(),
                rx_ns,
            };
            if dispatch.send(datagram).is_err() {
                // Dispatch worker is gone, nothing left to deliver to
                break;
            }
        }
        Ok(())
    }

    /// Dispatch worker. Looks up and runs the handler for each queued
    /// datagram; an unknown method ID is logged and dropped.
    pub fn dispatch_task(
        &self,
        queue: Receiver<Datagram>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> eyre::Result<()> {
        info!("Starting RPC dispatch task");
        loop {
            if shutdown.try_recv().is_ok() {
                info!("RPC dispatch task stopping");
                break;
            }
            let datagram = match queue.recv_timeout(RECV_POLL) {
                Ok(d) => d,
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            };
            let handlers = self.handlers.read().unwrap();
            match handlers.get(&datagram.method) {
                Some(handler) => handler(&datagram),
                None => {
                    warn!(
                        sender = %datagram.sender,
                        "{}",
                        Error::UnknownMethod(datagram.method)
                    );
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }
}

/// The subnet broadcast address for a local interface address, assuming the
/// common /24 hotspot mask (the OS mask is not portably queryable)
pub fn subnet_broadcast(local: Ipv4Addr) -> Ipv4Addr {
    let o = local.octets();
    Ipv4Addr::new(o[0], o[1], o[2], 255)
}

/// Learn the local interface address by "connecting" a throwaway datagram
/// socket. Nothing is sent, the OS just picks the route's source address.
pub fn probe_local_ip() -> eyre::Result<Ipv4Addr> {
    let sock = UdpSocket::bind("0.0.0.0:0")?;
    sock.connect("192.168.49.1:9")?;
    match sock.local_addr()? {
        SocketAddr::V4(v4) => Ok(*v4.ip()),
        SocketAddr::V6(_) => eyre::bail!("Expected an IPv4 interface address"),
    }
}

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ChannelPlan, RTP_HEADER_LEN};
use crate::distributor::Distributor;
use crate::error::IngestError;

// --- Ingest ------------------------------------------------------------------
//
// One UDP listener per channel. Each datagram is an RTP packet from the stream
// generator; we skip the fixed 12-byte header and forward the remainder as an
// opaque payload. Sequence numbers and timestamps are never looked at: audio
// is lossy and the client plays whatever arrives, in arrival order.
//
// Listeners are fully independent. If one channel cannot bind its socket,
// that channel is out of service and the rest keep running.

/// Largest UDP payload we could ever be handed.
const MAX_DATAGRAM: usize = 65_536;

const RECV_BACKOFF_BASE: Duration = Duration::from_millis(10);
const RECV_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Per-channel ingest counters, surfaced by `/api/v1/status`.
#[derive(Debug, Default)]
pub struct ChannelStats {
    listening: AtomicBool,
    last_error: Mutex<Option<String>>,
    packets: AtomicU64,
    bytes: AtomicU64,
    dropped: AtomicU64,
    last_packet_ms: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub channel: usize,
    pub group: String,
    pub listening: bool,
    pub error: Option<String>,
    pub packets: u64,
    pub bytes: u64,
    pub dropped: u64,
    pub last_packet: Option<String>,
}

impl ChannelStats {
    fn record_packet(&self, payload_len: usize) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(payload_len as u64, Ordering::Relaxed);
        self.last_packet_ms.store(now_ms(), Ordering::Relaxed);
    }

    fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn set_listening(&self) {
        self.listening.store(true, Ordering::Relaxed);
        if let Ok(mut e) = self.last_error.lock() {
            *e = None;
        }
    }

    fn set_failed(&self, err: &IngestError) {
        self.listening.store(false, Ordering::Relaxed);
        if let Ok(mut e) = self.last_error.lock() {
            *e = Some(err.to_string());
        }
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn status(&self, channel: usize, endpoint: SocketAddrV4) -> ChannelStatus {
        let last_ms = self.last_packet_ms.load(Ordering::Relaxed);
        ChannelStatus {
            channel: channel + 1,
            group: endpoint.to_string(),
            listening: self.listening.load(Ordering::Relaxed),
            error: self.last_error.lock().ok().and_then(|e| e.clone()),
            packets: self.packets(),
            bytes: self.bytes.load(Ordering::Relaxed),
            dropped: self.dropped(),
            last_packet: (last_ms > 0).then(|| fmt_epoch_ms(last_ms)),
        }
    }
}

/// Stats for every channel of a plan, indexed by channel.
pub type IngestStats = Arc<Vec<Arc<ChannelStats>>>;

pub fn new_stats(channels: usize) -> IngestStats {
    Arc::new((0..channels).map(|_| Arc::new(ChannelStats::default())).collect())
}

pub struct IngestListener {
    channel: usize,
    socket: UdpSocket,
}

impl IngestListener {
    /// Bind the channel's socket and, for multicast groups, join the group.
    ///
    /// Unicast addresses are accepted as-is (handy for loopback testing and
    /// for generators that unicast to a single engine).
    pub async fn bind(
        channel: usize,
        group: Ipv4Addr,
        port: u16,
        interface: Ipv4Addr,
    ) -> Result<Self, IngestError> {
        let bind_ip = if group.is_multicast() && cfg!(not(unix)) {
            // Only unix lets us bind directly to the group address.
            Ipv4Addr::UNSPECIFIED
        } else {
            group
        };
        let addr = SocketAddr::V4(SocketAddrV4::new(bind_ip, port));
        let bind_err = |source| IngestError::Bind { channel, addr, source };

        let socket = reusable_udp_socket(addr).map_err(bind_err)?;
        if group.is_multicast() {
            socket
                .join_multicast_v4(group, interface)
                .map_err(bind_err)?;
        }

        Ok(Self { channel, socket })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive loop. Runs until the task is aborted.
    pub async fn run(self, distributor: Distributor, stats: Arc<ChannelStats>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut backoff = RecvBackoff::default();
        loop {
            let n = match self.socket.recv_from(&mut buf).await {
                Ok((n, _from)) => {
                    backoff.reset();
                    n
                }
                Err(source) => {
                    stats.record_drop();
                    let delay = backoff.failed();
                    if backoff.should_log() {
                        let e = IngestError::Receive { channel: self.channel, source };
                        warn!("{e} ({} in a row, retrying in {delay:?})", backoff.failures);
                    }
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let Some(payload) = strip_rtp_header(&buf[..n]) else {
                debug!("channel {}: dropped {n}-byte datagram (too short)", self.channel + 1);
                stats.record_drop();
                continue;
            };

            stats.record_packet(payload.len());
            let sessions = distributor.publish(self.channel, Bytes::copy_from_slice(payload));
            tracing::trace!(
                "channel {}: {} bytes to {sessions} sessions",
                self.channel + 1,
                payload.len()
            );
        }
    }
}

/// UDP socket with SO_REUSEADDR, so other receivers on this host can share
/// the group and port.
fn reusable_udp_socket(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Retry pacing for a socket that keeps failing. Doubles per consecutive
/// failure up to a cap; one good datagram resets it.
#[derive(Debug, Default)]
struct RecvBackoff {
    failures: u32,
}

impl RecvBackoff {
    fn failed(&mut self) -> Duration {
        let delay = RECV_BACKOFF_BASE
            .saturating_mul(1 << self.failures.min(7))
            .min(RECV_BACKOFF_MAX);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    fn reset(&mut self) {
        self.failures = 0;
    }

    /// Warn on the 1st, 2nd, 4th, 8th... failure of a run.
    fn should_log(&self) -> bool {
        self.failures.is_power_of_two()
    }
}

/// Payload after the fixed RTP header, or `None` when nothing is left.
pub fn strip_rtp_header(datagram: &[u8]) -> Option<&[u8]> {
    match datagram.get(RTP_HEADER_LEN..) {
        Some(rest) if !rest.is_empty() => Some(rest),
        _ => None,
    }
}

/// Start a listener for every channel in the plan.
///
/// Bind failures are logged and recorded in that channel's stats; they never
/// stop the other channels from starting.
pub async fn spawn_listeners(
    plan: &ChannelPlan,
    distributor: &Distributor,
    stats: &IngestStats,
) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::with_capacity(plan.channels);
    for (channel, st) in stats.iter().enumerate().take(plan.channels) {
        let ep = plan.endpoint(channel);
        match IngestListener::bind(channel, *ep.ip(), ep.port(), plan.interface).await {
            Ok(listener) => {
                st.set_listening();
                info!("channel {}: listening to RTP on {ep}", channel + 1);
                tasks.push(tokio::spawn(listener.run(distributor.clone(), st.clone())));
            }
            Err(e) => {
                error!("{e}; channel {} is out of service", channel + 1);
                st.set_failed(&e);
            }
        }
    }
    tasks
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn fmt_epoch_ms(ms: u64) -> String {
    let nanos = ms as i128 * 1_000_000;
    time::OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .ok()
        .and_then(|t| t.format(&time::format_description::well_known::Rfc3339).ok())
        .unwrap_or_else(|| ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_skipped() {
        let mut pkt = vec![0x80, 0x7F, 0, 1, 0, 0, 3, 0xC0, 0, 0, 0x30, 0x39];
        pkt.extend_from_slice(&[0xAA, 0xBB]);
        assert_eq!(strip_rtp_header(&pkt), Some(&[0xAA, 0xBB][..]));
    }

    #[test]
    fn short_datagrams_are_rejected() {
        assert_eq!(strip_rtp_header(&[0u8; 4]), None);
        assert_eq!(strip_rtp_header(&[0u8; RTP_HEADER_LEN]), None);
    }

    #[test]
    fn epoch_formatting() {
        assert_eq!(fmt_epoch_ms(0), "1970-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn bind_failure_is_isolated() {
        // Occupy a port, then ask a listener for the same one.
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let err = IngestListener::bind(3, Ipv4Addr::LOCALHOST, port, Ipv4Addr::UNSPECIFIED)
            .await
            .err()
            .expect("second bind must fail");
        assert!(matches!(err, IngestError::Bind { channel: 3, .. }));

        let stats = ChannelStats::default();
        stats.set_failed(&err);
        let st = stats.status(3, SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
        assert!(!st.listening);
        assert!(st.error.unwrap().contains("cannot bind"));
    }

    #[tokio::test]
    async fn listeners_share_group_and_port() {
        let port = std::net::UdpSocket::bind("0.0.0.0:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let group = Ipv4Addr::new(239, 0, 0, 77);
        let first = IngestListener::bind(0, group, port, Ipv4Addr::UNSPECIFIED).await;
        let second = IngestListener::bind(0, group, port, Ipv4Addr::UNSPECIFIED).await;
        assert!(first.is_ok(), "{:?}", first.err());
        assert!(second.is_ok(), "{:?}", second.err());
    }

    #[test]
    fn receive_errors_back_off() {
        let mut b = RecvBackoff::default();
        let delays: Vec<u64> = (0..10).map(|_| b.failed().as_millis() as u64).collect();
        assert_eq!(delays, [10, 20, 40, 80, 160, 320, 640, 1000, 1000, 1000]);

        b.reset();
        assert_eq!(b.failed(), RECV_BACKOFF_BASE);
        assert!(b.should_log());
        b.failed();
        assert!(b.should_log());
        b.failed();
        assert!(!b.should_log(), "third failure in a row is quiet");
        b.failed();
        assert!(b.should_log());
    }

    #[tokio::test]
    async fn datagrams_flow_to_distributor() {
        let listener = IngestListener::bind(1, Ipv4Addr::LOCALHOST, 0, Ipv4Addr::UNSPECIFIED)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let d = Distributor::new(8);
        let mut rx = d.subscribe();
        let stats = Arc::new(ChannelStats::default());
        let task = tokio::spawn(listener.run(d.clone(), stats.clone()));

        let tx = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        tx.send_to(&[0u8; 5], addr).unwrap();
        let mut pkt = vec![0u8; RTP_HEADER_LEN];
        pkt.extend_from_slice(&[1, 2, 3, 4]);
        tx.send_to(&pkt, addr).unwrap();

        let got = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.channel, 1);
        assert_eq!(&got.payload[..], &[1, 2, 3, 4]);
        assert_eq!(stats.packets(), 1);
        assert_eq!(stats.dropped(), 1);
        task.abort();
    }
}

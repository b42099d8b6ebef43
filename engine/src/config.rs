use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::Context;

// ChannelMix configuration
//
// Everything is driven by environment variables (CHANNELMIX_*) with sane
// defaults, so a fresh install "just works" against the stock stream
// generator: ten channels on 239.0.0.1..10, ports 5001, 5003, ... 5019.

/// Fixed channel count. Changing it means changing the stream generator too.
pub const CHANNEL_COUNT: usize = 10;

/// Size of the RTP fixed header we skip on every datagram.
pub const RTP_HEADER_LEN: usize = 12;

pub const DEFAULT_RING_CAPACITY: usize = 4096;
pub const DEFAULT_BLOCK_FRAMES: usize = 128;
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const DEFAULT_WATCHDOG_MS: u64 = 50;
pub const DEFAULT_TRAFFIC_HIGHLIGHT_MS: u64 = 1000;
pub const DEFAULT_ADMIN_DURATION_SECS: u32 = 15;

/// Multicast addressing convention for the ingest side.
///
/// Channel `i` (0-based) listens on `base + i` (last octet) and
/// `base_port + 2 * i`; ports are paired (RTP/RTCP) so only even offsets are
/// used.
#[derive(Debug, Clone)]
pub struct ChannelPlan {
    pub channels: usize,
    pub base_group: Ipv4Addr,
    pub base_port: u16,
    pub interface: Ipv4Addr,
}

impl Default for ChannelPlan {
    fn default() -> Self {
        Self {
            channels: CHANNEL_COUNT,
            base_group: Ipv4Addr::new(239, 0, 0, 1),
            base_port: 5001,
            interface: Ipv4Addr::UNSPECIFIED,
        }
    }
}

impl ChannelPlan {
    pub fn group(&self, channel: usize) -> Ipv4Addr {
        let base = u32::from(self.base_group);
        Ipv4Addr::from(base.wrapping_add(channel as u32))
    }

    pub fn port(&self, channel: usize) -> u16 {
        self.base_port.wrapping_add((channel as u16).wrapping_mul(2))
    }

    pub fn endpoint(&self, channel: usize) -> SocketAddrV4 {
        SocketAddrV4::new(self.group(channel), self.port(channel))
    }
}

/// Session event name for a channel, e.g. `audio-stream-1` for channel 0.
pub fn event_name(channel: usize) -> String {
    format!("audio-stream-{}", channel + 1)
}

/// Inverse of [`event_name`].
pub fn channel_from_event(event: &str) -> Option<usize> {
    let n: usize = event.strip_prefix("audio-stream-")?.parse().ok()?;
    n.checked_sub(1)
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bind: SocketAddr,
    pub plan: ChannelPlan,
    pub admin_target: SocketAddr,
    /// Per-session queue depth before the oldest payloads are dropped.
    pub broadcast_capacity: usize,
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind = env_or("CHANNELMIX_BIND", "127.0.0.1:3000")
            .parse()
            .context("CHANNELMIX_BIND")?;

        let plan = ChannelPlan {
            channels: env_parse("CHANNELMIX_CHANNELS", CHANNEL_COUNT)?,
            base_group: env_parse("CHANNELMIX_MCAST_BASE", Ipv4Addr::new(239, 0, 0, 1))?,
            base_port: env_parse("CHANNELMIX_MCAST_PORT", 5001u16)?,
            interface: env_parse("CHANNELMIX_MCAST_IFACE", Ipv4Addr::UNSPECIFIED)?,
        };

        let admin_target = env_or("CHANNELMIX_ADMIN_TARGET", "239.0.0.11:5000")
            .parse()
            .context("CHANNELMIX_ADMIN_TARGET")?;

        Ok(Self {
            bind,
            plan,
            admin_target,
            broadcast_capacity: env_parse("CHANNELMIX_BROADCAST_CAPACITY", 256usize)?,
        })
    }
}

/// Where the client's rendered mix goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Discard (headless monitoring, useful for soak testing).
    Null,
    /// Interleaved s16le stereo on stdout, e.g. `| aplay -f S16_LE -c2 -r48000`.
    Stdout,
}

impl std::str::FromStr for OutputKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "null" | "none" => Ok(OutputKind::Null),
            "stdout" | "pcm" => Ok(OutputKind::Stdout),
            other => anyhow::bail!("unknown output kind: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub channels: usize,
    pub ring_capacity: usize,
    pub block_frames: usize,
    pub sample_rate: u32,
    pub watchdog: Duration,
    pub traffic_highlight: Duration,
    pub output: OutputKind,
    /// Channels (1-based, as operators count them) switched on at startup.
    pub auto_on: Vec<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3000/ws".to_string(),
            channels: CHANNEL_COUNT,
            ring_capacity: DEFAULT_RING_CAPACITY,
            block_frames: DEFAULT_BLOCK_FRAMES,
            sample_rate: DEFAULT_SAMPLE_RATE,
            watchdog: Duration::from_millis(DEFAULT_WATCHDOG_MS),
            traffic_highlight: Duration::from_millis(DEFAULT_TRAFFIC_HIGHLIGHT_MS),
            output: OutputKind::Null,
            auto_on: Vec::new(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let d = ClientConfig::default();
        let ring_capacity = env_parse("CHANNELMIX_RING_CAPACITY", d.ring_capacity)?;
        let block_frames = env_parse("CHANNELMIX_BLOCK_FRAMES", d.block_frames)?;
        let sample_rate = env_parse("CHANNELMIX_SAMPLE_RATE", d.sample_rate)?;
        if ring_capacity == 0 || block_frames == 0 || sample_rate == 0 {
            anyhow::bail!("ring capacity, block size and sample rate must be non-zero");
        }

        let auto_on = match std::env::var("CHANNELMIX_AUTO_ON") {
            Ok(list) => parse_channel_list(&list)?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            url: env_or("CHANNELMIX_URL", &d.url),
            channels: env_parse("CHANNELMIX_CHANNELS", d.channels)?,
            ring_capacity,
            block_frames,
            sample_rate,
            watchdog: Duration::from_millis(env_parse("CHANNELMIX_WATCHDOG_MS", DEFAULT_WATCHDOG_MS)?),
            traffic_highlight: Duration::from_millis(env_parse(
                "CHANNELMIX_TRAFFIC_MS",
                DEFAULT_TRAFFIC_HIGHLIGHT_MS,
            )?),
            output: env_parse("CHANNELMIX_OUTPUT", d.output)?,
            auto_on,
        })
    }
}

/// Parse "1,3, 5" into `[1, 3, 5]`. Empty entries are skipped.
pub fn parse_channel_list(s: &str) -> anyhow::Result<Vec<usize>> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<usize>().with_context(|| format!("bad channel number: {p}")))
        .collect()
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{key}={raw:?}: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_follows_generator_convention() {
        let plan = ChannelPlan::default();
        assert_eq!(plan.endpoint(0), "239.0.0.1:5001".parse().unwrap());
        assert_eq!(plan.endpoint(9), "239.0.0.10:5019".parse().unwrap());
    }

    #[test]
    fn event_names_are_one_based() {
        assert_eq!(event_name(0), "audio-stream-1");
        assert_eq!(channel_from_event("audio-stream-10"), Some(9));
        assert_eq!(channel_from_event("audio-stream-0"), None);
        assert_eq!(channel_from_event("video-stream-1"), None);
    }

    #[test]
    fn channel_list_parsing() {
        assert_eq!(parse_channel_list("1, 3,5,").unwrap(), vec![1, 3, 5]);
        assert!(parse_channel_list("1,x").is_err());
    }

    #[test]
    fn output_kind_from_str() {
        assert_eq!("STDOUT".parse::<OutputKind>().unwrap(), OutputKind::Stdout);
        assert_eq!("null".parse::<OutputKind>().unwrap(), OutputKind::Null);
        assert!("speaker".parse::<OutputKind>().is_err());
    }
}

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::UdpSocket;
use tracing::{info, warn};

use crate::config::DEFAULT_ADMIN_DURATION_SECS;
use crate::error::AdminError;

// --- Admin commands ------------------------------------------------------------
//
// The stream generator upstream listens for a single JSON datagram:
//
//   {"command":"start","channels":[1,3,5],"duration":15}
//   {"command":"stop","channels":[],"duration":15}
//
// Delivery is best-effort: one datagram, no acknowledgement, no retry. A send
// failure is reported back to whoever asked, once.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminAction {
    Start,
    Stop,
}

impl AdminAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminAction::Start => "start",
            AdminAction::Stop => "stop",
        }
    }
}

/// Inbound request as the admin UI sends it. Loosely typed on purpose: the
/// UI posts form values, so numbers frequently arrive as strings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminRequest {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub channels: Option<Value>,
    #[serde(default)]
    pub duration: Option<Value>,
}

/// A validated, normalized command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCommand {
    pub action: AdminAction,
    /// Stream numbers as the generator knows them. Always empty for stop.
    pub channels: Vec<u32>,
    pub duration_secs: u32,
}

#[derive(Serialize)]
struct Datagram<'a> {
    command: &'a str,
    channels: &'a [u32],
    duration: u32,
}

impl AdminRequest {
    pub fn validate(&self) -> Result<AdminCommand, AdminError> {
        let action = match self.action.as_deref().map(str::trim) {
            Some("start") => AdminAction::Start,
            Some("stop") => AdminAction::Stop,
            _ => return Err(AdminError::Validation("Invalid action.".into())),
        };

        let channels = match action {
            AdminAction::Stop => Vec::new(),
            AdminAction::Start => {
                let list = match &self.channels {
                    Some(Value::Array(list)) if !list.is_empty() => list,
                    _ => return Err(AdminError::Validation("No channels selected.".into())),
                };
                list.iter()
                    .map(|v| {
                        number_of(v)
                            .filter(|n| n.fract() == 0.0 && *n >= 0.0 && *n <= u32::MAX as f64)
                            .map(|n| n as u32)
                            .ok_or_else(|| AdminError::Validation(format!("Invalid channel: {v}")))
                    })
                    .collect::<Result<Vec<_>, _>>()?
            }
        };

        Ok(AdminCommand {
            action,
            channels,
            duration_secs: normalize_duration(self.duration.as_ref()),
        })
    }
}

impl AdminCommand {
    pub fn start(channels: Vec<u32>, duration_secs: Option<u32>) -> Result<Self, AdminError> {
        AdminRequest {
            action: Some("start".into()),
            channels: Some(Value::from(channels)),
            duration: duration_secs.map(Value::from),
        }
        .validate()
    }

    pub fn stop() -> Self {
        Self {
            action: AdminAction::Stop,
            channels: Vec::new(),
            duration_secs: DEFAULT_ADMIN_DURATION_SECS,
        }
    }

    pub fn to_datagram(&self) -> String {
        serde_json::to_string(&Datagram {
            command: self.action.as_str(),
            channels: &self.channels,
            duration: self.duration_secs,
        })
        .unwrap_or_default()
    }
}

fn number_of(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Missing, non-numeric, zero or negative durations fall back to the default.
fn normalize_duration(v: Option<&Value>) -> u32 {
    v.and_then(number_of)
        .filter(|d| d.is_finite() && *d > 0.0)
        .map(|d| d.round().min(u32::MAX as f64) as u32)
        .filter(|d| *d > 0)
        .unwrap_or(DEFAULT_ADMIN_DURATION_SECS)
}

#[derive(Debug, Clone)]
pub struct AdminSender {
    target: SocketAddr,
    timeout: Duration,
}

impl AdminSender {
    pub fn new(target: SocketAddr) -> Self {
        Self { target, timeout: Duration::from_millis(200) }
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Send exactly one datagram. Returns the number of bytes sent.
    pub async fn send(&self, cmd: &AdminCommand) -> Result<usize, AdminError> {
        let body = cmd.to_datagram();
        let send_err = |source| AdminError::Send { target: self.target, source };

        let local: SocketAddr = match self.target {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await.map_err(send_err)?;

        // Don't hear our own commands if the engine shares a host with a listener.
        if self.target.is_ipv4() {
            if let Err(e) = socket.set_multicast_loop_v4(false) {
                warn!("admin: failed to disable multicast loopback: {e}");
            }
        }

        let sent = tokio::time::timeout(self.timeout, socket.send_to(body.as_bytes(), self.target))
            .await
            .map_err(|_| send_err(std::io::Error::from(std::io::ErrorKind::TimedOut)))?
            .map_err(send_err)?;

        info!("admin: sent {body} to {}", self.target);
        Ok(sent)
    }
}

//! Transport Abstractions
//!
//! The tunnel implementations themselves (WireGuard, OpenVPN, Stealth)
//! live outside this crate. The connection core reaches them through
//! three capabilities:
//!
//! ```text
//! TransportLayer::establish(candidate, timeout) ──▶ Tunnel
//!                                                    │
//!                          Tunnel::open_channel() ──▶ ControlChannel (send/receive frames)
//! ```
//!
//! Which transport is used is a closed set ([`TransportKind`]) dispatched
//! through the single [`TransportLayer::establish`] entry point.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::io;
use std::str::FromStr;
use std::time::Duration;

/// Transport protocol used for the underlying tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransportKind {
    /// WireGuard over UDP
    #[serde(rename = "wireguard-udp")]
    WireGuardUdp,
    /// WireGuard over TCP
    #[serde(rename = "wireguard-tcp")]
    WireGuardTcp,
    /// WireGuard wrapped in TLS
    #[serde(rename = "stealth")]
    Stealth,
    /// OpenVPN over UDP
    #[serde(rename = "openvpn-udp")]
    OpenVpnUdp,
    /// OpenVPN over TCP
    #[serde(rename = "openvpn-tcp")]
    OpenVpnTcp,
}

impl TransportKind {
    /// All transports, in default smart-protocol order
    pub const ALL: [TransportKind; 5] = [
        TransportKind::WireGuardUdp,
        TransportKind::WireGuardTcp,
        TransportKind::Stealth,
        TransportKind::OpenVpnUdp,
        TransportKind::OpenVpnTcp,
    ];

    /// Stable identifier, identical to the serialized form
    pub const fn as_str(self) -> &'static str {
        match self {
            TransportKind::WireGuardUdp => "wireguard-udp",
            TransportKind::WireGuardTcp => "wireguard-tcp",
            TransportKind::Stealth => "stealth",
            TransportKind::OpenVpnUdp => "openvpn-udp",
            TransportKind::OpenVpnTcp => "openvpn-tcp",
        }
    }

    /// Does this transport run over a stream socket?
    pub fn is_stream(self) -> bool {
        !matches!(self, TransportKind::WireGuardUdp | TransportKind::OpenVpnUdp)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = UnknownTransport;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransportKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownTransport(s.to_string()))
    }
}

/// Unrecognized transport name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown transport: {0}")]
pub struct UnknownTransport(pub String);

/// One transport/port combination to try
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolCandidate {
    /// Transport protocol
    pub kind: TransportKind,
    /// Server port
    pub port: u16,
    /// Lower values are tried first
    #[serde(default)]
    pub priority: u32,
}

impl ProtocolCandidate {
    /// Create a new candidate
    pub fn new(kind: TransportKind, port: u16, priority: u32) -> Self {
        Self { kind, port, priority }
    }
}

impl fmt::Display for ProtocolCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.port)
    }
}

/// Failure reported by a transport implementation while establishing a tunnel
#[derive(Debug, thiserror::Error)]
pub enum EstablishError {
    #[error("Connection refused")]
    Refused,

    #[error("Server unreachable")]
    Unreachable,

    #[error("Timed out")]
    TimedOut,

    #[error("Transport I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Framed control channel to the local agent, carried inside a tunnel.
///
/// Each `send`/`receive` call carries exactly one frame. `receive`
/// resolves to `Ok(None)` once the peer has closed the channel and must be
/// cancel-safe: dropping a pending `receive` must not lose a frame.
pub trait ControlChannel: Send + 'static {
    /// Send one frame
    fn send(&mut self, frame: Vec<u8>) -> impl Future<Output = io::Result<()>> + Send;

    /// Receive the next frame
    fn receive(&mut self) -> impl Future<Output = io::Result<Option<Vec<u8>>>> + Send;

    /// Close the channel, releasing its socket
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// An established tunnel over one candidate.
///
/// Implementations must release their sockets when dropped, so a tunnel
/// abandoned by a cancelled task never outlives it.
pub trait Tunnel: Send + Sync + 'static {
    /// Control channel type carried by this tunnel
    type Channel: ControlChannel;

    /// Candidate this tunnel was established over
    fn candidate(&self) -> ProtocolCandidate;

    /// Open a control channel to the local agent through the tunnel
    fn open_channel(&self) -> impl Future<Output = io::Result<Self::Channel>> + Send;

    /// Tear the tunnel down
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Entry point to the external tunnel implementations
pub trait TransportLayer: Send + Sync + 'static {
    /// Tunnel type produced by this layer
    type Tunnel: Tunnel;

    /// Establish a tunnel over `candidate`, giving up after `timeout`
    fn establish(
        &self,
        candidate: &ProtocolCandidate,
        timeout: Duration,
    ) -> impl Future<Output = Result<Self::Tunnel, EstablishError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!("wireguard-udp".parse::<TransportKind>().unwrap(), TransportKind::WireGuardUdp);
        assert_eq!("Stealth".parse::<TransportKind>().unwrap(), TransportKind::Stealth);
        assert!("ikev3".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_serialized_form_matches_as_str() {
        for kind in TransportKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn test_candidate_display() {
        let candidate = ProtocolCandidate::new(TransportKind::OpenVpnTcp, 443, 4);
        assert_eq!(candidate.to_string(), "openvpn-tcp:443");
        assert!(TransportKind::OpenVpnTcp.is_stream());
        assert!(!TransportKind::WireGuardUdp.is_stream());
    }
}

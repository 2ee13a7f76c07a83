//! Connection Configuration
//!
//! Injected tuning for the connection core: candidate lists, timeouts,
//! backoff, smart-protocol overlap, certificate margin and session polling.
//!
//! # Example
//!
//! ```toml
//! [timeouts]
//! candidate_ms = 5000
//! connection_ms = 30000
//!
//! [backoff]
//! max_retries = 3
//!
//! [smart]
//! overlap = true
//! overlap_lead_ms = 3000
//!
//! [[candidates]]
//! kind = "wireguard-udp"
//! port = 51820
//! priority = 0
//! ```

use crate::backoff::BackoffPolicy;
use crate::connector::{ConnectPolicy, OverlapConfig};
use crate::session::SessionConfig;
use crate::settings::ProtocolPreference;
use crate::transport::{ProtocolCandidate, TransportKind};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Timeouts, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Per-candidate tunnel attempt
    #[serde(default = "default_candidate_ms")]
    pub candidate_ms: u64,
    /// Agent authentication round trip
    #[serde(default = "default_handshake_ms")]
    pub handshake_ms: u64,
    /// User connect to `Connected`
    #[serde(default = "default_connection_ms")]
    pub connection_ms: u64,
    /// Time cancelled work gets to unwind before it is aborted
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
}

fn default_candidate_ms() -> u64 {
    5_000
}

fn default_handshake_ms() -> u64 {
    10_000
}

fn default_connection_ms() -> u64 {
    30_000
}

fn default_cancel_grace_ms() -> u64 {
    2_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            candidate_ms: default_candidate_ms(),
            handshake_ms: default_handshake_ms(),
            connection_ms: default_connection_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
        }
    }
}

/// Smart-protocol overlap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartConfig {
    /// Overlap attempts; `false` means strict in-order fallback
    #[serde(default = "default_true")]
    pub overlap: bool,
    /// Next candidate starts this long before the running one times out
    #[serde(default = "default_overlap_lead_ms")]
    pub overlap_lead_ms: u64,
    /// Cap on concurrent attempts
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_true() -> bool {
    true
}

fn default_overlap_lead_ms() -> u64 {
    3_000
}

fn default_max_in_flight() -> usize {
    2
}

impl Default for SmartConfig {
    fn default() -> Self {
        Self {
            overlap: true,
            overlap_lead_ms: default_overlap_lead_ms(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

/// Certificate handling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateConfig {
    /// Renew once less than this much validity is left
    #[serde(default = "default_renewal_margin_secs")]
    pub renewal_margin_secs: u64,
}

fn default_renewal_margin_secs() -> u64 {
    3_600
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            renewal_margin_secs: default_renewal_margin_secs(),
        }
    }
}

/// Agent session tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTuning {
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_status_interval_ms() -> u64 {
    30_000
}

fn default_event_buffer() -> usize {
    32
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            status_interval_ms: default_status_interval_ms(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// Complete connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub backoff: BackoffPolicy,
    #[serde(default)]
    pub smart: SmartConfig,
    /// Candidates in smart order. Placeholders by default.
    #[serde(default = "default_candidates")]
    pub candidates: Vec<ProtocolCandidate>,
    #[serde(default)]
    pub certificate: CertificateConfig,
    #[serde(default)]
    pub session: SessionTuning,
}

fn default_candidates() -> Vec<ProtocolCandidate> {
    vec![
        ProtocolCandidate::new(TransportKind::WireGuardUdp, 51820, 0),
        ProtocolCandidate::new(TransportKind::WireGuardTcp, 443, 1),
        ProtocolCandidate::new(TransportKind::Stealth, 443, 2),
        ProtocolCandidate::new(TransportKind::OpenVpnUdp, 1194, 3),
        ProtocolCandidate::new(TransportKind::OpenVpnTcp, 443, 4),
    ]
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            backoff: BackoffPolicy::default(),
            smart: SmartConfig::default(),
            candidates: default_candidates(),
            certificate: CertificateConfig::default(),
            session: SessionTuning::default(),
        }
    }
}

impl ConnectionConfig {
    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Load from JSON file
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_json(&content)
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Load by file extension (`.toml` or `.json`) and validate
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_file(path)?,
            Some("json") => Self::from_json_file(path)?,
            _ => return Err(ConfigError::UnsupportedFormat),
        };
        config.validate()?;
        Ok(config)
    }

    /// Export as TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Export as JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.candidates.is_empty() {
            return Err(ConfigError::NoCandidates);
        }
        if let Some(candidate) = self.candidates.iter().find(|c| c.port == 0) {
            return Err(ConfigError::InvalidPort(candidate.kind));
        }

        let timeouts = [
            ("candidate_ms", self.timeouts.candidate_ms),
            ("handshake_ms", self.timeouts.handshake_ms),
            ("connection_ms", self.timeouts.connection_ms),
            ("status_interval_ms", self.session.status_interval_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroTimeout(*name));
        }

        if self.smart.overlap
            && (self.smart.max_in_flight == 0 || self.smart.overlap_lead_ms >= self.timeouts.candidate_ms)
        {
            return Err(ConfigError::InvalidOverlap);
        }

        let backoff = &self.backoff;
        if backoff.initial_ms == 0 || backoff.max_interval_ms < backoff.initial_ms {
            return Err(ConfigError::InvalidBackoff("interval bounds".into()));
        }
        if backoff.multiplier.is_nan() || backoff.multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoff("multiplier below 1".into()));
        }
        if !(0.0..=1.0).contains(&backoff.jitter) {
            return Err(ConfigError::InvalidBackoff("jitter outside 0..=1".into()));
        }

        Ok(())
    }

    /// Candidates to try for a preference.
    ///
    /// Smart expands to every configured candidate; a specific transport to
    /// the first configured candidate of that kind, or nothing.
    pub fn candidates_for(&self, preference: ProtocolPreference) -> Vec<ProtocolCandidate> {
        let mut candidates = self.candidates.clone();
        candidates.sort_by_key(|c| c.priority);
        match preference {
            ProtocolPreference::Smart => candidates,
            ProtocolPreference::Specific(kind) => candidates.into_iter().filter(|c| c.kind == kind).take(1).collect(),
        }
    }

    /// Connector policy for a preference
    pub fn policy_for(&self, preference: ProtocolPreference) -> ConnectPolicy {
        match preference {
            ProtocolPreference::Smart if self.smart.overlap => ConnectPolicy::Smart(OverlapConfig {
                lead: Duration::from_millis(self.smart.overlap_lead_ms),
                max_in_flight: self.smart.max_in_flight,
            }),
            _ => ConnectPolicy::Sequential,
        }
    }

    pub fn candidate_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.candidate_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.connection_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.timeouts.cancel_grace_ms)
    }

    pub fn renewal_margin(&self) -> Duration {
        Duration::from_secs(self.certificate.renewal_margin_secs)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            handshake_timeout: Duration::from_millis(self.timeouts.handshake_ms),
            status_interval: Duration::from_millis(self.session.status_interval_ms),
            event_buffer: self.session.event_buffer,
            close_grace: self.cancel_grace(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Unsupported config format")]
    UnsupportedFormat,

    #[error("No protocol candidates configured")]
    NoCandidates,

    #[error("Invalid port for {0} candidate")]
    InvalidPort(TransportKind),

    #[error("Timeout {0} must be non-zero")]
    ZeroTimeout(&'static str),

    #[error("Overlap lead must be shorter than the candidate timeout, with at least one attempt in flight")]
    InvalidOverlap,

    #[error("Invalid backoff: {0}")]
    InvalidBackoff(String),
}

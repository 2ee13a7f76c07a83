//! Local Agent Wire Protocol
//!
//! One JSON object per control-channel frame, internally tagged by `type`:
//!
//! ```text
//! client → agent   authenticate | set-features | get-status | close
//! agent  → client  auth-ok | auth-rejected | features-ack | status
//!                  | certificate-expiring | error | closing
//! ```

use crate::features::FeatureFlagSet;
use serde::{Deserialize, Serialize};

/// Messages sent to the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Authenticate {
        certificate: String,
        public_key: String,
    },
    SetFeatures {
        features: FeatureFlagSet,
    },
    GetStatus,
    Close,
}

/// Messages received from the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AgentMessage {
    AuthOk,
    AuthRejected {
        reason: RejectReason,
    },
    FeaturesAck {
        features: FeatureFlagSet,
    },
    Status {
        stats: AgentStats,
    },
    CertificateExpiring,
    Error {
        reason: RejectReason,
    },
    Closing {
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Why the agent refused or revoked authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    CertificateExpired,
    CertificateRevoked,
    CertificateMissing,
    KeyReused,
    SessionLimitReached,
    PlanRestricted,
    ServerError,
    #[serde(other)]
    Unknown,
}

/// How the credentials are refreshed before reconnecting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconnectStrategy {
    /// Reuse the current certificate
    ExistingCertificate,
    /// Purge the certificate and request a new one
    NewCertificate,
    /// Regenerate keys, then request a new certificate
    NewKeysAndCertificate,
}

/// Recovery action called for by a [`RejectReason`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    Ignore,
    Disconnect,
    Reconnect(ReconnectStrategy),
}

impl RejectReason {
    pub fn resolution(self) -> Resolution {
        use ReconnectStrategy::*;
        match self {
            RejectReason::CertificateExpired
            | RejectReason::CertificateRevoked
            | RejectReason::CertificateMissing => Resolution::Reconnect(NewCertificate),
            RejectReason::KeyReused => Resolution::Reconnect(NewKeysAndCertificate),
            RejectReason::ServerError => Resolution::Reconnect(ExistingCertificate),
            RejectReason::SessionLimitReached | RejectReason::PlanRestricted => Resolution::Disconnect,
            RejectReason::Unknown => Resolution::Ignore,
        }
    }

    /// Does recovery require a new certificate?
    pub fn is_certificate_related(self) -> bool {
        matches!(
            self.resolution(),
            Resolution::Reconnect(ReconnectStrategy::NewCertificate | ReconnectStrategy::NewKeysAndCertificate)
        )
    }
}

/// NetShield statistics reported by the agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetShieldStats {
    #[serde(default)]
    pub ads_blocked: u64,
    #[serde(default)]
    pub trackers_stopped: u64,
    #[serde(default)]
    pub bytes_saved: u64,
}

/// Session status reported by the agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    #[serde(default)]
    pub netshield: NetShieldStats,
    /// Features currently applied, when the agent reports them
    #[serde(default)]
    pub features: Option<FeatureFlagSet>,
}

/// Frame codec errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(frame)?)
    }
}

impl AgentMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(frame)?)
    }
}

//! agentlink - VPN connection core
//!
//! Establishes a tunnel over the best available transport, authenticates to
//! the local agent with a client certificate, keeps the agent's feature set
//! in step with user settings, and drives the whole lifecycle through one
//! state machine.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  ConnectionStateMachine (actor)               │
//! │                                                               │
//! │  Machine (pure) ──effects──▶ SmartConnector ──▶ ProtocolProbe │──▶ TransportLayer
//! │       ▲                      AgentSession ────────────────────│──▶ local agent
//! │       │                      CertificateStore ────────────────│──▶ CertificateIssuer
//! │   inputs                     KillSwitch ──────────────────────│──▶ TrafficFilter
//! │                                                               │
//! │  SettingsSnapshot (watch) ──▶ FeatureNegotiator ──▶ session   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Smart protocol**: overlapping candidate attempts, first success wins
//! - **Single-flight renewal**: concurrent callers share one issuer request
//! - **Kill switch**: fail-closed rule ordering around every transition
//! - **Bounded reconnection**: exponential backoff with jitter
//!
//! The [`sim`] module provides in-process stand-ins for the transport,
//! agent, issuer and filter.

mod actor;
mod backoff;
mod certificate;
mod config;
mod connector;
mod features;
mod keys;
mod kill_switch;
mod machine;
mod probe;
mod protocol;
mod session;
mod settings;
mod transport;

pub mod sim;

pub use actor::{ConnectionHandle, ConnectionStateMachine, HandleError, Transition};
pub use backoff::BackoffPolicy;
pub use certificate::{
    CertificateIssuer, CertificateStatus, CertificateStore, ClientCertificate, Credentials,
    IssueError, IssuedCertificate, RenewalError,
};
pub use config::{
    CertificateConfig, ConfigError, ConnectionConfig, SessionTuning, SmartConfig, TimeoutConfig,
};
pub use connector::{
    CandidateFailure, ConnectError, ConnectPolicy, Established, NoCandidateSucceeded,
    OverlapConfig, SmartConnector,
};
pub use features::{FeatureError, FeatureFlagSet, FeatureKey, FeatureNegotiator, FeatureValue};
pub use keys::{KeyError, KeyPair, PrivateKey, PublicKey};
pub use kill_switch::{BlockingRule, FilterError, KillSwitch, TrafficFilter, TransitionPlan};
pub use machine::{ConnectionState, Effect, ErrorKind, Input, Machine, Step};
pub use probe::{ProbeError, ProtocolProbe};
pub use protocol::{
    AgentMessage, AgentStats, ClientMessage, NetShieldStats, ProtocolError, ReconnectStrategy,
    RejectReason, Resolution,
};
pub use session::{
    AgentEvent, AgentEvents, AgentSession, CloseReason, HandshakeError, SessionConfig,
    SessionError,
};
pub use settings::{NetShieldLevel, ProtocolPreference, SettingsSnapshot};
pub use transport::{
    ControlChannel, EstablishError, ProtocolCandidate, TransportKind, TransportLayer, Tunnel,
    UnknownTransport,
};

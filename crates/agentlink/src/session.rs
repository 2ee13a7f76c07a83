//! Agent Session
//!
//! Authenticated control channel to the local agent.
//!
//! # Lifecycle
//!
//! ```text
//! open(tunnel, credentials, features, config)
//!   ├─ open control channel
//!   ├─ send `authenticate`, await `auth-ok` (bounded)
//!   └─ spawn pump ──▶ pushes features, polls status, forwards agent events
//!
//! close() / drop ──▶ cancel pump ──▶ channel closed ──▶ ChannelClosed (last event)
//! ```
//!
//! The pump owns the channel, so the channel is released on every exit path.

use crate::certificate::Credentials;
use crate::features::FeatureFlagSet;
use crate::protocol::{AgentMessage, AgentStats, ClientMessage, RejectReason};
use crate::transport::{ControlChannel, Tunnel};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shortest period between `get-status` polls
const MIN_STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on the authentication round trip
    pub handshake_timeout: Duration,
    /// Period of `get-status` polls
    pub status_interval: Duration,
    /// Capacity of the event queue
    pub event_buffer: usize,
    /// Time the pump gets to unwind on close
    pub close_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            status_interval: Duration::from_secs(30),
            event_buffer: 32,
            close_grace: Duration::from_secs(2),
        }
    }
}

/// Handshake errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("Agent did not answer in time")]
    TimedOut,

    #[error("Authentication rejected: {0:?}")]
    Rejected(RejectReason),

    #[error("Control channel closed")]
    TransportClosed,
}

/// Session errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("No open session")]
    NotConnected,
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed locally
    Requested,
    /// The agent said goodbye or hung up
    ClosedByAgent(Option<String>),
    /// The channel failed
    TransportLost(String),
}

/// Notification from the agent
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    FeaturesAcknowledged(FeatureFlagSet),
    StatusUpdate(AgentStats),
    CertificateExpiringSoon,
    AuthenticationFailed(RejectReason),
    /// Always the last event of a session
    ChannelClosed(CloseReason),
}

/// Ordered stream of [`AgentEvent`]s for one session
#[derive(Debug)]
pub struct AgentEvents {
    rx: mpsc::Receiver<AgentEvent>,
}

impl AgentEvents {
    /// Next event, `None` after `ChannelClosed` has been delivered
    pub async fn next(&mut self) -> Option<AgentEvent> {
        self.rx.recv().await
    }
}

/// Open, authenticated session
#[derive(Debug)]
pub struct AgentSession {
    features: watch::Sender<FeatureFlagSet>,
    cancel: CancellationToken,
    pump: Option<JoinHandle<()>>,
    close_grace: Duration,
}

impl AgentSession {
    /// Authenticate over `tunnel` and start the session.
    ///
    /// `features` is pushed as soon as the handshake completes.
    pub async fn open<T: Tunnel>(
        tunnel: &T,
        credentials: &Credentials,
        features: FeatureFlagSet,
        config: &SessionConfig,
    ) -> Result<(AgentSession, AgentEvents), HandshakeError> {
        let mut channel = tunnel.open_channel().await.map_err(|err| {
            warn!(error = %err, "Failed to open control channel");
            HandshakeError::TransportClosed
        })?;

        let outcome = tokio::time::timeout(
            config.handshake_timeout,
            authenticate(&mut channel, credentials),
        )
        .await
        .unwrap_or(Err(HandshakeError::TimedOut));

        if let Err(err) = outcome {
            warn!(error = %err, "Agent handshake failed");
            channel.close().await;
            return Err(err);
        }

        info!(candidate = %tunnel.candidate(), "Agent session authenticated");

        let (features_tx, mut features_rx) = watch::channel(features);
        features_rx.mark_changed();
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let cancel = CancellationToken::new();

        let pump = tokio::spawn(pump(
            channel,
            features_rx,
            events_tx,
            cancel.clone(),
            config.status_interval.max(MIN_STATUS_INTERVAL),
        ));

        Ok((
            AgentSession {
                features: features_tx,
                cancel,
                pump: Some(pump),
                close_grace: config.close_grace,
            },
            AgentEvents { rx: events_rx },
        ))
    }

    /// Replace the feature set to push.
    ///
    /// Sets replaced before the pump sends them are never sent; a set equal
    /// to the last one sent is not sent again.
    pub fn update_features(&self, features: FeatureFlagSet) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::NotConnected);
        }
        self.features
            .send(features)
            .map_err(|_| SessionError::NotConnected)
    }

    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && !self.features.is_closed()
    }

    /// Close the session and wait for the channel to be released
    pub async fn close(mut self) {
        self.cancel.cancel();
        let Some(pump) = self.pump.take() else {
            return;
        };

        let abort = pump.abort_handle();
        if tokio::time::timeout(self.close_grace, pump).await.is_err() {
            warn!("Session pump did not stop in time, aborting");
            abort.abort();
        }
    }
}

impl Drop for AgentSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn send_message<C: ControlChannel>(channel: &mut C, message: &ClientMessage) -> std::io::Result<()> {
    let frame = message
        .encode()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    channel.send(frame).await
}

async fn authenticate<C: ControlChannel>(
    channel: &mut C,
    credentials: &Credentials,
) -> Result<(), HandshakeError> {
    let hello = ClientMessage::Authenticate {
        certificate: credentials.certificate.body.clone(),
        public_key: credentials.keys.public.to_base64(),
    };
    send_message(channel, &hello)
        .await
        .map_err(|_| HandshakeError::TransportClosed)?;

    loop {
        let frame = match channel.receive().await {
            Ok(Some(frame)) => frame,
            Ok(None) | Err(_) => return Err(HandshakeError::TransportClosed),
        };

        match AgentMessage::decode(&frame) {
            Ok(AgentMessage::AuthOk) => return Ok(()),
            Ok(AgentMessage::AuthRejected { reason }) | Ok(AgentMessage::Error { reason }) => {
                return Err(HandshakeError::Rejected(reason));
            }
            Ok(AgentMessage::Closing { .. }) => return Err(HandshakeError::TransportClosed),
            Ok(other) => debug!(message = ?other, "Ignoring message before authentication"),
            Err(err) => warn!(error = %err, "Ignoring malformed frame"),
        }
    }
}

fn event_for(message: AgentMessage) -> Option<AgentEvent> {
    match message {
        AgentMessage::FeaturesAck { features } => Some(AgentEvent::FeaturesAcknowledged(features)),
        AgentMessage::Status { stats } => Some(AgentEvent::StatusUpdate(stats)),
        AgentMessage::CertificateExpiring => Some(AgentEvent::CertificateExpiringSoon),
        AgentMessage::AuthRejected { reason } | AgentMessage::Error { reason } => {
            Some(AgentEvent::AuthenticationFailed(reason))
        }
        AgentMessage::AuthOk | AgentMessage::Closing { .. } => None,
    }
}

async fn pump<C: ControlChannel>(
    mut channel: C,
    mut features: watch::Receiver<FeatureFlagSet>,
    events: mpsc::Sender<AgentEvent>,
    cancel: CancellationToken,
    status_interval: Duration,
) {
    let mut last_sent: Option<FeatureFlagSet> = None;
    let mut status = tokio::time::interval_at(Instant::now() + status_interval, status_interval);
    status.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break CloseReason::Requested,

            changed = features.changed() => {
                if changed.is_err() {
                    break CloseReason::Requested;
                }
                let set = features.borrow_and_update().clone();
                if last_sent.as_ref() == Some(&set) {
                    debug!("Feature set unchanged, not pushing");
                    continue;
                }
                if let Err(err) = send_message(&mut channel, &ClientMessage::SetFeatures { features: set.clone() }).await {
                    break CloseReason::TransportLost(err.to_string());
                }
                debug!(flags = set.len(), "Pushed feature set");
                last_sent = Some(set);
            }

            frame = channel.receive() => {
                let frame = match frame {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break CloseReason::ClosedByAgent(None),
                    Err(err) => break CloseReason::TransportLost(err.to_string()),
                };
                let message = match AgentMessage::decode(&frame) {
                    Ok(AgentMessage::Closing { reason }) => break CloseReason::ClosedByAgent(reason),
                    Ok(message) => message,
                    Err(err) => {
                        warn!(error = %err, "Ignoring malformed frame");
                        continue;
                    }
                };
                let Some(event) = event_for(message) else {
                    continue;
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break CloseReason::Requested,
                    sent = events.send(event) => if sent.is_err() {
                        break CloseReason::Requested;
                    },
                }
            }

            _ = status.tick() => {
                if let Err(err) = send_message(&mut channel, &ClientMessage::GetStatus).await {
                    break CloseReason::TransportLost(err.to_string());
                }
            }
        }
    };

    if reason == CloseReason::Requested {
        let _ = send_message(&mut channel, &ClientMessage::Close).await;
    }
    channel.close().await;
    info!(reason = ?reason, "Agent session closed");
    let _ = events.send(AgentEvent::ChannelClosed(reason)).await;
}

//! In-process simulation of the external collaborators.
//!
//! Stand-ins for the transport implementations, the local agent, the
//! certificate issuer and the platform traffic filter. Used by the test
//! suite and by the `agentlink-sim` driver.
//!
//! Every handle is cheap to clone and shares its state, so a test can keep
//! one copy for inspection while the code under test owns another.

use crate::certificate::{CertificateIssuer, IssueError, IssuedCertificate};
use crate::features::FeatureFlagSet;
use crate::keys::PublicKey;
use crate::kill_switch::{BlockingRule, FilterError, TrafficFilter};
use crate::protocol::{AgentMessage, AgentStats, ClientMessage, NetShieldStats, RejectReason};
use crate::transport::{ControlChannel, EstablishError, ProtocolCandidate, Tunnel, TransportKind, TransportLayer};
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Agent
// ============================================================================

#[derive(Default)]
struct AgentState {
    rejections: Option<(u32, RejectReason)>,
    silent: bool,
    stats: NetShieldStats,
    handshakes: u32,
    status_requests: u32,
    feature_pushes: Vec<FeatureFlagSet>,
    connections: HashMap<u64, AgentConnection>,
    next_id: u64,
}

struct AgentConnection {
    to_client: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
}

/// Simulated local agent
#[derive(Clone, Default)]
pub struct SimAgent {
    state: Arc<Mutex<AgentState>>,
    live: Arc<AtomicUsize>,
}

impl SimAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `count` handshakes with `reason`
    pub fn reject_next(&self, count: u32, reason: RejectReason) {
        lock(&self.state).rejections = (count > 0).then_some((count, reason));
    }

    /// Stop answering anything
    pub fn set_silent(&self, silent: bool) {
        lock(&self.state).silent = silent;
    }

    pub fn set_stats(&self, stats: NetShieldStats) {
        lock(&self.state).stats = stats;
    }

    /// Handshakes received, rejected ones included
    pub fn handshakes(&self) -> u32 {
        lock(&self.state).handshakes
    }

    pub fn feature_pushes(&self) -> Vec<FeatureFlagSet> {
        lock(&self.state).feature_pushes.clone()
    }

    pub fn status_requests(&self) -> u32 {
        lock(&self.state).status_requests
    }

    /// Channels opened by clients and not yet closed
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Send an unsolicited message on every open connection
    pub fn push(&self, message: AgentMessage) {
        let Ok(frame) = message.encode() else {
            return;
        };
        for connection in lock(&self.state).connections.values() {
            let _ = connection.to_client.send(frame.clone());
        }
    }

    /// Drop every open connection from the agent side
    pub fn drop_connections(&self) {
        let dropped: Vec<AgentConnection> = lock(&self.state).connections.drain().map(|(_, c)| c).collect();
        debug!(count = dropped.len(), "Simulated agent dropping connections");
        for connection in dropped {
            connection.cancel.cancel();
        }
    }

    fn connect(&self) -> SimChannel {
        let (to_agent, from_client) = mpsc::unbounded_channel();
        let (to_client, from_agent) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let id = {
            let mut state = lock(&self.state);
            let id = state.next_id;
            state.next_id += 1;
            state.connections.insert(
                id,
                AgentConnection {
                    to_client: to_client.clone(),
                    cancel: cancel.clone(),
                },
            );
            id
        };

        tokio::spawn(self.clone().serve(id, from_client, to_client, cancel));
        self.live.fetch_add(1, Ordering::SeqCst);

        SimChannel {
            tx: Some(to_agent),
            rx: from_agent,
            live: Arc::clone(&self.live),
            released: false,
        }
    }

    async fn serve(
        self,
        id: u64,
        mut from_client: mpsc::UnboundedReceiver<Vec<u8>>,
        to_client: mpsc::UnboundedSender<Vec<u8>>,
        cancel: CancellationToken,
    ) {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = from_client.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let message = match ClientMessage::decode(&frame) {
                Ok(message) => message,
                Err(err) => {
                    debug!(error = %err, "Simulated agent ignoring malformed frame");
                    continue;
                }
            };
            trace!(?message, "Simulated agent received");

            if matches!(message, ClientMessage::Close) {
                break;
            }
            if let Some(reply) = self.reply_to(message) {
                if let Ok(frame) = reply.encode() {
                    let _ = to_client.send(frame);
                }
            }
        }

        lock(&self.state).connections.remove(&id);
    }

    fn reply_to(&self, message: ClientMessage) -> Option<AgentMessage> {
        let mut state = lock(&self.state);
        if let ClientMessage::Authenticate { .. } = message {
            state.handshakes += 1;
        }
        if state.silent {
            return None;
        }

        match message {
            ClientMessage::Authenticate { .. } => match state.rejections {
                Some((remaining, reason)) => {
                    state.rejections = (remaining > 1).then_some((remaining - 1, reason));
                    Some(AgentMessage::AuthRejected { reason })
                }
                None => Some(AgentMessage::AuthOk),
            },
            ClientMessage::SetFeatures { features } => {
                state.feature_pushes.push(features.clone());
                Some(AgentMessage::FeaturesAck { features })
            }
            ClientMessage::GetStatus => {
                state.status_requests += 1;
                Some(AgentMessage::Status {
                    stats: AgentStats {
                        netshield: state.stats,
                        features: state.feature_pushes.last().cloned(),
                    },
                })
            }
            ClientMessage::Close => None,
        }
    }
}

/// Client end of a simulated control channel
pub struct SimChannel {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    live: Arc<AtomicUsize>,
    released: bool,
}

impl SimChannel {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl ControlChannel for SimChannel {
    async fn send(&mut self, frame: Vec<u8>) -> io::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "channel closed"))?;
        tx.send(frame)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "agent went away"))
    }

    async fn receive(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) {
        self.tx = None;
        self.rx.close();
        self.release();
    }
}

impl Drop for SimChannel {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// Transport layer
// ============================================================================

/// Scripted result of establishing a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Succeed,
    Refuse,
    Unreachable,
    /// Never answers; the attempt runs into its timeout
    Hang,
}

#[derive(Default)]
struct LayerState {
    outcomes: HashMap<TransportKind, (ProbeOutcome, Duration)>,
    attempts: Vec<ProtocolCandidate>,
    closed: Vec<TransportKind>,
}

/// Simulated transport layer whose tunnels lead to a [`SimAgent`]
#[derive(Clone)]
pub struct SimulatedLayer {
    agent: SimAgent,
    state: Arc<Mutex<LayerState>>,
    live: Arc<AtomicUsize>,
}

impl SimulatedLayer {
    /// Every kind succeeds immediately until told otherwise
    pub fn new(agent: SimAgent) -> Self {
        Self {
            agent,
            state: Arc::default(),
            live: Arc::default(),
        }
    }

    /// Script the outcome for `kind`, reported after `delay`
    pub fn set_outcome(&self, kind: TransportKind, outcome: ProbeOutcome, delay: Duration) {
        lock(&self.state).outcomes.insert(kind, (outcome, delay));
    }

    pub fn agent(&self) -> &SimAgent {
        &self.agent
    }

    /// Candidates attempted so far, in order
    pub fn attempts(&self) -> Vec<ProtocolCandidate> {
        lock(&self.state).attempts.clone()
    }

    /// Tunnels established and not yet closed
    pub fn live_tunnels(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Kinds of the tunnels closed so far, in order
    pub fn closed_tunnels(&self) -> Vec<TransportKind> {
        lock(&self.state).closed.clone()
    }
}

impl TransportLayer for SimulatedLayer {
    type Tunnel = SimTunnel;

    async fn establish(&self, candidate: &ProtocolCandidate, timeout: Duration) -> Result<SimTunnel, EstablishError> {
        let (outcome, delay) = {
            let mut state = lock(&self.state);
            state.attempts.push(*candidate);
            state
                .outcomes
                .get(&candidate.kind)
                .copied()
                .unwrap_or((ProbeOutcome::Succeed, Duration::ZERO))
        };

        if outcome == ProbeOutcome::Hang || delay >= timeout {
            tokio::time::sleep(timeout).await;
            return Err(EstablishError::TimedOut);
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match outcome {
            ProbeOutcome::Refuse => Err(EstablishError::Refused),
            ProbeOutcome::Unreachable => Err(EstablishError::Unreachable),
            ProbeOutcome::Hang => Err(EstablishError::TimedOut),
            ProbeOutcome::Succeed => {
                self.live.fetch_add(1, Ordering::SeqCst);
                debug!(candidate = %candidate, "Simulated tunnel up");
                Ok(SimTunnel {
                    candidate: *candidate,
                    agent: self.agent.clone(),
                    layer: Arc::clone(&self.state),
                    live: Arc::clone(&self.live),
                    closed: AtomicBool::new(false),
                })
            }
        }
    }
}

/// Tunnel produced by [`SimulatedLayer`]
pub struct SimTunnel {
    candidate: ProtocolCandidate,
    agent: SimAgent,
    layer: Arc<Mutex<LayerState>>,
    live: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl std::fmt::Debug for SimTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimTunnel")
            .field("candidate", &self.candidate)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl SimTunnel {
    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            lock(&self.layer).closed.push(self.candidate.kind);
            debug!(candidate = %self.candidate, "Simulated tunnel closed");
        }
    }
}

impl Tunnel for SimTunnel {
    type Channel = SimChannel;

    fn candidate(&self) -> ProtocolCandidate {
        self.candidate
    }

    async fn open_channel(&self) -> io::Result<SimChannel> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "tunnel closed"));
        }
        Ok(self.agent.connect())
    }

    async fn close(&self) {
        self.mark_closed();
    }
}

impl Drop for SimTunnel {
    fn drop(&mut self) {
        self.mark_closed();
    }
}

// ============================================================================
// Traffic filter
// ============================================================================

/// Operation applied to a [`RecordingFilter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Install { allow_lan: bool },
    Remove,
}

#[derive(Default)]
struct FilterState {
    ops: Vec<FilterOp>,
    installed: Option<BlockingRule>,
    failing: bool,
}

/// Traffic filter that records the rules applied to it
#[derive(Clone, Default)]
pub struct RecordingFilter {
    state: Arc<Mutex<FilterState>>,
}

impl RecordingFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful operations, in order
    pub fn ops(&self) -> Vec<FilterOp> {
        lock(&self.state).ops.clone()
    }

    pub fn installed(&self) -> Option<BlockingRule> {
        lock(&self.state).installed
    }

    /// Would traffic to `addr` pass right now?
    pub fn permits(&self, addr: IpAddr) -> bool {
        lock(&self.state).installed.is_none_or(|rule| rule.permits(addr))
    }

    /// Make every operation fail
    pub fn set_failing(&self, failing: bool) {
        lock(&self.state).failing = failing;
    }
}

impl TrafficFilter for RecordingFilter {
    async fn install_blocking_rule(&self, allow_lan: bool) -> Result<(), FilterError> {
        let mut state = lock(&self.state);
        if state.failing {
            return Err(FilterError::Unavailable("simulated filter failure".into()));
        }
        state.ops.push(FilterOp::Install { allow_lan });
        state.installed = Some(BlockingRule { allow_lan });
        Ok(())
    }

    async fn remove_blocking_rule(&self) -> Result<(), FilterError> {
        let mut state = lock(&self.state);
        if state.failing {
            return Err(FilterError::Unavailable("simulated filter failure".into()));
        }
        state.ops.push(FilterOp::Remove);
        state.installed = None;
        Ok(())
    }
}

// ============================================================================
// Issuer
// ============================================================================

/// Certificate issuer that signs locally
#[derive(Clone)]
pub struct LocalIssuer {
    validity: Duration,
    latency: Duration,
    failure: Arc<Mutex<Option<IssueError>>>,
    issued: Arc<AtomicU64>,
}

impl LocalIssuer {
    /// Issue certificates valid for `validity`
    pub fn new(validity: Duration) -> Self {
        Self {
            validity,
            latency: Duration::ZERO,
            failure: Arc::default(),
            issued: Arc::default(),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail every request with `failure`, or succeed again with `None`
    pub fn fail_with(&self, failure: Option<IssueError>) {
        *lock(&self.failure) = failure;
    }

    /// Requests received
    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }
}

impl CertificateIssuer for LocalIssuer {
    async fn issue(&self, public_key: &PublicKey) -> Result<IssuedCertificate, IssueError> {
        let serial = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let fingerprint = public_key.fingerprint();

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(err) = lock(&self.failure).clone() {
            return Err(err);
        }

        Ok(IssuedCertificate {
            body: format!("sim-cert:{serial}:{fingerprint}"),
            not_after: SystemTime::now() + self.validity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_layer_scripts_outcomes() {
        let layer = SimulatedLayer::new(SimAgent::new());
        layer.set_outcome(TransportKind::Stealth, ProbeOutcome::Refuse, Duration::from_millis(10));
        let timeout = Duration::from_secs(1);

        let stealth = ProtocolCandidate::new(TransportKind::Stealth, 443, 0);
        assert!(matches!(layer.establish(&stealth, timeout).await, Err(EstablishError::Refused)));

        let wireguard = ProtocolCandidate::new(TransportKind::WireGuardUdp, 51820, 0);
        let tunnel = layer.establish(&wireguard, timeout).await.unwrap();
        assert_eq!(layer.live_tunnels(), 1);

        drop(tunnel);
        assert_eq!(layer.live_tunnels(), 0);
        assert_eq!(layer.closed_tunnels(), vec![TransportKind::WireGuardUdp]);
        assert_eq!(layer.attempts(), vec![stealth, wireguard]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_success_times_out() {
        let layer = SimulatedLayer::new(SimAgent::new());
        layer.set_outcome(TransportKind::OpenVpnTcp, ProbeOutcome::Succeed, Duration::from_secs(2));

        let candidate = ProtocolCandidate::new(TransportKind::OpenVpnTcp, 443, 0);
        let result = layer.establish(&candidate, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(EstablishError::TimedOut)));
        assert_eq!(layer.live_tunnels(), 0);
    }

    #[tokio::test]
    async fn test_channel_release_is_counted_once() {
        let agent = SimAgent::new();
        let mut channel = agent.connect();
        assert_eq!(agent.live_connections(), 1);

        channel.close().await;
        channel.close().await;
        drop(channel);
        assert_eq!(agent.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_filter_records_rules() {
        let filter = RecordingFilter::new();
        let wan: IpAddr = "1.1.1.1".parse().unwrap();
        assert!(filter.permits(wan));

        filter.install_blocking_rule(true).await.unwrap();
        assert!(!filter.permits(wan));
        assert!(filter.permits("192.168.0.1".parse().unwrap()));

        filter.set_failing(true);
        assert!(filter.remove_blocking_rule().await.is_err());
        assert_eq!(filter.installed(), Some(BlockingRule { allow_lan: true }));
    }

    #[tokio::test]
    async fn test_issuer_failure_toggle() {
        let issuer = LocalIssuer::new(Duration::from_secs(60));
        let key = crate::keys::KeyPair::generate().public;

        issuer.fail_with(Some(IssueError::Network("offline".into())));
        assert!(issuer.issue(&key).await.is_err());
        issuer.fail_with(None);
        assert!(issuer.issue(&key).await.is_ok());
        assert_eq!(issuer.issued_count(), 2);
    }
}

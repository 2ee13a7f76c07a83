//! Protocol Probe
//!
//! One best-effort tunnel attempt over a single candidate. Retrying and
//! racing belong to [`crate::connector::SmartConnector`].

use crate::transport::{EstablishError, ProtocolCandidate, TransportLayer};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Classified probe failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ProbeError {
    #[error("Timed out")]
    Timeout,

    #[error("Refused")]
    Refused,

    #[error("Unreachable")]
    Unreachable,
}

impl From<EstablishError> for ProbeError {
    fn from(err: EstablishError) -> Self {
        match err {
            EstablishError::Refused => ProbeError::Refused,
            EstablishError::Unreachable => ProbeError::Unreachable,
            EstablishError::TimedOut => ProbeError::Timeout,
            EstablishError::Io(err) => match err.kind() {
                io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => ProbeError::Refused,
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ProbeError::Timeout,
                _ => ProbeError::Unreachable,
            },
        }
    }
}

/// Single tunnel attempt
pub struct ProtocolProbe<L> {
    layer: Arc<L>,
}

impl<L> Clone for ProtocolProbe<L> {
    fn clone(&self) -> Self {
        Self {
            layer: Arc::clone(&self.layer),
        }
    }
}

impl<L: TransportLayer> ProtocolProbe<L> {
    pub fn new(layer: Arc<L>) -> Self {
        Self { layer }
    }

    /// Try to establish a tunnel over `candidate` within `timeout`
    pub async fn attempt(
        &self,
        candidate: &ProtocolCandidate,
        timeout: Duration,
    ) -> Result<L::Tunnel, ProbeError> {
        debug!(%candidate, timeout_ms = timeout.as_millis() as u64, "Probing candidate");

        let result = match tokio::time::timeout(timeout, self.layer.establish(candidate, timeout)).await {
            Ok(Ok(tunnel)) => Ok(tunnel),
            Ok(Err(err)) => Err(ProbeError::from(err)),
            Err(_) => Err(ProbeError::Timeout),
        };

        match &result {
            Ok(_) => debug!(%candidate, "Candidate established"),
            Err(err) => debug!(%candidate, error = %err, "Candidate failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ProbeOutcome, SimAgent, SimulatedLayer};
    use crate::transport::TransportKind;

    fn probe(layer: &SimulatedLayer) -> ProtocolProbe<SimulatedLayer> {
        ProtocolProbe::new(Arc::new(layer.clone()))
    }

    #[test]
    fn test_io_errors_are_classified() {
        let refused = EstablishError::Io(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(ProbeError::from(refused), ProbeError::Refused);

        let timed_out = EstablishError::Io(io::Error::from(io::ErrorKind::TimedOut));
        assert_eq!(ProbeError::from(timed_out), ProbeError::Timeout);

        let other = EstablishError::Io(io::Error::other("no route"));
        assert_eq!(ProbeError::from(other), ProbeError::Unreachable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_outcomes() {
        let layer = SimulatedLayer::new(SimAgent::new());
        layer.set_outcome(TransportKind::WireGuardUdp, ProbeOutcome::Refuse, Duration::ZERO);
        layer.set_outcome(TransportKind::Stealth, ProbeOutcome::Unreachable, Duration::ZERO);
        let probe = probe(&layer);
        let timeout = Duration::from_secs(1);

        let wg = ProtocolCandidate::new(TransportKind::WireGuardUdp, 51820, 0);
        assert_eq!(probe.attempt(&wg, timeout).await.err(), Some(ProbeError::Refused));

        let stealth = ProtocolCandidate::new(TransportKind::Stealth, 443, 0);
        assert_eq!(probe.attempt(&stealth, timeout).await.err(), Some(ProbeError::Unreachable));

        let tcp = ProtocolCandidate::new(TransportKind::WireGuardTcp, 443, 0);
        assert!(probe.attempt(&tcp, timeout).await.is_ok());
        assert_eq!(layer.attempts().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_candidate_times_out() {
        let layer = SimulatedLayer::new(SimAgent::new());
        layer.set_outcome(TransportKind::OpenVpnUdp, ProbeOutcome::Hang, Duration::ZERO);
        let probe = probe(&layer);

        let candidate = ProtocolCandidate::new(TransportKind::OpenVpnUdp, 1194, 0);
        let started = tokio::time::Instant::now();
        assert_eq!(
            probe.attempt(&candidate, Duration::from_millis(750)).await.err(),
            Some(ProbeError::Timeout)
        );
        assert!(started.elapsed() >= Duration::from_millis(750));
    }
}

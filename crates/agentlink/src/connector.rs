//! Smart Connector
//!
//! Finds a working transport among an ordered candidate list.
//!
//! # Smart policy
//!
//! ```text
//! t=0          A ─────────────────────x (timeout)
//! t=T-lead                B ──────────────✓  wins, rest cancelled
//! t=2(T-lead)                        C ───── cancelled
//! ```
//!
//! Candidate N+1 starts `lead` before candidate N times out, or as soon as
//! N fails, with at most `max_in_flight` attempts running. Attempts that
//! complete in the same scheduling turn are ranked by priority.

use crate::probe::{ProbeError, ProtocolProbe};
use crate::transport::{ProtocolCandidate, TransportLayer, Tunnel};
use std::fmt;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Overlap window for the smart policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlapConfig {
    /// How long before a running attempt's timeout the next one starts
    pub lead: Duration,
    /// Upper bound on concurrent attempts
    pub max_in_flight: usize,
}

/// How candidates are tried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPolicy {
    /// Strictly one after another
    Sequential,
    /// Overlapping attempts, first success wins
    Smart(OverlapConfig),
}

/// Why one candidate failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFailure {
    pub candidate: ProtocolCandidate,
    pub error: ProbeError,
}

impl fmt::Display for CandidateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.candidate, self.error)
    }
}

/// Every candidate failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("No candidate succeeded ({} tried)", .failures.len())]
pub struct NoCandidateSucceeded {
    /// Failures in priority order
    pub failures: Vec<CandidateFailure>,
}

/// Connector errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error(transparent)]
    NoCandidateSucceeded(#[from] NoCandidateSucceeded),

    #[error("Connection attempt cancelled")]
    Cancelled,
}

/// Winning tunnel
#[derive(Debug)]
pub struct Established<T> {
    pub candidate: ProtocolCandidate,
    pub tunnel: T,
}

type AttemptResult<T> = (usize, Option<Result<T, ProbeError>>);

/// Multi-candidate connection strategy
pub struct SmartConnector<L> {
    probe: ProtocolProbe<L>,
    candidate_timeout: Duration,
    cancel_grace: Duration,
}

impl<L: TransportLayer> SmartConnector<L> {
    pub fn new(probe: ProtocolProbe<L>, candidate_timeout: Duration, cancel_grace: Duration) -> Self {
        Self {
            probe,
            candidate_timeout,
            cancel_grace,
        }
    }

    /// Connect over the first candidate that works.
    ///
    /// Exactly one tunnel is returned; every other tunnel established along
    /// the way is closed before this returns.
    pub async fn connect(
        &self,
        candidates: &[ProtocolCandidate],
        policy: &ConnectPolicy,
        cancel: &CancellationToken,
    ) -> Result<Established<L::Tunnel>, ConnectError> {
        let mut ordered = candidates.to_vec();
        ordered.sort_by_key(|candidate| candidate.priority);

        let (window, lead) = match policy {
            ConnectPolicy::Sequential => (1, None),
            ConnectPolicy::Smart(overlap) => (overlap.max_in_flight.max(1), Some(overlap.lead)),
        };

        let attempts_cancel = cancel.child_token();
        let mut attempts: JoinSet<AttemptResult<L::Tunnel>> = JoinSet::new();
        let mut failures: Vec<(usize, CandidateFailure)> = Vec::new();
        let mut next = 0;
        let mut overlap_at: Option<Instant> = None;

        loop {
            if attempts.is_empty() {
                if next >= ordered.len() {
                    break;
                }
                self.launch(&mut attempts, &attempts_cancel, next, ordered[next]);
                next += 1;
                overlap_at = self.overlap_deadline(lead);
            }

            let can_overlap = overlap_at.is_some() && attempts.len() < window && next < ordered.len();

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Connection attempt cancelled");
                    self.release(attempts, &attempts_cancel).await;
                    return Err(ConnectError::Cancelled);
                }

                joined = attempts.join_next() => {
                    let Some(joined) = joined else {
                        continue;
                    };

                    let mut batch = vec![joined];
                    while let Some(more) = attempts.try_join_next() {
                        batch.push(more);
                    }

                    let mut winners = Vec::new();
                    let mut newest_failed = false;
                    for joined in batch {
                        match joined {
                            Ok((index, Some(Ok(tunnel)))) => winners.push((index, tunnel)),
                            Ok((index, Some(Err(error)))) => {
                                newest_failed |= index + 1 == next;
                                failures.push((index, CandidateFailure { candidate: ordered[index], error }));
                            }
                            Ok((_, None)) => {}
                            Err(err) => warn!(error = %err, "Probe task failed"),
                        }
                    }

                    if !winners.is_empty() {
                        winners.sort_by_key(|(index, _)| *index);
                        let mut winners = winners.into_iter();
                        if let Some((index, tunnel)) = winners.next() {
                            for (late, extra) in winners {
                                debug!(candidate = %ordered[late], "Discarding simultaneous success");
                                extra.close().await;
                            }
                            self.release(attempts, &attempts_cancel).await;
                            info!(candidate = %ordered[index], "Tunnel established");
                            return Ok(Established { candidate: ordered[index], tunnel });
                        }
                    }

                    // The newest attempt failing hands over to the next candidate at once
                    if newest_failed && attempts.len() < window && next < ordered.len() {
                        self.launch(&mut attempts, &attempts_cancel, next, ordered[next]);
                        next += 1;
                        overlap_at = self.overlap_deadline(lead);
                    }
                }

                _ = tokio::time::sleep_until(overlap_at.unwrap_or_else(Instant::now)), if can_overlap => {
                    debug!(candidate = %ordered[next], "Starting overlapping attempt");
                    self.launch(&mut attempts, &attempts_cancel, next, ordered[next]);
                    next += 1;
                    overlap_at = self.overlap_deadline(lead);
                }
            }
        }

        failures.sort_by_key(|(index, _)| *index);
        let failures: Vec<CandidateFailure> = failures.into_iter().map(|(_, failure)| failure).collect();
        warn!(tried = failures.len(), "No candidate succeeded");
        Err(NoCandidateSucceeded { failures }.into())
    }

    fn overlap_deadline(&self, lead: Option<Duration>) -> Option<Instant> {
        lead.map(|lead| Instant::now() + self.candidate_timeout.saturating_sub(lead))
    }

    fn launch(
        &self,
        attempts: &mut JoinSet<AttemptResult<L::Tunnel>>,
        cancel: &CancellationToken,
        index: usize,
        candidate: ProtocolCandidate,
    ) {
        let probe = self.probe.clone();
        let cancel = cancel.clone();
        let timeout = self.candidate_timeout;

        attempts.spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => (index, None),
                result = probe.attempt(&candidate, timeout) => (index, Some(result)),
            }
        });
    }

    /// Cancel outstanding attempts and close any tunnel they still produce
    async fn release(&self, mut attempts: JoinSet<AttemptResult<L::Tunnel>>, cancel: &CancellationToken) {
        cancel.cancel();

        let drained = tokio::time::timeout(self.cancel_grace, async {
            while let Some(joined) = attempts.join_next().await {
                if let Ok((_, Some(Ok(tunnel)))) = joined {
                    debug!(candidate = %tunnel.candidate(), "Closing late tunnel");
                    tunnel.close().await;
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(remaining = attempts.len(), "Attempts did not unwind in time, aborting");
            attempts.abort_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ProbeOutcome, SimAgent, SimulatedLayer};
    use crate::transport::TransportKind;
    use std::sync::Arc;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn candidates() -> Vec<ProtocolCandidate> {
        vec![
            ProtocolCandidate::new(TransportKind::WireGuardUdp, 51820, 0),
            ProtocolCandidate::new(TransportKind::WireGuardTcp, 443, 1),
            ProtocolCandidate::new(TransportKind::Stealth, 443, 2),
        ]
    }

    fn connector(layer: &SimulatedLayer) -> SmartConnector<SimulatedLayer> {
        let probe = ProtocolProbe::new(Arc::new(layer.clone()));
        SmartConnector::new(probe, TIMEOUT, Duration::from_millis(100))
    }

    fn smart(lead_ms: u64) -> ConnectPolicy {
        ConnectPolicy::Smart(OverlapConfig {
            lead: Duration::from_millis(lead_ms),
            max_in_flight: 3,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_tie_goes_to_earlier_candidate() {
        let layer = SimulatedLayer::new(SimAgent::new());
        layer.set_outcome(TransportKind::WireGuardUdp, ProbeOutcome::Refuse, Duration::ZERO);
        layer.set_outcome(TransportKind::WireGuardTcp, ProbeOutcome::Succeed, Duration::from_millis(300));
        // Starts 100ms after B, finishes in the same instant
        layer.set_outcome(TransportKind::Stealth, ProbeOutcome::Succeed, Duration::from_millis(200));

        let established = connector(&layer)
            .connect(&candidates(), &smart(900), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(established.candidate.kind, TransportKind::WireGuardTcp);
        assert_eq!(layer.live_tunnels(), 1);
        assert!(!layer.closed_tunnels().contains(&TransportKind::WireGuardTcp));
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_success_is_released() {
        let layer = SimulatedLayer::new(SimAgent::new());
        layer.set_outcome(TransportKind::WireGuardUdp, ProbeOutcome::Refuse, Duration::ZERO);
        layer.set_outcome(TransportKind::WireGuardTcp, ProbeOutcome::Succeed, Duration::from_millis(300));
        layer.set_outcome(TransportKind::Stealth, ProbeOutcome::Succeed, Duration::from_millis(250));

        let established = connector(&layer)
            .connect(&candidates(), &smart(900), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(established.candidate.kind, TransportKind::WireGuardTcp);
        assert_eq!(layer.live_tunnels(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlap_starts_before_timeout() {
        let layer = SimulatedLayer::new(SimAgent::new());
        layer.set_outcome(TransportKind::WireGuardUdp, ProbeOutcome::Hang, Duration::ZERO);
        layer.set_outcome(TransportKind::WireGuardTcp, ProbeOutcome::Succeed, Duration::from_millis(50));

        let started = Instant::now();
        let established = connector(&layer)
            .connect(&candidates()[..2], &smart(400), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(established.candidate.kind, TransportKind::WireGuardTcp);
        // B starts at T - lead = 600ms and needs 50ms
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(650) && elapsed < TIMEOUT, "{elapsed:?}");
        assert_eq!(layer.live_tunnels(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_waits_for_each_failure() {
        let layer = SimulatedLayer::new(SimAgent::new());
        layer.set_outcome(TransportKind::WireGuardUdp, ProbeOutcome::Hang, Duration::ZERO);
        layer.set_outcome(TransportKind::WireGuardTcp, ProbeOutcome::Succeed, Duration::from_millis(50));

        let started = Instant::now();
        let established = connector(&layer)
            .connect(&candidates()[..2], &ConnectPolicy::Sequential, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(established.candidate.kind, TransportKind::WireGuardTcp);
        assert!(started.elapsed() >= TIMEOUT + Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_fail_reports_each_candidate() {
        let layer = SimulatedLayer::new(SimAgent::new());
        layer.set_outcome(TransportKind::WireGuardUdp, ProbeOutcome::Refuse, Duration::from_millis(10));
        layer.set_outcome(TransportKind::WireGuardTcp, ProbeOutcome::Hang, Duration::ZERO);
        layer.set_outcome(TransportKind::Stealth, ProbeOutcome::Unreachable, Duration::ZERO);

        let err = connector(&layer)
            .connect(&candidates(), &smart(200), &CancellationToken::new())
            .await
            .unwrap_err();

        let ConnectError::NoCandidateSucceeded(failed) = err else {
            panic!("expected NoCandidateSucceeded, got {err:?}");
        };
        let errors: Vec<_> = failed.failures.iter().map(|f| (f.candidate.kind, f.error)).collect();
        assert_eq!(
            errors,
            vec![
                (TransportKind::WireGuardUdp, ProbeError::Refused),
                (TransportKind::WireGuardTcp, ProbeError::Timeout),
                (TransportKind::Stealth, ProbeError::Unreachable),
            ]
        );
        assert_eq!(layer.live_tunnels(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_candidate_result_is_final() {
        let layer = SimulatedLayer::new(SimAgent::new());
        layer.set_outcome(TransportKind::Stealth, ProbeOutcome::Refuse, Duration::ZERO);
        let only = [ProtocolCandidate::new(TransportKind::Stealth, 443, 0)];

        let err = connector(&layer)
            .connect(&only, &ConnectPolicy::Sequential, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ConnectError::NoCandidateSucceeded(ref f) if f.failures.len() == 1));
        assert_eq!(layer.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_releases_tunnels() {
        let layer = SimulatedLayer::new(SimAgent::new());
        layer.set_outcome(TransportKind::WireGuardUdp, ProbeOutcome::Succeed, Duration::from_millis(500));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = connector(&layer)
            .connect(&candidates()[..1], &ConnectPolicy::Sequential, &cancel)
            .await
            .unwrap_err();

        assert_eq!(err, ConnectError::Cancelled);
        assert_eq!(layer.live_tunnels(), 0);
    }
}

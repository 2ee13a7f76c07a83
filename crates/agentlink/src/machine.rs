//! Connection State Machine (transition core)
//!
//! Pure reducer: `Machine::handle(input)` moves the state and returns the
//! effects the runtime must carry out. No I/O happens here, which keeps every
//! transition testable in isolation.
//!
//! ```text
//!  Disconnected ──connect──▶ Probing ──tunnel──▶ Authenticating ──auth-ok──▶ Connected
//!        ▲                      │  ▲                   │ ▲  renew once          │
//!        │                      │  └──backoff──┐       │ └─────────┘            │ channel lost
//!   teardown                    ▼              │       ▼                        ▼
//!  Disconnecting ◀─disconnect─ Error ◀──limit── Reconnecting ◀──────────────────┘
//! ```
//!
//! All asynchronous work is tagged with an attempt number. The number moves
//! forward whenever work is started or abandoned, so results that arrive
//! for an older attempt are ignored.

use crate::protocol::{ReconnectStrategy, RejectReason, Resolution};
use crate::session::HandshakeError;
use crate::settings::ProtocolPreference;
use std::fmt;
use tracing::debug;

/// Classified, user-visible failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoCandidateSucceeded,
    HandshakeTimedOut,
    AgentUnreachable,
    AuthenticationFailed,
    CertificateRenewalFailed,
    PolicyViolation,
    RetryLimitExceeded,
    ConnectionTimedOut,
    KillSwitchUnavailable,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorKind::NoCandidateSucceeded => "no protocol could connect",
            ErrorKind::HandshakeTimedOut => "agent handshake timed out",
            ErrorKind::AgentUnreachable => "agent unreachable",
            ErrorKind::AuthenticationFailed => "authentication failed",
            ErrorKind::CertificateRenewalFailed => "certificate renewal failed",
            ErrorKind::PolicyViolation => "connection refused by policy",
            ErrorKind::RetryLimitExceeded => "reconnection attempts exhausted",
            ErrorKind::ConnectionTimedOut => "connection timed out",
            ErrorKind::KillSwitchUnavailable => "kill switch unavailable",
        };
        f.write_str(text)
    }
}

impl From<&HandshakeError> for ErrorKind {
    fn from(err: &HandshakeError) -> Self {
        match err {
            HandshakeError::TimedOut => ErrorKind::HandshakeTimedOut,
            HandshakeError::TransportClosed => ErrorKind::AgentUnreachable,
            HandshakeError::Rejected(reason) => match reason.resolution() {
                Resolution::Disconnect => ErrorKind::PolicyViolation,
                _ => ErrorKind::AuthenticationFailed,
            },
        }
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Probing,
    Authenticating,
    Connected,
    Reconnecting,
    Disconnecting,
    Error(ErrorKind),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Is a connection being established or held?
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Probing
                | ConnectionState::Authenticating
                | ConnectionState::Connected
                | ConnectionState::Reconnecting
        )
    }

    pub fn error(&self) -> Option<ErrorKind> {
        match self {
            ConnectionState::Error(kind) => Some(*kind),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Probing => f.write_str("probing"),
            ConnectionState::Authenticating => f.write_str("authenticating"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Reconnecting => f.write_str("reconnecting"),
            ConnectionState::Disconnecting => f.write_str("disconnecting"),
            ConnectionState::Error(kind) => write!(f, "error: {kind}"),
        }
    }
}

/// Something that happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Connect(ProtocolPreference),
    Disconnect,
    ProbeSucceeded { attempt: u64 },
    ProbeFailed { attempt: u64 },
    HandshakeSucceeded { attempt: u64 },
    HandshakeFailed { attempt: u64, error: HandshakeError },
    /// No certificate could be obtained for the handshake
    CredentialsUnavailable { attempt: u64 },
    RenewalFinished { attempt: u64, ok: bool },
    ChannelClosed { attempt: u64 },
    AuthenticationFailed { attempt: u64, reason: RejectReason },
    CertificateExpiringSoon { attempt: u64 },
    BackoffElapsed { attempt: u64 },
    ConnectionTimedOut { intent: u64 },
    TeardownComplete { attempt: u64 },
    /// The blocking rule for the next state could not be installed
    KillSwitchFailed,
}

/// Work the runtime must carry out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    StartProbe { attempt: u64, preference: ProtocolPreference },
    OpenSession { attempt: u64 },
    RenewCertificate { attempt: u64, strategy: ReconnectStrategy },
    RenewInBackground,
    StartBackoff { attempt: u64, retry: u32 },
    /// Close the session but keep the tunnel
    CloseSession,
    /// Cancel in-flight work and release the tunnel and session
    ReleaseAll,
    /// Like `ReleaseAll`, then report `TeardownComplete`
    Teardown { attempt: u64 },
    ArmConnectionTimeout { intent: u64 },
    DisarmConnectionTimeout,
}

/// Result of one [`Machine::handle`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub effects: Vec<Effect>,
    /// Input to feed back right after this step
    pub replay: Option<Input>,
    /// `false` when the input was stale or meaningless in `from`
    pub accepted: bool,
}

impl Step {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Transition core
#[derive(Debug, Clone)]
pub struct Machine {
    state: ConnectionState,
    attempt: u64,
    intent: u64,
    retries: u32,
    max_retries: u32,
    cert_retry_used: bool,
    timeout_armed: bool,
    preference: ProtocolPreference,
    pending_connect: Option<ProtocolPreference>,
}

impl Machine {
    pub fn new(max_retries: u32) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempt: 0,
            intent: 0,
            retries: 0,
            max_retries,
            cert_retry_used: false,
            timeout_armed: false,
            preference: ProtocolPreference::Smart,
            pending_connect: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Current attempt tag
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Current user-connect tag
    pub fn intent(&self) -> u64 {
        self.intent
    }

    /// Reconnection retries spent in this cycle
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn preference(&self) -> ProtocolPreference {
        self.preference
    }

    pub fn handle(&mut self, input: Input) -> Step {
        let from = self.state;
        let mut effects = Vec::new();
        let mut replay = None;
        let accepted = self.transition(input, &mut effects, &mut replay);

        if !accepted {
            debug!(state = %from, "Input ignored");
        }

        Step {
            from,
            to: self.state,
            effects,
            replay,
            accepted,
        }
    }

    fn transition(&mut self, input: Input, fx: &mut Vec<Effect>, replay: &mut Option<Input>) -> bool {
        use ConnectionState as S;

        let current = self.attempt;
        match (self.state, input) {
            (S::Error(ErrorKind::KillSwitchUnavailable), Input::KillSwitchFailed) => true,
            (_, Input::KillSwitchFailed) => {
                self.fail(ErrorKind::KillSwitchUnavailable, fx);
                true
            }

            (S::Disconnected | S::Error(_), Input::Connect(preference)) => {
                self.start(preference, fx);
                true
            }
            (S::Probing | S::Authenticating | S::Connected | S::Reconnecting, Input::Connect(preference)) => {
                self.pending_connect = Some(preference);
                self.begin_disconnect(fx);
                true
            }
            (S::Disconnecting, Input::Connect(preference)) => {
                self.pending_connect = Some(preference);
                true
            }

            (S::Probing | S::Authenticating | S::Connected | S::Reconnecting | S::Error(_), Input::Disconnect) => {
                self.pending_connect = None;
                self.begin_disconnect(fx);
                true
            }
            (S::Disconnecting, Input::Disconnect) => {
                self.pending_connect = None;
                true
            }
            (S::Disconnecting, Input::TeardownComplete { attempt }) if attempt == current => {
                self.state = S::Disconnected;
                *replay = self.pending_connect.take().map(Input::Connect);
                true
            }

            (S::Probing | S::Authenticating | S::Reconnecting, Input::ConnectionTimedOut { intent })
                if self.timeout_armed && intent == self.intent =>
            {
                self.fail(ErrorKind::ConnectionTimedOut, fx);
                true
            }

            (S::Probing, Input::ProbeSucceeded { attempt }) if attempt == current => {
                self.attempt += 1;
                self.state = S::Authenticating;
                fx.push(Effect::OpenSession { attempt: self.attempt });
                true
            }
            (S::Probing, Input::ProbeFailed { attempt }) if attempt == current => {
                if self.retries > 0 {
                    self.enter_reconnecting(fx);
                } else {
                    self.fail(ErrorKind::NoCandidateSucceeded, fx);
                }
                true
            }

            (S::Authenticating, Input::HandshakeSucceeded { attempt }) if attempt == current => {
                self.state = S::Connected;
                self.retries = 0;
                self.cert_retry_used = false;
                self.disarm(fx);
                true
            }
            (S::Authenticating, Input::HandshakeFailed { attempt, error }) if attempt == current => {
                self.on_handshake_failed(error, fx);
                true
            }
            (S::Authenticating, Input::CredentialsUnavailable { attempt }) if attempt == current => {
                self.fail(ErrorKind::CertificateRenewalFailed, fx);
                true
            }
            (S::Authenticating, Input::RenewalFinished { attempt, ok }) if attempt == current => {
                if ok {
                    self.attempt += 1;
                    fx.push(Effect::OpenSession { attempt: self.attempt });
                } else {
                    self.fail(ErrorKind::CertificateRenewalFailed, fx);
                }
                true
            }

            (S::Connected, Input::ChannelClosed { attempt }) if attempt == current => {
                self.enter_reconnecting(fx);
                true
            }
            (S::Connected, Input::AuthenticationFailed { attempt, reason }) if attempt == current => {
                self.on_agent_rejection(reason, fx);
                true
            }
            (S::Connected, Input::CertificateExpiringSoon { attempt }) if attempt == current => {
                fx.push(Effect::RenewInBackground);
                true
            }

            (S::Reconnecting, Input::BackoffElapsed { attempt }) if attempt == current => {
                self.attempt += 1;
                self.state = S::Probing;
                fx.push(Effect::StartProbe {
                    attempt: self.attempt,
                    preference: self.preference,
                });
                true
            }

            _ => false,
        }
    }

    fn start(&mut self, preference: ProtocolPreference, fx: &mut Vec<Effect>) {
        self.preference = preference;
        self.retries = 0;
        self.cert_retry_used = false;
        self.intent += 1;
        self.timeout_armed = true;
        self.attempt += 1;
        self.state = ConnectionState::Probing;
        fx.push(Effect::ArmConnectionTimeout { intent: self.intent });
        fx.push(Effect::StartProbe {
            attempt: self.attempt,
            preference,
        });
    }

    fn begin_disconnect(&mut self, fx: &mut Vec<Effect>) {
        self.attempt += 1;
        self.state = ConnectionState::Disconnecting;
        self.disarm(fx);
        fx.push(Effect::Teardown { attempt: self.attempt });
    }

    fn fail(&mut self, kind: ErrorKind, fx: &mut Vec<Effect>) {
        self.attempt += 1;
        self.state = ConnectionState::Error(kind);
        self.pending_connect = None;
        self.disarm(fx);
        fx.push(Effect::ReleaseAll);
    }

    fn disarm(&mut self, fx: &mut Vec<Effect>) {
        if self.timeout_armed {
            self.timeout_armed = false;
            fx.push(Effect::DisarmConnectionTimeout);
        }
    }

    /// Retry limit is checked on every entry
    fn enter_reconnecting(&mut self, fx: &mut Vec<Effect>) {
        if self.retries >= self.max_retries {
            self.fail(ErrorKind::RetryLimitExceeded, fx);
            return;
        }
        self.retries += 1;
        self.attempt += 1;
        self.state = ConnectionState::Reconnecting;
        fx.push(Effect::ReleaseAll);
        fx.push(Effect::StartBackoff {
            attempt: self.attempt,
            retry: self.retries,
        });
    }

    fn on_handshake_failed(&mut self, error: HandshakeError, fx: &mut Vec<Effect>) {
        match error {
            HandshakeError::Rejected(reason) if reason.is_certificate_related() && !self.cert_retry_used => {
                self.cert_retry_used = true;
                self.attempt += 1;
                fx.push(Effect::RenewCertificate {
                    attempt: self.attempt,
                    strategy: strategy_for(reason),
                });
            }
            HandshakeError::TimedOut | HandshakeError::TransportClosed if self.retries > 0 => {
                self.enter_reconnecting(fx);
            }
            other => self.fail(ErrorKind::from(&other), fx),
        }
    }

    fn on_agent_rejection(&mut self, reason: RejectReason, fx: &mut Vec<Effect>) {
        match reason.resolution() {
            Resolution::Ignore => debug!(?reason, "Agent error ignored"),
            Resolution::Disconnect => self.fail(ErrorKind::PolicyViolation, fx),
            Resolution::Reconnect(ReconnectStrategy::ExistingCertificate) => {
                self.attempt += 1;
                self.state = ConnectionState::Authenticating;
                fx.push(Effect::CloseSession);
                fx.push(Effect::OpenSession { attempt: self.attempt });
            }
            Resolution::Reconnect(strategy) => {
                if self.cert_retry_used {
                    self.fail(ErrorKind::AuthenticationFailed, fx);
                    return;
                }
                self.cert_retry_used = true;
                self.attempt += 1;
                self.state = ConnectionState::Authenticating;
                fx.push(Effect::CloseSession);
                fx.push(Effect::RenewCertificate {
                    attempt: self.attempt,
                    strategy,
                });
            }
        }
    }
}

fn strategy_for(reason: RejectReason) -> ReconnectStrategy {
    match reason.resolution() {
        Resolution::Reconnect(strategy) => strategy,
        _ => ReconnectStrategy::NewCertificate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kill_switch::{BlockingRule, plan};
    use crate::transport::TransportKind;
    use proptest::prelude::*;

    const SMART: ProtocolPreference = ProtocolPreference::Smart;

    fn connected(max_retries: u32) -> Machine {
        let mut machine = Machine::new(max_retries);
        machine.handle(Input::Connect(SMART));
        machine.handle(Input::ProbeSucceeded { attempt: machine.attempt() });
        machine.handle(Input::HandshakeSucceeded { attempt: machine.attempt() });
        assert_eq!(machine.state(), ConnectionState::Connected);
        machine
    }

    #[test]
    fn test_happy_path() {
        let mut machine = Machine::new(3);

        let step = machine.handle(Input::Connect(SMART));
        assert_eq!(step.to, ConnectionState::Probing);
        assert_eq!(
            step.effects,
            vec![
                Effect::ArmConnectionTimeout { intent: 1 },
                Effect::StartProbe { attempt: 1, preference: SMART },
            ]
        );

        let step = machine.handle(Input::ProbeSucceeded { attempt: 1 });
        assert_eq!(step.to, ConnectionState::Authenticating);
        assert_eq!(step.effects, vec![Effect::OpenSession { attempt: 2 }]);

        let step = machine.handle(Input::HandshakeSucceeded { attempt: 2 });
        assert_eq!(step.to, ConnectionState::Connected);
        assert_eq!(step.effects, vec![Effect::DisarmConnectionTimeout]);
    }

    #[test]
    fn test_stale_results_are_ignored() {
        let mut machine = Machine::new(3);
        machine.handle(Input::Connect(SMART));
        machine.handle(Input::Disconnect);

        let step = machine.handle(Input::ProbeSucceeded { attempt: 1 });
        assert!(!step.accepted);
        assert_eq!(step.to, ConnectionState::Disconnecting);
        assert!(step.effects.is_empty());
    }

    #[test]
    fn test_probe_failure_on_user_connect_is_error() {
        let mut machine = Machine::new(3);
        machine.handle(Input::Connect(SMART));
        let step = machine.handle(Input::ProbeFailed { attempt: 1 });

        assert_eq!(step.to, ConnectionState::Error(ErrorKind::NoCandidateSucceeded));
        assert!(step.effects.contains(&Effect::ReleaseAll));
    }

    #[test]
    fn test_certificate_rejection_renews_once() {
        let mut machine = Machine::new(3);
        machine.handle(Input::Connect(SMART));
        machine.handle(Input::ProbeSucceeded { attempt: 1 });

        let step = machine.handle(Input::HandshakeFailed {
            attempt: 2,
            error: HandshakeError::Rejected(RejectReason::CertificateExpired),
        });
        assert_eq!(step.to, ConnectionState::Authenticating);
        assert_eq!(
            step.effects,
            vec![Effect::RenewCertificate { attempt: 3, strategy: ReconnectStrategy::NewCertificate }]
        );

        let step = machine.handle(Input::RenewalFinished { attempt: 3, ok: true });
        assert_eq!(step.effects, vec![Effect::OpenSession { attempt: 4 }]);

        let step = machine.handle(Input::HandshakeFailed {
            attempt: 4,
            error: HandshakeError::Rejected(RejectReason::CertificateExpired),
        });
        assert_eq!(step.to, ConnectionState::Error(ErrorKind::AuthenticationFailed));
    }

    #[test]
    fn test_key_reuse_regenerates_keys() {
        let mut machine = Machine::new(3);
        machine.handle(Input::Connect(SMART));
        machine.handle(Input::ProbeSucceeded { attempt: 1 });
        let step = machine.handle(Input::HandshakeFailed {
            attempt: 2,
            error: HandshakeError::Rejected(RejectReason::KeyReused),
        });
        assert_eq!(
            step.effects,
            vec![Effect::RenewCertificate { attempt: 3, strategy: ReconnectStrategy::NewKeysAndCertificate }]
        );
    }

    #[test]
    fn test_handshake_errors_are_classified() {
        for (error, kind) in [
            (HandshakeError::TimedOut, ErrorKind::HandshakeTimedOut),
            (HandshakeError::TransportClosed, ErrorKind::AgentUnreachable),
            (HandshakeError::Rejected(RejectReason::PlanRestricted), ErrorKind::PolicyViolation),
            (HandshakeError::Rejected(RejectReason::ServerError), ErrorKind::AuthenticationFailed),
        ] {
            let mut machine = Machine::new(3);
            machine.handle(Input::Connect(SMART));
            machine.handle(Input::ProbeSucceeded { attempt: 1 });
            let step = machine.handle(Input::HandshakeFailed { attempt: 2, error });
            assert_eq!(step.to, ConnectionState::Error(kind));
        }
    }

    #[test]
    fn test_retry_limit_gives_exact_backoff_count() {
        let mut machine = connected(3);
        let mut backoffs = 0;
        let mut probes = 0;

        let mut step = machine.handle(Input::ChannelClosed { attempt: machine.attempt() });
        loop {
            match step.to {
                ConnectionState::Reconnecting => {
                    backoffs += 1;
                    step = machine.handle(Input::BackoffElapsed { attempt: machine.attempt() });
                }
                ConnectionState::Probing => {
                    probes += 1;
                    step = machine.handle(Input::ProbeFailed { attempt: machine.attempt() });
                }
                ConnectionState::Error(kind) => {
                    assert_eq!(kind, ErrorKind::RetryLimitExceeded);
                    break;
                }
                other => panic!("unexpected state {other:?}"),
            }
        }

        assert_eq!(backoffs, 3);
        assert_eq!(probes, 3);
    }

    #[test]
    fn test_reconnect_success_resets_budget() {
        let mut machine = connected(1);
        machine.handle(Input::ChannelClosed { attempt: machine.attempt() });
        machine.handle(Input::BackoffElapsed { attempt: machine.attempt() });
        machine.handle(Input::ProbeSucceeded { attempt: machine.attempt() });
        machine.handle(Input::HandshakeSucceeded { attempt: machine.attempt() });
        assert_eq!(machine.retries(), 0);

        let step = machine.handle(Input::ChannelClosed { attempt: machine.attempt() });
        assert_eq!(step.to, ConnectionState::Reconnecting);
    }

    #[test]
    fn test_handshake_loss_during_reconnect_keeps_reconnecting() {
        let mut machine = connected(3);
        machine.handle(Input::ChannelClosed { attempt: machine.attempt() });
        machine.handle(Input::BackoffElapsed { attempt: machine.attempt() });
        machine.handle(Input::ProbeSucceeded { attempt: machine.attempt() });

        let step = machine.handle(Input::HandshakeFailed {
            attempt: machine.attempt(),
            error: HandshakeError::TransportClosed,
        });
        assert_eq!(step.to, ConnectionState::Reconnecting);
        assert_eq!(machine.retries(), 2);
    }

    #[test]
    fn test_agent_rejections_while_connected() {
        let mut machine = connected(3);
        let step = machine.handle(Input::AuthenticationFailed {
            attempt: machine.attempt(),
            reason: RejectReason::Unknown,
        });
        assert!(!step.changed());

        let step = machine.handle(Input::AuthenticationFailed {
            attempt: machine.attempt(),
            reason: RejectReason::ServerError,
        });
        assert_eq!(step.to, ConnectionState::Authenticating);
        assert_eq!(step.effects[0], Effect::CloseSession);
        assert!(matches!(step.effects[1], Effect::OpenSession { .. }));

        let mut machine = connected(3);
        let step = machine.handle(Input::AuthenticationFailed {
            attempt: machine.attempt(),
            reason: RejectReason::CertificateRevoked,
        });
        assert!(matches!(
            step.effects[1],
            Effect::RenewCertificate { strategy: ReconnectStrategy::NewCertificate, .. }
        ));

        let mut machine = connected(3);
        let step = machine.handle(Input::AuthenticationFailed {
            attempt: machine.attempt(),
            reason: RejectReason::SessionLimitReached,
        });
        assert_eq!(step.to, ConnectionState::Error(ErrorKind::PolicyViolation));
    }

    #[test]
    fn test_expiring_certificate_renews_in_background() {
        let mut machine = connected(3);
        let step = machine.handle(Input::CertificateExpiringSoon { attempt: machine.attempt() });
        assert!(!step.changed());
        assert_eq!(step.effects, vec![Effect::RenewInBackground]);
    }

    #[test]
    fn test_connect_while_active_replays_after_teardown() {
        let mut machine = connected(3);
        let specific = ProtocolPreference::Specific(TransportKind::Stealth);

        let step = machine.handle(Input::Connect(specific));
        assert_eq!(step.to, ConnectionState::Disconnecting);
        let teardown = machine.attempt();
        assert!(step.effects.contains(&Effect::Teardown { attempt: teardown }));

        let step = machine.handle(Input::TeardownComplete { attempt: teardown });
        assert_eq!(step.to, ConnectionState::Disconnected);
        assert_eq!(step.replay, Some(Input::Connect(specific)));

        let step = machine.handle(Input::Connect(specific));
        assert_eq!(step.to, ConnectionState::Probing);
        assert_eq!(machine.preference(), specific);
    }

    #[test]
    fn test_disconnect_cancels_pending_connect() {
        let mut machine = connected(3);
        machine.handle(Input::Disconnect);
        machine.handle(Input::Connect(SMART));
        machine.handle(Input::Disconnect);

        let step = machine.handle(Input::TeardownComplete { attempt: machine.attempt() });
        assert_eq!(step.to, ConnectionState::Disconnected);
        assert_eq!(step.replay, None);
    }

    #[test]
    fn test_connection_timeout() {
        let mut machine = Machine::new(3);
        machine.handle(Input::Connect(SMART));
        let intent = machine.intent();
        machine.handle(Input::ProbeSucceeded { attempt: machine.attempt() });

        let step = machine.handle(Input::ConnectionTimedOut { intent });
        assert_eq!(step.to, ConnectionState::Error(ErrorKind::ConnectionTimedOut));

        // Disarmed once connected
        let mut machine = connected(3);
        let step = machine.handle(Input::ConnectionTimedOut { intent: machine.intent() });
        assert!(!step.accepted);
    }

    #[test]
    fn test_user_retry_from_error() {
        let mut machine = Machine::new(3);
        machine.handle(Input::Connect(SMART));
        machine.handle(Input::ProbeFailed { attempt: 1 });

        let step = machine.handle(Input::Connect(SMART));
        assert_eq!(step.to, ConnectionState::Probing);
    }

    #[test]
    fn test_kill_switch_failure() {
        let mut machine = Machine::new(3);
        let step = machine.handle(Input::KillSwitchFailed);
        assert_eq!(step.to, ConnectionState::Error(ErrorKind::KillSwitchUnavailable));

        let step = machine.handle(Input::KillSwitchFailed);
        assert!(!step.changed());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Connect,
        Disconnect,
        ProbeOk(bool),
        ProbeFail(bool),
        HandshakeOk(bool),
        HandshakeRejected(bool, RejectReason),
        HandshakeLost(bool),
        Renewed(bool, bool),
        ChannelClosed(bool),
        AgentError(bool, RejectReason),
        Backoff(bool),
        Timeout,
        Teardown(bool),
        Settings { kill_switch: bool, lan: bool },
    }

    fn reason() -> impl Strategy<Value = RejectReason> {
        prop_oneof![
            Just(RejectReason::CertificateExpired),
            Just(RejectReason::CertificateRevoked),
            Just(RejectReason::KeyReused),
            Just(RejectReason::ServerError),
            Just(RejectReason::SessionLimitReached),
            Just(RejectReason::Unknown),
        ]
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Connect),
            1 => Just(Op::Disconnect),
            3 => any::<bool>().prop_map(Op::ProbeOk),
            2 => any::<bool>().prop_map(Op::ProbeFail),
            3 => any::<bool>().prop_map(Op::HandshakeOk),
            1 => (any::<bool>(), reason()).prop_map(|(fresh, r)| Op::HandshakeRejected(fresh, r)),
            1 => any::<bool>().prop_map(Op::HandshakeLost),
            1 => (any::<bool>(), any::<bool>()).prop_map(|(fresh, ok)| Op::Renewed(fresh, ok)),
            2 => any::<bool>().prop_map(Op::ChannelClosed),
            1 => (any::<bool>(), reason()).prop_map(|(fresh, r)| Op::AgentError(fresh, r)),
            2 => any::<bool>().prop_map(Op::Backoff),
            1 => Just(Op::Timeout),
            2 => any::<bool>().prop_map(Op::Teardown),
            2 => (any::<bool>(), any::<bool>()).prop_map(|(kill_switch, lan)| Op::Settings { kill_switch, lan }),
        ]
    }

    fn to_input(op: &Op, machine: &Machine) -> Option<Input> {
        let tag = |fresh: bool| if fresh { machine.attempt() } else { machine.attempt().saturating_sub(1) };
        Some(match op {
            Op::Connect => Input::Connect(SMART),
            Op::Disconnect => Input::Disconnect,
            Op::ProbeOk(fresh) => Input::ProbeSucceeded { attempt: tag(*fresh) },
            Op::ProbeFail(fresh) => Input::ProbeFailed { attempt: tag(*fresh) },
            Op::HandshakeOk(fresh) => Input::HandshakeSucceeded { attempt: tag(*fresh) },
            Op::HandshakeRejected(fresh, reason) => Input::HandshakeFailed {
                attempt: tag(*fresh),
                error: HandshakeError::Rejected(*reason),
            },
            Op::HandshakeLost(fresh) => Input::HandshakeFailed {
                attempt: tag(*fresh),
                error: HandshakeError::TransportClosed,
            },
            Op::Renewed(fresh, ok) => Input::RenewalFinished { attempt: tag(*fresh), ok: *ok },
            Op::ChannelClosed(fresh) => Input::ChannelClosed { attempt: tag(*fresh) },
            Op::AgentError(fresh, reason) => Input::AuthenticationFailed { attempt: tag(*fresh), reason: *reason },
            Op::Backoff(fresh) => Input::BackoffElapsed { attempt: tag(*fresh) },
            Op::Timeout => Input::ConnectionTimedOut { intent: machine.intent() },
            Op::Teardown(fresh) => Input::TeardownComplete { attempt: tag(*fresh) },
            Op::Settings { .. } => return None,
        })
    }

    /// Mirrors the runtime: install before publish, remove after
    struct Harness {
        machine: Machine,
        policy: Option<BlockingRule>,
        installed: Option<BlockingRule>,
        published: ConnectionState,
    }

    impl Harness {
        fn check(&self) {
            if let Some(rule) = self.policy {
                if !self.published.is_connected() {
                    assert_eq!(
                        self.installed,
                        Some(rule),
                        "unprotected in {:?} with policy {:?}",
                        self.published,
                        rule
                    );
                }
            }
        }

        fn apply_plan(&mut self, connected: bool, publish: Option<ConnectionState>) {
            let plan = plan(self.installed, self.policy, connected);
            if let Some(rule) = plan.install {
                self.installed = Some(rule);
            }
            self.check();
            if let Some(state) = publish {
                self.published = state;
                self.check();
            }
            if plan.remove_after {
                self.installed = None;
            }
            self.check();
        }

        fn feed(&mut self, input: Input) {
            let mut next = Some(self.machine.handle(input));
            while let Some(step) = next.take() {
                if step.changed() {
                    self.apply_plan(step.to.is_connected(), Some(step.to));
                }
                next = step.replay.map(|input| self.machine.handle(input));
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn kill_switch_holds_across_transitions(
            initial_kill_switch in any::<bool>(),
            initial_lan in any::<bool>(),
            ops in proptest::collection::vec(op(), 1..80),
        ) {
            let mut harness = Harness {
                machine: Machine::new(3),
                policy: initial_kill_switch.then_some(BlockingRule { allow_lan: initial_lan }),
                installed: None,
                published: ConnectionState::Disconnected,
            };
            harness.apply_plan(false, None);

            for op in &ops {
                match op {
                    Op::Settings { kill_switch, lan } => {
                        harness.policy = kill_switch.then_some(BlockingRule { allow_lan: *lan });
                        let connected = harness.published.is_connected();
                        harness.apply_plan(connected, None);
                    }
                    other => {
                        if let Some(input) = to_input(other, &harness.machine) {
                            harness.feed(input);
                        }
                    }
                }
                prop_assert_eq!(harness.published, harness.machine.state());
            }
        }
    }
}

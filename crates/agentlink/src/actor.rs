//! Connection Actor
//!
//! Runs the [`Machine`] transition core as a single actor task and carries
//! out its effects: probing, agent sessions, certificate renewal, backoff
//! and the kill switch.
//!
//! # Usage
//!
//! ```rust,ignore
//! let handle = ConnectionStateMachine::spawn(config, layer, filter, certificates, settings_rx)?;
//! handle.connect(ProtocolPreference::Smart).await?;
//! handle.wait_for(|state| state.is_connected()).await?;
//! handle.disconnect().await?;
//! ```
//!
//! # Ordering
//!
//! Every transition installs the blocking rule (if one is due) before the
//! new state is published, and removes it only afterwards. Long-running work
//! is spawned and reports back through a channel; results from an abandoned
//! attempt are released on arrival.

use crate::certificate::{CertificateIssuer, CertificateStatus, CertificateStore, RenewalError};
use crate::config::{ConfigError, ConnectionConfig};
use crate::connector::{ConnectError, Established, SmartConnector};
use crate::features::{FeatureFlagSet, FeatureNegotiator};
use crate::kill_switch::{self, KillSwitch, TrafficFilter};
use crate::machine::{ConnectionState, Effect, ErrorKind, Input, Machine, Step};
use crate::probe::ProtocolProbe;
use crate::protocol::{NetShieldStats, ReconnectStrategy};
use crate::session::{AgentEvent, AgentEvents, AgentSession, HandshakeError, SessionConfig};
use crate::settings::{ProtocolPreference, SettingsSnapshot};
use crate::transport::{ProtocolCandidate, TransportLayer, Tunnel};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Published state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Handle errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandleError {
    #[error("Connection state machine has stopped")]
    Stopped,
}

enum Command {
    Connect(ProtocolPreference),
    /// Connect with the preference from the current settings
    ConnectPreferred,
    Disconnect,
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct Status {
    last_error: Option<ErrorKind>,
    stats: Option<NetShieldStats>,
    candidate: Option<ProtocolCandidate>,
}

fn lock(status: &Mutex<Status>) -> MutexGuard<'_, Status> {
    status.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client handle to a running state machine
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    transitions: broadcast::Sender<Transition>,
    status: Arc<Mutex<Status>>,
}

impl ConnectionHandle {
    /// Start connecting. While an attempt is active this disconnects first.
    pub async fn connect(&self, preference: ProtocolPreference) -> Result<(), HandleError> {
        self.send(Command::Connect(preference)).await
    }

    /// Start connecting with the protocol preference from the settings
    pub async fn connect_preferred(&self) -> Result<(), HandleError> {
        self.send(Command::ConnectPreferred).await
    }

    pub async fn disconnect(&self) -> Result<(), HandleError> {
        self.send(Command::Disconnect).await
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Latest state, for observers that only care about the current value
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Every published transition, in order
    pub fn transitions(&self) -> broadcast::Receiver<Transition> {
        self.transitions.subscribe()
    }

    /// Most recent failure, cleared once connected
    pub fn last_error(&self) -> Option<ErrorKind> {
        lock(&self.status).last_error
    }

    /// Latest NetShield statistics from the agent
    pub fn stats(&self) -> Option<NetShieldStats> {
        lock(&self.status).stats
    }

    /// Candidate of the current tunnel
    pub fn candidate(&self) -> Option<ProtocolCandidate> {
        lock(&self.status).candidate
    }

    /// Wait until the published state satisfies `predicate`
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&ConnectionState) -> bool,
    ) -> Result<ConnectionState, HandleError> {
        let mut rx = self.state.clone();
        let state = rx.wait_for(|state| predicate(state)).await.map_err(|_| HandleError::Stopped)?;
        Ok(*state)
    }

    /// Disconnect, release everything and stop the actor
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn send(&self, command: Command) -> Result<(), HandleError> {
        self.commands.send(command).await.map_err(|_| HandleError::Stopped)
    }
}

enum SessionOpenError {
    Handshake(HandshakeError),
    Credentials(RenewalError),
}

enum WorkResult<T> {
    Probe {
        attempt: u64,
        outcome: Result<Established<T>, ConnectError>,
    },
    Session {
        attempt: u64,
        outcome: Result<(AgentSession, AgentEvents), SessionOpenError>,
    },
    Renewal {
        attempt: u64,
        outcome: Result<(), RenewalError>,
    },
    Teardown {
        attempt: u64,
    },
}

/// Connection state machine actor
pub struct ConnectionStateMachine<L: TransportLayer, F, I> {
    config: ConnectionConfig,
    session_config: SessionConfig,
    machine: Machine,
    published: ConnectionState,
    connector: Arc<SmartConnector<L>>,
    certificates: Arc<CertificateStore<I>>,
    kill_switch: KillSwitch<F>,
    settings: watch::Receiver<SettingsSnapshot>,
    settings_open: bool,
    state_tx: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<Transition>,
    status: Arc<Mutex<Status>>,
    results_tx: mpsc::UnboundedSender<WorkResult<L::Tunnel>>,
    results_rx: mpsc::UnboundedReceiver<WorkResult<L::Tunnel>>,
    work: JoinSet<()>,
    work_cancel: CancellationToken,
    tunnel: Option<Arc<L::Tunnel>>,
    session: Option<AgentSession>,
    events: Option<(u64, AgentEvents)>,
    backoff: Option<(u64, Instant)>,
    deadline: Option<(u64, Instant)>,
}

impl<L, F, I> ConnectionStateMachine<L, F, I>
where
    L: TransportLayer,
    F: TrafficFilter,
    I: CertificateIssuer,
{
    /// Start the actor and return a handle to it.
    ///
    /// `settings` is watched for the whole lifetime of the actor: kill
    /// switch changes re-plan the blocking rule, everything else is pushed
    /// to a connected agent. Fails if `config` does not validate.
    pub fn spawn(
        config: ConnectionConfig,
        layer: L,
        filter: F,
        certificates: Arc<CertificateStore<I>>,
        settings: watch::Receiver<SettingsSnapshot>,
    ) -> Result<ConnectionHandle, ConfigError> {
        config.validate()?;

        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(64);
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let status = Arc::new(Mutex::new(Status::default()));

        let probe = ProtocolProbe::new(Arc::new(layer));
        let connector = SmartConnector::new(probe, config.candidate_timeout(), config.cancel_grace());

        let actor = Self {
            session_config: config.session_config(),
            machine: Machine::new(config.backoff.max_retries),
            published: ConnectionState::Disconnected,
            connector: Arc::new(connector),
            certificates,
            kill_switch: KillSwitch::new(filter),
            settings,
            settings_open: true,
            state_tx,
            transitions: transitions.clone(),
            status: Arc::clone(&status),
            results_tx,
            results_rx,
            work: JoinSet::new(),
            work_cancel: CancellationToken::new(),
            tunnel: None,
            session: None,
            events: None,
            backoff: None,
            deadline: None,
            config,
        };
        tokio::spawn(actor.run(commands_rx));

        Ok(ConnectionHandle {
            commands: commands_tx,
            state: state_rx,
            transitions,
            status,
        })
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!("Connection state machine started");
        self.sync_settings().await;

        loop {
            let backoff = self.backoff;
            let deadline = self.deadline;
            let backoff_at = backoff.map_or_else(Instant::now, |(_, at)| at);
            let deadline_at = deadline.map_or_else(Instant::now, |(_, at)| at);

            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Connect(preference)) => self.handle(Input::Connect(preference)).await,
                    Some(Command::ConnectPreferred) => {
                        let preference = self.settings.borrow().protocol;
                        self.handle(Input::Connect(preference)).await;
                    }
                    Some(Command::Disconnect) => self.handle(Input::Disconnect).await,
                    Some(Command::Shutdown(ack)) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },

                Some(result) = self.results_rx.recv() => self.on_work_result(result).await,

                (attempt, event) = next_event(&mut self.events) => self.on_agent_event(attempt, event).await,

                _ = sleep_until(backoff_at), if backoff.is_some() => {
                    if let Some((attempt, _)) = self.backoff.take() {
                        self.handle(Input::BackoffElapsed { attempt }).await;
                    }
                }

                _ = sleep_until(deadline_at), if deadline.is_some() => {
                    if let Some((intent, _)) = self.deadline.take() {
                        warn!(timeout_ms = self.config.timeouts.connection_ms, "Connection attempt timed out");
                        self.handle(Input::ConnectionTimedOut { intent }).await;
                    }
                }

                changed = self.settings.changed(), if self.settings_open => {
                    if changed.is_err() {
                        debug!("Settings source dropped, keeping last snapshot");
                        self.settings_open = false;
                    } else {
                        self.sync_settings().await;
                    }
                }
            }

            while self.work.try_join_next().is_some() {}
        }

        info!("Connection state machine stopped");
    }

    async fn handle(&mut self, input: Input) {
        let step = self.machine.handle(input);
        self.apply(step).await;
    }

    async fn apply(&mut self, first: Step) {
        let mut next = Some(first);
        while let Some(mut step) = next.take() {
            if step.changed() {
                let plan = kill_switch::plan(
                    self.kill_switch.installed(),
                    self.settings.borrow().blocking_rule(),
                    step.to.is_connected(),
                );

                if let Err(err) = self.kill_switch.before_transition(&plan).await {
                    if step.to != ConnectionState::Error(ErrorKind::KillSwitchUnavailable) {
                        error!(error = %err, state = %step.to, "Kill switch rule could not be installed");
                        next = Some(self.machine.handle(Input::KillSwitchFailed));
                        continue;
                    }
                    error!(error = %err, "Kill switch unavailable, traffic is not blocked");
                }

                self.publish(step.to);

                if let Err(err) = self.kill_switch.after_transition(&plan).await {
                    warn!(error = %err, "Failed to remove blocking rule");
                }
            }

            let replay = step.replay.take();
            for effect in std::mem::take(&mut step.effects) {
                self.execute(effect);
            }
            next = replay.map(|input| self.machine.handle(input));
        }
    }

    fn publish(&mut self, to: ConnectionState) {
        let from = self.published;
        if from == to {
            return;
        }
        self.published = to;

        {
            let mut status = lock(&self.status);
            match to {
                ConnectionState::Error(kind) => status.last_error = Some(kind),
                ConnectionState::Connected => status.last_error = None,
                _ => {}
            }
            if !matches!(to, ConnectionState::Connected | ConnectionState::Authenticating) {
                status.candidate = None;
            }
        }

        match to {
            ConnectionState::Error(kind) => warn!(from = %from, error = %kind, "Connection failed"),
            _ => info!(from = %from, to = %to, "Connection state changed"),
        }

        self.state_tx.send_replace(to);
        let _ = self.transitions.send(Transition { from, to });
    }

    fn execute(&mut self, effect: Effect) {
        debug!(?effect, "Executing effect");
        match effect {
            Effect::StartProbe { attempt, preference } => self.start_probe(attempt, preference),
            Effect::OpenSession { attempt } => self.open_session(attempt),
            Effect::RenewCertificate { attempt, strategy } => self.renew_certificate(attempt, strategy),
            Effect::RenewInBackground => self.renew_in_background(),
            Effect::StartBackoff { attempt, retry } => {
                let delay = self.config.backoff.delay_for(retry);
                info!(retry, max_retries = self.config.backoff.max_retries, delay_ms = delay.as_millis() as u64, "Reconnecting after backoff");
                self.backoff = Some((attempt, Instant::now() + delay));
            }
            Effect::CloseSession => {
                self.events = None;
                if let Some(session) = self.session.take() {
                    self.work.spawn(session.close());
                }
            }
            Effect::ReleaseAll => {
                self.cancel_work();
                self.backoff = None;
                self.release_connection();
            }
            Effect::Teardown { attempt } => self.teardown(attempt),
            Effect::ArmConnectionTimeout { intent } => {
                self.deadline = Some((intent, Instant::now() + self.config.connection_timeout()));
            }
            Effect::DisarmConnectionTimeout => self.deadline = None,
        }
    }

    fn start_probe(&mut self, attempt: u64, preference: ProtocolPreference) {
        let candidates = self.config.candidates_for(preference);
        let policy = self.config.policy_for(preference);
        let connector = Arc::clone(&self.connector);
        let cancel = self.work_cancel.clone();
        let results = self.results_tx.clone();

        debug!(candidates = candidates.len(), ?policy, "Probing candidates");
        self.work.spawn(async move {
            let outcome = connector.connect(&candidates, &policy, &cancel).await;
            let _ = results.send(WorkResult::Probe { attempt, outcome });
        });
    }

    fn open_session(&mut self, attempt: u64) {
        let Some(tunnel) = self.tunnel.clone() else {
            warn!("No tunnel to open an agent session over");
            let _ = self.results_tx.send(WorkResult::Session {
                attempt,
                outcome: Err(SessionOpenError::Handshake(HandshakeError::TransportClosed)),
            });
            return;
        };

        let certificates = Arc::clone(&self.certificates);
        let features = FeatureNegotiator::derive(&self.settings.borrow());
        let config = self.session_config.clone();

        self.spawn_work(async move {
            let outcome = authenticate(&*tunnel, &*certificates, features, &config).await;
            WorkResult::Session { attempt, outcome }
        });
    }

    fn renew_certificate(&mut self, attempt: u64, strategy: ReconnectStrategy) {
        let certificates = Arc::clone(&self.certificates);
        info!(?strategy, "Refreshing credentials before re-authenticating");

        self.spawn_work(async move {
            let outcome = match strategy {
                ReconnectStrategy::ExistingCertificate => Ok(()),
                ReconnectStrategy::NewCertificate => {
                    certificates.purge();
                    certificates.renew().await.map(drop)
                }
                ReconnectStrategy::NewKeysAndCertificate => certificates.renew_with_new_keys().await.map(drop),
            };
            WorkResult::Renewal { attempt, outcome }
        });
    }

    fn renew_in_background(&mut self) {
        let certificates = Arc::clone(&self.certificates);
        let cancel = self.work_cancel.clone();

        self.work.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = certificates.renew() => match result {
                    Ok(_) => info!("Certificate renewed ahead of expiry"),
                    Err(err) => warn!(error = %err, "Background certificate renewal failed"),
                },
            }
        });
    }

    /// Spawn cancellable work that reports back through the results channel
    fn spawn_work<W>(&mut self, work: W)
    where
        W: Future<Output = WorkResult<L::Tunnel>> + Send + 'static,
    {
        let cancel = self.work_cancel.clone();
        let results = self.results_tx.clone();
        self.work.spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                result = work => result,
            };
            let _ = results.send(result);
        });
    }

    fn cancel_work(&mut self) {
        self.work_cancel.cancel();
        self.work_cancel = CancellationToken::new();
    }

    fn release_connection(&mut self) {
        self.events = None;
        let session = self.session.take();
        let tunnel = self.tunnel.take();
        if session.is_none() && tunnel.is_none() {
            return;
        }

        self.work.spawn(async move {
            if let Some(session) = session {
                session.close().await;
            }
            if let Some(tunnel) = tunnel {
                tunnel.close().await;
            }
        });
    }

    fn release_tunnel(&mut self, tunnel: L::Tunnel) {
        debug!(candidate = %tunnel.candidate(), "Releasing tunnel from abandoned attempt");
        self.work.spawn(async move { tunnel.close().await });
    }

    fn teardown(&mut self, attempt: u64) {
        self.cancel_work();
        self.backoff = None;
        self.events = None;

        let session = self.session.take();
        let tunnel = self.tunnel.take();
        let mut work = std::mem::take(&mut self.work);
        let grace = self.config.cancel_grace();
        let results = self.results_tx.clone();

        tokio::spawn(async move {
            if let Some(session) = session {
                session.close().await;
            }

            let drained = tokio::time::timeout(grace, async {
                while work.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(pending = work.len(), "Work did not stop in time, aborting");
                work.abort_all();
                while work.join_next().await.is_some() {}
            }

            if let Some(tunnel) = tunnel {
                tunnel.close().await;
            }
            let _ = results.send(WorkResult::Teardown { attempt });
        });
    }

    async fn on_work_result(&mut self, result: WorkResult<L::Tunnel>) {
        match result {
            WorkResult::Probe { attempt, outcome } => match outcome {
                Ok(established) => {
                    let step = self.machine.handle(Input::ProbeSucceeded { attempt });
                    if step.accepted {
                        info!(candidate = %established.candidate, "Tunnel established");
                        lock(&self.status).candidate = Some(established.candidate);
                        self.tunnel = Some(Arc::new(established.tunnel));
                    } else {
                        self.release_tunnel(established.tunnel);
                    }
                    self.apply(step).await;
                }
                Err(ConnectError::Cancelled) => debug!("Probe cancelled"),
                Err(ConnectError::NoCandidateSucceeded(err)) => {
                    for failure in &err.failures {
                        debug!(%failure, "Candidate failed");
                    }
                    warn!(error = %err, "Probing failed");
                    self.handle(Input::ProbeFailed { attempt }).await;
                }
            },

            WorkResult::Session { attempt, outcome } => match outcome {
                Ok((session, events)) => {
                    let step = self.machine.handle(Input::HandshakeSucceeded { attempt });
                    if step.accepted {
                        // Settings may have changed while authenticating
                        let features = FeatureNegotiator::derive(&self.settings.borrow());
                        if let Err(err) = session.update_features(features) {
                            debug!(error = %err, "Feature update skipped");
                        }
                        self.session = Some(session);
                        self.events = Some((attempt, events));
                    } else {
                        debug!("Closing session from abandoned attempt");
                        self.work.spawn(session.close());
                    }
                    self.apply(step).await;
                }
                Err(SessionOpenError::Handshake(error)) => {
                    self.handle(Input::HandshakeFailed { attempt, error }).await;
                }
                Err(SessionOpenError::Credentials(err)) => {
                    warn!(error = %err, "No certificate for the handshake");
                    self.handle(Input::CredentialsUnavailable { attempt }).await;
                }
            },

            WorkResult::Renewal { attempt, outcome } => {
                if let Err(err) = &outcome {
                    warn!(error = %err, "Certificate refresh failed");
                }
                self.handle(Input::RenewalFinished { attempt, ok: outcome.is_ok() }).await;
            }

            WorkResult::Teardown { attempt } => self.handle(Input::TeardownComplete { attempt }).await,
        }
    }

    async fn on_agent_event(&mut self, attempt: u64, event: Option<AgentEvent>) {
        let Some(event) = event else {
            self.events = None;
            return;
        };

        match event {
            AgentEvent::FeaturesAcknowledged(features) => {
                debug!(flags = features.len(), "Agent acknowledged features");
            }
            AgentEvent::StatusUpdate(stats) => {
                lock(&self.status).stats = Some(stats.netshield);
            }
            AgentEvent::CertificateExpiringSoon => {
                info!("Agent reports certificate expiring soon");
                self.handle(Input::CertificateExpiringSoon { attempt }).await;
            }
            AgentEvent::AuthenticationFailed(reason) => {
                warn!(?reason, "Agent reported an authentication error");
                self.handle(Input::AuthenticationFailed { attempt, reason }).await;
            }
            AgentEvent::ChannelClosed(reason) => {
                info!(?reason, "Agent channel closed");
                self.session = None;
                self.handle(Input::ChannelClosed { attempt }).await;
            }
        }
    }

    /// Re-plan the kill switch and push features after a settings change
    async fn sync_settings(&mut self) {
        let snapshot = self.settings.borrow_and_update().clone();

        let plan = kill_switch::plan(
            self.kill_switch.installed(),
            snapshot.blocking_rule(),
            self.published.is_connected(),
        );
        if let Err(err) = self.kill_switch.before_transition(&plan).await {
            error!(error = %err, "Kill switch rule could not be installed");
            let step = self.machine.handle(Input::KillSwitchFailed);
            self.apply(step).await;
            return;
        }
        if let Err(err) = self.kill_switch.after_transition(&plan).await {
            warn!(error = %err, "Failed to remove blocking rule");
        }

        if let Some(session) = &self.session {
            let features: FeatureFlagSet = FeatureNegotiator::derive(&snapshot);
            if let Err(err) = session.update_features(features) {
                debug!(error = %err, "Feature update skipped");
            }
        }
    }

    async fn shutdown(&mut self) {
        if self.machine.state() != ConnectionState::Disconnected {
            self.handle(Input::Disconnect).await;

            let until = Instant::now() + self.config.cancel_grace() * 3;
            while self.machine.state() == ConnectionState::Disconnecting {
                match tokio::time::timeout_at(until, self.results_rx.recv()).await {
                    Ok(Some(result)) => self.on_work_result(result).await,
                    _ => break,
                }
            }
        }

        self.cancel_work();
        self.work.abort_all();
        while self.work.join_next().await.is_some() {}
    }
}

async fn next_event(events: &mut Option<(u64, AgentEvents)>) -> (u64, Option<AgentEvent>) {
    match events {
        Some((attempt, events)) => (*attempt, events.next().await),
        None => std::future::pending().await,
    }
}

async fn authenticate<T: Tunnel, I: CertificateIssuer>(
    tunnel: &T,
    certificates: &CertificateStore<I>,
    features: FeatureFlagSet,
    config: &SessionConfig,
) -> Result<(AgentSession, AgentEvents), SessionOpenError> {
    let credentials = match certificates.current_certificate() {
        CertificateStatus::Valid(credentials) => credentials,
        CertificateStatus::NeedsRenewal => certificates.renew().await.map_err(SessionOpenError::Credentials)?,
    };

    AgentSession::open(tunnel, &credentials, features, config)
        .await
        .map_err(SessionOpenError::Handshake)
}

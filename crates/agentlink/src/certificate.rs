//! Certificate Store
//!
//! Owns the client key pair and the certificate bound to it.
//!
//! # Renewal
//!
//! At most one renewal is in flight. The first caller drives the issuer
//! request; callers arriving meanwhile wait on a `watch` slot for the same
//! outcome. If the driving caller is dropped mid-request, the slot is
//! cleared and the waiters see [`RenewalError::Interrupted`].
//!
//! A key rotation never joins a plain renewal: that renewal signs the keys
//! being replaced. The rotation waits for it to finish, then drives its own
//! request. Plain renewals and other rotations do join a rotation in flight.

use crate::keys::{KeyPair, PublicKey};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Signed client certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCertificate {
    /// Encoded certificate as issued
    pub body: String,
    /// End of validity
    pub not_after: SystemTime,
    /// Fingerprint of the public key the certificate binds
    pub key_fingerprint: String,
}

impl ClientCertificate {
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now >= self.not_after
    }

    /// Time left before expiry, zero once expired
    pub fn remaining_at(&self, now: SystemTime) -> Duration {
        self.not_after.duration_since(now).unwrap_or(Duration::ZERO)
    }
}

/// Certificate together with the keys it binds
#[derive(Debug, Clone)]
pub struct Credentials {
    pub certificate: ClientCertificate,
    pub keys: KeyPair,
}

/// Result of [`CertificateStore::current_certificate`]
#[derive(Debug, Clone)]
pub enum CertificateStatus {
    /// Usable for a handshake
    Valid(Arc<Credentials>),
    /// Missing, expired, or inside the renewal margin
    NeedsRenewal,
}

/// Certificate as returned by the issuing backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub body: String,
    pub not_after: SystemTime,
}

/// Issuing backend errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IssueError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Not authorized: {0}")]
    Unauthorized(String),
}

/// Backend that signs client certificates
pub trait CertificateIssuer: Send + Sync + 'static {
    /// Issue a certificate for `public_key`
    fn issue(
        &self,
        public_key: &PublicKey,
    ) -> impl Future<Output = Result<IssuedCertificate, IssueError>> + Send;
}

/// Renewal errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenewalError {
    #[error("Renewal failed: {0}")]
    Network(String),

    #[error("Renewal not authorized: {0}")]
    Unauthorized(String),

    #[error("Issued certificate expires inside the renewal margin")]
    ExpiresTooSoon,

    #[error("Renewal interrupted")]
    Interrupted,
}

impl From<IssueError> for RenewalError {
    fn from(err: IssueError) -> Self {
        match err {
            IssueError::Network(msg) => RenewalError::Network(msg),
            IssueError::Unauthorized(msg) => RenewalError::Unauthorized(msg),
        }
    }
}

type RenewalOutcome = Option<Result<Arc<Credentials>, RenewalError>>;

enum Role {
    Leader(watch::Sender<RenewalOutcome>, KeyPair),
    Follower(watch::Receiver<RenewalOutcome>),
    /// A renewal for keys about to be replaced is running
    WaitThenRotate(watch::Receiver<RenewalOutcome>),
}

struct InFlight {
    outcome: watch::Receiver<RenewalOutcome>,
    /// Whether this request signs freshly rotated keys
    rotation: bool,
}

struct StoreInner {
    keys: KeyPair,
    credentials: Option<Arc<Credentials>>,
    in_flight: Option<InFlight>,
}

/// Owner of the client credentials
pub struct CertificateStore<I> {
    issuer: I,
    renewal_margin: Duration,
    inner: Mutex<StoreInner>,
}

impl<I: CertificateIssuer> CertificateStore<I> {
    /// Create an empty store with freshly generated keys
    pub fn new(issuer: I, renewal_margin: Duration) -> Self {
        Self::with_keys(issuer, renewal_margin, KeyPair::generate())
    }

    pub fn with_keys(issuer: I, renewal_margin: Duration, keys: KeyPair) -> Self {
        Self {
            issuer,
            renewal_margin,
            inner: Mutex::new(StoreInner {
                keys,
                credentials: None,
                in_flight: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn public_key(&self) -> PublicKey {
        self.lock().keys.public
    }

    pub fn renewal_margin(&self) -> Duration {
        self.renewal_margin
    }

    /// Credentials usable right now, or `NeedsRenewal`
    pub fn current_certificate(&self) -> CertificateStatus {
        let inner = self.lock();
        match &inner.credentials {
            Some(creds) if self.usable_at(&creds.certificate, SystemTime::now()) => {
                CertificateStatus::Valid(Arc::clone(creds))
            }
            _ => CertificateStatus::NeedsRenewal,
        }
    }

    /// Request a new certificate for the current keys
    pub async fn renew(&self) -> Result<Arc<Credentials>, RenewalError> {
        self.renew_inner(false).await
    }

    /// Regenerate the key pair, then request a certificate for it
    pub async fn renew_with_new_keys(&self) -> Result<Arc<Credentials>, RenewalError> {
        self.renew_inner(true).await
    }

    /// Drop the stored certificate
    pub fn purge(&self) {
        if self.lock().credentials.take().is_some() {
            info!("Client certificate purged");
        }
    }

    fn usable_at(&self, certificate: &ClientCertificate, now: SystemTime) -> bool {
        certificate.remaining_at(now) > self.renewal_margin
    }

    async fn renew_inner(&self, new_keys: bool) -> Result<Arc<Credentials>, RenewalError> {
        let (tx, keys) = loop {
            match self.claim(new_keys) {
                Role::Leader(tx, keys) => break (tx, keys),
                Role::Follower(rx) => {
                    debug!("Joining in-flight certificate renewal");
                    return Self::await_in_flight(rx).await;
                }
                Role::WaitThenRotate(rx) => {
                    debug!("Waiting for renewal of the old keys before rotating");
                    let _ = Self::await_in_flight(rx).await;
                }
            }
        };

        let slot = InFlightSlot { store: self };
        let result = self.issue_for(keys).await;

        match &result {
            Ok(creds) => {
                info!(
                    valid_for_secs = creds.certificate.remaining_at(SystemTime::now()).as_secs(),
                    "Client certificate renewed"
                );
                self.lock().credentials = Some(Arc::clone(creds));
            }
            Err(err) => warn!(error = %err, "Certificate renewal failed"),
        }

        drop(slot);
        tx.send_replace(Some(result.clone()));
        result
    }

    fn claim(&self, new_keys: bool) -> Role {
        let mut inner = self.lock();
        if let Some(in_flight) = &inner.in_flight {
            let outcome = in_flight.outcome.clone();
            return if new_keys && !in_flight.rotation {
                Role::WaitThenRotate(outcome)
            } else {
                Role::Follower(outcome)
            };
        }

        if new_keys {
            inner.keys = KeyPair::generate();
            inner.credentials = None;
            info!(fingerprint = %inner.keys.fingerprint(), "Regenerated client keys");
        }

        let (tx, rx) = watch::channel(None);
        inner.in_flight = Some(InFlight {
            outcome: rx,
            rotation: new_keys,
        });
        Role::Leader(tx, inner.keys.clone())
    }

    async fn await_in_flight(
        mut rx: watch::Receiver<RenewalOutcome>,
    ) -> Result<Arc<Credentials>, RenewalError> {
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RenewalError::Interrupted)?
            .clone();
        outcome.unwrap_or(Err(RenewalError::Interrupted))
    }

    async fn issue_for(&self, keys: KeyPair) -> Result<Arc<Credentials>, RenewalError> {
        let issued = self.issuer.issue(&keys.public).await?;
        let certificate = ClientCertificate {
            body: issued.body,
            not_after: issued.not_after,
            key_fingerprint: keys.fingerprint(),
        };

        if !self.usable_at(&certificate, SystemTime::now()) {
            return Err(RenewalError::ExpiresTooSoon);
        }

        Ok(Arc::new(Credentials { certificate, keys }))
    }
}

/// Clears the in-flight slot when the driving renewal finishes or is dropped
struct InFlightSlot<'a, I> {
    store: &'a CertificateStore<I>,
}

impl<I> Drop for InFlightSlot<'_, I> {
    fn drop(&mut self) {
        self.store
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_flight = None;
    }
}

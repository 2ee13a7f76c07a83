//! Kill Switch
//!
//! Keeps traffic blocked at the platform filter whenever the connection is
//! not fully up.
//!
//! # Behavior
//!
//! When the kill switch is enabled and the state is anything but `Connected`:
//! - All traffic is blocked, or
//! - Only LAN traffic passes, if the LAN exception is enabled
//!
//! Rule changes are fail-closed: a rule is installed (or replaced) before the
//! next state is published, and removed only once `Connected` has been
//! published or the kill switch has been turned off.

use std::future::Future;
use std::net::IpAddr;
use tracing::{debug, warn};

/// Filter rule held while the connection is down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockingRule {
    /// Let LAN traffic through
    pub allow_lan: bool,
}

impl BlockingRule {
    /// Does this rule let traffic to `addr` through?
    pub fn permits(&self, addr: IpAddr) -> bool {
        self.allow_lan && is_lan(addr)
    }
}

/// Private, link-local and loopback ranges
pub fn is_lan(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local() || v4.is_loopback(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Filter errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("Traffic filter unavailable: {0}")]
    Unavailable(String),
}

/// Platform traffic filter
pub trait TrafficFilter: Send + Sync + 'static {
    /// Install the blocking rule, replacing any previous one
    fn install_blocking_rule(&self, allow_lan: bool) -> impl Future<Output = Result<(), FilterError>> + Send;

    /// Remove the blocking rule
    fn remove_blocking_rule(&self) -> impl Future<Output = Result<(), FilterError>> + Send;
}

/// Rule changes around one transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransitionPlan {
    /// Install before the new state is published
    pub install: Option<BlockingRule>,
    /// Remove after the new state is published
    pub remove_after: bool,
}

/// Plan rule changes for entering a state.
///
/// `policy` is the rule the settings ask for (`None` when the kill switch is
/// off), `connected` whether the state being entered is `Connected`.
pub fn plan(installed: Option<BlockingRule>, policy: Option<BlockingRule>, connected: bool) -> TransitionPlan {
    match policy {
        Some(rule) if !connected => TransitionPlan {
            install: (installed != Some(rule)).then_some(rule),
            remove_after: false,
        },
        _ => TransitionPlan {
            install: None,
            remove_after: installed.is_some(),
        },
    }
}

/// Kill switch controller, sole owner of the platform filter
pub struct KillSwitch<F> {
    filter: F,
    installed: Option<BlockingRule>,
}

impl<F: TrafficFilter> KillSwitch<F> {
    pub fn new(filter: F) -> Self {
        Self {
            filter,
            installed: None,
        }
    }

    /// Rule currently installed
    pub fn installed(&self) -> Option<BlockingRule> {
        self.installed
    }

    /// Apply the install half of `plan`
    pub async fn before_transition(&mut self, plan: &TransitionPlan) -> Result<(), FilterError> {
        if let Some(rule) = plan.install {
            warn!(allow_lan = rule.allow_lan, "Kill switch: blocking traffic");
            self.filter.install_blocking_rule(rule.allow_lan).await?;
            self.installed = Some(rule);
        }
        Ok(())
    }

    /// Apply the removal half of `plan`
    pub async fn after_transition(&mut self, plan: &TransitionPlan) -> Result<(), FilterError> {
        if plan.remove_after && self.installed.is_some() {
            self.filter.remove_blocking_rule().await?;
            self.installed = None;
            debug!("Kill switch: traffic allowed");
        }
        Ok(())
    }
}

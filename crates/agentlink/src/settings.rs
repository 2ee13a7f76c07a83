//! Settings Snapshot
//!
//! Immutable view of the user settings the connection core cares about.
//! Settings storage lives outside this crate and hands snapshots in through
//! a `tokio::sync::watch` channel.

use crate::kill_switch::BlockingRule;
use crate::transport::TransportKind;
use serde::{Deserialize, Serialize};

/// NetShield content filtering level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetShieldLevel {
    /// Filtering disabled
    #[default]
    Off,
    /// Block malware domains
    Malware,
    /// Block malware, ads and trackers
    MalwareAndAds,
}

impl NetShieldLevel {
    /// Numeric level sent to the agent
    pub const fn level(self) -> u8 {
        match self {
            NetShieldLevel::Off => 0,
            NetShieldLevel::Malware => 1,
            NetShieldLevel::MalwareAndAds => 2,
        }
    }
}

/// Which transport the user wants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolPreference {
    /// Try every configured transport
    #[default]
    Smart,
    /// Use exactly this transport
    Specific(TransportKind),
}

/// Settings relevant to the connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    /// Block traffic whenever the VPN is not connected
    pub kill_switch: bool,
    /// Keep LAN reachable while the kill switch blocks
    pub lan_access: bool,
    /// NetShield level
    pub netshield: NetShieldLevel,
    /// VPN Accelerator
    pub vpn_accelerator: bool,
    /// Randomized (strict) NAT
    pub randomized_nat: bool,
    /// Jailed mode
    pub jailed: bool,
    /// Safe mode, `None` when the account has no say in it
    pub safe_mode: Option<bool>,
    /// Protocol preference
    pub protocol: ProtocolPreference,
}

impl SettingsSnapshot {
    /// Blocking rule the kill switch must hold outside `Connected`,
    /// or `None` when the kill switch is off
    pub fn blocking_rule(&self) -> Option<BlockingRule> {
        self.kill_switch.then_some(BlockingRule {
            allow_lan: self.lan_access,
        })
    }
}

impl Default for SettingsSnapshot {
    fn default() -> Self {
        Self {
            kill_switch: false,
            lan_access: false,
            netshield: NetShieldLevel::Off,
            vpn_accelerator: true,
            randomized_nat: true,
            jailed: false,
            safe_mode: None,
            protocol: ProtocolPreference::Smart,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netshield_levels() {
        assert_eq!(NetShieldLevel::Off.level(), 0);
        assert_eq!(NetShieldLevel::Malware.level(), 1);
        assert_eq!(NetShieldLevel::MalwareAndAds.level(), 2);
    }

    #[test]
    fn test_blocking_rule_follows_kill_switch() {
        let mut settings = SettingsSnapshot::default();
        assert_eq!(settings.blocking_rule(), None);

        settings.kill_switch = true;
        assert_eq!(settings.blocking_rule(), Some(BlockingRule { allow_lan: false }));

        settings.lan_access = true;
        assert_eq!(settings.blocking_rule(), Some(BlockingRule { allow_lan: true }));
    }

    #[test]
    fn test_preference_serde() {
        let json = serde_json::to_string(&ProtocolPreference::Specific(TransportKind::Stealth)).unwrap();
        assert_eq!(json, r#"{"specific":"stealth"}"#);

        let parsed: ProtocolPreference = serde_json::from_str("\"smart\"").unwrap();
        assert_eq!(parsed, ProtocolPreference::Smart);
    }
}

//! Feature Negotiation
//!
//! Turns a [`SettingsSnapshot`] into the flag set pushed to the local agent.
//!
//! | Setting            | Wire key          | Value       |
//! |--------------------|-------------------|-------------|
//! | NetShield level    | `netshield-level` | 0 / 1 / 2   |
//! | VPN Accelerator    | `split-tcp`       | bool        |
//! | Randomized NAT     | `randomized-nat`  | bool        |
//! | Jailed mode        | `jail`            | bool        |
//! | Safe mode          | `safe-mode`       | bool, omitted when not applicable |
//!
//! Kill switch and LAN access are enforced locally and never reach the agent.
//! The wire keys are shared with deployed agents and must not be renamed.

use crate::settings::SettingsSnapshot;
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Agent feature keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FeatureKey {
    SplitTcp,
    NetShieldLevel,
    Jail,
    RandomizedNat,
    /// Agent-internal. No user setting maps to it; reserved for server
    /// bouncing once the client learns to drive it.
    Bouncing,
    SafeMode,
}

impl FeatureKey {
    pub const ALL: [FeatureKey; 6] = [
        FeatureKey::SplitTcp,
        FeatureKey::NetShieldLevel,
        FeatureKey::Jail,
        FeatureKey::RandomizedNat,
        FeatureKey::Bouncing,
        FeatureKey::SafeMode,
    ];

    /// Wire name of the key
    pub const fn as_str(self) -> &'static str {
        match self {
            FeatureKey::SplitTcp => "split-tcp",
            FeatureKey::NetShieldLevel => "netshield-level",
            FeatureKey::Jail => "jail",
            FeatureKey::RandomizedNat => "randomized-nat",
            FeatureKey::Bouncing => "bouncing",
            FeatureKey::SafeMode => "safe-mode",
        }
    }
}

impl fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeatureKey {
    type Err = FeatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FeatureKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| FeatureError::UnknownKey(s.to_string()))
    }
}

/// Scalar flag value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl From<bool> for FeatureValue {
    fn from(value: bool) -> Self {
        FeatureValue::Bool(value)
    }
}

impl From<u8> for FeatureValue {
    fn from(value: u8) -> Self {
        FeatureValue::Int(i64::from(value))
    }
}

/// Immutable set of agent feature flags, at most one value per key.
///
/// Serializes to a JSON object keyed by the wire names. Keys this build
/// does not know are skipped on input, so newer agents can echo more.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureFlagSet {
    entries: BTreeMap<FeatureKey, FeatureValue>,
}

impl FeatureFlagSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn with(mut self, key: FeatureKey, value: impl Into<FeatureValue>) -> Self {
        self.entries.insert(key, value.into());
        self
    }

    pub fn get(&self, key: FeatureKey) -> Option<&FeatureValue> {
        self.entries.get(&key)
    }

    pub fn contains(&self, key: FeatureKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FeatureKey, &FeatureValue)> {
        self.entries.iter().map(|(key, value)| (*key, value))
    }

    /// Keys whose value differs between `self` and `other`, including keys
    /// present in only one of them
    pub fn changed_keys(&self, other: &FeatureFlagSet) -> Vec<FeatureKey> {
        FeatureKey::ALL
            .into_iter()
            .filter(|key| self.get(*key) != other.get(*key))
            .collect()
    }
}

impl Serialize for FeatureFlagSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key.as_str(), value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for FeatureFlagSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SetVisitor;

        impl<'de> Visitor<'de> for SetVisitor {
            type Value = FeatureFlagSet;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of feature keys to scalar values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = BTreeMap::new();
                while let Some((name, value)) = access.next_entry::<String, FeatureValue>()? {
                    match name.parse::<FeatureKey>() {
                        Ok(key) => {
                            entries.insert(key, value);
                        }
                        Err(_) => debug!(key = %name, "Skipping unknown feature key"),
                    }
                }
                Ok(FeatureFlagSet { entries })
            }
        }

        deserializer.deserialize_map(SetVisitor)
    }
}

/// Derives agent feature flags from user settings
pub struct FeatureNegotiator;

impl FeatureNegotiator {
    /// Pure mapping from settings to flags
    pub fn derive(settings: &SettingsSnapshot) -> FeatureFlagSet {
        let set = FeatureFlagSet::new()
            .with(FeatureKey::NetShieldLevel, settings.netshield.level())
            .with(FeatureKey::SplitTcp, settings.vpn_accelerator)
            .with(FeatureKey::RandomizedNat, settings.randomized_nat)
            .with(FeatureKey::Jail, settings.jailed);

        match settings.safe_mode {
            Some(safe_mode) => set.with(FeatureKey::SafeMode, safe_mode),
            None => set,
        }
    }
}

/// Feature errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeatureError {
    #[error("Unknown feature key: {0}")]
    UnknownKey(String),
}

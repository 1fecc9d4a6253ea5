//! Crate-wide and per-device configuration.

use std::collections::HashMap;

/// Tunables threaded through [`crate::System::init`].
///
/// Both bounds exist to guarantee forward progress under adversarial
/// fan-out: a callback that writes memory in a way
/// that re-triggers its own watchpoint, or a rule with a pathologically
/// long action list, must not grow the matched/snapshotted set without
/// bound.
#[derive(Debug, Clone, Copy)]
pub struct SystemConfig {
    /// Maximum number of watchpoint matches dispatched per `notify` call.
    /// Excess matches are dropped with a `warn!` diagnostic; the call
    /// itself still succeeds. Default 32.
    pub max_matches_per_notification: usize,
    /// Maximum number of actions snapshotted per rule evaluation. Default
    /// 32.
    pub max_actions_per_rule_eval: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            max_matches_per_notification: 32,
            max_actions_per_rule_eval: 32,
        }
    }
}

/// Opaque key-value configuration handed to [`crate::device::DeviceOps::create`].
///
/// A thin owned-data struct built by the caller and passed through
/// unopinionated. The core never interprets these values itself.
#[derive(Debug, Clone, Default)]
pub struct DeviceConfig {
    values: HashMap<String, String>,
}

impl DeviceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_config_roundtrips_values() {
        let cfg = DeviceConfig::new().with("irq", "5").with("base", "0x1000");
        assert_eq!(cfg.get("irq"), Some("5"));
        assert_eq!(cfg.get("base"), Some("0x1000"));
        assert_eq!(cfg.get("missing"), None);
    }

    #[test]
    fn default_system_config_matches_spec_caps() {
        let cfg = SystemConfig::default();
        assert_eq!(cfg.max_matches_per_notification, 32);
        assert_eq!(cfg.max_actions_per_rule_eval, 32);
    }
}

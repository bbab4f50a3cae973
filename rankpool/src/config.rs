//! Configuration for the dispatch engine and its buffer pools.

use serde::{Deserialize, Serialize};

use crate::error::{CommError, CommResult};
use crate::types::units_for_bytes;

/// How the dispatch engine looks for incoming messages.
///
/// Chosen once when the engine is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReceptionPolicy {
    /// Probe connections in rotating order; no peer is starved.
    #[default]
    RoundRobin,
    /// Single probe for any source. Lowest latency, no fairness.
    AnySource,
    /// Ring of pre-posted receives tested head first.
    PersistentRing,
}

/// Static capacities and policies of one rank's communication layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommConfig {
    /// Reception policy.
    pub reception: ReceptionPolicy,

    /// With round-robin reception, probe a single connection per tick
    /// instead of cycling until a message is read.
    pub one_probe_per_tick: bool,

    /// Number of slots tracking in-flight sends.
    pub max_dirty_buffers: usize,

    /// Largest message the substrate sends without a rendezvous.
    ///
    /// Sizes the default aggregation flush threshold.
    pub eager_limit_bytes: usize,

    /// Size of every ring buffer slot and of persistent receive buffers.
    pub max_message_bytes: usize,

    /// Ring slots backing the outbox.
    pub outbox_buffers: usize,

    /// Ring slots backing the inbox.
    pub inbox_buffers: usize,

    /// Maximum number of queued messages per mailbox.
    pub mailbox_capacity: usize,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            reception: ReceptionPolicy::RoundRobin,
            one_probe_per_tick: false,
            max_dirty_buffers: 64,
            eager_limit_bytes: 4096,
            max_message_bytes: 4000,
            outbox_buffers: 64,
            inbox_buffers: 64,
            mailbox_capacity: 64,
        }
    }
}

impl CommConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(document: &str) -> CommResult<Self> {
        let config: CommConfig = serde_json::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Small pools for tests and single-host runs.
    pub fn local() -> Self {
        Self {
            max_dirty_buffers: 16,
            outbox_buffers: 16,
            inbox_buffers: 16,
            mailbox_capacity: 16,
            ..Self::default()
        }
    }

    /// Select the reception policy.
    pub fn with_reception(mut self, reception: ReceptionPolicy) -> Self {
        self.reception = reception;
        self
    }

    /// Probe exactly one connection per tick under round-robin reception.
    pub fn with_one_probe_per_tick(mut self, enabled: bool) -> Self {
        self.one_probe_per_tick = enabled;
        self
    }

    /// Set the number of dirty buffer slots.
    pub fn with_max_dirty_buffers(mut self, slots: usize) -> Self {
        self.max_dirty_buffers = slots;
        self
    }

    /// Set the eager limit.
    pub fn with_eager_limit_bytes(mut self, bytes: usize) -> Self {
        self.eager_limit_bytes = bytes;
        self
    }

    /// Set the ring slot counts of both mailboxes.
    pub fn with_buffers(mut self, outbox: usize, inbox: usize) -> Self {
        self.outbox_buffers = outbox;
        self.inbox_buffers = inbox;
        self
    }

    /// Units that fit in one ring slot.
    pub fn max_message_units(&self) -> usize {
        units_for_bytes(self.max_message_bytes)
    }

    /// Units that fit under the eager limit.
    pub fn eager_limit_units(&self) -> usize {
        units_for_bytes(self.eager_limit_bytes)
    }

    /// Reject configurations the engine cannot run with.
    ///
    /// An outbox slot is pinned at most once while its send is in flight, so
    /// at least one dirty slot per outbox slot rules out `AllBuffersDirty`.
    pub fn validate(&self) -> CommResult<()> {
        let checks = [
            (self.max_dirty_buffers, "max_dirty_buffers"),
            (self.max_message_units(), "max_message_bytes"),
            (self.eager_limit_units(), "eager_limit_bytes"),
            (self.outbox_buffers, "outbox_buffers"),
            (self.inbox_buffers, "inbox_buffers"),
            (self.mailbox_capacity, "mailbox_capacity"),
        ];
        for (value, field) in checks {
            if value == 0 {
                return Err(CommError::InvalidConfig(format!(
                    "{field} must hold at least one unit or slot"
                )));
            }
        }
        if self.max_dirty_buffers < self.outbox_buffers {
            return Err(CommError::InvalidConfig(format!(
                "max_dirty_buffers ({}) must cover outbox_buffers ({})",
                self.max_dirty_buffers, self.outbox_buffers
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CommConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reception, ReceptionPolicy::RoundRobin);
        assert_eq!(config.eager_limit_units(), 512);
        assert_eq!(config.max_message_units(), 500);
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = CommConfig::from_json_str(
            r#"{"reception": "persistent_ring", "max_dirty_buffers": 4, "outbox_buffers": 4}"#,
        )
        .expect("valid document");
        assert_eq!(config.reception, ReceptionPolicy::PersistentRing);
        assert_eq!(config.max_dirty_buffers, 4);
        assert_eq!(config.inbox_buffers, CommConfig::default().inbox_buffers);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = CommConfig::from_json_str(r#"{"outbox_buffers": 0}"#);
        assert!(matches!(result, Err(CommError::InvalidConfig(_))));
    }

    #[test]
    fn test_dirty_slots_must_cover_outbox() {
        assert!(CommConfig::local().validate().is_ok());
        let result = CommConfig::from_json_str(r#"{"max_dirty_buffers": 32}"#);
        assert!(matches!(result, Err(CommError::InvalidConfig(_))));
        assert!(CommConfig::default()
            .with_max_dirty_buffers(8)
            .with_buffers(8, 64)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_unknown_policy_is_parse_error() {
        let result = CommConfig::from_json_str(r#"{"reception": "broadcast"}"#);
        assert!(matches!(result, Err(CommError::Config(_))));
    }

    #[test]
    fn test_builders() {
        let config = CommConfig::local()
            .with_reception(ReceptionPolicy::AnySource)
            .with_max_dirty_buffers(2)
            .with_buffers(3, 5);
        assert_eq!(config.reception, ReceptionPolicy::AnySource);
        assert_eq!(config.max_dirty_buffers, 2);
        assert_eq!((config.outbox_buffers, config.inbox_buffers), (3, 5));
    }
}

//! Runtime configuration, immutable after server construction.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timeouts and feature switches recognized by the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TssConfig {
    /// Wall clock for a full keygen run.
    #[serde(with = "duration_secs")]
    pub keygen_timeout: Duration,
    /// Wall clock for a full keysign run.
    #[serde(with = "duration_secs")]
    pub keysign_timeout: Duration,
    /// Window for party formation (both join-party variants).
    #[serde(with = "duration_secs")]
    pub party_timeout: Duration,
    /// Bound on safe-prime pre-parameter generation at boot.
    #[serde(with = "duration_secs")]
    pub pre_param_timeout: Duration,
    /// How long a non-signer waits for the signature notifier.
    #[serde(with = "duration_secs")]
    pub sig_notify_timeout: Duration,
    /// Turns on metrics emission.
    pub enable_monitor: bool,
}

impl Default for TssConfig {
    fn default() -> Self {
        Self {
            keygen_timeout: Duration::from_secs(120),
            keysign_timeout: Duration::from_secs(30),
            party_timeout: Duration::from_secs(45),
            pre_param_timeout: Duration::from_secs(300),
            sig_notify_timeout: Duration::from_secs(30),
            enable_monitor: false,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_round_trips_as_seconds() {
        let conf = TssConfig::default();
        let json = serde_json::to_string(&conf).unwrap();
        let restored: TssConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.keygen_timeout, conf.keygen_timeout);
        assert_eq!(restored.sig_notify_timeout, conf.sig_notify_timeout);
        assert!(!restored.enable_monitor);
    }
}

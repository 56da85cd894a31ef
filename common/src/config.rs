use serde::{Deserialize, Serialize};

use crate::store::SchemaVersion;

/// How much of the persisted record the boot decision trusts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidityPolicy {
    /// Only the validity flag counts; broken fields surface later in the network driver.
    #[default]
    FlagOnly,
    /// A flagged record must also carry usable network fields.
    Strict,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BlindsConfig {
    pub motion_duration_ms: u64,
    pub light_threshold: u16,
    pub tick_interval_ms: u64,
    pub validity_policy: ValidityPolicy,
    pub schema: SchemaVersion,
    pub provisioning_http_port: u16,
}

impl Default for BlindsConfig {
    fn default() -> Self {
        Self {
            motion_duration_ms: 2_000,
            light_threshold: 150,
            tick_interval_ms: 10,
            validity_policy: ValidityPolicy::FlagOnly,
            schema: SchemaVersion::V1,
            provisioning_http_port: 8080,
        }
    }
}

impl BlindsConfig {
    pub fn sanitize(&mut self) {
        self.motion_duration_ms = self.motion_duration_ms.clamp(100, 60_000);
        self.light_threshold = self.light_threshold.min(1023);
        self.tick_interval_ms = self.tick_interval_ms.clamp(1, 1_000);
        if self.provisioning_http_port == 0 {
            self.provisioning_http_port = Self::default().provisioning_http_port;
        }
    }
}

use crate::{
    config::ValidityPolicy,
    medium::PersistentMedium,
    store::{ConfigError, ConfigurationRecord, ConfigurationStore, StoreError},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningReason {
    Unconfigured,
    Rejected(ConfigError),
}

/// Outcome of the boot decision. The store moves into whichever driver
/// runs, so there is exactly one instance for the life of the process.
pub enum Boot<M> {
    Network {
        store: ConfigurationStore<M>,
        record: ConfigurationRecord,
    },
    Provisioning {
        store: ConfigurationStore<M>,
        reason: ProvisioningReason,
    },
}

impl<M> Boot<M> {
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BootstrapSelector {
    policy: ValidityPolicy,
}

impl BootstrapSelector {
    pub fn new(policy: ValidityPolicy) -> Self {
        Self { policy }
    }

    pub fn select<M: PersistentMedium>(
        &self,
        mut store: ConfigurationStore<M>,
    ) -> Result<Boot<M>, StoreError> {
        if !store.load()? {
            return Ok(Boot::Provisioning {
                store,
                reason: ProvisioningReason::Unconfigured,
            });
        }

        let record = store.record().clone();
        if self.policy == ValidityPolicy::Strict {
            if let Err(err) = record.validate_network() {
                return Ok(Boot::Provisioning {
                    store,
                    reason: ProvisioningReason::Rejected(err),
                });
            }
        }

        Ok(Boot::Network { store, record })
    }
}

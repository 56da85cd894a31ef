pub mod blinds;
pub mod bootstrap;
pub mod config;
pub mod hardware;
pub mod medium;
pub mod node;
pub mod protocol;
pub mod provisioning;
pub mod store;
pub mod topics;
pub mod types;

pub use blinds::{ActuatorController, BlindsEvent, CommandObserver};
pub use bootstrap::{Boot, BootstrapSelector, ProvisioningReason};
pub use config::{BlindsConfig, ValidityPolicy};
pub use hardware::{Actuator, LightSensor};
pub use medium::{FileMedium, MediumError, MemoryMedium, PersistentMedium};
pub use node::{BlindsNode, Publication, StatusOutbox};
pub use protocol::{parse_command, Command, ProtocolError};
pub use provisioning::{apply_form, apply_form_body, FormError, ProvisioningForm};
pub use store::{
    ConfigError, ConfigurationRecord, ConfigurationStore, FormatDefaults, FormatMode,
    SchemaVersion, StoreError,
};
pub use topics::*;
pub use types::{Direction, MotionState, OperatingMode, Snapshot, StatusPayload};

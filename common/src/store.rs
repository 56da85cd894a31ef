//! Persistent configuration record.
//!
//! The byte layout is an explicit, ordered field table per schema version;
//! offsets come from that table and nothing else. `V1` matches the layout
//! written by the first generation of the firmware byte for byte.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    medium::{MediumError, PersistentMedium},
    types::{MotionState, OperatingMode},
};

pub const MAX_SSID: usize = 32;
pub const MAX_PASSWORD: usize = 63;
pub const MAX_NAME: usize = 32;
pub const MAX_MQTT_SERVER: usize = 32;
pub const MAX_MQTT_PORT: usize = 32;

/// The only byte value accepted as "configured".
pub const VALID_MARKER: u8 = 0x01;
const INVALID_MARKER: u8 = 0x00;
const V2_TAG: u8 = 2;

pub const DEFAULT_NAME: &str = "blinds";
pub const DEFAULT_MQTT_SERVER: &str = "test.mosquitto.org";
pub const DEFAULT_MQTT_PORT: &str = "1883";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("persistent medium failure: {0}")]
    Medium(#[from] MediumError),
}

/// Field values that are stored fine but cannot drive the network layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("network identifier is empty")]
    MissingSsid,
    #[error("broker address is empty")]
    MissingBroker,
    #[error("broker port `{0}` is not a valid TCP port")]
    InvalidPort(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaVersion {
    #[default]
    V1,
    /// Adds the mode/motion snapshot and a version tag.
    V2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Ssid,
    Password,
    Name,
    MqttServer,
    MqttPort,
    Mode,
    Motion,
    Version,
    Valid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub field: Field,
    pub width: usize,
}

const fn fixed(field: Field, width: usize) -> FieldSpec {
    FieldSpec { field, width }
}

const V1_FIELDS: &[FieldSpec] = &[
    fixed(Field::Ssid, MAX_SSID),
    fixed(Field::Password, MAX_PASSWORD),
    fixed(Field::Name, MAX_NAME),
    fixed(Field::MqttServer, MAX_MQTT_SERVER),
    fixed(Field::MqttPort, MAX_MQTT_PORT),
    fixed(Field::Valid, 1),
];

const V2_FIELDS: &[FieldSpec] = &[
    fixed(Field::Ssid, MAX_SSID),
    fixed(Field::Password, MAX_PASSWORD),
    fixed(Field::Name, MAX_NAME),
    fixed(Field::MqttServer, MAX_MQTT_SERVER),
    fixed(Field::MqttPort, MAX_MQTT_PORT),
    fixed(Field::Mode, 1),
    fixed(Field::Motion, 1),
    fixed(Field::Version, 1),
    fixed(Field::Valid, 1),
];

impl SchemaVersion {
    pub fn fields(self) -> &'static [FieldSpec] {
        match self {
            Self::V1 => V1_FIELDS,
            Self::V2 => V2_FIELDS,
        }
    }

    /// `(offset, spec)` for every field, in write order.
    pub fn layout(self) -> impl Iterator<Item = (usize, FieldSpec)> {
        self.fields().iter().scan(0_usize, |offset, spec| {
            let at = *offset;
            *offset += spec.width;
            Some((at, *spec))
        })
    }

    pub fn size(self) -> usize {
        self.fields().iter().map(|spec| spec.width).sum()
    }

    pub fn offset_of(self, field: Field) -> Option<usize> {
        self.layout()
            .find(|(_, spec)| spec.field == field)
            .map(|(offset, _)| offset)
    }

    pub fn persists_snapshot(self) -> bool {
        matches!(self, Self::V2)
    }
}

/// Truncates to `capacity - 1` bytes on a character boundary so the
/// terminating NUL always fits.
fn truncate_to(value: &str, capacity: usize) -> String {
    let limit = capacity.saturating_sub(1);
    if value.len() <= limit {
        return value.to_string();
    }
    let mut end = limit;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

fn encode_text(value: &str, width: usize) -> Vec<u8> {
    let mut bytes = vec![0_u8; width];
    let text = truncate_to(value, width);
    bytes[..text.len()].copy_from_slice(text.as_bytes());
    bytes
}

fn decode_text(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigurationRecord {
    ssid: String,
    password: String,
    name: String,
    mqtt_server: String,
    mqtt_port: String,
    mode: Option<OperatingMode>,
    state: Option<MotionState>,
    valid: bool,
}

impl ConfigurationRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mqtt_server(&self) -> &str {
        &self.mqtt_server
    }

    pub fn mqtt_port(&self) -> &str {
        &self.mqtt_port
    }

    pub fn mode(&self) -> Option<OperatingMode> {
        self.mode
    }

    pub fn state(&self) -> Option<MotionState> {
        self.state
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn set_ssid(&mut self, value: &str) {
        self.ssid = truncate_to(value, MAX_SSID);
    }

    pub fn set_password(&mut self, value: &str) {
        self.password = truncate_to(value, MAX_PASSWORD);
    }

    pub fn set_name(&mut self, value: &str) {
        self.name = truncate_to(value, MAX_NAME);
    }

    pub fn set_mqtt_server(&mut self, value: &str) {
        self.mqtt_server = truncate_to(value, MAX_MQTT_SERVER);
    }

    pub fn set_mqtt_port(&mut self, value: &str) {
        self.mqtt_port = truncate_to(value, MAX_MQTT_PORT);
    }

    pub fn set_snapshot(&mut self, mode: OperatingMode, state: MotionState) {
        self.mode = Some(mode);
        self.state = Some(state);
    }

    pub fn broker_port(&self) -> Result<u16, ConfigError> {
        match self.mqtt_port.trim().parse::<u16>() {
            Ok(port) if port > 0 => Ok(port),
            _ => Err(ConfigError::InvalidPort(self.mqtt_port.clone())),
        }
    }

    /// Checks the fields the network driver cannot work without.
    pub fn validate_network(&self) -> Result<(), ConfigError> {
        if self.ssid.trim().is_empty() {
            return Err(ConfigError::MissingSsid);
        }
        if self.mqtt_server.trim().is_empty() {
            return Err(ConfigError::MissingBroker);
        }
        self.broker_port().map(|_| ())
    }

    fn text(&self, field: Field) -> &str {
        match field {
            Field::Ssid => &self.ssid,
            Field::Password => &self.password,
            Field::Name => &self.name,
            Field::MqttServer => &self.mqtt_server,
            Field::MqttPort => &self.mqtt_port,
            Field::Mode | Field::Motion | Field::Version | Field::Valid => "",
        }
    }

    fn set_text(&mut self, field: Field, value: String) {
        match field {
            Field::Ssid => self.ssid = value,
            Field::Password => self.password = value,
            Field::Name => self.name = value,
            Field::MqttServer => self.mqtt_server = value,
            Field::MqttPort => self.mqtt_port = value,
            Field::Mode | Field::Motion | Field::Version | Field::Valid => {}
        }
    }
}

#[derive(Debug, Serialize)]
struct RecordView<'a> {
    #[serde(rename = "SSID")]
    ssid: &'a str,
    #[serde(rename = "Password")]
    password: &'a str,
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "MQTT server")]
    mqtt_server: &'a str,
    #[serde(rename = "MQTT port")]
    mqtt_port: &'a str,
    #[serde(rename = "Mode", skip_serializing_if = "Option::is_none")]
    mode: Option<&'static str>,
    #[serde(rename = "State", skip_serializing_if = "Option::is_none")]
    state: Option<&'static str>,
    #[serde(rename = "Configured")]
    valid: bool,
}

/// How the factory-reset variant leaves the medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatMode {
    /// Defaults written, device boots unconfigured.
    Erase,
    /// Defaults written and flagged valid, device boots configured.
    WithDefaults,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatDefaults {
    pub ssid: String,
    pub password: String,
    pub name: String,
    pub mqtt_server: String,
    pub mqtt_port: String,
}

impl FormatDefaults {
    pub fn new(ssid: &str, password: &str) -> Self {
        Self {
            ssid: ssid.to_string(),
            password: password.to_string(),
            name: DEFAULT_NAME.to_string(),
            mqtt_server: DEFAULT_MQTT_SERVER.to_string(),
            mqtt_port: DEFAULT_MQTT_PORT.to_string(),
        }
    }
}

pub struct ConfigurationStore<M> {
    medium: M,
    schema: SchemaVersion,
    record: ConfigurationRecord,
}

impl<M: PersistentMedium> ConfigurationStore<M> {
    pub fn new(medium: M, schema: SchemaVersion) -> Self {
        Self {
            medium,
            schema,
            record: ConfigurationRecord::default(),
        }
    }

    pub fn schema(&self) -> SchemaVersion {
        self.schema
    }

    pub fn record(&self) -> &ConfigurationRecord {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut ConfigurationRecord {
        &mut self.record
    }

    /// Replaces the in-memory record; nothing is written until `save`.
    pub fn replace_record(&mut self, record: ConfigurationRecord) {
        self.record = record;
    }

    pub fn medium(&self) -> &M {
        &self.medium
    }

    pub fn into_medium(self) -> M {
        self.medium
    }

    /// Reads the whole layout into memory and reports the validity flag.
    /// Never-written media read as unconfigured.
    pub fn load(&mut self) -> Result<bool, StoreError> {
        self.medium.begin(self.schema.size())?;

        let mut record = ConfigurationRecord::default();
        let mut tag_ok = !self.schema.persists_snapshot();

        for (offset, spec) in self.schema.layout() {
            let mut bytes = vec![0_u8; spec.width];
            self.medium.read(offset, &mut bytes)?;
            match spec.field {
                Field::Mode => record.mode = OperatingMode::from_code(bytes[0]),
                Field::Motion => record.state = MotionState::from_code(bytes[0]),
                Field::Version => tag_ok = bytes[0] == V2_TAG,
                Field::Valid => record.valid = bytes[0] == VALID_MARKER,
                text => record.set_text(text, decode_text(&bytes)),
            }
        }

        record.valid &= tag_ok;
        self.record = record;
        Ok(self.record.valid)
    }

    /// Writes the full layout, flag last, and commits. Marks the record valid.
    ///
    /// Under `V2` a record without a snapshot is written as `Manual`/`Closed`,
    /// so it reloads with those values rather than `None`.
    pub fn save(&mut self) -> Result<(), StoreError> {
        self.write_all(true)
    }

    /// Writes the full layout with the flag cleared, so the next boot
    /// treats the device as unconfigured whatever the other fields hold.
    pub fn erase(&mut self) -> Result<(), StoreError> {
        self.write_all(false)
    }

    pub fn format(
        &mut self,
        mode: FormatMode,
        defaults: &FormatDefaults,
    ) -> Result<(), StoreError> {
        let mut record = ConfigurationRecord::default();
        record.set_ssid(&defaults.ssid);
        record.set_password(&defaults.password);
        record.set_name(&defaults.name);
        record.set_mqtt_server(&defaults.mqtt_server);
        record.set_mqtt_port(&defaults.mqtt_port);
        self.record = record;

        match mode {
            FormatMode::Erase => self.erase(),
            FormatMode::WithDefaults => self.save(),
        }
    }

    pub fn describe(&self) -> String {
        let persists = self.schema.persists_snapshot();
        let view = RecordView {
            ssid: &self.record.ssid,
            password: &self.record.password,
            name: &self.record.name,
            mqtt_server: &self.record.mqtt_server,
            mqtt_port: &self.record.mqtt_port,
            mode: self
                .record
                .mode
                .filter(|_| persists)
                .map(OperatingMode::as_str),
            state: self
                .record
                .state
                .filter(|_| persists)
                .map(MotionState::as_str),
            valid: self.record.valid,
        };
        serde_json::to_string_pretty(&view).unwrap_or_default()
    }

    fn write_all(&mut self, valid: bool) -> Result<(), StoreError> {
        self.medium.begin(self.schema.size())?;

        for (offset, spec) in self.schema.layout() {
            let bytes = match spec.field {
                Field::Mode => vec![self.record.mode.unwrap_or_default().code()],
                Field::Motion => vec![self.record.state.unwrap_or_default().code()],
                Field::Version => vec![V2_TAG],
                Field::Valid => vec![if valid { VALID_MARKER } else { INVALID_MARKER }],
                text => encode_text(self.record.text(text), spec.width),
            };
            self.medium.write(offset, &bytes)?;
        }

        self.medium.commit()?;
        self.record.valid = valid;
        Ok(())
    }
}

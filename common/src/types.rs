use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    #[default]
    Manual,
    Automatic,
}

impl OperatingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Automatic => "automatic",
        }
    }

    /// Wire code used by remote controllers and the persisted snapshot.
    pub fn code(self) -> u8 {
        match self {
            Self::Manual => 1,
            Self::Automatic => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Manual),
            2 => Some(Self::Automatic),
            _ => None,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "manual" => Some(Self::Manual),
            "automatic" => Some(Self::Automatic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotionState {
    Opening,
    Opened,
    Closing,
    #[default]
    Closed,
}

impl MotionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Opening => "opening",
            Self::Opened => "opened",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Opening => 1,
            Self::Opened => 2,
            Self::Closing => 3,
            Self::Closed => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Opening),
            2 => Some(Self::Opened),
            3 => Some(Self::Closing),
            4 => Some(Self::Closed),
            _ => None,
        }
    }

    /// `true` while the actuator is energized.
    pub fn is_moving(self) -> bool {
        matches!(self, Self::Opening | Self::Closing)
    }
}

/// Servo spin direction. `Reverse` opens the blind, `Forward` closes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// Read-only view of the controller handed to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Snapshot {
    pub mode: OperatingMode,
    pub state: MotionState,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ObjectStatus {
    pub state: &'static str,
    pub mode: &'static str,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatusPayload {
    pub ip: String,
    pub name: String,
    pub objects: ObjectStatus,
}

impl StatusPayload {
    pub fn new(ip: &str, name: &str, snapshot: Snapshot) -> Self {
        Self {
            ip: ip.to_string(),
            name: name.to_string(),
            objects: ObjectStatus {
                state: snapshot.state.as_str(),
                mode: snapshot.mode.as_str(),
            },
        }
    }
}

//! Capabilities the controller drives. Implementations must return promptly;
//! the control loop never waits on hardware.

use crate::types::Direction;

pub trait Actuator {
    fn energize(&mut self, direction: Direction);
    fn release(&mut self);
}

pub trait LightSensor {
    /// Raw ambient light level on the 10-bit scale (0..=1023).
    fn read_light(&mut self) -> u16;
}

impl<T: Actuator + ?Sized> Actuator for &mut T {
    fn energize(&mut self, direction: Direction) {
        (**self).energize(direction);
    }

    fn release(&mut self) {
        (**self).release();
    }
}

impl<T: LightSensor + ?Sized> LightSensor for &mut T {
    fn read_light(&mut self) -> u16 {
        (**self).read_light()
    }
}

/// Fixed reading, useful for tests and for bench setups without a photocell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedLight(pub u16);

impl LightSensor for FixedLight {
    fn read_light(&mut self) -> u16 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorCommand {
    Energize(Direction),
    Release,
}

/// Actuator that only remembers what it was told.
#[derive(Debug, Default, Clone)]
pub struct RecordingActuator {
    pub commands: Vec<ActuatorCommand>,
    energized: Option<Direction>,
}

impl RecordingActuator {
    pub fn energized(&self) -> Option<Direction> {
        self.energized
    }
}

impl Actuator for RecordingActuator {
    fn energize(&mut self, direction: Direction) {
        self.commands.push(ActuatorCommand::Energize(direction));
        self.energized = Some(direction);
    }

    fn release(&mut self) {
        self.commands.push(ActuatorCommand::Release);
        self.energized = None;
    }
}

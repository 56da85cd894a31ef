use crate::{
    config::BlindsConfig,
    hardware::{Actuator, LightSensor},
    types::{Direction, MotionState, OperatingMode, Snapshot},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlindsEvent {
    Open,
    Close,
    Timeout,
    DayDetected,
    NightDetected,
}

/// Receives every transition of an [`ActuatorController`].
///
/// Called synchronously before the triggering call returns. Handlers only
/// get a copy of the controller state; the controller holds the observer
/// by value, so a handler has no path back into it.
pub trait CommandObserver {
    fn on_set_mode(&mut self, snapshot: Snapshot);
    fn on_opening(&mut self, snapshot: Snapshot);
    fn on_opened(&mut self, snapshot: Snapshot);
    fn on_closing(&mut self, snapshot: Snapshot);
    fn on_closed(&mut self, snapshot: Snapshot);
}

#[derive(Debug)]
pub struct ActuatorController<A, O> {
    pub config: BlindsConfig,
    actuator: A,
    observer: O,

    mode: OperatingMode,
    state: MotionState,
    motion_start_ms: u64,
}

impl<A: Actuator, O: CommandObserver> ActuatorController<A, O> {
    pub fn new(config: BlindsConfig, actuator: A, observer: O) -> Self {
        Self {
            config,
            actuator,
            observer,
            mode: OperatingMode::Manual,
            state: MotionState::Closed,
            motion_start_ms: 0,
        }
    }

    /// Starts from a persisted snapshot. A motion interrupted by a restart
    /// cannot be resumed, so transient states come back as `Closed`.
    pub fn restore(
        config: BlindsConfig,
        actuator: A,
        observer: O,
        mode: OperatingMode,
        state: MotionState,
    ) -> Self {
        let mut controller = Self::new(config, actuator, observer);
        controller.mode = mode;
        if !state.is_moving() {
            controller.state = state;
        }
        controller
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    pub fn motion_start_ms(&self) -> u64 {
        self.motion_start_ms
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            mode: self.mode,
            state: self.state,
        }
    }

    pub fn is_night(&self, level: u16) -> bool {
        level < self.config.light_threshold
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    pub fn actuator(&self) -> &A {
        &self.actuator
    }

    pub fn set_mode(&mut self, mode: OperatingMode) {
        self.mode = mode;
        let snapshot = self.snapshot();
        self.observer.on_set_mode(snapshot);
    }

    pub fn open(&mut self, now_ms: u64) {
        self.handle(BlindsEvent::Open, now_ms);
    }

    pub fn close(&mut self, now_ms: u64) {
        self.handle(BlindsEvent::Close, now_ms);
    }

    /// Applies one event. Events that do not fit the current mode and state
    /// are dropped without a notification.
    pub fn handle(&mut self, event: BlindsEvent, now_ms: u64) {
        match (event, self.mode, self.state) {
            (BlindsEvent::Open, OperatingMode::Manual, MotionState::Closed)
            | (BlindsEvent::DayDetected, OperatingMode::Automatic, MotionState::Closed) => {
                self.start_motion(Direction::Reverse, MotionState::Opening, now_ms);
            }
            (BlindsEvent::Close, OperatingMode::Manual, MotionState::Opened)
            | (BlindsEvent::NightDetected, OperatingMode::Automatic, MotionState::Opened) => {
                self.start_motion(Direction::Forward, MotionState::Closing, now_ms);
            }
            (BlindsEvent::Timeout, _, MotionState::Opening) => {
                self.finish_motion(MotionState::Opened);
            }
            (BlindsEvent::Timeout, _, MotionState::Closing) => {
                self.finish_motion(MotionState::Closed);
            }
            _ => {}
        }
    }

    /// One pass of the periodic evaluation: resolve an expired motion first,
    /// then react to the light level. The light is read on every pass, in
    /// either mode.
    pub fn tick<S: LightSensor + ?Sized>(&mut self, now_ms: u64, sensor: &mut S) {
        if self.state.is_moving()
            && now_ms.saturating_sub(self.motion_start_ms) > self.config.motion_duration_ms
        {
            self.handle(BlindsEvent::Timeout, now_ms);
        }

        let level = sensor.read_light();
        let event = if self.is_night(level) {
            BlindsEvent::NightDetected
        } else {
            BlindsEvent::DayDetected
        };
        self.handle(event, now_ms);
    }

    fn start_motion(&mut self, direction: Direction, next: MotionState, now_ms: u64) {
        self.actuator.energize(direction);
        self.motion_start_ms = now_ms;
        self.state = next;
        let snapshot = self.snapshot();
        match next {
            MotionState::Opening => self.observer.on_opening(snapshot),
            _ => self.observer.on_closing(snapshot),
        }
    }

    fn finish_motion(&mut self, next: MotionState) {
        self.actuator.release();
        self.state = next;
        let snapshot = self.snapshot();
        match next {
            MotionState::Opened => self.observer.on_opened(snapshot),
            _ => self.observer.on_closed(snapshot),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{ActuatorCommand, FixedLight, RecordingActuator};
    use pretty_assertions::assert_eq;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        SetMode(Snapshot),
        Opening(Snapshot),
        Opened(Snapshot),
        Closing(Snapshot),
        Closed(Snapshot),
    }

    #[derive(Debug, Default)]
    struct CallLog(Vec<Call>);

    impl CommandObserver for CallLog {
        fn on_set_mode(&mut self, snapshot: Snapshot) {
            self.0.push(Call::SetMode(snapshot));
        }
        fn on_opening(&mut self, snapshot: Snapshot) {
            self.0.push(Call::Opening(snapshot));
        }
        fn on_opened(&mut self, snapshot: Snapshot) {
            self.0.push(Call::Opened(snapshot));
        }
        fn on_closing(&mut self, snapshot: Snapshot) {
            self.0.push(Call::Closing(snapshot));
        }
        fn on_closed(&mut self, snapshot: Snapshot) {
            self.0.push(Call::Closed(snapshot));
        }
    }

    const DAY: FixedLight = FixedLight(600);
    const NIGHT: FixedLight = FixedLight(20);

    type TestController = ActuatorController<RecordingActuator, CallLog>;

    fn controller() -> TestController {
        ActuatorController::new(
            BlindsConfig::default(),
            RecordingActuator::default(),
            CallLog::default(),
        )
    }

    fn controller_at(mode: OperatingMode, state: MotionState) -> TestController {
        let mut controller = controller();
        controller.mode = mode;
        controller.state = state;
        controller
    }

    fn snap(mode: OperatingMode, state: MotionState) -> Snapshot {
        Snapshot { mode, state }
    }

    #[test]
    fn starts_manual_and_closed() {
        let controller = controller();
        assert_eq!(controller.mode(), OperatingMode::Manual);
        assert_eq!(controller.state(), MotionState::Closed);
        assert!(controller.observer().0.is_empty());
    }

    #[test]
    fn open_from_manual_closed_starts_opening() {
        let mut controller = controller();
        controller.open(1_000);

        assert_eq!(controller.state(), MotionState::Opening);
        assert_eq!(controller.motion_start_ms(), 1_000);
        assert_eq!(
            controller.actuator().commands,
            vec![ActuatorCommand::Energize(Direction::Reverse)]
        );
        assert_eq!(
            controller.observer().0,
            vec![Call::Opening(snap(OperatingMode::Manual, MotionState::Opening))]
        );
    }

    #[test]
    fn timeout_resolves_opening_in_any_mode() {
        for mode in [OperatingMode::Manual, OperatingMode::Automatic] {
            let mut controller = controller_at(mode, MotionState::Opening);
            controller.handle(BlindsEvent::Timeout, 5_000);

            assert_eq!(controller.state(), MotionState::Opened);
            assert_eq!(
                controller.actuator().commands,
                vec![ActuatorCommand::Release]
            );
            assert_eq!(
                controller.observer().0,
                vec![Call::Opened(snap(mode, MotionState::Opened))]
            );
        }
    }

    #[test]
    fn timeout_resolves_closing_in_any_mode() {
        for mode in [OperatingMode::Manual, OperatingMode::Automatic] {
            let mut controller = controller_at(mode, MotionState::Closing);
            controller.handle(BlindsEvent::Timeout, 5_000);

            assert_eq!(controller.state(), MotionState::Closed);
            assert_eq!(
                controller.observer().0,
                vec![Call::Closed(snap(mode, MotionState::Closed))]
            );
        }
    }

    #[test]
    fn unmatched_events_are_silent_no_ops() {
        let modes = [OperatingMode::Manual, OperatingMode::Automatic];
        let states = [
            MotionState::Opening,
            MotionState::Opened,
            MotionState::Closing,
            MotionState::Closed,
        ];
        let events = [
            BlindsEvent::Open,
            BlindsEvent::Close,
            BlindsEvent::Timeout,
            BlindsEvent::DayDetected,
            BlindsEvent::NightDetected,
        ];

        let is_listed = |event, mode, state| {
            matches!(
                (event, mode, state),
                (BlindsEvent::Open, OperatingMode::Manual, MotionState::Closed)
                    | (BlindsEvent::Close, OperatingMode::Manual, MotionState::Opened)
                    | (BlindsEvent::Timeout, _, MotionState::Opening)
                    | (BlindsEvent::Timeout, _, MotionState::Closing)
                    | (
                        BlindsEvent::DayDetected,
                        OperatingMode::Automatic,
                        MotionState::Closed
                    )
                    | (
                        BlindsEvent::NightDetected,
                        OperatingMode::Automatic,
                        MotionState::Opened
                    )
            )
        };

        let mut checked = 0;
        for mode in modes {
            for state in states {
                for event in events {
                    if is_listed(event, mode, state) {
                        continue;
                    }
                    let mut controller = controller_at(mode, state);
                    controller.handle(event, 42);

                    assert_eq!(controller.snapshot(), snap(mode, state), "{event:?}");
                    assert!(controller.observer().0.is_empty(), "{event:?}");
                    assert!(controller.actuator().commands.is_empty(), "{event:?}");
                    checked += 1;
                }
            }
        }
        assert_eq!(checked, 40 - 8);
    }

    #[test]
    fn set_mode_notifies_once_and_keeps_motion() {
        let mut controller = controller();
        controller.open(0);
        controller.set_mode(OperatingMode::Automatic);

        assert_eq!(controller.mode(), OperatingMode::Automatic);
        assert_eq!(controller.state(), MotionState::Opening);
        assert_eq!(
            controller.observer().0.last(),
            Some(&Call::SetMode(snap(
                OperatingMode::Automatic,
                MotionState::Opening
            )))
        );
        assert_eq!(controller.observer().0.len(), 2);
    }

    #[test]
    fn set_mode_to_same_mode_still_notifies() {
        let mut controller = controller();
        controller.set_mode(OperatingMode::Manual);
        assert_eq!(
            controller.observer().0,
            vec![Call::SetMode(snap(OperatingMode::Manual, MotionState::Closed))]
        );
    }

    #[test]
    fn automatic_day_opens_then_times_out() {
        let mut controller = controller_at(OperatingMode::Automatic, MotionState::Closed);
        let mut light = DAY;

        controller.tick(100, &mut light);
        assert_eq!(controller.state(), MotionState::Opening);
        assert_eq!(controller.actuator().energized(), Some(Direction::Reverse));
        assert_eq!(
            controller.observer().0,
            vec![Call::Opening(snap(
                OperatingMode::Automatic,
                MotionState::Opening
            ))]
        );

        // Exactly at the duration the motion is still running.
        controller.tick(2_100, &mut light);
        assert_eq!(controller.state(), MotionState::Opening);

        controller.tick(2_101, &mut light);
        assert_eq!(controller.state(), MotionState::Opened);
        assert_eq!(controller.actuator().energized(), None);
        assert_eq!(
            controller.observer().0,
            vec![
                Call::Opening(snap(OperatingMode::Automatic, MotionState::Opening)),
                Call::Opened(snap(OperatingMode::Automatic, MotionState::Opened)),
            ]
        );
    }

    #[test]
    fn timeout_is_resolved_before_light_in_the_same_tick() {
        let mut controller = controller_at(OperatingMode::Automatic, MotionState::Closed);
        controller.tick(0, &mut DAY.clone());
        assert_eq!(controller.state(), MotionState::Opening);

        // Night falls while opening: the same tick first lands on Opened and
        // then starts closing.
        controller.tick(5_000, &mut NIGHT.clone());
        assert_eq!(controller.state(), MotionState::Closing);
        assert_eq!(controller.motion_start_ms(), 5_000);
        assert_eq!(
            controller.actuator().commands,
            vec![
                ActuatorCommand::Energize(Direction::Reverse),
                ActuatorCommand::Release,
                ActuatorCommand::Energize(Direction::Forward),
            ]
        );
    }

    #[test]
    fn manual_mode_ignores_light() {
        let mut controller = controller();
        controller.tick(0, &mut DAY.clone());
        controller.tick(10, &mut NIGHT.clone());

        assert_eq!(controller.state(), MotionState::Closed);
        assert!(controller.observer().0.is_empty());
    }

    #[test]
    fn repeated_close_while_closing_is_ignored() {
        let mut controller = controller_at(OperatingMode::Manual, MotionState::Opened);
        controller.close(10);
        controller.close(20);

        assert_eq!(controller.state(), MotionState::Closing);
        assert_eq!(controller.motion_start_ms(), 10);
        assert_eq!(
            controller.observer().0,
            vec![Call::Closing(snap(OperatingMode::Manual, MotionState::Closing))]
        );
        assert_eq!(
            controller.actuator().commands,
            vec![ActuatorCommand::Energize(Direction::Forward)]
        );
    }

    #[test]
    fn actuator_energized_only_while_moving() {
        let mut controller = controller();
        let mut light = NIGHT;
        let steps: [(Option<BlindsEvent>, u64); 5] = [
            (Some(BlindsEvent::Open), 0),
            (None, 3_000),
            (Some(BlindsEvent::Close), 3_010),
            (Some(BlindsEvent::Open), 3_020),
            (None, 6_000),
        ];

        for (event, now_ms) in steps {
            match event {
                Some(event) => controller.handle(event, now_ms),
                None => controller.tick(now_ms, &mut light),
            }
            assert_eq!(
                controller.actuator().energized().is_some(),
                controller.state().is_moving()
            );
        }
        assert_eq!(controller.state(), MotionState::Closed);
    }

    #[test]
    fn night_threshold_is_strict() {
        let controller = controller();
        assert!(controller.is_night(149));
        assert!(!controller.is_night(150));
    }

    #[test]
    fn restore_keeps_stable_state_and_drops_transient_one() {
        let restored = ActuatorController::restore(
            BlindsConfig::default(),
            RecordingActuator::default(),
            CallLog::default(),
            OperatingMode::Automatic,
            MotionState::Opened,
        );
        assert_eq!(
            restored.snapshot(),
            snap(OperatingMode::Automatic, MotionState::Opened)
        );

        let interrupted = ActuatorController::restore(
            BlindsConfig::default(),
            RecordingActuator::default(),
            CallLog::default(),
            OperatingMode::Manual,
            MotionState::Closing,
        );
        assert_eq!(interrupted.state(), MotionState::Closed);
        assert!(interrupted.actuator().commands.is_empty());
    }
}

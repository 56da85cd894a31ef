//! Network-mode device: the controller, its light sensor and the
//! configuration store owned together, with status publications queued for
//! whatever MQTT client the driver runs.

use std::collections::VecDeque;

use crate::{
    blinds::{ActuatorController, CommandObserver},
    config::BlindsConfig,
    hardware::{Actuator, LightSensor},
    medium::PersistentMedium,
    protocol::{parse_command, Command, ProtocolError},
    store::{ConfigurationStore, StoreError},
    topics::{home_topic, object_topic, STATE_DEVICE_READY, TOPIC_COMMANDS, TOPIC_STATES},
    types::{Snapshot, StatusPayload},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    SetMode,
    Opening,
    Opened,
    Closing,
    Closed,
    Query,
}

impl NotificationKind {
    /// Notifications after which the stored snapshot is refreshed.
    fn settles_snapshot(self) -> bool {
        matches!(self, Self::SetMode | Self::Opened | Self::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub snapshot: Snapshot,
}

/// Observer that queues every transition for the next publish pass.
#[derive(Debug, Default)]
pub struct StatusOutbox {
    pending: VecDeque<Notification>,
}

impl StatusOutbox {
    pub fn push(&mut self, kind: NotificationKind, snapshot: Snapshot) {
        self.pending.push_back(Notification { kind, snapshot });
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Notification> + '_ {
        self.pending.drain(..)
    }
}

impl CommandObserver for StatusOutbox {
    fn on_set_mode(&mut self, snapshot: Snapshot) {
        self.push(NotificationKind::SetMode, snapshot);
    }

    fn on_opening(&mut self, snapshot: Snapshot) {
        self.push(NotificationKind::Opening, snapshot);
    }

    fn on_opened(&mut self, snapshot: Snapshot) {
        self.push(NotificationKind::Opened, snapshot);
    }

    fn on_closing(&mut self, snapshot: Snapshot) {
        self.push(NotificationKind::Closing, snapshot);
    }

    fn on_closed(&mut self, snapshot: Snapshot) {
        self.push(NotificationKind::Closed, snapshot);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub struct BlindsNode<A, S, M> {
    controller: ActuatorController<A, StatusOutbox>,
    sensor: S,
    store: ConfigurationStore<M>,
    device_ip: String,
    object_topic: String,
}

impl<A, S, M> BlindsNode<A, S, M>
where
    A: Actuator,
    S: LightSensor,
    M: PersistentMedium,
{
    /// Builds the node from a store already loaded by the boot decision.
    pub fn new(
        config: BlindsConfig,
        store: ConfigurationStore<M>,
        actuator: A,
        sensor: S,
        device_ip: impl Into<String>,
    ) -> Self {
        let record = store.record();
        let controller = if store.schema().persists_snapshot() {
            ActuatorController::restore(
                config,
                actuator,
                StatusOutbox::default(),
                record.mode().unwrap_or_default(),
                record.state().unwrap_or_default(),
            )
        } else {
            ActuatorController::new(config, actuator, StatusOutbox::default())
        };

        let device_ip = device_ip.into();
        Self {
            controller,
            sensor,
            object_topic: object_topic(TOPIC_COMMANDS, &device_ip),
            store,
            device_ip,
        }
    }

    pub fn controller(&self) -> &ActuatorController<A, StatusOutbox> {
        &self.controller
    }

    pub fn store(&self) -> &ConfigurationStore<M> {
        &self.store
    }

    pub fn device_ip(&self) -> &str {
        &self.device_ip
    }

    pub fn name(&self) -> &str {
        self.store.record().name()
    }

    pub fn subscriptions(&self) -> [String; 2] {
        [home_topic(TOPIC_COMMANDS), self.object_topic.clone()]
    }

    pub fn ready_publication(&self) -> Publication {
        Publication {
            topic: home_topic(TOPIC_STATES),
            payload: STATE_DEVICE_READY.as_bytes().to_vec(),
        }
    }

    /// Applies one inbound message. `Ok(None)` means it was not for us.
    pub fn handle_message(
        &mut self,
        topic: &str,
        payload: &[u8],
        now_ms: u64,
    ) -> Result<Option<Command>, ProtocolError> {
        let command = parse_command(topic, payload, &self.device_ip)?;
        match command {
            Some(Command::Open) => self.controller.open(now_ms),
            Some(Command::Close) => self.controller.close(now_ms),
            Some(Command::SetMode(mode)) => self.controller.set_mode(mode),
            Some(Command::QueryObjects) => {
                let snapshot = self.controller.snapshot();
                self.controller
                    .observer_mut()
                    .push(NotificationKind::Query, snapshot);
            }
            None => {}
        }
        Ok(command)
    }

    pub fn tick(&mut self, now_ms: u64) {
        self.controller.tick(now_ms, &mut self.sensor);
    }

    /// Turns queued notifications into status publications, refreshing the
    /// stored snapshot when the schema keeps one.
    pub fn drain_publications(&mut self) -> Result<Vec<Publication>, StoreError> {
        let notifications: Vec<Notification> = self.controller.observer_mut().drain().collect();
        let mut publications = Vec::with_capacity(notifications.len());
        let mut settled = None;

        for notification in notifications {
            if notification.kind.settles_snapshot() {
                settled = Some(notification.snapshot);
            }
            publications.push(self.status_publication(notification.snapshot));
        }

        if let Some(snapshot) = settled {
            self.persist_snapshot(snapshot)?;
        }
        Ok(publications)
    }

    pub fn status_publication(&self, snapshot: Snapshot) -> Publication {
        let status = StatusPayload::new(&self.device_ip, self.name(), snapshot);
        Publication {
            topic: home_topic(TOPIC_STATES),
            payload: serde_json::to_vec_pretty(&status).unwrap_or_default(),
        }
    }

    fn persist_snapshot(&mut self, snapshot: Snapshot) -> Result<(), StoreError> {
        if !self.store.schema().persists_snapshot() {
            return Ok(());
        }
        let record = self.store.record();
        if record.mode() == Some(snapshot.mode) && record.state() == Some(snapshot.state) {
            return Ok(());
        }
        self.store
            .record_mut()
            .set_snapshot(snapshot.mode, snapshot.state);
        self.store.save()
    }
}

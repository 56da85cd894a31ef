use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
#[cfg(not(feature = "factory-reset"))]
use std::{
    net::{SocketAddr, UdpSocket},
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
#[cfg(not(feature = "factory-reset"))]
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{Method, StatusCode, Uri},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Router,
};
#[cfg(not(feature = "factory-reset"))]
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
#[cfg(not(feature = "factory-reset"))]
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex},
};
#[cfg(not(feature = "factory-reset"))]
use tower_http::trace::TraceLayer;
#[cfg(not(feature = "factory-reset"))]
use tracing::debug;
use tracing::{info, warn};

use blinds_common::{BlindsConfig, ConfigurationStore, FileMedium};
#[cfg(feature = "factory-reset")]
use blinds_common::{FormatDefaults, FormatMode};
#[cfg(not(feature = "factory-reset"))]
use blinds_common::{
    apply_form_body,
    provisioning::{not_found_body, FORM_HTML, FORM_PATH, METHOD_NOT_ALLOWED},
    Actuator, BlindsNode, Boot, BootstrapSelector, ConfigurationRecord, Direction, FormError,
    LightSensor, PersistentMedium, Publication,
};

#[cfg(not(feature = "factory-reset"))]
const MQTT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
struct DataDir {
    runtime_path: PathBuf,
    eeprom_path: PathBuf,
}

impl DataDir {
    fn from_env() -> Self {
        let root = std::env::var("BLINDS_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.blinds"));
        Self::new(&root)
    }

    fn new(root: &Path) -> Self {
        Self {
            runtime_path: root.join("runtime.json"),
            eeprom_path: root.join("eeprom.bin"),
        }
    }

    async fn load_config(&self) -> anyhow::Result<BlindsConfig> {
        match tokio::fs::read(&self.runtime_path).await {
            Ok(raw) => Ok(serde_json::from_slice::<BlindsConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(BlindsConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn runtime_config(&self) -> BlindsConfig {
        let mut config = self.load_config().await.unwrap_or_else(|err| {
            warn!(
                "failed to load runtime config from {}: {err:#}",
                self.runtime_path.display()
            );
            BlindsConfig::default()
        });
        if let Some(port) = std::env::var("BLINDS_HTTP_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
        {
            config.provisioning_http_port = port;
        }
        config.sanitize();
        config
    }

    fn medium(&self) -> FileMedium {
        FileMedium::new(&self.eeprom_path)
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

#[cfg(not(feature = "factory-reset"))]
pub async fn run() -> anyhow::Result<()> {
    init_tracing();

    let data = DataDir::from_env();
    let config = data.runtime_config().await;
    let store = ConfigurationStore::new(data.medium(), config.schema);

    let boot = BootstrapSelector::new(config.validity_policy)
        .select(store)
        .context("failed to read configuration medium")?;

    match boot {
        Boot::Network { store, record } => {
            info!("configuration found for '{}', starting network mode", record.name());
            run_network(config, store, record).await
        }
        Boot::Provisioning { store, reason } => {
            info!("starting provisioning mode: {reason:?}");
            run_provisioning(config, store).await
        }
    }
}

#[cfg(feature = "factory-reset")]
pub async fn format() -> anyhow::Result<()> {
    init_tracing();

    let data = DataDir::from_env();
    let config = data.runtime_config().await;
    let mut store = ConfigurationStore::new(data.medium(), config.schema);

    let env = |key: &str| std::env::var(key).unwrap_or_default();
    let defaults = FormatDefaults::new(
        &env("BLINDS_DEFAULT_SSID"),
        &env("BLINDS_DEFAULT_PASSWORD"),
    );
    let mode = if std::env::var_os("BLINDS_FORMAT_WITH_DEFAULTS").is_some() {
        FormatMode::WithDefaults
    } else {
        FormatMode::Erase
    };

    store
        .format(mode, &defaults)
        .context("failed to format configuration medium")?;
    info!("configuration medium formatted ({mode:?})\n{}", store.describe());
    Ok(())
}

#[cfg(not(feature = "factory-reset"))]
#[derive(Debug)]
struct InboundMessage {
    topic: String,
    payload: Vec<u8>,
}

#[cfg(not(feature = "factory-reset"))]
async fn run_network(
    config: BlindsConfig,
    store: ConfigurationStore<FileMedium>,
    record: ConfigurationRecord,
) -> anyhow::Result<()> {
    let port = record
        .broker_port()
        .context("stored broker port cannot be used")?;
    let device_ip = device_ip();

    let mut mqtt_options = MqttOptions::new(device_ip.clone(), record.mqtt_server(), port);
    mqtt_options.set_keep_alive(Duration::from_secs(15));
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, MQTT_CHANNEL_CAPACITY);

    let mut node = BlindsNode::new(
        config.clone(),
        store,
        SimulatedServo::default(),
        SimulatedPhotocell::from_env(),
        device_ip,
    );
    info!(
        "blinds '{}' at {} using broker {}:{port}",
        node.name(),
        node.device_ip(),
        record.mqtt_server()
    );

    let (inbound_tx, mut inbound_rx) = mpsc::channel(MQTT_CHANNEL_CAPACITY);
    spawn_mqtt_loop(
        mqtt.clone(),
        eventloop,
        inbound_tx,
        node.subscriptions(),
        node.ready_publication(),
    );

    let mut interval = tokio::time::interval(Duration::from_millis(config.tick_interval_ms));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        }

        control_pass(&mut node, &mut inbound_rx, &mqtt, monotonic_ms())?;
    }
}

/// One pass of the control loop. It never waits on the broker: status
/// messages that do not fit in the client queue are dropped.
#[cfg(not(feature = "factory-reset"))]
fn control_pass<A, S, M>(
    node: &mut BlindsNode<A, S, M>,
    inbound: &mut mpsc::Receiver<InboundMessage>,
    mqtt: &AsyncClient,
    now_ms: u64,
) -> anyhow::Result<()>
where
    A: Actuator,
    S: LightSensor,
    M: PersistentMedium,
{
    while let Ok(message) = inbound.try_recv() {
        apply_inbound(node, &message, now_ms);
    }
    node.tick(now_ms);

    let publications = node
        .drain_publications()
        .context("failed to persist blinds snapshot")?;
    for publication in publications {
        publish(mqtt, publication);
    }
    Ok(())
}

#[cfg(not(feature = "factory-reset"))]
fn apply_inbound<A, S, M>(node: &mut BlindsNode<A, S, M>, message: &InboundMessage, now_ms: u64)
where
    A: Actuator,
    S: LightSensor,
    M: PersistentMedium,
{
    match node.handle_message(&message.topic, &message.payload, now_ms) {
        Ok(Some(command)) => debug!("applied {command:?} from {}", message.topic),
        Ok(None) => {}
        Err(err) => warn!("dropping command on {}: {err}", message.topic),
    }
}

#[cfg(not(feature = "factory-reset"))]
fn publish(mqtt: &AsyncClient, publication: Publication) {
    info!(
        "publishing to {}: {}",
        publication.topic,
        String::from_utf8_lossy(&publication.payload)
    );
    if let Err(err) =
        mqtt.try_publish(publication.topic, QoS::AtMostOnce, false, publication.payload)
    {
        warn!("status publish dropped: {err}");
    }
}

#[cfg(not(feature = "factory-reset"))]
fn spawn_mqtt_loop(
    mqtt: AsyncClient,
    mut eventloop: EventLoop,
    inbound: mpsc::Sender<InboundMessage>,
    subscriptions: [String; 2],
    ready: Publication,
) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    let message = InboundMessage {
                        topic: message.topic,
                        payload: message.payload.to_vec(),
                    };
                    if inbound.send(message).await.is_err() {
                        break;
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    for topic in &subscriptions {
                        match mqtt.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                            Ok(()) => info!("subscribed to {topic}"),
                            Err(err) => warn!("subscribe to {topic} failed: {err}"),
                        }
                    }
                    if let Err(err) = mqtt.try_publish(
                        ready.topic.as_str(),
                        QoS::AtMostOnce,
                        false,
                        ready.payload.clone(),
                    ) {
                        warn!("ready publish failed: {err}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

/// Address other devices reach us on. The UDP connect never sends a packet;
/// it only makes the OS pick the outbound interface.
#[cfg(not(feature = "factory-reset"))]
fn device_ip() -> String {
    if let Ok(ip) = std::env::var("BLINDS_DEVICE_IP") {
        return ip;
    }
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|err| {
            warn!("could not determine local address: {err}");
            "127.0.0.1".to_string()
        })
}

/// Servo stand-in that logs what the real one would do.
#[cfg(not(feature = "factory-reset"))]
#[derive(Debug, Default)]
struct SimulatedServo {
    energized: Option<Direction>,
}

#[cfg(not(feature = "factory-reset"))]
impl Actuator for SimulatedServo {
    fn energize(&mut self, direction: Direction) {
        debug!("servo energized {direction:?}");
        self.energized = Some(direction);
    }

    fn release(&mut self) {
        if let Some(direction) = self.energized.take() {
            debug!("servo released after {direction:?}");
        }
    }
}

/// Photocell stand-in. A fixed level comes from `BLINDS_LIGHT_LEVEL`;
/// without it the light swaps between day and night every `period_ms`.
#[cfg(not(feature = "factory-reset"))]
#[derive(Debug)]
struct SimulatedPhotocell {
    fixed: Option<u16>,
    period_ms: u64,
}

#[cfg(not(feature = "factory-reset"))]
impl SimulatedPhotocell {
    const DAY: u16 = 800;
    const NIGHT: u16 = 40;

    fn from_env() -> Self {
        Self {
            fixed: std::env::var("BLINDS_LIGHT_LEVEL")
                .ok()
                .and_then(|value| value.parse::<u16>().ok()),
            period_ms: 60_000,
        }
    }

    fn level_at(&self, now_ms: u64) -> u16 {
        if let Some(level) = self.fixed {
            return level.min(1023);
        }
        if (now_ms / self.period_ms) % 2 == 0 {
            Self::DAY
        } else {
            Self::NIGHT
        }
    }
}

#[cfg(not(feature = "factory-reset"))]
impl LightSensor for SimulatedPhotocell {
    fn read_light(&mut self) -> u16 {
        self.level_at(monotonic_ms())
    }
}

#[cfg(not(feature = "factory-reset"))]
struct ProvisioningState<M> {
    store: Arc<Mutex<ConfigurationStore<M>>>,
}

#[cfg(not(feature = "factory-reset"))]
impl<M> Clone for ProvisioningState<M> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

#[cfg(not(feature = "factory-reset"))]
async fn run_provisioning(
    config: BlindsConfig,
    store: ConfigurationStore<FileMedium>,
) -> anyhow::Result<()> {
    let state = ProvisioningState {
        store: Arc::new(Mutex::new(store)),
    };
    let app = provisioning_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.provisioning_http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind provisioning server at {addr}"))?;

    info!("provisioning form at http://{addr}/");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

#[cfg(not(feature = "factory-reset"))]
fn provisioning_router<M>(state: ProvisioningState<M>) -> Router
where
    M: PersistentMedium + Send + 'static,
{
    Router::new()
        .route("/", get(handle_form))
        .route(
            FORM_PATH,
            post(handle_postform::<M>).fallback(handle_method_not_allowed),
        )
        .fallback(handle_not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(not(feature = "factory-reset"))]
async fn handle_form() -> Html<&'static str> {
    Html(FORM_HTML)
}

#[cfg(not(feature = "factory-reset"))]
async fn handle_postform<M>(State(state): State<ProvisioningState<M>>, body: Bytes) -> Response
where
    M: PersistentMedium + Send + 'static,
{
    let mut store = state.store.lock().await;
    match apply_form_body(&mut *store, &body) {
        Ok(response) => {
            info!("configuration saved for '{}'", store.record().name());
            (StatusCode::OK, response).into_response()
        }
        Err(err @ FormError::Decode(_)) => {
            warn!("rejecting provisioning form: {err}");
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
        Err(err) => {
            warn!("saving configuration failed: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

#[cfg(not(feature = "factory-reset"))]
async fn handle_method_not_allowed() -> impl IntoResponse {
    (StatusCode::METHOD_NOT_ALLOWED, METHOD_NOT_ALLOWED)
}

#[cfg(not(feature = "factory-reset"))]
async fn handle_not_found(
    method: Method,
    uri: Uri,
    Query(args): Query<Vec<(String, String)>>,
) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        not_found_body(uri.path(), method.as_str(), &args),
    )
}

#[cfg(not(feature = "factory-reset"))]
fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(all(test, not(feature = "factory-reset")))]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{header::CONTENT_TYPE, Request},
    };
    use blinds_common::{
        hardware::{FixedLight, RecordingActuator},
        provisioning::SAVED_MESSAGE,
        MemoryMedium, MotionState, SchemaVersion, ValidityPolicy,
    };
    use tower::ServiceExt;

    fn memory_state() -> ProvisioningState<MemoryMedium> {
        ProvisioningState {
            store: Arc::new(Mutex::new(ConfigurationStore::new(
                MemoryMedium::new(),
                SchemaVersion::V1,
            ))),
        }
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn root_serves_the_form() {
        let response = provisioning_router(memory_state())
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("/postform/"));
    }

    #[tokio::test]
    async fn postform_saves_the_record() {
        let state = memory_state();
        let response = provisioning_router(state.clone())
            .oneshot(
                Request::post(FORM_PATH)
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from(concat!(
                        "ssid=HomeNet&password=secret&name=Kitchen",
                        "&mqtt_server=broker.local&mqtt_port=1883",
                    )))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.starts_with(SAVED_MESSAGE));

        let store = state.store.lock().await;
        assert!(store.record().is_valid());
        assert_eq!(store.record().name(), "Kitchen");
        assert_eq!(store.record().broker_port(), Ok(1883));
    }

    #[tokio::test]
    async fn postform_rejects_other_methods() {
        let state = memory_state();
        let response = provisioning_router(state.clone())
            .oneshot(Request::get(FORM_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body_text(response).await, METHOD_NOT_ALLOWED);
        assert!(!state.store.lock().await.record().is_valid());
    }

    #[tokio::test]
    async fn postform_rejects_an_undecodable_body() {
        let state = memory_state();
        let response = provisioning_router(state.clone())
            .oneshot(
                Request::post(FORM_PATH)
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("ssid=a&ssid=b"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.contains("duplicate field"));

        let store = state.store.lock().await;
        assert!(!store.record().is_valid());
        assert!(store.medium().committed().is_empty());
    }

    #[tokio::test]
    async fn unknown_paths_dump_the_request() {
        let response = provisioning_router(memory_state())
            .oneshot(Request::get("/nowhere?x=1").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_text(response).await;
        assert!(body.contains("URI: /nowhere"));
        assert!(body.contains("Method: GET"));
        assert!(body.contains(" x: 1"));
    }

    #[tokio::test]
    async fn data_dir_config_defaults_when_missing_and_reads_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let data = DataDir::new(dir.path());
        assert_eq!(data.load_config().await.unwrap(), BlindsConfig::default());

        tokio::fs::write(
            dir.path().join("runtime.json"),
            r#"{"light_threshold": 300, "validity_policy": "strict"}"#,
        )
        .await
        .unwrap();
        let config = data.load_config().await.unwrap();
        assert_eq!(config.light_threshold, 300);
        assert_eq!(config.validity_policy, ValidityPolicy::Strict);

        tokio::fs::write(dir.path().join("runtime.json"), "{broken")
            .await
            .unwrap();
        assert!(data.load_config().await.is_err());
    }

    #[tokio::test]
    async fn saved_form_boots_into_network_mode() {
        let dir = tempfile::tempdir().unwrap();
        let data = DataDir::new(dir.path());
        let state = ProvisioningState {
            store: Arc::new(Mutex::new(ConfigurationStore::new(
                data.medium(),
                SchemaVersion::V1,
            ))),
        };

        provisioning_router(state)
            .oneshot(
                Request::post(FORM_PATH)
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from(
                        "ssid=HomeNet&name=Porch&mqtt_server=broker.local&mqtt_port=1883",
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        let store = ConfigurationStore::new(data.medium(), SchemaVersion::V1);
        let boot = BootstrapSelector::default().select(store).unwrap();
        let Boot::Network { record, .. } = boot else {
            panic!("expected network mode after provisioning");
        };
        assert_eq!(record.name(), "Porch");
    }

    #[test]
    fn inbound_errors_are_dropped_without_transition() {
        let mut store = ConfigurationStore::new(MemoryMedium::new(), SchemaVersion::V1);
        store.record_mut().set_name("Kitchen");
        store.save().unwrap();
        let mut node = BlindsNode::new(
            BlindsConfig::default(),
            store,
            RecordingActuator::default(),
            FixedLight(600),
            "10.0.0.7",
        );

        let bad = InboundMessage {
            topic: "/IOT3/COMMANDS/10.0.0.7".to_string(),
            payload: b"{not json".to_vec(),
        };
        apply_inbound(&mut node, &bad, 0);
        assert_eq!(node.controller().state(), MotionState::Closed);

        let open = InboundMessage {
            topic: "/IOT3/COMMANDS/10.0.0.7".to_string(),
            payload: br#"{"cmd":"open"}"#.to_vec(),
        };
        apply_inbound(&mut node, &open, 0);
        assert_eq!(node.controller().state(), MotionState::Opening);
    }

    #[tokio::test]
    async fn control_pass_keeps_ticking_when_the_broker_never_drains() {
        let mut store = ConfigurationStore::new(MemoryMedium::new(), SchemaVersion::V1);
        store.record_mut().set_name("Kitchen");
        store.save().unwrap();
        let mut node = BlindsNode::new(
            BlindsConfig::default(),
            store,
            RecordingActuator::default(),
            FixedLight(600),
            "10.0.0.7",
        );

        // The event loop is held but never polled, so the request queue fills up.
        let (mqtt, _eventloop) = AsyncClient::new(
            MqttOptions::new("blinds-test", "127.0.0.1", 1),
            MQTT_CHANNEL_CAPACITY,
        );
        let (inbound_tx, mut inbound_rx) = mpsc::channel(MQTT_CHANNEL_CAPACITY);
        let motion_ms = BlindsConfig::default().motion_duration_ms;

        let mut now_ms = 0;
        for _ in 0..MQTT_CHANNEL_CAPACITY {
            for cmd in ["open", "close"] {
                let command = InboundMessage {
                    topic: "/IOT3/COMMANDS/10.0.0.7".to_string(),
                    payload: format!(r#"{{"cmd":"{cmd}"}}"#).into_bytes(),
                };
                inbound_tx.send(command).await.unwrap();
                control_pass(&mut node, &mut inbound_rx, &mqtt, now_ms).unwrap();
                assert_ne!(node.controller().actuator().energized(), None);

                now_ms += motion_ms + 1;
                control_pass(&mut node, &mut inbound_rx, &mqtt, now_ms).unwrap();
                assert_eq!(node.controller().actuator().energized(), None);
            }
        }

        assert_eq!(node.controller().state(), MotionState::Closed);
    }

    #[test]
    fn photocell_alternates_unless_fixed() {
        let cycling = SimulatedPhotocell {
            fixed: None,
            period_ms: 1_000,
        };
        assert_eq!(cycling.level_at(10), SimulatedPhotocell::DAY);
        assert_eq!(cycling.level_at(1_500), SimulatedPhotocell::NIGHT);
        assert_eq!(cycling.level_at(2_000), SimulatedPhotocell::DAY);

        let fixed = SimulatedPhotocell {
            fixed: Some(5_000),
            period_ms: 1_000,
        };
        assert_eq!(fixed.level_at(1_500), 1023);
    }
}

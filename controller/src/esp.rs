use std::{thread, time::Duration};
#[cfg(not(feature = "factory-reset"))]
use std::{
    convert::TryInto,
    sync::{mpsc, Arc, Mutex, OnceLock},
    time::Instant,
};

use anyhow::Context;
#[cfg(not(feature = "factory-reset"))]
use anyhow::anyhow;
#[cfg(not(feature = "factory-reset"))]
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
#[cfg(not(feature = "factory-reset"))]
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
    },
    gpio::{Gpio15, Gpio34},
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution, CHANNEL0, TIMER0},
    prelude::*,
};
use esp_idf_svc::{
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
};
#[cfg(not(feature = "factory-reset"))]
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{adc::ADC1, modem::Modem},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    ipv4::{
        ClientConfiguration as IpClientConfiguration, Configuration as IpConfiguration,
        DHCPClientSettings,
    },
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    netif::{EspNetif, NetifConfiguration},
    wifi::{BlockingWifi, EspWifi},
};
use log::info;
#[cfg(not(feature = "factory-reset"))]
use log::{debug, error, warn};

use blinds_common::{BlindsConfig, ConfigurationStore, MediumError, PersistentMedium};
#[cfg(feature = "factory-reset")]
use blinds_common::{FormatDefaults, FormatMode};
#[cfg(not(feature = "factory-reset"))]
use blinds_common::{
    apply_form_body,
    provisioning::{not_found_body, split_query, FORM_HTML, FORM_PATH, METHOD_NOT_ALLOWED},
    Actuator, BlindsNode, Boot, BootstrapSelector, ConfigurationRecord, Direction, FormError,
    LightSensor, Publication,
};

const NVS_NAMESPACE: &str = "blinds";
const NVS_RECORD_KEY: &str = "record";
#[cfg(not(feature = "factory-reset"))]
const MAX_HTTP_BODY: usize = 1024;
#[cfg(not(feature = "factory-reset"))]
const PROVISIONING_AP_SSID: &str = "BlindsSetup-AP";
#[cfg(not(feature = "factory-reset"))]
const PROVISIONING_HTTP_PORT: u16 = 80;
#[cfg(not(feature = "factory-reset"))]
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
#[cfg(not(feature = "factory-reset"))]
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
#[cfg(not(feature = "factory-reset"))]
const RESTART_DELAY_MS: u64 = 1_000;

#[cfg(not(feature = "factory-reset"))]
fn ap_password() -> &'static str {
    option_env!("BLINDS_AP_PASSWORD").unwrap_or("BlindsSetup")
}

/// Fatal errors restart the device; it boots again from the stored record.
#[cfg(not(feature = "factory-reset"))]
pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    if let Err(err) = run_device() {
        error!("fatal: {err:#}; restarting");
        thread::sleep(Duration::from_millis(RESTART_DELAY_MS));
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
    Ok(())
}

#[cfg(feature = "factory-reset")]
pub fn format() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let config = BlindsConfig::default();
    let partition = EspDefaultNvsPartition::take()?;
    let mut store = ConfigurationStore::new(NvsMedium::new(partition), config.schema);

    let defaults = FormatDefaults::new(
        option_env!("BLINDS_DEFAULT_SSID").unwrap_or_default(),
        option_env!("BLINDS_DEFAULT_PASSWORD").unwrap_or_default(),
    );
    let mode = if option_env!("BLINDS_FORMAT_WITH_DEFAULTS").is_some() {
        FormatMode::WithDefaults
    } else {
        FormatMode::Erase
    };

    store
        .format(mode, &defaults)
        .context("failed to format configuration medium")?;
    info!("configuration medium formatted ({mode:?})\n{}", store.describe());
    info!("rebuild without the factory-reset feature to run the device");
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

#[cfg(not(feature = "factory-reset"))]
fn run_device() -> anyhow::Result<()> {
    let config = BlindsConfig {
        provisioning_http_port: PROVISIONING_HTTP_PORT,
        ..BlindsConfig::default()
    };

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let store = ConfigurationStore::new(NvsMedium::new(nvs_partition.clone()), config.schema);

    let boot = BootstrapSelector::new(config.validity_policy)
        .select(store)
        .context("failed to read configuration medium")?;

    let peripherals = Peripherals::take()?;

    match boot {
        Boot::Network { store, record } => {
            info!("configuration found for `{}`, starting network mode", record.name());
            let mut esp_wifi =
                EspWifi::new(peripherals.modem, sys_loop.clone(), Some(nvs_partition))?;
            let device_ip = connect_wifi(&mut esp_wifi, sys_loop, &record)?;

            let servo = Servo::new(
                peripherals.ledc.timer0,
                peripherals.ledc.channel0,
                peripherals.pins.gpio15,
            )?;
            let photocell = Photocell::new(peripherals.adc1, peripherals.pins.gpio34)?;

            let node = BlindsNode::new(config.clone(), store, servo, photocell, device_ip);
            run_network(&config, node, &record)
        }
        Boot::Provisioning { store, reason } => {
            info!("starting provisioning mode: {reason:?}");
            run_provisioning(peripherals.modem, sys_loop, nvs_partition, store, &config)
        }
    }
}

/// The configuration record kept as a single NVS blob.
struct NvsMedium {
    partition: EspDefaultNvsPartition,
    image: Vec<u8>,
}

impl NvsMedium {
    fn new(partition: EspDefaultNvsPartition) -> Self {
        Self {
            partition,
            image: Vec::new(),
        }
    }

    fn open(&self) -> Result<EspNvs<esp_idf_svc::nvs::NvsDefault>, MediumError> {
        EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(|err| MediumError::Backend(err.to_string()))
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), MediumError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.image.len() => Ok(()),
            _ => Err(MediumError::OutOfRange {
                offset,
                len,
                capacity: self.image.len(),
            }),
        }
    }
}

impl PersistentMedium for NvsMedium {
    fn begin(&mut self, size: usize) -> Result<(), MediumError> {
        let nvs = self.open()?;
        let mut buffer = vec![0_u8; size.max(256)];
        self.image = nvs
            .get_raw(NVS_RECORD_KEY, &mut buffer)
            .map_err(|err| MediumError::Backend(err.to_string()))?
            .map(<[u8]>::to_vec)
            .unwrap_or_default();
        if self.image.len() < size {
            self.image.resize(size, blinds_common::medium::ERASED_BYTE);
        }
        Ok(())
    }

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), MediumError> {
        self.check(offset, buf.len())?;
        buf.copy_from_slice(&self.image[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MediumError> {
        self.check(offset, data.len())?;
        self.image[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), MediumError> {
        let mut nvs = self.open()?;
        nvs.set_raw(NVS_RECORD_KEY, &self.image)
            .map_err(|err| MediumError::Backend(err.to_string()))?;
        Ok(())
    }
}

/// Continuous-rotation servo on a 50 Hz LEDC channel. Releasing drops the
/// duty to zero, which detaches the signal.
#[cfg(not(feature = "factory-reset"))]
struct Servo {
    driver: LedcDriver<'static>,
}

#[cfg(not(feature = "factory-reset"))]
impl Servo {
    /// Arduino-style pulse range, in microseconds, for 0..=180 degrees.
    const MIN_PULSE_US: u32 = 544;
    const MAX_PULSE_US: u32 = 2_400;
    const PERIOD_US: u32 = 20_000;
    const FORWARD_DEG: u32 = 0;
    const REVERSE_DEG: u32 = 150;

    fn new(timer: TIMER0, channel: CHANNEL0, pin: Gpio15) -> anyhow::Result<Self> {
        let timer = LedcTimerDriver::new(
            timer,
            &TimerConfig::default()
                .frequency(50.Hz().into())
                .resolution(Resolution::Bits14),
        )?;
        let mut driver = LedcDriver::new(channel, timer, pin)?;
        driver.set_duty(0)?;
        Ok(Self { driver })
    }

    fn duty_for(&self, degrees: u32) -> u32 {
        let span = Self::MAX_PULSE_US - Self::MIN_PULSE_US;
        let pulse_us = Self::MIN_PULSE_US + degrees.min(180) * span / 180;
        self.driver.get_max_duty() * pulse_us / Self::PERIOD_US
    }
}

#[cfg(not(feature = "factory-reset"))]
impl Actuator for Servo {
    fn energize(&mut self, direction: Direction) {
        let degrees = match direction {
            Direction::Forward => Self::FORWARD_DEG,
            Direction::Reverse => Self::REVERSE_DEG,
        };
        let duty = self.duty_for(degrees);
        debug!("servo energized {direction:?} (duty {duty})");
        if let Err(err) = self.driver.set_duty(duty) {
            warn!("servo duty update failed: {err:?}");
        }
    }

    fn release(&mut self) {
        debug!("servo released");
        if let Err(err) = self.driver.set_duty(0) {
            warn!("servo release failed: {err:?}");
        }
    }
}

/// Photocell divider on ADC1. Readings are scaled from 12 to 10 bits.
#[cfg(not(feature = "factory-reset"))]
struct Photocell {
    channel: AdcChannelDriver<'static, Gpio34, AdcDriver<'static, ADC1>>,
    last: u16,
}

#[cfg(not(feature = "factory-reset"))]
impl Photocell {
    fn new(adc: ADC1, pin: Gpio34) -> anyhow::Result<Self> {
        let adc = AdcDriver::new(adc)?;
        let config = AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        };
        let channel = AdcChannelDriver::new(adc, pin, &config)?;
        Ok(Self { channel, last: 0 })
    }
}

#[cfg(not(feature = "factory-reset"))]
impl LightSensor for Photocell {
    fn read_light(&mut self) -> u16 {
        match self.channel.read_raw() {
            Ok(raw) => self.last = (raw >> 2).min(1023),
            Err(err) => warn!("photocell read failed: {err:?}"),
        }
        self.last
    }
}

#[cfg(not(feature = "factory-reset"))]
fn connect_wifi(
    esp_wifi: &mut EspWifi<'static>,
    sys_loop: EspSystemEventLoop,
    record: &ConfigurationRecord,
) -> anyhow::Result<String> {
    match hostname_netif(record.name()) {
        Ok(netif) => {
            esp_wifi
                .swap_netif_sta(netif)
                .context("failed to apply hostname")?;
        }
        Err(err) => warn!("keeping default hostname: {err:#}"),
    }

    let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;
    let auth_method = if record.password().is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: record
            .ssid()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: record
            .password()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", record.ssid());

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}");
                last_err = Some(err);
                let _ = wifi.disconnect();
                thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
            }
        }
    }
    if let Some(err) = last_err {
        return Err(anyhow!("wifi connection failed: {err:#}"));
    }

    let ip = wifi.wifi().sta_netif().get_ip_info()?.ip.to_string();
    info!("wifi connected as {ip}");
    Ok(ip)
}

#[cfg(not(feature = "factory-reset"))]
fn hostname_netif(name: &str) -> anyhow::Result<EspNetif> {
    let conf = NetifConfiguration {
        ip_configuration: Some(IpConfiguration::Client(IpClientConfiguration::DHCP(
            DHCPClientSettings {
                hostname: Some(
                    name.try_into()
                        .map_err(|_| anyhow!("device name `{name}` is not a valid hostname"))?,
                ),
            },
        ))),
        ..NetifConfiguration::wifi_default_client()
    };
    Ok(EspNetif::new_with_conf(&conf)?)
}

#[cfg(not(feature = "factory-reset"))]
struct InboundMessage {
    topic: String,
    payload: Vec<u8>,
}

#[cfg(not(feature = "factory-reset"))]
fn run_network(
    config: &BlindsConfig,
    mut node: BlindsNode<Servo, Photocell, NvsMedium>,
    record: &ConfigurationRecord,
) -> anyhow::Result<()> {
    let port = record
        .broker_port()
        .context("stored broker port cannot be used")?;
    let url = format!("mqtt://{}:{port}", record.mqtt_server());
    let conf = MqttClientConfiguration {
        client_id: Some(node.device_ip()),
        ..Default::default()
    };
    let (client, conn) = EspMqttClient::new(url.as_str(), &conf)
        .with_context(|| format!("failed to create mqtt client for {url}"))?;
    let mqtt = Arc::new(Mutex::new(client));

    let (inbound_tx, inbound_rx) = mpsc::channel();
    spawn_mqtt_receiver(
        conn,
        mqtt.clone(),
        inbound_tx,
        node.subscriptions(),
        node.ready_publication(),
    )?;

    let tick = Duration::from_millis(config.tick_interval_ms);
    loop {
        thread::sleep(tick);
        let now_ms = monotonic_ms();

        while let Ok(message) = inbound_rx.try_recv() {
            match node.handle_message(&message.topic, &message.payload, now_ms) {
                Ok(Some(command)) => debug!("applied {command:?} from {}", message.topic),
                Ok(None) => {}
                Err(err) => warn!("dropping command on {}: {err}", message.topic),
            }
        }
        node.tick(now_ms);

        let publications = node
            .drain_publications()
            .context("failed to persist blinds snapshot")?;
        for publication in publications {
            publish(&mqtt, &publication)?;
        }
    }
}

#[cfg(not(feature = "factory-reset"))]
fn publish(mqtt: &Mutex<EspMqttClient<'static>>, publication: &Publication) -> anyhow::Result<()> {
    info!(
        "publishing to {}: {}",
        publication.topic,
        String::from_utf8_lossy(&publication.payload)
    );
    let mut mqtt = mqtt
        .lock()
        .map_err(|_| anyhow!("mqtt client lock poisoned"))?;
    if let Err(err) = mqtt.enqueue(
        &publication.topic,
        QoS::AtMostOnce,
        false,
        &publication.payload,
    ) {
        warn!("status publish failed: {err:?}");
    }
    Ok(())
}

#[cfg(not(feature = "factory-reset"))]
fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
    inbound: mpsc::Sender<InboundMessage>,
    subscriptions: [String; 2],
    ready: Publication,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        if let Err(err) = on_connected(&mqtt, &subscriptions, &ready) {
                            warn!("mqtt session setup failed: {err:#}");
                        }
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details: Details::Complete,
                        ..
                    } => {
                        let message = InboundMessage {
                            topic: topic.to_string(),
                            payload: data.to_vec(),
                        };
                        if inbound.send(message).is_err() {
                            break;
                        }
                    }
                    EventPayload::Disconnected => warn!("mqtt disconnected"),
                    _ => {}
                },
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

#[cfg(not(feature = "factory-reset"))]
fn on_connected(
    mqtt: &Mutex<EspMqttClient<'static>>,
    subscriptions: &[String],
    ready: &Publication,
) -> anyhow::Result<()> {
    let mut mqtt = mqtt
        .lock()
        .map_err(|_| anyhow!("mqtt client lock poisoned"))?;
    for topic in subscriptions {
        mqtt.subscribe(topic, QoS::AtMostOnce)?;
        info!("subscribed to {topic}");
    }
    mqtt.enqueue(&ready.topic, QoS::AtMostOnce, false, &ready.payload)?;
    Ok(())
}

#[cfg(not(feature = "factory-reset"))]
type SharedStore = Arc<Mutex<ConfigurationStore<NvsMedium>>>;

#[cfg(not(feature = "factory-reset"))]
fn run_provisioning(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    store: ConfigurationStore<NvsMedium>,
    config: &BlindsConfig,
) -> anyhow::Result<()> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;
    start_provisioning_ap(&mut wifi)?;

    let store: SharedStore = Arc::new(Mutex::new(store));
    let _server = create_provisioning_http_server(store, config.provisioning_http_port)?;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

#[cfg(not(feature = "factory-reset"))]
fn start_provisioning_ap(wifi: &mut BlockingWifi<&mut EspWifi<'static>>) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: PROVISIONING_AP_SSID
            .try_into()
            .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
        password: ap_password()
            .try_into()
            .map_err(|_| anyhow!("provisioning AP password too long"))?,
        auth_method: AuthMethod::WPA2Personal,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    let ip = wifi.wifi().ap_netif().get_ip_info()?.ip;
    info!("provisioning AP `{PROVISIONING_AP_SSID}` started, form at http://{ip}/");
    Ok(())
}

#[cfg(not(feature = "factory-reset"))]
fn create_provisioning_http_server(
    store: SharedStore,
    port: u16,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        http_port: port,
        stack_size: 10 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, |req| {
        req.into_response(200, Some("OK"), &[("Content-Type", "text/html")])?
            .write_all(FORM_HTML.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler::<anyhow::Error, _>(FORM_PATH, Method::Post, move |mut req| {
        let body = read_request_body(&mut req)?;
        let result = {
            let mut store = store
                .lock()
                .map_err(|_| anyhow!("configuration store lock poisoned"))?;
            let result = apply_form_body(&mut *store, &body);
            if result.is_ok() {
                info!("configuration saved for `{}`", store.record().name());
            }
            result
        };
        match result {
            Ok(response) => write_text(req, 200, &response),
            Err(err @ FormError::Decode(_)) => {
                warn!("rejecting provisioning form: {err}");
                write_text(req, 400, &err.to_string())
            }
            Err(err) => Err(err.into()),
        }
    })?;

    for method in [Method::Get, Method::Put, Method::Delete] {
        server.fn_handler::<anyhow::Error, _>(FORM_PATH, method, |req| {
            write_text(req, 405, METHOD_NOT_ALLOWED)
        })?;
    }

    for method in [Method::Get, Method::Post] {
        server.fn_handler::<anyhow::Error, _>("/*", method, move |req| {
            let (path, args) = split_query(req.uri());
            let body = not_found_body(path, &format!("{method:?}").to_uppercase(), &args);
            write_text(req, 404, &body)
        })?;
    }

    Ok(server)
}

#[cfg(not(feature = "factory-reset"))]
fn read_request_body(req: &mut Request<&mut EspHttpConnection<'_>>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

#[cfg(not(feature = "factory-reset"))]
fn write_text(
    req: Request<&mut EspHttpConnection<'_>>,
    status_code: u16,
    body: &str,
) -> anyhow::Result<()> {
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "text/plain; charset=utf-8")],
    )?
    .write_all(body.as_bytes())?;
    Ok(())
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

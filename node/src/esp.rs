use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, OnceLock, RwLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use dht_sensor::dht11;
use ds18b20::{Ds18b20, Resolution};
use embedded_svc::{
    http::Method,
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, AnyOutputPin, Input, InputOutput, Output, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mqtt::client::{EspMqttClient, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use one_wire_bus::{Address, OneWire};
use serde::Serialize;

use sensornode_common::{
    config::{KEY_SAMPLING_INTERVAL_MS, KEY_WIFI_PASS, KEY_WIFI_SSID, SETTINGS_NAMESPACE},
    Actuators, BrokerConfig, BrokerLink, ConfigStore, ConfigUpdate, DeviceIdentity,
    InboundMessage, LinkError, LinkMetrics, LocalRequest, NodeHardware, PinConfig, Quantity,
    Reading, RuntimeConfig, Scheduler, SensorBank, SensorDriver, SensorError, SensorSnapshot,
    SettingsBackend, StoreError, TickTime,
};

const ACCESS_POINT_PASSWORD: &str = "12345678";
const SESSION_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const INBOUND_QUEUE_DEPTH: usize = 16;
const MAX_HTTP_BODY: usize = 512;
const NVS_VALUE_BUFFER: usize = 128;
const WATCHDOG_TIMEOUT_SEC: u32 = 90;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let boot_ms = monotonic_ms();
    let runtime = RuntimeConfig {
        broker: broker_from_build_env(),
        ..Default::default()
    };

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, .. } = Peripherals::take()?;

    let identity = DeviceIdentity::from_hardware_id(efuse_mac());
    info!("node identity {identity}");

    let backend = NvsBackend::open(nvs_partition.clone())
        .with_context(|| format!("failed to open NVS namespace `{SETTINGS_NAMESPACE}`"))?;
    let mut store = ConfigStore::open(backend);
    seed_build_credentials(&mut store);

    let hardware = EspHardware::new(&runtime.pins).context("failed to initialize GPIO")?;
    let sensors = build_sensor_bank(&runtime.pins);

    let wifi = BlockingWifi::wrap(
        EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?,
        sys_loop,
    )?;
    let link = EspLink::new(wifi, runtime.broker.clone());

    let _sntp = EspSntp::new_default()
        .map_err(|err| warn!("SNTP unavailable, timestamps start at epoch: {err:?}"))
        .ok();

    let snapshot = Arc::new(RwLock::new(SensorSnapshot::default()));
    let (requests, request_rx) = mpsc::channel();
    let _server = create_status_server(snapshot.clone(), requests)?;

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let mut scheduler = Scheduler::new(
        identity,
        &runtime.timing,
        link,
        hardware,
        sensors,
        store,
        boot_ms,
    );
    let mut unpublished: Option<SensorSnapshot> = None;

    loop {
        feed_watchdog();

        while let Ok(request) = request_rx.try_recv() {
            scheduler.handle_local(request);
        }

        let now = TickTime {
            monotonic_ms: monotonic_ms(),
            epoch_secs: Utc::now().timestamp(),
        };
        if let Some(fresh) = scheduler.tick(now) {
            unpublished = Some(fresh);
        }

        if let Some(fresh) = unpublished {
            if let Ok(mut guard) = snapshot.try_write() {
                *guard = fresh;
                unpublished = None;
            }
        }

        thread::sleep(Duration::from_millis(scheduler.tick_quantum_ms()));
    }
}

fn broker_from_build_env() -> BrokerConfig {
    let defaults = BrokerConfig::default();
    BrokerConfig {
        host: option_env!("MQTT_HOST")
            .map(str::to_string)
            .unwrap_or(defaults.host),
        port: option_env!("MQTT_PORT")
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(defaults.port),
        user: option_env!("MQTT_USER").unwrap_or_default().to_string(),
        pass: option_env!("MQTT_PASS").unwrap_or_default().to_string(),
        tls: option_env!("MQTT_TLS").map_or(defaults.tls, |value| value != "0"),
    }
}

fn seed_build_credentials(store: &mut ConfigStore<NvsBackend>) {
    if store.settings().has_network_credentials() {
        return;
    }
    let Some(ssid) = option_env!("WIFI_SSID") else {
        warn!("no stored wifi credentials; the node will start its configuration access point");
        return;
    };

    let update = ConfigUpdate {
        network_ssid: Some(ssid.to_string()),
        network_password: option_env!("WIFI_PASS").map(str::to_string),
        ..Default::default()
    };
    if let Err(err) = store.apply_update(&update) {
        warn!("failed to persist build-time wifi credentials: {err}");
    }
}

fn efuse_mac() -> u64 {
    let mut mac = [0_u8; 8];
    let rc = unsafe { esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr()) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to read eFuse MAC: esp_err_t={rc}");
    }
    u64::from_le_bytes(mac)
}

struct NvsBackend {
    nvs: EspNvs<NvsDefault>,
}

impl NvsBackend {
    fn open(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        Ok(Self {
            nvs: EspNvs::new(partition, SETTINGS_NAMESPACE, true)?,
        })
    }
}

impl SettingsBackend for NvsBackend {
    fn get_str(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        let mut buffer = [0_u8; NVS_VALUE_BUFFER];
        self.nvs
            .get_str(key, &mut buffer)
            .map(|value| value.map(str::to_string))
            .map_err(|err| StoreError::Backend(format!("{key}: {err}")))
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.nvs
            .set_str(key, value)
            .map_err(|err| StoreError::Backend(format!("{key}: {err}")))
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        for key in [KEY_WIFI_SSID, KEY_WIFI_PASS, KEY_SAMPLING_INTERVAL_MS] {
            self.nvs
                .remove(key)
                .map_err(|err| StoreError::Backend(format!("{key}: {err}")))?;
        }
        Ok(())
    }
}

struct EspLink {
    wifi: BlockingWifi<EspWifi<'static>>,
    broker: BrokerConfig,
    mqtt: Option<EspMqttClient<'static>>,
    connected: Arc<AtomicBool>,
    inbound_tx: mpsc::SyncSender<InboundMessage>,
    inbound_rx: mpsc::Receiver<InboundMessage>,
}

impl EspLink {
    fn new(wifi: BlockingWifi<EspWifi<'static>>, broker: BrokerConfig) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::sync_channel(INBOUND_QUEUE_DEPTH);
        Self {
            wifi,
            broker,
            mqtt: None,
            connected: Arc::new(AtomicBool::new(false)),
            inbound_tx,
            inbound_rx,
        }
    }

    fn close_session(&mut self) {
        self.mqtt = None;
        self.connected.store(false, Ordering::Relaxed);
    }

    fn try_join(&mut self, ssid: &str, password: &str) -> anyhow::Result<()> {
        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
                password: password
                    .try_into()
                    .map_err(|_| anyhow!("wifi password too long"))?,
                auth_method,
                ..Default::default()
            }))?;

        if !self.wifi.is_started()? {
            self.wifi.start()?;
        }
        self.wifi.connect()?;
        self.wifi.wait_netif_up()?;
        disable_wifi_power_save();
        Ok(())
    }

    fn try_start_access_point(&mut self, ssid: &str) -> anyhow::Result<()> {
        let _ = self.wifi.disconnect();
        let _ = self.wifi.stop();

        self.wifi
            .set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
                ssid: ssid
                    .try_into()
                    .map_err(|_| anyhow!("access point SSID too long"))?,
                password: ACCESS_POINT_PASSWORD
                    .try_into()
                    .map_err(|_| anyhow!("access point password too long"))?,
                auth_method: AuthMethod::WPAWPA2Personal,
                channel: 1,
                ..Default::default()
            }))?;
        self.wifi.start()?;
        self.wifi.wait_netif_up()?;
        Ok(())
    }
}

impl BrokerLink for EspLink {
    fn join_network(&mut self, ssid: &str, password: &str) -> Result<(), LinkError> {
        if ssid.trim().is_empty() {
            return Err(LinkError::MissingCredentials);
        }
        self.try_join(ssid, password).map_err(|err| {
            let _ = self.wifi.disconnect();
            LinkError::Join(format!("{err:#}"))
        })
    }

    fn network_up(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }

    fn open_session(&mut self, client_id: &str) -> Result<(), LinkError> {
        self.close_session();

        let scheme = if self.broker.tls { "mqtts" } else { "mqtt" };
        let url = format!("{scheme}://{}:{}", self.broker.host, self.broker.port);
        let conf = MqttClientConfiguration {
            client_id: Some(client_id),
            username: if self.broker.user.is_empty() {
                None
            } else {
                Some(self.broker.user.as_str())
            },
            password: if self.broker.pass.is_empty() {
                None
            } else {
                Some(self.broker.pass.as_str())
            },
            crt_bundle_attach: if self.broker.tls {
                Some(esp_idf_svc::sys::esp_crt_bundle_attach)
            } else {
                None
            },
            ..Default::default()
        };

        let connected = self.connected.clone();
        let inbound = self.inbound_tx.clone();
        let client = EspMqttClient::new_cb(&url, &conf, move |event| match event.payload() {
            EventPayload::Connected(_) => connected.store(true, Ordering::Relaxed),
            EventPayload::Disconnected => connected.store(false, Ordering::Relaxed),
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
                if inbound.try_send(message).is_err() {
                    warn!("inbound queue full, dropping message on {topic}");
                }
            }
            EventPayload::Error(err) => warn!("mqtt error: {err:?}"),
            _ => {}
        })
        .map_err(|err| LinkError::Session(format!("{url}: {err}")))?;

        let deadline = Instant::now() + SESSION_CONNECT_TIMEOUT;
        while !self.connected.load(Ordering::Relaxed) {
            if Instant::now() >= deadline {
                return Err(LinkError::Session(format!(
                    "no CONNACK from {url} within {}s",
                    SESSION_CONNECT_TIMEOUT.as_secs()
                )));
            }
            feed_watchdog();
            thread::sleep(Duration::from_millis(100));
        }

        self.mqtt = Some(client);
        Ok(())
    }

    fn session_connected(&self) -> bool {
        self.mqtt.is_some() && self.connected.load(Ordering::Relaxed)
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), LinkError> {
        let mqtt = self.mqtt.as_mut().ok_or_else(|| LinkError::Subscribe {
            topic: topic.to_string(),
            reason: "no session".to_string(),
        })?;
        mqtt.subscribe(topic, QoS::AtMostOnce)
            .map(|_| ())
            .map_err(|err| LinkError::Subscribe {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), LinkError> {
        let mqtt = self.mqtt.as_mut().ok_or_else(|| LinkError::Publish {
            topic: topic.to_string(),
            reason: "no session".to_string(),
        })?;
        mqtt.publish(topic, QoS::AtMostOnce, false, payload)
            .map(|_| ())
            .map_err(|err| LinkError::Publish {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }

    fn poll_inbound(&mut self) -> Option<InboundMessage> {
        self.inbound_rx.try_recv().ok()
    }

    fn start_access_point(&mut self, ssid: &str) -> Result<(), LinkError> {
        self.close_session();
        self.try_start_access_point(ssid)
            .map_err(|err| LinkError::AccessPoint(format!("{err:#}")))?;
        info!("configuration access point `{ssid}` up (password: `{ACCESS_POINT_PASSWORD}`)");
        Ok(())
    }

    fn metrics(&self) -> LinkMetrics {
        let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
        let rssi = if rc == esp_idf_svc::sys::ESP_OK {
            ap_info.rssi as i32
        } else {
            0
        };
        LinkMetrics {
            rssi,
            free_memory: unsafe { esp_idf_svc::sys::esp_get_free_heap_size() } as u64,
        }
    }

    fn session_nonce(&mut self) -> u16 {
        (unsafe { esp_idf_svc::sys::esp_random() } & 0xffff) as u16
    }
}

struct EspHardware {
    relay: PinDriver<'static, AnyOutputPin, Output>,
    buzzer: PinDriver<'static, AnyOutputPin, Output>,
    status_led: Option<PinDriver<'static, AnyOutputPin, Output>>,
    led_lit: bool,
    motion: PinDriver<'static, AnyIOPin, Input>,
    button: PinDriver<'static, AnyIOPin, Input>,
}

impl EspHardware {
    fn new(pins: &PinConfig) -> anyhow::Result<Self> {
        let mut relay = unsafe { PinDriver::output(AnyOutputPin::new(pins.relay)) }
            .with_context(|| format!("relay on GPIO{}", pins.relay))?;
        relay.set_low()?;
        let mut buzzer = unsafe { PinDriver::output(AnyOutputPin::new(pins.buzzer)) }
            .with_context(|| format!("buzzer on GPIO{}", pins.buzzer))?;
        buzzer.set_low()?;

        let status_led = match unsafe { PinDriver::output(AnyOutputPin::new(pins.status_led)) } {
            Ok(mut pin) => {
                let _ = pin.set_low();
                Some(pin)
            }
            Err(err) => {
                warn!("status LED unavailable on GPIO{}: {err}", pins.status_led);
                None
            }
        };

        let motion = unsafe { PinDriver::input(AnyIOPin::new(pins.motion)) }
            .with_context(|| format!("motion input on GPIO{}", pins.motion))?;
        let mut button = unsafe { PinDriver::input(AnyIOPin::new(pins.config_button)) }
            .with_context(|| format!("config button on GPIO{}", pins.config_button))?;
        button.set_pull(Pull::Up)?;

        Ok(Self {
            relay,
            buzzer,
            status_led,
            led_lit: false,
            motion,
            button,
        })
    }
}

fn drive(pin: &mut PinDriver<'static, AnyOutputPin, Output>, on: bool, name: &str) {
    let result = if on { pin.set_high() } else { pin.set_low() };
    if let Err(err) = result {
        warn!("failed to drive {name}: {err}");
    }
}

impl Actuators for EspHardware {
    fn set_relay(&mut self, on: bool) {
        drive(&mut self.relay, on, "relay");
    }

    fn set_buzzer(&mut self, on: bool) {
        drive(&mut self.buzzer, on, "buzzer");
    }

    fn delay_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

impl NodeHardware for EspHardware {
    fn motion_active(&mut self) -> bool {
        self.motion.is_high()
    }

    fn config_button_pressed(&mut self) -> bool {
        // Active low with the internal pull-up.
        self.button.is_low()
    }

    fn set_status_led(&mut self, on: bool) {
        if self.led_lit == on {
            return;
        }
        if let Some(pin) = self.status_led.as_mut() {
            drive(pin, on, "status LED");
            self.led_lit = on;
        }
    }

    fn restart(&mut self) {
        thread::sleep(Duration::from_millis(100));
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
}

fn build_sensor_bank(pins: &PinConfig) -> SensorBank {
    let mut bank = SensorBank::new();
    match Ds18b20Driver::new(pins.one_wire) {
        Ok(driver) => bank = bank.with_driver(driver),
        Err(err) => warn!("DS18B20 disabled: {err:#}"),
    }
    match Dht11Driver::new(pins.dht) {
        Ok(driver) => bank = bank.with_driver(driver),
        Err(err) => warn!("DHT11 disabled: {err:#}"),
    }
    bank.with_driver(FixedBattery)
}

struct Ds18b20Driver {
    one_wire: OneWire<PinDriver<'static, AnyIOPin, InputOutput>>,
    address: Option<Address>,
    pin: i32,
    delay: Ets,
}

impl Ds18b20Driver {
    fn new(pin: i32) -> anyhow::Result<Self> {
        let mut one_wire_pin = unsafe { PinDriver::input_output_od(AnyIOPin::new(pin)) }?;
        one_wire_pin.set_pull(Pull::Up)?;
        one_wire_pin.set_high()?;

        let one_wire = OneWire::new(one_wire_pin)
            .map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))?;

        let mut driver = Self {
            one_wire,
            address: None,
            pin,
            delay: Ets,
        };
        driver.refresh_address();
        Ok(driver)
    }

    fn refresh_address(&mut self) {
        let mut found: Option<Address> = None;
        let mut device_count = 0_u32;

        for addr in self.one_wire.devices(false, &mut self.delay) {
            match addr {
                Ok(address) => {
                    device_count = device_count.saturating_add(1);
                    if found.is_none() && address.family_code() == ds18b20::FAMILY_CODE {
                        found = Some(address);
                    }
                }
                Err(err) => {
                    warn!("one-wire device scan failed: {err:?}");
                    break;
                }
            }
        }

        self.address = found;
        match self.address {
            Some(address) => info!("DS18B20 ready on GPIO{} (using {:?})", self.pin, address),
            None => warn!(
                "no DS18B20 found on GPIO{} ({} one-wire device(s) detected)",
                self.pin, device_count
            ),
        }
    }
}

impl SensorDriver for Ds18b20Driver {
    fn name(&self) -> &'static str {
        "ds18b20"
    }

    fn read(&mut self) -> Result<Reading, SensorError> {
        if self.address.is_none() {
            self.refresh_address();
        }
        let address = self.address.ok_or(SensorError::Missing { sensor: "ds18b20" })?;

        let sensor = Ds18b20::new::<core::convert::Infallible>(address).map_err(|err| {
            self.address = None;
            SensorError::Read {
                sensor: "ds18b20",
                reason: format!("invalid address {address:?}: {err:?}"),
            }
        })?;

        if let Err(err) =
            ds18b20::start_simultaneous_temp_measurement(&mut self.one_wire, &mut self.delay)
        {
            self.address = None;
            return Err(SensorError::Read {
                sensor: "ds18b20",
                reason: format!("conversion start failed: {err:?}"),
            });
        }

        Resolution::Bits12.delay_for_measurement_time(&mut self.delay);

        match sensor.read_data(&mut self.one_wire, &mut self.delay) {
            Ok(data) => Ok(Reading::single(Quantity::Temperature, data.temperature)),
            Err(err) => {
                self.address = None;
                Err(SensorError::Read {
                    sensor: "ds18b20",
                    reason: format!("{err:?}"),
                })
            }
        }
    }
}

struct Dht11Driver {
    pin: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
}

impl Dht11Driver {
    fn new(pin: i32) -> anyhow::Result<Self> {
        let mut pin = unsafe { PinDriver::input_output_od(AnyIOPin::new(pin)) }?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;
        Ok(Self { pin, delay: Ets })
    }
}

impl SensorDriver for Dht11Driver {
    fn name(&self) -> &'static str {
        "dht11"
    }

    fn read(&mut self) -> Result<Reading, SensorError> {
        self.pin.set_high().map_err(|err| SensorError::Read {
            sensor: "dht11",
            reason: format!("line high: {err:?}"),
        })?;

        dht11::blocking::read(&mut self.delay, &mut self.pin)
            .map(|reading| Reading::single(Quantity::Humidity, reading.relative_humidity as f32))
            .map_err(|err| SensorError::Read {
                sensor: "dht11",
                reason: format!("{err:?}"),
            })
    }
}

struct FixedBattery;

impl SensorDriver for FixedBattery {
    fn name(&self) -> &'static str {
        "battery"
    }

    fn read(&mut self) -> Result<Reading, SensorError> {
        Ok(Reading::single(Quantity::Battery, 100.0))
    }
}

#[derive(Debug, Serialize)]
struct RelayResponse {
    relay: &'static str,
}

#[derive(Debug, Serialize)]
struct ConfigResponse {
    accepted: bool,
    #[serde(rename = "restartRequired")]
    restart_required: bool,
}

fn create_status_server(
    snapshot: Arc<RwLock<SensorSnapshot>>,
    requests: mpsc::Sender<LocalRequest>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 8 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/api/sensors", Method::Get, move |req| {
        let current = *snapshot
            .read()
            .map_err(|_| anyhow!("snapshot lock poisoned"))?;
        write_json(req, &current)
    })?;

    {
        let requests = requests.clone();
        server.fn_handler::<anyhow::Error, _>("/api/relay", Method::Post, move |mut req| {
            let query = req.uri().split_once('?').map(|(_, query)| query.to_string());
            let body = read_request_body(&mut req)?;
            let body = String::from_utf8_lossy(&body);

            let state = query
                .as_deref()
                .and_then(|query| form_value(query, "state"))
                .or_else(|| form_value(&body, "state"));
            let Some(state) = state else {
                return write_error(req, 400, "Missing 'state' parameter");
            };
            let on = match state.to_ascii_lowercase().as_str() {
                "on" => true,
                "off" => false,
                _ => return write_error(req, 400, "Invalid state. Use 'on' or 'off'"),
            };

            if requests.send(LocalRequest::Relay(on)).is_err() {
                return write_error(req, 503, "Node loop is not running");
            }
            write_json(
                req,
                &RelayResponse {
                    relay: if on { "on" } else { "off" },
                },
            )
        })?;
    }

    {
        let requests = requests.clone();
        server.fn_handler::<anyhow::Error, _>("/api/config", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let update: ConfigUpdate = match serde_json::from_slice(&body) {
                Ok(update) => update,
                Err(err) => {
                    warn!("rejected config payload: {err}");
                    return write_error(req, 400, "Invalid config payload");
                }
            };

            if let Err(message) = validate_config_update(&update) {
                return write_error(req, 400, message);
            }

            let restart_required = update.changes_network();
            if requests.send(LocalRequest::Configure(update)).is_err() {
                return write_error(req, 503, "Node loop is not running");
            }
            write_json(
                req,
                &ConfigResponse {
                    accepted: true,
                    restart_required,
                },
            )
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/api/restart", Method::Post, move |req| {
        if requests.send(LocalRequest::Restart).is_err() {
            return write_error(req, 503, "Node loop is not running");
        }
        write_json(req, &serde_json::json!({ "restarting": true }))
    })?;

    Ok(server)
}

fn validate_config_update(update: &ConfigUpdate) -> Result<(), &'static str> {
    if update.is_empty() {
        return Err("No settings provided");
    }
    if update
        .network_ssid
        .as_deref()
        .is_some_and(|ssid| ssid.trim().is_empty())
    {
        return Err("wifiSsid must not be empty");
    }
    Ok(())
}

fn form_value<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    text.split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| name.trim() == key)
        .map(|(_, value)| value.trim())
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
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

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

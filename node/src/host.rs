use std::{
    collections::BTreeMap,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc as std_mpsc, Arc, Mutex, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use chrono::Utc;
use rand_core::{OsRng, RngCore};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use sha2::{Digest, Sha256};
use sysinfo::System;
use tokio::{
    net::TcpListener,
    runtime::Handle,
    sync::{mpsc, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use sensornode_common::{
    config::SETTINGS_NAMESPACE, Actuators, BrokerConfig, BrokerLink, ConfigStore, DeviceIdentity,
    InboundMessage, LinkError, LinkMetrics, LocalRequest, NodeHardware, Quantity, Reading,
    RuntimeConfig, Scheduler, SensorBank, SensorDriver, SensorError, SensorSnapshot,
    SettingsBackend, StoreError, TickTime,
};

use crate::status::{self, StatusState};

const SESSION_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(30);
const INBOUND_QUEUE_DEPTH: usize = 32;
const MOTION_PERIOD_MS: u64 = 45_000;
const MOTION_ACTIVE_MS: u64 = 4_000;

type HostScheduler = Scheduler<MqttLink, HostHardware, FileBackend>;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let boot_ms = monotonic_ms();
    let runtime = runtime_from_env();
    let identity = host_identity();
    info!("node identity {identity}");

    let store = ConfigStore::open(FileBackend::open(settings_path()));
    let link = MqttLink::new(runtime.broker.clone(), Handle::current());
    let sensors = SensorBank::new()
        .with_driver(SimulatedClimate::default())
        .with_driver(SimulatedAmbient::default())
        .with_driver(FixedBattery);

    let scheduler = Scheduler::new(
        identity,
        &runtime.timing,
        link,
        HostHardware::default(),
        sensors,
        store,
        boot_ms,
    );

    let snapshot = Arc::new(RwLock::new(SensorSnapshot::default()));
    let (requests, request_rx) = mpsc::channel(8);
    let status_state = StatusState {
        snapshot: snapshot.clone(),
        requests,
    };

    let port = std::env::var("NODE_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status server at {addr}"))?;
    info!("status server listening on http://{addr}");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, status::router(status_state)).await {
            warn!("status server stopped: {err}");
        }
    });

    tokio::task::spawn_blocking(move || run_loop(scheduler, snapshot, request_rx))
        .await
        .context("node loop panicked")?;
    Ok(())
}

fn run_loop(
    mut scheduler: HostScheduler,
    shared: Arc<RwLock<SensorSnapshot>>,
    mut requests: mpsc::Receiver<LocalRequest>,
) {
    let mut unpublished: Option<SensorSnapshot> = None;

    loop {
        while let Ok(request) = requests.try_recv() {
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
            match shared.try_write() {
                Ok(mut guard) => {
                    *guard = fresh;
                    unpublished = None;
                }
                Err(_) => debug!("status reader busy; snapshot copy retried next tick"),
            }
        }

        std::thread::sleep(Duration::from_millis(scheduler.tick_quantum_ms()));
    }
}

fn runtime_from_env() -> RuntimeConfig {
    RuntimeConfig {
        broker: BrokerConfig {
            host: std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: std::env::var("MQTT_PORT")
                .ok()
                .and_then(|value| value.parse::<u16>().ok())
                .unwrap_or(1883),
            user: std::env::var("MQTT_USER").unwrap_or_default(),
            pass: std::env::var("MQTT_PASS").unwrap_or_default(),
            tls: false,
        },
        ..Default::default()
    }
}

fn settings_path() -> PathBuf {
    std::env::var("SENSORNODE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.sensornode"))
        .join("settings.json")
}

fn host_identity() -> DeviceIdentity {
    let seed = std::fs::read_to_string("/etc/machine-id")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "sensornode-host".to_string());
    DeviceIdentity::from_hardware_id(hardware_id_from_seed(seed.trim()))
}

fn hardware_id_from_seed(seed: &str) -> u64 {
    let digest = Sha256::digest(seed.as_bytes());
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
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

struct FileBackend {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl FileBackend {
    fn open(path: PathBuf) -> Self {
        let entries = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|err| {
                warn!("ignoring unreadable settings file {}: {err}", path.display());
                BTreeMap::new()
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                warn!("failed to read settings file {}: {err}", path.display());
                BTreeMap::new()
            }
        };
        info!(
            "settings namespace `{SETTINGS_NAMESPACE}` backed by {} ({} keys)",
            path.display(),
            entries.len()
        );
        Self { path, entries }
    }

    fn flush(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| StoreError::Backend(err.to_string()))?;
        }
        let payload = serde_json::to_vec_pretty(&self.entries)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        std::fs::write(&self.path, payload).map_err(|err| StoreError::Backend(err.to_string()))
    }
}

impl SettingsBackend for FileBackend {
    fn get_str(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value.to_string());
        self.flush()
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        self.entries.clear();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Backend(err.to_string())),
        }
    }
}

struct MqttLink {
    broker: BrokerConfig,
    runtime: Handle,
    client: Option<AsyncClient>,
    poller: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
    inbound: Option<mpsc::Receiver<InboundMessage>>,
    system: Mutex<System>,
}

impl MqttLink {
    fn new(broker: BrokerConfig, runtime: Handle) -> Self {
        if broker.tls {
            warn!("TLS is not available in host builds; connecting in plain text");
        }
        Self {
            broker,
            runtime,
            client: None,
            poller: None,
            connected: Arc::new(AtomicBool::new(false)),
            inbound: None,
            system: Mutex::new(System::new()),
        }
    }

    fn close_session(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        self.client = None;
        self.inbound = None;
        self.connected.store(false, Ordering::Relaxed);
    }
}

impl BrokerLink for MqttLink {
    fn join_network(&mut self, _ssid: &str, _password: &str) -> Result<(), LinkError> {
        debug!("host build uses the system network; station credentials ignored");
        Ok(())
    }

    fn network_up(&self) -> bool {
        true
    }

    fn open_session(&mut self, client_id: &str) -> Result<(), LinkError> {
        self.close_session();

        let mut options = MqttOptions::new(client_id, self.broker.host.clone(), self.broker.port);
        options.set_keep_alive(MQTT_KEEP_ALIVE);
        if !self.broker.user.is_empty() {
            options.set_credentials(self.broker.user.clone(), self.broker.pass.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, INBOUND_QUEUE_DEPTH);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let (ack_tx, ack_rx) = std_mpsc::sync_channel(1);

        self.poller = Some(self.runtime.spawn(poll_session(
            eventloop,
            self.connected.clone(),
            inbound_tx,
            ack_tx,
        )));

        match ack_rx.recv_timeout(SESSION_CONNECT_TIMEOUT) {
            Ok(Ok(())) => {
                self.client = Some(client);
                self.inbound = Some(inbound_rx);
                Ok(())
            }
            Ok(Err(reason)) => {
                self.close_session();
                Err(LinkError::Session(reason))
            }
            Err(_) => {
                self.close_session();
                Err(LinkError::Session(format!(
                    "no CONNACK from {}:{} within {}s",
                    self.broker.host,
                    self.broker.port,
                    SESSION_CONNECT_TIMEOUT.as_secs()
                )))
            }
        }
    }

    fn session_connected(&self) -> bool {
        self.client.is_some() && self.connected.load(Ordering::Relaxed)
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), LinkError> {
        let client = self.client.as_ref().ok_or_else(|| LinkError::Subscribe {
            topic: topic.to_string(),
            reason: "no session".to_string(),
        })?;
        client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|err| LinkError::Subscribe {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), LinkError> {
        let client = self.client.as_ref().ok_or_else(|| LinkError::Publish {
            topic: topic.to_string(),
            reason: "no session".to_string(),
        })?;
        client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|err| LinkError::Publish {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }

    fn poll_inbound(&mut self) -> Option<InboundMessage> {
        self.inbound.as_mut()?.try_recv().ok()
    }

    fn start_access_point(&mut self, ssid: &str) -> Result<(), LinkError> {
        self.close_session();
        warn!("host build has no radio; simulating configuration access point `{ssid}`");
        Ok(())
    }

    fn metrics(&self) -> LinkMetrics {
        let free_memory = match self.system.lock() {
            Ok(mut system) => {
                system.refresh_memory();
                system.available_memory()
            }
            Err(_) => 0,
        };
        LinkMetrics {
            rssi: 0,
            free_memory,
        }
    }

    fn session_nonce(&mut self) -> u16 {
        (OsRng.next_u32() & 0xffff) as u16
    }
}

async fn poll_session(
    mut eventloop: EventLoop,
    connected: Arc<AtomicBool>,
    inbound: mpsc::Sender<InboundMessage>,
    ack: std_mpsc::SyncSender<Result<(), String>>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                connected.store(true, Ordering::Relaxed);
                let _ = ack.try_send(Ok(()));
            }
            Ok(Event::Incoming(Incoming::Publish(message))) => {
                let message = InboundMessage {
                    topic: message.topic,
                    payload: message.payload.to_vec(),
                };
                if let Err(err) = inbound.try_send(message) {
                    warn!("inbound queue full, dropping message: {err}");
                }
            }
            Ok(_) => {}
            Err(err) => {
                connected.store(false, Ordering::Relaxed);
                let _ = ack.try_send(Err(err.to_string()));
                warn!("mqtt session ended: {err}");
                break;
            }
        }
    }
}

#[derive(Default)]
struct HostHardware {
    relay: bool,
    buzzer: bool,
}

impl Actuators for HostHardware {
    fn set_relay(&mut self, on: bool) {
        if self.relay != on {
            info!("relay -> {}", if on { "on" } else { "off" });
        }
        self.relay = on;
    }

    fn set_buzzer(&mut self, on: bool) {
        if self.buzzer != on {
            info!("buzzer -> {}", if on { "on" } else { "off" });
        }
        self.buzzer = on;
    }

    fn delay_ms(&mut self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

impl NodeHardware for HostHardware {
    fn motion_active(&mut self) -> bool {
        monotonic_ms() % MOTION_PERIOD_MS < MOTION_ACTIVE_MS
    }

    fn config_button_pressed(&mut self) -> bool {
        false
    }

    fn set_status_led(&mut self, _on: bool) {}

    fn restart(&mut self) {
        info!("restart requested; exiting so the supervisor can relaunch");
        std::process::exit(0);
    }
}

#[derive(Default)]
struct SimulatedClimate {
    tick: u64,
}

impl SensorDriver for SimulatedClimate {
    fn name(&self) -> &'static str {
        "sim-climate"
    }

    fn read(&mut self) -> Result<Reading, SensorError> {
        self.tick = self.tick.saturating_add(1);
        Ok(Reading::new()
            .with(Quantity::Temperature, 21.0 + (self.tick % 8) as f32 * 0.2)
            .with(Quantity::Humidity, 42.0 + (self.tick % 6) as f32 * 0.5))
    }
}

#[derive(Default)]
struct SimulatedAmbient {
    tick: u64,
}

impl SensorDriver for SimulatedAmbient {
    fn name(&self) -> &'static str {
        "sim-ambient"
    }

    fn read(&mut self) -> Result<Reading, SensorError> {
        self.tick = self.tick.saturating_add(1);
        Ok(Reading::new()
            .with(Quantity::Pressure, 1013.0 + (self.tick % 5) as f32 * 0.3)
            .with(Quantity::GasResistance, 48.0 + (self.tick % 7) as f32)
            .with(Quantity::LightLevel, 300.0 + (self.tick % 10) as f32 * 12.0)
            .with(Quantity::SoundLevel, 35.0 + (self.tick % 4) as f32 * 2.5))
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

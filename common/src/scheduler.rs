use tracing::{debug, info, warn};

use crate::{
    config::{ConfigStore, ConfigUpdate, SettingsBackend, TimingConfig},
    connectivity::{BrokerLink, ConnectivityManager, LinkEvent},
    hardware::NodeHardware,
    identity::DeviceIdentity,
    led::status_led_on,
    protocol::{
        build_event, build_heartbeat, build_telemetry, Message, MessageRouter,
        EVENT_MOTION_DETECTED,
    },
    sensors::SensorBank,
    types::{SensorSnapshot, TickTime},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalTimer {
    period_ms: u64,
    last_fired_ms: u64,
}

impl IntervalTimer {
    pub fn new(period_ms: u64, now_ms: u64) -> Self {
        Self {
            period_ms,
            last_fired_ms: now_ms,
        }
    }

    pub fn due(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_fired_ms) >= self.period_ms
    }

    pub fn reset(&mut self, now_ms: u64) {
        self.last_fired_ms = now_ms;
    }

    pub fn period_ms(&self) -> u64 {
        self.period_ms
    }

    pub fn set_period(&mut self, period_ms: u64) {
        self.period_ms = period_ms;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EdgeDetector {
    level: bool,
}

impl EdgeDetector {
    pub fn update(&mut self, level: bool) -> Option<Edge> {
        let previous = std::mem::replace(&mut self.level, level);
        match (previous, level) {
            (false, true) => Some(Edge::Rising),
            (true, false) => Some(Edge::Falling),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HoldDetector {
    hold_ms: u64,
    pressed_since_ms: Option<u64>,
    fired: bool,
}

impl HoldDetector {
    pub fn new(hold_ms: u64) -> Self {
        Self {
            hold_ms,
            pressed_since_ms: None,
            fired: false,
        }
    }

    pub fn update(&mut self, pressed: bool, now_ms: u64) -> bool {
        if !pressed {
            self.pressed_since_ms = None;
            self.fired = false;
            return false;
        }

        let since = *self.pressed_since_ms.get_or_insert(now_ms);
        if self.fired || now_ms.saturating_sub(since) < self.hold_ms {
            return false;
        }
        self.fired = true;
        true
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Timers {
    pub sampling: IntervalTimer,
    pub heartbeat: IntervalTimer,
    pub motion: EdgeDetector,
    pub button: HoldDetector,
}

impl Timers {
    pub fn new(timing: &TimingConfig, sampling_interval_ms: u64, boot_ms: u64) -> Self {
        Self {
            sampling: IntervalTimer::new(sampling_interval_ms, boot_ms),
            heartbeat: IntervalTimer::new(timing.heartbeat_interval_ms, boot_ms),
            motion: EdgeDetector::default(),
            button: HoldDetector::new(timing.button_hold_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalRequest {
    Relay(bool),
    Configure(ConfigUpdate),
    Restart,
}

pub struct DeviceContext<B> {
    pub identity: DeviceIdentity,
    pub store: ConfigStore<B>,
    pub snapshot: SensorSnapshot,
    pub timers: Timers,
    pub boot_ms: u64,
    pub pending_restart: bool,
}

pub struct Scheduler<L, H, B> {
    context: DeviceContext<B>,
    connectivity: ConnectivityManager<L>,
    router: MessageRouter,
    sensors: SensorBank,
    hardware: H,
    max_inbound_per_tick: usize,
    tick_quantum_ms: u64,
}

impl<L, H, B> Scheduler<L, H, B>
where
    L: BrokerLink,
    H: NodeHardware,
    B: SettingsBackend,
{
    pub fn new(
        identity: DeviceIdentity,
        timing: &TimingConfig,
        link: L,
        hardware: H,
        sensors: SensorBank,
        store: ConfigStore<B>,
        boot_ms: u64,
    ) -> Self {
        let sampling_interval_ms = store.settings().sampling_interval_ms;
        info!(
            "scheduler ready for {identity}: {} sensor drivers, sampling every {sampling_interval_ms}ms",
            sensors.driver_count()
        );

        Self {
            connectivity: ConnectivityManager::new(link, identity.clone(), timing),
            router: MessageRouter::new(identity.clone(), timing),
            context: DeviceContext {
                identity,
                store,
                snapshot: SensorSnapshot::default(),
                timers: Timers::new(timing, sampling_interval_ms, boot_ms),
                boot_ms,
                pending_restart: false,
            },
            sensors,
            hardware,
            max_inbound_per_tick: timing.max_inbound_per_tick,
            tick_quantum_ms: timing.tick_quantum_ms,
        }
    }

    pub fn tick(&mut self, now: TickTime) -> Option<SensorSnapshot> {
        let now_ms = now.monotonic_ms;

        // 1. connectivity
        let event = self
            .connectivity
            .ensure_connected(now_ms, self.context.store.settings());
        if event == Some(LinkEvent::SessionEstablished) {
            self.publish_heartbeat(now_ms);
        }

        // 2. inbound
        self.drain_inbound(now.epoch_secs);

        // 3. sampling
        let motion = self.hardware.motion_active();
        let sampled = self.sample_if_due(now, motion);

        // 4. heartbeat
        if self.context.timers.heartbeat.due(now_ms) {
            self.publish_heartbeat(now_ms);
        }

        // 5. motion edge
        if self.context.timers.motion.update(motion) == Some(Edge::Rising) {
            info!("motion detected");
            match build_event(&self.context.identity, EVENT_MOTION_DETECTED, now.epoch_secs) {
                Ok(message) => {
                    self.publish(&message);
                }
                Err(err) => warn!("event serialization failed: {err}"),
            }
        }

        // 6. configuration button
        let pressed = self.hardware.config_button_pressed();
        if self.context.timers.button.update(pressed, now_ms) {
            info!("configuration button held; starting access point");
            self.connectivity.enter_config_access_point();
        }

        self.hardware
            .set_status_led(status_led_on(self.connectivity.state(), now_ms));

        if self.context.pending_restart {
            self.context.pending_restart = false;
            info!("restarting");
            self.hardware.restart();
        }

        sampled
    }

    pub fn tick_quantum_ms(&self) -> u64 {
        self.tick_quantum_ms
    }

    pub fn snapshot(&self) -> &SensorSnapshot {
        &self.context.snapshot
    }

    pub fn context(&self) -> &DeviceContext<B> {
        &self.context
    }

    pub fn connectivity(&self) -> &ConnectivityManager<L> {
        &self.connectivity
    }

    pub fn connectivity_mut(&mut self) -> &mut ConnectivityManager<L> {
        &mut self.connectivity
    }

    pub fn hardware(&self) -> &H {
        &self.hardware
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hardware
    }

    pub fn handle_local(&mut self, request: LocalRequest) {
        match request {
            LocalRequest::Relay(on) => {
                info!("relay {} (local request)", if on { "on" } else { "off" });
                self.hardware.set_relay(on);
            }
            LocalRequest::Configure(update) => {
                if let Err(err) = self.context.store.apply_update(&update) {
                    warn!("local config update kept in memory only: {err}");
                }
                if update.changes_network() {
                    info!("network settings saved; they apply after the next restart");
                }
            }
            // Takes effect at the end of the next tick.
            LocalRequest::Restart => self.context.pending_restart = true,
        }
    }

    fn drain_inbound(&mut self, epoch_secs: i64) {
        for _ in 0..self.max_inbound_per_tick {
            let Some(message) = self.connectivity.poll_inbound() else {
                return;
            };
            let outcome = self.router.handle_inbound(
                &message.topic,
                &message.payload,
                &mut self.hardware,
                &mut self.context.store,
                epoch_secs,
            );
            if let Some(response) = outcome.response {
                self.publish(&response);
            }
            if outcome.restart_requested {
                self.context.pending_restart = true;
            }
        }
        debug!(
            "inbound budget of {} messages spent; rest deferred to next tick",
            self.max_inbound_per_tick
        );
    }

    fn sample_if_due(&mut self, now: TickTime, motion: bool) -> Option<SensorSnapshot> {
        let timers = &mut self.context.timers;
        let interval_ms = self.context.store.settings().sampling_interval_ms;
        if timers.sampling.period_ms() != interval_ms {
            info!("sampling interval now {interval_ms}ms");
            timers.sampling.set_period(interval_ms);
        }
        if !timers.sampling.due(now.monotonic_ms) {
            return None;
        }
        timers.sampling.reset(now.monotonic_ms);

        let snapshot = self.sensors.sample(motion, now.epoch_secs);
        self.context.snapshot = snapshot;
        match build_telemetry(&snapshot, &self.context.identity, self.connectivity.metrics()) {
            Ok(message) => {
                self.publish(&message);
            }
            Err(err) => warn!("telemetry serialization failed: {err}"),
        }
        Some(snapshot)
    }

    fn publish_heartbeat(&mut self, now_ms: u64) {
        self.context.timers.heartbeat.reset(now_ms);
        let uptime_ms = now_ms.saturating_sub(self.context.boot_ms);
        match build_heartbeat(&self.context.identity, uptime_ms, self.connectivity.metrics()) {
            Ok(message) => {
                self.publish(&message);
            }
            Err(err) => warn!("heartbeat serialization failed: {err}"),
        }
    }

    fn publish(&mut self, message: &Message) -> bool {
        self.connectivity.publish(&message.topic, &message.payload)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::{KEY_SAMPLING_INTERVAL_MS, KEY_WIFI_PASS, KEY_WIFI_SSID},
        sensors::{Quantity, Reading},
        testing::{FakeHardware, FakeLink, HwEvent, MemoryBackend, ScriptedSensor},
        types::ConnectivityState,
    };

    type TestScheduler = Scheduler<FakeLink, FakeHardware, MemoryBackend>;

    const EPOCH_AT_BOOT: i64 = 1_700_000_000;

    fn at(ms: u64) -> TickTime {
        TickTime {
            monotonic_ms: ms,
            epoch_secs: EPOCH_AT_BOOT + (ms / 1_000) as i64,
        }
    }

    fn scheduler(link: FakeLink) -> TestScheduler {
        let store = ConfigStore::open(MemoryBackend::with_entries(&[
            (KEY_WIFI_SSID, "garage"),
            (KEY_WIFI_PASS, "hunter2"),
            (KEY_SAMPLING_INTERVAL_MS, "1000"),
        ]));
        let script = (0..200)
            .map(|i| Ok(Reading::single(Quantity::Temperature, 20.0 + i as f32)))
            .collect();
        let sensors = SensorBank::new().with_driver(ScriptedSensor::new("ds18b20", script));

        Scheduler::new(
            DeviceIdentity::from_hardware_id(0xAB_0000_00CD),
            &TimingConfig::default(),
            link,
            FakeHardware::default(),
            sensors,
            store,
            0,
        )
    }

    fn run(scheduler: &mut TestScheduler, from_ms: u64, to_ms: u64) {
        let mut now = from_ms;
        while now <= to_ms {
            scheduler.tick(at(now));
            now += 100;
        }
    }

    fn link(scheduler: &mut TestScheduler) -> &mut FakeLink {
        scheduler.connectivity_mut().link_mut()
    }

    #[test]
    fn connects_and_announces_with_heartbeat() {
        let mut scheduler = scheduler(FakeLink::healthy());

        run(&mut scheduler, 0, 100);

        assert_eq!(
            scheduler.connectivity().state(),
            ConnectivityState::BrokerSessionActive
        );
        assert_eq!(
            link(&mut scheduler).published_topics(),
            vec!["devices/ESP32-ABCD/heartbeat"]
        );
        assert!(scheduler.hardware().led);
    }

    #[test]
    fn telemetry_published_only_with_active_session() {
        let mut offline = FakeLink::healthy();
        offline.session_ok = false;
        let mut scheduler = scheduler(offline);

        run(&mut scheduler, 0, 3_000);

        assert!(link(&mut scheduler).published.is_empty());
        assert_eq!(scheduler.snapshot().captured_at, EPOCH_AT_BOOT + 3);

        let mut online = self::scheduler(FakeLink::healthy());
        run(&mut online, 0, 3_000);

        let data = link(&mut online).published_on("/data");
        assert_eq!(data.len(), 3);
        assert_eq!(data[0]["deviceId"], "ESP32-ABCD");
        assert_eq!(data[0]["timestamp"], EPOCH_AT_BOOT + 1);
        assert_eq!(data[0]["temperature"], 20.0);
    }

    #[test]
    fn tick_reports_fresh_snapshot_only_when_sampling() {
        let mut scheduler = scheduler(FakeLink::healthy());

        assert_eq!(scheduler.tick(at(500)), None);
        let sampled = scheduler.tick(at(1_000)).unwrap();

        assert_eq!(sampled.captured_at, EPOCH_AT_BOOT + 1);
        assert_eq!(scheduler.snapshot(), &sampled);
        assert_eq!(scheduler.tick(at(1_100)), None);
    }

    #[test]
    fn motion_event_once_per_rising_edge() {
        let mut scheduler = scheduler(FakeLink::healthy());
        run(&mut scheduler, 0, 100);

        scheduler.hardware_mut().motion = true;
        run(&mut scheduler, 200, 600);
        scheduler.hardware_mut().motion = false;
        run(&mut scheduler, 700, 900);
        scheduler.hardware_mut().motion = true;
        run(&mut scheduler, 1_000, 1_100);

        let events = link(&mut scheduler).published_on("/events");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["event"], "motion_detected");
        assert_eq!(events[0]["timestamp"], EPOCH_AT_BOOT);
        assert_eq!(events[1]["timestamp"], EPOCH_AT_BOOT + 1);
    }

    #[test]
    fn unknown_command_gets_exactly_one_response() {
        let mut scheduler = scheduler(FakeLink::healthy());
        run(&mut scheduler, 0, 100);

        link(&mut scheduler).queue_inbound("devices/ESP32-ABCD/commands", br#"{"command":"warp"}"#);
        run(&mut scheduler, 200, 400);

        let responses = link(&mut scheduler).published_on("/response");
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["command"], "warp");
        assert_eq!(responses[0]["status"], "executed");
        assert!(scheduler.hardware().events.is_empty());
    }

    #[test]
    fn buzzer_command_pulses_then_responds() {
        let mut scheduler = scheduler(FakeLink::healthy());
        run(&mut scheduler, 0, 100);

        link(&mut scheduler).queue_inbound(
            "devices/ESP32-ABCD/commands",
            br#"{"command":"buzzer","duration":200}"#,
        );
        scheduler.tick(at(200));

        assert_eq!(
            scheduler.hardware().events,
            vec![HwEvent::Buzzer(true), HwEvent::Delay(200), HwEvent::Buzzer(false)]
        );
        assert_eq!(link(&mut scheduler).published_on("/response").len(), 1);
    }

    #[test]
    fn inbound_drain_is_bounded_per_tick() {
        let mut scheduler = scheduler(FakeLink::healthy());
        run(&mut scheduler, 0, 100);

        for _ in 0..10 {
            link(&mut scheduler).queue_inbound("devices/ESP32-ABCD/commands", br#"{"command":"ping"}"#);
        }
        scheduler.tick(at(200));
        assert_eq!(link(&mut scheduler).published_on("/response").len(), 8);

        scheduler.tick(at(300));
        assert_eq!(link(&mut scheduler).published_on("/response").len(), 10);
    }

    #[test]
    fn restart_takes_effect_after_the_tick() {
        let mut scheduler = scheduler(FakeLink::healthy());
        run(&mut scheduler, 0, 100);

        link(&mut scheduler).queue_inbound("devices/ESP32-ABCD/commands", br#"{"command":"restart"}"#);
        scheduler.tick(at(200));

        assert_eq!(scheduler.hardware().restarts(), 1);
        assert_eq!(link(&mut scheduler).published_on("/response").len(), 1);

        scheduler.tick(at(300));
        assert_eq!(scheduler.hardware().restarts(), 1);
    }

    #[test]
    fn held_button_enters_access_point_once() {
        let mut scheduler = scheduler(FakeLink::healthy());
        run(&mut scheduler, 0, 900);

        scheduler.hardware_mut().button = true;
        run(&mut scheduler, 1_000, 5_900);
        assert_eq!(
            scheduler.connectivity().state(),
            ConnectivityState::BrokerSessionActive
        );

        run(&mut scheduler, 6_000, 6_200);
        assert_eq!(
            scheduler.connectivity().state(),
            ConnectivityState::ConfigAccessPointActive
        );
        assert_eq!(link(&mut scheduler).access_point_starts, 1);

        run(&mut scheduler, 6_300, 16_200);
        assert_eq!(link(&mut scheduler).access_point_starts, 1);
        assert_eq!(
            link(&mut scheduler).access_point.as_deref(),
            Some("IoT-Setup-ESP32-ABCD")
        );
    }

    #[test]
    fn broker_drop_reconnects_with_heartbeat_before_telemetry() {
        let mut scheduler = scheduler(FakeLink::healthy());
        run(&mut scheduler, 0, 1_800);

        link(&mut scheduler).session_up = false;
        scheduler.tick(at(1_900));
        assert_eq!(
            scheduler.connectivity().state(),
            ConnectivityState::BrokerConnecting
        );

        let before = link(&mut scheduler).published.len();
        scheduler.tick(at(2_000));

        let fake = link(&mut scheduler);
        assert_eq!(
            fake.published_topics()[before..].to_vec(),
            vec!["devices/ESP32-ABCD/heartbeat", "devices/ESP32-ABCD/data"]
        );
        assert_eq!(
            fake.subscriptions,
            vec![
                "devices/ESP32-ABCD/commands".to_string(),
                "devices/ESP32-ABCD/config".to_string(),
                "devices/ESP32-ABCD/commands".to_string(),
                "devices/ESP32-ABCD/config".to_string(),
            ]
        );
    }

    #[test]
    fn config_update_retimes_sampling() {
        let mut scheduler = scheduler(FakeLink::healthy());
        run(&mut scheduler, 0, 1_000);

        link(&mut scheduler).queue_inbound(
            "devices/ESP32-ABCD/config",
            br#"{"samplingIntervalMs":5000}"#,
        );
        run(&mut scheduler, 1_100, 5_900);
        assert_eq!(link(&mut scheduler).published_on("/data").len(), 1);

        run(&mut scheduler, 6_000, 6_000);
        assert_eq!(link(&mut scheduler).published_on("/data").len(), 2);
        assert_eq!(scheduler.context().timers.sampling.period_ms(), 5_000);
        assert_eq!(scheduler.context().store.settings().wifi_ssid, "garage");
    }

    #[test]
    fn local_relay_and_restart_requests() {
        let mut scheduler = scheduler(FakeLink::healthy());

        scheduler.handle_local(LocalRequest::Relay(true));
        scheduler.handle_local(LocalRequest::Restart);
        assert_eq!(scheduler.hardware().restarts(), 0);
        scheduler.tick(at(0));

        assert_eq!(
            scheduler.hardware().events,
            vec![HwEvent::Relay(true), HwEvent::Restart]
        );
    }

    #[test]
    fn local_config_provisions_credentials_from_access_point_mode() {
        let mut link = FakeLink::healthy();
        link.require_credentials = true;
        let mut scheduler = Scheduler::new(
            DeviceIdentity::from_hardware_id(0xAB_0000_00CD),
            &TimingConfig::default(),
            link,
            FakeHardware::default(),
            SensorBank::new(),
            ConfigStore::open(MemoryBackend::default()),
            0,
        );
        scheduler.tick(at(0));
        assert_eq!(
            scheduler.connectivity().state(),
            ConnectivityState::ConfigAccessPointActive
        );

        scheduler.handle_local(LocalRequest::Configure(ConfigUpdate {
            network_ssid: Some("attic".to_string()),
            network_password: Some("hunter2".to_string()),
            sampling_interval_ms: Some(5_000),
        }));
        scheduler.tick(at(100));

        let context = scheduler.context();
        assert_eq!(context.store.settings().wifi_ssid, "attic");
        assert_eq!(context.store.backend().get(KEY_WIFI_SSID), Some("attic"));
        assert_eq!(context.store.backend().get(KEY_WIFI_PASS), Some("hunter2"));
        assert_eq!(context.timers.sampling.period_ms(), 5_000);
        assert_eq!(
            scheduler.connectivity().state(),
            ConnectivityState::ConfigAccessPointActive
        );
        assert_eq!(scheduler.hardware().restarts(), 0);

        scheduler.handle_local(LocalRequest::Restart);
        scheduler.tick(at(200));
        assert_eq!(scheduler.hardware().restarts(), 1);
    }

    #[test]
    fn heartbeat_fires_once_per_period() {
        let mut scheduler = scheduler(FakeLink::healthy());

        run(&mut scheduler, 0, 60_000);
        assert_eq!(link(&mut scheduler).published_on("/heartbeat").len(), 1);

        scheduler.tick(at(60_100));
        assert_eq!(link(&mut scheduler).published_on("/heartbeat").len(), 2);

        run(&mut scheduler, 60_200, 120_000);
        assert_eq!(link(&mut scheduler).published_on("/heartbeat").len(), 2);

        scheduler.tick(at(120_100));
        let heartbeats = link(&mut scheduler).published_on("/heartbeat");
        assert_eq!(heartbeats.len(), 3);
        assert_eq!(heartbeats[2]["uptime"], 120_100);
    }

    #[test]
    fn reconnect_heartbeat_restarts_the_period() {
        let mut scheduler = scheduler(FakeLink::healthy());
        run(&mut scheduler, 0, 29_900);

        link(&mut scheduler).session_up = false;
        run(&mut scheduler, 30_000, 30_100);
        assert_eq!(link(&mut scheduler).published_on("/heartbeat").len(), 2);

        run(&mut scheduler, 30_200, 90_000);
        assert_eq!(link(&mut scheduler).published_on("/heartbeat").len(), 2);

        scheduler.tick(at(90_100));
        assert_eq!(link(&mut scheduler).published_on("/heartbeat").len(), 3);
    }

    #[test]
    fn hold_detector_latches_until_release() {
        let mut hold = HoldDetector::new(5_000);

        assert!(!hold.update(true, 0));
        assert!(!hold.update(true, 4_999));
        assert!(hold.update(true, 5_000));
        assert!(!hold.update(true, 15_000));
        assert!(!hold.update(false, 15_100));
        assert!(!hold.update(true, 16_000));
        assert!(hold.update(true, 21_000));
    }

    #[test]
    fn interval_timer_starts_fired_at_boot() {
        let mut timer = IntervalTimer::new(30_000, 500);

        assert!(!timer.due(500));
        assert!(!timer.due(30_499));
        assert!(timer.due(30_500));

        timer.reset(30_500);
        timer.set_period(1_000);
        assert!(timer.due(31_500));
    }
}

use std::sync::mpsc;
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::gpio::{PinDriver, Pull};
use esp_idf_svc::hal::peripherals::Peripherals;
use esp_idf_svc::log::EspLogger;
use esp_idf_svc::mqtt::client::{
    Details, EspMqttClient, EspMqttConnection, EventPayload, LwtConfiguration,
    MqttClientConfiguration, QoS,
};
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs};
use esp_idf_svc::wifi::{AuthMethod, ClientConfiguration, Configuration, EspWifi};
use log::{info, warn};

use badge_common::discovery::{AVAILABILITY_OFFLINE, AVAILABILITY_ONLINE};
use badge_common::session::MQTT_KEEP_ALIVE_SECS;
use badge_common::topics::unique_id;
use badge_common::{
    BridgeConfig, ChangeOrigin, DeviceState, LedRenderer, LightAttributes, LightDiscovery,
    MqttSession, SessionAction, SessionEvent, StateArbiter, StateDelta, TopicSet, WifiDriver,
    WifiDriverError, WifiManager,
};

const TICK_MS: u64 = 250;
const EVENTS_PER_TICK: usize = 16;
const MAX_COMMAND_PAYLOAD_BYTES: usize = 512;
const WATCHDOG_TIMEOUT_SEC: u32 = 60;

const NVS_NAMESPACE: &str = "badge";
const NVS_STATE_KEY: &str = "light_state";
const NVS_CONFIG_KEY: &str = "ha_config";
const NVS_BUFFER_BYTES: usize = 4096;

// Quiescence window for coalescing rapid mutations into one flash write.
const SAVE_QUIESCENCE_MS: u64 = 400;
const SAVE_RETRY_MS: u64 = 2_000;

struct LogRenderer;

impl LedRenderer for LogRenderer {
    // The strip driver attaches here; until then frames go to the log.
    fn render(&mut self, state: &DeviceState) {
        info!(
            "led frame: power={} brightness={} hue={} saturation={} effect={}",
            state.power,
            state.brightness,
            state.hue,
            state.saturation,
            state.effect.as_str()
        );
    }
}

struct NvsStore {
    partition: EspDefaultNvsPartition,
    save_deadline_ms: Option<u64>,
}

impl NvsStore {
    fn new(partition: EspDefaultNvsPartition) -> Self {
        Self {
            partition,
            save_deadline_ms: None,
        }
    }

    fn load_state(&self) -> DeviceState {
        let raw = match self.read_raw(NVS_STATE_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                info!("no persisted light state, using defaults");
                return DeviceState::default();
            }
            Err(err) => {
                warn!("persisted light state unreadable, using defaults: {err:#}");
                return DeviceState::default();
            }
        };

        match serde_json::from_str::<DeviceState>(&raw) {
            Ok(mut state) => {
                state.sanitize();
                state
            }
            Err(err) => {
                warn!("persisted light state is corrupt, using defaults: {err}");
                DeviceState::default()
            }
        }
    }

    fn save_state(&self, state: &DeviceState) -> anyhow::Result<()> {
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(state)?;
        // NVS commits a blob atomically; a power loss keeps the old entry.
        nvs.set_str(NVS_STATE_KEY, &payload)?;
        Ok(())
    }

    fn load_config(&self) -> Option<BridgeConfig> {
        match self.read_raw(NVS_CONFIG_KEY) {
            Ok(Some(raw)) => match BridgeConfig::parse(&raw) {
                Ok(config) => Some(config),
                Err(err) => {
                    warn!("bridge configuration rejected ({err}); bridge disabled");
                    None
                }
            },
            Ok(None) => {
                info!("no bridge configuration stored; bridge disabled");
                None
            }
            Err(err) => {
                warn!("bridge configuration unreadable ({err:#}); bridge disabled");
                None
            }
        }
    }

    fn read_raw(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; NVS_BUFFER_BYTES];
        Ok(nvs.get_str(key, &mut buffer)?.map(str::to_string))
    }

    fn queue_save(&mut self, now_ms: u64) {
        self.save_deadline_ms = Some(now_ms.saturating_add(SAVE_QUIESCENCE_MS));
    }

    fn flush_pending(&mut self, state: &DeviceState, now_ms: u64) {
        let due = matches!(self.save_deadline_ms, Some(at) if now_ms >= at);
        if !due {
            return;
        }
        self.save_deadline_ms = None;

        if let Err(err) = self.save_state(state) {
            warn!("failed to persist light state, will retry: {err:#}");
            self.save_deadline_ms = Some(now_ms.saturating_add(SAVE_RETRY_MS));
        }
    }

    fn has_pending(&self) -> bool {
        self.save_deadline_ms.is_some()
    }
}

struct EspWifiDriver {
    wifi: EspWifi<'static>,
}

impl WifiDriver for EspWifiDriver {
    fn link_up(&mut self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }

    fn begin_connect(&mut self, ssid: &str, password: &str) -> Result<(), WifiDriverError> {
        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        let configuration = Configuration::Client(ClientConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| WifiDriverError("wifi ssid too long".to_string()))?,
            password: password
                .try_into()
                .map_err(|_| WifiDriverError("wifi password too long".to_string()))?,
            auth_method,
            ..Default::default()
        });

        self.wifi
            .set_configuration(&configuration)
            .map_err(|err| WifiDriverError(err.to_string()))?;
        if !self.wifi.is_started().unwrap_or(false) {
            self.wifi
                .start()
                .map_err(|err| WifiDriverError(err.to_string()))?;
        }
        self.wifi
            .connect()
            .map_err(|err| WifiDriverError(err.to_string()))?;
        Ok(())
    }

    fn abandon(&mut self) {
        let _ = self.wifi.disconnect();
    }
}

enum TransportEvent {
    ConnAck,
    SubAck,
    Message { topic: String, payload: Vec<u8> },
    ConnectionLost,
}

struct MqttTransport {
    client: EspMqttClient<'static>,
    events: mpsc::Receiver<TransportEvent>,
}

impl MqttTransport {
    fn execute(
        &mut self,
        action: SessionAction,
        topics: &TopicSet,
        discovery: &LightDiscovery,
        snapshot: DeviceState,
    ) {
        let result = match action {
            // Connect is handled by transport creation.
            SessionAction::Connect => Ok(()),
            SessionAction::Subscribe => self
                .client
                .subscribe(&topics.command, QoS::AtMostOnce)
                .map(|_| ()),
            SessionAction::PublishOnline => self
                .client
                .enqueue(
                    &topics.availability,
                    QoS::AtLeastOnce,
                    true,
                    AVAILABILITY_ONLINE.as_bytes(),
                )
                .map(|_| ()),
            SessionAction::PublishDiscovery => match discovery.to_payload() {
                Ok(payload) => self
                    .client
                    .enqueue(&topics.discovery, QoS::AtLeastOnce, true, &payload)
                    .map(|_| ()),
                Err(err) => {
                    warn!("discovery serialization failed: {err}");
                    Ok(())
                }
            },
            SessionAction::PublishState => match serde_json::to_vec(&snapshot) {
                Ok(payload) => self
                    .client
                    .enqueue(&topics.state, QoS::AtLeastOnce, true, &payload)
                    .map(|_| ()),
                Err(err) => {
                    warn!("state serialization failed: {err}");
                    Ok(())
                }
            },
            SessionAction::PublishAttributes => {
                let attributes = LightAttributes {
                    effect_index: snapshot.effect.index(),
                };
                match serde_json::to_vec(&attributes) {
                    Ok(payload) => self
                        .client
                        .enqueue(&topics.attributes, QoS::AtLeastOnce, true, &payload)
                        .map(|_| ()),
                    Err(err) => {
                        warn!("attributes serialization failed: {err}");
                        Ok(())
                    }
                }
            }
        };

        if let Err(err) = result {
            warn!("mqtt request failed: {err:?}");
        }
    }
}

struct EspNetBridge {
    config: BridgeConfig,
    topics: TopicSet,
    discovery: LightDiscovery,
    badge_id: String,
    wifi: WifiManager,
    link: EspWifiDriver,
    session: MqttSession,
    transport: Option<MqttTransport>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let mut store = NvsStore::new(nvs_partition.clone());

    let mut arbiter = StateArbiter::new(store.load_state());
    let mut renderer = LogRenderer;
    renderer.render(&arbiter.snapshot());

    let badge_id = badge_id();
    info!("badge id `{badge_id}`");

    let peripherals = Peripherals::take()?;
    let mut button = PinDriver::input(peripherals.pins.gpio0)?;
    button.set_pull(Pull::Up)?;
    let mut button_was_low = false;

    let mut net = match store.load_config() {
        Some(config) => {
            let (ssid, password) = config.wifi_credentials();
            info!(
                "bridge enabled: broker {}:{}, wifi `{}`",
                config.mqtt.broker, config.mqtt.port, ssid
            );

            let wifi = EspWifi::new(peripherals.modem, sys_loop.clone(), Some(nvs_partition))
                .context("failed to initialize wifi radio")?;
            let topics = TopicSet::new(&config.mqtt.discovery_prefix, &badge_id);
            let discovery = LightDiscovery::build(&config.mqtt.device_name, &badge_id, &topics);
            let wifi_manager = WifiManager::new(ssid, password);

            Some(EspNetBridge {
                config,
                topics,
                discovery,
                badge_id: badge_id.clone(),
                wifi: wifi_manager,
                link: EspWifiDriver { wifi },
                session: MqttSession::new(),
                transport: None,
            })
        }
        None => None,
    };

    // Menu/UI tasks submit local changes through this channel; the boot
    // button below is the only producer wired up in the bridge itself.
    let (local_tx, local_rx) = mpsc::channel::<StateDelta>();
    let _menu_input = local_tx;

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    loop {
        feed_watchdog();
        let now_ms = monotonic_ms();

        if let Some(net) = net.as_mut() {
            net_tick(net, &mut arbiter, &mut store, &mut renderer, now_ms);
        }

        store.flush_pending(&arbiter.snapshot(), now_ms);

        let pressed = button.is_low();
        if pressed && !button_was_low {
            let delta = StateDelta {
                power: Some(!arbiter.snapshot().power),
                ..StateDelta::default()
            };
            apply_local(&mut arbiter, net.as_mut(), &mut store, &mut renderer, delta, now_ms);
        }
        button_was_low = pressed;

        for delta in local_rx.try_iter().take(EVENTS_PER_TICK) {
            apply_local(&mut arbiter, net.as_mut(), &mut store, &mut renderer, delta, now_ms);
        }

        thread::sleep(Duration::from_millis(TICK_MS));
    }
}

fn apply_local(
    arbiter: &mut StateArbiter,
    net: Option<&mut EspNetBridge>,
    store: &mut NvsStore,
    renderer: &mut impl LedRenderer,
    delta: StateDelta,
    now_ms: u64,
) {
    let outcome = arbiter.apply(delta, ChangeOrigin::Local);
    if !outcome.changed {
        return;
    }

    // The local input path owns its own rendering.
    renderer.render(&outcome.state);
    if outcome.publish_state {
        if let Some(net) = net {
            net.session.mark_state_dirty();
        }
    }
    if outcome.persist {
        store.queue_save(now_ms);
    }
}

fn net_tick(
    net: &mut EspNetBridge,
    arbiter: &mut StateArbiter,
    store: &mut NvsStore,
    renderer: &mut impl LedRenderer,
    now_ms: u64,
) {
    let wifi_status = net.wifi.poll(&mut net.link, now_ms);

    let actions = net.session.poll(wifi_status, now_ms);
    execute_actions(net, actions, arbiter.snapshot(), now_ms);

    let mut events = Vec::new();
    if let Some(transport) = net.transport.as_ref() {
        events.extend(transport.events.try_iter().take(EVENTS_PER_TICK));
    }

    for event in events {
        match event {
            TransportEvent::ConnAck => {
                info!("mqtt session connected");
                let actions = net.session.handle_event(SessionEvent::ConnAck, now_ms);
                execute_actions(net, actions, arbiter.snapshot(), now_ms);
            }
            TransportEvent::SubAck => {
                info!("mqtt session subscribed");
                let actions = net.session.handle_event(SessionEvent::SubAck, now_ms);
                execute_actions(net, actions, arbiter.snapshot(), now_ms);
            }
            TransportEvent::ConnectionLost => {
                let _ = net.session.handle_event(SessionEvent::ConnectionLost, now_ms);
            }
            TransportEvent::Message { topic, payload } => {
                if topic != net.topics.command {
                    continue;
                }
                if payload.len() > MAX_COMMAND_PAYLOAD_BYTES {
                    warn!("dropping oversized command payload ({} bytes)", payload.len());
                    continue;
                }

                match StateDelta::parse(&payload) {
                    Ok(delta) => {
                        let outcome = arbiter.apply(delta, ChangeOrigin::Remote);
                        if outcome.render {
                            renderer.render(&outcome.state);
                        }
                        if outcome.persist {
                            store.queue_save(now_ms);
                        }
                    }
                    Err(err) => warn!("dropping command: {err}"),
                }
            }
        }
    }
}

fn execute_actions(
    net: &mut EspNetBridge,
    actions: Vec<SessionAction>,
    snapshot: DeviceState,
    now_ms: u64,
) {
    for action in actions {
        if action == SessionAction::Connect {
            if net.transport.is_none() {
                match create_transport(&net.config, &net.topics, &net.badge_id) {
                    Ok(transport) => net.transport = Some(transport),
                    Err(err) => {
                        warn!("mqtt client start failed: {err:#}");
                        let _ = net.session.handle_event(SessionEvent::ConnectionLost, now_ms);
                    }
                }
            }
            continue;
        }

        if let Some(transport) = net.transport.as_mut() {
            transport.execute(action, &net.topics, &net.discovery, snapshot);
        }
    }
}

fn create_transport(
    config: &BridgeConfig,
    topics: &TopicSet,
    badge_id: &str,
) -> anyhow::Result<MqttTransport> {
    let url = format!("mqtt://{}:{}", config.mqtt.broker, config.mqtt.port);
    let client_id = unique_id(badge_id);

    let conf = MqttClientConfiguration {
        client_id: Some(&client_id),
        username: config.mqtt.username.as_deref(),
        password: config.mqtt.password.as_deref(),
        keep_alive_interval: Some(Duration::from_secs(MQTT_KEEP_ALIVE_SECS)),
        lwt: Some(LwtConfiguration {
            topic: &topics.availability,
            payload: AVAILABILITY_OFFLINE.as_bytes(),
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
        ..Default::default()
    };

    let (client, connection) = EspMqttClient::new(&url, &conf)?;
    let (tx, rx) = mpsc::channel();
    spawn_mqtt_receiver(connection, tx);

    Ok(MqttTransport { client, events: rx })
}

fn spawn_mqtt_receiver(mut connection: EspMqttConnection, tx: mpsc::Sender<TransportEvent>) {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            match connection.next() {
                Ok(event) => {
                    let mapped = match event.payload() {
                        EventPayload::Connected(_) => Some(TransportEvent::ConnAck),
                        EventPayload::Subscribed(_) => Some(TransportEvent::SubAck),
                        EventPayload::Disconnected => Some(TransportEvent::ConnectionLost),
                        EventPayload::Received {
                            topic: Some(topic),
                            data,
                            details,
                            ..
                        } => {
                            // Only full payloads are forwarded.
                            if matches!(details, Details::Complete) {
                                Some(TransportEvent::Message {
                                    topic: topic.to_string(),
                                    payload: data.to_vec(),
                                })
                            } else {
                                None
                            }
                        }
                        _ => None,
                    };

                    if let Some(event) = mapped {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                }
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    let _ = tx.send(TransportEvent::ConnectionLost);
                    thread::sleep(Duration::from_secs(2));
                }
            }
        })
        .expect("failed to spawn mqtt receiver thread");
}

fn badge_id() -> String {
    let mut mac = [0_u8; 6];
    let rc = unsafe { esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr()) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to read efuse mac ({rc}); using fallback id");
        return "badge".to_string();
    }
    mac.iter().map(|byte| format!("{byte:02x}")).collect()
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
    unsafe {
        esp_idf_svc::sys::esp_task_wdt_reset();
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

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, QoS};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use badge_common::config::ConfigError;
use badge_common::discovery::{AVAILABILITY_OFFLINE, AVAILABILITY_ONLINE};
use badge_common::session::MQTT_KEEP_ALIVE_SECS;
use badge_common::topics::unique_id;
use badge_common::{
    BridgeConfig, ChangeOrigin, DeviceState, LedEffect, LedRenderer, LightAttributes,
    LightDiscovery, MqttSession, SessionAction, SessionEvent, StateArbiter, StateDelta, TopicSet,
    WifiDriver, WifiDriverError, WifiManager,
};

use crate::persist::StateStore;

const TICK_MS: u64 = 250;
const MQTT_POLL_BUDGET_MS: u64 = 50;
const MQTT_CHANNEL_CAPACITY: usize = 64;
const LOCAL_CHANGES_PER_TICK: usize = 8;
const MAX_COMMAND_PAYLOAD_BYTES: usize = 512;

// The development build rides the host OS network stack, which plays the
// role of a link some other workflow already brought up: the manager adopts
// it instead of associating itself.
struct HostLinkDriver;

impl WifiDriver for HostLinkDriver {
    fn link_up(&mut self) -> bool {
        true
    }

    fn begin_connect(&mut self, _ssid: &str, _password: &str) -> Result<(), WifiDriverError> {
        Ok(())
    }

    fn abandon(&mut self) {}
}

struct LogRenderer;

impl LedRenderer for LogRenderer {
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

enum TransportEvent {
    ConnAck,
    SubAck,
    Message { topic: String, payload: Vec<u8> },
    ConnectionLost,
}

struct MqttTransport {
    client: AsyncClient,
    eventloop: EventLoop,
    topics: TopicSet,
    discovery: LightDiscovery,
    active: bool,
}

impl MqttTransport {
    fn new(config: &BridgeConfig, badge_id: &str) -> Self {
        let topics = TopicSet::new(&config.mqtt.discovery_prefix, badge_id);
        let discovery = LightDiscovery::build(&config.mqtt.device_name, badge_id, &topics);

        let mut options = MqttOptions::new(
            unique_id(badge_id),
            config.mqtt.broker.clone(),
            config.mqtt.port,
        );
        options.set_keep_alive(Duration::from_secs(MQTT_KEEP_ALIVE_SECS));
        options.set_last_will(LastWill::new(
            topics.availability.clone(),
            AVAILABILITY_OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));
        if let Some(username) = &config.mqtt.username {
            options.set_credentials(
                username.clone(),
                config.mqtt.password.clone().unwrap_or_default(),
            );
        }

        let (client, eventloop) = AsyncClient::new(options, MQTT_CHANNEL_CAPACITY);

        Self {
            client,
            eventloop,
            topics,
            discovery,
            active: false,
        }
    }

    async fn execute_all(&mut self, actions: Vec<SessionAction>, snapshot: DeviceState) {
        for action in actions {
            self.execute(action, snapshot).await;
        }
    }

    async fn execute(&mut self, action: SessionAction, snapshot: DeviceState) {
        let result = match action {
            SessionAction::Connect => {
                self.active = true;
                debug!("mqtt dialing broker");
                Ok(())
            }
            SessionAction::Subscribe => {
                self.client
                    .subscribe(self.topics.command.clone(), QoS::AtMostOnce)
                    .await
            }
            SessionAction::PublishOnline => {
                self.client
                    .publish(
                        self.topics.availability.clone(),
                        QoS::AtLeastOnce,
                        true,
                        AVAILABILITY_ONLINE,
                    )
                    .await
            }
            SessionAction::PublishDiscovery => match self.discovery.to_payload() {
                Ok(payload) => {
                    self.client
                        .publish(self.topics.discovery.clone(), QoS::AtLeastOnce, true, payload)
                        .await
                }
                Err(err) => {
                    warn!("discovery serialization failed: {err}");
                    Ok(())
                }
            },
            SessionAction::PublishState => match serde_json::to_vec(&snapshot) {
                Ok(payload) => {
                    self.client
                        .publish(self.topics.state.clone(), QoS::AtLeastOnce, true, payload)
                        .await
                }
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
                    Ok(payload) => {
                        self.client
                            .publish(
                                self.topics.attributes.clone(),
                                QoS::AtLeastOnce,
                                true,
                                payload,
                            )
                            .await
                    }
                    Err(err) => {
                        warn!("attributes serialization failed: {err}");
                        Ok(())
                    }
                }
            }
        };

        if let Err(err) = result {
            warn!("mqtt request failed: {err}");
        }
    }

    // Socket reads are time-boxed so a stalled broker cannot hold up the
    // scheduler tick.
    async fn poll_events(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        if !self.active {
            return events;
        }

        let deadline = Instant::now() + Duration::from_millis(MQTT_POLL_BUDGET_MS);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, self.eventloop.poll()).await {
                Err(_) => break,
                Ok(Ok(Event::Incoming(Incoming::ConnAck(_)))) => {
                    events.push(TransportEvent::ConnAck);
                }
                Ok(Ok(Event::Incoming(Incoming::SubAck(_)))) => {
                    events.push(TransportEvent::SubAck);
                }
                Ok(Ok(Event::Incoming(Incoming::Publish(publish)))) => {
                    events.push(TransportEvent::Message {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    });
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    warn!("mqtt connection error: {err}");
                    self.active = false;
                    events.push(TransportEvent::ConnectionLost);
                    break;
                }
            }
        }

        events
    }

    async fn shutdown(&mut self) {
        if !self.active {
            return;
        }
        // Best effort; the last-will covers the ungraceful case.
        let _ = self
            .client
            .publish(
                self.topics.availability.clone(),
                QoS::AtLeastOnce,
                true,
                AVAILABILITY_OFFLINE,
            )
            .await;
        let _ = tokio::time::timeout(Duration::from_millis(250), self.eventloop.poll()).await;
        let _ = self.client.disconnect().await;
    }
}

struct NetBridge {
    wifi: WifiManager,
    link: HostLinkDriver,
    session: MqttSession,
    transport: MqttTransport,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("BADGE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.badge"));
    let badge_id = resolve_badge_id();

    let mut store = StateStore::new(data_dir.join("light_state.json"));
    let mut arbiter = StateArbiter::new(store.load());
    let mut renderer = LogRenderer;
    renderer.render(&arbiter.snapshot());

    let config_path = data_dir.join("homeassistant.json");
    let mut net = match BridgeConfig::from_file(&config_path) {
        Ok(mut config) => {
            apply_env_overrides(&mut config);
            let (ssid, password) = config.wifi_credentials();
            info!(
                "bridge enabled: badge `{}`, broker {}:{}, wifi `{}`",
                badge_id, config.mqtt.broker, config.mqtt.port, ssid
            );
            Some(NetBridge {
                wifi: WifiManager::new(ssid, password),
                link: HostLinkDriver,
                session: MqttSession::new(),
                transport: MqttTransport::new(&config, &badge_id),
            })
        }
        Err(ConfigError::Io(err)) if err.kind() == ErrorKind::NotFound => {
            info!(
                "no bridge configuration at {}; home-automation bridge disabled",
                config_path.display()
            );
            None
        }
        Err(err) => {
            warn!("bridge configuration rejected ({err}); home-automation bridge disabled");
            None
        }
    };

    let (local_tx, mut local_rx) = mpsc::channel::<StateDelta>(32);
    spawn_button_reader(local_tx);

    let mut ticker = tokio::time::interval(Duration::from_millis(TICK_MS));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                if store.has_pending() {
                    let _ = store.save(&arbiter.snapshot());
                }
                if let Some(net) = net.as_mut() {
                    net.transport.shutdown().await;
                }
                return Ok(());
            }
        }

        let now_ms = monotonic_ms();

        if let Some(net) = net.as_mut() {
            net_tick(net, &mut arbiter, &mut store, &mut renderer, now_ms).await;
        }

        store.flush_pending(&arbiter.snapshot(), now_ms);

        let mut handled = 0;
        while handled < LOCAL_CHANGES_PER_TICK {
            let delta = match local_rx.try_recv() {
                Ok(delta) => delta,
                Err(_) => break,
            };
            handled += 1;

            let outcome = arbiter.apply(delta, ChangeOrigin::Local);
            if outcome.publish_state {
                if let Some(net) = net.as_mut() {
                    net.session.mark_state_dirty();
                }
            }
            if outcome.persist {
                store.queue_save(now_ms);
            }
        }
    }
}

async fn net_tick(
    net: &mut NetBridge,
    arbiter: &mut StateArbiter,
    store: &mut StateStore,
    renderer: &mut impl LedRenderer,
    now_ms: u64,
) {
    let wifi_status = net.wifi.poll(&mut net.link, now_ms);

    let actions = net.session.poll(wifi_status, now_ms);
    net.transport.execute_all(actions, arbiter.snapshot()).await;

    for event in net.transport.poll_events().await {
        match event {
            TransportEvent::ConnAck => {
                info!("mqtt session connected");
                let actions = net.session.handle_event(SessionEvent::ConnAck, now_ms);
                net.transport.execute_all(actions, arbiter.snapshot()).await;
            }
            TransportEvent::SubAck => {
                info!("mqtt session subscribed");
                let actions = net.session.handle_event(SessionEvent::SubAck, now_ms);
                net.transport.execute_all(actions, arbiter.snapshot()).await;
            }
            TransportEvent::ConnectionLost => {
                let _ = net.session.handle_event(SessionEvent::ConnectionLost, now_ms);
            }
            TransportEvent::Message { topic, payload } => {
                if topic != net.transport.topics.command {
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

fn resolve_badge_id() -> String {
    match std::env::var("BADGE_ID") {
        Ok(id) if !id.trim().is_empty() => id,
        _ => "hostdev".to_string(),
    }
}

fn apply_env_overrides(config: &mut BridgeConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        config.mqtt.broker = host;
    }
    if let Ok(port) = std::env::var("MQTT_PORT") {
        if let Ok(port) = port.parse::<u16>() {
            config.mqtt.port = port;
        }
    }
    if let Ok(username) = std::env::var("MQTT_USER") {
        config.mqtt.username = Some(username);
    }
    if let Ok(password) = std::env::var("MQTT_PASS") {
        config.mqtt.password = Some(password);
    }
}

// Stands in for the badge buttons on a development machine: one command per
// line on stdin, e.g. `on`, `brightness 128`, `effect Rainbow`.
fn spawn_button_reader(tx: mpsc::Sender<StateDelta>) {
    tokio::spawn(async move {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();

        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_button_line(line) {
                Some(delta) => {
                    if tx.send(delta).await.is_err() {
                        break;
                    }
                }
                None => warn!("unrecognized input: `{line}`"),
            }
        }
    });
}

fn parse_button_line(line: &str) -> Option<StateDelta> {
    let mut parts = line.split_whitespace();
    let delta = match parts.next()? {
        "on" => StateDelta {
            power: Some(true),
            ..StateDelta::default()
        },
        "off" => StateDelta {
            power: Some(false),
            ..StateDelta::default()
        },
        "brightness" => StateDelta {
            brightness: Some(parts.next()?.parse().ok()?),
            ..StateDelta::default()
        },
        "hue" => StateDelta {
            hue: Some(parts.next()?.parse().ok()?),
            ..StateDelta::default()
        },
        "saturation" => StateDelta {
            saturation: Some(parts.next()?.parse().ok()?),
            ..StateDelta::default()
        },
        "effect" => StateDelta {
            effect: Some(LedEffect::from_name(parts.next()?)?),
            ..StateDelta::default()
        },
        _ => return None,
    };
    Some(delta)
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

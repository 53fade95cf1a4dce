use crate::backoff::Backoff;
use crate::types::{MqttStatus, WifiStatus};

pub const MQTT_BACKOFF_BASE_MS: u64 = 2_000;
pub const MQTT_BACKOFF_MAX_MS: u64 = 60_000;
pub const MQTT_KEEP_ALIVE_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    ConnAck,
    SubAck,
    ConnectionLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    Connect,
    Subscribe,
    PublishOnline,
    PublishDiscovery,
    PublishState,
    PublishAttributes,
}

// Decides what the transport should do next; owns no sockets itself. The
// transport feeds connection events back in and executes the emitted actions.
#[derive(Debug)]
pub struct MqttSession {
    status: MqttStatus,
    backoff: Backoff,
    retry_at_ms: Option<u64>,
    state_dirty: bool,
    discovery_dirty: bool,
}

impl Default for MqttSession {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttSession {
    pub fn new() -> Self {
        Self {
            status: MqttStatus::Disconnected,
            backoff: Backoff::new(MQTT_BACKOFF_BASE_MS, MQTT_BACKOFF_MAX_MS),
            retry_at_ms: None,
            state_dirty: false,
            // First connect of the boot announces the entity.
            discovery_dirty: true,
        }
    }

    pub fn status(&self) -> MqttStatus {
        self.status
    }

    pub fn mark_state_dirty(&mut self) {
        self.state_dirty = true;
    }

    pub fn mark_discovery_dirty(&mut self) {
        self.discovery_dirty = true;
    }

    pub fn handle_event(&mut self, event: SessionEvent, now_ms: u64) -> Vec<SessionAction> {
        match event {
            SessionEvent::ConnAck => {
                self.status = MqttStatus::Connected;
                self.backoff.reset();
                self.retry_at_ms = None;
                // Reconcile whatever the broker missed while we were away.
                self.state_dirty = true;

                let mut actions = vec![SessionAction::PublishOnline];
                if self.discovery_dirty {
                    self.discovery_dirty = false;
                    actions.push(SessionAction::PublishDiscovery);
                }
                actions.push(SessionAction::Subscribe);
                actions
            }
            SessionEvent::SubAck => {
                if self.status == MqttStatus::Connected {
                    self.status = MqttStatus::Subscribed;
                }
                Vec::new()
            }
            SessionEvent::ConnectionLost => {
                if self.status != MqttStatus::Disconnected {
                    self.status = MqttStatus::Disconnected;
                    self.retry_at_ms =
                        Some(now_ms.saturating_add(self.backoff.next_delay_ms()));
                }
                Vec::new()
            }
        }
    }

    // Non-blocking, called once per scheduler tick. The session only runs on
    // top of a connected link; a wifi drop abandons any attempt in flight.
    pub fn poll(&mut self, wifi: WifiStatus, now_ms: u64) -> Vec<SessionAction> {
        if wifi != WifiStatus::Connected {
            if self.status != MqttStatus::Disconnected {
                self.status = MqttStatus::Disconnected;
                self.retry_at_ms = None;
            }
            return Vec::new();
        }

        match self.status {
            MqttStatus::Disconnected => {
                if self.retry_at_ms.is_none_or(|at| now_ms >= at) {
                    self.status = MqttStatus::Connecting;
                    vec![SessionAction::Connect]
                } else {
                    Vec::new()
                }
            }
            MqttStatus::Connecting | MqttStatus::Connected => Vec::new(),
            MqttStatus::Subscribed => {
                let mut actions = Vec::new();
                if self.discovery_dirty {
                    self.discovery_dirty = false;
                    actions.push(SessionAction::PublishDiscovery);
                }
                if self.state_dirty {
                    self.state_dirty = false;
                    actions.push(SessionAction::PublishState);
                    actions.push(SessionAction::PublishAttributes);
                }
                actions
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn connect(session: &mut MqttSession, now_ms: u64) -> Vec<SessionAction> {
        let actions = session.poll(WifiStatus::Connected, now_ms);
        assert_eq!(actions, vec![SessionAction::Connect]);
        session.handle_event(SessionEvent::ConnAck, now_ms)
    }

    #[test]
    fn first_connect_announces_everything_in_order() {
        let mut session = MqttSession::new();

        let actions = connect(&mut session, 0);
        assert_eq!(
            actions,
            vec![
                SessionAction::PublishOnline,
                SessionAction::PublishDiscovery,
                SessionAction::Subscribe,
            ]
        );
        assert_eq!(session.status(), MqttStatus::Connected);

        session.handle_event(SessionEvent::SubAck, 10);
        assert_eq!(session.status(), MqttStatus::Subscribed);

        // The post-connect reconcile publish flushes once subscribed.
        assert_eq!(
            session.poll(WifiStatus::Connected, 20),
            vec![SessionAction::PublishState, SessionAction::PublishAttributes]
        );
        assert_eq!(session.poll(WifiStatus::Connected, 30), Vec::new());
    }

    #[test]
    fn discovery_is_published_once_per_boot() {
        let mut session = MqttSession::new();

        let first = connect(&mut session, 0);
        assert!(first.contains(&SessionAction::PublishDiscovery));

        session.handle_event(SessionEvent::ConnectionLost, 100);
        let again = connect(&mut session, 10_000);
        assert!(!again.contains(&SessionAction::PublishDiscovery));
    }

    #[test]
    fn effect_list_change_reannounces_discovery() {
        let mut session = MqttSession::new();
        connect(&mut session, 0);
        session.handle_event(SessionEvent::SubAck, 1);
        session.poll(WifiStatus::Connected, 2);

        session.mark_discovery_dirty();
        let actions = session.poll(WifiStatus::Connected, 3);
        assert_eq!(actions, vec![SessionAction::PublishDiscovery]);
    }

    #[test]
    fn local_change_while_disconnected_flushes_latest_on_resubscribe() {
        let mut session = MqttSession::new();

        // Change arrives while offline; nothing to do yet.
        session.mark_state_dirty();
        assert_eq!(session.poll(WifiStatus::Disconnected, 0), Vec::new());

        connect(&mut session, 1_000);
        session.handle_event(SessionEvent::SubAck, 1_010);

        let actions = session.poll(WifiStatus::Connected, 1_020);
        assert_eq!(
            actions,
            vec![SessionAction::PublishState, SessionAction::PublishAttributes]
        );
    }

    #[test]
    fn dirty_state_waits_for_subscription() {
        let mut session = MqttSession::new();
        connect(&mut session, 0);

        session.mark_state_dirty();
        assert_eq!(session.poll(WifiStatus::Connected, 10), Vec::new());

        session.handle_event(SessionEvent::SubAck, 20);
        assert!(session
            .poll(WifiStatus::Connected, 30)
            .contains(&SessionAction::PublishState));
    }

    #[test]
    fn wifi_drop_resets_session_without_consuming_backoff() {
        let mut session = MqttSession::new();
        connect(&mut session, 0);
        session.handle_event(SessionEvent::SubAck, 1);

        assert_eq!(session.poll(WifiStatus::Disconnected, 100), Vec::new());
        assert_eq!(session.status(), MqttStatus::Disconnected);

        // Wifi comes back: reconnect immediately, no backoff delay owed.
        assert_eq!(
            session.poll(WifiStatus::Connected, 200),
            vec![SessionAction::Connect]
        );
    }

    #[test]
    fn reconnect_delays_grow_then_reset_on_success() {
        let mut session = MqttSession::new();

        let mut now_ms = 0;
        let mut gaps = Vec::new();
        let mut last_attempt_ms = None;

        for _ in 0..4 {
            loop {
                let actions = session.poll(WifiStatus::Connected, now_ms);
                if actions.contains(&SessionAction::Connect) {
                    if let Some(last) = last_attempt_ms {
                        gaps.push(now_ms - last);
                    }
                    last_attempt_ms = Some(now_ms);
                    session.handle_event(SessionEvent::ConnectionLost, now_ms);
                    break;
                }
                now_ms += 500;
            }
        }

        assert_eq!(gaps, vec![2_000, 4_000, 8_000]);

        // A successful connection resets the clock.
        loop {
            if session
                .poll(WifiStatus::Connected, now_ms)
                .contains(&SessionAction::Connect)
            {
                break;
            }
            now_ms += 500;
        }
        session.handle_event(SessionEvent::ConnAck, now_ms);
        session.handle_event(SessionEvent::ConnectionLost, now_ms);
        assert_eq!(
            session.poll(WifiStatus::Connected, now_ms + MQTT_BACKOFF_BASE_MS),
            vec![SessionAction::Connect]
        );
    }
}

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ChangeOrigin;

pub const MAX_HUE: u16 = 359;
pub const MAX_SATURATION: u8 = 100;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed command payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedEffect {
    Off,
    Solid,
    Rainbow,
    Fire,
    Breathe,
    Sparkle,
}

impl LedEffect {
    pub const ALL: [LedEffect; 6] = [
        Self::Off,
        Self::Solid,
        Self::Rainbow,
        Self::Fire,
        Self::Breathe,
        Self::Sparkle,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "Off",
            Self::Solid => "Solid",
            Self::Rainbow => "Rainbow",
            Self::Fire => "Fire",
            Self::Breathe => "Breathe",
            Self::Sparkle => "Sparkle",
        }
    }

    pub fn index(self) -> usize {
        Self::ALL.iter().position(|effect| *effect == self).unwrap_or(0)
    }

    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(|effect| effect.as_str()).collect()
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|effect| effect.as_str() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    pub power: bool,
    pub brightness: u8,
    pub hue: u16,
    pub saturation: u8,
    pub effect: LedEffect,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            power: true,
            brightness: 128,
            hue: 30,
            saturation: 100,
            effect: LedEffect::Rainbow,
        }
    }
}

impl DeviceState {
    pub fn sanitize(&mut self) {
        self.hue = self.hue.min(MAX_HUE);
        self.saturation = self.saturation.min(MAX_SATURATION);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct StateDelta {
    #[serde(default)]
    pub power: Option<bool>,
    #[serde(default)]
    pub brightness: Option<u8>,
    #[serde(default)]
    pub hue: Option<u16>,
    #[serde(default)]
    pub saturation: Option<u8>,
    #[serde(default)]
    pub effect: Option<LedEffect>,
}

impl StateDelta {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub state: DeviceState,
    pub changed: bool,
    pub publish_state: bool,
    pub persist: bool,
    pub render: bool,
}

// The single authoritative copy of DeviceState. Every mutation, whatever its
// source, goes through `apply`; everyone else gets snapshots.
#[derive(Debug)]
pub struct StateArbiter {
    state: DeviceState,
}

impl StateArbiter {
    pub fn new(mut initial: DeviceState) -> Self {
        initial.sanitize();
        Self { state: initial }
    }

    pub fn snapshot(&self) -> DeviceState {
        self.state
    }

    pub fn apply(&mut self, delta: StateDelta, origin: ChangeOrigin) -> ApplyOutcome {
        let mut next = self.state;

        if let Some(power) = delta.power {
            next.power = power;
        }
        if let Some(brightness) = delta.brightness {
            next.brightness = brightness;
        }
        if let Some(hue) = delta.hue {
            next.hue = hue.min(MAX_HUE);
        }
        if let Some(saturation) = delta.saturation {
            next.saturation = saturation.min(MAX_SATURATION);
        }
        if let Some(effect) = delta.effect {
            next.effect = effect;
        }

        let changed = next != self.state;
        self.state = next;

        // Local changes propagate outward, remote changes propagate inward;
        // neither path re-broadcasts what it just received.
        ApplyOutcome {
            state: next,
            changed,
            publish_state: changed && origin == ChangeOrigin::Local,
            persist: changed,
            render: changed && origin == ChangeOrigin::Remote,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn merge_keeps_unspecified_fields() {
        let mut arbiter = StateArbiter::new(DeviceState {
            power: true,
            brightness: 40,
            hue: 200,
            saturation: 80,
            effect: LedEffect::Solid,
        });

        let outcome = arbiter.apply(
            StateDelta {
                brightness: Some(128),
                ..StateDelta::default()
            },
            ChangeOrigin::Remote,
        );

        assert_eq!(outcome.state.brightness, 128);
        assert_eq!(outcome.state.hue, 200);
        assert_eq!(outcome.state.power, true);
        assert_eq!(outcome.state.effect, LedEffect::Solid);
    }

    #[test]
    fn remote_apply_persists_and_renders_without_republish() {
        let mut arbiter = StateArbiter::new(DeviceState::default());

        let outcome = arbiter.apply(
            StateDelta {
                brightness: Some(1),
                ..StateDelta::default()
            },
            ChangeOrigin::Remote,
        );

        assert!(outcome.changed);
        assert!(!outcome.publish_state);
        assert!(outcome.persist);
        assert!(outcome.render);
    }

    #[test]
    fn local_apply_publishes_and_persists() {
        let mut arbiter = StateArbiter::new(DeviceState::default());

        let outcome = arbiter.apply(
            StateDelta {
                power: Some(false),
                ..StateDelta::default()
            },
            ChangeOrigin::Local,
        );

        assert!(outcome.changed);
        assert!(outcome.publish_state);
        assert!(outcome.persist);
        assert!(!outcome.render);
    }

    #[test]
    fn noop_delta_produces_no_followup_work() {
        let initial = DeviceState::default();
        let mut arbiter = StateArbiter::new(initial);

        let outcome = arbiter.apply(
            StateDelta {
                brightness: Some(initial.brightness),
                ..StateDelta::default()
            },
            ChangeOrigin::Local,
        );

        assert!(!outcome.changed);
        assert!(!outcome.publish_state);
        assert!(!outcome.persist);
        assert!(!outcome.render);
        assert_eq!(outcome.state, initial);
    }

    #[test]
    fn out_of_range_hue_and_saturation_clamp() {
        let mut arbiter = StateArbiter::new(DeviceState::default());

        let outcome = arbiter.apply(
            StateDelta {
                hue: Some(400),
                saturation: Some(150),
                ..StateDelta::default()
            },
            ChangeOrigin::Remote,
        );

        assert_eq!(outcome.state.hue, MAX_HUE);
        assert_eq!(outcome.state.saturation, MAX_SATURATION);
    }

    #[test]
    fn command_payload_parses_as_partial_state() {
        let delta = StateDelta::parse(br#"{"brightness":128}"#).unwrap();

        assert_eq!(delta.brightness, Some(128));
        assert_eq!(delta.power, None);
        assert_eq!(delta.effect, None);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let delta = StateDelta::parse(br#"{"brightness":10,"transition":2}"#).unwrap();
        assert_eq!(delta.brightness, Some(10));
    }

    #[test]
    fn malformed_payload_is_rejected() {
        assert!(StateDelta::parse(b"{not json").is_err());
        assert!(StateDelta::parse(br#"{"brightness":"high"}"#).is_err());
        assert!(StateDelta::parse(br#"{"effect":"Disco"}"#).is_err());
    }

    #[test]
    fn effect_names_round_trip() {
        for effect in LedEffect::ALL {
            assert_eq!(LedEffect::from_name(effect.as_str()), Some(effect));
        }
        assert_eq!(LedEffect::from_name("Disco"), None);
    }

    #[test]
    fn persisted_state_round_trips() {
        let state = DeviceState {
            power: false,
            brightness: 7,
            hue: 359,
            saturation: 42,
            effect: LedEffect::Sparkle,
        };

        let raw = serde_json::to_vec(&state).unwrap();
        let loaded: DeviceState = serde_json::from_slice(&raw).unwrap();

        assert_eq!(loaded, state);
    }
}

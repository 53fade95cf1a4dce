use serde::Serialize;

use crate::state::LedEffect;
use crate::topics::{unique_id, TopicSet};

#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub identifiers: [String; 1],
    pub name: String,
    pub manufacturer: &'static str,
    pub model: &'static str,
    pub sw_version: &'static str,
}

// Retained entity metadata announced to the automation controller. Field
// order is struct order, so identical inputs serialize to identical bytes.
#[derive(Debug, Clone, Serialize)]
pub struct LightDiscovery {
    pub name: String,
    pub unique_id: String,
    pub command_topic: String,
    pub state_topic: String,
    pub availability_topic: String,
    pub json_attributes_topic: String,
    pub brightness: bool,
    pub supported_color_modes: [&'static str; 1],
    pub effect: bool,
    pub effect_list: Vec<&'static str>,
    pub device: DeviceInfo,
}

impl LightDiscovery {
    pub fn build(device_name: &str, badge_id: &str, topics: &TopicSet) -> Self {
        let unique_id = unique_id(badge_id);
        let suffix = &badge_id[badge_id.len().saturating_sub(4)..];

        Self {
            name: format!("{device_name} {suffix}"),
            unique_id: unique_id.clone(),
            command_topic: topics.command.clone(),
            state_topic: topics.state.clone(),
            availability_topic: topics.availability.clone(),
            json_attributes_topic: topics.attributes.clone(),
            brightness: true,
            supported_color_modes: ["hs"],
            effect: true,
            effect_list: LedEffect::names(),
            device: DeviceInfo {
                identifiers: [unique_id],
                name: device_name.to_string(),
                manufacturer: "badge",
                model: "led-badge",
                sw_version: env!("CARGO_PKG_VERSION"),
            },
        }
    }

    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct LightAttributes {
    pub effect_index: usize,
}

pub const AVAILABILITY_ONLINE: &str = "online";
pub const AVAILABILITY_OFFLINE: &str = "offline";

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn discovery_is_byte_identical_across_rebuilds() {
        let topics = TopicSet::new("homeassistant", "A1B2C3D4");

        let first = LightDiscovery::build("Badge", "A1B2C3D4", &topics)
            .to_payload()
            .unwrap();
        let second = LightDiscovery::build("Badge", "A1B2C3D4", &topics)
            .to_payload()
            .unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn discovery_names_every_builtin_effect() {
        let topics = TopicSet::new("homeassistant", "ff");
        let discovery = LightDiscovery::build("Badge", "ff", &topics);

        assert_eq!(discovery.effect_list.len(), LedEffect::ALL.len());
        assert!(discovery.effect_list.contains(&"Rainbow"));
        assert!(discovery.effect_list.contains(&"Off"));
    }

    #[test]
    fn discovery_advertises_bridge_topics() {
        let topics = TopicSet::new("homeassistant", "A1B2C3D4");
        let discovery = LightDiscovery::build("Badge", "A1B2C3D4", &topics);

        assert_eq!(discovery.name, "Badge C3D4");
        assert_eq!(discovery.unique_id, "badge_a1b2c3d4");
        assert_eq!(discovery.command_topic, topics.command);
        assert_eq!(discovery.state_topic, topics.state);
        assert_eq!(discovery.availability_topic, topics.availability);
        assert_eq!(discovery.supported_color_modes, ["hs"]);
    }

    #[test]
    fn short_badge_id_does_not_truncate() {
        let topics = TopicSet::new("homeassistant", "ff");
        let discovery = LightDiscovery::build("Badge", "ff", &topics);
        assert_eq!(discovery.name, "Badge ff");
    }
}

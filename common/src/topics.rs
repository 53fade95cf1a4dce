pub fn unique_id(badge_id: &str) -> String {
    format!("badge_{}", badge_id.to_lowercase())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    pub discovery: String,
    pub state: String,
    pub command: String,
    pub availability: String,
    pub attributes: String,
}

impl TopicSet {
    pub fn new(discovery_prefix: &str, badge_id: &str) -> Self {
        let base = format!("{}/light/{}", discovery_prefix, unique_id(badge_id));

        Self {
            discovery: format!("{base}/config"),
            state: format!("{base}/state"),
            command: format!("{base}/set"),
            availability: format!("{base}/availability"),
            attributes: format!("{base}/attributes"),
        }
    }
}

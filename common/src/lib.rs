pub mod backoff;
pub mod config;
pub mod discovery;
pub mod led;
pub mod session;
pub mod state;
pub mod topics;
pub mod types;
pub mod wifi;

pub use backoff::Backoff;
pub use config::{BridgeConfig, ConfigError, MqttConfig, WifiConfig};
pub use discovery::{DeviceInfo, LightAttributes, LightDiscovery};
pub use led::LedRenderer;
pub use session::{MqttSession, SessionAction, SessionEvent};
pub use state::{ApplyOutcome, DeviceState, LedEffect, ProtocolError, StateArbiter, StateDelta};
pub use topics::TopicSet;
pub use types::{ChangeOrigin, MqttStatus, WifiStatus};
pub use wifi::{WifiDriver, WifiDriverError, WifiManager};

use std::time::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::constants::{
    make_default_service_uuid, make_default_characteristic_uuid, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_DISCOVERY_TIMEOUT, DEFAULT_NOTIFICATION_RETENTION,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// How long (milliseconds) a single scan listens for advertisements.
    pub discovery_timeout_ms: u64,
    /// How long (milliseconds) a connection attempt may take before it counts as failed.
    pub connect_timeout_ms: u64,
    /// Only peripherals advertising this service are offered.
    pub target_service_id: Uuid,
    /// The characteristic whose notifications are streamed once connected.
    pub target_characteristic_id: Uuid,
    /// Try to connect again (once) when an established link fails.
    pub auto_reconnect: bool,
    /// How many received notifications are kept for `NotificationRouter::history`.
    pub notification_retention: usize,
}

impl Config {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            discovery_timeout_ms: DEFAULT_DISCOVERY_TIMEOUT,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT,
            target_service_id: make_default_service_uuid(),
            target_characteristic_id: make_default_characteristic_uuid(),
            auto_reconnect: false,
            notification_retention: DEFAULT_NOTIFICATION_RETENTION,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: Config = serde_json::from_str(r#"{"autoReconnect": true, "discoveryTimeoutMs": 2500}"#).unwrap();

        assert!(config.auto_reconnect);
        assert_eq!(config.discovery_timeout(), Duration::from_millis(2500));
        assert_eq!(config.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.target_service_id, make_default_service_uuid());
    }

    #[test]
    fn serializes_as_camel_case() {
        let json = serde_json::to_string(&Config::default()).unwrap();
        assert!(json.contains("\"targetCharacteristicId\""));
        assert!(json.contains("\"notificationRetention\":256"));
        assert!(json.contains("\"autoReconnect\":false"));
    }
}

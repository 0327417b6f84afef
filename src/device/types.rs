use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalMetadata {
    pub rssi: Option<i16>,
    pub tx_power_level: Option<i16>,
    pub services: Vec<Uuid>,
}

/// A peripheral seen during discovery. Produced by a transport, never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub address: String,
    pub display_name: String,
    pub signal: SignalMetadata,
}

impl DeviceDescriptor {
    pub fn new(address: impl Into<String>, display_name: impl Into<String>) -> Self {
        DeviceDescriptor {
            address: address.into(),
            display_name: display_name.into(),
            signal: SignalMetadata::default(),
        }
    }

    pub fn with_signal(mut self, signal: SignalMetadata) -> Self {
        self.signal = signal;
        self
    }

    pub fn matches_address(&self, address: &str) -> bool {
        self.address.eq_ignore_ascii_case(address)
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    DeviceListReady,
    Connecting {
        target: DeviceDescriptor,
    },
    Connected {
        target: DeviceDescriptor,
        subscription_active: bool,
    },
    Disconnecting,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Scanning => "Scanning",
            ConnectionState::DeviceListReady => "DeviceListReady",
            ConnectionState::Connecting { .. } => "Connecting",
            ConnectionState::Connected { .. } => "Connected",
            ConnectionState::Disconnecting => "Disconnecting",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting { target } => write!(f, "Connecting to {}", target),
            ConnectionState::Connected { target, subscription_active: true } => write!(f, "Connected to {} (streaming)", target),
            ConnectionState::Connected { target, subscription_active: false } => write!(f, "Connected to {}", target),
            other => write!(f, "{}", other.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Scan,
    SelectDevice(String),
    Connect,
    ToggleConnect,
    Disconnect,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Scan => write!(f, "Scan"),
            Command::SelectDevice(address) => write!(f, "SelectDevice({})", address),
            Command::Connect => write!(f, "Connect"),
            Command::ToggleConnect => write!(f, "ToggleConnect"),
            Command::Disconnect => write!(f, "Disconnect"),
        }
    }
}

/// A characteristic of a connected peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    /// e.g. `READ`, `NOTIFY`
    pub properties: Vec<String>,
    pub descriptor_count: usize,
}

/// A GATT service of a connected peripheral, as found by service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub ordinal: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    CommandRejected,
    Transport,
    NoDevicesFound,
    ObserverFault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(pub(crate) u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    StateChanged(ConnectionState),
    Error {
        kind: ErrorKind,
        message: String,
    },
    DataReceived(NotificationEvent),
    /// The services of the peripheral that was just connected.
    ServicesDiscovered(Vec<ServiceInfo>),
    Cancelled,
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_matching_ignores_case() {
        let device = DeviceDescriptor::new("AA:BB:cc:dd:EE:ff", "Scale1");
        assert!(device.matches_address("aa:bb:CC:DD:ee:FF"));
        assert!(!device.matches_address("aa:bb:cc:dd:ee:00"));
    }

    #[test]
    fn states_render_their_target() {
        let target = DeviceDescriptor::new("AA:BB", "Scale1");
        let state = ConnectionState::Connected { target, subscription_active: true };

        assert_eq!(state.name(), "Connected");
        assert_eq!(state.to_string(), "Connected to Scale1 (AA:BB) (streaming)");
        assert_eq!(ConnectionState::DeviceListReady.to_string(), "DeviceListReady");
    }
}

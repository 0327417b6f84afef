use indexmap::IndexMap;

use crate::device::types::DeviceDescriptor;

/// The devices found by the most recent scan, in discovery order.
///
/// Keys are lowercased addresses, so lookups are case-insensitive and a device reported twice
/// keeps its first position but the last descriptor.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: IndexMap<String, DeviceDescriptor>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry::default()
    }

    pub fn replace<I>(&mut self, devices: I)
    where
        I: IntoIterator<Item = DeviceDescriptor>,
    {
        let mut next: IndexMap<String, DeviceDescriptor> = IndexMap::new();
        for device in devices {
            next.insert(device.address.to_ascii_lowercase(), device);
        }

        self.devices = next;
    }

    pub fn lookup(&self, address: &str) -> Option<DeviceDescriptor> {
        self.devices.get(&address.to_ascii_lowercase()).cloned()
    }

    pub fn list(&self) -> Vec<DeviceDescriptor> {
        self.devices.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(address: &str, name: &str) -> DeviceDescriptor {
        DeviceDescriptor::new(address, name)
    }

    #[test]
    fn list_keeps_discovery_order() {
        let mut registry = DeviceRegistry::new();
        registry.replace(vec![device("CC:00", "c"), device("AA:00", "a"), device("BB:00", "b")]);

        let names: Vec<String> = registry.list().into_iter().map(|d| d.display_name).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn duplicate_addresses_keep_last_seen() {
        let mut registry = DeviceRegistry::new();
        registry.replace(vec![device("AA:BB", "old"), device("CC:DD", "other"), device("aa:bb", "new")]);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup("AA:BB").unwrap().display_name, "new");
        assert_eq!(registry.list()[0].display_name, "new");
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut registry = DeviceRegistry::new();
        registry.replace(vec![device("AA:BB", "Scale1")]);

        assert_eq!(registry.lookup("aa:bb").unwrap().display_name, "Scale1");
        assert!(registry.lookup("AA:BC").is_none());
    }

    #[test]
    fn replace_drops_the_previous_set() {
        let mut registry = DeviceRegistry::new();
        registry.replace(vec![device("AA:BB", "Scale1")]);
        registry.replace(vec![device("CC:DD", "Scale2")]);

        assert!(registry.lookup("AA:BB").is_none());
        assert_eq!(registry.list(), vec![device("CC:DD", "Scale2")]);

        registry.replace(Vec::new());
        assert!(registry.is_empty());
    }
}

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use btleplug::api::{Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, ValueNotification};
use btleplug::platform::{Adapter, Manager, Peripheral};
use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio::spawn;
use tokio::time::{interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::constants::{IS_CONNECTED_DEADLINE, LINK_POLL_DELAY};
use crate::device::transport::{ConnectionHandle, LinkCallback, LinkEvent, TransportAdapter};
use crate::device::types::{CharacteristicInfo, DeviceDescriptor, ServiceInfo, SignalMetadata};
use crate::error::TransportError;

type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

const PROPERTY_NAMES: [(CharPropFlags, &str); 8] = [
    (CharPropFlags::BROADCAST, "BROADCAST"),
    (CharPropFlags::READ, "READ"),
    (CharPropFlags::WRITE_WITHOUT_RESPONSE, "WRITE_WITHOUT_RESPONSE"),
    (CharPropFlags::WRITE, "WRITE"),
    (CharPropFlags::NOTIFY, "NOTIFY"),
    (CharPropFlags::INDICATE, "INDICATE"),
    (CharPropFlags::AUTHENTICATED_SIGNED_WRITES, "AUTHENTICATED_SIGNED_WRITES"),
    (CharPropFlags::EXTENDED_PROPERTIES, "EXTENDED_PROPERTIES"),
];

// Runs `cleanup` on the current runtime. Used from `Drop`, which can not await.
fn spawn_cleanup<F>(what: &str, cleanup: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(cleanup);
        },
        Err(_) => warn!("No runtime left to {}", what),
    }
}

/// The adapters a scan was started on. Scanning stops when this is dropped, so a discovery that
/// is cancelled or times out does not leave the radio scanning.
struct ActiveScan {
    adapters: Vec<Adapter>,
}

impl ActiveScan {
    async fn stop(mut self) {
        let adapters = std::mem::take(&mut self.adapters);
        stop_scanning(&adapters).await;
    }
}

impl Drop for ActiveScan {
    fn drop(&mut self) {
        if self.adapters.is_empty() {
            return;
        }

        debug!("Discovery abandoned, stopping the scan");
        let adapters = std::mem::take(&mut self.adapters);
        spawn_cleanup("stop scanning", async move {
            stop_scanning(&adapters).await;
        });
    }
}

/// A peripheral that is being connected. Unless `established` is called, it is disconnected again
/// when this is dropped: after a failure, or when the connect future itself is dropped part way.
struct PendingLink {
    peripheral: Peripheral,
    armed: bool,
}

impl PendingLink {
    fn new(peripheral: Peripheral) -> Self {
        PendingLink { peripheral, armed: true }
    }

    fn established(mut self) -> Peripheral {
        self.armed = false;
        self.peripheral.clone()
    }
}

impl Drop for PendingLink {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        info!("Connect did not complete, releasing the peripheral");
        let peripheral = self.peripheral.clone();
        spawn_cleanup("release a partially connected peripheral", async move {
            if let Err(err) = peripheral.disconnect().await {
                debug!("Releasing the peripheral failed: {:?}", err);
            }
        });
    }
}

struct ActiveLink {
    peripheral: Peripheral,
    notifications: Option<CancellationToken>,
}

#[derive(Default)]
struct BtleInner {
    discovered: HashMap<String, Peripheral>,
    links: HashMap<u64, ActiveLink>,
    next_link: u64,
}

/// The real radio, through btleplug. Only peripherals advertising `service` are reported.
pub struct BtleplugTransport {
    manager: Manager,
    service: Uuid,
    inner: Mutex<BtleInner>,
}

impl BtleplugTransport {
    pub async fn new(service: Uuid) -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        Ok(BtleplugTransport {
            manager,
            service,
            inner: Mutex::new(BtleInner::default()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BtleInner> {
        self.inner.lock().expect("Failed to lock BtleplugTransport inner")
    }

    fn peripheral(&self, handle: &ConnectionHandle) -> Result<Peripheral, TransportError> {
        self.lock().links
            .get(&handle.id)
            .map(|link| link.peripheral.clone())
            .ok_or(TransportError::NotConnected(handle.id))
    }

    fn stop_notifications(&self, handle: &ConnectionHandle) {
        if let Some(link) = self.lock().links.get_mut(&handle.id) {
            if let Some(cancel) = link.notifications.take() {
                cancel.cancel();
            }
        }
    }
}

async fn start_scanning(manager: &Manager, service: Uuid) -> Result<ActiveScan, TransportError> {
    let adapters = manager.adapters().await?;
    if adapters.is_empty() {
        return Err(TransportError::NoAdapter);
    }

    let filter = ScanFilter {
        services: vec![service],
    };

    let scan = ActiveScan { adapters };
    for adapter in &scan.adapters {
        info!("Scanning using adapter {}...", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
        adapter.start_scan(filter.clone()).await?;
    }

    Ok(scan)
}

async fn stop_scanning(adapters: &[Adapter]) {
    for adapter in adapters {
        if let Err(err) = adapter.stop_scan().await {
            warn!("Failed to stop scanning: {:?}", err);
        }
    }
}

async fn find_peripherals(adapters: &[Adapter], service: Uuid) -> Vec<(DeviceDescriptor, Peripheral)> {
    let mut found = Vec::new();

    for adapter in adapters {
        let peripherals = match adapter.peripherals().await {
            Ok(v) => v,
            Err(err) => {
                warn!("Failed to query BLE adapter for peripherals: {}", err);
                continue;
            },
        };

        for peripheral in peripherals {
            match peripheral.properties().await {
                Err(err) => {
                    warn!("Could not query peripheral for properties: {:?}", err);
                },
                Ok(None) => {
                    debug!("Peripheral has no properties");
                },
                Ok(Some(properties)) => {
                    // Some environments ignore the filter, so make sure to check the service uuid again
                    if !properties.services.contains(&service) {
                        continue;
                    }

                    let address = properties.address.to_string();
                    let display_name = properties.local_name.clone().unwrap_or(String::from("Unknown"));
                    debug!("Found peripheral {} {:?} {} {:?}", address, properties.address_type, display_name, properties.services);

                    let descriptor = DeviceDescriptor::new(address, display_name).with_signal(SignalMetadata {
                        rssi: properties.rssi,
                        tx_power_level: properties.tx_power_level,
                        services: properties.services.clone(),
                    });
                    found.push((descriptor, peripheral));
                },
            }
        }
    }

    found
}

fn describe_services(peripheral: &Peripheral) -> Vec<ServiceInfo> {
    peripheral.services().into_iter()
        .map(|service| ServiceInfo {
            uuid: service.uuid,
            characteristics: service.characteristics.iter()
                .map(|characteristic| CharacteristicInfo {
                    uuid: characteristic.uuid,
                    properties: PROPERTY_NAMES.iter()
                        .filter(|(flag, _)| characteristic.properties.contains(*flag))
                        .map(|(_, name)| name.to_string())
                        .collect(),
                    descriptor_count: characteristic.descriptors.len(),
                })
                .collect(),
        })
        .collect()
}

fn find_characteristic(peripheral: &Peripheral, service: Uuid, characteristic: Uuid) -> Result<Characteristic, TransportError> {
    for service_entry in peripheral.services() {
        if !service_entry.uuid.eq(&service) {
            continue;
        }

        for candidate in &service_entry.characteristics {
            if candidate.uuid.eq(&characteristic) {
                return Ok(candidate.clone());
            }
        }
    }

    Err(TransportError::MissingCharacteristic)
}

// Forwards notifications of `characteristic` to `callback`, and reports the link as lost when the
// stream ends or the peripheral stops answering `is_connected`.
fn read_notifications_task(cancel: CancellationToken, peripheral: Peripheral, mut notification_stream: NotificationStream, characteristic: Uuid, callback: LinkCallback) {
    spawn(async move {
        let mut link_poll = interval(Duration::from_millis(LINK_POLL_DELAY));
        link_poll.tick().await;

        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                notification = notification_stream.next() => match notification {
                    Some(data) => {
                        if data.uuid.eq(&characteristic) {
                            callback(LinkEvent::Data(data.value));
                        }
                    },
                    None => {
                        warn!("Notification stream ended");
                        callback(LinkEvent::Lost(TransportError::LinkLost));
                        break 'mainloop;
                    },
                },
                _ = link_poll.tick() => {
                    match timeout(Duration::from_millis(IS_CONNECTED_DEADLINE), peripheral.is_connected()).await {
                        Err(_) => {
                            // macOS
                            warn!("Checking for connection status took too long");
                        },
                        Ok(Err(err)) => {
                            warn!("Error checking for connection state: {:?}", err);
                            callback(LinkEvent::Lost(err.into()));
                            break 'mainloop;
                        },
                        Ok(Ok(false)) => {
                            warn!("Connection lost");
                            callback(LinkEvent::Lost(TransportError::LinkLost));
                            break 'mainloop;
                        },
                        Ok(Ok(true)) => {},
                    }
                },
            }
        }

        debug!("Read notifications task stopped");
    });
}

#[async_trait]
impl TransportAdapter for BtleplugTransport {
    async fn discover(&self, timeout: Duration) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let scan = start_scanning(&self.manager, self.service).await?;
        sleep(timeout).await;

        let found = find_peripherals(&scan.adapters, self.service).await;
        scan.stop().await;
        info!("Discovery found {} peripheral(s)", found.len());

        let mut inner = self.lock();
        inner.discovered.clear();
        let mut descriptors = Vec::with_capacity(found.len());
        for (descriptor, peripheral) in found {
            inner.discovered.insert(descriptor.address.to_ascii_lowercase(), peripheral);
            descriptors.push(descriptor);
        }

        Ok(descriptors)
    }

    async fn connect(&self, device: &DeviceDescriptor) -> Result<ConnectionHandle, TransportError> {
        let peripheral = self.lock().discovered
            .get(&device.address.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| TransportError::UnknownDevice(device.address.clone()))?;

        let pending = PendingLink::new(peripheral);
        info!("Connecting to peripheral {}...", device);
        pending.peripheral.connect().await?;

        info!("Connected; Discovering services...");
        if let Err(err) = pending.peripheral.discover_services().await {
            warn!("Discovering services failed: {:?}", err);
            return Err(err.into());
        }

        let services = describe_services(&pending.peripheral);
        for service in &services {
            debug!("Service {} with {} characteristic(s)", service.uuid, service.characteristics.len());
        }

        let peripheral = pending.established();
        let mut inner = self.lock();
        inner.next_link += 1;
        let id = inner.next_link;
        inner.links.insert(id, ActiveLink { peripheral, notifications: None });

        Ok(ConnectionHandle { id, address: device.address.clone(), services })
    }

    async fn subscribe(&self, handle: &ConnectionHandle, characteristic: Uuid, callback: LinkCallback) -> Result<(), TransportError> {
        let peripheral = self.peripheral(handle)?;
        let data_char = find_characteristic(&peripheral, self.service, characteristic)?;

        // obtain the stream before subscribing so that the first notifications are not missed
        let notification_stream = peripheral.notifications().await?;
        info!("Subscribing to characteristic {:?} {:?}", data_char.service_uuid, data_char.uuid);
        peripheral.subscribe(&data_char).await?;

        let cancel = CancellationToken::new();
        match self.lock().links.get_mut(&handle.id) {
            Some(link) => link.notifications = Some(cancel.clone()),
            None => return Err(TransportError::NotConnected(handle.id)),
        }
        read_notifications_task(cancel, peripheral, notification_stream, characteristic, callback);

        Ok(())
    }

    async fn unsubscribe(&self, handle: &ConnectionHandle, characteristic: Uuid) -> Result<(), TransportError> {
        self.stop_notifications(handle);

        let peripheral = self.peripheral(handle)?;
        let data_char = find_characteristic(&peripheral, self.service, characteristic)?;
        peripheral.unsubscribe(&data_char).await?;
        Ok(())
    }

    async fn disconnect(&self, handle: &ConnectionHandle) -> Result<(), TransportError> {
        self.stop_notifications(handle);

        let link = self.lock().links.remove(&handle.id);
        match link {
            None => Err(TransportError::NotConnected(handle.id)),
            Some(link) => {
                info!("Disconnecting from {}", handle.address);
                link.peripheral.disconnect().await?;
                Ok(())
            },
        }
    }
}

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use log::{debug, info};
use tokio::spawn;
use tokio::time::{interval, sleep};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::transport::{ConnectionHandle, LinkCallback, LinkEvent, TransportAdapter};
use crate::device::types::{CharacteristicInfo, DeviceDescriptor, ServiceInfo, SignalMetadata};
use crate::device::constants::{make_default_characteristic_uuid, make_default_service_uuid, DEFAULT_WRITE_CHARACTERISTIC};
use crate::error::TransportError;

/// A transport call, as recorded by `SimulatedTransport`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Discover(Duration),
    Connect(String),
    Subscribe(u64, Uuid),
    Unsubscribe(u64, Uuid),
    Disconnect(u64),
}

struct SimulatedLink {
    callback: Option<Arc<LinkCallback>>,
    feed: Option<CancellationToken>,
}

#[derive(Default)]
struct SimulatedInner {
    devices: Vec<DeviceDescriptor>,
    discover_results: VecDeque<Result<Vec<DeviceDescriptor>, TransportError>>,
    connect_results: VecDeque<Result<(), TransportError>>,
    subscribe_results: VecDeque<Result<(), TransportError>>,
    disconnect_results: VecDeque<Result<(), TransportError>>,
    discover_delay: Duration,
    connect_delay: Duration,
    subscribe_delay: Duration,
    disconnect_delay: Duration,
    services: Vec<ServiceInfo>,
    feed_interval: Option<Duration>,
    calls: Vec<TransportCall>,
    next_link: u64,
    links: HashMap<u64, SimulatedLink>,
}

/// An in-memory radio. Outcomes are scripted per call (falling back to success), every call is
/// recorded, and data can be pushed into subscribed links as if the peripheral had sent it.
#[derive(Clone, Default)]
pub struct SimulatedTransport {
    inner: Arc<Mutex<SimulatedInner>>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        SimulatedTransport::default()
    }

    pub fn with_devices(devices: Vec<DeviceDescriptor>) -> Self {
        let transport = SimulatedTransport::new();
        transport.lock().devices = devices;
        transport
    }

    /// A couple of peripherals that stream a counter once subscribed.
    pub fn demo() -> Self {
        let signal = |rssi| SignalMetadata {
            rssi: Some(rssi),
            tx_power_level: None,
            services: vec![make_default_service_uuid()],
        };
        let transport = SimulatedTransport::with_devices(vec![
            DeviceDescriptor::new("C0:FF:EE:00:00:01", "Scale1").with_signal(signal(-48)),
            DeviceDescriptor::new("C0:FF:EE:00:00:02", "Scale2").with_signal(signal(-71)),
        ]);
        transport.set_services(vec![ServiceInfo {
            uuid: make_default_service_uuid(),
            characteristics: vec![
                CharacteristicInfo {
                    uuid: Uuid::parse_str(DEFAULT_WRITE_CHARACTERISTIC).unwrap_or_default(),
                    properties: vec!["WRITE_WITHOUT_RESPONSE".to_string(), "WRITE".to_string()],
                    descriptor_count: 0,
                },
                CharacteristicInfo {
                    uuid: make_default_characteristic_uuid(),
                    properties: vec!["NOTIFY".to_string()],
                    descriptor_count: 1,
                },
            ],
        }]);
        transport.set_feed_interval(Some(Duration::from_millis(250)));
        transport.set_discover_delay(Duration::from_millis(300));
        transport
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimulatedInner> {
        self.inner.lock().expect("Failed to lock SimulatedTransport inner")
    }

    pub fn push_discover_result(&self, result: Result<Vec<DeviceDescriptor>, TransportError>) {
        self.lock().discover_results.push_back(result);
    }

    pub fn push_connect_result(&self, result: Result<(), TransportError>) {
        self.lock().connect_results.push_back(result);
    }

    pub fn push_subscribe_result(&self, result: Result<(), TransportError>) {
        self.lock().subscribe_results.push_back(result);
    }

    pub fn push_disconnect_result(&self, result: Result<(), TransportError>) {
        self.lock().disconnect_results.push_back(result);
    }

    pub fn set_discover_delay(&self, delay: Duration) {
        self.lock().discover_delay = delay;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    pub fn set_subscribe_delay(&self, delay: Duration) {
        self.lock().subscribe_delay = delay;
    }

    pub fn set_disconnect_delay(&self, delay: Duration) {
        self.lock().disconnect_delay = delay;
    }

    /// The services reported for every link established from now on.
    pub fn set_services(&self, services: Vec<ServiceInfo>) {
        self.lock().services = services;
    }

    pub fn set_feed_interval(&self, feed_interval: Option<Duration>) {
        self.lock().feed_interval = feed_interval;
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.lock().calls.clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.calls().iter().filter(|call| matches!(call, TransportCall::Disconnect(_))).count()
    }

    fn subscribed_callbacks(&self) -> Vec<Arc<LinkCallback>> {
        self.lock().links.values().filter_map(|link| link.callback.clone()).collect()
    }

    /// Push a notification to every subscribed link. Returns how many links received it.
    pub fn push_data(&self, payload: &[u8]) -> usize {
        let callbacks = self.subscribed_callbacks();
        for callback in &callbacks {
            callback(LinkEvent::Data(payload.to_vec()));
        }
        callbacks.len()
    }

    /// Report every subscribed link as lost, as if the peripheral went out of range.
    pub fn drop_links(&self, error: TransportError) -> usize {
        let callbacks = self.subscribed_callbacks();
        for callback in &callbacks {
            callback(LinkEvent::Lost(error.clone()));
        }
        callbacks.len()
    }

    fn stop_feed(link: &mut SimulatedLink) {
        if let Some(feed) = link.feed.take() {
            feed.cancel();
        }
    }
}

#[async_trait]
impl TransportAdapter for SimulatedTransport {
    async fn discover(&self, timeout: Duration) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let delay = {
            let mut inner = self.lock();
            inner.calls.push(TransportCall::Discover(timeout));
            inner.discover_delay
        };
        sleep(delay).await;

        let mut inner = self.lock();
        match inner.discover_results.pop_front() {
            Some(result) => result,
            None => Ok(inner.devices.clone()),
        }
    }

    async fn connect(&self, device: &DeviceDescriptor) -> Result<ConnectionHandle, TransportError> {
        let delay = {
            let mut inner = self.lock();
            inner.calls.push(TransportCall::Connect(device.address.clone()));
            inner.connect_delay
        };
        sleep(delay).await;

        let mut inner = self.lock();
        inner.connect_results.pop_front().unwrap_or(Ok(()))?;

        inner.next_link += 1;
        let id = inner.next_link;
        inner.links.insert(id, SimulatedLink { callback: None, feed: None });
        info!("Simulated link {} to {} established", id, device);
        Ok(ConnectionHandle { id, address: device.address.clone(), services: inner.services.clone() })
    }

    async fn subscribe(&self, handle: &ConnectionHandle, characteristic: Uuid, callback: LinkCallback) -> Result<(), TransportError> {
        let delay = {
            let mut inner = self.lock();
            inner.calls.push(TransportCall::Subscribe(handle.id, characteristic));
            inner.subscribe_delay
        };
        sleep(delay).await;

        let mut inner = self.lock();
        inner.subscribe_results.pop_front().unwrap_or(Ok(()))?;

        let feed_interval = inner.feed_interval;
        let link = inner.links.get_mut(&handle.id).ok_or(TransportError::NotConnected(handle.id))?;
        let callback = Arc::new(callback);
        link.callback = Some(callback.clone());

        if let Some(period) = feed_interval {
            let cancel = CancellationToken::new();
            link.feed = Some(cancel.clone());

            spawn(async move {
                let mut ticks = interval(period);
                let mut counter: u32 = 0;

                'mainloop: loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            break 'mainloop;
                        },
                        _ = ticks.tick() => {
                            counter = counter.wrapping_add(1);
                            callback(LinkEvent::Data(counter.to_le_bytes().to_vec()));
                        },
                    }
                }
                debug!("Simulated feed stopped");
            });
        }

        Ok(())
    }

    async fn unsubscribe(&self, handle: &ConnectionHandle, characteristic: Uuid) -> Result<(), TransportError> {
        let mut inner = self.lock();
        inner.calls.push(TransportCall::Unsubscribe(handle.id, characteristic));

        let link = inner.links.get_mut(&handle.id).ok_or(TransportError::NotConnected(handle.id))?;
        link.callback = None;
        SimulatedTransport::stop_feed(link);
        Ok(())
    }

    async fn disconnect(&self, handle: &ConnectionHandle) -> Result<(), TransportError> {
        let delay = {
            let mut inner = self.lock();
            inner.calls.push(TransportCall::Disconnect(handle.id));
            inner.disconnect_delay
        };
        sleep(delay).await;

        let mut inner = self.lock();
        if let Some(mut link) = inner.links.remove(&handle.id) {
            SimulatedTransport::stop_feed(&mut link);
        }
        inner.disconnect_results.pop_front().unwrap_or(Ok(()))
    }
}

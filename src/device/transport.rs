use std::time::Duration;
use async_trait::async_trait;
use uuid::Uuid;

use crate::device::types::{DeviceDescriptor, ServiceInfo};
use crate::error::TransportError;

/// An established link, as handed out by `TransportAdapter::connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub id: u64,
    pub address: String,
    pub services: Vec<ServiceInfo>,
}

#[derive(Debug, Clone)]
pub enum LinkEvent {
    Data(Vec<u8>),
    Lost(TransportError),
}

/// Invoked from the transport's own task or thread, so it must not block.
pub type LinkCallback = Box<dyn Fn(LinkEvent) + Send + Sync>;

/// The radio. Every call may suspend and may fail; a call is cancelled by dropping its future.
///
/// Dropping a pending call must not leak radio resources: a dropped `discover` stops scanning and
/// a dropped `connect` disconnects whatever it had already established.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Listen for peripherals advertising the target service for `timeout`, then report them.
    async fn discover(&self, timeout: Duration) -> Result<Vec<DeviceDescriptor>, TransportError>;

    async fn connect(&self, device: &DeviceDescriptor) -> Result<ConnectionHandle, TransportError>;

    /// Enable notifications on `characteristic`. Pushes and link loss are reported through
    /// `callback` until `unsubscribe` or `disconnect`.
    async fn subscribe(
        &self,
        handle: &ConnectionHandle,
        characteristic: Uuid,
        callback: LinkCallback,
    ) -> Result<(), TransportError>;

    async fn unsubscribe(&self, handle: &ConnectionHandle, characteristic: Uuid) -> Result<(), TransportError>;

    async fn disconnect(&self, handle: &ConnectionHandle) -> Result<(), TransportError>;
}

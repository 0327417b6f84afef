pub mod btle;
pub mod constants;
pub mod controller;
pub mod observer;
pub mod registry;
pub mod router;
pub mod simulated;
pub mod transport;
pub mod types;

pub use controller::{connection_controller, ConnectionController};
pub use transport::{ConnectionHandle, LinkCallback, LinkEvent, TransportAdapter};

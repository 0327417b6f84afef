use std::any::Any;
use std::io;
use std::str::Utf8Error;
use std::time::Duration;
use thiserror::Error;
use btleplug;
use serde_json;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start (transport): {source}")]
    Transport { #[from] source: TransportError },

    #[error("Command failed: {source}")]
    Command { #[from] source: CommandError },

    #[error("{0}")]
    Session(String),
}

/// Failures reported by a `TransportAdapter`. These never reach observers as-is; the controller
/// normalizes them into an `ErrorKind` plus the rendered message.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Error communicating with device (btleplug): {0}")]
    Btle(String),

    #[error("No bluetooth adapter available")]
    NoAdapter,

    #[error("Not allowed to access bluetooth")]
    PermissionDenied,

    #[error("Device {0} was not seen during the last scan")]
    UnknownDevice(String),

    #[error("A required bluetooth characteristic is not available")]
    MissingCharacteristic,

    #[error("Connection {0} is not active")]
    NotConnected(u64),

    #[error("Discovery did not finish within {}", humantime::format_duration(*.0))]
    DiscoveryTimeout(Duration),

    #[error("Connecting did not finish within {}", humantime::format_duration(*.0))]
    ConnectTimeout(Duration),

    #[error("Disconnecting did not finish within {}", humantime::format_duration(*.0))]
    DisconnectTimeout(Duration),

    #[error("Connection to the device was lost")]
    LinkLost,

    #[error("{0}")]
    Peripheral(String),
}

impl From<btleplug::Error> for TransportError {
    fn from(source: btleplug::Error) -> Self {
        match source {
            btleplug::Error::PermissionDenied => TransportError::PermissionDenied,
            btleplug::Error::NotConnected => TransportError::LinkLost,
            other => TransportError::Btle(other.to_string()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Command {command} rejected while {state}: {reason}")]
    Rejected {
        command: String,
        state: String,
        reason: &'static str,
    },

    #[error("The connection controller has shut down")]
    ShutDown,
}

impl CommandError {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CommandError::Rejected { .. })
    }
}

pub fn readable_thread_panic_error(error: &Box<dyn Any + Send + 'static>) -> String {
    let mut stringified = String::from("???");

    if let Some(s) = error.downcast_ref::<&str>() {
        stringified = format!("{}", s);
    }
    else if let Some(s) = error.downcast_ref::<String>() {
        stringified = format!("{}", s);
    }
    let type_id = (**error).type_id();

    format!("panic from thread: [{:?}]: [{}]", type_id, stringified)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peripheral_errors_render_their_message_verbatim() {
        let err = TransportError::Peripheral("peripheral busy".to_string());
        assert_eq!(err.to_string(), "peripheral busy");
    }

    #[test]
    fn panic_payloads_are_stringified() {
        let payload: Box<dyn Any + Send + 'static> = Box::new("handler exploded");
        assert!(readable_thread_panic_error(&payload).contains("handler exploded"));

        let payload: Box<dyn Any + Send + 'static> = Box::new(String::from("owned message"));
        assert!(readable_thread_panic_error(&payload).contains("owned message"));
    }

    #[test]
    fn timeouts_are_human_readable() {
        let err = TransportError::DiscoveryTimeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "Discovery did not finish within 1s 500ms");
    }
}

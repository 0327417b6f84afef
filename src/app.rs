use std::sync::Arc;
use futures::StreamExt;
use futures::channel::mpsc::UnboundedReceiver;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::cli::{Cli, Mode};
use crate::config::io::ConfigIO;
use crate::config::types::Config;
use crate::device::btle::BtleplugTransport;
use crate::device::simulated::SimulatedTransport;
use crate::device::types::{Command, ConnectionState, ControllerEvent, DeviceDescriptor, ServiceInfo};
use crate::device::{connection_controller, ConnectionController, TransportAdapter};
use crate::error::AppRunError;

type Events = UnboundedReceiver<ControllerEvent>;

fn format_payload(payload: &[u8]) -> String {
    payload.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" ")
}

fn format_services(services: &[ServiceInfo]) -> Vec<String> {
    let mut lines = Vec::new();
    for service in services {
        lines.push(format!("  service {}", service.uuid));
        for characteristic in &service.characteristics {
            lines.push(format!(
                "    characteristic {} [{}] ({} descriptors)",
                characteristic.uuid,
                characteristic.properties.join(" | "),
                characteristic.descriptor_count,
            ));
        }
    }
    lines
}

fn print_device(device: &DeviceDescriptor) {
    let rssi = device.signal.rssi.map(|rssi| format!("{} dBm", rssi)).unwrap_or(String::from("?"));
    println!("{}\t{}\t{}", device.address, device.display_name, rssi);
}

async fn next_event(events: &mut Events) -> Result<ControllerEvent, AppRunError> {
    events.next().await.ok_or_else(|| AppRunError::Session("The controller stopped unexpectedly".to_string()))
}

async fn scan(controller: &ConnectionController, events: &mut Events) -> Result<Vec<DeviceDescriptor>, AppRunError> {
    controller.issue_command(Command::Scan)?;
    let mut last_error: Option<String> = None;

    loop {
        match next_event(events).await? {
            ControllerEvent::StateChanged(ConnectionState::DeviceListReady) => {
                let devices = controller.devices();
                for device in &devices {
                    print_device(device);
                }
                return Ok(devices);
            },
            ControllerEvent::StateChanged(ConnectionState::Idle) => {
                return Err(AppRunError::Session(last_error.unwrap_or(String::from("Scan did not complete"))));
            },
            ControllerEvent::Error { message, .. } => last_error = Some(message),
            _ => {},
        }
    }
}

async fn stream(controller: &ConnectionController, events: &mut Events, address: Option<&str>) -> Result<(), AppRunError> {
    let devices = scan(controller, events).await?;
    let target = match address {
        Some(address) => address.to_string(),
        None => match devices.first() {
            Some(device) => device.address.clone(),
            None => return Err(AppRunError::Session(String::from("No devices found"))),
        },
    };

    controller.issue_command(Command::SelectDevice(target))?;
    controller.issue_command(Command::Connect)?;

    let mut stopping = false;
    let mut last_error: Option<String> = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !stopping => {
                info!("Interrupted, disconnecting");
                stopping = true;
                if let Err(err) = controller.issue_command(Command::Disconnect) {
                    warn!("Could not disconnect: {}", err);
                    return Ok(());
                }
            },
            event = next_event(events) => match event? {
                ControllerEvent::DataReceived(notification) => {
                    println!("#{}\t{}", notification.ordinal, format_payload(&notification.payload));
                },
                ControllerEvent::StateChanged(state) => {
                    eprintln!("{}", state);
                    match state {
                        ConnectionState::Idle if stopping => return Ok(()),
                        ConnectionState::Idle | ConnectionState::DeviceListReady => {
                            return Err(AppRunError::Session(last_error.unwrap_or(String::from("Connection ended"))));
                        },
                        _ => {},
                    }
                },
                ControllerEvent::Error { kind, message } => {
                    eprintln!("{:?}: {}", kind, message);
                    last_error = Some(message);
                },
                ControllerEvent::ServicesDiscovered(services) => {
                    for line in format_services(&services) {
                        eprintln!("{}", line);
                    }
                },
                ControllerEvent::Cancelled | ControllerEvent::Disconnected => {},
            },
        }
    }
}

async fn load_config(config_io: &ConfigIO) -> Config {
    match config_io.read().await {
        Ok(config) => config,
        Err(err) => {
            if err.is_file_not_found_error() {
                info!("Config file not found, using defaults");
            } else {
                error!("Failed to load config, using defaults: {}", err);
            }
            Config::default()
        },
    }
}

pub async fn run_application(cli: Cli) -> Result<(), AppRunError> {
    let mut config_io = match &cli.config {
        Some(path) => ConfigIO::open(path)?,
        None => ConfigIO::new_sync()?,
    };

    // only one instance may drive the radio at a time
    let mut locker = config_io.locker()?;
    let _lock = locker.lock()?;

    let mut config = load_config(&config_io).await;
    cli.apply(&mut config);
    if cli.save_config {
        config_io.save(&config).await?;
    }

    let transport: Arc<dyn TransportAdapter> = if cli.simulate {
        info!("Using the simulated transport");
        Arc::new(SimulatedTransport::demo())
    } else {
        Arc::new(BtleplugTransport::new(config.target_service_id).await?)
    };

    let cancel = CancellationToken::new();
    let (controller, driver) = connection_controller(transport, config, cancel.clone());
    let (_, mut events) = controller.events();

    let result = match &cli.mode {
        Mode::Scan => scan(&controller, &mut events).await.map(|_| ()),
        Mode::Connect { address } => stream(&controller, &mut events, address.as_deref()).await,
    };

    cancel.cancel();
    if let Err(err) = driver.await {
        warn!("Connection controller task failed: {:?}", err);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::constants::{make_default_characteristic_uuid, make_default_service_uuid};
    use crate::device::types::CharacteristicInfo;

    #[test]
    fn payloads_are_printed_as_hex() {
        assert_eq!(format_payload(&[0x01, 0xab, 0xff]), "01 ab ff");
        assert_eq!(format_payload(&[]), "");
    }

    #[test]
    fn services_are_listed_with_their_characteristics() {
        let services = vec![ServiceInfo {
            uuid: make_default_service_uuid(),
            characteristics: vec![CharacteristicInfo {
                uuid: make_default_characteristic_uuid(),
                properties: vec!["READ".to_string(), "NOTIFY".to_string()],
                descriptor_count: 1,
            }],
        }];

        assert_eq!(format_services(&services), vec![
            "  service 6e400001-b5a3-f393-e0a9-e50e24dcca9e".to_string(),
            "    characteristic 6e400003-b5a3-f393-e0a9-e50e24dcca9e [READ | NOTIFY] (1 descriptors)".to_string(),
        ]);
    }

    #[tokio::test]
    async fn scan_lists_the_simulated_devices() {
        let transport = SimulatedTransport::demo();
        transport.set_discover_delay(std::time::Duration::ZERO);
        let (controller, _driver) = connection_controller(Arc::new(transport), Config::default(), CancellationToken::new());
        let (_, mut events) = controller.events();

        let devices = scan(&controller, &mut events).await.unwrap();
        let names: Vec<&str> = devices.iter().map(|d| d.display_name.as_str()).collect();
        assert_eq!(names, vec!["Scale1", "Scale2"]);
    }

    #[tokio::test]
    async fn failed_scan_reports_the_reason() {
        let transport = SimulatedTransport::new();
        let (controller, _driver) = connection_controller(Arc::new(transport), Config::default(), CancellationToken::new());
        let (_, mut events) = controller.events();

        match scan(&controller, &mut events).await {
            Err(AppRunError::Session(message)) => assert!(message.starts_with("No devices advertising")),
            other => panic!("unexpected scan result {:?}", other.map(|d| d.len())),
        }
    }
}

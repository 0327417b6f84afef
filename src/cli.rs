use std::path::PathBuf;
use std::time::Duration;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::config::types::Config;

#[derive(Parser, Debug)]
#[command(author, version)]
#[command(about = "Discovers a BLE peripheral advertising a known service, connects to it and prints its notifications.", long_about = None)]
pub struct Cli {
    /// Use an in-memory peripheral instead of the bluetooth radio
    #[arg(long)]
    pub simulate: bool,

    /// Path to the config file. Defaults to a .json file next to the executable if present,
    /// otherwise to the user's config directory.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// How long to scan for, e.g. "1s" or "2500ms"
    #[arg(long, value_parser = humantime::parse_duration)]
    pub discovery_timeout: Option<Duration>,

    /// Only offer peripherals advertising this service
    #[arg(long)]
    pub service: Option<Uuid>,

    /// Stream notifications of this characteristic
    #[arg(long)]
    pub characteristic: Option<Uuid>,

    /// Connect again (once) when the link fails
    #[arg(long)]
    pub auto_reconnect: bool,

    /// Write the effective configuration back to the config file
    #[arg(long)]
    pub save_config: bool,

    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Scan once and list the peripherals that were found
    Scan,

    /// Scan, connect and print notifications until interrupted with Ctrl-C
    Connect {
        /// Address of the peripheral to connect to; the first one found is used when omitted
        #[arg(long)]
        address: Option<String>,
    },
}

impl Cli {
    /// Command line flags win over the config file.
    pub fn apply(&self, config: &mut Config) {
        if let Some(timeout) = self.discovery_timeout {
            config.discovery_timeout_ms = timeout.as_millis() as u64;
        }
        if let Some(service) = self.service {
            config.target_service_id = service;
        }
        if let Some(characteristic) = self.characteristic {
            config.target_characteristic_id = characteristic;
        }
        if self.auto_reconnect {
            config.auto_reconnect = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_the_config_file() {
        let cli = Cli::try_parse_from([
            "peripheral-link",
            "--discovery-timeout", "2s 500ms",
            "--auto-reconnect",
            "--service", "0000180d-0000-1000-8000-00805f9b34fb",
            "connect", "--address", "AA:BB",
        ]).unwrap();

        let mut config = Config::default();
        cli.apply(&mut config);

        assert_eq!(config.discovery_timeout_ms, 2500);
        assert!(config.auto_reconnect);
        assert_eq!(config.target_service_id.to_string(), "0000180d-0000-1000-8000-00805f9b34fb");
        assert_eq!(config.target_characteristic_id, Config::default().target_characteristic_id);
        assert_eq!(cli.mode, Mode::Connect { address: Some("AA:BB".to_string()) });
    }

    #[test]
    fn without_flags_the_config_is_untouched() {
        let cli = Cli::try_parse_from(["peripheral-link", "--simulate", "scan"]).unwrap();

        let mut config = Config::default();
        cli.apply(&mut config);

        assert!(cli.simulate);
        assert_eq!(config, Config::default());
    }

    #[test]
    fn a_mode_is_required() {
        assert!(Cli::try_parse_from(["peripheral-link"]).is_err());
    }
}

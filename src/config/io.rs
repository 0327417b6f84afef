use std::env::current_exe;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::str;
use std::sync::{Arc, Mutex};
use directories_next::ProjectDirs;
use fd_lock::{RwLock, RwLockWriteGuard};
use log::{debug, info, warn};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::config::types::Config;
use crate::error::ConfigError;

const CONFIG_FILE_NAME: &str = "peripheral-link.json";

// `<exe>.json` next to the executable, e.g. /opt/peripheral-link.json. Only used when it exists.
fn portable_config_path() -> Option<PathBuf> {
    let mut path = current_exe()
        .map_err(|err| warn!("Could not determine the executable path: {:?}", err))
        .ok()?;

    if !path.set_extension("json") {
        warn!("Executable path has no file name: {}", path.display());
        return None;
    }

    match std::fs::metadata(&path) {
        Ok(metadata) if metadata.is_file() => Some(path),
        Ok(_) => None,
        Err(err) => {
            debug!("No portable config at {} ({:?})", path.display(), err);
            None
        },
    }
}

// The platform config directory, e.g. ~/.config/peripheral-link on linux.
fn platform_config_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "peripheral-link", "peripheral-link")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

fn config_path() -> Result<PathBuf, ConfigError> {
    portable_config_path()
        .or_else(platform_config_path)
        .ok_or(ConfigError::NoConfigPath)
}

/// Exclusive lock on the config file, held for as long as the application drives the radio.
pub struct ConfigIOLocker {
    rw_lock: RwLock<std::fs::File>,
}

impl ConfigIOLocker {
    /// Fails with `ConfigError::CanNotLock` when another instance holds the lock.
    pub fn lock(&mut self) -> Result<RwLockWriteGuard<std::fs::File>, ConfigError> {
        self.rw_lock.try_write().map_err(|source| ConfigError::CanNotLock { source })
    }
}

/// Reads and writes the JSON config file. Clones share the same open file.
#[derive(Clone)]
pub struct ConfigIO {
    file: Arc<Mutex<std::fs::File>>,
}

impl ConfigIO {
    /// Opens the config file at its default location, creating it if needed.
    pub fn new_sync() -> Result<Self, ConfigError> {
        Self::open(&config_path()?)
    }

    pub fn open(path: &Path) -> Result<Self, ConfigError> {
        info!("Using config file {}", path.display());

        if let Some(directory) = path.parent() {
            std::fs::create_dir_all(directory)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        Ok(ConfigIO { file: Arc::new(Mutex::new(file)) })
    }

    pub fn locker(&mut self) -> Result<ConfigIOLocker, ConfigError> {
        Ok(ConfigIOLocker {
            rw_lock: RwLock::new(self.duplicate()?),
        })
    }

    // A second handle to the same open file, so that async io does not need the mutex.
    fn duplicate(&self) -> Result<std::fs::File, ConfigError> {
        let file = self.file.lock().expect("Failed to lock ConfigIO file");
        Ok(file.try_clone()?)
    }

    /// An empty file reads as the default config.
    pub async fn read(&self) -> Result<Config, ConfigError> {
        let mut file = File::from_std(self.duplicate()?);
        debug!("Reading config file");

        let mut content = Vec::new();
        file.rewind().await?;
        file.read_to_end(&mut content).await?;

        if content.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Config::default());
        }

        Ok(serde_json::from_str(str::from_utf8(&content)?)?)
    }

    pub async fn save(&self, config: &Config) -> Result<(), ConfigError> {
        let mut file = File::from_std(self.duplicate()?);
        debug!("Saving config file");

        let content = serde_json::to_string_pretty(config)?;
        file.rewind().await?;
        file.set_len(0).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        let path = std::env::temp_dir()
            .join(format!("peripheral-link-test-{}", std::process::id()))
            .join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn empty_file_reads_as_defaults() {
        let config_io = ConfigIO::open(&scratch_path("empty.json")).unwrap();
        assert_eq!(config_io.read().await.unwrap(), Config::default());
    }

    #[tokio::test]
    async fn saved_config_is_read_back() {
        let config_io = ConfigIO::open(&scratch_path("saved.json")).unwrap();
        let config = Config { auto_reconnect: true, notification_retention: 8, ..Config::default() };

        config_io.save(&config).await.unwrap();
        assert_eq!(config_io.read().await.unwrap(), config);
    }

    #[test]
    fn a_second_instance_can_not_take_the_lock() {
        let path = scratch_path("locked.json");
        let mut first = ConfigIO::open(&path).unwrap();
        let mut second = ConfigIO::open(&path).unwrap();

        let mut first_locker = first.locker().unwrap();
        let _held = first_locker.lock().unwrap();

        let mut second_locker = second.locker().unwrap();
        assert!(matches!(second_locker.lock(), Err(ConfigError::CanNotLock { .. })));
    }

    #[tokio::test]
    async fn malformed_file_is_a_json_error() {
        let path = scratch_path("broken.json");
        let config_io = ConfigIO::open(&path).unwrap();
        std::fs::write(&path, "{ not json").unwrap();

        let err = config_io.read().await.unwrap_err();
        assert!(matches!(err, ConfigError::JsonError { .. }));
        assert!(!err.is_file_not_found_error());
    }
}

//! Persistent configuration
//!
//! The [ConfigStore] handles loading and saving of the configuration file.
//! Only the firmware server host is stored. Storage that is missing or cannot
//! be parsed never surfaces as an error when reading: the default is used
//! instead, with a single warning.

use std::{
    fs::{create_dir_all, read_to_string, write},
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Host used when none has been configured
pub const DEFAULT_HOST: &str = "hadasklugv2-dev.smartguest.ai";

/// The one recognized configuration key
pub const HOST_KEY: &str = "host";

const CONFIG_FILE: &str = "hexflash.toml";
const FIRMWARE_ENDPOINT: &str = "/webapp/devices/getFirmware";

/// Contents of the configuration file
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
pub struct ConfigRecord {
    /// Firmware server, with or without a scheme
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

#[derive(Default)]
struct State {
    record: Option<ConfigRecord>,
    /// Warnings issued about unreadable storage
    warnings: usize,
}

/// Lazily loaded, write-through configuration
pub struct ConfigStore {
    path: PathBuf,
    state: Mutex<State>,
}

impl ConfigStore {
    /// Store backed by the file at `path`. Nothing is read until first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::default(),
        }
    }

    /// Store backed by the configuration file found by [find_config_path].
    pub fn locate() -> Self {
        Self::new(find_config_path(CONFIG_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Value of `key`, or `default` if it is unset, empty, or unknown.
    pub fn get(&self, key: &str, default: &str) -> String {
        let mut state = self.loaded();
        let record = self.record(&mut state);

        match key {
            HOST_KEY => record
                .host
                .as_deref()
                .map(str::trim)
                .filter(|host| !host.is_empty())
                .unwrap_or(default)
                .to_owned(),
            _ => default.to_owned(),
        }
    }

    /// Set `key` to `value` and write the file immediately.
    pub fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        if key != HOST_KEY {
            return Err(Error::UnknownConfigKey(key.to_owned()));
        }

        let mut state = self.loaded();
        let mut record = self.record(&mut state).clone();
        record.host = Some(value.to_owned());

        self.write_config(&record)?;
        state.record = Some(record);

        Ok(())
    }

    /// The configured firmware server host
    pub fn host(&self) -> String {
        self.get(HOST_KEY, DEFAULT_HOST)
    }

    /// Normalize and store a new host, returning what was stored. Blank input
    /// leaves the configuration untouched.
    pub fn set_host(&self, host: &str) -> Result<Option<String>, Error> {
        let Some(host) = normalize_host(host) else {
            return Ok(None);
        };
        self.set(HOST_KEY, &host)?;

        Ok(Some(host))
    }

    /// URL of the firmware listing on the configured host
    pub fn api_url(&self) -> String {
        api_url(&self.host())
    }

    fn loaded(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record<'a>(&self, state: &'a mut State) -> &'a ConfigRecord {
        if state.record.is_none() {
            let record = match self.read_config() {
                Ok(record) => record,
                Err(reason) => {
                    if state.warnings == 0 {
                        warn!(
                            "Ignoring configuration file {}: {reason}",
                            self.path.display()
                        );
                        state.warnings += 1;
                    }
                    ConfigRecord::default()
                }
            };
            debug!("Config: {:#?}", &record);
            state.record = Some(record);
        }

        state.record.get_or_insert_with(ConfigRecord::default)
    }

    fn read_config(&self) -> Result<ConfigRecord, String> {
        match read_to_string(&self.path) {
            Ok(data) => toml::from_str(&data).map_err(|e| e.to_string()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No configuration file at {}", self.path.display());
                Ok(ConfigRecord::default())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    fn write_config(&self, record: &ConfigRecord) -> Result<(), Error> {
        let config_error = |source: io::Error| Error::Config {
            path: self.path.clone(),
            source,
        };

        let serialized = toml::to_string(record)
            .map_err(|e| config_error(io::Error::new(ErrorKind::InvalidData, e)))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_dir_all(parent).map_err(config_error)?;
        }

        write(&self.path, serialized).map_err(config_error)
    }
}

/// Trim a user supplied host, drop trailing slashes and default the scheme to
/// `https://`. Returns `None` for blank input.
pub fn normalize_host(input: &str) -> Option<String> {
    let host = input.trim().trim_end_matches('/');
    if host.is_empty() {
        return None;
    }

    if has_scheme(host) {
        Some(host.to_owned())
    } else {
        Some(format!("https://{host}"))
    }
}

/// URL of the firmware listing on `host`
pub fn api_url(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');

    if has_scheme(host) {
        format!("{host}{FIRMWARE_ENDPOINT}")
    } else {
        format!("https://{host}{FIRMWARE_ENDPOINT}")
    }
}

fn has_scheme(host: &str) -> bool {
    host.starts_with("https://") || host.starts_with("http://")
}

/// Where the configuration file lives: the working directory or its parent
/// if a file is already there, otherwise the per-user configuration directory.
pub fn find_config_path(filename: &str) -> PathBuf {
    if let Ok(cwd) = std::env::current_dir() {
        let local_config = cwd.join(filename);
        if local_config.exists() {
            return local_config;
        }
        if let Some(parent_folder) = cwd.parent() {
            let workspace_config = parent_folder.join(filename);
            if workspace_config.exists() {
                return workspace_config;
            }
        }
    }

    match ProjectDirs::from("", "", "hexflash") {
        Some(project_dirs) => project_dirs.config_dir().join(filename),
        None => PathBuf::from(filename),
    }
}

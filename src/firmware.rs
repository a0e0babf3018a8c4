//! Firmware catalogue served by the configured host
//!
//! The listing endpoint answers with `{"firmware": [{"name", "version",
//! "url"}]}`. Entries without a URL are listed but cannot be downloaded.

use std::{
    fmt,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use log::{debug, info};
use reqwest::blocking::Client;
use serde::Deserialize;

use crate::error::Error;

const LIST_TIMEOUT: Duration = Duration::from_secs(15);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const FALLBACK_FILE_NAME: &str = "firmware.bin";

/// One firmware image offered by the server
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FirmwareDescriptor {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub url: Option<String>,
}

fn default_name() -> String {
    "fw".to_owned()
}

impl fmt::Display for FirmwareDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}", self.name, self.version)
    }
}

#[derive(Debug, Deserialize)]
struct Listing {
    #[serde(default)]
    firmware: Vec<FirmwareDescriptor>,
}

/// Parse the body of a listing response.
pub fn parse_listing(body: &str) -> Result<Vec<FirmwareDescriptor>, Error> {
    let listing: Listing = serde_json::from_str(body)
        .map_err(|e| Error::Network(format!("malformed firmware listing: {e}")))?;

    Ok(listing.firmware)
}

/// File name a download of `url` is saved under
pub fn file_name_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let path = path.split_once("://").map_or(path, |(_, rest)| rest);

    match path.split_once('/') {
        Some((_, resource)) => match resource.rsplit('/').next() {
            Some(name) if !name.is_empty() => name.to_owned(),
            _ => FALLBACK_FILE_NAME.to_owned(),
        },
        None => FALLBACK_FILE_NAME.to_owned(),
    }
}

/// Somewhere firmware images can be listed and fetched from
pub trait FirmwareSource {
    fn list_firmwares(&self) -> Result<Vec<FirmwareDescriptor>, Error>;

    /// Download `firmware` into `dir`, returning the path of the saved file.
    fn download(&self, firmware: &FirmwareDescriptor, dir: &Path) -> Result<PathBuf, Error>;
}

/// Firmware catalogue reached over HTTP(S)
pub struct HttpFirmwareSource {
    api_url: String,
    client: Client,
}

impl HttpFirmwareSource {
    pub fn new(api_url: impl Into<String>) -> Result<Self, Error> {
        let client = Client::builder().timeout(DOWNLOAD_TIMEOUT).build()?;

        Ok(Self {
            api_url: api_url.into(),
            client,
        })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }
}

impl FirmwareSource for HttpFirmwareSource {
    fn list_firmwares(&self) -> Result<Vec<FirmwareDescriptor>, Error> {
        debug!("Fetching firmware listing from {}", self.api_url);

        let body = self
            .client
            .get(&self.api_url)
            .timeout(LIST_TIMEOUT)
            .send()?
            .error_for_status()?
            .text()?;

        parse_listing(&body)
    }

    fn download(&self, firmware: &FirmwareDescriptor, dir: &Path) -> Result<PathBuf, Error> {
        let url = firmware
            .url
            .as_deref()
            .ok_or_else(|| Error::Network(format!("{firmware} has no download URL")))?;

        info!("Downloading firmware: {url}");
        let bytes = self
            .client
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()?
            .error_for_status()?
            .bytes()?;

        let path = dir.join(file_name_from_url(url));
        fs::write(&path, &bytes)?;
        info!("Saved firmware to {}", path.display());

        Ok(path)
    }
}

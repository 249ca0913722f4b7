//! Pairing deep links
//!
//! Two link shapes identify a peripheral:
//! - path form: `remoteled://connect/{mac}/{service}/{char}/{key}[?deviceId=..]`
//! - query form: `https://host/detail?mac=..&service=..&char=..&key=..&machineId=..`
//!
//! Short 16/32-bit UUIDs are expanded with the Bluetooth base UUID. Path
//! segments are percent-decoded.

use percent_encoding::percent_decode_str;
use reqwest::Url;
use thiserror::Error;
use uuid::Uuid;

/// Suffix of the Bluetooth base UUID `0000XXXX-0000-1000-8000-00805f9b34fb`
const BLUETOOTH_BASE_SUFFIX: &str = "-0000-1000-8000-00805f9b34fb";

#[derive(Error, Debug, PartialEq)]
pub enum PairingError {
    #[error("invalid deep link: {0}")]
    InvalidUrl(String),

    #[error("deep link is missing `{0}`")]
    MissingField(&'static str),

    #[error("invalid Bluetooth address: {0}")]
    InvalidAddress(String),

    #[error("invalid UUID: {0}")]
    InvalidUuid(String),
}

/// Everything needed to reach the LED characteristic of one peripheral
#[derive(Debug, Clone, PartialEq)]
pub struct PairingInfo {
    /// MAC address, upper-case, colon separated
    pub address: String,
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    /// Shared static key sent inside every command
    pub ble_key: String,
    /// Backend device id, when the link carries one
    pub device_id: Option<String>,
}

impl PairingInfo {
    /// Parse either deep link form
    pub fn parse(link: &str) -> Result<Self, PairingError> {
        let url = Url::parse(link.trim()).map_err(|e| PairingError::InvalidUrl(e.to_string()))?;

        match url.scheme() {
            "http" | "https" => Self::from_query(&url),
            _ => Self::from_path(&url),
        }
    }

    fn from_query(url: &Url) -> Result<Self, PairingError> {
        let param = |name: &str| -> Option<String> {
            url.query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
                .filter(|v| !v.is_empty())
        };

        let address = param("mac").ok_or(PairingError::MissingField("mac"))?;
        let service = param("service").ok_or(PairingError::MissingField("service"))?;
        let characteristic = param("char").ok_or(PairingError::MissingField("char"))?;
        let ble_key = param("key").ok_or(PairingError::MissingField("key"))?;

        Ok(Self {
            address: normalize_address(&address)?,
            service_uuid: expand_uuid(&service)?,
            characteristic_uuid: expand_uuid(&characteristic)?,
            ble_key,
            device_id: param("machineId"),
        })
    }

    fn from_path(url: &Url) -> Result<Self, PairingError> {
        let mut segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();

        // `scheme:///connect/...` puts the action in the path instead of the host
        match url.host_str() {
            Some("connect") => {}
            None | Some("") if segments.first() == Some(&"connect") => {
                segments.remove(0);
            }
            other => {
                return Err(PairingError::InvalidUrl(format!(
                    "expected a `connect` link, got `{}`",
                    other.unwrap_or_default()
                )));
            }
        }

        let segments = segments
            .into_iter()
            .map(decode_segment)
            .collect::<Result<Vec<_>, _>>()?;
        let mut fields = segments.iter().map(String::as_str);
        let address = fields.next().ok_or(PairingError::MissingField("mac"))?;
        let service = fields.next().ok_or(PairingError::MissingField("service"))?;
        let characteristic = fields.next().ok_or(PairingError::MissingField("char"))?;
        let ble_key = fields.next().ok_or(PairingError::MissingField("key"))?;

        let device_id = url
            .query_pairs()
            .find(|(k, _)| k == "deviceId")
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.is_empty());

        Ok(Self {
            address: normalize_address(address)?,
            service_uuid: expand_uuid(service)?,
            characteristic_uuid: expand_uuid(characteristic)?,
            ble_key: ble_key.to_string(),
            device_id,
        })
    }
}

fn decode_segment(segment: &str) -> Result<String, PairingError> {
    percent_decode_str(segment)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| PairingError::InvalidUrl(format!("bad escape in `{}`: {}", segment, e)))
}

/// Expand a short Bluetooth UUID, or parse a full one
pub fn expand_uuid(value: &str) -> Result<Uuid, PairingError> {
    let value = value.trim();
    let is_hex = |s: &str| s.chars().all(|c| c.is_ascii_hexdigit());

    let full = match value.len() {
        4 if is_hex(value) => format!("0000{}{}", value, BLUETOOTH_BASE_SUFFIX),
        8 if is_hex(value) => format!("{}{}", value, BLUETOOTH_BASE_SUFFIX),
        _ => value.to_string(),
    };

    Uuid::parse_str(&full).map_err(|_| PairingError::InvalidUuid(value.to_string()))
}

fn normalize_address(value: &str) -> Result<String, PairingError> {
    let octets: Vec<&str> = value.split(':').collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));

    if !valid {
        return Err(PairingError::InvalidAddress(value.to_string()));
    }
    Ok(value.to_ascii_uppercase())
}

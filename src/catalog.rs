//! Device capability catalog and channel identifiers.
//!
//! The catalog is a JSON document listing every supported adapter type with
//! its channel count, CAN-FD capability, supported bit-rates and the table of
//! configuration keys the adapter understands. It is loaded once and shared
//! read-only by every channel of that device type.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const BUILTIN_CATALOG: &str = include_str!("devices.json");

/// Configuration keys a device may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConfigKey {
    RawFilter,
    ErrorFilter,
    Loopback,
    ReceiveOwn,
    CanFd,
    BitRate,
    DataBitRate,
}

impl ConfigKey {
    pub fn name(self) -> &'static str {
        match self {
            ConfigKey::RawFilter => "RawFilter",
            ConfigKey::ErrorFilter => "ErrorFilter",
            ConfigKey::Loopback => "Loopback",
            ConfigKey::ReceiveOwn => "ReceiveOwn",
            ConfigKey::CanFd => "CanFd",
            ConfigKey::BitRate => "BitRate",
            ConfigKey::DataBitRate => "DataBitRate",
        }
    }
}

impl FromStr for ConfigKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            // Older catalogs spell it without the trailing R.
            "RAWFILTER" | "RAWFILTE" => Ok(ConfigKey::RawFilter),
            "ERRORFILTER" => Ok(ConfigKey::ErrorFilter),
            "LOOPBACK" => Ok(ConfigKey::Loopback),
            "RECEIVEOWN" => Ok(ConfigKey::ReceiveOwn),
            "CANFD" => Ok(ConfigKey::CanFd),
            "BITRATE" => Ok(ConfigKey::BitRate),
            "DATABITRATE" => Ok(ConfigKey::DataBitRate),
            _ => Err(Error::InvalidChannel(format!("unknown configuration key {s}"))),
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a configuration value reaches the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApplyMethod {
    /// Consumed by channel init; no separate native call (`ZCAN_INITCAN`).
    InitTimeOnly,
    /// `ZCAN_SetValue` (`ZCAN_SETVALUE`).
    DirectValueSet,
    /// `IProperty::SetValue` (`IPROPERTY_SETVALUE`).
    PropertyInterfaceSet,
}

impl FromStr for ApplyMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ZCAN_INITCAN" => Ok(ApplyMethod::InitTimeOnly),
            "ZCAN_SETVALUE" => Ok(ApplyMethod::DirectValueSet),
            "IPROPERTY_SETVALUE" => Ok(ApplyMethod::PropertyInterfaceSet),
            _ => Err(Error::Catalog(format!("unknown configuration method {s}"))),
        }
    }
}

/// Point in the open sequence at which a value is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApplyPhase {
    BeforeInit,
    BeforeStart,
    AfterStart,
}

impl FromStr for ApplyPhase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BEFORE_INIT_CAN" => Ok(ApplyPhase::BeforeInit),
            "BEFORE_START_CAN" => Ok(ApplyPhase::BeforeStart),
            "AFTER_START_CAN" => Ok(ApplyPhase::AfterStart),
            _ => Err(Error::Catalog(format!("unknown configuration sequence {s}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    UInt(u32),
}

impl ConfigValue {
    pub fn as_bool(self) -> bool {
        match self {
            ConfigValue::Bool(b) => b,
            ConfigValue::UInt(n) => n != 0,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            ConfigValue::Bool(b) => b as u32,
            ConfigValue::UInt(n) => n,
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Bool(value)
    }
}

impl From<u32> for ConfigValue {
    fn from(value: u32) -> Self {
        ConfigValue::UInt(value)
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(b) => write!(f, "{b}"),
            ConfigValue::UInt(n) => write!(f, "{n}"),
        }
    }
}

/// Values requested by the caller, keyed by configuration key.
pub type ConfigMap = BTreeMap<ConfigKey, ConfigValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigDescriptor {
    pub key: ConfigKey,
    pub configurable: bool,
    pub method: ApplyMethod,
    pub phase: ApplyPhase,
}

/// Capabilities of one adapter type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Upper-cased type name, e.g. `USBCANFD_200U`.
    pub name: String,
    /// Native device type passed to `ZCAN_OpenDevice`.
    pub type_id: u32,
    pub fd_capable: bool,
    pub channel_count: u32,
    pub supported_bitrates: BTreeSet<u32>,
    pub supported_data_bitrates: BTreeSet<u32>,
    pub configuration_table: BTreeMap<ConfigKey, ConfigDescriptor>,
}

impl DeviceDescriptor {
    pub fn descriptor(&self, key: ConfigKey) -> Option<&ConfigDescriptor> {
        self.configuration_table.get(&key)
    }
}

#[derive(Deserialize)]
struct RawCatalog {
    devices: Vec<RawDevice>,
}

#[derive(Deserialize)]
struct RawDevice {
    #[serde(rename = "type")]
    name: String,
    id: u32,
    #[serde(default)]
    fd: bool,
    #[serde(default)]
    channels: u32,
    #[serde(default)]
    configurations: BTreeMap<String, RawConfig>,
}

#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    configurable: Option<bool>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    sequence: Option<String>,
    #[serde(default)]
    values: Vec<u32>,
}

impl RawDevice {
    fn into_descriptor(self) -> Result<DeviceDescriptor> {
        let mut device = DeviceDescriptor {
            name: self.name.to_ascii_uppercase(),
            type_id: self.id,
            fd_capable: self.fd,
            channel_count: self.channels,
            supported_bitrates: BTreeSet::new(),
            supported_data_bitrates: BTreeSet::new(),
            configuration_table: BTreeMap::new(),
        };

        for (name, raw) in self.configurations {
            if raw.configurable == Some(false) {
                continue;
            }
            let Ok(key) = name.parse::<ConfigKey>() else {
                debug!("{}: ignoring unknown configuration {}", device.name, name);
                continue;
            };
            let method = match raw.method.as_deref() {
                Some(method) => method.parse()?,
                None => ApplyMethod::DirectValueSet,
            };
            let phase = match raw.sequence.as_deref() {
                Some(sequence) => sequence.parse()?,
                None => ApplyPhase::BeforeInit,
            };
            let values = raw.values.into_iter().filter(|v| *v != 0);
            match key {
                ConfigKey::BitRate => device.supported_bitrates.extend(values),
                ConfigKey::DataBitRate => device.supported_data_bitrates.extend(values),
                _ => {}
            }
            device.configuration_table.insert(
                key,
                ConfigDescriptor {
                    key,
                    configurable: raw.configurable.unwrap_or(false),
                    method,
                    phase,
                },
            );
        }
        Ok(device)
    }
}

/// Immutable lookup table from device type name to [`DeviceDescriptor`].
#[derive(Debug, Clone, Default)]
pub struct DeviceCatalog {
    devices: Vec<Arc<DeviceDescriptor>>,
}

impl DeviceCatalog {
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawCatalog =
            serde_json::from_str(json).map_err(|e| Error::Catalog(e.to_string()))?;
        let devices = raw
            .devices
            .into_iter()
            .map(|device| device.into_descriptor().map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { devices })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Catalog(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    /// Catalog compiled into the crate, covering the common USBCAN and
    /// USBCANFD adapters.
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_CATALOG)
    }

    /// Case-insensitive lookup by type name.
    pub fn lookup(&self, name: &str) -> Option<Arc<DeviceDescriptor>> {
        self.devices
            .iter()
            .find(|device| device.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn devices(&self) -> &[Arc<DeviceDescriptor>] {
        &self.devices
    }
}

/// Identifies one logical channel: device type, device index and channel index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId {
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default, rename = "index")]
    pub device_index: u32,
    #[serde(default, rename = "channel")]
    pub channel_index: u32,
}

impl ChannelId {
    pub fn new(device_type: &str, device_index: u32, channel_index: u32) -> Self {
        Self {
            device_type: device_type.to_ascii_uppercase(),
            device_index,
            channel_index,
        }
    }

    /// Accepts `USBCANFD_200U`, `USBCANFD_200U/0/1` or
    /// `{"type":"USBCANFD_200U","index":0,"channel":1}`.
    pub fn parse(interface: &str) -> Result<Self> {
        let interface = interface.trim();

        let mut id = if interface.starts_with('{') {
            serde_json::from_str::<ChannelId>(interface)
                .map_err(|e| Error::InvalidChannel(format!("{interface}: {e}")))?
        } else {
            let mut parts = interface.split('/');
            let device_type = parts.next().unwrap_or_default().trim();
            let mut number = |what: &str| -> Result<u32> {
                match parts.next() {
                    Some(part) => part.trim().parse().map_err(|_| {
                        Error::InvalidChannel(format!("{interface}: bad {what} '{part}'"))
                    }),
                    None => Ok(0),
                }
            };
            let device_index = number("device index")?;
            let channel_index = number("channel index")?;
            if parts.next().is_some() {
                return Err(Error::InvalidChannel(format!(
                    "{interface}: expected TYPE/index/channel"
                )));
            }
            ChannelId::new(device_type, device_index, channel_index)
        };

        id.device_type = id.device_type.trim().to_ascii_uppercase();
        if id.device_type.is_empty() {
            return Err(Error::InvalidChannel(format!(
                "{interface}: missing device type"
            )));
        }
        Ok(id)
    }
}

impl FromStr for ChannelId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.device_type, self.device_index, self.channel_index
        )
    }
}

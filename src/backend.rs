//! Entry point for hosts: lists the catalog and hands out channels.

use std::path::PathBuf;
use std::sync::Arc;

use log::info;
use serde::Serialize;

use crate::catalog::{ChannelId, ConfigMap, DeviceCatalog};
use crate::channel::ChannelController;
use crate::error::{Error, Result};
use crate::native::mock::MockApi;
use crate::native::{LibraryApi, ZlgApi};
use crate::registry::HandleRegistry;

/// One advertised adapter type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub channel_count: u32,
    pub fd_capable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    /// Catalog file; the built-in catalog when `None`.
    pub catalog: Option<PathBuf>,
    /// Vendor library; `ZLGCAN_LIBRARY` or the platform default when `None`.
    pub library: Option<PathBuf>,
    /// Use an in-process loopback adapter instead of the vendor library.
    pub simulate: bool,
}

pub struct ZlgCanBackend {
    catalog: DeviceCatalog,
    api: Arc<dyn ZlgApi>,
    registry: Arc<HandleRegistry>,
}

impl ZlgCanBackend {
    pub fn new(catalog: DeviceCatalog, api: Arc<dyn ZlgApi>) -> Self {
        let registry = HandleRegistry::new(api.clone());
        Self {
            catalog,
            api,
            registry,
        }
    }

    pub fn with_options(options: &BackendOptions) -> Result<Self> {
        let catalog = match &options.catalog {
            Some(path) => DeviceCatalog::load(path)?,
            None => DeviceCatalog::builtin()?,
        };
        let api: Arc<dyn ZlgApi> = if options.simulate {
            info!("Using the simulated ZLG adapter");
            Arc::new(MockApi::with_loopback())
        } else {
            match &options.library {
                Some(path) => Arc::new(LibraryApi::load(path)?),
                None => Arc::new(LibraryApi::load_default()?),
            }
        };
        Ok(Self::new(catalog, api))
    }

    pub fn catalog(&self) -> &DeviceCatalog {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    pub fn available_devices(&self) -> Vec<DeviceInfo> {
        self.catalog
            .devices()
            .iter()
            .map(|device| DeviceInfo {
                name: device.name.clone(),
                channel_count: device.channel_count.max(1),
                fd_capable: device.fd_capable,
            })
            .collect()
    }

    /// Creates a closed channel for `interface` (see [`ChannelId::parse`]).
    pub fn create_channel(&self, interface: &str) -> Result<ChannelController> {
        let id = ChannelId::parse(interface)?;
        let device = self.catalog.lookup(&id.device_type).ok_or_else(|| {
            Error::InvalidChannel(format!("unknown device type {}", id.device_type))
        })?;
        Ok(ChannelController::new(
            self.api.clone(),
            self.registry.clone(),
            device,
            id.device_index,
            id.channel_index,
        ))
    }

    /// Creates, configures and opens a channel.
    pub fn open(&self, interface: &str, config: &ConfigMap) -> Result<Arc<ChannelController>> {
        let controller = self.create_channel(interface)?;
        for (&key, &value) in config {
            controller.set_configuration(key, value)?;
        }
        controller.open()?;
        Ok(Arc::new(controller))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ConfigKey, ConfigValue};
    use crate::channel::ChannelState;

    fn backend() -> (Arc<MockApi>, ZlgCanBackend) {
        let api = Arc::new(MockApi::new());
        let backend = ZlgCanBackend::new(DeviceCatalog::builtin().unwrap(), api.clone());
        (api, backend)
    }

    #[test]
    fn lists_every_catalog_device() {
        let (_api, backend) = backend();
        let devices = backend.available_devices();
        assert_eq!(devices.len(), backend.catalog().devices().len());
        let fd = devices.iter().find(|d| d.name == "USBCANFD_200U").unwrap();
        assert_eq!(fd.channel_count, 2);
        assert!(fd.fd_capable);
    }

    #[test]
    fn zero_channel_devices_are_listed_with_one() {
        let json = r#"{"devices":[{"type":"odd","id":7,"channels":0}]}"#;
        let backend = ZlgCanBackend::new(
            DeviceCatalog::from_json(json).unwrap(),
            Arc::new(MockApi::new()),
        );
        assert_eq!(backend.available_devices()[0].channel_count, 1);
    }

    #[test]
    fn unknown_device_type_is_invalid() {
        let (_api, backend) = backend();
        assert!(matches!(
            backend.create_channel("NOT_A_DEVICE"),
            Err(Error::InvalidChannel(_))
        ));
    }

    #[test]
    fn open_applies_requested_configuration() {
        let (api, backend) = backend();
        let config = ConfigMap::from([
            (ConfigKey::CanFd, ConfigValue::Bool(true)),
            (ConfigKey::BitRate, ConfigValue::UInt(1_000_000)),
        ]);
        let channel = backend.open("USBCANFD_200U/0/1", &config).unwrap();
        assert_eq!(channel.state(), ChannelState::Open);
        assert!(channel.is_fd_enabled());
        assert_eq!(
            api.values(),
            vec![("1/canfd_abit_baud_rate".to_string(), "1000000".to_string())]
        );
        assert_eq!(backend.registry().holders(41, 0), vec![1]);
    }

    #[test]
    fn simulated_backend_needs_no_library() {
        let backend = ZlgCanBackend::with_options(&BackendOptions {
            simulate: true,
            ..Default::default()
        })
        .unwrap();
        let channel = backend.open("USBCAN2/0/0", &ConfigMap::new()).unwrap();
        assert_eq!(channel.state(), ChannelState::Open);
    }
}

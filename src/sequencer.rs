//! Applies the caller's configuration at the three points of the open sequence.

use log::debug;

use crate::catalog::{ApplyMethod, ApplyPhase, ConfigKey, ConfigMap, DeviceDescriptor};
use crate::error::{Error, Result};
use crate::native::{ChannelHandle, DeviceHandle, PropertyHandle, ZlgApi};
use crate::status;

/// One native configuration write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigAction {
    pub key: ConfigKey,
    pub path: String,
    pub value: String,
    pub method: ApplyMethod,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigPlan {
    pub fd_enabled: bool,
    pub actions: Vec<ConfigAction>,
}

/// CAN-FD is on only if the device can do it, its table has a `CanFd`
/// entry, and the caller asked for it.
pub fn resolve_fd(device: &DeviceDescriptor, pending: &ConfigMap) -> bool {
    device.fd_capable
        && device.descriptor(ConfigKey::CanFd).is_some()
        && pending
            .get(&ConfigKey::CanFd)
            .is_some_and(|value| value.as_bool())
}

/// Computes the writes for `phase` without touching the adapter.
///
/// `CanFd` is resolved before any other key because the bit-rate path
/// depends on it.
pub fn plan(
    device: &DeviceDescriptor,
    channel_index: u32,
    pending: &ConfigMap,
    phase: ApplyPhase,
) -> ConfigPlan {
    let fd_enabled = resolve_fd(device, pending);
    let mut actions = Vec::new();

    for (&key, value) in pending {
        let Some(descriptor) = device.descriptor(key) else {
            continue;
        };
        if !descriptor.configurable || descriptor.phase != phase {
            continue;
        }

        let path = match key {
            ConfigKey::BitRate => {
                let rate = value.as_u32();
                let name = if !device.supported_bitrates.contains(&rate) {
                    "baud_rate_custom"
                } else if fd_enabled {
                    "canfd_abit_baud_rate"
                } else {
                    "baud_rate"
                };
                Some((name, rate))
            }
            ConfigKey::DataBitRate => {
                let rate = value.as_u32();
                (fd_enabled && device.supported_data_bitrates.contains(&rate))
                    .then_some(("canfd_dbit_baud_rate", rate))
            }
            // Recognised, but this adapter generation has no native path for them.
            ConfigKey::CanFd
            | ConfigKey::Loopback
            | ConfigKey::ReceiveOwn
            | ConfigKey::RawFilter
            | ConfigKey::ErrorFilter => None,
        };

        if let Some((name, rate)) = path {
            actions.push(ConfigAction {
                key,
                path: format!("{channel_index}/{name}"),
                value: rate.to_string(),
                method: descriptor.method,
            });
        }
    }

    ConfigPlan {
        fd_enabled,
        actions,
    }
}

/// Property interface fetched on first use and released on drop.
struct PropertyGuard<'a> {
    api: &'a dyn ZlgApi,
    device: DeviceHandle,
    handle: Option<PropertyHandle>,
    fetched: bool,
}

impl<'a> PropertyGuard<'a> {
    fn new(api: &'a dyn ZlgApi, device: DeviceHandle) -> Self {
        Self {
            api,
            device,
            handle: None,
            fetched: false,
        }
    }

    fn get(&mut self) -> Option<PropertyHandle> {
        if !self.fetched {
            self.fetched = true;
            self.handle = self.api.get_property(self.device);
        }
        self.handle
    }
}

impl Drop for PropertyGuard<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.api.release_property(handle);
        }
    }
}

/// Writes the configuration for `phase` to the adapter.
///
/// Stops at the first rejected write. Returns the resolved CAN-FD flag.
pub fn apply(
    api: &dyn ZlgApi,
    device_handle: DeviceHandle,
    channel: Option<ChannelHandle>,
    device: &DeviceDescriptor,
    channel_index: u32,
    pending: &ConfigMap,
    phase: ApplyPhase,
) -> Result<bool> {
    let plan = plan(device, channel_index, pending, phase);
    let mut property = PropertyGuard::new(api, device_handle);

    for action in &plan.actions {
        let accepted = match action.method {
            ApplyMethod::InitTimeOnly => true,
            ApplyMethod::DirectValueSet => {
                api.set_value(device_handle, &action.path, &action.value)
            }
            ApplyMethod::PropertyInterfaceSet => property
                .get()
                .is_some_and(|handle| api.set_property(handle, &action.path, &action.value)),
        };
        if !accepted {
            return Err(Error::ConfigurationFailed(format!(
                "{} = {} rejected: {}",
                action.path,
                action.value,
                status::describe(api, channel)
            )));
        }
        debug!("{:?}: {} = {}", phase, action.path, action.value);
    }

    Ok(plan.fd_enabled)
}

//! Process-wide table of open device handles.
//!
//! Several logical channels of one physical adapter share a single device
//! handle. The registry owns that handle; channels hold a [`DeviceLease`]
//! and the device is closed when the last lease for it goes away.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::native::{DeviceHandle, ZlgApi};
use crate::status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub device_type: u32,
    pub device_index: u32,
}

struct RegistryEntry {
    handle: DeviceHandle,
    /// Channel indices currently holding the handle.
    channels: BTreeSet<u32>,
}

pub struct HandleRegistry {
    api: Arc<dyn ZlgApi>,
    entries: Mutex<HashMap<DeviceKey, RegistryEntry>>,
}

impl HandleRegistry {
    pub fn new(api: Arc<dyn ZlgApi>) -> Arc<Self> {
        Arc::new(Self {
            api,
            entries: Mutex::new(HashMap::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DeviceKey, RegistryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands out the device handle for `channel_index`, opening the device if
    /// no other channel holds it yet.
    ///
    /// Fails with [`Error::AlreadyOpen`] when the channel index is already
    /// held, and with [`Error::ConnectionFailed`] when the native open fails.
    pub fn acquire(
        self: &Arc<Self>,
        device_type: u32,
        device_index: u32,
        channel_index: u32,
    ) -> Result<DeviceLease> {
        let key = DeviceKey {
            device_type,
            device_index,
        };
        let mut entries = self.lock();

        let handle = match entries.get_mut(&key) {
            Some(entry) => {
                if !entry.channels.insert(channel_index) {
                    return Err(Error::AlreadyOpen {
                        device_type,
                        device_index,
                        channel_index,
                    });
                }
                debug!(
                    "Sharing device {device_type}/{device_index} with channel {channel_index} ({} holders)",
                    entry.channels.len()
                );
                entry.handle
            }
            None => {
                let Some(handle) = self.api.open_device(device_type, device_index) else {
                    return Err(Error::ConnectionFailed(format!(
                        "cannot open device type {device_type} index {device_index}: {}",
                        status::describe(self.api.as_ref(), None)
                    )));
                };
                info!("Opened device {device_type}/{device_index}");
                entries.insert(
                    key,
                    RegistryEntry {
                        handle,
                        channels: BTreeSet::from([channel_index]),
                    },
                );
                handle
            }
        };

        Ok(DeviceLease {
            registry: Arc::clone(self),
            key,
            channel_index,
            handle,
            released: false,
        })
    }

    /// Drops `channel_index`'s hold on the device. Closes the device when it
    /// was the last holder. Releasing a channel that holds nothing is a no-op.
    pub fn release(&self, device_type: u32, device_index: u32, channel_index: u32) {
        let key = DeviceKey {
            device_type,
            device_index,
        };
        let mut entries = self.lock();

        let Some(entry) = entries.get_mut(&key) else {
            return;
        };
        if !entry.channels.remove(&channel_index) {
            return;
        }
        debug!("Channel {channel_index} released device {device_type}/{device_index}");
        if !entry.channels.is_empty() {
            return;
        }

        if let Some(entry) = entries.remove(&key) {
            if self.api.close_device(entry.handle) {
                info!("Closed device {device_type}/{device_index}");
            } else {
                warn!("Closing device {device_type}/{device_index} failed");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Channel indices holding the device, in ascending order.
    pub fn holders(&self, device_type: u32, device_index: u32) -> Vec<u32> {
        let key = DeviceKey {
            device_type,
            device_index,
        };
        self.lock()
            .get(&key)
            .map(|entry| entry.channels.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn device_handle(&self, device_type: u32, device_index: u32) -> Option<DeviceHandle> {
        let key = DeviceKey {
            device_type,
            device_index,
        };
        self.lock().get(&key).map(|entry| entry.handle)
    }
}

/// One channel's share of a device handle. Released on drop.
pub struct DeviceLease {
    registry: Arc<HandleRegistry>,
    key: DeviceKey,
    channel_index: u32,
    handle: DeviceHandle,
    released: bool,
}

impl DeviceLease {
    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.registry.release(
                self.key.device_type,
                self.key.device_index,
                self.channel_index,
            );
        }
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for DeviceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLease")
            .field("key", &self.key)
            .field("channel_index", &self.channel_index)
            .field("handle", &self.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::mock::{MockApi, MockCall};

    fn registry() -> (Arc<MockApi>, Arc<HandleRegistry>) {
        let api = Arc::new(MockApi::new());
        let registry = HandleRegistry::new(api.clone());
        (api, registry)
    }

    #[test]
    fn acquire_then_release_leaves_registry_empty() {
        let (api, registry) = registry();
        let lease = registry.acquire(41, 0, 1).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.holders(41, 0), vec![1]);

        lease.release();
        assert!(registry.is_empty());
        assert_eq!(api.device_opens(), 1);
        assert_eq!(api.device_closes(), 1);
    }

    #[test]
    fn channels_of_one_device_share_the_handle() {
        let (api, registry) = registry();
        let a = registry.acquire(34, 0, 0).unwrap();
        let b = registry.acquire(34, 0, 5).unwrap();
        assert_eq!(a.handle(), b.handle());
        assert_eq!(api.device_opens(), 1);

        drop(a);
        assert_eq!(api.device_closes(), 0);
        assert_eq!(registry.holders(34, 0), vec![5]);
        drop(b);
        assert_eq!(api.device_closes(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn same_channel_twice_is_already_open() {
        let (_api, registry) = registry();
        let _lease = registry.acquire(4, 0, 1).unwrap();
        let err = registry.acquire(4, 0, 1).unwrap_err();
        assert_eq!(
            err,
            Error::AlreadyOpen {
                device_type: 4,
                device_index: 0,
                channel_index: 1
            }
        );
        assert_eq!(registry.holders(4, 0), vec![1]);
    }

    #[test]
    fn device_indices_are_separate_entries() {
        let (api, registry) = registry();
        let _a = registry.acquire(4, 0, 0).unwrap();
        let _b = registry.acquire(4, 1, 0).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(api.device_opens(), 2);
    }

    #[test]
    fn failed_open_creates_no_entry() {
        let (api, registry) = registry();
        api.fail(MockCall::OpenDevice);
        let err = registry.acquire(41, 0, 0).unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed(ref msg) if msg.contains("Unknown error")));
        assert!(registry.is_empty());
    }

    #[test]
    fn release_is_idempotent() {
        let (api, registry) = registry();
        let lease = registry.acquire(41, 0, 0).unwrap();
        registry.release(41, 0, 0);
        registry.release(41, 0, 0);
        drop(lease);
        registry.release(7, 7, 7);
        assert_eq!(api.device_closes(), 1);
        assert_eq!(api.call_count(MockCall::CloseDevice), 1);
    }
}

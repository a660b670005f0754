//! Channel management for ZLG USBCAN and USBCANFD adapters.
//!
//! [`ZlgCanBackend`] loads the device catalog and the vendor library and
//! hands out [`ChannelController`]s. A controller owns one physical channel;
//! [`spawn_pump`] moves frames between it and the adapter.

pub mod backend;
pub mod catalog;
pub mod channel;
pub mod codec;
pub mod drivers;
pub mod error;
pub mod frame;
/// Named-pipe bridge used by `zlgcanserver`.
pub mod ipc;
pub mod native;
pub mod pump;
pub mod registry;
pub mod sequencer;
pub mod status;

pub use backend::{BackendOptions, DeviceInfo, ZlgCanBackend};
pub use catalog::{ChannelId, ConfigKey, ConfigMap, ConfigValue, DeviceCatalog};
pub use channel::{BusErrorKind, BusEvent, ChannelController, ChannelState};
pub use drivers::{CanDriver, ZlgCanDriver};
pub use error::{Error, Result};
pub use frame::{CanFrame, FrameKind};
pub use pump::{PumpConfig, spawn_pump};
pub use registry::HandleRegistry;
pub use status::{BusStatus, classify};

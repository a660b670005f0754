//! Native ZLG driver surface.
//!
//! Everything above this module talks to the adapter through [`ZlgApi`];
//! [`LibraryApi`] binds it to the vendor library at runtime and
//! [`mock::MockApi`] stands in for hardware.

pub mod ffi;
mod library;
pub mod mock;

pub use ffi::{
    ChannelErrInfo, ChannelInitConfig, RawCanFdFrame, RawCanFrame, ReceiveData, ReceiveFdData,
    TransmitData, TransmitFdData,
};
pub use library::LibraryApi;

/// Opaque `DEVICE_HANDLE`. Zero is the invalid handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(usize);

/// Opaque `CHANNEL_HANDLE`. Zero is the invalid handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle(usize);

/// Opaque `IProperty*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyHandle(usize);

macro_rules! raw_handle {
    ($name:ident) => {
        impl $name {
            /// Wraps a raw native handle, mapping the null handle to `None`.
            pub fn from_raw(raw: usize) -> Option<Self> {
                (raw != 0).then_some(Self(raw))
            }

            pub fn as_raw(self) -> usize {
                self.0
            }
        }
    };
}

raw_handle!(DeviceHandle);
raw_handle!(ChannelHandle);
raw_handle!(PropertyHandle);

/// Receive queue selector for `ZCAN_GetReceiveNum`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameFormat {
    Classic = 0,
    Fd = 1,
}

/// Capability interface over the vendor driver calls the channel layer needs.
///
/// Methods mirror the C API one-to-one. Failures are reported the way the
/// driver reports them (`None`, `false` or a zero count); callers fetch the
/// reason with [`ZlgApi::read_channel_err_info`].
pub trait ZlgApi: Send + Sync {
    fn open_device(&self, device_type: u32, device_index: u32) -> Option<DeviceHandle>;

    fn close_device(&self, device: DeviceHandle) -> bool;

    fn init_can(
        &self,
        device: DeviceHandle,
        channel_index: u32,
        config: &ChannelInitConfig,
    ) -> Option<ChannelHandle>;

    fn start_can(&self, channel: ChannelHandle) -> bool;

    fn reset_can(&self, channel: ChannelHandle) -> bool;

    /// Number of frames waiting in the selected receive queue.
    fn receive_num(&self, channel: ChannelHandle, format: FrameFormat) -> u32;

    /// Returns how many frames the adapter accepted.
    fn transmit(&self, channel: ChannelHandle, frames: &[TransmitData]) -> u32;

    fn transmit_fd(&self, channel: ChannelHandle, frames: &[TransmitFdData]) -> u32;

    /// Fills `buffer` from the classic queue, waiting at most `wait_ms`.
    /// Returns `None` when the driver reports a failure.
    fn receive(
        &self,
        channel: ChannelHandle,
        buffer: &mut [ReceiveData],
        wait_ms: i32,
    ) -> Option<usize>;

    fn receive_fd(
        &self,
        channel: ChannelHandle,
        buffer: &mut [ReceiveFdData],
        wait_ms: i32,
    ) -> Option<usize>;

    /// `ZCAN_SetValue` with a `"<channel>/<key>"` style path.
    fn set_value(&self, device: DeviceHandle, path: &str, value: &str) -> bool;

    fn get_property(&self, device: DeviceHandle) -> Option<PropertyHandle>;

    fn set_property(&self, property: PropertyHandle, path: &str, value: &str) -> bool;

    fn release_property(&self, property: PropertyHandle);

    fn read_channel_err_info(&self, channel: ChannelHandle) -> Option<ChannelErrInfo>;
}

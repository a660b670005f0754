//! In-process stand-in for the vendor library.
//!
//! `MockApi` keeps the whole adapter in memory: device and channel handles are
//! allocated from a counter, transmitted frames are recorded, receive queues
//! are filled by the caller and every native call is logged so tests can
//! assert on ordering and counts. With loopback enabled it also acts as a
//! virtual adapter for the tools' `--simulate` mode.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::trace;

use super::ffi::{
    ChannelErrInfo, ChannelInitConfig, RawCanFdFrame, RawCanFrame, ReceiveData, ReceiveFdData,
    TransmitData, TransmitFdData,
};
use super::{ChannelHandle, DeviceHandle, FrameFormat, PropertyHandle, ZlgApi};

/// Native entry points, as recorded by [`MockApi::calls`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockCall {
    OpenDevice,
    CloseDevice,
    InitCan,
    StartCan,
    ResetCan,
    ReceiveNum,
    Transmit,
    TransmitFd,
    Receive,
    ReceiveFd,
    SetValue,
    GetProperty,
    SetProperty,
    ReleaseProperty,
    ReadErrInfo,
}

#[derive(Debug, Default)]
struct MockState {
    next_handle: usize,
    devices: HashMap<usize, (u32, u32)>,
    channels: HashMap<usize, (usize, u32)>,
    device_opens: usize,
    device_closes: usize,
    calls: Vec<MockCall>,
    failures: HashSet<MockCall>,
    failed_paths: HashSet<String>,
    error_code: u32,
    values: Vec<(String, String)>,
    properties: Vec<(String, String)>,
    live_properties: HashSet<usize>,
    rx: HashMap<u32, VecDeque<ReceiveData>>,
    rx_fd: HashMap<u32, VecDeque<ReceiveFdData>>,
    transmitted: Vec<TransmitData>,
    transmitted_fd: Vec<TransmitFdData>,
    transmit_calls: Vec<usize>,
    transmit_limit: Option<usize>,
    init_configs: Vec<(u32, ChannelInitConfig)>,
    loopback: bool,
    clock_us: u64,
}

impl MockState {
    fn allocate(&mut self) -> usize {
        self.next_handle += 1;
        self.next_handle
    }

    fn record(&mut self, call: MockCall) -> bool {
        self.calls.push(call);
        !self.failures.contains(&call)
    }

    fn channel_index(&self, channel: ChannelHandle) -> Option<u32> {
        self.channels.get(&channel.as_raw()).map(|(_, index)| *index)
    }

    fn tick(&mut self) -> u64 {
        self.clock_us += 100;
        self.clock_us
    }
}

#[derive(Debug, Default)]
pub struct MockApi {
    state: Mutex<MockState>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Virtual adapter that echoes every transmitted frame back into the
    /// receive queue of the same channel.
    pub fn with_loopback() -> Self {
        let api = Self::new();
        api.lock().loopback = true;
        api
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every subsequent `call` report failure.
    pub fn fail(&self, call: MockCall) {
        self.lock().failures.insert(call);
    }

    pub fn succeed(&self, call: MockCall) {
        self.lock().failures.remove(&call);
    }

    /// Makes `set_value`/`set_property` fail for one configuration path only.
    pub fn fail_path(&self, path: &str) {
        self.lock().failed_paths.insert(path.to_string());
    }

    /// Error code reported by `read_channel_err_info` for every channel.
    pub fn set_error_code(&self, code: u32) {
        self.lock().error_code = code;
    }

    /// Caps how many frames one transmit call accepts.
    pub fn set_transmit_limit(&self, limit: Option<usize>) {
        self.lock().transmit_limit = limit;
    }

    pub fn push_receive(&self, channel_index: u32, data: ReceiveData) {
        self.lock().rx.entry(channel_index).or_default().push_back(data);
    }

    pub fn push_receive_fd(&self, channel_index: u32, data: ReceiveFdData) {
        self.lock()
            .rx_fd
            .entry(channel_index)
            .or_default()
            .push_back(data);
    }

    pub fn pending_receive(&self, channel_index: u32) -> usize {
        self.lock().rx.get(&channel_index).map_or(0, VecDeque::len)
    }

    pub fn device_opens(&self) -> usize {
        self.lock().device_opens
    }

    pub fn device_closes(&self) -> usize {
        self.lock().device_closes
    }

    pub fn open_devices(&self) -> usize {
        self.lock().devices.len()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, call: MockCall) -> usize {
        self.lock().calls.iter().filter(|c| **c == call).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// `(path, value)` pairs accepted by `set_value`, in call order.
    pub fn values(&self) -> Vec<(String, String)> {
        self.lock().values.clone()
    }

    /// `(path, value)` pairs accepted through the property interface.
    pub fn properties(&self) -> Vec<(String, String)> {
        self.lock().properties.clone()
    }

    /// Property interfaces handed out and not yet released.
    pub fn live_properties(&self) -> usize {
        self.lock().live_properties.len()
    }

    pub fn transmitted(&self) -> Vec<TransmitData> {
        self.lock().transmitted.clone()
    }

    pub fn transmitted_fd(&self) -> Vec<TransmitFdData> {
        self.lock().transmitted_fd.clone()
    }

    /// Batch size of every successful transmit call.
    pub fn transmit_calls(&self) -> Vec<usize> {
        self.lock().transmit_calls.clone()
    }

    pub fn init_configs(&self) -> Vec<(u32, ChannelInitConfig)> {
        self.lock().init_configs.clone()
    }
}

impl ZlgApi for MockApi {
    fn open_device(&self, device_type: u32, device_index: u32) -> Option<DeviceHandle> {
        let mut state = self.lock();
        if !state.record(MockCall::OpenDevice) {
            return None;
        }
        let handle = state.allocate();
        state.devices.insert(handle, (device_type, device_index));
        state.device_opens += 1;
        trace!("mock: open device {device_type}/{device_index} -> {handle}");
        DeviceHandle::from_raw(handle)
    }

    fn close_device(&self, device: DeviceHandle) -> bool {
        let mut state = self.lock();
        if !state.record(MockCall::CloseDevice) {
            return false;
        }
        if state.devices.remove(&device.as_raw()).is_none() {
            return false;
        }
        state.channels.retain(|_, (owner, _)| *owner != device.as_raw());
        state.device_closes += 1;
        true
    }

    fn init_can(
        &self,
        device: DeviceHandle,
        channel_index: u32,
        config: &ChannelInitConfig,
    ) -> Option<ChannelHandle> {
        let mut state = self.lock();
        if !state.record(MockCall::InitCan) || !state.devices.contains_key(&device.as_raw()) {
            return None;
        }
        state.init_configs.push((channel_index, *config));
        let handle = state.allocate();
        state.channels.insert(handle, (device.as_raw(), channel_index));
        ChannelHandle::from_raw(handle)
    }

    fn start_can(&self, channel: ChannelHandle) -> bool {
        let mut state = self.lock();
        state.record(MockCall::StartCan) && state.channels.contains_key(&channel.as_raw())
    }

    fn reset_can(&self, channel: ChannelHandle) -> bool {
        let mut state = self.lock();
        state.record(MockCall::ResetCan) && state.channels.contains_key(&channel.as_raw())
    }

    fn receive_num(&self, channel: ChannelHandle, format: FrameFormat) -> u32 {
        let mut state = self.lock();
        if !state.record(MockCall::ReceiveNum) {
            return 0;
        }
        let Some(index) = state.channel_index(channel) else {
            return 0;
        };
        let pending = match format {
            FrameFormat::Classic => state.rx.get(&index).map_or(0, VecDeque::len),
            FrameFormat::Fd => state.rx_fd.get(&index).map_or(0, VecDeque::len),
        };
        pending as u32
    }

    fn transmit(&self, channel: ChannelHandle, frames: &[TransmitData]) -> u32 {
        let mut state = self.lock();
        if !state.record(MockCall::Transmit) {
            return 0;
        }
        let Some(index) = state.channel_index(channel) else {
            return 0;
        };
        let accepted = state.transmit_limit.map_or(frames.len(), |l| l.min(frames.len()));
        let sent = &frames[..accepted];
        state.transmitted.extend_from_slice(sent);
        state.transmit_calls.push(accepted);
        if state.loopback {
            for data in sent {
                let timestamp = state.tick();
                state
                    .rx
                    .entry(index)
                    .or_default()
                    .push_back(ReceiveData::new(data.frame, timestamp));
            }
        }
        accepted as u32
    }

    fn transmit_fd(&self, channel: ChannelHandle, frames: &[TransmitFdData]) -> u32 {
        let mut state = self.lock();
        if !state.record(MockCall::TransmitFd) {
            return 0;
        }
        let Some(index) = state.channel_index(channel) else {
            return 0;
        };
        let accepted = state.transmit_limit.map_or(frames.len(), |l| l.min(frames.len()));
        let sent = &frames[..accepted];
        state.transmitted_fd.extend_from_slice(sent);
        state.transmit_calls.push(accepted);
        if state.loopback {
            for data in sent {
                let timestamp = state.tick();
                state
                    .rx_fd
                    .entry(index)
                    .or_default()
                    .push_back(ReceiveFdData::new(data.frame, timestamp));
            }
        }
        accepted as u32
    }

    fn receive(
        &self,
        channel: ChannelHandle,
        buffer: &mut [ReceiveData],
        _wait_ms: i32,
    ) -> Option<usize> {
        let mut state = self.lock();
        if !state.record(MockCall::Receive) {
            return None;
        }
        let index = state.channel_index(channel)?;
        let Some(queue) = state.rx.get_mut(&index) else {
            return Some(0);
        };
        let count = buffer.len().min(queue.len());
        for (slot, data) in buffer.iter_mut().zip(queue.drain(..count)) {
            *slot = data;
        }
        Some(count)
    }

    fn receive_fd(
        &self,
        channel: ChannelHandle,
        buffer: &mut [ReceiveFdData],
        _wait_ms: i32,
    ) -> Option<usize> {
        let mut state = self.lock();
        if !state.record(MockCall::ReceiveFd) {
            return None;
        }
        let index = state.channel_index(channel)?;
        let Some(queue) = state.rx_fd.get_mut(&index) else {
            return Some(0);
        };
        let count = buffer.len().min(queue.len());
        for (slot, data) in buffer.iter_mut().zip(queue.drain(..count)) {
            *slot = data;
        }
        Some(count)
    }

    fn set_value(&self, device: DeviceHandle, path: &str, value: &str) -> bool {
        let mut state = self.lock();
        if !state.record(MockCall::SetValue)
            || state.failed_paths.contains(path)
            || !state.devices.contains_key(&device.as_raw())
        {
            return false;
        }
        state.values.push((path.to_string(), value.to_string()));
        true
    }

    fn get_property(&self, device: DeviceHandle) -> Option<PropertyHandle> {
        let mut state = self.lock();
        if !state.record(MockCall::GetProperty) || !state.devices.contains_key(&device.as_raw()) {
            return None;
        }
        let handle = state.allocate();
        state.live_properties.insert(handle);
        PropertyHandle::from_raw(handle)
    }

    fn set_property(&self, property: PropertyHandle, path: &str, value: &str) -> bool {
        let mut state = self.lock();
        if !state.record(MockCall::SetProperty)
            || state.failed_paths.contains(path)
            || !state.live_properties.contains(&property.as_raw())
        {
            return false;
        }
        state.properties.push((path.to_string(), value.to_string()));
        true
    }

    fn release_property(&self, property: PropertyHandle) {
        let mut state = self.lock();
        state.record(MockCall::ReleaseProperty);
        state.live_properties.remove(&property.as_raw());
    }

    fn read_channel_err_info(&self, channel: ChannelHandle) -> Option<ChannelErrInfo> {
        let mut state = self.lock();
        if !state.record(MockCall::ReadErrInfo) || !state.channels.contains_key(&channel.as_raw())
        {
            return None;
        }
        Some(ChannelErrInfo {
            error_code: state.error_code,
            ..Default::default()
        })
    }
}

/// Classic receive record, for preloading [`MockApi`] queues.
pub fn classic_rx(can_id: u32, data: &[u8], timestamp: u64) -> ReceiveData {
    let mut frame = RawCanFrame {
        can_id,
        can_dlc: data.len().min(8) as u8,
        ..Default::default()
    };
    let len = frame.can_dlc as usize;
    frame.data[..len].copy_from_slice(&data[..len]);
    ReceiveData::new(frame, timestamp)
}

/// FD receive record, for preloading [`MockApi`] queues.
pub fn fd_rx(can_id: u32, flags: u8, data: &[u8], timestamp: u64) -> ReceiveFdData {
    let mut frame = RawCanFdFrame {
        can_id,
        len: data.len().min(64) as u8,
        flags,
        ..Default::default()
    };
    let len = frame.len as usize;
    frame.data[..len].copy_from_slice(&data[..len]);
    ReceiveFdData::new(frame, timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_handles_are_distinct_and_counted() {
        let api = MockApi::new();
        let a = api.open_device(41, 0).unwrap();
        let b = api.open_device(41, 1).unwrap();
        assert_ne!(a, b);
        assert_eq!(api.device_opens(), 2);
        assert!(api.close_device(a));
        assert!(!api.close_device(a));
        assert_eq!(api.device_closes(), 1);
        assert_eq!(api.open_devices(), 1);
    }

    #[test]
    fn injected_failure_is_sticky_until_cleared() {
        let api = MockApi::new();
        api.fail(MockCall::OpenDevice);
        assert!(api.open_device(4, 0).is_none());
        assert!(api.open_device(4, 0).is_none());
        api.succeed(MockCall::OpenDevice);
        assert!(api.open_device(4, 0).is_some());
        assert_eq!(api.call_count(MockCall::OpenDevice), 3);
    }

    #[test]
    fn receive_drains_at_most_buffer_len() {
        let api = MockApi::new();
        let device = api.open_device(4, 0).unwrap();
        let channel = api
            .init_can(device, 1, &ChannelInitConfig::accept_all(false))
            .unwrap();
        for i in 0..5 {
            api.push_receive(1, classic_rx(i, &[i as u8], 0));
        }
        assert_eq!(api.receive_num(channel, FrameFormat::Classic), 5);

        let mut buffer = [ReceiveData::default(); 3];
        assert_eq!(api.receive(channel, &mut buffer, 0), Some(3));
        assert_eq!(buffer[2].frame.can_id, 2);
        assert_eq!(api.receive_num(channel, FrameFormat::Classic), 2);
    }

    #[test]
    fn loopback_echoes_transmitted_frames() {
        let api = MockApi::with_loopback();
        let device = api.open_device(4, 0).unwrap();
        let channel = api
            .init_can(device, 0, &ChannelInitConfig::accept_all(false))
            .unwrap();
        let data = TransmitData {
            frame: classic_rx(0x55, &[1, 2], 0).frame,
            transmit_type: 0,
        };
        assert_eq!(api.transmit(channel, &[data]), 1);
        assert_eq!(api.receive_num(channel, FrameFormat::Classic), 1);
    }
}

//! One logical CAN channel: open/close/reset and the read/write pump.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, trace, warn};
use tokio::sync::broadcast;

use crate::catalog::{ApplyPhase, ConfigKey, ConfigMap, ConfigValue, DeviceDescriptor};
use crate::codec;
use crate::error::{Error, Result};
use crate::frame::{CAN_MAX_DLEN, CANFD_MAX_DLEN, CanFrame};
use crate::native::{
    ChannelHandle, ChannelInitConfig, FrameFormat, ReceiveData, ReceiveFdData, ZlgApi,
};
use crate::pump::{DELIVERY_FLUSH, PeriodicTask, READ_BATCH, WRITE_BATCH};
use crate::registry::{DeviceLease, HandleRegistry};
use crate::sequencer;
use crate::status::{self, BusStatus};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Closed,
    Opening,
    Open,
    /// A reset failed; the channel must be reopened.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusErrorKind {
    ConnectionError,
    ConfigurationError,
    WriteError,
    ReadError,
}

/// Notifications published by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// Frames accepted by the adapter during one write-pump run.
    FramesWritten(usize),
    /// Frames moved to the delivery queue by one flush.
    FramesReceived(usize),
    Error { kind: BusErrorKind, message: String },
}

struct ChannelSlot {
    state: ChannelState,
    lease: Option<DeviceLease>,
    channel: Option<ChannelHandle>,
    fd_enabled: bool,
}

enum Rejection {
    FdDisabled,
    Oversized(usize),
    Invalid,
}

fn rejection(frame: &CanFrame, fd_enabled: bool) -> Option<Rejection> {
    let capacity = if fd_enabled {
        CANFD_MAX_DLEN
    } else {
        CAN_MAX_DLEN
    };
    if frame.is_fd() && !fd_enabled {
        Some(Rejection::FdDisabled)
    } else if frame.dlc() > capacity {
        Some(Rejection::Oversized(frame.dlc()))
    } else if !frame.is_valid() {
        Some(Rejection::Invalid)
    } else {
        None
    }
}

pub struct ChannelController {
    api: Arc<dyn ZlgApi>,
    registry: Arc<HandleRegistry>,
    device: Arc<DeviceDescriptor>,
    device_index: u32,
    channel_index: u32,
    label: String,
    pending: Mutex<ConfigMap>,
    /// Serialises every native call on this channel's handle.
    slot: Mutex<ChannelSlot>,
    outgoing: Mutex<VecDeque<CanFrame>>,
    incoming: Mutex<VecDeque<CanFrame>>,
    read_timer: PeriodicTask,
    write_timer: PeriodicTask,
    events: broadcast::Sender<BusEvent>,
    last_error: Mutex<Option<Error>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChannelController {
    pub fn new(
        api: Arc<dyn ZlgApi>,
        registry: Arc<HandleRegistry>,
        device: Arc<DeviceDescriptor>,
        device_index: u32,
        channel_index: u32,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            label: format!("{}/{}/{}", device.name, device_index, channel_index),
            api,
            registry,
            device,
            device_index,
            channel_index,
            pending: Mutex::new(ConfigMap::new()),
            slot: Mutex::new(ChannelSlot {
                state: ChannelState::Closed,
                lease: None,
                channel: None,
                fd_enabled: false,
            }),
            outgoing: Mutex::new(VecDeque::new()),
            incoming: Mutex::new(VecDeque::new()),
            read_timer: PeriodicTask::new("read"),
            write_timer: PeriodicTask::new("write"),
            events,
            last_error: Mutex::new(None),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub fn device_index(&self) -> u32 {
        self.device_index
    }

    pub fn channel_index(&self) -> u32 {
        self.channel_index
    }

    pub fn state(&self) -> ChannelState {
        lock(&self.slot).state
    }

    pub fn is_fd_enabled(&self) -> bool {
        lock(&self.slot).fd_enabled
    }

    pub fn read_timer(&self) -> &PeriodicTask {
        &self.read_timer
    }

    pub fn write_timer(&self) -> &PeriodicTask {
        &self.write_timer
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    pub fn last_error(&self) -> Option<Error> {
        lock(&self.last_error).clone()
    }

    pub fn clear_last_error(&self) {
        lock(&self.last_error).take();
    }

    /// Stores a value to be applied on the next `open()`.
    pub fn set_configuration(&self, key: ConfigKey, value: ConfigValue) -> Result<()> {
        if self.device.descriptor(key).is_none() {
            return Err(Error::InvalidChannel(format!(
                "{} does not support configuration {key}",
                self.device.name
            )));
        }
        lock(&self.pending).insert(key, value);
        Ok(())
    }

    pub fn configuration(&self) -> ConfigMap {
        lock(&self.pending).clone()
    }

    fn emit(&self, event: BusEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn report(&self, kind: BusErrorKind, error: Error) -> Error {
        *lock(&self.last_error) = Some(error.clone());
        self.emit(BusEvent::Error {
            kind,
            message: error.to_string(),
        });
        error
    }

    fn report_open_failure(&self, error: Error) -> Error {
        let kind = match error {
            Error::ConfigurationFailed(_) => BusErrorKind::ConfigurationError,
            _ => BusErrorKind::ConnectionError,
        };
        warn!("Cannot open {}: {}", self.label, error);
        self.report(kind, error)
    }

    /// Opens the channel: acquire the device, configure, init, start.
    ///
    /// On failure everything acquired so far is released and the channel is
    /// back in `Closed`.
    pub fn open(&self) -> Result<()> {
        if self.channel_index >= self.device.channel_count {
            return Err(Error::InvalidChannel(format!(
                "{} has {} channel(s), requested channel {}",
                self.device.name, self.device.channel_count, self.channel_index
            )));
        }

        // A channel left `Failed` by reset goes straight to `Opening`, so a
        // running pump never sees it closed.
        let stale = {
            let mut slot = lock(&self.slot);
            if matches!(slot.state, ChannelState::Open | ChannelState::Opening) {
                return Err(Error::AlreadyOpen {
                    device_type: self.device.type_id,
                    device_index: self.device_index,
                    channel_index: self.channel_index,
                });
            }
            slot.state = ChannelState::Opening;
            slot.channel = None;
            slot.fd_enabled = false;
            slot.lease.take()
        };
        if let Some(lease) = stale {
            lock(&self.outgoing).clear();
            lease.release();
            info!("Closed {} before reopening", self.label);
        }

        let lease = match self.registry.acquire(
            self.device.type_id,
            self.device_index,
            self.channel_index,
        ) {
            Ok(lease) => lease,
            Err(err) => {
                lock(&self.slot).state = ChannelState::Closed;
                return Err(self.report_open_failure(err));
            }
        };

        let pending = self.configuration();
        let mut slot = lock(&self.slot);
        match self.bring_up(&mut slot, &lease, &pending) {
            Ok(()) => {
                slot.lease = Some(lease);
                slot.state = ChannelState::Open;
                let fd = slot.fd_enabled;
                drop(slot);
                self.read_timer.start();
                info!(
                    "Opened {} ({})",
                    self.label,
                    if fd { "CAN-FD" } else { "CAN" }
                );
                Ok(())
            }
            Err(err) => {
                slot.channel = None;
                slot.fd_enabled = false;
                slot.state = ChannelState::Closed;
                drop(slot);
                lease.release();
                Err(self.report_open_failure(err))
            }
        }
    }

    fn bring_up(
        &self,
        slot: &mut ChannelSlot,
        lease: &DeviceLease,
        pending: &ConfigMap,
    ) -> Result<()> {
        let api = self.api.as_ref();
        let device = lease.handle();
        let index = self.channel_index;

        let fd = sequencer::apply(
            api,
            device,
            None,
            &self.device,
            index,
            pending,
            ApplyPhase::BeforeInit,
        )?;
        slot.fd_enabled = fd;

        let config = ChannelInitConfig::accept_all(fd);
        let Some(channel) = api.init_can(device, index, &config) else {
            return Err(Error::ConnectionFailed(format!(
                "cannot initialise channel {index}: {}",
                status::describe(api, None)
            )));
        };
        slot.channel = Some(channel);
        debug!("Initialised {} with {:?}", self.label, config);

        sequencer::apply(
            api,
            device,
            Some(channel),
            &self.device,
            index,
            pending,
            ApplyPhase::BeforeStart,
        )?;

        if !api.start_can(channel) {
            return Err(Error::ConnectionFailed(format!(
                "cannot start channel {index}: {}",
                status::describe(api, Some(channel))
            )));
        }

        sequencer::apply(
            api,
            device,
            Some(channel),
            &self.device,
            index,
            pending,
            ApplyPhase::AfterStart,
        )?;
        Ok(())
    }

    /// Stops both pump tasks and gives the device back to the registry.
    /// Safe to call in any state, any number of times.
    pub fn close(&self) {
        self.read_timer.stop();
        self.write_timer.stop();

        let lease = {
            let mut slot = lock(&self.slot);
            slot.channel = None;
            slot.fd_enabled = false;
            slot.state = ChannelState::Closed;
            slot.lease.take()
        };
        lock(&self.outgoing).clear();

        if let Some(lease) = lease {
            lease.release();
            info!("Closed {}", self.label);
        }
    }

    /// Hardware reset of an open channel followed by a restart.
    ///
    /// If either native call fails the channel is left in `Failed` with both
    /// pump tasks stopped, and must be reopened.
    pub fn reset(&self) -> Result<()> {
        let mut slot = lock(&self.slot);
        let (ChannelState::Open, Some(channel)) = (slot.state, slot.channel) else {
            return Err(Error::NotOpen);
        };

        if self.api.reset_can(channel) && self.api.start_can(channel) {
            drop(slot);
            self.read_timer.start();
            self.write_timer.start();
            info!("Reset {}", self.label);
            return Ok(());
        }

        let message = status::describe(self.api.as_ref(), Some(channel));
        slot.state = ChannelState::Failed;
        drop(slot);
        self.read_timer.stop();
        self.write_timer.stop();
        warn!("Cannot perform hardware reset of {}: {}", self.label, message);
        Err(self.report(
            BusErrorKind::ConfigurationError,
            Error::ConfigurationFailed(format!("reset failed: {message}")),
        ))
    }

    /// Queues a frame for the write pump and arms it.
    pub fn write(&self, frame: CanFrame) -> Result<()> {
        if self.state() != ChannelState::Open {
            return Err(Error::NotOpen);
        }
        lock(&self.outgoing).push_back(frame);
        self.write_timer.start();
        Ok(())
    }

    pub fn bus_status(&self) -> BusStatus {
        let slot = lock(&self.slot);
        status::bus_status(self.api.as_ref(), slot.channel)
    }

    pub fn frames_available(&self) -> usize {
        lock(&self.incoming).len()
    }

    /// Takes every frame delivered so far.
    pub fn read_available(&self) -> impl Iterator<Item = CanFrame> + use<> {
        std::mem::take(&mut *lock(&self.incoming)).into_iter()
    }

    /// One run of the write pump. Returns the number of frames the adapter
    /// accepted.
    pub fn write_tick(&self) -> usize {
        let slot = lock(&self.slot);
        let (ChannelState::Open, Some(channel)) = (slot.state, slot.channel) else {
            drop(slot);
            self.write_timer.stop();
            return 0;
        };
        if lock(&self.outgoing).is_empty() {
            drop(slot);
            self.write_timer.stop();
            return 0;
        }
        let fd_enabled = slot.fd_enabled;

        let mut written = 0usize;
        loop {
            let batch = self.next_batch(fd_enabled);
            if batch.is_empty() {
                if lock(&self.outgoing).is_empty() {
                    break;
                }
                continue;
            }

            let sent = if fd_enabled {
                let records: Vec<_> = batch.iter().map(codec::encode_fd).collect();
                self.api.transmit_fd(channel, &records)
            } else {
                let records: Vec<_> = batch.iter().map(codec::encode_classic).collect();
                self.api.transmit(channel, &records)
            };
            let sent = sent as usize;
            trace!("{}: transmitted {}/{}", self.label, sent, batch.len());

            if sent < batch.len() {
                let reason = status::describe(self.api.as_ref(), Some(channel));
                let message = if sent == 0 {
                    reason.to_string()
                } else {
                    format!(
                        "{} of {} frame(s) not sent: {}",
                        batch.len() - sent,
                        batch.len(),
                        reason
                    )
                };
                warn!("Write on {} failed: {}", self.label, message);
                self.report(BusErrorKind::WriteError, Error::WriteError(message));
            }
            written += sent;
        }
        drop(slot);

        if written > 0 {
            self.emit(BusEvent::FramesWritten(written));
        }
        written
    }

    /// Pops up to [`WRITE_BATCH`] sendable frames, skipping the rest.
    fn next_batch(&self, fd_enabled: bool) -> Vec<CanFrame> {
        let mut queue = lock(&self.outgoing);
        let mut batch = Vec::with_capacity(WRITE_BATCH);
        while batch.len() < WRITE_BATCH {
            let Some(frame) = queue.pop_front() else {
                break;
            };
            match rejection(&frame, fd_enabled) {
                None => batch.push(frame),
                Some(Rejection::Oversized(len)) => {
                    debug!("{}: cannot write frame with payload size {}", self.label, len);
                }
                Some(Rejection::Invalid) => {
                    debug!("{}: invalid frame {:?}", self.label, frame);
                }
                Some(Rejection::FdDisabled) => {
                    let message = "cannot send CAN FD frame as CAN FD is not enabled";
                    warn!("{}: {}", self.label, message);
                    self.report(
                        BusErrorKind::WriteError,
                        Error::WriteError(message.to_string()),
                    );
                }
            }
        }
        batch
    }

    /// One run of the read pump. Returns the number of frames delivered.
    ///
    /// The classic queue is drained before the FD queue.
    pub fn read_tick(&self) -> usize {
        let slot = lock(&self.slot);
        let Some(channel) = slot.channel else {
            drop(slot);
            self.read_timer.stop();
            return 0;
        };
        let fd_enabled = slot.fd_enabled;

        let mut pending = Vec::with_capacity(DELIVERY_FLUSH);
        let mut delivered = 0usize;
        let mut accept = |frame: CanFrame, pending: &mut Vec<CanFrame>| {
            pending.push(frame);
            if pending.len() >= DELIVERY_FLUSH {
                delivered += self.deliver(pending);
            }
        };

        let mut buffer = [ReceiveData::default(); READ_BATCH];
        loop {
            let available = self.api.receive_num(channel, FrameFormat::Classic) as usize;
            if available == 0 {
                break;
            }
            let want = available.min(READ_BATCH);
            let Some(count) = self.api.receive(channel, &mut buffer[..want], 0) else {
                self.read_failed(channel);
                break;
            };
            if count == 0 {
                break;
            }
            trace!("{}: received {} classic frame(s)", self.label, count);
            for data in &buffer[..count] {
                accept(codec::decode_classic(data), &mut pending);
            }
        }

        if fd_enabled {
            let mut buffer = [ReceiveFdData::default(); READ_BATCH];
            loop {
                let available = self.api.receive_num(channel, FrameFormat::Fd) as usize;
                if available == 0 {
                    break;
                }
                let want = available.min(READ_BATCH);
                let Some(count) = self.api.receive_fd(channel, &mut buffer[..want], 0) else {
                    self.read_failed(channel);
                    break;
                };
                if count == 0 {
                    break;
                }
                trace!("{}: received {} FD frame(s)", self.label, count);
                for data in &buffer[..count] {
                    accept(codec::decode_fd(data), &mut pending);
                }
            }
        }

        if !pending.is_empty() {
            delivered += self.deliver(&mut pending);
        }
        drop(slot);
        delivered
    }

    fn read_failed(&self, channel: ChannelHandle) {
        let message = status::describe(self.api.as_ref(), Some(channel));
        warn!("Read on {} failed: {}", self.label, message);
        self.report(BusErrorKind::ReadError, Error::ReadError(message.to_string()));
    }

    fn deliver(&self, frames: &mut Vec<CanFrame>) -> usize {
        let count = frames.len();
        lock(&self.incoming).extend(frames.drain(..));
        self.emit(BusEvent::FramesReceived(count));
        count
    }
}

impl std::fmt::Debug for ChannelController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelController")
            .field("label", &self.label)
            .field("state", &self.state())
            .field("fd_enabled", &self.is_fd_enabled())
            .finish()
    }
}

impl Drop for ChannelController {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DeviceCatalog;
    use crate::native::mock::{MockApi, MockCall, classic_rx, fd_rx};
    use crate::status::codes;

    fn controller(name: &str, channel: u32) -> (Arc<MockApi>, ChannelController) {
        let api = Arc::new(MockApi::new());
        let registry = HandleRegistry::new(api.clone());
        let device = DeviceCatalog::builtin().unwrap().lookup(name).unwrap();
        let controller = ChannelController::new(api.clone(), registry, device, 0, channel);
        (api, controller)
    }

    #[test]
    fn open_runs_the_native_sequence_in_order() {
        let (api, ch) = controller("USBCANFD_200U", 1);
        ch.set_configuration(ConfigKey::CanFd, ConfigValue::Bool(true))
            .unwrap();
        ch.set_configuration(ConfigKey::BitRate, ConfigValue::UInt(500_000))
            .unwrap();
        ch.open().unwrap();

        assert_eq!(ch.state(), ChannelState::Open);
        assert!(ch.is_fd_enabled());
        assert!(ch.read_timer().is_active());
        assert!(!ch.write_timer().is_active());
        assert_eq!(
            api.calls(),
            vec![
                MockCall::OpenDevice,
                MockCall::SetValue,
                MockCall::InitCan,
                MockCall::StartCan
            ]
        );
        let (index, config) = api.init_configs()[0];
        assert_eq!(index, 1);
        assert!(config.is_fd());
        assert_eq!(config.acceptance(), (0, 0xFFFF_FFFF));
    }

    #[test]
    fn out_of_range_channel_is_invalid() {
        let (api, ch) = controller("USBCAN_E_U", 1);
        assert!(matches!(ch.open(), Err(Error::InvalidChannel(_))));
        assert_eq!(ch.state(), ChannelState::Closed);
        assert_eq!(api.device_opens(), 0);
    }

    #[test]
    fn unknown_configuration_key_is_rejected() {
        let (_api, ch) = controller("USBCAN_E_U", 0);
        assert!(matches!(
            ch.set_configuration(ConfigKey::DataBitRate, ConfigValue::UInt(2_000_000)),
            Err(Error::InvalidChannel(_))
        ));
    }

    #[test]
    fn init_failure_rolls_back_the_device() {
        let (api, ch) = controller("USBCANFD_200U", 0);
        api.fail(MockCall::InitCan);
        let mut events = ch.subscribe();

        assert!(matches!(ch.open(), Err(Error::ConnectionFailed(_))));
        assert_eq!(ch.state(), ChannelState::Closed);
        assert_eq!(api.device_opens(), 1);
        assert_eq!(api.device_closes(), 1);
        assert!(!ch.read_timer().is_active());
        assert!(matches!(
            events.try_recv(),
            Ok(BusEvent::Error {
                kind: BusErrorKind::ConnectionError,
                ..
            })
        ));
    }

    #[test]
    fn start_failure_carries_the_classified_message() {
        let (api, ch) = controller("USBCANFD_200U", 0);
        api.fail(MockCall::StartCan);
        api.set_error_code(codes::CAN_BUSOFF);

        let err = ch.open().unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed(ref m) if m.contains("bus off")));
        assert_eq!(ch.last_error(), Some(err));
        assert_eq!(api.device_closes(), 1);
    }

    #[test]
    fn configuration_failure_aborts_open() {
        let (api, ch) = controller("USBCANFD_200U", 0);
        ch.set_configuration(ConfigKey::BitRate, ConfigValue::UInt(500_000))
            .unwrap();
        api.fail(MockCall::SetValue);

        assert!(matches!(ch.open(), Err(Error::ConfigurationFailed(_))));
        assert_eq!(api.call_count(MockCall::InitCan), 0);
        assert_eq!(api.device_closes(), 1);
        assert_eq!(ch.state(), ChannelState::Closed);
    }

    #[test]
    fn open_twice_is_already_open() {
        let (_api, ch) = controller("USBCAN2", 0);
        ch.open().unwrap();
        assert!(matches!(ch.open(), Err(Error::AlreadyOpen { .. })));
        assert_eq!(ch.state(), ChannelState::Open);
    }

    #[test]
    fn close_is_idempotent() {
        let (api, ch) = controller("USBCAN2", 0);
        ch.open().unwrap();
        ch.close();
        ch.close();
        assert_eq!(ch.state(), ChannelState::Closed);
        assert_eq!(api.device_closes(), 1);
        assert!(matches!(ch.write(CanFrame::new(1, &[])), Err(Error::NotOpen)));
    }

    #[test]
    fn reset_restarts_both_timers() {
        let (api, ch) = controller("USBCAN2", 0);
        assert!(matches!(ch.reset(), Err(Error::NotOpen)));
        ch.open().unwrap();
        ch.reset().unwrap();
        assert!(ch.read_timer().is_active());
        assert!(ch.write_timer().is_active());
        assert_eq!(api.call_count(MockCall::ResetCan), 1);
        assert_eq!(api.call_count(MockCall::StartCan), 2);
    }

    #[test]
    fn failed_reset_degrades_until_reopened() {
        let (api, ch) = controller("USBCAN2", 0);
        ch.open().unwrap();
        api.fail(MockCall::ResetCan);

        assert!(matches!(ch.reset(), Err(Error::ConfigurationFailed(_))));
        assert_eq!(ch.state(), ChannelState::Failed);
        assert!(!ch.read_timer().is_active());
        assert!(!ch.write_timer().is_active());
        assert!(matches!(ch.write(CanFrame::new(1, &[])), Err(Error::NotOpen)));

        api.succeed(MockCall::ResetCan);
        ch.open().unwrap();
        assert_eq!(ch.state(), ChannelState::Open);
        assert_eq!(api.device_opens(), 2);
        assert_eq!(api.device_closes(), 1);
    }

    #[test]
    fn write_arms_the_timer_and_tick_disarms_it() {
        let (api, ch) = controller("USBCAN2", 0);
        ch.open().unwrap();
        let mut events = ch.subscribe();

        ch.write(CanFrame::new(0x123, &[0xDE, 0xAD])).unwrap();
        assert!(ch.write_timer().is_active());
        assert_eq!(ch.write_tick(), 1);
        assert_eq!(events.try_recv(), Ok(BusEvent::FramesWritten(1)));

        assert_eq!(ch.write_tick(), 0);
        assert!(!ch.write_timer().is_active());
        assert_eq!(api.transmitted()[0].frame.can_id, 0x123);
    }

    #[test]
    fn oversized_frame_is_skipped_not_counted() {
        let (api, ch) = controller("USBCAN2", 0);
        ch.open().unwrap();
        ch.write(CanFrame::new(0x10, &[0; 9])).unwrap();
        ch.write(CanFrame::new(0x11, &[1, 2, 3])).unwrap();

        assert_eq!(ch.write_tick(), 1);
        assert_eq!(api.transmit_calls(), vec![1]);
        assert_eq!(api.transmitted()[0].frame.can_id, 0x11);
        assert_eq!(ch.last_error(), None);
    }

    #[test]
    fn fd_frame_without_fd_is_reported() {
        let (api, ch) = controller("USBCANFD_200U", 0);
        ch.open().unwrap();
        let mut events = ch.subscribe();
        ch.write(CanFrame::new_fd(0x10, &[0; 12], false, true)).unwrap();

        assert_eq!(ch.write_tick(), 0);
        assert!(api.transmitted().is_empty());
        assert!(matches!(
            events.try_recv(),
            Ok(BusEvent::Error {
                kind: BusErrorKind::WriteError,
                ..
            })
        ));
    }

    #[test]
    fn fd_mode_uses_the_fd_transmit_path() {
        let (api, ch) = controller("USBCANFD_200U", 0);
        ch.set_configuration(ConfigKey::CanFd, ConfigValue::Bool(true))
            .unwrap();
        ch.open().unwrap();
        ch.write(CanFrame::new_fd(0x10, &[7; 32], false, true)).unwrap();
        ch.write(CanFrame::new(0x11, &[1])).unwrap();

        assert_eq!(ch.write_tick(), 2);
        let sent = api.transmitted_fd();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].frame.len, 32);
        assert!(api.transmitted().is_empty());
    }

    #[test]
    fn large_queue_is_sent_in_batches() {
        let (api, ch) = controller("USBCAN2", 0);
        ch.open().unwrap();
        for i in 0..120u32 {
            ch.write(CanFrame::new(i, &[i as u8])).unwrap();
        }
        assert_eq!(ch.write_tick(), 120);
        assert_eq!(api.transmit_calls(), vec![50, 50, 20]);
    }

    #[test]
    fn transmit_failure_keeps_draining() {
        let (api, ch) = controller("USBCAN2", 0);
        ch.open().unwrap();
        api.fail(MockCall::Transmit);
        for i in 0..60u32 {
            ch.write(CanFrame::new(i, &[])).unwrap();
        }
        assert_eq!(ch.write_tick(), 0);
        assert_eq!(api.call_count(MockCall::Transmit), 2);
        assert!(matches!(ch.last_error(), Some(Error::WriteError(_))));
        assert_eq!(ch.state(), ChannelState::Open);
    }

    #[test]
    fn short_transmit_is_reported() {
        let (api, ch) = controller("USBCAN2", 0);
        ch.open().unwrap();
        api.set_transmit_limit(Some(30));
        api.set_error_code(codes::CAN_BUSERR);
        let mut events = ch.subscribe();
        for i in 0..50u32 {
            ch.write(CanFrame::new(i, &[i as u8])).unwrap();
        }

        assert_eq!(ch.write_tick(), 30);
        assert_eq!(api.transmit_calls(), vec![30]);
        let Some(Error::WriteError(message)) = ch.last_error() else {
            panic!("short transmit should leave a write error");
        };
        assert!(message.starts_with("20 of 50 frame(s) not sent"));
        assert!(matches!(
            events.try_recv(),
            Ok(BusEvent::Error {
                kind: BusErrorKind::WriteError,
                ..
            })
        ));
        assert_eq!(events.try_recv(), Ok(BusEvent::FramesWritten(30)));
    }

    #[test]
    fn read_drains_classic_before_fd() {
        let (api, ch) = controller("USBCANFD_200U", 0);
        ch.set_configuration(ConfigKey::CanFd, ConfigValue::Bool(true))
            .unwrap();
        ch.open().unwrap();
        api.push_receive_fd(0, fd_rx(0x200, 0x01, &[9; 16], 20));
        api.push_receive(0, classic_rx(0x100, &[1, 2], 10));

        assert_eq!(ch.read_tick(), 2);
        let frames: Vec<_> = ch.read_available().collect();
        assert_eq!(frames[0].id(), 0x100);
        assert!(!frames[0].is_fd());
        assert_eq!(frames[1].id(), 0x200);
        assert!(frames[1].is_fd());
        assert!(frames[1].bitrate_switch());
        assert_eq!(frames[1].timestamp(), 20);
    }

    #[test]
    fn fd_queue_is_ignored_when_fd_is_off() {
        let (api, ch) = controller("USBCANFD_200U", 0);
        ch.open().unwrap();
        api.push_receive_fd(0, fd_rx(0x200, 0, &[1], 0));
        assert_eq!(ch.read_tick(), 0);
        assert_eq!(api.call_count(MockCall::ReceiveFd), 0);
    }

    #[test]
    fn receive_failure_is_reported_and_channel_stays_open() {
        let (api, ch) = controller("USBCAN2", 0);
        ch.open().unwrap();
        api.push_receive(0, classic_rx(0x1, &[], 0));
        api.fail(MockCall::Receive);

        assert_eq!(ch.read_tick(), 0);
        assert!(matches!(ch.last_error(), Some(Error::ReadError(_))));
        assert_eq!(ch.state(), ChannelState::Open);
        assert!(ch.read_timer().is_active());
    }

    #[test]
    fn read_tick_after_close_disarms() {
        let (_api, ch) = controller("USBCAN2", 0);
        ch.open().unwrap();
        ch.close();
        ch.read_timer().start();
        assert_eq!(ch.read_tick(), 0);
        assert!(!ch.read_timer().is_active());
    }

    #[test]
    fn bus_status_follows_the_error_code() {
        let (api, ch) = controller("USBCAN2", 0);
        assert_eq!(ch.bus_status(), BusStatus::Unknown);
        ch.open().unwrap();
        assert_eq!(ch.bus_status(), BusStatus::Good);
        api.set_error_code(codes::CAN_PASSIVE);
        assert_eq!(ch.bus_status(), BusStatus::Error);
    }
}

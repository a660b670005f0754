use async_trait::async_trait;
use log::debug;
use std::io;
use std::sync::Arc;
use tokio::time::{Duration, sleep};

use crate::backend::ZlgCanBackend;
use crate::catalog::{ConfigKey, ConfigValue};
use crate::channel::ChannelController;
use crate::drivers::CanDriver;
use crate::frame::CanFrame;

/// [`CanDriver`] over one ZLG channel.
///
/// Writes are flushed to the adapter immediately; reads run one pass of the
/// read pump and return whatever it delivered.
pub struct ZlgCanDriver {
    controller: Arc<ChannelController>,
    configured_bitrate: Option<u32>,
}

impl ZlgCanDriver {
    /// Looks up `interface` (e.g. "USBCANFD_200U/0/1") without opening it.
    pub fn open(backend: &ZlgCanBackend, interface: &str) -> io::Result<Self> {
        let controller = backend.create_channel(interface)?;
        Ok(Self {
            controller: Arc::new(controller),
            configured_bitrate: None,
        })
    }

    pub fn controller(&self) -> &Arc<ChannelController> {
        &self.controller
    }

    pub fn device_label(&self) -> &str {
        self.controller.label()
    }

    /// Requests CAN-FD with the given data-phase bit-rate.
    pub fn set_fd(&mut self, data_bitrate: Option<u32>) -> io::Result<()> {
        self.controller
            .set_configuration(ConfigKey::CanFd, ConfigValue::Bool(true))?;
        if let Some(rate) = data_bitrate {
            self.controller
                .set_configuration(ConfigKey::DataBitRate, ConfigValue::UInt(rate))?;
        }
        Ok(())
    }
}

#[async_trait]
impl CanDriver for ZlgCanDriver {
    async fn enable_timestamp(&mut self) -> io::Result<()> {
        // Every ZLG receive record carries a hardware timestamp.
        Ok(())
    }

    async fn set_bitrate(&mut self, bitrate: u32) -> io::Result<()> {
        self.controller
            .set_configuration(ConfigKey::BitRate, ConfigValue::UInt(bitrate))?;
        self.configured_bitrate = Some(bitrate);
        Ok(())
    }

    async fn get_bitrate(&self) -> Option<u32> {
        self.configured_bitrate
    }

    async fn open_channel(&mut self) -> io::Result<()> {
        self.controller.open()?;
        Ok(())
    }

    /// Invalid or oversized frames are dropped by the write pump and are not
    /// an error here; only failures reported by this write are returned.
    async fn send_frame(&mut self, frame: &CanFrame) -> io::Result<()> {
        self.controller.write(frame.clone())?;
        self.controller.clear_last_error();
        if self.controller.write_tick() == 0 {
            if let Some(err) = self.controller.last_error() {
                return Err(err.into());
            }
            debug!("{}: dropped {:?}", self.controller.label(), frame);
        }
        Ok(())
    }

    async fn read_frames(&mut self) -> io::Result<Vec<CanFrame>> {
        self.controller.read_tick();
        if self.controller.frames_available() == 0 {
            sleep(Duration::from_millis(1)).await;
        }
        Ok(self.controller.read_available().collect())
    }

    async fn close_channel(&mut self) -> io::Result<()> {
        self.controller.close();
        Ok(())
    }
}

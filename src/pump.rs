//! Read/write pump scheduling.
//!
//! Each channel has two named periodic tasks. The channel arms and disarms
//! them; something else decides when they fire. Tests call the tick
//! functions directly, while [`spawn_pump`] drives them from tokio intervals.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::debug;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::channel::{ChannelController, ChannelState};

/// Native frame slots per transmit call.
pub const WRITE_BATCH: usize = 50;
/// Native frame slots per receive call.
pub const READ_BATCH: usize = 50;
/// Received frames are handed to the delivery queue in chunks of this size.
pub const DELIVERY_FLUSH: usize = 256;

/// An armable periodic task.
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    active: AtomicBool,
}

impl PeriodicTask {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            active: AtomicBool::new(false),
        }
    }

    /// Arms the task. Returns `false` if it was already armed.
    pub fn start(&self) -> bool {
        !self.active.swap(true, Ordering::AcqRel)
    }

    pub fn stop(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpConfig {
    pub read_interval: Duration,
    pub write_interval: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            read_interval: Duration::from_millis(1),
            write_interval: Duration::from_millis(1),
        }
    }
}

/// Runs the controller's read and write tasks until the channel is closed.
///
/// Spawn it after `open()`. A channel left `Failed` by a reset keeps its pump,
/// so reopening it resumes polling; once the channel is `Closed` with both
/// tasks disarmed the pump ends and must be spawned again after the next open.
pub fn spawn_pump(controller: Arc<ChannelController>, config: PumpConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut read = time::interval(config.read_interval);
        read.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut write = time::interval(config.write_interval);
        write.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = read.tick() => {
                    if controller.read_timer().is_active() {
                        controller.read_tick();
                    }
                }
                _ = write.tick() => {
                    if controller.write_timer().is_active() {
                        controller.write_tick();
                    }
                }
            }

            if controller.state() == ChannelState::Closed
                && !controller.read_timer().is_active()
                && !controller.write_timer().is_active()
            {
                break;
            }
        }
        debug!("Pump for {} stopped", controller.label());
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periodic_task_arms_once() {
        let task = PeriodicTask::new("read");
        assert!(!task.is_active());
        assert!(task.start());
        assert!(!task.start());
        assert!(task.is_active());
        task.stop();
        assert!(!task.is_active());
        assert_eq!(task.name(), "read");
    }

    #[test]
    fn default_intervals_are_one_millisecond() {
        let config = PumpConfig::default();
        assert_eq!(config.read_interval, Duration::from_millis(1));
        assert_eq!(config.write_interval, Duration::from_millis(1));
    }
}

//! Classification of `ZCAN_CHANNEL_ERR_INFO.error_code` values.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::native::{ChannelHandle, ZlgApi};

/// Error code bits reported by the adapter. Several may be set at once.
pub mod codes {
    pub const CAN_OVERFLOW: u32 = 0x0001;
    pub const CAN_ERRALARM: u32 = 0x0002;
    pub const CAN_PASSIVE: u32 = 0x0004;
    pub const CAN_LOSE: u32 = 0x0008;
    pub const CAN_BUSERR: u32 = 0x0010;
    pub const CAN_BUSOFF: u32 = 0x0020;
    pub const CAN_BUFFER_OVERFLOW: u32 = 0x0040;

    pub const DEVICEOPENED: u32 = 0x0100;
    pub const DEVICEOPEN: u32 = 0x0200;
    pub const DEVICENOTOPEN: u32 = 0x0400;
    pub const BUFFEROVERFLOW: u32 = 0x0800;
    pub const DEVICENOTEXIST: u32 = 0x1000;
    pub const LOADKERNELDLL: u32 = 0x2000;
    pub const CMDFAILED: u32 = 0x4000;
    pub const BUFFERCREATE: u32 = 0x8000;
}

pub const UNKNOWN_ERROR: &str = "Unknown error";

const MESSAGES: [(u32, &str); 15] = [
    (codes::CAN_OVERFLOW, "CAN controller FIFO overflow"),
    (codes::CAN_ERRALARM, "CAN controller alarm"),
    (codes::CAN_PASSIVE, "CAN controller passive"),
    (codes::CAN_LOSE, "CAN controller arbitration lost"),
    (codes::CAN_BUSERR, "CAN controller bus error"),
    (codes::CAN_BUSOFF, "CAN controller bus off"),
    (codes::CAN_BUFFER_OVERFLOW, "CAN buffer overflow"),
    (codes::DEVICEOPENED, "Device opened"),
    (codes::DEVICEOPEN, "Open device error"),
    (codes::DEVICENOTOPEN, "Device not open"),
    (codes::BUFFEROVERFLOW, "Buffer overflow"),
    (codes::DEVICENOTEXIST, "Device not exist"),
    (codes::LOADKERNELDLL, "Load kernel dll error"),
    (codes::CMDFAILED, "Run command error"),
    (codes::BUFFERCREATE, "Create buffer error"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusStatus {
    Good,
    Warning,
    Error,
    BusOff,
    Unknown,
}

impl fmt::Display for BusStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            BusStatus::Good => "good",
            BusStatus::Warning => "warning",
            BusStatus::Error => "error",
            BusStatus::BusOff => "bus-off",
            BusStatus::Unknown => "unknown",
        };
        f.write_str(text)
    }
}

/// Text of the lowest recognised bit in `code`.
pub fn message(code: u32) -> &'static str {
    MESSAGES
        .iter()
        .find(|(bit, _)| code & bit != 0)
        .map_or(UNKNOWN_ERROR, |(_, text)| text)
}

/// Maps an error code to a bus condition and its description.
///
/// The checks run in a fixed order and the first one that matches decides
/// the status, so a combined alarm and bus-off code reports `Warning`.
pub fn classify(code: u32) -> (BusStatus, &'static str) {
    use codes::*;

    let status = if code & (CAN_ERRALARM | CAN_LOSE) != 0 {
        BusStatus::Warning
    } else if code & (CAN_PASSIVE | CAN_BUSERR) != 0 {
        BusStatus::Error
    } else if code & CAN_BUSOFF != 0 {
        BusStatus::BusOff
    } else {
        BusStatus::Unknown
    };
    (status, message(code))
}

/// Reads the channel's last error and returns its description.
///
/// Without a channel handle (device open failed, or init never produced
/// one) there is nothing to query and the generic text is returned.
pub fn describe(api: &dyn ZlgApi, channel: Option<ChannelHandle>) -> &'static str {
    channel
        .and_then(|channel| api.read_channel_err_info(channel))
        .map_or(UNKNOWN_ERROR, |info| message(info.error_code))
}

/// Current bus condition of an open channel.
pub fn bus_status(api: &dyn ZlgApi, channel: Option<ChannelHandle>) -> BusStatus {
    let Some(info) = channel.and_then(|channel| api.read_channel_err_info(channel)) else {
        return BusStatus::Unknown;
    };
    match info.error_code {
        0 => BusStatus::Good,
        code => classify(code).0,
    }
}

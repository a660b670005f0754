//! Conversion between [`CanFrame`] and the adapter's classic / CAN-FD records.
//!
//! Callers must filter frames that do not fit the target format first; the
//! encoders truncate anything beyond the native capacity.

use crate::frame::{CAN_MAX_DLEN, CANFD_MAX_DLEN, CanFrame, FrameKind};
use crate::native::ffi::{
    CAN_EFF_FLAG, CAN_ERR_FLAG, CAN_ID_MASK, CAN_RTR_FLAG, CANFD_BRS, RawCanFdFrame, RawCanFrame,
    ReceiveData, ReceiveFdData, TRANSMIT_NORMAL, TransmitData, TransmitFdData,
};

fn pack_id(frame: &CanFrame) -> u32 {
    let mut id = frame.id() & CAN_ID_MASK;
    if frame.is_extended() {
        id |= CAN_EFF_FLAG;
    }
    match frame.kind() {
        FrameKind::Remote => id |= CAN_RTR_FLAG,
        FrameKind::Error => id |= CAN_ERR_FLAG,
        FrameKind::Data => {}
    }
    id
}

pub fn encode_classic(frame: &CanFrame) -> TransmitData {
    let len = frame.dlc().min(CAN_MAX_DLEN);
    let mut raw = RawCanFrame {
        can_id: pack_id(frame),
        can_dlc: len as u8,
        ..Default::default()
    };
    raw.data[..len].copy_from_slice(&frame.data()[..len]);
    TransmitData {
        frame: raw,
        transmit_type: TRANSMIT_NORMAL,
    }
}

pub fn encode_fd(frame: &CanFrame) -> TransmitFdData {
    let len = frame.dlc().min(CANFD_MAX_DLEN);
    let mut raw = RawCanFdFrame {
        can_id: pack_id(frame),
        len: len as u8,
        flags: if frame.bitrate_switch() { CANFD_BRS } else { 0 },
        ..Default::default()
    };
    raw.data[..len].copy_from_slice(&frame.data()[..len]);
    TransmitFdData {
        frame: raw,
        transmit_type: TRANSMIT_NORMAL,
    }
}

/// Error takes precedence over remote, which takes precedence over data.
pub fn decode_classic(data: &ReceiveData) -> CanFrame {
    let raw = &data.frame;
    let kind = if raw.can_id & CAN_ERR_FLAG != 0 {
        FrameKind::Error
    } else if raw.can_id & CAN_RTR_FLAG != 0 {
        FrameKind::Remote
    } else {
        FrameKind::Data
    };
    let len = (raw.can_dlc as usize).min(CAN_MAX_DLEN);
    CanFrame::with_parts(
        raw.can_id & CAN_ID_MASK,
        raw.can_id & CAN_EFF_FLAG != 0,
        kind,
        false,
        false,
        &raw.data[..len],
    )
    .with_timestamp(data.timestamp)
}

/// FD records have no remote frames; a set RTR bit is ignored.
pub fn decode_fd(data: &ReceiveFdData) -> CanFrame {
    let raw = &data.frame;
    let kind = if raw.can_id & CAN_ERR_FLAG != 0 {
        FrameKind::Error
    } else {
        FrameKind::Data
    };
    let len = (raw.len as usize).min(CANFD_MAX_DLEN);
    CanFrame::with_parts(
        raw.can_id & CAN_ID_MASK,
        raw.can_id & CAN_EFF_FLAG != 0,
        kind,
        true,
        raw.flags & CANFD_BRS != 0,
        &raw.data[..len],
    )
    .with_timestamp(data.timestamp)
}

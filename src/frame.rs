//! Canonical CAN / CAN-FD frame shared by the drivers, the pumps and the tools.

use serde::{Deserialize, Serialize};

pub const CAN_SFF_MASK: u32 = 0x0000_07FF; // standard id mask (11-bit)
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF; // extended id mask (29-bit)

pub const CAN_MAX_DLEN: usize = 8;
pub const CANFD_MAX_DLEN: usize = 64;

/// Payload lengths a CAN-FD DLC can express.
const CANFD_LENGTHS: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    Data,
    Remote,
    Error,
}

/// An immutable CAN frame value.
///
/// Constructors never reject input; use [`CanFrame::is_valid`] to check the
/// frame against the classic / FD format rules before handing it to a bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanFrame {
    id: u32,
    extended: bool,
    kind: FrameKind,
    fd: bool,
    bitrate_switch: bool,
    payload: Vec<u8>,
    /// Microseconds, as reported by the adapter.
    timestamp: u64,
}

impl CanFrame {
    /// Classic data frame with an 11-bit identifier.
    pub fn new(id: u32, data: &[u8]) -> Self {
        Self::with_parts(id, false, FrameKind::Data, false, false, data)
    }

    /// Classic data frame with a 29-bit identifier.
    pub fn new_eff(id: u32, data: &[u8]) -> Self {
        Self::with_parts(id, true, FrameKind::Data, false, false, data)
    }

    /// Remote request; the payload is `dlc` zero bytes so the DLC survives transcoding.
    pub fn new_remote(id: u32, dlc: usize, extended: bool) -> Self {
        let data = vec![0u8; dlc];
        Self::with_parts(id, extended, FrameKind::Remote, false, false, &data)
    }

    pub fn new_error(error_class: u32) -> Self {
        Self::with_parts(error_class, false, FrameKind::Error, false, false, &[])
    }

    pub fn new_fd(id: u32, data: &[u8], extended: bool, bitrate_switch: bool) -> Self {
        Self::with_parts(id, extended, FrameKind::Data, true, bitrate_switch, data)
    }

    pub(crate) fn with_parts(
        id: u32,
        extended: bool,
        kind: FrameKind,
        fd: bool,
        bitrate_switch: bool,
        data: &[u8],
    ) -> Self {
        Self {
            id,
            extended,
            kind,
            fd,
            bitrate_switch,
            payload: data.to_vec(),
            timestamp: 0,
        }
    }

    pub fn with_timestamp(mut self, timestamp_us: u64) -> Self {
        self.timestamp = timestamp_us;
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn is_rtr(&self) -> bool {
        self.kind == FrameKind::Remote
    }

    pub fn is_error(&self) -> bool {
        self.kind == FrameKind::Error
    }

    pub fn is_fd(&self) -> bool {
        self.fd
    }

    pub fn bitrate_switch(&self) -> bool {
        self.bitrate_switch
    }

    pub fn data(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length; for CAN-FD frames this is the byte count, not the DLC code.
    pub fn dlc(&self) -> usize {
        self.payload.len()
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn is_valid(&self) -> bool {
        let id_mask = if self.extended || self.kind == FrameKind::Error {
            CAN_EFF_MASK
        } else {
            CAN_SFF_MASK
        };
        if self.id & !id_mask != 0 {
            return false;
        }

        let len = self.payload.len();
        match self.kind {
            FrameKind::Remote => !self.fd && !self.bitrate_switch && len <= CAN_MAX_DLEN,
            FrameKind::Data | FrameKind::Error if self.fd => CANFD_LENGTHS.contains(&len),
            FrameKind::Data | FrameKind::Error => !self.bitrate_switch && len <= CAN_MAX_DLEN,
        }
    }
}

//! `#[repr(C)]` mirrors of the zlgcan.h structures exchanged with the vendor library.
#![allow(dead_code)]

//
// CAN ID flags/masks (zlgcan.h follows <linux/can.h>)
//
pub const CAN_EFF_FLAG: u32 = 0x8000_0000; // extended frame format
pub const CAN_RTR_FLAG: u32 = 0x4000_0000; // remote transmission request
pub const CAN_ERR_FLAG: u32 = 0x2000_0000; // error frame
pub const CAN_ID_MASK: u32 = 0x1FFF_FFFF;

//
// canfd_frame.flags
//
pub const CANFD_BRS: u8 = 0x01; // bit rate switch (second bitrate for payload data)
pub const CANFD_ESI: u8 = 0x02; // error state indicator of the transmitting node

pub const STATUS_ERR: u32 = 0;
pub const STATUS_OK: u32 = 1;

/// `ZCAN_CHANNEL_INIT_CONFIG.can_type`
pub const TYPE_CAN: u32 = 0;
pub const TYPE_CANFD: u32 = 1;

/// Accept-all acceptance filter.
pub const ACC_CODE_ALL: u32 = 0;
pub const ACC_MASK_ALL: u32 = 0xFFFF_FFFF;

/// `ZCAN_Transmit_Data.transmit_type`: 0 = normal send (with retransmission).
pub const TRANSMIT_NORMAL: u32 = 0;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawCanFrame {
    pub can_id: u32,
    pub can_dlc: u8,
    pub pad: u8,
    pub res0: u8,
    pub res1: u8,
    pub data: [u8; 8],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCanFdFrame {
    pub can_id: u32,
    pub len: u8,
    pub flags: u8,
    pub res0: u8,
    pub res1: u8,
    pub data: [u8; 64],
}

impl Default for RawCanFdFrame {
    fn default() -> Self {
        Self {
            can_id: 0,
            len: 0,
            flags: 0,
            res0: 0,
            res1: 0,
            data: [0u8; 64],
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransmitData {
    pub frame: RawCanFrame,
    pub transmit_type: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveData {
    pub frame: RawCanFrame,
    pub timestamp: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransmitFdData {
    pub frame: RawCanFdFrame,
    pub transmit_type: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveFdData {
    pub frame: RawCanFdFrame,
    pub timestamp: u64,
}

impl ReceiveData {
    pub fn new(frame: RawCanFrame, timestamp: u64) -> Self {
        Self { frame, timestamp }
    }
}

impl ReceiveFdData {
    pub fn new(frame: RawCanFdFrame, timestamp: u64) -> Self {
        Self { frame, timestamp }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelErrInfo {
    pub error_code: u32,
    pub passive_err_data: [u8; 3],
    pub ar_lost_err_data: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CanInitConfig {
    pub acc_code: u32,
    pub acc_mask: u32,
    pub reserved: u32,
    pub filter: u8,
    pub timing0: u8,
    pub timing1: u8,
    pub mode: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CanFdInitConfig {
    pub acc_code: u32,
    pub acc_mask: u32,
    pub abit_timing: u32,
    pub dbit_timing: u32,
    pub brp: u32,
    pub filter: u8,
    pub mode: u8,
    pub pad: u16,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union InitConfigUnion {
    pub can: CanInitConfig,
    pub canfd: CanFdInitConfig,
}

/// `ZCAN_CHANNEL_INIT_CONFIG`
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ChannelInitConfig {
    pub can_type: u32,
    pub config: InitConfigUnion,
}

impl ChannelInitConfig {
    /// Accept-all filter for either the classic or the CAN-FD parameter set.
    pub fn accept_all(fd: bool) -> Self {
        if fd {
            Self {
                can_type: TYPE_CANFD,
                config: InitConfigUnion {
                    canfd: CanFdInitConfig {
                        acc_code: ACC_CODE_ALL,
                        acc_mask: ACC_MASK_ALL,
                        ..Default::default()
                    },
                },
            }
        } else {
            Self {
                can_type: TYPE_CAN,
                config: InitConfigUnion {
                    can: CanInitConfig {
                        acc_code: ACC_CODE_ALL,
                        acc_mask: ACC_MASK_ALL,
                        ..Default::default()
                    },
                },
            }
        }
    }

    pub fn is_fd(&self) -> bool {
        self.can_type == TYPE_CANFD
    }

    /// `(acc_code, acc_mask)` of whichever parameter set `can_type` selects.
    pub fn acceptance(&self) -> (u32, u32) {
        // SAFETY: can_type selects the initialised union member.
        unsafe {
            if self.is_fd() {
                (self.config.canfd.acc_code, self.config.canfd.acc_mask)
            } else {
                (self.config.can.acc_code, self.config.can.acc_mask)
            }
        }
    }
}

impl std::fmt::Debug for ChannelInitConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (acc_code, acc_mask) = self.acceptance();
        f.debug_struct("ChannelInitConfig")
            .field("can_type", &self.can_type)
            .field("acc_code", &acc_code)
            .field("acc_mask", &format_args!("{:#010x}", acc_mask))
            .finish()
    }
}

use std::ffi::{CString, OsStr, c_char, c_int, c_uint, c_void};

use libloading::{Library, Symbol};
use log::{debug, info};

use super::ffi::{
    ChannelErrInfo, ChannelInitConfig, ReceiveData, ReceiveFdData, STATUS_OK, TransmitData,
    TransmitFdData,
};
use super::{ChannelHandle, DeviceHandle, FrameFormat, PropertyHandle, ZlgApi};
use crate::error::{Error, Result};

/// Environment variable overriding the library path used by [`LibraryApi::load_default`].
pub const ZLGCAN_LIBRARY_VAR: &str = "ZLGCAN_LIBRARY";

#[cfg(windows)]
const DEFAULT_LIBRARY: &str = "zlgcan.dll";
#[cfg(not(windows))]
const DEFAULT_LIBRARY: &str = "libusbcanfd.so";

type OpenDeviceFn = unsafe extern "system" fn(c_uint, c_uint, c_uint) -> *mut c_void;
type CloseDeviceFn = unsafe extern "system" fn(*mut c_void) -> c_uint;
type InitCanFn =
    unsafe extern "system" fn(*mut c_void, c_uint, *mut ChannelInitConfig) -> *mut c_void;
type ChannelCallFn = unsafe extern "system" fn(*mut c_void) -> c_uint;
type GetReceiveNumFn = unsafe extern "system" fn(*mut c_void, u8) -> c_uint;
type TransmitFn = unsafe extern "system" fn(*mut c_void, *mut TransmitData, c_uint) -> c_uint;
type TransmitFdFn = unsafe extern "system" fn(*mut c_void, *mut TransmitFdData, c_uint) -> c_uint;
type ReceiveFn = unsafe extern "system" fn(*mut c_void, *mut ReceiveData, c_uint, c_int) -> c_uint;
type ReceiveFdFn =
    unsafe extern "system" fn(*mut c_void, *mut ReceiveFdData, c_uint, c_int) -> c_uint;
type SetValueFn = unsafe extern "system" fn(*mut c_void, *const c_char, *const c_void) -> c_uint;
type GetIPropertyFn = unsafe extern "system" fn(*mut c_void) -> *mut IProperty;
type ReleaseIPropertyFn = unsafe extern "system" fn(*mut IProperty) -> c_uint;
type ReadChannelErrInfoFn = unsafe extern "system" fn(*mut c_void, *mut ChannelErrInfo) -> c_uint;

/// Function table returned by `GetIProperty`.
#[repr(C)]
struct IProperty {
    set_value: Option<unsafe extern "C" fn(*const c_char, *const c_char) -> c_int>,
    get_value: Option<unsafe extern "C" fn(*const c_char) -> *const c_char>,
    get_propertys: *const c_void,
}

/// [`ZlgApi`] bound to the vendor library (zlgcan.dll / libusbcanfd.so) at runtime.
pub struct LibraryApi {
    open_device: OpenDeviceFn,
    close_device: CloseDeviceFn,
    init_can: InitCanFn,
    start_can: ChannelCallFn,
    reset_can: ChannelCallFn,
    get_receive_num: GetReceiveNumFn,
    transmit: TransmitFn,
    transmit_fd: TransmitFdFn,
    receive: ReceiveFn,
    receive_fd: ReceiveFdFn,
    set_value: SetValueFn,
    get_iproperty: GetIPropertyFn,
    release_iproperty: ReleaseIPropertyFn,
    read_channel_err_info: ReadChannelErrInfoFn,
    // Keeps the resolved function pointers above valid.
    _library: Library,
}

unsafe fn symbol<T: Copy>(library: &Library, name: &str) -> Result<T> {
    let sym: Symbol<T> = unsafe { library.get(name.as_bytes()) }
        .map_err(|e| Error::Library(format!("missing symbol {name}: {e}")))?;
    Ok(*sym)
}

impl LibraryApi {
    /// Loads the vendor library from `path` and resolves every entry point.
    pub fn load(path: impl AsRef<OsStr>) -> Result<Self> {
        let path = path.as_ref();
        let library = unsafe { Library::new(path) }
            .map_err(|e| Error::Library(format!("cannot load {}: {e}", path.to_string_lossy())))?;

        let api = unsafe {
            LibraryApi {
                open_device: symbol(&library, "ZCAN_OpenDevice")?,
                close_device: symbol(&library, "ZCAN_CloseDevice")?,
                init_can: symbol(&library, "ZCAN_InitCAN")?,
                start_can: symbol(&library, "ZCAN_StartCAN")?,
                reset_can: symbol(&library, "ZCAN_ResetCAN")?,
                get_receive_num: symbol(&library, "ZCAN_GetReceiveNum")?,
                transmit: symbol(&library, "ZCAN_Transmit")?,
                transmit_fd: symbol(&library, "ZCAN_TransmitFD")?,
                receive: symbol(&library, "ZCAN_Receive")?,
                receive_fd: symbol(&library, "ZCAN_ReceiveFD")?,
                set_value: symbol(&library, "ZCAN_SetValue")?,
                get_iproperty: symbol(&library, "GetIProperty")?,
                release_iproperty: symbol(&library, "ReleaseIProperty")?,
                read_channel_err_info: symbol(&library, "ZCAN_ReadChannelErrInfo")?,
                _library: library,
            }
        };

        info!("Loaded ZLG library {}", path.to_string_lossy());
        Ok(api)
    }

    /// Loads the library named by `ZLGCAN_LIBRARY`, or the platform default.
    pub fn load_default() -> Result<Self> {
        match std::env::var_os(ZLGCAN_LIBRARY_VAR) {
            Some(path) => Self::load(path),
            None => Self::load(DEFAULT_LIBRARY),
        }
    }
}

fn device_ptr(device: DeviceHandle) -> *mut c_void {
    device.as_raw() as *mut c_void
}

fn channel_ptr(channel: ChannelHandle) -> *mut c_void {
    channel.as_raw() as *mut c_void
}

fn property_ptr(property: PropertyHandle) -> *mut IProperty {
    property.as_raw() as *mut IProperty
}

fn signed_count(ret: c_uint) -> Option<usize> {
    // The driver signals failure with (UINT)-1.
    if (ret as c_int) < 0 {
        None
    } else {
        Some(ret as usize)
    }
}

impl ZlgApi for LibraryApi {
    fn open_device(&self, device_type: u32, device_index: u32) -> Option<DeviceHandle> {
        let raw = unsafe { (self.open_device)(device_type, device_index, 0) };
        DeviceHandle::from_raw(raw as usize)
    }

    fn close_device(&self, device: DeviceHandle) -> bool {
        unsafe { (self.close_device)(device_ptr(device)) == STATUS_OK }
    }

    fn init_can(
        &self,
        device: DeviceHandle,
        channel_index: u32,
        config: &ChannelInitConfig,
    ) -> Option<ChannelHandle> {
        let mut config = *config;
        let raw = unsafe { (self.init_can)(device_ptr(device), channel_index, &mut config) };
        ChannelHandle::from_raw(raw as usize)
    }

    fn start_can(&self, channel: ChannelHandle) -> bool {
        unsafe { (self.start_can)(channel_ptr(channel)) == STATUS_OK }
    }

    fn reset_can(&self, channel: ChannelHandle) -> bool {
        unsafe { (self.reset_can)(channel_ptr(channel)) == STATUS_OK }
    }

    fn receive_num(&self, channel: ChannelHandle, format: FrameFormat) -> u32 {
        unsafe { (self.get_receive_num)(channel_ptr(channel), format as u8) }
    }

    fn transmit(&self, channel: ChannelHandle, frames: &[TransmitData]) -> u32 {
        if frames.is_empty() {
            return 0;
        }
        // The driver takes a non-const pointer but never writes through it.
        unsafe {
            (self.transmit)(
                channel_ptr(channel),
                frames.as_ptr() as *mut TransmitData,
                frames.len() as c_uint,
            )
        }
    }

    fn transmit_fd(&self, channel: ChannelHandle, frames: &[TransmitFdData]) -> u32 {
        if frames.is_empty() {
            return 0;
        }
        unsafe {
            (self.transmit_fd)(
                channel_ptr(channel),
                frames.as_ptr() as *mut TransmitFdData,
                frames.len() as c_uint,
            )
        }
    }

    fn receive(
        &self,
        channel: ChannelHandle,
        buffer: &mut [ReceiveData],
        wait_ms: i32,
    ) -> Option<usize> {
        let ret = unsafe {
            (self.receive)(
                channel_ptr(channel),
                buffer.as_mut_ptr(),
                buffer.len() as c_uint,
                wait_ms,
            )
        };
        signed_count(ret).map(|n| n.min(buffer.len()))
    }

    fn receive_fd(
        &self,
        channel: ChannelHandle,
        buffer: &mut [ReceiveFdData],
        wait_ms: i32,
    ) -> Option<usize> {
        let ret = unsafe {
            (self.receive_fd)(
                channel_ptr(channel),
                buffer.as_mut_ptr(),
                buffer.len() as c_uint,
                wait_ms,
            )
        };
        signed_count(ret).map(|n| n.min(buffer.len()))
    }

    fn set_value(&self, device: DeviceHandle, path: &str, value: &str) -> bool {
        let (Ok(path), Ok(value)) = (CString::new(path), CString::new(value)) else {
            return false;
        };
        debug!("ZCAN_SetValue {:?} = {:?}", path, value);
        unsafe {
            (self.set_value)(
                device_ptr(device),
                path.as_ptr(),
                value.as_ptr() as *const c_void,
            ) == STATUS_OK
        }
    }

    fn get_property(&self, device: DeviceHandle) -> Option<PropertyHandle> {
        let raw = unsafe { (self.get_iproperty)(device_ptr(device)) };
        PropertyHandle::from_raw(raw as usize)
    }

    fn set_property(&self, property: PropertyHandle, path: &str, value: &str) -> bool {
        let (Ok(path), Ok(value)) = (CString::new(path), CString::new(value)) else {
            return false;
        };
        let table = property_ptr(property);
        if table.is_null() {
            return false;
        }
        // SAFETY: the handle came from GetIProperty and has not been released yet.
        match unsafe { (*table).set_value } {
            Some(set_value) => unsafe { set_value(path.as_ptr(), value.as_ptr()) != 0 },
            None => false,
        }
    }

    fn release_property(&self, property: PropertyHandle) {
        unsafe {
            (self.release_iproperty)(property_ptr(property));
        }
    }

    fn read_channel_err_info(&self, channel: ChannelHandle) -> Option<ChannelErrInfo> {
        let mut info = ChannelErrInfo::default();
        let status = unsafe { (self.read_channel_err_info)(channel_ptr(channel), &mut info) };
        (status == STATUS_OK).then_some(info)
    }
}

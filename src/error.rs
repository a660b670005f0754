use std::io;

/// Errors surfaced by channel management and frame I/O.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Bad channel index, unknown device type or unsupported configuration key.
    #[error("Invalid channel: {0}")]
    InvalidChannel(String),

    /// Another controller already holds this channel open.
    #[error(
        "Channel {channel_index} of device type {device_type} index {device_index} is already open"
    )]
    AlreadyOpen {
        device_type: u32,
        device_index: u32,
        channel_index: u32,
    },

    #[error("Channel is not open")]
    NotOpen,

    /// Native open/init/start failure. The channel has been rolled back to closed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A configuration value was rejected by the adapter.
    #[error("Configuration failed: {0}")]
    ConfigurationFailed(String),

    #[error("Write error: {0}")]
    WriteError(String),

    #[error("Read error: {0}")]
    ReadError(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Malformed device catalog document.
    #[error("Device catalog error: {0}")]
    Catalog(String),

    /// The vendor library or one of its symbols could not be loaded.
    #[error("ZLG library error: {0}")]
    Library(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::InvalidChannel(_) => io::ErrorKind::InvalidInput,
            Error::AlreadyOpen { .. } => io::ErrorKind::ResourceBusy,
            Error::NotOpen => io::ErrorKind::NotConnected,
            Error::InvalidFrame(_) | Error::Catalog(_) => io::ErrorKind::InvalidData,
            Error::Library(_) => io::ErrorKind::NotFound,
            Error::ConnectionFailed(_)
            | Error::ConfigurationFailed(_)
            | Error::WriteError(_)
            | Error::ReadError(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

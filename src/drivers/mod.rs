pub mod can_driver;
pub mod zlgcan;

pub use can_driver::CanDriver;
pub use zlgcan::ZlgCanDriver;

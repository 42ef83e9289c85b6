//! Infrastructure adapters for the operating-system resources transports
//! drive: the `adb` executable and blocking serial ports.

pub mod adb;
pub mod serial_link;

pub use adb::{parse_device_serials, AdbCommand, AdbRunner};
pub use serial_link::{SerialIo, SerialLink};

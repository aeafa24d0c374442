//! Host-side Secure DFU driver for nRF52-family bootloaders.
//!
//! Takes a signed update package (a ZIP with firmware images and their init
//! packets) and streams each image to the target bootloader over BLE,
//! validating CRCs at every step and resuming interrupted transfers.

pub mod context;
pub mod error;
pub mod init_packet;
pub mod manager;
pub mod package;
pub mod protocol;
pub mod states;
pub mod transport;
pub mod transport_btleplug;

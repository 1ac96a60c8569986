//! Core I/O subsystem for an S/370 & ESA/390 emulator: main storage with
//! storage-key protection, the channel subsystem (CHS), and the
//! linkage-stack / cross-memory state machines (LSX).
//!
//! This crate does not interpret guest instructions. It exposes the
//! functions a CPU interpreter calls on privileged I/O and control-transfer
//! instructions (`channel::*`, `lsx::*`), and the trait a device handler
//! implements to participate in channel programs (`device::DeviceHandler`).

pub mod ccw;
pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod lsx;
pub mod scsw;
pub mod storage;

pub use error::ProgramCheck;

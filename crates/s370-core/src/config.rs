//! Device configuration types (spec SPEC_FULL.md §3.x "AMBIENT:
//! Configuration").
//!
//! Parsing a `.cnf`-style device-configuration file is out of scope for
//! this crate; `DeviceConfig` is the typed unit an external config-file
//! parser is expected to produce, and what tests and other callers build
//! directly to describe a device before constructing its `DeviceBlock`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The geometry fields a CKD-backed device needs at configuration time,
/// independent of any particular compressed-image crate so this module
/// doesn't have to depend on one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CkdGeometryConfig {
    pub heads: u32,
    pub bytes_per_track: u32,
}

/// What backs a configured device. Compressed CKD is the only backing
/// store this core ships.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeviceBacking {
    Ckd {
        path: PathBuf,
        geometry: CkdGeometryConfig,
    },
}

/// A device as an external config-file parser (or a test) would describe
/// it, before a handler is built and a `DeviceBlock` constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_number: u16,
    pub subchannel: u16,
    pub device_type: u16,
    pub backing: DeviceBacking,
}

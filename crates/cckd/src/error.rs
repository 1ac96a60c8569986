//! Host I/O and format errors (spec §7 family 4: "Host I/O errors").
//!
//! `cckd::store` promotes a live read/write failure to unit-check with
//! sense bit SENSE_EC through whatever `DeviceHandler` binds this crate
//! to `s370-core` (see `crates/scenarios`); `cckd::repair::chkdsk`
//! instead returns `Err` directly and lets the `cckdcdsk` binary turn
//! that into the documented negative exit code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CckdError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a compressed CKD file (bad device-header identifier)")]
    BadIdentifier,

    #[error("unsupported device type {0:#04x}")]
    UnsupportedDeviceType(u8),

    #[error("cylinder count {cyls} is not valid for this device type")]
    InvalidCylinderCount { cyls: u32 },

    #[error("L1-entry count {found} does not match the expected {expected}")]
    BadL1Count { found: u32, expected: u32 },

    #[error("file byte order does not match this host's native order and cannot be byte-swapped")]
    EndianMismatch,

    #[error("file has the opened bit set; it must be repaired before being written to")]
    HeaderDirty,

    #[error("track {track} is out of range (device has {total} tracks)")]
    TrackOutOfRange { track: u32, total: u32 },

    #[error("L1 entry for track group {group} points outside the file")]
    InvalidL1Entry { group: u32 },

    #[error("L2 entry for track {track} is inconsistent: {reason}")]
    InvalidL2Entry { track: u32, reason: String },

    #[error("corrupt track image at track {track}: {reason}")]
    CorruptTrackImage { track: u32, reason: String },

    #[error("free-space chain is corrupt: {reason}")]
    FreeChainCorrupt { reason: String },

    #[error("unknown compression kind byte {0:#04x}")]
    UnknownCompression(u8),

    #[error("image is unrepairable: {0}")]
    Unrepairable(String),
}

pub type Result<T> = std::result::Result<T, CckdError>;

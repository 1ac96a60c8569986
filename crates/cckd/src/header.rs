//! On-disk header and table layouts (spec §3 "Compressed-CKD Image
//! File"). Field names follow the original's `CKDDASD_DEVHDR` /
//! `CCKDDASD_DEVHDR` / `CCKD_L2TAB` / `CCKD_FREEBLK` naming
//! (`devhdr.devid/devtype`, `cdevhdr.cyls/numl1tab/free*`), which the
//! repair engine in `crate::repair` reads back by the same names.

use crate::error::{CckdError, Result};

pub const DEVICE_HEADER_SIZE: usize = 512;
pub const COMPRESSED_DEVICE_HEADER_SIZE: usize = 512;
pub const DEVID: &[u8; 8] = b"CKD_C370";

pub const L1_ENTRY_SIZE: u32 = 4;
pub const L2_ENTRY_SIZE: u32 = 12;
pub const L2_TABLE_ENTRIES: u32 = 256;
pub const L2_TABLE_SIZE: u32 = L2_ENTRY_SIZE * L2_TABLE_ENTRIES;
pub const FREEBLK_SIZE: u32 = 8;

pub const DEVICE_HEADER_POS: u64 = 0;
pub const COMPRESSED_DEVICE_HEADER_POS: u64 = DEVICE_HEADER_SIZE as u64;
pub const L1_TABLE_POS: u64 = COMPRESSED_DEVICE_HEADER_POS + COMPRESSED_DEVICE_HEADER_SIZE as u64;

bitflags::bitflags! {
    /// The compressed device header's options byte (spec §4.2 "Byte
    /// order", "Open bit").
    #[derive(Default)]
    pub struct CdevOptions: u8 {
        /// Set when the writer's native byte order is big-endian.
        const BIGENDIAN = 0x80;
        /// Set on first modification, cleared on clean close.
        const OPENED    = 0x01;
    }
}

fn host_is_big_endian() -> bool {
    cfg!(target_endian = "big")
}

/// The plain CKD device header, shared with uncompressed CKD images in
/// the original (spec §3, 512 bytes at offset 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHeader {
    pub devtype: u8,
    pub heads: u32,
    pub trklen: u32,
}

impl DeviceHeader {
    pub fn to_bytes(self) -> [u8; DEVICE_HEADER_SIZE] {
        let mut b = [0u8; DEVICE_HEADER_SIZE];
        b[0..8].copy_from_slice(DEVID);
        b[8] = self.devtype;
        b[9..13].copy_from_slice(&self.heads.to_le_bytes());
        b[13..17].copy_from_slice(&self.trklen.to_le_bytes());
        b
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        if &b[0..8] != DEVID {
            return Err(CckdError::BadIdentifier);
        }
        Ok(DeviceHeader {
            devtype: b[8],
            heads: u32::from_le_bytes(b[9..13].try_into().unwrap()),
            trklen: u32::from_le_bytes(b[13..17].try_into().unwrap()),
        })
    }
}

/// The compressed-CKD-specific device header (spec §3, 512 bytes
/// immediately following the device header). Statistics fields are
/// advisory (spec §4.2 "Header statistics"); `crate::repair` is the
/// source of truth and recomputes them from scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompressedDeviceHeader {
    pub options: CdevOptions,
    pub cyls: u32,
    pub numl1tab: u32,
    /// Total file size, advisory.
    pub size: u32,
    /// Bytes used by device/compressed headers, tables, and track
    /// images, advisory.
    pub used: u32,
    /// First free-block offset; 0 means the free chain is empty.
    pub free: u32,
    pub free_number: u32,
    pub free_total: u32,
    pub free_imbed: u32,
    pub free_largest: u32,
}

impl CompressedDeviceHeader {
    pub fn to_bytes(self) -> [u8; COMPRESSED_DEVICE_HEADER_SIZE] {
        let mut b = [0u8; COMPRESSED_DEVICE_HEADER_SIZE];
        b[0] = self.options.bits();
        b[1..5].copy_from_slice(&self.cyls.to_le_bytes());
        b[5..9].copy_from_slice(&self.numl1tab.to_le_bytes());
        b[9..13].copy_from_slice(&self.size.to_le_bytes());
        b[13..17].copy_from_slice(&self.used.to_le_bytes());
        b[17..21].copy_from_slice(&self.free.to_le_bytes());
        b[21..25].copy_from_slice(&self.free_number.to_le_bytes());
        b[25..29].copy_from_slice(&self.free_total.to_le_bytes());
        b[29..33].copy_from_slice(&self.free_imbed.to_le_bytes());
        b[33..37].copy_from_slice(&self.free_largest.to_le_bytes());
        b
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        let options = CdevOptions::from_bits_truncate(b[0]);
        let wrote_big_endian = options.contains(CdevOptions::BIGENDIAN);
        if wrote_big_endian != host_is_big_endian() {
            return Err(CckdError::EndianMismatch);
        }
        Ok(CompressedDeviceHeader {
            options,
            cyls: u32::from_le_bytes(b[1..5].try_into().unwrap()),
            numl1tab: u32::from_le_bytes(b[5..9].try_into().unwrap()),
            size: u32::from_le_bytes(b[9..13].try_into().unwrap()),
            used: u32::from_le_bytes(b[13..17].try_into().unwrap()),
            free: u32::from_le_bytes(b[17..21].try_into().unwrap()),
            free_number: u32::from_le_bytes(b[21..25].try_into().unwrap()),
            free_total: u32::from_le_bytes(b[25..29].try_into().unwrap()),
            free_imbed: u32::from_le_bytes(b[29..33].try_into().unwrap()),
            free_largest: u32::from_le_bytes(b[33..37].try_into().unwrap()),
        })
    }

    /// Stamp the options byte with this host's native endianness, as a
    /// new writer would (spec §4.2 "Byte order").
    pub fn with_native_endian_bit(mut self) -> Self {
        self.options.set(CdevOptions::BIGENDIAN, host_is_big_endian());
        self
    }
}

/// One level-2 table entry (spec §3 "Level-2 Table (L2TAB)").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct L2Entry {
    pub offset: u32,
    pub length: u32,
    pub size: u32,
}

impl L2Entry {
    pub fn is_absent(self) -> bool {
        self.offset == 0
    }

    pub fn to_bytes(self) -> [u8; L2_ENTRY_SIZE as usize] {
        let mut b = [0u8; L2_ENTRY_SIZE as usize];
        b[0..4].copy_from_slice(&self.offset.to_le_bytes());
        b[4..8].copy_from_slice(&self.length.to_le_bytes());
        b[8..12].copy_from_slice(&self.size.to_le_bytes());
        b
    }

    pub fn from_bytes(b: &[u8]) -> Self {
        L2Entry {
            offset: u32::from_le_bytes(b[0..4].try_into().unwrap()),
            length: u32::from_le_bytes(b[4..8].try_into().unwrap()),
            size: u32::from_le_bytes(b[8..12].try_into().unwrap()),
        }
    }
}

/// A full 256-entry level-2 table.
pub type L2Table = [L2Entry; 256];

pub fn l2_table_to_bytes(tab: &L2Table) -> Vec<u8> {
    let mut out = Vec::with_capacity(L2_TABLE_SIZE as usize);
    for e in tab {
        out.extend_from_slice(&e.to_bytes());
    }
    out
}

pub fn l2_table_from_bytes(b: &[u8]) -> L2Table {
    let mut tab = [L2Entry::default(); 256];
    for (i, t) in tab.iter_mut().enumerate() {
        *t = L2Entry::from_bytes(&b[i * L2_ENTRY_SIZE as usize..(i + 1) * L2_ENTRY_SIZE as usize]);
    }
    tab
}

/// A free-space chain node (spec §3 "Free Block").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FreeBlock {
    pub next: u32,
    pub length: u32,
}

impl FreeBlock {
    pub fn to_bytes(self) -> [u8; FREEBLK_SIZE as usize] {
        let mut b = [0u8; FREEBLK_SIZE as usize];
        b[0..4].copy_from_slice(&self.next.to_le_bytes());
        b[4..8].copy_from_slice(&self.length.to_le_bytes());
        b
    }

    pub fn from_bytes(b: &[u8]) -> Self {
        FreeBlock {
            next: u32::from_le_bytes(b[0..4].try_into().unwrap()),
            length: u32::from_le_bytes(b[4..8].try_into().unwrap()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_header_roundtrips() {
        let h = DeviceHeader { devtype: 0x30, heads: 19, trklen: 13030 };
        let b = h.to_bytes();
        assert_eq!(DeviceHeader::from_bytes(&b).unwrap(), h);
    }

    #[test]
    fn bad_identifier_is_rejected() {
        let mut b = [0u8; DEVICE_HEADER_SIZE];
        b[0..8].copy_from_slice(b"NOT_CKD_");
        assert!(matches!(DeviceHeader::from_bytes(&b), Err(CckdError::BadIdentifier)));
    }

    #[test]
    fn compressed_header_roundtrips_with_native_endian_bit() {
        let h = CompressedDeviceHeader {
            cyls: 404,
            numl1tab: (404 * 19 + 255) / 256,
            ..Default::default()
        }
        .with_native_endian_bit();
        let b = h.to_bytes();
        assert_eq!(CompressedDeviceHeader::from_bytes(&b).unwrap(), h);
    }

    #[test]
    fn foreign_endian_bit_is_rejected() {
        let mut h = CompressedDeviceHeader::default();
        h.options.set(CdevOptions::BIGENDIAN, !host_is_big_endian());
        let b = h.to_bytes();
        assert!(matches!(CompressedDeviceHeader::from_bytes(&b), Err(CckdError::EndianMismatch)));
    }

    #[test]
    fn l2_table_roundtrips() {
        let mut tab: L2Table = [L2Entry::default(); 256];
        tab[3] = L2Entry { offset: 4096, length: 512, size: 1024 };
        let b = l2_table_to_bytes(&tab);
        let back = l2_table_from_bytes(&b);
        assert_eq!(back[3], tab[3]);
        assert!(back[0].is_absent());
    }
}

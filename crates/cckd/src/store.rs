//! Random read/write access to a compressed-CKD image (spec §4.2
//! "Compressed-CKD Store"). `CckdImage` owns an open file-like handle
//! and the in-memory header/L1-table state a live device keeps cached;
//! `crate::repair` works directly against the headers and free-chain
//! primitives instead, since repair must tolerate the very
//! inconsistencies `CckdImage` refuses to open (spec §4.2 "Open bit").

use std::io::{Read, Seek, SeekFrom, Write};

use tracing::{debug, trace};

use crate::compress::CompressionKind;
use crate::devtypes::{self, CkdGeometry};
use crate::error::{CckdError, Result};
use crate::header::{
    self, CompressedDeviceHeader, DeviceHeader, FreeBlock, L2Entry, L2Table, FREEBLK_SIZE, L1_ENTRY_SIZE,
    L2_TABLE_SIZE,
};
use crate::track::{self, TrackImage};

/// A live compressed-CKD volume.
pub struct CckdImage<F> {
    file: F,
    devhdr: DeviceHeader,
    cdevhdr: CompressedDeviceHeader,
    l1: Vec<u32>,
    geometry: &'static CkdGeometry,
    compression: CompressionKind,
}

impl<F: Read + Write + Seek> CckdImage<F> {
    /// Format a brand-new, all-empty-tracks image onto `file` (spec
    /// §4.2; device-type geometry from `crate::devtypes`).
    pub fn create(mut file: F, devtype: u8, cyls: u32, compression: CompressionKind) -> Result<Self> {
        let geometry = devtypes::geometry_for(devtype)?;
        geometry.validate_cyls(cyls)?;
        let total_tracks = geometry.total_tracks(cyls);
        let numl1tab = total_tracks.div_ceil(256);

        let devhdr = DeviceHeader { devtype, heads: geometry.heads, trklen: geometry.max_data_len };
        let used = header::DEVICE_HEADER_SIZE as u32
            + header::COMPRESSED_DEVICE_HEADER_SIZE as u32
            + numl1tab * L1_ENTRY_SIZE;
        let cdevhdr = CompressedDeviceHeader {
            cyls,
            numl1tab,
            size: used,
            used,
            ..Default::default()
        }
        .with_native_endian_bit();

        file.seek(SeekFrom::Start(header::DEVICE_HEADER_POS))?;
        file.write_all(&devhdr.to_bytes())?;
        file.seek(SeekFrom::Start(header::COMPRESSED_DEVICE_HEADER_POS))?;
        file.write_all(&cdevhdr.to_bytes())?;
        file.seek(SeekFrom::Start(header::L1_TABLE_POS))?;
        let l1 = vec![0u32; numl1tab as usize];
        for entry in &l1 {
            file.write_all(&entry.to_le_bytes())?;
        }

        debug!(devtype, cyls, total_tracks, "formatted new compressed CKD image");

        Ok(CckdImage { file, devhdr, cdevhdr, l1, geometry, compression })
    }

    /// Open an existing image (spec §4.2 "Open bit": a file with the
    /// opened bit already set must be repaired before writes are
    /// accepted).
    pub fn open(mut file: F, compression: CompressionKind) -> Result<Self> {
        file.seek(SeekFrom::Start(header::DEVICE_HEADER_POS))?;
        let mut buf = [0u8; header::DEVICE_HEADER_SIZE];
        file.read_exact(&mut buf)?;
        let devhdr = DeviceHeader::from_bytes(&buf)?;

        let mut cbuf = [0u8; header::COMPRESSED_DEVICE_HEADER_SIZE];
        file.read_exact(&mut cbuf)?;
        let cdevhdr = CompressedDeviceHeader::from_bytes(&cbuf)?;
        if cdevhdr.options.contains(header::CdevOptions::OPENED) {
            return Err(CckdError::HeaderDirty);
        }

        let geometry = devtypes::geometry_for(devhdr.devtype)?;
        geometry.validate_cyls(cdevhdr.cyls)?;
        let expected_l1 = geometry.total_tracks(cdevhdr.cyls).div_ceil(256);
        if cdevhdr.numl1tab != expected_l1 {
            return Err(CckdError::BadL1Count { found: cdevhdr.numl1tab, expected: expected_l1 });
        }

        let mut l1 = Vec::with_capacity(cdevhdr.numl1tab as usize);
        for _ in 0..cdevhdr.numl1tab {
            let mut b = [0u8; 4];
            file.read_exact(&mut b)?;
            l1.push(u32::from_le_bytes(b));
        }

        Ok(CckdImage { file, devhdr, cdevhdr, l1, geometry, compression })
    }

    pub fn total_tracks(&self) -> u32 {
        self.geometry.total_tracks(self.cdevhdr.cyls)
    }

    fn cyl_head_of(&self, track: u32) -> (u16, u16) {
        ((track / self.geometry.heads) as u16, (track % self.geometry.heads) as u16)
    }

    fn check_track(&self, track: u32) -> Result<()> {
        let total = self.total_tracks();
        if track >= total {
            return Err(CckdError::TrackOutOfRange { track, total });
        }
        Ok(())
    }

    fn read_l2_table(&mut self, offset: u32) -> Result<L2Table> {
        self.file.seek(SeekFrom::Start(offset as u64))?;
        let mut b = vec![0u8; L2_TABLE_SIZE as usize];
        self.file.read_exact(&mut b)?;
        Ok(header::l2_table_from_bytes(&b))
    }

    fn write_l2_entry(&mut self, l2_table_offset: u32, l2_idx: u32, entry: L2Entry) -> Result<()> {
        let addr = l2_table_offset as u64 + (l2_idx * header::L2_ENTRY_SIZE) as u64;
        self.file.seek(SeekFrom::Start(addr))?;
        self.file.write_all(&entry.to_bytes())?;
        Ok(())
    }

    fn write_l1_entry(&mut self, idx: u32, offset: u32) -> Result<()> {
        self.l1[idx as usize] = offset;
        let addr = header::L1_TABLE_POS + (idx as u64) * L1_ENTRY_SIZE as u64;
        self.file.seek(SeekFrom::Start(addr))?;
        self.file.write_all(&offset.to_le_bytes())?;
        Ok(())
    }

    /// Read a track's uncompressed content (spec §4.2 "Track read").
    pub fn read_track(&mut self, track: u32) -> Result<Vec<u8>> {
        self.check_track(track)?;
        let (cyl, head) = self.cyl_head_of(track);
        let l1_idx = track >> 8;
        let l1_off = self.l1[l1_idx as usize];
        if l1_off == 0 {
            trace!(track, "read of never-written track, returning empty track");
            return Ok(track::empty_track(cyl, head));
        }

        let l2 = self.read_l2_table(l1_off)?;
        let entry = l2[(track & 0xFF) as usize];
        if entry.is_absent() {
            return Ok(track::empty_track(cyl, head));
        }

        self.file.seek(SeekFrom::Start(entry.offset as u64))?;
        let mut b = vec![0u8; entry.length as usize];
        self.file.read_exact(&mut b)?;
        let img = TrackImage::decode(&b)?;
        Ok(img.data)
    }

    /// Write a track's uncompressed content (spec §4.2 "Track write").
    pub fn write_track(&mut self, track: u32, data: &[u8]) -> Result<()> {
        self.check_track(track)?;
        if !self.cdevhdr.options.contains(header::CdevOptions::OPENED) {
            self.set_opened_bit(true)?;
        }
        let (cyl, head) = self.cyl_head_of(track);
        let img = TrackImage { compression: self.compression, cyl, head, data: data.to_vec() };
        let payload = img.encode()?;
        let length = payload.len() as u32;

        let l1_idx = track >> 8;
        let mut l1_off = self.l1[l1_idx as usize];
        if l1_off == 0 {
            let (off, size) = self.alloc_space(L2_TABLE_SIZE)?;
            let zero = vec![L2Entry::default(); 256];
            self.file.seek(SeekFrom::Start(off as u64))?;
            self.file.write_all(&header::l2_table_to_bytes(&zero.try_into().unwrap()))?;
            self.write_l1_entry(l1_idx, off)?;
            self.cdevhdr.used += size;
            l1_off = off;
        }

        let l2_idx = track & 0xFF;
        let l2 = self.read_l2_table(l1_off)?;
        let mut entry = l2[l2_idx as usize];

        if !entry.is_absent() && entry.size >= length {
            self.file.seek(SeekFrom::Start(entry.offset as u64))?;
            self.file.write_all(&payload)?;
            self.cdevhdr.free_imbed = self.cdevhdr.free_imbed.saturating_sub(entry.size - entry.length);
            entry.length = length;
            self.cdevhdr.free_imbed += entry.size - length;
        } else {
            if !entry.is_absent() {
                self.free_space(entry.offset, entry.size)?;
                self.cdevhdr.used = self.cdevhdr.used.saturating_sub(entry.size);
            }
            let (offset, size) = self.alloc_space(length)?;
            self.file.seek(SeekFrom::Start(offset as u64))?;
            self.file.write_all(&payload)?;
            entry = L2Entry { offset, length, size };
            self.cdevhdr.used += size;
        }

        self.write_l2_entry(l1_off, l2_idx, entry)?;
        debug!(track, length, "wrote track");
        Ok(())
    }

    fn read_free_block(&mut self, offset: u32) -> Result<FreeBlock> {
        self.file.seek(SeekFrom::Start(offset as u64))?;
        let mut b = [0u8; FREEBLK_SIZE as usize];
        self.file.read_exact(&mut b)?;
        Ok(FreeBlock::from_bytes(&b))
    }

    fn write_free_block(&mut self, offset: u32, fb: FreeBlock) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.write_all(&fb.to_bytes())?;
        Ok(())
    }

    fn set_next_pointer(&mut self, prev_is_header: bool, prev_offset: u32, new_next: u32) -> Result<()> {
        if prev_is_header {
            self.cdevhdr.free = new_next;
        } else {
            let mut fb = self.read_free_block(prev_offset)?;
            fb.next = new_next;
            self.write_free_block(prev_offset, fb)?;
        }
        Ok(())
    }

    /// First-fit allocation from the free chain, splitting the
    /// remainder only when it is at least one free-block header, else
    /// extending the file (spec §4.2 "Free-space chain").
    fn alloc_space(&mut self, needed: u32) -> Result<(u32, u32)> {
        let mut prev_is_header = true;
        let mut prev_offset = 0u32;
        let mut cur = self.cdevhdr.free;

        while cur != 0 {
            let fb = self.read_free_block(cur)?;
            if fb.length == needed {
                self.set_next_pointer(prev_is_header, prev_offset, fb.next)?;
                self.cdevhdr.free_number -= 1;
                self.cdevhdr.free_total -= fb.length;
                if self.cdevhdr.free_largest == fb.length {
                    self.cdevhdr.free_largest = 0;
                }
                return Ok((cur, needed));
            } else if fb.length >= needed + FREEBLK_SIZE {
                let remainder_off = cur + needed;
                let remainder = FreeBlock { next: fb.next, length: fb.length - needed };
                self.write_free_block(remainder_off, remainder)?;
                self.set_next_pointer(prev_is_header, prev_offset, remainder_off)?;
                self.cdevhdr.free_total -= needed;
                return Ok((cur, needed));
            } else if fb.length > needed {
                self.set_next_pointer(prev_is_header, prev_offset, fb.next)?;
                self.cdevhdr.free_number -= 1;
                self.cdevhdr.free_total -= fb.length;
                self.cdevhdr.free_imbed += fb.length - needed;
                return Ok((cur, fb.length));
            }
            prev_is_header = false;
            prev_offset = cur;
            cur = fb.next;
        }

        let offset = self.cdevhdr.size;
        self.cdevhdr.size += needed;
        Ok((offset, needed))
    }

    /// Return a freed region to the chain, coalescing with
    /// byte-adjacent neighbors (spec §4.2 "On free, coalesce with
    /// adjacent free blocks").
    fn free_space(&mut self, offset: u32, length: u32) -> Result<()> {
        let mut prev_is_header = true;
        let mut prev_offset = 0u32;
        let mut cur = self.cdevhdr.free;
        while cur != 0 && cur < offset {
            prev_is_header = false;
            prev_offset = cur;
            let fb = self.read_free_block(cur)?;
            cur = fb.next;
        }

        let mut merged_with_follow = false;
        let mut new_next = cur;
        let mut new_length = length;
        if cur != 0 {
            let follow = self.read_free_block(cur)?;
            if offset + length == cur {
                new_length += follow.length;
                new_next = follow.next;
                merged_with_follow = true;
            }
        }

        if !prev_is_header {
            let mut prev_fb = self.read_free_block(prev_offset)?;
            if prev_offset + prev_fb.length == offset {
                prev_fb.length += new_length;
                prev_fb.next = new_next;
                self.write_free_block(prev_offset, prev_fb)?;
                self.cdevhdr.free_total += length;
                if merged_with_follow {
                    self.cdevhdr.free_number -= 1;
                }
                if prev_fb.length > self.cdevhdr.free_largest {
                    self.cdevhdr.free_largest = prev_fb.length;
                }
                return Ok(());
            }
        }

        self.write_free_block(offset, FreeBlock { next: new_next, length: new_length })?;
        self.set_next_pointer(prev_is_header, prev_offset, offset)?;
        self.cdevhdr.free_total += length;
        if !merged_with_follow {
            self.cdevhdr.free_number += 1;
        }
        if new_length > self.cdevhdr.free_largest {
            self.cdevhdr.free_largest = new_length;
        }
        Ok(())
    }

    fn set_opened_bit(&mut self, opened: bool) -> Result<()> {
        self.cdevhdr.options.set(header::CdevOptions::OPENED, opened);
        self.file.seek(SeekFrom::Start(header::COMPRESSED_DEVICE_HEADER_POS))?;
        self.file.write_all(&self.cdevhdr.to_bytes())?;
        Ok(())
    }

    /// Clean close (spec §4.2 "Open bit": cleared on clean close).
    pub fn close(mut self) -> Result<()> {
        self.set_opened_bit(false)?;
        self.file.flush()?;
        Ok(())
    }
}

impl<F> CckdImage<F> {
    pub fn device_header(&self) -> &DeviceHeader {
        &self.devhdr
    }

    pub fn compressed_device_header(&self) -> &CompressedDeviceHeader {
        &self.cdevhdr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn fixture(cyls: u32) -> CckdImage<Cursor<Vec<u8>>> {
        let file = Cursor::new(Vec::new());
        CckdImage::create(file, 0x30, cyls, CompressionKind::Zlib).unwrap()
    }

    #[test]
    fn write_then_read_track_roundtrips() {
        let mut img = fixture(404);
        let data = track::build_track(
            0,
            1,
            &[track::CkdRecord { cyl: 0, head: 1, rec: 1, key: vec![], data: vec![0x42; 1024] }],
        );
        img.write_track(19, &data).unwrap();
        let back = img.read_track(19).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn unwritten_track_reads_as_empty() {
        let mut img = fixture(404);
        let back = img.read_track(100).unwrap();
        let (cyl, head) = img.cyl_head_of(100);
        assert_eq!(back, track::empty_track(cyl, head));
    }

    #[test]
    fn rewriting_a_track_with_a_smaller_payload_reuses_the_allocation() {
        let mut img = fixture(404);
        let big = track::build_track(0, 0, &[track::CkdRecord { cyl: 0, head: 0, rec: 1, key: vec![], data: vec![0; 8000] }]);
        img.write_track(0, &big).unwrap();
        let size_after_first = {
            let l1_off = img.l1[0];
            let l2 = img.read_l2_table(l1_off).unwrap();
            l2[0].size
        };

        let small = track::build_track(0, 0, &[track::CkdRecord { cyl: 0, head: 0, rec: 1, key: vec![], data: vec![0; 10] }]);
        img.write_track(0, &small).unwrap();
        let entry_after_second = {
            let l1_off = img.l1[0];
            let l2 = img.read_l2_table(l1_off).unwrap();
            l2[0]
        };
        assert_eq!(entry_after_second.size, size_after_first);
        assert_eq!(img.read_track(0).unwrap(), small);
    }

    #[test]
    fn out_of_range_track_is_rejected() {
        let mut img = fixture(404);
        let total = img.total_tracks();
        assert!(img.read_track(total).is_err());
    }

    #[test]
    fn opening_a_dirty_image_fails_until_repaired() {
        let file = Cursor::new(Vec::new());
        let mut img = CckdImage::create(file, 0x30, 404, CompressionKind::None).unwrap();
        img.set_opened_bit(true).unwrap();
        let mut backing = Vec::new();
        img.file.seek(SeekFrom::Start(0)).unwrap();
        img.file.read_to_end(&mut backing).unwrap();

        let reopened = CckdImage::open(Cursor::new(backing), CompressionKind::None);
        assert!(matches!(reopened, Err(CckdError::HeaderDirty)));
    }
}

//! Main storage: a byte-addressable array shared by all CPUs and device
//! threads, plus its parallel storage-key array (spec §3 "Main storage").
//!
//! Every read or write that the architecture says updates the reference
//! or change bit goes through the accessors here, never through a raw
//! slice that could outlive the call (spec §9, "Raw pointers to main
//! storage").

use bitflags::bitflags;

/// Bytes per storage-key page. The architecture permits 2 KiB or 4 KiB;
/// this build fixes 2 KiB, matching the IDAW page-boundary rule in §3.
pub const PAGE_SIZE: usize = 2048;
pub const PAGE_SHIFT: u32 = 11;

bitflags! {
    /// One storage-key byte: 4-bit access key, fetch-protect, reference,
    /// and change bits (spec §3).
    #[derive(Default)]
    pub struct StorageKey: u8 {
        const KEY4   = 0x10;
        const KEY3   = 0x20;
        const KEY2   = 0x40;
        const KEY1   = 0x80;
        const KEY    = Self::KEY1.bits | Self::KEY2.bits | Self::KEY3.bits | Self::KEY4.bits;
        const FETCH  = 0x08;
        const REF    = 0x04;
        const CHANGE = 0x02;
    }
}

impl StorageKey {
    pub fn access_key(self) -> u8 {
        (self & Self::KEY).bits()
    }

    pub fn with_access_key(key: u8) -> Self {
        Self::from_bits_truncate(key & Self::KEY.bits())
    }
}

/// Why an access is being made, for reference/change-bit and
/// fetch/store-protection bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessIntent {
    Fetch,
    Store,
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    #[error("addressing exception: {0:#x} outside main storage")]
    Addressing(u32),
    #[error("protection exception at {0:#x}")]
    Protection(u32),
}

/// Process-wide main storage: a flat byte array and its storage keys.
///
/// Shared among all CPUs and device threads without locking, per spec §5's
/// shared-resource policy: fullword control fields are read/written with a
/// single load/store, and storage-key reference/change updates are
/// allowed to race (losing a concurrent OR is tolerable).
pub struct MainStorage {
    data: Vec<u8>,
    keys: Vec<StorageKey>,
}

impl MainStorage {
    pub fn new(size: usize) -> Self {
        let pages = size.div_ceil(PAGE_SIZE).max(1);
        MainStorage {
            data: vec![0u8; size],
            keys: vec![StorageKey::default(); pages],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn page_of(&self, addr: u32) -> usize {
        (addr as usize) >> PAGE_SHIFT
    }

    pub fn key_at(&self, addr: u32) -> StorageKey {
        self.keys[self.page_of(addr)]
    }

    /// Raises the reference bit, and the change bit too when `intent` is a
    /// store, for every page spanned by `[addr, addr+len)`.
    fn touch(&mut self, addr: u32, len: usize, intent: AccessIntent) {
        if len == 0 {
            return;
        }
        let first = self.page_of(addr);
        let last = self.page_of(addr + (len as u32 - 1));
        for page in &mut self.keys[first..=last] {
            *page |= StorageKey::REF;
            if intent == AccessIntent::Store {
                *page |= StorageKey::CHANGE;
            }
        }
    }

    /// Fetch/store protection check against an access key. Key 0 is
    /// exempt (accesses everything). For fetches, only the fetch-protect
    /// bit matters; for stores, a key mismatch always protects.
    fn check_protection(
        &self,
        addr: u32,
        len: usize,
        access_key: u8,
        intent: AccessIntent,
    ) -> Result<(), StorageError> {
        if access_key == 0 || len == 0 {
            return Ok(());
        }
        let first = self.page_of(addr);
        let last = self.page_of(addr + (len as u32 - 1));
        for page in &self.keys[first..=last] {
            let mismatch = page.access_key() != access_key;
            let blocked = match intent {
                AccessIntent::Store => mismatch,
                AccessIntent::Fetch => mismatch && page.contains(StorageKey::FETCH),
            };
            if blocked {
                return Err(StorageError::Protection(addr));
            }
        }
        Ok(())
    }

    fn bounds_check(&self, addr: u32, len: usize) -> Result<(), StorageError> {
        if len == 0 {
            return Ok(());
        }
        let end = (addr as usize)
            .checked_add(len)
            .ok_or(StorageError::Addressing(addr))?;
        if end > self.data.len() {
            return Err(StorageError::Addressing(addr));
        }
        Ok(())
    }

    /// Copy `len` bytes beginning at `addr` out of storage, honoring
    /// protection, and set reference bits as a side effect.
    pub fn fetch(
        &mut self,
        addr: u32,
        len: usize,
        access_key: u8,
    ) -> Result<Vec<u8>, StorageError> {
        self.bounds_check(addr, len)?;
        self.check_protection(addr, len, access_key, AccessIntent::Fetch)?;
        let out = self.data[addr as usize..addr as usize + len].to_vec();
        self.touch(addr, len, AccessIntent::Fetch);
        Ok(out)
    }

    /// Copy `src` into storage at `addr`, honoring protection, and set
    /// reference/change bits as a side effect.
    pub fn store(&mut self, addr: u32, src: &[u8], access_key: u8) -> Result<(), StorageError> {
        self.bounds_check(addr, src.len())?;
        self.check_protection(addr, src.len(), access_key, AccessIntent::Store)?;
        self.data[addr as usize..addr as usize + src.len()].copy_from_slice(src);
        self.touch(addr, src.len(), AccessIntent::Store);
        Ok(())
    }

    pub fn fetch_byte(&mut self, addr: u32, access_key: u8) -> Result<u8, StorageError> {
        Ok(self.fetch(addr, 1, access_key)?[0])
    }

    pub fn fetch_halfword(&mut self, addr: u32, access_key: u8) -> Result<u16, StorageError> {
        let b = self.fetch(addr, 2, access_key)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn fetch_fullword(&mut self, addr: u32, access_key: u8) -> Result<u32, StorageError> {
        let b = self.fetch(addr, 4, access_key)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn store_fullword(
        &mut self,
        addr: u32,
        value: u32,
        access_key: u8,
    ) -> Result<(), StorageError> {
        self.store(addr, &value.to_be_bytes(), access_key)
    }

    /// Raw read with no protection check and no key argument, used only
    /// where the architecture itself says key-controlled protection is
    /// disabled (e.g. linkage-stack accesses, spec §4.4).
    pub fn fetch_unchecked(&mut self, addr: u32, len: usize) -> Result<Vec<u8>, StorageError> {
        self.bounds_check(addr, len)?;
        let out = self.data[addr as usize..addr as usize + len].to_vec();
        self.touch(addr, len, AccessIntent::Fetch);
        Ok(out)
    }

    pub fn store_unchecked(&mut self, addr: u32, src: &[u8]) -> Result<(), StorageError> {
        self.bounds_check(addr, src.len())?;
        self.data[addr as usize..addr as usize + src.len()].copy_from_slice(src);
        self.touch(addr, src.len(), AccessIntent::Store);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_store_roundtrip() {
        let mut m = MainStorage::new(4096);
        m.store(0x100, &[1, 2, 3, 4], 0).unwrap();
        assert_eq!(m.fetch(0x100, 4, 0).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn out_of_bounds_is_addressing_exception() {
        let mut m = MainStorage::new(4096);
        assert_eq!(
            m.fetch(4090, 16, 0),
            Err(StorageError::Addressing(4090))
        );
    }

    #[test]
    fn fetch_protection_blocks_mismatched_key() {
        let mut m = MainStorage::new(4096);
        let page = m.page_of(0);
        m.keys[page] = StorageKey::with_access_key(0xA0) | StorageKey::FETCH;
        assert_eq!(m.fetch(0, 4, 0x10), Err(StorageError::Protection(0)));
        assert!(m.fetch(0, 4, 0xA0).is_ok());
    }

    #[test]
    fn store_protection_blocks_any_key_mismatch_even_without_fetch_bit() {
        let mut m = MainStorage::new(4096);
        let page = m.page_of(0);
        m.keys[page] = StorageKey::with_access_key(0xA0);
        assert_eq!(m.store(0, &[1], 0x10), Err(StorageError::Protection(0)));
    }

    #[test]
    fn reference_and_change_bits_set_on_store() {
        let mut m = MainStorage::new(4096);
        m.store(0, &[1], 0).unwrap();
        let k = m.key_at(0);
        assert!(k.contains(StorageKey::REF));
        assert!(k.contains(StorageKey::CHANGE));
    }

    #[test]
    fn reference_bit_only_on_fetch() {
        let mut m = MainStorage::new(4096);
        m.fetch(0, 1, 0).unwrap();
        let k = m.key_at(0);
        assert!(k.contains(StorageKey::REF));
        assert!(!k.contains(StorageKey::CHANGE));
    }

    #[test]
    fn zero_length_access_never_faults() {
        let mut m = MainStorage::new(16);
        assert!(m.fetch(100, 0, 0).is_ok());
        assert!(m.store(100, &[], 0).is_ok());
    }
}

//! The offline CKD Repair Engine (CRE): validate a compressed-CKD
//! image's structural invariants, recover orphaned track images from
//! free gaps, and rewrite the L1/L2 tables, free chain, and header
//! statistics so the file is internally consistent (spec §4.3).
//!
//! Grounded on `cckd_chkdsk` in the original's `cckdcdsk.c`: the space
//! table it builds from device header / compressed header / L1 table /
//! free chain / track images (`SPCTAB`), its overlap-and-gap sweep, and
//! its trial-length track recovery scan. The original's labeled-goto
//! error unwinding is replaced by a structured ladder of early returns
//! (spec REDESIGN FLAGS).

use std::collections::BTreeSet;
use std::io::{Read, Seek, SeekFrom, Write};

use tracing::{info, warn};

use crate::compress::CompressionKind;
use crate::devtypes::{self, CkdGeometry};
use crate::error::{CckdError, Result};
use crate::header::{
    self, CompressedDeviceHeader, DeviceHeader, FreeBlock, L2Entry, L2Table, FREEBLK_SIZE, L1_ENTRY_SIZE,
    L2_TABLE_SIZE,
};
use crate::track::{self, TrackImage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CheckLevel {
    Fast = 0,
    Default = 1,
    Exhaustive = 3,
}

impl CheckLevel {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(CheckLevel::Fast),
            1 => Ok(CheckLevel::Default),
            3 => Ok(CheckLevel::Exhaustive),
            other => Err(CckdError::Unrepairable(format!("check level must be 0, 1, or 3, got {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpaceKind {
    DeviceHeader,
    CompressedDeviceHeader,
    L1Table,
    L2Table { l1_idx: u32 },
    Track { track: u32 },
    Free,
    EndOfFile,
}

#[derive(Debug, Clone, Copy)]
struct SpaceEntry {
    pos: u32,
    /// Bytes actually occupied by valid content (≤ `size`).
    len: u32,
    /// Bytes reserved for this entry, including any imbedded free space.
    size: u32,
    kind: SpaceKind,
}

#[derive(Debug, Clone, Copy)]
struct RecoveryTrack {
    track: u32,
    /// Best-known prior length, 0 if unknown.
    approx_len: u32,
    l1_idx: u32,
    /// Whether this track's L2 table is otherwise intact (update the
    /// entry on disk) or itself under reconstruction (buffer it).
    group_intact: bool,
}

fn read_at<F: Read + Seek>(file: &mut F, pos: u32, buf: &mut [u8]) -> Result<()> {
    file.seek(SeekFrom::Start(pos as u64))?;
    file.read_exact(buf)?;
    Ok(())
}

fn write_at<F: Write + Seek>(file: &mut F, pos: u32, buf: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(pos as u64))?;
    file.write_all(buf)?;
    Ok(())
}

/// Run the repair engine against `file` at the given check level. Spec
/// §4.3 exit-code semantics: `Ok(0)` is clean, `Ok(n)` for `n > 0` means
/// `n` structural changes were made, `Err` means the run was aborted
/// (unrepairable header, or a host I/O failure) — the `cckdcdsk` binary
/// maps that to a negative process exit code.
pub fn chkdsk<F: Read + Write + Seek>(mut file: F, level: CheckLevel) -> Result<u32> {
    // --- Step 1: fatal header checks ---
    let mut dbuf = [0u8; header::DEVICE_HEADER_SIZE];
    read_at(&mut file, header::DEVICE_HEADER_POS as u32, &mut dbuf)?;
    let devhdr = DeviceHeader::from_bytes(&dbuf)?;

    let geometry: &'static CkdGeometry = devtypes::geometry_for(devhdr.devtype)?;
    if devhdr.heads != geometry.heads {
        return Err(CckdError::Unrepairable(format!(
            "heads-per-cylinder {} does not match device type {:#04x}",
            devhdr.heads, devhdr.devtype
        )));
    }
    if devhdr.trklen != geometry.max_data_len {
        return Err(CckdError::Unrepairable("track size does not match device type".into()));
    }

    let mut cbuf = [0u8; header::COMPRESSED_DEVICE_HEADER_SIZE];
    read_at(&mut file, header::COMPRESSED_DEVICE_HEADER_POS as u32, &mut cbuf)?;
    let mut cdevhdr = CompressedDeviceHeader::from_bytes(&cbuf)?;

    geometry.validate_cyls(cdevhdr.cyls)?;
    let total_tracks = geometry.total_tracks(cdevhdr.cyls);
    let expected_l1 = total_tracks.div_ceil(256);
    if cdevhdr.numl1tab != expected_l1 {
        return Err(CckdError::BadL1Count { found: cdevhdr.numl1tab, expected: expected_l1 });
    }

    let file_len = file.seek(SeekFrom::End(0))? as u32;
    let lopos = header::L1_TABLE_POS as u32;
    let hipos = file_len;
    if hipos < lopos {
        return Err(CckdError::Unrepairable("file is shorter than its own headers".into()));
    }

    let mut level = level;
    let mut l1 = Vec::with_capacity(cdevhdr.numl1tab as usize);
    for i in 0..cdevhdr.numl1tab {
        let mut b = [0u8; 4];
        read_at(&mut file, lopos + i * L1_ENTRY_SIZE, &mut b)?;
        l1.push(u32::from_le_bytes(b));
    }

    // --- Step 2: build the space table ---
    let mut space: Vec<SpaceEntry> = vec![
        SpaceEntry {
            pos: header::DEVICE_HEADER_POS as u32,
            len: header::DEVICE_HEADER_SIZE as u32,
            size: header::DEVICE_HEADER_SIZE as u32,
            kind: SpaceKind::DeviceHeader,
        },
        SpaceEntry {
            pos: header::COMPRESSED_DEVICE_HEADER_POS as u32,
            len: header::COMPRESSED_DEVICE_HEADER_SIZE as u32,
            size: header::COMPRESSED_DEVICE_HEADER_SIZE as u32,
            kind: SpaceKind::CompressedDeviceHeader,
        },
        SpaceEntry {
            pos: lopos,
            len: cdevhdr.numl1tab * L1_ENTRY_SIZE,
            size: cdevhdr.numl1tab * L1_ENTRY_SIZE,
            kind: SpaceKind::L1Table,
        },
    ];

    let mut cur = cdevhdr.free;
    let mut chain_broken = false;
    let mut guard = 0u32;
    while cur != 0 {
        guard += 1;
        if guard > total_tracks.max(4096) || cur < lopos || cur.saturating_add(FREEBLK_SIZE) > hipos {
            chain_broken = true;
            break;
        }
        let mut b = [0u8; FREEBLK_SIZE as usize];
        read_at(&mut file, cur, &mut b)?;
        let fb = FreeBlock::from_bytes(&b);
        space.push(SpaceEntry { pos: cur, len: fb.length, size: fb.length, kind: SpaceKind::Free });
        cur = fb.next;
    }
    if chain_broken {
        warn!("free chain is corrupt, discarding it and rebuilding from scratch");
        level = level.max(CheckLevel::Default);
    }

    let mut recovery: Vec<RecoveryTrack> = Vec::new();
    let mut recovery_l1_groups: BTreeSet<u32> = BTreeSet::new();
    let mut reconstructed: std::collections::BTreeMap<u32, L2Table> = std::collections::BTreeMap::new();

    for l1_idx in 0..cdevhdr.numl1tab {
        let off = l1[l1_idx as usize];
        if off == 0 {
            continue;
        }
        if off < lopos || off > hipos.saturating_sub(L2_TABLE_SIZE) {
            recovery_l1_groups.insert(l1_idx);
            reconstructed.insert(l1_idx, [L2Entry::default(); 256]);
            for t in 0..256u32 {
                let track = l1_idx * 256 + t;
                if track < total_tracks {
                    recovery.push(RecoveryTrack { track, approx_len: 0, l1_idx, group_intact: false });
                }
            }
            level = level.max(CheckLevel::Default);
            continue;
        }

        let mut l2b = vec![0u8; L2_TABLE_SIZE as usize];
        if read_at(&mut file, off, &mut l2b).is_err() {
            recovery_l1_groups.insert(l1_idx);
            reconstructed.insert(l1_idx, [L2Entry::default(); 256]);
            for t in 0..256u32 {
                let track = l1_idx * 256 + t;
                if track < total_tracks {
                    recovery.push(RecoveryTrack { track, approx_len: 0, l1_idx, group_intact: false });
                }
            }
            level = level.max(CheckLevel::Default);
            continue;
        }
        let l2 = header::l2_table_from_bytes(&l2b);
        space.push(SpaceEntry { pos: off, len: L2_TABLE_SIZE, size: L2_TABLE_SIZE, kind: SpaceKind::L2Table { l1_idx } });

        for (l2_idx, entry) in l2.iter().enumerate() {
            if entry.is_absent() {
                continue;
            }
            let track = l1_idx * 256 + l2_idx as u32;
            let mut ok = track < total_tracks
                && entry.offset >= lopos
                && entry.offset.saturating_add(entry.size) <= hipos
                && entry.length <= entry.size
                && entry.length >= 5;

            if ok && level >= CheckLevel::Default {
                let mut hb = [0u8; 5];
                ok = read_at(&mut file, entry.offset, &mut hb).is_ok()
                    && match TrackImage::peek_header(&hb) {
                        Ok((kind, cyl, head)) => {
                            kind.to_u8() <= CompressionKind::MAX
                                && cyl as u32 == track / geometry.heads
                                && head as u32 == track % geometry.heads
                        }
                        Err(_) => false,
                    };
            }
            if ok && level >= CheckLevel::Exhaustive {
                let mut tb = vec![0u8; entry.length as usize];
                ok = read_at(&mut file, entry.offset, &mut tb).is_ok()
                    && TrackImage::decode(&tb)
                        .map(|img| {
                            let cyl = (track / geometry.heads) as u16;
                            let head = (track % geometry.heads) as u16;
                            track::validate_track(&img.data, cyl, head, track).is_ok()
                        })
                        .unwrap_or(false);
            }

            if ok {
                space.push(SpaceEntry { pos: entry.offset, len: entry.length, size: entry.size, kind: SpaceKind::Track { track } });
            } else {
                recovery.push(RecoveryTrack { track, approx_len: entry.length, l1_idx, group_intact: true });
            }
        }
    }
    space.push(SpaceEntry { pos: hipos, len: 0, size: 0, kind: SpaceKind::EndOfFile });

    let mut changes = recovery.len() as u32 + recovery_l1_groups.len() as u32;

    // --- Step 5: overlap and gap detection ---
    space.sort_by_key(|e| e.pos);
    let mut cleaned: Vec<SpaceEntry> = Vec::with_capacity(space.len());
    let mut l2_cascade: BTreeSet<u32> = BTreeSet::new();
    let mut i = 0;
    while i < space.len() {
        let entry = space[i];
        if let Some(next) = space.get(i + 1) {
            if entry.pos + entry.len > next.pos && !matches!(next.kind, SpaceKind::EndOfFile) {
                // Overlap: demote the overlapping entry instead of the one that started first.
                match entry.kind {
                    SpaceKind::Track { track } => {
                        recovery.push(RecoveryTrack { track, approx_len: entry.len, l1_idx: track >> 8, group_intact: true });
                        changes += 1;
                        i += 1;
                        continue;
                    }
                    SpaceKind::Free => {
                        changes += 1;
                        i += 1;
                        continue;
                    }
                    SpaceKind::L2Table { l1_idx } => {
                        // A corrupt/overlapping L2 table can't be trusted for
                        // any of its 256 tracks: rebuild the whole group
                        // (original's SPCTAB_L2TAB cascade).
                        recovery_l1_groups.insert(l1_idx);
                        reconstructed.entry(l1_idx).or_insert([L2Entry::default(); 256]);
                        l2_cascade.insert(l1_idx);
                        changes += 1;
                        i += 1;
                        continue;
                    }
                    _ => {}
                }
            }
        }
        cleaned.push(entry);
        i += 1;
    }
    if !l2_cascade.is_empty() {
        let mut demoted: Vec<SpaceEntry> = Vec::with_capacity(cleaned.len());
        for entry in cleaned {
            if let SpaceKind::Track { track } = entry.kind {
                if l2_cascade.contains(&(track >> 8)) {
                    recovery.push(RecoveryTrack { track, approx_len: entry.len, l1_idx: track >> 8, group_intact: false });
                    changes += 1;
                    continue;
                }
            }
            demoted.push(entry);
        }
        cleaned = demoted;
    }
    space = cleaned;

    let mut gaps: Vec<(u32, u32)> = Vec::new();
    for w in space.windows(2) {
        let (a, b) = (w[0], w[1]);
        if a.pos + a.size < b.pos {
            gaps.push((a.pos + a.size, b.pos - (a.pos + a.size)));
        }
    }

    // --- Step 6: track recovery sweep ---
    let recovery_tracks: BTreeSet<u32> = recovery.iter().map(|r| r.track).collect();
    let mut recovered_space: Vec<SpaceEntry> = Vec::new();
    let mut still_missing: Vec<RecoveryTrack> = Vec::new();

    for r in recovery {
        let mut found = None;
        'gaps: for &(gap_pos, gap_len) in &gaps {
            let mut scan = gap_pos;
            while scan + 5 <= gap_pos + gap_len {
                let mut hb = [0u8; 5];
                if read_at(&mut file, scan, &mut hb).is_err() {
                    break 'gaps;
                }
                if let Ok((kind, cyl, head)) = TrackImage::peek_header(&hb) {
                    let candidate = cyl as u32 * geometry.heads + head as u32;
                    if kind.to_u8() <= CompressionKind::MAX
                        && (cyl as u32) < cdevhdr.cyls
                        && (head as u32) < geometry.heads
                        && candidate == r.track
                        && recovery_tracks.contains(&candidate)
                    {
                        let max_len = (gap_pos + gap_len).saturating_sub(scan);
                        let exp_cyl = (r.track / geometry.heads) as u16;
                        let exp_head = (r.track % geometry.heads) as u16;

                        if kind == CompressionKind::None {
                            // Uncompressed CKD content is self-describing:
                            // scan past the home address and records up to
                            // the terminator to learn the real length
                            // directly, with no guessing needed.
                            let body_max = max_len.saturating_sub(5);
                            let mut body = vec![0u8; body_max as usize];
                            if read_at(&mut file, scan + 5, &mut body).is_ok() {
                                if let Ok(consumed) = track::validate_track(&body, exp_cyl, exp_head, r.track) {
                                    found = Some((scan, 5 + consumed as u32));
                                    break 'gaps;
                                }
                            }
                        } else {
                            // Compressed content hides its own end; bracket
                            // around the recovery table's recorded length
                            // when known, else sweep every plausible length
                            // (spec §4.3 step 6).
                            let trials: Vec<u32> = if r.approx_len > 0 {
                                [0i64, 1, -1, 2, -2]
                                    .iter()
                                    .filter_map(|d| {
                                        let t = r.approx_len as i64 + d;
                                        (t > 0 && t as u32 <= max_len).then_some(t as u32)
                                    })
                                    .collect()
                            } else {
                                (1..=max_len).collect()
                            };
                            for trial in trials {
                                let mut tb = vec![0u8; trial as usize];
                                if read_at(&mut file, scan, &mut tb).is_err() {
                                    continue;
                                }
                                if let Ok(img) = TrackImage::decode(&tb) {
                                    if track::validate_track(&img.data, exp_cyl, exp_head, r.track).is_ok() {
                                        found = Some((scan, trial));
                                        break 'gaps;
                                    }
                                }
                            }
                        }
                    }
                }
                scan += 1;
            }
        }

        if let Some((pos, len)) = found {
            recovered_space.push(SpaceEntry { pos, len, size: len, kind: SpaceKind::Track { track: r.track } });
            let new_entry = L2Entry { offset: pos, length: len, size: len };
            if r.group_intact {
                let l1_off = l1[r.l1_idx as usize];
                write_at(&mut file, l1_off + (r.track & 0xFF) * header::L2_ENTRY_SIZE, &new_entry.to_bytes())?;
            } else if let Some(tab) = reconstructed.get_mut(&r.l1_idx) {
                tab[(r.track & 0xFF) as usize] = new_entry;
            }
            info!(track = r.track, pos, len, "recovered orphaned track image");
        } else {
            warn!(track = r.track, "track was not recovered, leaving it absent");
            if r.group_intact {
                let l1_off = l1[r.l1_idx as usize];
                write_at(&mut file, l1_off + (r.track & 0xFF) * header::L2_ENTRY_SIZE, &L2Entry::default().to_bytes())?;
            }
            still_missing.push(r);
        }
    }

    // --- Step 7: L2 table reconstruction ---
    // Recompute gaps against the post-sweep layout: bytes the track
    // recovery sweep just claimed are no longer free.
    let mut interim: Vec<SpaceEntry> = space.iter().copied().chain(recovered_space.iter().copied()).collect();
    interim.sort_by_key(|e| e.pos);
    let mut remaining_gaps: Vec<(u32, u32)> = Vec::new();
    for w in interim.windows(2) {
        let (a, b) = (w[0], w[1]);
        if a.pos + a.size < b.pos {
            remaining_gaps.push((a.pos + a.size, b.pos - (a.pos + a.size)));
        }
    }

    for &l1_idx in &recovery_l1_groups {
        let tab = reconstructed.get(&l1_idx).copied().unwrap_or([L2Entry::default(); 256]);
        let slot = remaining_gaps
            .iter()
            .position(|&(_, len)| len == L2_TABLE_SIZE || len >= L2_TABLE_SIZE + FREEBLK_SIZE);
        let new_off = if let Some(idx) = slot {
            let (gpos, glen) = remaining_gaps[idx];
            if glen > L2_TABLE_SIZE {
                remaining_gaps[idx] = (gpos + L2_TABLE_SIZE, glen - L2_TABLE_SIZE);
            } else {
                remaining_gaps.remove(idx);
            }
            gpos
        } else {
            let end = file.seek(SeekFrom::End(0))? as u32;
            end
        };
        write_at(&mut file, new_off, &header::l2_table_to_bytes(&tab))?;
        write_at(&mut file, lopos + l1_idx * L1_ENTRY_SIZE, &new_off.to_le_bytes())?;
        l1[l1_idx as usize] = new_off;
        recovered_space.push(SpaceEntry {
            pos: new_off,
            len: L2_TABLE_SIZE,
            size: L2_TABLE_SIZE,
            kind: SpaceKind::L2Table { l1_idx },
        });
        info!(l1_idx, new_off, "rebuilt level-2 table");
    }

    // --- Step 8/9: short-gap healing and free-chain rebuild ---
    let mut final_space: Vec<SpaceEntry> = space.into_iter().chain(recovered_space).collect();
    final_space.sort_by_key(|e| e.pos);

    let mut free_blocks: Vec<(u32, u32)> = Vec::new();
    let mut idx = 0;
    while idx < final_space.len() {
        let entry = final_space[idx];
        let gap_start = entry.pos + entry.size;
        let gap_end = final_space.get(idx + 1).map(|n| n.pos).unwrap_or(gap_start);
        if gap_end > gap_start {
            let gap_len = gap_end - gap_start;
            if gap_len < FREEBLK_SIZE {
                // Too small to be its own free block: absorb into this
                // entry's imbedded free space (spec §4.3 step 8).
                if matches!(entry.kind, SpaceKind::Track { .. }) {
                    final_space[idx].size += gap_len;
                }
                // Entries other than a track absorb the remainder
                // silently too; true defragmentation of a following
                // L2 table/track is left to a future repair pass.
            } else {
                free_blocks.push((gap_start, gap_len));
            }
        }
        idx += 1;
    }

    let mut new_cdevhdr = cdevhdr;
    new_cdevhdr.free = 0;
    new_cdevhdr.free_number = free_blocks.len() as u32;
    new_cdevhdr.free_total = free_blocks.iter().map(|(_, l)| *l).sum();
    new_cdevhdr.free_largest = free_blocks.iter().map(|(_, l)| *l).max().unwrap_or(0);
    new_cdevhdr.free_imbed = final_space
        .iter()
        .filter(|e| matches!(e.kind, SpaceKind::Track { .. }))
        .map(|e| e.size - e.len)
        .sum();
    new_cdevhdr.used = final_space.iter().filter(|e| !matches!(e.kind, SpaceKind::Free)).map(|e| e.size).sum();
    new_cdevhdr.size = final_space.iter().map(|e| e.pos + e.size).max().unwrap_or(hipos).max(hipos);

    for (n, &(pos, len)) in free_blocks.iter().enumerate() {
        let next = free_blocks.get(n + 1).map(|(p, _)| *p).unwrap_or(0);
        write_at(&mut file, pos, &FreeBlock { next, length: len }.to_bytes())?;
    }
    if let Some(&(first, _)) = free_blocks.first() {
        new_cdevhdr.free = first;
    }

    // --- Step 10: clear the opened bit and persist the header ---
    new_cdevhdr.options.remove(header::CdevOptions::OPENED);
    write_at(&mut file, header::COMPRESSED_DEVICE_HEADER_POS as u32, &new_cdevhdr.to_bytes())?;
    file.flush()?;

    if !still_missing.is_empty() {
        warn!(
            unrecovered = still_missing.len(),
            "some tracks had no recoverable image and were left absent"
        );
    }

    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CckdImage;
    use crate::track::CkdRecord;
    use std::io::Cursor;

    const HEADS: u32 = 19; // device type 0x30

    fn built_bytes(cyls: u32, tracks: &[u32]) -> Vec<u8> {
        let mut file = Cursor::new(Vec::new());
        {
            let mut img = CckdImage::create(&mut file, 0x30, cyls, CompressionKind::None).unwrap();
            for &t in tracks {
                let cyl = (t / HEADS) as u16;
                let head = (t % HEADS) as u16;
                let data = track::build_track(
                    cyl,
                    head,
                    &[CkdRecord { cyl, head, rec: 1, key: vec![], data: vec![0xAB; 64] }],
                );
                img.write_track(t, &data).unwrap();
            }
        }
        file.into_inner()
    }

    #[test]
    fn clean_image_reports_no_changes() {
        let bytes = built_bytes(404, &[0, 1, 2]);
        let changes = chkdsk(Cursor::new(bytes), CheckLevel::Exhaustive).unwrap();
        assert_eq!(changes, 0);
    }

    #[test]
    fn corrupted_l1_entry_recovers_its_track_group() {
        let mut bytes = built_bytes(404, &[0, 1, 2]);
        // Corrupt L1[0] (spec §8 scenario "Repair missing L2").
        let l1_pos = header::L1_TABLE_POS as usize;
        bytes[l1_pos..l1_pos + 4].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());

        let changes = chkdsk(Cursor::new(bytes), CheckLevel::Default).unwrap();
        assert!(changes > 0);
    }

    #[test]
    fn running_chkdsk_twice_is_idempotent() {
        let bytes = built_bytes(404, &[0, 5, 19]);
        let mut first = Cursor::new(bytes);
        let changes1 = chkdsk(&mut first, CheckLevel::Default).unwrap();
        assert_eq!(changes1, 0);
        let bytes_after = first.into_inner();
        let changes2 = chkdsk(Cursor::new(bytes_after), CheckLevel::Default).unwrap();
        assert_eq!(changes2, 0);
    }
}

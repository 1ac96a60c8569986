//! Binds a compressed-CKD image ([`cckd::CckdImage`]) to the channel
//! subsystem's [`s370_core::device::DeviceHandler`] contract, for the
//! CKD-backed end-to-end scenarios in `tests/`.
//!
//! A real 3390 control unit understands Search ID Equal, Locate Record,
//! and the rest of the CKD command set; none of that is this crate's
//! concern (spec §6 "Device-handler contract" leaves CCW opcode meaning
//! entirely to the handler). This handler only serves what the IPL and
//! repair scenarios need: opcode 0x02/0x06 read the track's first user
//! record, sequentially, from whatever position the previous read left
//! off.

use std::io::Cursor;
use std::sync::Mutex;

use cckd::CckdImage;
use s370_core::device::{CcwExecCtx, CcwResult, DeviceBlock, DeviceHandler};
use s370_core::scsw::UnitStatus;

/// Walk a decoded track's CKD records (home address, record 0, records
/// 1..n, spec §3 "Track Image") and return the data field of `target`.
/// Mirrors the structural scan in `cckd::track::validate_track`, reading
/// instead of validating.
fn locate_record(track_data: &[u8], target: u8) -> Option<&[u8]> {
    let mut pos = 5; // past the home address
    loop {
        if pos + 8 > track_data.len() || track_data[pos..pos + 8] == [0xFF; 8] {
            return None;
        }
        let rec = track_data[pos + 4];
        let keylen = track_data[pos + 5] as usize;
        let datalen = u16::from_be_bytes([track_data[pos + 6], track_data[pos + 7]]) as usize;
        pos += 8;
        let data_start = pos + keylen;
        let data_end = data_start + datalen;
        if data_end > track_data.len() {
            return None;
        }
        if rec == target {
            return Some(&track_data[data_start..data_end]);
        }
        pos = data_end;
    }
}

/// Device handler reading sequentially from one CKD track of a
/// compressed-CKD image, held open for the life of the device (spec §6;
/// the image itself is spec §3's "Compressed-CKD file format").
pub struct CkdDeviceHandler {
    image: Mutex<CckdImage<Cursor<Vec<u8>>>>,
    track: u32,
    record: u8,
    /// Byte offset into the record's data reached by the previous read,
    /// so a chain of reads without an intervening search/locate CCW
    /// continues where the last one left off.
    pos: Mutex<usize>,
}

impl CkdDeviceHandler {
    pub fn new(image: CckdImage<Cursor<Vec<u8>>>, track: u32, record: u8) -> Self {
        CkdDeviceHandler {
            image: Mutex::new(image),
            track,
            record,
            pos: Mutex::new(0),
        }
    }
}

impl DeviceHandler for CkdDeviceHandler {
    fn execute_ccw(&self, _dev: &DeviceBlock, ctx: CcwExecCtx<'_>) -> CcwResult {
        match ctx.opcode {
            0x02 | 0x06 => {
                let mut img = self.image.lock().expect("ckd image lock poisoned");
                let track_data = match img.read_track(self.track) {
                    Ok(t) => t,
                    Err(_) => {
                        return CcwResult {
                            more: false,
                            unit_status: UnitStatus::CE | UnitStatus::DE | UnitStatus::UC,
                            residual: ctx.count,
                        }
                    }
                };
                drop(img);

                let Some(data) = locate_record(&track_data, self.record) else {
                    return CcwResult {
                        more: false,
                        unit_status: UnitStatus::CE | UnitStatus::DE | UnitStatus::UC,
                        residual: ctx.count,
                    };
                };

                let mut start = self.pos.lock().expect("read-position lock poisoned");
                let want = ctx.buffer.len();
                let avail = data.len().saturating_sub(*start);
                let take = want.min(avail);
                ctx.buffer[..take].copy_from_slice(&data[*start..*start + take]);
                *start += take;

                CcwResult {
                    more: false,
                    unit_status: UnitStatus::CE | UnitStatus::DE,
                    residual: (want - take) as u16,
                }
            }
            _ => CcwResult {
                more: false,
                unit_status: UnitStatus::CE | UnitStatus::DE,
                residual: 0,
            },
        }
    }
}

/// Immediately completes every CCW with channel-end/device-end, for
/// scenarios that exercise subchannel state machinery rather than device
/// data transfer (mirrors `s370_core::channel`'s own `NopHandler` test
/// fixture).
pub struct NopHandler;

impl DeviceHandler for NopHandler {
    fn execute_ccw(&self, _dev: &DeviceBlock, _ctx: CcwExecCtx<'_>) -> CcwResult {
        CcwResult {
            more: false,
            unit_status: UnitStatus::CE | UnitStatus::DE,
            residual: 0,
        }
    }
}

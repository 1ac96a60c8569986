//! Channel Subsystem: START/TEST/HALT/CLEAR/RESUME SUBCHANNEL, the CCW
//! chain executor, and I/O interrupt presentation (spec §4.1).
//!
//! The execution task holds no lock while executing CCWs; it reacquires
//! the device lock only to mutate SCSW fields visible to CPUs, post
//! interrupts, or examine HALT/CLEAR/RESUME requests (spec §4.1
//! "Execution task").

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::ccw::{
    is_ccw_control, is_ccw_read, is_ccw_rdback, is_ccw_sense, is_ccw_tic, is_ccw_write, Ccw,
    CcwFlags, CcwFormat, Idaw,
};
use crate::device::{
    CcwExecCtx, ChannelMode, CpuInterruptState, DeviceBlock, SysBlock,
};
use crate::scsw::{
    ActivityControl, ChanStat, Csw, FuncControl, Irb, Orb, Scsw, Scsw0, Scsw1, StatusControl,
    UnitStatus,
};
use crate::storage::{MainStorage, StorageError};

/// Maximum channel I/O buffer size (spec §4.1 step 6).
const MAX_IOBUF: usize = 65_536;

fn to_chanstat(e: StorageError) -> ChanStat {
    match e {
        StorageError::Addressing(_) => ChanStat::PROGC,
        StorageError::Protection(_) => ChanStat::PROTC,
    }
}

/// START SUBCHANNEL (spec §4.1 "Start operation"). Returns the condition
/// code for SSCH: 0, 1, or 2.
pub fn start_io(sys: &Arc<SysBlock>, dev: &Arc<DeviceBlock>, io_parm: u32, orb: Orb) -> i32 {
    {
        let mut st = dev.lock();
        if st.scsw.status_pending() || st.pci_scsw.status_pending() {
            return 1;
        }
        if st.busy || st.pending {
            return 2;
        }

        st.busy = true;
        st.scsw = Scsw::default();
        st.pci_scsw = Scsw::default();
        st.scsw.flag0 = crate::scsw::Scsw0::from_bits_truncate(orb.key & Scsw0::KEY.bits());
        if orb.suspend_control {
            st.scsw.flag0 |= Scsw0::S;
        }
        if orb.format1 {
            st.scsw.flag1 |= Scsw1::F;
        }
        if orb.prefetch {
            st.scsw.flag1 |= Scsw1::P;
        }
        if orb.initial_status_interrupt {
            st.scsw.flag1 |= Scsw1::I;
        }
        if orb.address_limit_checking {
            st.scsw.flag1 |= Scsw1::A;
        }
        if orb.suppress_suspend_interrupt {
            st.scsw.flag1 |= Scsw1::U;
        }
        st.scsw.func_control = FuncControl::START;
        st.scsw.activity_control = ActivityControl::START;
        st.pmcw.int_parm = io_parm;
    }

    let sys = Arc::clone(sys);
    let dev = Arc::clone(dev);
    std::thread::spawn(move || execute_ccw_chain(sys, dev, orb));

    0
}

/// The per-operation execution task spawned by `start_io` (spec §4.1
/// "Execution task").
fn execute_ccw_chain(sys: Arc<SysBlock>, dev: Arc<DeviceBlock>, orb: Orb) {
    let ccw_fmt = if orb.format1 {
        CcwFormat::Format1
    } else {
        CcwFormat::Format0
    };
    let ccw_key = orb.key & 0xF0;

    {
        let mut st = dev.lock();
        st.scsw.activity_control.remove(ActivityControl::START);
        st.scsw.activity_control |= ActivityControl::SCHAC | ActivityControl::DEVAC;

        if st.scsw.flag1.contains(Scsw1::I) {
            st.scsw.ccw_addr = orb.ccw_addr;
            st.scsw.flag1 |= Scsw1::Z;
            st.scsw.set_pending(StatusControl::INTER);
            st.pending = true;
            drop(st);
            sys.signal_interrupt();
        }
    }

    let mut ccw_addr = orb.ccw_addr;
    let mut tic = true;
    let mut chain = true;
    let mut chained = CcwFlags::empty();
    let mut prev_chained = CcwFlags::empty();
    let mut code: u8 = 0;
    let mut prevcode: u8 = 0;
    let mut ccwseq: u32 = 0;
    let mut bufpos: usize = 0;
    let mut iobuf = vec![0u8; MAX_IOBUF];
    let mut unit_status = UnitStatus::empty();
    let mut chan_status;
    let mut residual: u16 = 0;

    'chain: while chain {
        chan_status = ChanStat::empty();
        unit_status = UnitStatus::empty();

        let fetch_result = {
            let mut storage = sys.mainstor.lock().expect("mainstor lock poisoned");
            fetch_ccw(&mut storage, ccw_key, ccw_fmt, ccw_addr)
        };

        ccw_addr = ccw_addr.wrapping_add(8);
        {
            let mut st = dev.lock();
            st.scsw.ccw_addr = ccw_addr;
        }

        let ccw = match fetch_result {
            Ok(ccw) => ccw,
            Err(cs) => {
                chan_status = cs;
                break 'chain;
            }
        };

        if dev.lock().scsw.func_control.contains(FuncControl::HALT) {
            dev.lock().scsw.func_control.remove(FuncControl::HALT);
            break 'chain;
        }

        trace!(dev = dev.dev_num, opcode = ccw.opcode, addr = ccw.addr, "fetched CCW");

        if is_ccw_tic(ccw.opcode) {
            if tic {
                chan_status = ChanStat::PROGC;
                break 'chain;
            }
            if ccw_fmt == CcwFormat::Format1
                && (ccw.opcode != 0x08 || !ccw.flags.is_empty() || ccw.count != 0)
            {
                chan_status = ChanStat::PROGC;
                break 'chain;
            }
            tic = true;
            ccw_addr = ccw.addr;
            chain = true;
            continue 'chain;
        }
        tic = false;

        if (chained & CcwFlags::CD).is_empty() {
            prevcode = code;
            code = ccw.opcode;
        }

        if ccw.flags.contains(CcwFlags::RESV) {
            chan_status = ChanStat::PROGC;
            break 'chain;
        }

        if ccw.flags.contains(CcwFlags::SUSP) {
            if (dev.lock().scsw.flag0 & Scsw0::S).is_empty() || chained.contains(CcwFlags::CD) {
                chan_status = ChanStat::PROGC;
                break 'chain;
            }

            let mut st = dev.lock();
            if !st.scsw.activity_control.contains(ActivityControl::RESUME) {
                st.scsw.activity_control = ActivityControl::SUSP;
                st.scsw.set_pending(StatusControl::INTER);
                st.scsw.unit_status = UnitStatus::empty();
                st.scsw.chan_status = ChanStat::empty();
                st.scsw.count = ccw.count;

                if (st.scsw.flag1 & Scsw1::U).is_empty() {
                    st.pending = true;
                    drop(st);
                    sys.signal_interrupt();
                    st = dev.lock();
                }

                debug!(dev = dev.dev_num, "device suspended");
                while !st.scsw.activity_control.contains(ActivityControl::RESUME) {
                    st = dev
                        .resume_cond
                        .wait_timeout(st, Duration::from_secs(3600))
                        .expect("resume condvar poisoned")
                        .0;
                }
                debug!(dev = dev.dev_num, "device resumed");

                st.scsw.activity_control.remove(ActivityControl::SUSP);
                st.scsw.activity_control |= ActivityControl::SCHAC | ActivityControl::DEVAC;
            }
            st.scsw.activity_control.remove(ActivityControl::RESUME);
            drop(st);

            // Go back and refetch the suspended CCW: ccw_addr was already
            // advanced past it before this branch was taken.
            ccw_addr = ccw_addr.wrapping_sub(8);

            tic = false;
            chain = true;
            chained = CcwFlags::empty();
            prev_chained = CcwFlags::empty();
            bufpos = 0;
            continue 'chain;
        }

        if ccw.flags.contains(CcwFlags::PCI) {
            let mut st = dev.lock();
            st.pci_pending = true;
            st.pci_scsw.flag0 = crate::scsw::Scsw0::from_bits_truncate(ccw_key & Scsw0::KEY.bits());
            st.pci_scsw.flag1 = if ccw_fmt == CcwFormat::Format1 {
                Scsw1::F
            } else {
                Scsw1::empty()
            };
            st.pci_scsw.func_control = FuncControl::START;
            st.pci_scsw.activity_control =
                ActivityControl::SCHAC | ActivityControl::DEVAC;
            st.pci_scsw.set_pending(StatusControl::INTER | StatusControl::PRI);
            st.pci_scsw.ccw_addr = ccw_addr;
            st.pci_scsw.unit_status = UnitStatus::empty();
            st.pci_scsw.chan_status = ChanStat::PCI;
            st.pci_scsw.count = 0;
            drop(st);
            sys.signal_interrupt();
        }

        if ccw.count == 0
            && (ccw_fmt == CcwFormat::Format0
                || ccw.flags.contains(CcwFlags::CD)
                || chained.contains(CcwFlags::CD))
        {
            chan_status = ChanStat::PROGC;
            break 'chain;
        }

        if is_ccw_write(code) || is_ccw_control(code) {
            if bufpos + ccw.count as usize > iobuf.len() {
                chan_status = ChanStat::PROGC;
                break 'chain;
            }
            let mut storage = sys.mainstor.lock().expect("mainstor lock poisoned");
            let slice = &mut iobuf[bufpos..bufpos + ccw.count as usize];
            if let Err(cs) = copy_iobuf(&mut storage, code, ccw.flags, ccw.addr, ccw.count, ccw_key, slice) {
                chan_status = cs;
                break 'chain;
            }
            drop(storage);
            bufpos += ccw.count as usize;

            if dev.handler.wants_cdw_merge() {
                if ccw.flags.contains(CcwFlags::CD) {
                    if (chained & CcwFlags::CD).is_empty() {
                        prev_chained = chained;
                    }
                    chained = CcwFlags::CD;
                    chain = true;
                    continue 'chain;
                }
                if chained.contains(CcwFlags::CD) {
                    chained = prev_chained;
                }
            }
        }

        chain = ccw.flags.intersects(CcwFlags::CD | CcwFlags::CC);
        residual = if is_ccw_write(code) || is_ccw_control(code) {
            bufpos as u16
        } else {
            ccw.count
        };
        let total_count = residual;
        bufpos = 0;
        let mut more = false;

        if !(is_ccw_write(code)
            || is_ccw_read(code)
            || is_ccw_control(code)
            || is_ccw_sense(code)
            || is_ccw_rdback(code))
        {
            chan_status = ChanStat::PROGC;
            break 'chain;
        }

        {
            let ctx = CcwExecCtx {
                opcode: code,
                flags: ccw.flags,
                chained,
                count: total_count,
                prev_opcode: prevcode,
                seq: ccwseq,
                buffer: &mut iobuf[..total_count as usize],
            };
            let result = dev.handler.execute_ccw(&dev, ctx);
            more = result.more;
            unit_status = result.unit_status;
            residual = result.residual;
        }

        if !ccw.flags.contains(CcwFlags::SKIP)
            && (is_ccw_read(code) || is_ccw_sense(code) || is_ccw_rdback(code))
        {
            let mut storage = sys.mainstor.lock().expect("mainstor lock poisoned");
            let copy_len = total_count.saturating_sub(residual);
            if let Err(cs) = copy_iobuf(
                &mut storage,
                code,
                ccw.flags,
                ccw.addr,
                copy_len,
                ccw_key,
                &mut iobuf[..copy_len as usize],
            ) {
                chan_status |= cs;
            }
        }

        // See SPEC_FULL.md §9 item 1: the source's `more && (CCW_FLAGS_CD
        // == 0)` reads as a typo for a chaining-flag test; this is the
        // corrected intent (ILI when more data remains and no data
        // chaining is in effect).
        if residual != 0 || (more && (ccw.flags & CcwFlags::CD).is_empty()) {
            if ccw.flags.contains(CcwFlags::CD) || !ccw.flags.contains(CcwFlags::SLI) {
                chan_status |= ChanStat::IL;
            }
        }

        if unit_status.contains(UnitStatus::SM) {
            ccw_addr = ccw_addr.wrapping_add(8);
        }

        if !chan_status.is_empty() || (unit_status & !UnitStatus::SM) != (UnitStatus::CE | UnitStatus::DE) {
            chain = false;
        }

        if chan_status.intersects(
            ChanStat::PROGC | ChanStat::PROTC | ChanStat::CDC | ChanStat::CCC | ChanStat::ICC | ChanStat::CHC,
        ) || (unit_status.contains(UnitStatus::UC) && dev.lock().sense[0] != 0)
        {
            warn!(dev = dev.dev_num, ?chan_status, ?unit_status, "CCW completed with unusual status");
        }

        chained = ccw.flags & (CcwFlags::CD | CcwFlags::CC);
        if !ccw.flags.contains(CcwFlags::CD) {
            ccwseq += 1;
        }
    }

    complete_chain(&sys, &dev, ccw_addr, unit_status, chan_status, residual);
}

fn complete_chain(
    sys: &Arc<SysBlock>,
    dev: &Arc<DeviceBlock>,
    ccw_addr: u32,
    unit_status: UnitStatus,
    chan_status: ChanStat,
    residual: u16,
) {
    let mut st = dev.lock();

    st.csw = Csw {
        key: 0,
        ccw_addr,
        unit_status,
        chan_status,
        count: residual,
    };

    st.scsw.activity_control.remove(ActivityControl::SCHAC | ActivityControl::DEVAC);
    st.scsw.set_pending(StatusControl::PRI | StatusControl::SEC);
    st.scsw.ccw_addr = ccw_addr & 0x7FFF_FFFF;
    st.scsw.unit_status = unit_status;
    st.scsw.chan_status = chan_status;
    st.scsw.count = residual;

    if !chan_status.is_empty() || unit_status != (UnitStatus::CE | UnitStatus::DE) {
        st.scsw.status_control |= StatusControl::ALERT;
    }

    st.esw = crate::scsw::Esw {
        lpum: 0x80,
        ..Default::default()
    };
    st.ecw = [0u8; 32];

    if unit_status.contains(UnitStatus::UC) && st.pmcw.concurrent_sense {
        st.scsw.flag1 |= Scsw1::E;
        st.esw.sense_stored = true;
        let n = st.sense.len().min(st.ecw.len());
        st.esw.sense_count = n as u8;
        st.ecw[..n].copy_from_slice(&st.sense[..n]);
        st.sense = [0u8; 24];
    }

    st.busy = false;
    st.pending = true;
    drop(st);

    sys.signal_interrupt();
}

fn fetch_ccw(
    storage: &mut MainStorage,
    key: u8,
    fmt: CcwFormat,
    addr: u32,
) -> Result<Ccw, ChanStat> {
    if addr & 0x7 != 0 {
        return Err(ChanStat::PROGC);
    }
    let bytes = storage.fetch(addr, 8, key).map_err(to_chanstat)?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&bytes);
    Ok(Ccw::decode(&arr, fmt))
}

/// Copy `count` bytes between main storage at `addr` and `iobuf`,
/// honoring IDAW indirection and storage-key protection (spec §4.1 step
/// 6, §3 "IDAW"). Direction follows `code`'s read/write classification.
fn copy_iobuf(
    storage: &mut MainStorage,
    code: u8,
    flags: CcwFlags,
    addr: u32,
    count: u16,
    key: u8,
    iobuf: &mut [u8],
) -> Result<(), ChanStat> {
    if count == 0 {
        return Ok(());
    }
    let readcmd = is_ccw_read(code) || is_ccw_sense(code) || is_ccw_rdback(code);

    if flags.contains(CcwFlags::IDA) {
        let mut idaw_addr = addr;
        let mut remaining = count as usize;
        let mut pos = 0usize;
        let mut seq = 0usize;
        while remaining > 0 {
            let word = storage.fetch_fullword(idaw_addr, key).map_err(to_chanstat)?;
            let idaw = Idaw::decode(word, seq).map_err(|_| ChanStat::PROGC)?;
            if idaw.addr as usize > storage.len() {
                return Err(ChanStat::PROGC);
            }
            let take = (idaw.len_to_boundary as usize).min(remaining);
            if readcmd {
                storage
                    .store(idaw.addr, &iobuf[pos..pos + take], key)
                    .map_err(to_chanstat)?;
            } else {
                let data = storage.fetch(idaw.addr, take, key).map_err(to_chanstat)?;
                iobuf[pos..pos + take].copy_from_slice(&data);
            }
            pos += take;
            remaining -= take;
            idaw_addr = idaw_addr.wrapping_add(4);
            seq += 1;
        }
        Ok(())
    } else if readcmd {
        storage
            .store(addr, &iobuf[..count as usize], key)
            .map_err(to_chanstat)
    } else {
        let data = storage.fetch(addr, count as usize, key).map_err(to_chanstat)?;
        iobuf[..count as usize].copy_from_slice(&data);
        Ok(())
    }
}

/// TEST SUBCHANNEL (spec §4.1 "Test subchannel"). Returns the TSCH
/// condition code and fills `irb`.
pub fn test_subchan(dev: &DeviceBlock, irb: &mut Irb) -> i32 {
    let mut st = dev.lock();

    if st.pci_scsw.status_pending() {
        irb.scsw = st.pci_scsw;
        irb.esw = crate::scsw::Esw {
            lpum: 0x80,
            ..Default::default()
        };
        irb.ecw = [0u8; 32];
        st.pci_scsw.func_control = FuncControl::empty();
        st.pci_scsw.activity_control = ActivityControl::empty();
        st.pci_scsw.status_control = StatusControl::empty();
        return 0;
    }

    irb.scsw = st.scsw;
    irb.esw = st.esw;
    irb.ecw = st.ecw;
    st.pending = false;

    if st.scsw.status_pending() {
        if st.scsw.status_control != (StatusControl::INTER | StatusControl::PEND) {
            st.scsw.func_control = FuncControl::empty();
            st.scsw.activity_control = ActivityControl::empty();
            st.scsw.activity_control.remove(ActivityControl::SUSP);
            st.scsw.flag1.remove(Scsw1::N);
        } else {
            if st.scsw.func_control.contains(FuncControl::HALT)
                && st.scsw.activity_control.contains(ActivityControl::SUSP)
            {
                st.scsw.func_control = FuncControl::empty();
            }
            if st.scsw.func_control.contains(FuncControl::START | FuncControl::HALT)
                && st.scsw.activity_control.contains(ActivityControl::SUSP)
            {
                st.scsw.activity_control = ActivityControl::empty();
                st.scsw.flag1.remove(Scsw1::N);
            }
            if st.scsw.func_control == FuncControl::START
                && st.scsw.activity_control.contains(ActivityControl::SUSP)
            {
                st.scsw.activity_control.remove(ActivityControl::RESUME);
                st.scsw.flag1.remove(Scsw1::N);
            }
        }
        st.scsw.status_control = StatusControl::empty();
        0
    } else {
        1
    }
}

/// HALT SUBCHANNEL (spec §4.1 "Halt subchannel").
pub fn halt_subchan(dev: &DeviceBlock) -> i32 {
    let mut st = dev.lock();

    let sc = st.scsw.status_control;
    if sc == StatusControl::PEND
        || (sc.contains(StatusControl::PEND)
            && sc.intersects(StatusControl::ALERT | StatusControl::PRI | StatusControl::SEC))
    {
        return 1;
    }
    if st.scsw.func_control.intersects(FuncControl::HALT | FuncControl::CLEAR) {
        return 2;
    }

    st.scsw.func_control |= FuncControl::HALT;
    st.scsw.status_control.remove(StatusControl::PEND);

    if st.busy {
        st.scsw.activity_control |= ActivityControl::HALT;
        st.pci_pending = false;
        st.pending = false;
        if st.scsw.activity_control.contains(ActivityControl::SUSP) {
            st.scsw.activity_control |= ActivityControl::RESUME;
            dev.resume_cond.notify_all();
        }
    } else {
        st.scsw.status_control |= StatusControl::PEND;
        st.scsw.unit_status = UnitStatus::empty();
        st.scsw.chan_status = ChanStat::empty();
        st.pending = true;
    }
    0
}

/// CLEAR SUBCHANNEL (spec §4.1 "Clear subchannel").
pub fn clear_subchan(sys: &SysBlock, dev: &DeviceBlock) {
    {
        let mut st = dev.lock();
        st.pmcw.pom = 0xFF;
        st.pmcw.lpum = 0x00;
        st.pmcw.pnom = 0x00;

        st.scsw = Scsw::default();
        st.scsw.func_control = FuncControl::CLEAR;
        st.scsw.status_control = StatusControl::PRI | StatusControl::PEND;

        st.busy = false;
        st.pci_pending = false;
        st.pending = true;
        dev.resume_cond.notify_all();
    }
    sys.signal_interrupt();
}

/// RESUME SUBCHANNEL (spec §4.1 "Resume subchannel").
pub fn resume_subchan(dev: &DeviceBlock) -> i32 {
    let mut st = dev.lock();

    if st.scsw.status_pending() {
        return 1;
    }
    if st.scsw.func_control != FuncControl::START
        || st.scsw.activity_control.contains(ActivityControl::RESUME)
        || (st.scsw.flag0 & Scsw0::S).is_empty()
    {
        return 2;
    }

    // See SPEC_FULL.md §9 item 2: the path-not-operational mask is
    // cleared only when the subchannel is actually suspended, matching
    // the source's literal (and architecture-ambiguous) behavior.
    if st.scsw.activity_control.contains(ActivityControl::SUSP) {
        st.pmcw.pnom = 0x00;
    }

    st.scsw.activity_control |= ActivityControl::RESUME;
    dev.resume_cond.notify_all();
    0
}

fn interrupt_enabled(dev: &DeviceBlock, cpu: &CpuInterruptState, mode: ChannelMode) -> bool {
    if mode == ChannelMode::S370 {
        let chan = (dev.dev_num >> 8) as u32;
        if !cpu.ec_mode && chan < 6 {
            if cpu.sysmask & (0x80 >> chan) == 0 {
                return false;
            }
        } else {
            const PSW_IOMASK: u8 = 0x02;
            if cpu.sysmask & PSW_IOMASK == 0 {
                return false;
            }
            let isc = chan.min(31);
            if cpu.cr2 & (0x8000_0000 >> isc) == 0 {
                return false;
            }
        }
        return true;
    }

    let st = dev.lock();
    if !st.pmcw.flag5.contains(crate::scsw::Pmcw5::E | crate::scsw::Pmcw5::V) {
        return false;
    }
    let isc = st.pmcw.isc as u32 & 0x7;
    cpu.cr6 & (0x8000_0000 >> isc) != 0
}

/// Find a device with a pending or PCI-pending status whose interrupt is
/// enabled for `cpu`, and clear its pending flag (spec §4.1 "Interrupt
/// presentation"). Returns `(io_id, io_parm_or_csw)` on success.
pub fn present_io_interrupt(
    sys: &SysBlock,
    cpu: &CpuInterruptState,
) -> Option<(u32, PendingStatus)> {
    let mut pending_flag = sys.io_pending.lock().expect("interrupt lock poisoned");
    *pending_flag = false;

    for dev in &sys.devices {
        let has_any = {
            let st = dev.lock();
            st.pending || st.pci_pending
        };
        if !has_any {
            continue;
        }
        *pending_flag = true;
        if !interrupt_enabled(dev, cpu, sys.channel_mode) {
            continue;
        }

        let mut st = dev.lock();
        let is_pci = st.pci_pending;
        let result = if sys.channel_mode == ChannelMode::S370 {
            PendingStatus::Csw(if is_pci { st.pci_csw } else { st.csw })
        } else {
            PendingStatus::IoParm(st.pmcw.int_parm)
        };
        if is_pci {
            st.pci_pending = false;
        } else {
            st.pending = false;
        }
        let io_id = if sys.channel_mode == ChannelMode::S370 {
            dev.dev_num as u32
        } else {
            0x0001_0000 | dev.subchan as u32
        };
        return Some((io_id, result));
    }
    None
}

#[derive(Debug, Clone, Copy)]
pub enum PendingStatus {
    Csw(Csw),
    IoParm(u32),
}

/// I/O RESET (spec §4.1 "I/O reset").
pub fn io_reset(sys: &SysBlock) {
    for dev in &sys.devices {
        let mut st = dev.lock();
        st.pending = false;
        st.busy = false;
        st.pci_pending = false;
        st.pmcw.int_parm = 0;
        st.pmcw.isc = 0;
        st.pmcw.flag5 = crate::scsw::Pmcw5::empty();
        st.pmcw.pnom = 0;
        st.pmcw.lpum = 0;
        st.pmcw.concurrent_sense = false;
        st.scsw = Scsw::default();
        st.pci_scsw = Scsw::default();
        st.sense = [0u8; 24];
    }
}

/// Raise an unsolicited interrupt for `dev` (spec §4.1 "Device attention").
/// Returns `Err(())` if the device is busy or already has status pending.
pub fn device_attention(sys: &SysBlock, dev: &DeviceBlock, unit_status: UnitStatus) -> Result<(), ()> {
    {
        let mut st = dev.lock();
        if st.busy || st.pending || st.scsw.status_pending() {
            return Err(());
        }
        st.csw = Csw {
            unit_status,
            ..Default::default()
        };
        st.scsw = Scsw::default();
        st.scsw.set_pending(StatusControl::ALERT);
        st.scsw.unit_status = unit_status;
        st.pending = true;
    }
    sys.signal_interrupt();
    Ok(())
}

/// STORE CHANNEL ID (S/370 mode only, spec §6).
pub fn store_channel_id(sys: &SysBlock, chan: u16) -> (i32, u32) {
    let count = sys.devices.iter().filter(|d| (d.dev_num & 0xFF00) == chan).count();
    if count == 0 {
        return (3, 0);
    }
    const CHANNEL_BMX: u32 = 0x1000_0000;
    (0, CHANNEL_BMX)
}

/// TEST CHANNEL (S/370 mode only, spec §6).
pub fn test_channel(sys: &SysBlock, chan: u16) -> i32 {
    let mut devcount = 0;
    for dev in &sys.devices {
        if (dev.dev_num & 0xFF00) != chan {
            continue;
        }
        devcount += 1;
        let st = dev.lock();
        if st.pending || st.pci_pending {
            return 1;
        }
    }
    if devcount == 0 {
        3
    } else {
        0
    }
}

/// TEST I/O (S/370 mode only, spec §6). Fills the CSW behind `csw_out` on
/// a pending interrupt.
pub fn test_io(dev: &DeviceBlock, csw_out: &mut Csw) -> i32 {
    let mut st = dev.lock();
    if st.busy {
        2
    } else if st.pci_pending {
        *csw_out = st.pci_csw;
        st.pci_pending = false;
        1
    } else if st.pending {
        *csw_out = st.csw;
        st.pending = false;
        0
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CcwExecCtx, CcwResult, DeviceHandler};
    use crate::scsw::Orb;
    use std::sync::Arc;

    struct NopHandler;
    impl DeviceHandler for NopHandler {
        fn execute_ccw(&self, _dev: &DeviceBlock, _ctx: CcwExecCtx<'_>) -> CcwResult {
            CcwResult {
                more: false,
                unit_status: UnitStatus::CE | UnitStatus::DE,
                residual: 0,
            }
        }
    }

    fn fixture() -> (Arc<SysBlock>, Arc<DeviceBlock>) {
        let mut sys = SysBlock::new(65536, ChannelMode::ChannelSubsystem);
        let dev = DeviceBlock::new(0x009, 0, 0x3390, Arc::new(NopHandler));
        sys.add_device(Arc::clone(&dev));
        (Arc::new(sys), dev)
    }

    #[test]
    fn nop_chain_completes_with_ce_de_and_zero_residual() {
        let (sys, dev) = fixture();
        {
            let mut st = sys.mainstor.lock().unwrap();
            // A single NOP-like control CCW (opcode 0x03) with count 1, no chaining.
            st.store(0, &[0x03, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00], 0)
                .unwrap();
        }
        let orb = Orb {
            ccw_addr: 0,
            format1: true,
            ..Default::default()
        };
        let cc = start_io(&sys, &dev, 0x1234, orb);
        assert_eq!(cc, 0);

        // Wait for the spawned thread to post completion.
        for _ in 0..200 {
            if dev.lock().scsw.status_pending() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let st = dev.lock();
        assert!(st.scsw.status_pending());
        assert_eq!(st.scsw.unit_status, UnitStatus::CE | UnitStatus::DE);
    }

    #[test]
    fn start_io_returns_2_when_busy() {
        let (sys, dev) = fixture();
        dev.lock().busy = true;
        let orb = Orb::default();
        assert_eq!(start_io(&sys, &dev, 0, orb), 2);
    }

    #[test]
    fn start_io_returns_1_when_status_pending() {
        let (sys, dev) = fixture();
        dev.lock().scsw.set_pending(StatusControl::ALERT);
        let orb = Orb::default();
        assert_eq!(start_io(&sys, &dev, 0, orb), 1);
    }

    #[test]
    fn two_consecutive_tics_are_a_program_check() {
        let (sys, dev) = fixture();
        {
            let mut st = sys.mainstor.lock().unwrap();
            st.store(0, &[0x08, 0, 0, 0, 0, 0, 0, 8], 0).unwrap(); // TIC -> 8
            st.store(8, &[0x08, 0, 0, 0, 0, 0, 0, 16], 0).unwrap(); // TIC -> 16
        }
        let orb = Orb {
            ccw_addr: 0,
            format1: true,
            ..Default::default()
        };
        start_io(&sys, &dev, 0, orb);
        for _ in 0..200 {
            if dev.lock().scsw.status_pending() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let st = dev.lock();
        assert!(st.scsw.chan_status.contains(ChanStat::PROGC));
    }

    #[test]
    fn idaw_after_first_must_be_2k_aligned() {
        assert!(Idaw::decode(0x800, 1).is_ok());
        assert!(Idaw::decode(0x801, 1).is_err());
        assert!(Idaw::decode(0x801, 0).is_ok());
    }
}

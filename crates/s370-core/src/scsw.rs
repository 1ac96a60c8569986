//! Subchannel Status Word and its companions: CSW (S/370), PMCW, ORB, IRB,
//! ESW (spec §3 "Subchannel-Status Word").

use bitflags::bitflags;

bitflags! {
    #[derive(Default)]
    pub struct Scsw0: u8 {
        const KEY = 0xF0;
        const S   = 0x08; // suspend control (from ORB)
    }
}

bitflags! {
    #[derive(Default)]
    pub struct Scsw1: u8 {
        const F = 0x80; // CCW-format 1
        const P = 0x40; // prefetch
        const I = 0x20; // initial-status interruption control
        const A = 0x10; // address-limit checking
        const U = 0x08; // suppress-suspend-interruption
        const Z = 0x04; // zero condition code
        const E = 0x02; // extended-control word valid
        const N = 0x01; // path not-operational (informational, cleared variously)
    }
}

bitflags! {
    #[derive(Default)]
    pub struct FuncControl: u8 {
        const START = 0x04;
        const HALT  = 0x02;
        const CLEAR = 0x01;
    }
}

bitflags! {
    #[derive(Default)]
    pub struct ActivityControl: u8 {
        const RESUME = 0x40;
        const START  = 0x20;
        const HALT   = 0x10;
        const CLEAR  = 0x08;
        const SCHAC  = 0x04; // subchannel active
        const DEVAC  = 0x02; // device active
        const SUSP   = 0x01; // suspended
    }
}

bitflags! {
    #[derive(Default)]
    pub struct StatusControl: u8 {
        const ALERT  = 0x20;
        const INTER  = 0x10;
        const PRI    = 0x08;
        const SEC    = 0x04;
        const PEND   = 0x02;
        const DEFER  = 0x01;
    }
}

bitflags! {
    /// Channel-status byte (CSW/SCSW byte 5 for format 0, spec §7 family 1).
    #[derive(Default)]
    pub struct ChanStat: u8 {
        const PROGC = 0x80; // program check
        const PROTC = 0x40; // protection check
        const CDC   = 0x20; // channel-data check
        const CCC   = 0x10; // channel-control check
        const ICC   = 0x08; // interface-control check
        const CHC   = 0x04; // chaining check
        const IL    = 0x02; // incorrect length
        const PCI   = 0x01; // program-controlled interruption
    }
}

bitflags! {
    /// Unit-status byte (spec §3, §7 family 2).
    #[derive(Default)]
    pub struct UnitStatus: u8 {
        const ATTN = 0x80;
        const SM   = 0x40; // status modifier
        const CUE  = 0x20; // control-unit end
        const BUSY = 0x10;
        const CE   = 0x08; // channel end
        const DE   = 0x04; // device end
        const UC   = 0x02; // unit check
        const UX   = 0x01; // unit exception
    }
}

/// Subchannel Status Word, ESA/390 channel-subsystem mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scsw {
    pub flag0: Scsw0,
    pub flag1: Scsw1,
    pub func_control: FuncControl,
    pub activity_control: ActivityControl,
    pub status_control: StatusControl,
    pub ccw_addr: u32,
    pub unit_status: UnitStatus,
    pub chan_status: ChanStat,
    pub count: u16,
}

impl Scsw {
    pub fn status_pending(&self) -> bool {
        self.status_control.contains(StatusControl::PEND)
    }

    /// Marks status-pending with the given status-control bits set,
    /// consistent with spec §3's invariant: status-pending implies
    /// exactly one of alert/intermediate/primary/secondary.
    pub fn set_pending(&mut self, which: StatusControl) {
        self.status_control = which | StatusControl::PEND;
    }
}

/// S/370-mode Channel Status Word, 8 bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Csw {
    pub key: u8,
    pub ccw_addr: u32,
    pub unit_status: UnitStatus,
    pub chan_status: ChanStat,
    pub count: u16,
}

impl Csw {
    pub fn to_bytes(self) -> [u8; 8] {
        [
            self.key & 0xF0,
            ((self.ccw_addr >> 16) & 0xFF) as u8,
            ((self.ccw_addr >> 8) & 0xFF) as u8,
            (self.ccw_addr & 0xFF) as u8,
            self.unit_status.bits(),
            self.chan_status.bits(),
            ((self.count >> 8) & 0xFF) as u8,
            (self.count & 0xFF) as u8,
        ]
    }
}

bitflags! {
    #[derive(Default)]
    pub struct Pmcw5: u8 {
        const Q = 0x80;
        const E = 0x02; // enabled
        const V = 0x01; // valid
    }
}

/// Path Management Control Word: the persistent configuration of a
/// subchannel (spec §3 "DEVBLK": "a path-management control word").
#[derive(Debug, Clone, Copy, Default)]
pub struct Pmcw {
    pub int_parm: u32,
    pub isc: u8, // interruption subclass (0-7)
    pub flag5: Pmcw5,
    pub pom: u8, // path operational mask
    pub pnom: u8, // path not-operational mask
    pub lpum: u8, // last path used mask
    pub concurrent_sense: bool,
}

/// Operation Request Block fields (spec §3/§4.1 "Start operation").
#[derive(Debug, Clone, Copy, Default)]
pub struct Orb {
    pub key: u8,
    pub format1: bool,
    pub prefetch: bool,
    pub initial_status_interrupt: bool,
    pub address_limit_checking: bool,
    pub suppress_suspend_interrupt: bool,
    pub suspend_control: bool,
    pub ccw_addr: u32,
}

/// Extended Status Word (format-1 extended status, spec §4.1 "Chain
/// completion").
#[derive(Debug, Clone, Copy, Default)]
pub struct Esw {
    pub lpum: u8,
    pub sense_stored: bool,
    pub sense_count: u8,
}

/// Interruption Response Block, filled in by TEST SUBCHANNEL.
#[derive(Debug, Clone, Copy, Default)]
pub struct Irb {
    pub scsw: Scsw,
    pub esw: Esw,
    pub ecw: [u8; 32],
}

//! Linkage-Stack & Cross-Memory (LSX): the privileged control-transfer
//! instructions that stack CPU state (BAKR/PC/PR/EREG/ESTA/MSTA) and move
//! between address spaces (PC/PT/SSAR/LASP/BSA/BSG) (spec §4.4).
//!
//! LSX is invoked synchronously from the CPU interpreter on instruction
//! dispatch. It reads and writes main storage directly; it does not touch
//! the channel subsystem. A full CPU/PSW/DAT model is out of scope (spec
//! §1), so [`CpuState`] exposes only the registers these instructions
//! read or write, and stack/ASN-table addresses are treated as already
//! translated to real storage (see [`stack::abs_stack_addr`]).

pub mod stack;
pub mod xmem;

/// The CPU-register surface LSX instructions operate on. A full PSW,
/// DAT, and access-register-translation model is out of scope (spec
/// §1); this holds exactly the fields BAKR/PC/PR/EREG/ESTA/MSTA/PT/SSAR/
/// LASP/SAC/IAC/BSA/BSG read or write.
#[derive(Debug, Clone)]
pub struct CpuState {
    pub gpr: [u32; 16],
    pub ar: [u32; 16],
    pub psw: Psw,

    /// PSW-key mask.
    pub pkm: u16,
    pub sasn: u16,
    pub pasn: u16,
    /// Extended authorization index.
    pub eax: u16,

    /// CR1: primary segment/region-table designation.
    pub cr1_primary_std: u32,
    /// Space-switch-event bit of the ASTE last used to set `cr1_primary_std`.
    pub cr1_primary_sse: bool,
    /// Whether that ASTE is the base ASTE for this dispatchable unit
    /// (spec §4.4 "Subspace replacement").
    pub cr1_primary_is_base: bool,
    /// CR7: secondary segment/region-table designation.
    pub cr7_secondary_std: u32,
    /// CR5: linkage-table designation (basic mode) or ignored when ASF is on.
    pub cr5_linkage: u32,
    /// CR14: translation-exception address, loaded on stack-access faults.
    pub cr14_trans_exc_addr: u32,
    /// CR15: current linkage-stack entry descriptor address.
    pub cr15_stack_entry: u32,

    /// Address-space-function control (CR0 bit enabling ASTE-sourced
    /// linkage tables).
    pub asf_on: bool,
    /// CR0 bit 15: subspace-replacement enablement.
    pub ssgroup_enabled: bool,
    /// Dispatchable-unit control table origin, consulted for subspace
    /// replacement.
    pub duct_addr: u32,
    /// ASN-first-table origin used by ASN translation.
    pub afto: u32,

    pub address_space_control: AddressSpaceControl,
}

impl Default for CpuState {
    fn default() -> Self {
        CpuState {
            gpr: [0; 16],
            ar: [0; 16],
            psw: Psw::default(),
            pkm: 0,
            sasn: 0,
            pasn: 0,
            eax: 0,
            cr1_primary_std: 0,
            cr1_primary_sse: false,
            cr1_primary_is_base: true,
            cr7_secondary_std: 0,
            cr5_linkage: 0,
            cr14_trans_exc_addr: 0,
            cr15_stack_entry: 0,
            asf_on: false,
            ssgroup_enabled: false,
            duct_addr: 0,
            afto: 0,
            address_space_control: AddressSpaceControl::Primary,
        }
    }
}

/// The PSW fields LSX instructions read or write.
#[derive(Debug, Clone, Copy, Default)]
pub struct Psw {
    pub instruction_address: u32,
    pub problem_state: bool,
    /// Preserved across PROGRAM RETURN regardless of the restored entry
    /// (spec §4.4 "Program Return": "restore PSW (preserving current
    /// PER-mode bit)").
    pub per_mode: bool,
    pub key: u8,
}

/// Addressing mode set by SET ADDRESS SPACE CONTROL / read by INSERT
/// ADDRESS SPACE CONTROL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpaceControl {
    Primary,
    Secondary,
    Ar,
    Home,
}

impl AddressSpaceControl {
    pub fn from_mode_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(AddressSpaceControl::Primary),
            1 => Some(AddressSpaceControl::Ar),
            2 => Some(AddressSpaceControl::Secondary),
            3 => Some(AddressSpaceControl::Home),
            _ => None,
        }
    }

    pub fn mode_code(self) -> u8 {
        match self {
            AddressSpaceControl::Primary => 0,
            AddressSpaceControl::Ar => 1,
            AddressSpaceControl::Secondary => 2,
            AddressSpaceControl::Home => 3,
        }
    }
}

//! Linkage-stack formation and unstacking: BAKR, PROGRAM CALL's stacking
//! half, PROGRAM RETURN, and the register/state extraction instructions
//! EREG/ESTA/MSTA (spec §4.4 "Stack entry formation", "Stack entry
//! location", "Unstack registers", "Program Return").
//!
//! Entries are a fixed 168 bytes (spec §3 "Linkage-Stack Entry") and live
//! in 4 KiB sections chained through header/trailer entries at each
//! section's boundaries. Only the two state-entry types this core's
//! instruction set produces (BAKR, PC) are modeled; a header or trailer
//! entry reuses the same 168-byte slot, storing its section-link address
//! in the first four bytes and a matching descriptor in the last eight
//! (see [`EntryType`]).

use crate::error::ProgramCheck;
use crate::lsx::CpuState;
use crate::storage::MainStorage;

pub const ENTRY_SIZE: u32 = 168;
pub const SECTION_SIZE: u32 = 4096;
const DESCRIPTOR_OFFSET: u32 = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Header,
    Trailer,
    Bakr,
    Pc,
}

impl EntryType {
    fn to_u8(self) -> u8 {
        match self {
            EntryType::Header => 0,
            EntryType::Trailer => 1,
            EntryType::Bakr => 2,
            EntryType::Pc => 3,
        }
    }

    fn from_u8(b: u8) -> Result<Self, ProgramCheck> {
        match b {
            0 => Ok(EntryType::Header),
            1 => Ok(EntryType::Trailer),
            2 => Ok(EntryType::Bakr),
            3 => Ok(EntryType::Pc),
            _ => Err(ProgramCheck::StackSpecification),
        }
    }
}

/// The 8-byte entry descriptor living at the end of every 168-byte
/// entry (spec §3: "type, section index, remaining-free-space,
/// next-entry-size").
#[derive(Debug, Clone, Copy)]
pub struct EntryDescriptor {
    pub entry_type: EntryType,
    pub section_index: u16,
    pub remaining_free_space: u16,
    pub next_entry_size: u16,
}

impl EntryDescriptor {
    fn encode(&self) -> [u8; 8] {
        let mut b = [0u8; 8];
        b[0] = self.entry_type.to_u8();
        b[1..3].copy_from_slice(&self.section_index.to_be_bytes());
        b[3..5].copy_from_slice(&self.remaining_free_space.to_be_bytes());
        b[5..7].copy_from_slice(&self.next_entry_size.to_be_bytes());
        b
    }

    fn decode(b: &[u8]) -> Result<Self, ProgramCheck> {
        Ok(EntryDescriptor {
            entry_type: EntryType::from_u8(b[0])?,
            section_index: u16::from_be_bytes([b[1], b[2]]),
            remaining_free_space: u16::from_be_bytes([b[3], b[4]]),
            next_entry_size: u16::from_be_bytes([b[5], b[6]]),
        })
    }
}

/// A decoded 168-byte state entry (BAKR or PC type).
#[derive(Debug, Clone)]
pub struct StackEntry {
    pub gpr: [u32; 16],
    pub ar: [u32; 16],
    pub pkm: u16,
    pub sasn: u16,
    pub eax: u16,
    pub pasn: u16,
    pub old_psw_addr: u32,
    pub old_psw_per_mode: bool,
    pub called_addr: u32,
    pub modifiable: [u8; 8],
    pub descriptor: EntryDescriptor,
}

impl StackEntry {
    fn encode(&self) -> [u8; 168] {
        let mut b = [0u8; 168];
        for (i, r) in self.gpr.iter().enumerate() {
            b[i * 4..i * 4 + 4].copy_from_slice(&r.to_be_bytes());
        }
        for (i, r) in self.ar.iter().enumerate() {
            b[64 + i * 4..64 + i * 4 + 4].copy_from_slice(&r.to_be_bytes());
        }
        b[128..130].copy_from_slice(&self.pkm.to_be_bytes());
        b[130..132].copy_from_slice(&self.sasn.to_be_bytes());
        b[132..134].copy_from_slice(&self.eax.to_be_bytes());
        b[134..136].copy_from_slice(&self.pasn.to_be_bytes());
        b[136..140].copy_from_slice(&self.old_psw_addr.to_be_bytes());
        b[140] = self.old_psw_per_mode as u8;
        b[144..148].copy_from_slice(&self.called_addr.to_be_bytes());
        b[152..160].copy_from_slice(&self.modifiable);
        b[160..168].copy_from_slice(&self.descriptor.encode());
        b
    }

    fn decode(b: &[u8]) -> Result<Self, ProgramCheck> {
        let mut gpr = [0u32; 16];
        for i in 0..16 {
            gpr[i] = u32::from_be_bytes(b[i * 4..i * 4 + 4].try_into().unwrap());
        }
        let mut ar = [0u32; 16];
        for i in 0..16 {
            ar[i] = u32::from_be_bytes(b[64 + i * 4..64 + i * 4 + 4].try_into().unwrap());
        }
        Ok(StackEntry {
            gpr,
            ar,
            pkm: u16::from_be_bytes([b[128], b[129]]),
            sasn: u16::from_be_bytes([b[130], b[131]]),
            eax: u16::from_be_bytes([b[132], b[133]]),
            pasn: u16::from_be_bytes([b[134], b[135]]),
            old_psw_addr: u32::from_be_bytes(b[136..140].try_into().unwrap()),
            old_psw_per_mode: b[140] != 0,
            called_addr: u32::from_be_bytes(b[144..148].try_into().unwrap()),
            modifiable: b[152..160].try_into().unwrap(),
            descriptor: EntryDescriptor::decode(&b[160..168])?,
        })
    }
}

/// Translate a linkage-stack address. Real DAT (home-segment
/// translation, low-address and page protection) is out of scope for
/// this core (spec §1); addresses are taken as already-translated real
/// addresses, matching [`MainStorage::fetch_unchecked`]'s contract.
pub fn abs_stack_addr(addr: u32) -> u32 {
    addr
}

fn section_base(addr: u32) -> u32 {
    addr & !(SECTION_SIZE - 1)
}

fn entry_start_of_descr(descr_addr: u32) -> u32 {
    descr_addr - DESCRIPTOR_OFFSET
}

fn descr_addr_of_entry(entry_start: u32) -> u32 {
    entry_start + DESCRIPTOR_OFFSET
}

fn read_descriptor(storage: &mut MainStorage, descr_addr: u32) -> Result<EntryDescriptor, ProgramCheck> {
    let b = storage
        .fetch_unchecked(descr_addr, 8)
        .map_err(|_| ProgramCheck::Addressing)?;
    EntryDescriptor::decode(&b)
}

fn write_descriptor(
    storage: &mut MainStorage,
    descr_addr: u32,
    d: &EntryDescriptor,
) -> Result<(), ProgramCheck> {
    storage
        .store_unchecked(descr_addr, &d.encode())
        .map_err(|_| ProgramCheck::Addressing)
}

fn read_link(storage: &mut MainStorage, entry_start: u32) -> Result<u32, ProgramCheck> {
    let b = storage
        .fetch_unchecked(entry_start, 4)
        .map_err(|_| ProgramCheck::Addressing)?;
    Ok(u32::from_be_bytes(b.try_into().unwrap()))
}

fn write_link(storage: &mut MainStorage, entry_start: u32, addr: u32) -> Result<(), ProgramCheck> {
    storage
        .store_unchecked(entry_start, &addr.to_be_bytes())
        .map_err(|_| ProgramCheck::Addressing)
}

fn read_entry(storage: &mut MainStorage, entry_start: u32) -> Result<StackEntry, ProgramCheck> {
    let b = storage
        .fetch_unchecked(entry_start, ENTRY_SIZE as usize)
        .map_err(|_| ProgramCheck::Addressing)?;
    StackEntry::decode(&b)
}

fn write_entry(storage: &mut MainStorage, entry_start: u32, e: &StackEntry) -> Result<(), ProgramCheck> {
    storage
        .store_unchecked(entry_start, &e.encode())
        .map_err(|_| ProgramCheck::Addressing)
}

/// Form a linkage-stack entry for BAKR or the stacking half of PROGRAM
/// CALL (spec §4.4 "Stack entry formation (BAKR/PC)").
///
/// `retn` is the return instruction address stored into the entry's old
/// PSW, and `calla` the called branch address (BAKR) or PC number (PC).
pub fn form_stack_entry(
    storage: &mut MainStorage,
    cpu: &mut CpuState,
    entry_type: EntryType,
    retn: u32,
    calla: u32,
) -> Result<(), ProgramCheck> {
    let cur_descr_addr = abs_stack_addr(cpu.cr15_stack_entry);
    let cur = read_descriptor(storage, cur_descr_addr)?;

    let (new_entry_start, section_index, avail_before) = if (cur.remaining_free_space as u32) >= ENTRY_SIZE
    {
        (cur_descr_addr + 8, cur.section_index, cur.remaining_free_space)
    } else {
        let cur_entry_start = entry_start_of_descr(cur_descr_addr);
        let trailer_entry_start = section_base(cur_entry_start) + SECTION_SIZE - ENTRY_SIZE;
        let trailer_descr_addr = descr_addr_of_entry(trailer_entry_start);
        let trailer = read_descriptor(storage, trailer_descr_addr)?;
        if trailer.entry_type != EntryType::Trailer {
            return Err(ProgramCheck::StackSpecification);
        }
        let new_section_base = read_link(storage, trailer_entry_start)?;
        if new_section_base == 0 {
            return Err(ProgramCheck::StackFull);
        }
        let header_entry_start = new_section_base;
        let header_descr_addr = descr_addr_of_entry(header_entry_start);
        let header = read_descriptor(storage, header_descr_addr)?;
        if header.entry_type != EntryType::Header {
            return Err(ProgramCheck::StackSpecification);
        }
        if (header.remaining_free_space as u32) < ENTRY_SIZE {
            return Err(ProgramCheck::StackSpecification);
        }
        write_link(storage, header_entry_start, cur_descr_addr)?;
        (header_entry_start + ENTRY_SIZE, header.section_index, header.remaining_free_space)
    };

    let entry = StackEntry {
        gpr: cpu.gpr,
        ar: cpu.ar,
        pkm: cpu.pkm,
        sasn: cpu.sasn,
        eax: cpu.eax,
        pasn: cpu.pasn,
        old_psw_addr: retn,
        old_psw_per_mode: cpu.psw.per_mode,
        called_addr: calla,
        modifiable: [0u8; 8],
        descriptor: EntryDescriptor {
            entry_type,
            section_index,
            remaining_free_space: avail_before.saturating_sub(ENTRY_SIZE as u16),
            next_entry_size: 0,
        },
    };
    write_entry(storage, new_entry_start, &entry)?;

    let mut cur = cur;
    cur.next_entry_size = ENTRY_SIZE as u16;
    write_descriptor(storage, cur_descr_addr, &cur)?;

    cpu.cr15_stack_entry = descr_addr_of_entry(new_entry_start);
    Ok(())
}

/// Locate the current state entry for PR/EREG/ESTA/MSTA (spec §4.4
/// "Stack entry location").
fn locate_state_entry(storage: &mut MainStorage, cpu: &CpuState) -> Result<(u32, StackEntry), ProgramCheck> {
    let mut descr_addr = abs_stack_addr(cpu.cr15_stack_entry);
    let mut d = read_descriptor(storage, descr_addr)?;
    if d.entry_type == EntryType::Header {
        // Unstack-suppression is not modeled as independently settable in
        // this core; it is always off, so PR always follows the backward
        // link here.
        let back = read_link(storage, entry_start_of_descr(descr_addr))?;
        if back == 0 {
            return Err(ProgramCheck::StackEmpty);
        }
        descr_addr = back;
        d = read_descriptor(storage, descr_addr)?;
    }
    if d.entry_type != EntryType::Bakr && d.entry_type != EntryType::Pc {
        return Err(ProgramCheck::StackType);
    }
    let entry = read_entry(storage, entry_start_of_descr(descr_addr))?;
    Ok((descr_addr, entry))
}

/// Load GRs/ARs `first..=last` from the current state entry (spec §4.4
/// "Unstack registers", used by EREG/ESTA and the GR/AR portion of PR).
pub fn extract_stacked_registers(
    storage: &mut MainStorage,
    cpu: &mut CpuState,
    first: usize,
    last: usize,
) -> Result<(), ProgramCheck> {
    let (_, entry) = locate_state_entry(storage, cpu)?;
    for i in first..=last {
        cpu.gpr[i] = entry.gpr[i];
        cpu.ar[i] = entry.ar[i];
    }
    Ok(())
}

/// Load PKM/SASN/EAX/PASN and the old PSW from the current state entry
/// without popping it (spec §4.4, used by ESTA/MSTA-style extraction).
pub fn extract_stacked_state(storage: &mut MainStorage, cpu: &mut CpuState) -> Result<(), ProgramCheck> {
    let (_, entry) = locate_state_entry(storage, cpu)?;
    cpu.pkm = entry.pkm;
    cpu.sasn = entry.sasn;
    cpu.eax = entry.eax;
    cpu.pasn = entry.pasn;
    cpu.psw.instruction_address = entry.old_psw_addr;
    Ok(())
}

/// MODIFY STACKED STATE: overwrite selected fields of the current state
/// entry in place without popping it.
pub fn modify_stacked_state(
    storage: &mut MainStorage,
    cpu: &CpuState,
    pkm: Option<u16>,
    key: Option<u8>,
) -> Result<(), ProgramCheck> {
    let (descr_addr, mut entry) = locate_state_entry(storage, cpu)?;
    if let Some(pkm) = pkm {
        entry.pkm = pkm;
    }
    if let Some(key) = key {
        entry.modifiable[0] = key;
    }
    write_entry(storage, entry_start_of_descr(descr_addr), &entry)
}

/// PROGRAM RETURN: pop the current state entry, restore registers/PSW,
/// and for a PC-type entry retranslate PASN/SASN (spec §4.4 "Program
/// Return"). Returns `true` if a space-switch event is signaled.
pub fn program_return_unstack(storage: &mut MainStorage, cpu: &mut CpuState) -> Result<bool, ProgramCheck> {
    let (descr_addr, entry) = locate_state_entry(storage, cpu)?;
    let d = read_descriptor(storage, descr_addr)?;

    for i in 2..=14 {
        cpu.gpr[i] = entry.gpr[i];
        cpu.ar[i] = entry.ar[i];
    }
    let per_mode = cpu.psw.per_mode;
    cpu.psw.instruction_address = entry.old_psw_addr;
    cpu.psw.per_mode = per_mode;

    let mut space_switch = false;

    if d.entry_type == EntryType::Pc {
        let old_pasn = cpu.pasn;
        let old_primary_std = cpu.cr1_primary_std;
        let old_sse = cpu.cr1_primary_sse;

        cpu.pkm = entry.pkm;
        cpu.sasn = entry.sasn;
        cpu.eax = entry.eax;
        cpu.pasn = entry.pasn;

        if cpu.pasn != old_pasn {
            let (_, aste) = crate::lsx::xmem::translate_asn(storage, cpu, cpu.pasn)?;
            cpu.cr1_primary_std = aste.std;
            cpu.cr1_primary_sse = aste.sse;
            cpu.cr1_primary_is_base = aste.base_space;
            crate::lsx::xmem::apply_subspace_replacement(storage, cpu)?;
            space_switch = old_sse || cpu.cr1_primary_sse;
        } else {
            let _ = old_primary_std;
        }

        if cpu.sasn == cpu.pasn {
            cpu.cr7_secondary_std = cpu.cr1_primary_std;
        } else {
            let (_, aste) = crate::lsx::xmem::translate_asn(storage, cpu, cpu.sasn)?;
            cpu.cr7_secondary_std = aste.std;
        }
    }

    let entry_start = entry_start_of_descr(descr_addr);
    let sbase = section_base(entry_start);
    let prev_descr_addr = if entry_start == sbase + ENTRY_SIZE {
        descr_addr_of_entry(sbase)
    } else {
        descr_addr_of_entry(entry_start - ENTRY_SIZE)
    };
    let mut prev = read_descriptor(storage, prev_descr_addr)?;
    prev.next_entry_size = 0;
    write_descriptor(storage, prev_descr_addr, &prev)?;
    cpu.cr15_stack_entry = prev_descr_addr;

    Ok(space_switch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsx::Psw;

    /// Build a single empty section (header + trailer, no forward link)
    /// at `base` and point `cpu.cr15_stack_entry` at its header.
    fn init_single_section(storage: &mut MainStorage, base: u32) -> u32 {
        let header_descr = EntryDescriptor {
            entry_type: EntryType::Header,
            section_index: 0,
            remaining_free_space: (SECTION_SIZE - 2 * ENTRY_SIZE) as u16,
            next_entry_size: 0,
        };
        write_link(storage, base, 0).unwrap();
        write_descriptor(storage, descr_addr_of_entry(base), &header_descr).unwrap();

        let trailer_start = base + SECTION_SIZE - ENTRY_SIZE;
        let trailer_descr = EntryDescriptor {
            entry_type: EntryType::Trailer,
            section_index: 0,
            remaining_free_space: 0,
            next_entry_size: 0,
        };
        write_link(storage, trailer_start, 0).unwrap();
        write_descriptor(storage, descr_addr_of_entry(trailer_start), &trailer_descr).unwrap();

        descr_addr_of_entry(base)
    }

    #[test]
    fn push_then_pop_restores_gpr_2_through_14_and_psw() {
        let mut storage = MainStorage::new(3 * SECTION_SIZE as usize);
        let header_descr = init_single_section(&mut storage, 0);

        let mut cpu = CpuState {
            gpr: std::array::from_fn(|i| (i + 1) as u32),
            cr15_stack_entry: header_descr,
            psw: Psw {
                instruction_address: 0x1000,
                ..Default::default()
            },
            ..Default::default()
        };

        form_stack_entry(&mut storage, &mut cpu, EntryType::Bakr, 0x12340, 0x56780).unwrap();
        assert_ne!(cpu.cr15_stack_entry, header_descr);

        for i in 2..=14 {
            cpu.gpr[i] = 0xDEAD_0000 + i as u32;
        }
        cpu.gpr[15] = 0xFFFF_FFFF;

        let sse = program_return_unstack(&mut storage, &mut cpu).unwrap();
        assert!(!sse);
        assert_eq!(cpu.psw.instruction_address, 0x12340);
        for i in 2..=14 {
            assert_eq!(cpu.gpr[i], i as u32 + 1);
        }
        assert_eq!(cpu.gpr[0], 1);
        assert_eq!(cpu.gpr[1], 2);
        assert_eq!(cpu.gpr[15], 0xFFFF_FFFF);
        assert_eq!(cpu.cr15_stack_entry, header_descr);
    }

    #[test]
    fn pop_with_no_pushes_is_stack_empty() {
        let mut storage = MainStorage::new(3 * SECTION_SIZE as usize);
        let header_descr = init_single_section(&mut storage, 0);
        let mut cpu = CpuState {
            cr15_stack_entry: header_descr,
            ..Default::default()
        };
        assert_eq!(
            program_return_unstack(&mut storage, &mut cpu),
            Err(ProgramCheck::StackEmpty)
        );
    }

    #[test]
    fn push_past_section_capacity_is_stack_full() {
        let mut storage = MainStorage::new(2 * SECTION_SIZE as usize);
        let header_descr = init_single_section(&mut storage, 0);
        let mut cpu = CpuState {
            cr15_stack_entry: header_descr,
            ..Default::default()
        };

        // Fill the one section (room for (4096 - 2*168) / 168 = 22 entries).
        let capacity = (SECTION_SIZE - 2 * ENTRY_SIZE) / ENTRY_SIZE;
        for _ in 0..capacity {
            form_stack_entry(&mut storage, &mut cpu, EntryType::Bakr, 0, 0).unwrap();
        }
        assert_eq!(
            form_stack_entry(&mut storage, &mut cpu, EntryType::Bakr, 0, 0),
            Err(ProgramCheck::StackFull)
        );
    }
}

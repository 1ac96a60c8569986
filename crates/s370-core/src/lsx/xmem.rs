//! Cross-memory instructions: ASN translation and subspace replacement
//! shared by PROGRAM CALL/PROGRAM RETURN (spec §4.4), and the rest of
//! the cross-memory instruction family that rides on the same machinery
//! (SSAR, LASP, SAC/IAC, BSA, BSG — spec §4.4.x).
//!
//! A full seven-step ASN-translation procedure and access-register
//! translation are out of scope for this core; the table-walk here
//! implements the exceptions spec.md names (AFX/ASX-translation,
//! ASTE-validity) against a deliberately narrowed ASTE layout. See
//! DESIGN.md for the Open Question decisions this simplification
//! resolves.

use crate::error::ProgramCheck;
use crate::lsx::{AddressSpaceControl, CpuState};
use crate::storage::MainStorage;

const AFX_ENTRY_SIZE: u32 = 16;
const ASX_ENTRY_SIZE: u32 = 16;
const ASTE_SIZE: u32 = 16;

const TABLE_INVALID_BIT: u32 = 0x8000_0000;
const ASTE_INVALID_BIT: u32 = 0x8000_0000;
/// Convention adopted for this core's narrowed ASTE (word 0, bit 1):
/// space-switch-event control.
const ASTE_SSE_BIT: u32 = 0x4000_0000;
/// Convention adopted for this core's narrowed ASTE (word 0, bit 2):
/// this ASTE is the base ASTE for its dispatchable unit.
const ASTE_BASE_BIT: u32 = 0x2000_0000;
/// Convention adopted for this core's narrowed STD: subspace-group bit.
const STD_SUBSPACE_GROUP_BIT: u32 = 0x0000_0002;
/// Bits of the STD subspace replacement overwrites (all but the
/// validity bit and the subspace-group bit itself, spec §4.4: "bits
/// 1-23 and 25-31").
const STD_SUBSPACE_REPLACE_MASK: u32 = !(0x8000_0000 | STD_SUBSPACE_GROUP_BIT);

/// The fields this core reads out of an ASN-translated ASTE.
#[derive(Debug, Clone, Copy)]
pub struct AsteInfo {
    pub origin: u32,
    pub std: u32,
    pub sse: bool,
    pub base_space: bool,
}

/// Dispatchable-unit control table entry consulted by subspace
/// replacement.
struct Duct {
    subspace_active: bool,
    subspace_asteo: u32,
}

fn read_duct(storage: &mut MainStorage, addr: u32) -> Result<Duct, ProgramCheck> {
    let w = storage
        .fetch_unchecked(addr, 8)
        .map_err(|_| ProgramCheck::Addressing)?;
    let flags = u32::from_be_bytes(w[0..4].try_into().unwrap());
    let asteo = u32::from_be_bytes(w[4..8].try_into().unwrap());
    Ok(Duct {
        subspace_active: flags & 0x8000_0000 != 0,
        subspace_asteo: asteo,
    })
}

fn read_aste(storage: &mut MainStorage, asteo: u32) -> Result<AsteInfo, ProgramCheck> {
    let w = storage
        .fetch_unchecked(asteo, ASTE_SIZE as usize)
        .map_err(|_| ProgramCheck::Addressing)?;
    let word0 = u32::from_be_bytes(w[0..4].try_into().unwrap());
    if word0 & ASTE_INVALID_BIT != 0 {
        return Err(ProgramCheck::AsteValidity);
    }
    let std = u32::from_be_bytes(w[4..8].try_into().unwrap());
    Ok(AsteInfo {
        origin: asteo,
        std,
        sse: word0 & ASTE_SSE_BIT != 0,
        base_space: word0 & ASTE_BASE_BIT != 0,
    })
}

/// Read word 3 of the primary ASTE (the ASF-mode source of the linkage-
/// table designation, spec §4.4 "Program Call").
pub fn read_primary_linkage_designation(storage: &mut MainStorage, cpu: &CpuState) -> Result<u32, ProgramCheck> {
    let (_, aste) = translate_asn(storage, cpu, cpu.pasn)?;
    let w = storage
        .fetch_unchecked(aste.origin + 12, 4)
        .map_err(|_| ProgramCheck::Addressing)?;
    Ok(u32::from_be_bytes(w.try_into().unwrap()))
}

/// ASN translation: AFX-table lookup, then ASX-table lookup, then the
/// ASTE itself (spec §4.4, exceptions per spec.md §9's fixed exception
/// list: AFX-translation, ASX-translation, ASTE-validity).
pub fn translate_asn(
    storage: &mut MainStorage,
    cpu: &CpuState,
    asn: u16,
) -> Result<(u32, AsteInfo), ProgramCheck> {
    let afx = (asn >> 8) as u32;
    let asx = (asn & 0xFF) as u32;

    let afte_addr = cpu.afto + afx * AFX_ENTRY_SIZE;
    let afte = storage
        .fetch_unchecked(afte_addr, 4)
        .map_err(|_| ProgramCheck::Addressing)?;
    let afte_word = u32::from_be_bytes(afte.try_into().unwrap());
    if afte_word & TABLE_INVALID_BIT != 0 {
        return Err(ProgramCheck::AfxTranslation);
    }
    let asto = afte_word & 0x7FFF_FFFF;

    let aste_ptr_addr = asto + asx * ASX_ENTRY_SIZE;
    let axte = storage
        .fetch_unchecked(aste_ptr_addr, 4)
        .map_err(|_| ProgramCheck::Addressing)?;
    let axte_word = u32::from_be_bytes(axte.try_into().unwrap());
    if axte_word & TABLE_INVALID_BIT != 0 {
        return Err(ProgramCheck::AsxTranslation);
    }
    let asteo = axte_word & 0x7FFF_FFFF;

    let aste = read_aste(storage, asteo)?;
    Ok((asteo, aste))
}

/// Subspace replacement: when the dispatchable unit is subspace-active
/// and the primary ASTE is the base ASTE for it, splice bits 1-23 and
/// 25-31 of the primary STD from the DUCT's subspace ASTE (spec §4.4
/// "Subspace replacement").
pub fn apply_subspace_replacement(storage: &mut MainStorage, cpu: &mut CpuState) -> Result<(), ProgramCheck> {
    if !cpu.ssgroup_enabled {
        return Ok(());
    }
    if cpu.cr1_primary_std & STD_SUBSPACE_GROUP_BIT == 0 {
        return Ok(());
    }
    let duct = read_duct(storage, cpu.duct_addr)?;
    if !duct.subspace_active || !cpu.cr1_primary_is_base {
        return Ok(());
    }
    let subspace = read_aste(storage, duct.subspace_asteo)?;
    cpu.cr1_primary_std = (cpu.cr1_primary_std & !STD_SUBSPACE_REPLACE_MASK)
        | (subspace.std & STD_SUBSPACE_REPLACE_MASK);
    Ok(())
}

fn set_primary_asn(storage: &mut MainStorage, cpu: &mut CpuState, asn: u16) -> Result<bool, ProgramCheck> {
    let old_sse = cpu.cr1_primary_sse;
    let (_, aste) = translate_asn(storage, cpu, asn)?;
    cpu.pasn = asn;
    cpu.cr1_primary_std = aste.std;
    cpu.cr1_primary_sse = aste.sse;
    cpu.cr1_primary_is_base = aste.base_space;
    apply_subspace_replacement(storage, cpu)?;
    Ok(old_sse || aste.sse)
}

/// An entry-table entry as consulted by PROGRAM CALL (spec §4.4
/// "Program Call"): target address, addressing mode, whether this PC is
/// stacking, the authorization-key mask, and (if nonzero) the
/// space-switching target ASN.
#[derive(Debug, Clone, Copy)]
pub struct EntryTableEntry {
    pub instruction_address: u32,
    pub amode31: bool,
    pub stacking: bool,
    pub akm: u16,
    pub asn: u16,
}

const LTD_SUBSYSTEM_LINKAGE_BIT: u32 = 0x8000_0000;
const LTE_INVALID_BIT: u32 = 0x8000_0000;
const ETE_INVALID_BIT: u32 = 0x8000_0000;

fn read_entry_table_entry(storage: &mut MainStorage, ete_addr: u32) -> Result<EntryTableEntry, ProgramCheck> {
    let w = storage
        .fetch_unchecked(ete_addr, 16)
        .map_err(|_| ProgramCheck::Addressing)?;
    let word0 = u32::from_be_bytes(w[0..4].try_into().unwrap());
    if word0 & ETE_INVALID_BIT != 0 {
        return Err(ProgramCheck::ExTranslation);
    }
    let instruction_address = u32::from_be_bytes(w[4..8].try_into().unwrap());
    let word2 = u32::from_be_bytes(w[8..12].try_into().unwrap());
    Ok(EntryTableEntry {
        instruction_address,
        amode31: word0 & 0x4000_0000 != 0,
        stacking: word0 & 0x2000_0000 != 0,
        akm: ((word2 >> 16) & 0xFFFF) as u16,
        asn: (word2 & 0xFFFF) as u16,
    })
}

/// PROGRAM CALL: decode the 20-bit PC number, validate the linkage/
/// entry table path, stack if the ETE's T-bit is set, and ASN-translate
/// a space-switching target (spec §4.4 "Program Call"). Returns `true`
/// if a space-switch event is signaled.
pub fn program_call(
    storage: &mut MainStorage,
    cpu: &mut CpuState,
    pc_number: u32,
    return_addr: u32,
) -> Result<bool, ProgramCheck> {
    let lx = (pc_number >> 7) & 0x1FFF;
    let ex = pc_number & 0x7F;

    let ltd = if cpu.asf_on {
        read_primary_linkage_designation(storage, cpu)?
    } else {
        cpu.cr5_linkage
    };
    if ltd & LTD_SUBSYSTEM_LINKAGE_BIT == 0 {
        return Err(ProgramCheck::SpecialOperation);
    }
    let lto = ltd & 0x7FFF_FFFF;

    let lte_addr = lto + lx * 8;
    let lte = storage
        .fetch_unchecked(lte_addr, 4)
        .map_err(|_| ProgramCheck::Addressing)?;
    let lte_word = u32::from_be_bytes(lte.try_into().unwrap());
    if lte_word & LTE_INVALID_BIT != 0 {
        return Err(ProgramCheck::LxTranslation);
    }
    let eto = lte_word & 0x7FFF_FFFF;
    let ete_size = if cpu.asf_on { 32 } else { 16 };
    let ete_addr = eto + ex * ete_size;
    let ete = read_entry_table_entry(storage, ete_addr)?;

    if ete.akm != 0 && cpu.pkm & ete.akm == 0 {
        return Err(ProgramCheck::PcTranslationSpecification);
    }

    if ete.stacking {
        crate::lsx::stack::form_stack_entry(
            storage,
            cpu,
            crate::lsx::stack::EntryType::Pc,
            return_addr,
            pc_number,
        )?;
    }

    let mut space_switch = false;
    if ete.asn != 0 {
        let old_pasn = cpu.pasn;
        let old_primary_std = cpu.cr1_primary_std;
        space_switch = set_primary_asn(storage, cpu, ete.asn)?;
        cpu.sasn = old_pasn;
        cpu.cr7_secondary_std = old_primary_std;
    }

    cpu.psw.instruction_address = ete.instruction_address;
    Ok(space_switch)
}

/// PROGRAM TRANSFER: like PROGRAM CALL but non-stacking; narrows PKM by
/// ANDing with `new_pkm_mask`, and swaps primary/secondary ASN (spec
/// §4.4 "Program Transfer").
pub fn program_transfer(
    storage: &mut MainStorage,
    cpu: &mut CpuState,
    target_asn: u16,
    new_pkm_mask: u16,
    set_problem_state: bool,
) -> Result<bool, ProgramCheck> {
    cpu.pkm &= new_pkm_mask;

    let old_pasn = cpu.pasn;
    let old_primary_std = cpu.cr1_primary_std;
    let space_switch = set_primary_asn(storage, cpu, target_asn)?;
    cpu.sasn = old_pasn;
    cpu.cr7_secondary_std = old_primary_std;

    // "The problem-state bit may be set but not cleared in problem
    // state": PT can only turn it on, never off.
    if set_problem_state {
        cpu.psw.problem_state = true;
    }

    Ok(space_switch)
}

/// SET SECONDARY ASN.
pub fn set_secondary_asn(storage: &mut MainStorage, cpu: &mut CpuState, asn: u16) -> Result<(), ProgramCheck> {
    if asn == cpu.pasn {
        cpu.sasn = asn;
        cpu.cr7_secondary_std = cpu.cr1_primary_std;
        return Ok(());
    }
    let (_, aste) = translate_asn(storage, cpu, asn)?;
    cpu.sasn = asn;
    cpu.cr7_secondary_std = aste.std;
    Ok(())
}

/// LOAD ADDRESS SPACE PARAMETERS: load PASN/SASN/EAX (and their
/// translated STDs) from a parameter list in storage.
pub fn load_address_space_parameters(
    storage: &mut MainStorage,
    cpu: &mut CpuState,
    parm_addr: u32,
) -> Result<(), ProgramCheck> {
    let w = storage
        .fetch_unchecked(parm_addr, 12)
        .map_err(|_| ProgramCheck::Addressing)?;
    let pasn = u16::from_be_bytes([w[2], w[3]]);
    let sasn = u16::from_be_bytes([w[6], w[7]]);
    let eax = u16::from_be_bytes([w[10], w[11]]);

    set_primary_asn(storage, cpu, pasn)?;
    if sasn == pasn {
        cpu.sasn = sasn;
        cpu.cr7_secondary_std = cpu.cr1_primary_std;
    } else {
        let (_, aste) = translate_asn(storage, cpu, sasn)?;
        cpu.sasn = sasn;
        cpu.cr7_secondary_std = aste.std;
    }
    cpu.eax = eax;
    Ok(())
}

/// SET ADDRESS SPACE CONTROL.
pub fn set_address_space_control(cpu: &mut CpuState, mode_code: u8) -> Result<(), ProgramCheck> {
    cpu.address_space_control =
        AddressSpaceControl::from_mode_code(mode_code).ok_or(ProgramCheck::Specification)?;
    Ok(())
}

/// INSERT ADDRESS SPACE CONTROL.
pub fn insert_address_space_control(cpu: &CpuState) -> u8 {
    cpu.address_space_control.mode_code()
}

/// BRANCH AND SET AUTHORITY: branch to `target_addr`, optionally
/// widening EAX (spec §4.4.x). Full ALET/access-register translation is
/// out of scope for this core; the caller resolves `new_eax`.
pub fn branch_and_set_authority(
    cpu: &mut CpuState,
    target_addr: u32,
    new_eax: Option<u16>,
) -> Result<(), ProgramCheck> {
    if let Some(eax) = new_eax {
        cpu.eax = eax;
    }
    cpu.psw.instruction_address = target_addr;
    Ok(())
}

/// BRANCH IN SUBSPACE GROUP: branch within a dispatchable unit's
/// subspace group, reapplying subspace replacement at the new location.
pub fn branch_in_subspace_group(
    storage: &mut MainStorage,
    cpu: &mut CpuState,
    target_addr: u32,
) -> Result<(), ProgramCheck> {
    apply_subspace_replacement(storage, cpu)?;
    cpu.psw.instruction_address = target_addr;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_afte(storage: &mut MainStorage, afto: u32, afx: u32, asto: u32) {
        storage.store_unchecked(afto + afx * AFX_ENTRY_SIZE, &asto.to_be_bytes()).unwrap();
    }

    fn write_axte(storage: &mut MainStorage, asto: u32, asx: u32, asteo: u32) {
        storage.store_unchecked(asto + asx * ASX_ENTRY_SIZE, &asteo.to_be_bytes()).unwrap();
    }

    fn write_aste(storage: &mut MainStorage, asteo: u32, std: u32, sse: bool, base: bool) {
        let mut word0 = 0u32;
        if sse {
            word0 |= ASTE_SSE_BIT;
        }
        if base {
            word0 |= ASTE_BASE_BIT;
        }
        storage.store_unchecked(asteo, &word0.to_be_bytes()).unwrap();
        storage.store_unchecked(asteo + 4, &std.to_be_bytes()).unwrap();
    }

    #[test]
    fn translate_asn_walks_afx_then_asx_then_aste() {
        let mut storage = MainStorage::new(0x10000);
        write_afte(&mut storage, 0x1000, 0x00, 0x2000);
        write_axte(&mut storage, 0x2000, 0x42, 0x3000);
        write_aste(&mut storage, 0x3000, 0xABCD_0000, true, true);

        let cpu = CpuState {
            afto: 0x1000,
            ..Default::default()
        };
        let (asteo, aste) = translate_asn(&mut storage, &cpu, 0x0042).unwrap();
        assert_eq!(asteo, 0x3000);
        assert_eq!(aste.std, 0xABCD_0000);
        assert!(aste.sse);
        assert!(aste.base_space);
    }

    #[test]
    fn invalid_afx_entry_is_afx_translation_exception() {
        let mut storage = MainStorage::new(0x10000);
        storage.store_unchecked(0x1000, &TABLE_INVALID_BIT.to_be_bytes()).unwrap();
        let cpu = CpuState {
            afto: 0x1000,
            ..Default::default()
        };
        assert_eq!(
            translate_asn(&mut storage, &cpu, 0x0000),
            Err(ProgramCheck::AfxTranslation)
        );
    }

    #[test]
    fn invalid_asx_entry_is_asx_translation_exception() {
        let mut storage = MainStorage::new(0x10000);
        write_afte(&mut storage, 0x1000, 0, 0x2000);
        storage.store_unchecked(0x2000, &TABLE_INVALID_BIT.to_be_bytes()).unwrap();
        let cpu = CpuState {
            afto: 0x1000,
            ..Default::default()
        };
        assert_eq!(
            translate_asn(&mut storage, &cpu, 0x0000),
            Err(ProgramCheck::AsxTranslation)
        );
    }

    #[test]
    fn program_transfer_swaps_primary_and_secondary_asn() {
        let mut storage = MainStorage::new(0x10000);
        write_afte(&mut storage, 0x1000, 0, 0x2000);
        write_axte(&mut storage, 0x2000, 7, 0x3000);
        write_aste(&mut storage, 0x3000, 0x1111_0000, false, true);

        let mut cpu = CpuState {
            afto: 0x1000,
            pasn: 0x0099,
            cr1_primary_std: 0x9999_0000,
            pkm: 0xFFFF,
            ..Default::default()
        };
        program_transfer(&mut storage, &mut cpu, 0x0007, 0x00F0, false).unwrap();
        assert_eq!(cpu.pasn, 0x0007);
        assert_eq!(cpu.cr1_primary_std, 0x1111_0000);
        assert_eq!(cpu.sasn, 0x0099);
        assert_eq!(cpu.cr7_secondary_std, 0x9999_0000);
        assert_eq!(cpu.pkm, 0x00F0);
    }
}

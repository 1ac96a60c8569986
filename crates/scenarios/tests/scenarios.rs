//! End-to-end scenarios binding the channel subsystem, the linkage
//! stack, and a compressed-CKD-backed device together (spec §8).

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use cckd::track::{self, CkdRecord};
use cckd::{chkdsk, CckdImage, CheckLevel, CompressionKind};

use s370_core::ccw::CcwFlags;
use s370_core::channel;
use s370_core::config::{CkdGeometryConfig, DeviceBacking, DeviceConfig};
use s370_core::device::{ChannelMode, DeviceBlock, SysBlock};
use s370_core::lsx::stack::{self, EntryType};
use s370_core::lsx::xmem;
use s370_core::lsx::{CpuState, Psw};
use s370_core::scsw::{ActivityControl, ChanStat, Irb, Orb, StatusControl, UnitStatus};
use s370_core::storage::MainStorage;

use scenarios::{CkdDeviceHandler, NopHandler};

fn encode_format1(opcode: u8, flags: CcwFlags, count: u16, addr: u32) -> [u8; 8] {
    let mut b = [0u8; 8];
    b[0] = opcode;
    b[1] = flags.bits();
    b[2..4].copy_from_slice(&count.to_be_bytes());
    b[4..8].copy_from_slice(&addr.to_be_bytes());
    b
}

fn wait_for_status(dev: &Arc<DeviceBlock>) {
    for _ in 0..400 {
        if dev.lock().scsw.status_pending() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("device never posted status within the wait budget");
}

/// Scenario 1: "Read IPL record". A three-CCW chain (read, then TIC to a
/// chained read elsewhere in storage) pulls record 1 of track 0 off a
/// CKD-backed device into main storage, end to end through `start_io`.
#[test]
fn scenario_1_read_ipl_record() {
    let mut ipl_data = vec![0xABu8; 4120];
    for (i, b) in ipl_data[..24].iter_mut().enumerate() {
        *b = i as u8;
    }

    let file = Cursor::new(Vec::new());
    let mut image = CckdImage::create(file, 0x90, 1113, CompressionKind::None).unwrap();
    let record1 = CkdRecord { cyl: 0, head: 0, rec: 1, key: vec![], data: ipl_data.clone() };
    let track0 = track::build_track(0, 0, &[record1]);
    image.write_track(0, &track0).unwrap();

    let handler = Arc::new(CkdDeviceHandler::new(image, 0, 1));
    let config = DeviceConfig {
        device_number: 0x009,
        subchannel: 0,
        device_type: 0x3390,
        backing: DeviceBacking::Ckd {
            path: "ipl.ckd".into(),
            geometry: CkdGeometryConfig { heads: 15, bytes_per_track: 56664 },
        },
    };
    let mut sys = SysBlock::new(0x8000, ChannelMode::ChannelSubsystem);
    let dev = DeviceBlock::from_config(&config, handler);
    sys.add_device(Arc::clone(&dev));
    let sys = Arc::new(sys);

    {
        let mut storage = sys.mainstor.lock().unwrap();
        storage.store(0x0, &encode_format1(0x02, CcwFlags::CC, 24, 0x800), 0).unwrap();
        storage.store(0x8, &encode_format1(0x08, CcwFlags::empty(), 0, 0x3AB8), 0).unwrap();
        storage.store(0x3AB8, &encode_format1(0x06, CcwFlags::empty(), 4096, 0x3A98), 0).unwrap();
    }

    let orb = Orb { ccw_addr: 0, format1: true, ..Default::default() };
    assert_eq!(channel::start_io(&sys, &dev, 0, orb), 0);
    wait_for_status(&dev);

    let st = dev.lock();
    assert!(st.scsw.status_control.contains(StatusControl::PRI | StatusControl::SEC));
    assert_eq!(st.scsw.unit_status, UnitStatus::CE | UnitStatus::DE);
    assert!(st.scsw.chan_status.is_empty());
    assert_eq!(st.scsw.count, 0);
    drop(st);

    let mut storage = sys.mainstor.lock().unwrap();
    assert_eq!(storage.fetch(0x800, 24, 0).unwrap(), ipl_data[..24]);
    assert_eq!(storage.fetch(0x3A98, 4096, 0).unwrap(), ipl_data[24..]);
}

/// Scenario 2: "Suspend/resume". A single suspend-flagged CCW parks the
/// subchannel; TEST SUBCHANNEL observes it suspended. While suspended, the
/// CCW is overwritten in place (the usual pattern for a channel program
/// that waits on operator/media action before deciding what to run next);
/// RESUME SUBCHANNEL must re-fetch from the *same* address rather than
/// wherever the chain had already advanced to, picking up the new CCW.
#[test]
fn scenario_2_suspend_then_resume_completes_the_chain() {
    let mut sys = SysBlock::new(4096, ChannelMode::ChannelSubsystem);
    let dev = DeviceBlock::new(0x020, 0, 0x3390, Arc::new(NopHandler));
    sys.add_device(Arc::clone(&dev));
    let sys = Arc::new(sys);

    {
        let mut storage = sys.mainstor.lock().unwrap();
        storage.store(0, &encode_format1(0x03, CcwFlags::SUSP, 1, 0), 0).unwrap();
    }

    let orb = Orb { ccw_addr: 0, format1: true, suspend_control: true, ..Default::default() };
    assert_eq!(channel::start_io(&sys, &dev, 0, orb), 0);

    let mut irb = Irb::default();
    let mut cc = 1;
    for _ in 0..400 {
        cc = channel::test_subchan(&dev, &mut irb);
        if cc == 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(cc, 0);
    assert!(irb.scsw.status_control.contains(StatusControl::INTER));
    assert!(irb.scsw.status_pending());
    assert!(irb.scsw.activity_control.contains(ActivityControl::SUSP));

    {
        let mut storage = sys.mainstor.lock().unwrap();
        storage.store(0, &encode_format1(0x03, CcwFlags::empty(), 1, 0), 0).unwrap();
    }

    assert_eq!(channel::resume_subchan(&dev), 0);

    wait_for_status(&dev);
    let st = dev.lock();
    assert!(st.scsw.status_pending());
    assert_eq!(st.scsw.unit_status, UnitStatus::CE | UnitStatus::DE);
    assert!(st.scsw.chan_status.is_empty());
}

/// Scenario 3: "PR after BAKR". BAKR pushes gprs 0-15 onto a fresh
/// linkage-stack section; clobbering gprs 2-14 and then issuing PROGRAM
/// RETURN restores exactly that range and the branch-back address.
#[test]
fn scenario_3_program_return_after_bakr_restores_gpr2_through_14() {
    fn raw_descriptor(entry_type: u8, section_index: u16, remaining: u16, next_size: u16) -> [u8; 8] {
        let mut b = [0u8; 8];
        b[0] = entry_type;
        b[1..3].copy_from_slice(&section_index.to_be_bytes());
        b[3..5].copy_from_slice(&remaining.to_be_bytes());
        b[5..7].copy_from_slice(&next_size.to_be_bytes());
        b
    }

    fn init_single_stack_section(storage: &mut MainStorage, base: u32) -> u32 {
        storage.store_unchecked(base, &0u32.to_be_bytes()).unwrap();
        storage
            .store_unchecked(base + 160, &raw_descriptor(0, 0, (stack::SECTION_SIZE - 2 * stack::ENTRY_SIZE) as u16, 0))
            .unwrap();

        let trailer_start = base + stack::SECTION_SIZE - stack::ENTRY_SIZE;
        storage.store_unchecked(trailer_start, &0u32.to_be_bytes()).unwrap();
        storage.store_unchecked(trailer_start + 160, &raw_descriptor(1, 0, 0, 0)).unwrap();

        base + 160
    }

    let mut storage = MainStorage::new(3 * stack::SECTION_SIZE as usize);
    let header_descr = init_single_stack_section(&mut storage, 0);

    let mut cpu = CpuState {
        gpr: std::array::from_fn(|i| (i + 1) as u32),
        cr15_stack_entry: header_descr,
        psw: Psw { instruction_address: 0x1000, ..Default::default() },
        ..Default::default()
    };

    stack::form_stack_entry(&mut storage, &mut cpu, EntryType::Bakr, 0x12340, 0x56780).unwrap();

    for i in 2..=14 {
        cpu.gpr[i] = 0xDEAD_0000 + i as u32;
    }

    let space_switch = stack::program_return_unstack(&mut storage, &mut cpu).unwrap();

    assert!(!space_switch);
    assert_eq!(cpu.psw.instruction_address, 0x12340);
    for i in 2..=14 {
        assert_eq!(cpu.gpr[i], i as u32 + 1);
    }
    assert_eq!(cpu.gpr[0], 1);
    assert_eq!(cpu.gpr[1], 2);
    assert_eq!(cpu.gpr[15], 16);
    assert_eq!(cpu.cr15_stack_entry, header_descr);
}

/// Scenario 4: "Repair missing L2". Corrupting L1[0] to the all-ones
/// "orphaned" marker forces the repair engine to recover all three
/// tracks that table used to own, purely from their track-image headers.
#[test]
fn scenario_4_repair_missing_l2_recovers_all_three_tracks() {
    let payloads: Vec<Vec<u8>> = (0..3u32)
        .map(|t| {
            let head = t as u16;
            track::build_track(0, head, &[CkdRecord { cyl: 0, head, rec: 1, key: vec![], data: vec![t as u8; 64] }])
        })
        .collect();

    let mut file = Cursor::new(Vec::new());
    {
        let mut image = CckdImage::create(&mut file, 0x90, 1113, CompressionKind::None).unwrap();
        for (t, data) in payloads.iter().enumerate() {
            image.write_track(t as u32, data).unwrap();
        }
    }
    let mut raw = file.into_inner();

    let l1_pos = cckd::header::L1_TABLE_POS as usize;
    raw[l1_pos..l1_pos + 4].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());

    let mut cursor = Cursor::new(raw);
    let changes = chkdsk(&mut cursor, CheckLevel::Default).unwrap();
    assert!(changes > 0, "repair engine should have reported at least one structural change");

    let repaired = cursor.into_inner();
    let mut image = CckdImage::open(Cursor::new(repaired), CompressionKind::None).unwrap();
    for (t, expected) in payloads.iter().enumerate() {
        let got = image.read_track(t as u32).unwrap();
        assert_eq!(&got, expected, "track {t} did not round-trip through repair");
    }
}

/// Scenario 5: "PC with space switch". A stacking PROGRAM CALL whose
/// entry-table entry names a different ASN translates that ASN, stacks
/// the caller's state, and adopts the target address space's STD.
#[test]
fn scenario_5_program_call_with_space_switch() {
    let mut storage = MainStorage::new(0x40000);

    // AFX -> ASX -> ASTE table walk for target ASN 0x0042 (afx=0, asx=0x42).
    let afto = 0x10000u32;
    let asto = 0x11000u32;
    let asteo = 0x12000u32;
    storage.store_unchecked(afto, &asto.to_be_bytes()).unwrap(); // AFTE, valid
    storage.store_unchecked(asto + 0x42 * 16, &asteo.to_be_bytes()).unwrap(); // AXTE, valid
    let aste_word0 = 0x4000_0000u32; // space-switch-event bit set
    storage.store_unchecked(asteo, &aste_word0.to_be_bytes()).unwrap();
    storage.store_unchecked(asteo + 4, &0x5555_0000u32.to_be_bytes()).unwrap(); // STD

    // Linkage table (basic mode: CR5 holds the LTD directly) -> entry table.
    let lto = 0x20000u32;
    let eto = 0x30000u32;
    let ltd = 0x8000_0000u32 | lto; // subsystem-linkage bit set
    let pc_number = 0x0000_0001u32; // lx = 0, ex = 1
    storage.store_unchecked(lto, &eto.to_be_bytes()).unwrap(); // LTE at lx*8, valid

    let ete_addr = eto + 1 * 16;
    let ete_word0 = 0x2000_0000u32; // stacking (T) bit set
    storage.store_unchecked(ete_addr, &ete_word0.to_be_bytes()).unwrap();
    storage.store_unchecked(ete_addr + 4, &0x0000_9000u32.to_be_bytes()).unwrap(); // target instruction address
    storage.store_unchecked(ete_addr + 8, &0x0000_0042u32.to_be_bytes()).unwrap(); // akm=0, asn=0x0042

    fn raw_descriptor(entry_type: u8, remaining: u16) -> [u8; 8] {
        let mut b = [0u8; 8];
        b[0] = entry_type;
        b[3..5].copy_from_slice(&remaining.to_be_bytes());
        b
    }

    let stack_base = 0x38000u32;
    storage.store_unchecked(stack_base, &0u32.to_be_bytes()).unwrap();
    storage
        .store_unchecked(stack_base + 160, &raw_descriptor(0, (stack::SECTION_SIZE - 2 * stack::ENTRY_SIZE) as u16))
        .unwrap();
    let trailer_start = stack_base + stack::SECTION_SIZE - stack::ENTRY_SIZE;
    storage.store_unchecked(trailer_start, &0u32.to_be_bytes()).unwrap();
    storage.store_unchecked(trailer_start + 160, &raw_descriptor(1, 0)).unwrap();
    let header_descr = stack_base + 160;

    let mut cpu = CpuState { afto, cr5_linkage: ltd, cr15_stack_entry: header_descr, ..Default::default() };

    let space_switch = xmem::program_call(&mut storage, &mut cpu, pc_number, 0x1234).unwrap();

    assert!(space_switch);
    assert_eq!(cpu.pasn, 0x0042);
    assert_eq!(cpu.cr1_primary_std, 0x5555_0000);
    assert_eq!(cpu.psw.instruction_address, 0x9000);
    assert_ne!(cpu.cr15_stack_entry, header_descr);

    let pushed_type = storage.fetch_unchecked(cpu.cr15_stack_entry, 1).unwrap()[0];
    assert_eq!(pushed_type, 3); // EntryType::Pc
}

/// Scenario 6: "Program-check path". Starting a channel program at a CCW
/// address that isn't doubleword-aligned faults before any CCW runs.
#[test]
fn scenario_6_misaligned_ccw_address_is_a_program_check() {
    let mut sys = SysBlock::new(4096, ChannelMode::ChannelSubsystem);
    let dev = DeviceBlock::new(0x030, 0, 0x3390, Arc::new(NopHandler));
    sys.add_device(Arc::clone(&dev));
    let sys = Arc::new(sys);

    let orb = Orb { ccw_addr: 1, format1: true, ..Default::default() };
    assert_eq!(channel::start_io(&sys, &dev, 0, orb), 0);
    wait_for_status(&dev);

    let st = dev.lock();
    assert!(st.scsw.chan_status.contains(ChanStat::PROGC));
    assert!(st.scsw.status_control.contains(StatusControl::ALERT));
    assert_eq!(st.scsw.unit_status, UnitStatus::empty());
    drop(st);

    let mut storage = sys.mainstor.lock().unwrap();
    assert_eq!(storage.fetch(0, 8, 0).unwrap(), vec![0u8; 8]);
}

//! Channel Command Words and Indirect Data Address Words (spec §3).

use bitflags::bitflags;

bitflags! {
    /// CCW flag byte (spec §3 "Channel Command Word").
    #[derive(Default)]
    pub struct CcwFlags: u8 {
        const CD   = 0x80; // Chain Data
        const CC   = 0x40; // Chain Command
        const SLI  = 0x20; // Suppress Length Indication
        const SKIP = 0x10; // Skip
        const PCI  = 0x08; // Program-Controlled Interruption
        const IDA  = 0x04; // Indirect Data Addressing
        const SUSP = 0x02; // Suspend
        const RESV = 0x01; // reserved, must be zero
    }
}

/// A decoded CCW, independent of its on-storage format.
#[derive(Debug, Clone, Copy)]
pub struct Ccw {
    pub opcode: u8,
    pub addr: u32,
    pub flags: CcwFlags,
    pub count: u16,
}

pub const TIC_OPCODE: u8 = 0x08;

pub fn is_ccw_tic(opcode: u8) -> bool {
    opcode == TIC_OPCODE
}

/// Opcode classification per the low-order bits, as in the original's
/// `IS_CCW_*` macros.
pub fn is_ccw_write(opcode: u8) -> bool {
    (opcode & 0x03) == 0x01
}

pub fn is_ccw_read(opcode: u8) -> bool {
    (opcode & 0x03) == 0x02
}

pub fn is_ccw_control(opcode: u8) -> bool {
    (opcode & 0x03) == 0x03 && opcode != 0x04 && !is_ccw_tic(opcode)
}

pub fn is_ccw_sense(opcode: u8) -> bool {
    (opcode & 0x0F) == 0x04
}

pub fn is_ccw_rdback(opcode: u8) -> bool {
    (opcode & 0xFF) == 0x0C
}

/// CCW formats: format 0 is the S/370 layout, format 1 is ESA/390.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcwFormat {
    Format0,
    Format1,
}

impl Ccw {
    /// Decode an 8-byte CCW per spec §3.
    pub fn decode(bytes: &[u8; 8], fmt: CcwFormat) -> Ccw {
        match fmt {
            CcwFormat::Format0 => Ccw {
                opcode: bytes[0],
                addr: ((bytes[1] as u32) << 16) | ((bytes[2] as u32) << 8) | bytes[3] as u32,
                flags: CcwFlags::from_bits_truncate(bytes[4]),
                count: ((bytes[6] as u16) << 8) | bytes[7] as u16,
            },
            CcwFormat::Format1 => Ccw {
                opcode: bytes[0],
                flags: CcwFlags::from_bits_truncate(bytes[1]),
                count: ((bytes[2] as u16) << 8) | bytes[3] as u16,
                addr: ((bytes[4] as u32) << 24)
                    | ((bytes[5] as u32) << 16)
                    | ((bytes[6] as u32) << 8)
                    | bytes[7] as u32,
            },
        }
    }
}

/// A decoded Indirect Data Address Word (spec §3 "IDAW"): the address and
/// the number of bytes it covers up to the next 2 KiB boundary.
#[derive(Debug, Clone, Copy)]
pub struct Idaw {
    pub addr: u32,
    pub len_to_boundary: u16,
}

impl Idaw {
    /// Decode a fullword IDAW. `seq` is 0 for the first IDAW in a chain
    /// (which may point anywhere) and >0 for subsequent ones, which must
    /// be 2 KiB-aligned (spec §3).
    pub fn decode(word: u32, seq: usize) -> Result<Idaw, ()> {
        if seq > 0 && (word & 0x7FF) != 0 {
            return Err(());
        }
        let next_page = (word.wrapping_add(0x800)) & 0x7FFF_F800;
        let len = (next_page - word) as u16;
        Ok(Idaw {
            addr: word,
            len_to_boundary: len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_format0() {
        let bytes = [0x02, 0x00, 0x08, 0x00, CcwFlags::CC.bits(), 0, 0, 24];
        let ccw = Ccw::decode(&bytes, CcwFormat::Format0);
        assert_eq!(ccw.opcode, 0x02);
        assert_eq!(ccw.addr, 0x800);
        assert_eq!(ccw.count, 24);
        assert!(ccw.flags.contains(CcwFlags::CC));
    }

    #[test]
    fn decode_format1() {
        let bytes = [0x06, CcwFlags::SLI.bits(), 0x10, 0x00, 0, 0, 0x3A, 0x98];
        let ccw = Ccw::decode(&bytes, CcwFormat::Format1);
        assert_eq!(ccw.opcode, 0x06);
        assert_eq!(ccw.count, 0x1000);
        assert_eq!(ccw.addr, 0x3A98);
    }

    #[test]
    fn idaw_first_unaligned_ok() {
        let idaw = Idaw::decode(0x0000_0123, 0).unwrap();
        assert_eq!(idaw.addr, 0x123);
        assert_eq!(idaw.len_to_boundary, 0x800 - 0x123);
    }

    #[test]
    fn idaw_subsequent_must_be_aligned() {
        assert!(Idaw::decode(0x0000_0800, 1).is_ok());
        assert!(Idaw::decode(0x0000_0801, 1).is_err());
    }

    #[test]
    fn classify_opcodes() {
        assert!(is_ccw_write(0x01));
        assert!(is_ccw_read(0x02));
        assert!(is_ccw_sense(0x04));
        assert!(is_ccw_tic(0x08));
        assert!(is_ccw_rdback(0x0C));
    }
}

extern crate strum;

extern crate packed_struct;
use packed_struct::prelude::*;

use common::*;
use log::{debug, info};

fn flags_of(result: u8, carry: bool) -> u8 {
    let mut flags = Flags::INIT;
    if carry {
        flags.insert(Flags::CARRY);
    }
    if result == 0 {
        flags.insert(Flags::ZERO);
    }
    if result & 0x80 == 0x80 {
        flags.insert(Flags::SIGN);
    }
    flags.bits()
}

pub fn unary(left: u8, right: u8) -> u8 {
    if let Some(m) = BitMove::decode(right) {
        return ((left >> *m.read) & 1) << *m.write;
    }

    match UnaryOp::from_primitive(right) {
        Some(UnaryOp::Shr) => left >> 1,
        Some(UnaryOp::ShrF) => flags_of(left >> 1, left & 1 == 1),
        Some(UnaryOp::Msb) => left & 0x80,
        Some(UnaryOp::BootFlags) => (Flags::ZERO | Flags::SIGN).bits(),
        None => Flags::ZERO.bits(),
    }
}

/// The byte the ALU drives for one operand pair under one operation.
pub fn alu_signals(left: u8, right: u8, op: AluOp) -> u8 {
    match op {
        AluOp::Boot => 0,
        AluOp::Add => left.wrapping_add(right),
        AluOp::AddF => {
            let (sum, carry) = left.overflowing_add(right);
            flags_of(sum, carry)
        }
        AluOp::Nand => !(left & right),
        AluOp::Or => left | right,
        AluOp::Unary => unary(left, right),
        AluOp::Left => left,
        AluOp::Right => right,
    }
}

pub fn alu(print: bool) -> Vec<u8> {
    if print {
        println!("v2.0 raw");
    }
    let mut out_bytes = Vec::with_capacity(ALU_ROM_SIZE);

    for index in 0..ALU_ROM_SIZE as u32 {
        let entry = AluAddress::unpack_lsb(index);
        let out = alu_signals(entry.left, entry.right, entry.op);
        if print {
            println!("# {:05x} {:?}", index, &entry);
            println!("{:02x}", out);
        }
        out_bytes.push(out);
    }

    debug!("built {} alu entries", out_bytes.len());
    out_bytes
}

/// Copies the boot program into the range read through the boot operation.
pub fn embed_boot(alu: &mut [u8], boot: &[u8]) {
    assert!(boot.len() <= BOOT_ROM_SIZE, "boot image is {} bytes", boot.len());
    assert_eq!(ALU_ROM_SIZE, alu.len());

    for i in 0..BOOT_ROM_SIZE {
        let entry = AluAddress {
            left: (i & 0xFF) as u8,
            right: (i >> 8) as u8,
            op: AluOp::Boot,
        };
        alu[entry.to_index()] = boot.get(i).copied().unwrap_or(0);
    }
    info!("embedded {} byte boot image", boot.len());
}

/// Re-derives every entry bit by bit and panics on the first disagreement.
pub fn verify(alu: &[u8]) {
    assert_eq!(ALU_ROM_SIZE, alu.len());

    for index in 0..ALU_ROM_SIZE {
        let op = AluOp::from_primitive((index >> 16) as u8).unwrap();
        let rs = ((index >> 8) & 0xFF) as u16;
        let ls = (index & 0xFF) as u16;
        let q = alu[index] as u16;

        let zf = q & 1;
        let cf = (q >> 1) & 1;
        let sf = (q >> 2) & 1;
        let initf = (q >> 3) & 1;
        let ctx = || format!("{:?} ls:{:02x} rs:{:02x} q:{:02x}", op, ls, rs, q);

        match op {
            AluOp::Boot => {}
            AluOp::Add => assert_eq!((ls + rs) & 0xFF, q, "{}", ctx()),
            AluOp::AddF => {
                let sum = ls + rs;
                assert_eq!(0, q >> 4, "{}", ctx());
                assert_eq!((sum > 0xFF) as u16, cf, "{}", ctx());
                assert_eq!((sum & 0xFF == 0) as u16, zf, "{}", ctx());
                assert_eq!((sum >> 7) & 1, sf, "{}", ctx());
                assert_eq!(1, initf, "{}", ctx());
            }
            AluOp::Nand => assert_eq!(!(ls & rs) & 0xFF, q, "{}", ctx()),
            AluOp::Or => assert_eq!(ls | rs, q, "{}", ctx()),
            AluOp::Unary => match rs {
                0xFC => assert_eq!(ls >> 1, q, "{}", ctx()),
                0xFD => {
                    assert_eq!(0, q >> 4, "{}", ctx());
                    assert_eq!(ls & 1, cf, "{}", ctx());
                    assert_eq!((ls >> 1 == 0) as u16, zf, "{}", ctx());
                    assert_eq!(0, sf, "{}", ctx());
                    assert_eq!(1, initf, "{}", ctx());
                }
                0xFE => assert_eq!(ls & 0x80, q, "{}", ctx()),
                0x10 => assert_eq!((1, 0, 1, 0), (zf, cf, sf, initf), "{}", ctx()),
                0x40..=0x7F => {
                    let write = (rs >> 3) & 7;
                    let read = rs & 7;
                    assert_eq!(((ls >> read) & 1) << write, q, "{}", ctx());
                }
                _ => assert_eq!((1, 0), (zf, initf), "{}", ctx()),
            },
            AluOp::Left => assert_eq!(ls, q, "{}", ctx()),
            AluOp::Right => assert_eq!(rs, q, "{}", ctx()),
        }
    }
}

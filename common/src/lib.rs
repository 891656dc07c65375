extern crate strum;
#[macro_use]
extern crate strum_macros;

extern crate packed_struct;
extern crate packed_struct_codegen;
use packed_struct::prelude::*;

#[macro_use]
extern crate bitflags;

bitflags! {
    /// The flag nibble. INIT separates the power-on regime from normal execution.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Flags: u8 {
        const ZERO = 0b0001;
        const CARRY = 0b0010;
        const SIGN = 0b0100;
        const INIT = 0b1000;
    }
}

bitflags! {
    /// One control word: the sixteen lines driven by the sequencer ROM pair.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Signals: u16 {
        const LD_MH = 1 << 0;
        const LD_ML = 1 << 1;
        const INC_M = 1 << 2;
        const OE_MEM = 1 << 3;
        const OE_T = 1 << 4;
        const OE_IO = 1 << 5;
        const LD_T = 1 << 6;
        const LD_MEM = 1 << 7;
        const LD_F = 1 << 8;
        const OE_C = 1 << 9;
        const OE_ALU = 1 << 10;
        const LD_C = 1 << 11;
        const S_C0 = 1 << 12;
        const S_C1 = 1 << 13;
        const S_C2 = 1 << 14;
        const SEL_C = 1 << 15;
    }
}

impl Signals {
    pub const SEL_M: Signals = Signals::empty();

    // pseudo loads, only decoded while LD_C is clear
    pub const LD_O: Signals = Signals::S_C0;
    pub const LD_S: Signals = Signals::S_C1;
    pub const LD_IO: Signals = Signals::S_C2;

    pub const IDLE: Signals = Signals::OE_C;
    pub const FETCH: Signals = Signals::OE_MEM.union(Signals::LD_O).union(Signals::INC_M);

    pub const OUTPUT_ENABLES: Signals = Signals::OE_MEM
        .union(Signals::OE_T)
        .union(Signals::OE_IO)
        .union(Signals::OE_C)
        .union(Signals::OE_ALU);

    /// Lines that are inverted between the logical word and the ROM contents.
    pub const ACTIVE_LOW: Signals = Signals::LD_C
        .union(Signals::LD_F)
        .union(Signals::LD_MEM)
        .union(Signals::LD_ML)
        .union(Signals::LD_MH)
        .union(Signals::OE_ALU)
        .union(Signals::OE_C)
        .union(Signals::OE_MEM)
        .union(Signals::OE_T);

    pub const fn select(c: u8) -> Signals {
        Signals::from_bits_retain(((c & 7) as u16) << 12)
    }

    pub const fn oe_io_port(port: u8) -> Signals {
        Signals::from_bits_retain(((1u16 << port) & 0xf) << 12)
    }

    pub const fn ld_io_port(port: u8) -> Signals {
        Signals::from_bits_retain((!(1u16 << port) & 0xf) << 12)
    }

    pub fn select_bits(self) -> u8 {
        ((self.bits() >> 12) & 7) as u8
    }

    pub fn loads_o(self) -> bool {
        !self.contains(Signals::LD_C) && self.contains(Signals::LD_O)
    }

    pub fn loads_s(self) -> bool {
        !self.contains(Signals::LD_C) && self.contains(Signals::LD_S)
    }

    pub fn loads_io(self) -> bool {
        !self.contains(Signals::LD_C) && self.contains(Signals::LD_IO)
    }

    pub fn output_count(self) -> u32 {
        self.intersection(Signals::OUTPUT_ENABLES).bits().count_ones()
    }

    /// The word as stored in the ROM pair.
    pub fn to_rom(self) -> u16 {
        (self ^ Signals::ACTIVE_LOW).bits()
    }

    pub fn from_rom(word: u16) -> Signals {
        Signals::from_bits_retain(word) ^ Signals::ACTIVE_LOW
    }
}

fn separate(f: &mut std::fmt::Formatter<'_>, first: &mut bool) -> std::fmt::Result {
    if !*first {
        f.write_str(" | ")?;
    }
    *first = false;
    Ok(())
}

impl std::fmt::Display for Signals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (name, line) in [
            ("OE_MEM", Signals::OE_MEM),
            ("OE_T", Signals::OE_T),
            ("OE_IO", Signals::OE_IO),
            ("OE_C", Signals::OE_C),
            ("OE_ALU", Signals::OE_ALU),
        ] {
            if self.contains(line) {
                separate(f, &mut first)?;
                f.write_str(name)?;
            }
        }
        for (name, loaded) in [("LD_O", self.loads_o()), ("LD_S", self.loads_s()), ("LD_IO", self.loads_io())] {
            if loaded {
                separate(f, &mut first)?;
                f.write_str(name)?;
            }
        }
        for (name, line) in [
            ("LD_MH", Signals::LD_MH),
            ("LD_ML", Signals::LD_ML),
            ("LD_T", Signals::LD_T),
            ("LD_MEM", Signals::LD_MEM),
            ("LD_F", Signals::LD_F),
        ] {
            if self.contains(line) {
                separate(f, &mut first)?;
                f.write_str(name)?;
            }
        }
        if self.contains(Signals::LD_C) {
            let c = self.select_bits();
            separate(f, &mut first)?;
            if self.contains(Signals::SEL_C) {
                f.write_str("C_")?;
                if let Some(reg) = Reg::from_primitive(c) {
                    let name: &'static str = reg.into();
                    for ch in name.chars() {
                        write!(f, "{}", ch.to_ascii_uppercase())?;
                    }
                }
                separate(f, &mut first)?;
                f.write_str("SEL_C")?;
            } else {
                write!(f, "C_{}", c)?;
                separate(f, &mut first)?;
                f.write_str("SEL_M")?;
            }
            separate(f, &mut first)?;
            f.write_str("LD_C")?;
        }
        if self.contains(Signals::INC_M) {
            separate(f, &mut first)?;
            f.write_str("INC_M")?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Display, Debug, PartialEq)]
#[derive(EnumCount, EnumIter, EnumString)]
#[derive(PrimitiveEnum_u8)]
#[strum(serialize_all = "lowercase")]
pub enum AluOp {
    Boot = 0,
    Add = 1,
    AddF = 2,
    Nand = 3,
    Or = 4,
    Unary = 5,
    Left = 6,
    Right = 7,
}

/// Right operand values selecting a function of the unary family.
#[derive(Clone, Copy, Display, Debug, PartialEq)]
#[derive(EnumCount, EnumIter, EnumString)]
#[derive(PrimitiveEnum_u8)]
#[strum(serialize_all = "lowercase")]
pub enum UnaryOp {
    BootFlags = 0x10,
    Shr = 0xFC,
    ShrF = 0xFD,
    Msb = 0xFE,
}

/// Right operand of a unary crossbar lookup: copies bit `read` of the left
/// operand to bit `write` of the result.
#[derive(Debug, PackedStruct)]
#[packed_struct(size_bytes = "1", endian = "lsb", bit_numbering = "lsb0")]
pub struct BitMove {
    #[packed_field(bits = "0..=2")]
    pub read: Integer<u8, packed_bits::Bits::<3>>,
    #[packed_field(bits = "3..=5")]
    pub write: Integer<u8, packed_bits::Bits::<3>>,
    #[packed_field(bits = "6..=7")]
    pub tag: Integer<u8, packed_bits::Bits::<2>>,
}

impl BitMove {
    pub const TAG: u8 = 1;

    pub fn new(write: u8, read: u8) -> BitMove {
        BitMove {
            read: (read & 7).into(),
            write: (write & 7).into(),
            tag: BitMove::TAG.into(),
        }
    }

    pub fn selector(&self) -> u8 {
        self.pack().unwrap()[0]
    }

    pub fn decode(selector: u8) -> Option<BitMove> {
        let m = BitMove::unpack(&[selector]).unwrap();
        if *m.tag == BitMove::TAG {
            Some(m)
        } else {
            None
        }
    }
}

#[derive(Clone, Copy, Display, Debug, PartialEq, Eq, Hash)]
#[derive(EnumCount, EnumIter, EnumString, IntoStaticStr)]
#[derive(PrimitiveEnum_u8)]
#[strum(serialize_all = "lowercase")]
pub enum Reg {
    A = 0,
    B = 1,
    C = 2,
    D = 3,
    E = 4,
    T = 5,
    TMl = 6,
    TMh = 7,
}

pub const REG_PAGE: u16 = 0xFFF0;
pub const STACK_POINTER: u16 = 0xFFFF;

impl Reg {
    pub fn address(&self) -> u16 {
        REG_PAGE | (*self as u16)
    }
}

#[derive(Clone, Copy, Display, Debug, PartialEq, Eq, Hash)]
#[derive(EnumCount, EnumIter, EnumString)]
#[derive(PrimitiveEnum_u8)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Opcode {
    Nop = 0x00,
    InA0 = 0x01,
    InA1 = 0x02,
    InA2 = 0x03,
    InA3 = 0x04,
    Out0A = 0x05,
    Out1A = 0x06,
    Out2A = 0x07,
    Out3A = 0x08,
    Out0I8 = 0x09,
    Out1I8 = 0x0A,
    Out2I8 = 0x0B,
    Out3I8 = 0x0C,
    LdAI8 = 0x0D,
    LdBI8 = 0x0E,
    LdCI8 = 0x0F,
    LdDI8 = 0x10,
    LdEI8 = 0x11,
    LdTI8 = 0x12,
    LdACf = 0x13,
    LdAB = 0x14,
    LdAD = 0x15,
    LdBA = 0x16,
    LdBC = 0x17,
    LdDA = 0x18,
    LdEA = 0x19,
    LdAtBcA = 0x1A,
    LdAtBcE = 0x1B,
    JmpI16 = 0x1C,
    JzI16 = 0x1D,
    JnzI16 = 0x1E,
    JcI16 = 0x1F,
    JncI16 = 0x20,
    JsI16 = 0x21,
    DecA = 0x22,
    DecB = 0x23,
    DecC = 0x24,
    DecD = 0x25,
    DecE = 0x26,
    DeccD = 0x27,
    IncA = 0x28,
    IncB = 0x29,
    IncC = 0x2A,
    IncD = 0x2B,
    InccB = 0x2C,
    ShlA = 0x2D,
    ShlB = 0x2E,
    ShrA = 0x2F,
    ShrB = 0x30,
    AndAI8 = 0x31,
    OrAI8 = 0x32,
    OrACf = 0x33,
    AddBA = 0x34,
    AddcBI8 = 0x35,
    AddcDI8 = 0x36,
    PushA = 0x37,
    PushB = 0x38,
    PushC = 0x39,
    PushD = 0x3A,
    PushE = 0x3B,
    PopA = 0x3C,
    PopB = 0x3D,
    PopC = 0x3E,
    PopD = 0x3F,
    PopE = 0x40,
    CallI16Begin = 0x41,
    CallI16End = 0x42,
    Ret = 0x43,
    Nop2 = 0x44,
    LdAWbitBRbitEnd = 0x45,
    LdBWbitARbitEnd = 0x46,
    LdBAtDeInc = 0x47,
    LdCAtDeInc = 0x48,
    LdBcI16 = 0x49,
    LdDeI16 = 0x4A,
    LdAtDeIncA = 0x4B,
    LdAtDeA = 0x4C,
    LdAAtI16 = 0x4D,
    LdBAtI16 = 0x4E,
    LdAtI16A = 0x4F,
    LdAtI16B = 0x50,
    JbeI16 = 0x51,
    JaeI16 = 0x52,
    LdFA = 0x53,
    LdAF = 0x54,
    TestA = 0x55,
    AndAB = 0x56,
    OrAB = 0x57,
    ShlcA = 0x58,
    DbgTrap = 0x59,
    DbgSkip = 0x5A,
}

impl Opcode {
    /// Instruction length in bytes, opcode included.
    pub fn len(&self) -> u16 {
        match self {
            Opcode::Out0I8 | Opcode::Out1I8 | Opcode::Out2I8 | Opcode::Out3I8 => 2,
            Opcode::LdAI8 | Opcode::LdBI8 | Opcode::LdCI8 | Opcode::LdDI8 | Opcode::LdEI8 | Opcode::LdTI8 => 2,
            Opcode::AndAI8 | Opcode::OrAI8 | Opcode::AddcBI8 | Opcode::AddcDI8 => 2,
            Opcode::LdAWbitBRbitEnd | Opcode::LdBWbitARbitEnd => 2,
            Opcode::DbgTrap | Opcode::DbgSkip => 2,
            Opcode::JmpI16 | Opcode::JzI16 | Opcode::JnzI16 | Opcode::JcI16 | Opcode::JncI16 | Opcode::JsI16 => 3,
            Opcode::JbeI16 | Opcode::JaeI16 => 3,
            Opcode::LdBcI16 | Opcode::LdDeI16 | Opcode::CallI16Begin => 3,
            Opcode::LdAAtI16 | Opcode::LdBAtI16 | Opcode::LdAtI16A | Opcode::LdAtI16B => 3,
            _ => 1,
        }
    }
}

pub const ALU_ROM_BITS: u32 = 19;
pub const ALU_ROM_SIZE: usize = 1 << ALU_ROM_BITS;
pub const CONTROL_ROM_BITS: u32 = 17;
pub const CONTROL_ROM_SIZE: usize = 1 << CONTROL_ROM_BITS;
pub const CONTROL_HALF_SIZE: usize = CONTROL_ROM_SIZE / 2;
pub const BOOT_ROM_SIZE: usize = 0x1000;
pub const PROGRAM_START: u16 = 0x1000;
pub const MEMORY_SIZE: usize = 0x10000;
pub const MICROSTEPS: u8 = 16;

#[derive(Debug, PackedStruct)]
#[packed_struct(size_bytes = "3", endian = "lsb", bit_numbering = "lsb0")]
pub struct AluAddress {
    #[packed_field(bits = "0..=7")]
    pub left: u8,
    #[packed_field(bits = "8..=15")]
    pub right: u8,
    #[packed_field(bits = "16..=18", ty = "enum")]
    pub op: AluOp,
}

impl AluAddress {
    pub fn pack_lsb(&self) -> [u8; 3] {
        let bytes = self.pack().unwrap();
        [bytes[2], bytes[1], bytes[0]]
    }

    pub fn to_index(&self) -> usize {
        let b = self.pack_lsb();
        u32::from_le_bytes([b[0], b[1], b[2], 0]) as usize
    }

    pub fn unpack_lsb(index: u32) -> AluAddress {
        let bytes = index.to_le_bytes();
        assert_eq!(0, bytes[3]);
        let bytes = [bytes[2], bytes[1], bytes[0]];
        AluAddress::unpack(&bytes).unwrap()
    }
}

/// Address into the control ROM pair. `high` picks the chip holding the
/// upper byte of the word.
#[derive(Debug, PackedStruct)]
#[packed_struct(size_bytes = "3", endian = "lsb", bit_numbering = "lsb0")]
pub struct ControlAddress {
    #[packed_field(bits = "0..=7")]
    pub opcode: u8,
    #[packed_field(bits = "8..=11")]
    pub step: Integer<u8, packed_bits::Bits::<4>>,
    #[packed_field(bits = "12..=15")]
    pub flags: Integer<u8, packed_bits::Bits::<4>>,
    #[packed_field(bits = "16")]
    pub high: bool,
}

impl ControlAddress {
    pub fn new(opcode: u8, step: u8, flags: Flags, high: bool) -> ControlAddress {
        ControlAddress {
            opcode,
            step: (step & 0xF).into(),
            flags: flags.bits().into(),
            high,
        }
    }

    pub fn pack_lsb(&self) -> [u8; 3] {
        let bytes = self.pack().unwrap();
        [bytes[2], bytes[1], bytes[0]]
    }

    pub fn to_index(&self) -> usize {
        let b = self.pack_lsb();
        u32::from_le_bytes([b[0], b[1], b[2], 0]) as usize
    }

    pub fn unpack_lsb(index: u32) -> ControlAddress {
        let bytes = index.to_le_bytes();
        assert_eq!(0, bytes[3]);
        let bytes = [bytes[2], bytes[1], bytes[0]];
        ControlAddress::unpack(&bytes).unwrap()
    }

    pub fn flags(&self) -> Flags {
        Flags::from_bits_truncate(*self.flags)
    }
}

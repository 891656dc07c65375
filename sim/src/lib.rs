extern crate packed_struct;
use packed_struct::prelude::*;

use std::fmt::Debug;

use itertools::Itertools;
use log::trace;
use strum::IntoEnumIterator;

use common::*;
use rom::RomImages;

pub mod bridge;

const BUS_DEFAULT: u8 = 0xAB;

const GPO_TX: u8 = 0x01;
const GPO_CTS: u8 = 0x02;
const GPI_RX: u8 = 0x80;

const UART_PORT: u8 = 3;
const TX_FRAME_BITS: u8 = 9;
const RX_FRAME_BITS: u8 = 11;
const RX_MAX_TRIES: u8 = 6;

/// Everything the hardware latches. M doubles as the program counter
/// between instructions.
#[derive(Clone, PartialEq)]
pub struct State {
    pub o: u8,
    pub s: u8,
    pub flags: Flags,
    pub c: u8,
    pub t: u8,
    pub ml: u8,
    pub mh: u8,
    pub mem: Vec<u8>,
    pub gpo: u8,
    pub tx: u8,
    pub tx_bits: u8,
    pub rx: u8,
    pub rx_bits: u8,
    pub rx_tries: u8,
}

impl Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s:{:x}", self.s)?;
        write!(f, " o:{:02x}", self.o)?;
        if let Some(opcode) = Opcode::from_primitive(self.o) {
            write!(f, "({:?})", opcode)?;
        }
        write!(f, " pc:{:04x}", self.pc())?;
        write!(f, " c:{:x}", self.c)?;
        write!(f, " t:{:02x}", self.t)?;
        write!(f, " flags:[{:?}]", self.flags)?;
        write!(
            f,
            " {}",
            Reg::iter().format_with(" ", |r, f| f(&format_args!("{}:{:02x}", r, self.reg(r))))
        )?;
        write!(f, " sp:{:02x}", self.stack_pointer())?;
        write!(f, " gpo:{:02x}", self.gpo)?;
        Ok(())
    }
}

impl Default for State {
    fn default() -> Self {
        State::new()
    }
}

impl State {
    /// Power-on state: everything zero, so the sequencer starts in the reset regime.
    pub fn new() -> State {
        State {
            o: 0,
            s: 0,
            flags: Flags::empty(),
            c: 0,
            t: 0,
            ml: 0,
            mh: 0,
            mem: vec![0u8; MEMORY_SIZE],
            gpo: 0,
            tx: 0,
            tx_bits: 0,
            rx: 0,
            rx_bits: 0,
            rx_tries: 0,
        }
    }

    /// A state already past power-on with `program` at address 0.
    pub fn with_program(program: &[u8]) -> State {
        let mut state = State::new();
        state.flags = Flags::INIT;
        state.load(0, program);
        state
    }

    pub fn load(&mut self, address: u16, bytes: &[u8]) {
        let start = address as usize;
        self.mem[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn pc(&self) -> u16 {
        u16::from_be_bytes([self.mh, self.ml])
    }

    pub fn set_pc(&mut self, pc: u16) {
        [self.mh, self.ml] = pc.to_be_bytes();
    }

    pub fn reg(&self, r: Reg) -> u8 {
        self.mem[r.address() as usize]
    }

    pub fn set_reg(&mut self, r: Reg, value: u8) {
        self.mem[r.address() as usize] = value;
    }

    pub fn stack_pointer(&self) -> u8 {
        self.mem[STACK_POINTER as usize]
    }

    /// The transmitted byte, once a start bit and 8 data bits were sampled.
    pub fn take_tx(&mut self) -> Option<u8> {
        if self.tx_bits == TX_FRAME_BITS {
            self.tx_bits = 0;
            Some(self.tx)
        } else {
            None
        }
    }

    /// True at an instruction boundary when the next instruction polls the UART.
    pub fn can_receive(&self) -> bool {
        self.rx_bits == 0 && self.mem[self.pc() as usize] == Opcode::InA3 as u8
    }

    pub fn receive(&mut self, byte: u8) {
        self.rx = byte;
        self.rx_bits = 1;
    }

    /// Code of a `trap` that just completed. Only meaningful at an instruction boundary.
    pub fn trap_code(&self) -> Option<u8> {
        if self.o == Opcode::DbgTrap as u8 {
            Some(self.mem[self.pc().wrapping_sub(1) as usize])
        } else {
            None
        }
    }

    fn read_io(&mut self, signals: Signals) -> u8 {
        let port = (0..4u8).find(|b| self.c & (1 << b) != 0);
        if port != Some(UART_PORT) {
            panic!("input port {:?} not supported, {} {:?}", port, signals, self);
        }

        if self.rx_bits == 0 {
            if self.gpo & GPO_CTS != 0 {
                self.rx_tries = self.rx_tries.wrapping_add(1);
            }
            GPI_RX
        } else if self.rx_tries < RX_MAX_TRIES {
            let bit = if self.rx_bits == 1 {
                0
            } else {
                ((self.rx as u16) >> (self.rx_bits - 2)) as u8 & 1
            };
            self.rx_bits += 1;
            if self.rx_bits == RX_FRAME_BITS {
                self.rx_bits = 0;
                self.rx_tries = 0;
            }
            bit << 7
        } else {
            BUS_DEFAULT
        }
    }

    fn write_io(&mut self, signals: Signals, bus: u8) {
        let port = (0..4u8).find(|b| self.c & (1 << b) == 0);
        if port != Some(UART_PORT) {
            panic!("output port {:?} not supported, {} {:?}", port, signals, self);
        }

        let tx_bit = bus & GPO_TX;
        if self.tx_bits == 0 {
            if tx_bit == 0 {
                self.tx_bits = 1;
                self.tx = 0;
            }
        } else if self.tx_bits < TX_FRAME_BITS {
            self.tx |= tx_bit << (self.tx_bits - 1);
            self.tx_bits += 1;
        }

        self.gpo = bus;
        if self.gpo & GPO_CTS != 0 {
            self.rx_tries = 0;
        }
    }
}

/// Low half index of the control word for the current flags, step and opcode.
fn control_address(state: &State) -> usize {
    ((state.flags.bits() as usize) << 12) | ((state.s as usize) << 8) | state.o as usize
}

/// Advances one clock. Returns true when this cycle finished an instruction.
pub fn step(control: &[u8], alu: &[u8], state: &mut State) -> bool {
    let address = control_address(state);
    let signals = Signals::from_rom(u16::from_le_bytes([control[address], control[address + CONTROL_HALF_SIZE]]));
    trace!("{:?} {}", state, signals);

    let c = state.c;
    let mem_address = if c & 8 != 0 {
        (REG_PAGE | (c & 7) as u16) as usize
    } else {
        state.pc() as usize
    };
    let alu_address = ((c as usize & 7) << 16) | ((state.mh as usize) << 8) | state.ml as usize;

    let drivers = signals.output_count();
    if drivers != 1 {
        panic!("{} bus drivers: {} {:?}", drivers, signals, state);
    }

    let bus = if signals.contains(Signals::OE_MEM) {
        state.mem[mem_address]
    } else if signals.contains(Signals::OE_T) {
        state.t
    } else if signals.contains(Signals::OE_C) {
        (0xF8 * ((c >> 2) & 1)) | (c & 7)
    } else if signals.contains(Signals::OE_ALU) {
        alu[alu_address]
    } else {
        state.read_io(signals)
    };

    if signals.loads_io() {
        state.write_io(signals, bus);
    }
    if signals.loads_o() {
        state.o = bus;
    }
    if signals.contains(Signals::LD_ML) {
        state.ml = bus;
    }
    if signals.contains(Signals::LD_MH) {
        state.mh = bus;
    }
    if signals.contains(Signals::LD_T) {
        state.t = bus;
    }
    if signals.contains(Signals::LD_MEM) {
        state.mem[mem_address] = bus;
    }
    if signals.contains(Signals::LD_F) {
        state.flags = Flags::from_bits_truncate(bus);
    }
    if signals.contains(Signals::LD_C) {
        state.c = if signals.contains(Signals::SEL_C) { 8 } else { 0 } | signals.select_bits();
    }

    if signals.contains(Signals::INC_M) && !signals.contains(Signals::LD_ML) {
        state.ml = state.ml.wrapping_add(1);
        if state.ml == 0 && !signals.contains(Signals::LD_MH) {
            state.mh = state.mh.wrapping_add(1);
        }
    }

    if signals.loads_s() {
        state.s = 0;
        true
    } else {
        state.s += 1;
        if state.s >= MICROSTEPS {
            state.s = 0;
            true
        } else {
            false
        }
    }
}

#[derive(Clone, Copy)]
pub struct Images<'a> {
    pub control: &'a [u8],
    pub alu: &'a [u8],
}

impl<'a> From<&'a RomImages> for Images<'a> {
    fn from(images: &'a RomImages) -> Images<'a> {
        Images::new(&images.control, &images.alu)
    }
}

impl<'a> Images<'a> {
    pub fn new(control: &'a [u8], alu: &'a [u8]) -> Images<'a> {
        assert_eq!(CONTROL_ROM_SIZE, control.len());
        assert_eq!(ALU_ROM_SIZE, alu.len());
        Images { control, alu }
    }

    pub fn step(&self, state: &mut State) -> bool {
        step(self.control, self.alu, state)
    }

    /// Steps to the end of the current instruction and returns the cycles taken.
    pub fn run_instruction(&self, state: &mut State) -> u8 {
        let mut cycles = 1;
        while !self.step(state) {
            cycles += 1;
        }
        cycles
    }

    /// Runs the power-on sequence until INIT is set.
    pub fn run_until_init(&self, state: &mut State) -> usize {
        let mut cycles = 0;
        while !state.flags.contains(Flags::INIT) {
            self.step(state);
            cycles += 1;
        }
        cycles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    use lazy_static::lazy_static;
    lazy_static! {
        static ref BOOT: Vec<u8> = vec![
            Opcode::LdAI8 as u8, 0x42,
            Opcode::JmpI16 as u8, 0x00, 0x02,
        ];
        static ref IMAGES: RomImages = RomImages::build(&BOOT).unwrap();
    }

    fn images() -> Images<'static> {
        Images::from(&*IMAGES)
    }

    fn machine(program: &[u8]) -> State {
        let mut state = State::with_program(program);
        for r in Reg::iter() {
            state.set_reg(r, r as u8);
        }
        state
    }

    fn run(state: &mut State, instructions: usize) {
        for _ in 0..instructions {
            images().run_instruction(state);
        }
    }

    #[test]
    fn control_address_layout() {
        let mut state = machine(&[]);
        state.o = Opcode::ShlA as u8;
        state.s = 3;
        state.flags = Flags::INIT | Flags::SIGN;
        let low = ControlAddress::new(state.o, state.s, state.flags, false);
        let high = ControlAddress::new(state.o, state.s, state.flags, true);
        assert_eq!(low.to_index(), control_address(&state));
        assert_eq!(high.to_index(), control_address(&state) + CONTROL_HALF_SIZE);
    }

    #[test]
    fn nop() {
        let mut state = machine(&[Opcode::Nop as u8]);
        let before = state.clone();

        assert_eq!(16, images().run_instruction(&mut state));
        assert_eq!(1, state.pc());
        assert_eq!(before.flags, state.flags);
        assert_eq!(before.c, state.c);
        assert_eq!(before.t, state.t);
        assert_eq!(before.mem, state.mem);
    }

    #[test]
    fn inc() {
        for (r, opcode) in [
            (Reg::A, Opcode::IncA),
            (Reg::B, Opcode::IncB),
            (Reg::C, Opcode::IncC),
            (Reg::D, Opcode::IncD),
        ] {
            let mut state = machine(&[]);
            for v in 0..=255u8 {
                let pc = state.pc();
                state.mem[pc as usize] = opcode as u8;
                state.set_reg(r, v);

                assert_eq!(13, images().run_instruction(&mut state), "{:?} {:02x}", opcode, v);

                let result = v.wrapping_add(1);
                assert_eq!(result, state.reg(r));
                assert_eq!(pc + 1, state.pc());
                assert!(state.flags.contains(Flags::INIT));
                assert_eq!(result == 0, state.flags.contains(Flags::ZERO));
                assert_eq!(result == 0, state.flags.contains(Flags::CARRY));
                assert_eq!(result & 0x80 != 0, state.flags.contains(Flags::SIGN));
            }
        }
    }

    #[test]
    fn dec() {
        let mut state = machine(&[Opcode::DecE as u8, Opcode::DecE as u8]);
        state.set_reg(Reg::E, 1);
        run(&mut state, 1);
        assert_eq!(0, state.reg(Reg::E));
        assert_eq!(Flags::INIT | Flags::ZERO | Flags::CARRY, state.flags);
        run(&mut state, 1);
        assert_eq!(0xFF, state.reg(Reg::E));
        assert_eq!(Flags::INIT | Flags::SIGN, state.flags);
    }

    #[test]
    fn carry_chain() {
        let conditional = |opcode: Opcode, r: Reg, flags: Flags| {
            let mut state = machine(&[opcode as u8]);
            state.set_reg(r, 0x10);
            state.flags = flags;
            assert_eq!(12, images().run_instruction(&mut state));
            (state.reg(r), state.flags)
        };

        let init = Flags::INIT;
        let carry = Flags::INIT | Flags::CARRY;
        assert_eq!((0x10, init), conditional(Opcode::InccB, Reg::B, init));
        assert_eq!((0x11, init), conditional(Opcode::InccB, Reg::B, carry));
        assert_eq!((0x10, carry), conditional(Opcode::DeccD, Reg::D, carry));
        assert_eq!((0x0F, carry), conditional(Opcode::DeccD, Reg::D, init));
    }

    #[test]
    fn out_immediate() {
        let mut state = machine(&[Opcode::Out3I8 as u8, 0xBA]);
        run(&mut state, 1);
        assert_eq!(2, state.pc());
        assert_eq!(0xBA, state.gpo);
    }

    #[test]
    fn immediates_and_moves() {
        let mut state = machine(&[
            Opcode::LdAI8 as u8, 0x12,
            Opcode::LdDeI16 as u8, 0x34, 0x56,
            Opcode::LdBA as u8,
            Opcode::LdEA as u8,
            Opcode::LdAD as u8,
        ]);
        run(&mut state, 5);
        assert_eq!(8, state.pc());
        assert_eq!(0x34, state.reg(Reg::A));
        assert_eq!(0x12, state.reg(Reg::B));
        assert_eq!(0x34, state.reg(Reg::D));
        assert_eq!(0x12, state.reg(Reg::E));
    }

    #[test]
    fn carry_into_a() {
        let mut state = machine(&[Opcode::LdACf as u8, Opcode::LdACf as u8]);
        state.flags = Flags::INIT | Flags::CARRY;
        run(&mut state, 1);
        assert_eq!(1, state.reg(Reg::A));
        state.flags = Flags::INIT;
        run(&mut state, 1);
        assert_eq!(0, state.reg(Reg::A));
    }

    #[test]
    fn flag_round_trip() {
        for v in 0..16u8 {
            let mut state = machine(&[Opcode::LdFA as u8, Opcode::LdAF as u8]);
            state.set_reg(Reg::A, v);
            run(&mut state, 1);
            assert_eq!(v | Flags::INIT.bits(), state.flags.bits());
            state.set_reg(Reg::A, 0x55);
            run(&mut state, 1);
            assert_eq!(v | Flags::INIT.bits(), state.reg(Reg::A));
            assert_eq!(state.flags.bits(), state.reg(Reg::A));
            assert_eq!(2, state.pc());
        }
    }

    #[test]
    fn logic() {
        let mut state = machine(&[
            Opcode::LdAI8 as u8, 0xF0,
            Opcode::AndAI8 as u8, 0x3C,
            Opcode::OrAI8 as u8, 0x01,
            Opcode::AndAB as u8,
        ]);
        state.set_reg(Reg::B, 0x0F);
        run(&mut state, 2);
        assert_eq!(0x30, state.reg(Reg::A));
        assert_eq!(Flags::INIT, state.flags);
        run(&mut state, 1);
        assert_eq!(0x31, state.reg(Reg::A));
        run(&mut state, 1);
        assert_eq!(0x01, state.reg(Reg::A));
        assert_eq!(7, state.pc());

        let mut state = machine(&[Opcode::OrAB as u8, Opcode::TestA as u8]);
        state.set_reg(Reg::A, 0x80);
        state.set_reg(Reg::B, 0x01);
        run(&mut state, 1);
        assert_eq!(0x81, state.reg(Reg::A));
        assert_eq!(Flags::INIT | Flags::SIGN, state.flags);
        state.set_reg(Reg::A, 0);
        run(&mut state, 1);
        assert_eq!(Flags::INIT | Flags::ZERO, state.flags);
    }

    #[test]
    fn or_carry_flags_follow_result() {
        let mut state = machine(&[Opcode::OrACf as u8]);
        state.set_reg(Reg::A, 0);
        state.flags = Flags::INIT | Flags::CARRY;
        run(&mut state, 1);
        assert_eq!(1, state.reg(Reg::A));
        assert_eq!(Flags::INIT, state.flags);
    }

    #[test]
    fn adds() {
        let mut state = machine(&[
            Opcode::AddBA as u8,
            Opcode::AddcDI8 as u8, 0x01,
        ]);
        state.set_reg(Reg::A, 0x90);
        state.set_reg(Reg::B, 0x80);
        state.set_reg(Reg::D, 0x10);
        run(&mut state, 1);
        assert_eq!(0x10, state.reg(Reg::B));
        assert_eq!(Flags::INIT | Flags::CARRY, state.flags);
        run(&mut state, 1);
        assert_eq!(0x12, state.reg(Reg::D));
        assert_eq!(Flags::INIT, state.flags);
        assert_eq!(3, state.pc());
    }

    #[test]
    fn shifts() {
        let mut state = machine(&[Opcode::ShlA as u8, Opcode::ShrB as u8]);
        state.set_reg(Reg::A, 0x81);
        state.set_reg(Reg::B, 0x03);
        run(&mut state, 1);
        assert_eq!(0x02, state.reg(Reg::A));
        assert_eq!(Flags::INIT | Flags::CARRY, state.flags);
        run(&mut state, 1);
        assert_eq!(0x01, state.reg(Reg::B));
        assert_eq!(Flags::INIT | Flags::CARRY, state.flags);
    }

    #[test]
    fn rotate_through_carry() {
        for (a, carry, result, flags) in [
            (0x81, true, 0x03, Flags::INIT | Flags::CARRY),
            (0x80, false, 0x00, Flags::INIT | Flags::CARRY | Flags::ZERO),
            (0x80, true, 0x01, Flags::INIT | Flags::CARRY),
            (0x40, false, 0x80, Flags::INIT | Flags::SIGN),
        ] {
            let mut state = machine(&[Opcode::ShlcA as u8]);
            state.set_reg(Reg::A, a);
            state.flags = if carry { Flags::INIT | Flags::CARRY } else { Flags::INIT };
            assert_eq!(16, images().run_instruction(&mut state));
            assert_eq!(result, state.reg(Reg::A), "{:02x} {}", a, carry);
            assert_eq!(flags, state.flags, "{:02x} {}", a, carry);
            assert_eq!(1, state.pc());
        }
    }

    #[test]
    fn jumps() {
        let taken = |opcode: Opcode, flags: Flags| {
            let mut state = machine(&[opcode as u8, 0x12, 0x34]);
            state.flags = flags;
            assert_eq!(6, images().run_instruction(&mut state));
            match state.pc() {
                0x1234 => true,
                3 => false,
                pc => panic!("{:?} pc:{:04x}", opcode, pc),
            }
        };

        let init = Flags::INIT;
        assert!(taken(Opcode::JmpI16, init));
        assert!(taken(Opcode::JzI16, init | Flags::ZERO));
        assert!(!taken(Opcode::JzI16, init));
        assert!(taken(Opcode::JnzI16, init));
        assert!(taken(Opcode::JcI16, init | Flags::CARRY));
        assert!(!taken(Opcode::JncI16, init | Flags::CARRY));
        assert!(taken(Opcode::JsI16, init | Flags::SIGN));
        assert!(!taken(Opcode::JsI16, init | Flags::ZERO));

        assert!(taken(Opcode::JbeI16, init));
        assert!(taken(Opcode::JbeI16, init | Flags::ZERO | Flags::CARRY));
        assert!(!taken(Opcode::JbeI16, init | Flags::CARRY));
        assert!(taken(Opcode::JaeI16, init | Flags::CARRY));
        assert!(taken(Opcode::JaeI16, init | Flags::ZERO));
        assert!(!taken(Opcode::JaeI16, init));
    }

    #[test]
    fn memory() {
        let mut state = machine(&[
            Opcode::LdBcI16 as u8, 0x20, 0x00,
            Opcode::LdAtBcE as u8,
            Opcode::LdAtI16A as u8, 0x30, 0x01,
            Opcode::LdBAtI16 as u8, 0x20, 0x00,
            Opcode::LdAAtI16 as u8, 0x40, 0x00,
        ]);
        state.set_reg(Reg::A, 0x5A);
        state.set_reg(Reg::E, 0xE7);
        state.mem[0x4000] = 0x99;
        run(&mut state, 5);
        assert_eq!(0xE7, state.mem[0x2000]);
        assert_eq!(0x5A, state.mem[0x3001]);
        assert_eq!(0xE7, state.reg(Reg::B));
        assert_eq!(0x99, state.reg(Reg::A));
        assert_eq!(13, state.pc());
    }

    #[test]
    fn pointer_increment() {
        let mut state = machine(&[
            Opcode::LdDeI16 as u8, 0x20, 0xFF,
            Opcode::LdAtDeIncA as u8,
            Opcode::LdAtDeA as u8,
            Opcode::LdDeI16 as u8, 0x20, 0xFF,
            Opcode::LdBAtDeInc as u8,
            Opcode::LdCAtDeInc as u8,
        ]);
        state.set_reg(Reg::A, 0x77);
        run(&mut state, 3);
        assert_eq!(0x77, state.mem[0x20FF]);
        assert_eq!(0x77, state.mem[0x2100]);
        assert_eq!((0x21, 0x00), (state.reg(Reg::D), state.reg(Reg::E)));

        state.mem[0x2100] = 0x88;
        run(&mut state, 3);
        assert_eq!(0x77, state.reg(Reg::B));
        assert_eq!(0x88, state.reg(Reg::C));
        assert_eq!((0x21, 0x01), (state.reg(Reg::D), state.reg(Reg::E)));
        assert_eq!(10, state.pc());
    }

    #[test]
    fn stack() {
        let mut state = machine(&[
            Opcode::PushA as u8,
            Opcode::PushE as u8,
            Opcode::PopB as u8,
            Opcode::PopC as u8,
        ]);
        state.set_reg(Reg::A, 0x5A);
        state.set_reg(Reg::E, 0xE5);

        assert_eq!(16, images().run_instruction(&mut state));
        run(&mut state, 1);
        assert_eq!(2, state.stack_pointer());
        assert_eq!([0x5A, 0xE5], state.mem[0xFF00..0xFF02]);

        run(&mut state, 2);
        assert_eq!(0xE5, state.reg(Reg::B));
        assert_eq!(0x5A, state.reg(Reg::C));
        assert_eq!(0, state.stack_pointer());
        assert_eq!(4, state.pc());
    }

    #[test]
    fn call_ret() {
        let mut state = machine(&[
            Opcode::CallI16Begin as u8, 0x00, 0x10,
            Opcode::CallI16End as u8,
            Opcode::Nop2 as u8,
        ]);
        state.mem[0x10] = Opcode::Ret as u8;

        run(&mut state, 2);
        assert_eq!(0x0010, state.pc());
        assert_eq!(2, state.stack_pointer());
        assert_eq!([0x00, 0x04], state.mem[0xFF00..0xFF02]);

        assert_eq!(16, images().run_instruction(&mut state));
        assert_eq!(0x0004, state.pc());
        assert_eq!(0, state.stack_pointer());
    }

    #[test]
    fn bit_move() {
        for (a, b, write, read, result) in [
            (0x00, 0x04, 5, 2, 0x20),
            (0xFF, 0x00, 5, 2, 0xDF),
            (0x81, 0x80, 0, 7, 0x81),
        ] {
            let mut state = machine(&[
                Opcode::LdTI8 as u8, !(1u8 << write),
                Opcode::LdAWbitBRbitEnd as u8, BitMove::new(write, read).selector(),
            ]);
            state.set_reg(Reg::A, a);
            state.set_reg(Reg::B, b);
            run(&mut state, 2);
            assert_eq!(result, state.reg(Reg::A), "a:{:02x} b:{:02x}", a, b);
            assert_eq!(b, state.reg(Reg::B));
            assert_eq!(4, state.pc());
        }
    }

    #[test]
    fn uart_transmit() {
        let byte = 0xA5u8;
        let mut program = vec![Opcode::Out3I8 as u8, GPO_CTS];
        for i in 0..8 {
            program.extend([Opcode::Out3I8 as u8, GPO_CTS | ((byte >> i) & 1)]);
        }
        program.extend([Opcode::Out3I8 as u8, GPO_CTS | GPO_TX]);

        let mut state = machine(&program);
        run(&mut state, 8);
        assert_eq!(None, state.take_tx());
        run(&mut state, 1);
        assert_eq!(Some(byte), state.take_tx());
        assert_eq!(None, state.take_tx());
        run(&mut state, 1);
        assert_eq!(0, state.tx_bits);
    }

    #[test]
    fn uart_receive() {
        let mut state = machine(&[Opcode::InA3 as u8; 12]);
        assert!(state.can_receive());
        run(&mut state, 1);
        assert_eq!(GPI_RX, state.reg(Reg::A));

        state.receive(b'K');
        assert!(!state.can_receive());
        let mut samples = Vec::new();
        for _ in 0..9 {
            run(&mut state, 1);
            samples.push(state.reg(Reg::A));
        }
        assert_eq!(0, samples[0]);
        let byte = samples[1..].iter().enumerate().fold(0u8, |acc, (i, s)| acc | ((s >> 7) << i));
        assert_eq!(b'K', byte);
        assert_eq!(10, state.rx_bits);

        // stop bit reads low, then the frame closes
        state.rx_tries = 3;
        run(&mut state, 1);
        assert_eq!(0, state.reg(Reg::A));
        assert_eq!((0, 0), (state.rx_bits, state.rx_tries));
        assert!(state.can_receive());

        run(&mut state, 1);
        assert_eq!(GPI_RX, state.reg(Reg::A));
        assert_eq!(0, state.rx_bits);
    }

    #[test]
    fn uart_receive_stalls_until_cts() {
        let mut program = vec![Opcode::InA3 as u8; 7];
        program.extend([Opcode::Out3I8 as u8, GPO_CTS, Opcode::InA3 as u8]);
        let mut state = machine(&program);
        state.gpo = GPO_CTS;

        run(&mut state, 6);
        assert_eq!(RX_MAX_TRIES, state.rx_tries);

        state.receive(b'K');
        run(&mut state, 1);
        assert_eq!(BUS_DEFAULT, state.reg(Reg::A));
        assert_eq!(1, state.rx_bits);

        run(&mut state, 1);
        assert_eq!(0, state.rx_tries);

        run(&mut state, 1);
        assert_eq!(0, state.reg(Reg::A));
        assert_eq!(2, state.rx_bits);
    }

    #[test]
    fn idle_poll_count_wraps() {
        let mut state = machine(&[Opcode::InA3 as u8]);
        state.gpo = GPO_CTS;
        state.rx_tries = 0xFF;
        run(&mut state, 1);
        assert_eq!(0, state.rx_tries);

        let mut state = machine(&[Opcode::InA3 as u8]);
        state.rx_tries = 2;
        run(&mut state, 1);
        assert_eq!(2, state.rx_tries);
    }

    #[test]
    fn traps() {
        let mut state = machine(&[Opcode::DbgTrap as u8, 0x42, Opcode::DbgSkip as u8, 0x43]);
        assert_eq!(3, images().run_instruction(&mut state));
        assert_eq!(Some(0x42), state.trap_code());
        run(&mut state, 1);
        assert_eq!(None, state.trap_code());
        assert_eq!(4, state.pc());
    }

    #[test]
    fn emulated_cycles_match_microcode() {
        for opcode in Opcode::iter() {
            if matches!(
                opcode,
                Opcode::InA0 | Opcode::InA1 | Opcode::InA2 | Opcode::Out0A | Opcode::Out1A | Opcode::Out2A | Opcode::Out0I8 | Opcode::Out1I8 | Opcode::Out2I8
            ) {
                continue;
            }
            let mut state = machine(&[opcode as u8]);
            let expected = ucode::microprogram(opcode, state.flags).cycles();
            assert_eq!(expected, images().run_instruction(&mut state), "{:?}", opcode);

            let transfers = matches!(
                opcode,
                Opcode::JmpI16 | Opcode::JzI16 | Opcode::JnzI16 | Opcode::JcI16 | Opcode::JncI16 | Opcode::JsI16 | Opcode::JbeI16 | Opcode::JaeI16 | Opcode::CallI16End | Opcode::Ret
            );
            if !transfers {
                assert_eq!(opcode.len(), state.pc(), "{:?}", opcode);
            }
        }
    }

    #[test]
    #[should_panic(expected = "output port Some(0)")]
    fn unsupported_port() {
        let mut state = machine(&[Opcode::Out0A as u8]);
        run(&mut state, 1);
    }

    #[test]
    #[should_panic(expected = "4 bus drivers")]
    fn contention() {
        let control = vec![0u8; CONTROL_ROM_SIZE];
        let mut state = machine(&[]);
        step(&control, &IMAGES.alu, &mut state);
    }

    #[test]
    #[should_panic(expected = "0 bus drivers")]
    fn floating_bus() {
        let mut state = machine(&[]);
        let mut control = IMAGES.control.clone();
        let [lo, hi] = Signals::LD_T.to_rom().to_le_bytes();
        let address = control_address(&state);
        control[address] = lo;
        control[address + CONTROL_HALF_SIZE] = hi;
        step(&control, &IMAGES.alu, &mut state);
    }

    #[test]
    fn runs_from_program_start() {
        let mut state = machine(&[]);
        state.load(PROGRAM_START, &[Opcode::LdAI8 as u8, 0x5A, Opcode::JmpI16 as u8, 0x00, 0x00]);
        state.set_pc(PROGRAM_START);
        run(&mut state, 1);
        assert_eq!(0x5A, state.reg(Reg::A));
        assert_eq!(PROGRAM_START + 2, state.pc());
        run(&mut state, 1);
        assert_eq!(0, state.pc());
    }

    #[test]
    fn power_on() {
        let mut state = State::new();
        let cycles = images().run_until_init(&mut state);

        assert_eq!(5 + 2047 * 10 + 16, cycles);
        assert_eq!(Flags::INIT | Flags::ZERO, state.flags);
        assert_eq!(0, state.pc());
        assert_eq!(0, state.s);
        assert_eq!(Opcode::Nop as u8, state.o);
        assert_eq!(0, state.stack_pointer());
        assert_eq!(BOOT[..], state.mem[..BOOT.len()]);
        assert!(state.mem[BOOT.len()..0x1000].iter().all(|b| *b == 0));

        run(&mut state, 2);
        assert_eq!(0x42, state.reg(Reg::A));
        assert_eq!(2, state.pc());
    }

    #[test]
    fn deterministic() {
        let program = [Opcode::LdAI8 as u8, 0x7F, Opcode::IncA as u8, Opcode::PushA as u8, Opcode::ShrA as u8];
        let mut first = machine(&program);
        let mut second = machine(&program);
        run(&mut first, 4);
        run(&mut second, 4);
        assert!(first == second);
    }
}

extern crate strum;

use std::borrow::Cow;

use strum::IntoEnumIterator;

extern crate packed_struct;
use packed_struct::prelude::*;

use common::*;

const LD_MH: Signals = Signals::LD_MH;
const LD_ML: Signals = Signals::LD_ML;
const INC_M: Signals = Signals::INC_M;
const OE_MEM: Signals = Signals::OE_MEM;
const OE_T: Signals = Signals::OE_T;
const OE_IO: Signals = Signals::OE_IO;
const LD_T: Signals = Signals::LD_T;
const LD_MEM: Signals = Signals::LD_MEM;
const LD_F: Signals = Signals::LD_F;
const OE_C: Signals = Signals::OE_C;
const OE_ALU: Signals = Signals::OE_ALU;
const LD_C: Signals = Signals::LD_C;
const LD_O: Signals = Signals::LD_O;
const LD_S: Signals = Signals::LD_S;
const LD_IO: Signals = Signals::LD_IO;

/// Anything that can be put on the 3 select lines of C.
pub trait Select: Copy {
    fn code(self) -> u8;
}

impl Select for u8 {
    fn code(self) -> u8 {
        self
    }
}

impl Select for Reg {
    fn code(self) -> u8 {
        self as u8
    }
}

impl Select for AluOp {
    fn code(self) -> u8 {
        self as u8
    }
}

impl Select for UnaryOp {
    fn code(self) -> u8 {
        self as u8
    }
}

/// C = x, memory routed to the register page.
fn c_reg(x: impl Select) -> Signals {
    Signals::select(x.code()) | Signals::SEL_C | LD_C
}

/// C = x, memory routed to M.
fn c_mem(x: impl Select) -> Signals {
    Signals::select(x.code()) | Signals::SEL_M | LD_C
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MicroStep {
    pub signals: Signals,
    pub file: &'static str,
    pub line: u32,
}

/// The control words of one (opcode, flags) slot. Steps past the end are idle.
#[derive(Clone, Debug, Default)]
pub struct Microprogram {
    steps: Vec<MicroStep>,
}

macro_rules! add {
    ($self:expr, $signals:expr) => {
        $self.add_with_source($signals, file!(), line!())
    };
}

impl Microprogram {
    fn empty() -> Microprogram {
        Microprogram { steps: Vec::new() }
    }

    fn instruction() -> Microprogram {
        let mut p = Microprogram::empty();
        add!(p, Signals::FETCH);
        p
    }

    fn add_with_source(&mut self, signals: Signals, file: &'static str, line: u32) {
        assert!(
            self.steps.len() < MICROSTEPS as usize,
            "microprogram exceeds {} steps at {}:{}",
            MICROSTEPS,
            file,
            line
        );
        self.steps.push(MicroStep { signals, file, line });
    }

    pub fn steps(&self) -> &[MicroStep] {
        &self.steps
    }

    pub fn signals(&self, step: u8) -> Signals {
        self.steps
            .get(step as usize)
            .map(|s| s.signals)
            .unwrap_or(Signals::IDLE)
    }

    pub fn source(&self, step: u8) -> Option<(Cow<'static, str>, u32)> {
        self.steps.get(step as usize).map(|s| {
            let file = if s.file.contains('\\') {
                Cow::Owned(s.file.replace('\\', "/"))
            } else {
                Cow::Borrowed(s.file)
            };
            (file, s.line)
        })
    }

    /// Cycles until the instruction completes: the first counter reset, or a full wrap.
    pub fn cycles(&self) -> u8 {
        self.steps
            .iter()
            .position(|s| s.signals.loads_s())
            .map(|i| i as u8 + 1)
            .unwrap_or(MICROSTEPS)
    }

    pub fn print(&self) {
        for step in 0..MICROSTEPS {
            let signals = self.signals(step);
            match self.source(step) {
                Some((file, line)) => {
                    println!("#  step:{:x} word:{:04x} {} source:{}:{}", step, signals.to_rom(), signals, file, line)
                }
                None => println!("#  step:{:x} word:{:04x} {}", step, signals.to_rom(), signals),
            }
        }
    }

    fn done(&mut self) {
        add!(self, OE_C | LD_S);
    }

    /// Parks ML/MH in T_ML/T_MH, leaving C as `then`.
    fn save(&mut self, then: Signals) {
        add!(self, OE_ALU | c_reg(Reg::TMl));
        self.save_from_t_ml(then);
    }

    /// Same as `save`, also latching the next program byte into T.
    fn save_with_immediate(&mut self, then: Signals) {
        add!(self, OE_MEM | LD_T | c_reg(Reg::TMl) | INC_M);
        self.save_from_t_ml(then);
    }

    fn save_from_t_ml(&mut self, then: Signals) {
        add!(self, OE_ALU | LD_MEM | c_reg(Reg::TMh));
        add!(self, OE_ALU | LD_MEM | then);
    }

    /// Expects C = T_ML.
    fn restore(&mut self) {
        add!(self, OE_MEM | LD_ML | c_reg(Reg::TMh));
        add!(self, OE_MEM | LD_MH | c_mem(0u8));
    }

    /// Stores the ALU result into `r`, restores M and finishes.
    fn write_back(&mut self, r: Reg) {
        add!(self, OE_ALU | LD_T | c_reg(r));
        add!(self, OE_T | LD_MEM | c_reg(Reg::TMl));
        self.restore();
        self.done();
    }

    /// Stores M into the register pair, restores the saved M and finishes.
    fn write_back_pointer(&mut self, hi: Reg, lo: Reg) {
        add!(self, OE_ALU | LD_T | c_reg(lo));
        add!(self, OE_T | LD_MEM | c_reg(Reg::TMh));
        add!(self, OE_ALU | LD_T | c_reg(hi));
        add!(self, OE_T | LD_MEM | c_reg(Reg::TMl));
        self.restore();
        self.done();
    }

    /// ML = MH = ML nand MH, then ML = ML and MH. Expects C = Nand.
    fn and_ml_mh(&mut self, also: Signals) {
        add!(self, OE_ALU | LD_ML | LD_MH);
        add!(self, OE_ALU | LD_ML | also);
    }

    /// F = flags of ML + 0. Expects C to drive 0.
    fn flags_from_ml(&mut self, r: Reg) {
        add!(self, OE_C | LD_MH | c_reg(AluOp::AddF));
        add!(self, OE_ALU | LD_F | c_reg(r));
    }

    fn and_finish(&mut self, r: Reg) {
        self.and_ml_mh(LD_T | c_reg(0u8));
        self.flags_from_ml(r);
        add!(self, OE_T | LD_MEM | c_reg(Reg::TMl));
        self.restore();
        self.done();
    }

    fn or_finish(&mut self, r: Reg) {
        add!(self, OE_ALU | LD_T | LD_ML | c_reg(0u8));
        self.flags_from_ml(r);
        add!(self, OE_T | LD_MEM | c_reg(Reg::TMl));
        self.restore();
        self.done();
    }

    /// M = 0xFFFF. Expects C to drive 0xFF.
    fn address_stack_pointer(&mut self) {
        add!(self, OE_C | LD_ML | LD_MH);
    }

    /// Writes ML back as the stack pointer. Expects C to select ML on the ALU.
    fn store_stack_pointer(&mut self, also: Signals) {
        add!(self, OE_ALU | LD_T | c_mem(7u8));
        self.address_stack_pointer();
        add!(self, OE_T | LD_MEM | also);
    }

    fn ld_r8_i8(&mut self, r: Reg) {
        add!(self, OE_MEM | LD_T | c_reg(r) | INC_M);
        add!(self, OE_T | LD_MEM | c_mem(0u8));
        self.done();
    }

    fn ld_r16_i16(&mut self, hi: Reg, lo: Reg) {
        add!(self, OE_MEM | LD_T | c_reg(hi) | INC_M);
        add!(self, OE_T | LD_MEM | c_mem(0u8));
        add!(self, OE_MEM | LD_T | c_reg(lo) | INC_M);
        add!(self, OE_T | LD_MEM | c_mem(0u8));
        self.done();
    }

    fn ld_r8_cf(&mut self, r: Reg, carry: bool) {
        add!(self, OE_C | c_mem(carry as u8));
        add!(self, OE_C | LD_T);
        add!(self, OE_C | c_reg(r));
        add!(self, OE_T | LD_MEM);
        add!(self, OE_C | c_mem(0u8));
        self.done();
    }

    fn ld_r8_r8(&mut self, dst: Reg, src: Reg) {
        add!(self, OE_C | c_reg(src));
        add!(self, OE_MEM | LD_T);
        add!(self, OE_C | c_reg(dst));
        add!(self, OE_T | LD_MEM);
        add!(self, OE_C | c_mem(0u8));
        self.done();
    }

    fn ld_at_r16_r8(&mut self, hi: Reg, lo: Reg, r: Reg) {
        self.save(c_reg(hi));
        add!(self, OE_MEM | LD_MH | c_reg(lo));
        add!(self, OE_MEM | LD_ML | c_reg(r));
        add!(self, OE_MEM | LD_T | c_mem(0u8));
        add!(self, OE_T | LD_MEM | c_reg(Reg::TMl));
        self.restore();
        self.done();
    }

    fn ld_at_r16_inc_r8(&mut self, hi: Reg, lo: Reg, r: Reg) {
        self.save(c_reg(hi));
        add!(self, OE_MEM | LD_MH | c_reg(lo));
        add!(self, OE_MEM | LD_ML | c_reg(r));
        add!(self, OE_MEM | LD_T | c_mem(0u8));
        add!(self, OE_T | LD_MEM | c_reg(Reg::TMl) | INC_M);
        self.write_back_pointer(hi, lo);
    }

    fn ld_r8_at_r16_inc(&mut self, r: Reg, hi: Reg, lo: Reg) {
        self.save(c_reg(hi));
        add!(self, OE_MEM | LD_MH | c_reg(lo));
        add!(self, OE_MEM | LD_ML | c_mem(0u8));
        add!(self, OE_MEM | LD_T | c_reg(r) | INC_M);
        add!(self, OE_T | LD_MEM | c_reg(Reg::TMl));
        self.write_back_pointer(hi, lo);
    }

    /// Reads a big endian operand and saves M past it. Leaves MH = high, T = low.
    fn absolute_address(&mut self) {
        add!(self, OE_MEM | LD_T | c_reg(Reg::T) | INC_M);
        add!(self, OE_T | LD_MEM | c_mem(0u8));
        self.save_with_immediate(c_reg(Reg::T));
        add!(self, OE_MEM | LD_MH);
    }

    fn ld_at_i16_r8(&mut self, r: Reg) {
        self.absolute_address();
        add!(self, OE_T | LD_ML | c_reg(r));
        add!(self, OE_MEM | LD_T | c_mem(0u8));
        add!(self, OE_T | LD_MEM | c_reg(Reg::TMl));
        self.restore();
        self.done();
    }

    fn ld_r8_at_i16(&mut self, r: Reg) {
        self.absolute_address();
        add!(self, OE_T | LD_ML | c_mem(0u8));
        add!(self, OE_MEM | LD_T | c_reg(r));
        add!(self, OE_T | LD_MEM | c_reg(Reg::TMl));
        self.restore();
        self.done();
    }

    fn out_port_r8(&mut self, port: u8, r: Reg) {
        assert!(port < 4);
        add!(self, OE_C | c_reg(r));
        add!(self, OE_MEM | LD_T | Signals::ld_io_port(port) | LD_C);
        add!(self, OE_T | LD_IO);
        add!(self, OE_C | c_mem(0u8));
        self.done();
    }

    fn out_port_i8(&mut self, port: u8) {
        assert!(port < 4);
        add!(self, OE_MEM | LD_T | Signals::ld_io_port(port) | LD_C | INC_M);
        add!(self, OE_T | LD_IO);
        add!(self, OE_C | c_mem(0u8));
        self.done();
    }

    fn in_r8_port(&mut self, r: Reg, port: u8) {
        assert!(port < 4);
        add!(self, OE_C | Signals::oe_io_port(port) | LD_C);
        add!(self, OE_IO | LD_T | c_reg(r));
        add!(self, OE_T | LD_MEM);
        add!(self, OE_C | c_mem(0u8));
        self.done();
    }

    fn jmp_i16(&mut self, jump: bool) {
        if jump {
            add!(self, OE_MEM | LD_T);
            add!(self, OE_C | INC_M);
            add!(self, OE_MEM | LD_ML);
            add!(self, OE_T | LD_MH);
        } else {
            add!(self, OE_C | INC_M);
            add!(self, OE_C | INC_M);
            add!(self, OE_C);
            add!(self, OE_C);
        }
        self.done();
    }

    /// r += the constant `addend` drives (7 drives 0xFF).
    fn add_const_r8(&mut self, r: Reg, addend: u8) {
        self.save(c_reg(r));
        add!(self, OE_MEM | LD_ML | c_reg(addend));
        add!(self, OE_C | LD_MH | c_reg(AluOp::AddF));
        add!(self, OE_ALU | LD_F | c_reg(AluOp::Add));
        add!(self, OE_ALU | LD_T | c_reg(r));
        add!(self, OE_T | LD_MEM);
        add!(self, OE_C | c_reg(Reg::TMl));
        self.restore();
        self.done();
    }

    /// Adds zero and keeps the flags when inactive.
    fn add_const_r8_if(&mut self, r: Reg, addend: u8, active: bool) {
        self.save(c_reg(r));
        if active {
            add!(self, OE_MEM | LD_ML | c_reg(addend));
            add!(self, OE_C | LD_MH | c_reg(AluOp::AddF));
            add!(self, OE_ALU | LD_F | c_reg(AluOp::Add));
        } else {
            add!(self, OE_MEM | LD_ML | c_reg(0u8));
            add!(self, OE_C | LD_MH | c_reg(AluOp::AddF));
            add!(self, OE_ALU | c_reg(AluOp::Add));
        }
        self.write_back(r);
    }

    fn shl_r8(&mut self, r: Reg) {
        self.save(c_reg(r));
        add!(self, OE_MEM | LD_ML | LD_MH | c_reg(AluOp::AddF));
        add!(self, OE_ALU | LD_F | c_reg(AluOp::Add));
        self.write_back(r);
    }

    fn shlc_r8(&mut self, r: Reg, carry: bool) {
        self.save(c_reg(r));
        add!(self, OE_MEM | LD_ML | LD_MH | c_reg(AluOp::Add));
        add!(self, OE_ALU | LD_ML | c_reg(carry as u8));
        add!(self, OE_C | LD_MH | c_reg(AluOp::Add));
        add!(self, OE_ALU | LD_T | c_reg(r));
        add!(self, OE_MEM | LD_ML | LD_MH | c_reg(AluOp::AddF));
        // a carry in makes the result nonzero
        add!(self, OE_ALU | LD_ML | c_mem(if carry { 6u8 } else { 7u8 }));
        add!(self, OE_C | LD_MH | c_mem(AluOp::Nand));
        self.and_ml_mh(LD_F | c_reg(r));
        add!(self, OE_T | LD_MEM | c_reg(Reg::TMl));
        self.restore();
    }

    fn shr_r8(&mut self, r: Reg) {
        self.save(c_reg(r));
        add!(self, OE_MEM | LD_ML | c_reg(UnaryOp::ShrF));
        add!(self, OE_C | LD_MH | c_reg(AluOp::Unary));
        add!(self, OE_ALU | LD_F | c_reg(UnaryOp::Shr));
        add!(self, OE_C | LD_MH | c_reg(AluOp::Unary));
        self.write_back(r);
    }

    /// Expects the AND mask in the T register slot and the crossbar selector
    /// as the operand byte.
    fn wbit_rbit_end(&mut self, dst: Reg, src: Reg) {
        self.save_with_immediate(c_reg(0u8));
        add!(self, OE_T | LD_MH | c_reg(src));
        add!(self, OE_MEM | LD_ML | c_reg(AluOp::Unary));
        add!(self, OE_ALU | LD_T | c_reg(Reg::T));
        add!(self, OE_MEM | LD_MH | c_reg(dst));
        add!(self, OE_MEM | LD_ML | c_reg(AluOp::Nand));
        self.and_ml_mh(Signals::empty());
        add!(self, OE_T | LD_MH | c_reg(AluOp::Or));
        add!(self, OE_ALU | LD_T | c_reg(dst));
        add!(self, OE_T | LD_MEM | c_reg(Reg::TMl));
        self.restore();
    }

    fn and_r8_i8(&mut self, r: Reg) {
        self.save_with_immediate(c_reg(r));
        add!(self, OE_MEM | LD_ML);
        add!(self, OE_T | LD_MH | c_reg(AluOp::Nand));
        self.and_finish(r);
    }

    fn and_r8_r8(&mut self, dst: Reg, src: Reg) {
        self.save(c_reg(dst));
        add!(self, OE_MEM | LD_ML | c_reg(src));
        add!(self, OE_MEM | LD_MH | c_reg(AluOp::Nand));
        self.and_finish(dst);
    }

    fn or_r8_i8(&mut self, r: Reg) {
        self.save_with_immediate(c_reg(r));
        add!(self, OE_MEM | LD_ML);
        add!(self, OE_T | LD_MH | c_reg(AluOp::Or));
        self.or_finish(r);
    }

    fn or_r8_r8(&mut self, dst: Reg, src: Reg) {
        self.save(c_reg(dst));
        add!(self, OE_MEM | LD_ML | c_reg(src));
        add!(self, OE_MEM | LD_MH | c_reg(AluOp::Or));
        self.or_finish(dst);
    }

    fn or_r8_cf(&mut self, r: Reg, carry: bool) {
        self.save(c_reg(r));
        add!(self, OE_MEM | LD_ML | c_reg(carry as u8));
        add!(self, OE_C | LD_MH | c_reg(AluOp::Or));
        self.or_finish(r);
    }

    fn test_r8(&mut self, r: Reg) {
        self.save(c_reg(r));
        add!(self, OE_MEM | LD_ML | c_reg(0u8));
        add!(self, OE_C | LD_MH | c_reg(AluOp::AddF));
        add!(self, OE_ALU | LD_F | c_reg(Reg::TMl));
        self.restore();
        self.done();
    }

    fn add_r8_r8(&mut self, dst: Reg, src: Reg) {
        self.save(c_reg(dst));
        add!(self, OE_MEM | LD_ML | c_reg(src));
        add!(self, OE_MEM | LD_MH | c_reg(AluOp::AddF));
        add!(self, OE_ALU | LD_F | c_reg(AluOp::Add));
        self.write_back(dst);
    }

    fn addc_r8_i8(&mut self, r: Reg, carry: bool) {
        self.save_with_immediate(c_reg(r));
        add!(self, OE_MEM | LD_ML);
        let carry_in = if carry { INC_M } else { Signals::empty() };
        add!(self, OE_T | LD_MH | c_reg(AluOp::AddF) | carry_in);
        add!(self, OE_ALU | LD_F | c_reg(AluOp::Add));
        self.write_back(r);
    }

    /// F = INIT | (r & 7)
    fn ld_f_r8(&mut self, r: Reg) {
        self.save(c_mem(4u8));
        add!(self, OE_C | LD_ML | LD_MH | c_mem(AluOp::Add));
        add!(self, OE_ALU | LD_MH | c_reg(r));
        add!(self, OE_MEM | LD_ML | c_reg(AluOp::Or));
        add!(self, OE_ALU | LD_F | c_reg(Reg::TMl));
        self.restore();
        self.done();
    }

    /// The flags select the microprogram, so the value is built from constants.
    fn ld_r8_f(&mut self, r: Reg, flags: Flags) {
        // ML = MH = 0xF0 | !F, then nand
        let m = 7 ^ (flags.bits() & 7);
        self.save(c_mem(4u8));
        add!(self, OE_C | LD_ML | LD_MH | c_mem(AluOp::Add));
        if m < 4 {
            add!(self, OE_ALU | LD_ML | LD_MH | c_mem(AluOp::Add));
        } else {
            add!(self, OE_ALU | LD_ML | c_mem(AluOp::Add));
        }
        add!(self, OE_ALU | LD_ML | c_mem(m & 3));
        add!(self, OE_C | LD_MH | c_mem(AluOp::Add));
        add!(self, OE_ALU | LD_ML | LD_MH | c_mem(AluOp::Nand));
        add!(self, OE_ALU | LD_T | c_reg(r));
        add!(self, OE_T | LD_MEM | c_reg(Reg::TMl));
        self.restore();
        self.done();
    }

    fn push_r8(&mut self, r: Reg) {
        self.save(c_reg(r));
        add!(self, OE_MEM | LD_T | c_mem(7u8));
        self.address_stack_pointer();
        add!(self, OE_MEM | LD_ML);
        add!(self, OE_T | LD_MEM);
        add!(self, OE_C | c_mem(Reg::TMl) | INC_M);
        self.store_stack_pointer(Signals::empty());
        add!(self, OE_C | c_reg(Reg::TMl));
        self.restore();
    }

    fn pop_r8(&mut self, r: Reg) {
        self.save(c_mem(7u8));
        self.address_stack_pointer();
        add!(self, OE_MEM | LD_ML | c_mem(AluOp::Add));
        add!(self, OE_ALU | LD_ML);
        add!(self, OE_MEM | LD_T | c_reg(r));
        add!(self, OE_T | LD_MEM);
        add!(self, OE_C | c_mem(Reg::TMl));
        self.store_stack_pointer(Signals::empty());
        add!(self, OE_C | c_reg(Reg::TMl));
        self.restore();
    }

    fn call_i16_begin(&mut self) {
        add!(self, OE_MEM | LD_T | c_reg(Reg::TMh));
        add!(self, OE_T | LD_MEM | c_mem(0u8) | INC_M);
        add!(self, OE_MEM | LD_T | c_reg(Reg::TMl));
        add!(self, OE_T | LD_MEM | c_mem(0u8) | INC_M);
        self.done();
    }

    fn call_i16_end(&mut self) {
        add!(self, OE_C | c_reg(Reg::TMl));
        add!(self, OE_ALU | LD_T | c_reg(Reg::T));
        add!(self, OE_T | LD_MEM | c_reg(Reg::TMh));
        add!(self, OE_ALU | LD_T | c_mem(7u8));
        self.address_stack_pointer();
        add!(self, OE_MEM | LD_ML);
        add!(self, OE_T | LD_MEM | c_reg(Reg::T));
        add!(self, OE_MEM | LD_T | c_mem(0u8) | INC_M);
        add!(self, OE_T | LD_MEM | c_mem(Reg::TMl) | INC_M);
        self.store_stack_pointer(Signals::empty());
        add!(self, OE_C | c_reg(Reg::TMl));
        self.restore();
    }

    fn ret(&mut self) {
        add!(self, OE_C | c_mem(7u8));
        self.address_stack_pointer();
        add!(self, OE_MEM | LD_ML | c_mem(AluOp::Add));
        add!(self, OE_ALU | LD_ML);
        add!(self, OE_MEM | LD_T | c_reg(Reg::TMl));
        add!(self, OE_T | LD_MEM | c_mem(AluOp::Add));
        add!(self, OE_ALU | LD_ML);
        add!(self, OE_MEM | LD_T | c_reg(Reg::TMh));
        add!(self, OE_T | LD_MEM | c_mem(Reg::TMl));
        self.store_stack_pointer(c_reg(Reg::TMl));
        self.restore();
    }

    fn skip_i8(&mut self) {
        add!(self, OE_C | INC_M);
        self.done();
    }
}

/// Microprogram of the power-on sequencer, selected whenever INIT is clear.
pub fn power_on(flags: Flags) -> Microprogram {
    let mut p = Microprogram::empty();
    add!(p, OE_C);

    if !flags.contains(Flags::ZERO) {
        // M = 0, F = ZERO
        add!(p, OE_C | c_mem(0u8));
        add!(p, OE_C | LD_ML | LD_MH);
        add!(p, OE_C | c_mem(1u8));
        add!(p, OE_C | LD_F | LD_S);
        return p;
    }

    add!(p, OE_C | c_mem(AluOp::Boot));
    for _ in 0..2 {
        add!(p, OE_ALU | LD_MEM);
        add!(p, OE_MEM | INC_M);
    }
    // M doubles as the unary selector: BootFlags once MH reaches 0x10
    add!(p, OE_C | c_mem(AluOp::Unary));
    add!(p, OE_ALU | LD_F);
    add!(p, OE_C);

    if flags.contains(Flags::SIGN) {
        add!(p, OE_C | c_mem(7u8));
        p.address_stack_pointer();
        add!(p, OE_C | c_mem(0u8));
        add!(p, OE_C | LD_MEM);
        add!(p, OE_C | LD_O | INC_M);
        add!(p, OE_C | c_mem(AluOp::AddF));
        add!(p, OE_ALU | LD_F);
    } else {
        p.done();
    }
    p
}

pub fn microprogram(opcode: Opcode, flags: Flags) -> Microprogram {
    let zero = flags.contains(Flags::ZERO);
    let carry = flags.contains(Flags::CARRY);
    let sign = flags.contains(Flags::SIGN);

    let mut p = Microprogram::instruction();
    match opcode {
        Opcode::Nop => {}

        Opcode::InA0 => p.in_r8_port(Reg::A, 0),
        Opcode::InA1 => p.in_r8_port(Reg::A, 1),
        Opcode::InA2 => p.in_r8_port(Reg::A, 2),
        Opcode::InA3 => p.in_r8_port(Reg::A, 3),

        Opcode::Out0A => p.out_port_r8(0, Reg::A),
        Opcode::Out1A => p.out_port_r8(1, Reg::A),
        Opcode::Out2A => p.out_port_r8(2, Reg::A),
        Opcode::Out3A => p.out_port_r8(3, Reg::A),

        Opcode::Out0I8 => p.out_port_i8(0),
        Opcode::Out1I8 => p.out_port_i8(1),
        Opcode::Out2I8 => p.out_port_i8(2),
        Opcode::Out3I8 => p.out_port_i8(3),

        Opcode::LdAI8 => p.ld_r8_i8(Reg::A),
        Opcode::LdBI8 => p.ld_r8_i8(Reg::B),
        Opcode::LdCI8 => p.ld_r8_i8(Reg::C),
        Opcode::LdDI8 => p.ld_r8_i8(Reg::D),
        Opcode::LdEI8 => p.ld_r8_i8(Reg::E),
        Opcode::LdTI8 => p.ld_r8_i8(Reg::T),

        Opcode::LdBcI16 => p.ld_r16_i16(Reg::B, Reg::C),
        Opcode::LdDeI16 => p.ld_r16_i16(Reg::D, Reg::E),

        Opcode::LdACf => p.ld_r8_cf(Reg::A, carry),

        Opcode::LdAB => p.ld_r8_r8(Reg::A, Reg::B),
        Opcode::LdAD => p.ld_r8_r8(Reg::A, Reg::D),
        Opcode::LdBA => p.ld_r8_r8(Reg::B, Reg::A),
        Opcode::LdBC => p.ld_r8_r8(Reg::B, Reg::C),
        Opcode::LdDA => p.ld_r8_r8(Reg::D, Reg::A),
        Opcode::LdEA => p.ld_r8_r8(Reg::E, Reg::A),

        Opcode::LdAtBcA => p.ld_at_r16_r8(Reg::B, Reg::C, Reg::A),
        Opcode::LdAtBcE => p.ld_at_r16_r8(Reg::B, Reg::C, Reg::E),
        Opcode::LdAtDeA => p.ld_at_r16_r8(Reg::D, Reg::E, Reg::A),
        Opcode::LdAtDeIncA => p.ld_at_r16_inc_r8(Reg::D, Reg::E, Reg::A),

        Opcode::LdBAtDeInc => p.ld_r8_at_r16_inc(Reg::B, Reg::D, Reg::E),
        Opcode::LdCAtDeInc => p.ld_r8_at_r16_inc(Reg::C, Reg::D, Reg::E),

        Opcode::LdAtI16A => p.ld_at_i16_r8(Reg::A),
        Opcode::LdAtI16B => p.ld_at_i16_r8(Reg::B),
        Opcode::LdAAtI16 => p.ld_r8_at_i16(Reg::A),
        Opcode::LdBAtI16 => p.ld_r8_at_i16(Reg::B),

        Opcode::JmpI16 => p.jmp_i16(true),
        Opcode::JzI16 => p.jmp_i16(zero),
        Opcode::JnzI16 => p.jmp_i16(!zero),
        Opcode::JcI16 => p.jmp_i16(carry),
        Opcode::JncI16 => p.jmp_i16(!carry),
        Opcode::JsI16 => p.jmp_i16(sign),
        Opcode::JbeI16 => p.jmp_i16(zero || !carry),
        Opcode::JaeI16 => p.jmp_i16(zero || carry),

        Opcode::DecA => p.add_const_r8(Reg::A, 7),
        Opcode::DecB => p.add_const_r8(Reg::B, 7),
        Opcode::DecC => p.add_const_r8(Reg::C, 7),
        Opcode::DecD => p.add_const_r8(Reg::D, 7),
        Opcode::DecE => p.add_const_r8(Reg::E, 7),
        Opcode::DeccD => p.add_const_r8_if(Reg::D, 7, !carry),

        Opcode::IncA => p.add_const_r8(Reg::A, 1),
        Opcode::IncB => p.add_const_r8(Reg::B, 1),
        Opcode::IncC => p.add_const_r8(Reg::C, 1),
        Opcode::IncD => p.add_const_r8(Reg::D, 1),
        Opcode::InccB => p.add_const_r8_if(Reg::B, 1, carry),

        Opcode::ShlA => p.shl_r8(Reg::A),
        Opcode::ShlB => p.shl_r8(Reg::B),
        Opcode::ShlcA => p.shlc_r8(Reg::A, carry),
        Opcode::ShrA => p.shr_r8(Reg::A),
        Opcode::ShrB => p.shr_r8(Reg::B),

        Opcode::AndAI8 => p.and_r8_i8(Reg::A),
        Opcode::AndAB => p.and_r8_r8(Reg::A, Reg::B),
        Opcode::OrAI8 => p.or_r8_i8(Reg::A),
        Opcode::OrAB => p.or_r8_r8(Reg::A, Reg::B),
        Opcode::OrACf => p.or_r8_cf(Reg::A, carry),
        Opcode::TestA => p.test_r8(Reg::A),

        Opcode::AddBA => p.add_r8_r8(Reg::B, Reg::A),
        Opcode::AddcBI8 => p.addc_r8_i8(Reg::B, carry),
        Opcode::AddcDI8 => p.addc_r8_i8(Reg::D, carry),

        Opcode::LdFA => p.ld_f_r8(Reg::A),
        Opcode::LdAF => p.ld_r8_f(Reg::A, flags),

        Opcode::PushA => p.push_r8(Reg::A),
        Opcode::PushB => p.push_r8(Reg::B),
        Opcode::PushC => p.push_r8(Reg::C),
        Opcode::PushD => p.push_r8(Reg::D),
        Opcode::PushE => p.push_r8(Reg::E),

        Opcode::PopA => p.pop_r8(Reg::A),
        Opcode::PopB => p.pop_r8(Reg::B),
        Opcode::PopC => p.pop_r8(Reg::C),
        Opcode::PopD => p.pop_r8(Reg::D),
        Opcode::PopE => p.pop_r8(Reg::E),

        Opcode::CallI16Begin => p.call_i16_begin(),
        Opcode::CallI16End => p.call_i16_end(),
        Opcode::Ret => p.ret(),

        Opcode::Nop2 => p.done(),

        Opcode::LdAWbitBRbitEnd => p.wbit_rbit_end(Reg::A, Reg::B),
        Opcode::LdBWbitARbitEnd => p.wbit_rbit_end(Reg::B, Reg::A),

        Opcode::DbgTrap | Opcode::DbgSkip => p.skip_i8(),
    }
    p
}

/// Microprogram for any raw opcode byte under any flag nibble.
pub fn program(opcode: u8, flags: Flags) -> Microprogram {
    if !flags.contains(Flags::INIT) {
        return power_on(flags);
    }

    match Opcode::from_primitive(opcode) {
        Some(o) => microprogram(o, flags),
        None => Microprogram::instruction(),
    }
}

pub fn control_signals(opcode: u8, step: u8, flags: Flags) -> Signals {
    program(opcode, flags).signals(step)
}

pub fn asm_rule(opcode: Opcode) -> Option<&'static str> {
    Some(match opcode {
        Opcode::Nop => "nop => ?",

        // port goes in the low bits of the opcode
        Opcode::InA0 => "in a, {p: u3} => (? + p)`8",
        Opcode::Out0A => "out {p: u3}, a => (? + p)`8",
        Opcode::Out0I8 => "out {p: u3}, {i:i8} => (? + p)`8 @ i",
        Opcode::InA1 | Opcode::InA2 | Opcode::InA3 => return None,
        Opcode::Out1A | Opcode::Out2A | Opcode::Out3A => return None,
        Opcode::Out1I8 | Opcode::Out2I8 | Opcode::Out3I8 => return None,

        Opcode::LdAI8 => "ld a, {i:i8} => ? @ i",
        Opcode::LdBI8 => "ld b, {i:i8} => ? @ i",
        Opcode::LdCI8 => "ld c, {i:i8} => ? @ i",
        Opcode::LdDI8 => "ld d, {i:i8} => ? @ i",
        Opcode::LdEI8 => "ld e, {i:i8} => ? @ i",
        Opcode::LdTI8 => "ld t, {i:i8} => ? @ i",

        Opcode::LdBcI16 => "ld bc, {i:i16} => ? @ i",
        Opcode::LdDeI16 => "ld de, {i:i16} => ? @ i",

        Opcode::LdACf => "ld a, cf => ?",

        Opcode::LdAB => "ld a, b => ?",
        Opcode::LdAD => "ld a, d => ?",
        Opcode::LdBA => "ld b, a => ?",
        Opcode::LdBC => "ld b, c => ?",
        Opcode::LdDA => "ld d, a => ?",
        Opcode::LdEA => "ld e, a => ?",

        Opcode::LdAtBcA => "ld [bc], a => ?",
        Opcode::LdAtBcE => "ld [bc], e => ?",
        Opcode::LdAtDeA => "ld [de], a => ?",
        Opcode::LdAtDeIncA => "ld [de++], a => ?",

        Opcode::LdBAtDeInc => "ld b, [de++] => ?",
        Opcode::LdCAtDeInc => "ld c, [de++] => ?",

        Opcode::LdAtI16A => "ld [{i:i16}], a => ? @ i",
        Opcode::LdAtI16B => "ld [{i:i16}], b => ? @ i",
        Opcode::LdAAtI16 => "ld a, [{i:i16}] => ? @ i",
        Opcode::LdBAtI16 => "ld b, [{i:i16}] => ? @ i",

        Opcode::JmpI16 => "jmp {i:i16} => ? @ i",
        Opcode::JzI16 => "jz {i:i16} => ? @ i",
        Opcode::JnzI16 => "jnz {i:i16} => ? @ i",
        Opcode::JcI16 => "jc {i:i16} => ? @ i",
        Opcode::JncI16 => "jnc {i:i16} => ? @ i",
        Opcode::JsI16 => "js {i:i16} => ? @ i",
        Opcode::JbeI16 => "jbe {i:i16} => ? @ i",
        Opcode::JaeI16 => "jae {i:i16} => ? @ i",

        Opcode::DecA => "dec a => ?",
        Opcode::DecB => "dec b => ?",
        Opcode::DecC => "dec c => ?",
        Opcode::DecD => "dec d => ?",
        Opcode::DecE => "dec e => ?",
        Opcode::DeccD => "decc d => ?",

        Opcode::IncA => "inc a => ?",
        Opcode::IncB => "inc b => ?",
        Opcode::IncC => "inc c => ?",
        Opcode::IncD => "inc d => ?",
        Opcode::InccB => "incc b => ?",

        Opcode::ShlA => "shl a => ?",
        Opcode::ShlB => "shl b => ?",
        Opcode::ShlcA => "shlc a => ?",
        Opcode::ShrA => "shr a => ?",
        Opcode::ShrB => "shr b => ?",

        Opcode::AndAI8 => "and a, {i: i8} => ? @ i",
        Opcode::AndAB => "and a, b => ?",
        Opcode::OrAI8 => "or a, {i: i8} => ? @ i",
        Opcode::OrAB => "or a, b => ?",
        Opcode::OrACf => "or a, cf => ?",
        Opcode::TestA => "test a => ?",

        Opcode::AddBA => "add b, a => ?",
        Opcode::AddcBI8 => "addc b, {i:i8} => ? @ i",
        Opcode::AddcDI8 => "addc d, {i:i8} => ? @ i",

        Opcode::LdFA => "ld f, a => ?",
        Opcode::LdAF => "ld a, f => ?",

        Opcode::PushA => "push a => ?",
        Opcode::PushB => "push b => ?",
        Opcode::PushC => "push c => ?",
        Opcode::PushD => "push d => ?",
        Opcode::PushE => "push e => ?",

        Opcode::PopA => "pop a => ?",
        Opcode::PopB => "pop b => ?",
        Opcode::PopC => "pop c => ?",
        Opcode::PopD => "pop d => ?",
        Opcode::PopE => "pop e => ?",

        // only reachable through combined_instructions
        Opcode::CallI16Begin | Opcode::CallI16End => return None,
        Opcode::LdAWbitBRbitEnd | Opcode::LdBWbitARbitEnd => return None,

        Opcode::Ret => "ret => ?",
        Opcode::Nop2 => "nop2 => ?",

        Opcode::DbgTrap => "trap {code: i8} => ? @ code",
        Opcode::DbgSkip => "skip {code: i8} => ? @ code",
    })
}

fn rules_header() -> String {
    format!(
        "PROGRAM_START_ADDRESS = 0x{:04x}

#bankdef ram {{
    #bits     8
    #addr     PROGRAM_START_ADDRESS
    #addr_end 0x{:x}
    #outp     0
}}

#ruledef instructions
{{
",
        PROGRAM_START, MEMORY_SIZE
    )
}

fn combined_rules() -> String {
    let bit_move = |end: Opcode, dst: Reg, src: Reg| {
        format!(
            "    ld {}[{{wbit: u3}}], {}[{{rbit: u3}}] => 0x{:02x} @ (!(1 << wbit))`8 @ 0x{:02x} @ (0x{:02x} + ((wbit << 3) | rbit))`8\n",
            dst,
            src,
            Opcode::LdTI8 as u8,
            end as u8,
            BitMove::new(0, 0).selector()
        )
    };

    let mut out = String::from("#ruledef combined_instructions {\n");
    out.push_str(&format!(
        "    call {{i:i16}} => 0x{:02x} @ i @ 0x{:02x}\n\n",
        Opcode::CallI16Begin as u8,
        Opcode::CallI16End as u8
    ));
    out.push_str(&bit_move(Opcode::LdAWbitBRbitEnd, Reg::A, Reg::B));
    out.push_str(&bit_move(Opcode::LdBWbitARbitEnd, Reg::B, Reg::A));
    out.push_str("}\n");
    out
}

/// customasm rule definitions for the whole instruction set.
pub fn asm_rules() -> String {
    let mut out = rules_header();
    for opcode in Opcode::iter() {
        if let Some(rule) = asm_rule(opcode) {
            let (before, after) = rule
                .split_once('?')
                .unwrap_or_else(|| panic!("Missing '?' in rule '{}'", rule));
            out.push_str(&format!("    {}0x{:02x}{};\n", before, opcode as u8, after));
        }
    }
    out.push_str("}\n\n");
    out.push_str(&combined_rules());
    out
}

use super::mmu::{Memory, Mmu};

/// The register F holds flag information that are set by ALU
/// operations. Conditional operations check these flags afterwards.
enum Flag {
    /// Zero flag is set when operations result in zero values
    Z = 0b1000_0000,
    /// Negative flag is set when a subtraction operation is performed
    N = 0b0100_0000,
    /// Half-carry flag is set when an operation creates a carry bit from bit 3 to 4.
    H = 0b0010_0000,
    /// Carry flag is set when an operation creates a carry bit from bit 7.
    C = 0b0001_0000,
}

/// Represents all the registers in use by the Gameboy CPU.
/// Consists of 16-bit register pairs that can be accessed as 8-bit
/// high and low registers and as combined 16-bit values
/// Paired as follows:
/// - AF
/// - BC
/// - DE
/// - HL
///
/// Also contains two other 16-bit registers:
/// - PC (Program Counter)
/// - SP (Stack Pointer)
///
/// A GBS driver never sees the post-BIOS register image; every song
/// select starts from all-zero registers, so that is the default here.
#[derive(Clone, Default)]
pub struct Registers {
    pub a: u8,
    pub f: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,
    pub sp: u16,
    pub pc: u16,
}

impl Registers {
    /// Returns a 16-bit value where
    /// B is the hi 8-bits and C is the lo 8-bits
    fn get_bc(&self) -> u16 {
        (u16::from(self.b) << 8) | u16::from(self.c)
    }

    /// Returns a 16-bit value where
    /// D is the hi 8-bits and E is the lo 8-bits
    fn get_de(&self) -> u16 {
        (u16::from(self.d) << 8) | u16::from(self.e)
    }

    /// Returns a 16-bit value where
    /// H is the hi 8-bits and L is the lo 8-bits
    fn get_hl(&self) -> u16 {
        (u16::from(self.h) << 8) | u16::from(self.l)
    }

    /// Returns a 16-bit value where
    /// A is the hi 8-bits and F is the lo 8-bits
    fn get_af(&self) -> u16 {
        (u16::from(self.a) << 8) | u16::from(self.f)
    }

    /// Sets a 16-bit value where
    /// B is the hi 8-bits and C is the lo 8-bits
    fn set_bc(&mut self, val: u16) {
        self.b = (val >> 8) as u8;
        self.c = (val & 0xFF) as u8;
    }

    /// Sets a 16-bit value where
    /// D is the hi 8-bits and E is the lo 8-bits
    fn set_de(&mut self, val: u16) {
        self.d = (val >> 8) as u8;
        self.e = (val & 0xFF) as u8;
    }

    /// Sets a 16-bit value where
    /// H is the hi 8-bits and L is the lo 8-bits
    fn set_hl(&mut self, val: u16) {
        self.h = (val >> 8) as u8;
        self.l = (val & 0xFF) as u8;
    }

    /// Sets a 16-bit value where
    /// A is the hi 8-bits and F is the lo 8-bits.
    /// The low nibble of F is hardwired to zero.
    fn set_af(&mut self, val: u16) {
        self.a = (val >> 8) as u8;
        self.f = (val & 0xF0) as u8;
    }

    fn set_flag(&mut self, f: Flag, v: bool) {
        if v {
            self.f |= f as u8;
        } else {
            self.f &= !(f as u8);
        }
    }

    fn get_flag(&self, f: Flag) -> bool {
        (self.f & (f as u8)) != 0
    }
}

/// The CPU contains Register state and is responsible for decoding each
/// opcode at the current PC and updating the Registers and MMU when
/// appropriate.
///
/// This is the LR35902 as a music driver needs it: the full instruction
/// set with exact flag semantics, but interrupts are stubbed (DI/EI are
/// no-ops) and HALT/STOP fall through, because GBS playback is driven by
/// the stack-match frame protocol instead of the timer interrupt.
pub struct Cpu {
    pub reg: Registers,
    /// Base address for RST vectors. The GBS format relocates the
    /// RST targets to `load_addr + n*8`.
    rst_base: u16,
}

impl Cpu {
    /// Initializes CPU internal state and returns a handle to the
    /// initialized Cpu struct.
    pub fn power_on(rst_base: u16) -> Self {
        Cpu {
            reg: Registers::default(),
            rst_base,
        }
    }

    /// Re-enters the driver at `pc` with a fresh register file, as done
    /// for every song initialization.
    pub fn reset(&mut self, pc: u16, sp: u16, a: u8) {
        self.reg = Registers::default();
        self.reg.pc = pc;
        self.reg.sp = sp;
        self.reg.a = a;
    }

    /// Fetches the byte at PC and advances past it.
    fn imm(&mut self, mmu: &Mmu) -> u8 {
        let v = mmu.read_byte(self.reg.pc);
        self.reg.pc = self.reg.pc.wrapping_add(1);
        v
    }

    /// Fetches a little-endian word at PC and advances past it.
    fn imm_word(&mut self, mmu: &Mmu) -> u16 {
        let v = mmu.read_word(self.reg.pc);
        self.reg.pc = self.reg.pc.wrapping_add(2);
        v
    }

    /// Reads operand register `idx` using the 0..7 index convention:
    /// B,C,D,E,H,L,(HL),A. Index 6 is memory at HL via the bus.
    fn read_r8(&self, mmu: &Mmu, idx: u8) -> u8 {
        match idx {
            0 => self.reg.b,
            1 => self.reg.c,
            2 => self.reg.d,
            3 => self.reg.e,
            4 => self.reg.h,
            5 => self.reg.l,
            6 => mmu.read_byte(self.reg.get_hl()),
            _ => self.reg.a,
        }
    }

    /// Writes operand register `idx`, index 6 going through the bus.
    fn write_r8(&mut self, mmu: &mut Mmu, idx: u8, val: u8) {
        match idx {
            0 => self.reg.b = val,
            1 => self.reg.c = val,
            2 => self.reg.d = val,
            3 => self.reg.e = val,
            4 => self.reg.h = val,
            5 => self.reg.l = val,
            6 => mmu.write_byte(self.reg.get_hl(), val),
            _ => self.reg.a = val,
        }
    }

    /// Evaluates branch condition `idx` in {NZ, Z, NC, C} order.
    fn condition(&self, idx: u8) -> bool {
        match idx & 3 {
            0 => !self.reg.get_flag(Flag::Z),
            1 => self.reg.get_flag(Flag::Z),
            2 => !self.reg.get_flag(Flag::C),
            _ => self.reg.get_flag(Flag::C),
        }
    }

    fn stack_push(&mut self, mmu: &mut Mmu, val: u16) {
        self.reg.sp = self.reg.sp.wrapping_sub(2);
        mmu.write_word(self.reg.sp, val);
    }

    fn stack_pop(&mut self, mmu: &Mmu) -> u16 {
        let v = mmu.read_word(self.reg.sp);
        self.reg.sp = self.reg.sp.wrapping_add(2);
        v
    }

    /// Fetches a single instruction opcode, decodes it by the x/y/z bit
    /// split, and executes the functionality. Unknown opcodes execute as
    /// NOP, per the "play whatever the driver produces" policy.
    pub fn step(&mut self, mmu: &mut Mmu) {
        let op = self.imm(mmu);

        match op {
            // NOP
            0x00 => (),

            // HALT and STOP are no-ops: nothing ever wakes a halted CPU
            // here, and frame pacing comes from the stack-match protocol.
            0x76 => (),
            0x10 => {
                self.imm(mmu);
            }

            // DI / EI, no interrupts to mask
            0xF3 | 0xFB => (),

            // LD r8,d8
            0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x36 | 0x3E => {
                let v = self.imm(mmu);
                self.write_r8(mmu, (op >> 3) & 7, v);
            }

            // LD (BC),A / LD (DE),A / LD (HL+),A / LD (HL-),A
            0x02 => mmu.write_byte(self.reg.get_bc(), self.reg.a),
            0x12 => mmu.write_byte(self.reg.get_de(), self.reg.a),
            0x22 => {
                let hl = self.reg.get_hl();
                mmu.write_byte(hl, self.reg.a);
                self.reg.set_hl(hl.wrapping_add(1));
            }
            0x32 => {
                let hl = self.reg.get_hl();
                mmu.write_byte(hl, self.reg.a);
                self.reg.set_hl(hl.wrapping_sub(1));
            }

            // LD A,(BC) / LD A,(DE) / LD A,(HL+) / LD A,(HL-)
            0x0A => self.reg.a = mmu.read_byte(self.reg.get_bc()),
            0x1A => self.reg.a = mmu.read_byte(self.reg.get_de()),
            0x2A => {
                let hl = self.reg.get_hl();
                self.reg.a = mmu.read_byte(hl);
                self.reg.set_hl(hl.wrapping_add(1));
            }
            0x3A => {
                let hl = self.reg.get_hl();
                self.reg.a = mmu.read_byte(hl);
                self.reg.set_hl(hl.wrapping_sub(1));
            }

            // LDH (a8),A / LDH A,(a8)
            0xE0 => {
                let addr = 0xFF00 + u16::from(self.imm(mmu));
                mmu.write_byte(addr, self.reg.a);
            }
            0xF0 => {
                let addr = 0xFF00 + u16::from(self.imm(mmu));
                self.reg.a = mmu.read_byte(addr);
            }

            // LD (C),A / LD A,(C)
            0xE2 => mmu.write_byte(0xFF00 + u16::from(self.reg.c), self.reg.a),
            0xF2 => self.reg.a = mmu.read_byte(0xFF00 + u16::from(self.reg.c)),

            // LD r8,r8 block (0x76 HALT handled above)
            0x40..=0x7F => {
                let v = self.read_r8(mmu, op & 7);
                self.write_r8(mmu, (op >> 3) & 7, v);
            }

            // LD r16,d16
            0x01 => {
                let v = self.imm_word(mmu);
                self.reg.set_bc(v);
            }
            0x11 => {
                let v = self.imm_word(mmu);
                self.reg.set_de(v);
            }
            0x21 => {
                let v = self.imm_word(mmu);
                self.reg.set_hl(v);
            }
            0x31 => self.reg.sp = self.imm_word(mmu),

            // LD (a16),A / LD A,(a16)
            0xEA => {
                let addr = self.imm_word(mmu);
                mmu.write_byte(addr, self.reg.a);
            }
            0xFA => {
                let addr = self.imm_word(mmu);
                self.reg.a = mmu.read_byte(addr);
            }

            // LD (a16),SP
            0x08 => {
                let addr = self.imm_word(mmu);
                mmu.write_word(addr, self.reg.sp);
            }

            // LD SP,HL
            0xF9 => self.reg.sp = self.reg.get_hl(),

            // ADD SP,r8 / LD HL,SP+r8
            0xE8 => {
                let d = self.imm(mmu);
                self.reg.sp = self.add_sp_offset(d);
            }
            0xF8 => {
                let d = self.imm(mmu);
                let v = self.add_sp_offset(d);
                self.reg.set_hl(v);
            }

            // ALU A,r8 block
            0x80..=0xBF => {
                let v = self.read_r8(mmu, op & 7);
                self.alu((op >> 3) & 7, v);
            }

            // ALU A,d8
            0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => {
                let v = self.imm(mmu);
                self.alu((op >> 3) & 7, v);
            }

            // ADD HL,r16
            0x09 => self.add_hl(self.reg.get_bc()),
            0x19 => self.add_hl(self.reg.get_de()),
            0x29 => self.add_hl(self.reg.get_hl()),
            0x39 => self.add_hl(self.reg.sp),

            // INC r8 / DEC r8
            0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => {
                let y = (op >> 3) & 7;
                let v = self.inc(self.read_r8(mmu, y));
                self.write_r8(mmu, y, v);
            }
            0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => {
                let y = (op >> 3) & 7;
                let v = self.dec(self.read_r8(mmu, y));
                self.write_r8(mmu, y, v);
            }

            // INC r16 / DEC r16
            0x03 => self.reg.set_bc(self.reg.get_bc().wrapping_add(1)),
            0x13 => self.reg.set_de(self.reg.get_de().wrapping_add(1)),
            0x23 => self.reg.set_hl(self.reg.get_hl().wrapping_add(1)),
            0x33 => self.reg.sp = self.reg.sp.wrapping_add(1),
            0x0B => self.reg.set_bc(self.reg.get_bc().wrapping_sub(1)),
            0x1B => self.reg.set_de(self.reg.get_de().wrapping_sub(1)),
            0x2B => self.reg.set_hl(self.reg.get_hl().wrapping_sub(1)),
            0x3B => self.reg.sp = self.reg.sp.wrapping_sub(1),

            // Rotates on A: unlike the CB forms, Z is always cleared
            0x07 => {
                let v = self.rlc(self.reg.a);
                self.reg.a = v;
                self.reg.set_flag(Flag::Z, false);
            }
            0x0F => {
                let v = self.rrc(self.reg.a);
                self.reg.a = v;
                self.reg.set_flag(Flag::Z, false);
            }
            0x17 => {
                let v = self.rl(self.reg.a);
                self.reg.a = v;
                self.reg.set_flag(Flag::Z, false);
            }
            0x1F => {
                let v = self.rr(self.reg.a);
                self.reg.a = v;
                self.reg.set_flag(Flag::Z, false);
            }

            0x27 => self.daa(),

            // CPL
            0x2F => {
                self.reg.a = !self.reg.a;
                self.reg.set_flag(Flag::N, true);
                self.reg.set_flag(Flag::H, true);
            }

            // SCF / CCF
            0x37 => {
                self.reg.set_flag(Flag::N, false);
                self.reg.set_flag(Flag::H, false);
                self.reg.set_flag(Flag::C, true);
            }
            0x3F => {
                let c = self.reg.get_flag(Flag::C);
                self.reg.set_flag(Flag::N, false);
                self.reg.set_flag(Flag::H, false);
                self.reg.set_flag(Flag::C, !c);
            }

            // JR r8 / JR cc,r8
            0x18 => {
                let d = self.imm(mmu) as i8;
                self.reg.pc = self.reg.pc.wrapping_add(d as u16);
            }
            0x20 | 0x28 | 0x30 | 0x38 => {
                let d = self.imm(mmu) as i8;
                if self.condition((op >> 3) & 3) {
                    self.reg.pc = self.reg.pc.wrapping_add(d as u16);
                }
            }

            // JP a16 / JP cc,a16 / JP (HL)
            0xC3 => self.reg.pc = self.imm_word(mmu),
            0xC2 | 0xCA | 0xD2 | 0xDA => {
                let addr = self.imm_word(mmu);
                if self.condition((op >> 3) & 3) {
                    self.reg.pc = addr;
                }
            }
            0xE9 => self.reg.pc = self.reg.get_hl(),

            // CALL a16 / CALL cc,a16
            0xCD => {
                let addr = self.imm_word(mmu);
                self.stack_push(mmu, self.reg.pc);
                self.reg.pc = addr;
            }
            0xC4 | 0xCC | 0xD4 | 0xDC => {
                let addr = self.imm_word(mmu);
                if self.condition((op >> 3) & 3) {
                    self.stack_push(mmu, self.reg.pc);
                    self.reg.pc = addr;
                }
            }

            // RET / RET cc / RETI (interrupts stubbed, so same as RET)
            0xC9 | 0xD9 => self.reg.pc = self.stack_pop(mmu),
            0xC0 | 0xC8 | 0xD0 | 0xD8 => {
                if self.condition((op >> 3) & 3) {
                    self.reg.pc = self.stack_pop(mmu);
                }
            }

            // RST n: vectors sit at load_addr + n*8 in a GBS image
            0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => {
                self.stack_push(mmu, self.reg.pc);
                self.reg.pc = self.rst_base.wrapping_add(u16::from((op >> 3) & 7) * 8);
            }

            // POP r16
            0xC1 => {
                let v = self.stack_pop(mmu);
                self.reg.set_bc(v);
            }
            0xD1 => {
                let v = self.stack_pop(mmu);
                self.reg.set_de(v);
            }
            0xE1 => {
                let v = self.stack_pop(mmu);
                self.reg.set_hl(v);
            }
            0xF1 => {
                let v = self.stack_pop(mmu);
                self.reg.set_af(v);
            }

            // PUSH r16
            0xC5 => {
                let v = self.reg.get_bc();
                self.stack_push(mmu, v);
            }
            0xD5 => {
                let v = self.reg.get_de();
                self.stack_push(mmu, v);
            }
            0xE5 => {
                let v = self.reg.get_hl();
                self.stack_push(mmu, v);
            }
            0xF5 => {
                let v = self.reg.get_af();
                self.stack_push(mmu, v);
            }

            // CB-prefixed bit/rotate/shift block
            0xCB => {
                let cb = self.imm(mmu);
                let x = cb >> 6;
                let y = (cb >> 3) & 7;
                let z = cb & 7;
                match x {
                    0 => {
                        let v = self.read_r8(mmu, z);
                        let v = match y {
                            0 => self.rlc(v),
                            1 => self.rrc(v),
                            2 => self.rl(v),
                            3 => self.rr(v),
                            4 => self.sla(v),
                            5 => self.sra(v),
                            6 => self.swap(v),
                            _ => self.srl(v),
                        };
                        self.write_r8(mmu, z, v);
                    }
                    1 => {
                        let v = self.read_r8(mmu, z);
                        self.bit(v, y);
                    }
                    2 => {
                        let v = self.read_r8(mmu, z) & !(1 << y);
                        self.write_r8(mmu, z, v);
                    }
                    _ => {
                        let v = self.read_r8(mmu, z) | (1 << y);
                        self.write_r8(mmu, z, v);
                    }
                }
            }

            _ => debug!("Unknown opcode {:02X}, executing as NOP", op),
        }
    }

    /// Dispatches the 8-bit ALU family selected by `y`:
    /// ADD, ADC, SUB, SBC, AND, XOR, OR, CP.
    fn alu(&mut self, y: u8, val: u8) {
        match y {
            0 => self.add(val),
            1 => self.adc(val),
            2 => self.sub(val),
            3 => self.sbc(val),
            4 => self.and(val),
            5 => self.xor(val),
            6 => self.or(val),
            _ => self.cp(val),
        }
    }

    /// Adds the given register value `r` to the `A` register.
    /// Flags:
    ///
    /// - Z: Set to 1 if resulting value is 0, set to 0 otherwise
    /// - N: Set to 0
    /// - H: Set to 1 if bit 3 carries, 0 otherwise
    /// - C: Set to 1 if bit 7 carries, 0 otherwise
    fn add(&mut self, r: u8) {
        let a = self.reg.a;
        let v = a.wrapping_add(r);
        self.reg.set_flag(Flag::Z, v == 0);
        self.reg.set_flag(Flag::N, false);
        self.reg.set_flag(Flag::H, (a & 0x0F) + (r & 0x0F) > 0x0F);
        self.reg.set_flag(Flag::C, u16::from(a) + u16::from(r) > 0xFF);
        self.reg.a = v;
    }

    /// Adds the given register value `r` plus the carry to the `A` register.
    /// Flags:
    ///
    /// - Z: Set to 1 if resulting value is 0, set to 0 otherwise
    /// - N: Set to 0
    /// - H: Set to 1 if bit 3 carries, 0 otherwise
    /// - C: Set to 1 if bit 7 carries, 0 otherwise
    fn adc(&mut self, r: u8) {
        let a = self.reg.a;
        let c = u8::from(self.reg.get_flag(Flag::C));
        let v = a.wrapping_add(r).wrapping_add(c);
        self.reg.set_flag(Flag::Z, v == 0);
        self.reg.set_flag(Flag::N, false);
        self.reg.set_flag(Flag::H, (a & 0x0F) + (r & 0x0F) + c > 0x0F);
        self.reg
            .set_flag(Flag::C, u16::from(a) + u16::from(r) + u16::from(c) > 0xFF);
        self.reg.a = v;
    }

    /// Subtracts the given register value `r` from the `A` register.
    /// Flags:
    ///
    /// - Z: Set to 1 if resulting value is 0, set to 0 otherwise
    /// - N: Set to 1
    /// - H: Set to 1 if bit 3 borrows, 0 otherwise
    /// - C: Set to 1 if bit 7 borrows, 0 otherwise
    fn sub(&mut self, r: u8) {
        let a = self.reg.a;
        let v = a.wrapping_sub(r);
        self.reg.set_flag(Flag::Z, v == 0);
        self.reg.set_flag(Flag::N, true);
        self.reg.set_flag(Flag::H, (a & 0x0F) < (r & 0x0F));
        self.reg.set_flag(Flag::C, a < r);
        self.reg.a = v;
    }

    /// Subtracts the given register value `r` plus the carry from the
    /// `A` register.
    /// Flags:
    ///
    /// - Z: Set to 1 if resulting value is 0, set to 0 otherwise
    /// - N: Set to 1
    /// - H: Set to 1 if bit 3 borrows, 0 otherwise
    /// - C: Set to 1 if bit 7 borrows, 0 otherwise
    fn sbc(&mut self, r: u8) {
        let a = self.reg.a;
        let c = u8::from(self.reg.get_flag(Flag::C));
        let v = a.wrapping_sub(r).wrapping_sub(c);
        self.reg.set_flag(Flag::Z, v == 0);
        self.reg.set_flag(Flag::N, true);
        self.reg
            .set_flag(Flag::H, (a & 0x0F) < (r & 0x0F) + c);
        self.reg
            .set_flag(Flag::C, u16::from(a) < u16::from(r) + u16::from(c));
        self.reg.a = v;
    }

    /// Performs a bitwise AND operation between `A` and the given register `r`
    /// Flags:
    ///
    /// - Z: Set to 1 if resulting value is 0, set to 0 otherwise
    /// - N: Set to 0
    /// - H: Set to 1
    /// - C: Set to 0
    fn and(&mut self, r: u8) {
        let v = self.reg.a & r;
        self.reg.set_flag(Flag::Z, v == 0);
        self.reg.set_flag(Flag::N, false);
        self.reg.set_flag(Flag::H, true);
        self.reg.set_flag(Flag::C, false);
        self.reg.a = v;
    }

    /// Performs a bitwise XOR operation between `A` and the given register `r`
    /// Flags:
    ///
    /// - Z: Set to 1 if resulting value is 0, set to 0 otherwise
    /// - N: Set to 0
    /// - H: Set to 0
    /// - C: Set to 0
    fn xor(&mut self, r: u8) {
        let v = self.reg.a ^ r;
        self.reg.set_flag(Flag::Z, v == 0);
        self.reg.set_flag(Flag::N, false);
        self.reg.set_flag(Flag::H, false);
        self.reg.set_flag(Flag::C, false);
        self.reg.a = v;
    }

    /// Performs a bitwise OR operation between `A` and the given register `r`
    /// Flags:
    ///
    /// - Z: Set to 1 if resulting value is 0, set to 0 otherwise
    /// - N: Set to 0
    /// - H: Set to 0
    /// - C: Set to 0
    fn or(&mut self, r: u8) {
        let v = self.reg.a | r;
        self.reg.set_flag(Flag::Z, v == 0);
        self.reg.set_flag(Flag::N, false);
        self.reg.set_flag(Flag::H, false);
        self.reg.set_flag(Flag::C, false);
        self.reg.a = v;
    }

    /// Performs a compare operation between `A` and the given register `r`
    /// Sets the flags similar to a SUB operation, but not writing the result
    fn cp(&mut self, r: u8) {
        let a = self.reg.a;
        self.sub(r);
        self.reg.a = a;
    }

    /// Increment the given value `r` and returns the incremented value.
    /// Flags:
    ///
    /// - Z: Set to 1 if resulting value is 0, set to 0 otherwise
    /// - N: Set to 0
    /// - H: Set to 1 if bit 3 carries, 0 otherwise
    /// - C: None
    fn inc(&mut self, r: u8) -> u8 {
        let v = r.wrapping_add(1);
        self.reg.set_flag(Flag::Z, v == 0);
        self.reg.set_flag(Flag::N, false);
        self.reg.set_flag(Flag::H, (r & 0x0F) + 0x1 > 0x0F);
        v
    }

    /// Decrement the given value `r` and returns the decremented value.
    /// Flags:
    ///
    /// - Z: Set to 1 if resulting value is 0, set to 0 otherwise
    /// - N: Set to 1
    /// - H: Set to 1 if bit 3 borrows, 0 otherwise
    /// - C: None
    fn dec(&mut self, r: u8) -> u8 {
        let v = r.wrapping_sub(1);
        self.reg.set_flag(Flag::Z, v == 0);
        self.reg.set_flag(Flag::N, true);
        self.reg.set_flag(Flag::H, (r & 0x0F) == 0);
        v
    }

    /// Adds a given 16-bit register value to the HL register.
    /// Flags:
    ///
    /// - Z: None
    /// - N: Set to 0
    /// - H: Set to 1 if bit 11 carries, 0 otherwise
    /// - C: Set to 1 if bit 15 carries, 0 otherwise
    fn add_hl(&mut self, r: u16) {
        let hl = self.reg.get_hl();
        self.reg.set_flag(Flag::N, false);
        self.reg
            .set_flag(Flag::H, (hl & 0x0FFF) + (r & 0x0FFF) > 0x0FFF);
        self.reg
            .set_flag(Flag::C, u32::from(hl) + u32::from(r) > 0xFFFF);
        self.reg.set_hl(hl.wrapping_add(r));
    }

    /// Computes SP plus a signed 8-bit offset, shared by ADD SP,r8 and
    /// LD HL,SP+r8. H and C come from the unsigned low-nibble and
    /// low-byte additions; Z and N are always cleared.
    fn add_sp_offset(&mut self, offset: u8) -> u16 {
        let v = i16::from(offset as i8) as u16;
        let sp = self.reg.sp;
        self.reg.set_flag(Flag::Z, false);
        self.reg.set_flag(Flag::N, false);
        self.reg
            .set_flag(Flag::H, (sp & 0x000F) + (v & 0x000F) > 0x000F);
        self.reg
            .set_flag(Flag::C, (sp & 0x00FF) + (v & 0x00FF) > 0x00FF);
        sp.wrapping_add(v)
    }

    /// Decimal-adjusts A after a BCD add or subtract, using N to pick the
    /// direction and H/C plus the digit bands to pick 0x06/0x60 steps.
    /// Flags:
    ///
    /// - Z: Set to 1 if resulting value is 0, set to 0 otherwise
    /// - N: None
    /// - H: Set to 0
    /// - C: Set if the high digit adjusted past 0x99 (additive only)
    fn daa(&mut self) {
        let mut a = self.reg.a;
        let mut carry = self.reg.get_flag(Flag::C);
        if self.reg.get_flag(Flag::N) {
            if self.reg.get_flag(Flag::H) {
                a = a.wrapping_sub(0x06);
            }
            if carry {
                a = a.wrapping_sub(0x60);
            }
        } else {
            if self.reg.get_flag(Flag::H) || (a & 0x0F) > 0x09 {
                a = a.wrapping_add(0x06);
            }
            if carry || self.reg.a > 0x99 {
                a = a.wrapping_add(0x60);
                carry = true;
            }
        }
        self.reg.set_flag(Flag::Z, a == 0);
        self.reg.set_flag(Flag::H, false);
        self.reg.set_flag(Flag::C, carry);
        self.reg.a = a;
    }

    /// Rotate the given register value left, with bit 7 wrapping to bit 0
    /// Flags:
    ///
    /// - Z: Set to 1 if resulting value is 0, set to 0 otherwise
    /// - N: Set to 0
    /// - H: Set to 0
    /// - C: Set to value of `r` bit 7, before the shift
    fn rlc(&mut self, r: u8) -> u8 {
        let v = r.rotate_left(1);
        self.reg.set_flag(Flag::Z, v == 0);
        self.reg.set_flag(Flag::N, false);
        self.reg.set_flag(Flag::H, false);
        self.reg.set_flag(Flag::C, (r >> 7) == 0x1);
        v
    }

    /// Rotate the given register value right, with bit 0 wrapping to bit 7
    /// Flags:
    ///
    /// - Z: Set to 1 if resulting value is 0, set to 0 otherwise
    /// - N: Set to 0
    /// - H: Set to 0
    /// - C: Set to value of `r` bit 0, before the shift
    fn rrc(&mut self, r: u8) -> u8 {
        let v = r.rotate_right(1);
        self.reg.set_flag(Flag::Z, v == 0);
        self.reg.set_flag(Flag::N, false);
        self.reg.set_flag(Flag::H, false);
        self.reg.set_flag(Flag::C, (r & 0x01) == 0x1);
        v
    }

    /// Rotate the given register value left, with bit 7 shifted into C,
    /// and bit 0 containing the value of the old C.
    /// Flags:
    ///
    /// - Z: Set to 1 if resulting value is 0, set to 0 otherwise
    /// - N: Set to 0
    /// - H: Set to 0
    /// - C: Set to value of `r` bit 7, before the shift
    fn rl(&mut self, r: u8) -> u8 {
        let v = (r << 1) | u8::from(self.reg.get_flag(Flag::C));
        self.reg.set_flag(Flag::Z, v == 0);
        self.reg.set_flag(Flag::N, false);
        self.reg.set_flag(Flag::H, false);
        self.reg.set_flag(Flag::C, (r >> 7) == 0x1);
        v
    }

    /// Rotate the given register value right, with bit 0 shifted into C,
    /// and bit 7 containing the value of the old C.
    /// Flags:
    ///
    /// - Z: Set to 1 if resulting value is 0, set to 0 otherwise
    /// - N: Set to 0
    /// - H: Set to 0
    /// - C: Set to value of `r` bit 0, before the shift
    fn rr(&mut self, r: u8) -> u8 {
        let v = (r >> 1) | (u8::from(self.reg.get_flag(Flag::C)) << 7);
        self.reg.set_flag(Flag::Z, v == 0);
        self.reg.set_flag(Flag::N, false);
        self.reg.set_flag(Flag::H, false);
        self.reg.set_flag(Flag::C, (r & 0x01) == 0x1);
        v
    }

    /// Shift register `r` left into the Carry flag. Bit 0 set to 0.
    /// Flags:
    ///
    /// - Z: Set to 1 if resulting value is 0, set to 0 otherwise
    /// - N: Set to 0
    /// - H: Set to 0
    /// - C: Set to value of `r` bit 7, before the shift
    fn sla(&mut self, r: u8) -> u8 {
        let v = r << 1;
        self.reg.set_flag(Flag::Z, v == 0);
        self.reg.set_flag(Flag::N, false);
        self.reg.set_flag(Flag::H, false);
        self.reg.set_flag(Flag::C, (r >> 7) == 0x1);
        v
    }

    /// Shift register `r` right into the Carry flag. Bit 7 unchanged.
    /// Flags:
    ///
    /// - Z: Set to 1 if resulting value is 0, set to 0 otherwise
    /// - N: Set to 0
    /// - H: Set to 0
    /// - C: Set to value of `r` bit 0, before the shift
    fn sra(&mut self, r: u8) -> u8 {
        let v = (r >> 1) | (r & 0x80);
        self.reg.set_flag(Flag::Z, v == 0);
        self.reg.set_flag(Flag::N, false);
        self.reg.set_flag(Flag::H, false);
        self.reg.set_flag(Flag::C, (r & 0x01) == 0x1);
        v
    }

    /// Swap upper and lower 4 bits of `r`
    /// Flags:
    ///
    /// - Z: Set to 1 if resulting value is 0, set to 0 otherwise
    /// - N: Set to 0
    /// - H: Set to 0
    /// - C: Set to 0
    fn swap(&mut self, r: u8) -> u8 {
        self.reg.set_flag(Flag::Z, r == 0);
        self.reg.set_flag(Flag::N, false);
        self.reg.set_flag(Flag::H, false);
        self.reg.set_flag(Flag::C, false);
        (r >> 4) | (r << 4)
    }

    /// Shift register `r` right into the Carry flag. Bit 7 set to 0.
    /// Flags:
    ///
    /// - Z: Set to 1 if resulting value is 0, set to 0 otherwise
    /// - N: Set to 0
    /// - H: Set to 0
    /// - C: Set to value of `r` bit 0, before the shift
    fn srl(&mut self, r: u8) -> u8 {
        let v = r >> 1;
        self.reg.set_flag(Flag::Z, v == 0);
        self.reg.set_flag(Flag::N, false);
        self.reg.set_flag(Flag::H, false);
        self.reg.set_flag(Flag::C, (r & 0x01) == 0x1);
        v
    }

    /// Test bit `b` in register `r`
    /// Flags:
    ///
    /// - Z: Set if bit `b` of register `r` is 0
    /// - N: Set to 0
    /// - H: Set to 1
    /// - C: None
    fn bit(&mut self, r: u8, b: u8) {
        self.reg.set_flag(Flag::Z, r & (0x1 << b) == 0x0);
        self.reg.set_flag(Flag::N, false);
        self.reg.set_flag(Flag::H, true);
    }
}

#[cfg(test)]
mod cpu_tests {
    use super::*;
    use crate::gbs::GbsHeader;

    /// Builds a CPU and bus with `program` loaded at address 0 and the
    /// stack placed in working RAM.
    fn test_system(program: &[u8]) -> (Cpu, Mmu) {
        let header = GbsHeader {
            song_count: 1,
            start_song: 0,
            load_addr: 0x0000,
            init_addr: 0x0000,
            play_addr: 0x0000,
            sp: 0xE000,
            tma: 0,
            tac: 0,
            title: String::new(),
            author: String::new(),
            copyright: String::new(),
        };
        let mmu = Mmu::power_on(&header, program, 48_000).unwrap();
        let mut cpu = Cpu::power_on(0);
        cpu.reset(0, 0xDFFE, 0);
        (cpu, mmu)
    }

    fn flags(cpu: &Cpu) -> (bool, bool, bool, bool) {
        (
            cpu.reg.get_flag(Flag::Z),
            cpu.reg.get_flag(Flag::N),
            cpu.reg.get_flag(Flag::H),
            cpu.reg.get_flag(Flag::C),
        )
    }

    #[test]
    fn add_a_half_and_full_carry() {
        // LD A,0xFF; ADD A,A
        let (mut cpu, mut mmu) = test_system(&[0x3E, 0xFF, 0x87]);
        cpu.step(&mut mmu);
        cpu.step(&mut mmu);
        assert_eq!(cpu.reg.a, 0xFE);
        assert_eq!(flags(&cpu), (false, false, true, true));
    }

    #[test]
    fn inc_half_carry() {
        // LD A,0x0F; INC A
        let (mut cpu, mut mmu) = test_system(&[0x3E, 0x0F, 0x3C]);
        cpu.step(&mut mmu);
        cpu.step(&mut mmu);
        assert_eq!(cpu.reg.a, 0x10);
        let (z, n, h, _) = flags(&cpu);
        assert!(!z && !n && h);
    }

    #[test]
    fn xor_a_clears() {
        let (mut cpu, mut mmu) = test_system(&[0xAF]);
        cpu.reg.a = 0x5A;
        cpu.step(&mut mmu);
        assert_eq!(cpu.reg.a, 0);
        assert_eq!(flags(&cpu), (true, false, false, false));
    }

    #[test]
    fn ld_bc_immediate() {
        let (mut cpu, mut mmu) = test_system(&[0x01, 0x34, 0x12]);
        cpu.step(&mut mmu);
        assert_eq!(cpu.reg.b, 0x12);
        assert_eq!(cpu.reg.c, 0x34);
    }

    #[test]
    fn daa_no_adjust() {
        // LD A,0x45; DAA
        let (mut cpu, mut mmu) = test_system(&[0x3E, 0x45, 0x27]);
        cpu.step(&mut mmu);
        cpu.step(&mut mmu);
        assert_eq!(cpu.reg.a, 0x45);
        assert_eq!(flags(&cpu), (false, false, false, false));
    }

    #[test]
    fn daa_adjust_with_carry() {
        // LD A,0x9A; DAA
        let (mut cpu, mut mmu) = test_system(&[0x3E, 0x9A, 0x27]);
        cpu.step(&mut mmu);
        cpu.step(&mut mmu);
        assert_eq!(cpu.reg.a, 0x00);
        let (z, _, h, c) = flags(&cpu);
        assert!(z && !h && c);
    }

    #[test]
    fn call_then_ret() {
        let mut program = vec![0xCD, 0x10, 0x00]; // CALL 0x0010
        program.resize(0x10, 0x00);
        program.push(0xC9); // 0x0010: RET
        let (mut cpu, mut mmu) = test_system(&program);
        let entry_sp = cpu.reg.sp;
        cpu.step(&mut mmu);
        assert_eq!(cpu.reg.pc, 0x0010);
        assert_eq!(cpu.reg.sp, entry_sp - 2);
        cpu.step(&mut mmu);
        assert_eq!(cpu.reg.pc, 0x0003);
        assert_eq!(cpu.reg.sp, entry_sp);
    }

    #[test]
    fn jr_backwards() {
        // NOP; NOP; JR -4 lands back at address 0
        let (mut cpu, mut mmu) = test_system(&[0x00, 0x00, 0x18, 0xFC]);
        cpu.step(&mut mmu);
        cpu.step(&mut mmu);
        cpu.step(&mut mmu);
        assert_eq!(cpu.reg.pc, 0x0000);
    }

    #[test]
    fn pop_af_masks_low_nibble() {
        let (mut cpu, mut mmu) = test_system(&[0xF1]);
        mmu.write_word(0xDFFC, 0x12FF);
        cpu.reg.sp = 0xDFFC;
        cpu.step(&mut mmu);
        assert_eq!(cpu.reg.a, 0x12);
        assert_eq!(cpu.reg.f, 0xF0);
    }

    #[test]
    fn add_hl_uses_bit_11_half_carry() {
        // LD HL,0x0FFF; LD BC,0x0001; ADD HL,BC
        let (mut cpu, mut mmu) = test_system(&[0x21, 0xFF, 0x0F, 0x01, 0x01, 0x00, 0x09]);
        cpu.step(&mut mmu);
        cpu.step(&mut mmu);
        cpu.step(&mut mmu);
        assert_eq!(cpu.reg.get_hl(), 0x1000);
        let (_, n, h, c) = flags(&cpu);
        assert!(!n && h && !c);
    }

    #[test]
    fn add_sp_signed_flags() {
        // ADD SP,-1 from 0xE000: low byte 0x00 + 0xFF carries nothing
        let (mut cpu, mut mmu) = test_system(&[0xE8, 0xFF]);
        cpu.reg.sp = 0xE000;
        cpu.step(&mut mmu);
        assert_eq!(cpu.reg.sp, 0xDFFF);
        assert_eq!(flags(&cpu), (false, false, false, false));
    }

    #[test]
    fn cb_ops_through_hl() {
        // LD HL,0xC000; LD (HL),0x81; CB SWAP (HL); CB BIT 0,(HL)
        let (mut cpu, mut mmu) = test_system(&[
            0x21, 0x00, 0xC0, 0x36, 0x81, 0xCB, 0x36, 0xCB, 0x46,
        ]);
        cpu.step(&mut mmu);
        cpu.step(&mut mmu);
        cpu.step(&mut mmu);
        assert_eq!(mmu.read_byte(0xC000), 0x18);
        cpu.step(&mut mmu);
        // Bit 0 of 0x18 is clear, so Z is set, H always set by BIT
        let (z, n, h, _) = flags(&cpu);
        assert!(z && !n && h);
    }

    #[test]
    fn rl_through_carry() {
        let (mut cpu, _) = test_system(&[]);
        let mut v = cpu.rl(0b0110_0101);
        assert_eq!(v, 0b1100_1010);
        assert!(!cpu.reg.get_flag(Flag::C));
        v = cpu.rl(v);
        assert_eq!(v, 0b1001_0100);
        assert!(cpu.reg.get_flag(Flag::C));
        v = cpu.rl(v);
        assert_eq!(v, 0b0010_1001);
        assert!(cpu.reg.get_flag(Flag::C));
    }

    #[test]
    fn unknown_opcode_is_nop() {
        let (mut cpu, mut mmu) = test_system(&[0xD3]);
        cpu.step(&mut mmu);
        assert_eq!(cpu.reg.pc, 0x0001);
        assert_eq!(cpu.reg.f, 0x00);
    }
}

//! Encoders for the instructions the code generator synthesizes.
//!
//! Storage-relative operands always use the `mod=10` form with a 32-bit
//! displacement so that every sequence has a fixed length regardless of the
//! slot offset. Link fields (rel32 targets, RIP-relative and absolute
//! displacements) are always the last four bytes of the instruction.
//!
//! General memory operands copied from an original instruction are encoded
//! through [`iced_x86::Encoder`].

use iced_x86::{Code, Encoder, Instruction, MemoryOperand, Register};

use crate::arch::{Arch, Gpr};
use crate::error::{Error, Result};

const MOD_DISP32: u8 = 0b10;
const MOD_REG: u8 = 0b11;
const RM_SIB: u8 = 0b100;
const RM_RIP: u8 = 0b101;

fn modrm(md: u8, reg: u8, rm: u8) -> u8 {
    (md << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// Instruction builder for one architecture.
#[derive(Clone, Copy, Debug)]
pub struct InsnGen {
    arch: Arch,
}

impl InsnGen {
    pub fn new(arch: Arch) -> Self {
        Self { arch }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// REX prefix, if any bit is needed. Never emitted on x86.
    fn rex(&self, out: &mut Vec<u8>, w: bool, r: bool, x: bool, b: bool) {
        if self.arch == Arch::X86 {
            return;
        }
        let rex = 0x40 | (u8::from(w) << 3) | (u8::from(r) << 2) | (u8::from(x) << 1) | u8::from(b);
        if rex != 0x40 {
            out.push(rex);
        }
    }

    fn wide(&self) -> bool {
        self.arch == Arch::X86_64
    }

    /// `op /reg [base + disp32]`
    fn storage_op(&self, opcode: u8, reg: u8, reg_ext: bool, base: Gpr, disp: i32, w: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        self.rex(&mut out, w, reg_ext, false, base.is_extended());
        out.push(opcode);
        out.push(modrm(MOD_DISP32, reg, base.low3()));
        if base.low3() == RM_SIB {
            out.push(0x24);
        }
        out.extend_from_slice(&disp.to_le_bytes());
        out
    }

    /// `mov [base + disp32], src`
    pub fn store(&self, base: Gpr, disp: i32, src: Gpr) -> Vec<u8> {
        self.storage_op(0x89, src.low3(), src.is_extended(), base, disp, self.wide())
    }

    /// `mov dst, [base + disp32]`
    pub fn load(&self, dst: Gpr, base: Gpr, disp: i32) -> Vec<u8> {
        self.storage_op(0x8B, dst.low3(), dst.is_extended(), base, disp, self.wide())
    }

    /// `mov word ptr [base + disp32], simm32`
    pub fn store_imm(&self, base: Gpr, disp: i32, imm: i32) -> Vec<u8> {
        let mut out = self.storage_op(0xC7, 0, false, base, disp, self.wide());
        out.extend_from_slice(&imm.to_le_bytes());
        out
    }

    /// `push word ptr [base + disp32]`
    pub fn push_mem(&self, base: Gpr, disp: i32) -> Vec<u8> {
        self.storage_op(0xFF, 6, false, base, disp, false)
    }

    /// `pop word ptr [base + disp32]`
    pub fn pop_mem(&self, base: Gpr, disp: i32) -> Vec<u8> {
        self.storage_op(0x8F, 0, false, base, disp, false)
    }

    /// `call [base + disp32]`
    pub fn call_mem(&self, base: Gpr, disp: i32) -> Vec<u8> {
        self.storage_op(0xFF, 2, false, base, disp, false)
    }

    /// `jmp [base + disp32]`
    pub fn jmp_mem(&self, base: Gpr, disp: i32) -> Vec<u8> {
        self.storage_op(0xFF, 4, false, base, disp, false)
    }

    /// `mov dst, src`
    pub fn mov_reg(&self, dst: Gpr, src: Gpr) -> Vec<u8> {
        let mut out = Vec::with_capacity(3);
        self.rex(&mut out, self.wide(), src.is_extended(), false, dst.is_extended());
        out.push(0x89);
        out.push(modrm(MOD_REG, src.low3(), dst.low3()));
        out
    }

    /// `mov dst, imm` with a full word immediate.
    pub fn mov_imm(&self, dst: Gpr, imm: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(10);
        self.rex(&mut out, self.wide(), false, false, dst.is_extended());
        out.push(0xB8 + dst.low3());
        match self.arch {
            Arch::X86_64 => out.extend_from_slice(&imm.to_le_bytes()),
            Arch::X86 => out.extend_from_slice(&(imm as u32).to_le_bytes()),
        }
        out
    }

    /// `test reg, reg`
    pub fn test(&self, reg: Gpr) -> Vec<u8> {
        let mut out = Vec::with_capacity(3);
        let ext = reg.is_extended();
        self.rex(&mut out, self.wide(), ext, false, ext);
        out.push(0x85);
        out.push(modrm(MOD_REG, reg.low3(), reg.low3()));
        out
    }

    pub fn push(&self, reg: Gpr) -> Vec<u8> {
        let mut out = Vec::with_capacity(2);
        self.rex(&mut out, false, false, false, reg.is_extended());
        out.push(0x50 + reg.low3());
        out
    }

    pub fn pop(&self, reg: Gpr) -> Vec<u8> {
        let mut out = Vec::with_capacity(2);
        self.rex(&mut out, false, false, false, reg.is_extended());
        out.push(0x58 + reg.low3());
        out
    }

    pub fn call_rel32(&self) -> Vec<u8> {
        vec![0xE8, 0, 0, 0, 0]
    }

    pub fn jmp_rel32(&self) -> Vec<u8> {
        vec![0xE9, 0, 0, 0, 0]
    }

    /// `jcc rel32` for condition code `cc` (low nibble of the opcode).
    pub fn jcc_rel32(&self, cc: u8) -> Vec<u8> {
        vec![0x0F, 0x80 | (cc & 0x0F), 0, 0, 0, 0]
    }

    pub fn jcc_rel8(&self, cc: u8, rel: i8) -> Vec<u8> {
        vec![0x70 | (cc & 0x0F), rel as u8]
    }

    pub fn ret(&self) -> Vec<u8> {
        vec![0xC3]
    }

    /// `lea dst, [rip + disp32]` (x86-64 only).
    pub fn lea_rip(&self, dst: Gpr) -> Vec<u8> {
        self.rip_op(0x8D, dst)
    }

    /// `mov dst, [rip + disp32]` (x86-64 only).
    pub fn load_rip(&self, dst: Gpr) -> Vec<u8> {
        self.rip_op(0x8B, dst)
    }

    fn rip_op(&self, opcode: u8, dst: Gpr) -> Vec<u8> {
        let mut out = Vec::with_capacity(7);
        self.rex(&mut out, true, dst.is_extended(), false, false);
        out.push(opcode);
        out.push(modrm(0, dst.low3(), RM_RIP));
        out.extend_from_slice(&[0, 0, 0, 0]);
        out
    }

    /// `mov dst, [disp32 + index*word]`, the load half of a table jump.
    pub fn load_table(&self, dst: Gpr, index: Gpr, disp: u32) -> Vec<u8> {
        let scale: u8 = match self.arch {
            Arch::X86_64 => 3,
            Arch::X86 => 2,
        };
        let mut out = Vec::with_capacity(8);
        self.rex(&mut out, self.wide(), dst.is_extended(), index.is_extended(), false);
        out.push(0x8B);
        out.push(modrm(0, dst.low3(), RM_SIB));
        out.push((scale << 6) | (index.low3() << 3) | 0b101);
        out.extend_from_slice(&disp.to_le_bytes());
        out
    }

    /// `lea dst, <memory operand of insn>`
    pub fn lea_operand(&self, dst: Gpr, insn: &Instruction) -> Result<Vec<u8>> {
        let code = match self.arch {
            Arch::X86_64 => Code::Lea_r64_m,
            Arch::X86 => Code::Lea_r32_m,
        };
        self.encode_with_operand(code, dst, insn, Register::None)
    }

    /// `mov dst, <memory operand of insn>`, keeping its segment override.
    pub fn load_operand(&self, dst: Gpr, insn: &Instruction) -> Result<Vec<u8>> {
        let code = match self.arch {
            Arch::X86_64 => Code::Mov_r64_rm64,
            Arch::X86 => Code::Mov_r32_rm32,
        };
        self.encode_with_operand(code, dst, insn, insn.segment_prefix())
    }

    fn encode_with_operand(
        &self,
        code: Code,
        dst: Gpr,
        insn: &Instruction,
        segment: Register,
    ) -> Result<Vec<u8>> {
        let displacement = match self.arch {
            Arch::X86_64 => insn.memory_displacement64() as i64,
            Arch::X86 => insn.memory_displacement32() as i32 as i64,
        };
        let operand = MemoryOperand::new(
            insn.memory_base(),
            insn.memory_index(),
            insn.memory_index_scale(),
            displacement,
            insn.memory_displ_size(),
            false,
            segment,
        );
        let synth = Instruction::with2(code, dst.to_iced(self.arch), operand)
            .map_err(|e| Error::Fatal(format!("cannot build {code:?}: {e}")))?;
        let mut encoder = Encoder::new(self.arch.bitness());
        encoder
            .encode(&synth, 0)
            .map_err(|e| Error::Fatal(format!("cannot encode {code:?}: {e}")))?;
        Ok(encoder.take_buffer())
    }
}

//! Target architecture and general-purpose register model.
//!
//! Registers are tracked by their hardware encoding number (0 = rax .. 15 =
//! r15) so that they can be fed straight into ModRM/SIB/REX fields. Any
//! sub-register reported by the decoder (`al`, `r8d`, ...) is folded into its
//! full-width register first.

use iced_x86::Register;

/// Width of a jmp rel32, the redirect written over each original function.
pub const REDIRECT_SIZE: usize = 5;

/// Byte filling the rest of an original function body after the redirect.
pub const TRAP_FILL: u8 = 0xCC;

/// Instruction set of the instrumented binary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Arch {
    X86,
    X86_64,
}

impl Arch {
    /// Decoder bitness.
    pub fn bitness(self) -> u32 {
        match self {
            Arch::X86 => 32,
            Arch::X86_64 => 64,
        }
    }

    /// Size of a machine word (pointer, jump-table entry, storage slot).
    pub fn word_size(self) -> usize {
        match self {
            Arch::X86 => 4,
            Arch::X86_64 => 8,
        }
    }

    /// Number of addressable general-purpose registers.
    pub fn gpr_count(self) -> usize {
        match self {
            Arch::X86 => 8,
            Arch::X86_64 => 16,
        }
    }

    /// Every general-purpose register, stack pointer included.
    pub fn all_gprs(self) -> RegMask {
        match self {
            Arch::X86 => RegMask(0x00FF),
            Arch::X86_64 => RegMask(0xFFFF),
        }
    }

    /// Registers a callee may clobber without restoring.
    pub fn scratch(self) -> RegMask {
        match self {
            Arch::X86 => RegMask::of(&[Gpr::RAX, Gpr::RCX, Gpr::RDX]),
            Arch::X86_64 => RegMask::of(&[
                Gpr::RAX,
                Gpr::RCX,
                Gpr::RDX,
                Gpr::RSI,
                Gpr::RDI,
                Gpr::R8,
                Gpr::R9,
                Gpr::R10,
                Gpr::R11,
            ]),
        }
    }

    /// Registers eligible to hold the storage pointer for a whole function.
    ///
    /// On x86 `esi`/`edi` are the implicit bases of string instructions and
    /// are never chosen.
    pub fn base_candidates(self) -> RegMask {
        match self {
            Arch::X86 => RegMask::of(&[Gpr::RAX, Gpr::RCX, Gpr::RDX, Gpr::RBX, Gpr::RBP]),
            Arch::X86_64 => self.all_gprs().without(Gpr::RSP),
        }
    }

    /// Maximum number of access slots a single block may fill.
    pub fn max_block_accesses(self) -> usize {
        self.word_size() * 8
    }
}

/// A general-purpose register identified by its encoding number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gpr(u8);

impl Gpr {
    pub const RAX: Gpr = Gpr(0);
    pub const RCX: Gpr = Gpr(1);
    pub const RDX: Gpr = Gpr(2);
    pub const RBX: Gpr = Gpr(3);
    pub const RSP: Gpr = Gpr(4);
    pub const RBP: Gpr = Gpr(5);
    pub const RSI: Gpr = Gpr(6);
    pub const RDI: Gpr = Gpr(7);
    pub const R8: Gpr = Gpr(8);
    pub const R9: Gpr = Gpr(9);
    pub const R10: Gpr = Gpr(10);
    pub const R11: Gpr = Gpr(11);
    pub const R12: Gpr = Gpr(12);
    pub const R13: Gpr = Gpr(13);
    pub const R14: Gpr = Gpr(14);
    pub const R15: Gpr = Gpr(15);

    /// Register with the given encoding number (0..16).
    pub fn new(index: u8) -> Option<Gpr> {
        (index < 16).then_some(Gpr(index))
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Low three bits, as placed in ModRM/SIB/opcode fields.
    pub fn low3(self) -> u8 {
        self.0 & 7
    }

    /// Whether the register needs a REX extension bit (r8..r15).
    pub fn is_extended(self) -> bool {
        self.0 >= 8
    }

    /// Fold any GPR variant reported by the decoder into a `Gpr`.
    pub fn from_iced(reg: Register) -> Option<Gpr> {
        let full = match reg {
            Register::AL | Register::AH | Register::AX | Register::EAX | Register::RAX => Gpr::RAX,
            Register::CL | Register::CH | Register::CX | Register::ECX | Register::RCX => Gpr::RCX,
            Register::DL | Register::DH | Register::DX | Register::EDX | Register::RDX => Gpr::RDX,
            Register::BL | Register::BH | Register::BX | Register::EBX | Register::RBX => Gpr::RBX,
            Register::SPL | Register::SP | Register::ESP | Register::RSP => Gpr::RSP,
            Register::BPL | Register::BP | Register::EBP | Register::RBP => Gpr::RBP,
            Register::SIL | Register::SI | Register::ESI | Register::RSI => Gpr::RSI,
            Register::DIL | Register::DI | Register::EDI | Register::RDI => Gpr::RDI,
            Register::R8L | Register::R8W | Register::R8D | Register::R8 => Gpr::R8,
            Register::R9L | Register::R9W | Register::R9D | Register::R9 => Gpr::R9,
            Register::R10L | Register::R10W | Register::R10D | Register::R10 => Gpr::R10,
            Register::R11L | Register::R11W | Register::R11D | Register::R11 => Gpr::R11,
            Register::R12L | Register::R12W | Register::R12D | Register::R12 => Gpr::R12,
            Register::R13L | Register::R13W | Register::R13D | Register::R13 => Gpr::R13,
            Register::R14L | Register::R14W | Register::R14D | Register::R14 => Gpr::R14,
            Register::R15L | Register::R15W | Register::R15D | Register::R15 => Gpr::R15,
            _ => return None,
        };
        Some(full)
    }

    /// Full-width decoder register for this GPR on the given architecture.
    pub fn to_iced(self, arch: Arch) -> Register {
        const R64: [Register; 16] = [
            Register::RAX,
            Register::RCX,
            Register::RDX,
            Register::RBX,
            Register::RSP,
            Register::RBP,
            Register::RSI,
            Register::RDI,
            Register::R8,
            Register::R9,
            Register::R10,
            Register::R11,
            Register::R12,
            Register::R13,
            Register::R14,
            Register::R15,
        ];
        const R32: [Register; 8] = [
            Register::EAX,
            Register::ECX,
            Register::EDX,
            Register::EBX,
            Register::ESP,
            Register::EBP,
            Register::ESI,
            Register::EDI,
        ];
        match arch {
            Arch::X86_64 => R64[self.index()],
            Arch::X86 => R32[self.index() & 7],
        }
    }

    /// Assembler name of the full-width register.
    pub fn name(self, arch: Arch) -> &'static str {
        const N64: [&str; 16] = [
            "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11",
            "r12", "r13", "r14", "r15",
        ];
        const N32: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];
        match arch {
            Arch::X86_64 => N64[self.index()],
            Arch::X86 => N32[self.index() & 7],
        }
    }
}

/// Set of general-purpose registers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RegMask(pub u16);

impl RegMask {
    pub const EMPTY: RegMask = RegMask(0);

    pub fn of(regs: &[Gpr]) -> Self {
        regs.iter().fold(RegMask::EMPTY, |m, &r| m.with(r))
    }

    pub fn contains(self, reg: Gpr) -> bool {
        self.0 & (1 << reg.0) != 0
    }

    pub fn insert(&mut self, reg: Gpr) {
        self.0 |= 1 << reg.0;
    }

    #[must_use]
    pub fn with(self, reg: Gpr) -> Self {
        RegMask(self.0 | 1 << reg.0)
    }

    #[must_use]
    pub fn without(self, reg: Gpr) -> Self {
        RegMask(self.0 & !(1 << reg.0))
    }

    #[must_use]
    pub fn union(self, other: RegMask) -> Self {
        RegMask(self.0 | other.0)
    }

    #[must_use]
    pub fn difference(self, other: RegMask) -> Self {
        RegMask(self.0 & !other.0)
    }

    pub fn is_superset_of(self, other: RegMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Registers in encoding order.
    pub fn iter(self) -> impl Iterator<Item = Gpr> {
        (0..16u8).filter(move |i| self.0 & (1 << i) != 0).map(Gpr)
    }
}

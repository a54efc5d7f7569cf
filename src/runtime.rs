//! Contract between generated code and the instrumentation runtime.
//!
//! Every instrumented invocation owns a storage block handed out by the
//! entry hook. The base register points at it for the whole function body.
//!
//! ```text
//! regs[gpr_count]   spill slots, one per general-purpose register
//! values[cap]       addresses (or counts) recorded in the current block
//! call_target       target of the pending indirect call
//! jump_target       target of the pending indirect or table jump
//! info              argument of the hook being called
//! ```
//!
//! Hooks receive the storage pointer in `rax` and preserve every register
//! and flag, except the entry hook (in: function key, out: storage or 0) and
//! the exit hook (out: saved `regs[rax]`, storage released).
//!
//! The entry hook hands out zeroed storage and `on_block_end` clears every
//! value slot it consumed. A zero slot therefore means the access it belongs
//! to did not execute, which happens when control leaves a block before its
//! end through a conditional branch.

use iced_x86::{Instruction, InstructionInfoFactory, Mnemonic, OpAccess, OpKind, Register};

use crate::arch::{Arch, Gpr};
use crate::error::{Error, Result};

/// Byte offsets of the storage slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StorageLayout {
    word: usize,
    gprs: usize,
    cap: usize,
}

impl StorageLayout {
    pub fn new(arch: Arch) -> Self {
        Self {
            word: arch.word_size(),
            gprs: arch.gpr_count(),
            cap: arch.max_block_accesses(),
        }
    }

    fn slot(&self, index: usize) -> i32 {
        (index * self.word) as i32
    }

    pub fn reg(&self, reg: Gpr) -> i32 {
        self.slot(reg.index())
    }

    pub fn value(&self, index: usize) -> i32 {
        debug_assert!(index < self.cap);
        self.slot(self.gprs + index)
    }

    pub fn call_target(&self) -> i32 {
        self.slot(self.gprs + self.cap)
    }

    pub fn jump_target(&self) -> i32 {
        self.slot(self.gprs + self.cap + 1)
    }

    pub fn info(&self) -> i32 {
        self.slot(self.gprs + self.cap + 2)
    }

    /// Number of value slots.
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Total size of one storage block in bytes.
    pub fn size(&self) -> usize {
        (self.gprs + self.cap + 3) * self.word
    }
}

/// Addresses of the runtime hooks called from generated code.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HookAddresses {
    pub on_function_entry: u64,
    pub on_function_exit: u64,
    pub on_block_end: u64,
    pub on_call_pre: u64,
    pub on_call_post: u64,
    /// Called before an indirect call; may rewrite `call_target`.
    pub on_indirect_call: u64,
    /// Called before an indirect jump leaves the function.
    pub on_indirect_jump: u64,
}

impl HookAddresses {
    pub fn validate(&self) -> Result<()> {
        let hooks = [
            ("on_function_entry", self.on_function_entry),
            ("on_function_exit", self.on_function_exit),
            ("on_block_end", self.on_block_end),
            ("on_call_pre", self.on_call_pre),
            ("on_call_post", self.on_call_post),
            ("on_indirect_call", self.on_indirect_call),
            ("on_indirect_jump", self.on_indirect_jump),
        ];
        for (name, addr) in hooks {
            if addr == 0 {
                return Err(Error::InvalidConfig(format!("hook {name} has no address")));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Read,
    Write,
    /// Read-modify-write.
    Update,
}

impl AccessKind {
    fn from_op_access(access: OpAccess) -> Option<Self> {
        match access {
            OpAccess::Read | OpAccess::CondRead => Some(AccessKind::Read),
            OpAccess::Write | OpAccess::CondWrite => Some(AccessKind::Write),
            OpAccess::ReadWrite | OpAccess::ReadCondWrite => Some(AccessKind::Update),
            _ => None,
        }
    }
}

/// One recorded memory access, as described to the runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessInfo {
    /// Original address of the accessing instruction.
    pub addr: u64,
    pub kind: AccessKind,
    /// Bytes per element.
    pub size: u32,
    /// Index into `values` holding the accessed address.
    pub slot: usize,
    /// Index into `values` holding the repeat count of a `rep` prefix.
    pub count_slot: Option<usize>,
    /// Implicit `rsi`/`rdi` operand of a string instruction.
    pub string: bool,
    pub locked: bool,
}

/// Static description of one block, passed to `on_block_end` by key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub key: u64,
    /// Original start of the owning function.
    pub function: u64,
    /// Original address of the block's first instruction.
    pub addr: u64,
    pub accesses: Vec<AccessInfo>,
}

/// Where the recorded address comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessSource {
    /// The instruction's explicit memory operand (computed with `lea`).
    Operand,
    /// The implicit string pointer held in a register.
    Register(Gpr),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlannedAccess {
    pub kind: AccessKind,
    pub size: u32,
    pub source: AccessSource,
    pub locked: bool,
}

/// Accesses an instruction will record, in slot order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InsnAccesses {
    pub accesses: Vec<PlannedAccess>,
    /// A trailing slot stores `rcx` before a `rep`-prefixed string op.
    pub rep_count: bool,
}

impl InsnAccesses {
    pub fn slots(&self) -> usize {
        self.accesses.len() + usize::from(self.rep_count)
    }

    pub fn is_empty(&self) -> bool {
        self.accesses.is_empty()
    }
}

fn is_native_base(reg: Register, arch: Arch) -> bool {
    match reg {
        Register::None => true,
        Register::RIP => arch == Arch::X86_64,
        _ => Gpr::from_iced(reg).is_some_and(|g| g.to_iced(arch) == reg),
    }
}

fn string_register(kind: OpKind, arch: Arch) -> Option<Option<Gpr>> {
    let (si, di) = match arch {
        Arch::X86_64 => (OpKind::MemorySegRSI, OpKind::MemoryESRDI),
        Arch::X86 => (OpKind::MemorySegESI, OpKind::MemoryESEDI),
    };
    match kind {
        k if k == si => Some(Some(Gpr::RSI)),
        k if k == di => Some(Some(Gpr::RDI)),
        OpKind::MemorySegSI
        | OpKind::MemorySegESI
        | OpKind::MemorySegRSI
        | OpKind::MemoryESDI
        | OpKind::MemoryESEDI
        | OpKind::MemoryESRDI
        | OpKind::MemorySegDI
        | OpKind::MemorySegEDI
        | OpKind::MemorySegRDI => Some(None),
        _ => None,
    }
}

/// Memory accesses of `insn` worth recording.
///
/// Skipped: operands without a real access (`lea`, `nop`, prefetches),
/// `fs`/`gs` relative operands, non-native address sizes, vector-indexed
/// operands and, unless `record_stack` is set, stack-pointer based operands.
pub fn plan_accesses(
    insn: &Instruction,
    arch: Arch,
    record_stack: bool,
    factory: &mut InstructionInfoFactory,
) -> InsnAccesses {
    let mut planned = InsnAccesses::default();
    if matches!(insn.mnemonic(), Mnemonic::Lea | Mnemonic::Nop) {
        return planned;
    }

    let info = factory.info(insn);
    let locked = insn.has_lock_prefix();
    let size = insn.memory_size().size() as u32;
    let mut string_op = false;

    for op in 0..insn.op_count() {
        let kind = insn.op_kind(op);
        let Some(access) = AccessKind::from_op_access(info.op_access(op)) else {
            continue;
        };

        if kind == OpKind::Memory {
            let base = insn.memory_base();
            let index = insn.memory_index();
            if matches!(insn.memory_segment(), Register::FS | Register::GS)
                || !is_native_base(base, arch)
                || (index != Register::None && !is_native_base(index, arch))
                || (!record_stack && Gpr::from_iced(base) == Some(Gpr::RSP))
            {
                continue;
            }
            planned.accesses.push(PlannedAccess {
                kind: access,
                size,
                source: AccessSource::Operand,
                locked,
            });
        } else if let Some(reg) = string_register(kind, arch) {
            let Some(reg) = reg else {
                continue;
            };
            if matches!(insn.memory_segment(), Register::FS | Register::GS) && reg == Gpr::RSI {
                continue;
            }
            string_op = true;
            planned.accesses.push(PlannedAccess {
                kind: access,
                size,
                source: AccessSource::Register(reg),
                locked,
            });
        }
    }

    planned.rep_count = string_op && (insn.has_rep_prefix() || insn.has_repne_prefix());
    planned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::walker::decode_one;

    fn plan(bytes: &[u8], record_stack: bool) -> InsnAccesses {
        let insn = decode_one(Arch::X86_64, bytes, 0x1000).unwrap();
        plan_accesses(&insn, Arch::X86_64, record_stack, &mut InstructionInfoFactory::new())
    }

    #[test]
    fn test_layout_offsets() {
        let layout = StorageLayout::new(Arch::X86_64);
        assert_eq!(layout.reg(Gpr::RAX), 0);
        assert_eq!(layout.reg(Gpr::R15), 120);
        assert_eq!(layout.value(0), 128);
        assert_eq!(layout.call_target(), 128 + 64 * 8);
        assert_eq!(layout.jump_target(), layout.call_target() + 8);
        assert_eq!(layout.info(), layout.jump_target() + 8);
        assert_eq!(layout.size(), (16 + 64 + 3) * 8);

        let layout32 = StorageLayout::new(Arch::X86);
        assert_eq!(layout32.value(0), 32);
        assert_eq!(layout32.capacity(), 32);
    }

    #[test]
    fn test_hook_validation() {
        assert!(HookAddresses::default().validate().is_err());
        let hooks = HookAddresses {
            on_function_entry: 1,
            on_function_exit: 2,
            on_block_end: 3,
            on_call_pre: 4,
            on_call_post: 5,
            on_indirect_call: 6,
            on_indirect_jump: 7,
        };
        assert!(hooks.validate().is_ok());
    }

    #[test]
    fn test_plain_load_and_store() {
        // mov rax, [rbx+8]
        let load = plan(&[0x48, 0x8B, 0x43, 0x08], false);
        assert_eq!(load.accesses.len(), 1);
        assert_eq!(load.accesses[0].kind, AccessKind::Read);
        assert_eq!(load.accesses[0].size, 8);
        assert_eq!(load.accesses[0].source, AccessSource::Operand);

        // mov [rbx], eax
        let store = plan(&[0x89, 0x03], false);
        assert_eq!(store.accesses[0].kind, AccessKind::Write);
        assert_eq!(store.accesses[0].size, 4);

        // lock add [rdi], eax
        let update = plan(&[0xF0, 0x01, 0x07], false);
        assert_eq!(update.accesses[0].kind, AccessKind::Update);
        assert!(update.accesses[0].locked);
    }

    #[test]
    fn test_skipped_operands() {
        // lea rax, [rbx+8]
        assert!(plan(&[0x48, 0x8D, 0x43, 0x08], false).is_empty());
        // mov rax, gs:[0x28]
        assert!(plan(&[0x65, 0x48, 0x8B, 0x04, 0x25, 0x28, 0, 0, 0], false).is_empty());
        // mov rax, [rsp+8]
        assert!(plan(&[0x48, 0x8B, 0x44, 0x24, 0x08], false).is_empty());
        assert_eq!(plan(&[0x48, 0x8B, 0x44, 0x24, 0x08], true).slots(), 1);
        // push rbx
        assert!(plan(&[0x53], true).is_empty());
        // mov eax, [ebx] (address-size override)
        assert!(plan(&[0x67, 0x8B, 0x03], false).is_empty());
    }

    #[test]
    fn test_string_instructions() {
        // rep movsb
        let movs = plan(&[0xF3, 0xA4], false);
        assert_eq!(movs.accesses.len(), 2);
        assert!(movs.rep_count);
        assert_eq!(movs.slots(), 3);
        let sources: Vec<AccessSource> = movs.accesses.iter().map(|a| a.source).collect();
        assert!(sources.contains(&AccessSource::Register(Gpr::RSI)));
        assert!(sources.contains(&AccessSource::Register(Gpr::RDI)));

        // stosq without rep
        let stos = plan(&[0x48, 0xAB], false);
        assert_eq!(stos.accesses.len(), 1);
        assert_eq!(stos.accesses[0].kind, AccessKind::Write);
        assert!(!stos.rep_count);
    }
}

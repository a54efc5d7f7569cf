//! Code generation.
//!
//! Rewrites an [`Ir`] in place into the instrumented copy of its function.
//! Each reference node gets exactly one role handler; handlers insert
//! synthesized nodes before `first` and after `last` and widen the range.
//!
//! Throughout the body the base register holds the storage pointer and the
//! original value of the base register lives in `regs[base]`. Instructions
//! that use the base register run with the pointer moved to a work register
//! (`L` below) and the original value swapped back in.

use iced_x86::{FlowControl, InstructionInfoFactory, OpKind};
use tracing::{debug, trace};

use crate::analysis::BlockKind;
use crate::arch::{Arch, Gpr, RegMask};
use crate::error::{Error, Result};
use crate::insn_gen::InsnGen;
use crate::ir::{Field, Ir, Node, NodeId, NodeRole};
use crate::ir_builder::link_node;
use crate::regalloc::usage_mask;
use crate::runtime::{plan_accesses, AccessInfo, AccessSource, BlockInfo, HookAddresses, StorageLayout};
use crate::walker::decode_exact;

/// Inputs of [`generate`] besides the IR.
#[derive(Clone, Copy, Debug)]
pub struct CodegenContext<'a> {
    pub hooks: &'a HookAddresses,
    pub base: Gpr,
    pub record_stack: bool,
    /// Key given to the first block description of this function.
    pub first_key: u64,
}

/// Instrument `ir` and describe the blocks whose accesses it reports.
pub fn generate(ir: &mut Ir, ctx: &CodegenContext<'_>) -> Result<Vec<BlockInfo>> {
    let refs = ir.reference_nodes();
    let mut gen = Generator::new(ir, ctx);
    for (pos, &id) in refs.iter().enumerate() {
        gen.enter_block(id);
        gen.handle(id, refs.get(pos + 1).copied())?;
    }
    gen.entry_prologue()?;
    debug!(
        function = format_args!("0x{:X}", gen.ir.func_addr),
        nodes = gen.ir.len(),
        blocks = gen.infos.len(),
        "generated instrumented copy"
    );
    Ok(gen.infos)
}

/// Where the link field of a synthesized instruction points.
#[derive(Clone, Copy, Debug)]
enum Link {
    Absolute(u64),
    Fallback,
    Table(usize),
    Inner(NodeId),
}

struct Generator<'a> {
    ir: &'a mut Ir,
    ctx: &'a CodegenContext<'a>,
    asm: InsnGen,
    layout: StorageLayout,
    factory: InstructionInfoFactory,
    infos: Vec<BlockInfo>,
    next_key: u64,
    block: Option<usize>,
    pending: Vec<AccessInfo>,
    slots_used: usize,
    last_flush: Option<(u64, usize)>,
}

impl<'a> Generator<'a> {
    fn new(ir: &'a mut Ir, ctx: &'a CodegenContext<'a>) -> Self {
        let arch = ir.arch;
        Self {
            ir,
            ctx,
            asm: InsnGen::new(arch),
            layout: StorageLayout::new(arch),
            factory: InstructionInfoFactory::new(),
            infos: Vec::new(),
            next_key: ctx.first_key,
            block: None,
            pending: Vec::new(),
            slots_used: 0,
            last_flush: None,
        }
    }

    fn base(&self) -> Gpr {
        self.ctx.base
    }

    fn synth(&self, bytes: Vec<u8>) -> Result<Node> {
        let insn = decode_exact(self.ir.arch, &bytes, 0)?;
        Ok(Node::synthetic(bytes, insn))
    }

    fn apply_link(node: &mut Node, link: Link) {
        node.field = Some(Field::tail(node.len(), 4));
        match link {
            Link::Absolute(addr) => node.iprel_addr = Some(addr),
            Link::Fallback => node.to_fallback = true,
            Link::Table(index) => node.table_ref = Some(index),
            Link::Inner(dest) => node.dest_inner = Some(dest),
        }
    }

    fn put(&self, out: &mut Vec<Node>, bytes: Vec<u8>) -> Result<()> {
        out.push(self.synth(bytes)?);
        Ok(())
    }

    fn put_linked(&self, out: &mut Vec<Node>, bytes: Vec<u8>, link: Link) -> Result<()> {
        let mut node = self.synth(bytes)?;
        Self::apply_link(&mut node, link);
        out.push(node);
        Ok(())
    }

    /// Replace the bytes of reference node `id`, dropping its old links.
    fn rewrite(&mut self, id: NodeId, bytes: Vec<u8>, link: Option<Link>) -> Result<()> {
        let ip = self.ir.node(id).orig_addr;
        let insn = decode_exact(self.ir.arch, &bytes, ip)?;
        let node = self.ir.node_mut(id);
        node.bytes = bytes;
        node.insn = insn;
        node.iprel_addr = None;
        node.table_ref = None;
        node.to_fallback = false;
        node.dest_inner = None;
        node.field = None;
        if let Some(link) = link {
            Self::apply_link(node, link);
        }
        Ok(())
    }

    fn prepend(&mut self, id: NodeId, nodes: Vec<Node>) {
        let at = self.ir.node(id).first;
        if let Some(first) = self.ir.insert_before(at, nodes) {
            self.ir.node_mut(id).first = first;
        }
    }

    /// Append after `last`; returns the first appended node.
    fn append(&mut self, id: NodeId, nodes: Vec<Node>) -> Option<NodeId> {
        let at = self.ir.node(id).last;
        let last = self.ir.insert_after(at, nodes)?;
        self.ir.node_mut(id).last = last;
        self.ir.node(at).next
    }

    fn temp(&self, exclude: RegMask) -> Result<Gpr> {
        self.ir
            .arch
            .all_gprs()
            .difference(exclude)
            .without(Gpr::RSP)
            .iter()
            .next()
            .ok_or_else(|| Error::Fatal("no temporary register left".into()))
    }

    /// Register that takes over the storage pointer around node `id`.
    fn work_register(&self, id: NodeId, usage: RegMask) -> Result<Gpr> {
        self.ir
            .arch
            .all_gprs()
            .difference(usage)
            .without(self.base())
            .without(Gpr::RSP)
            .iter()
            .next()
            .ok_or_else(|| {
                Error::unsupported(
                    self.ir.node(id).orig_addr,
                    "no free register to hold the storage pointer",
                )
            })
    }

    fn swap_in(&self, out: &mut Vec<Node>, w: Gpr) -> Result<()> {
        let b = self.base();
        self.put(out, self.asm.store(b, self.layout.reg(w), w))?;
        self.put(out, self.asm.mov_reg(w, b))?;
        self.put(out, self.asm.load(b, w, self.layout.reg(b)))
    }

    fn swap_out(&self, out: &mut Vec<Node>, w: Gpr) -> Result<()> {
        let b = self.base();
        self.put(out, self.asm.store(w, self.layout.reg(b), b))?;
        self.put(out, self.asm.mov_reg(b, w))?;
        self.put(out, self.asm.load(w, b, self.layout.reg(w)))
    }

    fn info_imm(&self, value: u64) -> Option<i32> {
        match self.ir.arch {
            Arch::X86 => Some(value as u32 as i32),
            Arch::X86_64 => i32::try_from(value as i64).ok(),
        }
    }

    /// Call `hook` with `rax` = storage (held in `l`) and `info` set.
    fn hook_call(&self, out: &mut Vec<Node>, l: Gpr, hook: u64, info: u64) -> Result<()> {
        let info_slot = self.layout.info();
        let rax_slot = self.layout.reg(Gpr::RAX);

        if l == Gpr::RAX {
            match self.info_imm(info) {
                Some(imm) => self.put(out, self.asm.store_imm(l, info_slot, imm))?,
                None => {
                    let t = self.temp(RegMask::of(&[l, self.base()]))?;
                    self.put(out, self.asm.store(l, self.layout.reg(t), t))?;
                    self.put(out, self.asm.mov_imm(t, info))?;
                    self.put(out, self.asm.store(l, info_slot, t))?;
                    self.put(out, self.asm.load(t, l, self.layout.reg(t)))?;
                }
            }
            return self.put_linked(out, self.asm.call_rel32(), Link::Absolute(hook));
        }

        self.put(out, self.asm.store(l, rax_slot, Gpr::RAX))?;
        match self.info_imm(info) {
            Some(imm) => self.put(out, self.asm.store_imm(l, info_slot, imm))?,
            None => {
                self.put(out, self.asm.mov_imm(Gpr::RAX, info))?;
                self.put(out, self.asm.store(l, info_slot, Gpr::RAX))?;
            }
        }
        self.put(out, self.asm.mov_reg(Gpr::RAX, l))?;
        self.put_linked(out, self.asm.call_rel32(), Link::Absolute(hook))?;
        self.put(out, self.asm.load(Gpr::RAX, Gpr::RAX, rax_slot))
    }

    /// Release the storage and restore the base register.
    fn exit_sequence(&self, out: &mut Vec<Node>) -> Result<()> {
        let b = self.base();
        if b != Gpr::RAX {
            self.put(out, self.asm.store(b, self.layout.reg(Gpr::RAX), Gpr::RAX))?;
            self.put(out, self.asm.mov_reg(Gpr::RAX, b))?;
            self.put(out, self.asm.load(b, Gpr::RAX, self.layout.reg(b)))?;
        }
        self.put_linked(
            out,
            self.asm.call_rel32(),
            Link::Absolute(self.ctx.hooks.on_function_exit),
        )
    }

    fn entry_prologue(&mut self) -> Result<()> {
        let Some(head) = self.ir.head() else {
            return Ok(());
        };
        let b = self.base();
        let mut out = Vec::new();
        self.put(&mut out, self.asm.push(Gpr::RAX))?;
        self.put(&mut out, self.asm.mov_imm(Gpr::RAX, self.ir.func_addr))?;
        self.put_linked(
            &mut out,
            self.asm.call_rel32(),
            Link::Absolute(self.ctx.hooks.on_function_entry),
        )?;
        self.put(&mut out, self.asm.test(Gpr::RAX))?;

        let pop = self.asm.pop(Gpr::RAX);
        let skip = (pop.len() + self.asm.jmp_rel32().len()) as i8;
        // jnz over the fallback diversion
        self.put(&mut out, self.asm.jcc_rel8(0x5, skip))?;
        self.put(&mut out, pop)?;
        self.put_linked(&mut out, self.asm.jmp_rel32(), Link::Fallback)?;

        if b == Gpr::RAX {
            self.put(&mut out, self.asm.pop_mem(Gpr::RAX, self.layout.reg(Gpr::RAX)))?;
        } else {
            self.put(&mut out, self.asm.store(Gpr::RAX, self.layout.reg(b), b))?;
            self.put(&mut out, self.asm.mov_reg(b, Gpr::RAX))?;
            self.put(&mut out, self.asm.pop(Gpr::RAX))?;
        }
        // Not part of the head's range: backward jumps to the start must
        // not allocate a second storage block.
        self.ir.insert_before(head, out);
        Ok(())
    }

    fn enter_block(&mut self, id: NodeId) {
        let block = self.ir.node(id).block;
        if block != self.block {
            self.block = block;
            self.pending.clear();
            self.slots_used = 0;
            self.last_flush = None;
        }
    }

    fn is_last_of_block(&self, id: NodeId) -> bool {
        self.ir
            .node(id)
            .block
            .map(|b| &self.ir.blocks[b])
            .is_some_and(|b| b.last == id && b.kind == BlockKind::Normal)
    }

    /// Key describing the accesses recorded so far in the current block.
    fn flush_key(&mut self) -> Option<u64> {
        if self.pending.is_empty() {
            return None;
        }
        if let Some((key, len)) = self.last_flush {
            if len == self.pending.len() {
                return Some(key);
            }
        }
        let key = self.next_key;
        self.next_key += 1;
        let addr = self
            .block
            .map(|b| self.ir.node(self.ir.blocks[b].first).orig_addr)
            .unwrap_or(self.ir.func_addr);
        self.infos.push(BlockInfo {
            key,
            function: self.ir.func_addr,
            addr,
            accesses: self.pending.clone(),
        });
        self.last_flush = Some((key, self.pending.len()));
        Some(key)
    }

    fn flush(&self, out: &mut Vec<Node>, l: Gpr, key: Option<u64>) -> Result<()> {
        match key {
            Some(key) => self.hook_call(out, l, self.ctx.hooks.on_block_end, key),
            None => Ok(()),
        }
    }

    fn value_slot(&mut self, id: NodeId) -> Result<usize> {
        let slot = self.slots_used;
        if slot >= self.layout.capacity() {
            return Err(Error::Fatal(format!(
                "block at 0x{:X} exceeds the access slot capacity",
                self.ir.node(id).orig_addr
            )));
        }
        self.slots_used += 1;
        Ok(slot)
    }

    /// Store the addresses node `id` is about to access into `values`.
    fn record(&mut self, out: &mut Vec<Node>, id: NodeId, l: Gpr) -> Result<()> {
        let arch = self.ir.arch;
        let node = self.ir.node(id);
        let insn = node.insn;
        let addr = node.orig_addr;
        let planned = plan_accesses(&insn, arch, self.ctx.record_stack, &mut self.factory);
        let first = self.pending.len();

        for access in &planned.accesses {
            let slot = self.value_slot(id)?;
            let value = self.layout.value(slot);
            match access.source {
                AccessSource::Operand => {
                    let t = self.temp(RegMask::of(&[l, self.base()]))?;
                    self.put(out, self.asm.store(l, self.layout.reg(t), t))?;
                    if arch == Arch::X86_64 && insn.is_ip_rel_memory_operand() {
                        self.put_linked(
                            out,
                            self.asm.lea_rip(t),
                            Link::Absolute(insn.ip_rel_memory_address()),
                        )?;
                    } else {
                        self.put(out, self.asm.lea_operand(t, &insn)?)?;
                    }
                    self.put(out, self.asm.store(l, value, t))?;
                    self.put(out, self.asm.load(t, l, self.layout.reg(t)))?;
                }
                AccessSource::Register(reg) => {
                    self.put(out, self.asm.store(l, value, reg))?;
                }
            }
            self.pending.push(AccessInfo {
                addr,
                kind: access.kind,
                size: access.size,
                slot,
                count_slot: None,
                string: matches!(access.source, AccessSource::Register(_)),
                locked: access.locked,
            });
        }

        if planned.rep_count {
            let slot = self.value_slot(id)?;
            self.put(out, self.asm.store(l, self.layout.value(slot), Gpr::RCX))?;
            for info in &mut self.pending[first..] {
                info.count_slot = Some(slot);
            }
        }
        Ok(())
    }

    /// Copy the target of an indirect transfer into the storage slot `dst`.
    fn store_target(&self, out: &mut Vec<Node>, id: NodeId, l: Gpr, dst: i32) -> Result<()> {
        let insn = self.ir.node(id).insn;
        match insn.op0_kind() {
            OpKind::Register => {
                let reg = Gpr::from_iced(insn.op0_register()).ok_or_else(|| {
                    Error::unsupported(self.ir.node(id).orig_addr, "indirect target register")
                })?;
                self.put(out, self.asm.store(l, dst, reg))
            }
            OpKind::Memory => {
                let t = self.temp(RegMask::of(&[l, self.base()]))?;
                self.put(out, self.asm.store(l, self.layout.reg(t), t))?;
                if self.ir.arch == Arch::X86_64 && insn.is_ip_rel_memory_operand() {
                    self.put_linked(
                        out,
                        self.asm.load_rip(t),
                        Link::Absolute(insn.ip_rel_memory_address()),
                    )?;
                } else {
                    self.put(out, self.asm.load_operand(t, &insn)?)?;
                }
                self.put(out, self.asm.store(l, dst, t))?;
                self.put(out, self.asm.load(t, l, self.layout.reg(t)))
            }
            _ => Err(Error::unsupported(
                self.ir.node(id).orig_addr,
                "unexpected indirect transfer operand",
            )),
        }
    }

    fn handle(&mut self, id: NodeId, next_ref: Option<NodeId>) -> Result<()> {
        let role = self.ir.node(id).role;
        trace!(addr = format_args!("0x{:X}", self.ir.node(id).orig_addr), ?role, "codegen");

        let insn = self.ir.node(id).insn;
        if (insn.is_loop() || insn.is_loopcc() || insn.is_jcx_short()) && self.base() == Gpr::RCX {
            return Err(Error::unsupported(
                self.ir.node(id).orig_addr,
                "loop counter is the base register",
            ));
        }

        match role {
            NodeRole::General => self.handle_general(id),
            NodeRole::Exit => self.handle_exit(id, next_ref),
            NodeRole::JumpOutOfBlock => self.handle_jump_out(id, next_ref),
            NodeRole::DirectCall => self.handle_direct_call(id),
            NodeRole::IndirectCall => self.handle_indirect_call(id),
            NodeRole::IndirectJump => self.handle_indirect_jump(id),
            NodeRole::TableJump(table) => self.handle_table_jump(id, table),
            NodeRole::BulkSave => self.handle_bulk_save(id),
            NodeRole::BulkRestore => self.handle_bulk_restore(id),
        }
    }

    /// Work register if node `id` uses the base register.
    fn swap_for(&mut self, id: NodeId) -> Result<Option<Gpr>> {
        let usage = usage_mask(self.ir, id, &mut self.factory)?;
        if usage.contains(self.base()) {
            Ok(Some(self.work_register(id, usage)?))
        } else {
            Ok(None)
        }
    }

    fn trailing_flush(&mut self, id: NodeId, after: &mut Vec<Node>) -> Result<()> {
        if self.is_last_of_block(id) {
            let key = self.flush_key();
            self.flush(after, self.base(), key)?;
        }
        Ok(())
    }

    fn handle_general(&mut self, id: NodeId) -> Result<()> {
        let swap = self.swap_for(id)?;
        let l = swap.unwrap_or(self.base());

        let mut before = Vec::new();
        if let Some(w) = swap {
            self.swap_in(&mut before, w)?;
        }
        self.record(&mut before, id, l)?;

        let mut after = Vec::new();
        if let Some(w) = swap {
            self.swap_out(&mut after, w)?;
        }
        self.trailing_flush(id, &mut after)?;

        self.prepend(id, before);
        self.append(id, after);
        Ok(())
    }

    fn handle_direct_call(&mut self, id: NodeId) -> Result<()> {
        let site = self.ir.node(id).orig_addr;
        let swap = self.swap_for(id)?;
        let l = swap.unwrap_or(self.base());

        let mut before = Vec::new();
        if let Some(w) = swap {
            self.swap_in(&mut before, w)?;
        }
        self.record(&mut before, id, l)?;
        let key = self.flush_key();
        self.flush(&mut before, l, key)?;
        self.hook_call(&mut before, l, self.ctx.hooks.on_call_pre, site)?;

        let mut after = Vec::new();
        self.hook_call(&mut after, l, self.ctx.hooks.on_call_post, site)?;
        if let Some(w) = swap {
            self.swap_out(&mut after, w)?;
        }

        self.prepend(id, before);
        self.append(id, after);
        Ok(())
    }

    fn handle_indirect_call(&mut self, id: NodeId) -> Result<()> {
        let site = self.ir.node(id).orig_addr;
        let swap = self.swap_for(id)?;
        let l = swap.unwrap_or(self.base());

        let mut before = Vec::new();
        if let Some(w) = swap {
            self.swap_in(&mut before, w)?;
        }
        self.record(&mut before, id, l)?;
        self.store_target(&mut before, id, l, self.layout.call_target())?;
        let key = self.flush_key();
        self.flush(&mut before, l, key)?;
        self.hook_call(&mut before, l, self.ctx.hooks.on_indirect_call, site)?;

        let mut after = Vec::new();
        self.hook_call(&mut after, l, self.ctx.hooks.on_call_post, site)?;
        if let Some(w) = swap {
            self.swap_out(&mut after, w)?;
        }

        self.rewrite(id, self.asm.call_mem(l, self.layout.call_target()), None)?;
        self.prepend(id, before);
        self.append(id, after);
        Ok(())
    }

    fn handle_indirect_jump(&mut self, id: NodeId) -> Result<()> {
        let site = self.ir.node(id).orig_addr;
        let swap = self.swap_for(id)?;
        let l = swap.unwrap_or(self.base());
        let target = self.layout.jump_target();

        let mut before = Vec::new();
        if let Some(w) = swap {
            self.swap_in(&mut before, w)?;
        }
        self.record(&mut before, id, l)?;
        self.store_target(&mut before, id, l, target)?;
        let key = self.flush_key();
        self.flush(&mut before, l, key)?;
        self.hook_call(&mut before, l, self.ctx.hooks.on_indirect_jump, site)?;
        self.put(&mut before, self.asm.push_mem(l, target))?;
        if let Some(w) = swap {
            self.swap_out(&mut before, w)?;
        }
        self.exit_sequence(&mut before)?;

        self.rewrite(id, self.asm.ret(), None)?;
        self.prepend(id, before);
        Ok(())
    }

    fn handle_table_jump(&mut self, id: NodeId, table: usize) -> Result<()> {
        let insn = self.ir.node(id).insn;
        let index = Gpr::from_iced(insn.memory_index()).ok_or_else(|| {
            Error::unsupported(self.ir.node(id).orig_addr, "table jump without index register")
        })?;
        let swap = self.swap_for(id)?;
        let l = swap.unwrap_or(self.base());
        let t = self.temp(RegMask::of(&[l, self.base(), index]))?;
        let target = self.layout.jump_target();

        let mut before = Vec::new();
        if let Some(w) = swap {
            self.swap_in(&mut before, w)?;
        }
        self.put(&mut before, self.asm.store(l, self.layout.reg(t), t))?;
        self.put_linked(&mut before, self.asm.load_table(t, index, 0), Link::Table(table))?;
        self.put(&mut before, self.asm.store(l, target, t))?;
        self.put(&mut before, self.asm.load(t, l, self.layout.reg(t)))?;
        if let Some(w) = swap {
            self.swap_out(&mut before, w)?;
        }

        self.rewrite(id, self.asm.jmp_mem(self.base(), target), None)?;
        self.prepend(id, before);
        Ok(())
    }

    /// Offset of register `reg` in a `pushad` frame.
    fn pushad_slot(reg: Gpr) -> i32 {
        (7 - reg.index() as i32) * 4
    }

    fn handle_bulk_save(&mut self, id: NodeId) -> Result<()> {
        let b = self.base();
        let mut after = Vec::new();
        // The frame holds the storage pointer; put the original value there.
        self.put(&mut after, self.asm.push_mem(b, self.layout.reg(b)))?;
        self.put(&mut after, self.asm.pop_mem(Gpr::RSP, Self::pushad_slot(b)))?;
        self.trailing_flush(id, &mut after)?;
        self.append(id, after);
        Ok(())
    }

    fn handle_bulk_restore(&mut self, id: NodeId) -> Result<()> {
        let b = self.base();
        let slot = Self::pushad_slot(b);
        let mut before = Vec::new();
        self.put(&mut before, self.asm.push_mem(Gpr::RSP, slot))?;
        self.put(&mut before, self.asm.pop_mem(b, self.layout.reg(b)))?;
        self.put(&mut before, self.asm.store(Gpr::RSP, slot, b))?;

        let mut after = Vec::new();
        self.trailing_flush(id, &mut after)?;
        self.prepend(id, before);
        self.append(id, after);
        Ok(())
    }

    fn condition_code(&self, id: NodeId) -> u8 {
        let bytes = &self.ir.node(id).bytes;
        bytes[bytes.len() - 5] & 0x0F
    }

    fn fallthrough(next_ref: Option<NodeId>, id: NodeId, ir: &Ir) -> Result<NodeId> {
        next_ref.ok_or_else(|| {
            Error::Fatal(format!(
                "conditional branch at 0x{:X} has no fall-through node",
                ir.node(id).orig_addr
            ))
        })
    }

    /// Make the `jmp short` of a loop group a near jump.
    fn widen_skip(&mut self, id: NodeId) -> Result<NodeId> {
        let skip = self.ir.node(id).next.ok_or_else(|| {
            Error::Fatal("loop expansion lost its skip jump".into())
        })?;
        let bytes = self.asm.jmp_rel32();
        let insn = decode_exact(self.ir.arch, &bytes, 0)?;
        let node = self.ir.node_mut(skip);
        node.field = Some(Field::tail(bytes.len(), 4));
        node.bytes = bytes;
        node.insn = insn;
        Ok(skip)
    }

    /// Insert `taken` on the taken path of conditional branch `id` and
    /// `fall` (if any) on its fall-through path.
    fn split_conditional(
        &mut self,
        id: NodeId,
        next_ref: Option<NodeId>,
        taken: Vec<Node>,
        fall: Vec<Node>,
    ) -> Result<()> {
        let link = link_node(self.ir, id);
        if link != id {
            // loop group: A (to C), B (skip), C (near jump)
            let skip = self.widen_skip(id)?;
            if let Some(first) = self.ir.insert_before(link, taken) {
                self.ir.node_mut(id).dest_inner = Some(first);
            }
            let dest = match self.append(id, fall) {
                Some(first) => first,
                None => Self::fallthrough(next_ref, id, self.ir)?,
            };
            self.ir.node_mut(skip).dest_inner = Some(dest);
            return Ok(());
        }

        let cc = self.condition_code(id);
        self.rewrite(id, self.asm.jcc_rel32(cc ^ 1), None)?;
        self.append(id, taken);
        let dest = match self.append(id, fall) {
            Some(first) => first,
            None => Self::fallthrough(next_ref, id, self.ir)?,
        };
        self.rewrite_link(id, Link::Inner(dest));
        Ok(())
    }

    fn rewrite_link(&mut self, id: NodeId, link: Link) {
        Self::apply_link(self.ir.node_mut(id), link);
    }

    fn handle_exit(&mut self, id: NodeId, next_ref: Option<NodeId>) -> Result<()> {
        let b = self.base();
        let key = self.flush_key();
        let mut exit = Vec::new();
        self.flush(&mut exit, b, key)?;
        self.exit_sequence(&mut exit)?;

        let flow = self.ir.node(id).insn.flow_control();
        let is_group = link_node(self.ir, id) != id;
        if flow != FlowControl::ConditionalBranch && !is_group {
            self.prepend(id, exit);
            return Ok(());
        }

        let mut fall = Vec::new();
        if self.is_last_of_block(id) {
            self.flush(&mut fall, b, key)?;
        }
        if is_group {
            return self.split_conditional(id, next_ref, exit, fall);
        }

        let target = self.ir.node(id).iprel_addr.ok_or_else(|| {
            Error::Fatal("exit branch without an external target".into())
        })?;
        self.put_linked(&mut exit, self.asm.jmp_rel32(), Link::Absolute(target))?;
        self.split_conditional(id, next_ref, exit, fall)
    }

    fn handle_jump_out(&mut self, id: NodeId, next_ref: Option<NodeId>) -> Result<()> {
        let b = self.base();
        let Some(key) = self.flush_key() else {
            return Ok(());
        };
        let mut taken = Vec::new();
        self.flush(&mut taken, b, Some(key))?;

        let flow = self.ir.node(id).insn.flow_control();
        let is_group = link_node(self.ir, id) != id;
        if flow == FlowControl::UnconditionalBranch {
            self.prepend(id, taken);
            return Ok(());
        }

        let mut fall = Vec::new();
        if self.is_last_of_block(id) {
            self.flush(&mut fall, b, Some(key))?;
        }
        if is_group {
            return self.split_conditional(id, next_ref, taken, fall);
        }

        let dest = self.ir.node(id).dest_inner.ok_or_else(|| {
            Error::Fatal("in-function branch without a destination node".into())
        })?;
        self.put_linked(&mut taken, self.asm.jmp_rel32(), Link::Inner(dest))?;
        self.split_conditional(id, next_ref, taken, fall)
    }
}

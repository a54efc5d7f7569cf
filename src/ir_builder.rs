//! IR construction.
//!
//! Turns the analysed bytes of one function into an [`Ir`]: one reference
//! node per instruction, in-function jumps linked to their destination
//! nodes, short branches widened to rel32, jump tables copied as node lists,
//! blocks recomputed with the per-block access cap, and every reference node
//! assigned its [`NodeRole`].

use std::collections::HashMap;
use std::ops::ControlFlow;

use iced_x86::{Code, FlowControl, InstructionInfoFactory, Mnemonic};
use tracing::warn;

use crate::analysis::{destination_of, table_jump_base, BlockKind, Destination};
use crate::arch::Arch;
use crate::catalog::Function;
use crate::error::{Error, Result};
use crate::ir::{Field, Ir, IrBlock, IrJumpTable, Node, NodeId, NodeRole};
use crate::runtime::plan_accesses;
use crate::walker::{decode_exact, walk};

const JMP_REL32: [u8; 5] = [0xE9, 0, 0, 0, 0];

/// Build the IR of `function`.
///
/// `code` holds the function's bytes with trailing padding removed and
/// `function.jump_tables` the tables found by the analyzer.
pub fn build_ir(function: &Function, code: &[u8], arch: Arch, record_stack: bool) -> Result<Ir> {
    let start = function.addr;
    let end = start + code.len() as u64;
    let mut ir = Ir::new(arch, start, code.len());
    let mut by_addr: HashMap<u64, NodeId> = HashMap::new();

    walk(arch, code, start, |d| {
        let insn = &d.insn;
        if insn.is_jmp_far()
            || insn.is_jmp_far_indirect()
            || insn.is_call_far()
            || insn.is_call_far_indirect()
            || matches!(insn.mnemonic(), Mnemonic::Xbegin | Mnemonic::Pusha | Mnemonic::Popa)
        {
            return ControlFlow::Break(Error::unsupported(
                insn.ip(),
                format!("{:?} cannot be relocated", insn.mnemonic()),
            ));
        }

        let mut node = Node::new(d.bytes.to_vec(), *insn, insn.ip());
        let disp = d
            .offsets
            .has_displacement()
            .then(|| Field {
                offset: d.offsets.displacement_offset(),
                size: d.offsets.displacement_size(),
            });

        if arch == Arch::X86_64 && insn.is_ip_rel_memory_operand() {
            let target = insn.ip_rel_memory_address();
            if target >= start && target < end {
                warn!(
                    function = %function.name,
                    addr = format_args!("0x{:X}", insn.ip()),
                    target = format_args!("0x{:X}", target),
                    "rip-relative operand points into its own function"
                );
            }
            node.iprel_addr = Some(target);
            node.field = disp;
        } else if table_jump_base(insn, arch).is_some() {
            node.field = disp;
        }

        let id = ir.push_back(node);
        by_addr.insert(insn.ip(), id);
        ControlFlow::Continue(())
    })?;

    append_fallthrough_exit(&mut ir, end)?;
    link_transfers(&mut ir, &by_addr, start, end)?;
    copy_jump_tables(&mut ir, function, &by_addr)?;
    compute_blocks(&mut ir, record_stack);
    assign_roles(&mut ir);

    Ok(ir)
}

/// Whether execution may continue past the last instruction.
fn falls_through(flow: FlowControl) -> bool {
    matches!(
        flow,
        FlowControl::Next
            | FlowControl::ConditionalBranch
            | FlowControl::Call
            | FlowControl::IndirectCall
            | FlowControl::Interrupt
    )
}

/// Terminate the list with a `jmp rel32` to the original fall-through
/// address so that no path runs off the end of the copy.
fn append_fallthrough_exit(ir: &mut Ir, end: u64) -> Result<()> {
    let Some(&last) = ir.reference_nodes().last() else {
        return Ok(());
    };
    if !falls_through(ir.node(last).insn.flow_control()) {
        return Ok(());
    }
    let insn = decode_exact(ir.arch, &JMP_REL32, end)?;
    let mut node = Node::new(JMP_REL32.to_vec(), insn, end);
    node.iprel_addr = Some(end);
    node.field = Some(Field::tail(JMP_REL32.len(), 4));
    node.block_start = true;
    ir.push_back(node);
    Ok(())
}

/// Resolve direct transfers and widen short branches.
fn link_transfers(
    ir: &mut Ir,
    by_addr: &HashMap<u64, NodeId>,
    start: u64,
    end: u64,
) -> Result<()> {
    let arch = ir.arch;
    let tail = ir.reference_nodes().last().copied();

    for id in ir.reference_nodes() {
        let insn = ir.node(id).insn;
        let ip = insn.ip();
        if ip >= end {
            continue;
        }

        if insn.flow_control() == FlowControl::Call {
            if !insn.is_call_near() {
                continue;
            }
            let target = insn.near_branch_target();
            if target != start && target >= start && target < end {
                return Err(Error::unsupported(ip, "call into the middle of its own function"));
            }
            let len = ir.node(id).len();
            let node = ir.node_mut(id);
            node.iprel_addr = Some(target);
            node.field = Some(Field::tail(len, 4));
            continue;
        }

        let Destination::Addr(target) = destination_of(&insn) else {
            continue;
        };
        let inside = target >= start && target < end;
        let dest = if inside {
            Some(*by_addr.get(&target).ok_or_else(|| {
                Error::Fatal("missing IR node for in-function destination".to_string())
            })?)
        } else {
            None
        };

        if insn.is_loop() || insn.is_loopcc() || insn.is_jcx_short() {
            let next = ir.node(id).next.or(tail.filter(|&t| t != id)).ok_or_else(|| {
                Error::Fatal(format!("no fall-through node after 0x{ip:X}"))
            })?;
            expand_loop(ir, id, dest, target, next)?;
            continue;
        }

        let bytes = if insn.is_jmp_short() {
            JMP_REL32.to_vec()
        } else if insn.is_jcc_short() {
            let cc = ir.node(id).bytes[insn.len() - 2] & 0x0F;
            vec![0x0F, 0x80 | cc, 0, 0, 0, 0]
        } else {
            ir.node(id).bytes.clone()
        };
        let decoded = decode_exact(arch, &bytes, ip)?;

        let node = ir.node_mut(id);
        node.field = Some(Field::tail(bytes.len(), 4));
        node.bytes = bytes;
        node.insn = decoded;
        match dest {
            Some(d) => node.dest_inner = Some(d),
            None => node.iprel_addr = Some(target),
        }
    }

    Ok(())
}

/// `loop dest` becomes `loop L1; jmp short L2; L1: jmp near dest; L2:`.
fn expand_loop(
    ir: &mut Ir,
    id: NodeId,
    dest: Option<NodeId>,
    target: u64,
    next: NodeId,
) -> Result<()> {
    let arch = ir.arch;
    let ip = ir.node(id).orig_addr;
    let mut short = ir.node(id).bytes.clone();
    let len = short.len();
    short[len - 1] = 0x02;

    let skip = vec![0xEB, 0x00];
    let mut skip_node = Node::synthetic(skip.clone(), decode_exact(arch, &skip, 0)?);
    skip_node.dest_inner = Some(next);
    skip_node.field = Some(Field::tail(2, 1));

    let mut near_node = Node::synthetic(JMP_REL32.to_vec(), decode_exact(arch, &JMP_REL32, 0)?);
    near_node.field = Some(Field::tail(JMP_REL32.len(), 4));
    match dest {
        Some(d) => near_node.dest_inner = Some(d),
        None => near_node.iprel_addr = Some(target),
    }

    let near = ir
        .insert_after(id, vec![skip_node, near_node])
        .ok_or_else(|| Error::Fatal("loop expansion inserted nothing".into()))?;

    let decoded = decode_exact(arch, &short, ip)?;
    let node = ir.node_mut(id);
    node.bytes = short;
    node.insn = decoded;
    node.dest_inner = Some(near);
    node.field = Some(Field::tail(len, 1));
    node.last = near;
    Ok(())
}

/// The node carrying the outgoing link of a reference node.
pub(crate) fn link_node(ir: &Ir, id: NodeId) -> NodeId {
    let node = ir.node(id);
    if node.last != id && (node.insn.is_loop() || node.insn.is_loopcc() || node.insn.is_jcx_short())
    {
        node.last
    } else {
        id
    }
}

fn copy_jump_tables(ir: &mut Ir, function: &Function, by_addr: &HashMap<u64, NodeId>) -> Result<()> {
    for table in function.jump_tables.iter().filter(|t| t.num > 0) {
        let mut entries = Vec::with_capacity(table.num);
        for target in &table.targets {
            let id = *by_addr.get(target).ok_or_else(|| {
                Error::Fatal(format!("missing IR node for jump-table entry 0x{target:X}"))
            })?;
            ir.node_mut(id).block_start = true;
            entries.push(id);
        }
        ir.tables.push(IrJumpTable {
            addr: table.addr,
            entries,
        });
    }

    for id in ir.reference_nodes() {
        let Some(addr) = table_jump_base(&ir.node(id).insn, ir.arch) else {
            continue;
        };
        let index = ir
            .tables
            .iter()
            .position(|t| t.addr == addr)
            .ok_or_else(|| Error::unsupported(ir.node(id).orig_addr, "unmeasurable jump table"))?;
        ir.node_mut(id).table_ref = Some(index);
    }

    Ok(())
}

/// Whether the node after `id` must start a block.
fn ends_block(ir: &Ir, id: NodeId) -> bool {
    let node = ir.node(id);
    if node.table_ref.is_some() {
        return true;
    }
    let link = ir.node(link_node(ir, id));
    match destination_of(&node.insn) {
        Destination::None => false,
        Destination::Unknown => true,
        // Leaving the function, or jumping backward.
        Destination::Addr(_) => link
            .dest_inner
            .map_or(true, |d| ir.node(d).orig_addr < node.orig_addr),
    }
}

/// Whether `id` must also start a block: calls, indirect branches and
/// jumps leaving the function. Returns only end one.
fn starts_block(ir: &Ir, id: NodeId) -> bool {
    let node = ir.node(id);
    match destination_of(&node.insn) {
        Destination::None => false,
        Destination::Unknown => node.insn.flow_control() != FlowControl::Return,
        Destination::Addr(_) => ir.node(link_node(ir, id)).dest_inner.is_none(),
    }
}

fn compute_blocks(ir: &mut Ir, record_stack: bool) {
    let refs = ir.reference_nodes();
    let cap = ir.arch.max_block_accesses();
    let mut factory = InstructionInfoFactory::new();

    // Structural block starts.
    for (pos, &id) in refs.iter().enumerate() {
        if pos == 0 || ir.node(id).table_ref.is_some() || starts_block(ir, id) {
            ir.node_mut(id).block_start = true;
        }
        if ends_block(ir, id) {
            if let Some(&next) = refs.get(pos + 1) {
                ir.node_mut(next).block_start = true;
            }
            let link = ir.node(link_node(ir, id));
            if let Some(dest) = link.dest_inner {
                if ir.node(dest).orig_addr < ir.node(id).orig_addr {
                    ir.node_mut(dest).block_start = true;
                    ir.node_mut(id).block_start = true;
                }
            }
        }
    }

    // Access cap, then the block list itself.
    let mut blocks: Vec<IrBlock> = Vec::new();
    for &id in &refs {
        let node = ir.node(id);
        let slots = if node.table_ref.is_some() {
            0
        } else {
            plan_accesses(&node.insn, ir.arch, record_stack, &mut factory).slots()
        };

        let full = blocks.last().is_some_and(|b| b.slots + slots > cap);
        if node.block_start || full || blocks.is_empty() {
            let kind = if node.table_ref.is_some() {
                BlockKind::TableJump
            } else {
                BlockKind::Normal
            };
            blocks.push(IrBlock {
                first: id,
                last: id,
                kind,
                slots: 0,
            });
        }

        let index = blocks.len() - 1;
        let block = &mut blocks[index];
        block.last = id;
        block.slots += slots;

        let node = ir.node_mut(id);
        node.block_start = block.first == id;
        node.block = Some(index);
    }
    ir.blocks = blocks;
}

fn assign_roles(ir: &mut Ir) {
    let refs = ir.reference_nodes();
    let position: HashMap<NodeId, usize> = refs.iter().enumerate().map(|(p, &id)| (id, p)).collect();

    for &id in &refs {
        let node = ir.node(id);
        let insn = node.insn;
        let link = ir.node(link_node(ir, id));

        let role = if let Some(table) = node.table_ref {
            NodeRole::TableJump(table)
        } else if insn.code() == Code::Pushad {
            NodeRole::BulkSave
        } else if insn.code() == Code::Popad {
            NodeRole::BulkRestore
        } else {
            match insn.flow_control() {
                FlowControl::Return => NodeRole::Exit,
                FlowControl::UnconditionalBranch | FlowControl::ConditionalBranch => {
                    match (link.iprel_addr, link.dest_inner) {
                        (Some(_), _) => NodeRole::Exit,
                        (None, Some(dest)) => {
                            let same_block = ir.node(dest).block == node.block;
                            let ahead = position.get(&dest) > position.get(&id);
                            if same_block && ahead {
                                NodeRole::General
                            } else {
                                NodeRole::JumpOutOfBlock
                            }
                        }
                        (None, None) => NodeRole::General,
                    }
                }
                FlowControl::Call if node.iprel_addr.is_some() => NodeRole::DirectCall,
                FlowControl::IndirectCall => NodeRole::IndirectCall,
                FlowControl::IndirectBranch => NodeRole::IndirectJump,
                _ => NodeRole::General,
            }
        };
        ir.node_mut(id).role = role;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::JumpTable;

    const BASE: u64 = 0xFFFF_FFFF_A000_0000;

    fn build(code: &[u8]) -> Result<Ir> {
        let func = Function::new("f", BASE, code.len());
        build_ir(&func, code, Arch::X86_64, false)
    }

    fn roles(ir: &Ir) -> Vec<NodeRole> {
        ir.reference_nodes().iter().map(|&id| ir.node(id).role).collect()
    }

    #[test]
    fn test_forward_jump_links_destination() {
        // jz +2; nop; nop; ret
        let ir = build(&[0x74, 0x02, 0x90, 0x90, 0xC3]).unwrap();
        let refs = ir.reference_nodes();
        assert_eq!(refs.len(), 4);

        let jz = ir.node(refs[0]);
        assert_eq!(jz.bytes, vec![0x0F, 0x84, 0, 0, 0, 0]);
        assert_eq!(jz.dest_inner, Some(refs[3]));
        assert_eq!(jz.field, Some(Field { offset: 2, size: 4 }));
        assert_eq!(ir.blocks.len(), 1);
        assert_eq!(roles(&ir), vec![
            NodeRole::General,
            NodeRole::General,
            NodeRole::General,
            NodeRole::Exit,
        ]);
    }

    #[test]
    fn test_short_branches_leaving_function_are_widened() {
        // test eax, eax; jnz out; jmp out; (data after the function)
        let code = [0x85, 0xC0, 0x75, 0x10, 0xEB, 0x20];
        let ir = build(&code).unwrap();
        for id in ir.iter() {
            let insn = ir.node(id).insn;
            assert!(!insn.is_jcc_short() && !insn.is_jmp_short());
        }
        let refs = ir.reference_nodes();
        assert_eq!(ir.node(refs[1]).iprel_addr, Some(BASE + 4 + 0x10));
        assert_eq!(ir.node(refs[2]).iprel_addr, Some(BASE + 6 + 0x20));
        assert_eq!(ir.node(refs[2]).bytes[0], 0xE9);
        assert_eq!(roles(&ir)[1..], [NodeRole::Exit, NodeRole::Exit]);
    }

    #[test]
    fn test_loop_expansion() {
        // L: dec ecx; loop L; ret
        let code = [0xFF, 0xC9, 0xE2, 0xFC, 0xC3];
        let ir = build(&code).unwrap();
        let refs = ir.reference_nodes();
        let looped = ir.node(refs[1]);
        assert_eq!(looped.bytes, vec![0xE2, 0x02]);

        let skip = ir.node(looped.next.unwrap());
        assert_eq!(skip.bytes, vec![0xEB, 0x00]);
        assert_eq!(skip.dest_inner, Some(refs[2]));

        let near = ir.node(looped.last);
        assert_eq!(near.bytes[0], 0xE9);
        assert_eq!(near.dest_inner, Some(refs[0]));
        assert_eq!(looped.dest_inner, Some(looped.last));

        assert!(ir.node(refs[0]).block_start);
        assert_eq!(roles(&ir)[1], NodeRole::JumpOutOfBlock);
    }

    #[test]
    fn test_recursive_call_is_external() {
        // call <self>; ret
        let code = [0xE8, 0xFB, 0xFF, 0xFF, 0xFF, 0xC3];
        let ir = build(&code).unwrap();
        let call = ir.node(ir.reference_nodes()[0]);
        assert_eq!(call.iprel_addr, Some(BASE));
        assert_eq!(call.role, NodeRole::DirectCall);
    }

    #[test]
    fn test_call_into_middle_is_unsupported() {
        // call +0 (next instruction); ret
        let err = build(&[0xE8, 0x00, 0x00, 0x00, 0x00, 0xC3]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedInstruction { addr: BASE, .. }));
    }

    #[test]
    fn test_jump_into_instruction_is_fatal() {
        // jmp +1 lands inside the mov; mov eax, 1; ret
        let err = build(&[0xEB, 0x01, 0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3]).unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
    }

    #[test]
    fn test_fallthrough_exit_is_appended() {
        // call rel32 as the last instruction
        let ir = build(&[0x31, 0xC0, 0xE8, 0x00, 0x10, 0x00, 0x00]).unwrap();
        let refs = ir.reference_nodes();
        let tail = ir.node(*refs.last().unwrap());
        assert_eq!(tail.orig_addr, BASE + 7);
        assert_eq!(tail.iprel_addr, Some(BASE + 7));
        assert_eq!(tail.role, NodeRole::Exit);
        assert!(tail.block_start);
    }

    #[test]
    fn test_calls_inside_function_start_blocks() {
        // mov eax, 1; call rel32 (outside); ret
        let ir = build(&[0xB8, 0x01, 0x00, 0x00, 0x00, 0xE8, 0x00, 0x10, 0x00, 0x00, 0xC3]).unwrap();
        let refs = ir.reference_nodes();
        let starts: Vec<bool> = refs.iter().map(|&id| ir.node(id).block_start).collect();
        assert_eq!(starts, vec![true, true, true]);
        assert_eq!(ir.blocks.len(), 3);
    }

    #[test]
    fn test_self_jump_keeps_block() {
        // nop; jmp $
        let ir = build(&[0x90, 0xEB, 0xFE]).unwrap();
        assert_eq!(ir.blocks.len(), 1);
        let jmp = ir.node(ir.reference_nodes()[1]);
        assert!(!jmp.block_start);
        assert_eq!(jmp.dest_inner, Some(ir.reference_nodes()[1]));
    }

    #[test]
    fn test_bulk_register_roles() {
        // pushad; popad; ret
        let code = [0x60, 0x61, 0xC3];
        let func = Function::new("f", 0xC800_0000, code.len());
        let ir = build_ir(&func, &code, Arch::X86, false).unwrap();
        assert_eq!(roles(&ir), vec![NodeRole::BulkSave, NodeRole::BulkRestore, NodeRole::Exit]);
    }

    #[test]
    fn test_word_sized_pusha_is_unsupported() {
        // pushaw; ret
        let code = [0x66, 0x60, 0xC3];
        let func = Function::new("f", 0xC800_0000, code.len());
        let err = build_ir(&func, &code, Arch::X86, false).unwrap_err();
        assert!(matches!(err, Error::UnsupportedInstruction { addr: 0xC800_0000, .. }));
    }

    #[test]
    fn test_rip_reference_into_own_function_is_kept() {
        // lea rax, [rip - 7] (the lea itself); ret
        let ir = build(&[0x48, 0x8D, 0x05, 0xF9, 0xFF, 0xFF, 0xFF, 0xC3]).unwrap();
        let lea = ir.node(ir.reference_nodes()[0]);
        assert_eq!(lea.iprel_addr, Some(BASE));
        assert_eq!(lea.field, Some(Field { offset: 3, size: 4 }));
    }

    #[test]
    fn test_rip_relative_operand() {
        // mov rax, [rip+0x100]; ret
        let ir = build(&[0x48, 0x8B, 0x05, 0x00, 0x01, 0x00, 0x00, 0xC3]).unwrap();
        let load = ir.node(ir.reference_nodes()[0]);
        assert_eq!(load.iprel_addr, Some(BASE + 7 + 0x100));
        assert_eq!(load.field, Some(Field { offset: 3, size: 4 }));
    }

    #[test]
    fn test_jump_table_copy() {
        let disp = ((BASE + 0x1000) as u32).to_le_bytes();
        let mut code = vec![0xFF, 0x24, 0xC5, disp[0], disp[1], disp[2], disp[3]];
        for value in 1u8..=3 {
            code.extend_from_slice(&[0xB8, value, 0, 0, 0, 0xC3]);
        }
        let mut func = Function::new("f", BASE, code.len());
        func.jump_tables.push(JumpTable {
            addr: BASE + 0x1000,
            num: 3,
            referrer: BASE,
            targets: vec![BASE + 7, BASE + 13, BASE + 19],
        });

        let ir = build_ir(&func, &code, Arch::X86_64, false).unwrap();
        assert_eq!(ir.tables.len(), 1);
        let refs = ir.reference_nodes();
        assert_eq!(ir.tables[0].entries, vec![refs[1], refs[3], refs[5]]);
        for &entry in &ir.tables[0].entries {
            assert!(ir.node(entry).block_start);
        }
        assert_eq!(ir.node(refs[0]).role, NodeRole::TableJump(0));
        assert_eq!(ir.blocks[0].kind, BlockKind::TableJump);
        assert_eq!(ir.blocks.len(), 4);
    }

    #[test]
    fn test_access_cap_splits_blocks() {
        // 70 x mov [rbx], eax; ret
        let mut code = Vec::new();
        for _ in 0..70 {
            code.extend_from_slice(&[0x89, 0x03]);
        }
        code.push(0xC3);
        let ir = build(&code).unwrap();
        assert_eq!(ir.blocks.len(), 2);
        assert_eq!(ir.blocks[0].slots, 64);
        assert_eq!(ir.blocks[1].slots, 6);
    }
}

//! Block and jump-table analysis.
//!
//! One forward walk over a function classifies every control transfer and
//! collects block breakpoints:
//!
//! * a transfer with an unknown destination (calls, indirect branches) or a
//!   destination outside the function is a block of its own;
//! * a return ends a block;
//! * a backward jump inside the function starts blocks at its destination
//!   and at itself, and ends one after itself;
//! * a `jmp [table + reg*word]` is a block of its own, and every entry of the
//!   referenced table starts a block.
//!
//! Forward jumps inside the function never split blocks.
//!
//! Table length is a heuristic: entries are read until the first one that
//! does not point into the function or the containing section ends.

use std::collections::BTreeSet;
use std::ops::ControlFlow;

use iced_x86::{FlowControl, Instruction, Mnemonic, OpKind, Register};

use crate::arch::{Arch, Gpr};
use crate::catalog::{Function, ModuleInfo};
use crate::error::{Error, Result};
use crate::memory::{read_word, TargetMemory};
use crate::walker::walk_prefix;

/// Where a control transfer may go.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Destination {
    /// Falls through to the next instruction.
    None,
    /// Direct branch to a known address.
    Addr(u64),
    /// Calls, returns, interrupts, indirect and far transfers.
    Unknown,
}

/// Classify the control transfer performed by `insn`.
pub fn destination_of(insn: &Instruction) -> Destination {
    match insn.flow_control() {
        FlowControl::Next => Destination::None,
        FlowControl::UnconditionalBranch | FlowControl::ConditionalBranch => {
            match insn.op0_kind() {
                OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                    Destination::Addr(insn.near_branch_target())
                }
                _ => Destination::Unknown,
            }
        }
        _ => Destination::Unknown,
    }
}

/// Table address of a `jmp [disp32 + reg*word]` instruction.
pub fn table_jump_base(insn: &Instruction, arch: Arch) -> Option<u64> {
    if insn.mnemonic() != Mnemonic::Jmp
        || insn.op0_kind() != OpKind::Memory
        || insn.memory_base() != Register::None
        || insn.memory_index_scale() as usize != arch.word_size()
        || matches!(insn.memory_segment(), Register::FS | Register::GS)
    {
        return None;
    }
    let index = Gpr::from_iced(insn.memory_index())?;
    if index.to_iced(arch) != insn.memory_index() {
        return None;
    }
    match arch {
        Arch::X86_64 => Some(insn.memory_displacement64()),
        Arch::X86 => Some(insn.memory_displacement32() as u64),
    }
}

/// Special blocks are fully determined by their last instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
    Normal,
    /// A single `jmp [table + reg*word]`.
    TableJump,
}

/// Half-open range of function offsets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Block {
    pub start: usize,
    pub end: usize,
    pub kind: BlockKind,
}

/// A table of code addresses read by an indirect jump.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JumpTable {
    pub addr: u64,
    pub num: usize,
    /// Address of the jump reading the table.
    pub referrer: u64,
    /// The first `num` entries.
    pub targets: Vec<u64>,
}

impl JumpTable {
    pub fn end(&self, word: usize) -> u64 {
        self.addr + (self.num * word) as u64
    }
}

/// Result of splitting one function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Analysis {
    /// Size with trailing padding removed.
    pub code_size: usize,
    pub blocks: Vec<Block>,
    pub jump_tables: Vec<JumpTable>,
}

#[derive(Clone, Copy, Debug)]
struct Transfer {
    offset: usize,
    end: usize,
    dest: Destination,
    ret: bool,
}

/// Split `function` (whose bytes are `code`) into blocks.
pub fn split_into_blocks(
    function: &Function,
    code: &[u8],
    module: &ModuleInfo,
    mem: &dyn TargetMemory,
    arch: Arch,
) -> Result<Analysis> {
    let trimmed = code.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    if trimmed == 0 {
        return Err(Error::malformed(&function.name, "function consists only of padding"));
    }

    let mut transfers = Vec::new();
    let mut table_refs: Vec<(usize, usize, u64)> = Vec::new();
    let mut code_size = 0;
    let mut last_real: Option<FlowControl> = None;

    walk_prefix(arch, code, function.addr, trimmed, |d| {
        let offset = d.offset_from(function.addr);
        let end = offset + d.bytes.len();
        code_size = end;

        if !matches!(d.insn.mnemonic(), Mnemonic::Nop | Mnemonic::Int3) {
            last_real = Some(d.insn.flow_control());
        }

        if let Some(table) = table_jump_base(&d.insn, arch) {
            table_refs.push((offset, end, table));
            return ControlFlow::Continue(());
        }
        let dest = destination_of(&d.insn);
        if dest != Destination::None {
            let ret = d.insn.flow_control() == FlowControl::Return;
            transfers.push(Transfer { offset, end, dest, ret });
        }
        ControlFlow::Continue(())
    })?;

    if matches!(last_real, None | Some(FlowControl::Next)) {
        return Err(Error::malformed(
            &function.name,
            "last instruction is not a control transfer",
        ));
    }

    let start = function.addr;
    let end = start + code_size as u64;
    let mut breakpoints = BTreeSet::from([0, code_size]);

    for t in &transfers {
        match t.dest {
            Destination::Addr(dest) if dest >= start && dest < end => {
                if dest < start + t.offset as u64 {
                    breakpoints.insert((dest - start) as usize);
                    breakpoints.insert(t.offset);
                    breakpoints.insert(t.end);
                }
            }
            // Returns are terminal and keep the block they end.
            _ if t.ret => {
                breakpoints.insert(t.end);
            }
            _ => {
                breakpoints.insert(t.offset);
                breakpoints.insert(t.end);
            }
        }
    }

    let word = arch.word_size();
    let mut tables = Vec::with_capacity(table_refs.len());
    for &(offset, insn_end, addr) in &table_refs {
        breakpoints.insert(offset);
        breakpoints.insert(insn_end);
        tables.push(measure_table(addr, start + offset as u64, start..end, module, mem, arch)?);
    }

    resolve_overlaps(&mut tables, &function.name, word)?;
    for table in &mut tables {
        table.targets.truncate(table.num);
        breakpoints.extend(table.targets.iter().map(|&t| (t - start) as usize));
    }

    let table_jumps: BTreeSet<usize> = table_refs.iter().map(|&(off, _, _)| off).collect();
    let points: Vec<usize> = breakpoints.into_iter().collect();
    let blocks = points
        .windows(2)
        .map(|w| Block {
            start: w[0],
            end: w[1],
            kind: if table_jumps.contains(&w[0]) {
                BlockKind::TableJump
            } else {
                BlockKind::Normal
            },
        })
        .collect();

    Ok(Analysis {
        code_size,
        blocks,
        jump_tables: tables,
    })
}

/// Count the table entries at `addr` that point into `range`.
fn measure_table(
    addr: u64,
    referrer: u64,
    range: std::ops::Range<u64>,
    module: &ModuleInfo,
    mem: &dyn TargetMemory,
    arch: Arch,
) -> Result<JumpTable> {
    let word = arch.word_size() as u64;
    let mut targets = Vec::new();

    if let Some(section) = module.section_of(addr) {
        let mut entry = addr;
        while entry + word <= section.end() {
            let target = read_word(mem, entry, arch)?;
            if !range.contains(&target) {
                break;
            }
            targets.push(target);
            entry += word;
        }
    }

    Ok(JumpTable {
        addr,
        num: targets.len(),
        referrer,
        targets,
    })
}

/// Make overlapping tables disjoint.
///
/// Tables starting at the same address are duplicates: all but the first
/// discovered one are zeroed. Otherwise overlapping tables must share their
/// end, and the one starting earlier gives up the entries of the later one.
pub fn resolve_overlaps(tables: &mut [JumpTable], function: &str, word: usize) -> Result<()> {
    let mut order: Vec<usize> = (0..tables.len()).collect();
    order.sort_by_key(|&i| tables[i].addr);

    for pair in order.windows(2) {
        if tables[pair[0]].addr == tables[pair[1]].addr {
            tables[pair[1]].num = 0;
        }
    }

    let live: Vec<usize> = order.into_iter().filter(|&i| tables[i].num > 0).collect();
    for pair in live.windows(2) {
        let (early, late) = (pair[0], pair[1]);
        let early_end = tables[early].end(word);
        if early_end <= tables[late].addr {
            continue;
        }
        if early_end != tables[late].end(word) {
            return Err(Error::malformed(
                function,
                format!(
                    "jump tables at 0x{:X} and 0x{:X} overlap without a common end",
                    tables[early].addr, tables[late].addr
                ),
            ));
        }
        tables[early].num -= tables[late].num;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ModuleId, Section};
    use crate::memory::ImageMemory;

    const BASE: u64 = 0xFFFF_FFFF_A000_0000;
    const RODATA: u64 = BASE + 0x1000;

    fn setup(code: &[u8], rodata: &[u8]) -> (Function, ModuleInfo, ImageMemory) {
        let mut mem = ImageMemory::new();
        mem.map(BASE, code.to_vec(), true).unwrap();
        mem.map(RODATA, rodata.to_vec(), false).unwrap();
        let module = ModuleInfo {
            id: ModuleId(7),
            name: "test".into(),
            sections: vec![
                Section { name: ".text".into(), addr: BASE, size: code.len() as u64 },
                Section { name: ".rodata".into(), addr: RODATA, size: rodata.len() as u64 },
            ],
            code_areas: vec![BASE..BASE + code.len() as u64],
        };
        (Function::new("f", BASE, code.len()), module, mem)
    }

    fn analyze(code: &[u8], rodata: &[u8]) -> Result<Analysis> {
        let (func, module, mem) = setup(code, rodata);
        split_into_blocks(&func, code, &module, &mem, Arch::X86_64)
    }

    fn spans(a: &Analysis) -> Vec<(usize, usize)> {
        a.blocks.iter().map(|b| (b.start, b.end)).collect()
    }

    fn table_jump_code() -> Vec<u8> {
        let disp = (RODATA as u32).to_le_bytes();
        let mut code = vec![0xFF, 0x24, 0xC5, disp[0], disp[1], disp[2], disp[3]];
        for value in 1u8..=3 {
            code.extend_from_slice(&[0xB8, value, 0, 0, 0, 0xC3]);
        }
        code
    }

    fn table_rodata(entries: &[u64]) -> Vec<u8> {
        entries.iter().flat_map(|e| e.to_le_bytes()).collect()
    }

    #[test]
    fn test_forward_branch_does_not_split() {
        // jz +2; nop; nop; ret
        let a = analyze(&[0x74, 0x02, 0x90, 0x90, 0xC3], &[0; 8]).unwrap();
        assert_eq!(spans(&a), vec![(0, 5)]);
        assert_eq!(a.blocks[0].kind, BlockKind::Normal);
    }

    #[test]
    fn test_backward_branch_splits() {
        // xor eax,eax; L: inc eax; cmp eax,10; jne L; ret
        let code = [0x31, 0xC0, 0xFF, 0xC0, 0x83, 0xF8, 0x0A, 0x75, 0xF9, 0xC3];
        let a = analyze(&code, &[0; 8]).unwrap();
        assert_eq!(spans(&a), vec![(0, 2), (2, 7), (7, 9), (9, 10)]);
    }

    #[test]
    fn test_calls_end_blocks() {
        // call rel32 (outside); mov eax, 1; ret
        let code = [0xE8, 0x00, 0x10, 0x00, 0x00, 0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3];
        let a = analyze(&code, &[0; 8]).unwrap();
        assert_eq!(spans(&a), vec![(0, 5), (5, 11)]);
    }

    #[test]
    fn test_call_inside_function_is_own_block() {
        // mov eax, 1; call rel32 (outside); ret
        let code = [0xB8, 0x01, 0x00, 0x00, 0x00, 0xE8, 0x00, 0x10, 0x00, 0x00, 0xC3];
        let a = analyze(&code, &[0; 8]).unwrap();
        assert_eq!(spans(&a), vec![(0, 5), (5, 10), (10, 11)]);
    }

    #[test]
    fn test_indirect_jump_is_own_block() {
        // mov eax, 1; jmp rax; ret
        let code = [0xB8, 0x01, 0x00, 0x00, 0x00, 0xFF, 0xE0, 0xC3];
        let a = analyze(&code, &[0; 8]).unwrap();
        assert_eq!(spans(&a), vec![(0, 5), (5, 7), (7, 8)]);
    }

    #[test]
    fn test_self_jump_is_not_backward() {
        // nop; jmp $
        let a = analyze(&[0x90, 0xEB, 0xFE], &[0; 8]).unwrap();
        assert_eq!(spans(&a), vec![(0, 3)]);
    }

    #[test]
    fn test_jump_table_detection() {
        let code = table_jump_code();
        let rodata = table_rodata(&[BASE + 7, BASE + 13, BASE + 19, 0xDEAD_BEEF, BASE + 7]);
        let a = analyze(&code, &rodata).unwrap();

        assert_eq!(a.jump_tables.len(), 1);
        let table = &a.jump_tables[0];
        assert_eq!(table.addr, RODATA);
        assert_eq!(table.num, 3);
        assert_eq!(table.referrer, BASE);
        assert_eq!(table.targets, vec![BASE + 7, BASE + 13, BASE + 19]);

        assert_eq!(spans(&a), vec![(0, 7), (7, 13), (13, 19), (19, 25)]);
        assert_eq!(a.blocks[0].kind, BlockKind::TableJump);
        assert!(a.blocks[1..].iter().all(|b| b.kind == BlockKind::Normal));
    }

    #[test]
    fn test_table_stops_at_section_end() {
        let code = table_jump_code();
        let rodata = table_rodata(&[BASE + 7, BASE + 13]);
        let a = analyze(&code, &rodata).unwrap();
        assert_eq!(a.jump_tables[0].num, 2);
    }

    #[test]
    fn test_tables_stay_inside_data_region() {
        let first = (RODATA as u32).to_le_bytes();
        let second = ((RODATA + 0x18) as u32).to_le_bytes();
        let mut code = vec![0xFF, 0x24, 0xC5, first[0], first[1], first[2], first[3]];
        code.extend_from_slice(&[0xFF, 0x24, 0xC5, second[0], second[1], second[2], second[3]]);
        for value in 1u8..=3 {
            code.extend_from_slice(&[0xB8, value, 0, 0, 0, 0xC3]);
        }
        // The first scan runs on into the second table and must be cut back.
        let rodata = table_rodata(&[BASE + 14, BASE + 20, BASE + 26, BASE + 26, BASE + 20]);
        let a = analyze(&code, &rodata).unwrap();

        let counts: Vec<usize> = a.jump_tables.iter().map(|t| t.num).collect();
        assert_eq!(counts, vec![3, 2]);
        let total: usize = a.jump_tables.iter().map(|t| t.num * 8).sum();
        assert!(total <= rodata.len());
        for table in &a.jump_tables {
            assert!(table.addr >= RODATA);
            assert!(table.end(8) <= RODATA + rodata.len() as u64);
        }
        assert!(a.jump_tables[0].end(8) <= a.jump_tables[1].addr);
    }

    #[test]
    fn test_trailing_padding_is_trimmed() {
        // mov eax, 0x100; ret; padding
        let code = [0xB8, 0x00, 0x01, 0x00, 0x00, 0xC3, 0, 0, 0];
        let a = analyze(&code, &[0; 8]).unwrap();
        assert_eq!(a.code_size, 6);
        assert_eq!(spans(&a), vec![(0, 6)]);
    }

    #[test]
    fn test_trimming_keeps_whole_last_instruction() {
        // nop; jmp rel32 with a zero-heavy displacement
        let code = [0x90, 0xE9, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00];
        let a = analyze(&code, &[0; 8]).unwrap();
        assert_eq!(a.code_size, 6);
    }

    #[test]
    fn test_all_padding_is_malformed() {
        let err = analyze(&[0; 8], &[0; 8]).unwrap_err();
        assert!(matches!(err, Error::MalformedFunction { .. }));
    }

    #[test]
    fn test_fragment_is_malformed() {
        // nop; mov eax, 1
        let err = analyze(&[0x90, 0xB8, 0x01, 0x00, 0x00, 0x00], &[0; 8]).unwrap_err();
        assert!(matches!(err, Error::MalformedFunction { .. }));
    }

    #[test]
    fn test_trailing_int3_padding_is_ignored() {
        let a = analyze(&[0x31, 0xC0, 0xC3, 0xCC, 0xCC, 0xCC], &[0; 8]).unwrap();
        assert_eq!(a.code_size, 6);
    }

    #[test]
    fn test_blocks_cover_function() {
        let code = table_jump_code();
        let rodata = table_rodata(&[BASE + 19, BASE + 7]);
        let a = analyze(&code, &rodata).unwrap();
        let mut pos = 0;
        for block in &a.blocks {
            assert_eq!(block.start, pos);
            assert!(block.end > block.start);
            pos = block.end;
        }
        assert_eq!(pos, a.code_size);
    }

    #[test]
    fn test_analysis_is_idempotent() {
        let code = table_jump_code();
        let rodata = table_rodata(&[BASE + 7, BASE + 13, BASE + 19]);
        let (func, module, mem) = setup(&code, &rodata);
        let first = split_into_blocks(&func, &code, &module, &mem, Arch::X86_64).unwrap();
        let second = split_into_blocks(&func, &code, &module, &mem, Arch::X86_64).unwrap();
        assert_eq!(first, second);
    }

    fn table(addr: u64, num: usize) -> JumpTable {
        JumpTable { addr, num, referrer: 0, targets: vec![0; num] }
    }

    #[test]
    fn test_overlap_shared_tail() {
        let mut tables = vec![table(0x1000, 6), table(0x1010, 4)];
        resolve_overlaps(&mut tables, "f", 8).unwrap();
        assert_eq!(tables[0].num, 2);
        assert_eq!(tables[1].num, 4);
        assert!(tables[0].end(8) <= tables[1].addr);
    }

    #[test]
    fn test_overlap_nested_chain() {
        let mut tables = vec![table(0x1020, 2), table(0x1000, 6), table(0x1010, 4)];
        resolve_overlaps(&mut tables, "f", 8).unwrap();
        assert_eq!(tables.iter().map(|t| t.num).collect::<Vec<_>>(), vec![2, 2, 2]);
    }

    #[test]
    fn test_overlap_same_start_zeroes_later() {
        let mut tables = vec![table(0x1000, 3), table(0x1000, 3)];
        resolve_overlaps(&mut tables, "f", 8).unwrap();
        assert_eq!(tables[0].num, 3);
        assert_eq!(tables[1].num, 0);
    }

    #[test]
    fn test_overlap_without_common_end_is_malformed() {
        let mut tables = vec![table(0x1000, 4), table(0x1010, 4)];
        let err = resolve_overlaps(&mut tables, "f", 8).unwrap_err();
        assert!(matches!(err, Error::MalformedFunction { .. }));
    }
}

//! Stage-1 emission.
//!
//! Lays the node list out into one byte buffer followed by the jump-table
//! copies. Links between nodes are resolved immediately; everything that
//! depends on the final buffer address is encoded against base 0 and
//! recorded as a [`Relocation`] for [`crate::fixup::apply_relocations`].

use tracing::trace;

use crate::error::{Error, Result};
use crate::ir::{Field, Ir, NodeId};

/// How a relocated field is computed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocKind {
    /// 32-bit displacement relative to `next`, the buffer offset of the end
    /// of the instruction holding the field.
    Rel32 { next: usize },
    /// 32-bit absolute address (sign-extended on x86-64).
    Abs32,
    /// Full machine word holding an absolute address.
    Word,
}

/// What a relocated field refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocTarget {
    /// Fixed address outside the buffer.
    Absolute(u64),
    /// Offset inside this image.
    Internal(usize),
    /// Start of the function's fallback copy.
    FallbackEntry,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Relocation {
    /// Buffer offset of the field.
    pub offset: usize,
    pub kind: RelocKind,
    pub target: RelocTarget,
}

/// Serialized function copy, not yet bound to an address.
#[derive(Clone, Debug, Default)]
pub struct CodeImage {
    pub bytes: Vec<u8>,
    pub relocations: Vec<Relocation>,
    /// Size of the code part; jump tables follow it.
    pub code_size: usize,
    /// Buffer offset of each jump table.
    pub table_offsets: Vec<usize>,
}

impl CodeImage {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

fn write_field(bytes: &mut [u8], at: usize, field: Field, value: i64) -> Result<()> {
    let start = at + field.offset;
    match field.size {
        1 => {
            let rel = i8::try_from(value).map_err(|_| {
                Error::Fatal(format!("rel8 displacement {value} at offset 0x{start:X} out of range"))
            })?;
            bytes[start] = rel as u8;
        }
        4 => bytes[start..start + 4].copy_from_slice(&(value as i32).to_le_bytes()),
        size => return Err(Error::Fatal(format!("unsupported field size {size}"))),
    }
    Ok(())
}

/// Serialize `ir`.
pub fn emit(ir: &Ir) -> Result<CodeImage> {
    let word = ir.arch.word_size();
    let mut offsets: Vec<Option<usize>> = vec![None; ir.len()];
    let mut bytes = Vec::new();
    bytes
        .try_reserve(ir.code_size())
        .map_err(|_| Error::OutOfMemory { size: ir.code_size() })?;

    for id in ir.iter() {
        offsets[id] = Some(bytes.len());
        bytes.extend_from_slice(&ir.node(id).bytes);
    }
    let code_size = bytes.len();

    let offset_of = |id: NodeId| -> Result<usize> {
        offsets[ir.node(id).first]
            .ok_or_else(|| Error::Fatal(format!("node {id} is not part of the layout")))
    };

    let mut relocations = Vec::new();
    let mut table_offsets = Vec::with_capacity(ir.tables.len());
    if !ir.tables.is_empty() {
        bytes.resize(code_size.next_multiple_of(word), 0);
    }
    for table in &ir.tables {
        table_offsets.push(bytes.len());
        for &entry in &table.entries {
            let target = offset_of(entry)?;
            relocations.push(Relocation {
                offset: bytes.len(),
                kind: RelocKind::Word,
                target: RelocTarget::Internal(target),
            });
            bytes.extend_from_slice(&(target as u64).to_le_bytes()[..word]);
        }
    }

    for id in ir.iter() {
        let node = ir.node(id);
        let Some(field) = node.field else {
            continue;
        };
        let at = offsets[id].ok_or_else(|| Error::Fatal("unplaced node".into()))?;
        let next = at + node.len();

        if let Some(dest) = node.dest_inner {
            let value = offset_of(dest)? as i64 - next as i64;
            write_field(&mut bytes, at, field, value)?;
            continue;
        }

        let (kind, target, provisional) = if let Some(addr) = node.iprel_addr {
            let value = addr.wrapping_sub(next as u64) as i64;
            (RelocKind::Rel32 { next }, RelocTarget::Absolute(addr), value)
        } else if let Some(table) = node.table_ref {
            let off = *table_offsets
                .get(table)
                .ok_or_else(|| Error::Fatal(format!("jump table {table} was not emitted")))?;
            (RelocKind::Abs32, RelocTarget::Internal(off), off as i64)
        } else if node.to_fallback {
            (RelocKind::Rel32 { next }, RelocTarget::FallbackEntry, 0)
        } else {
            continue;
        };
        if field.size != 4 {
            return Err(Error::Fatal(format!(
                "relocated field of node {id} is {} bytes",
                field.size
            )));
        }
        write_field(&mut bytes, at, field, provisional)?;
        relocations.push(Relocation {
            offset: at + field.offset,
            kind,
            target,
        });
    }

    trace!(
        function = format_args!("0x{:X}", ir.func_addr),
        size = bytes.len(),
        relocations = relocations.len(),
        "emitted"
    );
    Ok(CodeImage {
        bytes,
        relocations,
        code_size,
        table_offsets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;
    use crate::catalog::Function;
    use crate::ir_builder::build_ir;

    const BASE: u64 = 0xFFFF_FFFF_A000_0000;

    fn emit_code(code: &[u8]) -> CodeImage {
        let func = Function::new("f", BASE, code.len());
        let ir = build_ir(&func, code, Arch::X86_64, false).unwrap();
        emit(&ir).unwrap()
    }

    #[test]
    fn test_inner_jump_is_resolved() {
        // jz +2; nop; nop; ret
        let image = emit_code(&[0x74, 0x02, 0x90, 0x90, 0xC3]);
        // jz widened to 6 bytes, target is the ret at offset 8.
        assert_eq!(image.bytes[..6], [0x0F, 0x84, 0x02, 0, 0, 0]);
        assert!(image.relocations.is_empty());
        assert_eq!(image.code_size, 9);
    }

    #[test]
    fn test_external_call_is_relocated() {
        // call rel32; ret
        let image = emit_code(&[0xE8, 0x00, 0x10, 0x00, 0x00, 0xC3]);
        assert_eq!(image.relocations.len(), 1);
        let reloc = image.relocations[0];
        assert_eq!(reloc.offset, 1);
        assert_eq!(reloc.kind, RelocKind::Rel32 { next: 5 });
        assert_eq!(reloc.target, RelocTarget::Absolute(BASE + 0x1005));
    }

    #[test]
    fn test_loop_group_offsets() {
        // L: dec ecx; loop L; ret
        let image = emit_code(&[0xFF, 0xC9, 0xE2, 0xFC, 0xC3]);
        // dec(2) loop(2) jmp short(2) jmp near(5) ret(1)
        assert_eq!(image.bytes[2..6], [0xE2, 0x02, 0xEB, 0x05]);
        let rel = i32::from_le_bytes(image.bytes[7..11].try_into().unwrap());
        assert_eq!(rel, -11);
    }

    #[test]
    fn test_jump_tables_follow_aligned_code() {
        let disp = ((BASE + 0x1000) as u32).to_le_bytes();
        let mut code = vec![0xFF, 0x24, 0xC5, disp[0], disp[1], disp[2], disp[3]];
        for value in 1u8..=2 {
            code.extend_from_slice(&[0xB8, value, 0, 0, 0, 0xC3]);
        }
        let mut func = Function::new("f", BASE, code.len());
        func.jump_tables.push(crate::analysis::JumpTable {
            addr: BASE + 0x1000,
            num: 2,
            referrer: BASE,
            targets: vec![BASE + 7, BASE + 13],
        });
        let ir = build_ir(&func, &code, Arch::X86_64, false).unwrap();
        let image = emit(&ir).unwrap();

        assert_eq!(image.code_size, 19);
        assert_eq!(image.table_offsets, vec![24]);
        assert_eq!(image.len(), 24 + 16);
        assert_eq!(image.bytes[24..32], 7u64.to_le_bytes());
        assert_eq!(image.bytes[32..40], 13u64.to_le_bytes());

        let abs: Vec<_> = image
            .relocations
            .iter()
            .filter(|r| r.kind == RelocKind::Abs32)
            .collect();
        assert_eq!(abs.len(), 1);
        assert_eq!(abs[0].offset, 3);
        assert_eq!(abs[0].target, RelocTarget::Internal(24));
    }
}

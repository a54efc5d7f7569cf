//! Base-register allocation.
//!
//! One general-purpose register is reserved for the whole instrumented copy
//! to hold the storage pointer. The register touched by the fewest
//! instructions wins, because every instruction using it needs a swap
//! sequence around it.

use iced_x86::{FlowControl, InstructionInfoFactory, Mnemonic};
use tracing::debug;

use crate::arch::{Arch, Gpr, RegMask};
use crate::error::{Error, Result};
use crate::ir::{Ir, NodeId};
use crate::ir_builder::link_node;

/// Instructions that may observe or clobber any register.
const FULL_USAGE: [Mnemonic; 11] = [
    Mnemonic::Syscall,
    Mnemonic::Sysenter,
    Mnemonic::Sysexit,
    Mnemonic::Sysret,
    Mnemonic::Int,
    Mnemonic::Int1,
    Mnemonic::Into,
    Mnemonic::Vmcall,
    Mnemonic::Vmmcall,
    Mnemonic::Vmlaunch,
    Mnemonic::Vmresume,
];

fn is_bulk_save_restore(mnemonic: Mnemonic) -> bool {
    matches!(mnemonic, Mnemonic::Pushad | Mnemonic::Popad)
}

/// Registers node `id` uses or may clobber.
///
/// Transfers leaving the function count as using every scratch register.
/// A full mask is only accepted for `pushad`/`popad`.
pub fn usage_mask(ir: &Ir, id: NodeId, factory: &mut InstructionInfoFactory) -> Result<RegMask> {
    let arch = ir.arch;
    let node = ir.node(id);
    let insn = &node.insn;
    let all = arch.all_gprs();

    let mut mask = if FULL_USAGE.contains(&insn.mnemonic()) {
        all
    } else {
        factory
            .info(insn)
            .used_registers()
            .iter()
            .filter_map(|used| Gpr::from_iced(used.register()))
            .fold(RegMask::EMPTY, RegMask::with)
    };

    let leaves = match insn.flow_control() {
        FlowControl::Return => {
            mask.insert(Gpr::RSP);
            false
        }
        FlowControl::Call | FlowControl::IndirectCall | FlowControl::IndirectBranch => {
            node.table_ref.is_none()
        }
        FlowControl::UnconditionalBranch | FlowControl::ConditionalBranch => {
            ir.node(link_node(ir, id)).iprel_addr.is_some()
        }
        _ => false,
    };
    if leaves {
        mask = mask.union(arch.scratch());
    }

    if mask.is_superset_of(all) && !is_bulk_save_restore(insn.mnemonic()) {
        return Err(Error::unsupported(
            node.orig_addr,
            format!("{:?} uses every general-purpose register", insn.mnemonic()),
        ));
    }
    Ok(mask)
}

/// Per-register usage counts over all reference nodes.
pub fn usage_counts(ir: &Ir) -> Result<[u32; 16]> {
    let mut factory = InstructionInfoFactory::new();
    let mut counts = [0u32; 16];
    for id in ir.reference_nodes() {
        for reg in usage_mask(ir, id, &mut factory)?.iter() {
            counts[reg.index()] += 1;
        }
    }
    Ok(counts)
}

/// Pick the storage-pointer register for `ir`.
pub fn choose_base_register(ir: &Ir) -> Result<Gpr> {
    let counts = usage_counts(ir)?;
    let chosen = pick_least_used(&counts, ir.arch)
        .ok_or_else(|| Error::Fatal("no base register candidate".into()))?;
    debug!(
        function = format_args!("0x{:X}", ir.func_addr),
        reg = chosen.name(ir.arch),
        uses = counts[chosen.index()],
        "base register chosen"
    );
    Ok(chosen)
}

fn pick_least_used(counts: &[u32; 16], arch: Arch) -> Option<Gpr> {
    arch.base_candidates()
        .iter()
        .min_by_key(|reg| (counts[reg.index()], reg.index()))
}

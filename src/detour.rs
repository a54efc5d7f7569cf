//! Detour buffer and deployment.
//!
//! All copies of one binary share a single executable buffer. Deployment
//! runs in two phases: every copy is relocated and written into the buffer,
//! and only then are the original entry points overwritten with a redirect.
//! A failure in either phase restores whatever originals were already
//! patched and releases the buffer, so the binary is never left half
//! redirected.

use tracing::{debug, info, warn};

use crate::arch::{Arch, REDIRECT_SIZE, TRAP_FILL};
use crate::catalog::Placement;
use crate::emit::CodeImage;
use crate::error::{Error, Result};
use crate::fixup::{apply_relocations, FixupStats, RelocContext};
use crate::memory::{read_vec, ExecAllocator, TargetMemory};

/// A function with both copies emitted but not yet bound to an address.
#[derive(Clone, Debug)]
pub struct PreparedFunction {
    /// Index into the session's function list.
    pub index: usize,
    pub name: String,
    /// Original start address.
    pub addr: u64,
    /// Original size; everything past the redirect is trap-filled.
    pub size: usize,
    pub instrumented: CodeImage,
    /// Verbatim copy run when the entry hook cannot provide storage.
    pub fallback: CodeImage,
}

/// Buffer offsets assigned to one function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot {
    pub instrumented: usize,
    pub fallback: usize,
}

/// Layout of the detour buffer, one slot per prepared function.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferPlan {
    /// Bytes to allocate.
    pub total: usize,
    pub slots: Vec<Slot>,
}

/// Assign every copy an aligned offset in one buffer.
pub fn plan(prepared: &[PreparedFunction], alignment: usize) -> Result<BufferPlan> {
    if !alignment.is_power_of_two() {
        return Err(Error::InvalidConfig(format!(
            "function alignment {alignment} is not a power of two"
        )));
    }

    let overflow = || Error::OutOfMemory { size: usize::MAX };
    let mut offset = 0usize;
    let mut slots = Vec::with_capacity(prepared.len());
    for func in prepared {
        let instrumented = offset.checked_next_multiple_of(alignment).ok_or_else(overflow)?;
        let fallback = instrumented
            .checked_add(func.instrumented.len())
            .and_then(|end| end.checked_next_multiple_of(alignment))
            .ok_or_else(overflow)?;
        offset = fallback.checked_add(func.fallback.len()).ok_or_else(overflow)?;
        slots.push(Slot { instrumented, fallback });
    }

    Ok(BufferPlan { total: offset, slots })
}

/// The executable buffer holding every copy of one binary.
#[derive(Debug, Default)]
pub struct DetourBuffer {
    addr: Option<u64>,
    size: usize,
}

impl DetourBuffer {
    /// Allocate `size` bytes. Any allocator failure is reported as
    /// [`Error::OutOfMemory`].
    pub fn allocate(alloc: &mut dyn ExecAllocator, size: usize) -> Result<Self> {
        let addr = alloc.allocate(size).map_err(|err| {
            debug!(size, error = %err, "detour buffer allocation failed");
            Error::OutOfMemory { size }
        })?;
        Ok(Self {
            addr: Some(addr),
            size,
        })
    }

    pub fn addr(&self) -> Option<u64> {
        self.addr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Give the buffer back. Later calls are no-ops.
    pub fn release(&mut self, alloc: &mut dyn ExecAllocator) {
        if let Some(addr) = self.addr.take() {
            debug!(addr = format_args!("0x{:X}", addr), size = self.size, "releasing detour buffer");
            alloc.free(Some(addr));
        }
    }
}

/// Where one function ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeployedFunction {
    pub index: usize,
    pub instrumented: Placement,
    pub fallback_addr: u64,
}

/// A successfully deployed binary.
#[derive(Debug, Default)]
pub struct Deployment {
    buffer: DetourBuffer,
    pub functions: Vec<DeployedFunction>,
    pub stats: FixupStats,
}

impl Deployment {
    pub fn buffer(&self) -> &DetourBuffer {
        &self.buffer
    }

    /// Release the detour buffer. The target must no longer run any
    /// redirected code.
    pub fn teardown(&mut self, alloc: &mut dyn ExecAllocator) {
        self.buffer.release(alloc);
    }
}

/// Encode the `jmp rel32` written over an original entry point.
pub fn redirect_bytes(from: u64, to: u64, arch: Arch) -> Result<[u8; REDIRECT_SIZE]> {
    let next = from.wrapping_add(REDIRECT_SIZE as u64);
    let rel = match arch {
        Arch::X86 => to.wrapping_sub(next) as u32,
        Arch::X86_64 => i32::try_from(to.wrapping_sub(next) as i64)
            .map_err(|_| Error::RelocationOutOfRange { offset: 1, target: to })? as u32,
    };
    let mut bytes = [0xE9, 0, 0, 0, 0];
    bytes[1..].copy_from_slice(&rel.to_le_bytes());
    Ok(bytes)
}

/// Place every prepared function into a fresh detour buffer and redirect
/// the originals to it.
///
/// `prepared` and `plan.slots` must correspond one to one. An empty plan
/// allocates nothing.
pub fn deploy(
    prepared: &[PreparedFunction],
    plan: &BufferPlan,
    arch: Arch,
    mem: &mut dyn TargetMemory,
    alloc: &mut dyn ExecAllocator,
) -> Result<Deployment> {
    if prepared.len() != plan.slots.len() {
        return Err(Error::Fatal(format!(
            "buffer plan has {} slots for {} functions",
            plan.slots.len(),
            prepared.len()
        )));
    }
    if prepared.is_empty() {
        return Ok(Deployment::default());
    }

    let mut buffer = DetourBuffer::allocate(alloc, plan.total)?;
    let base = buffer
        .addr()
        .ok_or_else(|| Error::Fatal("detour buffer has no address".into()))?;

    match install(prepared, plan, arch, base, mem) {
        Ok((functions, stats)) => {
            info!(
                functions = functions.len(),
                buffer = format_args!("0x{:X}", base),
                size = plan.total,
                relocations = stats.total(),
                "deployed"
            );
            Ok(Deployment {
                buffer,
                functions,
                stats,
            })
        }
        Err(err) => {
            buffer.release(alloc);
            Err(err)
        }
    }
}

fn install(
    prepared: &[PreparedFunction],
    plan: &BufferPlan,
    arch: Arch,
    base: u64,
    mem: &mut dyn TargetMemory,
) -> Result<(Vec<DeployedFunction>, FixupStats)> {
    let mut stats = FixupStats::default();
    let mut functions = Vec::with_capacity(prepared.len());

    for (func, slot) in prepared.iter().zip(&plan.slots) {
        let code_addr = base + slot.instrumented as u64;
        let fallback_addr = base + slot.fallback as u64;

        let ctx = RelocContext {
            arch,
            base: code_addr,
            fallback: Some(fallback_addr),
        };
        stats.merge(&write_relocated(mem, &func.instrumented, &ctx)?);
        let ctx = RelocContext {
            arch,
            base: fallback_addr,
            fallback: None,
        };
        stats.merge(&write_relocated(mem, &func.fallback, &ctx)?);

        functions.push(DeployedFunction {
            index: func.index,
            instrumented: Placement {
                addr: code_addr,
                size: func.instrumented.len(),
            },
            fallback_addr,
        });
    }

    let mut patched: Vec<(u64, Vec<u8>)> = Vec::with_capacity(prepared.len());
    for (func, deployed) in prepared.iter().zip(&functions) {
        let result = read_vec(mem, func.addr, func.size).and_then(|original| {
            patched.push((func.addr, original));
            redirect(mem, func, deployed.instrumented.addr, arch)
        });
        if let Err(err) = result {
            warn!(function = %func.name, error = %err, "redirect failed, rolling back");
            rollback(mem, &patched);
            return Err(err);
        }
    }

    Ok((functions, stats))
}

fn write_relocated(mem: &mut dyn TargetMemory, image: &CodeImage, ctx: &RelocContext) -> Result<FixupStats> {
    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact(image.len())
        .map_err(|_| Error::OutOfMemory { size: image.len() })?;
    bytes.extend_from_slice(&image.bytes);
    let stats = apply_relocations(&mut bytes, &image.relocations, ctx)?;
    mem.write(ctx.base, &bytes)?;
    Ok(stats)
}

fn redirect(mem: &mut dyn TargetMemory, func: &PreparedFunction, to: u64, arch: Arch) -> Result<()> {
    if func.size < REDIRECT_SIZE {
        return Err(Error::malformed(&func.name, "too short for a redirect"));
    }
    mem.write(func.addr, &redirect_bytes(func.addr, to, arch)?)?;
    if func.size > REDIRECT_SIZE {
        let fill = vec![TRAP_FILL; func.size - REDIRECT_SIZE];
        mem.write(func.addr + REDIRECT_SIZE as u64, &fill)?;
    }
    debug!(
        function = %func.name,
        from = format_args!("0x{:X}", func.addr),
        to = format_args!("0x{:X}", to),
        "redirected"
    );
    Ok(())
}

/// Put back saved originals, newest first.
fn rollback(mem: &mut dyn TargetMemory, patched: &[(u64, Vec<u8>)]) {
    for (addr, original) in patched.iter().rev() {
        if let Err(err) = mem.write(*addr, original) {
            warn!(addr = format_args!("0x{:X}", addr), error = %err, "failed to restore original code");
        }
    }
    info!(restored = patched.len(), "rolled back redirects");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::{RelocKind, RelocTarget, Relocation};
    use crate::memory::{BumpAllocator, ImageMemory};

    const TEXT: u64 = 0xFFFF_FFFF_A000_0000;
    const ARENA: u64 = 0xFFFF_FFFF_A010_0000;

    /// `jmp` to the fallback entry followed by a `call` out of the buffer.
    fn image() -> CodeImage {
        CodeImage {
            bytes: vec![0xE9, 0, 0, 0, 0, 0xE8, 0, 0, 0, 0, 0xC3],
            relocations: vec![
                Relocation {
                    offset: 1,
                    kind: RelocKind::Rel32 { next: 5 },
                    target: RelocTarget::FallbackEntry,
                },
                Relocation {
                    offset: 6,
                    kind: RelocKind::Rel32 { next: 10 },
                    target: RelocTarget::Absolute(TEXT + 0x80),
                },
            ],
            code_size: 11,
            table_offsets: Vec::new(),
        }
    }

    fn prepared(index: usize, addr: u64, size: usize) -> PreparedFunction {
        PreparedFunction {
            index,
            name: format!("f{index}"),
            addr,
            size,
            instrumented: image(),
            fallback: CodeImage {
                bytes: vec![0x90; size],
                code_size: size,
                ..Default::default()
            },
        }
    }

    fn setup() -> (ImageMemory, BumpAllocator) {
        let mut mem = ImageMemory::new();
        mem.map(TEXT, vec![0x90; 0x100], true).unwrap();
        mem.map_zeroed(ARENA, 0x1000, true).unwrap();
        (mem, BumpAllocator::new(ARENA, 0x1000))
    }

    /// Memory that refuses writes to one address.
    struct FailingMemory {
        inner: ImageMemory,
        fail_at: u64,
    }

    impl TargetMemory for FailingMemory {
        fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
            self.inner.read(addr, buf)
        }

        fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
            if addr == self.fail_at {
                return Err(Error::MemoryAccess { addr, size: bytes.len() });
            }
            self.inner.write(addr, bytes)
        }
    }

    #[test]
    fn test_plan_aligns_every_copy() {
        let funcs = [prepared(0, TEXT, 8), prepared(1, TEXT + 8, 20)];
        let plan = plan(&funcs, 16).unwrap();
        assert_eq!(
            plan.slots,
            vec![
                Slot { instrumented: 0, fallback: 16 },
                Slot { instrumented: 32, fallback: 48 },
            ]
        );
        assert_eq!(plan.total, 68);
        assert!(matches!(super::plan(&funcs, 12), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_redirect_encoding() {
        let bytes = redirect_bytes(TEXT, TEXT + 0x105, Arch::X86_64).unwrap();
        assert_eq!(bytes, [0xE9, 0x00, 0x01, 0x00, 0x00]);
        let err = redirect_bytes(0x1000, 0x7FFF_0000_0000, Arch::X86_64).unwrap_err();
        assert!(matches!(err, Error::RelocationOutOfRange { .. }));
        assert!(redirect_bytes(0x1000, 0xFFFF_0000, Arch::X86).is_ok());
    }

    #[test]
    fn test_deploy_writes_copies_then_redirects() {
        let (mut mem, mut alloc) = setup();
        let funcs = [prepared(0, TEXT, 0x10), prepared(1, TEXT + 0x10, 0x20)];
        let plan = plan(&funcs, 16).unwrap();
        let mut deployment = deploy(&funcs, &plan, Arch::X86_64, &mut mem, &mut alloc).unwrap();

        assert_eq!(deployment.functions.len(), 2);
        assert_eq!(deployment.stats.rel32, 4);
        let first = deployment.functions[0];
        assert_eq!(first.instrumented, Placement { addr: ARENA, size: 11 });
        assert_eq!(first.fallback_addr, ARENA + 16);

        // Instrumented copy jumps to its fallback and calls the original target.
        let copy = mem.bytes(ARENA, 11).unwrap();
        assert_eq!(i32::from_le_bytes(copy[1..5].try_into().unwrap()), 11);
        let call_target = (ARENA + 10).wrapping_add(i32::from_le_bytes(copy[6..10].try_into().unwrap()) as u64);
        assert_eq!(call_target, TEXT + 0x80);

        // Redirect followed by trap fill up to the original size.
        let original = mem.bytes(TEXT, 0x10).unwrap();
        assert_eq!(original[..5], redirect_bytes(TEXT, ARENA, Arch::X86_64).unwrap());
        assert!(original[5..].iter().all(|&b| b == TRAP_FILL));
        assert_eq!(mem.bytes(TEXT + 0x30, 1).unwrap(), vec![0x90]);

        deployment.teardown(&mut alloc);
        deployment.teardown(&mut alloc);
        assert_eq!(alloc.free_count(), 1);
        assert!(alloc.live().is_empty());
    }

    #[test]
    fn test_allocation_failure_leaves_code_untouched() {
        let (mut mem, _) = setup();
        let mut alloc = BumpAllocator::new(ARENA, 8);
        let funcs = [prepared(0, TEXT, 0x10)];
        let plan = plan(&funcs, 16).unwrap();
        let err = deploy(&funcs, &plan, Arch::X86_64, &mut mem, &mut alloc).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory { .. }));
        assert_eq!(mem.write_count(), 0);
    }

    #[test]
    fn test_failed_redirect_rolls_back_earlier_ones() {
        let (inner, mut alloc) = setup();
        let mut mem = FailingMemory {
            inner,
            fail_at: TEXT + 0x40,
        };
        let funcs = [
            prepared(0, TEXT, 0x10),
            prepared(1, TEXT + 0x10, 0x30),
            prepared(2, TEXT + 0x40, 0x10),
        ];
        let plan = plan(&funcs, 16).unwrap();
        let err = deploy(&funcs, &plan, Arch::X86_64, &mut mem, &mut alloc).unwrap_err();

        assert!(matches!(err, Error::MemoryAccess { .. }));
        assert_eq!(mem.inner.bytes(TEXT, 0x50).unwrap(), vec![0x90; 0x50]);
        assert!(alloc.live().is_empty());
        assert_eq!(alloc.free_count(), 1);
    }

    #[test]
    fn test_empty_deployment_allocates_nothing() {
        let (mut mem, mut alloc) = setup();
        let plan = plan(&[], 16).unwrap();
        let mut deployment = deploy(&[], &plan, Arch::X86_64, &mut mem, &mut alloc).unwrap();
        assert!(deployment.buffer().addr().is_none());
        deployment.teardown(&mut alloc);
        assert_eq!(alloc.free_count(), 0);
    }
}

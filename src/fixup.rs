//! Stage-2 relocation.
//!
//! Once a [`CodeImage`](crate::emit::CodeImage) has a final address, every
//! field recorded during emission is rewritten against that address.

use crate::arch::Arch;
use crate::emit::{RelocKind, RelocTarget, Relocation};
use crate::error::{Error, Result};

/// Where the image being relocated ends up.
#[derive(Clone, Copy, Debug)]
pub struct RelocContext {
    pub arch: Arch,
    /// Final address of the image.
    pub base: u64,
    /// Final address of the function's fallback copy, if it has one.
    pub fallback: Option<u64>,
}

/// Statistics about applied relocations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FixupStats {
    /// rel32 branch, call and RIP-relative fields.
    pub rel32: usize,
    /// Absolute jump-table references.
    pub abs32: usize,
    /// Jump-table entries.
    pub words: usize,
}

impl FixupStats {
    /// Total number of relocations applied.
    pub fn total(&self) -> usize {
        self.rel32 + self.abs32 + self.words
    }

    pub fn merge(&mut self, other: &FixupStats) {
        self.rel32 += other.rel32;
        self.abs32 += other.abs32;
        self.words += other.words;
    }
}

fn field<'a>(code: &'a mut [u8], offset: usize, size: usize) -> Result<&'a mut [u8]> {
    code.get_mut(offset..offset + size)
        .ok_or_else(|| Error::Fatal(format!("relocation at 0x{offset:X} lies outside the image")))
}

/// Rewrite every field in `relocs` for an image placed at `ctx.base`.
///
/// # Errors
/// [`Error::RelocationOutOfRange`] when a target cannot be encoded in its
/// field. On x86 rel32 arithmetic wraps, so only absolute fields can fail.
pub fn apply_relocations(code: &mut [u8], relocs: &[Relocation], ctx: &RelocContext) -> Result<FixupStats> {
    let mut stats = FixupStats::default();

    for reloc in relocs {
        let target = match reloc.target {
            RelocTarget::Absolute(addr) => addr,
            RelocTarget::Internal(off) => ctx.base + off as u64,
            RelocTarget::FallbackEntry => ctx
                .fallback
                .ok_or_else(|| Error::Fatal("fallback copy has no address".into()))?,
        };
        let out_of_range = || Error::RelocationOutOfRange {
            offset: reloc.offset,
            target,
        };

        match reloc.kind {
            RelocKind::Rel32 { next } => {
                let from = ctx.base + next as u64;
                let value = match ctx.arch {
                    Arch::X86 => target.wrapping_sub(from) as u32,
                    Arch::X86_64 => {
                        i32::try_from(target.wrapping_sub(from) as i64).map_err(|_| out_of_range())?
                            as u32
                    }
                };
                field(code, reloc.offset, 4)?.copy_from_slice(&value.to_le_bytes());
                stats.rel32 += 1;
            }
            RelocKind::Abs32 => {
                let value = match ctx.arch {
                    Arch::X86 => u32::try_from(target).map_err(|_| out_of_range())?,
                    Arch::X86_64 => i32::try_from(target as i64).map_err(|_| out_of_range())? as u32,
                };
                field(code, reloc.offset, 4)?.copy_from_slice(&value.to_le_bytes());
                stats.abs32 += 1;
            }
            RelocKind::Word => {
                let word = ctx.arch.word_size();
                let bytes = target.to_le_bytes();
                if ctx.arch == Arch::X86 && target > u32::MAX as u64 {
                    return Err(out_of_range());
                }
                field(code, reloc.offset, word)?.copy_from_slice(&bytes[..word]);
                stats.words += 1;
            }
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(arch: Arch, base: u64) -> RelocContext {
        RelocContext {
            arch,
            base,
            fallback: Some(base + 0x100),
        }
    }

    #[test]
    fn test_fixup_stats() {
        let mut stats = FixupStats {
            rel32: 3,
            abs32: 1,
            words: 4,
        };
        assert_eq!(stats.total(), 8);
        stats.merge(&FixupStats {
            rel32: 1,
            ..Default::default()
        });
        assert_eq!(stats.rel32, 4);
    }

    #[test]
    fn test_rel32_against_final_base() {
        let mut code = vec![0xE8, 0, 0, 0, 0];
        let relocs = [Relocation {
            offset: 1,
            kind: RelocKind::Rel32 { next: 5 },
            target: RelocTarget::Absolute(0xFFFF_FFFF_A000_2000),
        }];
        let stats = apply_relocations(&mut code, &relocs, &ctx(Arch::X86_64, 0xFFFF_FFFF_A000_1000))
            .unwrap();
        assert_eq!(stats.rel32, 1);
        assert_eq!(i32::from_le_bytes(code[1..5].try_into().unwrap()), 0x1000 - 5);
    }

    #[test]
    fn test_rel32_out_of_range() {
        let mut code = vec![0xE8, 0, 0, 0, 0];
        let relocs = [Relocation {
            offset: 1,
            kind: RelocKind::Rel32 { next: 5 },
            target: RelocTarget::Absolute(0x1000),
        }];
        let err = apply_relocations(&mut code, &relocs, &ctx(Arch::X86_64, 0x0000_7FFF_0000_0000))
            .unwrap_err();
        assert!(matches!(err, Error::RelocationOutOfRange { offset: 1, .. }));

        // x86 wraps modulo 2^32.
        let ok = apply_relocations(&mut code, &relocs, &ctx(Arch::X86, 0xC000_0000));
        assert!(ok.is_ok());
    }

    #[test]
    fn test_table_entries_and_references() {
        let mut code = vec![0u8; 24];
        let relocs = [
            Relocation {
                offset: 0,
                kind: RelocKind::Abs32,
                target: RelocTarget::Internal(8),
            },
            Relocation {
                offset: 8,
                kind: RelocKind::Word,
                target: RelocTarget::Internal(4),
            },
            Relocation {
                offset: 16,
                kind: RelocKind::Rel32 { next: 20 },
                target: RelocTarget::FallbackEntry,
            },
        ];
        let base = 0xFFFF_FFFF_A000_0000;
        let stats = apply_relocations(&mut code, &relocs, &ctx(Arch::X86_64, base)).unwrap();
        assert_eq!(stats.total(), 3);
        assert_eq!(u32::from_le_bytes(code[0..4].try_into().unwrap()), 0xA000_0008);
        assert_eq!(u64::from_le_bytes(code[8..16].try_into().unwrap()), base + 4);
        assert_eq!(i32::from_le_bytes(code[16..20].try_into().unwrap()), 0x100 - 20);
    }

    #[test]
    fn test_abs32_needs_sign_extension_on_x64() {
        let mut code = vec![0u8; 4];
        let relocs = [Relocation {
            offset: 0,
            kind: RelocKind::Abs32,
            target: RelocTarget::Internal(0),
        }];
        let err = apply_relocations(&mut code, &relocs, &ctx(Arch::X86_64, 0x0000_7FFF_0000_0000))
            .unwrap_err();
        assert!(matches!(err, Error::RelocationOutOfRange { .. }));
    }

    #[test]
    fn test_missing_fallback_is_fatal() {
        let mut code = vec![0u8; 4];
        let relocs = [Relocation {
            offset: 0,
            kind: RelocKind::Rel32 { next: 4 },
            target: RelocTarget::FallbackEntry,
        }];
        let context = RelocContext {
            arch: Arch::X86_64,
            base: 0x1000,
            fallback: None,
        };
        assert!(matches!(
            apply_relocations(&mut code, &relocs, &context),
            Err(Error::Fatal(_))
        ));
    }
}

//! Instruction walker.
//!
//! Thin wrapper around the iced decoder that every other stage uses to look
//! at machine code. The walker never mutates the stream and owns no memory.

use std::ops::ControlFlow;

use iced_x86::{ConstantOffsets, Decoder, DecoderOptions, Instruction};

use crate::arch::Arch;
use crate::error::{Error, Result};

/// One decoded instruction together with its bytes.
#[derive(Clone, Debug)]
pub struct Decoded<'a> {
    pub insn: Instruction,
    pub bytes: &'a [u8],
    /// Location of the displacement/immediate fields inside `bytes`.
    pub offsets: ConstantOffsets,
}

impl Decoded<'_> {
    /// Offset of the instruction from the start of the walked range.
    pub fn offset_from(&self, start: u64) -> usize {
        (self.insn.ip() - start) as usize
    }
}

/// Decode `code` (located at `start`) instruction by instruction.
///
/// The visitor may stop the walk early by returning `ControlFlow::Break` with
/// an error, which is handed back to the caller unchanged.
pub fn walk<'a, F>(arch: Arch, code: &'a [u8], start: u64, visitor: F) -> Result<()>
where
    F: FnMut(&Decoded<'a>) -> ControlFlow<Error>,
{
    walk_prefix(arch, code, start, code.len(), visitor)
}

/// Like [`walk`], but only visits instructions starting in the first `limit`
/// bytes. The last visited instruction may extend past `limit`.
pub fn walk_prefix<'a, F>(
    arch: Arch,
    code: &'a [u8],
    start: u64,
    limit: usize,
    mut visitor: F,
) -> Result<()>
where
    F: FnMut(&Decoded<'a>) -> ControlFlow<Error>,
{
    let mut decoder = Decoder::with_ip(arch.bitness(), code, start, DecoderOptions::NONE);
    let mut insn = Instruction::default();

    while decoder.can_decode() && decoder.position() < limit {
        let pos = decoder.position();
        let ip = decoder.ip();
        decoder.decode_out(&mut insn);
        if insn.is_invalid() {
            return Err(Error::Decode { addr: ip });
        }

        let decoded = Decoded {
            insn,
            bytes: &code[pos..pos + insn.len()],
            offsets: decoder.get_constant_offsets(&insn),
        };
        if let ControlFlow::Break(err) = visitor(&decoded) {
            return Err(err);
        }
    }

    Ok(())
}

/// Decode a single instruction from the start of `bytes`.
pub fn decode_one(arch: Arch, bytes: &[u8], ip: u64) -> Result<Instruction> {
    let mut decoder = Decoder::with_ip(arch.bitness(), bytes, ip, DecoderOptions::NONE);
    let insn = decoder.decode();
    if insn.is_invalid() {
        return Err(Error::Decode { addr: ip });
    }
    Ok(insn)
}

/// Decode bytes that are expected to form exactly one instruction.
///
/// Used on every instruction synthesized by the code generator: a length
/// mismatch means the encoder produced garbage.
pub fn decode_exact(arch: Arch, bytes: &[u8], ip: u64) -> Result<Instruction> {
    let insn = decode_one(arch, bytes, ip)?;
    if insn.len() != bytes.len() {
        return Err(Error::Fatal(format!(
            "synthesized instruction {:02X?} decodes to {} bytes",
            bytes,
            insn.len()
        )));
    }
    Ok(insn)
}

/// Offset and size of the memory displacement field of `bytes`, if any.
pub fn displacement_field(arch: Arch, bytes: &[u8], ip: u64) -> Option<(usize, usize)> {
    let mut decoder = Decoder::with_ip(arch.bitness(), bytes, ip, DecoderOptions::NONE);
    let insn = decoder.decode();
    if insn.is_invalid() {
        return None;
    }
    let offsets = decoder.get_constant_offsets(&insn);
    offsets
        .has_displacement()
        .then(|| (offsets.displacement_offset(), offsets.displacement_size()))
}

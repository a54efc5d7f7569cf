//! Debug output.
//!
//! Listings are plain text handed to a [`DebugSink`]. A failing sink never
//! affects instrumentation; the error is logged and dropped.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use iced_x86::{Formatter, NasmFormatter};
use tracing::warn;

use crate::analysis::BlockKind;
use crate::catalog::Function;
use crate::error::Result;
use crate::ir::Ir;
use crate::runtime::BlockInfo;

/// Destination of debug listings.
pub trait DebugSink {
    fn emit(&mut self, bytes: &[u8]) -> io::Result<()>;
}

/// Sink writing to a file.
pub struct FileSink {
    writer: BufWriter<File>,
}

impl FileSink {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl DebugSink for FileSink {
    fn emit(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes)?;
        self.writer.flush()
    }
}

/// Sink collecting everything in memory.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    pub data: Vec<u8>,
}

impl MemorySink {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

impl DebugSink for MemorySink {
    fn emit(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.data.extend_from_slice(bytes);
        Ok(())
    }
}

/// Send `text` to `sink`, logging instead of failing.
pub fn emit_logged(sink: &mut dyn DebugSink, text: &str) {
    if let Err(err) = sink.emit(text.as_bytes()) {
        warn!(error = %err, "debug sink write failed");
    }
}

/// One line per block and jump table of an analysed function.
pub fn format_blocks(function: &Function) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "function {} @ 0x{:X} (0x{:X} bytes)",
        function.name, function.addr, function.size
    );
    for block in &function.blocks {
        let kind = match block.kind {
            BlockKind::Normal => "",
            BlockKind::TableJump => " table-jump",
        };
        let _ = writeln!(
            out,
            "  block 0x{:X}..0x{:X}{}",
            function.addr + block.start as u64,
            function.addr + block.end as u64,
            kind
        );
    }
    for table in &function.jump_tables {
        let _ = writeln!(
            out,
            "  table 0x{:X} x{} (from 0x{:X})",
            table.addr, table.num, table.referrer
        );
    }
    out
}

/// Disassembly of an IR in layout order.
///
/// Reference nodes show their original address, synthesized ones a `+`.
/// Block starts are preceded by a blank line.
pub fn format_ir(ir: &Ir) -> String {
    let mut formatter = NasmFormatter::new();
    let mut out = String::new();
    let mut asm = String::new();

    let _ = writeln!(out, "ir 0x{:X} ({} nodes)", ir.func_addr, ir.len());
    for id in ir.iter() {
        let node = ir.node(id);
        if node.block_start {
            out.push('\n');
        }
        asm.clear();
        formatter.format(&node.insn, &mut asm);
        let origin = if node.is_reference() {
            format!("{:016X}", node.orig_addr)
        } else {
            format!("{:>16}", "+")
        };
        let hex: String = node.bytes.iter().map(|b| format!("{b:02X}")).collect();
        let _ = writeln!(out, "{origin}  {hex:<24} {asm}");
    }
    out
}

/// Block descriptions as seen by the runtime.
pub fn format_block_infos(infos: &[BlockInfo]) -> String {
    let mut out = String::new();
    for info in infos {
        let _ = writeln!(out, "key {} block 0x{:X}", info.key, info.addr);
        for access in &info.accesses {
            let _ = writeln!(
                out,
                "  0x{:X} {:?} size {} slot {}{}{}{}",
                access.addr,
                access.kind,
                access.size,
                access.slot,
                access
                    .count_slot
                    .map(|s| format!(" count {s}"))
                    .unwrap_or_default(),
                if access.string { " string" } else { "" },
                if access.locked { " lock" } else { "" },
            );
        }
    }
    out
}

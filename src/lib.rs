//! # codeweave
//!
//! Dynamic binary instrumentation of compiled x86 and x86-64 functions.
//!
//! ## Overview
//!
//! For every function of a loaded binary, codeweave builds an instrumented
//! copy that reports memory accesses, calls, returns and block boundaries to
//! a runtime, places all copies in one executable detour buffer and
//! overwrites the start of each original function with a jump to its copy:
//!
//! 1. Discover functions and infer their sizes from the symbol table
//! 2. Split each function into blocks and locate its jump tables
//! 3. Build an editable IR and pick a base register for runtime storage
//! 4. Insert instrumentation and emit the copy plus a verbatim fallback
//! 5. Relocate everything into the detour buffer and redirect the originals
//!
//! A function that cannot be instrumented is left alone. A failure that
//! affects the whole binary rolls every redirect back.
//!
//! ## Usage
//!
//! The engine talks to the target only through [`TargetMemory`],
//! [`ExecAllocator`] and [`SymbolSource`]; [`InstrumentationSession`] ties a
//! binary to one init/teardown pair, and [`Instrumentor`] drives sessions
//! from module load and unload events.

#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![allow(clippy::too_many_arguments)]

pub mod analysis;
pub mod arch;
pub mod catalog;
pub mod codegen;
pub mod detour;
pub mod elf;
pub mod emit;
pub mod error;
pub mod fixup;
pub mod insn_gen;
pub mod ir;
pub mod ir_builder;
pub mod memory;
pub mod regalloc;
pub mod runtime;
pub mod session;
pub mod sink;
pub mod walker;

pub use arch::Arch;
pub use catalog::{Function, ModuleId, ModuleInfo, Symbol, SymbolSource};
pub use error::{Error, Result};
pub use memory::{ExecAllocator, TargetMemory};
pub use runtime::{BlockInfo, HookAddresses};
pub use session::{
    InstrumentConfig, InstrumentStats, InstrumentationSession, Instrumentor, ProgressCallback,
    ProgressInfo, ProgressStage,
};

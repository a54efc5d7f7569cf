//! Function catalog.
//!
//! Symbols carry start addresses but no reliable sizes, so function extents
//! are inferred: every function start and every section/code-area end goes
//! into one array, the array is stably sorted by address, and each function
//! extends up to the next item.

use std::ops::{ControlFlow, Range};

use tracing::debug;

use crate::analysis::{Block, JumpTable};
use crate::arch::REDIRECT_SIZE;
use crate::error::{Error, Result};

/// Symbol names that alias the module's entry and exit routines.
const ENTRY_EXIT_ALIASES: [&str; 2] = ["init_module", "cleanup_module"];

/// Identity of a loaded module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ModuleId(pub u64);

/// One named symbol as reported by the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub module: ModuleId,
    pub addr: u64,
}

/// Enumerates every symbol known to the host, across all modules.
pub trait SymbolSource {
    /// Call `visitor` for each symbol until it returns `Break`.
    fn for_each_symbol(&self, visitor: &mut dyn FnMut(&Symbol) -> ControlFlow<()>);
}

impl SymbolSource for [Symbol] {
    fn for_each_symbol(&self, visitor: &mut dyn FnMut(&Symbol) -> ControlFlow<()>) {
        for sym in self {
            if visitor(sym).is_break() {
                break;
            }
        }
    }
}

impl SymbolSource for Vec<Symbol> {
    fn for_each_symbol(&self, visitor: &mut dyn FnMut(&Symbol) -> ControlFlow<()>) {
        self.as_slice().for_each_symbol(visitor)
    }
}

/// A loadable section of the module.
#[derive(Clone, Debug)]
pub struct Section {
    pub name: String,
    pub addr: u64,
    pub size: u64,
}

impl Section {
    pub fn end(&self) -> u64 {
        self.addr + self.size
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.addr && addr < self.end()
    }
}

/// Layout of a loaded module.
#[derive(Clone, Debug)]
pub struct ModuleInfo {
    pub id: ModuleId,
    pub name: String,
    /// Loadable sections, code and data alike.
    pub sections: Vec<Section>,
    /// Executable address ranges.
    pub code_areas: Vec<Range<u64>>,
}

impl ModuleInfo {
    pub fn is_code(&self, addr: u64) -> bool {
        self.code_areas.iter().any(|area| area.contains(&addr))
    }

    /// Section containing `addr`, if any.
    pub fn section_of(&self, addr: u64) -> Option<&Section> {
        self.sections.iter().find(|s| s.contains(addr))
    }
}

/// Final location of an instrumented copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    pub addr: u64,
    pub size: usize,
}

/// A function discovered in the target module.
#[derive(Clone, Debug)]
pub struct Function {
    pub addr: u64,
    /// Distance to the next function or boundary.
    pub size: usize,
    pub name: String,
    /// Blocks from the most recent analysis.
    pub blocks: Vec<Block>,
    /// Jump tables from the most recent analysis.
    pub jump_tables: Vec<JumpTable>,
    /// Instrumented copy, once deployed.
    pub instrumented: Option<Placement>,
    /// Relocated verbatim copy, once deployed.
    pub fallback_addr: Option<u64>,
}

impl Function {
    pub fn new(name: impl Into<String>, addr: u64, size: usize) -> Self {
        Self {
            addr,
            size,
            name: name.into(),
            blocks: Vec::new(),
            jump_tables: Vec::new(),
            instrumented: None,
            fallback_addr: None,
        }
    }

    pub fn end(&self) -> u64 {
        self.addr + self.size as u64
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.addr && addr < self.end()
    }
}

/// Entry of the sort array.
#[derive(Clone, Copy, Debug)]
enum Item {
    Boundary(u64),
    Function(u64, usize),
}

impl Item {
    fn sort_key(&self) -> (u64, u8) {
        match *self {
            Item::Boundary(addr) => (addr, 0),
            Item::Function(addr, _) => (addr, 1),
        }
    }
}

fn try_push<T>(vec: &mut Vec<T>, value: T) -> Result<()> {
    if vec.len() == vec.capacity() {
        vec.try_reserve(vec.len().max(16))
            .map_err(|_| Error::OutOfMemory {
                size: vec.capacity() * std::mem::size_of::<T>(),
            })?;
    }
    vec.push(value);
    Ok(())
}

/// Discover the instrumentable functions of `module`.
///
/// Returns the functions sorted by address. A module without any surviving
/// function yields an empty vector.
pub fn discover(module: &ModuleInfo, symbols: &dyn SymbolSource) -> Result<Vec<Function>> {
    let mut names: Vec<String> = Vec::new();
    let mut items: Vec<Item> = Vec::new();
    let mut failure = None;

    symbols.for_each_symbol(&mut |sym| {
        if sym.module != module.id
            || sym.name.is_empty()
            || ENTRY_EXIT_ALIASES.contains(&sym.name.as_str())
            || !module.is_code(sym.addr)
        {
            return ControlFlow::Continue(());
        }
        let pushed = try_push(&mut items, Item::Function(sym.addr, names.len()))
            .and_then(|_| try_push(&mut names, sym.name.clone()));
        match pushed {
            Ok(()) => ControlFlow::Continue(()),
            Err(err) => {
                failure = Some(err);
                ControlFlow::Break(())
            }
        }
    });
    if let Some(err) = failure {
        return Err(err);
    }

    for section in &module.sections {
        try_push(&mut items, Item::Boundary(section.end()))?;
    }
    for area in &module.code_areas {
        try_push(&mut items, Item::Boundary(area.end))?;
    }

    // Stable: aliases of one address keep their enumeration order, and
    // boundaries come before functions starting at the same address.
    items.sort_by_key(Item::sort_key);

    let mut functions = Vec::new();
    for (i, item) in items.iter().enumerate() {
        let Item::Function(addr, name_idx) = *item else {
            continue;
        };
        let size = items
            .get(i + 1)
            .map_or(0, |next| (next.sort_key().0 - addr) as usize);
        let name = &names[name_idx];

        if size == 0 {
            debug!(name = %name, addr = format_args!("0x{:X}", addr), "skipping alias");
            continue;
        }
        if size < REDIRECT_SIZE {
            debug!(name = %name, size, "function too short for a redirect");
            continue;
        }
        try_push(&mut functions, Function::new(name.clone(), addr, size))?;
    }

    debug!(module = %module.name, count = functions.len(), "functions discovered");
    Ok(functions)
}

//! ELF loading for the offline driver.
//!
//! Linked files are mapped at their own section addresses. Relocatable
//! objects (kernel modules, plain `.o` files) are laid out from a chosen
//! base, their relocations are applied, and every undefined symbol gets a
//! trap-filled stub address so that calls to it still resolve.

use std::collections::HashMap;

use object::{
    Architecture, Object, ObjectKind, ObjectSection, ObjectSymbol, RelocationKind, RelocationTarget,
    SectionIndex, SectionKind, SymbolIndex, SymbolKind, SymbolSection,
};
use tracing::{debug, warn};

use crate::arch::{Arch, TRAP_FILL};
use crate::catalog::{ModuleId, ModuleInfo, Section, Symbol};
use crate::error::{Error, Result};
use crate::memory::ImageMemory;

/// Bytes reserved per undefined symbol.
const IMPORT_STUB_SIZE: u64 = 16;

/// A binary mapped into an [`ImageMemory`].
#[derive(Debug)]
pub struct LoadedImage {
    pub arch: Arch,
    pub module: ModuleInfo,
    pub symbols: Vec<Symbol>,
    pub memory: ImageMemory,
    /// First address past everything mapped.
    pub end: u64,
}

/// Default load address of relocatable objects.
pub fn default_base(arch: Arch) -> u64 {
    match arch {
        Arch::X86_64 => 0xFFFF_FFFF_C000_0000,
        Arch::X86 => 0xC800_0000,
    }
}

fn format_err(err: object::read::Error) -> Error {
    Error::Format(err.to_string())
}

fn is_loaded(kind: SectionKind) -> bool {
    matches!(
        kind,
        SectionKind::Text
            | SectionKind::Data
            | SectionKind::ReadOnlyData
            | SectionKind::ReadOnlyDataWithRel
            | SectionKind::ReadOnlyString
            | SectionKind::UninitializedData
    )
}

fn section_bytes(section: &object::Section<'_, '_>) -> Result<Vec<u8>> {
    let size = section.size() as usize;
    if section.kind() == SectionKind::UninitializedData {
        return Ok(vec![0; size]);
    }
    let mut data = section.data().map_err(format_err)?.to_vec();
    data.resize(size, 0);
    Ok(data)
}

/// Parse `data` and map it. `base` is only used for relocatable objects and
/// defaults to [`default_base`].
pub fn load(data: &[u8], name: &str, base: Option<u64>) -> Result<LoadedImage> {
    let file = object::File::parse(data).map_err(format_err)?;
    let arch = match file.architecture() {
        Architecture::X86_64 => Arch::X86_64,
        Architecture::I386 => Arch::X86,
        other => return Err(Error::Format(format!("unsupported architecture {other:?}"))),
    };

    match file.kind() {
        ObjectKind::Relocatable => load_relocatable(&file, arch, name, base.unwrap_or(default_base(arch))),
        ObjectKind::Executable | ObjectKind::Dynamic => load_linked(&file, arch, name),
        other => Err(Error::Format(format!("cannot load {other:?} files"))),
    }
}

struct Layout {
    sections: HashMap<SectionIndex, u64>,
    imports: HashMap<SymbolIndex, u64>,
}

impl Layout {
    fn symbol_addr(&self, symbol: &object::Symbol<'_, '_>) -> Option<u64> {
        match symbol.section() {
            SymbolSection::Section(index) => self.sections.get(&index).map(|base| base + symbol.address()),
            SymbolSection::Absolute => Some(symbol.address()),
            SymbolSection::Undefined => self.imports.get(&symbol.index()).copied(),
            _ => None,
        }
    }
}

fn load_relocatable(file: &object::File<'_>, arch: Arch, name: &str, base: u64) -> Result<LoadedImage> {
    let mut layout = Layout {
        sections: HashMap::new(),
        imports: HashMap::new(),
    };
    let mut placed = Vec::new();
    let mut cursor = base;

    for section in file.sections() {
        if !is_loaded(section.kind()) || section.size() == 0 {
            continue;
        }
        let addr = cursor.next_multiple_of(section.align().max(1));
        cursor = addr + section.size();
        layout.sections.insert(section.index(), addr);
        placed.push((section.index(), addr, section_bytes(&section)?));
    }

    let imports_base = cursor.next_multiple_of(IMPORT_STUB_SIZE);
    cursor = imports_base;
    for symbol in file.symbols() {
        if symbol.is_undefined() && symbol.name().is_ok_and(|n| !n.is_empty()) {
            layout.imports.insert(symbol.index(), cursor);
            cursor += IMPORT_STUB_SIZE;
        }
    }

    for (index, addr, data) in &mut placed {
        let section = file.section_by_index(*index).map_err(format_err)?;
        for (offset, reloc) in section.relocations() {
            apply_relocation(file, &layout, *addr, data, offset, &reloc)?;
        }
    }

    let mut memory = ImageMemory::new();
    let mut sections = Vec::new();
    let mut code_areas = Vec::new();
    for (index, addr, data) in placed {
        let section = file.section_by_index(index).map_err(format_err)?;
        let size = data.len() as u64;
        let executable = section.kind() == SectionKind::Text;
        if executable {
            code_areas.push(addr..addr + size);
        }
        sections.push(Section {
            name: section.name().unwrap_or("").to_string(),
            addr,
            size,
        });
        memory.map(addr, data, executable)?;
    }
    if cursor > imports_base {
        memory.map(imports_base, vec![TRAP_FILL; (cursor - imports_base) as usize], true)?;
    }

    let symbols = collect_symbols(file, |symbol| layout.symbol_addr(symbol));
    debug!(
        module = name,
        sections = sections.len(),
        symbols = symbols.len(),
        imports = layout.imports.len(),
        "relocatable object loaded"
    );
    Ok(LoadedImage {
        arch,
        module: ModuleInfo {
            id: ModuleId(1),
            name: name.to_string(),
            sections,
            code_areas,
        },
        symbols,
        memory,
        end: cursor,
    })
}

fn apply_relocation(
    file: &object::File<'_>,
    layout: &Layout,
    section_addr: u64,
    data: &mut [u8],
    offset: u64,
    reloc: &object::Relocation,
) -> Result<()> {
    let place = section_addr + offset;
    let RelocationTarget::Symbol(index) = reloc.target() else {
        warn!(place = format_args!("0x{:X}", place), "relocation without symbol ignored");
        return Ok(());
    };
    let symbol = file.symbol_by_index(index).map_err(format_err)?;
    let Some(target) = layout.symbol_addr(&symbol) else {
        warn!(
            symbol = symbol.name().unwrap_or("?"),
            place = format_args!("0x{:X}", place),
            "relocation against unplaced symbol ignored"
        );
        return Ok(());
    };

    let size = usize::from(reloc.size()) / 8;
    let start = offset as usize;
    let field = data
        .get_mut(start..start + size)
        .ok_or_else(|| Error::Format(format!("relocation at 0x{place:X} lies outside its section")))?;
    let addend = if reloc.has_implicit_addend() {
        match size {
            4 => i32::from_le_bytes([field[0], field[1], field[2], field[3]]) as i64,
            8 => i64::from_le_bytes(field[..8].try_into().map_err(|_| Error::Fatal("short field".into()))?),
            _ => 0,
        }
    } else {
        reloc.addend()
    };

    let (value, relative) = match reloc.kind() {
        RelocationKind::Absolute => (target.wrapping_add_signed(addend), false),
        RelocationKind::Relative | RelocationKind::PltRelative => {
            (target.wrapping_add_signed(addend).wrapping_sub(place), true)
        }
        kind => {
            warn!(?kind, place = format_args!("0x{:X}", place), "unsupported relocation ignored");
            return Ok(());
        }
    };

    match size {
        8 => field.copy_from_slice(&value.to_le_bytes()),
        4 => {
            let fits = if relative {
                i32::try_from(value as i64).is_ok()
            } else {
                u32::try_from(value).is_ok() || i32::try_from(value as i64).is_ok()
            };
            if !fits {
                return Err(Error::Format(format!(
                    "relocation at 0x{place:X} cannot reach 0x{target:X}"
                )));
            }
            field.copy_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            warn!(size, place = format_args!("0x{:X}", place), "unsupported relocation size ignored");
        }
    }
    Ok(())
}

fn load_linked(file: &object::File<'_>, arch: Arch, name: &str) -> Result<LoadedImage> {
    let mut memory = ImageMemory::new();
    let mut sections = Vec::new();
    let mut code_areas = Vec::new();
    let mut end = 0;

    for section in file.sections() {
        if !is_loaded(section.kind()) || section.size() == 0 || section.address() == 0 {
            continue;
        }
        let addr = section.address();
        let size = section.size();
        let executable = section.kind() == SectionKind::Text;
        if executable {
            code_areas.push(addr..addr + size);
        }
        memory.map(addr, section_bytes(&section)?, executable)?;
        sections.push(Section {
            name: section.name().unwrap_or("").to_string(),
            addr,
            size,
        });
        end = end.max(addr + size);
    }

    let symbols = collect_symbols(file, |symbol| symbol.is_definition().then(|| symbol.address()));
    debug!(module = name, sections = sections.len(), symbols = symbols.len(), "linked image loaded");
    Ok(LoadedImage {
        arch,
        module: ModuleInfo {
            id: ModuleId(1),
            name: name.to_string(),
            sections,
            code_areas,
        },
        symbols,
        memory,
        end,
    })
}

fn collect_symbols<F>(file: &object::File<'_>, addr_of: F) -> Vec<Symbol>
where
    F: Fn(&object::Symbol<'_, '_>) -> Option<u64>,
{
    file.symbols()
        .filter(|symbol| symbol.kind() == SymbolKind::Text && symbol.is_definition())
        .filter_map(|symbol| {
            let name = symbol.name().ok().filter(|n| !n.is_empty())?;
            Some(Symbol {
                name: name.to_string(),
                module: ModuleId(1),
                addr: addr_of(&symbol)?,
            })
        })
        .collect()
}

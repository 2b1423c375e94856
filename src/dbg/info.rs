//! Object-info graph and its ELF/DWARF loader.

use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context as _, Result};
use gimli::{EndianRcSlice, Reader as _, RunTimeEndian};
use log::{debug, info};
use object::{Object, ObjectKind, ObjectSection, ObjectSymbol};

type Reader = EndianRcSlice<RunTimeEndian>;
type Dwarf = gimli::Dwarf<Reader>;
type Unit = gimli::Unit<Reader>;

/// A `[low_pc, high_pc)` address range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContiguousRange {
    pub low_pc: u64,
    pub high_pc: u64,
}

impl ContiguousRange {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.low_pc && addr < self.high_pc
    }
}

/// A source declaration position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: PathBuf,
    pub line: u32,
    pub column: u32,
}

/// One row of a compilation unit's line table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLine {
    pub file: PathBuf,
    pub number: u32,
    pub column: u32,
    pub address: u64,
    pub new_statement: bool,
    pub epilogue_begin: bool,
}

/// A function described by DWARF.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    pub linkage_name: Option<String>,
    pub decl: Option<SourceLocation>,
    pub ranges: Vec<ContiguousRange>,
    pub is_static: bool,
}

impl Function {
    pub fn is_extern(&self) -> bool {
        !self.is_static
    }

    pub fn low_pc(&self) -> Option<u64> {
        self.ranges.iter().map(|r| r.low_pc).min()
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(addr))
    }
}

/// ELF symbol binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolBinding {
    Local,
    Global,
    Weak,
}

/// A function symbol from the ELF symbol table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionSymbol {
    pub name: String,
    pub address: u64,
    pub size: u64,
    pub binding: SymbolBinding,
}

/// A DWARF compilation unit.
#[derive(Clone, Debug, Default)]
pub struct CompilationUnit {
    /// On-disk path (comp dir + unit name).
    pub path: PathBuf,
    pub ranges: Vec<ContiguousRange>,
    /// Line table rows, in address order.
    pub lines: Vec<SourceLine>,
    pub functions: Vec<Function>,
}

impl CompilationUnit {
    pub fn contains(&self, addr: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(addr))
    }
}

/// Everything the resolver needs to know about the target executable.
#[derive(Clone, Debug, Default)]
pub struct ObjectInfo {
    pub compilation_units: Vec<CompilationUnit>,
    pub function_symbols: Vec<FunctionSymbol>,
    /// Position-independent executable: resolved addresses must be offset
    /// by the runtime load base.
    pub pie: bool,
}

impl ObjectInfo {
    /// Loads the executable's DWARF and symbol table.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)
            .with_context(|| format!("reading executable {}", path.display()))?;
        let obj = object::File::parse(&*data)
            .with_context(|| format!("parsing object file {}", path.display()))?;

        let endian = if obj.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };
        let load_section = |id: gimli::SectionId| -> Result<Reader, gimli::Error> {
            let data = obj
                .section_by_name(id.name())
                .and_then(|section| section.uncompressed_data().ok())
                .unwrap_or(Cow::Borrowed(&[][..]));
            Ok(EndianRcSlice::new(Rc::from(&*data), endian))
        };
        let dwarf = Dwarf::load(&load_section).context("loading DWARF sections")?;

        let mut compilation_units = Vec::new();
        let mut iter = dwarf.units();
        while let Some(header) = iter.next().context("iterating compilation units")? {
            let unit = dwarf.unit(header).context("parsing compilation unit")?;
            compilation_units.push(load_unit(&dwarf, &unit)?);
        }
        if compilation_units.is_empty() {
            anyhow::bail!("{}: no debug information found", path.display());
        }

        let function_symbols = load_function_symbols(&obj);
        info!(
            "loaded {} compilation units, {} function symbols from {}",
            compilation_units.len(),
            function_symbols.len(),
            path.display()
        );

        Ok(Self {
            compilation_units,
            function_symbols,
            pie: obj.kind() == ObjectKind::Dynamic,
        })
    }
}

fn attr_string(dwarf: &Dwarf, unit: &Unit, value: gimli::AttributeValue<Reader>) -> Option<String> {
    dwarf
        .attr_string(unit, value)
        .ok()
        .and_then(|s| s.to_string().map(|s| s.to_string()).ok())
}

fn load_unit(dwarf: &Dwarf, unit: &Unit) -> Result<CompilationUnit> {
    let comp_dir = unit
        .comp_dir
        .as_ref()
        .and_then(|d| d.to_string().ok())
        .map(|s| PathBuf::from(s.into_owned()))
        .unwrap_or_default();
    let name = unit
        .name
        .as_ref()
        .and_then(|n| n.to_string().ok())
        .map(|s| PathBuf::from(s.into_owned()))
        .unwrap_or_default();
    let path = if name.is_absolute() {
        name
    } else {
        comp_dir.join(name)
    };

    let mut ranges = Vec::new();
    let mut range_iter = dwarf.unit_ranges(unit).context("reading unit ranges")?;
    while let Some(range) = range_iter.next().context("reading unit range")? {
        if range.begin < range.end {
            ranges.push(ContiguousRange {
                low_pc: range.begin,
                high_pc: range.end,
            });
        }
    }

    let lines = load_lines(dwarf, unit, &path)?;
    let functions = load_functions(dwarf, unit)?;
    debug!(
        "unit {}: {} lines, {} functions",
        path.display(),
        lines.len(),
        functions.len()
    );

    Ok(CompilationUnit {
        path,
        ranges,
        lines,
        functions,
    })
}

fn load_lines(dwarf: &Dwarf, unit: &Unit, unit_path: &Path) -> Result<Vec<SourceLine>> {
    let Some(program) = unit.line_program.clone() else {
        return Ok(Vec::new());
    };

    let mut lines = Vec::new();
    let mut rows = program.rows();
    while let Some((header, row)) = rows.next_row().context("reading line table row")? {
        if row.end_sequence() {
            continue;
        }
        let Some(line) = row.line() else {
            continue;
        };

        let file = match row.file(header) {
            Some(entry) => {
                let mut p = PathBuf::new();
                if let Some(dir) = entry.directory(header) {
                    if let Some(dir) = attr_string(dwarf, unit, dir) {
                        p.push(dir);
                    }
                }
                match attr_string(dwarf, unit, entry.path_name()) {
                    Some(name) => p.join(name),
                    None => unit_path.to_path_buf(),
                }
            }
            None => unit_path.to_path_buf(),
        };

        lines.push(SourceLine {
            file,
            number: line.get() as u32,
            column: match row.column() {
                gimli::ColumnType::LeftEdge => 0,
                gimli::ColumnType::Column(c) => c.get() as u32,
            },
            address: row.address(),
            new_statement: row.is_stmt(),
            epilogue_begin: row.epilogue_begin(),
        });
    }

    lines.sort_by_key(|l| l.address);
    Ok(lines)
}

fn load_functions(dwarf: &Dwarf, unit: &Unit) -> Result<Vec<Function>> {
    let mut functions = Vec::new();
    let mut entries = unit.entries();
    while let Some((_, entry)) = entries.next_dfs().context("walking debug entries")? {
        if entry.tag() != gimli::DW_TAG_subprogram {
            continue;
        }
        // skip bare declarations and abstract inline origins
        if let Ok(Some(gimli::AttributeValue::Flag(true))) =
            entry.attr_value(gimli::DW_AT_declaration)
        {
            continue;
        }

        let name = entry
            .attr_value(gimli::DW_AT_name)
            .ok()
            .flatten()
            .and_then(|v| attr_string(dwarf, unit, v));
        let Some(name) = name else {
            continue;
        };

        let linkage_name = entry
            .attr_value(gimli::DW_AT_linkage_name)
            .ok()
            .flatten()
            .and_then(|v| attr_string(dwarf, unit, v));

        let is_static = !matches!(
            entry.attr_value(gimli::DW_AT_external),
            Ok(Some(gimli::AttributeValue::Flag(true)))
        );

        let mut ranges = Vec::new();
        let mut range_iter = dwarf
            .die_ranges(unit, entry)
            .context("reading function ranges")?;
        while let Some(range) = range_iter.next().context("reading function range")? {
            if range.begin < range.end {
                ranges.push(ContiguousRange {
                    low_pc: range.begin,
                    high_pc: range.end,
                });
            }
        }

        let decl = decl_location(dwarf, unit, entry);

        functions.push(Function {
            name,
            linkage_name,
            decl,
            ranges,
            is_static,
        });
    }
    Ok(functions)
}

fn decl_location(
    dwarf: &Dwarf,
    unit: &Unit,
    entry: &gimli::DebuggingInformationEntry<Reader>,
) -> Option<SourceLocation> {
    let file_index = match entry.attr_value(gimli::DW_AT_decl_file).ok()?? {
        gimli::AttributeValue::FileIndex(i) => i,
        _ => return None,
    };
    let header = unit.line_program.as_ref()?.header();
    let entry_file = header.file(file_index)?;

    let mut file = PathBuf::new();
    if let Some(dir) = entry_file.directory(header) {
        if let Some(dir) = attr_string(dwarf, unit, dir) {
            file.push(dir);
        }
    }
    let file = file.join(attr_string(dwarf, unit, entry_file.path_name())?);

    let line = match entry.attr_value(gimli::DW_AT_decl_line).ok()?? {
        gimli::AttributeValue::Udata(l) => l as u32,
        _ => 0,
    };
    let column = match entry.attr_value(gimli::DW_AT_decl_column).ok().flatten() {
        Some(gimli::AttributeValue::Udata(c)) => c as u32,
        _ => 0,
    };

    Some(SourceLocation { file, line, column })
}

fn load_function_symbols(obj: &object::File) -> Vec<FunctionSymbol> {
    let mut symbols: Vec<FunctionSymbol> = obj
        .symbols()
        .filter(|sym| sym.kind() == object::SymbolKind::Text && sym.address() != 0)
        .filter_map(|sym| {
            let name = sym.name().ok()?;
            if name.is_empty() {
                return None;
            }
            Some(FunctionSymbol {
                name: name.to_string(),
                address: sym.address(),
                size: sym.size(),
                binding: if sym.is_weak() {
                    SymbolBinding::Weak
                } else if sym.is_local() {
                    SymbolBinding::Local
                } else {
                    SymbolBinding::Global
                },
            })
        })
        .collect();
    symbols.sort_by_key(|s| s.address);
    symbols
}

/// Demangles a symbol name, returning `None` when the name is not mangled.
pub fn demangle(name: &str) -> Option<String> {
    rustc_demangle::try_demangle(name)
        .ok()
        .map(|d| format!("{:#}", d))
}

/// The demangled form when one exists, the raw name otherwise.
pub fn demangled_or_raw(name: &str) -> String {
    demangle(name).unwrap_or_else(|| name.to_string())
}

//! Lookups over the object-info graph.
//!
//! Every failure carries a specific code and a broad cause
//! (`NotFound | Ambiguous | Other`), so callers can build actionable
//! messages without string matching. Symbol ambiguity is further split by
//! linker semantics: the presence of weak, static or suffixed candidates
//! each gets its own code, because each suggests a different fix to the
//! user.

use std::path::{Component, Path};

use thiserror::Error;

use super::info::{
    demangled_or_raw, CompilationUnit, Function, FunctionSymbol, ObjectInfo, SourceLine,
    SymbolBinding,
};

pub type QueryResult<T> = Result<T, QueryError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("compilation unit not found")]
    CuNotFound,
    #[error("compilation unit ambiguous")]
    CuAmbiguous,
    #[error("file not found")]
    FileNotFound,
    #[error("line not found")]
    LineNotFound,
    #[error("column not found")]
    ColumnNotFound,
    #[error("symbol not found")]
    SymbolNotFound,
    #[error("symbol ambiguous")]
    SymbolAmbiguous,
    #[error("symbol name ambiguous with at least one weak symbol present")]
    SymbolAmbiguousWeak,
    #[error("symbol name ambiguous with at least one static symbol present")]
    SymbolAmbiguousStatic,
    #[error("symbol name ambiguous with at least one name with a suffix")]
    SymbolAmbiguousSuffix,
    #[error("no matches found")]
    NoMatches,
    #[error("function not found")]
    FunctionNotFound,
    #[error("function ambiguous")]
    FunctionAmbiguous,
    #[error("address not found")]
    AddressNotFound,
    #[error("invalid argument")]
    InvalidArgument,
}

/// Broad classification of query failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryCause {
    NotFound,
    Ambiguous,
    Other,
}

impl QueryError {
    pub fn cause(&self) -> QueryCause {
        match self {
            QueryError::CuNotFound
            | QueryError::FileNotFound
            | QueryError::LineNotFound
            | QueryError::ColumnNotFound
            | QueryError::SymbolNotFound
            | QueryError::NoMatches
            | QueryError::FunctionNotFound
            | QueryError::AddressNotFound => QueryCause::NotFound,
            QueryError::CuAmbiguous
            | QueryError::SymbolAmbiguous
            | QueryError::SymbolAmbiguousWeak
            | QueryError::SymbolAmbiguousStatic
            | QueryError::SymbolAmbiguousSuffix
            | QueryError::FunctionAmbiguous => QueryCause::Ambiguous,
            QueryError::InvalidArgument => QueryCause::Other,
        }
    }
}

/// True when `sub`'s components appear contiguously in `path`; a configured
/// compilation unit may be any unambiguous trailing part of the real path.
fn is_sub_path(sub: &Path, path: &Path) -> bool {
    let sub: Vec<Component> = sub.components().collect();
    if sub.is_empty() {
        return false;
    }
    let path: Vec<Component> = path.components().collect();
    path.windows(sub.len()).any(|w| w == sub.as_slice())
}

fn remove_spaces(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

fn names_equal(wanted: &str, mangled: &str) -> bool {
    remove_spaces(&demangled_or_raw(mangled)) == remove_spaces(wanted)
}

fn names_match(wanted: &str, mangled: &str) -> bool {
    let demangled = remove_spaces(&demangled_or_raw(mangled));
    let wanted = remove_spaces(wanted);
    demangled.starts_with(&wanted)
}

fn has_suffix(name: &str) -> bool {
    name.contains('.')
}

/// Finds the unique compilation unit whose path has `cu` as a subpath.
pub fn find_compilation_unit<'a>(
    oi: &'a ObjectInfo,
    cu: &Path,
) -> QueryResult<&'a CompilationUnit> {
    let mut matches = oi
        .compilation_units
        .iter()
        .filter(|unit| is_sub_path(cu, &unit.path));
    let found = matches.next().ok_or(QueryError::CuNotFound)?;
    if matches.next().is_some() {
        return Err(QueryError::CuAmbiguous);
    }
    Ok(found)
}

/// The compilation unit whose PC ranges cover `sym`.
pub fn find_compilation_unit_of<'a>(
    oi: &'a ObjectInfo,
    sym: &FunctionSymbol,
) -> QueryResult<&'a CompilationUnit> {
    oi.compilation_units
        .iter()
        .find(|cu| cu.contains(sym.address))
        .ok_or(QueryError::CuNotFound)
}

/// The contiguous run of line-table rows in `cu` matching the criteria.
///
/// `file` defaults to the unit's own path. With `exact_line` unset, the
/// first line at or after `line` is chosen and all rows of that line are
/// returned. A `column` of zero matches any column.
pub fn find_lines<'a>(
    cu: &'a CompilationUnit,
    file: Option<&Path>,
    line: u32,
    exact_line: bool,
    column: u32,
    exact_col: bool,
) -> QueryResult<&'a [SourceLine]> {
    if line == 0 && column != 0 {
        return Err(QueryError::InvalidArgument);
    }
    let effective_file = file.unwrap_or(&cu.path);

    let line_matches = |row: &SourceLine| {
        line == 0 || if exact_line { row.number == line } else { row.number >= line }
    };
    let column_matches = |row: &SourceLine, col: u32| {
        col == 0 || if exact_col { row.column == col } else { row.column >= col }
    };
    let file_matches = |row: &SourceLine| is_sub_path(effective_file, &row.file);

    let mut file_found = false;
    let start = cu
        .lines
        .iter()
        .position(|row| {
            if !file_matches(row) {
                return false;
            }
            file_found = true;
            line_matches(row)
        })
        .ok_or(if file_found {
            QueryError::LineNotFound
        } else {
            QueryError::FileNotFound
        })?;

    // when the match advanced past the requested line, a non-exact column
    // request no longer means anything: match any column
    let chosen_line = cu.lines[start].number;
    let column = if chosen_line > line && !exact_col { 0 } else { column };

    let start = cu.lines[start..]
        .iter()
        .position(|row| file_matches(row) && row.number == chosen_line && column_matches(row, column))
        .map(|off| start + off)
        .ok_or(QueryError::ColumnNotFound)?;

    let end = cu.lines[start..]
        .iter()
        .position(|row| !(file_matches(row) && row.number == chosen_line))
        .map(|off| start + off)
        .unwrap_or(cu.lines.len());

    Ok(&cu.lines[start..end])
}

/// The row with the lowest address, optionally restricted to statement
/// boundaries.
pub fn lowest_address_line<'a>(
    range: &'a [SourceLine],
    new_statement: bool,
) -> QueryResult<&'a SourceLine> {
    range
        .iter()
        .filter(|row| !new_statement || row.new_statement)
        .min_by_key(|row| row.address)
        .ok_or(QueryError::LineNotFound)
}

/// The row with the highest address, optionally restricted to statement
/// boundaries.
pub fn highest_address_line<'a>(
    range: &'a [SourceLine],
    new_statement: bool,
) -> QueryResult<&'a SourceLine> {
    range
        .iter()
        .filter(|row| !new_statement || row.new_statement)
        .max_by_key(|row| row.address)
        .ok_or(QueryError::LineNotFound)
}

fn ambiguity_error(matches: &[&FunctionSymbol]) -> QueryError {
    if matches.iter().any(|s| s.binding == SymbolBinding::Weak) {
        QueryError::SymbolAmbiguousWeak
    } else if matches.iter().any(|s| s.binding == SymbolBinding::Local) {
        QueryError::SymbolAmbiguousStatic
    } else {
        QueryError::SymbolAmbiguous
    }
}

/// Finds a function symbol by (demangled) name.
///
/// Exact lookup requires full name equality. Non-exact lookup matches by
/// prefix, preferring an exact match among the candidates; with
/// `ignore_suffix` set, a single suffix-free candidate wins over suffixed
/// clones of itself (`name.cold`, `name.constprop.0`, ...).
pub fn find_function_symbol<'a>(
    oi: &'a ObjectInfo,
    name: &str,
    exact_name: bool,
    ignore_suffix: bool,
) -> QueryResult<&'a FunctionSymbol> {
    if name.is_empty() {
        return Err(QueryError::InvalidArgument);
    }

    if exact_name {
        let matches: Vec<&FunctionSymbol> = oi
            .function_symbols
            .iter()
            .filter(|sym| names_equal(name, &sym.name))
            .collect();
        return match matches.len() {
            0 => Err(QueryError::SymbolNotFound),
            1 => Ok(matches[0]),
            _ => Err(ambiguity_error(&matches)),
        };
    }

    let matches: Vec<&FunctionSymbol> = oi
        .function_symbols
        .iter()
        .filter(|sym| names_match(name, &sym.name))
        .collect();
    if matches.is_empty() {
        return Err(QueryError::NoMatches);
    }
    if matches.len() == 1 {
        return Ok(matches[0]);
    }

    let exact: Vec<&FunctionSymbol> = matches
        .iter()
        .copied()
        .filter(|sym| names_equal(name, &sym.name))
        .collect();
    match exact.len() {
        1 => return Ok(exact[0]),
        n if n > 1 => return Err(ambiguity_error(&exact)),
        _ => {}
    }

    if !ignore_suffix {
        return Err(QueryError::SymbolAmbiguousSuffix);
    }
    let suffix_free: Vec<&FunctionSymbol> = matches
        .iter()
        .copied()
        .filter(|sym| !has_suffix(&sym.name))
        .collect();
    match suffix_free.len() {
        0 => Err(QueryError::SymbolAmbiguousSuffix),
        1 => Ok(suffix_free[0]),
        _ => Err(QueryError::SymbolAmbiguous),
    }
}

/// The function symbol installed at exactly `addr`.
pub fn find_function_symbol_at(oi: &ObjectInfo, addr: u64) -> QueryResult<&FunctionSymbol> {
    oi.function_symbols
        .iter()
        .find(|sym| sym.address == addr)
        .ok_or(QueryError::AddressNotFound)
}

/// Cross-references a symbol to the DWARF function it belongs to. Static
/// functions are matched by address, extern functions by linkage name.
pub fn find_function_of_symbol<'a>(
    cu: &'a CompilationUnit,
    sym: &FunctionSymbol,
) -> QueryResult<&'a Function> {
    if sym.binding == SymbolBinding::Local {
        return cu
            .functions
            .iter()
            .filter(|f| f.is_static)
            .find(|f| f.ranges.iter().any(|r| r.low_pc == sym.address))
            .ok_or(QueryError::FunctionNotFound);
    }
    cu.functions
        .iter()
        .filter(|f| f.is_extern())
        .find(|f| f.linkage_name.as_deref() == Some(sym.name.as_str()))
        .ok_or(QueryError::FunctionNotFound)
}

/// Finds a function by name, searching the symbol table first and falling
/// back to DWARF linkage names. The symbol is returned when one exists.
pub fn find_function<'a>(
    oi: &'a ObjectInfo,
    cu: Option<&'a CompilationUnit>,
    name: &str,
    exact_name: bool,
) -> QueryResult<(&'a Function, Option<&'a FunctionSymbol>)> {
    match find_function_symbol(oi, name, exact_name, true) {
        Ok(sym) => {
            let units: Vec<&CompilationUnit> = match cu {
                Some(cu) => vec![cu],
                None => oi.compilation_units.iter().collect(),
            };
            for unit in units {
                match find_function_of_symbol(unit, sym) {
                    Ok(func) => return Ok((func, Some(sym))),
                    Err(QueryError::FunctionNotFound) => continue,
                    Err(e) => return Err(e),
                }
            }
            Err(QueryError::FunctionNotFound)
        }
        Err(e) if e.cause() == QueryCause::NotFound => {
            // no symbol: fall back to extern DWARF functions by name
            let units: Vec<&CompilationUnit> = match cu {
                Some(cu) => vec![cu],
                None => oi.compilation_units.iter().collect(),
            };
            let mut found = None;
            for unit in units {
                for func in unit.functions.iter().filter(|f| f.is_extern()) {
                    let Some(linkage) = func.linkage_name.as_deref() else {
                        continue;
                    };
                    let hit = if exact_name {
                        names_equal(name, linkage)
                    } else {
                        names_match(name, linkage)
                    };
                    if !hit {
                        continue;
                    }
                    if exact_name {
                        return Ok((func, None));
                    }
                    if found.is_some() {
                        return Err(QueryError::FunctionAmbiguous);
                    }
                    found = Some(func);
                }
            }
            found.map(|f| (f, None)).ok_or(QueryError::FunctionNotFound)
        }
        Err(e) => Err(e),
    }
}

/// Finds the unique function declared at `(file, line[, column])` in `cu`.
pub fn find_function_at<'a>(
    cu: &'a CompilationUnit,
    file: &Path,
    line: u32,
    column: u32,
) -> QueryResult<&'a Function> {
    let decls = || cu.functions.iter().filter_map(|f| f.decl.as_ref().map(|d| (f, d)));
    let in_file = || decls().filter(|(_, d)| is_sub_path(file, &d.file));
    let at_line = || in_file().filter(|(_, d)| d.line == line);

    let mut matches =
        at_line().filter(|(_, d)| column == 0 || d.column == column);
    let Some((found, _)) = matches.next() else {
        return Err(if decls().next().is_none() {
            QueryError::FunctionNotFound
        } else if in_file().next().is_none() {
            QueryError::FileNotFound
        } else if at_line().next().is_none() {
            QueryError::LineNotFound
        } else {
            QueryError::ColumnNotFound
        });
    };
    if matches.next().is_some() {
        return Err(QueryError::FunctionAmbiguous);
    }
    Ok(found)
}

/// Return sites of a function: line rows inside its ranges flagged as
/// epilogue begin, falling back to the highest statement row.
pub fn function_return_sites(cu: &CompilationUnit, func: &Function) -> QueryResult<Vec<u64>> {
    let inside: Vec<&SourceLine> = cu
        .lines
        .iter()
        .filter(|row| func.contains(row.address))
        .collect();

    let mut sites: Vec<u64> = inside
        .iter()
        .filter(|row| row.epilogue_begin)
        .map(|row| row.address)
        .collect();
    sites.sort_unstable();
    sites.dedup();
    if !sites.is_empty() {
        return Ok(sites);
    }

    inside
        .iter()
        .filter(|row| row.new_statement)
        .max_by_key(|row| row.address)
        .map(|row| vec![row.address])
        .ok_or(QueryError::LineNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbg::info::ContiguousRange;
    use std::path::PathBuf;

    fn line(file: &str, number: u32, column: u32, address: u64) -> SourceLine {
        SourceLine {
            file: PathBuf::from(file),
            number,
            column,
            address,
            new_statement: true,
            epilogue_begin: false,
        }
    }

    fn test_object() -> ObjectInfo {
        let cu_a = CompilationUnit {
            path: PathBuf::from("/src/a.c"),
            ranges: vec![ContiguousRange {
                low_pc: 0x1000,
                high_pc: 0x2000,
            }],
            lines: vec![
                line("/src/a.c", 10, 1, 0x1000),
                line("/src/a.c", 10, 9, 0x1004),
                line("/src/a.c", 12, 1, 0x1010),
                line("/src/a.c", 20, 1, 0x1050),
            ],
            functions: vec![Function {
                name: "compute".into(),
                linkage_name: Some("compute".into()),
                decl: Some(crate::dbg::info::SourceLocation {
                    file: PathBuf::from("/src/a.c"),
                    line: 9,
                    column: 1,
                }),
                ranges: vec![ContiguousRange {
                    low_pc: 0x1000,
                    high_pc: 0x1060,
                }],
                is_static: false,
            }],
        };
        let cu_b = CompilationUnit {
            path: PathBuf::from("/src/sub/a.c"),
            ranges: vec![ContiguousRange {
                low_pc: 0x3000,
                high_pc: 0x4000,
            }],
            ..Default::default()
        };
        ObjectInfo {
            compilation_units: vec![cu_a, cu_b],
            function_symbols: vec![FunctionSymbol {
                name: "compute".into(),
                address: 0x1000,
                size: 0x60,
                binding: SymbolBinding::Global,
            }],
            pie: false,
        }
    }

    #[test]
    fn test_cu_subpath_ambiguity() {
        let oi = test_object();
        // "a.c" is a subpath of both units
        assert_eq!(
            find_compilation_unit(&oi, Path::new("a.c")).unwrap_err(),
            QueryError::CuAmbiguous
        );
        let cu = find_compilation_unit(&oi, Path::new("sub/a.c")).unwrap();
        assert_eq!(cu.path, PathBuf::from("/src/sub/a.c"));
        assert_eq!(
            find_compilation_unit(&oi, Path::new("b.c")).unwrap_err(),
            QueryError::CuNotFound
        );
        assert_eq!(
            find_compilation_unit(&oi, Path::new("a.c")).unwrap_err().cause(),
            QueryCause::Ambiguous
        );
    }

    #[test]
    fn test_find_lines() {
        let oi = test_object();
        let cu = &oi.compilation_units[0];

        // exact line: both rows of line 10
        let rows = find_lines(cu, None, 10, true, 0, false).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].address, 0x1000);

        // first line >= 11 is 12
        let rows = find_lines(cu, None, 11, false, 0, false).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].number, 12);

        assert_eq!(
            find_lines(cu, None, 99, true, 0, false).unwrap_err(),
            QueryError::LineNotFound
        );
        assert_eq!(
            find_lines(cu, Some(Path::new("missing.c")), 10, true, 0, false).unwrap_err(),
            QueryError::FileNotFound
        );
        assert_eq!(
            find_lines(cu, None, 10, true, 99, true).unwrap_err(),
            QueryError::ColumnNotFound
        );
        assert_eq!(
            find_lines(cu, None, 0, false, 5, false).unwrap_err(),
            QueryError::InvalidArgument
        );
    }

    #[test]
    fn test_address_extremes() {
        let oi = test_object();
        let rows = find_lines(&oi.compilation_units[0], None, 10, true, 0, false).unwrap();
        assert_eq!(lowest_address_line(rows, true).unwrap().address, 0x1000);
        assert_eq!(highest_address_line(rows, true).unwrap().address, 0x1004);

        let no_statements: Vec<SourceLine> = rows
            .iter()
            .map(|r| SourceLine {
                new_statement: false,
                ..r.clone()
            })
            .collect();
        assert_eq!(
            lowest_address_line(&no_statements, true).unwrap_err(),
            QueryError::LineNotFound
        );
        assert_eq!(
            lowest_address_line(&no_statements, false).unwrap().address,
            0x1000
        );
    }

    fn symbol(name: &str, address: u64, binding: SymbolBinding) -> FunctionSymbol {
        FunctionSymbol {
            name: name.into(),
            address,
            size: 0x10,
            binding,
        }
    }

    #[test]
    fn test_symbol_ambiguity_causes() {
        let mut oi = ObjectInfo::default();
        oi.function_symbols = vec![
            symbol("worker", 0x100, SymbolBinding::Global),
            symbol("worker", 0x200, SymbolBinding::Weak),
        ];
        assert_eq!(
            find_function_symbol(&oi, "worker", true, false).unwrap_err(),
            QueryError::SymbolAmbiguousWeak
        );

        oi.function_symbols[1] = symbol("worker", 0x200, SymbolBinding::Local);
        assert_eq!(
            find_function_symbol(&oi, "worker", true, false).unwrap_err(),
            QueryError::SymbolAmbiguousStatic
        );

        oi.function_symbols[1] = symbol("worker", 0x200, SymbolBinding::Global);
        assert_eq!(
            find_function_symbol(&oi, "worker", true, false).unwrap_err(),
            QueryError::SymbolAmbiguous
        );
    }

    #[test]
    fn test_symbol_suffix_disambiguation() {
        let mut oi = ObjectInfo::default();
        oi.function_symbols = vec![
            symbol("worker", 0x100, SymbolBinding::Global),
            symbol("worker.cold", 0x200, SymbolBinding::Local),
            symbol("worker.constprop.0", 0x300, SymbolBinding::Local),
        ];

        // exact naming sees only the clean name
        let sym = find_function_symbol(&oi, "worker", true, false).unwrap();
        assert_eq!(sym.address, 0x100);

        // prefix match with suffix handling picks the suffix-free candidate
        let sym = find_function_symbol(&oi, "work", false, true).unwrap();
        assert_eq!(sym.address, 0x100);

        assert_eq!(
            find_function_symbol(&oi, "work", false, false).unwrap_err(),
            QueryError::SymbolAmbiguousSuffix
        );

        oi.function_symbols.remove(0);
        assert_eq!(
            find_function_symbol(&oi, "work", false, true).unwrap_err(),
            QueryError::SymbolAmbiguousSuffix
        );

        assert_eq!(
            find_function_symbol(&oi, "nothing", false, true).unwrap_err(),
            QueryError::NoMatches
        );
        assert_eq!(
            find_function_symbol(&oi, "", false, true).unwrap_err(),
            QueryError::InvalidArgument
        );
    }

    #[test]
    fn test_find_function() {
        let oi = test_object();
        let (func, sym) = find_function(&oi, None, "compute", true).unwrap();
        assert_eq!(func.name, "compute");
        assert_eq!(sym.unwrap().address, 0x1000);

        assert_eq!(
            find_function(&oi, None, "missing", true).unwrap_err(),
            QueryError::FunctionNotFound
        );

        // the resolved entry lies within some function of the chosen unit
        let entry = func.low_pc().unwrap();
        assert!(oi.compilation_units[0]
            .functions
            .iter()
            .any(|f| f.contains(entry)));
    }

    #[test]
    fn test_find_function_at_decl() {
        let oi = test_object();
        let cu = &oi.compilation_units[0];
        let func = find_function_at(cu, Path::new("a.c"), 9, 0).unwrap();
        assert_eq!(func.name, "compute");
        assert_eq!(
            find_function_at(cu, Path::new("a.c"), 99, 0).unwrap_err(),
            QueryError::LineNotFound
        );
        assert_eq!(
            find_function_at(cu, Path::new("other.c"), 9, 0).unwrap_err(),
            QueryError::FileNotFound
        );
    }

    #[test]
    fn test_return_sites() {
        let oi = test_object();
        let cu = &oi.compilation_units[0];
        let func = &cu.functions[0];

        // no epilogue rows: highest statement row inside the function
        let sites = function_return_sites(cu, func).unwrap();
        assert_eq!(sites, vec![0x1050]);

        let mut cu = cu.clone();
        cu.lines[2].epilogue_begin = true;
        cu.lines[3].epilogue_begin = true;
        let sites = function_return_sites(&cu, &cu.functions[0]).unwrap();
        assert_eq!(sites, vec![0x1010, 0x1050]);
    }
}

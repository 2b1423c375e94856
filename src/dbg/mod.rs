//! Debug information.
//!
//! `info` loads an ELF executable into the object-info graph: compilation
//! units with their line tables and functions, plus the ELF function
//! symbols. `query` answers the lookups the region resolver needs, with an
//! error taxonomy precise enough to tell the user *why* a position did not
//! resolve (missing vs ambiguous, and which linker-level kind of ambiguity).

pub mod info;
pub mod query;

pub use info::{
    demangle, CompilationUnit, ContiguousRange, Function, FunctionSymbol, ObjectInfo,
    SourceLine, SourceLocation, SymbolBinding,
};
pub use query::{QueryCause, QueryError, QueryResult};

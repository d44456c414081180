//! Public error types for the compile pipeline.

use std::fmt;

/// A lex or parse failure.
///
/// The first error aborts compilation; there is no recovery. Displays as
/// `source:line: message`, which is also what the CLI prints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    /// Source name the task was compiled from (e.g. the file name).
    pub source: String,
    /// 1-based line of the offending token.
    pub line: usize,
    /// Short human-readable description, e.g. `expected ')'`.
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.source, self.line, self.message)
    }
}

impl std::error::Error for CompileError {}

//! Every stage of the compiler fails fast with a single [`Error`]. There is no
//! recovery: later passes rely on the invariants established by earlier ones,
//! so the first violation aborts the whole compilation.

use colored::Colorize;
use itertools::Itertools;

use crate::frontend::{Location, SourceFile, intern::InternedSymbol};

#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    pub kind: ErrorKind,
    /// Location of the offending construct, if it can be attributed to one
    pub location: Option<Location>,
    /// Where in the compiler the error was raised
    #[cfg(feature = "error-backtrace")]
    pub raised_at: &'static std::panic::Location<'static>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    /// Malformed source text (lexer and parser)
    Syntax(String),
    UndeclaredSymbol {
        name: InternedSymbol,
    },
    Redefinition {
        name: InternedSymbol,
    },
    ArgumentCount {
        callee: InternedSymbol,
        expected: usize,
        actual: usize,
    },
    LiteralShape {
        reason: String,
    },
    ShapeMismatch {
        operation: &'static str,
        reason: String,
    },
    UnresolvedShape {
        operation: &'static str,
    },
    RecursionUnsupported {
        cycle: Vec<InternedSymbol>,
    },
    InvariantViolation(String),
    /// Attempted to erase an operation whose results are still used
    Use {
        operation: &'static str,
        uses: usize,
    },
    /// Raised by the execution engine while running lowered code
    Execution(String),
}

impl Error {
    #[track_caller]
    pub fn new(kind: ErrorKind, location: Option<Location>) -> Self {
        Self {
            kind,
            location,
            #[cfg(feature = "error-backtrace")]
            raised_at: std::panic::Location::caller(),
        }
    }

    #[track_caller]
    pub fn at(kind: ErrorKind, location: Location) -> Self {
        Self::new(kind, Some(location))
    }

    #[track_caller]
    pub fn invariant(message: impl Into<String>, location: Option<Location>) -> Self {
        Self::new(ErrorKind::InvariantViolation(message.into()), location)
    }

    /// Prints the diagnostic to stderr, highlighting the offending line when
    /// the source file is available
    pub fn report(&self, source_file: Option<&SourceFile>) {
        #[cfg(feature = "error-backtrace")]
        eprintln!(
            "{}: {}",
            "backtrace".blue(),
            format!("(raised at {})", self.raised_at).white()
        );

        match self.location {
            Some(location) => {
                eprintln!(
                    "{}: {} {}",
                    "error".red(),
                    self.kind,
                    format!("(at {location})").white()
                );

                if let Some(source_file) = source_file {
                    source_file.highlight_location(location);
                }
            }
            None => eprintln!("{}: {}", "error".red(), self.kind),
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.location {
            Some(location) => write!(f, "{} (at {location})", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Syntax(message) => write!(f, "{message}"),
            ErrorKind::UndeclaredSymbol { name } => write!(f, "use of undeclared symbol `{name}`"),
            ErrorKind::Redefinition { name } => write!(f, "`{name}` is already defined"),
            ErrorKind::ArgumentCount {
                callee,
                expected,
                actual,
            } => write!(
                f,
                "expected {expected} argument(s) to `{callee}` but found {actual}"
            ),
            ErrorKind::LiteralShape { reason } => write!(f, "invalid tensor literal: {reason}"),
            ErrorKind::ShapeMismatch { operation, reason } => {
                write!(f, "shape mismatch in `{operation}`: {reason}")
            }
            ErrorKind::UnresolvedShape { operation } => {
                write!(f, "unable to infer the shape of `{operation}` operation")
            }
            ErrorKind::RecursionUnsupported { cycle } => write!(
                f,
                "recursive calls cannot be inlined: {}",
                cycle.iter().map(|name| format!("`{name}`")).join(" -> ")
            ),
            ErrorKind::InvariantViolation(message) => {
                write!(f, "internal invariant violated: {message}")
            }
            ErrorKind::Use { operation, uses } => write!(
                f,
                "cannot erase `{operation}` operation while its results have {uses} remaining use(s)"
            ),
            ErrorKind::Execution(message) => write!(f, "execution failed: {message}"),
        }
    }
}

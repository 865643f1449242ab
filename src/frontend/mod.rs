//! The frontend turns source text into an AST. Everything after it works on
//! [`Location`]s instead of byte spans so diagnostics survive inlining.

use std::path::PathBuf;

use colored::Colorize;

use self::{intern::InternedSymbol, lexer::Span};

pub mod ast;
pub mod intern;
pub mod lexer;
pub mod parser;

#[derive(Debug)]
pub struct SourceFile {
    pub contents: String,
    pub origin: SourceFileOrigin,
}

impl SourceFile {
    pub fn from_memory(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
            origin: SourceFileOrigin::Memory,
        }
    }

    pub fn value_of_span(&self, span: Span) -> &str {
        &self.contents[span.start..span.end]
    }

    /// 1-based line and column of a byte offset
    pub fn line_column_for_position(&self, position: usize) -> (usize, usize) {
        let position = position.min(self.contents.len());
        let before = &self.contents[..position];

        let line = before.matches('\n').count() + 1;
        let line_start = before.rfind('\n').map(|i| i + 1).unwrap_or(0);

        (line, position - line_start + 1)
    }

    pub fn location_of_span(&self, span: Span) -> Location {
        let (line, column) = self.line_column_for_position(span.start);

        Location {
            file: InternedSymbol::new(&self.origin.to_string()),
            line: line as _,
            column: column as _,
        }
    }

    /// Prints the offending source line to stderr with a caret under the
    /// reported column
    pub fn highlight_location(&self, location: Location) {
        let Some(text) = self.contents.lines().nth(location.line as usize - 1) else {
            return;
        };

        let gutter = location.line.to_string();

        eprintln!("{} {}", " ".repeat(gutter.len()), "|".blue());
        eprintln!("{} {} {}", gutter.blue(), "|".blue(), text);
        eprintln!(
            "{} {} {}{}",
            " ".repeat(gutter.len()),
            "|".blue(),
            " ".repeat(location.column.saturating_sub(1) as usize),
            "^".red()
        );
    }
}

#[derive(Debug)]
pub enum SourceFileOrigin {
    Memory,
    File(PathBuf),
}

impl core::fmt::Display for SourceFileOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceFileOrigin::Memory => f.write_str("<memory>"),
            SourceFileOrigin::File(path) => f.write_fmt(format_args!("{}", path.display())),
        }
    }
}

/// A resolved position in a source file. Unlike [`Span`] it does not need
/// the source text to be displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    pub file: InternedSymbol,
    pub line: u32,
    pub column: u32,
}

impl core::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_are_one_based() {
        let source = SourceFile::from_memory("def main() {\n  print(a);\n}\n");

        assert_eq!(source.line_column_for_position(0), (1, 1));
        assert_eq!(source.line_column_for_position(15), (2, 3));

        let location = source.location_of_span(Span::new(15, 20));
        assert_eq!(location.to_string(), "<memory>:2:3");
    }
}

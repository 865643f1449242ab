use std::{collections::BTreeMap, str::Chars};

use itertools::{PeekNth, peek_nth};
use once_cell::sync::Lazy;
use strum::EnumString;

use crate::{
    error::{Error, ErrorKind},
    frontend::SourceFile,
};

#[derive(Debug)]
pub struct Lexer<'source> {
    source: &'source SourceFile,
    position: usize,
    chars: PeekNth<Chars<'source>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /* Words */
    Keyword(Keyword), // def
    Identifier,       // main

    /* Literals */
    NumberLiteral, // 1 or 1.5

    /* Delimiters */
    OpenParen,    // (
    CloseParen,   // )
    OpenBracket,  // [
    CloseBracket, // ]
    OpenBrace,    // {
    CloseBrace,   // }
    Semicolon,    // ;
    Comma,        // ,

    /* Shape annotations */
    LessThan,    // <
    GreaterThan, // >

    /* Operators */
    Equals,   // =
    Plus,     // +
    Asterisk, // *
    At,       // @
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Keyword {
    Def,
    Func,
    Var,
    Return,
}

/// Table of single char tokens
static SINGLE_TOKENS: Lazy<BTreeMap<char, TokenKind>> = Lazy::new(|| {
    BTreeMap::from([
        ('(', TokenKind::OpenParen),
        (')', TokenKind::CloseParen),
        ('[', TokenKind::OpenBracket),
        (']', TokenKind::CloseBracket),
        ('{', TokenKind::OpenBrace),
        ('}', TokenKind::CloseBrace),
        (';', TokenKind::Semicolon),
        (',', TokenKind::Comma),
        ('<', TokenKind::LessThan),
        ('>', TokenKind::GreaterThan),
        ('=', TokenKind::Equals),
        ('+', TokenKind::Plus),
        ('*', TokenKind::Asterisk),
        ('@', TokenKind::At),
    ])
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn to(self, other: Span) -> Span {
        Span::new(self.start, other.end)
    }
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source SourceFile) -> Self {
        Self {
            source,
            chars: peek_nth(source.contents.chars()),
            position: 0,
        }
    }

    /// Lexes the whole file up front. The parser only ever needs a small
    /// amount of lookahead but having the full stream makes `--emit tokens`
    /// trivial.
    pub fn tokenize(mut self) -> Result<Vec<Token>, Error> {
        let mut tokens = Vec::new();

        while let Some(token) = self.next_token()? {
            tokens.push(token);
        }

        Ok(tokens)
    }

    fn fatal_error(&self, start: usize, message: String) -> Error {
        Error::new(
            ErrorKind::Syntax(message),
            Some(self.source.location_of_span(self.new_span(start))),
        )
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        self.position += c.len_utf8();
        Some(c)
    }

    fn ignore_whitespace(&mut self) {
        while self.chars.peek().is_some_and(|c| c.is_whitespace()) {
            self.advance();
        }
    }

    fn ignore_line(&mut self) {
        while self.chars.peek().is_some_and(|c| *c != '\n') {
            self.advance();
        }
    }

    // Keyword or identifier
    fn read_word(&mut self) -> Token {
        let start_position = self.position;

        while self
            .chars
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || *c == '_')
        {
            self.advance();
        }

        let span = self.new_span(start_position);
        let value = self.source.value_of_span(span);

        let kind = match value.parse() {
            Ok(keyword) => TokenKind::Keyword(keyword),
            Err(_) => TokenKind::Identifier,
        };

        Token { kind, span }
    }

    fn read_number(&mut self) -> Result<Token, Error> {
        let start_position = self.position;
        let mut seen_decimal_point = false;

        while let Some(c) = self.chars.peek().copied() {
            if c == '.' {
                if seen_decimal_point {
                    return Err(self.fatal_error(
                        start_position,
                        "number literal has more than one decimal point".to_string(),
                    ));
                }

                seen_decimal_point = true;
            } else if !c.is_ascii_digit() {
                break;
            }

            self.advance();
        }

        Ok(Token {
            kind: TokenKind::NumberLiteral,
            span: self.new_span(start_position),
        })
    }

    fn read_single(&mut self, kind: TokenKind) -> Token {
        let start_position = self.position;

        self.advance();

        Token {
            kind,
            span: self.new_span(start_position),
        }
    }

    fn new_span(&self, start: usize) -> Span {
        Span {
            start,
            end: self.position,
        }
    }

    pub fn next_token(&mut self) -> Result<Option<Token>, Error> {
        while let Some(c) = self.chars.peek().copied() {
            let token = match c {
                // Ignore whitespace
                c if c.is_whitespace() => {
                    self.ignore_whitespace();
                    continue;
                }
                // Ignore comments
                '#' => {
                    self.ignore_line();
                    continue;
                }
                '/' if self.chars.peek_nth(1).is_some_and(|c| *c == '/') => {
                    self.ignore_line();
                    continue;
                }

                // Number literals
                n if n.is_ascii_digit() => self.read_number()?,
                '.' if self.chars.peek_nth(1).is_some_and(|c| c.is_ascii_digit()) => {
                    self.read_number()?
                }

                // Identifiers and keywords
                a if a.is_ascii_alphabetic() || a == '_' => self.read_word(),

                s if SINGLE_TOKENS.contains_key(&s) => self.read_single(SINGLE_TOKENS[&s]),
                c => {
                    return Err(self.fatal_error(
                        self.position,
                        format!("unexpected character in stream: `{c}`"),
                    ));
                }
            };

            return Ok(Some(token));
        }

        Ok(None)
    }
}

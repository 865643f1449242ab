use super::{
    ast::{
        BinaryOperator, BinaryOperatorKind, Block, Expression, ExpressionKind, FunctionDefinition,
        Identifier, Literal, LiteralKind, Module, ShapeAnnotation, Statement, StatementKind,
        VariableDeclaration,
    },
    intern::InternedSymbol,
    lexer::{Keyword, Lexer, Span, Token, TokenKind},
};
use crate::{
    error::{Error, ErrorKind},
    frontend::SourceFile,
};

#[derive(Debug)]
pub struct Parser<'source> {
    source: &'source SourceFile,
    tokens: Vec<Token>,
    position: usize,
}

impl<'source> Parser<'source> {
    pub fn parse_module(source_file: &'source SourceFile) -> Result<Module<'source>, Error> {
        let mut parser = Self {
            source: source_file,
            tokens: Lexer::new(source_file).tokenize()?,
            position: 0,
        };

        let mut module = Module {
            source_file,
            functions: Vec::new(),
        };

        while parser.peek().is_some() {
            module.functions.push(parser.parse_function_definition()?);
        }

        Ok(module)
    }

    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.position).copied()
    }

    fn peek_nth(&self, n: usize) -> Option<Token> {
        self.tokens.get(self.position + n).copied()
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.peek()?;
        self.position += 1;
        Some(token)
    }

    fn next_is(&self, kind: TokenKind) -> bool {
        self.peek().is_some_and(|t| t.kind == kind)
    }

    fn fatal_error(&self, offending_span: Span, message: String) -> Error {
        Error::at(
            ErrorKind::Syntax(message),
            self.source.location_of_span(offending_span),
        )
    }

    fn end_of_file_span(&self) -> Span {
        let end = self.source.contents.len();
        Span::new(end, end)
    }

    fn expect_peek(&self, expecting: &str) -> Result<Token, Error> {
        self.peek().ok_or_else(|| {
            self.fatal_error(
                self.end_of_file_span(),
                format!("expected {expecting} but reached end of file"),
            )
        })
    }

    fn expect_next(&mut self, expecting: &str) -> Result<Token, Error> {
        let token = self.expect_peek(expecting)?;
        self.position += 1;
        Ok(token)
    }

    fn expect_next_to_be(&mut self, kind: TokenKind, expecting: &str) -> Result<Token, Error> {
        let token = self.expect_next(expecting)?;

        if token.kind != kind {
            return Err(self.fatal_error(
                token.span,
                format!(
                    "expected {expecting} but found `{}`",
                    self.source.value_of_span(token.span)
                ),
            ));
        }

        Ok(token)
    }

    /// ("def" | "func") name(a, b) { ... }
    fn parse_function_definition(&mut self) -> Result<FunctionDefinition, Error> {
        let keyword = self.expect_next("function definition")?;

        if !matches!(
            keyword.kind,
            TokenKind::Keyword(Keyword::Def | Keyword::Func)
        ) {
            return Err(self.fatal_error(
                keyword.span,
                format!(
                    "expected function definition in module but found `{}`",
                    self.source.value_of_span(keyword.span)
                ),
            ));
        }

        let name = self.parse_identifier()?;
        let parameters = self.parse_parameter_list()?;
        let body = self.parse_block()?;

        Ok(FunctionDefinition {
            span: keyword.span.to(body.span),
            name,
            parameters,
            body,
        })
    }

    // main
    fn parse_identifier(&mut self) -> Result<Identifier, Error> {
        let token = self.expect_next_to_be(TokenKind::Identifier, "identifier")?;

        Ok(Identifier {
            span: token.span,
            symbol: InternedSymbol::new(self.source.value_of_span(token.span)),
        })
    }

    // (a, b)
    fn parse_parameter_list(&mut self) -> Result<Vec<Identifier>, Error> {
        let mut parameters = Vec::new();

        self.expect_next_to_be(TokenKind::OpenParen, "`(`")?;

        // If the next token is not a closing paren there MUST be at least one
        // parameter
        if !self.next_is(TokenKind::CloseParen) {
            parameters.push(self.parse_identifier()?);

            while self.next_is(TokenKind::Comma) {
                self.next();
                parameters.push(self.parse_identifier()?);
            }
        }

        self.expect_next_to_be(TokenKind::CloseParen, "`)`")?;

        Ok(parameters)
    }

    // "{" ( statement )* "}"
    fn parse_block(&mut self) -> Result<Block, Error> {
        let open_brace = self.expect_next_to_be(TokenKind::OpenBrace, "`{`")?;
        let mut statements = Vec::new();

        while self.expect_peek("statement or `}`")?.kind != TokenKind::CloseBrace {
            statements.push(self.parse_statement()?);
        }

        let close_brace = self.expect_next_to_be(TokenKind::CloseBrace, "`}`")?;

        Ok(Block {
            span: open_brace.span.to(close_brace.span),
            statements,
        })
    }

    fn parse_statement(&mut self) -> Result<Statement, Error> {
        let peeked = self.expect_peek("statement")?;

        let (kind, start) = match peeked.kind {
            TokenKind::Keyword(Keyword::Var) => {
                let declaration = self.parse_variable_declaration()?;
                let span = declaration.span;
                (StatementKind::VariableDeclaration(Box::new(declaration)), span)
            }
            TokenKind::Keyword(Keyword::Return) => {
                let keyword = self.expect_next("return")?;

                let value = if self.next_is(TokenKind::Semicolon) {
                    None
                } else {
                    Some(Box::new(self.parse_expression()?))
                };

                (StatementKind::Return(value), keyword.span)
            }
            TokenKind::Identifier
                if self.source.value_of_span(peeked.span) == "print"
                    && self
                        .peek_nth(1)
                        .is_some_and(|t| t.kind == TokenKind::OpenParen) =>
            {
                self.next();
                self.expect_next_to_be(TokenKind::OpenParen, "`(`")?;
                let value = self.parse_expression()?;
                self.expect_next_to_be(TokenKind::CloseParen, "`)`")?;

                (StatementKind::Print(Box::new(value)), peeked.span)
            }
            _ => {
                let expression = self.parse_expression()?;
                let span = expression.span;
                (StatementKind::Expression(Box::new(expression)), span)
            }
        };

        let semicolon = self.expect_next_to_be(TokenKind::Semicolon, "`;`")?;

        Ok(Statement {
            span: start.to(semicolon.span),
            kind,
        })
    }

    // var name<2, 3> = expression
    fn parse_variable_declaration(&mut self) -> Result<VariableDeclaration, Error> {
        let keyword = self.expect_next_to_be(TokenKind::Keyword(Keyword::Var), "`var`")?;
        let name = self.parse_identifier()?;

        let shape = if self.next_is(TokenKind::LessThan) {
            Some(self.parse_shape_annotation()?)
        } else {
            None
        };

        let equals = self.expect_next("`=`")?;
        if equals.kind != TokenKind::Equals {
            return Err(self.fatal_error(
                equals.span,
                format!(
                    "variable `{}` must be initialized",
                    self.source.value_of_span(name.span)
                ),
            ));
        }

        let initializer = self.parse_expression()?;

        Ok(VariableDeclaration {
            span: keyword.span.to(initializer.span),
            name,
            shape,
            initializer: Box::new(initializer),
        })
    }

    // <2, 3>
    fn parse_shape_annotation(&mut self) -> Result<ShapeAnnotation, Error> {
        let open = self.expect_next_to_be(TokenKind::LessThan, "`<`")?;
        let mut dimensions = vec![self.parse_dimension()?];

        while self.next_is(TokenKind::Comma) {
            self.next();
            dimensions.push(self.parse_dimension()?);
        }

        let close = self.expect_next_to_be(TokenKind::GreaterThan, "`>`")?;

        Ok(ShapeAnnotation {
            span: open.span.to(close.span),
            dimensions,
        })
    }

    fn parse_dimension(&mut self) -> Result<usize, Error> {
        let token = self.expect_next_to_be(TokenKind::NumberLiteral, "shape dimension")?;
        let text = self.source.value_of_span(token.span);

        text.parse().map_err(|_| {
            self.fatal_error(
                token.span,
                format!("shape dimension `{text}` is not a non-negative integer"),
            )
        })
    }

    // expression = term ( "+" term )*
    fn parse_expression(&mut self) -> Result<Expression, Error> {
        let mut lhs = self.parse_term()?;

        while let Some(token) = self.peek().filter(|t| t.kind == TokenKind::Plus) {
            self.next();
            let rhs = self.parse_term()?;
            lhs = Self::binary(lhs, token, BinaryOperatorKind::Add, rhs);
        }

        Ok(lhs)
    }

    // term = primary ( ( "*" | "@" ) primary )*
    fn parse_term(&mut self) -> Result<Expression, Error> {
        let mut lhs = self.parse_primary()?;

        while let Some(token) = self.peek() {
            let kind = match token.kind {
                TokenKind::Asterisk => BinaryOperatorKind::Multiply,
                TokenKind::At => BinaryOperatorKind::MatMul,
                _ => break,
            };

            self.next();
            let rhs = self.parse_primary()?;
            lhs = Self::binary(lhs, token, kind, rhs);
        }

        Ok(lhs)
    }

    fn binary(lhs: Expression, token: Token, kind: BinaryOperatorKind, rhs: Expression) -> Expression {
        Expression {
            span: lhs.span.to(rhs.span),
            kind: ExpressionKind::Binary {
                lhs: Box::new(lhs),
                operator: BinaryOperator {
                    span: token.span,
                    kind,
                },
                rhs: Box::new(rhs),
            },
        }
    }

    fn parse_primary(&mut self) -> Result<Expression, Error> {
        let peeked = self.expect_peek("expression")?;

        match peeked.kind {
            TokenKind::NumberLiteral | TokenKind::OpenBracket => {
                let literal = self.parse_literal()?;

                Ok(Expression {
                    span: literal.span,
                    kind: ExpressionKind::Literal(Box::new(literal)),
                })
            }
            TokenKind::OpenParen => {
                self.next();
                let expression = self.parse_expression()?;
                self.expect_next_to_be(TokenKind::CloseParen, "`)`")?;
                Ok(expression)
            }
            TokenKind::Identifier => {
                let identifier = self.parse_identifier()?;

                if !self.next_is(TokenKind::OpenParen) {
                    return Ok(Expression {
                        span: identifier.span,
                        kind: ExpressionKind::Identifier(identifier),
                    });
                }

                if identifier.symbol.value() == "print" {
                    return Err(self.fatal_error(
                        identifier.span,
                        "`print` can only be used as a statement".to_string(),
                    ));
                }

                self.parse_call(identifier)
            }
            _ => Err(self.fatal_error(
                peeked.span,
                format!(
                    "expected expression but found `{}`",
                    self.source.value_of_span(peeked.span)
                ),
            )),
        }
    }

    // name(a, b)
    fn parse_call(&mut self, callee: Identifier) -> Result<Expression, Error> {
        self.expect_next_to_be(TokenKind::OpenParen, "`(`")?;
        let mut arguments = Vec::new();

        if !self.next_is(TokenKind::CloseParen) {
            arguments.push(self.parse_expression()?);

            while self.next_is(TokenKind::Comma) {
                self.next();
                arguments.push(self.parse_expression()?);
            }
        }

        let close_paren = self.expect_next_to_be(TokenKind::CloseParen, "`)`")?;

        Ok(Expression {
            span: callee.span.to(close_paren.span),
            kind: ExpressionKind::Call { callee, arguments },
        })
    }

    // 1.5 | [ literal ( "," literal )* ]
    fn parse_literal(&mut self) -> Result<Literal, Error> {
        let token = self.expect_next("number or `[`")?;

        match token.kind {
            TokenKind::NumberLiteral => {
                let text = self.source.value_of_span(token.span);
                let value = text.parse().map_err(|_| {
                    self.fatal_error(token.span, format!("invalid number literal `{text}`"))
                })?;

                Ok(Literal {
                    span: token.span,
                    kind: LiteralKind::Number(value),
                })
            }
            TokenKind::OpenBracket => {
                let mut elements = vec![self.parse_literal()?];

                while self.next_is(TokenKind::Comma) {
                    self.next();
                    elements.push(self.parse_literal()?);
                }

                let close = self.expect_next_to_be(TokenKind::CloseBracket, "`]`")?;

                Ok(Literal {
                    span: token.span.to(close.span),
                    kind: LiteralKind::Array(elements),
                })
            }
            _ => Err(self.fatal_error(
                token.span,
                format!(
                    "tensor literals may only contain numbers, found `{}`",
                    self.source.value_of_span(token.span)
                ),
            )),
        }
    }
}

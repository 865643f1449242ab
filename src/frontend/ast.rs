use super::{SourceFile, intern::InternedSymbol, lexer::Span};

#[derive(Debug)]
pub struct Module<'source> {
    pub source_file: &'source SourceFile,
    pub functions: Vec<FunctionDefinition>,
}

#[derive(Debug)]
pub struct FunctionDefinition {
    pub span: Span,
    pub name: Identifier,
    /// Parameters are always generic tensors so they carry no type
    pub parameters: Vec<Identifier>,
    pub body: Block,
}

#[derive(Debug, Clone, Copy)]
pub struct Identifier {
    pub span: Span,
    pub symbol: InternedSymbol,
}

#[derive(Debug)]
pub struct Block {
    pub span: Span,
    pub statements: Vec<Statement>,
}

#[derive(Debug)]
pub struct Statement {
    pub span: Span,
    pub kind: StatementKind,
}

#[derive(Debug)]
pub enum StatementKind {
    /// `var name<2, 3> = initializer;`
    VariableDeclaration(Box<VariableDeclaration>),
    /// `return;` or `return value;`
    Return(Option<Box<Expression>>),
    /// `print(value);`
    Print(Box<Expression>),
    /// Expression evaluated for nothing (its value is dropped)
    Expression(Box<Expression>),
}

#[derive(Debug)]
pub struct VariableDeclaration {
    pub span: Span,
    pub name: Identifier,
    pub shape: Option<ShapeAnnotation>,
    pub initializer: Box<Expression>,
}

/// The `<2, 3>` suffix on a variable declaration
#[derive(Debug, Clone)]
pub struct ShapeAnnotation {
    pub span: Span,
    pub dimensions: Vec<usize>,
}

#[derive(Debug)]
pub struct Expression {
    pub span: Span,
    pub kind: ExpressionKind,
}

#[derive(Debug)]
pub enum ExpressionKind {
    Literal(Box<Literal>),
    Identifier(Identifier),
    Binary {
        lhs: Box<Expression>,
        operator: BinaryOperator,
        rhs: Box<Expression>,
    },
    Call {
        callee: Identifier,
        arguments: Vec<Expression>,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct BinaryOperator {
    pub span: Span,
    pub kind: BinaryOperatorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperatorKind {
    Add,      // +
    Multiply, // *
    MatMul,   // @
}

impl core::fmt::Display for BinaryOperatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Add => write!(f, "+"),
            Self::Multiply => write!(f, "*"),
            Self::MatMul => write!(f, "@"),
        }
    }
}

#[derive(Debug)]
pub struct Literal {
    pub span: Span,
    pub kind: LiteralKind,
}

#[derive(Debug)]
pub enum LiteralKind {
    Number(f64),
    /// Nested array literal. Elements may be numbers or further arrays; the
    /// parser does not check that nesting is rectangular
    Array(Vec<Literal>),
}

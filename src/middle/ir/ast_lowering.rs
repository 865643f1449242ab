//! Builds tensor IR out of the AST. Name resolution happens along the way:
//! functions are bound module-wide before any body is lowered, while
//! parameters and variables live in a per-function scope stack.

use std::collections::{BTreeMap, VecDeque};

use crate::{
    error::{Error, ErrorKind},
    frontend::{
        Location, SourceFile,
        ast::{self, BinaryOperatorKind, ExpressionKind, LiteralKind, StatementKind},
        intern::InternedSymbol,
        lexer::Span,
    },
    middle::ir::{self, DenseLiteral, OperationKind, Shape, TensorType, ValueId},
};

/// What a module-level name refers to
#[derive(Debug, Clone, Copy)]
enum GlobalBinding {
    Function { arity: usize },
    /// Builtin taking exactly one tensor
    Transpose,
}

pub fn lower_module(module: &ast::Module) -> Result<ir::Module, Error> {
    let mut globals = BTreeMap::new();
    globals.insert(InternedSymbol::new("transpose"), GlobalBinding::Transpose);

    for function in &module.functions {
        let previous = globals.insert(
            function.name.symbol,
            GlobalBinding::Function {
                arity: function.parameters.len(),
            },
        );

        if previous.is_some() {
            return Err(Error::at(
                ErrorKind::Redefinition {
                    name: function.name.symbol,
                },
                module.source_file.location_of_span(function.name.span),
            ));
        }
    }

    let mut lowered = ir::Module::new();

    for function in &module.functions {
        let context = FunctionLoweringContext::new(module.source_file, &globals, function);
        lowered.add_function(context.lower(function)?)?;
    }

    Ok(lowered)
}

struct FunctionLoweringContext<'a> {
    source_file: &'a SourceFile,
    globals: &'a BTreeMap<InternedSymbol, GlobalBinding>,
    scopes: ScopeStack<ValueId>,
    function: ir::Function,
}

impl<'a> FunctionLoweringContext<'a> {
    fn new(
        source_file: &'a SourceFile,
        globals: &'a BTreeMap<InternedSymbol, GlobalBinding>,
        definition: &ast::FunctionDefinition,
    ) -> Self {
        let location = source_file.location_of_span(definition.name.span);

        Self {
            source_file,
            globals,
            scopes: ScopeStack::new(),
            function: ir::Function::new(definition.name.symbol, location),
        }
    }

    fn location(&self, span: Span) -> Location {
        self.source_file.location_of_span(span)
    }

    fn lower(mut self, definition: &ast::FunctionDefinition) -> Result<ir::Function, Error> {
        // Parameters get their own scope so a variable may shadow them
        self.scopes.push_scope();

        for parameter in &definition.parameters {
            if self.scopes.get_shallow_binding(parameter.symbol).is_some() {
                return Err(Error::at(
                    ErrorKind::Redefinition {
                        name: parameter.symbol,
                    },
                    self.location(parameter.span),
                ));
            }

            let argument = self.function.add_argument(TensorType::Unranked);
            self.scopes.add_binding(parameter.symbol, argument);
        }

        self.scopes.push_scope();

        let mut returned = false;

        for statement in &definition.body.statements {
            if returned {
                return Err(Error::at(
                    ErrorKind::Syntax("statement after `return` is never reached".to_string()),
                    self.location(statement.span),
                ));
            }

            returned = matches!(statement.kind, StatementKind::Return(_));
            self.lower_statement(statement)?;
        }

        if !returned {
            self.function.append_operation(
                OperationKind::Return,
                vec![],
                vec![],
                self.function.location,
            );
        }

        self.scopes.pop_scope();
        self.scopes.pop_scope();

        Ok(self.function)
    }

    fn lower_statement(&mut self, statement: &ast::Statement) -> Result<(), Error> {
        let location = self.location(statement.span);

        match &statement.kind {
            StatementKind::VariableDeclaration(declaration) => {
                self.lower_variable_declaration(declaration)
            }
            StatementKind::Return(value) => {
                let operands = match value {
                    Some(value) => {
                        self.function.result_types = vec![TensorType::Unranked];
                        vec![self.lower_expression(value)?]
                    }
                    None => vec![],
                };

                self.function
                    .append_operation(OperationKind::Return, operands, vec![], location);
                Ok(())
            }
            StatementKind::Print(value) => {
                let value = self.lower_expression(value)?;

                self.function
                    .append_operation(OperationKind::Print, vec![value], vec![], location);
                Ok(())
            }
            StatementKind::Expression(expression) => {
                self.lower_expression(expression)?;
                Ok(())
            }
        }
    }

    fn lower_variable_declaration(
        &mut self,
        declaration: &ast::VariableDeclaration,
    ) -> Result<(), Error> {
        let name = declaration.name;

        if self.scopes.get_shallow_binding(name.symbol).is_some() {
            return Err(Error::at(
                ErrorKind::Redefinition { name: name.symbol },
                self.location(name.span),
            ));
        }

        let mut value = self.lower_expression(&declaration.initializer)?;

        if let Some(annotation) = &declaration.shape {
            let shape = Shape::new(annotation.dimensions.clone());

            let Some(element_count) = shape.checked_element_count() else {
                return Err(Error::at(
                    ErrorKind::LiteralShape {
                        reason: format!(
                            "`{}` is declared with shape {shape}, which has too many elements",
                            name.symbol,
                        ),
                    },
                    self.location(annotation.span),
                ));
            };

            if let ExpressionKind::Literal(literal) = &declaration.initializer.kind {
                let literal = self.lower_literal(literal)?;

                if literal.shape().element_count() != element_count {
                    return Err(Error::at(
                        ErrorKind::LiteralShape {
                            reason: format!(
                                "literal of shape {} has {} element(s) but `{}` is declared with shape {shape}",
                                literal.shape(),
                                literal.shape().element_count(),
                                name.symbol,
                            ),
                        },
                        self.location(annotation.span),
                    ));
                }
            }

            let reshape = self.function.append_operation(
                OperationKind::Reshape {
                    shape: shape.clone(),
                },
                vec![value],
                vec![TensorType::Ranked(shape)],
                self.location(declaration.span),
            );

            value = self.function.operation(reshape).result();
        }

        self.scopes.add_binding(name.symbol, value);
        Ok(())
    }

    fn lower_expression(&mut self, expression: &ast::Expression) -> Result<ValueId, Error> {
        let location = self.location(expression.span);

        let operation = match &expression.kind {
            ExpressionKind::Literal(literal) => {
                let value = self.lower_literal(literal)?;
                let ty = TensorType::Ranked(value.shape().clone());

                self.function.append_operation(
                    OperationKind::Constant { value },
                    vec![],
                    vec![ty],
                    location,
                )
            }
            ExpressionKind::Identifier(identifier) => {
                return match self.scopes.get_binding(identifier.symbol) {
                    Some(value) => Ok(*value),
                    None => Err(Error::at(
                        ErrorKind::UndeclaredSymbol {
                            name: identifier.symbol,
                        },
                        self.location(identifier.span),
                    )),
                };
            }
            ExpressionKind::Binary { lhs, operator, rhs } => {
                let lhs = self.lower_expression(lhs)?;
                let rhs = self.lower_expression(rhs)?;

                let kind = match operator.kind {
                    BinaryOperatorKind::Add => OperationKind::Add,
                    BinaryOperatorKind::Multiply => OperationKind::Multiply,
                    BinaryOperatorKind::MatMul => OperationKind::MatMul,
                };

                self.function.append_operation(
                    kind,
                    vec![lhs, rhs],
                    vec![TensorType::Unranked],
                    self.location(operator.span),
                )
            }
            ExpressionKind::Call { callee, arguments } => {
                let Some(binding) = self.globals.get(&callee.symbol).copied() else {
                    return Err(Error::at(
                        ErrorKind::UndeclaredSymbol {
                            name: callee.symbol,
                        },
                        self.location(callee.span),
                    ));
                };

                let (kind, arity) = match binding {
                    GlobalBinding::Transpose => (OperationKind::Transpose, 1),
                    GlobalBinding::Function { arity } => (
                        OperationKind::GenericCall {
                            callee: callee.symbol,
                        },
                        arity,
                    ),
                };

                if arguments.len() != arity {
                    return Err(Error::at(
                        ErrorKind::ArgumentCount {
                            callee: callee.symbol,
                            expected: arity,
                            actual: arguments.len(),
                        },
                        location,
                    ));
                }

                let operands = arguments
                    .iter()
                    .map(|argument| self.lower_expression(argument))
                    .collect::<Result<Vec<_>, _>>()?;

                self.function
                    .append_operation(kind, operands, vec![TensorType::Unranked], location)
            }
        };

        Ok(self.function.operation(operation).result())
    }

    /// Flattens a literal into row-major order, checking that every level of
    /// nesting is rectangular
    fn lower_literal(&self, literal: &ast::Literal) -> Result<DenseLiteral, Error> {
        let (dimensions, values) = self.flatten_literal(literal)?;

        Ok(DenseLiteral::new(Shape::new(dimensions), values))
    }

    fn flatten_literal(&self, literal: &ast::Literal) -> Result<(Vec<usize>, Vec<f64>), Error> {
        let elements = match &literal.kind {
            LiteralKind::Number(value) => return Ok((vec![], vec![*value])),
            LiteralKind::Array(elements) => elements,
        };

        let Some((first, rest)) = elements.split_first() else {
            return Err(Error::at(
                ErrorKind::LiteralShape {
                    reason: "array literals cannot be empty".to_string(),
                },
                self.location(literal.span),
            ));
        };

        let (inner, mut values) = self.flatten_literal(first)?;

        for element in rest {
            let (element_dimensions, element_values) = self.flatten_literal(element)?;

            if element_dimensions != inner {
                return Err(Error::at(
                    ErrorKind::LiteralShape {
                        reason: format!(
                            "element has shape {} but the first element has shape {}",
                            Shape::new(element_dimensions),
                            Shape::new(inner)
                        ),
                    },
                    self.location(element.span),
                ));
            }

            values.extend(element_values);
        }

        let dimensions = std::iter::once(elements.len()).chain(inner).collect();

        Ok((dimensions, values))
    }
}

#[derive(Debug)]
struct ScopeStack<R> {
    stack: VecDeque<BTreeMap<InternedSymbol, R>>,
}

impl<R> ScopeStack<R> {
    fn new() -> Self {
        Self {
            stack: VecDeque::new(),
        }
    }

    fn push_scope(&mut self) {
        self.stack.push_back(BTreeMap::new());
    }

    fn pop_scope(&mut self) {
        assert!(
            !self.stack.is_empty(),
            "Attempted to pop a scope from an empty stack"
        );

        self.stack.pop_back();
    }

    /// Looks for a binding only within the current (most nested) scope
    fn get_shallow_binding(&self, symbol: InternedSymbol) -> Option<&R> {
        self.stack.back().and_then(|scope| scope.get(&symbol))
    }

    /// Adds a binding within the current (most nested) scope
    fn add_binding(&mut self, symbol: InternedSymbol, resolution: R) {
        let scope = self
            .stack
            .back_mut()
            .expect("Tried to add a binding without any scope");

        scope.insert(symbol, resolution);
    }

    /// Traverses the scope stack from back to front looking for bindings
    fn get_binding(&self, symbol: InternedSymbol) -> Option<&R> {
        self.stack.iter().rev().find_map(|scope| scope.get(&symbol))
    }
}

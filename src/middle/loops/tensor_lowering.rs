//! Lowers the specialized entry function from tensor IR to loop IR. Each
//! tensor result gets its own buffer. All buffers are allocated at the top of
//! the function and released in reverse order right before it returns.

use hashbrown::HashMap;

use crate::{
    error::Error,
    frontend::intern::InternedSymbol,
    index::{Index, IndexVec},
    middle::{
        ir::{self, OperationKind, Shape, TensorType, ValueId},
        loops::{
            self, ArithmeticOperator, Buffer, BufferId, IndexExpr, Instruction, LoopVariableId,
            Operand, RegisterId,
        },
    },
};

pub fn lower_module(module: &ir::Module, entry: InternedSymbol) -> Result<loops::Module, Error> {
    let [function] = &module.functions[..] else {
        return Err(Error::invariant(
            format!(
                "expected only the entry function before lowering to loops, found {} functions",
                module.functions.len()
            ),
            None,
        ));
    };

    if function.name != entry {
        return Err(Error::invariant(
            format!("expected entry function `{entry}`, found `{}`", function.name),
            Some(function.location),
        ));
    }

    if !function.arguments.is_empty() || !function.result_types.is_empty() {
        return Err(Error::invariant(
            format!("entry function `{entry}` must not take arguments or return values"),
            Some(function.location),
        ));
    }

    let lowered = BodyLoweringContext::new(function).lower()?;
    loops::verify::verify_function(&lowered)?;

    Ok(loops::Module {
        functions: vec![lowered],
    })
}

/// Decides whether an operation can be expressed with loops and buffers
fn check_legality(function: &ir::Function, operation: &ir::Operation) -> Result<(), Error> {
    let illegal = |reason: String| {
        Err(Error::invariant(
            format!("cannot lower `{}` to loops: {reason}", operation.name()),
            Some(operation.location),
        ))
    };

    if let Some(value) = operation
        .operands
        .iter()
        .chain(&operation.results)
        .find(|value| !function.value_type(**value).is_ranked())
    {
        return illegal(format!(
            "value of type {} has no known shape",
            function.value_type(*value)
        ));
    }

    match &operation.kind {
        OperationKind::GenericCall { callee } => {
            illegal(format!("call to `{callee}` was not inlined"))
        }
        OperationKind::Return if !operation.operands.is_empty() => {
            illegal("the entry function cannot return a value".to_string())
        }
        OperationKind::Constant { .. }
        | OperationKind::Add
        | OperationKind::Multiply
        | OperationKind::MatMul
        | OperationKind::Transpose
        | OperationKind::Reshape { .. }
        | OperationKind::Cast
        | OperationKind::Print
        | OperationKind::Return => Ok(()),
    }
}

struct BodyLoweringContext<'ir> {
    function: &'ir ir::Function,

    buffers: IndexVec<BufferId, Buffer>,
    value_to_buffer_map: HashMap<ValueId, BufferId>,
    next_register: RegisterId,
    next_loop_variable: LoopVariableId,

    /// Innermost loop body last
    body_stack: Vec<Vec<Instruction>>,
}

impl<'ir> BodyLoweringContext<'ir> {
    fn new(function: &'ir ir::Function) -> Self {
        Self {
            function,
            buffers: IndexVec::new(),
            value_to_buffer_map: HashMap::new(),
            next_register: RegisterId::new(0),
            next_loop_variable: LoopVariableId::new(0),
            body_stack: vec![Vec::new()],
        }
    }

    fn lower(mut self) -> Result<loops::Function, Error> {
        let function = self.function;

        for operation in function.operations() {
            check_legality(function, operation)?;
            self.lower_operation(operation)?;
        }

        let Some(body) = self.body_stack.pop().filter(|_| self.body_stack.is_empty()) else {
            return Err(Error::invariant(
                "loop nest was left open".to_string(),
                Some(self.function.location),
            ));
        };

        let allocations = self
            .buffers
            .indices()
            .map(|buffer| Instruction::Alloc { buffer });

        let deallocations = self
            .buffers
            .indices()
            .rev()
            .map(|buffer| Instruction::Dealloc { buffer });

        let body = allocations
            .chain(body)
            .chain(deallocations)
            .chain(std::iter::once(Instruction::Return))
            .collect();

        Ok(loops::Function {
            name: self.function.name,
            buffers: self.buffers,
            register_count: self.next_register.index(),
            loop_variable_count: self.next_loop_variable.index(),
            body,
        })
    }

    fn create_register(&mut self) -> RegisterId {
        let id = self.next_register;
        self.next_register.increment_by(1);
        id
    }

    fn create_loop_variable(&mut self) -> LoopVariableId {
        let id = self.next_loop_variable;
        self.next_loop_variable.increment_by(1);
        id
    }

    fn push_instruction(&mut self, instruction: Instruction) {
        self.body_stack
            .last_mut()
            .expect("there is always an outermost body")
            .push(instruction);
    }

    fn shape_of(&self, value: ValueId) -> Result<Shape, Error> {
        match self.function.value_type(value) {
            TensorType::Ranked(shape) => Ok(shape.clone()),
            TensorType::Unranked => Err(Error::invariant(
                "unranked value reached loop lowering".to_string(),
                Some(self.function.location),
            )),
        }
    }

    fn buffer_of(&self, value: ValueId) -> Result<BufferId, Error> {
        self.value_to_buffer_map.get(&value).copied().ok_or_else(|| {
            Error::invariant(
                format!("value {value:?} has no buffer"),
                Some(self.function.location),
            )
        })
    }

    /// Creates the buffer holding the single result of `operation`
    fn allocate_result(&mut self, operation: &ir::Operation) -> Result<(BufferId, Shape), Error> {
        let result = operation.result();
        let shape = self.shape_of(result)?;

        let id = self.buffers.next_index();
        self.buffers.push(Buffer {
            id,
            shape: shape.clone(),
            location: operation.location,
        });

        self.value_to_buffer_map.insert(result, id);
        Ok((id, shape))
    }

    fn load(&mut self, buffer: BufferId, indices: Vec<IndexExpr>) -> Operand {
        let destination = self.create_register();

        self.push_instruction(Instruction::Load {
            destination,
            buffer,
            indices,
        });

        Operand::Register(destination)
    }

    fn arithmetic(&mut self, operator: ArithmeticOperator, lhs: Operand, rhs: Operand) -> Operand {
        let destination = self.create_register();

        self.push_instruction(Instruction::Arithmetic {
            operator,
            destination,
            lhs,
            rhs,
        });

        Operand::Register(destination)
    }

    /// Emits one loop per dimension, outermost first, and builds the innermost
    /// body with the induction variables as indices
    fn build_loop_nest(
        &mut self,
        dimensions: &[usize],
        build_body: impl FnOnce(&mut Self, &[IndexExpr]),
    ) {
        let variables = dimensions
            .iter()
            .map(|_| self.create_loop_variable())
            .collect::<Vec<_>>();

        self.body_stack
            .extend(dimensions.iter().map(|_| Vec::new()));

        let indices = variables
            .iter()
            .map(|variable| IndexExpr::Variable(*variable))
            .collect::<Vec<_>>();

        build_body(self, &indices);

        for (variable, dimension) in variables.into_iter().zip(dimensions).rev() {
            let body = self
                .body_stack
                .pop()
                .expect("every loop pushed its own body");

            self.push_instruction(Instruction::For {
                variable,
                lower_bound: 0,
                upper_bound: *dimension,
                step: 1,
                body,
            });
        }
    }

    fn lower_operation(&mut self, operation: &ir::Operation) -> Result<(), Error> {
        match &operation.kind {
            OperationKind::Constant { value } => {
                let (buffer, shape) = self.allocate_result(operation)?;

                for (offset, element) in value.values().iter().enumerate() {
                    let indices = unravel(offset, shape.dimensions())
                        .into_iter()
                        .map(IndexExpr::Constant)
                        .collect();

                    self.push_instruction(Instruction::Store {
                        value: Operand::Immediate(*element),
                        buffer,
                        indices,
                    });
                }
            }
            OperationKind::Add | OperationKind::Multiply => {
                let operator = match operation.kind {
                    OperationKind::Add => ArithmeticOperator::Add,
                    _ => ArithmeticOperator::Multiply,
                };

                let lhs = self.buffer_of(operation.operands[0])?;
                let rhs = self.buffer_of(operation.operands[1])?;
                let (buffer, shape) = self.allocate_result(operation)?;

                self.build_loop_nest(shape.dimensions(), |this, indices| {
                    let lhs = this.load(lhs, indices.to_vec());
                    let rhs = this.load(rhs, indices.to_vec());
                    let value = this.arithmetic(operator, lhs, rhs);

                    this.push_instruction(Instruction::Store {
                        value,
                        buffer,
                        indices: indices.to_vec(),
                    });
                });
            }
            OperationKind::MatMul => {
                let lhs = self.buffer_of(operation.operands[0])?;
                let rhs = self.buffer_of(operation.operands[1])?;
                let reduction = self.shape_of(operation.operands[0])?.dimensions()[1];
                let (buffer, shape) = self.allocate_result(operation)?;

                self.build_loop_nest(shape.dimensions(), |this, indices| {
                    this.push_instruction(Instruction::Store {
                        value: Operand::Immediate(0.0),
                        buffer,
                        indices: indices.to_vec(),
                    });
                });

                let (rows, columns) = (shape.dimensions()[0], shape.dimensions()[1]);

                self.build_loop_nest(&[rows, columns, reduction], |this, indices| {
                    let &[i, j, k] = indices else {
                        unreachable!("matmul nest is three loops deep");
                    };

                    let lhs = this.load(lhs, vec![i, k]);
                    // rhs is addressed with the column index first
                    let rhs = this.load(rhs, vec![j, k]);
                    let accumulator = this.load(buffer, vec![i, j]);
                    let product = this.arithmetic(ArithmeticOperator::Multiply, lhs, rhs);
                    let sum = this.arithmetic(ArithmeticOperator::Add, accumulator, product);

                    this.push_instruction(Instruction::Store {
                        value: sum,
                        buffer,
                        indices: vec![i, j],
                    });
                });
            }
            OperationKind::Transpose => {
                let operand = self.buffer_of(operation.operands[0])?;
                let (buffer, shape) = self.allocate_result(operation)?;

                self.build_loop_nest(shape.dimensions(), |this, indices| {
                    let reversed = indices.iter().rev().copied().collect();
                    let value = this.load(operand, reversed);

                    this.push_instruction(Instruction::Store {
                        value,
                        buffer,
                        indices: indices.to_vec(),
                    });
                });
            }
            OperationKind::Reshape { .. } => {
                let source = self.buffer_of(operation.operands[0])?;
                let (destination, _) = self.allocate_result(operation)?;

                self.push_instruction(Instruction::Copy {
                    source,
                    destination,
                });
            }
            OperationKind::Cast => {
                let operand = self.buffer_of(operation.operands[0])?;

                self.value_to_buffer_map
                    .insert(operation.result(), operand);
            }
            OperationKind::Print => {
                let buffer = self.buffer_of(operation.operands[0])?;

                self.push_instruction(Instruction::Print { buffer });
            }
            // The final return is emitted after the deallocations
            OperationKind::Return => {}
            OperationKind::GenericCall { callee } => {
                return Err(Error::invariant(
                    format!("call to `{callee}` was not inlined"),
                    Some(operation.location),
                ));
            }
        }

        Ok(())
    }
}

/// Row-major index tuple of a flat offset
fn unravel(mut offset: usize, dimensions: &[usize]) -> Vec<usize> {
    let mut indices = vec![0; dimensions.len()];

    for (index, dimension) in indices.iter_mut().zip(dimensions).rev() {
        *index = offset % dimension;
        offset /= dimension;
    }

    indices
}

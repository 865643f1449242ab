use std::io::Write;

use itertools::Itertools;

use crate::{
    backend::{ExecutionOptions, targets::ExecutionEngine},
    error::{Error, ErrorKind},
    index::{Index, IndexVec},
    middle::{
        ir::ty::write_nested,
        loops::{self, BufferId, IndexExpr, Instruction, Operand},
    },
};

/// Executes loop IR directly, one instruction at a time
pub struct Interpreter;

impl ExecutionEngine for Interpreter {
    fn execute(
        &self,
        module: &loops::Module,
        options: &ExecutionOptions,
        output: &mut dyn Write,
    ) -> Result<(), Error> {
        let Some(function) = module.get(options.entry) else {
            return Err(Error::new(
                ErrorKind::UndeclaredSymbol {
                    name: options.entry,
                },
                None,
            ));
        };

        let mut frame = Frame {
            function,
            buffers: IndexVec::from_raw(vec![BufferSlot::Unallocated; function.buffers.len()]),
            registers: vec![0.0; function.register_count],
            loop_variables: vec![0; function.loop_variable_count],
            output,
        };

        frame.execute_block(&function.body)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum BufferSlot {
    Unallocated,
    Live(Vec<f64>),
    Released,
}

struct Frame<'ir, 'output> {
    function: &'ir loops::Function,
    buffers: IndexVec<BufferId, BufferSlot>,
    registers: Vec<f64>,
    loop_variables: Vec<usize>,
    output: &'output mut dyn Write,
}

/// Whether execution should continue after a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Return,
}

fn execution_error(message: String) -> Error {
    Error::new(ErrorKind::Execution(message), None)
}

impl Frame<'_, '_> {
    fn execute_block(&mut self, instructions: &[Instruction]) -> Result<Flow, Error> {
        for instruction in instructions {
            match instruction {
                Instruction::Alloc { buffer } => {
                    let element_count = self.function.buffers[*buffer].shape.element_count();
                    self.buffers[*buffer] = BufferSlot::Live(vec![0.0; element_count]);
                }
                Instruction::Dealloc { buffer } => {
                    self.live_buffer(*buffer)?;
                    self.buffers[*buffer] = BufferSlot::Released;
                }
                Instruction::Load {
                    destination,
                    buffer,
                    indices,
                } => {
                    let offset = self.offset(*buffer, indices)?;
                    let value = self.live_buffer(*buffer)?[offset];

                    self.registers[destination.index()] = value;
                }
                Instruction::Store {
                    value,
                    buffer,
                    indices,
                } => {
                    let value = self.operand(*value);
                    let offset = self.offset(*buffer, indices)?;

                    self.live_buffer_mut(*buffer)?[offset] = value;
                }
                Instruction::Arithmetic {
                    operator,
                    destination,
                    lhs,
                    rhs,
                } => {
                    self.registers[destination.index()] =
                        operator.apply(self.operand(*lhs), self.operand(*rhs));
                }
                Instruction::For {
                    variable,
                    lower_bound,
                    upper_bound,
                    step,
                    body,
                } => {
                    for value in (*lower_bound..*upper_bound).step_by(*step) {
                        self.loop_variables[variable.index()] = value;

                        if self.execute_block(body)? == Flow::Return {
                            return Ok(Flow::Return);
                        }
                    }
                }
                Instruction::Copy {
                    source,
                    destination,
                } => {
                    let values = self.live_buffer(*source)?.clone();
                    let target = self.live_buffer_mut(*destination)?;

                    if values.len() != target.len() {
                        return Err(execution_error(format!(
                            "cannot copy {} elements into a buffer of {}",
                            values.len(),
                            target.len()
                        )));
                    }

                    target.copy_from_slice(&values);
                }
                Instruction::Print { buffer } => {
                    let mut line = String::new();

                    write_nested(
                        &mut line,
                        self.function.buffers[*buffer].shape.dimensions(),
                        self.live_buffer(*buffer)?,
                        ",",
                    )
                    .map_err(|_| execution_error("failed to format buffer".to_string()))?;

                    writeln!(self.output, "{line}")
                        .map_err(|error| execution_error(format!("failed to print: {error}")))?;
                }
                Instruction::Return => return Ok(Flow::Return),
            }
        }

        Ok(Flow::Continue)
    }

    fn operand(&self, operand: Operand) -> f64 {
        match operand {
            Operand::Immediate(value) => value,
            Operand::Register(register) => self.registers[register.index()],
        }
    }

    fn live_buffer(&self, buffer: BufferId) -> Result<&Vec<f64>, Error> {
        match &self.buffers[buffer] {
            BufferSlot::Live(values) => Ok(values),
            BufferSlot::Unallocated => Err(execution_error(format!(
                "buffer {} read before allocation",
                buffer.index()
            ))),
            BufferSlot::Released => Err(execution_error(format!(
                "buffer {} used after release",
                buffer.index()
            ))),
        }
    }

    fn live_buffer_mut(&mut self, buffer: BufferId) -> Result<&mut Vec<f64>, Error> {
        match &mut self.buffers[buffer] {
            BufferSlot::Live(values) => Ok(values),
            BufferSlot::Unallocated => Err(execution_error(format!(
                "buffer {} written before allocation",
                buffer.index()
            ))),
            BufferSlot::Released => Err(execution_error(format!(
                "buffer {} used after release",
                buffer.index()
            ))),
        }
    }

    /// Row-major offset of an index tuple into `buffer`
    fn offset(&self, buffer: BufferId, indices: &[IndexExpr]) -> Result<usize, Error> {
        let indices = indices
            .iter()
            .map(|index| match index {
                IndexExpr::Constant(value) => *value,
                IndexExpr::Variable(variable) => self.loop_variables[variable.index()],
            })
            .collect::<Vec<_>>();

        let shape = &self.function.buffers[buffer].shape;

        shape.linear_offset(&indices).ok_or_else(|| {
            execution_error(format!(
                "index [{}] is out of bounds for buffer {} of shape {shape}",
                indices.iter().join(", "),
                buffer.index()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::targets::Target,
        frontend::{Location, intern::InternedSymbol},
        middle::{ir::Shape, loops::Buffer},
    };

    fn run(shape: &[usize], body: Vec<Instruction>) -> Result<String, Error> {
        let location = Location {
            file: InternedSymbol::new("<test>"),
            line: 1,
            column: 1,
        };

        let mut buffers: IndexVec<BufferId, Buffer> = IndexVec::new();
        buffers.push(Buffer {
            id: BufferId::new(0),
            shape: Shape::new(shape.to_vec()),
            location,
        });

        let module = loops::Module {
            functions: vec![loops::Function {
                name: InternedSymbol::new("main"),
                buffers,
                register_count: 1,
                loop_variable_count: 1,
                body,
            }],
        };

        let mut output = Vec::new();

        Target::Interpreter.get_execution_engine().execute(
            &module,
            &ExecutionOptions {
                entry: InternedSymbol::new("main"),
            },
            &mut output,
        )?;

        Ok(String::from_utf8(output).unwrap())
    }

    fn buffer() -> BufferId {
        BufferId::new(0)
    }

    #[test]
    fn prints_nested_brackets_without_spaces() {
        let variable = loops::LoopVariableId::new(0);

        let output = run(
            &[2, 2],
            vec![
                Instruction::Alloc { buffer: buffer() },
                Instruction::Store {
                    value: Operand::Immediate(1.5),
                    buffer: buffer(),
                    indices: vec![IndexExpr::Constant(0), IndexExpr::Constant(1)],
                },
                Instruction::For {
                    variable,
                    lower_bound: 0,
                    upper_bound: 2,
                    step: 1,
                    body: vec![Instruction::Store {
                        value: Operand::Immediate(4.0),
                        buffer: buffer(),
                        indices: vec![IndexExpr::Constant(1), IndexExpr::Variable(variable)],
                    }],
                },
                Instruction::Print { buffer: buffer() },
                Instruction::Dealloc { buffer: buffer() },
                Instruction::Return,
            ],
        )
        .unwrap();

        assert_eq!(output, "[[0,1.5],[4,4]]\n");
    }

    #[test]
    fn scalar_prints_bare_number() {
        let output = run(
            &[],
            vec![
                Instruction::Alloc { buffer: buffer() },
                Instruction::Store {
                    value: Operand::Immediate(7.0),
                    buffer: buffer(),
                    indices: vec![],
                },
                Instruction::Print { buffer: buffer() },
                Instruction::Dealloc { buffer: buffer() },
                Instruction::Return,
            ],
        )
        .unwrap();

        assert_eq!(output, "7\n");
    }

    #[test]
    fn out_of_bounds_access_fails() {
        let error = run(
            &[2],
            vec![
                Instruction::Alloc { buffer: buffer() },
                Instruction::Load {
                    destination: loops::RegisterId::new(0),
                    buffer: buffer(),
                    indices: vec![IndexExpr::Constant(2)],
                },
                Instruction::Return,
            ],
        )
        .unwrap_err();

        assert!(matches!(error.kind, ErrorKind::Execution(_)));
    }

    #[test]
    fn use_after_release_fails() {
        let error = run(
            &[1],
            vec![
                Instruction::Alloc { buffer: buffer() },
                Instruction::Dealloc { buffer: buffer() },
                Instruction::Print { buffer: buffer() },
                Instruction::Return,
            ],
        )
        .unwrap_err();

        assert!(matches!(error.kind, ErrorKind::Execution(_)));
    }
}

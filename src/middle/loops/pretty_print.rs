use colored::Colorize;
use itertools::Itertools;

use crate::{index::Index, middle::loops};

impl core::fmt::Display for loops::Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, function) in self.functions.iter().enumerate() {
            if i != 0 {
                writeln!(f)?;
            }

            write!(f, "{function}")?;
        }

        Ok(())
    }
}

impl core::fmt::Display for loops::Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} {}{}",
            "func".magenta(),
            format!("@{}", self.name).blue(),
            "() {".white()
        )?;

        write_instructions(f, self, &self.body, 1)?;

        writeln!(f, "{}", "}".white())
    }
}

fn write_instructions(
    f: &mut std::fmt::Formatter<'_>,
    function: &loops::Function,
    instructions: &[loops::Instruction],
    depth: usize,
) -> std::fmt::Result {
    let indent = "  ".repeat(depth);

    for instruction in instructions {
        write!(f, "{indent}")?;

        match instruction {
            loops::Instruction::Alloc { buffer } => writeln!(
                f,
                "{buffer} {} {} {} memref<{}f64>",
                "=".white(),
                "alloc".cyan(),
                ":".white(),
                function.buffers[*buffer]
                    .shape
                    .dimensions()
                    .iter()
                    .map(|dimension| format!("{dimension}x"))
                    .join("")
            )?,
            loops::Instruction::Dealloc { buffer } => {
                writeln!(f, "{} {buffer}", "dealloc".cyan())?
            }
            loops::Instruction::Load {
                destination,
                buffer,
                indices,
            } => writeln!(
                f,
                "{destination} {} {} {buffer}[{}]",
                "=".white(),
                "load".cyan(),
                indices.iter().join(", ")
            )?,
            loops::Instruction::Store {
                value,
                buffer,
                indices,
            } => writeln!(
                f,
                "{} {value}, {buffer}[{}]",
                "store".cyan(),
                indices.iter().join(", ")
            )?,
            loops::Instruction::Arithmetic {
                operator,
                destination,
                lhs,
                rhs,
            } => {
                let name = match operator {
                    loops::ArithmeticOperator::Add => "addf",
                    loops::ArithmeticOperator::Multiply => "mulf",
                };

                writeln!(
                    f,
                    "{destination} {} {} {lhs}, {rhs}",
                    "=".white(),
                    name.cyan()
                )?
            }
            loops::Instruction::For {
                variable,
                lower_bound,
                upper_bound,
                step,
                body,
            } => {
                writeln!(
                    f,
                    "{} {variable} = {} {} {}{} {{",
                    "for".bright_green(),
                    lower_bound.to_string().purple(),
                    "to".bright_green(),
                    upper_bound.to_string().purple(),
                    if *step == 1 {
                        String::new()
                    } else {
                        format!(" {} {}", "step".bright_green(), step.to_string().purple())
                    }
                )?;

                write_instructions(f, function, body, depth + 1)?;

                writeln!(f, "{indent}}}")?
            }
            loops::Instruction::Copy {
                source,
                destination,
            } => writeln!(f, "{} {source}, {destination}", "copy".cyan())?,
            loops::Instruction::Print { buffer } => writeln!(f, "{} {buffer}", "print".cyan())?,
            loops::Instruction::Return => writeln!(f, "{}", "return".cyan())?,
        }
    }

    Ok(())
}

impl core::fmt::Display for loops::BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format!("%buf{}", self.index()).yellow())
    }
}

impl core::fmt::Display for loops::RegisterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format!("%r{}", self.index()).yellow())
    }
}

impl core::fmt::Display for loops::LoopVariableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format!("%i{}", self.index()).bright_red())
    }
}

impl core::fmt::Display for loops::IndexExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            loops::IndexExpr::Constant(value) => write!(f, "{}", value.to_string().purple()),
            loops::IndexExpr::Variable(variable) => write!(f, "{variable}"),
        }
    }
}

impl core::fmt::Display for loops::Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            loops::Operand::Immediate(value) => write!(f, "{}", value.to_string().purple()),
            loops::Operand::Register(register) => write!(f, "{register}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use crate::{
        frontend::{Location, intern::InternedSymbol},
        index::{Index, IndexVec},
        middle::{
            ir::Shape,
            loops::{
                ArithmeticOperator, Buffer, BufferId, Function, IndexExpr, Instruction,
                LoopVariableId, Operand, RegisterId,
            },
        },
    };

    #[test]
    fn loops_print_with_nested_indentation() {
        let location = Location {
            file: InternedSymbol::new("<test>"),
            line: 1,
            column: 1,
        };

        let mut buffers: IndexVec<BufferId, Buffer> = IndexVec::new();
        let buffer = buffers.next_index();
        buffers.push(Buffer {
            id: buffer,
            shape: Shape::new([3]),
            location,
        });

        let variable = LoopVariableId::new(0);
        let register = RegisterId::new(0);
        let doubled = RegisterId::new(1);

        let function = Function {
            name: InternedSymbol::new("main"),
            buffers,
            register_count: 2,
            loop_variable_count: 1,
            body: vec![
                Instruction::Alloc { buffer },
                Instruction::Store {
                    value: Operand::Immediate(1.5),
                    buffer,
                    indices: vec![IndexExpr::Constant(0)],
                },
                Instruction::For {
                    variable,
                    lower_bound: 0,
                    upper_bound: 3,
                    step: 2,
                    body: vec![
                        Instruction::Load {
                            destination: register,
                            buffer,
                            indices: vec![IndexExpr::Variable(variable)],
                        },
                        Instruction::Arithmetic {
                            operator: ArithmeticOperator::Add,
                            destination: doubled,
                            lhs: Operand::Register(register),
                            rhs: Operand::Register(register),
                        },
                    ],
                },
                Instruction::Print { buffer },
                Instruction::Dealloc { buffer },
                Instruction::Return,
            ],
        };

        assert_eq!(
            strip_ansi_escapes::strip_str(function.to_string()),
            indoc! {"
                func @main() {
                  %buf0 = alloc : memref<3xf64>
                  store 1.5, %buf0[0]
                  for %i0 = 0 to 3 step 2 {
                    %r0 = load %buf0[%i0]
                    %r1 = addf %r0, %r0
                  }
                  print %buf0
                  dealloc %buf0
                  return
                }
            "}
        );
    }
}

//! Buffer discipline checks for loop IR. Every buffer is allocated once and
//! released once, used only in between, and always indexed with as many
//! in-bounds indices as it has dimensions. A loop variable is in bounds when
//! the last value its loop reaches is.

use hashbrown::{HashMap, HashSet};

use crate::{
    error::Error,
    frontend::Location,
    index::Index,
    middle::loops::{
        self, BufferId, IndexExpr, Instruction, LoopVariableId, Operand, RegisterId,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    Live,
    Released,
}

pub fn verify_function(function: &loops::Function) -> Result<(), Error> {
    let mut verifier = Verifier {
        function,
        buffer_states: HashMap::new(),
        loop_variables: Vec::new(),
        nest_location: None,
        registers: Vec::new(),
        defined_registers: HashSet::new(),
    };

    verifier.verify_block(&function.body, true)?;

    if function.body.last() != Some(&Instruction::Return) {
        return Err(verifier.violation("function must end with `return`".to_string()));
    }

    for buffer in function.buffers.indices() {
        match verifier.buffer_states.get(&buffer) {
            Some(BufferState::Released) => {}
            Some(BufferState::Live) => {
                return Err(verifier.violation(format!("{buffer:?} is never released")));
            }
            None => {
                return Err(verifier.violation(format!("{buffer:?} is never allocated")));
            }
        }
    }

    Ok(())
}

struct Verifier<'a> {
    function: &'a loops::Function,
    buffer_states: HashMap<BufferId, BufferState>,
    /// Induction variables of the enclosing loops with the last value each
    /// one takes, or `None` if its loop never runs
    loop_variables: Vec<(LoopVariableId, Option<usize>)>,
    /// Operation the current top-level loop nest was lowered from
    nest_location: Option<Location>,
    /// Registers visible at the current point, innermost scope last
    registers: Vec<RegisterId>,
    /// Every register ever written, to catch a second definition
    defined_registers: HashSet<RegisterId>,
}

impl Verifier<'_> {
    fn violation(&self, message: String) -> Error {
        Error::invariant(
            format!("in loop function `{}`: {message}", self.function.name),
            None,
        )
    }

    fn violation_in_nest(&self, message: String) -> Error {
        Error::invariant(
            format!("in loop function `{}`: {message}", self.function.name),
            self.nest_location,
        )
    }

    fn verify_block(&mut self, instructions: &[Instruction], top_level: bool) -> Result<(), Error> {
        for (position, instruction) in instructions.iter().enumerate() {
            match instruction {
                Instruction::Alloc { buffer } => {
                    self.expect_top_level(top_level, "alloc")?;
                    self.expect_buffer_exists(*buffer)?;

                    if self
                        .buffer_states
                        .insert(*buffer, BufferState::Live)
                        .is_some()
                    {
                        return Err(self.violation(format!("{buffer:?} is allocated twice")));
                    }
                }
                Instruction::Dealloc { buffer } => {
                    self.expect_top_level(top_level, "dealloc")?;
                    self.expect_live(*buffer)?;
                    self.buffer_states.insert(*buffer, BufferState::Released);
                }
                Instruction::Load {
                    destination,
                    buffer,
                    indices,
                } => {
                    self.expect_indices(*buffer, indices)?;
                    self.define_register(*destination)?;
                }
                Instruction::Store {
                    value,
                    buffer,
                    indices,
                } => {
                    self.expect_operand(*value)?;
                    self.expect_indices(*buffer, indices)?;
                }
                Instruction::Arithmetic {
                    destination,
                    lhs,
                    rhs,
                    ..
                } => {
                    self.expect_operand(*lhs)?;
                    self.expect_operand(*rhs)?;
                    self.define_register(*destination)?;
                }
                Instruction::For {
                    variable,
                    lower_bound,
                    upper_bound,
                    step,
                    body,
                } => {
                    if variable.index() >= self.function.loop_variable_count
                        || self.loop_variables.iter().any(|(outer, _)| outer == variable)
                    {
                        return Err(self.violation(format!("{variable:?} is not a fresh loop variable")));
                    }

                    if *step == 0 || lower_bound > upper_bound {
                        return Err(self.violation(format!(
                            "loop over {variable:?} has invalid bounds {lower_bound}..{upper_bound} step {step}"
                        )));
                    }

                    let last_value = (lower_bound < upper_bound)
                        .then(|| lower_bound + (upper_bound - lower_bound - 1) / step * step);

                    if top_level {
                        self.nest_location = stored_buffer(body)
                            .and_then(|buffer| self.function.buffers.get(buffer))
                            .map(|buffer| buffer.location);
                    }

                    let visible_registers = self.registers.len();
                    self.loop_variables.push((*variable, last_value));

                    self.verify_block(body, false)?;

                    self.loop_variables.pop();
                    self.registers.truncate(visible_registers);

                    if top_level {
                        self.nest_location = None;
                    }
                }
                Instruction::Copy {
                    source,
                    destination,
                } => {
                    self.expect_live(*source)?;
                    self.expect_live(*destination)?;

                    let (source_shape, destination_shape) = (
                        &self.function.buffers[*source].shape,
                        &self.function.buffers[*destination].shape,
                    );

                    if source_shape.element_count() != destination_shape.element_count() {
                        return Err(self.violation(format!(
                            "cannot copy {source_shape} into {destination_shape}"
                        )));
                    }
                }
                Instruction::Print { buffer } => self.expect_live(*buffer)?,
                Instruction::Return => {
                    if !top_level || position + 1 != instructions.len() {
                        return Err(self.violation(
                            "`return` must be the last instruction of the function".to_string(),
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    fn expect_top_level(&self, top_level: bool, instruction: &str) -> Result<(), Error> {
        if top_level {
            Ok(())
        } else {
            Err(self.violation(format!("`{instruction}` cannot appear inside a loop")))
        }
    }

    fn expect_buffer_exists(&self, buffer: BufferId) -> Result<(), Error> {
        match self.function.buffers.get(buffer) {
            Some(_) => Ok(()),
            None => Err(self.violation(format!("{buffer:?} does not exist"))),
        }
    }

    fn expect_live(&self, buffer: BufferId) -> Result<(), Error> {
        self.expect_buffer_exists(buffer)?;

        match self.buffer_states.get(&buffer) {
            Some(BufferState::Live) => Ok(()),
            Some(BufferState::Released) => {
                Err(self.violation(format!("{buffer:?} is used after being released")))
            }
            None => Err(self.violation(format!("{buffer:?} is used before being allocated"))),
        }
    }

    fn expect_indices(&self, buffer: BufferId, indices: &[IndexExpr]) -> Result<(), Error> {
        self.expect_live(buffer)?;

        let shape = &self.function.buffers[buffer].shape;

        if indices.len() != shape.rank() {
            return Err(self.violation(format!(
                "{buffer:?} of shape {shape} indexed with {} indices",
                indices.len()
            )));
        }

        for (index, dimension) in indices.iter().zip(shape.dimensions()) {
            match index {
                IndexExpr::Constant(value) if value >= dimension => {
                    return Err(self.violation(format!(
                        "index {value} is out of bounds for {buffer:?} of shape {shape}"
                    )));
                }
                IndexExpr::Variable(variable) => {
                    let Some((_, last_value)) =
                        self.loop_variables.iter().find(|(outer, _)| outer == variable)
                    else {
                        return Err(self.violation(format!("{variable:?} is used outside its loop")));
                    };

                    if let Some(last_value) = last_value.filter(|value| value >= dimension) {
                        return Err(self.violation_in_nest(format!(
                            "{variable:?} reaches {last_value}, out of bounds for {buffer:?} of shape {shape}"
                        )));
                    }
                }
                IndexExpr::Constant(_) => {}
            }
        }

        Ok(())
    }

    fn expect_operand(&self, operand: Operand) -> Result<(), Error> {
        match operand {
            Operand::Register(register) if !self.registers.contains(&register) => {
                Err(self.violation(format!("{register:?} is used outside its scope")))
            }
            Operand::Register(_) | Operand::Immediate(_) => Ok(()),
        }
    }

    fn define_register(&mut self, register: RegisterId) -> Result<(), Error> {
        if register.index() >= self.function.register_count
            || !self.defined_registers.insert(register)
        {
            return Err(self.violation(format!("{register:?} is not a fresh register")));
        }

        self.registers.push(register);
        Ok(())
    }
}

/// First buffer stored to in a loop nest, which holds the result of the
/// operation the nest computes
fn stored_buffer(instructions: &[Instruction]) -> Option<BufferId> {
    instructions.iter().find_map(|instruction| match instruction {
        Instruction::Store { buffer, .. } => Some(*buffer),
        Instruction::For { body, .. } => stored_buffer(body),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ErrorKind,
        frontend::{Location, intern::InternedSymbol},
        index::IndexVec,
        middle::{ir::Shape, loops::Buffer},
    };

    fn function(shapes: &[&[usize]], body: Vec<Instruction>) -> loops::Function {
        let location = Location {
            file: InternedSymbol::new("<test>"),
            line: 1,
            column: 1,
        };

        let mut buffers: IndexVec<BufferId, Buffer> = IndexVec::new();

        for shape in shapes {
            let id = buffers.next_index();
            buffers.push(Buffer {
                id,
                shape: Shape::new(shape.to_vec()),
                location,
            });
        }

        loops::Function {
            name: InternedSymbol::new("main"),
            buffers,
            register_count: 2,
            loop_variable_count: 2,
            body,
        }
    }

    fn buffer(index: usize) -> BufferId {
        BufferId::new(index)
    }

    fn assert_violation(function: &loops::Function) {
        let error = verify_function(function).unwrap_err();
        assert!(matches!(error.kind, ErrorKind::InvariantViolation(_)));
    }

    #[test]
    fn accepts_well_formed_function() {
        let variable = LoopVariableId::new(0);

        let function = function(
            &[&[2]],
            vec![
                Instruction::Alloc { buffer: buffer(0) },
                Instruction::For {
                    variable,
                    lower_bound: 0,
                    upper_bound: 2,
                    step: 1,
                    body: vec![Instruction::Store {
                        value: Operand::Immediate(1.0),
                        buffer: buffer(0),
                        indices: vec![IndexExpr::Variable(variable)],
                    }],
                },
                Instruction::Print { buffer: buffer(0) },
                Instruction::Dealloc { buffer: buffer(0) },
                Instruction::Return,
            ],
        );

        verify_function(&function).unwrap();
    }

    #[test]
    fn rejects_missing_dealloc() {
        assert_violation(&function(
            &[&[1]],
            vec![Instruction::Alloc { buffer: buffer(0) }, Instruction::Return],
        ));
    }

    #[test]
    fn rejects_use_after_release() {
        assert_violation(&function(
            &[&[1]],
            vec![
                Instruction::Alloc { buffer: buffer(0) },
                Instruction::Dealloc { buffer: buffer(0) },
                Instruction::Print { buffer: buffer(0) },
                Instruction::Return,
            ],
        ));
    }

    #[test]
    fn rejects_wrong_index_count_and_bounds() {
        for indices in [
            vec![IndexExpr::Constant(0)],
            vec![IndexExpr::Constant(0), IndexExpr::Constant(3)],
        ] {
            assert_violation(&function(
                &[&[2, 3]],
                vec![
                    Instruction::Alloc { buffer: buffer(0) },
                    Instruction::Store {
                        value: Operand::Immediate(0.0),
                        buffer: buffer(0),
                        indices,
                    },
                    Instruction::Dealloc { buffer: buffer(0) },
                    Instruction::Return,
                ],
            ));
        }
    }

    #[test]
    fn rejects_register_used_outside_its_loop() {
        let variable = LoopVariableId::new(0);
        let register = RegisterId::new(0);

        assert_violation(&function(
            &[&[2]],
            vec![
                Instruction::Alloc { buffer: buffer(0) },
                Instruction::For {
                    variable,
                    lower_bound: 0,
                    upper_bound: 2,
                    step: 1,
                    body: vec![Instruction::Load {
                        destination: register,
                        buffer: buffer(0),
                        indices: vec![IndexExpr::Variable(variable)],
                    }],
                },
                Instruction::Store {
                    value: Operand::Register(register),
                    buffer: buffer(0),
                    indices: vec![IndexExpr::Constant(0)],
                },
                Instruction::Dealloc { buffer: buffer(0) },
                Instruction::Return,
            ],
        ));
    }

    fn store_in_loop(
        shape: &[usize],
        lower_bound: usize,
        upper_bound: usize,
        step: usize,
    ) -> loops::Function {
        let variable = LoopVariableId::new(0);

        function(
            &[shape],
            vec![
                Instruction::Alloc { buffer: buffer(0) },
                Instruction::For {
                    variable,
                    lower_bound,
                    upper_bound,
                    step,
                    body: vec![Instruction::Store {
                        value: Operand::Immediate(1.0),
                        buffer: buffer(0),
                        indices: vec![IndexExpr::Variable(variable)],
                    }],
                },
                Instruction::Dealloc { buffer: buffer(0) },
                Instruction::Return,
            ],
        )
    }

    #[test]
    fn loop_bounds_are_checked_against_dimensions() {
        verify_function(&store_in_loop(&[3], 0, 4, 2)).unwrap();
        verify_function(&store_in_loop(&[1], 2, 2, 1)).unwrap();

        let error = verify_function(&store_in_loop(&[2], 0, 4, 2)).unwrap_err();

        assert!(matches!(error.kind, ErrorKind::InvariantViolation(_)));
        assert!(error.location.is_some());
    }

    #[test]
    fn rejects_missing_return() {
        assert_violation(&function(
            &[&[1]],
            vec![
                Instruction::Alloc { buffer: buffer(0) },
                Instruction::Dealloc { buffer: buffer(0) },
            ],
        ));
    }
}

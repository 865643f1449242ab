//! Loop IR. Tensors become fixed-shape, row-major buffers of `f64` and every
//! tensor operation is spelled out as nests of counted loops that load, combine
//! and store individual elements through scalar registers.

use crate::{
    frontend::{Location, intern::InternedSymbol},
    index::{IndexVec, simple_index},
    middle::ir::Shape,
};

pub mod pretty_print;
pub mod tensor_lowering;
pub mod verify;

#[derive(Debug, Clone)]
pub struct Module {
    pub functions: Vec<Function>,
}

impl Module {
    pub fn get(&self, name: InternedSymbol) -> Option<&Function> {
        self.functions.iter().find(|function| function.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: InternedSymbol,
    pub buffers: IndexVec<BufferId, Buffer>,
    /// Number of scalar registers written by the body
    pub register_count: usize,
    /// Number of distinct loop induction variables in the body
    pub loop_variable_count: usize,
    pub body: Vec<Instruction>,
}

/// Row-major storage for one tensor value
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    pub id: BufferId,
    pub shape: Shape,
    /// Location of the operation whose result lives in this buffer
    pub location: Location,
}

simple_index! {
    /// Identifies a buffer within its function
    pub struct BufferId;
}

simple_index! {
    /// A scalar `f64` temporary
    pub struct RegisterId;
}

simple_index! {
    /// Induction variable of a `for` loop
    pub struct LoopVariableId;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Alloc {
        buffer: BufferId,
    },
    Dealloc {
        buffer: BufferId,
    },
    Load {
        destination: RegisterId,
        buffer: BufferId,
        indices: Vec<IndexExpr>,
    },
    Store {
        value: Operand,
        buffer: BufferId,
        indices: Vec<IndexExpr>,
    },
    Arithmetic {
        operator: ArithmeticOperator,
        destination: RegisterId,
        lhs: Operand,
        rhs: Operand,
    },
    /// Runs `body` for `variable` in `lower_bound..upper_bound`, advancing by
    /// `step`
    For {
        variable: LoopVariableId,
        lower_bound: usize,
        upper_bound: usize,
        step: usize,
        body: Vec<Instruction>,
    },
    /// Copies every element in row-major order. Both buffers hold the same
    /// number of elements.
    Copy {
        source: BufferId,
        destination: BufferId,
    },
    Print {
        buffer: BufferId,
    },
    Return,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexExpr {
    Constant(usize),
    Variable(LoopVariableId),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    Immediate(f64),
    Register(RegisterId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOperator {
    Add,
    Multiply,
}

impl ArithmeticOperator {
    pub fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            ArithmeticOperator::Add => lhs + rhs,
            ArithmeticOperator::Multiply => lhs * rhs,
        }
    }
}

use std::io::Write;

use crate::{backend::ExecutionOptions, error::Error, middle::loops};

mod interpreter;

pub trait ExecutionEngine {
    /// Runs the entry function, writing everything it prints to `output`
    fn execute(
        &self,
        module: &loops::Module,
        options: &ExecutionOptions,
        output: &mut dyn Write,
    ) -> Result<(), Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Target {
    #[default]
    Interpreter,
}

impl Target {
    pub fn get_execution_engine(self) -> impl ExecutionEngine {
        match self {
            Target::Interpreter => interpreter::Interpreter,
        }
    }
}

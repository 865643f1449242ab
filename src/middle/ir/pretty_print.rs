use colored::Colorize;
use hashbrown::HashMap;
use itertools::Itertools;

use crate::middle::ir::{self, OperationKind, ValueId};

/// Values are renumbered in definition order when printed so that erased
/// operations do not leave holes in the listing
struct ValueNames(HashMap<ValueId, usize>);

impl ValueNames {
    fn new(function: &ir::Function) -> Self {
        let names = function
            .arguments
            .iter()
            .copied()
            .chain(function.operations().flat_map(|op| op.results.iter().copied()))
            .enumerate()
            .map(|(name, value)| (value, name))
            .collect();

        Self(names)
    }

    fn name(&self, value: ValueId) -> String {
        match self.0.get(&value) {
            Some(name) => format!("%{name}"),
            None => format!("%<dangling {value:?}>"),
        }
    }
}

impl core::fmt::Display for ir::Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, function) in self.functions.iter().enumerate() {
            if i != 0 {
                writeln!(f)?;
            }

            if f.alternate() {
                write!(f, "{function:#}")?;
            } else {
                write!(f, "{function}")?;
            }
        }

        Ok(())
    }
}

/// `{}` prints the function body, `{:#}` additionally prints the source
/// location of each operation
impl core::fmt::Display for ir::Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = ValueNames::new(self);

        write!(
            f,
            "{} {}{}",
            "func".magenta(),
            format!("@{}", self.name).blue(),
            "(".white()
        )?;

        write!(
            f,
            "{}",
            self.arguments
                .iter()
                .map(|arg| format!(
                    "{}: {}",
                    names.name(*arg).yellow(),
                    self.value_type(*arg)
                ))
                .join(", ")
        )?;

        write!(f, "{}", ")".white())?;

        if !self.result_types.is_empty() {
            write!(
                f,
                " {} {}",
                "->".white(),
                self.result_types.iter().join(", ")
            )?;
        }

        writeln!(f, " {}", "{".white())?;

        for operation in self.operations() {
            write!(f, "  ")?;
            write_operation(f, self, &names, operation)?;

            if f.alternate() {
                write!(f, " {}", format!("loc({})", operation.location).dimmed())?;
            }

            writeln!(f)?;
        }

        writeln!(f, "{}", "}".white())
    }
}

fn write_operation(
    f: &mut std::fmt::Formatter<'_>,
    function: &ir::Function,
    names: &ValueNames,
    operation: &ir::Operation,
) -> std::fmt::Result {
    let operands = operation
        .operands
        .iter()
        .map(|operand| names.name(*operand).yellow())
        .join(", ");

    let operand_types = operation
        .operands
        .iter()
        .map(|operand| function.value_type(*operand))
        .join(", ");

    let result_types = operation
        .results
        .iter()
        .map(|result| function.value_type(*result))
        .join(", ");

    if !operation.results.is_empty() {
        write!(
            f,
            "{} {} ",
            operation
                .results
                .iter()
                .map(|result| names.name(*result).yellow())
                .join(", "),
            "=".white()
        )?;
    }

    let name = operation.name().cyan();

    match &operation.kind {
        OperationKind::Constant { value } => write!(
            f,
            "{name} {} {} {result_types}",
            format!("dense<{value}>").purple(),
            ":".white()
        ),
        OperationKind::Return if operation.operands.is_empty() => write!(f, "{name}"),
        OperationKind::Return => {
            write!(f, "{name} {operands} {} {operand_types}", ":".white())
        }
        OperationKind::Print => {
            write!(f, "{name}({operands}) {} {operand_types}", ":".white())
        }
        OperationKind::GenericCall { callee } => write!(
            f,
            "{name} {}({operands}) {} ({operand_types}) {} {result_types}",
            format!("@{callee}").blue(),
            ":".white(),
            "->".white()
        ),
        OperationKind::Add
        | OperationKind::Multiply
        | OperationKind::MatMul
        | OperationKind::Transpose
        | OperationKind::Reshape { .. }
        | OperationKind::Cast => write!(
            f,
            "{name}({operands}) {} ({operand_types}) {} {result_types}",
            ":".white(),
            "->".white()
        ),
    }
}

//! Inlines every call into the entry function and drops all other functions.
//! Callee parameters are generic, so each argument whose type differs from
//! its parameter is routed through a `cast`; shape inference later refines
//! the cast results and the rewriter removes the casts that became redundant.

use hashbrown::HashMap;

use crate::{
    error::{Error, ErrorKind},
    frontend::intern::InternedSymbol,
    middle::ir::{self, OperationId, OperationKind, ValueId},
};

pub fn inline_calls(mut module: ir::Module, entry: InternedSymbol) -> Result<ir::Module, Error> {
    let Some(entry_index) = module.functions.iter().position(|f| f.name == entry) else {
        return Err(Error::new(ErrorKind::UndeclaredSymbol { name: entry }, None));
    };

    check_recursion(&module, entry)?;

    let mut caller = module.functions.swap_remove(entry_index);

    while let Some((call, callee)) = next_call(&caller) {
        let Some(callee) = module.get(callee) else {
            return Err(Error::at(
                ErrorKind::UndeclaredSymbol { name: callee },
                caller.operation(call).location,
            ));
        };

        inline_call(&mut caller, call, callee)?;
    }

    module.functions = vec![caller];
    Ok(module)
}

fn next_call(function: &ir::Function) -> Option<(OperationId, InternedSymbol)> {
    function.operations().find_map(|op| match op.kind {
        OperationKind::GenericCall { callee } => Some((op.id, callee)),
        _ => None,
    })
}

/// Clones the body of `callee` in front of `call`, rewires the call's result
/// and erases the call
fn inline_call(
    caller: &mut ir::Function,
    call: OperationId,
    callee: &ir::Function,
) -> Result<(), Error> {
    let call_operation = caller.operation(call).clone();

    if call_operation.operands.len() != callee.arguments.len() {
        return Err(Error::at(
            ErrorKind::ArgumentCount {
                callee: callee.name,
                expected: callee.arguments.len(),
                actual: call_operation.operands.len(),
            },
            call_operation.location,
        ));
    }

    let mut value_map: HashMap<ValueId, ValueId> = HashMap::new();

    for (parameter, argument) in callee.arguments.iter().zip(&call_operation.operands) {
        let parameter_type = callee.value_type(*parameter);

        let value = if caller.value_type(*argument) == parameter_type {
            *argument
        } else {
            let cast = caller.insert_operation_before(
                call,
                OperationKind::Cast,
                vec![*argument],
                vec![parameter_type.clone()],
                call_operation.location,
            );

            caller.operation(cast).result()
        };

        value_map.insert(*parameter, value);
    }

    let mut returned = Vec::new();

    for operation in callee.operations() {
        let operands = operation
            .operands
            .iter()
            .map(|operand| value_map[operand])
            .collect::<Vec<_>>();

        if operation.kind == OperationKind::Return {
            returned = operands;
            continue;
        }

        let result_types = operation
            .results
            .iter()
            .map(|result| callee.value_type(*result).clone())
            .collect();

        let cloned = caller.insert_operation_before(
            call,
            operation.kind.clone(),
            operands,
            result_types,
            operation.location,
        );

        for (old, new) in operation
            .results
            .iter()
            .zip(caller.operation(cloned).results.clone())
        {
            value_map.insert(*old, new);
        }
    }

    for (index, result) in call_operation.results.iter().enumerate() {
        match returned.get(index) {
            Some(value) => caller.replace_all_uses_with(*result, *value),
            None if caller.has_uses(*result) => {
                return Err(Error::invariant(
                    format!(
                        "`{}` does not return a value but the result of the call is used",
                        callee.name
                    ),
                    Some(call_operation.location),
                ));
            }
            None => {}
        }
    }

    caller.erase_operation(call)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitState {
    InProgress,
    Finished,
}

/// Depth-first walk of the call graph reachable from the entry. Functions the
/// entry never calls are dropped without being checked.
fn check_recursion(module: &ir::Module, entry: InternedSymbol) -> Result<(), Error> {
    let mut walker = CallGraphWalker {
        module,
        states: HashMap::new(),
        path: Vec::new(),
    };

    walker.visit(entry)
}

struct CallGraphWalker<'a> {
    module: &'a ir::Module,
    states: HashMap<InternedSymbol, VisitState>,
    path: Vec<InternedSymbol>,
}

impl CallGraphWalker<'_> {
    fn visit(&mut self, name: InternedSymbol) -> Result<(), Error> {
        if self.states.contains_key(&name) {
            return Ok(());
        }

        let Some(function) = self.module.get(name) else {
            return Ok(());
        };

        self.states.insert(name, VisitState::InProgress);
        self.path.push(name);

        for operation in function.operations() {
            let OperationKind::GenericCall { callee } = operation.kind else {
                continue;
            };

            match self.states.get(&callee) {
                Some(VisitState::InProgress) => {
                    let start = self
                        .path
                        .iter()
                        .position(|function| *function == callee)
                        .unwrap_or_default();

                    let mut cycle = self.path[start..].to_vec();
                    cycle.push(callee);

                    return Err(Error::at(
                        ErrorKind::RecursionUnsupported { cycle },
                        operation.location,
                    ));
                }
                Some(VisitState::Finished) => {}
                None => {
                    if self.module.get(callee).is_none() {
                        return Err(Error::at(
                            ErrorKind::UndeclaredSymbol { name: callee },
                            operation.location,
                        ));
                    }

                    self.visit(callee)?;
                }
            }
        }

        self.path.pop();
        self.states.insert(name, VisitState::Finished);
        Ok(())
    }
}

//! Common subexpression elimination. Two operations without side effects that
//! have the same kind (including its payload), the same operands and the same
//! result types compute the same value, so later ones are folded into the
//! first.

use hashbrown::HashMap;

use crate::{
    error::Error,
    middle::ir::{self, OperationId, ValueId},
};

/// Merges duplicate operations in every function, returning how many were
/// removed
pub fn eliminate_common_subexpressions(module: &mut ir::Module) -> Result<usize, Error> {
    module
        .functions
        .iter_mut()
        .map(eliminate_in_function)
        .sum::<Result<usize, Error>>()
}

pub fn eliminate_in_function(function: &mut ir::Function) -> Result<usize, Error> {
    // Constants carry `f64` payloads, so candidates are bucketed by name and
    // operands and then compared in full
    let mut seen: HashMap<(&'static str, Vec<ValueId>), Vec<OperationId>> = HashMap::new();
    let mut merged = 0;

    for id in function.body().to_vec() {
        let operation = function.operation(id);

        if operation.kind.has_side_effects() || operation.results.is_empty() {
            continue;
        }

        let key = (operation.name(), operation.operands.clone());
        let candidates = seen.entry(key).or_default();

        let Some(&original) = candidates
            .iter()
            .find(|candidate| equivalent(function, function.operation(**candidate), operation))
        else {
            candidates.push(id);
            continue;
        };

        let replacements = function
            .operation(original)
            .results
            .iter()
            .copied()
            .zip(operation.results.iter().copied())
            .collect::<Vec<_>>();

        for (kept, duplicate) in replacements {
            function.replace_all_uses_with(duplicate, kept);
        }

        function.erase_operation(id)?;
        merged += 1;
    }

    Ok(merged)
}

fn equivalent(function: &ir::Function, lhs: &ir::Operation, rhs: &ir::Operation) -> bool {
    lhs.kind == rhs.kind
        && lhs.operands == rhs.operands
        && lhs.results.len() == rhs.results.len()
        && lhs
            .results
            .iter()
            .zip(&rhs.results)
            .all(|(a, b)| function.value_type(*a) == function.value_type(*b))
}

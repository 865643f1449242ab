//! Worklist-driven algebraic simplification. Each pattern is a pair of plain
//! functions: a matcher that inspects an operation and a rewriter that changes
//! the function and reports which operations deserve another look.

use std::collections::VecDeque;

use hashbrown::HashSet;

use crate::{
    error::Error,
    middle::ir::{self, OperationId, OperationKind, TensorType, ValueId},
};

pub struct Pattern {
    pub name: &'static str,
    pub matches: fn(&ir::Function, &ir::Operation) -> bool,
    /// Applies the rewrite, returning the operations created or affected by it
    pub rewrite: fn(&mut ir::Function, OperationId) -> Result<Vec<OperationId>, Error>,
}

/// Tried in order; the first matching pattern is applied
pub const PATTERNS: &[Pattern] = &[
    Pattern {
        name: "reshape-of-constant",
        matches: reshape_of_constant_matches,
        rewrite: fold_reshape_of_constant,
    },
    Pattern {
        name: "redundant-reshape",
        matches: redundant_reshape_matches,
        rewrite: forward_operand,
    },
    Pattern {
        name: "reshape-of-reshape",
        matches: reshape_of_reshape_matches,
        rewrite: merge_reshapes,
    },
    Pattern {
        name: "redundant-cast",
        matches: redundant_cast_matches,
        rewrite: forward_operand,
    },
    Pattern {
        name: "dead-operation",
        matches: dead_operation_matches,
        rewrite: erase_dead_operation,
    },
];

/// Simplifies every function of the module, returning the number of rewrites
/// applied
pub fn simplify(module: &mut ir::Module) -> Result<usize, Error> {
    module
        .functions
        .iter_mut()
        .map(simplify_function)
        .sum::<Result<usize, Error>>()
}

pub fn simplify_function(function: &mut ir::Function) -> Result<usize, Error> {
    let mut worklist = Worklist::default();
    function.body().iter().for_each(|id| worklist.push(*id));

    let mut applied = 0;

    while let Some(id) = worklist.pop() {
        let Some(operation) = function.try_operation(id) else {
            continue;
        };

        let Some(pattern) = PATTERNS
            .iter()
            .find(|pattern| (pattern.matches)(function, operation))
        else {
            continue;
        };

        // Erasing or replacing an operation may leave its operands dead
        let definitions = operation
            .operands
            .iter()
            .filter_map(|operand| function.defining_operation(*operand))
            .map(|op| op.id)
            .collect::<Vec<_>>();

        let touched = (pattern.rewrite)(function, id)?;
        applied += 1;

        touched
            .into_iter()
            .chain(definitions)
            .for_each(|id| worklist.push(id));
    }

    Ok(applied)
}

#[derive(Default)]
struct Worklist {
    queue: VecDeque<OperationId>,
    queued: HashSet<OperationId>,
}

impl Worklist {
    fn push(&mut self, id: OperationId) {
        if self.queued.insert(id) {
            self.queue.push_back(id);
        }
    }

    fn pop(&mut self) -> Option<OperationId> {
        let id = self.queue.pop_front()?;
        self.queued.remove(&id);
        Some(id)
    }
}

/// Replaces every use of the single result of `id` with `value`, erases the
/// operation and returns the new users of `value`
fn replace_operation(
    function: &mut ir::Function,
    id: OperationId,
    value: ValueId,
) -> Result<Vec<OperationId>, Error> {
    let result = function.operation(id).result();

    function.replace_all_uses_with(result, value);
    function.erase_operation(id)?;

    Ok(function.uses(value).to_vec())
}

fn single_operand_defined_by<'f>(
    function: &'f ir::Function,
    operation: &ir::Operation,
) -> Option<&'f ir::Operation> {
    match operation.operands[..] {
        [operand] => function.defining_operation(operand),
        _ => None,
    }
}

fn reshape_of_constant_matches(function: &ir::Function, operation: &ir::Operation) -> bool {
    let OperationKind::Reshape { shape } = &operation.kind else {
        return false;
    };

    match single_operand_defined_by(function, operation).map(|op| &op.kind) {
        Some(OperationKind::Constant { value }) => {
            value.shape().element_count() == shape.element_count()
        }
        _ => false,
    }
}

fn fold_reshape_of_constant(
    function: &mut ir::Function,
    id: OperationId,
) -> Result<Vec<OperationId>, Error> {
    let operation = function.operation(id);

    let (OperationKind::Reshape { shape }, Some(OperationKind::Constant { value })) = (
        &operation.kind,
        single_operand_defined_by(function, operation).map(|op| &op.kind),
    ) else {
        return Ok(vec![]);
    };

    let Some(value) = value.reshaped(shape.clone()) else {
        return Ok(vec![]);
    };

    let ty = TensorType::Ranked(shape.clone());
    let location = operation.location;

    let constant = function.insert_operation_before(
        id,
        OperationKind::Constant { value },
        vec![],
        vec![ty],
        location,
    );

    let result = function.operation(constant).result();

    let mut touched = replace_operation(function, id, result)?;
    touched.push(constant);
    Ok(touched)
}

fn redundant_reshape_matches(function: &ir::Function, operation: &ir::Operation) -> bool {
    matches!(operation.kind, OperationKind::Reshape { .. }) && result_matches_operand(function, operation)
}

fn redundant_cast_matches(function: &ir::Function, operation: &ir::Operation) -> bool {
    operation.kind == OperationKind::Cast && result_matches_operand(function, operation)
}

/// Whether the single ranked result has exactly the type of the single operand
fn result_matches_operand(function: &ir::Function, operation: &ir::Operation) -> bool {
    let ([operand], [result]) = (&operation.operands[..], &operation.results[..]) else {
        return false;
    };

    let ty = function.value_type(*result);

    ty.is_ranked() && ty == function.value_type(*operand)
}

fn forward_operand(
    function: &mut ir::Function,
    id: OperationId,
) -> Result<Vec<OperationId>, Error> {
    let operand = function.operation(id).operands[0];

    replace_operation(function, id, operand)
}

fn reshape_of_reshape_matches(function: &ir::Function, operation: &ir::Operation) -> bool {
    matches!(operation.kind, OperationKind::Reshape { .. })
        && single_operand_defined_by(function, operation)
            .is_some_and(|op| matches!(op.kind, OperationKind::Reshape { .. }))
}

fn merge_reshapes(
    function: &mut ir::Function,
    id: OperationId,
) -> Result<Vec<OperationId>, Error> {
    let outer = function.operation(id);

    let Some(inner) = single_operand_defined_by(function, outer) else {
        return Ok(vec![]);
    };

    let kind = outer.kind.clone();
    let operands = inner.operands.clone();
    let result_types = vec![function.value_type(outer.result()).clone()];
    let location = outer.location;

    let merged = function.insert_operation_before(id, kind, operands, result_types, location);
    let result = function.operation(merged).result();

    let mut touched = replace_operation(function, id, result)?;
    touched.push(merged);
    Ok(touched)
}

fn dead_operation_matches(function: &ir::Function, operation: &ir::Operation) -> bool {
    !operation.kind.has_side_effects()
        && operation
            .results
            .iter()
            .all(|result| !function.has_uses(*result))
}

fn erase_dead_operation(
    function: &mut ir::Function,
    id: OperationId,
) -> Result<Vec<OperationId>, Error> {
    function.erase_operation(id)?;
    Ok(vec![])
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::{
        frontend::{Location, intern::InternedSymbol},
        middle::{
            inline::inline_calls,
            ir::{DenseLiteral, Shape},
            lower_source,
            shape_inference::infer_shapes,
        },
    };

    fn optimize(source: &str) -> (ir::Module, usize) {
        let module = lower_source(source).unwrap();
        let mut module = inline_calls(module, InternedSymbol::new("main")).unwrap();

        let mut total = 0;

        loop {
            infer_shapes(&mut module).unwrap();

            match simplify(&mut module).unwrap() {
                0 => break,
                applied => total += applied,
            }
        }

        module.verify().unwrap();
        (module, total)
    }

    fn operation_names(module: &ir::Module) -> Vec<&'static str> {
        module.functions[0]
            .operations()
            .map(ir::Operation::name)
            .collect()
    }

    #[test]
    fn reshaped_literals_fold_into_constants() {
        let (module, applied) = optimize(indoc! {"
            def main() {
              var a<2, 3> = [1, 2, 3, 4, 5, 6];
              print(a);
            }
        "});

        assert!(applied > 0);
        assert_eq!(operation_names(&module), vec!["constant", "print", "return"]);

        let main = &module.functions[0];
        let constant = main.operations().next().unwrap();
        assert_eq!(
            main.value_type(constant.result()),
            &TensorType::ranked([2, 3])
        );
    }

    #[test]
    fn reshape_chains_collapse() {
        let (module, _) = optimize(indoc! {"
            def main() {
              var a = [[1, 2], [3, 4]];
              var b = transpose(a);
              var c<4> = b;
              var d<1, 4> = c;
              print(d);
            }
        "});

        assert_eq!(
            operation_names(&module),
            vec!["constant", "transpose", "reshape", "print", "return"]
        );
    }

    #[test]
    fn casts_and_dead_code_disappear_after_inlining() {
        let (module, _) = optimize(indoc! {"
            def multiply_transpose(a, b) {
              return transpose(a) * transpose(b);
            }

            def main() {
              var a<2, 3> = [[1, 2, 3], [4, 5, 6]];
              var b<2, 3> = [1, 2, 3, 4, 5, 6];
              var c = multiply_transpose(a, b);
              var unused = multiply_transpose(b, a);
              print(c);
            }
        "});

        assert_eq!(
            operation_names(&module),
            vec![
                "constant",
                "constant",
                "transpose",
                "transpose",
                "multiply",
                "print",
                "return"
            ]
        );
    }

    #[test]
    fn simplified_output_is_a_fixpoint() {
        let (mut module, _) = optimize(indoc! {"
            def main() {
              var a<2, 2> = [1, 2, 3, 4];
              var b<4> = a;
              print(b + b);
            }
        "});

        assert_eq!(simplify(&mut module).unwrap(), 0);
    }

    #[test]
    fn print_is_never_removed() {
        let (module, _) = optimize("def main() { var a = [1]; print(a); print(a); }");

        assert_eq!(
            operation_names(&module),
            vec!["constant", "print", "print", "return"]
        );
    }

    #[test]
    fn reshape_to_the_same_shape_is_forwarded() {
        let (module, _) = optimize(indoc! {"
            def main() {
              var a = [[1, 2], [3, 4]];
              var b = transpose(a);
              var c<2, 2> = b;
              print(c);
            }
        "});

        assert_eq!(
            operation_names(&module),
            vec!["constant", "transpose", "print", "return"]
        );

        let main = &module.functions[0];
        let transpose = main.operations().find(|op| op.name() == "transpose").unwrap();
        let print = main.operations().find(|op| op.name() == "print").unwrap();
        assert_eq!(print.operands, vec![transpose.result()]);
    }

    fn location() -> Location {
        Location {
            file: InternedSymbol::new("<test>"),
            line: 1,
            column: 1,
        }
    }

    fn pattern(name: &str) -> &'static Pattern {
        PATTERNS
            .iter()
            .find(|pattern| pattern.name == name)
            .unwrap()
    }

    fn function_with_argument(ty: TensorType) -> (ir::Function, ValueId) {
        let mut function = ir::Function::new(InternedSymbol::new("main"), location());
        let argument = function.add_argument(ty);

        (function, argument)
    }

    fn append(
        function: &mut ir::Function,
        kind: OperationKind,
        operands: Vec<ValueId>,
        ty: TensorType,
    ) -> OperationId {
        function.append_operation(kind, operands, vec![ty], location())
    }

    /// Prints the result of `producer` so that it stays in use
    fn print(function: &mut ir::Function, producer: OperationId) -> OperationId {
        let value = function.operation(producer).result();

        function.append_operation(OperationKind::Print, vec![value], vec![], location())
    }

    fn reshape(shape: impl Into<Vec<usize>>) -> OperationKind {
        OperationKind::Reshape {
            shape: Shape::new(shape),
        }
    }

    fn applies(function: &ir::Function, name: &str, id: OperationId) -> bool {
        (pattern(name).matches)(function, function.operation(id))
    }

    #[test]
    fn reshape_of_constant_pattern() {
        let (mut function, argument) = function_with_argument(TensorType::ranked([4]));
        let constant = append(
            &mut function,
            OperationKind::Constant {
                value: DenseLiteral::new(Shape::new([4]), vec![1.0, 2.0, 3.0, 4.0]),
            },
            vec![],
            TensorType::ranked([4]),
        );
        let literal = function.operation(constant).result();
        let folded = append(
            &mut function,
            reshape([2, 2]),
            vec![literal],
            TensorType::ranked([2, 2]),
        );
        let wrong_count = append(
            &mut function,
            reshape([3]),
            vec![literal],
            TensorType::ranked([3]),
        );
        let of_argument = append(
            &mut function,
            reshape([2, 2]),
            vec![argument],
            TensorType::ranked([2, 2]),
        );
        let user = print(&mut function, folded);

        assert!(!applies(&function, "reshape-of-constant", wrong_count));
        assert!(!applies(&function, "reshape-of-constant", of_argument));
        assert!(applies(&function, "reshape-of-constant", folded));

        (pattern("reshape-of-constant").rewrite)(&mut function, folded).unwrap();

        assert!(function.try_operation(folded).is_none());
        let operand = function.operation(user).operands[0];
        let Some(OperationKind::Constant { value }) =
            function.defining_operation(operand).map(|op| &op.kind)
        else {
            panic!("print should read a constant");
        };
        assert_eq!(value.to_string(), "[[1, 2], [3, 4]]");
        assert_eq!(function.value_type(operand), &TensorType::ranked([2, 2]));
    }

    #[test]
    fn redundant_reshape_pattern() {
        let (mut function, argument) = function_with_argument(TensorType::ranked([2, 2]));
        let same = append(
            &mut function,
            reshape([2, 2]),
            vec![argument],
            TensorType::ranked([2, 2]),
        );
        let flattened = append(
            &mut function,
            reshape([4]),
            vec![argument],
            TensorType::ranked([4]),
        );
        let user = print(&mut function, same);

        assert!(!applies(&function, "redundant-reshape", flattened));
        assert!(applies(&function, "redundant-reshape", same));

        let touched = (pattern("redundant-reshape").rewrite)(&mut function, same).unwrap();

        assert!(touched.contains(&user));
        assert!(function.try_operation(same).is_none());
        assert_eq!(function.operation(user).operands, vec![argument]);
    }

    #[test]
    fn redundant_reshape_needs_a_ranked_operand() {
        let (mut function, argument) = function_with_argument(TensorType::Unranked);
        let pending = append(
            &mut function,
            reshape([2, 2]),
            vec![argument],
            TensorType::ranked([2, 2]),
        );

        assert!(!applies(&function, "redundant-reshape", pending));
    }

    #[test]
    fn reshape_of_reshape_pattern() {
        let (mut function, argument) = function_with_argument(TensorType::ranked([4]));
        let inner = append(
            &mut function,
            reshape([2, 2]),
            vec![argument],
            TensorType::ranked([2, 2]),
        );
        let inner_result = function.operation(inner).result();
        let outer = append(
            &mut function,
            reshape([4, 1]),
            vec![inner_result],
            TensorType::ranked([4, 1]),
        );
        let user = print(&mut function, outer);

        assert!(!applies(&function, "reshape-of-reshape", inner));
        assert!(applies(&function, "reshape-of-reshape", outer));

        (pattern("reshape-of-reshape").rewrite)(&mut function, outer).unwrap();

        let merged = function
            .defining_operation(function.operation(user).operands[0])
            .unwrap();
        assert_eq!(merged.kind, reshape([4, 1]));
        assert_eq!(merged.operands, vec![argument]);
        assert!(!function.has_uses(inner_result));
    }

    #[test]
    fn redundant_cast_pattern() {
        let (mut function, argument) = function_with_argument(TensorType::ranked([2]));
        let same = append(
            &mut function,
            OperationKind::Cast,
            vec![argument],
            TensorType::ranked([2]),
        );
        let unresolved = append(
            &mut function,
            OperationKind::Cast,
            vec![argument],
            TensorType::Unranked,
        );
        let user = print(&mut function, same);

        assert!(!applies(&function, "redundant-cast", unresolved));
        assert!(applies(&function, "redundant-cast", same));

        (pattern("redundant-cast").rewrite)(&mut function, same).unwrap();

        assert_eq!(function.operation(user).operands, vec![argument]);
    }

    #[test]
    fn dead_operation_pattern() {
        let (mut function, argument) = function_with_argument(TensorType::ranked([2, 2]));
        let unused = append(
            &mut function,
            OperationKind::Transpose,
            vec![argument],
            TensorType::ranked([2, 2]),
        );
        let used = append(
            &mut function,
            OperationKind::Transpose,
            vec![argument],
            TensorType::ranked([2, 2]),
        );
        let user = print(&mut function, used);

        assert!(!applies(&function, "dead-operation", used));
        assert!(!applies(&function, "dead-operation", user));
        assert!(applies(&function, "dead-operation", unused));

        (pattern("dead-operation").rewrite)(&mut function, unused).unwrap();

        assert!(function.try_operation(unused).is_none());
        assert_eq!(function.body(), &[used, user]);
    }
}

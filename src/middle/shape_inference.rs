//! Assigns a ranked type to every value by repeatedly scanning each function
//! in body order. An operation is visited once all of its operands are ranked;
//! its rule then computes (or checks) its result types. Types only ever move
//! from unranked to ranked, so the scan reaches a fixpoint after at most one
//! round per operation.

use hashbrown::HashSet;

use crate::{
    error::{Error, ErrorKind},
    middle::ir::{self, OperationId, OperationKind, Shape, TensorType},
};

pub fn infer_shapes(module: &mut ir::Module) -> Result<(), Error> {
    module.functions.iter_mut().try_for_each(infer_function)
}

pub fn infer_function(function: &mut ir::Function) -> Result<(), Error> {
    let mut resolved: HashSet<OperationId> = HashSet::new();

    loop {
        let mut changed = false;

        for id in function.body().to_vec() {
            if resolved.contains(&id) {
                continue;
            }

            let operation = function.operation(id);

            if !operation
                .operands
                .iter()
                .all(|operand| function.value_type(*operand).is_ranked())
            {
                continue;
            }

            if apply_rule(function, id)? {
                resolved.insert(id);
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }

    match function.operations().find(|op| !resolved.contains(&op.id)) {
        Some(stuck) => Err(Error::at(
            ErrorKind::UnresolvedShape {
                operation: stuck.name(),
            },
            stuck.location,
        )),
        None => Ok(()),
    }
}

/// Applies the shape rule of an operation whose operands are all ranked.
/// Returns whether the operation is now resolved.
fn apply_rule(function: &mut ir::Function, id: OperationId) -> Result<bool, Error> {
    let operation = function.operation(id);

    let mismatch = |reason: String| {
        Err(Error::at(
            ErrorKind::ShapeMismatch {
                operation: operation.name(),
                reason,
            },
            operation.location,
        ))
    };

    let operand_shapes = operation
        .operands
        .iter()
        .filter_map(|operand| function.value_type(*operand).shape())
        .collect::<Vec<_>>();

    let inferred = match &operation.kind {
        OperationKind::Constant { value } => value.shape().clone(),
        OperationKind::Add | OperationKind::Multiply => {
            let [lhs, rhs] = operand_shapes[..] else {
                return mismatch(format!("expected 2 operands, found {}", operand_shapes.len()));
            };

            if lhs != rhs {
                return mismatch(format!("operands have shapes {lhs} and {rhs}"));
            }

            lhs.clone()
        }
        OperationKind::MatMul => {
            let [lhs, rhs] = operand_shapes[..] else {
                return mismatch(format!("expected 2 operands, found {}", operand_shapes.len()));
            };

            let (&[m, k], &[k2, n]) = (lhs.dimensions(), rhs.dimensions()) else {
                return mismatch(format!(
                    "operands must be rank 2, found shapes {lhs} and {rhs}"
                ));
            };

            if k != k2 {
                return mismatch(format!(
                    "inner dimensions of {lhs} and {rhs} do not agree"
                ));
            }

            Shape::new([m, n])
        }
        OperationKind::Transpose => {
            let [operand] = operand_shapes[..] else {
                return mismatch(format!("expected 1 operand, found {}", operand_shapes.len()));
            };

            operand.reversed()
        }
        OperationKind::Reshape { shape } => {
            let [operand] = operand_shapes[..] else {
                return mismatch(format!("expected 1 operand, found {}", operand_shapes.len()));
            };

            let (Some(from), Some(to)) =
                (operand.checked_element_count(), shape.checked_element_count())
            else {
                return mismatch(format!("cannot reshape {operand} into {shape}"));
            };

            if from != to {
                return mismatch(format!(
                    "cannot reshape {operand} ({from} elements) into {shape} ({to} elements)"
                ));
            }

            shape.clone()
        }
        OperationKind::Cast => {
            let [operand] = operand_shapes[..] else {
                return mismatch(format!("expected 1 operand, found {}", operand_shapes.len()));
            };

            operand.clone()
        }
        OperationKind::Return => {
            let shapes = operand_shapes.into_iter().cloned().collect::<Vec<_>>();
            return refine_signature(function, id, shapes).map(|_| true);
        }
        OperationKind::Print => return Ok(true),
        // The callee's shapes are only known once it is inlined
        OperationKind::GenericCall { .. } => return Ok(false),
    };

    if inferred.checked_element_count().is_none() {
        return mismatch(format!("{inferred} has too many elements"));
    }

    let result = operation.result();

    if let TensorType::Ranked(existing) = function.value_type(result) {
        if *existing != inferred {
            return mismatch(format!(
                "result is declared as {existing} but inferred as {inferred}"
            ));
        }

        return Ok(true);
    }

    function.set_value_type(result, TensorType::Ranked(inferred));
    Ok(true)
}

/// Propagates the shapes returned by a function into its signature
fn refine_signature(
    function: &mut ir::Function,
    id: OperationId,
    shapes: Vec<Shape>,
) -> Result<(), Error> {
    let location = function.operation(id).location;

    for (index, shape) in shapes.into_iter().enumerate() {
        match &function.result_types[index] {
            TensorType::Ranked(existing) if *existing != shape => {
                return Err(Error::at(
                    ErrorKind::ShapeMismatch {
                        operation: "return",
                        reason: format!(
                            "function `{}` returns {shape} but its signature declares {existing}",
                            function.name
                        ),
                    },
                    location,
                ));
            }
            TensorType::Ranked(_) => {}
            TensorType::Unranked => function.result_types[index] = TensorType::Ranked(shape),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::{
        frontend::intern::InternedSymbol,
        middle::{inline::inline_calls, lower_source},
    };

    fn specialize(source: &str) -> Result<ir::Module, Error> {
        let module = lower_source(source)?;
        let mut module = inline_calls(module, InternedSymbol::new("main"))?;

        infer_shapes(&mut module)?;
        Ok(module)
    }

    fn printed_types(function: &ir::Function) -> Vec<TensorType> {
        function
            .operations()
            .filter(|op| op.kind == OperationKind::Print)
            .map(|op| function.value_type(op.operands[0]).clone())
            .collect()
    }

    #[test]
    fn shapes_flow_through_inlined_calls() {
        let module = specialize(indoc! {"
            def multiply_transpose(a, b) {
              return transpose(a) * transpose(b);
            }

            def main() {
              var a<2, 3> = [[1, 2, 3], [4, 5, 6]];
              var b<2, 3> = [1, 2, 3, 4, 5, 6];
              var c = multiply_transpose(a, b);
              print(c);
            }
        "})
        .unwrap();

        let main = &module.functions[0];

        assert!(main.operations().all(|op| {
            op.results
                .iter()
                .all(|result| main.value_type(*result).is_ranked())
        }));
        assert_eq!(printed_types(main), vec![TensorType::ranked([3, 2])]);
    }

    #[test]
    fn matmul_produces_outer_dimensions() {
        let module = specialize(indoc! {"
            def main() {
              var a = [[1, 2, 3], [4, 5, 6]];
              var b = [[1, 2], [3, 4], [5, 6]];
              print(a @ b);
            }
        "})
        .unwrap();

        assert_eq!(
            printed_types(&module.functions[0]),
            vec![TensorType::ranked([2, 2])]
        );
    }

    #[test]
    fn add_requires_identical_shapes() {
        let error = specialize(indoc! {"
            def main() {
              var a = [1, 2, 3];
              var b = [[1, 2, 3]];
              print(a + b);
            }
        "})
        .unwrap_err();

        assert!(matches!(
            error.kind,
            ErrorKind::ShapeMismatch {
                operation: "add",
                ..
            }
        ));
        assert_eq!(error.location.unwrap().line, 4);
    }

    #[test]
    fn matmul_inner_dimensions_must_agree() {
        let error = specialize(indoc! {"
            def main() {
              var a = [[1, 2, 3], [4, 5, 6]];
              print(a @ a);
            }
        "})
        .unwrap_err();

        assert!(matches!(
            error.kind,
            ErrorKind::ShapeMismatch {
                operation: "matmul",
                ..
            }
        ));
    }

    #[test]
    fn reshape_must_preserve_element_count() {
        let error = specialize(indoc! {"
            def main() {
              var a = [1, 2, 3, 4];
              var b<3> = a;
              print(b);
            }
        "})
        .unwrap_err();

        assert!(matches!(
            error.kind,
            ErrorKind::ShapeMismatch {
                operation: "reshape",
                ..
            }
        ));
    }

    #[test]
    fn reshape_into_oversized_shape_is_a_mismatch() {
        let location = crate::frontend::Location {
            file: InternedSymbol::new("<test>"),
            line: 7,
            column: 3,
        };

        let mut function = ir::Function::new(InternedSymbol::new("main"), location);
        let constant = function.append_operation(
            OperationKind::Constant {
                value: ir::DenseLiteral::new(Shape::new([1]), vec![1.0]),
            },
            vec![],
            vec![TensorType::ranked([1])],
            location,
        );
        let operand = function.operation(constant).result();
        function.append_operation(
            OperationKind::Reshape {
                shape: Shape::new([3, 12297829382473034411]),
            },
            vec![operand],
            vec![TensorType::Unranked],
            location,
        );

        let error = infer_function(&mut function).unwrap_err();

        assert!(matches!(
            error.kind,
            ErrorKind::ShapeMismatch {
                operation: "reshape",
                ..
            }
        ));
        assert_eq!(error.location.unwrap().line, 7);
    }

    #[test]
    fn generic_functions_stay_unresolved() {
        let mut module = lower_source(indoc! {"
            def id(a) { return a; }
            def main() { print(id([1])); }
        "})
        .unwrap();

        let error = infer_shapes(&mut module).unwrap_err();

        assert!(matches!(error.kind, ErrorKind::UnresolvedShape { .. }));
    }

    #[test]
    fn return_refines_signature() {
        let mut module = lower_source("def main() { return [[1, 2]]; }").unwrap();
        infer_shapes(&mut module).unwrap();

        assert_eq!(
            module.functions[0].result_types,
            vec![TensorType::ranked([1, 2])]
        );
    }
}

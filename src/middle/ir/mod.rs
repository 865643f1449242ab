//! Tensor IR. A function is an arena of operations and values addressed by
//! stable indices. Operations are plain data; the meaning of each kind lives in
//! the passes, which all `match` over [`OperationKind`].
//!
//! Instead of back pointers from values to their users, each function keeps a
//! multimap from a value to the operations using it. An operation using the
//! same value twice appears twice in that list.

use hashbrown::HashMap;
use itertools::Itertools;

use crate::{
    error::{Error, ErrorKind},
    frontend::{Location, intern::InternedSymbol},
    index::{IndexVec, simple_index},
};

pub mod ast_lowering;
pub mod pretty_print;
pub mod ty;

pub use ty::{DenseLiteral, Shape, TensorType};

simple_index! {
    /// Identifies a value within its defining function
    pub struct ValueId;
}

simple_index! {
    /// Identifies an operation within its function. Ids of erased operations
    /// are never reused.
    pub struct OperationId;
}

/// Functions in source order
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_function(&mut self, function: Function) -> Result<(), Error> {
        if self.get(function.name).is_some() {
            return Err(Error::at(
                ErrorKind::Redefinition {
                    name: function.name,
                },
                function.location,
            ));
        }

        self.functions.push(function);
        Ok(())
    }

    pub fn get(&self, name: InternedSymbol) -> Option<&Function> {
        self.functions.iter().find(|function| function.name == name)
    }

    pub fn get_mut(&mut self, name: InternedSymbol) -> Option<&mut Function> {
        self.functions
            .iter_mut()
            .find(|function| function.name == name)
    }

    pub fn verify(&self) -> Result<(), Error> {
        self.functions.iter().try_for_each(Function::verify)
    }
}

#[derive(Debug, Clone)]
pub struct Value {
    pub ty: TensorType,
    pub definition: ValueDefinition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueDefinition {
    Argument(usize),
    Result {
        operation: OperationId,
        index: usize,
    },
}

#[derive(Debug, Clone)]
pub struct Operation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub operands: Vec<ValueId>,
    pub results: Vec<ValueId>,
    pub location: Location,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// The single result of the operation
    pub fn result(&self) -> ValueId {
        assert_eq!(
            self.results.len(),
            1,
            "`{}` does not have exactly one result",
            self.name()
        );

        self.results[0]
    }
}

#[derive(Debug, Clone, PartialEq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum OperationKind {
    Constant {
        value: DenseLiteral,
    },
    Add,
    Multiply,
    #[strum(serialize = "matmul")]
    MatMul,
    Transpose,
    /// Reinterprets the operand with the declared shape
    Reshape {
        shape: Shape,
    },
    /// Call to a user defined function whose shapes depend on the call site
    GenericCall {
        callee: InternedSymbol,
    },
    Return,
    /// Converts the operand to the result type. Inserted by the inliner where
    /// an argument's type differs from the callee's parameter type
    Cast,
    Print,
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Whether erasing the operation could change the program's behaviour
    /// even when its results are unused
    pub fn has_side_effects(&self) -> bool {
        match self {
            OperationKind::Print | OperationKind::Return | OperationKind::GenericCall { .. } => {
                true
            }
            OperationKind::Constant { .. }
            | OperationKind::Add
            | OperationKind::Multiply
            | OperationKind::MatMul
            | OperationKind::Transpose
            | OperationKind::Reshape { .. }
            | OperationKind::Cast => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: InternedSymbol,
    pub location: Location,
    pub arguments: Vec<ValueId>,
    /// Result half of the signature. Argument types are the types of
    /// `arguments`.
    pub result_types: Vec<TensorType>,
    values: IndexVec<ValueId, Value>,
    operations: IndexVec<OperationId, Option<Operation>>,
    /// Operation order. Definitions always precede uses.
    body: Vec<OperationId>,
    uses: HashMap<ValueId, Vec<OperationId>>,
}

impl Function {
    pub fn new(name: InternedSymbol, location: Location) -> Self {
        Self {
            name,
            location,
            arguments: Vec::new(),
            result_types: Vec::new(),
            values: IndexVec::new(),
            operations: IndexVec::new(),
            body: Vec::new(),
            uses: HashMap::new(),
        }
    }

    pub fn add_argument(&mut self, ty: TensorType) -> ValueId {
        let id = self.values.push(Value {
            ty,
            definition: ValueDefinition::Argument(self.arguments.len()),
        });

        self.arguments.push(id);
        id
    }

    pub fn argument_types(&self) -> Vec<TensorType> {
        self.arguments
            .iter()
            .map(|arg| self.value_type(*arg).clone())
            .collect()
    }

    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id]
    }

    pub fn value_type(&self, id: ValueId) -> &TensorType {
        &self.values[id].ty
    }

    pub fn set_value_type(&mut self, id: ValueId, ty: TensorType) {
        self.values[id].ty = ty;
    }

    /// Looks up a live operation. Panics if the operation was erased.
    pub fn operation(&self, id: OperationId) -> &Operation {
        self.try_operation(id)
            .unwrap_or_else(|| panic!("operation {id:?} was erased"))
    }

    pub fn try_operation(&self, id: OperationId) -> Option<&Operation> {
        self.operations.get(id).and_then(Option::as_ref)
    }

    pub fn defining_operation(&self, value: ValueId) -> Option<&Operation> {
        match self.values[value].definition {
            ValueDefinition::Argument(_) => None,
            ValueDefinition::Result { operation, .. } => self.try_operation(operation),
        }
    }

    /// Operation ids in body order
    pub fn body(&self) -> &[OperationId] {
        &self.body
    }

    /// Live operations in body order
    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.body.iter().map(|id| self.operation(*id))
    }

    pub fn return_operation(&self) -> Option<&Operation> {
        self.body
            .last()
            .map(|id| self.operation(*id))
            .filter(|op| op.kind == OperationKind::Return)
    }

    pub fn uses(&self, value: ValueId) -> &[OperationId] {
        self.uses.get(&value).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn has_uses(&self, value: ValueId) -> bool {
        !self.uses(value).is_empty()
    }

    /// Creates an operation at the end of the body
    pub fn append_operation(
        &mut self,
        kind: OperationKind,
        operands: Vec<ValueId>,
        result_types: Vec<TensorType>,
        location: Location,
    ) -> OperationId {
        let id = self.create_operation(kind, operands, result_types, location);
        self.body.push(id);
        id
    }

    /// Creates an operation immediately before `anchor` in the body
    pub fn insert_operation_before(
        &mut self,
        anchor: OperationId,
        kind: OperationKind,
        operands: Vec<ValueId>,
        result_types: Vec<TensorType>,
        location: Location,
    ) -> OperationId {
        let position = self.position_of(anchor);
        let id = self.create_operation(kind, operands, result_types, location);
        self.body.insert(position, id);
        id
    }

    fn position_of(&self, id: OperationId) -> usize {
        self.body
            .iter()
            .position(|op| *op == id)
            .unwrap_or_else(|| panic!("operation {id:?} is not in the body"))
    }

    fn create_operation(
        &mut self,
        kind: OperationKind,
        operands: Vec<ValueId>,
        result_types: Vec<TensorType>,
        location: Location,
    ) -> OperationId {
        let id = self.operations.next_index();

        let results = result_types
            .into_iter()
            .enumerate()
            .map(|(index, ty)| {
                self.values.push(Value {
                    ty,
                    definition: ValueDefinition::Result {
                        operation: id,
                        index,
                    },
                })
            })
            .collect();

        for operand in &operands {
            assert!(
                self.values.get(*operand).is_some(),
                "operand {operand:?} does not exist"
            );
            self.uses.entry(*operand).or_default().push(id);
        }

        self.operations.push(Some(Operation {
            id,
            kind,
            operands,
            results,
            location,
        }))
    }

    /// Rewrites every use of `from` to use `to` instead. Runs in time
    /// proportional to the number of uses of `from`.
    pub fn replace_all_uses_with(&mut self, from: ValueId, to: ValueId) {
        if from == to {
            return;
        }

        let users = self.uses.remove(&from).unwrap_or_default();

        for user in users.into_iter().unique() {
            let operation = self.operations[user]
                .as_mut()
                .expect("use list references an erased operation");

            for operand in &mut operation.operands {
                if *operand == from {
                    *operand = to;
                    self.uses.entry(to).or_default().push(user);
                }
            }
        }
    }

    /// Erases an operation. Fails if any of its results is still in use.
    pub fn erase_operation(&mut self, id: OperationId) -> Result<(), Error> {
        let operation = self.operation(id);

        let uses: usize = operation
            .results
            .iter()
            .map(|result| self.uses(*result).len())
            .sum();

        if uses > 0 {
            return Err(Error::at(
                ErrorKind::Use {
                    operation: operation.name(),
                    uses,
                },
                operation.location,
            ));
        }

        let position = self.position_of(id);
        self.body.remove(position);

        let operation = self.operations[id]
            .take()
            .expect("operation was checked to be live");

        for operand in operation.operands {
            if let Some(users) = self.uses.get_mut(&operand) {
                if let Some(index) = users.iter().position(|user| *user == id) {
                    users.swap_remove(index);
                }

                if users.is_empty() {
                    self.uses.remove(&operand);
                }
            }
        }

        for result in operation.results {
            self.uses.remove(&result);
        }

        Ok(())
    }

    /// Checks the structural invariants every pass must preserve
    pub fn verify(&self) -> Result<(), Error> {
        let fail = |message: String, location: Location| {
            Err(Error::invariant(
                format!("in function `{}`: {message}", self.name),
                Some(location),
            ))
        };

        for (index, argument) in self.arguments.iter().enumerate() {
            if self.values[*argument].definition != ValueDefinition::Argument(index) {
                return fail(format!("argument {index} is not defined as one"), self.location);
            }
        }

        let mut position_of = HashMap::new();
        let mut recorded_uses: HashMap<ValueId, Vec<OperationId>> = HashMap::new();

        for (position, id) in self.body.iter().enumerate() {
            let Some(operation) = self.try_operation(*id) else {
                return fail(format!("body references erased operation {id:?}"), self.location);
            };

            if operation.id != *id || position_of.insert(*id, position).is_some() {
                return fail(
                    format!("operation {id:?} appears more than once"),
                    operation.location,
                );
            }

            for operand in &operation.operands {
                let Some(value) = self.values.get(*operand) else {
                    return fail(
                        format!("`{}` uses unknown value", operation.name()),
                        operation.location,
                    );
                };

                let dominates = match value.definition {
                    ValueDefinition::Argument(index) => self.arguments.get(index) == Some(operand),
                    ValueDefinition::Result { operation, .. } => position_of
                        .get(&operation)
                        .is_some_and(|defined_at| *defined_at < position),
                };

                if !dominates {
                    return fail(
                        format!("operand of `{}` is not defined before its use", operation.name()),
                        operation.location,
                    );
                }

                recorded_uses.entry(*operand).or_default().push(*id);
            }

            for (index, result) in operation.results.iter().enumerate() {
                let expected = ValueDefinition::Result {
                    operation: *id,
                    index,
                };

                if self.values[*result].definition != expected {
                    return fail(
                        format!("result {index} of `{}` has the wrong definition", operation.name()),
                        operation.location,
                    );
                }
            }

            let is_last = position + 1 == self.body.len();

            if (operation.kind == OperationKind::Return) != is_last {
                return fail(
                    "body must end with exactly one `return`".to_string(),
                    operation.location,
                );
            }

            if operation.kind == OperationKind::Return
                && operation.operands.len() != self.result_types.len()
            {
                return fail(
                    format!(
                        "`return` has {} operand(s) but the signature has {} result(s)",
                        operation.operands.len(),
                        self.result_types.len()
                    ),
                    operation.location,
                );
            }
        }

        if self.body.is_empty() {
            return fail("body must end with exactly one `return`".to_string(), self.location);
        }

        let actual_uses = self
            .uses
            .iter()
            .filter(|(_, users)| !users.is_empty())
            .map(|(value, users)| (*value, users.iter().copied().sorted().collect::<Vec<_>>()))
            .collect::<HashMap<_, _>>();

        let recorded_uses = recorded_uses
            .into_iter()
            .map(|(value, users)| (value, users.into_iter().sorted().collect::<Vec<_>>()))
            .collect::<HashMap<_, _>>();

        if actual_uses != recorded_uses {
            return fail("use lists are out of sync with operands".to_string(), self.location);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location() -> Location {
        Location {
            file: InternedSymbol::new("<test>"),
            line: 1,
            column: 1,
        }
    }

    fn constant(function: &mut Function, values: Vec<f64>) -> ValueId {
        let shape = Shape::new([values.len()]);
        let op = function.append_operation(
            OperationKind::Constant {
                value: DenseLiteral::new(shape.clone(), values),
            },
            vec![],
            vec![TensorType::Ranked(shape)],
            location(),
        );

        function.operation(op).result()
    }

    #[test]
    fn replace_all_uses_moves_every_use() {
        let mut function = Function::new(InternedSymbol::new("main"), location());
        let a = constant(&mut function, vec![1.0, 2.0]);
        let b = constant(&mut function, vec![3.0, 4.0]);

        let add = function.append_operation(
            OperationKind::Add,
            vec![a, a],
            vec![TensorType::Unranked],
            location(),
        );
        let sum = function.operation(add).result();
        function.append_operation(OperationKind::Print, vec![sum], vec![], location());
        function.append_operation(OperationKind::Return, vec![], vec![], location());

        assert_eq!(function.uses(a).len(), 2);

        function.replace_all_uses_with(a, b);

        assert!(!function.has_uses(a));
        assert_eq!(function.uses(b), &[add, add]);
        assert_eq!(function.operation(add).operands, vec![b, b]);
        function.verify().unwrap();
    }

    #[test]
    fn erase_with_uses_fails() {
        let mut function = Function::new(InternedSymbol::new("main"), location());
        let a = constant(&mut function, vec![1.0]);
        let print = function.append_operation(OperationKind::Print, vec![a], vec![], location());
        function.append_operation(OperationKind::Return, vec![], vec![], location());

        let defining = function.defining_operation(a).unwrap().id;
        let error = function.erase_operation(defining).unwrap_err();

        assert_eq!(
            error.kind,
            ErrorKind::Use {
                operation: "constant",
                uses: 1
            }
        );

        function.erase_operation(print).unwrap();
        function.erase_operation(defining).unwrap();
        assert_eq!(function.body().len(), 1);
        function.verify().unwrap();
    }

    #[test]
    fn insert_before_keeps_dominance() {
        let mut function = Function::new(InternedSymbol::new("main"), location());
        let a = constant(&mut function, vec![1.0, 2.0]);
        let ret = function.append_operation(OperationKind::Return, vec![], vec![], location());

        let transpose = function.insert_operation_before(
            ret,
            OperationKind::Transpose,
            vec![a],
            vec![TensorType::Unranked],
            location(),
        );

        assert_eq!(function.body()[1], transpose);
        function.verify().unwrap();
    }

    #[test]
    fn verify_rejects_use_before_definition() {
        let mut function = Function::new(InternedSymbol::new("main"), location());
        let ret = function.append_operation(OperationKind::Return, vec![], vec![], location());
        let a = constant(&mut function, vec![1.0]);

        // Print placed before the constant it prints
        function.insert_operation_before(ret, OperationKind::Print, vec![a], vec![], location());

        let error = function.verify().unwrap_err();
        assert!(matches!(error.kind, ErrorKind::InvariantViolation(_)));
    }

    #[test]
    fn operation_names_are_snake_case() {
        assert_eq!(OperationKind::MatMul.name(), "matmul");
        assert_eq!(
            OperationKind::GenericCall {
                callee: InternedSymbol::new("f")
            }
            .name(),
            "generic_call"
        );
        assert_eq!(
            OperationKind::Reshape {
                shape: Shape::new([2])
            }
            .name(),
            "reshape"
        );
    }
}

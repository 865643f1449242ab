//! The AST is turned into tensor IR here. Calls are inlined into the entry
//! function, shapes are inferred, algebraic rewrites are applied and repeated
//! computations are merged before the program is lowered to explicit loop nests over buffers.

pub mod cse;
pub mod inline;
pub mod ir;
pub mod loops;
pub mod rewrite;
pub mod shape_inference;

#[cfg(test)]
pub(crate) fn lower_source(source: &str) -> Result<ir::Module, crate::error::Error> {
    let source_file = crate::frontend::SourceFile::from_memory(source);
    let module = crate::frontend::parser::Parser::parse_module(&source_file)?;

    ir::ast_lowering::lower_module(&module)
}

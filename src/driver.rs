//! Runs the compiler stages in order and stops at the requested one. Each
//! stage hands its module to the next by value, and the tensor IR is verified
//! after every pass that touches it.

use colored::Colorize;
use itertools::Itertools;

use crate::{
    backend::{
        ExecutionOptions,
        targets::{ExecutionEngine, Target},
    },
    error::Error,
    frontend::{
        SourceFile,
        intern::InternedSymbol,
        lexer::{Lexer, Token},
        parser::Parser,
    },
    middle::{
        cse::eliminate_common_subexpressions,
        inline::inline_calls,
        ir::{self, ast_lowering},
        loops::{self, tensor_lowering},
        rewrite::simplify,
        shape_inference::infer_shapes,
    },
};

/// How far to take a source file through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stage {
    Tokens,
    Ast,
    Ir,
    Loops,
    #[default]
    Run,
}

#[derive(Debug, Clone, Copy)]
pub struct CompileOptions {
    /// Function every other function is inlined into
    pub entry: InternedSymbol,
    /// Run inlining, shape inference and rewrites before emitting tensor IR
    pub optimize: bool,
    /// Print the IR to stderr after every pass
    pub trace_passes: bool,
    pub target: Target,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            entry: InternedSymbol::new("main"),
            optimize: false,
            trace_passes: false,
            target: Target::default(),
        }
    }
}

/// Whatever the last requested stage produced
#[derive(Debug)]
pub enum Artifact {
    Tokens(Vec<Token>),
    /// Debug rendering of the syntax tree, which borrows the source text
    Ast(String),
    Ir(ir::Module),
    Loops(loops::Module),
    /// Everything the program printed
    Output(String),
}

impl core::fmt::Display for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Artifact::Tokens(tokens) => {
                write!(f, "{}", tokens.iter().map(|token| format!("{token:?}")).join("\n"))
            }
            Artifact::Ast(tree) => f.write_str(tree),
            Artifact::Ir(module) => write!(f, "{module}"),
            Artifact::Loops(module) => write!(f, "{module}"),
            Artifact::Output(output) => f.write_str(output),
        }
    }
}

pub fn compile(
    source_file: &SourceFile,
    stage: Stage,
    options: &CompileOptions,
) -> Result<Artifact, Error> {
    if stage == Stage::Tokens {
        return Ok(Artifact::Tokens(Lexer::new(source_file).tokenize()?));
    }

    let ast = Parser::parse_module(source_file)?;

    if stage == Stage::Ast {
        return Ok(Artifact::Ast(format!("{ast:#?}")));
    }

    let module = ast_lowering::lower_module(&ast)?;
    verify_pass(options, "ast lowering", &module)?;

    if stage == Stage::Ir && !options.optimize {
        return Ok(Artifact::Ir(module));
    }

    let module = optimize(module, options)?;

    if stage == Stage::Ir {
        return Ok(Artifact::Ir(module));
    }

    let loop_module = tensor_lowering::lower_module(&module, options.entry)?;
    trace(options, "loop lowering", &loop_module);

    if stage == Stage::Loops {
        return Ok(Artifact::Loops(loop_module));
    }

    let mut output = Vec::new();

    options.target.get_execution_engine().execute(
        &loop_module,
        &ExecutionOptions {
            entry: options.entry,
        },
        &mut output,
    )?;

    Ok(Artifact::Output(
        String::from_utf8_lossy(&output).into_owned(),
    ))
}

/// Parses `source` from memory and runs it, returning what it printed
pub fn run_source(source: &str, options: &CompileOptions) -> Result<String, Error> {
    let source_file = SourceFile::from_memory(source);

    match compile(&source_file, Stage::Run, options)? {
        Artifact::Output(output) => Ok(output),
        artifact => Err(Error::invariant(
            format!("running produced {artifact:?} instead of output"),
            None,
        )),
    }
}

/// Specializes everything into the entry function, then alternates shape
/// inference, simplification and common subexpression elimination until
/// neither changes anything
fn optimize(module: ir::Module, options: &CompileOptions) -> Result<ir::Module, Error> {
    let mut module = inline_calls(module, options.entry)?;
    verify_pass(options, "inlining", &module)?;

    loop {
        infer_shapes(&mut module)?;
        verify_pass(options, "shape inference", &module)?;

        let rewrites = simplify(&mut module)?;
        verify_pass(options, "simplification", &module)?;

        let merged = eliminate_common_subexpressions(&mut module)?;
        verify_pass(options, "common subexpression elimination", &module)?;

        if rewrites + merged == 0 {
            return Ok(module);
        }
    }
}

fn verify_pass(options: &CompileOptions, pass: &str, module: &ir::Module) -> Result<(), Error> {
    trace(options, pass, module);
    module.verify()
}

fn trace(options: &CompileOptions, pass: &str, module: &impl core::fmt::Display) {
    if options.trace_passes {
        eprintln!("{}", format!("// ----- IR after {pass} -----").cyan().bold());
        eprintln!("{module:#}");
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::error::ErrorKind;

    fn emit(source: &str, stage: Stage, options: &CompileOptions) -> Result<String, Error> {
        let source_file = SourceFile::from_memory(source);

        compile(&source_file, stage, options)
            .map(|artifact| strip_ansi_escapes::strip_str(artifact.to_string()))
    }

    #[test]
    fn runs_transpose_end_to_end() {
        let output = run_source(
            "func main() { var a = [[1,2],[3,4]]; var b = transpose(a); print(b); }",
            &CompileOptions::default(),
        )
        .unwrap();

        assert_eq!(output, "[[1,3],[2,4]]\n");
    }

    #[test]
    fn ir_stage_honours_optimize_flag() {
        let source = indoc! {"
            def f(a) {
              return transpose(a);
            }

            def main() {
              var x = [1, 2];
              print(f(x));
            }
        "};

        let unoptimized = emit(source, Stage::Ir, &CompileOptions::default()).unwrap();
        assert!(unoptimized.contains("generic_call @f"));
        assert!(unoptimized.contains("func @f"));

        let optimized = emit(
            source,
            Stage::Ir,
            &CompileOptions {
                optimize: true,
                ..Default::default()
            },
        )
        .unwrap();

        assert!(!optimized.contains("generic_call"));
        assert!(!optimized.contains("func @f"));
        assert!(optimized.contains("tensor<2xf64>"));
    }

    #[test]
    fn optimized_ir_computes_repeated_expressions_once() {
        let ir = emit(
            "def main() { var a = [[1, 2], [3, 4]]; print(transpose(a) + transpose(a)); }",
            Stage::Ir,
            &CompileOptions {
                optimize: true,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(ir.matches("transpose(").count(), 1);

        let output = run_source(
            "def main() { var a = [[1, 2], [3, 4]]; print(transpose(a) + transpose(a)); }",
            &CompileOptions::default(),
        )
        .unwrap();

        assert_eq!(output, "[[2,6],[4,8]]\n");
    }

    #[test]
    fn loops_stage_prints_buffers() {
        let output = emit(
            "def main() { var a = [1, 2]; print(a + a); }",
            Stage::Loops,
            &CompileOptions::default(),
        )
        .unwrap();

        assert!(output.contains("alloc : memref<2xf64>"));
        assert!(output.contains("addf"));
        assert!(output.contains("dealloc"));
    }

    #[test]
    fn tokens_and_ast_stop_early() {
        // Not a valid program, but lexing alone succeeds.
        let tokens = emit("def def (", Stage::Tokens, &CompileOptions::default()).unwrap();
        assert_eq!(tokens.lines().count(), 3);

        let error = emit("def main() { print(a) }", Stage::Ast, &CompileOptions::default())
            .unwrap_err();
        assert!(matches!(error.kind, ErrorKind::Syntax(_)));
    }

    #[test]
    fn custom_entry_is_run() {
        let output = run_source(
            "def start() { print([[1, 2, 3]] + [[1, 2, 3]]); }",
            &CompileOptions {
                entry: InternedSymbol::new("start"),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(output, "[[2,4,6]]\n");
    }
}

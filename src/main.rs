use std::path::PathBuf;

use clap::{CommandFactory, Parser as ClapParser, ValueEnum, error::ErrorKind};
use indoc::indoc;
use tensorc::{
    driver::{self, CompileOptions, Stage},
    frontend::{SourceFile, SourceFileOrigin, intern::InternedSymbol},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Emit {
    /// Token stream
    Tokens,
    /// Syntax tree
    Ast,
    /// Tensor IR
    Ir,
    /// Loop IR
    Loops,
    /// Execute the entry function
    Run,
}

impl From<Emit> for Stage {
    fn from(emit: Emit) -> Self {
        match emit {
            Emit::Tokens => Stage::Tokens,
            Emit::Ast => Stage::Ast,
            Emit::Ir => Stage::Ir,
            Emit::Loops => Stage::Loops,
            Emit::Run => Stage::Run,
        }
    }
}

#[derive(Debug, ClapParser)]
#[command(
    version,
    about,
    long_about = indoc! {"
        Compiles a tensor program and runs its entry function.

        Every function is inlined into the entry function, which must take no
        arguments. Shapes are inferred from the literals it declares.
    "}
)]
pub struct Args {
    source_file: PathBuf,

    /// What to produce
    #[arg(long, value_enum, default_value_t = Emit::Run)]
    emit: Emit,

    /// Inline, infer shapes, simplify and merge repeated computations before
    /// emitting tensor IR
    #[arg(long)]
    opt: bool,

    /// Entry function
    #[arg(long, default_value = "main")]
    entry: String,

    /// Print the IR to stderr after every pass
    #[arg(long)]
    trace_passes: bool,
}

fn main() {
    let args = Args::parse();

    if !args.source_file.exists() {
        Args::command()
            .error(
                ErrorKind::InvalidValue,
                format!("Source file '{}' does not exist!", args.source_file.display()),
            )
            .exit()
    }

    if !args.source_file.is_file() {
        Args::command()
            .error(
                ErrorKind::InvalidValue,
                format!("Input path '{}' is not a file!", args.source_file.display()),
            )
            .exit()
    }

    let contents = match std::fs::read_to_string(&args.source_file) {
        Ok(contents) => contents,
        Err(error) => Args::command()
            .error(
                ErrorKind::Io,
                format!("Failed to read '{}': {error}", args.source_file.display()),
            )
            .exit(),
    };

    let source_file = SourceFile {
        contents,
        origin: SourceFileOrigin::File(args.source_file),
    };

    let options = CompileOptions {
        entry: InternedSymbol::new(&args.entry),
        optimize: args.opt,
        trace_passes: args.trace_passes,
        ..Default::default()
    };

    match driver::compile(&source_file, args.emit.into(), &options) {
        Ok(artifact) => {
            let artifact = artifact.to_string();

            if artifact.ends_with('\n') || artifact.is_empty() {
                print!("{artifact}");
            } else {
                println!("{artifact}");
            }
        }
        Err(error) => {
            error.report(Some(&source_file));
            std::process::exit(1);
        }
    }
}

//! `sqdecomp` — decompiles a Squirrel VM bytecode binary back to source.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use sqdecomp::config::{OpcodeDialect, Options};
use sqdecomp::error::CliError;
use sqdecomp::function::Function;

#[derive(Parser)]
#[command(name = "sqdecomp")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Reconstructs Squirrel-like source from compiled VM bytecode")]
struct Cli {
    /// Compiled binary to decompile.
    file: PathBuf,

    /// Decompile only the named (possibly dotted, e.g. `Foo::Bar`) nested
    /// function instead of the whole file.
    #[arg(short = 'd', long = "function", value_name = "NAME")]
    function: Option<String>,

    /// Emit `// line N` comments and raw-opcode dumps for recovered opcodes.
    #[arg(long)]
    debug: bool,

    /// Write the reconstructed source to a file instead of stdout.
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Select the opcode dialect the binary was compiled against.
    #[arg(long, value_enum, default_value = "unified")]
    dialect: DialectArg,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum DialectArg {
    Unified,
    Split,
}

impl From<DialectArg> for OpcodeDialect {
    fn from(d: DialectArg) -> Self {
        match d {
            DialectArg::Unified => OpcodeDialect::Unified,
            DialectArg::Split => OpcodeDialect::Split,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("sqdecomp: {err}");
            match err {
                CliError::Usage(_) => ExitCode::from(2),
                CliError::Loader(_) => ExitCode::from(1),
                CliError::Decompile(_) | CliError::Io(_) => ExitCode::from(1),
            }
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let bytes = fs::read(&cli.file)
        .map_err(|e| CliError::Usage(format!("cannot read '{}': {e}", cli.file.display())))?;

    let options = Options::new()
        .with_debug_mode(cli.debug)
        .with_dialect(cli.dialect.into());

    let source = match &cli.function {
        Some(name) => {
            let root = sqdecomp::loader::load_from_bytes(&bytes, options.dialect)?;
            let target = find_named(&root, name)
                .ok_or_else(|| CliError::Usage(format!("no such function '{name}'")))?;
            sqdecomp::decompile_function_source(target, &options)?
        }
        None => sqdecomp::decompile_source(&bytes, &options)?,
    };

    match cli.output {
        Some(path) => fs::write(&path, source)?,
        None => print!("{source}"),
    }
    Ok(())
}

/// Looks up a nested function by dotted path, also accepting the root
/// function's own name (so `-d Main` on a single-function file works).
fn find_named<'f>(root: &'f Function, name: &str) -> Option<&'f Function> {
    if root.name == name {
        return Some(root);
    }
    root.find_function(name)
}

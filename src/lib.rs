//! Squirrel bytecode decompiler.
//!
//! Reads a compiled `.nut`-binary (the `SQIR`-tagged container described by
//! the loader), symbolically walks each function's instruction stream, and
//! re-emits structured, reparsable Squirrel-like source.
//!
//! ```rust,ignore
//! use sqdecomp::{decompile_source, config::Options};
//!
//! let bytes = std::fs::read("script.cnut")?;
//! let source = decompile_source(&bytes, &Options::new())?;
//! print!("{source}");
//! ```

pub mod block;
pub mod config;
pub mod decompiler;
pub mod emit;
pub mod error;
pub mod expr;
pub mod function;
pub mod loader;
pub mod opcode;
pub mod stmt;
pub mod value;
pub mod vm;

pub use config::{Options, OpcodeDialect};
pub use error::{CliError, DecompileError, LoaderError};
pub use function::Function;

/// Loads a binary container and decompiles its root function (and, recursively,
/// every function nested inside it) into one source string.
///
/// A function whose body cannot be fully reconstructed does not abort the
/// whole file: it is replaced with a `// could not decompile function '<name>':
/// <error>` comment and decompilation continues with its siblings (§7).
pub fn decompile_source(bytes: &[u8], options: &Options) -> Result<String, LoaderError> {
    let root = loader::load_from_bytes(bytes, options.dialect)?;
    let mut out = String::new();
    decompile_function_tree(&root, options, &mut out);
    Ok(out)
}

/// Decompiles a single, already-loaded function (ignoring any nested
/// functions it declares) to a source string.
pub fn decompile_function_source(function: &Function, options: &Options) -> Result<String, DecompileError> {
    let body = decompiler::decompile_function(function, options)?;
    emit::emit_function(function, &body).map_err(|_| DecompileError::UnrecognizedControlFlow { at: 0 })
}

fn decompile_function_tree(function: &Function, options: &Options, out: &mut String) {
    let span = tracing::info_span!("decompile_function", name = %function.name);
    let _enter = span.enter();

    match decompile_function_source(function, options) {
        Ok(src) => out.push_str(&src),
        Err(e) => {
            tracing::warn!(name = %function.name, error = %e, "function could not be decompiled");
            out.push_str(&format!("// could not decompile function '{}': {e}\n", function.name));
        }
    }

    for nested in &function.functions {
        out.push('\n');
        decompile_function_tree(nested, options, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decompile_source_rejects_bad_magic_without_panicking() {
        let bytes = vec![0u8; 32];
        let err = decompile_source(&bytes, &Options::new()).unwrap_err();
        assert!(matches!(err, LoaderError::BadMagic(_)));
    }
}

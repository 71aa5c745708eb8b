//! Error types for the loader and the decompilation engine.
//!
//! Hand-rolled rather than derived: each layer gets its own enum with a
//! manual `Display`/`std::error::Error`/`From` impl, matching the error
//! style used throughout this codebase's other layers.

use std::fmt;

/// Errors surfaced while parsing the binary container into a [`crate::function::Function`] tree.
#[derive(Debug)]
pub enum LoaderError {
    /// The 16-bit magic at the start of the file did not match `0xFAFA`.
    BadMagic(u16),
    /// A 4-byte tag (`'PART'`, `'SQIR'`, `'TAIL'`) did not match what was expected here.
    BadTag {
        expected: &'static str,
        found: u32,
    },
    /// One of the three `sizeof` sanity fields did not match the expected build constant.
    SizeMismatch {
        field: &'static str,
        expected: u32,
        found: u32,
    },
    /// The cursor ran out of bytes before a read completed.
    UnexpectedEof,
    /// A literal/object type tag was not one of the known variants.
    InvalidObjectType(u32),
    /// Underlying I/O failure (opening/reading the file).
    Io(std::io::Error),
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoaderError::BadMagic(found) => {
                write!(f, "bad .nut binary file format: magic 0x{found:04X} != 0xFAFA")
            }
            LoaderError::BadTag { expected, found } => {
                write!(
                    f,
                    "bad .nut binary file format: expected '{expected}' tag, found 0x{found:08X}"
                )
            }
            LoaderError::SizeMismatch {
                field,
                expected,
                found,
            } => write!(
                f,
                "bad .nut binary file format: sizeof({field}) check expected {expected}, found {found}"
            ),
            LoaderError::UnexpectedEof => write!(f, "unexpected end of file while reading"),
            LoaderError::InvalidObjectType(tag) => {
                write!(f, "unknown type of object in source binary file: 0x{tag:08X}")
            }
            LoaderError::Io(e) => write!(f, "I/O error while reading from file: {e}"),
        }
    }
}

impl std::error::Error for LoaderError {}

impl From<std::io::Error> for LoaderError {
    fn from(e: std::io::Error) -> Self {
        LoaderError::Io(e)
    }
}

/// Errors raised while symbolically decompiling a single function's instructions.
///
/// `UnknownOpcode` and `UnrecognizedControlFlow` are recovered by the caller
/// (a commented fallback is emitted and decompilation continues); the other
/// variants are fatal to the current function.
#[derive(Debug)]
pub enum DecompileError {
    /// A VM slot access addressed an index outside `[0, stack_size)`.
    InvalidStackAccess { index: i32, stack_size: usize },
    /// A decoded opcode had no normalized-set mapping (recovered by the caller).
    UnknownOpcode { raw: u8, at: usize },
    /// A jump instruction did not match any control-flow reconstruction rule (recovered).
    UnrecognizedControlFlow { at: usize },
}

impl fmt::Display for DecompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecompileError::InvalidStackAccess { index, stack_size } => write!(
                f,
                "invalid stack access: index {index} outside [0, {stack_size})"
            ),
            DecompileError::UnknownOpcode { raw, at } => {
                write!(f, "unknown opcode 0x{raw:02X} at instruction {at}")
            }
            DecompileError::UnrecognizedControlFlow { at } => {
                write!(f, "unrecognized control flow at instruction {at}")
            }
        }
    }
}

impl std::error::Error for DecompileError {}

/// Top-level error type returned by the CLI binary.
#[derive(Debug)]
pub enum CliError {
    Loader(LoaderError),
    Decompile(DecompileError),
    Io(std::io::Error),
    Usage(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Loader(e) => write!(f, "{e}"),
            CliError::Decompile(e) => write!(f, "{e}"),
            CliError::Io(e) => write!(f, "{e}"),
            CliError::Usage(s) => write!(f, "{s}"),
        }
    }
}

impl std::error::Error for CliError {}

impl From<LoaderError> for CliError {
    fn from(e: LoaderError) -> Self {
        CliError::Loader(e)
    }
}

impl From<DecompileError> for CliError {
    fn from(e: DecompileError) -> Self {
        CliError::Decompile(e)
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        CliError::Io(e)
    }
}

//! Binary container loader.
//!
//! Reads the fixed little-endian layout described in §6 and produces an
//! immutable [`Function`] tree. No crate in this repository's dependency
//! graph is dedicated to binary parsing — none of the example repos this
//! codebase is grounded on pulls in `byteorder`/`binrw`/`nom` for this kind
//! of job, so the cursor reads here are hand-rolled, the corpus-consistent
//! choice.
//!
//! The original reader hook (`BinaryReader::SetReaderHook`) is not ported:
//! its setter assigns `s_hookObj = s_hookObj`, a no-op that means the hook
//! was never wired to anything upstream either.

use crate::config::OpcodeDialect;
use crate::error::LoaderError;
use crate::function::{Function, Instruction, LineInfo, LocalVarInfo, OuterKind, OuterValueInfo};
use crate::opcode::Opcode;
use crate::value::Value;

const OT_NULL: u32 = 0x0100_0001;
const OT_INTEGER: u32 = 0x0400_0002;
const OT_FLOAT: u32 = 0x0400_0004;
const OT_BOOL: u32 = 0x0100_0008;
const OT_STRING: u32 = 0x0800_0010;

fn multichar_tag(tag: &[u8; 4]) -> u32 {
    ((tag[0] as u32) << 24) | ((tag[1] as u32) << 16) | ((tag[2] as u32) << 8) | (tag[3] as u32)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Cursor { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], LoaderError> {
        if self.pos + n > self.bytes.len() {
            return Err(LoaderError::UnexpectedEof);
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, LoaderError> {
        Ok(self.take(1)?[0])
    }

    fn read_i8(&mut self) -> Result<i8, LoaderError> {
        Ok(self.read_u8()? as i8)
    }

    fn read_u16(&mut self) -> Result<u16, LoaderError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, LoaderError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i32(&mut self) -> Result<i32, LoaderError> {
        Ok(self.read_u32()? as i32)
    }

    fn read_f32(&mut self) -> Result<f32, LoaderError> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    fn read_bool(&mut self) -> Result<bool, LoaderError> {
        Ok(self.read_u8()? != 0)
    }

    fn confirm_tag(&mut self, tag: &'static str) -> Result<(), LoaderError> {
        let found = self.read_u32()?;
        let expected_bytes: [u8; 4] = tag.as_bytes().try_into().expect("4-byte tag");
        if found != multichar_tag(&expected_bytes) {
            return Err(LoaderError::BadTag {
                expected: tag,
                found,
            });
        }
        Ok(())
    }

    /// Raw length-prefixed byte string, decoded lossily as UTF-8 (see §1: no
    /// locale/codepage table is implemented here).
    fn read_raw_string(&mut self) -> Result<String, LoaderError> {
        let len = self.read_i32()?;
        let len = if len < 0 { 0usize } else { len as usize };
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// A "string-object": an `i32` type tag followed by either a raw string
    /// (`OT_STRING`) or nothing (`OT_NULL`, treated as empty).
    fn read_sq_string_object(&mut self) -> Result<String, LoaderError> {
        let tag = self.read_u32()?;
        match tag {
            OT_STRING => self.read_raw_string(),
            OT_NULL => Ok(String::new()),
            other => Err(LoaderError::InvalidObjectType(other)),
        }
    }

    /// A fully-typed literal-table / outer-value object.
    fn read_object(&mut self) -> Result<Value, LoaderError> {
        let tag = self.read_u32()?;
        match tag {
            OT_NULL => Ok(Value::Null),
            OT_STRING => Ok(Value::String(self.read_raw_string()?)),
            OT_INTEGER => Ok(Value::Int(self.read_u32()? as i32)),
            OT_BOOL => Ok(Value::Bool(self.read_u32()? != 0)),
            OT_FLOAT => Ok(Value::Float(self.read_f32()?)),
            other => Err(LoaderError::InvalidObjectType(other)),
        }
    }

    fn read_instruction(&mut self) -> Result<Instruction, LoaderError> {
        let op = self.read_u8()?;
        let arg0 = self.read_i8()?;
        let arg2 = self.read_i8()?;
        let arg3 = self.read_i8()?;
        let arg1 = self.read_i32()?;
        Ok(Instruction {
            op,
            arg0,
            arg1,
            arg2,
            arg3,
        })
    }
}

fn load_function(cur: &mut Cursor, dialect: OpcodeDialect) -> Result<Function, LoaderError> {
    cur.confirm_tag("PART")?;
    let source_name = cur.read_sq_string_object()?;
    let name = cur.read_sq_string_object()?;
    cur.confirm_tag("PART")?;

    let n_literals = cur.read_u32()? as usize;
    let n_parameters = cur.read_u32()? as usize;
    let n_outer_values = cur.read_u32()? as usize;
    let n_locals = cur.read_u32()? as usize;
    let n_line_infos = cur.read_u32()? as usize;
    let n_default_params = cur.read_u32()? as usize;
    let n_instructions = cur.read_u32()? as usize;
    let n_functions = cur.read_u32()? as usize;

    cur.confirm_tag("PART")?;

    let mut literals = Vec::with_capacity(n_literals);
    for _ in 0..n_literals {
        literals.push(cur.read_object()?);
    }

    let mut parameters = Vec::with_capacity(n_parameters);
    for _ in 0..n_parameters {
        parameters.push(cur.read_sq_string_object()?);
    }

    let mut outer_values = Vec::with_capacity(n_outer_values);
    for _ in 0..n_outer_values {
        let kind = if cur.read_i32()? == 0 {
            OuterKind::Local
        } else {
            OuterKind::Outer
        };
        let src = cur.read_object()?;
        let name = cur.read_object()?;
        outer_values.push(OuterValueInfo { kind, src, name });
    }

    let mut locals = Vec::with_capacity(n_locals);
    for _ in 0..n_locals {
        let lname = cur.read_sq_string_object()?;
        let pos = cur.read_i32()?;
        let start_op = cur.read_i32()?;
        let end_op = cur.read_i32()?;
        locals.push(LocalVarInfo {
            name: lname,
            pos,
            start_op,
            end_op,
            foreach_loop_state: false,
        });
    }

    let mut line_infos = Vec::with_capacity(n_line_infos);
    for _ in 0..n_line_infos {
        let line = cur.read_i32()?;
        let op = cur.read_i32()?;
        line_infos.push(LineInfo { line, op });
    }

    let mut default_params = Vec::with_capacity(n_default_params);
    for _ in 0..n_default_params {
        default_params.push(cur.read_i32()?);
    }

    let mut instructions = Vec::with_capacity(n_instructions);
    for _ in 0..n_instructions {
        instructions.push(cur.read_instruction()?);
    }

    let mut functions = Vec::with_capacity(n_functions);
    for i in 0..n_functions {
        let mut nested = load_function(cur, dialect)?;
        nested.function_index = i as i32;
        functions.push(nested);
    }

    let stack_size = cur.read_i32()?;
    let is_generator = cur.read_bool()?;
    let var_params = cur.read_i32()?;

    mark_foreach_state(&mut locals, &instructions, dialect);

    Ok(Function {
        function_index: -1,
        source_name,
        name,
        literals,
        parameters,
        outer_values,
        locals,
        line_infos,
        default_params,
        instructions,
        functions,
        stack_size,
        is_generator,
        var_params,
    })
}

/// Post-load fixup: a `FOREACH` instruction at index `i` claims two (or,
/// when an explicit iterator local is present, three) consecutive local
/// records as hidden state. Locates the key record (matching `pos == arg2`,
/// `start_op == i - 1`) and marks it, the value record immediately after it,
/// and — if present — the iterator record conventionally named `@ITERATOR@`.
fn mark_foreach_state(locals: &mut [LocalVarInfo], instructions: &[Instruction], dialect: OpcodeDialect) {
    for (i, instr) in instructions.iter().enumerate() {
        if Opcode::from_raw(instr.op, dialect) != Some(Opcode::Foreach) {
            continue;
        }
        let scope_start = i as i32 - 1;
        let local_pos = instr.arg2 as i32;
        let Some(key_idx) = locals
            .iter()
            .rposition(|l| l.pos == local_pos && l.start_op == scope_start)
        else {
            continue;
        };
        locals[key_idx].foreach_loop_state = true;
        if let Some(value) = locals.get_mut(key_idx + 1) {
            value.foreach_loop_state = true;
        }
        if let Some(iter_local) = locals.get_mut(key_idx + 2) {
            if iter_local.name == "@ITERATOR@" {
                iter_local.foreach_loop_state = true;
            }
        }
    }
}

/// Loads a whole binary module, checking the header (`0xFAFA` magic,
/// `'SQIR'` tag, three `sizeof` fields) and the trailing `'TAIL'` tag, and
/// returns the root function.
pub fn load_from_bytes(bytes: &[u8], dialect: OpcodeDialect) -> Result<Function, LoaderError> {
    let mut cur = Cursor::new(bytes);

    let magic = cur.read_u16()?;
    if magic != 0xFAFA {
        return Err(LoaderError::BadMagic(magic));
    }
    cur.confirm_tag("SQIR")?;

    let char_size = cur.read_u32()?;
    if char_size != 1 {
        return Err(LoaderError::SizeMismatch {
            field: "char",
            expected: 1,
            found: char_size,
        });
    }
    let int_size = cur.read_u32()?;
    if int_size != 4 {
        return Err(LoaderError::SizeMismatch {
            field: "int",
            expected: 4,
            found: int_size,
        });
    }
    let float_size = cur.read_u32()?;
    if float_size != 4 {
        return Err(LoaderError::SizeMismatch {
            field: "float",
            expected: 4,
            found: float_size,
        });
    }

    let root = load_function(&mut cur, dialect)?;

    cur.confirm_tag("TAIL")?;

    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-builds the minimal valid container around an empty main function:
    /// no literals/parameters/outers/locals/lines/defaults/instructions/nested
    /// functions, stack size 1, not a generator, no varargs.
    fn build_minimal_container() -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0xFAFAu16.to_le_bytes());
        out.extend_from_slice(&multichar_tag(b"SQIR").to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&4u32.to_le_bytes());
        out.extend_from_slice(&4u32.to_le_bytes());

        // function record
        out.extend_from_slice(&multichar_tag(b"PART").to_le_bytes());
        out.extend_from_slice(&OT_NULL.to_le_bytes()); // source name = null
        out.extend_from_slice(&OT_STRING.to_le_bytes());
        out.extend_from_slice(&4i32.to_le_bytes());
        out.extend_from_slice(b"main");
        out.extend_from_slice(&multichar_tag(b"PART").to_le_bytes());
        for _ in 0..8 {
            out.extend_from_slice(&0u32.to_le_bytes());
        }
        out.extend_from_slice(&multichar_tag(b"PART").to_le_bytes());
        // no sections to read (all counts zero)
        out.extend_from_slice(&1i32.to_le_bytes()); // stack size
        out.push(0); // is_generator = false
        out.extend_from_slice(&0i32.to_le_bytes()); // var params

        out.extend_from_slice(&multichar_tag(b"TAIL").to_le_bytes());
        out
    }

    #[test]
    fn loads_minimal_valid_container() {
        let bytes = build_minimal_container();
        let f = load_from_bytes(&bytes, OpcodeDialect::Unified).expect("should load");
        assert_eq!(f.name, "main");
        assert_eq!(f.source_name, "");
        assert_eq!(f.stack_size, 1);
        assert!(!f.is_generator);
        assert!(f.instructions.is_empty());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = build_minimal_container();
        bytes[0] = 0x00;
        let err = load_from_bytes(&bytes, OpcodeDialect::Unified).unwrap_err();
        assert!(matches!(err, LoaderError::BadMagic(_)));
    }

    #[test]
    fn rejects_truncated_input_without_panicking() {
        let bytes = build_minimal_container();
        let truncated = &bytes[..bytes.len() - 10];
        let err = load_from_bytes(truncated, OpcodeDialect::Unified).unwrap_err();
        assert!(matches!(err, LoaderError::UnexpectedEof));
    }

    #[test]
    fn rejects_bad_tail_tag() {
        let mut bytes = build_minimal_container();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let err = load_from_bytes(&bytes, OpcodeDialect::Unified).unwrap_err();
        assert!(matches!(err, LoaderError::BadTag { expected: "TAIL", .. }));
    }

    #[test]
    fn foreach_fixup_marks_key_value_and_iterator_slots() {
        let mut locals = vec![
            LocalVarInfo {
                name: "k".into(),
                pos: 0,
                start_op: 2,
                end_op: 10,
                foreach_loop_state: false,
            },
            LocalVarInfo {
                name: "v".into(),
                pos: 1,
                start_op: 2,
                end_op: 10,
                foreach_loop_state: false,
            },
            LocalVarInfo {
                name: "@ITERATOR@".into(),
                pos: 2,
                start_op: 2,
                end_op: 10,
                foreach_loop_state: false,
            },
        ];
        let filler = Instruction {
            op: 0,
            arg0: 0,
            arg1: 0,
            arg2: 0,
            arg3: 0,
        };
        // FOREACH (raw 44) must sit at index 3 so that scope_start = 3 - 1 == start_op (2).
        let foreach = Instruction {
            op: 44,
            arg0: 0,
            arg1: 0,
            arg2: 0, // arg2 selects local_pos == 0, matching "k"
            arg3: 0,
        };
        let instructions = vec![filler, filler, filler, foreach];
        mark_foreach_state(&mut locals, &instructions, OpcodeDialect::Unified);
        assert!(locals[0].foreach_loop_state);
        assert!(locals[1].foreach_loop_state);
        assert!(locals[2].foreach_loop_state);
    }
}

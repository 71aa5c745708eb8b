//! Per-function metadata, immutable once the loader has produced it.

use crate::value::Value;

/// A fixed 8-byte instruction record: opcode byte, three byte operands, and
/// one 32-bit operand reinterpreted as a float for `LOADFLOAT`.
#[derive(Debug, Clone, Copy)]
pub struct Instruction {
    pub op: u8,
    pub arg0: i8,
    pub arg1: i32,
    pub arg2: i8,
    pub arg3: i8,
}

impl Instruction {
    /// `arg1` reinterpreted as a 32-bit float, for `LOADFLOAT`.
    pub fn arg1_float(&self) -> f32 {
        f32::from_bits(self.arg1 as u32)
    }
}

/// Compares two instructions for the round-trip equality relation (I6):
/// identical opcode and operands, except `LOADFLOAT`'s `arg1`, which is
/// compared as a float with [`crate::value::FLOAT_EPSILON`] tolerance.
pub fn instructions_eq(a: &Instruction, b: &Instruction, loadfloat_opcode: u8) -> bool {
    if a.op != b.op || a.arg0 != b.arg0 || a.arg2 != b.arg2 || a.arg3 != b.arg3 {
        return false;
    }
    if a.op == loadfloat_opcode {
        (a.arg1_float() - b.arg1_float()).abs() < crate::value::FLOAT_EPSILON
    } else {
        a.arg1 == b.arg1
    }
}

/// Kind of an outer-value (upvalue) source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OuterKind {
    Local,
    Outer,
}

#[derive(Debug, Clone)]
pub struct OuterValueInfo {
    pub kind: OuterKind,
    pub src: Value,
    pub name: Value,
}

/// One record in the local-variable scope table.
#[derive(Debug, Clone)]
pub struct LocalVarInfo {
    pub name: String,
    pub pos: i32,
    pub start_op: i32,
    pub end_op: i32,
    /// Set by the loader's post-load fixup pass for the two-or-three slots
    /// a `FOREACH` instruction claims as hidden iterator state.
    pub foreach_loop_state: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct LineInfo {
    pub line: i32,
    pub op: i32,
}

/// A function, immutable after the loader constructs it.
#[derive(Debug, Clone)]
pub struct Function {
    pub function_index: i32,
    pub source_name: String,
    pub name: String,
    pub literals: Vec<Value>,
    pub parameters: Vec<String>,
    pub outer_values: Vec<OuterValueInfo>,
    pub locals: Vec<LocalVarInfo>,
    pub line_infos: Vec<LineInfo>,
    pub default_params: Vec<i32>,
    pub instructions: Vec<Instruction>,
    pub functions: Vec<Function>,
    pub stack_size: i32,
    pub is_generator: bool,
    pub var_params: i32,
}

impl Function {
    /// Looks up a nested function by dotted path (`"Foo::Bar"`) or numeric index,
    /// mirroring the original's `FindFunction`.
    pub fn find_function(&self, name: &str) -> Option<&Function> {
        if let Ok(index) = name.parse::<usize>() {
            return self.functions.get(index);
        }
        match name.split_once("::") {
            Some((head, rest)) => self
                .functions
                .iter()
                .find(|f| f.name == head)
                .and_then(|f| f.find_function(rest)),
            None => self.functions.iter().find(|f| f.name == name),
        }
    }

    /// Bounds-checked accessor over nested functions.
    pub fn get_function(&self, i: usize) -> Option<&Function> {
        self.functions.get(i)
    }

    /// Local-variable record active at position `pos` whose declared scope
    /// starts at `at_instruction`. `foreach_only` restricts the search to
    /// foreach-state slots, which may be (re-)initialized anywhere within
    /// their scope rather than only at its start.
    pub fn local_starting_at(&self, pos: i32, at_instruction: i32) -> Option<&LocalVarInfo> {
        self.locals
            .iter()
            .find(|l| l.pos == pos && l.start_op == at_instruction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_function() -> Function {
        Function {
            function_index: 0,
            source_name: "test.nut".into(),
            name: "main".into(),
            literals: vec![],
            parameters: vec![],
            outer_values: vec![],
            locals: vec![],
            line_infos: vec![],
            default_params: vec![],
            instructions: vec![],
            functions: vec![Function {
                function_index: 1,
                source_name: "test.nut".into(),
                name: "Helper".into(),
                literals: vec![],
                parameters: vec![],
                outer_values: vec![],
                locals: vec![],
                line_infos: vec![],
                default_params: vec![],
                instructions: vec![],
                functions: vec![],
                stack_size: 2,
                is_generator: false,
                var_params: 0,
            }],
            stack_size: 2,
            is_generator: false,
            var_params: 0,
        }
    }

    #[test]
    fn find_function_by_name() {
        let f = sample_function();
        assert_eq!(f.find_function("Helper").unwrap().function_index, 1);
    }

    #[test]
    fn find_function_by_index() {
        let f = sample_function();
        assert_eq!(f.find_function("0").unwrap().name, "Helper");
    }

    #[test]
    fn find_function_missing_returns_none() {
        let f = sample_function();
        assert!(f.find_function("Nope").is_none());
    }

    #[test]
    fn instruction_eq_uses_float_tolerance_only_for_loadfloat() {
        let a = Instruction {
            op: 3,
            arg0: 0,
            arg1: 1.0_f32.to_bits() as i32,
            arg2: 0,
            arg3: 0,
        };
        let b = Instruction {
            op: 3,
            arg0: 0,
            arg1: (1.0_f32 + 1e-6).to_bits() as i32,
            arg2: 0,
            arg3: 0,
        };
        assert!(instructions_eq(&a, &b, 3));

        let c = Instruction {
            op: 1,
            arg0: 0,
            arg1: 1,
            arg2: 0,
            arg3: 0,
        };
        let d = Instruction {
            op: 1,
            arg0: 0,
            arg1: 2,
            arg2: 0,
            arg3: 0,
        };
        assert!(!instructions_eq(&c, &d, 3));
    }
}

//! Normalized opcode set and the two historical dialect mappings onto it.
//!
//! The loader reads a raw opcode byte per the selected [`OpcodeDialect`] and
//! maps it onto this normalized set; everything above the loader (the VM,
//! the decoder, the reconstructor) only ever sees [`Opcode`].

use crate::config::OpcodeDialect;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(clippy::upper_case_acronyms)]
pub enum Opcode {
    Line,
    Load,
    LoadInt,
    LoadFloat,
    DLoad,
    TailCall,
    Call,
    PrepCall,
    PrepCallK,
    GetK,
    Move,
    NewSlot,
    Delete,
    Set,
    Get,
    Eq,
    Ne,
    Arith,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitW,
    Return,
    LoadNulls,
    LoadRoot,
    LoadBool,
    DMove,
    Jmp,
    Jnz,
    Jcmp,
    Jz,
    LoadFreeVar,
    SetOuter,
    GetOuter,
    NewObj,
    NewTable,
    NewArray,
    NewClass,
    AppendArray,
    GetParent,
    ComparIth,
    ComparIthL,
    Inc,
    IncL,
    PInc,
    PIncL,
    Cmp,
    Exists,
    InstanceOf,
    And,
    Or,
    Neg,
    Not,
    BWNot,
    Closure,
    Yield,
    Resume,
    Foreach,
    PostForeach,
    Delegate,
    Clone,
    TypeOf,
    PushTrap,
    PopTrap,
    Throw,
    NewSlotA,
    GetBase,
    Close,
}

impl Opcode {
    /// Maps a dialect's raw opcode byte onto the normalized set.
    ///
    /// `None` means the byte is not recognized under the selected dialect;
    /// the decoder treats this as the *UnknownOpcode* recovered error (§7).
    pub fn from_raw(raw: u8, dialect: OpcodeDialect) -> Option<Opcode> {
        use Opcode::*;
        // Shared prefix: opcodes with identical numbering in both dialects.
        let shared = match raw {
            0 => Some(Line),
            1 => Some(Load),
            2 => Some(LoadInt),
            3 => Some(LoadFloat),
            4 => Some(DLoad),
            5 => Some(TailCall),
            6 => Some(Call),
            7 => Some(PrepCall),
            8 => Some(PrepCallK),
            9 => Some(GetK),
            10 => Some(Move),
            11 => Some(NewSlot),
            12 => Some(Delete),
            13 => Some(Set),
            14 => Some(Get),
            15 => Some(Eq),
            16 => Some(Ne),
            18 => Some(Return),
            19 => Some(LoadNulls),
            20 => Some(LoadRoot),
            21 => Some(LoadBool),
            22 => Some(DMove),
            23 => Some(Jmp),
            25 => Some(AppendArray),
            26 => Some(GetParent),
            27 => Some(ComparIth),
            28 => Some(ComparIthL),
            29 => Some(Inc),
            30 => Some(IncL),
            31 => Some(PInc),
            32 => Some(PIncL),
            33 => Some(Cmp),
            34 => Some(Exists),
            35 => Some(InstanceOf),
            36 => Some(And),
            37 => Some(Or),
            38 => Some(Neg),
            39 => Some(Not),
            40 => Some(BWNot),
            41 => Some(Closure),
            42 => Some(Yield),
            43 => Some(Resume),
            44 => Some(Foreach),
            45 => Some(PostForeach),
            46 => Some(Delegate),
            47 => Some(Clone),
            48 => Some(TypeOf),
            49 => Some(PushTrap),
            50 => Some(PopTrap),
            51 => Some(Throw),
            52 => Some(NewSlotA),
            53 => Some(GetBase),
            54 => Some(Close),
            _ => None,
        };
        if let Some(op) = shared {
            return Some(op);
        }
        match dialect {
            OpcodeDialect::Unified => match raw {
                17 => Some(Arith),
                24 => Some(Jz),
                55 => Some(LoadFreeVar),
                56 => Some(NewObj),
                _ => None,
            },
            OpcodeDialect::Split => match raw {
                57 => Some(Add),
                58 => Some(Sub),
                59 => Some(Mul),
                60 => Some(Div),
                61 => Some(Mod),
                62 => Some(BitW),
                63 => Some(Jcmp),
                64 => Some(SetOuter),
                65 => Some(GetOuter),
                66 => Some(NewTable),
                67 => Some(NewArray),
                68 => Some(NewClass),
                _ => None,
            },
        }
    }

    pub fn name(self) -> &'static str {
        use Opcode::*;
        match self {
            Line => "LINE",
            Load => "LOAD",
            LoadInt => "LOADINT",
            LoadFloat => "LOADFLOAT",
            DLoad => "DLOAD",
            TailCall => "TAILCALL",
            Call => "CALL",
            PrepCall => "PREPCALL",
            PrepCallK => "PREPCALLK",
            GetK => "GETK",
            Move => "MOVE",
            NewSlot => "NEWSLOT",
            Delete => "DELETE",
            Set => "SET",
            Get => "GET",
            Eq => "EQ",
            Ne => "NE",
            Arith => "ARITH",
            Add => "ADD",
            Sub => "SUB",
            Mul => "MUL",
            Div => "DIV",
            Mod => "MOD",
            BitW => "BITW",
            Return => "RETURN",
            LoadNulls => "LOADNULLS",
            LoadRoot => "LOADROOT",
            LoadBool => "LOADBOOL",
            DMove => "DMOVE",
            Jmp => "JMP",
            Jnz => "JNZ",
            Jcmp => "JCMP",
            Jz => "JZ",
            LoadFreeVar => "LOADFREEVAR",
            SetOuter => "SETOUTER",
            GetOuter => "GETOUTER",
            NewObj => "NEWOBJ",
            NewTable => "NEWTABLE",
            NewArray => "NEWARRAY",
            NewClass => "NEWCLASS",
            AppendArray => "APPENDARRAY",
            GetParent => "GETPARENT",
            ComparIth => "COMPARITH",
            ComparIthL => "COMPARITHL",
            Inc => "INC",
            IncL => "INCL",
            PInc => "PINC",
            PIncL => "PINCL",
            Cmp => "CMP",
            Exists => "EXISTS",
            InstanceOf => "INSTANCEOF",
            And => "AND",
            Or => "OR",
            Neg => "NEG",
            Not => "NOT",
            BWNot => "BWNOT",
            Closure => "CLOSURE",
            Yield => "YIELD",
            Resume => "RESUME",
            Foreach => "FOREACH",
            PostForeach => "POSTFOREACH",
            Delegate => "DELEGATE",
            Clone => "CLONE",
            TypeOf => "TYPEOF",
            PushTrap => "PUSHTRAP",
            PopTrap => "POPTRAP",
            Throw => "THROW",
            NewSlotA => "NEWSLOTA",
            GetBase => "GETBASE",
            Close => "CLOSE",
        }
    }
}

/// Selector for the fixed comparison table used by `CMP` (indexed by `arg3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn from_selector(sel: i32) -> Option<CmpOp> {
        match sel {
            0 => Some(CmpOp::Lt),
            1 => Some(CmpOp::Le),
            2 => Some(CmpOp::Gt),
            3 => Some(CmpOp::Ge),
            _ => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

/// Selector for `BITW`'s operator (indexed by `arg3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitwiseOp {
    And,
    Or,
    Xor,
    ShiftL,
    ShiftR,
    UShiftR,
}

impl BitwiseOp {
    pub fn from_selector(sel: i32) -> Option<BitwiseOp> {
        match sel {
            0 => Some(BitwiseOp::And),
            1 => Some(BitwiseOp::Or),
            2 => Some(BitwiseOp::Xor),
            3 => Some(BitwiseOp::ShiftL),
            4 => Some(BitwiseOp::ShiftR),
            5 => Some(BitwiseOp::UShiftR),
            _ => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BitwiseOp::And => "&",
            BitwiseOp::Or => "|",
            BitwiseOp::Xor => "^",
            BitwiseOp::ShiftL => "<<",
            BitwiseOp::ShiftR => ">>",
            BitwiseOp::UShiftR => ">>>",
        }
    }
}

/// Selector for `ARITH`'s operator (indexed by `arg3`), used only under
/// [`OpcodeDialect::Unified`] (the split dialect uses dedicated opcodes instead).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl ArithOp {
    pub fn from_selector(sel: i32) -> Option<ArithOp> {
        match sel {
            b'+' as i32 => Some(ArithOp::Add),
            b'-' as i32 => Some(ArithOp::Sub),
            b'*' as i32 => Some(ArithOp::Mul),
            b'/' as i32 => Some(ArithOp::Div),
            b'%' as i32 => Some(ArithOp::Mod),
            _ => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
        }
    }
}

/// Sub-mode selector for `APPENDARRAY`'s source operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendArrayType {
    Stack,
    Literal,
    Int,
    Bool,
    Float,
    Default,
}

impl AppendArrayType {
    pub fn from_selector(sel: i32) -> AppendArrayType {
        match sel {
            0 => AppendArrayType::Stack,
            1 => AppendArrayType::Literal,
            2 => AppendArrayType::Int,
            3 => AppendArrayType::Bool,
            4 => AppendArrayType::Float,
            _ => AppendArrayType::Default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_opcodes_resolve_under_both_dialects() {
        assert_eq!(
            Opcode::from_raw(6, OpcodeDialect::Unified),
            Some(Opcode::Call)
        );
        assert_eq!(
            Opcode::from_raw(6, OpcodeDialect::Split),
            Some(Opcode::Call)
        );
    }

    #[test]
    fn dialect_specific_opcodes_do_not_leak_across_dialects() {
        assert_eq!(Opcode::from_raw(17, OpcodeDialect::Unified), Some(Opcode::Arith));
        assert_eq!(Opcode::from_raw(17, OpcodeDialect::Split), None);
        assert_eq!(Opcode::from_raw(57, OpcodeDialect::Split), Some(Opcode::Add));
        assert_eq!(Opcode::from_raw(57, OpcodeDialect::Unified), None);
    }

    #[test]
    fn unknown_raw_byte_is_none() {
        assert_eq!(Opcode::from_raw(200, OpcodeDialect::Unified), None);
    }

    #[test]
    fn cmp_selector_table_matches_symbols() {
        assert_eq!(CmpOp::from_selector(0).unwrap().symbol(), "<");
        assert_eq!(CmpOp::from_selector(3).unwrap().symbol(), ">=");
        assert!(CmpOp::from_selector(9).is_none());
    }
}

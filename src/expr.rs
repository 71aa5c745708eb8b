//! Expression AST.
//!
//! Lowers the original's deep `Expression` subclass hierarchy into a single
//! tagged enum (§9 design note: "tagged sum types... dispatched by kind, no
//! v-table"). Nodes are shared via `Rc` so that a slot, a merged ternary, and
//! an enclosing call argument list can all alias the same node; the handful
//! of node kinds that need late mutation after construction (table/array/class
//! builders still being appended to, a function-literal's name once it's
//! recognized as a named definition) use `RefCell` internally.

use std::cell::RefCell;
use std::rc::Rc;

use crate::value::Value;

pub type ExprRef = Rc<Expr>;

/// Operator priority table (§3): higher binds tighter; odd priority means
/// right-to-left associativity.
pub mod priority {
    pub const POSTFIX_OR_INDEX: i32 = 300;
    pub const PREFIX: i32 = 200;
    pub const MUL_DIV_MOD: i32 = 100;
    pub const ADD_SUB: i32 = 98;
    pub const SHIFT: i32 = 96;
    pub const RELATIONAL: i32 = 94;
    pub const EQUALITY: i32 = 92;
    pub const BIT_AND: i32 = 90;
    pub const BIT_XOR: i32 = 88;
    pub const BIT_OR: i32 = 86;
    pub const LOGICAL_AND: i32 = 85;
    pub const LOGICAL_OR: i32 = 83;
    pub const TERNARY_OR_DELEGATE: i32 = 60;
    pub const ASSIGNMENT: i32 = 51;
    pub const UNKNOWN: i32 = -100;
}

/// Looks up the priority of a binary operator's source text, per §3's table.
pub fn binary_operator_priority(op: &str) -> i32 {
    use priority::*;
    match op {
        "*" | "/" | "%" => MUL_DIV_MOD,
        "+" | "-" => ADD_SUB,
        "<<" | ">>" | ">>>" => SHIFT,
        "<" | "<=" | ">" | ">=" => RELATIONAL,
        "==" | "!=" => EQUALITY,
        "&" => BIT_AND,
        "^" => BIT_XOR,
        "|" => BIT_OR,
        "&&" | "in" => LOGICAL_AND,
        "||" => LOGICAL_OR,
        "=" | "+=" | "-=" | "*=" | "/=" | "%=" | "<-" => ASSIGNMENT,
        _ => UNKNOWN,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassMemberKind {
    Field,
    Method,
    NestedClass,
}

#[derive(Debug, Clone)]
pub struct ClassMember {
    pub key: ExprRef,
    pub value: ExprRef,
    pub attributes: Option<ExprRef>,
    pub is_static: bool,
    pub kind: ClassMemberKind,
}

/// The expression AST. See module docs for the shared-ownership rationale.
#[derive(Debug)]
pub enum Expr {
    Null,
    /// `getroottable()`'s syntactic form; indexed via `::name`.
    RootTable,
    /// The bound `this` reference; elided in dotted-index form when redundant.
    This,
    /// A pre-rendered, source-escaped literal. `raw` backs the label query
    /// (§3: "queryable as a label — a valid identifier") and round-trip
    /// comparisons; `text` is what the emitter writes verbatim.
    Constant { raw: Value, text: String },
    /// An intermediate alias: a slot's expression downgraded to a plain name
    /// once its value has been read past its originating local (§4.1 set-slot).
    Variable(String),
    /// A named local, distinct from `Variable` so the emitter can still tell
    /// "this is the function's declared local `i`" from "this is some
    /// renamed/aliased reference to it".
    LocalVariable { name: String, slot: i32 },
    /// Prefix unary operator (priority 200): `-x`, `!x`, `~x`, `typeof x`, …
    UnaryPrefix { op: String, expr: ExprRef },
    /// Postfix unary operator (priority 300): `x++`, `x--`.
    UnaryPostfix { op: String, expr: ExprRef },
    Binary {
        op: String,
        left: ExprRef,
        right: ExprRef,
    },
    /// `cond ? then : else_` (priority 60).
    Ternary {
        cond: ExprRef,
        then: ExprRef,
        else_: ExprRef,
    },
    /// `obj : parent` prototype-link (priority 60).
    Delegate { obj: ExprRef, parent: ExprRef },
    /// `receiver[index]`, rendered dotted (`receiver.index`) when the index
    /// is a label constant and the receiver qualifies (see [`Expr::dotted_label`]).
    Index { receiver: ExprRef, index: ExprRef },
    Call { callee: ExprRef, args: Vec<ExprRef> },
    /// A nested function, recursed into lazily by the emitter. `name` is
    /// mutated once when the enclosing `NEWSLOT`/assignment recognizes this
    /// as a named function definition rather than an anonymous closure value.
    FunctionLiteral {
        function_index: usize,
        name: RefCell<Option<String>>,
    },
    NewTable {
        elements: RefCell<Vec<(ExprRef, ExprRef)>>,
    },
    NewArray {
        elements: RefCell<Vec<ExprRef>>,
    },
    NewClass {
        base: Option<ExprRef>,
        attributes: Option<ExprRef>,
        name: RefCell<Option<String>>,
        members: RefCell<Vec<ClassMember>>,
    },
}

impl Expr {
    pub fn null() -> ExprRef {
        Rc::new(Expr::Null)
    }

    pub fn root_table() -> ExprRef {
        Rc::new(Expr::RootTable)
    }

    pub fn this() -> ExprRef {
        Rc::new(Expr::This)
    }

    pub fn constant(raw: Value) -> ExprRef {
        let text = render_literal(&raw);
        Rc::new(Expr::Constant { raw, text })
    }

    pub fn variable(name: impl Into<String>) -> ExprRef {
        Rc::new(Expr::Variable(name.into()))
    }

    pub fn local_variable(name: impl Into<String>, slot: i32) -> ExprRef {
        Rc::new(Expr::LocalVariable {
            name: name.into(),
            slot,
        })
    }

    pub fn unary_prefix(op: impl Into<String>, expr: ExprRef) -> ExprRef {
        Rc::new(Expr::UnaryPrefix {
            op: op.into(),
            expr,
        })
    }

    pub fn unary_postfix(op: impl Into<String>, expr: ExprRef) -> ExprRef {
        Rc::new(Expr::UnaryPostfix {
            op: op.into(),
            expr,
        })
    }

    pub fn binary(op: impl Into<String>, left: ExprRef, right: ExprRef) -> ExprRef {
        Rc::new(Expr::Binary {
            op: op.into(),
            left,
            right,
        })
    }

    pub fn ternary(cond: ExprRef, then: ExprRef, else_: ExprRef) -> ExprRef {
        Rc::new(Expr::Ternary { cond, then, else_ })
    }

    pub fn delegate(obj: ExprRef, parent: ExprRef) -> ExprRef {
        Rc::new(Expr::Delegate { obj, parent })
    }

    pub fn index(receiver: ExprRef, index: ExprRef) -> ExprRef {
        Rc::new(Expr::Index { receiver, index })
    }

    pub fn call(callee: ExprRef, args: Vec<ExprRef>) -> ExprRef {
        Rc::new(Expr::Call { callee, args })
    }

    pub fn function_literal(function_index: usize) -> ExprRef {
        Rc::new(Expr::FunctionLiteral {
            function_index,
            name: RefCell::new(None),
        })
    }

    pub fn new_table() -> ExprRef {
        Rc::new(Expr::NewTable {
            elements: RefCell::new(Vec::new()),
        })
    }

    pub fn new_array() -> ExprRef {
        Rc::new(Expr::NewArray {
            elements: RefCell::new(Vec::new()),
        })
    }

    pub fn new_class(base: Option<ExprRef>, attributes: Option<ExprRef>) -> ExprRef {
        Rc::new(Expr::NewClass {
            base,
            attributes,
            name: RefCell::new(None),
            members: RefCell::new(Vec::new()),
        })
    }

    /// Appends a key/value pair to a table still under construction. Panics
    /// if called on anything but a `NewTable` — reconstruction code only
    /// calls this while holding the VM slot that produced the table literal.
    pub fn append_table_entry(self: &ExprRef, key: ExprRef, value: ExprRef) {
        match self.as_ref() {
            Expr::NewTable { elements } => elements.borrow_mut().push((key, value)),
            _ => unreachable!("append_table_entry on non-table expression"),
        }
    }

    pub fn append_array_entry(self: &ExprRef, value: ExprRef) {
        match self.as_ref() {
            Expr::NewArray { elements } => elements.borrow_mut().push(value),
            _ => unreachable!("append_array_entry on non-array expression"),
        }
    }

    pub fn append_class_member(self: &ExprRef, member: ClassMember) {
        match self.as_ref() {
            Expr::NewClass { members, .. } => members.borrow_mut().push(member),
            _ => unreachable!("append_class_member on non-class expression"),
        }
    }

    pub fn set_function_name(self: &ExprRef, name: impl Into<String>) {
        match self.as_ref() {
            Expr::FunctionLiteral { name: cell, .. } => *cell.borrow_mut() = Some(name.into()),
            _ => unreachable!("set_function_name on non-function expression"),
        }
    }

    pub fn set_class_name(self: &ExprRef, name: impl Into<String>) {
        match self.as_ref() {
            Expr::NewClass { name: cell, .. } => *cell.borrow_mut() = Some(name.into()),
            _ => unreachable!("set_class_name on non-class expression"),
        }
    }

    /// Priority used for parenthesization (I3).
    pub fn emit_priority(&self) -> i32 {
        use priority::*;
        match self {
            Expr::Index { .. } | Expr::Call { .. } | Expr::UnaryPostfix { .. } => {
                POSTFIX_OR_INDEX
            }
            Expr::UnaryPrefix { .. } => PREFIX,
            Expr::Binary { op, .. } => binary_operator_priority(op),
            Expr::Ternary { .. } | Expr::Delegate { .. } => TERNARY_OR_DELEGATE,
            _ => i32::MAX, // atoms never need parenthesizing
        }
    }

    /// True if the priority number is odd (right-to-left associativity), per §3.
    pub fn is_right_associative(&self) -> bool {
        self.emit_priority() % 2 != 0 && self.emit_priority() != i32::MAX
    }

    /// If this expression is a constant whose raw value is a string that is
    /// also a valid identifier, returns that identifier text (without quotes).
    /// Backs the dotted-form decision (§3, §4.5).
    pub fn as_label(&self) -> Option<&str> {
        match self {
            Expr::Constant {
                raw: Value::String(s),
                ..
            } if is_valid_identifier(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Whether this expression is an acceptable dotted-index receiver:
    /// root-table, `this`, a plain variable/local, or another dotted index.
    pub fn is_dottable_receiver(&self) -> bool {
        matches!(
            self,
            Expr::RootTable | Expr::This | Expr::Variable(_) | Expr::LocalVariable { .. }
        ) || matches!(self, Expr::Index { index, .. } if index.as_label().is_some())
    }
}

/// Valid Squirrel-style identifier: starts with alpha/underscore, continues
/// with alnum/underscore, non-empty.
pub fn is_valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn render_literal(v: &Value) -> String {
    match v {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        // Float constants always print with a decimal point (§4.5).
        Value::Float(f) => {
            if f.fract() == 0.0 && f.is_finite() {
                format!("{f:.1}")
            } else {
                f.to_string()
            }
        }
        Value::String(s) => format!("\"{}\"", escape_string_literal(s)),
    }
}

/// Escapes a string for use as a source-code string literal: the full set
/// `\r \n \t \v \a \\ \" \'` plus `\xNNNN` for any other non-printable
/// character. Distinct from [`crate::value::Value`]'s debug-print escaping,
/// which does not escape quote characters.
pub fn escape_string_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\x0B' => out.push_str("\\v"),
            '\x07' => out.push_str("\\a"),
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\'' => out.push_str("\\'"),
            c if c.is_control() => {
                out.push_str(&format!("\\x{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_literal_always_prints_a_decimal_point() {
        assert_eq!(render_literal(&Value::Float(12.0)), "12.0");
        assert_eq!(render_literal(&Value::Float(12.5)), "12.5");
    }

    #[test]
    fn string_escaping_covers_the_documented_set() {
        let escaped = escape_string_literal("a\r\n\t\x0B\x07\\\"'b");
        assert_eq!(escaped, "a\\r\\n\\t\\v\\a\\\\\\\"\\'b");
    }

    #[test]
    fn non_printable_escapes_as_hex() {
        let escaped = escape_string_literal("\x01");
        assert_eq!(escaped, "\\x0001");
    }

    #[test]
    fn label_query_requires_valid_identifier_string_constant() {
        let e = Expr::constant(Value::String("foo_bar".into()));
        assert_eq!(e.as_label(), Some("foo_bar"));

        let not_ident = Expr::constant(Value::String("0bad".into()));
        assert_eq!(not_ident.as_label(), None);

        let not_string = Expr::constant(Value::Int(3));
        assert_eq!(not_string.as_label(), None);
    }

    #[test]
    fn binary_priority_table_matches_spec() {
        assert_eq!(binary_operator_priority("*"), 100);
        assert_eq!(binary_operator_priority("+"), 98);
        assert_eq!(binary_operator_priority("=="), 92);
        assert_eq!(binary_operator_priority("&&"), 85);
        assert_eq!(binary_operator_priority("||"), 83);
        assert_eq!(binary_operator_priority("="), 51);
        assert_eq!(binary_operator_priority("nonsense"), -100);
    }

    #[test]
    fn right_associativity_is_odd_priority() {
        let assign = Expr::binary("=", Expr::variable("a"), Expr::variable("b"));
        assert!(assign.is_right_associative());
        let add = Expr::binary("+", Expr::variable("a"), Expr::variable("b"));
        assert!(!add.is_right_associative());
    }

    #[test]
    fn table_builder_append_is_visible_through_aliased_handle() {
        let table = Expr::new_table();
        let alias = Rc::clone(&table);
        table.append_table_entry(Expr::constant(Value::String("k".into())), Expr::constant(Value::Int(1)));
        match alias.as_ref() {
            Expr::NewTable { elements } => assert_eq!(elements.borrow().len(), 1),
            _ => panic!("expected table"),
        }
    }
}

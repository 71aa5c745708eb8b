//! Source emitter (§4.5): walks the statement/expression trees and writes
//! indented, reparsable source text.
//!
//! The emitter never mutates the tree; it only reads the priority/label
//! queries `expr.rs` exposes and the line-separation query `stmt.rs`
//! exposes, and writes to anything implementing `std::fmt::Write` (§5: "the
//! emitter writes to an abstract sink that may buffer").

use std::fmt::{self, Write};

use crate::expr::{ClassMemberKind, Expr, ExprRef};
use crate::function::Function;
use crate::stmt::{CaseArm, Stmt, StmtRef};

/// Emits a function's reconstructed body as a standalone `function name(...) { ... }`.
pub fn emit_function(function: &Function, body: &StmtRef) -> Result<String, fmt::Error> {
    let mut out = String::new();
    let mut w = Emitter { out: &mut out, indent: 0 };
    w.write_indent()?;
    write!(w.out, "function {}(", function.name)?;
    for (i, param) in function.parameters.iter().enumerate() {
        if i > 0 {
            write!(w.out, ", ")?;
        }
        write!(w.out, "{param}")?;
    }
    writeln!(w.out, ")")?;
    w.emit_block(body)?;
    Ok(out)
}

struct Emitter<'a> {
    out: &'a mut String,
    indent: usize,
}

impl<'a> Emitter<'a> {
    fn write_indent(&mut self) -> fmt::Result {
        for _ in 0..self.indent {
            self.out.push('\t');
        }
        Ok(())
    }

    /// Emits `{ ... }` at the current indent, with contents indented one level.
    fn emit_block(&mut self, block: &StmtRef) -> fmt::Result {
        self.write_indent()?;
        writeln!(self.out, "{{")?;
        self.indent += 1;
        let stmts = block.block_statements().unwrap_or_default();
        self.emit_statement_list(&stmts)?;
        self.indent -= 1;
        self.write_indent()?;
        writeln!(self.out, "}}")
    }

    fn emit_statement_list(&mut self, stmts: &[StmtRef]) -> fmt::Result {
        let mut prev_line_separated = false;
        for (i, stmt) in stmts.iter().enumerate() {
            if stmt.is_empty() {
                continue;
            }
            let line_separated = stmt.is_line_separated();
            if i > 0 && (line_separated || prev_line_separated) {
                writeln!(self.out)?;
            }
            self.emit_statement(stmt)?;
            prev_line_separated = line_separated;
        }
        Ok(())
    }

    fn emit_statement(&mut self, stmt: &StmtRef) -> fmt::Result {
        match stmt.as_ref() {
            Stmt::Empty => Ok(()),
            Stmt::Expression(cell) => {
                if let Some(e) = cell.borrow().as_ref() {
                    self.write_indent()?;
                    self.emit_expr(e, -1)?;
                    writeln!(self.out, ";")?;
                }
                Ok(())
            }
            Stmt::Block(_) => self.emit_block(stmt),
            Stmt::LocalVarInit { name, init, .. } => {
                self.write_indent()?;
                write!(self.out, "local {name}")?;
                if let Some(init) = init {
                    write!(self.out, " = ")?;
                    self.emit_expr(init, -1)?;
                }
                writeln!(self.out, ";")
            }
            Stmt::Return(value) => {
                self.write_indent()?;
                write!(self.out, "return")?;
                if let Some(v) = value {
                    write!(self.out, " ")?;
                    self.emit_expr(v, -1)?;
                }
                writeln!(self.out, ";")
            }
            Stmt::Throw(value) => {
                self.write_indent()?;
                write!(self.out, "throw ")?;
                self.emit_expr(value, -1)?;
                writeln!(self.out, ";")
            }
            Stmt::Yield(value) => {
                self.write_indent()?;
                write!(self.out, "yield")?;
                if let Some(v) = value {
                    write!(self.out, " ")?;
                    self.emit_expr(v, -1)?;
                }
                writeln!(self.out, ";")
            }
            Stmt::Break => {
                self.write_indent()?;
                writeln!(self.out, "break;")
            }
            Stmt::Continue => {
                self.write_indent()?;
                writeln!(self.out, "continue;")
            }
            Stmt::Comment(text) => {
                self.write_indent()?;
                writeln!(self.out, "// {text}")
            }
            Stmt::If { cond, then_branch, else_branch } => self.emit_if(cond, then_branch, else_branch.as_ref()),
            Stmt::TryCatch { try_block, catch_var, catch_block } => {
                self.write_indent()?;
                writeln!(self.out, "try")?;
                self.emit_block(try_block)?;
                self.write_indent()?;
                writeln!(self.out, "catch ({catch_var})")?;
                self.emit_block(catch_block)
            }
            Stmt::For { init, cond, step, body } => self.emit_for(init.as_ref(), cond.as_ref(), step.as_ref(), body),
            Stmt::While { cond, body, .. } => {
                self.write_indent()?;
                write!(self.out, "while (")?;
                self.emit_expr(cond, -1)?;
                writeln!(self.out, ")")?;
                self.emit_block(body)
            }
            Stmt::DoWhile { cond, body, .. } => {
                self.write_indent()?;
                writeln!(self.out, "do")?;
                self.emit_block(body)?;
                self.write_indent()?;
                write!(self.out, "while (")?;
                self.emit_expr(cond, -1)?;
                writeln!(self.out, ");")
            }
            Stmt::Foreach { key, value, container, body, .. } => {
                self.write_indent()?;
                write!(self.out, "foreach (")?;
                if let Some(k) = key {
                    write!(self.out, "{k}, ")?;
                }
                write!(self.out, "{value} in ")?;
                self.emit_expr(container, -1)?;
                writeln!(self.out, ")")?;
                self.emit_block(body)
            }
            Stmt::Switch { subject, cases, default } => self.emit_switch(subject, &cases.borrow(), default.as_ref()),
        }
    }

    fn emit_if(&mut self, cond: &ExprRef, then_branch: &StmtRef, else_branch: Option<&StmtRef>) -> fmt::Result {
        self.write_indent()?;
        write!(self.out, "if (")?;
        self.emit_expr(cond, -1)?;
        writeln!(self.out, ")")?;
        self.emit_block(then_branch)?;
        if let Some(else_branch) = else_branch {
            self.write_indent()?;
            // A chained `else if` stays on one line, matching how this shape
            // appears everywhere else the corpus prints nested conditionals.
            if let Some(stmts) = else_branch.block_statements() {
                if stmts.len() == 1 {
                    if let Stmt::If { cond, then_branch, else_branch } = stmts[0].as_ref() {
                        write!(self.out, "else ")?;
                        self.indent_zero_write_if(cond, then_branch, else_branch.as_ref())?;
                        return Ok(());
                    }
                }
            }
            writeln!(self.out, "else")?;
            self.emit_block(else_branch)?;
        }
        Ok(())
    }

    /// Emits an `if` header/body without re-indenting the header line, used
    /// only from the `else if` chaining case above (the `else ` prefix is
    /// already on the line).
    fn indent_zero_write_if(&mut self, cond: &ExprRef, then_branch: &StmtRef, else_branch: Option<&StmtRef>) -> fmt::Result {
        write!(self.out, "if (")?;
        self.emit_expr(cond, -1)?;
        writeln!(self.out, ")")?;
        self.emit_block(then_branch)?;
        if let Some(else_branch) = else_branch {
            self.write_indent()?;
            if let Some(stmts) = else_branch.block_statements() {
                if stmts.len() == 1 {
                    if let Stmt::If { cond, then_branch, else_branch } = stmts[0].as_ref() {
                        write!(self.out, "else ")?;
                        return self.indent_zero_write_if(cond, then_branch, else_branch.as_ref());
                    }
                }
            }
            writeln!(self.out, "else")?;
            self.emit_block(else_branch)?;
        }
        Ok(())
    }

    fn emit_for(&mut self, init: Option<&StmtRef>, cond: Option<&ExprRef>, step: Option<&StmtRef>, body: &StmtRef) -> fmt::Result {
        self.write_indent()?;
        write!(self.out, "for (")?;
        if let Some(init) = init {
            self.emit_for_clause(init)?;
        }
        write!(self.out, "; ")?;
        if let Some(cond) = cond {
            self.emit_expr(cond, -1)?;
        }
        write!(self.out, "; ")?;
        if let Some(step) = step {
            self.emit_for_clause(step)?;
        }
        writeln!(self.out, ")")?;
        self.emit_block(body)
    }

    /// Emits an `init`/`step` clause of a `for` header inline, without the
    /// trailing `;` and newline a standalone statement would get.
    fn emit_for_clause(&mut self, stmt: &StmtRef) -> fmt::Result {
        match stmt.as_ref() {
            Stmt::LocalVarInit { name, init, .. } => {
                write!(self.out, "local {name}")?;
                if let Some(init) = init {
                    write!(self.out, " = ")?;
                    self.emit_expr(init, -1)?;
                }
                Ok(())
            }
            Stmt::Expression(cell) => {
                if let Some(e) = cell.borrow().as_ref() {
                    self.emit_expr(e, -1)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn emit_switch(&mut self, subject: &ExprRef, cases: &[CaseArm], default: Option<&StmtRef>) -> fmt::Result {
        self.write_indent()?;
        write!(self.out, "switch (")?;
        self.emit_expr(subject, -1)?;
        writeln!(self.out, ")")?;
        self.write_indent()?;
        writeln!(self.out, "{{")?;
        // case/default labels sit one indent level below the block they open.
        for arm in cases {
            self.write_indent()?;
            match &arm.value {
                Some(v) => {
                    write!(self.out, "case ")?;
                    self.emit_expr(v, -1)?;
                    writeln!(self.out, ":")?;
                }
                None => writeln!(self.out, "/* fallthrough */")?,
            }
            self.indent += 1;
            let stmts = arm.body.block_statements().unwrap_or_default();
            self.emit_statement_list(&stmts)?;
            self.indent -= 1;
        }
        if let Some(default) = default {
            self.write_indent()?;
            writeln!(self.out, "default:")?;
            self.indent += 1;
            let stmts = default.block_statements().unwrap_or_default();
            self.emit_statement_list(&stmts)?;
            self.indent -= 1;
        }
        self.write_indent()?;
        writeln!(self.out, "}}")
    }

    /// Emits an expression, parenthesizing it if `parent_priority` demands it
    /// (I3). `parent_priority < 0` means "no enclosing operator" (top level).
    fn emit_expr(&mut self, expr: &ExprRef, parent_priority: i32) -> fmt::Result {
        match expr.as_ref() {
            Expr::Null => write!(self.out, "null"),
            Expr::RootTable => write!(self.out, "::"),
            Expr::This => write!(self.out, "this"),
            Expr::Constant { text, .. } => write!(self.out, "{text}"),
            Expr::Variable(name) => write!(self.out, "{name}"),
            Expr::LocalVariable { name, .. } => write!(self.out, "{name}"),
            Expr::UnaryPrefix { op, expr: inner } => {
                let needs_space = op.chars().next().is_some_and(|c| c.is_ascii_alphabetic());
                write!(self.out, "{op}")?;
                if needs_space {
                    write!(self.out, " ")?;
                }
                self.emit_child(inner, expr.emit_priority(), false)
            }
            Expr::UnaryPostfix { op, expr: inner } => {
                self.emit_child(inner, expr.emit_priority(), false)?;
                write!(self.out, "{op}")
            }
            Expr::Binary { op, left, right } => self.emit_binary(expr, op, left, right, parent_priority),
            Expr::Ternary { cond, then, else_ } => {
                let paren = self.needs_parens(expr.emit_priority(), parent_priority, false);
                if paren {
                    write!(self.out, "(")?;
                }
                self.emit_child(cond, expr.emit_priority(), true)?;
                write!(self.out, " ? ")?;
                self.emit_child(then, expr.emit_priority(), true)?;
                write!(self.out, " : ")?;
                self.emit_child(else_, expr.emit_priority(), false)?;
                if paren {
                    write!(self.out, ")")?;
                }
                Ok(())
            }
            Expr::Delegate { obj, parent } => {
                let paren = self.needs_parens(expr.emit_priority(), parent_priority, false);
                if paren {
                    write!(self.out, "(")?;
                }
                self.emit_child(obj, expr.emit_priority(), true)?;
                write!(self.out, " : ")?;
                self.emit_child(parent, expr.emit_priority(), false)?;
                if paren {
                    write!(self.out, ")")?;
                }
                Ok(())
            }
            Expr::Index { receiver, index } => self.emit_index(expr, receiver, index),
            Expr::Call { callee, args } => {
                self.emit_child(callee, expr.emit_priority(), true)?;
                write!(self.out, "(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(self.out, ", ")?;
                    }
                    self.emit_expr(a, -1)?;
                }
                write!(self.out, ")")
            }
            Expr::FunctionLiteral { function_index, name } => {
                match name.borrow().as_ref() {
                    Some(n) => write!(self.out, "function {n}(...) /* #{function_index} */"),
                    None => write!(self.out, "function(...) /* #{function_index} */"),
                }
            }
            Expr::NewTable { elements } => {
                let elements = elements.borrow();
                write!(self.out, "{{")?;
                for (i, (k, v)) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(self.out, ", ")?;
                    }
                    match k.as_label() {
                        Some(label) => write!(self.out, "{label} = ")?,
                        None => {
                            write!(self.out, "[")?;
                            self.emit_expr(k, -1)?;
                            write!(self.out, "] = ")?;
                        }
                    }
                    self.emit_expr(v, -1)?;
                }
                write!(self.out, "}}")
            }
            Expr::NewArray { elements } => {
                let elements = elements.borrow();
                write!(self.out, "[")?;
                for (i, v) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(self.out, ", ")?;
                    }
                    self.emit_expr(v, -1)?;
                }
                write!(self.out, "]")
            }
            Expr::NewClass { base, attributes, name, members } => {
                self.emit_class(base.as_ref(), attributes.as_ref(), name.borrow().as_deref(), &members.borrow())
            }
        }
    }

    /// Emits `child` as the operand of an operator whose own priority is
    /// `own_priority`. `is_left` distinguishes the left/right operand of a
    /// right-associative parent (I3: "symmetrically for R").
    fn emit_child(&mut self, child: &ExprRef, own_priority: i32, is_left: bool) -> fmt::Result {
        let child_priority = child.emit_priority();
        let right_associative = own_priority % 2 != 0 && own_priority != i32::MAX;
        let paren = if right_associative && is_left {
            child_priority <= own_priority
        } else {
            child_priority < own_priority
        };
        if paren {
            write!(self.out, "(")?;
            self.emit_expr(child, -1)?;
            write!(self.out, ")")
        } else {
            self.emit_expr(child, own_priority)
        }
    }

    fn needs_parens(&self, own_priority: i32, parent_priority: i32, is_left: bool) -> bool {
        if parent_priority < 0 {
            return false;
        }
        let parent_right_associative = parent_priority % 2 != 0 && parent_priority != i32::MAX;
        if parent_right_associative && is_left {
            own_priority <= parent_priority
        } else {
            own_priority < parent_priority
        }
    }

    fn emit_binary(&mut self, expr: &ExprRef, op: &str, left: &ExprRef, right: &ExprRef, parent_priority: i32) -> fmt::Result {
        let own_priority = expr.emit_priority();
        let paren = self.needs_parens(own_priority, parent_priority, false);
        if paren {
            write!(self.out, "(")?;
        }
        self.emit_child(left, own_priority, true)?;
        write!(self.out, " {op} ")?;
        self.emit_child(right, own_priority, false)?;
        if paren {
            write!(self.out, ")")?;
        }
        Ok(())
    }

    fn emit_index(&mut self, expr: &ExprRef, receiver: &ExprRef, index: &ExprRef) -> fmt::Result {
        if let (Some(label), true) = (index.as_label(), receiver.is_dottable_receiver()) {
            if matches!(receiver.as_ref(), Expr::RootTable) {
                write!(self.out, "::{label}")
            } else if matches!(receiver.as_ref(), Expr::This) {
                write!(self.out, "{label}")
            } else {
                self.emit_child(receiver, expr.emit_priority(), true)?;
                write!(self.out, ".{label}")
            }
        } else {
            self.emit_child(receiver, expr.emit_priority(), true)?;
            write!(self.out, "[")?;
            self.emit_expr(index, -1)?;
            write!(self.out, "]")
        }
    }

    fn emit_class(
        &mut self,
        base: Option<&ExprRef>,
        attributes: Option<&ExprRef>,
        name: Option<&str>,
        members: &[crate::expr::ClassMember],
    ) -> fmt::Result {
        write!(self.out, "class")?;
        if let Some(n) = name {
            write!(self.out, " {n}")?;
        }
        if let Some(base) = base {
            write!(self.out, " extends ")?;
            self.emit_expr(base, -1)?;
        }
        if let Some(attrs) = attributes {
            write!(self.out, " </")?;
            self.emit_expr(attrs, -1)?;
            write!(self.out, "/>")?;
        }
        writeln!(self.out)?;
        self.write_indent()?;
        writeln!(self.out, "{{")?;
        self.indent += 1;
        for member in members {
            self.write_indent()?;
            if member.is_static {
                write!(self.out, "static ")?;
            }
            let label = member.key.as_label();
            match (label, member.kind, member.value.as_ref()) {
                (Some(name), ClassMemberKind::Method, Expr::FunctionLiteral { function_index, .. }) => {
                    write!(self.out, "function {name}(...) /* #{function_index} */")?;
                }
                (Some(name), ClassMemberKind::NestedClass, Expr::NewClass { base, attributes, members: nested, .. }) => {
                    self.emit_class(base.as_ref(), attributes.as_ref(), Some(name), &nested.borrow())?;
                    continue;
                }
                (Some(name), _, _) => {
                    write!(self.out, "{name} = ")?;
                    self.emit_expr(&member.value, -1)?;
                    writeln!(self.out, ";")?;
                    continue;
                }
                (None, _, _) => {
                    write!(self.out, "[")?;
                    self.emit_expr(&member.key, -1)?;
                    write!(self.out, "] = ")?;
                    self.emit_expr(&member.value, -1)?;
                    writeln!(self.out, ";")?;
                    continue;
                }
            }
            writeln!(self.out)?;
        }
        self.indent -= 1;
        self.write_indent()?;
        writeln!(self.out, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use std::cell::RefCell;

    fn root_with(stmts: Vec<StmtRef>) -> StmtRef {
        Stmt::block(stmts)
    }

    #[test]
    fn simple_function_emits_header_and_block() {
        let f = Function {
            function_index: 0,
            source_name: "test.nut".into(),
            name: "foo".into(),
            literals: vec![],
            parameters: vec!["a".into(), "b".into()],
            outer_values: vec![],
            locals: vec![],
            line_infos: vec![],
            default_params: vec![],
            instructions: vec![],
            functions: vec![],
            stack_size: 2,
            is_generator: false,
            var_params: 0,
        };
        let body = root_with(vec![stmt_return(Expr::variable("a"))]);
        let out = emit_function(&f, &body).unwrap();
        assert!(out.starts_with("function foo(a, b)\n"));
        assert!(out.contains("\treturn a;\n"));
    }

    fn stmt_return(e: ExprRef) -> StmtRef {
        std::rc::Rc::new(Stmt::Return(Some(e)))
    }

    #[test]
    fn addition_inside_multiplication_is_parenthesized() {
        let inner = Expr::binary("+", Expr::variable("a"), Expr::variable("b"));
        let outer = Expr::binary("*", inner, Expr::variable("c"));
        let mut out = String::new();
        let mut w = Emitter { out: &mut out, indent: 0 };
        w.emit_expr(&outer, -1).unwrap();
        assert_eq!(out, "(a + b) * c");
    }

    #[test]
    fn right_associative_assignment_does_not_parenthesize_rhs_assignment() {
        // a = (b = c) is how chained assignment must print (right-assoc).
        let rhs = Expr::binary("=", Expr::variable("b"), Expr::variable("c"));
        let outer = Expr::binary("=", Expr::variable("a"), rhs);
        let mut out = String::new();
        let mut w = Emitter { out: &mut out, indent: 0 };
        w.emit_expr(&outer, -1).unwrap();
        assert_eq!(out, "a = b = c");
    }

    #[test]
    fn dotted_index_form_used_for_label_constant_on_local() {
        let recv = Expr::local_variable("obj", 0);
        let idx = Expr::index(recv, Expr::constant(Value::String("field".into())));
        let mut out = String::new();
        let mut w = Emitter { out: &mut out, indent: 0 };
        w.emit_expr(&idx, -1).unwrap();
        assert_eq!(out, "obj.field");
    }

    #[test]
    fn bracket_index_form_used_for_non_identifier_key() {
        let recv = Expr::variable("obj");
        let idx = Expr::index(recv, Expr::constant(Value::Int(3)));
        let mut out = String::new();
        let mut w = Emitter { out: &mut out, indent: 0 };
        w.emit_expr(&idx, -1).unwrap();
        assert_eq!(out, "obj[3]");
    }

    #[test]
    fn root_table_dotted_form_uses_double_colon_prefix() {
        let idx = Expr::index(Expr::root_table(), Expr::constant(Value::String("Foo".into())));
        let mut out = String::new();
        let mut w = Emitter { out: &mut out, indent: 0 };
        w.emit_expr(&idx, -1).unwrap();
        assert_eq!(out, "::Foo");
    }

    #[test]
    fn while_loop_emits_blank_lines_around_it_when_adjacent_to_other_statements() {
        let before = Stmt::expression(Expr::variable("a"));
        let while_stmt = std::rc::Rc::new(Stmt::While {
            cond: Expr::constant(Value::Bool(true)),
            body: Stmt::empty_block(),
            loop_start: 0,
            loop_end: 1,
            flags: RefCell::new(crate::stmt::LoopFlags::new()),
        });
        let after = Stmt::expression(Expr::variable("b"));
        let block = root_with(vec![before, while_stmt, after]);
        let mut out = String::new();
        let mut w = Emitter { out: &mut out, indent: 0 };
        w.emit_statement_list(&block.block_statements().unwrap()).unwrap();
        let blank_lines = out.matches("\n\n").count();
        assert!(blank_lines >= 2, "expected blank lines around the while loop, got:\n{out}");
    }

    #[test]
    fn switch_case_labels_are_dedented_relative_to_their_body() {
        let case_body = Stmt::block(vec![Stmt::expression(Expr::variable("x"))]);
        let switch_stmt = std::rc::Rc::new(Stmt::Switch {
            subject: Expr::variable("v"),
            cases: RefCell::new(vec![CaseArm {
                value: Some(Expr::constant(Value::Int(1))),
                body: case_body,
            }]),
            default: None,
        });
        let mut out = String::new();
        let mut w = Emitter { out: &mut out, indent: 0 };
        w.emit_statement(&switch_stmt).unwrap();
        assert!(out.contains("case 1:\n"));
        assert!(out.contains("\tx;\n"));
        assert!(!out.contains("\t\tx;\n"));
    }

    #[test]
    fn nested_class_member_emits_its_own_braced_body() {
        use crate::expr::{ClassMember, ClassMemberKind};

        let outer = Expr::new_class(None, None);
        let inner = Expr::new_class(None, None);
        inner.append_class_member(ClassMember {
            key: Expr::constant(Value::String("x".into())),
            value: Expr::constant(Value::Int(1)),
            attributes: None,
            is_static: false,
            kind: ClassMemberKind::Field,
        });
        outer.append_class_member(ClassMember {
            key: Expr::constant(Value::String("Inner".into())),
            value: inner,
            attributes: None,
            is_static: false,
            kind: ClassMemberKind::NestedClass,
        });

        let mut out = String::new();
        let mut w = Emitter { out: &mut out, indent: 0 };
        w.emit_expr(&outer, -1).unwrap();

        assert_eq!(out.matches('{').count(), out.matches('}').count(), "braces must balance:\n{out}");
        assert!(out.contains("class Inner"));
        assert!(out.contains("x = 1;"));
    }
}

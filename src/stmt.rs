//! Statement AST and post-processing passes.
//!
//! Like [`crate::expr`], this lowers the original's `Statement` subclass
//! hierarchy to a tagged enum. Blocks and expression-statements need late
//! mutation after construction — a block keeps growing while the VM walks
//! the instruction stream, and an expression-statement may be *withdrawn*
//! later (§4.3 pending-statement discipline) — so both wrap their mutable
//! payload in a `RefCell`.

use std::cell::RefCell;
use std::rc::Rc;

use crate::expr::{Expr, ExprRef};

pub type StmtRef = Rc<Stmt>;

/// Bit-set of loop flags named in §3's block-state data model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopFlags(u8);

impl LoopFlags {
    pub const USED_FORWARD_JUMP_CONTINUE: u8 = 0x01;
    pub const USED_BACKWARD_JUMP_CONTINUE: u8 = 0x02;

    pub fn new() -> Self {
        LoopFlags(0)
    }

    pub fn set_forward_continue(&mut self) {
        self.0 |= Self::USED_FORWARD_JUMP_CONTINUE;
    }

    pub fn set_backward_continue(&mut self) {
        self.0 |= Self::USED_BACKWARD_JUMP_CONTINUE;
    }

    pub fn used_backward_continue(&self) -> bool {
        self.0 & Self::USED_BACKWARD_JUMP_CONTINUE != 0
    }
}

#[derive(Debug, Clone)]
pub struct CaseArm {
    /// `None` for an unlabeled fallthrough (§4.4 switch-reconstruction).
    pub value: Option<ExprRef>,
    pub body: StmtRef,
}

#[derive(Debug)]
pub enum Stmt {
    Empty,
    /// Wraps `None` once withdrawn by the pending-statement mechanism; an
    /// empty-statement post-processing pass then elides it entirely.
    Expression(RefCell<Option<ExprRef>>),
    Block(RefCell<Vec<StmtRef>>),
    LocalVarInit {
        name: String,
        slot: i32,
        init: Option<ExprRef>,
    },
    Return(Option<ExprRef>),
    Throw(ExprRef),
    Yield(Option<ExprRef>),
    Break,
    Continue,
    Comment(String),
    If {
        cond: ExprRef,
        then_branch: StmtRef,
        else_branch: Option<StmtRef>,
    },
    TryCatch {
        try_block: StmtRef,
        catch_var: String,
        catch_block: StmtRef,
    },
    For {
        init: Option<StmtRef>,
        cond: Option<ExprRef>,
        step: Option<StmtRef>,
        body: StmtRef,
    },
    While {
        cond: ExprRef,
        body: StmtRef,
        loop_start: i32,
        loop_end: i32,
        flags: RefCell<LoopFlags>,
    },
    DoWhile {
        cond: ExprRef,
        body: StmtRef,
        loop_start: i32,
        loop_end: i32,
        flags: RefCell<LoopFlags>,
    },
    Foreach {
        key: Option<String>,
        value: String,
        container: ExprRef,
        body: StmtRef,
        loop_start: i32,
        loop_end: i32,
        flags: RefCell<LoopFlags>,
    },
    Switch {
        subject: ExprRef,
        cases: RefCell<Vec<CaseArm>>,
        default: Option<StmtRef>,
    },
}

impl Stmt {
    pub fn empty() -> StmtRef {
        Rc::new(Stmt::Empty)
    }

    pub fn expression(expr: ExprRef) -> StmtRef {
        Rc::new(Stmt::Expression(RefCell::new(Some(expr))))
    }

    pub fn block(stmts: Vec<StmtRef>) -> StmtRef {
        Rc::new(Stmt::Block(RefCell::new(stmts)))
    }

    pub fn empty_block() -> StmtRef {
        Stmt::block(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Stmt::Empty => true,
            Stmt::Expression(e) => e.borrow().is_none(),
            _ => false,
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self, Stmt::Block(_))
    }

    /// Line-separated statements (loops, if/try/switch) get a blank line
    /// before and after them when adjacent to other statements (§3, §4.5).
    pub fn is_line_separated(&self) -> bool {
        matches!(
            self,
            Stmt::If { .. }
                | Stmt::TryCatch { .. }
                | Stmt::For { .. }
                | Stmt::While { .. }
                | Stmt::DoWhile { .. }
                | Stmt::Foreach { .. }
                | Stmt::Switch { .. }
        )
    }

    /// Withdraws a pending expression-statement: nulls its expression so a
    /// later post-processing pass elides it (§4.3 step 2).
    pub fn clear(self: &StmtRef) {
        if let Stmt::Expression(cell) = self.as_ref() {
            *cell.borrow_mut() = None;
        }
    }

    /// The expression this statement holds, if it still holds one.
    pub fn expression_value(&self) -> Option<ExprRef> {
        match self {
            Stmt::Expression(cell) => cell.borrow().clone(),
            _ => None,
        }
    }

    pub fn append_to_block(self: &StmtRef, stmt: StmtRef) {
        match self.as_ref() {
            Stmt::Block(stmts) => stmts.borrow_mut().push(stmt),
            _ => unreachable!("append_to_block on non-block statement"),
        }
    }

    pub fn block_statements(&self) -> Option<Vec<StmtRef>> {
        match self {
            Stmt::Block(stmts) => Some(stmts.borrow().clone()),
            _ => None,
        }
    }
}

/// Returns the variable/member-assignment "step" shape recognized by the
/// while→for promotion rule: `++`, `--`, `+=`, `-=`, or plain `=`.
fn is_qualifying_step_expr(e: &Expr) -> bool {
    match e {
        Expr::UnaryPostfix { op, .. } => op == "++" || op == "--",
        Expr::Binary { op, .. } => matches!(op.as_str(), "+=" | "-=" | "=" ),
        _ => false,
    }
}

fn is_qualifying_preceding_stmt(s: &Stmt) -> bool {
    matches!(s, Stmt::LocalVarInit { .. }) || matches!(s, Stmt::Expression(e) if e.borrow().is_some())
}

/// Recursively post-processes a statement tree in place: elides emptied
/// pending statements, and promotes qualifying `while` loops to `for` loops
/// (§4.4 While→For promotion). Mirrors the driving loop in the original's
/// `BlockStatement::Postprocess`.
pub fn postprocess(root: &StmtRef) {
    postprocess_stmt(root);
}

fn postprocess_stmt(stmt: &StmtRef) {
    match stmt.as_ref() {
        Stmt::Block(stmts) => {
            postprocess_block_contents(stmts);
        }
        Stmt::If {
            then_branch,
            else_branch,
            ..
        } => {
            postprocess_stmt(then_branch);
            if let Some(e) = else_branch {
                postprocess_stmt(e);
            }
        }
        Stmt::TryCatch {
            try_block,
            catch_block,
            ..
        } => {
            postprocess_stmt(try_block);
            postprocess_stmt(catch_block);
        }
        Stmt::For { body, .. }
        | Stmt::While { body, .. }
        | Stmt::DoWhile { body, .. }
        | Stmt::Foreach { body, .. } => postprocess_stmt(body),
        Stmt::Switch { cases, default, .. } => {
            for arm in cases.borrow().iter() {
                postprocess_stmt(&arm.body);
            }
            if let Some(d) = default {
                postprocess_stmt(d);
            }
        }
        _ => {}
    }
}

fn postprocess_block_contents(stmts: &RefCell<Vec<StmtRef>>) {
    {
        let snapshot = stmts.borrow().clone();
        for s in &snapshot {
            postprocess_stmt(s);
        }
    }

    // While→for promotion: needs a mutable, indexable view, so operate on an
    // owned Vec and write the result back.
    let mut list = stmts.borrow().clone();
    let mut i = 0;
    while i < list.len() {
        let promoted = if let Stmt::While {
            cond,
            body,
            flags,
            ..
        } = list[i].as_ref()
        {
            if !flags.borrow().used_backward_continue() && i > 0 && is_qualifying_preceding_stmt(&list[i - 1]) {
                try_promote_to_for(cond.clone(), body.clone())
            } else {
                None
            }
        } else {
            None
        };

        if let Some(for_stmt) = promoted {
            let init = list[i - 1].clone();
            list[i - 1] = for_stmt_with_init(for_stmt, init);
            list[i] = Stmt::empty();
        }
        i += 1;
    }

    list.retain(|s| !s.is_empty());
    *stmts.borrow_mut() = list;
}

fn for_stmt_with_init(for_stmt: StmtRef, init: StmtRef) -> StmtRef {
    match for_stmt.as_ref() {
        Stmt::For { cond, step, body, .. } => Rc::new(Stmt::For {
            init: Some(init),
            cond: cond.clone(),
            step: step.clone(),
            body: body.clone(),
        }),
        _ => unreachable!(),
    }
}

/// Attempts the while→for promotion for one loop body: the body's last
/// non-empty statement must be a qualifying step expression. On success
/// returns a `For` statement with `init` left unset (the caller splices in
/// the preceding statement) and the step removed from the body.
fn try_promote_to_for(cond: ExprRef, body: StmtRef) -> Option<StmtRef> {
    let Stmt::Block(stmts) = body.as_ref() else {
        return None;
    };
    let mut list = stmts.borrow().clone();
    let last_idx = list.iter().rposition(|s| !s.is_empty())?;
    let step_expr = list[last_idx].expression_value()?;
    if !is_qualifying_step_expr(&step_expr) {
        return None;
    }
    let step = Stmt::expression(step_expr);
    list.remove(last_idx);
    let new_body = Stmt::block(list);
    Some(Rc::new(Stmt::For {
        init: None,
        cond: Some(cond),
        step: Some(step),
        body: new_body,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn clear_withdraws_an_expression_statement() {
        let stmt = Stmt::expression(Expr::constant(Value::Int(1)));
        assert!(!stmt.is_empty());
        stmt.clear();
        assert!(stmt.is_empty());
    }

    #[test]
    fn postprocess_elides_cleared_statements_from_block() {
        let kept = Stmt::expression(Expr::constant(Value::Int(1)));
        let withdrawn = Stmt::expression(Expr::constant(Value::Int(2)));
        withdrawn.clear();
        let block = Stmt::block(vec![kept.clone(), withdrawn]);
        postprocess(&block);
        let remaining = block.block_statements().unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(Rc::ptr_eq(&remaining[0], &kept));
    }

    #[test]
    fn while_with_init_and_trailing_increment_promotes_to_for() {
        let init = Stmt::expression(Expr::binary(
            "=",
            Expr::variable("i"),
            Expr::constant(Value::Int(0)),
        ));
        let cond = Expr::binary("<", Expr::variable("i"), Expr::constant(Value::Int(10)));
        let step = Stmt::expression(Expr::unary_postfix("++", Expr::variable("i")));
        let body = Stmt::block(vec![step]);
        let while_stmt = Rc::new(Stmt::While {
            cond,
            body,
            loop_start: 0,
            loop_end: 10,
            flags: RefCell::new(LoopFlags::new()),
        });
        let block = Stmt::block(vec![init, while_stmt]);
        postprocess(&block);
        let remaining = block.block_statements().unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(matches!(remaining[0].as_ref(), Stmt::For { init: Some(_), step: Some(_), .. }));
    }

    #[test]
    fn while_with_backward_continue_flag_does_not_promote() {
        let init = Stmt::expression(Expr::binary(
            "=",
            Expr::variable("i"),
            Expr::constant(Value::Int(0)),
        ));
        let cond = Expr::binary("<", Expr::variable("i"), Expr::constant(Value::Int(10)));
        let step = Stmt::expression(Expr::unary_postfix("++", Expr::variable("i")));
        let body = Stmt::block(vec![step]);
        let mut flags = LoopFlags::new();
        flags.set_backward_continue();
        let while_stmt = Rc::new(Stmt::While {
            cond,
            body,
            loop_start: 0,
            loop_end: 10,
            flags: RefCell::new(flags),
        });
        let block = Stmt::block(vec![init, while_stmt]);
        postprocess(&block);
        let remaining = block.block_statements().unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(matches!(remaining[1].as_ref(), Stmt::While { .. }));
    }
}

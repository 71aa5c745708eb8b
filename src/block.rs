//! Block-state stack: the transient descriptor of the bytecode region
//! currently being reconstructed into a source-level block (§3, §4.4).

use std::cell::RefCell;
use std::rc::Rc;

use crate::stmt::LoopFlags;

/// What kind of loop (if any) encloses the current block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    None,
    While,
    DoWhile,
    Foreach,
    /// A loop whose header condition was reconstructed from a dedicated
    /// `JCMP` instruction rather than a `JZ`-after-`CMP` pair (§4.4). This is
    /// the fourth loop kind named by this specification's block-state data
    /// model; it is handled identically to `While` by the break/continue
    /// classifier and by while→for promotion.
    CmpFor,
}

#[derive(Debug)]
pub struct BlockState {
    pub in_loop: LoopKind,
    pub in_switch: bool,
    pub block_start: i32,
    /// End of this block's bytecode extent. A switch's end can be widened
    /// after construction when the JMP classifier (§4.4) recognizes a
    /// `break` landing past the chain-computed end, so this needs the same
    /// interior mutability as `loop_flags` below.
    block_end: RefCell<i32>,
    /// Set during reconstruction as the JMP classifier (§4.4) recognizes
    /// forward/backward continue jumps belonging to this loop. Interior
    /// mutability is needed because the block is shared (`Rc`) with the
    /// nested reconstruction that discovers the flag.
    pub loop_flags: RefCell<LoopFlags>,
    pub parent: Option<Rc<BlockState>>,
}

impl BlockState {
    pub fn root(block_end: i32) -> Rc<BlockState> {
        Rc::new(BlockState {
            in_loop: LoopKind::None,
            in_switch: false,
            block_start: 0,
            block_end: RefCell::new(block_end),
            loop_flags: RefCell::new(LoopFlags::new()),
            parent: None,
        })
    }

    pub fn child(
        parent: &Rc<BlockState>,
        in_loop: LoopKind,
        in_switch: bool,
        block_start: i32,
        block_end: i32,
    ) -> Rc<BlockState> {
        Rc::new(BlockState {
            in_loop,
            in_switch,
            block_start,
            block_end: RefCell::new(block_end),
            loop_flags: RefCell::new(LoopFlags::new()),
            parent: Some(Rc::clone(parent)),
        })
    }

    pub fn block_end(&self) -> i32 {
        *self.block_end.borrow()
    }

    /// Widens this block's end to `new_end` if it extends past the current
    /// one (§4.4 JMP rule 5: a break past a switch's computed end widens it).
    pub fn widen_end(&self, new_end: i32) {
        let mut end = self.block_end.borrow_mut();
        if new_end > *end {
            *end = new_end;
        }
    }

    /// Nearest enclosing block (including self) whose `in_loop` is not `None`.
    pub fn nearest_loop(self: &Rc<Self>) -> Option<Rc<BlockState>> {
        let mut cur = Some(Rc::clone(self));
        while let Some(b) = cur {
            if b.in_loop != LoopKind::None {
                return Some(b);
            }
            cur = b.parent.clone();
        }
        None
    }

    /// Nearest enclosing block (including self) that is a switch.
    pub fn nearest_switch(self: &Rc<Self>) -> Option<Rc<BlockState>> {
        let mut cur = Some(Rc::clone(self));
        while let Some(b) = cur {
            if b.in_switch {
                return Some(b);
            }
            cur = b.parent.clone();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_loop_skips_non_loop_blocks() {
        let root = BlockState::root(100);
        let loop_block = BlockState::child(&root, LoopKind::While, false, 0, 50);
        let inner_if = BlockState::child(&loop_block, LoopKind::None, false, 5, 20);
        let found = inner_if.nearest_loop().unwrap();
        assert_eq!(found.in_loop, LoopKind::While);
    }

    #[test]
    fn nearest_loop_none_when_no_enclosing_loop() {
        let root = BlockState::root(100);
        let inner = BlockState::child(&root, LoopKind::None, false, 0, 10);
        assert!(inner.nearest_loop().is_none());
    }

    #[test]
    fn widen_end_extends_past_the_original_end() {
        let switch = BlockState::child(&BlockState::root(100), LoopKind::None, true, 0, 20);
        assert_eq!(switch.block_end(), 20);
        switch.widen_end(30);
        assert_eq!(switch.block_end(), 30);
    }

    #[test]
    fn widen_end_never_narrows() {
        let switch = BlockState::child(&BlockState::root(100), LoopKind::None, true, 0, 20);
        switch.widen_end(10);
        assert_eq!(switch.block_end(), 20, "a break landing before the current end must not shrink it");
    }
}

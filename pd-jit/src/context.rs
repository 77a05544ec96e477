use std::collections::HashMap;

use crate::assembler::{Mem, mem};
use crate::block::BlockId;
use crate::error::{JitError, JitResult};
use crate::exit_compiler::SP;
use crate::host::{Host, Insn, IseqRef, Value};

const WORD: i32 = 8;

/// Abstract operand-stack shape at one point of compiled code.
///
/// `stack_size` is the logical depth of the interpreter's operand stack.
/// `sp_offset` is how many of those slots sit at or above the `SP`
/// register; it only falls behind `stack_size` at block entries and is
/// rebased before any instruction is compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize)]
pub struct Context {
    pub stack_size: u16,
    pub sp_offset: u16,
    pub chain_depth: u8,
}

impl Context {
    pub fn new(stack_size: u16, sp_offset: u16) -> Self {
        Self {
            stack_size,
            sp_offset,
            chain_depth: 0,
        }
    }

    /// Pushes one slot and returns its operand.
    pub fn stack_push(&mut self) -> JitResult<Mem> {
        let (Some(stack_size), Some(sp_offset)) =
            (self.stack_size.checked_add(1), self.sp_offset.checked_add(1))
        else {
            return Err(JitError::StackOverflow);
        };
        self.stack_size = stack_size;
        self.sp_offset = sp_offset;
        Ok(self.stack_opnd(0))
    }

    /// Pops `n` slots and returns the operand of the old top.
    pub fn stack_pop(&mut self, n: u16) -> JitResult<Mem> {
        if n > self.sp_offset || n > self.stack_size {
            return Err(JitError::StackUnderflow);
        }
        let top = self.stack_opnd(0);
        self.stack_size -= n;
        self.sp_offset -= n;
        Ok(top)
    }

    /// Operand `depth` slots below the top of the stack.
    pub fn stack_opnd(&self, depth: i32) -> Mem {
        mem(SP, WORD * (i32::from(self.sp_offset) - 1 - depth))
    }

    /// Operand `slots` words above the logical top.
    pub fn sp_opnd(&self, slots: i32) -> Mem {
        mem(SP, WORD * (i32::from(self.sp_offset) + slots))
    }

    /// Bytes between `SP` and the logical stack top.
    pub fn sp_bytes(&self) -> i32 {
        WORD * i32::from(self.sp_offset)
    }

    /// Slots `SP` must move down so every stack slot sits above it.
    pub fn pending_rebase(&self) -> u16 {
        self.stack_size - self.sp_offset
    }

    /// Marks `SP` as moved down by [`Context::pending_rebase`] slots.
    pub fn rebase(&mut self) -> u16 {
        let slots = self.pending_rebase();
        self.sp_offset = self.stack_size;
        slots
    }

    /// Shape after a callee returns onto a caller stack that held `popped`
    /// receiver and argument slots. `SP` then points at the return value.
    pub fn return_landing(&self, popped: u16) -> JitResult<Context> {
        if popped > self.stack_size {
            return Err(JitError::StackUnderflow);
        }
        Ok(Context {
            stack_size: self.stack_size - popped + 1,
            sp_offset: 1,
            chain_depth: 0,
        })
    }

    pub fn increment_chain_depth(&mut self) {
        self.chain_depth = self.chain_depth.saturating_add(1);
    }

    pub fn reset_chain_depth(&mut self) {
        self.chain_depth = 0;
    }
}

/// Cursor for one block compile.
pub struct JitState {
    pub iseq: IseqRef,
    pub pc: u64,
    pub insn: Insn,
    pub block: BlockId,
    side_exits: HashMap<u64, u64>,
}

impl JitState {
    pub fn new(iseq: IseqRef, pc: u64, insn: Insn, block: BlockId) -> Self {
        Self {
            iseq,
            pc,
            insn,
            block,
            side_exits: HashMap::new(),
        }
    }

    pub fn advance(&mut self, pc: u64, insn: Insn) {
        self.pc = pc;
        self.insn = insn;
    }

    pub fn next_pc(&self) -> u64 {
        self.pc + u64::from(self.insn.len) * WORD as u64
    }

    /// pc of a branch whose relative operand is `offset` words.
    pub fn jump_target(&self, offset: u64) -> u64 {
        self.next_pc()
            .wrapping_add((offset as i64 * i64::from(WORD)) as u64)
    }

    pub fn operand(&self, host: &dyn Host, n: u32) -> u64 {
        host.operand(self.iseq, self.pc, n)
    }

    /// Whether the interpreter is stopped at this very instruction, so its
    /// stack can be peeked.
    pub fn at_current_insn(&self, host: &dyn Host) -> bool {
        host.current_pc() == Some(self.pc)
    }

    pub fn peek_at_stack(&self, host: &dyn Host, depth: u32) -> Option<Value> {
        if !self.at_current_insn(host) {
            return None;
        }
        host.peek_stack(depth)
    }

    pub fn side_exit(&self) -> Option<u64> {
        self.side_exits.get(&self.pc).copied()
    }

    pub fn record_side_exit(&mut self, addr: u64) {
        self.side_exits.insert(self.pc, addr);
    }

    pub fn side_exit_count(&self) -> usize {
        self.side_exits.len()
    }
}

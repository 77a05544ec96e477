use std::collections::HashMap;

use crate::context::Context;
use crate::error::{JitError, JitResult};
use crate::host::IseqRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct BlockId(pub u32);

/// One compiled version of the code starting at `pc` for a given [`Context`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct Block {
    pub id: BlockId,
    pub iseq: IseqRef,
    pub pc: u64,
    pub ctx: Context,
    pub start_addr: u64,
    pub end_addr: u64,
    pub insn_count: u32,
    /// Exit used once the block is invalidated, compiled on demand.
    pub entry_exit: Option<u64>,
    pub invalidated: bool,
}

impl Block {
    pub fn len(&self) -> u64 {
        self.end_addr - self.start_addr
    }

    pub fn is_empty(&self) -> bool {
        self.start_addr == self.end_addr
    }
}

#[derive(Default)]
pub struct BlockRegistry {
    blocks: Vec<Block>,
    versions: HashMap<(IseqRef, u64, Context), BlockId>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an id for a block about to be compiled. The block becomes
    /// visible to [`BlockRegistry::find`] once [`BlockRegistry::publish`] runs.
    pub fn reserve(&mut self, iseq: IseqRef, pc: u64, ctx: Context) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            id,
            iseq,
            pc,
            ctx,
            start_addr: 0,
            end_addr: 0,
            insn_count: 0,
            entry_exit: None,
            invalidated: false,
        });
        id
    }

    pub fn publish(&mut self, id: BlockId, start_addr: u64, end_addr: u64, insn_count: u32) -> JitResult<()> {
        let block = self.get_mut(id)?;
        block.start_addr = start_addr;
        block.end_addr = end_addr;
        block.insn_count = insn_count;
        let key = (block.iseq, block.pc, block.ctx);
        self.versions.insert(key, id);
        Ok(())
    }

    pub fn find(&self, iseq: IseqRef, pc: u64, ctx: &Context) -> Option<&Block> {
        let id = self.versions.get(&(iseq, pc, *ctx))?;
        self.blocks.get(id.0 as usize).filter(|block| !block.invalidated)
    }

    pub fn get(&self, id: BlockId) -> JitResult<&Block> {
        self.blocks
            .get(id.0 as usize)
            .ok_or(JitError::UnknownBlock(id.0))
    }

    pub fn get_mut(&mut self, id: BlockId) -> JitResult<&mut Block> {
        self.blocks
            .get_mut(id.0 as usize)
            .ok_or(JitError::UnknownBlock(id.0))
    }

    /// Drops the block from version lookup so the next request recompiles.
    pub fn invalidate(&mut self, id: BlockId) -> JitResult<()> {
        let block = self.get_mut(id)?;
        block.invalidated = true;
        let key = (block.iseq, block.pc, block.ctx);
        if self.versions.get(&key) == Some(&id) {
            self.versions.remove(&key);
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|block| block.end_addr != 0)
    }

    pub fn live_count(&self) -> usize {
        self.versions.len()
    }
}

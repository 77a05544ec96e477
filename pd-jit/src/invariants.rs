use std::collections::{BTreeSet, HashMap, HashSet};

use crate::assembler::{Assembler, uimm};
use crate::block::{BlockId, BlockRegistry};
use crate::code_block::CodeBlock;
use crate::context::JitState;
use crate::error::JitResult;
use crate::exit_compiler::ExitCompiler;
use crate::host::MethodEntryRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum RedefinitionClass {
    Integer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum BasicOperator {
    Plus,
    Minus,
    Lt,
}

/// A global fact generated code may rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum Condition {
    BopNotRedefined {
        class: RedefinitionClass,
        bop: BasicOperator,
    },
    MethodLookupStable(MethodEntryRef),
}

/// Bytes written over the start of an invalidated block.
pub const INVALIDATION_PATCH_LEN: usize = 5;

/// What an invalidation needs to reach.
pub struct PatchSite<'a> {
    pub cb: &'a mut CodeBlock,
    pub ocb: &'a mut CodeBlock,
    pub blocks: &'a mut BlockRegistry,
    pub exits: &'a ExitCompiler,
}

#[derive(Default)]
pub struct Invariants {
    dependents: HashMap<Condition, BTreeSet<BlockId>>,
    broken: HashSet<Condition>,
}

impl Invariants {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the block being compiled as depending on `condition`.
    /// Returns false when the condition is already known not to hold.
    pub fn assume(&mut self, jit: &JitState, condition: Condition) -> bool {
        if self.broken.contains(&condition) {
            return false;
        }
        self.dependents
            .entry(condition)
            .or_default()
            .insert(jit.block);
        true
    }

    pub fn assume_bop_not_redefined(
        &mut self,
        jit: &JitState,
        class: RedefinitionClass,
        bop: BasicOperator,
    ) -> bool {
        self.assume(jit, Condition::BopNotRedefined { class, bop })
    }

    pub fn assume_method_lookup_stable(&mut self, jit: &JitState, entry: MethodEntryRef) -> bool {
        self.assume(jit, Condition::MethodLookupStable(entry))
    }

    pub fn holds(&self, condition: &Condition) -> bool {
        !self.broken.contains(condition)
    }

    /// Drops registrations made by a block whose compile was abandoned.
    pub fn forget_block(&mut self, block: BlockId) {
        self.dependents.retain(|_, blocks| {
            blocks.remove(&block);
            !blocks.is_empty()
        });
    }

    /// Marks `condition` broken and sends every dependent block to the
    /// interpreter. Returns the blocks that were patched.
    pub fn invalidate(
        &mut self,
        condition: Condition,
        site: &mut PatchSite<'_>,
    ) -> JitResult<Vec<BlockId>> {
        self.broken.insert(condition);
        let Some(blocks) = self.dependents.remove(&condition) else {
            return Ok(Vec::new());
        };
        let mut patched = Vec::with_capacity(blocks.len());
        for id in blocks {
            if invalidate_block(id, site)? {
                patched.push(id);
            }
        }
        tracing::warn!(?condition, blocks = patched.len(), "invalidated jit code");
        Ok(patched)
    }

    pub fn dependents(&self, condition: &Condition) -> usize {
        self.dependents.get(condition).map_or(0, BTreeSet::len)
    }

    pub fn conditions(&self) -> impl Iterator<Item = (&Condition, usize)> {
        self.dependents.iter().map(|(condition, blocks)| (condition, blocks.len()))
    }

    pub fn broken(&self) -> impl Iterator<Item = &Condition> {
        self.broken.iter()
    }
}

/// Writes `jmp entry_exit` over the first bytes of the block.
fn invalidate_block(id: BlockId, site: &mut PatchSite<'_>) -> JitResult<bool> {
    let block = site.blocks.get(id)?;
    if block.invalidated || block.end_addr == 0 {
        return Ok(false);
    }
    let (pc, ctx, start) = (block.pc, block.ctx, block.start_addr);
    let exit = match block.entry_exit {
        Some(addr) => addr,
        None => {
            let mut asm = Assembler::with_comments(site.ocb.keep_comments());
            site.exits.compile_entry_exit(&mut asm, pc, &ctx, None)?;
            site.ocb.write(&mut asm)?.start
        }
    };
    let mut asm = Assembler::with_comments(site.cb.keep_comments());
    asm.comment("invalidated");
    asm.jmp(uimm(exit))?;
    site.cb.patch(start, &mut asm)?;
    site.blocks.get_mut(id)?.entry_exit = Some(exit);
    site.blocks.invalidate(id)?;
    tracing::debug!(block = id.0, pc = format_args!("{pc:#x}"), "patched block entry");
    Ok(true)
}

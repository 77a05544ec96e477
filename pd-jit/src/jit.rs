//! Compiler facade the VM talks to.
//!
//! The VM calls [`Jit::compile_entry`] when a method gets hot, the runtime
//! hooks forward stub hits to [`Jit::block_stub_hit`] and
//! [`Jit::branch_stub_hit`], and redefinition events reach
//! [`Jit::on_bop_redefined`] and [`Jit::on_method_entry_invalidated`].

use std::collections::HashMap;
use std::fmt::Write as _;
use std::rc::Rc;

use crate::assembler::{Assembler, Marker, Placement, RAX, uimm};
use crate::block::{Block, BlockId, BlockRegistry};
use crate::code_block::{CodeBlock, CodeRegion};
use crate::context::{Context, JitState};
use crate::error::{JitError, JitResult};
use crate::exit_compiler::{C_ARGS, CFP, EC, ExitCompiler, SP};
use crate::host::{Host, IseqRef, MethodEntryRef, RuntimeEntryPoints};
use crate::insn::Opcode;
use crate::insn_compiler::{
    CantCompileReason, CodegenEnv, CodegenStatus, compile_insn, has_handler, side_exit,
};
use crate::invariants::{
    BasicOperator, Condition, INVALIDATION_PATCH_LEN, Invariants, PatchSite, RedefinitionClass,
};
use crate::layout::{FrameField, VmLayout};
use crate::stats::{CounterSnapshot, Counters};
use crate::stub::{BlockStubKind, BranchShape, BranchSide, BranchStub, Patchable, Stub, StubId, StubRegistry};

const ENV_ENABLED: &str = "PD_JIT_ENABLED";
const ENV_STATS: &str = "PD_JIT_STATS";
const ENV_MAX_CHAIN_DEPTH: &str = "PD_JIT_MAX_CHAIN_DEPTH";
const ENV_EXEC_MEM_SIZE: &str = "PD_JIT_EXEC_MEM_SIZE";
const ENV_COMMENTS: &str = "PD_JIT_COMMENTS";

/// Whether generated code can run on this target.
pub fn native_jit_supported() -> bool {
    cfg!(all(unix, target_arch = "x86_64"))
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct JitConfig {
    pub enabled: bool,
    /// Count instructions and exits from generated code.
    pub stats: bool,
    pub max_chain_depth: u8,
    /// Bytes of executable memory, split between inline and outlined code.
    pub exec_mem_size: usize,
    /// Keep assembler comments for [`Jit::dump_text`].
    pub comments: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: native_jit_supported(),
            stats: false,
            max_chain_depth: 5,
            exec_mem_size: 1 << 20,
            comments: false,
        }
    }
}

impl JitConfig {
    pub fn from_env() -> JitResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads overrides through `lookup`, keeping defaults for unset keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> JitResult<Self> {
        let mut config = JitConfig::default();
        if let Some(value) = lookup(ENV_ENABLED) {
            config.enabled = parse_flag(ENV_ENABLED, &value)? && native_jit_supported();
        }
        if let Some(value) = lookup(ENV_STATS) {
            config.stats = parse_flag(ENV_STATS, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_CHAIN_DEPTH) {
            config.max_chain_depth = parse_number(ENV_MAX_CHAIN_DEPTH, &value)?;
        }
        if let Some(value) = lookup(ENV_EXEC_MEM_SIZE) {
            config.exec_mem_size = parse_number(ENV_EXEC_MEM_SIZE, &value)?;
            if config.exec_mem_size == 0 {
                return Err(JitError::Config(format!("{ENV_EXEC_MEM_SIZE} must be nonzero")));
            }
        }
        if let Some(value) = lookup(ENV_COMMENTS) {
            config.comments = parse_flag(ENV_COMMENTS, &value)?;
        }
        Ok(config)
    }
}

fn parse_flag(key: &str, value: &str) -> JitResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(JitError::Config(format!("{key}: expected a boolean, got {other:?}"))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> JitResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| JitError::Config(format!("{key}: expected a number, got {value:?}")))
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct InvariantSnapshot {
    pub condition: Condition,
    pub dependents: usize,
    pub broken: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct JitSnapshot {
    pub enabled: bool,
    pub layout_version: u32,
    pub inline_used: usize,
    pub outlined_used: usize,
    pub live_blocks: usize,
    pub blocks: Vec<Block>,
    pub stubs: usize,
    pub inlined_stubs: usize,
    pub invariants: Vec<InvariantSnapshot>,
    pub counters: CounterSnapshot,
}

impl JitSnapshot {
    pub fn to_json(&self) -> JitResult<String> {
        serde_json::to_string_pretty(self).map_err(|err| JitError::Serialize(err.to_string()))
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct NyiEntry {
    pub reason: CantCompileReason,
    pub message: &'static str,
}

/// What still runs in the interpreter.
#[derive(Debug, Clone, serde::Serialize)]
pub struct NyiReference {
    pub reasons: Vec<NyiEntry>,
    pub unsupported_opcodes: Vec<&'static str>,
}

struct EntryPoint {
    addr: u64,
    block: BlockId,
}

pub struct Jit {
    config: JitConfig,
    layout: Rc<VmLayout>,
    counters: Rc<Counters>,
    exits: ExitCompiler,
    cb: CodeBlock,
    ocb: CodeBlock,
    blocks: BlockRegistry,
    stubs: StubRegistry,
    invariants: Invariants,
    entries: HashMap<(IseqRef, u64, u16), EntryPoint>,
    leave_exit: u64,
    full_cfunc_return: u64,
    stub_fallback: u64,
}

impl Jit {
    pub fn new(
        config: JitConfig,
        layout: VmLayout,
        entry_points: RuntimeEntryPoints,
    ) -> JitResult<Self> {
        let (cb, mut ocb) = if native_jit_supported() {
            CodeRegion::new(config.exec_mem_size, config.comments)?
        } else {
            CodeRegion::heap(config.exec_mem_size, config.comments)
        };
        let layout = Rc::new(layout);
        let counters = Rc::new(Counters::new(config.stats));
        let exits = ExitCompiler::new(Rc::clone(&layout), Rc::clone(&counters), entry_points);

        let mut asm = Assembler::with_comments(config.comments);
        exits.compile_leave_exit(&mut asm)?;
        let leave_exit = ocb.write(&mut asm)?.start;
        exits.compile_full_cfunc_return(&mut asm)?;
        let full_cfunc_return = ocb.write(&mut asm)?.start;
        exits.compile_stub_fallback(&mut asm)?;
        let stub_fallback = ocb.write(&mut asm)?.start;

        tracing::debug!(
            enabled = config.enabled,
            stats = config.stats,
            exec_mem_size = config.exec_mem_size,
            layout_version = layout.version(),
            "jit initialised"
        );
        Ok(Self {
            config,
            layout,
            counters,
            exits,
            cb,
            ocb,
            blocks: BlockRegistry::new(),
            stubs: StubRegistry::new(),
            invariants: Invariants::new(),
            entries: HashMap::new(),
            leave_exit,
            full_cfunc_return,
            stub_fallback,
        })
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn layout(&self) -> &VmLayout {
        &self.layout
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn blocks(&self) -> &BlockRegistry {
        &self.blocks
    }

    pub fn stubs(&self) -> &StubRegistry {
        &self.stubs
    }

    pub fn invariants(&self) -> &Invariants {
        &self.invariants
    }

    pub fn leave_exit(&self) -> u64 {
        self.leave_exit
    }

    /// Exit for native callees that returned to generated code.
    pub fn full_cfunc_return(&self) -> u64 {
        self.full_cfunc_return
    }

    /// Native entry for `iseq` at `pc`, callable as
    /// `extern "C" fn(ec, cfp) -> VALUE`. `stack_size` is the depth of the
    /// frame's operand stack at `pc`. Returns None when the JIT is off.
    pub fn compile_entry(
        &mut self,
        host: &dyn Host,
        iseq: IseqRef,
        pc: u64,
        stack_size: u16,
    ) -> JitResult<Option<u64>> {
        if !self.config.enabled {
            return Ok(None);
        }
        let key = (iseq, pc, stack_size);
        if let Some(entry) = self.entries.get(&key) {
            if !self.blocks.get(entry.block)?.invalidated {
                return Ok(Some(entry.addr));
            }
        }

        let mut asm = self.new_asm();
        asm.comment("entry prologue");
        asm.push(CFP)?;
        asm.push(EC)?;
        asm.push(SP)?;
        asm.mov(EC, C_ARGS[0])?;
        asm.mov(CFP, C_ARGS[1])?;
        asm.mov(SP, self.layout.frame_opnd(CFP, FrameField::Sp))?;
        asm.mov(RAX, uimm(self.leave_exit))?;
        asm.mov(self.layout.frame_opnd(CFP, FrameField::JitReturn), RAX)?;

        let ctx = Context::new(stack_size, 0);
        let (block, insn_count) = self.gen_block(host, &mut asm, iseq, pc, ctx)?;
        let placement = match self.cb.write(&mut asm) {
            Ok(placement) => placement,
            Err(err) => {
                self.invariants.forget_block(block);
                return Err(err);
            }
        };
        self.publish_block(block, insn_count, &placement)?;
        tracing::debug!(
            iseq = format_args!("{:#x}", iseq.0),
            pc = format_args!("{pc:#x}"),
            entry = format_args!("{:#x}", placement.start),
            "compiled entry"
        );
        self.entries.insert(
            key,
            EntryPoint {
                addr: placement.start,
                block,
            },
        );
        Ok(Some(placement.start))
    }

    /// Called from a block stub trampoline. Returns where to continue.
    pub fn block_stub_hit(&mut self, host: &dyn Host, stub: u32) -> u64 {
        match self.try_block_stub_hit(host, StubId(stub)) {
            Ok(addr) => addr,
            Err(err) => {
                tracing::warn!(stub, %err, "block stub compile failed");
                self.stub_fallback
            }
        }
    }

    /// Called from a branch stub trampoline for `side` (0 target, 1 fallthrough).
    pub fn branch_stub_hit(&mut self, host: &dyn Host, stub: u32, side: u32) -> u64 {
        let Some(side) = BranchSide::from_index(side) else {
            tracing::warn!(stub, side, "branch stub hit with unknown side");
            return self.stub_fallback;
        };
        match self.try_branch_stub_hit(host, StubId(stub), side) {
            Ok(addr) => addr,
            Err(err) => {
                tracing::warn!(stub, ?side, %err, "branch stub compile failed");
                self.stub_fallback
            }
        }
    }

    pub fn on_bop_redefined(
        &mut self,
        class: RedefinitionClass,
        bop: BasicOperator,
    ) -> JitResult<Vec<BlockId>> {
        self.invalidate(Condition::BopNotRedefined { class, bop })
    }

    pub fn on_method_entry_invalidated(&mut self, entry: MethodEntryRef) -> JitResult<Vec<BlockId>> {
        self.invalidate(Condition::MethodLookupStable(entry))
    }

    fn invalidate(&mut self, condition: Condition) -> JitResult<Vec<BlockId>> {
        let mut site = PatchSite {
            cb: &mut self.cb,
            ocb: &mut self.ocb,
            blocks: &mut self.blocks,
            exits: &self.exits,
        };
        self.invariants.invalidate(condition, &mut site)
    }

    fn try_block_stub_hit(&mut self, host: &dyn Host, id: StubId) -> JitResult<u64> {
        let stub = self.stubs.block(id)?.clone();
        if let Some(target) = stub.target {
            return Ok(target);
        }
        if let Some(block) = self.blocks.find(stub.iseq, stub.pc, &stub.ctx) {
            let addr = block.start_addr;
            self.link_block_stub(id, addr)?;
            return Ok(addr);
        }

        let mut asm = self.new_asm();
        let (block, insn_count) = self.gen_block(host, &mut asm, stub.iseq, stub.pc, stub.ctx)?;
        let at_tail = stub.kind == BlockStubKind::Jump
            && stub.end_addr != 0
            && stub.end_addr == self.cb.write_addr();
        let written = if at_tail {
            self.cb.rewrite_tail(stub.start_addr, &mut asm)
        } else {
            self.cb.write(&mut asm)
        };
        let placement = match written {
            Ok(placement) => placement,
            Err(err) => {
                self.invariants.forget_block(block);
                return Err(err);
            }
        };
        let addr = self.publish_block(block, insn_count, &placement)?;
        if at_tail {
            let linked = self.stubs.block_mut(id)?;
            linked.target = Some(addr);
            linked.inlined = true;
            tracing::trace!(stub = id.0, "placed block over its stub");
        } else {
            self.link_block_stub(id, addr)?;
        }
        Ok(addr)
    }

    fn link_block_stub(&mut self, id: StubId, addr: u64) -> JitResult<()> {
        let stub = self.stubs.block_mut(id)?;
        stub.target = Some(addr);
        let stub = stub.clone();
        if stub.end_addr == 0 {
            return Ok(());
        }
        let mut asm = self.new_asm();
        stub.apply(&mut asm)?;
        self.cb.patch(stub.start_addr, &mut asm)?;
        Ok(())
    }

    fn try_branch_stub_hit(&mut self, host: &dyn Host, id: StubId, side: BranchSide) -> JitResult<u64> {
        let stub = self.stubs.branch(id)?.clone();
        if let Some(block) = stub.target(side).block {
            return Ok(block);
        }
        let target_pc = stub.target(side).pc;
        if let Some(block) = self.blocks.find(stub.iseq, target_pc, &stub.ctx) {
            let addr = block.start_addr;
            self.link_branch_stub(id, side, addr)?;
            return Ok(addr);
        }

        let at_tail = stub.shape == BranchShape::Neither
            && stub.end_addr != 0
            && stub.end_addr == self.cb.write_addr();
        let mut asm = self.new_asm();
        let mut reshaped: Option<BranchStub> = None;
        if at_tail {
            let mut next = stub.clone();
            next.shape = BranchStub::shape_with_next(side);
            next.apply(&mut asm)?;
            reshaped = Some(next);
        }
        let (block, insn_count) = self.gen_block(host, &mut asm, stub.iseq, target_pc, stub.ctx)?;
        let written = if at_tail {
            self.cb.rewrite_tail(stub.start_addr, &mut asm)
        } else {
            self.cb.write(&mut asm)
        };
        let placement = match written {
            Ok(placement) => placement,
            Err(err) => {
                self.invariants.forget_block(block);
                return Err(err);
            }
        };
        let addr = self.publish_block(block, insn_count, &placement)?;
        match reshaped {
            Some(next) => {
                let linked = self.stubs.branch_mut(id)?;
                linked.shape = next.shape;
                linked.target_mut(side).block = Some(addr);
                tracing::trace!(stub = id.0, shape = ?next.shape, "placed branch target after stub");
            }
            None => self.link_branch_stub(id, side, addr)?,
        }
        Ok(addr)
    }

    fn link_branch_stub(&mut self, id: StubId, side: BranchSide, addr: u64) -> JitResult<()> {
        let stub = self.stubs.branch_mut(id)?;
        stub.target_mut(side).block = Some(addr);
        let stub = stub.clone();
        if stub.end_addr == 0 {
            return Ok(());
        }
        let mut asm = self.new_asm();
        stub.apply(&mut asm)?;
        self.cb.patch(stub.start_addr, &mut asm)?;
        Ok(())
    }

    /// Compiles instructions from `pc` into `asm` until one ends the block.
    /// The block is registered but only becomes visible once published.
    fn gen_block(
        &mut self,
        host: &dyn Host,
        asm: &mut Assembler,
        iseq: IseqRef,
        pc: u64,
        ctx: Context,
    ) -> JitResult<(BlockId, u32)> {
        let block = self.blocks.reserve(iseq, pc, ctx);
        let mut env = CodegenEnv {
            host,
            ocb: &mut self.ocb,
            stubs: &mut self.stubs,
            invariants: &mut self.invariants,
            exits: &self.exits,
            max_chain_depth: self.config.max_chain_depth,
        };
        match gen_block_body(&mut env, asm, block, iseq, pc, ctx) {
            Ok(insn_count) => {
                tracing::debug!(
                    block = block.0,
                    iseq = format_args!("{:#x}", iseq.0),
                    pc = format_args!("{pc:#x}"),
                    stack_size = ctx.stack_size,
                    insn_count,
                    "compiled block"
                );
                Ok((block, insn_count))
            }
            Err(err) => {
                asm.clear();
                self.invariants.forget_block(block);
                Err(err)
            }
        }
    }

    fn publish_block(&mut self, block: BlockId, insn_count: u32, placement: &Placement) -> JitResult<u64> {
        let start = placement
            .marker(Marker::BlockStart(block))
            .ok_or(JitError::UnknownBlock(block.0))?;
        self.blocks.publish(block, start, placement.end, insn_count)?;
        for (marker, addr) in &placement.markers {
            if let Marker::StubStart(id) = marker {
                let end = placement.marker(Marker::StubEnd(*id)).unwrap_or(*addr);
                self.stubs.place(*id, *addr, end)?;
            }
        }
        Ok(start)
    }

    fn new_asm(&self) -> Assembler {
        Assembler::with_comments(self.config.comments)
    }

    pub fn snapshot(&self) -> JitSnapshot {
        let mut invariants: Vec<InvariantSnapshot> = self
            .invariants
            .conditions()
            .map(|(condition, dependents)| InvariantSnapshot {
                condition: *condition,
                dependents,
                broken: false,
            })
            .chain(self.invariants.broken().map(|condition| InvariantSnapshot {
                condition: *condition,
                dependents: 0,
                broken: true,
            }))
            .collect();
        invariants.sort_by_key(|entry| format!("{:?}", entry.condition));
        let inlined_stubs = self
            .stubs
            .iter()
            .filter(|stub| matches!(stub, Stub::Block(block) if block.inlined))
            .count();
        JitSnapshot {
            enabled: self.config.enabled,
            layout_version: self.layout.version(),
            inline_used: self.cb.used(),
            outlined_used: self.ocb.used(),
            live_blocks: self.blocks.live_count(),
            blocks: self.blocks.iter().cloned().collect(),
            stubs: self.stubs.len(),
            inlined_stubs,
            invariants,
            counters: self.counters.snapshot(),
        }
    }

    /// Hex listing of every compiled block with its assembler comments.
    pub fn dump_text(&self) -> String {
        let mut out = String::new();
        for block in self.blocks.iter() {
            let _ = writeln!(
                out,
                "== block {} iseq={:#x} pc={:#x} stack_size={} sp_offset={} chain_depth={}{}",
                block.id.0,
                block.iseq.0,
                block.pc,
                block.ctx.stack_size,
                block.ctx.sp_offset,
                block.ctx.chain_depth,
                if block.invalidated { " (invalidated)" } else { "" }
            );
            let bytes = self.cb.read(block.start_addr, block.end_addr);
            for (row, chunk) in bytes.chunks(16).enumerate() {
                let addr = block.start_addr + 16 * row as u64;
                for (at, comments) in self.cb.comments_between(addr, addr + chunk.len() as u64) {
                    for comment in comments {
                        let _ = writeln!(out, "  {at:#x}: ; {comment}");
                    }
                }
                let hex: Vec<String> = chunk.iter().map(|byte| format!("{byte:02x}")).collect();
                let _ = writeln!(out, "  {addr:#x}: {}", hex.join(" "));
            }
        }
        out
    }

    pub fn nyi_reference(&self) -> NyiReference {
        NyiReference {
            reasons: CantCompileReason::ALL
                .iter()
                .map(|reason| NyiEntry {
                    reason: *reason,
                    message: reason.message(),
                })
                .collect(),
            unsupported_opcodes: Opcode::ALL
                .iter()
                .filter(|opcode| !has_handler(**opcode))
                .map(|opcode| opcode.name())
                .collect(),
        }
    }
}

fn gen_block_body(
    env: &mut CodegenEnv<'_>,
    asm: &mut Assembler,
    block: BlockId,
    iseq: IseqRef,
    pc: u64,
    mut ctx: Context,
) -> JitResult<u32> {
    let host = env.host;
    let decode = |pc: u64| {
        host.decode(iseq, pc)
            .ok_or_else(|| JitError::Host(format!("no instruction at {pc:#x}")))
    };
    let insn = decode(pc)?;
    asm.block_start(block);
    let start = asm.len();
    if ctx.pending_rebase() > 0 {
        asm.comment("rebase SP");
        let slots = ctx.rebase();
        env.exits.move_sp_down(asm, slots)?;
    }

    let mut jit = JitState::new(iseq, pc, insn, block);
    let mut insn_count = 0;
    loop {
        match compile_insn(env, &mut jit, &mut ctx, asm)? {
            CodegenStatus::KeepCompiling => {
                insn_count += 1;
                ctx.reset_chain_depth();
                let next = jit.next_pc();
                let insn = decode(next)?;
                jit.advance(next, insn);
            }
            CodegenStatus::EndBlock => {
                insn_count += 1;
                break;
            }
            CodegenStatus::CantCompile(_) => {
                let exit = side_exit(env, &mut jit, &ctx)?;
                asm.jmp(uimm(exit))?;
                break;
            }
        }
    }
    // room for the jump written over an invalidated block
    while asm.len() - start < INVALIDATION_PATCH_LEN {
        asm.nop();
    }
    Ok(insn_count)
}

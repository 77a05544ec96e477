//! Per-instruction code generation.
//!
//! Each supported opcode maps to one handler through a dispatch table built
//! once from [`INSN_TABLE`]. A handler reads its operands through the
//! [`JitState`], updates the [`Context`] in place and emits into the inline
//! assembler. Side exits, stub trampolines and other cold code go to the
//! outlined block.

use std::sync::OnceLock;

use crate::assembler::{Assembler, EAX, RAX, RCX, imm, mem, uimm};
use crate::code_block::CodeBlock;
use crate::context::{Context, JitState};
use crate::error::{JitError, JitResult};
use crate::exit_compiler::{CFP, EC, ExitCompiler, SP};
use crate::host::{CallFlags, CallInfo, Host, IseqBody, IseqRef, MethodDef, MethodEntry, Visibility};
use crate::insn::Opcode;
use crate::invariants::{BasicOperator, Invariants, RedefinitionClass};
use crate::layout::{ContextField, FrameField};
use crate::stats::Counter;
use crate::stub::{
    BlockStub, BlockStubKind, BranchKind, BranchSide, BranchShape, BranchStub, BranchTarget,
    Patchable, Stub, StubId, StubRegistry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodegenStatus {
    KeepCompiling,
    EndBlock,
    CantCompile(CantCompileReason),
}

/// Why an instruction is left to the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum CantCompileReason {
    UnsupportedOpcode,
    StackUnderflow,
    StackOverflow,
    NoStackValue,
    NotFixnum,
    BopRedefined,
    UnknownCallInfo,
    SplatArgs,
    KeywordArgs,
    BlockArg,
    TailCall,
    ReceiverNotSingleton,
    MethodMissing,
    ProtectedMethod,
    PrivateWithReceiver,
    NonIseqMethod,
    UnknownIseq,
    ComplexParams,
    ArityMismatch,
    NonParamLocals,
    LookupUnstable,
    StackNotEmptyOnLeave,
    LocalIndexOutOfRange,
}

impl CantCompileReason {
    pub const ALL: [CantCompileReason; 23] = [
        CantCompileReason::UnsupportedOpcode,
        CantCompileReason::StackUnderflow,
        CantCompileReason::StackOverflow,
        CantCompileReason::NoStackValue,
        CantCompileReason::NotFixnum,
        CantCompileReason::BopRedefined,
        CantCompileReason::UnknownCallInfo,
        CantCompileReason::SplatArgs,
        CantCompileReason::KeywordArgs,
        CantCompileReason::BlockArg,
        CantCompileReason::TailCall,
        CantCompileReason::ReceiverNotSingleton,
        CantCompileReason::MethodMissing,
        CantCompileReason::ProtectedMethod,
        CantCompileReason::PrivateWithReceiver,
        CantCompileReason::NonIseqMethod,
        CantCompileReason::UnknownIseq,
        CantCompileReason::ComplexParams,
        CantCompileReason::ArityMismatch,
        CantCompileReason::NonParamLocals,
        CantCompileReason::LookupUnstable,
        CantCompileReason::StackNotEmptyOnLeave,
        CantCompileReason::LocalIndexOutOfRange,
    ];

    pub fn message(self) -> &'static str {
        match self {
            CantCompileReason::UnsupportedOpcode => "no native handler for this instruction",
            CantCompileReason::StackUnderflow => "instruction pops more than the known stack",
            CantCompileReason::StackOverflow => "operand stack deeper than a context can track",
            CantCompileReason::NoStackValue => "operand values are not observable at compile time",
            CantCompileReason::NotFixnum => "operands are not both fixnums",
            CantCompileReason::BopRedefined => "basic operator was redefined",
            CantCompileReason::UnknownCallInfo => "call site has no call info",
            CantCompileReason::SplatArgs => "splat arguments",
            CantCompileReason::KeywordArgs => "keyword arguments",
            CantCompileReason::BlockArg => "block argument",
            CantCompileReason::TailCall => "tail call",
            CantCompileReason::ReceiverNotSingleton => "receiver is not the sole instance of its class",
            CantCompileReason::MethodMissing => "method lookup failed",
            CantCompileReason::ProtectedMethod => "protected method",
            CantCompileReason::PrivateWithReceiver => "private method called with an explicit receiver",
            CantCompileReason::NonIseqMethod => "callee is not a bytecode method",
            CantCompileReason::UnknownIseq => "callee body is unavailable",
            CantCompileReason::ComplexParams => "callee takes optional, rest, keyword or block parameters",
            CantCompileReason::ArityMismatch => "argument count differs from the callee's parameters",
            CantCompileReason::NonParamLocals => "callee has locals beyond its parameters",
            CantCompileReason::LookupUnstable => "method entry was already invalidated",
            CantCompileReason::StackNotEmptyOnLeave => "leave with more than the return value on the stack",
            CantCompileReason::LocalIndexOutOfRange => "local index does not fit a displacement",
        }
    }
}

/// Everything a handler may touch besides the block being emitted.
pub struct CodegenEnv<'a> {
    pub host: &'a dyn Host,
    pub ocb: &'a mut CodeBlock,
    pub stubs: &'a mut StubRegistry,
    pub invariants: &'a mut Invariants,
    pub exits: &'a ExitCompiler,
    pub max_chain_depth: u8,
}

impl CodegenEnv<'_> {
    fn new_asm(&self) -> Assembler {
        Assembler::with_comments(self.ocb.keep_comments())
    }

    /// Writes cold code to the outlined block and returns its address.
    fn write_outlined(
        &mut self,
        emit: impl FnOnce(&ExitCompiler, &mut Assembler) -> JitResult<()>,
    ) -> JitResult<u64> {
        let mut asm = self.new_asm();
        emit(self.exits, &mut asm)?;
        Ok(self.ocb.write(&mut asm)?.start)
    }
}

type InsnFn =
    fn(&mut CodegenEnv<'_>, &mut JitState, &mut Context, &mut Assembler) -> JitResult<CodegenStatus>;

const INSN_TABLE: &[(Opcode, InsnFn)] = &[
    (Opcode::Nop, nop as InsnFn),
    (Opcode::Pop, pop as InsnFn),
    (Opcode::Dup, dup as InsnFn),
    (Opcode::Putnil, putnil as InsnFn),
    (Opcode::Putself, putself as InsnFn),
    (Opcode::Putobject, putobject as InsnFn),
    (Opcode::PutobjectInt2fix0, putobject_int2fix as InsnFn),
    (Opcode::PutobjectInt2fix1, putobject_int2fix as InsnFn),
    (Opcode::GetlocalWc0, getlocal_wc_0 as InsnFn),
    (Opcode::SetlocalWc0, setlocal_wc_0 as InsnFn),
    (Opcode::OptPlus, opt_plus as InsnFn),
    (Opcode::OptMinus, opt_minus as InsnFn),
    (Opcode::OptLt, opt_lt as InsnFn),
    (Opcode::Branchunless, branchunless as InsnFn),
    (Opcode::Branchif, branchif as InsnFn),
    (Opcode::Jump, jump as InsnFn),
    (Opcode::Leave, leave as InsnFn),
    (Opcode::OptSendWithoutBlock, opt_send_without_block as InsnFn),
];

fn dispatch_table() -> &'static [Option<InsnFn>] {
    static TABLE: OnceLock<Vec<Option<InsnFn>>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = vec![None; Opcode::COUNT];
        for (opcode, handler) in INSN_TABLE {
            table[opcode.index()] = Some(*handler);
        }
        table
    })
}

pub fn has_handler(opcode: Opcode) -> bool {
    dispatch_table()[opcode.index()].is_some()
}

/// Compiles the instruction under `jit`. On cannot-compile nothing emitted
/// for it is kept and `ctx` is restored.
pub fn compile_insn(
    env: &mut CodegenEnv<'_>,
    jit: &mut JitState,
    ctx: &mut Context,
    asm: &mut Assembler,
) -> JitResult<CodegenStatus> {
    let opcode = jit.insn.opcode;
    let Some(handler) = dispatch_table()[opcode.index()] else {
        return Ok(CodegenStatus::CantCompile(CantCompileReason::UnsupportedOpcode));
    };
    let checkpoint = asm.checkpoint();
    let saved = *ctx;
    asm.comment(format!("{opcode} @ {:#x}", jit.pc));
    env.exits.count(asm, Counter::InsnsCount)?;
    let status = match handler(env, jit, ctx, asm) {
        Err(JitError::StackUnderflow) => {
            CodegenStatus::CantCompile(CantCompileReason::StackUnderflow)
        }
        Err(JitError::StackOverflow) => {
            CodegenStatus::CantCompile(CantCompileReason::StackOverflow)
        }
        other => other?,
    };
    if let CodegenStatus::CantCompile(reason) = status {
        tracing::debug!(
            insn = %opcode,
            pc = format_args!("{:#x}", jit.pc),
            reason = reason.message(),
            "cannot compile"
        );
        asm.rewind(checkpoint);
        *ctx = saved;
    }
    Ok(status)
}

/// Exit to the interpreter at the current instruction, shared by every
/// guard of that instruction.
pub fn side_exit(env: &mut CodegenEnv<'_>, jit: &mut JitState, ctx: &Context) -> JitResult<u64> {
    if let Some(addr) = jit.side_exit() {
        return Ok(addr);
    }
    let (pc, opcode) = (jit.pc, jit.insn.opcode);
    let addr = env.write_outlined(|exits, asm| exits.compile_side_exit(asm, pc, ctx, opcode))?;
    jit.record_side_exit(addr);
    Ok(addr)
}

/// Emits a jump of `kind` to a stub that compiles `(iseq, pc, ctx)` on first use.
pub fn compile_block_stub(
    env: &mut CodegenEnv<'_>,
    iseq: IseqRef,
    pc: u64,
    ctx: Context,
    kind: BlockStubKind,
    asm: &mut Assembler,
) -> JitResult<StubId> {
    let mut stub = BlockStub {
        id: env.stubs.next_id(),
        iseq,
        pc,
        ctx,
        kind,
        trampoline: 0,
        target: None,
        start_addr: 0,
        end_addr: 0,
        inlined: false,
    };
    stub.trampoline = env.write_outlined(|exits, asm| exits.compile_block_stub(asm, &stub))?;
    stub.apply(asm)?;
    Ok(env.stubs.insert(Stub::Block(stub)))
}

/// Ends the block with a stub that resumes compiling at this instruction
/// once the interpreter has reached it, so run-time values can be peeked.
fn defer_compilation(
    env: &mut CodegenEnv<'_>,
    jit: &JitState,
    ctx: &Context,
    asm: &mut Assembler,
) -> JitResult<CodegenStatus> {
    asm.comment("defer_compilation");
    let mut deferred = *ctx;
    deferred.reset_chain_depth();
    compile_block_stub(env, jit.iseq, jit.pc, deferred, BlockStubKind::Jump, asm)?;
    Ok(CodegenStatus::EndBlock)
}

/// `jne` to a deeper version of this instruction, or to a side exit once
/// the chain is `max_chain_depth` long.
fn jit_chain_guard(
    env: &mut CodegenEnv<'_>,
    jit: &mut JitState,
    ctx: &Context,
    asm: &mut Assembler,
) -> JitResult<()> {
    if ctx.chain_depth < env.max_chain_depth {
        let mut deeper = *ctx;
        deeper.increment_chain_depth();
        compile_block_stub(env, jit.iseq, jit.pc, deeper, BlockStubKind::JumpIfNotEqual, asm)?;
    } else {
        let exit = side_exit(env, jit, ctx)?;
        asm.jne(uimm(exit))?;
    }
    Ok(())
}

fn compile_check_ints(
    env: &mut CodegenEnv<'_>,
    jit: &mut JitState,
    ctx: &Context,
    asm: &mut Assembler,
) -> JitResult<()> {
    asm.comment("check interrupts");
    let flag = env.exits.layout().context_opnd(EC, ContextField::InterruptFlag);
    asm.mov(EAX, flag)?;
    asm.test(EAX, EAX)?;
    let exit = side_exit(env, jit, ctx)?;
    asm.jnz(uimm(exit))?;
    Ok(())
}

fn is_backward(offset: u64) -> bool {
    (offset as i64) < 0
}

// nop

fn nop(
    _env: &mut CodegenEnv<'_>,
    _jit: &mut JitState,
    _ctx: &mut Context,
    _asm: &mut Assembler,
) -> JitResult<CodegenStatus> {
    Ok(CodegenStatus::KeepCompiling)
}

// pop

fn pop(
    _env: &mut CodegenEnv<'_>,
    _jit: &mut JitState,
    ctx: &mut Context,
    _asm: &mut Assembler,
) -> JitResult<CodegenStatus> {
    ctx.stack_pop(1)?;
    Ok(CodegenStatus::KeepCompiling)
}

// dup

fn dup(
    _env: &mut CodegenEnv<'_>,
    _jit: &mut JitState,
    ctx: &mut Context,
    asm: &mut Assembler,
) -> JitResult<CodegenStatus> {
    if ctx.stack_size == 0 {
        return Err(JitError::StackUnderflow);
    }
    asm.mov(RAX, ctx.stack_opnd(0))?;
    let dst = ctx.stack_push()?;
    asm.mov(dst, RAX)?;
    Ok(CodegenStatus::KeepCompiling)
}

fn put_value(ctx: &mut Context, asm: &mut Assembler, value: u64) -> JitResult<CodegenStatus> {
    let dst = ctx.stack_push()?;
    let signed = value as i64;
    if i32::try_from(signed).is_ok() {
        // sign-extended imm32, so negative fixnums stay in the short form
        asm.mov(dst, imm(signed))?;
    } else {
        asm.mov(RAX, uimm(value))?;
        asm.mov(dst, RAX)?;
    }
    Ok(CodegenStatus::KeepCompiling)
}

// putnil

fn putnil(
    env: &mut CodegenEnv<'_>,
    _jit: &mut JitState,
    ctx: &mut Context,
    asm: &mut Assembler,
) -> JitResult<CodegenStatus> {
    put_value(ctx, asm, env.exits.layout().values().qnil)
}

// putself

fn putself(
    env: &mut CodegenEnv<'_>,
    _jit: &mut JitState,
    ctx: &mut Context,
    asm: &mut Assembler,
) -> JitResult<CodegenStatus> {
    asm.mov(RAX, env.exits.layout().frame_opnd(CFP, FrameField::SelfValue))?;
    let dst = ctx.stack_push()?;
    asm.mov(dst, RAX)?;
    Ok(CodegenStatus::KeepCompiling)
}

// putobject
// val

fn putobject(
    env: &mut CodegenEnv<'_>,
    jit: &mut JitState,
    ctx: &mut Context,
    asm: &mut Assembler,
) -> JitResult<CodegenStatus> {
    let value = jit.operand(env.host, 0);
    put_value(ctx, asm, value)
}

// putobject_INT2FIX_0_, putobject_INT2FIX_1_

fn putobject_int2fix(
    env: &mut CodegenEnv<'_>,
    jit: &mut JitState,
    ctx: &mut Context,
    asm: &mut Assembler,
) -> JitResult<CodegenStatus> {
    let n = match jit.insn.opcode {
        Opcode::PutobjectInt2fix1 => 1,
        _ => 0,
    };
    let value = env.exits.layout().values().fixnum(n);
    put_value(ctx, asm, value.0)
}

fn local_disp(idx: u64) -> Option<i32> {
    i32::try_from(idx).ok()?.checked_mul(8)?.checked_neg()
}

// getlocal_WC_0
// idx

fn getlocal_wc_0(
    env: &mut CodegenEnv<'_>,
    jit: &mut JitState,
    ctx: &mut Context,
    asm: &mut Assembler,
) -> JitResult<CodegenStatus> {
    let Some(disp) = local_disp(jit.operand(env.host, 0)) else {
        return Ok(CodegenStatus::CantCompile(CantCompileReason::LocalIndexOutOfRange));
    };
    asm.comment("load ep");
    asm.mov(RAX, env.exits.layout().frame_opnd(CFP, FrameField::Ep))?;
    asm.mov(RAX, mem(RAX, disp))?;
    let dst = ctx.stack_push()?;
    asm.mov(dst, RAX)?;
    Ok(CodegenStatus::KeepCompiling)
}

// setlocal_WC_0
// idx

fn setlocal_wc_0(
    env: &mut CodegenEnv<'_>,
    jit: &mut JitState,
    ctx: &mut Context,
    asm: &mut Assembler,
) -> JitResult<CodegenStatus> {
    let Some(disp) = local_disp(jit.operand(env.host, 0)) else {
        return Ok(CodegenStatus::CantCompile(CantCompileReason::LocalIndexOutOfRange));
    };
    if ctx.stack_size == 0 {
        return Err(JitError::StackUnderflow);
    }
    let exits = env.exits;
    let layout = exits.layout();
    asm.comment("load ep");
    asm.mov(RAX, layout.frame_opnd(CFP, FrameField::Ep))?;
    // escaped envs need the write barrier, which only the interpreter runs
    asm.test(mem(RAX, 0), uimm(layout.env().wb_required))?;
    let exit = side_exit(env, jit, ctx)?;
    asm.jnz(uimm(exit))?;
    let value = ctx.stack_pop(1)?;
    asm.mov(RCX, value)?;
    asm.mov(mem(RAX, disp), RCX)?;
    Ok(CodegenStatus::KeepCompiling)
}

fn fixnum_binop(
    env: &mut CodegenEnv<'_>,
    jit: &mut JitState,
    ctx: &mut Context,
    asm: &mut Assembler,
    bop: BasicOperator,
) -> JitResult<CodegenStatus> {
    if !jit.at_current_insn(env.host) {
        return defer_compilation(env, jit, ctx, asm);
    }
    if ctx.stack_size < 2 {
        return Err(JitError::StackUnderflow);
    }
    let values = *env.exits.layout().values();
    let (Some(recv), Some(obj)) = (
        jit.peek_at_stack(env.host, 1),
        jit.peek_at_stack(env.host, 0),
    ) else {
        return Ok(CodegenStatus::CantCompile(CantCompileReason::NoStackValue));
    };
    if !values.is_fixnum(recv) || !values.is_fixnum(obj) {
        return Ok(CodegenStatus::CantCompile(CantCompileReason::NotFixnum));
    }
    if !env
        .invariants
        .assume_bop_not_redefined(jit, RedefinitionClass::Integer, bop)
    {
        return Ok(CodegenStatus::CantCompile(CantCompileReason::BopRedefined));
    }

    let recv_opnd = ctx.stack_opnd(1);
    let obj_opnd = ctx.stack_opnd(0);
    let exit = side_exit(env, jit, ctx)?;

    asm.comment("guard recv is fixnum");
    asm.test(recv_opnd, uimm(values.fixnum_flag))?;
    asm.jz(uimm(exit))?;
    asm.comment("guard obj is fixnum");
    asm.test(obj_opnd, uimm(values.fixnum_flag))?;
    asm.jz(uimm(exit))?;

    match bop {
        BasicOperator::Plus => {
            asm.mov(RAX, recv_opnd)?;
            asm.sub(RAX, imm(1))?;
            asm.mov(RCX, obj_opnd)?;
            asm.add(RAX, RCX)?;
            asm.jo(uimm(exit))?;
            asm.mov(recv_opnd, RAX)?;
        }
        BasicOperator::Minus => {
            asm.mov(RAX, recv_opnd)?;
            asm.mov(RCX, obj_opnd)?;
            asm.sub(RAX, RCX)?;
            asm.jo(uimm(exit))?;
            asm.add(RAX, imm(1))?;
            asm.mov(recv_opnd, RAX)?;
        }
        BasicOperator::Lt => {
            asm.mov(RAX, obj_opnd)?;
            asm.cmp(recv_opnd, RAX)?;
            asm.mov(RAX, uimm(values.qfalse))?;
            asm.mov(RCX, uimm(values.qtrue))?;
            asm.cmovl(RAX, RCX)?;
            asm.mov(recv_opnd, RAX)?;
        }
    }
    ctx.stack_pop(1)?;
    Ok(CodegenStatus::KeepCompiling)
}

// opt_plus
// cd

fn opt_plus(
    env: &mut CodegenEnv<'_>,
    jit: &mut JitState,
    ctx: &mut Context,
    asm: &mut Assembler,
) -> JitResult<CodegenStatus> {
    fixnum_binop(env, jit, ctx, asm, BasicOperator::Plus)
}

// opt_minus
// cd

fn opt_minus(
    env: &mut CodegenEnv<'_>,
    jit: &mut JitState,
    ctx: &mut Context,
    asm: &mut Assembler,
) -> JitResult<CodegenStatus> {
    fixnum_binop(env, jit, ctx, asm, BasicOperator::Minus)
}

// opt_lt
// cd

fn opt_lt(
    env: &mut CodegenEnv<'_>,
    jit: &mut JitState,
    ctx: &mut Context,
    asm: &mut Assembler,
) -> JitResult<CodegenStatus> {
    fixnum_binop(env, jit, ctx, asm, BasicOperator::Lt)
}

fn jit_branch(
    env: &mut CodegenEnv<'_>,
    jit: &mut JitState,
    ctx: &mut Context,
    asm: &mut Assembler,
    kind: BranchKind,
) -> JitResult<CodegenStatus> {
    let offset = jit.operand(env.host, 0);
    if ctx.stack_size == 0 {
        return Err(JitError::StackUnderflow);
    }
    if is_backward(offset) {
        compile_check_ints(env, jit, ctx, asm)?;
    }
    let falsy_mask = env.exits.layout().values().falsy_mask();
    asm.test(ctx.stack_opnd(0), imm(falsy_mask))?;
    ctx.stack_pop(1)?;

    let mut stub = BranchStub {
        id: env.stubs.next_id(),
        iseq: jit.iseq,
        ctx: *ctx,
        kind,
        branch_target: BranchTarget {
            pc: jit.jump_target(offset),
            trampoline: 0,
            block: None,
        },
        fallthrough: BranchTarget {
            pc: jit.next_pc(),
            trampoline: 0,
            block: None,
        },
        shape: BranchShape::Neither,
        start_addr: 0,
        end_addr: 0,
    };
    for side in [BranchSide::Target, BranchSide::Fallthrough] {
        let trampoline =
            env.write_outlined(|exits, asm| exits.compile_branch_stub(asm, &stub, side))?;
        stub.target_mut(side).trampoline = trampoline;
    }
    stub.apply(asm)?;
    env.stubs.insert(Stub::Branch(stub));
    Ok(CodegenStatus::EndBlock)
}

// branchunless
// dst

fn branchunless(
    env: &mut CodegenEnv<'_>,
    jit: &mut JitState,
    ctx: &mut Context,
    asm: &mut Assembler,
) -> JitResult<CodegenStatus> {
    jit_branch(env, jit, ctx, asm, BranchKind::IfFalsy)
}

// branchif
// dst

fn branchif(
    env: &mut CodegenEnv<'_>,
    jit: &mut JitState,
    ctx: &mut Context,
    asm: &mut Assembler,
) -> JitResult<CodegenStatus> {
    jit_branch(env, jit, ctx, asm, BranchKind::IfTruthy)
}

// jump
// dst

fn jump(
    env: &mut CodegenEnv<'_>,
    jit: &mut JitState,
    ctx: &mut Context,
    asm: &mut Assembler,
) -> JitResult<CodegenStatus> {
    let offset = jit.operand(env.host, 0);
    if is_backward(offset) {
        compile_check_ints(env, jit, ctx, asm)?;
    }
    let target = jit.jump_target(offset);
    compile_block_stub(env, jit.iseq, target, *ctx, BlockStubKind::Jump, asm)?;
    Ok(CodegenStatus::EndBlock)
}

// leave

fn leave(
    env: &mut CodegenEnv<'_>,
    jit: &mut JitState,
    ctx: &mut Context,
    asm: &mut Assembler,
) -> JitResult<CodegenStatus> {
    if ctx.stack_size != 1 {
        return Ok(CodegenStatus::CantCompile(
            CantCompileReason::StackNotEmptyOnLeave,
        ));
    }
    compile_check_ints(env, jit, ctx, asm)?;
    let exits = env.exits;
    let layout = exits.layout();

    asm.comment("pop stack frame");
    asm.add(CFP, imm(i64::from(layout.frame_size())))?;
    asm.mov(layout.context_opnd(EC, ContextField::Cfp), CFP)?;

    asm.comment("write return value to the caller's stack");
    asm.mov(RAX, ctx.stack_opnd(0))?;
    asm.mov(SP, layout.frame_opnd(CFP, FrameField::Sp))?;
    asm.mov(mem(SP, 0), RAX)?;

    asm.comment("jump to jit_return of the popped frame");
    asm.jmp(layout.frame_opnd_at(CFP, -1, FrameField::JitReturn))?;
    Ok(CodegenStatus::EndBlock)
}

// opt_send_without_block
// cd

fn opt_send_without_block(
    env: &mut CodegenEnv<'_>,
    jit: &mut JitState,
    ctx: &mut Context,
    asm: &mut Assembler,
) -> JitResult<CodegenStatus> {
    let cd = jit.operand(env.host, 0);
    let Some(ci) = env.host.call_info(cd) else {
        return Ok(CodegenStatus::CantCompile(CantCompileReason::UnknownCallInfo));
    };
    jit_call_method(env, jit, ctx, asm, ci)
}

fn unsupported_call_flags(flags: CallFlags) -> Option<CantCompileReason> {
    if flags.has(CallFlags::ARGS_SPLAT) {
        Some(CantCompileReason::SplatArgs)
    } else if flags.has(CallFlags::KWARG) || flags.has(CallFlags::KW_SPLAT) {
        Some(CantCompileReason::KeywordArgs)
    } else if flags.has(CallFlags::ARGS_BLOCKARG) {
        Some(CantCompileReason::BlockArg)
    } else if flags.has(CallFlags::TAILCALL) {
        Some(CantCompileReason::TailCall)
    } else {
        None
    }
}

fn jit_call_method(
    env: &mut CodegenEnv<'_>,
    jit: &mut JitState,
    ctx: &mut Context,
    asm: &mut Assembler,
    ci: CallInfo,
) -> JitResult<CodegenStatus> {
    if !jit.at_current_insn(env.host) {
        return defer_compilation(env, jit, ctx, asm);
    }
    if let Some(reason) = unsupported_call_flags(ci.flags) {
        return Ok(CodegenStatus::CantCompile(reason));
    }
    let Ok(argc) = u16::try_from(ci.argc) else {
        return Err(JitError::StackUnderflow);
    };
    if argc >= ctx.stack_size {
        return Err(JitError::StackUnderflow);
    }
    let Some(recv) = jit.peek_at_stack(env.host, ci.argc) else {
        return Ok(CodegenStatus::CantCompile(CantCompileReason::NoStackValue));
    };

    // only objects that are the sole instance of their class get a fast path
    let class = env.host.class_of(recv);
    if env.host.singleton_object(class) != Some(recv) {
        return Ok(CodegenStatus::CantCompile(
            CantCompileReason::ReceiverNotSingleton,
        ));
    }
    let Some(me) = env.host.method_entry(class, ci.mid) else {
        return Ok(CodegenStatus::CantCompile(CantCompileReason::MethodMissing));
    };
    match me.visibility {
        Visibility::Public => {}
        Visibility::Private if ci.flags.has(CallFlags::FCALL) => {}
        Visibility::Private => {
            return Ok(CodegenStatus::CantCompile(
                CantCompileReason::PrivateWithReceiver,
            ));
        }
        Visibility::Protected => {
            return Ok(CodegenStatus::CantCompile(CantCompileReason::ProtectedMethod));
        }
    }
    let MethodDef::Iseq(callee) = me.def else {
        return Ok(CodegenStatus::CantCompile(CantCompileReason::NonIseqMethod));
    };
    let Some(body) = env.host.iseq_body(callee) else {
        return Ok(CodegenStatus::CantCompile(CantCompileReason::UnknownIseq));
    };
    if !body.simple_params {
        return Ok(CodegenStatus::CantCompile(CantCompileReason::ComplexParams));
    }
    if body.lead_num != ci.argc {
        return Ok(CodegenStatus::CantCompile(CantCompileReason::ArityMismatch));
    }
    if body.extra_locals() > 0 {
        return Ok(CodegenStatus::CantCompile(CantCompileReason::NonParamLocals));
    }

    if !env.invariants.assume_method_lookup_stable(jit, me.entry) {
        return Ok(CodegenStatus::CantCompile(CantCompileReason::LookupUnstable));
    }

    asm.comment("guard known object with singleton class");
    asm.mov(RAX, uimm(recv.0))?;
    asm.cmp(ctx.stack_opnd(i32::from(argc)), RAX)?;
    jit_chain_guard(env, jit, ctx, asm)?;
    jit_push_frame(env, jit, ctx, asm, argc, &me, callee, &body)
}

/// Pushes a method frame for `callee` and jumps to its first block. The
/// callee returns through a stub that compiles the caller's continuation.
#[allow(clippy::too_many_arguments)]
fn jit_push_frame(
    env: &mut CodegenEnv<'_>,
    jit: &mut JitState,
    ctx: &mut Context,
    asm: &mut Assembler,
    argc: u16,
    me: &MethodEntry,
    callee: IseqRef,
    body: &IseqBody,
) -> JitResult<CodegenStatus> {
    let exits = env.exits;
    let layout = exits.layout();
    let env_layout = layout.env();
    let recv_depth = i32::from(argc);

    asm.comment("save SP to caller CFP");
    asm.lea(RAX, ctx.stack_opnd(recv_depth))?;
    asm.mov(layout.frame_opnd(CFP, FrameField::Sp), RAX)?;

    asm.comment("save PC to caller CFP");
    asm.mov(RAX, uimm(jit.next_pc()))?;
    asm.mov(layout.frame_opnd(CFP, FrameField::Pc), RAX)?;

    asm.comment("move SP register to callee SP");
    let env_bytes = 8 * env_layout.words();
    asm.add(SP, imm(i64::from(ctx.sp_bytes() + env_bytes)))?;

    asm.comment("push env");
    asm.mov(RAX, uimm(me.entry.0))?;
    asm.mov(mem(SP, env_layout.me_cref), RAX)?;
    asm.mov(
        mem(SP, env_layout.specval),
        uimm(layout.values().block_handler_none),
    )?;
    asm.mov(mem(SP, env_layout.flags), uimm(layout.method_frame_magic()))?;

    asm.comment("push callee control frame");
    asm.sub(CFP, imm(i64::from(layout.frame_size())))?;
    asm.mov(layout.frame_opnd(CFP, FrameField::Sp), SP)?;
    asm.mov(RAX, uimm(callee.0))?;
    asm.mov(layout.frame_opnd(CFP, FrameField::Iseq), RAX)?;
    let self_disp = -8 * (recv_depth + 1) - env_bytes;
    asm.mov(RAX, mem(SP, self_disp))?;
    asm.mov(layout.frame_opnd(CFP, FrameField::SelfValue), RAX)?;
    asm.lea(RAX, mem(SP, env_layout.flags))?;
    asm.mov(layout.frame_opnd(CFP, FrameField::Ep), RAX)?;
    asm.mov(layout.frame_opnd(CFP, FrameField::BlockCode), imm(0))?;
    asm.mov(layout.frame_opnd(CFP, FrameField::Bp), SP)?;
    asm.mov(RAX, uimm(body.start_pc))?;
    asm.mov(layout.frame_opnd(CFP, FrameField::Pc), RAX)?;

    asm.comment("set callee jit_return");
    let landing = ctx.return_landing(argc + 1)?;
    compile_block_stub(
        env,
        jit.iseq,
        jit.next_pc(),
        landing,
        BlockStubKind::ReturnAddress(layout.frame_opnd(CFP, FrameField::JitReturn)),
        asm,
    )?;

    asm.comment("switch to callee CFP");
    asm.mov(layout.context_opnd(EC, ContextField::Cfp), CFP)?;

    asm.comment("jump to callee");
    compile_block_stub(
        env,
        callee,
        body.start_pc,
        Context::default(),
        BlockStubKind::Jump,
        asm,
    )?;
    Ok(CodegenStatus::EndBlock)
}

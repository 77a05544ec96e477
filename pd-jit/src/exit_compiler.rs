//! Code that leaves native execution.
//!
//! Everything here is written to the outlined block. Exits that return to
//! the interpreter restore the callee-saved registers pushed by the entry
//! prologue and return `Qundef` so the caller resumes interpreting at
//! `cfp->pc`.

use std::rc::Rc;

use crate::assembler::{
    Assembler, EDX, ESI, R12, R13, RAX, RBX, RCX, RDI, RDX, R8, R9, RSI, Reg, imm, mem, uimm,
};
use crate::context::Context;
use crate::error::JitResult;
use crate::host::RuntimeEntryPoints;
use crate::insn::Opcode;
use crate::layout::{FrameField, VmLayout};
use crate::stats::{Counter, Counters};
use crate::stub::{BlockStub, BranchSide, BranchStub};

/// Cached interpreter stack pointer.
pub const SP: Reg = RBX;
/// Execution context.
pub const EC: Reg = R12;
/// Current control frame.
pub const CFP: Reg = R13;
pub const C_RET: Reg = RAX;
pub const C_ARGS: [Reg; 6] = [RDI, RSI, RDX, RCX, R8, R9];

pub struct ExitCompiler {
    layout: Rc<VmLayout>,
    counters: Rc<Counters>,
    entry_points: RuntimeEntryPoints,
}

impl ExitCompiler {
    pub fn new(layout: Rc<VmLayout>, counters: Rc<Counters>, entry_points: RuntimeEntryPoints) -> Self {
        Self {
            layout,
            counters,
            entry_points,
        }
    }

    pub fn layout(&self) -> &VmLayout {
        &self.layout
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Exit patched over the start of a block that was invalidated before
    /// any of its instructions ran.
    pub fn compile_entry_exit(
        &self,
        asm: &mut Assembler,
        pc: u64,
        ctx: &Context,
        opcode: Option<Opcode>,
    ) -> JitResult<()> {
        asm.comment("entry exit");
        if let Some(opcode) = opcode {
            self.count(asm, Counter::ExitAt(opcode))?;
        }
        self.save_pc_and_sp(asm, pc, ctx)?;
        self.pop_registers(asm)?;
        asm.mov(RAX, uimm(self.layout.values().qundef))?;
        asm.ret();
        Ok(())
    }

    /// Return path installed as `jit_return` of the frame a compiled entry
    /// was called with. The return value is already in rax.
    pub fn compile_leave_exit(&self, asm: &mut Assembler) -> JitResult<()> {
        asm.comment("leave exit");
        self.pop_registers(asm)?;
        asm.ret();
        Ok(())
    }

    /// Hands a native return value to the runtime, then exits.
    pub fn compile_full_cfunc_return(&self, asm: &mut Assembler) -> JitResult<()> {
        asm.comment("full cfunc return");
        asm.mov(C_ARGS[0], EC)?;
        asm.mov(C_ARGS[1], C_RET)?;
        asm.mov(RAX, uimm(self.entry_points.full_cfunc_return))?;
        asm.call(RAX)?;
        self.pop_registers(asm)?;
        asm.mov(RAX, uimm(self.layout.values().qundef))?;
        asm.ret();
        Ok(())
    }

    /// Deoptimizes to the interpreter at `pc` with the stack described by `ctx`.
    pub fn compile_side_exit(
        &self,
        asm: &mut Assembler,
        pc: u64,
        ctx: &Context,
        opcode: Opcode,
    ) -> JitResult<()> {
        asm.comment(format!("exit to interpreter at {opcode}"));
        self.count(asm, Counter::SideExits)?;
        self.count(asm, Counter::ExitAt(opcode))?;
        self.save_pc_and_sp(asm, pc, ctx)?;
        self.pop_registers(asm)?;
        asm.mov(RAX, uimm(self.layout.values().qundef))?;
        asm.ret();
        Ok(())
    }

    /// Exit for a stub hit that could not be compiled. The trampoline has
    /// already stored pc and sp.
    pub fn compile_stub_fallback(&self, asm: &mut Assembler) -> JitResult<()> {
        asm.comment("stub fallback");
        self.pop_registers(asm)?;
        asm.mov(RAX, uimm(self.layout.values().qundef))?;
        asm.ret();
        Ok(())
    }

    /// Calls `block_stub_hit(ec, id)` and jumps to the address it returns.
    pub fn compile_block_stub(&self, asm: &mut Assembler, stub: &BlockStub) -> JitResult<()> {
        asm.comment(format!("block stub hit: {}", stub.id.0));
        self.save_pc_and_sp(asm, stub.pc, &stub.ctx)?;
        asm.mov(C_ARGS[0], EC)?;
        asm.mov(ESI, uimm(u64::from(stub.id.0)))?;
        asm.mov(RAX, uimm(self.entry_points.block_stub_hit))?;
        asm.call(RAX)?;
        asm.jmp(RAX)?;
        Ok(())
    }

    /// Calls `branch_stub_hit(ec, id, side)` and jumps to the address it returns.
    pub fn compile_branch_stub(
        &self,
        asm: &mut Assembler,
        stub: &BranchStub,
        side: BranchSide,
    ) -> JitResult<()> {
        asm.comment(format!("branch stub hit: {} {:?}", stub.id.0, side));
        self.save_pc_and_sp(asm, stub.target(side).pc, &stub.ctx)?;
        asm.mov(C_ARGS[0], EC)?;
        asm.mov(ESI, uimm(u64::from(stub.id.0)))?;
        asm.mov(EDX, uimm(u64::from(side.index())))?;
        asm.mov(RAX, uimm(self.entry_points.branch_stub_hit))?;
        asm.call(RAX)?;
        asm.jmp(RAX)?;
        Ok(())
    }

    /// Writes `cfp->pc` and `cfp->sp` the way the interpreter would have them.
    pub fn save_pc_and_sp(&self, asm: &mut Assembler, pc: u64, ctx: &Context) -> JitResult<()> {
        asm.mov(RAX, uimm(pc))?;
        asm.mov(self.layout.frame_opnd(CFP, FrameField::Pc), RAX)?;
        if ctx.sp_offset == 0 {
            asm.mov(self.layout.frame_opnd(CFP, FrameField::Sp), SP)?;
        } else {
            asm.lea(RAX, mem(SP, ctx.sp_bytes()))?;
            asm.mov(self.layout.frame_opnd(CFP, FrameField::Sp), RAX)?;
        }
        Ok(())
    }

    pub fn count(&self, asm: &mut Assembler, counter: Counter) -> JitResult<()> {
        if let Some(addr) = self.counters.addr(counter) {
            asm.incr_counter(addr)?;
        }
        Ok(())
    }

    fn pop_registers(&self, asm: &mut Assembler) -> JitResult<()> {
        asm.pop(SP)?;
        asm.pop(EC)?;
        asm.pop(CFP)?;
        Ok(())
    }

    /// `sub SP, 8 * slots` when `slots` is nonzero.
    pub fn move_sp_down(&self, asm: &mut Assembler, slots: u16) -> JitResult<()> {
        if slots > 0 {
            asm.sub(SP, imm(8 * i64::from(slots)))?;
        }
        Ok(())
    }
}

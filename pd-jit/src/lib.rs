pub mod assembler;
pub mod block;
pub mod code_block;
pub mod context;
pub mod error;
pub mod exit_compiler;
pub mod host;
pub mod insn;
pub mod insn_compiler;
pub mod invariants;
pub mod jit;
pub mod layout;
pub mod stats;
pub mod stub;

pub use assembler::{AsmError, AsmResult, Assembler, Label, Marker, Mem, Opnd, Placement, Reg};
pub use block::{Block, BlockId, BlockRegistry};
pub use code_block::{CodeBlock, CodeRegion};
pub use context::{Context, JitState};
pub use error::{JitError, JitResult};
pub use exit_compiler::ExitCompiler;
pub use host::{
    CallFlags, CallInfo, ClassRef, Host, Insn, IseqBody, IseqRef, MethodDef, MethodEntry,
    MethodEntryRef, RuntimeEntryPoints, Value, Visibility,
};
pub use insn::Opcode;
pub use insn_compiler::{CantCompileReason, CodegenStatus};
pub use invariants::{BasicOperator, Condition, Invariants, RedefinitionClass};
pub use jit::{
    InvariantSnapshot, Jit, JitConfig, JitSnapshot, NyiEntry, NyiReference, native_jit_supported,
};
pub use layout::{
    ContextField, EnvLayout, FieldSlot, FrameField, ValueRepr, VmLayout, VmLayoutBuilder,
};
pub use stats::{Counter, CounterSnapshot, Counters};
pub use stub::{BlockStub, BranchStub, Patchable, StubId, StubRegistry};

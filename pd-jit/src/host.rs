//! What the embedding VM supplies to the compiler.

use crate::insn::Opcode;

/// A tagged VM value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct Value(pub u64);

/// Address of an instruction sequence record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct IseqRef(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct ClassRef(pub u64);

/// Address of a callable method entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct MethodEntryRef(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insn {
    pub opcode: Opcode,
    /// Length in words, opcode included.
    pub len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IseqBody {
    /// Address of the first instruction word.
    pub start_pc: u64,
    pub local_table_size: u32,
    pub lead_num: u32,
    /// Only lead (positional) parameters.
    pub simple_params: bool,
}

impl IseqBody {
    /// Locals that are not parameters and would need initialising on entry.
    pub fn extra_locals(&self) -> u32 {
        self.local_table_size.saturating_sub(self.lead_num)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallFlags(pub u32);

impl CallFlags {
    pub const ARGS_SPLAT: u32 = 1 << 0;
    pub const ARGS_BLOCKARG: u32 = 1 << 1;
    pub const FCALL: u32 = 1 << 2;
    pub const VCALL: u32 = 1 << 3;
    pub const ARGS_SIMPLE: u32 = 1 << 4;
    pub const BLOCKISEQ: u32 = 1 << 5;
    pub const KWARG: u32 = 1 << 6;
    pub const KW_SPLAT: u32 = 1 << 7;
    pub const TAILCALL: u32 = 1 << 8;

    pub fn has(self, flag: u32) -> bool {
        self.0 & flag != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallInfo {
    pub mid: u64,
    pub argc: u32,
    pub flags: CallFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Visibility {
    Public,
    Private,
    Protected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodDef {
    Iseq(IseqRef),
    Cfunc,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodEntry {
    pub entry: MethodEntryRef,
    pub visibility: Visibility,
    pub def: MethodDef,
}

/// `extern "C"` entry points in the VM runtime that generated code calls.
///
/// `block_stub_hit(ec, stub_id) -> code address`,
/// `branch_stub_hit(ec, stub_id, side) -> code address` with side 0 for the
/// branch target and 1 for the fallthrough,
/// `full_cfunc_return(ec, value)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeEntryPoints {
    pub block_stub_hit: u64,
    pub branch_stub_hit: u64,
    pub full_cfunc_return: u64,
}

pub trait Host {
    fn decode(&self, iseq: IseqRef, pc: u64) -> Option<Insn>;
    /// The `n`th operand word of the instruction at `pc`.
    fn operand(&self, iseq: IseqRef, pc: u64, n: u32) -> u64;
    /// pc of the interpreter frame the compile was requested from, if it is live.
    fn current_pc(&self) -> Option<u64>;
    /// Reads the interpreter's operand stack without popping. Depth 0 is the top.
    fn peek_stack(&self, depth: u32) -> Option<Value>;
    fn iseq_body(&self, iseq: IseqRef) -> Option<IseqBody>;
    fn call_info(&self, call_data: u64) -> Option<CallInfo>;
    fn class_of(&self, value: Value) -> ClassRef;
    /// Some(object) when `class` is the singleton class of exactly that object.
    fn singleton_object(&self, class: ClassRef) -> Option<Value>;
    fn method_entry(&self, class: ClassRef, mid: u64) -> Option<MethodEntry>;

    fn line_no(&self, _iseq: IseqRef, _pc: u64) -> Option<u32> {
        None
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::HashMap;

    /// Word-encoded instruction sequences plus a fake stack and class table.
    #[derive(Default)]
    pub struct MockHost {
        pub code: HashMap<u64, Vec<u64>>,
        pub bodies: HashMap<u64, IseqBody>,
        pub call_infos: HashMap<u64, CallInfo>,
        pub classes: HashMap<u64, ClassRef>,
        pub singletons: HashMap<u64, Value>,
        pub methods: HashMap<(u64, u64), MethodEntry>,
        pub stack: Vec<Value>,
        pub pc: Option<u64>,
    }

    impl MockHost {
        /// Places `words` at `start` and records a simple method body.
        pub fn with_iseq(iseq: IseqRef, start: u64, words: Vec<u64>, locals: u32) -> Self {
            let mut host = MockHost::default();
            host.add_iseq(iseq, start, words, locals, 0);
            host
        }

        pub fn add_iseq(&mut self, iseq: IseqRef, start: u64, words: Vec<u64>, locals: u32, lead: u32) {
            self.code.insert(start, words);
            self.bodies.insert(
                iseq.0,
                IseqBody {
                    start_pc: start,
                    local_table_size: locals,
                    lead_num: lead,
                    simple_params: true,
                },
            );
        }

        fn word(&self, pc: u64) -> Option<u64> {
            self.code.iter().find_map(|(start, words)| {
                let index = pc.checked_sub(*start)? / 8;
                if pc < *start || (pc - start) % 8 != 0 {
                    return None;
                }
                words.get(index as usize).copied()
            })
        }
    }

    impl Host for MockHost {
        fn decode(&self, _iseq: IseqRef, pc: u64) -> Option<Insn> {
            let opcode = Opcode::from_index(self.word(pc)? as usize)?;
            Some(Insn {
                opcode,
                len: opcode.len(),
            })
        }

        fn operand(&self, _iseq: IseqRef, pc: u64, n: u32) -> u64 {
            self.word(pc + 8 * (n as u64 + 1)).unwrap_or(0)
        }

        fn current_pc(&self) -> Option<u64> {
            self.pc
        }

        fn peek_stack(&self, depth: u32) -> Option<Value> {
            let len = self.stack.len();
            self.stack.get(len.checked_sub(depth as usize + 1)?).copied()
        }

        fn iseq_body(&self, iseq: IseqRef) -> Option<IseqBody> {
            self.bodies.get(&iseq.0).copied()
        }

        fn call_info(&self, call_data: u64) -> Option<CallInfo> {
            self.call_infos.get(&call_data).copied()
        }

        fn class_of(&self, value: Value) -> ClassRef {
            self.classes.get(&value.0).copied().unwrap_or(ClassRef(0))
        }

        fn singleton_object(&self, class: ClassRef) -> Option<Value> {
            self.singletons.get(&class.0).copied()
        }

        fn method_entry(&self, class: ClassRef, mid: u64) -> Option<MethodEntry> {
            self.methods.get(&(class.0, mid)).copied()
        }
    }
}

#![allow(dead_code, unused_imports)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::sync::Once;

pub use jit::{
    BasicOperator, CallFlags, CallInfo, ClassRef, Host, Insn, IseqBody, IseqRef, Jit, JitConfig,
    MethodDef, MethodEntry, MethodEntryRef, Opcode, RedefinitionClass, RuntimeEntryPoints, Value,
    Visibility, VmLayout, native_jit_supported,
};

pub const QFALSE: u64 = 0x00;
pub const QNIL: u64 = 0x08;
pub const QTRUE: u64 = 0x14;
pub const QUNDEF: u64 = 0x34;
const FRAME_MAGIC: u64 = 0x1111_0003;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub fn fix(n: i64) -> u64 {
    ((n << 1) as u64) | 1
}

pub fn op(opcode: Opcode) -> u64 {
    opcode.index() as u64
}

/// Relative branch operand in words.
pub fn rel(words: i64) -> u64 {
    words as u64
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Frame {
    pub pc: u64,
    pub sp: u64,
    pub iseq: u64,
    pub self_value: u64,
    pub ep: u64,
    pub block_code: u64,
    pub bp: u64,
    pub jit_return: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct ExecContext {
    pub vm_stack: u64,
    pub vm_stack_size: u64,
    pub cfp: u64,
    pub errinfo: u64,
    pub interrupt_flag: u32,
    pub interrupt_mask: u32,
}

pub struct IseqDef {
    pub id: IseqRef,
    pub code: Box<[u64]>,
    pub local_table_size: u32,
    pub lead_num: u32,
}

impl IseqDef {
    pub fn start(&self) -> u64 {
        self.code.as_ptr() as u64
    }

    fn word(&self, pc: u64) -> Option<u64> {
        let offset = pc.checked_sub(self.start())?;
        if offset % 8 != 0 {
            return None;
        }
        self.code.get((offset / 8) as usize).copied()
    }
}

#[derive(Default)]
pub struct Program {
    pub iseqs: Vec<IseqDef>,
    pub call_infos: HashMap<u64, CallInfo>,
    pub classes: HashMap<u64, ClassRef>,
    pub singletons: HashMap<u64, Value>,
    pub methods: HashMap<(u64, u64), MethodEntry>,
    next_entry: u64,
}

impl Program {
    pub fn add_iseq(&mut self, code: Vec<u64>, local_table_size: u32, lead_num: u32) -> IseqRef {
        let id = IseqRef(0x1_0000 + self.iseqs.len() as u64);
        self.iseqs.push(IseqDef {
            id,
            code: code.into_boxed_slice(),
            local_table_size,
            lead_num,
        });
        id
    }

    pub fn iseq(&self, id: IseqRef) -> &IseqDef {
        self.iseqs
            .iter()
            .find(|iseq| iseq.id == id)
            .expect("known iseq")
    }

    pub fn start_pc(&self, id: IseqRef) -> u64 {
        self.iseq(id).start()
    }

    pub fn add_call(&mut self, call_data: u64, mid: u64, argc: u32, flags: u32) {
        self.call_infos.insert(
            call_data,
            CallInfo {
                mid,
                argc,
                flags: CallFlags(flags),
            },
        );
    }

    /// Registers `value` as an instance of `class`, the only one when `singleton`.
    pub fn add_object(&mut self, value: u64, class: ClassRef, singleton: bool) {
        self.classes.insert(value, class);
        if singleton {
            self.singletons.insert(class.0, Value(value));
        }
    }

    pub fn define_method(
        &mut self,
        class: ClassRef,
        mid: u64,
        iseq: IseqRef,
        visibility: Visibility,
    ) -> MethodEntryRef {
        self.next_entry += 1;
        let entry = MethodEntryRef(0x9_0000 + self.next_entry);
        self.methods.insert(
            (class.0, mid),
            MethodEntry {
                entry,
                visibility,
                def: MethodDef::Iseq(iseq),
            },
        );
        entry
    }
}

pub type EntryFn = extern "C" fn(*mut ExecContext, *mut Frame) -> u64;

const STACK_WORDS: usize = 4096;
const FRAMES: usize = 256;

/// A tiny VM that shares its frame and stack memory with generated code.
pub struct FakeVm {
    program: RefCell<Program>,
    stack: *mut u64,
    frames: *mut Frame,
    ec: *mut ExecContext,
    jit: RefCell<Option<Jit>>,
    redefined: RefCell<HashSet<BasicOperator>>,
    pub interpreted: Cell<u64>,
    pub native_entries: Cell<u64>,
}

thread_local! {
    static ACTIVE: Cell<*const FakeVm> = const { Cell::new(std::ptr::null()) };
}

struct ActiveGuard(*const FakeVm);

impl ActiveGuard {
    fn enter(vm: &FakeVm) -> Self {
        ActiveGuard(ACTIVE.with(|active| active.replace(vm as *const FakeVm)))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE.with(|active| active.set(self.0));
    }
}

fn with_active<T>(f: impl FnOnce(&FakeVm) -> T) -> T {
    let vm = ACTIVE.with(|active| active.get());
    assert!(!vm.is_null(), "stub hit outside of FakeVm::call");
    f(unsafe { &*vm })
}

extern "C" fn block_stub_hit(_ec: *mut ExecContext, stub: u32) -> u64 {
    with_active(|vm| {
        let mut jit = vm.jit.borrow_mut();
        jit.as_mut().expect("jit").block_stub_hit(vm, stub)
    })
}

extern "C" fn branch_stub_hit(_ec: *mut ExecContext, stub: u32, side: u32) -> u64 {
    with_active(|vm| {
        let mut jit = vm.jit.borrow_mut();
        jit.as_mut().expect("jit").branch_stub_hit(vm, stub, side)
    })
}

extern "C" fn full_cfunc_return(_ec: *mut ExecContext, _value: u64) {}

pub fn entry_points() -> RuntimeEntryPoints {
    RuntimeEntryPoints {
        block_stub_hit: block_stub_hit as usize as u64,
        branch_stub_hit: branch_stub_hit as usize as u64,
        full_cfunc_return: full_cfunc_return as usize as u64,
    }
}

pub fn jit_config() -> JitConfig {
    JitConfig {
        enabled: true,
        stats: true,
        comments: true,
        exec_mem_size: 256 * 1024,
        ..JitConfig::default()
    }
}

enum Step {
    Next,
    EnteredMethod,
    Finished(u64),
}

impl FakeVm {
    pub fn interpreter(program: Program) -> Self {
        Self::build(program, None)
    }

    pub fn with_jit(program: Program, config: JitConfig) -> Self {
        let jit = Jit::new(config, VmLayout::default(), entry_points()).expect("jit");
        Self::build(program, Some(jit))
    }

    fn build(program: Program, jit: Option<Jit>) -> Self {
        let stack = Box::into_raw(vec![0u64; STACK_WORDS].into_boxed_slice()) as *mut u64;
        let frames =
            Box::into_raw(vec![Frame::default(); FRAMES].into_boxed_slice()) as *mut Frame;
        let ec = Box::into_raw(Box::new(ExecContext::default()));
        let vm = FakeVm {
            program: RefCell::new(program),
            stack,
            frames,
            ec,
            jit: RefCell::new(jit),
            redefined: RefCell::new(HashSet::new()),
            interpreted: Cell::new(0),
            native_entries: Cell::new(0),
        };
        unsafe {
            let finish = vm.finish();
            (*finish).sp = stack as u64;
            (*ec).cfp = finish as u64;
        }
        vm
    }

    pub fn jit(&self) -> std::cell::Ref<'_, Option<Jit>> {
        self.jit.borrow()
    }

    fn finish(&self) -> *mut Frame {
        unsafe { self.frames.add(FRAMES - 1) }
    }

    fn cfp(&self) -> *mut Frame {
        unsafe { (*self.ec).cfp as *mut Frame }
    }

    unsafe fn push(&self, frame: *mut Frame, value: u64) {
        unsafe {
            ((*frame).sp as *mut u64).write(value);
            (*frame).sp += 8;
        }
    }

    unsafe fn pop(&self, frame: *mut Frame) -> u64 {
        unsafe {
            (*frame).sp -= 8;
            ((*frame).sp as *const u64).read()
        }
    }

    unsafe fn top(&self, frame: *mut Frame, depth: u32) -> u64 {
        unsafe { ((*frame).sp as *const u64).sub(depth as usize + 1).read() }
    }

    /// Calls `iseq` on `recv` and runs until it returns.
    pub fn call(&self, iseq: IseqRef, recv: u64, args: &[u64]) -> u64 {
        let _active = ActiveGuard::enter(self);
        let finish = self.finish();
        unsafe {
            assert_eq!(self.cfp(), finish, "vm is not idle");
            self.push(finish, recv);
            for arg in args {
                self.push(finish, *arg);
            }
            self.push_method_frame(finish, iseq, args.len() as u32, 0, recv);
            if let Some(value) = self.enter_jit() {
                return value;
            }
            loop {
                match self.step() {
                    Step::Next => {}
                    Step::EnteredMethod => {
                        if let Some(value) = self.enter_jit() {
                            return value;
                        }
                    }
                    Step::Finished(value) => return value,
                }
            }
        }
    }

    pub fn redefine_operator(&self, bop: BasicOperator) {
        self.redefined.borrow_mut().insert(bop);
        if let Some(jit) = self.jit.borrow_mut().as_mut() {
            jit.on_bop_redefined(RedefinitionClass::Integer, bop)
                .expect("invalidate");
        }
    }

    pub fn redefine_method(&self, class: ClassRef, mid: u64, iseq: IseqRef) {
        let old = self
            .program
            .borrow()
            .methods
            .get(&(class.0, mid))
            .copied()
            .expect("method");
        self.program
            .borrow_mut()
            .define_method(class, mid, iseq, old.visibility);
        if let Some(jit) = self.jit.borrow_mut().as_mut() {
            jit.on_method_entry_invalidated(old.entry)
                .expect("invalidate");
        }
    }

    pub fn set_interrupt(&self, pending: bool) {
        unsafe {
            (*self.ec).interrupt_flag = u32::from(pending);
        }
    }

    unsafe fn push_method_frame(
        &self,
        caller: *mut Frame,
        iseq: IseqRef,
        argc: u32,
        return_pc: u64,
        recv: u64,
    ) {
        let program = self.program.borrow();
        let def = program.iseq(iseq);
        let me = program
            .methods
            .values()
            .find(|entry| entry.def == MethodDef::Iseq(iseq))
            .map_or(0, |entry| entry.entry.0);
        unsafe {
            let args_end = (*caller).sp;
            (*caller).sp = args_end - 8 * (u64::from(argc) + 1);
            if caller != self.finish() {
                (*caller).pc = return_pc;
            }
            let mut sp = args_end as *mut u64;
            for _ in 0..def.local_table_size.saturating_sub(def.lead_num) {
                sp.write(QNIL);
                sp = sp.add(1);
            }
            sp.write(me);
            sp.add(1).write(0);
            sp.add(2).write(FRAME_MAGIC);
            let sp = sp.add(3) as u64;
            let callee = caller.sub(1);
            *callee = Frame {
                pc: def.start(),
                sp,
                iseq: iseq.0,
                self_value: recv,
                ep: sp - 8,
                block_code: 0,
                bp: sp,
                jit_return: 0,
            };
            (*self.ec).cfp = callee as u64;
        }
    }

    /// Runs the frame on top natively when the JIT can compile it. Returns
    /// the result once the outermost call has returned.
    unsafe fn enter_jit(&self) -> Option<u64> {
        let cfp = self.cfp();
        let entry = {
            let mut jit = self.jit.borrow_mut();
            let jit = jit.as_mut()?;
            unsafe {
                jit.compile_entry(self, IseqRef((*cfp).iseq), (*cfp).pc, 0)
                    .expect("compile entry")?
            }
        };
        self.native_entries.set(self.native_entries.get() + 1);
        let func: EntryFn = unsafe { std::mem::transmute(entry as usize) };
        let ret = func(self.ec, cfp);
        if ret == QUNDEF {
            return None;
        }
        let caller = self.cfp();
        unsafe {
            self.push(caller, ret);
            if caller == self.finish() {
                return Some(self.pop(caller));
            }
        }
        None
    }

    fn binop(&self, bop: BasicOperator, a: u64, b: u64) -> u64 {
        if self.redefined.borrow().contains(&bop) || a & 1 == 0 || b & 1 == 0 {
            return QNIL;
        }
        let (a, b) = ((a as i64) >> 1, (b as i64) >> 1);
        let fits = |n: i64| (-(1i64 << 62)..(1i64 << 62)).contains(&n);
        match bop {
            BasicOperator::Plus => a.checked_add(b).filter(|n| fits(*n)).map_or(QNIL, fix),
            BasicOperator::Minus => a.checked_sub(b).filter(|n| fits(*n)).map_or(QNIL, fix),
            BasicOperator::Lt => {
                if a < b {
                    QTRUE
                } else {
                    QFALSE
                }
            }
        }
    }

    unsafe fn step(&self) -> Step {
        self.interpreted.set(self.interpreted.get() + 1);
        let cfp = self.cfp();
        unsafe {
            let pc = (*cfp).pc;
            let iseq = IseqRef((*cfp).iseq);
            let insn = self.decode(iseq, pc).expect("decodable pc");
            let operand = |n: u32| self.operand(iseq, pc, n);
            let mut next = pc + 8 * u64::from(insn.len);
            let truthy = |v: u64| v != QFALSE && v != QNIL;
            match insn.opcode {
                Opcode::Nop => {}
                Opcode::Pop => {
                    self.pop(cfp);
                }
                Opcode::Dup => {
                    let value = self.top(cfp, 0);
                    self.push(cfp, value);
                }
                Opcode::Putnil => self.push(cfp, QNIL),
                Opcode::Putself => self.push(cfp, (*cfp).self_value),
                Opcode::Putobject => self.push(cfp, operand(0)),
                Opcode::PutobjectInt2fix0 => self.push(cfp, fix(0)),
                Opcode::PutobjectInt2fix1 => self.push(cfp, fix(1)),
                Opcode::GetlocalWc0 => {
                    let slot = ((*cfp).ep as *const u64).sub(operand(0) as usize);
                    self.push(cfp, slot.read());
                }
                Opcode::SetlocalWc0 => {
                    let value = self.pop(cfp);
                    let slot = ((*cfp).ep as *mut u64).sub(operand(0) as usize);
                    slot.write(value);
                }
                Opcode::OptPlus | Opcode::OptMinus | Opcode::OptLt => {
                    let bop = match insn.opcode {
                        Opcode::OptPlus => BasicOperator::Plus,
                        Opcode::OptMinus => BasicOperator::Minus,
                        _ => BasicOperator::Lt,
                    };
                    let b = self.pop(cfp);
                    let a = self.pop(cfp);
                    self.push(cfp, self.binop(bop, a, b));
                }
                Opcode::Branchunless => {
                    if !truthy(self.pop(cfp)) {
                        next = next.wrapping_add(operand(0).wrapping_mul(8));
                    }
                }
                Opcode::Branchif => {
                    if truthy(self.pop(cfp)) {
                        next = next.wrapping_add(operand(0).wrapping_mul(8));
                    }
                }
                Opcode::Jump => {
                    next = next.wrapping_add(operand(0).wrapping_mul(8));
                }
                Opcode::Leave => {
                    let value = self.pop(cfp);
                    let caller = cfp.add(1);
                    (*self.ec).cfp = caller as u64;
                    self.push(caller, value);
                    if caller == self.finish() {
                        return Step::Finished(self.pop(caller));
                    }
                    return Step::Next;
                }
                Opcode::OptSendWithoutBlock => {
                    let ci = self.call_info(operand(0)).expect("call info");
                    let recv = self.top(cfp, ci.argc);
                    let class = self.class_of(Value(recv));
                    let entry = self.method_entry(class, ci.mid).expect("method");
                    let MethodDef::Iseq(callee) = entry.def else {
                        panic!("fake vm only calls bytecode methods");
                    };
                    self.push_method_frame(cfp, callee, ci.argc, next, recv);
                    return Step::EnteredMethod;
                }
                other => panic!("fake vm cannot interpret {other}"),
            }
            (*cfp).pc = next;
        }
        Step::Next
    }
}

impl Drop for FakeVm {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.stack,
                STACK_WORDS,
            )));
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.frames,
                FRAMES,
            )));
            drop(Box::from_raw(self.ec));
        }
    }
}

impl Host for FakeVm {
    fn decode(&self, iseq: IseqRef, pc: u64) -> Option<Insn> {
        let program = self.program.borrow();
        let word = program.iseq(iseq).word(pc)?;
        let opcode = Opcode::from_index(word as usize)?;
        Some(Insn {
            opcode,
            len: opcode.len(),
        })
    }

    fn operand(&self, iseq: IseqRef, pc: u64, n: u32) -> u64 {
        let program = self.program.borrow();
        program
            .iseq(iseq)
            .word(pc + 8 * (u64::from(n) + 1))
            .unwrap_or(0)
    }

    fn current_pc(&self) -> Option<u64> {
        let cfp = self.cfp();
        if cfp == self.finish() {
            return None;
        }
        Some(unsafe { (*cfp).pc })
    }

    fn peek_stack(&self, depth: u32) -> Option<Value> {
        let cfp = self.cfp();
        if cfp == self.finish() {
            return None;
        }
        Some(Value(unsafe { self.top(cfp, depth) }))
    }

    fn iseq_body(&self, iseq: IseqRef) -> Option<IseqBody> {
        let program = self.program.borrow();
        let def = program.iseqs.iter().find(|def| def.id == iseq)?;
        Some(IseqBody {
            start_pc: def.start(),
            local_table_size: def.local_table_size,
            lead_num: def.lead_num,
            simple_params: true,
        })
    }

    fn call_info(&self, call_data: u64) -> Option<CallInfo> {
        self.program.borrow().call_infos.get(&call_data).copied()
    }

    fn class_of(&self, value: Value) -> ClassRef {
        self.program
            .borrow()
            .classes
            .get(&value.0)
            .copied()
            .unwrap_or(ClassRef(0))
    }

    fn singleton_object(&self, class: ClassRef) -> Option<Value> {
        self.program.borrow().singletons.get(&class.0).copied()
    }

    fn method_entry(&self, class: ClassRef, mid: u64) -> Option<MethodEntry> {
        self.program.borrow().methods.get(&(class.0, mid)).copied()
    }
}

//! Destinations that are linked lazily.
//!
//! A stub's trampoline is written to the outlined block before any inline
//! jump reaches it. Once the real destination exists the inline jump is
//! re-emitted through [`Patchable::apply`] and patched over the old bytes.

use crate::assembler::{AsmResult, Assembler, Mem, RAX, uimm};
use crate::context::Context;
use crate::error::{JitError, JitResult};
use crate::host::IseqRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct StubId(pub u32);

/// Re-emits the inline code that reaches a stub's current destination.
pub trait Patchable {
    fn apply(&self, asm: &mut Assembler) -> AsmResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum BlockStubKind {
    /// `jmp dest`
    Jump,
    /// `jne dest`, the failure edge of a chain guard.
    JumpIfNotEqual,
    /// `movabs rax, dest; mov [slot], rax`, a frame's return address.
    ReturnAddress(Mem),
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BlockStub {
    pub id: StubId,
    pub iseq: IseqRef,
    pub pc: u64,
    pub ctx: Context,
    pub kind: BlockStubKind,
    pub trampoline: u64,
    pub target: Option<u64>,
    pub start_addr: u64,
    pub end_addr: u64,
    /// The target was placed right where the jump was, so there is nothing
    /// left to patch.
    pub inlined: bool,
}

impl BlockStub {
    pub fn destination(&self) -> u64 {
        self.target.unwrap_or(self.trampoline)
    }
}

impl Patchable for BlockStub {
    fn apply(&self, asm: &mut Assembler) -> AsmResult<()> {
        let dest = self.destination();
        asm.stub_start(self.id);
        match self.kind {
            BlockStubKind::Jump => asm.jmp(uimm(dest))?,
            BlockStubKind::JumpIfNotEqual => asm.jne(uimm(dest))?,
            BlockStubKind::ReturnAddress(slot) => {
                asm.movabs(RAX, uimm(dest))?;
                asm.mov(slot, RAX)?;
            }
        }
        asm.stub_end(self.id);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum BranchShape {
    /// Neither target follows the stub: `j<taken> target; jmp fallthrough`.
    Neither,
    /// The branch target follows: `j<not taken> fallthrough`.
    BranchTargetNext,
    /// The fallthrough follows: `j<taken> target`.
    FallthroughNext,
}

/// Which flag state after `test value, ~nil` takes the branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum BranchKind {
    /// Taken on a falsy value (`jz`).
    IfFalsy,
    /// Taken on a truthy value (`jnz`).
    IfTruthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BranchTarget {
    pub pc: u64,
    pub trampoline: u64,
    pub block: Option<u64>,
}

impl BranchTarget {
    pub fn destination(&self) -> u64 {
        self.block.unwrap_or(self.trampoline)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum BranchSide {
    Target,
    Fallthrough,
}

impl BranchSide {
    pub fn from_index(index: u32) -> Option<BranchSide> {
        match index {
            0 => Some(BranchSide::Target),
            1 => Some(BranchSide::Fallthrough),
            _ => None,
        }
    }

    pub fn index(self) -> u32 {
        match self {
            BranchSide::Target => 0,
            BranchSide::Fallthrough => 1,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BranchStub {
    pub id: StubId,
    pub iseq: IseqRef,
    pub ctx: Context,
    pub kind: BranchKind,
    pub branch_target: BranchTarget,
    pub fallthrough: BranchTarget,
    pub shape: BranchShape,
    pub start_addr: u64,
    pub end_addr: u64,
}

impl BranchStub {
    pub fn target(&self, side: BranchSide) -> &BranchTarget {
        match side {
            BranchSide::Target => &self.branch_target,
            BranchSide::Fallthrough => &self.fallthrough,
        }
    }

    pub fn target_mut(&mut self, side: BranchSide) -> &mut BranchTarget {
        match side {
            BranchSide::Target => &mut self.branch_target,
            BranchSide::Fallthrough => &mut self.fallthrough,
        }
    }

    /// Shape that lets `side` fall straight into code placed after the stub.
    pub fn shape_with_next(side: BranchSide) -> BranchShape {
        match side {
            BranchSide::Target => BranchShape::BranchTargetNext,
            BranchSide::Fallthrough => BranchShape::FallthroughNext,
        }
    }

    fn jump_taken(&self, asm: &mut Assembler, dest: u64) -> AsmResult<()> {
        match self.kind {
            BranchKind::IfFalsy => asm.jz(uimm(dest)),
            BranchKind::IfTruthy => asm.jnz(uimm(dest)),
        }
    }

    fn jump_not_taken(&self, asm: &mut Assembler, dest: u64) -> AsmResult<()> {
        match self.kind {
            BranchKind::IfFalsy => asm.jnz(uimm(dest)),
            BranchKind::IfTruthy => asm.jz(uimm(dest)),
        }
    }
}

impl Patchable for BranchStub {
    fn apply(&self, asm: &mut Assembler) -> AsmResult<()> {
        asm.stub_start(self.id);
        match self.shape {
            BranchShape::Neither => {
                asm.comment("neither_next");
                self.jump_taken(asm, self.branch_target.destination())?;
                asm.jmp(uimm(self.fallthrough.destination()))?;
            }
            BranchShape::BranchTargetNext => {
                asm.comment("branch_target_next");
                self.jump_not_taken(asm, self.fallthrough.destination())?;
            }
            BranchShape::FallthroughNext => {
                asm.comment("fallthrough_next");
                self.jump_taken(asm, self.branch_target.destination())?;
            }
        }
        asm.stub_end(self.id);
        Ok(())
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub enum Stub {
    Block(BlockStub),
    Branch(BranchStub),
}

impl Stub {
    pub fn id(&self) -> StubId {
        match self {
            Stub::Block(stub) => stub.id,
            Stub::Branch(stub) => stub.id,
        }
    }

    fn set_range(&mut self, start_addr: u64, end_addr: u64) {
        match self {
            Stub::Block(stub) => {
                stub.start_addr = start_addr;
                stub.end_addr = end_addr;
            }
            Stub::Branch(stub) => {
                stub.start_addr = start_addr;
                stub.end_addr = end_addr;
            }
        }
    }
}

#[derive(Default)]
pub struct StubRegistry {
    stubs: Vec<Stub>,
}

impl StubRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id the next inserted stub will receive.
    pub fn next_id(&self) -> StubId {
        StubId(self.stubs.len() as u32)
    }

    pub fn insert(&mut self, stub: Stub) -> StubId {
        let id = stub.id();
        debug_assert_eq!(id, self.next_id());
        self.stubs.push(stub);
        id
    }

    pub fn get(&self, id: StubId) -> JitResult<&Stub> {
        self.stubs.get(id.0 as usize).ok_or(JitError::UnknownStub(id.0))
    }

    pub fn block(&self, id: StubId) -> JitResult<&BlockStub> {
        match self.get(id)? {
            Stub::Block(stub) => Ok(stub),
            Stub::Branch(_) => Err(JitError::UnknownStub(id.0)),
        }
    }

    pub fn block_mut(&mut self, id: StubId) -> JitResult<&mut BlockStub> {
        match self.stubs.get_mut(id.0 as usize) {
            Some(Stub::Block(stub)) => Ok(stub),
            _ => Err(JitError::UnknownStub(id.0)),
        }
    }

    pub fn branch(&self, id: StubId) -> JitResult<&BranchStub> {
        match self.get(id)? {
            Stub::Branch(stub) => Ok(stub),
            Stub::Block(_) => Err(JitError::UnknownStub(id.0)),
        }
    }

    pub fn branch_mut(&mut self, id: StubId) -> JitResult<&mut BranchStub> {
        match self.stubs.get_mut(id.0 as usize) {
            Some(Stub::Branch(stub)) => Ok(stub),
            _ => Err(JitError::UnknownStub(id.0)),
        }
    }

    /// Records where a stub's inline code landed.
    pub fn place(&mut self, id: StubId, start_addr: u64, end_addr: u64) -> JitResult<()> {
        let stub = self
            .stubs
            .get_mut(id.0 as usize)
            .ok_or(JitError::UnknownStub(id.0))?;
        stub.set_range(start_addr, end_addr);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stub> {
        self.stubs.iter()
    }

    pub fn len(&self) -> usize {
        self.stubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stubs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::{Marker, R13, mem};

    fn assemble(patch: &dyn Patchable, at: u64) -> (Vec<u8>, crate::assembler::Placement) {
        let mut asm = Assembler::new();
        patch.apply(&mut asm).expect("apply");
        let mut out = vec![0u8; asm.len()];
        let placement = asm.assemble(at, &mut out).expect("assemble");
        (out, placement)
    }

    fn branch_stub(shape: BranchShape) -> BranchStub {
        BranchStub {
            id: StubId(4),
            iseq: IseqRef(1),
            ctx: Context::default(),
            kind: BranchKind::IfFalsy,
            branch_target: BranchTarget {
                pc: 0x40,
                trampoline: 0x9000,
                block: None,
            },
            fallthrough: BranchTarget {
                pc: 0x18,
                trampoline: 0x9100,
                block: None,
            },
            shape,
            start_addr: 0,
            end_addr: 0,
        }
    }

    #[test]
    fn branch_shapes_have_fixed_sizes() {
        let (bytes, placement) = assemble(&branch_stub(BranchShape::Neither), 0x1000);
        assert_eq!(bytes.len(), 11);
        assert_eq!(&bytes[..2], &[0x0F, 0x84]);
        assert_eq!(bytes[6], 0xE9);
        assert_eq!(placement.marker(Marker::StubStart(StubId(4))), Some(0x1000));
        assert_eq!(placement.marker(Marker::StubEnd(StubId(4))), Some(0x100B));

        let (bytes, _) = assemble(&branch_stub(BranchShape::BranchTargetNext), 0x1000);
        assert_eq!(bytes.len(), 6);
        assert_eq!(&bytes[..2], &[0x0F, 0x85]);
        let rel = i32::from_le_bytes(bytes[2..6].try_into().expect("rel"));
        assert_eq!(0x1006 + rel as i64, 0x9100);

        let mut stub = branch_stub(BranchShape::FallthroughNext);
        stub.kind = BranchKind::IfTruthy;
        stub.branch_target.block = Some(0x2000);
        let (bytes, _) = assemble(&stub, 0x1000);
        assert_eq!(&bytes[..2], &[0x0F, 0x85]);
        let rel = i32::from_le_bytes(bytes[2..6].try_into().expect("rel"));
        assert_eq!(0x1006 + rel as i64, 0x2000);
    }

    #[test]
    fn block_stub_patch_keeps_length() {
        let mut stub = BlockStub {
            id: StubId(0),
            iseq: IseqRef(1),
            pc: 0x10,
            ctx: Context::default(),
            kind: BlockStubKind::ReturnAddress(mem(R13, -8)),
            trampoline: 0x9000,
            target: None,
            start_addr: 0,
            end_addr: 0,
            inlined: false,
        };
        let (before, _) = assemble(&stub, 0x1000);
        stub.target = Some(0x1234_5678_9ABC);
        let (after, _) = assemble(&stub, 0x1000);
        assert_eq!(before.len(), after.len());
        assert_eq!(&after[2..10], &0x1234_5678_9ABCu64.to_le_bytes());
        assert_eq!(&after[10..], &[0x49, 0x89, 0x45, 0xF8]);

        stub.kind = BlockStubKind::JumpIfNotEqual;
        let (bytes, _) = assemble(&stub, 0x1000);
        assert_eq!(&bytes[..2], &[0x0F, 0x85]);
    }

    #[test]
    fn registry_checks_stub_kinds() {
        let mut stubs = StubRegistry::new();
        let mut stub = branch_stub(BranchShape::Neither);
        stub.id = stubs.next_id();
        let id = stubs.insert(Stub::Branch(stub));
        assert!(stubs.branch(id).is_ok());
        assert_eq!(stubs.block(id).err(), Some(JitError::UnknownStub(0)));
        stubs.place(id, 0x10, 0x1B).expect("place");
        assert_eq!(stubs.branch(id).expect("stub").end_addr, 0x1B);
        assert!(stubs.get(StubId(5)).is_err());
    }
}

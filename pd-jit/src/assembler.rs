//! x86-64 encoder for the handful of instruction forms the compilers need.
//!
//! Every mnemonic pattern-matches its operands against the forms listed in its
//! match arms; anything else is [`AsmError::UnsupportedOperands`]. Jump targets
//! are either absolute addresses (`Opnd::UImm`, encoded rel32) or labels
//! (encoded rel8) and are resolved when the buffer is assembled at its final
//! address.

use crate::block::BlockId;
use crate::stub::StubId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct Reg {
    pub num: u8,
    pub bits: u8,
}

impl Reg {
    const fn r64(num: u8) -> Self {
        Self { num, bits: 64 }
    }

    const fn r32(num: u8) -> Self {
        Self { num, bits: 32 }
    }

    fn low(self) -> u8 {
        self.num & 7
    }

    fn ext(self) -> u8 {
        (self.num >> 3) & 1
    }
}

pub const RAX: Reg = Reg::r64(0);
pub const RCX: Reg = Reg::r64(1);
pub const RDX: Reg = Reg::r64(2);
pub const RBX: Reg = Reg::r64(3);
pub const RSP: Reg = Reg::r64(4);
pub const RBP: Reg = Reg::r64(5);
pub const RSI: Reg = Reg::r64(6);
pub const RDI: Reg = Reg::r64(7);
pub const R8: Reg = Reg::r64(8);
pub const R9: Reg = Reg::r64(9);
pub const R10: Reg = Reg::r64(10);
pub const R11: Reg = Reg::r64(11);
pub const R12: Reg = Reg::r64(12);
pub const R13: Reg = Reg::r64(13);
pub const R14: Reg = Reg::r64(14);
pub const R15: Reg = Reg::r64(15);

pub const EAX: Reg = Reg::r32(0);
pub const ECX: Reg = Reg::r32(1);
pub const EDX: Reg = Reg::r32(2);
pub const ESI: Reg = Reg::r32(6);
pub const EDI: Reg = Reg::r32(7);
pub const R8D: Reg = Reg::r32(8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct Mem {
    pub base: Reg,
    pub disp: i32,
}

pub fn mem(base: Reg, disp: i32) -> Mem {
    Mem { base, disp }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opnd {
    Reg(Reg),
    Mem(Mem),
    Imm(i64),
    UImm(u64),
    Label(Label),
}

pub fn imm(value: i64) -> Opnd {
    Opnd::Imm(value)
}

pub fn uimm(value: u64) -> Opnd {
    Opnd::UImm(value)
}

impl From<Reg> for Opnd {
    fn from(value: Reg) -> Self {
        Opnd::Reg(value)
    }
}

impl From<Mem> for Opnd {
    fn from(value: Mem) -> Self {
        Opnd::Mem(value)
    }
}

impl From<Label> for Opnd {
    fn from(value: Label) -> Self {
        Opnd::Label(value)
    }
}

impl Opnd {
    fn as_i64(self) -> Option<i64> {
        match self {
            Opnd::Imm(value) => Some(value),
            Opnd::UImm(value) => i64::try_from(value).ok(),
            _ => None,
        }
    }

    fn imm8(self) -> Option<i8> {
        self.as_i64().and_then(|value| i8::try_from(value).ok())
    }

    fn imm32(self) -> Option<i32> {
        self.as_i64().and_then(|value| i32::try_from(value).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsmError {
    UnsupportedOperands {
        mnemonic: &'static str,
        operands: String,
    },
    Rel32OutOfRange {
        field: u64,
        target: u64,
    },
    Rel8OutOfRange {
        offset: usize,
        label_offset: usize,
    },
    UnwrittenLabel(usize),
    LabelRewritten(usize),
    DestinationTooSmall {
        needed: usize,
        available: usize,
    },
}

impl std::fmt::Display for AsmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AsmError::UnsupportedOperands { mnemonic, operands } => {
                write!(f, "unimplemented operand form: {mnemonic} {operands}")
            }
            AsmError::Rel32OutOfRange { field, target } => write!(
                f,
                "rel32 field at {field:#x} cannot reach {target:#x}"
            ),
            AsmError::Rel8OutOfRange {
                offset,
                label_offset,
            } => write!(
                f,
                "rel8 field at offset {offset} cannot reach label at offset {label_offset}"
            ),
            AsmError::UnwrittenLabel(label) => write!(f, "label {label} was never written"),
            AsmError::LabelRewritten(label) => write!(f, "label {label} written twice"),
            AsmError::DestinationTooSmall { needed, available } => write!(
                f,
                "destination holds {available} bytes, {needed} needed"
            ),
        }
    }
}

impl std::error::Error for AsmError {}

pub type AsmResult<T> = Result<T, AsmError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    BlockStart(BlockId),
    StubStart(StubId),
    StubEnd(StubId),
}

#[derive(Debug, Clone, Copy)]
enum FixupKind {
    Rel32(u64),
    Rel8(Label),
}

#[derive(Debug, Clone, Copy)]
struct Fixup {
    at: usize,
    kind: FixupKind,
}

/// Where an assembled buffer landed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placement {
    pub start: u64,
    pub end: u64,
    pub markers: Vec<(Marker, u64)>,
    pub comments: Vec<(u64, String)>,
}

impl Placement {
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn marker(&self, marker: Marker) -> Option<u64> {
        self.markers
            .iter()
            .find(|(candidate, _)| *candidate == marker)
            .map(|(_, addr)| *addr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    bytes: usize,
    fixups: usize,
    labels: usize,
    markers: usize,
    comments: usize,
}

#[derive(Debug)]
enum Rm {
    Reg(Reg),
    Mem(Mem),
}

pub struct Assembler {
    bytes: Vec<u8>,
    fixups: Vec<Fixup>,
    labels: Vec<Option<usize>>,
    markers: Vec<(usize, Marker)>,
    comments: Vec<(usize, String)>,
    keep_comments: bool,
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

fn unsupported(mnemonic: &'static str, operands: &[Opnd]) -> AsmError {
    let operands = operands
        .iter()
        .map(|opnd| format!("{opnd:?}"))
        .collect::<Vec<_>>()
        .join(", ");
    AsmError::UnsupportedOperands { mnemonic, operands }
}

impl Assembler {
    pub fn new() -> Self {
        Self::with_comments(false)
    }

    pub fn with_comments(keep_comments: bool) -> Self {
        Self {
            bytes: Vec::new(),
            fixups: Vec::new(),
            labels: Vec::new(),
            markers: Vec::new(),
            comments: Vec::new(),
            keep_comments,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn comment(&mut self, text: impl Into<String>) {
        if self.keep_comments {
            self.comments.push((self.bytes.len(), text.into()));
        }
    }

    pub fn block_start(&mut self, id: BlockId) {
        self.markers.push((self.bytes.len(), Marker::BlockStart(id)));
    }

    pub fn stub_start(&mut self, id: StubId) {
        self.markers.push((self.bytes.len(), Marker::StubStart(id)));
    }

    pub fn stub_end(&mut self, id: StubId) {
        self.markers.push((self.bytes.len(), Marker::StubEnd(id)));
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn write_label(&mut self, label: Label) -> AsmResult<()> {
        let slot = self
            .labels
            .get_mut(label.0)
            .ok_or(AsmError::UnwrittenLabel(label.0))?;
        if slot.is_some() {
            return Err(AsmError::LabelRewritten(label.0));
        }
        *slot = Some(self.bytes.len());
        Ok(())
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            bytes: self.bytes.len(),
            fixups: self.fixups.len(),
            labels: self.labels.len(),
            markers: self.markers.len(),
            comments: self.comments.len(),
        }
    }

    /// Drops everything emitted since `checkpoint`.
    pub fn rewind(&mut self, checkpoint: Checkpoint) {
        self.bytes.truncate(checkpoint.bytes);
        self.fixups.truncate(checkpoint.fixups);
        self.labels.truncate(checkpoint.labels);
        self.markers.truncate(checkpoint.markers);
        self.comments.truncate(checkpoint.comments);
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
        self.fixups.clear();
        self.labels.clear();
        self.markers.clear();
        self.comments.clear();
    }

    /// Resolves markers and fixups against `addr` and copies the result into
    /// `dest`. The buffer is cleared whether or not this succeeds.
    pub fn assemble(&mut self, addr: u64, dest: &mut [u8]) -> AsmResult<Placement> {
        let result = self.resolve(addr).and_then(|(bytes, placement)| {
            if dest.len() < bytes.len() {
                return Err(AsmError::DestinationTooSmall {
                    needed: bytes.len(),
                    available: dest.len(),
                });
            }
            dest[..bytes.len()].copy_from_slice(&bytes);
            Ok(placement)
        });
        self.clear();
        result
    }

    fn resolve(&self, addr: u64) -> AsmResult<(Vec<u8>, Placement)> {
        let markers = self
            .markers
            .iter()
            .map(|(offset, marker)| (*marker, addr + *offset as u64))
            .collect();
        let comments = self
            .comments
            .iter()
            .map(|(offset, text)| (addr + *offset as u64, text.clone()))
            .collect();

        let mut bytes = self.bytes.clone();
        for fixup in &self.fixups {
            match fixup.kind {
                FixupKind::Rel32(target) => {
                    let field = addr + fixup.at as u64;
                    let rel = target as i128 - (field as i128 + 4);
                    let rel = i32::try_from(rel)
                        .map_err(|_| AsmError::Rel32OutOfRange { field, target })?;
                    bytes[fixup.at..fixup.at + 4].copy_from_slice(&rel.to_le_bytes());
                }
                FixupKind::Rel8(label) => {
                    let label_offset = self
                        .labels
                        .get(label.0)
                        .copied()
                        .flatten()
                        .ok_or(AsmError::UnwrittenLabel(label.0))?;
                    let rel = label_offset as i64 - (fixup.at as i64 + 1);
                    let rel = i8::try_from(rel).map_err(|_| AsmError::Rel8OutOfRange {
                        offset: fixup.at,
                        label_offset,
                    })?;
                    bytes[fixup.at] = rel as u8;
                }
            }
        }

        let placement = Placement {
            start: addr,
            end: addr + bytes.len() as u64,
            markers,
            comments,
        };
        Ok((bytes, placement))
    }

    pub fn mov(&mut self, dst: impl Into<Opnd>, src: impl Into<Opnd>) -> AsmResult<()> {
        let (dst, src) = (dst.into(), src.into());
        match (dst, src) {
            (Opnd::Reg(d), Opnd::Reg(s)) if d.bits == 64 && s.bits == 64 => {
                self.emit_rm(true, &[0x8B], d.num, Rm::Reg(s));
            }
            (Opnd::Reg(d), Opnd::Mem(m)) => {
                self.emit_rm(d.bits == 64, &[0x8B], d.num, Rm::Mem(m));
            }
            (Opnd::Mem(m), Opnd::Reg(s)) if s.bits == 64 => {
                self.emit_rm(true, &[0x89], s.num, Rm::Mem(m));
            }
            (Opnd::Reg(d), Opnd::Imm(_) | Opnd::UImm(_)) if d.bits == 32 => {
                let value = match src {
                    Opnd::Imm(value) if i32::try_from(value).is_ok() => value as u32,
                    Opnd::Imm(value) if u32::try_from(value).is_ok() => value as u32,
                    Opnd::UImm(value) if u32::try_from(value).is_ok() => value as u32,
                    _ => return Err(unsupported("mov", &[dst, src])),
                };
                if d.ext() != 0 {
                    self.bytes.push(0x41);
                }
                self.bytes.push(0xB8 + d.low());
                self.bytes.extend_from_slice(&value.to_le_bytes());
            }
            (Opnd::Reg(d), Opnd::Imm(_) | Opnd::UImm(_)) => match src.imm32() {
                Some(value) => {
                    self.emit_rm(true, &[0xC7], 0, Rm::Reg(d));
                    self.bytes.extend_from_slice(&value.to_le_bytes());
                }
                None => return self.movabs(d, src),
            },
            (Opnd::Mem(m), Opnd::Imm(_) | Opnd::UImm(_)) => {
                let value = src.imm32().ok_or_else(|| unsupported("mov", &[dst, src]))?;
                self.emit_rm(true, &[0xC7], 0, Rm::Mem(m));
                self.bytes.extend_from_slice(&value.to_le_bytes());
            }
            _ => return Err(unsupported("mov", &[dst, src])),
        }
        Ok(())
    }

    /// `mov r64, imm64` in its fixed 10-byte form.
    pub fn movabs(&mut self, dst: Reg, src: impl Into<Opnd>) -> AsmResult<()> {
        let src = src.into();
        let value = match src {
            Opnd::Imm(value) if dst.bits == 64 => value as u64,
            Opnd::UImm(value) if dst.bits == 64 => value,
            _ => return Err(unsupported("movabs", &[dst.into(), src])),
        };
        self.bytes.push(0x48 | dst.ext());
        self.bytes.push(0xB8 + dst.low());
        self.bytes.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn add(&mut self, dst: impl Into<Opnd>, src: impl Into<Opnd>) -> AsmResult<()> {
        self.arith("add", 0, 0x01, dst.into(), src.into())
    }

    pub fn sub(&mut self, dst: impl Into<Opnd>, src: impl Into<Opnd>) -> AsmResult<()> {
        self.arith("sub", 5, 0x29, dst.into(), src.into())
    }

    pub fn cmp(&mut self, dst: impl Into<Opnd>, src: impl Into<Opnd>) -> AsmResult<()> {
        self.arith("cmp", 7, 0x39, dst.into(), src.into())
    }

    // 83 /ext ib, 81 /ext id, or <op_rr> /r.
    fn arith(
        &mut self,
        mnemonic: &'static str,
        ext: u8,
        op_rr: u8,
        dst: Opnd,
        src: Opnd,
    ) -> AsmResult<()> {
        let rm = match dst {
            Opnd::Reg(reg) if reg.bits == 64 => Rm::Reg(reg),
            Opnd::Mem(m) => Rm::Mem(m),
            _ => return Err(unsupported(mnemonic, &[dst, src])),
        };
        match src {
            Opnd::Reg(s) if s.bits == 64 => self.emit_rm(true, &[op_rr], s.num, rm),
            Opnd::Imm(_) | Opnd::UImm(_) => {
                if let Some(value) = src.imm8() {
                    self.emit_rm(true, &[0x83], ext, rm);
                    self.bytes.push(value as u8);
                } else if let Some(value) = src.imm32() {
                    self.emit_rm(true, &[0x81], ext, rm);
                    self.bytes.extend_from_slice(&value.to_le_bytes());
                } else {
                    return Err(unsupported(mnemonic, &[dst, src]));
                }
            }
            _ => return Err(unsupported(mnemonic, &[dst, src])),
        }
        Ok(())
    }

    pub fn test(&mut self, left: impl Into<Opnd>, right: impl Into<Opnd>) -> AsmResult<()> {
        let (left, right) = (left.into(), right.into());
        match (left, right) {
            (Opnd::Mem(m), Opnd::Imm(_) | Opnd::UImm(_)) => match right.as_i64() {
                Some(value @ 0..=0xFF) => {
                    self.emit_rm(false, &[0xF6], 0, Rm::Mem(m));
                    self.bytes.push(value as u8);
                }
                _ => {
                    let value = right
                        .imm32()
                        .ok_or_else(|| unsupported("test", &[left, right]))?;
                    self.emit_rm(true, &[0xF7], 0, Rm::Mem(m));
                    self.bytes.extend_from_slice(&value.to_le_bytes());
                }
            },
            (Opnd::Reg(r), Opnd::Imm(_) | Opnd::UImm(_)) if r.bits == 64 => {
                let value = right
                    .imm32()
                    .ok_or_else(|| unsupported("test", &[left, right]))?;
                self.emit_rm(true, &[0xF7], 0, Rm::Reg(r));
                self.bytes.extend_from_slice(&value.to_le_bytes());
            }
            (Opnd::Reg(a), Opnd::Reg(b)) if a.bits == b.bits => {
                self.emit_rm(a.bits == 64, &[0x85], b.num, Rm::Reg(a));
            }
            _ => return Err(unsupported("test", &[left, right])),
        }
        Ok(())
    }

    pub fn cmovl(&mut self, dst: impl Into<Opnd>, src: impl Into<Opnd>) -> AsmResult<()> {
        let (dst, src) = (dst.into(), src.into());
        match (dst, src) {
            (Opnd::Reg(d), Opnd::Reg(s)) if d.bits == 64 && s.bits == 64 => {
                self.emit_rm(true, &[0x0F, 0x4C], d.num, Rm::Reg(s));
                Ok(())
            }
            _ => Err(unsupported("cmovl", &[dst, src])),
        }
    }

    pub fn lea(&mut self, dst: impl Into<Opnd>, src: impl Into<Opnd>) -> AsmResult<()> {
        let (dst, src) = (dst.into(), src.into());
        match (dst, src) {
            (Opnd::Reg(d), Opnd::Mem(m)) if d.bits == 64 => {
                self.emit_rm(true, &[0x8D], d.num, Rm::Mem(m));
                Ok(())
            }
            _ => Err(unsupported("lea", &[dst, src])),
        }
    }

    pub fn jmp(&mut self, target: impl Into<Opnd>) -> AsmResult<()> {
        let target = target.into();
        match target {
            Opnd::UImm(addr) => {
                self.bytes.push(0xE9);
                self.push_rel32(addr);
            }
            Opnd::Label(label) => {
                self.bytes.push(0xEB);
                self.push_rel8(label);
            }
            Opnd::Mem(m) => self.emit_rm(false, &[0xFF], 4, Rm::Mem(m)),
            Opnd::Reg(r) if r.bits == 64 => self.emit_rm(false, &[0xFF], 4, Rm::Reg(r)),
            _ => return Err(unsupported("jmp", &[target])),
        }
        Ok(())
    }

    pub fn jz(&mut self, target: impl Into<Opnd>) -> AsmResult<()> {
        self.jcc("jz", 0x04, target.into())
    }

    pub fn je(&mut self, target: impl Into<Opnd>) -> AsmResult<()> {
        self.jcc("je", 0x04, target.into())
    }

    pub fn jnz(&mut self, target: impl Into<Opnd>) -> AsmResult<()> {
        self.jcc("jnz", 0x05, target.into())
    }

    pub fn jne(&mut self, target: impl Into<Opnd>) -> AsmResult<()> {
        self.jcc("jne", 0x05, target.into())
    }

    pub fn jo(&mut self, target: impl Into<Opnd>) -> AsmResult<()> {
        self.jcc("jo", 0x00, target.into())
    }

    pub fn jl(&mut self, target: impl Into<Opnd>) -> AsmResult<()> {
        self.jcc("jl", 0x0C, target.into())
    }

    pub fn jge(&mut self, target: impl Into<Opnd>) -> AsmResult<()> {
        self.jcc("jge", 0x0D, target.into())
    }

    fn jcc(&mut self, mnemonic: &'static str, cc: u8, target: Opnd) -> AsmResult<()> {
        match target {
            Opnd::UImm(addr) => {
                self.bytes.extend_from_slice(&[0x0F, 0x80 | cc]);
                self.push_rel32(addr);
            }
            Opnd::Label(label) => {
                self.bytes.push(0x70 | cc);
                self.push_rel8(label);
            }
            _ => return Err(unsupported(mnemonic, &[target])),
        }
        Ok(())
    }

    pub fn call(&mut self, target: impl Into<Opnd>) -> AsmResult<()> {
        let target = target.into();
        match target {
            Opnd::UImm(addr) => {
                self.bytes.push(0xE8);
                self.push_rel32(addr);
            }
            Opnd::Reg(r) if r.bits == 64 => self.emit_rm(false, &[0xFF], 2, Rm::Reg(r)),
            _ => return Err(unsupported("call", &[target])),
        }
        Ok(())
    }

    pub fn push(&mut self, reg: Reg) -> AsmResult<()> {
        self.push_pop("push", 0x50, reg)
    }

    pub fn pop(&mut self, reg: Reg) -> AsmResult<()> {
        self.push_pop("pop", 0x58, reg)
    }

    fn push_pop(&mut self, mnemonic: &'static str, base: u8, reg: Reg) -> AsmResult<()> {
        if reg.bits != 64 {
            return Err(unsupported(mnemonic, &[reg.into()]));
        }
        if reg.ext() != 0 {
            self.bytes.push(0x41);
        }
        self.bytes.push(base + reg.low());
        Ok(())
    }

    pub fn ret(&mut self) {
        self.bytes.push(0xC3);
    }

    pub fn nop(&mut self) {
        self.bytes.push(0x90);
    }

    /// `mov rax, counter; lock add qword [rax], 1`. Clobbers rax.
    pub fn incr_counter(&mut self, counter: u64) -> AsmResult<()> {
        self.mov(RAX, uimm(counter))?;
        self.bytes.push(0xF0);
        self.add(mem(RAX, 0), imm(1))
    }

    fn push_rel32(&mut self, target: u64) {
        self.fixups.push(Fixup {
            at: self.bytes.len(),
            kind: FixupKind::Rel32(target),
        });
        self.bytes.extend_from_slice(&[0; 4]);
    }

    fn push_rel8(&mut self, label: Label) {
        self.fixups.push(Fixup {
            at: self.bytes.len(),
            kind: FixupKind::Rel8(label),
        });
        self.bytes.push(0);
    }

    fn emit_rm(&mut self, wide: bool, opcode: &[u8], reg: u8, rm: Rm) {
        let base_ext = match &rm {
            Rm::Reg(r) => r.ext(),
            Rm::Mem(m) => m.base.ext(),
        };
        let rex = 0x40 | (u8::from(wide) << 3) | (((reg >> 3) & 1) << 2) | base_ext;
        if rex != 0x40 {
            self.bytes.push(rex);
        }
        self.bytes.extend_from_slice(opcode);
        let reg = (reg & 7) << 3;
        match rm {
            Rm::Reg(r) => self.bytes.push(0xC0 | reg | r.low()),
            Rm::Mem(m) => {
                let base = m.base.low();
                // rbp/r13 with mod 00 means rip-relative, so force a disp8.
                let (mode, disp8) = if m.disp == 0 && base != 5 {
                    (0x00, None)
                } else if let Ok(disp) = i8::try_from(m.disp) {
                    (0x40, Some(disp))
                } else {
                    (0x80, None)
                };
                self.bytes.push(mode | reg | base);
                // rsp/r12 need a SIB byte.
                if base == 4 {
                    self.bytes.push(0x24);
                }
                match (mode, disp8) {
                    (0x40, Some(disp)) => self.bytes.push(disp as u8),
                    (0x80, _) => self.bytes.extend_from_slice(&m.disp.to_le_bytes()),
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x1000;

    fn encode(build: impl FnOnce(&mut Assembler) -> AsmResult<()>) -> Vec<u8> {
        let mut asm = Assembler::new();
        build(&mut asm).expect("encode");
        let mut out = vec![0u8; asm.len()];
        asm.assemble(BASE, &mut out).expect("assemble");
        out
    }

    #[test]
    fn mov_forms() {
        assert_eq!(encode(|a| a.mov(RDI, R12)), [0x49, 0x8B, 0xFC]);
        assert_eq!(encode(|a| a.mov(R12, RDI)), [0x4C, 0x8B, 0xE7]);
        assert_eq!(encode(|a| a.mov(R13, RSI)), [0x4C, 0x8B, 0xEE]);
        assert_eq!(
            encode(|a| a.mov(EAX, mem(R12, 0x20))),
            [0x41, 0x8B, 0x44, 0x24, 0x20]
        );
        assert_eq!(encode(|a| a.mov(mem(R13, 0), RAX)), [0x49, 0x89, 0x45, 0x00]);
        assert_eq!(encode(|a| a.mov(RBX, mem(R13, 8))), [0x49, 0x8B, 0x5D, 0x08]);
        assert_eq!(encode(|a| a.mov(RAX, mem(RBX, 0))), [0x48, 0x8B, 0x03]);
        assert_eq!(
            encode(|a| a.mov(RAX, mem(RBX, 0x100))),
            [0x48, 0x8B, 0x83, 0x00, 0x01, 0x00, 0x00]
        );
        assert_eq!(
            encode(|a| a.mov(RAX, imm(0x34))),
            [0x48, 0xC7, 0xC0, 0x34, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            encode(|a| a.mov(RAX, imm(-1))),
            [0x48, 0xC7, 0xC0, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(
            encode(|a| a.mov(ESI, imm(3))),
            [0xBE, 0x03, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            encode(|a| a.mov(R8D, uimm(0xFFFF_FFFF))),
            [0x41, 0xB8, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(
            encode(|a| a.mov(mem(RBX, 0), imm(8))),
            [0x48, 0xC7, 0x03, 0x08, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            encode(|a| a.mov(mem(RSP, 8), imm(0))),
            [0x48, 0xC7, 0x44, 0x24, 0x08, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn mov_wide_immediates_use_imm64() {
        assert_eq!(
            encode(|a| a.mov(RAX, uimm(0x1122_3344_5566_7788))),
            [0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
        assert_eq!(
            encode(|a| a.movabs(R11, uimm(1))),
            [0x49, 0xBB, 0x01, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn arith_forms() {
        assert_eq!(encode(|a| a.add(RBX, imm(8))), [0x48, 0x83, 0xC3, 0x08]);
        assert_eq!(
            encode(|a| a.add(RBX, imm(0x200))),
            [0x48, 0x81, 0xC3, 0x00, 0x02, 0x00, 0x00]
        );
        assert_eq!(encode(|a| a.add(RAX, RCX)), [0x48, 0x01, 0xC8]);
        assert_eq!(encode(|a| a.add(mem(RAX, 0), imm(1))), [0x48, 0x83, 0x00, 0x01]);
        assert_eq!(encode(|a| a.sub(R13, imm(64))), [0x49, 0x83, 0xED, 0x40]);
        assert_eq!(encode(|a| a.sub(RAX, RCX)), [0x48, 0x29, 0xC8]);
        assert_eq!(encode(|a| a.cmp(RAX, RCX)), [0x48, 0x39, 0xC8]);
        assert_eq!(
            encode(|a| a.cmp(mem(RBX, -8), RAX)),
            [0x48, 0x39, 0x43, 0xF8]
        );
    }

    #[test]
    fn test_and_misc_forms() {
        assert_eq!(
            encode(|a| a.test(mem(RBX, 8), imm(1))),
            [0xF6, 0x43, 0x08, 0x01]
        );
        assert_eq!(
            encode(|a| a.test(mem(RBX, -8), imm(-9))),
            [0x48, 0xF7, 0x43, 0xF8, 0xF7, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(encode(|a| a.test(EAX, EAX)), [0x85, 0xC0]);
        assert_eq!(
            encode(|a| a.test(RAX, imm(-9))),
            [0x48, 0xF7, 0xC0, 0xF7, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(encode(|a| a.cmovl(RAX, RCX)), [0x48, 0x0F, 0x4C, 0xC1]);
        assert_eq!(encode(|a| a.lea(RAX, mem(R13, 64))), [0x49, 0x8D, 0x45, 0x40]);
        assert_eq!(encode(|a| a.jmp(mem(R13, -8))), [0x41, 0xFF, 0x65, 0xF8]);
        assert_eq!(encode(|a| a.jmp(RAX)), [0xFF, 0xE0]);
        assert_eq!(encode(|a| a.call(RAX)), [0xFF, 0xD0]);
        assert_eq!(encode(|a| a.push(R13)), [0x41, 0x55]);
        assert_eq!(encode(|a| a.push(RBX)), [0x53]);
        assert_eq!(encode(|a| a.pop(R12)), [0x41, 0x5C]);
        assert_eq!(
            encode(|a| {
                a.ret();
                Ok(())
            }),
            [0xC3]
        );
        assert_eq!(
            encode(|a| a.incr_counter(0x2000)),
            [0x48, 0xC7, 0xC0, 0x00, 0x20, 0x00, 0x00, 0xF0, 0x48, 0x83, 0x00, 0x01]
        );
    }

    #[test]
    fn unsupported_forms_are_errors() {
        let mut asm = Assembler::new();
        assert!(matches!(
            asm.mov(mem(RAX, 0), mem(RBX, 0)),
            Err(AsmError::UnsupportedOperands { mnemonic: "mov", .. })
        ));
        assert!(asm.mov(mem(RAX, 0), uimm(0x1_0000_0000)).is_err());
        assert!(asm.cmovl(RAX, mem(RBX, 0)).is_err());
        assert!(asm.jmp(imm(3)).is_err());
        assert!(asm.jo(RAX).is_err());
        assert!(asm.push(EAX).is_err());
        assert!(asm.add(RAX, uimm(u64::MAX)).is_err());
        assert!(asm.is_empty());
    }

    #[test]
    fn rel32_forward_and_backward() {
        let mut asm = Assembler::new();
        asm.jmp(uimm(BASE + 0x100)).expect("jmp");
        asm.jz(uimm(BASE - 0x10)).expect("jz");
        let mut out = vec![0u8; asm.len()];
        asm.assemble(BASE, &mut out).expect("assemble");
        assert_eq!(out[0], 0xE9);
        let rel = i32::from_le_bytes(out[1..5].try_into().expect("rel"));
        assert_eq!(rel as i64, 0x100 - 5);
        assert_eq!(&out[5..7], &[0x0F, 0x84]);
        let rel = i32::from_le_bytes(out[7..11].try_into().expect("rel"));
        assert_eq!(rel as i64, -0x10 - 11);
    }

    #[test]
    fn rel32_range_limits() {
        let base: u64 = 0x1_0000_0000;
        // field at base + 1, next instruction at base + 5
        let far = base + 5;
        let reach = |target: u64| {
            let mut asm = Assembler::new();
            asm.jmp(uimm(target)).expect("jmp");
            let mut out = [0u8; 5];
            asm.assemble(base, &mut out)
        };
        assert!(reach(far + i32::MAX as u64).is_ok());
        assert!(matches!(
            reach(far + i32::MAX as u64 + 1),
            Err(AsmError::Rel32OutOfRange { .. })
        ));
        assert!(reach(far - (1u64 << 31)).is_ok());
        assert!(matches!(
            reach(far - (1u64 << 31) - 1),
            Err(AsmError::Rel32OutOfRange { .. })
        ));
    }

    fn near_jump(fill_before: usize, fill_after: usize) -> AsmResult<Vec<u8>> {
        let mut asm = Assembler::new();
        let label = asm.new_label();
        if fill_before > 0 {
            asm.write_label(label)?;
        }
        for _ in 0..fill_before {
            asm.ret();
        }
        asm.jmp(label)?;
        for _ in 0..fill_after {
            asm.ret();
        }
        if fill_before == 0 {
            asm.write_label(label)?;
        }
        let mut out = vec![0u8; asm.len()];
        asm.assemble(BASE, &mut out)?;
        Ok(out)
    }

    #[test]
    fn rel8_range_limits() {
        let out = near_jump(0, 127).expect("forward 127");
        assert_eq!(&out[..2], &[0xEB, 127]);
        assert!(matches!(
            near_jump(0, 128),
            Err(AsmError::Rel8OutOfRange { .. })
        ));
        // jmp at offset 126, field at 127, next byte at 128; label at 0 -> -128
        let out = near_jump(126, 0).expect("backward 128");
        assert_eq!(&out[126..], &[0xEB, 0x80]);
        assert!(matches!(
            near_jump(127, 0),
            Err(AsmError::Rel8OutOfRange { .. })
        ));
    }

    #[test]
    fn assemble_clears_buffer_on_failure() {
        let mut asm = Assembler::new();
        let label = asm.new_label();
        asm.jnz(label).expect("jnz");
        let mut out = [0u8; 2];
        assert_eq!(
            asm.assemble(BASE, &mut out),
            Err(AsmError::UnwrittenLabel(0))
        );
        assert!(asm.is_empty());
        assert_eq!(out, [0, 0]);

        asm.ret();
        asm.ret();
        let mut small = [0u8; 1];
        assert!(matches!(
            asm.assemble(BASE, &mut small),
            Err(AsmError::DestinationTooSmall { needed: 2, available: 1 })
        ));
        assert!(asm.is_empty());
    }

    #[test]
    fn markers_resolve_to_absolute_addresses() {
        let mut asm = Assembler::with_comments(true);
        asm.block_start(BlockId(7));
        asm.comment("entry");
        asm.push(RBX).expect("push");
        asm.stub_start(StubId(3));
        asm.ret();
        asm.stub_end(StubId(3));
        let mut out = [0u8; 2];
        let placement = asm.assemble(BASE, &mut out).expect("assemble");
        assert_eq!(placement.marker(Marker::BlockStart(BlockId(7))), Some(BASE));
        assert_eq!(placement.marker(Marker::StubStart(StubId(3))), Some(BASE + 1));
        assert_eq!(placement.marker(Marker::StubEnd(StubId(3))), Some(BASE + 2));
        assert_eq!(placement.comments, vec![(BASE, "entry".to_string())]);
        assert_eq!(placement.len(), 2);
    }

    #[test]
    fn rewind_discards_partial_emission() {
        let mut asm = Assembler::new();
        asm.push(RBX).expect("push");
        let checkpoint = asm.checkpoint();
        let label = asm.new_label();
        asm.jz(label).expect("jz");
        asm.stub_start(StubId(1));
        asm.rewind(checkpoint);
        assert_eq!(asm.len(), 1);
        let mut out = [0u8; 1];
        let placement = asm.assemble(BASE, &mut out).expect("assemble");
        assert!(placement.markers.is_empty());
        assert_eq!(out, [0x53]);
    }
}

//! Host VM frame and execution-context layout, supplied once at startup.

use crate::assembler::{Mem, Reg, mem};
use crate::error::{JitError, JitResult};
use crate::host::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum FrameField {
    Pc,
    Sp,
    Iseq,
    SelfValue,
    Ep,
    BlockCode,
    Bp,
    JitReturn,
}

impl FrameField {
    pub const ALL: [FrameField; 8] = [
        FrameField::Pc,
        FrameField::Sp,
        FrameField::Iseq,
        FrameField::SelfValue,
        FrameField::Ep,
        FrameField::BlockCode,
        FrameField::Bp,
        FrameField::JitReturn,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FrameField::Pc => "pc",
            FrameField::Sp => "sp",
            FrameField::Iseq => "iseq",
            FrameField::SelfValue => "self",
            FrameField::Ep => "ep",
            FrameField::BlockCode => "block_code",
            FrameField::Bp => "bp",
            FrameField::JitReturn => "jit_return",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ContextField {
    Cfp,
    InterruptFlag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct FieldSlot {
    pub offset: i32,
    pub size: u8,
}

impl FieldSlot {
    pub const fn word(offset: i32) -> Self {
        Self { offset, size: 8 }
    }
}

/// Tagged value encoding shared with the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ValueRepr {
    pub fixnum_flag: u64,
    pub qfalse: u64,
    pub qnil: u64,
    pub qtrue: u64,
    pub qundef: u64,
    pub block_handler_none: u64,
}

impl ValueRepr {
    pub fn is_fixnum(&self, value: Value) -> bool {
        value.0 & self.fixnum_flag != 0
    }

    pub fn fixnum(&self, n: i64) -> Value {
        Value(((n << 1) as u64) | self.fixnum_flag)
    }

    pub fn fixnum_value(&self, value: Value) -> Option<i64> {
        self.is_fixnum(value).then_some((value.0 as i64) >> 1)
    }

    /// Truthiness mask: only `qfalse` and `qnil` test zero against it.
    pub fn falsy_mask(&self) -> i64 {
        !(self.qnil as i64)
    }

    pub fn is_truthy(&self, value: Value) -> bool {
        value.0 != self.qfalse && value.0 != self.qnil
    }
}

/// Environment slots pushed under a method frame, as offsets from the
/// frame's initial sp. `ep` points at the `flags` slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct EnvLayout {
    pub me_cref: i32,
    pub specval: i32,
    pub flags: i32,
    /// Flag bit set once the env escaped and stores need a write barrier.
    pub wb_required: u64,
}

impl EnvLayout {
    /// Words pushed between the last argument and the callee's sp.
    pub fn words(&self) -> i32 {
        -self.me_cref / 8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct VmLayout {
    version: u32,
    frame_size: i32,
    frame: [FieldSlot; 8],
    cfp: FieldSlot,
    interrupt_flag: FieldSlot,
    env: EnvLayout,
    method_frame_magic: u64,
    values: ValueRepr,
}

pub struct VmLayoutBuilder {
    pub version: u32,
    pub frame_size: i32,
    pub frame: [FieldSlot; 8],
    pub cfp: FieldSlot,
    pub interrupt_flag: FieldSlot,
    pub env: EnvLayout,
    pub method_frame_magic: u64,
    pub values: ValueRepr,
}

impl Default for VmLayoutBuilder {
    fn default() -> Self {
        Self {
            version: 1,
            frame_size: 64,
            frame: [
                FieldSlot::word(0),
                FieldSlot::word(8),
                FieldSlot::word(16),
                FieldSlot::word(24),
                FieldSlot::word(32),
                FieldSlot::word(40),
                FieldSlot::word(48),
                FieldSlot::word(56),
            ],
            cfp: FieldSlot::word(16),
            interrupt_flag: FieldSlot {
                offset: 32,
                size: 4,
            },
            env: EnvLayout {
                me_cref: -24,
                specval: -16,
                flags: -8,
                wb_required: 0x0008,
            },
            // VM_FRAME_MAGIC_METHOD | VM_ENV_FLAG_LOCAL
            method_frame_magic: 0x1111_0003,
            values: ValueRepr {
                fixnum_flag: 0x01,
                qfalse: 0x00,
                qnil: 0x08,
                qtrue: 0x14,
                qundef: 0x34,
                block_handler_none: 0,
            },
        }
    }
}

impl VmLayoutBuilder {
    pub fn build(self) -> JitResult<VmLayout> {
        if self.version == 0 {
            return Err(JitError::Layout("layout version must be nonzero".to_string()));
        }
        if self.frame_size <= 0 || self.frame_size % 8 != 0 {
            return Err(JitError::Layout(format!(
                "frame size {} must be a positive multiple of 8",
                self.frame_size
            )));
        }
        for (field, slot) in FrameField::ALL.iter().zip(self.frame.iter()) {
            if slot.size != 8 || slot.offset < 0 || slot.offset + 8 > self.frame_size {
                return Err(JitError::Layout(format!(
                    "frame field {} at offset {} does not fit a {}-byte frame",
                    field.name(),
                    slot.offset,
                    self.frame_size
                )));
            }
        }
        for (i, a) in self.frame.iter().enumerate() {
            for b in &self.frame[i + 1..] {
                if (a.offset - b.offset).abs() < 8 {
                    return Err(JitError::Layout(format!(
                        "frame fields at offsets {} and {} overlap",
                        a.offset, b.offset
                    )));
                }
            }
        }
        if self.cfp.size != 8 {
            return Err(JitError::Layout("ec->cfp must be a word".to_string()));
        }
        if self.interrupt_flag.size != 4 {
            return Err(JitError::Layout(
                "ec->interrupt_flag must be 32 bits".to_string(),
            ));
        }
        let env = [self.env.me_cref, self.env.specval, self.env.flags];
        if env.iter().any(|offset| *offset >= 0 || offset % 8 != 0)
            || env.iter().any(|offset| *offset < self.env.me_cref)
        {
            return Err(JitError::Layout(
                "env slots must be negative word offsets from sp".to_string(),
            ));
        }
        if self.values.fixnum_flag == 0 || self.values.qfalse != 0 {
            return Err(JitError::Layout(
                "value representation needs a fixnum tag and a zero false".to_string(),
            ));
        }
        Ok(VmLayout {
            version: self.version,
            frame_size: self.frame_size,
            frame: self.frame,
            cfp: self.cfp,
            interrupt_flag: self.interrupt_flag,
            env: self.env,
            method_frame_magic: self.method_frame_magic,
            values: self.values,
        })
    }
}

impl Default for VmLayout {
    fn default() -> Self {
        let builder = VmLayoutBuilder::default();
        VmLayout {
            version: builder.version,
            frame_size: builder.frame_size,
            frame: builder.frame,
            cfp: builder.cfp,
            interrupt_flag: builder.interrupt_flag,
            env: builder.env,
            method_frame_magic: builder.method_frame_magic,
            values: builder.values,
        }
    }
}

impl VmLayout {
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn frame_size(&self) -> i32 {
        self.frame_size
    }

    pub fn field(&self, field: FrameField) -> FieldSlot {
        self.frame[field as usize]
    }

    /// Operand for `field` of the frame held in `base`.
    pub fn frame_opnd(&self, base: Reg, field: FrameField) -> Mem {
        mem(base, self.field(field).offset)
    }

    /// `field` of the frame `frames` slots above (towards the caller) the one in `base`.
    pub fn frame_opnd_at(&self, base: Reg, frames: i32, field: FrameField) -> Mem {
        mem(base, frames * self.frame_size + self.field(field).offset)
    }

    pub fn context_opnd(&self, base: Reg, field: ContextField) -> Mem {
        match field {
            ContextField::Cfp => mem(base, self.cfp.offset),
            ContextField::InterruptFlag => mem(base, self.interrupt_flag.offset),
        }
    }

    pub fn env(&self) -> EnvLayout {
        self.env
    }

    pub fn method_frame_magic(&self) -> u64 {
        self.method_frame_magic
    }

    pub fn values(&self) -> &ValueRepr {
        &self.values
    }
}

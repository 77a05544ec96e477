use crate::assembler::AsmError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JitError {
    Asm(AsmError),
    CodeBlockFull { requested: usize, remaining: usize },
    PatchOutOfRange { addr: u64 },
    Memory(String),
    Layout(String),
    Config(String),
    StackUnderflow,
    StackOverflow,
    UnknownStub(u32),
    UnknownBlock(u32),
    Host(String),
    Serialize(String),
}

impl std::fmt::Display for JitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JitError::Asm(err) => write!(f, "assembler error: {err}"),
            JitError::CodeBlockFull {
                requested,
                remaining,
            } => write!(
                f,
                "code block exhausted: requested {requested} bytes, {remaining} remaining"
            ),
            JitError::PatchOutOfRange { addr } => {
                write!(f, "patch at {addr:#x} is outside the written code range")
            }
            JitError::Memory(message) => write!(f, "executable memory error: {message}"),
            JitError::Layout(message) => write!(f, "invalid vm layout: {message}"),
            JitError::Config(message) => write!(f, "invalid jit config: {message}"),
            JitError::StackUnderflow => write!(f, "compile-time stack underflow"),
            JitError::StackOverflow => write!(f, "compile-time stack depth overflow"),
            JitError::UnknownStub(id) => write!(f, "unknown stub {id}"),
            JitError::UnknownBlock(id) => write!(f, "unknown block {id}"),
            JitError::Host(message) => write!(f, "host error: {message}"),
            JitError::Serialize(message) => write!(f, "snapshot serialization failed: {message}"),
        }
    }
}

impl std::error::Error for JitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            JitError::Asm(err) => Some(err),
            _ => None,
        }
    }
}

impl From<AsmError> for JitError {
    fn from(value: AsmError) -> Self {
        JitError::Asm(value)
    }
}

pub type JitResult<T> = Result<T, JitError>;

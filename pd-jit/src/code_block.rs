//! Executable memory arena.
//!
//! One mapping is split into an inline half and an outlined half so every
//! jump between them fits a rel32. Each half has a write cursor that only
//! moves forward, except [`CodeBlock::rewrite_tail`] which may replace a tail
//! that nothing jumps to yet. Bytes below the cursor only change through
//! [`CodeBlock::patch`].

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::assembler::{Assembler, Placement};
use crate::error::{JitError, JitResult};

struct CodeMemory {
    ptr: *mut u8,
    len: usize,
    mapped: bool,
}

impl CodeMemory {
    fn heap(len: usize) -> Self {
        let boxed = vec![0u8; len].into_boxed_slice();
        let ptr = Box::into_raw(boxed) as *mut u8;
        Self {
            ptr,
            len,
            mapped: false,
        }
    }

    #[cfg(unix)]
    fn map(len: usize) -> JitResult<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(JitError::Memory(format!(
                "mmap failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self {
            ptr: ptr as *mut u8,
            len,
            mapped: true,
        })
    }

    #[cfg(not(unix))]
    fn map(_len: usize) -> JitResult<Self> {
        Err(JitError::Memory(
            "executable memory allocation not implemented for this platform".to_string(),
        ))
    }

    fn base(&self) -> u64 {
        self.ptr as u64
    }

    /// Runs `write` over `[offset, offset + len)` with the covering pages
    /// writable, then flips them back to read+execute.
    fn with_writable<T>(
        &self,
        offset: usize,
        len: usize,
        write: impl FnOnce(&mut [u8]) -> T,
    ) -> JitResult<T> {
        if offset + len > self.len {
            return Err(JitError::Memory(format!(
                "write of {len} bytes at offset {offset} exceeds {} byte region",
                self.len
            )));
        }
        self.protect(offset, len, false)?;
        let dest = unsafe { std::slice::from_raw_parts_mut(self.ptr.add(offset), len) };
        let result = write(dest);
        self.protect(offset, len, true)?;
        Ok(result)
    }

    #[cfg(unix)]
    fn protect(&self, offset: usize, len: usize, executable: bool) -> JitResult<()> {
        if !self.mapped || len == 0 {
            return Ok(());
        }
        let page = page_size();
        let start = (offset / page) * page;
        let end = (offset + len).div_ceil(page) * page;
        let prot = if executable {
            libc::PROT_READ | libc::PROT_EXEC
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        let rc = unsafe { libc::mprotect(self.ptr.add(start) as *mut _, end - start, prot) };
        if rc != 0 {
            return Err(JitError::Memory(format!(
                "mprotect failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn protect(&self, _offset: usize, _len: usize, _executable: bool) -> JitResult<()> {
        Ok(())
    }

    fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        let len = len.min(self.len.saturating_sub(offset));
        unsafe { std::slice::from_raw_parts(self.ptr.add(offset), len) }.to_vec()
    }
}

impl Drop for CodeMemory {
    fn drop(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        if self.mapped {
            #[cfg(unix)]
            unsafe {
                libc::munmap(self.ptr as *mut _, self.len);
            }
            return;
        }
        let slice = std::ptr::slice_from_raw_parts_mut(self.ptr, self.len);
        drop(unsafe { Box::from_raw(slice) });
    }
}

#[cfg(unix)]
fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

#[cfg(not(unix))]
fn page_size() -> usize {
    4096
}

/// Splits one allocation into an inline and an outlined [`CodeBlock`].
pub struct CodeRegion;

impl CodeRegion {
    /// Maps `size` bytes (rounded up to whole pages, at least two).
    pub fn new(size: usize, keep_comments: bool) -> JitResult<(CodeBlock, CodeBlock)> {
        let page = page_size();
        let half = size.div_ceil(2).div_ceil(page).max(1) * page;
        let memory = Rc::new(CodeMemory::map(half * 2)?);
        tracing::debug!(bytes = half * 2, "mapped jit code region");
        Ok(Self::split(memory, half, keep_comments))
    }

    /// Plain heap memory. Code written here is never executable.
    pub fn heap(size: usize, keep_comments: bool) -> (CodeBlock, CodeBlock) {
        let half = size.div_ceil(2);
        let memory = Rc::new(CodeMemory::heap(half * 2));
        Self::split(memory, half, keep_comments)
    }

    fn split(memory: Rc<CodeMemory>, half: usize, keep_comments: bool) -> (CodeBlock, CodeBlock) {
        let inline = CodeBlock::new(Rc::clone(&memory), "inline", 0, half, keep_comments);
        let outlined = CodeBlock::new(memory, "outlined", half, half, keep_comments);
        (inline, outlined)
    }
}

pub struct CodeBlock {
    memory: Rc<CodeMemory>,
    name: &'static str,
    offset: usize,
    capacity: usize,
    write_pos: usize,
    keep_comments: bool,
    comments: BTreeMap<u64, Vec<String>>,
}

impl CodeBlock {
    fn new(
        memory: Rc<CodeMemory>,
        name: &'static str,
        offset: usize,
        capacity: usize,
        keep_comments: bool,
    ) -> Self {
        Self {
            memory,
            name,
            offset,
            capacity,
            write_pos: 0,
            keep_comments,
            comments: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn start_addr(&self) -> u64 {
        self.memory.base() + self.offset as u64
    }

    pub fn write_addr(&self) -> u64 {
        self.start_addr() + self.write_pos as u64
    }

    pub fn end_addr(&self) -> u64 {
        self.start_addr() + self.capacity as u64
    }

    pub fn used(&self) -> usize {
        self.write_pos
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.write_pos
    }

    pub fn keep_comments(&self) -> bool {
        self.keep_comments
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start_addr() && addr < self.write_addr()
    }

    /// Appends `asm` at the write cursor.
    pub fn write(&mut self, asm: &mut Assembler) -> JitResult<Placement> {
        let len = asm.len();
        if len > self.remaining() {
            asm.clear();
            tracing::warn!(block = self.name, requested = len, "jit code block exhausted");
            return Err(JitError::CodeBlockFull {
                requested: len,
                remaining: self.remaining(),
            });
        }
        let addr = self.write_addr();
        let placement = self
            .memory
            .with_writable(self.offset + self.write_pos, len, |dest| {
                asm.assemble(addr, dest)
            })??;
        self.write_pos += len;
        self.record_comments(&placement);
        tracing::trace!(
            block = self.name,
            start = format_args!("{:#x}", placement.start),
            len,
            "wrote code"
        );
        Ok(placement)
    }

    /// Overwrites already written bytes starting at `addr`.
    pub fn patch(&mut self, addr: u64, asm: &mut Assembler) -> JitResult<Placement> {
        let len = asm.len() as u64;
        if addr < self.start_addr() || addr + len > self.write_addr() {
            asm.clear();
            return Err(JitError::PatchOutOfRange { addr });
        }
        let offset = self.offset + (addr - self.start_addr()) as usize;
        let placement = self
            .memory
            .with_writable(offset, len as usize, |dest| asm.assemble(addr, dest))??;
        tracing::trace!(
            block = self.name,
            addr = format_args!("{addr:#x}"),
            len,
            "patched code"
        );
        Ok(placement)
    }

    /// Writes `asm` at `addr`, replacing everything from there to the
    /// cursor. The cursor only moves once the code is known to fit.
    pub fn rewrite_tail(&mut self, addr: u64, asm: &mut Assembler) -> JitResult<Placement> {
        if addr < self.start_addr() || addr > self.write_addr() {
            asm.clear();
            return Err(JitError::PatchOutOfRange { addr });
        }
        let pos = (addr - self.start_addr()) as usize;
        let len = asm.len();
        if len > self.capacity - pos {
            asm.clear();
            return Err(JitError::CodeBlockFull {
                requested: len,
                remaining: self.capacity - pos,
            });
        }
        let placement = self
            .memory
            .with_writable(self.offset + pos, len, |dest| asm.assemble(addr, dest))??;
        self.write_pos = pos + len;
        let _ = self.comments.split_off(&addr);
        self.record_comments(&placement);
        tracing::trace!(
            block = self.name,
            addr = format_args!("{addr:#x}"),
            len,
            "rewrote tail"
        );
        Ok(placement)
    }

    pub fn read(&self, start: u64, end: u64) -> Vec<u8> {
        if start < self.start_addr() || end < start {
            return Vec::new();
        }
        let end = end.min(self.write_addr());
        let offset = self.offset + (start - self.start_addr()) as usize;
        self.memory.read(offset, end.saturating_sub(start) as usize)
    }

    pub fn comments_between(&self, start: u64, end: u64) -> impl Iterator<Item = (&u64, &Vec<String>)> {
        self.comments.range(start..end)
    }

    fn record_comments(&mut self, placement: &Placement) {
        if !self.keep_comments {
            return;
        }
        for (addr, text) in &placement.comments {
            self.comments.entry(*addr).or_default().push(text.clone());
        }
    }
}

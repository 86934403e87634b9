//! Hand-assembled x86-64 stubs for hooks placed in the middle of a function.
//!
//! A mid-function hook replaces a few instructions with a jump to a stub. The stub
//! re-creates what the replaced instructions did (usually by calling a Rust function in
//! their place) and jumps back past them.

use iced_x86::code_asm::*;

use super::HookError;

pub struct StubBuilder {
    asm: CodeAssembler,
}

/// An assembled stub placed in executable memory. Lives for the rest of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stub {
    pub address: usize,
    pub len: usize,
}

const STUB_CAPACITY: usize = 0x1000;

impl StubBuilder {
    pub fn new() -> Result<Self, HookError> {
        Ok(Self {
            asm: CodeAssembler::new(64)?,
        })
    }

    /// Raw assembler for instructions the helpers below do not cover.
    pub fn asm(&mut self) -> &mut CodeAssembler {
        &mut self.asm
    }

    /// `mov rax, target; call rax`
    pub fn call_absolute(&mut self, target: usize) -> Result<&mut Self, HookError> {
        self.asm.mov(rax, target as u64)?;
        self.asm.call(rax)?;
        Ok(self)
    }

    /// `jmp [rip]` followed by the 8 byte target. Leaves every register untouched.
    pub fn jump_absolute(&mut self, target: usize) -> Result<&mut Self, HookError> {
        let mut destination = self.asm.create_label();
        self.asm.jmp(qword_ptr(destination))?;
        self.asm.set_label(&mut destination)?;
        self.asm.dq(&[target as u64])?;
        Ok(self)
    }

    /// `mov rax, target; jmp rax`
    pub fn jump_rax(&mut self, target: usize) -> Result<&mut Self, HookError> {
        self.asm.mov(rax, target as u64)?;
        self.asm.jmp(rax)?;
        Ok(self)
    }

    /// Encode the stub as if it were placed at `ip`.
    pub fn assemble(&mut self, ip: usize) -> Result<Vec<u8>, HookError> {
        Ok(self.asm.assemble(ip as u64)?)
    }

    /// Assemble into freshly allocated executable memory.
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    pub fn install(mut self) -> Result<Stub, HookError> {
        let memory = super::native::alloc_executable(STUB_CAPACITY)?;
        let code = self.assemble(memory as usize)?;
        if code.len() > STUB_CAPACITY {
            return Err(HookError::Allocation { size: code.len() });
        }
        // SAFETY: `memory` is a fresh writable allocation of STUB_CAPACITY bytes
        unsafe { std::ptr::copy_nonoverlapping(code.as_ptr(), memory, code.len()) };
        tracing::trace!("stub of {} bytes at {:#x}", code.len(), memory as usize);
        Ok(Stub {
            address: memory as usize,
            len: code.len(),
        })
    }
}

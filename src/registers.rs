use crate::{
    kernel_abi::{x64, x86, SupportedArch},
    remote_code_ptr::RemoteCodePtr,
    remote_ptr::{RemotePtr, Void},
};

use SupportedArch::*;

macro_rules! ffwd_get_reg {
    ($slf:expr, $x86case:ident, $x64case:ident) => {
        unsafe {
            match $slf.arch_ {
                crate::kernel_abi::SupportedArch::X86 => $slf.u.x86.$x86case as u32 as usize,
                crate::kernel_abi::SupportedArch::X64 => $slf.u.x64.$x64case as usize,
            }
        }
    };
}

macro_rules! ffwd_set_reg {
    ($slf:expr, $x86case:ident, $x64case:ident, $val:expr) => {
        match $slf.arch_ {
            crate::kernel_abi::SupportedArch::X86 => {
                $slf.u.x86.$x86case = $val as i32;
            }
            crate::kernel_abi::SupportedArch::X64 => {
                $slf.u.x64.$x64case = $val as u64;
            }
        }
    };
}

pub const X86_DF_FLAG: usize = 1 << 10;
pub const X86_ZF_FLAG: usize = 1 << 6;

#[repr(C)]
#[derive(Copy, Clone)]
pub union RegistersUnion {
    x86: x86::user_regs_struct,
    x64: x64::user_regs_struct,
}

impl RegistersUnion {
    pub fn default() -> RegistersUnion {
        RegistersUnion {
            x64: x64::user_regs_struct::default(),
        }
    }
}

/// A register file snapshot tagged with the architecture it was captured
/// from. Only the registers the fast-forward machinery needs have named
/// accessors; everything else rides along opaquely.
#[derive(Copy, Clone)]
pub struct Registers {
    arch_: SupportedArch,
    u: RegistersUnion,
}

impl Registers {
    pub fn new(arch: SupportedArch) -> Registers {
        Registers {
            arch_: arch,
            u: RegistersUnion::default(),
        }
    }

    pub fn arch(&self) -> SupportedArch {
        self.arch_
    }

    pub fn ip(&self) -> RemoteCodePtr {
        RemoteCodePtr::from_val(ffwd_get_reg!(self, eip, rip))
    }

    pub fn set_ip(&mut self, addr: RemoteCodePtr) {
        ffwd_set_reg!(self, eip, rip, addr.as_usize());
    }

    /// The REP-loop counter register (ECX/RCX).
    pub fn cx(&self) -> usize {
        ffwd_get_reg!(self, ecx, rcx)
    }

    pub fn set_cx(&mut self, val: usize) {
        ffwd_set_reg!(self, ecx, rcx, val);
    }

    /// Source cursor of the string instructions (ESI/RSI).
    pub fn si(&self) -> RemotePtr<Void> {
        RemotePtr::new_from_val(ffwd_get_reg!(self, esi, rsi))
    }

    pub fn set_si(&mut self, addr: RemotePtr<Void>) {
        ffwd_set_reg!(self, esi, rsi, addr.as_usize());
    }

    /// Destination cursor of the string instructions (EDI/RDI).
    pub fn di(&self) -> RemotePtr<Void> {
        RemotePtr::new_from_val(ffwd_get_reg!(self, edi, rdi))
    }

    pub fn set_di(&mut self, addr: RemotePtr<Void>) {
        ffwd_set_reg!(self, edi, rdi, addr.as_usize());
    }

    pub fn ax(&self) -> usize {
        ffwd_get_reg!(self, eax, rax)
    }

    pub fn set_ax(&mut self, val: usize) {
        ffwd_set_reg!(self, eax, rax, val);
    }

    pub fn flags(&self) -> usize {
        unsafe {
            match self.arch_ {
                X86 => self.u.x86.eflags as u32 as usize,
                X64 => self.u.x64.eflags as usize,
            }
        }
    }

    pub fn set_flags(&mut self, value: usize) {
        match self.arch_ {
            X86 => self.u.x86.eflags = value as i32,
            X64 => self.u.x64.eflags = value as u64,
        }
    }

    /// The direction flag: cursors move down when set.
    pub fn df_flag(&self) -> bool {
        self.flags() & X86_DF_FLAG != 0
    }

    pub fn zf_flag(&self) -> bool {
        self.flags() & X86_ZF_FLAG != 0
    }

    pub fn set_zf(&mut self, set: bool) {
        let flags = self.flags();
        if set {
            self.set_flags(flags | X86_ZF_FLAG);
        } else {
            self.set_flags(flags & !X86_ZF_FLAG);
        }
    }

    /// General-purpose-register equality, the sense in which a caller
    /// stop-state "has been reached". Segment registers and the
    /// kernel-bookkeeping fields are not compared.
    pub fn matches(&self, other: &Registers) -> bool {
        if self.arch_ != other.arch_ {
            return false;
        }
        match self.arch_ {
            X86 => unsafe {
                let a = &self.u.x86;
                let b = &other.u.x86;
                a.eax == b.eax
                    && a.ebx == b.ebx
                    && a.ecx == b.ecx
                    && a.edx == b.edx
                    && a.esi == b.esi
                    && a.edi == b.edi
                    && a.ebp == b.ebp
                    && a.esp == b.esp
                    && a.eip == b.eip
                    && a.eflags == b.eflags
            },
            X64 => unsafe {
                let a = &self.u.x64;
                let b = &other.u.x64;
                a.rax == b.rax
                    && a.rbx == b.rbx
                    && a.rcx == b.rcx
                    && a.rdx == b.rdx
                    && a.rsi == b.rsi
                    && a.rdi == b.rdi
                    && a.rbp == b.rbp
                    && a.rsp == b.rsp
                    && a.r8 == b.r8
                    && a.r9 == b.r9
                    && a.r10 == b.r10
                    && a.r11 == b.r11
                    && a.r12 == b.r12
                    && a.r13 == b.r13
                    && a.r14 == b.r14
                    && a.r15 == b.r15
                    && a.rip == b.rip
                    && a.eflags == b.eflags
            },
        }
    }
}

#![allow(non_camel_case_types)]

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SupportedArch {
    X86,
    X64,
}

impl Default for SupportedArch {
    fn default() -> Self {
        Self::X64
    }
}

#[cfg(target_arch = "x86_64")]
pub const FFWD_NATIVE_ARCH: SupportedArch = SupportedArch::X64;

#[cfg(target_arch = "x86")]
pub const FFWD_NATIVE_ARCH: SupportedArch = SupportedArch::X86;

pub mod x86 {
    /// Register layout matching 32-bit `<sys/user.h>`.
    #[repr(C)]
    #[derive(Copy, Clone, Default, Eq, PartialEq)]
    pub struct user_regs_struct {
        pub ebx: i32,
        pub ecx: i32,
        pub edx: i32,
        pub esi: i32,
        pub edi: i32,
        pub ebp: i32,
        pub eax: i32,
        pub xds: i32,
        pub xes: i32,
        pub xfs: i32,
        pub xgs: i32,
        pub orig_eax: i32,
        pub eip: i32,
        pub xcs: i32,
        pub eflags: i32,
        pub esp: i32,
        pub xss: i32,
    }
}

pub mod x64 {
    /// Register layout matching 64-bit `<sys/user.h>`.
    #[repr(C)]
    #[derive(Copy, Clone, Default, Eq, PartialEq)]
    pub struct user_regs_struct {
        pub r15: u64,
        pub r14: u64,
        pub r13: u64,
        pub r12: u64,
        pub rbp: u64,
        pub rbx: u64,
        pub r11: u64,
        pub r10: u64,
        pub r9: u64,
        pub r8: u64,
        pub rax: u64,
        pub rcx: u64,
        pub rdx: u64,
        pub rsi: u64,
        pub rdi: u64,
        // Unsigned type matches <sys/user.h>, but we need to treat this as
        // signed in practice.
        pub orig_rax: u64,
        pub rip: u64,
        pub cs: u64,
        pub eflags: u64,
        pub rsp: u64,
        pub ss: u64,
        // These _base registers are architecturally defined MSRs and really do
        // need to be 64-bit.
        pub fs_base: u64,
        pub gs_base: u64,
        pub ds: u64,
        pub es: u64,
        pub fs: u64,
        pub gs: u64,
    }
}

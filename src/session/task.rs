pub mod task_inner;

use crate::{
    kernel_abi::SupportedArch,
    registers::Registers,
    remote_code_ptr::RemoteCodePtr,
    remote_ptr::{RemotePtr, Void},
    session::{
        address_space::AddressSpaceSharedPtr,
        task::task_inner::{ResumeRequest, TicksRequest, WaitRequest},
    },
    sig::Sig,
    wait_status::MaybeStopSignal,
};
use libc::pid_t;

/// One stopped tracee execution context as the fast-forward engine sees
/// it. Implemented by the debugger's execution-control layer over ptrace
/// during recording/replay, or by an emulated CPU in tests.
///
/// Every resumption is a blocking resume-and-wait; when a method returns
/// the tracee is stopped again and its registers are current.
pub trait Task {
    /// The tracee's thread id, for diagnostics.
    fn tid(&self) -> pid_t;

    /// The architecture the tracee is currently executing. Can change
    /// across an exec.
    fn arch(&self) -> SupportedArch {
        self.regs_ref().arch()
    }

    fn ip(&self) -> RemoteCodePtr {
        self.regs_ref().ip()
    }

    fn regs_ref(&self) -> &Registers;

    fn regs_mut(&mut self) -> &mut Registers;

    /// Replace the tracee's register file wholesale.
    fn set_regs(&mut self, regs: &Registers);

    /// Resume the tracee and, for `WaitRequest::ResumeWait`, block until
    /// it stops again.
    fn resume_execution(
        &mut self,
        how: ResumeRequest,
        wait_how: WaitRequest,
        tick_period: TicksRequest,
        maybe_sig: Option<Sig>,
    );

    /// The stop signal reported by the last wait, if any.
    fn maybe_stop_sig(&self) -> MaybeStopSignal;

    /// DR6-style debug status of the last stop. Always cleared before the
    /// next resume, so it only reflects events since the last resume.
    fn debug_status(&self) -> usize;

    /// Like `debug_status`, but also clears the sticky value.
    fn consume_debug_status(&mut self) -> usize;

    /// The breakpoint/watchpoint ledger of this tracee's address space.
    fn vm(&self) -> AddressSpaceSharedPtr;

    /// Read bytes from the tracee. Short reads (e.g. across an unmapped
    /// page boundary) are allowed; returns the number of bytes read.
    fn read_bytes_fallible(&mut self, addr: RemotePtr<Void>, buf: &mut [u8]) -> Result<usize, ()>;
}

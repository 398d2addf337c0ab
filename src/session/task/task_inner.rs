/// We define a strong type for resume requests so callers can't confuse
/// their arguments. The variants mirror the ptrace restart requests an
/// execution-control backend would issue.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResumeRequest {
    ResumeCont,
    ResumeSinglestep,
    ResumeSyscall,
    ResumeSysemu,
    ResumeSysemuSinglestep,
}

#[derive(Copy, Clone, Eq, PartialEq)]
pub enum WaitRequest {
    /// After resuming, blocking-wait until the tracee status changes.
    ResumeWait,
    /// Don't wait after resuming.
    ResumeNonblocking,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TicksRequest {
    /// We don't expect to see any ticks (though we seem to, on the odd
    /// buggy system...). Using this is a small performance optimization
    /// because we don't have to stop and restart the performance counters.
    ResumeNoTicks,
    ResumeUnlimitedTicks,
    /// Don't request more than MAX_TICKS_REQUEST and less than 1!
    ResumeWithTicksRequest(u64),
}

impl Default for TicksRequest {
    fn default() -> Self {
        TicksRequest::ResumeUnlimitedTicks
    }
}

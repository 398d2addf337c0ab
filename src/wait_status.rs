use std::{
    fmt,
    fmt::{Display, Formatter},
    num::NonZeroU8,
};

/// The stop signal reported by the last wait on a task, if any. Execution
/// control backends report `SIGTRAP` for singlestep completion, breakpoint
/// and watchpoint traps; anything else means the tracee stopped for a
/// reason the fast-forward machinery must not second-guess.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct MaybeStopSignal(Option<NonZeroU8>);

impl MaybeStopSignal {
    pub fn is_not_sig(&self) -> bool {
        self.0.is_none()
    }

    pub fn new_none() -> MaybeStopSignal {
        MaybeStopSignal(None)
    }

    /// Ensure that sig >= 1 and sig < 0x80 otherwise you will get `MaybeStopSignal(None)`
    pub fn new_sig(sig: i32) -> MaybeStopSignal {
        if sig < 1 || sig >= 0x80 {
            MaybeStopSignal(None)
        } else {
            // We've already checked so no point checking again.
            MaybeStopSignal(Some(unsafe { NonZeroU8::new_unchecked(sig as u8) }))
        }
    }
}

impl PartialEq<i32> for MaybeStopSignal {
    fn eq(&self, other: &i32) -> bool {
        self.0.map_or(false, |op| op.get() as i32 == *other)
    }
}

impl Display for MaybeStopSignal {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.0 {
            None => f.write_str("- Not a signal -"),
            Some(non_zero) => write!(f, "signal {}", non_zero.get()),
        }
    }
}

pub mod memory_range;

use crate::{
    remote_code_ptr::RemoteCodePtr,
    remote_ptr::{RemotePtr, Void},
    session::{address_space::memory_range::MemoryRange, task::Task},
};
use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap},
    rc::Rc,
};

#[derive(Copy, Debug, Clone, Eq, PartialEq)]
pub enum BreakpointType {
    BkptNone = 0,
    /// Trap for internal purposes, e.g. the fast-forward loop-exit
    /// breakpoint.
    BkptInternal = 1,
    /// Trap on behalf of a debugger user.
    BkptUser = 2,
}

/// NB: these random-looking enumeration values are chosen to
/// match the numbers programmed into x86 debug registers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(usize)]
pub enum WatchType {
    WatchExec = 0x00,
    WatchWrite = 0x01,
    WatchReadWrite = 0x03,
}

/// DR6-style bits reported through `Task::debug_status`.
#[derive(Copy, Clone)]
#[repr(usize)]
pub enum DebugStatus {
    DsWatchpointAny = 0xf,
    DsSingleStep = 1 << 14,
}

/// A distinct watchpoint, corresponding to the information needed to
/// program a single x86 debug register.
#[derive(Copy, Clone, Debug)]
pub struct WatchConfig {
    pub addr: RemotePtr<Void>,
    pub num_bytes: usize,
    pub type_: WatchType,
}

impl WatchConfig {
    pub fn new(addr: RemotePtr<Void>, num_bytes: usize, type_: WatchType) -> WatchConfig {
        WatchConfig {
            addr,
            num_bytes,
            type_,
        }
    }
}

/// The byte a software breakpoint overwrites with (int3).
pub const BREAKPOINT_INSN: u8 = 0xCC;

struct Breakpoint {
    /// Breakpoints are refcounted per requesting type so an internal
    /// breakpoint stacked on a user breakpoint survives removal of either.
    internal_count: u32,
    user_count: u32,
    overwritten_data: u8,
}

impl Breakpoint {
    fn new(overwritten_data: u8) -> Breakpoint {
        Breakpoint {
            internal_count: 0,
            user_count: 0,
            overwritten_data,
        }
    }

    fn do_ref(&mut self, which: BreakpointType) {
        *self.counter(which) += 1;
    }

    fn do_unref(&mut self, which: BreakpointType) -> u32 {
        // Unsigned; going negative panics in the debug build.
        *self.counter(which) -= 1;
        self.internal_count + self.user_count
    }

    fn bp_type(&self) -> BreakpointType {
        // USER breakpoints need to be processed before INTERNAL ones: the
        // debugger gets a chance to dispatch commands first.
        if self.user_count > 0 {
            BreakpointType::BkptUser
        } else {
            BreakpointType::BkptInternal
        }
    }

    fn counter(&mut self, which: BreakpointType) -> &mut u32 {
        if which == BreakpointType::BkptUser {
            &mut self.user_count
        } else {
            &mut self.internal_count
        }
    }
}

bitflags! {
    struct RwxBits: u32 {
        const EXEC_BIT = 1 << 0;
        const READ_BIT = 1 << 1;
        const WRITE_BIT = 1 << 2;
        const READ_WRITE_BITS = Self::READ_BIT.bits | Self::WRITE_BIT.bits;
    }
}

/// Track the watched access types of a contiguous range of memory
/// addresses. Watchpoints stay alive until all watched access types have
/// been cleared; refcounts per access type.
#[derive(Clone)]
struct Watchpoint {
    exec_count: u32,
    read_count: u32,
    write_count: u32,
}

impl Watchpoint {
    fn new() -> Watchpoint {
        Watchpoint {
            exec_count: 0,
            read_count: 0,
            write_count: 0,
        }
    }

    fn watch(&mut self, which: RwxBits) {
        if which.contains(RwxBits::EXEC_BIT) {
            self.exec_count += 1;
        }
        if which.contains(RwxBits::READ_BIT) {
            self.read_count += 1;
        }
        if which.contains(RwxBits::WRITE_BIT) {
            self.write_count += 1;
        }
    }

    fn unwatch(&mut self, which: RwxBits) -> u32 {
        if which.contains(RwxBits::EXEC_BIT) {
            self.exec_count -= 1;
        }
        if which.contains(RwxBits::READ_BIT) {
            self.read_count -= 1;
        }
        if which.contains(RwxBits::WRITE_BIT) {
            self.write_count -= 1;
        }
        self.exec_count + self.read_count + self.write_count
    }

    fn watched_bits(&self) -> RwxBits {
        let mut watched = RwxBits::empty();
        if self.exec_count > 0 {
            watched |= RwxBits::EXEC_BIT;
        }
        if self.read_count > 0 {
            watched |= RwxBits::READ_BIT;
        }
        if self.write_count > 0 {
            watched |= RwxBits::WRITE_BIT;
        }
        watched
    }
}

pub type AddressSpaceSharedPtr = Rc<AddressSpace>;

type WatchpointMap = BTreeMap<MemoryRange, Watchpoint>;

/// The breakpoint/watchpoint ledger of one tracee address space. This is
/// shared mutable state between the fast-forward engine and the rest of
/// the debugger, so temporary installations always go through the
/// save/restore pair and are invisible to other components on every exit
/// path.
///
/// Patching breakpoint bytes into tracee text and programming debug
/// registers is the execution-control backend's job; it consults this
/// ledger when resuming the tracee.
pub struct AddressSpace {
    breakpoints: RefCell<HashMap<RemoteCodePtr, Breakpoint>>,
    watchpoints: RefCell<WatchpointMap>,
    saved_watchpoints: RefCell<Vec<WatchpointMap>>,
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace {
    pub fn new() -> AddressSpace {
        AddressSpace {
            breakpoints: Default::default(),
            watchpoints: Default::default(),
            saved_watchpoints: Default::default(),
        }
    }

    pub fn shared() -> AddressSpaceSharedPtr {
        Rc::new(AddressSpace::new())
    }

    pub fn get_breakpoint_type_at_addr(&self, addr: RemoteCodePtr) -> BreakpointType {
        self.breakpoints
            .borrow()
            .get(&addr)
            .map_or(BreakpointType::BkptNone, |bp| bp.bp_type())
    }

    /// Classify an IP that just retired an instruction: if the byte before
    /// it is one of our breakpoints, the tracee executed the int3.
    pub fn get_breakpoint_type_for_retired_insn(&self, ip: RemoteCodePtr) -> BreakpointType {
        let addr = ip.decrement_by_bkpt_insn_length(crate::kernel_abi::FFWD_NATIVE_ARCH);
        self.get_breakpoint_type_at_addr(addr)
    }

    /// Ensure a breakpoint of `type_` is set at `addr`. Returns false when
    /// the address is not readable in the tracee.
    pub fn add_breakpoint(
        &self,
        t: &mut dyn Task,
        addr: RemoteCodePtr,
        type_: BreakpointType,
    ) -> bool {
        let found = self.breakpoints.borrow().contains_key(&addr);
        if found {
            self.breakpoints
                .borrow_mut()
                .get_mut(&addr)
                .unwrap()
                .do_ref(type_);
        } else {
            let mut overwritten_data = [0u8; 1];
            match t.read_bytes_fallible(addr.to_data_ptr::<u8>(), &mut overwritten_data) {
                Ok(read) if read == 1 => (),
                _ => return false,
            }

            let mut bp = Breakpoint::new(overwritten_data[0]);
            bp.do_ref(type_);
            self.breakpoints.borrow_mut().insert(addr, bp);
        }
        true
    }

    /// Remove a `type_` reference to the breakpoint at `addr`. If the
    /// removed reference was the last, the breakpoint is destroyed.
    pub fn remove_breakpoint(&self, addr: RemoteCodePtr, type_: BreakpointType) {
        let mut can_destroy_bp = false;
        if let Some(bp) = self.breakpoints.borrow_mut().get_mut(&addr) {
            if bp.do_unref(type_) == 0 {
                can_destroy_bp = true;
            }
        }
        if can_destroy_bp {
            self.breakpoints.borrow_mut().remove(&addr);
        }
    }

    /// The overwritten byte under the breakpoint at `addr`, for backends
    /// that patch tracee text.
    pub fn overwritten_data_at(&self, addr: RemoteCodePtr) -> Option<u8> {
        self.breakpoints
            .borrow()
            .get(&addr)
            .map(|bp| bp.overwritten_data)
    }

    /// Manage watchpoints. Analogous to the breakpoint-managing methods
    /// above, except that watchpoints can be set for an address range.
    pub fn add_watchpoint(
        &self,
        addr: RemotePtr<Void>,
        num_bytes: usize,
        type_: WatchType,
    ) -> bool {
        let range = MemoryRange::new_range(addr, num_bytes);
        let mut watchpoints = self.watchpoints.borrow_mut();
        watchpoints
            .entry(range)
            .or_insert_with(Watchpoint::new)
            .watch(Self::access_bits_of(type_));
        true
    }

    pub fn remove_watchpoint(&self, addr: RemotePtr<Void>, num_bytes: usize, type_: WatchType) {
        let range = MemoryRange::new_range(addr, num_bytes);
        let mut watchpoints = self.watchpoints.borrow_mut();
        if let Some(wp) = watchpoints.get_mut(&range) {
            if 0 == wp.unwatch(Self::access_bits_of(type_)) {
                watchpoints.remove(&range);
            }
        }
    }

    pub fn remove_all_watchpoints(&self) {
        self.watchpoints.borrow_mut().clear();
    }

    pub fn all_watchpoints(&self) -> Vec<WatchConfig> {
        let mut result: Vec<WatchConfig> = Vec::new();
        for (r, v) in self.watchpoints.borrow().iter() {
            let watching = v.watched_bits();
            if watching.contains(RwxBits::EXEC_BIT) {
                result.push(WatchConfig::new(r.start(), r.size(), WatchType::WatchExec));
            }
            if watching.contains(RwxBits::READ_BIT) {
                result.push(WatchConfig::new(
                    r.start(),
                    r.size(),
                    WatchType::WatchReadWrite,
                ));
            } else if watching.contains(RwxBits::WRITE_BIT) {
                result.push(WatchConfig::new(r.start(), r.size(), WatchType::WatchWrite));
            }
        }
        result
    }

    /// Save all watchpoint state onto a stack.
    pub fn save_watchpoints(&self) {
        self.saved_watchpoints
            .borrow_mut()
            .push(self.watchpoints.borrow().clone());
    }

    /// Pop all watchpoint state from the saved-state stack.
    pub fn restore_watchpoints(&self) -> bool {
        match self.saved_watchpoints.borrow_mut().pop() {
            Some(saved) => {
                *self.watchpoints.borrow_mut() = saved;
                true
            }
            None => fatal!("restore_watchpoints without a matching save_watchpoints"),
        }
    }

    fn access_bits_of(type_: WatchType) -> RwxBits {
        match type_ {
            WatchType::WatchExec => RwxBits::EXEC_BIT,
            WatchType::WatchWrite => RwxBits::WRITE_BIT,
            WatchType::WatchReadWrite => RwxBits::READ_WRITE_BITS,
        }
    }
}

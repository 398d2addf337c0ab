//! Fast-forwarding of x86 REP string instructions.
//!
//! Replaying a tracee that executes `rep stosb` with a multi-million
//! iteration count one singlestep at a time is hopeless. When the tracee
//! is stopped at a REP-prefixed string instruction, we can instead let it
//! run freely with a watchpoint planted just short of where the final
//! iterations will touch memory, then singlestep the residue. The tracee
//! always ends up either still "at" the instruction with at least one
//! iteration left to execute, or past it, so a caller singlestepping
//! towards a target register state never overshoots.

use crate::{
    kernel_abi::SupportedArch,
    log::LogDebug,
    registers::Registers,
    remote_code_ptr::RemoteCodePtr,
    remote_ptr::{RemotePtr, Void},
    session::{
        address_space::{
            memory_range::MemoryRange, BreakpointType, DebugStatus, WatchConfig, WatchType,
        },
        task::{
            task_inner::{ResumeRequest, TicksRequest, WaitRequest},
            Task,
        },
    },
};
use libc::SIGTRAP;
use std::{
    cmp::{max, min},
    ops::BitOr,
};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FastForwardStatus {
    /// At least one iteration was skipped over and above the singlestep
    /// the caller asked for.
    pub did_fast_forward: bool,
    /// We stopped short of the end of the instruction; resuming will
    /// execute more iterations of it.
    pub incomplete_fast_forward: bool,
}

impl FastForwardStatus {
    pub fn new() -> FastForwardStatus {
        Default::default()
    }
}

impl BitOr for FastForwardStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        FastForwardStatus {
            did_fast_forward: self.did_fast_forward || rhs.did_fast_forward,
            incomplete_fast_forward: self.incomplete_fast_forward || rhs.incomplete_fast_forward,
        }
    }
}

/// The CPU is observed to coalesce iterations and only check for
/// watchpoints after a batch of memory accesses; Intel hardware does this
/// for up to 64 bytes of "rep stosb". Assume 128 bytes to be safe.
const BYTES_COALESCED: usize = 128;

/// Return true if the instruction at `t.ip()` is a REP-prefixed x86
/// string instruction.
pub fn at_x86_string_instruction(t: &mut dyn Task) -> bool {
    if !is_x86ish(&*t) {
        return false;
    }
    let ip = t.ip();
    is_string_instruction_at(t, ip)
}

/// Return true if the tracee is at, or has just executed, a REP-prefixed
/// string instruction. May return false positives on unusual code layouts
/// (the instruction-start heuristic scans backwards); callers must treat
/// the answer as "possibly".
pub fn maybe_at_or_after_x86_string_instruction(t: &mut dyn Task) -> bool {
    if !is_x86ish(&*t) {
        return false;
    }
    let ip = t.ip();
    is_string_instruction_at(t, ip) || is_string_instruction_before(t, ip)
}

/// Perform one singlestep of `t` (with `how` indicating the flavor), and
/// if that lands on a REP-prefixed string instruction that can be safely
/// fast-forwarded, skip iterations of it in bulk.
///
/// The tracee is never left in a register state that `matches()` any of
/// `states`: those are states the caller needs to observe by stepping
/// into them, so we always stop at least one iteration short.
///
/// On return the tracee is stopped with SIGTRAP pending, exactly as if it
/// had been singlestepped, except possibly with a much-advanced CX. When
/// the first singlestep stops for any other reason (a different signal, a
/// breakpoint, a watchpoint, one of `states` reached, or an instruction
/// we don't handle), no skipping happens and the caller sorts it out.
pub fn fast_forward_through_instruction(
    t: &mut dyn Task,
    how: ResumeRequest,
    states: &[Registers],
) -> FastForwardStatus {
    debug_assert!(
        how == ResumeRequest::ResumeSinglestep || how == ResumeRequest::ResumeSysemuSinglestep
    );
    let mut result = FastForwardStatus::new();

    let ip = t.ip();

    t.resume_execution(
        how,
        WaitRequest::ResumeWait,
        TicksRequest::ResumeUnlimitedTicks,
        None,
    );
    if t.maybe_stop_sig() != SIGTRAP {
        // We could have stepped into a system call or been hit by an
        // asynchronous signal; the caller deals with those.
        return result;
    }
    if t.ip() != ip {
        return result;
    }
    if t.vm().get_breakpoint_type_at_addr(ip) != BreakpointType::BkptNone {
        // We stopped on a breakpoint without executing anything.
        return result;
    }
    if t.debug_status() & DebugStatus::DsWatchpointAny as usize != 0 {
        // A watchpoint fired; report the stop as-is.
        return result;
    }
    if states.iter().any(|state| state.matches(t.regs_ref())) {
        return result;
    }
    if !is_x86ish(&*t) {
        return result;
    }

    let code = match read_instruction(t, ip) {
        Ok(code) => code,
        Err(()) => return result,
    };
    let decoded = match decode_x86_string_instruction(&code) {
        Some(decoded) => decoded,
        None => return result,
    };
    let limit_ip = ip + decoded.length;

    // At this point we can be sure the instruction doesn't enter the
    // kernel, so the distinction between the singlestep flavors no longer
    // matters for the iterations we execute ourselves.

    let mut states_with_exit: Vec<Registers> = Vec::new();
    let mut did_retry = false;
    loop {
        // The instruction executes until CX reaches 0 and the IP moves to
        // the next instruction, or we reach one of `states`, or the ZF
        // flag changes so that the REP terminates, or a watchpoint fires.
        // A breakpoint can't be hit mid-instruction; we verified above
        // that none is set here.
        let cur_cx = t.regs_ref().cx();
        if cur_cx == 0 {
            // Resuming would skip the instruction entirely.
            result.incomplete_fast_forward = true;
            return result;
        }
        // Never execute the last iteration: the caller must be able to
        // observe the tracee still at the instruction with CX==1.
        let mut iterations = cur_cx - 1;

        let bound_states: &[Registers] = if did_retry { &states_with_exit } else { states };
        for state in bound_states {
            let dest_cx = state.cx();
            if state.ip() == ip {
                if dest_cx == 0 {
                    // This state is only reachable by entering the
                    // instruction anew with CX==0; executing iterations
                    // of the current execution can't get us there.
                    continue;
                }
                if dest_cx >= cur_cx {
                    continue;
                }
                iterations = min(iterations, cur_cx - dest_cx - 1);
            } else if state.ip() == limit_ip {
                if dest_cx >= cur_cx {
                    continue;
                }
                iterations = min(iterations, cur_cx - dest_cx - 1);
            }
        }

        // Bound the iterations so no watchpoint fires inside the skipped
        // range. We don't track which cursor register the instruction
        // actually uses, so both are bounded; the unused one can only
        // make the bound tighter than necessary. An early exit due to
        // flags is not bounded here; we detect it after the fact and
        // rerun the loop (see below).
        for watch in t.vm().all_watchpoints() {
            let si = t.regs_ref().si();
            bound_iterations_for_watchpoint(&*t, si, &decoded, &watch, &mut iterations);
            let di = t.regs_ref().di();
            bound_iterations_for_watchpoint(&*t, di, &decoded, &watch, &mut iterations);
        }

        if iterations == 0 {
            result.incomplete_fast_forward = true;
            return result;
        }

        log!(
            LogDebug,
            "x86-string fast-forward: {} iterations required",
            iterations
        );
        result.did_fast_forward = true;

        let r = *t.regs_ref();
        let direction: isize = if r.df_flag() { -1 } else { 1 };

        let mut watch_offset = decoded.operand_size * (iterations - 1);
        if watch_offset > BYTES_COALESCED {
            // Watch a byte touched towards the end of the skipped range,
            // backed off by the coalescing margin so that a batched check
            // still stops us with iterations left over to singlestep.
            watch_offset -= BYTES_COALESCED;
            let watch_addr: RemotePtr<Void> = r.di() + direction * watch_offset as isize;

            let vm = t.vm();
            vm.save_watchpoints();
            vm.remove_all_watchpoints();
            let ok = vm.add_watchpoint(watch_addr, 1, WatchType::WatchReadWrite);
            ed_assert!(t, ok, "Can't set a single watchpoint?");
            let ok = vm.add_breakpoint(t, limit_ip, BreakpointType::BkptInternal);
            ed_assert!(t, ok, "Can't set a breakpoint after the instruction?");

            t.resume_execution(
                ResumeRequest::ResumeCont,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeUnlimitedTicks,
                None,
            );
            ed_assert!(t, t.maybe_stop_sig() == SIGTRAP);
            let debug_status = t.consume_debug_status();
            if debug_status & DebugStatus::DsWatchpointAny as usize == 0 {
                // The watchpoint didn't fire, so the instruction must
                // have terminated early and we ran into the breakpoint.
                // The trap leaves the IP just past the breakpoint
                // instruction; rewind it.
                ed_assert!(
                    t,
                    t.ip() == limit_ip.increment_by_bkpt_insn_length(t.arch())
                        && decoded.modifies_flags,
                    "Expected breakpoint at {}, got stop at {}",
                    limit_ip,
                    t.ip()
                );
                let mut tmp = *t.regs_ref();
                tmp.set_ip(limit_ip);
                t.set_regs(&tmp);
            }
            vm.remove_breakpoint(limit_ip, BreakpointType::BkptInternal);
            vm.restore_watchpoints();

            // Both trap outcomes require at least one retired iteration:
            // the watch target sits past the coalescing margin, and a
            // flag-driven exit can only follow a completed comparison.
            ed_assert_ne!(t, t.regs_ref().cx(), cur_cx);
            iterations -= cur_cx - t.regs_ref().cx();
        }

        log!(
            LogDebug,
            "x86-string fast-forward: {} iterations to go",
            iterations
        );

        // Singlestep through the rest of the budget.
        while iterations > 0 && t.ip() == ip {
            t.resume_execution(
                how,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeUnlimitedTicks,
                None,
            );
            ed_assert!(t, t.maybe_stop_sig() == SIGTRAP);
            let debug_status = t.consume_debug_status();
            ed_assert_eq!(
                t,
                debug_status & DebugStatus::DsWatchpointAny as usize,
                0,
                "Watchpoint fired inside the iteration bound"
            );
            iterations -= 1;
        }

        if t.ip() == ip {
            log!(LogDebug, "x86-string fast-forward done");
            return result;
        }

        // The instruction terminated before its budget because the flag
        // condition of the REP failed. Flag-modifying string instructions
        // have no side effects other than their register outputs, so
        // restoring the registers effectively unwinds the iterations.
        // Rerun with the exit state as an extra state to stop short of;
        // the rerun can't exit early again, so one retry suffices.
        ed_assert!(
            t,
            t.ip() == limit_ip && decoded.modifies_flags,
            "Expected flag-driven exit at {}, got stop at {}",
            limit_ip,
            t.ip()
        );
        ed_assert!(t, !did_retry);
        did_retry = true;
        states_with_exit.extend_from_slice(states);
        states_with_exit.push(*t.regs_ref());
        t.set_regs(&r);
    }
}

/// Maximum length of an x86 instruction is 15 bytes; we fetch a bit more
/// in case the IP sits in front of a pile of prefixes.
const CODE_BUF_SIZE: usize = 32;

struct InstructionBuf {
    arch: SupportedArch,
    code_buf: [u8; CODE_BUF_SIZE],
    /// How much was actually readable.
    code_buf_len: usize,
}

fn read_instruction(t: &mut dyn Task, ip: RemoteCodePtr) -> Result<InstructionBuf, ()> {
    let mut result = InstructionBuf {
        arch: t.arch(),
        code_buf: [0u8; CODE_BUF_SIZE],
        code_buf_len: 0,
    };
    result.code_buf_len = t.read_bytes_fallible(ip.to_data_ptr::<u8>(), &mut result.code_buf)?;
    Ok(result)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct DecodedInstruction {
    operand_size: usize,
    length: usize,
    modifies_flags: bool,
}

/// Decode a REP-prefixed string instruction. Only shapes whose iteration
/// behavior we fully understand are accepted; anything else (including
/// the 0x67 address-size prefix, which changes which register is the
/// counter) makes the caller fall back to plain singlestepping.
fn decode_x86_string_instruction(code: &InstructionBuf) -> Option<DecodedInstruction> {
    let mut found_operand_prefix = false;
    let mut found_rep_prefix = false;
    let mut found_rexw_prefix = false;

    let mut modifies_flags = false;

    let mut done = false;
    let mut i: usize = 0;
    while i < code.code_buf_len {
        match code.code_buf[i] {
            0x66 => found_operand_prefix = true,
            0x48 if code.arch == SupportedArch::X64 => found_rexw_prefix = true,
            0xf2 | 0xf3 => found_rep_prefix = true,
            // MOVS, STOS, LODS
            0xa4 | 0xa5 | 0xaa | 0xab | 0xac | 0xad => done = true,
            // CMPS, SCAS
            0xa6 | 0xa7 | 0xae | 0xaf => {
                modifies_flags = true;
                done = true;
            }
            _ => return None,
        }
        i += 1;
        if done {
            break;
        }
    }
    if !found_rep_prefix || !done {
        return None;
    }

    let operand_size = if code.code_buf[i - 1] & 1 != 0 {
        if found_rexw_prefix {
            8
        } else if found_operand_prefix {
            2
        } else {
            4
        }
    } else {
        1
    };
    Some(DecodedInstruction {
        operand_size,
        length: i,
        modifies_flags,
    })
}

fn mem_intersect(r1: MemoryRange, r2: MemoryRange) -> bool {
    max(r1.start(), r2.start()) < min(r1.end(), r2.end())
}

/// Tighten `iterations` so that no iteration, stepping `cursor` by the
/// operand size in the current direction, touches `watch`. If the cursor
/// already overlaps the watched range, no iterations can run at all.
fn bound_iterations_for_watchpoint(
    t: &dyn Task,
    cursor: RemotePtr<Void>,
    decoded: &DecodedInstruction,
    watch: &WatchConfig,
    iterations: &mut usize,
) {
    if watch.num_bytes == 0 {
        // Shouldn't happen, but an empty range can't fire either way.
        return;
    }

    let size = decoded.operand_size;
    let direction: isize = if t.regs_ref().df_flag() { -1 } else { 1 };
    let watched = MemoryRange::new_range(watch.addr, watch.num_bytes);

    if mem_intersect(MemoryRange::new_range(cursor, size), watched) {
        *iterations = 0;
        return;
    }

    let steps = if direction > 0 {
        if watch.addr < cursor {
            // The cursor moves away from the watched range.
            return;
        }
        (watch.addr - cursor) / size
    } else {
        if watch.addr >= cursor {
            return;
        }
        (cursor - (watch.addr + watch.num_bytes)) / size + 1
    };
    *iterations = min(*iterations, steps);
}

fn is_x86ish(t: &dyn Task) -> bool {
    matches!(t.arch(), SupportedArch::X86 | SupportedArch::X64)
}

fn is_ignorable_prefix(t: &dyn Task, byte: u8) -> bool {
    if (0x40..=0x4f).contains(&byte) {
        // REX prefixes are only prefixes in 64-bit mode.
        return t.arch() == SupportedArch::X64;
    }
    matches!(
        byte,
        0x26 | // ES override
        0x2e | // CS override
        0x36 | // SS override
        0x3e | // DS override
        0x64 | // FS override
        0x65 | // GS override
        0x66 | // operand-size override
        0x67 | // address-size override
        0xf0 // LOCK
    )
}

fn is_rep_prefix(byte: u8) -> bool {
    byte == 0xf2 || byte == 0xf3
}

fn is_string_instruction(byte: u8) -> bool {
    matches!(
        byte,
        0xa4 | // MOVSB
        0xa5 | // MOVSW
        0xa6 | // CMPSB
        0xa7 | // CMPSW
        0xaa | // STOSB
        0xab | // STOSW
        0xac | // LODSB
        0xad | // LODSW
        0xae | // SCASB
        0xaf // SCASW
    )
}

fn fallible_read_byte(t: &mut dyn Task, ip: RemotePtr<u8>) -> Result<u8, ()> {
    let mut byte = [0u8; 1];
    match t.read_bytes_fallible(ip, &mut byte) {
        Ok(1) => Ok(byte[0]),
        _ => Err(()),
    }
}

fn is_string_instruction_at(t: &mut dyn Task, ip: RemoteCodePtr) -> bool {
    let mut found_rep = false;
    let mut bare_ip: RemotePtr<u8> = ip.to_data_ptr::<u8>();
    loop {
        match fallible_read_byte(t, bare_ip) {
            Err(()) => return false,
            Ok(byte) if is_rep_prefix(byte) => {
                found_rep = true;
            }
            Ok(byte) if is_string_instruction(byte) => {
                return found_rep;
            }
            Ok(byte) if !is_ignorable_prefix(&*t, byte) => {
                return false;
            }
            Ok(_) => (),
        }
        bare_ip += 1usize;
    }
}

fn is_string_instruction_before(t: &mut dyn Task, ip: RemoteCodePtr) -> bool {
    let mut bare_ip: RemotePtr<u8> = ip.to_data_ptr::<u8>();
    if bare_ip.is_null() {
        return false;
    }
    bare_ip -= 1usize;
    match fallible_read_byte(t, bare_ip) {
        Ok(byte) if is_string_instruction(byte) => (),
        _ => return false,
    }

    // A string instruction ends directly before `ip`. Scan backwards a
    // bounded distance for a REP prefix; all x86 prefixes are one byte so
    // 16 bytes covers any legal instruction.
    for _ in 0..16 {
        if bare_ip.is_null() {
            return false;
        }
        bare_ip -= 1usize;
        match fallible_read_byte(t, bare_ip) {
            Ok(byte) if is_rep_prefix(byte) => return true,
            Ok(byte) if is_ignorable_prefix(&*t, byte) => (),
            _ => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        session::address_space::{AddressSpace, AddressSpaceSharedPtr},
        sig::Sig,
        wait_status::MaybeStopSignal,
    };
    use libc::pid_t;
    use std::collections::HashMap;
    use SupportedArch::*;

    const CODE_ADDR: usize = 0x70_0000;
    const DATA_ADDR: usize = 0x60_0000;
    const SRC_ADDR: usize = 0x50_0000;

    /// An emulated tracee stopped under our control, supporting NOP plus
    /// the byte-sized REP string instructions the e2e tests need. Each
    /// singlestep retires one iteration, like real hardware without
    /// coalescing; continues honor software breakpoints and watchpoints.
    struct EmuTask {
        regs: Registers,
        vm: AddressSpaceSharedPtr,
        mem: HashMap<usize, u8>,
        stop_sig: MaybeStopSignal,
        debug_status_: usize,
    }

    impl EmuTask {
        fn new(arch: SupportedArch) -> EmuTask {
            EmuTask {
                regs: Registers::new(arch),
                vm: AddressSpace::shared(),
                mem: HashMap::new(),
                stop_sig: MaybeStopSignal::new_none(),
                debug_status_: 0,
            }
        }

        fn map(&mut self, addr: usize, bytes: &[u8]) {
            for (i, b) in bytes.iter().enumerate() {
                self.mem.insert(addr + i, *b);
            }
        }

        fn map_zeros(&mut self, addr: usize, len: usize) {
            for i in 0..len {
                self.mem.insert(addr + i, 0);
            }
        }

        fn byte_at(&self, addr: usize) -> u8 {
            *self.mem.get(&addr).expect("unmapped address")
        }

        fn read8(&self, addr: usize) -> u8 {
            *self
                .mem
                .get(&addr)
                .unwrap_or_else(|| panic!("emulator fetch from unmapped {:#x}", addr))
        }

        fn store8(&mut self, addr: RemotePtr<Void>, val: u8) {
            assert!(
                self.mem.contains_key(&addr.as_usize()),
                "emulator store to unmapped {}",
                addr
            );
            self.mem.insert(addr.as_usize(), val);
        }

        fn note_access(&mut self, addr: RemotePtr<Void>, len: usize, is_write: bool) {
            let accessed = MemoryRange::new_range(addr, len);
            for watch in self.vm.all_watchpoints() {
                let fires = match watch.type_ {
                    WatchType::WatchExec => false,
                    WatchType::WatchWrite => is_write,
                    WatchType::WatchReadWrite => true,
                };
                if fires && accessed.intersects(&MemoryRange::new_range(watch.addr, watch.num_bytes))
                {
                    self.debug_status_ |= DebugStatus::DsWatchpointAny as usize;
                }
            }
        }

        /// Retire one iteration of the REP string instruction at IP,
        /// updating cursors, CX and (for SCAS) ZF, and advancing IP past
        /// the instruction when the REP terminates.
        fn string_iteration(&mut self) {
            let ip = self.regs.ip().as_usize();
            let mut has_rep = false;
            let mut repne = false;
            let mut idx = ip;
            let opcode = loop {
                let byte = self.read8(idx);
                match byte {
                    0xf3 => has_rep = true,
                    0xf2 => {
                        has_rep = true;
                        repne = true;
                    }
                    0xa4 | 0xaa | 0xae => break byte,
                    _ => panic!("emulator can't execute byte {:#x}", byte),
                }
                idx += 1;
            };
            assert!(has_rep);
            let length = idx + 1 - ip;

            if self.regs.cx() == 0 {
                self.regs.set_ip(RemoteCodePtr::from_val(ip + length));
                return;
            }

            let step: isize = if self.regs.df_flag() { -1 } else { 1 };
            let mut zf = self.regs.zf_flag();
            match opcode {
                // STOSB
                0xaa => {
                    let di = self.regs.di();
                    self.store8(di, self.regs.ax() as u8);
                    self.note_access(di, 1, true);
                    self.regs.set_di(di + step);
                }
                // MOVSB
                0xa4 => {
                    let si = self.regs.si();
                    let di = self.regs.di();
                    let val = self.read8(si.as_usize());
                    self.note_access(si, 1, false);
                    self.store8(di, val);
                    self.note_access(di, 1, true);
                    self.regs.set_si(si + step);
                    self.regs.set_di(di + step);
                }
                // SCASB
                0xae => {
                    let di = self.regs.di();
                    let val = self.read8(di.as_usize());
                    self.note_access(di, 1, false);
                    zf = val == self.regs.ax() as u8;
                    self.regs.set_zf(zf);
                    self.regs.set_di(di + step);
                }
                _ => unreachable!(),
            }

            let cx = self.regs.cx() - 1;
            self.regs.set_cx(cx);
            let flag_exit = match opcode {
                0xae => {
                    if repne {
                        zf
                    } else {
                        !zf
                    }
                }
                _ => false,
            };
            if cx == 0 || flag_exit {
                self.regs.set_ip(RemoteCodePtr::from_val(ip + length));
            }
        }

        fn do_singlestep(&mut self) {
            self.debug_status_ = DebugStatus::DsSingleStep as usize;
            let byte = self.read8(self.regs.ip().as_usize());
            if byte == 0x90 {
                let ip = self.regs.ip();
                self.regs.set_ip(ip + 1usize);
            } else {
                self.string_iteration();
            }
            self.stop_sig = MaybeStopSignal::new_sig(SIGTRAP);
        }

        fn do_cont(&mut self) {
            self.debug_status_ = 0;
            for _ in 0..2_000_000 {
                let ip = self.regs.ip();
                if self.vm.get_breakpoint_type_at_addr(ip) != BreakpointType::BkptNone {
                    // The tracee executes the int3 before trapping.
                    self.regs
                        .set_ip(ip.increment_by_bkpt_insn_length(self.regs.arch()));
                    self.stop_sig = MaybeStopSignal::new_sig(SIGTRAP);
                    return;
                }
                let byte = self.read8(ip.as_usize());
                if byte == 0x90 {
                    self.regs.set_ip(ip + 1usize);
                    continue;
                }
                self.string_iteration();
                if self.debug_status_ & DebugStatus::DsWatchpointAny as usize != 0 {
                    self.stop_sig = MaybeStopSignal::new_sig(SIGTRAP);
                    return;
                }
            }
            panic!("emulated tracee ran away");
        }
    }

    impl Task for EmuTask {
        fn tid(&self) -> pid_t {
            1
        }

        fn regs_ref(&self) -> &Registers {
            &self.regs
        }

        fn regs_mut(&mut self) -> &mut Registers {
            &mut self.regs
        }

        fn set_regs(&mut self, regs: &Registers) {
            self.regs = *regs;
        }

        fn resume_execution(
            &mut self,
            how: ResumeRequest,
            _wait_how: WaitRequest,
            _tick_period: TicksRequest,
            maybe_sig: Option<Sig>,
        ) {
            assert!(maybe_sig.is_none());
            match how {
                ResumeRequest::ResumeSinglestep | ResumeRequest::ResumeSysemuSinglestep => {
                    self.do_singlestep()
                }
                ResumeRequest::ResumeCont => self.do_cont(),
                _ => panic!("emulator doesn't support {:?}", how),
            }
        }

        fn maybe_stop_sig(&self) -> MaybeStopSignal {
            self.stop_sig
        }

        fn debug_status(&self) -> usize {
            self.debug_status_
        }

        fn consume_debug_status(&mut self) -> usize {
            let status = self.debug_status_;
            self.debug_status_ = 0;
            status
        }

        fn vm(&self) -> AddressSpaceSharedPtr {
            self.vm.clone()
        }

        fn read_bytes_fallible(
            &mut self,
            addr: RemotePtr<Void>,
            buf: &mut [u8],
        ) -> Result<usize, ()> {
            let mut nread = 0;
            for (i, slot) in buf.iter_mut().enumerate() {
                match self.mem.get(&(addr.as_usize() + i)) {
                    Some(b) => {
                        *slot = *b;
                        nread += 1;
                    }
                    None => break,
                }
            }
            if nread == 0 {
                Err(())
            } else {
                Ok(nread)
            }
        }
    }

    fn buf(arch: SupportedArch, bytes: &[u8]) -> InstructionBuf {
        let mut code_buf = [0u8; CODE_BUF_SIZE];
        code_buf[..bytes.len()].copy_from_slice(bytes);
        InstructionBuf {
            arch,
            code_buf,
            code_buf_len: bytes.len(),
        }
    }

    fn decoded(operand_size: usize) -> DecodedInstruction {
        DecodedInstruction {
            operand_size,
            length: 2,
            modifies_flags: false,
        }
    }

    /// `rep stosb` filling DATA_ADDR with 0x41, NOPs after it.
    fn stos_task(cx: usize) -> EmuTask {
        let mut t = EmuTask::new(X64);
        t.map(CODE_ADDR, &[0xf3, 0xaa, 0x90, 0x90]);
        t.map_zeros(DATA_ADDR, 0x1000);
        t.regs.set_ip(CODE_ADDR.into());
        t.regs.set_cx(cx);
        t.regs.set_di(DATA_ADDR.into());
        t.regs.set_ax(0x41);
        t
    }

    #[test]
    fn decodes_rep_stosb() {
        let d = decode_x86_string_instruction(&buf(X64, &[0xf3, 0xaa])).unwrap();
        assert_eq!(2, d.length);
        assert_eq!(1, d.operand_size);
        assert!(!d.modifies_flags);
    }

    #[test]
    fn decodes_repne_scasb() {
        let d = decode_x86_string_instruction(&buf(X64, &[0xf2, 0xae])).unwrap();
        assert_eq!(2, d.length);
        assert_eq!(1, d.operand_size);
        assert!(d.modifies_flags);
    }

    #[test]
    fn flag_class_follows_opcode() {
        let d = decode_x86_string_instruction(&buf(X64, &[0xf3, 0xa5])).unwrap();
        assert_eq!(4, d.operand_size);
        assert!(!d.modifies_flags);

        let d = decode_x86_string_instruction(&buf(X64, &[0xf3, 0xa6])).unwrap();
        assert_eq!(1, d.operand_size);
        assert!(d.modifies_flags);

        let d = decode_x86_string_instruction(&buf(X86, &[0xf3, 0xac])).unwrap();
        assert_eq!(1, d.operand_size);
        assert!(!d.modifies_flags);
    }

    #[test]
    fn operand_size_from_prefixes() {
        let d = decode_x86_string_instruction(&buf(X64, &[0x66, 0xf3, 0xab])).unwrap();
        assert_eq!(2, d.operand_size);
        assert_eq!(3, d.length);

        let d = decode_x86_string_instruction(&buf(X64, &[0xf3, 0x48, 0xab])).unwrap();
        assert_eq!(8, d.operand_size);
        assert_eq!(3, d.length);

        let d = decode_x86_string_instruction(&buf(X64, &[0xf3, 0xab])).unwrap();
        assert_eq!(4, d.operand_size);
    }

    #[test]
    fn rex_prefix_rejected_on_x86() {
        assert!(decode_x86_string_instruction(&buf(X86, &[0xf3, 0x48, 0xab])).is_none());
    }

    #[test]
    fn rejects_unhandled_shapes() {
        // No REP prefix.
        assert!(decode_x86_string_instruction(&buf(X64, &[0xaa])).is_none());
        // Address-size override changes the counter register.
        assert!(decode_x86_string_instruction(&buf(X64, &[0xf3, 0x67, 0xaa])).is_none());
        // Not a string instruction.
        assert!(decode_x86_string_instruction(&buf(X64, &[0xf3, 0x90])).is_none());
        // Prefixes only, opcode truncated.
        assert!(decode_x86_string_instruction(&buf(X64, &[0xf3, 0x66])).is_none());
        assert!(decode_x86_string_instruction(&buf(X64, &[])).is_none());
    }

    #[test]
    fn watchpoint_bound_forward() {
        let t = EmuTask::new(X64);
        let watch = WatchConfig::new(0x1010usize.into(), 1, WatchType::WatchWrite);
        let mut iterations = 999;
        bound_iterations_for_watchpoint(&t, 0x1000usize.into(), &decoded(4), &watch, &mut iterations);
        assert_eq!(4, iterations);
    }

    #[test]
    fn watchpoint_bound_overlap_is_zero() {
        let t = EmuTask::new(X64);
        let watch = WatchConfig::new(0x1002usize.into(), 4, WatchType::WatchWrite);
        let mut iterations = 999;
        bound_iterations_for_watchpoint(&t, 0x1000usize.into(), &decoded(4), &watch, &mut iterations);
        assert_eq!(0, iterations);
    }

    #[test]
    fn watchpoint_bound_backward() {
        let mut t = EmuTask::new(X64);
        let flags = t.regs.flags();
        t.regs.set_flags(flags | crate::registers::X86_DF_FLAG);
        let watch = WatchConfig::new(0x1000usize.into(), 0x10, WatchType::WatchWrite);
        let mut iterations = 999;
        bound_iterations_for_watchpoint(&t, 0x1020usize.into(), &decoded(1), &watch, &mut iterations);
        assert_eq!(17, iterations);
    }

    #[test]
    fn watchpoint_behind_cursor_leaves_bound_alone() {
        let t = EmuTask::new(X64);
        let watch = WatchConfig::new(0x0800usize.into(), 4, WatchType::WatchWrite);
        let mut iterations = 999;
        bound_iterations_for_watchpoint(&t, 0x1000usize.into(), &decoded(4), &watch, &mut iterations);
        assert_eq!(999, iterations);

        // Same the other way around with DF set.
        let mut t = EmuTask::new(X64);
        let flags = t.regs.flags();
        t.regs.set_flags(flags | crate::registers::X86_DF_FLAG);
        let watch = WatchConfig::new(0x2000usize.into(), 4, WatchType::WatchWrite);
        let mut iterations = 999;
        bound_iterations_for_watchpoint(&t, 0x1000usize.into(), &decoded(4), &watch, &mut iterations);
        assert_eq!(999, iterations);
    }

    #[test]
    fn zero_sized_watchpoint_ignored() {
        let t = EmuTask::new(X64);
        let watch = WatchConfig::new(0x1004usize.into(), 0, WatchType::WatchWrite);
        let mut iterations = 999;
        bound_iterations_for_watchpoint(&t, 0x1000usize.into(), &decoded(4), &watch, &mut iterations);
        assert_eq!(999, iterations);
    }

    #[test]
    fn recognizes_string_instruction_at_and_before() {
        let mut t = stos_task(10);
        assert!(at_x86_string_instruction(&mut t));
        assert!(maybe_at_or_after_x86_string_instruction(&mut t));

        t.regs.set_ip((CODE_ADDR + 2).into());
        assert!(!at_x86_string_instruction(&mut t));
        assert!(maybe_at_or_after_x86_string_instruction(&mut t));
    }

    #[test]
    fn lock_prefix_is_ignorable_in_the_scan() {
        // f3 f0 ab: LOCK between the REP prefix and the opcode.
        let mut t = EmuTask::new(X64);
        t.map(CODE_ADDR, &[0xf3, 0xf0, 0xab, 0x90]);
        t.regs.set_ip(CODE_ADDR.into());
        assert!(at_x86_string_instruction(&mut t));
        assert!(maybe_at_or_after_x86_string_instruction(&mut t));

        // Just past the instruction, with the LOCK byte inside the
        // backward scan for the REP prefix.
        t.regs.set_ip((CODE_ADDR + 3).into());
        assert!(!at_x86_string_instruction(&mut t));
        assert!(maybe_at_or_after_x86_string_instruction(&mut t));
    }

    #[test]
    fn does_not_recognize_plain_code() {
        let mut t = EmuTask::new(X64);
        t.map(CODE_ADDR, &[0x90, 0x90, 0x90, 0x90]);
        t.regs.set_ip((CODE_ADDR + 1).into());
        assert!(!at_x86_string_instruction(&mut t));
        assert!(!maybe_at_or_after_x86_string_instruction(&mut t));

        // Unreadable IP.
        t.regs.set_ip(0x1234usize.into());
        assert!(!at_x86_string_instruction(&mut t));
    }

    #[test]
    fn skips_bulk_of_rep_stosb_and_stops_short_of_state() {
        let mut t = stos_task(1000);
        let mut state = t.regs;
        state.set_cx(500);
        state.set_di((DATA_ADDR + 500).into());

        let status = fast_forward_through_instruction(
            &mut t,
            ResumeRequest::ResumeSinglestep,
            &[state],
        );
        assert!(status.did_fast_forward);
        assert!(!status.incomplete_fast_forward);
        // One iteration short of the requested state.
        assert_eq!(501, t.regs.cx());
        assert_eq!(CODE_ADDR, t.regs.ip().as_usize());
        assert_eq!(DATA_ADDR + 499, t.regs.di().as_usize());
        assert_eq!(0x41, t.byte_at(DATA_ADDR + 498));
        assert_eq!(0, t.byte_at(DATA_ADDR + 499));

        // The temporary breakpoint and watchpoint are gone.
        assert_eq!(
            BreakpointType::BkptNone,
            t.vm.get_breakpoint_type_at_addr((CODE_ADDR + 2).into())
        );
        assert!(t.vm.all_watchpoints().is_empty());

        // The next call steps exactly onto the state and stops there.
        let status = fast_forward_through_instruction(
            &mut t,
            ResumeRequest::ResumeSinglestep,
            &[state],
        );
        assert!(!status.did_fast_forward);
        assert_eq!(500, t.regs.cx());
        assert_eq!(DATA_ADDR + 500, t.regs.di().as_usize());
        assert!(t.regs.matches(&state));
    }

    #[test]
    fn runs_to_last_iteration_without_states() {
        let mut t = stos_task(1000);
        let status =
            fast_forward_through_instruction(&mut t, ResumeRequest::ResumeSinglestep, &[]);
        assert!(status.did_fast_forward);
        // CX==1: still at the instruction, one iteration to go.
        assert_eq!(1, t.regs.cx());
        assert_eq!(CODE_ADDR, t.regs.ip().as_usize());
        assert_eq!(0x41, t.byte_at(DATA_ADDR + 998));
        assert_eq!(0, t.byte_at(DATA_ADDR + 999));
    }

    #[test]
    fn small_counts_skip_without_bulk_run() {
        // 49 iterations to skip is under the coalescing margin, so the
        // whole residue is singlestepped.
        let mut t = stos_task(50);
        let status =
            fast_forward_through_instruction(&mut t, ResumeRequest::ResumeSinglestep, &[]);
        assert!(status.did_fast_forward);
        assert_eq!(1, t.regs.cx());
        assert_eq!(CODE_ADDR, t.regs.ip().as_usize());
        assert_eq!(DATA_ADDR + 49, t.regs.di().as_usize());
        assert_eq!(0x41, t.byte_at(DATA_ADDR + 48));
        assert_eq!(0, t.byte_at(DATA_ADDR + 49));
    }

    #[test]
    fn repne_scasb_flag_exit_triggers_one_retry() {
        let mut t = EmuTask::new(X64);
        t.map(CODE_ADDR, &[0xf2, 0xae, 0x90, 0x90]);
        t.map_zeros(DATA_ADDR, 0x1000);
        t.map(DATA_ADDR + 199, &[0x5a]);
        t.regs.set_ip(CODE_ADDR.into());
        t.regs.set_cx(1000);
        t.regs.set_di(DATA_ADDR.into());
        t.regs.set_ax(0x5a);

        let status =
            fast_forward_through_instruction(&mut t, ResumeRequest::ResumeSinglestep, &[]);
        assert!(status.did_fast_forward);
        // Stopped one iteration before the scan finds its byte.
        assert_eq!(801, t.regs.cx());
        assert_eq!(CODE_ADDR, t.regs.ip().as_usize());
        assert_eq!(DATA_ADDR + 199, t.regs.di().as_usize());
        assert!(!t.regs.zf_flag());

        // The next singlestep observes the flag change and the exit.
        let status =
            fast_forward_through_instruction(&mut t, ResumeRequest::ResumeSinglestep, &[]);
        assert!(!status.did_fast_forward);
        assert_eq!(800, t.regs.cx());
        assert_eq!(CODE_ADDR + 2, t.regs.ip().as_usize());
        assert!(t.regs.zf_flag());
    }

    #[test]
    fn user_watchpoint_bounds_the_skip() {
        let mut t = stos_task(1000);
        t.vm.add_watchpoint((DATA_ADDR + 300).into(), 1, WatchType::WatchWrite);

        let status =
            fast_forward_through_instruction(&mut t, ResumeRequest::ResumeSinglestep, &[]);
        assert!(status.did_fast_forward);
        // Stopped just before the write that would trip the watchpoint.
        assert_eq!(700, t.regs.cx());
        assert_eq!(DATA_ADDR + 300, t.regs.di().as_usize());
        assert_eq!(CODE_ADDR, t.regs.ip().as_usize());
        assert_eq!(0, t.byte_at(DATA_ADDR + 300));

        // The user watchpoint survived the temporary removal.
        let all = t.vm.all_watchpoints();
        assert_eq!(1, all.len());
        assert_eq!(DATA_ADDR + 300, all[0].addr.as_usize());

        // The very next step trips it.
        let status =
            fast_forward_through_instruction(&mut t, ResumeRequest::ResumeSinglestep, &[]);
        assert!(!status.did_fast_forward);
        assert_eq!(699, t.regs.cx());
        assert_ne!(0, t.debug_status() & DebugStatus::DsWatchpointAny as usize);
    }

    #[test]
    fn source_watchpoint_bounds_rep_movsb() {
        let mut t = EmuTask::new(X64);
        t.map(CODE_ADDR, &[0xf3, 0xa4, 0x90, 0x90]);
        let pattern: Vec<u8> = (0..0x1000).map(|i| i as u8).collect();
        t.map(SRC_ADDR, &pattern);
        t.map_zeros(DATA_ADDR, 0x1000);
        t.regs.set_ip(CODE_ADDR.into());
        t.regs.set_cx(1000);
        t.regs.set_si(SRC_ADDR.into());
        t.regs.set_di(DATA_ADDR.into());
        t.vm.add_watchpoint((SRC_ADDR + 300).into(), 1, WatchType::WatchReadWrite);

        let status =
            fast_forward_through_instruction(&mut t, ResumeRequest::ResumeSinglestep, &[]);
        assert!(status.did_fast_forward);
        assert_eq!(700, t.regs.cx());
        assert_eq!(SRC_ADDR + 300, t.regs.si().as_usize());
        assert_eq!(DATA_ADDR + 300, t.regs.di().as_usize());
        // Bytes up to the stop got copied; nothing beyond.
        assert_eq!(299usize as u8, t.byte_at(DATA_ADDR + 299));
        assert_eq!(0, t.byte_at(DATA_ADDR + 300));

        let status =
            fast_forward_through_instruction(&mut t, ResumeRequest::ResumeSinglestep, &[]);
        assert!(!status.did_fast_forward);
        assert_eq!(699, t.regs.cx());
        assert_ne!(0, t.debug_status() & DebugStatus::DsWatchpointAny as usize);
    }

    #[test]
    fn bails_on_non_string_instruction() {
        let mut t = EmuTask::new(X64);
        t.map(CODE_ADDR, &[0x90, 0x90]);
        t.regs.set_ip(CODE_ADDR.into());
        let status =
            fast_forward_through_instruction(&mut t, ResumeRequest::ResumeSinglestep, &[]);
        assert_eq!(FastForwardStatus::new(), status);
        assert_eq!(CODE_ADDR + 1, t.regs.ip().as_usize());
    }

    #[test]
    fn bails_when_counter_exhausts_on_first_step() {
        let mut t = stos_task(0);
        let status =
            fast_forward_through_instruction(&mut t, ResumeRequest::ResumeSinglestep, &[]);
        assert_eq!(FastForwardStatus::new(), status);
        assert_eq!(0, t.regs.cx());
        assert_eq!(CODE_ADDR + 2, t.regs.ip().as_usize());
    }

    #[test]
    fn bails_when_state_reached_after_one_step() {
        let mut t = stos_task(1000);
        let mut state = t.regs;
        state.set_cx(999);
        state.set_di((DATA_ADDR + 1).into());
        let status = fast_forward_through_instruction(
            &mut t,
            ResumeRequest::ResumeSinglestep,
            &[state],
        );
        assert_eq!(FastForwardStatus::new(), status);
        assert_eq!(999, t.regs.cx());
    }

    #[test]
    fn bails_on_breakpoint_at_instruction() {
        let mut t = stos_task(1000);
        let vm = t.vm();
        assert!(vm.add_breakpoint(&mut t, CODE_ADDR.into(), BreakpointType::BkptUser));
        let status =
            fast_forward_through_instruction(&mut t, ResumeRequest::ResumeSinglestep, &[]);
        assert_eq!(FastForwardStatus::new(), status);
        assert_eq!(999, t.regs.cx());
    }

    #[test]
    fn reports_incomplete_when_no_iterations_can_be_skipped() {
        // After the initial step one iteration remains, and we never
        // execute the last one.
        let mut t = stos_task(2);
        let status =
            fast_forward_through_instruction(&mut t, ResumeRequest::ResumeSinglestep, &[]);
        assert!(!status.did_fast_forward);
        assert!(status.incomplete_fast_forward);
        assert_eq!(1, t.regs.cx());
        assert_eq!(CODE_ADDR, t.regs.ip().as_usize());
    }

    #[test]
    fn status_bitor_accumulates() {
        let a = FastForwardStatus {
            did_fast_forward: true,
            incomplete_fast_forward: false,
        };
        let b = FastForwardStatus {
            did_fast_forward: false,
            incomplete_fast_forward: true,
        };
        let c = a | b;
        assert!(c.did_fast_forward && c.incomplete_fast_forward);
        assert_eq!(FastForwardStatus::new() | FastForwardStatus::new(), FastForwardStatus::new());
    }
}

//! Fast-forwarding of x86 REP-prefixed string instructions for
//! deterministic record/replay debugging.
//!
//! A REP-prefixed string instruction can loop millions of times while the
//! debugger singlesteps once per iteration. This crate skips most of those
//! iterations in one or two traps while reproducing exactly the trap
//! sequence and register trajectory a full singlestep walk would have
//! produced. The entry points live in [`fast_forward`]; the execution
//! control and address-space collaborators the engine drives are the
//! [`session::task::Task`] trait and [`session::address_space::AddressSpace`].

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;

#[macro_use]
pub mod log;
#[macro_use]
pub mod registers;
pub mod fast_forward;
pub mod kernel_abi;
pub mod remote_code_ptr;
pub mod remote_ptr;
pub mod session;
pub mod sig;
pub mod wait_status;

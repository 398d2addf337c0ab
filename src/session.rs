//! The two collaborator surfaces the fast-forward engine drives: the
//! execution-control [`task::Task`] trait and the
//! [`address_space::AddressSpace`] breakpoint/watchpoint ledger.

pub mod address_space;
pub mod task;

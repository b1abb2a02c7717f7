//! # Kernel synchronization primitives
//!
//! Lock-free building blocks shared by the per-CPU machinery:
//!
//! * [`IntrusiveStack`]: multi-producer/single-consumer stack whose push
//!   reports whether it was empty and whose consumer detaches everything at
//!   once.
//! * [`TaggedFreeList`]: an ABA-safe free list of slab indices.
//! * [`InitOnce`]: a value published once and read-only afterwards.
//! * [`irq`]: interrupt-flag helpers for `x86_64`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod init_once;
mod intrusive_stack;
#[cfg(target_arch = "x86_64")]
pub mod irq;
mod tagged_free_list;

pub use init_once::InitOnce;
pub use intrusive_stack::{Chain, IntrusiveStack, StackNode};
pub use tagged_free_list::{FreeListLink, TaggedFreeList};

//! # Multiprocessor execution core
//!
//! Per-processor state, critical sections, the context-switch engine and the
//! lock-free inter-processor messaging that TLB shootdowns and idle wake-ups
//! are built on.
//!
//! ```text
//!                 ┌────────────────────────── SmpRuntime ──────────────────────────┐
//!                 │                                                                │
//!  scheduler ───► │  critical sections ──► context switch ──► ContextSwitch (arch) │
//!                 │        │                                                       │
//!  mm / TLB  ───► │  messaging ──► MessagePool ──► per-CPU MessageQueue            │
//!                 │        │                                                       │
//!  idle loop ───► │  idle bitmap ──► Platform::send_ipi                            │
//!                 └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every operation acts on the calling processor as reported by
//! [`Platform::current_cpu`]. Hardware access is confined to the
//! [`Platform`] and [`ContextSwitch`] implementations; the bare-metal ones
//! live in `arch::x86_64` behind the `asm` feature.
//!
//! ## Fatal errors
//!
//! Only boot-time setup returns [`SmpError`]. A broken invariant at run time
//! (unbalanced critical sections, switching with interrupts enabled,
//! messaging oneself, a message released twice) panics.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod addr;
pub mod arch;
mod callback;
pub mod config;
pub mod context;
mod critical;
mod deferred;
mod error;
pub mod features;
mod idle;
pub mod message;
mod messaging;
mod platform;
mod processor;
pub mod registers;
mod runtime;
mod scheduler;
mod trap;
pub mod tss;

pub use addr::{AddressSpaceId, VirtualAddress};
pub use callback::InlineCallback;
pub use config::SmpConfig;
pub use context::{ContextSwitch, InitialFrame, ThreadContext, ThreadEntry};
pub use critical::CriticalGuard;
pub use error::SmpError;
pub use features::{Capabilities, CpuFeatures, FpuSaveMode};
pub use platform::Platform;
pub use processor::{CpuId, Processor};
pub use runtime::SmpRuntime;
pub use scheduler::SchedulerHooks;

//! # Inter-processor messaging
//!
//! Unicast and broadcast delivery of pooled messages, synchronously (the
//! sender waits until every target has processed the message) or
//! asynchronously (the last target recycles it).
//!
//! ```text
//!  sender                      target
//!  ──────                      ──────
//!  acquire from pool
//!  fill kind, refs, async
//!  push entry ───────────────► queue (was empty? → IPI)
//!  [sync: spin on refs,        IRQ exit / sync wait
//!   draining own queue]          take all, reverse
//!                                dispatch
//!                                refs -= 1
//!  refs == 0 ◄─────────────────  (async && last: release)
//!  release to pool
//! ```
//!
//! A synchronous sender keeps draining its own queue while it waits: two
//! processors sending synchronous messages to each other would otherwise
//! deadlock.

use crate::SmpRuntime;
use crate::addr::{AddressSpaceId, PAGE_SIZE, USER_RANGE_END, VirtualAddress};
use crate::callback::InlineCallback;
use crate::message::{Message, MessageKind};
use crate::processor::CpuId;
use log::{info, trace, warn};

/// A user range must not spill into the kernel half: processors in other
/// address spaces would skip the kernel pages it covers.
fn assert_user_range(vaddr: VirtualAddress, page_count: usize) {
    if !vaddr.is_user() {
        return;
    }
    let end = (page_count as u64)
        .checked_mul(PAGE_SIZE)
        .and_then(|len| vaddr.page_base().as_u64().checked_add(len));
    assert!(
        end.is_some_and(|end| end <= USER_RANGE_END),
        "TLB flush of {page_count} pages at {vaddr} crosses into the kernel half"
    );
}

impl SmpRuntime {
    fn acquire_message(&self) -> &Message {
        self.pool().acquire(|| {
            // every message may be waiting on us
            self.drain_pending_messages();
            self.platform.relax();
        })
    }

    fn wait_for_completion(&self, message: &Message) {
        while message.refs() != 0 {
            self.platform.relax();
            self.drain_pending_messages();
        }
    }

    /// Runs `callback` on processor `cpu`.
    ///
    /// With `is_async == false` this returns only after the target ran the
    /// callback.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is the caller or does not exist, or if SMP messaging
    /// is not enabled.
    pub fn smp_unicast<F>(&self, cpu: CpuId, callback: F, is_async: bool)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let _critical = self.critical();
        let me = self.current_id();
        assert_ne!(cpu, me, "CPU {me}: unicast to self");
        assert!(
            (cpu as usize) < self.cpu_count(),
            "CPU {me}: unicast to nonexistent CPU {cpu}"
        );

        let pool = self.pool();
        let message = self.acquire_message();
        // SAFETY: freshly acquired, not yet published.
        unsafe {
            message.prepare(
                MessageKind::Callback(InlineCallback::new(callback)),
                1,
                is_async,
            );
        }

        trace!(
            "CPU {me}: unicast message {} to CPU {cpu} (async: {is_async})",
            message.index()
        );
        // SAFETY: the entry belongs to `cpu` and the message holds its reference.
        let was_empty = unsafe {
            self.processors[cpu as usize]
                .queue
                .push(pool.entry(message, cpu as usize))
        };
        if was_empty {
            self.platform.send_ipi(cpu);
        }

        // an async message may already be recycled; do not touch it again
        if !is_async {
            self.wait_for_completion(message);
            // SAFETY: sync sender owns the message once refs reached zero.
            unsafe { pool.release(message) };
        }
    }

    /// Runs `callback` on every processor except the caller.
    ///
    /// # Panics
    ///
    /// Panics if SMP messaging is not enabled.
    pub fn smp_broadcast<F>(&self, callback: F, is_async: bool)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let _critical = self.critical();
        let message = self.acquire_message();
        // SAFETY: freshly acquired, not yet published.
        unsafe {
            message.prepare(
                MessageKind::Callback(InlineCallback::new(callback)),
                self.cpu_count() - 1,
                is_async,
            );
        }
        self.broadcast_message(message, is_async);
        if !is_async {
            self.wait_for_completion(message);
            // SAFETY: sync sender owns the message once refs reached zero.
            unsafe { self.pool().release(message) };
        }
    }

    /// Pushes a prepared message to every other processor.
    fn broadcast_message(&self, message: &Message, is_async: bool) {
        let pool = self.pool();
        let me = self.current_id();

        if self.cpu_count() == 1 {
            if is_async {
                // nobody else will ever drop the last reference
                // SAFETY: never published.
                unsafe { pool.release(message) };
            }
            return;
        }

        trace!(
            "CPU {me}: broadcast message {} (async: {is_async})",
            message.index()
        );
        let mut need_ipi = false;
        for target in self.processors.iter().filter(|p| p.id() != me) {
            // SAFETY: the entry belongs to `target`; refs counts every target.
            need_ipi |= unsafe {
                target
                    .queue
                    .push(pool.entry(message, target.id() as usize))
            };
        }
        if need_ipi {
            self.platform.broadcast_ipi();
        }
    }

    /// Invalidates `page_count` pages at `vaddr` on this processor only.
    ///
    /// # Panics
    ///
    /// Panics if a range starting in the user half reaches into the kernel
    /// half.
    pub fn flush_tlb_local(&self, vaddr: VirtualAddress, page_count: usize) {
        assert_user_range(vaddr, page_count);
        let base = vaddr.page_base();
        for page in 0..page_count {
            self.platform.invalidate_page(base.add_pages(page));
        }
    }

    /// Invalidates `page_count` pages at `vaddr` here and, once SMP is
    /// enabled, on every processor using `address_space`.
    pub fn flush_tlb(&self, address_space: AddressSpaceId, vaddr: VirtualAddress, page_count: usize) {
        if self.is_smp_enabled() {
            self.smp_broadcast_flush_tlb(address_space, vaddr, page_count);
        } else {
            self.flush_tlb_local(vaddr, page_count);
        }
    }

    /// Invalidates `page_count` pages at `vaddr` on every processor using
    /// `address_space` (every processor for kernel addresses) and returns
    /// once all of them are done.
    ///
    /// The caller's own TLB is flushed while the other processors work.
    ///
    /// # Panics
    ///
    /// Panics if SMP messaging is not enabled, or if a range starting in the
    /// user half reaches into the kernel half.
    pub fn smp_broadcast_flush_tlb(
        &self,
        address_space: AddressSpaceId,
        vaddr: VirtualAddress,
        page_count: usize,
    ) {
        assert_user_range(vaddr, page_count);
        let _critical = self.critical();
        let message = self.acquire_message();
        // SAFETY: freshly acquired, not yet published.
        unsafe {
            message.prepare(
                MessageKind::FlushTlb {
                    address_space,
                    vaddr,
                    page_count,
                },
                self.cpu_count() - 1,
                false,
            );
        }
        self.broadcast_message(message, false);
        self.flush_tlb_local(vaddr, page_count);
        self.wait_for_completion(message);
        // SAFETY: sync sender owns the message once refs reached zero.
        unsafe { self.pool().release(message) };
    }

    /// Asks every processor to halt at its next message drain.
    ///
    /// Uses no pooled message, so it works even with the pool exhausted.
    pub fn smp_broadcast_halt(&self) {
        info!("CPU {}: broadcasting halt", self.current_id());
        for cpu in self.processors.iter() {
            cpu.request_halt();
        }
        self.platform.broadcast_ipi();
    }

    /// Halts every processor, the caller last.
    pub fn halt(&self) -> ! {
        if self.is_smp_enabled() {
            self.smp_broadcast_halt();
        }
        self.halt_this()
    }

    fn halt_this(&self) -> ! {
        warn!("CPU {}: halting", self.current_id());
        self.platform.disable_interrupts();
        self.platform.halt()
    }

    /// Handles every message waiting for the calling processor.
    ///
    /// Called on interrupt return and from synchronous wait loops. Entries
    /// are processed in submission order, also when a callback's own send
    /// drains again before its batch is finished; a pending halt request is
    /// honored once the queue is empty.
    pub fn drain_pending_messages(&self) {
        if !self.is_smp_enabled() {
            return;
        }

        let _critical = self.critical();
        let cpu = self.current();
        let pool = self.pool();

        // SAFETY: we are the owner, inside a critical section.
        while let Some(entry) = unsafe { cpu.queue.next_entry() } {
            // SAFETY: pool entries are never freed.
            let message = pool.message(unsafe { entry.as_ref() }.message());
            // SAFETY: this processor holds a reference until `release_ref`.
            match unsafe { message.kind() } {
                MessageKind::Callback(callback) => callback.invoke(),
                MessageKind::FlushTlb {
                    address_space,
                    vaddr,
                    page_count,
                } => {
                    if !vaddr.is_user()
                        || *address_space == self.platform.current_address_space()
                    {
                        self.flush_tlb_local(*vaddr, *page_count);
                    }
                }
                MessageKind::Idle => {
                    panic!("CPU {}: received empty message {}", cpu.id(), message.index());
                }
            }
            cpu.count_message();

            // after `release_ref` the message may be recycled by someone else
            let is_async = message.is_async();
            if message.release_ref() && is_async {
                // SAFETY: last reference of an async message.
                unsafe { pool.release(message) };
            }
        }

        if cpu.halt_requested() {
            self.halt_this();
        }
    }
}

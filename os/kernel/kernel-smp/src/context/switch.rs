use super::{DebugRegisters, FpuState, ThreadContext};
use crate::SmpRuntime;
use crate::config::{STACK_ALIGNMENT, STACK_RANDOMIZATION_MAX};
use crate::features::FpuSaveMode;
use crate::registers::Rflags;
use core::mem::size_of;
use log::{debug, trace};

/// The architecture half of a context switch.
///
/// Implementations own the register-level work: saving the outgoing thread's
/// callee-saved registers, stack and instruction pointer, moving to the
/// incoming thread's stack, calling back into
/// [`SmpRuntime::enter_thread_context`], and resuming the incoming thread
/// (through the first-entry trampoline if it never ran).
///
/// # Safety
///
/// Implementations must preserve the outgoing thread's state exactly and
/// call [`SmpRuntime::enter_thread_context`] once per switch, on the incoming
/// thread's stack, with interrupts disabled.
pub unsafe trait ContextSwitch: Sync {
    /// Suspends `from` and resumes `to`; returns when `from` is switched back in.
    ///
    /// # Safety
    ///
    /// Both pointers must be valid, distinct thread contexts; interrupts are
    /// disabled.
    unsafe fn switch(&self, runtime: &SmpRuntime, from: *mut ThreadContext, to: *mut ThreadContext);

    /// Abandons the current execution context and resumes `thread`.
    ///
    /// # Safety
    ///
    /// `thread` must be valid and prepared; interrupts are disabled.
    unsafe fn resume(&self, runtime: &SmpRuntime, thread: *mut ThreadContext) -> !;

    /// Address of the trampoline a new thread starts in. It calls
    /// [`SmpRuntime::context_first_init`] and then the thread's entry.
    fn first_entry_point(&self) -> u64;

    /// # Safety
    ///
    /// `mode` must be supported by the calling processor.
    unsafe fn save_fpu(&self, mode: FpuSaveMode, state: &mut FpuState);

    /// # Safety
    ///
    /// `state` must hold an image saved with `mode`.
    unsafe fn restore_fpu(&self, mode: FpuSaveMode, state: &FpuState);

    /// # Safety
    ///
    /// Ring 0 only.
    unsafe fn read_debug_registers(&self, into: &mut DebugRegisters);

    /// # Safety
    ///
    /// Ring 0 only; the values must be valid breakpoint settings.
    unsafe fn write_debug_registers(&self, from: &DebugRegisters);

    /// # Safety
    ///
    /// Ring 0 only.
    unsafe fn clear_debug_registers(&self);

    /// # Safety
    ///
    /// Ring 0 only; `base` must be canonical.
    unsafe fn set_tls_base(&self, base: u64);
}

/// What a new thread finds on its kernel stack on its first run.
///
/// The frame sits at an address `≡ 8 (mod 16)`, so once the trampoline has
/// popped `entry_ip` and `entry_arg` the stack pointer points at
/// `return_address` exactly like right after a `call`.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InitialFrame {
    pub entry_ip: u64,
    pub entry_arg: u64,
    pub return_address: u64,
}

impl SmpRuntime {
    fn fpu_save_mode(&self) -> FpuSaveMode {
        let cpu = self.current();
        match cpu.capabilities() {
            Some(caps) => caps.fpu_save_mode(),
            None => panic!("CPU {}: context switch before initialization", cpu.id()),
        }
    }

    /// Switches the calling processor from `from` to `to`.
    ///
    /// Returns once `from` is scheduled again, possibly on another processor.
    ///
    /// # Safety
    ///
    /// Both pointers must be valid, distinct, scheduler-owned contexts;
    /// `from` must be the thread currently running on this processor.
    ///
    /// # Panics
    ///
    /// Panics unless interrupts are disabled, the processor is outside any
    /// interrupt handler and exactly one critical section deep.
    pub unsafe fn switch_context(&self, from: *mut ThreadContext, to: *mut ThreadContext) {
        assert!(
            !self.platform.interrupts_enabled(),
            "switch_context with interrupts enabled"
        );
        let cpu = self.current();
        assert_eq!(cpu.in_irq(), 0, "CPU {}: switch_context in IRQ", cpu.id());
        assert_eq!(
            cpu.in_critical(),
            1,
            "CPU {}: switch_context requires exactly one critical section",
            cpu.id()
        );
        assert!(!core::ptr::eq(from, to), "switch_context to the running thread");

        // SAFETY: caller guarantees validity; nobody else touches either
        // context during the switch.
        let (from_ctx, to_ctx) = unsafe { (&mut *from, &*to) };
        from_ctx.saved_critical = cpu.in_critical();
        from_ctx.saved_interrupts = cpu.saved_interrupts();
        cpu.set_kernel_stack_pointer(to_ctx.regs.rsp0);

        trace!(
            "CPU {}: switch {:p} -> {:p} (rip {:#x})",
            cpu.id(),
            from,
            to,
            to_ctx.regs.rip
        );
        // SAFETY: preconditions checked above.
        unsafe { self.switcher.switch(self, from, to) };
    }

    /// The switch trampoline, running on `to`'s stack.
    ///
    /// Called by [`ContextSwitch`] implementations only: it saves `from`'s
    /// FPU and debug state, installs `to`'s thread-local base, address space,
    /// critical depth and FPU state and marks `to` as current.
    ///
    /// # Safety
    ///
    /// Both pointers must be valid; `from == to` when resuming a thread
    /// without a predecessor. Interrupts must be disabled.
    ///
    /// # Panics
    ///
    /// Panics if interrupts are enabled, `to` would resume outside a
    /// critical section or with a raised I/O privilege level.
    pub unsafe fn enter_thread_context(&self, from: *mut ThreadContext, to: *mut ThreadContext) {
        assert!(
            !self.platform.interrupts_enabled(),
            "enter_thread_context with interrupts enabled"
        );
        let cpu = self.current();
        let mode = self.fpu_save_mode();
        let same = core::ptr::eq(from, to);

        if !same {
            // SAFETY: distinct valid contexts per caller contract.
            let from_ctx = unsafe { &mut *from };
            unsafe { self.switcher.save_fpu(mode, &mut from_ctx.fpu) };
            if from_ctx.traced {
                unsafe { self.switcher.read_debug_registers(&mut from_ctx.debug) };
            }
        }

        // SAFETY: valid per caller contract; `from` is no longer borrowed.
        let to_ctx = unsafe { &mut *to };
        assert_eq!(
            Rflags::from_bits(to_ctx.regs.rflags).iopl(),
            0,
            "thread resumed with IOPL != 0"
        );

        unsafe {
            if to_ctx.traced {
                self.switcher.write_debug_registers(&to_ctx.debug);
            } else {
                self.switcher.clear_debug_registers();
            }
            self.switcher.set_tls_base(to_ctx.tls_base);
        }

        let active = if same {
            self.platform.current_address_space()
        } else {
            // SAFETY: still valid; read-only.
            unsafe { (*from).address_space }
        };
        if active != to_ctx.address_space {
            self.platform.load_address_space(to_ctx.address_space);
        }

        cpu.set_current_thread(to);
        to_ctx.last_cpu = Some(cpu.id());

        let depth = to_ctx.saved_critical;
        assert!(depth > 0, "thread resumed outside a critical section");
        cpu.set_critical_depth(depth);
        cpu.set_saved_interrupts(to_ctx.saved_interrupts);

        unsafe { self.switcher.restore_fpu(mode, &to_ctx.fpu) };
    }

    /// Prepares a new thread so that switching to it enters its first-entry
    /// trampoline. Returns the initial stack pointer.
    ///
    /// The kernel stack top is lowered by a random multiple of 16 bytes
    /// (up to 256) before the entry frame is written. The thread's FPU image
    /// is reset to a freshly initialized FPU.
    ///
    /// With `leave_critical` the caller is two critical sections deep (its
    /// own plus the one protecting thread creation) and drops back to one
    /// without side effects, so it can switch right away.
    ///
    /// # Safety
    ///
    /// `thread` must be valid and not running, and its kernel stack must be
    /// writable memory ending at `kernel_stack_top`.
    ///
    /// # Panics
    ///
    /// Panics inside an interrupt handler, before this processor was
    /// initialized, or with `leave_critical` when the depth is not two.
    pub unsafe fn init_context(&self, thread: *mut ThreadContext, leave_critical: bool) -> u64 {
        let cpu = self.current();
        assert_eq!(cpu.in_irq(), 0, "CPU {}: init_context in IRQ", cpu.id());
        if leave_critical {
            assert_eq!(
                cpu.in_critical(),
                2,
                "CPU {}: init_context expects to leave one of two critical sections",
                cpu.id()
            );
            cpu.set_critical_depth(1);
        }

        // SAFETY: caller guarantees a valid, idle context.
        let ctx = unsafe { &mut *thread };
        let offset = u64::from(self.platform.fast_random()).next_multiple_of(STACK_ALIGNMENT);
        debug_assert!(offset <= STACK_RANDOMIZATION_MAX);
        let stack_top = ctx.kernel_stack_top - offset;

        let frame_size = size_of::<InitialFrame>() as u64;
        let frame_addr = ((stack_top - frame_size) & !(STACK_ALIGNMENT - 1)) - 8;
        let frame = InitialFrame {
            entry_ip: ctx.entry.ip,
            entry_arg: ctx.entry.arg,
            return_address: ctx.entry.exit,
        };
        // SAFETY: inside the caller-provided kernel stack.
        unsafe { (frame_addr as *mut InitialFrame).write(frame) };

        ctx.regs.rip = self.switcher.first_entry_point();
        ctx.regs.rsp = frame_addr;
        ctx.regs.rsp0 = stack_top;
        ctx.regs.rflags = Rflags::initial().into_bits();
        ctx.saved_critical = 1;
        ctx.saved_interrupts = ctx.entry.interrupts_enabled;
        ctx.fpu = FpuState::initial(self.fpu_save_mode());

        trace!(
            "init_context {:p}: stack top {:#x} (offset {offset}), frame {:#x}",
            thread,
            stack_top,
            frame_addr
        );
        frame_addr
    }

    /// Runs on a new thread's first activation, from the first-entry
    /// trampoline, before the thread's entry function.
    ///
    /// # Safety
    ///
    /// Called by [`ContextSwitch`] implementations only, with the contexts
    /// of the switch that brought `to` in.
    ///
    /// # Panics
    ///
    /// Panics unless interrupts are disabled and the depth is one.
    pub unsafe fn context_first_init(
        &self,
        from: *mut ThreadContext,
        to: *mut ThreadContext,
        frame: *const InitialFrame,
    ) {
        assert!(
            !self.platform.interrupts_enabled(),
            "context_first_init with interrupts enabled"
        );
        let cpu = self.current();
        assert_eq!(
            cpu.in_critical(),
            1,
            "CPU {}: first switch outside a single critical section",
            cpu.id()
        );
        debug!(
            "CPU {}: first switch {:p} -> {:p}, frame {:p}",
            cpu.id(),
            from,
            to,
            frame
        );

        if let Some(hooks) = self.scheduler.get() {
            hooks.on_first_switch(self, to);
        }
        self.leave_critical();
    }

    /// Abandons the current execution context and continues as `thread`.
    ///
    /// Used to start the first thread on a processor (or to run a freshly
    /// prepared context in place of the caller); `interrupts_enabled` is the
    /// interrupt state `thread` gets once it leaves its critical section.
    ///
    /// # Safety
    ///
    /// `thread` must be a valid context prepared with
    /// [`init_context`](Self::init_context) or previously switched out.
    ///
    /// # Panics
    ///
    /// Panics if interrupts are enabled or the processor is not in a
    /// critical section.
    pub unsafe fn assume_context(&self, thread: *mut ThreadContext, interrupts_enabled: bool) -> ! {
        assert!(
            !self.platform.interrupts_enabled(),
            "assume_context with interrupts enabled"
        );
        let cpu = self.current();
        assert!(
            cpu.in_critical() > 0,
            "CPU {}: assume_context outside a critical section",
            cpu.id()
        );

        // SAFETY: valid per caller contract.
        let ctx = unsafe { &mut *thread };
        ctx.saved_interrupts = interrupts_enabled;
        cpu.set_kernel_stack_pointer(ctx.regs.rsp0);
        debug!("CPU {}: assuming context {:p}", cpu.id(), thread);

        // SAFETY: preconditions checked above.
        unsafe { self.switcher.resume(self, thread) }
    }
}

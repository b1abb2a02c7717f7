use crate::SmpRuntime;
use crate::context::{ContextSwitch, DebugRegisters, FpuState, InitialFrame, ThreadContext, offsets};
use crate::features::FpuSaveMode;
use core::arch::{asm, naked_asm};

const IA32_FS_BASE: u32 = 0xC000_0100;

/// Register-level context switching for `x86_64`.
///
/// The outgoing thread's callee-saved registers go straight into its
/// [`SavedRegisters`](crate::context::SavedRegisters); the stack pointer is
/// then moved to the incoming thread, which finds the pair of contexts pushed
/// on top of its own stack:
///
/// ```text
///  incoming stack after the switch
///  ┌──────────────┐ ◄ saved rsp (resumed thread) / InitialFrame (new thread)
///  │ to           │
///  │ from         │
///  │ saved rip    │ ◄ `ret` after the trampoline
///  └──────────────┘
/// ```
///
/// A resumed thread pops the pair and restores its registers; a new thread
/// lands in [`thread_first_enter`] instead.
pub struct X86ContextSwitch;

extern "C" fn enter_thread_context_shim(from: *mut ThreadContext, to: *mut ThreadContext) {
    // SAFETY: called from `switch_stacks`/`resume_thread` on `to`'s stack.
    unsafe { SmpRuntime::global().enter_thread_context(from, to) }
}

extern "C" fn context_first_init_shim(
    from: *mut ThreadContext,
    to: *mut ThreadContext,
    frame: *const InitialFrame,
) {
    // SAFETY: called from `thread_first_enter` only.
    unsafe { SmpRuntime::global().context_first_init(from, to, frame) }
}

#[unsafe(naked)]
unsafe extern "C" fn switch_stacks(from: *mut ThreadContext, to: *mut ThreadContext) {
    naked_asm!(
        "mov [rdi + {rbx}], rbx",
        "mov [rdi + {rbp}], rbp",
        "mov [rdi + {r12}], r12",
        "mov [rdi + {r13}], r13",
        "mov [rdi + {r14}], r14",
        "mov [rdi + {r15}], r15",
        "pushfq",
        "pop qword ptr [rdi + {rflags}]",
        "mov [rdi + {rsp}], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + {rip}], rax",
        // onto the incoming stack
        "mov rsp, [rsi + {rsp}]",
        "push rsi",
        "push rdi",
        "push qword ptr [rsi + {rip}]",
        "cld",
        "call {enter}",
        "ret",
        // resumed: the switch that brought us back left (from, to) on our stack
        "2:",
        "pop rdi",
        "pop rsi",
        "mov rbx, [rsi + {rbx}]",
        "mov rbp, [rsi + {rbp}]",
        "mov r12, [rsi + {r12}]",
        "mov r13, [rsi + {r13}]",
        "mov r14, [rsi + {r14}]",
        "mov r15, [rsi + {r15}]",
        "push qword ptr [rsi + {rflags}]",
        "popfq",
        "ret",
        rbx = const offsets::RBX,
        rbp = const offsets::RBP,
        r12 = const offsets::R12,
        r13 = const offsets::R13,
        r14 = const offsets::R14,
        r15 = const offsets::R15,
        rsp = const offsets::RSP,
        rip = const offsets::RIP,
        rflags = const offsets::RFLAGS,
        enter = sym enter_thread_context_shim,
    )
}

#[unsafe(naked)]
unsafe extern "C" fn resume_thread(thread: *mut ThreadContext) -> ! {
    naked_asm!(
        "mov rsp, [rdi + {rsp}]",
        "push rdi",
        "push rdi",
        "push qword ptr [rdi + {rip}]",
        "mov rsi, rdi",
        "cld",
        "call {enter}",
        "ret",
        rsp = const offsets::RSP,
        rip = const offsets::RIP,
        enter = sym enter_thread_context_shim,
    )
}

/// First instruction of every new thread; `rsp` points at `(from, to)`
/// followed by the [`InitialFrame`].
#[unsafe(naked)]
unsafe extern "C" fn thread_first_enter() -> ! {
    naked_asm!(
        "pop rdi",
        "pop rsi",
        "mov rdx, rsp",
        "sub rsp, 8",
        "call {first_init}",
        "add rsp, 8",
        "pop rax",
        "pop rdi",
        "jmp rax",
        first_init = sym context_first_init_shim,
    )
}

unsafe impl ContextSwitch for X86ContextSwitch {
    unsafe fn switch(&self, _runtime: &SmpRuntime, from: *mut ThreadContext, to: *mut ThreadContext) {
        unsafe { switch_stacks(from, to) }
    }

    unsafe fn resume(&self, _runtime: &SmpRuntime, thread: *mut ThreadContext) -> ! {
        unsafe { resume_thread(thread) }
    }

    fn first_entry_point(&self) -> u64 {
        thread_first_enter as usize as u64
    }

    unsafe fn save_fpu(&self, mode: FpuSaveMode, state: &mut FpuState) {
        let area = state.bytes.as_mut_ptr();
        unsafe {
            match mode {
                FpuSaveMode::Legacy => asm!("fnsave [{}]", in(reg) area, options(nostack)),
                FpuSaveMode::Fxsave => asm!("fxsave64 [{}]", in(reg) area, options(nostack)),
                FpuSaveMode::Xsave => asm!(
                    "xsave64 [{}]",
                    in(reg) area,
                    in("eax") u32::MAX,
                    in("edx") u32::MAX,
                    options(nostack)
                ),
            }
        }
    }

    unsafe fn restore_fpu(&self, mode: FpuSaveMode, state: &FpuState) {
        let area = state.bytes.as_ptr();
        unsafe {
            match mode {
                FpuSaveMode::Legacy => asm!("frstor [{}]", in(reg) area, options(nostack)),
                FpuSaveMode::Fxsave => asm!("fxrstor64 [{}]", in(reg) area, options(nostack)),
                FpuSaveMode::Xsave => asm!(
                    "xrstor64 [{}]",
                    in(reg) area,
                    in("eax") u32::MAX,
                    in("edx") u32::MAX,
                    options(nostack)
                ),
            }
        }
    }

    unsafe fn read_debug_registers(&self, into: &mut DebugRegisters) {
        unsafe {
            asm!("mov {}, dr0", out(reg) into.dr0, options(nomem, nostack, preserves_flags));
            asm!("mov {}, dr1", out(reg) into.dr1, options(nomem, nostack, preserves_flags));
            asm!("mov {}, dr2", out(reg) into.dr2, options(nomem, nostack, preserves_flags));
            asm!("mov {}, dr3", out(reg) into.dr3, options(nomem, nostack, preserves_flags));
            asm!("mov {}, dr6", out(reg) into.dr6, options(nomem, nostack, preserves_flags));
            asm!("mov {}, dr7", out(reg) into.dr7, options(nomem, nostack, preserves_flags));
        }
    }

    unsafe fn write_debug_registers(&self, from: &DebugRegisters) {
        unsafe {
            asm!("mov dr0, {}", in(reg) from.dr0, options(nomem, nostack, preserves_flags));
            asm!("mov dr1, {}", in(reg) from.dr1, options(nomem, nostack, preserves_flags));
            asm!("mov dr2, {}", in(reg) from.dr2, options(nomem, nostack, preserves_flags));
            asm!("mov dr3, {}", in(reg) from.dr3, options(nomem, nostack, preserves_flags));
            asm!("mov dr6, {}", in(reg) from.dr6, options(nomem, nostack, preserves_flags));
            asm!("mov dr7, {}", in(reg) from.dr7, options(nomem, nostack, preserves_flags));
        }
    }

    unsafe fn clear_debug_registers(&self) {
        unsafe { self.write_debug_registers(&DebugRegisters::default()) };
    }

    unsafe fn set_tls_base(&self, base: u64) {
        #[allow(clippy::cast_possible_truncation)]
        let (lo, hi) = (base as u32, (base >> 32) as u32);
        unsafe {
            asm!(
                "wrmsr",
                in("ecx") IA32_FS_BASE,
                in("eax") lo,
                in("edx") hi,
                options(nostack, preserves_flags)
            );
        }
    }
}

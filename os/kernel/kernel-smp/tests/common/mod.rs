//! A simulated multiprocessor for running the SMP core on the host.
//!
//! Each simulated CPU is driven by whichever OS thread currently claims its
//! id (see [`set_current_cpu`]). Interrupts are a per-CPU flag; an IPI sets a
//! pending bit that the owning thread services in [`Sim::poll_interrupts`].
//! Register files, FPU images and debug registers are plain memory, so the
//! context-switch engine can be checked value for value.

#![allow(dead_code)]

use kernel_smp::context::{DebugRegisters, FpuState, SavedRegisters};
use kernel_smp::{
    AddressSpaceId, Capabilities, ContextSwitch, CpuFeatures, CpuId, FpuSaveMode, InitialFrame,
    Platform, SmpConfig, SmpRuntime, ThreadContext, VirtualAddress,
};
use std::any::Any;
use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// Address the simulated first-entry trampoline lives at.
pub const FIRST_ENTRY: u64 = 0xF1F1_0000;

/// Unwind payload of a simulated `hlt` loop.
#[derive(Debug)]
pub struct SimHalted;

/// Unwind payload of a simulated `resume`: the old execution context is gone.
#[derive(Debug)]
pub struct SimResumed;

thread_local! {
    static CURRENT_CPU: Cell<Option<CpuId>> = const { Cell::new(None) };
}

/// Makes the calling OS thread act as `cpu`.
pub fn set_current_cpu(cpu: CpuId) {
    CURRENT_CPU.with(|c| c.set(Some(cpu)));
}

pub fn current_cpu() -> CpuId {
    CURRENT_CPU
        .with(Cell::get)
        .expect("OS thread does not act as any simulated CPU")
}

/// Runs `f` as `cpu`, then switches back.
pub fn as_cpu<R>(cpu: CpuId, f: impl FnOnce() -> R) -> R {
    let prev = CURRENT_CPU.with(Cell::get);
    set_current_cpu(cpu);
    let result = f();
    CURRENT_CPU.with(|c| c.set(prev));
    result
}

/// `true` if `f` unwound with a payload of type `P`; other panics propagate.
pub fn unwinds_with<P: Any>(f: impl FnOnce()) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => false,
        Err(payload) if payload.is::<P>() => true,
        Err(payload) => panic::resume_unwind(payload),
    }
}

/// Spins until `cond` holds; fails the test after ten seconds.
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::yield_now();
    }
}

/// Architectural state of one simulated CPU that the switch engine touches.
#[derive(Debug, Clone, Default)]
pub struct LiveState {
    pub regs: SavedRegisters,
    /// First argument register, receives the entry argument of a new thread.
    pub rdi: u64,
    pub fpu: FpuState,
    pub debug: DebugRegisters,
    pub tls_base: u64,
}

#[derive(Default)]
pub struct SimCpu {
    pub interrupts: AtomicBool,
    pub ipi_pending: AtomicBool,
    pub ipis_received: AtomicUsize,
    pub address_space: AtomicU64,
    pub address_space_loads: AtomicUsize,
    pub halted: AtomicBool,
    pub invalidated: Mutex<Vec<u64>>,
    pub live: Mutex<LiveState>,
    pub fpu_modes: Mutex<Vec<FpuSaveMode>>,
    /// Entry arguments of threads started on this CPU.
    pub entered: Mutex<Vec<u64>>,
}

pub struct SimMachine {
    cpus: Box<[SimCpu]>,
    scripted_random: Mutex<VecDeque<u8>>,
    random_state: AtomicU64,
}

impl SimMachine {
    pub fn new(cpu_count: usize) -> Self {
        Self {
            cpus: (0..cpu_count).map(|_| SimCpu::default()).collect(),
            scripted_random: Mutex::new(VecDeque::new()),
            random_state: AtomicU64::new(0x2545_F491_4F6C_DD1D),
        }
    }

    pub fn cpu(&self, cpu: CpuId) -> &SimCpu {
        &self.cpus[cpu as usize]
    }

    fn here(&self) -> &SimCpu {
        self.cpu(current_cpu())
    }

    /// Values returned by the next calls to `fast_random`.
    pub fn script_random(&self, bytes: &[u8]) {
        self.scripted_random.lock().unwrap().extend(bytes);
    }

    pub fn set_interrupts(&self, cpu: CpuId, enabled: bool) {
        self.cpu(cpu).interrupts.store(enabled, Ordering::SeqCst);
    }

    pub fn interrupts_enabled_on(&self, cpu: CpuId) -> bool {
        self.cpu(cpu).interrupts.load(Ordering::SeqCst)
    }

    pub fn set_address_space(&self, cpu: CpuId, space: AddressSpaceId) {
        self.cpu(cpu).address_space.store(space.root(), Ordering::SeqCst);
    }

    pub fn invalidated(&self, cpu: CpuId) -> Vec<u64> {
        self.cpu(cpu).invalidated.lock().unwrap().clone()
    }

    pub fn live(&self, cpu: CpuId) -> LiveState {
        self.cpu(cpu).live.lock().unwrap().clone()
    }

    pub fn set_live(&self, cpu: CpuId, state: LiveState) {
        *self.cpu(cpu).live.lock().unwrap() = state;
    }

    pub fn ipis(&self, cpu: CpuId) -> usize {
        self.cpu(cpu).ipis_received.load(Ordering::SeqCst)
    }

    pub fn halted_count(&self) -> usize {
        self.cpus
            .iter()
            .filter(|cpu| cpu.halted.load(Ordering::SeqCst))
            .count()
    }

    fn raise_ipi(&self, target: CpuId) {
        let cpu = self.cpu(target);
        cpu.ipis_received.fetch_add(1, Ordering::SeqCst);
        cpu.ipi_pending.store(true, Ordering::SeqCst);
    }

    /// Loads `to` into the live state, entering the trampoline path for a
    /// thread that never ran.
    unsafe fn enter(&self, runtime: &SmpRuntime, from: *mut ThreadContext, to: *mut ThreadContext) {
        unsafe { runtime.enter_thread_context(from, to) };

        let regs = unsafe { (*to).regs };
        if regs.rip == FIRST_ENTRY {
            let frame = regs.rsp as *const InitialFrame;
            unsafe { runtime.context_first_init(from, to, frame) };
            let frame = unsafe { frame.read() };
            let mut live = self.here().live.lock().unwrap();
            live.regs = regs;
            live.regs.rip = frame.entry_ip;
            live.regs.rsp = regs.rsp + 16;
            live.rdi = frame.entry_arg;
            self.here().entered.lock().unwrap().push(frame.entry_arg);
        } else {
            self.here().live.lock().unwrap().regs = regs;
        }
    }
}

impl Platform for SimMachine {
    fn current_cpu(&self) -> CpuId {
        current_cpu()
    }

    fn interrupts_enabled(&self) -> bool {
        self.here().interrupts.load(Ordering::SeqCst)
    }

    fn disable_interrupts(&self) {
        self.here().interrupts.store(false, Ordering::SeqCst);
    }

    fn enable_interrupts(&self) {
        self.here().interrupts.store(true, Ordering::SeqCst);
    }

    fn send_ipi(&self, target: CpuId) {
        self.raise_ipi(target);
    }

    fn broadcast_ipi(&self) {
        let me = current_cpu();
        for target in (0..self.cpus.len() as CpuId).filter(|&cpu| cpu != me) {
            self.raise_ipi(target);
        }
    }

    fn invalidate_page(&self, vaddr: VirtualAddress) {
        self.here().invalidated.lock().unwrap().push(vaddr.as_u64());
    }

    fn current_address_space(&self) -> AddressSpaceId {
        AddressSpaceId::new(self.here().address_space.load(Ordering::SeqCst))
    }

    fn load_address_space(&self, space: AddressSpaceId) {
        let cpu = self.here();
        cpu.address_space_loads.fetch_add(1, Ordering::SeqCst);
        cpu.address_space.store(space.root(), Ordering::SeqCst);
    }

    fn fast_random(&self) -> u8 {
        if let Some(byte) = self.scripted_random.lock().unwrap().pop_front() {
            return byte;
        }
        let mut x = self.random_state.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.random_state.store(x, Ordering::Relaxed);
        (x >> 56) as u8
    }

    fn halt(&self) -> ! {
        self.here().halted.store(true, Ordering::SeqCst);
        panic::panic_any(SimHalted)
    }

    fn relax(&self) {
        thread::yield_now();
    }
}

unsafe impl ContextSwitch for SimMachine {
    unsafe fn switch(&self, runtime: &SmpRuntime, from: *mut ThreadContext, to: *mut ThreadContext) {
        let live = self.here().live.lock().unwrap().regs;
        unsafe { (*from).regs = SavedRegisters { rsp0: (*from).regs.rsp0, ..live } };
        unsafe { self.enter(runtime, from, to) };
    }

    unsafe fn resume(&self, runtime: &SmpRuntime, thread: *mut ThreadContext) -> ! {
        unsafe { self.enter(runtime, thread, thread) };
        panic::panic_any(SimResumed)
    }

    fn first_entry_point(&self) -> u64 {
        FIRST_ENTRY
    }

    unsafe fn save_fpu(&self, mode: FpuSaveMode, state: &mut FpuState) {
        let cpu = self.here();
        cpu.fpu_modes.lock().unwrap().push(mode);
        *state = cpu.live.lock().unwrap().fpu.clone();
    }

    unsafe fn restore_fpu(&self, mode: FpuSaveMode, state: &FpuState) {
        let cpu = self.here();
        cpu.fpu_modes.lock().unwrap().push(mode);
        cpu.live.lock().unwrap().fpu = state.clone();
    }

    unsafe fn read_debug_registers(&self, into: &mut DebugRegisters) {
        *into = self.here().live.lock().unwrap().debug;
    }

    unsafe fn write_debug_registers(&self, from: &DebugRegisters) {
        self.here().live.lock().unwrap().debug = *from;
    }

    unsafe fn clear_debug_registers(&self) {
        self.here().live.lock().unwrap().debug = DebugRegisters::default();
    }

    unsafe fn set_tls_base(&self, base: u64) {
        self.here().live.lock().unwrap().tls_base = base;
    }
}

/// Features of a current `x86_64` processor with AVX enabled by the OS.
pub fn avx_features() -> CpuFeatures {
    CpuFeatures::new()
        .with_fpu(true)
        .with_sse(true)
        .with_sse2(true)
        .with_fxsr(true)
        .with_xsave(true)
        .with_osxsave(true)
        .with_avx(true)
}

/// Sets the flag when dropped, so service threads also stop when the test
/// body panics.
pub struct StopOnDrop<'a>(pub &'a AtomicBool);

impl Drop for StopOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub struct Sim {
    pub machine: &'static SimMachine,
    pub runtime: &'static SmpRuntime,
}

impl Sim {
    /// Brings up every processor of `config` with `features`; messaging
    /// stays off. The calling OS thread becomes CPU 0 with interrupts on.
    pub fn with_features(config: SmpConfig, features: CpuFeatures) -> Self {
        let machine: &'static SimMachine = Box::leak(Box::new(SimMachine::new(config.cpu_count)));
        let runtime: &'static SmpRuntime =
            Box::leak(Box::new(SmpRuntime::new(config, machine, machine).unwrap()));
        for cpu in 0..config.cpu_count as CpuId {
            runtime
                .initialize_processor(cpu, Capabilities::new(features, 46, 48))
                .unwrap();
        }
        set_current_cpu(0);
        machine.set_interrupts(0, true);
        Self { machine, runtime }
    }

    pub fn new(config: SmpConfig) -> Self {
        Self::with_features(config, avx_features())
    }

    /// Turns on messaging.
    #[must_use]
    pub fn enabled(self) -> Self {
        self.runtime.enable_smp().unwrap();
        self
    }

    /// Takes the IPI pending on the calling CPU, if interrupts allow it.
    pub fn poll_interrupts(&self) -> bool {
        let cpu = self.machine.cpu(current_cpu());
        if !self.machine.interrupts_enabled() || !cpu.ipi_pending.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.machine.disable_interrupts();
        let prev = self.runtime.enter_irq();
        self.runtime.exit_irq(prev);
        self.machine.enable_interrupts();
        true
    }

    /// Services `cpu`'s interrupts on the calling OS thread until `stop` is set
    /// or the CPU halts.
    pub fn service(&self, cpu: CpuId, stop: &AtomicBool) {
        set_current_cpu(cpu);
        self.machine.set_interrupts(cpu, true);
        unwinds_with::<SimHalted>(|| {
            while !stop.load(Ordering::SeqCst) {
                self.poll_interrupts();
                thread::yield_now();
            }
        });
    }

    /// Runs `body` as CPU 0 while every other CPU services its interrupts
    /// on its own OS thread.
    pub fn run<R>(&self, body: impl FnOnce() -> R) -> R {
        let stop = AtomicBool::new(false);
        thread::scope(|s| {
            for cpu in 1..self.runtime.cpu_count() as CpuId {
                let stop = &stop;
                s.spawn(move || self.service(cpu, stop));
            }
            let _stop = StopOnDrop(&stop);
            set_current_cpu(0);
            body()
        })
    }
}

/// Convenience: `cpu_count` processors with messaging enabled.
pub fn boot(cpu_count: usize) -> Sim {
    Sim::new(SmpConfig::new(cpu_count)).enabled()
}

/// A small deterministic generator for register and FPU images.
pub struct XorShift(u64);

impl XorShift {
    pub const fn new(seed: u64) -> Self {
        Self(seed | 1)
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    pub fn registers(&mut self) -> SavedRegisters {
        SavedRegisters {
            rbx: self.next_u64(),
            rbp: self.next_u64(),
            r12: self.next_u64(),
            r13: self.next_u64(),
            r14: self.next_u64(),
            r15: self.next_u64(),
            rsp: self.next_u64(),
            rip: self.next_u64() | 1,
            rflags: 0x202,
            rsp0: 0,
        }
    }

    pub fn fpu(&mut self) -> FpuState {
        let mut state = FpuState::default();
        for chunk in state.bytes.chunks_exact_mut(8) {
            chunk.copy_from_slice(&self.next_u64().to_le_bytes());
        }
        state
    }
}

/// A 16-byte aligned kernel stack that lives for the rest of the test run.
#[repr(C, align(16))]
pub struct Stack(pub [u8; 8192]);

pub fn leak_stack() -> u64 {
    let stack: &'static mut Stack = Box::leak(Box::new(Stack([0; 8192])));
    stack.0.as_ptr() as u64 + stack.0.len() as u64
}

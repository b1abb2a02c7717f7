use crate::SmpRuntime;
use log::trace;

impl SmpRuntime {
    /// Records entry into an interrupt handler and returns the previous
    /// nesting level for [`exit_irq`](Self::exit_irq).
    pub fn enter_irq(&self) -> u32 {
        let cpu = self.current();
        let prev = cpu.in_irq();
        cpu.set_irq_depth(prev + 1);
        prev
    }

    /// Leaves an interrupt handler.
    ///
    /// While returning, the processor handles its pending messages and
    /// deferred calls; once it is back outside every interrupt and critical
    /// section a pending reschedule runs.
    ///
    /// # Panics
    ///
    /// Panics if interrupts are enabled or `prev_level` is not below the
    /// current nesting level.
    pub fn exit_irq(&self, prev_level: u32) {
        assert!(
            !self.platform.interrupts_enabled(),
            "exit_irq with interrupts enabled"
        );

        let cpu = self.current();
        // keep the scheduler out while draining
        let depth = cpu.in_critical();
        cpu.set_critical_depth(depth + 1);

        let level = cpu.in_irq();
        assert!(
            prev_level < level,
            "CPU {}: exit_irq to level {prev_level} from level {level}",
            cpu.id()
        );
        cpu.set_irq_depth(prev_level);

        if self.is_smp_enabled() {
            self.drain_pending_messages();
        }
        self.execute_deferred_calls();

        let cpu = self.current();
        let depth = cpu.in_critical();
        cpu.set_critical_depth(depth - 1);
        if cpu.in_irq() == 0 && depth == 1 {
            self.check_invoke_scheduler();
        }
    }

    /// Requests a reschedule on the calling processor at its next safe point.
    pub fn invoke_scheduler_async(&self) {
        let cpu = self.current();
        trace!("CPU {}: reschedule requested", cpu.id());
        cpu.request_scheduler();
    }

    /// Runs a pending reschedule if a scheduler is attached.
    ///
    /// # Panics
    ///
    /// Panics if called inside an interrupt handler or critical section.
    pub fn check_invoke_scheduler(&self) {
        let cpu = self.current();
        assert_eq!(cpu.in_irq(), 0, "CPU {}: scheduler check in IRQ", cpu.id());
        assert_eq!(
            cpu.in_critical(),
            0,
            "CPU {}: scheduler check in critical section",
            cpu.id()
        );

        let Some(hooks) = self.scheduler.get() else {
            return;
        };
        if cpu.take_scheduler_request() {
            hooks.invoke_async(self, cpu.id());
        }
    }
}

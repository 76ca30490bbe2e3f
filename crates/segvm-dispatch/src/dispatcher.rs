use std::sync::atomic::{AtomicU8, Ordering};

use segvm_arch_x86::{BREAKPOINT_COUNT, Eflags, GuestCpuContext, Selector};
use segvm_core::{
    Config, ExceptionCode, ExceptionRecord, GuestMemory, Hex, NoPorts, NoVirtualMemory, PortIo,
    Resolution, VirtualMemory,
};
use segvm_emu::{Emulator, Machine};
use segvm_ldt::SelectorTable;

use crate::{DebugRegisters, ExceptionChain, NoDebugRegisters};

/// Decides what happens to a classified fault.
///
/// A fault is first offered to the local recovery paths: the virtual
/// memory manager for access violations, the instruction emulator for
/// privileged instructions, segment loads and faults of 16-bit code, and
/// the stray alignment check fixup. Whatever they cannot resolve is
/// escalated to the guest's structured exception chain.
pub struct FaultDispatcher<'a> {
    table: &'a SelectorTable,
    machine: Machine,
    memory: Box<dyn GuestMemory + Send + Sync + 'a>,
    ports: Box<dyn PortIo + Send + Sync + 'a>,
    chain: Box<dyn ExceptionChain + Send + Sync + 'a>,
    vm: Box<dyn VirtualMemory + Send + Sync + 'a>,
    debug: Box<dyn DebugRegisters + Send + Sync + 'a>,
    clear_stray_alignment_check: bool,
    one_shot_watchpoints: AtomicU8,
}

impl<'a> FaultDispatcher<'a> {
    /// Creates a dispatcher.
    ///
    /// Port I/O, the virtual memory manager and the debug registers start
    /// out detached; attach them with the `with_*` methods.
    pub fn new(
        config: &Config,
        table: &'a SelectorTable,
        machine: Machine,
        memory: impl GuestMemory + Send + Sync + 'a,
        chain: impl ExceptionChain + Send + Sync + 'a,
    ) -> Self {
        Self {
            table,
            machine,
            memory: Box::new(memory),
            ports: Box::new(NoPorts),
            chain: Box::new(chain),
            vm: Box::new(NoVirtualMemory),
            debug: Box::new(NoDebugRegisters),
            clear_stray_alignment_check: config.clear_stray_alignment_check,
            one_shot_watchpoints: AtomicU8::new(0),
        }
    }

    /// Attaches port I/O devices.
    pub fn with_ports(self, ports: impl PortIo + Send + Sync + 'a) -> Self {
        Self {
            ports: Box::new(ports),
            ..self
        }
    }

    /// Attaches the virtual memory manager.
    pub fn with_virtual_memory(self, vm: impl VirtualMemory + Send + Sync + 'a) -> Self {
        Self {
            vm: Box::new(vm),
            ..self
        }
    }

    /// Attaches the debug registers of the host.
    pub fn with_debug_registers(self, debug: impl DebugRegisters + Send + Sync + 'a) -> Self {
        Self {
            debug: Box::new(debug),
            ..self
        }
    }

    /// Returns the selector table.
    pub fn table(&self) -> &'a SelectorTable {
        self.table
    }

    /// Returns the emulated machine state.
    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// Points the software interrupt `vector` at the 16-bit handler
    /// `selector:offset`.
    pub fn register_vector_handler(&self, vector: u8, selector: Selector, offset: u16) {
        tracing::debug!(vector, %selector, offset, "interrupt vector registered");
        self.machine.vectors().set(vector, selector, offset);
    }

    /// Marks hardware watchpoints as one-shot. Bit `n` of `mask` stands
    /// for watchpoint `n`; a one-shot watchpoint is disabled in DR7 once
    /// it fires.
    pub fn set_one_shot_watchpoints(&self, mask: u8) {
        self.one_shot_watchpoints
            .store(mask & ((1 << BREAKPOINT_COUNT) - 1), Ordering::Relaxed);
    }

    /// Checks whether `selector` describes 16-bit code.
    pub fn is_16bit_code(&self, selector: Selector) -> bool {
        !self.table.is_system(selector) && !self.table.is_32bit(selector)
    }

    /// Resolves a classified fault.
    ///
    /// On [`Resolution::ContinueExecution`] the guest resumes with `ctx`;
    /// on [`Resolution::ContinueSearch`] nobody accepted the fault.
    pub fn raise(&self, record: &mut ExceptionRecord, ctx: &mut GuestCpuContext) -> Resolution {
        let saved = self.debug.get();
        ctx.set_debug_registers(&saved);

        let resolution = match self.resolve_locally(record, ctx) {
            true => Resolution::ContinueExecution,
            false => self.escalate(record, ctx),
        };

        let current = ctx.debug_registers();
        if current != saved {
            tracing::trace!(?current, "restoring debug registers");
            self.debug.set(&current);
        }

        resolution
    }

    fn resolve_locally(&self, record: &ExceptionRecord, ctx: &mut GuestCpuContext) -> bool {
        match record.code {
            ExceptionCode::AccessViolation => {
                let Some((access, address)) = record.access()
                else {
                    return false;
                };

                if self.vm.try_resolve_fault(address, access) {
                    tracing::trace!(address = %Hex(address), ?access, "resolved by virtual memory");
                    return true;
                }

                let in_idt = u32::try_from(address)
                    .is_ok_and(|address| self.machine.idt().contains(address, 1));

                // Segment loads fault the same way from flat code, where a
                // BIOS data selector still needs substituting.
                let emulator = self.emulator();
                if self.is_16bit_code(ctx.cs) || in_idt || emulator.is_at_segment_load(ctx) {
                    return emulator.try_emulate(ctx);
                }

                false
            }

            ExceptionCode::DataMisalignment => {
                if self.clear_stray_alignment_check && ctx.eflags.alignment_check() {
                    tracing::debug!(eip = %Hex(ctx.eip), "clearing stray alignment check");
                    ctx.eflags = ctx.eflags.without(Eflags::ALIGNMENT_CHECK);
                    return true;
                }

                false
            }

            ExceptionCode::PrivilegedInstruction => self.emulator().try_emulate(ctx),

            _ => false,
        }
    }

    fn escalate(&self, record: &ExceptionRecord, ctx: &mut GuestCpuContext) -> Resolution {
        if record.code == ExceptionCode::SingleStep {
            self.disable_fired_watchpoints(ctx);
        }

        tracing::debug!(
            code = ?record.code,
            address = %Hex(record.address),
            "escalating exception"
        );

        let resolution = self.chain.escalate(record, ctx);

        if resolution == Resolution::ContinueExecution && !record.is_continuable() {
            tracing::error!(code = ?record.code, "handler continued a non-continuable exception");
            return Resolution::ContinueSearch;
        }

        resolution
    }

    fn disable_fired_watchpoints(&self, ctx: &mut GuestCpuContext) {
        let one_shot = self.one_shot_watchpoints.load(Ordering::Relaxed);

        for n in 0..BREAKPOINT_COUNT {
            if one_shot & (1 << n) != 0 && ctx.dr6.hit(n) {
                tracing::debug!(watchpoint = n, "disabling one-shot watchpoint");
                ctx.dr7 = ctx.dr7.disable(n);
            }
        }
    }

    fn emulator(&self) -> Emulator<'_, &dyn GuestMemory, &dyn PortIo> {
        Emulator::new(
            self.table,
            &self.machine,
            &*self.memory as &dyn GuestMemory,
            &*self.ports as &dyn PortIo,
        )
    }
}

impl std::fmt::Debug for FaultDispatcher<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("FaultDispatcher")
            .field("table", &self.table)
            .field("machine", &self.machine)
            .field(
                "clear_stray_alignment_check",
                &self.clear_stray_alignment_check,
            )
            .field(
                "one_shot_watchpoints",
                &self.one_shot_watchpoints.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

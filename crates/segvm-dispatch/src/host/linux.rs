use std::{
    arch::asm,
    io,
    mem::{MaybeUninit, size_of},
    ops::Range,
    ptr,
};

use libc::{c_int, c_void, greg_t, sigset_t, siginfo_t, ucontext_t};
use memmap2::MmapMut;
use once_cell::sync::OnceCell;
use segvm_arch_x86::{Eflags, Gpr, GuestCpuContext, PAGE_SIZE, Selector, TrapVector};
use segvm_core::{Config, ExceptionRecord, Hex, Resolution, SegvmError};
use segvm_emu::MAX_INSTRUCTION_LENGTH;
use segvm_ldt::SelectorTable;

use crate::{FaultDispatcher, NativeFault, classify, is_known_trap};

/// Type of `mcontext_t::gregs` on x86_64 glibc; `libc` does not export it.
#[allow(non_camel_case_types)]
type gregset_t = [greg_t; 23];

/// Signals that report synchronous faults.
const FAULT_SIGNALS: [c_int; 5] = [
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGILL,
    libc::SIGFPE,
    libc::SIGTRAP,
];

/// Signals blocked while a fault frame is built, in addition to the
/// resume signal. [`raise_trampoline`] lifts them.
const BLOCKED_SIGNALS: [c_int; 9] = [
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGILL,
    libc::SIGFPE,
    libc::SIGTRAP,
    libc::SIGALRM,
    libc::SIGIO,
    libc::SIGUSR1,
    libc::SIGUSR2,
];

/// Bytes below the stack pointer the interrupted code may still use.
const RED_ZONE: u64 = 128;

/// Marks an initialized [`ThreadBlock`].
const THREAD_MAGIC: u64 = 0x7365_6776_6d74_6872;

const ARCH_SET_FS: c_int = 0x1002;
const ARCH_GET_FS: c_int = 0x1003;

/// Process-wide state of the installed handlers.
struct HostState {
    dispatcher: FaultDispatcher<'static>,
    resume_signal: c_int,
    handler_mask: sigset_t,
    signal_stack_size: usize,
    code_selector: u16,
    stack_selector: u16,
}

static HOST: OnceCell<HostState> = OnceCell::new();

/// Per-thread state, stored at the base of the aligned alternate signal
/// stack so the handler can find it without touching thread-local
/// storage.
#[repr(C)]
struct ThreadBlock {
    magic: u64,
    fs_base: u64,
    scratch_top: u64,
    stack_guard: Option<Range<u64>>,
    resume: Option<ResumeState>,
}

/// What the resume signal writes back into the native frame.
#[repr(C)]
struct ResumeState {
    context: GuestCpuContext,
    original: GuestCpuContext,
    gregs: gregset_t,
    mask: sigset_t,
}

/// Built by the fault handler on the working stack and consumed by
/// [`raise_trampoline`].
#[repr(C)]
struct FaultFrame {
    record: ExceptionRecord,
    context: GuestCpuContext,
    original: GuestCpuContext,
    trap: TrapVector,
    gregs: gregset_t,
    saved_mask: sigset_t,
    block: *mut ThreadBlock,
}

/// Installs the process-wide fault handlers.
///
/// The dispatcher lives for the rest of the process. Threads running
/// guest code must call [`ThreadState::attach`] with the same
/// configuration.
pub fn install(dispatcher: FaultDispatcher<'static>, config: &Config) -> Result<(), SegvmError> {
    let resume_signal = config.resume_signal.unwrap_or(libc::SIGUSR2);

    let mut handler_mask = empty_signal_set();
    for signal in BLOCKED_SIGNALS.into_iter().chain([resume_signal]) {
        // SAFETY: `handler_mask` is an initialized signal set.
        unsafe { libc::sigaddset(&mut handler_mask, signal) };
    }

    let state = HostState {
        dispatcher,
        resume_signal,
        handler_mask,
        signal_stack_size: config.signal_stack_size,
        code_selector: read_cs(),
        stack_selector: read_ss(),
    };

    if HOST.set(state).is_err() {
        return Err(SegvmError::AlreadyInstalled);
    }

    for signal in FAULT_SIGNALS {
        set_handler(signal, fault_handler as usize, &handler_mask)?;
    }

    set_handler(resume_signal, resume_handler as usize, &handler_mask)?;

    tracing::debug!(resume_signal, "fault handlers installed");
    Ok(())
}

fn set_handler(signal: c_int, handler: usize, mask: &sigset_t) -> Result<(), SegvmError> {
    // SAFETY: `sigaction` is plain old data; every field is set below.
    let mut action: libc::sigaction = unsafe { MaybeUninit::zeroed().assume_init() };
    action.sa_sigaction = handler;
    action.sa_mask = *mask;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;

    // SAFETY: `action` is fully initialized and the handler has the
    // `SA_SIGINFO` signature.
    if unsafe { libc::sigaction(signal, &action, ptr::null_mut()) } != 0 {
        let err = io::Error::last_os_error();
        tracing::error!(signal, %err, "failed to install signal handler");
        return Err(err.into());
    }

    Ok(())
}

/// Per-thread fault state: the alternate signal stack with the thread
/// block at its base, and the scratch stack used when the fault came
/// from 16-bit code.
///
/// Dropping the state detaches the thread.
pub struct ThreadState {
    _signal_stack: MmapMut,
    _scratch_stack: MmapMut,
    block: *mut ThreadBlock,
}

impl ThreadState {
    /// Attaches the calling thread.
    pub fn attach(config: &Config) -> Result<Self, SegvmError> {
        let size = config.signal_stack_size;
        if !size.is_power_of_two() || size < libc::SIGSTKSZ * 2 {
            return Err(SegvmError::Other(
                "signal stack size must be a power of two of at least 2 * SIGSTKSZ",
            ));
        }

        // Twice the size, so an aligned window always fits.
        let mut signal_stack = MmapMut::map_anon(size * 2)?;
        let start = signal_stack.as_mut_ptr() as usize;
        let base = (start + size - 1) & !(size - 1);

        let mut scratch_stack = MmapMut::map_anon(config.scratch_stack_size)?;
        let scratch_top =
            (scratch_stack.as_mut_ptr() as usize + scratch_stack.len()) as u64 & !15;

        let block = base as *mut ThreadBlock;

        // SAFETY: `base` is aligned and the window `[base, base + size)`
        // lies inside `signal_stack`.
        unsafe {
            block.write(ThreadBlock {
                magic: THREAD_MAGIC,
                fs_base: read_fs_base()?,
                scratch_top,
                stack_guard: stack_guard(),
                resume: None,
            })
        };

        let header = size_of::<ThreadBlock>().next_multiple_of(64);
        let stack = libc::stack_t {
            ss_sp: (base + header) as *mut c_void,
            ss_flags: 0,
            ss_size: size - header,
        };

        // SAFETY: the stack lives as long as the returned state, which
        // disables it on drop.
        if unsafe { libc::sigaltstack(&stack, ptr::null_mut()) } != 0 {
            return Err(io::Error::last_os_error().into());
        }

        tracing::debug!(base = %Hex(base), size, "thread attached");

        Ok(Self {
            _signal_stack: signal_stack,
            _scratch_stack: scratch_stack,
            block,
        })
    }
}

impl Drop for ThreadState {
    fn drop(&mut self) {
        let stack = libc::stack_t {
            ss_sp: ptr::null_mut(),
            ss_flags: libc::SS_DISABLE,
            ss_size: 0,
        };

        // SAFETY: disabling the alternate stack has no preconditions, and
        // `block` points into the still mapped signal stack.
        unsafe {
            libc::sigaltstack(&stack, ptr::null_mut());
            (*self.block).magic = 0;
        }
    }
}

impl std::fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ThreadState")
            .field("block", &self.block)
            .finish_non_exhaustive()
    }
}

///////////////////////////////////////////////////////////////////////////////
// Signal handlers
///////////////////////////////////////////////////////////////////////////////

/// Captures and classifies the fault, then redirects the interrupted
/// thread into [`raise_trampoline`].
///
/// Runs on the alternate signal stack. Must not allocate, lock or log.
extern "C" fn fault_handler(signal: c_int, _info: *mut siginfo_t, uc: *mut c_void) {
    let Some(host) = HOST.get()
    else {
        return restore_default(signal);
    };

    let block = current_block(host);
    if block.is_null() {
        return restore_default(signal);
    }

    // SAFETY: the kernel passes a valid `ucontext_t` to `SA_SIGINFO`
    // handlers, and `block` was checked above.
    let (uc, block) = unsafe { (&mut *(uc as *mut ucontext_t), &mut *block) };
    let gregs = &mut uc.uc_mcontext.gregs;
    let table = host.dispatcher.table();

    let context = capture(gregs);
    let mut fault = NativeFault::new(TrapVector(greg(gregs, libc::REG_TRAPNO) as u8), context)
        .with_error_code(greg(gregs, libc::REG_ERR) as u32)
        .with_fault_address(greg(gregs, libc::REG_CR2) as u64);

    if !uc.uc_mcontext.fpregs.is_null() {
        // SAFETY: a non-null `fpregs` points at the saved FPU state.
        let fpu = unsafe { &*uc.uc_mcontext.fpregs };
        fault = fault.with_fpu(fpu.swd, fpu.cwd).with_mxcsr(fpu.mxcsr);
    }

    if let Some(guard) = &block.stack_guard {
        fault = fault.with_stack_guard(guard.clone());
    }

    let mut code = [0u8; MAX_INSTRUCTION_LENGTH];
    if let Some(address) = code_address(table, &context, greg(gregs, libc::REG_RIP) as u64) {
        let length = read_code(address, &mut code);
        fault = fault.with_code(&code[..length]);
    }

    let record = classify(&fault);

    let use_scratch = !table.is_system(context.cs) || !table.is_system(context.ss);
    let top = match use_scratch {
        true => block.scratch_top,
        false => (greg(gregs, libc::REG_RSP) as u64).wrapping_sub(RED_ZONE),
    };

    let frame_address = (top - size_of::<FaultFrame>() as u64) & !15;
    let frame = frame_address as *mut FaultFrame;

    // SAFETY: the frame lies below the stack pointer of the interrupted
    // thread (or on its scratch stack), which nothing else uses until the
    // trampoline runs.
    unsafe {
        frame.write(FaultFrame {
            record,
            context,
            original: context,
            trap: fault.trap,
            gregs: *gregs,
            saved_mask: uc.uc_sigmask,
            block,
        })
    };

    let eflags = Eflags(greg(gregs, libc::REG_EFL) as u32)
        .without(Eflags::NESTED_TASK | Eflags::TRAP | Eflags::ALIGNMENT_CHECK);
    set_greg(gregs, libc::REG_EFL, eflags.0 as u64);

    // Enter the trampoline as if called, with the return address slot
    // keeping the stack 16-byte aligned.
    set_greg(gregs, libc::REG_RIP, raise_trampoline as usize as u64);
    set_greg(gregs, libc::REG_RSP, frame_address - 8);
    set_greg(gregs, libc::REG_RDI, frame_address);

    let segments = greg(gregs, libc::REG_CSGSFS) as u64;
    let segments = (segments & 0x0000_ffff_ffff_0000)
        | host.code_selector as u64
        | (host.stack_selector as u64) << 48;
    set_greg(gregs, libc::REG_CSGSFS, segments);

    uc.uc_sigmask = host.handler_mask;
}

/// Writes the resolved context back into the native frame.
extern "C" fn resume_handler(signal: c_int, _info: *mut siginfo_t, uc: *mut c_void) {
    let Some(host) = HOST.get()
    else {
        return restore_default(signal);
    };

    let block = current_block(host);
    if block.is_null() {
        return;
    }

    // SAFETY: as in `fault_handler`.
    let (uc, block) = unsafe { (&mut *(uc as *mut ucontext_t), &mut *block) };
    let Some(state) = block.resume.take()
    else {
        return;
    };

    let gregs = &mut uc.uc_mcontext.gregs;
    *gregs = state.gregs;
    write_back(gregs, &state.context, &state.original);
    uc.uc_sigmask = state.mask;

    // Data segment registers are not part of the native frame.
    if state.context.ds != state.original.ds {
        load_ds(state.context.ds.0);
    }

    if state.context.es != state.original.es {
        load_es(state.context.es.0);
    }
}

/// Runs the dispatcher on the faulting thread, outside of the signal
/// handler.
extern "C" fn raise_trampoline(frame: *mut FaultFrame) -> ! {
    // SAFETY: `fault_handler` passes a frame it just wrote, together with
    // the thread block it found.
    let frame = unsafe { &mut *frame };
    let block = unsafe { &mut *frame.block };

    // Without the host's thread pointer nothing below can run.
    if write_fs_base(block.fs_base).is_err() {
        std::process::abort();
    }

    let Some(host) = HOST.get()
    else {
        std::process::abort();
    };

    // The handler mask only covers building the frame. Guest exception
    // handlers run under the interrupted thread's own mask and may fault
    // again.
    let mut mask = frame.saved_mask;

    // SAFETY: `mask` is an initialized signal set.
    unsafe {
        libc::sigdelset(&mut mask, host.resume_signal);
        libc::pthread_sigmask(libc::SIG_SETMASK, &mask, ptr::null_mut());
    }

    if !is_known_trap(frame.trap) {
        tracing::error!(trap = frame.trap.0, eip = %Hex(frame.context.eip), "unknown trap");
    }

    match host.dispatcher.raise(&mut frame.record, &mut frame.context) {
        Resolution::ContinueExecution => resume(host, block, frame),
        Resolution::ContinueSearch => {
            tracing::error!(
                code = ?frame.record.code,
                address = %Hex(frame.record.address),
                context = ?frame.context,
                "unhandled exception"
            );
            std::process::abort();
        }
    }
}

fn resume(host: &HostState, block: &mut ThreadBlock, frame: &FaultFrame) -> ! {
    block.resume = Some(ResumeState {
        context: frame.context,
        original: frame.original,
        gregs: frame.gregs,
        mask: frame.saved_mask,
    });

    let mut unblock = empty_signal_set();

    // SAFETY: `unblock` is an initialized signal set. Raising the resume
    // signal never returns here: its handler replaces the native frame.
    unsafe {
        libc::sigaddset(&mut unblock, host.resume_signal);
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &unblock, ptr::null_mut());
        libc::raise(host.resume_signal);
    }

    tracing::error!("resume signal returned");
    std::process::abort();
}

///////////////////////////////////////////////////////////////////////////////
// Native frame helpers
///////////////////////////////////////////////////////////////////////////////

fn greg(gregs: &gregset_t, index: c_int) -> greg_t {
    gregs[index as usize]
}

fn set_greg(gregs: &mut gregset_t, index: c_int, value: u64) {
    gregs[index as usize] = value as greg_t;
}

const GPRS: [c_int; 8] = [
    libc::REG_RAX,
    libc::REG_RCX,
    libc::REG_RDX,
    libc::REG_RBX,
    libc::REG_RSP,
    libc::REG_RBP,
    libc::REG_RSI,
    libc::REG_RDI,
];

fn capture(gregs: &gregset_t) -> GuestCpuContext {
    let value = |index| greg(gregs, index) as u32;
    let segments = greg(gregs, libc::REG_CSGSFS) as u64;

    GuestCpuContext {
        eax: value(libc::REG_RAX),
        ebx: value(libc::REG_RBX),
        ecx: value(libc::REG_RCX),
        edx: value(libc::REG_RDX),
        esi: value(libc::REG_RSI),
        edi: value(libc::REG_RDI),
        ebp: value(libc::REG_RBP),
        esp: value(libc::REG_RSP),
        eip: value(libc::REG_RIP),
        eflags: Eflags(value(libc::REG_EFL)),

        cs: Selector(segments as u16),
        gs: Selector((segments >> 16) as u16),
        fs: Selector((segments >> 32) as u16),
        ss: Selector((segments >> 48) as u16),
        ds: Selector(read_ds()),
        es: Selector(read_es()),

        ..Default::default()
    }
}

/// Writes the registers the dispatcher changed. Unchanged registers keep
/// their full 64-bit value.
fn write_back(gregs: &mut gregset_t, context: &GuestCpuContext, original: &GuestCpuContext) {
    let registers = [
        Gpr::Eax,
        Gpr::Ecx,
        Gpr::Edx,
        Gpr::Ebx,
        Gpr::Esp,
        Gpr::Ebp,
        Gpr::Esi,
        Gpr::Edi,
    ];

    for (register, index) in registers.into_iter().zip(GPRS) {
        let value = context.gpr(register);
        if value != original.gpr(register) {
            set_greg(gregs, index, value as u64);
        }
    }

    if context.eip != original.eip {
        set_greg(gregs, libc::REG_RIP, context.eip as u64);
    }

    if context.eflags != original.eflags {
        set_greg(gregs, libc::REG_EFL, context.eflags.0 as u64);
    }

    let segments = context.cs.0 as u64
        | (context.gs.0 as u64) << 16
        | (context.fs.0 as u64) << 32
        | (context.ss.0 as u64) << 48;
    set_greg(gregs, libc::REG_CSGSFS, segments);
}

/// Linear address of the instruction at `cs:eip`.
fn code_address(table: &SelectorTable, ctx: &GuestCpuContext, rip: u64) -> Option<u64> {
    if table.is_system(ctx.cs) {
        return Some(rip);
    }

    table
        .map_segmented_to_linear(ctx.cs, ctx.eip)
        .map(u64::from)
}

/// Copies instruction bytes without faulting. Returns the number of
/// bytes read; the copy stops at the first unreadable page.
fn read_code(address: u64, buffer: &mut [u8; MAX_INSTRUCTION_LENGTH]) -> usize {
    let page_end = (address | (PAGE_SIZE as u64 - 1)).wrapping_add(1);
    let first = (page_end.wrapping_sub(address) as usize).min(buffer.len());

    let local = libc::iovec {
        iov_base: buffer.as_mut_ptr() as *mut c_void,
        iov_len: buffer.len(),
    };

    let remote = [
        libc::iovec {
            iov_base: address as *mut c_void,
            iov_len: first,
        },
        libc::iovec {
            iov_base: page_end as *mut c_void,
            iov_len: buffer.len() - first,
        },
    ];

    // SAFETY: `process_vm_readv` validates the remote ranges and writes
    // at most `buffer.len()` bytes into `buffer`.
    let read = unsafe {
        libc::process_vm_readv(libc::getpid(), &local, 1, remote.as_ptr(), 2, 0)
    };

    read.max(0) as usize
}

/// Locates the thread block from the stack pointer of the handler.
fn current_block(host: &HostState) -> *mut ThreadBlock {
    // SAFETY: querying the alternate stack has no preconditions.
    let on_stack = unsafe {
        let mut stack = MaybeUninit::<libc::stack_t>::zeroed();
        libc::sigaltstack(ptr::null(), stack.as_mut_ptr()) == 0
            && stack.assume_init().ss_flags & libc::SS_ONSTACK != 0
    };

    if !on_stack {
        return ptr::null_mut();
    }

    let marker = 0u8;
    let sp = ptr::addr_of!(marker) as usize;
    let block = (sp & !(host.signal_stack_size - 1)) as *mut ThreadBlock;

    // SAFETY: we run on an alternate stack set up by `ThreadState::attach`
    // with the same size, whose aligned base holds the block.
    match unsafe { (*block).magic } {
        THREAD_MAGIC => block,
        _ => ptr::null_mut(),
    }
}

/// Falls back to the default action; the fault repeats and terminates the
/// process.
fn restore_default(signal: c_int) {
    // SAFETY: `signal` is one of the signals we installed a handler for.
    unsafe { libc::signal(signal, libc::SIG_DFL) };
}

fn empty_signal_set() -> sigset_t {
    let mut set = MaybeUninit::<sigset_t>::uninit();

    // SAFETY: `sigemptyset` initializes the set.
    unsafe {
        libc::sigemptyset(set.as_mut_ptr());
        set.assume_init()
    }
}

/// Guard page below the calling thread's stack.
fn stack_guard() -> Option<Range<u64>> {
    let mut attr = MaybeUninit::<libc::pthread_attr_t>::uninit();

    // SAFETY: the attribute object is initialized by `pthread_getattr_np`
    // and destroyed before returning.
    unsafe {
        if libc::pthread_getattr_np(libc::pthread_self(), attr.as_mut_ptr()) != 0 {
            return None;
        }

        let mut address = ptr::null_mut();
        let mut size = 0;
        let mut guard = 0;
        let ok = libc::pthread_attr_getstack(attr.as_ptr(), &mut address, &mut size) == 0
            && libc::pthread_attr_getguardsize(attr.as_ptr(), &mut guard) == 0;
        libc::pthread_attr_destroy(attr.as_mut_ptr());

        if !ok || guard == 0 {
            return None;
        }

        let start = address as u64;
        Some(start.saturating_sub(guard as u64)..start)
    }
}

fn read_fs_base() -> Result<u64, SegvmError> {
    let mut base = 0u64;

    // SAFETY: `ARCH_GET_FS` stores the base through the pointer.
    if unsafe { libc::syscall(libc::SYS_arch_prctl, ARCH_GET_FS, &mut base as *mut u64) } != 0 {
        return Err(io::Error::last_os_error().into());
    }

    Ok(base)
}

fn write_fs_base(base: u64) -> Result<(), SegvmError> {
    // SAFETY: `base` is the thread's own base captured at attach time.
    if unsafe { libc::syscall(libc::SYS_arch_prctl, ARCH_SET_FS, base) } != 0 {
        return Err(io::Error::last_os_error().into());
    }

    Ok(())
}

macro_rules! read_segment {
    ($name:ident, $register:literal) => {
        fn $name() -> u16 {
            let value: u16;

            // SAFETY: reading a segment register has no side effects.
            unsafe {
                asm!(
                    concat!("mov {0:x}, ", $register),
                    out(reg) value,
                    options(nomem, nostack, preserves_flags),
                )
            };

            value
        }
    };
}

macro_rules! load_segment {
    ($name:ident, $register:literal) => {
        fn $name(value: u16) {
            // SAFETY: only selectors accepted by the emulator are loaded.
            unsafe {
                asm!(
                    concat!("mov ", $register, ", {0:x}"),
                    in(reg) value,
                    options(nostack, preserves_flags),
                )
            };
        }
    };
}

read_segment!(read_cs, "cs");
read_segment!(read_ss, "ss");
read_segment!(read_ds, "ds");
read_segment!(read_es, "es");
load_segment!(load_ds, "ds");
load_segment!(load_es, "es");

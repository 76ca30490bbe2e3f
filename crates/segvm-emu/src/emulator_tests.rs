use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use segvm_arch_x86::{DescriptorFlags, Eflags, GuestCpuContext, Selector};
use segvm_core::{Config, GuestMemory, Linear, MemoryError, PortIo, PortWidth};
use segvm_ldt::{SelectorId, SelectorTable, SoftwareBackend};

use crate::{EmulationError, Emulator, Machine, TickSource};

///////////////////////////////////////////////////////////////////////////////
// Mock Collaborators
///////////////////////////////////////////////////////////////////////////////

/// Sparse guest memory. Everything below `UNMAPPED` reads as zero until
/// written.
#[derive(Default)]
struct MockMemory {
    bytes: RefCell<HashMap<u32, u8>>,
}

const UNMAPPED: u32 = 0xc000_0000;

impl MockMemory {
    fn poke(&self, address: u32, data: &[u8]) {
        self.write(Linear(address), data).unwrap();
    }

    fn peek(&self, address: u32, length: usize) -> Vec<u8> {
        let mut buffer = vec![0; length];
        self.read(Linear(address), &mut buffer).unwrap();
        buffer
    }
}

impl GuestMemory for MockMemory {
    fn read(&self, address: Linear, buffer: &mut [u8]) -> Result<(), MemoryError> {
        let bytes = self.bytes.borrow();
        for (n, byte) in buffer.iter_mut().enumerate() {
            let address = address + n as u32;
            if address.0 >= UNMAPPED {
                return Err(MemoryError::Unmapped(address));
            }
            *byte = bytes.get(&address.0).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn write(&self, address: Linear, data: &[u8]) -> Result<(), MemoryError> {
        let mut bytes = self.bytes.borrow_mut();
        for (n, byte) in data.iter().enumerate() {
            let address = address + n as u32;
            if address.0 >= UNMAPPED {
                return Err(MemoryError::Unmapped(address));
            }
            bytes.insert(address.0, *byte);
        }
        Ok(())
    }
}

/// Port devices answering reads from a queue and recording every access.
#[derive(Default)]
struct MockPorts {
    reads: RefCell<VecDeque<u32>>,
    log: RefCell<Vec<(u16, PortWidth, Option<u32>)>>,
}

impl MockPorts {
    fn queue(&self, values: &[u32]) {
        self.reads.borrow_mut().extend(values);
    }

    fn log(&self) -> Vec<(u16, PortWidth, Option<u32>)> {
        self.log.borrow().clone()
    }
}

impl PortIo for MockPorts {
    fn port_read(&self, port: u16, width: PortWidth) -> u32 {
        self.log.borrow_mut().push((port, width, None));
        self.reads.borrow_mut().pop_front().unwrap_or(0xffff_ffff)
    }

    fn port_write(&self, port: u16, width: PortWidth, value: u32) {
        self.log.borrow_mut().push((port, width, Some(value)));
    }
}

#[derive(Default)]
struct MockTicks {
    started: AtomicUsize,
}

impl TickSource for MockTicks {
    fn start(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }
}

///////////////////////////////////////////////////////////////////////////////
// Test Helpers
///////////////////////////////////////////////////////////////////////////////

const CODE_BASE: u32 = 0x0001_0000;
const STACK_BASE: u32 = 0x0002_0000;
const DATA_BASE: u32 = 0x0003_0000;

/// Flat 32-bit system selectors.
const FLAT_CS: Selector = Selector(0x23);
const FLAT_DS: Selector = Selector(0x2b);

struct Fixture {
    table: SelectorTable,
    machine: Machine,
    memory: MockMemory,
    ports: MockPorts,
    ticks: Arc<MockTicks>,
    code: SelectorId,
    stack: SelectorId,
    data: SelectorId,
}

impl Fixture {
    fn new() -> Self {
        let config = Config::default().with_table_size(128);
        let table = SelectorTable::new(&config, SoftwareBackend);
        let ticks = Arc::new(MockTicks::default());
        let machine = Machine::new(&config, ticks.clone());

        let code = Self::segment(&table, CODE_BASE, DescriptorFlags::CODE);
        let stack = Self::segment(&table, STACK_BASE, DescriptorFlags::DATA);
        let data = Self::segment(&table, DATA_BASE, DescriptorFlags::DATA);

        Self {
            table,
            machine,
            memory: MockMemory::default(),
            ports: MockPorts::default(),
            ticks,
            code,
            stack,
            data,
        }
    }

    fn segment(table: &SelectorTable, base: u32, flags: DescriptorFlags) -> SelectorId {
        let id = table.allocate_run(1).unwrap();
        table.set_descriptor(id, base, 0x10000, flags).unwrap();
        id
    }

    fn emulator(&self) -> Emulator<'_, &MockMemory, &MockPorts> {
        Emulator::new(&self.table, &self.machine, &self.memory, &self.ports)
    }

    /// A 16-bit context with `code` at `cs:ip`.
    fn context16(&self, code: &[u8]) -> GuestCpuContext {
        let ctx = GuestCpuContext {
            cs: self.code.selector(),
            ss: self.stack.selector(),
            ds: self.data.selector(),
            es: self.data.selector(),
            eip: 0x0100,
            esp: 0x1000,
            eflags: Eflags(0x0202),
            ..Default::default()
        };

        self.memory.poke(CODE_BASE + ctx.eip, code);
        ctx
    }

    /// A flat 32-bit context with `code` at `eip`.
    fn context32(&self, code: &[u8]) -> GuestCpuContext {
        let ctx = GuestCpuContext {
            cs: FLAT_CS,
            ss: FLAT_DS,
            ds: FLAT_DS,
            es: FLAT_DS,
            eip: 0x0040_1000,
            esp: 0x0060_0000,
            eflags: Eflags(0x0202),
            ..Default::default()
        };

        self.memory.poke(ctx.eip, code);
        ctx
    }

    fn push16(&self, ctx: &mut GuestCpuContext, values: &[u16]) {
        for value in values {
            ctx.esp -= 2;
            self.memory.poke(STACK_BASE + ctx.esp, &value.to_le_bytes());
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
// Segment register loads
///////////////////////////////////////////////////////////////////////////////

#[test]
fn pop_ds_substitutes_bios_selector() {
    let f = Fixture::new();
    let mut ctx = f.context16(&[0x1f]);
    f.push16(&mut ctx, &[0x0040]);

    f.emulator().emulate(&mut ctx).unwrap();

    let bios = f.machine.bios_data_selector().unwrap();
    assert_eq!(ctx.ds, bios);
    assert_eq!(ctx.eip, 0x0101);
    assert_eq!(ctx.esp, 0x1000);
    assert_eq!(f.table.base(bios), Some(0x400));
    assert_eq!(f.ticks.started.load(Ordering::SeqCst), 1);

    // The selector is created once and the tick source started once.
    let mut ctx = f.context16(&[0x07]);
    f.push16(&mut ctx, &[0x0040]);
    f.emulator().emulate(&mut ctx).unwrap();
    assert_eq!(ctx.es, bios);
    assert_eq!(f.ticks.started.load(Ordering::SeqCst), 1);
}

#[test]
fn pop_segment_operand_size() {
    let f = Fixture::new();

    // o32 pop es
    let mut ctx = f.context16(&[0x66, 0x07]);
    f.push16(&mut ctx, &[0x0000, f.data.raw()]);

    f.emulator().emulate(&mut ctx).unwrap();
    assert_eq!(ctx.es, f.data.selector());
    assert_eq!(ctx.esp, 0x1000);
    assert_eq!(ctx.eip, 0x0102);
}

#[test]
fn pop_null_selector() {
    let f = Fixture::new();

    let mut ctx = f.context16(&[0x0f, 0xa1]);
    f.push16(&mut ctx, &[0x0000]);
    f.emulator().emulate(&mut ctx).unwrap();
    assert!(ctx.fs.is_null());

    // ss cannot be null.
    let mut ctx = f.context16(&[0x17]);
    f.push16(&mut ctx, &[0x0000]);
    let before = ctx;
    assert_eq!(
        f.emulator().emulate(&mut ctx),
        Err(EmulationError::InvalidSelector(0))
    );
    assert_eq!(ctx, before);
}

#[test]
fn lds_sib_invalid_segment_leaves_context() {
    let f = Fixture::new();

    // lds eax, [ebx+ecx*4+8]
    let mut ctx = f.context32(&[0xc5, 0x44, 0x8b, 0x08]);
    ctx.ebx = 0x0050_0000;
    ctx.ecx = 0;
    f.memory.poke(0x0050_0008, &[0x34, 0x12, 0x00, 0x00, 0x37, 0x12]);

    let before = ctx;
    assert_eq!(
        f.emulator().emulate(&mut ctx),
        Err(EmulationError::InvalidSelector(0x1237))
    );
    assert_eq!(ctx, before);
    assert!(!f.emulator().try_emulate(&mut ctx));
    assert_eq!(ctx, before);
}

#[test]
fn lds_sib_loads_far_pointer() {
    let f = Fixture::new();

    let mut ctx = f.context32(&[0xc5, 0x44, 0x8b, 0x08]);
    ctx.eax = 0xffff_ffff;
    ctx.ebx = 0x0050_0000;
    ctx.ecx = 2;

    let selector = f.data.raw().to_le_bytes();
    f.memory.poke(
        0x0050_0010,
        &[0x34, 0x12, 0x00, 0x00, selector[0], selector[1]],
    );

    f.emulator().emulate(&mut ctx).unwrap();
    assert_eq!(ctx.eax, 0x1234);
    assert_eq!(ctx.ds, f.data.selector());
    assert_eq!(ctx.eip, 0x0040_1004);
}

#[test]
fn les_16bit_keeps_high_word() {
    let f = Fixture::new();

    // les di, [bx]
    let mut ctx = f.context16(&[0xc4, 0x3f]);
    ctx.edi = 0xabcd_0000;
    ctx.ebx = 0x20;

    let selector = f.data.raw().to_le_bytes();
    f.memory
        .poke(DATA_BASE + 0x20, &[0x78, 0x56, selector[0], selector[1]]);

    f.emulator().emulate(&mut ctx).unwrap();
    assert_eq!(ctx.edi, 0xabcd_5678);
    assert_eq!(ctx.es, f.data.selector());
    assert_eq!(ctx.eip, 0x0102);
}

#[test]
fn lds_operand_outside_segment() {
    let f = Fixture::new();

    // lds si, [0xfffe]: the selector half lies past the limit.
    let mut ctx = f.context16(&[0xc5, 0x36, 0xfe, 0xff]);
    let before = ctx;

    assert_eq!(
        f.emulator().emulate(&mut ctx),
        Err(EmulationError::OperandOutOfRange)
    );
    assert_eq!(ctx, before);
}

#[test]
fn mov_segment_from_register() {
    let f = Fixture::new();

    // mov es, ax
    let mut ctx = f.context16(&[0x8e, 0xc0]);
    ctx.eax = 0x1234_0000 | f.data.raw() as u32;
    f.emulator().emulate(&mut ctx).unwrap();
    assert_eq!(ctx.es, f.data.selector());
    assert_eq!(ctx.eip, 0x0102);

    // mov cs, ax is never emulated.
    let mut ctx = f.context16(&[0x8e, 0xc8]);
    ctx.eax = f.code.raw() as u32;
    assert_eq!(
        f.emulator().emulate(&mut ctx),
        Err(EmulationError::UnsupportedOpcode)
    );
}

///////////////////////////////////////////////////////////////////////////////
// Port I/O
///////////////////////////////////////////////////////////////////////////////

#[test]
fn in_al_imm8() {
    let f = Fixture::new();
    f.ports.queue(&[0xabcd]);

    let mut ctx = f.context16(&[0xe4, 0x61]);
    ctx.eax = 0x1122_3344;

    f.emulator().emulate(&mut ctx).unwrap();
    assert_eq!(ctx.eax, 0x1122_33cd);
    assert_eq!(ctx.eip, 0x0102);
    assert_eq!(f.ports.log(), vec![(0x61, PortWidth::Byte, None)]);
}

#[test]
fn out_dx_ax() {
    let f = Fixture::new();

    let mut ctx = f.context16(&[0xef]);
    ctx.eax = 0x1122_3344;
    ctx.edx = 0x03f8;

    f.emulator().emulate(&mut ctx).unwrap();
    assert_eq!(f.ports.log(), vec![(0x03f8, PortWidth::Word, Some(0x3344))]);
    assert_eq!(ctx.eip, 0x0101);
}

#[test]
fn rep_insb_stores_each_byte() {
    let f = Fixture::new();
    f.ports.queue(&[1, 2, 3]);

    let mut ctx = f.context16(&[0xf3, 0x6c]);
    ctx.ecx = 0xffff_0003;
    ctx.edi = 0x10;
    ctx.edx = 0x60;

    f.emulator().emulate(&mut ctx).unwrap();
    assert_eq!(f.memory.peek(DATA_BASE + 0x10, 3), vec![1, 2, 3]);
    assert_eq!(ctx.edi, 0x13);
    assert_eq!(ctx.ecx, 0xffff_0000);
    assert_eq!(ctx.eip, 0x0102);
    assert_eq!(f.ports.log().len(), 3);
}

#[test]
fn rep_insb_honours_direction_flag() {
    let f = Fixture::new();
    f.ports.queue(&[1, 2, 3]);

    let mut ctx = f.context16(&[0xf3, 0x6c]);
    ctx.ecx = 3;
    ctx.edi = 0x10;
    ctx.eflags = ctx.eflags.with(Eflags::DIRECTION);

    f.emulator().emulate(&mut ctx).unwrap();
    assert_eq!(f.memory.peek(DATA_BASE + 0x0e, 3), vec![3, 2, 1]);
    assert_eq!(ctx.edi, 0x0d);
    assert_eq!(ctx.ecx, 0);
}

#[test]
fn outsw_single() {
    let f = Fixture::new();
    f.memory.poke(DATA_BASE + 0x40, &[0x34, 0x12]);

    let mut ctx = f.context16(&[0x6f]);
    ctx.esi = 0x40;
    ctx.edx = 0x1f0;
    ctx.ecx = 7;

    f.emulator().emulate(&mut ctx).unwrap();
    assert_eq!(f.ports.log(), vec![(0x1f0, PortWidth::Word, Some(0x1234))]);
    assert_eq!(ctx.esi, 0x42);
    assert_eq!(ctx.ecx, 7);
}

#[test]
fn rep_outsb_past_limit_keeps_completed_writes() {
    let f = Fixture::new();
    f.memory.poke(DATA_BASE + 0xfffe, &[0x11, 0x22]);

    // 32-bit addressing lets esi step past the 64KB limit.
    let mut ctx = f.context16(&[0xf3, 0x67, 0x6e]);
    ctx.esi = 0xfffe;
    ctx.ecx = 4;
    ctx.edx = 0x3f8;
    let before = ctx;

    assert_eq!(
        f.emulator().emulate(&mut ctx),
        Err(EmulationError::OperandOutOfRange)
    );
    assert_eq!(ctx, before);
    assert_eq!(
        f.ports.log(),
        vec![
            (0x3f8, PortWidth::Byte, Some(0x11)),
            (0x3f8, PortWidth::Byte, Some(0x22)),
        ]
    );
}

#[test]
fn insb_with_null_es_fails() {
    let f = Fixture::new();

    let mut ctx = f.context16(&[0x6c]);
    ctx.es = Selector::NULL;
    let before = ctx;

    assert_eq!(
        f.emulator().emulate(&mut ctx),
        Err(EmulationError::InvalidSelector(0))
    );
    assert_eq!(ctx, before);
}

///////////////////////////////////////////////////////////////////////////////
// Interrupts
///////////////////////////////////////////////////////////////////////////////

#[test]
fn int_with_handler_pushes_frame() {
    let f = Fixture::new();
    f.machine
        .vectors()
        .set(0x21, f.code.selector(), 0x0800);

    let mut ctx = f.context16(&[0xcd, 0x21]);
    ctx.eflags = Eflags(0x0302);

    f.emulator().emulate(&mut ctx).unwrap();
    assert_eq!(ctx.cs, f.code.selector());
    assert_eq!(ctx.eip, 0x0800);
    assert_eq!(ctx.esp, 0x0ffa);
    assert!(!ctx.eflags.trap());
    assert!(!ctx.eflags.interrupt_enable());

    let frame = f.memory.peek(STACK_BASE + 0x0ffa, 6);
    assert_eq!(frame[0..2], 0x0102u16.to_le_bytes());
    assert_eq!(frame[2..4], f.code.raw().to_le_bytes());
    assert_eq!(frame[4..6], 0x0302u16.to_le_bytes());
}

#[test]
fn int_without_handler_is_skipped() {
    let f = Fixture::new();

    let mut ctx = f.context16(&[0xcd, 0x2f]);
    f.emulator().emulate(&mut ctx).unwrap();
    assert_eq!(ctx.eip, 0x0102);
    assert_eq!(ctx.esp, 0x1000);
}

#[test]
fn int_in_32bit_code_is_not_emulated() {
    let f = Fixture::new();

    let mut ctx = f.context32(&[0xcd, 0x21]);
    assert_eq!(
        f.emulator().emulate(&mut ctx),
        Err(EmulationError::UnsupportedMode)
    );
}

#[test]
fn iret_pops_frame() {
    let f = Fixture::new();

    let mut ctx = f.context16(&[0xcf]);
    f.push16(&mut ctx, &[0x0246, f.code.raw(), 0x0200]);
    ctx.eflags = Eflags(0x0004_0002);

    f.emulator().emulate(&mut ctx).unwrap();
    assert_eq!(ctx.eip, 0x0200);
    assert_eq!(ctx.cs, f.code.selector());
    assert_eq!(ctx.eflags, Eflags(0x0004_0246));
    assert_eq!(ctx.esp, 0x1000);
}

#[test]
fn iret_to_data_segment_fails() {
    let f = Fixture::new();

    let mut ctx = f.context16(&[0xcf]);
    f.push16(&mut ctx, &[0x0202, f.data.raw(), 0x0200]);
    let before = ctx;

    assert_eq!(
        f.emulator().emulate(&mut ctx),
        Err(EmulationError::InvalidSelector(f.data.raw()))
    );
    assert_eq!(ctx, before);
}

#[test]
fn interrupt_flag_and_halt() {
    let f = Fixture::new();

    for code in [[0xfa], [0xfb], [0xf4]] {
        let mut ctx = f.context16(&code);
        f.emulator().emulate(&mut ctx).unwrap();
        assert_eq!(ctx.eip, 0x0101);
        assert_eq!(ctx.eflags, Eflags(0x0202));
    }

    let mut ctx = f.context32(&[0xf4]);
    assert!(!f.emulator().try_emulate(&mut ctx));
}

///////////////////////////////////////////////////////////////////////////////
// Control and debug registers
///////////////////////////////////////////////////////////////////////////////

#[test]
fn control_register_stubs() {
    let f = Fixture::new();

    let mut ctx = f.context32(&[0x0f, 0x20, 0xc0]);
    f.emulator().emulate(&mut ctx).unwrap();
    assert_eq!(ctx.eax, 0x10);
    assert_eq!(ctx.eip, 0x0040_1003);

    let mut ctx = f.context32(&[0x0f, 0x20, 0xe0]);
    ctx.eax = 0x1234;
    f.emulator().emulate(&mut ctx).unwrap();
    assert_eq!(ctx.eax, 0);

    let mut ctx = f.context32(&[0x0f, 0x22, 0xe0]);
    ctx.eax = 0x1234;
    let before = ctx;
    f.emulator().emulate(&mut ctx).unwrap();
    assert_eq!(ctx.eax, before.eax);
    assert_eq!(ctx.eip, before.eip + 3);

    // mov eax, cr3
    let mut ctx = f.context32(&[0x0f, 0x20, 0xd8]);
    assert_eq!(
        f.emulator().emulate(&mut ctx),
        Err(EmulationError::UnsupportedOpcode)
    );
}

#[test]
fn debug_register_moves() {
    let f = Fixture::new();

    // mov dr7, eax
    let mut ctx = f.context32(&[0x0f, 0x23, 0xf8]);
    ctx.eax = 0x0000_0401;
    f.emulator().emulate(&mut ctx).unwrap();
    assert_eq!(ctx.dr7.0, 0x0000_0401);

    // mov ecx, dr0
    let mut ctx = f.context32(&[0x0f, 0x21, 0xc1]);
    ctx.dr0 = 0x0040_2000;
    f.emulator().emulate(&mut ctx).unwrap();
    assert_eq!(ctx.ecx, 0x0040_2000);
}

///////////////////////////////////////////////////////////////////////////////
// IDT shadow
///////////////////////////////////////////////////////////////////////////////

#[test]
fn sidt_reports_shadow() {
    let f = Fixture::new();

    // sidt [0x00502000]
    let mut ctx = f.context32(&[0x0f, 0x01, 0x0d, 0x00, 0x20, 0x50, 0x00]);
    f.emulator().emulate(&mut ctx).unwrap();

    assert_eq!(f.memory.peek(0x0050_2000, 2), vec![0xff, 0x07]);
    assert_eq!(
        f.memory.peek(0x0050_2002, 4),
        f.machine.idt().base().to_le_bytes().to_vec()
    );
    assert_eq!(ctx.eip, 0x0040_1007);
}

#[test]
fn rep_movsd_reads_idt_shadow() {
    let f = Fixture::new();
    let idt = f.machine.idt();
    idt.write(idt.base() + 8, &[1, 2, 3, 4, 5, 6, 7, 8]);

    let mut ctx = f.context32(&[0xf3, 0xa5]);
    ctx.esi = idt.base() + 8;
    ctx.edi = 0x0050_3000;
    ctx.ecx = 2;

    f.emulator().emulate(&mut ctx).unwrap();
    assert_eq!(f.memory.peek(0x0050_3000, 8), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(ctx.esi, idt.base() + 16);
    assert_eq!(ctx.edi, 0x0050_3008);
    assert_eq!(ctx.ecx, 0);
}

#[test]
fn movsb_writes_idt_shadow() {
    let f = Fixture::new();
    let idt = f.machine.idt();
    f.memory.poke(0x0050_4000, &[0xaa]);

    let mut ctx = f.context32(&[0xa4]);
    ctx.esi = 0x0050_4000;
    ctx.edi = idt.base();

    f.emulator().emulate(&mut ctx).unwrap();

    let mut byte = [0u8; 1];
    assert!(idt.read(idt.base(), &mut byte));
    assert_eq!(byte, [0xaa]);
}

#[test]
fn movs_outside_shadow_is_not_emulated() {
    let f = Fixture::new();

    let mut ctx = f.context32(&[0xa4]);
    ctx.esi = 0x0050_4000;
    ctx.edi = 0x0050_5000;

    assert_eq!(
        f.emulator().emulate(&mut ctx),
        Err(EmulationError::UnsupportedOpcode)
    );
}

///////////////////////////////////////////////////////////////////////////////
// Fetch
///////////////////////////////////////////////////////////////////////////////

#[test]
fn fetch_stops_at_code_limit() {
    let f = Fixture::new();

    // `in al, imm8` split by the end of the code segment.
    let mut ctx = f.context16(&[]);
    ctx.eip = 0xffff;
    f.memory.poke(CODE_BASE + 0xffff, &[0xe4, 0x61]);

    assert_eq!(
        f.emulator().emulate(&mut ctx),
        Err(EmulationError::Truncated)
    );
}

#[test]
fn fetch_unmapped_code() {
    let f = Fixture::new();

    let mut ctx = f.context32(&[]);
    ctx.eip = UNMAPPED;

    assert_eq!(
        f.emulator().emulate(&mut ctx),
        Err(EmulationError::Memory(UNMAPPED))
    );
}

#[test]
fn emulate_code_uses_given_bytes() {
    let f = Fixture::new();

    let mut ctx = f.context16(&[]);
    f.emulator().emulate_code(&mut ctx, &[0xfa, 0x90]).unwrap();
    assert_eq!(ctx.eip, 0x0101);
}

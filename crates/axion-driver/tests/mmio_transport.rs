//! MMIO transport bring-up and the instruction-queue completion path,
//! driven by fake registers, MMU and interrupt lines.

mod util;

use std::sync::{Arc, mpsc};
use std::time::Duration;

use axion_api::{ClosingMode, DriverOptions};
use axion_driver::chip::{self, Chip, CsrLayout};
use axion_driver::driver::Driver;
use axion_driver::memory::dram::NullDramAllocator;
use axion_driver::memory::host::HostAllocator;
use axion_driver::memory::mmu::FakeMmuMapper;
use axion_driver::mmio::host_queue::HostQueueStatusBlock;
use axion_driver::mmio::interrupt::{FakeInterruptHandler, Interrupt, InterruptHandler};
use axion_driver::mmio::transport::MmioTransport;
use axion_driver::registers::{FakeRegisters, Registers};
use axion_driver::registry::PackageRegistry;
use axion_driver::time::MonotonicTimeStamper;
use axion_driver::transport::Transport;
use util::{fill_buffer, standalone_package};

struct MmioHarness {
    transport: Arc<MmioTransport>,
    registers: Arc<FakeRegisters>,
    interrupts: Arc<FakeInterruptHandler>,
}

fn make_mmio_transport(options: &DriverOptions) -> MmioHarness {
    let layout = CsrLayout::a1();
    let registers = Arc::new(FakeRegisters::new());
    let interrupts = Arc::new(FakeInterruptHandler::new());
    let transport = MmioTransport::new(
        layout,
        Arc::clone(&registers) as Arc<dyn Registers>,
        Arc::new(FakeMmuMapper::new()),
        Arc::new(NullDramAllocator::new()),
        Arc::clone(&interrupts) as Arc<dyn InterruptHandler>,
        options,
        MonotonicTimeStamper::new(),
    );
    MmioHarness {
        transport,
        registers,
        interrupts,
    }
}

impl MmioHarness {
    /// Acts as the device: marks `count` more host-queue descriptors
    /// consumed and raises the queue interrupt.
    fn complete_queue_descriptors(&self, completed_head: u32) {
        let status = self.transport.host_queue().status_block_memory();
        // SAFETY: the status block is a live 16-byte allocation.
        unsafe {
            status
                .ptr()
                .cast::<HostQueueStatusBlock>()
                .write_volatile(HostQueueStatusBlock {
                    completed_head_pointer: completed_head,
                    fatal_error: 0,
                    reserved: 0,
                });
        }
        self.interrupts.raise(Interrupt::InstructionQueue);
    }

    /// Acts as the device: signals one execution completion on
    /// scalar-core interrupt 0.
    fn complete_execution(&self, total_completions: u64) {
        let layout = CsrLayout::a1();
        self.registers
            .preload(layout.scalar.host_interrupt_count_base, total_completions);
        self.interrupts.raise(Interrupt::ScalarCoreHost(0));
    }
}

#[test]
fn open_programs_the_chip_and_close_reverses_it() {
    util::init_logging();
    let layout = CsrLayout::a1();
    let options = DriverOptions::default();
    let harness = make_mmio_transport(&options);

    harness.transport.open(false).unwrap();
    let writes = harness.registers.writes();

    // Burst limiter and page-table split are programmed at open.
    assert!(writes.contains(&(
        layout.hib.dma_burst_limiter,
        layout.structures.axi_dma_burst_limiter
    )));
    let simple_entries =
        chip::num_simple_page_table_entries(layout.structures.num_page_table_entries) as u64;
    assert!(writes.contains(&(layout.hib.page_table_size, simple_entries)));

    // The pipelines moved to Run and the chip is software-clock-gated
    // until the first submission.
    assert_eq!(harness.registers.last_write(layout.scalar.run_control), Some(1));
    assert_eq!(
        harness.registers.last_write(layout.power.software_clock_gate),
        Some(1)
    );

    // Close: pause DMAs (the fake reports them paused), halt, reset.
    harness.registers.preload(layout.hib.dma_paused, 1);
    harness
        .transport
        .close(false, ClosingMode::Graceful)
        .unwrap();
    assert_eq!(harness.registers.last_write(layout.hib.dma_pause), Some(1));
    assert_eq!(harness.registers.last_write(layout.scalar.run_control), Some(2));
    assert_eq!(harness.registers.last_write(layout.power.reset), Some(1));
}

#[test]
fn inference_completes_through_queue_and_interrupt() {
    util::init_logging();
    let options = DriverOptions::default();
    let harness = make_mmio_transport(&options);
    let registry = PackageRegistry::new(Some(Chip::A1), HostAllocator::new(4096));
    let driver = Driver::new(
        Arc::clone(&harness.transport) as Arc<dyn Transport>,
        registry,
        &options,
        MonotonicTimeStamper::new(),
    );

    driver.open(false, false).unwrap();
    let package = driver
        .register_executable_serialized(&standalone_package(64, 64, 1, 1000))
        .unwrap();

    let request = driver.create_request(&package);
    let input = driver.make_buffer(64);
    fill_buffer(&input, 0x7E);
    request.add_input("in", input).unwrap();
    request.add_output("out", driver.make_buffer(64)).unwrap();

    let (sender, receiver) = mpsc::channel();
    driver
        .submit(
            request,
            Box::new(move |_id, status| {
                sender.send(status).unwrap();
            }),
        )
        .unwrap();

    // The submission pushed one instruction descriptor and bumped the
    // tail.
    let layout = CsrLayout::a1();
    assert_eq!(
        harness.registers.last_write(layout.hib.instruction_queue_tail),
        Some(1)
    );

    // Device side: consume the descriptor, then report the execution.
    harness.complete_queue_descriptors(1);
    harness.complete_execution(1);

    receiver
        .recv_timeout(Duration::from_secs(5))
        .unwrap()
        .unwrap();

    // Everything drained: the chip is software-clock-gated again.
    assert_eq!(
        harness.registers.last_write(layout.power.software_clock_gate),
        Some(1)
    );

    harness.registers.preload(layout.hib.dma_paused, 1);
    driver.close(ClosingMode::Graceful).unwrap();
}

#[test]
fn realtime_admission_rejects_overcommitted_frames() {
    util::init_logging();
    let options = DriverOptions::default();
    let harness = make_mmio_transport(&options);
    let registry = PackageRegistry::new(Some(Chip::A1), HostAllocator::new(4096));
    let driver = Driver::new(
        Arc::clone(&harness.transport) as Arc<dyn Transport>,
        registry,
        &options,
        MonotonicTimeStamper::new(),
    );
    driver.open(false, false).unwrap();
    let package = driver
        .register_executable_serialized(&standalone_package(64, 64, 1, 1000))
        .unwrap();

    // 10 FPS with 90 ms of execution: one frame fills the whole budget.
    driver
        .set_executable_timing(
            &package,
            &axion_api::Timing {
                fps: 10,
                max_execution_time_ms: 90,
                tolerance_ms: 5,
            },
        )
        .unwrap();
    driver.set_realtime_mode(true).unwrap();

    let submit = |fill: u8| {
        let request = driver.create_request(&package);
        let input = driver.make_buffer(64);
        fill_buffer(&input, fill);
        request.add_input("in", input).unwrap();
        request.add_output("out", driver.make_buffer(64)).unwrap();
        let (sender, receiver) = mpsc::channel();
        let result = driver.submit(
            request,
            Box::new(move |_id, status| {
                let _ = sender.send(status);
            }),
        );
        (result, receiver)
    };

    // First frame books 90 ms of the 105 ms budget; the second cannot fit.
    let (first, first_receiver) = submit(1);
    first.unwrap();
    let (second, _) = submit(2);
    assert!(matches!(
        second,
        Err(axion_api::Error::DeadlineExceeded(_))
    ));

    // Complete the first frame; the budget frees up again.
    harness.complete_queue_descriptors(1);
    harness.complete_execution(1);
    first_receiver
        .recv_timeout(Duration::from_secs(5))
        .unwrap()
        .unwrap();

    let (third, third_receiver) = submit(3);
    third.unwrap();
    harness.complete_queue_descriptors(2);
    harness.complete_execution(2);
    third_receiver
        .recv_timeout(Duration::from_secs(5))
        .unwrap()
        .unwrap();

    harness.registers.preload(CsrLayout::a1().hib.dma_paused, 1);
    driver.close(ClosingMode::Graceful).unwrap();
}

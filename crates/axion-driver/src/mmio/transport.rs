//! The MMIO transport proper.
//!
//! Instructions flow through the host queue; everything else the device
//! fetches itself through its DMA engines, so the DMA plan of a
//! sub-request is its instruction chunks. Completions arrive as
//! scalar-core interrupt 0, queue consumption as the instruction-queue
//! interrupt, and faults through the sticky fatal-error line.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use axion_api::{Buffer, ClosingMode, DriverOptions, Error, Result, Timing, TpuRequestKind};
use log::{debug, warn};

use crate::chip::{self, CsrLayout};
use crate::device_buffer::MappedDeviceBuffer;
use crate::dma::{DmaInfoExtractor, DmaKind, ExtractorMode};
use crate::mapper::DeviceBufferMapper;
use crate::memory::buddy::BuddyAddressSpace;
use crate::memory::dram::DramAllocator;
use crate::memory::host::HostAllocator;
use crate::memory::mmu::MmuMapper;
use crate::memory::space::{AddressSpace, DmaDirection, MappingTypeHint};
use crate::memory::util::HOST_PAGE_SIZE;
use crate::mmio::host_queue::{HostQueue, HostQueueDescriptor};
use crate::mmio::interrupt::{Interrupt, InterruptHandler};
use crate::power::{RunControl, RunController, ScalarCoreController, TopLevelHandler};
use crate::registers::Registers;
use crate::registry::ExecutableReference;
use crate::request::Request;
use crate::rt::RealTimeDmaScheduler;
use crate::scheduler::IssuedDma;
use crate::time::TimeStamper;
use crate::transport::{HookRegistry, Transport};
use crate::tpu_request::TpuRequest;
use crate::watchdog::Watchdog;

/// Descriptors in the instruction host queue.
const INSTRUCTION_QUEUE_SIZE: u32 = 256;

/// No HIB fatal error recorded.
const HIB_ERROR_STATUS_NONE: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Closing,
    Closed,
}

/// The pieces interrupt handlers and queue callbacks need; everything here
/// is internally synchronized.
struct MmioCore {
    layout: CsrLayout,
    registers: Arc<dyn Registers>,
    power: TopLevelHandler,
    scalar: ScalarCoreController,
    host_queue: HostQueue,
    scheduler: RealTimeDmaScheduler,
    /// Keeps DMAs popped from the scheduler entering the host queue in
    /// order.
    dma_issue: Mutex<()>,
    hooks: Arc<HookRegistry>,
}

impl MmioCore {
    /// Pushes instruction descriptors into the host queue while there is
    /// space and ready work.
    fn try_issue_dmas(core: &Arc<Self>) -> Result<()> {
        let _issue_guard = core.dma_issue.lock().unwrap();
        core.power.disable_software_clock_gate()?;

        while core.host_queue.available_space() > 0 {
            let Some(dma) = core.scheduler.get_next_dma()? else {
                break;
            };
            debug_assert_eq!(dma.kind, DmaKind::Instruction);
            Self::issue_one(core, dma)?;
        }
        Ok(())
    }

    fn issue_one(core: &Arc<Self>, dma: IssuedDma) -> Result<()> {
        let descriptor = HostQueueDescriptor {
            address: dma.buffer.device_address(),
            size_in_bytes: dma.buffer.size_bytes() as u32,
            reserved: 0,
        };
        let completion_core = Arc::clone(core);
        let token = dma.token;
        core.host_queue.enqueue(
            descriptor,
            Box::new(move |error_code| {
                if let Err(err) = completion_core.scheduler.notify_dma_completion(token) {
                    warn!("instruction completion not accepted: {err}");
                }
                Self::handle_host_queue_completion(&completion_core, error_code);
            }),
        )
    }

    /// Queue-entry completion: on success, keep the queue full.
    fn handle_host_queue_completion(core: &Arc<Self>, error_code: u32) {
        if error_code != 0 {
            core.check_fatal_error(Err(Error::internal(format!(
                "host queue error {error_code}"
            ))));
            return;
        }
        if let Err(err) = Self::try_issue_dmas(core) {
            core.check_fatal_error(Err(err));
        }
    }

    /// Scalar-core interrupt 0: one execution finished.
    fn handle_execution_completion(core: &Arc<Self>) {
        if let Err(err) = core.scheduler.notify_request_completion() {
            warn!("unexpected execution completion: {err}");
            return;
        }
        core.hooks.request_completion();
        if core.scheduler.is_empty() {
            if let Err(err) = core.power.enable_software_clock_gate() {
                warn!("failed to re-enable clock gating: {err}");
            }
        } else if let Err(err) = Self::try_issue_dmas(core) {
            // A global fence may have cleared; push the next task's
            // instructions.
            core.check_fatal_error(Err(err));
        }
    }

    fn check_hib_error(&self) -> Result<()> {
        let hib_error_status = self.registers.read_64(self.layout.hib.hib_error_status)?;
        if hib_error_status == HIB_ERROR_STATUS_NONE {
            return Ok(());
        }
        let hib_first_error_status = self
            .registers
            .read_64(self.layout.hib.hib_first_error_status)?;
        Err(Error::internal(format!(
            "HIB error. hib_error_status = {hib_error_status:016x}, \
             hib_first_error_status = {hib_first_error_status:016x}"
        )))
    }

    fn check_fatal_error(&self, status: Result<()>) {
        if let Err(err) = status {
            self.hooks.fatal_error(err);
        }
    }
}

/// Driver transport over a memory-mapped register interface.
pub struct MmioTransport {
    core: Arc<MmioCore>,
    mmu: Arc<dyn MmuMapper>,
    address_space: Arc<dyn AddressSpace>,
    allocator: HostAllocator,
    dram_allocator: Arc<dyn DramAllocator>,
    interrupt_handler: Arc<dyn InterruptHandler>,
    run_controller: RunController,
    extractor: DmaInfoExtractor,
    state: Mutex<State>,
    next_id: AtomicI32,
}

impl MmioTransport {
    /// Builds the transport from its platform services. The device stays
    /// closed until [`Transport::open`].
    pub fn new(
        layout: CsrLayout,
        registers: Arc<dyn Registers>,
        mmu: Arc<dyn MmuMapper>,
        dram_allocator: Arc<dyn DramAllocator>,
        interrupt_handler: Arc<dyn InterruptHandler>,
        options: &DriverOptions,
        time_stamper: Arc<dyn TimeStamper>,
    ) -> Arc<Self> {
        let allocator = HostAllocator::new(layout.structures.allocation_alignment_bytes);
        let hooks = Arc::new(HookRegistry::new());

        let watchdog_hooks = Arc::clone(&hooks);
        let watchdog = Watchdog::new(
            options.watchdog_timeout_ns,
            Box::new(move || watchdog_hooks.watchdog_timeout()),
        );

        // Device addresses come from the simple region; a single buddy
        // space over it serves both queue memory and activations.
        let simple_entries =
            chip::num_simple_page_table_entries(layout.structures.num_page_table_entries);
        let address_space: Arc<dyn AddressSpace> = Arc::new(BuddyAddressSpace::new(
            0,
            (simple_entries as u64 * HOST_PAGE_SIZE).next_power_of_two(),
            Arc::clone(&mmu),
        ));

        let core = Arc::new(MmioCore {
            layout,
            registers: Arc::clone(&registers),
            power: TopLevelHandler::new(Arc::clone(&registers), layout.power),
            scalar: ScalarCoreController::new(Arc::clone(&registers), layout.scalar),
            host_queue: HostQueue::new(
                INSTRUCTION_QUEUE_SIZE,
                &allocator,
                Arc::clone(&registers),
                layout.hib,
            ),
            scheduler: RealTimeDmaScheduler::new(watchdog, time_stamper),
            dma_issue: Mutex::new(()),
            hooks,
        });

        Arc::new(Self {
            core,
            mmu,
            address_space,
            allocator,
            dram_allocator,
            interrupt_handler,
            run_controller: RunController::new(registers, layout.scalar),
            extractor: DmaInfoExtractor::new(ExtractorMode::InstructionDma, true),
            state: Mutex::new(State::Closed),
            next_id: AtomicI32::new(0),
        })
    }

    /// The host queue, exposed for hardware models driving the device side
    /// of the contract.
    pub fn host_queue(&self) -> &HostQueue {
        &self.core.host_queue
    }

    fn register_and_enable_all_interrupts(&self) -> Result<()> {
        let layout = self.core.layout;

        // Instruction queue consumption.
        let queue_core = Arc::clone(&self.core);
        self.interrupt_handler.register(
            Interrupt::InstructionQueue,
            Box::new(move || queue_core.host_queue.process_status_block()),
        )?;

        // Execution completions. Clear status before reading the count so a
        // concurrent increment cannot be missed, and before the completion
        // handler possibly clock-gates the chip.
        let completion_core = Arc::clone(&self.core);
        self.interrupt_handler.register(
            Interrupt::ScalarCoreHost(0),
            Box::new(move || {
                if let Err(err) = completion_core.scalar.clear_interrupt_status(0) {
                    warn!("failed to clear completion interrupt: {err}");
                }
                match completion_core.scalar.check_interrupt_counts(0) {
                    Ok(count) => {
                        for _ in 0..count {
                            MmioCore::handle_execution_completion(&completion_core);
                        }
                    }
                    Err(err) => warn!("failed to read completion count: {err}"),
                }
            }),
        )?;

        // The remaining scalar-core lines only need their status cleared.
        for id in 1..4 {
            let clear_core = Arc::clone(&self.core);
            self.interrupt_handler.register(
                Interrupt::ScalarCoreHost(id),
                Box::new(move || {
                    if let Err(err) = clear_core.scalar.clear_interrupt_status(id) {
                        warn!("failed to clear scalar interrupt {id}: {err}");
                    }
                }),
            )?;
        }

        // Top-level interrupts surface as thermal warnings.
        for id in 0..layout.structures.num_top_level_interrupts as u32 {
            let top_core = Arc::clone(&self.core);
            self.interrupt_handler.register(
                Interrupt::TopLevel(id),
                Box::new(move || {
                    warn!("top level interrupt: {id}");
                    if let Err(err) = top_core
                        .registers
                        .write_64(top_core.layout.hib.top_level_int_status, 1 << id)
                    {
                        warn!("failed to clear top-level interrupt {id}: {err}");
                    }
                    top_core.hooks.thermal_warning();
                }),
            )?;
        }

        // The fatal error line is sticky: disable, clear, then report.
        let fatal_core = Arc::clone(&self.core);
        self.interrupt_handler.register(
            Interrupt::FatalError,
            Box::new(move || {
                let layout = fatal_core.layout;
                if let Err(err) = fatal_core
                    .registers
                    .write_64(layout.hib.fatal_error_int_enable, 0)
                {
                    warn!("failed to disable fatal error interrupt: {err}");
                }
                if let Err(err) = fatal_core
                    .registers
                    .write_64(layout.hib.fatal_error_int_status, 1)
                {
                    warn!("failed to clear fatal error interrupt: {err}");
                }
                fatal_core.check_fatal_error(fatal_core.check_hib_error());
            }),
        )?;

        // Enable everything.
        self.core.scalar.enable_interrupts()?;
        self.core.host_queue.enable_interrupts()?;
        self.core
            .registers
            .write_64(layout.hib.fatal_error_int_enable, 1)?;
        self.core
            .registers
            .write_64(layout.hib.top_level_int_enable, !0u64)?;
        Ok(())
    }

    fn disable_all_interrupts(&self) -> Result<()> {
        let layout = self.core.layout;
        let mut status = Ok(());
        axion_api::error::accumulate(
            &mut status,
            self.core
                .registers
                .write_64(layout.hib.top_level_int_enable, 0),
        );
        axion_api::error::accumulate(
            &mut status,
            self.core
                .registers
                .write_64(layout.hib.fatal_error_int_enable, 0),
        );
        axion_api::error::accumulate(&mut status, self.core.host_queue.disable_interrupts());
        axion_api::error::accumulate(&mut status, self.core.scalar.disable_interrupts());
        status
    }

    fn pause_all_dmas(&self) -> Result<()> {
        const PAUSE: u64 = 1;
        const ALL_PAUSED: u64 = 1;
        self.core
            .registers
            .write_64(self.core.layout.hib.dma_pause, PAUSE)?;
        self.core
            .registers
            .poll_64(self.core.layout.hib.dma_paused, ALL_PAUSED)
    }

    fn validate_state(&self, expected: State) -> Result<()> {
        let state = self.state.lock().unwrap();
        if *state != expected {
            return Err(Error::failed_precondition(format!(
                "bad MMIO transport state: expected {expected:?}, actual {:?}",
                *state
            )));
        }
        Ok(())
    }
}

impl Transport for MmioTransport {
    fn hooks(&self) -> &Arc<HookRegistry> {
        &self.core.hooks
    }

    fn open(&self, debug_mode: bool) -> Result<()> {
        self.validate_state(State::Closed)?;
        let layout = self.core.layout;

        self.core.registers.open()?;

        // Power up: gates off, a clean trip through reset, then let the
        // hardware gate idle clocks.
        self.core.power.disable_software_clock_gate()?;
        self.core.power.disable_hardware_clock_gate()?;
        self.core.power.enable_reset()?;
        self.core.power.quit_reset()?;
        self.core.power.enable_hardware_clock_gate()?;

        // The HIB must be clean before anything is programmed.
        self.core.check_hib_error()?;

        self.core.registers.write_64(
            layout.hib.dma_burst_limiter,
            layout.structures.axi_dma_burst_limiter,
        )?;

        let simple_entries =
            chip::num_simple_page_table_entries(layout.structures.num_page_table_entries);
        self.mmu.open(simple_entries)?;
        self.core
            .registers
            .write_64(layout.hib.page_table_size, simple_entries as u64)?;

        self.interrupt_handler.open()?;
        self.core.host_queue.open(&self.address_space)?;
        self.core.scalar.open()?;

        if !debug_mode {
            self.run_controller.do_run_control(RunControl::MoveToRun)?;
        }

        // Disable periodic status block updates; completions interrupt.
        self.core
            .registers
            .write_64(layout.hib.status_block_update, 0)?;

        self.register_and_enable_all_interrupts()?;
        self.core.scheduler.open()?;
        self.dram_allocator.open()?;

        *self.state.lock().unwrap() = State::Open;
        debug!("MMIO transport open");

        // Gate clocks until the first submission.
        self.core.power.enable_software_clock_gate()
    }

    fn close(&self, in_error: bool, mode: ClosingMode) -> Result<()> {
        self.validate_state(State::Open)?;
        *self.state.lock().unwrap() = State::Closing;
        self.core.power.disable_software_clock_gate()?;

        // Quiesce the DMA engines before tearing structures down; a DMA
        // into a freed queue is undefined behavior in hardware too.
        self.pause_all_dmas()?;

        let forced = in_error || mode == ClosingMode::Asap;
        let mut status = Ok(());
        axion_api::error::accumulate(
            &mut status,
            self.run_controller.do_run_control(RunControl::MoveToHalt),
        );
        axion_api::error::accumulate(&mut status, self.disable_all_interrupts());
        axion_api::error::accumulate(&mut status, self.interrupt_handler.close(forced));
        axion_api::error::accumulate(&mut status, self.core.scalar.close());
        axion_api::error::accumulate(&mut status, self.core.scheduler.close(mode));
        axion_api::error::accumulate(&mut status, self.core.host_queue.close(forced));
        axion_api::error::accumulate(&mut status, self.mmu.close());
        axion_api::error::accumulate(&mut status, self.core.power.enable_reset());
        axion_api::error::accumulate(&mut status, self.core.registers.close());
        axion_api::error::accumulate(&mut status, self.dram_allocator.close());
        status?;

        *self.state.lock().unwrap() = State::Closed;
        debug!("MMIO transport closed");
        Ok(())
    }

    fn cancel_and_wait_requests(&self, in_error: bool) -> Result<()> {
        self.core.scheduler.cancel_pending_requests()?;
        if !in_error {
            self.core.scheduler.wait_active_requests()?;
        }
        Ok(())
    }

    fn make_buffer(&self, size_bytes: usize) -> Buffer {
        self.allocator.make_buffer(size_bytes)
    }

    fn map_buffer(&self, buffer: &Buffer, direction: DmaDirection) -> Result<MappedDeviceBuffer> {
        if !buffer.is_valid() {
            return Ok(MappedDeviceBuffer::invalid());
        }
        let device = self
            .address_space
            .map(buffer, direction, MappingTypeHint::Extended)?;
        Ok(MappedDeviceBuffer::new(
            device,
            Arc::clone(&self.address_space),
        ))
    }

    fn create_tpu_request(
        &self,
        parent: Arc<Request>,
        executable: &Arc<ExecutableReference>,
        kind: TpuRequestKind,
    ) -> Result<Arc<TpuRequest>> {
        self.validate_state(State::Open)?;
        Ok(Arc::new(TpuRequest::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
            parent,
            Arc::clone(executable),
            self.allocator,
            Arc::clone(&self.dram_allocator),
            DeviceBufferMapper::new(Arc::clone(&self.address_space)),
            self.extractor,
            self.core.layout.structures.minimum_alignment_bytes,
            kind,
        )))
    }

    fn submit(&self, request: Arc<TpuRequest>) -> Result<()> {
        self.validate_state(State::Open)?;
        self.core.power.disable_software_clock_gate()?;
        request.validate()?;
        request.prepare()?;
        self.core.scheduler.submit(request)?;
        MmioCore::try_issue_dmas(&self.core)
    }

    fn max_remaining_cycles(&self) -> i64 {
        self.core.scheduler.max_remaining_cycles()
    }

    fn oldest_active_request(&self) -> Result<Arc<TpuRequest>> {
        self.core.scheduler.oldest_active_request()
    }

    fn has_realtime_mode(&self) -> bool {
        true
    }

    fn set_realtime_mode(&self, on: bool) -> Result<()> {
        self.core.scheduler.set_realtime_mode(on);
        Ok(())
    }

    fn set_executable_timing(
        &self,
        executable: &Arc<ExecutableReference>,
        timing: &Timing,
    ) -> Result<()> {
        self.core
            .scheduler
            .set_executable_timing(executable.id(), timing)
    }

    fn remove_executable_timing(&self, executable: &Arc<ExecutableReference>) -> Result<()> {
        self.core.scheduler.remove_executable_timing(executable.id())
    }

    fn allocation_alignment_bytes(&self) -> usize {
        self.core.layout.structures.allocation_alignment_bytes
    }
}

//! The USB transport proper.
//!
//! One worker thread owns all device I/O. It drains a bounded event queue
//! fed by the USB stack's completion callbacks, keeps the standing event
//! and interrupt readers installed, keeps the queued bulk-in pool reading,
//! and walks the I/O FIFO in [`UsbTransport::process_io`], which encodes
//! the per-mode flow-control rules of the wire protocol.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

use axion_api::{Buffer, ClosingMode, DriverOptions, Error, Result, Timing, TpuRequestKind};
use log::{debug, trace, warn};

use crate::chip::CsrLayout;
use crate::device_buffer::{DeviceBuffer, MappedDeviceBuffer};
use crate::dma::{DmaInfoExtractor, ExtractorMode};
use crate::mapper::DeviceBufferMapper;
use crate::memory::dram::DramAllocator;
use crate::memory::host::HostAllocator;
use crate::memory::nop::NopAddressSpace;
use crate::memory::space::{AddressSpace, DmaDirection, MappingTypeHint};
use crate::power::{RunControl, RunController, TopLevelHandler};
use crate::registers::Registers;
use crate::registry::ExecutableReference;
use crate::request::Request;
use crate::scheduler::SingleQueueDmaScheduler;
use crate::time::TimeStamper;
use crate::transport::{HookRegistry, Transport};
use crate::tpu_request::TpuRequest;
use crate::usb::device::{
    self, BULK_IN_ENDPOINT, ConstTransfer, DescriptorSources, DescriptorTag, DeviceSpeed,
    EventDescriptor, INPUT_ACTIVATIONS_ENDPOINT, INSTRUCTIONS_ENDPOINT, InterruptInfo,
    InterruptLines, MutTransfer, PARAMETERS_ENDPOINT, RawUsbDevice, SINGLE_BULK_OUT_ENDPOINT,
    UsbDevice, UsbDeviceFactory,
};
use crate::usb::io_request::{IoType, SourceAndMatchStatus, UsbIoRequest};
use crate::usb::registers::UsbRegisters;
use crate::watchdog::Watchdog;

/// How endpoints carry the three bulk-out classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    /// Dedicated endpoints with hardware flow control.
    MultipleEndpointsHardwareControl,
    /// Dedicated endpoints, the driver queries credit CSRs before sending.
    MultipleEndpointsSoftwareQuery,
    /// One shared endpoint; every transfer is prefixed by a tag header.
    SingleEndpoint,
}

/// USB transport options.
#[derive(Debug, Clone)]
pub struct UsbOptions {
    /// Endpoint operating mode.
    pub mode: OperatingMode,
    /// Keep the largest bulk-in chunk size even on USB 2.
    pub usb_force_largest_bulk_in_chunk_size: bool,
    /// Let the device push bulk in/out descriptors over the event
    /// endpoint.
    pub usb_enable_bulk_descriptors_from_device: bool,
    /// Replay the compiler's DMA hints.
    pub usb_enable_processing_of_hints: bool,
    /// Concurrency cap for async transfers.
    pub usb_max_num_async_transfers: usize,
    /// Largest single bulk-out transfer.
    pub max_bulk_out_transfer_size_in_bytes: usize,
    /// Credit floor below which software flow control pauses.
    pub software_credits_lower_limit_in_bytes: u32,
    /// Let the next sub-request's transfers start while the current one
    /// drains.
    pub usb_enable_overlapping_requests: bool,
    /// Allow bulk-in before all bulk-out completed.
    pub usb_enable_overlapping_bulk_in_and_out: bool,
    /// Keep a pool of standing bulk-in reads.
    pub usb_enable_queued_bulk_in_requests: bool,
    /// Refuse connections below SuperSpeed.
    pub usb_fail_if_slower_than_superspeed: bool,
    /// General USB operation timeout.
    pub usb_timeout_millis: u64,
    /// Firmware image for DFU; required when DFU runs.
    pub usb_firmware_image: Vec<u8>,
    /// Always re-flash firmware at open.
    pub usb_always_dfu: bool,
    /// Bulk-in chunk size; must be 1 KiB aligned for the queued pool.
    pub usb_bulk_in_max_chunk_size_in_bytes: usize,
    /// Number of standing bulk-in buffers.
    pub usb_bulk_in_queue_capacity: usize,
}

impl Default for UsbOptions {
    fn default() -> Self {
        Self {
            mode: OperatingMode::SingleEndpoint,
            usb_force_largest_bulk_in_chunk_size: false,
            usb_enable_bulk_descriptors_from_device: false,
            usb_enable_processing_of_hints: true,
            usb_max_num_async_transfers: 3,
            max_bulk_out_transfer_size_in_bytes: 1024 * 1024,
            software_credits_lower_limit_in_bytes: 8 * 1024,
            usb_enable_overlapping_requests: true,
            usb_enable_overlapping_bulk_in_and_out: true,
            usb_enable_queued_bulk_in_requests: true,
            usb_fail_if_slower_than_superspeed: false,
            usb_timeout_millis: 6000,
            usb_firmware_image: Vec::new(),
            usb_always_dfu: true,
            usb_bulk_in_max_chunk_size_in_bytes: 1024,
            usb_bulk_in_queue_capacity: 32,
        }
    }
}

/// Bulk-out tags in table order.
const NUM_BULK_OUT_TAGS: usize = 3;
const TAG_TO_BULK_OUT_ENDPOINT: [u8; NUM_BULK_OUT_TAGS] = [
    INSTRUCTIONS_ENDPOINT,
    INPUT_ACTIVATIONS_ENDPOINT,
    PARAMETERS_ENDPOINT,
];

/// Device open retry budget.
const MAX_OPEN_RETRIES: usize = 25;
const OPEN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Hard bound on queued worker events; pushes block when full.
const EVENT_QUEUE_CAP: usize = 256;

/// 256-byte bulk-in cap for USB 2 high speed.
const USB2_BULK_IN_CAP_BYTES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Paused,
    Closing,
    Closed,
}

/// One filled standing bulk-in buffer awaiting consumption.
struct FilledBulkIn {
    buffer_index: usize,
    begin_offset: usize,
    end_offset: usize,
}

/// Work moved from USB completion context onto the worker thread.
enum WorkerEvent {
    BulkOutDone {
        io_id: i64,
        bytes: usize,
        header: bool,
        result: Result<()>,
    },
    BulkInDone {
        io_id: i64,
        bytes: usize,
        result: Result<()>,
    },
    QueuedBulkInDone {
        buffer_index: usize,
        bytes: usize,
        result: Result<()>,
    },
    Event {
        descriptor: Option<EventDescriptor>,
        result: Result<()>,
    },
    Interrupt {
        info: Option<InterruptInfo>,
        result: Result<()>,
    },
}

/// Bounded hand-off queue from USB completion context to the worker.
struct EventQueue {
    inner: Mutex<EventQueueInner>,
    cv: Condvar,
}

#[derive(Default)]
struct EventQueueInner {
    events: VecDeque<WorkerEvent>,
    kick: bool,
}

impl EventQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(EventQueueInner::default()),
            cv: Condvar::new(),
        }
    }

    /// Enqueues an event, blocking while the queue is at capacity. The
    /// worker drains on every wakeup, so the wait is short.
    fn push(&self, event: WorkerEvent) {
        let mut inner = self.inner.lock().unwrap();
        while inner.events.len() >= EVENT_QUEUE_CAP {
            inner = self.cv.wait(inner).unwrap();
        }
        inner.events.push_back(event);
        self.cv.notify_all();
    }

    fn drain(&self) -> Vec<WorkerEvent> {
        let mut inner = self.inner.lock().unwrap();
        let drained: Vec<WorkerEvent> = inner.events.drain(..).collect();
        if !drained.is_empty() {
            self.cv.notify_all();
        }
        drained
    }

    /// Wakes the worker without an event (state changed).
    fn kick(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.kick = true;
        self.cv.notify_all();
    }

    /// Blocks until events or a kick arrive.
    fn wait_for_activity(&self) {
        let mut inner = self.inner.lock().unwrap();
        while inner.events.is_empty() && !inner.kick {
            inner = self.cv.wait(inner).unwrap();
        }
        inner.kick = false;
    }
}

struct UsbState {
    state: State,
    io_requests: VecDeque<UsbIoRequest>,
    bulk_in_buffers: Vec<Buffer>,
    available_bulk_in: VecDeque<usize>,
    filled_bulk_in: VecDeque<FilledBulkIn>,
    cap_bulk_in_at_256: bool,
    event_reader_active: bool,
    interrupt_reader_active: bool,
}

/// Driver transport over bulk USB.
pub struct UsbTransport {
    layout: CsrLayout,
    options: Mutex<UsbOptions>,
    device_factory: Box<dyn UsbDeviceFactory>,
    device: Mutex<Option<Arc<dyn UsbDevice>>>,
    registers: Arc<UsbRegisters>,
    power: TopLevelHandler,
    run_controller: RunController,
    allocator: HostAllocator,
    dram_allocator: Arc<dyn DramAllocator>,
    address_space: Arc<dyn AddressSpace>,
    scheduler: SingleQueueDmaScheduler,
    extractor: DmaInfoExtractor,
    hooks: Arc<HookRegistry>,
    events: Arc<EventQueue>,
    state: Mutex<UsbState>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    next_id: AtomicI32,
    next_io_id: AtomicI64,
    self_ref: Mutex<Weak<UsbTransport>>,
}

impl UsbTransport {
    /// Builds the transport. The device is not touched until
    /// [`Transport::open`].
    pub fn new(
        layout: CsrLayout,
        device_factory: Box<dyn UsbDeviceFactory>,
        dram_allocator: Arc<dyn DramAllocator>,
        options: UsbOptions,
        driver_options: &DriverOptions,
        _time_stamper: Arc<dyn TimeStamper>,
    ) -> Arc<Self> {
        let hooks = Arc::new(HookRegistry::new());
        let watchdog_hooks = Arc::clone(&hooks);
        let watchdog = Watchdog::new(
            driver_options.watchdog_timeout_ns,
            Box::new(move || watchdog_hooks.watchdog_timeout()),
        );
        let registers = Arc::new(UsbRegisters::new());
        let extractor_mode = if options.usb_enable_processing_of_hints {
            ExtractorMode::DmaHints
        } else {
            ExtractorMode::FirstInstruction
        };
        let overlap = options.usb_enable_overlapping_requests;

        let transport = Arc::new(Self {
            layout,
            options: Mutex::new(options),
            device_factory,
            device: Mutex::new(None),
            registers: Arc::clone(&registers),
            power: TopLevelHandler::new(
                Arc::clone(&registers) as Arc<dyn Registers>,
                layout.power,
            ),
            run_controller: RunController::new(
                Arc::clone(&registers) as Arc<dyn Registers>,
                layout.scalar,
            ),
            allocator: HostAllocator::new(layout.structures.allocation_alignment_bytes),
            dram_allocator,
            address_space: Arc::new(NopAddressSpace::new()),
            scheduler: SingleQueueDmaScheduler::new(watchdog),
            extractor: DmaInfoExtractor::new(extractor_mode, overlap),
            hooks,
            events: Arc::new(EventQueue::new()),
            state: Mutex::new(UsbState {
                state: State::Closed,
                io_requests: VecDeque::new(),
                bulk_in_buffers: Vec::new(),
                available_bulk_in: VecDeque::new(),
                filled_bulk_in: VecDeque::new(),
                cap_bulk_in_at_256: false,
                event_reader_active: false,
                interrupt_reader_active: false,
            }),
            worker: Mutex::new(None),
            next_id: AtomicI32::new(0),
            next_io_id: AtomicI64::new(0),
            self_ref: Mutex::new(Weak::new()),
        });
        *transport.self_ref.lock().unwrap() = Arc::downgrade(&transport);
        transport
    }

    // -- Device bring-up -------------------------------------------------------

    fn open_raw_with_retry(&self) -> Result<RawUsbDevice> {
        let mut last_error = Error::unknown("device open never attempted");
        for attempt in 0..MAX_OPEN_RETRIES {
            match self.device_factory.open() {
                Ok(device) => return Ok(device),
                Err(err) => {
                    debug!("device open attempt {attempt} failed: {err}");
                    last_error = err;
                }
            }
            thread::sleep(OPEN_RETRY_DELAY);
        }
        Err(last_error)
    }

    /// Discovers the device, running the firmware-download dance when
    /// needed: detach from application mode, reset, download, reset, and
    /// re-open expecting application mode.
    fn prepare_usb_device(&self) -> Result<Arc<dyn UsbDevice>> {
        let (always_dfu, firmware) = {
            let options = self.options.lock().unwrap();
            (options.usb_always_dfu, options.usb_firmware_image.clone())
        };

        debug!("opening device to check whether DFU is needed");
        let dfu_device = match self.open_raw_with_retry()? {
            RawUsbDevice::Application(application) => {
                if !always_dfu {
                    debug!("device is already in application mode, skipping DFU");
                    return Ok(application);
                }
                debug!("device is in application mode, sending DFU detach");
                application.dfu_detach()?;
                application.close(true)?;
                match self.open_raw_with_retry()? {
                    RawUsbDevice::Dfu(dfu) => dfu,
                    RawUsbDevice::Application(_) => {
                        return Err(Error::failed_precondition(
                            "device did not enter DFU mode after detach",
                        ));
                    }
                }
            }
            RawUsbDevice::Dfu(dfu) => {
                debug!("device is in DFU mode");
                dfu
            }
        };

        if firmware.is_empty() {
            return Err(Error::failed_precondition(
                "device needs firmware but no image was supplied",
            ));
        }
        debug!("downloading firmware ({} bytes)", firmware.len());
        dfu_device.claim_interface(0)?;
        dfu_device.download_firmware(&firmware)?;
        debug!("resetting into application mode");
        dfu_device.close(true)?;

        match self.open_raw_with_retry()? {
            RawUsbDevice::Application(application) => Ok(application),
            RawUsbDevice::Dfu(_) => Err(Error::failed_precondition(
                "device stayed in DFU mode after firmware download",
            )),
        }
    }

    fn validate_connection_speed(
        &self,
        device: &Arc<dyn UsbDevice>,
        options: &UsbOptions,
    ) -> Result<()> {
        match device.device_speed() {
            DeviceSpeed::Low => Err(Error::failed_precondition(
                "USB low speed is not supported",
            )),
            DeviceSpeed::Full | DeviceSpeed::High => {
                if options.usb_fail_if_slower_than_superspeed {
                    Err(Error::failed_precondition(
                        "connection is slower than SuperSpeed",
                    ))
                } else if options.mode != OperatingMode::SingleEndpoint {
                    Err(Error::failed_precondition(
                        "multi-endpoint modes need a SuperSpeed connection",
                    ))
                } else {
                    Ok(())
                }
            }
            DeviceSpeed::Super => Ok(()),
            DeviceSpeed::Unknown => {
                debug!("connection speed unknown; skipping the speed constraint");
                Ok(())
            }
        }
    }

    /// Programs the USB bridge CSRs: descriptor sources, endpoint mode,
    /// and the outfeed chunk length (with the USB 2 workaround). Returns
    /// whether bulk-in must cap at 256 bytes.
    fn initialize_chip(&self, device: &Arc<dyn UsbDevice>, options: &UsbOptions) -> Result<bool> {
        let usb = self.layout.usb;
        let omc = self.registers.read_32(usb.omc0_00)?;
        debug!("e-fuse programming revision: {}", (omc >> 24) & 0xFF);

        if options.usb_enable_bulk_descriptors_from_device {
            debug!("enabling all descriptor sources");
            let sources = DescriptorSources::BULK_DATA | DescriptorSources::SC_INTERRUPTS;
            self.registers.write_64(usb.descr_ep, sources.bits())?;
        } else {
            debug!("enabling only scalar-core interrupt descriptors");
            self.registers
                .write_64(usb.descr_ep, DescriptorSources::SC_INTERRUPTS.bits())?;
        }

        match options.mode {
            OperatingMode::MultipleEndpointsHardwareControl
            | OperatingMode::MultipleEndpointsSoftwareQuery => {
                debug!("enabling multiple endpoint mode");
                self.registers.write_64(usb.multi_bo_ep, 1)?;
            }
            OperatingMode::SingleEndpoint => {
                debug!("enabling single endpoint mode");
                self.registers.write_64(usb.multi_bo_ep, 0)?;
            }
        }

        if !options.usb_force_largest_bulk_in_chunk_size
            && device.device_speed() == DeviceSpeed::High
        {
            // 256-byte chunks keep USB 2 hosts from waiting on short
            // packets. 0x20 units of 8 bytes.
            debug!("setting 256 B outfeed chunks for USB 2 high speed");
            self.registers.write_64(usb.outfeed_chunk_length, 0x20)?;
            Ok(true)
        } else {
            debug!("setting 1 KiB outfeed chunks");
            self.registers.write_64(usb.outfeed_chunk_length, 0x80)?;
            Ok(false)
        }
    }

    fn enable_device_interrupts(&self) -> Result<()> {
        self.registers
            .write_64(self.layout.hib.fatal_error_int_enable, 1)?;
        self.registers
            .write_64(self.layout.hib.top_level_int_enable, !0u64)
    }

    fn disable_device_interrupts(&self) -> Result<()> {
        let mut status = Ok(());
        axion_api::error::accumulate(
            &mut status,
            self.registers
                .write_64(self.layout.hib.top_level_int_enable, 0),
        );
        axion_api::error::accumulate(
            &mut status,
            self.registers
                .write_64(self.layout.hib.fatal_error_int_enable, 0),
        );
        status
    }

    // -- Worker ---------------------------------------------------------------

    fn worker_loop(self: Arc<Self>) {
        debug!("USB worker starting");
        loop {
            for event in self.events.drain() {
                self.handle_worker_event(event);
            }

            let mut reevaluation_needed = false;
            let mut exit = false;
            {
                let mut st = self.state.lock().unwrap();
                let device = self.device.lock().unwrap().clone();
                match st.state {
                    State::Closing | State::Closed => {
                        let outstanding_reads = st.bulk_in_buffers.len()
                            - st.available_bulk_in.len()
                            - st.filled_bulk_in.len();
                        if outstanding_reads == 0
                            && !st.event_reader_active
                            && !st.interrupt_reader_active
                            && self.scheduler.is_empty()
                        {
                            debug!("closing with all async operations complete");
                            exit = true;
                        } else {
                            debug!("closing; waiting for async operations to complete");
                        }
                    }
                    State::Paused => {
                        debug!("paused; not initiating device operations");
                    }
                    State::Open => {
                        if let Some(device) = device {
                            reevaluation_needed |= self.install_standing_reads(&device, &mut st);
                            match self.process_io(&device, &mut st) {
                                Ok(changed) => reevaluation_needed |= changed,
                                Err(err) => {
                                    warn!("I/O processing failed: {err}");
                                    self.hooks.fatal_error(err);
                                }
                            }
                        }
                    }
                }
            }
            if exit {
                break;
            }
            if !reevaluation_needed {
                self.events.wait_for_activity();
            }
        }
        debug!("USB worker leaving");
    }

    /// (Re-)installs the event reader, interrupt reader and queued bulk-in
    /// reads. Returns true when anything was installed.
    fn install_standing_reads(&self, device: &Arc<dyn UsbDevice>, st: &mut UsbState) -> bool {
        let mut installed = false;

        if !st.event_reader_active {
            trace!("re-installing event reader");
            st.event_reader_active = true;
            installed = true;
            let events = Arc::clone(&self.events);
            let status = device.async_read_event(Box::new(move |result, descriptor| {
                events.push(WorkerEvent::Event {
                    descriptor: Some(descriptor),
                    result,
                });
            }));
            if let Err(err) = status {
                warn!("installing the event reader failed: {err}");
                st.event_reader_active = false;
            }
        }

        if !st.interrupt_reader_active {
            trace!("re-installing interrupt reader");
            st.interrupt_reader_active = true;
            installed = true;
            let events = Arc::clone(&self.events);
            let status = device.async_read_interrupt(Box::new(move |result, info| {
                events.push(WorkerEvent::Interrupt {
                    info: Some(info),
                    result,
                });
            }));
            if let Err(err) = status {
                warn!("installing the interrupt reader failed: {err}");
                st.interrupt_reader_active = false;
            }
        }

        let queued = self.options.lock().unwrap().usb_enable_queued_bulk_in_requests;
        if queued {
            while let Some(buffer_index) = st.available_bulk_in.pop_front() {
                trace!("installing bulk-in reader into buffer {buffer_index}");
                installed = true;
                let buffer = &st.bulk_in_buffers[buffer_index];
                // Clear stale data so one request can never leak into the
                // next.
                // SAFETY: the pool buffer is live and exclusively ours
                // until the read completes.
                unsafe {
                    std::ptr::write_bytes(buffer.ptr(), 0, buffer.size_bytes());
                }
                let events = Arc::clone(&self.events);
                // SAFETY: pool buffers outlive the transfer; cancellation
                // resolves the callback before close frees them.
                let transfer = unsafe { MutTransfer::new(buffer.ptr(), buffer.size_bytes()) };
                let status = device.async_bulk_in(
                    BULK_IN_ENDPOINT,
                    transfer,
                    Box::new(move |result, bytes| {
                        events.push(WorkerEvent::QueuedBulkInDone {
                            buffer_index,
                            bytes,
                            result,
                        });
                    }),
                );
                if let Err(err) = status {
                    warn!("installing a bulk-in reader failed: {err}");
                    st.available_bulk_in.push_front(buffer_index);
                    break;
                }
            }
        }
        installed
    }

    fn handle_worker_event(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::BulkOutDone {
                io_id,
                bytes,
                header,
                result,
            } => self.handle_transfer_done(io_id, bytes, header, result, "bulk-out"),
            WorkerEvent::BulkInDone {
                io_id,
                bytes,
                result,
            } => self.handle_transfer_done(io_id, bytes, false, result, "bulk-in"),
            WorkerEvent::QueuedBulkInDone {
                buffer_index,
                bytes,
                result,
            } => self.handle_queued_bulk_in(buffer_index, bytes, result),
            WorkerEvent::Event { descriptor, result } => {
                {
                    let mut st = self.state.lock().unwrap();
                    st.event_reader_active = false;
                }
                self.handle_event(descriptor, result);
            }
            WorkerEvent::Interrupt { info, result } => {
                {
                    let mut st = self.state.lock().unwrap();
                    st.interrupt_reader_active = false;
                }
                self.handle_interrupt(info, result);
            }
        }
    }

    fn handle_transfer_done(
        &self,
        io_id: i64,
        bytes: usize,
        header: bool,
        result: Result<()>,
        what: &str,
    ) {
        let mut st = self.state.lock().unwrap();
        match result {
            Ok(()) => {
                if header {
                    trace!("[{io_id}] {what} header done");
                    return;
                }
                if let Some(entry) = st
                    .io_requests
                    .iter_mut()
                    .find(|entry| entry.io_id() == io_id)
                {
                    entry.notify_transfer(bytes);
                    trace!("[{io_id}] {what} for {bytes} bytes done");
                } else {
                    warn!("[{io_id}] {what} completion for a dropped entry");
                }
            }
            Err(err) => {
                if err.is_cancelled() || st.state != State::Open {
                    trace!("[{io_id}] {what} cancelled");
                    return;
                }
                drop(st);
                warn!("[{io_id}] {what} failed: {err}");
                self.hooks.fatal_error(err);
            }
        }
    }

    fn handle_queued_bulk_in(&self, buffer_index: usize, bytes: usize, result: Result<()>) {
        let mut st = self.state.lock().unwrap();
        match result {
            Ok(()) => {
                trace!("bulk in {bytes} bytes into buffer {buffer_index}");
                st.filled_bulk_in.push_back(FilledBulkIn {
                    buffer_index,
                    begin_offset: 0,
                    end_offset: bytes,
                });
            }
            Err(err) => {
                // The byte count is meaningless; just return the buffer.
                st.available_bulk_in.push_back(buffer_index);
                if !err.is_cancelled() && !err.is_deadline_exceeded() {
                    drop(st);
                    warn!("queued bulk-in failed: {err}");
                    self.hooks.fatal_error(err);
                }
            }
        }
    }

    fn handle_event(&self, descriptor: Option<EventDescriptor>, result: Result<()>) {
        match result {
            Ok(()) => {
                let Some(descriptor) = descriptor else { return };
                let descriptors_enabled = self
                    .options
                    .lock()
                    .unwrap()
                    .usb_enable_bulk_descriptors_from_device;
                let mut st = self.state.lock().unwrap();
                if let Err(err) = self.handle_dma_descriptor(&mut st, descriptor, descriptors_enabled)
                {
                    drop(st);
                    self.hooks.fatal_error(err);
                }
            }
            Err(err) if err.is_deadline_exceeded() || err.is_cancelled() => {
                trace!("event read resolved without data: {err}");
            }
            Err(err) => {
                warn!("event read failed: {err}");
                self.hooks.fatal_error(err);
            }
        }
    }

    /// Digests one descriptor from the device: matches it against the
    /// oldest compatible hint, or appends a new device-originated entry.
    fn handle_dma_descriptor(
        &self,
        st: &mut UsbState,
        descriptor: EventDescriptor,
        bulk_events_enabled: bool,
    ) -> Result<()> {
        let buffer = DeviceBuffer::new(descriptor.device_address, descriptor.size_bytes as usize);
        trace!(
            "descriptor from device: tag {:?}, 0x{:016x}, {} bytes",
            descriptor.tag,
            buffer.device_address(),
            buffer.size_bytes()
        );

        for entry in st.io_requests.iter_mut() {
            match entry.source_and_match_status() {
                SourceAndMatchStatus::SubmittedByDevice
                | SourceAndMatchStatus::HintAlreadyMatched => continue,
                SourceAndMatchStatus::HintNotYetMatched => {}
            }
            if entry.tag() == DescriptorTag::Instructions {
                // The device never describes instruction fetches; they are
                // always considered matched.
                entry.set_matched();
                continue;
            }
            if !bulk_events_enabled && entry.ty() != IoType::ScHostInterrupt {
                // Only in-band interrupts can match.
                continue;
            }
            if descriptor.tag != entry.tag() {
                // The oldest unmatched hint disagrees: this is a new DMA.
                break;
            }
            if entry.ty() != IoType::ScHostInterrupt && entry.buffer() != buffer {
                continue;
            }
            entry.set_matched();
            return Ok(());
        }

        // No matching hint; the descriptor stands alone.
        let io_id = self.next_io_id.fetch_add(1, Ordering::Relaxed);
        match descriptor.tag {
            DescriptorTag::InputActivations | DescriptorTag::Parameters => {
                trace!("received new bulk-out command");
                st.io_requests.push_back(UsbIoRequest::from_device(
                    io_id,
                    IoType::BulkOut,
                    descriptor.tag,
                    buffer,
                ));
            }
            DescriptorTag::OutputActivations => {
                trace!("received new bulk-in command");
                st.io_requests.push_back(UsbIoRequest::from_device(
                    io_id,
                    IoType::BulkIn,
                    descriptor.tag,
                    buffer,
                ));
            }
            DescriptorTag::Interrupt(_) => {
                trace!("received new interrupt");
                st.io_requests
                    .push_back(UsbIoRequest::interrupt_from_device(io_id, descriptor.tag));
            }
            DescriptorTag::Instructions => {
                return Err(Error::data_loss(
                    "device sent an instruction descriptor",
                ));
            }
        }
        Ok(())
    }

    fn handle_interrupt(&self, info: Option<InterruptInfo>, result: Result<()>) {
        match result {
            Ok(()) => {
                let Some(info) = info else { return };
                let lines = InterruptLines::from_bits_retain(info.raw_data);
                trace!("interrupt received: {lines:?}");
                const TOP_LEVEL_SHIFT: u32 = 1;
                let top_level_mask = ((1u32
                    << self.layout.structures.num_top_level_interrupts)
                    - 1)
                    << TOP_LEVEL_SHIFT;

                if lines.contains(InterruptLines::FATAL_ERROR) {
                    debug!("fatal error interrupt received");
                    if let Err(err) = self
                        .registers
                        .write_64(self.layout.hib.fatal_error_int_status, 1)
                    {
                        warn!("failed to clear the fatal error interrupt: {err}");
                    }
                    self.check_fatal_error(self.check_hib_error());
                }
                if info.raw_data & top_level_mask != 0 {
                    let raised = (info.raw_data & top_level_mask) >> TOP_LEVEL_SHIFT;
                    for id in 0..self.layout.structures.num_top_level_interrupts as u32 {
                        if raised & (1 << id) != 0 {
                            debug!("top level interrupt {id} received");
                            if let Err(err) = self
                                .registers
                                .write_64(self.layout.hib.top_level_int_status, 1 << id)
                            {
                                warn!("failed to clear top-level interrupt {id}: {err}");
                            }
                            self.hooks.thermal_warning();
                        }
                    }
                }
            }
            Err(err) if err.is_cancelled() || err.is_deadline_exceeded() => {
                trace!("interrupt read resolved without data: {err}");
            }
            Err(err) => {
                warn!("interrupt read failed: {err}");
            }
        }
    }

    fn check_hib_error(&self) -> Result<()> {
        let hib_error_status = self.registers.read_64(self.layout.hib.hib_error_status)?;
        if hib_error_status == 0 {
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

    /// Reads the per-tag credit counters (software flow control mode).
    fn get_credits(&self, tag: DescriptorTag) -> u32 {
        // Latch a fresh snapshot before reading.
        if self.registers.write_32(self.layout.usb.omc0_00, 0xFFFF_FFFF).is_err() {
            warn!("credit latch write failed; assuming 0 credits");
            return 0;
        }
        let Ok(gcb_credits) = self.registers.read_64(self.layout.usb.ep_status_credit) else {
            warn!("credit read failed; assuming 0 credits");
            return 0;
        };

        const COUNTER_IN_BYTES: u64 = 8;
        const CREDIT_SHIFT: u64 = 21;
        const CREDIT_MASK: u64 = (1 << CREDIT_SHIFT) - 1;
        let instructions = (gcb_credits & CREDIT_MASK) * COUNTER_IN_BYTES;
        let input_activations = ((gcb_credits >> CREDIT_SHIFT) & CREDIT_MASK) * COUNTER_IN_BYTES;
        let parameters = ((gcb_credits >> (CREDIT_SHIFT * 2)) & CREDIT_MASK) * COUNTER_IN_BYTES;
        trace!(
            "credits: instructions {instructions}, input {input_activations}, \
             parameters {parameters}"
        );

        let credits = match tag {
            DescriptorTag::Instructions => instructions,
            DescriptorTag::InputActivations => input_activations,
            DescriptorTag::Parameters => parameters,
            _ => 0,
        };
        credits as u32
    }

    // -- The protocol core -----------------------------------------------------

    /// Walks the I/O FIFO once: retires completed entries, tops the FIFO
    /// up from the scheduler, and starts every transfer the per-mode rules
    /// allow. Returns true when any state changed (the worker re-runs
    /// without waiting).
    #[allow(clippy::too_many_lines)]
    fn process_io(&self, device: &Arc<dyn UsbDevice>, st: &mut UsbState) -> Result<bool> {
        let options = self.options.lock().unwrap().clone();

        // Retire completed entries at the head, strictly FIFO.
        while let Some(front) = st.io_requests.front() {
            if !front.is_completed() {
                break;
            }
            if options.usb_enable_bulk_descriptors_from_device
                && front.source_and_match_status() == SourceAndMatchStatus::HintNotYetMatched
            {
                // The descriptor validating this hint has not arrived yet.
                break;
            }
            let front = st.io_requests.pop_front().unwrap();
            if let Some(token) = front.token() {
                self.scheduler.notify_dma_completion(token)?;
            }
            if front.tag() == DescriptorTag::Interrupt(0) {
                self.scheduler.notify_request_completion()?;
                self.hooks.request_completion();
            }
            trace!("[{}] io completed", front.io_id());
        }

        // Pull newly issuable DMAs out of the scheduler.
        while let Some(dma) = self.scheduler.get_next_dma()? {
            let io_id = self.next_io_id.fetch_add(1, Ordering::Relaxed);
            st.io_requests.push_back(UsbIoRequest::from_dma(io_id, &dma));
        }

        let mut is_task_state_changed = false;
        let mut num_active_transfers = 0usize;
        let mut tag_has_unsent_chunk = [false; NUM_BULK_OUT_TAGS];
        let mut any_bulk_out_uncompleted = false;
        let mut any_bulk_in_uncompleted = false;

        let UsbState {
            io_requests,
            bulk_in_buffers,
            available_bulk_in,
            filled_bulk_in,
            cap_bulk_in_at_256,
            ..
        } = st;

        'entries: for entry in io_requests.iter_mut() {
            if entry.is_completed() {
                continue;
            }
            if entry.ty() == IoType::ScHostInterrupt {
                // Interrupts complete by event matching; nothing to do.
                continue;
            }
            let io_id = entry.io_id();
            let tag_index = entry.tag().bulk_out_index();

            if entry.ty() == IoType::BulkOut {
                any_bulk_out_uncompleted = true;
                let tag_index = tag_index.expect("bulk-out entries carry bulk-out tags");

                if entry.is_active() {
                    // Count the outstanding chunks and see whether another
                    // chunk of this entry can go out.
                    num_active_transfers +=
                        entry.active_count(options.max_bulk_out_transfer_size_in_bytes);
                } else if options.mode == OperatingMode::MultipleEndpointsHardwareControl {
                    // Different tags may interleave, but never two
                    // requests of the same tag, and instructions always
                    // lead.
                    let instructions_index = DescriptorTag::Instructions
                        .bulk_out_index()
                        .unwrap();
                    if tag_has_unsent_chunk[instructions_index] {
                        break;
                    }
                    let busy_tags = tag_has_unsent_chunk.iter().filter(|&&busy| busy).count();
                    if busy_tags == NUM_BULK_OUT_TAGS - 1 {
                        break;
                    }
                    if tag_has_unsent_chunk[tag_index] {
                        continue;
                    }
                } else if tag_has_unsent_chunk.iter().any(|&busy| busy) {
                    // Single-EP (and software query): one request's chunks
                    // at a time; its header went out once.
                    break;
                }

                if any_bulk_in_uncompleted {
                    if options.mode == OperatingMode::SingleEndpoint {
                        // Bulk-out after bulk-in can hog the shared data
                        // path until the bulk-in deadlocks.
                        trace!("[{io_id}] bulk-out waits for earlier bulk-in");
                        break;
                    }
                } else if num_active_transfers >= options.usb_max_num_async_transfers {
                    trace!(
                        "[{io_id}] too many concurrent transfers \
                         ({num_active_transfers})"
                    );
                    break;
                }

                if !entry.has_next_chunk() {
                    // Everything is in transit already.
                    continue;
                }

                match options.mode {
                    OperatingMode::MultipleEndpointsSoftwareQuery => {
                        is_task_state_changed = true;
                        let credits = self.get_credits(entry.tag());
                        if credits <= options.software_credits_lower_limit_in_bytes {
                            trace!("[{io_id}] credits too low ({credits})");
                            break;
                        }
                        let transfer_size = options
                            .max_bulk_out_transfer_size_in_bytes
                            .min(credits as usize);
                        let chunk = entry.next_chunk_limited(transfer_size);
                        let host = self.address_space.translate(&chunk)?;
                        // SAFETY: the chunk's backing memory belongs to the
                        // prepared sub-request and outlives the transfer.
                        let transfer =
                            unsafe { ConstTransfer::new(host.ptr(), host.size_bytes()) };
                        num_active_transfers += 1;
                        if entry.has_next_chunk() {
                            tag_has_unsent_chunk[tag_index] = true;
                        }
                        // Synchronous: the credit snapshot must stay
                        // accurate, and the device committed to accept
                        // this many bytes.
                        device.sync_bulk_out(TAG_TO_BULK_OUT_ENDPOINT[tag_index], transfer)?;
                        entry.notify_transfer(transfer.len());
                        trace!("[{io_id}] bulk out for {} bytes done", transfer.len());
                    }
                    OperatingMode::MultipleEndpointsHardwareControl => {
                        is_task_state_changed = true;
                        let chunk = entry
                            .next_chunk_limited(options.max_bulk_out_transfer_size_in_bytes);
                        let host = self.address_space.translate(&chunk)?;
                        let transfer_size = host.size_bytes();
                        num_active_transfers += 1;
                        if entry.has_next_chunk() {
                            tag_has_unsent_chunk[tag_index] = true;
                        }
                        let events = Arc::clone(&self.events);
                        // SAFETY: request-owned memory, alive until the
                        // completion (or cancellation) resolves.
                        let transfer = unsafe { ConstTransfer::new(host.ptr(), transfer_size) };
                        device.async_bulk_out(
                            TAG_TO_BULK_OUT_ENDPOINT[tag_index],
                            transfer,
                            Box::new(move |result| {
                                events.push(WorkerEvent::BulkOutDone {
                                    io_id,
                                    bytes: transfer_size,
                                    header: false,
                                    result,
                                });
                            }),
                        )?;
                    }
                    OperatingMode::SingleEndpoint => {
                        is_task_state_changed = true;
                        if !entry.is_active() && !entry.is_completed() && !entry.is_header_sent() {
                            num_active_transfers += 1;
                            trace!("[{io_id}] bulk out header");
                            let header = device::prepare_header(
                                entry.tag(),
                                entry.buffer().size_bytes(),
                            );
                            let header_ptr = entry.set_header(header);
                            let events = Arc::clone(&self.events);
                            // SAFETY: the header box lives inside the entry
                            // until it retires, after its transfers.
                            let transfer = unsafe { ConstTransfer::new(header_ptr, 8) };
                            device.async_bulk_out(
                                SINGLE_BULK_OUT_ENDPOINT,
                                transfer,
                                Box::new(move |result| {
                                    events.push(WorkerEvent::BulkOutDone {
                                        io_id,
                                        bytes: 0,
                                        header: true,
                                        result,
                                    });
                                }),
                            )?;
                        }

                        let chunk = entry
                            .next_chunk_limited(options.max_bulk_out_transfer_size_in_bytes);
                        let host = self.address_space.translate(&chunk)?;
                        let transfer_size = host.size_bytes();
                        num_active_transfers += 1;
                        if entry.has_next_chunk() {
                            tag_has_unsent_chunk[tag_index] = true;
                        }
                        let events = Arc::clone(&self.events);
                        // SAFETY: request-owned memory, alive until the
                        // completion (or cancellation) resolves.
                        let transfer = unsafe { ConstTransfer::new(host.ptr(), transfer_size) };
                        device.async_bulk_out(
                            SINGLE_BULK_OUT_ENDPOINT,
                            transfer,
                            Box::new(move |result| {
                                events.push(WorkerEvent::BulkOutDone {
                                    io_id,
                                    bytes: transfer_size,
                                    header: false,
                                    result,
                                });
                            }),
                        )?;
                    }
                }
            } else {
                // Bulk in.
                if options.usb_enable_queued_bulk_in_requests {
                    if any_bulk_in_uncompleted {
                        // Bulk-ins serialize against each other.
                        continue;
                    }
                    while let Some(filled) = filled_bulk_in.front_mut() {
                        is_task_state_changed = true;
                        let available = filled.end_offset - filled.begin_offset;
                        let chunk = entry.next_chunk();
                        let host = self.address_space.translate(&chunk)?;
                        let requested = host.size_bytes();
                        let transferred = available.min(requested);
                        let source = &bulk_in_buffers[filled.buffer_index];
                        // SAFETY: both buffers are live; transferred is
                        // within both.
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                source.ptr().add(filled.begin_offset),
                                host.ptr(),
                                transferred,
                            );
                        }
                        entry.notify_transfer(transferred);

                        if available <= requested {
                            trace!(
                                "[{io_id}] bulk in for {requested} bytes yielded \
                                 {available} bytes from buffer {}",
                                filled.buffer_index
                            );
                            available_bulk_in.push_back(filled.buffer_index);
                            filled_bulk_in.pop_front();
                            if entry.is_completed() {
                                break;
                            }
                        } else {
                            trace!(
                                "[{io_id}] bulk in yielded {requested} bytes (more \
                                 remain) from buffer {}",
                                filled.buffer_index
                            );
                            filled.begin_offset += requested;
                            break;
                        }
                    }
                    if !entry.is_completed() {
                        any_bulk_in_uncompleted = true;
                    }
                    continue 'entries;
                }

                if !options.usb_enable_overlapping_bulk_in_and_out && any_bulk_out_uncompleted {
                    trace!("[{io_id}] bulk-in waits for all bulk-out to complete");
                    break;
                } else if num_active_transfers >= options.usb_max_num_async_transfers {
                    trace!("[{io_id}] too many concurrent transfers");
                    break;
                } else if entry.is_active() {
                    num_active_transfers += 1;
                    trace!("[{io_id}] bulk-in still active");
                    break;
                }

                is_task_state_changed = true;
                any_bulk_in_uncompleted = true;
                let chunk = if *cap_bulk_in_at_256 {
                    entry.next_chunk_limited(USB2_BULK_IN_CAP_BYTES)
                } else {
                    entry.next_chunk()
                };
                let host = self.address_space.translate(&chunk)?;
                let transfer_size = host.size_bytes();
                trace!("[{io_id}] bulk in for {transfer_size} bytes");
                num_active_transfers += 1;
                let events = Arc::clone(&self.events);
                // SAFETY: request-owned memory, alive until the completion
                // (or cancellation) resolves.
                let transfer = unsafe { MutTransfer::new(host.ptr(), transfer_size) };
                device.async_bulk_in(
                    BULK_IN_ENDPOINT,
                    transfer,
                    Box::new(move |result, bytes| {
                        events.push(WorkerEvent::BulkInDone {
                            io_id,
                            bytes,
                            result,
                        });
                    }),
                )?;
                // Serialize bulk-ins: wait for this one.
                break;
            }
        }

        Ok(is_task_state_changed)
    }
}

impl Transport for UsbTransport {
    fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    fn open(&self, debug_mode: bool) -> Result<()> {
        {
            let st = self.state.lock().unwrap();
            if st.state != State::Closed {
                return Err(Error::failed_precondition(format!(
                    "bad USB transport state: expected Closed, actual {:?}",
                    st.state
                )));
            }
        }

        // Validate and normalize the queued-bulk-in configuration.
        {
            let mut options = self.options.lock().unwrap();
            if options.usb_enable_queued_bulk_in_requests {
                if !options.usb_enable_overlapping_bulk_in_and_out {
                    return Err(Error::failed_precondition(
                        "queued bulk-in requires overlapping bulk in/out",
                    ));
                }
                if options.usb_bulk_in_max_chunk_size_in_bytes % 1024 != 0 {
                    return Err(Error::out_of_range(
                        "bulk-in chunk size must be 1024-byte aligned",
                    ));
                }
                if options.usb_bulk_in_queue_capacity == 0 {
                    return Err(Error::out_of_range(
                        "bulk-in queue capacity must be positive",
                    ));
                }
            } else {
                options.usb_bulk_in_queue_capacity = 0;
            }
        }

        let device = self.prepare_usb_device()?;
        {
            let options = self.options.lock().unwrap();
            self.validate_connection_speed(&device, &options)?;
        }
        device.claim_interface(0)?;
        self.registers.set_device(Arc::clone(&device));

        // Power up through a clean reset, exactly as over MMIO.
        self.power.disable_software_clock_gate()?;
        self.power.disable_hardware_clock_gate()?;
        self.power.enable_reset()?;
        self.power.quit_reset()?;
        self.power.enable_hardware_clock_gate()?;

        let cap_bulk_in = {
            let options = self.options.lock().unwrap();
            self.initialize_chip(&device, &options)?
        };

        if !debug_mode {
            self.run_controller.do_run_control(RunControl::MoveToRun)?;
        }
        self.enable_device_interrupts()?;

        {
            let mut options = self.options.lock().unwrap();
            if cap_bulk_in
                && options.usb_bulk_in_max_chunk_size_in_bytes > USB2_BULK_IN_CAP_BYTES
            {
                debug!("reducing bulk-in request size to 256 bytes for USB 2");
                options.usb_bulk_in_max_chunk_size_in_bytes = USB2_BULK_IN_CAP_BYTES;
            }

            let mut st = self.state.lock().unwrap();
            st.cap_bulk_in_at_256 = cap_bulk_in;
            for index in 0..options.usb_bulk_in_queue_capacity {
                let chunk = self
                    .allocator
                    .make_buffer(options.usb_bulk_in_max_chunk_size_in_bytes);
                if !chunk.is_valid() {
                    return Err(Error::resource_exhausted(
                        "bulk-in buffer allocation failed",
                    ));
                }
                st.bulk_in_buffers.push(chunk);
                st.available_bulk_in.push_back(index);
            }
            *self.device.lock().unwrap() = Some(device);
            st.state = State::Open;
        }

        self.scheduler.open()?;
        self.dram_allocator.open()?;

        let transport = self
            .self_ref
            .lock()
            .unwrap()
            .upgrade()
            .expect("transport is alive while open runs");
        let worker = thread::Builder::new()
            .name("axion-usb-worker".to_string())
            .spawn(move || transport.worker_loop())
            .map_err(|err| Error::internal(format!("failed to spawn USB worker: {err}")))?;
        *self.worker.lock().unwrap() = Some(worker);
        self.events.kick();
        debug!("USB transport open");
        Ok(())
    }

    fn close(&self, in_error: bool, mode: ClosingMode) -> Result<()> {
        let device = {
            let mut st = self.state.lock().unwrap();
            if st.state != State::Open && st.state != State::Paused {
                return Err(Error::failed_precondition(format!(
                    "bad USB transport state: expected Open or Paused, actual {:?}",
                    st.state
                )));
            }
            st.state = State::Closing;
            self.device.lock().unwrap().clone()
        };

        // Cancellation synthesizes completions for every outstanding
        // transfer; the worker drains them before it exits.
        if let Some(device) = device.as_ref() {
            device.try_cancel_all_transfers();
        }

        if in_error || mode == ClosingMode::Asap {
            // Fail everything still queued so the worker's drain condition
            // can be met even with a hung device.
            self.scheduler.close(ClosingMode::Asap)?;
            let mut st = self.state.lock().unwrap();
            st.io_requests.clear();
        }
        self.events.kick();

        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }

        let mut status = Ok(());
        if !(in_error || mode == ClosingMode::Asap) {
            axion_api::error::accumulate(&mut status, self.scheduler.close(mode));
        }
        axion_api::error::accumulate(&mut status, self.disable_device_interrupts());
        axion_api::error::accumulate(
            &mut status,
            self.run_controller.do_run_control(RunControl::MoveToHalt),
        );
        axion_api::error::accumulate(&mut status, self.power.enable_reset());
        axion_api::error::accumulate(&mut status, self.registers.close());

        if let Some(device) = device {
            axion_api::error::accumulate(&mut status, device.close(false));
        }
        *self.device.lock().unwrap() = None;
        axion_api::error::accumulate(&mut status, self.dram_allocator.close());

        {
            let mut st = self.state.lock().unwrap();
            if !st.filled_bulk_in.is_empty() {
                debug!(
                    "dropping {} filled bulk-in buffers at close",
                    st.filled_bulk_in.len()
                );
            }
            st.bulk_in_buffers.clear();
            st.available_bulk_in.clear();
            st.filled_bulk_in.clear();
            st.io_requests.clear();
            st.event_reader_active = false;
            st.interrupt_reader_active = false;
            st.state = State::Closed;
        }
        debug!("USB transport closed");
        status
    }

    fn cancel_and_wait_requests(&self, in_error: bool) -> Result<()> {
        self.scheduler.cancel_pending_requests()?;
        if !in_error {
            self.scheduler.wait_active_requests()?;
        }
        Ok(())
    }

    fn make_buffer(&self, size_bytes: usize) -> Buffer {
        // Allocation zeroes; no request data can leak between requests.
        self.allocator.make_buffer(size_bytes)
    }

    fn map_buffer(&self, buffer: &Buffer, direction: DmaDirection) -> Result<MappedDeviceBuffer> {
        if !buffer.is_valid() {
            return Ok(MappedDeviceBuffer::invalid());
        }
        let device = self
            .address_space
            .map(buffer, direction, MappingTypeHint::Any)?;
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
        {
            let st = self.state.lock().unwrap();
            if st.state != State::Open {
                return Err(Error::failed_precondition("USB transport is not open"));
            }
        }
        let options = self.options.lock().unwrap();
        if !options.usb_enable_bulk_descriptors_from_device
            && !executable.executable().fully_deterministic
        {
            // Without device descriptors the hint list is the only source
            // of truth; it must cover every transfer.
            return Err(Error::failed_precondition(
                "executable must have fully deterministic DMA hints when \
                 device descriptors are disabled",
            ));
        }
        drop(options);

        Ok(Arc::new(TpuRequest::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
            parent,
            Arc::clone(executable),
            self.allocator,
            Arc::clone(&self.dram_allocator),
            DeviceBufferMapper::new(Arc::clone(&self.address_space)),
            self.extractor,
            self.layout.structures.minimum_alignment_bytes,
            kind,
        )))
    }

    fn submit(&self, request: Arc<TpuRequest>) -> Result<()> {
        {
            let st = self.state.lock().unwrap();
            if st.state != State::Open {
                return Err(Error::failed_precondition("USB transport is not open"));
            }
        }
        request.validate()?;
        request.prepare()?;
        self.scheduler.submit(request)?;
        self.events.kick();
        Ok(())
    }

    fn max_remaining_cycles(&self) -> i64 {
        self.scheduler.max_remaining_cycles()
    }

    fn oldest_active_request(&self) -> Result<Arc<TpuRequest>> {
        self.scheduler.oldest_active_request()
    }

    fn set_realtime_mode(&self, _on: bool) -> Result<()> {
        Err(Error::failed_precondition(
            "the USB transport does not support real-time mode",
        ))
    }

    fn set_executable_timing(
        &self,
        _executable: &Arc<ExecutableReference>,
        _timing: &Timing,
    ) -> Result<()> {
        Err(Error::failed_precondition(
            "the USB transport does not support real-time mode",
        ))
    }

    fn allocation_alignment_bytes(&self) -> usize {
        self.layout.structures.allocation_alignment_bytes
    }
}

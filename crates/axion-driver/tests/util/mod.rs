//! Shared harness for driver integration tests: a software model of the
//! USB device, package builders with a tiny instruction "program" the
//! model interprets, and driver construction helpers.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use axion_api::{DriverOptions, Result};
use axion_driver::chip::{Chip, CsrLayout};
use axion_driver::driver::Driver;
use axion_driver::memory::dram::NullDramAllocator;
use axion_driver::memory::host::HostAllocator;
use axion_driver::registry::PackageRegistry;
use axion_driver::time::MonotonicTimeStamper;
use axion_driver::usb::device::{
    BulkInDone, ConstTransfer, DescriptorTag, DeviceSpeed, EventDescriptor, EventDone,
    InterruptDone, InterruptInfo, MutTransfer, RawUsbDevice, UsbDevice, UsbDeviceFactory,
};
use axion_driver::usb::{UsbOptions, UsbTransport};
use axion_pack::{
    DmaHint, DmaHintTarget, ExecutableBuilder, ExecutableKind, FeedDirection, FieldOffset,
    LayerBuilder, PackageBuilder,
};

/// Initialises logging once per test binary.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// -- Device model --------------------------------------------------------------

/// What the fake accelerator computes: every output byte is an input byte
/// XOR 0x5A, cycling over the input (0x5A fill with no input).
pub fn device_transform(input: &[u8], output_size: usize) -> Vec<u8> {
    (0..output_size)
        .map(|index| {
            if input.is_empty() {
                0x5A
            } else {
                input[index % input.len()] ^ 0x5A
            }
        })
        .collect()
}

/// Builds the instruction "program" the device model interprets: a magic,
/// the expected input byte count and the produced output byte count,
/// padded to `size` bytes so patch points have room.
pub fn program_bitstream(input_size: usize, output_size: usize, size: usize) -> Vec<u8> {
    let mut bitstream = Vec::with_capacity(size);
    bitstream.extend_from_slice(b"AX");
    bitstream.extend_from_slice(&(input_size as u32).to_le_bytes());
    bitstream.extend_from_slice(&(output_size as u32).to_le_bytes());
    bitstream.resize(size.max(10), 0);
    bitstream
}

#[derive(Debug, Clone, Copy)]
struct Program {
    input_size: usize,
    output_size: usize,
}

enum Awaiting {
    Header,
    Payload { tag: DescriptorTag, remaining: usize },
}

struct DeviceInner {
    csrs: HashMap<u64, u64>,
    manual_execution: bool,
    hang: bool,
    awaiting: Awaiting,
    payload: Vec<u8>,
    program: Option<Program>,
    input_bytes: Vec<u8>,
    pending_executions: VecDeque<(Program, Vec<u8>)>,
    output_backlog: VecDeque<u8>,
    event_reader: Option<EventDone>,
    pending_events: VecDeque<EventDescriptor>,
    interrupt_reader: Option<InterruptDone>,
    bulk_in_reads: VecDeque<(MutTransfer, BulkInDone)>,
    executions: usize,
    pc_executions: usize,
    instruction_payloads: Vec<Vec<u8>>,
}

/// Software model of the accelerator behind the single-endpoint USB
/// protocol: parses tagged transfers, "executes" when a program has all
/// its input, answers bulk-ins from the output backlog and raises
/// interrupt 0 through the event endpoint.
pub struct FakeUsbDevice {
    inner: Mutex<DeviceInner>,
}

impl FakeUsbDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(DeviceInner {
                csrs: HashMap::new(),
                manual_execution: false,
                hang: false,
                awaiting: Awaiting::Header,
                payload: Vec::new(),
                program: None,
                input_bytes: Vec::new(),
                pending_executions: VecDeque::new(),
                output_backlog: VecDeque::new(),
                event_reader: None,
                pending_events: VecDeque::new(),
                interrupt_reader: None,
                bulk_in_reads: VecDeque::new(),
                executions: 0,
                pc_executions: 0,
                instruction_payloads: Vec::new(),
            }),
        })
    }

    /// Holds executions until [`FakeUsbDevice::release_execution`].
    pub fn set_manual_execution(&self, manual: bool) {
        self.inner.lock().unwrap().manual_execution = manual;
    }

    /// Swallows work without ever completing it (hang simulation).
    pub fn set_hang(&self, hang: bool) {
        self.inner.lock().unwrap().hang = hang;
    }

    /// Lets one held execution complete.
    pub fn release_execution(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some((program, input)) = inner.pending_executions.pop_front() {
            Self::execute(&mut inner, program, &input);
        }
    }

    /// Total completed executions.
    pub fn executions(&self) -> usize {
        self.inner.lock().unwrap().executions
    }

    /// Executions held back by manual mode.
    pub fn pending_execution_count(&self) -> usize {
        self.inner.lock().unwrap().pending_executions.len()
    }

    /// True once the transport installed its interrupt reader.
    pub fn has_interrupt_reader(&self) -> bool {
        self.inner.lock().unwrap().interrupt_reader.is_some()
    }

    /// Completed executions with no input (parameter-caching runs).
    pub fn pc_executions(&self) -> usize {
        self.inner.lock().unwrap().pc_executions
    }

    /// Raw instruction payloads in arrival order.
    pub fn instruction_payloads(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().instruction_payloads.clone()
    }

    /// Raises lines on the interrupt endpoint.
    pub fn send_interrupt(&self, raw_data: u32) {
        let reader = self.inner.lock().unwrap().interrupt_reader.take();
        if let Some(reader) = reader {
            reader(Ok(()), InterruptInfo { raw_data });
        }
    }

    /// Seeds a CSR value (e.g. a HIB error status).
    pub fn preload_csr(&self, offset: u64, value: u64) {
        self.inner.lock().unwrap().csrs.insert(offset, value);
    }

    fn feed_bulk_out(&self, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        match inner.awaiting {
            Awaiting::Header => {
                assert_eq!(data.len(), 8, "headers are exactly 8 bytes");
                let tag = DescriptorTag::from_wire(data[0]).expect("valid header tag");
                let length = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
                inner.awaiting = Awaiting::Payload {
                    tag,
                    remaining: length,
                };
                inner.payload.clear();
            }
            Awaiting::Payload { tag, remaining } => {
                assert!(
                    data.len() <= remaining,
                    "payload chunk exceeds the announced length"
                );
                inner.payload.extend_from_slice(data);
                let remaining = remaining - data.len();
                if remaining > 0 {
                    inner.awaiting = Awaiting::Payload { tag, remaining };
                    return;
                }
                inner.awaiting = Awaiting::Header;
                let payload = std::mem::take(&mut inner.payload);
                Self::on_payload_complete(&mut inner, tag, payload);
            }
        }
    }

    fn on_payload_complete(inner: &mut DeviceInner, tag: DescriptorTag, payload: Vec<u8>) {
        match tag {
            DescriptorTag::Instructions => {
                assert!(payload.len() >= 10 && &payload[0..2] == b"AX", "bad program");
                let program = Program {
                    input_size: u32::from_le_bytes(payload[2..6].try_into().unwrap()) as usize,
                    output_size: u32::from_le_bytes(payload[6..10].try_into().unwrap()) as usize,
                };
                inner.instruction_payloads.push(payload);
                inner.program = Some(program);
                inner.input_bytes.clear();
                if program.input_size == 0 {
                    Self::maybe_execute(inner);
                }
            }
            DescriptorTag::InputActivations | DescriptorTag::Parameters => {
                inner.input_bytes.extend_from_slice(&payload);
                if let Some(program) = inner.program {
                    if inner.input_bytes.len() >= program.input_size {
                        Self::maybe_execute(inner);
                    }
                }
            }
            _ => panic!("unexpected bulk-out tag {tag:?}"),
        }
    }

    fn maybe_execute(inner: &mut DeviceInner) {
        if inner.hang {
            return;
        }
        let Some(program) = inner.program.take() else {
            return;
        };
        let input = std::mem::take(&mut inner.input_bytes);
        if inner.manual_execution {
            inner.pending_executions.push_back((program, input));
        } else {
            Self::execute(inner, program, &input);
        }
    }

    fn execute(inner: &mut DeviceInner, program: Program, input: &[u8]) {
        let output = device_transform(input, program.output_size);
        inner.output_backlog.extend(output);
        inner.executions += 1;
        if program.input_size == 0 {
            inner.pc_executions += 1;
        }
        Self::serve_bulk_in_reads(inner);

        // Execution done: interrupt 0 arrives as an event descriptor.
        let descriptor = EventDescriptor {
            tag: DescriptorTag::Interrupt(0),
            device_address: 0,
            size_bytes: 0,
        };
        if let Some(reader) = inner.event_reader.take() {
            reader(Ok(()), descriptor);
        } else {
            inner.pending_events.push_back(descriptor);
        }
    }

    fn serve_bulk_in_reads(inner: &mut DeviceInner) {
        while !inner.output_backlog.is_empty() {
            let Some((transfer, done)) = inner.bulk_in_reads.pop_front() else {
                return;
            };
            let n = transfer.len().min(inner.output_backlog.len());
            // SAFETY: the transport keeps the read buffer alive until this
            // completion runs.
            let buffer = unsafe { transfer.as_mut_slice() };
            for byte in buffer.iter_mut().take(n) {
                *byte = inner.output_backlog.pop_front().unwrap();
            }
            done(Ok(()), n);
        }
    }

    fn reset_protocol_state(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.awaiting = Awaiting::Header;
        inner.payload.clear();
        inner.program = None;
        inner.input_bytes.clear();
        inner.pending_executions.clear();
        inner.output_backlog.clear();
        inner.pending_events.clear();
    }
}

impl UsbDevice for FakeUsbDevice {
    fn device_speed(&self) -> DeviceSpeed {
        DeviceSpeed::Super
    }

    fn claim_interface(&self, _interface: i32) -> Result<()> {
        Ok(())
    }

    fn control_read_64(&self, offset: u64) -> Result<u64> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .csrs
            .get(&offset)
            .copied()
            .unwrap_or(0))
    }

    fn control_write_64(&self, offset: u64, value: u64) -> Result<()> {
        self.inner.lock().unwrap().csrs.insert(offset, value);
        Ok(())
    }

    fn sync_bulk_out(&self, _endpoint: u8, data: ConstTransfer) -> Result<()> {
        // SAFETY: the transport keeps the buffer alive across this call.
        let bytes = unsafe { data.as_slice() }.to_vec();
        self.feed_bulk_out(&bytes);
        Ok(())
    }

    fn async_bulk_out(
        &self,
        _endpoint: u8,
        data: ConstTransfer,
        done: axion_driver::usb::device::BulkOutDone,
    ) -> Result<()> {
        // SAFETY: the transport keeps the buffer alive until `done` runs.
        let bytes = unsafe { data.as_slice() }.to_vec();
        self.feed_bulk_out(&bytes);
        done(Ok(()));
        Ok(())
    }

    fn async_bulk_in(&self, _endpoint: u8, buffer: MutTransfer, done: BulkInDone) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.bulk_in_reads.push_back((buffer, done));
        Self::serve_bulk_in_reads(&mut inner);
        Ok(())
    }

    fn async_read_event(&self, done: EventDone) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(descriptor) = inner.pending_events.pop_front() {
            drop(inner);
            done(Ok(()), descriptor);
        } else {
            inner.event_reader = Some(done);
        }
        Ok(())
    }

    fn async_read_interrupt(&self, done: InterruptDone) -> Result<()> {
        self.inner.lock().unwrap().interrupt_reader = Some(done);
        Ok(())
    }

    fn try_cancel_all_transfers(&self) {
        let (event_reader, interrupt_reader, bulk_in_reads) = {
            let mut inner = self.inner.lock().unwrap();
            (
                inner.event_reader.take(),
                inner.interrupt_reader.take(),
                inner.bulk_in_reads.drain(..).collect::<Vec<_>>(),
            )
        };
        if let Some(reader) = event_reader {
            reader(
                Err(axion_api::Error::cancelled("transfer cancelled")),
                EventDescriptor {
                    tag: DescriptorTag::Interrupt(0),
                    device_address: 0,
                    size_bytes: 0,
                },
            );
        }
        if let Some(reader) = interrupt_reader {
            reader(
                Err(axion_api::Error::cancelled("transfer cancelled")),
                InterruptInfo { raw_data: 0 },
            );
        }
        for (_, done) in bulk_in_reads {
            done(Err(axion_api::Error::cancelled("transfer cancelled")), 0);
        }
    }

    fn dfu_detach(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self, _reset: bool) -> Result<()> {
        self.reset_protocol_state();
        Ok(())
    }
}

/// Factory handing out the same application-mode device model.
pub struct FakeUsbFactory {
    device: Arc<FakeUsbDevice>,
}

impl FakeUsbFactory {
    pub fn new(device: Arc<FakeUsbDevice>) -> Box<Self> {
        Box::new(Self { device })
    }
}

impl UsbDeviceFactory for FakeUsbFactory {
    fn open(&self) -> Result<RawUsbDevice> {
        Ok(RawUsbDevice::Application(
            Arc::clone(&self.device) as Arc<dyn UsbDevice>
        ))
    }
}

// -- Driver construction -------------------------------------------------------

pub struct TestDriverConfig {
    pub driver_options: DriverOptions,
    pub usb_options: UsbOptions,
}

impl Default for TestDriverConfig {
    fn default() -> Self {
        Self {
            driver_options: DriverOptions::default(),
            usb_options: UsbOptions {
                usb_always_dfu: false,
                ..UsbOptions::default()
            },
        }
    }
}

/// Builds a driver over the fake USB device.
pub fn make_usb_driver(config: TestDriverConfig) -> (Driver, Arc<FakeUsbDevice>) {
    let device = FakeUsbDevice::new();
    let layout = CsrLayout::a1();
    let transport = UsbTransport::new(
        layout,
        FakeUsbFactory::new(Arc::clone(&device)),
        Arc::new(NullDramAllocator::new()),
        config.usb_options,
        &config.driver_options,
        MonotonicTimeStamper::new(),
    );
    let registry = PackageRegistry::new(
        Some(Chip::A1),
        HostAllocator::new(layout.structures.allocation_alignment_bytes),
    );
    let driver = Driver::new(
        transport,
        registry,
        &config.driver_options,
        MonotonicTimeStamper::new(),
    );
    (driver, device)
}

// -- Package builders ----------------------------------------------------------

/// A stand-alone single-input single-output executable. The instruction
/// chunk carries the device model's program plus an input-address patch
/// point at bit offset 128.
pub fn standalone_package(
    input_size: usize,
    output_size: usize,
    batch_size: u32,
    estimated_cycles: i64,
) -> Vec<u8> {
    let total_input = input_size * batch_size as usize;
    let total_output = output_size * batch_size as usize;
    let mut executable = ExecutableBuilder::new(ExecutableKind::Standalone, batch_size)
        .estimated_cycles(estimated_cycles)
        .input_layer(LayerBuilder::new(
            "in",
            axion_pack::DataType::FixedPoint8,
            1,
            1,
            input_size as u32,
        ))
        .output_layer(LayerBuilder::new(
            "out",
            axion_pack::DataType::FixedPoint8,
            1,
            1,
            output_size as u32,
        ))
        .instruction_chunk(
            program_bitstream(total_input, total_output, 64),
            vec![FieldOffset {
                kind: axion_pack::FieldOffsetKind::Input,
                name: "in".to_string(),
                batch: 0,
                bit_offset: 128,
            }],
        )
        .fully_deterministic(true)
        .dma_hint(DmaHint::Instruction { chunk_index: 0 });
    for batch in 0..batch_size {
        executable = executable.dma_hint(DmaHint::Descriptor {
            target: DmaHintTarget::InputActivation,
            direction: FeedDirection::Infeed,
            name: "in".to_string(),
            batch,
            offset: 0,
            size: input_size as u64,
        });
    }
    for batch in 0..batch_size {
        executable = executable.dma_hint(DmaHint::Descriptor {
            target: DmaHintTarget::OutputActivation,
            direction: FeedDirection::Outfeed,
            name: "out".to_string(),
            batch,
            offset: 0,
            size: output_size as u64,
        });
    }
    executable = executable.dma_hint(DmaHint::Interrupt { id: 0 });

    PackageBuilder::new("test-model", Chip::A1)
        .executable(executable)
        .build()
}

/// A parameter-caching package: a caching executable (no I/O) plus an
/// inference executable sharing `token`.
pub fn parameter_caching_package(
    input_size: usize,
    output_size: usize,
    token: u64,
    estimated_cycles: i64,
) -> Vec<u8> {
    let caching = ExecutableBuilder::new(ExecutableKind::ParameterCaching, 1)
        .estimated_cycles(estimated_cycles)
        .parameter_caching_token(token)
        .parameters(vec![0x11; 256])
        .instruction_chunk(program_bitstream(0, 0, 32), Vec::new())
        .fully_deterministic(true)
        .dma_hint(DmaHint::Instruction { chunk_index: 0 })
        .dma_hint(DmaHint::Interrupt { id: 0 });

    let mut inference = ExecutableBuilder::new(ExecutableKind::Inference, 1)
        .estimated_cycles(estimated_cycles)
        .parameter_caching_token(token)
        .input_layer(LayerBuilder::new(
            "in",
            axion_pack::DataType::FixedPoint8,
            1,
            1,
            input_size as u32,
        ))
        .output_layer(LayerBuilder::new(
            "out",
            axion_pack::DataType::FixedPoint8,
            1,
            1,
            output_size as u32,
        ))
        .instruction_chunk(program_bitstream(input_size, output_size, 64), Vec::new())
        .fully_deterministic(true)
        .dma_hint(DmaHint::Instruction { chunk_index: 0 })
        .dma_hint(DmaHint::Descriptor {
            target: DmaHintTarget::InputActivation,
            direction: FeedDirection::Infeed,
            name: "in".to_string(),
            batch: 0,
            offset: 0,
            size: input_size as u64,
        });
    inference = inference
        .dma_hint(DmaHint::Descriptor {
            target: DmaHintTarget::OutputActivation,
            direction: FeedDirection::Outfeed,
            name: "out".to_string(),
            batch: 0,
            offset: 0,
            size: output_size as u64,
        })
        .dma_hint(DmaHint::Interrupt { id: 0 });

    PackageBuilder::new("cached-model", Chip::A1)
        .executable(caching)
        .executable(inference)
        .build()
}

/// Fills a driver buffer with `value`.
pub fn fill_buffer(buffer: &axion_api::Buffer, value: u8) {
    // SAFETY: driver-allocated host buffer.
    unsafe { std::ptr::write_bytes(buffer.ptr(), value, buffer.size_bytes()) };
}

/// Copies a driver buffer out for assertions.
pub fn read_buffer(buffer: &axion_api::Buffer) -> Vec<u8> {
    // SAFETY: driver-allocated host buffer.
    unsafe { std::slice::from_raw_parts(buffer.ptr(), buffer.size_bytes()) }.to_vec()
}

/// Spins until `predicate` holds or the timeout expires.
pub fn wait_for(predicate: impl Fn() -> bool, timeout: std::time::Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
    predicate()
}

//! Registered executable packages.
//!
//! The registry parses serialized packages, verifies them against the chip,
//! and owns everything a registration keeps alive: the aligned parameter
//! copy, the scratch buffer, parameter residency state and the pool of
//! reusable instruction buffers. Registry mutations serialize on a mutex;
//! metadata reads after registration are lock-free on the parsed package.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use axion_api::{Buffer, Error, ExecutionContext, Result};
use axion_pack::{Chip, Executable, ExecutableKind, LayerInfo, parse_package};
use log::{debug, trace};

use crate::device_buffer::{DeviceBuffer, MappedDeviceBuffer};
use crate::instruction::InstructionBuffers;
use crate::memory::host::HostAllocator;

/// Hard cap on pooled instruction buffers per executable. Requests beyond
/// the cap allocate fresh copies and drop them on return, bounding the
/// steady-state footprint of bursty traffic.
pub const INSTRUCTION_POOL_CAP: usize = 8;

/// One registered executable: parsed metadata plus the driver-owned
/// resources backing it.
#[derive(Debug)]
pub struct ExecutableReference {
    executable: Executable,
    parameters: Buffer,
    scratch: Buffer,
    mapped_parameters: Mutex<MappedDeviceBuffer>,
    parameters_mapped: AtomicBool,
    parameters_loaded: AtomicBool,
    needs_dram: bool,
    instruction_pool: Mutex<Vec<InstructionBuffers>>,
    package: Weak<PackageReference>,
}

impl ExecutableReference {
    fn new(
        executable: Executable,
        allocator: &HostAllocator,
        package: Weak<PackageReference>,
    ) -> Self {
        // The device DMAs parameters directly; keep an aligned copy so the
        // caller's serialized package can be dropped.
        let parameters = if executable.parameters.is_empty() {
            Buffer::invalid()
        } else {
            let buffer = allocator.make_buffer(executable.parameters.len());
            // SAFETY: freshly allocated buffer sized to the blob.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    executable.parameters.as_ptr(),
                    buffer.ptr(),
                    executable.parameters.len(),
                );
            }
            buffer
        };
        let scratch = if executable.scratch_size_bytes > 0 {
            allocator.make_buffer(executable.scratch_size_bytes as usize)
        } else {
            Buffer::invalid()
        };
        let needs_dram = executable
            .input_layers
            .iter()
            .chain(executable.output_layers.iter())
            .any(|layer| layer.cache_on_dram);
        Self {
            executable,
            parameters,
            scratch,
            mapped_parameters: Mutex::new(MappedDeviceBuffer::invalid()),
            parameters_mapped: AtomicBool::new(false),
            parameters_loaded: AtomicBool::new(false),
            needs_dram,
            instruction_pool: Mutex::new(Vec::new()),
            package,
        }
    }

    /// The parsed executable.
    pub fn executable(&self) -> &Executable {
        &self.executable
    }

    /// Hardware batch size.
    pub fn batch_size(&self) -> usize {
        self.executable.batch_size as usize
    }

    /// Estimated device cycles per run.
    pub fn estimated_cycles(&self) -> i64 {
        self.executable.estimated_cycles
    }

    /// Parameter-caching token. Zero means the parameters cannot coexist
    /// with another model's cached parameters.
    pub fn parameter_caching_token(&self) -> u64 {
        self.executable.parameter_caching_token
    }

    /// The aligned parameter copy; invalid when the executable carries no
    /// parameters.
    pub fn parameters(&self) -> &Buffer {
        &self.parameters
    }

    /// The scratch buffer; invalid when none is needed.
    pub fn scratch(&self) -> &Buffer {
        &self.scratch
    }

    /// True when a layer of this executable wants on-device DRAM.
    pub fn needs_dram(&self) -> bool {
        self.needs_dram
    }

    /// Looks up an input layer.
    pub fn input_layer(&self, name: &str) -> Result<&LayerInfo> {
        self.executable
            .input_layer(name)
            .ok_or_else(|| Error::not_found(format!("no input layer \"{name}\"")))
    }

    /// Looks up an output layer.
    pub fn output_layer(&self, name: &str) -> Result<&LayerInfo> {
        self.executable
            .output_layer(name)
            .ok_or_else(|| Error::not_found(format!("no output layer \"{name}\"")))
    }

    /// Checks a user input buffer against the layer's size contract: the
    /// buffer must carry at least the actual bytes and at most the padded
    /// bytes.
    pub fn validate_input(&self, name: &str, buffer: &Buffer) -> Result<()> {
        let layer = self.input_layer(name)?;
        let size = buffer.size_bytes();
        if size < layer.actual_size_bytes() || size > layer.padded_size_bytes() {
            return Err(Error::invalid_argument(format!(
                "input \"{name}\" is {size} bytes; expected between {} and {}",
                layer.actual_size_bytes(),
                layer.padded_size_bytes()
            )));
        }
        Ok(())
    }

    /// Checks a user output buffer against the layer's size contract.
    pub fn validate_output(&self, name: &str, buffer: &Buffer) -> Result<()> {
        let layer = self.output_layer(name)?;
        let size = buffer.size_bytes();
        if size < layer.actual_size_bytes() || size > layer.padded_size_bytes() {
            return Err(Error::invalid_argument(format!(
                "output \"{name}\" is {size} bytes; expected between {} and {}",
                layer.actual_size_bytes(),
                layer.padded_size_bytes()
            )));
        }
        Ok(())
    }

    /// Records the device mapping of the parameter buffer.
    pub fn set_mapped_parameters(&self, mapped: MappedDeviceBuffer) -> Result<()> {
        let mut slot = self.mapped_parameters.lock().unwrap();
        if self.parameters_mapped.load(Ordering::Acquire) {
            return Err(Error::failed_precondition(
                "parameters are already mapped",
            ));
        }
        *slot = mapped;
        self.parameters_mapped.store(true, Ordering::Release);
        Ok(())
    }

    /// Releases the device mapping of the parameter buffer, if any.
    pub fn unmap_parameters(&self) -> Result<()> {
        let mut slot = self.mapped_parameters.lock().unwrap();
        self.parameters_mapped.store(false, Ordering::Release);
        std::mem::replace(&mut *slot, MappedDeviceBuffer::invalid()).unmap()
    }

    /// True once the parameters are mapped on the device.
    pub fn parameters_mapped(&self) -> bool {
        self.parameters_mapped.load(Ordering::Acquire)
    }

    /// Device-side view of the mapped parameters.
    pub fn parameter_device_buffer(&self) -> DeviceBuffer {
        self.mapped_parameters.lock().unwrap().device_buffer()
    }

    /// Marks the parameters as loaded into on-device memory.
    pub fn set_parameters_loaded(&self) {
        self.parameters_loaded.store(true, Ordering::Release);
    }

    /// True while cached parameters are assumed present on the device.
    pub fn parameters_loaded(&self) -> bool {
        self.parameters_loaded.load(Ordering::Acquire)
    }

    /// Forgets any assumption about device-resident parameters. Called
    /// after context loss; the mapping state is untouched.
    pub fn reset_parameters_loaded(&self) {
        self.parameters_loaded.store(false, Ordering::Release);
    }

    /// Takes a pooled instruction-buffer set or allocates a fresh one.
    pub fn take_instruction_buffers(&self, allocator: &HostAllocator) -> InstructionBuffers {
        if let Some(buffers) = self.instruction_pool.lock().unwrap().pop() {
            trace!("reusing pooled instruction buffers");
            return buffers;
        }
        InstructionBuffers::new(allocator, &self.executable.instruction_chunks)
    }

    /// Returns instruction buffers to the pool. Beyond
    /// [`INSTRUCTION_POOL_CAP`] the buffers are dropped.
    pub fn return_instruction_buffers(&self, buffers: InstructionBuffers) {
        let mut pool = self.instruction_pool.lock().unwrap();
        if pool.len() < INSTRUCTION_POOL_CAP {
            pool.push(buffers);
        }
    }

    /// The package this executable belongs to.
    pub fn package_reference(&self) -> Option<Arc<PackageReference>> {
        self.package.upgrade()
    }

    /// Identity used as a key for timing records.
    pub fn id(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }
}

/// A live registration of one package.
#[derive(Debug)]
pub struct PackageReference {
    model_identifier: String,
    chip: Chip,
    standalone: Mutex<Option<Arc<ExecutableReference>>>,
    parameter_caching: Mutex<Option<Arc<ExecutableReference>>>,
    inference: Mutex<Option<Arc<ExecutableReference>>>,
    latency_tolerance_ms: AtomicI64,
    execution_context: Mutex<Option<Box<dyn ExecutionContext>>>,
    in_flight: AtomicUsize,
}

impl PackageReference {
    fn from_executables(
        model_identifier: String,
        chip: Chip,
        executables: Vec<Executable>,
        allocator: &HostAllocator,
    ) -> Result<Arc<Self>> {
        let mut standalone = None;
        let mut parameter_caching = None;
        let mut inference = None;
        for executable in &executables {
            let slot = match executable.kind {
                ExecutableKind::Standalone => &mut standalone,
                ExecutableKind::ParameterCaching => &mut parameter_caching,
                ExecutableKind::Inference => &mut inference,
            };
            if slot.replace(()).is_some() {
                return Err(Error::invalid_argument(format!(
                    "package holds more than one {:?} executable",
                    executable.kind
                )));
            }
        }
        // Legal combinations: one executable of any kind; parameter-caching
        // plus inference; all three.
        let legal = match executables.len() {
            1 => true,
            2 => parameter_caching.is_some() && inference.is_some(),
            3 => true, // all three slots filled, uniqueness checked above
            _ => false,
        };
        if !legal {
            return Err(Error::invalid_argument(
                "unsupported combination of executables in package",
            ));
        }

        let package = Arc::new(Self {
            model_identifier,
            chip,
            standalone: Mutex::new(None),
            parameter_caching: Mutex::new(None),
            inference: Mutex::new(None),
            latency_tolerance_ms: AtomicI64::new(-1),
            execution_context: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
        });
        let single = executables.len() == 1;
        for executable in executables {
            let kind = executable.kind;
            let reference = Arc::new(ExecutableReference::new(
                executable,
                allocator,
                Arc::downgrade(&package),
            ));
            // A lone executable answers metadata queries no matter its
            // declared kind.
            if single {
                *package.standalone.lock().unwrap() = Some(reference);
                break;
            }
            match kind {
                ExecutableKind::Standalone => {
                    *package.standalone.lock().unwrap() = Some(reference);
                }
                ExecutableKind::ParameterCaching => {
                    *package.parameter_caching.lock().unwrap() = Some(reference);
                }
                ExecutableKind::Inference => {
                    *package.inference.lock().unwrap() = Some(reference);
                }
            }
        }
        Ok(package)
    }

    /// The client-assigned model identifier.
    pub fn model_identifier(&self) -> &str {
        &self.model_identifier
    }

    /// Chip this package was compiled for.
    pub fn chip(&self) -> Chip {
        self.chip
    }

    /// The reference answering metadata queries: the stand-alone executable
    /// when present, otherwise the inference executable.
    pub fn main_executable_reference(&self) -> Arc<ExecutableReference> {
        if let Some(standalone) = self.standalone.lock().unwrap().as_ref() {
            return Arc::clone(standalone);
        }
        Arc::clone(
            self.inference
                .lock()
                .unwrap()
                .as_ref()
                .expect("package holds neither stand-alone nor inference executable"),
        )
    }

    /// True when the package carries a parameter-caching executable.
    pub fn parameter_caching_enabled(&self) -> bool {
        self.parameter_caching.lock().unwrap().is_some()
    }

    /// The parameter-caching executable, when present.
    pub fn parameter_caching_reference(&self) -> Option<Arc<ExecutableReference>> {
        self.parameter_caching.lock().unwrap().clone()
    }

    /// Every executable reference in the package.
    pub fn all_executable_references(&self) -> Vec<Arc<ExecutableReference>> {
        [&self.standalone, &self.parameter_caching, &self.inference]
            .into_iter()
            .filter_map(|slot| slot.lock().unwrap().clone())
            .collect()
    }

    /// True when every executable's parameters are mapped.
    pub fn parameters_mapped(&self) -> bool {
        self.all_executable_references()
            .iter()
            .all(|reference| reference.parameters_mapped())
    }

    /// Releases the parameter mappings of every executable.
    pub fn unmap_parameters(&self) -> Result<()> {
        let mut status = Ok(());
        for reference in self.all_executable_references() {
            axion_api::error::accumulate(&mut status, reference.unmap_parameters());
        }
        status
    }

    /// True when any executable in the package needs on-device DRAM.
    pub fn needs_dram(&self) -> bool {
        self.all_executable_references()
            .iter()
            .any(|reference| reference.needs_dram())
    }

    /// Sets the worst acceptable end-to-end latency for a request against
    /// this package.
    pub fn set_latency_tolerance(&self, latency_tolerance_ms: i64) -> Result<()> {
        if latency_tolerance_ms <= 0 {
            return Err(Error::invalid_argument(
                "latency tolerance must be positive",
            ));
        }
        self.latency_tolerance_ms
            .store(latency_tolerance_ms, Ordering::Release);
        Ok(())
    }

    /// The latency tolerance in milliseconds; non-positive means unset.
    pub fn latency_tolerance_ms(&self) -> i64 {
        self.latency_tolerance_ms.load(Ordering::Acquire)
    }

    /// Installs the opaque execution context used to attribute telemetry.
    pub fn set_execution_context(&self, context: Box<dyn ExecutionContext>) {
        *self.execution_context.lock().unwrap() = Some(context);
    }

    /// Runs `f` over the execution context, when one is installed.
    pub fn with_execution_context(&self, f: impl FnOnce(&dyn ExecutionContext)) {
        if let Some(context) = self.execution_context.lock().unwrap().as_deref() {
            f(context);
        }
    }

    /// Records a request entering flight against this package.
    pub(crate) fn begin_request(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Records a request leaving flight.
    pub(crate) fn end_request(&self) {
        let previous = self.in_flight.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);
    }

    /// Number of requests currently in flight against this package.
    pub fn in_flight_requests(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Content store of registered packages.
pub struct PackageRegistry {
    chip: Option<Chip>,
    allocator: HostAllocator,
    registrations: Mutex<Vec<Arc<PackageReference>>>,
}

impl PackageRegistry {
    /// Creates a registry enforcing `chip` compatibility. `None` skips the
    /// check (test harnesses).
    pub fn new(chip: Option<Chip>, allocator: HostAllocator) -> Self {
        Self {
            chip,
            allocator,
            registrations: Mutex::new(Vec::new()),
        }
    }

    /// Registers a serialized package.
    pub fn register_serialized(&self, bytes: &[u8]) -> Result<Arc<PackageReference>> {
        let package = parse_package(bytes)
            .map_err(|err| Error::invalid_argument(format!("bad package: {err}")))?;
        if let Some(chip) = self.chip {
            if package.chip != chip {
                return Err(Error::invalid_argument(format!(
                    "package compiled for {:?} but this driver controls {chip:?}",
                    package.chip
                )));
            }
        }
        let reference = PackageReference::from_executables(
            package.model_identifier,
            package.chip,
            package.executables,
            &self.allocator,
        )?;
        debug!(
            "registered package \"{}\" ({} executables)",
            reference.model_identifier(),
            reference.all_executable_references().len()
        );
        self.registrations.lock().unwrap().push(Arc::clone(&reference));
        Ok(reference)
    }

    /// Registers a package read from a file.
    pub fn register_file(&self, path: &std::path::Path) -> Result<Arc<PackageReference>> {
        let bytes = std::fs::read(path).map_err(|err| {
            Error::not_found(format!("cannot read package {}: {err}", path.display()))
        })?;
        self.register_serialized(&bytes)
    }

    /// Unregisters a package. Rejected while requests are in flight
    /// against it.
    pub fn unregister(&self, reference: &Arc<PackageReference>) -> Result<()> {
        if reference.in_flight_requests() > 0 {
            return Err(Error::failed_precondition(
                "package has requests in flight",
            ));
        }
        let mut registrations = self.registrations.lock().unwrap();
        let index = registrations
            .iter()
            .position(|candidate| Arc::ptr_eq(candidate, reference))
            .ok_or_else(|| Error::not_found("package is not registered"))?;
        let removed = registrations.remove(index);
        drop(registrations);
        removed.unmap_parameters()
    }

    /// Unregisters everything.
    pub fn unregister_all(&self) -> Result<()> {
        let removed: Vec<_> = self.registrations.lock().unwrap().drain(..).collect();
        let mut status = Ok(());
        for reference in removed {
            axion_api::error::accumulate(&mut status, reference.unmap_parameters());
        }
        status
    }

    /// Releases the parameter mappings of every registration. Must run
    /// before the MMU closes.
    pub fn unmap_all_parameters(&self) -> Result<()> {
        let mut status = Ok(());
        for reference in self.registrations.lock().unwrap().iter() {
            axion_api::error::accumulate(&mut status, reference.unmap_parameters());
        }
        status
    }

    /// Forgets all assumptions about device-resident parameters.
    pub fn reset_parameters_loaded(&self) {
        for reference in self.registrations.lock().unwrap().iter() {
            for executable in reference.all_executable_references() {
                executable.reset_parameters_loaded();
            }
        }
    }

    /// Number of live registrations.
    pub fn registry_size(&self) -> usize {
        self.registrations.lock().unwrap().len()
    }

    /// The allocator used for registration-owned buffers.
    pub fn allocator(&self) -> &HostAllocator {
        &self.allocator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axion_pack::{DataType, ExecutableBuilder, LayerBuilder, PackageBuilder};

    fn registry() -> PackageRegistry {
        PackageRegistry::new(Some(Chip::A1), HostAllocator::new(4096))
    }

    fn standalone_package() -> Vec<u8> {
        PackageBuilder::new("model", Chip::A1)
            .executable(
                ExecutableBuilder::new(ExecutableKind::Standalone, 1)
                    .parameters(vec![1, 2, 3, 4])
                    .scratch_size_bytes(4096)
                    .input_layer(LayerBuilder::new("in", DataType::FixedPoint8, 1, 1, 16))
                    .output_layer(LayerBuilder::new("out", DataType::FixedPoint8, 1, 1, 16))
                    .instruction_chunk(vec![0u8; 32], Vec::new()),
            )
            .build()
    }

    #[test]
    fn register_standalone_package() {
        let registry = registry();
        let reference = registry.register_serialized(&standalone_package()).unwrap();
        assert_eq!(registry.registry_size(), 1);
        assert_eq!(reference.model_identifier(), "model");
        assert!(!reference.parameter_caching_enabled());

        let main = reference.main_executable_reference();
        assert_eq!(main.batch_size(), 1);
        assert!(main.parameters().is_valid());
        assert!(main.scratch().is_valid());
        assert!(!main.parameters_mapped());

        registry.unregister(&reference).unwrap();
        assert_eq!(registry.registry_size(), 0);
    }

    #[test]
    fn chip_mismatch_is_rejected() {
        let registry = PackageRegistry::new(Some(Chip::Other(9)), HostAllocator::new(4096));
        let err = registry.register_serialized(&standalone_package()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn duplicate_kind_is_rejected() {
        let bytes = PackageBuilder::new("dup", Chip::A1)
            .executable(
                ExecutableBuilder::new(ExecutableKind::ParameterCaching, 1)
                    .instruction_chunk(vec![0u8; 8], Vec::new()),
            )
            .executable(
                ExecutableBuilder::new(ExecutableKind::ParameterCaching, 1)
                    .instruction_chunk(vec![0u8; 8], Vec::new()),
            )
            .build();
        let err = registry().register_serialized(&bytes).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn unregister_with_requests_in_flight_is_rejected() {
        let registry = registry();
        let reference = registry.register_serialized(&standalone_package()).unwrap();
        reference.begin_request();
        assert!(registry.unregister(&reference).is_err());
        reference.end_request();
        registry.unregister(&reference).unwrap();
    }

    #[test]
    fn input_validation_enforces_size_window() {
        let registry = registry();
        let reference = registry.register_serialized(&standalone_package()).unwrap();
        let main = reference.main_executable_reference();
        let allocator = HostAllocator::new(64);
        assert!(main.validate_input("in", &allocator.make_buffer(16)).is_ok());
        assert!(main.validate_input("in", &allocator.make_buffer(8)).is_err());
        assert!(main.validate_input("missing", &allocator.make_buffer(16)).is_err());
    }

    #[test]
    fn instruction_pool_caps_returns() {
        let registry = registry();
        let reference = registry.register_serialized(&standalone_package()).unwrap();
        let main = reference.main_executable_reference();
        let allocator = HostAllocator::new(64);
        let taken: Vec<_> = (0..INSTRUCTION_POOL_CAP + 3)
            .map(|_| main.take_instruction_buffers(&allocator))
            .collect();
        for buffers in taken {
            main.return_instruction_buffers(buffers);
        }
        assert_eq!(
            main.instruction_pool.lock().unwrap().len(),
            INSTRUCTION_POOL_CAP
        );
    }

    #[test]
    fn reset_parameters_loaded_clears_only_residency() {
        let registry = registry();
        let reference = registry.register_serialized(&standalone_package()).unwrap();
        let main = reference.main_executable_reference();
        main.set_parameters_loaded();
        assert!(main.parameters_loaded());
        registry.reset_parameters_loaded();
        assert!(!main.parameters_loaded());
    }
}

//! One hardware-sized unit of work.
//!
//! A [`TpuRequest`] covers exactly one hardware batch of inferences (or one
//! parameter-caching run). It owns the per-request resources: staged input
//! copies, staging buffers for outputs, the patched instruction copy and
//! the device mappings, and it walks the state machine
//! `Uninitialized -> Created -> Submitted -> Active -> Done`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axion_api::{Buffer, Error, Result, TpuRequestKind, buffer::NamedBufferMap, error::accumulate};
use axion_pack::{LayerInfo, relayout};
use log::{debug, trace, warn};

use crate::dma::{DmaInfo, DmaInfoExtractor};
use crate::mapper::DeviceBufferMapper;
use crate::memory::dram::DramAllocator;
use crate::memory::host::HostAllocator;
use crate::registry::ExecutableReference;
use crate::request::Request;

/// Completion callback of a sub-request.
pub type TpuDone = Box<dyn FnOnce(i32, Result<()>) + Send>;

/// Lifecycle of a sub-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninitialized,
    Created,
    Submitted,
    Active,
    Done,
}

struct Inner {
    state: State,
    mapper: DeviceBufferMapper,
    instruction_buffers: Option<crate::instruction::InstructionBuffers>,
    host_inputs: NamedBufferMap,
    host_outputs: NamedBufferMap,
    user_outputs: NamedBufferMap,
    batch_outputs: HashMap<String, Buffer>,
    done: Option<TpuDone>,
}

/// A single request to the accelerator.
pub struct TpuRequest {
    id: i32,
    kind: TpuRequestKind,
    parent: Arc<Request>,
    executable: Arc<ExecutableReference>,
    allocator: HostAllocator,
    dram_allocator: Arc<dyn DramAllocator>,
    extractor: DmaInfoExtractor,
    alignment_bytes: usize,
    inner: Mutex<Inner>,
}

impl TpuRequest {
    /// Creates an empty sub-request bound to its parent and executable.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: i32,
        parent: Arc<Request>,
        executable: Arc<ExecutableReference>,
        allocator: HostAllocator,
        dram_allocator: Arc<dyn DramAllocator>,
        mapper: DeviceBufferMapper,
        extractor: DmaInfoExtractor,
        alignment_bytes: usize,
        kind: TpuRequestKind,
    ) -> Self {
        trace!("[{id}] sub-request constructed");
        Self {
            id,
            kind,
            parent,
            executable,
            allocator,
            dram_allocator,
            extractor,
            alignment_bytes,
            inner: Mutex::new(Inner {
                state: State::Uninitialized,
                mapper,
                instruction_buffers: None,
                host_inputs: NamedBufferMap::new(),
                host_outputs: NamedBufferMap::new(),
                user_outputs: NamedBufferMap::new(),
                batch_outputs: HashMap::new(),
                done: None,
            }),
        }
    }

    /// Sub-request id.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Inference or parameter caching.
    pub fn kind(&self) -> TpuRequestKind {
        self.kind
    }

    /// The executable this sub-request runs.
    pub fn executable(&self) -> &Arc<ExecutableReference> {
        &self.executable
    }

    /// Identity of the executable, for timing records.
    pub fn executable_id(&self) -> usize {
        self.executable.id()
    }

    /// Estimated device cycles of this sub-request.
    pub fn estimated_cycles(&self) -> i64 {
        self.executable.estimated_cycles()
    }

    /// Sets the completion callback.
    pub fn set_done(&self, done: TpuDone) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::validate_state(&inner, State::Uninitialized)?;
        inner.done = Some(done);
        Ok(())
    }

    /// Adds one batch element of input for layer `name`.
    ///
    /// The buffer may be staged: scattered for iterative executions, sign
    /// transformed in place, copied to on-device DRAM, or copied for
    /// alignment.
    pub fn add_input(&self, name: &str, user_input: &Buffer) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::validate_state(&inner, State::Uninitialized)?;
        self.executable.validate_input(name, user_input)?;
        trace!(
            "[{}] adding input \"{name}\" with {} bytes",
            self.id,
            user_input.size_bytes()
        );
        let layer = self.executable.input_layer(name)?.clone();
        let mut host_input = user_input.clone();

        // Iterative executions need padding between iterations.
        if layer.execution_count_per_inference > 1
            && host_input.size_bytes() != layer.padded_size_bytes()
        {
            if user_input.is_dram_type() {
                return Err(Error::unimplemented(
                    "DRAM input buffers do not support multiple executions per inference",
                ));
            }
            host_input = self.scatter_input(&host_input, &layer)?;
        }

        if layer.signed_data_type() {
            if user_input.is_dram_type() {
                return Err(Error::unimplemented(
                    "DRAM input buffers do not support signed data types",
                ));
            }
            // SAFETY: host_input is CPU-addressable here (DRAM rejected
            // above) and exclusively staged or caller-owned for the life of
            // the request.
            let bytes = unsafe {
                std::slice::from_raw_parts_mut(host_input.ptr(), host_input.size_bytes())
            };
            relayout::transform_signed(&layer, bytes)?;
        }

        // Stage in on-device DRAM when the compiler asked for it; fall back
        // to host memory if the allocation fails.
        if layer.cache_on_dram && !user_input.is_dram_type() {
            // The DRAM transfer covers the padded size; pad short inputs
            // first so it never reads past the source.
            if host_input.size_bytes() < layer.padded_size_bytes() {
                let padded = self.allocator.make_buffer(layer.padded_size_bytes());
                // SAFETY: both buffers are live; the copy length is the
                // source's size.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        host_input.ptr(),
                        padded.ptr(),
                        host_input.size_bytes(),
                    );
                }
                host_input = padded;
            }
            match self.dram_allocator.allocate_buffer(layer.padded_size_bytes()) {
                Ok(dram) => {
                    // SAFETY: host_input is padded-size, checked above.
                    unsafe { dram.read_from(host_input.ptr())? };
                    host_input = Buffer::from_dram(dram);
                }
                Err(err) => {
                    warn!(
                        "failed to allocate {} bytes of device DRAM: {err}",
                        layer.padded_size_bytes()
                    );
                }
            }
        }

        // The mapper needs alignment; copy unaligned user memory once.
        if host_input.is_ptr_type() && !self.is_buffer_aligned(&host_input) {
            let aligned = self.allocator.make_buffer(layer.padded_size_bytes());
            // SAFETY: both buffers are live; aligned is at least
            // host_input.size_bytes() long (size is within the padded size).
            unsafe {
                std::ptr::copy_nonoverlapping(
                    host_input.ptr(),
                    aligned.ptr(),
                    host_input.size_bytes(),
                );
            }
            host_input = aligned;
        }

        inner.host_inputs.entry(name.to_string()).or_default().push(host_input);
        Ok(())
    }

    /// Adds one batch element of output for layer `name`.
    pub fn add_output(&self, name: &str, output: Buffer) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::validate_state(&inner, State::Uninitialized)?;
        self.executable.validate_output(name, &output)?;
        trace!(
            "[{}] adding output \"{name}\" with {} bytes",
            self.id,
            output.size_bytes()
        );
        let layer = self.executable.output_layer(name)?.clone();

        if output.is_dram_type() && !output.is_managed_type() {
            // Externally-owned on-device DRAM is used directly; there is no
            // opportunity to post-process, so layers needing rework cannot
            // target it.
            if relayout::needs_relayout(&layer) || layer.signed_data_type() {
                return Err(Error::failed_precondition(format!(
                    "output \"{name}\" needs post-processing and cannot target \
                     externally-owned device DRAM"
                )));
            }
            inner
                .host_outputs
                .entry(name.to_string())
                .or_default()
                .push(output.clone());
        } else {
            // Stage into a batch-wide buffer; post-processing synchronizes
            // it with the user's buffer at completion.
            let index = inner.user_outputs.get(name).map_or(0, Vec::len);
            let staged = self
                .batch_output(&mut inner, &layer, name)
                .slice(index * layer.padded_size_bytes(), layer.padded_size_bytes());
            inner
                .host_outputs
                .entry(name.to_string())
                .or_default()
                .push(staged);
        }

        inner.user_outputs.entry(name.to_string()).or_default().push(output);
        Ok(())
    }

    /// Adds `count` no-op input slots to even out a partial hardware batch.
    pub fn add_noop_inputs(&self, name: &str, count: usize) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::validate_state(&inner, State::Uninitialized)?;
        trace!("[{}] adding {count} noop inputs for \"{name}\"", self.id);
        let layer = self.executable.input_layer(name)?.clone();
        let batch_buffer = self.activation_buffer(&layer, count);
        for index in 0..count {
            let slot = batch_buffer.slice(
                index * layer.padded_size_bytes(),
                layer.padded_size_bytes(),
            );
            inner.host_inputs.entry(name.to_string()).or_default().push(slot);
        }
        Ok(())
    }

    /// Adds `count` no-op output slots to even out a partial hardware
    /// batch.
    pub fn add_noop_outputs(&self, name: &str, count: usize) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::validate_state(&inner, State::Uninitialized)?;
        trace!("[{}] adding {count} noop outputs for \"{name}\"", self.id);
        let layer = self.executable.output_layer(name)?.clone();
        let total = self.executable.batch_size();
        let batch_buffer = self.batch_output(&mut inner, &layer, name);
        for index in (total - count)..total {
            let slot = batch_buffer.slice(
                index * layer.padded_size_bytes(),
                layer.padded_size_bytes(),
            );
            inner.host_outputs.entry(name.to_string()).or_default().push(slot);
        }
        Ok(())
    }

    /// Checks the request against the executable's shape: non-empty
    /// instruction stream, all layers populated, every layer filled to the
    /// hardware batch size.
    pub fn validate(&self) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        Self::validate_state(&inner, State::Uninitialized)?;

        let executable = self.executable.executable();
        if executable.instruction_chunks.is_empty() {
            return Err(Error::invalid_argument(
                "executable contains no instruction bitstream",
            ));
        }
        if executable
            .instruction_chunks
            .iter()
            .any(|chunk| chunk.bitstream.is_empty())
        {
            return Err(Error::invalid_argument(
                "executable contains an empty instruction bitstream chunk",
            ));
        }

        if inner.host_inputs.len() != executable.input_layers.len() {
            return Err(Error::invalid_argument(format!(
                "request populates {} input layers, executable has {}",
                inner.host_inputs.len(),
                executable.input_layers.len()
            )));
        }
        if inner.host_outputs.len() != executable.output_layers.len() {
            return Err(Error::invalid_argument(format!(
                "request populates {} output layers, executable has {}",
                inner.host_outputs.len(),
                executable.output_layers.len()
            )));
        }
        let batch = self.executable.batch_size();
        for (name, buffers) in inner.host_inputs.iter().chain(inner.host_outputs.iter()) {
            if buffers.len() != batch {
                return Err(Error::invalid_argument(format!(
                    "layer \"{name}\" holds {} buffers, hardware batch is {batch}",
                    buffers.len()
                )));
            }
        }
        Ok(())
    }

    /// Maps buffers, patches the instruction copy, maps it, and moves to
    /// `Created`.
    ///
    /// Instructions are mapped strictly after patching: the map flushes CPU
    /// caches, so later writes would be invisible to the device.
    pub fn prepare(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::validate_state(&inner, State::Uninitialized)?;

        if inner.instruction_buffers.is_none() {
            inner.instruction_buffers =
                Some(self.executable.take_instruction_buffers(&self.allocator));
        }

        let scratch = self.executable.scratch().clone();
        inner.mapper.map_scratch(&scratch)?;
        let inputs = std::mem::take(&mut inner.host_inputs);
        inner.mapper.map_inputs(&inputs)?;
        inner.host_inputs = inputs;
        let outputs = std::mem::take(&mut inner.host_outputs);
        inner.mapper.map_outputs(&outputs)?;
        inner.host_outputs = outputs;
        trace!("[{}] data buffers mapped", self.id);

        let parameter_buffer = self.executable.parameter_device_buffer();
        let chunks = &self.executable.executable().instruction_chunks;
        let Inner {
            mapper,
            instruction_buffers,
            ..
        } = &mut *inner;
        let instruction_buffers = instruction_buffers.as_mut().unwrap();
        instruction_buffers.link(parameter_buffer, mapper, chunks);

        let buffers: Vec<Buffer> = instruction_buffers.buffers().to_vec();
        if let Err(err) = inner.mapper.map_instructions(&buffers) {
            let mut status = Err(err);
            accumulate(&mut status, inner.mapper.unmap_all());
            return status;
        }
        trace!("[{}] instruction buffers mapped", self.id);

        Self::set_state(&mut inner, self.id, State::Created)
    }

    /// Marks the sub-request submitted to the scheduler.
    pub fn notify_submitted(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::validate_state(&inner, State::Created)?;
        Self::set_state(&mut inner, self.id, State::Submitted)
    }

    /// Marks the sub-request active on the device.
    pub fn notify_active(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::validate_state(&inner, State::Submitted)?;
        Self::set_state(&mut inner, self.id, State::Active)
    }

    /// Completes the sub-request: records timing, unmaps, post-processes
    /// outputs and fires the callback exactly once.
    pub fn notify_completion(&self, status: Result<()>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::validate_state(&inner, State::Active)?;

        // Timing first; cleanup and post-processing below should not count
        // against device execution time.
        self.parent.notify_completion(self.kind);
        debug!("[{}] completed: {status:?}", self.id);

        let mut status = status;
        // Unmap before touching outputs so device-to-host data is coherent.
        accumulate(&mut status, self.cleanup(&mut inner));
        accumulate(&mut status, self.post_process_output_buffers(&mut inner));

        if let Some(done) = inner.done.take() {
            done(self.id, status);
        }
        Self::set_state(&mut inner, self.id, State::Done)
    }

    /// Best-effort cancellation. Submitted or active work fires its
    /// callback with `Cancelled`; a finished request is untouched.
    pub fn cancel(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        debug!("[{}] cancel()", self.id);
        match inner.state {
            State::Uninitialized | State::Created => Err(Error::failed_precondition(
                "cannot cancel before submission",
            )),
            State::Submitted | State::Active => {
                if let Some(done) = inner.done.take() {
                    done(self.id, Err(Error::cancelled("request cancelled")));
                }
                let status = self.cleanup(&mut inner);
                inner.state = State::Done;
                status
            }
            State::Done => Ok(()),
        }
    }

    /// Extracts the ordered DMA plan. Valid once prepared and until the
    /// work goes active.
    pub fn dma_infos(&self) -> Result<Vec<DmaInfo>> {
        let inner = self.inner.lock().unwrap();
        if inner.state != State::Created && inner.state != State::Submitted {
            return Err(Error::failed_precondition(format!(
                "DMA plan requested in state {:?}",
                inner.state
            )));
        }
        self.extractor.extract(
            self.executable.executable(),
            self.executable.parameter_device_buffer(),
            &inner.mapper,
        )
    }

    fn cleanup(&self, inner: &mut Inner) -> Result<()> {
        let status = inner.mapper.unmap_all();
        if let Some(buffers) = inner.instruction_buffers.take() {
            self.executable.return_instruction_buffers(buffers);
        }
        status
    }

    /// Synchronizes staged outputs with the user's buffers: DRAM readback,
    /// re-layout, sign transform.
    fn post_process_output_buffers(&self, inner: &mut Inner) -> Result<()> {
        let Inner {
            host_outputs,
            user_outputs,
            ..
        } = inner;
        for (name, host_buffers) in host_outputs.iter() {
            let Some(user_buffers) = user_outputs.get_mut(name) else {
                return Err(Error::internal(format!(
                    "output layer \"{name}\" missing from user outputs"
                )));
            };
            if host_buffers.len() < user_buffers.len() {
                return Err(Error::internal(format!(
                    "layer \"{name}\": {} user buffers but {} host buffers",
                    user_buffers.len(),
                    host_buffers.len()
                )));
            }
            let layer = self.executable.output_layer(name)?.clone();

            for (host_buffer, user_buffer) in host_buffers.iter().zip(user_buffers.iter_mut()) {
                if user_buffer.is_dram_type() && !user_buffer.is_managed_type() {
                    // The device wrote the user's DRAM directly; nothing to
                    // synchronize (re-layout-free checked at add time).
                    continue;
                }

                let mut staged = host_buffer.clone();
                if staged.is_dram_type() {
                    let dram = staged.dram_buffer()?;
                    staged = self.allocator.make_buffer(layer.padded_size_bytes());
                    // SAFETY: staged was just allocated at padded size.
                    unsafe { dram.write_to(staged.ptr())? };
                }

                // SAFETY: staged is padded-size host memory owned by this
                // request; the user buffer was size-validated at add time.
                unsafe {
                    let src =
                        std::slice::from_raw_parts(staged.ptr(), staged.size_bytes());
                    let dest = std::slice::from_raw_parts_mut(
                        user_buffer.ptr(),
                        user_buffer.size_bytes(),
                    );
                    relayout::relayout(&layer, dest, src)?;
                }

                if layer.signed_data_type() {
                    // SAFETY: same buffer as above.
                    let bytes = unsafe {
                        std::slice::from_raw_parts_mut(
                            user_buffer.ptr(),
                            user_buffer.size_bytes(),
                        )
                    };
                    relayout::transform_signed(&layer, bytes)?;
                }
            }
        }
        Ok(())
    }

    fn scatter_input(&self, input: &Buffer, layer: &LayerInfo) -> Result<Buffer> {
        let aligned = self.allocator.make_buffer(layer.padded_size_bytes());
        // SAFETY: input carries at least actual bytes (validated); aligned
        // is padded-size.
        unsafe {
            let src = std::slice::from_raw_parts(input.ptr(), input.size_bytes());
            let dest =
                std::slice::from_raw_parts_mut(aligned.ptr(), aligned.size_bytes());
            relayout::scatter_input(layer, dest, src)?;
        }
        Ok(aligned)
    }

    fn is_buffer_aligned(&self, buffer: &Buffer) -> bool {
        buffer.ptr() as usize % self.alignment_bytes == 0
    }

    /// Allocates the backing for activation slots: device DRAM when the
    /// layer asks for it and batching permits, host memory otherwise.
    fn activation_buffer(&self, layer: &LayerInfo, batches: usize) -> Buffer {
        if layer.cache_on_dram && batches == 1 {
            match self.dram_allocator.allocate_buffer(layer.padded_size_bytes()) {
                Ok(dram) => return Buffer::from_dram(dram),
                Err(err) => {
                    warn!(
                        "failed to allocate {} bytes of device DRAM: {err}",
                        layer.padded_size_bytes()
                    );
                }
            }
        }
        self.allocator.make_buffer(layer.padded_size_bytes() * batches)
    }

    fn batch_output(&self, inner: &mut Inner, layer: &LayerInfo, name: &str) -> Buffer {
        if let Some(existing) = inner.batch_outputs.get(name) {
            return existing.clone();
        }
        let buffer = self.activation_buffer(layer, self.executable.batch_size());
        inner.batch_outputs.insert(name.to_string(), buffer.clone());
        buffer
    }

    fn validate_state(inner: &Inner, expected: State) -> Result<()> {
        if inner.state != expected {
            return Err(Error::failed_precondition(format!(
                "bad sub-request state: expected {expected:?}, actual {:?}",
                inner.state
            )));
        }
        Ok(())
    }

    fn set_state(inner: &mut Inner, id: i32, next: State) -> Result<()> {
        let legal = matches!(
            (inner.state, next),
            (State::Uninitialized, State::Created)
                | (State::Created, State::Submitted)
                | (State::Submitted, State::Active | State::Done)
                | (State::Active, State::Done)
        );
        if !legal {
            return Err(Error::failed_precondition(format!(
                "invalid sub-request transition {:?} -> {next:?}",
                inner.state
            )));
        }
        trace!("[{id}] state {:?} -> {next:?}", inner.state);
        inner.state = next;
        Ok(())
    }
}

impl Drop for TpuRequest {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        if let Err(err) = self.cleanup(&mut inner) {
            warn!("[{}] cleanup at drop failed: {err}", self.id);
        }
        trace!("[{}] sub-request destroyed", self.id);
    }
}

//! The client-facing driver object.
//!
//! The facade owns the driver state machine (`Closed -> Open -> Closing ->
//! Closed`, reference-counted across clients), the executable registry, the
//! per-priority pending queues with their scheduler worker, parameter
//! residency and caching decisions, the latency-tolerance gate and the
//! watchdog recovery path. Hardware specifics live behind [`Transport`].

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread;

use axion_api::{
    Buffer, ClosingMode, DefaultTelemeter, Error, ExecutionPreference, OperationalSettings,
    Result, Telemeter, Timing, TpuRequestKind,
};
use log::{debug, error, warn};

use crate::blocking::BlockingCounter;
use crate::memory::space::DmaDirection;
use crate::registry::{PackageReference, PackageRegistry};
use crate::request::{Done, Request};
use crate::time::TimeStamper;
use crate::transport::{Transport, TransportHooks};

/// Callback invoked at most once when the device faults fatally.
pub type FatalErrorCallback = Box<dyn Fn(&Error) + Send + Sync>;

/// Callback invoked on thermal warnings.
pub type ThermalWarningCallback = Box<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Closing,
    Closed,
}

struct StateData {
    state: State,
    num_clients: usize,
    debug_mode: bool,
}

struct SubmitState {
    /// Parameter-caching token currently resident on the device. A
    /// submission with a different token invalidates the cache.
    current_parameter_caching_token: u64,
    /// Executable identities whose cached parameters are assumed valid.
    currently_cached: HashSet<usize>,
    operational_settings: OperationalSettings,
    /// Requests waiting to be scheduled, keyed by priority (0 = highest).
    pending_requests: BTreeMap<u32, VecDeque<Arc<Request>>>,
}

#[derive(Default)]
struct SchedulerFlags {
    schedule_more: bool,
    destructing: bool,
}

struct SchedulerSignal {
    flags: Mutex<SchedulerFlags>,
    wakeup: Condvar,
}

struct DriverInner {
    transport: Arc<dyn Transport>,
    registry: PackageRegistry,
    time_stamper: Arc<dyn TimeStamper>,
    max_scheduled_work_ns: i64,
    state: RwLock<StateData>,
    /// Serializes request ordering into the transport. Never acquire
    /// `state` after this lock.
    submit: Mutex<SubmitState>,
    in_error: AtomicBool,
    next_id: AtomicI32,
    fatal_error_callback: Mutex<Option<FatalErrorCallback>>,
    thermal_warning_callback: Mutex<Option<ThermalWarningCallback>>,
    telemeter: Mutex<Arc<dyn Telemeter>>,
    signal: Arc<SchedulerSignal>,
}

/// The driver: registration, submission, cancellation and lifecycle over
/// one accelerator instance.
pub struct Driver {
    inner: Arc<DriverInner>,
    scheduler_thread: Option<thread::JoinHandle<()>>,
}

impl Driver {
    /// Builds a driver over `transport`. The scheduler worker starts
    /// immediately; the device stays closed until [`Driver::open`].
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: PackageRegistry,
        options: &axion_api::DriverOptions,
        time_stamper: Arc<dyn TimeStamper>,
    ) -> Self {
        let signal = Arc::new(SchedulerSignal {
            flags: Mutex::new(SchedulerFlags::default()),
            wakeup: Condvar::new(),
        });
        let inner = Arc::new(DriverInner {
            transport,
            registry,
            time_stamper,
            max_scheduled_work_ns: options.max_scheduled_work_ns,
            state: RwLock::new(StateData {
                state: State::Closed,
                num_clients: 0,
                debug_mode: false,
            }),
            submit: Mutex::new(SubmitState {
                current_parameter_caching_token: 0,
                currently_cached: HashSet::new(),
                operational_settings: options.operational_settings(),
                pending_requests: BTreeMap::new(),
            }),
            in_error: AtomicBool::new(false),
            next_id: AtomicI32::new(0),
            fatal_error_callback: Mutex::new(None),
            thermal_warning_callback: Mutex::new(None),
            telemeter: Mutex::new(Arc::new(DefaultTelemeter)),
            signal: Arc::clone(&signal),
        });

        inner.install_transport_hooks();

        let worker_signal = Arc::clone(&signal);
        let worker_inner = Arc::downgrade(&inner);
        let scheduler_thread = thread::Builder::new()
            .name("axion-scheduler".to_string())
            .spawn(move || scheduler_worker(&worker_signal, &worker_inner))
            .expect("failed to spawn scheduler thread");

        Self {
            inner,
            scheduler_thread: Some(scheduler_thread),
        }
    }

    /// True while the driver is open.
    pub fn is_open(&self) -> bool {
        self.inner.state.read().unwrap().state == State::Open
    }

    /// True once the device faulted fatally.
    pub fn is_error(&self) -> bool {
        self.inner.in_error.load(Ordering::Acquire)
    }

    /// Opens the device. Subsequent opens only count clients; the last
    /// [`Driver::close`] tears down. With `context_lost` the driver forgets
    /// all assumptions about device-resident parameters.
    pub fn open(&self, debug_mode: bool, context_lost: bool) -> Result<()> {
        self.inner.open(debug_mode, context_lost)
    }

    /// Registers a package from its serialized bytes.
    pub fn register_executable_serialized(&self, bytes: &[u8]) -> Result<Arc<PackageReference>> {
        let reference = self.inner.registry.register_serialized(bytes)?;
        self.inner.update_initial_timing(&reference)?;
        Ok(reference)
    }

    /// Registers a package from a file.
    pub fn register_executable_file(&self, path: &std::path::Path) -> Result<Arc<PackageReference>> {
        let reference = self.inner.registry.register_file(path)?;
        self.inner.update_initial_timing(&reference)?;
        Ok(reference)
    }

    /// Unregisters a package. Fails while requests are in flight.
    pub fn unregister_executable(&self, reference: &Arc<PackageReference>) -> Result<()> {
        if self.inner.transport.has_realtime_mode() {
            self.inner
                .transport
                .remove_executable_timing(&reference.main_executable_reference())?;
        }
        self.inner.registry.unregister(reference)
    }

    /// Creates an empty request against a registered package.
    pub fn create_request(&self, reference: &Arc<PackageReference>) -> Arc<Request> {
        Request::new(
            self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            Arc::clone(reference),
            Arc::clone(&self.inner.time_stamper),
        )
    }

    /// Submits a request for asynchronous execution. `done` fires exactly
    /// once with the terminal status.
    pub fn submit(&self, request: Arc<Request>, done: Done) -> Result<()> {
        self.inner.submit(request, done)
    }

    /// Runs one request synchronously.
    pub fn execute(&self, request: Arc<Request>) -> Result<()> {
        let counter = Arc::new(BlockingCounter::new(1));
        let status: Arc<Mutex<Result<()>>> = Arc::new(Mutex::new(Ok(())));
        let counter_in_callback = Arc::clone(&counter);
        let status_in_callback = Arc::clone(&status);
        self.submit(
            request,
            Box::new(move |_id, result| {
                *status_in_callback.lock().unwrap() = result;
                counter_in_callback.decrement();
            }),
        )?;
        counter.wait();
        let status = status.lock().unwrap();
        status.clone()
    }

    /// Runs a batch of requests synchronously, in submission order.
    pub fn execute_batch(&self, requests: &[Arc<Request>]) -> Result<()> {
        let counter = Arc::new(BlockingCounter::new(requests.len()));
        let status: Arc<Mutex<Result<()>>> = Arc::new(Mutex::new(Ok(())));
        for request in requests {
            let counter_in_callback = Arc::clone(&counter);
            let status_in_callback = Arc::clone(&status);
            self.submit(
                Arc::clone(request),
                Box::new(move |_id, result| {
                    let mut status = status_in_callback.lock().unwrap();
                    axion_api::error::accumulate(&mut status, result);
                    counter_in_callback.decrement();
                }),
            )?;
        }
        counter.wait();
        let status = status.lock().unwrap();
        status.clone()
    }

    /// Best-effort cancellation of one request: sub-requests already on the
    /// device finish, the rest complete with `Cancelled`.
    pub fn cancel(&self, request: &Arc<Request>) -> Result<()> {
        let _state = self.inner.state.read().unwrap();
        let mut submit = self.inner.submit.lock().unwrap();
        for queue in submit.pending_requests.values_mut() {
            if let Some(position) = queue.iter().position(|queued| Arc::ptr_eq(queued, request)) {
                queue.remove(position);
                break;
            }
        }
        drop(submit);
        request.cancel_remaining();
        Ok(())
    }

    /// Best-effort cancellation of every pending request.
    pub fn cancel_all_requests(&self) -> Result<()> {
        let _state = self.inner.state.read().unwrap();
        self.inner.cancel_all_pending_requests()
    }

    /// Closes the device for this client; the last close tears down.
    pub fn close(&self, mode: ClosingMode) -> Result<()> {
        self.inner.close(mode)
    }

    /// Allocates a DMA-friendly host buffer. Zero bytes yields an invalid
    /// buffer.
    pub fn make_buffer(&self, size_bytes: usize) -> Buffer {
        self.inner.transport.make_buffer(size_bytes)
    }

    /// Buffer alignment that avoids staging copies on submit.
    pub fn allocation_alignment_bytes(&self) -> usize {
        self.inner.transport.allocation_alignment_bytes()
    }

    /// Enters or leaves real-time scheduling mode.
    pub fn set_realtime_mode(&self, on: bool) -> Result<()> {
        self.inner.transport.set_realtime_mode(on)
    }

    /// Installs real-time requirements for a package.
    pub fn set_executable_timing(
        &self,
        reference: &Arc<PackageReference>,
        timing: &Timing,
    ) -> Result<()> {
        self.inner
            .transport
            .set_executable_timing(&reference.main_executable_reference(), timing)
    }

    /// Records the execution preference of a package. The base driver has
    /// no frequency governor; the preference is accepted and recorded for
    /// platforms that do.
    pub fn set_execution_preference(
        &self,
        reference: &Arc<PackageReference>,
        preference: ExecutionPreference,
    ) -> Result<()> {
        debug!(
            "execution preference for \"{}\": {preference:?}",
            reference.model_identifier()
        );
        Ok(())
    }

    /// Updates clock and bandwidth settings used for scheduling estimates.
    pub fn update_operational_settings(&self, settings: &OperationalSettings) {
        let mut submit = self.inner.submit.lock().unwrap();
        submit.operational_settings = *settings;
    }

    /// Sets the fatal-error callback; it fires at most once per driver
    /// lifetime.
    pub fn set_fatal_error_callback(&self, callback: FatalErrorCallback) {
        *self.inner.fatal_error_callback.lock().unwrap() = Some(callback);
    }

    /// Sets the thermal-warning callback.
    pub fn set_thermal_warning_callback(&self, callback: ThermalWarningCallback) {
        *self.inner.thermal_warning_callback.lock().unwrap() = Some(callback);
    }

    /// Installs the telemetry sink.
    pub fn set_telemeter(&self, telemeter: Arc<dyn Telemeter>) {
        *self.inner.telemeter.lock().unwrap() = telemeter;
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        {
            let mut flags = self.inner.signal.flags.lock().unwrap();
            flags.destructing = true;
            self.inner.signal.wakeup.notify_all();
        }
        if let Some(thread) = self.scheduler_thread.take() {
            let _ = thread.join();
        }
    }
}

impl DriverInner {
    fn install_transport_hooks(self: &Arc<Self>) {
        let completion = Arc::downgrade(self);
        let fatal = Arc::downgrade(self);
        let thermal = Arc::downgrade(self);
        let watchdog = Arc::downgrade(self);
        self.transport.hooks().install(TransportHooks {
            on_request_completion: Box::new(move || {
                if let Some(inner) = completion.upgrade() {
                    inner.handle_tpu_request_completion();
                }
            }),
            on_fatal_error: Box::new(move |error| {
                if let Some(inner) = fatal.upgrade() {
                    inner.notify_fatal_error(&error);
                }
            }),
            on_thermal_warning: Box::new(move || {
                if let Some(inner) = thermal.upgrade() {
                    if let Some(callback) = inner.thermal_warning_callback.lock().unwrap().as_ref()
                    {
                        callback();
                    }
                }
            }),
            on_watchdog_timeout: Box::new(move || {
                if let Some(inner) = watchdog.upgrade() {
                    inner.handle_watchdog_timeout();
                }
            }),
        });
    }

    fn open(&self, debug_mode: bool, context_lost: bool) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if state.num_clients > 0 {
            if context_lost {
                return Err(Error::invalid_argument(
                    "context_lost set while other clients hold the driver open",
                ));
            }
            state.num_clients += 1;
            return Ok(());
        }
        if state.state != State::Closed {
            return Err(Error::failed_precondition(format!(
                "bad driver state: expected Closed, actual {:?}",
                state.state
            )));
        }
        if context_lost {
            self.registry.reset_parameters_loaded();
        }
        state.debug_mode = debug_mode;
        self.transport.open(debug_mode)?;
        state.num_clients = 1;
        state.state = State::Open;
        Ok(())
    }

    fn close(&self, mode: ClosingMode) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if state.num_clients > 1 {
            state.num_clients -= 1;
            return Ok(());
        }
        if state.state != State::Open {
            return Err(Error::failed_precondition(format!(
                "bad driver state: expected Open, actual {:?}",
                state.state
            )));
        }
        state.state = State::Closing;

        // Requests still in the priority queues never reached the
        // transport; fail them before shutting the lower layers down.
        self.cancel_all_pending_requests()?;

        let in_error = self.in_error.load(Ordering::Acquire);
        if mode == ClosingMode::Graceful {
            self.transport.cancel_and_wait_requests(in_error)?;
        }

        // The chip resets below; anything cached on device memory is gone.
        {
            let mut submit = self.submit.lock().unwrap();
            Self::reset_cached_parameters(&mut submit);
        }

        // Parameter mappings must be gone before the transport tears down
        // its address space.
        self.registry.unmap_all_parameters()?;

        self.transport.close(in_error, mode)?;
        state.num_clients = 0;
        state.state = State::Closed;
        Ok(())
    }

    fn submit(&self, request: Arc<Request>, done: Done) -> Result<()> {
        let state = self.state.read().unwrap();
        let mut submit = self.submit.lock().unwrap();
        if state.state != State::Open {
            return Err(Error::unavailable("driver is not open"));
        }
        if self.in_error.load(Ordering::Acquire) {
            return Err(Error::unavailable("device is in an error state"));
        }

        request.set_done(done)?;
        request.prepare()?;
        if let Err(err) = self.check_latency_tolerance(&submit, &request) {
            request.abandon();
            return Err(err);
        }

        if request.priority() == 0 {
            debug!("request [{}]: submitting P0 immediately", request.id());
            let remaining = request.remaining_tpu_requests()?;
            for _ in 0..remaining {
                if let Err(err) = self.submit_inference_request(&mut submit, &request) {
                    // Nothing reached the transport: resolve the request
                    // here; otherwise the submitted subset owns completion.
                    request.abandon();
                    return Err(err);
                }
            }
        } else {
            debug!(
                "request [{}]: queueing at P{}",
                request.id(),
                request.priority()
            );
            submit
                .pending_requests
                .entry(request.priority())
                .or_default()
                .push_back(request);
            self.try_schedule_pending_requests(&mut submit)?;
        }
        Ok(())
    }

    /// Rejects a latency-constrained request the device cannot finish in
    /// time. Only meaningful for P0 requests.
    fn check_latency_tolerance(&self, submit: &SubmitState, request: &Arc<Request>) -> Result<()> {
        let package = request.package_reference();
        let tolerance_ms = package.latency_tolerance_ms();
        if tolerance_ms <= 0 {
            return Ok(());
        }
        if request.priority() > 0 {
            return Err(Error::invalid_argument(
                "latency tolerance is only supported for P0 requests",
            ));
        }

        let mut estimated_cycles = request.remaining_tpu_requests()? as i64
            * request.estimated_cycles_per_inference();
        if self.needs_parameter_caching(submit, request)? {
            if let Some(pc) = package.parameter_caching_reference() {
                estimated_cycles += pc.estimated_cycles();
            }
        }
        estimated_cycles += self.transport.max_remaining_cycles();

        let estimated_time_ms = compute_met_in_ms(
            estimated_cycles,
            submit.operational_settings.tpu_frequency_hz,
        );
        if estimated_time_ms > tolerance_ms {
            return Err(Error::deadline_exceeded(format!(
                "estimated execution time ({estimated_time_ms} ms) exceeds the \
                 {tolerance_ms} ms tolerance"
            )));
        }
        Ok(())
    }

    /// Prepares and submits the next inference sub-request of `request`,
    /// mapping parameters and issuing a parameter-caching run first when
    /// needed.
    fn submit_inference_request(
        &self,
        submit: &mut SubmitState,
        request: &Arc<Request>,
    ) -> Result<()> {
        let package = Arc::clone(request.package_reference());
        if !package.parameters_mapped() {
            debug!("request [{}]: mapping parameters", request.id());
            self.map_parameters(&package)?;
        }

        let main_ref = request.main_executable_reference();
        let token = main_ref.parameter_caching_token();
        if token == 0 || token != submit.current_parameter_caching_token {
            Self::reset_cached_parameters(submit);
        }

        if self.needs_parameter_caching(submit, request)? {
            debug!("request [{}]: parameter caching needed", request.id());
            self.submit_parameter_caching_request(submit, request)?;
        }

        let tpu_request = self.transport.create_tpu_request(
            Arc::clone(request),
            main_ref,
            TpuRequestKind::Inference,
        )?;
        request.prepare_tpu_request(&tpu_request)?;

        // Record submission before handing over; completion must never be
        // observed before its submission timestamp.
        request.notify_submission(TpuRequestKind::Inference);
        self.transport.submit(tpu_request)
    }

    fn needs_parameter_caching(
        &self,
        submit: &SubmitState,
        request: &Arc<Request>,
    ) -> Result<bool> {
        let package = request.package_reference();
        if !package.parameter_caching_enabled() {
            return Ok(false);
        }
        let pc_ref = package
            .parameter_caching_reference()
            .expect("checked parameter_caching_enabled");
        if pc_ref.parameter_caching_token() == 0 {
            return Err(Error::internal("parameter-caching token is not set"));
        }
        Ok(!submit.currently_cached.contains(&pc_ref.id()))
    }

    fn submit_parameter_caching_request(
        &self,
        submit: &mut SubmitState,
        request: &Arc<Request>,
    ) -> Result<()> {
        let package = request.package_reference();
        let pc_ref = package
            .parameter_caching_reference()
            .expect("caller checked parameter_caching_enabled");

        submit.current_parameter_caching_token = pc_ref.parameter_caching_token();
        submit.currently_cached.insert(pc_ref.id());
        pc_ref.set_parameters_loaded();

        let tpu_request = self.transport.create_tpu_request(
            Arc::clone(request),
            &pc_ref,
            TpuRequestKind::ParameterCaching,
        )?;
        // Parameter caching has no user-visible completion of its own.
        tpu_request.set_done(Box::new(|_, _| {}))?;

        request.notify_submission(TpuRequestKind::ParameterCaching);
        self.transport.submit(tpu_request)
    }

    fn map_parameters(&self, package: &Arc<PackageReference>) -> Result<()> {
        for executable in package.all_executable_references() {
            if executable.parameters_mapped() {
                continue;
            }
            let mapped = self
                .transport
                .map_buffer(executable.parameters(), DmaDirection::ToDevice)?;
            debug!(
                "mapped parameters at 0x{:016x} ({} bytes)",
                mapped.device_buffer().device_address(),
                mapped.device_buffer().size_bytes()
            );
            executable.set_mapped_parameters(mapped)?;
        }
        Ok(())
    }

    fn reset_cached_parameters(submit: &mut SubmitState) {
        submit.current_parameter_caching_token = 0;
        submit.currently_cached.clear();
    }

    /// Schedules pending requests, highest priority first, while the cycle
    /// budget allows.
    fn try_schedule_pending_requests(&self, submit: &mut SubmitState) -> Result<()> {
        loop {
            // Find the highest-priority queue with work each round; a
            // completed submission may unblock a higher-priority arrival.
            let Some((&priority, _)) = submit
                .pending_requests
                .iter()
                .find(|(_, queue)| !queue.is_empty())
            else {
                return Ok(());
            };
            let request = submit.pending_requests[&priority]
                .front()
                .cloned()
                .expect("queue checked non-empty");

            if !self.can_schedule_tpu_request(submit, &request)? {
                debug!(
                    "scheduler budget exhausted ({} cycles outstanding)",
                    self.transport.max_remaining_cycles()
                );
                return Ok(());
            }

            self.submit_inference_request(submit, &request)?;
            if request.remaining_tpu_requests()? == 0 {
                debug!("request [{}]: all sub-requests submitted", request.id());
                let queue = submit.pending_requests.get_mut(&priority).unwrap();
                queue.pop_front();
            }
        }
    }

    /// Whether one more sub-request of `request` fits the scheduling
    /// budget. An empty scheduler always admits one sub-request so a
    /// long-running model cannot starve itself.
    fn can_schedule_tpu_request(
        &self,
        submit: &SubmitState,
        request: &Arc<Request>,
    ) -> Result<bool> {
        if request.priority() == 0 {
            return Err(Error::invalid_argument(
                "P0 requests are scheduled immediately, not through the budget",
            ));
        }
        if self.max_scheduled_work_ns < 0 {
            return Ok(true);
        }
        let remaining_cycles = self.transport.max_remaining_cycles();
        if remaining_cycles == 0 {
            return Ok(true);
        }

        let max_cycles_to_schedule = (self.max_scheduled_work_ns as i128
            * submit.operational_settings.tpu_frequency_hz as i128
            / 1_000_000_000) as i64
            - remaining_cycles;

        let mut total_cycles = request.estimated_cycles_per_inference();
        if self.needs_parameter_caching(submit, request)? {
            if let Some(pc) = request.package_reference().parameter_caching_reference() {
                total_cycles += pc.estimated_cycles();
            }
        }
        Ok(max_cycles_to_schedule >= total_cycles)
    }

    fn cancel_all_pending_requests(&self) -> Result<()> {
        let drained: Vec<Arc<Request>> = {
            let mut submit = self.submit.lock().unwrap();
            submit
                .pending_requests
                .values_mut()
                .flat_map(|queue| queue.drain(..))
                .collect()
        };
        for request in drained {
            debug!("request [{}]: cancelled while pending", request.id());
            request.cancel_remaining();
        }
        Ok(())
    }

    /// Wakes the scheduler worker after a sub-request completion.
    fn handle_tpu_request_completion(&self) {
        let mut flags = self.signal.flags.lock().unwrap();
        flags.schedule_more = true;
        self.signal.wakeup.notify_one();
    }

    fn notify_fatal_error(&self, error: &Error) {
        let was_in_error = self.in_error.swap(true, Ordering::AcqRel);
        if was_in_error {
            return;
        }
        error!("device entered error state: {error}");
        if let Some(callback) = self.fatal_error_callback.lock().unwrap().as_ref() {
            callback(error);
        }
    }

    /// Watchdog expiry: log telemetry against the hung request's context,
    /// then reset the device with a hard close and reopen.
    fn handle_watchdog_timeout(&self) {
        error!("watchdog timed out; collecting runtime metrics");
        match self.transport.oldest_active_request() {
            Ok(request) => {
                if let Some(package) = request.executable().package_reference() {
                    let telemeter = Arc::clone(&*self.telemeter.lock().unwrap());
                    package.with_execution_context(|context| {
                        telemeter.log_watchdog_timeout(context);
                    });
                }
            }
            Err(_) => {
                error!("no active request during watchdog timeout; metrics not logged");
            }
        }

        error!("watchdog activated, resetting the device");
        let debug_mode = self.state.read().unwrap().debug_mode;
        if let Err(err) = self.close(ClosingMode::Asap) {
            error!("close after watchdog timeout failed: {err}");
            return;
        }
        if let Err(err) = self.open(debug_mode, false) {
            error!("reopen after watchdog timeout failed: {err}");
        }
    }

    fn update_initial_timing(&self, reference: &Arc<PackageReference>) -> Result<()> {
        let submit = self.submit.lock().unwrap();
        if !self.transport.has_realtime_mode()
            || submit.operational_settings.tpu_frequency_hz <= 0
        {
            return Ok(());
        }
        let main_ref = reference.main_executable_reference();
        if main_ref.estimated_cycles() <= 0 {
            return Ok(());
        }
        // A conservative first guess; measured statistics replace it later.
        let timing = Timing {
            fps: 0,
            max_execution_time_ms: compute_met_in_ms(
                main_ref.estimated_cycles(),
                submit.operational_settings.tpu_frequency_hz,
            ) as i32,
            tolerance_ms: 0,
        };
        drop(submit);
        self.transport.set_executable_timing(&main_ref, &timing)
    }
}

/// Maximum execution time in milliseconds: `ceil(cycles / (freq / 1000))`.
fn compute_met_in_ms(cycles: i64, frequency_hz: i64) -> i64 {
    const KILO: i64 = 1000;
    let frequency_khz = frequency_hz / KILO;
    if cycles > 0 && frequency_khz > 0 {
        1 + (cycles - 1) / frequency_khz
    } else {
        0
    }
}

fn scheduler_worker(signal: &Arc<SchedulerSignal>, inner: &Weak<DriverInner>) {
    loop {
        {
            let mut flags = signal.flags.lock().unwrap();
            while !flags.schedule_more && !flags.destructing {
                flags = signal.wakeup.wait(flags).unwrap();
            }
            if flags.destructing {
                return;
            }
            flags.schedule_more = false;
        }

        let Some(inner) = inner.upgrade() else {
            return;
        };
        let state = inner.state.read().unwrap();
        if state.state != State::Open {
            continue;
        }
        let mut submit = inner.submit.lock().unwrap();
        if let Err(err) = inner.try_schedule_pending_requests(&mut submit) {
            warn!("scheduling pending requests failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn met_computation_takes_the_ceiling() {
        // 1000 cycles at 1 MHz = 1 ms exactly.
        assert_eq!(compute_met_in_ms(1000, 1_000_000), 1);
        // One extra cycle spills into the next millisecond.
        assert_eq!(compute_met_in_ms(1001, 1_000_000), 2);
        assert_eq!(compute_met_in_ms(0, 1_000_000), 0);
        assert_eq!(compute_met_in_ms(1000, 0), 0);
    }
}

//! User-visible inference requests.
//!
//! A [`Request`] may carry an arbitrary batch. At submit time it is broken
//! into hardware-sized sub-requests; the request tracks their completion and
//! fires its callback exactly once, after the last sub-request, with the
//! first failure (if any) as the verdict.
//!
//! The lifecycle is `Initial -> Prepared -> Done`: buffers accumulate in
//! `Initial`; `prepare` freezes and validates them; sub-request completions
//! drive the transition to `Done`.

use std::sync::{Arc, Mutex};

use axion_api::{
    Buffer, Error, RequestTiming, Result, TimingEvent, TimingEventKind, TpuRequestKind,
    buffer::NamedBufferMap,
};
use log::{debug, trace};

use crate::registry::{ExecutableReference, PackageReference};
use crate::time::TimeStamper;
use crate::tpu_request::TpuRequest;

/// Request completion callback: request id and terminal status.
pub type Done = Box<dyn FnOnce(i32, Result<()>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    Prepared,
    Done,
}

struct Inner {
    state: State,
    inputs: NamedBufferMap,
    outputs: NamedBufferMap,
    done: Option<Done>,
    priority: u32,
    /// Batch size of the request; valid once prepared.
    request_batch_size: usize,
    /// Number of sub-requests the request decomposes into.
    required_tpu_requests: usize,
    /// Sub-requests populated so far via `prepare_tpu_request`.
    prepared_tpu_requests: usize,
    /// Sub-requests accounted as finished (completed or cancelled).
    finished_tpu_requests: usize,
    done_status: Result<()>,
    timing: RequestTiming,
}

/// One user inference request.
pub struct Request {
    id: i32,
    package: Arc<PackageReference>,
    main_ref: Arc<ExecutableReference>,
    hardware_batch_size: usize,
    time_stamper: Arc<dyn TimeStamper>,
    inner: Mutex<Inner>,
}

impl Request {
    /// Creates an empty request against a registered package.
    pub fn new(
        id: i32,
        package: Arc<PackageReference>,
        time_stamper: Arc<dyn TimeStamper>,
    ) -> Arc<Self> {
        let main_ref = package.main_executable_reference();
        let hardware_batch_size = main_ref.batch_size();
        let created_ns = time_stamper.now_ns();
        Arc::new(Self {
            id,
            package,
            main_ref,
            hardware_batch_size,
            time_stamper,
            inner: Mutex::new(Inner {
                state: State::Initial,
                inputs: NamedBufferMap::new(),
                outputs: NamedBufferMap::new(),
                done: None,
                priority: 0,
                request_batch_size: 0,
                required_tpu_requests: 0,
                prepared_tpu_requests: 0,
                finished_tpu_requests: 0,
                done_status: Ok(()),
                timing: RequestTiming {
                    created_ns,
                    ..RequestTiming::default()
                },
            }),
        })
    }

    /// Request id.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// The package this request runs against.
    pub fn package_reference(&self) -> &Arc<PackageReference> {
        &self.package
    }

    /// The executable reference running the inference.
    pub fn main_executable_reference(&self) -> &Arc<ExecutableReference> {
        &self.main_ref
    }

    /// Estimated cycles of one inference sub-request.
    pub fn estimated_cycles_per_inference(&self) -> i64 {
        self.main_ref.estimated_cycles()
    }

    /// Appends one batch element of input for layer `name`.
    pub fn add_input(&self, name: &str, input: Buffer) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::validate_state(&inner, State::Initial)?;
        inner.inputs.entry(name.to_string()).or_default().push(input);
        Ok(())
    }

    /// Appends one batch element of output for layer `name`.
    pub fn add_output(&self, name: &str, output: Buffer) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::validate_state(&inner, State::Initial)?;
        inner.outputs.entry(name.to_string()).or_default().push(output);
        Ok(())
    }

    /// Sets the scheduling priority; 0 is highest and the default.
    pub fn set_priority(&self, priority: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::validate_state(&inner, State::Initial)?;
        inner.priority = priority;
        Ok(())
    }

    /// Current scheduling priority.
    pub fn priority(&self) -> u32 {
        self.inner.lock().unwrap().priority
    }

    /// Installs the completion callback.
    pub fn set_done(&self, done: Done) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::validate_state(&inner, State::Initial)?;
        inner.done = Some(done);
        Ok(())
    }

    /// Validates and freezes the request, computing how many sub-requests
    /// it needs. A batch that does not divide into the hardware batch size
    /// is topped up with no-op slots in the final sub-request.
    pub fn prepare(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::validate_state(&inner, State::Initial)?;
        if inner.done.is_none() {
            return Err(Error::failed_precondition(
                "completion callback must be set before prepare",
            ));
        }

        let executable = self.main_ref.executable();
        if inner.inputs.len() != executable.input_layers.len() {
            return Err(Error::invalid_argument(format!(
                "request populates {} input layers, executable has {}",
                inner.inputs.len(),
                executable.input_layers.len()
            )));
        }
        if inner.outputs.len() != executable.output_layers.len() {
            return Err(Error::invalid_argument(format!(
                "request populates {} output layers, executable has {}",
                inner.outputs.len(),
                executable.output_layers.len()
            )));
        }

        let mut batch_size = None;
        for (name, buffers) in inner.inputs.iter() {
            for buffer in buffers {
                self.main_ref.validate_input(name, buffer)?;
            }
            match batch_size {
                None => batch_size = Some(buffers.len()),
                Some(expected) if expected == buffers.len() => {}
                Some(expected) => {
                    return Err(Error::invalid_argument(format!(
                        "input \"{name}\" holds {} buffers, other layers hold {expected}",
                        buffers.len()
                    )));
                }
            }
        }
        for (name, buffers) in inner.outputs.iter() {
            for buffer in buffers {
                self.main_ref.validate_output(name, buffer)?;
            }
            if batch_size != Some(buffers.len()) {
                return Err(Error::invalid_argument(format!(
                    "output \"{name}\" holds {} buffers, inputs hold {:?}",
                    buffers.len(),
                    batch_size
                )));
            }
        }
        let batch_size = batch_size.filter(|&n| n > 0).ok_or_else(|| {
            Error::invalid_argument("request carries no batch elements")
        })?;

        inner.request_batch_size = batch_size;
        inner.required_tpu_requests = batch_size.div_ceil(self.hardware_batch_size);
        inner.state = State::Prepared;
        self.package.begin_request();
        debug!(
            "request [{}]: batch {batch_size} -> {} sub-requests",
            self.id, inner.required_tpu_requests
        );
        Ok(())
    }

    /// Number of sub-requests still to be populated and submitted.
    pub fn remaining_tpu_requests(&self) -> Result<usize> {
        let inner = self.inner.lock().unwrap();
        Self::validate_state(&inner, State::Prepared)?;
        Ok(inner.required_tpu_requests - inner.prepared_tpu_requests)
    }

    /// Populates the next sub-request with its hardware batch's worth of
    /// buffers (padding the last one with no-ops) and wires its completion
    /// into this request's fan-in.
    pub fn prepare_tpu_request(self: &Arc<Self>, tpu_request: &TpuRequest) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::validate_state(&inner, State::Prepared)?;
        if inner.prepared_tpu_requests >= inner.required_tpu_requests {
            return Err(Error::failed_precondition(
                "all sub-requests are already prepared",
            ));
        }

        let start = inner.prepared_tpu_requests * self.hardware_batch_size;
        let end = (start + self.hardware_batch_size).min(inner.request_batch_size);
        let noop_count = start + self.hardware_batch_size - end;
        trace!(
            "request [{}]: sub-request {} covers batch [{start}, {end}) + {noop_count} noops",
            self.id, inner.prepared_tpu_requests
        );

        for (name, buffers) in inner.inputs.iter() {
            for buffer in &buffers[start..end] {
                tpu_request.add_input(name, buffer)?;
            }
            if noop_count > 0 {
                tpu_request.add_noop_inputs(name, noop_count)?;
            }
        }
        for (name, buffers) in inner.outputs.iter() {
            for buffer in &buffers[start..end] {
                tpu_request.add_output(name, buffer.clone())?;
            }
            if noop_count > 0 {
                tpu_request.add_noop_outputs(name, noop_count)?;
            }
        }

        let parent = Arc::clone(self);
        tpu_request.set_done(Box::new(move |_id, status| {
            parent.handle_tpu_requests_done(status, 1);
        }))?;

        inner.prepared_tpu_requests += 1;
        Ok(())
    }

    /// Records that a sub-request was handed to the transport.
    pub fn notify_submission(&self, kind: TpuRequestKind) {
        let now = self.time_stamper.now_ns();
        let mut inner = self.inner.lock().unwrap();
        if inner.timing.submitted_ns == 0 {
            inner.timing.submitted_ns = now;
        }
        inner.timing.detail_events.push(TimingEvent {
            timestamp_ns: now,
            request_kind: kind,
            event_kind: TimingEventKind::Submitted,
        });
    }

    /// Records that a sub-request finished on the device. The last
    /// completion's timestamp wins.
    pub fn notify_completion(&self, kind: TpuRequestKind) {
        let now = self.time_stamper.now_ns();
        let mut inner = self.inner.lock().unwrap();
        inner.timing.completed_ns = now;
        inner.timing.detail_events.push(TimingEvent {
            timestamp_ns: now,
            request_kind: kind,
            event_kind: TimingEventKind::Completed,
        });
    }

    /// Accounts `count` sub-requests as finished with `status`. The first
    /// failure wins; the user callback fires after the last sub-request.
    pub fn handle_tpu_requests_done(&self, status: Result<()>, count: usize) {
        let fire = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == State::Done {
                return;
            }
            if inner.done_status.is_ok() {
                if let Err(err) = status {
                    inner.done_status = Err(err);
                }
            }
            inner.finished_tpu_requests += count;
            if inner.finished_tpu_requests >= inner.required_tpu_requests
                && inner.state == State::Prepared
            {
                inner.state = State::Done;
                Some((inner.done.take(), inner.done_status.clone()))
            } else {
                None
            }
        };
        if let Some((done, status)) = fire {
            self.package.end_request();
            debug!("request [{}]: done: {status:?}", self.id);
            if let Some(done) = done {
                done(self.id, status);
            }
        }
    }

    /// Releases a prepared request that was rejected before any
    /// sub-request reached the transport. The completion callback is
    /// dropped unfired; the caller got the rejection directly.
    pub(crate) fn abandon(&self) {
        let abandoned = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == State::Prepared && inner.prepared_tpu_requests == 0 {
                inner.state = State::Done;
                inner.done = None;
                true
            } else {
                false
            }
        };
        if abandoned {
            self.package.end_request();
        }
    }

    /// Cancels every sub-request not yet handed to the transport. The
    /// already-submitted remainder completes normally; the terminal status
    /// is `Cancelled`.
    pub fn cancel_remaining(&self) {
        let remaining = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != State::Prepared {
                return;
            }
            let remaining = inner.required_tpu_requests - inner.prepared_tpu_requests;
            inner.prepared_tpu_requests = inner.required_tpu_requests;
            remaining
        };
        if remaining == 0 {
            // Everything already went to the device; those sub-requests run
            // to completion.
            return;
        }
        debug!("request [{}]: cancelling {remaining} unsubmitted sub-requests", self.id);
        self.handle_tpu_requests_done(Err(Error::cancelled("request cancelled")), remaining);
    }

    /// Timestamps of this request; available once it completed.
    pub fn timing(&self) -> Result<RequestTiming> {
        let inner = self.inner.lock().unwrap();
        if inner.state != State::Done {
            return Err(Error::failed_precondition(
                "timing is available after completion",
            ));
        }
        Ok(inner.timing.clone())
    }

    fn validate_state(inner: &Inner, expected: State) -> Result<()> {
        if inner.state != expected {
            return Err(Error::failed_precondition(format!(
                "bad request state: expected {expected:?}, actual {:?}",
                inner.state
            )));
        }
        Ok(())
    }
}

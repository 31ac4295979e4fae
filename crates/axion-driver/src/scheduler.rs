//! Single-queue DMA scheduler.
//!
//! Sub-requests become tasks; each task carries its ordered DMA plan. DMAs
//! within one task issue strictly FIFO; fences gate issue across the plan:
//! a local fence waits for all earlier DMAs of its own task, a global fence
//! additionally waits for every older task to finish executing. Transports
//! pull work with [`SingleQueueDmaScheduler::get_next_dma`] and report
//! progress back; the scheduler never calls into a transport.
//!
//! DMAs are addressed by [`DmaToken`] (task sequence number plus index into
//! the task's plan) rather than by reference, so transport callbacks can
//! outlive queue reshuffling without dangling.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use axion_api::{ClosingMode, Error, Result};
use log::{debug, trace};

use crate::device_buffer::DeviceBuffer;
use crate::dma::{DmaInfo, DmaKind};
use crate::tpu_request::TpuRequest;
use crate::watchdog::Watchdog;

/// Stable address of one DMA inside the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaToken {
    task_seq: u64,
    index: usize,
}

/// A DMA handed to a transport for issue.
#[derive(Debug, Clone, Copy)]
pub struct IssuedDma {
    /// Token to report completion with.
    pub token: DmaToken,
    /// Descriptor id within its sub-request, for logging.
    pub id: i32,
    /// What to transfer or mark.
    pub kind: DmaKind,
    /// Device-side buffer; invalid for markers.
    pub buffer: DeviceBuffer,
}

struct Task {
    seq: u64,
    request: Arc<TpuRequest>,
    dmas: Vec<DmaInfo>,
}

impl Task {
    fn all_dmas_completed(&self) -> bool {
        self.dmas.iter().all(DmaInfo::is_completed)
    }
}

#[derive(Default)]
struct SchedulerState {
    is_open: bool,
    next_seq: u64,
    /// Tasks whose DMAs have not been offered to the transport yet.
    pending_tasks: VecDeque<Task>,
    /// Tasks with DMAs offered, still executing on the device.
    active_tasks: VecDeque<Task>,
    /// Tasks whose execution finished but which may have DMA bookkeeping
    /// outstanding.
    completed_tasks: VecDeque<Task>,
    /// Issue cursor over the active tasks' DMA plans.
    pending_dmas: VecDeque<DmaToken>,
}

impl SchedulerState {
    fn find_task_mut(&mut self, seq: u64) -> Option<&mut Task> {
        self.active_tasks
            .iter_mut()
            .chain(self.completed_tasks.iter_mut())
            .find(|task| task.seq == seq)
    }

    fn is_empty(&self) -> bool {
        self.pending_tasks.is_empty()
            && self.active_tasks.is_empty()
            && self.completed_tasks.is_empty()
    }

    /// True when every DMA of every task older than `seq` has completed.
    fn older_tasks_drained(&self, seq: u64) -> bool {
        self.active_tasks
            .iter()
            .chain(self.completed_tasks.iter())
            .filter(|task| task.seq < seq)
            .all(Task::all_dmas_completed)
            && self
                .active_tasks
                .iter()
                .all(|task| task.seq >= seq)
    }
}

/// Thread-safe scheduler serializing all DMA onto one device queue.
pub struct SingleQueueDmaScheduler {
    state: Mutex<SchedulerState>,
    drained: Condvar,
    watchdog: Watchdog,
}

impl SingleQueueDmaScheduler {
    /// Creates a closed scheduler owning `watchdog`.
    pub fn new(watchdog: Watchdog) -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            drained: Condvar::new(),
            watchdog,
        }
    }

    /// Opens the scheduler for submissions.
    pub fn open(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.is_open {
            return Err(Error::failed_precondition("scheduler is already open"));
        }
        *state = SchedulerState {
            is_open: true,
            next_seq: state.next_seq,
            ..SchedulerState::default()
        };
        Ok(())
    }

    /// Submits a prepared sub-request. Its DMA plan is extracted here; the
    /// task queues behind every earlier submission.
    pub fn submit(&self, request: Arc<TpuRequest>) -> Result<()> {
        let dmas = request.dma_infos()?;
        let mut state = self.state.lock().unwrap();
        if !state.is_open {
            return Err(Error::failed_precondition("scheduler is not open"));
        }
        request.notify_submitted()?;
        let seq = state.next_seq;
        state.next_seq += 1;
        trace!(
            "task {seq}: queued request [{}] with {} DMAs",
            request.id(),
            dmas.len()
        );
        state.pending_tasks.push_back(Task {
            seq,
            request,
            dmas,
        });
        Ok(())
    }

    /// Kind of the next DMA the transport would get, or `LocalFence` when
    /// nothing is ready.
    pub fn peek_next_dma(&self) -> DmaKind {
        let state = self.state.lock().unwrap();
        if let Some(token) = state.pending_dmas.front() {
            let seq = token.task_seq;
            let index = token.index;
            if let Some(task) = state
                .active_tasks
                .iter()
                .find(|task| task.seq == seq)
            {
                return task.dmas[index].kind();
            }
        }
        if let Some(task) = state.pending_tasks.front() {
            if let Some(dma) = task.dmas.first() {
                return dma.kind();
            }
        }
        DmaKind::LocalFence
    }

    /// Returns the next issuable DMA, resolving fences on the way. `None`
    /// when nothing can issue right now.
    pub fn get_next_dma(&self) -> Result<Option<IssuedDma>> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.pending_dmas.is_empty() && !self.promote_pending_task(&mut state) {
                return Ok(None);
            }
            let Some(&token) = state.pending_dmas.front() else {
                return Ok(None);
            };

            // Fence resolution needs a queue-wide view before the task is
            // borrowed mutably.
            let (kind, fence_clear) = {
                let task = state
                    .find_task_mut(token.task_seq)
                    .ok_or_else(|| Error::internal("pending DMA references a dropped task"))?;
                let kind = task.dmas[token.index].kind();
                let earlier_done = task.dmas[..token.index]
                    .iter()
                    .all(DmaInfo::is_completed);
                let clear = match kind {
                    DmaKind::LocalFence => earlier_done,
                    DmaKind::GlobalFence => {
                        earlier_done && state.older_tasks_drained(token.task_seq)
                    }
                    _ => true,
                };
                (kind, clear)
            };

            if kind.is_fence() {
                if !fence_clear {
                    return Ok(None);
                }
                let task = state.find_task_mut(token.task_seq).unwrap();
                task.dmas[token.index].mark_completed();
                state.pending_dmas.pop_front();
                continue;
            }

            let task = state.find_task_mut(token.task_seq).unwrap();
            task.dmas[token.index].mark_active();
            let buffer = task.dmas[token.index].buffer();
            let id = task.dmas[token.index].id();
            state.pending_dmas.pop_front();
            return Ok(Some(IssuedDma {
                token,
                id,
                kind,
                buffer,
            }));
        }
    }

    /// Marks an issued DMA complete. The DMA must be in flight.
    pub fn notify_dma_completion(&self, token: DmaToken) -> Result<()> {
        let finished = {
            let mut state = self.state.lock().unwrap();
            let task = state.find_task_mut(token.task_seq).ok_or_else(|| {
                Error::failed_precondition("completion for a DMA of a dropped task")
            })?;
            let dma = &mut task.dmas[token.index];
            if !dma.is_active() {
                return Err(Error::failed_precondition(format!(
                    "completion for DMA {} in state {:?}",
                    dma.id(),
                    dma.state()
                )));
            }
            dma.mark_completed();
            self.take_finished_tasks(&mut state)
        };
        self.finish_tasks(finished);
        Ok(())
    }

    /// Records that the device finished executing the oldest active task.
    /// Completions are serialized in submit order regardless of overlap.
    pub fn notify_request_completion(&self) -> Result<()> {
        let finished = {
            let mut state = self.state.lock().unwrap();
            let task = state.active_tasks.pop_front().ok_or_else(|| {
                Error::internal("execution completion with no active task")
            })?;
            debug!("task {}: execution complete", task.seq);
            state.completed_tasks.push_back(task);
            if state.active_tasks.is_empty() {
                self.watchdog.deactivate();
            }
            self.take_finished_tasks(&mut state)
        };
        self.finish_tasks(finished);
        Ok(())
    }

    /// Cancels every task that has not started DMAing.
    pub fn cancel_pending_requests(&self) -> Result<()> {
        let cancelled: Vec<Task> = {
            let mut state = self.state.lock().unwrap();
            state.pending_tasks.drain(..).collect()
        };
        for task in cancelled {
            debug!("task {}: cancelled while pending", task.seq);
            task.request.cancel()?;
        }
        self.drained.notify_all();
        Ok(())
    }

    /// Blocks until every active and completed task has fully finished.
    pub fn wait_active_requests(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        while !state.active_tasks.is_empty() || !state.completed_tasks.is_empty() {
            state = self.drained.wait(state).unwrap();
        }
        Ok(())
    }

    /// Closes the scheduler. `Graceful` drains active work; `Asap` cancels
    /// it.
    pub fn close(&self, mode: ClosingMode) -> Result<()> {
        self.cancel_pending_requests()?;
        match mode {
            ClosingMode::Graceful => self.wait_active_requests()?,
            ClosingMode::Asap => {
                let dropped: Vec<Task> = {
                    let mut state = self.state.lock().unwrap();
                    state.pending_dmas.clear();
                    let mut dropped: Vec<Task> = state.active_tasks.drain(..).collect();
                    dropped.extend(state.completed_tasks.drain(..));
                    dropped
                };
                self.watchdog.deactivate();
                for task in dropped {
                    debug!("task {}: cancelled at close", task.seq);
                    task.request.cancel()?;
                }
                self.drained.notify_all();
            }
        }
        let mut state = self.state.lock().unwrap();
        if !state.is_open {
            return Err(Error::failed_precondition("scheduler is not open"));
        }
        state.is_open = false;
        Ok(())
    }

    /// True when no task is pending, active or completing.
    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().is_empty()
    }

    /// Upper bound on device cycles of work not yet finished.
    pub fn max_remaining_cycles(&self) -> i64 {
        let state = self.state.lock().unwrap();
        state
            .pending_tasks
            .iter()
            .chain(state.active_tasks.iter())
            .map(|task| task.request.estimated_cycles())
            .sum()
    }

    /// The oldest task still executing on the device.
    pub fn oldest_active_request(&self) -> Result<Arc<TpuRequest>> {
        let state = self.state.lock().unwrap();
        state
            .active_tasks
            .front()
            .map(|task| Arc::clone(&task.request))
            .ok_or_else(|| Error::not_found("no active request"))
    }

    /// Whether the watchdog is currently armed. Test hook for the
    /// armed-iff-active invariant.
    pub fn watchdog_armed(&self) -> bool {
        self.watchdog.is_armed()
    }

    /// Moves the head pending task to the active queue and exposes its
    /// DMAs. Returns false when nothing was pending.
    fn promote_pending_task(&self, state: &mut MutexGuard<'_, SchedulerState>) -> bool {
        let Some(task) = state.pending_tasks.pop_front() else {
            return false;
        };
        if let Err(err) = task.request.notify_active() {
            debug!("task {}: not activatable: {err}", task.seq);
        }
        if state.active_tasks.is_empty() {
            self.watchdog.activate();
        }
        for index in 0..task.dmas.len() {
            state.pending_dmas.push_back(DmaToken {
                task_seq: task.seq,
                index,
            });
        }
        trace!("task {}: activated", task.seq);
        state.active_tasks.push_back(task);
        true
    }

    /// Resolves fences at the head of the issue cursor that have become
    /// satisfied. Fences are not hardware work; without this, a trailing
    /// global fence would hold its task un-drained until the transport next
    /// polled for work.
    fn resolve_ready_fences(&self, state: &mut MutexGuard<'_, SchedulerState>) {
        while let Some(&token) = state.pending_dmas.front() {
            let Some(task) = state
                .active_tasks
                .iter()
                .chain(state.completed_tasks.iter())
                .find(|task| task.seq == token.task_seq)
            else {
                break;
            };
            let kind = task.dmas[token.index].kind();
            let earlier_done = task.dmas[..token.index].iter().all(DmaInfo::is_completed);
            let clear = match kind {
                DmaKind::LocalFence => earlier_done,
                DmaKind::GlobalFence => earlier_done && state.older_tasks_drained(token.task_seq),
                _ => false,
            };
            if !clear {
                break;
            }
            let task = state.find_task_mut(token.task_seq).unwrap();
            task.dmas[token.index].mark_completed();
            state.pending_dmas.pop_front();
        }
    }

    /// Pops completed tasks whose DMA bookkeeping has fully drained, in
    /// submit order.
    fn take_finished_tasks(&self, state: &mut MutexGuard<'_, SchedulerState>) -> Vec<Task> {
        self.resolve_ready_fences(state);
        let mut finished = Vec::new();
        while let Some(task) = state.completed_tasks.front() {
            if !task.all_dmas_completed() {
                break;
            }
            finished.push(state.completed_tasks.pop_front().unwrap());
        }
        finished
    }

    /// Runs completion notification outside the scheduler lock; the user
    /// callback may re-enter the driver.
    fn finish_tasks(&self, finished: Vec<Task>) {
        for task in finished {
            trace!("task {}: fully drained", task.seq);
            if let Err(err) = task.request.notify_completion(Ok(())) {
                debug!("task {}: completion notification failed: {err}", task.seq);
            }
        }
        self.drained.notify_all();
    }
}

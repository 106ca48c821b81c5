//! Loop state and the phase runner.
//!
//! [`LoopShared`] is the single owner of every handle record, the timer
//! index, the completion queues and the pending-close list. All mutation
//! goes through short `RefCell` borrows; user callbacks are always invoked
//! with no borrow held, so a callback may start, stop or close any handle
//! (including its own) and post further completions.

use super::handle::{CloseCallback, HandleKind, HandleRecord, PrimitiveOp, TimerKey};
use super::remote::RemoteQueue;
use super::{LabConfig, RunMode, TimeSource, VirtualClock};
use crate::error::Error;
use crate::tracing_compat::{debug, trace, warn};
use crate::types::{HandleId, Time};
use crate::util::{Arena, DetRng};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

pub(crate) type Completion = Box<dyn FnOnce()>;

/// A completion that becomes ready at a future loop time.
struct Deferred {
    ready_at: Time,
    seq: u64,
    completion: Completion,
}

impl PartialEq for Deferred {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl Eq for Deferred {}

impl PartialOrd for Deferred {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deferred {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap: earliest first, then by sequence for determinism
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct PendingClose {
    id: HandleId,
    kind: HandleKind,
    due_iteration: u64,
    on_close: Option<CloseCallback>,
}

struct InjectedFault {
    kind: HandleKind,
    op: PrimitiveOp,
    error: Error,
}

struct LabState {
    config: LabConfig,
    rng: DetRng,
    clock: Arc<VirtualClock>,
}

#[derive(Default)]
struct LoopCore {
    handles: Arena<HandleRecord>,
    timers: BTreeMap<TimerKey, HandleId>,
    next_timer_seq: u64,
    checks: Vec<HandleId>,
    idles: Vec<HandleId>,
    ready: VecDeque<Completion>,
    deferred: BinaryHeap<Deferred>,
    next_deferred_seq: u64,
    closing: Vec<PendingClose>,
    faults: Vec<InjectedFault>,
    now: Time,
    iteration: u64,
    stop_requested: bool,
    lab: Option<LabState>,
}

impl LoopCore {
    fn markers_mut(&mut self, kind: HandleKind) -> Option<&mut Vec<HandleId>> {
        match kind {
            HandleKind::Check => Some(&mut self.checks),
            HandleKind::Idle => Some(&mut self.idles),
            HandleKind::Timer => None,
        }
    }

    fn deactivate(&mut self, id: HandleId) {
        let Some(record) = self.handles.get_mut(id.arena_index()) else {
            return;
        };
        record.active = false;
        let kind = record.kind;
        if let Some(key) = record.timer_key.take() {
            self.timers.remove(&key);
        }
        if let Some(markers) = self.markers_mut(kind) {
            markers.retain(|m| *m != id);
        }
    }
}

pub(crate) struct LoopShared {
    core: RefCell<LoopCore>,
    clock: Arc<dyn TimeSource>,
    remote: Arc<RemoteQueue>,
}

impl LoopShared {
    pub(crate) fn new(clock: Arc<dyn TimeSource>) -> Self {
        let now = clock.now();
        Self {
            core: RefCell::new(LoopCore {
                now,
                ..LoopCore::default()
            }),
            clock,
            remote: Arc::new(RemoteQueue::new()),
        }
    }

    pub(crate) fn new_lab(config: LabConfig) -> Self {
        let clock = Arc::new(VirtualClock::new());
        let shared = Self::new(clock.clone());
        shared.core.borrow_mut().lab = Some(LabState {
            rng: config.rng(),
            config,
            clock,
        });
        shared
    }

    pub(crate) fn remote_queue(&self) -> &Arc<RemoteQueue> {
        &self.remote
    }

    // ------------------------------------------------------------------
    // Clock
    // ------------------------------------------------------------------

    pub(crate) fn now(&self) -> Time {
        self.core.borrow().now
    }

    pub(crate) fn update_time(&self) {
        let sampled = self.clock.now();
        let mut core = self.core.borrow_mut();
        if sampled > core.now {
            core.now = sampled;
        }
    }

    pub(crate) fn iteration(&self) -> u64 {
        self.core.borrow().iteration
    }

    pub(crate) fn is_lab(&self) -> bool {
        self.core.borrow().lab.is_some()
    }

    pub(crate) fn iteration_limit(&self) -> Option<u64> {
        self.core
            .borrow()
            .lab
            .as_ref()
            .and_then(|lab| lab.config.max_iterations)
    }

    /// Moves virtual time forward without running anything.
    ///
    /// No-op for wall-clock loops.
    pub(crate) fn advance_virtual(&self, to: Time) {
        {
            let core = self.core.borrow();
            let Some(lab) = core.lab.as_ref() else {
                return;
            };
            lab.clock.advance_to(to);
        }
        self.update_time();
    }

    // ------------------------------------------------------------------
    // Handle records
    // ------------------------------------------------------------------

    pub(crate) fn insert_handle(&self, record: HandleRecord) -> HandleId {
        HandleId::from_arena(self.core.borrow_mut().handles.insert(record))
    }

    pub(crate) fn is_open(&self, id: HandleId) -> bool {
        self.core
            .borrow()
            .handles
            .get(id.arena_index())
            .is_some_and(|r| !r.closing)
    }

    pub(crate) fn is_active(&self, id: HandleId) -> bool {
        self.core
            .borrow()
            .handles
            .get(id.arena_index())
            .is_some_and(|r| r.active && !r.closing)
    }

    pub(crate) fn is_referenced(&self, id: HandleId) -> bool {
        self.core
            .borrow()
            .handles
            .get(id.arena_index())
            .is_some_and(|r| r.referenced)
    }

    pub(crate) fn set_referenced(&self, id: HandleId, referenced: bool) {
        if let Some(record) = self.core.borrow_mut().handles.get_mut(id.arena_index()) {
            record.referenced = referenced;
        }
    }

    pub(crate) fn handle_count(&self) -> usize {
        self.core.borrow().handles.len()
    }

    pub(crate) fn pending_closes(&self) -> usize {
        self.core.borrow().closing.len()
    }

    /// Arms (or re-arms) a timer record for `delay_ms` from cached loop time.
    pub(crate) fn arm_timer(&self, id: HandleId, delay_ms: u64) -> Time {
        let mut core = self.core.borrow_mut();
        let core = &mut *core;
        let deadline = core.now.saturating_add_millis(delay_ms);
        let seq = core.next_timer_seq;
        core.next_timer_seq += 1;
        let Some(record) = core.handles.get_mut(id.arena_index()) else {
            return deadline;
        };
        if let Some(old) = record.timer_key.take() {
            core.timers.remove(&old);
        }
        let key = TimerKey { deadline, seq };
        record.timer_key = Some(key);
        record.active = true;
        core.timers.insert(key, id);
        deadline
    }

    pub(crate) fn timer_deadline(&self, id: HandleId) -> Option<Time> {
        self.core
            .borrow()
            .handles
            .get(id.arena_index())
            .and_then(|r| r.timer_key)
            .map(|key| key.deadline)
    }

    pub(crate) fn activate_marker(&self, id: HandleId) {
        let mut core = self.core.borrow_mut();
        let core = &mut *core;
        let Some(record) = core.handles.get_mut(id.arena_index()) else {
            return;
        };
        if record.active {
            return;
        }
        record.active = true;
        let kind = record.kind;
        if let Some(markers) = core.markers_mut(kind) {
            markers.push(id);
        }
    }

    pub(crate) fn deactivate(&self, id: HandleId) {
        self.core.borrow_mut().deactivate(id);
    }

    pub(crate) fn request_close(&self, id: HandleId, on_close: Option<CloseCallback>) {
        let (callback, on_close) = {
            let mut core = self.core.borrow_mut();
            let core = &mut *core;
            let iteration = core.iteration;
            let delay = core.lab.as_mut().map_or(0, |lab| {
                lab.rng
                    .next_below(lab.config.max_close_delay.saturating_add(1))
            });
            match core.handles.get_mut(id.arena_index()) {
                Some(record) if !record.closing => {
                    record.closing = true;
                    let kind = record.kind;
                    let callback = record.callback.take();
                    core.deactivate(id);
                    trace!(handle = %id, kind = %kind, delay, "close requested");
                    core.closing.push(PendingClose {
                        id,
                        kind,
                        due_iteration: iteration.saturating_add(delay),
                        on_close,
                    });
                    (callback, None)
                }
                _ => (None, on_close),
            }
        };
        // Released outside the borrow; dropping either may re-enter the loop.
        drop(callback);
        drop(on_close);
    }

    // ------------------------------------------------------------------
    // Completions and faults
    // ------------------------------------------------------------------

    pub(crate) fn post(&self, completion: Completion) {
        self.core.borrow_mut().ready.push_back(completion);
    }

    pub(crate) fn post_after(&self, after: Duration, completion: Completion) {
        let mut core = self.core.borrow_mut();
        let ready_at = core.now + after;
        let seq = core.next_deferred_seq;
        core.next_deferred_seq += 1;
        core.deferred.push(Deferred {
            ready_at,
            seq,
            completion,
        });
    }

    pub(crate) fn inject_fault(&self, kind: HandleKind, op: PrimitiveOp, error: Error) {
        self.core
            .borrow_mut()
            .faults
            .push(InjectedFault { kind, op, error });
    }

    pub(crate) fn take_fault(&self, kind: HandleKind, op: PrimitiveOp) -> Option<Error> {
        let mut core = self.core.borrow_mut();
        let pos = core
            .faults
            .iter()
            .position(|f| f.kind == kind && f.op == op)?;
        let fault = core.faults.remove(pos);
        debug!(kind = %kind, ?op, error = %fault.error, "injected primitive fault");
        Some(fault.error)
    }

    // ------------------------------------------------------------------
    // Liveness and stop
    // ------------------------------------------------------------------

    pub(crate) fn is_alive(&self) -> bool {
        let core = self.core.borrow();
        core.handles.iter().any(|(_, r)| r.keeps_alive())
            || !core.closing.is_empty()
            || !core.ready.is_empty()
            || !core.deferred.is_empty()
            || !self.remote.is_empty()
    }

    pub(crate) fn request_stop(&self) {
        self.core.borrow_mut().stop_requested = true;
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.core.borrow().stop_requested
    }

    pub(crate) fn clear_stop(&self) {
        self.core.borrow_mut().stop_requested = false;
    }

    // ------------------------------------------------------------------
    // Phases
    // ------------------------------------------------------------------

    /// Runs one full loop iteration and returns the loop time it started at.
    ///
    /// `horizon` caps how far the poll phase may block.
    pub(crate) fn run_iteration(&self, mode: RunMode, horizon: Option<Time>) -> Time {
        self.update_time();
        let started_at = {
            let mut core = self.core.borrow_mut();
            core.iteration += 1;
            trace!(iteration = core.iteration, now = %core.now, "loop iteration");
            core.now
        };
        self.run_timers();
        self.run_markers(HandleKind::Idle);
        let timeout = self.poll_timeout(mode, horizon);
        self.poll(timeout);
        self.run_ready();
        self.run_markers(HandleKind::Check);
        self.run_closing();
        started_at
    }

    fn run_timers(&self) {
        let phase_seq = self.core.borrow().next_timer_seq;
        loop {
            let due = {
                let mut core = self.core.borrow_mut();
                let core = &mut *core;
                let Some((&key, &id)) = core.timers.first_key_value() else {
                    break;
                };
                // Timers armed during this phase wait for the next iteration.
                if key.deadline > core.now || key.seq >= phase_seq {
                    break;
                }
                core.timers.remove(&key);
                if let Some(record) = core.handles.get_mut(id.arena_index()) {
                    record.active = false;
                    record.timer_key = None;
                }
                id
            };
            self.invoke(due);
        }
    }

    fn run_markers(&self, kind: HandleKind) {
        let snapshot = {
            let mut core = self.core.borrow_mut();
            core.markers_mut(kind).cloned().unwrap_or_default()
        };
        for id in snapshot {
            if self.is_active(id) {
                self.invoke(id);
            }
        }
    }

    /// Invokes a handle callback with no borrow held.
    fn invoke(&self, id: HandleId) {
        let taken = self
            .core
            .borrow_mut()
            .handles
            .get_mut(id.arena_index())
            .filter(|r| !r.closing)
            .and_then(|r| r.callback.take());
        let Some(mut callback) = taken else {
            return;
        };
        callback();
        let mut core = self.core.borrow_mut();
        if let Some(record) = core.handles.get_mut(id.arena_index()) {
            if !record.closing && record.callback.is_none() {
                record.callback = Some(callback);
                return;
            }
        }
        drop(core);
        drop(callback);
    }

    fn poll_timeout(&self, mode: RunMode, horizon: Option<Time>) -> Option<Duration> {
        let core = self.core.borrow();
        if mode == RunMode::NoWait
            || core.stop_requested
            || !core.idles.is_empty()
            || !core.closing.is_empty()
            || !core.ready.is_empty()
            || !self.remote.is_empty()
        {
            return Some(Duration::ZERO);
        }
        let next_timer = core.timers.keys().next().map(|key| key.deadline);
        let next_deferred = core.deferred.peek().map(|d| d.ready_at);
        let wake_at = [next_timer, next_deferred, horizon]
            .into_iter()
            .flatten()
            .min()?;
        Some(Duration::from_nanos(wake_at.duration_since(core.now)))
    }

    fn poll(&self, timeout: Option<Duration>) {
        if timeout != Some(Duration::ZERO) {
            let virtual_clock = self
                .core
                .borrow()
                .lab
                .as_ref()
                .map(|lab| lab.clock.clone());
            match virtual_clock {
                Some(clock) => {
                    if let Some(timeout) = timeout {
                        clock.advance_to(self.now() + timeout);
                    }
                }
                None => self.remote.wait(timeout),
            }
            self.update_time();
        }

        let mut core = self.core.borrow_mut();
        let core = &mut *core;
        while let Some(job) = self.remote.pop() {
            core.ready.push_back(job);
        }
        while core.deferred.peek().is_some_and(|d| d.ready_at <= core.now) {
            if let Some(deferred) = core.deferred.pop() {
                core.ready.push_back(deferred.completion);
            }
        }
    }

    fn run_ready(&self) {
        let batch: Vec<Completion> = self.core.borrow_mut().ready.drain(..).collect();
        if !batch.is_empty() {
            trace!(count = batch.len(), "draining completions");
        }
        for completion in batch {
            completion();
        }
    }

    fn run_closing(&self) {
        let due = {
            let mut core = self.core.borrow_mut();
            let core = &mut *core;
            let iteration = core.iteration;
            let (mut due, later): (Vec<_>, Vec<_>) = core
                .closing
                .drain(..)
                .partition(|p| p.due_iteration <= iteration);
            core.closing = later;
            if let Some(lab) = core.lab.as_mut() {
                lab.rng.shuffle(&mut due);
            }
            for pending in &due {
                core.handles.remove(pending.id.arena_index());
            }
            due
        };
        for pending in due {
            trace!(handle = %pending.id, kind = %pending.kind, "close completed");
            if let Some(on_close) = pending.on_close {
                on_close();
            }
        }
    }

    /// Drops every remaining record and queued completion, then runs the
    /// completions of closes that were still pending.
    ///
    /// Everything runs after the borrow is released; callbacks may still try
    /// to reach the loop (and fail with `LoopGone`).
    fn shutdown(&self) {
        let (records, ready, deferred, closing) = {
            let mut core = self.core.borrow_mut();
            core.timers.clear();
            core.checks.clear();
            core.idles.clear();
            (
                core.handles.drain(),
                core.ready.drain(..).collect::<Vec<_>>(),
                core.deferred.drain().collect::<Vec<_>>(),
                core.closing.drain(..).collect::<Vec<_>>(),
            )
        };
        if !closing.is_empty() {
            warn!(
                count = closing.len(),
                "loop dropped with closes still pending, completing them"
            );
        }
        self.remote.close();
        drop(records);
        drop(ready);
        drop(deferred);
        // The handles are gone with the loop: their closes are complete.
        for pending in closing {
            if let Some(on_close) = pending.on_close {
                on_close();
            }
        }
    }
}

impl Drop for LoopShared {
    fn drop(&mut self) {
        self.shutdown();
    }
}

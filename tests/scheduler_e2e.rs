//! End-to-end scheduler scenarios on the lab loop.
//!
//! Each test drives a real `Scheduler` through the loop phases: timer
//! expiry and re-arm, immediates relative to I/O completions, pause and
//! resume, primitive faults and teardown.

#[macro_use]
mod common;

use common::*;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tickslot::error::{CallbackError, Error};
use tickslot::event_loop::{EventLoop, HandleKind, PrimitiveOp, RunMode};
use tickslot::scheduler::{FireKind, Rearm, Scheduler, TeardownState};

fn init_test(test_name: &str) {
    init_test_logging();
    test_phase!(test_name);
}

fn logging_scheduler(event_loop: &EventLoop, log: &EventLog) -> Scheduler {
    let (timer_log, immediate_log, closed_log) = (log.clone(), log.clone(), log.clone());
    let scheduler = Scheduler::builder()
        .on_timer(move |fire| {
            timer_log.push(format!("timer@{}", fire.now().as_millis()));
            Ok(Rearm::Never)
        })
        .on_immediate(move |fire| {
            immediate_log.push(format!("immediate@{}", fire.now().as_millis()));
            Ok(())
        })
        .on_closed(move || closed_log.push("closed"))
        .build(event_loop)
        .unwrap();
    scheduler.ref_handle();
    scheduler
}

// ============================================================================
// Full lifecycle
// ============================================================================

#[test]
fn init_start_fire_immediate_teardown() {
    init_test("init_start_fire_immediate_teardown");
    let event_loop = test_loop();
    let log = EventLog::new();
    let scheduler = logging_scheduler(&event_loop, &log);

    test_section!("timer");
    scheduler.start(100).unwrap();
    event_loop.run_for(Duration::from_millis(100));
    assert_eq!(log.events(), vec!["timer@100"]);
    assert!(!scheduler.is_timer_armed());

    test_section!("immediate");
    scheduler.immediate().unwrap();
    event_loop.run(RunMode::Once);
    assert_eq!(log.events(), vec!["timer@100", "immediate@100"]);
    assert!(!scheduler.is_immediate_pending());

    test_section!("teardown");
    let observer = scheduler.observer();
    drop(scheduler);
    assert_eq!(log.count("closed"), 0);
    event_loop.run(RunMode::Default);
    assert_eq!(log.count("closed"), 1);
    assert!(observer.is_released());
    assert_eq!(event_loop.handle_count(), 0);
    test_complete!("init_start_fire_immediate_teardown");
}

// ============================================================================
// Timer slot
// ============================================================================

#[test]
fn stop_before_expiry_cancels() {
    init_test("stop_before_expiry_cancels");
    let event_loop = test_loop();
    let log = EventLog::new();
    let scheduler = logging_scheduler(&event_loop, &log);

    scheduler.start(50).unwrap();
    event_loop.run_for(Duration::from_millis(20));
    scheduler.stop().unwrap();
    scheduler.stop().unwrap();
    assert!(!event_loop.run(RunMode::Default));
    assert!(log.events().is_empty());
    test_complete!("stop_before_expiry_cancels");
}

#[test]
fn several_pending_requests_collapse_to_minimum() {
    init_test("several_pending_requests_collapse_to_minimum");
    let event_loop = test_loop();
    let times = Rc::new(RefCell::new(Vec::new()));
    let log = times.clone();
    let scheduler = Scheduler::builder()
        .on_timer(move |fire| {
            log.borrow_mut().push(fire.now().as_millis());
            if log.borrow().len() == 1 {
                fire.rearm(40);
                fire.rearm(20);
                fire.rearm(60);
                assert_eq!(fire.pending_rearm(), Some(20));
            }
            Ok(Rearm::Never)
        })
        .build(&event_loop)
        .unwrap();
    scheduler.ref_handle();

    scheduler.start(10).unwrap();
    event_loop.run(RunMode::Default);
    assert_eq!(*times.borrow(), vec![10, 30]);
    test_complete!("several_pending_requests_collapse_to_minimum");
}

#[test]
fn direct_start_from_own_callback_arms_immediately() {
    init_test("direct_start_from_own_callback_arms_immediately");
    let event_loop = test_loop();
    let times = Rc::new(RefCell::new(Vec::new()));
    let slot: Rc<RefCell<Option<Scheduler>>> = Rc::new(RefCell::new(None));

    let log = times.clone();
    let me = slot.clone();
    let scheduler = Scheduler::init(
        &event_loop,
        move |fire| {
            log.borrow_mut().push(fire.now().as_millis());
            if log.borrow().len() < 3 {
                if let Some(scheduler) = me.borrow().as_ref() {
                    scheduler
                        .start(7)
                        .map_err(CallbackError::from_source)?;
                }
            }
            Ok(Rearm::Never)
        },
        |_| Ok(()),
    )
    .unwrap();
    scheduler.ref_handle();
    scheduler.start(1).unwrap();
    *slot.borrow_mut() = Some(scheduler);

    event_loop.run(RunMode::Default);
    assert_eq!(*times.borrow(), vec![1, 8, 15]);
    slot.borrow_mut().take();
    test_complete!("direct_start_from_own_callback_arms_immediately");
}

#[test]
fn failure_retries_once_then_settles() {
    init_test("failure_retries_once_then_settles");
    let event_loop = test_loop();
    let attempts = Rc::new(Cell::new(0_u32));
    let reported = EventLog::new();

    let counter = attempts.clone();
    let sink = reported.clone();
    let scheduler = Scheduler::builder()
        .on_timer(move |_| {
            counter.set(counter.get() + 1);
            if counter.get() == 1 {
                return Err(CallbackError::new("transient"));
            }
            Ok(Rearm::Never)
        })
        .on_callback_error(move |kind, err| sink.push(format!("{kind}: {err}")))
        .build(&event_loop)
        .unwrap();
    scheduler.ref_handle();

    scheduler.start(0).unwrap();
    event_loop.run(RunMode::Default);
    assert_eq!(attempts.get(), 2);
    assert_eq!(reported.events(), vec!["timer: transient"]);
    assert!(!scheduler.is_timer_armed());
    test_complete!("failure_retries_once_then_settles");
}

// ============================================================================
// Immediate
// ============================================================================

#[test]
fn immediate_runs_after_completions_pending_at_call_time() {
    init_test("immediate_runs_after_completions_pending_at_call_time");
    let event_loop = test_loop();
    let log = EventLog::new();
    let scheduler = logging_scheduler(&event_loop, &log);

    let early = log.clone();
    event_loop.post(move || early.push("completion"));
    scheduler.immediate().unwrap();
    scheduler.immediate().unwrap();
    let late = log.clone();
    event_loop.inject_completion(Duration::from_millis(5), move || late.push("late-completion"));

    event_loop.run(RunMode::Default);
    assert_eq!(
        log.events(),
        vec!["completion", "immediate@0", "late-completion"]
    );
    assert_eq!(log.count("immediate@0"), 1);
    test_complete!("immediate_runs_after_completions_pending_at_call_time");
}

#[test]
fn immediate_requested_from_immediate_runs_next_iteration() {
    init_test("immediate_requested_from_immediate_runs_next_iteration");
    let event_loop = test_loop();
    let iterations = Rc::new(RefCell::new(Vec::new()));
    let log = iterations.clone();
    let el = event_loop.clone();
    let scheduler = Scheduler::builder()
        .on_immediate(move |fire| {
            log.borrow_mut().push(el.iteration());
            if log.borrow().len() < 3 {
                fire.immediate().map_err(CallbackError::from_source)?;
            }
            Ok(())
        })
        .build(&event_loop)
        .unwrap();
    scheduler.ref_handle();

    scheduler.immediate().unwrap();
    event_loop.run(RunMode::Default);
    assert_eq!(*iterations.borrow(), vec![1, 2, 3]);
    test_complete!("immediate_requested_from_immediate_runs_next_iteration");
}

#[test]
fn failed_immediate_is_reported_and_not_retried() {
    init_test("failed_immediate_is_reported_and_not_retried");
    let event_loop = test_loop();
    let calls = Rc::new(Cell::new(0_u32));
    let reported = EventLog::new();
    let counter = calls.clone();
    let sink = reported.clone();
    let scheduler = Scheduler::builder()
        .on_immediate(move |_| {
            counter.set(counter.get() + 1);
            Err(CallbackError::new("immediate failed"))
        })
        .on_callback_error(move |kind, _| {
            assert_eq!(kind, FireKind::Immediate);
            sink.push("reported");
        })
        .build(&event_loop)
        .unwrap();
    scheduler.ref_handle();

    scheduler.immediate().unwrap();
    event_loop.run(RunMode::Default);
    assert_eq!(calls.get(), 1);
    assert_eq!(reported.count("reported"), 1);
    assert!(!scheduler.is_immediate_pending());
    test_complete!("failed_immediate_is_reported_and_not_retried");
}

#[test]
fn immediate_primitive_fault_propagates() {
    init_test("immediate_primitive_fault_propagates");
    let event_loop = test_loop();
    let log = EventLog::new();
    let scheduler = logging_scheduler(&event_loop, &log);
    event_loop.inject_fault(
        HandleKind::Check,
        PrimitiveOp::Start,
        Error::primitive("EBUSY", "resource busy or locked"),
    );

    let err = scheduler.immediate().unwrap_err();
    assert_eq!(err.code_name(), "EBUSY");
    assert_eq!(err.description(), "resource busy or locked");
    assert!(!scheduler.is_immediate_pending());

    scheduler.immediate().unwrap();
    event_loop.run(RunMode::Default);
    assert_eq!(log.events(), vec!["immediate@0"]);
    test_complete!("immediate_primitive_fault_propagates");
}

#[test]
fn failed_marker_stop_defers_the_immediate_without_repeating_it() {
    init_test("failed_marker_stop_defers_the_immediate_without_repeating_it");
    let event_loop = test_loop();
    let log = EventLog::new();
    let scheduler = logging_scheduler(&event_loop, &log);
    event_loop.inject_fault(
        HandleKind::Check,
        PrimitiveOp::Stop,
        Error::primitive("EIO", "i/o error"),
    );

    scheduler.immediate().unwrap();
    event_loop.run(RunMode::Once);
    assert!(log.events().is_empty());
    assert!(scheduler.is_immediate_pending());

    event_loop.run(RunMode::Default);
    assert_eq!(log.events(), vec!["immediate@0"]);
    assert!(!scheduler.is_immediate_pending());
    test_complete!("failed_marker_stop_defers_the_immediate_without_repeating_it");
}

// ============================================================================
// Keep-alive
// ============================================================================

#[test]
fn pause_resume_matches_fresh_start() {
    init_test("pause_resume_matches_fresh_start");

    let fresh_loop = test_loop();
    let fresh_log = EventLog::new();
    let fresh = logging_scheduler(&fresh_loop, &fresh_log);
    fresh.start(30).unwrap();
    fresh_loop.run(RunMode::Default);

    let resumed_loop = test_loop();
    let resumed_log = EventLog::new();
    let resumed = logging_scheduler(&resumed_loop, &resumed_log);
    resumed.start(10).unwrap();
    resumed.pause().unwrap();
    assert!(!resumed.is_timer_armed());
    assert!(!resumed.is_referenced());
    resumed.resume(30, true).unwrap();
    resumed_loop.run(RunMode::Default);

    assert_eq!(fresh_log.events(), resumed_log.events());
    assert_eq!(resumed_log.events(), vec!["timer@30"]);
    test_complete!("pause_resume_matches_fresh_start");
}

#[test]
fn unreferenced_scheduler_lets_loop_exit() {
    init_test("unreferenced_scheduler_lets_loop_exit");
    let event_loop = test_loop();
    let log = EventLog::new();
    let scheduler = logging_scheduler(&event_loop, &log);
    scheduler.unref();
    scheduler.unref();
    assert!(!scheduler.is_referenced());

    scheduler.start(10).unwrap();
    scheduler.immediate().unwrap();
    assert!(!event_loop.is_alive());

    scheduler.ref_handle();
    assert!(event_loop.is_alive());
    event_loop.run(RunMode::Default);
    assert_eq!(log.events(), vec!["immediate@0", "timer@10"]);
    test_complete!("unreferenced_scheduler_lets_loop_exit");
}

// ============================================================================
// Cross-thread completions
// ============================================================================

#[test]
fn remote_completion_runs_before_immediate_of_same_iteration() {
    init_test("remote_completion_runs_before_immediate_of_same_iteration");
    let event_loop = test_loop();
    let log = EventLog::new();
    let scheduler = logging_scheduler(&event_loop, &log);

    let hits = Arc::new(AtomicUsize::new(0));
    let remote = event_loop.remote();
    let worker_hits = hits.clone();
    std::thread::spawn(move || {
        remote.post(move || {
            worker_hits.fetch_add(1, Ordering::SeqCst);
        })
    })
    .join()
    .unwrap()
    .unwrap();

    scheduler.immediate().unwrap();
    event_loop.run(RunMode::Once);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(log.events(), vec!["immediate@0"]);
    test_complete!("remote_completion_runs_before_immediate_of_same_iteration");
}

// ============================================================================
// Teardown edge cases
// ============================================================================

#[test]
fn teardown_from_own_timer_callback_does_not_rearm() {
    init_test("teardown_from_own_timer_callback_does_not_rearm");
    let event_loop = test_loop();
    let fires = Rc::new(Cell::new(0_u32));
    let closed = Rc::new(Cell::new(0_u32));
    let slot: Rc<RefCell<Option<Scheduler>>> = Rc::new(RefCell::new(None));

    let counter = fires.clone();
    let me = slot.clone();
    let done = closed.clone();
    let scheduler = Scheduler::builder()
        .on_timer(move |_| {
            counter.set(counter.get() + 1);
            let own = me.borrow_mut().take();
            drop(own);
            Ok(Rearm::After(5))
        })
        .on_closed(move || done.set(done.get() + 1))
        .build(&event_loop)
        .unwrap();
    scheduler.ref_handle();
    let observer = scheduler.observer();
    scheduler.start(5).unwrap();
    *slot.borrow_mut() = Some(scheduler);

    event_loop.run(RunMode::Default);
    assert_eq!(fires.get(), 1);
    assert_eq!(closed.get(), 1);
    assert_eq!(observer.teardown_state(), TeardownState::Closed);
    assert!(observer.is_released());
    test_complete!("teardown_from_own_timer_callback_does_not_rearm");
}

#[test]
fn operations_after_teardown_are_rejected() {
    init_test("operations_after_teardown_are_rejected");
    let event_loop = test_loop();
    let log = EventLog::new();
    let scheduler = logging_scheduler(&event_loop, &log);
    scheduler.teardown();

    for err in [
        scheduler.start(1).unwrap_err(),
        scheduler.stop().unwrap_err(),
        scheduler.pause().unwrap_err(),
        scheduler.resume(1, true).unwrap_err(),
        scheduler.immediate().unwrap_err(),
    ] {
        assert!(err.is_torn_down(), "unexpected error {err}");
        assert_eq!(err.code_name(), "ECANCELED");
    }
    let referenced = scheduler.is_referenced();
    scheduler.unref();
    assert_eq!(scheduler.is_referenced(), referenced);

    event_loop.run(RunMode::Default);
    assert_eq!(scheduler.teardown_state(), TeardownState::Closed);
    assert_eq!(log.events(), vec!["closed"]);
    test_complete!("operations_after_teardown_are_rejected");
}

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::event::{Event, EventKind};
use crate::exec::{ExecContext, Handler, HandlerOutcome};
use crate::instance::{IState, ItemId, ObjectId, ScriptInstance};
use crate::program::{CompiledProgram, ProgramBuilder, ProgramKey};
use crate::sched::Scheduler;
use crate::util::config::EngineConfig;
use crate::value::Value;
use crate::world::NullWorld;

fn test_config() -> EngineConfig {
    EngineConfig {
        num_workers: 2,
        idle_timeout_ms: 10,
        sleep_scan_ms: 5,
        reset_timeout_ms: 1000,
        ..EngineConfig::default()
    }
}

fn scheduler() -> Scheduler {
    Scheduler::new(test_config(), Arc::new(NullWorld))
}

fn instance(program: Arc<CompiledProgram>) -> Arc<ScriptInstance> {
    let inst = Arc::new(ScriptInstance::new(
        ItemId(1),
        ObjectId(2),
        program,
        &test_config(),
    ));
    inst.finish_construct();
    inst
}

/// Poll until `pred` holds or the deadline passes.
fn wait_until(pred: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

struct Nop;

impl Handler for Nop {
    fn step(&self, _cx: &mut ExecContext<'_>) -> HandlerOutcome {
        HandlerOutcome::Completed
    }
}

/// Counts completed invocations.
struct Counting(Arc<AtomicUsize>);

impl Handler for Counting {
    fn step(&self, _cx: &mut ExecContext<'_>) -> HandlerOutcome {
        self.0.fetch_add(1, Ordering::SeqCst);
        HandlerOutcome::Completed
    }
}

/// Checkpoints once mid-handler, then completes on the resume slice.
struct TwoStep(Arc<AtomicUsize>);

impl Handler for TwoStep {
    fn step(&self, cx: &mut ExecContext<'_>) -> HandlerOutcome {
        self.0.fetch_add(1, Ordering::SeqCst);
        let frame = cx.frames.last_mut().unwrap();
        if frame.pc == 0 {
            frame.pc = 1;
            HandlerOutcome::Checkpoint
        } else {
            HandlerOutcome::Completed
        }
    }
}

#[test]
fn posted_event_runs_and_returns_to_idle() {
    let ran = Arc::new(AtomicUsize::new(0));
    let program = ProgramBuilder::new(ProgramKey::from_asset("sched-basic"))
        .handler(
            "default",
            EventKind::TouchStart,
            Arc::new(Counting(ran.clone())),
        )
        .build();

    let sched = scheduler();
    let inst = instance(program);
    let id = sched.admit(inst.clone());

    assert!(sched.post_event(id, Event::bare(EventKind::TouchStart)));
    assert!(wait_until(|| ran.load(Ordering::SeqCst) == 1));
    assert!(wait_until(|| inst.state() == IState::Idle));
    assert_eq!(inst.stats().events_started.load(Ordering::Relaxed), 1);
}

#[test]
fn checkpoint_resumes_through_the_yield_queue() {
    let steps = Arc::new(AtomicUsize::new(0));
    let program = ProgramBuilder::new(ProgramKey::from_asset("sched-checkpoint"))
        .handler(
            "default",
            EventKind::TouchStart,
            Arc::new(TwoStep(steps.clone())),
        )
        .build();

    let sched = scheduler();
    let inst = instance(program);
    let id = sched.admit(inst.clone());

    sched.post_event(id, Event::bare(EventKind::TouchStart));
    assert!(wait_until(|| steps.load(Ordering::SeqCst) == 2));
    assert!(wait_until(|| inst.state() == IState::Idle));
    // One event, two slices.
    assert_eq!(inst.stats().events_started.load(Ordering::Relaxed), 1);
    assert!(inst.stats().slices.load(Ordering::Relaxed) >= 2);
}

/// Sleeps once, then completes when the timer thread refiles it.
struct SleepOnce(Arc<AtomicUsize>);

impl Handler for SleepOnce {
    fn step(&self, cx: &mut ExecContext<'_>) -> HandlerOutcome {
        let frame = cx.frames.last_mut().unwrap();
        if frame.pc == 0 {
            frame.pc = 1;
            HandlerOutcome::Sleep(Duration::from_millis(20))
        } else {
            self.0.fetch_add(1, Ordering::SeqCst);
            HandlerOutcome::Completed
        }
    }
}

#[test]
fn sleeping_instance_is_woken_by_the_timer() {
    let done = Arc::new(AtomicUsize::new(0));
    let program = ProgramBuilder::new(ProgramKey::from_asset("sched-sleep"))
        .handler(
            "default",
            EventKind::TouchStart,
            Arc::new(SleepOnce(done.clone())),
        )
        .build();

    let sched = scheduler();
    let inst = instance(program);
    let id = sched.admit(inst.clone());

    sched.post_event(id, Event::bare(EventKind::TouchStart));
    assert!(wait_until(|| done.load(Ordering::SeqCst) == 1));
    assert!(wait_until(|| inst.state() == IState::Idle));
    assert!(sched.stats().sleep_wakes.load(Ordering::Relaxed) >= 1);
}

#[test]
fn global_suspend_holds_work_until_resume() {
    let ran = Arc::new(AtomicUsize::new(0));
    let program = ProgramBuilder::new(ProgramKey::from_asset("sched-suspend"))
        .handler(
            "default",
            EventKind::TouchStart,
            Arc::new(Counting(ran.clone())),
        )
        .build();

    let sched = scheduler();
    let inst = instance(program);
    let id = sched.admit(inst);

    sched.suspend_all();
    sched.post_event(id, Event::bare(EventKind::TouchStart));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    sched.resume_all();
    assert!(wait_until(|| ran.load(Ordering::SeqCst) == 1));
}

#[test]
fn run_admin_executes_on_a_worker() {
    let sched = scheduler();
    let value = sched.run_admin(|| 40 + 2);
    assert_eq!(value, 42);
}

#[test]
fn reset_rebuilds_and_reruns_state_entry() {
    let entries = Arc::new(AtomicUsize::new(0));
    let program = ProgramBuilder::new(ProgramKey::from_asset("sched-reset"))
        .handler(
            "default",
            EventKind::StateEntry,
            Arc::new(Counting(entries.clone())),
        )
        .handler("default", EventKind::TouchStart, Arc::new(Nop))
        .build();

    let sched = scheduler();
    let inst = instance(program);
    let id = sched.admit(inst.clone());

    sched.post_event(id, Event::bare(EventKind::StateEntry));
    assert!(wait_until(|| entries.load(Ordering::SeqCst) == 1));
    assert!(wait_until(|| inst.state() == IState::Idle));

    sched.reset(id).unwrap();
    // The reset queues a fresh state_entry and kicks the instance.
    assert!(wait_until(|| entries.load(Ordering::SeqCst) == 2));
    assert!(wait_until(|| inst.state() == IState::Idle));
    assert!(inst.exec().permissions.is_none());
}

#[test]
fn reset_of_never_run_instance_is_idempotent() {
    let program = ProgramBuilder::new(ProgramKey::from_asset("sched-reset-fresh"))
        .handler("default", EventKind::StateEntry, Arc::new(Nop))
        .build();

    let sched = scheduler();
    sched.suspend_all();
    let inst = instance(program);
    let id = sched.admit(inst.clone());

    for _ in 0..2 {
        sched.reset(id).unwrap();
        let ctl = inst.ctl();
        let pending = ctl.queue.snapshot();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, EventKind::StateEntry);
        drop(ctl);
        assert!(inst.exec().init_globals_pending);
    }
}

/// Requests a self-reset on the first invocation only.
struct ResetOnce(Arc<AtomicBool>);

impl Handler for ResetOnce {
    fn step(&self, _cx: &mut ExecContext<'_>) -> HandlerOutcome {
        if self.0.swap(false, Ordering::SeqCst) {
            HandlerOutcome::SelfReset
        } else {
            HandlerOutcome::Completed
        }
    }
}

#[test]
fn self_reset_rebuilds_and_runs_fresh_state_entry() {
    let armed = Arc::new(AtomicBool::new(true));
    let entries = Arc::new(AtomicUsize::new(0));
    let program = ProgramBuilder::new(ProgramKey::from_asset("sched-self-reset"))
        .handler(
            "default",
            EventKind::StateEntry,
            Arc::new(Counting(entries.clone())),
        )
        .handler(
            "default",
            EventKind::TouchStart,
            Arc::new(ResetOnce(armed.clone())),
        )
        .build();

    let sched = scheduler();
    let inst = instance(program);
    let id = sched.admit(inst.clone());

    sched.post_event(id, Event::bare(EventKind::TouchStart));
    assert!(wait_until(|| entries.load(Ordering::SeqCst) == 1));
    assert!(wait_until(|| inst.state() == IState::Idle));
    assert!(!armed.load(Ordering::SeqCst));
    assert!(!inst.exec().init_globals_pending);
}

/// Always faults.
struct Faulty;

impl Handler for Faulty {
    fn step(&self, _cx: &mut ExecContext<'_>) -> HandlerOutcome {
        HandlerOutcome::Fault(crate::error::RuntimeFault::DivisionByZero)
    }
}

#[test]
fn faulting_instance_parks_until_reset() {
    let program = ProgramBuilder::new(ProgramKey::from_asset("sched-fault"))
        .handler("default", EventKind::TouchStart, Arc::new(Faulty))
        .build();

    let sched = scheduler();
    let inst = instance(program);
    let id = sched.admit(inst.clone());

    sched.post_event(id, Event::bare(EventKind::TouchStart));
    assert!(wait_until(|| inst.state() == IState::Suspended));
    assert_eq!(inst.stats().faults.load(Ordering::Relaxed), 1);

    // Further posts queue but nothing runs while parked.
    sched.post_event(id, Event::bare(EventKind::TouchStart));
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(inst.state(), IState::Suspended);

    // A reset clears the park; the flushed queue leaves it Idle after the
    // fresh state_entry (which this program does not handle).
    sched.reset(id).unwrap();
    assert!(wait_until(|| inst.state() == IState::Idle));
    assert_eq!(inst.stats().faults.load(Ordering::Relaxed), 1);
}

#[test]
fn dispose_removes_the_instance() {
    let program = ProgramBuilder::new(ProgramKey::from_asset("sched-dispose"))
        .handler("default", EventKind::TouchStart, Arc::new(Nop))
        .build();

    let sched = scheduler();
    let inst = instance(program);
    let id = sched.admit(inst.clone());
    assert!(sched.instance(id).is_some());

    sched.dispose(id);
    assert!(sched.instance(id).is_none());
    assert_eq!(inst.state(), IState::Disposed);
    assert!(!sched.post_event(id, Event::bare(EventKind::TouchStart)));
}

#[test]
fn detach_handler_completes_before_wait_returns() {
    let program = ProgramBuilder::new(ProgramKey::from_asset("sched-detach"))
        .handler("default", EventKind::Attach, Arc::new(Nop))
        .build();

    let sched = scheduler();
    let inst = instance(program);
    let id = sched.admit(inst.clone());

    assert!(sched.post_event(
        id,
        Event::new(EventKind::Attach, [Value::Key(String::new())])
    ));
    assert!(inst.wait_detach_done(Duration::from_secs(5)));
}

#[test]
fn dump_lists_admitted_instances() {
    let program = ProgramBuilder::new(ProgramKey::from_asset("sched-dump"))
        .handler("default", EventKind::TouchStart, Arc::new(Nop))
        .build();

    let sched = scheduler();
    sched.admit(instance(program));
    let dump = sched.dump();
    assert!(dump.contains("inst#0"));
    assert!(dump.contains("state="));
}

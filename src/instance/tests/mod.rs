use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::event::{Event, EventKind};
use crate::exec::{ExecContext, Handler, HandlerOutcome};
use crate::instance::{
    IState, ItemId, ObjectId, PostDisposition, RejectReason, ScriptInstance,
};
use crate::program::{CompiledProgram, ProgramBuilder, ProgramKey};
use crate::util::config::EngineConfig;
use crate::value::Value;

struct Nop;

impl Handler for Nop {
    fn step(&self, _cx: &mut ExecContext<'_>) -> HandlerOutcome {
        HandlerOutcome::Completed
    }
}

fn program() -> Arc<CompiledProgram> {
    ProgramBuilder::new(ProgramKey::from_asset("instance-test"))
        .handler("default", EventKind::StateEntry, Arc::new(Nop))
        .handler("default", EventKind::TouchStart, Arc::new(Nop))
        .handler("default", EventKind::Timer, Arc::new(Nop))
        .handler("default", EventKind::Attach, Arc::new(Nop))
        .handler("default", EventKind::Listen, Arc::new(Nop))
        .build()
}

fn instance() -> ScriptInstance {
    let inst = ScriptInstance::new(
        ItemId(1),
        ObjectId(2),
        program(),
        &EngineConfig::default(),
    );
    inst.finish_construct();
    inst
}

fn detach() -> Event {
    Event::new(EventKind::Attach, [Value::Key(String::new())])
}

#[test]
fn first_post_claims_start_queue() {
    let inst = instance();
    assert_eq!(inst.state(), IState::Idle);

    let now = Instant::now();
    assert_eq!(
        inst.post_event(Event::bare(EventKind::TouchStart), now),
        PostDisposition::NeedsStart
    );
    assert_eq!(inst.state(), IState::OnStartQueue);

    // Already claimed; further posts just queue.
    assert_eq!(
        inst.post_event(Event::bare(EventKind::Listen), now),
        PostDisposition::Queued
    );
}

#[test]
fn unhandled_kinds_are_rejected_silently() {
    let inst = instance();
    assert_eq!(
        inst.post_event(Event::bare(EventKind::Sensor), Instant::now()),
        PostDisposition::Rejected(RejectReason::NoHandler)
    );
    assert!(inst.ctl().queue.is_empty());
}

#[test]
fn disabled_instance_rejects_but_state_entry_unsticks() {
    let inst = instance();
    inst.set_running(false);

    let now = Instant::now();
    assert_eq!(
        inst.post_event(Event::bare(EventKind::TouchStart), now),
        PostDisposition::Rejected(RejectReason::NotAccepting)
    );

    // state_entry onto an empty queue is the one exception; it is what
    // lets a re-enabled script run its first handler.
    assert!(matches!(
        inst.post_event(Event::bare(EventKind::StateEntry), now),
        PostDisposition::NeedsStart | PostDisposition::Queued
    ));
    assert_eq!(inst.ctl().queue.len(), 1);

    assert_eq!(
        inst.post_event(Event::bare(EventKind::StateEntry), now),
        PostDisposition::Rejected(RejectReason::NotAccepting)
    );
}

#[test]
fn disabling_flushes_the_queue() {
    let inst = instance();
    inst.post_event(Event::bare(EventKind::TouchStart), Instant::now());
    inst.post_event(Event::bare(EventKind::Listen), Instant::now());
    assert_eq!(inst.ctl().queue.len(), 2);

    inst.set_running(false);
    assert!(inst.ctl().queue.is_empty());
    assert!(!inst.running());
}

#[test]
fn throttle_applies_across_posts() {
    let inst = instance();
    inst.set_min_event_delay(Duration::from_millis(500));

    let now = Instant::now();
    assert_eq!(
        inst.post_event(Event::bare(EventKind::TouchStart), now),
        PostDisposition::NeedsStart
    );
    assert_eq!(
        inst.post_event(
            Event::bare(EventKind::TouchStart),
            now + Duration::from_millis(50)
        ),
        PostDisposition::Rejected(RejectReason::Throttled)
    );
    assert_eq!(
        inst.post_event(
            Event::bare(EventKind::TouchStart),
            now + Duration::from_millis(600)
        ),
        PostDisposition::Queued
    );
}

#[test]
fn timer_cap_rejects_second_pending_timer() {
    let inst = instance();
    let now = Instant::now();
    inst.post_event(Event::bare(EventKind::Timer), now);
    assert_eq!(
        inst.post_event(Event::bare(EventKind::Timer), now),
        PostDisposition::Rejected(RejectReason::CapExceeded)
    );
}

#[test]
fn detach_post_arms_quantum_and_jumps_queue() {
    let inst = instance();
    let now = Instant::now();
    inst.post_event(Event::bare(EventKind::TouchStart), now);
    inst.post_event(detach(), now);

    let ctl = inst.ctl();
    assert_eq!(
        ctl.detach_quantum,
        Some(EngineConfig::default().detach_quantum)
    );
    assert!(!ctl.detach_done);
    assert!(ctl.queue.peek().unwrap().is_detach());
}

#[test]
fn detach_wakes_a_sleeper_regardless_of_mask() {
    let inst = instance();
    {
        let mut ctl = inst.ctl();
        ctl.state = IState::OnSleepQueue;
        ctl.sleep_until = Some(Instant::now() + Duration::from_secs(60));
    }

    assert_eq!(
        inst.post_event(detach(), Instant::now()),
        PostDisposition::WakeFromSleep
    );
    let ctl = inst.ctl();
    assert_eq!(ctl.state, IState::RemovedFromSleep);
    assert!(ctl.sleep_until.is_none());
}

#[test]
fn wake_mask_controls_sleep_cancellation() {
    let inst = instance();
    inst.set_wake_mask([EventKind::Listen]);
    {
        let mut ctl = inst.ctl();
        ctl.state = IState::OnSleepQueue;
        ctl.sleep_until = Some(Instant::now() + Duration::from_secs(60));
    }

    let now = Instant::now();
    assert_eq!(
        inst.post_event(Event::bare(EventKind::TouchStart), now),
        PostDisposition::Queued
    );
    assert_eq!(inst.state(), IState::OnSleepQueue);

    assert_eq!(
        inst.post_event(Event::bare(EventKind::Listen), now),
        PostDisposition::WakeFromSleep
    );
    assert_eq!(inst.state(), IState::RemovedFromSleep);
}

#[test]
fn suspended_instance_queues_without_start_claim() {
    let inst = instance();
    inst.suspend();

    assert_eq!(
        inst.post_event(Event::bare(EventKind::TouchStart), Instant::now()),
        PostDisposition::Queued
    );
    assert_eq!(inst.state(), IState::Idle);
}

#[test]
fn resume_refiles_only_with_pending_work() {
    let inst = instance();
    inst.suspend();
    {
        inst.ctl().state = IState::Suspended;
    }
    // No queued work: back to Idle, no refile.
    assert!(!inst.resume());
    assert_eq!(inst.state(), IState::Idle);

    inst.suspend();
    inst.post_event(Event::bare(EventKind::TouchStart), Instant::now());
    {
        inst.ctl().state = IState::Suspended;
    }
    assert!(inst.resume());
    assert_eq!(inst.state(), IState::OnStartQueue);
}

#[test]
fn stacked_suspends_require_matching_resumes() {
    let inst = instance();
    inst.suspend();
    inst.suspend();
    inst.post_event(Event::bare(EventKind::TouchStart), Instant::now());
    {
        inst.ctl().state = IState::Suspended;
    }

    assert!(!inst.resume());
    assert_eq!(inst.state(), IState::Suspended);
    assert!(inst.resume());
    assert_eq!(inst.state(), IState::OnStartQueue);
}

#[test]
fn complete_reset_rebuilds_never_run_state() {
    let inst = instance();
    inst.post_event(Event::bare(EventKind::TouchStart), Instant::now());
    {
        let mut exec = inst.exec();
        exec.state_name = "armed".to_owned();
        exec.init_globals_pending = false;
    }
    {
        let mut ctl = inst.ctl();
        ctl.state = IState::Resetting;
        ctl.suspend_count = 2;
    }

    inst.complete_reset();

    assert_eq!(inst.state(), IState::Idle);
    let exec = inst.exec();
    assert_eq!(exec.state_name, "default");
    assert!(exec.init_globals_pending);
    assert!(exec.permissions.is_none());
    drop(exec);

    let ctl = inst.ctl();
    assert_eq!(ctl.suspend_count, 0);
    assert!(ctl.running);
    let pending = ctl.queue.snapshot();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, EventKind::StateEntry);
}

#[test]
fn disposed_instance_rejects_everything() {
    let inst = instance();
    inst.post_event(Event::bare(EventKind::TouchStart), Instant::now());
    inst.dispose();

    assert_eq!(inst.state(), IState::Disposed);
    assert!(inst.ctl().queue.is_empty());
    assert_eq!(
        inst.post_event(Event::bare(EventKind::TouchStart), Instant::now()),
        PostDisposition::Rejected(RejectReason::NotAccepting)
    );
    // Dispose is idempotent.
    inst.dispose();
    assert_eq!(inst.state(), IState::Disposed);
}

#[test]
fn wait_detach_done_times_out_until_signalled() {
    let inst = instance();
    inst.post_event(detach(), Instant::now());
    assert!(!inst.wait_detach_done(Duration::from_millis(10)));

    {
        let mut ctl = inst.ctl();
        inst.signal_detach_done(&mut ctl);
    }
    assert!(inst.wait_detach_done(Duration::from_millis(10)));
}

#[test]
fn handled_kinds_follow_the_current_state() {
    let inst = instance();
    let kinds = inst.handled_kinds();
    assert!(kinds.contains(&EventKind::TouchStart));
    assert!(!kinds.contains(&EventKind::Sensor));

    inst.exec().state_name = "armed".to_owned();
    assert!(inst.handled_kinds().is_empty());
}

#[test]
fn cancel_event_retracts_queued_kind() {
    let inst = instance();
    let now = Instant::now();
    inst.post_event(Event::bare(EventKind::Listen), now);
    inst.post_event(Event::bare(EventKind::TouchStart), now);
    inst.post_event(Event::bare(EventKind::Listen), now);

    assert_eq!(inst.cancel_event(EventKind::Listen), 2);
    assert_eq!(inst.ctl().queue.len(), 1);
}

//! Run engine
//!
//! Executes one instance for a bounded slice: dequeues an event or resumes
//! an in-progress one, drives the handler until it completes or calls back
//! for a checkpoint, and reports the instance's next lifecycle state.
//!
//! Terminal requests and faults come back as an outcome enum rather than
//! unwinding through the suspend/resume boundary.

pub mod frames;

pub use frames::Frame;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::error::{RuntimeFault, OWNER_PREFIX};
use crate::event::{Event, EventKind};
use crate::instance::{IState, ScriptInstance};
use crate::value::Globals;
use crate::world::WorldServices;

/// Everything a handler step may touch.
pub struct ExecContext<'a> {
    /// Resumable frame stack; the top frame's `pc` is where execution
    /// resumes.
    pub frames: &'a mut Vec<Frame>,
    /// Instance globals.
    pub globals: &'a mut Globals,
    /// The event being handled.
    pub event: &'a Event,
    /// Current named script state.
    pub state_name: &'a str,
    /// Set on the `state_entry` that must (re)initialize declared globals.
    pub init_globals: bool,
}

/// How a handler slice ended.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    /// Event cycle complete.
    Completed,
    /// Voluntary checkpoint; frames stay captured, reschedule promptly.
    Checkpoint,
    /// Script-requested sleep; frames stay captured.
    Sleep(Duration),
    /// Script asked to reset itself.
    SelfReset,
    /// Script asked to be removed from its host.
    SelfDelete,
    /// Script asked for the host object to be destroyed.
    Die,
    /// Classified runtime fault.
    Fault(RuntimeFault),
}

/// A compiled event handler: a resumable step function.
pub trait Handler: Send + Sync {
    /// Drive the handler from the captured point until it completes,
    /// faults, or requests a suspension.
    fn step(&self, cx: &mut ExecContext<'_>) -> HandlerOutcome;
}

/// Next lifecycle state reported by [`run_one`], routed by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextState {
    /// Refile onto the Start queue.
    OnStartQueue,
    /// Refile onto the Yield queue (also used as "retry shortly" when the
    /// run lock is contended).
    OnYieldQueue,
    /// Park on the Sleep queue until `sleep_until`.
    OnSleepQueue,
    /// Off all queues until externally resumed.
    Suspended,
    /// Slice over; back to Idle, or straight to Start if events arrived.
    Finished,
    /// Route through the reset state machine, then refile.
    ResetRequest,
    /// Drop permanently.
    Disposed,
}

/// Execute one slice of `inst`.
///
/// Exactly one worker runs an instance at a time; if the run lock is held
/// (a migration may be capturing state), this schedules a short retry
/// instead of blocking the worker.
pub fn run_one(inst: &ScriptInstance, world: &dyn WorldServices) -> NextState {
    let Some(mut exec) = inst.try_exec() else {
        return NextState::OnYieldQueue;
    };

    let now = Instant::now();

    // Admission of this slice, under the queue lock.
    let event = {
        let mut ctl = inst.ctl();
        match ctl.state {
            IState::Disposed => return NextState::Disposed,
            IState::Resetting => return NextState::OnYieldQueue,
            _ => {}
        }

        if let Some(until) = ctl.sleep_until {
            if until > now {
                return NextState::OnSleepQueue;
            }
            ctl.sleep_until = None;
        }
        if ctl.suspend_count > 0 {
            return NextState::Suspended;
        }
        // A reset wants the instance quiescent; yield without work so it
        // can be claimed.
        if ctl.checkpoint_requested {
            return NextState::OnYieldQueue;
        }

        ctl.state = IState::Running;

        if exec.frames.is_some() {
            // Resuming mid-handler; burn detach quantum if armed.
            if let Some(quantum) = ctl.detach_quantum {
                if quantum == 0 {
                    warn!(item = %inst.item(), "detach quantum exhausted, cutting handler off");
                    exec.frames = None;
                    exec.current_event = None;
                    inst.signal_detach_done(&mut ctl);
                    // Suspended-for-detach: nothing else runs before removal.
                    ctl.suspend_count += 1;
                    return NextState::Finished;
                }
                ctl.detach_quantum = Some(quantum - 1);
            }
            None
        } else {
            // Once a detach quantum is armed only the detach event itself
            // may run; anything else at the head suspends the instance.
            if let Some(quantum) = ctl.detach_quantum {
                match ctl.queue.peek() {
                    Some(head) if head.is_detach() => {
                        ctl.detach_quantum = Some(quantum.saturating_sub(1));
                    }
                    _ => return NextState::Suspended,
                }
            }
            match ctl.queue.dequeue() {
                Some(event) => Some(event),
                None => return NextState::Finished,
            }
        }
    };

    // Begin a fresh event cycle.
    let mut init_globals = false;
    if let Some(event) = event {
        if event.kind == EventKind::StateEntry && exec.init_globals_pending {
            exec.globals.clear();
            exec.init_globals_pending = false;
            init_globals = true;
        }
        inst.stats().events_started.fetch_add(1, Ordering::Relaxed);
        exec.frames = Some(vec![Frame::new()]);
        exec.current_event = Some(event);
    }

    let current = exec
        .current_event
        .clone()
        .unwrap_or_else(|| Event::bare(EventKind::StateEntry));
    let is_detach = current.is_detach();

    let handler = inst.program().handler(&exec.state_name, current.kind);
    let Some(handler) = handler else {
        // The state changed since admission; nothing to run.
        finish_cycle(inst, &mut exec, is_detach);
        return NextState::Finished;
    };

    let started = Instant::now();
    let outcome = {
        let state_name = exec.state_name.clone();
        let exec = &mut *exec;
        let frames = exec
            .frames
            .as_mut()
            .unwrap_or_else(|| unreachable!("frames captured above"));
        let mut cx = ExecContext {
            frames,
            globals: &mut exec.globals,
            event: &current,
            state_name: &state_name,
            init_globals,
        };
        catch_unwind(AssertUnwindSafe(|| handler.step(&mut cx)))
    };

    let cpu = started.elapsed().as_micros() as u64;
    inst.stats().cpu_micros.fetch_add(cpu, Ordering::Relaxed);
    inst.stats().slices.fetch_add(1, Ordering::Relaxed);

    // Heap accounting against the declared limit.
    let outcome = match outcome {
        Ok(outcome) => {
            let used = exec.globals.heap_size();
            let limit = inst.program().heap_limit();
            if used > limit {
                Ok(HandlerOutcome::Fault(RuntimeFault::HeapExceeded {
                    used,
                    limit,
                }))
            } else {
                Ok(outcome)
            }
        }
        Err(payload) => Err(payload),
    };

    match outcome {
        Ok(HandlerOutcome::Completed) => {
            finish_cycle(inst, &mut exec, is_detach);
            NextState::Finished
        }
        Ok(HandlerOutcome::Checkpoint) => NextState::OnYieldQueue,
        Ok(HandlerOutcome::Sleep(duration)) => {
            inst.ctl().sleep_until = Some(Instant::now() + duration);
            NextState::OnSleepQueue
        }
        Ok(HandlerOutcome::SelfReset) => {
            finish_cycle(inst, &mut exec, is_detach);
            NextState::ResetRequest
        }
        Ok(HandlerOutcome::SelfDelete) => {
            debug!(item = %inst.item(), "script requested self-delete");
            world.remove_script(inst.host(), inst.item());
            finish_cycle(inst, &mut exec, is_detach);
            park(inst);
            NextState::Finished
        }
        Ok(HandlerOutcome::Die) => {
            debug!(host = %inst.host(), "script requested host death");
            world.die(inst.host());
            finish_cycle(inst, &mut exec, is_detach);
            park(inst);
            NextState::Finished
        }
        Ok(HandlerOutcome::Fault(fault)) => {
            inst.stats().faults.fetch_add(1, Ordering::Relaxed);
            report_fault(inst, world, &fault, &current);
            finish_cycle(inst, &mut exec, is_detach);
            park(inst);
            NextState::Finished
        }
        Err(payload) => {
            inst.stats().faults.fetch_add(1, Ordering::Relaxed);
            let detail = panic_detail(payload.as_ref());
            error!(
                item = %inst.item(),
                event = %current.kind,
                detail = %detail,
                "unclassified fault in handler"
            );
            world.alert_owner(
                inst.host(),
                &format!(
                    "Script {} failed in {}: {}",
                    inst.item(),
                    current.kind,
                    summarize(&detail)
                ),
            );
            finish_cycle(inst, &mut exec, is_detach);
            park(inst);
            NextState::Finished
        }
    }
}

/// Discard captured state at the end of an event cycle.
fn finish_cycle(
    inst: &ScriptInstance,
    exec: &mut crate::instance::ExecGuard<'_>,
    was_detach: bool,
) {
    exec.frames = None;
    exec.current_event = None;
    if was_detach {
        let mut ctl = inst.ctl();
        inst.signal_detach_done(&mut ctl);
    }
}

/// Park the instance indefinitely pending a manual reset. Durable state
/// stays intact.
fn park(inst: &ScriptInstance) {
    inst.ctl().suspend_count += 1;
}

/// Deliver a classified fault in-world: locale by default, privately to
/// the owner when the message carries the owner prefix.
fn report_fault(
    inst: &ScriptInstance,
    world: &dyn WorldServices,
    fault: &RuntimeFault,
    event: &Event,
) {
    let message = format!("Script {} error in {}: {}", inst.item(), event.kind, fault);
    if fault.owner_only() {
        let stripped = message.replacen(OWNER_PREFIX, "", 1);
        world.alert_owner(inst.host(), &stripped);
    } else {
        world.chat_local(inst.host(), &message);
    }
}

/// Extract a printable panic payload.
fn panic_detail(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Owner-facing summary: first line only, internal stack-trace lines
/// filtered out.
fn summarize(detail: &str) -> String {
    detail
        .lines()
        .find(|line| !line.trim_start().starts_with("at ") && !line.contains(".rs:"))
        .unwrap_or("internal error")
        .trim()
        .to_owned()
}

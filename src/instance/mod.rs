//! Script instance
//!
//! One instance owns a script's entire runtime state: lifecycle state,
//! event queue, captured frames, globals, sleep/suspend counters, and the
//! shared compiled-program handle.
//!
//! Two lock domains per instance: the *queue lock* ([`InstanceCtl`])
//! guards the event queue, counts, and lifecycle flags and is held only
//! briefly; the *run lock* ([`ExecState`]) guards handler execution and
//! captured frames and is held for one slice. Code needing both takes the
//! run lock first, then the queue lock.

pub mod state;

#[cfg(test)]
mod tests;

pub use state::IState;

use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::event::{Admission, Event, EventKind, EventQueue};
use crate::exec::Frame;
use crate::program::CompiledProgram;
use crate::sched::RunQueueId;
use crate::util::config::EngineConfig;
use crate::value::Globals;

/// Inventory slot the script occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId(pub u64);

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "item-{:08x}", self.0)
    }
}

/// Object hosting the script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "obj-{:08x}", self.0)
    }
}

/// Permission grant held by the script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permissions {
    /// Who granted.
    pub granter: String,
    /// Granted permission bits.
    pub mask: u32,
}

/// One active listen registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerReg {
    pub channel: i64,
    pub name: String,
    pub key: String,
    pub message: String,
}

/// Active registrations that must survive a migration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registrations {
    /// Repeating timer interval in seconds, if armed.
    pub timer_interval: Option<f64>,
    /// Active listens.
    pub listeners: Vec<ListenerReg>,
    /// Outstanding HTTP request handles.
    pub http_requests: Vec<String>,
}

impl Registrations {
    /// Drop everything.
    pub fn clear(&mut self) {
        self.timer_interval = None;
        self.listeners.clear();
        self.http_requests.clear();
    }
}

/// Queue-lock domain: event queue, counts, lifecycle flags.
#[derive(Debug)]
pub(crate) struct InstanceCtl {
    pub(crate) state: IState,
    pub(crate) queue: EventQueue,
    /// Accepting events.
    pub(crate) running: bool,
    /// Still under construction; admission is lenient.
    pub(crate) constructing: bool,
    pub(crate) sleep_until: Option<Instant>,
    /// Kinds that cancel an in-progress sleep when posted.
    pub(crate) wake_mask: HashSet<EventKind>,
    /// External pause requests, independent of sleep.
    pub(crate) suspend_count: u32,
    /// Remaining slices for the terminal detach handler, once armed.
    pub(crate) detach_quantum: Option<u32>,
    /// Set when the detach handler has finished (or was cut off).
    pub(crate) detach_done: bool,
    /// A reset wants the running handler to checkpoint out.
    pub(crate) checkpoint_requested: bool,
    /// Which run queue the instance sits on, if any.
    pub(crate) queue_membership: Option<RunQueueId>,
    pub(crate) start_param: i32,
}

/// Run-lock domain: handler execution state and captured frames.
#[derive(Debug)]
pub(crate) struct ExecState {
    /// Current named script state.
    pub(crate) state_name: String,
    pub(crate) globals: Globals,
    /// Captured frames; `Some` exactly while an event code is active.
    pub(crate) frames: Option<Vec<Frame>>,
    /// Event being processed; `None` when idle mid-queue.
    pub(crate) current_event: Option<Event>,
    /// `state_entry` must (re)initialize all declared globals first.
    pub(crate) init_globals_pending: bool,
    pub(crate) permissions: Option<Permissions>,
    pub(crate) registrations: Registrations,
}

impl ExecState {
    /// Event-code-active and frames-present must always agree.
    #[inline]
    pub(crate) fn assert_consistent(&self) {
        debug_assert_eq!(
            self.frames.is_some(),
            self.current_event.is_some(),
            "frames/current-event invariant broken"
        );
    }
}

/// Run-lock guard that re-checks the frames invariant on release.
pub(crate) struct ExecGuard<'a>(MutexGuard<'a, ExecState>);

impl Deref for ExecGuard<'_> {
    type Target = ExecState;
    fn deref(&self) -> &ExecState {
        &self.0
    }
}

impl DerefMut for ExecGuard<'_> {
    fn deref_mut(&mut self) -> &mut ExecState {
        &mut self.0
    }
}

impl Drop for ExecGuard<'_> {
    fn drop(&mut self) {
        self.0.assert_consistent();
    }
}

/// Per-instance counters.
#[derive(Debug, Default)]
pub struct InstanceStats {
    /// Event handlers started.
    pub events_started: AtomicU64,
    /// Resumption slices (including the first of each event).
    pub slices: AtomicU64,
    /// CPU time consumed, microseconds.
    pub cpu_micros: AtomicU64,
    /// Faults taken.
    pub faults: AtomicU64,
}

/// Why a post was rejected. Rejection is silent; the reason is for
/// diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// No state of the program handles this kind.
    NoHandler,
    /// Instance stopped or disposed.
    NotAccepting,
    /// Per-kind minimum delay not elapsed.
    Throttled,
    /// Per-kind queue cap reached.
    CapExceeded,
}

/// What the scheduler must do after a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostDisposition {
    /// Dropped, silently.
    Rejected(RejectReason),
    /// Queued; instance already scheduled or not currently runnable.
    Queued,
    /// Queued and the instance claimed `OnStartQueue`; push it and wake a
    /// worker.
    NeedsStart,
    /// Queued and the sleep was cancelled; move Sleep -> Yield.
    WakeFromSleep,
}

/// The runtime object owning one script's complete state and schedule.
pub struct ScriptInstance {
    item: ItemId,
    host: ObjectId,
    program: Arc<CompiledProgram>,
    detach_slices: u32,
    ctl: Mutex<InstanceCtl>,
    exec: Mutex<ExecState>,
    detach_cv: Condvar,
    stats: InstanceStats,
}

impl std::fmt::Debug for ScriptInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptInstance")
            .field("item", &self.item)
            .field("host", &self.host)
            .field("state", &self.state())
            .finish()
    }
}

impl ScriptInstance {
    /// Create an instance in `Construct` around a resolved program.
    pub fn new(
        item: ItemId,
        host: ObjectId,
        program: Arc<CompiledProgram>,
        config: &EngineConfig,
    ) -> Self {
        let globals = Globals::sized_for(program.layout());
        Self {
            item,
            host,
            program,
            detach_slices: config.detach_quantum,
            ctl: Mutex::new(InstanceCtl {
                state: IState::Construct,
                queue: EventQueue::new(),
                running: true,
                constructing: true,
                sleep_until: None,
                wake_mask: HashSet::new(),
                suspend_count: 0,
                detach_quantum: None,
                detach_done: true,
                checkpoint_requested: false,
                queue_membership: None,
                start_param: 0,
            }),
            exec: Mutex::new(ExecState {
                state_name: "default".to_owned(),
                globals,
                frames: None,
                current_event: None,
                init_globals_pending: true,
                permissions: None,
                registrations: Registrations::default(),
            }),
            detach_cv: Condvar::new(),
            stats: InstanceStats::default(),
        }
    }

    /// Inventory slot identity.
    #[inline]
    pub fn item(&self) -> ItemId {
        self.item
    }

    /// Hosting object identity.
    #[inline]
    pub fn host(&self) -> ObjectId {
        self.host
    }

    /// Shared compiled program.
    #[inline]
    pub fn program(&self) -> &Arc<CompiledProgram> {
        &self.program
    }

    /// Per-instance counters.
    #[inline]
    pub fn stats(&self) -> &InstanceStats {
        &self.stats
    }

    /// Current lifecycle state.
    pub fn state(&self) -> IState {
        self.ctl.lock().state
    }

    pub(crate) fn ctl(&self) -> MutexGuard<'_, InstanceCtl> {
        self.ctl.lock()
    }

    pub(crate) fn exec(&self) -> ExecGuard<'_> {
        let guard = self.exec.lock();
        guard.assert_consistent();
        ExecGuard(guard)
    }

    pub(crate) fn try_exec(&self) -> Option<ExecGuard<'_>> {
        let guard = self.exec.try_lock()?;
        guard.assert_consistent();
        Some(ExecGuard(guard))
    }

    /// Leave `Construct`. Posts that arrived during construction may have
    /// already claimed the Start queue; that claim is kept.
    pub fn finish_construct(&self) {
        let mut ctl = self.ctl();
        ctl.constructing = false;
        if ctl.state == IState::Construct {
            ctl.state = IState::Idle;
        }
    }

    /// Offer an event. Callable from any thread, including from inside a
    /// running handler. Rejections are silent.
    pub fn post_event(&self, event: Event, now: Instant) -> PostDisposition {
        if !self.program.handles_anywhere(event.kind) {
            return PostDisposition::Rejected(RejectReason::NoHandler);
        }

        let mut ctl = self.ctl();
        if ctl.state == IState::Disposed {
            return PostDisposition::Rejected(RejectReason::NotAccepting);
        }
        if !ctl.running && !ctl.constructing {
            // A state_entry arriving while nothing else is queued is still
            // admitted; it is what unsticks the default first run.
            let unstick = event.kind == EventKind::StateEntry && ctl.queue.is_empty();
            if !unstick {
                return PostDisposition::Rejected(RejectReason::NotAccepting);
            }
        }

        let is_detach = event.is_detach();
        let kind = event.kind;
        match ctl.queue.admit(event, now) {
            Admission::Throttled => {
                trace!(item = %self.item, %kind, "event throttled");
                return PostDisposition::Rejected(RejectReason::Throttled);
            }
            Admission::CapExceeded => {
                trace!(item = %self.item, %kind, "event dropped at cap");
                return PostDisposition::Rejected(RejectReason::CapExceeded);
            }
            Admission::Queued => {}
        }

        if is_detach {
            ctl.detach_quantum = Some(self.detach_slices);
            ctl.detach_done = false;
            debug!(item = %self.item, slices = self.detach_slices, "detach quantum armed");
        }

        // Wake a sleeper when the kind is in its wake mask; the terminal
        // detach signal always wakes.
        if ctl.state == IState::OnSleepQueue && (is_detach || ctl.wake_mask.contains(&kind)) {
            ctl.sleep_until = None;
            ctl.state = IState::RemovedFromSleep;
            return PostDisposition::WakeFromSleep;
        }

        if ctl.state == IState::Idle && ctl.running && ctl.suspend_count == 0 {
            ctl.state = IState::OnStartQueue;
            return PostDisposition::NeedsStart;
        }

        PostDisposition::Queued
    }

    /// Retract all queued occurrences of a kind.
    pub fn cancel_event(&self, kind: EventKind) -> usize {
        self.ctl().queue.cancel(kind)
    }

    /// Event kinds the current script state handles, for world-side
    /// delivery filtering.
    pub fn handled_kinds(&self) -> Vec<EventKind> {
        let state_name = self.exec().state_name.clone();
        self.program.kinds_in_state(&state_name)
    }

    /// Whether the instance accepts events.
    pub fn running(&self) -> bool {
        self.ctl().running
    }

    /// Enable or disable event admission. Disabling flushes the queue.
    pub fn set_running(&self, running: bool) {
        let mut ctl = self.ctl();
        ctl.running = running;
        if !running {
            ctl.queue.flush();
        }
    }

    /// Rez start parameter.
    pub fn start_param(&self) -> i32 {
        self.ctl().start_param
    }

    /// Set the rez start parameter.
    pub fn set_start_param(&self, value: i32) {
        self.ctl().start_param = value;
    }

    /// Minimum inter-event delay for throttled kinds.
    pub fn min_event_delay(&self) -> Duration {
        self.ctl().queue.min_delay()
    }

    /// Set the minimum inter-event delay.
    pub fn set_min_event_delay(&self, delay: Duration) {
        self.ctl().queue.set_min_delay(delay);
    }

    /// Replace the set of kinds that cancel a sleep when posted.
    pub fn set_wake_mask(&self, kinds: impl IntoIterator<Item = EventKind>) {
        self.ctl().wake_mask = kinds.into_iter().collect();
    }

    /// Externally pause the instance. Takes effect at the next slice
    /// boundary; stacks with further suspends.
    pub fn suspend(&self) {
        self.ctl().suspend_count += 1;
    }

    /// Drop one suspend. Returns true when the instance became runnable
    /// and has pending work, i.e. the caller should refile it onto Start.
    pub fn resume(&self) -> bool {
        let mut ctl = self.ctl();
        ctl.suspend_count = ctl.suspend_count.saturating_sub(1);
        if ctl.suspend_count == 0
            && ctl.state == IState::Suspended
            && ctl.running
            && !ctl.queue.is_empty()
        {
            ctl.state = IState::OnStartQueue;
            return true;
        }
        if ctl.suspend_count == 0 && ctl.state == IState::Suspended {
            ctl.state = IState::Idle;
        }
        false
    }

    /// Ask a running handler to checkpoint out at its next step boundary.
    pub fn request_checkpoint(&self) {
        self.ctl().checkpoint_requested = true;
    }

    /// Block until the terminal detach handler has completed (or been cut
    /// off by its quantum). Returns false on timeout.
    pub fn wait_detach_done(&self, timeout: Duration) -> bool {
        let mut ctl = self.ctl();
        if ctl.detach_done {
            return true;
        }
        !self
            .detach_cv
            .wait_while_for(&mut ctl, |c| !c.detach_done, timeout)
            .timed_out()
    }

    pub(crate) fn signal_detach_done(&self, ctl: &mut InstanceCtl) {
        if !ctl.detach_done {
            ctl.detach_done = true;
            ctl.detach_quantum = None;
            self.detach_cv.notify_all();
        }
    }

    /// Rebuild never-run state. Caller must have claimed the instance into
    /// `Resetting` and taken it off all run queues. Leaves the instance
    /// `Idle` with exactly one queued `state_entry`.
    pub(crate) fn complete_reset(&self) {
        let mut exec = self.exec();
        let mut ctl = self.ctl();
        debug_assert_eq!(ctl.state, IState::Resetting);

        ctl.queue.flush();
        ctl.sleep_until = None;
        ctl.suspend_count = 0;
        ctl.checkpoint_requested = false;
        ctl.running = true;
        self.signal_detach_done(&mut ctl);

        exec.permissions = None;
        exec.registrations.clear();
        exec.globals.clear();
        exec.frames = None;
        exec.current_event = None;
        exec.state_name = "default".to_owned();
        exec.init_globals_pending = true;

        ctl.queue.restore_push(Event::bare(EventKind::StateEntry));
        ctl.state = IState::Idle;
        debug!(item = %self.item, "instance reset to never-run state");
    }

    /// Tear the instance down. Terminal; the caller releases the shared
    /// program reference.
    pub fn dispose(&self) {
        let mut ctl = self.ctl();
        if ctl.state == IState::Disposed {
            return;
        }
        ctl.state = IState::Disposed;
        ctl.queue.flush();
        ctl.queue_membership = None;
        self.signal_detach_done(&mut ctl);
        debug!(item = %self.item, "instance disposed");
    }

    /// Single-line operational summary.
    pub fn describe(&self) -> String {
        let ctl = self.ctl();
        format!(
            "{} host={} state={:?} queued={} suspend={} events={} slices={} cpu_us={}",
            self.item,
            self.host,
            ctl.state,
            ctl.queue.len(),
            ctl.suspend_count,
            self.stats.events_started.load(Ordering::Relaxed),
            self.stats.slices.load(Ordering::Relaxed),
            self.stats.cpu_micros.load(Ordering::Relaxed),
        )
    }

    /// Verbose multi-field dump for operational tooling.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        {
            let ctl = self.ctl();
            out.push_str(&format!("instance {}\n", self.item));
            out.push_str(&format!("  host:          {}\n", self.host));
            out.push_str(&format!("  program:       {}\n", self.program.key()));
            out.push_str(&format!("  state:         {:?}\n", ctl.state));
            out.push_str(&format!("  running:       {}\n", ctl.running));
            out.push_str(&format!("  queued:        {}\n", ctl.queue.len()));
            out.push_str(&format!("  suspend_count: {}\n", ctl.suspend_count));
            out.push_str(&format!("  sleep_until:   {:?}\n", ctl.sleep_until));
            out.push_str(&format!("  detach_quantum:{:?}\n", ctl.detach_quantum));
            out.push_str(&format!("  start_param:   {}\n", ctl.start_param));
            out.push_str(&format!("  min_delay:     {:?}\n", ctl.queue.min_delay()));
        }
        {
            let exec = self.exec();
            out.push_str(&format!("  script_state:  {}\n", exec.state_name));
            out.push_str(&format!(
                "  mid_handler:   {}\n",
                exec.frames.is_some()
            ));
            out.push_str(&format!("  heap_used:     {}\n", exec.globals.heap_size()));
            out.push_str(&format!("  permissions:   {:?}\n", exec.permissions));
        }
        out.push_str(&format!(
            "  events={} slices={} cpu_us={} faults={}\n",
            self.stats.events_started.load(Ordering::Relaxed),
            self.stats.slices.load(Ordering::Relaxed),
            self.stats.cpu_micros.load(Ordering::Relaxed),
            self.stats.faults.load(Ordering::Relaxed),
        ));
        out
    }
}

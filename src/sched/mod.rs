//! Script thread scheduler
//!
//! A fixed pool of long-lived worker threads cooperatively time-slices
//! many script instances. Each iteration a worker services a pending
//! administrative thunk, honors the global suspend switch, bursts through
//! the Start queue, takes one Yield entry, and otherwise blocks on a wake
//! condition with a bounded timeout. A lightweight timer thread moves
//! elapsed sleepers onto the Yield queue.

pub mod queue;

#[cfg(test)]
mod tests;

pub use queue::{InstanceArena, InstanceId, RunQueueId, RunQueues};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, trace};

use crate::error::StateError;
use crate::event::{Event, EventKind};
use crate::exec::{run_one, NextState};
use crate::instance::{IState, PostDisposition, ScriptInstance};
use crate::program::ProgramCache;
use crate::util::config::EngineConfig;
use crate::world::WorldServices;

type Thunk = Box<dyn FnOnce() + Send + 'static>;

/// Scheduler counters.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Instances admitted to the arena.
    pub instances_admitted: AtomicUsize,
    /// Events accepted by post_event.
    pub events_posted: AtomicUsize,
    /// Slices executed.
    pub slices_run: AtomicUsize,
    /// Administrative thunks serviced.
    pub thunks_run: AtomicUsize,
    /// Sleepers moved to Yield by the timer.
    pub sleep_wakes: AtomicUsize,
}

impl SchedulerStats {
    /// Record one executed slice.
    #[inline]
    pub fn record_slice(&self) {
        self.slices_run.fetch_add(1, Ordering::Relaxed);
    }
}

struct Shared {
    config: EngineConfig,
    world: Arc<dyn WorldServices>,
    arena: RwLock<InstanceArena>,
    queues: Mutex<RunQueues>,
    /// Paired with `queues` for worker wake-up.
    wake: Condvar,
    /// Global suspend switch; workers block while set.
    suspended: AtomicBool,
    running: AtomicBool,
    thunk_tx: Sender<Thunk>,
    thunk_rx: Receiver<Thunk>,
    stats: SchedulerStats,
}

/// The worker-pool scheduler.
pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Vec<thread::JoinHandle<()>>,
    timer: Option<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.workers.len())
            .field("instances", &self.shared.arena.read().len())
            .finish()
    }
}

impl Scheduler {
    /// Spawn the pool with the given configuration and world collaborator.
    pub fn new(config: EngineConfig, world: Arc<dyn WorldServices>) -> Self {
        let (thunk_tx, thunk_rx) = unbounded();
        let shared = Arc::new(Shared {
            config: config.clone(),
            world,
            arena: RwLock::new(InstanceArena::new()),
            queues: Mutex::new(RunQueues::new()),
            wake: Condvar::new(),
            suspended: AtomicBool::new(false),
            running: AtomicBool::new(true),
            thunk_tx,
            thunk_rx,
            stats: SchedulerStats::default(),
        });

        let workers = (0..config.num_workers)
            .map(|worker_id| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("script-worker-{worker_id}"))
                    .spawn(move || worker_loop(worker_id, &shared))
                    .expect("Failed to spawn worker thread")
            })
            .collect();

        let timer = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("sleep-timer".to_owned())
                .spawn(move || timer_loop(&shared))
                .expect("Failed to spawn sleep-timer thread")
        };

        info!(workers = config.num_workers, "script scheduler started");
        Self {
            shared,
            workers,
            timer: Some(timer),
        }
    }

    /// Engine configuration.
    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Scheduler counters.
    #[inline]
    pub fn stats(&self) -> &SchedulerStats {
        &self.shared.stats
    }

    /// Admit an instance to the arena. The instance keeps whatever
    /// lifecycle state it is in; post an event or kick it to run.
    pub fn admit(&self, inst: Arc<ScriptInstance>) -> InstanceId {
        self.shared
            .stats
            .instances_admitted
            .fetch_add(1, Ordering::Relaxed);
        let id = self.shared.arena.write().insert(inst);
        debug!(%id, "instance admitted");
        id
    }

    /// Fetch a live instance.
    pub fn instance(&self, id: InstanceId) -> Option<Arc<ScriptInstance>> {
        self.shared.arena.read().get(id)
    }

    /// Inject an event. Returns true when the event was queued.
    pub fn post_event(&self, id: InstanceId, event: Event) -> bool {
        let Some(inst) = self.instance(id) else {
            return false;
        };
        match inst.post_event(event, Instant::now()) {
            PostDisposition::Rejected(reason) => {
                trace!(%id, ?reason, "event rejected");
                false
            }
            PostDisposition::Queued => {
                self.shared.stats.events_posted.fetch_add(1, Ordering::Relaxed);
                true
            }
            PostDisposition::NeedsStart => {
                self.shared.stats.events_posted.fetch_add(1, Ordering::Relaxed);
                let mut queues = self.shared.queues.lock();
                inst.ctl().queue_membership = Some(RunQueueId::Start);
                queues.push(RunQueueId::Start, id);
                self.shared.wake.notify_one();
                true
            }
            PostDisposition::WakeFromSleep => {
                self.shared.stats.events_posted.fetch_add(1, Ordering::Relaxed);
                let mut queues = self.shared.queues.lock();
                let mut ctl = inst.ctl();
                if ctl.queue_membership == Some(RunQueueId::Sleep) {
                    queues.unlink(RunQueueId::Sleep, id);
                }
                ctl.state = IState::OnYieldQueue;
                ctl.queue_membership = Some(RunQueueId::Yield);
                queues.push(RunQueueId::Yield, id);
                drop(ctl);
                self.shared.wake.notify_one();
                true
            }
        }
    }

    /// Retract all queued occurrences of a kind.
    pub fn cancel_event(&self, id: InstanceId, kind: EventKind) -> usize {
        self.instance(id)
            .map(|inst| inst.cancel_event(kind))
            .unwrap_or(0)
    }

    /// Event kinds the instance's current script state handles.
    pub fn handled_kinds(&self, id: InstanceId) -> Vec<EventKind> {
        self.instance(id)
            .map(|inst| inst.handled_kinds())
            .unwrap_or_default()
    }

    /// Resume a previously suspended instance, refiling it if runnable.
    pub fn resume_instance(&self, id: InstanceId) {
        let Some(inst) = self.instance(id) else {
            return;
        };
        if inst.resume() {
            let mut queues = self.shared.queues.lock();
            inst.ctl().queue_membership = Some(RunQueueId::Start);
            queues.push(RunQueueId::Start, id);
            self.shared.wake.notify_one();
        }
    }

    /// Pause every worker after its current slice.
    pub fn suspend_all(&self) {
        self.shared.suspended.store(true, Ordering::SeqCst);
        info!("scheduler globally suspended");
    }

    /// Release a global suspend.
    pub fn resume_all(&self) {
        self.shared.suspended.store(false, Ordering::SeqCst);
        self.shared.wake.notify_all();
        info!("scheduler resumed");
    }

    /// Run a cross-cutting operation on a worker thread, while no instance
    /// is mid-execution on that worker. Blocks until it has run.
    pub fn run_admin<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = crossbeam::channel::bounded(1);
        self.shared
            .thunk_tx
            .send(Box::new(move || {
                let _ = tx.send(f());
            }))
            .expect("worker pool gone");
        self.shared.wake.notify_all();
        rx.recv().expect("worker pool gone")
    }

    /// Reset an instance to a never-run state regardless of what it is
    /// doing. Retry loop: quiescent states are claimed atomically, a
    /// running handler is asked to checkpoint, transient states are waited
    /// out.
    pub fn reset(&self, id: InstanceId) -> Result<(), StateError> {
        let inst = self
            .instance(id)
            .ok_or(StateError::UnknownInstance(id.0))?;
        let deadline = Instant::now() + self.shared.config.reset_timeout();

        loop {
            {
                let mut queues = self.shared.queues.lock();
                let mut ctl = inst.ctl();
                match ctl.state {
                    IState::Disposed => return Err(StateError::Disposed),
                    IState::Idle
                    | IState::OnStartQueue
                    | IState::OnYieldQueue
                    | IState::OnSleepQueue
                    | IState::Suspended => {
                        if let Some(queue) = ctl.queue_membership.take() {
                            queues.unlink(queue, id);
                        }
                        ctl.checkpoint_requested = false;
                        ctl.state = IState::Resetting;
                        break;
                    }
                    IState::Running => {
                        ctl.checkpoint_requested = true;
                    }
                    // Transient or still constructing; wait it out.
                    IState::RemovedFromSleep
                    | IState::Finished
                    | IState::Construct
                    | IState::Resetting => {}
                }
            }
            if Instant::now() > deadline {
                return Err(StateError::ResetTimeout);
            }
            thread::sleep(Duration::from_millis(1));
        }

        inst.complete_reset();
        self.kick(id, &inst);
        Ok(())
    }

    /// Dispose an instance: remove it from the arena and all queues, and
    /// drop its shared program reference.
    pub fn dispose(&self, id: InstanceId) {
        let Some(inst) = self.shared.arena.write().remove(id) else {
            return;
        };
        {
            let mut queues = self.shared.queues.lock();
            let mut ctl = inst.ctl();
            if let Some(queue) = ctl.queue_membership.take() {
                queues.unlink(queue, id);
            }
        }
        inst.dispose();
        ProgramCache::release(inst.program().key());
    }

    /// File an Idle instance with pending events onto Start.
    pub fn kick(&self, id: InstanceId, inst: &ScriptInstance) {
        let mut queues = self.shared.queues.lock();
        let mut ctl = inst.ctl();
        if ctl.state == IState::Idle
            && ctl.running
            && ctl.suspend_count == 0
            && !ctl.queue.is_empty()
        {
            ctl.state = IState::OnStartQueue;
            ctl.queue_membership = Some(RunQueueId::Start);
            queues.push(RunQueueId::Start, id);
            drop(ctl);
            self.shared.wake.notify_one();
        }
    }

    /// One-line summaries of every live instance.
    pub fn dump(&self) -> String {
        let arena = self.shared.arena.read();
        let mut out = String::new();
        for (id, inst) in arena.iter() {
            out.push_str(&format!("{id} {}\n", inst.describe()));
        }
        out
    }

    /// Stop the pool and join every thread.
    pub fn shutdown(&mut self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.wake.notify_all();
        for worker in self.workers.drain(..) {
            worker.join().expect("Worker thread panicked");
        }
        if let Some(timer) = self.timer.take() {
            timer.join().expect("Sleep-timer thread panicked");
        }
        info!("script scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker thread main loop.
fn worker_loop(worker_id: usize, shared: &Arc<Shared>) {
    trace!(worker_id, "worker up");
    while shared.running.load(Ordering::SeqCst) {
        // Administrative thunks run while no instance is mid-execution
        // on this worker.
        if let Ok(thunk) = shared.thunk_rx.try_recv() {
            thunk();
            shared.stats.thunks_run.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        if shared.suspended.load(Ordering::SeqCst) {
            let mut queues = shared.queues.lock();
            shared
                .wake
                .wait_for(&mut queues, shared.config.idle_timeout());
            continue;
        }

        let mut ran = false;

        // Burst through Start; these instances have not had a slice yet.
        for _ in 0..shared.config.start_burst {
            let Some(id) = pop_queue(shared, RunQueueId::Start) else {
                break;
            };
            run_instance(shared, id);
            ran = true;
        }

        // One Yield entry; yielded instances already consumed a slice.
        if let Some(id) = pop_queue(shared, RunQueueId::Yield) {
            run_instance(shared, id);
            ran = true;
        }

        if !ran {
            // Bounded wait keeps the worker responsive to watchdogs.
            let mut queues = shared.queues.lock();
            if queues.runnable_len() == 0 {
                shared
                    .wake
                    .wait_for(&mut queues, shared.config.idle_timeout());
            }
        }
    }
    trace!(worker_id, "worker down");
}

/// Pop one id off a run queue, clearing its membership.
fn pop_queue(shared: &Arc<Shared>, queue: RunQueueId) -> Option<InstanceId> {
    let mut queues = shared.queues.lock();
    let id = match queue {
        RunQueueId::Start => queues.pop_start()?,
        RunQueueId::Yield => queues.pop_yield()?,
        RunQueueId::Sleep => return None,
    };
    if let Some(inst) = shared.arena.read().get(id) {
        inst.ctl().queue_membership = None;
    }
    Some(id)
}

/// Run one slice and refile the instance by the returned next state.
fn run_instance(shared: &Arc<Shared>, id: InstanceId) {
    let Some(inst) = shared.arena.read().get(id) else {
        return;
    };
    let next = run_one(&inst, shared.world.as_ref());
    shared.stats.record_slice();
    refile(shared, id, &inst, next);
}

/// Set a lifecycle state, asserting the transition is a legal one.
fn transition(ctl: &mut crate::instance::InstanceCtl, next: IState) {
    debug_assert!(
        ctl.state.may_transition(next),
        "illegal transition {:?} -> {:?}",
        ctl.state,
        next
    );
    ctl.state = next;
}

/// Route an instance into the queue matching its next state.
fn refile(shared: &Arc<Shared>, id: InstanceId, inst: &Arc<ScriptInstance>, next: NextState) {
    if next == NextState::ResetRequest {
        // Self-reset: claim directly (the slice just ended, nothing else
        // can be running this instance) and rebuild.
        {
            let mut queues = shared.queues.lock();
            let mut ctl = inst.ctl();
            if ctl.state == IState::Disposed {
                return;
            }
            if let Some(queue) = ctl.queue_membership.take() {
                queues.unlink(queue, id);
            }
            ctl.state = IState::Resetting;
        }
        inst.complete_reset();
        // The fresh state_entry is already queued; file it straight in.
        let mut queues = shared.queues.lock();
        let mut ctl = inst.ctl();
        if ctl.state == IState::Idle && ctl.running && ctl.suspend_count == 0 {
            ctl.state = IState::OnStartQueue;
            ctl.queue_membership = Some(RunQueueId::Start);
            queues.push(RunQueueId::Start, id);
            drop(ctl);
            shared.wake.notify_one();
        }
        return;
    }

    let mut queues = shared.queues.lock();
    let mut ctl = inst.ctl();

    // A reset or disposal may have claimed the instance mid-slice; leave
    // it off all queues in that case.
    if matches!(ctl.state, IState::Resetting | IState::Disposed) {
        ctl.queue_membership = None;
        return;
    }

    match next {
        NextState::OnStartQueue => {
            transition(&mut ctl, IState::OnStartQueue);
            ctl.queue_membership = Some(RunQueueId::Start);
            queues.push(RunQueueId::Start, id);
            drop(ctl);
            shared.wake.notify_one();
        }
        NextState::OnYieldQueue => {
            transition(&mut ctl, IState::OnYieldQueue);
            ctl.queue_membership = Some(RunQueueId::Yield);
            queues.push(RunQueueId::Yield, id);
            drop(ctl);
            shared.wake.notify_one();
        }
        NextState::OnSleepQueue => {
            transition(&mut ctl, IState::OnSleepQueue);
            ctl.queue_membership = Some(RunQueueId::Sleep);
            queues.push(RunQueueId::Sleep, id);
        }
        NextState::Suspended => {
            transition(&mut ctl, IState::Suspended);
            ctl.queue_membership = None;
        }
        NextState::Finished => {
            // Decide Idle vs. straight back onto Start under the queue
            // lock, so a concurrent post cannot be lost.
            transition(&mut ctl, IState::Finished);
            if ctl.running && ctl.suspend_count == 0 && !ctl.queue.is_empty() {
                transition(&mut ctl, IState::OnStartQueue);
                ctl.queue_membership = Some(RunQueueId::Start);
                queues.push(RunQueueId::Start, id);
                drop(ctl);
                shared.wake.notify_one();
            } else if ctl.suspend_count > 0 {
                transition(&mut ctl, IState::Suspended);
                ctl.queue_membership = None;
            } else {
                transition(&mut ctl, IState::Idle);
                ctl.queue_membership = None;
            }
        }
        NextState::Disposed => {
            ctl.queue_membership = None;
        }
        NextState::ResetRequest => unreachable!("handled above"),
    }
}

/// Sleep-queue timer: move elapsed sleepers onto Yield and wake a worker.
fn timer_loop(shared: &Arc<Shared>) {
    while shared.running.load(Ordering::SeqCst) {
        thread::sleep(shared.config.sleep_scan_interval());
        let now = Instant::now();

        let mut woken = 0usize;
        {
            let mut queues = shared.queues.lock();
            let sleeping: Vec<InstanceId> = queues.sleeping().to_vec();
            for id in sleeping {
                let Some(inst) = shared.arena.read().get(id) else {
                    queues.unlink(RunQueueId::Sleep, id);
                    continue;
                };
                let mut ctl = inst.ctl();
                let elapsed = ctl.sleep_until.map(|until| until <= now).unwrap_or(true);
                if ctl.state == IState::OnSleepQueue && elapsed {
                    queues.unlink(RunQueueId::Sleep, id);
                    ctl.state = IState::OnYieldQueue;
                    ctl.queue_membership = Some(RunQueueId::Yield);
                    queues.push(RunQueueId::Yield, id);
                    woken += 1;
                }
            }
        }
        if woken > 0 {
            shared.stats.sleep_wakes.fetch_add(woken, Ordering::Relaxed);
            shared.wake.notify_all();
        }
    }
}

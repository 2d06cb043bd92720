//! Instance lifecycle states

use serde::{Deserialize, Serialize};

/// Lifecycle state of a script instance. Exactly one holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IState {
    /// Program being resolved and initial state loaded.
    Construct,
    /// Quiescent, no pending work.
    Idle,
    /// Waiting on the Start queue for a first slice.
    OnStartQueue,
    /// A worker is executing a slice right now.
    Running,
    /// Script-requested sleep, parked on the Sleep queue.
    OnSleepQueue,
    /// Transient: pulled off the Sleep queue, not yet refiled.
    RemovedFromSleep,
    /// Yielded mid-handler, waiting on the Yield queue.
    OnYieldQueue,
    /// Transient: slice ended, worker deciding Idle vs. Start.
    Finished,
    /// Externally paused; off all queues until resumed.
    Suspended,
    /// Reset in progress; off all queues.
    Resetting,
    /// Gone. Terminal.
    Disposed,
}

impl IState {
    /// Whether the transition `self -> next` is one the engine performs.
    /// `Disposed` is terminal; everything may enter `Disposed`.
    pub fn may_transition(self, next: IState) -> bool {
        use IState::*;
        if self == Disposed {
            return false;
        }
        if next == Disposed {
            return true;
        }
        matches!(
            (self, next),
            (Construct, Idle)
                | (Construct, OnStartQueue)
                | (Idle, OnStartQueue)
                | (Idle, Resetting)
                | (Idle, Suspended)
                | (OnStartQueue, Running)
                | (OnStartQueue, Resetting)
                // A popped instance can be refiled without running when a
                // pre-slice check (sleep, suspend, checkpoint, contended
                // run lock) bounces it.
                | (OnStartQueue, OnYieldQueue)
                | (OnStartQueue, OnSleepQueue)
                | (OnStartQueue, Suspended)
                | (OnYieldQueue, OnYieldQueue)
                | (OnYieldQueue, OnSleepQueue)
                | (OnYieldQueue, Suspended)
                | (Running, OnYieldQueue)
                | (Running, OnSleepQueue)
                | (Running, Finished)
                | (Running, Suspended)
                | (Running, Resetting)
                | (OnSleepQueue, RemovedFromSleep)
                | (OnSleepQueue, OnYieldQueue)
                | (OnSleepQueue, Resetting)
                | (RemovedFromSleep, OnYieldQueue)
                | (RemovedFromSleep, Suspended)
                | (OnYieldQueue, Running)
                | (OnYieldQueue, Resetting)
                | (Finished, Idle)
                | (Finished, OnStartQueue)
                | (Finished, Suspended)
                | (Finished, Resetting)
                | (Suspended, Idle)
                | (Suspended, OnStartQueue)
                | (Suspended, Resetting)
                | (Resetting, Idle)
        )
    }

    /// States in which the instance sits on no run queue.
    #[inline]
    pub fn off_queues(self) -> bool {
        matches!(
            self,
            IState::Construct
                | IState::Idle
                | IState::Running
                | IState::RemovedFromSleep
                | IState::Finished
                | IState::Suspended
                | IState::Resetting
                | IState::Disposed
        )
    }

    /// Transient states a reset must wait out rather than claim.
    #[inline]
    pub fn is_transient(self) -> bool {
        matches!(self, IState::RemovedFromSleep | IState::Finished)
    }
}

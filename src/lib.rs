//! LingJing Script Host
//!
//! Cooperative scheduling and durable state migration for sandboxed
//! in-world scripts. Many instances time-slice over a fixed pool of
//! worker threads; an instance's full execution state (globals, captured
//! frames, pending events, registrations) serializes to a versioned blob
//! and rebuilds after a process restart or a region crossing.
//!
//! The compiler and the simulated world are external collaborators: the
//! host consumes a compiled handler table ([`program::CompiledProgram`])
//! and talks back through [`world::WorldServices`].

#![doc(html_root_url = "https://docs.rs/lingjing")]
#![warn(rust_2018_idioms)]
#![allow(dead_code)]

// Public modules
pub mod error;
pub mod event;
pub mod exec;
pub mod instance;
pub mod persist;
pub mod program;
pub mod sched;
pub mod value;
pub mod world;

// Utility modules
pub mod util;

// Re-exports
pub use anyhow::{Context, Result};
pub use thiserror::Error;

pub use event::{Event, EventKind};
pub use instance::{ItemId, ObjectId, ScriptInstance};
pub use program::{CompiledProgram, ProgramKey};
pub use sched::{InstanceId, Scheduler};
pub use util::config::EngineConfig;

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

/// Host version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Host name
pub const NAME: &str = "LingJing (灵境)";

/// Spawn a script: resolve the shared compiled program, build the
/// instance, load its durable state (or initialize fresh), queue the
/// post-restore cause events, and hand it to the scheduler.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use lingjing::instance::{ItemId, ObjectId};
/// use lingjing::persist::CauseEvents;
/// use lingjing::program::{ProgramBuilder, ProgramKey};
/// use lingjing::sched::Scheduler;
/// use lingjing::util::config::EngineConfig;
/// use lingjing::world::{FileStateStore, NullWorld};
///
/// fn main() -> lingjing::Result<()> {
///     let sched = Scheduler::new(EngineConfig::default(), Arc::new(NullWorld));
///     let store = FileStateStore::new("./state")?;
///
///     let key = ProgramKey::from_source("default { state_entry() { } }");
///     let _id = lingjing::spawn_script(
///         &sched,
///         ItemId(1),
///         ObjectId(1),
///         &key,
///         || Ok(ProgramBuilder::new(key.clone()).build()),
///         &store,
///         &CauseEvents::default(),
///     )?;
///     Ok(())
/// }
/// ```
pub fn spawn_script<F>(
    sched: &Scheduler,
    item: ItemId,
    host: ObjectId,
    key: &ProgramKey,
    build: F,
    store: &dyn world::StateStore,
    causes: &persist::CauseEvents,
) -> Result<InstanceId>
where
    F: FnOnce() -> Result<Arc<CompiledProgram>>,
{
    let program = program::ProgramCache::acquire(key, build)?;
    let inst = Arc::new(ScriptInstance::new(item, host, program, sched.config()));

    let restored = persist::load_or_init(&inst, store)?;
    persist::append_cause_events(&inst, causes);
    inst.finish_construct();

    let id = sched.admit(inst.clone());
    sched.kick(id, &inst);
    debug!(%id, %item, restored, "script spawned");
    Ok(id)
}

/// Remove a script: give a pending detach handler its chance to finish,
/// capture the instance's durable state, then dispose it.
pub fn despawn_script(
    sched: &Scheduler,
    id: InstanceId,
    store: &dyn world::StateStore,
) -> Result<()> {
    let Some(inst) = sched.instance(id) else {
        return Ok(());
    };

    inst.wait_detach_done(Duration::from_secs(1));

    // Capture from a worker thread, so that worker is not mid-slice; the
    // run lock serializes against whichever worker holds the instance.
    let capture_target = inst.clone();
    let blob = sched.run_admin(move || persist::capture(&capture_target));
    let bytes = persist::encode(&blob)?;
    store.store(inst.item(), &bytes)?;

    sched.dispose(id);
    debug!(%id, item = %inst.item(), "script despawned");
    Ok(())
}

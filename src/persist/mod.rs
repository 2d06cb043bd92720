//! State migration
//!
//! Converts an instance's live state (globals, frames, detect parameters,
//! registrations, permissions, queued events) to and from a versioned
//! durable blob, and rebuilds instances from it after a process restart.
//!
//! Two legacy encodings are accepted on read: the version-1 structured
//! schema, and the older flat encoding keyed by declared variable name.

pub mod legacy;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PersistError, PersistResult};
use crate::event::{Event, EventKind, CHANGED_REGION, CHANGED_REGION_START, CHANGED_TELEPORT};
use crate::exec::Frame;
use crate::instance::{Permissions, Registrations, ScriptInstance};
use crate::program::ProgramKey;
use crate::value::{Globals, SlotLayout, Value};
use crate::world::StateStore;

/// Schema tag written into every blob.
pub const STATE_SCHEMA: &str = "lingjing-script-state";

/// Current blob version.
pub const STATE_VERSION: u32 = 2;

/// Full durable encoding of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateBlob {
    /// Schema tag, always [`STATE_SCHEMA`].
    pub schema: String,
    /// Blob version, checked on every load.
    pub version: u32,
    /// Content key of the program this state belongs to.
    pub program_key: ProgramKey,
    /// Whether the instance was accepting events.
    pub running: bool,
    /// Globals still awaiting their `state_entry` initialization.
    pub init_globals_pending: bool,
    /// Named script state.
    pub state_name: String,
    /// Rez start parameter.
    pub start_param: i32,
    /// Minimum inter-event delay, milliseconds.
    pub min_event_delay_ms: u64,
    /// Global values by slot.
    pub globals: Globals,
    /// Captured frames, present exactly when mid-handler.
    pub frames: Option<Vec<Frame>>,
    /// Event being handled when captured.
    pub current_event: Option<Event>,
    /// Granted permission identity and mask.
    pub permissions: Option<Permissions>,
    /// Pending events in queue order.
    pub queued: Vec<Event>,
    /// Active timer/listener/HTTP registrations.
    pub registrations: Registrations,
}

/// Why the script is resuming, queued after a restore.
#[derive(Debug, Clone, Default)]
pub struct CauseEvents {
    /// Object was rezzed with this start parameter.
    pub rez_param: Option<i32>,
    /// Object was attached to this avatar.
    pub attached_key: Option<String>,
    /// Object crossed a region boundary.
    pub crossed_region: bool,
    /// Object teleported.
    pub teleported: bool,
    /// The region restarted.
    pub region_restart: bool,
}

/// Capture a quiescent instance into a blob. Takes the run lock, then the
/// queue lock; call from an admin thunk (or a test) so no worker is
/// mid-slice on this instance.
pub fn capture(inst: &ScriptInstance) -> StateBlob {
    let exec = inst.exec();
    let ctl = inst.ctl();
    StateBlob {
        schema: STATE_SCHEMA.to_owned(),
        version: STATE_VERSION,
        program_key: inst.program().key().clone(),
        running: ctl.running,
        init_globals_pending: exec.init_globals_pending,
        state_name: exec.state_name.clone(),
        start_param: ctl.start_param,
        min_event_delay_ms: ctl.queue.min_delay().as_millis() as u64,
        globals: exec.globals.clone(),
        frames: exec.frames.clone(),
        current_event: exec.current_event.clone(),
        permissions: exec.permissions.clone(),
        queued: ctl.queue.snapshot(),
        registrations: exec.registrations.clone(),
    }
}

/// Encode a blob to bytes.
pub fn encode(blob: &StateBlob) -> PersistResult<Vec<u8>> {
    Ok(serde_json::to_vec(blob)?)
}

/// Decode bytes into a blob, accepting the current schema and both legacy
/// encodings. `layout` maps legacy named variables onto current slots.
pub fn decode(bytes: &[u8], layout: &SlotLayout) -> PersistResult<StateBlob> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;

    let schema = value
        .get("schema")
        .and_then(|s| s.as_str())
        .map(str::to_owned);
    let blob = match schema.as_deref() {
        Some(schema) if schema == STATE_SCHEMA => {
            match value.get("version").and_then(|v| v.as_u64()) {
                Some(2) => serde_json::from_value::<StateBlob>(value)?,
                Some(1) => legacy::parse_v1(value)?,
                Some(other) => return Err(PersistError::UnsupportedVersion(other as u32)),
                None => return Err(PersistError::Malformed("missing version".into())),
            }
        }
        Some(other) => {
            return Err(PersistError::SchemaMismatch {
                expected: STATE_SCHEMA.to_owned(),
                found: other.to_owned(),
            })
        }
        // No schema tag: the pre-versioning flat encoding.
        None => legacy::parse_flat(value, layout)?,
    };

    if blob.frames.is_some() != blob.current_event.is_some() {
        return Err(PersistError::Malformed(
            "frames without event code (or the reverse)".into(),
        ));
    }
    Ok(blob)
}

/// Apply a decoded blob onto a freshly constructed instance.
///
/// Events that queued concurrently during the restore stay ahead; the
/// blob's saved queue is merged behind them.
pub fn restore(inst: &ScriptInstance, blob: StateBlob) {
    let mut exec = inst.exec();
    let mut ctl = inst.ctl();

    exec.globals = blob.globals;
    exec.frames = blob.frames;
    exec.current_event = blob.current_event;
    exec.permissions = blob.permissions;
    exec.registrations = blob.registrations;
    exec.state_name = blob.state_name;
    exec.init_globals_pending = blob.init_globals_pending;

    ctl.running = blob.running;
    ctl.start_param = blob.start_param;
    ctl.queue
        .set_min_delay(std::time::Duration::from_millis(blob.min_event_delay_ms));
    for event in blob.queued {
        ctl.queue.restore_push(event);
    }
}

/// Append post-restore cause events in fixed priority order: rez-param
/// first, then attach, cross-region, teleport, region-restart.
pub fn append_cause_events(inst: &ScriptInstance, causes: &CauseEvents) {
    let mut ctl = inst.ctl();
    if let Some(param) = causes.rez_param {
        ctl.start_param = param;
        ctl.queue
            .restore_push(Event::new(EventKind::OnRez, [Value::Integer(param as i64)]));
    }
    if let Some(key) = &causes.attached_key {
        ctl.queue
            .restore_push(Event::new(EventKind::Attach, [Value::Key(key.clone())]));
    }
    if causes.crossed_region {
        ctl.queue.restore_push(Event::new(
            EventKind::Changed,
            [Value::Integer(CHANGED_REGION)],
        ));
    }
    if causes.teleported {
        ctl.queue.restore_push(Event::new(
            EventKind::Changed,
            [Value::Integer(CHANGED_TELEPORT)],
        ));
    }
    if causes.region_restart {
        ctl.queue.restore_push(Event::new(
            EventKind::Changed,
            [Value::Integer(CHANGED_REGION_START)],
        ));
    }
}

/// Load an instance's durable state, or initialize fresh.
///
/// Missing blob: fresh state plus a synthesized `state_entry` that will
/// (re)initialize all declared globals. Corrupt or mismatched blob: the
/// blob is discarded and the fresh path taken; construction never fails
/// on bad state.
///
/// Returns true when a blob was restored.
pub fn load_or_init(inst: &ScriptInstance, store: &dyn StateStore) -> anyhow::Result<bool> {
    let item = inst.item();
    match store.load(item)? {
        Some(bytes) => match decode(&bytes, inst.program().layout()) {
            Ok(blob) => {
                restore(inst, blob);
                debug!(%item, "restored durable state");
                Ok(true)
            }
            Err(err) => {
                warn!(%item, "discarding corrupt state blob: {err}");
                let _ = store.remove(item);
                init_fresh(inst);
                Ok(false)
            }
        },
        None => {
            init_fresh(inst);
            Ok(false)
        }
    }
}

/// Fresh-start path: globals stay pending initialization and a single
/// `state_entry` is queued.
pub fn init_fresh(inst: &ScriptInstance) {
    let mut exec = inst.exec();
    let mut ctl = inst.ctl();
    exec.init_globals_pending = true;
    ctl.queue.restore_push(Event::bare(EventKind::StateEntry));
}

/// Capture an instance and write it to the store.
pub fn snapshot_to(inst: &ScriptInstance, store: &dyn StateStore) -> anyhow::Result<()> {
    let blob = capture(inst);
    let bytes = encode(&blob)?;
    store.store(inst.item(), &bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests;

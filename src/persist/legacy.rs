//! Legacy state decoders
//!
//! Read-only support for two older encodings: the version-1 structured
//! schema this engine used to write, and the pre-versioning flat encoding
//! keyed by declared variable name. Neither is ever produced.

use serde::Deserialize;
use tracing::warn;

use super::{StateBlob, STATE_SCHEMA, STATE_VERSION};
use crate::error::{PersistError, PersistResult};
use crate::event::{Event, EventKind};
use crate::exec::Frame;
use crate::instance::{ListenerReg, Permissions, Registrations};
use crate::program::ProgramKey;
use crate::value::{Globals, SlotLayout, Value, ValueKind};

/// Version-1 structured layout. Field names differ from the current
/// schema; registrations were inlined.
#[derive(Debug, Deserialize)]
struct BlobV1 {
    #[allow(dead_code)]
    schema: String,
    #[allow(dead_code)]
    version: u32,
    key: ProgramKey,
    running: bool,
    globals_pending: bool,
    state: String,
    #[serde(default)]
    start_param: i32,
    /// Seconds, not milliseconds.
    #[serde(default)]
    min_delay: f64,
    globals: Globals,
    #[serde(default)]
    stack: Option<Vec<Frame>>,
    #[serde(default)]
    event: Option<Event>,
    #[serde(default)]
    perm: Option<Permissions>,
    #[serde(default)]
    queue: Vec<Event>,
    #[serde(default)]
    timer: Option<f64>,
    #[serde(default)]
    listeners: Vec<ListenerReg>,
    #[serde(default)]
    http: Vec<String>,
}

/// Parse a version-1 blob into the current shape.
pub(super) fn parse_v1(value: serde_json::Value) -> PersistResult<StateBlob> {
    let v1: BlobV1 = serde_json::from_value(value)?;
    Ok(StateBlob {
        schema: STATE_SCHEMA.to_owned(),
        version: STATE_VERSION,
        program_key: v1.key,
        running: v1.running,
        init_globals_pending: v1.globals_pending,
        state_name: v1.state,
        start_param: v1.start_param,
        min_event_delay_ms: (v1.min_delay * 1000.0) as u64,
        globals: v1.globals,
        frames: v1.stack,
        current_event: v1.event,
        permissions: v1.perm,
        queued: v1.queue,
        registrations: Registrations {
            timer_interval: v1.timer,
            listeners: v1.listeners,
            http_requests: v1.http,
        },
    })
}

/// Parse the flat encoding: a JSON object with `Variables` keyed by
/// declared name. Variables that no longer exist in the layout are
/// dropped with a warning; nothing mid-handler was ever captured by this
/// format.
pub(super) fn parse_flat(
    value: serde_json::Value,
    layout: &SlotLayout,
) -> PersistResult<StateBlob> {
    let object = value
        .as_object()
        .ok_or_else(|| PersistError::Malformed("flat blob is not an object".into()))?;
    let variables = object
        .get("Variables")
        .and_then(|v| v.as_object())
        .ok_or_else(|| PersistError::Malformed("flat blob without Variables".into()))?;

    let mut globals = Globals::sized_for(layout);
    for (name, raw) in variables {
        let Some(slot) = layout.slot_of(name) else {
            warn!(%name, "flat blob variable no longer declared, dropped");
            continue;
        };
        match value_for_slot(slot.kind, raw) {
            Some(value) => globals.set(slot, value),
            None => warn!(%name, "flat blob variable has incompatible shape, dropped"),
        }
    }

    let running = object
        .get("Running")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let state_name = object
        .get("State")
        .and_then(|v| v.as_str())
        .unwrap_or("default")
        .to_owned();
    let queued = object
        .get("Queue")
        .and_then(|v| v.as_array())
        .map(|names| {
            names
                .iter()
                .filter_map(|n| n.as_str())
                .filter_map(EventKind::from_name)
                .map(Event::bare)
                .collect()
        })
        .unwrap_or_default();

    Ok(StateBlob {
        schema: STATE_SCHEMA.to_owned(),
        version: STATE_VERSION,
        program_key: ProgramKey::from_asset("legacy-flat"),
        running,
        init_globals_pending: false,
        state_name,
        start_param: object
            .get("StartParam")
            .and_then(|v| v.as_i64())
            .unwrap_or(0) as i32,
        min_event_delay_ms: 0,
        globals,
        frames: None,
        current_event: None,
        permissions: None,
        queued,
        registrations: Registrations::default(),
    })
}

/// Coerce a flat-encoding JSON value onto a slot of the given kind.
fn value_for_slot(kind: ValueKind, raw: &serde_json::Value) -> Option<Value> {
    match kind {
        ValueKind::Integer => raw.as_i64().map(Value::Integer),
        ValueKind::Float => raw.as_f64().map(Value::Float),
        ValueKind::Str => raw.as_str().map(|s| Value::Str(s.to_owned())),
        ValueKind::Key => raw.as_str().map(|s| Value::Key(s.to_owned())),
        ValueKind::Vector => {
            let parts = raw.as_array()?;
            if parts.len() != 3 {
                return None;
            }
            let mut vector = [0.0; 3];
            for (i, part) in parts.iter().enumerate() {
                vector[i] = part.as_f64()?;
            }
            Some(Value::Vector(vector))
        }
        ValueKind::List => {
            let items = raw.as_array()?;
            let list = items
                .iter()
                .filter_map(|item| {
                    item.as_i64()
                        .map(Value::Integer)
                        .or_else(|| item.as_f64().map(Value::Float))
                        .or_else(|| item.as_str().map(|s| Value::Str(s.to_owned())))
                })
                .collect();
            Some(Value::List(list))
        }
    }
}

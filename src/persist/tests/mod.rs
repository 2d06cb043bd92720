use std::sync::Arc;
use std::time::Duration;

use crate::event::{Event, EventKind, CHANGED_REGION, CHANGED_TELEPORT};
use crate::exec::{ExecContext, Frame, Handler, HandlerOutcome};
use crate::instance::{
    ItemId, ListenerReg, ObjectId, Permissions, ScriptInstance,
};
use crate::persist::{
    append_cause_events, capture, decode, encode, load_or_init, restore, snapshot_to,
    CauseEvents, STATE_SCHEMA,
};
use crate::program::{CompiledProgram, ProgramBuilder, ProgramKey};
use crate::util::config::EngineConfig;
use crate::value::{Value, ValueKind};
use crate::world::{FileStateStore, StateStore};

struct Nop;

impl Handler for Nop {
    fn step(&self, _cx: &mut ExecContext<'_>) -> HandlerOutcome {
        HandlerOutcome::Completed
    }
}

fn program() -> Arc<CompiledProgram> {
    ProgramBuilder::new(ProgramKey::from_asset("persist-test"))
        .declare("counter", ValueKind::Integer)
        .declare("label", ValueKind::Str)
        .handler("default", EventKind::StateEntry, Arc::new(Nop))
        .handler("default", EventKind::TouchStart, Arc::new(Nop))
        .handler("default", EventKind::Timer, Arc::new(Nop))
        .handler("default", EventKind::OnRez, Arc::new(Nop))
        .handler("default", EventKind::Attach, Arc::new(Nop))
        .handler("default", EventKind::Changed, Arc::new(Nop))
        .build()
}

fn instance(program: &Arc<CompiledProgram>) -> ScriptInstance {
    let inst = ScriptInstance::new(
        ItemId(11),
        ObjectId(21),
        program.clone(),
        &EngineConfig::default(),
    );
    inst.finish_construct();
    inst
}

fn populate(inst: &ScriptInstance) {
    let layout = inst.program().layout().clone();
    {
        let mut exec = inst.exec();
        exec.init_globals_pending = false;
        exec.state_name = "default".to_owned();
        exec.globals
            .set(layout.slot_of("counter").unwrap(), Value::Integer(9));
        exec.globals
            .set(layout.slot_of("label").unwrap(), Value::Str("armed".into()));
        exec.permissions = Some(Permissions {
            granter: "avatar-1".into(),
            mask: 0x10,
        });
        exec.registrations.timer_interval = Some(1.5);
        exec.registrations.listeners.push(ListenerReg {
            channel: 4,
            name: String::new(),
            key: String::new(),
            message: String::new(),
        });
    }
    {
        let mut ctl = inst.ctl();
        ctl.start_param = 77;
        ctl.queue.restore_push(Event::bare(EventKind::Timer));
        ctl.queue.restore_push(Event::new(
            EventKind::TouchStart,
            [Value::Key("toucher".into())],
        ));
    }
    inst.set_min_event_delay(Duration::from_millis(250));
}

#[test]
fn capture_restore_round_trip() {
    let program = program();
    let source = instance(&program);
    populate(&source);

    let blob = capture(&source);
    let bytes = encode(&blob).unwrap();
    let decoded = decode(&bytes, program.layout()).unwrap();
    assert_eq!(decoded, blob);

    let target = instance(&program);
    restore(&target, decoded);
    let again = capture(&target);
    assert_eq!(again, blob);

    assert_eq!(target.start_param(), 77);
    assert_eq!(target.min_event_delay(), Duration::from_millis(250));
    let queued = target.ctl().queue.snapshot();
    assert_eq!(queued.len(), 2);
    assert_eq!(queued[0].kind, EventKind::Timer);
    assert_eq!(queued[1].kind, EventKind::TouchStart);
}

#[test]
fn mid_handler_frames_survive() {
    let program = program();
    let source = instance(&program);
    {
        let mut exec = source.exec();
        exec.init_globals_pending = false;
        exec.frames = Some(vec![Frame {
            pc: 3,
            locals: vec![Value::Integer(42)],
        }]);
        exec.current_event = Some(Event::bare(EventKind::Timer));
    }

    let bytes = encode(&capture(&source)).unwrap();
    let blob = decode(&bytes, program.layout()).unwrap();

    let frames = blob.frames.as_ref().unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].pc, 3);
    assert_eq!(frames[0].locals, vec![Value::Integer(42)]);
    assert_eq!(blob.current_event.as_ref().unwrap().kind, EventKind::Timer);
}

#[test]
fn frames_without_event_is_malformed() {
    let program = program();
    let source = instance(&program);
    let mut blob = capture(&source);
    blob.frames = Some(vec![Frame::new()]);
    let bytes = encode(&blob).unwrap();
    assert!(decode(&bytes, program.layout()).is_err());
}

#[test]
fn concurrent_events_stay_ahead_of_saved_queue() {
    let program = program();
    let source = instance(&program);
    {
        let mut ctl = source.ctl();
        ctl.queue.restore_push(Event::bare(EventKind::Timer));
    }
    let blob = capture(&source);

    let target = instance(&program);
    {
        let mut ctl = target.ctl();
        ctl.queue
            .restore_push(Event::new(EventKind::Changed, [Value::Integer(8)]));
    }
    restore(&target, blob);

    let queued = target.ctl().queue.snapshot();
    assert_eq!(queued.len(), 2);
    assert_eq!(queued[0].kind, EventKind::Changed);
    assert_eq!(queued[1].kind, EventKind::Timer);
}

#[test]
fn cause_events_arrive_in_fixed_order() {
    let program = program();
    let inst = instance(&program);
    append_cause_events(
        &inst,
        &CauseEvents {
            rez_param: Some(5),
            attached_key: Some("avatar-2".into()),
            crossed_region: true,
            teleported: true,
            region_restart: false,
        },
    );

    assert_eq!(inst.start_param(), 5);
    let queued = inst.ctl().queue.snapshot();
    let kinds: Vec<EventKind> = queued.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::OnRez,
            EventKind::Attach,
            EventKind::Changed,
            EventKind::Changed
        ]
    );
    assert_eq!(queued[0].params[0], Value::Integer(5));
    assert_eq!(queued[2].params[0], Value::Integer(CHANGED_REGION));
    assert_eq!(queued[3].params[0], Value::Integer(CHANGED_TELEPORT));
}

#[test]
fn missing_blob_initializes_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStateStore::new(dir.path()).unwrap();
    let program = program();
    let inst = instance(&program);

    let restored = load_or_init(&inst, &store).unwrap();
    assert!(!restored);
    assert!(inst.exec().init_globals_pending);
    let queued = inst.ctl().queue.snapshot();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].kind, EventKind::StateEntry);
}

#[test]
fn corrupt_blob_falls_back_to_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStateStore::new(dir.path()).unwrap();
    let program = program();
    let inst = instance(&program);

    store.store(inst.item(), b"{ not json").unwrap();
    let restored = load_or_init(&inst, &store).unwrap();
    assert!(!restored);
    // The bad blob is discarded, not kept around to fail again.
    assert!(store.load(inst.item()).unwrap().is_none());
    let queued = inst.ctl().queue.snapshot();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].kind, EventKind::StateEntry);
}

#[test]
fn snapshot_then_load_restores() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStateStore::new(dir.path()).unwrap();
    let program = program();
    let source = instance(&program);
    populate(&source);
    snapshot_to(&source, &store).unwrap();

    let target = instance(&program);
    let restored = load_or_init(&target, &store).unwrap();
    assert!(restored);
    assert_eq!(capture(&target), capture(&source));
}

#[test]
fn unknown_version_is_rejected() {
    let program = program();
    let bytes = format!(r#"{{"schema": "{STATE_SCHEMA}", "version": 99}}"#);
    assert!(decode(bytes.as_bytes(), program.layout()).is_err());
}

#[test]
fn foreign_schema_is_rejected() {
    let program = program();
    let bytes = br#"{"schema": "someone-elses-state", "version": 2}"#;
    assert!(decode(bytes, program.layout()).is_err());
}

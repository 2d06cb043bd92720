//! Script events
//!
//! Event kinds the core reasons about, the event payload carried through
//! the per-instance queue, and the admission-controlled queue itself.

pub mod queue;

pub use queue::{Admission, EventQueue, DEFAULT_QUEUE_CAP, THROTTLED_QUEUE_CAP};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::value::Value;

/// Change bits carried by a `changed` event's first parameter.
pub const CHANGED_POSITION: i64 = 1;
pub const CHANGED_SCALE: i64 = 2;
pub const CHANGED_INVENTORY: i64 = 4;
pub const CHANGED_OWNER: i64 = 8;
pub const CHANGED_REGION: i64 = 16;
pub const CHANGED_TELEPORT: i64 = 32;
pub const CHANGED_REGION_START: i64 = 64;

/// Event kinds deliverable to a script instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StateEntry,
    StateExit,
    OnRez,
    Attach,
    Timer,
    Listen,
    Sensor,
    NoSensor,
    TouchStart,
    Touch,
    TouchEnd,
    CollisionStart,
    Collision,
    CollisionEnd,
    LandCollision,
    Changed,
    Control,
    HttpResponse,
    Dataserver,
}

impl EventKind {
    /// Wire/diagnostic name, matching handler-table keys.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::StateEntry => "state_entry",
            EventKind::StateExit => "state_exit",
            EventKind::OnRez => "on_rez",
            EventKind::Attach => "attach",
            EventKind::Timer => "timer",
            EventKind::Listen => "listen",
            EventKind::Sensor => "sensor",
            EventKind::NoSensor => "no_sensor",
            EventKind::TouchStart => "touch_start",
            EventKind::Touch => "touch",
            EventKind::TouchEnd => "touch_end",
            EventKind::CollisionStart => "collision_start",
            EventKind::Collision => "collision",
            EventKind::CollisionEnd => "collision_end",
            EventKind::LandCollision => "land_collision",
            EventKind::Changed => "changed",
            EventKind::Control => "control",
            EventKind::HttpResponse => "http_response",
            EventKind::Dataserver => "dataserver",
        }
    }

    /// Parse a wire/diagnostic name.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "state_entry" => EventKind::StateEntry,
            "state_exit" => EventKind::StateExit,
            "on_rez" => EventKind::OnRez,
            "attach" => EventKind::Attach,
            "timer" => EventKind::Timer,
            "listen" => EventKind::Listen,
            "sensor" => EventKind::Sensor,
            "no_sensor" => EventKind::NoSensor,
            "touch_start" => EventKind::TouchStart,
            "touch" => EventKind::Touch,
            "touch_end" => EventKind::TouchEnd,
            "collision_start" => EventKind::CollisionStart,
            "collision" => EventKind::Collision,
            "collision_end" => EventKind::CollisionEnd,
            "land_collision" => EventKind::LandCollision,
            "changed" => EventKind::Changed,
            "control" => EventKind::Control,
            "http_response" => EventKind::HttpResponse,
            "dataserver" => EventKind::Dataserver,
            _ => return None,
        })
    }

    /// Whether the kind belongs to the collision family.
    #[inline]
    pub fn is_collision(&self) -> bool {
        matches!(
            self,
            EventKind::CollisionStart
                | EventKind::Collision
                | EventKind::CollisionEnd
                | EventKind::LandCollision
        )
    }

    /// Whether the kind belongs to the sensor family.
    #[inline]
    pub fn is_sensor(&self) -> bool {
        matches!(self, EventKind::Sensor | EventKind::NoSensor)
    }

    /// Whether the kind belongs to the touch family.
    #[inline]
    pub fn is_touch(&self) -> bool {
        matches!(
            self,
            EventKind::TouchStart | EventKind::Touch | EventKind::TouchEnd
        )
    }

    /// Kinds subject to the minimum-inter-event-delay throttle.
    ///
    /// `changed` is only nominally throttled; position/scale-only changes
    /// are exempted at admission because movement would otherwise starve
    /// every other change notification.
    #[inline]
    pub fn is_throttled(&self) -> bool {
        self.is_collision()
            || self.is_sensor()
            || self.is_touch()
            || matches!(
                self,
                EventKind::Listen | EventKind::Timer | EventKind::Changed
            )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A detected agent or object attached to an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectInfo {
    /// World identity key of what was detected.
    pub key: String,
    /// Display name.
    pub name: String,
    /// World position at detection time.
    pub position: [f64; 3],
    /// Velocity at detection time.
    pub velocity: [f64; 3],
}

/// One pending event: kind, positional parameters, detect records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event kind.
    pub kind: EventKind,
    /// Positional parameters handed to the handler.
    pub params: SmallVec<[Value; 4]>,
    /// Detection records, empty for most kinds.
    pub detect: SmallVec<[DetectInfo; 2]>,
}

impl Event {
    /// Event with parameters and no detect records.
    pub fn new(kind: EventKind, params: impl IntoIterator<Item = Value>) -> Self {
        Self {
            kind,
            params: params.into_iter().collect(),
            detect: SmallVec::new(),
        }
    }

    /// Bare event with no payload.
    #[inline]
    pub fn bare(kind: EventKind) -> Self {
        Self::new(kind, [])
    }

    /// Attach detect records.
    pub fn with_detect(mut self, detect: impl IntoIterator<Item = DetectInfo>) -> Self {
        self.detect = detect.into_iter().collect();
        self
    }

    /// The terminal detach signal: `attach` with a null cause key.
    pub fn is_detach(&self) -> bool {
        self.kind == EventKind::Attach
            && matches!(self.params.first(), Some(Value::Key(k)) if k.is_empty())
    }

    /// Whether a `changed` event carries only position/scale bits.
    pub fn is_position_scale_change(&self) -> bool {
        if self.kind != EventKind::Changed {
            return false;
        }
        match self.params.first() {
            Some(Value::Integer(bits)) => bits & !(CHANGED_POSITION | CHANGED_SCALE) == 0,
            _ => false,
        }
    }
}

//! Script value model
//!
//! Values crossing the host boundary: event parameters, global variable
//! slots, and everything that lands in the durable blob.

use serde::{Deserialize, Serialize};

use indexmap::IndexMap;

/// Primitive kind of a script value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    /// Signed integer.
    Integer,
    /// Double-precision float.
    Float,
    /// Text string.
    Str,
    /// World identity key.
    Key,
    /// Three-component vector.
    Vector,
    /// Heterogeneous list.
    List,
}

/// A script-visible value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Signed integer.
    Integer(i64),
    /// Double-precision float.
    Float(f64),
    /// Text string.
    Str(String),
    /// World identity key.
    Key(String),
    /// Three-component vector.
    Vector([f64; 3]),
    /// Heterogeneous list.
    List(Vec<Value>),
}

impl Value {
    /// Kind of this value.
    #[inline]
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Integer(_) => ValueKind::Integer,
            Value::Float(_) => ValueKind::Float,
            Value::Str(_) => ValueKind::Str,
            Value::Key(_) => ValueKind::Key,
            Value::Vector(_) => ValueKind::Vector,
            Value::List(_) => ValueKind::List,
        }
    }

    /// Default value for a kind (what a freshly initialized slot holds).
    pub fn default_for(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Integer => Value::Integer(0),
            ValueKind::Float => Value::Float(0.0),
            ValueKind::Str => Value::Str(String::new()),
            ValueKind::Key => Value::Key(String::new()),
            ValueKind::Vector => Value::Vector([0.0; 3]),
            ValueKind::List => Value::List(Vec::new()),
        }
    }

    /// Approximate heap footprint in bytes, used for heap-limit accounting.
    pub fn heap_size(&self) -> usize {
        match self {
            Value::Integer(_) | Value::Float(_) => 8,
            Value::Str(s) | Value::Key(s) => 16 + s.len(),
            Value::Vector(_) => 24,
            Value::List(items) => {
                16 + items.iter().map(Value::heap_size).sum::<usize>()
            }
        }
    }
}

/// Reference to one global slot: a kind group plus an index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRef {
    /// Kind group the slot lives in.
    pub kind: ValueKind,
    /// Index within the group.
    pub index: usize,
}

/// Declared global-variable layout of a compiled program.
///
/// Slots are grouped by primitive kind; the name table maps declared
/// variable names onto slots and is what the legacy flat encoding keys by.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlotLayout {
    /// Slot counts per kind group.
    pub counts: IndexMap<ValueKind, usize>,
    /// Declared name -> slot, in declaration order.
    pub names: IndexMap<String, SlotRef>,
}

impl SlotLayout {
    /// Builder-style: declare a named variable, appending a slot to its
    /// kind group.
    pub fn declare(&mut self, name: impl Into<String>, kind: ValueKind) -> SlotRef {
        let index = self.counts.entry(kind).or_insert(0);
        let slot = SlotRef { kind, index: *index };
        *index += 1;
        self.names.insert(name.into(), slot);
        slot
    }

    /// Slot count for a kind group.
    #[inline]
    pub fn count(&self, kind: ValueKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    /// Look up a declared variable by name.
    #[inline]
    pub fn slot_of(&self, name: &str) -> Option<SlotRef> {
        self.names.get(name).copied()
    }
}

/// Global-variable storage for one instance, sized from a [`SlotLayout`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Globals {
    integers: Vec<i64>,
    floats: Vec<f64>,
    strings: Vec<String>,
    keys: Vec<String>,
    vectors: Vec<[f64; 3]>,
    lists: Vec<Vec<Value>>,
}

impl Globals {
    /// Allocate storage sized to the layout, all slots default-initialized.
    pub fn sized_for(layout: &SlotLayout) -> Self {
        Self {
            integers: vec![0; layout.count(ValueKind::Integer)],
            floats: vec![0.0; layout.count(ValueKind::Float)],
            strings: vec![String::new(); layout.count(ValueKind::Str)],
            keys: vec![String::new(); layout.count(ValueKind::Key)],
            vectors: vec![[0.0; 3]; layout.count(ValueKind::Vector)],
            lists: vec![Vec::new(); layout.count(ValueKind::List)],
        }
    }

    /// Reset every slot to its kind default.
    pub fn clear(&mut self) {
        self.integers.iter_mut().for_each(|v| *v = 0);
        self.floats.iter_mut().for_each(|v| *v = 0.0);
        self.strings.iter_mut().for_each(String::clear);
        self.keys.iter_mut().for_each(String::clear);
        self.vectors.iter_mut().for_each(|v| *v = [0.0; 3]);
        self.lists.iter_mut().for_each(Vec::clear);
    }

    /// Read a slot. Out-of-range reads yield the kind default so a restored
    /// blob from an older layout cannot panic the engine.
    pub fn get(&self, slot: SlotRef) -> Value {
        match slot.kind {
            ValueKind::Integer => {
                Value::Integer(self.integers.get(slot.index).copied().unwrap_or(0))
            }
            ValueKind::Float => Value::Float(self.floats.get(slot.index).copied().unwrap_or(0.0)),
            ValueKind::Str => Value::Str(self.strings.get(slot.index).cloned().unwrap_or_default()),
            ValueKind::Key => Value::Key(self.keys.get(slot.index).cloned().unwrap_or_default()),
            ValueKind::Vector => {
                Value::Vector(self.vectors.get(slot.index).copied().unwrap_or([0.0; 3]))
            }
            ValueKind::List => Value::List(self.lists.get(slot.index).cloned().unwrap_or_default()),
        }
    }

    /// Write a slot. Kind mismatches and out-of-range writes are dropped,
    /// so loading an older blob onto a newer layout degrades quietly.
    pub fn set(&mut self, slot: SlotRef, value: Value) {
        match (slot.kind, value) {
            (ValueKind::Integer, Value::Integer(v)) => {
                if let Some(s) = self.integers.get_mut(slot.index) {
                    *s = v;
                }
            }
            (ValueKind::Float, Value::Float(v)) => {
                if let Some(s) = self.floats.get_mut(slot.index) {
                    *s = v;
                }
            }
            (ValueKind::Str, Value::Str(v)) => {
                if let Some(s) = self.strings.get_mut(slot.index) {
                    *s = v;
                }
            }
            (ValueKind::Key, Value::Key(v)) => {
                if let Some(s) = self.keys.get_mut(slot.index) {
                    *s = v;
                }
            }
            (ValueKind::Vector, Value::Vector(v)) => {
                if let Some(s) = self.vectors.get_mut(slot.index) {
                    *s = v;
                }
            }
            (ValueKind::List, Value::List(v)) => {
                if let Some(s) = self.lists.get_mut(slot.index) {
                    *s = v;
                }
            }
            _ => {}
        }
    }

    /// Approximate heap footprint of all slots.
    pub fn heap_size(&self) -> usize {
        let strings: usize = self.strings.iter().map(|s| 16 + s.len()).sum();
        let keys: usize = self.keys.iter().map(|s| 16 + s.len()).sum();
        let lists: usize = self
            .lists
            .iter()
            .map(|l| 16 + l.iter().map(Value::heap_size).sum::<usize>())
            .sum();
        self.integers.len() * 8 + self.floats.len() * 8 + self.vectors.len() * 24
            + strings
            + keys
            + lists
    }
}

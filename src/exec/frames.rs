//! Resumable handler frames
//!
//! Handlers are compiled to step functions with externalized locals, so a
//! captured stack is plain data: a program counter plus locals per frame.
//! That is what makes mid-handler state durable across a process restart.

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// One resumable frame of an in-progress handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Step the handler resumes from.
    pub pc: usize,
    /// Externalized locals.
    pub locals: Vec<Value>,
}

impl Frame {
    /// Fresh frame at step zero.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame with pre-sized locals.
    pub fn with_locals(count: usize) -> Self {
        Self {
            pc: 0,
            locals: vec![Value::Integer(0); count],
        }
    }
}

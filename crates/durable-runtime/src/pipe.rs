//! Pipes (§4.6): typed event sources. `dispatch(input)` appends an event
//! record and notifies every job naming the pipe in its `triggers`.

use std::sync::Arc;

use serde_json::Value;

/// An optional transform applied to a pipe's input before it reaches a
/// triggered job, via `Pipe::into(transform)` (§6).
pub type Transform = Arc<dyn Fn(Value) -> Value + Send + Sync>;

pub struct Pipe {
    pub id: String,
}

impl Pipe {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// A pipe with a transform applied before reaching triggered jobs,
/// produced by `Pipe::into(transform)`.
pub struct TransformedPipe {
    pub pipe_id: String,
    pub transform: Transform,
}

impl Pipe {
    pub fn transformed(&self, transform: Transform) -> TransformedPipe {
        TransformedPipe {
            pipe_id: self.id.clone(),
            transform,
        }
    }
}

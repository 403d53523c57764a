//! Runtime-level failures: job/pipe registration conflicts and queue
//! lifecycle misuse, distinct from per-step [`durable_journal::ExecutionError`].

use durable_journal::ExecutionError;
use durable_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("job {0:?} is already registered on this queue")]
    DuplicateJob(String),

    #[error("pipe {0:?} is already registered on this queue")]
    DuplicatePipe(String),

    #[error("unknown job {0:?}")]
    UnknownJob(String),

    #[error("unknown pipe {0:?}")]
    UnknownPipe(String),

    #[error("queue {0:?} is closed")]
    QueueClosed(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("invalid task input: {0}")]
    InvalidInput(String),
}

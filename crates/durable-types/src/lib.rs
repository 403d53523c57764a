pub mod duration;
pub mod error;
pub mod event_key;
pub mod filter;
pub mod invariants;
pub mod key;
pub mod status;
pub mod step_name;
pub mod value;

pub use duration::{Backoff, Frequency, RETRY_TABLE};
pub use error::{ErrorKind, SerializedError, TypeError};
pub use event_key::{EventKey, JOB_LIFECYCLE_EVENTS};
pub use filter::matches_filter;
pub use invariants::TransitionViolation;
pub use key::compute_key;
pub use status::{StepStatus, TaskStatus};
pub use step_name::{StepCounters, StepName, StepNamespace};
pub use value::canonicalize;

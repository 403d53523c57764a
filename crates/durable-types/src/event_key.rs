//! Event key construction: `job/<job_id>/<event>` and `pipe/<pipe_id>`.

use std::fmt;

/// The fixed set of lifecycle events a job fires.
pub const JOB_LIFECYCLE_EVENTS: &[&str] =
    &["trigger", "start", "run", "success", "error", "cancel", "settled"];

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventKey {
    Job { job_id: String, event: String },
    Pipe { pipe_id: String },
}

impl EventKey {
    pub fn job(job_id: impl Into<String>, event: impl Into<String>) -> Self {
        Self::Job {
            job_id: job_id.into(),
            event: event.into(),
        }
    }

    pub fn pipe(pipe_id: impl Into<String>) -> Self {
        Self::Pipe {
            pipe_id: pipe_id.into(),
        }
    }

    /// Parse a raw event key string back into its structured form.
    pub fn parse(raw: &str) -> Option<Self> {
        if let Some(rest) = raw.strip_prefix("pipe/") {
            return Some(Self::pipe(rest));
        }
        if let Some(rest) = raw.strip_prefix("job/") {
            let (job_id, event) = rest.rsplit_once('/')?;
            return Some(Self::job(job_id, event));
        }
        None
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Job { job_id, event } => write!(f, "job/{job_id}/{event}"),
            Self::Pipe { pipe_id } => write!(f, "pipe/{pipe_id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_job_and_pipe_keys() {
        assert_eq!(EventKey::job("aaa", "success").to_string(), "job/aaa/success");
        assert_eq!(EventKey::pipe("p").to_string(), "pipe/p");
    }

    #[test]
    fn parses_round_trip() {
        let job = EventKey::job("aaa", "success");
        assert_eq!(EventKey::parse(&job.to_string()), Some(job));

        let pipe = EventKey::pipe("p");
        assert_eq!(EventKey::parse(&pipe.to_string()), Some(pipe));
    }
}

//! Step logical names.
//!
//! A step's identity is `user/<id>#<index>` or `system/<name>#<index>`,
//! where `<index>` is a per-name monotonic counter restarted at zero at
//! the top of the task function. Two parallel namespaces (`user`,
//! `system`) keep system-issued steps (sleep, wait_for, dispatch,
//! cancel, parse-input, parse-output) from colliding with user-chosen
//! step ids.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepNamespace {
    User,
    System,
}

impl fmt::Display for StepNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::System => write!(f, "system"),
        }
    }
}

/// A fully-qualified step name, e.g. `user/my-id#0` or `system/sleep#3`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepName {
    pub namespace: StepNamespace,
    pub id: String,
    pub index: u32,
}

impl StepName {
    pub fn user(id: impl Into<String>, index: u32) -> Self {
        Self {
            namespace: StepNamespace::User,
            id: id.into(),
            index,
        }
    }

    pub fn system(id: impl Into<String>, index: u32) -> Self {
        Self {
            namespace: StepNamespace::System,
            id: id.into(),
            index,
        }
    }

    /// Parse a step name of the form `<namespace>/<id>#<index>`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (namespace, rest) = raw.split_once('/')?;
        let namespace = match namespace {
            "user" => StepNamespace::User,
            "system" => StepNamespace::System,
            _ => return None,
        };
        let (id, index) = rest.rsplit_once('#')?;
        let index: u32 = index.parse().ok()?;
        Some(Self {
            namespace,
            id: id.to_string(),
            index,
        })
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.namespace, self.id, self.index)
    }
}

/// Per-function-invocation counters assigning the next index for each
/// (namespace, id) pair reached during one replay pass. Restarted at the
/// top of every task function invocation.
#[derive(Debug, Default)]
pub struct StepCounters {
    counts: std::collections::HashMap<(StepNamespace, String), u32>,
}

impl StepCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next step name for `id` in `namespace`, bumping its
    /// counter.
    pub fn next(&mut self, namespace: StepNamespace, id: &str) -> StepName {
        let entry = self.counts.entry((namespace, id.to_string())).or_insert(0);
        let index = *entry;
        *entry += 1;
        StepName {
            namespace,
            id: id.to_string(),
            index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_roundtrip() {
        let name = StepName::user("add-one", 3);
        let text = name.to_string();
        assert_eq!(text, "user/add-one#3");
        assert_eq!(StepName::parse(&text), Some(name));
    }

    #[test]
    fn user_and_system_counters_are_independent() {
        let mut counters = StepCounters::new();
        let u0 = counters.next(StepNamespace::User, "step");
        let s0 = counters.next(StepNamespace::System, "step");
        let u1 = counters.next(StepNamespace::User, "step");

        assert_eq!(u0.index, 0);
        assert_eq!(s0.index, 0);
        assert_eq!(u1.index, 1);
    }

    #[test]
    fn repeated_call_sites_restart_per_counters_instance() {
        let mut first_pass = StepCounters::new();
        let a = first_pass.next(StepNamespace::User, "loop-step");
        let b = first_pass.next(StepNamespace::User, "loop-step");
        assert_eq!((a.index, b.index), (0, 1));

        let mut second_pass = StepCounters::new();
        let a2 = second_pass.next(StepNamespace::User, "loop-step");
        assert_eq!(a2.index, 0, "a fresh replay pass restarts indices at zero");
    }
}

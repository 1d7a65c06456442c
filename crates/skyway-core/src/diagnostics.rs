//! Bounded record of degraded evaluations.
//!
//! Selector failures, misconfigured policy rules, dropped job updates and
//! unresolved references never fail an event; they land here instead.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    SelectorCompile,
    SelectorEval,
    PolicyEval,
    VariableResolution,
    JobState,
    Internal,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SelectorCompile => "selector_compile",
            Self::SelectorEval => "selector_eval",
            Self::PolicyEval => "policy_eval",
            Self::VariableResolution => "variable_resolution",
            Self::JobState => "job_state",
            Self::Internal => "internal",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Monotonic per workspace.
    pub seq: u64,
    pub kind: DiagnosticKind,
    /// What the diagnostic is about, e.g. `environment/prod`.
    pub subject: String,
    pub message: String,
}

#[derive(Debug)]
struct Ring {
    next_seq: u64,
    entries: VecDeque<Diagnostic>,
}

/// Ring buffer of the most recent diagnostics.
#[derive(Debug)]
pub struct Diagnostics {
    capacity: usize,
    ring: Mutex<Ring>,
}

impl Diagnostics {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ring: Mutex::new(Ring {
                next_seq: 0,
                entries: VecDeque::new(),
            }),
        }
    }

    pub fn record(&self, kind: DiagnosticKind, subject: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(
            event = "diagnostic.recorded",
            kind = %kind,
            subject = %subject,
            message = %message,
        );
        let mut ring = self.ring.lock();
        let seq = ring.next_seq;
        ring.next_seq += 1;
        if ring.entries.len() == self.capacity {
            ring.entries.pop_front();
        }
        ring.entries.push_back(Diagnostic {
            seq,
            kind,
            subject: subject.to_string(),
            message,
        });
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.ring.lock().entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.ring.lock().entries.clear();
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_DIAGNOSTICS)
    }
}

//! Failure classes and the once-per-class "last error" report.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{error, warn};

use crate::output::Output;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Offset discovery could not confirm a field group.
    Calibration,
    /// A secondary probe could not be placed in a binary.
    Attachment,
    /// A single event could not be decoded or resolved.
    Transient,
    /// The agent exceeded its own resource limits.
    ResourceLimit,
    /// A probe program failed to load or start.
    ProbeHost,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureClass::Calibration => "calibration",
            FailureClass::Attachment => "attachment",
            FailureClass::Transient => "transient",
            FailureClass::ResourceLimit => "resource_limit",
            FailureClass::ProbeHost => "probe_host",
        };
        f.write_str(s)
    }
}

/// Forwards failures to the output boundary, at most once per class.
pub struct LastErrorReporter {
    source: String,
    output: Arc<dyn Output>,
    reported: Mutex<HashSet<FailureClass>>,
}

impl LastErrorReporter {
    pub fn new(source: &str, output: Arc<dyn Output>) -> Self {
        Self {
            source: source.to_string(),
            output,
            reported: Mutex::new(HashSet::new()),
        }
    }

    /// Log the failure and report it if its class has not been reported yet.
    /// Returns true if a report was issued.
    pub fn report(&self, class: FailureClass, err: &anyhow::Error) -> bool {
        error!(class = %class, "{:#}", err);
        if !self
            .reported
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(class)
        {
            return false;
        }
        let message = format!("{class}: {err:#}");
        if let Err(e) = self.output.report_fatal_error(&self.source, &message) {
            warn!("Failed to report last error: {:#}", e);
        }
        true
    }
}

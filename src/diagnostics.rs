//! Construction-time diagnostics for backward-graph nodes.
//!
//! Nodes take a [`Diagnostics`] value when they are built and read it exactly
//! once: at [`CallStackLevel::Full`] the construction call stack is captured
//! and kept for inspection, at any other level nothing happens. The setting
//! has no effect on computation.

use std::backtrace::Backtrace;

/// How much construction context to record for graph nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallStackLevel {
    #[default]
    Off,
    Summary,
    /// Capture a full call stack at node construction.
    Full,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Diagnostics {
    level: CallStackLevel,
}

impl Diagnostics {
    pub fn new(level: CallStackLevel) -> Self {
        Diagnostics { level }
    }

    pub fn level(&self) -> CallStackLevel {
        self.level
    }

    /// Captures the current call stack when the level asks for it.
    pub fn forward_trace(&self) -> Option<String> {
        if self.level == CallStackLevel::Full {
            Some(Backtrace::force_capture().to_string())
        } else {
            None
        }
    }
}

//! Data lines for the benchmark harness.
//!
//! Each event carries a tag to group values by, how the harness should
//! aggregate them, and which half of the tool produced them.

use std::fmt::Display;

use tracing::info;

/// Tracing target of every telemetry event.
pub const TELEMETRY_TARGET: &str = "lazyjit::telemetry";

/// How the harness aggregates values of one tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    /// List every value.
    List,
    /// Average all values.
    Average,
}

impl LogKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LogKind::List => "LIST",
            LogKind::Average => "AVERAGE",
        }
    }
}

/// Which part of the tool emitted the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogPart {
    FrontEnd,
    BackEnd,
}

impl LogPart {
    pub fn as_str(self) -> &'static str {
        match self {
            LogPart::FrontEnd => "FRONT-END",
            LogPart::BackEnd => "BACK-END",
        }
    }
}

/// Emit one data point.
pub fn log_data(tag: &str, kind: LogKind, part: LogPart, value: impl Display) {
    info!(
        target: TELEMETRY_TARGET,
        tag,
        kind = kind.as_str(),
        part = part.as_str(),
        "{value}"
    );
}

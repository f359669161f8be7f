use thiserror::Error;

use crate::stroke::StrokeId;

/// Errors raised by the replica-side document model.
///
/// None of these are fatal to a session: callers log and discard the
/// offending input, and local editing carries on.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("Unknown stroke: {0}")]
    UnknownStroke(StrokeId),
    #[error("Malformed event: {0}")]
    MalformedEvent(String),
    #[error("Invalid color: {0}")]
    InvalidColor(String),
    #[error("Gesture already open: {0}")]
    GestureOpen(StrokeId),
    #[error("No open gesture for stroke {0}")]
    NoOpenGesture(StrokeId),
    #[error("Page {page} out of range 1..={total}")]
    PageOutOfRange { page: u32, total: u32 },
}

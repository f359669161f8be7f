//! Incremental board events exchanged between replicas.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;
use crate::snapshot::AttachedFile;
use crate::stroke::{validate_points, Point, Stroke, StrokeId};

/// Tool attribute named by a `tool-changed` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolField {
    Tool,
    Color,
    Width,
}

impl fmt::Display for ToolField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolField::Tool => f.write_str("tool"),
            ToolField::Color => f.write_str("color"),
            ToolField::Width => f.write_str("width"),
        }
    }
}

/// One small delta describing a change to the shared board.
///
/// `StrokeAppend` always carries the full cumulative point list, so
/// replaying it is idempotent and a lost append is repaired by the next one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BoardEvent {
    /// New stroke, carrying its first point only.
    StrokeBegin { stroke: Stroke },
    StrokeAppend { stroke_id: StrokeId, points: Vec<Point> },
    StrokeEnd { stroke_id: StrokeId },
    Undo { stroke_id: StrokeId },
    /// Restored stroke, verbatim.
    Redo { stroke: Stroke },
    Clear,
    SetPage { page: u32 },
    ToolChanged { field: ToolField, value: String },
    AttachFile { file: AttachedFile },
}

impl BoardEvent {
    /// Short event name for logs, matching the wire tag.
    pub fn name(&self) -> &'static str {
        match self {
            BoardEvent::StrokeBegin { .. } => "stroke-begin",
            BoardEvent::StrokeAppend { .. } => "stroke-append",
            BoardEvent::StrokeEnd { .. } => "stroke-end",
            BoardEvent::Undo { .. } => "undo",
            BoardEvent::Redo { .. } => "redo",
            BoardEvent::Clear => "clear",
            BoardEvent::SetPage { .. } => "set-page",
            BoardEvent::ToolChanged { .. } => "tool-changed",
            BoardEvent::AttachFile { .. } => "attach-file",
        }
    }

    /// The stroke this event targets, if any.
    pub fn stroke_id(&self) -> Option<StrokeId> {
        match self {
            BoardEvent::StrokeBegin { stroke } | BoardEvent::Redo { stroke } => Some(stroke.id),
            BoardEvent::StrokeAppend { stroke_id, .. }
            | BoardEvent::StrokeEnd { stroke_id }
            | BoardEvent::Undo { stroke_id } => Some(*stroke_id),
            _ => None,
        }
    }

    /// Point-append events are high frequency and may be coalesced.
    pub fn is_append(&self) -> bool {
        matches!(self, BoardEvent::StrokeAppend { .. })
    }

    /// Page navigation and file attachment belong to the teacher.
    pub fn is_teacher_only(&self) -> bool {
        matches!(self, BoardEvent::SetPage { .. } | BoardEvent::AttachFile { .. })
    }

    /// Reject events that must never be applied.
    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            BoardEvent::StrokeBegin { stroke } => {
                stroke.validate()?;
                if stroke.points.is_empty() {
                    return Err(CoreError::MalformedEvent(format!(
                        "stroke-begin {} without a first point",
                        stroke.id
                    )));
                }
                Ok(())
            }
            BoardEvent::StrokeAppend { stroke_id, points } => {
                if points.is_empty() {
                    return Err(CoreError::MalformedEvent(format!(
                        "stroke-append {stroke_id} without points"
                    )));
                }
                validate_points(points)
            }
            BoardEvent::Redo { stroke } => {
                stroke.validate()?;
                if !stroke.is_renderable() {
                    return Err(CoreError::MalformedEvent(format!(
                        "redo of unrenderable stroke {}",
                        stroke.id
                    )));
                }
                Ok(())
            }
            BoardEvent::SetPage { page } if *page == 0 => {
                Err(CoreError::MalformedEvent("set-page 0".to_string()))
            }
            BoardEvent::AttachFile { file } if file.page_count == 0 => Err(
                CoreError::MalformedEvent(format!("attached file {} has no pages", file.name)),
            ),
            _ => Ok(()),
        }
    }
}

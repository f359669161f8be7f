//! Authoritative shared document state.
//!
//! [`DocumentSnapshot::apply`] is the store-side rule set: the relay runs
//! every accepted event through it before fanning the event out, and
//! pollers receive the result as a whole.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::event::BoardEvent;
use crate::stroke::{Stroke, StrokeId};

/// Reference to a rasterizable document attached to the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedFile {
    pub name: String,
    /// Where replicas fetch the content from (URL or storage key).
    pub locator: String,
    pub page_count: u32,
}

/// Complete authoritative copy of one session's board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    /// Bumped on every accepted change.
    pub revision: u64,
    /// Insertion order is z-order.
    pub strokes: Vec<Stroke>,
    pub active_page: u32,
    pub attached_file: Option<AttachedFile>,
    /// Most recent ids deleted by undo or clear, oldest first.
    pub tombstones: Vec<StrokeId>,
}

impl Default for DocumentSnapshot {
    fn default() -> Self {
        Self {
            revision: 0,
            strokes: Vec::new(),
            active_page: 1,
            attached_file: None,
            tombstones: Vec::new(),
        }
    }
}

impl DocumentSnapshot {
    pub const MAX_TOMBSTONES: usize = 1024;

    pub fn new() -> Self {
        Self::default()
    }

    /// Page count of the attached file, or 1 for a plain board.
    pub fn total_pages(&self) -> u32 {
        total_pages(self.attached_file.as_ref())
    }

    pub fn stroke(&self, id: &StrokeId) -> Option<&Stroke> {
        self.strokes.iter().find(|s| s.id == *id)
    }

    pub fn contains(&self, id: &StrokeId) -> bool {
        self.stroke(id).is_some()
    }

    pub fn is_tombstoned(&self, id: &StrokeId) -> bool {
        self.tombstones.contains(id)
    }

    /// Apply an accepted event. Returns `Ok(true)` when the document changed.
    ///
    /// Replays are harmless: begins are idempotent by id, appends carry
    /// cumulative points and never shrink a stroke, and a begin for a
    /// tombstoned id is ignored so a duplicated delivery cannot resurrect
    /// a deleted stroke.
    pub fn apply(&mut self, event: &BoardEvent) -> Result<bool, CoreError> {
        event.validate()?;
        let changed = match event {
            BoardEvent::StrokeBegin { stroke } => {
                if self.contains(&stroke.id) || self.is_tombstoned(&stroke.id) {
                    false
                } else {
                    self.strokes.push(stroke.clone());
                    true
                }
            }
            BoardEvent::StrokeAppend { stroke_id, points } => {
                let tombstoned = self.is_tombstoned(stroke_id);
                match self.strokes.iter_mut().find(|s| s.id == *stroke_id) {
                    Some(stroke) if points.len() > stroke.points.len() => {
                        stroke.points = points.clone();
                        true
                    }
                    Some(_) => false,
                    None if tombstoned => false,
                    None => return Err(CoreError::UnknownStroke(*stroke_id)),
                }
            }
            BoardEvent::StrokeEnd { .. } | BoardEvent::ToolChanged { .. } => false,
            BoardEvent::Undo { stroke_id } => {
                let before = self.strokes.len();
                self.strokes.retain(|s| s.id != *stroke_id);
                if self.strokes.len() != before {
                    self.tombstone(*stroke_id);
                    true
                } else {
                    false
                }
            }
            BoardEvent::Redo { stroke } => {
                if self.contains(&stroke.id) {
                    false
                } else {
                    self.tombstones.retain(|id| *id != stroke.id);
                    self.strokes.push(stroke.clone());
                    true
                }
            }
            BoardEvent::Clear => {
                let removed: Vec<StrokeId> = self.strokes.drain(..).map(|s| s.id).collect();
                for id in &removed {
                    self.tombstone(*id);
                }
                !removed.is_empty()
            }
            BoardEvent::SetPage { page } => {
                let total = self.total_pages();
                if *page > total {
                    return Err(CoreError::PageOutOfRange { page: *page, total });
                }
                if self.active_page == *page {
                    false
                } else {
                    self.active_page = *page;
                    true
                }
            }
            BoardEvent::AttachFile { file } => {
                self.attached_file = Some(file.clone());
                self.active_page = 1;
                true
            }
        };
        if changed {
            self.revision += 1;
        }
        Ok(changed)
    }

    fn tombstone(&mut self, id: StrokeId) {
        if self.tombstones.contains(&id) {
            return;
        }
        self.tombstones.push(id);
        if self.tombstones.len() > Self::MAX_TOMBSTONES {
            let excess = self.tombstones.len() - Self::MAX_TOMBSTONES;
            self.tombstones.drain(..excess);
        }
    }
}

pub(crate) fn total_pages(file: Option<&AttachedFile>) -> u32 {
    file.map(|f| f.page_count.max(1)).unwrap_or(1)
}

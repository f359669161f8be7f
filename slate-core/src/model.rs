//! Local stroke model: the replica's ordered stroke list plus its
//! undo/redo history.
//!
//! ## Design
//!
//! - Strokes are kept in insertion order, which is also z-order.
//! - At most one gesture is open at a time; only it accepts new points.
//! - `undo` removes the top-most stroke of this replica's own and pushes it
//!   on the undo stack.
//! - `redo` pops the undo stack, restores the stroke verbatim and records it
//!   on the redo stack.
//! - Stacks are never transmitted; callers publish individual undo/redo
//!   events instead.

use crate::error::CoreError;
use crate::stroke::{Color, Point, ReplicaId, StampClock, Stroke, StrokeId, StrokeMode};

#[derive(Debug, Clone)]
pub struct StrokeModel {
    origin: ReplicaId,
    strokes: Vec<Stroke>,
    undo_stack: Vec<Stroke>,
    redo_stack: Vec<Stroke>,
    open: Option<StrokeId>,
    clock: StampClock,
}

impl StrokeModel {
    pub fn new(origin: ReplicaId) -> Self {
        Self {
            origin,
            strokes: Vec::new(),
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            open: None,
            clock: StampClock::new(),
        }
    }

    pub fn origin(&self) -> ReplicaId {
        self.origin
    }

    pub fn strokes(&self) -> &[Stroke] {
        &self.strokes
    }

    pub fn len(&self) -> usize {
        self.strokes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strokes.is_empty()
    }

    pub fn stroke(&self, id: &StrokeId) -> Option<&Stroke> {
        self.strokes.iter().find(|s| s.id == *id)
    }

    pub fn contains(&self, id: &StrokeId) -> bool {
        self.stroke(id).is_some()
    }

    /// The in-progress gesture, if the local user is drawing.
    pub fn open_gesture(&self) -> Option<StrokeId> {
        self.open
    }

    pub fn undo_stack(&self) -> &[Stroke] {
        &self.undo_stack
    }

    pub fn redo_stack(&self) -> &[Stroke] {
        &self.redo_stack
    }

    /// Whether `id` was removed by a local undo and not restored since.
    pub fn is_undone(&self, id: &StrokeId) -> bool {
        self.undo_stack.iter().any(|s| s.id == *id)
    }

    /// Open a new gesture.
    pub fn begin_stroke(
        &mut self,
        mode: StrokeMode,
        color: Color,
        width: f32,
        page: u32,
    ) -> Result<StrokeId, CoreError> {
        if let Some(open) = self.open {
            return Err(CoreError::GestureOpen(open));
        }
        let id = StrokeId::new(self.origin, self.clock.next());
        self.strokes.push(Stroke::new(id, page.max(1), mode, color, width));
        self.open = Some(id);
        Ok(id)
    }

    /// Append a point to the open gesture. Returns the new point count.
    pub fn append_point(&mut self, id: StrokeId, point: Point) -> Result<usize, CoreError> {
        if self.open != Some(id) {
            return Err(CoreError::NoOpenGesture(id));
        }
        if !point.is_finite() {
            return Err(CoreError::MalformedEvent(format!("non-numeric point for {id}")));
        }
        let stroke = self
            .strokes
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(CoreError::UnknownStroke(id))?;
        stroke.points.push(point);
        Ok(stroke.points.len())
    }

    /// Close the open gesture.
    ///
    /// A gesture with fewer than two points is discarded and `None` is
    /// returned; it never becomes visible to anyone.
    pub fn end_stroke(&mut self, id: StrokeId) -> Result<Option<Stroke>, CoreError> {
        if self.open != Some(id) {
            return Err(CoreError::NoOpenGesture(id));
        }
        self.open = None;
        let index = self
            .position(&id)
            .ok_or(CoreError::UnknownStroke(id))?;
        if self.strokes[index].is_renderable() {
            Ok(Some(self.strokes[index].clone()))
        } else {
            self.strokes.remove(index);
            Ok(None)
        }
    }

    /// Remove the top-most stroke drawn by this replica.
    ///
    /// Peer strokes are never undone here. No-op when this replica has no
    /// stroke on the board or mid-gesture.
    pub fn undo(&mut self) -> Option<Stroke> {
        if self.open.is_some() {
            return None;
        }
        let index = self.strokes.iter().rposition(|s| s.origin == self.origin)?;
        let stroke = self.strokes.remove(index);
        if self.redo_stack.last().map(|s| s.id) == Some(stroke.id) {
            self.redo_stack.pop();
        }
        self.undo_stack.push(stroke.clone());
        Some(stroke)
    }

    /// Restore the most recently undone stroke.
    ///
    /// Entries whose stroke is already back in the list (a peer restored it
    /// first) are skipped.
    pub fn redo(&mut self) -> Option<Stroke> {
        if self.open.is_some() {
            return None;
        }
        while let Some(stroke) = self.undo_stack.pop() {
            if self.contains(&stroke.id) {
                continue;
            }
            self.strokes.push(stroke.clone());
            self.redo_stack.push(stroke.clone());
            return Some(stroke);
        }
        None
    }

    /// Reset everything, closing any open gesture.
    pub fn clear(&mut self) {
        self.strokes.clear();
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.open = None;
    }

    pub(crate) fn position(&self, id: &StrokeId) -> Option<usize> {
        self.strokes.iter().position(|s| s.id == *id)
    }

    pub(crate) fn stroke_mut(&mut self, id: &StrokeId) -> Option<&mut Stroke> {
        self.strokes.iter_mut().find(|s| s.id == *id)
    }

    pub(crate) fn push(&mut self, stroke: Stroke) {
        self.strokes.push(stroke);
    }

    pub(crate) fn remove(&mut self, id: &StrokeId) -> Option<Stroke> {
        let index = self.position(id)?;
        Some(self.strokes.remove(index))
    }

    pub(crate) fn retain(&mut self, keep: impl FnMut(&Stroke) -> bool) {
        self.strokes.retain(keep);
    }

    pub(crate) fn replace_strokes(&mut self, strokes: Vec<Stroke>) {
        self.strokes = strokes;
    }

    pub(crate) fn clear_history(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }
}

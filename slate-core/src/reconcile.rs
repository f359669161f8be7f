//! Reconciliation engine: merges locally pending edits with whatever the
//! active transports deliver.
//!
//! ## Architecture
//!
//! ```text
//! local input ──► Replica (StrokeModel + bookkeeping) ──► RenderRequest
//!                      ▲                ▲
//!       ingest_event() │                │ ingest_snapshot()
//!   (broadcast / push) │                │ (init-state / poll)
//! ```
//!
//! Snapshot merge rules:
//! 1. the snapshot's strokes are the base;
//! 2. own strokes undone locally are removed from the base;
//! 3. local strokes missing from the base survive only while pending
//!    (own, unconfirmed) or learned from a local broadcast and never
//!    confirmed; a tombstoned id never survives;
//! 4. strokes on both sides keep the copy with more points;
//! 5. every base id becomes confirmed;
//! 6. pure point growth is an incremental redraw, anything else a full one.
//!
//! Nothing is merged while the local user has a gesture open; inbound work
//! is queued and applied when the gesture ends.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::CoreError;
use crate::event::BoardEvent;
use crate::model::StrokeModel;
use crate::render::RenderRequest;
use crate::snapshot::{total_pages, AttachedFile, DocumentSnapshot};
use crate::stroke::{Color, Point, ReplicaId, Stroke, StrokeId, StrokeMode};

/// Which transport delivered an inbound item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provenance {
    /// Same-device fan-out; nothing durable about it.
    LocalBroadcast,
    /// Relay stream; the relay applied the event before forwarding it.
    Push,
    /// Periodic snapshot fetch.
    Polling,
}

/// Result of ingesting one inbound item, ordered by strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MergeOutcome {
    Unchanged,
    /// Queued until the open gesture ends.
    Deferred,
    /// Existing strokes only gained points.
    Incremental,
    /// Structural change: strokes added/removed/reordered, page or file.
    Full,
}

impl MergeOutcome {
    pub fn combine(self, other: MergeOutcome) -> MergeOutcome {
        self.max(other)
    }

    pub fn render_request(self) -> RenderRequest {
        match self {
            MergeOutcome::Incremental => RenderRequest::Incremental,
            MergeOutcome::Full => RenderRequest::Full,
            MergeOutcome::Unchanged | MergeOutcome::Deferred => RenderRequest::None,
        }
    }
}

#[derive(Debug, Clone)]
enum Deferred {
    Snapshot(DocumentSnapshot),
    Event {
        origin: ReplicaId,
        event: BoardEvent,
        via: Provenance,
    },
}

/// One participant's local copy of the board plus its sync bookkeeping.
#[derive(Debug, Clone)]
pub struct Replica {
    id: ReplicaId,
    model: StrokeModel,
    /// Ids seen in at least one authoritative source.
    confirmed_ids: HashSet<StrokeId>,
    /// Ids learned only from a local broadcast, never confirmed.
    broadcast_only: HashSet<StrokeId>,
    /// Ids created or restored here and not yet confirmed.
    local_pending: HashSet<StrokeId>,
    active_page: u32,
    attached_file: Option<AttachedFile>,
    /// Local page/file changes the authoritative store has not reflected yet.
    pending_page: Option<u32>,
    pending_file: Option<AttachedFile>,
    render: RenderRequest,
    deferred: VecDeque<Deferred>,
}

impl Replica {
    pub fn new(id: ReplicaId) -> Self {
        Self {
            id,
            model: StrokeModel::new(id),
            confirmed_ids: HashSet::new(),
            broadcast_only: HashSet::new(),
            local_pending: HashSet::new(),
            active_page: 1,
            attached_file: None,
            pending_page: None,
            pending_file: None,
            render: RenderRequest::None,
            deferred: VecDeque::new(),
        }
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn model(&self) -> &StrokeModel {
        &self.model
    }

    pub fn strokes(&self) -> &[Stroke] {
        self.model.strokes()
    }

    pub fn is_confirmed(&self, id: &StrokeId) -> bool {
        self.confirmed_ids.contains(id)
    }

    pub fn confirmed_ids(&self) -> &HashSet<StrokeId> {
        &self.confirmed_ids
    }

    /// Whether `id` is a local edit still awaiting confirmation.
    pub fn is_pending(&self, id: &StrokeId) -> bool {
        self.local_pending.contains(id)
    }

    pub fn active_page(&self) -> u32 {
        self.active_page
    }

    pub fn total_pages(&self) -> u32 {
        total_pages(self.attached_file.as_ref())
    }

    pub fn attached_file(&self) -> Option<&AttachedFile> {
        self.attached_file.as_ref()
    }

    pub fn has_open_gesture(&self) -> bool {
        self.model.open_gesture().is_some()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Take the repaint work accumulated since the last call.
    pub fn take_render_request(&mut self) -> RenderRequest {
        std::mem::take(&mut self.render)
    }

    fn request(&mut self, request: RenderRequest) {
        self.render = self.render.combine(request);
    }

    // ───────────────────────────────────────────────────────────
    // Local edits
    // ───────────────────────────────────────────────────────────

    pub fn begin_stroke(
        &mut self,
        mode: StrokeMode,
        color: Color,
        width: f32,
        page: u32,
    ) -> Result<StrokeId, CoreError> {
        let id = self.model.begin_stroke(mode, color, width, page)?;
        self.local_pending.insert(id);
        Ok(id)
    }

    pub fn append_point(&mut self, id: StrokeId, point: Point) -> Result<usize, CoreError> {
        let count = self.model.append_point(id, point)?;
        if count >= Stroke::MIN_RENDERABLE_POINTS {
            self.request(RenderRequest::Incremental);
        }
        Ok(count)
    }

    /// Close the open gesture and apply everything that queued up behind it.
    pub fn end_stroke(&mut self, id: StrokeId) -> Result<(Option<Stroke>, MergeOutcome), CoreError> {
        let stroke = self.model.end_stroke(id)?;
        if stroke.is_none() {
            self.local_pending.remove(&id);
        }
        Ok((stroke, self.flush_deferred()))
    }

    pub fn undo(&mut self) -> Option<Stroke> {
        let stroke = self.model.undo()?;
        self.local_pending.remove(&stroke.id);
        self.broadcast_only.remove(&stroke.id);
        self.request(RenderRequest::Full);
        Some(stroke)
    }

    /// Restore the last undone stroke. It becomes a pending local edit
    /// again until the authoritative store shows it.
    pub fn redo(&mut self) -> Option<Stroke> {
        let stroke = self.model.redo()?;
        self.confirmed_ids.remove(&stroke.id);
        self.broadcast_only.remove(&stroke.id);
        self.local_pending.insert(stroke.id);
        self.request(RenderRequest::Full);
        Some(stroke)
    }

    /// Reset strokes, history and confirmations. Idempotent.
    pub fn clear(&mut self) {
        self.model.clear();
        self.confirmed_ids.clear();
        self.broadcast_only.clear();
        self.local_pending.clear();
        self.request(RenderRequest::Full);
    }

    /// Switch page locally. Returns `Ok(false)` when already there.
    pub fn set_page(&mut self, page: u32) -> Result<bool, CoreError> {
        let total = self.total_pages();
        if page == 0 || page > total {
            return Err(CoreError::PageOutOfRange { page, total });
        }
        if page == self.active_page {
            return Ok(false);
        }
        self.active_page = page;
        self.pending_page = Some(page);
        self.request(RenderRequest::Full);
        Ok(true)
    }

    pub fn attach_file(&mut self, file: AttachedFile) {
        self.attached_file = Some(file.clone());
        self.pending_file = Some(file);
        self.active_page = 1;
        self.pending_page = Some(1);
        self.request(RenderRequest::Full);
    }

    // ───────────────────────────────────────────────────────────
    // Inbound
    // ───────────────────────────────────────────────────────────

    /// Merge an authoritative snapshot (init-state or poll result).
    pub fn ingest_snapshot(&mut self, snapshot: DocumentSnapshot) -> MergeOutcome {
        if self.has_open_gesture() {
            // Only the newest snapshot matters.
            self.deferred.retain(|d| !matches!(d, Deferred::Snapshot(_)));
            self.deferred.push_back(Deferred::Snapshot(snapshot));
            return MergeOutcome::Deferred;
        }
        self.merge_snapshot(snapshot)
    }

    /// Apply an incremental event from another replica.
    ///
    /// Malformed events are rejected before they are queued. Own echoes are
    /// ignored.
    pub fn ingest_event(
        &mut self,
        origin: ReplicaId,
        event: BoardEvent,
        via: Provenance,
    ) -> Result<MergeOutcome, CoreError> {
        event.validate()?;
        if origin == self.id {
            return Ok(MergeOutcome::Unchanged);
        }
        if self.has_open_gesture() {
            self.deferred.push_back(Deferred::Event { origin, event, via });
            return Ok(MergeOutcome::Deferred);
        }
        self.apply_event(event, via)
    }

    fn flush_deferred(&mut self) -> MergeOutcome {
        let mut outcome = MergeOutcome::Unchanged;
        while let Some(item) = self.deferred.pop_front() {
            let result = match item {
                Deferred::Snapshot(snapshot) => self.merge_snapshot(snapshot),
                Deferred::Event { origin, event, via } => {
                    let name = event.name();
                    self.apply_event(event, via).unwrap_or_else(|e| {
                        log::warn!("Discarding deferred {name} from {origin}: {e}");
                        MergeOutcome::Unchanged
                    })
                }
            };
            outcome = outcome.combine(result);
        }
        outcome
    }

    fn merge_snapshot(&mut self, snapshot: DocumentSnapshot) -> MergeOutcome {
        let DocumentSnapshot {
            strokes,
            active_page,
            attached_file,
            tombstones,
            ..
        } = snapshot;
        let own = self.id;

        let mut base: Vec<Stroke> = strokes
            .into_iter()
            .filter(|s| !(s.origin == own && self.model.is_undone(&s.id)))
            .collect();
        let base_ids: HashSet<StrokeId> = base.iter().map(|s| s.id).collect();
        let tombstones: HashSet<StrokeId> = tombstones.into_iter().collect();

        {
            let local: HashMap<StrokeId, &Stroke> =
                self.model.strokes().iter().map(|s| (s.id, s)).collect();
            for stroke in base.iter_mut() {
                if let Some(mine) = local.get(&stroke.id) {
                    if mine.points.len() > stroke.points.len() {
                        stroke.points = mine.points.clone();
                    }
                }
            }
        }

        let mut dropped = 0usize;
        let mut merged = base;
        for stroke in self.model.strokes() {
            if base_ids.contains(&stroke.id) {
                continue;
            }
            let keep = !tombstones.contains(&stroke.id)
                && (self.local_pending.contains(&stroke.id)
                    || (self.broadcast_only.contains(&stroke.id)
                        && !self.confirmed_ids.contains(&stroke.id)));
            if keep {
                merged.push(stroke.clone());
            } else {
                dropped += 1;
            }
        }
        if dropped > 0 {
            log::debug!("Snapshot merge dropped {dropped} strokes deleted elsewhere");
        }

        self.confirmed_ids.extend(base_ids.iter().copied());
        let surviving: HashSet<StrokeId> = merged.iter().map(|s| s.id).collect();
        self.local_pending
            .retain(|id| !base_ids.contains(id) && surviving.contains(id));
        self.broadcast_only
            .retain(|id| !base_ids.contains(id) && surviving.contains(id));

        let strokes_outcome = classify(self.model.strokes(), &merged);
        if strokes_outcome != MergeOutcome::Unchanged {
            self.model.replace_strokes(merged);
        }

        let outcome = strokes_outcome.combine(self.adopt_view(active_page, attached_file));
        self.request(outcome.render_request());
        outcome
    }

    /// Take page and file from the snapshot unless a local change to them
    /// is still in flight.
    fn adopt_view(&mut self, page: u32, file: Option<AttachedFile>) -> MergeOutcome {
        let before = (self.active_page, self.attached_file.clone());

        match self.pending_file.as_ref().map(|p| file.as_ref() == Some(p)) {
            Some(true) => {
                self.pending_file = None;
                self.attached_file = file;
            }
            Some(false) => {}
            None => self.attached_file = file,
        }

        match self.pending_page {
            Some(p) if p == page => self.pending_page = None,
            Some(_) => {}
            None => self.active_page = page,
        }
        self.active_page = self.active_page.clamp(1, self.total_pages());

        if (self.active_page, &self.attached_file) == (before.0, &before.1) {
            MergeOutcome::Unchanged
        } else {
            MergeOutcome::Full
        }
    }

    fn apply_event(&mut self, event: BoardEvent, via: Provenance) -> Result<MergeOutcome, CoreError> {
        let outcome = match event {
            BoardEvent::StrokeBegin { stroke } => {
                if stroke.origin == self.id && self.model.is_undone(&stroke.id) {
                    MergeOutcome::Unchanged
                } else if self.model.contains(&stroke.id) {
                    // Repeat delivery may still upgrade provenance.
                    self.observe(stroke.id, via);
                    MergeOutcome::Unchanged
                } else {
                    let id = stroke.id;
                    self.model.push(stroke);
                    self.observe(id, via);
                    MergeOutcome::Full
                }
            }
            BoardEvent::StrokeAppend { stroke_id, points } => {
                let stroke = self
                    .model
                    .stroke_mut(&stroke_id)
                    .ok_or(CoreError::UnknownStroke(stroke_id))?;
                if points.len() <= stroke.points.len() {
                    self.observe(stroke_id, via);
                    MergeOutcome::Unchanged
                } else {
                    let grew = points.starts_with(&stroke.points);
                    stroke.points = points;
                    self.observe(stroke_id, via);
                    if grew {
                        MergeOutcome::Incremental
                    } else {
                        MergeOutcome::Full
                    }
                }
            }
            BoardEvent::StrokeEnd { stroke_id } => {
                if !self.model.contains(&stroke_id) {
                    return Err(CoreError::UnknownStroke(stroke_id));
                }
                MergeOutcome::Unchanged
            }
            BoardEvent::Undo { stroke_id } => match self.model.remove(&stroke_id) {
                Some(_) => {
                    self.local_pending.remove(&stroke_id);
                    self.broadcast_only.remove(&stroke_id);
                    MergeOutcome::Full
                }
                None => MergeOutcome::Unchanged,
            },
            BoardEvent::Redo { stroke } => {
                if self.model.contains(&stroke.id) {
                    self.observe(stroke.id, via);
                    MergeOutcome::Unchanged
                } else {
                    let id = stroke.id;
                    self.confirmed_ids.remove(&id);
                    self.model.push(stroke);
                    self.observe(id, via);
                    MergeOutcome::Full
                }
            }
            BoardEvent::Clear => {
                self.clear_from_peer();
                MergeOutcome::Full
            }
            BoardEvent::SetPage { page } => {
                let total = self.total_pages();
                if page > total {
                    return Err(CoreError::PageOutOfRange { page, total });
                }
                self.pending_page = None;
                if page == self.active_page {
                    MergeOutcome::Unchanged
                } else {
                    self.active_page = page;
                    MergeOutcome::Full
                }
            }
            BoardEvent::AttachFile { file } => {
                self.attached_file = Some(file);
                self.pending_file = None;
                self.active_page = 1;
                self.pending_page = None;
                MergeOutcome::Full
            }
            BoardEvent::ToolChanged { .. } => MergeOutcome::Unchanged,
        };
        self.request(outcome.render_request());
        Ok(outcome)
    }

    fn observe(&mut self, id: StrokeId, via: Provenance) {
        match via {
            Provenance::Push => {
                self.confirmed_ids.insert(id);
                self.broadcast_only.remove(&id);
            }
            Provenance::LocalBroadcast => {
                if !self.confirmed_ids.contains(&id) {
                    self.broadcast_only.insert(id);
                }
            }
            Provenance::Polling => {}
        }
    }

    /// A peer cleared the board. Own strokes that were never confirmed
    /// survive: the authoritative store decides their fate.
    fn clear_from_peer(&mut self) {
        let pending = &self.local_pending;
        self.model.retain(|s| pending.contains(&s.id));
        self.model.clear_history();
        self.confirmed_ids.clear();
        self.broadcast_only.clear();
    }
}

fn classify(current: &[Stroke], merged: &[Stroke]) -> MergeOutcome {
    let structural = current.len() != merged.len()
        || current
            .iter()
            .zip(merged)
            .any(|(c, m)| c.id != m.id || m.points.len() < c.points.len());
    if structural {
        return MergeOutcome::Full;
    }
    if current.iter().zip(merged).all(|(c, m)| c == m) {
        return MergeOutcome::Unchanged;
    }
    let only_growth = current.iter().zip(merged).all(|(c, m)| {
        c == m
            || (m.points.starts_with(&c.points)
                && c.page == m.page
                && c.mode == m.mode
                && c.color == m.color
                && c.width == m.width)
    });
    if only_growth {
        MergeOutcome::Incremental
    } else {
        MergeOutcome::Full
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn replica() -> Replica {
        Replica::new(Uuid::new_v4())
    }

    /// Draw a finished stroke locally, returning its id.
    fn draw(r: &mut Replica, points: &[(f32, f32)]) -> StrokeId {
        let id = r.begin_stroke(StrokeMode::Draw, Color::BLACK, 2.0, 1).unwrap();
        for &(x, y) in points {
            r.append_point(id, Point::new(x, y)).unwrap();
        }
        r.end_stroke(id).unwrap();
        id
    }

    fn peer_stroke(origin: ReplicaId, stamp: u64, n: usize) -> Stroke {
        let mut s = Stroke::new(StrokeId::new(origin, stamp), 1, StrokeMode::Draw, Color::BLACK, 2.0);
        s.points = (0..n).map(|i| Point::new(i as f32 * 0.05, 0.3)).collect();
        s
    }

    fn snapshot_of(strokes: Vec<Stroke>) -> DocumentSnapshot {
        DocumentSnapshot { strokes, ..DocumentSnapshot::default() }
    }

    fn ids(r: &Replica) -> Vec<StrokeId> {
        r.strokes().iter().map(|s| s.id).collect()
    }

    #[test]
    fn test_optimistic_keep_before_confirmation() {
        let mut r = replica();
        let mine = draw(&mut r, &[(0.0, 0.0), (0.1, 0.1)]);

        // Snapshots that predate the upload never remove the pending stroke.
        for _ in 0..3 {
            r.ingest_snapshot(DocumentSnapshot::default());
            assert_eq!(ids(&r), vec![mine]);
            assert!(r.is_pending(&mine));
        }
    }

    #[test]
    fn test_confirmation_then_deletion_propagates() {
        let mut r = replica();
        let mine = draw(&mut r, &[(0.0, 0.0), (0.1, 0.1)]);
        let copy = r.strokes()[0].clone();

        assert_eq!(r.ingest_snapshot(snapshot_of(vec![copy])), MergeOutcome::Unchanged);
        assert!(r.is_confirmed(&mine));
        assert!(!r.is_pending(&mine));

        // Confirmed, now absent: someone deleted it.
        assert_eq!(r.ingest_snapshot(DocumentSnapshot::default()), MergeOutcome::Full);
        assert!(r.strokes().is_empty());
    }

    #[test]
    fn test_undo_not_resurrected_by_stale_snapshot() {
        let mut r = replica();
        let mine = draw(&mut r, &[(0.0, 0.0), (0.1, 0.1)]);
        let copy = r.strokes()[0].clone();
        r.ingest_snapshot(snapshot_of(vec![copy.clone()]));

        assert_eq!(r.undo().unwrap().id, mine);
        // The store has not processed the undo yet.
        r.ingest_snapshot(snapshot_of(vec![copy]));
        assert!(r.strokes().is_empty());
    }

    #[test]
    fn test_undo_after_peer_stroke_stays_undone() {
        let mut r = replica();
        let mine = draw(&mut r, &[(0.0, 0.0), (0.1, 0.1)]);
        let peer = peer_stroke(Uuid::new_v4(), 5, 3);
        let snapshot = snapshot_of(vec![r.strokes()[0].clone(), peer.clone()]);
        r.ingest_snapshot(snapshot.clone());
        assert_eq!(ids(&r), vec![mine, peer.id]);

        // The peer's stroke is on top, but undo removes our own.
        assert_eq!(r.undo().unwrap().id, mine);
        r.ingest_snapshot(snapshot.clone());
        assert_eq!(ids(&r), vec![peer.id]);

        // Nothing of ours is left to undo; the peer's stroke stays.
        assert!(r.undo().is_none());
        r.ingest_snapshot(snapshot);
        assert_eq!(ids(&r), vec![peer.id]);
    }

    #[test]
    fn test_idempotent_clear() {
        let mut r = replica();
        draw(&mut r, &[(0.0, 0.0), (0.1, 0.1)]);
        draw(&mut r, &[(0.2, 0.2), (0.3, 0.3)]);
        r.undo();

        r.clear();
        let once = (ids(&r), r.model().undo_stack().len(), r.confirmed_ids().len());
        r.clear();
        let twice = (ids(&r), r.model().undo_stack().len(), r.confirmed_ids().len());
        assert_eq!(once, twice);
        assert_eq!(once, (vec![], 0, 0));
        assert_eq!(r.take_render_request(), RenderRequest::Full);
    }

    #[test]
    fn test_longer_copy_wins() {
        let mut r = replica();
        let peer = Uuid::new_v4();
        let long = peer_stroke(peer, 1, 6);
        let short = peer_stroke(peer, 1, 3);

        r.ingest_event(peer, BoardEvent::StrokeBegin { stroke: long.head() }, Provenance::Push)
            .unwrap();
        r.ingest_event(
            peer,
            BoardEvent::StrokeAppend { stroke_id: long.id, points: long.points.clone() },
            Provenance::Push,
        )
        .unwrap();

        r.ingest_snapshot(snapshot_of(vec![short]));
        assert_eq!(r.strokes()[0].points.len(), 6);
    }

    #[test]
    fn test_point_growth_is_incremental() {
        let mut r = replica();
        let peer = Uuid::new_v4();
        let mut s = peer_stroke(peer, 1, 2);
        assert_eq!(r.ingest_snapshot(snapshot_of(vec![s.clone()])), MergeOutcome::Full);
        r.take_render_request();

        s.points.push(Point::new(0.9, 0.9));
        assert_eq!(r.ingest_snapshot(snapshot_of(vec![s.clone()])), MergeOutcome::Incremental);
        assert_eq!(r.take_render_request(), RenderRequest::Incremental);
        assert_eq!(r.ingest_snapshot(snapshot_of(vec![s])), MergeOutcome::Unchanged);
        assert_eq!(r.take_render_request(), RenderRequest::None);
    }

    #[test]
    fn test_broadcast_stroke_kept_until_confirmed_then_follows_store() {
        let mut r = replica();
        let tab = Uuid::new_v4();
        let s = peer_stroke(tab, 1, 3);
        r.ingest_event(tab, BoardEvent::StrokeBegin { stroke: s.head() }, Provenance::LocalBroadcast)
            .unwrap();
        r.ingest_event(
            tab,
            BoardEvent::StrokeAppend { stroke_id: s.id, points: s.points.clone() },
            Provenance::LocalBroadcast,
        )
        .unwrap();

        // Not yet durable: kept.
        r.ingest_snapshot(DocumentSnapshot::default());
        assert_eq!(ids(&r), vec![s.id]);

        // Durable.
        r.ingest_snapshot(snapshot_of(vec![s.clone()]));
        assert!(r.is_confirmed(&s.id));

        // Deleted elsewhere.
        r.ingest_snapshot(DocumentSnapshot::default());
        assert!(r.strokes().is_empty());
    }

    #[test]
    fn test_push_learned_stroke_dropped_when_store_drops_it() {
        let mut r = replica();
        let peer = Uuid::new_v4();
        let s = peer_stroke(peer, 1, 2);
        r.ingest_event(peer, BoardEvent::StrokeBegin { stroke: s.clone() }, Provenance::Push)
            .unwrap();
        assert!(r.is_confirmed(&s.id));
        r.ingest_snapshot(DocumentSnapshot::default());
        assert!(r.strokes().is_empty());
    }

    #[test]
    fn test_repeat_delivery_over_push_confirms() {
        let mut r = replica();
        let tab = Uuid::new_v4();
        let s = peer_stroke(tab, 1, 2);
        let begin = BoardEvent::StrokeBegin { stroke: s.clone() };
        r.ingest_event(tab, begin.clone(), Provenance::LocalBroadcast).unwrap();
        assert!(!r.is_confirmed(&s.id));

        assert_eq!(r.ingest_event(tab, begin, Provenance::Push).unwrap(), MergeOutcome::Unchanged);
        assert!(r.is_confirmed(&s.id));
        r.ingest_snapshot(DocumentSnapshot::default());
        assert!(r.strokes().is_empty());
    }

    #[test]
    fn test_tombstone_drops_unconfirmed_pending_stroke() {
        let mut r = replica();
        let mine = draw(&mut r, &[(0.0, 0.0), (0.5, 0.5)]);
        let snap = DocumentSnapshot { tombstones: vec![mine], ..DocumentSnapshot::default() };
        assert_eq!(r.ingest_snapshot(snap), MergeOutcome::Full);
        assert!(r.strokes().is_empty());
        assert!(!r.is_pending(&mine));
    }

    #[test]
    fn test_merge_deferred_while_gesture_open() {
        let mut r = replica();
        let peer = Uuid::new_v4();
        let theirs = peer_stroke(peer, 1, 2);

        let id = r.begin_stroke(StrokeMode::Draw, Color::BLACK, 2.0, 1).unwrap();
        r.append_point(id, Point::new(0.1, 0.1)).unwrap();

        assert_eq!(
            r.ingest_snapshot(snapshot_of(vec![theirs.clone()])),
            MergeOutcome::Deferred
        );
        assert_eq!(
            r.ingest_event(peer, BoardEvent::Clear, Provenance::Push).unwrap(),
            MergeOutcome::Deferred
        );
        // Mid-gesture state untouched.
        assert_eq!(ids(&r), vec![id]);
        assert_eq!(r.deferred_len(), 2);

        r.append_point(id, Point::new(0.2, 0.2)).unwrap();
        let (stroke, outcome) = r.end_stroke(id).unwrap();
        assert!(stroke.is_some());
        assert_eq!(outcome, MergeOutcome::Full);
        assert_eq!(r.deferred_len(), 0);

        // Snapshot added theirs, then the peer clear removed everything
        // except our still-pending stroke.
        assert_eq!(ids(&r), vec![id]);
    }

    #[test]
    fn test_concurrent_clear_keeps_own_pending_stroke() {
        // A draws s1 while B (never having seen s1) clears.
        let mut a = replica();
        let b = Uuid::new_v4();
        let s1 = draw(&mut a, &[(0.0, 0.0), (0.1, 0.1)]);

        a.ingest_event(b, BoardEvent::Clear, Provenance::Push).unwrap();
        assert_eq!(ids(&a), vec![s1]);

        // The store accepted s1 after the clear: it stays and is confirmed.
        let copy = a.strokes()[0].clone();
        a.ingest_snapshot(snapshot_of(vec![copy]));
        assert!(a.is_confirmed(&s1));
        assert_eq!(ids(&a), vec![s1]);
    }

    #[test]
    fn test_concurrent_clear_store_applied_clear_last() {
        let mut a = replica();
        let b = Uuid::new_v4();
        let s1 = draw(&mut a, &[(0.0, 0.0), (0.1, 0.1)]);
        a.ingest_event(b, BoardEvent::Clear, Provenance::Push).unwrap();

        // The store saw s1 first and then the clear: it says so via tombstone.
        let snap = DocumentSnapshot { tombstones: vec![s1], revision: 3, ..DocumentSnapshot::default() };
        a.ingest_snapshot(snap);
        assert!(a.strokes().is_empty());
    }

    #[test]
    fn test_unknown_append_never_fabricates() {
        let mut r = replica();
        let peer = Uuid::new_v4();
        let ghost = StrokeId::new(peer, 9);
        let err = r
            .ingest_event(
                peer,
                BoardEvent::StrokeAppend {
                    stroke_id: ghost,
                    points: vec![Point::new(0.0, 0.0), Point::new(1.0, 1.0)],
                },
                Provenance::LocalBroadcast,
            )
            .unwrap_err();
        assert_eq!(err, CoreError::UnknownStroke(ghost));
        assert!(r.strokes().is_empty());
    }

    #[test]
    fn test_malformed_event_rejected() {
        let mut r = replica();
        let peer = Uuid::new_v4();
        let mut s = peer_stroke(peer, 1, 2);
        s.points[1] = Point::new(f32::NAN, 0.0);
        assert!(r
            .ingest_event(peer, BoardEvent::StrokeBegin { stroke: s }, Provenance::Push)
            .is_err());
        assert!(r.strokes().is_empty());
    }

    #[test]
    fn test_own_echo_ignored() {
        let mut r = replica();
        let own = r.id();
        let mine = draw(&mut r, &[(0.0, 0.0), (0.1, 0.1)]);
        let outcome = r
            .ingest_event(own, BoardEvent::Undo { stroke_id: mine }, Provenance::Push)
            .unwrap();
        assert_eq!(outcome, MergeOutcome::Unchanged);
        assert_eq!(ids(&r), vec![mine]);
    }

    #[test]
    fn test_redo_becomes_pending_again() {
        let mut r = replica();
        let mine = draw(&mut r, &[(0.0, 0.0), (0.1, 0.1)]);
        let copy = r.strokes()[0].clone();
        r.ingest_snapshot(snapshot_of(vec![copy]));
        r.undo();
        // Store processed the undo.
        r.ingest_snapshot(DocumentSnapshot::default());
        assert!(r.strokes().is_empty());

        assert_eq!(r.redo().unwrap().id, mine);
        // Store has not processed the redo yet: must not be dropped.
        r.ingest_snapshot(DocumentSnapshot::default());
        assert_eq!(ids(&r), vec![mine]);
    }

    #[test]
    fn test_page_follows_store_unless_local_change_in_flight() {
        let mut r = replica();
        let file = AttachedFile { name: "a.pdf".into(), locator: "a".into(), page_count: 5 };
        r.attach_file(file.clone());
        r.set_page(3).unwrap();

        // Stale snapshot without the file or page change.
        r.ingest_snapshot(DocumentSnapshot::default());
        assert_eq!(r.active_page(), 3);
        assert_eq!(r.total_pages(), 5);

        // Store caught up.
        let snap = DocumentSnapshot {
            active_page: 3,
            attached_file: Some(file.clone()),
            ..DocumentSnapshot::default()
        };
        r.ingest_snapshot(snap);

        // Someone else moved to page 4.
        let snap = DocumentSnapshot {
            active_page: 4,
            attached_file: Some(file),
            ..DocumentSnapshot::default()
        };
        assert_eq!(r.ingest_snapshot(snap), MergeOutcome::Full);
        assert_eq!(r.active_page(), 4);
    }

    #[test]
    fn test_set_page_event_range_checked() {
        let mut r = replica();
        let peer = Uuid::new_v4();
        assert!(matches!(
            r.ingest_event(peer, BoardEvent::SetPage { page: 2 }, Provenance::Push),
            Err(CoreError::PageOutOfRange { page: 2, total: 1 })
        ));
        assert!(r.set_page(0).is_err());
    }

    // ───────────────────────────────────────────────────────────
    // Convergence under arbitrary interleavings
    // ───────────────────────────────────────────────────────────

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Down(f32, f32),
        Move(f32, f32),
        Up,
    }

    /// A replica driven by a script of pointer steps, publishing events
    /// the way the controller does (lazy begin, cumulative appends).
    struct Scripted {
        replica: Replica,
        script: VecDeque<Step>,
        open: Option<StrokeId>,
        outbox: VecDeque<BoardEvent>,
    }

    impl Scripted {
        fn new(strokes: &[Vec<(f32, f32)>]) -> Self {
            let mut script = VecDeque::new();
            for points in strokes {
                script.push_back(Step::Down(points[0].0, points[0].1));
                for &(x, y) in &points[1..] {
                    script.push_back(Step::Move(x, y));
                }
                script.push_back(Step::Up);
            }
            Self { replica: replica(), script, open: None, outbox: VecDeque::new() }
        }

        fn step(&mut self) -> bool {
            let Some(step) = self.script.pop_front() else { return false };
            match step {
                Step::Down(x, y) => {
                    let id = self.replica.begin_stroke(StrokeMode::Draw, Color::BLACK, 2.0, 1).unwrap();
                    self.replica.append_point(id, Point::new(x, y)).unwrap();
                    self.open = Some(id);
                }
                Step::Move(x, y) => {
                    let id = self.open.unwrap();
                    let n = self.replica.append_point(id, Point::new(x, y)).unwrap();
                    let stroke = self.replica.model().stroke(&id).unwrap().clone();
                    if n == 2 {
                        self.outbox.push_back(BoardEvent::StrokeBegin { stroke: stroke.head() });
                    }
                    self.outbox.push_back(BoardEvent::StrokeAppend { stroke_id: id, points: stroke.points });
                }
                Step::Up => {
                    let id = self.open.take().unwrap();
                    if self.replica.end_stroke(id).unwrap().0.is_some() {
                        self.outbox.push_back(BoardEvent::StrokeEnd { stroke_id: id });
                    }
                }
            }
            true
        }
    }

    fn deliver(from: &mut Scripted, to: &mut Scripted) -> bool {
        match from.outbox.pop_front() {
            Some(event) => {
                let origin = from.replica.id();
                to.replica.ingest_event(origin, event, Provenance::Push).unwrap();
                true
            }
            None => false,
        }
    }

    fn canonical(r: &Replica) -> Vec<(StrokeId, Vec<Point>)> {
        let mut all: Vec<_> = r.strokes().iter().map(|s| (s.id, s.points.clone())).collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    fn strokes_strategy() -> impl Strategy<Value = Vec<Vec<(f32, f32)>>> {
        prop::collection::vec(prop::collection::vec((0.0f32..1.0, 0.0f32..1.0), 2..6), 1..4)
    }

    proptest! {
        #[test]
        fn prop_two_replicas_converge(
            a_strokes in strokes_strategy(),
            b_strokes in strokes_strategy(),
            schedule in prop::collection::vec(0u8..4, 0..80),
        ) {
            let mut a = Scripted::new(&a_strokes);
            let mut b = Scripted::new(&b_strokes);

            for choice in schedule {
                match choice {
                    0 => { a.step(); }
                    1 => { b.step(); }
                    2 => { deliver(&mut a, &mut b); }
                    _ => { deliver(&mut b, &mut a); }
                }
            }
            while a.step() {}
            while b.step() {}
            while deliver(&mut a, &mut b) {}
            while deliver(&mut b, &mut a) {}

            prop_assert!(!a.replica.has_open_gesture());
            prop_assert_eq!(a.replica.deferred_len(), 0);
            prop_assert_eq!(b.replica.deferred_len(), 0);
            prop_assert_eq!(canonical(&a.replica), canonical(&b.replica));
            prop_assert_eq!(a.replica.strokes().len(), a_strokes.len() + b_strokes.len());
        }
    }
}

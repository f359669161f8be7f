//! Outbound append coalescing.
//!
//! Appends carry the cumulative point list, so only the newest one per
//! stroke matters. Appends are held for at most `interval` and sent as one;
//! any other event flushes everything held first so per-sender order holds.

use std::time::{Duration, Instant};

use slate_core::{BoardEvent, Point, StrokeId};

pub const DEFAULT_COALESCE_INTERVAL: Duration = Duration::from_millis(200);

pub struct AppendCoalescer {
    /// In first-seen order.
    pending: Vec<(StrokeId, Vec<Point>)>,
    interval: Duration,
    /// `None` until the first flush, so the first append goes straight out.
    last_flush: Option<Instant>,
}

impl AppendCoalescer {
    pub fn new(interval: Duration) -> Self {
        Self {
            pending: Vec::new(),
            interval,
            last_flush: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Offer an outbound event. Returns what should be sent now, in order.
    pub fn push(&mut self, event: BoardEvent) -> Vec<BoardEvent> {
        match event {
            BoardEvent::StrokeAppend { stroke_id, points } => {
                match self.pending.iter_mut().find(|(id, _)| *id == stroke_id) {
                    Some((_, held)) => *held = points,
                    None => self.pending.push((stroke_id, points)),
                }
                if self.is_due() {
                    self.flush()
                } else {
                    Vec::new()
                }
            }
            other => {
                let mut out = self.flush();
                out.push(other);
                out
            }
        }
    }

    /// Whether held appends have waited long enough.
    pub fn is_due(&self) -> bool {
        self.has_pending()
            && self
                .last_flush
                .map_or(true, |at| at.elapsed() >= self.interval)
    }

    /// Release held appends on a tick, if due.
    pub fn poll(&mut self) -> Vec<BoardEvent> {
        if self.is_due() {
            self.flush()
        } else {
            Vec::new()
        }
    }

    /// Release every held append now.
    pub fn flush(&mut self) -> Vec<BoardEvent> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        self.last_flush = Some(Instant::now());
        self.pending
            .drain(..)
            .map(|(stroke_id, points)| BoardEvent::StrokeAppend { stroke_id, points })
            .collect()
    }
}

impl Default for AppendCoalescer {
    fn default() -> Self {
        Self::new(DEFAULT_COALESCE_INTERVAL)
    }
}

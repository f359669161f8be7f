//! Incremental software rasterizer for the ink layer.
//!
//! The ink layer is a transparent RGBA bitmap drawn above the page
//! background. Draw strokes overwrite pixels with their color; erase strokes
//! overwrite them with full transparency, so erased ink stays erased no
//! matter what is rendered beneath.
//!
//! ```text
//!  strokes ──► Renderer::render ──► structural change? ──► yes: clear + repaint all
//!                                          │
//!                                          └─► no: paint only segments past
//!                                                  the top stroke's painted count
//! ```
//!
//! Only the top-most visible stroke may grow incrementally. New segments of
//! a stroke lying under later strokes would land above them, so that case
//! repaints. Both paths then rasterize the same ordered list of segments,
//! and an incrementally built bitmap is identical to a single full pass.

use crate::stroke::{Color, Point, Stroke, StrokeId, StrokeMode};

/// RGBA8 bitmap, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Bitmap {
    /// Fully transparent bitmap.
    pub fn new(width: u32, height: u32) -> Self {
        Self::filled(width, height, Color::TRANSPARENT)
    }

    pub fn filled(width: u32, height: u32, color: Color) -> Self {
        let pixel = color.to_array();
        let mut data = Vec::with_capacity(width as usize * height as usize * 4);
        for _ in 0..(width as usize * height as usize) {
            data.extend_from_slice(&pixel);
        }
        Self { width, height, data }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = self.offset(x, y);
        Some([self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]])
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let i = self.offset(x, y);
        self.data[i..i + 4].copy_from_slice(&rgba);
    }

    /// Reset to fully transparent.
    pub fn clear(&mut self) {
        self.data.iter_mut().for_each(|b| *b = 0);
    }

    pub fn is_blank(&self) -> bool {
        self.data.chunks_exact(4).all(|px| px[3] == 0)
    }

    /// Number of pixels with non-zero alpha.
    pub fn inked_pixels(&self) -> usize {
        self.data.chunks_exact(4).filter(|px| px[3] != 0).count()
    }

    /// Source-over composite of `self` above `background`.
    ///
    /// Returns `None` when dimensions differ.
    pub fn composite_over(&self, background: &Bitmap) -> Option<Bitmap> {
        if self.width != background.width || self.height != background.height {
            return None;
        }
        let mut out = background.clone();
        for (dst, src) in out.data.chunks_exact_mut(4).zip(self.data.chunks_exact(4)) {
            let sa = src[3] as u32;
            if sa == 0 {
                continue;
            }
            let da = dst[3] as u32;
            let out_a = sa + da * (255 - sa) / 255;
            for c in 0..3 {
                let blended =
                    (src[c] as u32 * sa + dst[c] as u32 * da * (255 - sa) / 255) / out_a.max(1);
                dst[c] = blended.min(255) as u8;
            }
            dst[3] = out_a.min(255) as u8;
        }
        Some(out)
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * 4
    }
}

/// Renderer configuration.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Ink layer width in pixels
    pub width: u32,
    /// Ink layer height in pixels
    pub height: u32,
    /// Diameter used by every erase stroke, in pixels
    pub eraser_width: f32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            eraser_width: 20.0,
        }
    }
}

/// Pending repaint work recorded by state mutations.
///
/// Ordered so that combining two requests keeps the stronger one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum RenderRequest {
    #[default]
    None,
    Incremental,
    Full,
}

impl RenderRequest {
    pub fn combine(self, other: RenderRequest) -> RenderRequest {
        self.max(other)
    }
}

/// What a call to [`Renderer::render`] actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPass {
    Skipped,
    Incremental { segments: usize },
    Full { segments: usize },
}

/// Incremental ink renderer.
pub struct Renderer {
    config: RendererConfig,
    ink: Bitmap,
    painted_page: Option<u32>,
    /// Painted point count per visible stroke, in z-order.
    painted: Vec<(StrokeId, usize)>,
}

impl Renderer {
    pub fn new(config: RendererConfig) -> Self {
        let ink = Bitmap::new(config.width, config.height);
        Self {
            config,
            ink,
            painted_page: None,
            painted: Vec::new(),
        }
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.ink
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// Bring the ink layer up to date with `strokes` on `page`.
    pub fn render(&mut self, strokes: &[Stroke], page: u32, request: RenderRequest) -> RenderPass {
        let visible: Vec<&Stroke> = strokes
            .iter()
            .filter(|s| s.page == page && s.is_renderable())
            .collect();

        if request == RenderRequest::Full
            || self.is_structural_change(&visible, page)
            || self.grew_below_top(&visible)
        {
            return self.repaint(&visible, page);
        }

        let mut segments = 0;
        for (slot, stroke) in self.painted.iter_mut().zip(&visible) {
            let painted = slot.1;
            if stroke.points.len() <= painted {
                continue;
            }
            for i in painted.max(1)..stroke.points.len() {
                paint_segment(&mut self.ink, self.config.eraser_width, stroke, i);
                segments += 1;
            }
            slot.1 = stroke.points.len();
        }

        if segments == 0 {
            RenderPass::Skipped
        } else {
            RenderPass::Incremental { segments }
        }
    }

    /// Drop all ink immediately, e.g. after a clear.
    pub fn reset(&mut self) {
        self.ink.clear();
        self.painted.clear();
    }

    fn is_structural_change(&self, visible: &[&Stroke], page: u32) -> bool {
        self.painted_page != Some(page)
            || visible.len() != self.painted.len()
            || self
                .painted
                .iter()
                .zip(visible)
                .any(|((id, count), s)| s.id != *id || s.points.len() < *count)
    }

    /// Whether a stroke other than the top-most one gained points.
    fn grew_below_top(&self, visible: &[&Stroke]) -> bool {
        self.painted
            .iter()
            .zip(visible)
            .rev()
            .skip(1)
            .any(|((_, count), s)| s.points.len() > *count)
    }

    fn repaint(&mut self, visible: &[&Stroke], page: u32) -> RenderPass {
        self.ink.clear();
        self.painted.clear();
        let mut segments = 0;
        for stroke in visible {
            for i in 1..stroke.points.len() {
                paint_segment(&mut self.ink, self.config.eraser_width, stroke, i);
                segments += 1;
            }
            self.painted.push((stroke.id, stroke.points.len()));
        }
        self.painted_page = Some(page);
        log::trace!("Full repaint of page {page}: {} strokes, {segments} segments", visible.len());
        RenderPass::Full { segments }
    }
}

/// Rasterize the segment ending at point index `end` as a round-capped
/// thick line.
fn paint_segment(ink: &mut Bitmap, eraser_width: f32, stroke: &Stroke, end: usize) {
    let (w, h) = (ink.width() as f32, ink.height() as f32);
    if w < 1.0 || h < 1.0 {
        return;
    }
    let to_px = |p: Point| (p.x * w, p.y * h);
    let (ax, ay) = to_px(stroke.points[end - 1]);
    let (bx, by) = to_px(stroke.points[end]);

    let (diameter, rgba) = match stroke.mode {
        StrokeMode::Draw => (stroke.width, stroke.color.to_array()),
        StrokeMode::Erase => (eraser_width, [0, 0, 0, 0]),
    };
    let r = (diameter / 2.0).max(0.5);

    let min_x = (ax.min(bx) - r).floor().max(0.0);
    let min_y = (ay.min(by) - r).floor().max(0.0);
    let max_x = (ax.max(bx) + r).ceil().min(w - 1.0);
    let max_y = (ay.max(by) + r).ceil().min(h - 1.0);
    if max_x < min_x || max_y < min_y {
        return;
    }

    for y in (min_y as u32)..=(max_y as u32) {
        for x in (min_x as u32)..=(max_x as u32) {
            let (cx, cy) = (x as f32 + 0.5, y as f32 + 0.5);
            if distance_sq_to_segment(cx, cy, ax, ay, bx, by) <= r * r {
                ink.set_pixel(x, y, rgba);
            }
        }
    }
}

fn distance_sq_to_segment(px: f32, py: f32, ax: f32, ay: f32, bx: f32, by: f32) -> f32 {
    let (dx, dy) = (bx - ax, by - ay);
    let len_sq = dx * dx + dy * dy;
    let t = if len_sq <= f32::EPSILON {
        0.0
    } else {
        (((px - ax) * dx + (py - ay) * dy) / len_sq).clamp(0.0, 1.0)
    };
    let (qx, qy) = (ax + t * dx, ay + t * dy);
    (px - qx) * (px - qx) + (py - qy) * (py - qy)
}

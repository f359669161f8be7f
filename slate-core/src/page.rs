//! Seam to the external page rasterizer (PDF engine).
//!
//! The engine is treated as a pure function from (document, page, scale) to
//! pixels; the board only needs the page count and a background bitmap.

use thiserror::Error;

use crate::render::Bitmap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentInfo {
    pub page_count: u32,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PageError {
    #[error("Unreadable document: {0}")]
    Unreadable(String),
    #[error("No document loaded")]
    NotLoaded,
    #[error("Page {0} out of range")]
    OutOfRange(u32),
}

pub trait PageRasterizer {
    fn load_document(&mut self, bytes: &[u8]) -> Result<DocumentInfo, PageError>;

    /// Rasterize 1-based page `page` at `scale` (1.0 = natural size).
    fn render_page(&self, page: u32, scale: f32) -> Result<Bitmap, PageError>;
}

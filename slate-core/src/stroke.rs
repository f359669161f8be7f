//! Stroke primitives: normalized points, ink colors and globally unique ids.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::CoreError;

/// Identifier of one participant's replica. Fresh per session join.
pub type ReplicaId = Uuid;

/// 2D point in normalized page coordinates (0..1 on both axes).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    /// Clamp into the unit square. Pointer samples can land slightly
    /// outside the canvas when the pointer leaves mid-gesture.
    pub fn clamped(self) -> Self {
        Self {
            x: self.x.clamp(0.0, 1.0),
            y: self.y.clamp(0.0, 1.0),
        }
    }
}

/// RGBA ink color, serialized as `#rrggbb` or `#rrggbbaa`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const BLACK: Color = Color { r: 0, g: 0, b: 0, a: 255 };
    pub const WHITE: Color = Color { r: 255, g: 255, b: 255, a: 255 };
    pub const TRANSPARENT: Color = Color { r: 0, g: 0, b: 0, a: 0 };

    pub fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self::rgba(r, g, b, 255)
    }

    /// Parse `#rrggbb` / `#rrggbbaa` (leading `#` optional).
    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let hex = s.trim().trim_start_matches('#');
        if !(hex.len() == 6 || hex.len() == 8) || !hex.is_ascii() {
            return Err(CoreError::InvalidColor(s.to_string()));
        }
        let byte = |i: usize| {
            u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| CoreError::InvalidColor(s.to_string()))
        };
        let a = if hex.len() == 8 { byte(6)? } else { 255 };
        Ok(Self::rgba(byte(0)?, byte(2)?, byte(4)?, a))
    }

    pub fn to_hex(&self) -> String {
        if self.a == 255 {
            format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
        } else {
            format!("#{:02x}{:02x}{:02x}{:02x}", self.r, self.g, self.b, self.a)
        }
    }

    pub fn to_array(&self) -> [u8; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::BLACK
    }
}

impl TryFrom<String> for Color {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Color::from_hex(&value)
    }
}

impl From<Color> for String {
    fn from(c: Color) -> Self {
        c.to_hex()
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// How a stroke is composited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrokeMode {
    /// Colored ink.
    Draw,
    /// Pixel removal (destination-out). Color and width are ignored.
    Erase,
}

/// Globally unique stroke id: origin replica + local millisecond stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StrokeId {
    pub origin: ReplicaId,
    pub stamp: u64,
}

impl StrokeId {
    pub fn new(origin: ReplicaId, stamp: u64) -> Self {
        Self { origin, stamp }
    }
}

impl fmt::Display for StrokeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.origin, self.stamp)
    }
}

/// Millisecond wall clock that never repeats a value.
///
/// Two strokes begun within the same millisecond still get distinct stamps.
#[derive(Debug, Clone, Default)]
pub struct StampClock {
    last: u64,
}

impl StampClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last = now.max(self.last + 1);
        self.last
    }
}

/// One continuous pen or eraser gesture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub id: StrokeId,
    pub origin: ReplicaId,
    /// 1-based page index.
    pub page: u32,
    pub mode: StrokeMode,
    pub color: Color,
    pub width: f32,
    pub points: Vec<Point>,
}

impl Stroke {
    /// Fewer points than this cannot be drawn and never leave the replica.
    pub const MIN_RENDERABLE_POINTS: usize = 2;

    pub fn new(id: StrokeId, page: u32, mode: StrokeMode, color: Color, width: f32) -> Self {
        Self {
            id,
            origin: id.origin,
            page,
            mode,
            color,
            width,
            points: Vec::new(),
        }
    }

    pub fn is_renderable(&self) -> bool {
        self.points.len() >= Self::MIN_RENDERABLE_POINTS
    }

    /// Copy carrying only the first point, as sent in `stroke-begin`.
    pub fn head(&self) -> Stroke {
        Stroke {
            points: self.points.iter().take(1).copied().collect(),
            ..self.clone()
        }
    }

    /// Structural sanity check for strokes arriving from other replicas.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.origin != self.id.origin {
            return Err(CoreError::MalformedEvent(format!(
                "stroke {} claims origin {}",
                self.id, self.origin
            )));
        }
        if self.page == 0 {
            return Err(CoreError::MalformedEvent(format!("stroke {} on page 0", self.id)));
        }
        if !self.width.is_finite() || self.width <= 0.0 {
            return Err(CoreError::MalformedEvent(format!(
                "stroke {} has width {}",
                self.id, self.width
            )));
        }
        validate_points(&self.points)
    }
}

/// Reject non-finite coordinates.
pub fn validate_points(points: &[Point]) -> Result<(), CoreError> {
    match points.iter().position(|p| !p.is_finite()) {
        Some(i) => Err(CoreError::MalformedEvent(format!("non-numeric point at index {i}"))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stroke() -> Stroke {
        let id = StrokeId::new(Uuid::new_v4(), 1);
        let mut s = Stroke::new(id, 1, StrokeMode::Draw, Color::BLACK, 3.0);
        s.points = vec![Point::new(0.1, 0.1), Point::new(0.2, 0.2), Point::new(0.3, 0.3)];
        s
    }

    #[test]
    fn test_color_hex() {
        let c = Color::from_hex("#ff8000").unwrap();
        assert_eq!(c, Color::rgb(255, 128, 0));
        assert_eq!(c.to_hex(), "#ff8000");

        let translucent = Color::from_hex("11223380").unwrap();
        assert_eq!(translucent.a, 0x80);
        assert_eq!(translucent.to_hex(), "#11223380");

        assert!(Color::from_hex("#12345").is_err());
        assert!(Color::from_hex("#gg0000").is_err());
    }

    #[test]
    fn test_color_serializes_as_string() {
        let json = serde_json::to_string(&Color::rgb(1, 2, 3)).unwrap();
        assert_eq!(json, "\"#010203\"");
        let back: Color = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Color::rgb(1, 2, 3));
        assert!(serde_json::from_str::<Color>("\"red\"").is_err());
    }

    #[test]
    fn test_stamp_clock_strictly_increasing() {
        let mut clock = StampClock::new();
        let mut last = 0;
        for _ in 0..1000 {
            let next = clock.next();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_stroke_id_display() {
        let origin = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let id = StrokeId::new(origin, 42);
        assert_eq!(id.to_string(), "550e8400-e29b-41d4-a716-446655440000-42");
    }

    #[test]
    fn test_head_keeps_first_point() {
        let s = stroke();
        let head = s.head();
        assert_eq!(head.points, vec![Point::new(0.1, 0.1)]);
        assert_eq!(head.id, s.id);
        assert!(!head.is_renderable());
        assert!(s.is_renderable());
    }

    #[test]
    fn test_validate_rejects_nan() {
        let mut s = stroke();
        assert!(s.validate().is_ok());
        s.points.push(Point::new(f32::NAN, 0.5));
        assert!(matches!(s.validate(), Err(CoreError::MalformedEvent(_))));
    }

    #[test]
    fn test_validate_rejects_forged_origin() {
        let mut s = stroke();
        s.origin = Uuid::new_v4();
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_point_clamped() {
        assert_eq!(Point::new(-0.2, 1.4).clamped(), Point::new(0.0, 1.0));
    }
}

// ============================================================================
// BRUSH ENGINE - binary circular stamps, path resampling, per-stroke state
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::canvas::DirtyRect;
use crate::components::history::Stroke;
use crate::error::SequenceError;

/// Default stamp spacing as a fraction of brush diameter.
pub const DEFAULT_SPACING: f32 = 0.3;

/// Resampling never steps by less than this many pixels.
const MIN_STEP_PX: f32 = 0.5;

/// What a stamp writes into the mask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BrushMode {
    #[default]
    Paint,
    Erase,
}

impl BrushMode {
    /// Mask value written by this mode.
    #[inline]
    pub fn target_value(self) -> u8 {
        match self {
            BrushMode::Paint => 255,
            BrushMode::Erase => 0,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BrushMode::Paint => "paint",
            BrushMode::Erase => "erase",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paint" | "brush" => Some(BrushMode::Paint),
            "erase" | "eraser" => Some(BrushMode::Erase),
            _ => None,
        }
    }
}

/// A position in image space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance_to(self, other: Point) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn rounded(self) -> Point {
        Point::new(self.x.round(), self.y.round())
    }
}

/// Outcome of one or more stamps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StampResult {
    pub changed: bool,
    /// Bounding box of pixels actually written (empty when nothing changed).
    pub dirty: DirtyRect,
}

impl StampResult {
    pub fn merge(&mut self, other: StampResult) {
        self.changed |= other.changed;
        self.dirty = self.dirty.union(other.dirty);
    }
}

#[inline]
fn stamp_radius(size: f32) -> i64 {
    if size.is_finite() && size > 0.0 {
        (size / 2.0).floor() as i64
    } else {
        0
    }
}

/// Footprint a stamp *could* touch, clipped to the buffer.  Used to capture
/// pixels before they are written.
pub fn stamp_bounds(cx: f32, cy: f32, size: f32, width: u32, height: u32) -> DirtyRect {
    let r = stamp_radius(size);
    let (x, y) = (cx.round() as i64, cy.round() as i64);
    DirtyRect::from_signed(x - r, y - r, x + r + 1, y + r + 1, width, height)
}

/// Footprint of every stamp a segment between `a` and `b` can emit.
pub fn segment_bounds(a: Point, b: Point, size: f32, width: u32, height: u32) -> DirtyRect {
    let r = stamp_radius(size) + 1;
    let min_x = a.x.min(b.x).round() as i64 - r;
    let min_y = a.y.min(b.y).round() as i64 - r;
    let max_x = a.x.max(b.x).round() as i64 + r + 1;
    let max_y = a.y.max(b.y).round() as i64 + r + 1;
    DirtyRect::from_signed(min_x, min_y, max_x, max_y, width, height)
}

/// Write a filled circle of radius `floor(size / 2)` centred on the rounded
/// `(cx, cy)`.  Pixels already at the target value are left alone, so a
/// repeated stamp reports no change.
pub fn apply_stamp(
    buffer: &mut [u8],
    width: u32,
    height: u32,
    cx: f32,
    cy: f32,
    size: f32,
    mode: BrushMode,
) -> StampResult {
    let mut result = StampResult::default();
    let w = width as usize;
    if buffer.len() < w * height as usize || !cx.is_finite() || !cy.is_finite() {
        return result;
    }

    let target = mode.target_value();
    let r = stamp_radius(size);
    let r_sq = r * r;
    let (x0, y0) = (cx.round() as i64, cy.round() as i64);

    let min_x = (x0 - r).max(0);
    let max_x = (x0 + r).min(width as i64 - 1);
    let min_y = (y0 - r).max(0);
    let max_y = (y0 + r).min(height as i64 - 1);
    if min_x > max_x || min_y > max_y {
        return result;
    }

    let (mut bx0, mut by0, mut bx1, mut by1) = (u32::MAX, u32::MAX, 0u32, 0u32);
    for y in min_y..=max_y {
        let dy = y - y0;
        let dy_sq = dy * dy;
        if dy_sq > r_sq {
            continue;
        }
        let row = y as usize * w;
        for x in min_x..=max_x {
            let dx = x - x0;
            if dx * dx + dy_sq > r_sq {
                continue;
            }
            let px = &mut buffer[row + x as usize];
            if *px != target {
                *px = target;
                bx0 = bx0.min(x as u32);
                bx1 = bx1.max(x as u32);
                by0 = by0.min(y as u32);
                by1 = by1.max(y as u32);
                result.changed = true;
            }
        }
    }

    if result.changed {
        result.dirty = DirtyRect::new(bx0, by0, bx1 + 1, by1 + 1);
    }
    result
}

/// Evenly spaced stamp positions between two path samples.
///
/// Returns nothing when the samples are closer than one spacing step; the
/// last stamp already covers the gap.  Otherwise the segment is cut into
/// `ceil(distance / step)` equal steps and every step end (including `end`)
/// is returned, rounded to whole pixels.
pub fn resample_path(start: Point, end: Point, brush_size: f32, spacing: f32) -> Vec<Point> {
    let step = (brush_size * spacing).max(MIN_STEP_PX);
    let distance = start.distance_to(end);
    if !distance.is_finite() || distance < step {
        return Vec::new();
    }

    let steps = (distance / step).ceil() as usize;
    let (dx, dy) = (end.x - start.x, end.y - start.y);
    (1..=steps)
        .map(|i| {
            let t = i as f32 / steps as f32;
            Point::new(start.x + dx * t, start.y + dy * t).rounded()
        })
        .collect()
}

/// Stamp a whole recorded path: the first point, then the resampled
/// positions between each consecutive pair, in order.
pub fn apply_stroke_path(
    buffer: &mut [u8],
    width: u32,
    height: u32,
    points: &[Point],
    size: f32,
    mode: BrushMode,
    spacing: f32,
) -> StampResult {
    let mut result = StampResult::default();
    let Some(first) = points.first() else {
        return result;
    };
    result.merge(apply_stamp(buffer, width, height, first.x, first.y, size, mode));

    for pair in points.windows(2) {
        for p in resample_path(pair[0], pair[1], size, spacing) {
            result.merge(apply_stamp(buffer, width, height, p.x, p.y, size, mode));
        }
    }
    result
}

/// Replay a sealed stroke onto a buffer.
pub fn apply_stroke(buffer: &mut [u8], width: u32, height: u32, stroke: &Stroke) -> StampResult {
    apply_stroke_path(
        buffer,
        width,
        height,
        &stroke.points,
        stroke.brush_size,
        stroke.mode,
        stroke.spacing,
    )
}

/// True when every value is 0 or 255.
pub fn validate_binary(buffer: &[u8]) -> bool {
    buffer.iter().all(|&v| v == 0 || v == 255)
}

/// Number of values that are neither 0 nor 255.
pub fn count_non_binary(buffer: &[u8]) -> usize {
    buffer.iter().filter(|&&v| v != 0 && v != 255).count()
}

/// Clamp every value to 0 or 255 around the midpoint (>127 → 255).
/// Returns how many values were corrected.
pub fn enforce_binary(buffer: &mut [u8]) -> usize {
    let mut corrected = 0;
    for v in buffer.iter_mut() {
        if *v != 0 && *v != 255 {
            *v = if *v > 127 { 255 } else { 0 };
            corrected += 1;
        }
    }
    corrected
}

// ============================================================================
// STROKE BUILDER - Idle → Active → Idle
// ============================================================================

struct ActiveStroke {
    points: Vec<Point>,
    size: f32,
    mode: BrushMode,
    spacing: f32,
    last_stamp: Point,
}

/// Accumulates the points of the stroke in progress and stamps as it goes.
#[derive(Default)]
pub struct StrokeBuilder {
    active: Option<ActiveStroke>,
}

impl StrokeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn last_stamp_position(&self) -> Option<Point> {
        self.active.as_ref().map(|a| a.last_stamp)
    }

    /// Brush size of the stroke in progress.
    pub fn active_size(&self) -> Option<f32> {
        self.active.as_ref().map(|a| a.size)
    }

    pub fn point_count(&self) -> usize {
        self.active.as_ref().map_or(0, |a| a.points.len())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn start(
        &mut self,
        buffer: &mut [u8],
        width: u32,
        height: u32,
        at: Point,
        size: f32,
        mode: BrushMode,
        spacing: f32,
    ) -> Result<StampResult, SequenceError> {
        if self.active.is_some() {
            return Err(SequenceError::StrokeAlreadyActive);
        }
        let result = apply_stamp(buffer, width, height, at.x, at.y, size, mode);
        self.active = Some(ActiveStroke {
            points: vec![at],
            size,
            mode,
            spacing,
            last_stamp: at,
        });
        Ok(result)
    }

    /// Extend the stroke to `to`.  The last stamp position moves to `to` even
    /// when the step was too short to emit a stamp.
    pub fn continue_to(
        &mut self,
        buffer: &mut [u8],
        width: u32,
        height: u32,
        to: Point,
    ) -> Result<StampResult, SequenceError> {
        let active = self.active.as_mut().ok_or(SequenceError::NoActiveStroke)?;
        let mut result = StampResult::default();
        for p in resample_path(active.last_stamp, to, active.size, active.spacing) {
            result.merge(apply_stamp(buffer, width, height, p.x, p.y, active.size, active.mode));
        }
        active.points.push(to);
        active.last_stamp = to;
        Ok(result)
    }

    /// Seal the stroke.
    pub fn end(&mut self) -> Result<Stroke, SequenceError> {
        let active = self.active.take().ok_or(SequenceError::NoActiveStroke)?;
        Ok(Stroke::new(active.points, active.size, active.mode, active.spacing))
    }

    /// Drop the stroke in progress without sealing it.
    pub fn abandon(&mut self) -> bool {
        self.active.take().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(buf: &[u8], v: u8) -> usize {
        buf.iter().filter(|&&p| p == v).count()
    }

    #[test]
    fn test_stamp_disc_area() {
        let mut buf = vec![0u8; 100 * 100];
        let r = apply_stamp(&mut buf, 100, 100, 50.0, 50.0, 20.0, BrushMode::Paint);
        assert!(r.changed);
        // Lattice points with x² + y² <= 100
        assert_eq!(count(&buf, 255), 317);
        assert_eq!(r.dirty, DirtyRect::new(40, 40, 61, 61));
        assert_eq!(buf[50 * 100 + 50], 255);
        assert_eq!(buf[50 * 100 + 61], 0);
        assert_eq!(buf[39 * 100 + 50], 0);
    }

    #[test]
    fn test_stamp_idempotent() {
        let mut buf = vec![0u8; 64 * 64];
        apply_stamp(&mut buf, 64, 64, 20.0, 20.0, 9.0, BrushMode::Paint);
        let before = buf.clone();
        let r = apply_stamp(&mut buf, 64, 64, 20.0, 20.0, 9.0, BrushMode::Paint);
        assert!(!r.changed);
        assert!(r.dirty.is_empty());
        assert_eq!(buf, before);
    }

    #[test]
    fn test_erase_clears() {
        let mut buf = vec![255u8; 32 * 32];
        let r = apply_stamp(&mut buf, 32, 32, 16.0, 16.0, 4.0, BrushMode::Erase);
        assert!(r.changed);
        // radius 2 → 13 lattice points
        assert_eq!(count(&buf, 0), 13);
    }

    #[test]
    fn test_stamp_clipped_at_corner() {
        let mut buf = vec![0u8; 10 * 10];
        let r = apply_stamp(&mut buf, 10, 10, 0.0, 0.0, 6.0, BrushMode::Paint);
        assert!(r.changed);
        assert_eq!(r.dirty.min_x, 0);
        assert_eq!(r.dirty.min_y, 0);
        // Quarter disc of radius 3 including axes: 11 points
        assert_eq!(count(&buf, 255), 11);
    }

    #[test]
    fn test_stamp_fully_outside() {
        let mut buf = vec![0u8; 10 * 10];
        let r = apply_stamp(&mut buf, 10, 10, -20.0, 5.0, 6.0, BrushMode::Paint);
        assert!(!r.changed);
        assert_eq!(count(&buf, 255), 0);
    }

    #[test]
    fn test_stamp_rounds_centre() {
        let mut buf = vec![0u8; 10 * 10];
        apply_stamp(&mut buf, 10, 10, 4.6, 5.4, 1.0, BrushMode::Paint);
        assert_eq!(buf[5 * 10 + 5], 255);
        assert_eq!(count(&buf, 255), 1);
    }

    #[test]
    fn test_resample_too_close() {
        let pts = resample_path(Point::new(0.0, 0.0), Point::new(2.0, 0.0), 20.0, 0.3);
        assert!(pts.is_empty());
    }

    #[test]
    fn test_resample_even_steps() {
        // step = 5, distance = 20 → 4 steps
        let pts = resample_path(Point::new(0.0, 0.0), Point::new(20.0, 0.0), 20.0, 0.25);
        assert_eq!(
            pts,
            vec![
                Point::new(5.0, 0.0),
                Point::new(10.0, 0.0),
                Point::new(15.0, 0.0),
                Point::new(20.0, 0.0)
            ]
        );
    }

    #[test]
    fn test_resample_rounds_points() {
        // distance 10, step 3 → ceil(3.33) = 4 steps of 2.5
        let pts = resample_path(Point::new(0.0, 0.0), Point::new(0.0, 10.0), 10.0, 0.3);
        assert_eq!(pts.len(), 4);
        assert_eq!(pts[0], Point::new(0.0, 3.0));
        assert_eq!(pts[3], Point::new(0.0, 10.0));
    }

    #[test]
    fn test_stroke_path_has_no_gaps() {
        let mut buf = vec![0u8; 200 * 40];
        let pts = [Point::new(10.0, 20.0), Point::new(190.0, 20.0)];
        let r = apply_stroke_path(&mut buf, 200, 40, &pts, 10.0, BrushMode::Paint, 0.3);
        assert!(r.changed);
        for x in 10..=190 {
            assert_eq!(buf[20 * 200 + x], 255, "gap at x={}", x);
        }
        assert!(validate_binary(&buf));
    }

    #[test]
    fn test_stroke_path_empty() {
        let mut buf = vec![0u8; 16];
        let r = apply_stroke_path(&mut buf, 4, 4, &[], 3.0, BrushMode::Paint, 0.3);
        assert!(!r.changed);
    }

    #[test]
    fn test_enforce_binary_threshold() {
        let mut buf = vec![0, 1, 127, 128, 200, 255];
        assert!(!validate_binary(&buf));
        assert_eq!(count_non_binary(&buf), 4);
        assert_eq!(enforce_binary(&mut buf), 4);
        assert_eq!(buf, vec![0, 0, 0, 255, 255, 255]);
        assert!(validate_binary(&buf));
    }

    #[test]
    fn test_builder_sequence_errors() {
        let mut buf = vec![0u8; 32 * 32];
        let mut b = StrokeBuilder::new();
        assert_eq!(
            b.continue_to(&mut buf, 32, 32, Point::new(1.0, 1.0)).unwrap_err(),
            SequenceError::NoActiveStroke
        );
        assert_eq!(b.end().unwrap_err(), SequenceError::NoActiveStroke);

        b.start(&mut buf, 32, 32, Point::new(5.0, 5.0), 4.0, BrushMode::Paint, 0.3)
            .unwrap();
        assert_eq!(
            b.start(&mut buf, 32, 32, Point::new(5.0, 5.0), 4.0, BrushMode::Paint, 0.3)
                .unwrap_err(),
            SequenceError::StrokeAlreadyActive
        );
    }

    #[test]
    fn test_builder_tracks_last_position_without_stamps() {
        let mut buf = vec![0u8; 64 * 64];
        let mut b = StrokeBuilder::new();
        b.start(&mut buf, 64, 64, Point::new(10.0, 10.0), 20.0, BrushMode::Paint, 0.3)
            .unwrap();
        let r = b.continue_to(&mut buf, 64, 64, Point::new(11.0, 10.0)).unwrap();
        assert!(!r.changed);
        assert_eq!(b.last_stamp_position(), Some(Point::new(11.0, 10.0)));

        let stroke = b.end().unwrap();
        assert_eq!(stroke.points.len(), 2);
        assert!(!b.is_active());
    }

    #[test]
    fn test_builder_matches_replay() {
        let pts = [
            Point::new(5.0, 5.0),
            Point::new(30.0, 12.0),
            Point::new(31.0, 13.0),
            Point::new(50.0, 40.0),
            Point::new(12.0, 55.0),
        ];
        let mut live = vec![0u8; 64 * 64];
        let mut b = StrokeBuilder::new();
        b.start(&mut live, 64, 64, pts[0], 7.0, BrushMode::Paint, 0.3).unwrap();
        for p in &pts[1..] {
            b.continue_to(&mut live, 64, 64, *p).unwrap();
        }
        let stroke = b.end().unwrap();

        let mut replayed = vec![0u8; 64 * 64];
        apply_stroke(&mut replayed, 64, 64, &stroke);
        assert_eq!(live, replayed);
    }

    #[test]
    fn test_segment_bounds_cover_stamps() {
        let a = Point::new(10.0, 10.0);
        let b = Point::new(30.0, 15.0);
        let bounds = segment_bounds(a, b, 8.0, 64, 64);
        let mut buf = vec![0u8; 64 * 64];
        let r = apply_stroke_path(&mut buf, 64, 64, &[a, b], 8.0, BrushMode::Paint, 0.3);
        assert_eq!(bounds.union(r.dirty), bounds);
    }
}

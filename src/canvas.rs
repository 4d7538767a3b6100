use std::collections::HashMap;
use std::io::Cursor;

use image::{GrayImage, ImageBuffer, Luma, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::components::brush::{self, BrushMode, Point, StampResult};
use crate::error::{InvariantViolation, LoadError, MAX_IMAGE_DIM, WorkerError};
use crate::ops::tiles::{self, Tile};
use crate::{log_info, log_warn};

/// Single-pixel edits repaint this many pixels around the edit.
const SINGLE_PIXEL_DIRTY_RADIUS: i64 = 2;

// ============================================================================
// DIRTY RECT - half-open pixel rectangle [min, max)
// ============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirtyRect {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl DirtyRect {
    pub const EMPTY: DirtyRect = DirtyRect {
        min_x: 0,
        min_y: 0,
        max_x: 0,
        max_y: 0,
    };

    pub const fn new(min_x: u32, min_y: u32, max_x: u32, max_y: u32) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub const fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Build from signed bounds, clipped to `[0, width) × [0, height)`.
    pub fn from_signed(min_x: i64, min_y: i64, max_x: i64, max_y: i64, width: u32, height: u32) -> Self {
        let min_x = min_x.clamp(0, width as i64) as u32;
        let min_y = min_y.clamp(0, height as i64) as u32;
        let max_x = max_x.clamp(0, width as i64) as u32;
        let max_y = max_y.clamp(0, height as i64) as u32;
        if min_x >= max_x || min_y >= max_y {
            Self::EMPTY
        } else {
            Self::new(min_x, min_y, max_x, max_y)
        }
    }

    pub fn around(x: u32, y: u32, radius: i64, width: u32, height: u32) -> Self {
        let (x, y) = (x as i64, y as i64);
        Self::from_signed(x - radius, y - radius, x + radius + 1, y + radius + 1, width, height)
    }

    pub fn is_empty(&self) -> bool {
        self.min_x >= self.max_x || self.min_y >= self.max_y
    }

    pub fn width(&self) -> u32 {
        self.max_x.saturating_sub(self.min_x)
    }

    pub fn height(&self) -> u32 {
        self.max_y.saturating_sub(self.min_y)
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.min_x && x < self.max_x && y >= self.min_y && y < self.max_y
    }

    /// Smallest rectangle holding both.  Empty rectangles are ignored.
    pub fn union(self, other: DirtyRect) -> DirtyRect {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        DirtyRect::new(
            self.min_x.min(other.min_x),
            self.min_y.min(other.min_y),
            self.max_x.max(other.max_x),
            self.max_y.max(other.max_y),
        )
    }

    pub fn intersect(self, other: DirtyRect) -> DirtyRect {
        let r = DirtyRect::new(
            self.min_x.max(other.min_x),
            self.min_y.max(other.min_y),
            self.max_x.min(other.max_x),
            self.max_y.min(other.max_y),
        );
        if r.is_empty() { DirtyRect::EMPTY } else { r }
    }
}

// ============================================================================
// MASK BUFFER - width × height bytes, each 0 or 255
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskBuffer {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl MaskBuffer {
    /// All-zero mask.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize],
        }
    }

    /// Wrap raw bytes, checking the length against the dimensions.
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<Self, WorkerError> {
        let buffer = Self { width, height, data };
        buffer.check_len()?;
        Ok(buffer)
    }

    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn check_len(&self) -> Result<(), WorkerError> {
        if self.data.len() == self.expected_len() {
            Ok(())
        } else {
            Err(WorkerError::InvalidBuffer {
                expected: self.expected_len(),
                actual: self.data.len(),
            })
        }
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data.get(y as usize * self.width as usize + x as usize).copied()
    }

    pub fn count_set(&self) -> usize {
        self.data.iter().filter(|&&v| v == 255).count()
    }

    pub fn is_blank(&self) -> bool {
        self.data.iter().all(|&v| v == 0)
    }
}

// ============================================================================
// TILE PATCH - before-pixels of tiles touched by the stroke in progress
// ============================================================================

/// Tiles copied the first time a stroke touches them, so the stroke can be
/// rolled back exactly.
pub struct TilePatch {
    tile_size: u32,
    tiles: HashMap<(u32, u32), Tile>,
}

impl TilePatch {
    pub fn new(tile_size: u32) -> Self {
        Self {
            tile_size: tile_size.max(1),
            tiles: HashMap::new(),
        }
    }

    /// Copy every tile overlapping `rect` that is not already held.
    pub fn capture(&mut self, mask: &MaskBuffer, rect: DirtyRect) {
        if rect.is_empty() {
            return;
        }
        let ts = self.tile_size;
        let (tx0, ty0) = (rect.min_x / ts, rect.min_y / ts);
        let (tx1, ty1) = ((rect.max_x - 1) / ts, (rect.max_y - 1) / ts);
        for ty in ty0..=ty1 {
            for tx in tx0..=tx1 {
                self.tiles
                    .entry((tx, ty))
                    .or_insert_with(|| tiles::copy_tile(mask, tx, ty, ts));
            }
        }
    }

    /// Put the captured pixels back.  Returns the rectangle restored.
    pub fn restore(&self, mask: &mut MaskBuffer) -> DirtyRect {
        let mut rect = DirtyRect::EMPTY;
        for tile in self.tiles.values() {
            tiles::write_tile(mask, tile, self.tile_size);
            rect = rect.union(tile.rect(self.tile_size));
        }
        rect
    }

    pub fn clear(&mut self) {
        self.tiles.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    pub fn memory_bytes(&self) -> usize {
        self.tiles.values().map(Tile::memory_bytes).sum()
    }
}

// ============================================================================
// OVERLAY SURFACE - the raster the highlight is composited onto
// ============================================================================

/// A raster the overlay renderer can write RGBA pixels into.
pub trait OverlaySurface {
    fn dimensions(&self) -> (u32, u32);
    fn put_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]);
}

impl OverlaySurface for RgbaImage {
    fn dimensions(&self) -> (u32, u32) {
        ImageBuffer::dimensions(self)
    }

    fn put_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        ImageBuffer::put_pixel(self, x, y, Rgba(rgba));
    }
}

/// Highlight drawn where the mask is set.  Where it is clear the overlay is
/// fully transparent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayStyle {
    pub color: [u8; 3],
    pub alpha: u8,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            color: [255, 0, 0],
            alpha: 128,
        }
    }
}

impl OverlayStyle {
    #[inline]
    fn pixel_for(&self, mask_value: u8) -> [u8; 4] {
        if mask_value == 255 {
            [self.color[0], self.color[1], self.color[2], self.alpha]
        } else {
            [0, 0, 0, 0]
        }
    }
}

// ============================================================================
// MASK CANVAS - owns the mask, applies brush writes, tracks dirty regions
// ============================================================================

/// Metadata of the image the mask is painted over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub has_alpha: bool,
}

pub struct MaskCanvas {
    pub width: u32,
    pub height: u32,
    pub info: ImageInfo,
    mask: MaskBuffer,
    /// Pending region to repaint, accumulated across edits.
    pub dirty_rect: Option<DirtyRect>,
    /// Bumped on every edit so hosts can detect change cheaply.
    pub dirty_generation: u64,
    pub overlay: OverlayStyle,
}

pub fn check_dimensions(width: u32, height: u32) -> Result<(), LoadError> {
    if (1..=MAX_IMAGE_DIM).contains(&width) && (1..=MAX_IMAGE_DIM).contains(&height) {
        Ok(())
    } else {
        Err(LoadError::InvalidDimensions { width, height })
    }
}

impl MaskCanvas {
    /// Blank mask for an image of the given size.
    pub fn new(width: u32, height: u32) -> Result<Self, LoadError> {
        check_dimensions(width, height)?;
        Ok(Self::with_info(ImageInfo {
            width,
            height,
            has_alpha: false,
        }))
    }

    /// Decode an encoded image (PNG, JPEG, WEBP, BMP) and size a blank mask
    /// to match it.  The header is checked before any pixel data is decoded.
    pub fn load_image(bytes: &[u8]) -> Result<Self, LoadError> {
        let (width, height) = image::io::Reader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| LoadError::Decode(e.to_string()))?
            .into_dimensions()?;
        if let Err(e) = check_dimensions(width, height) {
            log_warn!("Rejected image: {}", e);
            return Err(e);
        }

        let img = image::load_from_memory(bytes)?;
        log_info!("Loaded image {}×{} ({:?})", width, height, img.color());
        Ok(Self::with_info(ImageInfo {
            width,
            height,
            has_alpha: img.color().has_alpha(),
        }))
    }

    fn with_info(info: ImageInfo) -> Self {
        let mut canvas = Self {
            width: info.width,
            height: info.height,
            info,
            mask: MaskBuffer::new(info.width, info.height),
            dirty_rect: None,
            dirty_generation: 0,
            overlay: OverlayStyle::default(),
        };
        canvas.mark_dirty(None);
        canvas
    }

    pub fn mask(&self) -> &MaskBuffer {
        &self.mask
    }

    pub(crate) fn mask_mut(&mut self) -> &mut MaskBuffer {
        &mut self.mask
    }

    // ---- single-pixel access ------------------------------------------------

    /// Set one pixel.  Any non-zero-ish value is binarized (>127 → 255).
    /// Returns `true` when the pixel changed.
    pub fn update_mask_data(&mut self, x: u32, y: u32, value: u8) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        let value = if value > 127 { 255 } else { 0 };
        let idx = y as usize * self.width as usize + x as usize;
        if self.mask.data[idx] == value {
            return false;
        }
        self.mask.data[idx] = value;
        let rect = DirtyRect::around(x, y, SINGLE_PIXEL_DIRTY_RADIUS, self.width, self.height);
        self.mark_dirty(Some(rect));
        true
    }

    pub fn get_mask_value(&self, x: u32, y: u32) -> Option<u8> {
        self.mask.get(x, y)
    }

    // ---- bulk operations ----------------------------------------------------

    pub fn clear(&mut self) {
        self.mask.data.fill(0);
        self.mark_dirty(None);
    }

    pub fn fill(&mut self) {
        self.mask.data.fill(255);
        self.mark_dirty(None);
    }

    /// Replace the whole mask (history replay, worker results).  The new data
    /// is checked and repaired before it becomes visible.
    pub fn replace_mask(&mut self, buffer: MaskBuffer) -> Result<(), WorkerError> {
        if buffer.width != self.width || buffer.height != self.height {
            return Err(WorkerError::InvalidBuffer {
                expected: self.mask.expected_len(),
                actual: buffer.data.len(),
            });
        }
        buffer.check_len()?;
        self.mask = buffer;
        self.enforce_binary();
        self.mark_dirty(None);
        Ok(())
    }

    // ---- brush writes -------------------------------------------------------

    pub fn apply_stamp(&mut self, cx: f32, cy: f32, size: f32, mode: BrushMode) -> StampResult {
        let result = brush::apply_stamp(&mut self.mask.data, self.width, self.height, cx, cy, size, mode);
        self.mark_stamp(result);
        result
    }

    pub fn apply_stroke_path(&mut self, points: &[Point], size: f32, mode: BrushMode, spacing: f32) -> StampResult {
        let result = brush::apply_stroke_path(
            &mut self.mask.data,
            self.width,
            self.height,
            points,
            size,
            mode,
            spacing,
        );
        self.mark_stamp(result);
        result
    }

    /// Record the dirty area of a brush write done directly on the buffer.
    pub fn mark_stamp(&mut self, result: StampResult) {
        if result.changed {
            self.mark_dirty(Some(result.dirty));
        }
    }

    // ---- invariant ------------------------------------------------------------

    pub fn validate(&self) -> Result<(), InvariantViolation> {
        match brush::count_non_binary(&self.mask.data) {
            0 => Ok(()),
            count => Err(InvariantViolation::NonBinary { count }),
        }
    }

    /// Repair non-binary values.  Returns how many were corrected.
    pub fn enforce_binary(&mut self) -> usize {
        let corrected = brush::enforce_binary(&mut self.mask.data);
        if corrected > 0 {
            log_warn!("{}; repaired", InvariantViolation::NonBinary { count: corrected });
            self.mark_dirty(None);
        }
        corrected
    }

    // ---- export ---------------------------------------------------------------

    /// The mask as an 8-bit grayscale raster (0 = transparent, 255 = masked).
    pub fn export_as_raster(&self) -> GrayImage {
        let w = self.width as usize;
        GrayImage::from_fn(self.width, self.height, |x, y| {
            Luma([self.mask.data[y as usize * w + x as usize]])
        })
    }

    // ---- dirty tracking -------------------------------------------------------

    pub fn mark_dirty(&mut self, rect: Option<DirtyRect>) {
        let full = DirtyRect::full(self.width, self.height);
        let new_rect = rect.unwrap_or(full).intersect(full);
        if new_rect.is_empty() {
            return;
        }
        // Merge with any existing dirty rect so we never lose pending updates
        self.dirty_rect = Some(match self.dirty_rect {
            Some(existing) => existing.union(new_rect),
            None => new_rect,
        });
        self.dirty_generation = self.dirty_generation.wrapping_add(1);
    }

    pub fn take_dirty(&mut self) -> Option<DirtyRect> {
        self.dirty_rect.take()
    }

    // ---- overlay rendering ------------------------------------------------------

    /// Repaint the pending dirty rectangle of the overlay and clear it.
    /// Surfaces of a different size are treated as stale and repainted over
    /// the overlapping area.
    pub fn render_overlay<S: OverlaySurface + ?Sized>(&mut self, surface: &mut S) -> Option<DirtyRect> {
        let (sw, sh) = surface.dimensions();
        let pending = self.dirty_rect.take()?;
        let area = if (sw, sh) == (self.width, self.height) {
            pending
        } else {
            DirtyRect::full(self.width, self.height)
        };
        let area = area.intersect(DirtyRect::full(sw, sh));
        self.paint_overlay(surface, area);
        Some(area)
    }

    /// Repaint the whole overlay regardless of pending state.
    pub fn render_overlay_full<S: OverlaySurface + ?Sized>(&mut self, surface: &mut S) -> DirtyRect {
        self.dirty_rect = None;
        let (sw, sh) = surface.dimensions();
        let area = DirtyRect::full(self.width, self.height).intersect(DirtyRect::full(sw, sh));
        self.paint_overlay(surface, area);
        area
    }

    fn paint_overlay<S: OverlaySurface + ?Sized>(&self, surface: &mut S, area: DirtyRect) {
        let w = self.width as usize;
        for y in area.min_y..area.max_y {
            let row = y as usize * w;
            for x in area.min_x..area.max_x {
                let v = self.mask.data[row + x as usize];
                surface.put_pixel(x, y, self.overlay.pixel_for(v));
            }
        }
    }

    /// A fresh overlay raster matching the mask.
    pub fn new_overlay_surface(&self) -> RgbaImage {
        RgbaImage::new(self.width, self.height)
    }

    pub fn memory_bytes(&self) -> usize {
        self.mask.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_limits() {
        assert!(MaskCanvas::new(1, 1).is_ok());
        assert!(MaskCanvas::new(8192, 8192).is_ok());
        assert!(matches!(
            MaskCanvas::new(0, 10),
            Err(LoadError::InvalidDimensions { width: 0, height: 10 })
        ));
        assert!(matches!(
            MaskCanvas::new(10, 8193),
            Err(LoadError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn test_load_image_png() {
        let img = RgbaImage::new(12, 7);
        let mut bytes = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageOutputFormat::Png)
            .unwrap();
        let canvas = MaskCanvas::load_image(&bytes).unwrap();
        assert_eq!((canvas.width, canvas.height), (12, 7));
        assert!(canvas.info.has_alpha);
        assert!(canvas.mask().is_blank());
    }

    fn crc32(bytes: &[u8]) -> u32 {
        let mut crc = 0xFFFF_FFFFu32;
        for &b in bytes {
            crc ^= b as u32;
            for _ in 0..8 {
                crc = if crc & 1 != 0 { (crc >> 1) ^ 0xEDB8_8320 } else { crc >> 1 };
            }
        }
        !crc
    }

    #[test]
    fn test_load_image_rejects_oversized_header() {
        let img = GrayImage::new(4, 4);
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageOutputFormat::Png)
            .unwrap();
        assert_eq!(&bytes[12..16], b"IHDR");

        // Claim 20000×20000 in IHDR; the pixel data stays 4×4
        bytes[16..20].copy_from_slice(&20_000u32.to_be_bytes());
        bytes[20..24].copy_from_slice(&20_000u32.to_be_bytes());
        let crc = crc32(&bytes[12..29]);
        bytes[29..33].copy_from_slice(&crc.to_be_bytes());

        assert!(matches!(
            MaskCanvas::load_image(&bytes),
            Err(LoadError::InvalidDimensions {
                width: 20_000,
                height: 20_000
            })
        ));
    }

    #[test]
    fn test_load_image_garbage() {
        assert!(matches!(
            MaskCanvas::load_image(b"definitely not an image"),
            Err(LoadError::Decode(_))
        ));
    }

    #[test]
    fn test_update_mask_data_binarizes() {
        let mut c = MaskCanvas::new(10, 10).unwrap();
        c.take_dirty();
        assert!(c.update_mask_data(3, 4, 200));
        assert_eq!(c.get_mask_value(3, 4), Some(255));
        assert_eq!(c.take_dirty(), Some(DirtyRect::new(1, 2, 6, 7)));

        assert!(!c.update_mask_data(3, 4, 128));
        assert!(c.update_mask_data(3, 4, 127));
        assert_eq!(c.get_mask_value(3, 4), Some(0));
        assert!(!c.update_mask_data(10, 0, 255));
        assert_eq!(c.get_mask_value(10, 0), None);
    }

    #[test]
    fn test_clear_and_fill() {
        let mut c = MaskCanvas::new(4, 4).unwrap();
        c.fill();
        assert_eq!(c.mask().count_set(), 16);
        c.clear();
        assert!(c.mask().is_blank());
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_dirty_rect_unions_stamps() {
        let mut c = MaskCanvas::new(100, 100).unwrap();
        c.take_dirty();
        c.apply_stamp(10.0, 10.0, 4.0, BrushMode::Paint);
        c.apply_stamp(50.0, 60.0, 4.0, BrushMode::Paint);
        assert_eq!(c.take_dirty(), Some(DirtyRect::new(8, 8, 53, 63)));
        // Nothing changed → nothing pending
        c.apply_stamp(50.0, 60.0, 4.0, BrushMode::Paint);
        assert_eq!(c.take_dirty(), None);
    }

    #[test]
    fn test_overlay_only_repaints_dirty_area() {
        let mut c = MaskCanvas::new(20, 20).unwrap();
        let mut surface = c.new_overlay_surface();
        c.render_overlay(&mut surface);

        // Poison a pixel outside the next dirty rect; it must survive
        OverlaySurface::put_pixel(&mut surface, 0, 0, [1, 2, 3, 4]);
        c.apply_stamp(15.0, 15.0, 2.0, BrushMode::Paint);
        let painted = c.render_overlay(&mut surface).unwrap();
        assert_eq!(painted, DirtyRect::new(14, 14, 17, 17));
        assert_eq!(surface.get_pixel(0, 0).0, [1, 2, 3, 4]);
        assert_eq!(surface.get_pixel(15, 15).0, [255, 0, 0, 128]);
        assert_eq!(surface.get_pixel(14, 14).0, [0, 0, 0, 0]);
        assert!(c.render_overlay(&mut surface).is_none());
        // Overlay never feeds back into the mask
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_replace_mask_enforces_binary() {
        let mut c = MaskCanvas::new(2, 2).unwrap();
        let m = MaskBuffer::from_raw(2, 2, vec![0, 90, 130, 255]).unwrap();
        c.replace_mask(m).unwrap();
        assert_eq!(c.mask().data, vec![0, 0, 255, 255]);
        assert!(c.replace_mask(MaskBuffer::new(3, 2)).is_err());
    }

    #[test]
    fn test_export_raster() {
        let mut c = MaskCanvas::new(3, 2).unwrap();
        c.update_mask_data(2, 1, 255);
        let raster = c.export_as_raster();
        assert_eq!(raster.dimensions(), (3, 2));
        assert_eq!(raster.get_pixel(2, 1).0, [255]);
        assert_eq!(raster.get_pixel(0, 0).0, [0]);
    }

    #[test]
    fn test_tile_patch_restores() {
        let mut mask = MaskBuffer::new(100, 100);
        mask.data[0] = 255;
        let before = mask.clone();

        let mut patch = TilePatch::new(32);
        let rect = brush::stamp_bounds(40.0, 40.0, 30.0, 100, 100);
        patch.capture(&mask, rect);
        brush::apply_stamp(&mut mask.data, 100, 100, 40.0, 40.0, 30.0, BrushMode::Paint);
        brush::apply_stamp(&mut mask.data, 100, 100, 0.0, 0.0, 3.0, BrushMode::Erase);
        // Second capture of a region must not overwrite the original pixels
        patch.capture(&mask, DirtyRect::new(0, 0, 2, 2));
        patch.capture(&mask, rect);

        let restored = patch.restore(&mut mask);
        assert_eq!(restored, DirtyRect::new(0, 0, 64, 64));
        // The erase at (0,0) happened after its tile was first captured
        assert_eq!(mask, before);
        assert_eq!(patch.tile_count(), 4);
    }

    #[test]
    fn test_dirty_rect_ops() {
        let a = DirtyRect::new(0, 0, 4, 4);
        let b = DirtyRect::new(2, 2, 6, 6);
        assert_eq!(a.union(b), DirtyRect::new(0, 0, 6, 6));
        assert_eq!(a.intersect(b), DirtyRect::new(2, 2, 4, 4));
        assert!(a.intersect(DirtyRect::new(5, 5, 6, 6)).is_empty());
        assert_eq!(DirtyRect::EMPTY.union(b), b);
        assert_eq!(DirtyRect::from_signed(-3, -3, 2, 2, 10, 10), DirtyRect::new(0, 0, 2, 2));
    }
}

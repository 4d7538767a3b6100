// ============================================================================
// VIEWPORT - contain-fit base scale composed with interactive zoom/pan
// ============================================================================
//
//   relative = (image - image_size / 2) * base
//   screen   = container_center + relative * scale + translate
//
// Screen coordinates are relative to the container's top-left corner.  Every
// conversion reads the `Viewport` by value, so forward and inverse mappings
// always see the same transform.

use serde::{Deserialize, Serialize};

/// Interactive part of the transform.  `translate_*` are screen pixels
/// applied about the container centre, after the contain scale.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewportTransform {
    pub scale: f64,
    pub translate_x: f64,
    pub translate_y: f64,
}

impl Default for ViewportTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl ViewportTransform {
    pub const IDENTITY: ViewportTransform = ViewportTransform {
        scale: 1.0,
        translate_x: 0.0,
        translate_y: 0.0,
    };

    pub fn new(scale: f64, translate_x: f64, translate_y: f64) -> Self {
        Self {
            scale,
            translate_x,
            translate_y,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZoomLimits {
    pub min: f64,
    pub max: f64,
}

impl Default for ZoomLimits {
    fn default() -> Self {
        Self { min: 0.1, max: 10.0 }
    }
}

impl ZoomLimits {
    pub fn clamp(&self, scale: f64) -> f64 {
        if !scale.is_finite() {
            return 1.0_f64.clamp(self.min, self.max);
        }
        scale.clamp(self.min, self.max)
    }
}

/// Scale that fits an image inside a container while keeping its aspect
/// ratio.  Zero-sized inputs give 0.
pub fn contain_scale(container_w: f64, container_h: f64, image_w: f64, image_h: f64) -> f64 {
    if container_w <= 0.0 || container_h <= 0.0 || image_w <= 0.0 || image_h <= 0.0 {
        return 0.0;
    }
    (container_w / image_w).min(container_h / image_h)
}

/// Everything needed to map between image and screen space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub container_width: f64,
    pub container_height: f64,
    pub image_width: f64,
    pub image_height: f64,
    pub transform: ViewportTransform,
    pub limits: ZoomLimits,
    /// Screen pixels of image that must stay inside the container when panning.
    pub pan_padding: f64,
}

impl Viewport {
    pub fn new(container_width: f64, container_height: f64, image_width: u32, image_height: u32) -> Self {
        Self {
            container_width,
            container_height,
            image_width: image_width as f64,
            image_height: image_height as f64,
            transform: ViewportTransform::IDENTITY,
            limits: ZoomLimits::default(),
            pan_padding: 40.0,
        }
    }

    pub fn base_scale(&self) -> f64 {
        contain_scale(
            self.container_width,
            self.container_height,
            self.image_width,
            self.image_height,
        )
    }

    /// Size of the image on screen at the current zoom.
    pub fn displayed_size(&self) -> (f64, f64) {
        let s = self.base_scale() * self.transform.scale;
        (self.image_width * s, self.image_height * s)
    }

    pub fn container_center(&self) -> (f64, f64) {
        (self.container_width / 2.0, self.container_height / 2.0)
    }

    // ---- mapping --------------------------------------------------------------

    /// Image pixel coordinates → container screen coordinates.
    pub fn image_to_screen(&self, ix: f64, iy: f64) -> (f64, f64) {
        let base = self.base_scale();
        let t = self.transform;
        let (cx, cy) = self.container_center();
        let rel_x = (ix - self.image_width / 2.0) * base;
        let rel_y = (iy - self.image_height / 2.0) * base;
        (cx + rel_x * t.scale + t.translate_x, cy + rel_y * t.scale + t.translate_y)
    }

    /// Inverse of `image_to_screen` without any bounds checks.  `None` only
    /// when the transform is degenerate (zero-size container or zero scale).
    pub fn screen_to_image_unbounded(&self, sx: f64, sy: f64) -> Option<(f64, f64)> {
        let base = self.base_scale();
        let t = self.transform;
        let k = base * t.scale;
        if !k.is_finite() || k.abs() < f64::EPSILON {
            return None;
        }
        let (cx, cy) = self.container_center();
        let rel_x = (sx - cx - t.translate_x) / t.scale;
        let rel_y = (sy - cy - t.translate_y) / t.scale;
        Some((rel_x / base + self.image_width / 2.0, rel_y / base + self.image_height / 2.0))
    }

    /// Container screen coordinates → image coordinates.  `None` when the
    /// point lies outside the container or outside the image.
    pub fn screen_to_image(&self, sx: f64, sy: f64) -> Option<(f64, f64)> {
        if sx < 0.0 || sy < 0.0 || sx >= self.container_width || sy >= self.container_height {
            return None;
        }
        let (ix, iy) = self.screen_to_image_unbounded(sx, sy)?;
        if ix < 0.0 || iy < 0.0 || ix >= self.image_width || iy >= self.image_height {
            return None;
        }
        Some((ix, iy))
    }

    /// Like `screen_to_image` but floored to a pixel index.
    pub fn screen_to_pixel(&self, sx: f64, sy: f64) -> Option<(u32, u32)> {
        let (ix, iy) = self.screen_to_image(sx, sy)?;
        // Absorb rounding in the inverse so integer centres map back exactly
        let px = (ix + 1e-9).floor().min(self.image_width - 1.0);
        let py = (iy + 1e-9).floor().min(self.image_height - 1.0);
        Some((px as u32, py as u32))
    }

    // ---- interaction ------------------------------------------------------------

    pub fn set_transform(&mut self, transform: ViewportTransform) {
        self.transform = ViewportTransform {
            scale: self.limits.clamp(transform.scale),
            ..transform
        };
        self.clamp_pan();
    }

    /// Back to the contain fit, subject to the same zoom limits as any
    /// other transform.
    pub fn reset_transform(&mut self) {
        self.set_transform(ViewportTransform::IDENTITY);
    }

    /// Container resized: the contain scale follows, the interactive
    /// transform is kept (re-clamped).
    pub fn set_container_size(&mut self, width: f64, height: f64) {
        self.container_width = width.max(0.0);
        self.container_height = height.max(0.0);
        self.clamp_pan();
    }

    /// Multiply the zoom by `factor`, keeping the image point under
    /// `(anchor_x, anchor_y)` fixed on screen.
    pub fn zoom_at(&mut self, factor: f64, anchor_x: f64, anchor_y: f64) {
        if !factor.is_finite() || factor <= 0.0 {
            return;
        }
        let Some((ix, iy)) = self.screen_to_image_unbounded(anchor_x, anchor_y) else {
            return;
        };
        let new_scale = self.limits.clamp(self.transform.scale * factor);
        let base = self.base_scale();
        let (cx, cy) = self.container_center();
        let rel_x = (ix - self.image_width / 2.0) * base;
        let rel_y = (iy - self.image_height / 2.0) * base;
        self.transform = ViewportTransform {
            scale: new_scale,
            translate_x: anchor_x - cx - rel_x * new_scale,
            translate_y: anchor_y - cy - rel_y * new_scale,
        };
        self.clamp_pan();
    }

    /// Shift the image by a screen-space delta.
    pub fn pan_by(&mut self, dx: f64, dy: f64) {
        if !dx.is_finite() || !dy.is_finite() {
            return;
        }
        self.transform.translate_x += dx;
        self.transform.translate_y += dy;
        self.clamp_pan();
    }

    /// Largest |translate| per axis that keeps `pan_padding` pixels of the
    /// image visible.
    pub fn pan_limits(&self) -> (f64, f64) {
        let (dw, dh) = self.displayed_size();
        let lx = (self.container_width / 2.0 + dw / 2.0 - self.pan_padding).max(0.0);
        let ly = (self.container_height / 2.0 + dh / 2.0 - self.pan_padding).max(0.0);
        (lx, ly)
    }

    fn clamp_pan(&mut self) {
        let (lx, ly) = self.pan_limits();
        self.transform.translate_x = self.transform.translate_x.clamp(-lx, lx);
        self.transform.translate_y = self.transform.translate_y.clamp(-ly, ly);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn assert_close(a: (f64, f64), b: (f64, f64)) {
        assert!(
            (a.0 - b.0).abs() < 1e-6 && (a.1 - b.1).abs() < 1e-6,
            "{:?} != {:?}",
            a,
            b
        );
    }

    #[test]
    fn test_contain_scale_letterbox() {
        // Wide image in a square container → width-limited
        assert!((contain_scale(800.0, 800.0, 1600.0, 400.0) - 0.5).abs() < EPS);
        // Tall image → height-limited
        assert!((contain_scale(800.0, 600.0, 100.0, 300.0) - 2.0).abs() < EPS);
        assert_eq!(contain_scale(0.0, 600.0, 100.0, 300.0), 0.0);
    }

    #[test]
    fn test_identity_centres_image() {
        let vp = Viewport::new(800.0, 600.0, 400, 300);
        // base = 2 → image fills the container exactly
        assert_close(vp.image_to_screen(0.0, 0.0), (0.0, 0.0));
        assert_close(vp.image_to_screen(200.0, 150.0), (400.0, 300.0));
        assert_close(vp.image_to_screen(400.0, 300.0), (800.0, 600.0));
    }

    #[test]
    fn test_round_trip_scaled_translated() {
        let mut vp = Viewport::new(1000.0, 700.0, 640, 480);
        vp.pan_padding = 0.0;
        vp.set_transform(ViewportTransform::new(2.5, 30.0, -10.0));
        assert_eq!(vp.transform, ViewportTransform::new(2.5, 30.0, -10.0));

        for &(ix, iy) in &[(320.0, 240.0), (300.0, 250.5), (330.25, 229.75)] {
            let (sx, sy) = vp.image_to_screen(ix, iy);
            let back = vp.screen_to_image(sx, sy).expect("on screen");
            assert_close(back, (ix, iy));
            let px = vp.screen_to_pixel(sx, sy).expect("on screen");
            assert_eq!(px, (ix.floor() as u32, iy.floor() as u32));
        }
    }

    #[test]
    fn test_default_viewport_uses_general_formula() {
        let vp = Viewport::new(500.0, 500.0, 100, 50);
        // base = 5, image 500×250 centred vertically: top edge at y = 125
        assert_close(vp.image_to_screen(0.0, 0.0), (0.0, 125.0));
        assert_eq!(vp.screen_to_pixel(2.5, 127.5), Some((0, 0)));
        assert_eq!(vp.screen_to_pixel(7.5, 127.5), Some((1, 0)));
    }

    #[test]
    fn test_screen_to_image_rejects_outside() {
        let vp = Viewport::new(500.0, 500.0, 100, 50);
        // Letterbox band above the image
        assert!(vp.screen_to_image(250.0, 10.0).is_none());
        // Outside the container
        assert!(vp.screen_to_image(-1.0, 250.0).is_none());
        assert!(vp.screen_to_image(500.0, 250.0).is_none());
        assert!(vp.screen_to_image(250.0, 250.0).is_some());
    }

    #[test]
    fn test_zoom_keeps_anchor_fixed() {
        let mut vp = Viewport::new(800.0, 600.0, 400, 300);
        vp.pan_padding = 0.0;
        let anchor = (123.0, 456.0);
        let before = vp.screen_to_image(anchor.0, anchor.1).unwrap();
        vp.zoom_at(1.7, anchor.0, anchor.1);
        assert!((vp.transform.scale - 1.7).abs() < EPS);
        let after = vp.screen_to_image(anchor.0, anchor.1).unwrap();
        assert_close(before, after);
        assert_close(vp.image_to_screen(before.0, before.1), anchor);
    }

    #[test]
    fn test_zoom_clamped() {
        let mut vp = Viewport::new(800.0, 600.0, 400, 300);
        vp.zoom_at(1000.0, 400.0, 300.0);
        assert_eq!(vp.transform.scale, vp.limits.max);
        vp.zoom_at(1e-6, 400.0, 300.0);
        assert_eq!(vp.transform.scale, vp.limits.min);
        vp.zoom_at(0.0, 400.0, 300.0);
        assert_eq!(vp.transform.scale, vp.limits.min);
    }

    #[test]
    fn test_pan_clamped_to_padding() {
        let mut vp = Viewport::new(800.0, 600.0, 400, 300);
        vp.pan_padding = 40.0;
        vp.pan_by(10_000.0, -10_000.0);
        // half container + half image - padding = 400 + 400 - 40
        assert!((vp.transform.translate_x - 760.0).abs() < EPS);
        assert!((vp.transform.translate_y + 560.0).abs() < EPS);
        // The image's left edge now sits `padding` pixels from the right edge
        let (left, top) = vp.image_to_screen(0.0, 300.0);
        assert!((left - 760.0).abs() < EPS);
        assert!((top - 40.0).abs() < EPS);
    }

    #[test]
    fn test_reset_respects_zoom_limits() {
        let mut vp = Viewport::new(800.0, 600.0, 400, 300);
        vp.set_transform(ViewportTransform::new(3.0, 50.0, -20.0));
        vp.reset_transform();
        assert_eq!(vp.transform, ViewportTransform::IDENTITY);

        vp.limits.min = 2.0;
        vp.reset_transform();
        assert_eq!(vp.transform.scale, 2.0);
        assert_eq!((vp.transform.translate_x, vp.transform.translate_y), (0.0, 0.0));
    }

    #[test]
    fn test_resize_keeps_interactive_transform() {
        let mut vp = Viewport::new(800.0, 600.0, 400, 300);
        vp.set_transform(ViewportTransform::new(2.0, 15.0, 5.0));
        vp.set_container_size(400.0, 300.0);
        assert_eq!(vp.transform, ViewportTransform::new(2.0, 15.0, 5.0));
        assert!((vp.base_scale() - 1.0).abs() < EPS);
    }

    #[test]
    fn test_degenerate_container() {
        let vp = Viewport::new(0.0, 0.0, 10, 10);
        assert!(vp.screen_to_image_unbounded(0.0, 0.0).is_none());
        assert!(vp.screen_to_image(0.0, 0.0).is_none());
    }
}

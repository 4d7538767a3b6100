use image::GrayImage;
use std::collections::HashMap;
use uuid::Uuid;

use crate::canvas::{DirtyRect, MaskBuffer, MaskCanvas, OverlaySurface, TilePatch};
use crate::components::brush::{self, BrushMode, Point, StampResult, StrokeBuilder};
use crate::components::history::{EvictionReport, HistoryManager, Snapshot, SnapshotPolicy, Stroke};
use crate::components::input::{
    DrawRouter, GestureAction, GestureConfig, GestureState, PointerTracker, RawPointerEvent, StrokeCommand,
    WheelEvent,
};
use crate::error::{HistoryIntegrityError, InvariantViolation, LoadError, SequenceError};
use crate::ops::worker::{JobPayload, JobResult, MaskWorker, WorkerResponse};
use crate::settings::{EditorSettings, MAX_BRUSH_SIZE, MIN_BRUSH_SIZE};
use crate::viewport::{Viewport, ViewportTransform};
use crate::{log_info, log_warn};

/// What one pointer event did.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PointerOutcome {
    pub gesture: Option<GestureAction>,
    pub stroke: Option<StrokeCommand>,
}

/// One open mask-editing session: the mask, its history, the viewport and the
/// stroke in progress.
pub struct MaskSession {
    pub id: Uuid,
    canvas: MaskCanvas,
    history: HistoryManager,
    viewport: Viewport,
    settings: EditorSettings,

    brush_size: f32,
    brush_mode: BrushMode,
    drawing_enabled: bool,

    builder: StrokeBuilder,
    /// Before-pixels of the stroke in progress, for cancel.
    rollback: TilePatch,

    tracker: PointerTracker,
    router: DrawRouter,
    gestures: GestureState,
    gesture_config: GestureConfig,

    worker: Option<MaskWorker>,
    /// Worker request id → stroke the snapshot belongs to.
    pending_checkpoints: HashMap<u64, Uuid>,
}

impl MaskSession {
    /// Decode `bytes` and open a session sized to the image.
    pub fn load_image(
        bytes: &[u8],
        container_width: f64,
        container_height: f64,
        settings: EditorSettings,
    ) -> Result<Self, LoadError> {
        let canvas = MaskCanvas::load_image(bytes)?;
        Self::from_canvas(canvas, container_width, container_height, settings)
    }

    /// Session over a blank `width`×`height` mask.
    pub fn blank(
        width: u32,
        height: u32,
        container_width: f64,
        container_height: f64,
        settings: EditorSettings,
    ) -> Result<Self, LoadError> {
        let canvas = MaskCanvas::new(width, height)?;
        Self::from_canvas(canvas, container_width, container_height, settings)
    }

    fn from_canvas(
        mut canvas: MaskCanvas,
        container_width: f64,
        container_height: f64,
        settings: EditorSettings,
    ) -> Result<Self, LoadError> {
        if !(container_width.is_finite() && container_height.is_finite())
            || container_width <= 0.0
            || container_height <= 0.0
        {
            log_warn!(
                "No rendering surface ({}×{} container)",
                container_width,
                container_height
            );
            return Err(LoadError::MissingSurface);
        }

        canvas.overlay = settings.overlay_style();
        let mut viewport = Viewport::new(container_width, container_height, canvas.width, canvas.height);
        viewport.limits = settings.zoom_limits();
        viewport.pan_padding = settings.pan_padding;

        let history = HistoryManager::new(canvas.width, canvas.height, settings.history_config());
        let worker = settings.use_worker.then(MaskWorker::new);
        let id = Uuid::new_v4();
        log_info!(
            "Session {} opened: {}×{} mask, {} MB history budget, worker {}",
            id,
            canvas.width,
            canvas.height,
            settings.history_memory_mb,
            if worker.is_some() { "on" } else { "off" }
        );

        Ok(Self {
            id,
            rollback: TilePatch::new(settings.tile_size),
            gesture_config: settings.gesture_config(),
            brush_size: settings.brush_size,
            brush_mode: BrushMode::Paint,
            drawing_enabled: true,
            builder: StrokeBuilder::new(),
            tracker: PointerTracker::new(),
            router: DrawRouter::new(),
            gestures: GestureState::new(),
            pending_checkpoints: HashMap::new(),
            canvas,
            history,
            viewport,
            settings,
            worker,
        })
    }

    // ---- accessors --------------------------------------------------------------

    pub fn canvas(&self) -> &MaskCanvas {
        &self.canvas
    }

    pub fn mask(&self) -> &MaskBuffer {
        self.canvas.mask()
    }

    pub fn history(&self) -> &HistoryManager {
        &self.history
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    pub fn settings(&self) -> &EditorSettings {
        &self.settings
    }

    pub fn gestures(&self) -> &GestureState {
        &self.gestures
    }

    pub fn brush(&self) -> (f32, BrushMode) {
        (self.brush_size, self.brush_mode)
    }

    pub fn is_stroke_active(&self) -> bool {
        self.builder.is_active()
    }

    pub fn has_worker(&self) -> bool {
        self.worker.is_some()
    }

    pub fn pending_checkpoint_count(&self) -> usize {
        self.pending_checkpoints.len()
    }

    // ---- brush & mode -----------------------------------------------------------

    /// Applies from the next stroke on.
    pub fn set_brush(&mut self, size: f32, mode: BrushMode) {
        self.brush_size = if size.is_finite() {
            size.clamp(MIN_BRUSH_SIZE, MAX_BRUSH_SIZE)
        } else {
            self.settings.brush_size
        };
        self.brush_mode = mode;
    }

    /// Turning drawing off cancels the stroke in progress.
    pub fn set_drawing_enabled(&mut self, enabled: bool) {
        self.drawing_enabled = enabled;
        if !enabled {
            self.cancel_stroke();
            self.router.release();
        }
    }

    pub fn set_pan_enabled(&mut self, enabled: bool) {
        self.gesture_config.pan_enabled = enabled;
    }

    // ---- strokes (image coordinates) ----------------------------------------

    pub fn start_stroke(&mut self, x: f32, y: f32) -> Result<StampResult, SequenceError> {
        if self.builder.is_active() {
            return Err(SequenceError::StrokeAlreadyActive);
        }
        let (w, h) = (self.canvas.width, self.canvas.height);
        self.rollback.clear();
        self.rollback
            .capture(self.canvas.mask(), brush::stamp_bounds(x, y, self.brush_size, w, h));

        let mask = self.canvas.mask_mut();
        let result = self.builder.start(
            &mut mask.data,
            w,
            h,
            Point::new(x, y),
            self.brush_size,
            self.brush_mode,
            self.settings.brush_spacing,
        )?;
        self.canvas.mark_stamp(result);
        Ok(result)
    }

    pub fn continue_stroke(&mut self, x: f32, y: f32) -> Result<StampResult, SequenceError> {
        let (Some(last), Some(size)) = (self.builder.last_stamp_position(), self.builder.active_size()) else {
            return Err(SequenceError::NoActiveStroke);
        };
        let (w, h) = (self.canvas.width, self.canvas.height);
        let to = Point::new(x, y);
        self.rollback
            .capture(self.canvas.mask(), brush::segment_bounds(last, to, size, w, h));

        let mask = self.canvas.mask_mut();
        let result = self.builder.continue_to(&mut mask.data, w, h, to)?;
        self.canvas.mark_stamp(result);
        Ok(result)
    }

    /// Seal the stroke and commit it.  Returns the new stroke's id.
    pub fn end_stroke(&mut self) -> Result<Uuid, SequenceError> {
        let stroke = self.builder.end()?;
        self.rollback.clear();
        self.router.release();
        Ok(self.commit(stroke))
    }

    /// Abandon the stroke in progress and restore the pixels it wrote.
    pub fn cancel_stroke(&mut self) -> bool {
        if !self.builder.abandon() {
            return false;
        }
        let restored = self.rollback.restore(self.canvas.mask_mut());
        self.rollback.clear();
        self.canvas.mark_dirty(Some(restored));
        log_info!("Stroke cancelled; restored {}×{} px", restored.width(), restored.height());
        true
    }

    fn commit(&mut self, stroke: Stroke) -> Uuid {
        let id = stroke.id;
        let report = self.history.add_stroke(stroke);
        self.note_eviction(report);
        if self.history.checkpoint_due() {
            self.schedule_checkpoint(id);
        }
        id
    }

    fn note_eviction(&mut self, report: EvictionReport) {
        if report.strokes_evicted > 0 {
            // Checkpoint requests for folded strokes can no longer attach
            let history = &self.history;
            self.pending_checkpoints
                .retain(|_, stroke_id| history.index_of(*stroke_id).is_some());
        }
    }

    fn schedule_checkpoint(&mut self, stroke_id: Uuid) {
        let policy = self.settings.snapshot_policy;
        match (&mut self.worker, policy) {
            (Some(worker), SnapshotPolicy::Tiled | SnapshotPolicy::Auto) => {
                let request = worker.submit(JobPayload::ExtractTiles {
                    mask: self.canvas.mask().clone(),
                    tile_size: self.settings.tile_size,
                });
                self.pending_checkpoints.insert(request, stroke_id);
            }
            _ => {
                let snapshot = Snapshot::capture(self.canvas.mask(), policy, self.settings.tile_size);
                self.attach_checkpoint(stroke_id, snapshot);
            }
        }
    }

    fn attach_checkpoint(&mut self, stroke_id: Uuid, snapshot: Snapshot) -> bool {
        let tiled = snapshot.is_tiled();
        let bytes = snapshot.memory_bytes();
        match self.history.attach_checkpoint(stroke_id, snapshot) {
            Ok(Some(_)) => {
                log_info!(
                    "Checkpoint after stroke {} ({}, {} bytes)",
                    stroke_id,
                    if tiled { "tiled" } else { "full" },
                    bytes
                );
                true
            }
            Ok(None) => {
                log_info!("Dropped checkpoint for stroke {} (no longer in history)", stroke_id);
                false
            }
            Err(e) => {
                log_warn!("Checkpoint rejected: {}", e);
                false
            }
        }
    }

    // ---- worker ----------------------------------------------------------------

    fn handle_worker_response(&mut self, response: WorkerResponse) -> bool {
        let Some(stroke_id) = self.pending_checkpoints.remove(&response.id()) else {
            return false;
        };
        let policy = self.settings.snapshot_policy;
        match response {
            WorkerResponse::Done {
                result: JobResult::Tiles { mask, tile_size, tiles },
                ..
            } => {
                let snapshot = Snapshot::from_extracted(&mask, tiles, policy, tile_size);
                self.attach_checkpoint(stroke_id, snapshot)
            }
            WorkerResponse::Done { kind, .. } => {
                log_warn!("Unexpected {} response for checkpoint request", kind.tag());
                false
            }
            WorkerResponse::Error { error, mask, .. } => match mask {
                Some(mask) => {
                    log_warn!("Worker error ({}); extracting checkpoint synchronously", error);
                    let snapshot = Snapshot::capture(&mask, policy, self.settings.tile_size);
                    self.attach_checkpoint(stroke_id, snapshot)
                }
                None => {
                    log_warn!("Worker error ({}); checkpoint skipped", error);
                    false
                }
            },
        }
    }

    /// Attach any checkpoints the worker has finished.  Never blocks.
    pub fn poll_worker(&mut self) -> usize {
        let responses = match self.worker.as_mut() {
            Some(worker) => worker.poll(),
            None => return 0,
        };
        let mut attached = 0;
        for response in responses {
            if self.handle_worker_response(response) {
                attached += 1;
            }
        }
        attached
    }

    /// Block until every outstanding worker job has answered.
    pub fn flush_worker(&mut self) -> usize {
        let responses = match self.worker.as_mut() {
            Some(worker) => worker.wait_all(),
            None => return 0,
        };
        let mut attached = 0;
        for response in responses {
            if self.handle_worker_response(response) {
                attached += 1;
            }
        }
        attached
    }

    // ---- undo / redo -----------------------------------------------------------

    fn restore_current(&mut self, affected: &Stroke) {
        let (w, h) = (self.canvas.width, self.canvas.height);
        let area = stroke_bounds(affected, w, h);
        if let Err(e) = self.history.replay_current(self.canvas.mask_mut()) {
            log_warn!("Replay failed: {}", e);
            self.canvas.mark_dirty(None);
            return;
        }
        self.canvas.mark_dirty(Some(area));
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    /// Undo the last applied stroke.  A stroke in progress is cancelled first.
    pub fn undo(&mut self) -> bool {
        self.cancel_stroke();
        self.router.release();
        let Some(stroke) = self.history.undo().cloned() else {
            return false;
        };
        self.restore_current(&stroke);
        true
    }

    pub fn redo(&mut self) -> bool {
        self.cancel_stroke();
        self.router.release();
        let Some(stroke) = self.history.redo().cloned() else {
            return false;
        };
        self.restore_current(&stroke);
        true
    }

    // ---- bulk edits ------------------------------------------------------------

    /// Clear the mask.  History restarts from the blank mask.
    pub fn clear(&mut self) {
        self.cancel_stroke();
        self.router.release();
        self.canvas.clear();
        self.history.clear();
        self.pending_checkpoints.clear();
    }

    /// Set every pixel.  History restarts from the filled mask.
    pub fn fill(&mut self) {
        self.cancel_stroke();
        self.router.release();
        self.canvas.fill();
        self.pending_checkpoints.clear();
        if let Err(e) = self.history.rebase(self.canvas.mask()) {
            log_warn!("Could not rebase history: {}", e);
        }
    }

    // ---- viewport --------------------------------------------------------------

    pub fn transform(&self) -> ViewportTransform {
        self.viewport.transform
    }

    pub fn set_transform(&mut self, transform: ViewportTransform) {
        self.viewport.set_transform(transform);
    }

    pub fn reset_transform(&mut self) {
        self.viewport.reset_transform();
    }

    pub fn resize_container(&mut self, width: f64, height: f64) {
        self.viewport.set_container_size(width, height);
    }

    pub fn apply_gesture(&mut self, action: GestureAction) {
        match action {
            GestureAction::Pan { dx, dy } => self.viewport.pan_by(dx, dy),
            GestureAction::Zoom {
                factor,
                anchor_x,
                anchor_y,
            } => self.viewport.zoom_at(factor, anchor_x, anchor_y),
            GestureAction::Pinch {
                factor,
                anchor_x,
                anchor_y,
                dx,
                dy,
            } => {
                self.viewport.zoom_at(factor, anchor_x, anchor_y);
                self.viewport.pan_by(dx, dy);
            }
        }
    }

    pub fn handle_wheel(&mut self, wheel: &WheelEvent) -> Option<GestureAction> {
        let action = self.gestures.handle_wheel(wheel, &self.gesture_config)?;
        self.apply_gesture(action);
        Some(action)
    }

    // ---- pointer stream ----------------------------------------------------------

    /// Feed one raw pointer event.  Gestures are classified first; drawing
    /// only sees the event when no gesture is active.
    pub fn handle_pointer(&mut self, raw: &RawPointerEvent) -> PointerOutcome {
        let mut outcome = PointerOutcome::default();
        let Some(event) = self.tracker.track(raw) else {
            return outcome;
        };

        outcome.gesture = self.gestures.handle(&event, &self.gesture_config);
        if let Some(action) = outcome.gesture {
            self.apply_gesture(action);
        }

        let command = self
            .router
            .route(&event, self.drawing_enabled, self.gestures.is_active());
        outcome.stroke = command;
        match command {
            Some(StrokeCommand::Start { x, y }) => match self.viewport.screen_to_image(x, y) {
                Some((ix, iy)) => {
                    let result = self.start_stroke(ix as f32, iy as f32).map(|_| ());
                    report_sequence(result);
                }
                None => {
                    // Started off the image: nothing to draw
                    self.router.release();
                    outcome.stroke = None;
                }
            },
            Some(StrokeCommand::Continue { x, y }) => {
                if let Some((ix, iy)) = self.viewport.screen_to_image(x, y) {
                    let result = self.continue_stroke(ix as f32, iy as f32).map(|_| ());
                    report_sequence(result);
                }
            }
            Some(StrokeCommand::End) => {
                let result = self.end_stroke().map(|_| ());
                report_sequence(result);
            }
            Some(StrokeCommand::Cancel) => {
                self.cancel_stroke();
            }
            None => {}
        }
        outcome
    }

    // ---- output ------------------------------------------------------------------

    pub fn export_mask_raster(&self) -> GrayImage {
        self.canvas.export_as_raster()
    }

    pub fn render_overlay<S: OverlaySurface + ?Sized>(&mut self, surface: &mut S) -> Option<DirtyRect> {
        self.canvas.render_overlay(surface)
    }

    // ---- validation --------------------------------------------------------------

    pub fn validate_history(&self) -> Result<(), HistoryIntegrityError> {
        self.history.validate_integrity()
    }

    pub fn validate_mask(&self) -> Result<(), InvariantViolation> {
        self.canvas.validate()
    }

    pub fn set_memory_budget_mb(&mut self, mb: usize) {
        self.settings.history_memory_mb = mb;
        let report = self.history.set_memory_budget(mb.saturating_mul(1024 * 1024));
        self.note_eviction(report);
    }
}

/// Sequence errors on the pointer path are bugs: loud in debug builds,
/// logged and ignored in release.
fn report_sequence(result: Result<(), SequenceError>) {
    if let Err(e) = result {
        debug_assert!(false, "stroke sequence error: {}", e);
        log_warn!("Ignored stroke sequence error: {}", e);
    }
}

/// Every pixel a stroke's stamps can cover.
fn stroke_bounds(stroke: &Stroke, width: u32, height: u32) -> DirtyRect {
    let mut rect = DirtyRect::EMPTY;
    if let Some(&first) = stroke.points.first() {
        rect = brush::stamp_bounds(first.x, first.y, stroke.brush_size, width, height);
    }
    for pair in stroke.points.windows(2) {
        rect = rect.union(brush::segment_bounds(pair[0], pair[1], stroke.brush_size, width, height));
    }
    rect
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::input::{PointerType, RawPointerKind};

    fn session(width: u32, height: u32) -> MaskSession {
        let settings = EditorSettings {
            use_worker: false,
            ..EditorSettings::default()
        };
        MaskSession::blank(width, height, width as f64, height as f64, settings).unwrap()
    }

    fn touch(kind: RawPointerKind, id: u32, x: f64, y: f64) -> RawPointerEvent {
        RawPointerEvent::new(kind, id, PointerType::Touch, x, y)
    }

    #[test]
    fn test_missing_surface() {
        assert!(matches!(
            MaskSession::blank(10, 10, 0.0, 100.0, EditorSettings::default()),
            Err(LoadError::MissingSurface)
        ));
        assert!(matches!(
            MaskSession::blank(0, 10, 100.0, 100.0, EditorSettings::default()),
            Err(LoadError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn test_sequence_errors_surface_on_direct_api() {
        let mut s = session(50, 50);
        assert_eq!(s.continue_stroke(1.0, 1.0).unwrap_err(), SequenceError::NoActiveStroke);
        assert_eq!(s.end_stroke().unwrap_err(), SequenceError::NoActiveStroke);
        s.start_stroke(10.0, 10.0).unwrap();
        assert_eq!(s.start_stroke(10.0, 10.0).unwrap_err(), SequenceError::StrokeAlreadyActive);
    }

    #[test]
    fn test_cancel_restores_pixels() {
        let mut s = session(100, 100);
        s.set_brush(10.0, BrushMode::Paint);
        s.start_stroke(20.0, 20.0).unwrap();
        s.continue_stroke(80.0, 20.0).unwrap();
        s.end_stroke().unwrap();
        let committed = s.mask().clone();

        s.set_brush(10.0, BrushMode::Erase);
        s.start_stroke(10.0, 20.0).unwrap();
        s.continue_stroke(90.0, 80.0).unwrap();
        assert_ne!(s.mask(), &committed);
        assert!(s.cancel_stroke());
        assert_eq!(s.mask(), &committed);
        assert_eq!(s.history().len(), 1);
        assert!(!s.cancel_stroke());
    }

    #[test]
    fn test_undo_redo_restores_states() {
        let mut s = session(64, 64);
        s.start_stroke(10.0, 10.0).unwrap();
        s.end_stroke().unwrap();
        let after_first = s.mask().clone();
        s.start_stroke(40.0, 40.0).unwrap();
        s.end_stroke().unwrap();
        let after_second = s.mask().clone();

        assert!(s.undo());
        assert_eq!(s.mask(), &after_first);
        assert!(s.undo());
        assert!(s.mask().is_blank());
        assert!(!s.undo());
        assert!(s.redo());
        assert!(s.redo());
        assert_eq!(s.mask(), &after_second);
        assert!(!s.redo());
    }

    #[test]
    fn test_pointer_draws_in_image_space() {
        let mut s = session(100, 100);
        s.set_brush(4.0, BrushMode::Paint);
        s.handle_pointer(&touch(RawPointerKind::Down, 1, 10.0, 50.0));
        assert!(s.is_stroke_active());
        s.handle_pointer(&touch(RawPointerKind::Move, 1, 90.0, 50.0));
        s.handle_pointer(&touch(RawPointerKind::Up, 1, 90.0, 50.0));
        assert!(!s.is_stroke_active());
        assert_eq!(s.history().len(), 1);
        for x in 10..=90 {
            assert_eq!(s.mask().get(x, 50), Some(255), "gap at x={}", x);
        }
    }

    #[test]
    fn test_second_finger_cancels_stroke_and_pinches() {
        let mut s = session(100, 100);
        s.handle_pointer(&touch(RawPointerKind::Down, 1, 30.0, 50.0));
        s.handle_pointer(&touch(RawPointerKind::Move, 1, 40.0, 50.0));
        assert!(!s.mask().is_blank());

        let out = s.handle_pointer(&touch(RawPointerKind::Down, 2, 70.0, 50.0));
        assert_eq!(out.stroke, Some(StrokeCommand::Cancel));
        assert!(s.gestures().is_active());
        assert!(s.mask().is_blank());
        assert_eq!(s.history().len(), 0);

        let out = s.handle_pointer(&touch(RawPointerKind::Move, 2, 100.0, 50.0));
        assert!(matches!(out.gesture, Some(GestureAction::Pinch { .. })));
        assert!(s.transform().scale > 1.0);
        // No painting while the gesture holds
        assert!(s.mask().is_blank());

        s.handle_pointer(&touch(RawPointerKind::Up, 2, 100.0, 50.0));
        s.handle_pointer(&touch(RawPointerKind::Up, 1, 40.0, 50.0));
        assert!(!s.gestures().is_active());
    }

    #[test]
    fn test_start_outside_image_draws_nothing() {
        let settings = EditorSettings {
            use_worker: false,
            ..EditorSettings::default()
        };
        // 200×100 container letterboxes a 100×100 image into x ∈ [50, 150)
        let mut s = MaskSession::blank(100, 100, 200.0, 100.0, settings).unwrap();
        s.handle_pointer(&touch(RawPointerKind::Down, 1, 10.0, 50.0));
        assert!(!s.is_stroke_active());
        s.handle_pointer(&touch(RawPointerKind::Move, 1, 100.0, 50.0));
        assert!(s.mask().is_blank());
    }

    #[test]
    fn test_clear_and_fill_rebase_history() {
        let mut s = session(32, 32);
        s.start_stroke(5.0, 5.0).unwrap();
        s.end_stroke().unwrap();
        s.fill();
        assert_eq!(s.mask().count_set(), 32 * 32);
        assert!(!s.can_undo());

        s.set_brush(6.0, BrushMode::Erase);
        s.start_stroke(16.0, 16.0).unwrap();
        s.end_stroke().unwrap();
        s.undo();
        assert_eq!(s.mask().count_set(), 32 * 32);

        s.clear();
        assert!(s.mask().is_blank());
        assert!(s.history().is_empty());
    }

    #[test]
    fn test_clear_mid_stroke_releases_pointer() {
        let mut s = session(100, 100);
        s.set_brush(4.0, BrushMode::Paint);
        s.handle_pointer(&touch(RawPointerKind::Down, 1, 10.0, 50.0));
        s.handle_pointer(&touch(RawPointerKind::Move, 1, 40.0, 50.0));
        assert!(s.is_stroke_active());

        s.clear();
        assert!(!s.is_stroke_active());

        // The finger is still down, but its stroke is gone
        let out = s.handle_pointer(&touch(RawPointerKind::Move, 1, 60.0, 50.0));
        assert_eq!(out.stroke, None);
        let out = s.handle_pointer(&touch(RawPointerKind::Up, 1, 60.0, 50.0));
        assert_eq!(out.stroke, None);
        assert!(s.mask().is_blank());
        assert!(s.history().is_empty());

        // A fresh touch draws again
        s.handle_pointer(&touch(RawPointerKind::Down, 2, 20.0, 20.0));
        s.handle_pointer(&touch(RawPointerKind::Up, 2, 20.0, 20.0));
        assert_eq!(s.history().len(), 1);
    }

    #[test]
    fn test_fill_mid_stroke_releases_pointer() {
        let mut s = session(64, 64);
        s.set_brush(6.0, BrushMode::Erase);
        s.handle_pointer(&touch(RawPointerKind::Down, 1, 10.0, 10.0));
        s.fill();
        assert!(!s.is_stroke_active());

        s.handle_pointer(&touch(RawPointerKind::Move, 1, 30.0, 30.0));
        s.handle_pointer(&touch(RawPointerKind::Up, 1, 30.0, 30.0));
        assert_eq!(s.mask().count_set(), 64 * 64);
        assert!(s.history().is_empty());
    }

    #[test]
    fn test_undo_marks_stroke_area_dirty() {
        let mut s = session(200, 200);
        s.canvas.take_dirty();
        s.set_brush(10.0, BrushMode::Paint);
        s.start_stroke(100.0, 100.0).unwrap();
        s.end_stroke().unwrap();
        s.canvas.take_dirty();
        s.undo();
        let dirty = s.canvas.dirty_rect.unwrap();
        assert!(dirty.contains(100, 100));
        assert!(dirty.area() < 200 * 200);
    }

    #[test]
    fn test_wheel_zoom_keeps_cursor_pixel() {
        let mut s = session(100, 100);
        let before = s.viewport().screen_to_image(30.0, 60.0).unwrap();
        let action = s.handle_wheel(&WheelEvent {
            x: 30.0,
            y: 60.0,
            delta_y: -200.0,
            modifiers: Default::default(),
        });
        assert!(action.is_some());
        let after = s.viewport().screen_to_image(30.0, 60.0).unwrap();
        assert!((before.0 - after.0).abs() < 1e-6);
        assert!((before.1 - after.1).abs() < 1e-6);
        assert!(s.transform().scale > 1.0);
    }
}

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::canvas::MaskBuffer;
use crate::components::brush::{self, BrushMode, Point};
use crate::error::{HistoryError, HistoryIntegrityError};
use crate::ops::tiles::{self, TILE_SIZE, Tile};
use crate::{log_err, log_info};

/// Estimated bytes per recorded stroke point.
const BYTES_PER_POINT: usize = 16;
/// Fixed per-stroke bookkeeping estimate.
const STROKE_OVERHEAD: usize = 96;
/// Fixed per-checkpoint bookkeeping estimate.
const CHECKPOINT_OVERHEAD: usize = 128;

/// Stroke index of the base checkpoint that stands in for evicted strokes.
pub const BASE_INDEX: isize = -1;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// STROKE - sealed, replayable unit of history
// ============================================================================

/// A committed brush stroke.  Immutable once sealed; replaying it against a
/// mask always produces the same pixels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub id: Uuid,
    pub points: Vec<Point>,
    pub brush_size: f32,
    pub mode: BrushMode,
    /// Resampling spacing used while drawing, kept so replay matches.
    pub spacing: f32,
    pub timestamp: u64,
}

impl Stroke {
    pub fn new(points: Vec<Point>, brush_size: f32, mode: BrushMode, spacing: f32) -> Self {
        Self {
            id: Uuid::new_v4(),
            points,
            brush_size,
            mode,
            spacing,
            timestamp: now_millis(),
        }
    }

    pub fn memory_size(&self) -> usize {
        self.points.len() * BYTES_PER_POINT + STROKE_OVERHEAD
    }

    pub fn description(&self) -> String {
        let verb = match self.mode {
            BrushMode::Paint => "Paint",
            BrushMode::Erase => "Erase",
        };
        format!("{} stroke ({} pts, size {})", verb, self.points.len(), self.brush_size)
    }

    pub fn replay(&self, mask: &mut MaskBuffer) {
        let (w, h) = (mask.width, mask.height);
        brush::apply_stroke(&mut mask.data, w, h, self);
    }
}

// ============================================================================
// SNAPSHOTS & CHECKPOINTS
// ============================================================================

/// How a checkpoint stores the mask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotPolicy {
    Full,
    Tiled,
    /// Tiled when fewer than half of the tiles hold any set pixel.
    #[default]
    Auto,
}

impl SnapshotPolicy {
    pub fn name(self) -> &'static str {
        match self {
            SnapshotPolicy::Full => "full",
            SnapshotPolicy::Tiled => "tiled",
            SnapshotPolicy::Auto => "auto",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Some(SnapshotPolicy::Full),
            "tiled" => Some(SnapshotPolicy::Tiled),
            "auto" => Some(SnapshotPolicy::Auto),
            _ => None,
        }
    }

    /// Decide between a full copy and sparse tiles given how many of the
    /// grid's tiles are non-empty.
    pub fn prefers_tiles(self, non_empty: usize, total: usize) -> bool {
        match self {
            SnapshotPolicy::Full => false,
            SnapshotPolicy::Tiled => true,
            SnapshotPolicy::Auto => non_empty * 2 < total,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Snapshot {
    Full(Vec<u8>),
    Tiled { tile_size: u32, tiles: Vec<Tile> },
}

impl Snapshot {
    pub fn capture(mask: &MaskBuffer, policy: SnapshotPolicy, tile_size: u32) -> Self {
        if policy == SnapshotPolicy::Full {
            return Snapshot::Full(mask.data.clone());
        }
        let tiles = tiles::extract_tiles(mask, tile_size);
        Self::from_extracted(mask, tiles, policy, tile_size)
    }

    /// Build a snapshot from tiles that were already extracted (possibly on
    /// the worker) out of `mask`.
    pub fn from_extracted(mask: &MaskBuffer, tiles: Vec<Tile>, policy: SnapshotPolicy, tile_size: u32) -> Self {
        let (cols, rows) = tiles::tile_grid(mask.width, mask.height, tile_size);
        if policy.prefers_tiles(tiles.len(), (cols * rows) as usize) {
            Snapshot::Tiled { tile_size, tiles }
        } else {
            Snapshot::Full(mask.data.clone())
        }
    }

    pub fn is_tiled(&self) -> bool {
        matches!(self, Snapshot::Tiled { .. })
    }

    pub fn memory_bytes(&self) -> usize {
        match self {
            Snapshot::Full(data) => data.len(),
            Snapshot::Tiled { tiles, .. } => tiles::tiles_memory(tiles),
        }
    }

    /// Check the snapshot fits a `width`×`height` mask.
    pub fn validate(&self, width: u32, height: u32) -> Result<(), HistoryError> {
        let expected = width as usize * height as usize;
        match self {
            Snapshot::Full(data) => {
                if data.len() != expected {
                    return Err(HistoryError::SnapshotSizeMismatch {
                        expected,
                        actual: data.len(),
                    });
                }
            }
            Snapshot::Tiled { tile_size, tiles } => {
                for tile in tiles {
                    let rect = tile.rect(*tile_size);
                    let tile_len = tile.width as usize * tile.height as usize;
                    if tile.data.len() != tile_len || rect.max_x > width || rect.max_y > height {
                        return Err(HistoryError::SnapshotSizeMismatch {
                            expected: tile_len,
                            actual: tile.data.len(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub fn restore_into(&self, mask: &mut MaskBuffer) {
        match self {
            Snapshot::Full(data) => mask.data.copy_from_slice(data),
            Snapshot::Tiled { tile_size, tiles } => tiles::restore_tiles(mask, tiles, *tile_size),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    /// Index of the last stroke included in the snapshot; `-1` is the base.
    pub stroke_index: isize,
    pub timestamp: u64,
    pub snapshot: Snapshot,
}

impl Checkpoint {
    pub fn new(stroke_index: isize, snapshot: Snapshot) -> Self {
        Self {
            id: Uuid::new_v4(),
            stroke_index,
            timestamp: now_millis(),
            snapshot,
        }
    }

    pub fn memory_size(&self) -> usize {
        self.snapshot.memory_bytes() + CHECKPOINT_OVERHEAD
    }

    pub fn is_base(&self) -> bool {
        self.stroke_index == BASE_INDEX
    }
}

// ============================================================================
// HISTORY MANAGER - stroke list, checkpoints, memory budget
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HistoryConfig {
    pub memory_budget_bytes: usize,
    pub min_strokes_retained: usize,
    /// Strokes between checkpoints; `0` disables periodic checkpoints.
    pub checkpoint_interval: usize,
    pub snapshot_policy: SnapshotPolicy,
    pub tile_size: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 64 * 1024 * 1024,
            min_strokes_retained: 50,
            checkpoint_interval: 10,
            snapshot_policy: SnapshotPolicy::Auto,
            tile_size: TILE_SIZE,
        }
    }
}

/// What a memory-management pass removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub checkpoints_evicted: usize,
    pub strokes_evicted: usize,
}

impl EvictionReport {
    pub fn is_empty(&self) -> bool {
        self.checkpoints_evicted == 0 && self.strokes_evicted == 0
    }
}

/// Undo/redo over committed strokes.  Past mask states are rebuilt by
/// restoring the nearest checkpoint and replaying the strokes after it.
pub struct HistoryManager {
    width: u32,
    height: u32,
    strokes: Vec<Stroke>,
    current_index: isize,
    /// Sorted ascending by `stroke_index`, unique per index.
    checkpoints: Vec<Checkpoint>,
    /// Strokes committed since the last clear; eviction never lowers it.
    committed: usize,
    config: HistoryConfig,
}

impl HistoryManager {
    pub fn new(width: u32, height: u32, config: HistoryConfig) -> Self {
        Self {
            width,
            height,
            strokes: Vec::new(),
            current_index: -1,
            checkpoints: Vec::new(),
            committed: 0,
            config,
        }
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    pub fn set_memory_budget(&mut self, bytes: usize) -> EvictionReport {
        self.config.memory_budget_bytes = bytes;
        self.manage_memory()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn len(&self) -> usize {
        self.strokes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strokes.is_empty()
    }

    pub fn current_index(&self) -> isize {
        self.current_index
    }

    pub fn strokes(&self) -> &[Stroke] {
        &self.strokes
    }

    pub fn stroke(&self, index: isize) -> Option<&Stroke> {
        usize::try_from(index).ok().and_then(|i| self.strokes.get(i))
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn index_of(&self, stroke_id: Uuid) -> Option<isize> {
        self.strokes.iter().position(|s| s.id == stroke_id).map(|i| i as isize)
    }

    fn last_index(&self) -> isize {
        self.strokes.len() as isize - 1
    }

    pub fn can_undo(&self) -> bool {
        self.current_index >= 0
    }

    pub fn can_redo(&self) -> bool {
        self.current_index < self.last_index()
    }

    pub fn undo_description(&self) -> Option<String> {
        self.stroke(self.current_index).map(Stroke::description)
    }

    pub fn redo_description(&self) -> Option<String> {
        self.stroke(self.current_index + 1).map(Stroke::description)
    }

    /// Descriptions of the applied strokes, oldest first.
    pub fn undo_history(&self) -> Vec<String> {
        self.strokes
            .iter()
            .take((self.current_index + 1) as usize)
            .map(Stroke::description)
            .collect()
    }

    /// Commit a stroke, discarding the redo tail and any checkpoints past it.
    pub fn add_stroke(&mut self, stroke: Stroke) -> EvictionReport {
        if self.current_index < self.last_index() {
            self.strokes.truncate((self.current_index + 1) as usize);
            let end = self.current_index;
            self.checkpoints.retain(|c| c.stroke_index <= end);
        }
        self.strokes.push(stroke);
        self.current_index = self.last_index();
        self.committed += 1;
        self.manage_memory()
    }

    pub fn undo(&mut self) -> Option<&Stroke> {
        if self.current_index < 0 {
            return None;
        }
        self.current_index -= 1;
        self.stroke(self.current_index + 1)
    }

    pub fn redo(&mut self) -> Option<&Stroke> {
        if self.current_index >= self.last_index() {
            return None;
        }
        self.current_index += 1;
        self.stroke(self.current_index)
    }

    /// True when every `checkpoint_interval`-th commit lands and the current
    /// stroke has no checkpoint yet.  Counted in commits rather than list
    /// positions so the cadence holds while eviction shifts indices.
    pub fn checkpoint_due(&self) -> bool {
        let interval = self.config.checkpoint_interval;
        if interval == 0 || self.committed == 0 || self.current_index < 0 {
            return false;
        }
        self.committed % interval == 0 && !self.has_checkpoint_at(self.current_index)
    }

    pub fn has_checkpoint_at(&self, stroke_index: isize) -> bool {
        self.checkpoints.iter().any(|c| c.stroke_index == stroke_index)
    }

    /// Insert a checkpoint, keeping the list sorted.  An existing checkpoint
    /// at the same index is replaced.
    pub fn add_checkpoint(&mut self, stroke_index: isize, snapshot: Snapshot) -> Result<Uuid, HistoryError> {
        if stroke_index < BASE_INDEX || stroke_index > self.last_index() {
            return Err(HistoryError::CheckpointOutOfRange {
                stroke_index,
                len: self.strokes.len(),
            });
        }
        snapshot.validate(self.width, self.height)?;

        let checkpoint = Checkpoint::new(stroke_index, snapshot);
        let id = checkpoint.id;
        match self
            .checkpoints
            .binary_search_by_key(&stroke_index, |c| c.stroke_index)
        {
            Ok(pos) => self.checkpoints[pos] = checkpoint,
            Err(pos) => self.checkpoints.insert(pos, checkpoint),
        }
        self.manage_memory();
        Ok(id)
    }

    /// Attach a snapshot to the stroke it was taken after.  Returns
    /// `Ok(None)` when that stroke is no longer in history.
    pub fn attach_checkpoint(&mut self, stroke_id: Uuid, snapshot: Snapshot) -> Result<Option<Uuid>, HistoryError> {
        match self.index_of(stroke_id) {
            Some(index) => self.add_checkpoint(index, snapshot).map(Some),
            None => Ok(None),
        }
    }

    /// Snapshot `mask` (which must reflect the current index) synchronously.
    pub fn capture_checkpoint(&mut self, mask: &MaskBuffer) -> Result<Uuid, HistoryError> {
        let snapshot = Snapshot::capture(mask, self.config.snapshot_policy, self.config.tile_size);
        self.add_checkpoint(self.current_index, snapshot)
    }

    /// Checkpoint with the greatest stroke index not past `target`.
    pub fn nearest_checkpoint(&self, target: isize) -> Option<&Checkpoint> {
        let end = self.checkpoints.partition_point(|c| c.stroke_index <= target);
        end.checked_sub(1).map(|i| &self.checkpoints[i])
    }

    /// Rebuild the mask as it was after stroke `target` (`-1` = before any
    /// stroke).  Returns how many strokes were replayed.
    pub fn replay_to(&self, target: isize, mask: &mut MaskBuffer) -> Result<usize, HistoryError> {
        let expected = self.width as usize * self.height as usize;
        if mask.data.len() != expected {
            return Err(HistoryError::SnapshotSizeMismatch {
                expected,
                actual: mask.data.len(),
            });
        }
        let target = target.clamp(BASE_INDEX, self.last_index());

        let first = match self.nearest_checkpoint(target) {
            Some(cp) => {
                cp.snapshot.restore_into(mask);
                (cp.stroke_index + 1) as usize
            }
            None => {
                mask.data.fill(0);
                0
            }
        };
        let end = (target + 1) as usize;
        for stroke in &self.strokes[first..end] {
            stroke.replay(mask);
        }
        brush::enforce_binary(&mut mask.data);
        Ok(end - first)
    }

    pub fn replay_current(&self, mask: &mut MaskBuffer) -> Result<usize, HistoryError> {
        self.replay_to(self.current_index, mask)
    }

    pub fn memory_usage(&self) -> usize {
        self.strokes.iter().map(Stroke::memory_size).sum::<usize>()
            + self.checkpoints.iter().map(Checkpoint::memory_size).sum::<usize>()
    }

    /// Bring the estimate under the budget: drop the oldest checkpoints
    /// first (the base and the newest are kept), then fold the oldest strokes
    /// into the base down to the retention floor.
    pub fn manage_memory(&mut self) -> EvictionReport {
        let budget = self.config.memory_budget_bytes;
        let mut report = EvictionReport::default();
        let mut usage = self.memory_usage();
        if usage <= budget {
            return report;
        }

        while usage > budget {
            let evictable = self.checkpoints.iter().filter(|c| !c.is_base()).count();
            if evictable <= 1 {
                break;
            }
            let Some(pos) = self.checkpoints.iter().position(|c| !c.is_base()) else {
                break;
            };
            let removed = self.checkpoints.remove(pos);
            usage = usage.saturating_sub(removed.memory_size());
            report.checkpoints_evicted += 1;
        }

        if usage > budget {
            // Only applied strokes can be folded into the base
            let max_evict = self
                .strokes
                .len()
                .saturating_sub(self.config.min_strokes_retained)
                .min((self.current_index + 1) as usize);
            let mut count = 0;
            for stroke in self.strokes.iter().take(max_evict) {
                if usage <= budget {
                    break;
                }
                usage = usage.saturating_sub(stroke.memory_size());
                count += 1;
            }
            if count > 0 {
                match self.evict_oldest_strokes(count) {
                    Ok(()) => report.strokes_evicted = count,
                    Err(e) => {
                        log_err!("History: eviction failed: {}", e);
                    }
                }
            }
        }

        if !report.is_empty() {
            log_info!(
                "History: evicted {} checkpoint(s), {} stroke(s); {} bytes in use",
                report.checkpoints_evicted,
                report.strokes_evicted,
                self.memory_usage()
            );
        }
        report
    }

    fn evict_oldest_strokes(&mut self, count: usize) -> Result<(), HistoryError> {
        let fold_index = count as isize - 1;
        let has_base = self.has_checkpoint_at(fold_index);

        let base = if has_base {
            None
        } else {
            let mut folded = MaskBuffer::new(self.width, self.height);
            self.replay_to(fold_index, &mut folded)?;
            Some(Snapshot::capture(&folded, self.config.snapshot_policy, self.config.tile_size))
        };

        self.strokes.drain(..count);
        let shift = count as isize;
        self.checkpoints.retain(|c| c.stroke_index >= fold_index);
        for cp in &mut self.checkpoints {
            cp.stroke_index -= shift;
        }
        if let Some(snapshot) = base {
            self.checkpoints.insert(0, Checkpoint::new(BASE_INDEX, snapshot));
        }
        self.current_index = (self.current_index - shift).clamp(BASE_INDEX, self.last_index());
        Ok(())
    }

    /// Drop all strokes and checkpoints; the base becomes the blank mask.
    pub fn clear(&mut self) {
        self.strokes.clear();
        self.checkpoints.clear();
        self.current_index = BASE_INDEX;
        self.committed = 0;
    }

    /// Drop all strokes and make `mask` the new base state.
    pub fn rebase(&mut self, mask: &MaskBuffer) -> Result<(), HistoryError> {
        self.clear();
        if !mask.is_blank() {
            let snapshot = Snapshot::capture(mask, self.config.snapshot_policy, self.config.tile_size);
            self.add_checkpoint(BASE_INDEX, snapshot)?;
        }
        Ok(())
    }

    /// Check every structural invariant.  Never called implicitly.
    pub fn validate_integrity(&self) -> Result<(), HistoryIntegrityError> {
        let last = self.last_index();
        if self.current_index < BASE_INDEX || self.current_index > last {
            return Err(HistoryIntegrityError::CurrentIndexOutOfBounds {
                current: self.current_index,
                last,
            });
        }

        let mut seen = HashSet::with_capacity(self.strokes.len());
        for stroke in &self.strokes {
            if !seen.insert(stroke.id) {
                return Err(HistoryIntegrityError::DuplicateStrokeId(stroke.id));
            }
        }

        let mut seen = HashSet::with_capacity(self.checkpoints.len());
        for cp in &self.checkpoints {
            if !seen.insert(cp.id) {
                return Err(HistoryIntegrityError::DuplicateCheckpointId(cp.id));
            }
            if cp.stroke_index < BASE_INDEX || cp.stroke_index > last {
                return Err(HistoryIntegrityError::DanglingCheckpoint {
                    id: cp.id,
                    stroke_index: cp.stroke_index,
                    len: self.strokes.len(),
                });
            }
        }

        if self
            .checkpoints
            .windows(2)
            .any(|w| w[0].stroke_index > w[1].stroke_index)
        {
            return Err(HistoryIntegrityError::UnsortedCheckpoints);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn checkpoints_mut(&mut self) -> &mut Vec<Checkpoint> {
        &mut self.checkpoints
    }

    #[cfg(test)]
    pub(crate) fn strokes_mut(&mut self) -> &mut Vec<Stroke> {
        &mut self.strokes
    }
}

// ============================================================================
// INPUT - pointer normalisation, drawing routing, pan/pinch classification
// ============================================================================

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Pressure reported for pressed pointers that carry none (mouse).
const DEFAULT_PRESSED_PRESSURE: f32 = 0.5;

/// Pinch distances below this are treated as a touch point collapse.
const MIN_PINCH_DISTANCE: f64 = 1.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PointerType {
    Mouse,
    Pen,
    Touch,
}

/// What the host's pointer source reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RawPointerKind {
    Down,
    Move,
    Up,
    Cancel,
    Leave,
}

/// A pointer event as delivered by the host, in container screen pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawPointerEvent {
    pub kind: RawPointerKind,
    pub x: f64,
    pub y: f64,
    pub pointer_id: u32,
    pub pointer_type: PointerType,
    pub pressure: Option<f32>,
}

impl RawPointerEvent {
    pub fn new(kind: RawPointerKind, pointer_id: u32, pointer_type: PointerType, x: f64, y: f64) -> Self {
        Self {
            kind,
            x,
            y,
            pointer_id,
            pointer_type,
            pressure: None,
        }
    }

    pub fn with_pressure(mut self, pressure: f32) -> Self {
        self.pressure = Some(pressure);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PointerPhase {
    Start,
    Move,
    End,
    Cancel,
}

/// Normalised pointer event.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointerEvent {
    pub phase: PointerPhase,
    pub x: f64,
    pub y: f64,
    pub pointer_id: u32,
    pub pointer_type: PointerType,
    pub pressure: f32,
}

#[derive(Clone, Copy, Debug)]
struct PointerSlot {
    pointer_type: PointerType,
    x: f64,
    y: f64,
    pressure: f32,
}

// ============================================================================
// POINTER TRACKER - one slot per pressed pointer
// ============================================================================

/// Turns raw host events into start/move/end/cancel.  Moves of pointers that
/// are not pressed (hover) are dropped, and `Leave` ends a pressed pointer.
#[derive(Default)]
pub struct PointerTracker {
    slots: HashMap<u32, PointerSlot>,
}

impl PointerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_count(&self) -> usize {
        self.slots.len()
    }

    pub fn is_down(&self, pointer_id: u32) -> bool {
        self.slots.contains_key(&pointer_id)
    }

    pub fn position(&self, pointer_id: u32) -> Option<(f64, f64)> {
        self.slots.get(&pointer_id).map(|s| (s.x, s.y))
    }

    pub fn track(&mut self, raw: &RawPointerEvent) -> Option<PointerEvent> {
        let pressure = |pressed: bool| match raw.pressure {
            Some(p) if p.is_finite() => p.clamp(0.0, 1.0),
            _ if pressed => DEFAULT_PRESSED_PRESSURE,
            _ => 0.0,
        };

        let phase = match raw.kind {
            RawPointerKind::Down => {
                let slot = PointerSlot {
                    pointer_type: raw.pointer_type,
                    x: raw.x,
                    y: raw.y,
                    pressure: pressure(true),
                };
                if self.slots.insert(raw.pointer_id, slot).is_some() {
                    // Repeated down for a pressed pointer: treat as movement
                    PointerPhase::Move
                } else {
                    PointerPhase::Start
                }
            }
            RawPointerKind::Move => {
                let slot = self.slots.get_mut(&raw.pointer_id)?;
                slot.x = raw.x;
                slot.y = raw.y;
                slot.pressure = pressure(true);
                PointerPhase::Move
            }
            RawPointerKind::Up | RawPointerKind::Leave => {
                self.slots.remove(&raw.pointer_id)?;
                PointerPhase::End
            }
            RawPointerKind::Cancel => {
                self.slots.remove(&raw.pointer_id)?;
                PointerPhase::Cancel
            }
        };

        let released = matches!(phase, PointerPhase::End | PointerPhase::Cancel);
        Some(PointerEvent {
            phase,
            x: raw.x,
            y: raw.y,
            pointer_id: raw.pointer_id,
            pointer_type: self
                .slots
                .get(&raw.pointer_id)
                .map_or(raw.pointer_type, |s| s.pointer_type),
            pressure: if released {
                0.0
            } else {
                self.slots.get(&raw.pointer_id).map_or(0.0, |s| s.pressure)
            },
        })
    }

    pub fn reset(&mut self) {
        self.slots.clear();
    }
}

// ============================================================================
// DRAW ROUTER - decides which pointer events become stroke commands
// ============================================================================

/// Stroke command in screen coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StrokeCommand {
    Start { x: f64, y: f64 },
    Continue { x: f64, y: f64 },
    End,
    Cancel,
}

/// Hands a single pointer ownership of the stroke.  Nothing is forwarded while
/// drawing is disabled or a gesture is active; a gesture starting mid-stroke
/// cancels the stroke.
#[derive(Default)]
pub struct DrawRouter {
    owner: Option<u32>,
}

impl DrawRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(&self) -> Option<u32> {
        self.owner
    }

    pub fn route(&mut self, event: &PointerEvent, drawing_enabled: bool, gesture_active: bool) -> Option<StrokeCommand> {
        if gesture_active || !drawing_enabled {
            // Mutual exclusion: a stroke never survives the start of a gesture
            return self.owner.take().map(|_| StrokeCommand::Cancel);
        }

        match event.phase {
            PointerPhase::Start => {
                if self.owner.is_some() {
                    return None;
                }
                self.owner = Some(event.pointer_id);
                Some(StrokeCommand::Start { x: event.x, y: event.y })
            }
            PointerPhase::Move if self.owner == Some(event.pointer_id) => {
                Some(StrokeCommand::Continue { x: event.x, y: event.y })
            }
            PointerPhase::End if self.owner == Some(event.pointer_id) => {
                self.owner = None;
                Some(StrokeCommand::End)
            }
            PointerPhase::Cancel if self.owner == Some(event.pointer_id) => {
                self.owner = None;
                Some(StrokeCommand::Cancel)
            }
            _ => None,
        }
    }

    /// Forget the owning pointer (the stroke was ended elsewhere).
    pub fn release(&mut self) {
        self.owner = None;
    }
}

// ============================================================================
// GESTURES - pan / pinch state machine
// ============================================================================

/// Which modifier must be held for wheel zoom.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WheelModifier {
    #[default]
    None,
    Ctrl,
    Shift,
    Alt,
}

impl WheelModifier {
    pub fn name(self) -> &'static str {
        match self {
            WheelModifier::None => "none",
            WheelModifier::Ctrl => "ctrl",
            WheelModifier::Shift => "shift",
            WheelModifier::Alt => "alt",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Some(WheelModifier::None),
            "ctrl" | "control" => Some(WheelModifier::Ctrl),
            "shift" => Some(WheelModifier::Shift),
            "alt" | "option" => Some(WheelModifier::Alt),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Modifiers {
    pub ctrl: bool,
    pub shift: bool,
    pub alt: bool,
}

impl Modifiers {
    pub fn satisfies(self, required: WheelModifier) -> bool {
        match required {
            WheelModifier::None => true,
            WheelModifier::Ctrl => self.ctrl,
            WheelModifier::Shift => self.shift,
            WheelModifier::Alt => self.alt,
        }
    }
}

/// Wheel or trackpad scroll, in container screen pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WheelEvent {
    pub x: f64,
    pub y: f64,
    pub delta_y: f64,
    pub modifiers: Modifiers,
}

/// Tunables for gesture classification.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GestureConfig {
    pub pan_enabled: bool,
    pub pan_sensitivity: f64,
    pub wheel_modifier: WheelModifier,
    pub wheel_zoom_speed: f64,
}

impl Default for GestureConfig {
    fn default() -> Self {
        Self {
            pan_enabled: false,
            pan_sensitivity: 1.0,
            wheel_modifier: WheelModifier::None,
            wheel_zoom_speed: 0.0015,
        }
    }
}

/// Viewport change requested by a gesture.  Anchors are screen coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GestureAction {
    Pan { dx: f64, dy: f64 },
    Zoom { factor: f64, anchor_x: f64, anchor_y: f64 },
    /// Zoom about the previous pinch centre, then pan by the centre's motion.
    Pinch {
        factor: f64,
        anchor_x: f64,
        anchor_y: f64,
        dx: f64,
        dy: f64,
    },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GesturePhase {
    Idle,
    Pan {
        pointer_id: u32,
        last_x: f64,
        last_y: f64,
    },
    Pinch {
        first: u32,
        second: u32,
        last_distance: f64,
        last_center: (f64, f64),
    },
}

/// Pointer set plus the current pan/pinch phase.  `is_active` gates
/// painting.
pub struct GestureState {
    pointers: BTreeMap<u32, (f64, f64)>,
    phase: GesturePhase,
}

impl Default for GestureState {
    fn default() -> Self {
        Self {
            pointers: BTreeMap::new(),
            phase: GesturePhase::Idle,
        }
    }
}

impl GestureState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.phase != GesturePhase::Idle
    }

    pub fn phase(&self) -> GesturePhase {
        self.phase
    }

    pub fn pointer_count(&self) -> usize {
        self.pointers.len()
    }

    pub fn handle(&mut self, event: &PointerEvent, config: &GestureConfig) -> Option<GestureAction> {
        match event.phase {
            PointerPhase::Start => {
                self.pointers.insert(event.pointer_id, (event.x, event.y));
                self.on_pointer_added(config);
                None
            }
            PointerPhase::Move => {
                if !self.pointers.contains_key(&event.pointer_id) {
                    return None;
                }
                self.pointers.insert(event.pointer_id, (event.x, event.y));
                self.on_pointer_moved(event.pointer_id, config)
            }
            PointerPhase::End | PointerPhase::Cancel => {
                self.pointers.remove(&event.pointer_id)?;
                self.on_pointer_removed(config);
                None
            }
        }
    }

    fn on_pointer_added(&mut self, config: &GestureConfig) {
        match self.pointers.len() {
            0 => {}
            1 => {
                if config.pan_enabled {
                    self.rebase_pan();
                }
            }
            _ => {
                if !matches!(self.phase, GesturePhase::Pinch { .. }) {
                    self.start_pinch();
                }
            }
        }
    }

    fn on_pointer_removed(&mut self, config: &GestureConfig) {
        match self.pointers.len() {
            0 => self.phase = GesturePhase::Idle,
            1 => {
                // 2 → 1: keep the gesture and continue panning from the
                // remaining pointer so the image does not jump
                if self.is_active() || config.pan_enabled {
                    self.rebase_pan();
                }
            }
            _ => {
                let still_pinching = match self.phase {
                    GesturePhase::Pinch { first, second, .. } => {
                        self.pointers.contains_key(&first) && self.pointers.contains_key(&second)
                    }
                    _ => false,
                };
                if !still_pinching {
                    self.start_pinch();
                }
            }
        }
    }

    fn on_pointer_moved(&mut self, pointer_id: u32, config: &GestureConfig) -> Option<GestureAction> {
        match self.phase {
            GesturePhase::Idle => None,
            GesturePhase::Pan {
                pointer_id: owner,
                last_x,
                last_y,
            } => {
                if owner != pointer_id {
                    return None;
                }
                let (x, y) = self.pointers[&pointer_id];
                self.phase = GesturePhase::Pan {
                    pointer_id,
                    last_x: x,
                    last_y: y,
                };
                let dx = (x - last_x) * config.pan_sensitivity;
                let dy = (y - last_y) * config.pan_sensitivity;
                if dx == 0.0 && dy == 0.0 {
                    None
                } else {
                    Some(GestureAction::Pan { dx, dy })
                }
            }
            GesturePhase::Pinch {
                first,
                second,
                last_distance,
                last_center,
            } => {
                if pointer_id != first && pointer_id != second {
                    return None;
                }
                let (distance, center) = self.pair_metrics(first, second)?;
                self.phase = GesturePhase::Pinch {
                    first,
                    second,
                    last_distance: distance,
                    last_center: center,
                };
                let factor = if last_distance >= MIN_PINCH_DISTANCE && distance >= MIN_PINCH_DISTANCE {
                    distance / last_distance
                } else {
                    1.0
                };
                Some(GestureAction::Pinch {
                    factor,
                    anchor_x: last_center.0,
                    anchor_y: last_center.1,
                    dx: center.0 - last_center.0,
                    dy: center.1 - last_center.1,
                })
            }
        }
    }

    fn rebase_pan(&mut self) {
        if let Some((&pointer_id, &(x, y))) = self.pointers.iter().next() {
            self.phase = GesturePhase::Pan {
                pointer_id,
                last_x: x,
                last_y: y,
            };
        }
    }

    fn start_pinch(&mut self) {
        let mut ids = self.pointers.keys().copied();
        let (Some(first), Some(second)) = (ids.next(), ids.next()) else {
            return;
        };
        if let Some((distance, center)) = self.pair_metrics(first, second) {
            self.phase = GesturePhase::Pinch {
                first,
                second,
                last_distance: distance,
                last_center: center,
            };
        }
    }

    fn pair_metrics(&self, first: u32, second: u32) -> Option<(f64, (f64, f64))> {
        let &(ax, ay) = self.pointers.get(&first)?;
        let &(bx, by) = self.pointers.get(&second)?;
        let distance = ((bx - ax).powi(2) + (by - ay).powi(2)).sqrt();
        Some((distance, ((ax + bx) / 2.0, (ay + by) / 2.0)))
    }

    /// Wheel zoom, anchored at the cursor.  Momentary: it never holds the
    /// gesture-active flag.
    pub fn handle_wheel(&self, wheel: &WheelEvent, config: &GestureConfig) -> Option<GestureAction> {
        if wheel.delta_y == 0.0 || !wheel.delta_y.is_finite() {
            return None;
        }
        if !wheel.modifiers.satisfies(config.wheel_modifier) {
            return None;
        }
        let factor = (-wheel.delta_y * config.wheel_zoom_speed).exp();
        Some(GestureAction::Zoom {
            factor,
            anchor_x: wheel.x,
            anchor_y: wheel.y,
        })
    }

    pub fn reset(&mut self) {
        self.pointers.clear();
        self.phase = GesturePhase::Idle;
    }
}

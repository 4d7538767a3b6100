//! Interactive binary mask painting: brush stamping over a `u8` mask, a
//! stroke history with checkpoints under a memory budget, pointer and gesture
//! classification, overlay rendering and off-thread mask jobs.
#![allow(clippy::too_many_arguments)]

pub mod logger;
pub mod canvas;
pub mod cli;
pub mod components;
pub mod error;
pub mod ops;
pub mod session;
pub mod settings;
pub mod viewport;

pub use canvas::{DirtyRect, MaskBuffer, MaskCanvas, OverlayStyle};
pub use components::brush::BrushMode;
pub use components::history::{HistoryConfig, HistoryManager, SnapshotPolicy, Stroke};
pub use session::MaskSession;
pub use settings::EditorSettings;
pub use viewport::{Viewport, ViewportTransform};

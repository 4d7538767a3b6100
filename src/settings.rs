use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::canvas::OverlayStyle;
use crate::components::brush::DEFAULT_SPACING;
use crate::components::history::{HistoryConfig, SnapshotPolicy};
use crate::components::input::{GestureConfig, WheelModifier};
use crate::error::SettingsError;
use crate::ops::tiles::TILE_SIZE;
use crate::viewport::ZoomLimits;

pub const MIN_BRUSH_SIZE: f32 = 1.0;
pub const MAX_BRUSH_SIZE: f32 = 500.0;

/// Editor tunables, persisted as a plain `key=value` file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EditorSettings {
    pub brush_size: f32,
    pub brush_spacing: f32,
    pub min_zoom: f64,
    pub max_zoom: f64,
    pub pan_padding: f64,
    pub pan_sensitivity: f64,
    pub wheel_zoom_speed: f64,
    pub wheel_modifier: WheelModifier,
    pub history_memory_mb: usize,
    pub checkpoint_interval: usize,
    pub min_strokes_retained: usize,
    pub snapshot_policy: SnapshotPolicy,
    pub tile_size: u32,
    pub overlay_color: [u8; 3],
    pub overlay_alpha: u8,
    pub use_worker: bool,
}

impl Default for EditorSettings {
    fn default() -> Self {
        Self {
            brush_size: 20.0,
            brush_spacing: DEFAULT_SPACING,
            min_zoom: 0.1,
            max_zoom: 10.0,
            pan_padding: 40.0,
            pan_sensitivity: 1.0,
            wheel_zoom_speed: 0.0015,
            wheel_modifier: WheelModifier::None,
            history_memory_mb: 64,
            checkpoint_interval: 10,
            min_strokes_retained: 50,
            snapshot_policy: SnapshotPolicy::Auto,
            tile_size: TILE_SIZE,
            overlay_color: [255, 0, 0],
            overlay_alpha: 128,
            use_worker: true,
        }
    }
}

impl EditorSettings {
    /// Path to the settings file.
    /// On Linux:   ~/.config/maskpaint/maskpaint_settings.cfg  (XDG_CONFIG_HOME respected)
    /// On Windows: %APPDATA%\MaskPaint\maskpaint_settings.cfg
    /// On macOS:   ~/Library/Application Support/MaskPaint/maskpaint_settings.cfg
    pub fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
                    PathBuf::from(home).join(".config")
                })
                .join("maskpaint");
            return Some(config_dir.join("maskpaint_settings.cfg"));
        }
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA").or_else(|_| std::env::var("USERPROFILE")).ok()?;
            return Some(PathBuf::from(appdata).join("MaskPaint").join("maskpaint_settings.cfg"));
        }
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
            return Some(
                PathBuf::from(home)
                    .join("Library")
                    .join("Application Support")
                    .join("MaskPaint")
                    .join("maskpaint_settings.cfg"),
            );
        }
        #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
        {
            std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|d| d.join("maskpaint_settings.cfg")))
        }
    }

    /// Load from the default location (defaults if missing or unreadable).
    pub fn load() -> Self {
        Self::settings_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    /// Save to the default location, creating its directory.
    pub fn save(&self) -> Result<(), SettingsError> {
        let Some(path) = Self::settings_path() else {
            return Ok(());
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        self.save_to(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        std::fs::write(path, self.to_kv_string())?;
        Ok(())
    }

    fn color_to_str(c: [u8; 3]) -> String {
        format!("{},{},{}", c[0], c[1], c[2])
    }

    /// Parse "r,g,b"
    fn str_to_color(s: &str) -> Option<[u8; 3]> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() == 3 {
            let r = parts[0].trim().parse::<u8>().ok()?;
            let g = parts[1].trim().parse::<u8>().ok()?;
            let b = parts[2].trim().parse::<u8>().ok()?;
            Some([r, g, b])
        } else {
            None
        }
    }

    /// Parse `key=value` lines.  Unknown keys, comments and malformed values
    /// are skipped, leaving the default in place.
    pub fn parse(content: &str) -> Self {
        let d = Self::default();
        let mut s = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else { continue };
            let val = val.trim();
            match key.trim() {
                "brush_size" => {
                    s.brush_size = val
                        .parse::<f32>()
                        .ok()
                        .filter(|v| v.is_finite())
                        .map_or(d.brush_size, |v| v.clamp(MIN_BRUSH_SIZE, MAX_BRUSH_SIZE));
                }
                "brush_spacing" => {
                    s.brush_spacing = val
                        .parse::<f32>()
                        .ok()
                        .filter(|v| v.is_finite())
                        .map_or(d.brush_spacing, |v| v.clamp(0.05, 2.0));
                }
                "min_zoom" => {
                    s.min_zoom = val.parse().ok().filter(|v: &f64| *v > 0.0).unwrap_or(d.min_zoom);
                }
                "max_zoom" => {
                    s.max_zoom = val.parse().ok().filter(|v: &f64| *v > 0.0).unwrap_or(d.max_zoom);
                }
                "pan_padding" => {
                    s.pan_padding = val.parse().ok().filter(|v: &f64| *v >= 0.0).unwrap_or(d.pan_padding);
                }
                "pan_sensitivity" => {
                    s.pan_sensitivity = val
                        .parse()
                        .ok()
                        .filter(|v: &f64| v.is_finite())
                        .unwrap_or(d.pan_sensitivity);
                }
                "wheel_zoom_speed" => {
                    s.wheel_zoom_speed = val
                        .parse()
                        .ok()
                        .filter(|v: &f64| v.is_finite())
                        .unwrap_or(d.wheel_zoom_speed);
                }
                "wheel_modifier" => {
                    s.wheel_modifier = WheelModifier::parse(val).unwrap_or(d.wheel_modifier);
                }
                "history_memory_mb" => {
                    s.history_memory_mb = val.parse().unwrap_or(d.history_memory_mb);
                }
                "checkpoint_interval" => {
                    s.checkpoint_interval = val.parse().unwrap_or(d.checkpoint_interval);
                }
                "min_strokes_retained" => {
                    s.min_strokes_retained = val.parse().unwrap_or(d.min_strokes_retained);
                }
                "snapshot_policy" => {
                    s.snapshot_policy = SnapshotPolicy::parse(val).unwrap_or(d.snapshot_policy);
                }
                "tile_size" => {
                    s.tile_size = val.parse().ok().filter(|v: &u32| *v > 0).unwrap_or(d.tile_size);
                }
                "overlay_color" => {
                    if let Some(c) = Self::str_to_color(val) {
                        s.overlay_color = c;
                    }
                }
                "overlay_alpha" => {
                    s.overlay_alpha = val.parse().unwrap_or(d.overlay_alpha);
                }
                "use_worker" => {
                    s.use_worker = val == "true";
                }
                _ => {}
            }
        }
        if s.min_zoom > s.max_zoom {
            s.min_zoom = d.min_zoom;
            s.max_zoom = d.max_zoom;
        }
        s
    }

    pub fn to_kv_string(&self) -> String {
        format!(
            "brush_size={}\n\
             brush_spacing={}\n\
             min_zoom={}\n\
             max_zoom={}\n\
             pan_padding={}\n\
             pan_sensitivity={}\n\
             wheel_zoom_speed={}\n\
             wheel_modifier={}\n\
             history_memory_mb={}\n\
             checkpoint_interval={}\n\
             min_strokes_retained={}\n\
             snapshot_policy={}\n\
             tile_size={}\n\
             overlay_color={}\n\
             overlay_alpha={}\n\
             use_worker={}\n",
            self.brush_size,
            self.brush_spacing,
            self.min_zoom,
            self.max_zoom,
            self.pan_padding,
            self.pan_sensitivity,
            self.wheel_zoom_speed,
            self.wheel_modifier.name(),
            self.history_memory_mb,
            self.checkpoint_interval,
            self.min_strokes_retained,
            self.snapshot_policy.name(),
            self.tile_size,
            Self::color_to_str(self.overlay_color),
            self.overlay_alpha,
            self.use_worker,
        )
    }

    pub fn history_config(&self) -> HistoryConfig {
        HistoryConfig {
            memory_budget_bytes: self.history_memory_mb.saturating_mul(1024 * 1024),
            min_strokes_retained: self.min_strokes_retained,
            checkpoint_interval: self.checkpoint_interval,
            snapshot_policy: self.snapshot_policy,
            tile_size: self.tile_size.max(1),
        }
    }

    /// Gesture tunables.  Single-pointer pan stays off: one finger paints.
    pub fn gesture_config(&self) -> GestureConfig {
        GestureConfig {
            pan_enabled: false,
            pan_sensitivity: self.pan_sensitivity,
            wheel_modifier: self.wheel_modifier,
            wheel_zoom_speed: self.wheel_zoom_speed,
        }
    }

    pub fn zoom_limits(&self) -> ZoomLimits {
        ZoomLimits {
            min: self.min_zoom,
            max: self.max_zoom,
        }
    }

    pub fn overlay_style(&self) -> OverlayStyle {
        OverlayStyle {
            color: self.overlay_color,
            alpha: self.overlay_alpha,
        }
    }
}

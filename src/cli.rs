// ============================================================================
// MaskPaint CLI - headless mask replay from a stroke script
// ============================================================================
//
// Usage examples:
//   maskpaint --size 512x512 --script strokes.txt --output mask.png
//   maskpaint --image photo.jpg --script strokes.txt --output mask.png --verbose
//   maskpaint --size 256x256 --script s.txt -o m.png --memory-mb 1 --no-worker
//
// Script format, one command per line (`#` starts a comment):
//   brush 24 paint          set brush size and mode (paint | erase)
//   stroke 10,10 80,40      draw a stroke through the listed image points
//   cancel 5,5 60,60        draw a stroke, then cancel it
//   undo / redo / clear / fill
//   zoom 1.5 100 100        zoom by a factor about a screen point
//   pan 20 -10              pan the viewport by screen pixels

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;

use crate::components::brush::BrushMode;
use crate::session::MaskSession;
use crate::settings::EditorSettings;

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// MaskPaint headless mask painter.
#[derive(Parser, Debug)]
#[command(
    name = "maskpaint",
    about = "Replay a stroke script onto a binary mask and save it as PNG",
    long_about = "Paint a binary mask without a GUI. The mask is sized from --size or\n\
                  from the dimensions of --image, the script's strokes are replayed\n\
                  through the same engine an interactive session uses, and the result\n\
                  is written as an 8-bit grayscale PNG (0 = clear, 255 = masked).\n\n\
                  Example:\n  \
                  maskpaint --size 512x512 --script strokes.txt --output mask.png"
)]
pub struct CliArgs {
    /// Mask size as WIDTHxHEIGHT (e.g. 640x480).
    #[arg(long, value_name = "WxH", conflicts_with = "image", required_unless_present = "image")]
    pub size: Option<String>,

    /// Image the mask is painted over; only its dimensions are used.
    #[arg(long, value_name = "FILE")]
    pub image: Option<PathBuf>,

    /// Stroke script to replay.
    #[arg(short, long, value_name = "FILE")]
    pub script: PathBuf,

    /// Output PNG path.
    #[arg(short, long, value_name = "FILE.png")]
    pub output: PathBuf,

    /// Settings file (key=value). Defaults are used when omitted.
    #[arg(long, value_name = "FILE")]
    pub settings: Option<PathBuf>,

    /// Override the history memory budget, in MB.
    #[arg(long, value_name = "MB")]
    pub memory_mb: Option<usize>,

    /// Extract checkpoints on the calling thread instead of the worker pool.
    #[arg(long)]
    pub no_worker: bool,

    /// Echo the session log to stderr and print a summary.
    #[arg(short, long)]
    pub verbose: bool,
}

// ============================================================================
// Script commands
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub enum ScriptCommand {
    Brush { size: f32, mode: BrushMode },
    Stroke(Vec<(f32, f32)>),
    Cancel(Vec<(f32, f32)>),
    Undo,
    Redo,
    Clear,
    Fill,
    Zoom { factor: f64, x: f64, y: f64 },
    Pan { dx: f64, dy: f64 },
}

fn parse_point(token: &str) -> Option<(f32, f32)> {
    let (x, y) = token.split_once(',')?;
    Some((x.trim().parse().ok()?, y.trim().parse().ok()?))
}

fn parse_points(tokens: &[&str], line_no: usize) -> Result<Vec<(f32, f32)>, String> {
    if tokens.is_empty() {
        return Err(format!("line {}: expected at least one x,y point", line_no));
    }
    tokens
        .iter()
        .map(|t| parse_point(t).ok_or_else(|| format!("line {}: bad point '{}'", line_no, t)))
        .collect()
}

fn parse_num<T: std::str::FromStr>(token: Option<&&str>, what: &str, line_no: usize) -> Result<T, String> {
    token
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| format!("line {}: expected {}", line_no, what))
}

/// Parse a whole script.  Errors name the offending line.
pub fn parse_script(source: &str) -> Result<Vec<ScriptCommand>, String> {
    let mut commands = Vec::new();
    for (idx, raw) in source.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let args = &tokens[1..];
        let command = match tokens[0].to_ascii_lowercase().as_str() {
            "brush" => {
                let size = parse_num(args.first(), "brush size", line_no)?;
                let mode = match args.get(1) {
                    Some(m) => BrushMode::parse(m).ok_or_else(|| format!("line {}: unknown mode '{}'", line_no, m))?,
                    None => BrushMode::Paint,
                };
                ScriptCommand::Brush { size, mode }
            }
            "stroke" => ScriptCommand::Stroke(parse_points(args, line_no)?),
            "cancel" => ScriptCommand::Cancel(parse_points(args, line_no)?),
            "undo" => ScriptCommand::Undo,
            "redo" => ScriptCommand::Redo,
            "clear" => ScriptCommand::Clear,
            "fill" => ScriptCommand::Fill,
            "zoom" => ScriptCommand::Zoom {
                factor: parse_num(args.first(), "zoom factor", line_no)?,
                x: parse_num(args.get(1), "anchor x", line_no)?,
                y: parse_num(args.get(2), "anchor y", line_no)?,
            },
            "pan" => ScriptCommand::Pan {
                dx: parse_num(args.first(), "dx", line_no)?,
                dy: parse_num(args.get(1), "dy", line_no)?,
            },
            other => return Err(format!("line {}: unknown command '{}'", line_no, other)),
        };
        commands.push(command);
    }
    Ok(commands)
}

/// Drive a session through parsed commands.
pub fn run_script(session: &mut MaskSession, commands: &[ScriptCommand]) -> Result<(), String> {
    for command in commands {
        match command {
            ScriptCommand::Brush { size, mode } => session.set_brush(*size, *mode),
            ScriptCommand::Stroke(points) | ScriptCommand::Cancel(points) => {
                let Some(&(x0, y0)) = points.first() else { continue };
                session.start_stroke(x0, y0).map_err(|e| e.to_string())?;
                for &(x, y) in &points[1..] {
                    session.continue_stroke(x, y).map_err(|e| e.to_string())?;
                }
                if matches!(command, ScriptCommand::Cancel(_)) {
                    session.cancel_stroke();
                } else {
                    session.end_stroke().map_err(|e| e.to_string())?;
                }
                session.poll_worker();
            }
            ScriptCommand::Undo => {
                session.undo();
            }
            ScriptCommand::Redo => {
                session.redo();
            }
            ScriptCommand::Clear => session.clear(),
            ScriptCommand::Fill => session.fill(),
            ScriptCommand::Zoom { factor, x, y } => {
                session.apply_gesture(crate::components::input::GestureAction::Zoom {
                    factor: *factor,
                    anchor_x: *x,
                    anchor_y: *y,
                });
            }
            ScriptCommand::Pan { dx, dy } => {
                session.apply_gesture(crate::components::input::GestureAction::Pan { dx: *dx, dy: *dy });
            }
        }
    }
    session.flush_worker();
    Ok(())
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run the CLI and return an OS exit code (`1` on any failure).
pub fn run(args: CliArgs) -> ExitCode {
    if args.verbose {
        crate::logger::set_echo(true);
    }
    let start = Instant::now();
    match run_inner(&args) {
        Ok(summary) => {
            if args.verbose {
                println!(
                    "{} → {} ({:.0}ms)",
                    summary,
                    args.output.display(),
                    start.elapsed().as_secs_f64() * 1000.0
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_inner(args: &CliArgs) -> Result<String, String> {
    let mut settings = match &args.settings {
        Some(path) => EditorSettings::load_from(path)
            .map_err(|e| format!("could not read settings '{}': {}", path.display(), e))?,
        None => EditorSettings::default(),
    };
    if let Some(mb) = args.memory_mb {
        settings.history_memory_mb = mb;
    }
    if args.no_worker {
        settings.use_worker = false;
    }

    let source = std::fs::read_to_string(&args.script)
        .map_err(|e| format!("could not read script '{}': {}", args.script.display(), e))?;
    let commands = parse_script(&source)?;

    let mut session = open_session(args, settings)?;
    run_script(&mut session, &commands)?;

    session
        .validate_history()
        .map_err(|e| format!("history integrity check failed: {}", e))?;
    if let Err(e) = session.validate_mask() {
        crate::log_warn!("{}", e);
    }

    save_mask(&session, &args.output)?;
    let history = session.history();
    Ok(format!(
        "{} command(s), {} stroke(s) in history, {} checkpoint(s), {} set px",
        commands.len(),
        history.len(),
        history.checkpoints().len(),
        session.mask().count_set()
    ))
}

fn open_session(args: &CliArgs, settings: EditorSettings) -> Result<MaskSession, String> {
    if let Some(path) = &args.image {
        let bytes = std::fs::read(path).map_err(|e| format!("could not read image '{}': {}", path.display(), e))?;
        let (w, h) = image::image_dimensions(path).map_err(|e| format!("load failed: {}", e))?;
        return MaskSession::load_image(&bytes, w as f64, h as f64, settings).map_err(|e| format!("load failed: {}", e));
    }
    let size = args.size.as_deref().unwrap_or("");
    let (w, h) = parse_size(size).ok_or_else(|| format!("invalid --size '{}', expected WxH", size))?;
    MaskSession::blank(w, h, w as f64, h as f64, settings).map_err(|e| format!("load failed: {}", e))
}

/// Parse `WIDTHxHEIGHT`.
pub fn parse_size(s: &str) -> Option<(u32, u32)> {
    let (w, h) = s.to_ascii_lowercase().split_once('x').map(|(a, b)| (a.to_string(), b.to_string()))?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

fn save_mask(session: &MaskSession, output: &Path) -> Result<(), String> {
    if let Some(dir) = output.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| format!("could not create '{}': {}", dir.display(), e))?;
    }
    session
        .export_mask_raster()
        .save_with_format(output, image::ImageFormat::Png)
        .map_err(|e| format!("save failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_script() {
        let cmds = parse_script(
            "# header\n\
             brush 12 erase\n\
             stroke 1,2 3.5,4\n\
             \n\
             cancel 0,0   # trailing comment\n\
             undo\nredo\nclear\nfill\n\
             zoom 2 10 20\n\
             pan -5 7\n",
        )
        .unwrap();
        assert_eq!(
            cmds,
            vec![
                ScriptCommand::Brush {
                    size: 12.0,
                    mode: BrushMode::Erase
                },
                ScriptCommand::Stroke(vec![(1.0, 2.0), (3.5, 4.0)]),
                ScriptCommand::Cancel(vec![(0.0, 0.0)]),
                ScriptCommand::Undo,
                ScriptCommand::Redo,
                ScriptCommand::Clear,
                ScriptCommand::Fill,
                ScriptCommand::Zoom {
                    factor: 2.0,
                    x: 10.0,
                    y: 20.0
                },
                ScriptCommand::Pan { dx: -5.0, dy: 7.0 },
            ]
        );
    }

    #[test]
    fn test_parse_errors_name_line() {
        assert_eq!(
            parse_script("undo\nsmudge 1").unwrap_err(),
            "line 2: unknown command 'smudge'"
        );
        assert!(parse_script("stroke 1;2").unwrap_err().starts_with("line 1"));
        assert!(parse_script("stroke").is_err());
        assert!(parse_script("brush big").is_err());
        assert!(parse_script("brush 3 smudge").is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("640x480"), Some((640, 480)));
        assert_eq!(parse_size("10X20"), Some((10, 20)));
        assert_eq!(parse_size("640"), None);
        assert_eq!(parse_size("ax3"), None);
    }

    #[test]
    fn test_run_script_on_session() {
        let settings = EditorSettings {
            use_worker: false,
            ..EditorSettings::default()
        };
        let mut session = MaskSession::blank(64, 64, 64.0, 64.0, settings).unwrap();
        let cmds = parse_script("brush 8 paint\nstroke 10,10 50,10\ncancel 10,40 50,40\nstroke 10,50\nundo").unwrap();
        run_script(&mut session, &cmds).unwrap();
        assert_eq!(session.history().len(), 2);
        assert_eq!(session.history().current_index(), 0);
        assert_eq!(session.mask().get(30, 10), Some(255));
        assert_eq!(session.mask().get(30, 40), Some(0));
        assert_eq!(session.mask().get(10, 50), Some(0));
    }
}
